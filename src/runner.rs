//! Test suite controller.
//!
//! Discovers test directories under a root, runs each one through a
//! [`ScriptEngine`] and the result pipeline, and reports the aggregate.

use crate::context::{ScriptEngine, TestContext};
use crate::loader::{self, LoadError};
use crate::outcome::{self, Classification, RawOutcome, Raised, Status, TestOutcome};
use crate::process::DEFAULT_FINALIZER_GRACE;
use crate::sandbox::{DEFAULT_WORK_AREA_ROOT, Layout};
use crate::schema::SuiteConfig;
use crate::suite::{SuiteError, TestSuite};
use std::collections::HashMap;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log file created in every test root unless another name is given.
pub const DEFAULT_LOG_FILENAME: &str = "asttest.log";

/// Installation path used unless another one is given.
pub const DEFAULT_INSTALL_PATH: &str = "asterisk";

/// Error type for suite-level failures.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("error opening path '{}': {source}", .path.display())]
    ReadRoot { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Suite(#[from] SuiteError),
    #[error("error loading suite config: {0}")]
    Config(#[from] LoadError),
}

/// One test: a name and the directory holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUnit {
    pub name: String,
    pub dir: PathBuf,
}

impl TestUnit {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }
}

/// Options shared by every root of one invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub log_filename: String,
    pub install_path: PathBuf,
    pub version: Option<String>,
    /// Print a warning instead of failing the run when tests errored.
    pub warn_on_error: bool,
    /// Suite configuration given explicitly; overrides `asttest.yaml` in a root.
    pub config: Option<SuiteConfig>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            log_filename: DEFAULT_LOG_FILENAME.to_string(),
            install_path: PathBuf::from(DEFAULT_INSTALL_PATH),
            version: None,
            warn_on_error: false,
            config: None,
        }
    }
}

/// Effective configuration for running tests, with defaults filled in.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub work_area_root: PathBuf,
    pub layout: Layout,
    /// Additional environment variables for spawned processes.
    pub env: HashMap<String, String>,
    pub finalizer_grace: Duration,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            work_area_root: PathBuf::from(DEFAULT_WORK_AREA_ROOT),
            layout: Layout::default(),
            env: HashMap::new(),
            finalizer_grace: DEFAULT_FINALIZER_GRACE,
        }
    }
}

impl EffectiveConfig {
    /// Create from optional suite config.
    pub fn from_suite(suite: Option<&SuiteConfig>) -> Self {
        let defaults = Self::default();
        match suite {
            Some(cfg) => Self {
                work_area_root: cfg
                    .work_area_root
                    .clone()
                    .unwrap_or(defaults.work_area_root),
                layout: cfg.layout.clone().unwrap_or(defaults.layout),
                env: cfg.env.clone(),
                finalizer_grace: cfg
                    .finalizer_grace_ms
                    .map_or(defaults.finalizer_grace, Duration::from_millis),
            },
            None => defaults,
        }
    }
}

/// List the tests under `root`, sorted by name.
///
/// Every immediate subdirectory is a test, except names starting with `.`.
/// Symlinks are not followed.
pub fn discover_tests(root: &Path) -> Result<Vec<TestUnit>, RunError> {
    let read_err = |source| RunError::ReadRoot {
        path: root.to_path_buf(),
        source,
    };
    let base = std::path::absolute(root).map_err(read_err)?;

    let mut tests = Vec::new();
    for entry in std::fs::read_dir(&base).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().map_err(read_err)?.is_dir() {
            tests.push(TestUnit::new(name, entry.path()));
        }
    }
    tests.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tests)
}

/// Changes the working directory and changes it back.
struct DirGuard {
    original: Option<PathBuf>,
}

impl DirGuard {
    fn enter(dir: &Path) -> io::Result<Self> {
        let original = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self {
            original: Some(original),
        })
    }

    fn restore(mut self) -> io::Result<()> {
        match self.original.take() {
            Some(dir) => std::env::set_current_dir(dir),
            None => Ok(()),
        }
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.original.take() {
            let _ = std::env::set_current_dir(dir);
        }
    }
}

/// Run one test and record its classification in `suite`.
///
/// The body and its exit hooks run with the test directory as the working
/// directory.
pub fn run_test(
    suite: &mut TestSuite,
    engine: &dyn ScriptEngine,
    config: &EffectiveConfig,
    unit: &TestUnit,
) -> Classification {
    let name = unit.name.as_str();

    let guard = match DirGuard::enter(&unit.dir) {
        Ok(guard) => guard,
        Err(e) => {
            suite.log(name, &format!("error changing to test dir: {e}"));
            return suite.record(name, &TestOutcome::new(Status::Error, None), false);
        }
    };

    let mut ctx = TestContext::new(suite, config, name);
    let raw = match engine.load(unit) {
        Ok(mut body) => panic::catch_unwind(AssertUnwindSafe(|| body.run(&mut ctx)))
            .unwrap_or_else(|payload| RawOutcome::Raised(Raised::from_panic(payload))),
        Err(e) => RawOutcome::Raised(Raised::Message(e.to_string())),
    };

    let normalized = outcome::normalize(raw);
    let hooks = ctx.take_hooks();
    let final_outcome = outcome::run_exit_hooks(&mut ctx, hooks, normalized);
    let expected_fail = ctx.finish();

    let classification = suite.record(name, &final_outcome, expected_fail);

    if let Err(e) = guard.restore() {
        suite.log(
            name,
            &format!("error changing directories, this may cause further errors ({e})"),
        );
    }
    classification
}

/// Progress line prefix: running index and padded test name.
fn progress_prefix(index: u32, name: &str) -> String {
    format!("{:<4}{:<31}", format!("{index}."), format!(" {name} "))
}

fn suite_config(opts: &RunOptions, root: &Path) -> Result<EffectiveConfig, RunError> {
    let config = match &opts.config {
        Some(config) => Some(config.clone()),
        None => loader::load_suite_config_in(root)?,
    };
    Ok(EffectiveConfig::from_suite(config.as_ref()))
}

/// Run every test under `root`, printing progress and the final report.
///
/// Returns whether the run failed.
pub fn process_test_dir(
    root: &Path,
    opts: &RunOptions,
    engine: &dyn ScriptEngine,
) -> Result<bool, RunError> {
    println!("Processing tests in '{}':", root.display());

    let tests = discover_tests(root)?;
    let config = suite_config(opts, root)?;
    let mut suite = TestSuite::batch(
        root,
        &opts.log_filename,
        &opts.install_path,
        opts.version.clone(),
    )?;

    for unit in &tests {
        print!("{}", progress_prefix(suite.counts().total + 1, &unit.name));
        let _ = io::stdout().flush();

        let classification = run_test(&mut suite, engine, &config, unit);
        println!("{classification}");
    }

    println!();
    print!("{}", suite.report());

    let counts = suite.counts();
    log::debug!("finished '{}': {counts:?}", root.display());
    if opts.warn_on_error && counts.error > 0 {
        println!("\n***WARNING: some tests failed to run, see log for details");
    }

    Ok(suite.run_failed(opts.warn_on_error))
}

/// Run a single test directory, logging to standard output.
///
/// Returns whether the test failed, errored or passed unexpectedly.
pub fn process_single_test(
    dir: &Path,
    opts: &RunOptions,
    engine: &dyn ScriptEngine,
) -> Result<bool, RunError> {
    let mut suite = TestSuite::single(&opts.install_path, opts.version.clone())?;

    let abs = std::path::absolute(dir).map_err(|source| RunError::ReadRoot {
        path: dir.to_path_buf(),
        source,
    })?;
    let root = abs.parent().unwrap_or(abs.as_path());
    let config = suite_config(opts, root)?;

    let unit = TestUnit::new(dir.display().to_string(), abs.clone());
    let classification = run_test(&mut suite, engine, &config, &unit);
    Ok(classification.is_failure())
}
