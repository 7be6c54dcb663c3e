//! Aggregate state for one suite run: counters, the test log and the
//! installation under test.

use crate::outcome::{self, Classification, TestOutcome};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Error type for suite setup.
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("error opening log file for writing ({}): {source}", .path.display())]
    OpenLog { path: PathBuf, source: io::Error },
    #[error("error determining the current working directory: {0}")]
    WorkingDir(io::Error),
}

/// Per-classification counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub pass: u32,
    pub fail: u32,
    pub xpass: u32,
    pub xfail: u32,
    pub skip: u32,
    pub error: u32,
    pub total: u32,
}

impl Counts {
    fn add(&mut self, classification: Classification) {
        let slot = match classification {
            Classification::Pass => &mut self.pass,
            Classification::Fail => &mut self.fail,
            Classification::XPass => &mut self.xpass,
            Classification::XFail => &mut self.xfail,
            Classification::Skip => &mut self.skip,
            Classification::Error => &mut self.error,
        };
        *slot += 1;
        self.total += 1;
    }

    /// `total` equals the sum of the per-classification counters.
    pub fn is_consistent(&self) -> bool {
        self.total == self.pass + self.fail + self.xpass + self.xfail + self.skip + self.error
    }
}

/// Whether the suite is running a directory of tests or a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Log to a file, prefixing each line with the test name.
    Batch,
    /// Log to standard output without prefixes.
    Single,
}

pub struct TestSuite {
    mode: Mode,
    log: Box<dyn Write>,
    install_path: PathBuf,
    version: Option<String>,
    counts: Counts,
}

impl TestSuite {
    /// Create a batch suite logging to `<dir>/<log_filename>`.
    ///
    /// The log file is truncated.
    pub fn batch(
        dir: &Path,
        log_filename: &str,
        install: &Path,
        version: Option<String>,
    ) -> Result<Self, SuiteError> {
        let path = dir.join(log_filename);
        let file = File::create(&path).map_err(|source| SuiteError::OpenLog { path, source })?;
        Self::with_sink(Mode::Batch, Box::new(file), install, version)
    }

    /// Create a single-test suite logging to standard output.
    pub fn single(install: &Path, version: Option<String>) -> Result<Self, SuiteError> {
        Self::with_sink(Mode::Single, Box::new(io::stdout()), install, version)
    }

    /// Create a suite writing its log to an arbitrary sink.
    pub fn with_sink(
        mode: Mode,
        log: Box<dyn Write>,
        install: &Path,
        version: Option<String>,
    ) -> Result<Self, SuiteError> {
        let install_path = if install.is_absolute() {
            install.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(SuiteError::WorkingDir)?
                .join(install)
        };

        Ok(Self {
            mode,
            log,
            install_path,
            version,
            counts: Counts::default(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn counts(&self) -> Counts {
        self.counts
    }

    /// Append one line to the test log and flush it.
    pub fn log(&mut self, test_name: &str, msg: &str) {
        let written = match self.mode {
            Mode::Batch => writeln!(self.log, "{test_name}: {msg}"),
            Mode::Single => writeln!(self.log, "{msg}"),
        }
        .and_then(|()| self.log.flush());

        if let Err(e) = written {
            log::warn!("error writing test log: {e}");
        }
    }

    /// Classify a finished test, log the verdict and update the counters.
    pub fn record(
        &mut self,
        test_name: &str,
        outcome: &TestOutcome,
        expected_fail: bool,
    ) -> Classification {
        if let Some(reason) = &outcome.reason {
            self.log(test_name, reason);
        }
        if let Some(anomaly) = &outcome.anomaly {
            self.log(test_name, &anomaly.to_string());
        }

        let classification = outcome::classify(outcome.status, expected_fail);
        self.counts.add(classification);
        self.log(test_name, classification.log_line());

        debug_assert!(self.counts.is_consistent());
        classification
    }

    /// Whether a batch run failed.
    ///
    /// Unexpected failures and passes always fail the run; errors do too
    /// unless `warn_on_error` is set.
    pub fn run_failed(&self, warn_on_error: bool) -> bool {
        self.counts.fail > 0 || self.counts.xpass > 0 || (self.counts.error > 0 && !warn_on_error)
    }

    /// The end-of-run summary.
    pub fn report(&self) -> String {
        let c = &self.counts;
        let mut out = String::new();
        let _ = writeln!(out, "Test results:");
        let _ = writeln!(out, "  tests passed:      {}", c.pass);
        let _ = writeln!(out, "  tests failed:      {}", c.fail);
        let _ = writeln!(out, "  unexpected passes: {}", c.xpass);
        let _ = writeln!(out, "  expected failures: {}", c.xfail);
        let _ = writeln!(out, "  tests skipped:     {}", c.skip);
        let _ = writeln!(out, "  test errors:       {}", c.error);
        let _ = writeln!(out);
        let _ = writeln!(out, "Total tests run:     {}", c.total);
        out
    }
}

impl std::fmt::Debug for TestSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestSuite")
            .field("mode", &self.mode)
            .field("install_path", &self.install_path)
            .field("version", &self.version)
            .field("counts", &self.counts)
            .finish_non_exhaustive()
    }
}
