//! The per-test execution context handed to test bodies.
//!
//! A [`TestContext`] lives for exactly one test. It gives the body access to
//! the suite log, the expected-fail flag, exit-hook registration, the
//! process supervisor and the sandbox manager. Processes tracked by the
//! context are finalized when it ends.

use crate::loader::LoadError;
use crate::outcome::{HookError, HookResult, HookRunner, RawOutcome, TestOutcome};
use crate::process::{self, ProcessError, ProcessHandle, StdioMode};
use crate::runner::{EffectiveConfig, TestUnit};
use crate::sandbox::{Layout, SandboxError, WorkArea};
use crate::suite::TestSuite;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Version string exposed when none was given.
pub const UNKNOWN_VERSION: &str = "unknown";

/// A callback run after the test body, able to replace the result.
pub type ExitHook = Box<dyn FnOnce(&mut TestContext<'_>, &TestOutcome) -> HookResult>;

/// The body of a test.
pub trait TestBody {
    fn run(&mut self, ctx: &mut TestContext<'_>) -> RawOutcome;
}

/// Turns a test directory into a runnable body.
pub trait ScriptEngine {
    fn load(&self, unit: &TestUnit) -> Result<Box<dyn TestBody>, LoadError>;
}

pub struct TestContext<'a> {
    suite: &'a mut TestSuite,
    config: &'a EffectiveConfig,
    name: String,
    expected_fail: bool,
    hooks: Vec<ExitHook>,
    processes: BTreeMap<String, ProcessHandle>,
    vars: HashMap<String, String>,
}

impl<'a> TestContext<'a> {
    pub fn new(suite: &'a mut TestSuite, config: &'a EffectiveConfig, name: &str) -> Self {
        let mut vars = HashMap::new();
        vars.insert("TEST_NAME".to_string(), name.to_string());
        vars.insert(
            "INSTALL_PATH".to_string(),
            suite.install_path().display().to_string(),
        );
        vars.insert(
            "VERSION".to_string(),
            suite.version().unwrap_or(UNKNOWN_VERSION).to_string(),
        );

        Self {
            suite,
            config,
            name: name.to_string(),
            expected_fail: false,
            hooks: Vec::new(),
            processes: BTreeMap::new(),
            vars,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write a line to the test log.
    pub fn log(&mut self, msg: &str) {
        self.suite.log(&self.name, msg);
    }

    /// Mark this test as expected to fail.
    pub fn expect_failure(&mut self) {
        self.expected_fail = true;
    }

    pub fn expected_fail(&self) -> bool {
        self.expected_fail
    }

    /// Register a hook to run after the body, in registration order.
    pub fn at_exit<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut TestContext<'_>, &TestOutcome) -> HookResult + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    pub fn install_path(&self) -> &Path {
        self.suite.install_path()
    }

    pub fn version(&self) -> &str {
        self.suite.version().unwrap_or(UNKNOWN_VERSION)
    }

    pub fn layout(&self) -> &Layout {
        &self.config.layout
    }

    /// Extra environment for spawned processes.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.config.env
    }

    pub fn locate(&self, name: &str) -> Result<PathBuf, ProcessError> {
        process::locate(name)
    }

    /// Spawn a process with the suite environment and finalizer grace.
    pub fn spawn(
        &self,
        name: &str,
        args: &[String],
        stdio: StdioMode,
    ) -> Result<ProcessHandle, ProcessError> {
        let handle = process::spawn_with_env(name, args, stdio, &self.config.env)?;
        Ok(handle.with_grace(self.config.finalizer_grace))
    }

    /// Hand a process to the context under `key`.
    ///
    /// A process already tracked under the same key is finalized.
    pub fn track(&mut self, key: impl Into<String>, handle: ProcessHandle) {
        self.processes.insert(key.into(), handle);
    }

    pub fn process_mut(&mut self, key: &str) -> Option<&mut ProcessHandle> {
        self.processes.get_mut(key)
    }

    pub fn untrack(&mut self, key: &str) -> Option<ProcessHandle> {
        self.processes.remove(key)
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// Derive a fresh work area, clear anything stale at its path and build it.
    pub fn new_work_area(&mut self) -> Result<WorkArea, SandboxError> {
        let area = WorkArea::derive(&self.config.work_area_root)?;
        area.clean()?;
        area.create(self.suite.install_path(), &self.config.layout)?;
        log::debug!("{}: work area ready at {}", self.name, area.path().display());
        Ok(area)
    }

    pub fn take_hooks(&mut self) -> Vec<ExitHook> {
        std::mem::take(&mut self.hooks)
    }

    /// End the test: finalize tracked processes and return the expected-fail flag.
    pub fn finish(mut self) -> bool {
        if !self.processes.is_empty() {
            log::debug!(
                "{}: finalizing {} tracked process(es)",
                self.name,
                self.processes.len()
            );
        }
        self.processes.clear();
        self.expected_fail
    }
}

impl HookRunner for TestContext<'_> {
    type Hook = ExitHook;

    fn call_hook(&mut self, hook: ExitHook, original: &TestOutcome) -> HookResult {
        hook(self, original)
    }

    fn hook_failed(&mut self, err: &HookError) {
        self.log(&format!("error running exit hook: {err}"));
    }
}
