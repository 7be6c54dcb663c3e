//! Test outcomes and the result pipeline.
//!
//! A test body yields a [`RawOutcome`]. [`normalize`] turns it into a
//! [`TestOutcome`], [`run_exit_hooks`] gives registered hooks a chance to
//! replace it, and [`classify`] maps the final outcome plus the test's
//! expected-fail flag onto one of six [`Classification`]s.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Reason attached to raised values that are not strings.
pub const MISSING_RESULT_REASON: &str = "missing test result";

/// Status words a result table may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pass,
    Fail,
    Skip,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pass => "pass",
            Status::Fail => "fail",
            Status::Skip => "skip",
            Status::Error => "error",
        }
    }

    /// Parse a status word. Matching is exact.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(Status::Pass),
            "fail" => Some(Status::Fail),
            "skip" => Some(Status::Skip),
            "error" => Some(Status::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured result as produced by a test body or an exit hook.
///
/// The status is kept as a free-form string so that unrecognized words can
/// be reported verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResultTable {
    /// One of `pass`, `fail`, `skip` or `error`.
    #[serde(default)]
    pub result: Option<String>,

    /// Human-readable explanation, logged before the classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ResultTable {
    pub fn new(status: Status, reason: Option<String>) -> Self {
        Self {
            result: Some(status.as_str().to_string()),
            reason,
        }
    }
}

/// A value raised out of a test body instead of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Raised {
    Message(String),
    /// Something that is not a string; its content is not inspectable.
    Opaque,
}

impl Raised {
    /// Interpret a panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<String>() {
            Ok(msg) => Raised::Message(*msg),
            Err(payload) => match payload.downcast_ref::<&str>() {
                Some(msg) => Raised::Message((*msg).to_string()),
                None => Raised::Opaque,
            },
        }
    }
}

/// What a test body yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOutcome {
    Result(ResultTable),
    Raised(Raised),
    /// The body ran to completion without producing a result.
    Nothing,
}

/// A problem with the shape of a result, logged before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// The result table had no status field.
    MissingStatus,
    /// The status field held a word that is not a known status.
    UnknownStatus(String),
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::MissingStatus => f.write_str("error reading test result"),
            Anomaly::UnknownStatus(s) => write!(f, "unknown result '{s}'"),
        }
    }
}

/// A normalized test outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub status: Status,
    pub reason: Option<String>,
    /// Set when the status was coerced to `Error` because the result was malformed.
    pub anomaly: Option<Anomaly>,
}

impl TestOutcome {
    pub fn new(status: Status, reason: Option<String>) -> Self {
        Self {
            status,
            reason,
            anomaly: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(Status::Error, Some(reason.into()))
    }
}

/// Turn any raw outcome into a well-formed [`TestOutcome`].
pub fn normalize(raw: RawOutcome) -> TestOutcome {
    match raw {
        RawOutcome::Nothing => TestOutcome::new(Status::Pass, None),
        RawOutcome::Raised(Raised::Message(msg)) => TestOutcome::error(msg),
        RawOutcome::Raised(Raised::Opaque) => TestOutcome::error(MISSING_RESULT_REASON),
        RawOutcome::Result(table) => {
            let ResultTable { result, reason } = table;
            match result {
                None => TestOutcome {
                    status: Status::Error,
                    reason,
                    anomaly: Some(Anomaly::MissingStatus),
                },
                Some(word) => match Status::parse(&word) {
                    Some(status) => TestOutcome::new(status, reason),
                    None => TestOutcome {
                        status: Status::Error,
                        reason,
                        anomaly: Some(Anomaly::UnknownStatus(word)),
                    },
                },
            }
        }
    }
}

/// Error returned by an exit hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl From<Raised> for HookError {
    fn from(raised: Raised) -> Self {
        match raised {
            Raised::Message(msg) => HookError(msg),
            Raised::Opaque => HookError("exit hook raised a non-string value".to_string()),
        }
    }
}

/// What an exit hook returns: optionally a replacement result.
pub type HookResult = Result<Option<ResultTable>, HookError>;

/// Invokes exit hooks on behalf of [`run_exit_hooks`].
pub trait HookRunner {
    type Hook;

    /// Call one hook with the outcome the body produced.
    fn call_hook(&mut self, hook: Self::Hook, original: &TestOutcome) -> HookResult;

    /// Report a hook that returned an error or panicked.
    fn hook_failed(&mut self, err: &HookError);
}

/// Run `hooks` in order and return the final outcome.
///
/// Every hook sees `original`. The last hook to return a replacement wins;
/// failing hooks are reported and otherwise ignored.
pub fn run_exit_hooks<R: HookRunner>(
    runner: &mut R,
    hooks: Vec<R::Hook>,
    original: TestOutcome,
) -> TestOutcome {
    let mut replacement = None;

    for hook in hooks {
        let called = panic::catch_unwind(AssertUnwindSafe(|| runner.call_hook(hook, &original)));
        match called {
            Ok(Ok(Some(table))) => replacement = Some(table),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => runner.hook_failed(&e),
            Err(payload) => runner.hook_failed(&HookError::from(Raised::from_panic(payload))),
        }
    }

    match replacement {
        Some(table) => normalize(RawOutcome::Result(table)),
        None => original,
    }
}

/// Final verdict for one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Pass,
    Fail,
    XPass,
    XFail,
    Skip,
    Error,
}

impl Classification {
    /// The word printed on the progress line.
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Pass => "pass",
            Classification::Fail => "fail",
            Classification::XPass => "xpass",
            Classification::XFail => "xfail",
            Classification::Skip => "skip",
            Classification::Error => "error",
        }
    }

    /// The line written to the test log.
    pub fn log_line(self) -> &'static str {
        match self {
            Classification::Pass => "test passed",
            Classification::Fail => "test failed",
            Classification::XPass => "unexpected pass",
            Classification::XFail => "expected failure",
            Classification::Skip => "test skipped",
            Classification::Error => "error running test",
        }
    }

    /// Whether this verdict fails a single-test run.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Classification::Fail | Classification::XPass | Classification::Error
        )
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify(status: Status, expected_fail: bool) -> Classification {
    match (status, expected_fail) {
        (Status::Pass, false) => Classification::Pass,
        (Status::Pass, true) => Classification::XPass,
        (Status::Fail, false) => Classification::Fail,
        (Status::Fail, true) => Classification::XFail,
        (Status::Skip, _) => Classification::Skip,
        (Status::Error, _) => Classification::Error,
    }
}
