//! Schema definitions for asttest scripts and suite configuration.
//!
//! A test directory holds one script (`test.yaml`, `test.yml` or
//! `test.toml`) listing the steps of the test body. A test root may hold an
//! `asttest.yaml` with suite-wide settings.

use crate::outcome::ResultTable;
use crate::process::StdioMode;
use crate::sandbox::Layout;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Suite-level configuration loaded from `asttest.yaml` in the test root.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    /// Directory under which work areas are derived
    /// (default: `/tmp/asterisk-testsuite`).
    #[serde(default)]
    pub work_area_root: Option<PathBuf>,

    /// Which parts of the installation a work area mirrors, creates and links.
    #[serde(default)]
    pub layout: Option<Layout>,

    /// Environment variables added to every spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Milliseconds an abandoned process gets between SIGTERM and SIGKILL.
    #[serde(default)]
    pub finalizer_grace_ms: Option<u64>,
}

/// Root document for a test script.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TestScript {
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,

    /// The test body, run top to bottom.
    pub steps: Vec<Step>,
}

/// One step of a test body.
///
/// Each step is usually a single-key map where the key determines the
/// action. When several keys are given they run in the order listed here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Step {
    /// Write a line to the test log.
    #[serde(default)]
    pub log: Option<String>,

    /// Mark the test as expected to fail.
    #[serde(default)]
    pub xfail: Option<bool>,

    /// Pause for the given number of milliseconds.
    #[serde(default)]
    pub sleep: Option<u64>,

    /// Require an executable to be resolvable.
    #[serde(default)]
    pub exists: Option<ExistsStep>,

    /// Build a work area and bind its path to a variable.
    #[serde(default)]
    pub work_area: Option<WorkAreaStep>,

    /// Remove a work area created earlier, by name.
    #[serde(default)]
    pub clean_work_area: Option<String>,

    /// Start a process.
    #[serde(default)]
    pub spawn: Option<SpawnStep>,

    /// Write to a process's stdin.
    #[serde(default)]
    pub write_stdin: Option<WriteStdin>,

    /// Read a process's stdout to EOF.
    #[serde(default)]
    pub read_stdout: Option<ReadOutput>,

    /// Read a process's stderr to EOF.
    #[serde(default)]
    pub read_stderr: Option<ReadOutput>,

    /// Wait for a process to finish.
    #[serde(default)]
    pub wait: Option<WaitStep>,

    /// Send SIGTERM to a process, then wait for it.
    #[serde(default)]
    pub term: Option<WaitStep>,

    /// Send SIGKILL to a process and reap it.
    #[serde(default)]
    pub kill: Option<KillStep>,

    /// Register an exit hook.
    #[serde(default)]
    pub at_exit: Option<ExitHookSpec>,

    /// End the test with an explicit result.
    #[serde(default)]
    pub result: Option<ResultTable>,

    /// End the test by raising an error.
    #[serde(default)]
    pub raise: Option<String>,
}

impl Step {
    /// Whether the step names no action at all.
    pub fn is_empty(&self) -> bool {
        self.log.is_none()
            && self.xfail.is_none()
            && self.sleep.is_none()
            && self.exists.is_none()
            && self.work_area.is_none()
            && self.clean_work_area.is_none()
            && self.spawn.is_none()
            && self.write_stdin.is_none()
            && self.read_stdout.is_none()
            && self.read_stderr.is_none()
            && self.wait.is_none()
            && self.term.is_none()
            && self.kill.is_none()
            && self.at_exit.is_none()
            && self.result.is_none()
            && self.raise.is_none()
    }
}

/// Check that a command can be found.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExistsStep {
    /// Command name or path.
    pub cmd: String,

    /// Skip the test instead of failing it when the command is missing.
    #[serde(default)]
    pub skip_if_missing: bool,
}

/// Create a work area.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WorkAreaStep {
    /// Variable that receives the work area path.
    pub name: String,
}

/// Start a supervised process.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SpawnStep {
    /// Name later steps use to refer to this process.
    pub name: String,

    /// The command/binary to execute.
    pub cmd: String,

    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// `none` (default) or `piped`.
    #[serde(default)]
    pub stdio: StdioMode,
}

/// Write data to a piped process.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WriteStdin {
    /// Process name.
    pub proc: String,

    /// Text to write.
    pub data: String,

    /// Close stdin afterwards (default: false).
    #[serde(default)]
    pub close: bool,
}

/// Read an output stream of a piped process.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadOutput {
    /// Process name.
    pub proc: String,

    /// Expected content.
    #[serde(default)]
    pub expect: Option<OutputMatch>,
}

/// Wait for (or terminate) a process.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WaitStep {
    /// Process name.
    pub proc: String,

    /// Timeout in milliseconds; waits indefinitely when unset.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Expected outcome.
    #[serde(default)]
    pub expect: Option<ExpectStatus>,
}

/// Kill a process.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct KillStep {
    /// Process name.
    pub proc: String,

    /// Expected outcome.
    #[serde(default)]
    pub expect: Option<ExpectStatus>,
}

/// Expected result of a wait.
///
/// Every field that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExpectStatus {
    /// Expected exit code.
    #[serde(default)]
    pub exit: Option<i32>,

    /// Expected terminating signal (e.g. 9 for SIGKILL, 15 for SIGTERM).
    #[serde(default)]
    pub signal: Option<i32>,

    /// The process must have dumped core.
    #[serde(default)]
    pub core: bool,

    /// The wait must have timed out.
    #[serde(default)]
    pub timeout: bool,
}

/// An exit hook declared in a script.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExitHookSpec {
    /// Steps to run when the hook fires.
    #[serde(default)]
    pub run: Vec<Step>,

    /// Replacement result.
    #[serde(default)]
    pub result: Option<ResultTable>,

    /// Only replace the result when the original status is this word.
    #[serde(default)]
    pub when: Option<String>,
}

/// Matching rules for stdout/stderr.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OutputMatch {
    /// Exact string match.
    Exact(String),

    /// Structured match with multiple options.
    Structured(OutputMatchStructured),
}

/// Structured output matching with multiple match types.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OutputMatchStructured {
    /// Exact string match.
    #[serde(default)]
    pub equals: Option<String>,

    /// Substring match.
    #[serde(default)]
    pub contains: Option<String>,

    /// Regular expression match.
    #[serde(default)]
    pub regex: Option<String>,
}

impl OutputMatchStructured {
    /// Whether no matching rule is set.
    pub fn is_empty(&self) -> bool {
        self.equals.is_none() && self.contains.is_none() && self.regex.is_none()
    }
}

/// Generate the JSON Schema for test scripts.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(TestScript)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_script() {
        let yaml = r#"
steps:
  - log: "hello"
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(script.steps.len(), 1);
        assert_eq!(script.steps[0].log.as_deref(), Some("hello"));
        assert!(script.description.is_none());
    }

    #[test]
    fn test_parse_process_steps() {
        let yaml = r#"
description: sleeps and gets terminated
steps:
  - spawn: { name: p, cmd: sleep, args: ["2"] }
  - wait: { proc: p, timeout: 100, expect: { timeout: true } }
  - term: { proc: p, expect: { signal: 15 } }
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(script.steps.len(), 3);

        let spawn = script.steps[0].spawn.as_ref().unwrap();
        assert_eq!(spawn.cmd, "sleep");
        assert_eq!(spawn.args, vec!["2"]);
        assert_eq!(spawn.stdio, StdioMode::Null);

        let wait = script.steps[1].wait.as_ref().unwrap();
        assert_eq!(wait.timeout, Some(100));
        assert!(wait.expect.as_ref().unwrap().timeout);

        let term = script.steps[2].term.as_ref().unwrap();
        assert_eq!(term.expect.as_ref().unwrap().signal, Some(15));
    }

    #[test]
    fn test_parse_piped_stdio() {
        let yaml = r#"
steps:
  - spawn: { name: c, cmd: cat, stdio: piped }
  - write_stdin: { proc: c, data: "hi\n", close: true }
  - read_stdout: { proc: c, expect: "hi\n" }
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(script.steps[0].spawn.as_ref().unwrap().stdio, StdioMode::Piped);
        assert!(script.steps[1].write_stdin.as_ref().unwrap().close);
        match &script.steps[2].read_stdout.as_ref().unwrap().expect {
            Some(OutputMatch::Exact(s)) => assert_eq!(s, "hi\n"),
            _ => panic!("Expected exact match"),
        }
    }

    #[test]
    fn test_parse_structured_output_match() {
        let yaml = r#"
steps:
  - read_stderr:
      proc: c
      expect:
        contains: "warning"
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        match &script.steps[0].read_stderr.as_ref().unwrap().expect {
            Some(OutputMatch::Structured(s)) => {
                assert_eq!(s.contains, Some("warning".to_string()));
            }
            _ => panic!("Expected structured match"),
        }
    }

    #[test]
    fn test_parse_exit_hook_with_nested_steps() {
        let yaml = r#"
steps:
  - at_exit:
      run:
        - log: "cleaning up"
        - kill: { proc: p }
      result: { result: fail, reason: "leaked" }
      when: pass
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        let hook = script.steps[0].at_exit.as_ref().unwrap();
        assert_eq!(hook.run.len(), 2);
        assert_eq!(hook.when.as_deref(), Some("pass"));
        let result = hook.result.as_ref().unwrap();
        assert_eq!(result.result.as_deref(), Some("fail"));
        assert_eq!(result.reason.as_deref(), Some("leaked"));
    }

    #[test]
    fn test_result_without_status_parses() {
        let yaml = r#"
steps:
  - result: { reason: "no status" }
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        let result = script.steps[0].result.as_ref().unwrap();
        assert!(result.result.is_none());
    }

    #[test]
    fn test_unknown_step_is_rejected() {
        let yaml = r#"
steps:
  - launch: rockets
"#;
        assert!(serde_yaml::from_str::<TestScript>(yaml).is_err());
    }

    #[test]
    fn test_misspelled_output_match_is_rejected() {
        let yaml = r#"
steps:
  - read_stdout: { proc: e, expect: { contians: "never printed" } }
"#;
        assert!(serde_yaml::from_str::<TestScript>(yaml).is_err());
    }

    #[test]
    fn test_empty_output_match_has_no_rules() {
        let yaml = r#"
steps:
  - read_stdout: { proc: e, expect: {} }
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        match &script.steps[0].read_stdout.as_ref().unwrap().expect {
            Some(OutputMatch::Structured(s)) => assert!(s.is_empty()),
            _ => panic!("Expected structured match"),
        }
    }

    #[test]
    fn test_empty_step_detected() {
        assert!(Step::default().is_empty());
        let step = Step {
            raise: Some("x".into()),
            ..Step::default()
        };
        assert!(!step.is_empty());
    }

    #[test]
    fn test_parse_toml_script() {
        let toml_src = r#"
[[steps]]
xfail = true

[[steps]]
result = { result = "fail", reason = "known bug" }
"#;
        let script: TestScript = toml::from_str(toml_src).unwrap();
        assert_eq!(script.steps[0].xfail, Some(true));
        assert_eq!(
            script.steps[1].result.as_ref().unwrap().reason.as_deref(),
            Some("known bug")
        );
    }

    #[test]
    fn test_parse_suite_config() {
        let yaml = r#"
work_area_root: /var/tmp/ast
finalizer_grace_ms: 250
env:
  LANG: C
layout:
  mirror_dirs: [etc/asterisk]
  files: [usr/sbin/asterisk]
"#;
        let config: SuiteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.work_area_root, Some(PathBuf::from("/var/tmp/ast")));
        assert_eq!(config.finalizer_grace_ms, Some(250));
        assert_eq!(config.env.get("LANG"), Some(&"C".to_string()));
        let layout = config.layout.unwrap();
        assert_eq!(layout.mirror_dirs, vec![PathBuf::from("etc/asterisk")]);
        // Unlisted fields keep the default layout.
        assert_eq!(layout.create_dirs, Layout::default().create_dirs);
    }

    #[test]
    fn test_schema_names_every_step() {
        let schema = serde_json::to_value(generate_schema()).unwrap();
        let text = schema.to_string();
        for key in ["spawn", "write_stdin", "read_stdout", "term", "at_exit", "raise"] {
            assert!(text.contains(key), "schema is missing {key}");
        }
    }
}
