//! The built-in scripting runtime.
//!
//! [`YamlEngine`] loads the declarative script of a test directory and
//! [`ScriptRunner`] executes its steps against a [`TestContext`].

use crate::context::{ScriptEngine, TestBody, TestContext};
use crate::env;
use crate::loader::{self, LoadError};
use crate::outcome::{HookError, RawOutcome, Raised, ResultTable, Status};
use crate::process::{ProcessError, ProcessHandle, WaitOutcome};
use crate::runner::TestUnit;
use crate::sandbox::{self, SandboxError};
use crate::schema::{
    ExitHookSpec, ExpectStatus, OutputMatch, OutputMatchStructured, Step, TestScript,
};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// How a step stopped the body early.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The body produced a result (explicitly or through a failed expectation).
    #[error("finished with result {:?}", .0.result)]
    Finished(ResultTable),
    /// An error the script did not handle.
    #[error("{0}")]
    Raised(String),
}

impl From<ProcessError> for StepError {
    fn from(e: ProcessError) -> Self {
        StepError::Raised(e.to_string())
    }
}

impl From<SandboxError> for StepError {
    fn from(e: SandboxError) -> Self {
        StepError::Raised(e.to_string())
    }
}

fn fail(reason: String) -> StepError {
    StepError::Finished(ResultTable::new(Status::Fail, Some(reason)))
}

/// Loads `test.yaml` / `test.yml` / `test.toml` scripts.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlEngine;

impl ScriptEngine for YamlEngine {
    fn load(&self, unit: &TestUnit) -> Result<Box<dyn TestBody>, LoadError> {
        let script = loader::load_script_in(&unit.dir)?;
        Ok(Box::new(ScriptRunner::new(script)))
    }
}

/// Runs the steps of one script.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    script: TestScript,
}

impl ScriptRunner {
    pub fn new(script: TestScript) -> Self {
        Self { script }
    }
}

impl TestBody for ScriptRunner {
    fn run(&mut self, ctx: &mut TestContext<'_>) -> RawOutcome {
        match run_steps(ctx, &self.script.steps) {
            Ok(()) => RawOutcome::Nothing,
            Err(StepError::Finished(table)) => RawOutcome::Result(table),
            Err(StepError::Raised(msg)) => RawOutcome::Raised(Raised::Message(msg)),
        }
    }
}

pub fn run_steps(ctx: &mut TestContext<'_>, steps: &[Step]) -> Result<(), StepError> {
    for step in steps {
        run_step(ctx, step)?;
    }
    Ok(())
}

fn run_step(ctx: &mut TestContext<'_>, step: &Step) -> Result<(), StepError> {
    if let Some(msg) = &step.log {
        let msg = expand(ctx, msg)?;
        ctx.log(&msg);
    }

    if step.xfail == Some(true) {
        ctx.expect_failure();
    }

    if let Some(ms) = step.sleep {
        thread::sleep(Duration::from_millis(ms));
    }

    if let Some(exists) = &step.exists {
        let cmd = expand(ctx, &exists.cmd)?;
        match ctx.locate(&cmd) {
            Ok(path) => log::debug!("{}: '{cmd}' found at {}", ctx.name(), path.display()),
            Err(e) if exists.skip_if_missing => {
                return Err(StepError::Finished(ResultTable::new(
                    Status::Skip,
                    Some(e.to_string()),
                )));
            }
            Err(e) => return Err(fail(e.to_string())),
        }
    }

    if let Some(spec) = &step.work_area {
        let area = ctx.new_work_area()?;
        ctx.set_var(spec.name.clone(), area.path().display().to_string());
    }

    if let Some(name) = &step.clean_work_area {
        let path = ctx
            .var(name)
            .map(PathBuf::from)
            .ok_or_else(|| StepError::Raised(format!("unknown work area '{name}'")))?;
        sandbox::remove_work_area(&path)?;
    }

    if let Some(spawn) = &step.spawn {
        let cmd = expand(ctx, &spawn.cmd)?;
        let args = env::interpolate_all(&spawn.args, ctx.vars()).map_err(StepError::Raised)?;
        let handle = ctx.spawn(&cmd, &args, spawn.stdio)?;
        ctx.track(spawn.name.clone(), handle);
    }

    if let Some(write) = &step.write_stdin {
        let data = expand(ctx, &write.data)?;
        let handle = process(ctx, &write.proc)?;
        let stdin = handle
            .stdin()
            .ok_or_else(|| StepError::Raised(format!("stdin of '{}' is not open", write.proc)))?;
        stdin
            .write_all(data.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(|e| StepError::Raised(format!("error writing to '{}': {e}", write.proc)))?;
        if write.close {
            handle.close_stdin();
        }
    }

    if let Some(read) = &step.read_stdout {
        let handle = process(ctx, &read.proc)?;
        let output = match handle.take_stdout() {
            Some(mut stdout) => read_all(&mut stdout, &read.proc, "stdout")?,
            None => return Err(not_readable(&read.proc, "stdout")),
        };
        if let Some(matcher) = &read.expect {
            check_output_match(&format!("{} stdout", read.proc), &output, matcher).map_err(fail)?;
        }
    }

    if let Some(read) = &step.read_stderr {
        let handle = process(ctx, &read.proc)?;
        let output = match handle.take_stderr() {
            Some(mut stderr) => read_all(&mut stderr, &read.proc, "stderr")?,
            None => return Err(not_readable(&read.proc, "stderr")),
        };
        if let Some(matcher) = &read.expect {
            check_output_match(&format!("{} stderr", read.proc), &output, matcher).map_err(fail)?;
        }
    }

    if let Some(wait) = &step.wait {
        let outcome = process(ctx, &wait.proc)?.wait(wait.timeout.map(Duration::from_millis))?;
        check_status(&wait.proc, outcome, wait.expect.as_ref()).map_err(fail)?;
    }

    if let Some(term) = &step.term {
        let outcome =
            process(ctx, &term.proc)?.terminate(term.timeout.map(Duration::from_millis))?;
        check_status(&term.proc, outcome, term.expect.as_ref()).map_err(fail)?;
    }

    if let Some(kill) = &step.kill {
        let outcome = process(ctx, &kill.proc)?.kill()?;
        check_status(&kill.proc, outcome, kill.expect.as_ref()).map_err(fail)?;
    }

    if let Some(spec) = &step.at_exit {
        register_hook(ctx, spec.clone());
    }

    if let Some(table) = &step.result {
        return Err(StepError::Finished(expand_result(ctx, table)?));
    }

    if let Some(msg) = &step.raise {
        return Err(StepError::Raised(expand(ctx, msg)?));
    }

    Ok(())
}

/// Register a script-declared exit hook.
///
/// The hook runs its steps first; a step that finishes the body supplies
/// the replacement. Otherwise the declared result replaces the outcome when
/// `when` is unset or names the original status.
fn register_hook(ctx: &mut TestContext<'_>, spec: ExitHookSpec) {
    ctx.at_exit(move |ctx, original| {
        if spec.run.iter().any(|step| step.at_exit.is_some()) {
            return Err(HookError(
                "at_exit is not allowed inside an exit hook".to_string(),
            ));
        }
        match run_steps(ctx, &spec.run) {
            Ok(()) => {}
            Err(StepError::Finished(table)) => return Ok(Some(table)),
            Err(StepError::Raised(msg)) => return Err(HookError(msg)),
        }

        let applies = spec
            .when
            .as_deref()
            .is_none_or(|when| when == original.status.as_str());
        match &spec.result {
            Some(table) if applies => expand_result(ctx, table)
                .map(Some)
                .map_err(|e| HookError(e.to_string())),
            _ => Ok(None),
        }
    });
}

fn expand(ctx: &TestContext<'_>, s: &str) -> Result<String, StepError> {
    env::interpolate(s, ctx.vars()).map_err(StepError::Raised)
}

fn expand_result(ctx: &TestContext<'_>, table: &ResultTable) -> Result<ResultTable, StepError> {
    let reason = match &table.reason {
        Some(reason) => Some(expand(ctx, reason)?),
        None => None,
    };
    Ok(ResultTable {
        result: table.result.clone(),
        reason,
    })
}

fn process<'c>(
    ctx: &'c mut TestContext<'_>,
    name: &str,
) -> Result<&'c mut ProcessHandle, StepError> {
    ctx.process_mut(name)
        .ok_or_else(|| StepError::Raised(format!("no process named '{name}'")))
}

fn read_all(stream: &mut impl Read, proc: &str, which: &str) -> Result<String, StepError> {
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .map_err(|e| StepError::Raised(format!("error reading {which} of '{proc}': {e}")))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn not_readable(proc: &str, which: &str) -> StepError {
    StepError::Raised(format!("{which} of '{proc}' is not piped or was already read"))
}

fn check_status(
    proc: &str,
    actual: WaitOutcome,
    expect: Option<&ExpectStatus>,
) -> Result<(), String> {
    let Some(expect) = expect else {
        return Ok(());
    };

    let mismatch = |expected: String| Err(format!("{proc}: expected {expected}, got {actual}"));

    if expect.timeout != (actual == WaitOutcome::Timeout) {
        return mismatch(if expect.timeout {
            "timeout".to_string()
        } else {
            "the process to finish".to_string()
        });
    }
    if let Some(code) = expect.exit
        && actual != WaitOutcome::Exited(code)
    {
        return mismatch(WaitOutcome::Exited(code).to_string());
    }
    if let Some(sig) = expect.signal
        && actual != WaitOutcome::Signaled(sig)
    {
        return mismatch(WaitOutcome::Signaled(sig).to_string());
    }
    if expect.core && actual != WaitOutcome::CoreDumped {
        return mismatch(WaitOutcome::CoreDumped.to_string());
    }
    Ok(())
}

fn check_output_match(name: &str, actual: &str, matcher: &OutputMatch) -> Result<(), String> {
    match matcher {
        OutputMatch::Exact(expected) => {
            if actual != expected {
                Err(format!(
                    "{name}: expected exact match\n  expected: {expected:?}\n  got: {actual:?}"
                ))
            } else {
                Ok(())
            }
        }
        OutputMatch::Structured(s) if s.is_empty() => {
            Err(format!("{name}: output expectation has no rules"))
        }
        OutputMatch::Structured(s) => check_structured_match(name, actual, s),
    }
}

fn check_structured_match(
    name: &str,
    actual: &str,
    matcher: &OutputMatchStructured,
) -> Result<(), String> {
    if let Some(expected) = &matcher.equals
        && actual != expected
    {
        return Err(format!(
            "{name}: expected exact match\n  expected: {expected:?}\n  got: {actual:?}"
        ));
    }

    if let Some(substring) = &matcher.contains
        && !actual.contains(substring)
    {
        return Err(format!(
            "{name}: expected to contain {substring:?}\n  got: {actual:?}"
        ));
    }

    if let Some(pattern) = &matcher.regex {
        let re = regex::Regex::new(pattern)
            .map_err(|e| format!("{name}: invalid regex {pattern:?}: {e}"))?;
        if !re.is_match(actual) {
            return Err(format!(
                "{name}: expected to match regex {pattern:?}\n  got: {actual:?}"
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{self, TestOutcome};
    use crate::runner::EffectiveConfig;
    use crate::sandbox::Layout;
    use crate::suite::Mode;
    use crate::suite::tests::memory_suite;
    use std::path::Path;
    use tempfile::tempdir;

    fn script(yaml: &str) -> ScriptRunner {
        ScriptRunner::new(serde_yaml::from_str(yaml).unwrap())
    }

    /// Run a script body plus its exit hooks; returns the final outcome,
    /// the expected-fail flag and the test log.
    fn run_with(config: &EffectiveConfig, yaml: &str) -> (TestOutcome, bool, String) {
        let (mut suite, log) = memory_suite(Mode::Batch);
        let mut ctx = TestContext::new(&mut suite, config, "t");
        let raw = script(yaml).run(&mut ctx);
        let outcome = outcome::normalize(raw);
        let hooks = ctx.take_hooks();
        let outcome = outcome::run_exit_hooks(&mut ctx, hooks, outcome);
        let xfail = ctx.finish();
        (outcome, xfail, log.contents())
    }

    fn run(yaml: &str) -> (TestOutcome, bool, String) {
        run_with(&EffectiveConfig::default(), yaml)
    }

    #[test]
    fn test_no_result_is_a_pass() {
        let (outcome, xfail, log) = run("steps:\n  - log: \"hello ${TEST_NAME}\"\n");
        assert_eq!(outcome, TestOutcome::new(Status::Pass, None));
        assert!(!xfail);
        assert_eq!(log, "t: hello t\n");
    }

    #[test]
    fn test_explicit_result_stops_the_body() {
        let (outcome, _, log) = run(r#"
steps:
  - result: { result: fail, reason: "broken" }
  - log: "never"
"#);
        assert_eq!(outcome, TestOutcome::new(Status::Fail, Some("broken".into())));
        assert!(!log.contains("never"));
    }

    #[test]
    fn test_xfail_sets_the_flag() {
        let (outcome, xfail, _) = run(r#"
steps:
  - xfail: true
  - result: { result: fail }
"#);
        assert_eq!(outcome.status, Status::Fail);
        assert!(xfail);
    }

    #[test]
    fn test_raise_becomes_an_error_with_reason() {
        let (outcome, _, _) = run("steps:\n  - raise: \"kaput\"\n");
        assert_eq!(outcome, TestOutcome::error("kaput"));
    }

    #[test]
    fn test_unknown_process_is_raised() {
        let (outcome, _, _) = run("steps:\n  - wait: { proc: ghost }\n");
        assert_eq!(outcome.status, Status::Error);
        assert!(outcome.reason.unwrap().contains("no process named 'ghost'"));
    }

    #[test]
    fn test_missing_command_fails_or_skips() {
        let (outcome, _, _) = run("steps:\n  - exists: { cmd: no-such-cmd-asttest }\n");
        assert_eq!(outcome.status, Status::Fail);
        assert!(outcome.reason.unwrap().contains("no-such-cmd-asttest"));

        let (outcome, _, _) =
            run("steps:\n  - exists: { cmd: no-such-cmd-asttest, skip_if_missing: true }\n");
        assert_eq!(outcome.status, Status::Skip);

        let (outcome, _, _) = run("steps:\n  - exists: { cmd: ls }\n");
        assert_eq!(outcome.status, Status::Pass);
    }

    #[test]
    fn test_spawn_failure_is_raised() {
        let (outcome, _, _) =
            run("steps:\n  - spawn: { name: p, cmd: no-such-cmd-asttest }\n");
        assert_eq!(outcome.status, Status::Error);
        assert!(outcome.reason.unwrap().contains("no executable found"));
    }

    #[test]
    fn test_wait_timeout_then_terminate() {
        let (outcome, _, _) = run(r#"
steps:
  - spawn: { name: p, cmd: sleep, args: ["2"] }
  - wait: { proc: p, timeout: 100, expect: { timeout: true } }
  - term: { proc: p, expect: { signal: 15 } }
"#);
        assert_eq!(outcome, TestOutcome::new(Status::Pass, None));
    }

    #[test]
    fn test_wrong_exit_code_fails() {
        let (outcome, _, _) = run(r#"
steps:
  - spawn: { name: p, cmd: sh, args: ["-c", "exit 4"] }
  - wait: { proc: p, expect: { exit: 0 } }
"#);
        assert_eq!(outcome.status, Status::Fail);
        assert_eq!(
            outcome.reason.as_deref(),
            Some("p: expected exit code 0, got exit code 4")
        );
    }

    #[test]
    fn test_second_wait_is_raised() {
        let (outcome, _, _) = run(r#"
steps:
  - spawn: { name: p, cmd: "true" }
  - wait: { proc: p, expect: { exit: 0 } }
  - wait: { proc: p }
"#);
        assert_eq!(outcome, TestOutcome::error("no process"));
    }

    #[test]
    fn test_kill_reports_sigkill() {
        let (outcome, _, _) = run(r#"
steps:
  - spawn: { name: p, cmd: sleep, args: ["5"] }
  - kill: { proc: p, expect: { signal: 9 } }
"#);
        assert_eq!(outcome.status, Status::Pass);
    }

    #[test]
    fn test_piped_round_trip() {
        let (outcome, _, _) = run(r#"
steps:
  - spawn: { name: c, cmd: cat, stdio: piped }
  - write_stdin: { proc: c, data: "hello ${TEST_NAME}\n", close: true }
  - read_stdout: { proc: c, expect: { regex: "^hello t\n$" } }
  - wait: { proc: c, expect: { exit: 0 } }
"#);
        assert_eq!(outcome, TestOutcome::new(Status::Pass, None));
    }

    #[test]
    fn test_output_mismatch_fails() {
        let (outcome, _, _) = run(r#"
steps:
  - spawn: { name: e, cmd: sh, args: ["-c", "echo oops >&2"], stdio: piped }
  - read_stderr: { proc: e, expect: { contains: "fine" } }
"#);
        assert_eq!(outcome.status, Status::Fail);
        assert!(outcome.reason.unwrap().contains("e stderr: expected to contain"));
    }

    #[test]
    fn test_reading_a_closed_stream_is_raised() {
        let (outcome, _, _) = run(r#"
steps:
  - spawn: { name: p, cmd: "true" }
  - read_stdout: { proc: p }
"#);
        assert_eq!(outcome.status, Status::Error);
        assert!(outcome.reason.unwrap().contains("not piped"));
    }

    #[test]
    fn test_hook_replaces_result_when_status_matches() {
        let (outcome, _, log) = run(r#"
steps:
  - at_exit:
      run:
        - log: "cleanup saw the end"
      result: { result: skip, reason: "skipped by hook" }
      when: fail
  - result: { result: fail }
"#);
        assert_eq!(outcome, TestOutcome::new(Status::Skip, Some("skipped by hook".into())));
        assert!(log.contains("cleanup saw the end"));
    }

    #[test]
    fn test_hook_without_matching_status_keeps_result() {
        let (outcome, _, _) = run(r#"
steps:
  - at_exit:
      result: { result: fail }
      when: fail
"#);
        assert_eq!(outcome.status, Status::Pass);
    }

    #[test]
    fn test_failing_hook_is_logged_and_ignored() {
        let (outcome, _, log) = run(r#"
steps:
  - at_exit:
      run:
        - raise: "hook broke"
  - result: { result: pass }
"#);
        assert_eq!(outcome.status, Status::Pass);
        assert!(log.contains("t: error running exit hook: hook broke"));
    }

    #[test]
    fn test_nested_exit_hook_is_refused() {
        let (outcome, _, log) = run(r#"
steps:
  - at_exit:
      run:
        - log: "must not run"
        - at_exit: { result: { result: fail, reason: nested } }
"#);
        assert_eq!(outcome.status, Status::Pass);
        assert_eq!(
            log,
            "t: error running exit hook: at_exit is not allowed inside an exit hook\n"
        );
    }

    #[test]
    fn test_hook_can_reap_processes() {
        let (outcome, _, _) = run(r#"
steps:
  - spawn: { name: p, cmd: sleep, args: ["5"] }
  - at_exit:
      run:
        - kill: { proc: p, expect: { exit: 0 } }
"#);
        // The failed expectation inside the hook becomes the replacement.
        assert_eq!(outcome.status, Status::Fail);
        assert!(outcome.reason.unwrap().contains("expected exit code 0, got signal 9"));
    }

    #[test]
    fn test_work_area_is_built_and_cleaned() {
        let scratch = tempdir().unwrap();
        let config = EffectiveConfig {
            work_area_root: scratch.path().to_path_buf(),
            layout: Layout {
                mirror_dirs: vec![],
                create_dirs: vec![PathBuf::from("var/run/asterisk")],
                files: vec![],
            },
            ..EffectiveConfig::default()
        };

        let (outcome, _, log) = run_with(
            &config,
            r#"
steps:
  - work_area: { name: ast }
  - log: "area ${ast}"
"#,
        );
        assert_eq!(outcome.status, Status::Pass);
        let path = log.trim_end().trim_start_matches("t: area ");
        assert!(Path::new(path).starts_with(scratch.path()));
        assert!(Path::new(path).join("var/run/asterisk").is_dir());

        let (outcome, _, _) = run_with(
            &config,
            r#"
steps:
  - work_area: { name: ast }
  - clean_work_area: ast
"#,
        );
        assert_eq!(outcome.status, Status::Pass);
    }

    #[test]
    fn test_missing_reference_dir_is_an_error_with_os_text() {
        let scratch = tempdir().unwrap();
        let config = EffectiveConfig {
            work_area_root: scratch.path().to_path_buf(),
            layout: Layout {
                mirror_dirs: vec![PathBuf::from("asttest-missing-reference/etc")],
                create_dirs: vec![],
                files: vec![],
            },
            ..EffectiveConfig::default()
        };

        let (outcome, _, _) = run_with(
            &config,
            r#"
steps:
  - work_area: { name: ast }
  - log: "unreachable"
"#,
        );
        assert_eq!(outcome.status, Status::Error);
        let reason = outcome.reason.unwrap();
        assert!(
            reason.contains("error opening dir '/opt/ast/asttest-missing-reference/etc'"),
            "got: {reason}"
        );
        assert!(reason.contains(&std::io::Error::from_raw_os_error(2).to_string()), "got: {reason}");
    }

    #[test]
    fn test_cleaning_an_unknown_work_area_is_raised() {
        let (outcome, _, _) = run("steps:\n  - clean_work_area: nope\n");
        assert_eq!(outcome, TestOutcome::error("unknown work area 'nope'"));
    }

    #[test]
    fn test_undefined_variable_is_raised() {
        let (outcome, _, _) = run("steps:\n  - log: \"${ASTTEST_UNDEFINED_VAR_XYZ}\"\n");
        assert_eq!(outcome.status, Status::Error);
        assert!(outcome.reason.unwrap().contains("ASTTEST_UNDEFINED_VAR_XYZ"));
    }

    // ==================== output matching ====================

    #[test]
    fn test_exact_match() {
        let m = OutputMatch::Exact("hi\n".into());
        assert!(check_output_match("out", "hi\n", &m).is_ok());
        assert!(check_output_match("out", "hi", &m).is_err());
    }

    #[test]
    fn test_structured_match_checks_every_rule() {
        let m = OutputMatch::Structured(OutputMatchStructured {
            equals: None,
            contains: Some("ready".into()),
            regex: Some(r"^\d+ ready$".into()),
        });
        assert!(check_output_match("out", "3 ready", &m).is_ok());
        assert!(check_output_match("out", "ready", &m).is_err());
    }

    #[test]
    fn test_structured_match_without_rules_fails() {
        let m = OutputMatch::Structured(OutputMatchStructured::default());
        let err = check_output_match("out", "anything", &m).unwrap_err();
        assert!(err.contains("has no rules"));
    }

    #[test]
    fn test_invalid_regex_is_reported() {
        let m = OutputMatch::Structured(OutputMatchStructured {
            regex: Some("(".into()),
            ..OutputMatchStructured::default()
        });
        let err = check_output_match("out", "x", &m).unwrap_err();
        assert!(err.contains("invalid regex"));
    }

    #[test]
    fn test_status_expectations() {
        let expect = ExpectStatus {
            signal: Some(15),
            ..ExpectStatus::default()
        };
        assert!(check_status("p", WaitOutcome::Signaled(15), Some(&expect)).is_ok());
        assert!(check_status("p", WaitOutcome::Exited(0), Some(&expect)).is_err());
        assert!(check_status("p", WaitOutcome::Timeout, Some(&expect)).is_err());
        assert!(check_status("p", WaitOutcome::Timeout, None).is_ok());

        let core = ExpectStatus {
            core: true,
            ..ExpectStatus::default()
        };
        assert!(check_status("p", WaitOutcome::CoreDumped, Some(&core)).is_ok());
        assert!(check_status("p", WaitOutcome::Signaled(11), Some(&core)).is_err());
    }
}
