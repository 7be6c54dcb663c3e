//! Script and configuration loader.
//!
//! Finds the script in a test directory and parses it, and reads the
//! optional suite configuration of a test root.

use crate::schema::{OutputMatch, Step, SuiteConfig, TestScript};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Error type for loading scripts and configuration.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML in {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid TOML in {}: {source}", .path.display())]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unsupported file format: {0} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat(String),
    #[error("no test script found in {} (expected one of {})", .0.display(), SCRIPT_FILENAMES.join(", "))]
    MissingScript(PathBuf),
    #[error("invalid script {}: {reason}", .path.display())]
    Invalid { path: PathBuf, reason: String },
}

/// Script file names looked up in a test directory, in order of preference.
pub const SCRIPT_FILENAMES: [&str; 3] = ["test.yaml", "test.yml", "test.toml"];

/// The name of the suite configuration file.
pub const SUITE_CONFIG_FILENAME: &str = "asttest.yaml";

/// Find the script in a test directory.
pub fn find_script(dir: &Path) -> Option<PathBuf> {
    SCRIPT_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Load the script of a test directory.
pub fn load_script_in(dir: &Path) -> Result<TestScript, LoadError> {
    let path = find_script(dir).ok_or_else(|| LoadError::MissingScript(dir.to_path_buf()))?;
    load_script(&path)
}

/// Load a test script from a file path.
pub fn load_script(path: &Path) -> Result<TestScript, LoadError> {
    let script: TestScript = parse_file(path)?;

    if script.steps.is_empty() {
        return Err(LoadError::Invalid {
            path: path.to_path_buf(),
            reason: "script has no steps".to_string(),
        });
    }
    validate_steps(&script.steps, false).map_err(|reason| LoadError::Invalid {
        path: path.to_path_buf(),
        reason,
    })?;

    Ok(script)
}

/// Check every step, including the steps of exit hooks.
///
/// Exit hooks cannot register further hooks; hooks run after the list has
/// been taken.
fn validate_steps(steps: &[Step], in_hook: bool) -> Result<(), String> {
    for (index, step) in steps.iter().enumerate() {
        let n = index + 1;
        if step.is_empty() {
            return Err(format!("step {n} has no action"));
        }

        for read in [&step.read_stdout, &step.read_stderr].into_iter().flatten() {
            if let Some(OutputMatch::Structured(rules)) = &read.expect
                && rules.is_empty()
            {
                return Err(format!(
                    "step {n}: output expectation for '{}' has no rules",
                    read.proc
                ));
            }
        }

        if let Some(hook) = &step.at_exit {
            if in_hook {
                return Err(format!("step {n}: at_exit is not allowed inside an exit hook"));
            }
            validate_steps(&hook.run, true).map_err(|reason| format!("step {n}: exit hook {reason}"))?;
        }
    }
    Ok(())
}

/// Load suite configuration from an explicit file.
pub fn load_suite_config(path: &Path) -> Result<SuiteConfig, LoadError> {
    parse_file(path)
}

/// Load suite configuration from a test root.
///
/// Looks for `asttest.yaml` in the given directory.
/// Returns `None` if the file doesn't exist, `Err` if it exists but is invalid.
pub fn load_suite_config_in(dir: &Path) -> Result<Option<SuiteConfig>, LoadError> {
    let config_path = dir.join(SUITE_CONFIG_FILENAME);

    if !config_path.exists() {
        return Ok(None);
    }

    load_suite_config(&config_path).map(Some)
}

fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|source| LoadError::Yaml {
            path: path.to_path_buf(),
            source,
        }),
        "toml" => toml::from_str(&contents).map_err(|source| LoadError::Toml {
            path: path.to_path_buf(),
            source,
        }),
        other => Err(LoadError::UnsupportedFormat(other.to_string())),
    }
}
