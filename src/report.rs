//! JSON documents printed by each subcommand.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::debug::TrialOutcome;
use crate::error::RunError;
use crate::ir::{MethodRef, TestCase};
use crate::resolver::{Disable, TestMapping};

/// Chosen target; the flattened method doubles as a `--target` document.
#[derive(Debug, Serialize)]
pub(crate) struct SelectionReport {
    #[serde(flatten)]
    pub(crate) target: MethodRef,
    pub(crate) score: u64,
    pub(crate) candidates: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct VerifierFallback {
    pub(crate) first: String,
    pub(crate) second: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct InstrumentReport {
    /// Method as found in its defining class.
    #[serde(flatten)]
    pub(crate) target: MethodRef,
    pub(crate) requested: MethodRef,
    pub(crate) rewritten: Vec<String>,
    pub(crate) verifier_fallbacks: Vec<VerifierFallback>,
    pub(crate) output: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct CurationReport {
    pub(crate) disabled: Disable,
    pub(crate) kept: Vec<TestCase>,
    pub(crate) excluded: TestMapping,
    pub(crate) excluded_classes: Vec<String>,
    pub(crate) passes: usize,
    pub(crate) rewritten: Vec<String>,
    pub(crate) output: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct DebugReport {
    pub(crate) target: MethodRef,
    pub(crate) tests: Vec<String>,
    pub(crate) succeeded: usize,
    pub(crate) failed: usize,
    /// Trials that succeeded on the unprotected build only; absent without a baseline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) blocked: Option<usize>,
    pub(crate) trials: Vec<TrialOutcome>,
}

impl DebugReport {
    pub(crate) fn new(target: MethodRef, tests: &[TestCase], trials: Vec<TrialOutcome>) -> Self {
        let succeeded = trials.iter().filter(|trial| trial.success).count();
        let blocked = trials
            .iter()
            .any(|trial| trial.baseline.is_some())
            .then(|| trials.iter().filter(|trial| trial.blocked()).count());
        Self {
            target,
            tests: tests.iter().map(TestCase::display_name).collect(),
            succeeded,
            failed: trials.len() - succeeded,
            blocked,
            trials,
        }
    }
}

/// Read a JSON input file; malformed documents are illegal input.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut deserializer = serde_json::Deserializer::from_str(&json);
    let value = serde_path_to_error::deserialize(&mut deserializer).map_err(|err| {
        RunError::IllegalInput(format!(
            "{} at {}: {}",
            path.display(),
            err.path(),
            err.inner()
        ))
    })?;
    Ok(value)
}

/// Pretty-print `value` to the output path, or stdout for `-` or no path.
pub(crate) fn write_json<T: Serialize>(output: Option<&Path>, value: &T) -> Result<()> {
    let mut writer = output_writer(output)?;
    serde_json::to_writer_pretty(&mut writer, value).context("failed to serialize report")?;
    writer
        .write_all(b"\n")
        .context("failed to write report")?;
    writer.flush().context("failed to flush report")
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}
