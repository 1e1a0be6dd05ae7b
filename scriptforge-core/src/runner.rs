//! Local execution of generated scripts and archiving of their outputs.

use scriptforge_error::{Error, ErrorKind, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Run outputs moved into the archive after every attempt. Entries starting
/// with `*` match by suffix.
pub const ARCHIVE_ITEMS: &[&str] = &["ensemble", "ensemble.log", "libE_stats.txt", "*.npy", "*.pickle"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(RunFailure),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            RunOutcome::Succeeded => None,
            RunOutcome::Failed(failure) => Some(&failure.message),
        }
    }
}

/// Why a run did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    /// Exit code when the script ran to completion
    pub code: Option<i32>,
    pub stderr: String,
    /// Everything the fixer gets to see
    pub message: String,
}

impl RunFailure {
    /// A failure that never produced an exit code.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            stderr: String::new(),
            message: message.into(),
        }
    }

    pub fn exited(code: i32, stderr: &str, stdout: &str) -> Self {
        Self {
            code: Some(code),
            stderr: stderr.to_string(),
            message: format!("Return code {}\nStderr: {}\nStdout: {}", code, stderr, stdout),
        }
    }
}

/// Runs `<python> <script>` inside the output directory
#[derive(Debug, Clone)]
pub struct LocalRunner {
    python: String,
    timeout: Duration,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::from_env()
    }
}

impl LocalRunner {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Interpreter from `SCRIPTFORGE_PYTHON`, falling back to `python`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("SCRIPTFORGE_PYTHON").unwrap_or_else(|_| "python".to_string()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    /// Run the script and classify the result. Only a failure to launch the
    /// interpreter is an `Err`; script failures come back as `Failed`.
    pub async fn run(&self, dir: &Path, run_script: &str) -> Result<RunOutcome> {
        if !dir.join(run_script).is_file() {
            return Ok(RunOutcome::Failed(RunFailure::other(format!("{} not found", run_script))));
        }

        info!("running {} {} in {}", self.python, run_script, dir.display());
        let child = Command::new(&self.python)
            .arg(run_script)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::new(ErrorKind::ScriptFailed, format!("failed to start {}: {}", self.python, e))
                    .with_operation("runner::run")
                    .set_source(e)
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Ok(RunOutcome::Failed(RunFailure::other(format!(
                    "Timed out after {} seconds",
                    self.timeout.as_secs()
                ))))
            }
        };

        if output.status.success() {
            return Ok(RunOutcome::Succeeded);
        }

        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("{} exited with {}", run_script, code);
        Ok(RunOutcome::Failed(RunFailure::exited(code, &stderr, &stdout)))
    }
}

fn matches_item(name: &str, item: &str) -> bool {
    match item.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == item,
    }
}

/// Move run outputs into `dir/versions/<archive>/output/`, writing the error
/// next to them when there is one.
pub fn archive_run_outputs(dir: &Path, archive: &str, error: Option<&str>) -> Result<PathBuf> {
    let output_dir = dir.join("versions").join(archive).join("output");
    fs::create_dir_all(&output_dir)?;

    if let Some(error) = error.filter(|e| !e.is_empty()) {
        fs::write(output_dir.join("error.txt"), error)?;
    }

    let entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(item) = ARCHIVE_ITEMS.iter().find(|item| matches_item(&name, item)) else {
            continue;
        };
        // Globs only pick up files; exact names may also be directories
        if item.starts_with('*') && !entry.path().is_file() {
            continue;
        }
        fs::rename(entry.path(), output_dir.join(&name))?;
        debug!("archived {}", name);
    }

    Ok(output_dir)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[tokio::test]
    async fn test_successful_run() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "run_libe.py", "echo done\n");
        let outcome = LocalRunner::new("sh").run(dir.path(), "run_libe.py").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.error(), None);
    }

    #[tokio::test]
    async fn test_failed_run_reports_streams() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "run_libe.py", "echo partial\necho 'NameError: x' >&2\nexit 3\n");
        let outcome = LocalRunner::new("sh").run(dir.path(), "run_libe.py").await.unwrap();
        let RunOutcome::Failed(failure) = outcome else { panic!("expected failure") };
        assert_eq!(failure.code, Some(3));
        assert_eq!(failure.stderr, "NameError: x\n");
        assert_eq!(failure.message, "Return code 3\nStderr: NameError: x\n\nStdout: partial\n");
    }

    #[tokio::test]
    async fn test_missing_script() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = LocalRunner::new("sh").run(dir.path(), "run_libe.py").await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed(RunFailure::other("run_libe.py not found")));
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "run_libe.py", "sleep 5\n");
        let outcome = LocalRunner::new("sh")
            .with_timeout(Duration::from_millis(100))
            .run(dir.path(), "run_libe.py")
            .await
            .unwrap();
        assert!(outcome.error().unwrap().starts_with("Timed out"));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "run_libe.py", "");
        let err = LocalRunner::new("/no/such/python")
            .run(dir.path(), "run_libe.py")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScriptFailed);
    }

    #[test]
    fn test_archive_run_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("ensemble")).unwrap();
        write(&root.join("ensemble"), "sim0", "");
        write(root, "ensemble.log", "log");
        write(root, "libE_stats.txt", "stats");
        write(root, "run_libe_history.npy", "npy");
        write(root, "persis.pickle", "pickle");
        write(root, "run_libe.py", "keep me");

        let out = archive_run_outputs(root, "2_reviewed", Some("Return code 1")).unwrap();
        assert_eq!(out, root.join("versions/2_reviewed/output"));
        assert_eq!(fs::read_to_string(out.join("error.txt")).unwrap(), "Return code 1");
        assert!(out.join("ensemble/sim0").is_file());
        assert!(out.join("ensemble.log").is_file());
        assert!(out.join("libE_stats.txt").is_file());
        assert!(out.join("run_libe_history.npy").is_file());
        assert!(out.join("persis.pickle").is_file());
        assert!(root.join("run_libe.py").is_file());
        assert!(!root.join("ensemble.log").exists());
    }

    #[test]
    fn test_archive_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = archive_run_outputs(dir.path(), "1_reviewed", None).unwrap();
        assert!(out.is_dir());
        assert!(!out.join("error.txt").exists());
    }
}
