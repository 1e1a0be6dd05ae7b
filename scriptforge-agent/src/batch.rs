//! Batch agents: run the inner agent locally or as a PBS job, and chain
//! jobs into multi-stage workflows.

use scriptforge_core::pbs::{self, JobConfig, PbsClient, PbsSettings};
use scriptforge_error::{Error, ErrorKind, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

pub const JOB_SCRIPT: &str = "run_job.pbs";
pub const JOB_OUTPUT: &str = "job_output.txt";
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Success,
    Failed,
    Error,
    SubmitFailed,
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Failed => "failed",
            BatchStatus::Error => "error",
            BatchStatus::SubmitFailed => "submit_failed",
            BatchStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one `run_agent_test`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub status: BatchStatus,
    pub message: Option<String>,
    pub returncode: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub job_id: Option<String>,
    /// Contents of `job_output.txt` for PBS jobs
    pub output: Option<String>,
}

impl BatchResult {
    fn new(status: BatchStatus) -> Self {
        Self {
            status,
            message: None,
            returncode: None,
            stdout: None,
            stderr: None,
            job_id: None,
            output: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            message: Some(message),
            ..Self::new(BatchStatus::Error)
        }
    }
}

/// One finished job, in submission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_type: String,
    pub nodes: u32,
    /// Known for local runs only
    pub success: Option<bool>,
    pub job_id: Option<String>,
}

pub type JobHistory = Vec<JobRecord>;

/// The command the batch agent runs, e.g. `scriptforge generate`
#[derive(Debug, Clone)]
pub struct InnerAgent {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory for local runs and job submission
    pub workdir: PathBuf,
    /// Passed as `--scripts`; relative paths resolve against `workdir`
    pub scripts_dir: PathBuf,
}

impl InnerAgent {
    fn full_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--scripts".to_string());
        args.push(self.scripts_dir.display().to_string());
        args
    }

    /// Shell form used inside the PBS script
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.full_args())
            .map(|a| shell_quote(&a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Bare program names are looked up on PATH, so only paths are checked.
    fn program_missing(&self) -> bool {
        self.program.components().count() > 1 && !self.program.exists()
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Submits and tracks runs of the inner agent
pub struct BatchJobAgent {
    inner: InnerAgent,
    pbs: PbsSettings,
    client: PbsClient,
    api_key: Option<String>,
    remote: bool,
    poll_interval: Duration,
    history: JobHistory,
}

impl BatchJobAgent {
    pub fn new(inner: InnerAgent, pbs: PbsSettings, api_key: Option<String>) -> Self {
        Self {
            inner,
            pbs,
            client: PbsClient::from_env(),
            api_key,
            remote: pbs::is_remote_environment(),
            poll_interval: POLL_INTERVAL,
            history: Vec::new(),
        }
    }

    pub fn with_client(mut self, client: PbsClient) -> Self {
        self.client = client;
        self
    }

    /// Force PBS submission on or off instead of detecting it.
    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn pbs(&self) -> &PbsSettings {
        &self.pbs
    }

    pub fn job_history(&self) -> &JobHistory {
        &self.history
    }

    pub async fn run_agent_test(&mut self, config: JobConfig) -> Result<BatchResult> {
        if self.remote {
            self.run_batch_job(config).await
        } else {
            self.run_local(config).await
        }
    }

    async fn run_local(&mut self, config: JobConfig) -> Result<BatchResult> {
        info!("Running locally: {} with {} nodes", config.job_type, config.nodes);

        if self.inner.program_missing() {
            return Ok(BatchResult::error(format!(
                "Agent script not found: {}",
                self.inner.program.display()
            )));
        }
        let scripts_dir = self.inner.workdir.join(&self.inner.scripts_dir);
        if !scripts_dir.is_dir() {
            return Ok(BatchResult::error(format!(
                "Test scripts not found: {}",
                scripts_dir.display()
            )));
        }

        let mut command = Command::new(&self.inner.program);
        command
            .args(self.inner.full_args())
            .current_dir(&self.inner.workdir)
            .stdin(Stdio::null());
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            command.env("OPENAI_API_KEY", key);
        }
        info!("Executing: {}", self.inner.command_line());

        let output = command.output().await.map_err(|e| {
            Error::new(ErrorKind::ScriptFailed, format!("failed to start inner agent: {}", e))
                .with_operation("batch::run_local")
                .set_source(e)
        })?;

        let success = output.status.success();
        self.history.push(JobRecord {
            job_type: config.job_type,
            nodes: config.nodes,
            success: Some(success),
            job_id: None,
        });

        Ok(BatchResult {
            returncode: Some(output.status.code().unwrap_or(-1)),
            stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
            ..BatchResult::new(if success {
                BatchStatus::Success
            } else {
                BatchStatus::Failed
            })
        })
    }

    async fn run_batch_job(&mut self, config: JobConfig) -> Result<BatchResult> {
        info!("Submitting batch job: {} with {} nodes", config.job_type, config.nodes);

        let script = pbs::render_script(
            &config,
            &self.pbs,
            self.api_key.as_deref(),
            &self.inner.command_line(),
        );
        let script_path = self.inner.workdir.join(JOB_SCRIPT);
        tokio::fs::write(&script_path, script).await?;

        let job_id = match self.client.submit(&script_path).await {
            Ok(id) => id,
            Err(e) if e.kind() == ErrorKind::JobSubmitFailed => {
                warn!("submission failed: {}", e);
                return Ok(BatchResult {
                    stderr: Some(e.message().to_string()),
                    ..BatchResult::new(BatchStatus::SubmitFailed)
                });
            }
            Err(e) => return Err(e),
        };

        self.client.wait(&job_id, self.poll_interval).await?;

        let output = tokio::fs::read_to_string(self.inner.workdir.join(JOB_OUTPUT))
            .await
            .unwrap_or_else(|_| "No output".to_string());

        self.history.push(JobRecord {
            job_type: config.job_type,
            nodes: config.nodes,
            success: None,
            job_id: Some(job_id.clone()),
        });

        Ok(BatchResult {
            job_id: Some(job_id),
            output: Some(output),
            ..BatchResult::new(BatchStatus::Completed)
        })
    }
}

/// Result of a workflow: one entry per stage that ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowReport {
    pub status: BatchStatus,
    /// Set when the workflow stopped early
    pub failed_stage: Option<String>,
    pub stages: Vec<(String, BatchResult)>,
}

impl WorkflowReport {
    pub fn exit_code(&self) -> i32 {
        if self.status == BatchStatus::Success {
            0
        } else {
            1
        }
    }
}

/// Coordinates multi-stage runs on top of a `BatchJobAgent`
pub struct WorkflowAgent {
    batch: BatchJobAgent,
}

impl WorkflowAgent {
    pub fn new(batch: BatchJobAgent) -> Self {
        Self { batch }
    }

    pub fn batch(&self) -> &BatchJobAgent {
        &self.batch
    }

    pub async fn run_single_test(&mut self, nodes: u32) -> Result<WorkflowReport> {
        self.run_test("single_test", nodes).await
    }

    /// One job of an arbitrary type.
    pub async fn run_test(&mut self, job_type: &str, nodes: u32) -> Result<WorkflowReport> {
        let config = JobConfig::new(job_type, nodes, self.batch.pbs());
        let result = self.batch.run_agent_test(config).await?;
        Ok(WorkflowReport {
            status: result.status,
            failed_stage: None,
            stages: vec![(job_type.to_string(), result)],
        })
    }

    /// Sampling on many nodes, then optimization on fewer. Optimization only
    /// runs if sampling succeeded.
    pub async fn run_sampling_then_optimize(
        &mut self,
        sampling_nodes: u32,
        optimize_nodes: u32,
    ) -> Result<WorkflowReport> {
        info!("Stage 1: Sampling with {} nodes", sampling_nodes);
        let config = JobConfig::new("sampling", sampling_nodes, self.batch.pbs());
        let sampling = self.batch.run_agent_test(config).await?;

        if sampling.status != BatchStatus::Success {
            return Ok(WorkflowReport {
                status: BatchStatus::Failed,
                failed_stage: Some("sampling".to_string()),
                stages: vec![("sampling".to_string(), sampling)],
            });
        }

        info!("Stage 2: Optimization with {} nodes", optimize_nodes);
        let config = JobConfig::new("optimization", optimize_nodes, self.batch.pbs());
        let optimization = self.batch.run_agent_test(config).await?;

        Ok(WorkflowReport {
            status: BatchStatus::Completed,
            failed_stage: None,
            stages: vec![
                ("sampling".to_string(), sampling),
                ("optimization".to_string(), optimization),
            ],
        })
    }
}

/// Render the framed `batch_result.txt` report.
pub fn render_report(mode: &str, report: &WorkflowReport) -> String {
    let bar = "=".repeat(60);
    let mut text = format!("{}\nMode: {}\nStatus: {}\n", bar, mode, report.status);
    if let Some(stage) = &report.failed_stage {
        text.push_str(&format!("Failed stage: {}\n", stage));
    }

    let labelled = report.stages.len() > 1;
    for (name, result) in &report.stages {
        if labelled {
            text.push_str(&format!("\n[{}] Status: {}\n", name, result.status));
        }
        if let Some(message) = &result.message {
            text.push_str(&format!("\nMessage: {}\n", message));
        }
        if let Some(stdout) = result.stdout.as_ref().or(result.output.as_ref()) {
            text.push_str(&format!("\nOutput:\n{}\n", stdout));
        }
        if let Some(stderr) = result.stderr.as_ref().filter(|s| !s.is_empty()) {
            text.push_str(&format!("\nErrors:\n{}\n", stderr));
        }
    }
    text.push_str(&bar);
    text.push('\n');
    text
}

pub fn write_report(path: &Path, mode: &str, report: &WorkflowReport) -> Result<()> {
    std::fs::write(path, render_report(mode, report))?;
    Ok(())
}
