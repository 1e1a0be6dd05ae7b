//! PBS batch queue interface
//!
//! Renders job scripts and drives `qsub`/`qstat`. The scheduler itself is
//! external; this module only shells out to it.

use scriptforge_error::{Error, ErrorKind, Result};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub const DEFAULT_PROJECT: &str = "myproject";
pub const DEFAULT_QUEUE: &str = "debug";
pub const DEFAULT_WALLTIME: &str = "00:15:00";
pub const DEFAULT_MAX_NODES: u32 = 2;

/// Site-wide queue settings (`PBS_PROJECT`, `PBS_QUEUE`, `PBS_WALLTIME`,
/// `PBS_MAX_NODES`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbsSettings {
    pub project: String,
    pub queue: String,
    pub walltime: String,
    pub max_nodes: u32,
}

impl Default for PbsSettings {
    fn default() -> Self {
        Self {
            project: DEFAULT_PROJECT.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            walltime: DEFAULT_WALLTIME.to_string(),
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

impl PbsSettings {
    pub fn from_lookup<F>(get: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_nodes = match get("PBS_MAX_NODES") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|e| Error::config_invalid("PBS_MAX_NODES", e.to_string()))?,
            None => defaults.max_nodes,
        };

        Ok(Self {
            project: get("PBS_PROJECT").unwrap_or(defaults.project),
            queue: get("PBS_QUEUE").unwrap_or(defaults.queue),
            walltime: get("PBS_WALLTIME").unwrap_or(defaults.walltime),
            max_nodes,
        })
    }
}

/// One job request. `nodes` is always within `1..=max_nodes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub job_type: String,
    pub nodes: u32,
    pub walltime: String,
    pub queue: String,
}

impl JobConfig {
    pub fn new(job_type: impl Into<String>, nodes: u32, settings: &PbsSettings) -> Self {
        Self {
            job_type: job_type.into(),
            nodes: nodes.min(settings.max_nodes).max(1),
            walltime: settings.walltime.clone(),
            queue: settings.queue.clone(),
        }
    }
}

/// Render the batch script submitted with `qsub`.
pub fn render_script(
    config: &JobConfig,
    settings: &PbsSettings,
    api_key: Option<&str>,
    inner_command: &str,
) -> String {
    let mut script = format!(
        "#!/bin/bash -l\n\
         #PBS -l select={nodes}\n\
         #PBS -l walltime={walltime}\n\
         #PBS -q {queue}\n\
         #PBS -A {project}\n\
         #PBS -o job_output.txt\n\
         #PBS -e job_error.txt\n\
         \n\
         module load frameworks\n\
         \n\
         export MPICH_GPU_SUPPORT_ENABLED=1\n",
        nodes = config.nodes,
        walltime = config.walltime,
        queue = config.queue,
        project = settings.project,
    );
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        script.push_str(&format!("export OPENAI_API_KEY=\"{}\"\n", key));
    }
    script.push_str("\ncd $PBS_O_WORKDIR\n\n");
    script.push_str(&format!("{} > job_output.txt 2>&1\n", inner_command));
    script
}

/// True when running inside a scheduler allocation.
pub fn is_remote_environment() -> bool {
    ["PBS_O_WORKDIR", "PBS_NODEFILE", "SLURM_JOB_ID"]
        .iter()
        .any(|var| std::env::var_os(var).is_some())
}

/// Thin wrapper over the `qsub` and `qstat` executables
#[derive(Debug, Clone)]
pub struct PbsClient {
    qsub: String,
    qstat: String,
}

impl Default for PbsClient {
    fn default() -> Self {
        Self::from_env()
    }
}

impl PbsClient {
    /// Executables can be swapped for fakes with `SCRIPTFORGE_QSUB` and
    /// `SCRIPTFORGE_QSTAT`.
    pub fn from_env() -> Self {
        Self {
            qsub: std::env::var("SCRIPTFORGE_QSUB").unwrap_or_else(|_| "qsub".to_string()),
            qstat: std::env::var("SCRIPTFORGE_QSTAT").unwrap_or_else(|_| "qstat".to_string()),
        }
    }

    pub fn with_executables(qsub: impl Into<String>, qstat: impl Into<String>) -> Self {
        Self {
            qsub: qsub.into(),
            qstat: qstat.into(),
        }
    }

    /// Submit a job script and return the job id.
    pub async fn submit(&self, script: &Path) -> Result<String> {
        let mut command = Command::new(&self.qsub);
        command.arg(script);
        // qsub records its cwd as PBS_O_WORKDIR
        if let Some(dir) = script.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        let output = command
            .output()
            .await
            .map_err(|e| {
                Error::new(ErrorKind::JobSubmitFailed, format!("failed to run {}: {}", self.qsub, e))
                    .with_operation("pbs::submit")
                    .set_source(e)
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::new(ErrorKind::JobSubmitFailed, stderr)
                .with_operation("pbs::submit")
                .with_context("code", output.status.code().unwrap_or(-1).to_string()));
        }

        let job_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Submitted job: {}", job_id);
        Ok(job_id)
    }

    /// Whether the job still shows up in `qstat`.
    pub async fn is_queued(&self, job_id: &str) -> Result<bool> {
        let output = Command::new(&self.qstat)
            .arg(job_id)
            .output()
            .await
            .map_err(|e| {
                Error::new(ErrorKind::IoFailed, format!("failed to run {}: {}", self.qstat, e))
                    .with_operation("pbs::is_queued")
                    .set_source(e)
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("qstat {} -> {:?}: {}", job_id, output.status.code(), stdout.trim());
        Ok(output.status.success() && stdout.contains(job_id))
    }

    /// Poll until the job leaves the queue.
    pub async fn wait(&self, job_id: &str, poll_interval: Duration) -> Result<()> {
        while self.is_queued(job_id).await? {
            tokio::time::sleep(poll_interval).await;
        }
        info!("Job {} finished", job_id);
        Ok(())
    }
}
