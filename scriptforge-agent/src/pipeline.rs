//! The generate -> review -> run -> fix pipeline.
//!
//! Every version of the scripts is saved into the output directory and
//! archived under `versions/<n>_<stage>` so a run can be traced afterwards.

use crate::agent::Agent;
use scriptforge_core::bundle::{detect_run_script, ScriptBundle};
use scriptforge_core::mcp::ToolBackend;
use scriptforge_core::prompts::{self, PromptEcho};
use scriptforge_core::provider::LlmProvider;
use scriptforge_core::runner::{self, LocalRunner, RunFailure, RunOutcome};
use scriptforge_error::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

/// Fix attempts after the first failed run
pub const MAX_RETRIES: usize = 2;

/// Name of the run script produced by the generator
pub const RUN_SCRIPT: &str = "run_libe.py";

pub const DEFAULT_OUTPUT_DIR: &str = "generated_scripts";

// ============================================================================
// Review
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Edit,
    Stop,
}

impl ReviewDecision {
    /// `stop` and `edit` are recognised; anything else approves.
    pub fn parse(answer: &str) -> Self {
        match answer.trim().to_lowercase().as_str() {
            "stop" => ReviewDecision::Stop,
            "edit" => ReviewDecision::Edit,
            _ => ReviewDecision::Approve,
        }
    }
}

/// The person (or policy) approving each review step
#[allow(async_fn_in_trait)]
pub trait Reviewer {
    fn is_interactive(&self) -> bool;

    async fn confirm(&mut self, question: &str) -> Result<ReviewDecision>;

    async fn feedback(&mut self) -> Result<String>;
}

/// Approves everything without asking
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl Reviewer for AutoApprove {
    fn is_interactive(&self) -> bool {
        false
    }

    async fn confirm(&mut self, _question: &str) -> Result<ReviewDecision> {
        Ok(ReviewDecision::Approve)
    }

    async fn feedback(&mut self) -> Result<String> {
        Ok(String::new())
    }
}

/// Asks on a line-oriented terminal
pub struct LineReviewer<R, W> {
    input: R,
    output: W,
}

pub type StdinReviewer = LineReviewer<BufReader<tokio::io::Stdin>, tokio::io::Stdout>;

impl StdinReviewer {
    pub fn stdin() -> Self {
        LineReviewer::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> LineReviewer<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    async fn ask(&mut self, prompt: &str) -> Result<String> {
        self.output.write_all(prompt.as_bytes()).await?;
        self.output.flush().await?;
        let mut line = String::new();
        if self.input.read_line(&mut line).await? == 0 {
            return Err(Error::channel_closed("stdin").with_operation("reviewer::ask"));
        }
        Ok(line.trim().to_string())
    }
}

impl<R, W> Reviewer for LineReviewer<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn is_interactive(&self) -> bool {
        true
    }

    async fn confirm(&mut self, question: &str) -> Result<ReviewDecision> {
        let answer = self.ask(&format!("\n{} (y/edit/stop): ", question)).await?;
        Ok(ReviewDecision::parse(&answer))
    }

    async fn feedback(&mut self) -> Result<String> {
        self.ask("What would you like to change? ").await
    }
}

// ============================================================================
// Running
// ============================================================================

/// What the console shows for a failed run: the exit code and the head of
/// stderr, or the reason when the script never finished.
pub fn failure_report(failure: &RunFailure) -> String {
    match failure.code {
        Some(code) if failure.stderr.is_empty() => {
            format!("✗ Scripts failed with return code {}", code)
        }
        Some(code) => format!(
            "✗ Scripts failed with return code {}\nError output:\n{}",
            code,
            prompts::truncate_chars(&failure.stderr, 500)
        ),
        None => format!("✗ Scripts failed\nError output:\n{}", prompts::truncate_chars(&failure.message, 500)),
    }
}

/// Executes a saved bundle and archives what it leaves behind
#[allow(async_fn_in_trait)]
pub trait ScriptRunner {
    async fn run(&self, dir: &Path, run_script: &str) -> Result<RunOutcome>;

    fn archive(&self, dir: &Path, archive: &str, error: Option<&str>) -> Result<()> {
        runner::archive_run_outputs(dir, archive, error).map(|_| ())
    }
}

impl ScriptRunner for LocalRunner {
    async fn run(&self, dir: &Path, run_script: &str) -> Result<RunOutcome> {
        LocalRunner::run(self, dir, run_script).await
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Where the first version of the scripts comes from
#[derive(Debug, Clone)]
pub enum ScriptSource {
    /// Ask the generator tool
    Prompt(String),
    /// Review and run scripts already on disk
    Existing(PathBuf),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub output_dir: PathBuf,
    pub generate_only: bool,
    pub max_retries: usize,
    pub echo: PromptEcho,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            generate_only: false,
            max_retries: MAX_RETRIES,
            echo: PromptEcho::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Succeeded { attempts: usize },
    /// `--generate-only`: scripts saved, nothing run
    Generated,
    Failed { attempts: usize, last_error: String },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, PipelineOutcome::Failed { .. })
    }
}

fn banner(title: &str) {
    let bar = "=".repeat(70);
    println!("\n{}\n  {}\n{}", bar, title, bar);
}

pub struct Pipeline<P, T, V, S> {
    agent: Agent<P, T>,
    reviewer: V,
    runner: S,
    options: PipelineOptions,
    archive_counter: usize,
}

impl<P, T, V, S> Pipeline<P, T, V, S>
where
    P: LlmProvider,
    T: ToolBackend,
    V: Reviewer,
    S: ScriptRunner,
{
    pub fn new(agent: Agent<P, T>, reviewer: V, runner: S, options: PipelineOptions) -> Self {
        Self {
            agent,
            reviewer,
            runner,
            options,
            archive_counter: 1,
        }
    }

    pub fn agent(&self) -> &Agent<P, T> {
        &self.agent
    }

    pub fn into_agent(self) -> Agent<P, T> {
        self.agent
    }

    fn save(&mut self, scripts: &str, stage: &str) -> Result<()> {
        let archive = format!("{}_{}", self.archive_counter, stage);
        let bundle = ScriptBundle::parse(scripts);
        if bundle.is_empty() {
            warn!("no files found in scripts for {}", archive);
        }
        bundle.save(&self.options.output_dir, Some(&archive))?;
        self.archive_counter += 1;
        Ok(())
    }

    pub async fn run(&mut self, source: ScriptSource) -> Result<PipelineOutcome> {
        let (mut scripts, run_script) = match source {
            ScriptSource::Existing(dir) => {
                println!("\nLoading existing scripts from: {}", dir.display());
                let bundle = ScriptBundle::from_dir(&dir)?;
                let run_script = detect_run_script(&dir)?.ok_or_else(|| {
                    Error::new(ErrorKind::ScriptNotFound, "No run_*.py script found")
                        .with_operation("pipeline::run")
                        .with_context("dir", dir.display().to_string())
                })?;
                let reviewed = self.review(bundle.render()).await?;
                self.save(&reviewed, "reviewed")?;
                (reviewed, run_script)
            }
            ScriptSource::Prompt(prompt) => {
                let generated = self.generate(&prompt).await?;
                self.save(&generated, "generated")?;
                let reviewed = self.review(generated).await?;
                self.save(&reviewed, "reviewed")?;
                (reviewed, RUN_SCRIPT.to_string())
            }
        };

        if self.options.generate_only {
            println!("\n✓ Generation/review complete (--generate-only mode)");
            return Ok(PipelineOutcome::Generated);
        }

        let max_retries = self.options.max_retries;
        let mut last_error = String::new();
        for attempt in 0..=max_retries {
            let current = self.archive_counter - 1;
            let archive = if attempt > 0 {
                format!("{}_attempt_{}", current, attempt)
            } else {
                format!("{}_reviewed", current)
            };

            banner("STAGE 3: Running Scripts");
            let outcome = self.runner.run(&self.options.output_dir, &run_script).await?;
            let error = match outcome {
                RunOutcome::Succeeded => {
                    println!("✓ Scripts ran successfully");
                    banner("✓ SUCCESS - Scripts completed successfully!");
                    return Ok(PipelineOutcome::Succeeded {
                        attempts: attempt + 1,
                    });
                }
                RunOutcome::Failed(failure) => {
                    println!("{}", failure_report(&failure));
                    failure.message
                }
            };

            self.runner
                .archive(&self.options.output_dir, &archive, Some(&error))?;

            if attempt < max_retries {
                banner(&format!("Retry attempt {}/{}", attempt + 1, max_retries));
                scripts = self.fix(&scripts, &error, &run_script).await?;
                self.archive_counter += 1;
                let archive = format!("{}_fix_{}", self.archive_counter, attempt + 1);
                ScriptBundle::parse(&scripts).save(&self.options.output_dir, Some(&archive))?;
            } else {
                banner(&format!("✗ FAILED after {} retry attempts", max_retries));
            }
            last_error = error;
        }

        Ok(PipelineOutcome::Failed {
            attempts: max_retries + 1,
            last_error,
        })
    }

    async fn generate(&mut self, prompt: &str) -> Result<String> {
        banner("STAGE 1: Generating Scripts");
        self.options.echo.show("MCP Generator", prompt);

        let transcript = self.agent.invoke(prompt).await?;
        match transcript.tool_output() {
            Some(text) if text.contains("===") => {
                info!("generator returned {} bytes", text.len());
                Ok(text.to_string())
            }
            _ => {
                println!("✗ No scripts generated");
                Err(Error::new(ErrorKind::BundleEmpty, "No scripts generated")
                    .with_operation("pipeline::generate"))
            }
        }
    }

    async fn review(&mut self, scripts: String) -> Result<String> {
        if !self.reviewer.is_interactive() {
            println!("\n[Skipping interactive review - use --interactive to enable]");
            return Ok(scripts);
        }

        banner("STAGE 2: Interactive Script Review");
        let sections: [(&str, &str, fn(&str) -> String); 2] = [
            ("Generator Configuration", "Extract Generator", prompts::extract_generator),
            ("Set Objective Function", "Extract Objective", prompts::extract_objective),
        ];

        let mut current = scripts;
        for (title, stage, template) in sections {
            println!("\n--- {} ---", title);
            let prompt = template(&current);
            self.options.echo.show(stage, &prompt);
            let summary = self.agent.ask(&prompt).await?;
            println!("{}", summary);

            match self.reviewer.confirm("Does this look correct?").await? {
                ReviewDecision::Stop => {
                    println!("✗ Stopped by user");
                    return Err(Error::stopped_by_user().with_operation("pipeline::review"));
                }
                ReviewDecision::Edit => {
                    let feedback = self.reviewer.feedback().await?;
                    let prompt = prompts::refine_with_feedback(&current, &feedback);
                    self.options.echo.show("Refine", &prompt);
                    let reply = self.agent.ask(&prompt).await?;
                    current = ScriptBundle::clean_response(&reply);
                    println!("✓ Updated");
                }
                ReviewDecision::Approve => println!("✓ Approved"),
            }
        }

        println!("\n✓ All sections approved");
        Ok(current)
    }

    async fn fix(&mut self, scripts: &str, error: &str, run_script: &str) -> Result<String> {
        banner("STAGE 4: Fixing Scripts");
        let prompt = prompts::fix(error, scripts, run_script);
        self.options.echo.show("Fix Scripts", &prompt);
        let reply = self.agent.ask(&prompt).await?;
        Ok(ScriptBundle::clean_response(&reply))
    }
}
