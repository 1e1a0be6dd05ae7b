//! # scriptforge CLI
//!
//! Generate libEnsemble scripts with a tool-calling agent, review them, run
//! them and let the agent fix failures.
//!
//! Usage:
//!   scriptforge generate [--interactive] [--prompt TEXT | --prompt-file FILE | --scripts DIR]
//!   scriptforge batch [--workflow single|sampling-optimize]
//!   scriptforge serve [--bind ADDR]
//!   scriptforge chat --agent-script libe_agent_interactive.py
//!   scriptforge models
//!   scriptforge check
//!
//! Examples:
//!   scriptforge generate --interactive
//!   scriptforge generate --interactive --scripts my_scripts/
//!   scriptforge generate --prompt "Create APOSMM scripts..."

mod chat;

use clap::{Args, Parser, Subcommand, ValueEnum};
use scriptforge_agent::batch::{self, BatchJobAgent, InnerAgent, WorkflowAgent};
use scriptforge_agent::pipeline::{
    AutoApprove, Pipeline, PipelineOptions, PipelineOutcome, Reviewer, ScriptSource,
    StdinReviewer, DEFAULT_OUTPUT_DIR, MAX_RETRIES,
};
use scriptforge_agent::{Agent, AgentConfig};
use scriptforge_core::config::{ProviderKind, Settings};
use scriptforge_core::mcp::{self, McpClient};
use scriptforge_core::prompts::{PromptEcho, DEFAULT_PROMPT};
use scriptforge_core::provider::{collect_models, describe_check_failure, AnyProvider, LlmProvider};
use scriptforge_core::runner::LocalRunner;
use scriptforge_error::{ErrorKind, Result};
use scriptforge_relay::RelayConfig;
use std::path::PathBuf;
use tokio::process::{ChildStdin, ChildStdout};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type ServerClient = McpClient<ChildStdout, ChildStdin>;

#[derive(Parser)]
#[command(name = "scriptforge")]
#[command(author, version, about = "Generate, review, run and fix libEnsemble scripts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate (or load) scripts, review them and run them with retries
    Generate(GenerateArgs),
    /// Run the generate agent locally or as a PBS job and write a report
    Batch(BatchArgs),
    /// Serve the WebSocket relay for chat clients
    Serve {
        #[arg(long, default_value = scriptforge_relay::DEFAULT_BIND)]
        bind: String,

        /// Directory agents run in when the client does not pick one
        #[arg(long, default_value = ".")]
        agent_dir: PathBuf,
    },
    /// Chat with an agent running behind the relay
    Chat {
        #[arg(long, default_value = "ws://127.0.0.1:8000")]
        url: String,

        #[arg(long, default_value = "libe_agent_interactive.py")]
        agent_script: String,

        #[arg(long)]
        scripts_dir: Option<String>,

        #[arg(long)]
        agent_dir: Option<String>,

        /// Session id; defaults to one per process
        #[arg(long)]
        session: Option<String>,

        /// Print full script contents as they are saved
        #[arg(long)]
        show_scripts: bool,

        /// Model the agent should use (LLM_MODEL otherwise)
        #[arg(long)]
        model: Option<String>,

        /// OpenAI-compatible endpoint for --model
        #[arg(long)]
        base_url: Option<String>,
    },
    /// List models from every configured provider
    Models,
    /// Send a one-token request to the configured model
    Check {
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Args)]
struct GenerateArgs {
    /// Enable interactive review mode
    #[arg(long)]
    interactive: bool,

    /// Use existing scripts from directory
    #[arg(long)]
    scripts: Option<PathBuf>,

    /// Prompt for script generation (not used with --scripts)
    #[arg(long)]
    prompt: Option<String>,

    /// Read prompt from file
    #[arg(long, conflicts_with = "prompt")]
    prompt_file: Option<PathBuf>,

    /// Print prompts sent to the model
    #[arg(long)]
    show_prompts: bool,

    /// Path to mcp_server.mjs
    #[arg(long)]
    mcp_server: Option<PathBuf>,

    /// Only generate/review scripts, don't run them
    #[arg(long)]
    generate_only: bool,

    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Model override (LLM_MODEL otherwise)
    #[arg(long)]
    model: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Workflow {
    Single,
    SamplingOptimize,
}

#[derive(Args)]
struct BatchArgs {
    #[arg(long, value_enum, default_value = "single")]
    workflow: Workflow,

    /// Nodes for a single job (PBS_MAX_NODES otherwise)
    #[arg(long)]
    nodes: Option<u32>,

    #[arg(long, default_value = "single_test")]
    job_type: String,

    #[arg(long, default_value_t = 2)]
    sampling_nodes: u32,

    #[arg(long, default_value_t = 1)]
    optimize_nodes: u32,

    /// Test scripts handed to the inner agent with --scripts
    #[arg(long, default_value = "tests/scripts_with_errors")]
    scripts_dir: PathBuf,

    /// Inner agent program; defaults to this binary's `generate`
    #[arg(long)]
    agent: Option<PathBuf>,

    /// Arguments for --agent
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Submit through qsub even outside a scheduler allocation
    #[arg(long)]
    pbs: bool,

    /// Run the inner agent here even inside a scheduler allocation
    #[arg(long, conflicts_with = "pbs")]
    local: bool,

    #[arg(long, default_value = "batch_result.txt")]
    report: PathBuf,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scriptforge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ============================================================================
// generate
// ============================================================================

fn script_source(args: &GenerateArgs) -> Result<ScriptSource> {
    if let Some(dir) = &args.scripts {
        return Ok(ScriptSource::Existing(dir.clone()));
    }
    let prompt = match (&args.prompt_file, &args.prompt) {
        (Some(file), _) => std::fs::read_to_string(file)?,
        (None, Some(prompt)) => prompt.clone(),
        (None, None) => DEFAULT_PROMPT.to_string(),
    };
    Ok(ScriptSource::Prompt(prompt))
}

async fn drive<V: Reviewer>(
    agent: Agent<AnyProvider, ServerClient>,
    reviewer: V,
    options: PipelineOptions,
    source: ScriptSource,
) -> Result<PipelineOutcome> {
    let mut pipeline = Pipeline::new(agent, reviewer, LocalRunner::from_env(), options);
    let outcome = pipeline.run(source).await;

    let agent = pipeline.into_agent();
    let usage = agent.usage();
    info!(
        "{} model calls, {} prompt / {} completion tokens",
        usage.total_calls, usage.totals.prompt_tokens, usage.totals.completion_tokens
    );
    if let Err(e) = agent.into_tools().shutdown().await {
        warn!("MCP server shutdown: {}", e);
    }
    outcome
}

async fn generate(args: GenerateArgs, settings: Settings) -> Result<i32> {
    let settings = match &args.model {
        Some(model) => settings.with_model(model.clone()),
        None => settings,
    };
    let source = script_source(&args)?;

    let server = mcp::find_server(args.mcp_server.as_deref(), settings.mcp_server.as_deref())?;
    println!("Generator MCP: {}", server.display());

    let mut client = McpClient::spawn(&server)?;
    client.initialize().await?;
    println!("✓ Connected to MCP server");
    client.list_tools().await?;

    let provider = settings.provider()?;
    info!("using {}", settings.model_label());
    let config = AgentConfig {
        model: Some(settings.model.clone()),
        ..AgentConfig::default()
    };
    let agent = Agent::with_config(provider, client, config);
    println!("✓ Agent initialized");

    let options = PipelineOptions {
        output_dir: args.output_dir.clone(),
        generate_only: args.generate_only,
        max_retries: MAX_RETRIES,
        echo: PromptEcho::new(args.show_prompts),
    };
    let outcome = if args.interactive {
        drive(agent, StdinReviewer::stdin(), options, source).await?
    } else {
        drive(agent, AutoApprove, options, source).await?
    };
    Ok(if outcome.is_success() { 0 } else { 1 })
}

// ============================================================================
// batch
// ============================================================================

async fn run_batch(args: BatchArgs, settings: Settings) -> Result<i32> {
    if settings.openai_api_key.is_none() {
        warn!("OPENAI_API_KEY not set - inner agent may fail");
    }

    let (program, agent_args) = match args.agent {
        Some(program) => (program, args.agent_args),
        None => (std::env::current_exe()?, vec!["generate".to_string()]),
    };
    let inner = InnerAgent {
        program,
        args: agent_args,
        workdir: args.workdir,
        scripts_dir: args.scripts_dir,
    };

    let mut batch_agent = BatchJobAgent::new(inner, settings.pbs.clone(), settings.openai_api_key.clone());
    if args.pbs {
        batch_agent = batch_agent.with_remote(true);
    } else if args.local {
        batch_agent = batch_agent.with_remote(false);
    }
    let mode = if batch_agent.is_remote() { "Remote (PBS)" } else { "Local" };
    info!("Running in {} mode", mode);

    let mut workflow = WorkflowAgent::new(batch_agent);
    let report = match args.workflow {
        Workflow::Single => {
            let nodes = args.nodes.unwrap_or(settings.pbs.max_nodes);
            workflow.run_test(&args.job_type, nodes).await?
        }
        Workflow::SamplingOptimize => {
            workflow
                .run_sampling_then_optimize(args.sampling_nodes, args.optimize_nodes)
                .await?
        }
    };
    info!("Result: {}", report.status);

    batch::write_report(&args.report, mode, &report)?;
    println!("Report written to {}", args.report.display());
    Ok(report.exit_code())
}

// ============================================================================
// models / check
// ============================================================================

async fn list_models(settings: Settings) -> Result<i32> {
    let providers = settings.configured_providers()?;
    let (choices, errors) = collect_models(&providers).await?;
    for error in errors {
        warn!("{}", error);
    }
    for choice in &choices {
        match &choice.base_url {
            Some(url) => println!("{}  [{}]", choice.label, url),
            None => println!("{}", choice.label),
        }
    }
    println!("\n{} models", choices.len());
    Ok(0)
}

async fn check(model: Option<String>, settings: Settings) -> Result<i32> {
    let settings = match model {
        Some(model) => settings.with_model(model),
        None => settings,
    };
    Ok(if preflight(&settings).await { 0 } else { 1 })
}

/// One-token check of the configured model, reported on stdout.
async fn preflight(settings: &Settings) -> bool {
    let result = match settings.provider() {
        Ok(provider) => provider.check().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            println!("✓ {} OK", settings.model_label());
            true
        }
        Err(e) => {
            let anthropic = settings.provider_kind() == ProviderKind::Anthropic;
            println!("✗ {}", describe_check_failure(&e, &settings.model, anthropic));
            false
        }
    }
}

/// Apply chat model flags and check the model before a run is started.
async fn chat_settings(
    settings: Settings,
    model: Option<String>,
    base_url: Option<String>,
) -> Option<Settings> {
    if model.is_none() && base_url.is_none() {
        return Some(settings);
    }
    let mut settings = settings;
    if let Some(model) = model {
        settings = settings.with_model(model);
    }
    if let Some(base_url) = base_url {
        settings = settings.with_base_url(base_url);
    }
    if preflight(&settings).await {
        Some(settings)
    } else {
        None
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Generate(args) => generate(args, Settings::from_env()?).await,
        Commands::Batch(args) => run_batch(args, Settings::from_env()?).await,
        Commands::Serve { bind, agent_dir } => {
            let config = RelayConfig {
                bind,
                agent_dir,
                python: LocalRunner::from_env().python().to_string(),
            };
            scriptforge_relay::serve(config).await?;
            Ok(0)
        }
        Commands::Chat {
            url,
            agent_script,
            scripts_dir,
            agent_dir,
            session,
            show_scripts,
            model,
            base_url,
        } => {
            let selected = model.is_some() || base_url.is_some();
            let Some(settings) = chat_settings(Settings::from_env()?, model, base_url).await else {
                return Ok(1);
            };
            let options = chat::ChatOptions {
                url,
                session: session.unwrap_or_else(|| format!("cli-{}", std::process::id())),
                agent_script,
                scripts_dir,
                agent_dir,
                show_scripts,
                llm_model: selected.then(|| settings.model.clone()),
                openai_base_url: if selected { settings.openai_base_url.clone() } else { None },
            };
            chat::run(options).await
        }
        Commands::Models => list_models(Settings::from_env()?).await,
        Commands::Check { model } => check(model, Settings::from_env()?).await,
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    // Ctrl-C is watched from its own task so it also ends a pending review
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n\nInterrupted by user");
            std::process::exit(0);
        }
    });

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) if e.kind() == ErrorKind::StoppedByUser => 0,
        Err(e) => {
            debug!("{:?}", e);
            eprintln!("\n✗ Error: {}", e.message());
            1
        }
    };
    std::process::exit(code);
}
