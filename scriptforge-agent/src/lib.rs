//! # scriptforge agent
//!
//! The model drives the script generator through tool calls; the pipeline
//! around it reviews, runs and repairs what comes back:
//! 1. The prompt (or an existing script directory) goes to the agent
//! 2. The agent calls the generator tool and collects the scripts
//! 3. A reviewer approves, edits or stops
//! 4. The run script executes; on failure the agent is asked for a fix
//! 5. Every version is archived for later inspection
//!
//! [`batch`] wraps the whole thing for scheduler allocations.

pub mod agent;
pub mod batch;
pub mod pipeline;

pub use agent::{Agent, AgentConfig, Transcript};
pub use batch::{BatchJobAgent, BatchResult, BatchStatus, InnerAgent, WorkflowAgent, WorkflowReport};
pub use pipeline::{
    AutoApprove, LineReviewer, Pipeline, PipelineOptions, PipelineOutcome, Reviewer, ScriptRunner,
    ScriptSource, StdinReviewer,
};
