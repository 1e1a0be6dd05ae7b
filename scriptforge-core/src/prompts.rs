//! Prompt templates for each pipeline stage.

/// Used when no prompt is given and no existing scripts are loaded.
pub const DEFAULT_PROMPT: &str = "Create six_hump_camel APOSMM scripts:
- Executable: /home/shudson/test_mcp/script-creator/six_hump_camel/six_hump_camel.x
- Input: /home/shudson/test_mcp/script-creator/six_hump_camel/input.txt
- Template vars: X0, X1
- 4 workers, 100 sims.
- The output file for each simulation is output.txt
- The bounds should be 0,1 and -1,2 for X0 and X1 respectively";

/// Errors quoted back to the model are cut to this many characters.
pub const MAX_ERROR_CHARS: usize = 1000;

pub fn extract_generator(scripts: &str) -> String {
    format!(
        "Look at these scripts and extract the generator configuration:

{scripts}

Show me:
- Generator name (e.g., APOSMM, uniform_sampling)
- Generator options from gen_specs['user'] (including bounds lb/ub, if present)

Be concise. Show only the configuration, not explanations."
    )
}

pub fn extract_objective(scripts: &str) -> String {
    format!(
        "Look at these scripts and find where the objective value is set:

{scripts}

Priority order:
1. If there's a function called set_objective_value() or set_objective() → show ONLY that function
2. Otherwise, show where the objective is computed (e.g., in the simulation function)

Show only the most relevant function code, be concise."
    )
}

pub fn refine_with_feedback(scripts: &str, feedback: &str) -> String {
    format!(
        "Here are the generated scripts:

{scripts}

User feedback: {feedback}

Update the scripts based on this feedback.
Return ONLY the scripts in the format (=== filename === followed by code).
Do NOT add explanations or wrap in markdown."
    )
}

pub fn fix(error: &str, scripts: &str, run_script: &str) -> String {
    let error = truncate_chars(error, MAX_ERROR_CHARS);
    format!(
        "These scripts failed with the following error:

{error}

Here are the current scripts (main run script is {run_script}):

{scripts}

Fix the scripts to resolve this error.
DO NOT make any other changes or improvements.
Return ALL scripts in the EXACT SAME FORMAT (=== filename === followed by raw Python code).
DO NOT merge or consolidate files - keep the same file structure.
DO NOT wrap in markdown or add explanations."
    )
}

/// First `max` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Prints prompts before they are sent when `--show-prompts` is on.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptEcho {
    pub enabled: bool,
}

impl PromptEcho {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn show(&self, stage: &str, prompt: &str) {
        if self.enabled {
            println!("{}", frame(stage, prompt));
        }
    }
}

fn frame(stage: &str, prompt: &str) -> String {
    let bar = "=".repeat(15);
    format!(
        "\n{bar} PROMPT TO AI ({stage}) {bar}\n{prompt}\n{bar} END AI PROMPT ({stage}) {bar}\n"
    )
}
