//! Directory scanners behind the listing endpoints. Missing or unreadable
//! directories yield the default choices, never an error.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const AGENT_PREFIX: &str = "libe_agent";
pub const NONE_OPTION: &str = "(none)";
pub const LATEST: &str = "latest";

/// Files that live next to the agents but are not agents
const NOT_AGENTS: &[&str] = &["app.py", "gradio_chat.py", "__init__.py"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub filename: String,
    pub content: String,
}

fn sorted_names(dir: &Path, want_dirs: bool) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir() == want_dirs)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// `libe_agent*.py` scripts in the agent directory.
pub fn agent_scripts(agent_dir: &Path) -> Vec<String> {
    sorted_names(agent_dir, false)
        .into_iter()
        .filter(|name| name.starts_with(AGENT_PREFIX) && name.ends_with(".py"))
        .filter(|name| !NOT_AGENTS.contains(&name.as_str()))
        .collect()
}

/// `(none)` followed by the test script directories.
pub fn script_dirs(tests_dir: &Path) -> Vec<String> {
    std::iter::once(NONE_OPTION.to_string())
        .chain(
            sorted_names(tests_dir, true)
                .into_iter()
                .filter(|name| !name.starts_with('_')),
        )
        .collect()
}

/// `latest` followed by archived versions, newest first.
pub fn versions(agent_dir: &Path) -> Vec<String> {
    let versions_dir = agent_dir.join("generated_scripts").join("versions");
    let mut names: Vec<String> = sorted_names(&versions_dir, true)
        .into_iter()
        .filter(|name| !name.starts_with('_'))
        .collect();
    names.reverse();
    std::iter::once(LATEST.to_string()).chain(names).collect()
}

/// `*.py` files of a directory, sorted by name.
pub fn python_scripts(dir: &Path) -> Vec<ScriptEntry> {
    sorted_names(dir, false)
        .into_iter()
        .filter(|name| name.ends_with(".py"))
        .filter_map(|filename| {
            let content = fs::read_to_string(dir.join(&filename)).ok()?;
            Some(ScriptEntry { filename, content })
        })
        .collect()
}

/// `path` with symlinks resolved, if it exists and lies under `root`.
pub fn contained(root: &Path, path: &Path) -> Option<PathBuf> {
    let root = root.canonicalize().ok()?;
    let path = path.canonicalize().ok()?;
    path.starts_with(&root).then_some(path)
}

/// Scripts of one archived version, or the live output for `latest`.
/// Version names are single directory names; anything else lists nothing.
pub fn version_scripts(agent_dir: &Path, version: Option<&str>) -> Vec<ScriptEntry> {
    let generated = agent_dir.join("generated_scripts");
    let Some(version) = version.filter(|v| !v.is_empty() && *v != LATEST) else {
        return python_scripts(&generated);
    };
    let mut parts = Path::new(version).components();
    if !matches!((parts.next(), parts.next()), (Some(Component::Normal(_)), None)) {
        return Vec::new();
    }
    let versions_dir = generated.join("versions");
    match contained(&versions_dir, &versions_dir.join(version)) {
        Some(dir) => python_scripts(&dir),
        None => Vec::new(),
    }
}
