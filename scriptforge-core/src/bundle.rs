//! Multi-file script bundles.
//!
//! The generator and the model both exchange scripts as a single text blob
//! where each file starts with a `=== filename ===` line. This module parses
//! that format, cleans up model replies that wrap it in markdown, and moves
//! bundles to and from disk (including the numbered `versions/` archive).

use scriptforge_error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One file of a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub name: String,
    pub content: String,
}

/// Ordered collection of scripts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptBundle {
    files: Vec<ScriptFile>,
}

fn header_name(line: &str) -> Option<&str> {
    let name = line
        .trim_end()
        .strip_prefix("=== ")?
        .strip_suffix(" ===")?
        .trim();
    (!name.is_empty()).then_some(name)
}

impl ScriptBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `=== name ===` delimited text. A line starting with `===` that
    /// is not a valid header still ends the file before it.
    pub fn parse(text: &str) -> Self {
        let text = text.replace("\r\n", "\n");
        let mut files = Vec::new();
        let mut current: Option<(String, Vec<&str>)> = None;

        let mut flush = |current: &mut Option<(String, Vec<&str>)>| {
            if let Some((name, lines)) = current.take() {
                files.push(ScriptFile {
                    name,
                    content: lines.join("\n").trim().to_string(),
                });
            }
        };

        for line in text.lines() {
            if let Some(name) = header_name(line) {
                flush(&mut current);
                current = Some((name.to_string(), Vec::new()));
            } else if line.starts_with("===") {
                flush(&mut current);
            } else if let Some((_, lines)) = current.as_mut() {
                lines.push(line);
            }
        }
        flush(&mut current);

        Self { files }
    }

    /// Strip markdown fences from a model reply and drop any preamble
    /// before the first file marker.
    pub fn clean_response(text: &str) -> String {
        let text = text
            .replace("```python\n", "")
            .replace("```\n", "")
            .replace("```", "");
        match text.find("===") {
            Some(start) => text[start..].to_string(),
            None => text,
        }
    }

    /// Load every `*.py` file in `dir`, sorted by name.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| Error::from(e).with_context("dir", dir.display().to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "py"))
            .collect();
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let content = fs::read_to_string(&path)?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            files.push(ScriptFile { name, content });
        }
        Ok(Self { files })
    }

    pub fn push(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.files.push(ScriptFile {
            name: name.into(),
            content: content.into(),
        });
    }

    pub fn files(&self) -> &[ScriptFile] {
        &self.files
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.files
            .iter()
            .rev()
            .find(|f| f.name == name)
            .map(|f| f.content.as_str())
    }

    pub fn names(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Back to the text form used in prompts.
    pub fn render(&self) -> String {
        self.files
            .iter()
            .map(|f| format!("=== {} ===\n{}\n\n", f.name, f.content))
            .collect()
    }

    /// Write each file into `dir` (and into `dir/versions/<archive>/` when
    /// an archive name is given). Prints one `- Saved:` line per file.
    pub fn save(&self, dir: &Path, archive: Option<&str>) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;

        let mut saved = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let path = dir.join(&file.name);
            fs::write(&path, format!("{}\n", file.content.trim()))?;
            println!("- Saved: {}", path.display());
            saved.push(path);
        }

        if let Some(archive) = archive {
            let archive_dir = dir.join("versions").join(archive);
            fs::create_dir_all(&archive_dir)?;
            for file in &self.files {
                fs::write(archive_dir.join(&file.name), format!("{}\n", file.content.trim()))?;
            }
            debug!("archived {} files to {}", self.files.len(), archive_dir.display());
        }

        Ok(saved)
    }
}

/// First `run_*.py` in `dir` by name.
pub fn detect_run_script(dir: &Path) -> Result<Option<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("run_") && n.ends_with(".py"))
        .collect();
    names.sort();
    Ok(names.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENERATED: &str = "=== run_libe.py ===\nimport numpy as np\n\nfrom libensemble import Ensemble\n\n=== simf.py ===\ndef sim_f(H, persis_info, sim_specs, libE_info):\n    pass\n";

    #[test]
    fn test_parse_two_files() {
        let bundle = ScriptBundle::parse(GENERATED);
        assert_eq!(bundle.names(), vec!["run_libe.py", "simf.py"]);
        assert_eq!(
            bundle.get("run_libe.py"),
            Some("import numpy as np\n\nfrom libensemble import Ensemble")
        );
        assert!(bundle.get("simf.py").unwrap().ends_with("pass"));
    }

    #[test]
    fn test_parse_ignores_preamble_and_handles_crlf() {
        let text = "Here are your scripts:\r\n===  run_a.py  ===\r\nprint(1)\r\n";
        let bundle = ScriptBundle::parse(text);
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.files()[0].name, "run_a.py");
        assert_eq!(bundle.files()[0].content, "print(1)");
    }

    #[test]
    fn test_parse_without_headers_is_empty() {
        assert!(ScriptBundle::parse("Scripts created").is_empty());
        assert!(ScriptBundle::parse("").is_empty());
        assert!(ScriptBundle::parse("=== ===\nx").is_empty());
    }

    #[test]
    fn test_marker_line_inside_content_ends_file() {
        let text = "=== a.py ===\nx = 1\n==== banner ====\ny = 2\n=== b.py ===\nz = 3";
        let bundle = ScriptBundle::parse(text);
        assert_eq!(bundle.get("a.py"), Some("x = 1"));
        assert_eq!(bundle.get("b.py"), Some("z = 3"));
        assert_eq!(bundle.len(), 2);
    }

    #[test]
    fn test_clean_response() {
        let reply = "Sure! Here are the fixed scripts:\n```python\n=== run_libe.py ===\nprint(1)\n```\n";
        assert_eq!(ScriptBundle::clean_response(reply), "=== run_libe.py ===\nprint(1)\n");

        assert_eq!(ScriptBundle::clean_response("no markers"), "no markers");
        assert_eq!(ScriptBundle::clean_response("```x```"), "x");
    }

    #[test]
    fn test_render_round_trip() {
        let bundle = ScriptBundle::parse(GENERATED);
        let rendered = bundle.render();
        assert!(rendered.starts_with("=== run_libe.py ===\nimport numpy"));
        assert!(rendered.ends_with("pass\n\n"));
        assert_eq!(ScriptBundle::parse(&rendered), bundle);
    }

    #[test]
    fn test_save_with_archive() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("generated_scripts");
        let bundle = ScriptBundle::parse(GENERATED);

        let saved = bundle.save(&out, Some("1_generated")).unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(
            fs::read_to_string(out.join("simf.py")).unwrap(),
            "def sim_f(H, persis_info, sim_specs, libE_info):\n    pass\n"
        );
        assert!(out.join("versions/1_generated/run_libe.py").is_file());

        bundle.save(&out, None).unwrap();
        assert!(!out.join("versions/None").exists());
    }

    #[test]
    fn test_from_dir_and_detect_run_script() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("simf.py"), "def f(): pass\n").unwrap();
        fs::write(dir.path().join("run_z.py"), "print('z')\n").unwrap();
        fs::write(dir.path().join("run_a.py"), "print('a')\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let bundle = ScriptBundle::from_dir(dir.path()).unwrap();
        assert_eq!(bundle.names(), vec!["run_a.py", "run_z.py", "simf.py"]);
        assert!(bundle.render().contains("=== simf.py ===\ndef f(): pass\n"));

        assert_eq!(detect_run_script(dir.path()).unwrap().as_deref(), Some("run_a.py"));
    }

    #[test]
    fn test_detect_run_script_none() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("simf.py"), "").unwrap();
        assert_eq!(detect_run_script(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_from_missing_dir() {
        let err = ScriptBundle::from_dir(Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.kind(), scriptforge_error::ErrorKind::FileNotFound);
    }
}
