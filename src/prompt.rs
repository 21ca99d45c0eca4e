//! Prompt templates as typed contracts.
//!
//! A template is a markdown file with an optional metadata header and one
//! required named slot (e.g. `{{ride_brief}}`). The slot is validated when
//! the template is loaded, at startup, so a malformed template fails the
//! process immediately instead of failing per-event.
//!
//! Header lines, anywhere before the first content line:
//!   MODEL=gpt-4o            overrides the configured default model
//!   PROMPT_VERSION=ride_v3  overrides the caller's default version tag
//! Both are stripped from the rendered body.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Prompt file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read prompt file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Prompt file is empty: {0}")]
    Empty(PathBuf),

    #[error("Prompt template {path} is missing required slot {slot}")]
    MissingSlot { path: PathBuf, slot: String },
}

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    body: String,
    slot: String,
    model_override: Option<String>,
    version_override: Option<String>,
}

impl PromptTemplate {
    /// Load a template and validate that `slot` (written as `{{slot}}` in
    /// the file) is present.
    pub fn load(path: &Path, slot: &str) -> Result<Self, PromptError> {
        if !path.exists() {
            return Err(PromptError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| PromptError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Err(PromptError::Empty(path.to_path_buf()));
        }

        let mut model_override = None;
        let mut version_override = None;
        let mut body_lines = Vec::new();
        for line in raw.lines() {
            let trimmed = line.trim();
            if let Some(value) = header_value(trimmed, "MODEL=") {
                model_override = Some(value);
            } else if let Some(value) = header_value(trimmed, "PROMPT_VERSION=") {
                version_override = Some(value);
            } else {
                body_lines.push(line);
            }
        }
        let body = body_lines.join("\n").trim().to_string();

        let marker = format!("{{{{{}}}}}", slot);
        if !body.contains(&marker) {
            return Err(PromptError::MissingSlot {
                path: path.to_path_buf(),
                slot: marker,
            });
        }

        Ok(Self {
            body,
            slot: marker,
            model_override,
            version_override,
        })
    }

    /// Substitute the slot with `content` and return the full prompt.
    pub fn render(&self, content: &str) -> String {
        self.body.replace(&self.slot, content)
    }

    /// Model to use: the template's `MODEL=` override, else `default`.
    pub fn model<'a>(&'a self, default: &'a str) -> &'a str {
        self.model_override.as_deref().unwrap_or(default)
    }

    /// Version tag: the template's `PROMPT_VERSION=` override, else `default`.
    pub fn version<'a>(&'a self, default: &'a str) -> &'a str {
        self.version_override.as_deref().unwrap_or(default)
    }

    /// Whether the template asks for a structured JSON response.
    pub fn wants_json(&self) -> bool {
        self.body.contains("JSON format") && self.body.to_lowercase().contains("json_object")
    }
}

fn header_value(line: &str, key: &str) -> Option<String> {
    let upper = line.to_uppercase();
    if upper.starts_with(key) {
        let value = line[key.len()..].trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_template(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.md");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_and_render() {
        let (_dir, path) = write_template("Analyze this ride:\n\n{{ride_brief}}\n\nBe concise.");
        let tpl = PromptTemplate::load(&path, "ride_brief").unwrap();
        let rendered = tpl.render("- Distance: 42 km");
        assert!(rendered.contains("- Distance: 42 km"));
        assert!(!rendered.contains("{{ride_brief}}"));
    }

    #[test]
    fn test_missing_slot_fails_at_load() {
        let (_dir, path) = write_template("Analyze this ride, no slot here.");
        let err = PromptTemplate::load(&path, "ride_brief").unwrap_err();
        assert!(matches!(err, PromptError::MissingSlot { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err =
            PromptTemplate::load(Path::new("/nonexistent/prompt.md"), "ride_brief").unwrap_err();
        assert!(matches!(err, PromptError::NotFound(_)));
    }

    #[test]
    fn test_empty_file() {
        let (_dir, path) = write_template("   \n  ");
        let err = PromptTemplate::load(&path, "ride_brief").unwrap_err();
        assert!(matches!(err, PromptError::Empty(_)));
    }

    #[test]
    fn test_header_overrides_stripped_from_body() {
        let (_dir, path) =
            write_template("MODEL=gpt-4o\nPROMPT_VERSION=ride_v3\n\nBrief:\n{{ride_brief}}");
        let tpl = PromptTemplate::load(&path, "ride_brief").unwrap();
        assert_eq!(tpl.model("gpt-4o-mini"), "gpt-4o");
        assert_eq!(tpl.version("ride_v1"), "ride_v3");
        let rendered = tpl.render("x");
        assert!(!rendered.contains("MODEL="));
        assert!(!rendered.contains("PROMPT_VERSION="));
    }

    #[test]
    fn test_defaults_without_headers() {
        let (_dir, path) = write_template("{{ride_brief}}");
        let tpl = PromptTemplate::load(&path, "ride_brief").unwrap();
        assert_eq!(tpl.model("gpt-4o-mini"), "gpt-4o-mini");
        assert_eq!(tpl.version("ride_v1"), "ride_v1");
    }

    #[test]
    fn test_wants_json_detection() {
        let (_dir, path) = write_template(
            "Respond in JSON format (json_object) with metrics and narrative.\n{{ride_brief}}",
        );
        let tpl = PromptTemplate::load(&path, "ride_brief").unwrap();
        assert!(tpl.wants_json());

        let (_dir2, path2) = write_template("Write markdown.\n{{ride_brief}}");
        let tpl2 = PromptTemplate::load(&path2, "ride_brief").unwrap();
        assert!(!tpl2.wants_json());
    }
}
