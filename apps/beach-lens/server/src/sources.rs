use std::{collections::HashMap, path::Path};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read sources file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse sources file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown template variable `{0}`")]
    UnknownVariable(String),
    #[error("unterminated template placeholder in {0:?}")]
    Unterminated(String),
}

/// Where camera stream URLs come from.
pub trait SourceResolver: Send + Sync {
    /// Stream source of a camera entity, if it has one.
    fn stream_source(&self, entity: &str) -> Option<String>;

    /// Renders `{{ name }}` placeholders in a stream URL template.
    fn render(&self, template: &str) -> Result<String, SourceError>;
}

/// Camera and variable tables loaded once from JSON:
///
/// ```json
/// { "cameras": { "camera.front": "rtsp://{{ user }}@10.0.0.5/main" },
///   "variables": { "user": "admin" } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticSources {
    #[serde(default)]
    cameras: HashMap<String, String>,
    #[serde(default)]
    variables: HashMap<String, String>,
}

impl StaticSources {
    pub fn new(cameras: HashMap<String, String>, variables: HashMap<String, String>) -> Self {
        Self { cameras, variables }
    }

    pub fn from_path(path: &Path) -> Result<Self, SourceError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SourceError::Parse {
            path: display,
            source,
        })
    }

    pub fn with_camera(mut self, entity: impl Into<String>, source: impl Into<String>) -> Self {
        self.cameras.insert(entity.into(), source.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

impl SourceResolver for StaticSources {
    fn stream_source(&self, entity: &str) -> Option<String> {
        let source = self.cameras.get(entity)?;
        // Camera sources may themselves be templates.
        self.render(source).ok().filter(|url| !url.is_empty())
    }

    fn render(&self, template: &str) -> Result<String, SourceError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| SourceError::Unterminated(template.to_string()))?;
            let name = after[..end].trim();
            let value = self
                .variables
                .get(name)
                .ok_or_else(|| SourceError::UnknownVariable(name.to_string()))?;
            out.push_str(value);
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
