//! Script sources
//!
//! Resolves a script identifier (for example `blaa_26.script`) to the URScript
//! text that is sent to the robot.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use crate::error::ScriptError;

#[async_trait]
pub trait ScriptSource: Send + Sync {
    async fn load(&self, id: &str) -> Result<String, ScriptError>;
}

/// Loads scripts from files in a single directory
#[derive(Debug, Clone)]
pub struct DirectoryScriptSource {
    root: PathBuf,
}

impl DirectoryScriptSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, ScriptError> {
        let relative = Path::new(id);
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(relative)),
            _ => Err(ScriptError::InvalidIdentifier(id.to_string())),
        }
    }
}

#[async_trait]
impl ScriptSource for DirectoryScriptSource {
    async fn load(&self, id: &str) -> Result<String, ScriptError> {
        let path = self.resolve(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ScriptError::NotFound(path.display().to_string()))
            }
            Err(source) => Err(ScriptError::Io { id: id.to_string(), source }),
        }
    }
}

/// Scripts held in memory, keyed by identifier
#[derive(Debug, Clone, Default)]
pub struct StaticScriptSource {
    scripts: HashMap<String, String>,
}

impl StaticScriptSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, id: &str, body: &str) -> Self {
        self.scripts.insert(id.to_string(), body.to_string());
        self
    }
}

#[async_trait]
impl ScriptSource for StaticScriptSource {
    async fn load(&self, id: &str) -> Result<String, ScriptError> {
        self.scripts
            .get(id)
            .cloned()
            .ok_or_else(|| ScriptError::NotFound(id.to_string()))
    }
}
