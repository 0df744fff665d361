//! Job context loading
//!
//! Loading the context is the one step that can fail a run outright: it
//! happens before any agent starts.

use async_trait::async_trait;
use quarry_core::{JobContext, QuarryError, Result};
use serde_json::Value;
use std::path::PathBuf;

/// Produces the job context handed to every agent of a run
#[async_trait]
pub trait ContextLoader: Send + Sync {
    async fn load(&self, project_id: &str) -> Result<JobContext>;
}

/// Reads the job payload from a JSON file
#[derive(Debug, Clone)]
pub struct FileContextLoader {
    path: PathBuf,
}

impl FileContextLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ContextLoader for FileContextLoader {
    async fn load(&self, project_id: &str) -> Result<JobContext> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            QuarryError::Context(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let payload: Value = serde_json::from_str(&content).map_err(|e| {
            QuarryError::Context(format!("invalid JSON in {}: {}", self.path.display(), e))
        })?;
        tracing::debug!("Loaded job context from {}", self.path.display());
        Ok(JobContext::new(payload).with_project(project_id))
    }
}

/// Hands out a fixed payload
#[derive(Debug, Clone, Default)]
pub struct StaticContextLoader {
    payload: Value,
}

impl StaticContextLoader {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

#[async_trait]
impl ContextLoader for StaticContextLoader {
    async fn load(&self, project_id: &str) -> Result<JobContext> {
        Ok(JobContext::new(self.payload.clone()).with_project(project_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_loader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, r#"{"thesis": "premium rioja", "queries": ["a"]}"#).unwrap();

        let context = FileContextLoader::new(&path).load("wine-sector").await.unwrap();
        assert_eq!(context.project_id.as_deref(), Some("wine-sector"));
        assert_eq!(context.get("thesis"), Some(&json!("premium rioja")));
    }

    #[tokio::test]
    async fn test_file_loader_errors_are_context_errors() {
        let dir = TempDir::new().unwrap();
        let missing = FileContextLoader::new(dir.path().join("absent.json"));
        assert!(matches!(missing.load("p").await, Err(QuarryError::Context(_))));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let bad = FileContextLoader::new(&path);
        assert!(matches!(bad.load("p").await, Err(QuarryError::Context(_))));
    }
}
