use crate::types::ArtifactId;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// An immutable piece of content under review, with the guide it was
/// written against.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub text: String,
    pub guide: String,
}

impl Artifact {
    pub fn new(id: impl Into<ArtifactId>, text: impl Into<String>, guide: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            guide: guide.into(),
        }
    }
}

/// Read-only access to artifacts. The engine never writes through it.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Returns `Ok(None)` when no artifact has this id.
    async fn load(&self, id: &ArtifactId) -> Result<Option<Artifact>>;
}

/// An `ArtifactSource` backed by a map, used by the CLI and in tests.
#[derive(Default)]
pub struct InMemoryArtifacts {
    artifacts: RwLock<HashMap<ArtifactId, Artifact>>,
}

impl InMemoryArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, artifact: Artifact) {
        self.artifacts
            .write()
            .await
            .insert(artifact.id.clone(), artifact);
    }
}

#[async_trait]
impl ArtifactSource for InMemoryArtifacts {
    async fn load(&self, id: &ArtifactId) -> Result<Option<Artifact>> {
        Ok(self.artifacts.read().await.get(id).cloned())
    }
}
