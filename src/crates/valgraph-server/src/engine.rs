//! Engine assembly.
//!
//! A single [`Engine`] value wires the checkpoint store, the artifact
//! store, the thread registry and the deployment together at process
//! start; handlers borrow it through axum state. There is no global
//! registry anywhere - tests construct their own engine against in-memory
//! stores.

use crate::artifacts::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
use crate::config::EngineConfig;
use crate::registry::{GraphDeployment, ThreadRegistry};
use anyhow::Context;
use std::sync::Arc;
use valgraph_checkpoint::{
    BlobCipher, CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore,
};

/// Everything one process needs to serve a deployment
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn CheckpointStore>,
    artifacts: Arc<dyn ArtifactStore>,
    registry: Arc<ThreadRegistry>,
}

impl Engine {
    /// Build the production engine from configuration
    pub async fn new(config: EngineConfig, deployment: GraphDeployment) -> anyhow::Result<Arc<Self>> {
        let mut sqlite = SqliteCheckpointStore::connect(&config.database_url)
            .await
            .context("connecting checkpoint store")?;
        if let Some(current) = &config.encryption_key_current {
            let cipher = BlobCipher::from_hex_keys(current, &config.encryption_key_retired)
                .context("loading encryption keys")?;
            sqlite = sqlite.with_cipher(cipher);
        }
        let store: Arc<dyn CheckpointStore> = Arc::new(sqlite);

        let artifacts: Arc<dyn ArtifactStore> = if config.blob_store_url == "memory:" {
            Arc::new(MemoryArtifactStore::new())
        } else {
            Arc::new(
                FsArtifactStore::new(config.blob_store_url.clone())
                    .context("opening artifact store")?,
            )
        };

        Ok(Self::assemble(config, store, artifacts, deployment))
    }

    /// Fully in-memory engine for tests and embedded use
    pub fn in_memory(deployment: GraphDeployment) -> Arc<Self> {
        Self::assemble(
            EngineConfig::for_tests(),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(MemoryArtifactStore::new()),
            deployment,
        )
    }

    /// In-memory engine with a custom configuration (tests tune capacities)
    pub fn in_memory_with(config: EngineConfig, deployment: GraphDeployment) -> Arc<Self> {
        Self::assemble(
            config,
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(MemoryArtifactStore::new()),
            deployment,
        )
    }

    fn assemble(
        config: EngineConfig,
        store: Arc<dyn CheckpointStore>,
        artifacts: Arc<dyn ArtifactStore>,
        deployment: GraphDeployment,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let registry = ThreadRegistry::new(
            store.clone(),
            artifacts.clone(),
            deployment,
            config.clone(),
        );
        let _ = registry.spawn_cleanup();
        Arc::new(Self {
            config,
            store,
            artifacts,
            registry,
        })
    }

    /// The engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The checkpoint store
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// The artifact store
    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// The thread registry
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }
}
