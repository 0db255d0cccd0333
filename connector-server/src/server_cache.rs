//! In-process cache of FHIR server configurations
//!
//! Readers get an `Arc` snapshot. Invalidation empties the slot and bumps the
//! generation under the write lock; a reload only installs its snapshot when
//! no invalidation happened while it was reading the store.

use chrono::{DateTime, Utc};
use connector_core::{FhirServerConfig, Result};
use connector_store::SqliteStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

pub struct ServerConfigCache {
    store: Arc<SqliteStore>,
    slot: RwLock<Option<Arc<Vec<FhirServerConfig>>>>,
    generation: AtomicU64,
}

impl ServerConfigCache {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            slot: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current snapshot, loading from the store when empty
    pub async fn configs(&self) -> Result<Arc<Vec<FhirServerConfig>>> {
        if let Some(configs) = self.slot.read().await.as_ref() {
            return Ok(Arc::clone(configs));
        }
        self.reload().await
    }

    /// Configuration for `name`. A miss against a cached snapshot reloads once
    /// in case the server was added by another writer. The reload replaces the
    /// snapshot in place, so the generation is left alone and readers keep
    /// their cached copy meanwhile.
    pub async fn find(&self, name: &str) -> Result<Option<FhirServerConfig>> {
        let configs = self.configs().await?;
        if let Some(config) = configs.iter().find(|c| c.name == name) {
            return Ok(Some(config.clone()));
        }

        tracing::debug!(server = %name, "FHIR server not in cached configs, reloading");
        let configs = self.reload().await?;
        Ok(configs.iter().find(|c| c.name == name).cloned())
    }

    pub async fn invalidate(&self) {
        let mut slot = self.slot.write().await;
        *slot = None;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Save a fresh access token and drop the snapshot that holds the old one
    pub async fn persist_token(
        &self,
        server_name: &str,
        access_token: &str,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .in_transaction(|ops| ops.update_access_token(server_name, access_token, expiry))?;
        self.invalidate().await;
        Ok(())
    }

    async fn reload(&self) -> Result<Arc<Vec<FhirServerConfig>>> {
        let started_at = self.generation();
        let configs = Arc::new(self.store.list_fhir_servers()?);

        let mut slot = self.slot.write().await;
        if self.generation() == started_at {
            *slot = Some(Arc::clone(&configs));
        } else {
            tracing::debug!("Config reload raced an invalidation; not caching it");
        }
        Ok(configs)
    }
}
