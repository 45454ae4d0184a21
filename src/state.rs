//! State persistence for bot configurations

use crate::config::BotConfig;
use crate::registry::BotRegistry;
use crate::storage::{FileSystemStorage, StorageBackend};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SavedState {
    pub last_updated: chrono::DateTime<chrono::Utc>,
    pub bots: Vec<BotConfig>,
}

/// Persists the mounted bots so a restarted node serves the same tenants
pub struct StateManager {
    state_file: PathBuf,
    registry: Arc<BotRegistry>,
    storage: Arc<dyn StorageBackend>,
    /// Guard to prevent concurrent restore operations
    restore_in_progress: AtomicBool,
}

impl StateManager {
    /// Create a new state manager with custom storage backend
    pub fn new_with_storage(
        state_file: PathBuf,
        registry: Arc<BotRegistry>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            state_file,
            registry,
            storage,
            restore_in_progress: AtomicBool::new(false),
        }
    }

    /// Create a new state manager with default filesystem storage
    pub fn new(state_file: PathBuf, registry: Arc<BotRegistry>) -> Self {
        Self::new_with_storage(state_file, registry, Arc::new(FileSystemStorage::new()))
    }

    /// Save current state to disk atomically
    pub async fn save(&self) -> Result<()> {
        let state = SavedState {
            last_updated: chrono::Utc::now(),
            bots: self.registry.configs().await,
        };

        let toml_content =
            toml::to_string_pretty(&state).context("Failed to serialize state to TOML")?;

        self.storage
            .save(&self.state_file, toml_content.as_bytes())
            .await?;

        tracing::debug!(
            path = ?self.state_file,
            bots = state.bots.len(),
            "State saved"
        );

        Ok(())
    }

    /// Load state from disk
    /// FAILS HARD if state file is corrupted - user must fix or delete
    pub async fn load(&self) -> Result<SavedState> {
        let content = match self.storage.load(&self.state_file).await? {
            Some(c) => c,
            None => {
                tracing::info!("No state file found, starting fresh");
                return Ok(SavedState::default());
            }
        };

        let content = String::from_utf8(content)
            .with_context(|| format!("State file {:?} is not valid UTF-8", self.state_file))?;

        let state: SavedState = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse state file: {:?}. File may be corrupted. \
                Please delete or fix the file manually.",
                self.state_file
            )
        })?;

        tracing::info!(
            bots = state.bots.len(),
            last_updated = %state.last_updated,
            "State loaded from disk"
        );

        Ok(state)
    }

    /// Mount every bot of the saved state
    ///
    /// Guarded against concurrent execution: a second call while a restore is
    /// running fails instead of mounting the same bots twice. A bot that fails
    /// to mount is logged and skipped.
    pub async fn restore(&self) -> Result<()> {
        if self
            .restore_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("Restore operation already in progress");
        }

        // Ensure we release the guard on exit (success or failure)
        let _guard = RestoreGuard {
            flag: &self.restore_in_progress,
        };

        let state = self.load().await?;

        if state.bots.is_empty() {
            tracing::info!("No bots to restore");
            return Ok(());
        }

        tracing::info!(bots = state.bots.len(), "Restoring bots from state");

        let mut restored = 0;
        let mut failed = 0;
        for config in state.bots {
            let bot_id = config.bot_id.clone();
            match self.registry.mount(config).await {
                Ok(_) => restored += 1,
                Err(e) => {
                    tracing::error!(bot_id = %bot_id, error = %e, "Failed to restore bot");
                    failed += 1;
                }
            }
        }

        tracing::info!(restored, failed, "Bot restoration complete");
        Ok(())
    }
}

/// RAII guard to ensure restore_in_progress flag is cleared on drop
struct RestoreGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
