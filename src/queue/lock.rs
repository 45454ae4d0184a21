//! Mutual exclusion of job execution across worker nodes

use super::store::JobKey;
use crate::error::{NluError, NluResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Lock keyed by job, held from `pending -> training` until a terminal transition
#[async_trait]
pub trait TrainingLock: Send + Sync {
    /// Returns false when another holder owns the key
    async fn try_acquire(&self, key: &JobKey) -> NluResult<bool>;

    /// Extends the hold. Returns false once this holder has lost the key.
    async fn renew(&self, key: &JobKey) -> NluResult<bool>;

    async fn release(&self, key: &JobKey) -> NluResult<()>;

    /// Whether any holder, this one included, currently owns the key
    async fn is_held(&self, key: &JobKey) -> NluResult<bool>;
}

// ============================================================================
// Production Implementations
// ============================================================================

/// In-process lock for single-node deployments
#[derive(Default)]
pub struct LocalLock {
    held: DashSet<JobKey>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrainingLock for LocalLock {
    async fn try_acquire(&self, key: &JobKey) -> NluResult<bool> {
        Ok(self.held.insert(key.clone()))
    }

    async fn renew(&self, key: &JobKey) -> NluResult<bool> {
        Ok(self.held.contains(key))
    }

    async fn release(&self, key: &JobKey) -> NluResult<()> {
        self.held.remove(key);
        Ok(())
    }

    async fn is_held(&self, key: &JobKey) -> NluResult<bool> {
        Ok(self.held.contains(key))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Lease {
    node_id: String,
    expires_at: DateTime<Utc>,
}

/// What a lock file says about its key
#[derive(Debug, PartialEq)]
enum LeaseView {
    Vacant,
    Live,
    Expired,
}

/// Lease files in a shared directory.
///
/// Leases are written to a private file first and published with a hard
/// link, which fails when the lock file exists, so a lock file is never seen
/// half written by its own creator's rivals. A lease left behind by a crashed
/// node expires after `lease`; taking it over first moves the stale file
/// aside, which only one contender can do. Holders must call `renew` well
/// within `lease`.
pub struct FileLeaseLock {
    dir: PathBuf,
    node_id: String,
    lease: Duration,
}

impl FileLeaseLock {
    pub fn new(dir: PathBuf, node_id: impl Into<String>, lease: Duration) -> Self {
        Self {
            dir,
            node_id: node_id.into(),
            lease,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn path_of(&self, key: &JobKey) -> PathBuf {
        self.dir.join(format!("{}.lock", hex::encode(key.to_string())))
    }

    fn scratch_path(&self, key: &JobKey, suffix: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.{}",
            hex::encode(key.to_string()),
            uuid::Uuid::new_v4(),
            suffix
        ))
    }

    fn fresh_lease(&self) -> NluResult<Vec<u8>> {
        let lease = Lease {
            node_id: self.node_id.clone(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.lease)
                    .map_err(|e| NluError::Storage(format!("invalid lease duration: {}", e)))?,
        };
        serde_json::to_vec(&lease).map_err(|e| NluError::Storage(e.to_string()))
    }

    /// Writes a fresh lease of this node to a private file
    async fn stage(&self, key: &JobKey) -> NluResult<PathBuf> {
        let staged = self.scratch_path(key, "tmp");
        let mut file = tokio::fs::File::create(&staged).await?;
        file.write_all(&self.fresh_lease()?).await?;
        file.sync_all().await?;
        Ok(staged)
    }

    async fn read_lease(&self, path: &Path) -> NluResult<Option<Lease>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn view(&self, path: &Path) -> NluResult<LeaseView> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LeaseView::Vacant),
            Err(e) => return Err(e.into()),
        };

        if let Ok(lease) = serde_json::from_slice::<Lease>(&bytes) {
            return Ok(if lease.expires_at > Utc::now() {
                LeaseView::Live
            } else {
                LeaseView::Expired
            });
        }

        // Unreadable: held for one lease period after its last write
        let modified = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LeaseView::Vacant),
            Err(e) => return Err(e.into()),
        };
        let age = modified.elapsed().unwrap_or_default();
        Ok(if age < self.lease {
            LeaseView::Live
        } else {
            LeaseView::Expired
        })
    }

    async fn acquire_staged(&self, key: &JobKey, staged: &Path) -> NluResult<bool> {
        let path = self.path_of(key);
        if publish(staged, &path).await? {
            return Ok(true);
        }

        match self.view(&path).await? {
            LeaseView::Vacant => return publish(staged, &path).await,
            LeaseView::Live => return Ok(false),
            LeaseView::Expired => {}
        }

        let stale = self.scratch_path(key, "stale");
        match tokio::fs::rename(&path, &stale).await {
            Ok(()) => {}
            // Another contender moved it first
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return publish(staged, &path).await;
            }
            Err(e) => return Err(e.into()),
        }

        if self.view(&stale).await? == LeaseView::Live {
            // A rival published a fresh lease since the check: put it back
            let _ = publish(&stale, &path).await;
            let _ = tokio::fs::remove_file(&stale).await;
            return Ok(false);
        }
        let _ = tokio::fs::remove_file(&stale).await;

        tracing::info!(key = %key, node_id = %self.node_id, "Taking over expired training lease");
        publish(staged, &path).await
    }

    /// Atomically replaces the lease file with a fresh one of this node
    async fn overwrite(&self, key: &JobKey) -> NluResult<()> {
        let staged = self.stage(key).await?;
        if let Err(e) = tokio::fs::rename(&staged, self.path_of(key)).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn owned_by_me(&self, key: &JobKey) -> NluResult<bool> {
        Ok(self
            .read_lease(&self.path_of(key))
            .await?
            .is_some_and(|l| l.node_id == self.node_id))
    }
}

/// Links `from` at `to`; false when `to` already exists
async fn publish(from: &Path, to: &Path) -> NluResult<bool> {
    match tokio::fs::hard_link(from, to).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl TrainingLock for FileLeaseLock {
    async fn try_acquire(&self, key: &JobKey) -> NluResult<bool> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let staged = self.stage(key).await?;
        let acquired = self.acquire_staged(key, &staged).await;
        let _ = tokio::fs::remove_file(&staged).await;
        acquired
    }

    async fn renew(&self, key: &JobKey) -> NluResult<bool> {
        if !self.owned_by_me(key).await? {
            return Ok(false);
        }
        self.overwrite(key).await?;
        Ok(true)
    }

    async fn release(&self, key: &JobKey) -> NluResult<()> {
        if self.owned_by_me(key).await? {
            match tokio::fs::remove_file(self.path_of(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn is_held(&self, key: &JobKey) -> NluResult<bool> {
        Ok(self.view(&self.path_of(key)).await? == LeaseView::Live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> JobKey {
        JobKey::new("b1", "en".parse().unwrap())
    }

    #[tokio::test]
    async fn test_local_lock() {
        let lock = LocalLock::new();
        assert!(lock.try_acquire(&key()).await.unwrap());
        assert!(!lock.try_acquire(&key()).await.unwrap());
        assert!(lock.is_held(&key()).await.unwrap());
        assert!(lock.renew(&key()).await.unwrap());
        lock.release(&key()).await.unwrap();
        assert!(!lock.is_held(&key()).await.unwrap());
        assert!(!lock.renew(&key()).await.unwrap());
        assert!(lock.try_acquire(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_lease_excludes_other_nodes() {
        let temp_dir = TempDir::new().unwrap();
        let a = FileLeaseLock::new(temp_dir.path().to_path_buf(), "a", Duration::from_secs(30));
        let b = FileLeaseLock::new(temp_dir.path().to_path_buf(), "b", Duration::from_secs(30));

        assert!(a.try_acquire(&key()).await.unwrap());
        assert!(!b.try_acquire(&key()).await.unwrap());

        // Release by a non-holder does nothing
        b.release(&key()).await.unwrap();
        assert!(!b.try_acquire(&key()).await.unwrap());

        a.release(&key()).await.unwrap();
        assert!(b.try_acquire(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_stolen() {
        let temp_dir = TempDir::new().unwrap();
        let a = FileLeaseLock::new(temp_dir.path().to_path_buf(), "a", Duration::from_millis(20));
        let b = FileLeaseLock::new(temp_dir.path().to_path_buf(), "b", Duration::from_secs(30));

        assert!(a.try_acquire(&key()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(b.try_acquire(&key()).await.unwrap());
        // The previous holder learns it lost the key and cannot renew it back
        assert!(!a.renew(&key()).await.unwrap());
        assert!(!a.owned_by_me(&key()).await.unwrap());
        assert!(b.owned_by_me(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_keeps_lease_alive() {
        let temp_dir = TempDir::new().unwrap();
        let a = FileLeaseLock::new(temp_dir.path().to_path_buf(), "a", Duration::from_millis(100));
        let b = FileLeaseLock::new(temp_dir.path().to_path_buf(), "b", Duration::from_secs(30));

        assert!(a.try_acquire(&key()).await.unwrap());
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(a.renew(&key()).await.unwrap());
        }
        assert!(!b.try_acquire(&key()).await.unwrap());
        assert!(b.is_held(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_half_written_lease_is_held_until_stale() {
        let temp_dir = TempDir::new().unwrap();
        let a = FileLeaseLock::new(temp_dir.path().to_path_buf(), "a", Duration::from_secs(30));
        let b = FileLeaseLock::new(temp_dir.path().to_path_buf(), "b", Duration::from_millis(50));

        // What a crashed writer without staging would leave behind
        std::fs::write(a.path_of(&key()), b"").unwrap();

        assert!(!a.try_acquire(&key()).await.unwrap());
        assert!(a.is_held(&key()).await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!b.is_held(&key()).await.unwrap());
        assert!(b.try_acquire(&key()).await.unwrap());
        assert!(b.owned_by_me(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let temp_dir = TempDir::new().unwrap();
        let nodes: Vec<FileLeaseLock> = (0..8)
            .map(|n| {
                FileLeaseLock::new(
                    temp_dir.path().to_path_buf(),
                    format!("node-{}", n),
                    Duration::from_secs(30),
                )
            })
            .collect();

        let k = key();
        let results =
            futures::future::join_all(nodes.iter().map(|node| node.try_acquire(&k))).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);

        // No staging or stale files are left behind
        let entries = std::fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_is_held_reflects_expiry() {
        let temp_dir = TempDir::new().unwrap();
        let a = FileLeaseLock::new(temp_dir.path().to_path_buf(), "a", Duration::from_millis(20));

        assert!(!a.is_held(&key()).await.unwrap());
        assert!(a.try_acquire(&key()).await.unwrap());
        assert!(a.is_held(&key()).await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!a.is_held(&key()).await.unwrap());
        // A node may take back its own expired lease
        assert!(a.try_acquire(&key()).await.unwrap());
    }
}
