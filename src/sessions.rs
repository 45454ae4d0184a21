//! In-memory training sessions with bounded retention of finished ones

use crate::language::LanguageCode;
use crate::model_id::ModelId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrainingStatus {
    NeedsTraining,
    TrainingPending,
    Training,
    Done,
    Canceled,
    Errored,
}

impl TrainingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrainingStatus::Done | TrainingStatus::Canceled | TrainingStatus::Errored
        )
    }
}

impl std::fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NeedsTraining => write!(f, "needs-training"),
            Self::TrainingPending => write!(f, "training-pending"),
            Self::Training => write!(f, "training"),
            Self::Done => write!(f, "done"),
            Self::Canceled => write!(f, "canceled"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSession {
    pub key: String,
    pub status: TrainingStatus,
    pub language: LanguageCode,
    pub progress: f64,
}

impl TrainingSession {
    pub fn new(key: impl Into<String>, language: LanguageCode) -> Self {
        Self {
            key: key.into(),
            status: TrainingStatus::TrainingPending,
            language,
            progress: 0.0,
        }
    }

    pub fn with_status(mut self, status: TrainingStatus, progress: f64) -> Self {
        self.status = status;
        self.progress = progress;
        self
    }
}

/// Key of a session: `sha256(model_id + secret)`
pub fn session_key(model_id: &ModelId, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_id.to_string().as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

struct Released {
    session: TrainingSession,
    released_at: Instant,
    generation: u64,
}

#[derive(Default)]
struct Sessions {
    live: HashMap<String, TrainingSession>,
    released: HashMap<String, Released>,
    order: VecDeque<(String, u64)>,
    generation: u64,
}

impl Sessions {
    fn evict(&mut self, capacity: usize) {
        while self.released.len() > capacity {
            let Some((key, generation)) = self.order.pop_front() else {
                break;
            };
            if self
                .released
                .get(&key)
                .is_some_and(|r| r.generation == generation)
            {
                self.released.remove(&key);
            }
        }
        // Drop stale order entries left by re-released or revived keys
        while self
            .order
            .front()
            .is_some_and(|(k, g)| self.released.get(k).is_none_or(|r| r.generation != *g))
        {
            self.order.pop_front();
        }
        self.compact(capacity);
    }

    /// Drops order entries that no longer match a retained session.
    ///
    /// Runs once stale entries could outnumber retained ones, so the
    /// queue stays within twice the retention capacity.
    fn compact(&mut self, capacity: usize) {
        if self.order.len() <= 2 * capacity.max(1) {
            return;
        }
        let released = &self.released;
        self.order
            .retain(|(k, g)| released.get(k).is_some_and(|r| r.generation == *g));
    }
}

/// Live sessions plus a count- and age-bounded cache of released ones.
///
/// A key lives in at most one of the two maps.
pub struct TrainSessionStore {
    sessions: RwLock<Sessions>,
    released_capacity: usize,
    released_ttl: Duration,
}

impl TrainSessionStore {
    pub fn new(released_capacity: usize, released_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(Sessions::default()),
            released_capacity,
            released_ttl,
        }
    }

    pub fn make_session(&self, model_id: &ModelId) -> TrainingSession {
        TrainingSession::new(model_id.to_string(), model_id.language_code.clone())
    }

    pub async fn get(&self, model_id: &ModelId, secret: &str) -> Option<TrainingSession> {
        let key = session_key(model_id, secret);

        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.live.get(&key) {
                return Some(session.clone());
            }
            match sessions.released.get(&key) {
                None => return None,
                Some(r) if r.released_at.elapsed() <= self.released_ttl => {
                    return Some(r.session.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: drop it
        let mut sessions = self.sessions.write().await;
        if sessions
            .released
            .get(&key)
            .is_some_and(|r| r.released_at.elapsed() > self.released_ttl)
        {
            sessions.released.remove(&key);
            sessions.compact(self.released_capacity);
        }
        None
    }

    pub async fn set(&self, model_id: &ModelId, secret: &str, session: TrainingSession) {
        let key = session_key(model_id, secret);
        let mut sessions = self.sessions.write().await;
        sessions.released.remove(&key);
        sessions.live.insert(key, session);
        sessions.compact(self.released_capacity);
    }

    /// Moves a live session into the retention cache
    pub async fn release(&self, model_id: &ModelId, secret: &str) {
        let key = session_key(model_id, secret);
        let mut sessions = self.sessions.write().await;

        let Some(session) = sessions.live.remove(&key) else {
            return;
        };

        sessions.generation += 1;
        let generation = sessions.generation;
        sessions.order.push_back((key.clone(), generation));
        sessions.released.insert(
            key,
            Released {
                session,
                released_at: Instant::now(),
                generation,
            },
        );
        sessions.evict(self.released_capacity);
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.read().await.live.len()
    }

    pub async fn released_count(&self) -> usize {
        self.sessions.read().await.released.len()
    }

    #[cfg(test)]
    async fn order_len(&self) -> usize {
        self.sessions.read().await.order.len()
    }
}
