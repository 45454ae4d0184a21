//! Training queue
//!
//! Admission control and the per-job state machine:
//! ```text
//! needs-training -> training-pending -> training -> done | canceled | errored
//!        ^                                            |
//!        +--------------------------------------------+
//! ```
//! Job records live in a [`JobStore`] (one record per `(bot, language)`), so
//! a key is structurally never in more than one of pending, training or done.
//! Every node runs its own admission loop; a [`TrainingLock`] taken before
//! `pending -> training` guarantees a single executor per key across the cluster.

pub mod lock;
pub mod store;

pub use lock::{FileLeaseLock, LocalLock, TrainingLock};
pub use store::{FileJobStore, JobKey, JobRecord, JobState, JobStore, MemoryJobStore};

use crate::engine::{ProgressCallback, progress_callback};
use crate::error::{NluError, NluResult};
use crate::language::LanguageCode;
use crate::metrics;
use crate::model_id::ModelId;
use crate::sessions::{TrainingSession, TrainingStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Cooperative cancellation of one training run.
///
/// The queue creates one per admitted job, so a cancel can never reach a
/// run other than the one it was meant for.
#[derive(Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn channel() -> (CancelTrigger, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelTrigger(tx), Self(rx))
    }

    /// A signal nobody can trigger
    pub fn never() -> Self {
        Self::channel().1
    }

    pub fn is_canceled(&self) -> bool {
        *self.0.borrow()
    }
}

pub struct CancelTrigger(watch::Sender<bool>);

impl CancelTrigger {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Handle through which the queue drives one tenant's trainings
#[async_trait]
pub trait Trainer: Send + Sync {
    /// Trains `language`. Once `cancel` fires, fails with `TrainingCanceled`
    /// as soon as the training can be stopped.
    async fn train(
        &self,
        language: &LanguageCode,
        progress: ProgressCallback,
        cancel: CancelSignal,
    ) -> NluResult<ModelId>;

    /// Makes the most recent model of `language` the active one
    async fn load_latest(&self, language: &LanguageCode) -> NluResult<()>;
}

/// Status notification for one tenant
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingEvent {
    pub bot_id: String,
    pub session: TrainingSession,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub node_id: String,
    /// Concurrent trainings allowed on this node
    pub max_training: usize,
    /// Admission loop period
    pub interval: Duration,
    /// Period of lease renewal and remote-cancel checks while training
    pub watch_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            max_training: 2,
            interval: Duration::from_secs(2),
            watch_interval: Duration::from_secs(1),
        }
    }
}

/// A job executing on this node
struct ActiveJob {
    trigger: Arc<CancelTrigger>,
    /// Flips once the run has recorded its outcome
    finished: watch::Receiver<bool>,
}

pub struct TrainingQueue {
    store: Arc<dyn JobStore>,
    lock: Arc<dyn TrainingLock>,
    options: QueueOptions,
    /// Trainers registered on this node, by bot
    trainers: DashMap<String, Arc<dyn Trainer>>,
    /// Jobs executing on this node
    active: DashMap<JobKey, ActiveJob>,
    /// Serializes read-modify-write of job records on this node
    transitions: Mutex<()>,
    event_tx: broadcast::Sender<TrainingEvent>,
    consumer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TrainingQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        lock: Arc<dyn TrainingLock>,
        options: QueueOptions,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            store,
            lock,
            options,
            trainers: DashMap::new(),
            active: DashMap::new(),
            transitions: Mutex::new(()),
            event_tx,
            consumer: std::sync::Mutex::new(None),
        }
    }

    /// Single-node queue
    pub fn in_memory(options: QueueOptions) -> Self {
        Self::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(LocalLock::new()),
            options,
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TrainingEvent> {
        self.event_tx.subscribe()
    }

    /// Logs every status notification until the queue is dropped
    pub fn spawn_event_logger(&self) -> JoinHandle<()> {
        let mut events = self.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.session.status == TrainingStatus::Training => {
                        tracing::debug!(
                            bot_id = %event.bot_id,
                            key = %event.session.key,
                            progress = event.session.progress,
                            "Training status"
                        );
                    }
                    Ok(event) => {
                        tracing::info!(
                            bot_id = %event.bot_id,
                            key = %event.session.key,
                            status = %event.session.status,
                            "Training status"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Training status notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn node_id(&self) -> &str {
        &self.options.node_id
    }

    /// Makes this node able to execute the jobs of `bot_id`
    pub fn register_trainer(&self, bot_id: &str, trainer: Arc<dyn Trainer>) {
        self.trainers.insert(bot_id.to_string(), trainer);
    }

    pub fn unregister_trainer(&self, bot_id: &str) {
        self.trainers.remove(bot_id);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Starts the admission loop
    pub fn initialize(self: &Arc<Self>) {
        let queue = Arc::downgrade(self);
        let period = self.options.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                if let Err(e) = queue.run_task().await {
                    tracing::warn!(error = %e, "Training admission failed");
                }
            }
        });

        if let Some(previous) = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            previous.abort();
        }

        tracing::info!(
            node_id = %self.options.node_id,
            max_training = self.options.max_training,
            interval_ms = period.as_millis() as u64,
            "Training queue started"
        );
    }

    /// Stops admission, drops pending and done jobs of this node's bots and
    /// cooperatively cancels every training running here
    pub async fn teardown(&self) {
        if let Some(handle) = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        {
            let _guard = self.transitions.lock().await;
            match self.store.list().await {
                Ok(records) => {
                    for record in records {
                        let local = self.trainers.contains_key(&record.key.bot_id);
                        if local && record.state != JobState::Training {
                            let _ = self.store.remove(&record.key).await;
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Could not clear job records on teardown"),
            }
        }

        let running: Vec<(JobKey, watch::Receiver<bool>)> = self
            .active
            .iter()
            .map(|job| {
                job.trigger.cancel();
                (job.key().clone(), job.finished.clone())
            })
            .collect();

        for (key, mut finished) in running {
            tracing::info!(key = %key, "Canceling training on teardown");
            if finished.wait_for(|done| *done).await.is_err() {
                tracing::warn!(key = %key, "Training ended without acknowledging the cancel");
                let _guard = self.transitions.lock().await;
                self.remove_if_owned(&key).await;
                self.finish(&key).await;
            }
        }

        tracing::info!(node_id = %self.options.node_id, "Training queue stopped");
    }

    /// Reports that `key` needs training, unless it is training right now
    pub async fn needs_training(&self, key: &JobKey) -> NluResult<()> {
        {
            let _guard = self.transitions.lock().await;
            match self.store.get(key).await? {
                Some(record) if record.state == JobState::Training => return Ok(()),
                Some(record) if record.state == JobState::Done => {
                    self.store.remove(key).await?;
                }
                _ => {}
            }
        }

        self.emit(key, TrainingStatus::NeedsTraining, 0.0);
        Ok(())
    }

    /// Queues `key` for training with `trainer`, unless it is training right now
    pub async fn queue_training(&self, key: &JobKey, trainer: Arc<dyn Trainer>) -> NluResult<()> {
        self.register_trainer(&key.bot_id, trainer);

        {
            let _guard = self.transitions.lock().await;
            if let Some(record) = self.store.get(key).await?
                && record.state == JobState::Training
            {
                return Ok(());
            }
            // Replaces a stale done record, or refreshes a pending one to the top
            self.store.put(JobRecord::pending(key.clone())).await?;
        }

        tracing::info!(key = %key, "Training queued");
        self.emit(key, TrainingStatus::TrainingPending, 0.0);
        Ok(())
    }

    /// Emits `canceled`, cancels the job wherever it is, then emits `needs-training`
    pub async fn cancel_training(&self, key: &JobKey) -> NluResult<()> {
        self.emit(key, TrainingStatus::Canceled, 0.0);

        let running_here = {
            let _guard = self.transitions.lock().await;
            match self.store.get(key).await? {
                Some(r) if r.state == JobState::Pending => {
                    self.store.remove(key).await?;
                    None
                }
                Some(r) if r.state == JobState::Training => {
                    let local = self.active.get(key).map(|job| {
                        job.trigger.cancel();
                        job.finished.clone()
                    });
                    if local.is_none() {
                        // Running elsewhere: the owner's watchdog picks this up
                        self.store.request_cancel(key).await?;
                    }
                    local
                }
                _ => None,
            }
        };

        tracing::info!(key = %key, "Training canceled");
        metrics::record_training_finished(key.language.as_str(), "canceled");

        match running_here {
            // The run removes the job and reports needs-training once it stops
            Some(mut finished) => {
                if finished.wait_for(|done| *done).await.is_err() {
                    self.emit(key, TrainingStatus::NeedsTraining, 0.0);
                }
            }
            None => self.emit(key, TrainingStatus::NeedsTraining, 0.0),
        }
        Ok(())
    }

    /// Session derived from where the job currently is
    pub async fn get_training(&self, key: &JobKey) -> NluResult<TrainingSession> {
        let (status, progress) = match self.store.get(key).await? {
            Some(r) if r.state == JobState::Training => (TrainingStatus::Training, r.progress),
            Some(r) if r.state == JobState::Done => (TrainingStatus::Done, 1.0),
            Some(_) => (TrainingStatus::TrainingPending, 0.0),
            None => (TrainingStatus::NeedsTraining, 0.0),
        };
        Ok(self.session(key, status, progress))
    }

    /// One admission tick: fills free slots with the most recently queued jobs
    async fn run_task(self: &Arc<Self>) -> NluResult<()> {
        let _guard = self.transitions.lock().await;

        self.recover_abandoned().await?;

        let mut pending = self.store.list_in(JobState::Pending).await?;
        metrics::update_queue_sizes(pending.len(), self.active.len());

        if self.active.len() >= self.options.max_training || pending.is_empty() {
            return Ok(());
        }

        // Latest request first
        pending.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));

        for candidate in pending {
            if self.active.len() >= self.options.max_training {
                break;
            }
            let Some(trainer) = self
                .trainers
                .get(&candidate.key.bot_id)
                .map(|t| t.value().clone())
            else {
                continue;
            };
            let key = candidate.key;

            if !self.lock.try_acquire(&key).await? {
                continue;
            }

            // Another node may have taken and finished it since the listing
            let Some(mut record) = self
                .store
                .get(&key)
                .await?
                .filter(|r| r.state == JobState::Pending)
            else {
                self.lock.release(&key).await?;
                continue;
            };

            record.state = JobState::Training;
            record.progress = 0.0;
            record.owner = Some(self.options.node_id.clone());
            self.store.put(record).await?;
            // A request aimed at a previous run of this key
            self.store.take_cancel_request(&key).await?;

            let (trigger, signal) = CancelSignal::channel();
            let trigger = Arc::new(trigger);
            let (finished_tx, finished) = watch::channel(false);
            self.active.insert(
                key.clone(),
                ActiveJob {
                    trigger: trigger.clone(),
                    finished,
                },
            );

            tracing::info!(key = %key, node_id = %self.options.node_id, "Training admitted");
            metrics::record_training_started(key.language.as_str());

            let queue = self.clone();
            tokio::spawn(async move {
                queue.run_training(key, trainer, trigger, signal).await;
                finished_tx.send_replace(true);
            });
        }

        Ok(())
    }

    /// Puts back jobs left in training by a node that died holding them.
    /// Callers hold `transitions`.
    async fn recover_abandoned(&self) -> NluResult<()> {
        for record in self.store.list_in(JobState::Training).await? {
            let key = record.key;
            if self.active.contains_key(&key) || self.lock.is_held(&key).await? {
                continue;
            }

            tracing::warn!(
                key = %key,
                owner = ?record.owner,
                "Requeueing training abandoned by its node"
            );
            self.store.put(JobRecord::pending(key.clone())).await?;
            self.emit(&key, TrainingStatus::TrainingPending, 0.0);
        }
        Ok(())
    }

    async fn run_training(
        self: Arc<Self>,
        key: JobKey,
        trainer: Arc<dyn Trainer>,
        trigger: Arc<CancelTrigger>,
        signal: CancelSignal,
    ) {
        let watchdog = self.spawn_watchdog(key.clone(), trigger);

        let queue = Arc::downgrade(&self);
        let progress_key = key.clone();
        let progress = progress_callback(move |p| {
            let queue = queue.clone();
            let key = progress_key.clone();
            async move {
                if let Some(queue) = queue.upgrade() {
                    queue.on_progress(&key, p).await;
                }
            }
        });

        // Canceled between admission and now
        let result = if signal.is_canceled() {
            Err(NluError::TrainingCanceled)
        } else {
            trainer.train(&key.language, progress, signal.clone()).await
        };
        watchdog.abort();

        // Recorded under the same lock a cancel takes, so a cancel either
        // lands before the job is done or finds it done
        let result = {
            let _guard = self.transitions.lock().await;
            let record = match self.store.get(&key).await {
                Ok(record) => record.filter(|r| self.owns(r)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Could not read job record");
                    None
                }
            };

            match (result, record) {
                // A cancel or a lost lease wins over whatever the run produced
                (_, None) => Err(NluError::TrainingCanceled),
                (_, Some(_)) if signal.is_canceled() => Err(NluError::TrainingCanceled),
                (Ok(model_id), Some(mut record)) => {
                    record.state = JobState::Done;
                    record.progress = 1.0;
                    record.owner = None;
                    if let Err(e) = self.store.put(record).await {
                        tracing::warn!(key = %key, error = %e, "Could not record finished training");
                    }
                    Ok(model_id)
                }
                (Err(e), Some(_)) => Err(e),
            }
        };

        match result {
            Ok(model_id) => {
                self.emit(&key, TrainingStatus::Done, 1.0);

                if let Err(e) = trainer.load_latest(&key.language).await {
                    tracing::warn!(key = %key, model_id = %model_id, error = %e, "Could not load trained model");
                }

                tracing::info!(key = %key, model_id = %model_id, "Training done");
                metrics::record_training_finished(key.language.as_str(), "done");
                self.finish(&key).await;
            }
            Err(e) if e.is_training_canceled() => {
                tracing::info!(key = %key, "Training cancelled");
                let removed = {
                    let _guard = self.transitions.lock().await;
                    self.remove_if_owned(&key).await
                };
                self.finish(&key).await;
                if removed {
                    self.emit(&key, TrainingStatus::NeedsTraining, 0.0);
                }
            }
            Err(e) if e.is_training_already_started() => {
                tracing::info!(key = %key, "Training already started");
                self.active.remove(&key);
            }
            Err(e) => {
                tracing::error!(
                    key = %key,
                    error = %e,
                    "Training could not finish because of an unexpected error"
                );
                {
                    let _guard = self.transitions.lock().await;
                    self.remove_if_owned(&key).await;
                }
                metrics::record_training_finished(key.language.as_str(), "errored");
                self.finish(&key).await;
                self.emit(&key, TrainingStatus::Errored, 0.0);
            }
        }
    }

    /// Renews the lease and honours cancel requests from other nodes.
    /// A run whose lease was lost is canceled: another node may own it now.
    fn spawn_watchdog(self: &Arc<Self>, key: JobKey, trigger: Arc<CancelTrigger>) -> JoinHandle<()> {
        let queue = Arc::downgrade(self);
        let period = self.options.watch_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(queue) = Weak::upgrade(&queue) else {
                    break;
                };
                match queue.lock.renew(&key).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(key = %key, "Training lease lost, canceling");
                        trigger.cancel();
                        break;
                    }
                    Err(e) => tracing::warn!(key = %key, error = %e, "Could not renew training lease"),
                }
                if let Ok(true) = queue.store.take_cancel_request(&key).await {
                    tracing::info!(key = %key, "Cancel requested by another node");
                    trigger.cancel();
                    break;
                }
            }
        })
    }

    async fn on_progress(&self, key: &JobKey, progress: f64) {
        {
            let _guard = self.transitions.lock().await;
            match self.store.get(key).await {
                Ok(Some(mut record)) if self.owns(&record) => {
                    record.progress = progress;
                    if let Err(e) = self.store.put(record).await {
                        tracing::warn!(key = %key, error = %e, "Could not record training progress");
                    }
                }
                // Canceled meanwhile: do not resurrect the job
                _ => return,
            }
        }

        tracing::debug!(key = %key, progress, "Training progress");
        self.emit(key, TrainingStatus::Training, progress);
    }

    fn owns(&self, record: &JobRecord) -> bool {
        record.state == JobState::Training
            && record.owner.as_deref() == Some(self.options.node_id.as_str())
    }

    /// Removes the record if this node is executing it. Callers hold `transitions`.
    async fn remove_if_owned(&self, key: &JobKey) -> bool {
        match self.store.get(key).await {
            Ok(Some(record)) if self.owns(&record) => self.store.remove(key).await.is_ok(),
            _ => false,
        }
    }

    /// Frees the local slot and the cluster lock
    async fn finish(&self, key: &JobKey) {
        self.active.remove(key);
        if let Err(e) = self.lock.release(key).await {
            tracing::warn!(key = %key, error = %e, "Could not release training lock");
        }
    }

    fn session(&self, key: &JobKey, status: TrainingStatus, progress: f64) -> TrainingSession {
        TrainingSession {
            key: key.to_string(),
            status,
            language: key.language.clone(),
            progress,
        }
    }

    fn emit(&self, key: &JobKey, status: TrainingStatus, progress: f64) {
        // No subscribers is fine
        let _ = self.event_tx.send(TrainingEvent {
            bot_id: key.bot_id.clone(),
            session: self.session(key, status, progress),
        });
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::mocks::MockTrainer;
    use super::*;
    use tempfile::TempDir;

    fn key(bot: &str, lang: &str) -> JobKey {
        JobKey::new(bot, lang.parse().unwrap())
    }

    fn options(max_training: usize) -> QueueOptions {
        QueueOptions {
            node_id: "node-a".into(),
            max_training,
            interval: Duration::from_millis(10),
            watch_interval: Duration::from_millis(10),
        }
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn drain(rx: &mut broadcast::Receiver<TrainingEvent>) -> Vec<TrainingStatus> {
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            statuses.push(event.session.status);
        }
        statuses
    }

    async fn status(queue: &TrainingQueue, key: &JobKey) -> TrainingStatus {
        queue.get_training(key).await.unwrap().status
    }

    #[tokio::test]
    async fn test_at_most_n_concurrent_trainings() {
        let queue = Arc::new(TrainingQueue::in_memory(options(2)));
        let trainer = Arc::new(MockTrainer::new(5, Duration::from_millis(10)));

        for bot in ["b1", "b2", "b3", "b4", "b5"] {
            queue
                .queue_training(&key(bot, "en"), trainer.clone())
                .await
                .unwrap();
        }
        queue.initialize();

        let keys: Vec<JobKey> = ["b1", "b2", "b3", "b4", "b5"]
            .iter()
            .map(|b| key(b, "en"))
            .collect();

        // Sample the store while the queue drains
        for _ in 0..200 {
            let training = queue
                .store
                .list_in(JobState::Training)
                .await
                .unwrap()
                .len();
            assert!(training <= 2);
            assert!(queue.active_count() <= 2);

            let mut done = 0;
            for k in &keys {
                if status(&queue, k).await == TrainingStatus::Done {
                    done += 1;
                }
            }
            if done == keys.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for k in &keys {
            assert_eq!(status(&queue, k).await, TrainingStatus::Done);
        }
        assert!(trainer.max_concurrent() <= 2);
        assert_eq!(trainer.train_calls(), 5);
        queue.teardown().await;
    }

    #[tokio::test]
    async fn test_latest_queued_is_admitted_first() {
        let queue = Arc::new(TrainingQueue::in_memory(options(1)));
        let trainer = Arc::new(MockTrainer::new(50, Duration::from_millis(10)));

        for bot in ["b1", "b2", "b3"] {
            queue
                .queue_training(&key(bot, "en"), trainer.clone())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        queue.run_task().await.unwrap();

        assert_eq!(status(&queue, &key("b3", "en")).await, TrainingStatus::Training);
        assert_eq!(
            status(&queue, &key("b1", "en")).await,
            TrainingStatus::TrainingPending
        );
        assert_eq!(
            status(&queue, &key("b2", "en")).await,
            TrainingStatus::TrainingPending
        );
        queue.teardown().await;
    }

    #[tokio::test]
    async fn test_queue_emits_pending_and_is_noop_while_training() {
        let queue = Arc::new(TrainingQueue::in_memory(options(1)));
        let trainer = Arc::new(MockTrainer::new(50, Duration::from_millis(10)));
        let mut rx = queue.subscribe_events();
        let k = key("b1", "en");

        queue.queue_training(&k, trainer.clone()).await.unwrap();
        assert_eq!(drain(&mut rx), vec![TrainingStatus::TrainingPending]);

        queue.run_task().await.unwrap();
        assert_eq!(status(&queue, &k).await, TrainingStatus::Training);

        queue.queue_training(&k, trainer.clone()).await.unwrap();
        queue.needs_training(&k).await.unwrap();
        let statuses = drain(&mut rx);
        assert!(!statuses.contains(&TrainingStatus::TrainingPending));
        assert!(!statuses.contains(&TrainingStatus::NeedsTraining));
        assert_eq!(status(&queue, &k).await, TrainingStatus::Training);

        queue.teardown().await;
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let queue = Arc::new(TrainingQueue::in_memory(options(1)));
        let trainer = Arc::new(MockTrainer::new(5, Duration::from_millis(10)));
        let k = key("b1", "en");

        queue.queue_training(&k, trainer.clone()).await.unwrap();
        let mut rx = queue.subscribe_events();

        queue.cancel_training(&k).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![TrainingStatus::Canceled, TrainingStatus::NeedsTraining]
        );
        assert_eq!(status(&queue, &k).await, TrainingStatus::NeedsTraining);
        assert_eq!(trainer.cancel_calls(), 0);
        assert!(queue.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_job_is_cooperative() {
        let queue = Arc::new(TrainingQueue::in_memory(options(1)));
        let trainer = Arc::new(MockTrainer::new(100, Duration::from_millis(10)));
        let k = key("b1", "en");

        queue.queue_training(&k, trainer.clone()).await.unwrap();
        queue.run_task().await.unwrap();
        wait_for(|| async { trainer.train_calls() == 1 }).await;

        let mut rx = queue.subscribe_events();
        queue.cancel_training(&k).await.unwrap();

        assert_eq!(trainer.cancel_calls(), 1);
        let statuses = drain(&mut rx);
        assert_eq!(statuses.first(), Some(&TrainingStatus::Canceled));
        assert_eq!(statuses.last(), Some(&TrainingStatus::NeedsTraining));
        assert_eq!(status(&queue, &k).await, TrainingStatus::NeedsTraining);

        // The continuation winds down without reporting an error
        wait_for(|| async { queue.active_count() == 0 }).await;
        assert!(!drain(&mut rx).contains(&TrainingStatus::Errored));
        assert_eq!(status(&queue, &k).await, TrainingStatus::NeedsTraining);
    }

    #[tokio::test]
    async fn test_done_then_needs_training() {
        let queue = Arc::new(TrainingQueue::in_memory(options(2)));
        let trainer = Arc::new(MockTrainer::new(2, Duration::from_millis(5)));
        let mut rx = queue.subscribe_events();
        let k = key("b1", "fr");

        queue.queue_training(&k, trainer.clone()).await.unwrap();
        queue.run_task().await.unwrap();
        wait_for(|| async { status(&queue, &k).await == TrainingStatus::Done }).await;

        let session = queue.get_training(&k).await.unwrap();
        assert_eq!(session.progress, 1.0);
        assert_eq!(session.key, "training:b1:fr");
        assert_eq!(trainer.loaded.lock().unwrap().as_slice(), &[k.language.clone()]);

        let statuses = drain(&mut rx);
        assert_eq!(statuses.first(), Some(&TrainingStatus::TrainingPending));
        assert!(statuses.contains(&TrainingStatus::Training));
        assert_eq!(statuses.last(), Some(&TrainingStatus::Done));

        queue.needs_training(&k).await.unwrap();
        assert_eq!(drain(&mut rx), vec![TrainingStatus::NeedsTraining]);
        assert_eq!(status(&queue, &k).await, TrainingStatus::NeedsTraining);
    }

    #[tokio::test]
    async fn test_failed_training_is_errored() {
        let queue = Arc::new(TrainingQueue::in_memory(options(1)));
        let trainer = Arc::new(MockTrainer::new(1, Duration::from_millis(5)).failing());
        let mut rx = queue.subscribe_events();
        let k = key("b1", "en");

        queue.queue_training(&k, trainer.clone()).await.unwrap();
        queue.run_task().await.unwrap();
        wait_for(|| async { queue.active_count() == 0 }).await;

        assert_eq!(drain(&mut rx).last(), Some(&TrainingStatus::Errored));
        assert_eq!(status(&queue, &k).await, TrainingStatus::NeedsTraining);
        assert!(trainer.loaded.lock().unwrap().is_empty());

        // The lock was released: the job can run again
        queue.queue_training(&k, trainer.clone()).await.unwrap();
        queue.run_task().await.unwrap();
        wait_for(|| async { trainer.train_calls() == 2 }).await;
    }

    #[tokio::test]
    async fn test_teardown_cancels_running_and_clears_pending() {
        let queue = Arc::new(TrainingQueue::in_memory(options(1)));
        let trainer = Arc::new(MockTrainer::new(100, Duration::from_millis(10)));

        queue
            .queue_training(&key("b1", "en"), trainer.clone())
            .await
            .unwrap();
        queue.run_task().await.unwrap();
        queue
            .queue_training(&key("b2", "en"), trainer.clone())
            .await
            .unwrap();
        wait_for(|| async { trainer.train_calls() == 1 }).await;

        queue.teardown().await;

        assert_eq!(trainer.cancel_calls(), 1);
        assert_eq!(queue.active_count(), 0);
        assert!(queue.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_executor_across_nodes() {
        let temp_dir = TempDir::new().unwrap();
        let make_node = |node: &str| {
            let mut opts = options(2);
            opts.node_id = node.to_string();
            Arc::new(TrainingQueue::new(
                Arc::new(FileJobStore::new(temp_dir.path().join("jobs"))),
                Arc::new(FileLeaseLock::new(
                    temp_dir.path().join("locks"),
                    node,
                    Duration::from_secs(30),
                )),
                opts,
            ))
        };
        let a = make_node("node-a");
        let b = make_node("node-b");

        let trainer_a = Arc::new(MockTrainer::new(10, Duration::from_millis(10)));
        let trainer_b = Arc::new(MockTrainer::new(10, Duration::from_millis(10)));
        a.register_trainer("b1", trainer_a.clone());
        b.register_trainer("b1", trainer_b.clone());

        let k = key("b1", "en");
        a.queue_training(&k, trainer_a.clone()).await.unwrap();

        let (ra, rb) = tokio::join!(a.run_task(), b.run_task());
        ra.unwrap();
        rb.unwrap();

        wait_for(|| async { status(&a, &k).await == TrainingStatus::Done }).await;
        assert_eq!(trainer_a.train_calls() + trainer_b.train_calls(), 1);
        // Both nodes see the same state
        assert_eq!(status(&b, &k).await, TrainingStatus::Done);
        // Admission after completion does not run it again
        let (ra, rb) = tokio::join!(a.run_task(), b.run_task());
        ra.unwrap();
        rb.unwrap();
        assert_eq!(trainer_a.train_calls() + trainer_b.train_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_from_another_node() {
        let temp_dir = TempDir::new().unwrap();
        let make_node = |node: &str| {
            let mut opts = options(2);
            opts.node_id = node.to_string();
            Arc::new(TrainingQueue::new(
                Arc::new(FileJobStore::new(temp_dir.path().join("jobs"))),
                Arc::new(FileLeaseLock::new(
                    temp_dir.path().join("locks"),
                    node,
                    Duration::from_secs(30),
                )),
                opts,
            ))
        };
        let a = make_node("node-a");
        let b = make_node("node-b");
        let trainer = Arc::new(MockTrainer::new(200, Duration::from_millis(10)));

        let k = key("b1", "en");
        a.queue_training(&k, trainer.clone()).await.unwrap();
        a.run_task().await.unwrap();
        wait_for(|| async { trainer.train_calls() == 1 }).await;

        b.cancel_training(&k).await.unwrap();

        wait_for(|| async { a.active_count() == 0 }).await;
        assert_eq!(trainer.cancel_calls(), 1);
        assert_eq!(status(&b, &k).await, TrainingStatus::NeedsTraining);
    }

    #[tokio::test]
    async fn test_cancel_right_after_admission_wins_over_completion() {
        let queue = Arc::new(TrainingQueue::in_memory(options(1)));
        // Completes without ever looking at its cancel signal
        let trainer = Arc::new(
            MockTrainer::new(0, Duration::ZERO).with_start_delay(Duration::from_millis(30)),
        );
        let k = key("b1", "en");

        queue.queue_training(&k, trainer.clone()).await.unwrap();
        let mut rx = queue.subscribe_events();

        queue.run_task().await.unwrap();
        queue.cancel_training(&k).await.unwrap();

        // The cancel returns only once the run has stopped
        assert_eq!(queue.active_count(), 0);
        let statuses = drain(&mut rx);
        assert_eq!(statuses.first(), Some(&TrainingStatus::Canceled));
        assert_eq!(statuses.last(), Some(&TrainingStatus::NeedsTraining));
        assert!(!statuses.contains(&TrainingStatus::Done));
        assert!(trainer.loaded.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(status(&queue, &k).await, TrainingStatus::NeedsTraining);
    }

    #[tokio::test]
    async fn test_training_abandoned_by_dead_node_is_recovered() {
        let temp_dir = TempDir::new().unwrap();
        let jobs = temp_dir.path().join("jobs");
        let locks = temp_dir.path().join("locks");
        let k = key("b1", "en");

        // A node took the job, then died without renewing its lease
        let dead = FileLeaseLock::new(locks.clone(), "node-dead", Duration::from_millis(200));
        assert!(dead.try_acquire(&k).await.unwrap());
        let mut record = JobRecord::pending(k.clone());
        record.state = JobState::Training;
        record.owner = Some("node-dead".into());
        FileJobStore::new(jobs.clone()).put(record).await.unwrap();

        let mut opts = options(1);
        opts.node_id = "node-alive".into();
        let alive = Arc::new(TrainingQueue::new(
            Arc::new(FileJobStore::new(jobs)),
            Arc::new(FileLeaseLock::new(locks, "node-alive", Duration::from_secs(30))),
            opts,
        ));
        let trainer = Arc::new(MockTrainer::new(2, Duration::from_millis(5)));
        alive.register_trainer("b1", trainer.clone());

        // Left alone while the lease is live
        alive.run_task().await.unwrap();
        assert_eq!(status(&alive, &k).await, TrainingStatus::Training);
        assert_eq!(trainer.train_calls(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut rx = alive.subscribe_events();
        alive.run_task().await.unwrap();

        wait_for(|| async { status(&alive, &k).await == TrainingStatus::Done }).await;
        assert_eq!(trainer.train_calls(), 1);
        assert_eq!(drain(&mut rx).first(), Some(&TrainingStatus::TrainingPending));
    }

    #[tokio::test]
    async fn test_lost_lease_cancels_run() {
        let temp_dir = TempDir::new().unwrap();
        let locks = temp_dir.path().join("locks");
        let queue = Arc::new(TrainingQueue::new(
            Arc::new(FileJobStore::new(temp_dir.path().join("jobs"))),
            Arc::new(FileLeaseLock::new(locks.clone(), "node-a", Duration::from_secs(30))),
            options(1),
        ));
        let trainer = Arc::new(MockTrainer::new(200, Duration::from_millis(10)));
        let k = key("b1", "en");

        queue.queue_training(&k, trainer.clone()).await.unwrap();
        queue.run_task().await.unwrap();
        wait_for(|| async { trainer.train_calls() == 1 }).await;

        // Another node ends up holding the key
        for entry in std::fs::read_dir(&locks).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }
        let other = FileLeaseLock::new(locks, "node-b", Duration::from_secs(30));
        assert!(other.try_acquire(&k).await.unwrap());

        wait_for(|| async { queue.active_count() == 0 }).await;
        assert_eq!(trainer.cancel_calls(), 1);
        assert!(trainer.loaded.lock().unwrap().is_empty());
        // The stopped run does not release the other node's lease
        assert!(other.is_held(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_event_logger_stops_with_queue() {
        let queue = TrainingQueue::in_memory(options(1));
        let logger = queue.spawn_event_logger();

        queue.needs_training(&key("b1", "en")).await.unwrap();
        drop(queue);

        tokio::time::timeout(Duration::from_secs(1), logger)
            .await
            .unwrap()
            .unwrap();
    }
}
