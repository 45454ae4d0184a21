//! Thread-safe bot registry

use crate::bot::Bot;
use crate::config::BotConfig;
use crate::error::{NluError, NluResult};
use crate::language::LanguageCode;
use crate::metrics;
use crate::pipeline::{PredictionPipeline, Understanding};
use crate::queue::{JobKey, TrainingQueue};
use crate::service::NluService;
use crate::sessions::{TrainingSession, TrainingStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};

/// Events that occur during bot lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum BotEvent {
    /// Bot was mounted for the first time
    Mounted(String),
    /// A mounted bot got a new configuration
    Updated(String),
    /// Bot was removed from registry
    Unmounted(String),
}

/// Thread-safe registry of the bots served by this node
pub struct BotRegistry {
    bots: Arc<RwLock<HashMap<String, Arc<Bot>>>>,
    service: Arc<NluService>,
    pipeline: Arc<PredictionPipeline>,
    queue: Arc<TrainingQueue>,
    poll_interval: Duration,
    event_tx: broadcast::Sender<BotEvent>,
}

impl BotRegistry {
    /// Create a new registry
    ///
    /// `poll_interval` is how often bots poll the service while one of their
    /// languages trains.
    pub fn new(
        service: Arc<NluService>,
        queue: Arc<TrainingQueue>,
        poll_interval: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let pipeline = Arc::new(PredictionPipeline::new(
            service.engine().clone(),
            service.repository().clone(),
        ));

        Self {
            bots: Arc::new(RwLock::new(HashMap::new())),
            service,
            pipeline,
            queue,
            poll_interval,
            event_tx,
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BotEvent> {
        self.event_tx.subscribe()
    }

    pub fn queue(&self) -> &Arc<TrainingQueue> {
        &self.queue
    }

    pub fn service(&self) -> &Arc<NluService> {
        &self.service
    }

    /// Mounts a bot, or replaces the configuration of a mounted one.
    ///
    /// Languages the engine does not support are dropped with a warning.
    /// Existing models are loaded; every other language is reported as
    /// needing training.
    pub async fn mount(&self, mut config: BotConfig) -> NluResult<Arc<Bot>> {
        config
            .validate()
            .map_err(|e| NluError::Precondition(e.to_string()))?;

        let supported = self.service.engine().languages();
        let (languages, unsupported): (Vec<LanguageCode>, Vec<LanguageCode>) = config
            .languages
            .iter()
            .cloned()
            .partition(|lang| supported.contains(lang));
        if !unsupported.is_empty() {
            tracing::warn!(
                bot_id = %config.bot_id,
                unsupported = ?unsupported.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "Bot languages not supported by the engine are ignored"
            );
        }

        let previous = self.bots.read().await.get(&config.bot_id).cloned();
        if config.created_at.is_none() {
            config.created_at = previous
                .as_ref()
                .and_then(|p| p.config().created_at)
                .or_else(|| Some(chrono::Utc::now()));
        }

        let bot = Arc::new(Bot::new(
            config,
            languages,
            self.service.clone(),
            self.pipeline.clone(),
            self.poll_interval,
        ));

        // A training of outdated definitions must not finish
        if let Some(previous) = &previous {
            for language in previous.languages() {
                let changed = !bot.speaks(language)
                    || previous.model_id_for(language).ok() != bot.model_id_for(language).ok();
                if changed {
                    self.cancel_if_queued(&JobKey::new(bot.id(), language.clone()))
                        .await?;
                }
            }
        }

        let needs_training = bot.mount().await?;

        let bot_id = bot.id().to_string();
        let total = {
            let mut bots = self.bots.write().await;
            bots.insert(bot_id.clone(), bot.clone());
            bots.len()
        };
        self.queue.register_trainer(&bot_id, bot.clone());

        for language in needs_training {
            self.queue
                .needs_training(&JobKey::new(bot_id.clone(), language))
                .await?;
        }

        metrics::update_bot_count(total);
        tracing::info!(bot_id = %bot_id, total_bots = total, "Bot added to registry");

        let event = if previous.is_some() {
            BotEvent::Updated(bot_id)
        } else {
            BotEvent::Mounted(bot_id)
        };
        let _ = self.event_tx.send(event);

        Ok(bot)
    }

    /// Removes a bot and cancels its queued or running trainings
    pub async fn unmount(&self, bot_id: &str) -> NluResult<()> {
        let (bot, total) = {
            let mut bots = self.bots.write().await;
            let bot = bots.remove(bot_id).ok_or_else(|| NluError::BotNotFound {
                bot_id: bot_id.to_string(),
            })?;
            (bot, bots.len())
        };

        self.queue.unregister_trainer(bot_id);
        for language in bot.languages() {
            self.cancel_if_queued(&JobKey::new(bot_id, language.clone()))
                .await?;
        }

        metrics::update_bot_count(total);
        tracing::info!(bot_id = %bot_id, "Bot removed from registry");

        let _ = self.event_tx.send(BotEvent::Unmounted(bot_id.to_string()));
        Ok(())
    }

    /// Get bot by id
    pub async fn get(&self, bot_id: &str) -> NluResult<Arc<Bot>> {
        self.bots
            .read()
            .await
            .get(bot_id)
            .cloned()
            .ok_or_else(|| NluError::BotNotFound {
                bot_id: bot_id.to_string(),
            })
    }

    /// List all bots
    pub async fn list(&self) -> Vec<Arc<Bot>> {
        let bots = self.bots.read().await;
        bots.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.bots.read().await.len()
    }

    /// Configurations of every mounted bot, as persisted by the state manager
    pub async fn configs(&self) -> Vec<BotConfig> {
        let mut configs: Vec<BotConfig> = self
            .list()
            .await
            .iter()
            .map(|bot| bot.config().clone())
            .collect();
        configs.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        configs
    }

    pub async fn queue_training(
        &self,
        bot_id: &str,
        language: &LanguageCode,
    ) -> NluResult<TrainingSession> {
        let (bot, key) = self.job_of(bot_id, language).await?;
        self.queue.queue_training(&key, bot).await?;
        self.queue.get_training(&key).await
    }

    pub async fn get_training(
        &self,
        bot_id: &str,
        language: &LanguageCode,
    ) -> NluResult<TrainingSession> {
        let (_, key) = self.job_of(bot_id, language).await?;
        self.queue.get_training(&key).await
    }

    pub async fn cancel_training(&self, bot_id: &str, language: &LanguageCode) -> NluResult<()> {
        let (_, key) = self.job_of(bot_id, language).await?;
        self.queue.cancel_training(&key).await
    }

    pub async fn predict(
        &self,
        bot_id: &str,
        text: &str,
        anticipated_language: Option<&LanguageCode>,
    ) -> NluResult<Understanding> {
        self.get(bot_id)
            .await?
            .predict(text, anticipated_language)
            .await
    }

    async fn job_of(&self, bot_id: &str, language: &LanguageCode) -> NluResult<(Arc<Bot>, JobKey)> {
        let bot = self.get(bot_id).await?;
        if !bot.speaks(language) {
            return Err(NluError::Precondition(format!(
                "Bot {} doesn't support language {}",
                bot_id, language
            )));
        }
        Ok((bot, JobKey::new(bot_id, language.clone())))
    }

    async fn cancel_if_queued(&self, key: &JobKey) -> NluResult<()> {
        let session = self.queue.get_training(key).await?;
        if matches!(
            session.status,
            TrainingStatus::TrainingPending | TrainingStatus::Training
        ) {
            self.queue.cancel_training(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::fixtures::bot_config;
    use crate::definitions::fixtures::fly_intent;
    use crate::engine::MockEngine;
    use crate::queue::{QueueOptions, TrainingEvent};
    use crate::repository::ModelRepository;
    use crate::sessions::TrainSessionStore;
    use tempfile::TempDir;

    fn registry(dir: &TempDir, engine: Arc<MockEngine>) -> BotRegistry {
        let service = Arc::new(NluService::new(
            engine,
            Arc::new(ModelRepository::new(dir.path().to_path_buf())),
            Arc::new(TrainSessionStore::new(100, Duration::from_secs(3600))),
            0,
        ));
        let queue = Arc::new(TrainingQueue::in_memory(QueueOptions {
            interval: Duration::from_millis(10),
            watch_interval: Duration::from_millis(10),
            ..Default::default()
        }));
        BotRegistry::new(service, queue, Duration::from_millis(5))
    }

    fn en() -> LanguageCode {
        "en".parse().unwrap()
    }

    fn statuses(rx: &mut broadcast::Receiver<TrainingEvent>) -> Vec<(String, TrainingStatus)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push((event.session.language.to_string(), event.session.status));
        }
        out
    }

    async fn wait_status(registry: &BotRegistry, bot_id: &str, status: TrainingStatus) {
        for _ in 0..500 {
            if registry.get_training(bot_id, &en()).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never reached {}", status);
    }

    #[tokio::test]
    async fn test_mount_and_get() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::new(MockEngine::new(&["en"])));
        let mut events = registry.subscribe_events();
        let mut trainings = registry.queue().subscribe_events();

        let bot = registry.mount(bot_config("b1", &["en"])).await.unwrap();
        assert_eq!(bot.id(), "b1");
        assert!(bot.config().created_at.is_some());
        assert_eq!(registry.count().await, 1);
        assert_eq!(events.try_recv().unwrap(), BotEvent::Mounted("b1".into()));
        assert_eq!(
            statuses(&mut trainings),
            vec![("en".to_string(), TrainingStatus::NeedsTraining)]
        );
    }

    #[tokio::test]
    async fn test_unsupported_languages_are_dropped() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::new(MockEngine::new(&["en"])));

        let bot = registry.mount(bot_config("b1", &["en", "fr"])).await.unwrap();
        assert_eq!(bot.languages(), &[en()]);

        let err = registry
            .queue_training("b1", &"fr".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, NluError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_unknown_bot() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::new(MockEngine::new(&["en"])));

        assert!(matches!(
            registry.unmount("ghost").await,
            Err(NluError::BotNotFound { .. })
        ));
        assert!(matches!(
            registry.predict("ghost", "hello", None).await,
            Err(NluError::BotNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::new(MockEngine::new(&["en"])));

        let mut config = bot_config("b1", &["en"]);
        config.default_language = "fr".parse().unwrap();
        assert!(matches!(
            registry.mount(config).await,
            Err(NluError::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_train_through_queue_then_predict() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::new(MockEngine::new(&["en"])));
        registry.queue().initialize();
        registry.mount(bot_config("b1", &["en"])).await.unwrap();

        let session = registry.queue_training("b1", &en()).await.unwrap();
        assert_eq!(session.status, TrainingStatus::TrainingPending);
        wait_status(&registry, "b1", TrainingStatus::Done).await;

        let understanding = registry.predict("b1", "i want to buy", None).await.unwrap();
        assert_eq!(understanding.prediction.contexts[0].intents[0].name, "buy");

        registry.queue().teardown().await;
    }

    #[tokio::test]
    async fn test_update_only_flags_changed_languages() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::new(MockEngine::new(&["en", "fr"])));
        registry.queue().initialize();
        registry.mount(bot_config("b1", &["en", "fr"])).await.unwrap();

        for lang in ["en", "fr"] {
            registry
                .queue_training("b1", &lang.parse().unwrap())
                .await
                .unwrap();
        }
        wait_status(&registry, "b1", TrainingStatus::Done).await;
        for _ in 0..500 {
            let fr = registry
                .get_training("b1", &"fr".parse().unwrap())
                .await
                .unwrap();
            if fr.status == TrainingStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut trainings = registry.queue().subscribe_events();
        let mut events = registry.subscribe_events();

        let mut config = bot_config("b1", &["en", "fr"]);
        config
            .definitions
            .get_mut(&"fr".parse::<LanguageCode>().unwrap())
            .unwrap()
            .intents
            .push(fly_intent_in_sales());
        registry.mount(config).await.unwrap();

        assert_eq!(events.try_recv().unwrap(), BotEvent::Updated("b1".into()));
        assert_eq!(
            statuses(&mut trainings),
            vec![("fr".to_string(), TrainingStatus::NeedsTraining)]
        );

        registry.queue().teardown().await;
    }

    fn fly_intent_in_sales() -> crate::definitions::IntentDefinition {
        let mut intent = fly_intent();
        intent.contexts = vec!["sales".into()];
        intent.slots.clear();
        intent.utterances = vec!["i want to fly".into()];
        intent
    }

    #[tokio::test]
    async fn test_unmount_cancels_pending_training() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Arc::new(MockEngine::new(&["en"])));
        // Admission loop not started: the job stays pending
        registry.mount(bot_config("b1", &["en"])).await.unwrap();
        registry.queue_training("b1", &en()).await.unwrap();

        let mut events = registry.subscribe_events();
        registry.unmount("b1").await.unwrap();

        assert_eq!(events.try_recv().unwrap(), BotEvent::Unmounted("b1".into()));
        assert_eq!(registry.count().await, 0);
        let key = JobKey::new("b1", en());
        assert_eq!(
            registry.queue().get_training(&key).await.unwrap().status,
            TrainingStatus::NeedsTraining
        );
    }
}
