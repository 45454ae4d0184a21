//! NLU Manager - Multi-tenant NLU training orchestration and model serving
//!
//! Queues and runs trainings per `(bot, language)` with bounded concurrency,
//! deduplicates them through content-addressed model identities, persists the
//! trained artifacts per tenant secret and serves predictions with language
//! detection and fallback.

pub mod api;
pub mod auth;
pub mod bot;
pub mod config;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod language;
pub mod metrics;
pub mod model_id;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod repository;
pub mod service;
pub mod sessions;
pub mod state;
pub mod storage;

pub use bot::{Bot, BotInfo};
pub use config::{BotConfig, ClusterConfig, ServerConfig};
pub use engine::{Engine, MockEngine, RemoteEngine};
pub use error::{NluError, NluResult};
pub use language::{LanguageCode, ModelsByLanguage};
pub use model_id::{BriefId, ModelId};
pub use pipeline::{PredictionPipeline, Understanding};
pub use queue::{QueueOptions, Trainer, TrainingEvent, TrainingQueue};
pub use registry::{BotEvent, BotRegistry};
pub use repository::ModelRepository;
pub use service::NluService;
pub use sessions::{TrainSessionStore, TrainingSession, TrainingStatus};
pub use state::StateManager;
