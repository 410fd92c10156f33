pub mod actions;
pub mod booking;
pub mod clock;
pub mod conditions;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod intent;
pub mod limiter;
pub mod llm;
pub mod mock;
pub mod models;
pub mod queue;
pub mod rule_engine;
pub mod store;
pub mod sweeper;
pub mod template;
pub mod webhook;

use std::sync::Arc;

use clock::Clock;
use config::EngineSettings;
use llm::LlmClient;
use queue::JobQueue;
use store::Store;
use webhook::WebhookSink;

/// Collaborators shared by every task the worker spawns.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub llm: Arc<dyn LlmClient>,
    pub webhooks: Arc<dyn WebhookSink>,
    pub clock: Arc<dyn Clock>,
    pub settings: EngineSettings,
}
