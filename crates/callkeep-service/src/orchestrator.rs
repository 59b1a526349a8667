//! Call orchestrator: connects the lifecycle engine to the service host.
//!
//! The `CallOrchestrator` trait is the whole surface a host needs: submit an
//! action, observe decisions. `EngineOrchestrator` is the production
//! implementation backed by [`LifecycleEngine`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callkeep_core::{Action, ActionTicket, SessionStore};
use callkeep_engine::{DecisionStream, EngineConfig, EngineError, LifecycleEngine, Published};
use callkeep_settings::OrchestratorSettings;

/// Trait for orchestrating the call service lifecycle.
#[async_trait]
pub trait CallOrchestrator: Send + Sync {
    /// Enqueue an action. Never blocks, never fails.
    fn submit(&self, action: Action) -> ActionTicket;

    /// Live decisions, replaying the latest one.
    fn observe_decisions(&self) -> DecisionStream;

    async fn shutdown(&self) -> Result<(), EngineError>;
}

/// Engine tuning derived from user settings.
pub fn engine_config(settings: &OrchestratorSettings) -> EngineConfig {
    EngineConfig {
        queue_capacity: settings.queue_capacity,
        stop_debounce: Duration::from_millis(settings.stop_debounce_ms),
        bind_answer_to_pipeline: settings.bind_answer_to_pipeline,
    }
}

/// Production orchestrator backed by the engine crate.
pub struct EngineOrchestrator {
    engine: LifecycleEngine,
}

impl EngineOrchestrator {
    /// Build and start the engine. Must be called inside a Tokio runtime.
    pub fn start(store: Arc<dyn SessionStore>, config: EngineConfig) -> Result<Self, EngineError> {
        tracing::info!(
            queue_capacity = config.queue_capacity,
            stop_debounce_ms = config.stop_debounce.as_millis() as u64,
            bind_answer = config.bind_answer_to_pipeline,
            "starting call orchestrator"
        );
        let engine = LifecycleEngine::new(store, config);
        engine.start()?;
        Ok(Self { engine })
    }

    pub fn latest(&self) -> Option<Published> {
        self.engine.latest()
    }

    pub fn active_pipelines(&self) -> usize {
        self.engine.active_pipelines()
    }
}

#[async_trait]
impl CallOrchestrator for EngineOrchestrator {
    fn submit(&self, action: Action) -> ActionTicket {
        self.engine.submit(action)
    }

    fn observe_decisions(&self) -> DecisionStream {
        self.engine.subscribe()
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.engine.shutdown();
        self.engine.join().await
    }
}
