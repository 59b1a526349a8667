//! Settings type definitions.
//!
//! Field names are camelCase in JSON. Every section is `#[serde(default)]`
//! so a partial file only overrides what it names.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Upper bound for the action queue capacity.
pub const MAX_QUEUE_CAPACITY: usize = 1024;
/// Upper bound for the stop debounce window.
pub const MAX_STOP_DEBOUNCE_MS: u64 = 60_000;

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallkeepSettings {
    /// Orchestrator tuning.
    pub orchestrator: OrchestratorSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl CallkeepSettings {
    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let capacity = self.orchestrator.queue_capacity;
        if capacity == 0 || capacity > MAX_QUEUE_CAPACITY {
            return Err(SettingsError::InvalidValue(format!(
                "orchestrator.queueCapacity must be within 1..={MAX_QUEUE_CAPACITY}, got {capacity}"
            )));
        }
        if self.orchestrator.stop_debounce_ms > MAX_STOP_DEBOUNCE_MS {
            return Err(SettingsError::InvalidValue(format!(
                "orchestrator.stopDebounceMs must be at most {MAX_STOP_DEBOUNCE_MS}, got {}",
                self.orchestrator.stop_debounce_ms
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorSettings {
    /// Buffered actions before the oldest is dropped.
    pub queue_capacity: usize,
    /// How long a stop decision must stay current before it is forwarded.
    pub stop_debounce_ms: u64,
    /// Abort an in-flight answer attempt when its pipeline is superseded.
    pub bind_answer_to_pipeline: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            stop_debounce_ms: 200,
            bind_answer_to_pipeline: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Per-target level overrides, e.g. `{"callkeep_engine": "debug"}`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub modules: BTreeMap<String, String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Persist warn+ events to SQLite.
    pub persist_warnings: bool,
    /// Where persisted warnings go. Defaults to `~/.callkeep/logs.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_db_path: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
            json: false,
            persist_warnings: false,
            log_db_path: None,
        }
    }
}
