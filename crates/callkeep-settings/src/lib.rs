//! # callkeep-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`CallkeepSettings::default()`]
//! 2. **User file**: `~/.callkeep/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `CALLKEEP_*` overrides (highest priority)
//!
//! ```no_run
//! let settings = callkeep_settings::load_settings().unwrap_or_default();
//! println!("debounce: {}ms", settings.orchestrator.stop_debounce_ms);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, callkeep_dir, deep_merge, load_settings,
    load_settings_from_path, read_settings_file, settings_path,
};
pub use types::*;
