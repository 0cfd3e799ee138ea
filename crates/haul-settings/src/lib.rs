//! # haul-settings
//!
//! Layered configuration for the haul server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`HaulSettings::default()`]
//! 2. **Settings file**: `~/.haul/settings.json` (deep-merged over defaults)
//! 3. **Environment**: `HAUL_*` overrides

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, haul_home, load_settings, load_settings_from_path,
    resolve_data_path, settings_path,
};
pub use types::*;
