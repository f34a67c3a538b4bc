//! # relay-settings
//!
//! Configuration for the relay gateway, loaded from three layers (lowest first):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **User file**: `~/.relay/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `RELAY_*` overrides
//!
//! The `providers` list doubles as the provider registry;
//! [`ConfiguredProviders`] implements
//! [`relay_core::provider::ProviderSettingsResolver`] over it.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod providers;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use providers::{ConfiguredProviders, ProviderEntry};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<RelaySettings> = OnceLock::new();

/// Process-wide settings, loaded on first access.
///
/// Falls back to compiled defaults if loading fails.
pub fn get_settings() -> &'static RelaySettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            RelaySettings::default()
        })
    })
}

/// Install `settings` as the process-wide value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: RelaySettings) -> std::result::Result<(), RelaySettings> {
    SETTINGS.set(settings)
}
