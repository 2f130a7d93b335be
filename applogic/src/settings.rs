// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Layered client configuration.
//!
//! Values are read from `configuration/base.yaml`, then from the file of the
//! running environment (`local.yaml` or `production.yaml`), then from
//! environment variables prefixed with `MYGGV_` that use `__` between
//! nested keys, e.g. `MYGGV_SUPABASE__ANON_KEY=...`.

use std::{path::PathBuf, time::Duration};

use config::{Config, ConfigError, File, Source};
use ggvapiclient::realtime::RealtimeConfig;
use serde::Deserialize;

use crate::{
    connection::ConnectionOptions,
    recovery::{DelayPolicy, RecoveryOptions},
    visibility::DisplayMode,
};

const ENV_PREFIX: &str = "MYGGV";

#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    pub supabase: SupabaseSettings,
    #[serde(default)]
    pub realtime: RealtimeSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
    #[serde(default)]
    pub preferences: PreferencesSettings,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SupabaseSettings {
    pub url: String,
    pub anon_key: String,
}

/// Realtime socket timings, in milliseconds.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RealtimeSettings {
    pub heartbeat_ms: u64,
    pub timeout_ms: u64,
    pub retry_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        let config = RealtimeConfig::default();
        Self {
            heartbeat_ms: millis(config.heartbeat_interval),
            timeout_ms: millis(config.timeout),
            retry_ms: millis(config.retry_interval),
            join_timeout_ms: millis(config.join_timeout),
        }
    }
}

impl From<&RealtimeSettings> for RealtimeConfig {
    fn from(settings: &RealtimeSettings) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(settings.heartbeat_ms),
            timeout: Duration::from_millis(settings.timeout_ms),
            retry_interval: Duration::from_millis(settings.retry_ms),
            join_timeout: Duration::from_millis(settings.join_timeout_ms),
        }
    }
}

/// Per-channel recovery, in milliseconds.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ConnectionSettings {
    pub reconnect_on_visibility: bool,
    pub reconnect_delay_ms: u64,
    /// Added to the reconnect delay of each further channel.
    pub stagger_ms: u64,
    pub staleness_threshold_ms: u64,
    pub liveness_interval_ms: u64,
    pub jitter_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let options = ConnectionOptions::default();
        Self {
            reconnect_on_visibility: options.reconnect_on_visibility,
            reconnect_delay_ms: millis(options.reconnect_delay),
            stagger_ms: millis(crate::aggregator::DEFAULT_JITTER_OFFSET),
            staleness_threshold_ms: millis(options.staleness_threshold),
            liveness_interval_ms: millis(options.liveness_interval),
            jitter_ms: millis(options.jitter),
        }
    }
}

impl ConnectionSettings {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }
}

impl From<&ConnectionSettings> for ConnectionOptions {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            reconnect_on_visibility: settings.reconnect_on_visibility,
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            staleness_threshold: Duration::from_millis(settings.staleness_threshold_ms),
            liveness_interval: Duration::from_millis(settings.liveness_interval_ms),
            jitter: Duration::from_millis(settings.jitter_ms),
            ..Default::default()
        }
    }
}

/// Tab recovery, in milliseconds.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RecoverySettings {
    pub display_mode: DisplayMode,
    pub long_hide_threshold_ms: u64,
    pub probe_timeout_ms: u64,
    pub slow_probe_threshold_ms: u64,
    pub standalone_delay_ms: u64,
    pub browser_delay_ms: u64,
    pub burst_delay_ms: u64,
    pub burst_threshold: usize,
    pub quiet_gap_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        let options = RecoveryOptions::default();
        Self {
            display_mode: options.display_mode,
            long_hide_threshold_ms: millis(options.long_hide_threshold),
            probe_timeout_ms: millis(options.probe_timeout),
            slow_probe_threshold_ms: millis(options.slow_probe_threshold),
            standalone_delay_ms: millis(options.delay.standalone),
            browser_delay_ms: millis(options.delay.browser),
            burst_delay_ms: millis(options.delay.burst),
            burst_threshold: options.delay.burst_threshold,
            quiet_gap_ms: millis(options.delay.quiet_gap),
            jitter_ms: millis(options.delay.jitter),
        }
    }
}

impl From<&RecoverySettings> for RecoveryOptions {
    fn from(settings: &RecoverySettings) -> Self {
        Self {
            display_mode: settings.display_mode,
            long_hide_threshold: Duration::from_millis(settings.long_hide_threshold_ms),
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
            slow_probe_threshold: Duration::from_millis(settings.slow_probe_threshold_ms),
            delay: DelayPolicy {
                standalone: Duration::from_millis(settings.standalone_delay_ms),
                browser: Duration::from_millis(settings.browser_delay_ms),
                burst: Duration::from_millis(settings.burst_delay_ms),
                burst_threshold: settings.burst_threshold,
                quiet_gap: Duration::from_millis(settings.quiet_gap_ms),
                jitter: Duration::from_millis(settings.jitter_ms),
            },
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PreferencesSettings {
    pub path: PathBuf,
}

impl Default for PreferencesSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("myggv-preferences.json"),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

/// The possible runtime environment for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn from_env() -> Result<Self, String> {
        std::env::var("APP_ENVIRONMENT")
            .unwrap_or_else(|_| "local".into())
            .try_into()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{other} is not a supported environment. Use either `local` or `production`."
            )),
        }
    }
}

/// Load the configuration from the `configuration` directory below `base_dir`.
pub fn get_configuration(base_dir: impl Into<PathBuf>) -> Result<Settings, ConfigError> {
    let configuration_directory = base_dir.into().join("configuration");

    // Default to `local` if unspecified.
    let environment = Environment::from_env().map_err(ConfigError::Message)?;

    get_configuration_impl(
        File::from(configuration_directory.join("base")).required(true),
        File::from(configuration_directory.join(environment.as_str())).required(true),
    )
}

/// Load the configuration from the given configuration strings (in YAML format).
pub fn get_configuration_from_str(base: &str, environment: &str) -> Result<Settings, ConfigError> {
    get_configuration_impl(
        File::from_str(base, config::FileFormat::Yaml),
        File::from_str(environment, config::FileFormat::Yaml),
    )
}

fn get_configuration_impl(
    base: impl Source + Send + Sync + 'static,
    environment: impl Source + Send + Sync + 'static,
) -> Result<Settings, ConfigError> {
    Config::builder()
        .add_source(base)
        .add_source(environment)
        // E.g. `MYGGV_RECOVERY__DISPLAY_MODE=standalone`
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?
        .try_deserialize()
}
