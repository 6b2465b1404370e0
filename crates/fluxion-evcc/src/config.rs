// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use crate::errors::{EvccError, EvccResult};
use crate::sync::VanishedPolicy;
use crate::transport::TransportMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const MIN_UPDATE_INTERVAL_SECS: u64 = 10;

const HA_OPTIONS_PATH: &str = "/data/options.json";

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    7070
}

fn default_update_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_entity_prefix() -> String {
    "evcc".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// Bridge configuration; immutable once a session has started
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub evcc: EvccConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub system: SystemConfig,
}

/// EVCC connection settings
#[derive(Clone, Serialize, Deserialize)]
pub struct EvccConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Only needed when EVCC has authentication enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default)]
    pub transport: TransportMode,

    /// Poll interval; also the degraded-mode interval when streaming is unavailable
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upper bound for establishing the WebSocket before falling back to polling
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for EvccConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            transport: TransportMode::default(),
            update_interval_secs: default_update_interval(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

// Keeps the password out of logs
impl fmt::Debug for EvccConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvccConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("transport", &self.transport)
            .field("update_interval_secs", &self.update_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl EvccConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn has_password(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Which host registry receives the devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryKind {
    HomeAssistant,
    /// Log device changes only
    #[default]
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub kind: RegistryKind,

    /// Home Assistant URL (falls back to HA_BASE_URL env var)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ha_base_url: Option<String>,

    /// Home Assistant long-lived token (falls back to HA_TOKEN env var)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ha_token: Option<String>,

    /// Entity ids become `sensor.{entity_prefix}_{device key}`
    #[serde(default = "default_entity_prefix")]
    pub entity_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::default(),
            ha_base_url: None,
            ha_token: None,
            entity_prefix: default_entity_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub debug_mode: bool,

    /// Install the custom dashboard page on the host
    #[serde(default)]
    pub install_dashboard: bool,

    #[serde(default)]
    pub vanished_devices: VanishedPolicy,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            debug_mode: false,
            install_dashboard: false,
            vanished_devices: VanishedPolicy::default(),
        }
    }
}

impl SystemConfig {
    /// Effective tracing filter directive
    pub fn effective_log_level(&self) -> &str {
        if self.debug_mode {
            "debug"
        } else {
            &self.log_level
        }
    }
}

/// Validation outcome with per-field messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl ValidationResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl AppConfig {
    /// Load configuration.
    ///
    /// Order: explicit path, HA addon options, `config.toml`, `config.json`,
    /// then defaults with environment overrides.
    pub fn load(explicit: Option<&Path>) -> EvccResult<Self> {
        if let Some(path) = explicit {
            let config = Self::load_from_path(path)?;
            info!("✅ Loaded configuration from {}", path.display());
            config.validate()?;
            return Ok(config);
        }

        for candidate in [HA_OPTIONS_PATH, "config.toml", "config.json"] {
            let path = Path::new(candidate);
            if path.exists() {
                let config = Self::load_from_path(path)?;
                info!("✅ Loaded configuration from {}", candidate);
                config.validate()?;
                return Ok(config);
            }
        }

        warn!("No configuration file found, using defaults with environment overrides");
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML or JSON file, chosen by extension
    pub fn load_from_path(path: &Path) -> EvccResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EvccError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&content).map_err(|e| {
                EvccError::ConfigError(format!("Failed to parse {}: {e}", path.display()))
            })
        } else {
            toml::from_str(&content).map_err(|e| {
                EvccError::ConfigError(format!("Failed to parse {}: {e}", path.display()))
            })
        }
    }

    /// Defaults overridden from process environment variables
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through an arbitrary variable lookup
    pub fn from_env_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("EVCC_HOST") {
            config.evcc.host = host;
        }
        if let Some(port) = lookup("EVCC_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            config.evcc.port = port;
        }
        if let Some(password) = lookup("EVCC_PASSWORD") {
            config.evcc.password = Some(password);
        }
        if let Some(transport) = lookup("EVCC_TRANSPORT") {
            match transport.parse::<TransportMode>() {
                Ok(mode) => config.evcc.transport = mode,
                Err(e) => warn!("Ignoring EVCC_TRANSPORT: {}", e),
            }
        }
        if let Some(interval) = lookup("UPDATE_INTERVAL_SECS")
            && let Ok(secs) = interval.parse::<u64>()
        {
            config.evcc.update_interval_secs = secs;
        }
        if let Some(debug_mode) = lookup("DEBUG_MODE")
            && let Ok(enabled) = debug_mode.parse::<bool>()
        {
            config.system.debug_mode = enabled;
        }
        if let Some(url) = lookup("HA_BASE_URL") {
            config.registry.ha_base_url = Some(url);
        }
        if let Some(token) = lookup("HA_TOKEN") {
            config.registry.ha_token = Some(token);
            config.registry.kind = RegistryKind::HomeAssistant;
        }

        config
    }

    /// Validate configuration with detailed error reporting
    pub fn validate_detailed(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        if self.evcc.host.trim().is_empty() {
            result.add_error("evcc.host", "Host cannot be empty");
        }
        if self.evcc.port == 0 {
            result.add_error("evcc.port", "Port must be between 1 and 65535");
        }
        if self.evcc.update_interval_secs < MIN_UPDATE_INTERVAL_SECS {
            result.add_error(
                "evcc.update_interval_secs",
                format!("Must be at least {MIN_UPDATE_INTERVAL_SECS} seconds"),
            );
        }
        if self.evcc.update_interval_secs > 600 {
            result.add_warning(
                "evcc.update_interval_secs",
                format!(
                    "Value is very high ({}s), consider reducing",
                    self.evcc.update_interval_secs
                ),
            );
        }
        if self.evcc.request_timeout_secs == 0 {
            result.add_error("evcc.request_timeout_secs", "Must be positive");
        }
        if self.evcc.connect_timeout_secs == 0 {
            result.add_error("evcc.connect_timeout_secs", "Must be positive");
        }
        if self.evcc.password.as_deref() == Some("") {
            result.add_warning(
                "evcc.password",
                "Empty password is treated as no authentication",
            );
        }

        if self.registry.kind == RegistryKind::HomeAssistant {
            if self.registry.entity_prefix.trim().is_empty() {
                result.add_error("registry.entity_prefix", "Entity prefix cannot be empty");
            }
            if self.registry.ha_token.is_none() {
                result.add_warning(
                    "registry.ha_token",
                    "No token configured, HA_TOKEN environment variable will be required",
                );
            }
        }

        if self.system.log_level.trim().is_empty() {
            result.add_error("system.log_level", "Log level cannot be empty");
        }

        result
    }

    /// Validate configuration, failing on the first error
    pub fn validate(&self) -> EvccResult<()> {
        let result = self.validate_detailed();
        for warning in &result.warnings {
            warn!("⚠️ [CONFIG] {}", warning);
        }
        match result.errors.first() {
            Some(issue) => Err(EvccError::ConfigError(issue.to_string())),
            None => Ok(()),
        }
    }
}
