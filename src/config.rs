//! Engine configuration (v0.1)
//!
//! A JSON service configuration enumerates the engine's service toggles and
//! the log level. A missing or unreadable file falls back to the defaults.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const SERVICE_FLOW_PROVIDER: &str = "flowProvider";
pub const SERVICE_STATE_RECORDER: &str = "stateRecorder";
pub const SERVICE_ENGINE_TESTER: &str = "engineTester";

/// Setting key holding the state recorder endpoint
pub const SETTING_URL: &str = "url";
/// Setting key holding the engine tester port
pub const SETTING_PORT: &str = "port";

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// `DEBUG | INFO | WARN | ERROR`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Toggle and settings of one engine service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_enabled() -> bool {
    true
}

impl EngineConfig {
    /// The default configuration: INFO logging, provider enabled, recorder
    /// and tester disabled.
    pub fn default_config() -> Self {
        Self {
            log_level: default_log_level(),
            services: vec![
                ServiceConfig {
                    name: SERVICE_FLOW_PROVIDER.to_string(),
                    enabled: true,
                    settings: HashMap::new(),
                },
                ServiceConfig {
                    name: SERVICE_STATE_RECORDER.to_string(),
                    enabled: false,
                    settings: HashMap::new(),
                },
                ServiceConfig {
                    name: SERVICE_ENGINE_TESTER.to_string(),
                    enabled: false,
                    settings: HashMap::new(),
                },
            ],
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load from a file; `None` when the file is missing or invalid
    pub fn load_from_file(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).ok()?;
        match Self::from_json(&contents) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid engine configuration");
                None
            }
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Whether a service is present and enabled
    pub fn service_enabled(&self, name: &str) -> bool {
        self.service(name).map(|s| s.enabled).unwrap_or(false)
    }

    /// The tracing filter directive for the configured log level
    pub fn tracing_filter(&self) -> &'static str {
        match self.log_level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARN" => "warn",
            "ERROR" => "error",
            _ => "info",
        }
    }
}

impl ServiceConfig {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_toggles() {
        let config = EngineConfig::from_json(
            r#"{
                "logLevel": "DEBUG",
                "services": [
                    {"name": "flowProvider", "enabled": true},
                    {"name": "stateRecorder", "enabled": true,
                     "settings": {"url": "http://localhost:9090/instances"}},
                    {"name": "engineTester", "enabled": false, "settings": {"port": "8080"}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.log_level, "DEBUG");
        assert_eq!(config.tracing_filter(), "debug");
        assert!(config.service_enabled(SERVICE_FLOW_PROVIDER));
        assert!(!config.service_enabled(SERVICE_ENGINE_TESTER));
        assert_eq!(
            config
                .service(SERVICE_STATE_RECORDER)
                .unwrap()
                .setting(SETTING_URL),
            Some("http://localhost:9090/instances")
        );
    }

    #[test]
    fn enabled_defaults_to_true() {
        let config =
            EngineConfig::from_json(r#"{"services": [{"name": "flowProvider"}]}"#).unwrap();
        assert!(config.service_enabled(SERVICE_FLOW_PROVIDER));
        assert_eq!(config.log_level, "INFO");
    }

    #[test]
    fn default_config_disables_recorder() {
        let config = EngineConfig::default_config();
        assert!(config.service_enabled(SERVICE_FLOW_PROVIDER));
        assert!(!config.service_enabled(SERVICE_STATE_RECORDER));
    }

    #[test]
    fn missing_file_yields_none() {
        assert!(EngineConfig::load_from_file("/nonexistent/config.json").is_none());
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let config = EngineConfig::from_json(r#"{"logLevel": "CHATTY"}"#).unwrap();
        assert_eq!(config.tracing_filter(), "info");
    }
}
