use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE_URL: &str = "https://api.switch-bot.com/v1.0";

pub type SharedMapping = Arc<RwLock<CommandMapping>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandMapping {
    // toggle, unless powerOn/powerOff are set
    pub power: String,
    #[serde(rename = "powerOn", skip_serializing_if = "Option::is_none")]
    pub power_on: Option<String>,
    #[serde(rename = "powerOff", skip_serializing_if = "Option::is_none")]
    pub power_off: Option<String>,
    pub humidity: String,
}

impl Default for CommandMapping {
    fn default() -> Self {
        Self {
            power: "power".to_string(),
            power_on: None,
            power_off: None,
            humidity: "humidity".to_string(),
        }
    }
}

impl CommandMapping {
    pub fn power_command(&self, on: bool) -> &str {
        let directed = if on {
            self.power_on.as_deref()
        } else {
            self.power_off.as_deref()
        };
        directed.unwrap_or(&self.power)
    }

    pub fn into_shared(self) -> SharedMapping {
        Arc::new(RwLock::new(self))
    }

    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.power.trim().is_empty() {
            self.power = defaults.power;
        }
        if self.humidity.trim().is_empty() {
            self.humidity = defaults.humidity;
        }
        self.power_on = self.power_on.take().filter(|value| !value.trim().is_empty());
        self.power_off = self.power_off.take().filter(|value| !value.trim().is_empty());
    }
}

pub fn read_mapping(mapping: &SharedMapping) -> CommandMapping {
    mapping
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransitionConfig {
    #[serde(rename = "gracePeriodMs")]
    pub grace_period_ms: u64,
    #[serde(rename = "stepRetryDelayMs")]
    pub step_retry_delay_ms: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 3_000,
            step_retry_delay_ms: 0,
        }
    }
}

impl TransitionConfig {
    pub fn sanitize(&mut self) {
        self.grace_period_ms = self.grace_period_ms.clamp(500, 30_000);
        self.step_retry_delay_ms = self.step_retry_delay_ms.min(60_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub token: String,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "requestTimeoutMs")]
    pub request_timeout_ms: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    #[serde(rename = "nameKeywords")]
    pub name_keywords: Vec<String>,
    #[serde(rename = "deviceIds")]
    pub device_ids: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            name_keywords: vec!["加湿器".to_string(), "humidifier".to_string()],
            device_ids: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn matches_name(&self, device_name: &str) -> bool {
        let name = device_name.to_lowercase();
        self.name_keywords
            .iter()
            .any(|keyword| name.contains(&keyword.to_lowercase()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub api: ApiConfig,
    pub mapping: CommandMapping,
    pub transition: TransitionConfig,
    pub discovery: DiscoveryConfig,
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.mapping.sanitize();
        self.transition.sanitize();

        if self.api.base_url.trim().is_empty() {
            self.api.base_url = DEFAULT_API_BASE_URL.to_string();
        }
        self.api.base_url = self.api.base_url.trim_end_matches('/').to_string();

        if self.network.http_port == 0 {
            self.network.http_port = 8080;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn power_command_prefers_direction_overrides() {
        let mut mapping = CommandMapping::default();
        assert_eq!(mapping.power_command(true), "power");
        assert_eq!(mapping.power_command(false), "power");

        mapping.power_off = Some("off".to_string());
        assert_eq!(mapping.power_command(true), "power");
        assert_eq!(mapping.power_command(false), "off");
    }

    #[test]
    fn sanitize_restores_blank_commands() {
        let mut config = RuntimeConfig::default();
        config.mapping.power = "  ".to_string();
        config.mapping.humidity = String::new();
        config.mapping.power_on = Some(" ".to_string());
        config.transition.grace_period_ms = 0;
        config.api.base_url = "https://example.test/v1.0/".to_string();

        config.sanitize();

        assert_eq!(config.mapping, CommandMapping::default());
        assert_eq!(config.transition.grace_period_ms, 500);
        assert_eq!(config.api.base_url, "https://example.test/v1.0");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"mapping":{"power":"電源","humidity":"湿度"}}"#).unwrap();

        assert_eq!(config.mapping.power, "電源");
        assert_eq!(config.mapping.humidity, "湿度");
        assert_eq!(config.transition, TransitionConfig::default());
        assert_eq!(config.api.base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn partial_sections_keep_their_other_defaults() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"api":{"token":"secret"},"transition":{"stepRetryDelayMs":250},"network":{"http_port":9000}}"#,
        )
        .unwrap();

        assert_eq!(config.api.token, "secret");
        assert_eq!(config.api.base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.transition.grace_period_ms, 3_000);
        assert_eq!(config.transition.step_retry_delay_ms, 250);
        assert_eq!(config.network.http_port, 9000);
        assert_eq!(config.network.mqtt_port, 1883);
        assert_eq!(config.mapping, CommandMapping::default());
    }

    #[test]
    fn mapping_without_humidity_keeps_default_button() {
        let mapping: CommandMapping = serde_json::from_str(r#"{"power":"電源"}"#).unwrap();
        assert_eq!(mapping.power, "電源");
        assert_eq!(mapping.humidity, "humidity");
    }

    #[test]
    fn discovery_matches_keywords_case_insensitively() {
        let discovery = DiscoveryConfig::default();
        assert!(discovery.matches_name("加湿器"));
        assert!(discovery.matches_name("Bedroom Humidifier"));
        assert!(!discovery.matches_name("Hub Mini"));
    }
}
