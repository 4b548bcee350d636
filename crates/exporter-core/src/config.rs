//! Configuration - JSON 設定ファイル
//!
//! 全フィールドにデフォルトがあるので `{}` も有効な設定になる。
//! キーは camelCase。
//!
//! ```json
//! {
//!   "http": { "serverPort": 8888, "allowedEndpoints": ["/metrics"] },
//!   "mqtt": { "brokerAddress": "localhost", "topics": ["home/+/temp"] }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::bridge::BridgeConfig;
use crate::impls::http::ServerConfig;
use crate::scheduler::SchedulerConfig;
use crate::session::SessionConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config root must be a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub http: HttpSettings,
    pub mqtt: MqttSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpSettings {
    pub server_port: u16,
    pub allowed_endpoints: Vec<String>,
    pub request_timeout_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            server_port: 8888,
            allowed_endpoints: vec!["/metrics".to_string()],
            request_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MqttSettings {
    pub client_id: String,
    pub broker_address: String,
    pub broker_port: u16,
    pub keepalive_secs: u64,
    #[serde(deserialize_with = "string_entries")]
    pub topics: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub reconnect_backoff_ms: u64,
    pub disconnect_recheck_ms: u64,
    pub disconnect_timeout_ms: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            client_id: "PrometheusMqttExporter".to_string(),
            broker_address: "localhost".to_string(),
            broker_port: 1883,
            keepalive_secs: 60,
            topics: Vec::new(),
            username: None,
            password: None,
            reconnect_backoff_ms: 5000,
            disconnect_recheck_ms: 100,
            disconnect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerSettings {
    pub poll_quantum_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { poll_quantum_ms: 1 }
    }
}

/// 文字列以外のエントリは警告してスキップ
fn string_entries<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<Value>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| match entry {
            Value::String(topic) => Some(topic),
            other => {
                warn!(entry = %other, "ignoring non-string topic entry");
                None
            }
        })
        .collect())
}

impl Configuration {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(ConfigError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_quantum: Duration::from_millis(self.scheduler.poll_quantum_ms.max(1)),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let mqtt = &self.mqtt;
        SessionConfig {
            client_id: mqtt.client_id.clone(),
            broker_address: mqtt.broker_address.clone(),
            broker_port: mqtt.broker_port,
            keepalive: Duration::from_secs(mqtt.keepalive_secs),
            username: mqtt.username.clone(),
            password: mqtt.password.clone(),
            reconnect_backoff: Duration::from_millis(mqtt.reconnect_backoff_ms),
            disconnect_recheck: Duration::from_millis(mqtt.disconnect_recheck_ms),
            disconnect_timeout: Duration::from_millis(mqtt.disconnect_timeout_ms),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            allowed_endpoints: self.http.allowed_endpoints.clone(),
            request_timeout: Duration::from_millis(self.http.request_timeout_ms),
            ..BridgeConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.http.server_port,
        }
    }
}
