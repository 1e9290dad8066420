use crate::error::{BridgeError, Result};
use crate::loxone::Credentials;
use std::fs;
use std::path::Path;
use std::time::Duration;
use strum::{Display, EnumString};

/// Parse `KEY=value` lines from a `.env` file.
///
/// Values may contain spaces without quoting; one level of matching
/// single or double quotes is stripped. Blank lines and `#` comments are
/// skipped.
pub fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = ['"', '\'']
                .iter()
                .find_map(|q| {
                    value
                        .strip_prefix(*q)
                        .and_then(|v| v.strip_suffix(*q))
                })
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

/// Load environment variables from a `.env` file in the working directory.
/// Variables already set in the environment take precedence.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    let Ok(content) = fs::read_to_string(env_path) else {
        return;
    };

    for (key, value) in parse_dotenv(&content) {
        if std::env::var(&key).is_err() {
            // SAFETY: called from main before the async runtime starts any threads
            unsafe { std::env::set_var(&key, value) };
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub loxone: LoxoneConfig,
    pub mqtt: MqttConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Clone)]
pub struct LoxoneConfig {
    /// Local IP address of the Miniserver
    pub ip: String,
    /// Miniserver serial number (used in the CloudDNS host name and topics)
    pub serial: String,
    pub credentials: Credentials,
}

/// Broker transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MqttProtocol {
    Tcp,
    Ssl,
    Ws,
    Wss,
}

impl MqttProtocol {
    pub fn is_websocket(self) -> bool {
        matches!(self, MqttProtocol::Ws | MqttProtocol::Wss)
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub protocol: MqttProtocol,
    /// URL path for websocket transports
    pub path: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
}

impl MqttConfig {
    /// Fill in defaults that depend on other fields.
    pub fn validate(&mut self) -> Result<()> {
        if self.protocol.is_websocket() && self.path.is_empty() {
            self.path = "/mqtt".to_string();
        }
        if self.topic_prefix.is_empty() {
            return Err(BridgeError::Config(
                "MQTT_TOPIC_PREFIX must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Credentials are only used when both parts are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some((user.as_str(), pass.as_str()))
            }
            _ => None,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            protocol: MqttProtocol::Tcp,
            path: String::new(),
            client_id: "lox-bridge".to_string(),
            username: None,
            password: None,
            topic_prefix: "lox".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub log_level: String,
    /// Re-check the structure file on this interval; `None` fetches once.
    pub structure_refresh: Option<Duration>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            structure_refresh: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| BridgeError::Config(format!("{} is required", key)))
        };

        let loxone = LoxoneConfig {
            ip: required("LOXONE_IP")?,
            serial: required("LOXONE_SNR")?,
            credentials: Credentials {
                user: required("LOXONE_USER")?,
                password: required("LOXONE_PASS")?,
            },
        };

        let mut mqtt = MqttConfig::default();
        if let Some(host) = get("MQTT_HOST") {
            mqtt.host = host;
        }
        if let Some(port) = get("MQTT_PORT") {
            mqtt.port = port
                .parse()
                .map_err(|_| BridgeError::Config(format!("invalid MQTT_PORT: {}", port)))?;
        }
        if let Some(protocol) = get("MQTT_PROTOCOL") {
            mqtt.protocol = protocol.parse().map_err(|_| {
                BridgeError::Config(format!(
                    "invalid MQTT protocol: {} (must be tcp, ssl, ws, or wss)",
                    protocol
                ))
            })?;
        }
        if let Some(path) = get("MQTT_PATH") {
            mqtt.path = path;
        }
        if let Some(client_id) = get("MQTT_CLIENT_ID") {
            mqtt.client_id = client_id;
        }
        mqtt.username = get("MQTT_USER");
        mqtt.password = get("MQTT_PASS");
        if let Some(prefix) = get("MQTT_TOPIC_PREFIX") {
            mqtt.topic_prefix = prefix;
        }
        mqtt.validate()?;

        let mut system = SystemConfig::default();
        if let Some(level) = get("LOG_LEVEL") {
            system.log_level = level.to_lowercase();
        }
        if let Some(secs) = get("STRUCTURE_REFRESH_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                BridgeError::Config(format!("invalid STRUCTURE_REFRESH_SECS: {}", secs))
            })?;
            system.structure_refresh = (secs > 0).then(|| Duration::from_secs(secs));
        }

        Ok(Self {
            loxone,
            mqtt,
            system,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut map: HashMap<String, String> = [
            ("LOXONE_IP", "192.168.1.77"),
            ("LOXONE_USER", "admin"),
            ("LOXONE_PASS", "secret"),
            ("LOXONE_SNR", "504F94A00000"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.to_string());
        }
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.loxone.serial, "504F94A00000");
        assert_eq!(config.loxone.credentials.user, "admin");
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.protocol, MqttProtocol::Tcp);
        assert_eq!(config.mqtt.client_id, "lox-bridge");
        assert_eq!(config.mqtt.topic_prefix, "lox");
        assert!(config.mqtt.credentials().is_none());
        assert_eq!(config.system.log_level, "info");
        assert!(config.system.structure_refresh.is_none());
    }

    #[test]
    fn test_missing_required_value() {
        let result = Config::from_lookup(lookup(&[("LOXONE_SNR", "")]));
        assert!(matches!(result, Err(BridgeError::Config(msg)) if msg.contains("LOXONE_SNR")));
    }

    #[test]
    fn test_websocket_protocol_defaults_path() {
        let config = Config::from_lookup(lookup(&[("MQTT_PROTOCOL", "WSS")])).unwrap();
        assert_eq!(config.mqtt.protocol, MqttProtocol::Wss);
        assert_eq!(config.mqtt.path, "/mqtt");

        let config =
            Config::from_lookup(lookup(&[("MQTT_PROTOCOL", "wss"), ("MQTT_PATH", "/ws")])).unwrap();
        assert_eq!(config.mqtt.path, "/ws");
    }

    #[test]
    fn test_tcp_keeps_empty_path() {
        let config = Config::from_lookup(lookup(&[("MQTT_PROTOCOL", "tcp")])).unwrap();
        assert!(config.mqtt.path.is_empty());
    }

    #[test]
    fn test_invalid_protocol() {
        let result = Config::from_lookup(lookup(&[("MQTT_PROTOCOL", "http")]));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_credentials_need_both_parts() {
        let config = Config::from_lookup(lookup(&[("MQTT_USER", "bridge")])).unwrap();
        assert!(config.mqtt.credentials().is_none());

        let config =
            Config::from_lookup(lookup(&[("MQTT_USER", "bridge"), ("MQTT_PASS", "pw")])).unwrap();
        assert_eq!(config.mqtt.credentials(), Some(("bridge", "pw")));
    }

    #[test]
    fn test_structure_refresh_interval() {
        let config = Config::from_lookup(lookup(&[("STRUCTURE_REFRESH_SECS", "600")])).unwrap();
        assert_eq!(
            config.system.structure_refresh,
            Some(Duration::from_secs(600))
        );

        let config = Config::from_lookup(lookup(&[("STRUCTURE_REFRESH_SECS", "0")])).unwrap();
        assert!(config.system.structure_refresh.is_none());

        assert!(Config::from_lookup(lookup(&[("STRUCTURE_REFRESH_SECS", "soon")])).is_err());
    }

    #[test]
    fn test_parse_dotenv() {
        let parsed = parse_dotenv(
            "# comment\n\nLOXONE_IP=192.168.1.77\nMQTT_CLIENT_ID = my bridge \nLOXONE_PASS=\"quoted pass\"\nBROKEN LINE\nEMPTY=\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("LOXONE_IP".to_string(), "192.168.1.77".to_string()),
                ("MQTT_CLIENT_ID".to_string(), "my bridge".to_string()),
                ("LOXONE_PASS".to_string(), "quoted pass".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }
}
