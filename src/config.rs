use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::Context;
use log::{info, warn};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use crate::store::{PostgresConfig, StoreConfig};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("broker host is not configured (set `broker.host` or HIVEMQ_URL)")]
    MissingBrokerHost,
    #[error("unsupported MQTT QoS level {0}")]
    InvalidQos(u8),
    #[error("broker keep alive must be at least 5s, got {0:?}")]
    KeepAliveTooShort(Duration),
    #[error("environment variable {0} is not a valid port: `{1}`")]
    InvalidPort(&'static str, String),
}

#[inline]
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
#[inline]
fn default_http_port() -> u16 {
    3000
}
#[inline]
fn default_history_limit() -> usize {
    50
}
#[inline]
fn default_broker_port() -> u16 {
    8883
}
#[inline]
fn default_tls() -> bool {
    true
}
#[inline]
fn default_topic() -> String {
    "esp32/sensores/cacambas".to_string()
}
#[inline]
fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}
#[inline]
fn default_reconnect_delay() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    // Address the HTTP server binds to
    // optional, default: 0.0.0.0
    #[serde(default = "default_bind")]
    pub bind: String,
    // optional, default: 3000
    #[serde(default = "default_http_port")]
    pub port: u16,
    // Maximum number of records returned by /historico
    // optional, default: 50
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_http_port(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    // Broker host name
    // required, here or through HIVEMQ_URL
    pub host: Option<String>,
    // optional, default: 8883
    #[serde(default = "default_broker_port")]
    pub port: u16,
    // Whether to speak MQTT over TLS
    // optional, default: true
    #[serde(default = "default_tls")]
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    // optional, default: esp32/sensores/cacambas
    #[serde(default = "default_topic")]
    pub topic: String,
    // Subscription QoS, 0, 1 or 2
    // optional, default: 0
    #[serde(default)]
    pub qos: u8,
    // optional, default: random
    pub client_id: Option<String>,
    // optional, default: 30s
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
    // Pause between a lost connection and the next attempt
    // optional, default: 2s
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_broker_port(),
            tls: default_tls(),
            username: None,
            password: None,
            topic: default_topic(),
            qos: 0,
            client_id: None,
            keep_alive: default_keep_alive(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl BrokerConfig {
    pub fn host(&self) -> Result<&str, ConfigError> {
        self.host
            .as_deref()
            .filter(|host| !host.is_empty())
            .ok_or(ConfigError::MissingBrokerHost)
    }

    pub fn qos(&self) -> Result<QoS, ConfigError> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            level => Err(ConfigError::InvalidQos(level)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    // Where readings are persisted
    // optional, default: Memory
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Reads the YAML file at `path`, overlays the process environment and
    /// validates the result. A missing file is only an error when
    /// `required` is set.
    pub fn load(path: &str, required: bool) -> anyhow::Result<Self> {
        let mut config = if required || Path::new(path).exists() {
            info!("open and parse config file {}", path);
            let file = File::open(path).with_context(|| format!("failed to open file {}", path))?;
            serde_yaml::from_reader(BufReader::new(file))
                .with_context(|| format!("failed to parse config file {}", path))?
        } else {
            info!("no config file at {}, using defaults", path);
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        if let StoreConfig::Memory(_) = config.store {
            warn!("no database configured, readings are kept in memory only");
        }
        Ok(config)
    }

    /// Overrides settings with the variables the deployment provides.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let port = |key: &'static str| -> Result<Option<u16>, ConfigError> {
            var(key)
                .map(|value| {
                    value
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidPort(key, value.clone()))
                })
                .transpose()
        };

        if let Some(port) = port("PORT")? {
            self.http.port = port;
        }
        if let Some(host) = var("HIVEMQ_URL") {
            self.broker.host = Some(host);
        }
        if let Some(username) = var("HIVEMQ_USER") {
            self.broker.username = Some(username);
        }
        if let Some(password) = var("HIVEMQ_PASS") {
            self.broker.password = Some(password);
        }
        if let Some(topic) = var("TOPIC") {
            self.broker.topic = topic;
        }

        if let Some(host) = var("PGHOST") {
            match &mut self.store {
                StoreConfig::Postgres(postgres) => postgres.host = host,
                store => *store = StoreConfig::Postgres(PostgresConfig::with_host(host)),
            }
        }
        if let StoreConfig::Postgres(postgres) = &mut self.store {
            if let Some(port) = port("PGPORT")? {
                postgres.port = Some(port);
            }
            if let Some(user) = var("PGUSER") {
                postgres.user = user;
            }
            if let Some(password) = var("PGPASSWORD") {
                postgres.password = Some(password);
            }
            if let Some(dbname) = var("PGDATABASE") {
                postgres.dbname = Some(dbname);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.host()?;
        self.broker.qos()?;
        if self.broker.keep_alive < Duration::from_secs(5) {
            return Err(ConfigError::KeepAliveTooShort(self.broker.keep_alive));
        }
        Ok(())
    }
}
