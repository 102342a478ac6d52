// src/config.rs
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rabbitmq::errors::RabbitMQError;
use crate::rabbitmq::retry::{RetryPolicy, CONSUMER_MAX_RETRIES, PUBLISHER_MAX_RETRIES};
use crate::rabbitmq::topology::{BrokerEndpoint, TASK_ROUTING_PATTERN};

pub const CONFIG_FILE_NAME: &str = "task-events.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Settings {
    #[serde(default)]
    pub rabbit_mq: RabbitMqSettings,
    #[serde(default)]
    pub listener: ListenerSettings,
    #[serde(default)]
    pub publisher: PublisherSettings,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RabbitMqSettings {
    #[serde(default = "default_host")]
    pub host_name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_vhost")]
    pub virtual_host: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_routing_pattern")]
    pub routing_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListenerSettings {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_consumer_retries")]
    pub connect_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PublisherSettings {
    #[serde(default = "default_publisher_retries")]
    pub connect_retries: u32,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_vhost() -> String { "/".to_string() }
fn default_exchange() -> String { "tasks".to_string() }
fn default_queue() -> String { "task_events_log_queue".to_string() }
fn default_routing_pattern() -> String { TASK_ROUTING_PATTERN.to_string() }
fn default_health_check_interval() -> u64 { 5 }
fn default_consumer_retries() -> u32 { CONSUMER_MAX_RETRIES }
fn default_publisher_retries() -> u32 { PUBLISHER_MAX_RETRIES }

impl Default for RabbitMqSettings {
    fn default() -> Self {
        RabbitMqSettings {
            host_name: default_host(),
            port: default_port(),
            user_name: None,
            password: None,
            virtual_host: default_vhost(),
            exchange: default_exchange(),
            queue: default_queue(),
            routing_pattern: default_routing_pattern(),
        }
    }
}

impl fmt::Debug for RabbitMqSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqSettings")
            .field("host_name", &self.host_name)
            .field("port", &self.port)
            .field("user_name", &self.user_name)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("virtual_host", &self.virtual_host)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("routing_pattern", &self.routing_pattern)
            .finish()
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        ListenerSettings {
            health_check_interval_seconds: default_health_check_interval(),
            connect_retries: default_consumer_retries(),
        }
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        PublisherSettings {
            connect_retries: default_publisher_retries(),
        }
    }
}

impl Settings {
    /// Checks values that have no sensible fallback. Credentials are checked
    /// separately by [`Settings::endpoint`].
    pub fn validate(&self) -> Result<()> {
        let rabbit = &self.rabbit_mq;
        if rabbit.host_name.trim().is_empty() {
            return Err(anyhow!("Configuration error: RabbitMq.HostName cannot be empty"));
        }
        if rabbit.port == 0 {
            return Err(anyhow!("Configuration error: RabbitMq.Port must be greater than 0"));
        }
        if rabbit.exchange.is_empty() || rabbit.queue.is_empty() {
            return Err(anyhow!(
                "Configuration error: RabbitMq.Exchange and RabbitMq.Queue cannot be empty"
            ));
        }
        if self.listener.health_check_interval_seconds == 0 {
            return Err(anyhow!(
                "Configuration error: Listener.HealthCheckIntervalSeconds must be greater than 0"
            ));
        }
        Ok(())
    }

    /// Builds the broker endpoint. Fails when the username or password is
    /// missing, since no connection could succeed without them.
    pub fn endpoint(&self) -> Result<BrokerEndpoint, RabbitMQError> {
        let rabbit = &self.rabbit_mq;
        let username = non_empty(&rabbit.user_name).ok_or_else(|| {
            RabbitMQError::ConfigError("RabbitMQ username is not configured".to_string())
        })?;
        let password = non_empty(&rabbit.password).ok_or_else(|| {
            RabbitMQError::ConfigError("RabbitMQ password is not configured".to_string())
        })?;

        Ok(BrokerEndpoint {
            host: rabbit.host_name.clone(),
            port: rabbit.port,
            username: username.to_string(),
            password: password.to_string(),
            virtual_host: rabbit.virtual_host.clone(),
            exchange: rabbit.exchange.clone(),
            queue: rabbit.queue.clone(),
            routing_pattern: rabbit.routing_pattern.clone(),
        })
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.listener.health_check_interval_seconds)
    }

    pub fn listener_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.listener.connect_retries)
    }

    pub fn publisher_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.publisher.connect_retries)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.trim().is_empty())
}

// Configuration loading and management functions
pub fn find_config_file() -> Option<PathBuf> {
    let current_dir = std::env::current_dir().ok()?;
    find_config_file_in(&current_dir, home::home_dir().as_deref())
}

/// Looks in `dir`, then `dir/config`, then `~/.task-events.json`.
pub fn find_config_file_in(dir: &Path, home_dir: Option<&Path>) -> Option<PathBuf> {
    let locations = [
        ("Current directory", dir.join(CONFIG_FILE_NAME)),
        ("Config directory", dir.join("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path);
        }
    }

    let home_config = home_dir?.join(format!(".{CONFIG_FILE_NAME}"));
    if home_config.exists() {
        debug!("Found config file in home directory: {}", home_config.display());
        return Some(home_config);
    }

    None
}

pub fn load_config(path: &Path) -> Result<Settings> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let settings: Settings = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or fields of the wrong type")?;

    settings.validate()?;
    Ok(settings)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let default_settings = Settings {
        rabbit_mq: RabbitMqSettings {
            user_name: Some("guest".to_string()),
            password: Some("guest".to_string()),
            ..RabbitMqSettings::default()
        },
        ..Settings::default()
    };

    let json = serde_json::to_string_pretty(&default_settings)
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_the_task_topology() {
        let settings = Settings::default();

        assert_eq!(settings.rabbit_mq.host_name, "localhost");
        assert_eq!(settings.rabbit_mq.port, 5672);
        assert_eq!(settings.rabbit_mq.virtual_host, "/");
        assert_eq!(settings.rabbit_mq.exchange, "tasks");
        assert_eq!(settings.rabbit_mq.queue, "task_events_log_queue");
        assert_eq!(settings.rabbit_mq.routing_pattern, "task.*");
        assert_eq!(settings.health_check_interval(), Duration::from_secs(5));
        assert_eq!(settings.listener_retry_policy().max_retries(), 5);
        assert_eq!(settings.publisher_retry_policy().max_retries(), 3);
    }

    #[test]
    fn pascal_case_sections_are_read() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "RabbitMq": { "HostName": "rabbit", "Port": 5673, "UserName": "app", "Password": "pw" },
                "Listener": { "HealthCheckIntervalSeconds": 2 }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.rabbit_mq.host_name, "rabbit");
        assert_eq!(settings.rabbit_mq.port, 5673);
        assert_eq!(settings.rabbit_mq.exchange, "tasks");
        assert_eq!(settings.listener.health_check_interval_seconds, 2);
        assert_eq!(settings.listener.connect_retries, 5);
        assert_eq!(settings.publisher.connect_retries, 3);
    }

    #[test]
    fn endpoint_requires_credentials() {
        let mut settings = Settings::default();
        assert!(matches!(settings.endpoint(), Err(RabbitMQError::ConfigError(_))));

        settings.rabbit_mq.user_name = Some("app".to_string());
        settings.rabbit_mq.password = Some("  ".to_string());
        assert!(matches!(settings.endpoint(), Err(RabbitMQError::ConfigError(_))));

        settings.rabbit_mq.password = Some("pw".to_string());
        let endpoint = settings.endpoint().unwrap();
        assert_eq!(endpoint.username, "app");
        assert_eq!(endpoint.password, "pw");
        assert_eq!(endpoint.queue, "task_events_log_queue");
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let mut settings = Settings::default();
        settings.rabbit_mq.port = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.listener.health_check_interval_seconds = 0;
        assert!(settings.validate().is_err());

        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn password_is_masked_in_debug_output() {
        let mut settings = Settings::default();
        settings.rabbit_mq.password = Some("s3cret".to_string());

        assert!(!format!("{settings:?}").contains("s3cret"));
    }

    #[test]
    fn default_file_round_trips_through_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        create_default_config_file(&path).unwrap();
        let settings = load_config(&path).unwrap();

        assert_eq!(settings.rabbit_mq.user_name.as_deref(), Some("guest"));
        assert!(settings.endpoint().is_ok());
    }

    #[test]
    fn invalid_json_is_reported_with_context() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{ not json").unwrap();

        let error = load_config(&path).unwrap_err();

        assert!(error.to_string().contains("invalid JSON"));
    }

    #[test]
    fn lookup_prefers_current_dir_then_config_then_home() {
        let work = tempdir().unwrap();
        let home = tempdir().unwrap();
        assert_eq!(find_config_file_in(work.path(), Some(home.path())), None);

        let home_file = home.path().join(".task-events.json");
        fs::write(&home_file, "{}").unwrap();
        assert_eq!(find_config_file_in(work.path(), Some(home.path())), Some(home_file));

        fs::create_dir(work.path().join("config")).unwrap();
        let nested = work.path().join("config").join(CONFIG_FILE_NAME);
        fs::write(&nested, "{}").unwrap();
        assert_eq!(find_config_file_in(work.path(), Some(home.path())), Some(nested));

        let local = work.path().join(CONFIG_FILE_NAME);
        fs::write(&local, "{}").unwrap();
        assert_eq!(find_config_file_in(work.path(), Some(home.path())), Some(local));
    }
}
