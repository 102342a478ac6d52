use std::env;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tracing::info;

use crate::config::{find_config_file, load_config, Settings};

/// Resolves the effective settings: `.env` is loaded into the process
/// environment, then the JSON file (explicit path or the usual locations),
/// then `RABBITMQ_*`, `LISTENER_*` and `PUBLISHER_*` variables on top.
pub fn load_settings(config_path: Option<&Path>) -> Result<Settings> {
    dotenv().ok();

    let path = config_path.map(Path::to_path_buf).or_else(find_config_file);
    let mut settings = match path {
        Some(path) => load_config(&path)?,
        None => {
            info!("No configuration file found, using defaults and environment");
            Settings::default()
        }
    };

    apply_env_with(&mut settings, |key| env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
}

/// Applies overrides from `lookup`, which maps a variable name to its value.
pub fn apply_env_with<F>(settings: &mut Settings, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let rabbit = &mut settings.rabbit_mq;
    if let Some(value) = lookup("RABBITMQ_HOST") {
        rabbit.host_name = value;
    }
    if let Some(value) = parsed(&lookup, "RABBITMQ_PORT")? {
        rabbit.port = value;
    }
    if let Some(value) = lookup("RABBITMQ_USERNAME") {
        rabbit.user_name = Some(value);
    }
    if let Some(value) = lookup("RABBITMQ_PASSWORD") {
        rabbit.password = Some(value);
    }
    if let Some(value) = lookup("RABBITMQ_VHOST") {
        rabbit.virtual_host = value;
    }
    if let Some(value) = lookup("RABBITMQ_EXCHANGE") {
        rabbit.exchange = value;
    }
    if let Some(value) = lookup("RABBITMQ_QUEUE") {
        rabbit.queue = value;
    }
    if let Some(value) = lookup("RABBITMQ_ROUTING_PATTERN") {
        rabbit.routing_pattern = value;
    }

    if let Some(value) = parsed(&lookup, "LISTENER_HEALTH_CHECK_INTERVAL_SECONDS")? {
        settings.listener.health_check_interval_seconds = value;
    }
    if let Some(value) = parsed(&lookup, "LISTENER_CONNECT_RETRIES")? {
        settings.listener.connect_retries = value;
    }
    if let Some(value) = parsed(&lookup, "PUBLISHER_CONNECT_RETRIES")? {
        settings.publisher.connect_retries = value;
    }

    Ok(())
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("Invalid value '{value}' for {key}"))
        })
        .transpose()
}
