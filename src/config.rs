use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid value for {key}: {value:?}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

/// Runtime settings, read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Unset means the in-memory store with the default badge catalog.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// JSON list of course outlines loaded into the in-memory store.
    pub courses_file: Option<String>,
    /// Unset means notifications are only logged.
    pub notify_webhook_url: Option<String>,
    pub notify_queue_capacity: usize,
    pub toggle_max_retries: u32,
    pub serial_max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8081,
            database_url: None,
            database_max_connections: 5,
            courses_file: None,
            notify_webhook_url: None,
            notify_queue_capacity: 256,
            toggle_max_retries: 8,
            serial_max_attempts: 4,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        Ok(Self {
            port: parse_var("PORT", defaults.port)?,
            database_url: non_empty_var("DATABASE_URL"),
            database_max_connections: parse_var(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            courses_file: non_empty_var("COURSES_FILE"),
            notify_webhook_url: non_empty_var("NOTIFY_WEBHOOK_URL"),
            notify_queue_capacity: parse_var(
                "NOTIFY_QUEUE_CAPACITY",
                defaults.notify_queue_capacity,
            )?,
            toggle_max_retries: parse_var("TOGGLE_MAX_RETRIES", defaults.toggle_max_retries)?,
            serial_max_attempts: parse_var("SERIAL_MAX_ATTEMPTS", defaults.serial_max_attempts)?,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty_var(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError { key, value: raw }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_vars_fall_back_to_defaults() {
        let value: u32 = parse_var("RUSTILMS_TEST_UNSET_VAR", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn malformed_values_are_rejected() {
        env::set_var("RUSTILMS_TEST_BAD_PORT", "eighty");
        let err = parse_var::<u16>("RUSTILMS_TEST_BAD_PORT", 8081).unwrap_err();
        assert_eq!(err.key, "RUSTILMS_TEST_BAD_PORT");
        assert_eq!(err.value, "eighty");
    }
}
