//! Daemon configuration, built from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::ratelimit::DEFAULT_WINDOW;

pub const ENV_AUTOREPLY_DOMAIN: &str = "VACATIOND_AUTOREPLY_DOMAIN";
pub const ENV_LMTP_LISTEN_ADDRESS: &str = "VACATIOND_LMTP_LISTEN_ADDRESS";
pub const ENV_SMTP_SERVER_ADDRESS: &str = "VACATIOND_SMTP_SERVER_ADDRESS";
pub const ENV_SMTP_SERVER_PORT: &str = "VACATIOND_SMTP_SERVER_PORT";
pub const ENV_DATABASE_URL: &str = "VACATIOND_DATABASE_URL";
pub const ENV_DATABASE_AUTH_TOKEN: &str = "VACATIOND_DATABASE_AUTH_TOKEN";
pub const ENV_COOLDOWN_SECS: &str = "VACATIOND_COOLDOWN_SECS";
pub const ENV_LMTP_READ_TIMEOUT_SECS: &str = "VACATIOND_LMTP_READ_TIMEOUT_SECS";
pub const ENV_LOG_DIR: &str = "VACATIOND_LOG_DIR";

#[derive(Debug, Clone)]
pub struct Config {
    /// Domain every recipient tag must use. Also qualifies reply Message-IDs.
    pub autoreply_domain: String,
    pub lmtp_listen_address: SocketAddr,
    pub smtp_server_address: String,
    pub smtp_server_port: u16,
    /// Vacation store location. `None` sends the fixed default body.
    pub database_url: Option<String>,
    pub database_auth_token: Option<SecretString>,
    /// Cooldown between two replies to the same pair.
    pub cooldown: Duration,
    pub lmtp_read_timeout: Duration,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup. Empty values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let smtp_server_address =
            get(ENV_SMTP_SERVER_ADDRESS).ok_or_else(|| ConfigError::MissingRequired {
                key: ENV_SMTP_SERVER_ADDRESS.to_string(),
                hint: "Set it to the host of the relay that sends auto-replies".to_string(),
            })?;

        Ok(Self {
            autoreply_domain: get(ENV_AUTOREPLY_DOMAIN).unwrap_or_else(|| "autoreply".to_string()),
            lmtp_listen_address: parse_or(&get, ENV_LMTP_LISTEN_ADDRESS, || {
                SocketAddr::from(([0, 0, 0, 0], 1025))
            })?,
            smtp_server_address,
            smtp_server_port: parse_or(&get, ENV_SMTP_SERVER_PORT, || 25)?,
            database_url: get(ENV_DATABASE_URL),
            database_auth_token: get(ENV_DATABASE_AUTH_TOKEN).map(SecretString::from),
            cooldown: parse_secs(&get, ENV_COOLDOWN_SECS, DEFAULT_WINDOW)?,
            lmtp_read_timeout: parse_secs(
                &get,
                ENV_LMTP_READ_TIMEOUT_SECS,
                Duration::from_secs(60),
            )?,
            log_dir: get(ENV_LOG_DIR).map(PathBuf::from),
        })
    }
}

fn parse_or<T, G, D>(get: &G, key: &str, default: D) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
    D: FnOnce() -> T,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default()),
    }
}

fn parse_secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(get, key, || default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least one second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
