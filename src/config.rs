//! Console configuration parsed from environment variables.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::path::PathBuf;

use crate::guard::{DEFAULT_LOGIN_PATH, DEFAULT_MAX_NETWORK_FAILURES, GuardOptions};
use crate::net::api::HttpTimeouts;
use crate::state::session::DEFAULT_STORAGE_KEY;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not a valid http(s) URL: {value}")]
    InvalidUrl { var: &'static str, value: String },
    #[error("{var} is not a valid number: {value}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} is not a valid boolean: {value}")]
    InvalidBool { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleConfig {
    pub api_base_url: String,
    pub storage_path: PathBuf,
    pub storage_key: String,
    pub login_path: String,
    pub verify_on_mount: bool,
    pub max_verify_failures: u32,
    pub timeouts: HttpTimeouts,
}

impl ConsoleConfig {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `CRM_API_BASE_URL`: default `http://127.0.0.1:8000`
    /// - `CRM_STORAGE_PATH`: default `$HOME/.crm-console/storage.json`
    /// - `CRM_STORAGE_KEY`: default `crm-auth`
    /// - `CRM_LOGIN_PATH`: default `/login`
    /// - `CRM_VERIFY_ON_MOUNT`: default true
    /// - `CRM_MAX_VERIFY_FAILURES`: default 3, `0` never gives up on an unreachable backend
    /// - `CRM_REQUEST_TIMEOUT_SECS`: default 30
    /// - `CRM_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first variable that fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ConsoleConfig::from_env`] with an injectable source.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first variable that fails to parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let api_base_url = parse_base_url(
            "CRM_API_BASE_URL",
            get("CRM_API_BASE_URL").as_deref().unwrap_or(DEFAULT_API_BASE_URL),
        )?;
        let storage_path = get("CRM_STORAGE_PATH")
            .map_or_else(|| default_storage_path(get("HOME").as_deref()), PathBuf::from);
        let storage_key = get("CRM_STORAGE_KEY").unwrap_or_else(|| DEFAULT_STORAGE_KEY.to_owned());
        let login_path = get("CRM_LOGIN_PATH").unwrap_or_else(|| DEFAULT_LOGIN_PATH.to_owned());
        let verify_on_mount = match get("CRM_VERIFY_ON_MOUNT") {
            Some(raw) => parse_bool("CRM_VERIFY_ON_MOUNT", &raw)?,
            None => true,
        };
        let max_verify_failures = match get("CRM_MAX_VERIFY_FAILURES") {
            Some(raw) => parse_number("CRM_MAX_VERIFY_FAILURES", &raw)?,
            None => DEFAULT_MAX_NETWORK_FAILURES,
        };
        let timeouts = HttpTimeouts {
            request_secs: match get("CRM_REQUEST_TIMEOUT_SECS") {
                Some(raw) => parse_number("CRM_REQUEST_TIMEOUT_SECS", &raw)?,
                None => DEFAULT_REQUEST_TIMEOUT_SECS,
            },
            connect_secs: match get("CRM_CONNECT_TIMEOUT_SECS") {
                Some(raw) => parse_number("CRM_CONNECT_TIMEOUT_SECS", &raw)?,
                None => DEFAULT_CONNECT_TIMEOUT_SECS,
            },
        };

        Ok(Self {
            api_base_url,
            storage_path,
            storage_key,
            login_path,
            verify_on_mount,
            max_verify_failures,
            timeouts,
        })
    }

    #[must_use]
    pub fn guard_options(&self) -> GuardOptions {
        GuardOptions {
            login_path: self.login_path.clone(),
            verify_on_mount: self.verify_on_mount,
            max_network_failures: self.max_verify_failures,
        }
    }
}

/// Validate and normalize a backend base URL (no trailing slash).
///
/// # Errors
///
/// Returns `InvalidUrl` for unparseable or non-http(s) URLs.
pub fn parse_base_url(var: &'static str, raw: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidUrl { var, value: raw.to_owned() };
    let url = reqwest::Url::parse(raw).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }
    Ok(raw.trim_end_matches('/').to_owned())
}

fn default_storage_path(home: Option<&str>) -> PathBuf {
    let base = home.map_or_else(PathBuf::new, PathBuf::from);
    base.join(".crm-console").join("storage.json")
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse::<T>()
        .map_err(|_| ConfigError::InvalidNumber { var, value: raw.to_owned() })
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { var, value: raw.to_owned() }),
    }
}
