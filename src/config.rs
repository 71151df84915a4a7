use std::time::Duration;

use thiserror::Error;

/// Environment variables holding service-account key blobs, in rotation order.
pub const SERVICE_ACCOUNT_VARS: [&str; 4] = [
    "GOOGLE_SERVICE_ACCOUNT_KEY",
    "GOOGLE_SERVICE_ACCOUNT_KEY_2",
    "GOOGLE_SERVICE_ACCOUNT_KEY_3",
    "GOOGLE_SERVICE_ACCOUNT_KEY_4",
];

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_KEY_COOLDOWN_SECS: u64 = 2 * 60;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_ROW_CLAIM_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_QUEUE_BUSY_THRESHOLD: usize = 5;
const DEFAULT_SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Process configuration
///
/// Loaded once at startup. Every field has a default except the service
/// account keys, which may legitimately be absent (endpoints then report
/// that no credentials are configured).
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind the HTTP server to
    pub host: String,

    /// Port to bind the HTTP server to
    pub port: u16,

    /// Raw service-account JSON blobs, in the order of `SERVICE_ACCOUNT_VARS`
    pub service_account_keys: Vec<String>,

    /// How long a key is skipped after a quota failure
    pub key_cooldown: Duration,

    /// Overall deadline for a single autoget request
    pub request_timeout: Duration,

    /// Age after which a claimed-row marker is considered abandoned
    pub row_claim_timeout: Duration,

    /// Queue length above which autoget switches to simple mode
    pub queue_busy_threshold: usize,

    /// Base URL of the Sheets v4 REST API
    pub sheets_api_base: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            service_account_keys: Vec::new(),
            key_cooldown: Duration::from_secs(DEFAULT_KEY_COOLDOWN_SECS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            row_claim_timeout: Duration::from_millis(DEFAULT_ROW_CLAIM_TIMEOUT_MS),
            queue_busy_threshold: DEFAULT_QUEUE_BUSY_THRESHOLD,
            sheets_api_base: DEFAULT_SHEETS_API_BASE.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    ///
    /// A `.env` file in the working directory is applied first if present.
    ///
    /// # Returns
    /// * `Result<Config, ConfigError>` - The configuration or the first malformed variable
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            log::debug!("Loaded environment overrides from {}", path.display());
        }
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    ///
    /// # Arguments
    /// * `lookup` - Returns the value of a variable, or `None` when unset
    ///
    /// # Errors
    /// * Returns `ConfigError::Invalid` if a numeric variable does not parse
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let service_account_keys = SERVICE_ACCOUNT_VARS
            .iter()
            .filter_map(|var| lookup(var))
            .filter(|blob| !blob.trim().is_empty())
            .collect();

        Ok(Config {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT")?.unwrap_or(defaults.port),
            service_account_keys,
            key_cooldown: parse_var(&lookup, "KEY_COOLDOWN_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.key_cooldown),
            request_timeout: parse_var(&lookup, "REQUEST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            row_claim_timeout: parse_var(&lookup, "ROW_CLAIM_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.row_claim_timeout),
            queue_busy_threshold: parse_var(&lookup, "QUEUE_BUSY_THRESHOLD")?
                .unwrap_or(defaults.queue_busy_threshold),
            sheets_api_base: lookup("SHEETS_API_BASE")
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or(defaults.sheets_api_base),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:3000");
        assert_eq!(config.key_cooldown, Duration::from_secs(120));
        assert_eq!(config.request_timeout, Duration::from_millis(15_000));
        assert_eq!(config.queue_busy_threshold, 5);
        assert!(config.service_account_keys.is_empty());
    }

    #[test]
    fn keys_are_collected_in_order_skipping_blanks() {
        let config = Config::from_lookup(lookup_from(&[
            ("GOOGLE_SERVICE_ACCOUNT_KEY_4", "four"),
            ("GOOGLE_SERVICE_ACCOUNT_KEY", "one"),
            ("GOOGLE_SERVICE_ACCOUNT_KEY_2", "   "),
        ]))
        .unwrap();
        assert_eq!(config.service_account_keys, vec!["one", "four"]);
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[("PORT", "eighty")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "PORT",
                value: "eighty".to_string()
            }
        );
    }

    #[test]
    fn api_base_trailing_slash_is_trimmed() {
        let config =
            Config::from_lookup(lookup_from(&[("SHEETS_API_BASE", "http://localhost:9/v4/")]))
                .unwrap();
        assert_eq!(config.sheets_api_base, "http://localhost:9/v4");
    }
}
