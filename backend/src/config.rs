use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid value {value:?} for {var}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

/// Server settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub api_key: String,
    pub data_dir: PathBuf,
    /// Ledger context address. Decryption proofs are bound to it.
    pub context: String,
    pub relayer_poll: Duration,
    pub relayer_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse_u64 = |var: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(var) {
                None => Ok(default),
                Some(value) => value.parse().map_err(|_| ConfigError { var, value }),
            }
        };

        let max_attempts = parse_u64("RELAYER_MAX_ATTEMPTS", 3)?;

        Ok(Self {
            addr: lookup("BACKEND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            // In production, this should be a strong secret.
            api_key: lookup("API_KEY").unwrap_or_else(|| "dev-secret-key".to_string()),
            data_dir: PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| "data".to_string())),
            context: lookup("LEDGER_CONTEXT").unwrap_or_else(|| "traffic-ledger".to_string()),
            relayer_poll: Duration::from_millis(parse_u64("RELAYER_POLL_MS", 2_000)?),
            relayer_max_attempts: u32::try_from(max_attempts).map_err(|_| ConfigError {
                var: "RELAYER_MAX_ATTEMPTS",
                value: max_attempts.to_string(),
            })?,
        })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite:{}", self.data_dir.join("ledger.sqlite").to_string_lossy())
    }
}
