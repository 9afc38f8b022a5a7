use paco_core::voice::CallLimits;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: String,
    pub ws_url: String,
    pub chat_model: String,
    pub log_level: Level,
    pub reconnect_delay: Duration,
    pub history_limit: u32,
    pub audio_out_dir: PathBuf,
    pub call_warning: Duration,
    pub call_limit: Duration,
    pub mirror_transcripts: bool,
}

/// Reads `name`, falling back to `default` when unset. A variable that is set
/// but blank counts as missing.
fn text_var(name: &str, default: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Err(ConfigError::MissingVar(name.to_string())),
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => Ok(default.to_string()),
    }
}

fn number_var(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn flag_var(name: &str) -> Result<bool, ConfigError> {
    let value = std::env::var(name).unwrap_or_default();
    match value.trim().to_lowercase().as_str() {
        "" | "0" | "false" | "no" => Ok(false),
        "1" | "true" | "yes" => Ok(true),
        other => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' is not a boolean", other),
        )),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_url = text_var("PACO_API_URL", "http://localhost:8000/api/v1")?
            .trim_end_matches('/')
            .to_string();
        let ws_url = text_var("PACO_WS_URL", "ws://localhost:8000/api/v1/chat/ws/chat")?;
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "PACO_WS_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", ws_url),
            ));
        }

        let chat_model = text_var("CHAT_MODEL", "gpt-4o")?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let reconnect_delay_ms = number_var("RECONNECT_DELAY_MS", 3000)?;
        if reconnect_delay_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "RECONNECT_DELAY_MS".to_string(),
                "the reconnect delay must be at least 1 ms".to_string(),
            ));
        }
        let reconnect_delay = Duration::from_millis(reconnect_delay_ms);

        let history_limit = number_var("HISTORY_LIMIT", 50)?;
        let history_limit = u32::try_from(history_limit)
            .ok()
            .filter(|limit| *limit > 0)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "HISTORY_LIMIT".to_string(),
                    format!("{} is out of range", history_limit),
                )
            })?;

        let audio_out_dir = std::env::var("AUDIO_OUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./audio"));

        let call_warning = Duration::from_secs(number_var("CALL_WARNING_SECS", 240)?);
        let call_limit = Duration::from_secs(number_var("CALL_LIMIT_SECS", 300)?);
        if call_warning >= call_limit {
            return Err(ConfigError::InvalidValue(
                "CALL_WARNING_SECS".to_string(),
                format!(
                    "warning at {}s must come before the {}s limit",
                    call_warning.as_secs(),
                    call_limit.as_secs()
                ),
            ));
        }

        let mirror_transcripts = flag_var("MIRROR_TRANSCRIPTS")?;

        Ok(Self {
            api_url,
            ws_url,
            chat_model,
            log_level,
            reconnect_delay,
            history_limit,
            audio_out_dir,
            call_warning,
            call_limit,
            mirror_transcripts,
        })
    }

    pub fn call_limits(&self) -> CallLimits {
        CallLimits {
            warning_after: self.call_warning,
            hard_limit: self.call_limit,
            ..CallLimits::default()
        }
    }
}
