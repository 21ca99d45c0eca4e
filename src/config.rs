//! Worker configuration, loaded from the environment.
//!
//! A `.env` file in the working directory is honored (via dotenvy) so the
//! worker, the backfill tool, and the external webhook receiver can share
//! one config surface. Required variables fail fast at startup.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {var}: {value}")]
    InvalidVar { var: &'static str, value: String },
}

/// Immutable settings resolved once at process start and passed by
/// reference into every component (no ambient global lookup).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Strava OAuth application client id.
    pub client_id: i64,
    /// Strava OAuth application client secret.
    pub client_secret: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// OpenAI API key; analysis and summarization are disabled when unset.
    pub openai_api_key: Option<String>,
    /// Default completion model (prompt templates may override per-file).
    pub openai_model: String,
    /// Base URL of the OpenAI-compatible completion endpoint.
    pub openai_base_url: String,
    /// Directory for Markdown reports.
    pub report_output_dir: PathBuf,
    /// Directory for PDF reports.
    pub pdf_output_dir: PathBuf,
    /// Seconds to sleep between empty polls.
    pub poll_seconds: f64,
    /// Seconds between heartbeat log lines.
    pub heartbeat_seconds: u64,
    /// Lead time before token expiry at which proactive refresh triggers.
    pub token_refresh_skew_seconds: i64,
    /// Whether the cross-ride progress summary runs after each analysis.
    pub progress_summary_enabled: bool,
    /// Character budget for the concatenated history fed to the summarizer.
    pub progress_summary_max_chars: usize,
    /// Ride-analysis prompt template path.
    pub ride_prompt_path: PathBuf,
    /// Progress-summary prompt template path.
    pub progress_prompt_path: PathBuf,
}

impl Settings {
    /// Load settings from the environment. `.env` is read first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let client_id_raw = required("STRAVA_CLIENT_ID")?;
        let client_id = client_id_raw
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidVar {
                var: "STRAVA_CLIENT_ID",
                value: client_id_raw,
            })?;

        let pdf_output_dir = var_or("PDF_OUTPUT_DIR", "./pdfs");
        let report_output_dir =
            std::env::var("REPORT_OUTPUT_DIR").unwrap_or_else(|_| pdf_output_dir.clone());

        Ok(Self {
            client_id,
            client_secret: required("STRAVA_CLIENT_SECRET")?,
            db_path: PathBuf::from(var_or("DB_PATH", "./db/strava.sqlite")),
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            openai_model: var_or("OPENAI_MODEL", "gpt-4o-mini"),
            openai_base_url: var_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            report_output_dir: PathBuf::from(report_output_dir),
            pdf_output_dir: PathBuf::from(pdf_output_dir),
            poll_seconds: parse_var("WORKER_POLL_SECONDS", 2.0)?,
            heartbeat_seconds: parse_var("WORKER_HEARTBEAT_SECONDS", 60)?,
            token_refresh_skew_seconds: parse_var("TOKEN_REFRESH_SKEW_SECONDS", 60)?,
            progress_summary_enabled: flag_or("PROGRESS_SUMMARY_ENABLED", true),
            progress_summary_max_chars: parse_var("PROGRESS_SUMMARY_MAX_CHARS", 60_000)?,
            ride_prompt_path: PathBuf::from(var_or(
                "RIDE_PROMPT_PATH",
                "prompts/ride_analysis_v1.md",
            )),
            progress_prompt_path: PathBuf::from(var_or(
                "PROGRESS_PROMPT_PATH",
                "prompts/progress_summary_v1.md",
            )),
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingVar(var))
}

fn var_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Parse an env var into any FromStr type, using `default` when unset.
fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidVar { var, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Boolean flags accept "0"/"false"/"False" as off, anything else as on.
fn flag_or(var: &str, default: bool) -> bool {
    match std::env::var(var) {
        Ok(raw) => !matches!(raw.as_str(), "0" | "false" | "False"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        std::env::set_var("VELOREPORT_TEST_FLAG_ON", "1");
        std::env::set_var("VELOREPORT_TEST_FLAG_OFF", "false");
        assert!(flag_or("VELOREPORT_TEST_FLAG_ON", false));
        assert!(!flag_or("VELOREPORT_TEST_FLAG_OFF", true));
        assert!(flag_or("VELOREPORT_TEST_FLAG_UNSET", true));
        assert!(!flag_or("VELOREPORT_TEST_FLAG_UNSET", false));
    }

    #[test]
    fn test_parse_var_default_and_invalid() {
        assert_eq!(parse_var::<u64>("VELOREPORT_TEST_UNSET_U64", 42).unwrap(), 42);

        std::env::set_var("VELOREPORT_TEST_BAD_U64", "not-a-number");
        assert!(parse_var::<u64>("VELOREPORT_TEST_BAD_U64", 0).is_err());
    }
}
