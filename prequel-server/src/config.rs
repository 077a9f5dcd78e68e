use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Name of the SQLite file inside `STATE_DIR`.
pub const DATABASE_FILE: &str = "prequel.db";

/// Upper bound for `STALE_PR_DAYS`, about one hundred years.
pub const MAX_STALE_PR_DAYS: u32 = 36_500;

#[derive(Clone)]
pub struct Config {
    pub github_webhook_secret: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub stale_pr_days: u32,
    pub stale_check_interval: Duration,
    /// Incoming-webhook URL. Notifications are disabled when unset.
    pub slack_webhook_url: Option<String>,
    pub notification_timeout: Duration,
    pub db_timeout: Duration,
    /// GitHub organization new repositories are created in. Repository
    /// creation is refused when unset.
    pub organization_name: Option<String>,
    pub infrastructure_dir: PathBuf,
    pub provisioning_timeout: Duration,
    pub recording_enabled: bool,
    pub recording_log_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let github_webhook_secret = parse_optional(lookup("GITHUB_WEBHOOK_SECRET"))
            .context("GITHUB_WEBHOOK_SECRET environment variable is required")?;

        let port = parse_number("PORT", lookup("PORT"), 5001u16)?;

        let state_dir = parse_optional(lookup("STATE_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let stale_pr_days = parse_number("STALE_PR_DAYS", lookup("STALE_PR_DAYS"), 7u32)?;
        if stale_pr_days == 0 || stale_pr_days > MAX_STALE_PR_DAYS {
            anyhow::bail!(
                "STALE_PR_DAYS must be between 1 and {}, got {}",
                MAX_STALE_PR_DAYS,
                stale_pr_days
            );
        }

        let stale_check_interval = Duration::from_secs(parse_number(
            "STALE_CHECK_INTERVAL_SECS",
            lookup("STALE_CHECK_INTERVAL_SECS"),
            86_400u64,
        )?);
        if stale_check_interval.is_zero() {
            anyhow::bail!("STALE_CHECK_INTERVAL_SECS must be greater than zero");
        }

        let slack_webhook_url = parse_optional(lookup("SLACK_WEBHOOK_URL"));

        let notification_timeout = Duration::from_secs(parse_number(
            "NOTIFICATION_TIMEOUT_SECS",
            lookup("NOTIFICATION_TIMEOUT_SECS"),
            5u64,
        )?);

        let db_timeout = Duration::from_secs(parse_number(
            "DB_TIMEOUT_SECS",
            lookup("DB_TIMEOUT_SECS"),
            10u64,
        )?);

        let organization_name = parse_optional(lookup("ORGANIZATION_NAME"));

        let infrastructure_dir = parse_optional(lookup("INFRASTRUCTURE_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("infrastructure"));

        let provisioning_timeout = Duration::from_secs(parse_number(
            "PROVISIONING_TIMEOUT_SECS",
            lookup("PROVISIONING_TIMEOUT_SECS"),
            600u64,
        )?);

        let recording_enabled = parse_bool(lookup("RECORDING_ENABLED"));

        let recording_log_path = parse_optional(lookup("RECORDING_LOG_PATH"))
            .unwrap_or_else(|| "recordings.jsonl".to_string());

        Ok(Config {
            github_webhook_secret,
            port,
            state_dir,
            stale_pr_days,
            stale_check_interval,
            slack_webhook_url,
            notification_timeout,
            db_timeout,
            organization_name,
            infrastructure_dir,
            provisioning_timeout,
            recording_enabled,
            recording_log_path,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join(DATABASE_FILE)
    }
}

/// Returns None if the value is missing, empty, or contains only whitespace.
pub fn parse_optional(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Parse a numeric variable, falling back to `default` when unset.
/// A value that is present but unparseable is an error.
pub fn parse_number<T>(name: &str, value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match parse_optional(value) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number, got '{}'", name, raw)),
        None => Ok(default),
    }
}

/// Accepts `true`/`1`/`yes` in any case; anything else is false.
pub fn parse_bool(value: Option<String>) -> bool {
    matches!(
        parse_optional(value)
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}
