use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{CoordinatorConfig, FieldRule, RefreshPolicy};

/// Upper bound for the assumed token lifetime (one year)
const MAX_TOKEN_LIFETIME_HOURS: u64 = 24 * 366;

/// Upper bound for check, status and timeout intervals (one day)
const MAX_INTERVAL_SECS: u64 = 24 * 3600;

/// Broker Token Keeper - keeps a broker API access token valid
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Read credentials from this .env-style file instead of the process environment
    #[arg(short = 'e', long, env = "CREDENTIALS_ENV_FILE")]
    pub env_file: Option<String>,

    /// Prefix for credential names (e.g. UPSTOX_API_KEY)
    #[arg(long, env = "CREDENTIAL_PREFIX", default_value = "UPSTOX_")]
    pub credential_prefix: String,

    /// Broker API base URL
    #[arg(short = 'u', long, env = "UPSTOX_BASE_URL", default_value = "https://api.upstox.com/v2")]
    pub base_url: String,

    /// Token endpoint path under the base URL
    #[arg(long, env = "TOKEN_PATH", default_value = "/login/authorization/token")]
    pub token_path: String,

    /// OAuth grant type sent with token requests
    #[arg(long, env = "TOKEN_GRANT_TYPE", default_value = "client_credentials")]
    pub grant_type: String,

    /// Refresh this many seconds before the token expires
    #[arg(long, env = "TOKEN_REFRESH_THRESHOLD", default_value = "300")]
    pub refresh_threshold: u64,

    /// Seconds between background staleness checks
    #[arg(long, env = "TOKEN_CHECK_INTERVAL", default_value = "60")]
    pub check_interval: u64,

    /// Upstream requests per refresh cycle
    #[arg(long, env = "TOKEN_REFRESH_MAX_ATTEMPTS", default_value = "5")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    #[arg(long, env = "TOKEN_BACKOFF_BASE_MS", default_value = "1000")]
    pub backoff_base_ms: u64,

    /// Longest retry delay in milliseconds
    #[arg(long, env = "TOKEN_BACKOFF_CAP_MS", default_value = "60000")]
    pub backoff_cap_ms: u64,

    /// Token request timeout in seconds
    #[arg(long, env = "TOKEN_REFRESH_TIMEOUT", default_value = "10")]
    pub refresh_timeout: u64,

    /// Token lifetime in hours when upstream reports none
    #[arg(long, env = "TOKEN_LIFETIME_HOURS", default_value = "24")]
    pub token_lifetime: u64,

    /// Per-credential rules as JSON, e.g. {"API_KEY":{"min_len":8}}
    #[arg(long, env = "CREDENTIAL_RULES")]
    pub credential_rules: Option<String>,

    /// Seconds between status log lines (0 disables)
    #[arg(long, env = "STATUS_INTERVAL", default_value = "300")]
    pub status_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (compact, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "compact")]
    pub log_format: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Credential source
    pub env_file: Option<PathBuf>,
    pub credential_prefix: String,
    pub credential_rules: HashMap<String, FieldRule>,

    // Upstream
    pub base_url: String,
    pub token_path: String,
    pub grant_type: String,

    // Refresh
    pub refresh_threshold: u64,
    pub check_interval: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub refresh_timeout: u64,
    pub token_lifetime_hours: u64,

    // Logging
    pub status_interval: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > .env file > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let credential_rules = match args.credential_rules.as_deref() {
            Some(json) if !json.trim().is_empty() => parse_credential_rules(json)?,
            _ => HashMap::new(),
        };

        Ok(Config {
            env_file: args.env_file.map(|s| expand_tilde(&s)),
            credential_prefix: args.credential_prefix,
            credential_rules,

            base_url: args.base_url,
            token_path: args.token_path,
            grant_type: args.grant_type,

            refresh_threshold: args.refresh_threshold,
            check_interval: args.check_interval,
            max_attempts: args.max_attempts,
            backoff_base_ms: args.backoff_base_ms,
            backoff_cap_ms: args.backoff_cap_ms,
            refresh_timeout: args.refresh_timeout,
            token_lifetime_hours: args.token_lifetime,

            status_interval: args.status_interval,
            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref path) = self.env_file {
            if !path.exists() {
                anyhow::bail!("Credentials env file does not exist: {}", path.display());
            }
        }

        let url = url::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base URL: {}", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Base URL must be http or https: {}", self.base_url);
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max-attempts must be at least 1");
        }
        if self.check_interval == 0 {
            anyhow::bail!("check-interval must be at least 1 second");
        }
        if self.refresh_timeout == 0 {
            anyhow::bail!("refresh-timeout must be at least 1 second");
        }
        if self.token_lifetime_hours == 0 {
            anyhow::bail!("token-lifetime must be at least 1 hour");
        }
        if self.token_lifetime_hours > MAX_TOKEN_LIFETIME_HOURS {
            anyhow::bail!(
                "token-lifetime must be at most {} hours, got {}",
                MAX_TOKEN_LIFETIME_HOURS,
                self.token_lifetime_hours
            );
        }
        for (flag, secs) in [
            ("check-interval", self.check_interval),
            ("refresh-timeout", self.refresh_timeout),
            ("status-interval", self.status_interval),
        ] {
            if secs > MAX_INTERVAL_SECS {
                anyhow::bail!("{} must be at most {} seconds, got {}", flag, MAX_INTERVAL_SECS, secs);
            }
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            anyhow::bail!(
                "backoff-cap-ms ({}) must not be below backoff-base-ms ({})",
                self.backoff_cap_ms,
                self.backoff_base_ms
            );
        }
        let lifetime_secs = self.token_lifetime_hours.checked_mul(3600).with_context(|| {
            format!("token-lifetime {} hours is out of range", self.token_lifetime_hours)
        })?;
        if self.refresh_threshold >= lifetime_secs {
            anyhow::bail!("refresh-threshold must be shorter than the token lifetime");
        }

        self.default_lifetime()?;
        self.safety_margin()?;

        Ok(())
    }

    fn default_lifetime(&self) -> Result<chrono::Duration> {
        i64::try_from(self.token_lifetime_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .with_context(|| {
                format!("token-lifetime {} hours is out of range", self.token_lifetime_hours)
            })
    }

    fn safety_margin(&self) -> Result<chrono::Duration> {
        i64::try_from(self.refresh_threshold)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .with_context(|| {
                format!("refresh-threshold {} seconds is out of range", self.refresh_threshold)
            })
    }

    pub fn refresh_policy(&self) -> Result<RefreshPolicy> {
        Ok(RefreshPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_cap_ms),
            request_timeout: Duration::from_secs(self.refresh_timeout),
            default_lifetime: self.default_lifetime()?,
            ..RefreshPolicy::default()
        })
    }

    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let config = CoordinatorConfig {
            safety_margin: self.safety_margin()?,
            check_interval: Duration::from_secs(self.check_interval),
            policy: self.refresh_policy()?,
            ..CoordinatorConfig::default()
        };
        config
            .with_rules(self.credential_rules.clone())
            .context("Invalid credential rules")
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Compact,
    }
}

/// Parse `{"NAME": {rule}}` JSON
fn parse_credential_rules(json: &str) -> Result<HashMap<String, FieldRule>> {
    serde_json::from_str(json).context("CREDENTIAL_RULES is not valid rule JSON")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["broker-token-keeper"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_defaults_pass_validation() {
        let config = Config::from_args(args(&[])).unwrap();
        assert_eq!(config.credential_prefix, "UPSTOX_");
        assert_eq!(config.refresh_threshold, 300);
        assert_eq!(config.check_interval, 60);
        assert_eq!(config.log_format, LogFormat::Compact);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_refresh_policy_from_flags() {
        let config = Config::from_args(args(&[
            "--max-attempts",
            "3",
            "--backoff-base-ms",
            "250",
            "--backoff-cap-ms",
            "4000",
            "--token-lifetime",
            "12",
        ]))
        .unwrap();
        let policy = config.refresh_policy().unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(4));
        assert_eq!(policy.default_lifetime, chrono::Duration::hours(12));
    }

    #[test]
    fn test_validate_rejects_cap_below_base() {
        let config = Config::from_args(args(&[
            "--backoff-base-ms",
            "5000",
            "--backoff-cap-ms",
            "1000",
        ]))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts_and_interval() {
        let config = Config::from_args(args(&["--max-attempts", "0"])).unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_args(args(&["--check-interval", "0"])).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_durations() {
        for extra in [
            ["--token-lifetime", "3000000000000000"],
            ["--token-lifetime", "18446744073709551615"],
            ["--refresh-threshold", "18446744073709551615"],
            ["--check-interval", "18446744073709551615"],
            ["--refresh-timeout", "10000000"],
        ] {
            let config = Config::from_args(args(&extra)).unwrap();
            assert!(config.validate().is_err(), "accepted {:?}", extra);
        }

        let config = Config::from_args(args(&["--token-lifetime", "3000000000000000"])).unwrap();
        assert!(config.refresh_policy().is_err());
        assert!(config.coordinator_config().is_err());

        let config = Config::from_args(args(&["--token-lifetime", "8784"])).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.refresh_policy().unwrap().default_lifetime,
            chrono::Duration::hours(8784)
        );
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let config = Config::from_args(args(&["--base-url", "ftp://example.com"])).unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_args(args(&["--base-url", "not a url"])).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credential_rules_parsed_and_applied() {
        let config = Config::from_args(args(&[
            "--credential-rules",
            r#"{"API_KEY":{"min_len":8,"prefix":"ak-"}}"#,
        ]))
        .unwrap();
        let rule = &config.credential_rules["API_KEY"];
        assert_eq!(rule.min_len, Some(8));
        assert_eq!(rule.prefix.as_deref(), Some("ak-"));

        let coordinator = config.coordinator_config().unwrap();
        let spec = coordinator
            .credentials
            .iter()
            .find(|s| s.name == "API_KEY")
            .unwrap();
        assert_eq!(spec.rule.as_ref(), Some(rule));
    }

    #[test]
    fn test_credential_rules_reject_unknown_fields() {
        assert!(Config::from_args(args(&[
            "--credential-rules",
            r#"{"API_KEY":{"minimum":8}}"#
        ]))
        .is_err());
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/keys/.env");
        assert!(path.to_string_lossy().contains("keys/.env"));
        assert!(!path.to_string_lossy().starts_with("~"));

        assert_eq!(expand_tilde("/absolute/.env"), PathBuf::from("/absolute/.env"));
        assert_eq!(expand_tilde("~"), PathBuf::from("~"));
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("json"), LogFormat::Json);
        assert_eq!(parse_log_format("JSON"), LogFormat::Json);
        assert_eq!(parse_log_format("compact"), LogFormat::Compact);
        assert_eq!(parse_log_format("pretty"), LogFormat::Compact);
    }
}
