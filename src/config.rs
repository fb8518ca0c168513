//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Reasoning model used when `DEFAULT_MODEL` is not set.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano-2025-04-14";

/// Tunables of the conversation core.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Quiet period after the last attachment before a batch is flushed.
    pub quiet_period: Duration,
    /// Maximum number of history entries kept per session.
    pub max_history: usize,
    /// Upper bound on any single collaborator call.
    pub collaborator_timeout: Duration,
    /// Backoff policy for transient collaborator failures.
    pub retry: RetryPolicy,
    /// Attempts at generating and delivering the policy before apologising.
    pub policy_delivery_attempts: u32,
    /// The fixed, non-negotiable price.
    pub price: Decimal,
    pub currency: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(2),
            max_history: 64,
            collaborator_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            policy_delivery_attempts: 3,
            price: dec!(100),
            currency: "USD".to_string(),
        }
    }
}

/// Deployment settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bot_token: String,
    pub allowed_users: Vec<String>,
    pub openai_api_key: SecretString,
    pub mindee_api_key: SecretString,
    pub mindee_account_name: String,
    pub model: String,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub log_level: String,
    pub log_file: PathBuf,
    pub orchestrator: OrchestratorConfig,
}

impl Settings {
    /// Load settings from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, ConfigError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        let bot_token = required("BOT_TOKEN")?;
        let openai_api_key = SecretString::from(required("OPENAI_API_KEY")?);
        let mindee_api_key = SecretString::from(required("MINDEE_API_KEY")?);
        let mindee_account_name = required("MINDEE_ACCOUNT_NAME")?;

        let data_dir = PathBuf::from(
            lookup("DATA_DIRECTORY_PATH").unwrap_or_else(|| "./data".to_string()),
        );
        let database_path = data_dir
            .join(lookup("DATABASE_FILENAME").unwrap_or_else(|| "db.sqlite".to_string()));
        let log_file = lookup("LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("bot.log"));

        let allowed_users = lookup("TELEGRAM_ALLOWED_USERS")
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let defaults = OrchestratorConfig::default();
        let quiet_secs: f64 = parse_or(&lookup, "MEDIA_GROUP_TIMEOUT", 2.0)?;
        let quiet_period = Duration::try_from_secs_f64(quiet_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "MEDIA_GROUP_TIMEOUT".into(),
                message: "must be a positive number of seconds".into(),
            })?;
        let max_history: usize = parse_or(&lookup, "MAX_MESSAGES", defaults.max_history)?;
        if max_history == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_MESSAGES".into(),
                message: "must be at least 1".into(),
            });
        }
        let timeout_secs: u64 = parse_or(&lookup, "COLLABORATOR_TIMEOUT_SECS", 30)?;
        let max_retries: u32 =
            parse_or(&lookup, "COLLABORATOR_MAX_RETRIES", defaults.retry.max_retries)?;
        let price: Decimal = parse_or(&lookup, "INSURANCE_PRICE", defaults.price)?;

        let orchestrator = OrchestratorConfig {
            quiet_period,
            max_history,
            collaborator_timeout: Duration::from_secs(timeout_secs),
            retry: RetryPolicy {
                max_retries,
                ..defaults.retry
            },
            price,
            currency: lookup("INSURANCE_CURRENCY").unwrap_or(defaults.currency),
            ..defaults
        };

        Ok(Self {
            bot_token,
            allowed_users,
            openai_api_key,
            mindee_api_key,
            mindee_account_name,
            model: lookup("DEFAULT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            data_dir,
            database_path,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_file,
            orchestrator,
        })
    }

    /// Create the data directory if it does not exist yet.
    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("BOT_TOKEN", "123:abc"),
        ("OPENAI_API_KEY", "sk-test"),
        ("MINDEE_API_KEY", "md-test"),
        ("MINDEE_ACCOUNT_NAME", "acme"),
    ];

    #[test]
    fn defaults_applied() {
        let settings = Settings::from_lookup(lookup_from(REQUIRED)).unwrap();
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.database_path, PathBuf::from("./data/db.sqlite"));
        assert_eq!(settings.log_file, PathBuf::from("./data/bot.log"));
        assert_eq!(settings.allowed_users, vec!["*".to_string()]);
        assert_eq!(settings.orchestrator.quiet_period, Duration::from_secs(2));
        assert_eq!(settings.orchestrator.max_history, 64);
        assert_eq!(settings.orchestrator.price, dec!(100));
        assert_eq!(settings.openai_api_key.expose_secret(), "sk-test");
    }

    #[test]
    fn missing_required_var() {
        let err = Settings::from_lookup(lookup_from(&REQUIRED[1..])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "BOT_TOKEN"));
    }

    #[test]
    fn overrides_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("MEDIA_GROUP_TIMEOUT", "0.5"),
            ("MAX_MESSAGES", "10"),
            ("DATA_DIRECTORY_PATH", "/var/lib/bot"),
            ("INSURANCE_PRICE", "129.99"),
            ("TELEGRAM_ALLOWED_USERS", "alice, 42"),
        ]);
        let settings = Settings::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(settings.orchestrator.quiet_period, Duration::from_millis(500));
        assert_eq!(settings.orchestrator.max_history, 10);
        assert_eq!(settings.orchestrator.price, dec!(129.99));
        assert_eq!(settings.database_path, PathBuf::from("/var/lib/bot/db.sqlite"));
        assert_eq!(settings.allowed_users, vec!["alice".to_string(), "42".to_string()]);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("MAX_MESSAGES", "lots"));
        let err = Settings::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MAX_MESSAGES"));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("MEDIA_GROUP_TIMEOUT", "-1"));
        assert!(Settings::from_lookup(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn out_of_range_quiet_period_rejected() {
        for value in ["1e20", "0", "NaN", "inf"] {
            let mut pairs = REQUIRED.to_vec();
            pairs.push(("MEDIA_GROUP_TIMEOUT", value));
            let err = Settings::from_lookup(lookup_from(&pairs)).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MEDIA_GROUP_TIMEOUT"),
                "{value}"
            );
        }
    }
}
