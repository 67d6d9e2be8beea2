//! Configuration, built from environment variables.

use std::time::Duration;

use chrono_tz::Tz;
use secrecy::SecretString;

use crate::error::ConfigError;

/// Default fact sheet the reply composer is constrained to when none is
/// configured. Kept deliberately generic; deployments override it.
pub const DEFAULT_FACT_SHEET: &str = "\
We run a professional directory that helps local businesses get found by \
new clients. Listings include a profile page, reviews, and direct contact. \
Pricing and onboarding details are shared on a short intro call.";

/// Scheduler and sending configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the local libSQL database file.
    pub db_path: String,
    /// Timezone the sending-hour window is evaluated in.
    pub timezone: Tz,
    /// Sending window start hour (inclusive, 0-23).
    pub send_start_hour: u32,
    /// Sending window end hour (exclusive, 0-23).
    pub send_end_hour: u32,
    /// Fallback per-inbox hourly send budget when the inbox has none.
    pub default_max_per_hour: u32,
    /// Dispatch cycle cadence.
    pub dispatch_interval: Duration,
    /// Response ingest cycle cadence.
    pub ingest_interval: Duration,
    /// Classify-and-reply cycle cadence.
    pub respond_interval: Duration,
    /// Minimum classifier confidence for auto-sending an AI draft.
    /// Below this, the draft is flagged for manual review instead.
    pub auto_send_threshold: f64,
    /// Fact sheet the reply composer is constrained to.
    pub fact_sheet: String,
    /// Anthropic API key. When absent the AI layer is disabled.
    pub api_key: Option<SecretString>,
    /// Model used for classification and reply drafting.
    pub model: String,
    /// Timeout applied to every provider call.
    pub llm_timeout: Duration,
    /// Timeout applied to SMTP/IMAP operations.
    pub mail_timeout: Duration,
}

impl Config {
    /// Build config from environment variables, with defaults matching a
    /// small single-tenant deployment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let timezone_raw =
            std::env::var("OUTREACH_TIMEZONE").unwrap_or_else(|_| "America/Mexico_City".into());
        let timezone: Tz = timezone_raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "OUTREACH_TIMEZONE".into(),
                message: format!("unknown timezone {timezone_raw:?}"),
            })?;

        let send_start_hour = env_u32("SENDING_HOURS_START", 9)?;
        let send_end_hour = env_u32("SENDING_HOURS_END", 17)?;
        if send_start_hour > 23 || send_end_hour > 24 || send_start_hour >= send_end_hour {
            return Err(ConfigError::InvalidValue {
                key: "SENDING_HOURS_START/SENDING_HOURS_END".into(),
                message: format!("invalid window {send_start_hour}..{send_end_hour}"),
            });
        }

        let auto_send_threshold = match std::env::var("AUTO_SEND_THRESHOLD") {
            Ok(raw) => raw.parse::<f64>().map_err(|e| ConfigError::InvalidValue {
                key: "AUTO_SEND_THRESHOLD".into(),
                message: e.to_string(),
            })?,
            Err(_) => 0.5,
        };

        Ok(Self {
            db_path: std::env::var("OUTREACH_DB_PATH").unwrap_or_else(|_| "./data/crm.db".into()),
            timezone,
            send_start_hour,
            send_end_hour,
            default_max_per_hour: env_u32("MAX_EMAILS_PER_HOUR", 5)?,
            dispatch_interval: Duration::from_secs(
                u64::from(env_u32("SEND_CHECK_INTERVAL_MIN", 60)?) * 60,
            ),
            ingest_interval: Duration::from_secs(
                u64::from(env_u32("RESPONSE_CHECK_INTERVAL_MIN", 10)?) * 60,
            ),
            respond_interval: Duration::from_secs(
                u64::from(env_u32("AUTO_REPLY_INTERVAL_MIN", 15)?) * 60,
            ),
            auto_send_threshold,
            fact_sheet: std::env::var("OUTREACH_FACT_SHEET")
                .unwrap_or_else(|_| DEFAULT_FACT_SHEET.to_string()),
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            model: std::env::var("OUTREACH_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".into()),
            llm_timeout: Duration::from_secs(u64::from(env_u32("LLM_TIMEOUT_SECS", 60)?)),
            mail_timeout: Duration::from_secs(u64::from(env_u32("MAIL_TIMEOUT_SECS", 30)?)),
        })
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an integer, got {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u32_uses_default_when_unset() {
        assert_eq!(env_u32("OUTREACH_TEST_UNSET_VAR", 7).unwrap(), 7);
    }
}
