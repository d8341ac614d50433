use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::models::TelemetryFormat;
use crate::tracker::TrackerConfig;

/// Upper bound for second-valued settings, one year.
const MAX_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Monitor,
    Tracker,
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "monitor" | "admin" => Ok(Role::Monitor),
            "tracker" | "client" => Ok(Role::Tracker),
            other => Err(anyhow!("unknown SOS_ROLE: {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Monitor => f.write_str("monitor"),
            Role::Tracker => f.write_str("tracker"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub role: Role,
    pub subject_id: Option<String>,
    pub contact_email: Option<String>,
    pub device_id: Option<String>,
    pub sample_interval_secs: u64,
    pub sample_timeout_secs: u64,
    pub max_fix_age_secs: u64,
    pub stale_after_secs: u64,
    pub kafka_bootstrap_servers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub kafka_auto_offset_reset: String,
    pub kafka_sasl_mechanism: String,
    pub kafka_username: String,
    pub kafka_password: String,
    pub kafka_security_protocol: String,
    pub kafka_max_retries: u32,
    pub kafka_circuit_breaker_cooldown: u64,
    pub telemetry_format: TelemetryFormat,
    pub database_url: String,
    pub log_level: String,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `load` uses the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let seconds = |key: &str, default: u64| {
            let secs = number(key, default);
            if secs > MAX_SECS {
                return Err(anyhow!("{key} must be at most {MAX_SECS} seconds, got {secs}"));
            }
            Ok(secs)
        };

        let role: Role = var("SOS_ROLE", "monitor").parse()?;
        let subject_id = optional("SOS_SUBJECT_ID");
        let contact_email = optional("SOS_CONTACT_EMAIL");
        let device_id = optional("SOS_DEVICE_ID");
        let sample_interval_secs = seconds("SOS_SAMPLE_INTERVAL_SECS", 5)?.max(1);
        let sample_timeout_secs = seconds("SOS_SAMPLE_TIMEOUT_SECS", 10)?.max(1);
        let max_fix_age_secs = seconds("SOS_MAX_FIX_AGE_SECS", 30)?;
        let stale_after_secs = seconds("SOS_STALE_AFTER_SECS", 120)?;

        let kafka_bootstrap_servers = var("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092");
        let kafka_topic = var("KAFKA_TOPIC", "siscom-minimal");
        let kafka_group_id = var("KAFKA_GROUP_ID", "siscom-sos-tracker");
        let kafka_auto_offset_reset = var("KAFKA_AUTO_OFFSET_RESET", "latest");
        let kafka_sasl_mechanism = var("KAFKA_SASL_MECHANISM", "SCRAM-SHA-256");
        let kafka_username = var("KAFKA_USERNAME", "");
        let kafka_password = var("KAFKA_PASSWORD", "");
        let kafka_security_protocol = var("KAFKA_SECURITY_PROTOCOL", "SASL_PLAINTEXT");
        // Zero would trip the circuit breaker before every message.
        let kafka_max_retries = u32::try_from(number("KAFKA_MAX_RETRIES", 5))
            .map_err(|_| anyhow!("KAFKA_MAX_RETRIES is out of range"))?
            .max(1);
        let kafka_circuit_breaker_cooldown = seconds("KAFKA_CIRCUIT_BREAKER_COOLDOWN", 300)?;
        let telemetry_format: TelemetryFormat = var("TELEMETRY_FORMAT", "json")
            .parse()
            .map_err(|e: String| anyhow!(e))?;

        let db_host = var("DB_HOST", "localhost");
        let db_port = var("DB_PORT", "5432");
        let db_name = var("DB_DATABASE", "siscom_admin");
        let db_user = var("DB_USER", "siscom");
        let db_pwd = var("DB_PWD", "siscom");

        let database_url = format!(
            "postgres://{}:{}@{}:{}/{}",
            db_user, db_pwd, db_host, db_port, db_name
        );

        let log_level = var("LOG_LEVEL", "info");

        if role == Role::Tracker && subject_id.is_none() {
            return Err(anyhow!("SOS_SUBJECT_ID is required for the tracker role"));
        }

        Ok(Self {
            role,
            subject_id,
            contact_email,
            device_id,
            sample_interval_secs,
            sample_timeout_secs,
            max_fix_age_secs,
            stale_after_secs,
            kafka_bootstrap_servers,
            kafka_topic,
            kafka_group_id,
            kafka_auto_offset_reset,
            kafka_sasl_mechanism,
            kafka_username,
            kafka_password,
            kafka_security_protocol,
            kafka_max_retries,
            kafka_circuit_breaker_cooldown,
            telemetry_format,
            database_url,
            log_level,
        })
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            sample_interval: Duration::from_secs(self.sample_interval_secs),
            sample_timeout: Duration::from_secs(self.sample_timeout_secs),
        }
    }

    pub fn max_fix_age(&self) -> Duration {
        Duration::from_secs(self.max_fix_age_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        let secs = self.stale_after_secs.min(MAX_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }
}
