use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionsConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub stripe: StripeConfig,
    pub smtp: SmtpConfig,
    pub scheduler: SchedulerConfig,
    pub invoice: InvoiceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: Secret<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeConfig {
    pub api_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
    /// Where the hosted checkout page sends the client after paying.
    pub success_url: String,
    pub webhook_tolerance_seconds: i64,
    pub timeout_seconds: u64,
}

impl StripeConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.expose_secret().is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret<String>,
    pub from_email: String,
    pub from_name: String,
    pub enabled: bool,
    /// Default reply-to for client-facing emails.
    pub support_reply_to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_seconds: u64,
    pub default_delay_days: i64,
    pub renotify_interval_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceConfig {
    pub terms_and_conditions: Option<String>,
}

impl CollectionsConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = common_config.is_production();

        Ok(CollectionsConfig {
            common: common_config,
            service_name: get_env("SERVICE_NAME", Some("collections-service"), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            database: DatabaseConfig {
                url: Secret::new(get_env("DATABASE_URL", None, is_prod)?),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2),
            },
            redis: RedisConfig {
                url: Secret::new(get_env(
                    "REDIS_URL",
                    Some("redis://localhost:6379"),
                    is_prod,
                )?),
            },
            stripe: StripeConfig {
                api_key: Secret::new(get_env("STRIPE_API_KEY", Some(""), is_prod)?),
                webhook_secret: Secret::new(get_env("STRIPE_WEBHOOK_SECRET", Some(""), is_prod)?),
                api_base_url: get_env(
                    "STRIPE_API_BASE_URL",
                    Some("https://api.stripe.com"),
                    false,
                )?,
                success_url: get_env(
                    "STRIPE_SUCCESS_URL",
                    Some("https://evershift.com/payment/success"),
                    false,
                )?,
                webhook_tolerance_seconds: parse_env("STRIPE_WEBHOOK_TOLERANCE_SECONDS", 300),
                timeout_seconds: parse_env("PAYMENT_PROVIDER_TIMEOUT_SECONDS", 10),
            },
            smtp: SmtpConfig {
                host: get_env("SMTP_HOST", Some("smtp.gmail.com"), is_prod)?,
                port: parse_env("SMTP_PORT", 587),
                user: get_env("SMTP_USER", Some(""), is_prod)?,
                password: Secret::new(get_env("SMTP_PASSWORD", Some(""), is_prod)?),
                from_email: get_env("SMTP_FROM_EMAIL", Some("billing@evershift.com"), is_prod)?,
                from_name: get_env("SMTP_FROM_NAME", Some("Evershift Billing"), false)?,
                enabled: parse_env("SMTP_ENABLED", false),
                support_reply_to: get_env(
                    "SUPPORT_REPLY_TO",
                    Some("support@evershift.com"),
                    false,
                )?,
            },
            scheduler: SchedulerConfig {
                enabled: parse_env("SCHEDULER_ENABLED", true),
                tick_seconds: parse_env("SCHEDULER_TICK_SECONDS", 60),
                default_delay_days: parse_env("FOLLOW_UP_DEFAULT_DELAY_DAYS", 1),
                renotify_interval_days: parse_env("FOLLOW_UP_RENOTIFY_DAYS", 5),
            },
            invoice: InvoiceConfig {
                terms_and_conditions: env::var("INVOICE_TERMS_AND_CONDITIONS")
                    .ok()
                    .filter(|v| !v.is_empty()),
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
