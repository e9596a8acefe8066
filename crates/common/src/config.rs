use serde::Deserialize;

use crate::error::AppError;

/// Site URL used for permalinks when `SITE_HOST` is not set.
pub const DEFAULT_SITE_HOST: &str = "https://blog.deali.cn";

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Public base URL of the blog, used to build post permalinks
    pub site_host: String,

    /// Site name shown in notification subjects
    pub site_name: String,

    /// Resend API key for email delivery. Emails are only logged when unset.
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: String,

    /// How often the outbox dispatcher polls for pending rows, in milliseconds
    pub outbox_poll_interval_ms: u64,

    /// Maximum number of pending rows claimed per dispatch pass
    pub outbox_batch_size: i64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            site_host: std::env::var("SITE_HOST")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SITE_HOST.to_string()),
            site_name: std::env::var("SITE_NAME").unwrap_or_else(|_| "StarBlog".to_string()),
            resend_api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "noreply@localhost".to_string()),
            outbox_poll_interval_ms: std::env::var("OUTBOX_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("OUTBOX_POLL_INTERVAL_MS must be a valid u64"))?,
            outbox_batch_size: parse_batch_size(
                &std::env::var("OUTBOX_BATCH_SIZE").unwrap_or_else(|_| "50".to_string()),
            )?,
        })
    }
}

fn parse_batch_size(raw: &str) -> Result<i64, AppError> {
    match raw.trim().parse::<i64>() {
        Ok(size) if size >= 1 => Ok(size),
        _ => Err(AppError::Config(format!(
            "OUTBOX_BATCH_SIZE must be a positive integer, got {:?}",
            raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_accepts_positive() {
        assert_eq!(parse_batch_size("50").unwrap(), 50);
        assert_eq!(parse_batch_size(" 1 ").unwrap(), 1);
    }

    #[test]
    fn test_batch_size_rejects_zero_negative_and_garbage() {
        for raw in ["0", "-1", "abc", ""] {
            assert!(matches!(parse_batch_size(raw), Err(AppError::Config(_))));
        }
    }
}
