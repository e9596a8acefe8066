use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Outbox task type tag for transactional email.
pub const EMAIL_SEND: &str = "email.send";

/// Closed set of outbox task types with a registered meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    EmailSend,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::EmailSend => EMAIL_SEND,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            EMAIL_SEND => Ok(TaskKind::EmailSend),
            other => Err(AppError::Validation(format!("Unknown task type '{}'", other))),
        }
    }
}

/// Lifecycle state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboxStatus::Pending => write!(f, "pending"),
            OutboxStatus::Processing => write!(f, "processing"),
            OutboxStatus::Sent => write!(f, "sent"),
            OutboxStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
    pub status: OutboxStatus,
    pub attempt: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Payload of an `email.send` outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub subject: String,
    pub html_body: String,
    pub to_name: String,
    pub to_address: String,
}

/// A blog comment. Replies carry the id of the comment they answer.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub parent_id: Option<String>,
    pub anonymous_user_id: Option<String>,
    pub content: String,
    pub visible: bool,
    pub is_need_audit: bool,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A commenter identified by email rather than by account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnonymousUser {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub url: Option<String>,
    pub ip: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// The subset of a blog post the notification pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub slug: Option<String>,
}
