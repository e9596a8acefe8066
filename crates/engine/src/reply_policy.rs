//! Reply notification policy.
//!
//! Decides whether a newly visible reply warrants an email to the author of
//! the comment it answers, composes that email, and writes it to the outbox.
//! Rejections are routine and silent: they return `Ok(None)`.
//!
//! Every notification carries the dedup key `comment-reply:<reply id>`, so the
//! policy can run again for the same reply (on creation, then on moderation
//! approval) without producing a second email.

use std::sync::Arc;

use quill_common::config::{AppConfig, DEFAULT_SITE_HOST};
use quill_common::error::AppError;
use quill_common::types::{Comment, EmailPayload, OutboxMessage, Post};
use quill_outbox::{EnqueueRequest, OutboxStore};

use crate::html;
use crate::repository::{AnonymousUserRepository, CommentRepository, PostRepository};

const DEDUP_KEY_PREFIX: &str = "comment-reply:";

/// Dedup key bounding one notification per reply.
pub fn dedup_key(reply_id: &str) -> String {
    format!("{}{}", DEDUP_KEY_PREFIX, reply_id)
}

/// Site values that end up in notification emails.
#[derive(Debug, Clone)]
pub struct NotificationSettings {
    /// Base URL without a trailing slash
    pub site_host: String,
    pub site_name: String,
}

impl NotificationSettings {
    pub fn new(site_host: &str, site_name: &str) -> Self {
        let host = site_host.trim();
        let host = if host.is_empty() { DEFAULT_SITE_HOST } else { host };
        Self {
            site_host: host.trim_end_matches('/').to_string(),
            site_name: site_name.to_string(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.site_host, &config.site_name)
    }

    /// Slug permalink when the post has one, id route otherwise.
    pub fn post_url(&self, post_id: &str, post: Option<&Post>) -> String {
        match post.and_then(|p| p.slug.as_deref()).filter(|s| !s.is_empty()) {
            Some(slug) => format!("{}/p/{}", self.site_host, urlencoding::encode(slug)),
            None => format!("{}/Blog/Post/{}", self.site_host, urlencoding::encode(post_id)),
        }
    }
}

/// An approved notification, ready for the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyNotification {
    pub email: EmailPayload,
    pub dedup_key: String,
}

impl ReplyNotification {
    pub fn to_request(&self) -> Result<EnqueueRequest, AppError> {
        EnqueueRequest::email(&self.email, Some(self.dedup_key.clone()))
    }
}

pub struct ReplyNotifier {
    comments: Arc<dyn CommentRepository>,
    users: Arc<dyn AnonymousUserRepository>,
    posts: Arc<dyn PostRepository>,
    outbox: Arc<dyn OutboxStore>,
    settings: NotificationSettings,
}

impl ReplyNotifier {
    pub fn new(
        comments: Arc<dyn CommentRepository>,
        users: Arc<dyn AnonymousUserRepository>,
        posts: Arc<dyn PostRepository>,
        outbox: Arc<dyn OutboxStore>,
        settings: NotificationSettings,
    ) -> Self {
        Self {
            comments,
            users,
            posts,
            outbox,
            settings,
        }
    }

    /// Evaluate a reply and enqueue its notification when warranted.
    ///
    /// Returns the outbox row (new, or the existing one for this reply), or
    /// `None` when no notification is warranted.
    pub async fn evaluate_reply(&self, reply: &Comment) -> Result<Option<OutboxMessage>, AppError> {
        let Some(notification) = self.build_request(reply).await? else {
            return Ok(None);
        };

        let message = self.outbox.enqueue(notification.to_request()?).await?;
        Ok(Some(message))
    }

    /// Apply the policy without touching the outbox.
    pub async fn build_request(
        &self,
        reply: &Comment,
    ) -> Result<Option<ReplyNotification>, AppError> {
        let Some(parent_id) = reply.parent_id.as_deref() else {
            return Ok(None);
        };
        if !reply.visible {
            return Ok(skip(reply, "reply not visible"));
        }
        let Some(replier_id) = reply
            .anonymous_user_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        else {
            return Ok(skip(reply, "reply has no author"));
        };

        let Some(replier) = self.users.find_by_id(replier_id).await? else {
            return Ok(skip(reply, "reply author not found"));
        };
        let Some(parent) = self.comments.find_by_id(parent_id).await? else {
            return Ok(skip(reply, "parent comment not found"));
        };
        let Some(parent_author_id) = parent.anonymous_user_id.as_deref() else {
            return Ok(skip(reply, "parent comment has no author"));
        };
        let Some(parent_author) = self.users.find_by_id(parent_author_id).await? else {
            return Ok(skip(reply, "parent author not found"));
        };
        let Some(parent_email) = parent_author
            .email
            .as_deref()
            .filter(|e| !e.trim().is_empty())
        else {
            return Ok(skip(reply, "parent author has no email"));
        };

        if parent_author_id == replier_id {
            return Ok(skip(reply, "self reply"));
        }
        if let Some(replier_email) = replier.email.as_deref()
            && parent_email.to_lowercase() == replier_email.to_lowercase()
        {
            return Ok(skip(reply, "parent and replier share a mailbox"));
        }

        let post = self.posts.find_by_id(&reply.post_id).await?;
        let post_url = self.settings.post_url(&reply.post_id, post.as_ref());
        let title = post.as_ref().map_or(reply.post_id.as_str(), |p| p.title.as_str());

        let email = EmailPayload {
            subject: compose_subject(&self.settings.site_name, title),
            html_body: compose_body(&parent_author.name, &replier.name, &reply.content, &post_url),
            to_name: parent_author.name.clone(),
            to_address: parent_email.to_string(),
        };

        tracing::debug!(
            reply_id = %reply.id,
            parent_id,
            to_address = %email.to_address,
            "Reply notification approved"
        );

        Ok(Some(ReplyNotification {
            email,
            dedup_key: dedup_key(&reply.id),
        }))
    }
}

fn skip<T>(reply: &Comment, reason: &'static str) -> Option<T> {
    tracing::debug!(reply_id = %reply.id, reason, "Reply notification skipped");
    None
}

fn compose_subject(site_name: &str, post_title: &str) -> String {
    format!(
        "[{}] Your comment on \"{}\" received a reply",
        site_name,
        html::escape(post_title)
    )
}

fn compose_body(recipient: &str, replier: &str, content: &str, post_url: &str) -> String {
    let url = html::escape(post_url);
    let mut body = String::new();
    body.push_str(&format!("<p>Hi {},</p>\n", html::escape(recipient)));
    body.push_str(&format!(
        "<p><b>{}</b> replied to your comment:</p>\n",
        html::escape(replier)
    ));
    body.push_str(&format!(
        "<blockquote style=\"margin:12px 0;padding:10px 12px;border-left:4px solid #ddd;background:#fafafa;\">{}</blockquote>\n",
        html::escape_multiline(content)
    ));
    body.push_str(&format!("<p>View it here: <a href=\"{0}\">{0}</a></p>\n", url));
    body
}
