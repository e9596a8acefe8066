//! Comment moderation: the request-side producers of reply notifications.
//!
//! A reply notifies its parent's author the first time it becomes visible:
//! either immediately on submission (no audit needed) or when a moderator
//! accepts it. Rejection never notifies.

use std::sync::Arc;

use quill_common::error::AppError;
use quill_common::types::Comment;

use crate::reply_policy::ReplyNotifier;
use crate::repository::CommentRepository;

pub struct CommentModeration {
    comments: Arc<dyn CommentRepository>,
    notifier: Arc<ReplyNotifier>,
}

impl CommentModeration {
    pub fn new(comments: Arc<dyn CommentRepository>, notifier: Arc<ReplyNotifier>) -> Self {
        Self { comments, notifier }
    }

    /// Store a new comment and notify if it is an already-visible reply.
    pub async fn submit(&self, comment: Comment) -> Result<Comment, AppError> {
        self.comments.insert(&comment).await?;

        tracing::info!(
            comment_id = %comment.id,
            post_id = %comment.post_id,
            visible = comment.visible,
            "Comment submitted"
        );

        if comment.parent_id.is_some() && comment.visible {
            self.notifier.evaluate_reply(&comment).await?;
        }
        Ok(comment)
    }

    /// Approve a comment. A reply that was hidden or awaiting audit triggers
    /// the reply notification.
    pub async fn accept(
        &self,
        mut comment: Comment,
        reason: Option<String>,
    ) -> Result<Comment, AppError> {
        let was_need_audit = comment.is_need_audit;
        let was_visible = comment.visible;

        comment.visible = true;
        comment.is_need_audit = false;
        comment.reason = reason;
        self.comments.update(&comment).await?;

        tracing::info!(comment_id = %comment.id, "Comment accepted");

        if comment.parent_id.is_some() && (was_need_audit || !was_visible) {
            self.notifier.evaluate_reply(&comment).await?;
        }
        Ok(comment)
    }

    pub async fn reject(&self, mut comment: Comment, reason: String) -> Result<Comment, AppError> {
        comment.visible = false;
        comment.is_need_audit = false;
        comment.reason = Some(reason);
        self.comments.update(&comment).await?;

        tracing::info!(comment_id = %comment.id, "Comment rejected");
        Ok(comment)
    }
}
