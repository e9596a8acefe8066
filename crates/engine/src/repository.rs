//! Persistence collaborator for the blog records the reply policy reads.
//!
//! Lookups that find nothing return `Ok(None)`; only infrastructure faults
//! are errors.

use async_trait::async_trait;
use sqlx::PgPool;

use quill_common::error::AppError;
use quill_common::types::{AnonymousUser, Comment, Post};

#[async_trait]
pub trait CommentRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Comment>, AppError>;

    async fn insert(&self, comment: &Comment) -> Result<(), AppError>;

    async fn update(&self, comment: &Comment) -> Result<(), AppError>;

    /// All comments on a post, oldest first.
    async fn list_by_post(&self, post_id: &str) -> Result<Vec<Comment>, AppError>;
}

#[async_trait]
pub trait AnonymousUserRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<AnonymousUser>, AppError>;
}

#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Post>, AppError>;
}

/// PostgreSQL implementation of every blog repository.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommentRepository for PgRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Comment>, AppError> {
        let comment: Option<Comment> = sqlx::query_as("SELECT * FROM comments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(comment)
    }

    async fn insert(&self, comment: &Comment) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO comments (id, post_id, parent_id, anonymous_user_id, content, visible, is_need_audit, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&comment.id)
        .bind(&comment.post_id)
        .bind(&comment.parent_id)
        .bind(&comment.anonymous_user_id)
        .bind(&comment.content)
        .bind(comment.visible)
        .bind(comment.is_need_audit)
        .bind(&comment.reason)
        .bind(comment.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, comment: &Comment) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE comments
            SET content = $2, visible = $3, is_need_audit = $4, reason = $5
            WHERE id = $1
            "#,
        )
        .bind(&comment.id)
        .bind(&comment.content)
        .bind(comment.visible)
        .bind(comment.is_need_audit)
        .bind(&comment.reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Comment {} not found", comment.id)));
        }
        Ok(())
    }

    async fn list_by_post(&self, post_id: &str) -> Result<Vec<Comment>, AppError> {
        let comments: Vec<Comment> = sqlx::query_as(
            "SELECT * FROM comments WHERE post_id = $1 ORDER BY created_at ASC",
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(comments)
    }
}

#[async_trait]
impl AnonymousUserRepository for PgRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<AnonymousUser>, AppError> {
        let user: Option<AnonymousUser> =
            sqlx::query_as("SELECT * FROM anonymous_users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(user)
    }
}

#[async_trait]
impl PostRepository for PgRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Post>, AppError> {
        let post: Option<Post> = sqlx::query_as("SELECT id, title, slug FROM posts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(post)
    }
}
