//! Spam verdict audit log

use crate::db::DatabasePool;
use crate::models::{CreateSpamLog, SpamLog};
use async_trait::async_trait;
use helpdesk_common::{Error, Result};
use uuid::Uuid;

/// Spam log repository trait
#[async_trait]
pub trait SpamLogRepository: Send + Sync {
    async fn record(&self, input: CreateSpamLog) -> Result<SpamLog>;
}

/// Database spam log repository
pub struct DbSpamLogRepository {
    pool: DatabasePool,
}

impl DbSpamLogRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SpamLogRepository for DbSpamLogRepository {
    async fn record(&self, input: CreateSpamLog) -> Result<SpamLog> {
        let rules = serde_json::to_value(&input.matched_rules)
            .map_err(|e| Error::Internal(e.to_string()))?;

        sqlx::query_as::<_, SpamLog>(
            r#"
            INSERT INTO spam_logs (
                id, ticket_id, message_id, channel_id, is_spam, score, matched_rules, report, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.ticket_id)
        .bind(input.message_id)
        .bind(input.channel_id)
        .bind(input.is_spam)
        .bind(input.score)
        .bind(rules)
        .bind(&input.report)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
    }
}
