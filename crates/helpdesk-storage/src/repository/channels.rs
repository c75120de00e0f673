//! Channel repository

use crate::db::DatabasePool;
use crate::models::Channel;
use async_trait::async_trait;
use helpdesk_common::types::{ChannelId, ChannelSettings, ChannelStatus, OAuth2TokenSet};
use helpdesk_common::{Error, Result};

/// Channel repository trait
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    /// Active channels of every provider kind
    async fn list_active(&self) -> Result<Vec<Channel>>;
    async fn get(&self, id: ChannelId) -> Result<Option<Channel>>;
    /// Lookup by the channel's own address, case-insensitive
    async fn find_by_address(&self, address: &str) -> Result<Option<Channel>>;
    async fn update_settings(&self, id: ChannelId, settings: &ChannelSettings) -> Result<()>;
    async fn update_tokens(&self, id: ChannelId, tokens: &OAuth2TokenSet) -> Result<()>;
    async fn update_watermark(&self, id: ChannelId, uid: u32) -> Result<()>;
    async fn set_status(&self, id: ChannelId, status: ChannelStatus) -> Result<()>;
}

/// Database channel repository
pub struct DbChannelRepository {
    pool: DatabasePool,
}

impl DbChannelRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn set_setting(&self, id: ChannelId, key: &str, value: serde_json::Value) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE channels
            SET settings = jsonb_set(settings, ARRAY[$2]::text[], $3, true), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(key)
        .bind(value)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Channel {} not found", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelRepository for DbChannelRepository {
    async fn list_active(&self) -> Result<Vec<Channel>> {
        sqlx::query_as::<_, Channel>(
            "SELECT * FROM channels WHERE active = true ORDER BY created_at ASC",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn get(&self, id: ChannelId) -> Result<Option<Channel>> {
        sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn find_by_address(&self, address: &str) -> Result<Option<Channel>> {
        sqlx::query_as::<_, Channel>(
            "SELECT * FROM channels WHERE LOWER(email_address) = LOWER($1) AND active = true",
        )
        .bind(address)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn update_settings(&self, id: ChannelId, settings: &ChannelSettings) -> Result<()> {
        let value = serde_json::to_value(settings)
            .map_err(|e| Error::Internal(format!("Failed to encode settings: {}", e)))?;

        sqlx::query("UPDATE channels SET settings = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(value)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn update_tokens(&self, id: ChannelId, tokens: &OAuth2TokenSet) -> Result<()> {
        let value = serde_json::to_value(tokens)
            .map_err(|e| Error::Internal(format!("Failed to encode tokens: {}", e)))?;
        self.set_setting(id, "tokens", value).await
    }

    async fn update_watermark(&self, id: ChannelId, uid: u32) -> Result<()> {
        // Never move the watermark backwards
        let result = sqlx::query(
            r#"
            UPDATE channels
            SET settings = jsonb_set(settings, '{watermark}', to_jsonb($2::bigint), true),
                updated_at = NOW()
            WHERE id = $1
              AND COALESCE((settings->>'watermark')::bigint, 0) <= $2
            "#,
        )
        .bind(id)
        .bind(uid as i64)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        if result.rows_affected() == 0 {
            tracing::debug!(channel_id = %id, uid, "Watermark not advanced");
        }
        Ok(())
    }

    async fn set_status(&self, id: ChannelId, status: ChannelStatus) -> Result<()> {
        sqlx::query("UPDATE channels SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }
}
