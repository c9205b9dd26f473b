//! 投递日志仓储
//!
//! (request_id, channel, address) 上的唯一约束保证同一幂等键
//! 永远只有一行日志；`create_if_absent` 冲突时返回存量。
//! 频控统计直接在日志表上按冗余的 user_id/notification_type 聚合。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::outbox_repo::append_in_tx;
use super::traits::DeliveryLogRepository;
use crate::error::{DispatchError, Result};
use crate::models::SentNotificationLog;
use notify_shared::events::{Channel, EventEnvelope};

/// Postgres 投递日志仓储
pub struct PgDeliveryLogRepository {
    pool: PgPool,
}

impl PgDeliveryLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<SentNotificationLog> {
        let data: serde_json::Value = row.try_get("data")?;
        Ok(serde_json::from_value(data)?)
    }

    fn from_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<SentNotificationLog>> {
        rows.iter().map(Self::from_row).collect()
    }
}

#[async_trait]
impl DeliveryLogRepository for PgDeliveryLogRepository {
    async fn get(&self, id: &str) -> Result<Option<SentNotificationLog>> {
        let row = sqlx::query(r#"SELECT data FROM sent_notification_logs WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn get_by_key(
        &self,
        request_id: &str,
        channel: Channel,
        address: &str,
    ) -> Result<Option<SentNotificationLog>> {
        let row = sqlx::query(
            r#"
            SELECT data FROM sent_notification_logs
            WHERE request_id = $1 AND channel = $2 AND address = $3
            "#,
        )
        .bind(request_id)
        .bind(channel.to_string())
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn create_if_absent(
        &self,
        log: &SentNotificationLog,
        events: &[EventEnvelope],
    ) -> Result<SentNotificationLog> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO sent_notification_logs
                (id, request_id, user_id, notification_type, channel, address,
                 status, version, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (request_id, channel, address) DO NOTHING
            "#,
        )
        .bind(&log.id)
        .bind(&log.request_id)
        .bind(&log.user_id)
        .bind(&log.notification_type)
        .bind(log.channel.to_string())
        .bind(&log.address)
        .bind(log.status.to_string())
        .bind(log.version)
        .bind(serde_json::to_value(log)?)
        .bind(log.created_at)
        .bind(log.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // 同键日志已存在（并发重复调度），返回存量
            tx.rollback().await?;
            return self
                .get_by_key(&log.request_id, log.channel, &log.address)
                .await?
                .ok_or_else(|| DispatchError::NotFound {
                    entity: "SentNotificationLog".to_string(),
                    id: log.id.clone(),
                });
        }

        append_in_tx(&mut tx, events).await?;
        tx.commit().await?;
        Ok(log.clone())
    }

    async fn save(
        &self,
        log: &SentNotificationLog,
        expected_version: i64,
        events: &[EventEnvelope],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let mut persisted = log.clone();
        persisted.version = expected_version + 1;

        let result = sqlx::query(
            r#"
            UPDATE sent_notification_logs
            SET status = $1, version = $2, data = $3, updated_at = $4
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(persisted.status.to_string())
        .bind(persisted.version)
        .bind(serde_json::to_value(&persisted)?)
        .bind(persisted.updated_at)
        .bind(&persisted.id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DispatchError::ConcurrencyConflict {
                entity: "SentNotificationLog".to_string(),
                id: log.id.clone(),
            });
        }

        append_in_tx(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_by_request(&self, request_id: &str) -> Result<Vec<SentNotificationLog>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM sent_notification_logs
            WHERE request_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        Self::from_rows(rows)
    }

    async fn list_by_address(&self, address: &str) -> Result<Vec<SentNotificationLog>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM sent_notification_logs
            WHERE address = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;

        Self::from_rows(rows)
    }

    async fn list_failed_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SentNotificationLog>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM sent_notification_logs
            WHERE status = 'FAILED' AND updated_at < $1
            ORDER BY updated_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Self::from_rows(rows)
    }

    async fn count_recent_sends(
        &self,
        user_id: &str,
        notification_type: &str,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sent_notification_logs
            WHERE user_id = $1
              AND notification_type = $2
              AND status IN ('SENT', 'DELIVERED', 'READ')
              AND updated_at >= $3
            "#,
        )
        .bind(user_id)
        .bind(notification_type)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u32)
    }
}
