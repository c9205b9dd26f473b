//! 通知请求仓储
//!
//! 请求聚合整体存为 jsonb 快照，status/version/dedup_key 提升为
//! 索引列。dedup_key 上的唯一约束是幂等创建的最终防线（Redis
//! 预约只是快路径）。保存走 CAS：WHERE version = expected。

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::outbox_repo::append_in_tx;
use super::traits::RequestRepository;
use crate::error::{DispatchError, Result};
use crate::models::NotificationRequest;
use notify_shared::events::EventEnvelope;

/// Postgres 通知请求仓储
pub struct PgRequestRepository {
    pool: PgPool,
}

impl PgRequestRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<NotificationRequest> {
        let data: serde_json::Value = row.try_get("data")?;
        Ok(serde_json::from_value(data)?)
    }
}

#[async_trait]
impl RequestRepository for PgRequestRepository {
    async fn get(&self, id: &str) -> Result<Option<NotificationRequest>> {
        let row = sqlx::query(
            r#"
            SELECT data FROM notification_requests WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn get_by_dedup_key(&self, dedup_key: &str) -> Result<Option<NotificationRequest>> {
        let row = sqlx::query(
            r#"
            SELECT data FROM notification_requests WHERE dedup_key = $1
            "#,
        )
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn insert(&self, request: &NotificationRequest, events: &[EventEnvelope]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO notification_requests
                (id, dedup_key, status, version, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(&request.id)
        .bind(&request.dedup_key)
        .bind(request.status.to_string())
        .bind(request.version)
        .bind(serde_json::to_value(request)?)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&mut *tx)
        .await?;

        // 并发创建同 dedup_key 的请求，由调用方改走读取存量的路径
        if result.rows_affected() == 0 {
            return Err(DispatchError::ConcurrencyConflict {
                entity: "NotificationRequest".to_string(),
                id: request.dedup_key.clone(),
            });
        }

        append_in_tx(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save(
        &self,
        request: &NotificationRequest,
        expected_version: i64,
        events: &[EventEnvelope],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let mut persisted = request.clone();
        persisted.version = expected_version + 1;

        let result = sqlx::query(
            r#"
            UPDATE notification_requests
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
                entity: "NotificationRequest".to_string(),
                id: request.id.clone(),
            });
        }

        append_in_tx(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }
}
