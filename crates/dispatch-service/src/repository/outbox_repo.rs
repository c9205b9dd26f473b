//! outbox 仓储
//!
//! 事件信封序列化为 jsonb 行追加到 outbox_events 表。聚合仓储通过
//! `append_in_tx` 把事件追加挂到自己的事务里，保证状态变更与事件
//! 写入的原子性；中继进程按 id 升序拉取未发布的行。

use async_trait::async_trait;
use chrono::Utc;
use notify_shared::events::EventEnvelope;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::traits::{OutboxRepository, OutboxRow};
use crate::error::Result;

/// 在既有事务中追加事件行
///
/// 所有聚合仓储的写路径共用此入口，事件行与聚合变更同生共死。
pub(crate) async fn append_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    events: &[EventEnvelope],
) -> Result<()> {
    for envelope in events {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (event_id, event_name, partition_key, payload, appended_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&envelope.event_id)
        .bind(envelope.event.name())
        .bind(envelope.event.partition_key())
        .bind(serde_json::to_value(envelope)?)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Postgres outbox 仓储
pub struct PgOutboxRepository {
    pool: PgPool,
}

impl PgOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxRepository {
    async fn append(&self, events: &[EventEnvelope]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        append_in_tx(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_unpublished(&self, limit: i64) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, appended_at, published_at
            FROM outbox_events
            WHERE published_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.try_get("payload")?;
            out.push(OutboxRow {
                id: row.try_get("id")?,
                envelope: serde_json::from_value(payload)?,
                appended_at: row.try_get("appended_at")?,
                published_at: row.try_get("published_at")?,
            });
        }
        Ok(out)
    }

    async fn mark_published(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET published_at = $1
            WHERE id = ANY($2)
            "#,
        )
        .bind(Utc::now())
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
