//! 模板仓储
//!
//! 版本行只增不改：发布新版本时在同一事务中把旧 Active 的状态列
//! 降为 DEPRECATED 并插入新行。(name, channel) 上 status = 'ACTIVE'
//! 的部分唯一索引保证任意时刻至多一个 Active 版本。

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::outbox_repo::append_in_tx;
use super::traits::TemplateRepository;
use crate::error::Result;
use crate::models::{NotificationTemplate, TemplateStatus};
use notify_shared::events::{Channel, EventEnvelope};

/// Postgres 模板仓储
pub struct PgTemplateRepository {
    pool: PgPool,
}

impl PgTemplateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<NotificationTemplate> {
        let data: serde_json::Value = row.try_get("data")?;
        Ok(serde_json::from_value(data)?)
    }
}

#[async_trait]
impl TemplateRepository for PgTemplateRepository {
    async fn get_active(
        &self,
        name: &str,
        channel: Channel,
    ) -> Result<Option<NotificationTemplate>> {
        let row = sqlx::query(
            r#"
            SELECT data FROM notification_templates
            WHERE name = $1 AND channel = $2 AND status = 'ACTIVE'
            "#,
        )
        .bind(name)
        .bind(channel.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn get_version(
        &self,
        name: &str,
        channel: Channel,
        version: i32,
    ) -> Result<Option<NotificationTemplate>> {
        let row = sqlx::query(
            r#"
            SELECT data FROM notification_templates
            WHERE name = $1 AND channel = $2 AND version = $3
            "#,
        )
        .bind(name)
        .bind(channel.to_string())
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn latest_version(&self, name: &str, channel: Channel) -> Result<Option<i32>> {
        let version: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT MAX(version) FROM notification_templates
            WHERE name = $1 AND channel = $2
            "#,
        )
        .bind(name)
        .bind(channel.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(version)
    }

    async fn publish(
        &self,
        template: &NotificationTemplate,
        events: &[EventEnvelope],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // 旧 Active 降级。模板文本所在的 data 列只改 status 字段
        sqlx::query(
            r#"
            UPDATE notification_templates
            SET status = $1,
                data = jsonb_set(data, '{status}', '"DEPRECATED"')
            WHERE name = $2 AND channel = $3 AND status = 'ACTIVE'
            "#,
        )
        .bind(template_status_str(TemplateStatus::Deprecated))
        .bind(&template.name)
        .bind(template.channel.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO notification_templates
                (id, name, channel, version, status, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(template.channel.to_string())
        .bind(template.version)
        .bind(template_status_str(template.status))
        .bind(serde_json::to_value(template)?)
        .bind(template.created_at)
        .execute(&mut *tx)
        .await?;

        append_in_tx(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn template_status_str(status: TemplateStatus) -> &'static str {
    match status {
        TemplateStatus::Draft => "DRAFT",
        TemplateStatus::Active => "ACTIVE",
        TemplateStatus::Deprecated => "DEPRECATED",
    }
}
