//! 用户偏好仓储
//!
//! 偏好按 user_id 整行 upsert。偏好变更频率低、读多写少，
//! 读路径由策略评估器在每次请求处理时调用。

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::outbox_repo::append_in_tx;
use super::traits::PreferencesRepository;
use crate::error::Result;
use crate::models::UserNotificationPreferences;
use notify_shared::events::EventEnvelope;

/// Postgres 用户偏好仓储
pub struct PgPreferencesRepository {
    pool: PgPool,
}

impl PgPreferencesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferencesRepository for PgPreferencesRepository {
    async fn get(&self, user_id: &str) -> Result<Option<UserNotificationPreferences>> {
        let row = sqlx::query(
            r#"SELECT data FROM user_notification_preferences WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        preferences: &UserNotificationPreferences,
        events: &[EventEnvelope],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO user_notification_preferences (user_id, version, data, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET version = EXCLUDED.version,
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&preferences.user_id)
        .bind(preferences.version)
        .bind(serde_json::to_value(preferences)?)
        .bind(preferences.updated_at)
        .execute(&mut *tx)
        .await?;

        append_in_tx(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }
}
