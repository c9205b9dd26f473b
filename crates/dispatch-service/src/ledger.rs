//! 投递台账
//!
//! 投递日志的只读查询面：按请求回放尝试历史、按收件地址追溯、
//! 拉取长期失败的日志供外部重试/告警工具消费、频控窗口统计。
//! 写路径全部走编排器与生命周期管理器，台账不修改日志。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::models::{DeliveryAttempt, SentNotificationLog};
use crate::repository::DeliveryLogRepository;

/// 投递台账
pub struct DeliveryLedger {
    logs: Arc<dyn DeliveryLogRepository>,
}

impl DeliveryLedger {
    pub fn new(logs: Arc<dyn DeliveryLogRepository>) -> Self {
        Self { logs }
    }

    /// 请求维度的全部投递日志
    pub async fn logs_by_request(&self, request_id: &str) -> Result<Vec<SentNotificationLog>> {
        self.logs.list_by_request(request_id).await
    }

    /// 请求维度的全部发送尝试，按时间升序展平
    pub async fn attempts_by_request(&self, request_id: &str) -> Result<Vec<DeliveryAttempt>> {
        let logs = self.logs.list_by_request(request_id).await?;
        let mut attempts: Vec<DeliveryAttempt> = logs
            .into_iter()
            .flat_map(|log| log.attempts)
            .collect();
        attempts.sort_by_key(|a| a.attempted_at);
        Ok(attempts)
    }

    /// 收件地址维度的投递历史
    pub async fn logs_by_address(&self, address: &str) -> Result<Vec<SentNotificationLog>> {
        self.logs.list_by_address(address).await
    }

    /// 失败超过指定时长的日志
    pub async fn failed_older_than(&self, age: Duration) -> Result<Vec<SentNotificationLog>> {
        self.logs.list_failed_older_than(Utc::now() - age).await
    }

    /// (用户, 通知类型) 自指定时刻以来的成功发送数
    pub async fn recent_send_count(
        &self,
        user_id: &str,
        notification_type: &str,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        self.logs
            .count_recent_sends(user_id, notification_type, since)
            .await
    }
}
