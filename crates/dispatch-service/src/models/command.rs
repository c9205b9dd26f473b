//! 入站命令模型
//!
//! 上游业务系统通过 Kafka 命令 topic 投递 `CreateNotificationCommand`，
//! 携带去重键实现幂等创建。命令本身不做任何业务决策，
//! 校验通过后由生命周期管理器转换为请求聚合。

use std::collections::HashMap;

use notify_shared::events::{Channel, Urgency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::models::preferences::UserNotificationPreferences;

/// 命令 topic 上的全部命令种类
///
/// 以 commandType 标签区分，除创建外还包括调度时钟的到期触发、
/// 取消、渠道回执上报与偏好变更。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "commandType", rename_all_fields = "camelCase")]
pub enum DispatchCommand {
    CreateNotification(CreateNotificationCommand),
    ProcessNotification { request_id: String },
    CancelNotification { request_id: String },
    ConfirmDelivered { log_id: String },
    MarkRead { log_id: String },
    UpdatePreferences(UserNotificationPreferences),
}

/// 收件人描述
///
/// `addresses` 给出该收件人在各渠道上的可达地址，
/// 没有地址的渠道在策略评估前即被排除。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientSpec {
    pub user_id: String,
    pub addresses: HashMap<Channel, String>,
}

/// 创建通知命令
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationCommand {
    /// 业务通知类型（如 "OrderConfirmed"），同时是模板名称
    pub notification_type: String,
    /// 模板渲染数据（JSON 对象）
    pub payload: serde_json::Value,
    pub recipients: Vec<RecipientSpec>,
    /// 渠道偏好列表，顺序即回退顺序
    pub channel_preferences: Vec<Channel>,
    pub urgency: Urgency,
    /// 定时发送时间，缺省立即发送
    pub scheduled_at: Option<DateTime<Utc>>,
    pub correlation_id: String,
    /// 调用方提供的幂等去重键
    pub dedup_key: String,
}

impl CreateNotificationCommand {
    /// 校验命令的结构完整性
    ///
    /// 空负载、空收件人列表或空渠道偏好均视为调用方错误，
    /// 同步返回而不进入调度流程。
    pub fn validate(&self) -> Result<()> {
        let payload_empty = match &self.payload {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if payload_empty {
            return Err(DispatchError::Validation("payload 不能为空".to_string()));
        }

        if self.recipients.is_empty() {
            return Err(DispatchError::Validation(
                "recipients 不能为空".to_string(),
            ));
        }

        if self.channel_preferences.is_empty() {
            return Err(DispatchError::Validation(
                "channelPreferences 不能为空".to_string(),
            ));
        }

        if self.dedup_key.trim().is_empty() {
            return Err(DispatchError::Validation("dedupKey 不能为空".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_command() -> CreateNotificationCommand {
        CreateNotificationCommand {
            notification_type: "OrderConfirmed".to_string(),
            payload: serde_json::json!({"orderNo": "A-1001"}),
            recipients: vec![RecipientSpec {
                user_id: "u1".to_string(),
                addresses: HashMap::from([(Channel::Email, "a@b.com".to_string())]),
            }],
            channel_preferences: vec![Channel::Email, Channel::Sms],
            urgency: Urgency::Medium,
            scheduled_at: None,
            correlation_id: "c1".to_string(),
            dedup_key: "order-A-1001".to_string(),
        }
    }

    #[test]
    fn test_valid_command_passes() {
        assert!(valid_command().validate().is_ok());
    }

    #[test]
    fn test_empty_payload_rejected() {
        let mut cmd = valid_command();
        cmd.payload = serde_json::json!({});
        assert!(matches!(
            cmd.validate(),
            Err(DispatchError::Validation(_))
        ));

        cmd.payload = serde_json::Value::Null;
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn test_empty_recipients_rejected() {
        let mut cmd = valid_command();
        cmd.recipients.clear();
        assert!(matches!(
            cmd.validate(),
            Err(DispatchError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_channel_preferences_rejected() {
        let mut cmd = valid_command();
        cmd.channel_preferences.clear();
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn test_blank_dedup_key_rejected() {
        let mut cmd = valid_command();
        cmd.dedup_key = "  ".to_string();
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn test_command_serialization_camel_case() {
        let cmd = valid_command();
        let json = serde_json::to_string(&cmd).unwrap();

        assert!(json.contains("notificationType"));
        assert!(json.contains("channelPreferences"));
        assert!(json.contains("correlationId"));
        assert!(json.contains("dedupKey"));

        let back: CreateNotificationCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dedup_key, "order-A-1001");
        assert_eq!(back.channel_preferences.len(), 2);
    }
}
