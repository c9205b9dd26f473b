//! 领域事件模型
//!
//! 定义通知调度系统对外发布的所有领域事件、统一信封格式以及
//! 渠道/紧急度等共享枚举。事件随聚合变更写入 outbox，由中继进程
//! 以至少一次语义发布到 Kafka，下游订阅方需自行幂等。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Channel — 投递渠道
// ---------------------------------------------------------------------------

/// 通知投递渠道
///
/// 各渠道有不同的消息长度限制和格式要求，网关实现按渠道适配内容。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    Push,
    Webhook,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 与 serde 的 SCREAMING_SNAKE_CASE 保持一致，
        // 便于在日志、Redis 键和 Kafka key 中统一引用
        let s = match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Push => "PUSH",
            Self::Webhook => "WEBHOOK",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Urgency — 紧急度
// ---------------------------------------------------------------------------

/// 通知紧急度
///
/// High 可以穿透收件人的免打扰窗口，Medium/Low 在窗口内被延迟。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    High,
    Medium,
    Low,
}

impl Urgency {
    /// 是否允许穿透免打扰窗口
    pub fn overrides_dnd(&self) -> bool {
        matches!(self, Self::High)
    }
}

// ---------------------------------------------------------------------------
// DomainEvent — 领域事件
// ---------------------------------------------------------------------------

/// 通知生命周期中产生的领域事件
///
/// 每个聚合状态迁移恰好追加一条事件到 outbox，与状态变更处于同一
/// 事务单元，杜绝双写不一致。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all_fields = "camelCase")]
pub enum DomainEvent {
    /// 请求创建成功（幂等重放时不会重复发出）
    NotificationRequested {
        request_id: String,
        notification_type: String,
        recipient_count: usize,
    },
    /// 策略评估产生至少一个可用渠道，开始处理
    NotificationProcessingStarted { request_id: String },
    /// 策略评估未留下任何可用渠道，请求终态 Blocked
    NotificationBlocked { request_id: String, reason: String },
    /// 单个渠道的内容渲染完成，进入分发队列
    NotificationReadyToDispatch { request_id: String, channel: Channel },
    /// 一次网关发送尝试（无论成败）
    NotificationDispatchAttempted {
        log_id: String,
        request_id: String,
        channel: Channel,
        address: String,
        attempt: u32,
        success: bool,
    },
    /// 网关同步确认已发出
    NotificationSentToChannel {
        log_id: String,
        request_id: String,
        channel: Channel,
        address: String,
        provider_message_id: String,
    },
    /// 渠道回执确认已送达
    NotificationDelivered {
        log_id: String,
        request_id: String,
        channel: Channel,
        address: String,
    },
    /// 单条投递日志终态失败（永久错误或重试耗尽）
    NotificationDeliveryFailed {
        log_id: String,
        request_id: String,
        channel: Channel,
        address: String,
        reason: String,
    },
    /// 收件人已读回执
    NotificationRead {
        log_id: String,
        request_id: String,
        channel: Channel,
        address: String,
    },
    /// 所有收件人都到达终态且每人至少一个渠道成功
    NotificationCompleted { request_id: String },
    /// 所有收件人都到达终态且无任何成功
    NotificationFailed { request_id: String, reason: String },
    /// 新模板版本发布
    NotificationTemplateVersionCreated {
        template_id: String,
        name: String,
        channel: Channel,
        version: i32,
    },
    /// 用户偏好变更
    UserNotificationPreferencesUpdated { user_id: String },
}

impl DomainEvent {
    /// 事件名称，用于日志与 Kafka header
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotificationRequested { .. } => "NotificationRequested",
            Self::NotificationProcessingStarted { .. } => "NotificationProcessingStarted",
            Self::NotificationBlocked { .. } => "NotificationBlocked",
            Self::NotificationReadyToDispatch { .. } => "NotificationReadyToDispatch",
            Self::NotificationDispatchAttempted { .. } => "NotificationDispatchAttempted",
            Self::NotificationSentToChannel { .. } => "NotificationSentToChannel",
            Self::NotificationDelivered { .. } => "NotificationDelivered",
            Self::NotificationDeliveryFailed { .. } => "NotificationDeliveryFailed",
            Self::NotificationRead { .. } => "NotificationRead",
            Self::NotificationCompleted { .. } => "NotificationCompleted",
            Self::NotificationFailed { .. } => "NotificationFailed",
            Self::NotificationTemplateVersionCreated { .. } => {
                "NotificationTemplateVersionCreated"
            }
            Self::UserNotificationPreferencesUpdated { .. } => {
                "UserNotificationPreferencesUpdated"
            }
        }
    }

    /// 事件所属聚合的标识，用作 Kafka 分区键保证同聚合事件有序
    pub fn partition_key(&self) -> &str {
        match self {
            Self::NotificationRequested { request_id, .. }
            | Self::NotificationProcessingStarted { request_id }
            | Self::NotificationBlocked { request_id, .. }
            | Self::NotificationReadyToDispatch { request_id, .. }
            | Self::NotificationDispatchAttempted { request_id, .. }
            | Self::NotificationSentToChannel { request_id, .. }
            | Self::NotificationDelivered { request_id, .. }
            | Self::NotificationDeliveryFailed { request_id, .. }
            | Self::NotificationRead { request_id, .. }
            | Self::NotificationCompleted { request_id }
            | Self::NotificationFailed { request_id, .. } => request_id,
            Self::NotificationTemplateVersionCreated { template_id, .. } => template_id,
            Self::UserNotificationPreferencesUpdated { user_id } => user_id,
        }
    }
}

// ---------------------------------------------------------------------------
// EventEnvelope — 事件信封
// ---------------------------------------------------------------------------

/// 事件信封
///
/// 所有发布到 Kafka 的事件都包装在此信封中：
/// - `event_id`（UUID v7）时间有序，供订阅方幂等去重
/// - `correlation_id` 串联一次业务请求产生的全部事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(flatten)]
    pub event: DomainEvent,
}

impl EventEnvelope {
    /// 构建新信封，自动生成 UUID v7 作为 event_id 并记录当前时间
    pub fn new(correlation_id: impl Into<String>, event: DomainEvent) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            occurred_at: Utc::now(),
            correlation_id: correlation_id.into(),
            event,
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
