//! 投递日志聚合
//!
//! 每个 (请求, 渠道, 地址) 组合对应一条 `SentNotificationLog`，
//! 记录所有发送尝试的只追加历史。日志状态只能沿
//! QueuedForDispatch -> Sent -> Delivered -> Read 前进，
//! Failed 仅能从 QueuedForDispatch 到达（从未成功发出过）。
//! 已成功的投递不会因后续回执异常而回退。

use chrono::{DateTime, Duration, Utc};
use notify_shared::events::{Channel, DomainEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};

// ---------------------------------------------------------------------------
// DeliveryStatus — 投递状态机
// ---------------------------------------------------------------------------

/// 单条投递日志的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    QueuedForDispatch,
    Sent,
    Delivered,
    Failed,
    Read,
}

impl DeliveryStatus {
    /// 是否不再接受任何状态变更
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Read | Self::Failed)
    }

    /// 是否已落定（对账视角）
    ///
    /// Sent 之后不会再失败，对请求完成度判断而言等价于终态，
    /// 即使后续还可能收到送达/已读回执。
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::QueuedForDispatch)
    }

    /// 是否计为成功投递
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }

    /// 成功链上的进度排序，用于拒绝回执乱序导致的状态回退
    fn rank(&self) -> u8 {
        match self {
            Self::QueuedForDispatch => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            // Failed 不在成功链上
            Self::Failed => 0,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::QueuedForDispatch => "QUEUED_FOR_DISPATCH",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
            Self::Read => "READ",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// DeliveryAttempt — 发送尝试记录
// ---------------------------------------------------------------------------

/// 单次发送尝试的结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Succeeded,
    /// 瞬时失败（超时、限流、5xx），可重试
    TransientFailure,
    /// 永久失败（地址非法、内容被拒），立即终止
    PermanentFailure,
}

/// 一次网关发送尝试
///
/// 尝试历史只追加，attempted_at 严格递增。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    pub attempt_no: u32,
    pub attempted_at: DateTime<Utc>,
    pub status: AttemptStatus,
    pub detail: Option<String>,
    /// 网关返回的供应商侧消息 ID（仅成功时存在）
    pub provider_message_id: Option<String>,
}

// ---------------------------------------------------------------------------
// SentNotificationLog — 聚合根
// ---------------------------------------------------------------------------

/// 投递日志聚合
///
/// user_id 与 notification_type 从请求冗余下来，
/// 支持按收件人、按类型的台账查询与频控统计，无需回表 join。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentNotificationLog {
    pub id: String,
    pub request_id: String,
    pub user_id: String,
    pub notification_type: String,
    pub channel: Channel,
    pub address: String,
    pub status: DeliveryStatus,
    pub attempts: Vec<DeliveryAttempt>,
    pub provider_message_id: Option<String>,
    /// 失败原因（仅 Failed 状态存在）
    pub failure_reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SentNotificationLog {
    /// 新建排队中的投递日志
    pub fn new(
        request_id: impl Into<String>,
        user_id: impl Into<String>,
        notification_type: impl Into<String>,
        channel: Channel,
        address: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            request_id: request_id.into(),
            user_id: user_id.into(),
            notification_type: notification_type.into(),
            channel,
            address: address.into(),
            status: DeliveryStatus::QueuedForDispatch,
            attempts: Vec::new(),
            provider_message_id: None,
            failure_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// 下一次尝试的序号（从 1 开始）
    pub fn next_attempt_no(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    /// 记录一次成功发送，QueuedForDispatch -> Sent
    pub fn record_success(
        &self,
        provider_message_id: impl Into<String>,
    ) -> Result<(Self, Vec<DomainEvent>)> {
        self.ensure_dispatchable()?;

        let provider_message_id = provider_message_id.into();
        let mut next = self.clone();
        let attempt_no = next.push_attempt(DeliveryAttempt {
            attempt_no: 0,
            attempted_at: Utc::now(),
            status: AttemptStatus::Succeeded,
            detail: None,
            provider_message_id: Some(provider_message_id.clone()),
        });
        next.status = DeliveryStatus::Sent;
        next.provider_message_id = Some(provider_message_id.clone());

        let events = vec![
            self.attempted_event(attempt_no, true),
            DomainEvent::NotificationSentToChannel {
                log_id: self.id.clone(),
                request_id: self.request_id.clone(),
                channel: self.channel,
                address: self.address.clone(),
                provider_message_id,
            },
        ];
        Ok((next, events))
    }

    /// 记录一次瞬时失败
    ///
    /// `exhausted` 为 true 时重试预算已用完，日志转入 Failed 终态；
    /// 否则保持 QueuedForDispatch 等待下一次尝试。
    pub fn record_transient_failure(
        &self,
        detail: impl Into<String>,
        exhausted: bool,
    ) -> Result<(Self, Vec<DomainEvent>)> {
        self.ensure_dispatchable()?;

        let detail = detail.into();
        let mut next = self.clone();
        let attempt_no = next.push_attempt(DeliveryAttempt {
            attempt_no: 0,
            attempted_at: Utc::now(),
            status: AttemptStatus::TransientFailure,
            detail: Some(detail.clone()),
            provider_message_id: None,
        });

        let mut events = vec![self.attempted_event(attempt_no, false)];
        if exhausted {
            let reason = format!("重试次数耗尽: {detail}");
            next.status = DeliveryStatus::Failed;
            next.failure_reason = Some(reason.clone());
            events.push(self.failed_event(reason));
        }
        Ok((next, events))
    }

    /// 记录一次永久失败，立即转入 Failed 终态
    pub fn record_permanent_failure(
        &self,
        detail: impl Into<String>,
    ) -> Result<(Self, Vec<DomainEvent>)> {
        self.ensure_dispatchable()?;

        let detail = detail.into();
        let mut next = self.clone();
        let attempt_no = next.push_attempt(DeliveryAttempt {
            attempt_no: 0,
            attempted_at: Utc::now(),
            status: AttemptStatus::PermanentFailure,
            detail: Some(detail.clone()),
            provider_message_id: None,
        });
        next.status = DeliveryStatus::Failed;
        next.failure_reason = Some(detail.clone());

        let events = vec![
            self.attempted_event(attempt_no, false),
            self.failed_event(detail),
        ];
        Ok((next, events))
    }

    /// 渠道回执：已送达，Sent -> Delivered
    ///
    /// 晚到或重复的回执（当前状态已 >= Delivered）静默忽略，
    /// 返回原状态且不产生事件。
    pub fn confirm_delivered(&self) -> Result<(Self, Vec<DomainEvent>)> {
        self.advance_receipt(DeliveryStatus::Delivered, DomainEvent::NotificationDelivered {
            log_id: self.id.clone(),
            request_id: self.request_id.clone(),
            channel: self.channel,
            address: self.address.clone(),
        })
    }

    /// 已读回执，前进到 Read（跳过未上报的 Delivered 也允许）
    pub fn mark_read(&self) -> Result<(Self, Vec<DomainEvent>)> {
        self.advance_receipt(DeliveryStatus::Read, DomainEvent::NotificationRead {
            log_id: self.id.clone(),
            request_id: self.request_id.clone(),
            channel: self.channel,
            address: self.address.clone(),
        })
    }

    fn advance_receipt(
        &self,
        target: DeliveryStatus,
        event: DomainEvent,
    ) -> Result<(Self, Vec<DomainEvent>)> {
        match self.status {
            DeliveryStatus::QueuedForDispatch | DeliveryStatus::Failed => {
                // 从未发出的日志不可能收到回执
                Err(DispatchError::InvalidStateTransition {
                    from: self.status.to_string(),
                    to: target.to_string(),
                })
            }
            current if current.rank() >= target.rank() => {
                // 重复或乱序回执，不回退
                Ok((self.clone(), Vec::new()))
            }
            _ => {
                let mut next = self.clone();
                next.status = target;
                next.updated_at = Utc::now();
                Ok((next, vec![event]))
            }
        }
    }

    /// 追加尝试记录并返回分配的序号
    ///
    /// attempted_at 必须严格大于上一次尝试；时钟分辨率不足时
    /// 推到上一次 + 1µs，保证历史可按时间排序重放。
    fn push_attempt(&mut self, mut attempt: DeliveryAttempt) -> u32 {
        attempt.attempt_no = self.next_attempt_no();
        if let Some(last) = self.attempts.last()
            && attempt.attempted_at <= last.attempted_at
        {
            attempt.attempted_at = last.attempted_at + Duration::microseconds(1);
        }
        self.updated_at = attempt.attempted_at;
        let no = attempt.attempt_no;
        self.attempts.push(attempt);
        no
    }

    fn ensure_dispatchable(&self) -> Result<()> {
        if self.status != DeliveryStatus::QueuedForDispatch {
            return Err(DispatchError::InvalidStateTransition {
                from: self.status.to_string(),
                to: "attempt".to_string(),
            });
        }
        Ok(())
    }

    fn attempted_event(&self, attempt: u32, success: bool) -> DomainEvent {
        DomainEvent::NotificationDispatchAttempted {
            log_id: self.id.clone(),
            request_id: self.request_id.clone(),
            channel: self.channel,
            address: self.address.clone(),
            attempt,
            success,
        }
    }

    fn failed_event(&self, reason: String) -> DomainEvent {
        DomainEvent::NotificationDeliveryFailed {
            log_id: self.id.clone(),
            request_id: self.request_id.clone(),
            channel: self.channel,
            address: self.address.clone(),
            reason,
        }
    }
}
