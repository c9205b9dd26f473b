//! 通知请求聚合
//!
//! 请求是调度流程的根聚合，持有状态机与乐观并发版本号。
//! 状态只能向前迁移（Pending -> Processing -> Completed/Failed，
//! 或 Pending -> Blocked），到达终态后不再变化，仅归档不删除。
//!
//! 状态迁移实现为纯函数：输入当前聚合，输出新聚合与恰好一条领域
//! 事件，由调用方在同一事务单元内持久化两者（outbox 模式）。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use notify_shared::events::{Channel, DomainEvent, Urgency};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::models::command::CreateNotificationCommand;

// ---------------------------------------------------------------------------
// RequestStatus — 请求状态机
// ---------------------------------------------------------------------------

/// 请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Blocked,
}

impl RequestStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }

    /// 状态机允许的前向迁移
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, RequestStatus::Processing)
                | (Self::Pending, RequestStatus::Blocked)
                | (Self::Processing, RequestStatus::Completed)
                | (Self::Processing, RequestStatus::Failed)
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Recipient — 收件人实体
// ---------------------------------------------------------------------------

/// 收件人的最终投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientOutcome {
    /// 至少一个渠道投递成功
    Succeeded,
    /// 所有计划渠道均失败
    Failed,
}

/// 请求内的收件人实体
///
/// `planned_channels` 在进入 Processing 时由策略评估结果写入，
/// 对账时据此判断该收件人是否已全部落定——仅凭已存在的投递日志
/// 无法区分"尚未创建"与"永远不会创建"。
///
/// `deferred` 标记被免打扰窗口推迟的收件人：请求整体可以进入
/// Processing，但该收件人暂无渠道计划，待窗口结束后重放的处理
/// 命令重新评估。带此标记的收件人存在时请求不得对账到终态。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub user_id: String,
    pub addresses: HashMap<Channel, String>,
    #[serde(default)]
    pub planned_channels: Vec<Channel>,
    #[serde(default)]
    pub deferred: bool,
    #[serde(default)]
    pub outcome: Option<RecipientOutcome>,
}

impl Recipient {
    /// 该收件人在指定渠道上的地址
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        self.addresses.get(&channel).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// NotificationRequest — 聚合根
// ---------------------------------------------------------------------------

/// 通知请求聚合
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub id: String,
    pub notification_type: String,
    pub payload: serde_json::Value,
    pub recipients: Vec<Recipient>,
    /// 渠道偏好列表，顺序即回退顺序
    pub channel_preferences: Vec<Channel>,
    pub urgency: Urgency,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub correlation_id: String,
    pub dedup_key: String,
    pub status: RequestStatus,
    /// 乐观并发版本号，保存时 CAS 校验
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRequest {
    /// 从命令构造新的 Pending 请求
    ///
    /// 校验失败返回 `Validation` 错误。返回的事件由调用方与聚合
    /// 插入在同一事务中落库。
    pub fn from_command(command: &CreateNotificationCommand) -> Result<(Self, DomainEvent)> {
        command.validate()?;

        let now = Utc::now();
        let request = Self {
            id: Uuid::now_v7().to_string(),
            notification_type: command.notification_type.clone(),
            payload: command.payload.clone(),
            recipients: command
                .recipients
                .iter()
                .map(|spec| Recipient {
                    user_id: spec.user_id.clone(),
                    addresses: spec.addresses.clone(),
                    planned_channels: Vec::new(),
                    deferred: false,
                    outcome: None,
                })
                .collect(),
            channel_preferences: command.channel_preferences.clone(),
            urgency: command.urgency,
            scheduled_at: command.scheduled_at,
            correlation_id: command.correlation_id.clone(),
            dedup_key: command.dedup_key.clone(),
            status: RequestStatus::Pending,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let event = DomainEvent::NotificationRequested {
            request_id: request.id.clone(),
            notification_type: request.notification_type.clone(),
            recipient_count: request.recipients.len(),
        };

        Ok((request, event))
    }

    /// Pending -> Processing
    ///
    /// `plan` 给出策略评估后每个收件人的可用渠道（按 user_id 索引），
    /// 写入 `planned_channels` 供对账使用。`deferred` 中的收件人被
    /// 免打扰窗口推迟，暂无计划但保留重新评估的资格；既不在 plan
    /// 也不在 deferred 中的收件人被策略挡下，计划为空，对账记失败。
    pub fn start_processing(
        &self,
        plan: &HashMap<String, Vec<Channel>>,
        deferred: &HashSet<String>,
    ) -> Result<(Self, DomainEvent)> {
        self.ensure_transition(RequestStatus::Processing)?;

        let mut next = self.clone();
        next.status = RequestStatus::Processing;
        next.updated_at = Utc::now();
        for recipient in &mut next.recipients {
            recipient.planned_channels = plan.get(&recipient.user_id).cloned().unwrap_or_default();
            recipient.deferred = deferred.contains(&recipient.user_id);
        }

        let event = DomainEvent::NotificationProcessingStarted {
            request_id: self.id.clone(),
        };

        Ok((next, event))
    }

    /// Processing 状态下恢复被推迟的收件人
    ///
    /// 免打扰窗口结束后重放的处理命令走到这里：plan 中的收件人补写
    /// 渠道计划并清除推迟标记，`still_deferred` 中的继续等待，其余
    /// 推迟中的收件人此刻被策略挡下（计划保持为空，对账记为失败）。
    pub fn resume_deferred(
        &self,
        plan: &HashMap<String, Vec<Channel>>,
        still_deferred: &HashSet<String>,
    ) -> Result<(Self, DomainEvent)> {
        if self.status != RequestStatus::Processing {
            return Err(DispatchError::InvalidStateTransition {
                from: self.status.to_string(),
                to: RequestStatus::Processing.to_string(),
            });
        }

        let mut next = self.clone();
        next.updated_at = Utc::now();
        for recipient in &mut next.recipients {
            if !recipient.deferred {
                continue;
            }
            if let Some(channels) = plan.get(&recipient.user_id) {
                recipient.planned_channels = channels.clone();
                recipient.deferred = false;
            } else if !still_deferred.contains(&recipient.user_id) {
                recipient.deferred = false;
            }
        }

        let event = DomainEvent::NotificationProcessingStarted {
            request_id: self.id.clone(),
        };

        Ok((next, event))
    }

    /// 是否还有被免打扰推迟、等待重新评估的收件人
    pub fn has_deferred_recipients(&self) -> bool {
        self.recipients.iter().any(|r| r.deferred)
    }

    /// Pending -> Blocked（终态）
    pub fn block(&self, reason: impl Into<String>) -> Result<(Self, DomainEvent)> {
        self.ensure_transition(RequestStatus::Blocked)?;

        let mut next = self.clone();
        next.status = RequestStatus::Blocked;
        next.updated_at = Utc::now();

        let event = DomainEvent::NotificationBlocked {
            request_id: self.id.clone(),
            reason: reason.into(),
        };

        Ok((next, event))
    }

    /// Pending 请求取消
    ///
    /// 已进入 Processing 的请求不可取消（在途发送不可中断）。
    /// 取消在状态机上表示为 Blocked 终态，原因固定。
    pub fn cancel(&self) -> Result<(Self, DomainEvent)> {
        self.block("canceled by caller")
    }

    /// Processing -> Completed
    ///
    /// 调用方（对账步骤）保证所有收件人均已落定。`outcomes` 按
    /// user_id 给出每个收件人的最终结果。
    pub fn complete(
        &self,
        outcomes: &HashMap<String, RecipientOutcome>,
    ) -> Result<(Self, DomainEvent)> {
        self.ensure_transition(RequestStatus::Completed)?;

        let mut next = self.clone();
        next.status = RequestStatus::Completed;
        next.updated_at = Utc::now();
        next.apply_outcomes(outcomes);

        let event = DomainEvent::NotificationCompleted {
            request_id: self.id.clone(),
        };

        Ok((next, event))
    }

    /// Processing -> Failed
    pub fn fail(
        &self,
        reason: impl Into<String>,
        outcomes: &HashMap<String, RecipientOutcome>,
    ) -> Result<(Self, DomainEvent)> {
        self.ensure_transition(RequestStatus::Failed)?;

        let mut next = self.clone();
        next.status = RequestStatus::Failed;
        next.updated_at = Utc::now();
        next.apply_outcomes(outcomes);

        let event = DomainEvent::NotificationFailed {
            request_id: self.id.clone(),
            reason: reason.into(),
        };

        Ok((next, event))
    }

    fn apply_outcomes(&mut self, outcomes: &HashMap<String, RecipientOutcome>) {
        for recipient in &mut self.recipients {
            if let Some(outcome) = outcomes.get(&recipient.user_id) {
                recipient.outcome = Some(*outcome);
            }
        }
    }

    fn ensure_transition(&self, next: RequestStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DispatchError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        Ok(())
    }
}
