//! 仓储 Trait 定义
//!
//! 定义仓储接口，便于服务层依赖抽象而非具体实现，支持 mock 测试。
//! 所有修改聚合的方法都接收本次变更产生的事件信封，实现方必须把
//! 聚合写入与 outbox 追加放在同一事务中（outbox 模式）。
//! `save` 方法做乐观并发校验：`expected_version` 与存量不符时
//! 返回 `ConcurrencyConflict`，由调用方重新加载后重试。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::events::{Channel, EventEnvelope};

use crate::error::Result;
use crate::models::{
    NotificationRequest, NotificationTemplate, SentNotificationLog, UserNotificationPreferences,
};

/// 通知请求仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<NotificationRequest>>;

    /// 按去重键查找，幂等创建的兜底路径
    async fn get_by_dedup_key(&self, dedup_key: &str) -> Result<Option<NotificationRequest>>;

    /// 插入新请求，dedup_key 唯一约束冲突时返回 `ConcurrencyConflict`
    async fn insert(&self, request: &NotificationRequest, events: &[EventEnvelope]) -> Result<()>;

    /// CAS 保存，成功后存量版本号为 expected_version + 1
    async fn save(
        &self,
        request: &NotificationRequest,
        expected_version: i64,
        events: &[EventEnvelope],
    ) -> Result<()>;
}

/// 投递日志仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryLogRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<SentNotificationLog>>;

    /// 按幂等键 (request_id, channel, address) 查找
    async fn get_by_key(
        &self,
        request_id: &str,
        channel: Channel,
        address: &str,
    ) -> Result<Option<SentNotificationLog>>;

    /// 幂等创建：同键日志已存在时返回存量而不是新建
    async fn create_if_absent(
        &self,
        log: &SentNotificationLog,
        events: &[EventEnvelope],
    ) -> Result<SentNotificationLog>;

    /// CAS 保存
    async fn save(
        &self,
        log: &SentNotificationLog,
        expected_version: i64,
        events: &[EventEnvelope],
    ) -> Result<()>;

    async fn list_by_request(&self, request_id: &str) -> Result<Vec<SentNotificationLog>>;

    async fn list_by_address(&self, address: &str) -> Result<Vec<SentNotificationLog>>;

    /// 早于指定时间仍处于 Failed 的日志，供外部重试/告警工具拉取
    async fn list_failed_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SentNotificationLog>>;

    /// (用户, 通知类型) 在滑动窗口内的成功发送数，频控用
    async fn count_recent_sends(
        &self,
        user_id: &str,
        notification_type: &str,
        since: DateTime<Utc>,
    ) -> Result<u32>;
}

/// 模板仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// 当前 Active 版本
    async fn get_active(
        &self,
        name: &str,
        channel: Channel,
    ) -> Result<Option<NotificationTemplate>>;

    /// 指定历史版本（版本不可变，延迟通知按创建时版本渲染）
    async fn get_version(
        &self,
        name: &str,
        channel: Channel,
        version: i32,
    ) -> Result<Option<NotificationTemplate>>;

    async fn latest_version(&self, name: &str, channel: Channel) -> Result<Option<i32>>;

    /// 发布新版本：旧 Active 降级与新版本插入在同一事务中完成
    async fn publish(
        &self,
        template: &NotificationTemplate,
        events: &[EventEnvelope],
    ) -> Result<()>;
}

/// 用户偏好仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PreferencesRepository: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<UserNotificationPreferences>>;

    /// upsert 保存偏好
    async fn save(
        &self,
        preferences: &UserNotificationPreferences,
        events: &[EventEnvelope],
    ) -> Result<()>;
}

/// outbox 行
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub envelope: EventEnvelope,
    pub appended_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// outbox 仓储接口
///
/// 聚合仓储在自身事务中追加事件行；中继进程独立拉取未发布的行
/// 发往 Kafka，broker 确认后才标记 published。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// 独立追加（不在聚合事务内的场景，如补偿写入）
    async fn append(&self, events: &[EventEnvelope]) -> Result<()>;

    /// 按 id 升序拉取未发布的行，保证同聚合事件的发布顺序
    async fn fetch_unpublished(&self, limit: i64) -> Result<Vec<OutboxRow>>;

    async fn mark_published(&self, ids: &[i64]) -> Result<()>;
}
