//! 通知调度领域模型
//!
//! 包含通知请求、投递日志、模板与用户偏好四个聚合的定义。
//! 聚合的状态迁移实现为纯函数，返回 (新状态, 领域事件)，
//! 由调用方负责持久化与事件落库，便于独立测试。

pub mod command;
pub mod delivery_log;
pub mod preferences;
pub mod request;
pub mod template;

// 重新导出常用类型
pub use command::{CreateNotificationCommand, DispatchCommand, RecipientSpec};
pub use delivery_log::{AttemptStatus, DeliveryAttempt, DeliveryStatus, SentNotificationLog};
pub use preferences::{DndWindow, FrequencyLimit, PreferenceRule, UserNotificationPreferences};
pub use request::{NotificationRequest, Recipient, RecipientOutcome, RequestStatus};
pub use template::{NotificationTemplate, RenderedMessage, TemplateStatus};
