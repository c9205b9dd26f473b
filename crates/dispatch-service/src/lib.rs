//! 通知调度服务
//!
//! 接收上游业务事件产生的通知命令，根据用户偏好决定投递渠道，
//! 渲染版本化模板，并通过带租约保护的重试编排器完成多渠道分发。
//! 所有状态迁移以 outbox 模式发布领域事件，保证至少一次投递。

pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod outbox;
pub mod policy;
pub mod repository;
pub mod template;

pub use error::{DispatchError, Result};
