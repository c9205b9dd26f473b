//! 通知调度服务错误类型
//!
//! 定义服务层的业务错误和系统错误。网关层的瞬时/永久错误分类
//! 见 `dispatch::gateway::GatewayError`，编排器内部消化后只以
//! 投递日志和事件的形式对外呈现。

use notify_shared::error::NotifyError;
use notify_shared::events::Channel;
use thiserror::Error;

/// 通知调度服务错误类型
#[derive(Debug, Error)]
pub enum DispatchError {
    // === 请求校验与生命周期错误 ===
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("非法状态迁移: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("并发冲突: {entity} id={id}，请重新加载后重试")]
    ConcurrencyConflict { entity: String, id: String },

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // === 模板错误 ===
    #[error("未找到 Active 模板: type={notification_type}, channel={channel}")]
    TemplateNotFound {
        notification_type: String,
        channel: Channel,
    },

    #[error("模板占位符缺少数据: {token}")]
    MissingPlaceholder { token: String },

    // === 分发错误 ===
    #[error("渠道未注册网关: {channel}")]
    GatewayNotRegistered { channel: Channel },

    // === 系统错误 ===
    #[error("JSON 序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Shared(#[from] NotifyError),
}

/// 服务 Result 类型别名
pub type Result<T> = std::result::Result<T, DispatchError>;

impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        Self::Shared(NotifyError::Database(err))
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        Self::Shared(NotifyError::Redis(err))
    }
}

impl DispatchError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::TemplateNotFound { .. } => "TEMPLATE_NOT_FOUND",
            Self::MissingPlaceholder { .. } => "MISSING_PLACEHOLDER",
            Self::GatewayNotRegistered { .. } => "GATEWAY_NOT_REGISTERED",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Shared(e) => e.code(),
        }
    }

    /// 是否为可重试错误
    ///
    /// 并发冲突由调用方重新加载聚合后重试；基础设施错误按共享层
    /// 的分类处理。校验、状态机与模板错误重试无意义。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrencyConflict { .. } => true,
            Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }
}
