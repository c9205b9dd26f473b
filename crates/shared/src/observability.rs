//! 统一可观测性模块
//!
//! 提供结构化日志的统一初始化。所有服务通过单一入口点配置日志，
//! 确保一致的字段命名与输出格式。

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;
use crate::error::{NotifyError, Result};

/// 初始化 tracing 订阅器
///
/// 日志级别优先取 RUST_LOG 环境变量，未设置时使用配置中的 log_level。
/// `log_format` 为 "json" 时输出结构化日志（供日志采集系统摄取），
/// 否则输出人类可读格式。
///
/// 重复调用会返回错误（全局订阅器只能设置一次），测试中请勿依赖此初始化。
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let result = if config.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    result.map_err(|e| NotifyError::Internal(format!("初始化日志订阅器失败: {e}")))?;

    info!(
        log_level = %config.log_level,
        log_format = %config.log_format,
        "Observability initialized"
    );

    Ok(())
}
