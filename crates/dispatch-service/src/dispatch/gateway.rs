//! 渠道网关
//!
//! 通过 `ChannelGateway` trait 抽象各渠道供应商的发送行为，
//! 失败分为瞬时（超时、网络、限流）与永久（地址非法、内容被拒）
//! 两类，编排器据此决定重试或立即终止。当前各渠道为模拟实现
//! （仅记录日志），便于在无外部依赖的情况下验证调度管道的完整性；
//! 替换为真实供应商 SDK 时只需实现同一 trait。

use async_trait::async_trait;
use notify_shared::events::Channel;
use tracing::info;
use uuid::Uuid;

use crate::models::RenderedMessage;

/// 网关发送失败分类
///
/// 编排器的重试决策完全依赖此分类，网关实现必须准确区分：
/// 错把永久失败报成瞬时会浪费整个重试预算。
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("瞬时失败: {0}")]
    Transient(String),

    #[error("永久失败: {0}")]
    Permanent(String),
}

/// 供应商回执
#[derive(Debug, Clone)]
pub struct ProviderReceipt {
    /// 供应商侧的消息标识，用于追踪投递状态与回执关联
    pub provider_message_id: String,
}

/// 渠道网关 trait，各供应商实现具体的发送逻辑
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// 发送渲染后的消息到指定地址
    async fn send(
        &self,
        message: &RenderedMessage,
        address: &str,
    ) -> Result<ProviderReceipt, GatewayError>;

    /// 该网关支持的渠道
    fn channel(&self) -> Channel;

    /// 供应商是否会异步上报送达回执
    fn supports_delivery_receipts(&self) -> bool {
        false
    }

    /// 供应商是否会异步上报已读回执
    fn supports_read_receipts(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// 邮件网关
// ---------------------------------------------------------------------------

/// 模拟邮件网关
///
/// 生产环境中替换为 SES / SendGrid 等邮件服务的 SDK 调用
pub struct EmailGateway;

#[async_trait]
impl ChannelGateway for EmailGateway {
    async fn send(
        &self,
        message: &RenderedMessage,
        address: &str,
    ) -> Result<ProviderReceipt, GatewayError> {
        if !address.contains('@') {
            return Err(GatewayError::Permanent(format!("非法邮件地址: {address}")));
        }

        let provider_message_id = Uuid::now_v7().to_string();
        info!(
            channel = "EMAIL",
            address = %address,
            provider_message_id = %provider_message_id,
            subject = message.subject.as_deref().unwrap_or(""),
            "模拟发送邮件通知"
        );

        Ok(ProviderReceipt {
            provider_message_id,
        })
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn supports_delivery_receipts(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// 短信网关
// ---------------------------------------------------------------------------

/// 模拟短信网关
///
/// 生产环境中替换为短信服务商（如阿里云 SMS）的 API 调用
pub struct SmsGateway;

#[async_trait]
impl ChannelGateway for SmsGateway {
    async fn send(
        &self,
        message: &RenderedMessage,
        address: &str,
    ) -> Result<ProviderReceipt, GatewayError> {
        if !address.starts_with('+') || address.len() < 8 {
            return Err(GatewayError::Permanent(format!("非法手机号: {address}")));
        }

        let provider_message_id = Uuid::now_v7().to_string();
        info!(
            channel = "SMS",
            address = %address,
            provider_message_id = %provider_message_id,
            body = %message.body,
            "模拟发送短信通知"
        );

        Ok(ProviderReceipt {
            provider_message_id,
        })
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn supports_delivery_receipts(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// 推送网关
// ---------------------------------------------------------------------------

/// 模拟 APP 推送网关
///
/// 生产环境中替换为 APNs / FCM 等推送服务的 SDK 调用
pub struct PushGateway;

#[async_trait]
impl ChannelGateway for PushGateway {
    async fn send(
        &self,
        message: &RenderedMessage,
        address: &str,
    ) -> Result<ProviderReceipt, GatewayError> {
        if address.is_empty() {
            return Err(GatewayError::Permanent("设备 token 为空".to_string()));
        }

        let provider_message_id = Uuid::now_v7().to_string();
        info!(
            channel = "PUSH",
            device_token = %address,
            provider_message_id = %provider_message_id,
            title = message.subject.as_deref().unwrap_or(""),
            "模拟发送 APP 推送通知"
        );

        Ok(ProviderReceipt {
            provider_message_id,
        })
    }

    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn supports_read_receipts(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Webhook 网关
// ---------------------------------------------------------------------------

/// 模拟 Webhook 网关
///
/// 生产环境中替换为带签名与超时控制的 HTTP POST 回调
pub struct WebhookGateway;

#[async_trait]
impl ChannelGateway for WebhookGateway {
    async fn send(
        &self,
        message: &RenderedMessage,
        address: &str,
    ) -> Result<ProviderReceipt, GatewayError> {
        if !address.starts_with("http://") && !address.starts_with("https://") {
            return Err(GatewayError::Permanent(format!(
                "非法 webhook 地址: {address}"
            )));
        }

        let provider_message_id = Uuid::now_v7().to_string();
        info!(
            channel = "WEBHOOK",
            url = %address,
            provider_message_id = %provider_message_id,
            body_len = message.body.len(),
            "模拟投递 Webhook 通知"
        );

        Ok(ProviderReceipt {
            provider_message_id,
        })
    }

    fn channel(&self) -> Channel {
        Channel::Webhook
    }
}
