//! 分发编排器
//!
//! 驱动单个 (请求, 收件人, 渠道) 的完整投递：幂等创建投递日志、
//! 获取租约、带超时的网关调用、瞬时失败的指数退避重试、每次尝试
//! 即时落库。幂等键 = (request_id, channel, address)，同键日志
//! 绝不重复创建；非租约持有方直接返回存量日志，不与在途发送竞争。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use notify_shared::config::DispatchConfig;
use notify_shared::events::{Channel, DomainEvent, EventEnvelope};
use notify_shared::retry::RetryPolicy;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dispatch::gateway::{ChannelGateway, GatewayError};
use crate::dispatch::lease::{LeaseStore, lease_key};
use crate::error::{DispatchError, Result};
use crate::models::{NotificationRequest, Recipient, RenderedMessage, SentNotificationLog};
use crate::repository::DeliveryLogRepository;

/// 分发编排器
pub struct DispatchOrchestrator {
    logs: Arc<dyn DeliveryLogRepository>,
    lease_store: Arc<dyn LeaseStore>,
    gateways: HashMap<Channel, Arc<dyn ChannelGateway>>,
    retry_policy: RetryPolicy,
    max_attempts: u32,
    gateway_timeout: Duration,
    lease_ttl: Duration,
}

impl DispatchOrchestrator {
    pub fn new(
        logs: Arc<dyn DeliveryLogRepository>,
        lease_store: Arc<dyn LeaseStore>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            logs,
            lease_store,
            gateways: HashMap::new(),
            retry_policy: RetryPolicy {
                // 首次执行不算重试
                max_retries: config.max_attempts.saturating_sub(1),
                initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
                max_delay: Duration::from_millis(config.retry_max_delay_ms),
                multiplier: 2.0,
                jitter: true,
            },
            max_attempts: config.max_attempts,
            gateway_timeout: config.gateway_timeout(),
            lease_ttl: config.lease_ttl(),
        }
    }

    /// 注册渠道网关
    pub fn register_gateway(&mut self, gateway: Arc<dyn ChannelGateway>) {
        self.gateways.insert(gateway.channel(), gateway);
    }

    /// 执行单渠道投递，返回落定后的投递日志
    ///
    /// 重入安全：日志已落定时直接返回；租约被其他调用持有时
    /// 返回存量日志，绝不产生同键的第二行日志或并发双发。
    #[instrument(skip(self, request, recipient, message), fields(request_id = %request.id, channel = %channel))]
    pub async fn dispatch(
        &self,
        request: &NotificationRequest,
        recipient: &Recipient,
        channel: Channel,
        message: &RenderedMessage,
    ) -> Result<SentNotificationLog> {
        let address = recipient.address_for(channel).ok_or_else(|| {
            DispatchError::Validation(format!(
                "收件人 {} 在渠道 {channel} 上没有地址",
                recipient.user_id
            ))
        })?;
        let gateway = self
            .gateways
            .get(&channel)
            .ok_or(DispatchError::GatewayNotRegistered { channel })?;

        // 幂等创建日志，同键已存在时返回存量
        let fresh = SentNotificationLog::new(
            &request.id,
            &recipient.user_id,
            &request.notification_type,
            channel,
            address,
        );
        let ready = EventEnvelope::new(
            &request.correlation_id,
            DomainEvent::NotificationReadyToDispatch {
                request_id: request.id.clone(),
                channel,
            },
        );
        let log = self.logs.create_if_absent(&fresh, &[ready]).await?;

        // 之前的调度轮次已经出结果，直接复用
        if log.status.is_settled() {
            return Ok(log);
        }

        // 租约互斥：拿不到说明另一路调度正在发送，观察存量即可
        let key = lease_key(&request.id, channel, address);
        let owner = Uuid::new_v4().to_string();
        if !self
            .lease_store
            .try_acquire(&key, &owner, self.lease_ttl)
            .await?
        {
            info!(key = %key, "租约被占用，返回存量日志");
            return Ok(log);
        }

        let result = self
            .attempt_loop(log, gateway.as_ref(), message, address, &request.correlation_id)
            .await;
        self.lease_store.release(&key, &owner).await?;
        result
    }

    /// 租约保护下的尝试循环
    ///
    /// 每次尝试的结果立即落库再决定下一步，进程在重试间隙崩溃时
    /// 历史不丢，后继调度轮次按存量日志继续。
    async fn attempt_loop(
        &self,
        mut log: SentNotificationLog,
        gateway: &dyn ChannelGateway,
        message: &RenderedMessage,
        address: &str,
        correlation_id: &str,
    ) -> Result<SentNotificationLog> {
        loop {
            let attempt_no = log.next_attempt_no();
            let outcome = match tokio::time::timeout(
                self.gateway_timeout,
                gateway.send(message, address),
            )
            .await
            {
                Ok(result) => result,
                // 超时按瞬时失败分类
                Err(_) => Err(GatewayError::Transient(format!(
                    "网关调用超过 {}ms 未返回",
                    self.gateway_timeout.as_millis()
                ))),
            };

            let (next, events) = match outcome {
                Ok(receipt) => {
                    info!(
                        log_id = %log.id,
                        attempt = attempt_no,
                        provider_message_id = %receipt.provider_message_id,
                        "网关发送成功"
                    );
                    log.record_success(receipt.provider_message_id)?
                }
                Err(GatewayError::Permanent(detail)) => {
                    warn!(log_id = %log.id, attempt = attempt_no, detail = %detail, "永久失败，终止投递");
                    log.record_permanent_failure(detail)?
                }
                Err(GatewayError::Transient(detail)) => {
                    let exhausted = attempt_no >= self.max_attempts;
                    warn!(
                        log_id = %log.id,
                        attempt = attempt_no,
                        max_attempts = self.max_attempts,
                        exhausted,
                        detail = %detail,
                        "瞬时失败"
                    );
                    log.record_transient_failure(detail, exhausted)?
                }
            };

            let envelopes: Vec<EventEnvelope> = events
                .into_iter()
                .map(|e| EventEnvelope::new(correlation_id, e))
                .collect();
            self.logs.save(&next, log.version, &envelopes).await?;
            log = next;
            log.version += 1;

            if log.status.is_settled() {
                return Ok(log);
            }

            // 第 N 次尝试失败后按第 N-1 轮退避（attempt 从 0 起算）
            let delay = self.retry_policy.jittered_delay_for_attempt(attempt_no - 1);
            tokio::time::sleep(delay).await;
        }
    }
}
