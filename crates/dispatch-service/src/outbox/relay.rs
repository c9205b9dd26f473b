//! Outbox 中继进程
//!
//! 周期性拉取未发布的事件行，按 id 升序发往 Kafka，broker 确认后
//! 才标记 published——进程在发布与标记之间崩溃会导致事件重发，
//! 下游订阅方以 event_id 幂等去重，整体为至少一次语义。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify_shared::events::EventEnvelope;
use notify_shared::kafka::{KafkaProducer, topics};
use notify_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{DispatchError, Result};
use crate::repository::OutboxRepository;

/// 事件发布接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// 发布单条事件，返回 Ok 即视为 broker 已确认
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// Kafka 事件发布器
///
/// 分区键取事件的聚合标识，保证同一聚合的事件进同一分区、
/// 消费侧按序观察。
pub struct KafkaEventPublisher {
    producer: KafkaProducer,
}

impl KafkaEventPublisher {
    pub fn new(producer: KafkaProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        self.producer
            .send_json(
                topics::NOTIFY_EVENTS,
                envelope.event.partition_key(),
                envelope,
            )
            .await?;
        Ok(())
    }
}

/// Outbox 中继
pub struct OutboxRelay {
    outbox: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn EventPublisher>,
    retry_policy: RetryPolicy,
    batch_size: i64,
    poll_interval: Duration,
}

impl OutboxRelay {
    pub fn new(outbox: Arc<dyn OutboxRepository>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            outbox,
            publisher,
            retry_policy: RetryPolicy::default(),
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// 覆盖单条事件发布的重试策略
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// 排空一批未发布的事件，返回成功发布的条数
    ///
    /// 单条发布的瞬时失败先按退避策略原地重试；重试耗尽后立即停在
    /// 当前行：后续行不能先于它发布，否则破坏同聚合事件的顺序。
    /// 已确认的前缀照常标记。
    pub async fn drain_once(&self) -> Result<usize> {
        let rows = self.outbox.fetch_unpublished(self.batch_size).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut published_ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let result = retry_with_policy(
                &self.retry_policy,
                "publish_outbox_event",
                |e: &DispatchError| e.is_retryable(),
                || self.publisher.publish(&row.envelope),
            )
            .await;
            match result {
                Ok(()) => published_ids.push(row.id),
                Err(e) => {
                    warn!(
                        outbox_id = row.id,
                        event = row.envelope.event.name(),
                        error = %e,
                        "事件发布失败，本轮到此为止"
                    );
                    break;
                }
            }
        }

        self.outbox.mark_published(&published_ids).await?;
        Ok(published_ids.len())
    }

    /// 中继循环，收到关闭信号后做最后一次排空再退出
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Outbox 中继已启动"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        if let Err(e) = self.drain_once().await {
                            error!(error = %e, "关闭前排空 outbox 失败");
                        }
                        info!("收到关闭信号，Outbox 中继退出");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.drain_once().await {
                        Ok(0) => {}
                        Ok(n) => info!(published = n, "本轮事件发布完成"),
                        Err(e) => error!(error = %e, "Outbox 排空失败"),
                    }
                }
            }
        }
    }
}
