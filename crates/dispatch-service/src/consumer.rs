//! 命令消费者
//!
//! 从 Kafka 命令 topic 消费上游业务系统的调度命令，驱动生命周期
//! 管理器执行。消费语义为至少一次：业务侧以 dedup_key 与日志幂等
//! 键去重，重放无额外效果。无法解析或校验失败的毒消息投递到
//! 死信队列，不阻塞后续消费；基础设施故障按退避策略原地重试，
//! 重试耗尽后同样转入死信队列，位点提交前消息不丢。

use std::sync::Arc;

use notify_shared::config::AppConfig;
use notify_shared::kafka::{ConsumerMessage, KafkaConsumer, KafkaProducer, topics};
use notify_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{DispatchError, Result};
use crate::lifecycle::RequestLifecycleManager;
use crate::models::DispatchCommand;

/// 命令消费者
pub struct CommandConsumer {
    consumer: KafkaConsumer,
    manager: Arc<RequestLifecycleManager>,
    /// 毒消息投递到死信队列，供后续排查
    producer: KafkaProducer,
}

impl CommandConsumer {
    pub fn new(
        config: &AppConfig,
        manager: Arc<RequestLifecycleManager>,
        producer: KafkaProducer,
    ) -> Result<Self> {
        let consumer = KafkaConsumer::new(&config.kafka, Some("commands"))
            .map_err(DispatchError::Shared)?;
        Ok(Self {
            consumer,
            manager,
            producer,
        })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.consumer
            .subscribe(&[topics::NOTIFY_COMMANDS])
            .map_err(DispatchError::Shared)?;
        info!(topic = topics::NOTIFY_COMMANDS, "命令消费者已启动");

        let manager = self.manager;
        let producer = self.producer;
        let retry_policy = RetryPolicy::default();

        self.consumer
            .start(shutdown, |msg| {
                let manager = &manager;
                let producer = &producer;
                let retry_policy = &retry_policy;
                async move {
                    consume_message(manager, producer, retry_policy, &msg).await;
                    Ok(())
                }
            })
            .await;

        info!("命令消费者已停止");
        Ok(())
    }
}

/// 消费单条消息
///
/// 消费者开启自动提交，位点会越过本条消息，因此可重试的基础设施
/// 错误必须在提交前原地按退避策略重试；重试耗尽仍失败时转入死信
/// 队列保留现场，不静默丢失。
async fn consume_message(
    manager: &RequestLifecycleManager,
    producer: &KafkaProducer,
    retry_policy: &RetryPolicy,
    msg: &ConsumerMessage,
) {
    let result = retry_with_policy(
        retry_policy,
        "handle_command",
        |e: &DispatchError| e.is_retryable(),
        || handle_message(manager, producer, msg),
    )
    .await;

    if let Err(e) = result {
        error!(
            error = %e,
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            "调度命令重试耗尽，转入死信队列"
        );
        send_to_dlq(producer, msg, &e.to_string()).await;
    }
}

/// 处理单条命令消息
///
/// 拆分为独立函数而非方法，便于在测试中直接调用而无需构造完整的
/// Consumer。解析失败与校验失败属于毒消息，进死信队列后返回 Ok，
/// 让消费位点继续推进；基础设施错误原样上抛，由消费入口按退避
/// 策略重试。
async fn handle_message(
    manager: &RequestLifecycleManager,
    producer: &KafkaProducer,
    msg: &ConsumerMessage,
) -> Result<()> {
    let command: DispatchCommand = match serde_json::from_slice(&msg.payload) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, offset = msg.offset, "命令解析失败，投递死信队列");
            send_to_dlq(producer, msg, &e.to_string()).await;
            return Ok(());
        }
    };

    match dispatch_command(manager, command).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => {
            // 校验/状态机类错误重放也不会成功
            warn!(error = %e, offset = msg.offset, "命令不可重试，投递死信队列");
            send_to_dlq(producer, msg, &e.to_string()).await;
            Ok(())
        }
    }
}

async fn dispatch_command(
    manager: &RequestLifecycleManager,
    command: DispatchCommand,
) -> Result<()> {
    match command {
        DispatchCommand::CreateNotification(command) => {
            let request = manager.create(&command).await?;
            // 创建后立即尝试处理；定时请求会保持 Pending 等调度时钟
            manager.process(&request.id).await?;
        }
        DispatchCommand::ProcessNotification { request_id } => {
            manager.process(&request_id).await?;
        }
        DispatchCommand::CancelNotification { request_id } => {
            manager.cancel(&request_id).await?;
        }
        DispatchCommand::ConfirmDelivered { log_id } => {
            manager.confirm_delivered(&log_id).await?;
        }
        DispatchCommand::MarkRead { log_id } => {
            manager.mark_read(&log_id).await?;
        }
        DispatchCommand::UpdatePreferences(preferences) => {
            manager.update_preferences(&preferences).await?;
        }
    }
    Ok(())
}

/// 把原始消息连同失败原因投递到死信队列
///
/// 死信投递本身失败只记录日志，不能让一条坏消息卡死消费循环。
async fn send_to_dlq(producer: &KafkaProducer, msg: &ConsumerMessage, reason: &str) {
    let dlq_payload = serde_json::json!({
        "sourceTopic": msg.topic,
        "partition": msg.partition,
        "offset": msg.offset,
        "reason": reason,
        "payload": String::from_utf8_lossy(&msg.payload),
    });

    let key = msg.key.as_deref().unwrap_or("unknown");
    if let Err(e) = producer
        .send_json(topics::DEAD_LETTER_QUEUE, key, &dlq_payload)
        .await
    {
        error!(error = %e, "投递死信队列失败");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use notify_shared::config::{DispatchConfig, KafkaConfig};
    use notify_shared::error::NotifyError;
    use notify_shared::events::{Channel, Urgency};

    use crate::dispatch::DispatchOrchestrator;
    use crate::dispatch::lease::MockLeaseStore;
    use crate::idempotency::MockIdempotencyStore;
    use crate::models::{CreateNotificationCommand, NotificationRequest, RecipientSpec};
    use crate::repository::traits::{
        MockDeliveryLogRepository, MockPreferencesRepository, MockRequestRepository,
        MockTemplateRepository,
    };
    use crate::template::TemplateEngine;

    fn manager_with(requests: MockRequestRepository) -> RequestLifecycleManager {
        let logs = Arc::new(MockDeliveryLogRepository::new());
        let templates = Arc::new(TemplateEngine::new(Arc::new(MockTemplateRepository::new())));
        let orchestrator = Arc::new(DispatchOrchestrator::new(
            logs.clone(),
            Arc::new(MockLeaseStore::new()),
            &DispatchConfig::default(),
        ));
        RequestLifecycleManager::new(
            Arc::new(requests),
            logs,
            Arc::new(MockPreferencesRepository::new()),
            templates,
            orchestrator,
            Arc::new(MockIdempotencyStore::new()),
            Duration::from_secs(60),
        )
    }

    /// 已到终态的请求，process 直接返回不再触碰其他仓储
    fn terminal_request() -> NotificationRequest {
        let command = CreateNotificationCommand {
            notification_type: "OrderConfirmed".to_string(),
            payload: serde_json::json!({"orderNo": "A-1"}),
            recipients: vec![RecipientSpec {
                user_id: "u1".to_string(),
                addresses: HashMap::from([(Channel::Email, "a@b.com".to_string())]),
            }],
            channel_preferences: vec![Channel::Email],
            urgency: Urgency::Medium,
            scheduled_at: None,
            correlation_id: "c1".to_string(),
            dedup_key: "d1".to_string(),
        };
        let (request, _) = NotificationRequest::from_command(&command).unwrap();
        request.cancel().unwrap().0
    }

    fn process_message(request_id: &str) -> ConsumerMessage {
        let command = DispatchCommand::ProcessNotification {
            request_id: request_id.to_string(),
        };
        ConsumerMessage {
            topic: topics::NOTIFY_COMMANDS.to_string(),
            partition: 0,
            offset: 7,
            key: None,
            payload: serde_json::to_vec(&command).unwrap(),
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried_in_place() {
        let terminal = terminal_request();
        let request_id = terminal.id.clone();

        // 前两次瞬时故障，第三次成功；times(3) 校验位点提交前确实原地重试
        let mut requests = MockRequestRepository::new();
        let mut call = 0u32;
        requests.expect_get().times(3).returning(move |_| {
            call += 1;
            if call < 3 {
                Err(DispatchError::Shared(NotifyError::Kafka(
                    "broker 抖动".to_string(),
                )))
            } else {
                Ok(Some(terminal.clone()))
            }
        });

        let manager = manager_with(requests);
        let producer = KafkaProducer::new(&KafkaConfig::default()).unwrap();

        consume_message(
            &manager,
            &producer,
            &fast_policy(),
            &process_message(&request_id),
        )
        .await;
    }

    #[tokio::test]
    async fn test_retryable_classification() {
        let infra = DispatchError::Shared(NotifyError::Kafka("超时".to_string()));
        assert!(infra.is_retryable());

        // 校验类错误重放也不会成功，不应占用重试预算
        let poison = DispatchError::Validation("payload 不能为空".to_string());
        assert!(!poison.is_retryable());
    }
}
