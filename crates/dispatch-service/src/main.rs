//! 通知调度服务入口
//!
//! 装配命令消费者、生命周期管理器、分发编排器与 outbox 中继，
//! 消费者与中继作为独立任务运行，经 watch channel 优雅关闭。

use std::sync::Arc;

use anyhow::Result;
use notify_shared::{cache::Cache, config::AppConfig, database::Database, observability};
use notify_shared::kafka::KafkaProducer;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use notification_dispatch::consumer::CommandConsumer;
use notification_dispatch::dispatch::{
    DispatchOrchestrator, RedisLeaseStore,
    gateway::{EmailGateway, PushGateway, SmsGateway, WebhookGateway},
};
use notification_dispatch::idempotency::RedisIdempotencyStore;
use notification_dispatch::lifecycle::RequestLifecycleManager;
use notification_dispatch::outbox::{KafkaEventPublisher, OutboxRelay};
use notification_dispatch::repository::{
    PgDeliveryLogRepository, PgOutboxRepository, PgPreferencesRepository, PgRequestRepository,
    PgTemplateRepository,
};
use notification_dispatch::template::TemplateEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置并初始化日志
    let config = AppConfig::load("notification-dispatch").unwrap_or_else(|e| {
        eprintln!("加载配置失败，回退到默认配置: {e}");
        AppConfig::default()
    });
    observability::init(&config.observability)?;

    info!(
        environment = %config.environment,
        "notification-dispatch 启动中"
    );

    // 2. 基础设施连接
    let db = Database::connect(&config.database).await?;
    let pool = db.pool().clone();
    info!("数据库连接就绪");

    let cache = Cache::new(&config.redis)?;
    cache.health_check().await?;
    info!("Redis 连接就绪");

    let producer = KafkaProducer::new(&config.kafka)?;

    // 3. 仓储
    let request_repo = Arc::new(PgRequestRepository::new(pool.clone()));
    let log_repo = Arc::new(PgDeliveryLogRepository::new(pool.clone()));
    let template_repo = Arc::new(PgTemplateRepository::new(pool.clone()));
    let preferences_repo = Arc::new(PgPreferencesRepository::new(pool.clone()));
    let outbox_repo = Arc::new(PgOutboxRepository::new(pool.clone()));
    info!("仓储初始化完成");

    // 4. 领域组件
    let templates = Arc::new(TemplateEngine::new(template_repo));

    let mut orchestrator = DispatchOrchestrator::new(
        log_repo.clone(),
        Arc::new(RedisLeaseStore::new(cache.clone())),
        &config.dispatch,
    );
    orchestrator.register_gateway(Arc::new(EmailGateway));
    orchestrator.register_gateway(Arc::new(SmsGateway));
    orchestrator.register_gateway(Arc::new(PushGateway));
    orchestrator.register_gateway(Arc::new(WebhookGateway));

    let manager = Arc::new(RequestLifecycleManager::new(
        request_repo,
        log_repo,
        preferences_repo,
        templates,
        Arc::new(orchestrator),
        Arc::new(RedisIdempotencyStore::new(cache)),
        config.dispatch.idempotency_ttl(),
    ));

    // 5. 后台任务：outbox 中继与命令消费者
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = OutboxRelay::new(
        outbox_repo,
        Arc::new(KafkaEventPublisher::new(producer.clone())),
    );
    let relay_handle = tokio::spawn(relay.run(shutdown_rx.clone()));

    let consumer = CommandConsumer::new(&config, manager, producer)?;
    let consumer_handle = tokio::spawn(consumer.run(shutdown_rx));

    info!("notification-dispatch 已就绪");

    // 6. 等待终止信号后优雅关闭
    signal::ctrl_c().await?;
    info!("收到终止信号，开始优雅关闭");
    shutdown_tx.send(true)?;

    if let Err(e) = consumer_handle.await {
        warn!(error = %e, "命令消费者退出异常");
    }
    if let Err(e) = relay_handle.await {
        warn!(error = %e, "Outbox 中继退出异常");
    }

    db.close().await;
    info!("notification-dispatch 已停止");
    Ok(())
}
