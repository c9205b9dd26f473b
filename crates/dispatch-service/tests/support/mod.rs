//! 集成测试支撑
//!
//! 进程内实现仓储、租约与幂等预留接口，键语义与 Postgres/Redis
//! 实现保持一致，让完整的创建-评估-渲染-分发-对账链路可以在
//! 无外部依赖的情况下运行。所有写路径产生的事件信封收进共享的
//! EventLog，测试据此断言事件的种类与次数。

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::config::DispatchConfig;
use notify_shared::events::{Channel, EventEnvelope};

use notification_dispatch::dispatch::gateway::{ChannelGateway, GatewayError, ProviderReceipt};
use notification_dispatch::dispatch::lease::LeaseStore;
use notification_dispatch::dispatch::DispatchOrchestrator;
use notification_dispatch::error::{DispatchError, Result};
use notification_dispatch::idempotency::{IdempotencyStore, Reservation};
use notification_dispatch::lifecycle::RequestLifecycleManager;
use notification_dispatch::models::{
    CreateNotificationCommand, NotificationRequest, NotificationTemplate, RecipientSpec,
    RenderedMessage, SentNotificationLog, UserNotificationPreferences,
};
use notification_dispatch::repository::traits::{
    DeliveryLogRepository, PreferencesRepository, RequestRepository, TemplateRepository,
};
use notification_dispatch::template::TemplateEngine;
use notify_shared::events::Urgency;

// ---------------------------------------------------------------------------
// EventLog — 事件收集器
// ---------------------------------------------------------------------------

/// 收集所有仓储写路径追加的事件信封，等价于 outbox 表
#[derive(Default, Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl EventLog {
    pub fn record(&self, events: &[EventEnvelope]) {
        self.events.lock().unwrap().extend_from_slice(events);
    }

    pub fn all(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    /// 按事件名统计出现次数
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event.name() == name)
            .count()
    }
}

// ---------------------------------------------------------------------------
// 仓储实现
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryRequestRepo {
    rows: Mutex<HashMap<String, NotificationRequest>>,
    pub events: EventLog,
}

impl InMemoryRequestRepo {
    pub fn with_events(events: EventLog) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl RequestRepository for InMemoryRequestRepo {
    async fn get(&self, id: &str) -> Result<Option<NotificationRequest>> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn get_by_dedup_key(&self, dedup_key: &str) -> Result<Option<NotificationRequest>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|r| r.dedup_key == dedup_key)
            .cloned())
    }

    async fn insert(&self, request: &NotificationRequest, events: &[EventEnvelope]) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if rows.values().any(|r| r.dedup_key == request.dedup_key) {
            return Err(DispatchError::ConcurrencyConflict {
                entity: "NotificationRequest".to_string(),
                id: request.dedup_key.clone(),
            });
        }
        rows.insert(request.id.clone(), request.clone());
        self.events.record(events);
        Ok(())
    }

    async fn save(
        &self,
        request: &NotificationRequest,
        expected_version: i64,
        events: &[EventEnvelope],
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let entry = rows
            .get_mut(&request.id)
            .ok_or_else(|| DispatchError::NotFound {
                entity: "NotificationRequest".to_string(),
                id: request.id.clone(),
            })?;
        if entry.version != expected_version {
            return Err(DispatchError::ConcurrencyConflict {
                entity: "NotificationRequest".to_string(),
                id: request.id.clone(),
            });
        }
        let mut next = request.clone();
        next.version = expected_version + 1;
        *entry = next;
        self.events.record(events);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLogRepo {
    rows: Mutex<HashMap<String, SentNotificationLog>>,
    pub events: EventLog,
}

impl InMemoryLogRepo {
    pub fn with_events(events: EventLog) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn key(request_id: &str, channel: Channel, address: &str) -> String {
        format!("{request_id}:{channel}:{address}")
    }
}

#[async_trait]
impl DeliveryLogRepository for InMemoryLogRepo {
    async fn get(&self, id: &str) -> Result<Option<SentNotificationLog>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|l| l.id == id)
            .cloned())
    }

    async fn get_by_key(
        &self,
        request_id: &str,
        channel: Channel,
        address: &str,
    ) -> Result<Option<SentNotificationLog>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&Self::key(request_id, channel, address))
            .cloned())
    }

    async fn create_if_absent(
        &self,
        log: &SentNotificationLog,
        events: &[EventEnvelope],
    ) -> Result<SentNotificationLog> {
        let mut rows = self.rows.lock().unwrap();
        let key = Self::key(&log.request_id, log.channel, &log.address);
        if let Some(existing) = rows.get(&key) {
            return Ok(existing.clone());
        }
        rows.insert(key, log.clone());
        self.events.record(events);
        Ok(log.clone())
    }

    async fn save(
        &self,
        log: &SentNotificationLog,
        expected_version: i64,
        events: &[EventEnvelope],
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let key = Self::key(&log.request_id, log.channel, &log.address);
        let entry = rows.get_mut(&key).ok_or_else(|| DispatchError::NotFound {
            entity: "SentNotificationLog".to_string(),
            id: log.id.clone(),
        })?;
        if entry.version != expected_version {
            return Err(DispatchError::ConcurrencyConflict {
                entity: "SentNotificationLog".to_string(),
                id: log.id.clone(),
            });
        }
        let mut next = log.clone();
        next.version = expected_version + 1;
        *entry = next;
        self.events.record(events);
        Ok(())
    }

    async fn list_by_request(&self, request_id: &str) -> Result<Vec<SentNotificationLog>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn list_by_address(&self, address: &str) -> Result<Vec<SentNotificationLog>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.address == address)
            .cloned()
            .collect())
    }

    async fn list_failed_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SentNotificationLog>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|l| {
                l.status == notification_dispatch::models::DeliveryStatus::Failed
                    && l.updated_at < cutoff
            })
            .cloned()
            .collect())
    }

    async fn count_recent_sends(
        &self,
        user_id: &str,
        notification_type: &str,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|l| {
                l.user_id == user_id
                    && l.notification_type == notification_type
                    && l.status.is_success()
                    && l.updated_at >= since
            })
            .count() as u32)
    }
}

#[derive(Default)]
pub struct InMemoryTemplateRepo {
    rows: Mutex<Vec<NotificationTemplate>>,
    pub events: EventLog,
}

impl InMemoryTemplateRepo {
    pub fn with_events(events: EventLog) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            events,
        }
    }
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateRepo {
    async fn get_active(
        &self,
        name: &str,
        channel: Channel,
    ) -> Result<Option<NotificationTemplate>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name == name && t.channel == channel && t.is_active())
            .cloned())
    }

    async fn get_version(
        &self,
        name: &str,
        channel: Channel,
        version: i32,
    ) -> Result<Option<NotificationTemplate>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name == name && t.channel == channel && t.version == version)
            .cloned())
    }

    async fn latest_version(&self, name: &str, channel: Channel) -> Result<Option<i32>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.name == name && t.channel == channel)
            .map(|t| t.version)
            .max())
    }

    async fn publish(
        &self,
        template: &NotificationTemplate,
        events: &[EventEnvelope],
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        for existing in rows.iter_mut() {
            if existing.name == template.name
                && existing.channel == template.channel
                && existing.is_active()
            {
                *existing = existing.deprecated();
            }
        }
        rows.push(template.clone());
        self.events.record(events);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPreferencesRepo {
    rows: Mutex<HashMap<String, UserNotificationPreferences>>,
    pub events: EventLog,
}

impl InMemoryPreferencesRepo {
    pub fn with_events(events: EventLog) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn put(&self, preferences: UserNotificationPreferences) {
        self.rows
            .lock()
            .unwrap()
            .insert(preferences.user_id.clone(), preferences);
    }
}

#[async_trait]
impl PreferencesRepository for InMemoryPreferencesRepo {
    async fn get(&self, user_id: &str) -> Result<Option<UserNotificationPreferences>> {
        Ok(self.rows.lock().unwrap().get(user_id).cloned())
    }

    async fn save(
        &self,
        preferences: &UserNotificationPreferences,
        events: &[EventEnvelope],
    ) -> Result<()> {
        self.rows
            .lock()
            .unwrap()
            .insert(preferences.user_id.clone(), preferences.clone());
        self.events.record(events);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 租约与幂等预留
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryLeaseStore {
    held: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, _ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().unwrap();
        if held.contains_key(key) {
            return Ok(false);
        }
        held.insert(key.to_string(), owner.to_string());
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        if held.get(key).is_some_and(|o| o == owner) {
            held.remove(key);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    reserved: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn reserve(&self, key: &str, reference: &str, _ttl: Duration) -> Result<Reservation> {
        let mut reserved = self.reserved.lock().unwrap();
        if let Some(existing) = reserved.get(key) {
            return Ok(Reservation {
                acquired: false,
                existing_ref: Some(existing.clone()),
            });
        }
        reserved.insert(key.to_string(), reference.to_string());
        Ok(Reservation {
            acquired: true,
            existing_ref: None,
        })
    }
}

// ---------------------------------------------------------------------------
// 脚本化网关
// ---------------------------------------------------------------------------

/// 按脚本顺序返回结果的网关，脚本耗尽后一律成功
pub struct ScriptedGateway {
    channel: Channel,
    calls: AtomicU32,
    script: Vec<std::result::Result<(), GatewayError>>,
}

impl ScriptedGateway {
    pub fn succeeding(channel: Channel) -> Self {
        Self::new(channel, vec![])
    }

    pub fn always_transient(channel: Channel) -> Self {
        Self::new(
            channel,
            std::iter::repeat_with(|| Err(GatewayError::Transient("模拟超时".to_string())))
                .take(64)
                .collect(),
        )
    }

    pub fn permanent(channel: Channel) -> Self {
        Self::new(
            channel,
            vec![Err(GatewayError::Permanent("地址被供应商拒绝".to_string()))],
        )
    }

    pub fn new(channel: Channel, script: Vec<std::result::Result<(), GatewayError>>) -> Self {
        Self {
            channel,
            calls: AtomicU32::new(0),
            script,
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelGateway for ScriptedGateway {
    async fn send(
        &self,
        _message: &RenderedMessage,
        _address: &str,
    ) -> std::result::Result<ProviderReceipt, GatewayError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        match self.script.get(n).cloned().unwrap_or(Ok(())) {
            Ok(()) => Ok(ProviderReceipt {
                provider_message_id: format!("prov-{n}"),
            }),
            Err(e) => Err(e),
        }
    }

    fn channel(&self) -> Channel {
        self.channel
    }
}

// ---------------------------------------------------------------------------
// Harness — 完整装配
// ---------------------------------------------------------------------------

/// 装配好的完整服务，外加各组件的观察入口
pub struct Harness {
    pub manager: Arc<RequestLifecycleManager>,
    pub engine: Arc<TemplateEngine>,
    pub events: EventLog,
    pub requests: Arc<InMemoryRequestRepo>,
    pub logs: Arc<InMemoryLogRepo>,
    pub preferences: Arc<InMemoryPreferencesRepo>,
}

/// 测试用调度配置：重试间隔压缩到毫秒级
pub fn test_dispatch_config() -> DispatchConfig {
    DispatchConfig {
        max_attempts: 3,
        gateway_timeout_ms: 500,
        lease_ttl_seconds: 5,
        idempotency_ttl_seconds: 60,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 2,
    }
}

pub fn harness(gateways: Vec<Arc<dyn ChannelGateway>>) -> Harness {
    let events = EventLog::default();
    let requests = Arc::new(InMemoryRequestRepo::with_events(events.clone()));
    let logs = Arc::new(InMemoryLogRepo::with_events(events.clone()));
    let templates = Arc::new(InMemoryTemplateRepo::with_events(events.clone()));
    let preferences = Arc::new(InMemoryPreferencesRepo::with_events(events.clone()));

    let engine = Arc::new(TemplateEngine::new(templates));

    let mut orchestrator = DispatchOrchestrator::new(
        logs.clone(),
        Arc::new(InMemoryLeaseStore::default()),
        &test_dispatch_config(),
    );
    for gateway in gateways {
        orchestrator.register_gateway(gateway);
    }

    let manager = Arc::new(RequestLifecycleManager::new(
        requests.clone(),
        logs.clone(),
        preferences.clone(),
        engine.clone(),
        Arc::new(orchestrator),
        Arc::new(InMemoryIdempotencyStore::default()),
        Duration::from_secs(60),
    ));

    Harness {
        manager,
        engine,
        events,
        requests,
        logs,
        preferences,
    }
}

/// 发布 OrderConfirmed 的 Email 与 SMS 模板
pub async fn publish_default_templates(harness: &Harness) {
    harness
        .engine
        .publish(
            "OrderConfirmed",
            Channel::Email,
            Some("订单 {{orderNo}} 已确认".to_string()),
            "您好，订单 {{orderNo}} 已确认。",
            HashMap::new(),
        )
        .await
        .unwrap();
    harness
        .engine
        .publish(
            "OrderConfirmed",
            Channel::Sms,
            None,
            "订单 {{orderNo}} 已确认",
            HashMap::new(),
        )
        .await
        .unwrap();
}

/// 标准单收件人命令（Email 优先，SMS 兜底）
pub fn order_confirmed_command(dedup_key: &str) -> CreateNotificationCommand {
    CreateNotificationCommand {
        notification_type: "OrderConfirmed".to_string(),
        payload: serde_json::json!({"orderNo": "A-1001"}),
        recipients: vec![RecipientSpec {
            user_id: "u1".to_string(),
            addresses: HashMap::from([
                (Channel::Email, "a@b.com".to_string()),
                (Channel::Sms, "+8613800000000".to_string()),
            ]),
        }],
        channel_preferences: vec![Channel::Email, Channel::Sms],
        urgency: Urgency::Medium,
        scheduled_at: None,
        correlation_id: "c1".to_string(),
        dedup_key: dedup_key.to_string(),
    }
}
