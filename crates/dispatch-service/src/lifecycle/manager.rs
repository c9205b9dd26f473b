//! 请求生命周期管理器
//!
//! 持有请求聚合的状态机并编排其余组件：幂等创建、策略评估、
//! 模板渲染、多渠道并发分发与终态对账。请求之间相互独立，
//! 没有跨聚合事务；单个聚合的写入靠版本 CAS 串行化，冲突方
//! 重新加载后重试。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use notify_shared::events::{Channel, DomainEvent, EventEnvelope};
use tracing::{info, instrument, warn};

use crate::dispatch::DispatchOrchestrator;
use crate::error::{DispatchError, Result};
use crate::idempotency::IdempotencyStore;
use crate::models::{
    CreateNotificationCommand, NotificationRequest, Recipient, RecipientOutcome, RequestStatus,
    SentNotificationLog, UserNotificationPreferences,
};
use crate::policy::{PolicyDecision, PolicyEvaluator};
use crate::repository::{DeliveryLogRepository, PreferencesRepository, RequestRepository};
use crate::template::TemplateEngine;

/// 对账 CAS 冲突的重载重试上限
///
/// 兄弟渠道的完成回调并发对账时互相挤掉极为短暂，重载几次必然
/// 有一方成功或发现已到终态。
const RECONCILE_MAX_RETRIES: u32 = 5;

/// 请求生命周期管理器
pub struct RequestLifecycleManager {
    requests: Arc<dyn RequestRepository>,
    logs: Arc<dyn DeliveryLogRepository>,
    preferences: Arc<dyn PreferencesRepository>,
    templates: Arc<TemplateEngine>,
    orchestrator: Arc<DispatchOrchestrator>,
    idempotency: Arc<dyn IdempotencyStore>,
    idempotency_ttl: Duration,
}

impl RequestLifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        logs: Arc<dyn DeliveryLogRepository>,
        preferences: Arc<dyn PreferencesRepository>,
        templates: Arc<TemplateEngine>,
        orchestrator: Arc<DispatchOrchestrator>,
        idempotency: Arc<dyn IdempotencyStore>,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            requests,
            logs,
            preferences,
            templates,
            orchestrator,
            idempotency,
            idempotency_ttl,
        }
    }

    // ------------------------------------------------------------------
    // 创建
    // ------------------------------------------------------------------

    /// 幂等创建请求
    ///
    /// 同 dedup_key 的重复命令返回已存在的请求，不重复发出
    /// NotificationRequested 事件。Redis 预留是快路径；预留过期后
    /// 数据库 dedup_key 唯一约束仍会拦下重放，冲突时改走读取存量。
    #[instrument(skip(self, command), fields(dedup_key = %command.dedup_key))]
    pub async fn create(&self, command: &CreateNotificationCommand) -> Result<NotificationRequest> {
        let (request, event) = NotificationRequest::from_command(command)?;

        let reservation = self
            .idempotency
            .reserve(&command.dedup_key, &request.id, self.idempotency_ttl)
            .await?;
        if !reservation.acquired {
            // 预留被占：优先按登记的请求 id 取，兜底按 dedup_key 查
            if let Some(existing_id) = reservation.existing_ref
                && let Some(existing) = self.requests.get(&existing_id).await?
            {
                info!(request_id = %existing.id, "重复命令，返回已存在的请求");
                return Ok(existing);
            }
            if let Some(existing) = self.requests.get_by_dedup_key(&command.dedup_key).await? {
                return Ok(existing);
            }
            // 占用方尚未落库（创建中途崩溃），继续走插入由唯一约束裁决
        }

        let envelope = EventEnvelope::new(&request.correlation_id, event);
        match self.requests.insert(&request, &[envelope]).await {
            Ok(()) => {
                info!(request_id = %request.id, "通知请求已创建");
                Ok(request)
            }
            Err(DispatchError::ConcurrencyConflict { .. }) => {
                // 并发创建输给了对方，读取存量返回
                self.requests
                    .get_by_dedup_key(&command.dedup_key)
                    .await?
                    .ok_or_else(|| DispatchError::NotFound {
                        entity: "NotificationRequest".to_string(),
                        id: command.dedup_key.clone(),
                    })
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // 处理与分发
    // ------------------------------------------------------------------

    /// 处理 Pending 请求：策略评估、渲染、多渠道并发分发、对账
    ///
    /// 消费侧至少一次投递会重放处理命令：非 Pending 的请求直接
    /// 返回当前状态而不是报错，但 Processing 中仍有被免打扰推迟
    /// 的收件人时走恢复路径重新评估。定时在未来的请求保持
    /// Pending，由外部调度时钟到点重新触发。
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn process(&self, request_id: &str) -> Result<NotificationRequest> {
        let request = self.load_request(request_id).await?;
        match request.status {
            RequestStatus::Pending => {}
            RequestStatus::Processing if request.has_deferred_recipients() => {
                return self.resume_deferred(request).await;
            }
            _ => return Ok(request),
        }

        let now = Utc::now();
        if let Some(scheduled_at) = request.scheduled_at
            && scheduled_at > now
        {
            info!(scheduled_at = %scheduled_at, "定时请求未到期，保持 Pending");
            return Ok(request);
        }

        let (plan, deferred, block_reasons) = self
            .evaluate_recipients(&request, &request.recipients, now)
            .await?;

        if plan.is_empty() {
            if !deferred.is_empty() {
                // 至少一个收件人只是被免打扰挡住，等窗口结束重新触发
                return Ok(request);
            }
            let (blocked, event) = request.block(block_reasons.join("; "))?;
            self.save_request(&blocked, request.version, vec![event])
                .await?;
            warn!(request_id = %request_id, "请求被策略阻断");
            return Ok(blocked);
        }

        let (processing, event) = request.start_processing(&plan, &deferred)?;
        self.save_request(&processing, request.version, vec![event])
            .await?;

        self.fan_out(&processing, &processing.recipients).await;
        self.reconcile(request_id).await
    }

    /// 恢复 Processing 请求中被免打扰推迟的收件人
    ///
    /// 只重新评估仍带推迟标记的收件人：窗口已过的补写渠道计划并
    /// 立即分发，仍在窗口内的继续等待，此刻被策略挡下的清除标记
    /// 由对账记为失败。全部仍在窗口内时不产生任何写入。
    async fn resume_deferred(&self, request: NotificationRequest) -> Result<NotificationRequest> {
        let now = Utc::now();
        let deferred_recipients: Vec<Recipient> = request
            .recipients
            .iter()
            .filter(|r| r.deferred)
            .cloned()
            .collect();
        let (plan, still_deferred, _) = self
            .evaluate_recipients(&request, &deferred_recipients, now)
            .await?;

        if still_deferred.len() == deferred_recipients.len() {
            return Ok(request);
        }

        let (resumed, event) = request.resume_deferred(&plan, &still_deferred)?;
        self.save_request(&resumed, request.version, vec![event])
            .await?;

        // 只分发本轮恢复的收件人，已落定的收件人不再触碰
        let targets: Vec<Recipient> = resumed
            .recipients
            .iter()
            .filter(|r| plan.contains_key(&r.user_id))
            .cloned()
            .collect();
        self.fan_out(&resumed, &targets).await;
        self.reconcile(&resumed.id).await
    }

    /// 逐收件人评估策略
    ///
    /// 返回 (渠道计划, 被免打扰推迟的收件人, 阻断原因)。
    async fn evaluate_recipients(
        &self,
        request: &NotificationRequest,
        recipients: &[Recipient],
        now: DateTime<Utc>,
    ) -> Result<(HashMap<String, Vec<Channel>>, HashSet<String>, Vec<String>)> {
        let mut plan: HashMap<String, Vec<Channel>> = HashMap::new();
        let mut deferred = HashSet::new();
        let mut block_reasons = Vec::new();

        for recipient in recipients {
            let prefs = self
                .preferences
                .get(&recipient.user_id)
                .await?
                .unwrap_or_else(|| UserNotificationPreferences::default_for(&recipient.user_id));

            let recent_sends = match prefs.frequency_limit {
                Some(limit) => {
                    self.logs
                        .count_recent_sends(
                            &recipient.user_id,
                            &request.notification_type,
                            now - limit.window(),
                        )
                        .await?
                }
                None => 0,
            };

            match PolicyEvaluator::evaluate(request, recipient, &prefs, recent_sends, now) {
                PolicyDecision::Allow(channels) => {
                    plan.insert(recipient.user_id.clone(), channels);
                }
                PolicyDecision::Defer(until) => {
                    info!(user_id = %recipient.user_id, until = %until, "收件人处于免打扰窗口");
                    deferred.insert(recipient.user_id.clone());
                }
                PolicyDecision::Block(reason) => {
                    block_reasons.push(format!("{}: {reason}", recipient.user_id));
                }
            }
        }

        Ok((plan, deferred, block_reasons))
    }

    /// 并发分发指定的收件人
    ///
    /// 收件人之间并发（join_all 扇出）；单个收件人内部按计划渠道
    /// 的回退顺序串行尝试，任一渠道成功即停止，后续渠道不再打扰。
    /// 单个收件人的失败不打断兄弟分发，结果都落在各自的投递日志
    /// 里，由对账统一汇总。
    async fn fan_out(&self, request: &NotificationRequest, targets: &[Recipient]) {
        // 消息按渠道渲染一次，同渠道的收件人复用
        let mut rendered = HashMap::new();
        for recipient in targets {
            for &channel in &recipient.planned_channels {
                if rendered.contains_key(&channel) {
                    continue;
                }
                let result = self
                    .templates
                    .resolve_and_render(&request.notification_type, channel, &request.payload)
                    .await;
                rendered.insert(channel, result);
            }
        }

        let tasks = targets
            .iter()
            .map(|recipient| self.dispatch_with_fallback(request, recipient, &rendered));
        join_all(tasks).await;
    }

    /// 单个收件人的渠道回退分发
    async fn dispatch_with_fallback(
        &self,
        request: &NotificationRequest,
        recipient: &Recipient,
        rendered: &HashMap<Channel, Result<crate::models::RenderedMessage>>,
    ) {
        for &channel in &recipient.planned_channels {
            let result = match rendered.get(&channel) {
                Some(Ok(message)) => {
                    self.orchestrator
                        .dispatch(request, recipient, channel, message)
                        .await
                }
                Some(Err(template_err)) => {
                    // 渲染失败不会静默丢弃：记一条永久失败的日志
                    self.record_render_failure(request, recipient, channel, template_err)
                        .await
                }
                None => continue,
            };

            match result {
                Ok(log) if log.status.is_success() => return,
                Ok(_) => {
                    // 当前渠道失败，回退到下一个偏好渠道
                }
                Err(e) => {
                    warn!(
                        request_id = %request.id,
                        user_id = %recipient.user_id,
                        channel = %channel,
                        error = %e,
                        "单渠道分发失败"
                    );
                }
            }
        }
    }

    /// 模板解析/渲染失败时落一条终态 Failed 的投递日志
    async fn record_render_failure(
        &self,
        request: &NotificationRequest,
        recipient: &Recipient,
        channel: Channel,
        template_err: &DispatchError,
    ) -> Result<SentNotificationLog> {
        let Some(address) = recipient.address_for(channel) else {
            return Err(DispatchError::Validation(format!(
                "收件人 {} 在渠道 {channel} 上没有地址",
                recipient.user_id
            )));
        };

        let fresh = SentNotificationLog::new(
            &request.id,
            &recipient.user_id,
            &request.notification_type,
            channel,
            address,
        );
        let log = self.logs.create_if_absent(&fresh, &[]).await?;
        if log.status.is_settled() {
            return Ok(log);
        }

        let (failed, events) = log.record_permanent_failure(template_err.to_string())?;
        self.logs
            .save(
                &failed,
                log.version,
                &Self::envelopes(&request.correlation_id, events),
            )
            .await?;
        Ok(failed)
    }

    // ------------------------------------------------------------------
    // 对账
    // ------------------------------------------------------------------

    /// 终态对账
    ///
    /// 重读请求与全部投递日志，所有计划中的投递都落定后把请求推进
    /// 到 Completed（存在任一成功）或 Failed（无一成功），收件人
    /// 维度的结果写入各自的 outcome。兄弟渠道并发完成时 CAS 冲突，
    /// 重载后重算。
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn reconcile(&self, request_id: &str) -> Result<NotificationRequest> {
        for _ in 0..RECONCILE_MAX_RETRIES {
            let request = self.load_request(request_id).await?;
            if request.status != RequestStatus::Processing {
                return Ok(request);
            }

            let logs = self.logs.list_by_request(request_id).await?;
            let Some(outcomes) = Self::settle(&request, &logs) else {
                // 仍有在途投递，等下一次完成回调触发
                return Ok(request);
            };

            let any_success = outcomes
                .values()
                .any(|o| *o == RecipientOutcome::Succeeded);
            let transition = if any_success {
                request.complete(&outcomes)
            } else {
                request.fail("所有渠道投递均失败", &outcomes)
            };
            let (next, event) = transition?;

            match self.save_request(&next, request.version, vec![event]).await {
                Ok(()) => {
                    info!(status = %next.status, "请求已对账到终态");
                    return Ok(next);
                }
                Err(DispatchError::ConcurrencyConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(DispatchError::ConcurrencyConflict {
            entity: "NotificationRequest".to_string(),
            id: request_id.to_string(),
        })
    }

    /// 判定请求是否全部落定，是则给出每个收件人的最终结果
    ///
    /// 回退语义下收件人落定 = 任一计划渠道成功，或所有计划渠道
    /// 都留下了已落定（失败）的日志；计划渠道为空（策略未给该
    /// 收件人留下渠道）视为直接失败。被免打扰推迟的收件人尚无
    /// 渠道计划，请求不得落定。
    fn settle(
        request: &NotificationRequest,
        logs: &[SentNotificationLog],
    ) -> Option<HashMap<String, RecipientOutcome>> {
        let mut outcomes = HashMap::new();

        for recipient in &request.recipients {
            if recipient.deferred {
                return None;
            }
            let mut any_success = false;
            let mut all_settled = true;
            for &channel in &recipient.planned_channels {
                let Some(address) = recipient.address_for(channel) else {
                    continue;
                };
                match logs
                    .iter()
                    .find(|l| l.channel == channel && l.address == address)
                {
                    Some(log) if log.status.is_settled() => {
                        any_success |= log.status.is_success();
                    }
                    // 日志缺失或仍在排队
                    _ => all_settled = false,
                }
            }

            let outcome = if any_success {
                RecipientOutcome::Succeeded
            } else if all_settled {
                RecipientOutcome::Failed
            } else {
                // 既无成功也未全部落定，继续等待
                return None;
            };
            outcomes.insert(recipient.user_id.clone(), outcome);
        }

        Some(outcomes)
    }

    // ------------------------------------------------------------------
    // 回执与取消
    // ------------------------------------------------------------------

    /// 渠道送达回执
    pub async fn confirm_delivered(&self, log_id: &str) -> Result<SentNotificationLog> {
        self.apply_receipt(log_id, SentNotificationLog::confirm_delivered)
            .await
    }

    /// 已读回执
    pub async fn mark_read(&self, log_id: &str) -> Result<SentNotificationLog> {
        self.apply_receipt(log_id, SentNotificationLog::mark_read).await
    }

    async fn apply_receipt(
        &self,
        log_id: &str,
        transition: impl Fn(&SentNotificationLog) -> Result<(SentNotificationLog, Vec<DomainEvent>)>,
    ) -> Result<SentNotificationLog> {
        let log = self
            .logs
            .get(log_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound {
                entity: "SentNotificationLog".to_string(),
                id: log_id.to_string(),
            })?;

        let (next, events) = transition(&log)?;
        if events.is_empty() {
            // 重复/乱序回执，无事发生
            return Ok(next);
        }

        let correlation_id = self
            .requests
            .get(&log.request_id)
            .await?
            .map(|r| r.correlation_id)
            .unwrap_or_else(|| log.request_id.clone());
        self.logs
            .save(&next, log.version, &Self::envelopes(&correlation_id, events))
            .await?;

        // 回执可能是该请求最后一块拼图
        self.reconcile(&log.request_id).await?;
        Ok(next)
    }

    /// 取消尚未开始处理的请求
    ///
    /// 仅 Pending 可取消；已进入 Processing 的在途发送不可中断。
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn cancel(&self, request_id: &str) -> Result<NotificationRequest> {
        let request = self.load_request(request_id).await?;
        let (canceled, event) = request.cancel()?;
        self.save_request(&canceled, request.version, vec![event])
            .await?;
        info!("请求已取消");
        Ok(canceled)
    }

    // ------------------------------------------------------------------
    // 偏好
    // ------------------------------------------------------------------

    /// 更新用户偏好
    pub async fn update_preferences(
        &self,
        preferences: &UserNotificationPreferences,
    ) -> Result<UserNotificationPreferences> {
        let mut next = preferences.clone();
        next.version = self
            .preferences
            .get(&preferences.user_id)
            .await?
            .map_or(1, |existing| existing.version + 1);
        next.updated_at = Utc::now();

        let event = DomainEvent::UserNotificationPreferencesUpdated {
            user_id: next.user_id.clone(),
        };
        self.preferences
            .save(&next, &Self::envelopes(&next.user_id, vec![event]))
            .await?;
        Ok(next)
    }

    // ------------------------------------------------------------------
    // 内部工具
    // ------------------------------------------------------------------

    async fn load_request(&self, request_id: &str) -> Result<NotificationRequest> {
        self.requests
            .get(request_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound {
                entity: "NotificationRequest".to_string(),
                id: request_id.to_string(),
            })
    }

    async fn save_request(
        &self,
        request: &NotificationRequest,
        expected_version: i64,
        events: Vec<DomainEvent>,
    ) -> Result<()> {
        self.requests
            .save(
                request,
                expected_version,
                &Self::envelopes(&request.correlation_id, events),
            )
            .await
    }

    fn envelopes(correlation_id: &str, events: Vec<DomainEvent>) -> Vec<EventEnvelope> {
        events
            .into_iter()
            .map(|e| EventEnvelope::new(correlation_id, e))
            .collect()
    }
}
