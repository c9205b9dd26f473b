//! 渠道策略评估
//!
//! 对单个 (请求, 收件人) 组合计算可投递渠道，纯函数无副作用，
//! 评估结果由调用方持久化。按收件人偏好的回退顺序逐渠道过滤：
//! 显式关闭 -> 剔除；落在免打扰窗口 -> 延迟（High 紧急度穿透）；
//! 频率超限 -> 剔除。只有所有渠道都被剔除才 Block；没有立即
//! 可用渠道但存在仅因免打扰被挡的渠道时 Defer。

use chrono::{DateTime, Utc};
use notify_shared::events::Channel;

use crate::models::{NotificationRequest, Recipient, UserNotificationPreferences};

/// 策略评估结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// 按回退顺序排列的可投递渠道（保持偏好列表中的相对顺序）
    Allow(Vec<Channel>),
    /// 全部候选渠道被免打扰窗口挡住，延迟到窗口结束
    Defer(DateTime<Utc>),
    /// 无任何渠道可用，请求对该收件人终止
    Block(String),
}

/// 策略评估器
pub struct PolicyEvaluator;

impl PolicyEvaluator {
    /// 评估收件人的可投递渠道
    ///
    /// `recent_sends` 是 (用户, 通知类型) 在偏好频控窗口内的
    /// 成功发送数，由调用方从投递台账查出后传入，评估本身不做 IO。
    /// 定时请求按 scheduled_at 评估免打扰，立即请求按 `now`。
    pub fn evaluate(
        request: &NotificationRequest,
        recipient: &Recipient,
        preferences: &UserNotificationPreferences,
        recent_sends: u32,
        now: DateTime<Utc>,
    ) -> PolicyDecision {
        let eval_time = request.scheduled_at.unwrap_or(now);

        let mut allowed = Vec::new();
        let mut deferred_until: Option<DateTime<Utc>> = None;
        let mut drop_reasons = Vec::new();

        for &channel in &request.channel_preferences {
            if recipient.address_for(channel).is_none() {
                drop_reasons.push(format!("{channel}: 无可达地址"));
                continue;
            }

            if !preferences.is_channel_enabled(&request.notification_type, channel) {
                drop_reasons.push(format!("{channel}: 用户已关闭"));
                continue;
            }

            if let Some(limit) = preferences.frequency_limit
                && recent_sends >= limit.max_per_window
            {
                drop_reasons.push(format!("{channel}: 频率超限"));
                continue;
            }

            if let Some(window) = preferences.dnd_window
                && window.contains(eval_time)
                && !request.urgency.overrides_dnd()
            {
                let until = window.defer_until(eval_time);
                deferred_until = Some(deferred_until.map_or(until, |u| u.min(until)));
                continue;
            }

            allowed.push(channel);
        }

        if !allowed.is_empty() {
            return PolicyDecision::Allow(allowed);
        }
        if let Some(until) = deferred_until {
            return PolicyDecision::Defer(until);
        }
        PolicyDecision::Block(if drop_reasons.is_empty() {
            "偏好列表中没有候选渠道".to_string()
        } else {
            drop_reasons.join("; ")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CreateNotificationCommand, DndWindow, FrequencyLimit, NotificationRequest, RecipientSpec,
    };
    use chrono::{NaiveTime, TimeZone};
    use notify_shared::events::Urgency;
    use std::collections::HashMap;

    fn make_request(urgency: Urgency, scheduled_at: Option<DateTime<Utc>>) -> NotificationRequest {
        let command = CreateNotificationCommand {
            notification_type: "OrderConfirmed".to_string(),
            payload: serde_json::json!({"orderNo": "A-1"}),
            recipients: vec![RecipientSpec {
                user_id: "u1".to_string(),
                addresses: HashMap::from([
                    (Channel::Email, "a@b.com".to_string()),
                    (Channel::Sms, "+8613800000000".to_string()),
                ]),
            }],
            channel_preferences: vec![Channel::Email, Channel::Sms],
            urgency,
            scheduled_at,
            correlation_id: "c1".to_string(),
            dedup_key: "d1".to_string(),
        };
        NotificationRequest::from_command(&command).unwrap().0
    }

    fn night_dnd() -> DndWindow {
        DndWindow {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        }
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn test_allow_preserves_fallback_order() {
        let request = make_request(Urgency::Medium, None);
        let prefs = UserNotificationPreferences::default_for("u1");

        let decision = PolicyEvaluator::evaluate(
            &request,
            &request.recipients[0],
            &prefs,
            0,
            at(12),
        );

        assert_eq!(
            decision,
            PolicyDecision::Allow(vec![Channel::Email, Channel::Sms])
        );
    }

    #[test]
    fn test_opted_out_channel_dropped() {
        let request = make_request(Urgency::Medium, None);
        let mut prefs = UserNotificationPreferences::default_for("u1");
        prefs.set_rule("OrderConfirmed", Channel::Email, false);

        let decision = PolicyEvaluator::evaluate(
            &request,
            &request.recipients[0],
            &prefs,
            0,
            at(12),
        );

        assert_eq!(decision, PolicyDecision::Allow(vec![Channel::Sms]));
    }

    #[test]
    fn test_channel_without_address_dropped() {
        let mut request = make_request(Urgency::Medium, None);
        request.recipients[0].addresses.remove(&Channel::Sms);
        let prefs = UserNotificationPreferences::default_for("u1");

        let decision = PolicyEvaluator::evaluate(
            &request,
            &request.recipients[0],
            &prefs,
            0,
            at(12),
        );

        assert_eq!(decision, PolicyDecision::Allow(vec![Channel::Email]));
    }

    #[test]
    fn test_dnd_defers_medium_urgency() {
        // 定时 23:00 落在 22:00-07:00 窗口内，延到次日 07:00
        let scheduled = at(23);
        let request = make_request(Urgency::Medium, Some(scheduled));
        let mut prefs = UserNotificationPreferences::default_for("u1");
        prefs.dnd_window = Some(night_dnd());

        let decision = PolicyEvaluator::evaluate(
            &request,
            &request.recipients[0],
            &prefs,
            0,
            at(12),
        );

        assert_eq!(
            decision,
            PolicyDecision::Defer(Utc.with_ymd_and_hms(2025, 6, 2, 7, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_high_urgency_overrides_dnd() {
        let request = make_request(Urgency::High, Some(at(23)));
        let mut prefs = UserNotificationPreferences::default_for("u1");
        prefs.dnd_window = Some(night_dnd());

        let decision = PolicyEvaluator::evaluate(
            &request,
            &request.recipients[0],
            &prefs,
            0,
            at(12),
        );

        assert_eq!(
            decision,
            PolicyDecision::Allow(vec![Channel::Email, Channel::Sms])
        );
    }

    #[test]
    fn test_frequency_limit_blocks_all_channels() {
        let request = make_request(Urgency::Medium, None);
        let mut prefs = UserNotificationPreferences::default_for("u1");
        prefs.frequency_limit = Some(FrequencyLimit {
            max_per_window: 3,
            window_seconds: 3600,
        });

        let decision = PolicyEvaluator::evaluate(
            &request,
            &request.recipients[0],
            &prefs,
            3,
            at(12),
        );

        assert!(matches!(decision, PolicyDecision::Block(_)));

        // 未达上限时放行
        let decision = PolicyEvaluator::evaluate(
            &request,
            &request.recipients[0],
            &prefs,
            2,
            at(12),
        );
        assert!(matches!(decision, PolicyDecision::Allow(_)));
    }

    #[test]
    fn test_all_opted_out_blocks_with_reason() {
        let request = make_request(Urgency::Medium, None);
        let mut prefs = UserNotificationPreferences::default_for("u1");
        prefs.set_rule("OrderConfirmed", Channel::Email, false);
        prefs.set_rule("OrderConfirmed", Channel::Sms, false);

        let decision = PolicyEvaluator::evaluate(
            &request,
            &request.recipients[0],
            &prefs,
            0,
            at(12),
        );

        match decision {
            PolicyDecision::Block(reason) => {
                assert!(reason.contains("EMAIL"));
                assert!(reason.contains("SMS"));
            }
            other => panic!("意外的结论: {other:?}"),
        }
    }

    #[test]
    fn test_frequency_drop_beats_defer() {
        // 频率超限的渠道不参与 Defer 判断
        let request = make_request(Urgency::Medium, Some(at(23)));
        let mut prefs = UserNotificationPreferences::default_for("u1");
        prefs.dnd_window = Some(night_dnd());
        prefs.frequency_limit = Some(FrequencyLimit {
            max_per_window: 1,
            window_seconds: 3600,
        });

        let decision = PolicyEvaluator::evaluate(
            &request,
            &request.recipients[0],
            &prefs,
            1,
            at(12),
        );

        assert!(matches!(decision, PolicyDecision::Block(_)));
    }
}
