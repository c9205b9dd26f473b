//! 用户通知偏好聚合
//!
//! 偏好是长生命周期聚合，仅通过显式的偏好更新操作变更。
//! 包含三类规则：按 (通知类型, 渠道) 的开关（缺省开启）、
//! 免打扰窗口、按通知类型的滑动窗口频率上限。
//! 策略评估器只读取偏好，不在评估过程中修改它。

use chrono::{DateTime, Duration, NaiveTime, Utc};
use notify_shared::events::Channel;
use serde::{Deserialize, Serialize};

/// 单条 (通知类型, 渠道) 开关规则
///
/// 只保存显式设置过的规则，未出现的组合视为开启。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceRule {
    pub notification_type: String,
    pub channel: Channel,
    pub enabled: bool,
}

/// 免打扰窗口
///
/// 时间按 UTC 解释。`start > end` 表示跨午夜窗口（如 22:00-07:00）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DndWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DndWindow {
    /// 指定时刻是否落在窗口内（左闭右开）
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let t = at.time();
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    /// 窗口内时刻对应的窗口结束时间，即延迟投递的目标时间
    ///
    /// 调用方保证 `contains(at)` 为 true。
    pub fn defer_until(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = at.date_naive();
        let mut end = date
            .and_time(self.end)
            .and_utc();
        // 跨午夜窗口里，处于 start 之后午夜之前的时刻要延到次日的 end
        if end <= at {
            end += Duration::days(1);
        }
        end
    }
}

/// 按通知类型的频率上限
///
/// 窗口为滑动窗口：统计最近 `window_seconds` 内的成功发送次数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyLimit {
    pub max_per_window: u32,
    pub window_seconds: i64,
}

impl FrequencyLimit {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_seconds)
    }
}

/// 用户通知偏好聚合
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNotificationPreferences {
    pub user_id: String,
    #[serde(default)]
    pub rules: Vec<PreferenceRule>,
    pub dnd_window: Option<DndWindow>,
    pub frequency_limit: Option<FrequencyLimit>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserNotificationPreferences {
    /// 用户的缺省偏好：全渠道开启、无免打扰、无频控
    pub fn default_for(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            rules: Vec::new(),
            dnd_window: None,
            frequency_limit: None,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    /// (通知类型, 渠道) 是否开启，无显式规则时缺省开启
    pub fn is_channel_enabled(&self, notification_type: &str, channel: Channel) -> bool {
        self.rules
            .iter()
            .find(|r| r.notification_type == notification_type && r.channel == channel)
            .map(|r| r.enabled)
            .unwrap_or(true)
    }

    /// 设置单条规则，已存在则覆盖
    pub fn set_rule(&mut self, notification_type: impl Into<String>, channel: Channel, enabled: bool) {
        let notification_type = notification_type.into();
        if let Some(rule) = self
            .rules
            .iter_mut()
            .find(|r| r.notification_type == notification_type && r.channel == channel)
        {
            rule.enabled = enabled;
        } else {
            self.rules.push(PreferenceRule {
                notification_type,
                channel,
                enabled,
            });
        }
        self.updated_at = Utc::now();
    }
}
