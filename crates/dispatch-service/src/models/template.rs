//! 通知模板聚合
//!
//! 模板按 (名称, 渠道) 维护版本序列，版本号单调递增且一经创建
//! 永不修改。任意时刻每个 (名称, 渠道) 至多一个 Active 版本，
//! 发布新版本时旧 Active 转为 Deprecated。版本不可变保证了
//! 延迟发送的通知在新版本发布后仍按创建时的版本渲染。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use notify_shared::events::Channel;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 模板版本状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateStatus {
    Draft,
    Active,
    Deprecated,
}

/// 通知模板（单个不可变版本）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationTemplate {
    pub id: String,
    /// 模板名称，与通知类型一致
    pub name: String,
    pub channel: Channel,
    /// 主题模板，Email/Push 使用，SMS/Webhook 为空
    pub subject: Option<String>,
    pub body: String,
    /// 占位符缺省值，渲染数据缺键时回退使用
    #[serde(default)]
    pub defaults: HashMap<String, String>,
    pub version: i32,
    pub status: TemplateStatus,
    pub created_at: DateTime<Utc>,
}

impl NotificationTemplate {
    /// 构建新版本（初始即 Active，由发布流程保证旧版本先降级）
    pub fn new_version(
        name: impl Into<String>,
        channel: Channel,
        subject: Option<String>,
        body: impl Into<String>,
        defaults: HashMap<String, String>,
        version: i32,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            channel,
            subject,
            body: body.into(),
            defaults,
            version,
            status: TemplateStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TemplateStatus::Active
    }

    /// 降级为 Deprecated（发布新版本时对旧 Active 调用）
    ///
    /// 只改状态标记，模板文本永不变更。
    pub fn deprecated(&self) -> Self {
        let mut next = self.clone();
        next.status = TemplateStatus::Deprecated;
        next
    }
}

/// 渲染结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub body: String,
}
