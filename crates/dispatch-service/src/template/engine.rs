//! 模板引擎
//!
//! 解析 (通知类型, 渠道) 的 Active 模板并渲染 `{{key}}` 占位符。
//! 渲染是纯函数：相同模板版本与相同数据永远产出相同结果，配合
//! 版本不可变，延迟投递的通知不受后续模板发布影响。
//! Active 模板走进程内 read-through 缓存，发布新版本时精确失效
//! 对应键，不依赖 TTL。

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use notify_shared::events::{Channel, DomainEvent, EventEnvelope};
use regex::Regex;
use tracing::info;

use crate::error::{DispatchError, Result};
use crate::models::{NotificationTemplate, RenderedMessage};
use crate::repository::TemplateRepository;

/// 模板引擎
pub struct TemplateEngine {
    repo: Arc<dyn TemplateRepository>,
    cache: DashMap<(String, Channel), Arc<NotificationTemplate>>,
    token_regex: Regex,
}

impl TemplateEngine {
    pub fn new(repo: Arc<dyn TemplateRepository>) -> Self {
        Self {
            repo,
            cache: DashMap::new(),
            // 占位符只允许单词字符，非法 token 原样保留
            token_regex: Regex::new(r"\{\{(\w+)\}\}").expect("占位符正则非法"),
        }
    }

    /// 解析当前 Active 模板，缓存命中则不落库
    pub async fn resolve(
        &self,
        notification_type: &str,
        channel: Channel,
    ) -> Result<Arc<NotificationTemplate>> {
        let key = (notification_type.to_string(), channel);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Arc::clone(&cached));
        }

        let template = self
            .repo
            .get_active(notification_type, channel)
            .await?
            .ok_or_else(|| DispatchError::TemplateNotFound {
                notification_type: notification_type.to_string(),
                channel,
            })?;

        let template = Arc::new(template);
        self.cache.insert(key, Arc::clone(&template));
        Ok(template)
    }

    /// 渲染模板
    ///
    /// 数据来源优先级：payload 中的同名键 > 模板缺省值；两者都缺
    /// 返回 `MissingPlaceholder`。payload 中多余的键忽略。
    pub fn render(
        &self,
        template: &NotificationTemplate,
        payload: &serde_json::Value,
    ) -> Result<RenderedMessage> {
        let subject = template
            .subject
            .as_deref()
            .map(|s| self.substitute(s, payload, &template.defaults))
            .transpose()?;
        let body = self.substitute(&template.body, payload, &template.defaults)?;

        Ok(RenderedMessage { subject, body })
    }

    /// 解析并渲染，调度路径的组合入口
    pub async fn resolve_and_render(
        &self,
        notification_type: &str,
        channel: Channel,
        payload: &serde_json::Value,
    ) -> Result<RenderedMessage> {
        let template = self.resolve(notification_type, channel).await?;
        self.render(&template, payload)
    }

    /// 发布新模板版本
    ///
    /// 版本号取现有最大版本 + 1，旧 Active 在同一事务中降级。
    /// 成功后精确失效对应缓存键。
    pub async fn publish(
        &self,
        name: &str,
        channel: Channel,
        subject: Option<String>,
        body: &str,
        defaults: HashMap<String, String>,
    ) -> Result<NotificationTemplate> {
        let version = self.repo.latest_version(name, channel).await?.unwrap_or(0) + 1;
        let template =
            NotificationTemplate::new_version(name, channel, subject, body, defaults, version);

        let event = DomainEvent::NotificationTemplateVersionCreated {
            template_id: template.id.clone(),
            name: template.name.clone(),
            channel: template.channel,
            version: template.version,
        };
        let envelope = EventEnvelope::new(template.id.clone(), event);

        self.repo.publish(&template, &[envelope]).await?;
        self.cache.remove(&(name.to_string(), channel));

        info!(
            template_id = %template.id,
            name = %name,
            channel = %channel,
            version,
            "模板新版本已发布"
        );
        Ok(template)
    }

    fn substitute(
        &self,
        text: &str,
        payload: &serde_json::Value,
        defaults: &HashMap<String, String>,
    ) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;

        for caps in self.token_regex.captures_iter(text) {
            let whole = caps.get(0).expect("捕获组 0 必然存在");
            let key = &caps[1];

            let value = match payload.get(key) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => defaults
                    .get(key)
                    .cloned()
                    .ok_or_else(|| DispatchError::MissingPlaceholder {
                        token: key.to_string(),
                    })?,
            };

            out.push_str(&text[last..whole.start()]);
            out.push_str(&value);
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::traits::MockTemplateRepository;

    fn engine_with(repo: MockTemplateRepository) -> TemplateEngine {
        TemplateEngine::new(Arc::new(repo))
    }

    fn make_template(body: &str, version: i32) -> NotificationTemplate {
        NotificationTemplate::new_version(
            "OrderConfirmed",
            Channel::Email,
            Some("订单 {{orderNo}}".to_string()),
            body,
            HashMap::from([("userName".to_string(), "用户".to_string())]),
            version,
        )
    }

    #[test]
    fn test_render_substitutes_tokens() {
        let engine = engine_with(MockTemplateRepository::new());
        let template = make_template("您好 {{userName}}，订单 {{orderNo}} 共 {{amount}} 元", 1);

        let rendered = engine
            .render(
                &template,
                &serde_json::json!({"orderNo": "A-1001", "amount": 99, "extra": "忽略"}),
            )
            .unwrap();

        // userName 回退到模板缺省值，数字占位符按 JSON 字面量输出
        assert_eq!(rendered.subject.as_deref(), Some("订单 A-1001"));
        assert_eq!(rendered.body, "您好 用户，订单 A-1001 共 99 元");
    }

    #[test]
    fn test_render_missing_placeholder() {
        let engine = engine_with(MockTemplateRepository::new());
        let template = make_template("订单 {{orderNo}}", 1);

        let err = engine
            .render(&template, &serde_json::json!({"other": 1}))
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::MissingPlaceholder { token } if token == "orderNo"
        ));
    }

    #[test]
    fn test_render_is_deterministic() {
        let engine = engine_with(MockTemplateRepository::new());
        let template = make_template("订单 {{orderNo}}", 1);
        let payload = serde_json::json!({"orderNo": "A-1"});

        let first = engine.render(&template, &payload).unwrap();
        let second = engine.render(&template, &payload).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_resolve_caches_active_template() {
        let mut repo = MockTemplateRepository::new();
        // 仅允许一次仓储访问，第二次 resolve 必须命中缓存
        repo.expect_get_active()
            .times(1)
            .returning(|_, _| Ok(Some(make_template("body", 1))));

        let engine = engine_with(repo);
        let first = engine.resolve("OrderConfirmed", Channel::Email).await.unwrap();
        let second = engine.resolve("OrderConfirmed", Channel::Email).await.unwrap();
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn test_resolve_unknown_template_fails() {
        let mut repo = MockTemplateRepository::new();
        repo.expect_get_active().returning(|_, _| Ok(None));

        let engine = engine_with(repo);
        let err = engine
            .resolve("Unknown", Channel::Sms)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::TemplateNotFound { .. }));
    }

    #[tokio::test]
    async fn test_publish_bumps_version_and_invalidates_cache() {
        let mut repo = MockTemplateRepository::new();
        repo.expect_get_active()
            .times(2)
            .returning(|_, _| Ok(Some(make_template("v1 body", 1))));
        repo.expect_latest_version().returning(|_, _| Ok(Some(1)));
        repo.expect_publish().times(1).returning(|template, events| {
            assert_eq!(template.version, 2);
            assert_eq!(events.len(), 1);
            Ok(())
        });

        let engine = engine_with(repo);

        // 预热缓存
        engine.resolve("OrderConfirmed", Channel::Email).await.unwrap();

        let published = engine
            .publish("OrderConfirmed", Channel::Email, None, "v2 body", HashMap::new())
            .await
            .unwrap();
        assert_eq!(published.version, 2);

        // 缓存已失效，resolve 再次访问仓储（times(2) 校验）
        engine.resolve("OrderConfirmed", Channel::Email).await.unwrap();
    }

    #[test]
    fn test_old_version_renders_identically_after_new_publish() {
        let engine = engine_with(MockTemplateRepository::new());
        let v1 = make_template("订单 {{orderNo}} 已确认", 1);
        let payload = serde_json::json!({"orderNo": "A-1"});

        let before = engine.render(&v1, &payload).unwrap();
        // 新版本发布只影响 Active 指针，v1 的内容不可变
        let v1_deprecated = v1.deprecated();
        let after = engine.render(&v1_deprecated, &payload).unwrap();

        assert_eq!(before, after);
    }
}
