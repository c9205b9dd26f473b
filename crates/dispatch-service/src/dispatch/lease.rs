//! 分发租约
//!
//! 每次网关调用前按 (请求, 渠道, 收件地址) 键获取时间受限的租约，
//! 阻止并发的重复调度与在途发送竞争；租约到期自动释放，持有方
//! 崩溃不会造成死锁。非持有方不等待，直接读取存量日志返回。

use std::time::Duration;

use async_trait::async_trait;
use notify_shared::cache::{Cache, CacheKey};
use notify_shared::events::Channel;
use tracing::{debug, warn};

use crate::error::Result;

/// 租约存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// 尝试获取租约，false 表示键已被其他持有方占用
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// 释放租约，仅持有方可释放；非持有方调用为空操作
    async fn release(&self, key: &str, owner: &str) -> Result<()>;
}

/// Redis 租约存储
///
/// SET NX PX 原子占键，值为持有方标识。释放时先比对持有方再删除，
/// 防止租约过期后误删他人新获取的租约。
pub struct RedisLeaseStore {
    cache: Cache,
}

impl RedisLeaseStore {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let acquired = self.cache.set_nx(key, &owner.to_string(), ttl).await?;
        if acquired {
            debug!(key = %key, owner = %owner, "租约已获取");
        } else {
            debug!(key = %key, "租约被占用");
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        // GET + DEL 非原子，极端情况下租约恰好在比对后过期时可能
        // 误删后继持有方，窗口以毫秒计且后继会重新获取，可接受
        match self.cache.get::<String>(key).await? {
            Some(current) if current == owner => {
                self.cache.delete(key).await?;
                debug!(key = %key, owner = %owner, "租约已释放");
            }
            Some(_) => {
                warn!(key = %key, owner = %owner, "租约已被他人持有，跳过释放");
            }
            None => {}
        }
        Ok(())
    }
}

/// 拼装分发租约键
pub fn lease_key(request_id: &str, channel: Channel, address: &str) -> String {
    CacheKey::dispatch_lease(request_id, &channel.to_string(), address)
}
