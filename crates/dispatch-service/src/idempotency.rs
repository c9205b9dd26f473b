//! 幂等预留存储
//!
//! 请求创建前先按 dedup_key 做原子预留：预留成功才真正落库，
//! 预留失败说明同键请求已经（或正在）创建，返回存量引用。
//! Redis 预留只是快路径，数据库 dedup_key 唯一约束兜底——
//! 预留 TTL 过期后重放的命令仍会被唯一约束拦下。

use std::time::Duration;

use async_trait::async_trait;
use notify_shared::cache::{Cache, CacheKey};

use crate::error::Result;

/// 预留结果
#[derive(Debug, Clone)]
pub struct Reservation {
    pub acquired: bool,
    /// 键已被占用时，占用方登记的请求 id
    pub existing_ref: Option<String>,
}

/// 幂等预留接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// 原子预留 key 并登记 reference，TTL 到期自动释放
    async fn reserve(&self, key: &str, reference: &str, ttl: Duration) -> Result<Reservation>;
}

/// Redis 幂等预留存储
///
/// SET NX PX 保证预留的原子性，值为持有方的请求 id。
pub struct RedisIdempotencyStore {
    cache: Cache,
}

impl RedisIdempotencyStore {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn reserve(&self, key: &str, reference: &str, ttl: Duration) -> Result<Reservation> {
        let redis_key = CacheKey::request_dedup(key);
        let acquired = self
            .cache
            .set_nx(&redis_key, &reference.to_string(), ttl)
            .await?;

        if acquired {
            return Ok(Reservation {
                acquired: true,
                existing_ref: None,
            });
        }

        // 已被占用，读出占用方；TTL 刚好过期时可能读到空
        let existing_ref: Option<String> = self.cache.get(&redis_key).await?;
        Ok(Reservation {
            acquired: false,
            existing_ref,
        })
    }
}
