//! 分发层
//!
//! 网关抽象、分发租约与重试编排器。

pub mod gateway;
pub mod lease;
pub mod orchestrator;

pub use gateway::{ChannelGateway, GatewayError, ProviderReceipt};
pub use lease::{LeaseStore, RedisLeaseStore};
pub use orchestrator::DispatchOrchestrator;
