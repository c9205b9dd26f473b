//! 请求生命周期管理

pub mod manager;

pub use manager::RequestLifecycleManager;
