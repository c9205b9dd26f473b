//! 数据访问层
//!
//! 聚合以「索引列 + jsonb 快照」的方式落库：状态、版本、幂等键等
//! 查询字段提升为普通列，聚合全量内容存 data 列。写路径统一走
//! CAS（version 列比较交换），事件信封在同一事务中追加到 outbox。

pub mod delivery_log_repo;
pub mod outbox_repo;
pub mod preferences_repo;
pub mod request_repo;
pub mod template_repo;
pub mod traits;

pub use delivery_log_repo::PgDeliveryLogRepository;
pub use outbox_repo::PgOutboxRepository;
pub use preferences_repo::PgPreferencesRepository;
pub use request_repo::PgRequestRepository;
pub use template_repo::PgTemplateRepository;
pub use traits::{
    DeliveryLogRepository, OutboxRepository, OutboxRow, PreferencesRepository, RequestRepository,
    TemplateRepository,
};
