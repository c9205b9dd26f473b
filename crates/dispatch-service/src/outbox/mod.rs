//! Outbox 事件中继

pub mod relay;

pub use relay::{EventPublisher, KafkaEventPublisher, OutboxRelay};
