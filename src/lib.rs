// src/lib.rs
// Resilient RabbitMQ client for task events: a listener that settles every
// delivery exactly once and a producer that survives broker restarts.

pub mod config;
pub mod env;
pub mod events;
pub mod message;
pub mod rabbitmq;
pub mod testing;

pub use config::Settings;
pub use events::TaskEventPublisher;
pub use rabbitmq::{ConsumerLoop, Publisher, RabbitMQError};
