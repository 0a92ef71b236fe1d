pub mod assignment;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod protocol;
pub mod transport;

pub use config::{ConsumeMode, ConsumerConfig, ConsumerConfigBuilder, OffsetReset, SaslConfig};
pub use consumer::{ConsumedMessage, ConsumerHandle, KafkaConsumer, MessageSink};
pub use error::KafkaError;

pub type Result<T> = std::result::Result<T, KafkaError>;
