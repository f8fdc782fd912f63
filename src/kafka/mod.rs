pub mod consumer;
pub mod producer;
pub mod topic_manager;

pub use consumer::{GatewayContext, KafkaGroupMember};
pub use producer::KafkaProducer;
pub use topic_manager::TopicManager;
