pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod gateway;
pub mod http;
pub mod kafka;
pub mod producer;
pub mod serializer;
pub mod stats;

pub use config::Config;
pub use consumer::{ConsumerGroupSession, DedupHandler, EventHandler, LoggingHandler, SessionState};
pub use error::{Error, Result};
pub use event::{EventRecord, EventSubmission};
pub use gateway::{Backends, Gateway, HealthReport, ShutdownReport, SubmitReceipt};
pub use stats::{Stats, StatsSnapshot};
