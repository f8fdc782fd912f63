//! Consumer side of the gateway: a group session that hands every event of
//! the topic to an [`EventHandler`], at least once.

mod claim;
pub mod handler;
pub mod session;

pub use handler::{DedupHandler, EventHandler, LoggingHandler};
pub use session::{ConsumerGroupSession, SessionConfig, SessionState};
