//! Dead-letter queue: durable parking, retry-in-place, poison promotion.

mod handler;
mod message;
mod store;

pub use handler::{policy_for_reason, DlqHandler, FnHandler, MessageHandler};
pub use message::{DlqConfig, DlqMessage, DlqReason, ErrorRecord, MessageStatus};
pub use store::{DlqError, DlqStats, DlqStore, QueueStats, POISON_PREFIX};
