//! Persistent data model of the sync queue.

pub mod queue_item;
pub mod record_link;
pub mod report;

pub use queue_item::{NewQueueItem, QueueItem, QueueItemStatus, SyncOperation};
pub use record_link::{NewRecordLink, RecordLink};
pub use report::{BlockedCorrelation, QueueReport, StatusCounts};
