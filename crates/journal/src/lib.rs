//! The per-folder metadata journal: a durable ordered log of signed
//! revisions owned by one device, with one-at-a-time flushing to the
//! metadata server and fork conversion on conflict.

mod backoff;
mod flusher;
mod journal;
mod log;
mod metrics;
mod sqlite_log;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::Backoff;
pub use flusher::flush_all;
pub use journal::{
    JournalConflictError,
    MdServerConnection,
    MetadataJournal,
};
pub use log::LogPersistence;
pub use sqlite_log::SqliteLogPersistence;
#[cfg(any(test, feature = "testing"))]
pub use testing::TestLogPersistence;
