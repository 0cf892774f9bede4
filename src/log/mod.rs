//! Persistent log: fixed-size entry records and the per-log facade.

pub(crate) mod entry;
mod persist_log;

pub use entry::{LogEntry, ENTRY_CAPACITY};
pub use persist_log::PersistLog;
