pub mod event_log;

pub use event_log::{EventLog, DEFAULT_MAX_SIZE};
