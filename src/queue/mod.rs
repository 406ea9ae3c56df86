//! Queue items, their state machine, and admission control.

mod admission;
mod item;
mod response;
mod start;
mod status;

pub use admission::{QueueState, QueueStatus};
pub use item::{NewJob, QueueItem};
pub use status::{JobFlags, JobStatus};

/// Unwatched jobs with no heartbeat for this long are cancelled.
pub const ABANDON_AFTER_SECS: i64 = 180;
/// Incomplete runs older than this report `old` instead of `working`.
pub const OLD_AFTER_SECS: i64 = 600;
/// Stand-in cap for jobs whose queue class sets none.
pub const UNLIMITED_CONCURRENCY: i64 = 1_000_000;
