//! Persisted grading queue: admission control over a SQLite job table,
//! jailed execution of instructor commands against student commits, and
//! streaming of the results.

pub mod adapters;
pub mod config;
pub mod driver;
pub mod error;
pub mod grader;
pub mod ledger;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod runlog;
pub mod sandbox;
pub mod schema;
pub mod site;
pub mod store;

pub use config::SiteConfig;
pub use driver::RunQueue;
pub use error::{QueueError, RunnerError};
pub use queue::{JobFlags, JobStatus, NewJob, QueueItem};
pub use site::Site;
