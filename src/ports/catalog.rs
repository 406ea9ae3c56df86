use std::sync::Arc;

use crate::config::{PsetConfig, Repository, UserRecord};

/// Lookup of the externally owned records a queue item refers to. Results
/// are shared, never copied into the item.
pub trait CatalogPort: Send + Sync {
    fn pset(&self, psetid: i64) -> Option<Arc<PsetConfig>>;
    fn repo(&self, repoid: i64) -> Option<Arc<Repository>>;
    fn user(&self, cid: i64) -> Option<Arc<UserRecord>>;
}
