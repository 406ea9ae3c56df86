use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{PsetConfig, Repository, SiteConfig, UserRecord};
use crate::ports::CatalogPort;

/// Catalog backed by the records listed in the site configuration.
#[derive(Debug, Default, Clone)]
pub struct ConfigCatalog {
    psets: BTreeMap<i64, Arc<PsetConfig>>,
    repos: BTreeMap<i64, Arc<Repository>>,
    users: BTreeMap<i64, Arc<UserRecord>>,
}

impl ConfigCatalog {
    pub fn from_config(config: &SiteConfig) -> Self {
        Self {
            psets: config.psets.iter().map(|p| (p.id, Arc::new(p.clone()))).collect(),
            repos: config.repos.iter().map(|r| (r.repoid, Arc::new(r.clone()))).collect(),
            users: config.users.iter().map(|u| (u.cid, Arc::new(u.clone()))).collect(),
        }
    }
}

impl CatalogPort for ConfigCatalog {
    fn pset(&self, psetid: i64) -> Option<Arc<PsetConfig>> {
        self.psets.get(&psetid).cloned()
    }

    fn repo(&self, repoid: i64) -> Option<Arc<Repository>> {
        self.repos.get(&repoid).cloned()
    }

    fn user(&self, cid: i64) -> Option<Arc<UserRecord>> {
        self.users.get(&cid).cloned()
    }
}
