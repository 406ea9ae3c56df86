//! Per-commit record of which runs exist, so later lookups (de-dup, the
//! run history shown next to a commit) can find completed runs without
//! scanning log directories.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::store::StoreError;

/// Identifies the run history of one runner on one commit of one pset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunKey {
    pub repoid: i64,
    pub psetid: i64,
    pub bhash: String,
    pub runner: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub key: RunKey,
    pub runat: i64,
    pub queueid: i64,
}

pub trait Ledger {
    fn put(&self, rec: RunRecord) -> Result<(), StoreError>;
    /// Run ids (`runat`) recorded under `key`, newest first.
    fn runs(&self, key: &RunKey) -> Result<Vec<i64>, StoreError>;
}

#[derive(Default, Debug)]
pub struct InMemoryLedger {
    inner: Mutex<BTreeMap<RunKey, Vec<RunRecord>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for InMemoryLedger {
    fn put(&self, rec: RunRecord) -> Result<(), StoreError> {
        let mut g = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let runs = g.entry(rec.key.clone()).or_default();
        runs.retain(|r| r.runat != rec.runat);
        runs.push(rec);
        Ok(())
    }

    fn runs(&self, key: &RunKey) -> Result<Vec<i64>, StoreError> {
        let g = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<i64> = g
            .get(key)
            .map(|runs| runs.iter().map(|r| r.runat).collect())
            .unwrap_or_default();
        out.sort_unstable_by(|a, b| b.cmp(a));
        Ok(out)
    }
}
