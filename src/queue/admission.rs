use std::collections::VecDeque;

use super::{QueueItem, UNLIMITED_CONCURRENCY};
use crate::error::QueueError;
use crate::site::Site;

/// Running totals of one ordered admission scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// Items with a start time seen so far.
    pub nrunning: i64,
    /// Effective cap, tightened by each capped item the scan passes.
    pub nconcurrent: i64,
    /// Scheduled or working items seen so far.
    pub nahead: i64,
}

impl Default for QueueStatus {
    fn default() -> Self {
        Self {
            nrunning: 0,
            nconcurrent: 100_000,
            nahead: 0,
        }
    }
}

impl QueueStatus {
    pub fn has_capacity(&self) -> bool {
        self.nrunning < self.nconcurrent
    }

    /// Whether an item with cap `nc` (0 for none) may start now.
    pub fn admits(&self, nc: i64) -> bool {
        let ncx = if nc <= 0 { UNLIMITED_CONCURRENCY } else { nc };
        self.nrunning < ncx.min(self.nconcurrent)
    }

    /// Count a scheduled or working item the scan has passed. A capped item
    /// tightens the cap for everything behind it, never below what is
    /// already running.
    pub fn account(&mut self, nc: i64, running: bool) {
        self.nahead += 1;
        if running {
            self.nrunning += 1;
        }
        if nc > 0 {
            self.nconcurrent = nc.min(self.nconcurrent).max(self.nrunning);
        }
    }
}

/// Items still to be visited by a scan, in `(runorder, queueid)` order.
#[derive(Debug, Default)]
pub struct QueueState {
    items: VecDeque<QueueItem>,
}

impl QueueState {
    pub fn new(items: Vec<QueueItem>) -> Self {
        Self {
            items: items.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn shift(&mut self) -> Option<QueueItem> {
        self.items.pop_front()
    }

    /// A chain member was just released; visit it in this scan at its
    /// place in the order, replacing any stale unscheduled copy.
    pub fn bump_chain(&mut self, site: &Site, chain: i64) -> Result<(), QueueError> {
        let Some(row) = site.store.chain_head(chain)? else {
            return Ok(());
        };
        self.items.retain(|qi| qi.queueid() != row.queueid);
        let key = (row.runorder.unwrap_or(0), row.queueid);
        let pos = self
            .items
            .iter()
            .position(|qi| qi.order_key() > key)
            .unwrap_or(self.items.len());
        self.items.insert(pos, QueueItem::from_row(row));
        Ok(())
    }
}
