//! The polling driver: repeatedly scans the pending part of the queue in
//! `runorder` and steps each item, starting what capacity allows and
//! noticing what finished.

use chrono::DateTime;
use serde::Serialize;
use std::time::Duration;

use crate::error::QueueError;
use crate::queue::{JobStatus, QueueItem, QueueState, QueueStatus};
use crate::site::Site;

/// What one scan did to one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub queueid: i64,
    pub job: String,
    pub status: JobStatus,
    pub note: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Scheduled or working items left after the scan.
    pub nahead: i64,
    pub nrunning: i64,
    pub stepped: usize,
    pub reports: Vec<ScanReport>,
}

fn format_time(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

pub struct RunQueue<'a> {
    site: &'a Site,
    /// Items seen working in the last scan, re-stepped by [`RunQueue::check`].
    running: Vec<QueueItem>,
}

impl<'a> RunQueue<'a> {
    pub fn new(site: &'a Site) -> Self {
        Self {
            site,
            running: Vec::new(),
        }
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// One ordered scan over at most `scan_limit` pending rows.
    pub fn load(&mut self) -> Result<ScanSummary, QueueError> {
        let site = self.site;
        let rows = site.store.fetch_pending(site.config.scan_limit)?;
        let mut state = QueueState::new(rows.into_iter().map(QueueItem::from_row).collect());
        let mut qs = QueueStatus::default();
        let mut summary = ScanSummary::default();
        self.running.clear();

        while let Some(mut qi) = state.shift() {
            let before = qi.status();
            qi.step(site, &mut qs)?;
            summary.stepped += 1;
            if let Some(chain) = qi.take_released_chain() {
                state.bump_chain(site, chain)?;
            }
            let note = self.note(&qi, before, &qs);
            if let Some(note) = note {
                summary.reports.push(self.report(&qi, note));
            }
            if qi.status() == JobStatus::Working {
                self.running.push(qi);
            }
        }

        summary.nahead = qs.nahead;
        summary.nrunning = qs.nrunning;
        for r in &summary.reports {
            tracing::debug!(queueid = r.queueid, job = %r.job, note = %r.note, "scan");
        }
        Ok(summary)
    }

    /// Re-step the items the last scan left running and report the ones
    /// that finished.
    pub fn check(&mut self) -> Result<Vec<ScanReport>, QueueError> {
        let site = self.site;
        let mut reports = Vec::new();
        let mut still = Vec::with_capacity(self.running.len());
        for mut qi in std::mem::take(&mut self.running) {
            let mut qs = QueueStatus::default();
            qi.step(site, &mut qs)?;
            if qi.status() == JobStatus::Working {
                still.push(qi);
            } else {
                reports.push(self.report(&qi, "completed".to_string()));
            }
        }
        self.running = still;
        Ok(reports)
    }

    /// Scan until nothing is scheduled or working, sleeping between scans.
    pub async fn run_until_idle(&mut self) -> Result<Vec<ScanReport>, QueueError> {
        let poll = Duration::from_secs(self.site.config.poll_interval_secs);
        let mut reports = Vec::new();
        loop {
            let summary = self.load()?;
            reports.extend(summary.reports);
            if summary.nahead == 0 {
                return Ok(reports);
            }
            self.site.clock.sleep(poll).await;
        }
    }

    /// Long-running driver loop. Scan errors are logged and retried on the
    /// next poll; `once` stops after the first scan.
    pub async fn serve(&mut self, once: bool) -> Result<ScanSummary, QueueError> {
        let poll = Duration::from_secs(self.site.config.poll_interval_secs);
        loop {
            match self.load() {
                Ok(summary) if once => return Ok(summary),
                Ok(summary) => {
                    tracing::info!(
                        nahead = summary.nahead,
                        nrunning = summary.nrunning,
                        stepped = summary.stepped,
                        "queue scan"
                    );
                }
                Err(e) if once => return Err(e),
                Err(e) => tracing::warn!(error = %e, "queue scan failed"),
            }
            self.site.clock.sleep(poll).await;
        }
    }

    fn note(&self, qi: &QueueItem, before: JobStatus, qs: &QueueStatus) -> Option<String> {
        let now = self.site.now();
        let note = match qi.status() {
            JobStatus::Unscheduled => return None,
            JobStatus::Done | JobStatus::Evaluated => "completed".to_string(),
            JobStatus::Cancelled => match qi.last_error() {
                Some(err) => format!("removed: {err}"),
                None => "removed".to_string(),
            },
            JobStatus::Working if before == JobStatus::Scheduled => {
                format!("started at {}", format_time(qi.runat()))
            }
            JobStatus::Working => format!(
                "running since {} ({}s)",
                format_time(qi.runat()),
                now - qi.runat()
            ),
            JobStatus::Scheduled if !qs.has_capacity() => format!("waiting for {}", qs.nrunning),
            JobStatus::Scheduled => "delayed".to_string(),
        };
        Some(note)
    }

    fn report(&self, qi: &QueueItem, note: String) -> ScanReport {
        ScanReport {
            queueid: qi.queueid(),
            job: qi.describe(self.site),
            status: qi.status(),
            note,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_render_in_utc() {
        assert_eq!(format_time(0), "1970-01-01 00:00:00");
        assert_eq!(format_time(86_400 + 61), "1970-01-02 00:01:01");
    }
}
