use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a queue item. Discriminants are the values stored in the
/// `status` column and the ordering is meaningful: everything at or above
/// `Cancelled` has stopped making forward progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Unscheduled = -1,
    Scheduled = 0,
    Working = 1,
    Cancelled = 2,
    Done = 3,
    Evaluated = 4,
}

impl JobStatus {
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        Some(match value {
            -1 => Self::Unscheduled,
            0 => Self::Scheduled,
            1 => Self::Working,
            2 => Self::Cancelled,
            3 => Self::Done,
            4 => Self::Evaluated,
            _ => return None,
        })
    }

    /// Cancelled, done, or evaluated.
    pub fn stopped(self) -> bool {
        self >= Self::Cancelled
    }

    /// Scheduled or working: the item occupies a place in the admission scan.
    pub fn pending(self) -> bool {
        matches!(self, Self::Scheduled | Self::Working)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unscheduled => "unscheduled",
            Self::Scheduled => "scheduled",
            Self::Working => "working",
            Self::Cancelled => "cancelled",
            Self::Done => "done",
            Self::Evaluated => "evaluated",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitset stored in the `flags` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobFlags(u32);

impl JobFlags {
    /// No client keeps this job alive any more: once its `updateat`
    /// heartbeat is older than the abandonment window and it has not
    /// started, it is cancelled.
    pub const UNWATCHED: JobFlags = JobFlags(1);
    /// Reuse a compatible completed run instead of executing again.
    pub const ENSURE: JobFlags = JobFlags(2);
    pub const ANONYMOUS: JobFlags = JobFlags(4);

    pub const fn empty() -> Self {
        JobFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        JobFlags(bits & 7)
    }

    pub const fn contains(self, other: JobFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: JobFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: JobFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for JobFlags {
    type Output = JobFlags;

    fn bitor(self, rhs: JobFlags) -> JobFlags {
        JobFlags(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_column_values() {
        for status in [
            JobStatus::Unscheduled,
            JobStatus::Scheduled,
            JobStatus::Working,
            JobStatus::Cancelled,
            JobStatus::Done,
            JobStatus::Evaluated,
        ] {
            assert_eq!(JobStatus::from_i64(status.as_i64()), Some(status));
        }
        assert_eq!(JobStatus::from_i64(-2), None);
        assert_eq!(JobStatus::from_i64(5), None);
    }

    #[test]
    fn ordering_matches_lifecycle() {
        assert!(JobStatus::Unscheduled < JobStatus::Scheduled);
        assert!(JobStatus::Working < JobStatus::Cancelled);
        assert!(JobStatus::Done.stopped());
        assert!(!JobStatus::Working.stopped());
        assert!(JobStatus::Working.pending());
        assert!(!JobStatus::Unscheduled.pending());
    }

    #[test]
    fn flags_combine_and_truncate() {
        let mut flags = JobFlags::UNWATCHED | JobFlags::ENSURE;
        assert!(flags.contains(JobFlags::ENSURE));
        assert!(!flags.contains(JobFlags::ANONYMOUS));
        flags.remove(JobFlags::ENSURE);
        assert_eq!(flags, JobFlags::UNWATCHED);
        assert_eq!(JobFlags::from_bits_truncate(0xff).bits(), 7);
    }
}
