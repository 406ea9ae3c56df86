//! SQLite-backed execution queue.
//!
//! Every status change goes through [`QueueStore::swap_status`], a
//! conditional `UPDATE ... WHERE queueid=? AND status=?`. Several driver
//! processes can poll the same database; a CAS that matches no row means
//! another process got there first and is not an error.

mod error;

pub use error::StoreError;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::ledger::{Ledger, RunKey, RunRecord};
use crate::queue::{JobFlags, JobStatus};
use crate::schema::RunSettings;

/// Offset that keeps unscheduled rows behind every scheduled one.
pub const UNSCHEDULED_RUNORDER_OFFSET: i64 = 1_000_000_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue (
    queueid INTEGER PRIMARY KEY AUTOINCREMENT,
    reqcid INTEGER NOT NULL DEFAULT 0,
    cid INTEGER NOT NULL,
    psetid INTEGER NOT NULL,
    repoid INTEGER NOT NULL DEFAULT 0,
    runnername TEXT NOT NULL,
    bhash TEXT,
    runsettings TEXT,
    tags TEXT,
    queueclass TEXT NOT NULL DEFAULT '',
    nconcurrent INTEGER NOT NULL DEFAULT 0,
    flags INTEGER NOT NULL DEFAULT 0,
    chain INTEGER,
    insertat INTEGER NOT NULL DEFAULT 0,
    updateat INTEGER NOT NULL DEFAULT 0,
    scheduleat INTEGER NOT NULL DEFAULT 0,
    runat INTEGER NOT NULL DEFAULT 0,
    runorder INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL,
    lockfile TEXT,
    lasterror TEXT,
    evaluation TEXT,
    evaluateat INTEGER
);
CREATE INDEX IF NOT EXISTS queue_runorder ON queue(status, runorder, queueid);
CREATE INDEX IF NOT EXISTS queue_chain ON queue(chain, status);
CREATE TABLE IF NOT EXISTS user_runorder (
    cid INTEGER PRIMARY KEY,
    last_runorder INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS chain_ids (
    chain INTEGER PRIMARY KEY,
    createdat INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS recorded_jobs (
    repoid INTEGER NOT NULL,
    psetid INTEGER NOT NULL,
    bhash TEXT NOT NULL,
    runner TEXT NOT NULL,
    runat INTEGER NOT NULL,
    queueid INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (repoid, psetid, bhash, runner, runat)
);
";

const COLUMNS: &str = "queueid, reqcid, cid, psetid, repoid, runnername, bhash, runsettings, tags, \
     queueclass, nconcurrent, flags, chain, insertat, updateat, scheduleat, runat, runorder, \
     status, lockfile, lasterror, evaluation, evaluateat";

/// One row of the `queue` table, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRow {
    pub queueid: i64,
    pub reqcid: i64,
    pub cid: i64,
    pub psetid: i64,
    pub repoid: i64,
    pub runnername: String,
    pub bhash: Option<String>,
    pub runsettings: Option<RunSettings>,
    pub tags: Option<Vec<String>>,
    pub queueclass: String,
    pub nconcurrent: i64,
    pub flags: JobFlags,
    pub chain: Option<i64>,
    pub insertat: i64,
    pub updateat: i64,
    pub scheduleat: i64,
    pub runat: i64,
    pub runorder: Option<i64>,
    pub status: JobStatus,
    pub lockfile: Option<String>,
    pub lasterror: Option<String>,
    /// Stored evaluation outcome, written once.
    pub evaluation: Option<String>,
    pub evaluateat: Option<i64>,
}

impl Default for QueueRow {
    fn default() -> Self {
        Self {
            queueid: 0,
            reqcid: 0,
            cid: 0,
            psetid: 0,
            repoid: 0,
            runnername: String::new(),
            bhash: None,
            runsettings: None,
            tags: None,
            queueclass: String::new(),
            nconcurrent: 0,
            flags: JobFlags::empty(),
            chain: None,
            insertat: 0,
            updateat: 0,
            scheduleat: 0,
            runat: 0,
            runorder: None,
            status: JobStatus::Unscheduled,
            lockfile: None,
            lasterror: None,
            evaluation: None,
            evaluateat: None,
        }
    }
}

/// The columns a status swap may change besides `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSwap<'a> {
    pub queueid: i64,
    pub expected: JobStatus,
    pub new: JobStatus,
    pub runat: i64,
    pub lockfile: Option<&'a str>,
    pub bhash: Option<&'a str>,
    /// Additionally require `updateat < max_updateat`.
    pub max_updateat: Option<i64>,
}

/// Authoritative scheduling fields, re-read after a lost race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFields {
    pub status: JobStatus,
    pub runat: i64,
    pub lockfile: Option<String>,
    pub bhash: Option<String>,
    pub runorder: i64,
    pub scheduleat: i64,
    pub updateat: i64,
    pub lasterror: Option<String>,
}

/// Tags are stored space-delimited with a leading and trailing space so a
/// `LIKE '% tag %'` match is exact.
pub fn encode_tags(tags: Option<&[String]>) -> Option<String> {
    match tags {
        Some(tags) if !tags.is_empty() => Some(format!(" {} ", tags.join(" "))),
        _ => None,
    }
}

pub fn decode_tags(text: Option<&str>) -> Option<Vec<String>> {
    let tags: Vec<String> = text?.split_whitespace().map(str::to_string).collect();
    if tags.is_empty() {
        None
    } else {
        Some(tags)
    }
}

fn decode_row(row: &Row<'_>) -> rusqlite::Result<QueueRow> {
    let status_value: i64 = row.get(18)?;
    let status = JobStatus::from_i64(status_value)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(18, status_value))?;
    let runsettings: Option<String> = row.get(7)?;
    let tags: Option<String> = row.get(8)?;
    let flags: i64 = row.get(11)?;
    let runorder: i64 = row.get(17)?;
    Ok(QueueRow {
        queueid: row.get(0)?,
        reqcid: row.get(1)?,
        cid: row.get(2)?,
        psetid: row.get(3)?,
        repoid: row.get(4)?,
        runnername: row.get(5)?,
        bhash: row.get::<_, Option<String>>(6)?.filter(|h| !h.is_empty()),
        runsettings: runsettings
            .as_deref()
            .and_then(RunSettings::from_json)
            .filter(|s| !s.is_empty()),
        tags: decode_tags(tags.as_deref()),
        queueclass: row.get(9)?,
        nconcurrent: row.get(10)?,
        flags: JobFlags::from_bits_truncate(u32::try_from(flags).unwrap_or(0)),
        chain: row.get(12)?,
        insertat: row.get(13)?,
        updateat: row.get(14)?,
        scheduleat: row.get(15)?,
        runat: row.get(16)?,
        runorder: Some(runorder),
        status,
        lockfile: row.get(19)?,
        lasterror: row.get(20)?,
        evaluation: row.get(21)?,
        evaluateat: row.get(22)?,
    })
}

#[derive(Debug)]
pub struct QueueStore {
    conn: Connection,
}

impl QueueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn immediate(&self) -> Result<Transaction<'_>, StoreError> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// Insert a new row; returns its `queueid`.
    pub fn insert(&self, row: &QueueRow) -> Result<i64, StoreError> {
        if row.queueid != 0 {
            return Err(StoreError::InvalidInput("row already has a queueid"));
        }
        let runorder = row.runorder.unwrap_or(row.insertat + UNSCHEDULED_RUNORDER_OFFSET);
        self.conn.execute(
            "INSERT INTO queue (reqcid, cid, psetid, repoid, runnername, bhash, runsettings, tags, \
             queueclass, nconcurrent, flags, chain, insertat, updateat, scheduleat, runat, runorder, \
             status, lockfile, lasterror, evaluation, evaluateat) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, \
             ?21, ?22)",
            params![
                row.reqcid,
                row.cid,
                row.psetid,
                row.repoid,
                row.runnername,
                row.bhash,
                row.runsettings
                    .as_ref()
                    .filter(|s| !s.is_empty())
                    .map(RunSettings::to_json),
                encode_tags(row.tags.as_deref()),
                row.queueclass,
                row.nconcurrent,
                i64::from(row.flags.bits()),
                row.chain,
                row.insertat,
                row.updateat,
                row.scheduleat,
                row.runat,
                runorder,
                row.status.as_i64(),
                row.lockfile,
                row.lasterror,
                row.evaluation,
                row.evaluateat,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn by_id(&self, queueid: i64) -> Result<Option<QueueRow>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM queue WHERE queueid=?1");
        Ok(self
            .conn
            .query_row(&sql, params![queueid], decode_row)
            .optional()?)
    }

    /// Rows that can still make progress, in admission order.
    pub fn fetch_pending(&self, limit: usize) -> Result<Vec<QueueRow>, StoreError> {
        let limit = i64::try_from(limit).map_err(|_| StoreError::InvalidInput("limit too large"))?;
        let sql = format!(
            "SELECT {COLUMNS} FROM queue WHERE status>=?1 AND status<?2 \
             ORDER BY runorder ASC, queueid ASC LIMIT ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                JobStatus::Unscheduled.as_i64(),
                JobStatus::Cancelled.as_i64(),
                limit
            ],
            decode_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Compare-and-swap on `status`. Returns whether this call won.
    pub fn swap_status(&self, swap: &StatusSwap<'_>) -> Result<bool, StoreError> {
        let changed = match swap.max_updateat {
            Some(max_updateat) => self.conn.execute(
                "UPDATE queue SET status=?1, runat=?2, lockfile=?3, bhash=?4 \
                 WHERE queueid=?5 AND status=?6 AND updateat<?7",
                params![
                    swap.new.as_i64(),
                    swap.runat,
                    swap.lockfile,
                    swap.bhash,
                    swap.queueid,
                    swap.expected.as_i64(),
                    max_updateat
                ],
            )?,
            None => self.conn.execute(
                "UPDATE queue SET status=?1, runat=?2, lockfile=?3, bhash=?4 \
                 WHERE queueid=?5 AND status=?6",
                params![
                    swap.new.as_i64(),
                    swap.runat,
                    swap.lockfile,
                    swap.bhash,
                    swap.queueid,
                    swap.expected.as_i64()
                ],
            )?,
        };
        Ok(changed > 0)
    }

    pub fn status_fields(&self, queueid: i64) -> Result<Option<StatusFields>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT status, runat, lockfile, bhash, runorder, scheduleat, updateat, lasterror \
                 FROM queue WHERE queueid=?1",
                params![queueid],
                |row| {
                    let status_value: i64 = row.get(0)?;
                    let status = JobStatus::from_i64(status_value)
                        .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, status_value))?;
                    Ok(StatusFields {
                        status,
                        runat: row.get(1)?,
                        lockfile: row.get(2)?,
                        bhash: row.get(3)?,
                        runorder: row.get(4)?,
                        scheduleat: row.get(5)?,
                        updateat: row.get(6)?,
                        lasterror: row.get(7)?,
                    })
                },
            )
            .optional()?)
    }

    /// Move an unscheduled row to scheduled. With a requesting user the new
    /// `runorder` never precedes that user's previously scheduled work, and
    /// the user's high-water mark advances. Returns whether this call won.
    pub fn schedule(
        &self,
        queueid: i64,
        priority: i64,
        userid: Option<i64>,
        now: i64,
    ) -> Result<bool, StoreError> {
        let tx = self.immediate()?;
        let changed = match userid.filter(|u| *u > 0) {
            Some(userid) => {
                let changed = tx.execute(
                    "UPDATE queue SET status=?1, scheduleat=?2, \
                     runorder=max(coalesce((SELECT last_runorder+1 FROM user_runorder WHERE cid=?3), 0), ?2)+?4 \
                     WHERE queueid=?5 AND status=?6",
                    params![
                        JobStatus::Scheduled.as_i64(),
                        now,
                        userid,
                        priority,
                        queueid,
                        JobStatus::Unscheduled.as_i64()
                    ],
                )?;
                if changed > 0 {
                    let runorder: i64 = tx.query_row(
                        "SELECT runorder FROM queue WHERE queueid=?1",
                        params![queueid],
                        |row| row.get(0),
                    )?;
                    tx.execute(
                        "INSERT INTO user_runorder (cid, last_runorder) VALUES (?1, ?2) \
                         ON CONFLICT(cid) DO UPDATE SET last_runorder=excluded.last_runorder \
                         WHERE last_runorder<excluded.last_runorder",
                        params![userid, runorder - priority],
                    )?;
                }
                changed
            }
            None => tx.execute(
                "UPDATE queue SET status=?1, scheduleat=?2, runorder=?3 \
                 WHERE queueid=?4 AND status=?5",
                params![
                    JobStatus::Scheduled.as_i64(),
                    now,
                    now + priority,
                    queueid,
                    JobStatus::Unscheduled.as_i64()
                ],
            )?,
        };
        tx.commit()?;
        Ok(changed > 0)
    }

    pub fn last_runorder(&self, cid: i64) -> Result<Option<i64>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT last_runorder FROM user_runorder WHERE cid=?1",
                params![cid],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Heartbeat from a client still interested in the job.
    pub fn touch(&self, queueid: i64, now: i64) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE queue SET updateat=?1 WHERE queueid=?2 AND updateat<?1",
            params![now, queueid],
        )?;
        Ok(changed > 0)
    }

    pub fn record_error(&self, queueid: i64, message: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE queue SET lasterror=?1 WHERE queueid=?2",
            params![message, queueid],
        )?;
        Ok(())
    }

    /// Store the evaluation of run `runat` unless one is already stored.
    /// Returns whether this call wrote it.
    pub fn record_evaluation(
        &self,
        queueid: i64,
        runat: i64,
        evaluation: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE queue SET evaluation=?1, evaluateat=?2 \
             WHERE queueid=?3 AND runat=?4 AND evaluateat IS NULL",
            params![evaluation, now, queueid, runat],
        )?;
        Ok(changed > 0)
    }

    /// The stored evaluation and the run it belongs to.
    pub fn evaluation(&self, queueid: i64) -> Result<Option<(i64, String)>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT runat, evaluation FROM queue \
                 WHERE queueid=?1 AND evaluateat IS NOT NULL AND evaluation IS NOT NULL",
                params![queueid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Reserve a chain id that no row uses and no other caller was handed.
    pub fn reserve_chain_id(&self, now: i64) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO chain_ids (chain, createdat) \
             SELECT max(coalesce((SELECT max(chain) FROM queue), 0), \
                        coalesce((SELECT max(chain) FROM chain_ids), 0)) + 1, ?1",
            params![now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// First member of `chain` that has not stopped.
    pub fn chain_head(&self, chain: i64) -> Result<Option<QueueRow>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM queue WHERE chain=?1 AND status<?2 \
             ORDER BY runorder ASC, queueid ASC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![chain, JobStatus::Cancelled.as_i64()], decode_row)
            .optional()?)
    }

    /// Release the next member of `chain` if none is scheduled or working.
    /// Returns the released `queueid`.
    pub fn step_chain(&self, chain: i64, now: i64) -> Result<Option<i64>, StoreError> {
        let tx = self.immediate()?;
        let next: Option<(i64, i64)> = tx
            .query_row(
                "SELECT queueid, status FROM queue \
                 WHERE chain=?1 AND status>=?2 AND status<?3 \
                 ORDER BY status>?2 DESC, runorder ASC, queueid ASC LIMIT 1",
                params![
                    chain,
                    JobStatus::Unscheduled.as_i64(),
                    JobStatus::Cancelled.as_i64()
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let released = match next {
            Some((queueid, status)) if status == JobStatus::Unscheduled.as_i64() => {
                let changed = tx.execute(
                    "UPDATE queue SET status=?1, scheduleat=?2, runorder=?2 \
                     WHERE queueid=?3 AND status=?4",
                    params![
                        JobStatus::Scheduled.as_i64(),
                        now,
                        queueid,
                        JobStatus::Unscheduled.as_i64()
                    ],
                )?;
                (changed > 0).then_some(queueid)
            }
            _ => None,
        };
        tx.commit()?;
        Ok(released)
    }

    pub fn counts_by_status(&self) -> Result<BTreeMap<JobStatus, i64>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM queue GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut out = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let status: i64 = row.get(0)?;
            if let Some(status) = JobStatus::from_i64(status) {
                out.insert(status, row.get(1)?);
            }
        }
        Ok(out)
    }

    /// Garbage-collect stopped rows last touched before `before`.
    pub fn clean_finished(&self, before: i64) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "DELETE FROM queue WHERE status>=?1 AND max(updateat, runat)<?2",
            params![JobStatus::Cancelled.as_i64(), before],
        )?)
    }
}

impl Ledger for QueueStore {
    fn put(&self, rec: RunRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO recorded_jobs (repoid, psetid, bhash, runner, runat, queueid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.key.repoid,
                rec.key.psetid,
                rec.key.bhash,
                rec.key.runner,
                rec.runat,
                rec.queueid
            ],
        )?;
        Ok(())
    }

    fn runs(&self, key: &RunKey) -> Result<Vec<i64>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT runat FROM recorded_jobs \
             WHERE repoid=?1 AND psetid=?2 AND bhash=?3 AND runner=?4 ORDER BY runat DESC",
        )?;
        let rows = stmt.query_map(
            params![key.repoid, key.psetid, key.bhash, key.runner],
            |row| row.get::<_, i64>(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
