use anyhow::anyhow;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::OnceCell;
use std::sync::{Arc, OnceLock};

use super::start::StartOutcome;
use super::{JobFlags, JobStatus, QueueStatus, ABANDON_AFTER_SECS};
use crate::config::{PsetConfig, Repository, RunnerConfig, UserRecord};
use crate::error::{QueueError, RunnerError};
use crate::grader::EvaluationInput;
use crate::ledger::RunKey;
use crate::observability::JobContext;
use crate::runlog::active_job_at;
use crate::schema::{valid_tag, RunResponse, RunSettings};
use crate::site::Site;
use crate::store::{QueueRow, StatusSwap, StoreError, UNSCHEDULED_RUNORDER_OFFSET};

/// What to enqueue: a runner applied to one commit of one user's repo.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub reqcid: i64,
    pub cid: i64,
    pub psetid: i64,
    pub repoid: i64,
    pub runner: String,
    pub bhash: Option<String>,
    pub tags: Vec<String>,
    pub runsettings: Option<RunSettings>,
    pub flags: JobFlags,
    pub chain: Option<i64>,
    /// Overrides the queue class cap.
    pub nconcurrent: Option<i64>,
    pub runorder: Option<i64>,
}

/// Outcome of an evaluation as stored in the `evaluation` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Outcome {
    Result(Option<Value>),
    Error(String),
}

#[derive(Debug, Clone)]
struct Evaluation {
    runat: i64,
    outcome: Outcome,
}

/// Optional columns of a status swap; `None` keeps the current value.
#[derive(Debug, Default, Clone)]
pub(crate) struct SwapFields {
    pub runat: Option<i64>,
    pub lockfile: Option<Option<String>>,
    pub max_updateat: Option<i64>,
}

impl SwapFields {
    pub(crate) fn runat(runat: i64) -> Self {
        Self {
            runat: Some(runat),
            ..Default::default()
        }
    }
}

/// One job. Holds a copy of its row and lazily resolved, shared references
/// to the records the row names.
#[derive(Debug)]
pub struct QueueItem {
    pub(crate) row: QueueRow,
    pset: OnceCell<Option<Arc<PsetConfig>>>,
    repo: OnceCell<Option<Arc<Repository>>>,
    user: OnceCell<Option<Arc<UserRecord>>>,
    evaluation: Option<Evaluation>,
    last_error: Option<String>,
    released_chain: Option<i64>,
}

fn expand_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{[A-Z]+\}").expect("static regex"))
}

impl QueueItem {
    pub fn from_row(row: QueueRow) -> Self {
        Self {
            row,
            pset: OnceCell::new(),
            repo: OnceCell::new(),
            user: OnceCell::new(),
            evaluation: None,
            last_error: None,
            released_chain: None,
        }
    }

    /// Build an unpersisted job. The runner must exist in the pset.
    pub fn new_job(site: &Site, job: NewJob) -> Result<Self, QueueError> {
        let pset = site
            .catalog
            .pset(job.psetid)
            .ok_or(QueueError::UnknownPset(job.psetid))?;
        let runner = pset
            .runner(&job.runner)
            .ok_or_else(|| QueueError::UnknownRunner(job.runner.clone()))?;
        if let Some(tag) = job.tags.iter().find(|t| !valid_tag(t)) {
            return Err(QueueError::InvalidTag(tag.clone()));
        }
        let queueclass = runner.queue.clone().unwrap_or_default();
        let nconcurrent = job
            .nconcurrent
            .or_else(|| site.config.queue(&queueclass).nconcurrent)
            .unwrap_or(0);
        let row = QueueRow {
            reqcid: job.reqcid,
            cid: job.cid,
            psetid: job.psetid,
            repoid: job.repoid,
            runnername: runner.name.clone(),
            bhash: job.bhash.filter(|h| !h.is_empty()),
            runsettings: job.runsettings.filter(|s| !s.is_empty()),
            tags: (!job.tags.is_empty()).then_some(job.tags),
            queueclass,
            nconcurrent,
            flags: job.flags,
            chain: job.chain,
            runorder: job.runorder,
            status: JobStatus::Unscheduled,
            ..Default::default()
        };
        let qi = Self::from_row(row);
        let _ = qi.pset.set(Some(pset));
        Ok(qi)
    }

    pub fn by_id(site: &Site, queueid: i64) -> Result<Option<Self>, QueueError> {
        Ok(site.store.by_id(queueid)?.map(Self::from_row))
    }

    pub fn row(&self) -> &QueueRow {
        &self.row
    }

    pub fn queueid(&self) -> i64 {
        self.row.queueid
    }

    pub fn status(&self) -> JobStatus {
        self.row.status
    }

    pub fn runat(&self) -> i64 {
        self.row.runat
    }

    pub fn chain(&self) -> Option<i64> {
        self.row.chain
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref().or(self.row.lasterror.as_deref())
    }

    pub(crate) fn order_key(&self) -> (i64, i64) {
        (self.row.runorder.unwrap_or(0), self.row.queueid)
    }

    /// Chain whose next member this item's last transition released.
    pub fn take_released_chain(&mut self) -> Option<i64> {
        self.released_chain.take()
    }

    pub fn pset(&self, site: &Site) -> Option<Arc<PsetConfig>> {
        self.pset
            .get_or_init(|| site.catalog.pset(self.row.psetid))
            .clone()
    }

    pub fn repo(&self, site: &Site) -> Option<Arc<Repository>> {
        self.repo
            .get_or_init(|| site.catalog.repo(self.row.repoid))
            .clone()
    }

    pub fn user(&self, site: &Site) -> Option<Arc<UserRecord>> {
        self.user
            .get_or_init(|| site.catalog.user(self.row.cid))
            .clone()
    }

    pub fn runner(&self, site: &Site) -> Option<RunnerConfig> {
        self.pset(site)?.runner(&self.row.runnername).cloned()
    }

    pub fn hash(&self) -> Option<&str> {
        self.row.bhash.as_deref()
    }

    /// `~user/pset/hash/runner`, for reports.
    pub fn describe(&self, site: &Site) -> String {
        let user = self
            .user(site)
            .map(|u| u.display_name(self.row.flags.contains(JobFlags::ANONYMOUS)).to_string())
            .unwrap_or_else(|| self.row.cid.to_string());
        let pset = self
            .pset(site)
            .map(|p| p.urlkey.clone())
            .unwrap_or_else(|| self.row.psetid.to_string());
        format!(
            "~{user}/{pset}/{}/{}",
            self.hash().unwrap_or("-"),
            self.row.runnername
        )
    }

    pub fn abandoned(&self, now: i64) -> bool {
        matches!(self.row.status, JobStatus::Unscheduled | JobStatus::Scheduled)
            && self.row.flags.contains(JobFlags::UNWATCHED)
            && self.row.updateat < now - ABANDON_AFTER_SECS
    }

    /// Persist as a new unscheduled row.
    pub fn enqueue(&mut self, site: &Site) -> Result<(), QueueError> {
        if self.row.queueid != 0 {
            return Err(StoreError::InvalidInput("item is already enqueued").into());
        }
        let now = site.now();
        self.row.insertat = now;
        self.row.updateat = now;
        self.row.runat = 0;
        self.row.status = JobStatus::Unscheduled;
        let runorder = self.row.runorder.unwrap_or(now + UNSCHEDULED_RUNORDER_OFFSET);
        self.row.runorder = Some(runorder);
        self.row.queueid = site.store.insert(&self.row)?;
        tracing::debug!(queueid = self.row.queueid, runner = %self.row.runnername, "enqueued");
        Ok(())
    }

    /// Make an unscheduled item eligible to run. Chained items are released
    /// through the chain so that only one member is ever active.
    pub fn schedule(&mut self, site: &Site, priority: i64, userid: Option<i64>) -> Result<(), QueueError> {
        if self.row.queueid == 0 {
            self.enqueue(site)?;
        }
        if self.row.status != JobStatus::Unscheduled {
            return Ok(());
        }
        let now = site.now();
        match self.row.chain {
            Some(chain) => {
                site.store.step_chain(chain, now)?;
            }
            None => {
                site.store.schedule(self.row.queueid, priority, userid, now)?;
            }
        }
        if let Some(fields) = site.store.status_fields(self.row.queueid)? {
            self.row.status = fields.status;
            self.row.scheduleat = fields.scheduleat;
            self.row.runorder = Some(fields.runorder);
            self.row.runat = fields.runat;
        }
        Ok(())
    }

    /// Heartbeat from an interested client.
    pub fn touch(&mut self, site: &Site) -> Result<(), QueueError> {
        let now = site.now();
        if site.store.touch(self.row.queueid, now)? {
            self.row.updateat = now;
        }
        Ok(())
    }

    pub fn cancel(&mut self, site: &Site) -> Result<bool, QueueError> {
        if self.row.status.stopped() {
            return Ok(false);
        }
        self.swap_status(site, JobStatus::Cancelled, SwapFields::default())
    }

    fn refresh(&mut self, site: &Site) -> Result<(), StoreError> {
        if let Some(fields) = site.store.status_fields(self.row.queueid)? {
            self.row.status = fields.status;
            self.row.runat = fields.runat;
            self.row.lockfile = fields.lockfile;
            self.row.bhash = fields.bhash.filter(|h| !h.is_empty());
            self.row.runorder = Some(fields.runorder);
            self.row.updateat = fields.updateat;
        }
        Ok(())
    }

    /// Compare-and-swap only. Returns whether this call won; a loss
    /// refreshes the item from the store.
    pub(crate) fn cas(&mut self, site: &Site, new: JobStatus, fields: &SwapFields) -> Result<bool, StoreError> {
        let runat = fields.runat.unwrap_or(self.row.runat);
        let lockfile = match &fields.lockfile {
            Some(lockfile) => lockfile.clone(),
            None => self.row.lockfile.clone(),
        };
        if self.row.queueid == 0 {
            let changed = self.row.status != new;
            if changed {
                self.row.status = new;
                self.row.runat = runat;
                self.row.lockfile = lockfile;
            }
            return Ok(changed);
        }
        let swap = StatusSwap {
            queueid: self.row.queueid,
            expected: self.row.status,
            new,
            runat,
            lockfile: lockfile.as_deref(),
            bhash: self.row.bhash.as_deref(),
            max_updateat: fields.max_updateat,
        };
        if site.store.swap_status(&swap)? {
            tracing::debug!(queueid = self.row.queueid, from = %self.row.status, to = %new, "status changed");
            self.row.status = new;
            self.row.runat = runat;
            self.row.lockfile = lockfile;
            Ok(true)
        } else {
            tracing::trace!(queueid = self.row.queueid, to = %new, "lost status race");
            self.refresh(site)?;
            Ok(false)
        }
    }

    /// The only way status changes. Reaching DONE or EVALUATED from below
    /// runs the evaluation (at most once); stopping a chained item releases
    /// the next chain member.
    pub(crate) fn swap_status(&mut self, site: &Site, new: JobStatus, fields: SwapFields) -> Result<bool, QueueError> {
        let old = self.row.status;
        let changed = self.cas(site, new, &fields)?;
        if changed && self.row.status.stopped() && self.row.queueid != 0 {
            if let Some(chain) = self.row.chain {
                if let Some(next) = site.store.step_chain(chain, site.now())? {
                    tracing::debug!(chain, queueid = next, "chain member released");
                    self.released_chain = Some(chain);
                }
            }
        }
        if changed && old < JobStatus::Evaluated && self.row.status >= JobStatus::Done {
            // the cached failure is reported by later `evaluate` calls
            if let Err(err) = self.evaluate(site) {
                tracing::warn!(queueid = self.row.queueid, error = %err, "evaluation failed");
            }
        }
        Ok(changed)
    }

    /// Run the runner's evaluation function once per job and store the
    /// outcome on the row; moves DONE to EVALUATED.
    pub fn evaluate(&mut self, site: &Site) -> Result<Option<Value>, QueueError> {
        if self.evaluation.is_none() {
            self.evaluation = Some(self.load_or_run_evaluation(site)?);
        }
        if self.row.status == JobStatus::Done {
            self.swap_status(site, JobStatus::Evaluated, SwapFields::default())?;
        }
        match self.evaluation.as_ref().map(|e| &e.outcome) {
            Some(Outcome::Result(value)) => Ok(value.clone()),
            Some(Outcome::Error(message)) => Err(QueueError::Evaluation(anyhow!("{message}"))),
            None => Ok(None),
        }
    }

    fn stored_evaluation(&self, site: &Site) -> Result<Option<Evaluation>, StoreError> {
        if self.row.queueid == 0 {
            return Ok(None);
        }
        let stored = match (&self.row.evaluation, self.row.evaluateat) {
            (Some(text), Some(_)) => Some((self.row.runat, text.clone())),
            _ => site.store.evaluation(self.row.queueid)?,
        };
        match stored {
            Some((runat, text)) if runat == self.row.runat => Ok(Some(Evaluation {
                runat,
                outcome: serde_json::from_str(&text)?,
            })),
            _ => Ok(None),
        }
    }

    fn load_or_run_evaluation(&mut self, site: &Site) -> Result<Evaluation, QueueError> {
        if let Some(stored) = self.stored_evaluation(site)? {
            return Ok(stored);
        }
        // failures are stored too and never retried
        let outcome = match self.invoke_evaluation(site) {
            Ok(value) => Outcome::Result(value),
            Err(message) => Outcome::Error(message),
        };
        let evaluation = Evaluation {
            runat: self.row.runat,
            outcome,
        };
        if self.row.queueid != 0 {
            let text = serde_json::to_string(&evaluation.outcome).map_err(StoreError::from)?;
            let now = site.now();
            if site
                .store
                .record_evaluation(self.row.queueid, self.row.runat, &text, now)?
            {
                self.row.evaluation = Some(text);
                self.row.evaluateat = Some(now);
            } else if let Some(stored) = self.stored_evaluation(site)? {
                // another process stored its outcome first
                return Ok(stored);
            }
        }
        Ok(evaluation)
    }

    /// Run id the cached evaluation belongs to.
    pub fn evaluated_at(&self) -> Option<i64> {
        self.evaluation.as_ref().map(|e| e.runat)
    }

    fn invoke_evaluation(&self, site: &Site) -> Result<Option<Value>, String> {
        let Some(runner) = self.runner(site) else {
            return Ok(None);
        };
        let Some(name) = runner.evaluate_function.as_deref() else {
            return Ok(None);
        };
        let evaluator = site
            .evaluators
            .get(name)
            .ok_or_else(|| format!("unknown evaluation function {name:?}"))?;
        let output = match (runner.has_command(), self.repo(site), self.pset(site)) {
            (true, Some(repo), Some(pset)) => site
                .run_logger(&repo, &pset)
                .job_response(self.row.runat, 0)
                .data
                .unwrap_or_default(),
            _ => String::new(),
        };
        let input = EvaluationInput {
            queueid: self.row.queueid,
            runner: runner.name.clone(),
            runat: self.row.runat,
            output,
        };
        evaluator
            .evaluate(&input)
            .map(Some)
            .map_err(|e| format!("{e:#}"))
    }

    /// Tags a reused run must carry: the item's own plus the runner's.
    fn required_tags(&self, runner: &RunnerConfig) -> Vec<String> {
        let mut tags = self.row.tags.clone().unwrap_or_default();
        for tag in &runner.ensure {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }

    fn is_compatible(&self, runner: &RunnerConfig, rr: &RunResponse) -> bool {
        if !self.required_tags(runner).iter().all(|t| rr.has_tag(t)) {
            return false;
        }
        let mine = self.row.runsettings.as_ref().filter(|s| !s.is_empty());
        mine == rr.custom_settings()
    }

    /// Newest completed run of the same runner on the same commit that
    /// carries every required tag and identical settings.
    pub fn compatible_response(&self, site: &Site) -> Result<Option<RunResponse>, QueueError> {
        let (Some(runner), Some(repo), Some(pset), Some(hash)) =
            (self.runner(site), self.repo(site), self.pset(site), self.hash())
        else {
            return Ok(None);
        };
        let runlog = site.run_logger(&repo, &pset);
        let key = RunKey {
            repoid: repo.repoid,
            psetid: pset.id,
            bhash: hash.to_string(),
            runner: runner.name.clone(),
        };
        let active = runlog.active_job();
        for runat in site.ledger().runs(&key)? {
            if active == Some(runat) {
                continue;
            }
            let Some(rr) = runlog.job_info(runat) else {
                continue;
            };
            let same_commit = rr.hash.as_deref().is_none_or(|h| h == hash);
            if rr.runner == runner.name && same_commit && self.is_compatible(&runner, &rr) {
                return Ok(Some(RunResponse { timestamp: runat, ..rr }));
            }
        }
        Ok(None)
    }

    /// Substitute `${NAME}` variables in run configuration strings.
    pub fn expand(&self, site: &Site, text: &str) -> String {
        if !text.contains("${") {
            return text.to_string();
        }
        expand_re()
            .replace_all(text, |caps: &Captures<'_>| {
                let var = &caps[0];
                match var {
                    "${REPOGID}" => match self.repo(site) {
                        Some(repo) => repo
                            .repogid
                            .clone()
                            .filter(|g| !g.is_empty())
                            .unwrap_or_else(|| self.row.repoid.to_string()),
                        None => var.to_string(),
                    },
                    "${PSET}" => self.row.psetid.to_string(),
                    "${REPOID}" => self.row.repoid.to_string(),
                    "${HOSTTYPE}" => site.config.host_type.clone(),
                    "${COMMIT}" | "${HASH}" => self.hash().unwrap_or(var).to_string(),
                    "${CONFDIR}" => "conf/".to_string(),
                    "${SRCDIR}" => "src/".to_string(),
                    _ => var.to_string(),
                }
            })
            .into_owned()
    }

    /// Advance this item by one scan position. Returns `false` when a start
    /// attempt failed and the item was cancelled.
    pub fn step(&mut self, site: &Site, qs: &mut QueueStatus) -> Result<bool, QueueError> {
        if self.row.status.stopped() {
            return Ok(true);
        }
        debug_assert_eq!(self.row.runat > 0, self.row.status >= JobStatus::Working);
        let now = site.now();

        if self.abandoned(now)
            && self.swap_status(
                site,
                JobStatus::Cancelled,
                SwapFields {
                    max_updateat: Some(now - ABANDON_AFTER_SECS),
                    ..Default::default()
                },
            )?
        {
            tracing::info!(queueid = self.row.queueid, "abandoned job cancelled");
            return Ok(true);
        }

        if self.row.status == JobStatus::Unscheduled {
            return Ok(true);
        }

        if self.row.status == JobStatus::Scheduled && self.row.flags.contains(JobFlags::ENSURE) {
            if let Some(rr) = self.compatible_response(site)? {
                tracing::debug!(queueid = self.row.queueid, runat = rr.timestamp, "reusing completed run");
                self.swap_status(site, JobStatus::Done, SwapFields::runat(rr.timestamp))?;
                if self.row.status.stopped() {
                    return Ok(true);
                }
            }
        }

        let nc = self.row.nconcurrent;
        if self.row.status == JobStatus::Scheduled && qs.admits(nc) {
            let ctx = JobContext::new(self.row.queueid, &self.row.runnername);
            let _span = ctx.span().entered();
            match self.start_command(site) {
                Ok(StartOutcome::NoCommand) => {
                    self.swap_status(site, JobStatus::Evaluated, SwapFields::runat(now))?;
                }
                Ok(StartOutcome::Started) => ctx.record_started(self.row.runat),
                Ok(StartOutcome::Busy | StartOutcome::LostRace) => {}
                Err(err) => {
                    self.fail(site, &ctx, err)?;
                    return Ok(false);
                }
            }
        }

        if self.row.status == JobStatus::Working {
            if let Some(lockfile) = self.row.lockfile.as_deref() {
                if active_job_at(std::path::Path::new(lockfile)) != Some(self.row.runat) {
                    let runat = self.row.runat;
                    self.swap_status(site, JobStatus::Evaluated, SwapFields::default())?;
                    JobContext::new(self.row.queueid, &self.row.runnername)
                        .record_completion(self.row.status, now - runat);
                }
            }
        }

        if self.row.status.pending() {
            qs.account(nc, self.row.runat > 0);
        }
        Ok(true)
    }

    fn fail(&mut self, site: &Site, ctx: &JobContext, err: RunnerError) -> Result<(), QueueError> {
        let message = err.to_string();
        ctx.record_failure(&message);
        if self.swap_status(site, JobStatus::Cancelled, SwapFields::default())? {
            if self.row.queueid != 0 {
                site.store.record_error(self.row.queueid, &message)?;
            }
            self.row.lasterror = Some(message.clone());
            self.last_error = Some(message);
        }
        Ok(())
    }
}
