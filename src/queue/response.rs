//! Reading a job's output back, feeding it input, and noticing completion.

use std::time::Duration;

use super::item::SwapFields;
use super::{JobStatus, QueueItem, OLD_AFTER_SECS};
use crate::error::QueueError;
use crate::runlog::RunLogger;
use crate::schema::{ResponseStatus, RunResponse};
use crate::site::Site;

/// Sent to a live job's input to interrupt it.
pub const STOP_SEQUENCE: &[u8] = b"\x1b\x03";

const STOP_POLL: Duration = Duration::from_millis(10);
const STOP_POLL_TRIES: u32 = 10;

fn command_response(
    runlog: &RunLogger,
    runat: i64,
    offset: u64,
    write: Option<&[u8]>,
    stop: bool,
) -> RunResponse {
    let live = runlog.active_job() == Some(runat);
    let mut message = None;
    if live {
        if let Some(data) = write.filter(|d| !d.is_empty()) {
            if let Err(e) = runlog.job_write(runat, data) {
                tracing::warn!(runat, error = %e, "can't write job input");
                message = Some("Can't write to job".to_string());
            }
        }
        if stop {
            // best effort; the job may ignore the interrupt
            let _ = runlog.job_write(runat, STOP_SEQUENCE);
            for _ in 0..STOP_POLL_TRIES {
                if runlog.active_job() != Some(runat) {
                    break;
                }
                std::thread::sleep(STOP_POLL);
            }
        }
    }
    let mut rr = runlog.job_response(runat, offset);
    if rr.message.is_none() {
        rr.message = message;
    }
    rr
}

impl QueueItem {
    /// Output of this job's run from `offset`, optionally writing `write`
    /// to its input or interrupting it first. Observing completion moves the
    /// job to EVALUATED and attaches the evaluation result.
    pub fn full_response(
        &mut self,
        site: &Site,
        offset: u64,
        write: Option<&[u8]>,
        stop: bool,
    ) -> Result<RunResponse, QueueError> {
        let runat = self.row.runat;
        if runat == 0 {
            return Ok(RunResponse {
                ok: Some(true),
                repoid: self.row.repoid,
                runner: self.row.runnername.clone(),
                queueid: Some(self.row.queueid),
                done: Some(self.row.status.stopped()),
                message: (self.row.status == JobStatus::Cancelled)
                    .then(|| self.last_error().unwrap_or("Job cancelled").to_string()),
                ..Default::default()
            });
        }
        let (Some(repo), Some(pset), Some(runner)) =
            (self.repo(site), self.pset(site), self.runner(site))
        else {
            return Ok(RunResponse::failure("Bad queue item"));
        };

        let mut rr = if runner.has_command() {
            let runlog = site.run_logger(&repo, &pset);
            command_response(&runlog, runat, offset, write, stop)
        } else {
            RunResponse {
                ok: Some(true),
                done: Some(true),
                ..self.run_info(&pset, runat)
            }
        };
        if rr.ok != Some(true) {
            return Ok(rr);
        }
        rr.queueid = Some(self.row.queueid);

        let now = site.now();
        rr.status = Some(if rr.partial == Some(true) {
            ResponseStatus::Partial
        } else if rr.is_done() {
            ResponseStatus::Done
        } else if now - runat <= OLD_AFTER_SECS {
            ResponseStatus::Working
        } else {
            ResponseStatus::Old
        });

        if rr.is_done() && self.row.status < JobStatus::Cancelled {
            self.swap_status(site, JobStatus::Evaluated, SwapFields::default())?;
        }
        if rr.is_done() && runner.evaluate_function.is_some() && self.row.status >= JobStatus::Done {
            rr.result = self.evaluate(site)?;
        }
        Ok(rr)
    }
}
