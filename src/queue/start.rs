//! Provisioning a jail and launching a job's command.

use std::fs;
use std::path::{Path, PathBuf};

use super::item::SwapFields;
use super::{JobStatus, QueueItem};
use crate::config::{valid_username, PsetConfig, Repository, RunnerConfig};
use crate::error::RunnerError;
use crate::ledger::{RunKey, RunRecord};
use crate::runlog::make_fifo;
use crate::sandbox::checkout::{checkout_code, CheckoutPlan};
use crate::sandbox::jail::{remove_old_jails, RunSpec};
use crate::sandbox::overlay::apply_overlay;
use crate::sandbox::{CommandLog, Invocation};
use crate::schema::RunResponse;
use crate::site::Site;

/// Home directory assumed when the run-as user is unknown to this host.
pub const DEFAULT_JAIL_HOME: &str = "/home/jail61";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartOutcome {
    /// The runner only evaluates; nothing was provisioned.
    NoCommand,
    /// Another run owns this target's pid file.
    Busy,
    /// Another driver moved the item first.
    LostRace,
    Started,
}

/// Removes the pid file and input FIFO unless provisioning reached the
/// launch of the command.
struct RunGuard {
    pidfile: PathBuf,
    fifo: Option<PathBuf>,
    armed: bool,
}

impl RunGuard {
    fn new(pidfile: PathBuf) -> Self {
        Self {
            pidfile,
            fifo: None,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.pidfile);
            if let Some(fifo) = &self.fifo {
                let _ = fs::remove_file(fifo);
            }
        }
    }
}

fn trim_trailing_slashes(s: &str) -> &str {
    s.trim_end_matches('/')
}

#[cfg(unix)]
fn user_home(username: &str) -> String {
    nix::unistd::User::from_name(username)
        .ok()
        .flatten()
        .map(|u| u.dir.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_JAIL_HOME.to_string())
}

#[cfg(not(unix))]
fn user_home(_username: &str) -> String {
    DEFAULT_JAIL_HOME.to_string()
}

#[cfg(unix)]
fn host_name() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn host_name() -> Option<String> {
    None
}

fn site_path(site: &Site, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        site.config.root.join(path)
    }
}

impl QueueItem {
    /// Header written as the first line of the run log.
    pub(crate) fn run_info(&self, pset: &PsetConfig, runat: i64) -> RunResponse {
        RunResponse {
            repoid: self.row.repoid,
            pset: pset.urlkey.clone(),
            hash: self.row.bhash.clone(),
            runner: self.row.runnername.clone(),
            settings: self.row.runsettings.clone(),
            tags: self.row.tags.clone(),
            timestamp: runat,
            queueid: (self.row.queueid != 0).then_some(self.row.queueid),
            host: host_name(),
            ..Default::default()
        }
    }

    /// Resolve an unset commit to the head of the bare repository.
    fn resolve_hash(&mut self, site: &Site, repodir: &Path) -> Result<String, RunnerError> {
        if let Some(hash) = self.row.bhash.clone() {
            return Ok(hash);
        }
        let inv = Invocation::new("git")
            .args(["rev-parse", "--verify", "HEAD^{commit}"])
            .current_dir(repodir);
        let out = site
            .executor
            .exec(&inv)
            .map_err(|e| RunnerError::env(format!("{e:#}")))?;
        let hash = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if out.code != 0 || hash.is_empty() {
            return Err(RunnerError::env("No commit to check out"));
        }
        self.row.bhash = Some(hash.clone());
        Ok(hash)
    }

    pub(crate) fn start_command(&mut self, site: &Site) -> Result<StartOutcome, RunnerError> {
        debug_assert!(self.row.runat == 0 && self.row.status == JobStatus::Scheduled);
        let repo = self
            .repo(site)
            .ok_or_else(|| RunnerError::config("No repository"))?;
        let pset = self
            .pset(site)
            .ok_or_else(|| RunnerError::config("Bad queue item pset"))?;
        let runner = pset
            .runner(&self.row.runnername)
            .cloned()
            .ok_or_else(|| RunnerError::config("Bad queue item runner"))?;
        if !runner.has_command() {
            return Ok(StartOutcome::NoCommand);
        }

        let helper = site.jail_helper();
        helper.check()?;
        let runlog = site.run_logger(&repo, &pset);
        runlog
            .ensure_log_dir()
            .map_err(|_| RunnerError::env("Can't create log directory"))?;
        if runlog.active_job().is_some() {
            return Ok(StartOutcome::Busy);
        }

        let username = pset.run_username_for(&runner);
        if !valid_username(&username) {
            return Err(RunnerError::config("Bad run_username"));
        }
        let userhome = trim_trailing_slashes(&user_home(&username)).to_string();
        let jaildir = trim_trailing_slashes(&self.expand(site, &pset.run_dirpattern)).to_string();
        if jaildir.is_empty() {
            return Err(RunnerError::config("Bad run_dirpattern"));
        }
        let jaildir = PathBuf::from(jaildir);
        let jailhome = jaildir.join(userhome.trim_start_matches('/'));

        let runat = site.now();
        let pidfile = runlog.pid_file();
        fs::write(&pidfile, format!("{runat}\n"))
            .map_err(|_| RunnerError::env("Can't create pidfile"))?;
        let mut guard = RunGuard::new(pidfile.clone());
        let fifo = runlog.input_fifo(runat);
        let input_fifo = make_fifo(&fifo).ok().map(|()| fifo);
        guard.fifo = input_fifo.clone();
        let timing_file = if runner.timed_replay {
            let path = runlog.timing_file(runat);
            fs::File::create(&path).ok().map(|_| path)
        } else {
            None
        };
        let mut log = runlog
            .open_log(runat)
            .map_err(|_| RunnerError::env("Can't create log file"))?;
        let repodir = repo.repodir(&site.config.repo_root());
        let hash = self.resolve_hash(site, &repodir)?;

        let lockfile = pidfile.to_string_lossy().into_owned();
        let fields = SwapFields {
            runat: Some(runat),
            lockfile: Some(Some(lockfile)),
            max_updateat: None,
        };
        if !self.cas(site, JobStatus::Working, &fields)? {
            // the pid file may already belong to the winner
            guard.disarm();
            return Ok(StartOutcome::LostRace);
        }

        log.write_header(&self.run_info(&pset, runat))?;
        let mut cl = CommandLog::new(site.executor.as_ref(), &mut log);

        remove_old_jails(&mut cl, &helper, &jaildir, runat)?;
        if cl.run(&helper.add(&jaildir, &username))? != 0 {
            return Err(RunnerError::env("Can't initialize jail"));
        }

        let subdir = repo.truncated.then(|| pset.directory_noslash());
        let plan = CheckoutPlan::new(&repodir, &jailhome, subdir, &hash, runat);
        checkout_code(&mut cl, &plan)?;
        if !runner.overlay.is_empty() {
            apply_overlay(&mut cl, &plan.checkoutdir, &runner.overlay, &site.config.root)?;
        }

        let settings = self.row.runsettings.clone().unwrap_or_default();
        site.export_policy.write_files(&jailhome, &settings)?;

        let inv = self.run_invocation(site, &pset, &runner, &RunPaths {
            pidfile: &pidfile,
            runat,
            input_fifo: input_fifo.as_deref(),
            timing_file: timing_file.as_deref(),
            jaildir: &jaildir,
            jailhome: &jailhome,
            userhome: &userhome,
            username: &username,
        })?;
        guard.disarm();
        cl.run(&inv)?;

        site.ledger().put(RunRecord {
            key: run_key(&repo, &pset, &hash, &runner),
            runat,
            queueid: self.row.queueid,
        })?;
        Ok(StartOutcome::Started)
    }

    fn run_invocation(
        &self,
        site: &Site,
        pset: &PsetConfig,
        runner: &RunnerConfig,
        paths: &RunPaths<'_>,
    ) -> Result<Invocation, RunnerError> {
        let skeleton = pset
            .run_skeletondir
            .as_deref()
            .or(site.config.run_skeletondir.as_deref())
            .map(|p| site_path(site, p));
        let binddir = pset
            .run_binddir
            .as_deref()
            .or(site.config.run_binddir.as_deref())
            .map(|p| site_path(site, p));
        let jailfiles = pset.jailfiles_for(runner).map(|p| site_path(site, &p));
        let command = self.expand(site, runner.command.as_deref().unwrap_or_default());
        site.jail_helper().run(&RunSpec {
            pidfile: paths.pidfile,
            runat: paths.runat,
            input_fifo: paths.input_fifo,
            timing_file: paths.timing_file,
            skeleton: skeleton.as_deref(),
            binddir: binddir.as_deref(),
            jailfiles: jailfiles.as_deref(),
            manifest: &runner.jailmanifest,
            timeout: pset.timeout_for(runner),
            idle_timeout: pset.idle_timeout_for(runner),
            rows: runner.rows,
            columns: runner.columns,
            jaildir: paths.jaildir,
            jailhome: paths.jailhome,
            userhome: paths.userhome,
            username: paths.username,
            command,
        })
    }
}

struct RunPaths<'a> {
    pidfile: &'a Path,
    runat: i64,
    input_fifo: Option<&'a Path>,
    timing_file: Option<&'a Path>,
    jaildir: &'a Path,
    jailhome: &'a Path,
    userhome: &'a str,
    username: &'a str,
}

fn run_key(repo: &Repository, pset: &PsetConfig, hash: &str, runner: &RunnerConfig) -> RunKey {
    RunKey {
        repoid: repo.repoid,
        psetid: pset.id,
        bhash: hash.to_string(),
        runner: runner.name.clone(),
    }
}
