//! Shared fixtures: a temporary site with a manual clock and an executor
//! that plays the jail helper, git, and tar without touching the system.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use nix::fcntl::{Flock, FlockArg};
use tempfile::TempDir;

use gradequeue::adapters::ManualClock;
use gradequeue::queue::{NewJob, QueueItem};
use gradequeue::sandbox::{ExecOutput, Executor, Invocation};
use gradequeue::{Site, SiteConfig};

pub const START: i64 = 1_700_000_000;
pub const HASH: &str = "c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00";
pub const DEFAULT_OUTPUT: &str = "compiling\n{\"score\": 9, \"max\": 10}\n";

pub struct FakeExecutor {
    helper: PathBuf,
    calls: Mutex<Vec<Invocation>>,
    /// Pid files of running jobs; dropping the lock ends the job.
    locks: Mutex<HashMap<PathBuf, Flock<File>>>,
    fail_verb: Mutex<Option<String>>,
    output: Mutex<String>,
}

impl FakeExecutor {
    pub fn new(helper: &Path) -> Self {
        Self {
            helper: helper.to_path_buf(),
            calls: Mutex::new(Vec::new()),
            locks: Mutex::new(HashMap::new()),
            fail_verb: Mutex::new(None),
            output: Mutex::new(DEFAULT_OUTPUT.to_string()),
        }
    }

    /// Make the helper exit 1 for `verb`.
    pub fn fail_on(&self, verb: &str) {
        *self.fail_verb.lock().unwrap() = Some(verb.to_string());
    }

    pub fn set_output(&self, output: &str) {
        *self.output.lock().unwrap() = output.to_string();
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// `helper add`, `git fetch`, ... in call order.
    pub fn verbs(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|inv| {
                let program = if inv.program == self.helper {
                    "helper".to_string()
                } else {
                    inv.program.display().to_string()
                };
                format!("{program} {}", inv.verb().unwrap_or(""))
            })
            .collect()
    }

    pub fn runs(&self) -> usize {
        self.verbs().iter().filter(|v| *v == "helper run").count()
    }

    pub fn running(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    /// End every running job.
    pub fn finish_all(&self) {
        self.locks.lock().unwrap().clear();
    }

    pub fn finish(&self, pidfile: &Path) {
        self.locks.lock().unwrap().remove(pidfile);
    }

    fn helper(&self, inv: &Invocation) -> Result<ExecOutput> {
        let verb = inv.verb().unwrap_or_default();
        if self.fail_verb.lock().unwrap().as_deref() == Some(verb) {
            return Ok(ExecOutput {
                code: 1,
                stderr: format!("{verb}: refused\n").into_bytes(),
                ..Default::default()
            });
        }
        let arg = |i: usize| inv.args.get(i).map(PathBuf::from).ok_or_else(|| anyhow!("missing argument"));
        match verb {
            "add" => fs::create_dir_all(arg(1)?)?,
            "mv" => fs::rename(arg(1)?, arg(2)?)?,
            "rm" => {
                let _ = fs::remove_dir_all(arg(2)?);
            }
            "run" => self.start(inv)?,
            other => return Err(anyhow!("unexpected helper verb {other}")),
        }
        Ok(ExecOutput::default())
    }

    fn start(&self, inv: &Invocation) -> Result<()> {
        let find = |prefix: &str| {
            inv.args
                .iter()
                .find_map(|a| a.strip_prefix(prefix))
                .ok_or_else(|| anyhow!("no {prefix} argument"))
        };
        let pidfile = PathBuf::from(find("-p")?);
        let contents = find("-P")?.replace("$$", &std::process::id().to_string());
        fs::write(&pidfile, format!("{contents}\n"))?;
        let file = File::open(&pidfile)?;
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, e)| anyhow!(e))?;
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pidfile, lock);
        if let Some(path) = &inv.output {
            let mut log = OpenOptions::new().append(true).open(path)?;
            log.write_all(self.output.lock().unwrap().as_bytes())?;
        }
        Ok(())
    }
}

impl Executor for FakeExecutor {
    fn exec(&self, inv: &Invocation) -> Result<ExecOutput> {
        self.calls.lock().unwrap().push(inv.clone());
        if inv.program == self.helper {
            return self.helper(inv);
        }
        let program = inv.program.to_string_lossy();
        match (program.as_ref(), inv.verb()) {
            ("git", Some("rev-parse")) => Ok(ExecOutput {
                stdout: format!("{HASH}\n").into_bytes(),
                ..Default::default()
            }),
            ("git", Some("init")) => {
                if let Some(cwd) = &inv.cwd {
                    fs::create_dir_all(cwd.join(".git"))?;
                }
                Ok(ExecOutput::default())
            }
            _ => Ok(ExecOutput::default()),
        }
    }
}

pub const SITE_YAML: &str = r#"
host_type: test
queues:
  small:
    nconcurrent: 2
repos:
  - repoid: 1
  - repoid: 2
  - repoid: 3
users:
  - cid: 1
    username: ada
    repoid: 1
  - cid: 2
    username: bob
    repoid: 2
  - cid: 3
    username: cy
    repoid: 3
psets:
  - id: 1
    urlkey: lab1
    run_dirpattern: "@ROOT@/jails/${REPOID}/${PSET}"
    run_jailfiles: jail/files.txt
    runners:
      make:
        command: make check
        queue: small
        evaluate_function: last_json_line
      scored:
        command: make score
        evaluate_function: counted
        timeout: 30
      grade:
        evaluate_function: counted
      plain:
        command: make
"#;

pub struct TestSite {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub exec: Arc<FakeExecutor>,
    pub site: Site,
}

pub fn config_text(root: &Path) -> String {
    format!("root: {}\n{}", root.display(), SITE_YAML.replace("@ROOT@", &root.display().to_string()))
}

/// Write the helper stub and site config under `root`.
pub fn prepare_root(root: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let helper = root.join("jail/pa-jail");
    fs::create_dir_all(helper.parent().unwrap()).unwrap();
    fs::write(&helper, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&helper, fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(root.join("jail/files.txt"), "/usr/bin/make\n").unwrap();
    let config = root.join("site.yml");
    fs::write(&config, config_text(root)).unwrap();
    config
}

pub fn test_site() -> TestSite {
    test_site_with(|site| site)
}

pub fn test_site_with(customize: impl FnOnce(Site) -> Site) -> TestSite {
    let dir = tempfile::tempdir().unwrap();
    prepare_root(dir.path());
    let config = SiteConfig::from_yaml_str(&config_text(dir.path())).unwrap();
    let clock = Arc::new(ManualClock::new(START));
    let exec = Arc::new(FakeExecutor::new(&config.jail_helper()));
    let site = Site::open(config)
        .unwrap()
        .with_clock(clock.clone())
        .with_executor(exec.clone());
    TestSite {
        dir,
        clock,
        exec,
        site: customize(site),
    }
}

impl TestSite {
    pub fn job(&self, cid: i64, runner: &str) -> NewJob {
        NewJob {
            reqcid: cid,
            cid,
            psetid: 1,
            repoid: cid,
            runner: runner.to_string(),
            bhash: Some(HASH.to_string()),
            ..Default::default()
        }
    }

    /// Enqueue and schedule; returns the persisted item.
    pub fn submit(&self, job: NewJob) -> QueueItem {
        let cid = job.cid;
        let mut qi = QueueItem::new_job(&self.site, job).unwrap();
        qi.schedule(&self.site, 0, Some(cid)).unwrap();
        qi
    }

    pub fn reload(&self, queueid: i64) -> QueueItem {
        QueueItem::by_id(&self.site, queueid).unwrap().unwrap()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir.path().join("log")
    }

    pub fn pid_file(&self, repoid: i64) -> PathBuf {
        self.log_dir()
            .join(format!("run{repoid}.pset1"))
            .join(format!("repo{repoid}.pset1.pid"))
    }

    pub fn jail_home(&self, repoid: i64) -> PathBuf {
        self.dir
            .path()
            .join(format!("jails/{repoid}/1/home/jail61"))
    }
}
