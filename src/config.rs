//! Site configuration: paths, queue classes, and the pset/runner
//! definitions the provisioner consumes. Loaded from YAML and validated once
//! at load time.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

pub const DEFAULT_RUN_USERNAME: &str = "jail61user";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_SCAN_LIMIT: usize = 100;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config format error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
}

fn queue_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\A[~.A-Za-z][-_~.A-Za-z0-9]*\z").expect("static regex"))
}

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\A\w+\z").expect("static regex"))
}

/// Run-as accounts must be plain identifiers.
pub fn valid_username(name: &str) -> bool {
    username_re().is_match(name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub nconcurrent: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub file: PathBuf,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl OverlayConfig {
    pub fn absolute_path(&self, root: &Path) -> PathBuf {
        if self.file.is_absolute() {
            self.file.clone()
        } else {
            root.join(&self.file)
        }
    }

    pub fn is_archive(&self) -> bool {
        let name = self.file.to_string_lossy().to_ascii_lowercase();
        [".tar", ".tar.gz", ".tar.xz", ".tgz", ".tbz", ".txz", ".tar.bz2"]
            .iter()
            .any(|ext| name.ends_with(ext))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Filled from the map key when left empty.
    pub name: String,
    pub command: Option<String>,
    pub queue: Option<String>,
    pub username: Option<String>,
    pub timeout: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub rows: Option<u16>,
    pub columns: Option<u16>,
    pub jailfiles: Option<PathBuf>,
    pub jailmanifest: Vec<String>,
    pub overlay: Vec<OverlayConfig>,
    /// Tags a reused run must carry.
    pub ensure: Vec<String>,
    pub evaluate_function: Option<String>,
    pub timed_replay: bool,
}

impl RunnerConfig {
    pub fn has_command(&self) -> bool {
        self.command.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsetConfig {
    pub id: i64,
    pub urlkey: String,
    /// Subdirectory of the repository holding this pset, if any.
    pub directory: String,
    pub run_dirpattern: String,
    pub run_username: Option<String>,
    pub run_timeout: Option<u64>,
    pub run_idle_timeout: Option<u64>,
    pub run_skeletondir: Option<PathBuf>,
    pub run_binddir: Option<PathBuf>,
    pub run_jailfiles: Option<PathBuf>,
    pub runners: BTreeMap<String, RunnerConfig>,
}

impl PsetConfig {
    pub fn runner(&self, name: &str) -> Option<&RunnerConfig> {
        self.runners.get(name)
    }

    pub fn directory_noslash(&self) -> &str {
        self.directory.trim_matches('/')
    }

    pub fn run_username_for(&self, runner: &RunnerConfig) -> String {
        runner
            .username
            .clone()
            .or_else(|| self.run_username.clone())
            .unwrap_or_else(|| DEFAULT_RUN_USERNAME.to_string())
    }

    pub fn timeout_for(&self, runner: &RunnerConfig) -> Option<u64> {
        runner.timeout.or(self.run_timeout).filter(|t| *t > 0)
    }

    pub fn idle_timeout_for(&self, runner: &RunnerConfig) -> Option<u64> {
        runner.idle_timeout.or(self.run_idle_timeout).filter(|t| *t > 0)
    }

    pub fn jailfiles_for(&self, runner: &RunnerConfig) -> Option<PathBuf> {
        runner.jailfiles.clone().or_else(|| self.run_jailfiles.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Repository {
    pub repoid: i64,
    pub url: String,
    /// Names the bare clone under the repository root; defaults to the id.
    pub cacheid: String,
    pub repogid: Option<String>,
    /// Repository holds only the pset subdirectory's parent layout.
    pub truncated: bool,
}

impl Repository {
    pub fn repodir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(format!("repo{}", self.cacheid))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRecord {
    pub cid: i64,
    pub username: String,
    pub anon_username: Option<String>,
    /// Repository graded when a job names only the user.
    pub repoid: Option<i64>,
}

impl UserRecord {
    pub fn display_name(&self, anonymous: bool) -> &str {
        match (&self.anon_username, anonymous) {
            (Some(anon), true) => anon,
            _ => &self.username,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_scan_limit() -> usize {
    DEFAULT_SCAN_LIMIT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub log_root: Option<PathBuf>,
    #[serde(default)]
    pub repo_root: Option<PathBuf>,
    #[serde(default)]
    pub jail_helper: Option<PathBuf>,
    #[serde(default)]
    pub host_type: String,
    #[serde(default)]
    pub run_skeletondir: Option<PathBuf>,
    #[serde(default)]
    pub run_binddir: Option<PathBuf>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
    #[serde(default)]
    pub queues: BTreeMap<String, QueueConfig>,
    #[serde(default)]
    pub repos: Vec<Repository>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub psets: Vec<PsetConfig>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            db_path: None,
            log_root: None,
            repo_root: None,
            jail_helper: None,
            host_type: String::new(),
            run_skeletondir: None,
            run_binddir: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            scan_limit: DEFAULT_SCAN_LIMIT,
            queues: BTreeMap::new(),
            repos: Vec::new(),
            users: Vec::new(),
            psets: Vec::new(),
        }
    }
}

impl SiteConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: SiteConfig = serde_yaml::from_str(text)?;
        config.normalize()?;
        Ok(config)
    }

    /// `GRADEQUEUE_DB` and `GRADEQUEUE_JAIL_HELPER` override the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(db) = std::env::var("GRADEQUEUE_DB") {
            if !db.is_empty() {
                self.db_path = Some(PathBuf::from(db));
            }
        }
        if let Ok(helper) = std::env::var("GRADEQUEUE_JAIL_HELPER") {
            if !helper.is_empty() {
                self.jail_helper = Some(PathBuf::from(helper));
            }
        }
    }

    /// Fill derived fields and reject malformed definitions.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        for (name, queue) in self.queues.iter_mut() {
            if queue.key.is_empty() {
                queue.key = name.clone();
            }
            if !queue_key_re().is_match(&queue.key) {
                return Err(ConfigError::Invalid(format!("queue {name:?}: key format error")));
            }
        }

        let mut seen = BTreeSet::new();
        for repo in &mut self.repos {
            if repo.cacheid.is_empty() {
                repo.cacheid = repo.repoid.to_string();
            }
        }
        for pset in &mut self.psets {
            if !seen.insert(pset.id) {
                return Err(ConfigError::Invalid(format!("pset {}: duplicate id", pset.id)));
            }
            if pset.urlkey.is_empty() {
                pset.urlkey = pset.id.to_string();
            }
            if let Some(user) = &pset.run_username {
                if !valid_username(user) {
                    return Err(ConfigError::Invalid(format!(
                        "pset {}: bad run_username {user:?}",
                        pset.urlkey
                    )));
                }
            }
            for (name, runner) in pset.runners.iter_mut() {
                if runner.name.is_empty() {
                    runner.name = name.clone();
                }
                if let Some(user) = &runner.username {
                    if !valid_username(user) {
                        return Err(ConfigError::Invalid(format!(
                            "runner {}/{name}: bad username {user:?}",
                            pset.urlkey
                        )));
                    }
                }
                if let Some(queue) = runner.queue.as_deref().filter(|q| !q.is_empty()) {
                    if !self.queues.contains_key(queue) {
                        return Err(ConfigError::Invalid(format!(
                            "runner {}/{name}: unknown queue {queue:?}",
                            pset.urlkey
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.root.join("queue.db"))
    }

    pub fn log_root(&self) -> PathBuf {
        self.resolve(self.log_root.as_deref(), "log")
    }

    pub fn repo_root(&self) -> PathBuf {
        self.resolve(self.repo_root.as_deref(), "repo")
    }

    pub fn jail_helper(&self) -> PathBuf {
        self.resolve(self.jail_helper.as_deref(), "jail/pa-jail")
    }

    fn resolve(&self, configured: Option<&Path>, fallback: &str) -> PathBuf {
        match configured {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => self.root.join(p),
            None => self.root.join(fallback),
        }
    }

    /// Queue class lookup; unknown classes are uncapped.
    pub fn queue(&self, key: &str) -> QueueConfig {
        self.queues.get(key).cloned().unwrap_or_else(|| QueueConfig {
            key: key.to_string(),
            nconcurrent: None,
        })
    }

    pub fn pset_by_id(&self, psetid: i64) -> Option<&PsetConfig> {
        self.psets.iter().find(|p| p.id == psetid)
    }

    /// Lookup by username or numeric id.
    pub fn user_by_key(&self, key: &str) -> Option<&UserRecord> {
        self.users
            .iter()
            .find(|u| u.username == key || u.cid.to_string() == key)
    }

    pub fn pset_by_key(&self, key: &str) -> Option<&PsetConfig> {
        self.psets
            .iter()
            .find(|p| p.urlkey == key || p.id.to_string() == key)
    }
}
