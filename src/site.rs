//! Per-process context handed by reference to every queue operation.

use std::sync::Arc;

use crate::adapters::{ConfigCatalog, StdTimeAdapter};
use crate::config::{PsetConfig, Repository, SiteConfig};
use crate::grader::{Evaluator, EvaluatorRegistry};
use crate::ledger::Ledger;
use crate::ports::{CatalogPort, TimePort};
use crate::runlog::RunLogger;
use crate::sandbox::env::ExportPolicy;
use crate::sandbox::jail::JailHelper;
use crate::sandbox::{Executor, ProcessExecutor};
use crate::store::{QueueStore, StoreError};

pub struct Site {
    pub config: SiteConfig,
    pub store: QueueStore,
    pub catalog: Arc<dyn CatalogPort>,
    pub clock: Arc<dyn TimePort>,
    pub executor: Arc<dyn Executor>,
    pub evaluators: EvaluatorRegistry,
    pub export_policy: ExportPolicy,
    ledger: Option<Box<dyn Ledger>>,
}

impl Site {
    /// Open the configured database with the production collaborators.
    pub fn open(config: SiteConfig) -> Result<Self, StoreError> {
        let store = QueueStore::open(config.db_path())?;
        Ok(Self::new(config, store))
    }

    pub fn new(config: SiteConfig, store: QueueStore) -> Self {
        let catalog = Arc::new(ConfigCatalog::from_config(&config));
        Self {
            config,
            store,
            catalog,
            clock: Arc::new(StdTimeAdapter),
            executor: Arc::new(ProcessExecutor),
            evaluators: EvaluatorRegistry::with_builtins(),
            export_policy: ExportPolicy::default(),
            ledger: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimePort>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogPort>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_evaluator(mut self, name: &str, evaluator: impl Evaluator + 'static) -> Self {
        self.evaluators.register(name, evaluator);
        self
    }

    /// Record runs somewhere other than the queue database.
    pub fn with_ledger(mut self, ledger: Box<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn now(&self) -> i64 {
        self.clock.now_secs()
    }

    pub fn ledger(&self) -> &dyn Ledger {
        match &self.ledger {
            Some(ledger) => ledger.as_ref(),
            None => &self.store,
        }
    }

    pub fn jail_helper(&self) -> JailHelper {
        JailHelper::new(self.config.jail_helper())
    }

    pub fn run_logger(&self, repo: &Repository, pset: &PsetConfig) -> RunLogger {
        RunLogger::new(&self.config.log_root(), &repo.cacheid, repo.repoid, pset.id)
    }
}
