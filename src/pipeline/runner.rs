//! Per-dataset runner and parallel batch execution

use std::sync::Arc;

use once_cell::sync::OnceCell;
use rayon::prelude::*;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use super::{
    BatchReport, DatasetReport, IngestionPipeline, LoadPipeline, PipelineStage, RunStatus,
    StageOutcome, StageReport, TransformPipeline,
};
use crate::config::PipelineSettings;
use crate::contract::ContractStore;
use crate::error::PipelineError;
use crate::parsers::ParserRegistry;
use crate::relational::RelationalStore;
use crate::retry::{Sleeper, ThreadSleeper};
use crate::source::SourceFetcher;
use crate::stage::ObjectStage;

/// Runs stages for the datasets of one contract store
///
/// The relational store is opened on first use, so ingest and transform work
/// without a reachable database.
pub struct Pipeline {
    contracts: ContractStore,
    registry: ParserRegistry,
    stage: Arc<dyn ObjectStage>,
    fetcher: Arc<dyn SourceFetcher>,
    store: OnceCell<Arc<dyn RelationalStore>>,
    settings: PipelineSettings,
    sleeper: Arc<dyn Sleeper>,
}

impl Pipeline {
    /// Pipeline over explicit components with default settings
    pub fn new(
        contracts: ContractStore,
        registry: ParserRegistry,
        stage: Arc<dyn ObjectStage>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        Self {
            contracts,
            registry,
            stage,
            fetcher,
            store: OnceCell::new(),
            settings: PipelineSettings::default(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    /// Pipeline with the object stage, fetcher and database named by `settings`
    pub fn from_settings(
        settings: PipelineSettings,
        contracts: ContractStore,
        registry: ParserRegistry,
    ) -> Result<Self, PipelineError> {
        let stage = settings.open_object_stage()?;
        let fetcher = settings.fetcher()?;
        info!(
            object_stage = %stage.describe(),
            contracts = contracts.list().len(),
            "Pipeline ready"
        );
        Ok(Self::new(contracts, registry, stage, fetcher).with_settings(settings))
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use an already opened relational store
    pub fn with_store(mut self, store: Arc<dyn RelationalStore>) -> Self {
        self.store = OnceCell::with_value(store);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn contracts(&self) -> &ContractStore {
        &self.contracts
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn object_stage(&self) -> &dyn ObjectStage {
        self.stage.as_ref()
    }

    fn relational_store(&self) -> Result<&Arc<dyn RelationalStore>, PipelineError> {
        self.store
            .get_or_try_init(|| self.settings.open_relational_store())
    }

    pub fn ingest(&self, dataset_id: &str) -> Result<StageReport, PipelineError> {
        self.run_stage(PipelineStage::Ingest, dataset_id)
    }

    pub fn transform(&self, dataset_id: &str) -> Result<StageReport, PipelineError> {
        self.run_stage(PipelineStage::Transform, dataset_id)
    }

    pub fn load(&self, dataset_id: &str) -> Result<StageReport, PipelineError> {
        self.run_stage(PipelineStage::Load, dataset_id)
    }

    /// Run a single stage under a fresh run id
    pub fn run_stage(
        &self,
        stage: PipelineStage,
        dataset_id: &str,
    ) -> Result<StageReport, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        match self.execute(&run_id, dataset_id, stage) {
            (report, None) => Ok(report),
            (_, Some(err)) => Err(err),
        }
    }

    /// Ingest, transform and load one dataset, stopping at the first failure
    ///
    /// A skipped stage does not stop the run, so downstream stages that failed
    /// earlier catch up with an unchanged source.
    pub fn run(&self, dataset_id: &str) -> DatasetReport {
        let run_id = Uuid::new_v4().to_string();
        let _span = info_span!("dataset_run", run_id = %run_id, dataset_id).entered();

        let mut stages = Vec::new();
        let mut error = None;
        for stage in PipelineStage::all() {
            let (report, failure) = self.execute(&run_id, dataset_id, stage);
            stages.push(report);
            if failure.is_some() {
                error = failure;
                break;
            }
        }

        DatasetReport {
            dataset_id: dataset_id.to_string(),
            run_id,
            stages,
            error,
        }
    }

    /// Run every valid contract in parallel, one task per dataset
    pub fn run_all(&self) -> Result<BatchReport, PipelineError> {
        let dataset_ids: Vec<&str> = self
            .contracts
            .list()
            .iter()
            .map(|c| c.dataset_id.as_str())
            .collect();
        let rejected: Vec<String> = self
            .contracts
            .rejected()
            .iter()
            .map(|r| r.dataset_id.clone())
            .collect();
        for id in &rejected {
            warn!(dataset_id = %id, "Skipping invalid contract");
        }

        // 0 lets rayon pick the CPU count
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.workers.unwrap_or(0))
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot start worker pool: {}", e)))?;

        info!(
            datasets = dataset_ids.len(),
            workers = pool.current_num_threads(),
            "Starting batch run"
        );
        let datasets: Vec<DatasetReport> =
            pool.install(|| dataset_ids.par_iter().map(|id| self.run(id)).collect());

        let report = BatchReport { datasets, rejected };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            rejected = report.rejected.len(),
            "Batch run finished"
        );
        Ok(report)
    }

    fn execute(
        &self,
        run_id: &str,
        dataset_id: &str,
        stage: PipelineStage,
    ) -> (StageReport, Option<PipelineError>) {
        let _span = info_span!("pipeline_stage", run_id, dataset_id, stage = stage.name()).entered();
        info!(stage = stage.name(), "Starting stage");

        let mut report = StageReport::new(run_id, dataset_id, stage);
        let outcome = report
            .transition(RunStatus::Running)
            .map_err(PipelineError::from)
            .and_then(|()| self.dispatch(stage, dataset_id));

        let failure = match outcome {
            Ok(outcome) => {
                info!(status = %outcome.status, message = %outcome.message, "Stage finished");
                report.complete(outcome).err().map(PipelineError::from)
            }
            Err(err) => Some(err),
        };
        if let Some(err) = &failure {
            error!(kind = err.kind(), error = %err, "Stage failed");
            if let Err(e) = report.fail(err) {
                warn!(error = %e, "Could not record stage failure");
            }
        }
        (report, failure)
    }

    fn dispatch(&self, stage: PipelineStage, dataset_id: &str) -> Result<StageOutcome, PipelineError> {
        let contract = self.contracts.get(dataset_id)?;
        let retry = &self.settings.retry;
        match stage {
            PipelineStage::Ingest => IngestionPipeline::new(
                self.stage.as_ref(),
                self.fetcher.as_ref(),
                retry,
                self.sleeper.as_ref(),
            )
            .run(contract),
            PipelineStage::Transform => TransformPipeline::new(
                self.stage.as_ref(),
                &self.registry,
                retry,
                self.sleeper.as_ref(),
            )
            .run(contract),
            PipelineStage::Load => {
                let store = self.relational_store()?;
                LoadPipeline::new(self.stage.as_ref(), store.as_ref()).run(contract)
            }
        }
    }
}
