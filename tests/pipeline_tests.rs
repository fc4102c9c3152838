//! End-to-end pipeline tests over a local object stage and in-memory DuckDB

#![cfg(feature = "duckdb-backend")]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mpdp::pipeline::{RunStatus, ValidationReport};
use mpdp::relational::{DuckDbStore, RelationalStore, TableLayout, TextRow};
use mpdp::retry::{RecordingSleeper, RetryPolicy};
use mpdp::source::{FetchError, LocalFileFetcher, SourceFetcher, SourceLocator};
use mpdp::stage::{Attributes, LocalObjectStage, ObjectStage, Stage};
use mpdp::{
    ContractError, ContractStore, ParserRegistry, Pipeline, PipelineError, PipelineSettings,
    SilverTable,
};
use tempfile::TempDir;

const DATASET: &str = "tourism_guides_directory";

const GUIDES: &str = "Nom\tPrénom\tVille\tCatégorie\tLangue de travail\n\
du  pont\tjean-luc\t  lyon \tGuide   conférencier\tFR, EN\n\
MARTIN\tMarie\t\tGuide conférencier\tfr\n";

const CONTRACT: &str = r#"
datasets:
  - dataset_id: tourism_guides_directory
    source: "{source}"
    naming_rule:
      renames:
        nom: last_name
        prenom: first_name
        ville: city
        categorie: category
        langue_de_travail: work_language
    schema:
      - { name: last_name, type: string, nullable: false, normalize: [collapse_whitespace, uppercase] }
      - { name: first_name, type: string, nullable: false, normalize: [titlecase] }
      - { name: city, type: string, nullable: false, normalize: [titlecase] }
      - { name: category, type: string, normalize: [collapse_whitespace] }
      - { name: work_language, type: string, normalize: [collapse_whitespace, lowercase] }
    primary_key: [last_name, first_name, city]
    partition_rule: none
"#;

/// Fails with a transport error a fixed number of times, then reads the file
struct FlakyFetcher {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyFetcher {
    fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

impl SourceFetcher for FlakyFetcher {
    fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::Transport {
                url: locator.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        LocalFileFetcher.fetch(locator)
    }
}

/// Always answers 404
struct GoneFetcher;

impl SourceFetcher for GoneFetcher {
    fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::Status {
            url: locator.to_string(),
            status: 404,
        })
    }
}

struct Harness {
    _dir: TempDir,
    source: PathBuf,
    stage: Arc<LocalObjectStage>,
    store: Arc<DuckDbStore>,
    sleeper: Arc<RecordingSleeper>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("guides.txt");
        fs::write(&source, GUIDES).unwrap();
        Self {
            stage: Arc::new(LocalObjectStage::new(dir.path().join("lake"))),
            store: Arc::new(DuckDbStore::memory().unwrap()),
            sleeper: Arc::new(RecordingSleeper::new()),
            source,
            _dir: dir,
        }
    }

    fn contracts(&self, extra: &str) -> ContractStore {
        let yaml = CONTRACT.replace("{source}", &self.source.display().to_string()) + extra;
        let store = ContractStore::from_yaml_str(&yaml, &ParserRegistry::builtin().unwrap()).unwrap();
        assert!(store.rejected().is_empty(), "{:?}", store.rejected());
        store
    }

    fn pipeline_with(&self, extra: &str, fetcher: Arc<dyn SourceFetcher>) -> Pipeline {
        let settings = PipelineSettings::default().with_retry(RetryPolicy::new(3));
        Pipeline::new(
            self.contracts(extra),
            ParserRegistry::builtin().unwrap(),
            self.stage.clone(),
            fetcher,
        )
        .with_settings(settings)
        .with_store(self.store.clone())
        .with_sleeper(self.sleeper.clone())
    }

    fn pipeline(&self) -> Pipeline {
        self.pipeline_with("", Arc::new(LocalFileFetcher))
    }

    fn rows(&self, pipeline: &Pipeline) -> Vec<TextRow> {
        let contract = pipeline.contracts().get(DATASET).unwrap();
        self.store.fetch_rows(&TableLayout::from_contract(contract)).unwrap()
    }

    fn latest_hash(&self, stage: Stage) -> Option<String> {
        self.stage
            .latest_pointer(DATASET, stage)
            .unwrap()
            .map(|p| p.content_hash)
    }
}

fn text_row(values: &[Option<&str>]) -> TextRow {
    values.iter().map(|v| v.map(str::to_string)).collect()
}

#[test]
fn test_tourism_guides_end_to_end() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();

    let report = pipeline.run(DATASET);
    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.stages.len(), 3);
    assert!(report.stages.iter().all(|s| s.status == RunStatus::Succeeded));

    let silver = harness
        .stage
        .get_latest(DATASET, Stage::Silver)
        .unwrap()
        .unwrap();
    let validation: ValidationReport =
        serde_json::from_value(silver.metadata.attributes["validation_report"].clone()).unwrap();
    assert_eq!(validation.rows_read, 2);
    assert_eq!(validation.rows_accepted, 1);
    assert_eq!(validation.rows_quarantined, 1);
    assert_eq!(validation.quarantined[0].reason, "required field empty");
    assert_eq!(validation.quarantined[0].column.as_deref(), Some("city"));
    assert_eq!(
        silver.metadata.attribute_str("bronze_hash"),
        harness.latest_hash(Stage::Bronze).as_deref()
    );

    let table = SilverTable::from_bytes(&silver.payload).unwrap();
    assert_eq!(
        table.column_names(),
        vec!["last_name", "first_name", "city", "category", "work_language"]
    );

    assert_eq!(
        harness.rows(&pipeline),
        vec![text_row(&[
            Some("DU PONT"),
            Some("Jean-Luc"),
            Some("Lyon"),
            Some("Guide conférencier"),
            Some("fr, en"),
        ])]
    );
}

#[test]
fn test_unchanged_source_is_skipped() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();

    assert_eq!(pipeline.ingest(DATASET).unwrap().status, RunStatus::Succeeded);
    let first = harness.latest_hash(Stage::Bronze).unwrap();

    let again = pipeline.ingest(DATASET).unwrap();
    assert_eq!(again.status, RunStatus::Skipped);
    assert_eq!(harness.stage.list(DATASET, Stage::Bronze).unwrap().len(), 1);
    assert_eq!(harness.latest_hash(Stage::Bronze).unwrap(), first);

    fs::write(&harness.source, format!("{}LEROY\tAnne\tNice\tGuide\tit\n", GUIDES)).unwrap();
    assert_eq!(pipeline.ingest(DATASET).unwrap().status, RunStatus::Succeeded);
    assert_eq!(harness.stage.list(DATASET, Stage::Bronze).unwrap().len(), 2);
    assert_ne!(harness.latest_hash(Stage::Bronze).unwrap(), first);
}

#[test]
fn test_rerun_skips_unchanged_stages_and_reloads() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    assert!(pipeline.run(DATASET).is_success());

    let report = pipeline.run(DATASET);
    assert!(report.is_success());
    let statuses: Vec<RunStatus> = report.stages.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![RunStatus::Skipped, RunStatus::Skipped, RunStatus::Succeeded]
    );
    assert_eq!(harness.stage.list(DATASET, Stage::Silver).unwrap().len(), 1);
}

/// Latest silver must name the latest bronze, in metadata and payload
fn assert_silver_tracks_bronze(harness: &Harness) -> ValidationReport {
    let bronze = harness.latest_hash(Stage::Bronze).unwrap();
    let silver = harness
        .stage
        .get_latest(DATASET, Stage::Silver)
        .unwrap()
        .unwrap();
    assert_eq!(silver.metadata.attribute_str("bronze_hash"), Some(bronze.as_str()));
    let table = SilverTable::from_bytes(&silver.payload).unwrap();
    assert_eq!(table.bronze_hash.as_deref(), Some(bronze.as_str()));
    serde_json::from_value(silver.metadata.attributes["validation_report"].clone()).unwrap()
}

#[test]
fn test_silver_lineage_follows_each_bronze() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    assert!(pipeline.run(DATASET).is_success());
    let first = assert_silver_tracks_bronze(&harness);
    assert_eq!(first.rows_read, 2);
    let loaded = harness.rows(&pipeline);

    // Only a quarantined row changes: accepted rows are identical
    fs::write(&harness.source, format!("{}ALAMI\tSara\t\tGuide\tar\n", GUIDES)).unwrap();
    let report = pipeline.run(DATASET);
    assert!(report.is_success(), "{:?}", report.error);
    let statuses: Vec<RunStatus> = report.stages.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![RunStatus::Succeeded, RunStatus::Succeeded, RunStatus::Succeeded]
    );
    let second = assert_silver_tracks_bronze(&harness);
    assert_eq!(second.rows_read, 3);
    assert_eq!(second.rows_accepted, 1);
    assert_eq!(second.rows_quarantined, 2);
    assert_eq!(second.reason_for(3), Some("required field empty"));
    assert_eq!(harness.stage.list(DATASET, Stage::Silver).unwrap().len(), 2);
    assert_eq!(harness.rows(&pipeline), loaded);

    // An accepted row changes
    fs::write(
        &harness.source,
        format!("{}ALAMI\tSara\tFès\tGuide\tar\n", GUIDES),
    )
    .unwrap();
    assert!(pipeline.run(DATASET).is_success());
    let third = assert_silver_tracks_bronze(&harness);
    assert_eq!(third.rows_accepted, 2);
    assert_eq!(harness.rows(&pipeline).len(), 2);
}

#[test]
fn test_concurrent_ingestions_write_once() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();

    let statuses: Vec<RunStatus> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| scope.spawn(|| pipeline.ingest(DATASET).unwrap().status))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(
        statuses.iter().filter(|s| **s == RunStatus::Succeeded).count(),
        1
    );
    assert_eq!(
        statuses.iter().filter(|s| **s == RunStatus::Skipped).count(),
        1
    );
    assert_eq!(harness.stage.list(DATASET, Stage::Bronze).unwrap().len(), 1);
}

#[test]
fn test_fail_dataset_keeps_previous_silver() {
    let harness = Harness::new();
    assert!(harness.pipeline().run(DATASET).is_success());
    let silver_before = harness.latest_hash(Stage::Silver).unwrap();

    let strict = harness.pipeline_with(
        "    quality_rules:\n      - { name: work_language_known, rule: one_of, column: work_language, values: [\"fr, en\"], severity: fail_dataset }\n",
        Arc::new(LocalFileFetcher),
    );
    fs::write(&harness.source, format!("{}LEROY\tAnne\tNice\tGuide\tit\n", GUIDES)).unwrap();

    assert_eq!(strict.ingest(DATASET).unwrap().status, RunStatus::Succeeded);
    match strict.transform(DATASET) {
        Err(PipelineError::Validation(e)) => {
            assert_eq!(e.rule, "work_language_known");
            assert_eq!(e.offending_rows, 2);
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert_eq!(harness.latest_hash(Stage::Silver).unwrap(), silver_before);
    assert_eq!(harness.stage.list(DATASET, Stage::Silver).unwrap().len(), 1);
}

#[test]
fn test_load_twice_leaves_table_identical() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    assert!(pipeline.run(DATASET).is_success());
    let before = harness.rows(&pipeline);

    let report = pipeline.load(DATASET).unwrap();
    assert_eq!(report.metadata["inserted"], 0);
    assert_eq!(report.metadata["updated"], 1);
    assert_eq!(report.metadata["row_count"], 1);
    assert_eq!(harness.rows(&pipeline), before);
}

#[test]
fn test_failed_load_rolls_back() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    assert!(pipeline.run(DATASET).is_success());
    let before = harness.rows(&pipeline);

    // Commit a silver snapshot whose second row violates NOT NULL
    let latest = harness
        .stage
        .get_latest(DATASET, Stage::Silver)
        .unwrap()
        .unwrap();
    let mut table = SilverTable::from_bytes(&latest.payload).unwrap();
    let mut updated = table.rows[0].clone();
    updated[2] = serde_json::Value::from("Marseille");
    let mut broken = updated.clone();
    broken[0] = serde_json::Value::Null;
    table.rows = vec![updated, broken];
    let reference = harness
        .stage
        .put(
            DATASET,
            Stage::Silver,
            "all",
            &table.to_bytes().unwrap(),
            Attributes::new(),
        )
        .unwrap();
    harness.stage.advance_latest(&reference).unwrap();

    match pipeline.load(DATASET) {
        Err(PipelineError::Load(e)) => assert_eq!(e.dataset_id, DATASET),
        other => panic!("expected load error, got {:?}", other),
    }
    assert_eq!(harness.rows(&pipeline), before);
}

#[test]
fn test_retry_recovers_from_transient_failures() {
    let harness = Harness::new();
    let fetcher = Arc::new(FlakyFetcher::new(2));
    let pipeline = harness.pipeline_with("", fetcher.clone());

    let report = pipeline.ingest(DATASET).unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.metadata["attempts"], 3);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.sleeper.delays().len(), 2);
}

#[test]
fn test_retry_exhaustion_keeps_pointer() {
    let harness = Harness::new();
    let pipeline = harness.pipeline_with("", Arc::new(FlakyFetcher::new(10)));

    match pipeline.ingest(DATASET) {
        Err(PipelineError::Ingestion(e)) => assert_eq!(e.attempts, 3),
        other => panic!("expected ingestion error, got {:?}", other),
    }
    assert!(harness.latest_hash(Stage::Bronze).is_none());
}

#[test]
fn test_non_retryable_failure_is_not_retried() {
    let harness = Harness::new();
    let pipeline = harness.pipeline_with("", Arc::new(GoneFetcher));

    match pipeline.ingest(DATASET) {
        Err(PipelineError::Ingestion(e)) => {
            assert_eq!(e.attempts, 1);
            assert!(e.reason.contains("404"));
        }
        other => panic!("expected ingestion error, got {:?}", other),
    }
    assert!(harness.sleeper.delays().is_empty());
}

#[test]
fn test_put_without_advance_is_invisible() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    pipeline.ingest(DATASET).unwrap();
    let committed = harness.latest_hash(Stage::Bronze).unwrap();

    // A writer that stops between put and advance
    harness
        .stage
        .put(DATASET, Stage::Bronze, "all", b"half written", Attributes::new())
        .unwrap();

    let latest = harness
        .stage
        .get_latest(DATASET, Stage::Bronze)
        .unwrap()
        .unwrap();
    assert_eq!(latest.reference.content_hash, committed);
    assert_eq!(latest.payload, GUIDES.as_bytes());
    assert_eq!(pipeline.ingest(DATASET).unwrap().status, RunStatus::Skipped);
}

#[test]
fn test_downstream_stage_without_input_is_not_found() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();

    match pipeline.transform(DATASET) {
        Err(PipelineError::NotFound(e)) => assert_eq!(e.stage, Stage::Bronze),
        other => panic!("expected not found, got {:?}", other),
    }
    match pipeline.load(DATASET) {
        Err(PipelineError::NotFound(e)) => assert_eq!(e.stage, Stage::Silver),
        other => panic!("expected not found, got {:?}", other),
    }
    assert!(matches!(
        pipeline.ingest("unknown"),
        Err(PipelineError::Contract(ContractError::UnknownDataset(_)))
    ));
}

#[test]
fn test_run_stops_at_first_failure() {
    let harness = Harness::new();
    fs::remove_file(&harness.source).unwrap();
    let pipeline = harness.pipeline();

    let report = pipeline.run(DATASET);
    assert!(!report.is_success());
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].status, RunStatus::Failed);
    assert_eq!(report.stages[0].error_kind.as_deref(), Some("ingestion_error"));
    assert!(matches!(report.error, Some(PipelineError::Ingestion(_))));
}

#[test]
fn test_run_all_isolates_failures() {
    let harness = Harness::new();
    let missing = harness.source.with_file_name("missing.txt");
    let extra = CONTRACT
        .replace("datasets:\n", "")
        .replace("tourism_guides_directory\n", "guides_copy\n    parser: tourism_guides_directory\n")
        .replace("{source}", &missing.display().to_string());
    let yaml = CONTRACT.replace("{source}", &harness.source.display().to_string()) + &extra;
    let contracts = ContractStore::from_yaml_str(&yaml, &ParserRegistry::builtin().unwrap()).unwrap();
    assert_eq!(contracts.list().len(), 2);

    let pipeline = Pipeline::new(
        contracts,
        ParserRegistry::builtin().unwrap(),
        harness.stage.clone(),
        Arc::new(LocalFileFetcher),
    )
    .with_settings(PipelineSettings::default().with_workers(2))
    .with_store(harness.store.clone())
    .with_sleeper(harness.sleeper.clone());

    let batch = pipeline.run_all().unwrap();
    assert_eq!(batch.datasets.len(), 2);
    assert_eq!(batch.succeeded(), 1);
    assert_eq!(batch.failed(), 1);
    let failed = batch.datasets.iter().find(|d| !d.is_success()).unwrap();
    assert_eq!(failed.dataset_id, "guides_copy");
}
