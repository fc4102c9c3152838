//! Bronze ingestion: fetch, dedup by content hash, stage, advance

use chrono::Utc;
use tracing::{debug, info};

use super::{StageOutcome, retry_storage};
use crate::contract::DatasetContract;
use crate::error::{IngestionError, PipelineError};
use crate::retry::{RetryPolicy, Sleeper, retry};
use crate::source::{FetchError, SourceFetcher, SourceLocator};
use crate::stage::{Attributes, ObjectStage, Stage, content_hash};

/// Fetches a dataset's source into the bronze stage
pub struct IngestionPipeline<'a> {
    stage: &'a dyn ObjectStage,
    fetcher: &'a dyn SourceFetcher,
    retry: &'a RetryPolicy,
    sleeper: &'a dyn Sleeper,
}

impl<'a> IngestionPipeline<'a> {
    pub fn new(
        stage: &'a dyn ObjectStage,
        fetcher: &'a dyn SourceFetcher,
        retry: &'a RetryPolicy,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            stage,
            fetcher,
            retry,
            sleeper,
        }
    }

    /// Stage the current source bytes, or skip when they match the latest
    /// bronze object
    ///
    /// The bronze lock is held from the fetch until the pointer has advanced,
    /// so a concurrent ingestion of the same content observes this one's
    /// result and skips.
    pub fn run(&self, contract: &DatasetContract) -> Result<StageOutcome, PipelineError> {
        let dataset_id = contract.dataset_id.as_str();
        let failure = |attempts: u32, reason: String| IngestionError {
            dataset_id: dataset_id.to_string(),
            attempts: attempts as usize,
            reason,
        };

        let locator = SourceLocator::parse(&contract.source).map_err(|e| failure(0, e.to_string()))?;
        let _lock = self.stage.lock(dataset_id, Stage::Bronze)?;

        let fetched = retry(self.retry, self.sleeper, FetchError::is_retryable, |attempt| {
            debug!(dataset_id, attempt, source = %locator, "Fetching source");
            self.fetcher.fetch(&locator)
        })
        .map_err(|f| failure(f.attempts, f.error.to_string()))?;
        let attempts = fetched.attempts;
        let payload = fetched.value;

        if payload.is_empty() {
            return Err(failure(attempts, "source returned an empty payload".to_string()).into());
        }

        let hash = content_hash(&payload);
        let latest = self.stage.latest_pointer(dataset_id, Stage::Bronze)?;
        if latest.is_some_and(|p| p.content_hash == hash) {
            info!(dataset_id, content_hash = %hash, "Source unchanged, skipping bronze write");
            return Ok(StageOutcome::skipped("source unchanged since the latest bronze snapshot")
                .with_metadata("content_hash", hash)
                .with_metadata("attempts", attempts));
        }

        let fetched_at = Utc::now();
        let partition_key = contract.partition_rule.partition_key(fetched_at);
        let mut attributes = Attributes::new();
        attributes.insert("fetched_at".to_string(), fetched_at.to_rfc3339().into());
        attributes.insert(
            "retrieved_utc".to_string(),
            fetched_at.format("%Y%m%dT%H%M%SZ").to_string().into(),
        );
        attributes.insert("source".to_string(), contract.source.clone().into());
        attributes.insert("byte_size".to_string(), (payload.len() as u64).into());
        attributes.insert("checksum".to_string(), format!("sha256:{}", hash).into());
        attributes.insert("format".to_string(), contract.format.clone().into());

        let reference = retry_storage(self.retry, self.sleeper, || {
            self.stage.put(
                dataset_id,
                Stage::Bronze,
                &partition_key,
                &payload,
                attributes.clone(),
            )
        })
        .map_err(|e| failure(attempts, format!("staging bronze object failed: {}", e)))?;
        let pointer = retry_storage(self.retry, self.sleeper, || {
            self.stage.advance_latest(&reference)
        })
        .map_err(|e| failure(attempts, format!("advancing bronze pointer failed: {}", e)))?;

        info!(
            dataset_id,
            key = %pointer.key,
            byte_size = payload.len(),
            attempts,
            "Bronze snapshot committed"
        );
        Ok(StageOutcome::succeeded(format!(
            "staged {} bytes as {}",
            payload.len(),
            pointer.key
        ))
        .with_metadata("content_hash", hash)
        .with_metadata("key", pointer.key)
        .with_metadata("byte_size", payload.len() as u64)
        .with_metadata("attempts", attempts))
    }
}
