//! S3 / MinIO object stage
//!
//! Locks are held in-process only; writers on different machines are not
//! coordinated.

use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use chrono::Utc;
use tokio::runtime::Runtime;

use super::lock::LockTable;
use super::{
    Attributes, LatestPointer, META_SUFFIX, ObjectMetadata, ObjectRef, ObjectStage, Stage,
    StageLock, StagedObject, content_hash, latest_key, stage_prefix, verify_payload,
};
use crate::error::StorageError;

/// Connection settings for an S3-compatible bucket
#[derive(Debug, Clone)]
pub struct S3StageConfig {
    pub bucket: String,
    /// Key prefix inside the bucket (the original lake layout used `bronze/`
    /// and `silver/` prefixes; here the stage is part of every key)
    pub prefix: Option<String>,
    pub region: Option<String>,
    /// Custom endpoint (MinIO); enables path-style addressing
    pub endpoint_url: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl S3StageConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
            region: None,
            endpoint_url: None,
            access_key: None,
            secret_key: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self
    }
}

/// Object stage backed by an S3 bucket
pub struct S3ObjectStage {
    runtime: Runtime,
    client: S3Client,
    config: S3StageConfig,
    locks: LockTable,
    lock_timeout: Duration,
}

fn backend_error<E: std::error::Error>(context: &str, err: E) -> StorageError {
    StorageError::Backend(format!("{}: {}", context, DisplayErrorContext(err)))
}

impl S3ObjectStage {
    /// Connect to the bucket, creating it if it does not exist yet
    ///
    /// Credentials are taken from the config when both keys are set,
    /// otherwise from the default AWS provider chain.
    pub fn connect(config: S3StageConfig) -> Result<Self, StorageError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| StorageError::Backend(format!("failed to start runtime: {}", e)))?;

        let client = runtime.block_on(async {
            let mut loader = aws_config::defaults(BehaviorVersion::latest());
            let region = config.region.clone().unwrap_or_else(|| "us-east-1".to_string());
            loader = loader.region(aws_config::Region::new(region));
            if let (Some(access), Some(secret)) = (&config.access_key, &config.secret_key) {
                loader = loader.credentials_provider(Credentials::new(
                    access.clone(),
                    secret.clone(),
                    None,
                    None,
                    "mpdp-settings",
                ));
            }
            let shared = loader.load().await;

            let mut s3_config = aws_sdk_s3::config::Builder::from(&shared);
            if let Some(endpoint) = &config.endpoint_url {
                s3_config = s3_config.endpoint_url(endpoint);
                s3_config = s3_config.force_path_style(true);
            }
            S3Client::from_conf(s3_config.build())
        });

        let stage = Self {
            runtime,
            client,
            config,
            locks: LockTable::new(),
            lock_timeout: Duration::from_secs(300),
        };
        stage.ensure_bucket()?;
        Ok(stage)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn ensure_bucket(&self) -> Result<(), StorageError> {
        self.runtime.block_on(async {
            if self
                .client
                .head_bucket()
                .bucket(&self.config.bucket)
                .send()
                .await
                .is_ok()
            {
                return Ok(());
            }
            tracing::info!(bucket = %self.config.bucket, "creating bucket");
            self.client
                .create_bucket()
                .bucket(&self.config.bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| backend_error("create_bucket", e))
        })
    }

    fn full_key(&self, key: &str) -> String {
        match &self.config.prefix {
            Some(prefix) if !prefix.is_empty() => {
                format!("{}/{}", prefix.trim_end_matches('/'), key)
            }
            _ => key.to_string(),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.runtime.block_on(async {
            match self
                .client
                .head_object()
                .bucket(&self.config.bucket)
                .key(self.full_key(key))
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service = e.into_service_error();
                    if service.is_not_found() {
                        Ok(false)
                    } else {
                        Err(backend_error("head_object", service))
                    }
                }
            }
        })
    }

    /// Read a key; `None` when it does not exist
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.runtime.block_on(async {
            let response = match self
                .client
                .get_object()
                .bucket(&self.config.bucket)
                .key(self.full_key(key))
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    let service = e.into_service_error();
                    if service.is_no_such_key() {
                        return Ok(None);
                    }
                    return Err(backend_error("get_object", service));
                }
            };
            let bytes = response
                .body
                .collect()
                .await
                .map_err(|e| StorageError::Backend(format!("get_object body: {}", e)))?;
            Ok(Some(bytes.into_bytes().to_vec()))
        })
    }

    fn write(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        self.runtime.block_on(async {
            self.client
                .put_object()
                .bucket(&self.config.bucket)
                .key(self.full_key(key))
                .content_type(content_type)
                .body(ByteStream::from(bytes))
                .send()
                .await
                .map(|_| ())
                .map_err(|e| backend_error("put_object", e))
        })
    }

    fn read_metadata(&self, reference: &ObjectRef) -> Result<ObjectMetadata, StorageError> {
        let raw = self
            .read(&reference.meta_key())?
            .ok_or_else(|| StorageError::NotFound(reference.key()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let full_prefix = self.full_key(prefix);
        let strip = full_prefix.len() - prefix.len();
        self.runtime.block_on(async {
            let mut keys = Vec::new();
            let mut continuation_token: Option<String> = None;
            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.config.bucket)
                    .prefix(&full_prefix);
                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| backend_error("list_objects_v2", e))?;
                for object in response.contents() {
                    if let Some(key) = object.key() {
                        keys.push(key[strip..].to_string());
                    }
                }
                match response.next_continuation_token() {
                    Some(token) if response.is_truncated().unwrap_or(false) => {
                        continuation_token = Some(token.to_string());
                    }
                    _ => break,
                }
            }
            Ok(keys)
        })
    }
}

impl ObjectStage for S3ObjectStage {
    fn describe(&self) -> String {
        match &self.config.endpoint_url {
            Some(endpoint) => format!("s3://{} ({})", self.config.bucket, endpoint),
            None => format!("s3://{}", self.config.bucket),
        }
    }

    fn put(
        &self,
        dataset_id: &str,
        stage: Stage,
        partition_key: &str,
        payload: &[u8],
        attributes: Attributes,
    ) -> Result<ObjectRef, StorageError> {
        let reference = ObjectRef {
            dataset_id: dataset_id.to_string(),
            stage,
            partition_key: partition_key.to_string(),
            content_hash: content_hash(payload),
        };
        if self.exists(&reference.meta_key())? {
            tracing::debug!(key = %reference, "object already staged");
            return Ok(reference);
        }

        let metadata = ObjectMetadata {
            dataset_id: reference.dataset_id.clone(),
            stage,
            partition_key: reference.partition_key.clone(),
            content_hash: reference.content_hash.clone(),
            byte_size: payload.len() as u64,
            created_at: Utc::now(),
            attributes,
        };
        // Payload first: a sidecar only ever names a complete object.
        self.write(&reference.key(), payload.to_vec(), "application/octet-stream")?;
        self.write(
            &reference.meta_key(),
            serde_json::to_vec_pretty(&metadata)?,
            "application/json",
        )?;
        Ok(reference)
    }

    fn get(&self, reference: &ObjectRef) -> Result<StagedObject, StorageError> {
        let payload = self
            .read(&reference.key())?
            .ok_or_else(|| StorageError::NotFound(reference.key()))?;
        verify_payload(reference, &payload)?;
        let metadata = self.read_metadata(reference)?;
        Ok(StagedObject {
            reference: reference.clone(),
            metadata,
            payload,
        })
    }

    fn latest_pointer(
        &self,
        dataset_id: &str,
        stage: Stage,
    ) -> Result<Option<LatestPointer>, StorageError> {
        match self.read(&latest_key(dataset_id, stage))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn advance_latest(&self, reference: &ObjectRef) -> Result<LatestPointer, StorageError> {
        let metadata = self.read_metadata(reference)?;
        let pointer = LatestPointer::new(&metadata);
        // A single PUT replaces the whole pointer object.
        self.write(
            &latest_key(&reference.dataset_id, reference.stage),
            serde_json::to_vec_pretty(&pointer)?,
            "application/json",
        )?;
        Ok(pointer)
    }

    fn lock(&self, dataset_id: &str, stage: Stage) -> Result<StageLock, StorageError> {
        let name = stage_prefix(dataset_id, stage);
        let guard = self.locks.acquire(&name, self.lock_timeout)?;
        Ok(StageLock::new(name, vec![Box::new(guard)]))
    }

    fn list(&self, dataset_id: &str, stage: Stage) -> Result<Vec<ObjectMetadata>, StorageError> {
        let prefix = format!("{}/", stage_prefix(dataset_id, stage));
        let mut objects = Vec::new();
        for key in self.list_keys(&prefix)? {
            if !key.ends_with(META_SUFFIX) {
                continue;
            }
            if let Some(raw) = self.read(&key)? {
                objects.push(serde_json::from_slice::<ObjectMetadata>(&raw)?);
            }
        }
        objects.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });
        Ok(objects)
    }
}
