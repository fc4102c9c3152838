//! Pipeline settings
//!
//! Settings come from an optional TOML file, then environment variables
//! override individual fields. Contracts are configured separately.
//!
//! ```toml
//! workers = 4
//!
//! [storage]
//! backend = "s3"
//! bucket = "lake"
//! endpoint_url = "http://localhost:9000"
//!
//! [database]
//! backend = "postgres"
//! host = "localhost"
//! database = "warehouse"
//! user = "etl"
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 1000
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::relational::RelationalStore;
use crate::retry::RetryPolicy;
use crate::source::{DefaultFetcher, SourceFetcher};
use crate::stage::{LocalObjectStage, ObjectStage};

/// Where staged objects live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "s3" | "minio" => Ok(StorageBackend::S3),
            _ => Err(format!("Unknown storage backend: {}", s)),
        }
    }
}

/// Which relational database receives loads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    DuckDb,
    Postgres,
}

impl FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "duckdb" => Ok(DatabaseBackend::DuckDb),
            "postgres" | "postgresql" => Ok(DatabaseBackend::Postgres),
            _ => Err(format!("Unknown database backend: {}", s)),
        }
    }
}

/// Object storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Root directory for the local backend
    pub root: PathBuf,
    pub bucket: String,
    pub prefix: Option<String>,
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    /// Seconds to wait for a stage lock
    pub lock_timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: PathBuf::from("data/lake"),
            bucket: "lake".to_string(),
            prefix: None,
            endpoint_url: None,
            region: None,
            access_key: None,
            secret_key: None,
            lock_timeout_secs: 300,
        }
    }
}

/// Relational database settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub backend: DatabaseBackend,
    pub duckdb_path: String,
    pub host: Option<String>,
    pub port: u16,
    pub database: Option<String>,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::DuckDb,
            duckdb_path: "data/staging.duckdb".to_string(),
            host: None,
            port: 5432,
            database: None,
            user: None,
            password: None,
        }
    }
}

impl DatabaseSettings {
    /// Postgres connection parameters from the `PG_*` fields
    pub fn postgres_connection(&self) -> Result<PostgresConnection, PipelineError> {
        let require = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| PipelineError::Config(format!("database.{} is required for postgres", name)))
        };
        Ok(PostgresConnection {
            host: require(&self.host, "host")?,
            port: self.port,
            dbname: require(&self.database, "database")?,
            user: require(&self.user, "user")?,
            password: self.password.clone(),
        })
    }
}

/// Resolved Postgres connection parameters
///
/// Values are passed to the driver as separate fields, never joined into a
/// connection string, so they need no quoting. `Display` and `Debug` omit the
/// password.
#[derive(Clone, PartialEq, Eq)]
pub struct PostgresConnection {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
}

impl PostgresConnection {
    /// Driver configuration carrying every field, password included
    #[cfg(feature = "postgres-backend")]
    pub fn to_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user);
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }
}

impl fmt::Display for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.dbname)
    }
}

impl fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// HTTP client settings for source fetching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            user_agent: format!("mpdp/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// All runtime settings for a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineSettings {
    pub storage: StorageSettings,
    pub database: DatabaseSettings,
    pub retry: RetryPolicy,
    pub http: HttpSettings,
    /// Parallel datasets for batch runs; defaults to the CPU count
    pub workers: Option<usize>,
}

impl PipelineSettings {
    /// Read a TOML file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut settings = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read settings {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, PipelineError> {
        toml::from_str(raw).map_err(|e| PipelineError::Config(format!("invalid settings: {}", e)))
    }

    /// Override fields from environment variables
    ///
    /// `S3_ENDPOINT_URL`, `S3_ACCESS_KEY`, `S3_SECRET_KEY`, `PG_HOST`,
    /// `PG_PORT`, `PG_DATABASE`, `PG_USER`, `PG_PASSWORD`, plus
    /// `MPDP_STORAGE_BACKEND`, `MPDP_STORAGE_ROOT`, `MPDP_S3_BUCKET`,
    /// `MPDP_DATABASE_BACKEND`, `MPDP_DUCKDB_PATH` and `MPDP_WORKERS`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MPDP_STORAGE_BACKEND") {
            self.storage.backend = v.parse().map_err(PipelineError::Config)?;
        }
        if let Some(v) = get("MPDP_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(v) = get("MPDP_S3_BUCKET") {
            self.storage.bucket = v;
        }
        if let Some(v) = get("S3_ENDPOINT_URL") {
            self.storage.endpoint_url = Some(v);
        }
        if let Some(v) = get("S3_ACCESS_KEY") {
            self.storage.access_key = Some(v);
        }
        if let Some(v) = get("S3_SECRET_KEY") {
            self.storage.secret_key = Some(v);
        }

        if let Some(v) = get("MPDP_DATABASE_BACKEND") {
            self.database.backend = v.parse().map_err(PipelineError::Config)?;
        }
        if let Some(v) = get("MPDP_DUCKDB_PATH") {
            self.database.duckdb_path = v;
        }
        if let Some(v) = get("PG_HOST") {
            self.database.host = Some(v);
        }
        if let Some(v) = get("PG_PORT") {
            self.database.port = v
                .trim()
                .parse()
                .map_err(|_| PipelineError::Config(format!("PG_PORT is not a port number: {}", v)))?;
        }
        if let Some(v) = get("PG_DATABASE") {
            self.database.database = Some(v);
        }
        if let Some(v) = get("PG_USER") {
            self.database.user = Some(v);
        }
        if let Some(v) = get("PG_PASSWORD") {
            self.database.password = Some(v);
        }

        if let Some(v) = get("MPDP_WORKERS") {
            self.workers = Some(v.trim().parse().map_err(|_| {
                PipelineError::Config(format!("MPDP_WORKERS is not a number: {}", v))
            })?);
        }
        Ok(())
    }

    /// Check settings that would otherwise fail mid-run
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.workers == Some(0) {
            return Err(PipelineError::Config("workers must be at least 1".to_string()));
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.trim().is_empty() {
            return Err(PipelineError::Config(
                "storage.bucket is required for the s3 backend".to_string(),
            ));
        }
        if self.database.backend == DatabaseBackend::Postgres {
            self.database.postgres_connection()?;
        }
        Ok(())
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage.root = root.into();
        self
    }

    pub fn with_duckdb_path(mut self, path: impl Into<String>) -> Self {
        self.database.duckdb_path = path.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Open the configured object stage
    pub fn open_object_stage(&self) -> Result<Arc<dyn ObjectStage>, PipelineError> {
        let lock_timeout = Duration::from_secs(self.storage.lock_timeout_secs);
        match self.storage.backend {
            StorageBackend::Local => Ok(Arc::new(
                LocalObjectStage::new(&self.storage.root).with_lock_timeout(lock_timeout),
            )),
            #[cfg(feature = "s3")]
            StorageBackend::S3 => {
                use crate::stage::{S3ObjectStage, S3StageConfig};

                let mut config = S3StageConfig::new(&self.storage.bucket);
                config.prefix = self.storage.prefix.clone();
                config.region = self.storage.region.clone();
                config.endpoint_url = self.storage.endpoint_url.clone();
                config.access_key = self.storage.access_key.clone();
                config.secret_key = self.storage.secret_key.clone();
                Ok(Arc::new(
                    S3ObjectStage::connect(config)?.with_lock_timeout(lock_timeout),
                ))
            }
            #[cfg(not(feature = "s3"))]
            StorageBackend::S3 => Err(PipelineError::Config(
                "storage backend 's3' requires the s3 feature".to_string(),
            )),
        }
    }

    /// Open the configured relational store
    pub fn open_relational_store(&self) -> Result<Arc<dyn RelationalStore>, PipelineError> {
        let open_error = |e: crate::relational::RelationalError| {
            PipelineError::Config(format!("cannot open database: {}", e))
        };
        match self.database.backend {
            #[cfg(feature = "duckdb-backend")]
            DatabaseBackend::DuckDb => {
                if let Some(parent) = Path::new(&self.database.duckdb_path).parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent).map_err(|e| {
                            PipelineError::Config(format!(
                                "cannot create {}: {}",
                                parent.display(),
                                e
                            ))
                        })?;
                    }
                }
                let store = crate::relational::DuckDbStore::open(&self.database.duckdb_path)
                    .map_err(open_error)?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "duckdb-backend"))]
            DatabaseBackend::DuckDb => {
                let _ = open_error;
                Err(PipelineError::Config(
                    "database backend 'duckdb' requires the duckdb-backend feature".to_string(),
                ))
            }
            #[cfg(feature = "postgres-backend")]
            DatabaseBackend::Postgres => {
                let connection = self.database.postgres_connection()?;
                let store =
                    crate::relational::PostgresStore::connect(&connection).map_err(open_error)?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "postgres-backend"))]
            DatabaseBackend::Postgres => Err(PipelineError::Config(
                "database backend 'postgres' requires the postgres-backend feature".to_string(),
            )),
        }
    }

    /// Fetcher for file and (when enabled) HTTP sources
    pub fn fetcher(&self) -> Result<Arc<dyn SourceFetcher>, PipelineError> {
        let fetcher = DefaultFetcher::new(
            Duration::from_secs(self.http.timeout_secs),
            &self.http.user_agent,
        )
        .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Arc::new(fetcher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.storage.backend, StorageBackend::Local);
        assert_eq!(settings.storage.root, PathBuf::from("data/lake"));
        assert_eq!(settings.database.port, 5432);
        assert_eq!(settings.retry.max_attempts, 4);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let settings = PipelineSettings::from_toml_str(
            r#"
workers = 2

[storage]
backend = "s3"
bucket = "public-data"

[database]
backend = "postgres"
host = "db"
database = "warehouse"
user = "etl"

[retry]
max_attempts = 6
"#,
        )
        .unwrap();
        assert_eq!(settings.workers, Some(2));
        assert_eq!(settings.storage.backend, StorageBackend::S3);
        assert_eq!(settings.storage.bucket, "public-data");
        assert_eq!(settings.retry.max_attempts, 6);
        assert_eq!(settings.retry.base_delay_ms, 500);
        assert_eq!(
            settings.database.postgres_connection().unwrap().to_string(),
            "etl@db:5432/warehouse"
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = PipelineSettings::default();
        settings
            .apply_env(env(&[
                ("S3_ENDPOINT_URL", "http://minio:9000"),
                ("S3_ACCESS_KEY", "minio"),
                ("PG_HOST", "pg"),
                ("PG_PORT", "6543"),
                ("PG_PASSWORD", "secret"),
                ("MPDP_STORAGE_ROOT", "/var/lake"),
                ("MPDP_DATABASE_BACKEND", "postgres"),
                ("MPDP_WORKERS", "3"),
                ("PG_USER", ""),
            ]))
            .unwrap();
        assert_eq!(settings.storage.endpoint_url.as_deref(), Some("http://minio:9000"));
        assert_eq!(settings.storage.access_key.as_deref(), Some("minio"));
        assert_eq!(settings.storage.root, PathBuf::from("/var/lake"));
        assert_eq!(settings.database.backend, DatabaseBackend::Postgres);
        assert_eq!(settings.database.host.as_deref(), Some("pg"));
        assert_eq!(settings.database.port, 6543);
        assert_eq!(settings.database.user, None);
        assert_eq!(settings.workers, Some(3));

        // Missing database name and user
        assert!(matches!(settings.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_bad_env_values() {
        let mut settings = PipelineSettings::default();
        assert!(settings.apply_env(env(&[("PG_PORT", "abc")])).is_err());
        assert!(
            settings
                .apply_env(env(&[("MPDP_STORAGE_BACKEND", "ftp")]))
                .is_err()
        );
    }

    #[test]
    fn test_password_is_kept_whole_and_hidden() {
        let mut settings = PipelineSettings::default();
        settings
            .apply_env(env(&[
                ("MPDP_DATABASE_BACKEND", "postgres"),
                ("PG_HOST", "db"),
                ("PG_DATABASE", "mpdp"),
                ("PG_USER", "mpdp"),
                ("PG_PASSWORD", "s3cret tail' x"),
            ]))
            .unwrap();
        settings.validate().unwrap();

        let connection = settings.database.postgres_connection().unwrap();
        assert_eq!(connection.password.as_deref(), Some("s3cret tail' x"));
        for shown in [connection.to_string(), format!("{:?}", connection)] {
            assert!(!shown.contains("s3cret"), "{}", shown);
            assert!(!shown.contains("tail"), "{}", shown);
        }
    }

    #[cfg(feature = "postgres-backend")]
    #[test]
    fn test_driver_config_gets_raw_values() {
        let connection = PostgresConnection {
            host: "db".to_string(),
            port: 6543,
            dbname: "mpdp".to_string(),
            user: "etl".to_string(),
            password: Some("a b'c=d".to_string()),
        };
        let config = connection.to_config();
        assert_eq!(config.get_password(), Some("a b'c=d".as_bytes()));
        assert_eq!(config.get_user(), Some("etl"));
        assert_eq!(config.get_dbname(), Some("mpdp"));
        assert_eq!(config.get_ports(), &[6543]);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let settings = PipelineSettings::default().with_retry(RetryPolicy::new(0));
        assert!(settings.validate().is_err());
        assert!(PipelineSettings::default().with_workers(0).validate().is_err());
    }
}
