//! Source locators and fetchers

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Where a dataset's raw bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// `http://` or `https://` URL
    Http(String),
    /// Local file, from `file://` or a plain path
    File(PathBuf),
}

impl SourceLocator {
    pub fn parse(locator: &str) -> Result<Self, FetchError> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(FetchError::InvalidLocator("empty source".to_string()));
        }
        let lower = locator.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            if locator.split("://").nth(1).is_none_or(|rest| rest.is_empty()) {
                return Err(FetchError::InvalidLocator(format!("{} has no host", locator)));
            }
            return Ok(SourceLocator::Http(locator.to_string()));
        }
        if let Some(path) = locator.strip_prefix("file://") {
            if path.is_empty() {
                return Err(FetchError::InvalidLocator(format!("{} has no path", locator)));
            }
            return Ok(SourceLocator::File(PathBuf::from(path)));
        }
        if let Some((scheme, _)) = locator.split_once("://") {
            return Err(FetchError::InvalidLocator(format!(
                "unsupported scheme '{}' in {}",
                scheme, locator
            )));
        }
        Ok(SourceLocator::File(PathBuf::from(locator)))
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Http(url) => write!(f, "{}", url),
            SourceLocator::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}

/// Errors raised while fetching a source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("invalid source locator: {0}")]
    InvalidLocator(String),

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("cannot read {path}: {reason}")]
    Io {
        path: String,
        reason: String,
        retryable: bool,
    },

    #[error("{0}")]
    Unsupported(String),
}

impl FetchError {
    /// Timeouts, connection failures, 5xx, 408 and 429 are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            FetchError::Io { retryable, .. } => *retryable,
            FetchError::InvalidLocator(_) | FetchError::Unsupported(_) => false,
        }
    }
}

/// Retrieves the raw bytes behind a locator
pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError>;
}

/// Reads `file://` and path locators
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileFetcher;

impl SourceFetcher for LocalFileFetcher {
    fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
        match locator {
            SourceLocator::File(path) => fs::read(path).map_err(|e| FetchError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
                retryable: !matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ),
            }),
            SourceLocator::Http(url) => Err(FetchError::Unsupported(format!(
                "{} is not a local file",
                url
            ))),
        }
    }
}

/// Blocking HTTP client for `http(s)://` locators
#[cfg(feature = "http-source")]
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http-source")]
impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::Unsupported(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http-source")]
impl SourceFetcher for HttpFetcher {
    fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
        let SourceLocator::Http(url) = locator else {
            return Err(FetchError::Unsupported(format!("{} is not an HTTP source", locator)));
        };
        let response = self.client.get(url).send().map_err(|e| FetchError::Transport {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.clone(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().map_err(|e| FetchError::Transport {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

/// Dispatches on the locator kind
pub struct DefaultFetcher {
    #[cfg(feature = "http-source")]
    http: HttpFetcher,
    file: LocalFileFetcher,
}

impl DefaultFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        #[cfg(not(feature = "http-source"))]
        let _ = (timeout, user_agent);
        Ok(Self {
            #[cfg(feature = "http-source")]
            http: HttpFetcher::new(timeout, user_agent)?,
            file: LocalFileFetcher,
        })
    }
}

impl SourceFetcher for DefaultFetcher {
    fn fetch(&self, locator: &SourceLocator) -> Result<Vec<u8>, FetchError> {
        match locator {
            SourceLocator::File(_) => self.file.fetch(locator),
            #[cfg(feature = "http-source")]
            SourceLocator::Http(_) => self.http.fetch(locator),
            #[cfg(not(feature = "http-source"))]
            SourceLocator::Http(url) => Err(FetchError::Unsupported(format!(
                "{} needs the http-source feature",
                url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_locators() {
        assert_eq!(
            SourceLocator::parse("https://data.gouv.fr/guides.txt").unwrap(),
            SourceLocator::Http("https://data.gouv.fr/guides.txt".to_string())
        );
        assert_eq!(
            SourceLocator::parse("file:///srv/guides.txt").unwrap(),
            SourceLocator::File(PathBuf::from("/srv/guides.txt"))
        );
        assert_eq!(
            SourceLocator::parse("data/guides.txt").unwrap(),
            SourceLocator::File(PathBuf::from("data/guides.txt"))
        );
        assert!(SourceLocator::parse("").is_err());
        assert!(SourceLocator::parse("ftp://host/file").is_err());
        assert!(SourceLocator::parse("https://").is_err());
    }

    #[test]
    fn test_retryable_classification() {
        let status = |status| FetchError::Status {
            url: "u".to_string(),
            status,
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(
            FetchError::Transport {
                url: "u".to_string(),
                reason: "timeout".to_string()
            }
            .is_retryable()
        );
        assert!(!FetchError::InvalidLocator("x".to_string()).is_retryable());
    }

    #[test]
    fn test_local_fetch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raw.txt");
        fs::write(&path, b"bytes").unwrap();

        let fetcher = LocalFileFetcher;
        assert_eq!(fetcher.fetch(&SourceLocator::File(path)).unwrap(), b"bytes");

        let missing = fetcher
            .fetch(&SourceLocator::File(dir.path().join("missing.txt")))
            .unwrap_err();
        assert!(!missing.is_retryable());
    }
}
