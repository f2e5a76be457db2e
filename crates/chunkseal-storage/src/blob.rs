//! Blob store for sealed chunk bytes

use std::path::Path;

use opendal::Operator;
use tracing::warn;

use chunkseal_core::config::StorageConfig;
use chunkseal_core::{BlobBackend, S3Settings, SealError, SealResult};

/// Access key pair for an S3 backend.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Credentials {
    /// Read both keys from the environment variables named in `settings`.
    pub fn from_env(settings: &S3Settings) -> SealResult<Self> {
        let read = |name: &str| {
            std::env::var(name).map_err(|_| {
                SealError::Config(format!("S3 credential variable {name} is not set"))
            })
        };
        Ok(Self {
            access_key_id: read(&settings.access_key_env)?,
            secret_access_key: read(&settings.secret_key_env)?,
        })
    }
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

fn s3_operator(settings: &S3Settings, creds: &S3Credentials) -> SealResult<Operator> {
    if settings.endpoint.starts_with("http://") {
        if settings.enforce_tls {
            return Err(SealError::Config(format!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled",
                settings.endpoint
            )));
        }
        warn!(
            endpoint = %settings.endpoint,
            "S3 endpoint uses plaintext HTTP; sealed chunks are encrypted but credentials are not"
        );
    }

    let builder = opendal::services::S3::default()
        .endpoint(&settings.endpoint)
        .region(&settings.region)
        .bucket(&settings.bucket)
        .access_key_id(&creds.access_key_id)
        .secret_access_key(&creds.secret_access_key);

    Ok(Operator::new(builder)
        .map_err(|e| SealError::Config(format!("creating S3 operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(opendal::layers::RetryLayer::new().with_max_times(5).with_jitter())
        .finish())
}

/// Sealed chunk bytes keyed by storage locator.
#[derive(Debug, Clone)]
pub struct BlobStore {
    op: Operator,
}

impl BlobStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    /// Volatile in-process store.
    pub fn memory() -> SealResult<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .map_err(|e| SealError::Config(format!("creating memory operator: {e}")))?
            .finish();
        Ok(Self::new(op))
    }

    /// Local directory store rooted at `root`.
    pub fn fs(root: &Path) -> SealResult<Self> {
        let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
        let op = Operator::new(builder)
            .map_err(|e| SealError::Config(format!("creating fs operator: {e}")))?
            .layer(opendal::layers::LoggingLayer::default())
            .finish();
        Ok(Self::new(op))
    }

    /// S3-compatible bucket with request logging and bounded retries.
    pub fn s3(settings: &S3Settings, creds: &S3Credentials) -> SealResult<Self> {
        s3_operator(settings, creds).map(Self::new)
    }

    /// Open the backend named by `storage.backend`.
    pub fn from_config(storage: &StorageConfig) -> SealResult<Self> {
        match &storage.backend {
            BlobBackend::Memory => Self::memory(),
            BlobBackend::Fs { root } => Self::fs(root),
            BlobBackend::S3(settings) => Self::s3(settings, &S3Credentials::from_env(settings)?),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    pub async fn put(&self, locator: &str, bytes: Vec<u8>) -> SealResult<()> {
        self.op
            .write(locator, bytes)
            .await
            .map(|_| ())
            .map_err(|e| SealError::StorageWrite(format!("put {locator}: {e}")))
    }

    pub async fn get(&self, locator: &str) -> SealResult<Vec<u8>> {
        self.op
            .read(locator)
            .await
            .map(|buf| buf.to_vec())
            .map_err(|e| SealError::StorageRead(format!("get {locator}: {e}")))
    }

    pub async fn delete(&self, locator: &str) -> SealResult<()> {
        self.op
            .delete(locator)
            .await
            .map_err(|e| SealError::StorageDelete(format!("delete {locator}: {e}")))
    }

    pub async fn exists(&self, locator: &str) -> SealResult<bool> {
        self.op
            .exists(locator)
            .await
            .map_err(|e| SealError::StorageRead(format!("stat {locator}: {e}")))
    }

    /// Reachability check: list the root.
    pub async fn check_health(&self) -> SealResult<()> {
        self.op
            .list("/")
            .await
            .map(|_| ())
            .map_err(|e| SealError::StorageRead(format!("storage health check failed: {e}")))
    }
}
