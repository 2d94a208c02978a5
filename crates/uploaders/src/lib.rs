//! Storage backends for pushing a single file to a remote destination.
//!
//! Three providers are supported: generic HTTP (pre-signed PUT/POST), AWS
//! S3-compatible object storage, and Azure Blob via a shared access
//! signature. The provider is selected through the `storage.provider` start
//! option; the generic HTTP backend is the default.

mod aws;
mod azure;
mod checksum;
mod http;
mod options;

pub use aws::AwsUploader;
pub use azure::AzureUploader;
pub use checksum::{compute_md5, md5_base64};
pub use http::HttpUploader;
pub use options::extract_dictionary;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Option key selecting the storage backend.
pub const STORAGE_PROVIDER: &str = "storage.provider";

/// Storage provider names accepted in [`STORAGE_PROVIDER`].
pub const PROVIDER_HTTP: &str = "generic";
pub const PROVIDER_AWS: &str = "aws";
pub const PROVIDER_AZURE: &str = "azure";

/// Cumulative-bytes progress callback.
///
/// Invoked from the transfer task; may fire any number of times (including
/// never) and is not guaranteed to reach the file size before completion.
pub type ProgressCallback = Arc<dyn Fn(i64) + Send + Sync>;

/// Boxed future returned by [`Uploader::upload`].
pub type UploadFuture<'a> = Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send + 'a>>;

/// An open file queued for upload, together with the path it was opened
/// from. The path is only consulted when a backend derives an object name.
pub struct SourceFile {
    pub path: PathBuf,
    pub file: tokio::fs::File,
}

impl SourceFile {
    /// Opens `path` for reading.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await?;
        Ok(Self { path, file })
    }

    /// Base name used when a backend needs an object or blob name.
    pub fn base_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A single capability: push one open file to a destination.
pub trait Uploader: Send + Sync + std::fmt::Debug {
    /// Streams `source` to the destination, reporting cumulative progress.
    ///
    /// Cancelling `cancel` aborts the transfer with
    /// [`UploadError::Canceled`]; a transfer whose final write is already in
    /// flight may still complete.
    fn upload(
        &self,
        source: SourceFile,
        use_checksum: bool,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> UploadFuture<'_>;
}

/// Errors produced by the uploader backends.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("required parameter '{0}' missing or empty")]
    MissingParameter(&'static str),

    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("unknown storage provider '{0}'")]
    UnknownProvider(String),

    #[error("upload failed - code: {code}, status: {status}")]
    Status { code: u16, status: String },

    #[error("upload canceled")]
    Canceled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("S3 error: {0}")]
    S3(String),
}

/// Selects an uploader from the `storage.provider` start option.
///
/// `server_cert` optionally points to a PEM certificate used by the generic
/// HTTP backend to validate the storage endpoint.
pub fn for_options(
    options: &HashMap<String, String>,
    server_cert: Option<&str>,
) -> Result<Box<dyn Uploader>, UploadError> {
    let provider = options.get(STORAGE_PROVIDER).map(|p| p.to_lowercase());

    match provider.as_deref() {
        None | Some(PROVIDER_HTTP) => Ok(Box::new(HttpUploader::new(options, server_cert)?)),
        Some(PROVIDER_AWS) => Ok(Box::new(AwsUploader::new(options)?)),
        Some(PROVIDER_AZURE) => Ok(Box::new(AzureUploader::new(options)?)),
        Some(other) => Err(UploadError::UnknownProvider(other.to_string())),
    }
}
