use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use uplift_protocol::INFO_PREFIX;
use uplift_uploaders::{
    extract_dictionary, ProgressCallback, SourceFile, UploadError, Uploader,
};

use crate::multi::MultiUpload;

/// Errors returned when starting an upload.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("upload '{0}' already started")]
    AlreadyStarted(String),

    #[error("multi-file upload '{0}' cannot be started - start the individual uploads")]
    NotStartable(String),

    #[error("upload '{0}' is no longer registered")]
    Detached(String),

    #[error(transparent)]
    Uploader(#[from] UploadError),
}

/// One file push bound to a parent aggregate.
///
/// The parent reference is weak: the registry owns both records, and a child
/// that outlives its aggregate simply stops reporting.
pub struct SingleUpload {
    correlation_id: String,
    file_path: PathBuf,
    parent: Weak<MultiUpload>,
    started: AtomicBool,
    cancel: CancellationToken,
    bytes_transferred: AtomicI64,
    total_size_bytes: AtomicI64,
}

impl SingleUpload {
    pub(crate) fn new(
        correlation_id: &str,
        file_path: PathBuf,
        parent: Weak<MultiUpload>,
    ) -> Arc<Self> {
        Arc::new(Self {
            correlation_id: correlation_id.to_string(),
            file_path,
            parent,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            bytes_transferred: AtomicI64::new(0),
            total_size_bytes: AtomicI64::new(0),
        })
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub(crate) fn set_total_size(&self, size: i64) {
        self.total_size_bytes.store(size, Ordering::Release);
    }

    pub(crate) fn total_size_bytes(&self) -> i64 {
        self.total_size_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn bytes_transferred(&self) -> i64 {
        self.bytes_transferred.load(Ordering::Acquire)
    }

    /// Starts the transfer with the given `start` operation options.
    ///
    /// The compare-and-swap on the started flag makes the transfer
    /// single-flight: exactly one caller wins, every other call fails.
    pub fn start(
        self: &Arc<Self>,
        options: &HashMap<String, String>,
    ) -> Result<(), StartError> {
        let parent = self
            .parent
            .upgrade()
            .ok_or_else(|| StartError::Detached(self.correlation_id.clone()))?;

        let uploader =
            uplift_uploaders::for_options(options, parent.policy().server_cert.as_deref())?;

        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StartError::AlreadyStarted(self.correlation_id.clone()));
        }

        let info = extract_dictionary(options, INFO_PREFIX);
        parent.upload_started(self, info);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(parent, uploader).await;
        });

        Ok(())
    }

    async fn run(self: &Arc<Self>, parent: Arc<MultiUpload>, uploader: Box<dyn Uploader>) {
        let use_checksum = parent.policy().use_checksum;
        let delete_uploaded = parent.policy().delete_uploaded;
        let progress = self.progress_callback(&parent);

        let result = match SourceFile::open(&self.file_path).await {
            Ok(source) => {
                uploader
                    .upload(source, use_checksum, progress, self.cancel.clone())
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Err(e) => parent.upload_failed(self, &e.to_string()),
            Ok(()) => {
                parent.upload_finished(self);

                if delete_uploaded {
                    match tokio::fs::remove_file(&self.file_path).await {
                        Ok(()) => {
                            info!(file = %self.file_path.display(), "uploaded file deleted");
                        }
                        Err(e) => {
                            error!(
                                file = %self.file_path.display(),
                                "failed to delete uploaded file: {e}"
                            );
                        }
                    }
                }
            }
        }
    }

    fn progress_callback(self: &Arc<Self>, parent: &Arc<MultiUpload>) -> ProgressCallback {
        let this = Arc::clone(self);
        let parent = Arc::clone(parent);

        Arc::new(move |cumulative| {
            if !parent.byte_accounting() {
                return;
            }
            if this.total_size_bytes.load(Ordering::Acquire) == 0 && cumulative != 0 {
                warn!(
                    upload = %this,
                    bytes = cumulative,
                    "non-zero transferred bytes reported for an empty file"
                );
                return;
            }

            let previous = this.bytes_transferred.swap(cumulative, Ordering::AcqRel);
            let delta = cumulative - previous;
            if delta != 0 {
                parent.change_progress(delta);
            }
        })
    }

    /// Cancels this upload on behalf of the backend; the reason propagates to
    /// the aggregate status.
    pub fn cancel(&self, code: &str, message: &str) {
        self.internal_cancel();

        if let Some(parent) = self.parent.upgrade() {
            parent.upload_canceled(&self.correlation_id, code, message);
        }
    }

    /// Aborts the in-flight transfer without touching the aggregate status.
    pub(crate) fn internal_cancel(&self) {
        self.cancel.cancel();
    }
}

impl fmt::Display for SingleUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[correlationID: {}, file: {}]",
            self.correlation_id,
            self.file_path.display()
        )
    }
}
