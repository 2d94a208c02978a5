use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tracing::{error, info, warn};

use uplift_protocol::{UploadState, UploadStatus};

use crate::registry::RegistryShared;
use crate::single::SingleUpload;
use crate::UploadStatusListener;

/// Sentinel: at least one file size could not be determined, so progress is
/// reported from the count of finished files instead of bytes.
pub(crate) const SIZE_UNKNOWN: i64 = -1;

/// Policy flags captured when an aggregate upload is created.
#[derive(Debug, Clone, Default)]
pub struct UploadPolicy {
    /// Delete source files after a successful upload.
    pub delete_uploaded: bool,
    /// Attach an MD5 checksum to each transfer.
    pub use_checksum: bool,
    /// PEM certificate path used to validate the storage endpoint.
    pub server_cert: Option<String>,
}

/// A multi-file upload owning one cloud-facing correlation id and a set of
/// per-file children.
///
/// All status transitions happen under the aggregate's own lock, so the
/// events each aggregate emits form a total order. The registry lock is
/// never taken while this lock is held.
pub struct MultiUpload {
    correlation_id: String,
    total_count: usize,
    policy: UploadPolicy,
    listener: Arc<dyn UploadStatusListener>,
    registry: Weak<RegistryShared>,
    state: Mutex<MultiState>,
}

struct MultiState {
    children: HashMap<String, Arc<SingleUpload>>,
    status: Option<UploadStatus>,
    total_bytes_transferred: i64,
    total_size_bytes: i64,
}

impl MultiUpload {
    pub(crate) fn new(
        correlation_id: &str,
        total_count: usize,
        policy: UploadPolicy,
        listener: Arc<dyn UploadStatusListener>,
        registry: Weak<RegistryShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            correlation_id: correlation_id.to_string(),
            total_count,
            policy,
            listener,
            registry,
            state: Mutex::new(MultiState {
                children: HashMap::new(),
                status: None,
                total_bytes_transferred: 0,
                total_size_bytes: 0,
            }),
        })
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub(crate) fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Current status snapshot, `None` until the first child starts.
    pub fn status(&self) -> Option<UploadStatus> {
        self.state.lock().unwrap().status.clone()
    }

    /// Whether the aggregate is currently transferring.
    pub(crate) fn is_uploading(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .status
            .as_ref()
            .is_some_and(|s| s.state == UploadState::Uploading)
    }

    /// Whether per-byte progress accounting is enabled.
    pub(crate) fn byte_accounting(&self) -> bool {
        self.state.lock().unwrap().total_size_bytes != SIZE_UNKNOWN
    }

    pub(crate) fn add_child(&self, child: Arc<SingleUpload>, size: Option<i64>) {
        let mut state = self.state.lock().unwrap();
        match size {
            Some(size) if state.total_size_bytes != SIZE_UNKNOWN => {
                state.total_size_bytes += size;
            }
            Some(_) => {}
            None => state.total_size_bytes = SIZE_UNKNOWN,
        }
        state
            .children
            .insert(child.correlation_id().to_string(), child);
    }

    pub(crate) fn children_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().children.keys().cloned().collect()
    }

    /// First-child hook: moves the aggregate to UPLOADING and records the
    /// `info` extracted from the start options. Sibling starts that observe
    /// a non-pending status leave it untouched.
    pub(crate) fn upload_started(&self, child: &SingleUpload, info: HashMap<String, String>) {
        info!(upload = %child, "upload started");

        let mut state = self.state.lock().unwrap();
        if state
            .status
            .as_ref()
            .is_some_and(|s| s.state != UploadState::Pending)
        {
            return;
        }

        let status = UploadStatus {
            correlation_id: self.correlation_id.clone(),
            state: UploadState::Uploading,
            start_time: Some(Utc::now()),
            progress: 0,
            info,
            ..Default::default()
        };
        self.notify(&status);
        state.status = Some(status);
    }

    /// Accounts `delta` newly transferred bytes and emits a status event when
    /// the integer percentage changed.
    pub(crate) fn change_progress(&self, delta: i64) {
        let mut state = self.state.lock().unwrap();

        if state.total_size_bytes == 0 {
            if delta != 0 {
                warn!(
                    bytes = delta,
                    "non-zero transferred bytes reported on an empty file set"
                );
            }
            return;
        }
        if state.total_size_bytes == SIZE_UNKNOWN {
            return;
        }

        state.total_bytes_transferred += delta;
        let percent = ((100 * state.total_bytes_transferred) / state.total_size_bytes) as i32;

        // In-flight transfers may still report after a terminal transition;
        // the terminal event must stay the last one observed.
        if let Some(status) = state.status.as_mut() {
            if !status.finished() && status.progress != percent {
                status.progress = percent;
                let snapshot = status.clone();
                self.notify(&snapshot);
            }
        }
    }

    /// A child completed successfully.
    pub(crate) fn upload_finished(&self, child: &SingleUpload) {
        info!(upload = %child, "upload finished");

        self.detach_child(child.correlation_id());

        let done = {
            let mut state = self.state.lock().unwrap();
            let mut status = match state.status.take() {
                Some(status) => status,
                None => return,
            };
            if status.finished() {
                state.status = Some(status);
                return;
            }

            let remaining = state.children.len();
            if remaining == 0 {
                status.progress = 100;
                status.state = UploadState::Success;
                status.end_time = Some(Utc::now());
            } else if state.total_size_bytes != SIZE_UNKNOWN && state.total_size_bytes != 0 {
                // A finished child counts for exactly its size, even when its
                // uploader under-reported progress along the way.
                state.total_bytes_transferred +=
                    child.total_size_bytes() - child.bytes_transferred();
                status.progress =
                    ((100 * state.total_bytes_transferred) / state.total_size_bytes) as i32;
            } else {
                let uploaded = (self.total_count - remaining) as i64;
                status.progress = ((100 * uploaded) / self.total_count as i64) as i32;
            }

            self.notify(&status);
            state.status = Some(status);
            remaining == 0
        };

        if done {
            self.remove_from_registry(&self.correlation_id);
        }
    }

    /// A child failed: the aggregate fails and surviving children are
    /// canceled.
    pub(crate) fn upload_failed(&self, child: &SingleUpload, error: &str) {
        error!(upload = %child, "upload failed: {error}");

        self.detach_child(child.correlation_id());

        let done = {
            let mut state = self.state.lock().unwrap();
            match state.status.as_mut() {
                Some(status) if !status.finished() => {
                    status.state = UploadState::Failed;
                    status.end_time = Some(Utc::now());
                    status.message = error.to_string();
                    let snapshot = status.clone();
                    self.notify(&snapshot);
                    false
                }
                _ => true,
            }
        };

        if !done {
            self.cancel_children();
            self.remove_from_registry(&self.correlation_id);
        }
    }

    /// A child was canceled by the backend; the reason propagates to the
    /// aggregate.
    pub(crate) fn upload_canceled(&self, child_id: &str, code: &str, message: &str) {
        self.detach_child(child_id);
        self.cancel(code, message);
    }

    /// Cancels the whole aggregate with a backend-supplied code and message.
    pub fn cancel(&self, code: &str, message: &str) {
        info!(
            correlation_id = %self.correlation_id,
            code, message, "multi-upload canceled"
        );

        let done = {
            let mut state = self.state.lock().unwrap();
            let correlation_id = self.correlation_id.clone();
            let status = state.status.get_or_insert_with(|| UploadStatus {
                correlation_id,
                ..Default::default()
            });
            if status.finished() {
                true
            } else {
                status.state = UploadState::Canceled;
                status.status_code = code.to_string();
                status.message = message.to_string();
                status.end_time = Some(Utc::now());
                let snapshot = status.clone();
                self.notify(&snapshot);
                false
            }
        };

        if !done {
            self.cancel_children();
            self.remove_from_registry(&self.correlation_id);
        }
    }

    /// Aborts every surviving child transfer without emitting status events.
    pub(crate) fn cancel_children(&self) {
        let children: Vec<Arc<SingleUpload>> = {
            let state = self.state.lock().unwrap();
            state.children.values().cloned().collect()
        };

        for child in children {
            child.internal_cancel();
            info!(upload = %child, "upload canceled");
        }
    }

    fn notify(&self, status: &UploadStatus) {
        self.listener.upload_status_updated(status);
    }

    fn detach_child(&self, child_id: &str) {
        {
            self.state.lock().unwrap().children.remove(child_id);
        }
        self.remove_from_registry(child_id);
    }

    fn remove_from_registry(&self, id: &str) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(id);
        }
    }
}
