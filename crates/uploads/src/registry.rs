use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::multi::{MultiUpload, UploadPolicy};
use crate::single::{SingleUpload, StartError};
use crate::UploadStatusListener;

/// How often pending uploads are re-checked while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A registered upload: an aggregate or one of its children.
#[derive(Clone)]
pub enum UploadEntry {
    Multi(Arc<MultiUpload>),
    Single(Arc<SingleUpload>),
}

impl UploadEntry {
    /// Starts the upload with the given options. Aggregates reject the call;
    /// their children are started individually.
    pub fn start(&self, options: &HashMap<String, String>) -> Result<(), StartError> {
        match self {
            Self::Multi(multi) => Err(StartError::NotStartable(
                multi.correlation_id().to_string(),
            )),
            Self::Single(single) => single.start(options),
        }
    }

    /// Cancels the upload with a backend-supplied code and message.
    pub fn cancel(&self, code: &str, message: &str) {
        match self {
            Self::Multi(multi) => multi.cancel(code, message),
            Self::Single(single) => single.cancel(code, message),
        }
    }
}

pub(crate) struct RegistryShared {
    map: Mutex<HashMap<String, UploadEntry>>,
}

impl RegistryShared {
    /// Removes an upload; removing an aggregate also removes its children.
    /// No-op for unknown ids.
    pub(crate) fn remove(&self, correlation_id: &str) {
        let entry = self.map.lock().unwrap().get(correlation_id).cloned();
        let child_ids = match &entry {
            Some(UploadEntry::Multi(multi)) => multi.children_ids(),
            _ => Vec::new(),
        };

        let mut map = self.map.lock().unwrap();
        map.remove(correlation_id);
        for child_id in &child_ids {
            map.remove(child_id);
        }
    }
}

/// Thread-safe mapping of correlation ids to in-flight uploads.
///
/// The registry lock only guards map operations; aggregate locks are never
/// taken while it is held.
pub struct Uploads {
    shared: Arc<RegistryShared>,
}

impl Default for Uploads {
    fn default() -> Self {
        Self::new()
    }
}

impl Uploads {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                map: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a multi-file upload. One child upload is created per path,
    /// keyed `<correlation_id>#<n>` with 1-based `n`; the returned child ids
    /// preserve the input order.
    ///
    /// File sizes are gathered best-effort: when any path cannot be stat'ed
    /// the aggregate falls back to count-based progress.
    pub fn add_multi(
        &self,
        correlation_id: &str,
        paths: &[PathBuf],
        policy: UploadPolicy,
        listener: Arc<dyn UploadStatusListener>,
    ) -> Vec<String> {
        let multi = MultiUpload::new(
            correlation_id,
            paths.len(),
            policy,
            listener,
            Arc::downgrade(&self.shared),
        );

        let mut child_ids = Vec::with_capacity(paths.len());
        let mut sizes_known = true;

        for (index, path) in paths.iter().enumerate() {
            let child_id = format!("{}#{}", correlation_id, index + 1);
            let child = SingleUpload::new(&child_id, path.clone(), Arc::downgrade(&multi));

            let size = if sizes_known {
                match std::fs::metadata(path) {
                    Ok(metadata) => {
                        let size = metadata.len() as i64;
                        child.set_total_size(size);
                        Some(size)
                    }
                    Err(_) => {
                        warn!(file = %path.display(), "cannot get size of file");
                        sizes_known = false;
                        None
                    }
                }
            } else {
                None
            };
            multi.add_child(Arc::clone(&child), size);

            child_ids.push((child_id, child));
        }

        let mut map = self.shared.map.lock().unwrap();
        map.insert(
            correlation_id.to_string(),
            UploadEntry::Multi(Arc::clone(&multi)),
        );
        for (child_id, child) in &child_ids {
            map.insert(child_id.clone(), UploadEntry::Single(Arc::clone(child)));
        }

        child_ids.into_iter().map(|(id, _)| id).collect()
    }

    /// Returns the upload registered under `correlation_id`, if any.
    pub fn get(&self, correlation_id: &str) -> Option<UploadEntry> {
        self.shared.map.lock().unwrap().get(correlation_id).cloned()
    }

    /// Removes the upload registered under `correlation_id` along with its
    /// children. No-op for unknown ids.
    pub fn remove(&self, correlation_id: &str) {
        self.shared.remove(correlation_id);
    }

    /// Whether at least one aggregate is currently transferring.
    pub fn has_pending(&self) -> bool {
        let multis: Vec<Arc<MultiUpload>> = {
            let map = self.shared.map.lock().unwrap();
            map.values()
                .filter_map(|entry| match entry {
                    UploadEntry::Multi(multi) => Some(Arc::clone(multi)),
                    UploadEntry::Single(_) => None,
                })
                .collect()
        };

        multis.iter().any(|multi| multi.is_uploading())
    }

    /// Waits for pending uploads to finish within `timeout`, polling every
    /// two seconds. Aggregates still pending at the deadline are canceled.
    pub async fn stop(&self, timeout: Duration) {
        info!("waiting for pending uploads...");
        let deadline = tokio::time::Instant::now() + timeout;

        while self.has_pending() && tokio::time::Instant::now() < deadline {
            let remaining = deadline - tokio::time::Instant::now();
            tokio::time::sleep(remaining.min(DRAIN_POLL_INTERVAL)).await;
        }

        if self.has_pending() {
            info!("cancelling pending uploads...");
            let multis: Vec<Arc<MultiUpload>> = {
                let map = self.shared.map.lock().unwrap();
                map.values()
                    .filter_map(|entry| match entry {
                        UploadEntry::Multi(multi) => Some(Arc::clone(multi)),
                        UploadEntry::Single(_) => None,
                    })
                    .collect()
            };
            for multi in multis {
                multi.cancel("shutdown", "upload canceled on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use uplift_protocol::UploadStatus;

    struct NullListener;

    impl UploadStatusListener for NullListener {
        fn upload_status_updated(&self, _status: &UploadStatus) {}
    }

    struct RecordingListener(StdMutex<Vec<UploadStatus>>);

    impl UploadStatusListener for RecordingListener {
        fn upload_status_updated(&self, status: &UploadStatus) {
            self.0.lock().unwrap().push(status.clone());
        }
    }

    fn listener() -> Arc<dyn UploadStatusListener> {
        Arc::new(NullListener)
    }

    fn temp_files(dir: &std::path::Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                std::fs::write(&path, name.as_bytes()).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn child_ids_preserve_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_files(dir.path(), &["a.txt", "b.txt", "c.txt"]);

        let uploads = Uploads::new();
        let ids = uploads.add_multi("u-1", &paths, UploadPolicy::default(), listener());
        assert_eq!(ids, vec!["u-1#1", "u-1#2", "u-1#3"]);
    }

    #[test]
    fn get_finds_aggregate_and_children() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_files(dir.path(), &["a.txt"]);

        let uploads = Uploads::new();
        uploads.add_multi("u-1", &paths, UploadPolicy::default(), listener());

        assert!(matches!(uploads.get("u-1"), Some(UploadEntry::Multi(_))));
        assert!(matches!(uploads.get("u-1#1"), Some(UploadEntry::Single(_))));
        assert!(uploads.get("u-2").is_none());
    }

    #[test]
    fn remove_aggregate_removes_children() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_files(dir.path(), &["a.txt", "b.txt"]);

        let uploads = Uploads::new();
        uploads.add_multi("u-1", &paths, UploadPolicy::default(), listener());
        uploads.remove("u-1");

        assert!(uploads.get("u-1").is_none());
        assert!(uploads.get("u-1#1").is_none());
        assert!(uploads.get("u-1#2").is_none());
    }

    #[test]
    fn remove_child_leaves_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_files(dir.path(), &["a.txt", "b.txt"]);

        let uploads = Uploads::new();
        uploads.add_multi("u-1", &paths, UploadPolicy::default(), listener());
        uploads.remove("u-1#1");

        assert!(uploads.get("u-1#1").is_none());
        assert!(uploads.get("u-1").is_some());
        assert!(uploads.get("u-1#2").is_some());
    }

    #[test]
    fn remove_unknown_is_noop() {
        let uploads = Uploads::new();
        uploads.remove("nope");
    }

    #[test]
    fn aggregate_cannot_be_started() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_files(dir.path(), &["a.txt"]);

        let uploads = Uploads::new();
        uploads.add_multi("u-1", &paths, UploadPolicy::default(), listener());

        let err = uploads
            .get("u-1")
            .unwrap()
            .start(&HashMap::new())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "multi-file upload 'u-1' cannot be started - start the individual uploads"
        );
    }

    #[test]
    fn missing_file_switches_to_count_based_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = temp_files(dir.path(), &["a.txt"]);
        paths.push(dir.path().join("missing.txt"));

        let uploads = Uploads::new();
        uploads.add_multi("u-1", &paths, UploadPolicy::default(), listener());

        let Some(UploadEntry::Multi(multi)) = uploads.get("u-1") else {
            panic!("aggregate not registered");
        };
        assert!(!multi.byte_accounting());
    }

    #[test]
    fn no_pending_before_any_start() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_files(dir.path(), &["a.txt"]);

        let uploads = Uploads::new();
        uploads.add_multi("u-1", &paths, UploadPolicy::default(), listener());
        assert!(!uploads.has_pending());
    }

    #[tokio::test]
    async fn stop_without_pending_returns_quickly() {
        let uploads = Uploads::new();
        let started = std::time::Instant::now();
        uploads.stop(Duration::from_secs(30)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stop_cancels_leftovers_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_files(dir.path(), &["a.txt"]);

        let uploads = Uploads::new();
        let recorder = Arc::new(RecordingListener(StdMutex::new(Vec::new())));
        uploads.add_multi("u-1", &paths, UploadPolicy::default(), recorder.clone());

        // Force the aggregate into UPLOADING without a live transfer.
        let Some(UploadEntry::Multi(multi)) = uploads.get("u-1") else {
            panic!("aggregate not registered");
        };
        let Some(UploadEntry::Single(child)) = uploads.get("u-1#1") else {
            panic!("child not registered");
        };
        multi.upload_started(&child, HashMap::new());

        let started = std::time::Instant::now();
        uploads.stop(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(3));

        let events = recorder.0.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.state, uplift_protocol::UploadState::Canceled);
        assert_eq!(last.status_code, "shutdown");
        assert!(uploads.get("u-1").is_none());
    }
}
