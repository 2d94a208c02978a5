//! Upload lifecycle engine: the event queue, the periodic executor, the
//! upload registry and the per-upload state machines behind the uploadable
//! feature.
//!
//! The engine owns in-flight multi-file uploads and their children, tracks
//! progress, propagates failures and cancellations, and serializes every
//! status change into an ordered outbound event stream.

mod events;
mod executor;
mod multi;
mod registry;
mod ring;
mod single;

pub use events::EventsQueue;
pub use executor::{ExecutorError, PeriodicExecutor, Task};
pub use multi::{MultiUpload, UploadPolicy};
pub use registry::{UploadEntry, Uploads};
pub use ring::RingBuffer;
pub use single::{SingleUpload, StartError};

use uplift_protocol::UploadStatus;

/// Listener notified on changes in upload status.
///
/// Implementations receive a snapshot and must not block; the engine invokes
/// the listener while holding the owning aggregate's lock, which is what
/// makes the per-aggregate event order total.
pub trait UploadStatusListener: Send + Sync + 'static {
    fn upload_status_updated(&self, status: &UploadStatus);
}
