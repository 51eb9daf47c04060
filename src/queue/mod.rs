mod callbacks;
mod engine;
mod errors;
mod manager;
mod manager_worker;
mod network;
mod payload;
mod persistence;
mod task;
mod traits;
pub(crate) mod types;

pub use callbacks::UploadCallbacks;
pub use engine::TransferHandle;
pub use errors::{PersistenceError, QueueError, Result, TransferError};
pub use manager::{FilteredEventReceiver, UploadQueue, UploadQueueBuilder, UploadQueueHandle};
pub use network::{Connectivity, NetworkMonitor};
pub use payload::FilePayload;
pub use persistence::{
    FileStateStore,
    MemoryStateStore,
    SessionEntry,
    StateStore,
    QUEUE_SNAPSHOT_KEY,
    SESSIONS_KEY,
};
pub use task::{
    UploadTask,
    STAGE_AUTHORIZING,
    STAGE_AWAITING_FILE,
    STAGE_COMPLETE,
    STAGE_FAILED,
    STAGE_HASHING,
    STAGE_PAUSED,
    STAGE_QUEUED,
    STAGE_RETRYING,
    STAGE_UPLOADING,
    STAGE_VERIFYING,
};
pub use traits::{
    AuthorizationRequest,
    Clock,
    IntegrityVerifier,
    ResumableTransport,
    SignedUpload,
    SignedUrlProvider,
    SystemClock,
    UploadAuthorization,
    VerificationOutcome,
    VerificationRequest,
};
pub use types::{DuplicateSkipped, EnqueueReport, QueueConfig, TaskId, UploadEvent, UploadStatus};
