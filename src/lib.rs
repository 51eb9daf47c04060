pub mod backend;
pub mod config;
pub mod logging;
pub mod queue;
pub mod tus;
pub mod utils;

// 重新导出常用类型
pub use backend::{HttpIntegrityVerifier, HttpSignedUrlProvider};
pub use config::{AppConfig, ConfigError};
pub use queue::{
    FilePayload,
    NetworkMonitor,
    QueueConfig,
    QueueError,
    TaskId,
    TransferError,
    UploadCallbacks,
    UploadEvent,
    UploadQueue,
    UploadQueueBuilder,
    UploadQueueHandle,
    UploadStatus,
    UploadTask,
};
pub use tus::TusClient;
pub use utils::RetryPolicy;
