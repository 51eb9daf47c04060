use thiserror::Error;
use super::types::{TaskId, UploadStatus};

/// 单次传输过程中产生的错误（引擎、tus 客户端、后端协作方）
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("HTTP Request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: status code {status_code}, message: {message}")]
    Server {
        status_code: u16,
        message: String,
    },

    #[error("Upload authorization expired")]
    AuthExpired,

    #[error("Upload session no longer exists: {0}")]
    SessionGone(String),

    #[error("Authorization request failed: {0}")]
    Authorization(String),

    #[error("Integrity check failed: {0}")]
    IntegrityMismatch(String),

    #[error("Integrity verification request failed: {0}")]
    Verification(String),

    #[error("Upload incomplete expected: {expected}, actual: {actual}")]
    UploadIncomplete {
        expected: u64,
        actual: u64,
    },

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Param error: {0}")]
    ParamError(String),

    #[error("Upload was cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status_code,
            message: message.into(),
        }
    }

    /// 是否属于可按退避策略重试的瞬时错误
    ///
    /// 完整性校验失败不在此处判断，由 `IntegrityFailurePolicy` 决定。
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::ParamError(_)
            | TransferError::Cancelled
            | TransferError::Authorization(_)
            | TransferError::Verification(_) => false,
            TransferError::Server { status_code, .. } => {
                *status_code >= 500 || *status_code == 408 || *status_code == 429
            }
            _ => true,
        }
    }

    pub fn is_integrity_mismatch(&self) -> bool {
        matches!(self, TransferError::IntegrityMismatch(_))
    }
}

/// 调用方 API 返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid status transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: UploadStatus,
        to: UploadStatus,
    },

    #[error("File payload missing for task {0}, reattach the file first")]
    PayloadMissing(TaskId),

    #[error("Supplied file does not match task {task_id}: {reason}")]
    PayloadMismatch {
        task_id: TaskId,
        reason: String,
    },

    #[error("Task {task_id} is {status:?} and cannot be evicted")]
    NotEvictable {
        task_id: TaskId,
        status: UploadStatus,
    },

    #[error("Upload queue shut down")]
    ManagerShutdown,
}

/// 本地持久化写入/读取错误，只记录日志，不影响上传结果
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialize error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage quota exceeded")]
    QuotaExceeded,
}

/// Error alias
pub type Result<T, E = QueueError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TransferError::AuthExpired.is_retryable());
        assert!(TransferError::server_error(503, "unavailable").is_retryable());
        assert!(TransferError::server_error(429, "slow down").is_retryable());
        assert!(!TransferError::server_error(400, "bad request").is_retryable());
        assert!(!TransferError::ParamError("no url".to_string()).is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
        assert!(!TransferError::Authorization("403: not allowed for this lesson".to_string()).is_retryable());
        assert!(!TransferError::Verification("400: unknown storage path".to_string()).is_retryable());
        assert!(TransferError::IntegrityMismatch("hash".to_string()).is_integrity_mismatch());
    }
}
