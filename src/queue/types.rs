use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use super::callbacks::UploadCallbacks;
use super::errors::Result;
use super::payload::FilePayload;
use super::task::UploadTask;

/// 上传任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待中（在队列中）
    Queued,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Complete,
    /// 失败（可手动重试）
    Failed,
    /// 已取消
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Cancelled)
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(self, to: UploadStatus) -> bool {
        use UploadStatus::*;

        matches!(
            (self, to),
            (Queued, Uploading)
                | (Uploading, Complete)
                | (Uploading, Paused)
                | (Uploading, Queued)
                | (Uploading, Failed)
                | (Paused, Queued)
                | (Failed, Queued)
                | (Queued | Uploading | Paused | Failed, Cancelled)
        )
    }
}

// 用于序列化 Duration（毫秒）
pub(crate) mod duration_ms {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// 队列调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 最大并发数
    pub max_concurrent: usize,

    /// 大文件阈值，超过后并发降为 1
    pub large_file_threshold: u64,

    /// 分块大小
    pub chunk_size: usize,

    /// 签名 URL 有效期（秒）
    pub signed_url_ttl_secs: u64,

    /// 距离过期不足该值时主动刷新签名 URL（秒）
    pub expiry_margin_secs: u64,

    /// 单次传输内因授权过期而重新申请的最大次数
    pub max_auth_refreshes: u32,

    /// 事件广播缓冲
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            large_file_threshold: 20 * 1024 * 1024, // 20MB
            chunk_size: 5 * 1024 * 1024, // 5MB
            signed_url_ttl_secs: 3600,
            expiry_margin_secs: 30,
            max_auth_refreshes: 3,
            event_capacity: 256,
        }
    }
}

/// 签名 URL 相关时长的上限（一年），过大的配置值被截断
const MAX_SIGNED_URL_SECS: u64 = 365 * 24 * 60 * 60;

fn clamped_seconds(secs: u64) -> chrono::Duration {
    let secs = i64::try_from(secs.min(MAX_SIGNED_URL_SECS)).unwrap_or(i64::MAX);
    chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
}

impl QueueConfig {
    pub fn signed_url_ttl(&self) -> chrono::Duration {
        clamped_seconds(self.signed_url_ttl_secs)
    }

    pub fn expiry_margin(&self) -> chrono::Duration {
        clamped_seconds(self.expiry_margin_secs)
    }
}

/// 因重复而被跳过的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateSkipped {
    pub file_name: String,
    pub file_size: u64,
    pub lesson_id: String,
    /// 已在队列/上传中的同名任务
    pub existing: TaskId,
}

/// enqueue 的结果
#[derive(Debug, Clone, Default)]
pub struct EnqueueReport {
    pub queued: Vec<TaskId>,
    pub skipped: Vec<DuplicateSkipped>,
    /// 匹配到等待文件的恢复任务，文件已重新挂上
    pub reattached: Vec<TaskId>,
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 单个任务状态/进度变更
    TaskUpdated(UploadTask),

    /// 队列结构变更（添加、移除、状态迁移）
    QueueUpdated(Vec<UploadTask>),

    /// 任务完成（已通过完整性校验）
    Completed(UploadTask),

    /// 重试预算耗尽或不可重试的失败
    Failed {
        task: UploadTask,
        message: String,
    },

    /// 已安排自动重试
    RetryScheduled {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
    },

    /// 重复文件被跳过（提示，非错误）
    DuplicateSkipped(DuplicateSkipped),

    /// 任务已从队列中移除
    Removed {
        task_id: TaskId,
    },
}

impl UploadEvent {
    /// 事件所属任务（队列级事件返回 None）
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            UploadEvent::TaskUpdated(task) | UploadEvent::Completed(task) => Some(task.id),
            UploadEvent::Failed { task, .. } => Some(task.id),
            UploadEvent::RetryScheduled { task_id, .. } | UploadEvent::Removed { task_id } => Some(*task_id),
            UploadEvent::DuplicateSkipped(skipped) => Some(skipped.existing),
            UploadEvent::QueueUpdated(_) => None,
        }
    }
}

/// 上传队列命令
pub enum ManagerCommand {
    /// 添加上传任务
    Enqueue {
        files: Vec<FilePayload>,
        lesson_id: String,
        category: String,
        callbacks: Option<Arc<dyn UploadCallbacks>>,
        reply: oneshot::Sender<Result<EnqueueReport>>,
    },

    /// 暂停
    Pause {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 恢复
    Resume {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 手动重试（重置重试计数）
    Retry {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 取消
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 为恢复出来的任务重新提供文件
    Reattach {
        task_id: TaskId,
        payload: FilePayload,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 移除已完成/失败的任务
    Evict {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 清除所有 Complete 状态的任务
    ClearCompleted {
        reply: oneshot::Sender<usize>,
    },

    /// 获取任务信息
    GetTask {
        task_id: TaskId,
        reply: oneshot::Sender<Option<UploadTask>>,
    },

    /// 获取所有任务
    GetQueue {
        reply: oneshot::Sender<Vec<UploadTask>>,
    },
}
