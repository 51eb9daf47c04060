use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use super::errors::PersistenceError;
use super::task::{UploadTask, STAGE_AWAITING_FILE};
use super::types::{TaskId, UploadStatus};

pub const QUEUE_SNAPSHOT_KEY: &str = "queue_snapshot";
pub const SESSIONS_KEY: &str = "sessions";

/// 本地键值存储（浏览器 localStorage 的等价物）
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    async fn write(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

/// 每个键存为目录下的一个 JSON 文件
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        // 先写临时文件再 rename，避免中途崩溃留下半个 JSON
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(())
    }
}

/// 内存存储，可模拟配额不足
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.records.lock().get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: impl Into<String>) {
        self.records.lock().insert(key.to_string(), value.into());
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::QuotaExceeded);
        }

        self.insert(key, value);
        Ok(())
    }
}

/// 续传所需的最少信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub resumable_url: String,
    pub uploaded_bytes: u64,
    pub storage_path: Option<String>,
    #[serde(default)]
    pub fingerprint: String,
}

/// 队列快照与会话表的持久化，所有写入都是尽力而为
pub struct PersistenceLayer {
    store: Arc<dyn StateStore>,
    sessions: HashMap<TaskId, SessionEntry>,
    sessions_dirty: bool,
}

impl PersistenceLayer {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            sessions: HashMap::new(),
            sessions_dirty: false,
        }
    }

    pub fn upsert_session(&mut self, task_id: TaskId, entry: SessionEntry) {
        self.sessions.insert(task_id, entry);
        self.sessions_dirty = true;
    }

    pub fn update_session_progress(&mut self, task_id: &TaskId, uploaded_bytes: u64) {
        if let Some(entry) = self.sessions.get_mut(task_id) {
            if entry.uploaded_bytes != uploaded_bytes {
                entry.uploaded_bytes = uploaded_bytes;
                self.sessions_dirty = true;
            }
        }
    }

    pub fn remove_session(&mut self, task_id: &TaskId) {
        if self.sessions.remove(task_id).is_some() {
            self.sessions_dirty = true;
        }
    }

    /// 写入队列快照，会话表有变化时一并写入
    pub async fn flush<'a>(&mut self, tasks: impl IntoIterator<Item = &'a UploadTask>) {
        let tasks: Vec<&UploadTask> = tasks.into_iter().collect();
        if let Err(err) = self.write_json(QUEUE_SNAPSHOT_KEY, &tasks).await {
            tracing::warn!(error = %err, "Failed to persist queue snapshot");
        }

        if self.sessions_dirty {
            let result = self.write_json(SESSIONS_KEY, &self.sessions).await;
            match result {
                Ok(()) => self.sessions_dirty = false,
                Err(err) => tracing::warn!(error = %err, "Failed to persist upload sessions"),
            }
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), PersistenceError> {
        let data = serde_json::to_string(value)?;
        self.store.write(key, &data).await
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        match self.store.read(key).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// 读回快照，只恢复可续传状态的任务
    ///
    /// 文件内容无法恢复，所有恢复出的任务都标记为等待重新提供文件；
    /// 上传中的任务转为暂停。
    pub async fn restore(&mut self) -> Vec<UploadTask> {
        let tasks: Vec<UploadTask> = match self.read_json(QUEUE_SNAPSHOT_KEY).await {
            Ok(tasks) => tasks.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to restore queue snapshot");
                Vec::new()
            }
        };

        let sessions: HashMap<TaskId, SessionEntry> = match self.read_json(SESSIONS_KEY).await {
            Ok(sessions) => sessions.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to restore upload sessions");
                HashMap::new()
            }
        };

        let mut restored: Vec<UploadTask> = tasks
            .into_iter()
            .filter(|task| matches!(
                task.status,
                UploadStatus::Queued | UploadStatus::Uploading | UploadStatus::Paused | UploadStatus::Failed
            ))
            .map(|mut task| {
                if task.status == UploadStatus::Uploading {
                    task.status = UploadStatus::Paused;
                }
                if let Some(session) = sessions.get(&task.id) {
                    task.resumable_url = Some(session.resumable_url.clone());
                    task.uploaded_bytes = task.uploaded_bytes.max(session.uploaded_bytes).min(task.total_bytes);
                    task.progress = task.percentage();
                    if session.storage_path.is_some() {
                        task.storage_path = session.storage_path.clone();
                    }
                }
                task.rehydration_pending = true;
                task.stage = STAGE_AWAITING_FILE.to_string();
                task
            })
            .collect();
        restored.sort_by_key(|task| task.sequence);

        let total_sessions = sessions.len();
        self.sessions = sessions
            .into_iter()
            .filter(|(id, _)| restored.iter().any(|task| task.id == *id))
            .collect();
        self.sessions_dirty = self.sessions.len() != total_sessions;

        tracing::info!(tasks = restored.len(), sessions = self.sessions.len(), "Restored upload queue");
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::queue::FilePayload;

    fn task_with_status(name: &str, sequence: u64, status: UploadStatus) -> UploadTask {
        let payload = FilePayload::new(name, vec![0u8; 100]);
        let mut task = UploadTask::new(&payload, "lesson-1", "slides", sequence, Utc::now());
        task.status = status;
        task
    }

    fn session(url: &str, uploaded_bytes: u64) -> SessionEntry {
        SessionEntry {
            resumable_url: url.to_string(),
            uploaded_bytes,
            storage_path: Some("lessons/lesson-1/a".to_string()),
            fingerprint: String::new(),
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let store = Arc::new(MemoryStateStore::new());
        store.set_fail_writes(true);
        let mut layer = PersistenceLayer::new(store.clone());

        let task = task_with_status("a.pdf", 0, UploadStatus::Queued);
        layer.upsert_session(task.id, session("https://up/1", 10));
        layer.flush([&task]).await;

        assert!(store.get(QUEUE_SNAPSHOT_KEY).is_none());
        assert!(store.get(SESSIONS_KEY).is_none());

        // 恢复写入后，未落盘的会话表会被补写
        store.set_fail_writes(false);
        layer.flush([&task]).await;
        assert!(store.get(SESSIONS_KEY).unwrap().contains("https://up/1"));
    }

    #[tokio::test]
    async fn test_restore_keeps_resumable_statuses_only() {
        let store = Arc::new(MemoryStateStore::new());
        let mut layer = PersistenceLayer::new(store.clone());

        let queued = task_with_status("a.pdf", 0, UploadStatus::Queued);
        let uploading = task_with_status("b.pdf", 1, UploadStatus::Uploading);
        let complete = task_with_status("c.pdf", 2, UploadStatus::Complete);
        let failed = task_with_status("d.pdf", 3, UploadStatus::Failed);

        layer.upsert_session(uploading.id, session("https://up/b", 40));
        layer.upsert_session(complete.id, session("https://up/c", 100));
        layer.flush([&queued, &uploading, &complete, &failed]).await;

        let mut reloaded = PersistenceLayer::new(store.clone());
        let restored = reloaded.restore().await;

        let names: Vec<_> = restored.iter().map(|task| task.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.pdf", "b.pdf", "d.pdf"]);
        assert!(restored.iter().all(|task| task.rehydration_pending));

        let b = &restored[1];
        assert_eq!(b.status(), UploadStatus::Paused);
        assert_eq!(b.uploaded_bytes, 40);
        assert_eq!(b.progress, 40);
        assert_eq!(b.resumable_url.as_deref(), Some("https://up/b"));

        // 已完成任务的会话被清理
        assert!(reloaded.sessions.get(&complete.id).is_none());
        assert!(reloaded.sessions.get(&uploading.id).is_some());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_restores_nothing() {
        let store = Arc::new(MemoryStateStore::new());
        store.insert(QUEUE_SNAPSHOT_KEY, "{not json");

        let mut layer = PersistenceLayer::new(store);
        assert!(layer.restore().await.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state"));

        assert!(store.read(SESSIONS_KEY).await.unwrap().is_none());
        store.write(SESSIONS_KEY, "{}").await.unwrap();
        assert_eq!(store.read(SESSIONS_KEY).await.unwrap().as_deref(), Some("{}"));
        assert!(dir.path().join("state").join("sessions.json").exists());
    }
}
