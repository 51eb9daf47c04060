//! 集成测试共用的模拟后端与传输
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use lesson_upload::queue::{
    AuthorizationRequest,
    IntegrityVerifier,
    MemoryStateStore,
    ResumableTransport,
    SignedUpload,
    SignedUrlProvider,
    StateStore,
    TransferError,
    UploadAuthorization,
    UploadCallbacks,
    UploadEvent,
    UploadQueue,
    UploadQueueHandle,
    UploadTask,
    VerificationOutcome,
    VerificationRequest,
};
use lesson_upload::{FilePayload, QueueConfig, RetryPolicy};

pub const MB: usize = 1024 * 1024;

/// 模拟签名地址服务
#[derive(Default)]
pub struct MockProvider {
    pub calls: AtomicU32,
    /// 之后的请求都以 403 拒绝
    pub rejecting: AtomicBool,
}

#[async_trait]
impl SignedUrlProvider for MockProvider {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<UploadAuthorization, TransferError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(TransferError::Authorization("403: not allowed for this lesson".to_string()));
        }
        Ok(UploadAuthorization {
            upload_url: "https://storage.example.com/files/".to_string(),
            storage_path: format!("lessons/{}/{}/{}", request.lesson_id, request.category, request.file_name),
            token: format!("signed-{}", n),
        })
    }
}

/// 模拟完整性校验
pub struct MockVerifier {
    pub verified: AtomicBool,
    pub calls: AtomicU32,
}

impl Default for MockVerifier {
    fn default() -> Self {
        Self {
            verified: AtomicBool::new(true),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl IntegrityVerifier for MockVerifier {
    async fn verify(&self, _request: &VerificationRequest) -> Result<VerificationOutcome, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.verified.load(Ordering::SeqCst) {
            Ok(VerificationOutcome { verified: true, error: None })
        } else {
            Ok(VerificationOutcome {
                verified: false,
                error: Some("Size mismatch".to_string()),
            })
        }
    }
}

/// 内存中的 tus 服务端，每个分块需要一个许可，便于让上传停在中途
pub struct GatedTransport {
    permits: Semaphore,
    sessions: Mutex<HashMap<String, u64>>,
    created: AtomicUsize,
    /// 之后的分块请求都返回 503
    pub failing: AtomicBool,
    pub chunk_offsets: Mutex<Vec<u64>>,
}

impl GatedTransport {
    /// 分块立即通过
    pub fn open() -> Self {
        let transport = Self::closed();
        transport.release_all();
        transport
    }

    /// 分块在 `release` 之前一直等待
    pub fn closed() -> Self {
        Self {
            permits: Semaphore::new(0),
            sessions: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            chunk_offsets: Mutex::new(Vec::new()),
        }
    }

    pub fn release(&self, chunks: usize) {
        self.permits.add_permits(chunks);
    }

    pub fn release_all(&self) {
        self.permits.add_permits(1 << 24);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResumableTransport for GatedTransport {
    async fn create_upload(
        &self,
        _auth: &SignedUpload,
        _total_bytes: u64,
        _metadata: &HashMap<String, String>,
    ) -> Result<String, TransferError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let url = format!("https://storage.example.com/files/{}", n);
        self.sessions.lock().insert(url.clone(), 0);
        Ok(url)
    }

    async fn get_offset(&self, _auth: &SignedUpload, upload_url: &str) -> Result<u64, TransferError> {
        self.sessions
            .lock()
            .get(upload_url)
            .copied()
            .ok_or_else(|| TransferError::SessionGone(upload_url.to_string()))
    }

    async fn upload_chunk(
        &self,
        _auth: &SignedUpload,
        upload_url: &str,
        offset: u64,
        chunk: Bytes,
    ) -> Result<u64, TransferError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransferError::server_error(503, "Service unavailable"));
        }

        self.permits
            .acquire()
            .await
            .map_err(|_| TransferError::ParamError("transport closed".to_string()))?
            .forget();

        self.chunk_offsets.lock().push(offset);
        let next = offset + chunk.len() as u64;
        self.sessions.lock().insert(upload_url.to_string(), next);
        Ok(next)
    }
}

/// 记录回调调用
#[derive(Default)]
pub struct RecordingCallbacks {
    pub completed: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
    pub duplicates: Mutex<Vec<String>>,
    pub updates: AtomicUsize,
}

impl UploadCallbacks for RecordingCallbacks {
    fn on_task_update(&self, _task: &UploadTask) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn on_complete(&self, task: &UploadTask) {
        self.completed.lock().push(task.file_name.clone());
    }

    fn on_error(&self, _task: &UploadTask, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn on_duplicate_skipped(&self, skipped: &lesson_upload::queue::DuplicateSkipped) {
        self.duplicates.lock().push(skipped.file_name.clone());
    }
}

pub struct TestQueue {
    pub handle: UploadQueueHandle,
    pub provider: Arc<MockProvider>,
    pub verifier: Arc<MockVerifier>,
    pub transport: Arc<GatedTransport>,
    pub store: Arc<MemoryStateStore>,
}

impl TestQueue {
    pub fn queue(&self) -> &UploadQueue {
        &self.handle.queue
    }
}

pub fn build_queue(transport: GatedTransport) -> TestQueue {
    build_queue_with(
        Arc::new(transport),
        Arc::new(MemoryStateStore::new()),
        QueueConfig::default(),
        RetryPolicy::default(),
    )
}

pub fn build_queue_with(
    transport: Arc<GatedTransport>,
    store: Arc<MemoryStateStore>,
    config: QueueConfig,
    retry_policy: RetryPolicy,
) -> TestQueue {
    let provider = Arc::new(MockProvider::default());
    let verifier = Arc::new(MockVerifier::default());

    let handle = UploadQueue::builder(provider.clone(), verifier.clone())
        .transport(transport.clone())
        .state_store(store.clone() as Arc<dyn StateStore>)
        .config(config)
        .retry_policy(retry_policy)
        .build();

    TestQueue {
        handle,
        provider,
        verifier,
        transport,
        store,
    }
}

pub fn file(name: &str, size: usize) -> FilePayload {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    FilePayload::new(name, data)
}

/// 等待满足条件的事件
pub async fn next_matching<F>(rx: &mut broadcast::Receiver<UploadEvent>, mut predicate: F) -> UploadEvent
where
    F: FnMut(&UploadEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3600), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// 轮询队列直到条件成立
pub async fn wait_for_queue<F>(queue: &UploadQueue, mut predicate: F) -> Vec<UploadTask>
where
    F: FnMut(&[UploadTask]) -> bool,
{
    for _ in 0..10_000 {
        let tasks = queue.get_queue().await.expect("queue alive");
        if predicate(&tasks) {
            return tasks;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue never reached the expected state");
}

/// 轮询存储直到条件成立（持久化在命令应答之后才发生）
pub async fn wait_for_store<F>(store: &MemoryStateStore, key: &str, mut predicate: F) -> String
where
    F: FnMut(&str) -> bool,
{
    for _ in 0..10_000 {
        if let Some(value) = store.get(key) {
            if predicate(&value) {
                return value;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("store never reached the expected state for {}", key);
}

/// 轮询直到条件成立（回调在独立任务中执行）
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}
