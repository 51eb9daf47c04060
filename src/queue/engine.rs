use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::utils::format_bytes;
use super::errors::TransferError;
use super::payload::FilePayload;
use super::task::{UploadTask, STAGE_AUTHORIZING, STAGE_HASHING, STAGE_UPLOADING, STAGE_VERIFYING};
use super::traits::{
    AuthorizationRequest,
    Clock,
    IntegrityVerifier,
    ResumableTransport,
    SignedUpload,
    SignedUrlProvider,
    VerificationRequest,
};
use super::types::{QueueConfig, TaskId};

/// 引擎共享的外部协作方
pub(crate) struct EngineContext {
    pub provider: Arc<dyn SignedUrlProvider>,
    pub verifier: Arc<dyn IntegrityVerifier>,
    pub transport: Arc<dyn ResumableTransport>,
    pub clock: Arc<dyn Clock>,
    pub config: QueueConfig,
}

#[derive(Debug)]
pub(crate) enum EngineUpdate {
    Stage(&'static str),
    Hashed(String),
    Authorized {
        upload_endpoint: String,
        storage_path: String,
        expires_at: DateTime<Utc>,
    },
    SessionOpened {
        resumable_url: String,
    },
    Progress {
        uploaded_bytes: u64,
    },
    Finished(Result<(), TransferError>),
}

/// 引擎发回调度器的消息，`generation` 用于丢弃已中止引擎的迟到消息
#[derive(Debug)]
pub(crate) struct EngineMessage {
    pub task_id: TaskId,
    pub generation: u64,
    pub update: EngineUpdate,
}

/// 正在运行的传输句柄
pub struct TransferHandle {
    token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl TransferHandle {
    /// 中止传输，可重复调用
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled() || self.join_handle.is_finished()
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// 单个任务的一次可续传传输
pub(crate) struct TransferEngine {
    ctx: Arc<EngineContext>,
    task: UploadTask,
    payload: FilePayload,
    generation: u64,
    updates: mpsc::UnboundedSender<EngineMessage>,
}

impl TransferEngine {
    pub fn new(
        ctx: Arc<EngineContext>,
        task: UploadTask,
        payload: FilePayload,
        generation: u64,
        updates: mpsc::UnboundedSender<EngineMessage>,
    ) -> Self {
        Self {
            ctx,
            task,
            payload,
            generation,
            updates,
        }
    }

    pub fn spawn(self) -> TransferHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let updates = self.updates.clone();
        let task_id = self.task.id;
        let generation = self.generation;

        let join_handle = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancelled.cancelled() => Err(TransferError::Cancelled),
                result = self.run() => result,
            };

            let _ = updates.send(EngineMessage {
                task_id,
                generation,
                update: EngineUpdate::Finished(result),
            });
        });

        TransferHandle { token, join_handle }
    }

    fn send(&self, update: EngineUpdate) {
        let _ = self.updates.send(EngineMessage {
            task_id: self.task.id,
            generation: self.generation,
            update,
        });
    }

    async fn run(mut self) -> Result<(), TransferError> {
        let hash = match self.task.content_hash() {
            Some(hash) => hash.to_string(),
            None => {
                self.send(EngineUpdate::Stage(STAGE_HASHING));
                let hash = self.payload.content_hash_blocking().await;
                self.task.set_content_hash(hash.clone());
                self.send(EngineUpdate::Hashed(hash.clone()));
                hash
            }
        };

        let mut auth = self.authorize(&hash).await?;
        let mut refreshes = 0;

        loop {
            match self.transfer(&mut auth, &hash).await {
                Ok(()) => break,
                Err(TransferError::AuthExpired) if refreshes < self.ctx.config.max_auth_refreshes => {
                    refreshes += 1;
                    tracing::warn!(task_id = %self.task.id, refreshes, "Signed upload url expired, refreshing");
                    auth = self.authorize(&hash).await?;
                }
                Err(err) => return Err(err),
            }
        }

        self.verify(&auth, &hash).await
    }

    /// 申请（或刷新）签名上传地址
    async fn authorize(&mut self, hash: &str) -> Result<SignedUpload, TransferError> {
        self.send(EngineUpdate::Stage(STAGE_AUTHORIZING));

        let request = AuthorizationRequest {
            file_name: self.task.file_name.clone(),
            file_size: self.task.total_bytes(),
            lesson_id: self.task.lesson_id.clone(),
            category: self.task.category.clone(),
            content_hash: hash.to_string(),
        };
        let authorization = self.ctx.provider.authorize(&request).await?;

        let ttl = self.ctx.config.signed_url_ttl();
        let signed = SignedUpload {
            upload_url: authorization.upload_url,
            storage_path: authorization.storage_path,
            token: authorization.token,
            expires_at: self.ctx.clock.now() + ttl,
        };

        self.task.upload_endpoint = Some(signed.upload_url.clone());
        self.task.storage_path = Some(signed.storage_path.clone());
        self.task.url_expires_at = Some(signed.expires_at);
        self.send(EngineUpdate::Authorized {
            upload_endpoint: signed.upload_url.clone(),
            storage_path: signed.storage_path.clone(),
            expires_at: signed.expires_at,
        });

        Ok(signed)
    }

    /// 找到未完成的上传会话并返回已确认偏移量，找不到就新建
    async fn open_session(&mut self, auth: &SignedUpload) -> Result<u64, TransferError> {
        let total = self.task.total_bytes();

        if let Some(upload_url) = self.task.resumable_url.clone() {
            match self.ctx.transport.get_offset(auth, &upload_url).await {
                Ok(offset) if offset <= total => {
                    tracing::debug!(task_id = %self.task.id, offset, "Resuming upload session");
                    return Ok(offset);
                }
                Ok(offset) => {
                    tracing::warn!(task_id = %self.task.id, offset, total, "Session offset beyond file size, starting over");
                }
                Err(TransferError::SessionGone(_)) => {
                    tracing::info!(task_id = %self.task.id, "Upload session gone, starting over");
                }
                Err(err) => return Err(err),
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("filename".to_string(), self.task.file_name.clone());
        if let Some(file_type) = &self.task.file_type {
            metadata.insert("filetype".to_string(), file_type.clone());
        }
        metadata.insert("lessonId".to_string(), self.task.lesson_id.clone());
        metadata.insert("category".to_string(), self.task.category.clone());
        metadata.insert("storagePath".to_string(), auth.storage_path.clone());
        metadata.insert("fingerprint".to_string(), self.task.fingerprint());

        let resumable_url = self.ctx.transport.create_upload(auth, total, &metadata).await?;
        self.task.resumable_url = Some(resumable_url.clone());
        self.send(EngineUpdate::SessionOpened { resumable_url });

        Ok(0)
    }

    async fn transfer(&mut self, auth: &mut SignedUpload, hash: &str) -> Result<(), TransferError> {
        let total = self.task.total_bytes();
        let mut offset = self.open_session(auth).await?;
        let upload_url = self
            .task
            .resumable_url
            .clone()
            .ok_or_else(|| TransferError::ParamError("Upload URL not set".to_string()))?;

        self.send(EngineUpdate::Stage(STAGE_UPLOADING));
        self.send(EngineUpdate::Progress { uploaded_bytes: offset });

        let chunk_size = self.ctx.config.chunk_size.max(1) as u64;
        let margin = self.ctx.config.expiry_margin();

        while offset < total {
            if auth.expires_within(self.ctx.clock.now(), margin) {
                tracing::debug!(task_id = %self.task.id, "Signed upload url about to expire, refreshing");
                *auth = self.authorize(hash).await?;
                self.send(EngineUpdate::Stage(STAGE_UPLOADING));
            }

            let end = (offset + chunk_size).min(total);
            let chunk = self.payload.slice(offset, end);
            let next_offset = self
                .ctx
                .transport
                .upload_chunk(auth, &upload_url, offset, chunk)
                .await?;

            tracing::trace!(
                task_id = %self.task.id,
                "Uploaded {}/{}",
                format_bytes(next_offset),
                format_bytes(total),
            );

            offset = next_offset;
            self.send(EngineUpdate::Progress { uploaded_bytes: offset });
        }

        Ok(())
    }

    async fn verify(&self, auth: &SignedUpload, hash: &str) -> Result<(), TransferError> {
        self.send(EngineUpdate::Stage(STAGE_VERIFYING));

        let request = VerificationRequest {
            storage_path: auth.storage_path.clone(),
            expected_size: self.task.total_bytes(),
            expected_hash: hash.to_string(),
            lesson_id: self.task.lesson_id.clone(),
        };
        let outcome = self.ctx.verifier.verify(&request).await?;

        if outcome.verified {
            Ok(())
        } else {
            Err(TransferError::IntegrityMismatch(
                outcome
                    .error
                    .unwrap_or_else(|| "Uploaded bytes do not match expected size or hash".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use crate::queue::traits::{SystemClock, UploadAuthorization, VerificationOutcome};

    struct FakeProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SignedUrlProvider for FakeProvider {
        async fn authorize(&self, request: &AuthorizationRequest) -> Result<UploadAuthorization, TransferError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(UploadAuthorization {
                upload_url: "https://up.example.com/files/".to_string(),
                storage_path: format!("lessons/{}/{}", request.lesson_id, request.file_name),
                token: format!("token-{}", n),
            })
        }
    }

    struct FakeVerifier {
        verified: bool,
    }

    #[async_trait]
    impl IntegrityVerifier for FakeVerifier {
        async fn verify(&self, _request: &VerificationRequest) -> Result<VerificationOutcome, TransferError> {
            Ok(VerificationOutcome {
                verified: self.verified,
                error: (!self.verified).then(|| "size mismatch".to_string()),
            })
        }
    }

    #[derive(Default)]
    struct FakeState {
        sessions: HashMap<String, u64>,
        created: usize,
        expire_next_chunks: usize,
        chunk_offsets: Vec<u64>,
        tokens: Vec<String>,
    }

    #[derive(Default)]
    struct FakeTransport {
        state: Mutex<FakeState>,
    }

    #[async_trait]
    impl ResumableTransport for FakeTransport {
        async fn create_upload(
            &self,
            _auth: &SignedUpload,
            _total_bytes: u64,
            metadata: &HashMap<String, String>,
        ) -> Result<String, TransferError> {
            assert!(metadata.contains_key("fingerprint"));
            let mut state = self.state.lock();
            state.created += 1;
            let url = format!("https://up.example.com/files/{}", state.created);
            state.sessions.insert(url.clone(), 0);
            Ok(url)
        }

        async fn get_offset(&self, _auth: &SignedUpload, upload_url: &str) -> Result<u64, TransferError> {
            self.state
                .lock()
                .sessions
                .get(upload_url)
                .copied()
                .ok_or_else(|| TransferError::SessionGone(upload_url.to_string()))
        }

        async fn upload_chunk(
            &self,
            auth: &SignedUpload,
            upload_url: &str,
            offset: u64,
            chunk: Bytes,
        ) -> Result<u64, TransferError> {
            let mut state = self.state.lock();
            state.tokens.push(auth.token.clone());
            if state.expire_next_chunks > 0 {
                state.expire_next_chunks -= 1;
                return Err(TransferError::AuthExpired);
            }

            state.chunk_offsets.push(offset);
            let next = offset + chunk.len() as u64;
            state.sessions.insert(upload_url.to_string(), next);
            Ok(next)
        }
    }

    struct Harness {
        provider: Arc<FakeProvider>,
        transport: Arc<FakeTransport>,
        ctx: Arc<EngineContext>,
    }

    fn harness(verified: bool, config: QueueConfig) -> Harness {
        let provider = Arc::new(FakeProvider { calls: AtomicUsize::new(0) });
        let transport = Arc::new(FakeTransport::default());
        let ctx = Arc::new(EngineContext {
            provider: provider.clone(),
            verifier: Arc::new(FakeVerifier { verified }),
            transport: transport.clone(),
            clock: Arc::new(SystemClock),
            config,
        });

        Harness { provider, transport, ctx }
    }

    fn small_chunks() -> QueueConfig {
        QueueConfig {
            chunk_size: 4,
            ..QueueConfig::default()
        }
    }

    fn payload() -> FilePayload {
        FilePayload::new("notes.pdf", b"0123456789".to_vec())
    }

    fn new_task(payload: &FilePayload) -> UploadTask {
        UploadTask::new(payload, "lesson-1", "documents", 0, Utc::now())
    }

    /// 运行引擎直到结束，返回全部消息
    async fn run_engine(ctx: Arc<EngineContext>, task: UploadTask, payload: FilePayload) -> Vec<EngineUpdate> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = TransferEngine::new(ctx, task, payload, 7, tx).spawn();

        let mut updates = Vec::new();
        while let Some(message) = rx.recv().await {
            assert_eq!(message.generation, 7);
            let finished = matches!(message.update, EngineUpdate::Finished(_));
            updates.push(message.update);
            if finished {
                break;
            }
        }
        updates
    }

    fn progress(updates: &[EngineUpdate]) -> Vec<u64> {
        updates
            .iter()
            .filter_map(|update| match update {
                EngineUpdate::Progress { uploaded_bytes } => Some(*uploaded_bytes),
                _ => None,
            })
            .collect()
    }

    fn finished(updates: &[EngineUpdate]) -> &Result<(), TransferError> {
        match updates.last() {
            Some(EngineUpdate::Finished(result)) => result,
            other => panic!("engine did not finish: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fresh_upload_hashes_chunks_and_verifies() {
        let h = harness(true, small_chunks());
        let payload = payload();
        let updates = run_engine(h.ctx.clone(), new_task(&payload), payload.clone()).await;

        assert!(finished(&updates).is_ok());
        assert!(updates.iter().any(|u| matches!(u, EngineUpdate::Hashed(hash) if *hash == payload.content_hash())));
        assert!(updates.iter().any(|u| matches!(u, EngineUpdate::SessionOpened { .. })));
        assert!(updates.iter().any(|u| matches!(u, EngineUpdate::Stage(STAGE_VERIFYING))));
        assert_eq!(progress(&updates), vec![0, 4, 8, 10]);
        assert_eq!(h.transport.state.lock().chunk_offsets, vec![0, 4, 8]);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_expired_refreshes_and_continues() {
        let h = harness(true, small_chunks());
        h.transport.state.lock().expire_next_chunks = 1;

        let payload = payload();
        let updates = run_engine(h.ctx.clone(), new_task(&payload), payload).await;

        assert!(finished(&updates).is_ok());
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);

        let state = h.transport.state.lock();
        assert_eq!(state.tokens.first().map(String::as_str), Some("token-1"));
        assert_eq!(state.tokens.last().map(String::as_str), Some("token-2"));
        // 刷新后沿用同一个会话
        assert_eq!(state.created, 1);
    }

    #[tokio::test]
    async fn test_auth_refreshes_are_bounded() {
        let config = QueueConfig {
            max_auth_refreshes: 2,
            ..small_chunks()
        };
        let h = harness(true, config);
        h.transport.state.lock().expire_next_chunks = 10;

        let payload = payload();
        let updates = run_engine(h.ctx.clone(), new_task(&payload), payload).await;

        assert!(matches!(finished(&updates), Err(TransferError::AuthExpired)));
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_resumes_from_server_offset() {
        let h = harness(true, small_chunks());
        let url = "https://up.example.com/files/existing".to_string();
        h.transport.state.lock().sessions.insert(url.clone(), 6);

        let payload = payload();
        let mut task = new_task(&payload);
        task.resumable_url = Some(url);
        task.uploaded_bytes = 6;

        let updates = run_engine(h.ctx.clone(), task, payload).await;

        assert!(finished(&updates).is_ok());
        assert_eq!(progress(&updates), vec![6, 10]);
        let state = h.transport.state.lock();
        assert_eq!(state.created, 0);
        assert_eq!(state.chunk_offsets, vec![6]);
    }

    #[tokio::test]
    async fn test_session_gone_starts_new_upload() {
        let h = harness(true, small_chunks());
        let payload = payload();
        let mut task = new_task(&payload);
        task.resumable_url = Some("https://up.example.com/files/expired".to_string());

        let updates = run_engine(h.ctx.clone(), task, payload).await;

        assert!(finished(&updates).is_ok());
        assert!(updates.iter().any(|u| matches!(
            u,
            EngineUpdate::SessionOpened { resumable_url } if resumable_url.ends_with("/1")
        )));
        assert_eq!(progress(&updates).first(), Some(&0));
    }

    #[tokio::test]
    async fn test_proactive_refresh_before_expiry() {
        // 有效期短于提前量，每个分块前都需要刷新
        let config = QueueConfig {
            signed_url_ttl_secs: 10,
            expiry_margin_secs: 30,
            ..small_chunks()
        };
        let h = harness(true, config);
        let payload = payload();
        let updates = run_engine(h.ctx.clone(), new_task(&payload), payload).await;

        assert!(finished(&updates).is_ok());
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_integrity_mismatch_is_an_error() {
        let h = harness(false, small_chunks());
        let payload = payload();
        let updates = run_engine(h.ctx.clone(), new_task(&payload), payload).await;

        match finished(&updates) {
            Err(TransferError::IntegrityMismatch(message)) => assert_eq!(message, "size mismatch"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_known_hash_is_not_recomputed() {
        let h = harness(true, small_chunks());
        let payload = payload();
        let mut task = new_task(&payload);
        task.set_content_hash(payload.content_hash());

        let updates = run_engine(h.ctx.clone(), task, payload).await;

        assert!(finished(&updates).is_ok());
        assert!(!updates.iter().any(|u| matches!(u, EngineUpdate::Hashed(_))));
    }

    #[tokio::test]
    async fn test_abort_reports_cancelled() {
        let h = harness(true, small_chunks());
        let payload = payload();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = TransferEngine::new(h.ctx.clone(), new_task(&payload), payload, 1, tx).spawn();
        handle.abort();
        handle.abort();

        let mut result = None;
        while let Some(message) = rx.recv().await {
            if let EngineUpdate::Finished(r) = message.update {
                result = Some(r);
                break;
            }
        }

        assert!(matches!(result, Some(Err(TransferError::Cancelled))));
        assert!(handle.is_stopped());
    }
}
