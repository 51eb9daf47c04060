use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use crate::utils::{ProgressEstimate, RetryPolicy};
use super::callbacks::{spawn_callback_bridge, UploadCallbacks};
use super::engine::{EngineContext, EngineMessage, EngineUpdate, TransferEngine, TransferHandle};
use super::errors::{QueueError, Result, TransferError};
use super::network::Connectivity;
use super::payload::FilePayload;
use super::persistence::{PersistenceLayer, SessionEntry};
use super::task::{UploadTask, STAGE_COMPLETE, STAGE_FAILED, STAGE_PAUSED, STAGE_QUEUED, STAGE_RETRYING};
use super::types::{DuplicateSkipped, EnqueueReport, ManagerCommand, TaskId, UploadEvent, UploadStatus};

/// 本轮上传（从最近一次开始/恢复算起）
struct Stint {
    started_at: DateTime<Utc>,
    base_bytes: u64,
}

/// 描述与运行时资源分开存放：描述可持久化，文件内容与传输句柄只在内存里
struct TaskHandle {
    task: UploadTask,
    payload: Option<FilePayload>,
    transfer: Option<TransferHandle>,
    generation: u64,
    backoff: bool,
    retry_timer: Option<JoinHandle<()>>,
    stint: Option<Stint>,
}

impl TaskHandle {
    fn new(task: UploadTask, payload: Option<FilePayload>) -> Self {
        Self {
            task,
            payload,
            transfer: None,
            generation: 0,
            backoff: false,
            retry_timer: None,
            stint: None,
        }
    }

    /// 停止传输和退避计时器
    fn stop(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            transfer.abort();
        }
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.backoff = false;
        self.stint = None;
    }

    /// 可以被调度器接纳
    fn is_ready(&self) -> bool {
        self.task.status == UploadStatus::Queued
            && !self.backoff
            && !self.task.rehydration_pending
            && self.payload.is_some()
    }
}

/// 调度器：唯一持有队列状态的任务，所有修改都在这里串行发生
pub(crate) struct QueueWorker {
    ctx: Arc<EngineContext>,
    retry_policy: RetryPolicy,
    tasks: HashMap<TaskId, TaskHandle>,
    next_sequence: u64,
    next_generation: u64,
    persistence: PersistenceLayer,
    online: bool,
    dirty: bool,

    event_tx: broadcast::Sender<UploadEvent>,
    engine_tx: mpsc::UnboundedSender<EngineMessage>,
    engine_rx: mpsc::UnboundedReceiver<EngineMessage>,
    retry_tx: mpsc::UnboundedSender<TaskId>,
    retry_rx: mpsc::UnboundedReceiver<TaskId>,
}

impl QueueWorker {
    pub fn new(
        ctx: Arc<EngineContext>,
        retry_policy: RetryPolicy,
        persistence: PersistenceLayer,
        event_tx: broadcast::Sender<UploadEvent>,
        online: bool,
    ) -> Self {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        Self {
            ctx,
            retry_policy,
            tasks: HashMap::new(),
            next_sequence: 0,
            next_generation: 1,
            persistence,
            online,
            dirty: false,
            event_tx,
            engine_tx,
            engine_rx,
            retry_tx,
            retry_rx,
        }
    }

    pub async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        mut network_rx: watch::Receiver<Connectivity>,
    ) {
        // 恢复之前的状态
        self.restore().await;

        let mut network_open = true;

        // 主事件循环
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = self.engine_rx.recv() => {
                    self.handle_engine_message(message);
                }
                Some(task_id) = self.retry_rx.recv() => {
                    self.handle_retry_due(task_id);
                }
                changed = network_rx.changed(), if network_open => match changed {
                    Ok(()) => {
                        let connectivity = *network_rx.borrow_and_update();
                        self.handle_connectivity(connectivity);
                    }
                    Err(_) => network_open = false,
                },
            }

            self.process_queue();

            if self.dirty {
                self.persist().await;
            }
        }

        for handle in self.tasks.values_mut() {
            handle.stop();
        }
        self.persist().await;
        tracing::debug!("Upload queue worker stopped");
    }

    async fn restore(&mut self) {
        let restored = self.persistence.restore().await;

        for task in restored {
            self.next_sequence = self.next_sequence.max(task.sequence + 1);
            tracing::info!(task_id = %task.id, file = %task.file_name, "Restored task awaiting its file");
            self.tasks.insert(task.id, TaskHandle::new(task, None));
            self.dirty = true;
        }

        if self.dirty {
            self.emit_queue_update();
        }
    }

    async fn persist(&mut self) {
        let mut tasks: Vec<&UploadTask> = self.tasks.values().map(|handle| &handle.task).collect();
        tasks.sort_by_key(|task| task.sequence);
        self.persistence.flush(tasks).await;
        self.dirty = false;
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Enqueue { files, lesson_id, category, callbacks, reply } => {
                let result = self.enqueue(files, &lesson_id, &category, callbacks).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Pause { task_id, reply } => {
                let _ = reply.send(self.pause_upload(task_id));
            }
            ManagerCommand::Resume { task_id, reply } => {
                let _ = reply.send(self.resume_upload(task_id));
            }
            ManagerCommand::Retry { task_id, reply } => {
                let _ = reply.send(self.retry_upload(task_id));
            }
            ManagerCommand::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel_upload(task_id));
            }
            ManagerCommand::Reattach { task_id, payload, reply } => {
                let result = self.reattach(task_id, payload).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Evict { task_id, reply } => {
                let _ = reply.send(self.evict(task_id));
            }
            ManagerCommand::ClearCompleted { reply } => {
                let _ = reply.send(self.clear_completed());
            }
            ManagerCommand::GetTask { task_id, reply } => {
                let task = self.tasks.get(&task_id).map(|handle| handle.task.clone());
                let _ = reply.send(task);
            }
            ManagerCommand::GetQueue { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn enqueue(
        &mut self,
        files: Vec<FilePayload>,
        lesson_id: &str,
        category: &str,
        callbacks: Option<Arc<dyn UploadCallbacks>>,
    ) -> Result<EnqueueReport> {
        let now = self.ctx.clock.now();
        let mut report = EnqueueReport::default();

        for payload in files {
            // 重新选择了恢复任务对应的文件
            if let Some(pending) = self.find_pending(&payload.name, payload.len(), lesson_id) {
                match self.reattach(pending, payload.clone()).await {
                    Ok(()) => {
                        report.reattached.push(pending);
                        continue;
                    }
                    Err(err) => {
                        tracing::debug!(task_id = %pending, error = %err, "File does not match restored task");
                    }
                }
            }

            if let Some(existing) = self.find_duplicate(&payload.name, payload.len(), lesson_id) {
                let skipped = DuplicateSkipped {
                    file_name: payload.name.clone(),
                    file_size: payload.len(),
                    lesson_id: lesson_id.to_string(),
                    existing,
                };
                tracing::info!(file = %skipped.file_name, existing = %existing, "Duplicate file skipped");

                if let Some(callbacks) = &callbacks {
                    callbacks.on_duplicate_skipped(&skipped);
                }
                self.emit(UploadEvent::DuplicateSkipped(skipped.clone()));
                report.skipped.push(skipped);
                continue;
            }

            let task = UploadTask::new(&payload, lesson_id, category, self.next_sequence, now);
            self.next_sequence += 1;

            tracing::info!(task_id = %task.id, file = %task.file_name, size = task.total_bytes(), "Task queued");
            report.queued.push(task.id);
            self.tasks.insert(task.id, TaskHandle::new(task, Some(payload)));
        }

        if let Some(callbacks) = callbacks {
            let task_ids: HashSet<TaskId> = report.queued.iter().chain(&report.reattached).copied().collect();
            if !task_ids.is_empty() {
                spawn_callback_bridge(self.event_tx.subscribe(), task_ids, callbacks);
            }
        }

        if report.queued.is_empty() {
            return Ok(report);
        }

        for task_id in &report.queued {
            self.emit_task(task_id);
        }
        self.emit_queue_update();
        self.dirty = true;

        Ok(report)
    }

    /// 同名、同大小、同课程，且仍在排队或上传中
    fn find_duplicate(&self, file_name: &str, file_size: u64, lesson_id: &str) -> Option<TaskId> {
        self.tasks
            .values()
            .filter(|handle| matches!(handle.task.status, UploadStatus::Queued | UploadStatus::Uploading))
            .find(|handle| handle.task.matches_file(file_name, file_size, lesson_id))
            .map(|handle| handle.task.id)
    }

    fn find_pending(&self, file_name: &str, file_size: u64, lesson_id: &str) -> Option<TaskId> {
        self.tasks
            .values()
            .filter(|handle| handle.task.rehydration_pending)
            .filter(|handle| handle.task.matches_file(file_name, file_size, lesson_id))
            .min_by_key(|handle| handle.task.sequence)
            .map(|handle| handle.task.id)
    }

    /// 当前并发上限：有大文件在传时为 1
    pub fn concurrency_limit(&self) -> usize {
        let threshold = self.ctx.config.large_file_threshold;
        let large_active = self.tasks
            .values()
            .any(|handle| handle.task.status == UploadStatus::Uploading && handle.task.is_large(threshold));

        if large_active {
            1
        } else {
            self.ctx.config.max_concurrent.max(1)
        }
    }

    /// 严格按入队顺序接纳任务，直到没有空闲名额
    fn process_queue(&mut self) {
        if !self.online {
            return;
        }

        loop {
            let active = self.tasks
                .values()
                .filter(|handle| handle.task.status == UploadStatus::Uploading)
                .count();

            let Some(next) = self.tasks
                .values()
                .filter(|handle| handle.is_ready())
                .min_by_key(|handle| handle.task.sequence)
            else {
                break;
            };

            // 接纳大文件后上限也会降为 1，需要提前算进去
            let mut limit = self.concurrency_limit();
            if next.task.is_large(self.ctx.config.large_file_threshold) {
                limit = 1;
            }
            if active >= limit {
                break;
            }

            let task_id = next.task.id;
            self.start_upload(task_id);
        }
    }

    fn start_upload(&mut self, task_id: TaskId) {
        let now = self.ctx.clock.now();
        let generation = self.next_generation;
        self.next_generation += 1;

        let Some(handle) = self.tasks.get_mut(&task_id) else { return };
        let Some(payload) = handle.payload.clone() else { return };

        if let Err(err) = handle.task.transition(UploadStatus::Uploading) {
            tracing::error!(task_id = %task_id, error = %err, "Cannot start upload");
            return;
        }

        // 同一任务最多只有一个活动引擎
        if let Some(previous) = handle.transfer.take() {
            if !previous.is_stopped() {
                tracing::warn!(task_id = %task_id, "Previous transfer still running, aborting it");
            }
            previous.abort();
        }

        handle.task.error = None;
        handle.task.started_at.get_or_insert(now);
        handle.generation = generation;
        handle.stint = Some(Stint {
            started_at: now,
            base_bytes: handle.task.uploaded_bytes,
        });

        let engine = TransferEngine::new(
            self.ctx.clone(),
            handle.task.clone(),
            payload,
            generation,
            self.engine_tx.clone(),
        );
        handle.transfer = Some(engine.spawn());

        tracing::info!(task_id = %task_id, generation, attempt = handle.task.retry_count, "Upload started");
        self.emit_task(&task_id);
        self.emit_queue_update();
        self.dirty = true;
    }

    fn handle_engine_message(&mut self, message: EngineMessage) {
        let task_id = message.task_id;
        let now = self.ctx.clock.now();

        let Some(handle) = self.tasks.get_mut(&task_id) else { return };
        if handle.generation != message.generation || handle.task.status != UploadStatus::Uploading {
            tracing::trace!(task_id = %task_id, generation = message.generation, "Dropping stale engine message");
            return;
        }

        match message.update {
            EngineUpdate::Stage(stage) => {
                handle.task.set_stage(stage, now);
            }
            EngineUpdate::Hashed(hash) => {
                if !handle.task.set_content_hash(hash) {
                    tracing::warn!(task_id = %task_id, "Content hash already set, keeping the first one");
                }
            }
            EngineUpdate::Authorized { upload_endpoint, storage_path, expires_at } => {
                handle.task.upload_endpoint = Some(upload_endpoint);
                handle.task.storage_path = Some(storage_path);
                handle.task.url_expires_at = Some(expires_at);
            }
            EngineUpdate::SessionOpened { resumable_url } => {
                handle.task.resumable_url = Some(resumable_url.clone());
                self.persistence.upsert_session(task_id, SessionEntry {
                    resumable_url,
                    uploaded_bytes: 0,
                    storage_path: handle.task.storage_path.clone(),
                    fingerprint: handle.task.fingerprint(),
                });
            }
            EngineUpdate::Progress { uploaded_bytes } => {
                self.persistence.update_session_progress(&task_id, uploaded_bytes);
                if !handle.task.record_progress(uploaded_bytes) {
                    self.dirty = true;
                    return;
                }

                if let (Some(stint), Some(started_at)) = (&handle.stint, handle.task.started_at) {
                    handle.task.estimate = Some(ProgressEstimate::compute(
                        handle.task.total_bytes(),
                        handle.task.uploaded_bytes,
                        stint.base_bytes,
                        (now - stint.started_at).to_std().unwrap_or_default(),
                        (now - started_at).to_std().unwrap_or_default(),
                    ));
                }
            }
            EngineUpdate::Finished(result) => {
                self.handle_finished(task_id, result);
                return;
            }
        }

        self.dirty = true;
        self.emit_task(&task_id);
    }

    fn handle_finished(&mut self, task_id: TaskId, result: std::result::Result<(), TransferError>) {
        let now = self.ctx.clock.now();
        let Some(handle) = self.tasks.get_mut(&task_id) else { return };
        handle.transfer = None;
        handle.stint = None;

        let err = match result {
            Ok(()) => {
                if let Err(err) = handle.task.transition(UploadStatus::Complete) {
                    tracing::error!(task_id = %task_id, error = %err, "Cannot complete upload");
                    return;
                }

                handle.task.record_progress(handle.task.total_bytes());
                handle.task.progress = 100;
                handle.task.error = None;
                handle.task.completed_at = Some(now);
                handle.task.set_stage(STAGE_COMPLETE, now);
                if let Some(estimate) = handle.task.estimate.as_mut() {
                    estimate.eta = Some(std::time::Duration::ZERO);
                }
                // 完成后释放文件内容
                handle.payload = None;

                let task = handle.task.clone();
                self.persistence.remove_session(&task_id);
                tracing::info!(task_id = %task_id, file = %task.file_name, "Upload complete");

                self.emit(UploadEvent::TaskUpdated(task.clone()));
                self.emit(UploadEvent::Completed(task));
                self.emit_queue_update();
                self.dirty = true;
                return;
            }
            Err(TransferError::Cancelled) => return,
            Err(err) => err,
        };

        self.handle_failure(task_id, err);
    }

    /// 传输失败与校验失败走同一条退避路径
    fn handle_failure(&mut self, task_id: TaskId, err: TransferError) {
        let now = self.ctx.clock.now();
        let retryable = if err.is_integrity_mismatch() {
            self.retry_policy.retries_integrity_mismatch()
        } else {
            err.is_retryable()
        };

        let Some(handle) = self.tasks.get_mut(&task_id) else { return };
        if err.is_integrity_mismatch() {
            // 服务端对象已经不可信，重试或手动重试都要重新上传
            handle.task.discard_session();
            self.persistence.remove_session(&task_id);
        }

        let next_attempt = if retryable {
            self.retry_policy.next_attempt(handle.task.retry_count)
        } else {
            None
        };

        match next_attempt {
            Some((attempt, delay)) => {
                if let Err(err) = handle.task.transition(UploadStatus::Queued) {
                    tracing::error!(task_id = %task_id, error = %err, "Cannot schedule retry");
                    return;
                }

                handle.task.retry_count = attempt;
                handle.task.error = Some(err.to_string());
                handle.task.set_stage(STAGE_RETRYING, now);
                handle.backoff = true;

                let retry_tx = self.retry_tx.clone();
                handle.retry_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = retry_tx.send(task_id);
                }));

                tracing::info!(
                    task_id = %task_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Upload failed, retry scheduled"
                );

                self.emit_task(&task_id);
                self.emit(UploadEvent::RetryScheduled { task_id, attempt, delay });
            }
            None => {
                if let Err(err) = handle.task.transition(UploadStatus::Failed) {
                    tracing::error!(task_id = %task_id, error = %err, "Cannot mark upload failed");
                    return;
                }

                let message = if retryable && handle.task.retry_count > 0 {
                    format!("{} (gave up after {} retries)", err, handle.task.retry_count)
                } else {
                    err.to_string()
                };
                handle.task.error = Some(message.clone());
                handle.task.set_stage(STAGE_FAILED, now);

                let task = handle.task.clone();
                tracing::error!(task_id = %task_id, file = %task.file_name, error = %message, "Upload failed");

                self.emit(UploadEvent::TaskUpdated(task.clone()));
                self.emit(UploadEvent::Failed { task, message });
            }
        }

        self.emit_queue_update();
        self.dirty = true;
    }

    fn handle_retry_due(&mut self, task_id: TaskId) {
        let now = self.ctx.clock.now();
        let Some(handle) = self.tasks.get_mut(&task_id) else { return };
        if !handle.backoff || handle.task.status != UploadStatus::Queued {
            return;
        }

        handle.backoff = false;
        handle.retry_timer = None;
        handle.task.set_stage(STAGE_QUEUED, now);
        self.emit_task(&task_id);
    }

    fn handle_connectivity(&mut self, connectivity: Connectivity) {
        let now = self.ctx.clock.now();
        let mut changed = Vec::new();

        match connectivity {
            Connectivity::Offline => {
                self.online = false;
                for handle in self.tasks.values_mut() {
                    if handle.task.status != UploadStatus::Uploading {
                        continue;
                    }
                    if handle.task.transition(UploadStatus::Paused).is_ok() {
                        // 已上传字节保留，恢复后从服务端偏移量继续
                        handle.stop();
                        handle.task.set_stage(STAGE_PAUSED, now);
                        changed.push(handle.task.id);
                    }
                }
                tracing::info!(paused = changed.len(), "Network offline, uploads paused");
            }
            Connectivity::Online => {
                self.online = true;
                for handle in self.tasks.values_mut() {
                    if handle.task.status != UploadStatus::Paused || handle.payload.is_none() {
                        continue;
                    }
                    if handle.task.transition(UploadStatus::Queued).is_ok() {
                        handle.task.set_stage(STAGE_QUEUED, now);
                        changed.push(handle.task.id);
                    }
                }
                tracing::info!(requeued = changed.len(), "Network online, uploads requeued");
            }
        }

        for task_id in &changed {
            self.emit_task(task_id);
        }
        if !changed.is_empty() {
            self.emit_queue_update();
            self.dirty = true;
        }
    }

    fn handle_mut(&mut self, task_id: TaskId) -> Result<&mut TaskHandle> {
        self.tasks.get_mut(&task_id).ok_or(QueueError::TaskNotFound(task_id))
    }

    fn pause_upload(&mut self, task_id: TaskId) -> Result<()> {
        let now = self.ctx.clock.now();
        let handle = self.handle_mut(task_id)?;
        handle.task.transition(UploadStatus::Paused)?;
        handle.stop();
        handle.task.set_stage(STAGE_PAUSED, now);

        tracing::info!(task_id = %task_id, uploaded = handle.task.uploaded_bytes, "Upload paused");
        self.emit_task(&task_id);
        self.emit_queue_update();
        self.dirty = true;
        Ok(())
    }

    fn resume_upload(&mut self, task_id: TaskId) -> Result<()> {
        let now = self.ctx.clock.now();
        let handle = self.handle_mut(task_id)?;
        if handle.task.status != UploadStatus::Paused {
            return Err(QueueError::InvalidTransition {
                from: handle.task.status,
                to: UploadStatus::Queued,
            });
        }
        if handle.payload.is_none() {
            return Err(QueueError::PayloadMissing(task_id));
        }

        handle.task.transition(UploadStatus::Queued)?;
        handle.task.set_stage(STAGE_QUEUED, now);

        tracing::info!(task_id = %task_id, "Upload resumed");
        self.emit_task(&task_id);
        self.emit_queue_update();
        self.dirty = true;
        Ok(())
    }

    fn retry_upload(&mut self, task_id: TaskId) -> Result<()> {
        let now = self.ctx.clock.now();
        let handle = self.handle_mut(task_id)?;
        if handle.task.status != UploadStatus::Failed {
            return Err(QueueError::InvalidTransition {
                from: handle.task.status,
                to: UploadStatus::Queued,
            });
        }
        if handle.payload.is_none() {
            return Err(QueueError::PayloadMissing(task_id));
        }

        handle.task.transition(UploadStatus::Queued)?;
        handle.stop();
        handle.task.retry_count = 0;
        handle.task.error = None;
        handle.task.set_stage(STAGE_QUEUED, now);

        tracing::info!(task_id = %task_id, "Manual retry");
        self.emit_task(&task_id);
        self.emit_queue_update();
        self.dirty = true;
        Ok(())
    }

    fn cancel_upload(&mut self, task_id: TaskId) -> Result<()> {
        let handle = self.handle_mut(task_id)?;
        handle.task.transition(UploadStatus::Cancelled)?;
        handle.stop();

        let Some(handle) = self.tasks.remove(&task_id) else { return Ok(()) };
        self.persistence.remove_session(&task_id);

        tracing::info!(task_id = %task_id, file = %handle.task.file_name, "Upload cancelled");
        self.emit(UploadEvent::TaskUpdated(handle.task));
        self.emit(UploadEvent::Removed { task_id });
        self.emit_queue_update();
        self.dirty = true;
        Ok(())
    }

    /// 为恢复出来的任务重新挂上文件，名称、大小（以及已知的摘要）必须一致
    async fn reattach(&mut self, task_id: TaskId, payload: FilePayload) -> Result<()> {
        let (file_name, total_bytes, content_hash, pending) = {
            let handle = self.handle_mut(task_id)?;
            (
                handle.task.file_name.clone(),
                handle.task.total_bytes(),
                handle.task.content_hash().map(str::to_string),
                handle.task.rehydration_pending,
            )
        };

        let mismatch = |reason: &str| QueueError::PayloadMismatch {
            task_id,
            reason: reason.to_string(),
        };
        if !pending {
            return Err(mismatch("task is not awaiting its file"));
        }
        if payload.name != file_name {
            return Err(mismatch("file name differs"));
        }
        if payload.len() != total_bytes {
            return Err(mismatch("file size differs"));
        }
        if let Some(expected) = content_hash {
            if payload.content_hash_blocking().await != expected {
                return Err(mismatch("content hash differs"));
            }
        }

        let now = self.ctx.clock.now();
        let handle = self.handle_mut(task_id)?;
        handle.payload = Some(payload);
        handle.task.rehydration_pending = false;
        match handle.task.status {
            UploadStatus::Paused => {
                handle.task.transition(UploadStatus::Queued)?;
                handle.task.set_stage(STAGE_QUEUED, now);
            }
            UploadStatus::Failed => handle.task.set_stage(STAGE_FAILED, now),
            _ => handle.task.set_stage(STAGE_QUEUED, now),
        }

        tracing::info!(task_id = %task_id, "File reattached");
        self.emit_task(&task_id);
        self.emit_queue_update();
        self.dirty = true;
        Ok(())
    }

    fn evict(&mut self, task_id: TaskId) -> Result<()> {
        let handle = self.handle_mut(task_id)?;
        let status = handle.task.status;
        if !matches!(status, UploadStatus::Complete | UploadStatus::Failed) {
            return Err(QueueError::NotEvictable { task_id, status });
        }

        self.tasks.remove(&task_id);
        self.persistence.remove_session(&task_id);

        self.emit(UploadEvent::Removed { task_id });
        self.emit_queue_update();
        self.dirty = true;
        Ok(())
    }

    fn clear_completed(&mut self) -> usize {
        let completed: Vec<TaskId> = self.tasks
            .values()
            .filter(|handle| handle.task.status == UploadStatus::Complete)
            .map(|handle| handle.task.id)
            .collect();

        for task_id in &completed {
            self.tasks.remove(task_id);
            self.persistence.remove_session(task_id);
            self.emit(UploadEvent::Removed { task_id: *task_id });
        }

        if !completed.is_empty() {
            self.emit_queue_update();
            self.dirty = true;
        }
        completed.len()
    }

    /// 按入队顺序排列的所有任务
    fn snapshot(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self.tasks.values().map(|handle| handle.task.clone()).collect();
        tasks.sort_by_key(|task| task.sequence);
        tasks
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_task(&self, task_id: &TaskId) {
        if let Some(handle) = self.tasks.get(task_id) {
            self.emit(UploadEvent::TaskUpdated(handle.task.clone()));
        }
    }

    fn emit_queue_update(&self) {
        self.emit(UploadEvent::QueueUpdated(self.snapshot()));
    }
}
