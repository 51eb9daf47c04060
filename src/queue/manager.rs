use std::sync::Arc;
use futures::Stream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use crate::tus::TusClient;
use crate::utils::RetryPolicy;
use super::callbacks::UploadCallbacks;
use super::engine::EngineContext;
use super::errors::{QueueError, Result};
use super::manager_worker::QueueWorker;
use super::network::NetworkMonitor;
use super::payload::FilePayload;
use super::persistence::{MemoryStateStore, PersistenceLayer, StateStore};
use super::task::UploadTask;
use super::traits::{Clock, IntegrityVerifier, ResumableTransport, SignedUrlProvider, SystemClock};
use super::types::{EnqueueReport, ManagerCommand, QueueConfig, TaskId, UploadEvent};

/// 上传队列，可克隆，所有调用都转发给后台调度任务
#[derive(Clone)]
pub struct UploadQueue {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
    network: NetworkMonitor,
}

/// 上传队列句柄 - 包含队列和调度任务
pub struct UploadQueueHandle {
    pub queue: UploadQueue,
    pub worker_handle: JoinHandle<()>,
}

impl UploadQueueHandle {
    /// 关闭调度任务：停止所有传输并写入最后一次快照
    ///
    /// 其它克隆出去的 `UploadQueue` 仍存活时，调度任务会等它们全部释放。
    pub async fn shutdown(self) -> Result<()> {
        drop(self.queue);
        self.worker_handle.await.map_err(|err| {
            tracing::error!(error = %err, "Upload queue worker panicked");
            QueueError::ManagerShutdown
        })
    }
}

impl UploadQueue {
    pub fn builder(
        provider: Arc<dyn SignedUrlProvider>,
        verifier: Arc<dyn IntegrityVerifier>,
    ) -> UploadQueueBuilder {
        UploadQueueBuilder::new(provider, verifier)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| QueueError::ManagerShutdown)?;

        // 等待响应
        reply_rx.await.map_err(|_| QueueError::ManagerShutdown)
    }

    /// 添加一批文件，重复文件被跳过并在报告中列出
    pub async fn enqueue(
        &self,
        files: Vec<FilePayload>,
        lesson_id: impl Into<String>,
        category: impl Into<String>,
        callbacks: Option<Arc<dyn UploadCallbacks>>,
    ) -> Result<EnqueueReport> {
        let lesson_id = lesson_id.into();
        let category = category.into();

        self.request(|reply| ManagerCommand::Enqueue {
            files,
            lesson_id,
            category,
            callbacks,
            reply,
        })
        .await?
    }

    /// Pause upload task
    pub async fn pause_upload(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::Pause { task_id, reply }).await?
    }

    /// Resume upload
    pub async fn resume_upload(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::Resume { task_id, reply }).await?
    }

    /// 手动重试失败的任务，重试计数归零
    pub async fn retry_upload(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::Retry { task_id, reply }).await?
    }

    /// Cancel upload，任务和它的续传会话一起移除
    pub async fn cancel_upload(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::Cancel { task_id, reply }).await?
    }

    /// 为恢复出来的任务重新提供文件
    pub async fn reattach(&self, task_id: TaskId, payload: FilePayload) -> Result<()> {
        self.request(|reply| ManagerCommand::Reattach { task_id, payload, reply }).await?
    }

    /// 移除一个已完成或失败的任务
    pub async fn evict(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::Evict { task_id, reply }).await?
    }

    /// 返回移除的任务数
    pub async fn clear_completed(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::ClearCompleted { reply }).await
    }

    /// Get task
    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<UploadTask>> {
        self.request(|reply| ManagerCommand::GetTask { task_id, reply }).await
    }

    /// 按入队顺序返回所有任务
    pub async fn get_queue(&self) -> Result<Vec<UploadTask>> {
        self.request(|reply| ManagerCommand::GetQueue { reply }).await
    }

    /// 等待重新提供文件的恢复任务
    pub async fn rehydration_pending(&self) -> Result<Vec<UploadTask>> {
        let tasks = self.get_queue().await?;
        Ok(tasks.into_iter().filter(|task| task.rehydration_pending).collect())
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// 订阅事件
    ///
    /// 注意：
    /// - 如果接收速度跟不上发送速度，可能会丢失事件（lagged error）
    /// - 每个订阅者都会收到完整的事件副本
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F> {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter,
        }
    }

    /// 事件流，落后时跳过丢失的事件，队列关闭后结束
    pub fn events(&self) -> impl Stream<Item = UploadEvent> + Send + 'static {
        futures::stream::unfold(self.event_tx.subscribe(), |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event stream lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }
}

/// 过滤的事件接收器
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<UploadEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&UploadEvent) -> bool,
{
    pub async fn recv(&mut self) -> std::result::Result<UploadEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if (self.filter)(&event) {
                return Ok(event);
            }
        }
    }
}

pub struct UploadQueueBuilder {
    provider: Arc<dyn SignedUrlProvider>,
    verifier: Arc<dyn IntegrityVerifier>,
    transport: Option<Arc<dyn ResumableTransport>>,
    state_store: Option<Arc<dyn StateStore>>,
    clock: Option<Arc<dyn Clock>>,
    network: Option<NetworkMonitor>,
    config: QueueConfig,
    retry_policy: RetryPolicy,
}

impl UploadQueueBuilder {
    pub fn new(provider: Arc<dyn SignedUrlProvider>, verifier: Arc<dyn IntegrityVerifier>) -> Self {
        Self {
            provider,
            verifier,
            transport: None,
            state_store: None,
            clock: None,
            network: None,
            config: QueueConfig::default(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// 默认使用 `TusClient`
    pub fn transport(mut self, transport: Arc<dyn ResumableTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 默认只保存在内存里
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn network(mut self, network: NetworkMonitor) -> Self {
        self.network = Some(network);
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// 启动调度任务，需要在 tokio 运行时内调用
    pub fn build(self) -> UploadQueueHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        let (event_tx, _) = broadcast::channel(self.config.event_capacity.max(1));

        let network = self.network.unwrap_or_default();
        let state_store = self
            .state_store
            .unwrap_or_else(|| Arc::new(MemoryStateStore::new()));

        let ctx = Arc::new(EngineContext {
            provider: self.provider,
            verifier: self.verifier,
            transport: self.transport.unwrap_or_else(|| Arc::new(TusClient::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
        });

        let worker = QueueWorker::new(
            ctx,
            self.retry_policy,
            PersistenceLayer::new(state_store),
            event_tx.clone(),
            network.is_online(),
        );
        let worker_handle = tokio::spawn(worker.run(command_rx, network.subscribe()));

        let queue = UploadQueue {
            command_tx,
            event_tx,
            network,
        };

        UploadQueueHandle {
            queue,
            worker_handle,
        }
    }
}
