use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use super::task::UploadTask;
use super::types::{DuplicateSkipped, TaskId, UploadEvent};

/// 回调接口，默认实现为空
///
/// 任务相关的回调在独立任务中被调用，不会阻塞调度循环；
/// `on_duplicate_skipped` 在 enqueue 返回前同步调用，实现里不要做耗时操作。
pub trait UploadCallbacks: Send + Sync {
    fn on_task_update(&self, _task: &UploadTask) {}

    fn on_queue_update(&self, _tasks: &[UploadTask]) {}

    fn on_complete(&self, _task: &UploadTask) {}

    fn on_error(&self, _task: &UploadTask, _message: &str) {}

    fn on_duplicate_skipped(&self, _skipped: &DuplicateSkipped) {}
}

/// 把事件流中属于 `task_ids` 的事件转发给回调，直到这些任务全部完成或被移除
pub(crate) fn spawn_callback_bridge(
    mut receiver: broadcast::Receiver<UploadEvent>,
    task_ids: HashSet<TaskId>,
    callbacks: Arc<dyn UploadCallbacks>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut remaining = task_ids.clone();

        while !remaining.is_empty() {
            let event = match receiver.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Callback bridge lagged behind upload events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if let UploadEvent::QueueUpdated(tasks) = &event {
                callbacks.on_queue_update(tasks);
                continue;
            }

            let Some(task_id) = event.task_id() else { continue };
            if !task_ids.contains(&task_id) {
                continue;
            }

            match &event {
                UploadEvent::TaskUpdated(task) => callbacks.on_task_update(task),
                UploadEvent::Completed(task) => {
                    callbacks.on_complete(task);
                    remaining.remove(&task_id);
                }
                UploadEvent::Failed { task, message } => callbacks.on_error(task, message),
                UploadEvent::Removed { .. } => {
                    remaining.remove(&task_id);
                }
                _ => {}
            }
        }
    })
}
