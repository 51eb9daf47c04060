use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{bail, Context};
use futures::StreamExt;
use lesson_upload::logging::{init_logging, LogFormat};
use lesson_upload::queue::FileStateStore;
use lesson_upload::utils::{format_bytes, format_duration, format_speed};
use lesson_upload::{
    AppConfig,
    FilePayload,
    HttpIntegrityVerifier,
    HttpSignedUrlProvider,
    TusClient,
    UploadEvent,
    UploadQueue,
    UploadStatus,
};

const USAGE: &str = "usage: lesson-upload <config.toml> <lesson_id> <category> <files...>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(lesson_id), Some(category)) = (args.next(), args.next(), args.next()) else {
        bail!(USAGE);
    };
    let files: Vec<PathBuf> = args.map(PathBuf::from).collect();
    if files.is_empty() {
        bail!(USAGE);
    }

    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Can't load {}", config_path))?;
    init_logging(&config.logging.level, LogFormat::from_json_flag(config.logging.json))?;

    let handle = UploadQueue::builder(
        Arc::new(HttpSignedUrlProvider::from_config(&config.backend)),
        Arc::new(HttpIntegrityVerifier::from_config(&config.backend)),
    )
    .transport(Arc::new(TusClient::new()))
    .state_store(Arc::new(FileStateStore::new(&config.storage.state_dir)))
    .config(config.queue.clone())
    .retry_policy(config.retry.clone())
    .build();
    let queue = handle.queue.clone();

    // 先订阅，避免漏掉第一批事件
    let mut events = Box::pin(queue.events());

    let mut payloads = Vec::with_capacity(files.len());
    for path in &files {
        let payload = FilePayload::from_path(path)
            .await
            .with_context(|| format!("Can't read {}", path.display()))?;
        payloads.push(payload);
    }

    let report = queue.enqueue(payloads, lesson_id, category, None).await?;
    for skipped in &report.skipped {
        println!("skipped {} (already queued)", skipped.file_name);
    }

    let mut pending: HashSet<_> = report
        .queued
        .iter()
        .chain(report.reattached.iter())
        .copied()
        .collect();
    let mut failed = 0usize;

    while !pending.is_empty() {
        let Some(event) = events.next().await else { break };

        match event {
            UploadEvent::TaskUpdated(task) if task.status() == UploadStatus::Uploading => {
                let (speed, eta) = match task.estimate {
                    Some(estimate) => (
                        format_speed(estimate.average_speed),
                        estimate.eta.map(format_duration).unwrap_or_else(|| "-".to_string()),
                    ),
                    None => ("-".to_string(), "-".to_string()),
                };
                println!(
                    "{} [{}] {}% {}/{} {} eta {}",
                    task.file_name,
                    task.stage,
                    task.progress,
                    format_bytes(task.uploaded_bytes),
                    format_bytes(task.total_bytes()),
                    speed,
                    eta,
                );
            }
            UploadEvent::RetryScheduled { task_id, attempt, delay } => {
                println!("{} retry #{} in {}", task_id, attempt, format_duration(delay));
            }
            UploadEvent::Completed(task) => {
                println!("{} complete", task.file_name);
                pending.remove(&task.id);
            }
            UploadEvent::Failed { task, message } => {
                println!("{} failed: {}", task.file_name, message);
                pending.remove(&task.id);
                failed += 1;
            }
            UploadEvent::Removed { task_id } => {
                pending.remove(&task_id);
            }
            _ => {}
        }
    }

    drop(queue);
    handle.shutdown().await?;

    if failed > 0 {
        bail!("{} upload(s) failed", failed);
    }
    Ok(())
}
