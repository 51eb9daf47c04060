use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::utils::progress::ProgressEstimate;
use super::errors::{QueueError, Result};
use super::payload::FilePayload;
use super::types::{TaskId, UploadStatus};

pub const STAGE_QUEUED: &str = "queued";
pub const STAGE_HASHING: &str = "hashing";
pub const STAGE_AUTHORIZING: &str = "authorizing";
pub const STAGE_UPLOADING: &str = "uploading";
pub const STAGE_VERIFYING: &str = "verifying";
pub const STAGE_COMPLETE: &str = "complete";
pub const STAGE_PAUSED: &str = "paused";
pub const STAGE_RETRYING: &str = "retrying";
pub const STAGE_FAILED: &str = "failed";
pub const STAGE_AWAITING_FILE: &str = "awaiting file";

/// 上传任务描述，可序列化；文件内容与传输句柄不在此结构中
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub file_name: String,
    pub file_type: Option<String>,
    pub lesson_id: String,
    pub category: String,
    pub(crate) status: UploadStatus,
    /// 0 - 100
    pub progress: u8,
    pub uploaded_bytes: u64,
    pub(crate) total_bytes: u64,
    pub retry_count: u32,
    pub error: Option<String>,
    /// 当前阶段（可读文本）
    pub stage: String,
    pub(crate) content_hash: Option<String>,
    pub storage_path: Option<String>,
    /// 签名上传地址
    pub upload_endpoint: Option<String>,
    /// tus 上传会话地址
    pub resumable_url: Option<String>,
    pub url_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stage_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 入队顺序，决定 FIFO
    pub(crate) sequence: u64,
    /// 从本地状态恢复、等待重新提供文件
    #[serde(default)]
    pub rehydration_pending: bool,
    #[serde(skip)]
    pub estimate: Option<ProgressEstimate>,
}

impl UploadTask {
    pub(crate) fn new(
        payload: &FilePayload,
        lesson_id: &str,
        category: &str,
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            file_name: payload.name.clone(),
            file_type: payload.mime_type.clone(),
            lesson_id: lesson_id.to_string(),
            category: category.to_string(),
            status: UploadStatus::Queued,
            progress: 0,
            uploaded_bytes: 0,
            total_bytes: payload.len(),
            retry_count: 0,
            error: None,
            stage: STAGE_QUEUED.to_string(),
            content_hash: None,
            storage_path: None,
            upload_endpoint: None,
            resumable_url: None,
            url_expires_at: None,
            created_at: now,
            started_at: None,
            stage_started_at: Some(now),
            completed_at: None,
            sequence,
            rehydration_pending: false,
            estimate: None,
        }
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub fn is_valid_transition(from: UploadStatus, to: UploadStatus) -> bool {
        from.can_transition_to(to)
    }

    /// 按状态机迁移，非法迁移返回错误且不修改状态
    pub(crate) fn transition(&mut self, to: UploadStatus) -> Result<UploadStatus> {
        let from = self.status;
        if !Self::is_valid_transition(from, to) {
            return Err(QueueError::InvalidTransition { from, to });
        }

        self.status = to;
        Ok(from)
    }

    /// 摘要只允许写入一次
    pub(crate) fn set_content_hash(&mut self, hash: String) -> bool {
        if self.content_hash.is_some() {
            return false;
        }

        self.content_hash = Some(hash);
        true
    }

    pub(crate) fn set_stage(&mut self, stage: &str, now: DateTime<Utc>) {
        if self.stage != stage {
            self.stage = stage.to_string();
            self.stage_started_at = Some(now);
        }
    }

    /// 记录已上传字节，上传期间进度只增不减
    pub(crate) fn record_progress(&mut self, uploaded_bytes: u64) -> bool {
        let uploaded_bytes = uploaded_bytes.min(self.total_bytes);
        if uploaded_bytes < self.uploaded_bytes {
            return false;
        }

        self.uploaded_bytes = uploaded_bytes;
        let progress = self.percentage();
        if progress > self.progress {
            self.progress = progress;
        }
        true
    }

    /// 丢弃 tus 会话，下一次尝试重新创建上传并从头发送
    pub(crate) fn discard_session(&mut self) {
        self.resumable_url = None;
        self.uploaded_bytes = 0;
        self.progress = 0;
        self.estimate = None;
    }

    pub(crate) fn percentage(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }

        ((self.uploaded_bytes as u128 * 100) / self.total_bytes as u128).min(100) as u8
    }

    pub fn is_large(&self, threshold: u64) -> bool {
        self.total_bytes > threshold
    }

    /// 同名、同大小、同课程
    pub fn matches_file(&self, file_name: &str, file_size: u64, lesson_id: &str) -> bool {
        self.file_name == file_name && self.total_bytes == file_size && self.lesson_id == lesson_id
    }

    /// 用于查找未完成的 tus 上传
    pub fn fingerprint(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.lesson_id,
            self.file_name,
            self.total_bytes,
            self.content_hash.as_deref().unwrap_or("-"),
        )
    }
}
