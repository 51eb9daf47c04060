use std::path::Path;
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// 待上传文件内容，只存在于内存中，不会被持久化
#[derive(Clone)]
pub struct FilePayload {
    pub name: String,
    pub mime_type: Option<String>,
    data: Bytes,
}

impl FilePayload {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
            data: data.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// 从磁盘读取整个文件
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Can't read file name of {}", path.display()),
            ))?
            .to_string();
        let data = tokio::fs::read(path).await?;

        let payload = Self::new(name, data);
        Ok(match mime_guess::from_path(path).first() {
            Some(mime) => payload.with_mime_type(mime.essence_str()),
            None => payload,
        })
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// `[start, end)` 区间的数据，越界部分被截断
    pub fn slice(&self, start: u64, end: u64) -> Bytes {
        let len = self.data.len();
        let start = (start as usize).min(len);
        let end = (end as usize).min(len).max(start);
        self.data.slice(start..end)
    }

    /// SHA-256 十六进制摘要
    pub fn content_hash(&self) -> String {
        sha256_hex(&self.data)
    }

    /// 在阻塞线程中计算摘要，避免大文件阻塞调度循环
    pub async fn content_hash_blocking(&self) -> String {
        let data = self.data.clone();
        match tokio::task::spawn_blocking(move || sha256_hex(&data)).await {
            Ok(hash) => hash,
            Err(_) => self.content_hash(),
        }
    }
}

impl std::fmt::Debug for FilePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePayload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
