use std::collections::HashMap;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use super::errors::TransferError;

/// 申请上传授权的请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub file_name: String,
    pub file_size: u64,
    pub lesson_id: String,
    pub category: String,
    pub content_hash: String,
}

/// 后端返回的上传授权
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAuthorization {
    pub upload_url: String,
    pub storage_path: String,
    pub token: String,
}

/// 带过期时间的签名上传地址，token 只保存在内存中
#[derive(Debug, Clone)]
pub struct SignedUpload {
    pub upload_url: String,
    pub storage_path: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl SignedUpload {
    pub fn expires_within(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub storage_path: String,
    pub expected_size: u64,
    pub expected_hash: String,
    pub lesson_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub verified: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// 签发/刷新限时上传授权，需支持重复调用
#[async_trait]
pub trait SignedUrlProvider: Send + Sync {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<UploadAuthorization, TransferError>;
}

/// 服务端完整性校验
#[async_trait]
pub trait IntegrityVerifier: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationOutcome, TransferError>;
}

/// 可续传的传输协议（tus）
///
/// 授权过期时实现必须返回 `TransferError::AuthExpired`，
/// 会话不存在时返回 `TransferError::SessionGone`。
#[async_trait]
pub trait ResumableTransport: Send + Sync {
    /// 创建上传会话，返回会话地址
    async fn create_upload(
        &self,
        auth: &SignedUpload,
        total_bytes: u64,
        metadata: &HashMap<String, String>,
    ) -> Result<String, TransferError>;

    /// 查询服务端已确认的偏移量
    async fn get_offset(&self, auth: &SignedUpload, upload_url: &str) -> Result<u64, TransferError>;

    /// 上传一块数据，返回新的偏移量
    async fn upload_chunk(
        &self,
        auth: &SignedUpload,
        upload_url: &str,
        offset: u64,
        chunk: Bytes,
    ) -> Result<u64, TransferError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_json_is_camel_case() {
        let request = AuthorizationRequest {
            file_name: "deck.pdf".to_string(),
            file_size: 10,
            lesson_id: "l1".to_string(),
            category: "slides".to_string(),
            content_hash: "abc".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["fileName"], "deck.pdf");
        assert_eq!(json["contentHash"], "abc");

        let outcome: VerificationOutcome = serde_json::from_str(r#"{"verified":true}"#).unwrap();
        assert!(outcome.verified);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_signed_upload_expiry_margin() {
        let now = Utc::now();
        let signed = SignedUpload {
            upload_url: "https://up.example.com/files".to_string(),
            storage_path: "lessons/l1/deck.pdf".to_string(),
            token: "t".to_string(),
            expires_at: now + chrono::Duration::seconds(20),
        };

        assert!(signed.expires_within(now, chrono::Duration::seconds(30)));
        assert!(!signed.expires_within(now, chrono::Duration::seconds(10)));
    }
}
