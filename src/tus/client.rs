use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use url::Url;
use crate::queue::{ResumableTransport, SignedUpload, TransferError};
use super::constants::{DEFAULT_TIMEOUT, OFFSET_OCTET_STREAM, TUS_RESUMABLE};
use super::metadata::Metadata;

/// tus 1.0 客户端，认证信息来自签名上传授权
#[derive(Debug, Clone)]
pub struct TusClient {
    client: Client,
}

impl Default for TusClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TusClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT))
            .tcp_nodelay(true)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn create_headers(auth: &SignedUpload) -> Result<HeaderMap, TransferError> {
        let mut headers = HeaderMap::new();
        headers.insert("Tus-Resumable", HeaderValue::from_static(TUS_RESUMABLE));
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", auth.token))?,
        );

        Ok(headers)
    }

    pub fn parse_offset_header(status: u16, headers: &HeaderMap) -> Result<u64, TransferError> {
        match headers.get("Upload-Offset") {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .ok_or_else(|| TransferError::server_error(status, "Malformed 'upload-offset' header")),
            None => Err(TransferError::server_error(status, "No 'upload-offset' header in response")),
        }
    }

    /// 把服务端状态码映射为传输错误
    fn check_status(status: StatusCode, upload_url: &str, context: &str) -> Result<(), TransferError> {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TransferError::AuthExpired),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(TransferError::SessionGone(upload_url.to_string())),
            status => Err(TransferError::server_error(status.as_u16(), context)),
        }
    }

    /// 相对的 Location 基于 endpoint 解析
    fn resolve_location(endpoint: &str, location: &str) -> Result<String, TransferError> {
        if location.starts_with("http") {
            return Ok(location.to_string());
        }

        let base = Url::parse(endpoint)
            .map_err(|_| TransferError::ParamError(format!("Invalid url: {:?}", endpoint)))?;
        let url = base
            .join(location)
            .map_err(|_| TransferError::ParamError(format!("Invalid location: {:?}", location)))?;

        Ok(url.to_string())
    }
}

#[async_trait]
impl ResumableTransport for TusClient {
    async fn create_upload(
        &self,
        auth: &SignedUpload,
        total_bytes: u64,
        metadata: &HashMap<String, String>,
    ) -> Result<String, TransferError> {
        let mut headers = TusClient::create_headers(auth)?;
        headers.insert("Upload-Length", HeaderValue::from_str(&total_bytes.to_string())?);

        let metadata = Metadata::from_map(metadata);
        if !metadata.is_empty() {
            headers.insert("Upload-Metadata", HeaderValue::from_str(&metadata.to_header())?);
        }

        let response = self
            .client
            .post(&auth.upload_url)
            .headers(headers)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            TusClient::check_status(status, &auth.upload_url, "Failed to create upload")?;
        }

        let location = response
            .headers()
            .get("location")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| TransferError::server_error(status.as_u16(), "Not 'location' header in response"))?;

        TusClient::resolve_location(&auth.upload_url, location)
    }

    async fn get_offset(&self, auth: &SignedUpload, upload_url: &str) -> Result<u64, TransferError> {
        let headers = TusClient::create_headers(auth)?;
        let response = self.client.head(upload_url).headers(headers).send().await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
            TusClient::check_status(status, upload_url, "Failed to get upload offset")?;
        }

        TusClient::parse_offset_header(status.as_u16(), response.headers())
    }

    async fn upload_chunk(
        &self,
        auth: &SignedUpload,
        upload_url: &str,
        offset: u64,
        chunk: Bytes,
    ) -> Result<u64, TransferError> {
        let chunk_len = chunk.len() as u64;
        let mut headers = TusClient::create_headers(auth)?;
        headers.insert("Upload-Offset", HeaderValue::from_str(&offset.to_string())?);
        headers.insert("Content-Type", HeaderValue::from_static(OFFSET_OCTET_STREAM));

        let response = self
            .client
            .patch(upload_url)
            .headers(headers)
            .body(chunk)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            TusClient::check_status(status, upload_url, "Failed to patch file")?;
        }

        let next_offset = TusClient::parse_offset_header(status.as_u16(), response.headers())?;
        if next_offset < offset + chunk_len {
            return Err(TransferError::UploadIncomplete {
                expected: offset + chunk_len,
                actual: next_offset,
            });
        }

        Ok(next_offset)
    }
}
