//! 后端协作方的 HTTP 实现：签发上传授权、完整性校验

use std::time::Duration;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use crate::config::BackendConfig;
use crate::queue::{
    AuthorizationRequest,
    IntegrityVerifier,
    SignedUrlProvider,
    TransferError,
    UploadAuthorization,
    VerificationOutcome,
    VerificationRequest,
};

const BACKEND_TIMEOUT: u64 = 30;

/// 以 JSON POST 调用后端接口
#[derive(Debug, Clone)]
struct JsonEndpoint {
    client: Client,
    url: String,
    token: String,
}

impl JsonEndpoint {
    fn new(client: Client, url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token: token.into(),
        }
    }

    fn headers(&self) -> Result<HeaderMap, TransferError> {
        let mut headers = HeaderMap::new();
        if !self.token.is_empty() {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", self.token))?);
        }
        Ok(headers)
    }

    async fn post<B, R>(&self, body: &B) -> Result<Result<R, (StatusCode, String)>, TransferError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(Ok(response.json::<R>().await?));
        }

        Ok(Err((status, error_message(response).await)))
    }
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(text) if !text.trim().is_empty() => text,
        _ => status.canonical_reason().unwrap_or("unknown error").to_string(),
    }
}

/// 服务端暂时不可用时按可重试的服务端错误处理
fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS
}

fn default_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(BACKEND_TIMEOUT))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// `POST {authorize_url}` 换取签名上传地址
#[derive(Debug, Clone)]
pub struct HttpSignedUrlProvider {
    endpoint: JsonEndpoint,
}

impl HttpSignedUrlProvider {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(default_client(), url, token)
    }

    pub fn with_client(client: Client, url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: JsonEndpoint::new(client, url, token),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(&config.authorize_url, &config.token)
    }
}

#[async_trait]
impl SignedUrlProvider for HttpSignedUrlProvider {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<UploadAuthorization, TransferError> {
        tracing::debug!(file = %request.file_name, size = request.file_size, "Requesting upload authorization");

        match self.endpoint.post::<_, UploadAuthorization>(request).await? {
            Ok(authorization) => Ok(authorization),
            Err((status, message)) if is_transient(status) => {
                Err(TransferError::server_error(status.as_u16(), message))
            }
            Err((status, message)) => Err(TransferError::Authorization(format!("{}: {}", status, message))),
        }
    }
}

/// `POST {verify_url}` 校验已上传对象的大小和摘要
#[derive(Debug, Clone)]
pub struct HttpIntegrityVerifier {
    endpoint: JsonEndpoint,
}

impl HttpIntegrityVerifier {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(default_client(), url, token)
    }

    pub fn with_client(client: Client, url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: JsonEndpoint::new(client, url, token),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(&config.verify_url, &config.token)
    }
}

#[async_trait]
impl IntegrityVerifier for HttpIntegrityVerifier {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationOutcome, TransferError> {
        tracing::debug!(storage_path = %request.storage_path, "Verifying uploaded object");

        match self.endpoint.post::<_, VerificationOutcome>(request).await? {
            Ok(outcome) => Ok(outcome),
            Err((status, message)) if is_transient(status) => {
                Err(TransferError::server_error(status.as_u16(), message))
            }
            Err((status, message)) => Err(TransferError::Verification(format!("{}: {}", status, message))),
        }
    }
}
