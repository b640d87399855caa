//! 平台出站传输
//!
//! 编排器只依赖 [`ProviderTransport`]，生产环境使用基于 reqwest 的
//! [`HttpProviderTransport`]，测试注入脚本化实现。

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use crate::adapter::{HttpMethod, ProviderEndpoint};
use crate::error::{MenuSyncError, Result};
use crate::platform::PlatformType;
use crate::version::user_agent;

/// 关联 id 请求头，值为 sync_id
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

/// 一次出站请求
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub platform: PlatformType,
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub correlation_id: String,
}

impl ProviderRequest {
    /// 由端点 + 载荷构造请求，附带 JSON 内容类型、关联 id 和 User-Agent
    pub fn new(
        platform: PlatformType,
        endpoint: ProviderEndpoint,
        body: Bytes,
        correlation_id: &str,
    ) -> Self {
        let mut headers = endpoint.headers;
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
        headers.push((CORRELATION_HEADER.to_string(), correlation_id.to_string()));
        headers.push(("User-Agent".to_string(), user_agent()));
        Self {
            platform,
            method: endpoint.method,
            url: endpoint.url,
            headers,
            body,
            correlation_id: correlation_id.to_string(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 平台 2xx 响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

/// 连接类错误的细分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    Refused,
    Reset,
    Dns,
    Other,
}

/// 平台调用失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderCallError {
    #[error("request timed out")]
    Timeout,
    #[error("connection error ({kind:?}): {message}")]
    Connection {
        kind: ConnectionErrorKind,
        message: String,
    },
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("{0}")]
    Other(String),
}

impl ProviderCallError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderCallError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// 平台传输抽象
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(&self, request: ProviderRequest) -> std::result::Result<RawResponse, ProviderCallError>;
}

/// reqwest 实现
pub struct HttpProviderTransport {
    client: Client,
}

impl HttpProviderTransport {
    /// 创建 HTTP 传输（超时由编排器按平台策略另行控制，这里只设连接超时上限）
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| MenuSyncError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;
        info!("✅ 平台 HTTP 传输已创建");
        Ok(Self { client })
    }

    fn classify(error: reqwest::Error) -> ProviderCallError {
        if error.is_timeout() {
            return ProviderCallError::Timeout;
        }
        if error.is_connect() {
            let message = error.to_string();
            let lower = message.to_ascii_lowercase();
            let kind = if lower.contains("refused") {
                ConnectionErrorKind::Refused
            } else if lower.contains("reset") {
                ConnectionErrorKind::Reset
            } else if lower.contains("dns") || lower.contains("resolve") {
                ConnectionErrorKind::Dns
            } else {
                ConnectionErrorKind::Other
            };
            return ProviderCallError::Connection { kind, message };
        }
        ProviderCallError::Other(error.to_string())
    }
}

#[async_trait]
impl ProviderTransport for HttpProviderTransport {
    async fn send(&self, request: ProviderRequest) -> std::result::Result<RawResponse, ProviderCallError> {
        let mut builder = match request.method {
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Put => self.client.put(&request.url),
            HttpMethod::Patch => self.client.patch(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        debug!(
            "📤 [{}] {:?} {} ({} bytes, correlation_id={})",
            request.platform,
            request.method,
            request.url,
            request.body.len(),
            request.correlation_id
        );

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(Self::classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(Self::classify)?;

        if (200..300).contains(&status) {
            Ok(RawResponse { status, body })
        } else {
            Err(ProviderCallError::Http {
                status,
                body: String::from_utf8_lossy(&body).chars().take(512).collect(),
            })
        }
    }
}
