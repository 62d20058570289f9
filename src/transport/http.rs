//! HTTP 传输：每个 Agent 在固定路径接收 POST，请求体与响应体都是协议 JSON

use std::time::Duration;

use async_trait::async_trait;

use super::Transport;
use crate::core::error::TransportError;

/// 出站 HTTP 客户端（reqwest）
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// `timeout` 为单次请求的硬超时；重试与熔断由 ConnectionManager 负责
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| map_reqwest_error(endpoint, e))
    }
}

fn map_reqwest_error(endpoint: &str, e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout {
            endpoint: endpoint.to_string(),
            after_ms: 0,
        }
    } else if e.is_connect() {
        TransportError::Unreachable(endpoint.to_string())
    } else {
        TransportError::Io(e.to_string())
    }
}

#[cfg(feature = "http-server")]
pub const LEAGUE_PATH: &str = "/league";

/// 对外暴露一个 Agent：`POST /league`，`GET /health`
#[cfg(feature = "http-server")]
pub async fn serve(
    listener: tokio::net::TcpListener,
    handler: std::sync::Arc<dyn super::MessageHandler>,
    shutdown: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    use axum::{
        body::Bytes,
        extract::State,
        http::header,
        routing::{get, post},
        Router,
    };
    use std::sync::Arc;

    async fn receive(
        State(handler): State<Arc<dyn super::MessageHandler>>,
        body: Bytes,
    ) -> ([(header::HeaderName, &'static str); 1], Vec<u8>) {
        let response = super::dispatch(handler.as_ref(), &body).await;
        ([(header::CONTENT_TYPE, "application/json")], response)
    }

    let app = Router::new()
        .route(LEAGUE_PATH, post(receive))
        .route("/health", get(|| async { "OK" }))
        .with_state(handler);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Agent listening on http://{}{}", addr, LEAGUE_PATH);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let transport = HttpTransport::new(Duration::from_millis(500)).unwrap();
        // 端口 9 (discard) 在测试环境中通常没有监听
        let err = transport
            .send("http://127.0.0.1:9/league", b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
