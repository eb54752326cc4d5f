//! HTTP surface: OpenAI-compatible chat completions plus a health probe.
//!
//! - `POST /v1/chat/completions`: plain content stream (V1 adapter)
//! - `POST /v2/chat/completions`: extended task-tree stream (V2 adapter)
//! - `GET  /health`: `(status, active_requests, pool_size)`
//!
//! Every response is an SSE stream terminated by `data: [DONE]`, including
//! failed tasks. Client disconnects are detected through the response
//! channel: the first failed send fires the task's [`CancelToken`], and the
//! orchestrator stops at its next cancellation check.

use crate::adapter::{ChatChunk, V1Adapter, V2Adapter};
use crate::events::EventSink;
use crate::pool::{PipelineLease, PipelinePool};
use crate::types::ChatCompletionRequest;
use crate::{Error, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

/// Which response format a route speaks.
#[derive(Clone, Copy)]
enum AdapterVersion {
    V1,
    V2,
}

enum StreamAdapter {
    V1(V1Adapter),
    V2(V2Adapter),
}

impl StreamAdapter {
    fn new(version: AdapterVersion, model: &str) -> Self {
        match version {
            AdapterVersion::V1 => StreamAdapter::V1(V1Adapter::new(model)),
            AdapterVersion::V2 => StreamAdapter::V2(V2Adapter::new(model)),
        }
    }

    fn on_event(&mut self, event: &crate::events::AgentEvent) -> Vec<ChatChunk> {
        match self {
            StreamAdapter::V1(a) => a.on_event(event),
            StreamAdapter::V2(a) => a.on_event(event),
        }
    }

    fn finish(&mut self) -> Vec<ChatChunk> {
        match self {
            StreamAdapter::V1(a) => a.finish(),
            StreamAdapter::V2(a) => a.finish(),
        }
    }
}

/// Build the service router.
pub fn router(pool: Arc<PipelinePool>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions_v1))
        .route("/v2/chat/completions", post(chat_completions_v2))
        .route("/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(pool)
}

/// Bind and serve until ctrl-c, then drain the pool.
pub async fn serve(pool: Arc<PipelinePool>) -> Result<()> {
    let settings = pool.settings();
    let addr: SocketAddr = settings
        .listen_addr
        .parse()
        .map_err(|e| Error::config(format!("bad listen_addr {}: {}", settings.listen_addr, e)))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::other(format!("bind {}: {}", addr, e)))?;
    tracing::info!(%addr, "listening");

    let app = router(pool.clone());
    let grace = Duration::from_secs(settings.shutdown_grace_secs);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            pool.shutdown(grace).await;
        })
        .await
        .map_err(|e| Error::other(format!("server error: {}", e)))
}

async fn health(State(pool): State<Arc<PipelinePool>>) -> impl IntoResponse {
    let health = pool.health();
    Json(json!({
        "status": "healthy",
        "active_requests": health.active_requests,
        "pool_size": health.pool_size,
    }))
}

async fn chat_completions_v1(
    State(pool): State<Arc<PipelinePool>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    stream_completion(pool, request, AdapterVersion::V1).await
}

async fn chat_completions_v2(
    State(pool): State<Arc<PipelinePool>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    stream_completion(pool, request, AdapterVersion::V2).await
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({"error": {"message": message, "type": "invalid_request_error"}})),
    )
        .into_response()
}

/// Frame one chunk as an SSE event.
fn sse_frame(chunk: &ChatChunk) -> String {
    match serde_json::to_string(chunk) {
        Ok(body) => format!("data: {}\n\n", body),
        Err(e) => {
            tracing::error!(error = %e, "unserializable chunk");
            String::new()
        }
    }
}

async fn stream_completion(
    pool: Arc<PipelinePool>,
    request: ChatCompletionRequest,
    version: AdapterVersion,
) -> Response {
    let Some(task_text) = request.task_text().map(str::to_string) else {
        return error_response(StatusCode::BAD_REQUEST, "no user message in request");
    };

    let lease = match pool.acquire().await {
        Ok(lease) => lease,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    };

    let settings = pool.settings();
    let model = if request.model.is_empty() {
        settings.llm.model_name.clone()
    } else {
        request.model.clone()
    };

    let (sse_tx, sse_rx) = mpsc::channel::<String>(64);
    drive_task(lease, task_text, model, version, sse_tx);

    let body = Body::from_stream(
        ReceiverStream::new(sse_rx).map(|frame| Ok::<String, std::convert::Infallible>(frame)),
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Spawn the orchestrator and the event→SSE pump for one request. The
/// lease lives exactly as long as the orchestrator task.
fn drive_task(
    lease: PipelineLease,
    task_text: String,
    model: String,
    version: AdapterVersion,
    sse_tx: mpsc::Sender<String>,
) {
    let (events, mut events_rx) = EventSink::channel();
    let cancel = lease.cancel_token();

    // Event pump: adapter state machine feeding the SSE channel. A failed
    // send means the client went away; cancel the task.
    let pump_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut adapter = StreamAdapter::new(version, &model);
        while let Some(event) = events_rx.recv().await {
            for chunk in adapter.on_event(&event) {
                if sse_tx.send(sse_frame(&chunk)).await.is_err() {
                    pump_cancel.cancel();
                    return;
                }
            }
        }
        // Producer is done; close anything left open, then the sentinel.
        for chunk in adapter.finish() {
            if sse_tx.send(sse_frame(&chunk)).await.is_err() {
                return;
            }
        }
        let _ = sse_tx.send("data: [DONE]\n\n".to_string()).await;
    });

    tokio::spawn(async move {
        let settings = lease.pool_settings();
        let orchestrator = lease
            .instance()
            .orchestrator(settings.clone(), events, cancel.clone());
        let task_timeout = Duration::from_secs(settings.task_timeout_secs);

        match tokio::time::timeout(task_timeout, orchestrator.run(&task_text)).await {
            Ok(report) => {
                tracing::info!(outcome = report.outcome.as_str(), "task finished");
            }
            Err(_) => {
                // The run future is dropped on timeout; its event sink goes
                // with it, which lets the pump close the stream.
                tracing::warn!("task hit the global timeout");
                cancel.cancel();
            }
        }
        drop(lease);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::llm::LanguageModel;
    use crate::mcp::ToolDispatch;
    use crate::pool::PipelineInstance;
    use crate::types::{Completion, Message, ToolCatalogEntry, ToolResult};
    use async_trait::async_trait;

    struct DirectAnswer;

    #[async_trait]
    impl LanguageModel for DirectAnswer {
        async fn generate(&self, messages: &[Message], _: u32) -> crate::Result<Completion> {
            // Second call (finalization) carries the summary prompt.
            let text = if messages
                .iter()
                .any(|m| m.content.contains("\\boxed{"))
            {
                "\\boxed{4}".to_string()
            } else {
                "It is 4.".to_string()
            };
            Ok(Completion {
                text,
                prompt_tokens: 5,
                completion_tokens: 5,
            })
        }

        fn estimate_tokens(&self, text: &str) -> usize {
            text.len() / 4
        }

        fn max_context_length(&self) -> usize {
            100_000
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolDispatch for NoTools {
        fn catalog(&self) -> &[ToolCatalogEntry] {
            &[]
        }

        async fn invoke(&self, _: &str, tool: &str, _: &serde_json::Value) -> ToolResult {
            ToolResult::ok(tool, "")
        }
    }

    fn test_pool() -> Arc<PipelinePool> {
        PipelinePool::with_instances(
            Arc::new(Settings::default()),
            vec![PipelineInstance {
                id: 0,
                llm: Arc::new(DirectAnswer),
                summarizer: Arc::new(DirectAnswer),
                tools: Arc::new(NoTools),
            }],
            2,
        )
    }

    #[tokio::test]
    async fn test_health_handler() {
        let pool = test_pool();
        let response = health(State(pool)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["pool_size"], 1);
        assert_eq!(body["active_requests"], 0);
    }

    #[tokio::test]
    async fn test_request_without_user_message_is_rejected() {
        let pool = test_pool();
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "agent",
            "messages": [{"role": "system", "content": "only system"}]
        }))
        .unwrap();
        let response = stream_completion(pool, request, AdapterVersion::V2).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_v1_stream_ends_with_done() {
        let pool = test_pool();
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "agent",
            "messages": [{"role": "user", "content": "What is 2+2?"}],
            "stream": true
        }))
        .unwrap();
        let response = stream_completion(pool, request, AdapterVersion::V1).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\"content\":\"4\""));
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }
}
