//! Thin axum ingress for the two chat dialects.
//!
//! The wire server stays deliberately small: parse, hand off to the pipeline
//! executor, render. Anthropic streams go out as named SSE events, OpenAI
//! streams as `data:` chunks with a terminal `[DONE]`.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use llmux_auth::{AuthHandler, HealthReport, HealthStatus, Reauthenticator, Refresher, TokenStatus};
use llmux_common::{ErrorResponse, PipelineError, codes};
use llmux_pipeline::{CancelHandle, PipelineExecutor, PipelineOutcome, cancel_pair};
use llmux_sched::DedupCoordinator;
use llmux_transform::{ChatRequest, ChatResponse, Dialect, StreamFrame};

/// Per-instance handle onto the auth lifecycle, retained so `/healthz` can
/// run the enhanced health check against every instance.
pub struct InstanceHealth {
    pub instance_id: String,
    pub auth: Arc<AuthHandler>,
    pub refresher: Arc<dyn Refresher>,
    pub reauthenticator: Arc<dyn Reauthenticator>,
    /// Instances without credentials (auth mode none) always report healthy.
    pub requires_auth: bool,
}

impl InstanceHealth {
    pub async fn check(&self) -> HealthReport {
        if !self.requires_auth {
            return HealthReport {
                status: HealthStatus::Healthy,
                needs_reauth: false,
                token_status: TokenStatus::Valid,
            };
        }
        self.auth
            .enhanced_health_check(self.refresher.as_ref(), self.reauthenticator.as_ref(), None)
            .await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<PipelineExecutor>,
    pub coordinator: Arc<DedupCoordinator>,
    pub instances: Arc<Vec<InstanceHealth>>,
    pub include_stack_traces: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/chat/completions", post(openai_chat))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn anthropic_messages(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match serde_json::from_slice(&body) {
        Ok(request) => ChatRequest::Anthropic(request),
        Err(err) => return bad_request(format!("invalid request body: {err}")),
    };
    dispatch(state, request, Dialect::Anthropic).await
}

async fn openai_chat(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match serde_json::from_slice(&body) {
        Ok(request) => ChatRequest::OpenAi(request),
        Err(err) => return bad_request(format!("invalid request body: {err}")),
    };
    dispatch(state, request, Dialect::OpenAi).await
}

async fn dispatch(state: AppState, request: ChatRequest, dialect: Dialect) -> Response {
    let (cancel_handle, cancel_token) = cancel_pair();
    let result = state.executor.execute(request, dialect, cancel_token).await;
    let execution_id = result
        .context
        .as_ref()
        .map(|context| context.execution_id.clone());
    let retry_count = result
        .context
        .as_ref()
        .map(|context| context.retry_count)
        .unwrap_or(0);

    match result.result {
        Ok(PipelineOutcome::Complete(response)) => {
            info!(
                event = "request_complete",
                execution_id = execution_id.as_deref().unwrap_or(""),
                streaming = false
            );
            json_response(StatusCode::OK, &response_body(response))
        }
        Ok(PipelineOutcome::Stream(frames)) => {
            info!(
                event = "request_complete",
                execution_id = execution_id.as_deref().unwrap_or(""),
                streaming = true
            );
            sse_response(frames, cancel_handle)
        }
        Err(err) => error_response(&err, execution_id, retry_count, state.include_stack_traces),
    }
}

/// Aggregates the per-instance enhanced health checks with the pool and
/// blacklist counts. Any non-healthy instance degrades the overall status.
async fn healthz(State(state): State<AppState>) -> Response {
    let pool = state.coordinator.pool_snapshot().await;
    let blacklisted = state.coordinator.blacklist_snapshot().await;

    let mut instances = Vec::with_capacity(state.instances.len());
    let mut all_healthy = true;
    for instance in state.instances.iter() {
        let report = instance.check().await;
        if report.status != HealthStatus::Healthy {
            all_healthy = false;
        }
        instances.push(serde_json::json!({
            "id": instance.instance_id,
            "status": report.status,
            "token_status": report.token_status,
            "needs_reauth": report.needs_reauth,
        }));
    }

    let status = if pool.is_empty() || !all_healthy {
        "degraded"
    } else {
        "ok"
    };
    let body = serde_json::json!({
        "status": status,
        "pool": pool.len(),
        "blacklisted": blacklisted.len(),
        "instances": instances,
    });
    json_response(StatusCode::OK, &body)
}

fn response_body(response: ChatResponse) -> serde_json::Value {
    match response {
        ChatResponse::Anthropic(inner) => serde_json::to_value(inner).unwrap_or_default(),
        ChatResponse::OpenAi(inner) => serde_json::to_value(inner).unwrap_or_default(),
    }
}

fn bad_request(message: String) -> Response {
    let err = PipelineError::new(codes::DATA_INVALID_FORMAT, message, "server");
    error_response(&err, None, 0, false)
}

fn error_response(
    err: &PipelineError,
    execution_id: Option<String>,
    retry_count: u32,
    include_stack_traces: bool,
) -> Response {
    let mut body = ErrorResponse::from_error(err, execution_id, retry_count);
    if include_stack_traces {
        body.error.stack_trace = Some(std::backtrace::Backtrace::force_capture().to_string());
    }
    let status =
        StatusCode::from_u16(body.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &serde_json::to_value(&body).unwrap_or_default())
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// SSE rendering. The cancel handle rides along with the stream: when the
/// client disconnects, axum drops the body and the guard cancels the
/// pipeline, which closes the upstream connection.
fn sse_response(
    frames: tokio::sync::mpsc::Receiver<Result<StreamFrame, PipelineError>>,
    cancel_handle: CancelHandle,
) -> Response {
    let stream = GuardedStream {
        inner: ReceiverStream::new(frames).map(|frame| Ok::<Bytes, std::io::Error>(render_frame(frame))),
        _guard: CancelOnDrop(cancel_handle),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn render_frame(frame: Result<StreamFrame, PipelineError>) -> Bytes {
    let rendered = match frame {
        Ok(StreamFrame::Anthropic(event)) => {
            let name = event.event_name();
            let data = serde_json::to_string(&event).unwrap_or_default();
            format!("event: {name}\ndata: {data}\n\n")
        }
        Ok(StreamFrame::OpenAi(chunk)) => {
            let data = serde_json::to_string(&chunk).unwrap_or_default();
            format!("data: {data}\n\n")
        }
        Err(err) => {
            let envelope = llmux_protocol::anthropic::error::ErrorEnvelope::new(
                err.category.as_str(),
                err.message.clone(),
            );
            let data = serde_json::to_string(&envelope).unwrap_or_default();
            format!("event: error\ndata: {data}\n\n")
        }
    };
    Bytes::from(rendered)
}

struct CancelOnDrop(CancelHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

struct GuardedStream<S> {
    inner: S,
    _guard: CancelOnDrop,
}

impl<S> Stream for GuardedStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
