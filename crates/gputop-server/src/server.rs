use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, Response, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use gputop_services::{PipelineStatus, PrometheusSink, SupervisorState};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<PrometheusSink>,
    pub pipeline: PipelineStatus,
    pub program: String,
}

pub fn router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| {
            tracing::debug_span!("request", method = %req.method(), uri = %req.uri())
        })
        .on_response(|res: &Response<Body>, latency: Duration, _span: &tracing::Span| {
            debug!(
                latency = %format!("{} ms", latency.as_millis()),
                status = %res.status().as_u16(),
                "finished processing request"
            );
        });

    Router::new()
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .layer(trace_layer)
        .with_state(state)
}

/// Serve until `token` is cancelled. A bind or serve failure cancels it.
pub async fn serve(addr: SocketAddr, state: AppState, token: CancellationToken) -> std::io::Result<()> {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind HTTP listener");
            token.cancel();
            return Err(e);
        }
    };

    info!("Intel GPU exporter listening on http://{}/metrics", addr);

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .await;

    if let Err(e) = &result {
        error!(error = %e, "HTTP server error");
        token.cancel();
    }
    result
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.sink.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.sink.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    program: String,
    pipeline: SupervisorState,
    transitions: Vec<SupervisorState>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        program: state.program.clone(),
        pipeline: state.pipeline.current(),
        transitions: state.pipeline.history(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gputop_core::parse_record;
    use gputop_services::MetricsSink;
    use tower::ServiceExt;

    fn app_state() -> AppState {
        AppState {
            sink: Arc::new(PrometheusSink::new().unwrap()),
            pipeline: PipelineStatus::new(),
            program: "intel_gpu_top".to_string(),
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = app_state();
        let fields: Vec<&str> = "1200.0,1150.0,500.0,85.5,10.2,5.1,2.3,15.4,7.8,3.2,8.9,4.5,1.8,12.7,6.3,2.9"
            .split(',')
            .collect();
        state.sink.observe(parse_record(&fields).unwrap());

        let (status, body) = get(router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("intel_gpu_freq_mhz_requested 1200"));
        assert!(body.contains(r#"intel_gpu_engine_percent{engine="VECS",type="sema"} 6.3"#));
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let state = app_state();

        let (status, body) = get(router(state), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#""pipeline":"starting""#));
        assert!(body.contains(r#""transitions":["starting"]"#));
        assert!(body.contains(r#""program":"intel_gpu_top""#));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let state = app_state();
        let (status, _) = get(router(state), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let state = app_state();
        let token = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = tokio::spawn(serve(addr, state, token.clone()));

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop after cancellation")
            .unwrap();
        assert!(result.is_ok());
    }
}
