//! Per-request spans and access logging for the HTTP stack.

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response},
};
use metrics::histogram;
use tower_http::{
    classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier},
    trace::{DefaultOnBodyChunk, DefaultOnEos, MakeSpan, TraceLayer},
};
use tracing::{Span, debug, error, field, info, info_span};

use crate::middleware::request_context::RequestContext;

type OnRequest = fn(&Request<Body>, &Span);
type OnResponse = fn(&Response<Body>, Duration, &Span);
type OnFailure = fn(ServerErrorsFailureClass, Duration, &Span);

type ChatTraceLayer = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    RequestSpan,
    OnRequest,
    OnResponse,
    DefaultOnBodyChunk,
    DefaultOnEos,
    OnFailure,
>;

/// One `http_request` span per request, tagged with the request id.
/// `user_id` is recorded later by the identity middleware and `status` once
/// the response is ready.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .extensions()
            .get::<RequestContext>()
            .map_or("-", |context| context.request_id.as_str());

        info_span!(
            "http_request",
            method = %request.method(),
            path = %request.uri().path(),
            request_id = %request_id,
            user_id = field::Empty,
            status = field::Empty,
        )
    }
}

/// Milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn log_request(request: &Request<Body>, span: &Span) {
    span.in_scope(|| debug!(version = ?request.version(), "request received"));
}

fn log_response(response: &Response<Body>, latency: Duration, span: &Span) {
    let status = response.status().as_u16();
    span.record("status", status);
    histogram!("chatwire_http_request_duration_seconds", "status" => status.to_string())
        .record(latency.as_secs_f64());
    span.in_scope(|| info!(status, latency_ms = whole_millis(latency), "request finished"));
}

fn log_failure(failure: ServerErrorsFailureClass, latency: Duration, span: &Span) {
    span.in_scope(|| error!(%failure, latency_ms = whole_millis(latency), "request failed"));
}

pub(crate) fn create_trace_layer() -> ChatTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(RequestSpan)
        .on_request(log_request as OnRequest)
        .on_response(log_response as OnResponse)
        .on_failure(log_failure as OnFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode};
    use tracing::Level;
    use tracing_subscriber::util::SubscriberInitExt;

    fn request_with_id(id: &str) -> Request<Body> {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/api/chats/user/2?ignored=1")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(RequestContext {
            request_id: id.into(),
            user_id: None,
        });
        request
    }

    #[test]
    fn millis_saturate_instead_of_truncating() {
        assert_eq!(whole_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn span_declares_late_fields() {
        let _guard = tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .set_default();

        let request = request_with_id("req-7");
        let span = RequestSpan.make_span(&request);
        let metadata = span.metadata().unwrap();
        assert_eq!(metadata.name(), "http_request");
        assert!(metadata.fields().field("user_id").is_some());
        assert!(metadata.fields().field("status").is_some());
        log_request(&request, &span);
    }

    #[test]
    fn response_and_failure_hooks_log_without_panicking() {
        let _guard = tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .set_default();

        let span = RequestSpan.make_span(&request_with_id("req-8"));
        let response = Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::empty())
            .unwrap();
        log_response(&response, Duration::from_millis(12), &span);
        log_failure(
            ServerErrorsFailureClass::StatusCode(StatusCode::SERVICE_UNAVAILABLE),
            Duration::from_millis(12),
            &span,
        );
    }
}
