use axum::{extract::rejection::JsonRejection, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use super::problem::ProblemDetails;
use crate::{
    services::{ChatError, ReplayError},
    tracer::whole_millis,
};

pub type AppResult<T> = Result<T, ApiError>;

/// Nonstandard status used when the client went away before the reply.
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut problem = ProblemDetails::new(self.status, self.code, self.message);
        if let Some(details) = self.details {
            problem = problem.with_details(details);
        }
        problem.into_response()
    }
}

/// Unreadable request bodies are reported like any other validation failure.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
            .with_details(json!({ "rejection_status": rejection.status().as_u16() }))
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::InvalidInput(message) => Self::bad_request(message),
            ChatError::MissingIdentity => Self::unauthorized("caller identity is missing"),
            ChatError::NotMember { group_id, user_id } => Self::new(
                StatusCode::FORBIDDEN,
                "not_a_member",
                format!("user {user_id} is not a member of group {group_id}"),
            )
            .with_details(json!({ "group_id": group_id })),
            ChatError::Bus(bus) => {
                warn!(error = %bus, "chat bus request failed");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "bus_unavailable",
                    "message bus is unavailable",
                )
            }
            ChatError::Replay(ReplayError::DeadlineExceeded(limit)) => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "replay_timeout",
                "conversation replay took too long",
            )
            .with_details(json!({ "deadline_ms": whole_millis(limit) })),
            ChatError::Replay(ReplayError::Cancelled) => {
                info!("client went away during replay");
                Self::new(
                    StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                        .unwrap_or(StatusCode::BAD_REQUEST),
                    "client_closed_request",
                    "request cancelled",
                )
            }
            ChatError::Replay(ReplayError::Bus(bus)) => Self::from(ChatError::Bus(bus)),
            ChatError::Directory(directory) => {
                warn!(error = %directory, "directory lookup failed");
                Self::new(
                    StatusCode::BAD_GATEWAY,
                    "directory_unavailable",
                    "group directory is unavailable",
                )
            }
        }
    }
}
