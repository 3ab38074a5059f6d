use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query, State, rejection::JsonRejection},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use shared::models::{ChatMessage, ConversationKind, OpenChatsResponse, SendAck, SendChatRequest};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use utoipa::IntoParams;

use crate::{
    app_state::AppState,
    http::{
        error::{ApiError, AppResult},
        problem::ProblemDetails,
    },
    middleware::request_context::RequestContext,
    services::SendOutcome,
};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// Only return messages with a log sequence greater than this.
    since: Option<String>,
}

fn require_user(context: &RequestContext) -> AppResult<i64> {
    context
        .user_id
        .ok_or_else(|| ApiError::unauthorized("caller identity is missing"))
}

pub(crate) fn parse_id(raw: &str, what: &str) -> AppResult<i64> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::bad_request(format!("{what} must be a positive integer")))
}

fn parse_since(query: &HistoryQuery) -> AppResult<Option<u64>> {
    query
        .since
        .as_deref()
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|_| ApiError::bad_request("since must be a non-negative integer"))
        })
        .transpose()
}

async fn send(
    state: &AppState,
    conversation: ConversationKind,
    sender_id: i64,
    request: SendChatRequest,
) -> AppResult<Response> {
    // Cancelled if the request future is dropped mid-replay.
    let cancel = CancellationToken::new();
    let _abort_on_drop = cancel.clone().drop_guard();

    let outcome = state
        .chat
        .send(&conversation, sender_id, request, &cancel)
        .await?;

    Ok(match outcome {
        SendOutcome::Thread(thread) => Json(thread).into_response(),
        SendOutcome::Sent { seq } => Json(SendAck::sent(seq)).into_response(),
    })
}

async fn history(
    state: &AppState,
    conversation: ConversationKind,
    caller_id: i64,
    query: &HistoryQuery,
) -> AppResult<Json<Vec<ChatMessage>>> {
    let since = parse_since(query)?;
    let cancel = CancellationToken::new();
    let _abort_on_drop = cancel.clone().drop_guard();

    let thread = state
        .chat
        .history(&conversation, caller_id, since, &cancel)
        .await?;
    Ok(Json(thread))
}

/// Send a direct message.
///
/// Text messages return the full thread; post-only messages return a bare
/// acknowledgment.
#[utoipa::path(
    post,
    path = "/api/chats/user/{user_id}",
    params(("user_id" = i64, Path, description = "Recipient user id")),
    request_body = SendChatRequest,
    responses(
        (status = 200, description = "Thread after the append, oldest first", body = Vec<ChatMessage>),
        (status = 400, description = "Invalid id or payload", body = ProblemDetails),
        (status = 401, description = "Missing caller identity", body = ProblemDetails),
        (status = 503, description = "Message bus unavailable", body = ProblemDetails),
    ),
    tag = "Chats"
)]
#[instrument(skip(state, context, payload))]
pub async fn post_user_chat(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(user_id): Path<String>,
    payload: Result<Json<SendChatRequest>, JsonRejection>,
) -> AppResult<Response> {
    let sender_id = require_user(&context)?;
    let receiver_id = parse_id(&user_id, "user id")?;
    let Json(payload) = payload?;
    send(
        &state,
        ConversationKind::direct(sender_id, receiver_id),
        sender_id,
        payload,
    )
    .await
}

#[utoipa::path(
    get,
    path = "/api/chats/user/{user_id}",
    params(("user_id" = i64, Path, description = "Other participant"), HistoryQuery),
    responses(
        (status = 200, description = "Direct thread, oldest first", body = Vec<ChatMessage>),
        (status = 400, description = "Invalid id", body = ProblemDetails),
        (status = 504, description = "Replay deadline exceeded", body = ProblemDetails),
    ),
    tag = "Chats"
)]
#[instrument(skip(state, context, query))]
pub async fn get_user_chat(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<ChatMessage>>> {
    let caller_id = require_user(&context)?;
    let other_id = parse_id(&user_id, "user id")?;
    history(
        &state,
        ConversationKind::direct(caller_id, other_id),
        caller_id,
        &query,
    )
    .await
}

/// Send a message to a group the caller belongs to.
#[utoipa::path(
    post,
    path = "/api/chats/group/{group_id}",
    params(("group_id" = i64, Path, description = "Group id")),
    request_body = SendChatRequest,
    responses(
        (status = 200, description = "Thread after the append, or a SENT acknowledgment", body = Vec<ChatMessage>),
        (status = 403, description = "Caller is not a member", body = ProblemDetails),
        (status = 502, description = "Group directory unavailable", body = ProblemDetails),
    ),
    tag = "Chats"
)]
#[instrument(skip(state, context, payload))]
pub async fn post_group_chat(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(group_id): Path<String>,
    payload: Result<Json<SendChatRequest>, JsonRejection>,
) -> AppResult<Response> {
    let sender_id = require_user(&context)?;
    let group_id = parse_id(&group_id, "group id")?;
    let Json(payload) = payload?;
    send(&state, ConversationKind::group(group_id), sender_id, payload).await
}

#[utoipa::path(
    get,
    path = "/api/chats/group/{group_id}",
    params(("group_id" = i64, Path, description = "Group id"), HistoryQuery),
    responses(
        (status = 200, description = "Group thread, oldest first", body = Vec<ChatMessage>),
        (status = 403, description = "Caller is not a member", body = ProblemDetails),
    ),
    tag = "Chats"
)]
#[instrument(skip(state, context, query))]
pub async fn get_group_chat(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(group_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<ChatMessage>>> {
    let caller_id = require_user(&context)?;
    let group_id = parse_id(&group_id, "group id")?;
    history(&state, ConversationKind::group(group_id), caller_id, &query).await
}

/// Users the caller has an open direct conversation with.
#[utoipa::path(
    get,
    path = "/api/chats",
    responses(
        (status = 200, description = "Peers with an existing direct thread", body = OpenChatsResponse),
        (status = 401, description = "Missing caller identity", body = ProblemDetails),
    ),
    tag = "Chats"
)]
#[instrument(skip(state, context))]
pub async fn open_chats(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<OpenChatsResponse>> {
    let caller_id = require_user(&context)?;
    let peers = state.chat.open_chats(caller_id).await?;
    Ok(Json(OpenChatsResponse { peers }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_must_be_positive_integers() {
        assert_eq!(parse_id("42", "user id").unwrap(), 42);
        for raw in ["0", "-1", "abc", "", "1.5"] {
            let err = parse_id(raw, "user id").unwrap_err();
            assert_eq!(err.code(), "validation_failed");
        }
    }

    #[test]
    fn since_is_optional_but_must_be_numeric() {
        assert_eq!(parse_since(&HistoryQuery::default()).unwrap(), None);
        assert_eq!(
            parse_since(&HistoryQuery {
                since: Some("12".into())
            })
            .unwrap(),
            Some(12)
        );
        assert!(
            parse_since(&HistoryQuery {
                since: Some("later".into())
            })
            .is_err()
        );
    }
}
