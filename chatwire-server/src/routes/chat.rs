use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{
    app_state::AppState,
    handlers::{chat, websocket},
    middleware::identity::{IdentityState, require_identity},
};

/// Chat endpoints, mounted under `/api`. Every route requires the caller
/// identity header.
pub fn create_router_chat(identity: IdentityState) -> Router<Arc<AppState>> {
    Router::new()
        .route("/chats", get(chat::open_chats))
        .route(
            "/chats/user/{user_id}",
            post(chat::post_user_chat).get(chat::get_user_chat),
        )
        .route(
            "/chats/group/{group_id}",
            post(chat::post_group_chat).get(chat::get_group_chat),
        )
        .route_layer(middleware::from_fn_with_state(identity, require_identity))
}

/// The relay socket. Identity is taken from the query string; a present
/// identity header must agree with it.
pub fn create_router_ws() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(websocket::ws_handler))
}
