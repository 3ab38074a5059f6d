#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::models::{ChatMessage, ChatPost, OpenChatsResponse, SendAck, SendChatRequest};
use utoipa::OpenApi;

use crate::http::problem::ProblemDetails;

#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "Chatwire API",
        version = "1.0.0",
        description = "Direct and group chat delivery: durable threads and live relay"
    ),
    paths(
        crate::handlers::chat::post_user_chat,
        crate::handlers::chat::get_user_chat,
        crate::handlers::chat::post_group_chat,
        crate::handlers::chat::get_group_chat,
        crate::handlers::chat::open_chats,
    ),
    components(
        schemas(
            ChatMessage,
            ChatPost,
            SendChatRequest,
            SendAck,
            OpenChatsResponse,
            ProblemDetails,
        )
    ),
    tags(
        (name = "Chats", description = "Direct and group conversations")
    )
)]
pub struct ApiDoc;
