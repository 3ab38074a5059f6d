pub mod chat;
pub mod conversation;

pub use chat::{ChatMessage, ChatPost, OpenChatsResponse, SendAck, SendChatRequest};
pub use conversation::{ConversationKind, LogKind, Topic, TopicParseError};
