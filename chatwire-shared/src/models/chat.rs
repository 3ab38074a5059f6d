use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[allow(clippy::trivially_copy_pass_by_ref)] // serde passes skip predicates by reference
fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// A chat message as stored on the bus and returned to clients.
///
/// Zero identifiers and empty text are omitted on the wire. `seq` and
/// `post` are never written to the bus: the log assigns `seq` on replay and
/// `post` is filled in by enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub sender_id: i64,
    /// A user id for direct chats, a group id for group chats.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub receiver_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<i64>,
    #[schema(value_type = String, format = DateTime)]
    pub date: DateTime<FixedOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<ChatPost>,
}

impl ChatMessage {
    /// Copy of the message with the replay-only fields cleared.
    #[must_use]
    pub fn for_log(&self) -> Self {
        Self {
            seq: None,
            post: None,
            ..self.clone()
        }
    }
}

/// Body of a send request. Identity and timestamp are stamped server-side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SendChatRequest {
    #[serde(default)]
    pub text: String,
    /// Post shared into the conversation.
    #[serde(default, alias = "referenced_post_id")]
    pub post_id: Option<i64>,
}

/// Bare acknowledgment returned when a send does not trigger a replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SendAck {
    pub status: String,
    /// Log sequence assigned to the appended message.
    pub seq: u64,
}

impl SendAck {
    #[must_use]
    pub fn sent(seq: u64) -> Self {
        Self {
            status: "SENT".to_string(),
            seq,
        }
    }
}

/// A post referenced by a chat message, with its current counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChatPost {
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[schema(value_type = Option<String>, format = DateTime)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<i64>,
}

/// Users the caller has an open direct conversation with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OpenChatsResponse {
    pub peers: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{Value, json};

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    fn sample() -> ChatMessage {
        ChatMessage {
            sender_id: 1,
            receiver_id: 2,
            text: "hello".into(),
            post_id: None,
            date: ist().with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            seq: None,
            post: None,
        }
    }

    #[test]
    fn wire_format_omits_empty_fields() {
        let mut message = sample();
        message.text.clear();
        message.post_id = Some(9);

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["sender_id"], 1);
        assert_eq!(value["receiver_id"], 2);
        assert_eq!(value["post_id"], 9);
        assert!(value.get("text").is_none());
        assert!(value.get("seq").is_none());
        assert!(value.get("post").is_none());
    }

    #[test]
    fn date_serializes_in_configured_offset() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["date"], Value::from("2024-05-01T09:30:00+05:30"));
    }

    #[test]
    fn for_log_strips_replay_fields() {
        let mut message = sample();
        message.seq = Some(4);
        message.post = Some(ChatPost {
            id: 9,
            user_id: 3,
            title: "t".into(),
            content: "c".into(),
            tags: vec![],
            created_at: None,
            like_count: Some(1),
            comment_count: None,
        });

        let stored = message.for_log();
        assert_eq!(stored.seq, None);
        assert_eq!(stored.post, None);
        assert_eq!(stored.text, "hello");
    }

    #[test]
    fn send_request_accepts_referenced_post_alias() {
        let request: SendChatRequest =
            serde_json::from_value(json!({ "referenced_post_id": 12 })).unwrap();
        assert_eq!(request.post_id, Some(12));
        assert!(request.text.is_empty());

        let request: SendChatRequest =
            serde_json::from_value(json!({ "text": "hi", "post_id": 3 })).unwrap();
        assert_eq!(request.post_id, Some(3));
        assert_eq!(request.text, "hi");
    }

    #[test]
    fn send_ack_reports_sent() {
        let ack = SendAck::sent(7);
        assert_eq!(
            serde_json::to_value(ack).unwrap(),
            json!({ "status": "SENT", "seq": 7 })
        );
    }
}
