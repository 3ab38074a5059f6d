//! Message bus adapter.
//!
//! A [`MessageLog`] backend stores raw payloads in two durable logs (direct
//! and group), each accepting every topic under its wildcard. [`ChatBus`]
//! layers the chat semantics on top: lazy idempotent log creation, message
//! encoding, and the cursor primitives the history reader drains.

pub mod memory;
pub mod postgres;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use metrics::counter;
use shared::models::{ChatMessage, ConversationKind, LogKind, Topic};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};
use uuid::Uuid;

pub use memory::InMemoryLog;
pub use postgres::PgLog;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("log {0} does not exist")]
    LogMissing(&'static str),
    #[error("subject {subject} is not accepted by log {log}")]
    SubjectMismatch { log: &'static str, subject: String },
    #[error("read cursor {0} does not exist")]
    CursorMissing(String),
    #[error("failed to encode chat message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type BusResult<T> = Result<T, BusError>;

/// Outcome of a log creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCreation {
    Created,
    AlreadyExists,
}

/// One entry handed to a read cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sequence: u64,
    pub topic: Topic,
    pub payload: Vec<u8>,
}

/// Storage primitives behind the chat logs.
///
/// Implementations must keep per-topic append order visible to readers and
/// must treat repeated `create_log` calls, including concurrent ones, as
/// success.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn create_log(&self, kind: LogKind) -> BusResult<LogCreation>;

    /// Appends `payload` under `topic` and returns its sequence number.
    async fn publish(&self, kind: LogKind, topic: &Topic, payload: &[u8]) -> BusResult<u64>;

    /// Creates a named cursor reading `filter` entries after `start_after`.
    async fn create_cursor(
        &self,
        kind: LogKind,
        name: &str,
        filter: &Topic,
        start_after: u64,
    ) -> BusResult<()>;

    /// Returns the next entry for the cursor, waiting at most `max_wait`.
    ///
    /// `Ok(None)` means nothing arrived within the window. Errors are
    /// reserved for real failures.
    async fn next(
        &self,
        kind: LogKind,
        cursor: &str,
        max_wait: Duration,
    ) -> BusResult<Option<Delivery>>;

    async fn delete_cursor(&self, kind: LogKind, cursor: &str) -> BusResult<()>;

    /// Names of the cursors currently open on a log.
    async fn cursors(&self, kind: LogKind) -> BusResult<Vec<String>>;

    /// Distinct topics that have at least one entry in a log.
    async fn topics(&self, kind: LogKind) -> BusResult<Vec<Topic>>;

    /// Logs that currently exist.
    async fn logs(&self) -> BusResult<Vec<LogKind>>;
}

pub type SharedMessageLog = Arc<dyn MessageLog>;

pub(crate) fn ensure_subject(kind: LogKind, topic: &Topic) -> BusResult<()> {
    let prefix = kind.subject_pattern().trim_end_matches('>');
    if topic.as_str().starts_with(prefix) {
        Ok(())
    } else {
        Err(BusError::SubjectMismatch {
            log: kind.log_name(),
            subject: topic.to_string(),
        })
    }
}

/// Handle to an ephemeral read cursor opened by [`ChatBus::open_cursor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCursor {
    pub kind: LogKind,
    pub name: String,
    pub topic: Topic,
}

/// Chat-aware adapter over a [`MessageLog`].
#[derive(Clone)]
pub struct ChatBus {
    log: SharedMessageLog,
    direct_ready: Arc<OnceCell<()>>,
    group_ready: Arc<OnceCell<()>>,
}

impl std::fmt::Debug for ChatBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatBus")
            .field("direct_ready", &self.direct_ready.initialized())
            .field("group_ready", &self.group_ready.initialized())
            .finish_non_exhaustive()
    }
}

impl ChatBus {
    pub fn new(log: SharedMessageLog) -> Self {
        Self {
            log,
            direct_ready: Arc::new(OnceCell::new()),
            group_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLog::new()))
    }

    pub fn backend(&self) -> &SharedMessageLog {
        &self.log
    }

    /// Creates the log for `kind` the first time it is needed.
    ///
    /// A failed attempt is not remembered, so the next call retries.
    pub async fn ensure_log(&self, kind: LogKind) -> BusResult<()> {
        let ready = match kind {
            LogKind::Direct => &self.direct_ready,
            LogKind::Group => &self.group_ready,
        };

        ready
            .get_or_try_init(|| async {
                let outcome = self.log.create_log(kind).await?;
                debug!(log = kind.log_name(), ?outcome, "chat log ready");
                Ok::<_, BusError>(())
            })
            .await
            .map(|_| ())
    }

    /// Encodes and appends a message to its conversation's topic.
    #[instrument(name = "bus.append", skip(self, message), fields(topic = %conversation.topic()), err)]
    pub async fn append(
        &self,
        conversation: &ConversationKind,
        message: &ChatMessage,
    ) -> BusResult<u64> {
        let kind = conversation.log_kind();
        self.ensure_log(kind).await?;

        let payload = serde_json::to_vec(&message.for_log())?;
        let sequence = self
            .log
            .publish(kind, &conversation.topic(), &payload)
            .await?;

        counter!("chatwire_messages_appended_total", "kind" => kind.as_str()).increment(1);
        Ok(sequence)
    }

    /// Opens a uniquely named cursor over `topic`, positioned after `since`.
    pub async fn open_cursor(
        &self,
        conversation: &ConversationKind,
        since: Option<u64>,
    ) -> BusResult<ReadCursor> {
        let kind = conversation.log_kind();
        self.ensure_log(kind).await?;

        let cursor = ReadCursor {
            kind,
            name: format!("{}_{}", kind.reader_prefix(), Uuid::new_v4().simple()),
            topic: conversation.topic(),
        };
        self.log
            .create_cursor(kind, &cursor.name, &cursor.topic, since.unwrap_or(0))
            .await?;
        Ok(cursor)
    }

    pub async fn next(
        &self,
        cursor: &ReadCursor,
        max_wait: Duration,
    ) -> BusResult<Option<Delivery>> {
        self.log.next(cursor.kind, &cursor.name, max_wait).await
    }

    pub async fn close_cursor(&self, cursor: &ReadCursor) -> BusResult<()> {
        self.log.delete_cursor(cursor.kind, &cursor.name).await
    }

    pub async fn cursors(&self, kind: LogKind) -> BusResult<Vec<String>> {
        self.log.cursors(kind).await
    }

    pub async fn topics(&self, kind: LogKind) -> BusResult<Vec<Topic>> {
        self.log.topics(kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn message(sender: i64, receiver: i64, text: &str) -> ChatMessage {
        ChatMessage {
            sender_id: sender,
            receiver_id: receiver,
            text: text.into(),
            post_id: None,
            date: Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap()),
            seq: Some(99),
            post: None,
        }
    }

    #[tokio::test]
    async fn concurrent_ensure_log_creates_exactly_one_log() {
        let backend = Arc::new(InMemoryLog::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                // separate adapters so the backend sees every call
                let bus = ChatBus::new(backend.clone());
                tokio::spawn(async move { bus.ensure_log(LogKind::Direct).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(backend.logs().await.unwrap(), vec![LogKind::Direct]);
    }

    #[tokio::test]
    async fn append_creates_log_lazily_and_strips_replay_fields() {
        let bus = ChatBus::in_memory();
        assert!(bus.backend().logs().await.unwrap().is_empty());

        let conversation = ConversationKind::direct(2, 1);
        let seq = bus
            .append(&conversation, &message(2, 1, "hi"))
            .await
            .unwrap();

        assert_eq!(bus.backend().logs().await.unwrap(), vec![LogKind::Direct]);

        let cursor = bus.open_cursor(&conversation, None).await.unwrap();
        let delivery = bus
            .next(&cursor, Duration::from_millis(10))
            .await
            .unwrap()
            .expect("appended entry");
        assert_eq!(delivery.sequence, seq);
        assert_eq!(delivery.topic.as_str(), "chat.user.1.2");

        let stored: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(stored["text"], "hi");
        assert!(stored.get("seq").is_none());
    }

    #[tokio::test]
    async fn cursor_names_are_unique_per_open() {
        let bus = ChatBus::in_memory();
        let conversation = ConversationKind::group(7);

        let first = bus.open_cursor(&conversation, None).await.unwrap();
        let second = bus.open_cursor(&conversation, None).await.unwrap();
        assert_ne!(first.name, second.name);
        assert!(first.name.starts_with("GROUP_CHAT_READER_"));

        let mut open = bus.cursors(LogKind::Group).await.unwrap();
        open.sort();
        let mut expected = vec![first.name.clone(), second.name.clone()];
        expected.sort();
        assert_eq!(open, expected);
    }

    #[test]
    fn ensure_subject_rejects_foreign_topics() {
        let group_topic = ConversationKind::group(1).topic();
        assert!(ensure_subject(LogKind::Group, &group_topic).is_ok());
        assert!(matches!(
            ensure_subject(LogKind::Direct, &group_topic),
            Err(BusError::SubjectMismatch { .. })
        ));
    }
}
