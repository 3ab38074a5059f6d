//! Full-thread replay over ephemeral read cursors.

use std::time::Duration;

use metrics::{counter, histogram};
use shared::{
    config::server::BusConfig,
    models::{ChatMessage, ConversationKind},
};
use thiserror::Error;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{BusError, ChatBus, Delivery, ReadCursor};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("chat log read stalled for {0:?}")]
    DeadlineExceeded(Duration),
    #[error("replay cancelled")]
    Cancelled,
}

impl ReplayError {
    fn label(&self) -> &'static str {
        match self {
            ReplayError::Bus(_) => "bus_error",
            ReplayError::DeadlineExceeded(_) => "deadline",
            ReplayError::Cancelled => "cancelled",
        }
    }
}

/// Deletes the cursor from a background task if the replay future is
/// dropped before it could clean up itself.
struct CursorGuard {
    bus: ChatBus,
    cursor: Option<ReadCursor>,
}

impl CursorGuard {
    async fn close(mut self) {
        if let Some(cursor) = self.cursor.take() {
            close_cursor(&self.bus, &cursor).await;
        }
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        let Some(cursor) = self.cursor.take() else {
            return;
        };
        let bus = self.bus.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { close_cursor(&bus, &cursor).await });
        } else {
            warn!(cursor = %cursor.name, "runtime gone, leaving read cursor behind");
        }
    }
}

async fn close_cursor(bus: &ChatBus, cursor: &ReadCursor) {
    match bus.close_cursor(cursor).await {
        Ok(()) => debug!(cursor = %cursor.name, "read cursor deleted"),
        Err(err) => warn!(cursor = %cursor.name, error = %err, "failed to delete read cursor"),
    }
}

/// Reads every message of a conversation, oldest first.
#[derive(Debug, Clone)]
pub struct HistoryReader {
    bus: ChatBus,
    poll_wait: Duration,
    /// Longest a single backend read may take.
    deadline: Option<Duration>,
}

impl HistoryReader {
    pub fn new(bus: ChatBus, poll_wait: Duration, deadline: Option<Duration>) -> Self {
        Self {
            bus,
            poll_wait,
            deadline,
        }
    }

    pub fn from_config(bus: ChatBus, config: &BusConfig) -> Self {
        Self::new(
            bus,
            Duration::from_millis(config.poll_wait_ms),
            config.replay_deadline_ms.map(Duration::from_millis),
        )
    }

    pub fn bus(&self) -> &ChatBus {
        &self.bus
    }

    pub async fn replay(
        &self,
        conversation: &ConversationKind,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChatMessage>, ReplayError> {
        self.read_all_since(conversation, None, cancel).await
    }

    /// Replays the conversation's entries after sequence `since`.
    ///
    /// The backlog ends at the first poll that yields nothing. The cursor
    /// opened for the call is deleted whatever the outcome.
    pub async fn read_all_since(
        &self,
        conversation: &ConversationKind,
        since: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChatMessage>, ReplayError> {
        let started = Instant::now();
        let kind = conversation.log_kind();

        let cursor = self.bus.open_cursor(conversation, since).await?;
        let guard = CursorGuard {
            bus: self.bus.clone(),
            cursor: Some(cursor.clone()),
        };

        let outcome = self.drain(&cursor, cancel).await;
        guard.close().await;

        histogram!("chatwire_replay_duration_seconds", "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64());
        match &outcome {
            Ok(messages) => {
                histogram!("chatwire_replay_messages", "kind" => kind.as_str())
                    .record(messages.len() as f64);
                debug!(topic = %cursor.topic, count = messages.len(), "replay complete");
            }
            Err(err) => {
                counter!("chatwire_replay_failures_total", "reason" => err.label()).increment(1);
            }
        }

        outcome
    }

    /// One bounded read. The deadline covers a single call to the backend,
    /// so a long thread that keeps delivering never trips it.
    async fn step(&self, cursor: &ReadCursor) -> Result<Option<Delivery>, ReplayError> {
        let next = self.bus.next(cursor, self.poll_wait);
        match self.deadline {
            Some(limit) => timeout(limit, next)
                .await
                .map_err(|_| ReplayError::DeadlineExceeded(limit))?
                .map_err(ReplayError::from),
            None => Ok(next.await?),
        }
    }

    async fn drain(
        &self,
        cursor: &ReadCursor,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChatMessage>, ReplayError> {
        let mut messages = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ReplayError::Cancelled),
                next = self.step(cursor) => next?,
            };

            let Some(delivery) = next else {
                return Ok(messages);
            };

            match serde_json::from_slice::<ChatMessage>(&delivery.payload) {
                Ok(mut message) => {
                    message.seq = Some(delivery.sequence);
                    messages.push(message);
                }
                Err(err) => warn!(
                    topic = %delivery.topic,
                    sequence = delivery.sequence,
                    error = %err,
                    "skipping undecodable chat log entry"
                ),
            }
        }
    }
}
