use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use shared::models::{LogKind, Topic};
use tokio::{
    sync::{Notify, RwLock},
    time::{Instant, timeout_at},
};

use super::{BusError, BusResult, Delivery, LogCreation, MessageLog, ensure_subject};

#[derive(Debug)]
struct Entry {
    sequence: u64,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct CursorState {
    filter: Topic,
    position: u64,
}

/// Entries are kept per topic, each list in ascending sequence order.
#[derive(Debug, Default)]
struct LogState {
    topics: HashMap<Topic, Vec<Entry>>,
    cursors: HashMap<String, CursorState>,
}

#[derive(Debug, Default)]
struct State {
    logs: HashMap<LogKind, LogState>,
    last_sequence: u64,
}

/// Process-local [`MessageLog`]. Contents live as long as the value.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    state: RwLock<State>,
    appended: Notify,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    async fn advance(&self, kind: LogKind, cursor: &str) -> BusResult<Option<Delivery>> {
        let mut guard = self.state.write().await;
        let log = guard
            .logs
            .get_mut(&kind)
            .ok_or(BusError::LogMissing(kind.log_name()))?;

        let LogState { topics, cursors } = log;
        let state = cursors
            .get_mut(cursor)
            .ok_or_else(|| BusError::CursorMissing(cursor.to_string()))?;

        let Some(entries) = topics.get(&state.filter) else {
            return Ok(None);
        };
        let next = entries
            .get(entries.partition_point(|entry| entry.sequence <= state.position));

        Ok(next.map(|entry| {
            state.position = entry.sequence;
            Delivery {
                sequence: entry.sequence,
                topic: state.filter.clone(),
                payload: entry.payload.clone(),
            }
        }))
    }
}

#[async_trait]
impl MessageLog for InMemoryLog {
    async fn create_log(&self, kind: LogKind) -> BusResult<LogCreation> {
        let mut guard = self.state.write().await;
        if guard.logs.contains_key(&kind) {
            return Ok(LogCreation::AlreadyExists);
        }
        guard.logs.insert(kind, LogState::default());
        Ok(LogCreation::Created)
    }

    async fn publish(&self, kind: LogKind, topic: &Topic, payload: &[u8]) -> BusResult<u64> {
        ensure_subject(kind, topic)?;

        let sequence = {
            let mut guard = self.state.write().await;
            if !guard.logs.contains_key(&kind) {
                return Err(BusError::LogMissing(kind.log_name()));
            }
            guard.last_sequence += 1;
            let sequence = guard.last_sequence;
            if let Some(log) = guard.logs.get_mut(&kind) {
                log.topics.entry(topic.clone()).or_default().push(Entry {
                    sequence,
                    payload: payload.to_vec(),
                });
            }
            sequence
        };

        self.appended.notify_waiters();
        Ok(sequence)
    }

    async fn create_cursor(
        &self,
        kind: LogKind,
        name: &str,
        filter: &Topic,
        start_after: u64,
    ) -> BusResult<()> {
        ensure_subject(kind, filter)?;

        let mut guard = self.state.write().await;
        let log = guard
            .logs
            .get_mut(&kind)
            .ok_or(BusError::LogMissing(kind.log_name()))?;
        log.cursors.insert(
            name.to_string(),
            CursorState {
                filter: filter.clone(),
                position: start_after,
            },
        );
        Ok(())
    }

    async fn next(
        &self,
        kind: LogKind,
        cursor: &str,
        max_wait: Duration,
    ) -> BusResult<Option<Delivery>> {
        let deadline = Instant::now() + max_wait;
        loop {
            // Registered before the check so an append in between still wakes us.
            let appended = self.appended.notified();

            if let Some(delivery) = self.advance(kind, cursor).await? {
                return Ok(Some(delivery));
            }

            if timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn delete_cursor(&self, kind: LogKind, cursor: &str) -> BusResult<()> {
        let mut guard = self.state.write().await;
        if let Some(log) = guard.logs.get_mut(&kind) {
            log.cursors.remove(cursor);
        }
        Ok(())
    }

    async fn cursors(&self, kind: LogKind) -> BusResult<Vec<String>> {
        let guard = self.state.read().await;
        Ok(guard
            .logs
            .get(&kind)
            .map(|log| log.cursors.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn topics(&self, kind: LogKind) -> BusResult<Vec<Topic>> {
        let guard = self.state.read().await;
        let mut topics: Vec<Topic> = guard
            .logs
            .get(&kind)
            .map(|log| log.topics.keys().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        Ok(topics)
    }

    async fn logs(&self) -> BusResult<Vec<LogKind>> {
        let guard = self.state.read().await;
        let mut logs: Vec<LogKind> = guard.logs.keys().copied().collect();
        logs.sort_by_key(|kind| kind.log_name());
        Ok(logs)
    }
}
