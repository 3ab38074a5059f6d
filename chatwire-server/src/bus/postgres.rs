use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use shared::models::{LogKind, Topic};
use sqlx::PgPool;
use tokio::{
    sync::Mutex,
    time::{Instant, sleep},
};
use tracing::{trace, warn};

use super::{BusError, BusResult, Delivery, LogCreation, MessageLog, ensure_subject};

/// Interval between polls while a cursor waits for new entries.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Entries fetched per round trip while draining a cursor.
const PAGE_SIZE: i64 = 256;

type PageKey = (LogKind, String);

/// [`MessageLog`] stored in PostgreSQL.
///
/// Tables come from the bootstrap scripts under `sql/`. Appends to one topic
/// are serialised with a transaction-scoped advisory lock so that sequence
/// order and commit order agree within the topic.
///
/// Cursors read a page at a time. The stored position moves to the end of
/// each page as it is fetched, and the rows are handed out from a local
/// buffer until it runs dry.
#[derive(Debug, Clone)]
pub struct PgLog {
    pool: PgPool,
    pages: Arc<Mutex<HashMap<PageKey, VecDeque<Delivery>>>>,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    sequence: i64,
    topic: String,
    payload: Vec<u8>,
}

#[derive(sqlx::FromRow)]
struct CursorRow {
    filter_topic: String,
    position: i64,
}

impl PgLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            pages: Arc::default(),
        }
    }

    async fn advance(&self, kind: LogKind, cursor: &str) -> BusResult<Option<Delivery>> {
        let key = (kind, cursor.to_string());
        if let Some(delivery) = self
            .pages
            .lock()
            .await
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Ok(Some(delivery));
        }

        let mut page = self.fetch_page(kind, cursor).await?;
        let next = page.pop_front();
        if !page.is_empty() {
            self.pages.lock().await.insert(key, page);
        }
        Ok(next)
    }

    async fn fetch_page(&self, kind: LogKind, cursor: &str) -> BusResult<VecDeque<Delivery>> {
        let state = sqlx::query_as::<_, CursorRow>(
            "SELECT filter_topic, position FROM chat_read_cursors \
             WHERE log_name = $1 AND name = $2",
        )
        .bind(kind.log_name())
        .bind(cursor)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BusError::CursorMissing(cursor.to_string()))?;

        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT sequence, topic, payload FROM chat_log_entries \
             WHERE log_name = $1 AND topic = $2 AND sequence > $3 \
             ORDER BY sequence LIMIT $4",
        )
        .bind(kind.log_name())
        .bind(&state.filter_topic)
        .bind(state.position)
        .bind(PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;

        let Some(last) = rows.last().map(|row| row.sequence) else {
            return Ok(VecDeque::new());
        };

        sqlx::query(
            "UPDATE chat_read_cursors SET position = $3 WHERE log_name = $1 AND name = $2",
        )
        .bind(kind.log_name())
        .bind(cursor)
        .bind(last)
        .execute(&self.pool)
        .await?;

        trace!(cursor, rows = rows.len(), position = last, "fetched chat log page");
        rows.into_iter()
            .map(|row| {
                Ok(Delivery {
                    sequence: u64::try_from(row.sequence).unwrap_or_default(),
                    topic: parse_topic(&row.topic)?,
                    payload: row.payload,
                })
            })
            .collect()
    }
}

fn parse_topic(raw: &str) -> BusResult<Topic> {
    Topic::parse(raw)
        .map(|kind| kind.topic())
        .map_err(|err| BusError::Transport(err.to_string()))
}

fn to_position(sequence: u64) -> i64 {
    i64::try_from(sequence).unwrap_or(i64::MAX)
}

fn log_kind_from_name(name: &str) -> Option<LogKind> {
    [LogKind::Direct, LogKind::Group]
        .into_iter()
        .find(|kind| kind.log_name() == name)
}

#[async_trait]
impl MessageLog for PgLog {
    async fn create_log(&self, kind: LogKind) -> BusResult<LogCreation> {
        let result = sqlx::query(
            "INSERT INTO chat_logs (name, subject_pattern) VALUES ($1, $2) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(kind.log_name())
        .bind(kind.subject_pattern())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            LogCreation::Created
        } else {
            LogCreation::AlreadyExists
        })
    }

    async fn publish(&self, kind: LogKind, topic: &Topic, payload: &[u8]) -> BusResult<u64> {
        ensure_subject(kind, topic)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(topic.as_str())
            .execute(&mut *tx)
            .await?;

        let sequence: i64 = sqlx::query_scalar(
            "INSERT INTO chat_log_entries (log_name, topic, payload) VALUES ($1, $2, $3) \
             RETURNING sequence",
        )
        .bind(kind.log_name())
        .bind(topic.as_str())
        .bind(payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                BusError::LogMissing(kind.log_name())
            }
            _ => BusError::Database(err),
        })?;

        tx.commit().await?;
        trace!(topic = %topic, sequence, "appended chat log entry");
        Ok(u64::try_from(sequence).unwrap_or_default())
    }

    async fn create_cursor(
        &self,
        kind: LogKind,
        name: &str,
        filter: &Topic,
        start_after: u64,
    ) -> BusResult<()> {
        ensure_subject(kind, filter)?;

        sqlx::query(
            "INSERT INTO chat_read_cursors (log_name, name, filter_topic, position) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(kind.log_name())
        .bind(name)
        .bind(filter.as_str())
        .bind(to_position(start_after))
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                BusError::LogMissing(kind.log_name())
            }
            _ => BusError::Database(err),
        })?;
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
            if let Some(delivery) = self.advance(kind, cursor).await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn delete_cursor(&self, kind: LogKind, cursor: &str) -> BusResult<()> {
        self.pages.lock().await.remove(&(kind, cursor.to_string()));
        sqlx::query("DELETE FROM chat_read_cursors WHERE log_name = $1 AND name = $2")
            .bind(kind.log_name())
            .bind(cursor)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cursors(&self, kind: LogKind) -> BusResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM chat_read_cursors WHERE log_name = $1 ORDER BY created_at, name",
        )
        .bind(kind.log_name())
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn topics(&self, kind: LogKind) -> BusResult<Vec<Topic>> {
        let raw = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT topic FROM chat_log_entries WHERE log_name = $1 ORDER BY topic",
        )
        .bind(kind.log_name())
        .fetch_all(&self.pool)
        .await?;

        let mut topics = Vec::with_capacity(raw.len());
        for topic in raw {
            match parse_topic(&topic) {
                Ok(topic) => topics.push(topic),
                Err(err) => warn!(error = %err, "skipping foreign subject in chat log"),
            }
        }
        topics.sort();
        Ok(topics)
    }

    async fn logs(&self) -> BusResult<Vec<LogKind>> {
        let names = sqlx::query_scalar::<_, String>("SELECT name FROM chat_logs ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names
            .iter()
            .filter_map(|name| log_kind_from_name(name))
            .collect())
    }
}
