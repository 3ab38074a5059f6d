use std::sync::Arc;

use crate::services::{ChatOrchestrator, FanoutRegistry};

/// Shared by every route.
#[derive(Clone, Debug)]
pub struct AppState {
    pub(crate) chat: ChatOrchestrator,
    pub(crate) fanout: Arc<FanoutRegistry>,
    /// Present when the PostgreSQL backend is selected.
    pub(crate) pool: Option<sqlx::PgPool>,
}

impl AppState {
    pub fn new(
        chat: ChatOrchestrator,
        fanout: Arc<FanoutRegistry>,
        pool: Option<sqlx::PgPool>,
    ) -> Self {
        Self { chat, fanout, pool }
    }
}
