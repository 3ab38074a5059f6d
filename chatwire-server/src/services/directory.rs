//! Read-only lookups the chat service needs from the rest of the platform:
//! group membership, shared posts, and their like/comment counters.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{config::server::GroupSeed, models::ChatPost};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// True when `user_id` created the group or is listed among its members.
    async fn is_member(&self, group_id: i64, user_id: i64) -> DirectoryResult<bool>;
}

#[async_trait]
pub trait PostDirectory: Send + Sync {
    async fn post(&self, post_id: i64) -> DirectoryResult<Option<ChatPost>>;
}

#[async_trait]
pub trait CounterCache: Send + Sync {
    async fn like_count(&self, post_id: i64) -> DirectoryResult<i64>;
    async fn comment_count(&self, post_id: i64) -> DirectoryResult<i64>;
}

/// The three lookups bundled for the orchestrator.
#[derive(Clone)]
pub struct Directories {
    pub groups: Arc<dyn GroupDirectory>,
    pub posts: Arc<dyn PostDirectory>,
    pub counters: Arc<dyn CounterCache>,
}

impl Directories {
    /// Uses one value for all three lookups.
    pub fn from_single<D>(directory: Arc<D>) -> Self
    where
        D: GroupDirectory + PostDirectory + CounterCache + 'static,
    {
        Self {
            groups: directory.clone(),
            posts: directory.clone(),
            counters: directory,
        }
    }
}

impl std::fmt::Debug for Directories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directories").finish_non_exhaustive()
    }
}

#[derive(sqlx::FromRow)]
struct PostRow {
    id: i64,
    user_id: i64,
    title: String,
    content: String,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<PostRow> for ChatPost {
    fn from(row: PostRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            content: row.content,
            tags: row.tags,
            created_at: Some(row.created_at),
            like_count: None,
            comment_count: None,
        }
    }
}

/// Directory backed by the platform's PostgreSQL tables.
#[derive(Debug, Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GroupDirectory for PgDirectory {
    async fn is_member(&self, group_id: i64, user_id: i64) -> DirectoryResult<bool> {
        let member = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM groups \
             WHERE id = $1 AND (created_by = $2 OR $2 = ANY(members)))",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(member)
    }
}

#[async_trait]
impl PostDirectory for PgDirectory {
    async fn post(&self, post_id: i64) -> DirectoryResult<Option<ChatPost>> {
        let row = sqlx::query_as::<_, PostRow>(
            "SELECT id, user_id, title, content, tags, created_at FROM posts WHERE id = $1",
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ChatPost::from))
    }
}

#[async_trait]
impl CounterCache for PgDirectory {
    async fn like_count(&self, post_id: i64) -> DirectoryResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM liked WHERE post_id = $1")
            .bind(post_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn comment_count(&self, post_id: i64) -> DirectoryResult<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM comments WHERE post_id = $1")
                .bind(post_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[derive(Debug, Default)]
struct Group {
    created_by: i64,
    members: HashSet<i64>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    groups: HashMap<i64, Group>,
    posts: HashMap<i64, ChatPost>,
    likes: HashMap<i64, i64>,
    comments: HashMap<i64, i64>,
}

/// Process-local directory used with the in-memory bus and in tests.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that starts out knowing `groups`.
    pub fn with_groups(groups: &[GroupSeed]) -> Self {
        let groups = groups
            .iter()
            .map(|seed| {
                let group = Group {
                    created_by: seed.created_by,
                    members: seed.members.iter().copied().collect(),
                };
                (seed.id, group)
            })
            .collect();
        Self {
            state: RwLock::new(DirectoryState {
                groups,
                ..DirectoryState::default()
            }),
        }
    }

    pub async fn add_group(&self, group_id: i64, created_by: i64, members: &[i64]) {
        self.state.write().await.groups.insert(
            group_id,
            Group {
                created_by,
                members: members.iter().copied().collect(),
            },
        );
    }

    pub async fn add_post(&self, post: ChatPost) {
        self.state.write().await.posts.insert(post.id, post);
    }

    pub async fn set_counters(&self, post_id: i64, likes: i64, comments: i64) {
        let mut state = self.state.write().await;
        state.likes.insert(post_id, likes);
        state.comments.insert(post_id, comments);
    }
}

#[async_trait]
impl GroupDirectory for InMemoryDirectory {
    async fn is_member(&self, group_id: i64, user_id: i64) -> DirectoryResult<bool> {
        let state = self.state.read().await;
        Ok(state
            .groups
            .get(&group_id)
            .is_some_and(|group| group.created_by == user_id || group.members.contains(&user_id)))
    }
}

#[async_trait]
impl PostDirectory for InMemoryDirectory {
    async fn post(&self, post_id: i64) -> DirectoryResult<Option<ChatPost>> {
        Ok(self.state.read().await.posts.get(&post_id).cloned())
    }
}

#[async_trait]
impl CounterCache for InMemoryDirectory {
    async fn like_count(&self, post_id: i64) -> DirectoryResult<i64> {
        Ok(self.state.read().await.likes.get(&post_id).copied().unwrap_or(0))
    }

    async fn comment_count(&self, post_id: i64) -> DirectoryResult<i64> {
        Ok(self
            .state
            .read()
            .await
            .comments
            .get(&post_id)
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_groups_are_known_from_the_start() {
        let directory = InMemoryDirectory::with_groups(&[GroupSeed {
            id: 7,
            created_by: 1,
            members: vec![2],
        }]);

        assert!(directory.is_member(7, 1).await.unwrap());
        assert!(directory.is_member(7, 2).await.unwrap());
        assert!(!directory.is_member(7, 3).await.unwrap());
    }

    #[tokio::test]
    async fn creator_and_listed_members_belong_to_group() {
        let directory = InMemoryDirectory::new();
        directory.add_group(100, 10, &[20, 30]).await;

        assert!(directory.is_member(100, 10).await.unwrap());
        assert!(directory.is_member(100, 30).await.unwrap());
        assert!(!directory.is_member(100, 99).await.unwrap());
        assert!(!directory.is_member(101, 10).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_posts_and_counters_are_empty() {
        let directory = InMemoryDirectory::new();
        assert_eq!(directory.post(5).await.unwrap(), None);
        assert_eq!(directory.like_count(5).await.unwrap(), 0);
        assert_eq!(directory.comment_count(5).await.unwrap(), 0);
    }
}
