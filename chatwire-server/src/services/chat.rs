use std::collections::{BTreeSet, HashMap};

use chrono::{FixedOffset, Utc};
use shared::{
    config::server::ChatConfig,
    models::{ChatMessage, ChatPost, ConversationKind, LogKind, SendChatRequest, Topic},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    bus::BusError,
    services::{
        directory::{DirectoryError, Directories},
        history::{HistoryReader, ReplayError},
    },
};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("caller identity is missing")]
    MissingIdentity,
    #[error("user {user_id} is not a member of group {group_id}")]
    NotMember { group_id: i64, user_id: i64 },
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Replay(ReplayError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl From<ReplayError> for ChatError {
    fn from(err: ReplayError) -> Self {
        match err {
            ReplayError::Bus(err) => ChatError::Bus(err),
            other => ChatError::Replay(other),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Result of a send: the whole thread when the message carried text, a bare
/// acknowledgment otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Thread(Vec<ChatMessage>),
    Sent { seq: u64 },
}

/// Coordinates authorization, appends, replays and enrichment for the
/// direct and group chat endpoints.
#[derive(Debug, Clone)]
pub struct ChatOrchestrator {
    history: HistoryReader,
    directories: Directories,
    offset: FixedOffset,
    max_text_len: usize,
}

impl ChatOrchestrator {
    pub fn new(
        history: HistoryReader,
        directories: Directories,
        offset: FixedOffset,
        max_text_len: usize,
    ) -> Self {
        Self {
            history,
            directories,
            offset,
            max_text_len,
        }
    }

    pub fn from_config(
        history: HistoryReader,
        directories: Directories,
        config: &ChatConfig,
    ) -> Result<Self, String> {
        Ok(Self::new(
            history,
            directories,
            config.offset()?,
            config.max_text_len,
        ))
    }

    pub fn history_reader(&self) -> &HistoryReader {
        &self.history
    }

    #[instrument(
        name = "chat.send",
        skip(self, request, cancel),
        fields(topic = %conversation.topic(), has_text = !request.text.is_empty()),
        err(Display)
    )]
    pub async fn send(
        &self,
        conversation: &ConversationKind,
        sender_id: i64,
        mut request: SendChatRequest,
        cancel: &CancellationToken,
    ) -> ChatResult<SendOutcome> {
        let receiver_id = self.authorize(conversation, sender_id).await?;
        // Zero is the wire form of "no post".
        request.post_id = request.post_id.filter(|id| *id != 0);
        self.validate(&request)?;

        let message = ChatMessage {
            sender_id,
            receiver_id,
            text: request.text,
            post_id: request.post_id,
            date: Utc::now().with_timezone(&self.offset),
            seq: None,
            post: None,
        };

        let seq = self.history.bus().append(conversation, &message).await?;
        debug!(seq, "chat message appended");

        if message.text.is_empty() {
            return Ok(SendOutcome::Sent { seq });
        }

        let mut thread = self.history.replay(conversation, cancel).await?;
        self.enrich(&mut thread).await;
        Ok(SendOutcome::Thread(thread))
    }

    #[instrument(name = "chat.history", skip(self, cancel), fields(topic = %conversation.topic()), err(Display))]
    pub async fn history(
        &self,
        conversation: &ConversationKind,
        caller_id: i64,
        since: Option<u64>,
        cancel: &CancellationToken,
    ) -> ChatResult<Vec<ChatMessage>> {
        self.authorize(conversation, caller_id).await?;

        let mut thread = self
            .history
            .read_all_since(conversation, since, cancel)
            .await?;
        self.enrich(&mut thread).await;
        Ok(thread)
    }

    /// Users the caller already has a direct conversation with, ascending.
    #[instrument(name = "chat.open_chats", skip(self), err(Display))]
    pub async fn open_chats(&self, caller_id: i64) -> ChatResult<Vec<i64>> {
        let topics = self.history.bus().topics(LogKind::Direct).await?;
        let peers: BTreeSet<i64> = topics
            .iter()
            .filter_map(|topic| Topic::parse(topic.as_str()).ok())
            .filter_map(|conversation| conversation.peer_of(caller_id))
            .collect();
        Ok(peers.into_iter().collect())
    }

    /// Checks the caller may use the conversation and returns the receiver
    /// id to stamp on outgoing messages.
    async fn authorize(&self, conversation: &ConversationKind, caller_id: i64) -> ChatResult<i64> {
        if caller_id <= 0 {
            return Err(ChatError::MissingIdentity);
        }

        match *conversation {
            ConversationKind::Direct { .. } => conversation.peer_of(caller_id).ok_or_else(|| {
                ChatError::InvalidInput(format!(
                    "user {caller_id} is not a participant of {}",
                    conversation.topic()
                ))
            }),
            ConversationKind::Group { group_id } => {
                if self
                    .directories
                    .groups
                    .is_member(group_id, caller_id)
                    .await?
                {
                    Ok(group_id)
                } else {
                    Err(ChatError::NotMember {
                        group_id,
                        user_id: caller_id,
                    })
                }
            }
        }
    }

    fn validate(&self, request: &SendChatRequest) -> ChatResult<()> {
        if request.text.is_empty() && request.post_id.is_none() {
            return Err(ChatError::InvalidInput(
                "message needs text or a post_id".into(),
            ));
        }
        if request.post_id.is_some_and(|id| id <= 0) {
            return Err(ChatError::InvalidInput("post_id must not be negative".into()));
        }
        let length = request.text.chars().count();
        if length > self.max_text_len {
            return Err(ChatError::InvalidInput(format!(
                "text is {length} characters, limit is {}",
                self.max_text_len
            )));
        }
        Ok(())
    }

    /// Attaches referenced posts and their counters. Lookup failures leave
    /// the fields empty.
    async fn enrich(&self, thread: &mut [ChatMessage]) {
        let mut posts: HashMap<i64, Option<ChatPost>> = HashMap::new();

        for message in thread.iter_mut() {
            let Some(post_id) = message.post_id else {
                continue;
            };
            if !posts.contains_key(&post_id) {
                let post = self.load_post(post_id).await;
                posts.insert(post_id, post);
            }
            message.post = posts.get(&post_id).cloned().flatten();
        }
    }

    async fn load_post(&self, post_id: i64) -> Option<ChatPost> {
        let mut post = match self.directories.posts.post(post_id).await {
            Ok(Some(post)) => post,
            Ok(None) => {
                debug!(post_id, "shared post no longer exists");
                return None;
            }
            Err(err) => {
                warn!(post_id, error = %err, "failed to load shared post");
                return None;
            }
        };

        match self.directories.counters.like_count(post_id).await {
            Ok(count) => post.like_count = Some(count),
            Err(err) => warn!(post_id, error = %err, "failed to load like count"),
        }
        match self.directories.counters.comment_count(post_id).await {
            Ok(count) => post.comment_count = Some(count),
            Err(err) => warn!(post_id, error = %err, "failed to load comment count"),
        }
        Some(post)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::ChatBus,
        services::directory::{
            CounterCache, DirectoryResult, GroupDirectory, InMemoryDirectory, PostDirectory,
        },
    };
    use async_trait::async_trait;
    use std::{sync::Arc, time::Duration};

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    fn orchestrator_with(directories: Directories) -> ChatOrchestrator {
        let history = HistoryReader::new(
            ChatBus::in_memory(),
            Duration::from_millis(10),
            Some(Duration::from_secs(2)),
        );
        ChatOrchestrator::new(history, directories, ist(), 32)
    }

    async fn orchestrator() -> (ChatOrchestrator, Arc<InMemoryDirectory>) {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_group(100, 10, &[20, 30]).await;
        (
            orchestrator_with(Directories::from_single(directory.clone())),
            directory,
        )
    }

    fn text(body: &str) -> SendChatRequest {
        SendChatRequest {
            text: body.into(),
            post_id: None,
        }
    }

    fn post(id: i64) -> ChatPost {
        ChatPost {
            id,
            user_id: 1,
            title: "trip".into(),
            content: "photos".into(),
            tags: vec!["travel".into()],
            created_at: None,
            like_count: None,
            comment_count: None,
        }
    }

    /// Posts resolve, counters always fail.
    struct BrokenCounters(InMemoryDirectory);

    #[async_trait]
    impl GroupDirectory for BrokenCounters {
        async fn is_member(&self, group_id: i64, user_id: i64) -> DirectoryResult<bool> {
            self.0.is_member(group_id, user_id).await
        }
    }

    #[async_trait]
    impl PostDirectory for BrokenCounters {
        async fn post(&self, post_id: i64) -> DirectoryResult<Option<ChatPost>> {
            self.0.post(post_id).await
        }
    }

    #[async_trait]
    impl CounterCache for BrokenCounters {
        async fn like_count(&self, _post_id: i64) -> DirectoryResult<i64> {
            Err(DirectoryError::Unavailable("cache down".into()))
        }
        async fn comment_count(&self, _post_id: i64) -> DirectoryResult<i64> {
            Err(DirectoryError::Unavailable("cache down".into()))
        }
    }

    #[tokio::test]
    async fn direct_send_with_text_returns_the_thread() {
        let (chat, _) = orchestrator().await;
        let conversation = ConversationKind::direct(1, 2);
        let cancel = CancellationToken::new();

        chat.send(&conversation, 1, text("hi"), &cancel).await.unwrap();
        let outcome = chat
            .send(&conversation, 2, text("hello"), &cancel)
            .await
            .unwrap();

        let SendOutcome::Thread(thread) = outcome else {
            panic!("expected a thread, got {outcome:?}");
        };
        assert_eq!(thread.len(), 2);
        assert_eq!((thread[0].sender_id, thread[0].receiver_id), (1, 2));
        assert_eq!((thread[1].sender_id, thread[1].receiver_id), (2, 1));
        assert_eq!(thread[1].text, "hello");
        assert_eq!(thread[0].date.offset(), &ist());
    }

    #[tokio::test]
    async fn post_only_send_is_acknowledged_without_replay() {
        let (chat, _) = orchestrator().await;
        let conversation = ConversationKind::direct(1, 2);
        let cancel = CancellationToken::new();

        let outcome = chat
            .send(
                &conversation,
                1,
                SendChatRequest {
                    text: String::new(),
                    post_id: Some(7),
                },
                &cancel,
            )
            .await
            .unwrap();
        let SendOutcome::Sent { seq } = outcome else {
            panic!("expected a bare acknowledgment, got {outcome:?}");
        };

        let thread = chat.history(&conversation, 2, None, &cancel).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].seq, Some(seq));
        assert_eq!(thread[0].post_id, Some(7));
    }

    #[tokio::test]
    async fn non_member_cannot_send_to_group_and_nothing_is_written() {
        let (chat, _) = orchestrator().await;
        let conversation = ConversationKind::group(100);
        let cancel = CancellationToken::new();

        let result = chat.send(&conversation, 99, text("let me in"), &cancel).await;
        assert!(matches!(
            result,
            Err(ChatError::NotMember {
                group_id: 100,
                user_id: 99
            })
        ));

        let bus = chat.history_reader().bus();
        assert!(bus.backend().logs().await.unwrap().is_empty());
        assert!(bus.cursors(LogKind::Group).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn group_creator_and_members_share_one_thread() {
        let (chat, _) = orchestrator().await;
        let conversation = ConversationKind::group(100);
        let cancel = CancellationToken::new();

        chat.send(&conversation, 10, text("welcome"), &cancel)
            .await
            .unwrap();
        let outcome = chat
            .send(&conversation, 30, text("thanks"), &cancel)
            .await
            .unwrap();

        let SendOutcome::Thread(thread) = outcome else {
            panic!("expected a thread");
        };
        assert!(thread.iter().all(|message| message.receiver_id == 100));
        assert_eq!(thread.len(), 2);

        assert!(matches!(
            chat.history(&conversation, 99, None, &cancel).await,
            Err(ChatError::NotMember { .. })
        ));
    }

    #[tokio::test]
    async fn empty_and_oversized_payloads_are_rejected() {
        let (chat, _) = orchestrator().await;
        let conversation = ConversationKind::direct(1, 2);
        let cancel = CancellationToken::new();

        assert!(matches!(
            chat.send(&conversation, 1, text(""), &cancel).await,
            Err(ChatError::InvalidInput(_))
        ));
        assert!(matches!(
            chat.send(&conversation, 1, text(&"x".repeat(33)), &cancel)
                .await,
            Err(ChatError::InvalidInput(_))
        ));
        assert!(
            chat.history_reader()
                .bus()
                .backend()
                .logs()
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn zero_post_id_means_no_post() {
        let (chat, _) = orchestrator().await;
        let conversation = ConversationKind::direct(1, 2);
        let cancel = CancellationToken::new();

        let outcome = chat
            .send(
                &conversation,
                1,
                SendChatRequest {
                    text: "hi".into(),
                    post_id: Some(0),
                },
                &cancel,
            )
            .await
            .unwrap();
        let SendOutcome::Thread(thread) = outcome else {
            panic!("expected the thread");
        };
        assert_eq!(thread[0].post_id, None);

        let bare_zero = SendChatRequest {
            text: String::new(),
            post_id: Some(0),
        };
        assert!(matches!(
            chat.send(&conversation, 1, bare_zero, &cancel).await,
            Err(ChatError::InvalidInput(_))
        ));
        assert!(matches!(
            chat.send(
                &conversation,
                1,
                SendChatRequest {
                    text: "hi".into(),
                    post_id: Some(-3),
                },
                &cancel
            )
            .await,
            Err(ChatError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn outsider_cannot_address_a_direct_conversation() {
        let (chat, _) = orchestrator().await;
        let result = chat
            .send(&ConversationKind::direct(1, 2), 3, text("hi"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ChatError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn replay_enriches_shared_posts_with_counters() {
        let (chat, directory) = orchestrator().await;
        directory.add_post(post(7)).await;
        directory.set_counters(7, 4, 2).await;
        let conversation = ConversationKind::direct(1, 2);
        let cancel = CancellationToken::new();

        chat.send(
            &conversation,
            1,
            SendChatRequest {
                text: "look".into(),
                post_id: Some(7),
            },
            &cancel,
        )
        .await
        .unwrap();

        let thread = chat.history(&conversation, 1, None, &cancel).await.unwrap();
        let enriched = thread[0].post.as_ref().expect("post attached");
        assert_eq!(enriched.title, "trip");
        assert_eq!(enriched.like_count, Some(4));
        assert_eq!(enriched.comment_count, Some(2));
    }

    #[tokio::test]
    async fn counter_failures_do_not_abort_the_replay() {
        let directory = Arc::new(BrokenCounters(InMemoryDirectory::new()));
        directory.0.add_post(post(7)).await;
        let chat = orchestrator_with(Directories::from_single(directory));
        let conversation = ConversationKind::direct(1, 2);
        let cancel = CancellationToken::new();

        chat.send(
            &conversation,
            1,
            SendChatRequest {
                text: "look".into(),
                post_id: Some(7),
            },
            &cancel,
        )
        .await
        .unwrap();

        let thread = chat.history(&conversation, 2, None, &cancel).await.unwrap();
        let enriched = thread[0].post.as_ref().expect("post attached");
        assert_eq!(enriched.like_count, None);
        assert_eq!(enriched.comment_count, None);
    }

    #[tokio::test]
    async fn missing_posts_leave_the_message_unenriched() {
        let (chat, _) = orchestrator().await;
        let conversation = ConversationKind::direct(1, 2);
        let cancel = CancellationToken::new();

        chat.send(
            &conversation,
            1,
            SendChatRequest {
                text: "gone".into(),
                post_id: Some(404),
            },
            &cancel,
        )
        .await
        .unwrap();

        let thread = chat.history(&conversation, 1, None, &cancel).await.unwrap();
        assert_eq!(thread[0].post_id, Some(404));
        assert!(thread[0].post.is_none());
    }

    #[tokio::test]
    async fn open_chats_lists_distinct_direct_peers() {
        let (chat, _) = orchestrator().await;
        let cancel = CancellationToken::new();
        for (from, to) in [(1, 5), (5, 1), (3, 1), (2, 4)] {
            chat.send(&ConversationKind::direct(from, to), from, text("hey"), &cancel)
                .await
                .unwrap();
        }
        chat.send(&ConversationKind::group(100), 10, text("group"), &cancel)
            .await
            .unwrap();

        assert_eq!(chat.open_chats(1).await.unwrap(), vec![3, 5]);
        assert_eq!(chat.open_chats(4).await.unwrap(), vec![2]);
        assert!(chat.open_chats(10).await.unwrap().is_empty());
    }

    #[test]
    fn replay_bus_errors_flatten_into_bus_variant() {
        let err = ChatError::from(ReplayError::Bus(BusError::Transport("reset".into())));
        assert!(matches!(err, ChatError::Bus(_)));
        let err = ChatError::from(ReplayError::Cancelled);
        assert!(matches!(err, ChatError::Replay(ReplayError::Cancelled)));
    }
}
