//! Conversation addressing.
//!
//! Every producer and consumer of a conversation must agree on one topic
//! string, otherwise messages and history silently split across two
//! partitions. [`ConversationKind::topic`] is the only place that string is
//! built.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const USER_PREFIX: &str = "chat.user.";
const GROUP_PREFIX: &str = "chat.group.";

/// Which durable log a conversation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// One-to-one conversations.
    Direct,
    /// Group conversations.
    Group,
}

impl LogKind {
    /// Durable name of the log.
    #[must_use]
    pub const fn log_name(self) -> &'static str {
        match self {
            Self::Direct => "USER_CHAT_LOG",
            Self::Group => "GROUP_CHAT_LOG",
        }
    }

    /// Wildcard subject pattern accepted by the log.
    #[must_use]
    pub const fn subject_pattern(self) -> &'static str {
        match self {
            Self::Direct => "chat.user.>",
            Self::Group => "chat.group.>",
        }
    }

    /// Prefix used when naming ephemeral read cursors on this log.
    #[must_use]
    pub const fn reader_prefix(self) -> &'static str {
        match self {
            Self::Direct => "USER_CHAT_READER",
            Self::Group => "GROUP_CHAT_READER",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

/// A conversation target: an unordered pair of users or a single group.
///
/// `Direct` always stores the pair with `low <= high` so two values built
/// from `(a, b)` and `(b, a)` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKind {
    Direct { low: i64, high: i64 },
    Group { group_id: i64 },
}

impl ConversationKind {
    /// Builds a direct conversation between two participants in any order.
    #[must_use]
    pub fn direct(a: i64, b: i64) -> Self {
        if a <= b {
            Self::Direct { low: a, high: b }
        } else {
            Self::Direct { low: b, high: a }
        }
    }

    #[must_use]
    pub const fn group(group_id: i64) -> Self {
        Self::Group { group_id }
    }

    #[must_use]
    pub const fn log_kind(&self) -> LogKind {
        match self {
            Self::Direct { .. } => LogKind::Direct,
            Self::Group { .. } => LogKind::Group,
        }
    }

    /// Canonical bus topic for this conversation.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::Direct { low, high } => Topic(format!("{USER_PREFIX}{low}.{high}")),
            Self::Group { group_id } => Topic(format!("{GROUP_PREFIX}{group_id}")),
        }
    }

    /// For a direct conversation, the participant that is not `me`.
    ///
    /// Returns `None` for groups and for pairs that do not include `me`.
    #[must_use]
    pub const fn peer_of(&self, me: i64) -> Option<i64> {
        match *self {
            Self::Direct { low, high } if low == me => Some(high),
            Self::Direct { low, high } if high == me => Some(low),
            _ => None,
        }
    }
}

/// Canonical partition key of a conversation on the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("not a chat topic: {0}")]
pub struct TopicParseError(pub String);

impl Topic {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses a topic string back into the conversation it addresses.
    ///
    /// # Errors
    /// Returns [`TopicParseError`] when the string was not produced by
    /// [`ConversationKind::topic`].
    pub fn parse(raw: &str) -> Result<ConversationKind, TopicParseError> {
        let invalid = || TopicParseError(raw.to_string());

        if let Some(rest) = raw.strip_prefix(USER_PREFIX) {
            let (low, high) = rest.split_once('.').ok_or_else(invalid)?;
            let low: i64 = low.parse().map_err(|_| invalid())?;
            let high: i64 = high.parse().map_err(|_| invalid())?;
            if low > high {
                return Err(invalid());
            }
            return Ok(ConversationKind::Direct { low, high });
        }

        if let Some(rest) = raw.strip_prefix(GROUP_PREFIX) {
            let group_id = rest.parse().map_err(|_| invalid())?;
            return Ok(ConversationKind::Group { group_id });
        }

        Err(invalid())
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_topic_is_commutative() {
        let ids = [-7_i64, 0, 1, 2, 42, 1_000, i64::MAX];
        for &a in &ids {
            for &b in &ids {
                assert_eq!(
                    ConversationKind::direct(a, b).topic(),
                    ConversationKind::direct(b, a).topic(),
                    "pair ({a}, {b})"
                );
            }
        }
    }

    #[test]
    fn direct_topic_orders_numerically_not_lexically() {
        let topic = ConversationKind::direct(10, 9).topic();
        assert_eq!(topic.as_str(), "chat.user.9.10");
    }

    #[test]
    fn group_topic_depends_only_on_group_id() {
        assert_eq!(ConversationKind::group(100).topic().as_str(), "chat.group.100");
        assert_eq!(
            ConversationKind::group(100).topic(),
            ConversationKind::group(100).topic()
        );
    }

    #[test]
    fn topics_match_their_log_wildcard() {
        let direct = ConversationKind::direct(3, 1);
        let pattern = direct.log_kind().subject_pattern().trim_end_matches('>');
        assert!(direct.topic().as_str().starts_with(pattern));

        let group = ConversationKind::group(5);
        let pattern = group.log_kind().subject_pattern().trim_end_matches('>');
        assert!(group.topic().as_str().starts_with(pattern));
    }

    #[test]
    fn parse_reverses_topic() {
        for kind in [ConversationKind::direct(8, 2), ConversationKind::group(77)] {
            assert_eq!(Topic::parse(kind.topic().as_str()), Ok(kind));
        }
    }

    #[test]
    fn parse_rejects_foreign_subjects() {
        assert!(Topic::parse("chat.user.5").is_err());
        assert!(Topic::parse("chat.user.9.3").is_err());
        assert!(Topic::parse("chat.group.abc").is_err());
        assert!(Topic::parse("orders.created").is_err());
    }

    #[test]
    fn peer_of_returns_other_participant() {
        let kind = ConversationKind::direct(4, 11);
        assert_eq!(kind.peer_of(4), Some(11));
        assert_eq!(kind.peer_of(11), Some(4));
        assert_eq!(kind.peer_of(5), None);
        assert_eq!(ConversationKind::group(4).peer_of(4), None);
    }
}
