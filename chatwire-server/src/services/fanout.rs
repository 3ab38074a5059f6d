//! In-process registry of live chat sockets.
//!
//! Frames are relayed verbatim to whoever is connected right now. Nothing is
//! buffered for peers that are offline.

use std::collections::{HashMap, HashSet};

use axum::extract::ws::Message;
use metrics::{counter, gauge};
use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies one registration so a stale socket cannot evict its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(Uuid);

impl RegistrationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// What a socket is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Direct {
        client_id: i64,
        target_id: i64,
    },
    Group {
        group_id: i64,
        client_id: i64,
        members: Vec<i64>,
    },
}

impl Channel {
    pub fn client_id(&self) -> i64 {
        match self {
            Channel::Direct { client_id, .. } | Channel::Group { client_id, .. } => *client_id,
        }
    }

    /// Registry key of the socket itself.
    pub fn identity_key(&self) -> String {
        match self {
            Channel::Direct { client_id, .. } => direct_key(*client_id),
            Channel::Group {
                group_id,
                client_id,
                ..
            } => group_key(*group_id, *client_id),
        }
    }

    /// Registry keys a frame from this socket is addressed to.
    fn recipient_keys(&self) -> Vec<String> {
        match self {
            Channel::Direct { target_id, .. } => vec![direct_key(*target_id)],
            Channel::Group {
                group_id,
                client_id,
                members,
            } => {
                let mut seen = HashSet::new();
                members
                    .iter()
                    .filter(|member| *member != client_id && seen.insert(**member))
                    .map(|member| group_key(*group_id, *member))
                    .collect()
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Channel::Direct { .. } => "direct",
            Channel::Group { .. } => "group",
        }
    }
}

fn direct_key(client_id: i64) -> String {
    client_id.to_string()
}

fn group_key(group_id: i64, client_id: i64) -> String {
    format!("{group_id}-{client_id}")
}

struct Registration {
    id: RegistrationId,
    sender: mpsc::Sender<Message>,
}

pub struct FanoutRegistry {
    capacity: usize,
    connections: Mutex<HashMap<String, Registration>>,
}

impl std::fmt::Debug for FanoutRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutRegistry")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl FanoutRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Outbound queue sized for one socket.
    pub fn channel(&self) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(self.capacity)
    }

    /// Registers `sender` under `key`, replacing any previous socket there.
    pub async fn register(&self, key: String, sender: mpsc::Sender<Message>) -> RegistrationId {
        let id = RegistrationId::new();
        let mut guard = self.connections.lock().await;
        if guard.insert(key.clone(), Registration { id, sender }).is_some() {
            debug!(key = %key, "replaced existing socket registration");
        }
        gauge!("chatwire_ws_connections").set(guard.len() as f64);
        id
    }

    /// Removes `key` only while it still belongs to registration `id`.
    pub async fn unregister(&self, key: &str, id: RegistrationId) -> bool {
        let mut guard = self.connections.lock().await;
        let owned = guard.get(key).is_some_and(|current| current.id == id);
        if owned {
            guard.remove(key);
        }
        gauge!("chatwire_ws_connections").set(guard.len() as f64);
        owned
    }

    /// Forwards `frame` to every connected recipient and returns how many
    /// queues accepted it.
    pub async fn relay(&self, channel: &Channel, frame: Message) -> usize {
        let targets: Vec<(String, mpsc::Sender<Message>)> = {
            let guard = self.connections.lock().await;
            channel
                .recipient_keys()
                .into_iter()
                .filter_map(|key| {
                    let sender = guard.get(&key)?.sender.clone();
                    Some((key, sender))
                })
                .collect()
        };

        let mut delivered = 0;
        for (key, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(recipient = %key, "peer queue full, dropping frame");
                    counter!("chatwire_fanout_dropped_total", "reason" => "full").increment(1);
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(recipient = %key, "peer queue closed, dropping frame");
                    counter!("chatwire_fanout_dropped_total", "reason" => "closed").increment(1);
                }
            }
        }

        counter!("chatwire_fanout_delivered_total", "kind" => channel.kind())
            .increment(delivered as u64);
        delivered
    }

    /// Number of live registrations.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }
}

impl Default for FanoutRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}
