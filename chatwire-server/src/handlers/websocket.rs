//! Live relay socket.
//!
//! `GET /ws?clientid=<id>&targetid=<id>` joins a direct conversation and
//! `GET /ws?clientid=<id>&members=<group>,<m1>,<m2>,...` joins a group one.
//! Every text or binary frame the client sends is forwarded unchanged to the
//! peers connected at that moment.

use std::sync::Arc;

use axum::{
    extract::{
        Extension, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    app_state::AppState,
    handlers::chat::parse_id,
    http::error::{ApiError, AppResult},
    middleware::identity::{IdentityState, caller_from_headers},
    services::{Channel, FanoutRegistry},
};

#[derive(Debug, Default, Deserialize)]
pub struct SocketQuery {
    clientid: Option<String>,
    targetid: Option<String>,
    members: Option<String>,
}

impl SocketQuery {
    /// Resolves the query into the channel the socket joins.
    pub fn channel(&self) -> AppResult<Channel> {
        let client_id = parse_id(
            self.clientid
                .as_deref()
                .ok_or_else(|| ApiError::bad_request("clientid is required"))?,
            "clientid",
        )?;

        if let Some(members) = self.members.as_deref().filter(|raw| !raw.trim().is_empty()) {
            let mut ids = members
                .split(',')
                .map(|raw| parse_id(raw, "members entry"));
            let group_id = ids
                .next()
                .ok_or_else(|| ApiError::bad_request("members must start with the group id"))??;
            let members = ids.collect::<AppResult<Vec<_>>>()?;
            return Ok(Channel::Group {
                group_id,
                client_id,
                members,
            });
        }

        let target_id = parse_id(
            self.targetid
                .as_deref()
                .ok_or_else(|| ApiError::bad_request("targetid or members is required"))?,
            "targetid",
        )?;
        Ok(Channel::Direct {
            client_id,
            target_id,
        })
    }
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<IdentityState>,
    headers: HeaderMap,
    Query(query): Query<SocketQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let channel = query.channel()?;

    if let Some(caller) = caller_from_headers(&headers, identity.header())? {
        if caller != channel.client_id() {
            return Err(ApiError::forbidden(
                "clientid does not match the caller identity",
            ));
        }
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let fanout = state.fanout.clone();
    Ok(upgrade.on_upgrade(move |socket| run_socket(socket, fanout, channel)))
}

async fn run_socket(socket: WebSocket, fanout: Arc<FanoutRegistry>, channel: Channel) {
    let key = channel.identity_key();
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut inbox) = fanout.channel();
    let registration = fanout.register(key.clone(), outbound).await;
    info!(key = %key, "socket registered");

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = inbox.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let relay = fanout.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(frame @ (Message::Text(_) | Message::Binary(_))) => {
                    let delivered = relay.relay(&channel, frame).await;
                    debug!(delivered, "relayed frame");
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "socket read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut reader => writer.abort(),
        _ = &mut writer => reader.abort(),
    }

    let removed = fanout.unregister(&key, registration).await;
    info!(key = %key, removed, "socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(clientid: Option<&str>, targetid: Option<&str>, members: Option<&str>) -> SocketQuery {
        SocketQuery {
            clientid: clientid.map(Into::into),
            targetid: targetid.map(Into::into),
            members: members.map(Into::into),
        }
    }

    #[test]
    fn direct_query_resolves_to_direct_channel() {
        let channel = query(Some("1"), Some("2"), None).channel().unwrap();
        assert_eq!(
            channel,
            Channel::Direct {
                client_id: 1,
                target_id: 2
            }
        );
    }

    #[test]
    fn members_list_starts_with_group_id() {
        let channel = query(Some("20"), None, Some("100,10,20,30"))
            .channel()
            .unwrap();
        assert_eq!(
            channel,
            Channel::Group {
                group_id: 100,
                client_id: 20,
                members: vec![10, 20, 30]
            }
        );
        assert_eq!(channel.identity_key(), "100-20");
    }

    #[test]
    fn malformed_queries_are_rejected() {
        for bad in [
            query(None, Some("2"), None),
            query(Some("1"), None, None),
            query(Some("x"), Some("2"), None),
            query(Some("1"), Some("0"), None),
            query(Some("1"), None, Some("100,ten")),
        ] {
            let err = bad.channel().unwrap_err();
            assert_eq!(err.code(), "validation_failed", "{bad:?}");
        }
    }
}
