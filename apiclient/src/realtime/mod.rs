// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Realtime websocket client.
//!
//! One socket multiplexes any number of channels. Each channel is a named
//! topic subscribing to row changes, broadcast messages and/or presence.
//! The socket reconnects on its own and rejoins every registered channel;
//! consumers observe this only through [`ChannelStatus`] messages.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ggvcommon::{REALTIME_PROTOCOL_VERSION, endpoint_paths::ENDPOINT_REALTIME_WS};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::{ApiClient, Protocol};

pub use channel::RealtimeChannel;
pub use message::{
    ChangeEvent, ChannelConfig, ChannelMessage, ChannelStatus, PostgresChange,
    PostgresChangeFilter, PresenceMap,
};

mod channel;
mod message;
mod socket;

#[cfg(test)]
mod tests;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Malformed realtime URL: {0}")]
    WrongUrl(#[from] url::ParseError),
}

/// Timing parameters of the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Interval between heartbeats sent to the server.
    pub heartbeat_interval: Duration,
    /// The connection is considered dead if no frame arrived for this long.
    pub timeout: Duration,
    /// Delay between connection attempts.
    pub retry_interval: Duration,
    /// Time the server has to acknowledge a channel join.
    pub join_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(5),
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// Commands from channel handles to the socket task.
#[derive(Debug)]
pub(crate) enum SocketCommand {
    Join { topic: String },
    Leave { topic: String, join_ref: Option<String> },
    Track { topic: String },
    Untrack { topic: String },
    Broadcast { topic: String, event: String, payload: Value },
    AccessToken,
}

/// Registration of a channel with the socket.
pub(crate) struct ChannelEntry {
    pub(crate) id: Uuid,
    pub(crate) config: ChannelConfig,
    pub(crate) tx: mpsc::UnboundedSender<ChannelMessage>,
    /// Reference of the join sent on the current connection, if any.
    pub(crate) join_ref: Option<String>,
    pub(crate) join_sent_at: Option<Instant>,
    pub(crate) joined: bool,
    /// Own presence, re-announced after every successful join.
    pub(crate) presence: Option<Value>,
}

impl ChannelEntry {
    pub(crate) fn notify(&self, message: ChannelMessage) {
        // The receiver is gone only while the channel is being dropped.
        let _ = self.tx.send(message);
    }
}

/// State shared between the client handles and the socket task.
pub(crate) struct Shared {
    pub(crate) channels: Mutex<HashMap<String, ChannelEntry>>,
    access_token: Mutex<Arc<str>>,
    next_ref: AtomicU64,
}

impl Shared {
    pub(crate) fn next_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub(crate) fn access_token(&self) -> Arc<str> {
        self.access_token.lock().clone()
    }
}

struct ClientInner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<SocketCommand>,
    _cancel: DropGuard,
}

/// Handle to the realtime socket.
///
/// Cheap to clone. The socket task stops when the cancellation token passed
/// to [`RealtimeClient::connect`] is cancelled or when the last handle (and
/// the last channel) is dropped.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("channels", &self.inner.shared.channels.lock().len())
            .finish()
    }
}

impl ApiClient {
    /// URL of the realtime websocket including the project key.
    pub fn realtime_url(&self) -> Result<Url, RealtimeError> {
        let mut url = Url::parse(&self.build_url(Protocol::Ws, ENDPOINT_REALTIME_WS))?;
        url.query_pairs_mut()
            .append_pair("apikey", self.anon_key())
            .append_pair("vsn", REALTIME_PROTOCOL_VERSION);
        Ok(url)
    }
}

impl RealtimeClient {
    /// Spawn the socket task for the project of `api`.
    ///
    /// Must be called from within a tokio runtime. The access token of `api`
    /// (or the anonymous key) authorizes channel joins until replaced with
    /// [`RealtimeClient::set_auth`].
    pub fn connect(
        api: &ApiClient,
        config: RealtimeConfig,
        cancel: CancellationToken,
    ) -> Result<Self, RealtimeError> {
        let url = api.realtime_url()?;
        let token = api.access_token().unwrap_or(api.anon_key());
        Ok(Self::connect_to(url, token, config, cancel))
    }

    pub(crate) fn connect_to(
        url: Url,
        access_token: &str,
        config: RealtimeConfig,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            channels: Mutex::new(HashMap::new()),
            access_token: Mutex::new(access_token.into()),
            next_ref: AtomicU64::new(0),
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let cancel_guard = cancel.clone().drop_guard();
        tokio::spawn(socket::run(
            url,
            shared.clone(),
            commands_rx,
            config,
            cancel,
        ));

        Self {
            inner: Arc::new(ClientInner {
                shared,
                commands: commands_tx,
                _cancel: cancel_guard,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    pub(crate) fn send_command(&self, command: SocketCommand) {
        if self.inner.commands.send(command).is_err() {
            debug!("realtime socket task is gone; dropping command");
        }
    }

    /// Join the channel `name`.
    ///
    /// An existing channel with the same name is replaced: its stream ends
    /// and the server is asked to leave it before the new join is sent.
    pub fn channel(&self, name: &str, config: ChannelConfig) -> RealtimeChannel {
        let topic = format!("{}{name}", message::TOPIC_PREFIX);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let replaced = self.shared().channels.lock().insert(
            topic.clone(),
            ChannelEntry {
                id,
                config,
                tx,
                join_ref: None,
                join_sent_at: None,
                joined: false,
                presence: None,
            },
        );
        if let Some(replaced) = replaced {
            info!(%topic, "replacing existing realtime channel");
            self.send_command(SocketCommand::Leave {
                topic: topic.clone(),
                join_ref: replaced.join_ref,
            });
        }
        self.send_command(SocketCommand::Join {
            topic: topic.clone(),
        });

        RealtimeChannel::new(topic, id, rx, self.clone())
    }

    /// Replace the token used to authorize channels, e.g. after a session
    /// refresh. Joined channels are updated in place.
    pub fn set_auth(&self, access_token: &str) {
        *self.shared().access_token.lock() = access_token.into();
        self.send_command(SocketCommand::AccessToken);
    }

    /// Leave every registered channel. Their streams end.
    pub fn leave_all(&self) {
        let removed: Vec<_> = self.shared().channels.lock().drain().collect();
        for (topic, entry) in removed {
            debug!(%topic, "leaving realtime channel");
            self.send_command(SocketCommand::Leave {
                topic,
                join_ref: entry.join_ref,
            });
        }
    }

    /// Topics currently registered with the socket.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.shared().channels.lock().keys().cloned().collect();
        topics.sort();
        topics
    }
}
