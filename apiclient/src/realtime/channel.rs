// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{ChannelMessage, RealtimeClient, SocketCommand};

/// A joined realtime channel.
///
/// Yields [`ChannelMessage`]s until the channel is replaced by another
/// channel with the same name or the socket task stops. Dropping the channel
/// leaves it on the server.
pub struct RealtimeChannel {
    topic: String,
    id: Uuid,
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
    client: RealtimeClient,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

impl RealtimeChannel {
    pub(super) fn new(
        topic: String,
        id: Uuid,
        rx: mpsc::UnboundedReceiver<ChannelMessage>,
        client: RealtimeClient,
    ) -> Self {
        Self {
            topic,
            id,
            rx,
            client,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns `false` if the channel was replaced and the closure was not run.
    fn with_entry(&self, f: impl FnOnce(&mut super::ChannelEntry)) -> bool {
        let mut channels = self.client.shared().channels.lock();
        match channels.get_mut(&self.topic) {
            Some(entry) if entry.id == self.id => {
                f(entry);
                true
            }
            _ => false,
        }
    }

    /// Announce own presence on this channel. The presence is kept across
    /// reconnects until [`RealtimeChannel::untrack`] is called.
    pub fn track(&self, meta: Value) {
        if self.with_entry(|entry| entry.presence = Some(meta)) {
            self.client.send_command(SocketCommand::Track {
                topic: self.topic.clone(),
            });
        }
    }

    pub fn untrack(&self) {
        if self.with_entry(|entry| entry.presence = None) {
            self.client.send_command(SocketCommand::Untrack {
                topic: self.topic.clone(),
            });
        }
    }

    /// Send a broadcast message to the other members of the channel.
    ///
    /// Messages sent while the channel is not joined are dropped.
    pub fn send_broadcast(&self, event: impl Into<String>, payload: Value) {
        self.client.send_command(SocketCommand::Broadcast {
            topic: self.topic.clone(),
            event: event.into(),
            payload,
        });
    }
}

impl Stream for RealtimeChannel {
    type Item = ChannelMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        let removed = {
            let mut channels = self.client.shared().channels.lock();
            match channels.get(&self.topic) {
                Some(entry) if entry.id == self.id => channels.remove(&self.topic),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            debug!(topic = %self.topic, "leaving realtime channel");
            self.client.send_command(SocketCommand::Leave {
                topic: self.topic.clone(),
                join_ref: entry.join_ref,
            });
        }
    }
}
