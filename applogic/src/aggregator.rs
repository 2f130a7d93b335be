// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! All realtime channels of a signed-in user behind one handle.

use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::{StreamExt, StreamMap, wrappers::WatchStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::{
    connection::{ConnectionHandle, ConnectionOptions, ConnectionState, establish},
    recovery::ChannelGroup,
    registry::{ChannelRegistry, RealtimeTransport, Topic},
    visibility::Visibility,
};

/// Default spacing of the reconnect delays of consecutive channels.
pub const DEFAULT_JITTER_OFFSET: Duration = Duration::from_millis(250);

/// Number of connected channels out of all channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateStatus {
    pub connected: usize,
    pub total: usize,
}

impl AggregateStatus {
    pub fn all_connected(&self) -> bool {
        self.connected == self.total
    }
}

/// One recovering connection per topic.
#[derive(Debug)]
pub struct ChannelAggregator {
    channels: Vec<(Topic, ConnectionHandle)>,
    status: watch::Receiver<AggregateStatus>,
    cancel: CancellationToken,
    _drop_guard: DropGuard,
}

impl ChannelAggregator {
    /// Establish a connection for every topic.
    ///
    /// The `i`-th topic reconnects after `options.reconnect_delay + i *
    /// jitter_offset`, so channels do not resubscribe all at once.
    pub fn start<T: RealtimeTransport>(
        registry: &ChannelRegistry<T>,
        topics: impl IntoIterator<Item = Topic>,
        options: ConnectionOptions,
        jitter_offset: Duration,
        presence_meta: Option<Value>,
        visibility: watch::Receiver<Visibility>,
    ) -> Self {
        let channels: Vec<_> = topics
            .into_iter()
            .enumerate()
            .map(|(index, topic)| {
                let offset = jitter_offset.saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
                let options = ConnectionOptions {
                    reconnect_delay: options.reconnect_delay + offset,
                    ..options.clone()
                };
                let context = registry.context(topic, presence_meta.clone());
                let handle = establish(topic.name(), context, options, visibility.clone());
                (topic, handle)
            })
            .collect();
        info!(total = channels.len(), "channel aggregator started");

        let cancel = CancellationToken::new();
        let total = channels.len();
        let (status_tx, status_rx) = watch::channel(AggregateStatus {
            connected: 0,
            total,
        });
        let mut states = StreamMap::new();
        for (index, (_, handle)) in channels.iter().enumerate() {
            states.insert(index, WatchStream::new(handle.subscribe_state()));
        }
        tokio::spawn(track_status(states, status_tx, total, cancel.clone()));

        Self {
            channels,
            status: status_rx,
            _drop_guard: cancel.clone().drop_guard(),
            cancel,
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = (Topic, &ConnectionHandle)> {
        self.channels.iter().map(|(topic, handle)| (*topic, handle))
    }

    pub fn channel(&self, topic: Topic) -> Option<&ConnectionHandle> {
        self.channels
            .iter()
            .find(|(t, _)| *t == topic)
            .map(|(_, handle)| handle)
    }

    pub fn connected_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|(_, handle)| handle.state().is_connected())
            .count()
    }

    pub fn total(&self) -> usize {
        self.channels.len()
    }

    pub fn status(&self) -> AggregateStatus {
        AggregateStatus {
            connected: self.connected_count(),
            total: self.total(),
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AggregateStatus> {
        self.status.clone()
    }

    /// Reconnect every channel.
    pub async fn reconnect_all(&self) {
        info!(total = self.total(), "reconnecting all channels");
        join_all(self.channels.iter().map(|(_, handle)| handle.reconnect())).await;
    }

    /// Reconnect channels that are not connected; returns their number.
    pub async fn reconnect_disconnected(&self) -> usize {
        let unhealthy: Vec<_> = self
            .channels
            .iter()
            .filter(|(_, handle)| !handle.state().is_connected())
            .collect();
        if unhealthy.is_empty() {
            return 0;
        }
        info!(count = unhealthy.len(), "reconnecting disconnected channels");
        join_all(unhealthy.iter().map(|(topic, handle)| {
            debug!(%topic, state = %handle.state(), "reconnecting");
            handle.reconnect()
        }))
        .await;
        unhealthy.len()
    }

    pub async fn disconnect_all(&self) {
        join_all(self.channels.iter().map(|(_, handle)| handle.disconnect())).await;
    }

    /// Stop all connections. Idempotent.
    pub fn close(&self) {
        for (_, handle) in &self.channels {
            handle.close();
        }
        self.cancel.cancel();
    }
}

impl ChannelGroup for ChannelAggregator {
    async fn reconnect_all(&self) {
        ChannelAggregator::reconnect_all(self).await
    }

    async fn reconnect_disconnected(&self) -> usize {
        ChannelAggregator::reconnect_disconnected(self).await
    }

    fn connected_count(&self) -> usize {
        ChannelAggregator::connected_count(self)
    }

    fn total(&self) -> usize {
        ChannelAggregator::total(self)
    }

    fn disable_visibility_reconnects(&self) {
        debug!("visibility reconnects handed over to the coordinator");
        for (_, handle) in &self.channels {
            handle.set_reconnect_on_visibility(false);
        }
    }
}

async fn track_status(
    mut states: StreamMap<usize, WatchStream<ConnectionState>>,
    status: watch::Sender<AggregateStatus>,
    total: usize,
    cancel: CancellationToken,
) {
    let mut current = vec![ConnectionState::default(); total];
    loop {
        let (index, state) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = states.next() => match next {
                Some(next) => next,
                None => break,
            },
        };
        if let Some(slot) = current.get_mut(index) {
            *slot = state;
        }
        let connected = current.iter().filter(|s| s.is_connected()).count();
        status.send_if_modified(|status| {
            let changed = status.connected != connected;
            status.connected = connected;
            changed
        });
    }
    debug!("aggregate status tracking stopped");
}

#[cfg(test)]
mod tests {
    use ggvapiclient::realtime::{ChannelMessage, ChannelStatus};
    use ggvcommon::identifiers::UserId;

    use super::*;
    use crate::registry::tests::FakeTransport;

    fn start(transport: &FakeTransport) -> (ChannelAggregator, watch::Sender<Visibility>) {
        let registry = ChannelRegistry::new(transport.clone());
        let (visibility, visibility_rx) = watch::channel(Visibility::Visible);
        let aggregator = ChannelAggregator::start(
            &registry,
            Topic::for_user(UserId::random()),
            ConnectionOptions::default(),
            DEFAULT_JITTER_OFFSET,
            None,
            visibility_rx,
        );
        (aggregator, visibility)
    }

    async fn wait_for_connected(aggregator: &ChannelAggregator, connected: usize) {
        aggregator
            .subscribe_status()
            .wait_for(|status| status.connected == connected)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn counts_connected_channels() {
        let transport = FakeTransport::default();
        let (aggregator, _visibility) = start(&transport);
        assert_eq!(aggregator.total(), 4);
        wait_for_connected(&aggregator, 4).await;
        assert!(aggregator.status().all_connected());

        transport.push(
            "public-chat",
            ChannelMessage::Status(ChannelStatus::ChannelError),
        );
        wait_for_connected(&aggregator, 3).await;
        assert_eq!(aggregator.connected_count(), 3);
        assert_eq!(
            aggregator.channel(Topic::PublicChat).unwrap().state(),
            ConnectionState::Frozen
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_disconnected_skips_healthy_channels() {
        let transport = FakeTransport::default();
        let (aggregator, _visibility) = start(&transport);
        wait_for_connected(&aggregator, 4).await;
        assert_eq!(aggregator.reconnect_disconnected().await, 0);
        assert_eq!(transport.joins().len(), 4);

        transport.push(
            "public-broadcast",
            ChannelMessage::Status(ChannelStatus::TimedOut),
        );
        wait_for_connected(&aggregator, 3).await;
        assert_eq!(aggregator.reconnect_disconnected().await, 1);
        assert_eq!(transport.joins().len(), 5);
        assert_eq!(transport.joins()[4], "public-broadcast");
        wait_for_connected(&aggregator, 4).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_all_resubscribes_every_channel_once() {
        let transport = FakeTransport::default();
        let (aggregator, _visibility) = start(&transport);
        wait_for_connected(&aggregator, 4).await;

        aggregator.reconnect_all().await;
        let joins = transport.joins();
        assert_eq!(joins.len(), 8);
        let mut reconnected = joins[4..].to_vec();
        let mut initial = joins[..4].to_vec();
        reconnected.sort();
        initial.sort();
        assert_eq!(reconnected, initial);
        assert_eq!(transport.open_channels(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delays_are_spread() {
        let transport = FakeTransport::default();
        let (aggregator, visibility) = start(&transport);
        wait_for_connected(&aggregator, 4).await;

        aggregator.disconnect_all().await;
        assert_eq!(aggregator.connected_count(), 0);
        visibility.send_replace(Visibility::Hidden);
        tokio::time::sleep(Duration::from_millis(1)).await;
        visibility.send_replace(Visibility::Visible);

        // Channel `i` reconnects within [1000 + 250 i, 1200 + 250 i] ms
        let mut reconnected = Vec::new();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            reconnected.push(transport.joins().len() - 4);
        }
        assert_eq!(reconnected[18], 0); // 950 ms
        assert_eq!(reconnected[39], 4); // 2000 ms
        assert!(reconnected.windows(2).all(|w| w[0] <= w[1]));
        let joins = transport.joins();
        assert_eq!(joins[4], "public-broadcast");
        assert_eq!(joins[7], "public-chat");
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_everything() {
        let transport = FakeTransport::default();
        let (aggregator, _visibility) = start(&transport);
        wait_for_connected(&aggregator, 4).await;

        aggregator.close();
        aggregator.close();
        for (_, handle) in aggregator.channels() {
            handle
                .subscribe_state()
                .wait_for(|state| *state == ConnectionState::Disconnected)
                .await
                .unwrap();
        }
        assert_eq!(transport.open_channels(), 0);
    }
}
