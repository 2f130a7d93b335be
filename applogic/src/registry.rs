// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Owned registry of realtime subscriptions.
//!
//! The registry holds the realtime transport and knows which topics currently
//! have a subscription. All channels of the app are created through it.

use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use anyhow::bail;
use ggvapiclient::realtime::{
    ChangeEvent, ChannelConfig, ChannelMessage, PostgresChangeFilter, RealtimeChannel,
    RealtimeClient,
};
use ggvcommon::{
    endpoint_paths::{
        TABLE_LOCATIONS, TABLE_MESSAGES, TABLE_NOTIFICATIONS, TABLE_PROFILE_LOCATIONS,
        TABLE_PUBLIC_CHAT,
    },
    identifiers::UserId,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    connection::{ChannelContext, ChannelSignal},
    presence::PresenceState,
};

/// Capacity of the event fan-out. Slow receivers miss the oldest events.
const EVENTS_CAPACITY: usize = 256;

/// A joined channel of a [`RealtimeTransport`].
pub trait TransportChannel: Stream<Item = ChannelMessage> + Send + Unpin + 'static {
    fn track(&self, meta: Value);
    fn untrack(&self);
}

/// Pub/sub transport the registry creates channels on.
pub trait RealtimeTransport: Send + Sync + 'static {
    type Channel: TransportChannel;

    /// Join `name`, replacing an existing channel with the same name.
    fn join(&self, name: &str, config: ChannelConfig) -> Self::Channel;

    /// Leave every channel.
    fn leave_all(&self);

    /// Authorize future and current channels with a new access token.
    fn set_auth(&self, access_token: &str);
}

impl TransportChannel for RealtimeChannel {
    fn track(&self, meta: Value) {
        RealtimeChannel::track(self, meta)
    }

    fn untrack(&self) {
        RealtimeChannel::untrack(self)
    }
}

impl RealtimeTransport for RealtimeClient {
    type Channel = RealtimeChannel;

    fn join(&self, name: &str, config: ChannelConfig) -> RealtimeChannel {
        self.channel(name, config)
    }

    fn leave_all(&self) {
        RealtimeClient::leave_all(self)
    }

    fn set_auth(&self, access_token: &str) {
        RealtimeClient::set_auth(self, access_token)
    }
}

/// Logical realtime topics of the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Community map updates and presence of residents.
    PublicBroadcast,
    PrivateMessages(UserId),
    Notifications(UserId),
    PublicChat,
}

impl Topic {
    /// All topics of a signed-in user, in aggregation order.
    pub fn for_user(user_id: UserId) -> [Topic; 4] {
        [
            Topic::PublicBroadcast,
            Topic::PrivateMessages(user_id),
            Topic::Notifications(user_id),
            Topic::PublicChat,
        ]
    }

    /// Channel name on the transport.
    pub fn name(&self) -> String {
        match self {
            Topic::PublicBroadcast => "public-broadcast".to_owned(),
            Topic::PrivateMessages(user_id) => format!("private-messages:{user_id}"),
            Topic::Notifications(user_id) => format!("notifications:{user_id}"),
            Topic::PublicChat => "public-chat".to_owned(),
        }
    }

    pub fn config(&self) -> ChannelConfig {
        let postgres_changes = match self {
            Topic::PublicBroadcast => vec![
                PostgresChangeFilter::table(TABLE_LOCATIONS),
                PostgresChangeFilter::table(TABLE_PROFILE_LOCATIONS),
            ],
            Topic::PrivateMessages(user_id) => vec![
                PostgresChangeFilter::table(TABLE_MESSAGES)
                    .event(ChangeEvent::Insert)
                    .filter(format!("receiver_id=eq.{user_id}")),
            ],
            Topic::Notifications(user_id) => vec![
                PostgresChangeFilter::table(TABLE_NOTIFICATIONS)
                    .filter(format!("user_id=eq.{user_id}")),
            ],
            Topic::PublicChat => vec![
                PostgresChangeFilter::table(TABLE_PUBLIC_CHAT)
                    .event(ChangeEvent::Insert),
            ],
        };
        ChannelConfig {
            postgres_changes,
            ..Default::default()
        }
    }

    fn has_presence(&self) -> bool {
        matches!(self, Topic::PublicBroadcast)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Event received on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicEvent {
    pub topic: Topic,
    pub message: ChannelMessage,
}

/// Registry of the app's realtime subscriptions.
///
/// Cheap to clone; all clones share the transport and the set of active
/// topics.
pub struct ChannelRegistry<T = RealtimeClient> {
    inner: Arc<RegistryInner<T>>,
}

struct RegistryInner<T> {
    transport: T,
    active: Mutex<HashMap<String, Uuid>>,
    events: broadcast::Sender<TopicEvent>,
    presence: PresenceState,
    closed: AtomicBool,
}

impl<T> Clone for ChannelRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for ChannelRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("active", &self.inner.active.lock().len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: RealtimeTransport> ChannelRegistry<T> {
    pub fn new(transport: T) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                active: Mutex::new(HashMap::new()),
                events,
                presence: PresenceState::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Presence of the members of [`Topic::PublicBroadcast`].
    pub fn presence(&self) -> &PresenceState {
        &self.inner.presence
    }

    /// Events of all topics.
    pub fn events(&self) -> broadcast::Receiver<TopicEvent> {
        self.inner.events.subscribe()
    }

    /// Names of topics with a subscription, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.inner.active.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Subscribe to `topic`.
    ///
    /// An existing subscription of the same topic is removed first, so there
    /// is at most one subscription per topic.
    pub fn subscribe(&self, topic: Topic) -> anyhow::Result<Subscription<T>> {
        if self.is_closed() {
            bail!("channel registry is closed");
        }
        let name = topic.name();
        let id = Uuid::new_v4();
        if let Some(previous) = self.inner.active.lock().insert(name.clone(), id) {
            info!(%topic, %previous, "removing existing subscription");
        }
        let channel = self.inner.transport.join(&name, topic.config());
        debug!(%topic, %id, "subscribed");
        Ok(Subscription {
            topic,
            name,
            id,
            channel,
            registry: self.clone(),
        })
    }

    /// Context that subscribes to `topic` through this registry. Own presence
    /// is announced with `presence_meta` on topics that carry presence.
    pub fn context(&self, topic: Topic, presence_meta: Option<Value>) -> TopicContext<T> {
        TopicContext {
            topic,
            registry: self.clone(),
            presence_meta: presence_meta.filter(|_| topic.has_presence()),
        }
    }

    /// Authorize channels with a new access token.
    pub fn set_auth(&self, access_token: &str) {
        self.inner.transport.set_auth(access_token);
    }

    /// Leave all channels and refuse new subscriptions. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing channel registry");
        self.inner.active.lock().clear();
        self.inner.transport.leave_all();
        self.inner.presence.clear();
    }
}

/// Subscription of a topic. Dropping it leaves the channel.
pub struct Subscription<T: RealtimeTransport = RealtimeClient> {
    topic: Topic,
    name: String,
    id: Uuid,
    channel: T::Channel,
    registry: ChannelRegistry<T>,
}

impl<T: RealtimeTransport> Subscription<T> {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn track(&self, meta: Value) {
        self.channel.track(meta);
    }

    pub fn untrack(&self) {
        self.channel.untrack();
    }
}

impl<T: RealtimeTransport> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

impl<T: RealtimeTransport> Stream for Subscription<T> {
    type Item = ChannelSignal<ChannelMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.channel)
            .poll_next(cx)
            .map(|message| {
                message.map(|message| match message {
                    ChannelMessage::Status(status) => ChannelSignal::Status(status),
                    message => ChannelSignal::Event(message),
                })
            })
    }
}

impl<T: RealtimeTransport> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut active = self.registry.inner.active.lock();
        if active.get(&self.name) == Some(&self.id) {
            active.remove(&self.name);
            debug!(topic = %self.topic, id = %self.id, "unsubscribed");
        }
    }
}

/// [`ChannelContext`] of one topic.
pub struct TopicContext<T: RealtimeTransport = RealtimeClient> {
    topic: Topic,
    registry: ChannelRegistry<T>,
    presence_meta: Option<Value>,
}

impl<T: RealtimeTransport> TopicContext<T> {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

impl<T: RealtimeTransport> ChannelContext for TopicContext<T> {
    type Event = ChannelMessage;

    fn subscribe(
        &self,
    ) -> impl Future<
        Output = anyhow::Result<
            impl tokio_stream::Stream<Item = ChannelSignal<ChannelMessage>> + Send + 'static,
        >,
    > + Send {
        let subscription = self.registry.subscribe(self.topic);
        let presence_meta = self.presence_meta.clone();
        async move {
            let subscription = subscription?;
            if let Some(meta) = presence_meta {
                subscription.track(meta);
            }
            Ok(subscription)
        }
    }

    fn handle_event(&self, message: ChannelMessage) -> impl Future<Output = ()> + Send {
        match &message {
            ChannelMessage::PresenceState(snapshot) if self.topic.has_presence() => {
                self.registry.presence().sync(snapshot.clone());
            }
            ChannelMessage::PresenceDiff { joins, leaves } if self.topic.has_presence() => {
                self.registry
                    .presence()
                    .apply_diff(joins.clone(), leaves.clone());
            }
            _ => {}
        }
        // No receivers is fine
        let _ = self.registry.inner.events.send(TopicEvent {
            topic: self.topic,
            message,
        });
        std::future::ready(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::sync::mpsc;
    use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};

    use super::*;

    /// Transport with in-memory channels.
    #[derive(Clone, Default)]
    pub(crate) struct FakeTransport {
        inner: Arc<Mutex<FakeTransportState>>,
    }

    #[derive(Default)]
    struct FakeTransportState {
        joins: Vec<String>,
        channels: HashMap<String, mpsc::UnboundedSender<ChannelMessage>>,
        tracked: Vec<Value>,
        access_token: Option<String>,
    }

    pub(crate) struct FakeChannel {
        rx: UnboundedReceiverStream<ChannelMessage>,
        transport: FakeTransport,
    }

    impl Stream for FakeChannel {
        type Item = ChannelMessage;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.rx).poll_next(cx)
        }
    }

    impl TransportChannel for FakeChannel {
        fn track(&self, meta: Value) {
            self.transport.inner.lock().tracked.push(meta);
        }

        fn untrack(&self) {}
    }

    impl FakeTransport {
        pub(crate) fn joins(&self) -> Vec<String> {
            self.inner.lock().joins.clone()
        }

        /// Deliver `message` on the channel `name`.
        pub(crate) fn push(&self, name: &str, message: ChannelMessage) -> bool {
            match self.inner.lock().channels.get(name) {
                Some(tx) => tx.send(message).is_ok(),
                None => false,
            }
        }

        pub(crate) fn access_token(&self) -> Option<String> {
            self.inner.lock().access_token.clone()
        }

        /// Number of channels whose stream is still consumed.
        pub(crate) fn open_channels(&self) -> usize {
            self.inner
                .lock()
                .channels
                .values()
                .filter(|tx| !tx.is_closed())
                .count()
        }
    }

    impl RealtimeTransport for FakeTransport {
        type Channel = FakeChannel;

        fn join(&self, name: &str, _config: ChannelConfig) -> FakeChannel {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(ChannelMessage::Status(
                ggvapiclient::realtime::ChannelStatus::Subscribed,
            ));
            let mut state = self.inner.lock();
            state.joins.push(name.to_owned());
            // Replacing the sender ends the previous stream
            state.channels.insert(name.to_owned(), tx);
            FakeChannel {
                rx: UnboundedReceiverStream::new(rx),
                transport: self.clone(),
            }
        }

        fn leave_all(&self) {
            self.inner.lock().channels.clear();
        }

        fn set_auth(&self, access_token: &str) {
            self.inner.lock().access_token = Some(access_token.to_owned());
        }
    }

    #[test]
    fn topic_names_and_configs() {
        let user_id: UserId = "5b1c1f4e-2f2a-4c39-9e4a-0e7f3c9a1d11".parse().unwrap();
        let names: Vec<_> = Topic::for_user(user_id).iter().map(Topic::name).collect();
        assert_eq!(
            names,
            [
                "public-broadcast".to_owned(),
                format!("private-messages:{user_id}"),
                format!("notifications:{user_id}"),
                "public-chat".to_owned(),
            ]
        );
        let config = Topic::PrivateMessages(user_id).config();
        assert_eq!(config.postgres_changes.len(), 1);
        assert_eq!(
            config.postgres_changes[0],
            PostgresChangeFilter::table("messages")
                .event(ChangeEvent::Insert)
                .filter(format!("receiver_id=eq.{user_id}"))
        );
    }

    #[tokio::test]
    async fn one_subscription_per_topic() {
        let transport = FakeTransport::default();
        let registry = ChannelRegistry::new(transport.clone());

        let mut first = registry.subscribe(Topic::PublicChat).unwrap();
        let mut second = registry.subscribe(Topic::PublicChat).unwrap();
        assert_eq!(registry.active_topics(), ["public-chat"]);
        assert_eq!(transport.joins(), ["public-chat", "public-chat"]);

        // The replaced stream ends after its buffered status
        assert!(matches!(first.next().await, Some(ChannelSignal::Status(_))));
        assert_eq!(first.next().await, None);
        assert!(matches!(second.next().await, Some(ChannelSignal::Status(_))));

        // Dropping the replaced subscription keeps its successor registered
        drop(first);
        assert_eq!(registry.active_topics(), ["public-chat"]);
        drop(second);
        assert!(registry.active_topics().is_empty());
    }

    #[tokio::test]
    async fn context_tracks_presence_and_forwards_events() {
        let transport = FakeTransport::default();
        let registry = ChannelRegistry::new(transport.clone());
        let mut events = registry.events();
        let meta = serde_json::json!({ "user_id": "resident" });

        let broadcast = registry.context(Topic::PublicBroadcast, Some(meta.clone()));
        let chat = registry.context(Topic::PublicChat, Some(meta.clone()));
        let _broadcast_subscription = broadcast.subscribe().await.unwrap();
        let _chat_subscription = chat.subscribe().await.unwrap();
        assert_eq!(transport.inner.lock().tracked, [meta]);

        let mut snapshot = ggvapiclient::realtime::PresenceMap::new();
        snapshot.insert("resident".to_owned(), vec![serde_json::json!({})]);
        broadcast
            .handle_event(ChannelMessage::PresenceState(snapshot.clone()))
            .await;
        assert_eq!(registry.presence().online_keys(), ["resident"]);

        let event = events.recv().await.unwrap();
        assert_eq!(event.topic, Topic::PublicBroadcast);
        assert_eq!(event.message, ChannelMessage::PresenceState(snapshot));
    }

    #[tokio::test]
    async fn closed_registry_refuses_subscriptions() {
        let transport = FakeTransport::default();
        let registry = ChannelRegistry::new(transport.clone());
        let mut subscription = registry.subscribe(Topic::PublicBroadcast).unwrap();

        registry.close();
        registry.close();
        assert!(registry.is_closed());
        assert!(registry.active_topics().is_empty());
        assert!(registry.subscribe(Topic::PublicChat).is_err());

        assert!(matches!(
            subscription.next().await,
            Some(ChannelSignal::Status(_))
        ));
        assert_eq!(subscription.next().await, None);
    }

    #[test]
    fn set_auth_reaches_transport() {
        let transport = FakeTransport::default();
        let registry = ChannelRegistry::new(transport.clone());
        registry.set_auth("fresh");
        assert_eq!(transport.access_token().as_deref(), Some("fresh"));
    }
}
