// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{sync::Arc, time::Duration};

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use ggvcommon::REALTIME_SOCKET_TOPIC;
use serde_json::{Value, json};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{Instant, sleep},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, protocol::Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::{
    ChannelMessage, ChannelStatus, RealtimeConfig, Shared, SocketCommand,
    message::{
        EVENT_ACCESS_TOKEN, EVENT_BROADCAST, EVENT_CLOSE, EVENT_ERROR, EVENT_HEARTBEAT,
        EVENT_JOIN, EVENT_LEAVE, EVENT_PRESENCE, EVENT_REPLY, Frame, reply_is_ok,
    },
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Connection loop of the socket task.
///
/// Runs until cancelled or until all command senders are gone. Whenever the
/// websocket drops, the task reconnects after the retry interval and rejoins
/// all registered channels.
pub(super) async fn run(
    url: Url,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    config: RealtimeConfig,
    cancel: CancellationToken,
) {
    let connection_id = Uuid::new_v4();
    info!(%connection_id, "Spawning the realtime connection...");

    while !cancel.is_cancelled() {
        // Try to establish a connection
        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!(%connection_id, "Connected to realtime websocket");
                let reconnect = Connection::new(&shared, &config)
                    .handle(ws_stream, &mut commands, &cancel)
                    .await;
                shared.mark_disconnected();
                if !reconnect {
                    break;
                }
            }
            Err(error) => {
                error!(%connection_id, %error, "Error connecting to realtime websocket");
            }
        }
        info!(
            %connection_id,
            retry_in =? config.retry_interval,
            is_cancelled = cancel.is_cancelled(),
            "The websocket was closed, will reconnect...",
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(config.retry_interval) => {}
        }
    }

    info!(%connection_id, "Realtime websocket closed");
}

impl Shared {
    /// Forget all joins of the dropped connection and tell joined channels.
    fn mark_disconnected(&self) {
        let mut channels = self.channels.lock();
        for entry in channels.values_mut() {
            let was_pending = entry.join_ref.is_some();
            entry.join_ref = None;
            entry.join_sent_at = None;
            if entry.joined || was_pending {
                entry.notify(ChannelMessage::Status(ChannelStatus::ChannelError));
            }
            entry.joined = false;
        }
    }

    /// Build the join frame for `topic` unless it was already sent on this
    /// connection.
    fn join_frame(&self, topic: &str) -> Option<Frame> {
        let access_token = self.access_token();
        let reference = self.next_ref();
        let mut channels = self.channels.lock();
        let entry = channels.get_mut(topic)?;
        if entry.join_ref.is_some() {
            return None;
        }
        entry.join_ref = Some(reference.clone());
        entry.join_sent_at = Some(Instant::now());
        let payload = entry.config.join_payload(&access_token);
        Some(Frame::new(topic, EVENT_JOIN, payload, reference.clone()).with_join_ref(Some(reference)))
    }

    fn join_frames(&self) -> Vec<Frame> {
        let topics: Vec<String> = self.channels.lock().keys().cloned().collect();
        topics
            .iter()
            .filter_map(|topic| self.join_frame(topic))
            .collect()
    }

    /// Frame pushing an event to a joined channel.
    fn push_frame(&self, topic: &str, event: &str, payload: Value) -> Option<Frame> {
        let reference = self.next_ref();
        let channels = self.channels.lock();
        let entry = channels.get(topic).filter(|entry| entry.joined)?;
        Some(Frame::new(topic, event, payload, reference).with_join_ref(entry.join_ref.clone()))
    }

    fn track_frame(&self, topic: &str) -> Option<Frame> {
        let meta = self.channels.lock().get(topic)?.presence.clone()?;
        self.push_frame(
            topic,
            EVENT_PRESENCE,
            json!({ "type": "presence", "event": "track", "payload": meta }),
        )
    }

    fn access_token_frames(&self) -> Vec<Frame> {
        let access_token = self.access_token();
        let topics: Vec<String> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, entry)| entry.joined)
            .map(|(topic, _)| topic.clone())
            .collect();
        topics
            .iter()
            .filter_map(|topic| {
                self.push_frame(
                    topic,
                    EVENT_ACCESS_TOKEN,
                    json!({ "access_token": &*access_token }),
                )
            })
            .collect()
    }

    /// Channels whose join was not acknowledged in time.
    fn expire_joins(&self, join_timeout: Duration) {
        let now = Instant::now();
        let mut channels = self.channels.lock();
        for (topic, entry) in channels.iter_mut() {
            let Some(sent_at) = entry.join_sent_at else {
                continue;
            };
            if !entry.joined && now.duration_since(sent_at) > join_timeout {
                warn!(%topic, "realtime join timed out");
                entry.join_sent_at = None;
                entry.notify(ChannelMessage::Status(ChannelStatus::TimedOut));
            }
        }
    }

    /// Route an incoming frame. Returns frames to send in response.
    fn dispatch(&self, frame: Frame) -> Vec<Frame> {
        if frame.topic == REALTIME_SOCKET_TOPIC {
            trace!(event = %frame.event, "socket frame");
            return Vec::new();
        }

        let mut channels = self.channels.lock();
        let Some(entry) = channels.get_mut(&frame.topic) else {
            debug!(topic = %frame.topic, event = %frame.event, "frame for unknown channel");
            return Vec::new();
        };
        // Frames of an earlier join of the same topic
        if frame.join_ref.is_some() && frame.join_ref != entry.join_ref {
            debug!(
                topic = %frame.topic,
                event = %frame.event,
                join_ref = ?frame.join_ref,
                "dropping outdated frame"
            );
            return Vec::new();
        }

        match frame.event.as_str() {
            EVENT_REPLY => {
                let is_join_reply =
                    frame.reference.is_some() && frame.reference == entry.join_ref;
                if !is_join_reply {
                    return Vec::new();
                }
                entry.join_sent_at = None;
                if reply_is_ok(&frame.payload) {
                    info!(topic = %frame.topic, "realtime channel subscribed");
                    entry.joined = true;
                    entry.notify(ChannelMessage::Status(ChannelStatus::Subscribed));
                    let has_presence = entry.presence.is_some();
                    drop(channels);
                    if has_presence {
                        return self.track_frame(&frame.topic).into_iter().collect();
                    }
                } else {
                    warn!(topic = %frame.topic, payload = %frame.payload, "realtime join rejected");
                    entry.notify(ChannelMessage::Status(ChannelStatus::ChannelError));
                }
            }
            EVENT_ERROR => {
                warn!(topic = %frame.topic, "realtime channel errored");
                entry.joined = false;
                entry.join_ref = None;
                entry.notify(ChannelMessage::Status(ChannelStatus::ChannelError));
            }
            EVENT_CLOSE => {
                info!(topic = %frame.topic, "realtime channel closed by server");
                entry.joined = false;
                entry.join_ref = None;
                entry.notify(ChannelMessage::Status(ChannelStatus::Closed));
            }
            _ => match ChannelMessage::from_frame(&frame) {
                Some(message) => entry.notify(message),
                None => trace!(topic = %frame.topic, event = %frame.event, "ignoring frame"),
            },
        }
        Vec::new()
    }
}

/// A single established websocket connection.
struct Connection<'a> {
    shared: &'a Shared,
    config: &'a RealtimeConfig,
}

impl<'a> Connection<'a> {
    fn new(shared: &'a Shared, config: &'a RealtimeConfig) -> Self {
        Self { shared, config }
    }

    /// Handle an established websocket connection.
    ///
    /// Returns `true` if the connection should be re-established, otherwise `false`.
    async fn handle(
        self,
        ws_stream: WsStream,
        commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
        cancel: &CancellationToken,
    ) -> bool {
        let (mut sink, mut stream): (WsSink, SplitStream<WsStream>) = ws_stream.split();

        // (Re)join everything registered so far
        if send_frames(&mut sink, self.shared.join_frames()).await.is_err() {
            return true;
        }

        let mut last_frame = Instant::now();
        let mut last_heartbeat = Instant::now();

        // Watchdog to monitor the connection.
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            let outgoing = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Realtime connection cancelled");
                    let _ = sink.close().await;
                    return false;
                },
                _ = interval.tick() => {
                    let now = Instant::now();
                    if now.duration_since(last_frame) > self.config.timeout {
                        warn!(timeout =? self.config.timeout, "Realtime connection timed out");
                        let _ = sink.close().await;
                        return true;
                    }
                    self.shared.expire_joins(self.config.join_timeout);
                    if now.duration_since(last_heartbeat) >= self.config.heartbeat_interval {
                        last_heartbeat = now;
                        vec![Frame::new(
                            REALTIME_SOCKET_TOPIC,
                            EVENT_HEARTBEAT,
                            json!({}),
                            self.shared.next_ref(),
                        )]
                    } else {
                        Vec::new()
                    }
                },
                command = commands.recv() => {
                    let Some(command) = command else {
                        // All client handles are gone
                        let _ = sink.close().await;
                        return false;
                    };
                    self.command_frames(command)
                },
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            last_frame = Instant::now();
                            match serde_json::from_str::<Frame>(text.as_str()) {
                                Ok(frame) => self.shared.dispatch(frame),
                                Err(error) => {
                                    warn!(%error, "Malformed realtime frame");
                                    Vec::new()
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            last_frame = Instant::now();
                            Vec::new()
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Realtime websocket closed by server");
                            return true;
                        }
                        Some(Ok(_)) => Vec::new(),
                        Some(Err(error)) => {
                            warn!(%error, "Realtime websocket error");
                            return true;
                        }
                        // It seems the connection is closed
                        None => return true,
                    }
                },
            };

            if let Err(error) = send_frames(&mut sink, outgoing).await {
                warn!(%error, "Failed to send on realtime websocket");
                return true;
            }
        }
    }

    fn command_frames(&self, command: SocketCommand) -> Vec<Frame> {
        match command {
            SocketCommand::Join { topic } => self.shared.join_frame(&topic).into_iter().collect(),
            SocketCommand::Leave { topic, join_ref } => match join_ref {
                Some(join_ref) => vec![
                    Frame::new(topic, EVENT_LEAVE, json!({}), self.shared.next_ref())
                        .with_join_ref(Some(join_ref)),
                ],
                None => Vec::new(),
            },
            SocketCommand::Track { topic } => self.shared.track_frame(&topic).into_iter().collect(),
            SocketCommand::Untrack { topic } => self
                .shared
                .push_frame(
                    &topic,
                    EVENT_PRESENCE,
                    json!({ "type": "presence", "event": "untrack" }),
                )
                .into_iter()
                .collect(),
            SocketCommand::Broadcast {
                topic,
                event,
                payload,
            } => {
                let frame = self.shared.push_frame(
                    &topic,
                    EVENT_BROADCAST,
                    json!({ "type": "broadcast", "event": event, "payload": payload }),
                );
                if frame.is_none() {
                    debug!(%topic, "dropping broadcast for channel that is not joined");
                }
                frame.into_iter().collect()
            }
            SocketCommand::AccessToken => self.shared.access_token_frames(),
        }
    }
}

async fn send_frames(sink: &mut WsSink, frames: Vec<Frame>) -> Result<(), tungstenite::Error> {
    for frame in frames {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(error) => {
                error!(%error, "Failed to serialize realtime frame");
                continue;
            }
        };
        sink.send(Message::text(text)).await?;
    }
    Ok(())
}
