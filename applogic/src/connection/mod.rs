// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Realtime subscriptions that recover after the app was hidden.
//!
//! A connection is owned by a single task. The task holds at most one
//! subscription, created through a [`ChannelContext`], and recreates it when
//! the app becomes visible again while the subscription looks dead. All
//! requests from a [`ConnectionHandle`] are processed in order by the owner
//! task, so two subscriptions for the same channel never coexist.

use std::{
    fmt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ggvapiclient::realtime::ChannelStatus;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

use crate::{util::jitter, visibility::Visibility};

pub use state::ConnectionState;
use state::Liveness;

mod state;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(30);
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_JITTER: Duration = Duration::from_millis(200);

/// Signal produced by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal<E> {
    Status(ChannelStatus),
    Event(E),
}

/// Creates subscriptions for one logical channel and handles their events.
pub trait ChannelContext: Send + Sync + 'static {
    type Event: fmt::Debug + Send + 'static;

    /// Create a new subscription
    ///
    /// Dropping the returned stream tears the subscription down.
    fn subscribe(
        &self,
    ) -> impl Future<
        Output = anyhow::Result<impl Stream<Item = ChannelSignal<Self::Event>> + Send + 'static>,
    > + Send;

    /// Handle an inbound event
    fn handle_event(&self, event: Self::Event) -> impl Future<Output = ()> + Send;
}

pub type ConnectionCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ConnectionOptions {
    /// Recreate an unhealthy subscription when the app becomes visible.
    pub reconnect_on_visibility: bool,
    pub reconnect_delay: Duration,
    /// A subscription without a sign of life for longer than this is frozen.
    pub staleness_threshold: Duration,
    pub liveness_interval: Duration,
    /// Upper bound of the random delay added to `reconnect_delay`.
    pub jitter: Duration,
    /// Called with the channel name after a reconnect produced a subscription.
    pub on_reconnect: Option<ConnectionCallback>,
    /// Called with the channel name after a subscription was torn down by
    /// [`ConnectionHandle::disconnect`] or lost.
    pub on_disconnect: Option<ConnectionCallback>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect_on_visibility: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            jitter: DEFAULT_JITTER,
            on_reconnect: None,
            on_disconnect: None,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("reconnect_on_visibility", &self.reconnect_on_visibility)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("staleness_threshold", &self.staleness_threshold)
            .field("liveness_interval", &self.liveness_interval)
            .field("jitter", &self.jitter)
            .field("on_reconnect", &self.on_reconnect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

impl ConnectionOptions {
    pub fn on_reconnect(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_reconnect = Some(Arc::new(callback));
        self
    }

    pub fn on_disconnect(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }
}

/// Handle to a connection owned by a background task.
///
/// The task stops when [`ConnectionHandle::close`] is called or the last
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    name: Arc<str>,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    visibility_reconnects: Arc<AtomicBool>,
    cancel: CancellationToken,
    _drop_guard: Arc<DropGuard>,
}

#[derive(Debug)]
enum Command {
    Reconnect(oneshot::Sender<ConnectionState>),
    Disconnect(oneshot::Sender<()>),
}

/// Start managing the subscription of the channel `name`.
///
/// The first subscription is created right away. Must be called inside a
/// tokio runtime.
pub fn establish<C: ChannelContext>(
    name: impl Into<String>,
    context: C,
    options: ConnectionOptions,
    visibility: watch::Receiver<Visibility>,
) -> ConnectionHandle {
    let name: Arc<str> = name.into().into();
    let cancel = CancellationToken::new();
    let (commands_tx, commands_rx) = mpsc::channel(8);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let visible = visibility.borrow().is_visible();
    let visibility_reconnects = Arc::new(AtomicBool::new(options.reconnect_on_visibility));
    let task = ConnectionTask {
        visibility_reconnects: visibility_reconnects.clone(),
        name: name.clone(),
        context,
        options,
        state: state_tx,
        subscription: None,
        liveness: Liveness::new(),
        visibility,
        visible,
        pending_reconnect: None,
        cancel: cancel.clone(),
    };
    tokio::spawn(task.run(commands_rx));

    ConnectionHandle {
        name,
        commands: commands_tx,
        state: state_rx,
        visibility_reconnects,
        _drop_guard: Arc::new(cancel.clone().drop_guard()),
        cancel,
    }
}

impl ConnectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Tear down the current subscription and create a new one.
    ///
    /// Returns the state right after the attempt. A pending visibility
    /// reconnect is dropped.
    pub async fn reconnect(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Reconnect(tx)).await.is_err() {
            return self.state();
        }
        rx.await.unwrap_or_else(|_| self.state())
    }

    /// Tear down the current subscription without creating a new one.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the owner task. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Enable or disable reconnects on visibility changes.
    ///
    /// Disabling also drops a pending visibility reconnect once its timer
    /// fires.
    pub fn set_reconnect_on_visibility(&self, enabled: bool) {
        self.visibility_reconnects.store(enabled, Ordering::Release);
    }

    pub fn reconnects_on_visibility(&self) -> bool {
        self.visibility_reconnects.load(Ordering::Acquire)
    }
}

type SignalStream<E> = Pin<Box<dyn Stream<Item = ChannelSignal<E>> + Send>>;

struct ConnectionTask<C: ChannelContext> {
    name: Arc<str>,
    context: C,
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    subscription: Option<SignalStream<C::Event>>,
    liveness: Liveness,
    visibility: watch::Receiver<Visibility>,
    visible: bool,
    pending_reconnect: Option<Instant>,
    visibility_reconnects: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl<C: ChannelContext> ConnectionTask<C> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(name = %self.name, "connection task started");
        self.connect(false).await;

        let period = self.options.liveness_interval;
        let mut liveness_tick = time::interval_at(Instant::now() + period, period);
        liveness_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut visibility_open = true;

        loop {
            let pending = self.pending_reconnect;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                changed = self.visibility.changed(), if visibility_open => {
                    if changed.is_err() {
                        visibility_open = false;
                        continue;
                    }
                    let visible = self.visibility.borrow_and_update().is_visible();
                    self.on_visibility(visible);
                }
                _ = liveness_tick.tick() => self.on_liveness_tick(),
                signal = next_signal(&mut self.subscription) => self.on_signal(signal).await,
                _ = time::sleep_until(pending.unwrap_or_else(Instant::now)), if pending.is_some() => {
                    self.pending_reconnect = None;
                    if self.visibility_reconnects.load(Ordering::Acquire) {
                        self.connect(true).await;
                    } else {
                        debug!(name = %self.name, "visibility reconnects disabled, dropping reconnect");
                    }
                }
            }
        }

        self.teardown();
        self.set_state(ConnectionState::Disconnected);
        info!(name = %self.name, "connection task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reconnect(tx) => {
                self.cancel_pending("manual reconnect");
                self.connect(true).await;
                let _ = tx.send(*self.state.borrow());
            }
            Command::Disconnect(tx) => {
                self.cancel_pending("disconnect");
                if self.teardown() {
                    self.notify_disconnect();
                }
                self.set_state(ConnectionState::Disconnected);
                let _ = tx.send(());
            }
        }
    }

    /// Replace the current subscription with a new one.
    async fn connect(&mut self, is_reconnect: bool) {
        self.teardown();
        self.set_state(ConnectionState::Connecting);

        let res = tokio::select! {
            res = self.context.subscribe() => res,
            _ = self.cancel.cancelled() => return,
        };
        match res {
            Ok(stream) => {
                self.subscription = Some(Box::pin(stream));
                self.liveness.touch();
                info!(name = %self.name, is_reconnect, "subscription created");
                if is_reconnect {
                    if let Some(callback) = &self.options.on_reconnect {
                        callback(&self.name);
                    }
                }
            }
            Err(error) => {
                error!(name = %self.name, %error, "failed to create subscription");
                self.set_state(ConnectionState::Frozen);
            }
        }
    }

    /// Drop the current subscription; returns whether there was one.
    fn teardown(&mut self) -> bool {
        let had_subscription = self.subscription.take().is_some();
        if had_subscription {
            debug!(name = %self.name, "subscription removed");
        }
        had_subscription
    }

    fn on_visibility(&mut self, visible: bool) {
        if visible == self.visible {
            return;
        }
        self.visible = visible;
        if !visible {
            self.cancel_pending("hidden");
            return;
        }
        if !self.visibility_reconnects.load(Ordering::Acquire) {
            return;
        }

        let state = *self.state.borrow();
        let stale = self.liveness.is_stale(self.options.staleness_threshold);
        if state.is_connected() && !stale {
            self.liveness.touch();
            return;
        }
        let delay = self.options.reconnect_delay + jitter(self.options.jitter);
        info!(
            name = %self.name,
            %state,
            last_seen_ago = ?self.liveness.elapsed(),
            ?delay,
            "visible with unhealthy connection, scheduling reconnect"
        );
        self.pending_reconnect = Some(Instant::now() + delay);
    }

    fn on_liveness_tick(&mut self) {
        let state = *self.state.borrow();
        if !state.is_connected() {
            return;
        }
        if self.visible {
            self.liveness.touch();
        } else if self.liveness.is_stale(self.options.staleness_threshold) {
            debug!(name = %self.name, "no liveness while hidden");
            self.set_state(ConnectionState::Frozen);
        }
    }

    async fn on_signal(&mut self, signal: Option<ChannelSignal<C::Event>>) {
        match signal {
            Some(ChannelSignal::Status(status)) => {
                debug!(name = %self.name, ?status, "subscription status");
                match status {
                    ChannelStatus::Subscribed => {
                        self.liveness.touch();
                        self.set_state(ConnectionState::Connected);
                    }
                    ChannelStatus::ChannelError | ChannelStatus::TimedOut => {
                        self.set_state(ConnectionState::Frozen);
                    }
                    ChannelStatus::Closed => self.on_lost(),
                }
            }
            Some(ChannelSignal::Event(event)) => {
                self.liveness.touch();
                self.context.handle_event(event).await;
            }
            None => self.on_lost(),
        }
    }

    fn on_lost(&mut self) {
        info!(name = %self.name, "subscription lost");
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
        self.notify_disconnect();
    }

    fn cancel_pending(&mut self, reason: &str) {
        if self.pending_reconnect.take().is_some() {
            debug!(name = %self.name, reason, "pending reconnect cancelled");
        }
    }

    fn notify_disconnect(&self) {
        if let Some(callback) = &self.options.on_disconnect {
            callback(&self.name);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(name = %self.name, %state, "connection state changed");
        }
    }
}

async fn next_signal<E>(subscription: &mut Option<SignalStream<E>>) -> Option<ChannelSignal<E>> {
    match subscription {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
