// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Recovery of the session and all channels after the app was hidden.
//!
//! Hosts suspend hidden apps: sockets die silently and access tokens expire
//! while timers do not run. When the app becomes visible again, the
//! coordinator waits a short delay and then
//!
//! - after a long hide, probes the session (refreshing it if the probe fails
//!   or is slow) and reconnects every channel,
//! - after a short hide, reconnects only channels that are not connected.
//!
//! ```text
//! Idle --visible--> Scheduled --timer--> Recovering --done--> Idle
//!                    |  ^    |
//!                    +--+    +--hidden--> Idle
//!                  visible
//! ```

use std::{fmt, pin::Pin, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{self, Instant},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::{
    util::jitter,
    visibility::{DisplayMode, VisibilityEvent},
};

pub use delay::{
    BROWSER_DELAY, BURST_DELAY, BURST_THRESHOLD, DelayPolicy, QUIET_GAP, RECOVERY_JITTER,
    STANDALONE_DELAY,
};
use delay::ToggleTracker;

mod delay;

pub const LONG_HIDE_THRESHOLD: Duration = Duration::from_secs(30);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const SLOW_PROBE_THRESHOLD: Duration = Duration::from_secs(2);

/// Checks and refreshes the authenticated session.
pub trait SessionProbe: Send + Sync + 'static {
    /// Authenticated round trip to the backend.
    fn check(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Obtain a new access token.
    fn refresh(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Channels that are recovered together.
pub trait ChannelGroup: Send + Sync + 'static {
    fn reconnect_all(&self) -> impl Future<Output = ()> + Send;

    /// Reconnect channels that are not connected; returns their number.
    fn reconnect_disconnected(&self) -> impl Future<Output = usize> + Send;

    fn connected_count(&self) -> usize;

    fn total(&self) -> usize;

    /// Stop channels from reconnecting on visibility changes by themselves.
    ///
    /// Called when a coordinator takes over, so that one visibility edge
    /// reconnects each channel at most once.
    fn disable_visibility_reconnects(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOptions {
    pub display_mode: DisplayMode,
    /// Hides at least this long trigger a full recovery.
    pub long_hide_threshold: Duration,
    pub probe_timeout: Duration,
    /// Probes slower than this trigger a session refresh.
    pub slow_probe_threshold: Duration,
    pub delay: DelayPolicy,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            display_mode: DisplayMode::default(),
            long_hide_threshold: LONG_HIDE_THRESHOLD,
            probe_timeout: PROBE_TIMEOUT,
            slow_probe_threshold: SLOW_PROBE_THRESHOLD,
            delay: DelayPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryState {
    #[default]
    Idle,
    /// A recovery starts after `delay`.
    Scheduled { delay: Duration },
    Recovering,
}

/// What a recovery pass does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryKind {
    /// Reconnect channels that are not connected.
    Partial,
    /// Probe the session and reconnect every channel.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy(Duration),
    Slow(Duration),
    Failed,
    TimedOut,
}

impl ProbeOutcome {
    fn needs_refresh(&self) -> bool {
        !matches!(self, Self::Healthy(_))
    }
}

/// Result of a recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub kind: RecoveryKind,
    pub probe: Option<ProbeOutcome>,
    /// Whether a session refresh succeeded, if one was attempted.
    pub refreshed: Option<bool>,
    /// Number of channels that were reconnected.
    pub reconnected: usize,
}

/// Handle to a running [`TabRecoveryCoordinator`].
#[derive(Debug, Clone)]
pub struct RecoveryHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<RecoveryState>,
    last_report: watch::Receiver<Option<RecoveryReport>>,
    cancel: CancellationToken,
    _drop_guard: Arc<DropGuard>,
}

#[derive(Debug)]
enum Command {
    ForceRecovery(oneshot::Sender<bool>),
}

impl RecoveryHandle {
    pub fn state(&self) -> RecoveryState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RecoveryState> {
        self.state.clone()
    }

    pub fn is_recovering(&self) -> bool {
        self.state() == RecoveryState::Recovering
    }

    pub fn last_report(&self) -> Option<RecoveryReport> {
        *self.last_report.borrow()
    }

    pub fn subscribe_reports(&self) -> watch::Receiver<Option<RecoveryReport>> {
        self.last_report.clone()
    }

    /// Run a full recovery now.
    ///
    /// Returns `false` without doing anything if a recovery is already
    /// running, otherwise waits for the recovery to finish.
    pub async fn force_recovery(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ForceRecovery(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stop the coordinator. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Recovers the session and the channels of a [`ChannelGroup`] on visibility
/// changes.
pub struct TabRecoveryCoordinator<S, G> {
    probe: Arc<S>,
    group: Arc<G>,
    options: RecoveryOptions,
}

impl<S, G> fmt::Debug for TabRecoveryCoordinator<S, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabRecoveryCoordinator")
            .field("options", &self.options)
            .finish()
    }
}

type RecoveryPass = Pin<Box<dyn Future<Output = RecoveryReport> + Send>>;

struct Scheduled {
    at: Instant,
    kind: RecoveryKind,
}

impl<S: SessionProbe, G: ChannelGroup> TabRecoveryCoordinator<S, G> {
    pub fn new(probe: Arc<S>, group: Arc<G>, options: RecoveryOptions) -> Self {
        Self {
            probe,
            group,
            options,
        }
    }

    /// Start reacting to visibility transitions, e.g. from
    /// [`VisibilityPublisher::edges`](crate::visibility::VisibilityPublisher::edges).
    pub fn spawn(self, edges: broadcast::Receiver<VisibilityEvent>) -> RecoveryHandle {
        self.group.disable_visibility_reconnects();
        let cancel = CancellationToken::new();

        let (commands_tx, commands_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(RecoveryState::Idle);
        let (report_tx, report_rx) = watch::channel(None);
        let task = CoordinatorTask {
            toggles: ToggleTracker::new(self.options.delay.quiet_gap),
            coordinator: self,
            state: state_tx,
            report: report_tx,
            scheduled: None,
            running: None,
        };
        tokio::spawn(task.run(edges, commands_rx, cancel.clone()));

        RecoveryHandle {
            commands: commands_tx,
            state: state_rx,
            last_report: report_rx,
            _drop_guard: Arc::new(cancel.clone().drop_guard()),
            cancel,
        }
    }

    fn pass(&self, kind: RecoveryKind) -> RecoveryPass {
        let probe = self.probe.clone();
        let group = self.group.clone();
        let options = self.options.clone();
        Box::pin(async move {
            match kind {
                RecoveryKind::Full => full_recovery(&*probe, &*group, &options).await,
                RecoveryKind::Partial => partial_recovery(&*group).await,
            }
        })
    }
}

struct CoordinatorTask<S, G> {
    coordinator: TabRecoveryCoordinator<S, G>,
    state: watch::Sender<RecoveryState>,
    report: watch::Sender<Option<RecoveryReport>>,
    toggles: ToggleTracker,
    scheduled: Option<Scheduled>,
    running: Option<(RecoveryPass, Option<oneshot::Sender<bool>>)>,
}

impl<S: SessionProbe, G: ChannelGroup> CoordinatorTask<S, G> {
    async fn run(
        mut self,
        mut edges: broadcast::Receiver<VisibilityEvent>,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) {
        loop {
            let timer = match (&self.scheduled, &self.running) {
                (Some(scheduled), None) => Some(scheduled.at),
                _ => None,
            };
            let has_timer = timer.is_some();
            let is_running = self.running.is_some();

            tokio::select! {
                _ = cancel.cancelled() => break,
                event = edges.recv() => match event {
                    Ok(event) => self.on_visibility(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "visibility transitions lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                command = commands.recv() => match command {
                    Some(Command::ForceRecovery(tx)) => self.force(tx),
                    None => break,
                },
                _ = time::sleep_until(timer.unwrap_or_else(Instant::now)), if has_timer => {
                    if let Some(scheduled) = self.scheduled.take() {
                        self.start(scheduled.kind, None);
                    }
                }
                report = poll_running(&mut self.running), if is_running => {
                    self.finish(report);
                }
            }
        }
        info!("tab recovery coordinator stopped");
    }

    fn on_visibility(&mut self, event: VisibilityEvent) {
        match event {
            VisibilityEvent::Hidden => {
                if self.scheduled.take().is_some() {
                    debug!("hidden again, scheduled recovery cancelled");
                    if self.running.is_none() {
                        self.set_state(RecoveryState::Idle);
                    }
                }
            }
            VisibilityEvent::Visible { hidden_for } => {
                let options = &self.coordinator.options;
                let now = Instant::now();
                let toggles = self.toggles.record(now);
                let mut kind = if hidden_for >= options.long_hide_threshold {
                    RecoveryKind::Full
                } else {
                    RecoveryKind::Partial
                };
                if let Some(previous) = self.scheduled.take() {
                    kind = kind.max(previous.kind);
                }
                let delay = options.delay.base_delay(options.display_mode, toggles)
                    + jitter(options.delay.jitter);
                info!(?hidden_for, toggles, ?kind, ?delay, "visible, scheduling recovery");
                self.scheduled = Some(Scheduled {
                    at: now + delay,
                    kind,
                });
                if self.running.is_none() {
                    self.set_state(RecoveryState::Scheduled { delay });
                }
            }
        }
    }

    fn force(&mut self, tx: oneshot::Sender<bool>) {
        if self.running.is_some() {
            debug!("recovery already running, ignoring forced recovery");
            let _ = tx.send(false);
            return;
        }
        if self.scheduled.take().is_some() {
            debug!("forced recovery replaces scheduled recovery");
        }
        self.start(RecoveryKind::Full, Some(tx));
    }

    fn start(&mut self, kind: RecoveryKind, done: Option<oneshot::Sender<bool>>) {
        info!(?kind, forced = done.is_some(), "recovery started");
        self.running = Some((self.coordinator.pass(kind), done));
        self.set_state(RecoveryState::Recovering);
    }

    fn finish(&mut self, report: RecoveryReport) {
        info!(?report, "recovery finished");
        if let Some((_, Some(done))) = self.running.take() {
            let _ = done.send(true);
        }
        self.report.send_replace(Some(report));
        let next = match &self.scheduled {
            Some(scheduled) => RecoveryState::Scheduled {
                delay: scheduled.at.saturating_duration_since(Instant::now()),
            },
            None => RecoveryState::Idle,
        };
        self.set_state(next);
    }

    fn set_state(&self, state: RecoveryState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

async fn poll_running(
    running: &mut Option<(RecoveryPass, Option<oneshot::Sender<bool>>)>,
) -> RecoveryReport {
    match running {
        Some((pass, _)) => pass.await,
        None => std::future::pending().await,
    }
}

async fn full_recovery<S: SessionProbe, G: ChannelGroup>(
    probe: &S,
    group: &G,
    options: &RecoveryOptions,
) -> RecoveryReport {
    let started_at = Instant::now();
    let outcome = match time::timeout(options.probe_timeout, probe.check()).await {
        Ok(Ok(())) => {
            let elapsed = started_at.elapsed();
            if elapsed >= options.slow_probe_threshold {
                ProbeOutcome::Slow(elapsed)
            } else {
                ProbeOutcome::Healthy(elapsed)
            }
        }
        Ok(Err(error)) => {
            warn!(%error, "session probe failed");
            ProbeOutcome::Failed
        }
        Err(_) => {
            warn!(timeout = ?options.probe_timeout, "session probe timed out");
            ProbeOutcome::TimedOut
        }
    };
    debug!(?outcome, "session probed");

    let refreshed = if outcome.needs_refresh() {
        match probe.refresh().await {
            Ok(()) => Some(true),
            Err(error) => {
                error!(%error, "session refresh failed, reconnecting anyway");
                Some(false)
            }
        }
    } else {
        None
    };

    group.reconnect_all().await;
    RecoveryReport {
        kind: RecoveryKind::Full,
        probe: Some(outcome),
        refreshed,
        reconnected: group.total(),
    }
}

async fn partial_recovery<G: ChannelGroup>(group: &G) -> RecoveryReport {
    let reconnected = if group.connected_count() < group.total() {
        group.reconnect_disconnected().await
    } else {
        debug!("all channels connected");
        0
    };
    RecoveryReport {
        kind: RecoveryKind::Partial,
        probe: None,
        refreshed: None,
        reconnected,
    }
}
