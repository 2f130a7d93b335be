// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Visibility of the app as reported by the host shell.
//!
//! The shell (browser page, installed window, mobile lifecycle) reports every
//! change through a [`VisibilityPublisher`]. While hidden, the host may
//! suspend sockets and timers, so anything that was connected before may be
//! dead after the app becomes visible again.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{
    sync::{broadcast, watch},
    time::Instant,
};
use tracing::debug;

/// Transitions buffered per subscriber before it lags.
const EDGES_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Visible,
    Hidden,
}

impl Visibility {
    pub fn is_visible(&self) -> bool {
        matches!(self, Self::Visible)
    }
}

/// How the app is presented by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Installed app with its own window.
    Standalone,
    /// Regular browser tab.
    #[default]
    Browser,
}

/// A visibility transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityEvent {
    Hidden,
    /// The app became visible after being hidden for `hidden_for`.
    Visible { hidden_for: Duration },
}

/// Publishes the visibility reported by the host.
///
/// The current value is available as a `watch`. Every transition is also
/// queued as a [`VisibilityEvent`], so changes published in quick succession
/// are never merged.
#[derive(Debug)]
pub struct VisibilityPublisher {
    state: watch::Sender<Visibility>,
    edges: broadcast::Sender<VisibilityEvent>,
    hidden_since: Mutex<Option<Instant>>,
}

impl VisibilityPublisher {
    pub fn new(initial: Visibility) -> Self {
        let (edges, _) = broadcast::channel(EDGES_CAPACITY);
        Self {
            state: watch::Sender::new(initial),
            edges,
            hidden_since: Mutex::new((!initial.is_visible()).then(Instant::now)),
        }
    }

    pub fn current(&self) -> Visibility {
        *self.state.borrow()
    }

    /// Receiver of the current visibility.
    pub fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.state.subscribe()
    }

    /// Receiver of all transitions published from now on.
    pub fn edges(&self) -> broadcast::Receiver<VisibilityEvent> {
        self.edges.subscribe()
    }

    /// Report the visibility; returns the transition, if it is one.
    pub fn set(&self, visibility: Visibility) -> Option<VisibilityEvent> {
        let mut hidden_since = self.hidden_since.lock();
        if !self.state.send_if_modified(|current| {
            let changed = *current != visibility;
            *current = visibility;
            changed
        }) {
            return None;
        }
        let event = match visibility {
            Visibility::Hidden => {
                *hidden_since = Some(Instant::now());
                VisibilityEvent::Hidden
            }
            Visibility::Visible => {
                let hidden_for = hidden_since
                    .take()
                    .map(|since| since.elapsed())
                    .unwrap_or_default();
                VisibilityEvent::Visible { hidden_for }
            }
        };
        debug!(?event, "visibility changed");
        // No receivers is fine
        let _ = self.edges.send(event);
        Some(event)
    }
}
