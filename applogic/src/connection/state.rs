// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{fmt, time::Duration};

use tokio::time::Instant;

/// Connection state of a recovering channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No subscription exists.
    #[default]
    Disconnected,
    /// A subscription was created and waits for the server to acknowledge it.
    Connecting,
    Connected,
    /// A subscription exists (or failed to be created) but is presumed dead:
    /// it errored, timed out, or showed no liveness for too long.
    Frozen,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Frozen => "frozen",
        };
        f.write_str(s)
    }
}

/// Last time a connection showed a sign of life.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Liveness {
    last_seen: Instant,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Self {
            last_seen: Instant::now(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.last_seen.elapsed()
    }

    pub(crate) fn is_stale(&self, threshold: Duration) -> bool {
        self.elapsed() > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn liveness_turns_stale_after_threshold() {
        let threshold = Duration::from_secs(30);
        let mut liveness = Liveness::new();
        assert!(!liveness.is_stale(threshold));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!liveness.is_stale(threshold));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(liveness.is_stale(threshold));

        liveness.touch();
        assert!(!liveness.is_stale(threshold));
    }
}
