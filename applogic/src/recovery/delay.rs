// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use tokio::time::Instant;

use crate::visibility::DisplayMode;

pub const STANDALONE_DELAY: Duration = Duration::from_millis(200);
pub const BROWSER_DELAY: Duration = Duration::from_millis(800);
pub const BURST_DELAY: Duration = Duration::from_millis(1500);
/// Toggles tolerated before [`BURST_DELAY`] applies.
pub const BURST_THRESHOLD: usize = 10;
/// Toggle counting restarts after a pause this long.
pub const QUIET_GAP: Duration = Duration::from_secs(60);
pub const RECOVERY_JITTER: Duration = Duration::from_millis(200);

/// Delay between becoming visible and starting recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayPolicy {
    pub standalone: Duration,
    pub browser: Duration,
    pub burst: Duration,
    pub burst_threshold: usize,
    pub quiet_gap: Duration,
    pub jitter: Duration,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self {
            standalone: STANDALONE_DELAY,
            browser: BROWSER_DELAY,
            burst: BURST_DELAY,
            burst_threshold: BURST_THRESHOLD,
            quiet_gap: QUIET_GAP,
            jitter: RECOVERY_JITTER,
        }
    }
}

impl DelayPolicy {
    /// Delay without jitter for the `toggles`-th toggle of a burst.
    pub fn base_delay(&self, display_mode: DisplayMode, toggles: usize) -> Duration {
        if toggles > self.burst_threshold {
            return self.burst;
        }
        match display_mode {
            DisplayMode::Standalone => self.standalone,
            DisplayMode::Browser => self.browser,
        }
    }
}

/// Counts visibility toggles that follow each other without a quiet gap.
#[derive(Debug)]
pub(crate) struct ToggleTracker {
    quiet_gap: Duration,
    count: usize,
    last: Option<Instant>,
}

impl ToggleTracker {
    pub(crate) fn new(quiet_gap: Duration) -> Self {
        Self {
            quiet_gap,
            count: 0,
            last: None,
        }
    }

    /// Record a toggle at `now`; returns its position in the current burst.
    pub(crate) fn record(&mut self, now: Instant) -> usize {
        if self
            .last
            .is_some_and(|last| now.saturating_duration_since(last) >= self.quiet_gap)
        {
            self.count = 0;
        }
        self.count += 1;
        self.last = Some(now);
        self.count
    }
}
