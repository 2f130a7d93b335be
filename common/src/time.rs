// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use chrono::Duration;

/// Wall-clock time stamp as stored by the hosted database (`timestamptz`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeStamp {
    time: DateTime<Utc>,
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.time.to_rfc3339().fmt(f)
    }
}

impl TimeStamp {
    pub fn now() -> Self {
        Self { time: Utc::now() }
    }

    pub fn in_days(days_in_the_future: i64) -> Self {
        Self::now() + Duration::days(days_in_the_future)
    }

    /// Unix time stamp in seconds, as used in token expiry claims.
    pub fn from_unix_seconds(seconds: i64) -> Option<Self> {
        DateTime::from_timestamp(seconds, 0).map(Self::from)
    }

    pub fn is_between(&self, start: &Self, end: &Self) -> bool {
        self.time >= start.time && self.time <= end.time
    }

    pub fn is_more_recent_than(&self, other: &Self) -> bool {
        self.time > other.time
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

impl std::ops::Add<Duration> for TimeStamp {
    type Output = TimeStamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Self {
            time: self.time + rhs,
        }
    }
}

impl std::ops::Sub<Duration> for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self {
            time: self.time - rhs,
        }
    }
}

impl std::ops::Sub for TimeStamp {
    type Output = Duration;

    fn sub(self, rhs: TimeStamp) -> Self::Output {
        self.time - rhs.time
    }
}
