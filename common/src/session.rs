// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    identifiers::UserId,
    time::{Duration, TimeStamp},
};

/// The authenticated user as returned by the auth server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: UserId,
    pub email: Option<String>,
}

/// Token pair of a signed-in user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: TimeStamp,
    pub user: AuthUser,
}

// Tokens are never logged.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    pub fn is_expired(&self, now: TimeStamp) -> bool {
        self.expires_at <= now
    }

    /// True if the session expires within `margin` from `now` (or already has).
    pub fn expires_within(&self, now: TimeStamp, margin: Duration) -> bool {
        self.expires_at <= now + margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_at: TimeStamp) -> Session {
        Session {
            access_token: "access".to_owned(),
            refresh_token: "refresh".to_owned(),
            expires_at,
            user: AuthUser {
                id: UserId::random(),
                email: None,
            },
        }
    }

    #[test]
    fn expiry_checks() {
        let now = TimeStamp::now();
        let session = session(now + Duration::minutes(5));
        assert!(!session.is_expired(now));
        assert!(session.expires_within(now, Duration::minutes(10)));
        assert!(!session.expires_within(now, Duration::minutes(1)));
        assert!(session.is_expired(now + Duration::minutes(5)));
    }

    #[test]
    fn debug_hides_tokens() {
        let debug = format!("{:?}", session(TimeStamp::now()));
        assert!(!debug.contains("access"));
        assert!(!debug.contains("refresh"));
    }
}
