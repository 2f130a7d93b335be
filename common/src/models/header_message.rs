// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};

use crate::{
    identifiers::{HeaderMessageId, UserId},
    time::TimeStamp,
};

/// Short announcement shown in the app header until it expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMessage {
    pub id: HeaderMessageId,
    pub content: String,
    pub user_id: Option<UserId>,
    pub created_at: TimeStamp,
    pub expires_at: Option<TimeStamp>,
}

impl HeaderMessage {
    /// A message without expiry never expires.
    pub fn is_expired(&self, now: TimeStamp) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}
