// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{identifiers::UserId, time::TimeStamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub full_name: Option<String>,
    pub avatar_url: Option<Url>,
    /// Coin balance maintained by stored procedures; never written by the client.
    #[serde(default)]
    pub coins: i64,
    #[serde(default)]
    pub onboarding_complete: bool,
    pub created_at: TimeStamp,
}

impl Profile {
    /// Name shown in the UI; falls back to a neutral placeholder.
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or("Resident")
    }
}
