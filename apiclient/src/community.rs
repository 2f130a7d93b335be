// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed queries for the community data shown by the app.

use ggvcommon::{
    endpoint_paths::{
        TABLE_COIN_TRANSACTIONS, TABLE_HEADER_MESSAGES, TABLE_LOCATIONS, TABLE_PROFILE_LOCATIONS,
        TABLE_PROFILES,
    },
    identifiers::UserId,
    models::{CoinTransaction, HeaderMessage, Location, Profile, ProfileLocation},
    time::TimeStamp,
};
use serde::Serialize;

use crate::{
    ApiClient,
    rest::{Query, RestError},
};

#[derive(Serialize)]
struct ProfileUpdate<'a> {
    full_name: &'a str,
    onboarding_complete: bool,
}

impl ApiClient {
    pub async fn profile(&self, user_id: UserId) -> Result<Profile, RestError> {
        self.select_single(
            TABLE_PROFILES,
            &Query::new().select("*").eq("id", user_id),
        )
        .await
    }

    /// Finish onboarding by setting the display name.
    pub async fn complete_onboarding(
        &self,
        user_id: UserId,
        full_name: &str,
    ) -> Result<Profile, RestError> {
        let mut rows: Vec<Profile> = self
            .update(
                TABLE_PROFILES,
                &Query::new().eq("id", user_id),
                &ProfileUpdate {
                    full_name,
                    onboarding_complete: true,
                },
            )
            .await?;
        if rows.len() != 1 {
            return Err(RestError::NotSingle(rows.len()));
        }
        Ok(rows.remove(0))
    }

    pub async fn locations(&self) -> Result<Vec<Location>, RestError> {
        self.select(
            TABLE_LOCATIONS,
            &Query::new().select("*").order("name", true),
        )
        .await
    }

    pub async fn profile_locations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ProfileLocation>, RestError> {
        self.select(
            TABLE_PROFILE_LOCATIONS,
            &Query::new().select("*").eq("profile_id", user_id),
        )
        .await
    }

    /// Header messages that have not expired at `now`.
    ///
    /// Expiry is filtered server-side and again locally, since the clock of
    /// the device and the database may disagree.
    pub async fn active_header_messages(
        &self,
        now: TimeStamp,
    ) -> Result<Vec<HeaderMessage>, RestError> {
        let messages: Vec<HeaderMessage> = self
            .select(
                TABLE_HEADER_MESSAGES,
                &Query::new()
                    .select("*")
                    .or(&[
                        "expires_at.is.null".to_owned(),
                        format!("expires_at.gt.{now}"),
                    ])
                    .order("created_at", false),
            )
            .await?;
        Ok(messages
            .into_iter()
            .filter(|message| !message.is_expired(now))
            .collect())
    }

    pub async fn coin_transactions(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<CoinTransaction>, RestError> {
        self.select(
            TABLE_COIN_TRANSACTIONS,
            &Query::new()
                .select("*")
                .eq("user_id", user_id)
                .order("created_at", false)
                .limit(limit),
        )
        .await
    }
}
