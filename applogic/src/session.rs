// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The signed-in user's session.

use std::fmt;

use anyhow::{Context, anyhow};
use ggvapiclient::{ApiClient, realtime::RealtimeClient};
use ggvcommon::{
    session::Session,
    time::{Duration, TimeStamp},
};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    recovery::SessionProbe,
    registry::{ChannelRegistry, RealtimeTransport},
};

/// Holds the current session and keeps the realtime transport authorized
/// with it.
pub struct SessionKeeper<T: RealtimeTransport = RealtimeClient> {
    api: ApiClient,
    session: watch::Sender<Option<Session>>,
    registry: ChannelRegistry<T>,
}

impl<T: RealtimeTransport> fmt::Debug for SessionKeeper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeeper")
            .field("session", &*self.session.borrow())
            .finish()
    }
}

impl<T: RealtimeTransport> SessionKeeper<T> {
    /// `api` must not carry an access token; the keeper attaches the token of
    /// the current session to every request.
    pub fn new(api: ApiClient, session: Session, registry: ChannelRegistry<T>) -> Self {
        Self {
            api,
            session: watch::Sender::new(Some(session)),
            registry,
        }
    }

    pub fn session(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    /// API client authorized with the current access token.
    pub fn api(&self) -> anyhow::Result<ApiClient> {
        let session = self.session.borrow();
        let session = session.as_ref().ok_or_else(|| anyhow!("signed out"))?;
        Ok(self.api.with_access_token(session.access_token.as_str()))
    }

    /// Refresh the session if it expires within `margin`.
    pub async fn refresh_if_expiring(&self, now: TimeStamp, margin: Duration) -> anyhow::Result<bool> {
        let expiring = self
            .session
            .borrow()
            .as_ref()
            .is_some_and(|session| session.expires_within(now, margin));
        if !expiring {
            return Ok(false);
        }
        self.refresh_session().await?;
        Ok(true)
    }

    async fn refresh_session(&self) -> anyhow::Result<()> {
        let refresh_token = self
            .session
            .borrow()
            .as_ref()
            .map(|session| session.refresh_token.clone())
            .ok_or_else(|| anyhow!("signed out"))?;
        let session = self
            .api
            .refresh_session(&refresh_token)
            .await
            .context("failed to refresh session")?;
        info!(
            user_id = %session.user_id(),
            expires_at = %session.expires_at,
            "session refreshed"
        );
        self.registry.set_auth(&session.access_token);
        self.session.send_replace(Some(session));
        Ok(())
    }

    /// Sign out on the server and forget the session.
    pub async fn sign_out(&self) -> anyhow::Result<()> {
        let api = self.api()?;
        self.session.send_replace(None);
        api.sign_out().await.context("failed to sign out")?;
        info!("signed out");
        Ok(())
    }
}

impl<T: RealtimeTransport> SessionProbe for SessionKeeper<T> {
    async fn check(&self) -> anyhow::Result<()> {
        let user = self.api()?.get_user().await?;
        debug!(user_id = %user.id, "session is valid");
        Ok(())
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        self.refresh_session().await
    }
}
