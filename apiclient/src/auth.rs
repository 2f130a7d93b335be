// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Auth endpoints: sign-in, sign-up, token refresh, current user.

use ggvcommon::{
    endpoint_paths::{
        ENDPOINT_AUTH_LOGOUT, ENDPOINT_AUTH_SIGNUP, ENDPOINT_AUTH_TOKEN, ENDPOINT_AUTH_USER,
    },
    session::{AuthUser, Session},
    time::{Duration, TimeStamp},
};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{ApiClient, Protocol};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error("Invalid credentials or token: {0}")]
    Unauthorized(String),
    #[error("Auth server returned {status}: {message}")]
    Server { status: StatusCode, message: String },
    #[error("Sign-up requires email confirmation before a session is issued")]
    ConfirmationRequired,
    #[error("No access token attached to the client")]
    NotSignedIn,
}

impl AuthError {
    /// True if the error means the token itself was rejected, as opposed to
    /// the server being unreachable.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: AuthUser,
}

impl From<TokenResponse> for Session {
    fn from(response: TokenResponse) -> Self {
        let expires_at = response
            .expires_at
            .and_then(TimeStamp::from_unix_seconds)
            .unwrap_or_else(|| {
                TimeStamp::now() + Duration::seconds(response.expires_in.unwrap_or(3600))
            });
        Session {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at,
            user: response.user,
        }
    }
}

/// Sign-up returns either a session or, when email confirmation is enabled,
/// only the user.
#[derive(Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(AuthUser),
}

#[derive(Deserialize)]
struct AuthErrorBody {
    #[serde(alias = "error_description", alias = "msg")]
    message: Option<String>,
    error: Option<String>,
}

async fn error_from_response(response: Response) -> AuthError {
    let status = response.status();
    let message = match response.json::<AuthErrorBody>().await {
        Ok(body) => body
            .message
            .or(body.error)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST => {
            AuthError::Unauthorized(message)
        }
        _ => AuthError::Server { status, message },
    }
}

impl ApiClient {
    fn token_url(&self, grant_type: &str) -> String {
        format!(
            "{}?grant_type={grant_type}",
            self.build_url(Protocol::Http, ENDPOINT_AUTH_TOKEN)
        )
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let response = self
            .authorize(self.client.post(self.token_url("password")))
            .json(&PasswordGrant { email, password })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let token: TokenResponse = response.json().await?;
        debug!(user_id = %token.user.id, "signed in");
        Ok(token.into())
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let response = self
            .authorize(
                self.client
                    .post(self.build_url(Protocol::Http, ENDPOINT_AUTH_SIGNUP)),
            )
            .json(&PasswordGrant { email, password })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        match response.json().await? {
            SignUpResponse::Session(token) => Ok(token.into()),
            SignUpResponse::User(user) => {
                debug!(user_id = %user.id, "sign-up awaiting confirmation");
                Err(AuthError::ConfirmationRequired)
            }
        }
    }

    /// Exchange a refresh token for a new session.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let response = self
            .authorize(self.client.post(self.token_url("refresh_token")))
            .json(&RefreshGrant { refresh_token })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.into())
    }

    /// Fetch the user the attached access token belongs to.
    ///
    /// This is the cheapest authenticated round trip and doubles as session
    /// health probe.
    pub async fn get_user(&self) -> Result<AuthUser, AuthError> {
        if self.access_token.is_none() {
            return Err(AuthError::NotSignedIn);
        }
        let response = self
            .authorize(
                self.client
                    .get(self.build_url(Protocol::Http, ENDPOINT_AUTH_USER)),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        if self.access_token.is_none() {
            return Err(AuthError::NotSignedIn);
        }
        let response = self
            .authorize(
                self.client
                    .post(self.build_url(Protocol::Http, ENDPOINT_AUTH_LOGOUT)),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            let error = error_from_response(response).await;
            // An already invalid token means we are signed out anyway.
            if error.is_unauthorized() {
                warn!(%error, "sign-out with rejected token");
                return Ok(());
            }
            return Err(error);
        }
        Ok(())
    }
}
