// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP and realtime client for the hosted backend
//!
//! The backend is a hosted database exposing auth, REST (with row-level
//! security), stored procedures, edge functions and a realtime websocket.
//! [`ApiClient`] exposes a single function for each endpoint the app uses.

use std::{sync::Arc, time::Duration};

use ggvcommon::endpoint_paths::ENDPOINT_AUTH_USER;
use reqwest::{Client, ClientBuilder, RequestBuilder, Url};
use thiserror::Error;
use tracing::info;
use url::ParseError;

pub mod auth;
pub mod community;
pub mod functions;
pub mod realtime;
pub mod rest;

#[cfg(test)]
mod tests;

/// Defines the type of protocol used for a specific endpoint.
pub enum Protocol {
    Http,
    Ws,
}

/// Header carrying the project's anonymous key.
const API_KEY_HEADER: &str = "apikey";

#[derive(Error, Debug)]
pub enum ApiClientInitError {
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),
    #[error("Failed to parse URL {0}")]
    UrlParsingError(String),
    #[error("Could not find hostname in URL {0}")]
    NoHostname(String),
    #[error("Anonymous key must not be empty")]
    MissingAnonKey,
}

pub type HttpClient = reqwest::Client;

// ApiClient is a wrapper around a reqwest client.
// It exposes a single function for each API endpoint.
#[derive(Clone)]
pub struct ApiClient {
    client: HttpClient,
    url: Url,
    anon_key: Arc<str>,
    access_token: Option<Arc<str>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("url", &self.url.as_str())
            .field("authenticated", &self.access_token.is_some())
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Creates a new HTTP client.
    pub fn new_http_client() -> reqwest::Result<Client> {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(4))
            .user_agent("MyGGV/0.1")
            .build()
    }

    pub fn with_default_http_client(
        project_url: impl AsRef<str>,
        anon_key: impl AsRef<str>,
    ) -> Result<Self, ApiClientInitError> {
        let client = Self::new_http_client()?;
        Self::initialize(client, project_url, anon_key)
    }

    /// Creates a new API client that connects to the given project URL.
    ///
    /// # Arguments
    /// project_url - The base URL or hostname:port tuple of the project. A
    /// bare hostname is assumed to use `https`.
    /// anon_key - The public anonymous key of the project. It is sent with
    /// every request and used as bearer token while no user is signed in.
    pub fn initialize(
        client: HttpClient,
        project_url: impl AsRef<str>,
        anon_key: impl AsRef<str>,
    ) -> Result<Self, ApiClientInitError> {
        let project_url = project_url.as_ref();
        let url = match Url::parse(project_url) {
            Ok(url) => url,
            // If not, we try to parse it as a hostname.
            Err(ParseError::RelativeUrlWithoutBase) => {
                let with_scheme = format!("https://{project_url}");
                Url::parse(&with_scheme)
                    .map_err(|_| ApiClientInitError::UrlParsingError(with_scheme))?
            }
            Err(_) => {
                return Err(ApiClientInitError::UrlParsingError(
                    project_url.to_owned(),
                ));
            }
        };
        if url.host_str().is_none() {
            return Err(ApiClientInitError::NoHostname(project_url.to_owned()));
        }
        let anon_key = anon_key.as_ref().trim();
        if anon_key.is_empty() {
            return Err(ApiClientInitError::MissingAnonKey);
        }
        info!(%url, "Initialized API client");

        Ok(Self {
            client,
            url,
            anon_key: anon_key.into(),
            access_token: None,
        })
    }

    /// Returns a client that authenticates requests with the given user
    /// access token instead of the anonymous key.
    pub fn with_access_token(&self, access_token: impl Into<Arc<str>>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            ..self.clone()
        }
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Builds a URL for a given endpoint.
    fn build_url(&self, protocol: Protocol, endpoint: &str) -> String {
        let mut protocol_str = match protocol {
            Protocol::Http => "http",
            Protocol::Ws => "ws",
        }
        .to_string();
        let tls_enabled = self.url.scheme() == "https";
        if tls_enabled {
            protocol_str.push('s')
        };
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{protocol_str}://{host}:{port}{endpoint}"),
            None => format!("{protocol_str}://{host}{endpoint}"),
        }
    }

    /// Attaches the project key and the bearer token to a request.
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
        request
            .header(API_KEY_HEADER, &*self.anon_key)
            .bearer_auth(bearer)
    }

    /// Lightweight authenticated request used to check that the backend is
    /// reachable and the access token is still accepted.
    pub async fn health_check(&self) -> bool {
        self.authorize(
            self.client
                .get(self.build_url(Protocol::Http, ENDPOINT_AUTH_USER)),
        )
        .send()
        .await
        .is_ok_and(|response| response.status().is_success())
    }
}
