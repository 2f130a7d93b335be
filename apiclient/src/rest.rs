// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Table access and stored procedure calls.
//!
//! Every request is evaluated against the row-level security policies of the
//! database. A query that is not allowed to see a row simply does not return
//! it; a mutation that is not allowed fails with a [`RestError::Database`].

use std::fmt;

use ggvcommon::endpoint_paths::{ENDPOINT_REST, ENDPOINT_RPC};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{ApiClient, Protocol};

/// Error body returned by the REST layer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseError {
    pub code: Option<String>,
    pub message: String,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl DatabaseError {
    /// Row-level security violation (`42501`).
    pub fn is_permission_denied(&self) -> bool {
        self.code.as_deref() == Some("42501")
    }

    /// Unique constraint violation (`23505`).
    pub fn is_unique_violation(&self) -> bool {
        self.code.as_deref() == Some("23505")
    }
}

#[derive(Error, Debug)]
pub enum RestError {
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error("Database error {status}: {error}")]
    Database {
        status: StatusCode,
        error: DatabaseError,
    },
    #[error("Unexpected response {status}: {body}")]
    Unexpected { status: StatusCode, body: String },
    #[error("Expected exactly one row, got {0}")]
    NotSingle(usize),
}

pub(crate) async fn error_from_response(response: Response) -> RestError {
    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(error) => return error.into(),
    };
    match serde_json::from_str::<DatabaseError>(&body) {
        Ok(error) => RestError::Database { status, error },
        Err(_) => RestError::Unexpected { status, body },
    }
}

/// Filter and modifier pairs of a table query, e.g. `("id", "eq.<uuid>")`.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.pairs.push(("select".into(), columns.into()));
        self
    }

    pub fn eq(mut self, column: &str, value: impl fmt::Display) -> Self {
        self.pairs.push((column.into(), format!("eq.{value}")));
        self
    }

    pub fn gt(mut self, column: &str, value: impl fmt::Display) -> Self {
        self.pairs.push((column.into(), format!("gt.{value}")));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.pairs.push((column.into(), "is.null".into()));
        self
    }

    /// Combines filters with `or`, e.g. `or=(expires_at.is.null,expires_at.gt.now)`.
    pub fn or(mut self, filters: &[String]) -> Self {
        self.pairs
            .push(("or".into(), format!("({})", filters.join(","))));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        let direction = if ascending { "asc" } else { "desc" };
        self.pairs
            .push(("order".into(), format!("{column}.{direction}")));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.pairs.push(("limit".into(), limit.to_string()));
        self
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }
}

impl ApiClient {
    fn table_url(&self, table: &str) -> String {
        self.build_url(Protocol::Http, &format!("{ENDPOINT_REST}/{table}"))
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &Query,
    ) -> Result<Vec<T>, RestError> {
        let response = self
            .authorize(self.client.get(self.table_url(table)))
            .query(query.pairs())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// Select exactly one row.
    pub async fn select_single<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &Query,
    ) -> Result<T, RestError> {
        let mut rows: Vec<T> = self.select(table, query).await?;
        if rows.len() != 1 {
            return Err(RestError::NotSingle(rows.len()));
        }
        Ok(rows.remove(0))
    }

    /// Insert rows and return them as stored.
    pub async fn insert<B, T>(&self, table: &str, rows: &B) -> Result<Vec<T>, RestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .authorize(self.client.post(self.table_url(table)))
            .header("Prefer", "return=representation")
            .json(rows)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// Update the rows matching `query` and return them.
    pub async fn update<B, T>(
        &self,
        table: &str,
        query: &Query,
        changes: &B,
    ) -> Result<Vec<T>, RestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .authorize(self.client.patch(self.table_url(table)))
            .query(query.pairs())
            .header("Prefer", "return=representation")
            .json(changes)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// Invoke a stored procedure.
    pub async fn rpc<A, T>(&self, function: &str, args: &A) -> Result<T, RestError>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(Protocol::Http, &format!("{ENDPOINT_RPC}/{function}"));
        let response = self
            .authorize(self.client.post(url))
            .json(args)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }
}
