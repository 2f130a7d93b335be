// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request and response bodies of the edge functions called by the client.
//!
//! Authorization and idempotency live in the stored procedures behind the
//! functions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifiers::TransactionId;

/// Smallest coin purchase accepted by the payment function.
pub const MIN_COIN_PURCHASE: u32 = 10;
/// Largest coin purchase accepted by the payment function.
pub const MAX_COIN_PURCHASE: u32 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PurchaseValidationError {
    #[error("Coin purchase must be at least {MIN_COIN_PURCHASE}, got {0}")]
    TooSmall(u32),
    #[error("Coin purchase must be at most {MAX_COIN_PURCHASE}, got {0}")]
    TooLarge(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePaymentIntentRequest {
    pub coins: u32,
}

impl CreatePaymentIntentRequest {
    pub fn new(coins: u32) -> Result<Self, PurchaseValidationError> {
        if coins < MIN_COIN_PURCHASE {
            return Err(PurchaseValidationError::TooSmall(coins));
        }
        if coins > MAX_COIN_PURCHASE {
            return Err(PurchaseValidationError::TooLarge(coins));
        }
        Ok(Self { coins })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentResponse {
    pub client_secret: String,
    pub transaction_id: TransactionId,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferralCodeError {
    #[error("Referral code is empty")]
    Empty,
    #[error("Referral code contains invalid characters")]
    InvalidCharacters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemReferralRequest {
    pub code: String,
}

impl RedeemReferralRequest {
    /// Codes are case-insensitive and normalized to upper case.
    pub fn new(code: &str) -> Result<Self, ReferralCodeError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(ReferralCodeError::Empty);
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ReferralCodeError::InvalidCharacters);
        }
        Ok(Self {
            code: code.to_ascii_uppercase(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemReferralResponse {
    pub coins_awarded: i64,
    pub new_balance: i64,
}

/// Error body returned by the edge functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionErrorBody {
    pub error: String,
}
