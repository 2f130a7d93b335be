// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Edge function calls.

use ggvcommon::{
    endpoint_paths::{
        ENDPOINT_FUNCTIONS, FUNCTION_CREATE_PAYMENT_INTENT, FUNCTION_REDEEM_REFERRAL_CODE,
    },
    functions::{
        CreatePaymentIntentRequest, CreatePaymentIntentResponse, FunctionErrorBody,
        RedeemReferralRequest, RedeemReferralResponse,
    },
};
use reqwest::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::debug;

use crate::{ApiClient, Protocol};

#[derive(Error, Debug)]
pub enum FunctionError {
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error("Function {function} failed with {status}: {message}")]
    Failed {
        function: String,
        status: StatusCode,
        message: String,
    },
    #[error("Function requires a signed-in user")]
    NotSignedIn,
}

impl ApiClient {
    pub async fn invoke_function<B, T>(&self, function: &str, body: &B) -> Result<T, FunctionError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(Protocol::Http, &format!("{ENDPOINT_FUNCTIONS}/{function}"));
        let response = self
            .authorize(self.client.post(url))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<FunctionErrorBody>(&text)
                .map(|body| body.error)
                .unwrap_or(text);
            return Err(FunctionError::Failed {
                function: function.to_owned(),
                status,
                message,
            });
        }
        debug!(function, %status, "function invoked");
        Ok(response.json().await?)
    }

    /// Create a payment intent for buying coins. The function also records a
    /// pending transaction which the payment webhook later finalizes.
    pub async fn create_payment_intent(
        &self,
        request: &CreatePaymentIntentRequest,
    ) -> Result<CreatePaymentIntentResponse, FunctionError> {
        if self.access_token.is_none() {
            return Err(FunctionError::NotSignedIn);
        }
        self.invoke_function(FUNCTION_CREATE_PAYMENT_INTENT, request)
            .await
    }

    pub async fn redeem_referral_code(
        &self,
        request: &RedeemReferralRequest,
    ) -> Result<RedeemReferralResponse, FunctionError> {
        if self.access_token.is_none() {
            return Err(FunctionError::NotSignedIn);
        }
        self.invoke_function(FUNCTION_REDEEM_REFERRAL_CODE, request)
            .await
    }
}
