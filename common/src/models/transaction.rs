// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};

use crate::{
    identifiers::{TransactionId, UserId},
    time::TimeStamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    ReferralBonus,
    Transfer,
    Payment,
    Refund,
}

/// Transactions are created `Pending` and finalized by the payment webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinTransaction {
    pub id: TransactionId,
    pub user_id: UserId,
    /// Signed amount in coins; negative for spending.
    pub amount: i64,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub payment_reference: Option<String>,
    pub created_at: TimeStamp,
}

impl CoinTransaction {
    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Completed | TransactionStatus::Failed
        )
    }

    pub fn is_credit(&self) -> bool {
        self.amount > 0
    }
}
