// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Rows of the hosted database as seen by the client.

mod header_message;
mod location;
mod profile;
mod transaction;

pub use header_message::HeaderMessage;
pub use location::{Location, LocationKind, ProfileLocation};
pub use profile::Profile;
pub use transaction::{CoinTransaction, TransactionKind, TransactionStatus};
