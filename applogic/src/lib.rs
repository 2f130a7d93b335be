// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client application logic of MyGGV
//!
//! The core of this crate keeps the app's realtime subscriptions alive across
//! tab and app visibility changes:
//!
//! - [`connection`] owns a single recovering subscription,
//! - [`aggregator`] manages the set of subscriptions of a signed-in user,
//! - [`recovery`] coordinates a recovery pass when the app becomes visible.

pub mod aggregator;
pub mod connection;
pub mod logging;
pub mod preferences;
pub mod presence;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod settings;
pub mod visibility;

pub(crate) mod util;
