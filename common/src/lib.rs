// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Common data model used by the MyGGV client crates.
//!
//! All rows mirror tables of the hosted database. The client is never the
//! authority for any of them: uniqueness, referential integrity and access
//! control are enforced server-side.

pub mod endpoint_paths;
pub mod functions;
pub mod identifiers;
pub mod models;
pub mod session;
pub mod time;

/// Version of the realtime websocket protocol spoken by the client.
pub const REALTIME_PROTOCOL_VERSION: &str = "1.0.0";

/// Topic used by the realtime server for socket-level messages (heartbeats).
pub const REALTIME_SOCKET_TOPIC: &str = "phoenix";
