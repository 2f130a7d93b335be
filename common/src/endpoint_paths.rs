// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

/// Auth endpoints
pub const ENDPOINT_AUTH_TOKEN: &str = "/auth/v1/token";
pub const ENDPOINT_AUTH_SIGNUP: &str = "/auth/v1/signup";
pub const ENDPOINT_AUTH_USER: &str = "/auth/v1/user";
pub const ENDPOINT_AUTH_LOGOUT: &str = "/auth/v1/logout";

/// REST endpoints
pub const ENDPOINT_REST: &str = "/rest/v1";
pub const ENDPOINT_RPC: &str = "/rest/v1/rpc";

/// Edge functions
pub const ENDPOINT_FUNCTIONS: &str = "/functions/v1";
pub const FUNCTION_CREATE_PAYMENT_INTENT: &str = "create-payment-intent";
pub const FUNCTION_REDEEM_REFERRAL_CODE: &str = "redeem-referral-code";

/// Realtime websocket endpoint
pub const ENDPOINT_REALTIME_WS: &str = "/realtime/v1/websocket";

/// Tables
pub const TABLE_PROFILES: &str = "profiles";
pub const TABLE_LOCATIONS: &str = "locations";
pub const TABLE_PROFILE_LOCATIONS: &str = "profile_location_associations";
pub const TABLE_HEADER_MESSAGES: &str = "header_messages";
pub const TABLE_COIN_TRANSACTIONS: &str = "coin_transactions";
pub const TABLE_MESSAGES: &str = "messages";
pub const TABLE_NOTIFICATIONS: &str = "notifications";
pub const TABLE_PUBLIC_CHAT: &str = "public_chat_messages";
