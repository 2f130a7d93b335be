// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire format of the realtime websocket and the messages handed to channel
//! consumers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub(crate) const EVENT_JOIN: &str = "phx_join";
pub(crate) const EVENT_LEAVE: &str = "phx_leave";
pub(crate) const EVENT_REPLY: &str = "phx_reply";
pub(crate) const EVENT_ERROR: &str = "phx_error";
pub(crate) const EVENT_CLOSE: &str = "phx_close";
pub(crate) const EVENT_HEARTBEAT: &str = "heartbeat";
pub(crate) const EVENT_ACCESS_TOKEN: &str = "access_token";
pub(crate) const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub(crate) const EVENT_BROADCAST: &str = "broadcast";
pub(crate) const EVENT_PRESENCE: &str = "presence";
pub(crate) const EVENT_PRESENCE_STATE: &str = "presence_state";
pub(crate) const EVENT_PRESENCE_DIFF: &str = "presence_diff";

/// Prefix the server expects in front of every channel name.
pub(crate) const TOPIC_PREFIX: &str = "realtime:";

/// A single websocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub(crate) topic: String,
    pub(crate) event: String,
    #[serde(default)]
    pub(crate) payload: Value,
    #[serde(rename = "ref", default)]
    pub(crate) reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) join_ref: Option<String>,
}

impl Frame {
    pub(crate) fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        reference: String,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: Some(reference),
            join_ref: None,
        }
    }

    pub(crate) fn with_join_ref(mut self, join_ref: Option<String>) -> Self {
        self.join_ref = join_ref;
        self
    }
}

/// Subscription status of a channel as reported to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    /// The server acknowledged the join.
    Subscribed,
    /// The join was rejected, or the channel or socket failed.
    ChannelError,
    /// The server did not acknowledge the join in time.
    TimedOut,
    /// The server closed the channel.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeEvent {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

/// Row change subscription of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostgresChangeFilter {
    pub event: ChangeEvent,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl PostgresChangeFilter {
    /// All changes of a table in the `public` schema.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            event: ChangeEvent::All,
            schema: "public".to_owned(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn event(mut self, event: ChangeEvent) -> Self {
        self.event = event;
        self
    }

    /// Row filter in the `column=op.value` syntax, e.g. `receiver_id=eq.<uuid>`.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// What a channel subscribes to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    pub postgres_changes: Vec<PostgresChangeFilter>,
    /// Receive own broadcast messages.
    pub broadcast_self: bool,
    /// Key under which own presence is tracked. Empty lets the server pick.
    pub presence_key: Option<String>,
    pub private: bool,
}

impl ChannelConfig {
    pub(crate) fn join_payload(&self, access_token: &str) -> Value {
        json!({
            "config": {
                "broadcast": { "ack": false, "self": self.broadcast_self },
                "presence": { "key": self.presence_key.clone().unwrap_or_default() },
                "postgres_changes": self.postgres_changes,
                "private": self.private,
            },
            "access_token": access_token,
        })
    }
}

/// A row change delivered by a `postgres_changes` subscription.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PostgresChange {
    pub schema: String,
    pub table: String,
    pub commit_timestamp: Option<String>,
    #[serde(rename = "eventType", alias = "type")]
    pub event: ChangeEvent,
    #[serde(default, alias = "record")]
    pub new: Value,
    #[serde(default, alias = "old_record")]
    pub old: Value,
}

/// Presence metadata per presence key.
pub type PresenceMap = HashMap<String, Vec<Value>>;

#[derive(Deserialize)]
struct PresenceEntry {
    #[serde(default)]
    metas: Vec<Value>,
}

pub(crate) fn parse_presence_map(value: Value) -> PresenceMap {
    serde_json::from_value::<HashMap<String, PresenceEntry>>(value)
        .map(|entries| {
            entries
                .into_iter()
                .map(|(key, entry)| (key, entry.metas))
                .collect()
        })
        .unwrap_or_default()
}

/// Message received from a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    PostgresChange(PostgresChange),
    Broadcast { event: String, payload: Value },
    PresenceState(PresenceMap),
    PresenceDiff {
        joins: PresenceMap,
        leaves: PresenceMap,
    },
}

#[derive(Deserialize)]
struct PostgresChangesPayload {
    data: PostgresChange,
}

#[derive(Deserialize)]
struct BroadcastPayload {
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct PresenceDiffPayload {
    #[serde(default)]
    joins: Value,
    #[serde(default)]
    leaves: Value,
}

impl ChannelMessage {
    /// Decode the payload of a data frame. Control frames and unknown events
    /// yield `None`.
    pub(crate) fn from_frame(frame: &Frame) -> Option<Self> {
        match frame.event.as_str() {
            EVENT_POSTGRES_CHANGES => {
                serde_json::from_value::<PostgresChangesPayload>(frame.payload.clone())
                    .ok()
                    .map(|payload| Self::PostgresChange(payload.data))
            }
            EVENT_BROADCAST => serde_json::from_value::<BroadcastPayload>(frame.payload.clone())
                .ok()
                .map(|payload| Self::Broadcast {
                    event: payload.event,
                    payload: payload.payload,
                }),
            EVENT_PRESENCE_STATE => Some(Self::PresenceState(parse_presence_map(
                frame.payload.clone(),
            ))),
            EVENT_PRESENCE_DIFF => {
                serde_json::from_value::<PresenceDiffPayload>(frame.payload.clone())
                    .ok()
                    .map(|diff| Self::PresenceDiff {
                        joins: parse_presence_map(diff.joins),
                        leaves: parse_presence_map(diff.leaves),
                    })
            }
            _ => None,
        }
    }
}

/// Status carried by a `phx_reply` frame.
pub(crate) fn reply_is_ok(payload: &Value) -> bool {
    payload.get("status").and_then(Value::as_str) == Some("ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_payload_shape() {
        let config = ChannelConfig {
            postgres_changes: vec![
                PostgresChangeFilter::table("messages")
                    .event(ChangeEvent::Insert)
                    .filter("receiver_id=eq.42"),
            ],
            presence_key: Some("user-1".to_owned()),
            ..Default::default()
        };
        let payload = config.join_payload("token");
        assert_eq!(payload["access_token"], "token");
        assert_eq!(payload["config"]["presence"]["key"], "user-1");
        assert_eq!(payload["config"]["broadcast"]["self"], false);
        let change = &payload["config"]["postgres_changes"][0];
        assert_eq!(change["event"], "INSERT");
        assert_eq!(change["schema"], "public");
        assert_eq!(change["table"], "messages");
        assert_eq!(change["filter"], "receiver_id=eq.42");
    }

    #[test]
    fn decode_postgres_change() {
        let frame: Frame = serde_json::from_value(json!({
            "topic": "realtime:private-messages",
            "event": "postgres_changes",
            "payload": {
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": "messages",
                    "commit_timestamp": "2025-03-01T10:00:00Z",
                    "eventType": "INSERT",
                    "new": { "id": 7, "content": "hi" },
                    "old": {},
                    "errors": null
                }
            },
            "ref": null
        }))
        .unwrap();
        let Some(ChannelMessage::PostgresChange(change)) = ChannelMessage::from_frame(&frame)
        else {
            panic!("expected postgres change");
        };
        assert_eq!(change.event, ChangeEvent::Insert);
        assert_eq!(change.table, "messages");
        assert_eq!(change.new["content"], "hi");
    }

    #[test]
    fn decode_presence_diff() {
        let frame: Frame = serde_json::from_value(json!({
            "topic": "realtime:public",
            "event": "presence_diff",
            "payload": {
                "joins": { "a": { "metas": [{ "phx_ref": "1", "user_id": "a" }] } },
                "leaves": { "b": { "metas": [{ "phx_ref": "2" }] } }
            },
            "ref": null
        }))
        .unwrap();
        let Some(ChannelMessage::PresenceDiff { joins, leaves }) =
            ChannelMessage::from_frame(&frame)
        else {
            panic!("expected presence diff");
        };
        assert_eq!(joins["a"].len(), 1);
        assert_eq!(leaves["b"][0]["phx_ref"], "2");
    }

    #[test]
    fn control_frames_are_not_channel_messages() {
        let frame = Frame::new("realtime:x", EVENT_REPLY, json!({"status": "ok"}), "1".into());
        assert!(ChannelMessage::from_frame(&frame).is_none());
        assert!(reply_is_ok(&frame.payload));
    }
}
