// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Who is attached to the public broadcast channel.

use std::sync::Arc;

use ggvapiclient::realtime::PresenceMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

/// Presence of the members of a channel, keyed by presence key.
#[derive(Debug, Clone)]
pub struct PresenceState {
    state: Arc<watch::Sender<PresenceMap>>,
}

impl Default for PresenceState {
    fn default() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(PresenceMap::new())),
        }
    }
}

impl PresenceState {
    /// Replace the state with a full snapshot from the server.
    pub fn sync(&self, snapshot: PresenceMap) {
        debug!(members = snapshot.len(), "presence sync");
        self.state.send_replace(snapshot);
    }

    /// Apply an incremental change: joins first, then leaves.
    pub fn apply_diff(&self, joins: PresenceMap, leaves: PresenceMap) {
        self.state.send_modify(|state| {
            for (key, joined) in joins {
                let metas = state.entry(key).or_default();
                let joined_refs: Vec<_> = joined.iter().filter_map(phx_ref).collect();
                metas.retain(|meta| !is_listed(meta, &joined_refs));
                metas.extend(joined);
            }
            for (key, left) in leaves {
                let Some(metas) = state.get_mut(&key) else {
                    continue;
                };
                let left_refs: Vec<_> = left.iter().filter_map(phx_ref).collect();
                metas.retain(|meta| !is_listed(meta, &left_refs));
                if metas.is_empty() {
                    state.remove(&key);
                }
            }
        });
    }

    pub fn clear(&self) {
        self.state.send_replace(PresenceMap::new());
    }

    /// Presence keys of all members, sorted.
    pub fn online_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.state.borrow().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn count(&self) -> usize {
        self.state.borrow().len()
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceMap> {
        self.state.subscribe()
    }
}

fn phx_ref(meta: &Value) -> Option<&str> {
    meta.get("phx_ref").and_then(Value::as_str)
}

/// Metas without a `phx_ref` are never matched by a diff.
fn is_listed(meta: &Value, refs: &[&str]) -> bool {
    phx_ref(meta).is_some_and(|r| refs.contains(&r))
}
