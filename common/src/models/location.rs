// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};

use crate::{
    identifiers::{LocationId, UserId},
    time::TimeStamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Residence,
    Amenity,
    Business,
    #[serde(other)]
    Other,
}

/// A marker on the community map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub block: Option<String>,
    pub lot: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: LocationKind,
}

fn default_kind() -> LocationKind {
    LocationKind::Residence
}

impl Location {
    /// Address label in the community's block/lot convention.
    pub fn address(&self) -> String {
        match (&self.block, &self.lot) {
            (Some(block), Some(lot)) => format!("Block {block} Lot {lot}"),
            (Some(block), None) => format!("Block {block}"),
            _ => self.name.clone(),
        }
    }
}

/// Association of a profile with a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileLocation {
    pub profile_id: UserId,
    pub location_id: LocationId,
    #[serde(default)]
    pub is_owner: bool,
    #[serde(default)]
    pub is_verified: bool,
    pub created_at: TimeStamp,
}

impl ProfileLocation {
    /// Only verified associations grant access to the location's features.
    pub fn is_active_membership(&self) -> bool {
        self.is_verified
    }
}
