// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{fmt, str::FromStr};

use derive_more::From;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From,
        )]
        #[serde(transparent)]
        pub struct $name {
            uuid: Uuid,
        }

        impl $name {
            pub fn new(uuid: Uuid) -> Self {
                Self { uuid }
            }

            pub fn random() -> Self {
                Self::new(Uuid::new_v4())
            }

            pub fn uuid(&self) -> Uuid {
                self.uuid
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.uuid.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self::new)
            }
        }
    };
}

uuid_id!(
    /// Id of an authenticated user (the auth user id, shared with the profile row)
    UserId
);
uuid_id!(LocationId);
uuid_id!(TransactionId);
uuid_id!(HeaderMessageId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_uuid() {
        let uuid = Uuid::new_v4();
        let id = UserId::new(uuid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));
        let parsed: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn ids_parse_from_str() {
        let id = LocationId::random();
        assert_eq!(id.to_string().parse::<LocationId>().unwrap(), id);
        assert!("not-a-uuid".parse::<LocationId>().is_err());
    }
}
