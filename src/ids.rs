use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

entity_id!(BoardId);
entity_id!(ColumnId);
entity_id!(TaskId);
entity_id!(TagId);
entity_id!(UserId);

/// Fresh client-side identifier for an entity that has not been persisted yet.
///
/// Backends assign v4 UUIDs as well, so a temporary id has the same shape as a
/// confirmed one and readers never branch on where an id came from.
pub fn new_id<T: From<Uuid>>() -> T {
    T::from(Uuid::new_v4())
}
