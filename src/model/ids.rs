//! Typed identifiers for runs, workspaces, sub-run groups, and correlation.
//!
//! Every id is a v4 UUID behind a newtype so the compiler keeps run ids,
//! workspace ids, and group ids from being swapped at call sites.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id! {
    /// Identifier of a single run (one state-machine instance).
    RunId
}

uuid_id! {
    /// Identifier of a tenant workspace; quotas are tracked per workspace.
    WorkspaceId
}

uuid_id! {
    /// Identifier of one batch of children spawned together by a parent.
    GroupId
}

uuid_id! {
    /// Correlation id propagated from a run to its steps, events, and children.
    CorrelationId
}
