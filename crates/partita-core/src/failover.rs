//! Which store of a partition serves an operation, and what to try next
//! when it cannot.
//!
//! Decisions are made per operation. No health state survives between
//! operations, and every fallback is tried at most once.
//!
//! Writes only ever go to the primary. A write accepted by a replica would
//! diverge from the primary, so a failed write is reported instead of
//! redirected.

use serde::Deserialize;
use std::str::FromStr;

use crate::error::PdalError;
use crate::model::{Access, Role};

/// Where reads go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    /// Read from the replica when one is configured, falling back to the primary.
    #[default]
    ReplicaFirst,
    /// Read from the primary only.
    PrimaryOnly,
}

impl FromStr for ReadPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replica_first" | "replica-first" | "replica" => Ok(ReadPreference::ReplicaFirst),
            "primary_only" | "primary-only" | "primary" => Ok(ReadPreference::PrimaryOnly),
            other => Err(format!("unknown read preference {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailoverPolicy {
    read_preference: ReadPreference,
}

impl FailoverPolicy {
    pub fn new(read_preference: ReadPreference) -> Self {
        Self { read_preference }
    }

    pub fn read_preference(&self) -> ReadPreference {
        self.read_preference
    }

    /// The store to try first.
    pub fn first_choice(&self, access: Access, replica_configured: bool) -> Role {
        match access {
            Access::Read
                if replica_configured && self.read_preference == ReadPreference::ReplicaFirst =>
            {
                Role::Replica
            }
            Access::Read | Access::Write => Role::Primary,
        }
    }

    /// The store to try after `failed` could not serve the operation, or
    /// `None` when the operation should fail.
    pub fn next_after(&self, access: Access, failed: Role, error: &PdalError) -> Option<Role> {
        match (access, failed) {
            (Access::Read, Role::Replica) if error.allows_failover() => Some(Role::Primary),
            _ => None,
        }
    }
}
