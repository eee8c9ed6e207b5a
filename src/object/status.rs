//! Per-object migration status
//!
//! ```text
//!   InTransfer ──► Transferred ──► InVerification ──► Verified
//!       │  ▲            │                │
//!       ▼  │            ▼                ▼
//!    RetryQueue ◄───────┴────────────────┘
//!       │
//!       ▼
//!     Error
//! ```
//!
//! `Verified` and `Error` end a run. A later run may start a `Verified`
//! object over when its source changed; nothing leaves `Error` short of a
//! forced sync, which begins again from `Queue`. `Queue` is the initial
//! in-memory state and is never the target of a transition.

use std::fmt;
use std::str::FromStr;

/// Status of one object in the migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectStatus {
    /// Discovered, waiting for a sync worker
    Queue,
    /// Data is being copied to the target
    InTransfer,
    /// Copy finished
    Transferred,
    /// Target is being read back and compared
    InVerification,
    /// Read-back comparison succeeded
    Verified,
    /// Failed with retry budget remaining
    RetryQueue,
    /// Failed permanently
    Error,
}

impl ObjectStatus {
    /// All statuses in lifecycle order
    pub const ALL: [ObjectStatus; 7] = [
        ObjectStatus::Queue,
        ObjectStatus::InTransfer,
        ObjectStatus::Transferred,
        ObjectStatus::InVerification,
        ObjectStatus::Verified,
        ObjectStatus::RetryQueue,
        ObjectStatus::Error,
    ];

    /// Value persisted in the `status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Queue => "Queue",
            ObjectStatus::InTransfer => "InTransfer",
            ObjectStatus::Transferred => "Transferred",
            ObjectStatus::InVerification => "InVerification",
            ObjectStatus::Verified => "Verified",
            ObjectStatus::RetryQueue => "RetryQueue",
            ObjectStatus::Error => "Error",
        }
    }

    /// True once the object has reached a successful state
    pub fn is_success(&self) -> bool {
        matches!(self, ObjectStatus::Transferred | ObjectStatus::Verified)
    }

    /// True for states a run stops at
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObjectStatus::Verified | ObjectStatus::Error)
    }

    /// Check whether moving from `self` to `next` is a legal transition
    ///
    /// `self` may be a status stored by an interrupted run, so a new
    /// attempt can start from any state but `Error`.
    pub fn can_transition_to(&self, next: ObjectStatus) -> bool {
        use ObjectStatus::*;

        match (self, next) {
            (Error, _) | (_, Queue) => false,
            (_, InTransfer) | (_, InVerification) => true,
            (InTransfer, Transferred) | (InVerification, Verified) => true,
            (_, Error) => true,
            (current, RetryQueue) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized status string read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown object status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for ObjectStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
