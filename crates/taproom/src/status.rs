//! Request status lattice.
//!
//! ```text
//! CREATED(0) -> IN_PROGRESS(1) -> { SUCCESS, ERROR, CANCELED, INVALID }(2)
//! ```
//!
//! A transition is legal iff the target rank is >= the source rank and the
//! source is not terminal. The lattice is enforced where a transition is
//! persisted, never on local mutation of a [`Request`](crate::Request) value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Created,
    InProgress,
    Success,
    Error,
    Canceled,
    Invalid,
}

impl RequestStatus {
    /// All statuses that accept no further transitions.
    pub const TERMINAL: [RequestStatus; 4] = [
        RequestStatus::Success,
        RequestStatus::Error,
        RequestStatus::Canceled,
        RequestStatus::Invalid,
    ];

    /// Position in the lattice.
    pub fn rank(self) -> u8 {
        match self {
            RequestStatus::Created => 0,
            RequestStatus::InProgress => 1,
            RequestStatus::Success
            | RequestStatus::Error
            | RequestStatus::Canceled
            | RequestStatus::Invalid => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Created => "CREATED",
            RequestStatus::InProgress => "IN_PROGRESS",
            RequestStatus::Success => "SUCCESS",
            RequestStatus::Error => "ERROR",
            RequestStatus::Canceled => "CANCELED",
            RequestStatus::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(RequestStatus::Created),
            "IN_PROGRESS" => Ok(RequestStatus::InProgress),
            "SUCCESS" => Ok(RequestStatus::Success),
            "ERROR" => Ok(RequestStatus::Error),
            "CANCELED" => Ok(RequestStatus::Canceled),
            "INVALID" => Ok(RequestStatus::Invalid),
            other => Err(format!("Unknown request status: {other}")),
        }
    }
}

/// Rejected status transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusTransitionError {
    #[error("Request is already {from} and cannot move to {to}")]
    FromTerminal {
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("Cannot move request backwards from {from} to {to}")]
    Backwards {
        from: RequestStatus,
        to: RequestStatus,
    },
}

/// Validation of request status transitions.
pub struct StatusMachine;

impl StatusMachine {
    /// Check that persisting `to` over an already-persisted `from` is legal.
    pub fn validate(from: RequestStatus, to: RequestStatus) -> Result<(), StatusTransitionError> {
        if from.is_terminal() {
            return Err(StatusTransitionError::FromTerminal { from, to });
        }
        if to.rank() < from.rank() {
            return Err(StatusTransitionError::Backwards { from, to });
        }
        Ok(())
    }

    pub fn can_transition(from: RequestStatus, to: RequestStatus) -> bool {
        Self::validate(from, to).is_ok()
    }
}
