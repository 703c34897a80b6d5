//! Placement error types.

use thiserror::Error;

/// Placement failures.
///
/// `NotFound` renders the same message whatever the cause; callers that need
/// to tell the causes apart can inspect [`PlacementError::reason`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("no node satisfies the resource request")]
    NotFound { reason: NotFoundReason },
}

impl PlacementError {
    /// Why the scan came up empty.
    pub fn reason(&self) -> NotFoundReason {
        match self {
            Self::NotFound { reason } => *reason,
        }
    }
}

/// Richer classification of a failed scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// The node listing was empty.
    NoNodes,
    /// No node had enough cpu, memory or storage left.
    NoCapacity,
    /// At least one node had capacity but none had a free matching accelerator slot.
    AcceleratorStarved,
}

/// Errors from parsing resource quantities.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity '{0}'")]
    InvalidNumber(String),

    #[error("unknown unit '{unit}' in quantity '{input}'")]
    UnknownUnit { input: String, unit: String },

    #[error("quantity '{0}' must not be negative")]
    Negative(String),
}
