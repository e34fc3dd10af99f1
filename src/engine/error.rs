use thiserror::Error;
use ulid::Ulid;

use crate::model::{PhotoKind, ReservationStatus};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("not authorized: {0}")]
    NotAuthorized(&'static str),
    #[error("invalid date range: end date must not be before start date")]
    InvalidDateRange,
    #[error("start date is in the past")]
    PastStartDate,
    #[error("this tool requires at least {required} days advance notice")]
    InsufficientAdvanceNotice { required: i64 },
    #[error("loan of {days} days exceeds the maximum of {max} days")]
    LoanTooLong { days: i64, max: i64 },
    #[error("cannot reserve your own tool")]
    SelfBooking,
    #[error("tool is not available for reservation (status: {0})")]
    ToolUnavailable(crate::model::ToolStatus),
    #[error("dates conflict with reservation {0}")]
    DateConflict(Ulid),
    #[error("cannot {action} a reservation with status {current}")]
    InvalidStateTransition {
        action: &'static str,
        current: ReservationStatus,
    },
    #[error("at least one {0} photo is required")]
    MissingRequiredPhoto(PhotoKind),
    #[error("rating must be a whole number between 1 and 5")]
    InvalidRating,
    #[error("you have already reviewed this reservation")]
    DuplicateReview,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Stable tag surfaced to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "NotFound",
            EngineError::NotAuthorized(_) => "NotAuthorized",
            EngineError::InvalidDateRange => "InvalidDateRange",
            EngineError::PastStartDate => "PastStartDate",
            EngineError::InsufficientAdvanceNotice { .. } => "InsufficientAdvanceNotice",
            EngineError::LoanTooLong { .. } => "LoanTooLong",
            EngineError::SelfBooking => "SelfBooking",
            EngineError::ToolUnavailable(_) => "ToolUnavailable",
            EngineError::DateConflict(_) => "DateConflict",
            EngineError::InvalidStateTransition { .. } => "InvalidStateTransition",
            EngineError::MissingRequiredPhoto(_) => "MissingRequiredPhoto",
            EngineError::InvalidRating => "InvalidRating",
            EngineError::DuplicateReview => "DuplicateReview",
            EngineError::InvalidInput(_) => "InvalidInput",
            EngineError::Storage(_) => "Storage",
        }
    }

    /// HTTP-style status intent for the transport layer.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::NotAuthorized(_) => 403,
            EngineError::DateConflict(_)
            | EngineError::InvalidStateTransition { .. }
            | EngineError::DuplicateReview => 409,
            EngineError::Storage(_) => 500,
            _ => 400,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::StatusMismatch { current, .. } => EngineError::InvalidStateTransition {
                action: "update",
                current,
            },
            StoreError::DuplicateReview => EngineError::DuplicateReview,
            StoreError::LimitExceeded(msg) => EngineError::InvalidInput(msg),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_details() {
        let e = EngineError::InsufficientAdvanceNotice { required: 7 };
        assert!(e.to_string().contains('7'));

        let e = EngineError::InvalidStateTransition {
            action: "approve",
            current: ReservationStatus::Confirmed,
        };
        assert_eq!(e.to_string(), "cannot approve a reservation with status confirmed");
        assert_eq!(e.kind(), "InvalidStateTransition");
        assert_eq!(e.status_code(), 409);
    }

    #[test]
    fn status_codes() {
        assert_eq!(EngineError::NotFound(Ulid::new()).status_code(), 404);
        assert_eq!(EngineError::NotAuthorized("owner only").status_code(), 403);
        assert_eq!(EngineError::LoanTooLong { days: 16, max: 7 }.status_code(), 400);
        assert_eq!(EngineError::DateConflict(Ulid::new()).status_code(), 409);
        assert_eq!(EngineError::Storage("disk".into()).status_code(), 500);
    }

    #[test]
    fn store_mismatch_maps_to_state_transition() {
        let e: EngineError = StoreError::StatusMismatch {
            expected: ReservationStatus::Pending,
            current: ReservationStatus::Cancelled,
        }
        .into();
        assert!(matches!(
            e,
            EngineError::InvalidStateTransition { current: ReservationStatus::Cancelled, .. }
        ));
        assert!(e.to_string().contains("cancelled"));
    }
}
