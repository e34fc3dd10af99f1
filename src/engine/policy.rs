//! Pure reservation policy checks. No I/O; every check is deterministic in
//! its inputs.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn validate_date_order(start: NaiveDate, end: NaiveDate) -> Result<(), EngineError> {
    if end < start {
        return Err(EngineError::InvalidDateRange);
    }
    Ok(())
}

pub fn validate_not_in_past(start: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    if start < today {
        return Err(EngineError::PastStartDate);
    }
    Ok(())
}

/// Lead time is counted in whole calendar days from `today`.
pub fn validate_advance_notice(
    start: NaiveDate,
    today: NaiveDate,
    advance_notice_days: i64,
) -> Result<(), EngineError> {
    if (start - today).num_days() < advance_notice_days {
        return Err(EngineError::InsufficientAdvanceNotice {
            required: advance_notice_days,
        });
    }
    Ok(())
}

/// Span is inclusive: a same-day loan counts as one day.
pub fn validate_max_duration(
    start: NaiveDate,
    end: NaiveDate,
    max_loan_days: i64,
) -> Result<(), EngineError> {
    let days = (end - start).num_days() + 1;
    if days > max_loan_days {
        return Err(EngineError::LoanTooLong {
            days,
            max: max_loan_days,
        });
    }
    Ok(())
}

pub fn validate_not_own_tool(borrower_id: Ulid, owner_id: Ulid) -> Result<(), EngineError> {
    if borrower_id == owner_id {
        return Err(EngineError::SelfBooking);
    }
    Ok(())
}

pub fn validate_tool_available(status: ToolStatus) -> Result<(), EngineError> {
    if status != ToolStatus::Available {
        return Err(EngineError::ToolUnavailable(status));
    }
    Ok(())
}

/// Accepts the raw number from the client and yields the stored rating.
pub fn validate_rating(rating: f64) -> Result<u8, EngineError> {
    if rating.fract() != 0.0 || !(1.0..=5.0).contains(&rating) {
        return Err(EngineError::InvalidRating);
    }
    Ok(rating as u8)
}

/// Full creation/reschedule policy. The first violated rule wins, in this
/// order: date order, not in past, tool availability, self-booking, advance
/// notice, max duration.
pub fn validate_reservation(
    tool: &Tool,
    borrower_id: Ulid,
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
) -> Result<DateRange, EngineError> {
    validate_date_order(start, end)?;
    validate_not_in_past(start, today)?;
    validate_tool_available(tool.status)?;
    validate_not_own_tool(borrower_id, tool.owner_id)?;
    validate_advance_notice(start, today, tool.advance_notice_days)?;
    validate_max_duration(start, end, tool.max_loan_days)?;
    Ok(DateRange::new(start, end))
}

/// Guard a lifecycle command against the reservation's current status.
pub fn validate_transition(
    current: ReservationStatus,
    target: ReservationStatus,
    action: &'static str,
) -> Result<(), EngineError> {
    if !current.can_transition_to(target) {
        return Err(EngineError::InvalidStateTransition { action, current });
    }
    Ok(())
}

/// Trim and bound optional free text; blank collapses to `None`.
pub fn clean_text(
    text: Option<String>,
    max_len: usize,
    too_long: &'static str,
) -> Result<Option<String>, EngineError> {
    let Some(text) = text else { return Ok(None) };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > max_len {
        return Err(EngineError::InvalidInput(too_long));
    }
    Ok(Some(trimmed.to_string()))
}

pub fn required_reason(reason: String) -> Result<String, EngineError> {
    clean_text(Some(reason), MAX_REASON_LEN, "reason too long")?
        .ok_or(EngineError::InvalidInput("a reason is required"))
}
