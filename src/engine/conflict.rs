use crate::limits::*;
use crate::model::*;

use super::{ConflictReason, EngineError};

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// `start < end` for caller-supplied bounds, checked before a `Span` is built.
pub(crate) fn validate_order(start: Ms, end: Ms, what: &str) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidArgument(format!(
            "{what} start must be before end"
        )));
    }
    let span = Span::new(start, end);
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_duration(duration_minutes: i64) -> Result<Ms, EngineError> {
    if !(MIN_DURATION_MIN..=MAX_DURATION_MIN).contains(&duration_minutes) {
        return Err(EngineError::InvalidArgument(format!(
            "duration must be between {MIN_DURATION_MIN} and {MAX_DURATION_MIN} minutes, got {duration_minutes}"
        )));
    }
    Ok(duration_minutes * MINUTE_MS)
}

pub(crate) fn validate_window(from: Ms, to: Ms) -> Result<Span, EngineError> {
    let window = validate_order(from, to, "window")?;
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(window)
}

/// First slot other than `exclude` whose interval intersects `span`.
pub(crate) fn find_overlap(cs: &CalendarState, span: Span, exclude: Option<Id>) -> Option<Id> {
    cs.overlapping(span)
        .find(|s| Some(s.id) != exclude)
        .map(|s| s.id)
}

pub(crate) fn has_overlap(cs: &CalendarState, span: Span, exclude: Option<Id>) -> bool {
    find_overlap(cs, span, exclude).is_some()
}

pub(crate) fn check_no_overlap(
    cs: &CalendarState,
    span: Span,
    exclude: Option<Id>,
) -> Result<(), EngineError> {
    match find_overlap(cs, span, exclude) {
        Some(id) => Err(EngineError::OverlapConflict(ConflictReason::OverlapsSlot(id))),
        None => Ok(()),
    }
}

pub(crate) fn ensure_owner(cs: &CalendarState, user_id: Id, slot_id: Id) -> Result<(), EngineError> {
    if cs.owner_id() != user_id {
        tracing::warn!(user_id, slot_id, owner_id = cs.owner_id(), "ownership violation");
        metrics::counter!(crate::observability::OWNERSHIP_VIOLATIONS_TOTAL).increment(1);
        return Err(EngineError::OwnershipViolation { user_id, slot_id });
    }
    Ok(())
}

pub(crate) fn check_version(slot: &Slot, expected: Option<u64>) -> Result<(), EngineError> {
    match expected {
        Some(expected) if expected != slot.version => Err(EngineError::ConcurrentModification {
            slot_id: slot.id,
            expected,
            actual: slot.version,
        }),
        _ => Ok(()),
    }
}
