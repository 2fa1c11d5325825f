use crate::model::Id;

/// Entity kinds that can be missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User,
    /// Looked up by owner id, not by calendar id.
    Calendar,
    Slot,
    Meeting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Candidate interval intersects this existing slot.
    OverlapsSlot(Id),
    /// Slot cannot be freed while a meeting is attached.
    MeetingAttached(Id),
    /// Slot is already busy or booked.
    SlotNotFree(Id),
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Entity, Id),
    OwnershipViolation { user_id: Id, slot_id: Id },
    OverlapConflict(ConflictReason),
    InvalidArgument(String),
    ConcurrentModification { slot_id: Id, expected: u64, actual: u64 },
    AlreadyExists(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(Entity::User, id) => write!(f, "user not found: {id}"),
            EngineError::NotFound(Entity::Calendar, owner) => {
                write!(f, "calendar not found for user: {owner}")
            }
            EngineError::NotFound(Entity::Slot, id) => write!(f, "slot not found: {id}"),
            EngineError::NotFound(Entity::Meeting, id) => write!(f, "meeting not found: {id}"),
            EngineError::OwnershipViolation { user_id, slot_id } => {
                write!(f, "slot {slot_id} does not belong to the calendar of user {user_id}")
            }
            EngineError::OverlapConflict(ConflictReason::OverlapsSlot(id)) => {
                write!(f, "overlapping slot exists: {id}")
            }
            EngineError::OverlapConflict(ConflictReason::MeetingAttached(id)) => {
                write!(f, "cannot mark slot {id} FREE: slot has a meeting")
            }
            EngineError::OverlapConflict(ConflictReason::SlotNotFree(id)) => {
                write!(f, "slot {id} not available")
            }
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::ConcurrentModification {
                slot_id,
                expected,
                actual,
            } => write!(
                f,
                "slot {slot_id} was modified concurrently (expected version {expected}, found {actual}); retry"
            ),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Short, stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "not_found",
            EngineError::OwnershipViolation { .. } => "ownership_violation",
            EngineError::OverlapConflict(_) => "overlap_conflict",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::ConcurrentModification { .. } => "concurrent_modification",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}
