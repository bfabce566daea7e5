//! Error taxonomy for the reservation engine.
//!
//! Callers route on the top-level variant: `SlotUnavailable` is retryable
//! (someone else got there first), `Validation` means the input itself is
//! wrong, `Conflict` means the entity's state has already moved on and the
//! caller should re-read before retrying.

#[derive(thiserror::Error, Debug)]
pub enum BookingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    SlotUnavailable(#[from] SlotUnavailable),
    #[error("{kind} {id} is inactive")]
    Inactive { kind: &'static str, id: String },
    #[error("storage failure")]
    Storage(#[from] sled::Error),
    #[error("failed to decode stored record: {0}")]
    Codec(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ValidationError {
    #[error("slot must end after it starts")]
    EndBeforeStart,
    #[error("slot is shorter than the 30 minute minimum")]
    BelowMinimumDuration,
    #[error("slot start and end must fall on the same calendar day")]
    CrossesDayBoundary,
    #[error("request has no slot to reserve")]
    NoSlotToReserve,
    #[error("new appointment time must be in the future")]
    TimeNotInFuture,
    #[error("appointment slot must be locked first")]
    SlotNotLocked,
    #[error("required field missing: {0}")]
    MissingField(&'static str),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConflictError {
    #[error("request has already been decided")]
    RequestDecided,
    #[error("an appointment already exists for this request")]
    RequestAlreadyBooked,
    #[error("another pending request already references this slot")]
    SlotAlreadyRequested,
    #[error("appointment is in a terminal state")]
    AppointmentClosed,
    #[error("slot is locked and cannot be deleted")]
    SlotLockedForDelete,
    #[error("slot transition not allowed in its current state")]
    SlotTransition,
}

/// Why a slot could not be taken. Kept apart from [`ConflictError`] so the
/// caller can word "someone else booked it" differently from "not open for
/// booking at all".
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum SlotUnavailable {
    #[error("slot is already locked by another requester")]
    LockedByOther,
    #[error("slot is not in a bookable state")]
    NotBookable,
}

impl BookingError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn inactive(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Inactive {
            kind,
            id: id.into(),
        }
    }
}
