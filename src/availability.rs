//! Tutor-published time slots and the store that owns them.
//!
//! A slot is the single serialization point for "who gets this session":
//! every contender has to win the Free → Locked compare-and-set on its row.
//! Only the orchestrator is allowed to request the Locked target; the rest
//! of the crate uses the store for publication, blocking and listing.

use crate::codec::{decode, encode};
use crate::error::{BookingError, ConflictError, SlotUnavailable, ValidationError};
use crate::ids::{AppointmentId, ServiceId, SlotId, StudentId, TutorId};
use crate::timestamp::TimeStamp;
use chrono::Utc;
use sled::Db;

/// Slots shorter than this are rejected at creation.
pub const MIN_SLOT_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum SlotStatus {
    #[n(0)]
    Free,
    #[n(1)]
    Locked,
    #[n(2)]
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Availability {
    #[n(0)]
    pub id: SlotId,
    #[n(1)]
    pub tutor: TutorId,
    #[n(2)]
    pub service: Option<ServiceId>,
    #[n(3)]
    pub start: TimeStamp<Utc>,
    #[n(4)]
    pub end: TimeStamp<Utc>,
    #[n(5)]
    pub status: SlotStatus,
    #[n(6)]
    pub price_override_cents: Option<u64>,
    /// Set only while the slot is Locked.
    #[n(7)]
    pub bound_requester: Option<StudentId>,
    #[n(8)]
    pub notes: Option<String>,
    /// The appointment occupying this slot. Written in the same transaction
    /// as the appointment itself, cleared when a cancellation unlocks.
    #[n(9)]
    pub appointment: Option<AppointmentId>,
}

// Draft for a new slot, builder style. Validation happens on create.
#[derive(Debug, Clone)]
pub struct NewSlot {
    pub tutor: TutorId,
    pub start: TimeStamp<Utc>,
    pub end: TimeStamp<Utc>,
    pub service: Option<ServiceId>,
    pub price_override_cents: Option<u64>,
    pub notes: Option<String>,
}

impl NewSlot {
    pub fn new(tutor: TutorId, start: TimeStamp<Utc>, end: TimeStamp<Utc>) -> Self {
        Self {
            tutor,
            start,
            end,
            service: None,
            price_override_cents: None,
            notes: None,
        }
    }

    pub fn with_service(mut self, service: ServiceId) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_price_override(mut self, cents: u64) -> Self {
        self.price_override_cents = Some(cents);
        self
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_owned());
        self
    }

    /// Same-day, end-after-start, minimum-duration rules.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.end <= self.start {
            return Err(ValidationError::EndBeforeStart);
        }
        if !self.start.same_calendar_day(&self.end) {
            return Err(ValidationError::CrossesDayBoundary);
        }
        if self.start.minutes_until(&self.end) < MIN_SLOT_MINUTES {
            return Err(ValidationError::BelowMinimumDuration);
        }
        Ok(())
    }
}

impl Availability {
    /// Slot length in whole minutes. Can only be positive for stored slots,
    /// but callers fall back to the service default when it is not.
    pub fn duration_minutes(&self) -> i64 {
        self.start.minutes_until(&self.end)
    }

    pub fn is_free(&self) -> bool {
        self.status == SlotStatus::Free
    }

    pub fn is_locked_by(&self, requester: &StudentId) -> bool {
        self.status == SlotStatus::Locked && self.bound_requester.as_ref() == Some(requester)
    }

    /// The Free → Locked move, bound to `requester`. Re-locking by the same
    /// holder is accepted while no appointment occupies the slot, so a
    /// retried acceptance does not trip over its own earlier lock but a
    /// second booking on a held slot is refused.
    pub fn lock_for(&mut self, requester: &StudentId) -> Result<(), SlotUnavailable> {
        match self.status {
            SlotStatus::Free => {
                self.status = SlotStatus::Locked;
                self.bound_requester = Some(requester.clone());
                Ok(())
            }
            SlotStatus::Locked if self.bound_requester.as_ref() == Some(requester) => {
                if self.appointment.is_some() {
                    return Err(SlotUnavailable::NotBookable);
                }
                Ok(())
            }
            SlotStatus::Locked => Err(SlotUnavailable::LockedByOther),
            SlotStatus::Blocked => Err(SlotUnavailable::NotBookable),
        }
    }

    /// Back to Free, clearing the bound requester and the occupying
    /// appointment. A no-op on a slot that is already Free.
    pub fn unlock(&mut self) {
        self.status = SlotStatus::Free;
        self.bound_requester = None;
        self.appointment = None;
    }
}

/// Filter for free-slot listings.
#[derive(Debug, Clone, Default)]
pub struct SlotFilter {
    pub tutor: Option<TutorId>,
    pub service: Option<ServiceId>,
    /// Keep only slots starting on this calendar day.
    pub day: Option<TimeStamp<Utc>>,
}

impl SlotFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn by_tutor(tutor: TutorId) -> Self {
        Self {
            tutor: Some(tutor),
            ..Self::default()
        }
    }

    pub fn by_service(service: ServiceId) -> Self {
        Self {
            service: Some(service),
            ..Self::default()
        }
    }

    fn matches(&self, slot: &Availability) -> bool {
        if let Some(tutor) = &self.tutor
            && slot.tutor != *tutor
        {
            return false;
        }
        if let Some(service) = &self.service
            && slot.service.as_ref() != Some(service)
        {
            return false;
        }
        if let Some(day) = &self.day
            && !slot.start.same_calendar_day(day)
        {
            return false;
        }
        true
    }
}

#[derive(Clone)]
pub struct AvailabilityStore {
    tree: sled::Tree,
}

impl AvailabilityStore {
    pub fn open(db: &Db) -> Result<Self, BookingError> {
        Ok(Self {
            tree: db.open_tree("availabilities")?,
        })
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.tree
    }

    pub fn create(&self, draft: NewSlot) -> Result<Availability, BookingError> {
        draft.validate()?;

        let slot = Availability {
            id: SlotId::new(),
            tutor: draft.tutor,
            service: draft.service,
            start: draft.start,
            end: draft.end,
            status: SlotStatus::Free,
            price_override_cents: draft.price_override_cents,
            bound_requester: None,
            notes: draft.notes,
            appointment: None,
        };
        self.tree.insert(slot.id.as_bytes(), encode(&slot)?)?;
        Ok(slot)
    }

    pub fn get(&self, id: &SlotId) -> Result<Availability, BookingError> {
        let bytes = self
            .tree
            .get(id.as_bytes())?
            .ok_or_else(|| BookingError::not_found("slot", id.as_str()))?;
        decode(&bytes)
    }

    /// Single-row status move, serialized through `compare_and_swap` on the
    /// stored bytes. Locking must carry a requester; leaving Locked clears
    /// the bound requester. A concurrent writer makes the swap fail, which
    /// surfaces as losing the slot (lock attempts) or a state conflict.
    /// Crate-internal: the orchestrator owns every status move, and its
    /// cross-entity guards must not be bypassable.
    pub(crate) fn transition(
        &self,
        id: &SlotId,
        new_status: SlotStatus,
        requester: Option<&StudentId>,
    ) -> Result<Availability, BookingError> {
        let old_bytes = self
            .tree
            .get(id.as_bytes())?
            .ok_or_else(|| BookingError::not_found("slot", id.as_str()))?;
        let mut slot: Availability = decode(&old_bytes)?;

        match new_status {
            SlotStatus::Locked => {
                let requester =
                    requester.ok_or(ValidationError::MissingField("requester"))?;
                slot.lock_for(requester)?;
            }
            SlotStatus::Free => match slot.status {
                SlotStatus::Free => {}
                SlotStatus::Locked | SlotStatus::Blocked => slot.unlock(),
            },
            SlotStatus::Blocked => match slot.status {
                SlotStatus::Free | SlotStatus::Blocked => slot.status = SlotStatus::Blocked,
                // A held slot cannot be blocked out from under its booking.
                SlotStatus::Locked => return Err(ConflictError::SlotTransition.into()),
            },
        }

        let swap = self.tree.compare_and_swap(
            id.as_bytes(),
            Some(old_bytes),
            Some(encode(&slot)?),
        )?;
        if swap.is_err() {
            return Err(match new_status {
                SlotStatus::Locked => SlotUnavailable::LockedByOther.into(),
                _ => ConflictError::SlotTransition.into(),
            });
        }
        Ok(slot)
    }

    /// Removal is refused while the slot is Locked; a live booking still
    /// points at it.
    pub fn delete(&self, id: &SlotId) -> Result<(), BookingError> {
        let slot = self.get(id)?;
        if slot.status == SlotStatus::Locked {
            return Err(ConflictError::SlotLockedForDelete.into());
        }
        self.tree.remove(id.as_bytes())?;
        Ok(())
    }

    /// Free slots that have not yet ended, optionally narrowed by tutor or
    /// service.
    pub fn list_free(
        &self,
        filter: &SlotFilter,
        now: &TimeStamp<Utc>,
    ) -> Result<Vec<Availability>, BookingError> {
        let mut slots = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let slot: Availability = decode(&bytes)?;
            if slot.is_free() && slot.end >= *now && filter.matches(&slot) {
                slots.push(slot);
            }
        }
        slots.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(slots)
    }

    /// Every stored slot, whatever its status, sorted by start time.
    pub fn list(&self) -> Result<Vec<Availability>, BookingError> {
        let mut slots = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            slots.push(decode::<Availability>(&bytes)?);
        }
        slots.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(slots)
    }

    /// Every slot a tutor has published, whatever its status.
    pub fn list_for_tutor(&self, tutor: &TutorId) -> Result<Vec<Availability>, BookingError> {
        let mut slots = self.list()?;
        slots.retain(|slot| slot.tutor == *tutor);
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Separate db per test; sled holds a file lock on its directory.
    fn store(name: &str) -> anyhow::Result<(tempfile::TempDir, AvailabilityStore)> {
        let temp_dir = tempfile::tempdir()?;
        let db = sled::open(temp_dir.path().join(name))?;
        let store = AvailabilityStore::open(&db)?;
        Ok((temp_dir, store))
    }

    /// A fixed far-future morning, offset in minutes, so the same-day rule
    /// is independent of when the suite runs.
    fn future(minutes: u32) -> TimeStamp<Utc> {
        TimeStamp::new_with(2031, 6, 15, 8, 0, 0).plus_minutes(minutes)
    }

    #[test]
    fn create_enforces_the_slot_rules() -> anyhow::Result<()> {
        let (_dir, store) = store("slot_rules.db")?;
        let tutor = TutorId::new();

        // end before start
        let err = store
            .create(NewSlot::new(tutor.clone(), future(120), future(60)))
            .unwrap_err();
        assert!(matches!(
            err,
            BookingError::Validation(ValidationError::EndBeforeStart)
        ));

        // below the minimum
        let start = TimeStamp::new_with(2027, 5, 3, 10, 0, 0);
        let err = store
            .create(NewSlot::new(
                tutor.clone(),
                start.clone(),
                start.plus_minutes(u32::try_from(MIN_SLOT_MINUTES).unwrap() - 1),
            ))
            .unwrap_err();
        assert!(matches!(
            err,
            BookingError::Validation(ValidationError::BelowMinimumDuration)
        ));

        // happy path
        let slot = store.create(NewSlot::new(tutor, start.clone(), start.plus_minutes(60)))?;
        assert_eq!(slot.status, SlotStatus::Free);
        assert_eq!(slot.bound_requester, None);
        assert_eq!(slot.appointment, None);
        Ok(())
    }

    #[test]
    fn locking_requires_a_requester_and_clears_on_unlock() -> anyhow::Result<()> {
        let (_dir, store) = store("slot_lock.db")?;
        let slot = store.create(NewSlot::new(TutorId::new(), future(60), future(120)))?;
        let student = StudentId::new();

        let err = store
            .transition(&slot.id, SlotStatus::Locked, None)
            .unwrap_err();
        assert!(matches!(
            err,
            BookingError::Validation(ValidationError::MissingField("requester"))
        ));

        let locked = store.transition(&slot.id, SlotStatus::Locked, Some(&student))?;
        assert_eq!(locked.status, SlotStatus::Locked);
        assert_eq!(locked.bound_requester, Some(student.clone()));

        // Re-locking by the holder is accepted, by anyone else refused.
        store.transition(&slot.id, SlotStatus::Locked, Some(&student))?;
        let other = StudentId::new();
        assert!(store
            .transition(&slot.id, SlotStatus::Locked, Some(&other))
            .is_err());

        let freed = store.transition(&slot.id, SlotStatus::Free, None)?;
        assert_eq!(freed.status, SlotStatus::Free);
        assert_eq!(freed.bound_requester, None);
        Ok(())
    }

    #[test]
    fn an_occupied_lock_refuses_even_its_own_holder() {
        let student = StudentId::new();
        let mut slot = Availability {
            id: SlotId::new(),
            tutor: TutorId::new(),
            service: None,
            start: future(60),
            end: future(120),
            status: SlotStatus::Free,
            price_override_cents: None,
            bound_requester: None,
            notes: None,
            appointment: None,
        };

        slot.lock_for(&student).unwrap();
        // Without an appointment the holder may re-enter.
        slot.lock_for(&student).unwrap();

        slot.appointment = Some(AppointmentId::new());
        assert_eq!(
            slot.lock_for(&student).unwrap_err(),
            SlotUnavailable::NotBookable
        );

        slot.unlock();
        assert_eq!(slot.appointment, None);
        assert!(slot.lock_for(&student).is_ok());
    }

    #[test]
    fn locked_slots_cannot_be_deleted_or_blocked() -> anyhow::Result<()> {
        let (_dir, store) = store("slot_delete.db")?;
        let slot = store.create(NewSlot::new(TutorId::new(), future(60), future(120)))?;
        let student = StudentId::new();
        store.transition(&slot.id, SlotStatus::Locked, Some(&student))?;

        assert!(matches!(
            store.delete(&slot.id).unwrap_err(),
            BookingError::Conflict(ConflictError::SlotLockedForDelete)
        ));
        assert!(matches!(
            store
                .transition(&slot.id, SlotStatus::Blocked, None)
                .unwrap_err(),
            BookingError::Conflict(ConflictError::SlotTransition)
        ));

        store.transition(&slot.id, SlotStatus::Free, None)?;
        store.delete(&slot.id)?;
        assert!(store.get(&slot.id).is_err());
        Ok(())
    }

    #[test]
    fn list_free_hides_taken_blocked_and_expired_slots() -> anyhow::Result<()> {
        let (_dir, store) = store("slot_list.db")?;
        let tutor = TutorId::new();
        let service = ServiceId::new();
        let student = StudentId::new();

        let open = store.create(
            NewSlot::new(tutor.clone(), future(60), future(120)).with_service(service.clone()),
        )?;
        let taken = store.create(NewSlot::new(tutor.clone(), future(180), future(240)))?;
        store.transition(&taken.id, SlotStatus::Locked, Some(&student))?;
        let blocked = store.create(NewSlot::new(tutor.clone(), future(300), future(360)))?;
        store.transition(&blocked.id, SlotStatus::Blocked, None)?;
        // Ended yesterday.
        let past_start = TimeStamp::new_with(2020, 1, 6, 10, 0, 0);
        store.create(NewSlot::new(
            tutor.clone(),
            past_start.clone(),
            past_start.plus_minutes(60),
        ))?;

        let free = store.list_free(&SlotFilter::by_tutor(tutor), &TimeStamp::now())?;
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].id, open.id);

        let by_service = store.list_free(&SlotFilter::by_service(service), &TimeStamp::now())?;
        assert_eq!(by_service.len(), 1);
        Ok(())
    }
}
