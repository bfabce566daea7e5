//! Confirmed appointments (rendez-vous) and their registry.
//!
//! Upcoming/Ongoing/Completed are derived from the wall clock, but only when
//! a refresh pass runs: status promotion is an explicit per-row
//! compare-and-set executed before reads, never a background job. Cancelled
//! and Completed are terminal; a Rescheduled appointment is still live and
//! keeps being promoted against its new time.

use crate::availability::{Availability, SlotStatus};
use crate::codec::{decode, encode};
use crate::directory::Directory;
use crate::error::{BookingError, ConflictError, ValidationError};
use crate::ids::{AppointmentId, RequestId, ServiceId, SlotId, StudentId, TutorId};
use crate::timestamp::TimeStamp;
use chrono::Utc;
use sled::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AppointmentStatus {
    #[n(0)]
    Upcoming,
    #[n(1)]
    Ongoing,
    #[n(2)]
    Cancelled,
    #[n(3)]
    Rescheduled,
    #[n(4)]
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Appointment {
    #[n(0)]
    pub id: AppointmentId,
    /// The request this booking came from; absent for appointments created
    /// through channels that bypass the ledger.
    #[n(1)]
    pub request: Option<RequestId>,
    #[n(2)]
    pub requester: StudentId,
    #[n(3)]
    pub tutor: TutorId,
    #[n(4)]
    pub service: ServiceId,
    #[n(5)]
    pub slot: SlotId,
    /// Copied from the slot start at creation; moved only by reschedule.
    #[n(6)]
    pub scheduled_at: TimeStamp<Utc>,
    #[n(7)]
    pub duration_minutes: u32,
    #[n(8)]
    pub price_cents: u64,
    #[n(9)]
    pub location: Option<String>,
    #[n(10)]
    pub notes: Option<String>,
    #[n(11)]
    pub status: AppointmentStatus,
    #[n(12)]
    pub cancel_reason: Option<String>,
}

impl Appointment {
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            AppointmentStatus::Upcoming | AppointmentStatus::Ongoing | AppointmentStatus::Rescheduled
        )
    }

    pub fn ends_at(&self) -> TimeStamp<Utc> {
        self.scheduled_at.plus_minutes(self.duration_minutes)
    }

    /// The wall-clock status this appointment should hold at `now`, or None
    /// when no promotion applies. Promotion never regresses and never leaves
    /// a terminal state.
    fn promoted_status(&self, now: &TimeStamp<Utc>) -> Option<AppointmentStatus> {
        if !self.is_live() {
            return None;
        }
        if *now >= self.ends_at() {
            return Some(AppointmentStatus::Completed);
        }
        if *now >= self.scheduled_at && self.status != AppointmentStatus::Ongoing {
            return Some(AppointmentStatus::Ongoing);
        }
        None
    }

    pub fn cancel(&mut self, reason: Option<&str>) -> Result<(), ConflictError> {
        if !self.is_live() {
            return Err(ConflictError::AppointmentClosed);
        }
        self.status = AppointmentStatus::Cancelled;
        self.cancel_reason = reason.map(str::to_owned);
        Ok(())
    }

    /// Moves the session time, not the original slot.
    pub fn reschedule(
        &mut self,
        new_time: TimeStamp<Utc>,
        now: &TimeStamp<Utc>,
    ) -> Result<(), BookingError> {
        if !self.is_live() {
            return Err(ConflictError::AppointmentClosed.into());
        }
        if new_time <= *now {
            return Err(ValidationError::TimeNotInFuture.into());
        }
        self.scheduled_at = new_time;
        self.status = AppointmentStatus::Rescheduled;
        Ok(())
    }

    /// Manual completion ahead of the automatic promotion.
    pub fn complete(&mut self) -> Result<(), ConflictError> {
        if !self.is_live() {
            return Err(ConflictError::AppointmentClosed);
        }
        self.status = AppointmentStatus::Completed;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub request: Option<RequestId>,
    pub requester: StudentId,
    pub tutor: TutorId,
    pub service: ServiceId,
    pub duration_minutes: u32,
    pub price_cents: u64,
    pub location: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AppointmentFilter {
    pub requester: Option<StudentId>,
    pub tutor: Option<TutorId>,
    pub status: Option<AppointmentStatus>,
    /// Keep only sessions scheduled on this calendar day.
    pub day: Option<TimeStamp<Utc>>,
}

impl AppointmentFilter {
    fn matches(&self, appointment: &Appointment) -> bool {
        if let Some(requester) = &self.requester
            && appointment.requester != *requester
        {
            return false;
        }
        if let Some(tutor) = &self.tutor
            && appointment.tutor != *tutor
        {
            return false;
        }
        if let Some(status) = self.status
            && appointment.status != status
        {
            return false;
        }
        if let Some(day) = &self.day
            && !appointment.scheduled_at.same_calendar_day(day)
        {
            return false;
        }
        true
    }
}

#[derive(Clone)]
pub struct AppointmentRegistry {
    tree: sled::Tree,
    directory: Directory,
}

impl AppointmentRegistry {
    pub fn open(db: &Db, directory: Directory) -> Result<Self, BookingError> {
        Ok(Self {
            tree: db.open_tree("appointments")?,
            directory,
        })
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.tree
    }

    /// Books against a slot that must already be Locked. The scheduled time
    /// is copied from the slot start.
    pub fn create(
        &self,
        draft: NewAppointment,
        slot: &Availability,
    ) -> Result<Appointment, BookingError> {
        if slot.status != SlotStatus::Locked {
            return Err(ValidationError::SlotNotLocked.into());
        }
        self.directory.active_student(&draft.requester)?;
        self.directory.active_tutor(&draft.tutor)?;
        self.directory.active_service(&draft.service)?;

        let appointment = Self::build(draft, slot);
        self.tree
            .insert(appointment.id.as_bytes(), encode(&appointment)?)?;
        Ok(appointment)
    }

    /// Assembles the record without touching storage; the orchestrator uses
    /// this inside its transactions after performing the same checks.
    pub(crate) fn build(draft: NewAppointment, slot: &Availability) -> Appointment {
        Appointment {
            id: AppointmentId::new(),
            request: draft.request,
            requester: draft.requester,
            tutor: draft.tutor,
            service: draft.service,
            slot: slot.id.clone(),
            scheduled_at: slot.start.clone(),
            duration_minutes: draft.duration_minutes,
            price_cents: draft.price_cents,
            location: draft.location,
            notes: draft.notes,
            status: AppointmentStatus::Upcoming,
            cancel_reason: None,
        }
    }

    pub fn get(&self, id: &AppointmentId) -> Result<Appointment, BookingError> {
        let bytes = self
            .tree
            .get(id.as_bytes())?
            .ok_or_else(|| BookingError::not_found("appointment", id.as_str()))?;
        decode(&bytes)
    }

    /// Wall-clock promotion pass: Upcoming/Rescheduled → Ongoing → Completed.
    /// Each row is swapped individually against the bytes it was read at, so
    /// a concurrent writer simply wins and the row is picked up on the next
    /// pass. Returns how many rows were promoted.
    pub fn refresh_statuses(&self, now: &TimeStamp<Utc>) -> Result<usize, BookingError> {
        let mut promoted = 0;
        for entry in self.tree.iter() {
            let (key, old_bytes) = entry?;
            let mut appointment: Appointment = decode(&old_bytes)?;
            let Some(next) = appointment.promoted_status(now) else {
                continue;
            };
            appointment.status = next;
            let swap =
                self.tree
                    .compare_and_swap(key, Some(old_bytes), Some(encode(&appointment)?))?;
            if swap.is_ok() {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    pub fn cancel(
        &self,
        id: &AppointmentId,
        reason: Option<&str>,
    ) -> Result<Appointment, BookingError> {
        self.mutate(id, |appointment, _| {
            appointment.cancel(reason).map_err(BookingError::from)
        })
    }

    pub fn reschedule(
        &self,
        id: &AppointmentId,
        new_time: TimeStamp<Utc>,
    ) -> Result<Appointment, BookingError> {
        self.mutate(id, move |appointment, now| {
            appointment.reschedule(new_time, now)
        })
    }

    pub fn complete(&self, id: &AppointmentId) -> Result<Appointment, BookingError> {
        self.mutate(id, |appointment, _| {
            appointment.complete().map_err(BookingError::from)
        })
    }

    fn mutate(
        &self,
        id: &AppointmentId,
        apply: impl FnOnce(&mut Appointment, &TimeStamp<Utc>) -> Result<(), BookingError>,
    ) -> Result<Appointment, BookingError> {
        let old_bytes = self
            .tree
            .get(id.as_bytes())?
            .ok_or_else(|| BookingError::not_found("appointment", id.as_str()))?;
        let mut appointment: Appointment = decode(&old_bytes)?;
        let now = TimeStamp::now();
        apply(&mut appointment, &now)?;

        let swap = self.tree.compare_and_swap(
            id.as_bytes(),
            Some(old_bytes),
            Some(encode(&appointment)?),
        )?;
        if swap.is_err() {
            // Lost the row to a concurrent writer; the precondition may no
            // longer hold, so the caller has to re-read.
            return Err(ConflictError::AppointmentClosed.into());
        }
        Ok(appointment)
    }

    pub fn list(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, BookingError> {
        let mut appointments = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let appointment: Appointment = decode(&bytes)?;
            if filter.matches(&appointment) {
                appointments.push(appointment);
            }
        }
        appointments.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        Ok(appointments)
    }

    /// The live appointment holding a slot, if any. By the locking invariant
    /// there can be at most one.
    pub fn live_appointment_for_slot(
        &self,
        slot: &SlotId,
    ) -> Result<Option<Appointment>, BookingError> {
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let appointment: Appointment = decode(&bytes)?;
            if appointment.slot == *slot && appointment.is_live() {
                return Ok(Some(appointment));
            }
        }
        Ok(None)
    }
}
