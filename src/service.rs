//! Service layer API for reservation workflow operations.
//!
//! `BookingService` is the only component allowed to lock a slot or create
//! an appointment. Every multi-entity workflow (accept, direct reserve,
//! refuse, cancel) runs inside one sled transaction over the trees it
//! touches: either every step lands or none does, and the slot row check
//! inside the transaction is the compare-and-set that decides slot races.

use crate::appointment::{
    Appointment, AppointmentFilter, AppointmentRegistry, NewAppointment,
};
use crate::availability::{
    Availability, AvailabilityStore, NewSlot, SlotFilter, SlotStatus,
};
use crate::codec;
use crate::directory::{Directory, Service, Tutor};
use crate::error::{BookingError, ConflictError, SlotUnavailable, ValidationError};
use crate::ids::{AppointmentId, RequestId, SlotId, StudentId};
use crate::pricing::session_price_cents;
use crate::request::{NewRequest, Request, RequestFilter, RequestLedger, RequestStatus};
use crate::timestamp::TimeStamp;
use chrono::Utc;
use sled::Transactional;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree,
};
use std::sync::Arc;

type TxResult<T> = Result<T, ConflictableTransactionError<BookingError>>;

fn tx_abort<T>(err: impl Into<BookingError>) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err.into()))
}

fn tx_encode<T: minicbor::Encode<()>>(value: &T) -> TxResult<Vec<u8>> {
    codec::encode(value).map_err(ConflictableTransactionError::Abort)
}

fn tx_decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> TxResult<T> {
    codec::decode(bytes).map_err(ConflictableTransactionError::Abort)
}

fn unwrap_txn<T>(
    result: Result<T, TransactionError<BookingError>>,
) -> Result<T, BookingError> {
    result.map_err(|err| match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => BookingError::Storage(err),
    })
}

pub struct BookingService {
    instance: Arc<sled::Db>,
    directory: Directory,
    slots: AvailabilityStore,
    requests: RequestLedger,
    appointments: AppointmentRegistry,
    /// request id → appointment id, the "exactly one appointment per
    /// accepted request" guard. Written in the same transaction as the
    /// appointment itself.
    by_request: sled::Tree,
}

impl BookingService {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, BookingError> {
        let directory = Directory::open(&instance)?;
        let slots = AvailabilityStore::open(&instance)?;
        let requests = RequestLedger::open(&instance, directory.clone())?;
        let appointments = AppointmentRegistry::open(&instance, directory.clone())?;
        let by_request = instance.open_tree("appointments_by_request")?;
        Ok(Self {
            instance,
            directory,
            slots,
            requests,
            appointments,
            by_request,
        })
    }

    /// Flush sled to disk, for callers that need durability before they
    /// reply.
    pub fn flush(&self) -> Result<(), BookingError> {
        self.instance.flush()?;
        Ok(())
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn slots(&self) -> &AvailabilityStore {
        &self.slots
    }

    pub fn requests(&self) -> &RequestLedger {
        &self.requests
    }

    pub fn appointments(&self) -> &AppointmentRegistry {
        &self.appointments
    }

    // ---- tutor-reviewed flow -------------------------------------------

    /// Files a request for tutor review. A referenced slot must currently be
    /// Free and carry no other pending request, but no lock is taken: the
    /// slot stays up for grabs until a decision is made.
    pub fn submit_request(&self, draft: NewRequest) -> Result<Request, BookingError> {
        if let Some(slot_id) = &draft.slot {
            let slot = self.slots.get(slot_id)?;
            self.check_bookable(&slot, &draft.requester)?;
            if self.requests.pending_for_slot(slot_id)?.is_some() {
                return Err(ConflictError::SlotAlreadyRequested.into());
            }
        }

        let request = self.requests.create(draft, &self.slots)?;
        tracing::info!(request = %request.id, "request submitted");
        Ok(request)
    }

    /// Tutor accepts a pending request: lock the slot, create the
    /// appointment and flip the request in one transaction. A lost slot race
    /// aborts everything and leaves the request Pending.
    pub fn accept_request(&self, request_id: &RequestId) -> Result<Appointment, BookingError> {
        let request = self.requests.get(request_id)?;
        if !request.is_pending() {
            return Err(ConflictError::RequestDecided.into());
        }
        if self.by_request.get(request_id.as_bytes())?.is_some() {
            return Err(ConflictError::RequestAlreadyBooked.into());
        }
        let slot_id = request
            .slot
            .clone()
            .ok_or(ValidationError::NoSlotToReserve)?;
        let slot = self.slots.get(&slot_id)?;
        self.check_bookable(&slot, &request.requester)?;

        self.directory.active_student(&request.requester)?;
        let tutor = self.directory.active_tutor(&request.tutor)?;
        let service = self.directory.active_service(&request.service)?;

        let result = (
            self.slots.tree(),
            self.requests.tree(),
            self.appointments.tree(),
            &self.by_request,
        )
            .transaction(|(slots_t, requests_t, appointments_t, index_t)| {
                let mut request = read_request(requests_t, request_id)?;
                if !request.is_pending() {
                    return tx_abort(ConflictError::RequestDecided);
                }
                if index_t.get(request_id.as_bytes())?.is_some() {
                    return tx_abort(ConflictError::RequestAlreadyBooked);
                }
                // Re-derive the slot from the row inside the transaction; a
                // pending request can still be patched to a different slot.
                let Some(current_slot) = request.slot.clone() else {
                    return tx_abort(ValidationError::NoSlotToReserve);
                };

                let appointment = book_slot_locked(
                    slots_t,
                    appointments_t,
                    index_t,
                    &current_slot,
                    &request,
                    &service,
                    &tutor,
                )?;

                match request.accept() {
                    Ok(()) => {}
                    Err(err) => return tx_abort(err),
                }
                requests_t.insert(request_id.as_bytes(), tx_encode(&request)?)?;

                Ok(appointment)
            });
        let appointment = unwrap_txn(result)?;
        tracing::info!(
            request = %request_id,
            appointment = %appointment.id,
            slot = %appointment.slot,
            "request accepted"
        );
        Ok(appointment)
    }

    /// Tutor turns a pending request down. A slot the request had bound is
    /// released back to Free; if it never got locked this is a no-op.
    pub fn refuse_request(
        &self,
        request_id: &RequestId,
        reason: Option<&str>,
    ) -> Result<Request, BookingError> {
        let result = (self.slots.tree(), self.requests.tree()).transaction(
            |(slots_t, requests_t)| {
                let mut request = read_request(requests_t, request_id)?;
                match request.refuse(reason) {
                    Ok(()) => {}
                    Err(err) => return tx_abort(err),
                }

                if let Some(slot_id) = &request.slot
                    && let Some(bytes) = slots_t.get(slot_id.as_bytes())?
                {
                    let mut slot: Availability = tx_decode(&bytes)?;
                    if slot.is_locked_by(&request.requester) {
                        slot.unlock();
                        slots_t.insert(slot_id.as_bytes(), tx_encode(&slot)?)?;
                    }
                }

                requests_t.insert(request_id.as_bytes(), tx_encode(&request)?)?;
                Ok(request)
            },
        );
        let request = unwrap_txn(result)?;
        tracing::info!(request = %request_id, "request refused");
        Ok(request)
    }

    // ---- direct-booking flow -------------------------------------------

    /// Immediate reservation: request creation and acceptance fused into one
    /// transaction, so no Pending window is ever visible. Losing the slot
    /// race leaves nothing behind.
    pub fn reserve_slot(
        &self,
        requester: &StudentId,
        slot_id: &SlotId,
        motive: Option<&str>,
        priority: Option<crate::request::Priority>,
    ) -> Result<Appointment, BookingError> {
        let slot = self.slots.get(slot_id)?;
        let service_id = slot
            .service
            .clone()
            .ok_or(ValidationError::MissingField("service"))?;
        self.check_bookable(&slot, requester)?;

        self.directory.active_student(requester)?;
        let tutor = self.directory.active_tutor(&slot.tutor)?;
        let service = self.directory.active_service(&service_id)?;

        let result = (
            self.slots.tree(),
            self.requests.tree(),
            self.appointments.tree(),
            &self.by_request,
        )
            .transaction(|(slots_t, requests_t, appointments_t, index_t)| {
                let mut request = Request {
                    id: RequestId::new(),
                    requester: requester.clone(),
                    service: service_id.clone(),
                    tutor: slot.tutor.clone(),
                    slot: Some(slot_id.clone()),
                    motive: motive.map(str::to_owned),
                    priority: priority.unwrap_or_default(),
                    status: RequestStatus::Pending,
                    created_at: TimeStamp::now(),
                    decided_at: None,
                };

                let appointment = book_slot_locked(
                    slots_t,
                    appointments_t,
                    index_t,
                    slot_id,
                    &request,
                    &service,
                    &tutor,
                )?;

                match request.accept() {
                    Ok(()) => {}
                    Err(err) => return tx_abort(err),
                }
                requests_t.insert(request.id.as_bytes(), tx_encode(&request)?)?;

                Ok(appointment)
            });
        let appointment = unwrap_txn(result)?;
        tracing::info!(
            requester = %requester,
            slot = %slot_id,
            appointment = %appointment.id,
            "slot reserved"
        );
        Ok(appointment)
    }

    // ---- cancellation and the rest of the appointment surface ----------

    /// Cancels a live appointment and frees its slot in the same
    /// transaction. An appointment never ends up Cancelled with its slot
    /// still Locked, or the other way around.
    pub fn cancel_appointment(
        &self,
        appointment_id: &AppointmentId,
        reason: Option<&str>,
    ) -> Result<Appointment, BookingError> {
        let result = (self.slots.tree(), self.appointments.tree()).transaction(
            |(slots_t, appointments_t)| {
                let mut appointment = read_appointment(appointments_t, appointment_id)?;
                match appointment.cancel(reason) {
                    Ok(()) => {}
                    Err(err) => return tx_abort(err),
                }

                if let Some(bytes) = slots_t.get(appointment.slot.as_bytes())? {
                    let mut slot: Availability = tx_decode(&bytes)?;
                    if slot.status == SlotStatus::Locked {
                        slot.unlock();
                        slots_t.insert(appointment.slot.as_bytes(), tx_encode(&slot)?)?;
                    }
                }

                appointments_t.insert(appointment_id.as_bytes(), tx_encode(&appointment)?)?;
                Ok(appointment)
            },
        );
        let appointment = unwrap_txn(result)?;
        tracing::info!(appointment = %appointment_id, "appointment cancelled");
        Ok(appointment)
    }

    /// Moves the session to a future time. The original slot is not touched.
    pub fn reschedule_appointment(
        &self,
        appointment_id: &AppointmentId,
        new_time: TimeStamp<Utc>,
    ) -> Result<Appointment, BookingError> {
        let appointment = self.appointments.reschedule(appointment_id, new_time)?;
        tracing::info!(appointment = %appointment_id, "appointment rescheduled");
        Ok(appointment)
    }

    /// Manual completion ahead of the wall-clock promotion.
    pub fn complete_appointment(
        &self,
        appointment_id: &AppointmentId,
    ) -> Result<Appointment, BookingError> {
        self.appointments.complete(appointment_id)
    }

    // ---- slot management ------------------------------------------------

    pub fn publish_slot(&self, draft: NewSlot) -> Result<Availability, BookingError> {
        self.directory.active_tutor(&draft.tutor)?;
        if let Some(service) = &draft.service {
            self.directory.active_service(service)?;
        }
        let slot = self.slots.create(draft)?;
        tracing::info!(slot = %slot.id, tutor = %slot.tutor, "slot published");
        Ok(slot)
    }

    pub fn block_slot(&self, slot_id: &SlotId) -> Result<Availability, BookingError> {
        self.guard_no_live_appointment(slot_id)?;
        self.slots.transition(slot_id, SlotStatus::Blocked, None)
    }

    pub fn unblock_slot(&self, slot_id: &SlotId) -> Result<Availability, BookingError> {
        self.guard_no_live_appointment(slot_id)?;
        self.slots.transition(slot_id, SlotStatus::Free, None)
    }

    pub fn delete_slot(&self, slot_id: &SlotId) -> Result<(), BookingError> {
        self.slots.delete(slot_id)
    }

    // ---- read API -------------------------------------------------------

    pub fn list_free_slots(&self, filter: &SlotFilter) -> Result<Vec<Availability>, BookingError> {
        self.slots.list_free(filter, &TimeStamp::now())
    }

    pub fn get_slot(&self, slot_id: &SlotId) -> Result<Availability, BookingError> {
        self.slots.get(slot_id)
    }

    pub fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, BookingError> {
        self.requests.list(filter)
    }

    pub fn get_request(&self, request_id: &RequestId) -> Result<Request, BookingError> {
        self.requests.get(request_id)
    }

    /// Appointment reads run the promotion pass first, so exposed statuses
    /// reflect the wall clock.
    pub fn list_appointments(
        &self,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, BookingError> {
        self.refresh_appointments()?;
        self.appointments.list(filter)
    }

    pub fn get_appointment(
        &self,
        appointment_id: &AppointmentId,
    ) -> Result<Appointment, BookingError> {
        self.refresh_appointments()?;
        self.appointments.get(appointment_id)
    }

    pub fn refresh_appointments(&self) -> Result<usize, BookingError> {
        let promoted = self.appointments.refresh_statuses(&TimeStamp::now())?;
        if promoted > 0 {
            tracing::debug!(promoted, "appointment statuses promoted");
        }
        Ok(promoted)
    }

    // ---- internals ------------------------------------------------------

    /// Pre-flight slot check for the booking entry points, mapping the slot
    /// state to the user-facing distinction between "someone else holds it"
    /// and "not open for booking".
    fn check_bookable(
        &self,
        slot: &Availability,
        requester: &StudentId,
    ) -> Result<(), BookingError> {
        match slot.status {
            SlotStatus::Free if slot.end >= TimeStamp::now() => Ok(()),
            SlotStatus::Free => Err(SlotUnavailable::NotBookable.into()),
            SlotStatus::Locked if slot.is_locked_by(requester) => {
                // A lock the requester already holds is only re-enterable
                // while no appointment sits on the slot; otherwise this
                // booking would be their second one. `lock_for` repeats the
                // check inside the transaction.
                if slot.appointment.is_some() {
                    return Err(SlotUnavailable::NotBookable.into());
                }
                Ok(())
            }
            SlotStatus::Locked => Err(SlotUnavailable::LockedByOther.into()),
            SlotStatus::Blocked => Err(SlotUnavailable::NotBookable.into()),
        }
    }

    /// No status move on a slot some live appointment still points at.
    /// Owned here because only the orchestrator sees both trees.
    fn guard_no_live_appointment(&self, slot_id: &SlotId) -> Result<(), BookingError> {
        if self.appointments.live_appointment_for_slot(slot_id)?.is_some() {
            return Err(ConflictError::SlotTransition.into());
        }
        Ok(())
    }
}

fn read_request(tree: &TransactionalTree, id: &RequestId) -> TxResult<Request> {
    let Some(bytes) = tree.get(id.as_bytes())? else {
        return tx_abort(BookingError::not_found("request", id.as_str()));
    };
    tx_decode(&bytes)
}

fn read_appointment(tree: &TransactionalTree, id: &AppointmentId) -> TxResult<Appointment> {
    let Some(bytes) = tree.get(id.as_bytes())? else {
        return tx_abort(BookingError::not_found("appointment", id.as_str()));
    };
    tx_decode(&bytes)
}

/// Shared acceptance body: lock the slot for the requester, derive duration
/// and price, and write the appointment plus its by-request index entry.
/// The slot row records the appointment it now carries, so a second booking
/// attempt inside a later transaction fails the `lock_for` re-entry check.
/// The caller flips the request only after this returns.
fn book_slot_locked(
    slots_t: &TransactionalTree,
    appointments_t: &TransactionalTree,
    index_t: &TransactionalTree,
    slot_id: &SlotId,
    request: &Request,
    service: &Service,
    tutor: &Tutor,
) -> TxResult<Appointment> {
    let Some(bytes) = slots_t.get(slot_id.as_bytes())? else {
        return tx_abort(BookingError::not_found("slot", slot_id.as_str()));
    };
    let mut slot: Availability = tx_decode(&bytes)?;
    match slot.lock_for(&request.requester) {
        Ok(()) => {}
        Err(err) => return tx_abort(err),
    }

    let duration_minutes = u32::try_from(slot.duration_minutes())
        .ok()
        .filter(|m| *m > 0)
        .unwrap_or(service.default_duration_minutes);
    let price_cents = session_price_cents(
        service,
        tutor,
        duration_minutes,
        slot.price_override_cents,
    );

    let appointment = AppointmentRegistry::build(
        NewAppointment {
            request: Some(request.id.clone()),
            requester: request.requester.clone(),
            tutor: request.tutor.clone(),
            service: request.service.clone(),
            duration_minutes,
            price_cents,
            location: None,
            notes: None,
        },
        &slot,
    );
    slot.appointment = Some(appointment.id.clone());
    slots_t.insert(slot_id.as_bytes(), tx_encode(&slot)?)?;
    appointments_t.insert(appointment.id.as_bytes(), tx_encode(&appointment)?)?;
    index_t.insert(request.id.as_bytes(), appointment.id.as_bytes())?;

    Ok(appointment)
}
