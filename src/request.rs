//! Booking requests (demandes) and their ledger.
//!
//! A request moves exactly once: Pending → Accepted or Pending → Refused.
//! Both decisions are compare-and-sets on the Pending precondition, so a
//! raced second decision fails instead of overwriting the first.

use crate::availability::AvailabilityStore;
use crate::codec::{decode, encode};
use crate::directory::Directory;
use crate::error::{BookingError, ConflictError};
use crate::ids::{RequestId, ServiceId, SlotId, StudentId, TutorId};
use crate::timestamp::TimeStamp;
use chrono::Utc;
use sled::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, minicbor::Encode, minicbor::Decode)]
pub enum Priority {
    #[n(0)]
    Low,
    #[n(1)]
    #[default]
    Normal,
    #[n(2)]
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    Refused,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Request {
    #[n(0)]
    pub id: RequestId,
    #[n(1)]
    pub requester: StudentId,
    #[n(2)]
    pub service: ServiceId,
    #[n(3)]
    pub tutor: TutorId,
    #[n(4)]
    pub slot: Option<SlotId>,
    #[n(5)]
    pub motive: Option<String>,
    #[n(6)]
    pub priority: Priority,
    #[n(7)]
    pub status: RequestStatus,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub decided_at: Option<TimeStamp<Utc>>,
}

impl Request {
    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    /// Pending → Accepted, rejecting anything already decided.
    pub fn accept(&mut self) -> Result<(), ConflictError> {
        if !self.is_pending() {
            return Err(ConflictError::RequestDecided);
        }
        self.status = RequestStatus::Accepted;
        self.decided_at = Some(TimeStamp::now());
        Ok(())
    }

    /// Pending → Refused. A given reason replaces the stored motive so the
    /// requester sees why.
    pub fn refuse(&mut self, reason: Option<&str>) -> Result<(), ConflictError> {
        if !self.is_pending() {
            return Err(ConflictError::RequestDecided);
        }
        self.status = RequestStatus::Refused;
        self.decided_at = Some(TimeStamp::now());
        if let Some(reason) = reason {
            self.motive = Some(reason.to_owned());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub requester: StudentId,
    pub service: ServiceId,
    pub tutor: TutorId,
    pub slot: Option<SlotId>,
    pub motive: Option<String>,
    pub priority: Priority,
}

impl NewRequest {
    pub fn new(requester: StudentId, service: ServiceId, tutor: TutorId) -> Self {
        Self {
            requester,
            service,
            tutor,
            slot: None,
            motive: None,
            priority: Priority::default(),
        }
    }

    pub fn with_slot(mut self, slot: SlotId) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn with_motive(mut self, motive: &str) -> Self {
        self.motive = Some(motive.to_owned());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Requester-initiated edits, applicable only while the request is Pending.
#[derive(Debug, Clone, Default)]
pub struct RequestPatch {
    pub motive: Option<String>,
    pub priority: Option<Priority>,
    pub slot: Option<SlotId>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub requester: Option<StudentId>,
    pub tutor: Option<TutorId>,
    pub status: Option<RequestStatus>,
}

impl RequestFilter {
    fn matches(&self, request: &Request) -> bool {
        if let Some(requester) = &self.requester
            && request.requester != *requester
        {
            return false;
        }
        if let Some(tutor) = &self.tutor
            && request.tutor != *tutor
        {
            return false;
        }
        if let Some(status) = self.status
            && request.status != status
        {
            return false;
        }
        true
    }
}

#[derive(Clone)]
pub struct RequestLedger {
    tree: sled::Tree,
    directory: Directory,
}

impl RequestLedger {
    pub fn open(db: &Db, directory: Directory) -> Result<Self, BookingError> {
        Ok(Self {
            tree: db.open_tree("requests")?,
            directory,
        })
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.tree
    }

    /// Records a new Pending request. Requester, service and tutor must be
    /// active; a referenced slot must exist, but whether it is still free is
    /// the orchestrator's question, re-checked at acceptance time.
    pub fn create(
        &self,
        draft: NewRequest,
        slots: &AvailabilityStore,
    ) -> Result<Request, BookingError> {
        self.directory.active_student(&draft.requester)?;
        self.directory.active_service(&draft.service)?;
        self.directory.active_tutor(&draft.tutor)?;
        if let Some(slot) = &draft.slot {
            slots.get(slot)?;
        }

        let request = Request {
            id: RequestId::new(),
            requester: draft.requester,
            service: draft.service,
            tutor: draft.tutor,
            slot: draft.slot,
            motive: draft.motive,
            priority: draft.priority,
            status: RequestStatus::Pending,
            created_at: TimeStamp::now(),
            decided_at: None,
        };
        self.tree.insert(request.id.as_bytes(), encode(&request)?)?;
        Ok(request)
    }

    pub fn get(&self, id: &RequestId) -> Result<Request, BookingError> {
        let bytes = self
            .tree
            .get(id.as_bytes())?
            .ok_or_else(|| BookingError::not_found("request", id.as_str()))?;
        decode(&bytes)
    }

    /// The pending request currently referencing `slot`, if any. At most one
    /// may exist at a time; the orchestrator and `update` enforce that rule
    /// through this lookup.
    pub fn pending_for_slot(&self, slot: &SlotId) -> Result<Option<Request>, BookingError> {
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let request: Request = decode(&bytes)?;
            if request.is_pending() && request.slot.as_ref() == Some(slot) {
                return Ok(Some(request));
            }
        }
        Ok(None)
    }

    pub fn accept(&self, id: &RequestId) -> Result<Request, BookingError> {
        self.decide(id, Request::accept)
    }

    pub fn refuse(&self, id: &RequestId, reason: Option<&str>) -> Result<Request, BookingError> {
        self.decide(id, |request| request.refuse(reason))
    }

    fn decide(
        &self,
        id: &RequestId,
        apply: impl FnOnce(&mut Request) -> Result<(), ConflictError>,
    ) -> Result<Request, BookingError> {
        let old_bytes = self
            .tree
            .get(id.as_bytes())?
            .ok_or_else(|| BookingError::not_found("request", id.as_str()))?;
        let mut request: Request = decode(&old_bytes)?;
        apply(&mut request)?;

        let swap =
            self.tree
                .compare_and_swap(id.as_bytes(), Some(old_bytes), Some(encode(&request)?))?;
        if swap.is_err() {
            // Another decision landed between our read and the swap.
            return Err(ConflictError::RequestDecided.into());
        }
        Ok(request)
    }

    /// Edits while Pending only; once decided the record is frozen. A slot
    /// attached through the patch must exist and must not already be
    /// referenced by another pending request.
    pub fn update(
        &self,
        id: &RequestId,
        patch: RequestPatch,
        slots: &AvailabilityStore,
    ) -> Result<Request, BookingError> {
        let old_bytes = self
            .tree
            .get(id.as_bytes())?
            .ok_or_else(|| BookingError::not_found("request", id.as_str()))?;
        let mut request: Request = decode(&old_bytes)?;
        if !request.is_pending() {
            return Err(ConflictError::RequestDecided.into());
        }

        if let Some(slot) = patch.slot {
            slots.get(&slot)?;
            if let Some(existing) = self.pending_for_slot(&slot)?
                && existing.id != *id
            {
                return Err(ConflictError::SlotAlreadyRequested.into());
            }
            request.slot = Some(slot);
        }
        if let Some(motive) = patch.motive {
            request.motive = Some(motive);
        }
        if let Some(priority) = patch.priority {
            request.priority = priority;
        }

        let swap =
            self.tree
                .compare_and_swap(id.as_bytes(), Some(old_bytes), Some(encode(&request)?))?;
        if swap.is_err() {
            return Err(ConflictError::RequestDecided.into());
        }
        Ok(request)
    }

    pub fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>, BookingError> {
        let mut requests = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let request: Request = decode(&bytes)?;
            if filter.matches(&request) {
                requests.push(request);
            }
        }
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(requests)
    }
}
