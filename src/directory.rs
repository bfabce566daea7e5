//! Directory of the people and services bookings refer to.
//!
//! The engine does not authenticate anyone; it only checks that the ids a
//! caller hands in exist and are still active. Those lookups live here, in
//! three sled trees keyed by entity id.

use crate::codec::{decode, encode};
use crate::error::BookingError;
use crate::ids::{ServiceId, StudentId, TutorId};
use sled::Db;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Student {
    #[n(0)]
    pub id: StudentId,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Tutor {
    #[n(0)]
    pub id: TutorId,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub is_active: bool,
    /// Cents per hour. Zero means the tutor has no hourly rate.
    #[n(3)]
    pub hourly_rate_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Service {
    #[n(0)]
    pub id: ServiceId,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub is_active: bool,
    /// Flat price in cents for one session of `default_duration_minutes`.
    /// Zero means the service has no flat price.
    #[n(3)]
    pub flat_price_cents: u64,
    #[n(4)]
    pub default_duration_minutes: u32,
}

/// Lookup layer over the three entity trees.
#[derive(Clone)]
pub struct Directory {
    students: sled::Tree,
    tutors: sled::Tree,
    services: sled::Tree,
}

impl Directory {
    pub fn open(db: &Db) -> Result<Self, BookingError> {
        Ok(Self {
            students: db.open_tree("students")?,
            tutors: db.open_tree("tutors")?,
            services: db.open_tree("services")?,
        })
    }

    pub fn register_student(&self, name: &str) -> Result<Student, BookingError> {
        let student = Student {
            id: StudentId::new(),
            name: name.to_owned(),
            is_active: true,
        };
        self.students
            .insert(student.id.as_bytes(), encode(&student)?)?;
        Ok(student)
    }

    pub fn register_tutor(&self, name: &str, hourly_rate_cents: u64) -> Result<Tutor, BookingError> {
        let tutor = Tutor {
            id: TutorId::new(),
            name: name.to_owned(),
            is_active: true,
            hourly_rate_cents,
        };
        self.tutors.insert(tutor.id.as_bytes(), encode(&tutor)?)?;
        Ok(tutor)
    }

    pub fn register_service(
        &self,
        name: &str,
        flat_price_cents: u64,
        default_duration_minutes: u32,
    ) -> Result<Service, BookingError> {
        let service = Service {
            id: ServiceId::new(),
            name: name.to_owned(),
            is_active: true,
            flat_price_cents,
            default_duration_minutes,
        };
        self.services
            .insert(service.id.as_bytes(), encode(&service)?)?;
        Ok(service)
    }

    pub fn student(&self, id: &StudentId) -> Result<Student, BookingError> {
        let bytes = self
            .students
            .get(id.as_bytes())?
            .ok_or_else(|| BookingError::not_found("student", id.as_str()))?;
        decode(&bytes)
    }

    pub fn tutor(&self, id: &TutorId) -> Result<Tutor, BookingError> {
        let bytes = self
            .tutors
            .get(id.as_bytes())?
            .ok_or_else(|| BookingError::not_found("tutor", id.as_str()))?;
        decode(&bytes)
    }

    pub fn service(&self, id: &ServiceId) -> Result<Service, BookingError> {
        let bytes = self
            .services
            .get(id.as_bytes())?
            .ok_or_else(|| BookingError::not_found("service", id.as_str()))?;
        decode(&bytes)
    }

    /// Load a student and reject soft-deleted ones.
    pub fn active_student(&self, id: &StudentId) -> Result<Student, BookingError> {
        let student = self.student(id)?;
        if !student.is_active {
            return Err(BookingError::inactive("student", id.as_str()));
        }
        Ok(student)
    }

    pub fn active_tutor(&self, id: &TutorId) -> Result<Tutor, BookingError> {
        let tutor = self.tutor(id)?;
        if !tutor.is_active {
            return Err(BookingError::inactive("tutor", id.as_str()));
        }
        Ok(tutor)
    }

    pub fn active_service(&self, id: &ServiceId) -> Result<Service, BookingError> {
        let service = self.service(id)?;
        if !service.is_active {
            return Err(BookingError::inactive("service", id.as_str()));
        }
        Ok(service)
    }

    pub fn deactivate_student(&self, id: &StudentId) -> Result<(), BookingError> {
        let mut student = self.student(id)?;
        student.is_active = false;
        self.students.insert(id.as_bytes(), encode(&student)?)?;
        Ok(())
    }

    pub fn deactivate_tutor(&self, id: &TutorId) -> Result<(), BookingError> {
        let mut tutor = self.tutor(id)?;
        tutor.is_active = false;
        self.tutors.insert(id.as_bytes(), encode(&tutor)?)?;
        Ok(())
    }

    pub fn deactivate_service(&self, id: &ServiceId) -> Result<(), BookingError> {
        let mut service = self.service(id)?;
        service.is_active = false;
        self.services.insert(id.as_bytes(), encode(&service)?)?;
        Ok(())
    }
}
