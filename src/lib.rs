//! Reservation orchestration engine for tutoring sessions.
//!
//! Students book slots from a tutor's published availability, either
//! immediately ([`service::BookingService::reserve_slot`]) or through a
//! tutor-reviewed request. An accepted booking locks the slot and creates a
//! confirmed appointment; cancellation frees the slot again.

pub mod appointment;
pub mod availability;
mod codec;
pub mod directory;
pub mod error;
pub mod ids;
pub mod pricing;
pub mod request;
pub mod service;
pub mod timestamp;
