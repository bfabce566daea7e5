//! End-to-end workflow scenarios against a real sled-backed engine.

use std::sync::Arc;
use tutor_booking::appointment::{AppointmentFilter, AppointmentStatus};
use tutor_booking::availability::{NewSlot, SlotStatus};
use tutor_booking::directory::{Service, Student, Tutor};
use tutor_booking::error::{BookingError, ConflictError, SlotUnavailable, ValidationError};
use tutor_booking::request::{NewRequest, RequestStatus};
use tutor_booking::service::BookingService;
use tutor_booking::timestamp::TimeStamp;

struct World {
    // Held for the lifetime of the test so the db directory outlives sled.
    _temp_dir: tempfile::TempDir,
    engine: BookingService,
    student: Student,
    tutor: Tutor,
    maths: Service,
}

/// Sled uses file-based locking to prevent concurrent access, so only one
/// test can hold the lock at a time. As is good practice in testing create
/// separate databases for each test. The db is created on temp for
/// simplified cleanup.
fn world(flat_price_cents: u64, default_minutes: u32) -> anyhow::Result<World> {
    let temp_dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("scenarios.db"))?);
    let engine = BookingService::new(db)?;

    let student = engine.directory().register_student("Bob")?;
    let tutor = engine.directory().register_tutor("Alice", 4500)?;
    let maths = engine
        .directory()
        .register_service("Maths", flat_price_cents, default_minutes)?;

    Ok(World {
        _temp_dir: temp_dir,
        engine,
        student,
        tutor,
        maths,
    })
}

impl World {
    /// A free far-future slot attached to the maths service. A fixed date
    /// keeps the same-day rule away from whatever wall clock runs the test.
    fn publish_slot(&self, minutes: u32) -> anyhow::Result<tutor_booking::availability::Availability> {
        let start = TimeStamp::new_with(2031, 6, 15, 10, 0, 0);
        let slot = self.engine.publish_slot(
            NewSlot::new(self.tutor.id.clone(), start.clone(), start.plus_minutes(minutes))
                .with_service(self.maths.id.clone()),
        )?;
        Ok(slot)
    }
}

#[test]
fn direct_booking_prices_and_locks_the_slot() -> anyhow::Result<()> {
    // $60 flat for a 60-minute default, booked on a 60-minute slot.
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;

    let appointment = world
        .engine
        .reserve_slot(&world.student.id, &slot.id, Some("exam prep"), None)?;

    assert_eq!(appointment.duration_minutes, 60);
    assert_eq!(appointment.price_cents, 6000);
    assert_eq!(appointment.status, AppointmentStatus::Upcoming);
    assert_eq!(appointment.scheduled_at, slot.start);

    let slot = world.engine.get_slot(&slot.id)?;
    assert_eq!(slot.status, SlotStatus::Locked);
    assert_eq!(slot.bound_requester, Some(world.student.id.clone()));
    assert_eq!(slot.appointment, Some(appointment.id.clone()));

    // The fused request is Accepted, never visibly Pending.
    let request_id = appointment.request.expect("direct booking keeps its request");
    let request = world.engine.get_request(&request_id)?;
    assert_eq!(request.status, RequestStatus::Accepted);
    Ok(())
}

#[test]
fn flat_price_is_pro_rated_to_the_actual_slot_length() -> anyhow::Result<()> {
    // $30 for a 30-minute default, booked on a 60-minute slot → $60.
    let world = world(3000, 30)?;
    let slot = world.publish_slot(60)?;

    let appointment = world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)?;

    assert_eq!(appointment.duration_minutes, 60);
    assert_eq!(appointment.price_cents, 6000);
    Ok(())
}

#[test]
fn accepting_a_slotless_request_is_rejected() -> anyhow::Result<()> {
    let world = world(6000, 60)?;

    let request = world.engine.submit_request(NewRequest::new(
        world.student.id.clone(),
        world.maths.id.clone(),
        world.tutor.id.clone(),
    ))?;

    let err = world.engine.accept_request(&request.id).unwrap_err();
    assert!(matches!(
        err,
        BookingError::Validation(ValidationError::NoSlotToReserve)
    ));

    // The request is untouched by the failed acceptance.
    assert_eq!(
        world.engine.get_request(&request.id)?.status,
        RequestStatus::Pending
    );
    Ok(())
}

#[test]
fn cancelling_frees_the_slot_again() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;

    let appointment = world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)?;
    let cancelled = world
        .engine
        .cancel_appointment(&appointment.id, Some("sick"))?;

    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("sick"));

    let slot = world.engine.get_slot(&slot.id)?;
    assert_eq!(slot.status, SlotStatus::Free);
    assert_eq!(slot.bound_requester, None);

    // Terminal: no second cancel, no reschedule, no completion.
    assert!(matches!(
        world.engine.cancel_appointment(&appointment.id, None),
        Err(BookingError::Conflict(ConflictError::AppointmentClosed))
    ));
    assert!(matches!(
        world
            .engine
            .reschedule_appointment(&appointment.id, TimeStamp::now().plus_minutes(60)),
        Err(BookingError::Conflict(ConflictError::AppointmentClosed))
    ));
    Ok(())
}

#[test]
fn short_slots_are_rejected() -> anyhow::Result<()> {
    let world = world(6000, 60)?;

    let err = world.publish_slot(20).unwrap_err();
    let err = err.downcast::<BookingError>()?;
    assert!(matches!(
        err,
        BookingError::Validation(ValidationError::BelowMinimumDuration)
    ));
    Ok(())
}

#[test]
fn slots_crossing_midnight_are_rejected() -> anyhow::Result<()> {
    let world = world(6000, 60)?;

    let evening = TimeStamp::new_with(2027, 3, 10, 23, 0, 0);
    let next_morning = TimeStamp::new_with(2027, 3, 11, 1, 0, 0);
    let err = world
        .engine
        .publish_slot(NewSlot::new(world.tutor.id.clone(), evening, next_morning))
        .unwrap_err();

    assert!(matches!(
        err,
        BookingError::Validation(ValidationError::CrossesDayBoundary)
    ));
    Ok(())
}

#[test]
fn reviewed_flow_submit_accept() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;

    let request = world.engine.submit_request(
        NewRequest::new(
            world.student.id.clone(),
            world.maths.id.clone(),
            world.tutor.id.clone(),
        )
        .with_slot(slot.id.clone())
        .with_motive("struggling with integrals"),
    )?;
    assert_eq!(request.status, RequestStatus::Pending);
    // Submission does not lock anything.
    assert_eq!(world.engine.get_slot(&slot.id)?.status, SlotStatus::Free);

    let appointment = world.engine.accept_request(&request.id)?;
    assert_eq!(appointment.request, Some(request.id.clone()));
    assert_eq!(appointment.price_cents, 6000);
    assert_eq!(world.engine.get_slot(&slot.id)?.status, SlotStatus::Locked);
    assert_eq!(
        world.engine.get_request(&request.id)?.status,
        RequestStatus::Accepted
    );

    // Accepting again must not create a second appointment.
    let err = world.engine.accept_request(&request.id).unwrap_err();
    assert!(matches!(err, BookingError::Conflict(_)));
    assert_eq!(
        world
            .engine
            .list_appointments(&Default::default())?
            .len(),
        1
    );
    Ok(())
}

#[test]
fn reviewed_flow_refuse_releases_nothing_and_keeps_the_slot_free() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;

    let request = world.engine.submit_request(
        NewRequest::new(
            world.student.id.clone(),
            world.maths.id.clone(),
            world.tutor.id.clone(),
        )
        .with_slot(slot.id.clone())
        .with_motive("original motive"),
    )?;

    let refused = world
        .engine
        .refuse_request(&request.id, Some("fully booked this week"))?;
    assert_eq!(refused.status, RequestStatus::Refused);
    assert_eq!(refused.motive.as_deref(), Some("fully booked this week"));
    assert_eq!(world.engine.get_slot(&slot.id)?.status, SlotStatus::Free);

    // Decisions are monotonic; the refusal cannot be overturned.
    assert!(matches!(
        world.engine.accept_request(&request.id),
        Err(BookingError::Conflict(ConflictError::RequestDecided))
    ));
    Ok(())
}

#[test]
fn booking_an_already_locked_slot_reports_locked_by_other() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;
    let other = world.engine.directory().register_student("Carol")?;

    world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)?;

    let err = world
        .engine
        .reserve_slot(&other.id, &slot.id, None, None)
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::SlotUnavailable(SlotUnavailable::LockedByOther)
    ));

    // Submitting a reviewed request against it fails the same way.
    let err = world
        .engine
        .submit_request(
            NewRequest::new(
                other.id.clone(),
                world.maths.id.clone(),
                world.tutor.id.clone(),
            )
            .with_slot(slot.id.clone()),
        )
        .unwrap_err();
    assert!(matches!(err, BookingError::SlotUnavailable(_)));
    Ok(())
}

#[test]
fn reschedule_moves_the_appointment_not_the_slot() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;

    let appointment = world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)?;

    let new_time = TimeStamp::new_with(2031, 6, 16, 10, 0, 0);
    let moved = world
        .engine
        .reschedule_appointment(&appointment.id, new_time.clone())?;
    assert_eq!(moved.status, AppointmentStatus::Rescheduled);
    assert_eq!(moved.scheduled_at, new_time);

    // The slot keeps its original window and stays locked.
    let stored = world.engine.get_slot(&slot.id)?;
    assert_eq!(stored.start, slot.start);
    assert_eq!(stored.status, SlotStatus::Locked);

    // Times in the past are rejected.
    let err = world
        .engine
        .reschedule_appointment(&appointment.id, TimeStamp::new_with(2020, 1, 1, 9, 0, 0))
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::Validation(ValidationError::TimeNotInFuture)
    ));
    Ok(())
}

#[test]
fn two_racing_reservations_produce_exactly_one_appointment() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;
    let other = world.engine.directory().register_student("Carol")?;

    let engine = Arc::new(world.engine);
    let barrier = Arc::new(std::sync::Barrier::new(2));

    let mut handles = Vec::new();
    for student in [world.student.id.clone(), other.id.clone()] {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        let slot_id = slot.id.clone();
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            engine.reserve_slot(&student, &slot_id, None, None)
        }));
    }

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("reservation thread panicked"))
        .collect();

    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one racer may win the slot");
    for outcome in &outcomes {
        if let Err(err) = outcome {
            assert!(matches!(err, BookingError::SlotUnavailable(_)));
        }
    }

    // The loser left nothing behind: one appointment, one accepted request.
    assert_eq!(engine.list_appointments(&Default::default())?.len(), 1);
    let requests = engine.list_requests(&Default::default())?;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].status, RequestStatus::Accepted);
    Ok(())
}

#[test]
fn a_slot_carries_at_most_one_pending_request() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;
    let other = world.engine.directory().register_student("Carol")?;

    let first = world.engine.submit_request(
        NewRequest::new(
            world.student.id.clone(),
            world.maths.id.clone(),
            world.tutor.id.clone(),
        )
        .with_slot(slot.id.clone()),
    )?;

    // A second submission for the same slot is refused while the first is
    // still pending.
    let err = world
        .engine
        .submit_request(
            NewRequest::new(
                other.id.clone(),
                world.maths.id.clone(),
                world.tutor.id.clone(),
            )
            .with_slot(slot.id.clone()),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::Conflict(ConflictError::SlotAlreadyRequested)
    ));

    // Once the first is decided, the slot can be requested again.
    world.engine.refuse_request(&first.id, None)?;
    assert!(world
        .engine
        .submit_request(
            NewRequest::new(other.id, world.maths.id.clone(), world.tutor.id.clone())
                .with_slot(slot.id.clone()),
        )
        .is_ok());
    Ok(())
}

#[test]
fn a_student_cannot_book_their_own_slot_twice() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;

    world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)?;
    let err = world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::SlotUnavailable(SlotUnavailable::NotBookable)
    ));
    assert_eq!(world.engine.list_appointments(&Default::default())?.len(), 1);

    // Cancelling releases the slot for a fresh booking.
    let held = world.engine.get_slot(&slot.id)?;
    let appointment_id = held.appointment.expect("booked slot records its appointment");
    world.engine.cancel_appointment(&appointment_id, None)?;
    assert!(world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)
        .is_ok());
    Ok(())
}

#[test]
fn same_student_racing_reservations_yield_one_appointment() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;

    let engine = Arc::new(world.engine);
    let barrier = Arc::new(std::sync::Barrier::new(2));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        let student = world.student.id.clone();
        let slot_id = slot.id.clone();
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            engine.reserve_slot(&student, &slot_id, None, None)
        }));
    }

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("reservation thread panicked"))
        .collect();

    // A same-requester lock is re-enterable, but the occupied-slot check
    // inside the transaction must still let only one booking through.
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one booking may land on the slot");
    for outcome in &outcomes {
        if let Err(err) = outcome {
            assert!(matches!(err, BookingError::SlotUnavailable(_)));
        }
    }

    assert_eq!(engine.list_appointments(&Default::default())?.len(), 1);
    assert_eq!(engine.list_requests(&Default::default())?.len(), 1);
    Ok(())
}

#[test]
fn blocked_slots_are_not_bookable_until_unblocked() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;

    world.engine.block_slot(&slot.id)?;
    let err = world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::SlotUnavailable(SlotUnavailable::NotBookable)
    ));
    // Blocked slots never show up in the free listing.
    assert!(world.engine.list_free_slots(&Default::default())?.is_empty());

    world.engine.unblock_slot(&slot.id)?;
    assert!(world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)
        .is_ok());

    // And once booked, the slot can be neither blocked nor deleted.
    assert!(world.engine.block_slot(&slot.id).is_err());
    assert!(matches!(
        world.engine.delete_slot(&slot.id).unwrap_err(),
        BookingError::Conflict(ConflictError::SlotLockedForDelete)
    ));
    Ok(())
}

#[test]
fn appointment_listings_filter_by_day_and_requester() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;
    world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)?;

    let on_day = world.engine.list_appointments(&AppointmentFilter {
        requester: Some(world.student.id.clone()),
        day: Some(TimeStamp::new_with(2031, 6, 15, 0, 0, 0)),
        ..Default::default()
    })?;
    assert_eq!(on_day.len(), 1);

    let other_day = world.engine.list_appointments(&AppointmentFilter {
        day: Some(TimeStamp::new_with(2031, 6, 16, 0, 0, 0)),
        ..Default::default()
    })?;
    assert!(other_day.is_empty());
    Ok(())
}

#[test]
fn inactive_entities_cannot_book() -> anyhow::Result<()> {
    let world = world(6000, 60)?;
    let slot = world.publish_slot(60)?;

    world.engine.directory().deactivate_student(&world.student.id)?;
    let err = world
        .engine
        .reserve_slot(&world.student.id, &slot.id, None, None)
        .unwrap_err();
    assert!(matches!(err, BookingError::Inactive { kind: "student", .. }));

    // The failed attempt took nothing.
    assert_eq!(world.engine.get_slot(&slot.id)?.status, SlotStatus::Free);
    Ok(())
}
