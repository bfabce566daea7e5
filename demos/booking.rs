//! End-to-end walk through the booking engine: publish a slot, reserve it
//! directly, inspect the result, cancel, and watch the slot come back.

use std::sync::Arc;
use tutor_booking::availability::{NewSlot, SlotFilter};
use tutor_booking::service::BookingService;
use tutor_booking::timestamp::TimeStamp;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(dir.path().join("booking.db"))?);
    let service = BookingService::new(db)?;

    let tutor = service.directory().register_tutor("Alice", 4500)?;
    let maths = service.directory().register_service("Maths", 6000, 60)?;
    let student = service.directory().register_student("Bob")?;

    // A fixed future morning; a relative "now + 24h" window would cross a
    // calendar day when run late in the evening.
    let morning = TimeStamp::new_with(2031, 6, 15, 10, 0, 0);
    let slot = service.publish_slot(
        NewSlot::new(tutor.id.clone(), morning.clone(), morning.plus_minutes(60))
            .with_service(maths.id.clone())
            .with_notes("room 12"),
    )?;
    println!("published slot {} ({:?})", slot.id, slot.status);

    let open = service.list_free_slots(&SlotFilter::by_tutor(tutor.id.clone()))?;
    println!("free slots for {}: {}", tutor.name, open.len());

    let appointment = service.reserve_slot(&student.id, &slot.id, Some("exam prep"), None)?;
    println!(
        "reserved: appointment {} at {:?}, {} min, {} cents",
        appointment.id,
        appointment.scheduled_at.to_datetime_utc(),
        appointment.duration_minutes,
        appointment.price_cents
    );
    println!("slot is now {:?}", service.get_slot(&slot.id)?.status);

    let cancelled = service.cancel_appointment(&appointment.id, Some("sick"))?;
    println!("cancelled: {:?}", cancelled.status);
    println!("slot is back to {:?}", service.get_slot(&slot.id)?.status);

    Ok(())
}
