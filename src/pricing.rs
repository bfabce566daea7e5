//! Session price derivation.
//!
//! Everything is integer cents. The resolution order: a per-slot price
//! override is charged as-is; otherwise a flat service price is pro-rated to
//! the actual duration; otherwise the tutor's hourly rate applies; otherwise
//! the session is free. Missing or zero inputs never error, they fall
//! through to the next rule.

use crate::directory::{Service, Tutor};

/// `numerator / denominator` rounded half-up. Zero denominator resolves to
/// zero rather than dividing.
fn div_round_half_up(numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return 0;
    }
    (numerator + denominator / 2) / denominator
}

/// Price in cents for a session of `duration_minutes`.
pub fn session_price_cents(
    service: &Service,
    tutor: &Tutor,
    duration_minutes: u32,
    price_override_cents: Option<u64>,
) -> u64 {
    if let Some(cents) = price_override_cents {
        return cents;
    }

    let minutes = u64::from(duration_minutes);
    if service.flat_price_cents > 0 && service.default_duration_minutes > 0 {
        return div_round_half_up(
            service.flat_price_cents * minutes,
            u64::from(service.default_duration_minutes),
        );
    }
    if tutor.hourly_rate_cents > 0 {
        return div_round_half_up(tutor.hourly_rate_cents * minutes, 60);
    }
    0
}
