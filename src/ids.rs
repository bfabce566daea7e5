//! Opaque per-entity identifiers.
//!
//! Every stored entity is keyed by a uuid7 encoded with bech32 under a
//! prefix naming the entity kind (`slot1…`, `req1…`, and so on). Each kind
//! gets its own newtype so a request id cannot be handed to an API that
//! expects a slot id.

use bech32::Bech32m;
use uuid7::uuid7;

// A 16-byte payload is far below the bech32 length ceiling, so encoding a
// fresh uuid under a known-valid prefix cannot fail.
fn new_prefixed_id(hrp: &str) -> String {
    let hrp = bech32::Hrp::parse_unchecked(hrp);
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes()).expect("bech32 encode of 16-byte uuid")
}

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident, $hrp:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
        )]
        #[cbor(transparent)]
        pub struct $name(#[n(0)] String);

        impl $name {
            pub fn new() -> Self {
                Self(new_prefixed_id($hrp))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

entity_id!(
    /// Identifies an [`Availability`](crate::availability::Availability) slot.
    SlotId,
    "slot"
);
entity_id!(
    /// Identifies a booking [`Request`](crate::request::Request).
    RequestId,
    "req"
);
entity_id!(
    /// Identifies a confirmed [`Appointment`](crate::appointment::Appointment).
    AppointmentId,
    "rdv"
);
entity_id!(StudentId, "stu");
entity_id!(TutorId, "tut");
entity_id!(ServiceId, "svc");
