//! CBOR encode/decode helpers shared by the stores.

use crate::error::BookingError;

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, BookingError> {
    minicbor::to_vec(value).map_err(|e| BookingError::Codec(e.to_string()))
}

pub(crate) fn decode<'b, T: minicbor::Decode<'b, ()>>(bytes: &'b [u8]) -> Result<T, BookingError> {
    minicbor::decode(bytes).map_err(|e| BookingError::Codec(e.to_string()))
}
