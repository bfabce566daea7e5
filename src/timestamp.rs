//! UTC timestamps with a stable CBOR encoding.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::cmp::Ordering;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// Ordering cannot be derived: the derive would demand `T: Ord`, which the
// zone markers do not implement. Delegate to the inner `DateTime` instead.
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }

    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }

    /// Whole minutes from `self` to `other`; negative when `other` is earlier.
    pub fn minutes_until(&self, other: &Self) -> i64 {
        (other.0 - self.0).num_minutes()
    }

    pub fn plus_minutes(&self, minutes: u32) -> Self {
        Self(self.0 + chrono::Duration::minutes(i64::from(minutes)))
    }

    /// True when both timestamps fall on the same UTC calendar day.
    pub fn same_calendar_day(&self, other: &Self) -> bool {
        self.0.num_days_from_ce() == other.0.num_days_from_ce()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
