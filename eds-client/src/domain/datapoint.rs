use std::time::Duration;

use time::OffsetDateTime;

/// One reading taken from the sensor gateway.
///
/// `temperature` and `watt_hours` default to zero when the device omits the
/// field or reports something unparseable.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Datapoint {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub time: OffsetDateTime,
    pub temperature: f64,
    pub watt_hours: i64,
}

impl Datapoint {
    pub fn new(time: OffsetDateTime) -> Self {
        Self {
            time,
            temperature: 0.0,
            watt_hours: 0,
        }
    }
}

/// Round `ts` down to the nearest multiple of `interval` since the Unix epoch.
///
/// A zero interval leaves `ts` untouched.
pub fn truncate(ts: OffsetDateTime, interval: Duration) -> OffsetDateTime {
    let step = interval.as_nanos() as i128;
    if step == 0 {
        return ts;
    }

    let nanos = ts.unix_timestamp_nanos();
    let floored = nanos.div_euclid(step) * step;
    OffsetDateTime::from_unix_timestamp_nanos(floored).unwrap_or(ts)
}
