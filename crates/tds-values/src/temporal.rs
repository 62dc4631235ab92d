//! Date and time wire layouts.
//!
//! | Type | Layout |
//! |------|--------|
//! | DATE | 3-byte day count since 0001-01-01 |
//! | TIME(n) | 3..5-byte count of 10^-n second units since midnight |
//! | DATETIME2(n) | TIME(n) then DATE |
//! | DATETIMEOFFSET(n) | UTC DATETIME2(n) then i16 offset in minutes |
//! | DATETIME | i32 days since 1900-01-01, u32 1/300 s ticks |
//! | SMALLDATETIME | u16 days since 1900-01-01, u16 minutes |

use bytes::BufMut;
use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike,
};
use tds_protocol::types::time_bytes_for_scale;

use crate::error::ValueError;

const NANOS_PER_SEC: u64 = 1_000_000_000;
const SECS_PER_DAY: u64 = 86_400;

/// Days from 0001-01-01 (CE day 1) to 1900-01-01.
const DAYS_TO_1900: i32 = 693_595;

/// Nanoseconds per unit at `scale`.
const fn unit_nanos(scale: u8) -> u64 {
    let mut n = 1;
    let mut i = scale;
    while i < 9 {
        n *= 10;
        i += 1;
    }
    n
}

/// DATE from a day count.
pub fn date_from_days(days: u32) -> Result<NaiveDate, ValueError> {
    i32::try_from(days)
        .ok()
        .and_then(|d| NaiveDate::from_num_days_from_ce_opt(d + 1))
        .filter(|d| d.year() <= 9999)
        .ok_or(ValueError::DateOutOfRange("DATE"))
}

/// Day count of a DATE.
pub fn days_from_date(date: NaiveDate) -> Result<u32, ValueError> {
    if date.year() < 1 || date.year() > 9999 {
        return Err(ValueError::DateOutOfRange("DATE"));
    }
    Ok((date.num_days_from_ce() - 1) as u32)
}

/// TIME from units of 10^-`scale` seconds.
pub fn time_from_ticks(ticks: u64, scale: u8) -> Result<NaiveTime, ValueError> {
    let nanos = ticks
        .checked_mul(unit_nanos(scale))
        .ok_or(ValueError::DateOutOfRange("TIME"))?;
    let secs = nanos / NANOS_PER_SEC;
    if secs >= SECS_PER_DAY {
        return Err(ValueError::DateOutOfRange("TIME"));
    }
    NaiveTime::from_num_seconds_from_midnight_opt(secs as u32, (nanos % NANOS_PER_SEC) as u32)
        .ok_or(ValueError::DateOutOfRange("TIME"))
}

/// Units of 10^-`scale` seconds since midnight, truncating.
#[must_use]
pub fn ticks_from_time(time: NaiveTime, scale: u8) -> u64 {
    let nanos = u64::from(time.num_seconds_from_midnight()) * NANOS_PER_SEC
        + u64::from(time.nanosecond().min(999_999_999));
    nanos / unit_nanos(scale)
}

/// Read a little-endian unsigned integer of `bytes.len()` bytes.
pub(crate) fn uint_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Write the low `n` bytes of `value` little-endian.
pub(crate) fn put_uint_le(dst: &mut impl BufMut, value: u64, n: usize) {
    dst.put_slice(&value.to_le_bytes()[..n]);
}

/// Decode TIME(scale) bytes.
pub fn decode_time(bytes: &[u8], scale: u8) -> Result<NaiveTime, ValueError> {
    if bytes.len() != time_bytes_for_scale(scale) as usize {
        return Err(ValueError::InvalidLength {
            type_name: "TIME",
            length: bytes.len() as u64,
        });
    }
    time_from_ticks(uint_le(bytes), scale)
}

/// Decode DATETIME2(scale) bytes.
pub fn decode_datetime2(bytes: &[u8], scale: u8) -> Result<NaiveDateTime, ValueError> {
    let time_len = time_bytes_for_scale(scale) as usize;
    if bytes.len() != time_len + 3 {
        return Err(ValueError::InvalidLength {
            type_name: "DATETIME2",
            length: bytes.len() as u64,
        });
    }
    let time = decode_time(&bytes[..time_len], scale)?;
    let date = date_from_days(uint_le(&bytes[time_len..]) as u32)?;
    Ok(date.and_time(time))
}

/// Decode DATETIMEOFFSET(scale) bytes.
pub fn decode_datetimeoffset(bytes: &[u8], scale: u8) -> Result<DateTime<FixedOffset>, ValueError> {
    let split = bytes.len().saturating_sub(2);
    let utc = decode_datetime2(&bytes[..split], scale)?;
    let minutes = i16::from_le_bytes([bytes[split], bytes[split + 1]]);
    let offset = FixedOffset::east_opt(i32::from(minutes) * 60)
        .ok_or(ValueError::DateOutOfRange("DATETIMEOFFSET offset"))?;
    Ok(DateTime::from_naive_utc_and_offset(utc, offset))
}

/// Write TIME(scale).
pub fn encode_time(dst: &mut impl BufMut, time: NaiveTime, scale: u8) {
    put_uint_le(
        dst,
        ticks_from_time(time, scale),
        time_bytes_for_scale(scale) as usize,
    );
}

/// Write DATE.
pub fn encode_date(dst: &mut impl BufMut, date: NaiveDate) -> Result<(), ValueError> {
    put_uint_le(dst, u64::from(days_from_date(date)?), 3);
    Ok(())
}

/// Write DATETIME2(scale).
pub fn encode_datetime2(
    dst: &mut impl BufMut,
    value: NaiveDateTime,
    scale: u8,
) -> Result<(), ValueError> {
    encode_time(dst, value.time(), scale);
    encode_date(dst, value.date())
}

/// Write DATETIMEOFFSET(scale): the UTC instant then the offset.
pub fn encode_datetimeoffset(
    dst: &mut impl BufMut,
    value: DateTime<FixedOffset>,
    scale: u8,
) -> Result<(), ValueError> {
    encode_datetime2(dst, value.naive_utc(), scale)?;
    dst.put_i16_le((value.offset().local_minus_utc() / 60) as i16);
    Ok(())
}

fn base_1900() -> Result<NaiveDate, ValueError> {
    NaiveDate::from_num_days_from_ce_opt(DAYS_TO_1900 + 1).ok_or(ValueError::DateOutOfRange("DATETIME"))
}

/// Decode DATETIME.
pub fn decode_datetime(days: i32, ticks: u32) -> Result<NaiveDateTime, ValueError> {
    if u64::from(ticks) >= SECS_PER_DAY * 300 {
        return Err(ValueError::DateOutOfRange("DATETIME"));
    }
    let date = base_1900()?
        .checked_add_signed(TimeDelta::days(i64::from(days)))
        .ok_or(ValueError::DateOutOfRange("DATETIME"))?;
    let nanos = (u64::from(ticks) * NANOS_PER_SEC + 150) / 300;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(
        (nanos / NANOS_PER_SEC) as u32,
        (nanos % NANOS_PER_SEC) as u32,
    )
    .ok_or(ValueError::DateOutOfRange("DATETIME"))?;
    Ok(date.and_time(time))
}

/// DATETIME day count and 1/300 s ticks, rounding to the nearest tick.
pub fn datetime_parts(value: NaiveDateTime) -> Result<(i32, u32), ValueError> {
    let mut days = (value.date() - base_1900()?).num_days();
    let nanos = u64::from(value.time().num_seconds_from_midnight()) * NANOS_PER_SEC
        + u64::from(value.time().nanosecond().min(999_999_999));
    let mut ticks = (nanos * 300 + NANOS_PER_SEC / 2) / NANOS_PER_SEC;
    if ticks >= SECS_PER_DAY * 300 {
        ticks -= SECS_PER_DAY * 300;
        days += 1;
    }
    let days = i32::try_from(days).map_err(|_| ValueError::DateOutOfRange("DATETIME"))?;
    Ok((days, ticks as u32))
}

/// Decode SMALLDATETIME.
pub fn decode_smalldatetime(days: u16, minutes: u16) -> Result<NaiveDateTime, ValueError> {
    if u32::from(minutes) >= 24 * 60 {
        return Err(ValueError::DateOutOfRange("SMALLDATETIME"));
    }
    let date = base_1900()?
        .checked_add_signed(TimeDelta::days(i64::from(days)))
        .ok_or(ValueError::DateOutOfRange("SMALLDATETIME"))?;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(u32::from(minutes) * 60, 0)
        .ok_or(ValueError::DateOutOfRange("SMALLDATETIME"))?;
    Ok(date.and_time(time))
}

/// SMALLDATETIME day count and minutes, truncating seconds.
pub fn smalldatetime_parts(value: NaiveDateTime) -> Result<(u16, u16), ValueError> {
    let days = (value.date() - base_1900()?).num_days();
    let days = u16::try_from(days).map_err(|_| ValueError::DateOutOfRange("SMALLDATETIME"))?;
    let minutes = (value.time().num_seconds_from_midnight() / 60) as u16;
    Ok((days, minutes))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn date_boundaries() {
        assert_eq!(date_from_days(0).unwrap(), NaiveDate::from_ymd_opt(1, 1, 1).unwrap());
        let max = NaiveDate::from_ymd_opt(9999, 12, 31).unwrap();
        assert_eq!(date_from_days(days_from_date(max).unwrap()).unwrap(), max);
        assert!(date_from_days(days_from_date(max).unwrap() + 1).is_err());
    }

    #[test]
    fn base_1900_is_right() {
        assert_eq!(base_1900().unwrap(), NaiveDate::from_ymd_opt(1900, 1, 1).unwrap());
    }

    #[test]
    fn time_scales() {
        let t = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_900).unwrap();
        assert_eq!(ticks_from_time(t, 7), 863_999_999_999);
        assert_eq!(time_from_ticks(863_999_999_999, 7).unwrap(), t);
        assert_eq!(ticks_from_time(t, 0), 86_399);
        assert!(time_from_ticks(86_400, 0).is_err());
    }

    #[test]
    fn datetime_ticks() {
        let v = decode_datetime(0, 300).unwrap();
        assert_eq!(v, NaiveDate::from_ymd_opt(1900, 1, 1).unwrap().and_hms_opt(0, 0, 1).unwrap());
        assert_eq!(datetime_parts(v).unwrap(), (0, 300));
        let v = decode_datetime(-1, 1).unwrap();
        assert_eq!(datetime_parts(v).unwrap(), (-1, 1));
    }

    #[test]
    fn datetimeoffset_stores_utc() {
        let local = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let value = local.and_local_timezone(offset).unwrap();
        let mut buf = Vec::new();
        encode_datetimeoffset(&mut buf, value, 7).unwrap();
        assert_eq!(&buf[buf.len() - 2..], &120i16.to_le_bytes());
        let utc_time = decode_time(&buf[..5], 7).unwrap();
        assert_eq!(utc_time.hour(), 8);
        assert_eq!(decode_datetimeoffset(&buf, 7).unwrap(), value);
    }
}
