use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};

// NaiveDate/Time construction can panic if given invalid values, but 1601-01-01 00:00:00 is valid.
const WINDOWS_EPOCH_NAIVE: NaiveDateTime = match NaiveDate::from_ymd_opt(1601, 1, 1) {
    Some(date) => match date.and_hms_opt(0, 0, 0) {
        Some(datetime) => datetime,
        None => panic!("Invalid time component for Windows epoch constant"),
    },
    None => panic!("Invalid date component for Windows epoch constant"),
};
const WINDOWS_EPOCH_UTC: DateTime<Utc> =
    DateTime::<Utc>::from_naive_utc_and_offset(WINDOWS_EPOCH_NAIVE, Utc);

const TICKS_PER_SECOND: u64 = 10_000_000;
const NANOS_PER_TICK: u64 = 100;

/// Converts a FILETIME (100-nanosecond intervals since 1601-01-01 UTC) to a UTC datetime.
///
/// Every `u64` tick count lands well inside chrono's supported range, so this never fails.
pub fn filetime_to_datetime(filetime: u64) -> DateTime<Utc> {
    let secs_since_windows_epoch = filetime / TICKS_PER_SECOND;
    let nanos_remainder = (filetime % TICKS_PER_SECOND) * NANOS_PER_TICK;

    let duration_since_windows_epoch = ChronoDuration::seconds(secs_since_windows_epoch as i64)
        + ChronoDuration::nanoseconds(nanos_remainder as i64);

    WINDOWS_EPOCH_UTC + duration_since_windows_epoch
}

/// Converts a UTC datetime back to a FILETIME.
///
/// Returns `None` for datetimes before 1601-01-01 or past the FILETIME range.
/// Sub-tick precision is truncated.
pub fn datetime_to_filetime(datetime: DateTime<Utc>) -> Option<u64> {
    let since_epoch = datetime.signed_duration_since(WINDOWS_EPOCH_UTC);
    if since_epoch < ChronoDuration::zero() {
        return None;
    }

    let secs = u64::try_from(since_epoch.num_seconds()).ok()?;
    let ticks = u64::from(since_epoch.subsec_nanos().unsigned_abs()) / NANOS_PER_TICK;

    secs.checked_mul(TICKS_PER_SECOND)?.checked_add(ticks)
}
