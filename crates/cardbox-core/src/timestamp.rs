use std::fmt;

use snafu::Snafu;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

/// Fixed-width UTC format so that stored timestamps order lexicographically
/// the same way they order chronologically. Millisecond precision.
const SQL_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
);

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

#[derive(Debug, Snafu)]
#[snafu(display("Malformed timestamp `{input}`"))]
pub struct TimestampParseError {
    pub input: String,
}

/// A UTC instant, stored in the database as an ISO-8601 string.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    pub const EPOCH: Self = Self(OffsetDateTime::UNIX_EPOCH);

    /// The current instant, truncated to the stored (millisecond)
    /// precision so that a value written and read back compares equal.
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        let millis = dt.nanosecond() / 1_000_000 * 1_000_000;
        Self(
            dt.to_offset(UtcOffset::UTC)
                .replace_nanosecond(millis)
                .expect("Millisecond truncation is in range"),
        )
    }

    pub fn from_unix_timestamp(secs: i64) -> Result<Self, TimestampParseError> {
        OffsetDateTime::from_unix_timestamp(secs)
            .map(Self)
            .map_err(|_| TimestampParseError {
                input: secs.to_string(),
            })
    }

    pub fn as_datetime(&self) -> OffsetDateTime {
        self.0
    }

    /// The ISO-8601 string bound into SQL statements.
    pub fn to_sql_string(&self) -> String {
        self.0
            .format(SQL_FORMAT)
            .expect("UTC timestamp always formats")
    }

    pub fn parse_sql(input: &str) -> Result<Self, TimestampParseError> {
        use time::PrimitiveDateTime;
        use time::format_description::well_known::Rfc3339;

        if let Ok(dt) = PrimitiveDateTime::parse(input, SQL_FORMAT) {
            return Ok(Self(dt.assume_utc()));
        }
        // Tolerate arbitrary-precision ISO-8601 written by other readers of
        // the same database file.
        OffsetDateTime::parse(input, &Rfc3339)
            .map(Self::from_datetime)
            .map_err(|_| TimestampParseError {
                input: input.to_owned(),
            })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql_string())
    }
}

/// Formats a calendar date the way `Birthday`/`Anniversary` columns store
/// it: `YYYY-MM-DD`, no time component.
pub fn format_date(date: Date) -> String {
    date.format(DATE_FORMAT).expect("Date always formats")
}

pub fn parse_date(input: &str) -> Result<Date, TimestampParseError> {
    Date::parse(input, DATE_FORMAT).map_err(|_| TimestampParseError {
        input: input.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn sql_round_trip() {
        let ts = Timestamp::now();
        let parsed = Timestamp::parse_sql(&ts.to_sql_string()).expect("Round trips");
        assert_eq!(ts, parsed);
    }

    #[test]
    fn sql_strings_order_chronologically() {
        let early = Timestamp::from_datetime(datetime!(2020-01-02 03:04:05.5 UTC));
        let late = Timestamp::from_datetime(datetime!(2020-01-02 03:04:06 UTC));
        assert!(early.to_sql_string() < late.to_sql_string());
    }

    #[test]
    fn date_round_trip() {
        let date = parse_date("1984-02-29").expect("Valid date");
        assert_eq!(format_date(date), "1984-02-29");
    }
}
