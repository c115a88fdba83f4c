use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Database-local identifier of a contact row.
///
/// Stored ids are nonzero 32-bit integers. The zero value marks a record
/// that has not been saved yet; the engine assigns a real id on creation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContactId(u32);

impl ContactId {
    /// The id of a record that has not been written to the database.
    pub const UNSAVED: Self = Self(0);
    /// The `local` self contact, created when the database is initialized.
    pub const SELF_LOCAL: Self = Self(1);
    /// The `aggregate` self contact, created when the database is
    /// initialized.
    pub const SELF_AGGREGATE: Self = Self(2);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_unsaved(self) -> bool {
        self.0 == 0
    }

    /// True for the two well-known self contact rows.
    pub const fn is_self(self) -> bool {
        self.0 == Self::SELF_LOCAL.0 || self.0 == Self::SELF_AGGREGATE.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for ContactId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl FromStr for ContactId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of a stored detail, assigned by the database on insertion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DetailId(u32);

impl DetailId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DetailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for DetailId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl FromStr for DetailId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[cfg(feature = "rusqlite")]
mod sql {
    use rusqlite::ToSql;
    use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};

    use super::{ContactId, DetailId};

    impl ToSql for ContactId {
        fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
            Ok(ToSqlOutput::from(i64::from(self.0)))
        }
    }

    impl FromSql for ContactId {
        fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
            let raw = i64::column_result(value)?;
            u32::try_from(raw)
                .map(ContactId)
                .map_err(|_| FromSqlError::OutOfRange(raw))
        }
    }

    impl ToSql for DetailId {
        fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
            Ok(ToSqlOutput::from(i64::from(self.0)))
        }
    }

    impl FromSql for DetailId {
        fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
            let raw = i64::column_result(value)?;
            u32::try_from(raw)
                .map(DetailId)
                .map_err(|_| FromSqlError::OutOfRange(raw))
        }
    }
}
