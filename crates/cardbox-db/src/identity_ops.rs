//! Well-known identity map: symbolic names to contact ids.

use cardbox_core::ContactId;
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::{DbResult, UnspecifiedSnafu};

/// The only identity currently defined.
pub(crate) const IDENTITY_SELF: i64 = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    SelfContact,
}

impl Identity {
    pub(crate) fn code(self) -> i64 {
        match self {
            Self::SelfContact => IDENTITY_SELF,
        }
    }
}

pub(crate) fn self_contact_id(conn: &Connection) -> DbResult<ContactId> {
    get_identity(conn, Identity::SelfContact)
}

pub(crate) fn get_identity(conn: &Connection, identity: Identity) -> DbResult<ContactId> {
    conn.query_row(
        "SELECT contactId FROM Identities WHERE identity = ?1",
        params![identity.code()],
        |row| row.get(0),
    )
    .optional()?
    // Written at bootstrap; a missing row means the file was tampered with.
    .ok_or_else(|| {
        UnspecifiedSnafu {
            reason: "identity table is missing the self contact",
        }
        .build()
    })
}

