//! Database schema: DDL for the contacts tables, schema-version checks,
//! first-run bootstrap of the self contacts, and the temporary-table
//! helpers used for bulk id/value filtering.

use cardbox_core::{ContactId, Timestamp};
use rusqlite::{Connection, params};
use tracing::debug;

use crate::{DbResult, DbVersionTooHighSnafu, LOG_TARGET};

/// Bumped whenever the DDL below changes shape.
pub(crate) const SCHEMA_VERSION: u32 = 1;

/// One `Contacts` table, one child table per detail type, the common
/// `Details` table, and the side tables (relationships, identities, OOB,
/// tombstones).
///
/// `AUTOINCREMENT` on `Contacts` and `Details` keeps removed ids from
/// being reused; tombstones and provenance strings outlive the rows they
/// reference.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS Contacts (
    contactId INTEGER PRIMARY KEY AUTOINCREMENT,
    displayLabel TEXT,
    firstName TEXT,
    lowerFirstName TEXT,
    lastName TEXT,
    lowerLastName TEXT,
    middleName TEXT,
    prefix TEXT,
    suffix TEXT,
    customLabel TEXT,
    syncTarget TEXT NOT NULL DEFAULT 'local',
    created TEXT,
    modified TEXT,
    gender TEXT,
    contactType TEXT NOT NULL DEFAULT 'Contact',
    isFavorite INTEGER NOT NULL DEFAULT 0,
    hasPhoneNumber INTEGER NOT NULL DEFAULT 0,
    hasEmailAddress INTEGER NOT NULL DEFAULT 0,
    hasOnlineAccount INTEGER NOT NULL DEFAULT 0,
    isOnline INTEGER NOT NULL DEFAULT 0,
    isDeactivated INTEGER NOT NULL DEFAULT 0,
    isIncidental INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS Details (
    detailId INTEGER PRIMARY KEY AUTOINCREMENT,
    contactId INTEGER NOT NULL,
    detail TEXT NOT NULL,
    detailUri TEXT,
    linkedDetailUris TEXT,
    contexts TEXT,
    accessConstraints INTEGER NOT NULL DEFAULT 0,
    provenance TEXT,
    modifiable INTEGER,
    nonexportable INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS Addresses (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    street TEXT,
    postOfficeBox TEXT,
    region TEXT,
    locality TEXT,
    postCode TEXT,
    country TEXT,
    subTypes TEXT
);

CREATE TABLE IF NOT EXISTS Anniversaries (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    originalDate TEXT,
    calendarId TEXT,
    event TEXT,
    subType TEXT
);

CREATE TABLE IF NOT EXISTS Avatars (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    imageUrl TEXT,
    videoUrl TEXT,
    avatarMetadata TEXT
);

CREATE TABLE IF NOT EXISTS Birthdays (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    birthday TEXT,
    calendarId TEXT
);

CREATE TABLE IF NOT EXISTS EmailAddresses (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    emailAddress TEXT,
    lowerEmailAddress TEXT
);

CREATE TABLE IF NOT EXISTS Families (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    spouse TEXT,
    children TEXT
);

CREATE TABLE IF NOT EXISTS GeoLocations (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    label TEXT,
    latitude REAL,
    longitude REAL,
    accuracy REAL,
    altitude REAL,
    altitudeAccuracy REAL,
    heading REAL,
    speed REAL,
    timestamp TEXT
);

CREATE TABLE IF NOT EXISTS GlobalPresences (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    presenceState INTEGER,
    timestamp TEXT,
    nickname TEXT,
    customMessage TEXT
);

CREATE TABLE IF NOT EXISTS Guids (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    guid TEXT
);

CREATE TABLE IF NOT EXISTS Hobbies (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    hobby TEXT
);

CREATE TABLE IF NOT EXISTS Nicknames (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    nickname TEXT,
    lowerNickname TEXT
);

CREATE TABLE IF NOT EXISTS Notes (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    note TEXT
);

CREATE TABLE IF NOT EXISTS OnlineAccounts (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    accountUri TEXT,
    lowerAccountUri TEXT,
    protocol TEXT,
    serviceProvider TEXT,
    capabilities TEXT,
    subTypes TEXT,
    accountPath TEXT,
    accountIconPath TEXT,
    enabled INTEGER
);

CREATE TABLE IF NOT EXISTS Organizations (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    name TEXT,
    role TEXT,
    title TEXT,
    location TEXT,
    department TEXT,
    logoUrl TEXT,
    assistantName TEXT
);

CREATE TABLE IF NOT EXISTS OriginMetadata (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    id TEXT,
    groupId TEXT,
    enabled INTEGER
);

CREATE TABLE IF NOT EXISTS PhoneNumbers (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    phoneNumber TEXT,
    normalizedNumber TEXT,
    subTypes TEXT
);

CREATE TABLE IF NOT EXISTS Presences (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    presenceState INTEGER,
    timestamp TEXT,
    nickname TEXT,
    customMessage TEXT
);

CREATE TABLE IF NOT EXISTS Ringtones (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    audioRingtone TEXT,
    videoRingtone TEXT,
    vibrationRingtone TEXT
);

CREATE TABLE IF NOT EXISTS Tags (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    tag TEXT
);

CREATE TABLE IF NOT EXISTS Urls (
    detailId INTEGER PRIMARY KEY REFERENCES Details (detailId),
    contactId INTEGER NOT NULL,
    url TEXT,
    subType TEXT
);

CREATE TABLE IF NOT EXISTS Relationships (
    firstId INTEGER NOT NULL,
    secondId INTEGER NOT NULL,
    type TEXT NOT NULL,
    PRIMARY KEY (firstId, secondId, type)
);

CREATE TABLE IF NOT EXISTS Identities (
    identity INTEGER PRIMARY KEY,
    contactId INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS OOB (
    name TEXT PRIMARY KEY,
    value BLOB,
    compressed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS DeletedContacts (
    contactId INTEGER NOT NULL,
    syncTarget TEXT,
    deleted TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS DetailsContactIdIndex ON Details (contactId);
CREATE INDEX IF NOT EXISTS ContactsSyncTargetIndex ON Contacts (syncTarget);
CREATE INDEX IF NOT EXISTS ContactsModifiedIndex ON Contacts (modified);
CREATE INDEX IF NOT EXISTS ContactsNameIndex ON Contacts (lowerLastName, lowerFirstName);
CREATE INDEX IF NOT EXISTS EmailAddressesIndex ON EmailAddresses (lowerEmailAddress);
CREATE INDEX IF NOT EXISTS PhoneNumbersIndex ON PhoneNumbers (normalizedNumber);
CREATE INDEX IF NOT EXISTS OnlineAccountsIndex ON OnlineAccounts (lowerAccountUri);
CREATE INDEX IF NOT EXISTS NicknamesIndex ON Nicknames (lowerNickname);
CREATE INDEX IF NOT EXISTS RelationshipsSecondIndex ON Relationships (secondId, type);
CREATE INDEX IF NOT EXISTS DeletedContactsIndex ON DeletedContacts (syncTarget, deleted);
"#;

/// Applies pragmas, creates the schema on first run, verifies the stored
/// schema version, and bootstraps the self contacts.
pub(crate) fn prepare_database(conn: &Connection) -> DbResult<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // Returns the resulting mode ("memory" for in-memory databases).
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

    let db_version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if db_version > SCHEMA_VERSION {
        return DbVersionTooHighSnafu {
            db_ver: db_version,
            code_ver: SCHEMA_VERSION,
        }
        .fail();
    }

    conn.execute_batch(SCHEMA_SQL)?;
    // `user_version` takes no bound parameters.
    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;

    bootstrap_self_contacts(conn)?;

    Ok(())
}

/// The database always contains contactId 1 (`local` self) and contactId
/// 2 (`aggregate` self), linked by an `Aggregates` edge and registered
/// under the self identity. Neither is aggregatable nor removable.
fn bootstrap_self_contacts(conn: &Connection) -> DbResult<()> {
    let existing: i64 = conn.query_row("SELECT COUNT(*) FROM Contacts WHERE contactId <= 2", [], |row| {
        row.get(0)
    })?;
    if existing == 2 {
        return Ok(());
    }

    debug!(target: LOG_TARGET, "Bootstrapping self contacts");

    let now = Timestamp::now().to_sql_string();
    conn.execute(
        "INSERT OR IGNORE INTO Contacts (contactId, syncTarget, created, modified) VALUES (?1, 'local', ?3, ?3), (?2, 'aggregate', ?3, ?3)",
        params![ContactId::SELF_LOCAL, ContactId::SELF_AGGREGATE, now],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO Relationships (firstId, secondId, type) VALUES (?1, ?2, 'Aggregates')",
        params![ContactId::SELF_AGGREGATE, ContactId::SELF_LOCAL],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO Identities (identity, contactId) VALUES (?1, ?2)",
        params![crate::identity_ops::IDENTITY_SELF, ContactId::SELF_AGGREGATE],
    )?;

    Ok(())
}

/// (Re)creates a `temp.`-schema single-column table holding contact ids,
/// used to join bulk id sets into queries without huge `IN` lists.
pub(crate) fn create_temp_contact_ids(
    conn: &Connection,
    table: &str,
    ids: impl IntoIterator<Item = ContactId>,
) -> DbResult<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS temp.{table} (contactId INTEGER); DELETE FROM temp.{table};"
    ))?;

    let mut stmt = conn.prepare(&format!("INSERT INTO temp.{table} (contactId) VALUES (?1)"))?;
    for id in ids {
        stmt.execute(params![id])?;
    }
    Ok(())
}

/// (Re)creates a `temp.`-schema single-column table of match values
/// (lowered email addresses, normalized phone numbers, ...).
pub(crate) fn create_temp_values(
    conn: &Connection,
    table: &str,
    values: impl IntoIterator<Item = String>,
) -> DbResult<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS temp.{table} (value TEXT); DELETE FROM temp.{table};"
    ))?;

    let mut stmt = conn.prepare(&format!("INSERT INTO temp.{table} (value) VALUES (?1)"))?;
    for value in values {
        stmt.execute(params![value])?;
    }
    Ok(())
}
