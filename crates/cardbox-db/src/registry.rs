//! Detail schema registry.
//!
//! A static table describing every detail type the engine stores: which
//! table its rows live in (or whether its data is denormalized onto the
//! `Contacts` row), its column set, which columns get case-folded or
//! phone-normalized companions, whether a contact may hold at most one
//! instance, and how the type behaves under aggregate composition.
//!
//! This table is the single source of truth. The contact store's generic
//! bind/extract logic, the write pipeline's constraint checks, the
//! aggregation engine's promotion rules, and the sync protocol all consult
//! it; registering a new detail type here is the only step needed to
//! persist it.

use cardbox_core::detail::{DetailKind, fields};

/// Semantic kind of a stored column. Drives binding and extraction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// `;`-joined in storage, element-wise in memory.
    TextList,
    Int,
    Bool,
    Real,
    /// `YYYY-MM-DD`, no time component.
    Date,
    /// ISO-8601 UTC string.
    Timestamp,
    Blob,
}

/// Transformation producing a derived companion column on write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transform {
    /// Case-folded copy for matching without per-query `lower()`.
    Lower,
    /// Normalized phone-number form.
    NormalizePhone,
}

#[derive(Copy, Clone, Debug)]
pub struct DerivedColumn {
    pub column: &'static str,
    pub transform: Transform,
}

#[derive(Copy, Clone, Debug)]
pub struct FieldSchema {
    pub name: &'static str,
    pub kind: FieldKind,
    pub derived: Option<DerivedColumn>,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSchema {
    FieldSchema {
        name,
        kind,
        derived: None,
    }
}

const fn lowered(name: &'static str, column: &'static str) -> FieldSchema {
    FieldSchema {
        name,
        kind: FieldKind::Text,
        derived: Some(DerivedColumn {
            column,
            transform: Transform::Lower,
        }),
    }
}

#[derive(Copy, Clone, Debug)]
pub struct DetailSchema {
    pub kind: DetailKind,
    /// Child table name; `None` for kinds stored on the `Contacts` row.
    pub table: Option<&'static str>,
    pub fields: &'static [FieldSchema],
    /// At most one instance per contact.
    pub singular: bool,
    /// Merged field-by-field into the aggregate's single instance rather
    /// than copied.
    pub composed: bool,
    /// Never copied to an aggregate.
    pub unpromoted: bool,
    /// Never copied to an aggregate, even under forced promotion.
    pub absolutely_unpromoted: bool,
    /// Writing this detail may migrate legacy values off the primary row.
    pub migrates_primary: bool,
}

impl DetailSchema {
    pub fn promoted(&self) -> bool {
        !self.unpromoted
    }
}

macro_rules! schema {
    ($kind:ident, $table:expr, $fields:expr
        $(, singular: $singular:literal)?
        $(, composed: $composed:literal)?
        $(, unpromoted: $unpromoted:literal)?
        $(, absolutely_unpromoted: $absolutely:literal)?
        $(, migrates_primary: $migrates:literal)?
    ) => {
        DetailSchema {
            kind: DetailKind::$kind,
            table: $table,
            fields: $fields,
            singular: false $(|| $singular)?,
            composed: false $(|| $composed)?,
            unpromoted: false $(|| $unpromoted)?,
            absolutely_unpromoted: false $(|| $absolutely)?,
            migrates_primary: false $(|| $migrates)?,
        }
    };
}

pub static DETAIL_SCHEMAS: &[DetailSchema] = &[
    schema!(
        Address,
        Some("Addresses"),
        &[
            field(fields::STREET, FieldKind::Text),
            field(fields::POBOX, FieldKind::Text),
            field(fields::REGION, FieldKind::Text),
            field(fields::LOCALITY, FieldKind::Text),
            field(fields::POSTCODE, FieldKind::Text),
            field(fields::COUNTRY, FieldKind::Text),
            field(fields::SUB_TYPES, FieldKind::TextList),
        ]
    ),
    schema!(
        Anniversary,
        Some("Anniversaries"),
        &[
            field(fields::ORIGINAL_DATE, FieldKind::Date),
            field(fields::CALENDAR_ID, FieldKind::Text),
            field(fields::EVENT, FieldKind::Text),
            field(fields::SUB_TYPE, FieldKind::Text),
        ]
    ),
    schema!(
        Avatar,
        Some("Avatars"),
        &[
            field(fields::IMAGE_URL, FieldKind::Text),
            field(fields::VIDEO_URL, FieldKind::Text),
            field(fields::AVATAR_METADATA, FieldKind::Text),
        ]
    ),
    schema!(
        Birthday,
        Some("Birthdays"),
        &[
            field(fields::BIRTHDAY, FieldKind::Date),
            field(fields::CALENDAR_ID, FieldKind::Text),
        ],
        singular: true,
        composed: true,
        migrates_primary: true
    ),
    schema!(
        Deactivated,
        None,
        &[],
        singular: true,
        unpromoted: true,
        absolutely_unpromoted: true
    ),
    schema!(
        DisplayLabel,
        None,
        &[field(fields::LABEL, FieldKind::Text)],
        singular: true,
        unpromoted: true,
        absolutely_unpromoted: true
    ),
    schema!(
        EmailAddress,
        Some("EmailAddresses"),
        &[lowered(fields::EMAIL_ADDRESS, "lowerEmailAddress")]
    ),
    schema!(
        Family,
        Some("Families"),
        &[
            field(fields::SPOUSE, FieldKind::Text),
            field(fields::CHILDREN, FieldKind::TextList),
        ]
    ),
    schema!(
        Favorite,
        None,
        &[field(fields::IS_FAVORITE, FieldKind::Bool)],
        singular: true,
        composed: true
    ),
    schema!(
        Gender,
        None,
        &[field(fields::GENDER, FieldKind::Text)],
        singular: true,
        composed: true
    ),
    schema!(
        GeoLocation,
        Some("GeoLocations"),
        &[
            field(fields::GEO_LABEL, FieldKind::Text),
            field(fields::LATITUDE, FieldKind::Real),
            field(fields::LONGITUDE, FieldKind::Real),
            field(fields::ACCURACY, FieldKind::Real),
            field(fields::ALTITUDE, FieldKind::Real),
            field(fields::ALTITUDE_ACCURACY, FieldKind::Real),
            field(fields::HEADING, FieldKind::Real),
            field(fields::SPEED, FieldKind::Real),
            field(fields::GEO_TIMESTAMP, FieldKind::Timestamp),
        ]
    ),
    schema!(
        GlobalPresence,
        Some("GlobalPresences"),
        &[
            field(fields::PRESENCE_STATE, FieldKind::Int),
            field(fields::PRESENCE_TIMESTAMP, FieldKind::Timestamp),
            field(fields::PRESENCE_NICKNAME, FieldKind::Text),
            field(fields::CUSTOM_MESSAGE, FieldKind::Text),
        ],
        singular: true,
        unpromoted: true,
        absolutely_unpromoted: true,
        migrates_primary: true
    ),
    schema!(
        Guid,
        Some("Guids"),
        &[field(fields::GUID, FieldKind::Text)],
        singular: true,
        unpromoted: true,
        migrates_primary: true
    ),
    schema!(Hobby, Some("Hobbies"), &[field(fields::HOBBY, FieldKind::Text)]),
    schema!(
        Incidental,
        None,
        &[field(fields::AGGREGATE_ID, FieldKind::Int)],
        singular: true,
        unpromoted: true,
        absolutely_unpromoted: true
    ),
    schema!(
        Name,
        None,
        &[
            lowered(fields::FIRST_NAME, "lowerFirstName"),
            lowered(fields::LAST_NAME, "lowerLastName"),
            field(fields::MIDDLE_NAME, FieldKind::Text),
            field(fields::PREFIX, FieldKind::Text),
            field(fields::SUFFIX, FieldKind::Text),
            field(fields::CUSTOM_LABEL, FieldKind::Text),
        ],
        singular: true,
        composed: true
    ),
    schema!(
        Nickname,
        Some("Nicknames"),
        &[lowered(fields::NICKNAME, "lowerNickname")]
    ),
    schema!(Note, Some("Notes"), &[field(fields::NOTE, FieldKind::Text)]),
    schema!(
        OnlineAccount,
        Some("OnlineAccounts"),
        &[
            lowered(fields::ACCOUNT_URI, "lowerAccountUri"),
            field(fields::PROTOCOL, FieldKind::Text),
            field(fields::SERVICE_PROVIDER, FieldKind::Text),
            field(fields::CAPABILITIES, FieldKind::TextList),
            field(fields::SUB_TYPES, FieldKind::TextList),
            field(fields::ACCOUNT_PATH, FieldKind::Text),
            field(fields::ACCOUNT_ICON_PATH, FieldKind::Text),
            field(fields::ACCOUNT_ENABLED, FieldKind::Bool),
        ]
    ),
    schema!(
        Organization,
        Some("Organizations"),
        &[
            field(fields::ORG_NAME, FieldKind::Text),
            field(fields::ROLE, FieldKind::Text),
            field(fields::TITLE, FieldKind::Text),
            field(fields::LOCATION, FieldKind::Text),
            field(fields::DEPARTMENT, FieldKind::Text),
            field(fields::LOGO_URL, FieldKind::Text),
            field(fields::ASSISTANT_NAME, FieldKind::Text),
        ]
    ),
    schema!(
        OriginMetadata,
        Some("OriginMetadata"),
        &[
            field(fields::ORIGIN_ID, FieldKind::Text),
            field(fields::GROUP_ID, FieldKind::Text),
            field(fields::ORIGIN_ENABLED, FieldKind::Bool),
        ],
        singular: true,
        unpromoted: true,
        migrates_primary: true
    ),
    schema!(
        PhoneNumber,
        Some("PhoneNumbers"),
        &[
            FieldSchema {
                name: fields::PHONE_NUMBER,
                kind: FieldKind::Text,
                derived: Some(DerivedColumn {
                    column: "normalizedNumber",
                    transform: Transform::NormalizePhone,
                }),
            },
            field(fields::SUB_TYPES, FieldKind::TextList),
        ]
    ),
    schema!(
        Presence,
        Some("Presences"),
        &[
            field(fields::PRESENCE_STATE, FieldKind::Int),
            field(fields::PRESENCE_TIMESTAMP, FieldKind::Timestamp),
            field(fields::PRESENCE_NICKNAME, FieldKind::Text),
            field(fields::CUSTOM_MESSAGE, FieldKind::Text),
        ]
    ),
    schema!(
        Ringtone,
        Some("Ringtones"),
        &[
            field(fields::AUDIO_RINGTONE, FieldKind::Text),
            field(fields::VIDEO_RINGTONE, FieldKind::Text),
            field(fields::VIBRATION_RINGTONE, FieldKind::Text),
        ]
    ),
    schema!(
        StatusFlags,
        None,
        &[
            field(fields::HAS_PHONE_NUMBER, FieldKind::Bool),
            field(fields::HAS_EMAIL_ADDRESS, FieldKind::Bool),
            field(fields::HAS_ONLINE_ACCOUNT, FieldKind::Bool),
            field(fields::IS_ONLINE, FieldKind::Bool),
        ],
        singular: true,
        unpromoted: true,
        absolutely_unpromoted: true
    ),
    schema!(
        SyncTarget,
        None,
        &[field(fields::SYNC_TARGET, FieldKind::Text)],
        singular: true,
        unpromoted: true
    ),
    schema!(Tag, Some("Tags"), &[field(fields::TAG, FieldKind::Text)]),
    schema!(
        Timestamp,
        None,
        &[
            field(fields::CREATED, FieldKind::Timestamp),
            field(fields::MODIFIED, FieldKind::Timestamp),
        ],
        singular: true,
        composed: true
    ),
    schema!(
        Type,
        None,
        &[field(fields::TYPE, FieldKind::Text)],
        singular: true,
        unpromoted: true
    ),
    schema!(
        Url,
        Some("Urls"),
        &[
            field(fields::URL, FieldKind::Text),
            field(fields::SUB_TYPE, FieldKind::Text),
        ]
    ),
];

/// Looks up the schema for a detail kind. Every kind is registered, so
/// this never fails for values of [`DetailKind`].
pub fn schema(kind: DetailKind) -> &'static DetailSchema {
    DETAIL_SCHEMAS
        .iter()
        .find(|s| s.kind == kind)
        .expect("Every detail kind is registered")
}

/// Kinds whose changes constitute presence updates; an update whose mask
/// is a subset of these may bypass durable storage.
pub static PRESENCE_UPDATE_KINDS: &[DetailKind] = &[
    DetailKind::Presence,
    DetailKind::OriginMetadata,
    DetailKind::OnlineAccount,
];

/// Kinds that identify a contact and survive aggregate regeneration.
pub static IDENTITY_KINDS: &[DetailKind] =
    &[DetailKind::SyncTarget, DetailKind::Guid, DetailKind::Type];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_registered_exactly_once() {
        for kind in DetailKind::ALL {
            assert_eq!(
                DETAIL_SCHEMAS.iter().filter(|s| s.kind == *kind).count(),
                1,
                "{kind} must be registered exactly once"
            );
        }
        assert_eq!(DETAIL_SCHEMAS.len(), DetailKind::ALL.len());
    }

    #[test]
    fn composed_kinds_are_singular() {
        for schema in DETAIL_SCHEMAS.iter().filter(|s| s.composed) {
            assert!(schema.singular, "{} is composed but not singular", schema.kind);
        }
    }

    #[test]
    fn absolutely_unpromoted_implies_unpromoted() {
        for schema in DETAIL_SCHEMAS.iter().filter(|s| s.absolutely_unpromoted) {
            assert!(schema.unpromoted);
        }
    }
}
