use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use snafu::Snafu;
use time::Date;

use crate::id::{ContactId, DetailId};
use crate::sync_target::SyncTarget;
use crate::timestamp::Timestamp;

/// Every detail type the engine knows how to store.
///
/// Adding a kind here requires registering its schema in the engine's
/// detail schema registry and nowhere else.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DetailKind {
    Address,
    Anniversary,
    Avatar,
    Birthday,
    Deactivated,
    DisplayLabel,
    EmailAddress,
    Family,
    Favorite,
    Gender,
    GeoLocation,
    GlobalPresence,
    Guid,
    Hobby,
    Incidental,
    Name,
    Nickname,
    Note,
    OnlineAccount,
    Organization,
    OriginMetadata,
    PhoneNumber,
    Presence,
    Ringtone,
    StatusFlags,
    SyncTarget,
    Tag,
    Timestamp,
    Type,
    Url,
}

impl DetailKind {
    pub const ALL: &'static [DetailKind] = &[
        DetailKind::Address,
        DetailKind::Anniversary,
        DetailKind::Avatar,
        DetailKind::Birthday,
        DetailKind::Deactivated,
        DetailKind::DisplayLabel,
        DetailKind::EmailAddress,
        DetailKind::Family,
        DetailKind::Favorite,
        DetailKind::Gender,
        DetailKind::GeoLocation,
        DetailKind::GlobalPresence,
        DetailKind::Guid,
        DetailKind::Hobby,
        DetailKind::Incidental,
        DetailKind::Name,
        DetailKind::Nickname,
        DetailKind::Note,
        DetailKind::OnlineAccount,
        DetailKind::Organization,
        DetailKind::OriginMetadata,
        DetailKind::PhoneNumber,
        DetailKind::Presence,
        DetailKind::Ringtone,
        DetailKind::StatusFlags,
        DetailKind::SyncTarget,
        DetailKind::Tag,
        DetailKind::Timestamp,
        DetailKind::Type,
        DetailKind::Url,
    ];

    /// The name stored in the `Details.detail` column.
    pub fn name(self) -> &'static str {
        match self {
            Self::Address => "Address",
            Self::Anniversary => "Anniversary",
            Self::Avatar => "Avatar",
            Self::Birthday => "Birthday",
            Self::Deactivated => "Deactivated",
            Self::DisplayLabel => "DisplayLabel",
            Self::EmailAddress => "EmailAddress",
            Self::Family => "Family",
            Self::Favorite => "Favorite",
            Self::Gender => "Gender",
            Self::GeoLocation => "GeoLocation",
            Self::GlobalPresence => "GlobalPresence",
            Self::Guid => "Guid",
            Self::Hobby => "Hobby",
            Self::Incidental => "Incidental",
            Self::Name => "Name",
            Self::Nickname => "Nickname",
            Self::Note => "Note",
            Self::OnlineAccount => "OnlineAccount",
            Self::Organization => "Organization",
            Self::OriginMetadata => "OriginMetadata",
            Self::PhoneNumber => "PhoneNumber",
            Self::Presence => "Presence",
            Self::Ringtone => "Ringtone",
            Self::StatusFlags => "StatusFlags",
            Self::SyncTarget => "SyncTarget",
            Self::Tag => "Tag",
            Self::Timestamp => "Timestamp",
            Self::Type => "Type",
            Self::Url => "Url",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for DetailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Field name constants, matching the SQL column names of the child
/// tables (or of the `Contacts` row for primary-stored kinds).
pub mod fields {
    // Name
    pub const FIRST_NAME: &str = "firstName";
    pub const LAST_NAME: &str = "lastName";
    pub const MIDDLE_NAME: &str = "middleName";
    pub const PREFIX: &str = "prefix";
    pub const SUFFIX: &str = "suffix";
    pub const CUSTOM_LABEL: &str = "customLabel";

    // DisplayLabel
    pub const LABEL: &str = "displayLabel";

    // SyncTarget
    pub const SYNC_TARGET: &str = "syncTarget";

    // Favorite
    pub const IS_FAVORITE: &str = "isFavorite";

    // Gender
    pub const GENDER: &str = "gender";

    // Timestamp
    pub const CREATED: &str = "created";
    pub const MODIFIED: &str = "modified";

    // Type
    pub const TYPE: &str = "type";

    // Incidental: associates a fresh incidental constituent with its
    // aggregate before the Aggregates edge exists. Not persisted.
    pub const AGGREGATE_ID: &str = "aggregateId";

    // StatusFlags
    pub const HAS_PHONE_NUMBER: &str = "hasPhoneNumber";
    pub const HAS_EMAIL_ADDRESS: &str = "hasEmailAddress";
    pub const HAS_ONLINE_ACCOUNT: &str = "hasOnlineAccount";
    pub const IS_ONLINE: &str = "isOnline";

    // Address
    pub const STREET: &str = "street";
    pub const POBOX: &str = "postOfficeBox";
    pub const REGION: &str = "region";
    pub const LOCALITY: &str = "locality";
    pub const POSTCODE: &str = "postCode";
    pub const COUNTRY: &str = "country";
    pub const SUB_TYPES: &str = "subTypes";

    // Anniversary
    pub const ORIGINAL_DATE: &str = "originalDate";
    pub const CALENDAR_ID: &str = "calendarId";
    pub const EVENT: &str = "event";
    pub const SUB_TYPE: &str = "subType";

    // Avatar
    pub const IMAGE_URL: &str = "imageUrl";
    pub const VIDEO_URL: &str = "videoUrl";
    pub const AVATAR_METADATA: &str = "avatarMetadata";

    // Birthday
    pub const BIRTHDAY: &str = "birthday";

    // EmailAddress
    pub const EMAIL_ADDRESS: &str = "emailAddress";

    // Family
    pub const SPOUSE: &str = "spouse";
    pub const CHILDREN: &str = "children";

    // GeoLocation
    pub const GEO_LABEL: &str = "label";
    pub const LATITUDE: &str = "latitude";
    pub const LONGITUDE: &str = "longitude";
    pub const ACCURACY: &str = "accuracy";
    pub const ALTITUDE: &str = "altitude";
    pub const ALTITUDE_ACCURACY: &str = "altitudeAccuracy";
    pub const HEADING: &str = "heading";
    pub const SPEED: &str = "speed";
    pub const GEO_TIMESTAMP: &str = "timestamp";

    // GlobalPresence / Presence
    pub const PRESENCE_STATE: &str = "presenceState";
    pub const PRESENCE_TIMESTAMP: &str = "timestamp";
    pub const PRESENCE_NICKNAME: &str = "nickname";
    pub const CUSTOM_MESSAGE: &str = "customMessage";

    // Guid
    pub const GUID: &str = "guid";

    // Hobby
    pub const HOBBY: &str = "hobby";

    // Nickname
    pub const NICKNAME: &str = "nickname";

    // Note
    pub const NOTE: &str = "note";

    // OnlineAccount
    pub const ACCOUNT_URI: &str = "accountUri";
    pub const PROTOCOL: &str = "protocol";
    pub const SERVICE_PROVIDER: &str = "serviceProvider";
    pub const CAPABILITIES: &str = "capabilities";
    pub const ACCOUNT_PATH: &str = "accountPath";
    pub const ACCOUNT_ICON_PATH: &str = "accountIconPath";
    pub const ACCOUNT_ENABLED: &str = "enabled";

    // Organization
    pub const ORG_NAME: &str = "name";
    pub const ROLE: &str = "role";
    pub const TITLE: &str = "title";
    pub const LOCATION: &str = "location";
    pub const DEPARTMENT: &str = "department";
    pub const LOGO_URL: &str = "logoUrl";
    pub const ASSISTANT_NAME: &str = "assistantName";

    // OriginMetadata
    pub const ORIGIN_ID: &str = "id";
    pub const GROUP_ID: &str = "groupId";
    pub const ORIGIN_ENABLED: &str = "enabled";

    // PhoneNumber
    pub const PHONE_NUMBER: &str = "phoneNumber";

    // Ringtone
    pub const AUDIO_RINGTONE: &str = "audioRingtone";
    pub const VIDEO_RINGTONE: &str = "videoRingtone";
    pub const VIBRATION_RINGTONE: &str = "vibrationRingtone";

    // Tag
    pub const TAG: &str = "tag";

    // Url
    pub const URL: &str = "url";
}

/// A typed field value.
///
/// Integer-list fields keep their element structure so that comparisons
/// are element-wise rather than over an opaque encoding.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Text(String),
    TextList(Vec<String>),
    Int(i64),
    IntList(Vec<i64>),
    Bool(bool),
    Real(f64),
    Date(Date),
    Timestamp(Timestamp),
    Blob(Vec<u8>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<Date> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

/// Detail context labels, stored as a `;`-joined string.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Context {
    Home,
    Work,
    Other,
    Default,
    Large,
}

impl Context {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Home => "Home",
            Self::Work => "Work",
            Self::Other => "Other",
            Self::Default => "Default",
            Self::Large => "Large",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "Home" => Some(Self::Home),
            "Work" => Some(Self::Work),
            "Other" => Some(Self::Other),
            "Default" => Some(Self::Default),
            "Large" => Some(Self::Large),
            _ => None,
        }
    }

    pub fn join(contexts: &[Context]) -> String {
        contexts
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Unknown labels written by other clients are skipped, not errors.
    pub fn split(joined: &str) -> Vec<Context> {
        joined
            .split(';')
            .filter(|s| !s.is_empty())
            .filter_map(Context::from_str_opt)
            .collect()
    }
}

/// Access constraints on a detail, stored as a bit set.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AccessConstraints {
    pub read_only: bool,
    pub irremovable: bool,
}

impl AccessConstraints {
    pub const NONE: Self = Self {
        read_only: false,
        irremovable: false,
    };
    pub const READ_ONLY_IRREMOVABLE: Self = Self {
        read_only: true,
        irremovable: true,
    };

    pub fn bits(self) -> i64 {
        (self.read_only as i64) | ((self.irremovable as i64) << 1)
    }

    pub fn from_bits(bits: i64) -> Self {
        Self {
            read_only: bits & 0b01 != 0,
            irremovable: bits & 0b10 != 0,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("Malformed provenance `{input}`"))]
pub struct ProvenanceParseError {
    pub input: String,
}

/// Identifies the constituent detail a promoted copy came from:
/// `<originatingContactId>:<detailId>:<syncTarget>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Provenance {
    pub contact_id: ContactId,
    pub detail_id: DetailId,
    pub sync_target: SyncTarget,
}

impl Provenance {
    pub fn new(contact_id: ContactId, detail_id: DetailId, sync_target: SyncTarget) -> Self {
        Self {
            contact_id,
            detail_id,
            sync_target,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.contact_id, self.detail_id, self.sync_target)
    }
}

impl FromStr for Provenance {
    type Err = ProvenanceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let parse = || ProvenanceParseError { input: s.to_owned() };
        let contact_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(parse)?;
        let detail_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(parse)?;
        let sync_target = SyncTarget::from_name(parts.next().ok_or_else(parse)?);
        Ok(Self {
            contact_id,
            detail_id,
            sync_target,
        })
    }
}

/// Presence states, ordered by "availability" for global presence
/// selection. Numeric values match the stored integers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PresenceState {
    Unknown = 0,
    Available = 1,
    Hidden = 2,
    Busy = 3,
    Away = 4,
    ExtendedAway = 5,
    Offline = 6,
}

impl PresenceState {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Available,
            2 => Self::Hidden,
            3 => Self::Busy,
            4 => Self::Away,
            5 => Self::ExtendedAway,
            6 => Self::Offline,
            _ => Self::Unknown,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// A contact is online when any presence detail reports a state
    /// between Available and ExtendedAway inclusive.
    pub fn is_online(self) -> bool {
        matches!(
            self,
            Self::Available | Self::Hidden | Self::Busy | Self::Away | Self::ExtendedAway
        )
    }

    /// Lower order is "more available"; Unknown never wins a tie.
    pub fn availability_order(self) -> u8 {
        match self {
            Self::Available => 0,
            Self::Away => 1,
            Self::ExtendedAway => 2,
            Self::Busy => 3,
            Self::Hidden => 4,
            Self::Offline => 5,
            Self::Unknown => 6,
        }
    }
}

/// A typed record attached to a contact.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail {
    kind: DetailKind,
    /// Assigned by the database on insertion; `None` for unsaved details.
    pub id: Option<DetailId>,
    values: BTreeMap<&'static str, FieldValue>,
    pub contexts: Vec<Context>,
    pub access: AccessConstraints,
    pub provenance: Option<Provenance>,
    pub modifiable: Option<bool>,
    pub nonexportable: bool,
    pub detail_uri: Option<String>,
    pub linked_detail_uris: Vec<String>,
}

impl Detail {
    pub fn new(kind: DetailKind) -> Self {
        Self {
            kind,
            id: None,
            values: BTreeMap::new(),
            contexts: Vec::new(),
            access: AccessConstraints::NONE,
            provenance: None,
            modifiable: None,
            nonexportable: false,
            detail_uri: None,
            linked_detail_uris: Vec::new(),
        }
    }

    pub fn kind(&self) -> DetailKind {
        self.kind
    }

    pub fn values(&self) -> &BTreeMap<&'static str, FieldValue> {
        &self.values
    }

    pub fn value(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn set_value(&mut self, field: &'static str, value: FieldValue) -> &mut Self {
        self.values.insert(field, value);
        self
    }

    pub fn clear_value(&mut self, field: &str) {
        self.values.remove(field);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.value(field).and_then(FieldValue::as_text)
    }

    pub fn int(&self, field: &str) -> Option<i64> {
        self.value(field).and_then(FieldValue::as_int)
    }

    pub fn bool_value(&self, field: &str) -> Option<bool> {
        self.value(field).and_then(FieldValue::as_bool)
    }

    pub fn date(&self, field: &str) -> Option<Date> {
        self.value(field).and_then(FieldValue::as_date)
    }

    pub fn timestamp(&self, field: &str) -> Option<Timestamp> {
        self.value(field).and_then(FieldValue::as_timestamp)
    }

    // Builder-style setters, mostly for constructing test fixtures and
    // engine-derived details.

    pub fn with_text(mut self, field: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(field, FieldValue::Text(value.into()));
        self
    }

    pub fn with_int(mut self, field: &'static str, value: i64) -> Self {
        self.values.insert(field, FieldValue::Int(value));
        self
    }

    pub fn with_bool(mut self, field: &'static str, value: bool) -> Self {
        self.values.insert(field, FieldValue::Bool(value));
        self
    }

    pub fn with_date(mut self, field: &'static str, value: Date) -> Self {
        self.values.insert(field, FieldValue::Date(value));
        self
    }

    pub fn with_timestamp(mut self, field: &'static str, value: Timestamp) -> Self {
        self.values.insert(field, FieldValue::Timestamp(value));
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.contexts.push(context);
        self
    }

    /// The presence state of a `Presence`/`GlobalPresence` detail.
    pub fn presence_state(&self) -> PresenceState {
        self.int(fields::PRESENCE_STATE)
            .map(PresenceState::from_i64)
            .unwrap_or(PresenceState::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provenance_round_trip() {
        let p = Provenance::new(
            ContactId::new(7),
            DetailId::new(42),
            SyncTarget::named("gtalk"),
        );
        let parsed: Provenance = p.to_string().parse().expect("Round trips");
        assert_eq!(p, parsed);
    }

    #[test]
    fn context_join_split() {
        let contexts = vec![Context::Home, Context::Work];
        assert_eq!(Context::join(&contexts), "Home;Work");
        assert_eq!(Context::split("Home;Work;Bogus"), contexts);
    }

    #[test]
    fn access_constraint_bits() {
        for access in [
            AccessConstraints::NONE,
            AccessConstraints::READ_ONLY_IRREMOVABLE,
            AccessConstraints {
                read_only: true,
                irremovable: false,
            },
        ] {
            assert_eq!(AccessConstraints::from_bits(access.bits()), access);
        }
    }
}
