use crate::detail::{Detail, DetailKind, FieldValue, fields};
use crate::id::ContactId;
use crate::relationship::Relationship;
use crate::sync_target::SyncTarget;
use crate::timestamp::Timestamp;

/// A contact as presented to callers: an id, its typed details, and the
/// relationship edges it participates in.
///
/// The record exclusively owns its detail collection; promoting a detail
/// to an aggregate copies it, with provenance as the join key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub details: Vec<Detail>,
    pub relationships: Vec<Relationship>,
}

impl ContactRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: ContactId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn detail(&self, kind: DetailKind) -> Option<&Detail> {
        self.details.iter().find(|d| d.kind() == kind)
    }

    pub fn detail_mut(&mut self, kind: DetailKind) -> Option<&mut Detail> {
        self.details.iter_mut().find(|d| d.kind() == kind)
    }

    pub fn details_of(&self, kind: DetailKind) -> impl Iterator<Item = &Detail> {
        self.details.iter().filter(move |d| d.kind() == kind)
    }

    pub fn push_detail(&mut self, detail: Detail) {
        self.details.push(detail);
    }

    /// Replaces the single instance of a singular detail kind, or appends
    /// it if not present.
    pub fn set_singular(&mut self, detail: Detail) {
        match self.detail_mut(detail.kind()) {
            Some(existing) => *existing = detail,
            None => self.details.push(detail),
        }
    }

    pub fn remove_details(&mut self, kind: DetailKind) {
        self.details.retain(|d| d.kind() != kind);
    }

    pub fn sync_target(&self) -> Option<SyncTarget> {
        self.detail(DetailKind::SyncTarget)
            .and_then(|d| d.text(fields::SYNC_TARGET))
            .map(SyncTarget::from_name)
    }

    pub fn set_sync_target(&mut self, target: &SyncTarget) {
        self.set_singular(
            Detail::new(DetailKind::SyncTarget).with_text(fields::SYNC_TARGET, target.as_str()),
        );
    }

    /// The effective sync target, defaulting to `local` as the write
    /// pipeline does for records that do not carry one.
    pub fn sync_target_or_local(&self) -> SyncTarget {
        self.sync_target().unwrap_or(SyncTarget::Local)
    }

    pub fn first_name(&self) -> Option<&str> {
        self.detail(DetailKind::Name)
            .and_then(|d| d.text(fields::FIRST_NAME))
    }

    pub fn last_name(&self) -> Option<&str> {
        self.detail(DetailKind::Name)
            .and_then(|d| d.text(fields::LAST_NAME))
    }

    pub fn gender(&self) -> Option<&str> {
        self.detail(DetailKind::Gender)
            .and_then(|d| d.text(fields::GENDER))
    }

    pub fn is_favorite(&self) -> bool {
        self.detail(DetailKind::Favorite)
            .and_then(|d| d.bool_value(fields::IS_FAVORITE))
            .unwrap_or(false)
    }

    pub fn is_deactivated(&self) -> bool {
        self.detail(DetailKind::Deactivated).is_some()
    }

    pub fn is_incidental(&self) -> bool {
        self.detail(DetailKind::Incidental).is_some()
    }

    pub fn created(&self) -> Option<Timestamp> {
        self.detail(DetailKind::Timestamp)
            .and_then(|d| d.timestamp(fields::CREATED))
    }

    pub fn modified(&self) -> Option<Timestamp> {
        self.detail(DetailKind::Timestamp)
            .and_then(|d| d.timestamp(fields::MODIFIED))
    }

    pub fn display_label(&self) -> Option<&str> {
        self.detail(DetailKind::DisplayLabel)
            .and_then(|d| d.text(fields::LABEL))
    }

    /// Convenience constructor used pervasively in tests: a named contact
    /// for the given sync target (`None` = local).
    pub fn named(sync_target: Option<&str>, first: &str, last: &str) -> Self {
        let mut contact = Self::new();
        contact.push_detail(
            Detail::new(DetailKind::Name)
                .with_text(fields::FIRST_NAME, first)
                .with_text(fields::LAST_NAME, last),
        );
        if let Some(target) = sync_target {
            contact.set_sync_target(&SyncTarget::from_name(target));
        }
        contact
    }
}

impl ContactRecord {
    /// All values of a given text field across details of a kind,
    /// e.g. every email address. Skips empty strings.
    pub fn text_values(&self, kind: DetailKind, field: &str) -> Vec<String> {
        self.details_of(kind)
            .filter_map(|d| d.text(field))
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// True if any detail of `kind` has a non-empty value for `field`.
    pub fn has_any(&self, kind: DetailKind, field: &str) -> bool {
        self.details_of(kind).any(|d| {
            d.value(field)
                .map(|v| !matches!(v, FieldValue::Text(s) if s.is_empty()))
                .unwrap_or(false)
        })
    }
}
