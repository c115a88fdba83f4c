//! Core data model for the cardbox contacts engine.
//!
//! This crate defines the identifier, timestamp, and detail value types
//! shared between the database engine and its callers. It carries no
//! storage logic; the engine crate (`cardbox-db`) owns all SQL.

pub mod contact;
pub mod detail;
pub mod id;
pub mod phone;
pub mod relationship;
pub mod sync_target;
pub mod timestamp;

pub use contact::ContactRecord;
pub use detail::{
    AccessConstraints, Context, Detail, DetailKind, FieldValue, PresenceState, Provenance, fields,
};
pub use id::{ContactId, DetailId};
pub use phone::normalize_phone_number;
pub use relationship::{Relationship, RelationshipKind};
pub use sync_target::SyncTarget;
pub use timestamp::Timestamp;
