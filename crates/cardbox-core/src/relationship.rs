use std::fmt;

use crate::id::ContactId;

/// Relationship edge types. `Aggregates` and `IsNot` drive the
/// aggregation engine; anything else is carried opaquely.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelationshipKind {
    /// Runs from an aggregate contact to each of its constituents.
    Aggregates,
    /// Records that two contacts must never be aggregated together.
    IsNot,
    Named(String),
}

impl RelationshipKind {
    pub const AGGREGATES: &'static str = "Aggregates";
    pub const IS_NOT: &'static str = "IsNot";

    pub fn from_name(name: &str) -> Self {
        match name {
            Self::AGGREGATES => Self::Aggregates,
            Self::IS_NOT => Self::IsNot,
            other => Self::Named(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Aggregates => Self::AGGREGATES,
            Self::IsNot => Self::IS_NOT,
            Self::Named(name) => name,
        }
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed typed edge between two contacts. Neither endpoint owns the
/// edge; it is a value in the relationship store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Relationship {
    pub first: ContactId,
    pub second: ContactId,
    pub kind: RelationshipKind,
}

impl Relationship {
    pub fn new(kind: RelationshipKind, first: ContactId, second: ContactId) -> Self {
        Self { first, second, kind }
    }

    pub fn aggregates(aggregate: ContactId, constituent: ContactId) -> Self {
        Self::new(RelationshipKind::Aggregates, aggregate, constituent)
    }

    pub fn is_not(first: ContactId, second: ContactId) -> Self {
        Self::new(RelationshipKind::IsNot, first, second)
    }
}
