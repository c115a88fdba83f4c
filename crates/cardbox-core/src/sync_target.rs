use std::fmt;

/// Origin of a contact's data.
///
/// The four well-known values get dedicated variants; any other string is
/// an opaque sync-source name. The engine compares sync targets by their
/// string form, which is also what the `Contacts.syncTarget` column stores.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncTarget {
    /// Device-local data, owned by the user.
    Local,
    /// Formerly-local data that has been claimed by a newer local
    /// constituent of the same aggregate.
    WasLocal,
    /// Synthesized single-person view over constituents.
    Aggregate,
    /// Reserved target used by exporting sync peers.
    Export,
    /// An arbitrary sync-source name.
    Named(String),
}

impl SyncTarget {
    pub const LOCAL: &'static str = "local";
    pub const WAS_LOCAL: &'static str = "was_local";
    pub const AGGREGATE: &'static str = "aggregate";
    pub const EXPORT: &'static str = "export";

    pub fn named(name: impl Into<String>) -> Self {
        Self::from_name(&name.into())
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            Self::LOCAL => Self::Local,
            Self::WAS_LOCAL => Self::WasLocal,
            Self::AGGREGATE => Self::Aggregate,
            Self::EXPORT => Self::Export,
            other => Self::Named(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Local => Self::LOCAL,
            Self::WasLocal => Self::WAS_LOCAL,
            Self::Aggregate => Self::AGGREGATE,
            Self::Export => Self::EXPORT,
            Self::Named(name) => name,
        }
    }

    /// True for the predefined targets; `isDeactivated` is only meaningful
    /// for contacts whose target is not one of these.
    pub fn is_builtin(&self) -> bool {
        !matches!(self, Self::Named(_))
    }

    /// `local` and `was_local` are interchangeable for batch-save
    /// precondition purposes.
    pub fn is_local_kind(&self) -> bool {
        matches!(self, Self::Local | Self::WasLocal)
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SyncTarget {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl From<String> for SyncTarget {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string_form() {
        for name in ["local", "was_local", "aggregate", "export", "gtalk"] {
            assert_eq!(SyncTarget::from_name(name).as_str(), name);
        }
    }

    #[test]
    fn builtin_classification() {
        assert!(SyncTarget::Local.is_builtin());
        assert!(!SyncTarget::named("carddav").is_builtin());
    }
}
