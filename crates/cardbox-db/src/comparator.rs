//! Field-by-field detail comparison.
//!
//! Equality here deliberately ignores provenance and access constraints:
//! a promoted copy is "the same detail" as its constituent original.

use cardbox_core::{ContactRecord, Detail, DetailKind, FieldValue, Provenance};

/// True when the fields of `b` are all present in `a` with equal values.
///
/// Integer lists are compared element-wise; every other variant compares
/// by value.
fn field_values_superset(a: &Detail, b: &Detail) -> bool {
    b.values().iter().all(|(name, value)| {
        a.value(name).is_some_and(|other| match (other, value) {
            (FieldValue::IntList(lhs), FieldValue::IntList(rhs)) => lhs == rhs,
            (lhs, rhs) => lhs == rhs,
        })
    })
}

/// Same kind and identical field maps, excluding provenance and access
/// constraints.
pub fn details_equivalent(a: &Detail, b: &Detail) -> bool {
    a.kind() == b.kind()
        && a.values().len() == b.values().len()
        && field_values_superset(a, b)
}

/// Same kind, and every field of `b` present and equal in `a`.
pub fn details_superset(a: &Detail, b: &Detail) -> bool {
    a.kind() == b.kind() && field_values_superset(a, b)
}

/// The unique detail of `kind` on `contact` carrying `provenance`.
pub fn find_by_provenance<'c>(
    contact: &'c ContactRecord,
    provenance: &Provenance,
    kind: DetailKind,
) -> Option<&'c Detail> {
    contact
        .details_of(kind)
        .find(|d| d.provenance.as_ref() == Some(provenance))
}

#[cfg(test)]
mod tests {
    use cardbox_core::detail::fields;
    use cardbox_core::{AccessConstraints, ContactId, DetailId, SyncTarget};

    use super::*;

    #[test]
    fn equivalence_ignores_provenance_and_access() {
        let plain = Detail::new(DetailKind::EmailAddress).with_text(fields::EMAIL_ADDRESS, "a@x");

        let mut promoted = plain.clone();
        promoted.provenance = Some(Provenance::new(
            ContactId::new(3),
            DetailId::new(9),
            SyncTarget::Local,
        ));
        promoted.access = AccessConstraints::READ_ONLY_IRREMOVABLE;

        assert!(details_equivalent(&plain, &promoted));
    }

    #[test]
    fn equivalence_requires_identical_field_maps() {
        let a = Detail::new(DetailKind::Name)
            .with_text(fields::FIRST_NAME, "Alice")
            .with_text(fields::LAST_NAME, "Wonderland");
        let first_only = Detail::new(DetailKind::Name).with_text(fields::FIRST_NAME, "Alice");

        assert!(!details_equivalent(&a, &first_only));
        assert!(details_superset(&a, &first_only));
        assert!(!details_superset(&first_only, &a));
    }

    #[test]
    fn int_lists_compare_elementwise() {
        let mut a = Detail::new(DetailKind::Avatar);
        a.set_value(fields::AVATAR_METADATA, FieldValue::IntList(vec![1, 2, 3]));
        let mut b = Detail::new(DetailKind::Avatar);
        b.set_value(fields::AVATAR_METADATA, FieldValue::IntList(vec![1, 2, 3]));
        let mut c = Detail::new(DetailKind::Avatar);
        c.set_value(fields::AVATAR_METADATA, FieldValue::IntList(vec![3, 2, 1]));

        assert!(details_equivalent(&a, &b));
        assert!(!details_equivalent(&a, &c));
    }
}
