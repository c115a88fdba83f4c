use std::collections::BTreeMap;
use std::sync::Arc;

use cardbox_core::detail::fields;
use cardbox_core::{
    ContactId, ContactRecord, Detail, DetailKind, FieldValue, Relationship, SyncTarget, Timestamp,
};
use tempfile::{TempDir, tempdir};
use time::OffsetDateTime;
use tracing::info;

use crate::transient::TransientStore as _;
use crate::{ConflictPolicy, ContactsDb, ErrorKind, ErrorMap, MemoryTransientStore, OobValue};

fn temp_db() -> (TempDir, ContactsDb) {
    let dir = tempdir().expect("Temp dir");
    let db = ContactsDb::open(dir.path().join("contacts.db")).expect("Open database");
    (dir, db)
}

/// A timestamp safely before every operation in the running test, for
/// sync anchors.
fn before_test() -> Timestamp {
    Timestamp::from_datetime(OffsetDateTime::now_utc() - time::Duration::seconds(5))
}

fn phone(number: &str) -> Detail {
    Detail::new(DetailKind::PhoneNumber).with_text(fields::PHONE_NUMBER, number)
}

fn email(address: &str) -> Detail {
    Detail::new(DetailKind::EmailAddress).with_text(fields::EMAIL_ADDRESS, address)
}

fn hobby(name: &str) -> Detail {
    Detail::new(DetailKind::Hobby).with_text(fields::HOBBY, name)
}

fn save_one(db: &ContactsDb, contact: &mut ContactRecord) {
    let mut errors = ErrorMap::new();
    db.save_contacts(std::slice::from_mut(contact), &[], &mut errors)
        .expect("Save succeeds");
    assert!(errors.is_empty(), "No per-item errors: {errors:?}");
    assert!(!contact.id.is_unsaved(), "Id was assigned");
}

fn aggregate_of(db: &ContactsDb, id: ContactId) -> Option<ContactId> {
    db.relationships_for(id)
        .expect("Relationships readable")
        .into_iter()
        .find(|r| {
            r.kind == cardbox_core::RelationshipKind::Aggregates && r.second == id
        })
        .map(|r| r.first)
}

fn phone_numbers(contact: &ContactRecord) -> Vec<String> {
    contact.text_values(DetailKind::PhoneNumber, fields::PHONE_NUMBER)
}

/// Universal invariants over every contact in the first `scan` ids.
fn assert_aggregation_invariants(db: &ContactsDb, scan: u32) {
    for raw_id in 1..=scan {
        let id = ContactId::new(raw_id);
        let Some(contact) = db.get_contact(id).expect("Contact readable") else {
            continue;
        };
        if contact.is_deactivated() {
            // Deactivated contacts are detached from aggregation.
            continue;
        }

        let sync_target = contact.sync_target_or_local();
        if sync_target == SyncTarget::Aggregate {
            // Every aggregate has at least one constituent.
            let constituents: Vec<_> = contact
                .relationships
                .iter()
                .filter(|r| {
                    r.kind == cardbox_core::RelationshipKind::Aggregates && r.first == id
                })
                .collect();
            assert!(!constituents.is_empty(), "Aggregate {id} has constituents");
        } else {
            // Every non-aggregate is aggregated by exactly one aggregate.
            let aggregates: Vec<_> = contact
                .relationships
                .iter()
                .filter(|r| {
                    r.kind == cardbox_core::RelationshipKind::Aggregates && r.second == id
                })
                .collect();
            assert_eq!(
                aggregates.len(),
                1,
                "Contact {id} ({sync_target}) has exactly one aggregate"
            );
        }

        // Denormalized status flags reflect the details.
        let has_phone = contact.has_any(DetailKind::PhoneNumber, fields::PHONE_NUMBER);
        let flag = contact
            .detail(DetailKind::StatusFlags)
            .and_then(|d| d.bool_value(fields::HAS_PHONE_NUMBER))
            .unwrap_or(false);
        assert_eq!(has_phone, flag, "hasPhoneNumber matches details of {id}");
    }
}

#[test_log::test]
fn pure_local_creation() {
    let (_dir, db) = temp_db();

    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    alice.push_detail(phone("1234567"));
    save_one(&db, &mut alice);

    let local_id = alice.id;
    let aggregate_id = aggregate_of(&db, local_id).expect("Local has an aggregate");
    assert_ne!(local_id, aggregate_id);

    let local = db.get_contact(local_id).unwrap().expect("Local exists");
    assert_eq!(local.sync_target(), Some(SyncTarget::Local));

    let aggregate = db
        .get_contact(aggregate_id)
        .unwrap()
        .expect("Aggregate exists");
    assert_eq!(aggregate.sync_target(), Some(SyncTarget::Aggregate));
    assert_eq!(aggregate.first_name(), Some("Alice"));
    assert_eq!(phone_numbers(&aggregate), vec!["1234567".to_owned()]);

    // The promoted phone carries the local constituent's provenance.
    let promoted = aggregate
        .detail(DetailKind::PhoneNumber)
        .expect("Phone promoted");
    let provenance = promoted.provenance.as_ref().expect("Provenance stamped");
    assert_eq!(provenance.contact_id, local_id);
    assert_eq!(provenance.sync_target, SyncTarget::Local);

    assert_aggregation_invariants(&db, 8);
}

#[test_log::test]
fn match_on_name_attaches_to_existing_aggregate() {
    let (_dir, db) = temp_db();

    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    alice.push_detail(phone("1234567"));
    save_one(&db, &mut alice);
    let aggregate_id = aggregate_of(&db, alice.id).unwrap();

    let mut gtalk_alice = ContactRecord::named(Some("gtalk"), "Alice", "Wonderland");
    gtalk_alice.push_detail(hobby("tennis"));
    save_one(&db, &mut gtalk_alice);

    // Same aggregate; no new one was created.
    assert_eq!(aggregate_of(&db, gtalk_alice.id), Some(aggregate_id));
    let next_id = ContactId::new(gtalk_alice.id.as_u32() + 1);
    assert!(db.get_contact(next_id).unwrap().is_none());

    let aggregate = db.get_contact(aggregate_id).unwrap().unwrap();
    assert_eq!(
        aggregate.text_values(DetailKind::Hobby, fields::HOBBY),
        vec!["tennis".to_owned()]
    );

    // The gtalk copy is read-only on the aggregate.
    let promoted_hobby = aggregate.detail(DetailKind::Hobby).unwrap();
    assert!(promoted_hobby.access.read_only);

    assert_aggregation_invariants(&db, 8);
}

#[test_log::test]
fn last_name_mismatch_creates_new_aggregate() {
    let (_dir, db) = temp_db();

    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    alice.push_detail(phone("1234567"));
    save_one(&db, &mut alice);
    let first_aggregate = aggregate_of(&db, alice.id).unwrap();

    // First name and phone match, but the last names differ, so this is
    // not even a candidate.
    let mut smith = ContactRecord::named(Some("gtalk"), "Alice", "Smith");
    smith.push_detail(phone("1234567"));
    save_one(&db, &mut smith);

    let second_aggregate = aggregate_of(&db, smith.id).expect("Smith has an aggregate");
    assert_ne!(first_aggregate, second_aggregate);

    assert_aggregation_invariants(&db, 8);
}

#[test_log::test]
fn empty_names_attach_at_threshold() {
    let (_dir, db) = temp_db();

    // A nameless contact identified by first name and phone number.
    let mut first = ContactRecord::new();
    first.push_detail(Detail::new(DetailKind::Name).with_text(fields::FIRST_NAME, "Alice"));
    first.push_detail(phone("1234567"));
    save_one(&db, &mut first);
    let aggregate_id = aggregate_of(&db, first.id).unwrap();

    // First name matches with an empty last name on both sides (12) and
    // the phone number matches (3): exactly the threshold, so attach.
    let mut second = ContactRecord::new();
    second.set_sync_target(&SyncTarget::named("gtalk"));
    second.push_detail(Detail::new(DetailKind::Name).with_text(fields::FIRST_NAME, "Alice"));
    second.push_detail(phone("1234567"));
    save_one(&db, &mut second);

    assert_eq!(aggregate_of(&db, second.id), Some(aggregate_id));
}

#[test_log::test]
fn down_promotion_to_local_constituent() {
    let (_dir, db) = temp_db();

    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    alice.push_detail(phone("1234567"));
    save_one(&db, &mut alice);
    let aggregate_id = aggregate_of(&db, alice.id).unwrap();

    // Edit the aggregate directly.
    let mut aggregate = db.get_contact(aggregate_id).unwrap().unwrap();
    aggregate.push_detail(email("a@x"));
    save_one(&db, &mut aggregate);

    // The local constituent acquired the email.
    let local = db.get_contact(alice.id).unwrap().unwrap();
    assert_eq!(
        local.text_values(DetailKind::EmailAddress, fields::EMAIL_ADDRESS),
        vec!["a@x".to_owned()]
    );

    // The aggregate reloads with the same email, promoted back.
    let aggregate = db.get_contact(aggregate_id).unwrap().unwrap();
    assert_eq!(
        aggregate.text_values(DetailKind::EmailAddress, fields::EMAIL_ADDRESS),
        vec!["a@x".to_owned()]
    );
    let promoted = aggregate.detail(DetailKind::EmailAddress).unwrap();
    assert_eq!(
        promoted.provenance.as_ref().map(|p| p.contact_id),
        Some(alice.id)
    );

    assert_aggregation_invariants(&db, 8);
}

#[test_log::test]
fn aggregate_sync_target_cannot_change() {
    let (_dir, db) = temp_db();

    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    save_one(&db, &mut alice);
    let aggregate_id = aggregate_of(&db, alice.id).unwrap();

    let mut aggregate = db.get_contact(aggregate_id).unwrap().unwrap();
    aggregate.set_sync_target(&SyncTarget::named("gtalk"));

    let mut errors = ErrorMap::new();
    let err = db
        .save_contacts(std::slice::from_mut(&mut aggregate), &[], &mut errors)
        .expect_err("Changing an aggregate's sync target fails");
    assert_eq!(err.kind(), ErrorKind::InvalidDetail);
}

#[test_log::test]
fn mixed_sync_target_batch_is_rejected_untouched() {
    let (_dir, db) = temp_db();

    let mut batch = vec![
        ContactRecord::named(None, "Alice", "Wonderland"),
        ContactRecord::named(Some("gtalk"), "Bob", "Builder"),
    ];
    let mut errors = ErrorMap::new();
    let err = db
        .save_contacts(&mut batch, &[], &mut errors)
        .expect_err("Mixed batch fails");
    assert_eq!(err.kind(), ErrorKind::Unspecified);
    // The check precedes any database work: no ids, no error map entries.
    assert!(errors.is_empty());
    assert!(batch.iter().all(|c| c.id.is_unsaved()));
    assert!(db.get_contact(ContactId::new(3)).unwrap().is_none());
}

#[test_log::test]
fn incidental_contacts_cannot_be_supplied() {
    let (_dir, db) = temp_db();

    let mut contact = ContactRecord::named(None, "Sneaky", "Incidental");
    contact.push_detail(Detail::new(DetailKind::Incidental));

    let mut errors = ErrorMap::new();
    let err = db
        .save_contacts(std::slice::from_mut(&mut contact), &[], &mut errors)
        .expect_err("Incidental contacts are engine-made only");
    assert_eq!(err.kind(), ErrorKind::Unspecified);
}

#[test_log::test]
fn failed_batch_rolls_back_and_reports_locked() {
    let (_dir, db) = temp_db();

    let good = ContactRecord::named(None, "Alice", "Wonderland");
    let mut bad = ContactRecord::named(None, "Bob", "Builder");
    // A second Name detail violates the singular constraint.
    bad.push_detail(Detail::new(DetailKind::Name).with_text(fields::FIRST_NAME, "Robert"));

    let mut batch = vec![good, bad];
    let mut errors = ErrorMap::new();
    let err = db
        .save_contacts(&mut batch, &[], &mut errors)
        .expect_err("Batch fails");
    assert_eq!(err.kind(), ErrorKind::LimitReached);

    assert_eq!(errors.get(&1), Some(&ErrorKind::LimitReached));
    // The first contact did nothing wrong, but the rollback un-created
    // it; it must not be mistaken for saved.
    assert_eq!(errors.get(&0), Some(&ErrorKind::Locked));
    assert!(batch[0].id.is_unsaved());
    assert!(db.get_contact(ContactId::new(3)).unwrap().is_none());
}

#[test_log::test]
fn removing_self_contact_is_rejected() {
    let (_dir, db) = temp_db();

    let mut errors = ErrorMap::new();
    let err = db
        .remove_contacts(&[ContactId::SELF_LOCAL], &mut errors)
        .expect_err("Self contact cannot be removed");
    assert_eq!(err.kind(), ErrorKind::BadArgument);
    assert!(db.get_contact(ContactId::SELF_LOCAL).unwrap().is_some());
}

#[test_log::test]
fn childless_aggregate_is_pruned_with_tombstone() {
    let (_dir, db) = temp_db();
    let anchor = before_test();

    let mut svc = ContactRecord::named(Some("svc"), "Carol", "Chrome");
    save_one(&db, &mut svc);
    let aggregate_id = aggregate_of(&db, svc.id).unwrap();

    let mut errors = ErrorMap::new();
    db.remove_contacts(&[svc.id], &mut errors).expect("Remove succeeds");
    assert!(errors.is_empty());

    // The aggregate fell in the same transaction.
    assert!(db.get_contact(aggregate_id).unwrap().is_none());

    // Its tombstone carries the aggregate sync target, which the export
    // peer observes as a deletion.
    let export = db
        .fetch_sync_contacts(SyncTarget::EXPORT, anchor, &[])
        .expect("Export fetch succeeds");
    assert!(export.deleted.contains(&aggregate_id));

    assert_aggregation_invariants(&db, 8);
}

#[test_log::test]
fn sync_fetch_reports_deletions() {
    let (_dir, db) = temp_db();
    let anchor = before_test();

    let mut svc = ContactRecord::named(Some("svc"), "Carol", "Chrome");
    save_one(&db, &mut svc);
    let svc_id = svc.id;

    let mut errors = ErrorMap::new();
    db.remove_contacts(&[svc_id], &mut errors).expect("Remove succeeds");

    let result = db
        .fetch_sync_contacts("svc", anchor, &[])
        .expect("Sync fetch succeeds");
    assert!(result.changed.is_empty());
    assert!(result.added.is_empty());
    assert_eq!(result.deleted, vec![svc_id]);
    assert!(result.new_timestamp > anchor);
}

#[test_log::test]
fn sync_fetch_builds_partial_aggregates() {
    let (_dir, db) = temp_db();
    let anchor = before_test();

    // Local Alice with a phone, plus an "other" source with a note and
    // a gtalk constituent with a hobby. The gtalk constituent is saved
    // last so its modification time is the aggregate's newest.
    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    alice.push_detail(phone("1234567"));
    save_one(&db, &mut alice);

    let mut other = ContactRecord::named(Some("othersource"), "Alice", "Wonderland");
    other.push_detail(Detail::new(DetailKind::Note).with_text(fields::NOTE, "secret"));
    save_one(&db, &mut other);

    let mut gtalk = ContactRecord::named(Some("gtalk"), "Alice", "Wonderland");
    gtalk.push_detail(hobby("tennis"));
    save_one(&db, &mut gtalk);

    let result = db
        .fetch_sync_contacts("gtalk", anchor, &[])
        .expect("Sync fetch succeeds");

    // Local Alice is new since the anchor, so her aggregate is an
    // addition from gtalk's point of view.
    let all: Vec<&ContactRecord> = result.changed.iter().chain(result.added.iter()).collect();
    assert_eq!(all.len(), 1);
    let partial = all[0];

    // The partial aggregate is based on the gtalk constituent and sees
    // local + gtalk data, but not the other source's note.
    assert_eq!(partial.id, gtalk.id);
    assert_eq!(phone_numbers(partial), vec!["1234567".to_owned()]);
    assert_eq!(
        partial.text_values(DetailKind::Hobby, fields::HOBBY),
        vec!["tennis".to_owned()]
    );
    assert!(
        partial
            .text_values(DetailKind::Note, fields::NOTE)
            .is_empty(),
        "Other sources' details are excluded from the partial aggregate"
    );

    // Fetching again from the returned anchor yields nothing.
    let quiet = db
        .fetch_sync_contacts("gtalk", result.new_timestamp, &[])
        .expect("Second fetch succeeds");
    assert!(quiet.changed.is_empty());
    assert!(quiet.added.is_empty());
    assert!(quiet.deleted.is_empty());
    assert_eq!(quiet.new_timestamp, result.new_timestamp);
}

#[test_log::test]
fn sync_update_creates_and_modifies_contacts() {
    let (_dir, db) = temp_db();
    let anchor = before_test();

    // Remote creation.
    let mut remote = ContactRecord::named(None, "Dana", "Droid");
    remote.push_detail(phone("555123"));
    db.update_sync_contacts("svc", ConflictPolicy::PreserveLocalChanges, &[(None, Some(remote))])
        .expect("Sync creation succeeds");

    let fetched = db
        .fetch_sync_contacts("svc", anchor, &[])
        .expect("Fetch succeeds");
    let all: Vec<&ContactRecord> = fetched.changed.iter().chain(fetched.added.iter()).collect();
    assert_eq!(all.len(), 1);
    let partial = all[0].clone();
    let svc_id = partial.id;
    assert_eq!(phone_numbers(&partial), vec!["555123".to_owned()]);

    // Remote modification of the phone number, based on the fetched
    // version: the local value is unchanged, so it applies.
    let mut updated = partial.clone();
    let phone_detail = updated
        .details
        .iter_mut()
        .find(|d| d.kind() == DetailKind::PhoneNumber)
        .unwrap();
    phone_detail.set_value(fields::PHONE_NUMBER, FieldValue::Text("555999".into()));

    db.update_sync_contacts(
        "svc",
        ConflictPolicy::PreserveLocalChanges,
        &[(Some(partial), Some(updated))],
    )
    .expect("Sync modification succeeds");

    let constituent = db.get_contact(svc_id).unwrap().expect("Constituent exists");
    assert_eq!(phone_numbers(&constituent), vec!["555999".to_owned()]);

    // The aggregate was regenerated with the new number.
    let aggregate_id = aggregate_of(&db, svc_id).unwrap();
    let aggregate = db.get_contact(aggregate_id).unwrap().unwrap();
    assert_eq!(phone_numbers(&aggregate), vec!["555999".to_owned()]);
}

#[test_log::test]
fn sync_update_preserves_diverged_local_changes() {
    let (_dir, db) = temp_db();
    let anchor = before_test();

    let mut remote = ContactRecord::named(None, "Dana", "Droid");
    remote.push_detail(phone("555123"));
    db.update_sync_contacts("svc", ConflictPolicy::PreserveLocalChanges, &[(None, Some(remote))])
        .expect("Sync creation succeeds");

    let fetched = db.fetch_sync_contacts("svc", anchor, &[]).unwrap();
    let partial = fetched
        .changed
        .iter()
        .chain(fetched.added.iter())
        .next()
        .unwrap()
        .clone();
    let svc_id = partial.id;

    // The local device edits the number after the peer's fetch.
    let mut constituent = db.get_contact(svc_id).unwrap().unwrap();
    let phone_detail = constituent
        .details
        .iter_mut()
        .find(|d| d.kind() == DetailKind::PhoneNumber)
        .unwrap();
    phone_detail.set_value(fields::PHONE_NUMBER, FieldValue::Text("555777".into()));
    save_one(&db, &mut constituent);

    // The peer sends a modification based on the stale fetched version;
    // the local change wins and the remote change is dropped silently.
    let mut updated = partial.clone();
    let phone_detail = updated
        .details
        .iter_mut()
        .find(|d| d.kind() == DetailKind::PhoneNumber)
        .unwrap();
    phone_detail.set_value(fields::PHONE_NUMBER, FieldValue::Text("555999".into()));

    db.update_sync_contacts(
        "svc",
        ConflictPolicy::PreserveLocalChanges,
        &[(Some(partial), Some(updated))],
    )
    .expect("Sync modification succeeds");

    let constituent = db.get_contact(svc_id).unwrap().unwrap();
    assert_eq!(phone_numbers(&constituent), vec!["555777".to_owned()]);
}

#[test_log::test]
fn sync_update_deletion_removes_only_the_source_constituent() {
    let (_dir, db) = temp_db();

    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    save_one(&db, &mut alice);

    let mut gtalk = ContactRecord::named(Some("gtalk"), "Alice", "Wonderland");
    save_one(&db, &mut gtalk);
    let aggregate_id = aggregate_of(&db, gtalk.id).unwrap();

    let original = ContactRecord::with_id(gtalk.id);
    db.update_sync_contacts(
        "gtalk",
        ConflictPolicy::PreserveLocalChanges,
        &[(Some(original), None)],
    )
    .expect("Sync deletion succeeds");

    assert!(db.get_contact(gtalk.id).unwrap().is_none());
    // The local constituent and the aggregate survive.
    assert!(db.get_contact(alice.id).unwrap().is_some());
    assert!(db.get_contact(aggregate_id).unwrap().is_some());

    // Deleting a contact with no constituent from this source is
    // silently ignored.
    let original = ContactRecord::with_id(alice.id);
    db.update_sync_contacts(
        "gtalk",
        ConflictPolicy::PreserveLocalChanges,
        &[(Some(original), None)],
    )
    .expect("Deletion of local-only contact is a no-op");
    assert!(db.get_contact(alice.id).unwrap().is_some());

    assert_aggregation_invariants(&db, 8);
}

#[test_log::test]
fn preserve_remote_changes_is_not_supported() {
    let (_dir, db) = temp_db();

    let err = db
        .update_sync_contacts("svc", ConflictPolicy::PreserveRemoteChanges, &[])
        .expect_err("PreserveRemoteChanges is specified but unsupported");
    assert_eq!(err.kind(), ErrorKind::NotSupported);
}

#[test_log::test]
fn is_not_edge_prevents_reaggregation() {
    let (_dir, db) = temp_db();

    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    save_one(&db, &mut alice);
    let aggregate_id = aggregate_of(&db, alice.id).unwrap();

    let mut gtalk = ContactRecord::named(Some("gtalk"), "Alice", "Wonderland");
    save_one(&db, &mut gtalk);
    assert_eq!(aggregate_of(&db, gtalk.id), Some(aggregate_id));

    // Record that these two are not the same person, then sever the
    // aggregation edge.
    let mut errors = ErrorMap::new();
    db.save_relationships(
        &[Relationship::is_not(aggregate_id, gtalk.id)],
        &mut errors,
    )
    .expect("IsNot saved");
    db.remove_relationships(
        &[Relationship::aggregates(aggregate_id, gtalk.id)],
        &mut errors,
    )
    .expect("Edge removed");

    // Orphan recovery re-aggregated the gtalk contact, but the IsNot
    // edge excluded the old aggregate.
    let new_aggregate = aggregate_of(&db, gtalk.id).expect("Orphan was re-aggregated");
    assert_ne!(new_aggregate, aggregate_id);

    assert_aggregation_invariants(&db, 10);
}

#[test_log::test]
fn duplicate_relationships_dedup_and_missing_removals_fail() {
    let (_dir, db) = temp_db();

    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    save_one(&db, &mut alice);
    let aggregate_id = aggregate_of(&db, alice.id).unwrap();

    // Saving the already-present aggregation edge is silently dropped.
    let mut errors = ErrorMap::new();
    db.save_relationships(
        &[Relationship::aggregates(aggregate_id, alice.id)],
        &mut errors,
    )
    .expect("Duplicate insert is a no-op");
    assert!(errors.is_empty());

    // Removing a nonexistent edge raises DoesNotExist.
    let err = db
        .remove_relationships(&[Relationship::is_not(aggregate_id, alice.id)], &mut errors)
        .expect_err("Removal of missing edge fails");
    assert_eq!(err.kind(), ErrorKind::DoesNotExist);
    assert_eq!(errors.get(&0), Some(&ErrorKind::DoesNotExist));
}

#[test_log::test]
fn deactivation_detaches_and_reactivation_reattaches() {
    let (_dir, db) = temp_db();

    let mut svc = ContactRecord::named(Some("svc"), "Carol", "Chrome");
    save_one(&db, &mut svc);
    let aggregate_id = aggregate_of(&db, svc.id).unwrap();

    // Deactivate: the aggregate loses its only active constituent.
    let mut record = db.get_contact(svc.id).unwrap().unwrap();
    record.push_detail(Detail::new(DetailKind::Deactivated));
    save_one(&db, &mut record);

    assert!(db.get_contact(aggregate_id).unwrap().is_none());
    let stored = db.get_contact(svc.id).unwrap().unwrap();
    assert!(stored.is_deactivated());

    // Reactivate: a fresh aggregate is attached.
    let mut record = db.get_contact(svc.id).unwrap().unwrap();
    record.remove_details(DetailKind::Deactivated);
    save_one(&db, &mut record);

    assert!(aggregate_of(&db, svc.id).is_some());
    assert_aggregation_invariants(&db, 10);
}

#[test_log::test]
fn local_contacts_cannot_be_deactivated() {
    let (_dir, db) = temp_db();

    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    alice.push_detail(Detail::new(DetailKind::Deactivated));

    let mut errors = ErrorMap::new();
    let err = db
        .save_contacts(std::slice::from_mut(&mut alice), &[], &mut errors)
        .expect_err("Local contacts cannot be deactivated");
    assert_eq!(err.kind(), ErrorKind::BadArgument);
}

#[test_log::test]
fn presence_only_update_is_routed_to_transient_store() {
    let dir = tempdir().expect("Temp dir");
    let store = Arc::new(MemoryTransientStore::default());
    let db = ContactsDb::open(dir.path().join("contacts.db"))
        .expect("Open database")
        .with_transient_store(store.clone());

    let mut alice = ContactRecord::named(None, "Alice", "Wonderland");
    alice.push_detail(
        Detail::new(DetailKind::Presence)
            .with_int(fields::PRESENCE_STATE, 6), // Offline
    );
    save_one(&db, &mut alice);

    let mut presence_rx = db.subscribe_presence_changed();

    // Presence flips to Available; masked as a presence-only update.
    let mut update = db.get_contact(alice.id).unwrap().unwrap();
    let presence = update
        .details
        .iter_mut()
        .find(|d| d.kind() == DetailKind::Presence)
        .unwrap();
    presence.set_value(fields::PRESENCE_STATE, FieldValue::Int(1));

    let mut errors = ErrorMap::new();
    db.save_contacts(
        std::slice::from_mut(&mut update),
        &[DetailKind::Presence],
        &mut errors,
    )
    .expect("Presence update succeeds");

    // The durable row kept the old presence; the transient store holds
    // the new state, and the denormalized flag was refreshed.
    let durable = db.get_contact(alice.id).unwrap().unwrap();
    let durable_presence = durable.detail(DetailKind::Presence).unwrap();
    assert_eq!(durable_presence.int(fields::PRESENCE_STATE), Some(6));
    assert!(
        durable
            .detail(DetailKind::StatusFlags)
            .and_then(|d| d.bool_value(fields::IS_ONLINE))
            .unwrap_or(false),
        "isOnline reflects the transient presence"
    );

    let (_ts, transient_details) = store
        .transient_details(alice.id)
        .expect("Transient entry exists");
    assert!(
        transient_details
            .iter()
            .any(|d| d.kind() == DetailKind::Presence && d.int(fields::PRESENCE_STATE) == Some(1))
    );

    assert_eq!(presence_rx.try_recv().expect("Presence signal"), vec![alice.id]);

    // A durable update purges the transient entry.
    let mut update = db.get_contact(alice.id).unwrap().unwrap();
    update.push_detail(email("alice@wonderland.example"));
    save_one(&db, &mut update);
    assert!(store.transient_details(alice.id).is_none());
}

#[test_log::test]
fn notifications_fire_per_category_after_commit() {
    let (_dir, db) = temp_db();

    let mut added_rx = db.subscribe_contacts_added();
    let mut changed_rx = db.subscribe_contacts_changed();
    let mut removed_rx = db.subscribe_contacts_removed();
    let mut sync_rx = db.subscribe_sync_contacts_changed();

    let mut svc = ContactRecord::named(Some("svc"), "Carol", "Chrome");
    save_one(&db, &mut svc);
    let aggregate_id = aggregate_of(&db, svc.id).unwrap();

    let added = added_rx.try_recv().expect("Added signal");
    assert!(added.contains(&svc.id));
    assert!(added.contains(&aggregate_id));
    assert_eq!(sync_rx.try_recv().expect("Sync targets signal"), vec!["svc".to_owned()]);

    let mut update = db.get_contact(svc.id).unwrap().unwrap();
    update.push_detail(phone("999"));
    save_one(&db, &mut update);
    let changed = changed_rx.try_recv().expect("Changed signal");
    assert!(changed.contains(&svc.id));

    let mut errors = ErrorMap::new();
    db.remove_contacts(&[svc.id], &mut errors).expect("Remove succeeds");
    let removed = removed_rx.try_recv().expect("Removed signal");
    assert!(removed.contains(&svc.id));
    assert!(removed.contains(&aggregate_id));
}

#[test_log::test]
fn save_then_fetch_is_a_superset() {
    let (_dir, db) = temp_db();

    let mut contact = ContactRecord::named(None, "Alice", "Wonderland");
    contact.push_detail(phone("1234567"));
    contact.push_detail(email("alice@wonderland.example"));
    let supplied = contact.clone();
    save_one(&db, &mut contact);

    let fetched = db.get_contact(contact.id).unwrap().unwrap();

    // Every supplied value comes back...
    assert_eq!(fetched.first_name(), supplied.first_name());
    assert_eq!(fetched.last_name(), supplied.last_name());
    assert_eq!(phone_numbers(&fetched), phone_numbers(&supplied));
    assert_eq!(
        fetched.text_values(DetailKind::EmailAddress, fields::EMAIL_ADDRESS),
        supplied.text_values(DetailKind::EmailAddress, fields::EMAIL_ADDRESS)
    );

    // ...plus engine-derived details.
    assert!(fetched.detail(DetailKind::DisplayLabel).is_some());
    assert!(fetched.detail(DetailKind::Timestamp).is_some());
    assert!(fetched.detail(DetailKind::StatusFlags).is_some());
    assert_eq!(fetched.display_label(), Some("Alice Wonderland"));
}

#[test_log::test]
fn oob_round_trip_with_compression() {
    let (_dir, db) = temp_db();

    let compressible = vec![7u8; 4096];
    let incompressible: Vec<u8> = (0..4096u32).map(|i| (i * 131 + 89) as u8).collect();
    let long_text = "carddav anchor ".repeat(64);

    let mut values = BTreeMap::new();
    values.insert("smallText".to_owned(), OobValue::Text("anchor-1".into()));
    values.insert("largeText".to_owned(), OobValue::Text(long_text.clone()));
    values.insert("smallBlob".to_owned(), OobValue::Bytes(vec![1, 2, 3]));
    values.insert("largeBlob".to_owned(), OobValue::Bytes(compressible.clone()));
    values.insert("noisyBlob".to_owned(), OobValue::Bytes(incompressible.clone()));
    values.insert("counter".to_owned(), OobValue::Int(42));

    db.store_oob("sync/svc", &values).expect("Store succeeds");

    let fetched = db.fetch_oob("sync/svc", &[]).expect("Fetch succeeds");
    assert_eq!(fetched, values);

    info!(count = fetched.len(), "Round-tripped OOB values");

    db.remove_oob("sync/svc", &["counter"]).expect("Remove succeeds");
    let fetched = db.fetch_oob("sync/svc", &["counter"]).expect("Fetch succeeds");
    assert!(fetched.is_empty());

    db.remove_oob_all("sync/svc").expect("Scope removal succeeds");
    assert!(db.fetch_oob("sync/svc", &[]).expect("Fetch succeeds").is_empty());
}

#[test_log::test]
fn self_identity_is_fixed() {
    let (_dir, db) = temp_db();

    assert_eq!(db.self_contact_id().unwrap(), ContactId::SELF_AGGREGATE);

    let err = db
        .set_identity(crate::Identity::SelfContact, ContactId::new(9))
        .expect_err("Identities cannot be changed externally");
    assert_eq!(err.kind(), ErrorKind::NotSupported);
}

#[test_log::test]
fn update_regenerates_the_aggregate_name() {
    let (_dir, db) = temp_db();

    let mut svc = ContactRecord::named(Some("svc"), "Carol", "Chrome");
    save_one(&db, &mut svc);
    let aggregate_id = aggregate_of(&db, svc.id).unwrap();

    let mut update = db.get_contact(svc.id).unwrap().unwrap();
    let name = update.detail_mut(DetailKind::Name).unwrap();
    name.set_value(fields::LAST_NAME, FieldValue::Text("Firefox".into()));
    save_one(&db, &mut update);

    let aggregate = db.get_contact(aggregate_id).unwrap().unwrap();
    assert_eq!(aggregate.last_name(), Some("Firefox"));
    assert_eq!(aggregate.display_label(), Some("Carol Firefox"));
}
