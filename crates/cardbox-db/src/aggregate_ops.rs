//! Aggregation engine.
//!
//! Maintains exactly one `aggregate` contact per real-world person:
//! matches incoming constituents to existing aggregates by heuristic
//! scoring, promotes constituent details onto aggregates, applies edits
//! made directly on an aggregate back down to its constituents, and
//! rebuilds aggregates from scratch when constituents change or
//! disappear.

use cardbox_core::detail::fields;
use cardbox_core::{
    ContactId, ContactRecord, Detail, DetailKind, FieldValue, SyncTarget, normalize_phone_number,
};
use rusqlite::{Connection, OptionalExtension as _, params};
use tracing::debug;

use crate::registry::{self, IDENTITY_KINDS};
use crate::{
    ChangeSet, ContactsDb, DbResult, LOG_TARGET, UnspecifiedSnafu, WriteTxCtx, comparator,
    contact_store, relationship_ops, schema, writer,
};

/// A candidate must reach this score to be selected; 15 exactly attaches.
const MINIMUM_MATCH_SCORE: i64 = 15;

// ---- Matching heuristic ----

/// Searches existing aggregates for one that represents the same person
/// as the incoming contact.
///
/// Candidates are aggregates with a compatible last name, a
/// non-contradicting gender, no `IsNot` edge to the incoming contact,
/// excluding the self aggregate and deactivated rows. Candidates are
/// scored by accumulating weighted name/nickname/email/phone/account
/// matches; the best candidate wins if it reaches the threshold.
pub(crate) fn find_matching_aggregate(
    conn: &Connection,
    contact: &ContactRecord,
) -> DbResult<Option<ContactId>> {
    let first_name = contact.first_name().unwrap_or("").to_lowercase();
    let last_name = contact.last_name().unwrap_or("").to_lowercase();
    let nickname = contact
        .details_of(DetailKind::Nickname)
        .find_map(|d| d.text(fields::NICKNAME))
        .unwrap_or("")
        .to_lowercase();
    let exclude_gender = match contact.gender() {
        Some("Male") => "Female",
        Some("Female") => "Male",
        _ => "none",
    };

    let email_addresses = contact
        .text_values(DetailKind::EmailAddress, fields::EMAIL_ADDRESS)
        .into_iter()
        .map(|s| s.to_lowercase());
    let phone_numbers = contact
        .text_values(DetailKind::PhoneNumber, fields::PHONE_NUMBER)
        .into_iter()
        .map(|s| normalize_phone_number(&s));
    let account_uris = contact
        .text_values(DetailKind::OnlineAccount, fields::ACCOUNT_URI)
        .into_iter()
        .map(|s| s.to_lowercase());

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS temp.possibleAggregates (contactId INTEGER); \
         DELETE FROM temp.possibleAggregates;",
    )?;
    conn.execute(
        "INSERT INTO temp.possibleAggregates (contactId) \
         SELECT contactId FROM Contacts \
         WHERE Contacts.syncTarget = 'aggregate' \
         AND (COALESCE(Contacts.lowerLastName, '') = '' OR COALESCE(?1, '') = '' OR Contacts.lowerLastName = ?1) \
         AND COALESCE(Contacts.gender, '') != ?2 \
         AND contactId > 2 \
         AND isDeactivated = 0 \
         AND contactId NOT IN ( \
             SELECT secondId FROM Relationships WHERE firstId = ?3 AND type = 'IsNot' \
             UNION \
             SELECT firstId FROM Relationships WHERE secondId = ?3 AND type = 'IsNot' \
         ) \
         ORDER BY contactId ASC",
        params![last_name, exclude_gender, contact.id],
    )?;

    schema::create_temp_values(conn, "matchEmailAddresses", email_addresses)?;
    schema::create_temp_values(conn, "matchPhoneNumbers", phone_numbers)?;
    schema::create_temp_values(conn, "matchOnlineAccounts", account_uris)?;

    let row = conn
        .query_row(
            " SELECT Matches.contactId, sum(Matches.score) AS total FROM (\
                 SELECT Contacts.contactId, 20 AS score FROM Contacts \
                 INNER JOIN temp.possibleAggregates ON Contacts.contactId = temp.possibleAggregates.contactId \
                     WHERE lowerLastName != '' AND lowerLastName = ?2 \
                     AND lowerFirstName != '' AND lowerFirstName = ?1 \
                 UNION \
                 SELECT Contacts.contactId, 15 AS score FROM Contacts \
                 INNER JOIN temp.possibleAggregates ON Contacts.contactId = temp.possibleAggregates.contactId \
                     WHERE COALESCE(lowerFirstName, '') = '' AND COALESCE(?1, '') = '' \
                     AND COALESCE(lowerLastName, '') = '' AND COALESCE(?2, '') = '' \
                     AND EXISTS (\
                         SELECT * FROM Nicknames \
                         WHERE Nicknames.contactId = Contacts.contactId \
                         AND lowerNickname = ?3) \
                 UNION \
                 SELECT Contacts.contactId, 12 AS score FROM Contacts \
                 INNER JOIN temp.possibleAggregates ON Contacts.contactId = temp.possibleAggregates.contactId \
                     WHERE (COALESCE(lowerLastName, '') = '' OR COALESCE(?2, '') = '') \
                     AND lowerFirstName != '' AND lowerFirstName = ?1 \
                 UNION \
                 SELECT Contacts.contactId, 12 AS score FROM Contacts \
                 INNER JOIN temp.possibleAggregates ON Contacts.contactId = temp.possibleAggregates.contactId \
                     WHERE lowerLastName != '' AND lowerLastName = ?2 \
                     AND (COALESCE(lowerFirstName, '') = '' OR COALESCE(?1, '') = '') \
                 UNION \
                 SELECT EmailAddresses.contactId, 3 AS score FROM EmailAddresses \
                 INNER JOIN temp.possibleAggregates ON EmailAddresses.contactId = temp.possibleAggregates.contactId \
                 INNER JOIN temp.matchEmailAddresses ON EmailAddresses.lowerEmailAddress = temp.matchEmailAddresses.value \
                 UNION \
                 SELECT PhoneNumbers.contactId, 3 AS score FROM PhoneNumbers \
                 INNER JOIN temp.possibleAggregates ON PhoneNumbers.contactId = temp.possibleAggregates.contactId \
                 INNER JOIN temp.matchPhoneNumbers ON PhoneNumbers.normalizedNumber = temp.matchPhoneNumbers.value \
                 UNION \
                 SELECT OnlineAccounts.contactId, 3 AS score FROM OnlineAccounts \
                 INNER JOIN temp.possibleAggregates ON OnlineAccounts.contactId = temp.possibleAggregates.contactId \
                 INNER JOIN temp.matchOnlineAccounts ON OnlineAccounts.lowerAccountUri = temp.matchOnlineAccounts.value \
                 UNION \
                 SELECT Nicknames.contactId, 1 AS score FROM Nicknames \
                 INNER JOIN temp.possibleAggregates ON Nicknames.contactId = temp.possibleAggregates.contactId \
                     WHERE lowerNickname != '' AND lowerNickname = ?3 \
             ) AS Matches \
             GROUP BY Matches.contactId \
             ORDER BY total DESC \
             LIMIT 1",
            params![first_name, last_name, nickname],
            |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    Ok(row.and_then(|(aggregate_id, score)| {
        debug!(
            target: LOG_TARGET,
            aggregate_id,
            score,
            contact_id = %contact.id,
            "Best aggregate match"
        );
        (score >= MINIMUM_MATCH_SCORE).then(|| ContactId::new(aggregate_id))
    }))
}

// ---- Promotion ----

/// Whether a detail kind takes part in promotion. Timestamp is promoted
/// in every update regardless of the mask.
pub(crate) fn promote_detail_kind(kind: DetailKind, mask: &[DetailKind], force: bool) -> bool {
    if kind == DetailKind::Timestamp {
        return true;
    }
    if !mask.is_empty() && !mask.contains(&kind) {
        return false;
    }
    let schema = registry::schema(kind);
    if force {
        !schema.absolutely_unpromoted
    } else {
        !schema.unpromoted
    }
}

fn fill_if_empty(target: &mut Detail, source: &Detail, field: &'static str) {
    let value = source.text(field).filter(|s| !s.is_empty());
    if let Some(value) = value {
        if target.text(field).is_none_or(str::is_empty) {
            target.set_value(field, FieldValue::Text(value.to_owned()));
        }
    }
}

/// Promotes every eligible detail of `contact` onto `aggregate`.
///
/// Composed kinds are merged field-by-field into the aggregate's single
/// instance; everything else is copied unless an equivalent detail is
/// already present. Copies keep the source detail's provenance, and
/// copies from unmodifiable remote constituents become read-only.
pub(crate) fn promote_details_to_aggregate(
    contact: &ContactRecord,
    aggregate: &mut ContactRecord,
    mask: &[DetailKind],
    force: bool,
) {
    let sync_target = contact.sync_target_or_local();

    for original in &contact.details {
        let kind = original.kind();
        if !promote_detail_kind(kind, mask, force) {
            continue;
        }

        match kind {
            DetailKind::Name => {
                let mut name = aggregate
                    .detail(DetailKind::Name)
                    .cloned()
                    .unwrap_or_else(|| Detail::new(DetailKind::Name));
                for field in [
                    fields::PREFIX,
                    fields::FIRST_NAME,
                    fields::MIDDLE_NAME,
                    fields::LAST_NAME,
                    fields::SUFFIX,
                    fields::CUSTOM_LABEL,
                ] {
                    fill_if_empty(&mut name, original, field);
                }
                aggregate.set_singular(name);
            }
            DetailKind::Timestamp => {
                let mut timestamps = aggregate
                    .detail(DetailKind::Timestamp)
                    .cloned()
                    .unwrap_or_else(|| Detail::new(DetailKind::Timestamp));
                if let Some(modified) = original.timestamp(fields::MODIFIED) {
                    if timestamps
                        .timestamp(fields::MODIFIED)
                        .is_none_or(|existing| modified > existing)
                    {
                        timestamps.set_value(fields::MODIFIED, FieldValue::Timestamp(modified));
                    }
                }
                if let Some(created) = original.timestamp(fields::CREATED) {
                    if timestamps.timestamp(fields::CREATED).is_none() {
                        timestamps.set_value(fields::CREATED, FieldValue::Timestamp(created));
                    }
                }
                aggregate.set_singular(timestamps);
            }
            DetailKind::Gender => {
                let gender = original.text(fields::GENDER);
                let determined = matches!(gender, Some("Male") | Some("Female"));
                let aggregate_determined =
                    matches!(aggregate.gender(), Some("Male") | Some("Female"));
                if determined && !aggregate_determined {
                    aggregate.set_singular(
                        Detail::new(DetailKind::Gender)
                            .with_text(fields::GENDER, gender.unwrap_or("")),
                    );
                }
            }
            DetailKind::Favorite => {
                let favorite = original.bool_value(fields::IS_FAVORITE).unwrap_or(false);
                if favorite && !aggregate.is_favorite() {
                    aggregate.set_singular(
                        Detail::new(DetailKind::Favorite).with_bool(fields::IS_FAVORITE, true),
                    );
                }
            }
            DetailKind::Birthday => {
                let existing = aggregate
                    .detail(DetailKind::Birthday)
                    .and_then(|d| d.date(fields::BIRTHDAY));
                if existing.is_none() {
                    if let Some(date) = original.date(fields::BIRTHDAY) {
                        aggregate.set_singular(
                            Detail::new(DetailKind::Birthday).with_date(fields::BIRTHDAY, date),
                        );
                    }
                }
            }
            _ => {
                let already_present = aggregate
                    .details
                    .iter()
                    .any(|existing| comparator::details_equivalent(original, existing));
                if already_present {
                    continue;
                }

                let mut copy = original.clone();
                copy.id = None;
                if !sync_target.is_local_kind() && original.modifiable != Some(true) {
                    copy.access = cardbox_core::AccessConstraints::READ_ONLY_IRREMOVABLE;
                }
                // Provenance is carried from the source copy; for details
                // loaded from the database it names the constituent.
                aggregate.push_detail(copy);
            }
        }
    }
}

// ---- Attachment (create/update path) ----

/// Attaches a newly-created or newly-syncable contact to an aggregate:
/// the best heuristic match when one qualifies, a fresh aggregate
/// otherwise. Returns the aggregate id.
pub(crate) fn update_or_create_aggregate(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    contact: &mut ContactRecord,
    mask: &[DetailKind],
    change_set: &mut ChangeSet,
) -> DbResult<ContactId> {
    // An incidental contact already knows which aggregate it belongs to.
    let incidental_aggregate = contact
        .detail(DetailKind::Incidental)
        .and_then(|d| d.int(fields::AGGREGATE_ID))
        .map(|id| ContactId::new(id as u32));

    let existing_id = match incidental_aggregate {
        Some(id) => Some(id),
        None => find_matching_aggregate(ctx, contact)?,
    };

    let (mut aggregate, created) = match existing_id {
        Some(id) => {
            let record = contact_store::get_contact(ctx, id)?.ok_or_else(|| {
                UnspecifiedSnafu {
                    reason: format!("matched aggregate {id} could not be read"),
                }
                .build()
            })?;
            (record, false)
        }
        None => {
            let mut fresh = ContactRecord::new();
            fresh.set_sync_target(&SyncTarget::Aggregate);
            (fresh, true)
        }
    };

    promote_details_to_aggregate(contact, &mut aggregate, mask, false);

    writer::save_contact_tx(db, ctx, &mut aggregate, &[], true, change_set)?;

    // Add the edge directly: the relationship-store path would trigger
    // another (redundant) regeneration of this same aggregate.
    ctx.execute(
        "INSERT OR IGNORE INTO Relationships (firstId, secondId, type) VALUES (?1, ?2, 'Aggregates')",
        params![aggregate.id, contact.id],
    )?;

    if created {
        change_set.aggregate_created(aggregate.id);
    } else {
        change_set.aggregate_updated(aggregate.id);
    }

    Ok(aggregate.id)
}

/// Post-attachment bookkeeping: when a `local` contact joins an
/// aggregate that predates it, the aggregate's older `local` constituent
/// is retargeted to `was_local` so the new contact becomes the `local`;
/// when the aggregate gains its first `local`, it is regenerated because
/// detail precedence has changed.
pub(crate) fn set_aggregate(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    contact: &mut ContactRecord,
    update: bool,
    mask: &[DetailKind],
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    let contact_id = contact.id;
    let aggregate_id = update_or_create_aggregate(db, ctx, contact, mask, change_set)?;

    if !update && aggregate_id >= contact_id {
        return Ok(());
    }

    let local_count: i64 = ctx.query_row(
        "SELECT COUNT(*) FROM Relationships \
         JOIN Contacts ON Contacts.contactId = Relationships.secondId \
         WHERE Relationships.firstId = ?1 \
         AND Relationships.type = 'Aggregates' \
         AND Contacts.syncTarget = 'local'",
        params![aggregate_id],
        |row| row.get(0),
    )?;

    if local_count > 1 {
        ctx.execute(
            "UPDATE Contacts SET syncTarget = 'was_local' WHERE contactId = ?1",
            params![contact_id],
        )?;
    } else if contact.sync_target_or_local() == SyncTarget::Local && !contact.is_incidental() {
        regenerate_aggregates(db, ctx, &[aggregate_id], mask, change_set)?;
    }

    Ok(())
}

// ---- Down-promotion (editing an aggregate directly) ----

/// The details of a contact that participate in delta computation.
/// Timestamps are excluded; they are engine-maintained and would turn
/// every comparison into a spurious difference.
pub(crate) fn promotable_details(
    contact: &ContactRecord,
    mask: &[DetailKind],
    force: bool,
) -> Vec<Detail> {
    contact
        .details
        .iter()
        .filter(|d| promote_detail_kind(d.kind(), mask, force))
        .filter(|d| d.kind() != DetailKind::Timestamp)
        .cloned()
        .collect()
}

/// Drops pairwise-equivalent details from both lists, leaving only the
/// differences between the stored and updated versions.
pub(crate) fn remove_equivalent_details(original: &mut Vec<Detail>, updated: &mut Vec<Detail>) {
    original.retain(|orig| {
        if let Some(pos) = updated
            .iter()
            .position(|upd| comparator::details_equivalent(orig, upd))
        {
            updated.remove(pos);
            false
        } else {
            true
        }
    });
}

/// Modifications redirected to specific constituents, keyed by
/// constituent contact id.
#[derive(Default)]
struct ConstituentEdits {
    modifications: Vec<(cardbox_core::Provenance, Detail)>,
    removals: Vec<cardbox_core::Provenance>,
}

/// Applies a direct edit of an aggregate by computing the delta against
/// the stored version: changes to details promoted from modifiable
/// constituents are applied to those constituents; everything else lands
/// on the aggregate's `local` constituent, creating an incidental one if
/// necessary. The aggregate is then regenerated (or clobbered when no
/// regeneration occurred).
pub(crate) fn update_local_and_aggregate(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    contact: &mut ContactRecord,
    mask: &[DetailKind],
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    let stored = contact_store::get_contact(ctx, contact.id)?.ok_or_else(|| {
        UnspecifiedSnafu {
            reason: format!("aggregate {} could not be read for delta", contact.id),
        }
        .build()
    })?;

    let mut original_details = promotable_details(&stored, mask, false);
    let mut update_details = promotable_details(contact, mask, false);
    remove_equivalent_details(&mut original_details, &mut update_details);

    // Redirect changes to details whose provenance names a modifiable
    // constituent detail.
    let mut edits: std::collections::BTreeMap<ContactId, ConstituentEdits> = Default::default();
    original_details.retain(|orig| {
        let Some(provenance) = orig.provenance.clone() else {
            return true;
        };
        let modifiable = modifiable_provenance(ctx, &provenance).unwrap_or(false);
        if !modifiable {
            return true;
        }

        let entry = edits.entry(provenance.contact_id).or_default();
        if let Some(pos) = update_details
            .iter()
            .position(|upd| upd.provenance.as_ref() == Some(&provenance))
        {
            entry
                .modifications
                .push((provenance, update_details.remove(pos)));
        } else {
            entry.removals.push(provenance);
        }
        false
    });

    let mut write_list: Vec<ContactRecord> = Vec::new();
    for (constituent_id, edit) in edits {
        let mut constituent =
            contact_store::get_contact(ctx, constituent_id)?.ok_or_else(|| {
                UnspecifiedSnafu {
                    reason: format!("constituent {constituent_id} could not be read for delta"),
                }
                .build()
            })?;

        for provenance in &edit.removals {
            constituent
                .details
                .retain(|d| d.provenance.as_ref() != Some(provenance));
        }
        for (provenance, updated) in &edit.modifications {
            if let Some(existing) = constituent
                .details
                .iter_mut()
                .find(|d| d.provenance.as_ref() == Some(provenance))
            {
                let preserved_id = existing.id;
                let preserved_provenance = existing.provenance.clone();
                let preserved_access = existing.access;
                *existing = updated.clone();
                existing.id = preserved_id;
                existing.provenance = preserved_provenance;
                existing.access = preserved_access;
            }
        }
        write_list.push(constituent);
    }

    if original_details.is_empty() && update_details.is_empty() && write_list.is_empty() {
        return Ok(());
    }

    let mut created_new_local = false;
    if !original_details.is_empty() || !update_details.is_empty() {
        let local_id: Option<u32> = ctx
            .query_row(
                "SELECT DISTINCT Contacts.contactId FROM Contacts \
                 JOIN Relationships ON Relationships.secondId = Contacts.contactId \
                 WHERE Contacts.syncTarget = 'local' \
                 AND Relationships.firstId = ?1 \
                 AND Relationships.type = 'Aggregates'",
                params![contact.id],
                |row| row.get(0),
            )
            .optional()?;

        let mut local = match local_id {
            Some(id) => contact_store::get_contact(ctx, ContactId::new(id))?.ok_or_else(|| {
                UnspecifiedSnafu {
                    reason: format!("local constituent {id} could not be read"),
                }
                .build()
            })?,
            None => {
                created_new_local = true;
                // The incidental constituent records its aggregate so it
                // is associated before the Aggregates edge is written.
                let mut fresh = ContactRecord::new();
                fresh.push_detail(
                    Detail::new(DetailKind::Incidental)
                        .with_int(fields::AGGREGATE_ID, i64::from(contact.id.as_u32())),
                );
                fresh.set_sync_target(&SyncTarget::Local);
                copy_name_details(contact, &mut fresh);
                fresh
            }
        };

        promote_details_to_local(&original_details, &update_details, &mut local);
        write_list.push(local);
    }

    let mut aggregate_regenerated = false;
    let mut new_local_id = ContactId::UNSAVED;
    let last = write_list.len().saturating_sub(1);
    for (i, constituent) in write_list.iter_mut().enumerate() {
        let regenerated = writer::save_contact_tx(db, ctx, constituent, mask, true, change_set)?;
        aggregate_regenerated = aggregate_regenerated || regenerated;
        if i == last && created_new_local {
            new_local_id = constituent.id;
        }
    }

    if created_new_local {
        ctx.execute(
            "INSERT OR IGNORE INTO Relationships (firstId, secondId, type) VALUES (?1, ?2, 'Aggregates')",
            params![contact.id, new_local_id],
        )?;
        // Regenerate so the incidental's details flow back up with local
        // precedence.
        regenerate_aggregates(db, ctx, &[contact.id], mask, change_set)?;
        aggregate_regenerated = true;
    }

    if !aggregate_regenerated {
        // No constituent save touched the aggregate; clobber it with the
        // caller's version.
        writer::save_contact_tx(db, ctx, contact, mask, true, change_set)?;
        change_set.aggregate_updated(contact.id);
    }

    Ok(())
}

/// Whether the detail named by a provenance string is marked modifiable.
fn modifiable_provenance(conn: &Connection, provenance: &cardbox_core::Provenance) -> DbResult<bool> {
    let modifiable: Option<bool> = conn
        .query_row(
            "SELECT modifiable FROM Details WHERE detailId = ?1 AND contactId = ?2",
            params![provenance.detail_id, provenance.contact_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(modifiable == Some(true))
}

pub(crate) fn copy_name_details(src: &ContactRecord, dst: &mut ContactRecord) {
    let name = src.detail(DetailKind::Name);
    let has_proper_name = name.is_some_and(|d| {
        d.text(fields::FIRST_NAME).is_some_and(|s| !s.is_empty())
            || d.text(fields::LAST_NAME).is_some_and(|s| !s.is_empty())
    });

    if !has_proper_name {
        if let Some(nick) = src
            .details_of(DetailKind::Nickname)
            .find(|d| d.text(fields::NICKNAME).is_some_and(|s| !s.is_empty()))
        {
            let mut copy = nick.clone();
            copy.id = None;
            copy.provenance = None;
            copy.detail_uri = None;
            copy.linked_detail_uris.clear();
            dst.push_detail(copy);
            return;
        }
    }

    if let Some(name) = name {
        let mut copy = name.clone();
        copy.id = None;
        copy.provenance = None;
        copy.detail_uri = None;
        copy.linked_detail_uris.clear();
        dst.push_detail(copy);
    }
}

/// Applies an aggregate-edit delta to the local constituent.
fn promote_details_to_local(
    rem_delta: &[Detail],
    add_delta: &[Detail],
    local: &mut ContactRecord,
) {
    // Removals may not apply (e.g. the removed detail came from a synced
    // constituent, not the local); such removals are ignored, and the
    // details remembered so they are not re-added below.
    let mut not_present_in_local: Vec<&Detail> = Vec::new();
    for det in rem_delta {
        let kind = det.kind();
        if registry::schema(kind).composed || kind == DetailKind::StatusFlags {
            local.remove_details(kind);
        } else if let Some(pos) = local
            .details
            .iter()
            .position(|ld| comparator::details_equivalent(ld, det))
        {
            local.details.remove(pos);
        } else {
            not_present_in_local.push(det);
        }
    }

    for original in add_delta {
        let kind = original.kind();
        if registry::schema(kind).composed {
            // Composed kinds replace the local's single instance outright.
            let mut replacement = original.clone();
            replacement.id = None;
            replacement.provenance = None;
            local.set_singular(replacement);
        } else {
            let mut det = original.clone();
            det.id = None;
            // A local detail does not reproduce another contact's URIs.
            det.detail_uri = None;
            det.linked_detail_uris.clear();

            let already_present = local
                .details
                .iter()
                .any(|ld| comparator::details_equivalent(&det, ld))
                || not_present_in_local
                    .iter()
                    .any(|nd| comparator::details_equivalent(&det, nd));
            if !already_present {
                det.provenance = None;
                local.push_detail(det);
            }
        }
    }
}

// ---- Regeneration ----

/// Rebuilds each aggregate's promoted details from its current
/// constituents: identity details and unmasked existing details are
/// kept, then details are re-promoted with the `local` constituent
/// taking precedence. Aggregates left without active constituents are
/// removed.
pub(crate) fn regenerate_aggregates(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    aggregate_ids: &[ContactId],
    mask: &[DetailKind],
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    let mut regenerated: std::collections::BTreeSet<ContactId> = Default::default();
    let mut to_remove: Vec<ContactId> = Vec::new();

    for aggregate_id in aggregate_ids {
        if !regenerated.insert(*aggregate_id) {
            continue;
        }

        let Some(original) = contact_store::get_contact(ctx, *aggregate_id)? else {
            continue;
        };
        if original.sync_target() != Some(SyncTarget::Aggregate) {
            debug!(target: LOG_TARGET, id = %aggregate_id, "Skipping regeneration of non-aggregate");
            continue;
        }

        let constituent_ids = relationship_ops::constituent_ids_for(ctx, *aggregate_id)?;
        let mut constituents = Vec::with_capacity(constituent_ids.len());
        for id in constituent_ids {
            if let Some(constituent) = contact_store::get_contact(ctx, id)? {
                constituents.push(constituent);
            }
        }

        if !constituents.iter().any(|c| !c.is_deactivated()) {
            to_remove.push(*aggregate_id);
            change_set.aggregate_childless(*aggregate_id);
            continue;
        }

        let mut aggregate = ContactRecord::with_id(*aggregate_id);

        // Keep identity details and whatever this update does not touch.
        for detail in &original.details {
            let kind = detail.kind();
            if IDENTITY_KINDS.contains(&kind) || !promote_detail_kind(kind, mask, false) {
                aggregate.push_detail(detail.clone());
            }
        }

        // The local constituent's details are promoted first and taken
        // verbatim; other constituents compose around them.
        if let Some(local) = constituents
            .iter()
            .find(|c| !c.is_deactivated() && c.sync_target() == Some(SyncTarget::Local))
        {
            for detail in &local.details {
                if promote_detail_kind(detail.kind(), mask, false) {
                    aggregate.push_detail(detail.clone());
                }
            }
        }

        for constituent in &constituents {
            if constituent.is_deactivated()
                || constituent.sync_target() == Some(SyncTarget::Local)
            {
                continue;
            }
            promote_details_to_aggregate(constituent, &mut aggregate, mask, false);
        }

        writer::save_contact_tx(db, ctx, &mut aggregate, mask, true, change_set)?;
        change_set.aggregate_updated(*aggregate_id);
    }

    if !to_remove.is_empty() {
        contact_store::remove_contact_rows(ctx, &to_remove)?;
        for id in to_remove {
            change_set.aggregate_removed(id);
        }
    }

    Ok(())
}

// ---- Pruning and orphan recovery ----

/// Removes aggregates that no longer aggregate anything.
pub(crate) fn remove_childless_aggregates(
    ctx: &WriteTxCtx,
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    let childless: Vec<ContactId> = {
        let mut stmt = ctx.prepare(
            "SELECT contactId FROM Contacts WHERE syncTarget = 'aggregate' AND contactId NOT IN (\
                 SELECT DISTINCT firstId FROM Relationships WHERE type = 'Aggregates'\
             )",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    if !childless.is_empty() {
        debug!(target: LOG_TARGET, count = childless.len(), "Pruning childless aggregates");
        contact_store::remove_contact_rows(ctx, &childless)?;
        for id in childless {
            change_set.aggregate_removed(id);
        }
    }

    Ok(())
}

/// Finds non-aggregate contacts with no aggregate and attaches each to
/// one (matching or fresh).
pub(crate) fn aggregate_orphaned_contacts(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    let orphan_ids: Vec<ContactId> = {
        let mut stmt = ctx.prepare(
            "SELECT contactId FROM Contacts WHERE syncTarget != 'aggregate' AND isDeactivated = 0 \
             AND contactId NOT IN (\
                 SELECT DISTINCT secondId FROM Relationships WHERE type = 'Aggregates'\
             )",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    for id in orphan_ids {
        let Some(mut orphan) = contact_store::get_contact(ctx, id)? else {
            continue;
        };
        update_or_create_aggregate(db, ctx, &mut orphan, &[], change_set)?;
    }

    Ok(())
}

/// Commit-time step of the aggregate lifecycle: a childless-pending
/// aggregate that gained a constituent during the transaction is revived
/// to `Updated`; the rest transition to `Removed` now.
pub(crate) fn prune_childless_at_commit(
    ctx: &WriteTxCtx,
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    for id in change_set.childless_pending() {
        let constituents = relationship_ops::constituent_ids_for(ctx, id)?;
        let active = !constituents.is_empty()
            && constituent_has_active(ctx, &constituents)?;
        if active {
            change_set.aggregate_updated(id);
        } else if contact_store::contact_sync_target(ctx, id)?.is_some() {
            contact_store::remove_contact_rows(ctx, &[id])?;
            change_set.aggregate_removed(id);
        } else {
            // Already removed within this transaction.
            change_set.aggregate_removed(id);
        }
    }
    Ok(())
}

fn constituent_has_active(conn: &Connection, ids: &[ContactId]) -> DbResult<bool> {
    for id in ids {
        let deactivated: Option<bool> = conn
            .query_row(
                "SELECT isDeactivated FROM Contacts WHERE contactId = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if deactivated == Some(false) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_respects_unpromoted_kinds() {
        assert!(!promote_detail_kind(DetailKind::SyncTarget, &[], false));
        assert!(!promote_detail_kind(DetailKind::DisplayLabel, &[], true));
        // Guid is promotable only when promotion is forced.
        assert!(!promote_detail_kind(DetailKind::Guid, &[], false));
        assert!(promote_detail_kind(DetailKind::Guid, &[], true));
        // Timestamp ignores the mask.
        assert!(promote_detail_kind(
            DetailKind::Timestamp,
            &[DetailKind::PhoneNumber],
            false
        ));
    }

    #[test]
    fn composed_name_fills_only_empty_fields() {
        let mut aggregate = ContactRecord::new();
        aggregate.push_detail(Detail::new(DetailKind::Name).with_text(fields::FIRST_NAME, "Alice"));

        let mut constituent = ContactRecord::new();
        constituent.push_detail(
            Detail::new(DetailKind::Name)
                .with_text(fields::FIRST_NAME, "Alicia")
                .with_text(fields::LAST_NAME, "Wonderland"),
        );

        promote_details_to_aggregate(&constituent, &mut aggregate, &[], false);

        assert_eq!(aggregate.first_name(), Some("Alice"));
        assert_eq!(aggregate.last_name(), Some("Wonderland"));
    }

    #[test]
    fn remote_copies_become_read_only() {
        let mut aggregate = ContactRecord::new();
        let mut constituent = ContactRecord::named(Some("gtalk"), "Alice", "Wonderland");
        constituent.push_detail(
            Detail::new(DetailKind::EmailAddress).with_text(fields::EMAIL_ADDRESS, "a@x"),
        );

        promote_details_to_aggregate(&constituent, &mut aggregate, &[], false);

        let email = aggregate
            .detail(DetailKind::EmailAddress)
            .expect("Email promoted");
        assert!(email.access.read_only);
        assert!(email.access.irremovable);
    }
}
