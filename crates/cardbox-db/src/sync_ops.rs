//! Sync delta protocol.
//!
//! `fetch` computes the subset of local state a sync peer must see since
//! a given timestamp: partial aggregates built from the peer's own,
//! `local`, and `was_local` constituents, plus deletions from the
//! tombstone table. `update` applies remote changes back, preserving
//! locally-originated modifications, and regenerates the affected
//! aggregates before commit.

use std::collections::{BTreeMap, BTreeSet};

use cardbox_core::detail::fields;
use cardbox_core::{ContactId, ContactRecord, Detail, DetailKind, SyncTarget, Timestamp};
use rusqlite::{Connection, params};
use tracing::{debug, warn};

use crate::{
    ChangeSet, ContactsDb, DbResult, LOG_TARGET, NotSupportedSnafu, UnspecifiedSnafu, WriteTxCtx,
    aggregate_ops, comparator, contact_store, relationship_ops, writer,
};

/// How conflicting remote and local edits are resolved during
/// [`update`]. Only `PreserveLocalChanges` is implemented.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConflictPolicy {
    PreserveLocalChanges,
    PreserveRemoteChanges,
}

/// Result of a sync fetch: contacts changed or added since the last
/// sync, tombstoned deletions, and the timestamp the peer should use as
/// the anchor of its next fetch.
#[derive(Debug)]
pub struct SyncFetchResult {
    pub changed: Vec<ContactRecord>,
    pub added: Vec<ContactRecord>,
    pub deleted: Vec<ContactId>,
    pub new_timestamp: Timestamp,
}

impl SyncFetchResult {
    fn since(since: Timestamp) -> Self {
        Self {
            changed: Vec::new(),
            added: Vec::new(),
            deleted: Vec::new(),
            new_timestamp: since,
        }
    }

    fn observe(&mut self, ts: Option<Timestamp>) {
        if let Some(ts) = ts {
            if ts > self.new_timestamp {
                self.new_timestamp = ts;
            }
        }
    }
}

struct ConstituentInfo {
    id: ContactId,
    sync_target: SyncTarget,
    incidental: bool,
}

/// Merges the transient store's modification timestamps into a
/// `temp.Timestamps` table, so the fetch queries see presence updates
/// that were never flushed to disk.
fn populate_transient_timestamps(db: &ContactsDb, conn: &Connection) -> DbResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS temp.Timestamps (contactId INTEGER PRIMARY KEY, modified TEXT); \
         DELETE FROM temp.Timestamps;",
    )?;
    let mut stmt =
        conn.prepare("INSERT INTO temp.Timestamps (contactId, modified) VALUES (?1, ?2)")?;
    for (id, ts) in db.transient().populate_timestamps() {
        stmt.execute(params![id, ts.to_sql_string()])?;
    }
    Ok(())
}

pub(crate) fn fetch(
    db: &ContactsDb,
    sync_target: &str,
    since: Timestamp,
    exported_ids: &[ContactId],
) -> DbResult<SyncFetchResult> {
    let export_update = sync_target == SyncTarget::EXPORT;
    let since_str = since.to_sql_string();

    db.read_with(|conn| {
        let mut result = SyncFetchResult::since(since);

        populate_transient_timestamps(db, conn)?;

        if export_update {
            fetch_export(conn, &since_str, exported_ids, &mut result)?;
        } else {
            fetch_partial_aggregates(conn, sync_target, &since_str, exported_ids, &mut result)?;
        }

        // Deletions come from the tombstone table.
        let mut stmt = conn.prepare(
            "SELECT contactId, syncTarget, deleted FROM DeletedContacts WHERE deleted > ?1",
        )?;
        let mut rows = stmt.query(params![since_str])?;
        while let Some(row) = rows.next()? {
            let id: ContactId = row.get(0)?;
            let st: Option<String> = row.get(1)?;
            let deleted: String = row.get(2)?;

            let report = if export_update {
                st.as_deref() == Some(SyncTarget::AGGREGATE)
            } else {
                st.as_deref() == Some(sync_target) || exported_ids.contains(&id)
            };
            if report {
                result.deleted.push(id);
                result.observe(Timestamp::parse_sql(&deleted).ok());
            }
        }

        debug!(
            target: LOG_TARGET,
            sync_target,
            changed = result.changed.len(),
            added = result.added.len(),
            deleted = result.deleted.len(),
            "Sync fetch computed"
        );
        Ok(result)
    })
}

/// Export peers see whole aggregates verbatim, minus nonexportable
/// details; nothing originates in the exported database.
fn fetch_export(
    conn: &Connection,
    since: &str,
    exported_ids: &[ContactId],
    result: &mut SyncFetchResult,
) -> DbResult<()> {
    let export_ids: Vec<ContactId> = {
        let mut stmt = conn.prepare(
            "SELECT Contacts.contactId FROM Contacts \
             LEFT JOIN temp.Timestamps ON temp.Timestamps.contactId = Contacts.contactId \
             WHERE syncTarget = 'aggregate' \
             AND COALESCE(temp.Timestamps.modified, Contacts.modified) > ?1",
        )?;
        let rows = stmt.query_map(params![since], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    for id in export_ids {
        let Some(mut aggregate) = contact_store::get_contact(conn, id)? else {
            continue;
        };
        aggregate.details.retain(|d| !d.nonexportable);

        result.observe(aggregate.modified());
        result.observe(aggregate.created());
        if exported_ids.contains(&id) {
            result.changed.push(aggregate);
        } else {
            result.added.push(aggregate);
        }
    }
    Ok(())
}

fn fetch_partial_aggregates(
    conn: &Connection,
    sync_target: &str,
    since: &str,
    exported_ids: &[ContactId],
    result: &mut SyncFetchResult,
) -> DbResult<()> {
    let mut aggregate_ids: BTreeSet<ContactId> = Default::default();
    let mut added_aggregate_ids: BTreeSet<ContactId> = Default::default();

    // Aggregates with a constituent from this sync source, modified
    // since the last sync.
    {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT Relationships.firstId \
             FROM Relationships \
             JOIN Contacts AS Aggregates ON Aggregates.contactId = Relationships.firstId \
             LEFT JOIN temp.Timestamps ON temp.Timestamps.contactId = Aggregates.contactId \
             JOIN Contacts AS Constituents ON Constituents.contactId = Relationships.secondId \
             WHERE Relationships.type = 'Aggregates' \
             AND Constituents.syncTarget = ?1 \
             AND COALESCE(temp.Timestamps.modified, Aggregates.modified) > ?2",
        )?;
        let rows = stmt.query_map(params![sync_target, since], |row| row.get(0))?;
        for id in rows {
            aggregate_ids.insert(id?);
        }
    }

    // Previously-exported aggregates, modified since the last sync.
    if !exported_ids.is_empty() {
        crate::schema::create_temp_contact_ids(
            conn,
            "syncConstituents",
            exported_ids.iter().copied(),
        )?;
        let mut stmt = conn.prepare(
            "SELECT Relationships.firstId \
             FROM Relationships \
             JOIN Contacts ON Contacts.contactId = Relationships.firstId \
             LEFT JOIN temp.Timestamps ON temp.Timestamps.contactId = Contacts.contactId \
             WHERE Relationships.type = 'Aggregates' AND secondId IN (\
               SELECT contactId FROM temp.syncConstituents) \
             AND COALESCE(temp.Timestamps.modified, Contacts.modified) > ?1",
        )?;
        let rows = stmt.query_map(params![since], |row| row.get(0))?;
        for id in rows {
            aggregate_ids.insert(id?);
        }
    }

    // Newly-created local contacts are reported as additions.
    {
        let mut stmt = conn.prepare(
            "SELECT Relationships.firstId \
             FROM Contacts \
             JOIN Relationships ON Relationships.secondId = Contacts.contactId \
             WHERE Contacts.created > ?1 \
             AND Contacts.syncTarget = 'local' \
             AND Contacts.isIncidental = 0 \
             AND Relationships.type = 'Aggregates'",
        )?;
        let rows = stmt.query_map(params![since], |row| row.get(0))?;
        for id in rows {
            let id = id?;
            if aggregate_ids.insert(id) {
                added_aggregate_ids.insert(id);
            }
        }
    }

    if aggregate_ids.is_empty() {
        return Ok(());
    }

    // Constituent roster of each aggregate.
    let mut constituents: BTreeMap<ContactId, Vec<ConstituentInfo>> = Default::default();
    let mut local_ids: BTreeMap<ContactId, ContactId> = Default::default();
    {
        crate::schema::create_temp_contact_ids(
            conn,
            "syncAggregates",
            aggregate_ids.iter().copied(),
        )?;
        let mut stmt = conn.prepare(
            "SELECT Relationships.firstId, Contacts.contactId, Contacts.syncTarget, Contacts.isIncidental \
             FROM Relationships \
             JOIN Contacts ON Contacts.contactId = Relationships.secondId \
             WHERE Relationships.type = 'Aggregates' \
             AND Relationships.firstId IN (\
               SELECT contactId FROM temp.syncAggregates) \
             AND Contacts.isDeactivated = 0",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let aggregate_id: ContactId = row.get(0)?;
            let constituent_id: ContactId = row.get(1)?;
            let st: String = row.get(2)?;
            let incidental: bool = row.get(3)?;

            let sync_target = SyncTarget::from_name(&st);
            if sync_target == SyncTarget::Local {
                local_ids.insert(aggregate_id, constituent_id);
            }
            constituents.entry(aggregate_id).or_default().push(ConstituentInfo {
                id: constituent_id,
                sync_target,
                incidental,
            });
        }
    }

    let target = SyncTarget::from_name(sync_target);

    for (aggregate_id, roster) in &constituents {
        // Every non-incidental constituent from this sync source becomes
        // the base of its own partial aggregate; with none, the local
        // constituent is the base.
        let mut bases: Vec<ContactId> = roster
            .iter()
            .filter(|c| c.sync_target == target && !c.incidental)
            .map(|c| c.id)
            .collect();
        if bases.is_empty() {
            match local_ids.get(aggregate_id) {
                Some(local_id) => bases.push(*local_id),
                None => continue,
            }
        }

        for base_id in bases {
            let partial =
                build_partial_aggregate(conn, base_id, roster, local_ids.get(aggregate_id), &target)?;

            result.observe(partial.modified());
            result.observe(partial.created());
            if added_aggregate_ids.contains(aggregate_id) {
                result.added.push(partial);
            } else {
                result.changed.push(partial);
            }
        }
    }

    Ok(())
}

/// Builds the subset view of an aggregate for one sync source: the
/// local constituent's details verbatim, then the base (and incidental
/// same-source) constituents force-promoted, then `was_local`
/// contributions. The partial aggregate's id is the base constituent id.
fn build_partial_aggregate(
    conn: &Connection,
    base_id: ContactId,
    roster: &[ConstituentInfo],
    local_id: Option<&ContactId>,
    target: &SyncTarget,
) -> DbResult<ContactRecord> {
    let mut partial = ContactRecord::with_id(base_id);

    if let Some(local_id) = local_id {
        let local = contact_store::get_contact(conn, *local_id)?.ok_or_else(|| {
            UnspecifiedSnafu {
                reason: format!("local constituent {local_id} missing during sync fetch"),
            }
            .build()
        })?;
        for detail in &local.details {
            if aggregate_ops::promote_detail_kind(detail.kind(), &[], false) {
                partial.push_detail(detail.clone());
            }
        }
    }

    for info in roster {
        let from_target = info.sync_target == *target;
        if !from_target && info.sync_target != SyncTarget::WasLocal {
            continue;
        }
        if from_target && info.id != base_id && !info.incidental {
            // Other same-source constituents get their own partial
            // aggregate; do not mix them into this one.
            continue;
        }

        let constituent = contact_store::get_contact(conn, info.id)?.ok_or_else(|| {
            UnspecifiedSnafu {
                reason: format!("constituent {} missing during sync fetch", info.id),
            }
            .build()
        })?;
        aggregate_ops::promote_details_to_aggregate(&constituent, &mut partial, &[], from_target);
    }

    Ok(partial)
}

// ---- Applying remote changes ----

type RemotePair = (Option<ContactRecord>, Option<ContactRecord>);

pub(crate) fn update(
    db: &ContactsDb,
    sync_target: &str,
    policy: ConflictPolicy,
    pairs: &[RemotePair],
) -> DbResult<()> {
    if policy == ConflictPolicy::PreserveRemoteChanges {
        return NotSupportedSnafu.fail();
    }
    if pairs.is_empty() {
        return Ok(());
    }

    let export_update = sync_target == SyncTarget::EXPORT;
    let target = SyncTarget::from_name(sync_target);

    db.write_with(|ctx| {
        let mut change_set = ChangeSet::default();

        for (original, updated) in pairs {
            match (original, updated) {
                (None, None) => {}
                (None, Some(updated)) => {
                    apply_remote_addition(db, ctx, &target, export_update, updated, &mut change_set)?;
                }
                (Some(original), None) => {
                    apply_remote_deletion(
                        db,
                        ctx,
                        &target,
                        export_update,
                        original.id,
                        &mut change_set,
                    )?;
                }
                (Some(original), Some(updated)) => {
                    if original.id != updated.id || original.id.is_unsaved() {
                        return UnspecifiedSnafu {
                            reason: format!(
                                "mismatched sync contact ids: {} != {}",
                                original.id, updated.id
                            ),
                        }
                        .fail();
                    }
                    apply_remote_modification(
                        db,
                        ctx,
                        &target,
                        export_update,
                        original,
                        updated,
                        &mut change_set,
                    )?;
                }
            }
        }

        aggregate_ops::remove_childless_aggregates(ctx, &mut change_set)?;
        aggregate_ops::prune_childless_at_commit(ctx, &mut change_set)?;

        // The peer that performed this update does not get notified of
        // its own changes.
        change_set.suppress_sync_target(sync_target);

        db.notify_on_commit(ctx, change_set);
        Ok(())
    })
}

/// A remote creation becomes a constituent owned by the sync source (or
/// plain local device data, for the export peer), with every detail
/// marked modifiable so later remote modifications can land in place.
fn apply_remote_addition(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    target: &SyncTarget,
    export_update: bool,
    remote: &ContactRecord,
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    let mut contact = ContactRecord::new();
    for detail in &remote.details {
        if detail.kind() == DetailKind::SyncTarget {
            continue;
        }
        let mut copy = detail.clone();
        copy.id = None;
        copy.provenance = None;
        if !export_update {
            copy.modifiable = Some(true);
        }
        contact.push_detail(copy);
    }
    if !export_update {
        contact.set_sync_target(target);
    }

    writer::save_contact_tx(db, ctx, &mut contact, &[], false, change_set)?;
    Ok(())
}

/// A remote deletion removes only the constituent belonging to the sync
/// source. A contact with only local-device constituents is left alone.
fn apply_remote_deletion(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    target: &SyncTarget,
    export_update: bool,
    id: ContactId,
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    let Some(stored_target) = contact_store::contact_sync_target(ctx, id)? else {
        // Deleted locally already; nothing to report back.
        debug!(target: LOG_TARGET, %id, "Ignoring remote deletion of missing contact");
        return Ok(());
    };

    if export_update {
        // The export view deletes whole aggregates: the local-device
        // constituents go, and childless pruning takes the aggregate.
        let mut to_remove = vec![id];
        if stored_target == SyncTarget::Aggregate {
            for constituent in relationship_ops::constituent_ids_for(ctx, id)? {
                if let Some(st) = contact_store::contact_sync_target(ctx, constituent)? {
                    if st.is_local_kind() {
                        to_remove.push(constituent);
                    }
                }
            }
        }
        writer::remove_contacts_tx(db, ctx, &to_remove, change_set)?;
        return Ok(());
    }

    let victim = if stored_target == *target {
        Some(id)
    } else {
        // The reported id is the partial-aggregate base (often the local
        // constituent); find the sibling owned by this sync source.
        sync_target_sibling(ctx, id, target)?
    };

    match victim {
        Some(victim) => {
            writer::remove_contacts_tx(db, ctx, &[victim], change_set)?;
        }
        None => {
            // Only local data exists for this contact; the deletion is
            // silently ignored.
            debug!(target: LOG_TARGET, %id, "Ignoring remote deletion of local-only contact");
        }
    }
    Ok(())
}

/// The constituent of `id`'s aggregate owned by `target`, if any.
fn sync_target_sibling(
    conn: &Connection,
    id: ContactId,
    target: &SyncTarget,
) -> DbResult<Option<ContactId>> {
    for aggregate in relationship_ops::aggregate_ids_for(conn, id)? {
        for constituent in relationship_ops::constituent_ids_for(conn, aggregate)? {
            if contact_store::contact_sync_target(conn, constituent)?.as_ref() == Some(target) {
                return Ok(Some(constituent));
            }
        }
    }
    Ok(None)
}

/// Applies a remote modification, detail by detail:
///
/// - provenance-carrying changes go to the constituent named by the
///   provenance, field-by-field, dropping any field whose local value
///   has diverged from the `original` version the remote saw;
/// - composed changes go to the `local` constituent (created as an
///   incidental if absent);
/// - plain additions go to this sync source's constituent (also created
///   as an incidental if absent).
fn apply_remote_modification(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    target: &SyncTarget,
    export_update: bool,
    original: &ContactRecord,
    updated: &ContactRecord,
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    let mut original_details = aggregate_ops::promotable_details(original, &[], true);
    let mut updated_details = aggregate_ops::promotable_details(updated, &[], true);
    aggregate_ops::remove_equivalent_details(&mut original_details, &mut updated_details);

    if original_details.is_empty() && updated_details.is_empty() {
        return Ok(());
    }

    if export_update {
        // The export view is the aggregate view: route the whole record
        // through the aggregate-edit path, which already redirects the
        // delta onto local or modifiable constituents.
        let Some(stored_target) = contact_store::contact_sync_target(ctx, updated.id)? else {
            debug!(target: LOG_TARGET, id = %updated.id, "Ignoring remote modification of missing contact");
            return Ok(());
        };
        if stored_target != SyncTarget::Aggregate {
            warn!(target: LOG_TARGET, id = %updated.id, "Export update of non-aggregate ignored");
            return Ok(());
        }
        let mut record = updated.clone();
        aggregate_ops::update_local_and_aggregate(db, ctx, &mut record, &[], change_set)?;
        return Ok(());
    }

    // Bucket the differences.
    let mut modifications: BTreeMap<ContactId, Vec<(Detail, Detail)>> = Default::default();
    let mut removals: BTreeMap<ContactId, Vec<Detail>> = Default::default();
    let mut composed_changes: Vec<Detail> = Vec::new();
    let mut additions: Vec<Detail> = Vec::new();

    for upd in updated_details {
        match upd.provenance.clone() {
            None => {
                if crate::registry::schema(upd.kind()).composed {
                    composed_changes.push(upd);
                } else {
                    additions.push(upd);
                }
            }
            Some(provenance) => {
                if let Some(pos) = original_details
                    .iter()
                    .position(|orig| orig.provenance.as_ref() == Some(&provenance))
                {
                    let orig = original_details.remove(pos);
                    modifications
                        .entry(provenance.contact_id)
                        .or_default()
                        .push((orig, upd));
                } else {
                    // The original of this modification is unknown; under
                    // PreserveLocalChanges the change is dropped.
                    debug!(
                        target: LOG_TARGET,
                        %provenance,
                        "Dropping remote modification without matching original"
                    );
                }
            }
        }
    }

    for orig in original_details {
        if let Some(provenance) = orig.provenance.clone() {
            removals.entry(provenance.contact_id).or_default().push(orig);
        }
    }

    // Apply per-constituent edits.
    for (constituent_id, edits) in modifications {
        let Some(mut constituent) = contact_store::get_contact(ctx, constituent_id)? else {
            debug!(target: LOG_TARGET, id = %constituent_id, "Dropping modification of removed constituent");
            continue;
        };
        for (orig, upd) in edits {
            apply_detail_modification(&mut constituent, &orig, &upd);
        }
        if let Some(removal_list) = removals.remove(&constituent_id) {
            apply_detail_removals(&mut constituent, &removal_list);
        }
        writer::save_contact_tx(db, ctx, &mut constituent, &[], false, change_set)?;
    }

    for (constituent_id, removal_list) in removals {
        let Some(mut constituent) = contact_store::get_contact(ctx, constituent_id)? else {
            continue;
        };
        apply_detail_removals(&mut constituent, &removal_list);
        writer::save_contact_tx(db, ctx, &mut constituent, &[], false, change_set)?;
    }

    // Composed changes land on the local constituent.
    if !composed_changes.is_empty() {
        let (aggregate_id, local) = local_constituent_for(ctx, updated.id)?;
        let mut local = match local {
            Some(local) => local,
            None => incidental_constituent(updated, aggregate_id, &SyncTarget::Local),
        };
        for change in composed_changes {
            let mut replacement = change;
            replacement.id = None;
            replacement.provenance = None;
            local.set_singular(replacement);
        }
        writer::save_contact_tx(db, ctx, &mut local, &[], false, change_set)?;
        // Local precedence means the composed values only win after a
        // rebuild.
        aggregate_ops::regenerate_aggregates(db, ctx, &[aggregate_id], &[], change_set)?;
    }

    // Additions land on this sync source's constituent.
    if !additions.is_empty() {
        let stored_target = contact_store::contact_sync_target(ctx, updated.id)?;
        let mut recipient = if stored_target.as_ref() == Some(target) {
            contact_store::get_contact(ctx, updated.id)?.ok_or_else(|| {
                UnspecifiedSnafu {
                    reason: format!("contact {} missing during sync update", updated.id),
                }
                .build()
            })?
        } else {
            match sync_target_sibling(ctx, updated.id, target)? {
                Some(sibling) => contact_store::get_contact(ctx, sibling)?.ok_or_else(|| {
                    UnspecifiedSnafu {
                        reason: format!("constituent {sibling} missing during sync update"),
                    }
                    .build()
                })?,
                None => {
                    let (aggregate_id, _) = local_constituent_for(ctx, updated.id)?;
                    incidental_constituent(updated, aggregate_id, target)
                }
            }
        };

        for detail in additions {
            let mut copy = detail;
            copy.id = None;
            copy.provenance = None;
            copy.modifiable = Some(true);
            recipient.push_detail(copy);
        }
        writer::save_contact_tx(db, ctx, &mut recipient, &[], false, change_set)?;
    }

    Ok(())
}

/// Field-by-field merge of a remote modification under
/// `PreserveLocalChanges`: a field is only updated (or removed) when its
/// current local value still matches what the remote originally saw.
fn apply_detail_modification(contact: &mut ContactRecord, original: &Detail, updated: &Detail) {
    let provenance = updated.provenance.as_ref().or(original.provenance.as_ref());
    let Some(provenance) = provenance else {
        return;
    };
    let Some(recipient) = contact
        .details
        .iter_mut()
        .find(|d| d.provenance.as_ref() == Some(provenance))
    else {
        return;
    };

    for (field, modified_value) in updated.values() {
        let original_value = original.value(field);
        let current_value = recipient.value(field);
        if current_value != original_value {
            // The local value has changed since this data was exported;
            // the remote change is dropped with no feedback channel.
            continue;
        }
        recipient.set_value(*field, modified_value.clone());
    }

    let removed_fields: Vec<&'static str> = recipient
        .values()
        .keys()
        .copied()
        .filter(|field| !updated.values().contains_key(*field))
        .collect();
    for field in removed_fields {
        let original_value = original.value(field);
        let current_value = recipient.value(field);
        if original_value.is_some() && current_value == original_value {
            recipient.clear_value(field);
        }
    }
}

/// Removes the details named by the removal set, when their local value
/// still matches the version the remote saw.
fn apply_detail_removals(contact: &mut ContactRecord, removals: &[Detail]) {
    contact.details.retain(|existing| {
        !removals.iter().any(|removal| {
            removal.provenance.is_some()
                && existing.provenance == removal.provenance
                && comparator::details_equivalent(existing, removal)
        })
    });
}

/// The aggregate a partial-aggregate base belongs to, and its `local`
/// constituent if one exists.
fn local_constituent_for(
    conn: &Connection,
    base_id: ContactId,
) -> DbResult<(ContactId, Option<ContactRecord>)> {
    let aggregates = relationship_ops::aggregate_ids_for(conn, base_id)?;
    let aggregate_id = aggregates.first().copied().ok_or_else(|| {
        UnspecifiedSnafu {
            reason: format!("contact {base_id} has no aggregate during sync update"),
        }
        .build()
    })?;

    for constituent in relationship_ops::constituent_ids_for(conn, aggregate_id)? {
        if contact_store::contact_sync_target(conn, constituent)? == Some(SyncTarget::Local) {
            return Ok((aggregate_id, contact_store::get_contact(conn, constituent)?));
        }
    }
    Ok((aggregate_id, None))
}

/// A fresh incidental constituent of `aggregate_id`, carrying the
/// aggregate's identifying name.
fn incidental_constituent(
    source: &ContactRecord,
    aggregate_id: ContactId,
    target: &SyncTarget,
) -> ContactRecord {
    let mut fresh = ContactRecord::new();
    fresh.push_detail(
        Detail::new(DetailKind::Incidental)
            .with_int(fields::AGGREGATE_ID, i64::from(aggregate_id.as_u32())),
    );
    fresh.set_sync_target(target);
    aggregate_ops::copy_name_details(source, &mut fresh);
    fresh
}
