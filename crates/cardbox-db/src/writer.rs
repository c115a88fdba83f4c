//! Write pipeline.
//!
//! Validates incoming contact batches, recomputes derived fields,
//! orchestrates the row stores and the aggregation engine inside one
//! transaction, and accumulates the change set that becomes the
//! post-commit notifications.

use cardbox_core::detail::fields;
use cardbox_core::{
    ContactId, ContactRecord, Detail, DetailKind, FieldValue, PresenceState, SyncTarget,
    Timestamp,
};
use cardbox_util_error::FmtCompact as _;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::{self, PRESENCE_UPDATE_KINDS};
use crate::{
    BadArgumentSnafu, ChangeSet, ContactsDb, DbError, DbResult, DoesNotExistSnafu, ErrorKind,
    ErrorMap, InvalidContactTypeSnafu, InvalidDetailSnafu, LOG_TARGET, LimitReachedSnafu,
    UnspecifiedSnafu, WriteTxCtx, aggregate_ops, contact_store, relationship_ops,
};

// ---- Derived fields ----

/// Recomputes the `GlobalPresence` detail from the contact's presence
/// details: the most available state wins, ties broken by iteration
/// order.
pub(crate) fn update_global_presence(contact: &mut ContactRecord) {
    let best = contact
        .details_of(DetailKind::Presence)
        .fold(None::<&Detail>, |best, detail| match best {
            None => Some(detail),
            Some(current) => {
                let challenger = detail.presence_state();
                let incumbent = current.presence_state();
                if challenger != PresenceState::Unknown
                    && (challenger.availability_order() < incumbent.availability_order()
                        || incumbent == PresenceState::Unknown)
                {
                    Some(detail)
                } else {
                    Some(current)
                }
            }
        })
        .cloned();

    match best {
        None => contact.remove_details(DetailKind::GlobalPresence),
        Some(best) => {
            let mut global = contact
                .detail(DetailKind::GlobalPresence)
                .cloned()
                .unwrap_or_else(|| Detail::new(DetailKind::GlobalPresence));
            global.set_value(
                fields::PRESENCE_STATE,
                FieldValue::Int(best.presence_state().as_i64()),
            );
            for field in [
                fields::PRESENCE_TIMESTAMP,
                fields::PRESENCE_NICKNAME,
                fields::CUSTOM_MESSAGE,
            ] {
                match best.value(field) {
                    Some(value) => {
                        global.set_value(field, value.clone());
                    }
                    None => global.clear_value(field),
                }
            }
            contact.set_singular(global);
        }
    }
}

/// Display label preference: custom label, name, nickname, presence
/// nickname, account URI, email address, phone number.
pub(crate) fn regenerate_display_label(contact: &mut ContactRecord) {
    let name = contact.detail(DetailKind::Name);
    let custom_label = name
        .and_then(|d| d.text(fields::CUSTOM_LABEL))
        .filter(|s| !s.is_empty());

    let label = if let Some(custom) = custom_label {
        Some(custom.to_owned())
    } else {
        let first = contact.first_name().unwrap_or("");
        let last = contact.last_name().unwrap_or("");
        if !first.is_empty() || !last.is_empty() {
            Some(
                [first, last]
                    .iter()
                    .filter(|s| !s.is_empty())
                    .copied()
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        } else {
            first_nonempty_text(contact, DetailKind::Nickname, fields::NICKNAME)
                .or_else(|| {
                    first_nonempty_text(
                        contact,
                        DetailKind::GlobalPresence,
                        fields::PRESENCE_NICKNAME,
                    )
                })
                .or_else(|| {
                    first_nonempty_text(contact, DetailKind::OnlineAccount, fields::ACCOUNT_URI)
                })
                .or_else(|| {
                    first_nonempty_text(contact, DetailKind::EmailAddress, fields::EMAIL_ADDRESS)
                })
                .or_else(|| {
                    first_nonempty_text(contact, DetailKind::PhoneNumber, fields::PHONE_NUMBER)
                })
        }
    };

    match label {
        Some(label) => contact
            .set_singular(Detail::new(DetailKind::DisplayLabel).with_text(fields::LABEL, label)),
        None => contact.remove_details(DetailKind::DisplayLabel),
    }
}

fn first_nonempty_text(
    contact: &ContactRecord,
    kind: DetailKind,
    field: &str,
) -> Option<String> {
    contact
        .details_of(kind)
        .find_map(|d| d.text(field).filter(|s| !s.is_empty()))
        .map(str::to_owned)
}

/// Clobbers the modification timestamp; sets the creation timestamp on
/// first save if absent.
pub(crate) fn update_timestamp(contact: &mut ContactRecord, set_created: bool) {
    let now = Timestamp::now();
    let mut timestamps = contact
        .detail(DetailKind::Timestamp)
        .cloned()
        .unwrap_or_else(|| Detail::new(DetailKind::Timestamp));
    timestamps.set_value(fields::MODIFIED, FieldValue::Timestamp(now));
    if set_created && timestamps.timestamp(fields::CREATED).is_none() {
        timestamps.set_value(fields::CREATED, FieldValue::Timestamp(now));
    }
    contact.set_singular(timestamps);
}

/// Recomputes the denormalized `StatusFlags` detail from the detail set.
pub(crate) fn derive_status_flags(contact: &mut ContactRecord) {
    let has_phone = contact.has_any(DetailKind::PhoneNumber, fields::PHONE_NUMBER);
    let has_email = contact.has_any(DetailKind::EmailAddress, fields::EMAIL_ADDRESS);
    let has_online_account = contact.has_any(DetailKind::OnlineAccount, fields::ACCOUNT_URI);
    let is_online = contact
        .details_of(DetailKind::Presence)
        .any(|d| d.presence_state().is_online());

    contact.set_singular(
        Detail::new(DetailKind::StatusFlags)
            .with_bool(fields::HAS_PHONE_NUMBER, has_phone)
            .with_bool(fields::HAS_EMAIL_ADDRESS, has_email)
            .with_bool(fields::HAS_ONLINE_ACCOUNT, has_online_account)
            .with_bool(fields::IS_ONLINE, is_online),
    );
}

pub(crate) fn status_flags_of(contact: &ContactRecord) -> contact_store::StatusFlags {
    let flags = contact.detail(DetailKind::StatusFlags);
    let get = |field: &str| flags.and_then(|d| d.bool_value(field)).unwrap_or(false);
    contact_store::StatusFlags {
        has_phone_number: get(fields::HAS_PHONE_NUMBER),
        has_email_address: get(fields::HAS_EMAIL_ADDRESS),
        has_online_account: get(fields::HAS_ONLINE_ACCOUNT),
        is_online: get(fields::IS_ONLINE),
    }
}

/// Singular-count enforcement. Unsupported detail types cannot be
/// represented by [`DetailKind`], so only the count constraint can fail.
fn enforce_detail_constraints(contact: &ContactRecord) -> DbResult<()> {
    for schema in registry::DETAIL_SCHEMAS.iter().filter(|s| s.singular) {
        let count = contact.details_of(schema.kind).count();
        if count > 1 {
            warn!(
                target: LOG_TARGET,
                kind = %schema.kind,
                count,
                "Invalid count of singular detail"
            );
            return LimitReachedSnafu.fail();
        }
    }
    Ok(())
}

/// Only contacts from real sync sources can be deactivated; local,
/// was-local, and aggregate rows cannot.
fn check_deactivation_allowed(contact: &ContactRecord, sync_target: &SyncTarget) -> DbResult<()> {
    if contact.is_deactivated() && sync_target.is_builtin() {
        return BadArgumentSnafu {
            reason: format!("{sync_target} contacts cannot be deactivated"),
        }
        .fail();
    }
    Ok(())
}

// ---- Batch save ----

fn is_presence_only(mask: &[DetailKind]) -> bool {
    mask.contains(&DetailKind::Presence)
        && mask.iter().all(|kind| PRESENCE_UPDATE_KINDS.contains(kind))
}

/// Every contact in a batch must share a sync target (`local` and
/// `was_local` counting as the same), be a plain contact, and not claim
/// to be incidental. Violations fail before any database work.
fn check_batch_preconditions(contacts: &[ContactRecord]) -> DbResult<()> {
    let mut batch_target: Option<SyncTarget> = None;
    for contact in contacts {
        let target = contact.sync_target_or_local();
        match &batch_target {
            None => batch_target = Some(target.clone()),
            Some(existing) => {
                let equivalent =
                    existing == &target || (existing.is_local_kind() && target.is_local_kind());
                if !equivalent {
                    warn!(
                        target: LOG_TARGET,
                        "Contacts from multiple sync targets specified in single batch save"
                    );
                    return UnspecifiedSnafu {
                        reason: "mixed sync targets in batch",
                    }
                    .fail();
                }
            }
        }

        let contact_type = contact
            .detail(DetailKind::Type)
            .and_then(|d| d.text(fields::TYPE))
            .unwrap_or("Contact");
        if contact_type != "Contact" {
            return UnspecifiedSnafu {
                reason: format!("contact type {contact_type} is not supported"),
            }
            .fail();
        }

        if contact.is_incidental() {
            return UnspecifiedSnafu {
                reason: "contact cannot be specified as incidental",
            }
            .fail();
        }
    }
    Ok(())
}

pub(crate) fn save_batch(
    db: &ContactsDb,
    contacts: &mut [ContactRecord],
    mask: &[DetailKind],
    error_map: &mut ErrorMap,
) -> DbResult<()> {
    if contacts.is_empty() {
        return Ok(());
    }

    check_batch_preconditions(contacts)?;

    let presence_only = is_presence_only(mask);

    db.write_with(|ctx| {
        let mut change_set = ChangeSet::default();
        let mut worst: Option<ErrorKind> = None;
        let mut added_indices: Vec<usize> = Vec::new();

        for (i, contact) in contacts.iter_mut().enumerate() {
            let result = if contact.id.is_unsaved() {
                create_contact_tx(ctx, db, contact, mask, false, &mut change_set).map(|()| {
                    added_indices.push(i);
                    change_set.note_added(contact.id);
                })
            } else {
                update_contact_tx(ctx, db, contact, mask, false, presence_only, &mut change_set)
                    .map(|_aggregate_updated| {
                        if presence_only {
                            change_set.note_presence_changed(contact.id);
                        } else {
                            change_set.note_changed(contact.id);
                        }
                    })
            };

            match result {
                Ok(()) => {
                    change_set.note_sync_target(contact.sync_target_or_local().as_str());
                }
                Err(err) => {
                    let kind = err.kind();
                    warn!(
                        target: LOG_TARGET,
                        index = i,
                        err = %err.fmt_compact(),
                        "Error saving contact"
                    );
                    error_map.insert(i, kind);
                    worst = Some(worst.map_or(kind, |w| w.max(kind)));
                }
            }
        }

        if let Some(worst) = worst {
            // The whole batch rolls back; contacts that were added are
            // not actually added. Their ids are cleared and they are
            // reported as Locked, since their own operation was fine.
            for i in added_indices {
                contacts[i].id = ContactId::UNSAVED;
                error_map.entry(i).or_insert(ErrorKind::Locked);
            }
            return Err(DbError::from_kind(worst));
        }

        aggregate_ops::prune_childless_at_commit(ctx, &mut change_set)?;
        db.notify_on_commit(ctx, change_set);
        Ok(())
    })
}

/// Creates one contact inside the batch transaction.
pub(crate) fn create_contact_tx(
    ctx: &WriteTxCtx,
    db: &ContactsDb,
    contact: &mut ContactRecord,
    mask: &[DetailKind],
    within_aggregate_update: bool,
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    // An incidental constituent stores every detail it carries.
    let mask: &[DetailKind] = if contact.is_incidental() { &[] } else { mask };

    let sync_target = contact.sync_target_or_local();
    if contact.sync_target().is_none() {
        contact.set_sync_target(&sync_target);
    }

    if sync_target == SyncTarget::Aggregate && !within_aggregate_update {
        // Aggregates are only ever created by the aggregation engine.
        return InvalidContactTypeSnafu.fail();
    }

    check_deactivation_allowed(contact, &sync_target)?;

    // Local contacts get a GUID for import/export stability.
    if sync_target == SyncTarget::Local {
        let has_guid = contact
            .detail(DetailKind::Guid)
            .and_then(|d| d.text(fields::GUID))
            .is_some_and(|g| !g.is_empty());
        if !has_guid {
            contact.set_singular(
                Detail::new(DetailKind::Guid).with_text(fields::GUID, Uuid::new_v4().to_string()),
            );
        }
    }

    if mask.is_empty()
        || mask.contains(&DetailKind::Presence)
        || mask.contains(&DetailKind::GlobalPresence)
    {
        update_global_presence(contact);
    }
    regenerate_display_label(contact);
    derive_status_flags(contact);
    if sync_target != SyncTarget::Aggregate {
        update_timestamp(contact, true);
    }

    enforce_detail_constraints(contact)?;

    let id = contact_store::create_contact(ctx, contact)?;
    debug!(target: LOG_TARGET, %id, sync_target = %sync_target, "Created contact");

    if !within_aggregate_update && sync_target != SyncTarget::Aggregate {
        aggregate_ops::set_aggregate(db, ctx, contact, false, mask, change_set)?;
    }

    Ok(())
}

/// Updates one contact inside the batch transaction. Returns whether an
/// aggregate was updated as a consequence.
pub(crate) fn update_contact_tx(
    ctx: &WriteTxCtx,
    db: &ContactsDb,
    contact: &mut ContactRecord,
    mask: &[DetailKind],
    within_aggregate_update: bool,
    presence_only: bool,
    change_set: &mut ChangeSet,
) -> DbResult<bool> {
    let id = contact.id;
    let Some(old_target) = contact_store::contact_sync_target(ctx, id)? else {
        return DoesNotExistSnafu.fail();
    };

    let new_target = contact.sync_target_or_local();
    if new_target != old_target && !old_target.is_local_kind() {
        warn!(target: LOG_TARGET, %id, "Cannot manually change sync target");
        return InvalidDetailSnafu {
            reason: "sync target of a non-local contact cannot be changed",
        }
        .fail();
    }

    enforce_detail_constraints(contact)?;
    check_deactivation_allowed(contact, &old_target)?;

    if new_target != SyncTarget::Aggregate {
        update_timestamp(contact, false);
    }

    if !within_aggregate_update && old_target == SyncTarget::Aggregate {
        // A direct edit of an aggregate is applied to its constituents
        // and the aggregate regenerated.
        aggregate_ops::update_local_and_aggregate(db, ctx, contact, mask, change_set)?;
        return Ok(false);
    }

    if mask.is_empty()
        || mask.contains(&DetailKind::Presence)
        || mask.contains(&DetailKind::GlobalPresence)
    {
        update_global_presence(contact);
    }
    regenerate_display_label(contact);
    derive_status_flags(contact);

    let mut transient_update = presence_only && !within_aggregate_update;
    if transient_update {
        // Minor presence churn goes to the transient store instead of
        // disk; only the denormalized flag columns are refreshed.
        let mut transient_details: Vec<Detail> = contact
            .details
            .iter()
            .filter(|d| {
                mask.contains(&d.kind()) || d.kind() == DetailKind::GlobalPresence
            })
            .cloned()
            .collect();
        if old_target == SyncTarget::Aggregate {
            for detail in &mut transient_details {
                contact_store::adjust_aggregate_detail_uris(detail);
            }
        }
        let last_modified = contact.modified().unwrap_or_else(Timestamp::now);
        db.transient()
            .set_transient_details(id, last_modified, transient_details);
        contact_store::update_status_flags(ctx, id, status_flags_of(contact))?;
        debug!(target: LOG_TARGET, %id, "Stored presence-only update transiently");
    } else {
        transient_update = false;
    }

    if !transient_update {
        // A durable update invalidates whatever the transient store held.
        db.transient().remove_transient_details(&[id]);

        // The recomputed derived fields are persisted even under a mask.
        let store_mask: Vec<DetailKind> = if mask.is_empty() {
            Vec::new()
        } else {
            let mut expanded = mask.to_vec();
            for kind in [
                DetailKind::Timestamp,
                DetailKind::DisplayLabel,
                DetailKind::StatusFlags,
                DetailKind::GlobalPresence,
            ] {
                if !expanded.contains(&kind) {
                    expanded.push(kind);
                }
            }
            expanded
        };
        contact_store::update_contact(ctx, id, contact, &store_mask)?;
    }

    let mut aggregate_updated = false;
    if old_target != SyncTarget::Aggregate && !transient_update {
        let aggregates = relationship_ops::aggregate_ids_for(ctx, id)?;
        if !aggregates.is_empty() {
            aggregate_ops::regenerate_aggregates(db, ctx, &aggregates, mask, change_set)?;
            aggregate_updated = true;
        } else if !old_target.is_local_kind() {
            aggregate_ops::set_aggregate(db, ctx, contact, true, mask, change_set)?;
            aggregate_updated = true;
        }
    }

    Ok(aggregate_updated)
}

/// Entry point used by the aggregation engine and the sync protocol to
/// persist a contact they constructed or modified, within the enclosing
/// transaction. Shares the public pipeline minus the batch
/// preconditions, since engine-made records may be incidental.
pub(crate) fn save_contact_tx(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    contact: &mut ContactRecord,
    mask: &[DetailKind],
    within_aggregate_update: bool,
    change_set: &mut ChangeSet,
) -> DbResult<bool> {
    if contact.id.is_unsaved() {
        create_contact_tx(ctx, db, contact, mask, within_aggregate_update, change_set)?;
        change_set.note_added(contact.id);
        Ok(false)
    } else {
        let updated = update_contact_tx(
            ctx,
            db,
            contact,
            mask,
            within_aggregate_update,
            false,
            change_set,
        )?;
        change_set.note_changed(contact.id);
        Ok(updated)
    }
}

// ---- Removal ----

pub(crate) fn remove_batch(
    db: &ContactsDb,
    ids: &[ContactId],
    error_map: &mut ErrorMap,
) -> DbResult<()> {
    if ids.is_empty() {
        return Ok(());
    }

    // Unlike save, invalid items do not abort the rest of a removal
    // batch: valid removals commit, and the worst per-item error is
    // still reported.
    let worst = db.write_with(|ctx| {
        let mut change_set = ChangeSet::default();
        let mut worst: Option<ErrorKind> = None;

        let self_id = crate::identity_ops::self_contact_id(ctx)?;

        let mut real_remove_ids: Vec<ContactId> = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            if *id == self_id || id.is_self() {
                error_map.insert(i, ErrorKind::BadArgument);
                worst = Some(worst.map_or(ErrorKind::BadArgument, |w| w.max(ErrorKind::BadArgument)));
            } else if contact_store::contact_sync_target(ctx, *id)?.is_none() {
                error_map.insert(i, ErrorKind::DoesNotExist);
                worst = Some(worst.map_or(ErrorKind::DoesNotExist, |w| w.max(ErrorKind::DoesNotExist)));
            } else {
                real_remove_ids.push(*id);
            }
        }

        if !real_remove_ids.is_empty() {
            remove_contacts_tx(db, ctx, &real_remove_ids, &mut change_set)?;
        }

        aggregate_ops::prune_childless_at_commit(ctx, &mut change_set)?;

        // Purge transient entries for removed ids once the commit lands.
        let removed: Vec<ContactId> = change_set.removed_ids().collect();
        if !removed.is_empty() {
            let transient = db.transient().clone();
            ctx.on_commit(move || transient.remove_transient_details(&removed));
        }

        db.notify_on_commit(ctx, change_set);
        Ok(worst)
    })?;

    match worst {
        Some(worst) => Err(DbError::from_kind(worst)),
        None => Ok(()),
    }
}

/// Removes the given contacts. Removing an aggregate sweeps its
/// constituents into the same removal; removing constituents leaves
/// their aggregates to be regenerated or pruned.
pub(crate) fn remove_contacts_tx(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    ids: &[ContactId],
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    let mut aggregates_to_remove: Vec<ContactId> = Vec::new();
    let mut non_aggregates: Vec<ContactId> = Vec::new();
    let mut aggregates_of_removed: std::collections::BTreeSet<ContactId> = Default::default();

    for id in ids {
        match contact_store::contact_sync_target(ctx, *id)? {
            None => continue,
            Some(SyncTarget::Aggregate) => aggregates_to_remove.push(*id),
            Some(target) => {
                non_aggregates.push(*id);
                change_set.note_sync_target(target.as_str());
                for aggregate in relationship_ops::aggregate_ids_for(ctx, *id)? {
                    aggregates_of_removed.insert(aggregate);
                }
            }
        }
    }

    // An aggregate takes all of its constituents with it.
    let mut sweep = aggregates_to_remove.clone();
    for aggregate_id in &aggregates_to_remove {
        for constituent in relationship_ops::constituent_ids_for(ctx, *aggregate_id)? {
            if let Some(target) = contact_store::contact_sync_target(ctx, constituent)? {
                change_set.note_sync_target(target.as_str());
            }
            sweep.push(constituent);
        }
    }

    let mut removal: Vec<ContactId> = non_aggregates;
    removal.extend(sweep.iter().copied());
    removal.sort_unstable();
    removal.dedup();

    if removal.is_empty() {
        return Ok(());
    }

    debug!(target: LOG_TARGET, count = removal.len(), "Removing contacts");
    contact_store::remove_contact_rows(ctx, &removal)?;
    for id in &removal {
        change_set.note_removed(*id);
        aggregates_of_removed.remove(id);
    }

    aggregate_ops::remove_childless_aggregates(ctx, change_set)?;

    // Surviving aggregates that lost a constituent are rebuilt; those
    // left without active constituents go childless-pending and fall at
    // commit time.
    let affected: Vec<ContactId> = aggregates_of_removed
        .into_iter()
        .filter(|id| !change_set.removed_ids().any(|removed| removed == *id))
        .collect();
    if !affected.is_empty() {
        aggregate_ops::regenerate_aggregates(db, ctx, &affected, &[], change_set)?;
    }

    Ok(())
}
