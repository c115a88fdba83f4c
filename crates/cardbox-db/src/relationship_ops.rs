//! Relationship store: directed typed edges between contacts.
//!
//! `Aggregates` and `IsNot` live in the same table as any caller-defined
//! edge type, with uniqueness on `(firstId, secondId, type)`. Inserting a
//! duplicate is silently dropped; removing a nonexistent edge is an
//! error. Edges that affect aggregation trigger regeneration of the
//! aggregates involved.

use std::collections::HashSet;

use cardbox_core::{ContactId, Relationship, RelationshipKind};
use itertools::Itertools as _;
use rusqlite::{Connection, params, params_from_iter};
use rusqlite::types::Value;
use tracing::debug;

use crate::{
    ChangeSet, ContactsDb, DbError, DbResult, ErrorKind, ErrorMap, LOG_TARGET, WriteTxCtx,
    aggregate_ops,
};

type EdgeKey = (u32, String, u32);

fn edge_key(r: &Relationship) -> EdgeKey {
    (
        r.first.as_u32(),
        r.kind.as_str().to_owned(),
        r.second.as_u32(),
    )
}

fn existing_edges(conn: &Connection) -> DbResult<HashSet<EdgeKey>> {
    let mut stmt = conn.prepare("SELECT firstId, secondId, type FROM Relationships")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, u32>(0)?,
            row.get::<_, String>(2)?,
            row.get::<_, u32>(1)?,
        ))
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn existing_contact_ids(conn: &Connection) -> DbResult<HashSet<u32>> {
    let mut stmt = conn.prepare("SELECT contactId FROM Contacts")?;
    let rows = stmt.query_map([], |row| row.get::<_, u32>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub(crate) fn save_batch(
    db: &ContactsDb,
    relationships: &[Relationship],
    error_map: &mut ErrorMap,
) -> DbResult<()> {
    if relationships.is_empty() {
        return Ok(());
    }

    db.write_with(|ctx| {
        let mut change_set = ChangeSet::default();
        save_batch_tx(db, ctx, relationships, error_map, &mut change_set)?;
        aggregate_ops::prune_childless_at_commit(ctx, &mut change_set)?;
        db.notify_on_commit(ctx, change_set);
        Ok(())
    })
}

pub(crate) fn save_batch_tx(
    db: &ContactsDb,
    ctx: &WriteTxCtx,
    relationships: &[Relationship],
    error_map: &mut ErrorMap,
    change_set: &mut ChangeSet,
) -> DbResult<()> {
    let mut bucketed = existing_edges(ctx)?;
    let valid_ids = existing_contact_ids(ctx)?;

    let mut insertions: Vec<&Relationship> = Vec::new();
    let mut aggregates_affected: HashSet<ContactId> = HashSet::new();
    let mut invalid = false;

    for (i, relationship) in relationships.iter().enumerate() {
        let first = relationship.first.as_u32();
        let second = relationship.second.as_u32();

        if first == second || !valid_ids.contains(&first) || !valid_ids.contains(&second) {
            invalid = true;
            error_map.insert(i, ErrorKind::InvalidRelationship);
            continue;
        }

        if !bucketed.insert(edge_key(relationship)) {
            // Already represented; saving a duplicate overwrites with
            // identical values, which is a no-op.
            continue;
        }

        insertions.push(relationship);
        if relationship.kind == RelationshipKind::Aggregates {
            aggregates_affected.insert(relationship.first);
        }
    }

    if invalid {
        return Err(DbError::from_kind(ErrorKind::InvalidRelationship));
    }

    if !insertions.is_empty() {
        // One statement for the whole batch, composed of UNION SELECT
        // rows, to avoid per-row round-trips.
        let selects = insertions
            .iter()
            .enumerate()
            .map(|(i, _)| {
                if i == 0 {
                    format!(
                        "SELECT ?{} AS firstId, ?{} AS secondId, ?{} AS type",
                        3 * i + 1,
                        3 * i + 2,
                        3 * i + 3
                    )
                } else {
                    format!(" UNION SELECT ?{}, ?{}, ?{}", 3 * i + 1, 3 * i + 2, 3 * i + 3)
                }
            })
            .join("");
        let values = insertions.iter().flat_map(|r| {
            [
                Value::Integer(i64::from(r.first.as_u32())),
                Value::Integer(i64::from(r.second.as_u32())),
                Value::Text(r.kind.as_str().to_owned()),
            ]
        });
        ctx.execute(
            &format!("INSERT INTO Relationships {selects}"),
            params_from_iter(values),
        )?;

        debug!(
            target: LOG_TARGET,
            count = insertions.len(),
            "Inserted relationships"
        );
    }

    if !aggregates_affected.is_empty() {
        let affected: Vec<ContactId> = aggregates_affected.into_iter().collect();
        aggregate_ops::regenerate_aggregates(db, ctx, &affected, &[], change_set)?;
    }

    Ok(())
}

pub(crate) fn remove_batch(
    db: &ContactsDb,
    relationships: &[Relationship],
    error_map: &mut ErrorMap,
) -> DbResult<()> {
    if relationships.is_empty() {
        return Ok(());
    }

    db.write_with(|ctx| {
        let mut change_set = ChangeSet::default();

        let bucketed = existing_edges(ctx)?;
        let mut already_removed: HashSet<EdgeKey> = HashSet::new();
        let mut aggregates_affected: HashSet<ContactId> = HashSet::new();
        let mut missing = false;

        for (i, relationship) in relationships.iter().enumerate() {
            let key = edge_key(relationship);
            if already_removed.contains(&key) {
                continue;
            }

            if !bucketed.contains(&key) {
                missing = true;
                error_map.insert(i, ErrorKind::DoesNotExist);
                continue;
            }

            if relationship.kind == RelationshipKind::Aggregates {
                aggregates_affected.insert(relationship.first);
            }

            ctx.execute(
                "DELETE FROM Relationships WHERE firstId = ?1 AND secondId = ?2 AND type = ?3",
                params![
                    relationship.first,
                    relationship.second,
                    relationship.kind.as_str()
                ],
            )?;
            already_removed.insert(key);
        }

        if missing {
            return Err(DbError::from_kind(ErrorKind::DoesNotExist));
        }

        // Severed aggregation edges may leave childless aggregates and
        // orphaned constituents behind.
        aggregate_ops::remove_childless_aggregates(ctx, &mut change_set)?;
        for id in change_set.removed_ids().collect::<Vec<_>>() {
            aggregates_affected.remove(&id);
        }
        if !aggregates_affected.is_empty() {
            let affected: Vec<ContactId> = aggregates_affected.into_iter().collect();
            aggregate_ops::regenerate_aggregates(db, ctx, &affected, &[], &mut change_set)?;
        }
        aggregate_ops::aggregate_orphaned_contacts(db, ctx, &mut change_set)?;
        aggregate_ops::prune_childless_at_commit(ctx, &mut change_set)?;

        db.notify_on_commit(ctx, change_set);
        Ok(())
    })
}

pub(crate) fn relationships_for(conn: &Connection, id: ContactId) -> DbResult<Vec<Relationship>> {
    let mut stmt = conn.prepare(
        "SELECT firstId, secondId, type FROM Relationships WHERE firstId = ?1 OR secondId = ?1",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok(Relationship::new(
            RelationshipKind::from_name(&row.get::<_, String>(2)?),
            ContactId::new(row.get(0)?),
            ContactId::new(row.get(1)?),
        ))
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Ids of the aggregates a constituent belongs to.
pub(crate) fn aggregate_ids_for(conn: &Connection, constituent: ContactId) -> DbResult<Vec<ContactId>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT firstId FROM Relationships WHERE secondId = ?1 AND type = 'Aggregates'",
    )?;
    let rows = stmt.query_map(params![constituent], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Constituent ids of an aggregate, in id order.
pub(crate) fn constituent_ids_for(
    conn: &Connection,
    aggregate: ContactId,
) -> DbResult<Vec<ContactId>> {
    let mut stmt = conn.prepare(
        "SELECT secondId FROM Relationships WHERE firstId = ?1 AND type = 'Aggregates' ORDER BY secondId",
    )?;
    let rows = stmt.query_map(params![aggregate], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

