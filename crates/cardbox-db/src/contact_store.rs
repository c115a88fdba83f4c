//! Row-level CRUD across the `Contacts` table and the per-detail-type
//! child tables.
//!
//! All binding and extraction is driven by the detail schema registry:
//! each child table insert is generated from the registered column list,
//! including derived companion columns (case-folded text, normalized
//! phone numbers). Callers are expected to have recomputed derived
//! fields before writing; this module persists what it is given.

use cardbox_core::detail::fields;
use cardbox_core::{
    AccessConstraints, ContactId, ContactRecord, Context, Detail, DetailId, DetailKind,
    FieldValue, Provenance, SyncTarget, Timestamp, normalize_phone_number, timestamp,
};
use itertools::Itertools as _;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OptionalExtension as _, params, params_from_iter};

use crate::registry::{self, DetailSchema, FieldKind, Transform};
use crate::{DbResult, DoesNotExistSnafu};

/// Denormalized flag columns on the `Contacts` row.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct StatusFlags {
    pub has_phone_number: bool,
    pub has_email_address: bool,
    pub has_online_account: bool,
    pub is_online: bool,
}

fn join_list(items: &[String]) -> String {
    items.iter().join(";")
}

fn split_list(joined: &str) -> Vec<String> {
    joined
        .split(';')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Converts an in-memory field value to its stored form.
fn bind_field(value: Option<&FieldValue>) -> Value {
    match value {
        None => Value::Null,
        Some(FieldValue::Text(s)) => Value::Text(s.clone()),
        Some(FieldValue::TextList(items)) => Value::Text(join_list(items)),
        Some(FieldValue::Int(v)) => Value::Integer(*v),
        Some(FieldValue::IntList(items)) => Value::Text(items.iter().join(";")),
        Some(FieldValue::Bool(v)) => Value::Integer(i64::from(*v)),
        Some(FieldValue::Real(v)) => Value::Real(*v),
        Some(FieldValue::Date(d)) => Value::Text(timestamp::format_date(*d)),
        Some(FieldValue::Timestamp(ts)) => Value::Text(ts.to_sql_string()),
        Some(FieldValue::Blob(b)) => Value::Blob(b.clone()),
    }
}

/// Reconstructs a field value from a stored column, using the registered
/// kind as the target shape. Stored data written by other clients is
/// decoded leniently; undecodable values are skipped rather than failing
/// the whole read.
fn extract_field(kind: FieldKind, value: ValueRef<'_>) -> Option<FieldValue> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(v) => Some(match kind {
            FieldKind::Bool => FieldValue::Bool(v != 0),
            FieldKind::Real => FieldValue::Real(v as f64),
            _ => FieldValue::Int(v),
        }),
        ValueRef::Real(v) => Some(FieldValue::Real(v)),
        ValueRef::Blob(b) => Some(FieldValue::Blob(b.to_vec())),
        ValueRef::Text(raw) => {
            let text = String::from_utf8_lossy(raw).into_owned();
            match kind {
                FieldKind::TextList => Some(FieldValue::TextList(split_list(&text))),
                FieldKind::Date => timestamp::parse_date(&text).ok().map(FieldValue::Date),
                FieldKind::Timestamp => {
                    Timestamp::parse_sql(&text).ok().map(FieldValue::Timestamp)
                }
                _ => Some(FieldValue::Text(text)),
            }
        }
    }
}

fn derived_value(transform: Transform, value: Option<&FieldValue>) -> Value {
    match value.and_then(FieldValue::as_text) {
        None => Value::Null,
        Some(text) => Value::Text(match transform {
            Transform::Lower => text.to_lowercase(),
            Transform::NormalizePhone => normalize_phone_number(text),
        }),
    }
}

// ---- Primary row ----

const PRIMARY_COLUMNS: &str = "displayLabel, firstName, lowerFirstName, lastName, lowerLastName, \
     middleName, prefix, suffix, customLabel, syncTarget, created, modified, gender, \
     contactType, isFavorite, hasPhoneNumber, hasEmailAddress, hasOnlineAccount, isOnline, \
     isDeactivated, isIncidental";

fn primary_row_values(record: &ContactRecord) -> Vec<Value> {
    let name = record.detail(DetailKind::Name);
    let name_text = |field: &str| -> Value {
        match name.and_then(|d| d.text(field)) {
            Some(text) => Value::Text(text.to_owned()),
            None => Value::Null,
        }
    };
    let lowered = |field: &str| -> Value {
        match name.and_then(|d| d.text(field)) {
            Some(text) => Value::Text(text.to_lowercase()),
            None => Value::Null,
        }
    };

    let timestamps = record.detail(DetailKind::Timestamp);
    let timestamp_text = |field: &str| -> Value {
        match timestamps.and_then(|d| d.timestamp(field)) {
            Some(ts) => Value::Text(ts.to_sql_string()),
            None => Value::Null,
        }
    };

    let status = record.detail(DetailKind::StatusFlags);
    let flag = |field: &str| -> Value {
        Value::Integer(i64::from(
            status.and_then(|d| d.bool_value(field)).unwrap_or(false),
        ))
    };

    vec![
        match record.display_label() {
            Some(label) => Value::Text(label.to_owned()),
            None => Value::Null,
        },
        name_text(fields::FIRST_NAME),
        lowered(fields::FIRST_NAME),
        name_text(fields::LAST_NAME),
        lowered(fields::LAST_NAME),
        name_text(fields::MIDDLE_NAME),
        name_text(fields::PREFIX),
        name_text(fields::SUFFIX),
        name_text(fields::CUSTOM_LABEL),
        Value::Text(record.sync_target_or_local().as_str().to_owned()),
        timestamp_text(fields::CREATED),
        timestamp_text(fields::MODIFIED),
        match record.gender() {
            Some(gender) if !gender.is_empty() => Value::Text(gender.to_owned()),
            _ => Value::Null,
        },
        Value::Text(
            record
                .detail(DetailKind::Type)
                .and_then(|d| d.text(fields::TYPE))
                .unwrap_or("Contact")
                .to_owned(),
        ),
        Value::Integer(i64::from(record.is_favorite())),
        flag(fields::HAS_PHONE_NUMBER),
        flag(fields::HAS_EMAIL_ADDRESS),
        flag(fields::HAS_ONLINE_ACCOUNT),
        flag(fields::IS_ONLINE),
        Value::Integer(i64::from(record.is_deactivated())),
        Value::Integer(i64::from(record.is_incidental())),
    ]
}

/// Inserts the primary row and one child-table row per detail, assigning
/// the new contact id and detail ids into `record`.
pub(crate) fn create_contact(conn: &Connection, record: &mut ContactRecord) -> DbResult<ContactId> {
    let placeholders = (1..=21).map(|i| format!("?{i}")).join(", ");
    conn.execute(
        &format!("INSERT INTO Contacts ({PRIMARY_COLUMNS}) VALUES ({placeholders})"),
        params_from_iter(primary_row_values(record)),
    )?;

    let id = ContactId::new(conn.last_insert_rowid() as u32);
    record.id = id;

    write_details(conn, id, record, &[])?;
    Ok(id)
}

/// Rewrites the primary row, then delete-and-reinserts the child tables
/// selected by `mask` (all of them when the mask is empty).
pub(crate) fn update_contact(
    conn: &Connection,
    id: ContactId,
    record: &mut ContactRecord,
    mask: &[DetailKind],
) -> DbResult<()> {
    if mask.is_empty() {
        let assignments = PRIMARY_COLUMNS
            .split(", ")
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .join(", ");
        let mut values = primary_row_values(record);
        values.push(Value::Integer(i64::from(id.as_u32())));
        conn.execute(
            &format!("UPDATE Contacts SET {assignments} WHERE contactId = ?22"),
            params_from_iter(values),
        )?;
    } else {
        update_primary_masked(conn, id, record, mask)?;
    }

    write_details(conn, id, record, mask)?;
    Ok(())
}

/// Masked primary-row update: columns belonging to unmasked detail kinds
/// keep their stored values.
fn update_primary_masked(
    conn: &Connection,
    id: ContactId,
    record: &ContactRecord,
    mask: &[DetailKind],
) -> DbResult<()> {
    let mut assignments = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    let mut push = |assignment: &str, mut vals: Vec<Value>| {
        assignments.push(assignment.to_owned());
        values.append(&mut vals);
    };

    for kind in mask {
        match kind {
            DetailKind::Name => {
                let name = record.detail(DetailKind::Name);
                let text = |field: &str| -> Value {
                    match name.and_then(|d| d.text(field)) {
                        Some(t) => Value::Text(t.to_owned()),
                        None => Value::Null,
                    }
                };
                let lower = |field: &str| -> Value {
                    match name.and_then(|d| d.text(field)) {
                        Some(t) => Value::Text(t.to_lowercase()),
                        None => Value::Null,
                    }
                };
                push(
                    "firstName = ?, lowerFirstName = ?, lastName = ?, lowerLastName = ?, \
                     middleName = ?, prefix = ?, suffix = ?, customLabel = ?",
                    vec![
                        text(fields::FIRST_NAME),
                        lower(fields::FIRST_NAME),
                        text(fields::LAST_NAME),
                        lower(fields::LAST_NAME),
                        text(fields::MIDDLE_NAME),
                        text(fields::PREFIX),
                        text(fields::SUFFIX),
                        text(fields::CUSTOM_LABEL),
                    ],
                );
            }
            DetailKind::DisplayLabel => push(
                "displayLabel = ?",
                vec![match record.display_label() {
                    Some(label) => Value::Text(label.to_owned()),
                    None => Value::Null,
                }],
            ),
            DetailKind::SyncTarget => push(
                "syncTarget = ?",
                vec![Value::Text(record.sync_target_or_local().as_str().to_owned())],
            ),
            DetailKind::Timestamp => {
                let ts = record.detail(DetailKind::Timestamp);
                let text = |field: &str| -> Value {
                    match ts.and_then(|d| d.timestamp(field)) {
                        Some(value) => Value::Text(value.to_sql_string()),
                        None => Value::Null,
                    }
                };
                push(
                    "created = ?, modified = ?",
                    vec![text(fields::CREATED), text(fields::MODIFIED)],
                );
            }
            DetailKind::Gender => push(
                "gender = ?",
                vec![match record.gender() {
                    Some(g) if !g.is_empty() => Value::Text(g.to_owned()),
                    _ => Value::Null,
                }],
            ),
            DetailKind::Favorite => push(
                "isFavorite = ?",
                vec![Value::Integer(i64::from(record.is_favorite()))],
            ),
            DetailKind::Type => push(
                "contactType = ?",
                vec![Value::Text(
                    record
                        .detail(DetailKind::Type)
                        .and_then(|d| d.text(fields::TYPE))
                        .unwrap_or("Contact")
                        .to_owned(),
                )],
            ),
            DetailKind::StatusFlags => {
                let status = record.detail(DetailKind::StatusFlags);
                let flag = |field: &str| -> Value {
                    Value::Integer(i64::from(
                        status.and_then(|d| d.bool_value(field)).unwrap_or(false),
                    ))
                };
                push(
                    "hasPhoneNumber = ?, hasEmailAddress = ?, hasOnlineAccount = ?, isOnline = ?",
                    vec![
                        flag(fields::HAS_PHONE_NUMBER),
                        flag(fields::HAS_EMAIL_ADDRESS),
                        flag(fields::HAS_ONLINE_ACCOUNT),
                        flag(fields::IS_ONLINE),
                    ],
                );
            }
            DetailKind::Deactivated => push(
                "isDeactivated = ?",
                vec![Value::Integer(i64::from(record.is_deactivated()))],
            ),
            DetailKind::Incidental => push(
                "isIncidental = ?",
                vec![Value::Integer(i64::from(record.is_incidental()))],
            ),
            _ => {}
        }
    }

    if assignments.is_empty() {
        return Ok(());
    }

    values.push(Value::Integer(i64::from(id.as_u32())));
    conn.execute(
        &format!(
            "UPDATE Contacts SET {} WHERE contactId = ?",
            assignments.join(", ")
        ),
        params_from_iter(values),
    )?;
    Ok(())
}

/// Refreshes only the denormalized status-flag columns; used when a
/// presence-only update is routed to the transient store.
pub(crate) fn update_status_flags(
    conn: &Connection,
    id: ContactId,
    flags: StatusFlags,
) -> DbResult<()> {
    conn.execute(
        "UPDATE Contacts SET hasPhoneNumber = ?2, hasEmailAddress = ?3, hasOnlineAccount = ?4, isOnline = ?5 WHERE contactId = ?1",
        params![
            id,
            flags.has_phone_number,
            flags.has_email_address,
            flags.has_online_account,
            flags.is_online
        ],
    )?;
    Ok(())
}

// ---- Child tables ----

fn masked(schema: &DetailSchema, mask: &[DetailKind]) -> bool {
    mask.is_empty() || mask.contains(&schema.kind)
}

/// Prefixes detail URIs with `aggregate:` so an aggregate's copies do
/// not clash with its constituents' URIs.
pub(crate) fn adjust_aggregate_detail_uris(detail: &mut Detail) {
    const PREFIX: &str = "aggregate:";

    let adjust = |uri: &mut String| {
        if uri.is_empty() || uri.starts_with(PREFIX) {
            return;
        }
        if let Some(stripped) = uri
            .strip_prefix("aggregate")
            .and_then(|rest| rest.split_once(':'))
            .map(|(_, tail)| tail)
        {
            // Drop a stale malformed prefix before re-prefixing.
            *uri = stripped.to_owned();
        }
        uri.insert_str(0, PREFIX);
    };

    if let Some(uri) = detail.detail_uri.as_mut() {
        adjust(uri);
    }
    for uri in &mut detail.linked_detail_uris {
        adjust(uri);
    }
}

/// Rewrites the child-table details of a contact. Each selected detail
/// kind is fully deleted and reinserted; no per-detail diff is attempted
/// here. Detail ids are reassigned, and identity across the rewrite is
/// carried by provenance: details on non-aggregate contacts are stamped
/// `<contactId>:<detailId>:<syncTarget>` at insertion, while aggregate
/// rows keep the provenance of the constituent copy they came from.
fn write_details(
    conn: &Connection,
    id: ContactId,
    record: &mut ContactRecord,
    mask: &[DetailKind],
) -> DbResult<()> {
    let sync_target = record.sync_target_or_local();
    let is_aggregate = sync_target == SyncTarget::Aggregate;
    let was_local = sync_target == SyncTarget::WasLocal;
    let syncable =
        !is_aggregate && !sync_target.is_local_kind() && sync_target != SyncTarget::Export;

    for schema in registry::DETAIL_SCHEMAS {
        let Some(table) = schema.table else {
            continue;
        };
        if !masked(schema, mask) {
            continue;
        }

        conn.execute(
            &format!("DELETE FROM {table} WHERE contactId = ?1"),
            params![id],
        )?;
        conn.execute(
            "DELETE FROM Details WHERE contactId = ?1 AND detail = ?2",
            params![id, schema.kind.name()],
        )?;
    }

    for detail in &mut record.details {
        let schema = registry::schema(detail.kind());
        let Some(table) = schema.table else {
            continue;
        };
        if !masked(schema, mask) {
            continue;
        }

        if is_aggregate {
            adjust_aggregate_detail_uris(detail);
        }
        let modifiable = if was_local {
            Some(true)
        } else if syncable {
            detail.modifiable
        } else {
            None
        };

        conn.execute(
            "INSERT INTO Details (contactId, detail, detailUri, linkedDetailUris, contexts, \
             accessConstraints, provenance, modifiable, nonexportable) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                schema.kind.name(),
                detail.detail_uri,
                if detail.linked_detail_uris.is_empty() {
                    None
                } else {
                    Some(join_list(&detail.linked_detail_uris))
                },
                if detail.contexts.is_empty() {
                    None
                } else {
                    Some(Context::join(&detail.contexts))
                },
                detail.access.bits(),
                detail.provenance.as_ref().map(Provenance::to_string),
                modifiable,
                detail.nonexportable,
            ],
        )?;
        let detail_id = DetailId::new(conn.last_insert_rowid() as u32);
        detail.id = Some(detail_id);

        if !is_aggregate {
            // Provenance names this row; it is generated here and copied
            // verbatim onto any aggregate promotion of this detail.
            let provenance = Provenance::new(id, detail_id, sync_target.clone());
            conn.execute(
                "UPDATE Details SET provenance = ?2 WHERE detailId = ?1",
                params![detail_id, provenance.to_string()],
            )?;
            detail.provenance = Some(provenance);
        }

        let mut columns = vec!["detailId", "contactId"];
        let mut values = vec![
            Value::Integer(i64::from(detail_id.as_u32())),
            Value::Integer(i64::from(id.as_u32())),
        ];
        for field in schema.fields {
            columns.push(field.name);
            values.push(bind_field(detail.value(field.name)));
            if let Some(derived) = field.derived {
                columns.push(derived.column);
                values.push(derived_value(derived.transform, detail.value(field.name)));
            }
        }

        let placeholders = (1..=values.len()).map(|i| format!("?{i}")).join(", ");
        conn.execute(
            &format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders})",
                columns.join(", ")
            ),
            params_from_iter(values),
        )?;
    }

    Ok(())
}

// ---- Reads ----

pub(crate) fn contact_sync_target(
    conn: &Connection,
    id: ContactId,
) -> DbResult<Option<SyncTarget>> {
    Ok(conn
        .query_row(
            "SELECT syncTarget FROM Contacts WHERE contactId = ?1",
            params![id],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(|st| SyncTarget::from_name(&st)))
}

/// Decodes a stored contact back into a record: the primary row is
/// re-expressed as its constituent singular details, then the child
/// tables are joined in through the `Details` rows.
pub(crate) fn get_contact(conn: &Connection, id: ContactId) -> DbResult<Option<ContactRecord>> {
    let row = conn
        .query_row(
            &format!("SELECT {PRIMARY_COLUMNS} FROM Contacts WHERE contactId = ?1"),
            params![id],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,  // displayLabel
                    row.get::<_, Option<String>>(1)?,  // firstName
                    row.get::<_, Option<String>>(3)?,  // lastName
                    row.get::<_, Option<String>>(5)?,  // middleName
                    row.get::<_, Option<String>>(6)?,  // prefix
                    row.get::<_, Option<String>>(7)?,  // suffix
                    row.get::<_, Option<String>>(8)?,  // customLabel
                    row.get::<_, String>(9)?,          // syncTarget
                    row.get::<_, Option<String>>(10)?, // created
                    row.get::<_, Option<String>>(11)?, // modified
                    row.get::<_, Option<String>>(12)?, // gender
                    row.get::<_, String>(13)?,         // contactType
                    row.get::<_, bool>(14)?,           // isFavorite
                    row.get::<_, bool>(15)?,           // hasPhoneNumber
                    row.get::<_, bool>(16)?,           // hasEmailAddress
                    row.get::<_, bool>(17)?,           // hasOnlineAccount
                    row.get::<_, bool>(18)?,           // isOnline
                    row.get::<_, bool>(19)?,           // isDeactivated
                    row.get::<_, bool>(20)?,           // isIncidental
                ))
            },
        )
        .optional()?;

    let Some((
        display_label,
        first_name,
        last_name,
        middle_name,
        prefix,
        suffix,
        custom_label,
        sync_target,
        created,
        modified,
        gender,
        contact_type,
        is_favorite,
        has_phone,
        has_email,
        has_online_account,
        is_online,
        is_deactivated,
        is_incidental,
    )) = row
    else {
        return Ok(None);
    };

    let mut record = ContactRecord::with_id(id);

    let mut name = Detail::new(DetailKind::Name);
    let mut any_name = false;
    for (field, value) in [
        (fields::FIRST_NAME, first_name),
        (fields::LAST_NAME, last_name),
        (fields::MIDDLE_NAME, middle_name),
        (fields::PREFIX, prefix),
        (fields::SUFFIX, suffix),
        (fields::CUSTOM_LABEL, custom_label),
    ] {
        if let Some(value) = value {
            name.set_value(field, FieldValue::Text(value));
            any_name = true;
        }
    }
    if any_name {
        record.push_detail(name);
    }

    if let Some(label) = display_label {
        record.push_detail(Detail::new(DetailKind::DisplayLabel).with_text(fields::LABEL, label));
    }

    record.push_detail(
        Detail::new(DetailKind::SyncTarget).with_text(fields::SYNC_TARGET, sync_target),
    );
    record.push_detail(Detail::new(DetailKind::Type).with_text(fields::TYPE, contact_type));

    let mut timestamps = Detail::new(DetailKind::Timestamp);
    if let Some(ts) = created.as_deref().and_then(|t| Timestamp::parse_sql(t).ok()) {
        timestamps.set_value(fields::CREATED, FieldValue::Timestamp(ts));
    }
    if let Some(ts) = modified.as_deref().and_then(|t| Timestamp::parse_sql(t).ok()) {
        timestamps.set_value(fields::MODIFIED, FieldValue::Timestamp(ts));
    }
    record.push_detail(timestamps);

    if let Some(gender) = gender {
        record.push_detail(Detail::new(DetailKind::Gender).with_text(fields::GENDER, gender));
    }

    record.push_detail(Detail::new(DetailKind::Favorite).with_bool(fields::IS_FAVORITE, is_favorite));
    record.push_detail(
        Detail::new(DetailKind::StatusFlags)
            .with_bool(fields::HAS_PHONE_NUMBER, has_phone)
            .with_bool(fields::HAS_EMAIL_ADDRESS, has_email)
            .with_bool(fields::HAS_ONLINE_ACCOUNT, has_online_account)
            .with_bool(fields::IS_ONLINE, is_online),
    );

    if is_deactivated {
        record.push_detail(Detail::new(DetailKind::Deactivated));
    }
    if is_incidental {
        record.push_detail(Detail::new(DetailKind::Incidental));
    }

    read_child_details(conn, id, &mut record)?;
    record.relationships = crate::relationship_ops::relationships_for(conn, id)?;

    Ok(Some(record))
}

fn read_child_details(
    conn: &Connection,
    id: ContactId,
    record: &mut ContactRecord,
) -> DbResult<()> {
    let mut stmt = conn.prepare(
        "SELECT detailId, detail, detailUri, linkedDetailUris, contexts, accessConstraints, \
         provenance, modifiable, nonexportable FROM Details WHERE contactId = ?1 ORDER BY detailId",
    )?;
    let common_rows: Vec<(DetailId, String, Option<String>, Option<String>, Option<String>, i64, Option<String>, Option<bool>, bool)> = stmt
        .query_map(params![id], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ))
        })?
        .collect::<Result<_, _>>()?;

    for (
        detail_id,
        kind_name,
        detail_uri,
        linked_uris,
        contexts,
        access_bits,
        provenance,
        modifiable,
        nonexportable,
    ) in common_rows
    {
        // Unknown kind names written by newer code are skipped.
        let Some(kind) = DetailKind::from_name(&kind_name) else {
            continue;
        };
        let schema = registry::schema(kind);
        let Some(table) = schema.table else {
            continue;
        };

        let mut detail = Detail::new(kind);
        detail.id = Some(detail_id);
        detail.detail_uri = detail_uri;
        detail.linked_detail_uris = linked_uris.as_deref().map(split_list).unwrap_or_default();
        detail.contexts = contexts.as_deref().map(Context::split).unwrap_or_default();
        detail.access = AccessConstraints::from_bits(access_bits);
        detail.provenance = provenance.as_deref().and_then(|p| p.parse().ok());
        detail.modifiable = modifiable;
        detail.nonexportable = nonexportable;

        let columns = schema.fields.iter().map(|f| f.name).join(", ");
        let sql = format!("SELECT {columns} FROM {table} WHERE detailId = ?1");
        let mut field_stmt = conn.prepare(&sql)?;
        let found = field_stmt
            .query_row(params![detail_id], |row| {
                for (i, field) in schema.fields.iter().enumerate() {
                    if let Some(value) = extract_field(field.kind, row.get_ref(i)?) {
                        detail.set_value(field.name, value);
                    }
                }
                Ok(())
            })
            .optional()?;
        if found.is_some() {
            record.push_detail(detail);
        }
    }

    Ok(())
}

// ---- Removal ----

/// Deletes contact rows and all dependent rows, writing one tombstone
/// per contact. The caller is responsible for aggregate maintenance.
pub(crate) fn remove_contact_rows(conn: &Connection, ids: &[ContactId]) -> DbResult<()> {
    let now = Timestamp::now().to_sql_string();

    for id in ids {
        let sync_target = contact_sync_target(conn, *id)?
            .ok_or_else(|| DoesNotExistSnafu.build())?;

        conn.execute(
            "INSERT INTO DeletedContacts (contactId, syncTarget, deleted) VALUES (?1, ?2, ?3)",
            params![id, sync_target.as_str(), now],
        )?;

        for schema in registry::DETAIL_SCHEMAS {
            if let Some(table) = schema.table {
                conn.execute(
                    &format!("DELETE FROM {table} WHERE contactId = ?1"),
                    params![id],
                )?;
            }
        }
        conn.execute("DELETE FROM Details WHERE contactId = ?1", params![id])?;
        conn.execute(
            "DELETE FROM Relationships WHERE firstId = ?1 OR secondId = ?1",
            params![id],
        )?;
        conn.execute("DELETE FROM Contacts WHERE contactId = ?1", params![id])?;
    }

    Ok(())
}
