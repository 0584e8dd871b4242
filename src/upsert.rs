//! Idempotent upsert executor.
//!
//! Callers hold a write transaction (`BEGIN IMMEDIATE` or a savepoint inside
//! one) around `apply`, so the existence check and the write below cannot
//! interleave with another submission of the same global id.
//!
//! Updates only ever set values: resubmitting a payload converges on the same
//! stored row, and a payload identical to what is stored writes nothing.

use crate::entities::{EntityDescriptor, EntityKind, Scope};
use crate::error::{SyncError, SyncResult};
use crate::record::SyncRecord;
use crate::resolver::{Binding, BoundReference};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub surrogate_id: i64,
    pub outcome: UpsertOutcome,
}

/// Server receipt time. Client clocks are never used for ordering.
pub fn server_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

const ENVELOPE_COLUMNS: [&str; 10] = [
    "tenant_id",
    "branch_id",
    "global_id",
    "origin_terminal_id",
    "local_sequence",
    "local_created_at",
    "server_received_at",
    "updated_at",
    "is_deleted",
    "deleted_at",
];

/// Stored state the update path compares against.
struct Existing {
    id: i64,
    branch_id: Option<i64>,
    is_deleted: bool,
    parent_id: Option<i64>,
    values: Vec<(&'static str, SqlValue)>,
}

impl Existing {
    fn value(&self, column: &str) -> Option<&SqlValue> {
        self.values.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
    }
}

/// Insert `record`, or update the mutable fields of the row already stored
/// under its global id.
///
/// `parent_id` is the header's surrogate for child kinds. Moving an existing
/// record to another branch or header is a [`SyncError::ScopeConflict`].
pub fn apply(
    conn: &Connection,
    tenant_id: i64,
    record: &SyncRecord,
    references: &[BoundReference],
    parent_id: Option<i64>,
) -> SyncResult<Applied> {
    let desc = record.kind.descriptor();

    match load_existing(conn, desc, tenant_id, record, references)? {
        None => insert(conn, desc, tenant_id, record, references, parent_id),
        Some(existing) => update(conn, desc, record, references, parent_id, existing),
    }
}

fn load_existing(
    conn: &Connection,
    desc: &EntityDescriptor,
    tenant_id: i64,
    record: &SyncRecord,
    references: &[BoundReference],
) -> SyncResult<Option<Existing>> {
    let mut tracked: Vec<&'static str> = record
        .fields
        .iter()
        .filter(|(spec, _)| spec.mutable)
        .map(|(spec, _)| spec.name)
        .collect();
    tracked.extend(references.iter().map(|r| r.spec.column));

    let parent_column = desc.parent.as_ref().map_or("NULL", |p| p.column);
    let mut select = format!("SELECT id, branch_id, is_deleted, {parent_column}");
    for column in &tracked {
        select.push_str(", ");
        select.push_str(column);
    }
    select.push_str(&format!(
        " FROM {} WHERE tenant_id = ?1 AND global_id = ?2",
        desc.table
    ));

    let existing = conn
        .query_row(&select, params![tenant_id, record.global_id], |row| {
            let mut values = Vec::with_capacity(tracked.len());
            for (offset, column) in tracked.iter().enumerate() {
                values.push((*column, row.get::<_, SqlValue>(4 + offset)?));
            }
            Ok(Existing {
                id: row.get(0)?,
                branch_id: row.get(1)?,
                is_deleted: row.get::<_, i64>(2)? != 0,
                parent_id: row.get(3)?,
                values,
            })
        })
        .optional()?;
    Ok(existing)
}

fn insert(
    conn: &Connection,
    desc: &EntityDescriptor,
    tenant_id: i64,
    record: &SyncRecord,
    references: &[BoundReference],
    parent_id: Option<i64>,
) -> SyncResult<Applied> {
    let now = server_now();
    let deleted = record.is_deleted.unwrap_or(false);

    let mut columns: Vec<&str> = ENVELOPE_COLUMNS.to_vec();
    let mut values: Vec<SqlValue> = vec![
        SqlValue::Integer(tenant_id),
        opt_integer(record.branch_id),
        SqlValue::Text(record.global_id.clone()),
        SqlValue::Text(record.origin_terminal_id.clone()),
        opt_integer(record.local_sequence),
        record
            .local_created_at
            .clone()
            .map_or(SqlValue::Null, SqlValue::Text),
        SqlValue::Text(now.clone()),
        SqlValue::Text(now.clone()),
        SqlValue::Integer(i64::from(deleted)),
        if deleted {
            SqlValue::Text(now)
        } else {
            SqlValue::Null
        },
    ];

    // An explicit null on insert leaves the column default in place.
    for (spec, value) in record.fields.iter().filter(|(_, v)| *v != SqlValue::Null) {
        columns.push(spec.name);
        values.push(value.clone());
    }
    for reference in references {
        columns.push(reference.spec.column);
        values.push(opt_integer(reference.binding.surrogate()));
    }
    if let Some(parent) = &desc.parent {
        columns.push(parent.column);
        values.push(opt_integer(parent_id));
    }

    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        desc.table,
        columns.join(", ")
    );
    conn.execute(&sql, params_from_iter(values.iter()))?;
    let surrogate_id = conn.last_insert_rowid();

    debug!(kind = %desc.kind, global_id = %record.global_id, surrogate_id, "Inserted record");
    Ok(Applied {
        surrogate_id,
        outcome: UpsertOutcome::Created,
    })
}

fn update(
    conn: &Connection,
    desc: &EntityDescriptor,
    record: &SyncRecord,
    references: &[BoundReference],
    parent_id: Option<i64>,
    existing: Existing,
) -> SyncResult<Applied> {
    if desc.scope == Scope::Branch && existing.branch_id != record.branch_id {
        return Err(SyncError::ScopeConflict {
            global_id: record.global_id.clone(),
        });
    }
    if desc.parent.is_some() && existing.parent_id != parent_id {
        return Err(SyncError::ScopeConflict {
            global_id: record.global_id.clone(),
        });
    }

    let mut changes: Vec<(&str, SqlValue)> = Vec::new();

    for (spec, value) in record.fields.iter().filter(|(spec, _)| spec.mutable) {
        if !existing.value(spec.name).is_some_and(|stored| same_value(stored, value)) {
            changes.push((spec.name, value.clone()));
        }
    }

    for reference in references {
        let column = reference.spec.column;
        let stored = existing.value(column);
        match reference.binding {
            Binding::Resolved(id) => {
                if stored != Some(&SqlValue::Integer(id)) {
                    changes.push((column, SqlValue::Integer(id)));
                }
            }
            // A substitute never overwrites a real reference already stored.
            Binding::Fallback(id) => {
                if matches!(stored, None | Some(SqlValue::Null)) {
                    changes.push((column, SqlValue::Integer(id)));
                }
            }
            Binding::Detached | Binding::Absent => {}
        }
    }

    let now = server_now();
    let newly_deleted = record.is_deleted == Some(true) && !existing.is_deleted;
    match record.is_deleted {
        Some(true) if !existing.is_deleted => {
            changes.push(("is_deleted", SqlValue::Integer(1)));
            changes.push(("deleted_at", SqlValue::Text(now.clone())));
        }
        Some(false) if existing.is_deleted => {
            changes.push(("is_deleted", SqlValue::Integer(0)));
            changes.push(("deleted_at", SqlValue::Null));
        }
        _ => {}
    }

    if changes.is_empty() {
        return Ok(Applied {
            surrogate_id: existing.id,
            outcome: UpsertOutcome::Unchanged,
        });
    }

    changes.push(("updated_at", SqlValue::Text(now.clone())));
    let assignments = changes
        .iter()
        .enumerate()
        .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {assignments} WHERE id = ?{}",
        desc.table,
        changes.len() + 1
    );
    let mut values: Vec<SqlValue> = changes.into_iter().map(|(_, v)| v).collect();
    values.push(SqlValue::Integer(existing.id));
    conn.execute(&sql, params_from_iter(values.iter()))?;
    if newly_deleted {
        cascade_tombstone(conn, desc, existing.id, &now)?;
    }

    debug!(kind = %desc.kind, global_id = %record.global_id, surrogate_id = existing.id, "Updated record");
    Ok(Applied {
        surrogate_id: existing.id,
        outcome: UpsertOutcome::Updated,
    })
}

/// Soft-delete a header record and its children. Never removes rows.
pub fn tombstone(
    conn: &Connection,
    tenant_id: i64,
    kind: EntityKind,
    global_id: &str,
) -> SyncResult<Applied> {
    let desc = kind.descriptor();
    let sql = format!(
        "SELECT id, is_deleted FROM {} WHERE tenant_id = ?1 AND global_id = ?2",
        desc.table
    );
    let (id, deleted): (i64, i64) = conn
        .query_row(&sql, params![tenant_id, global_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?
        .ok_or_else(|| SyncError::NotFound {
            kind: kind.as_str(),
            global_id: global_id.to_string(),
        })?;

    if deleted != 0 {
        return Ok(Applied {
            surrogate_id: id,
            outcome: UpsertOutcome::Unchanged,
        });
    }

    let now = server_now();
    conn.execute(
        &format!(
            "UPDATE {} SET is_deleted = 1, deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            desc.table
        ),
        params![now, id],
    )?;
    cascade_tombstone(conn, desc, id, &now)?;

    Ok(Applied {
        surrogate_id: id,
        outcome: UpsertOutcome::Updated,
    })
}

/// Tombstone the live children of header row `parent_id`. Returns how many
/// rows were flagged; kinds without children are a no-op.
pub(crate) fn cascade_tombstone(
    conn: &Connection,
    desc: &EntityDescriptor,
    parent_id: i64,
    now: &str,
) -> SyncResult<usize> {
    let Some(child) = &desc.children else {
        return Ok(0);
    };
    let child_desc = child.kind.descriptor();
    let Some(parent) = &child_desc.parent else {
        return Ok(0);
    };
    let flagged = conn.execute(
        &format!(
            "UPDATE {} SET is_deleted = 1, deleted_at = ?1, updated_at = ?1
             WHERE {} = ?2 AND is_deleted = 0",
            child_desc.table, parent.column
        ),
        params![now, parent_id],
    )?;
    if flagged > 0 {
        debug!(kind = %child.kind, parent_id, flagged, "Tombstoned child records");
    }
    Ok(flagged)
}

fn opt_integer(value: Option<i64>) -> SqlValue {
    value.map_or(SqlValue::Null, SqlValue::Integer)
}

/// REAL columns hand back integral values as reals; compare numerically.
fn same_value(stored: &SqlValue, incoming: &SqlValue) -> bool {
    match (stored, incoming) {
        (SqlValue::Integer(a), SqlValue::Real(b)) | (SqlValue::Real(b), SqlValue::Integer(a)) => {
            (*a as f64) == *b
        }
        _ => stored == incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;
    use crate::policy::PolicyTable;
    use crate::record::ParseContext;
    use crate::resolver::bind_references;
    use serde_json::{json, Value};

    fn ctx(branch: i64) -> ParseContext {
        ParseContext {
            tenant_id: 1,
            branch_id: Some(branch),
            terminal_id: Some("T-01".into()),
            max_children: 50,
        }
    }

    fn put(conn: &Connection, kind: EntityKind, payload: Value) -> SyncResult<Applied> {
        put_in_branch(conn, kind, payload, 10)
    }

    fn put_in_branch(
        conn: &Connection,
        kind: EntityKind,
        payload: Value,
        branch: i64,
    ) -> SyncResult<Applied> {
        let record = SyncRecord::parse(kind, &payload, &ctx(branch))?;
        let refs = bind_references(conn, 1, &record, &PolicyTable::defaults())?;
        apply(conn, 1, &record, &refs, None)
    }

    fn seed(conn: &Connection) {
        put(
            conn,
            EntityKind::Employee,
            json!({ "global_id": "emp-1", "full_name": "Ana", "username": "ana" }),
        )
        .unwrap();
        put(
            conn,
            EntityKind::Shift,
            json!({
                "global_id": "shift-1",
                "start_time": "2026-03-01T08:00:00Z",
                "employee_global_id": "emp-1"
            }),
        )
        .unwrap();
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn repeated_apply_yields_one_row_and_last_state() {
        let conn = test_conn();
        seed(&conn);
        let expense = |amount: f64, status: &str| {
            json!({
                "global_id": "exp-1",
                "amount": amount,
                "status": status,
                "employee_global_id": "emp-1"
            })
        };

        let first = put(&conn, EntityKind::Expense, expense(12.5, "pending")).unwrap();
        assert_eq!(first.outcome, UpsertOutcome::Created);
        for _ in 0..4 {
            let again = put(&conn, EntityKind::Expense, expense(12.5, "pending")).unwrap();
            assert_eq!(again.outcome, UpsertOutcome::Unchanged);
            assert_eq!(again.surrogate_id, first.surrogate_id);
        }
        let last = put(&conn, EntityKind::Expense, expense(15.0, "approved")).unwrap();
        assert_eq!(last.outcome, UpsertOutcome::Updated);
        assert_eq!(last.surrogate_id, first.surrogate_id);

        assert_eq!(count(&conn, "expenses"), 1);
        let (amount, status): (f64, String) = conn
            .query_row("SELECT amount, status FROM expenses", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(amount, 15.0);
        assert_eq!(status, "approved");
    }

    #[test]
    fn unchanged_resubmission_keeps_updated_at() {
        let conn = test_conn();
        seed(&conn);
        let stamp = |conn: &Connection| -> String {
            conn.query_row("SELECT updated_at FROM employees", [], |row| row.get(0))
                .unwrap()
        };
        let before = stamp(&conn);
        let again = put(
            &conn,
            EntityKind::Employee,
            json!({ "global_id": "emp-1", "full_name": "Ana", "username": "ana" }),
        )
        .unwrap();
        assert_eq!(again.outcome, UpsertOutcome::Unchanged);
        assert_eq!(stamp(&conn), before);
    }

    #[test]
    fn immutable_fields_keep_first_value() {
        let conn = test_conn();
        seed(&conn);
        let changed = put(
            &conn,
            EntityKind::Shift,
            json!({
                "global_id": "shift-1",
                "start_time": "2026-03-01T09:30:00Z",
                "employee_global_id": "emp-1"
            }),
        )
        .unwrap();
        assert_eq!(changed.outcome, UpsertOutcome::Unchanged);
        let start: String = conn
            .query_row("SELECT start_time FROM shifts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(start, "2026-03-01T08:00:00.000Z");
    }

    #[test]
    fn branch_move_is_a_scope_conflict() {
        let conn = test_conn();
        seed(&conn);
        let err = put_in_branch(
            &conn,
            EntityKind::Shift,
            json!({
                "global_id": "shift-1",
                "start_time": "2026-03-01T08:00:00Z",
                "employee_global_id": "emp-1"
            }),
            11,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::ScopeConflict { .. }));
    }

    #[test]
    fn check_constraint_is_record_level() {
        let conn = test_conn();
        seed(&conn);
        let err = put(
            &conn,
            EntityKind::Expense,
            json!({ "global_id": "exp-neg", "amount": -3, "employee_global_id": "emp-1" }),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Constraint(_)));
        assert!(err.is_record_level());
        assert_eq!(count(&conn, "expenses"), 0);
    }

    #[test]
    fn fallback_does_not_overwrite_a_real_reference() {
        let conn = test_conn();
        seed(&conn);
        put(&conn, EntityKind::Customer, json!({ "global_id": "cust-1", "name": "Luis" })).unwrap();
        let sale = |customer: &str| {
            json!({
                "global_id": "sale-1",
                "ticket_number": 7,
                "total": 10,
                "employee_global_id": "emp-1",
                "shift_global_id": "shift-1",
                "customer_global_id": customer
            })
        };
        let first = put(&conn, EntityKind::Sale, sale("cust-1")).unwrap();
        let again = put(&conn, EntityKind::Sale, sale("cust-not-synced")).unwrap();
        assert_eq!(again.outcome, UpsertOutcome::Unchanged);

        let customer: String = conn
            .query_row(
                "SELECT c.global_id FROM sales s JOIN customers c ON c.id = s.customer_id
                 WHERE s.id = ?1",
                [first.surrogate_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(customer, "cust-1");
    }

    #[test]
    fn tombstone_marks_and_is_idempotent() {
        let conn = test_conn();
        seed(&conn);
        let first = tombstone(&conn, 1, EntityKind::Shift, "shift-1").unwrap();
        assert_eq!(first.outcome, UpsertOutcome::Updated);
        let second = tombstone(&conn, 1, EntityKind::Shift, "shift-1").unwrap();
        assert_eq!(second.outcome, UpsertOutcome::Unchanged);

        let (deleted, deleted_at): (i64, Option<String>) = conn
            .query_row("SELECT is_deleted, deleted_at FROM shifts", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(deleted_at.is_some());
        assert_eq!(count(&conn, "shifts"), 1);

        let missing = tombstone(&conn, 1, EntityKind::Shift, "shift-404").unwrap_err();
        assert!(matches!(missing, SyncError::NotFound { .. }));
    }

    #[test]
    fn is_deleted_flag_goes_through_upsert() {
        let conn = test_conn();
        seed(&conn);
        let deleted = put(
            &conn,
            EntityKind::Employee,
            json!({ "global_id": "emp-1", "full_name": "Ana", "username": "ana", "is_deleted": true }),
        )
        .unwrap();
        assert_eq!(deleted.outcome, UpsertOutcome::Updated);
        let flag: i64 = conn
            .query_row("SELECT is_deleted FROM employees", [], |row| row.get(0))
            .unwrap();
        assert_eq!(flag, 1);
    }

    #[test]
    fn explicit_null_clears_a_mutable_field() {
        let conn = test_conn();
        seed(&conn);
        let expense = |description: Value| {
            json!({
                "global_id": "exp-1",
                "amount": 80,
                "description": description,
                "employee_global_id": "emp-1"
            })
        };
        put(&conn, EntityKind::Expense, expense(json!("taxi"))).unwrap();

        let cleared = put(&conn, EntityKind::Expense, expense(Value::Null)).unwrap();
        assert_eq!(cleared.outcome, UpsertOutcome::Updated);
        let stored: Option<String> = conn
            .query_row("SELECT description FROM expenses", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, None);

        let again = put(&conn, EntityKind::Expense, expense(Value::Null)).unwrap();
        assert_eq!(again.outcome, UpsertOutcome::Unchanged);
    }

    #[test]
    fn null_on_insert_keeps_column_default() {
        let conn = test_conn();
        put(
            &conn,
            EntityKind::Employee,
            json!({ "global_id": "emp-9", "full_name": "Eva", "username": "eva", "is_active": null }),
        )
        .unwrap();
        let active: i64 = conn
            .query_row("SELECT is_active FROM employees", [], |row| row.get(0))
            .unwrap();
        assert_eq!(active, 1);
    }

    #[test]
    fn is_deleted_upsert_cascades_to_children() {
        let conn = test_conn();
        seed(&conn);
        let sale = |deleted: bool| {
            json!({
                "global_id": "sale-1",
                "ticket_number": 3,
                "total": 10,
                "employee_global_id": "emp-1",
                "shift_global_id": "shift-1",
                "is_deleted": deleted
            })
        };
        let header = put(&conn, EntityKind::Sale, sale(false)).unwrap();
        let item = SyncRecord::parse(
            EntityKind::SaleItem,
            &json!({ "global_id": "sale-1-1", "quantity": 1, "unit_price": 10, "line_total": 10 }),
            &ctx(10),
        )
        .unwrap();
        apply(&conn, 1, &item, &[], Some(header.surrogate_id)).unwrap();

        let deleted = put(&conn, EntityKind::Sale, sale(true)).unwrap();
        assert_eq!(deleted.outcome, UpsertOutcome::Updated);
        let live: i64 = conn
            .query_row("SELECT COUNT(*) FROM sale_items WHERE is_deleted = 0", [], |row| row.get(0))
            .unwrap();
        assert_eq!(live, 0);
        assert_eq!(count(&conn, "sale_items"), 1);
    }
}
