//! Identifier resolution: client global ids to server surrogate keys.
//!
//! `resolve` is a read-only lookup. `bind_references` applies the reference
//! policy table to every foreign reference of a record and is the only place
//! a fallback substitute (the walk-in customer) may be created.

use crate::entities::{EntityKind, Fallback, PolicyKind, ReferenceSpec};
use crate::error::{SyncError, SyncResult};
use crate::policy::PolicyTable;
use crate::record::SyncRecord;
use crate::upsert::server_now;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};
use uuid::Uuid;

pub const WALK_IN_CUSTOMER_NAME: &str = "Walk-in customer";
/// Origin recorded on rows the server creates itself.
const SERVER_ORIGIN: &str = "SERVER";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(i64),
    Unresolved,
}

/// Look up the surrogate key of `global_id` within the tenant. Soft-deleted
/// rows still resolve. A missing row is `Unresolved`, not an error.
pub fn resolve(
    conn: &Connection,
    kind: EntityKind,
    global_id: &str,
    tenant_id: i64,
) -> SyncResult<Resolution> {
    if global_id.trim().is_empty() {
        return Err(SyncError::Validation(format!("empty {kind} global id")));
    }
    let sql = format!(
        "SELECT id FROM {} WHERE tenant_id = ?1 AND global_id = ?2",
        kind.descriptor().table
    );
    let found: Option<i64> = conn
        .query_row(&sql, params![tenant_id, global_id], |row| row.get(0))
        .optional()?;
    Ok(found.map_or(Resolution::Unresolved, Resolution::Resolved))
}

/// How a reference ended up bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Resolved(i64),
    /// Unresolved or absent, replaced by the declared fallback.
    Fallback(i64),
    /// Sent but unresolved, stored as NULL.
    Detached,
    /// Not sent.
    Absent,
}

impl Binding {
    pub fn surrogate(self) -> Option<i64> {
        match self {
            Binding::Resolved(id) | Binding::Fallback(id) => Some(id),
            Binding::Detached | Binding::Absent => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoundReference {
    pub spec: &'static ReferenceSpec,
    pub binding: Binding,
}

/// Reject records (and their children) that omit a reference whose policy
/// gives it no way to be filled. Runs before anything touches the store.
pub fn check_required_references(record: &SyncRecord, policies: &PolicyTable) -> SyncResult<()> {
    for reference in &record.references {
        if reference.global_id.is_some() {
            continue;
        }
        let spec = reference.spec;
        let policy = policies.policy_for(record.kind, spec);
        if policy == PolicyKind::Fatal && !spec.nullable {
            return Err(SyncError::Validation(format!(
                "{} {}: missing {}",
                record.kind, record.global_id, spec.field
            )));
        }
    }
    record
        .children
        .iter()
        .try_for_each(|child| check_required_references(child, policies))
}

/// Resolve every declared reference of `record` and apply its policy.
///
/// Must run inside the caller's write transaction: a walk-in fallback may
/// insert the tenant's walk-in customer.
pub fn bind_references(
    conn: &Connection,
    tenant_id: i64,
    record: &SyncRecord,
    policies: &PolicyTable,
) -> SyncResult<Vec<BoundReference>> {
    let mut bound: Vec<BoundReference> = Vec::with_capacity(record.references.len());

    for reference in &record.references {
        let spec = reference.spec;
        let policy = policies.policy_for(record.kind, spec);

        let binding = match &reference.global_id {
            Some(global_id) => match resolve(conn, spec.target, global_id, tenant_id)? {
                Resolution::Resolved(id) => Binding::Resolved(id),
                Resolution::Unresolved => match policy {
                    PolicyKind::Fatal => {
                        return Err(SyncError::UnresolvedReference {
                            field: spec.field,
                            target: spec.target.as_str(),
                            global_id: global_id.clone(),
                        });
                    }
                    PolicyKind::Detach => {
                        warn!(
                            kind = %record.kind,
                            global_id = %record.global_id,
                            field = spec.field,
                            missing = %global_id,
                            "Detaching unresolved reference"
                        );
                        Binding::Detached
                    }
                    PolicyKind::Fallback => {
                        let id = fallback(conn, tenant_id, record, spec, &bound)?
                            .ok_or_else(|| SyncError::UnresolvedReference {
                                field: spec.field,
                                target: spec.target.as_str(),
                                global_id: global_id.clone(),
                            })?;
                        warn!(
                            kind = %record.kind,
                            global_id = %record.global_id,
                            field = spec.field,
                            missing = %global_id,
                            fallback_id = id,
                            "Substituting fallback for unresolved reference"
                        );
                        Binding::Fallback(id)
                    }
                },
            },
            None if policy == PolicyKind::Fallback => {
                match fallback(conn, tenant_id, record, spec, &bound)? {
                    Some(id) => Binding::Fallback(id),
                    None if spec.nullable => Binding::Absent,
                    None => {
                        return Err(SyncError::Validation(format!(
                            "{} {}: missing {}",
                            record.kind, record.global_id, spec.field
                        )))
                    }
                }
            }
            None if policy == PolicyKind::Fatal && !spec.nullable => {
                return Err(SyncError::Validation(format!(
                    "{} {}: missing {}",
                    record.kind, record.global_id, spec.field
                )));
            }
            None => Binding::Absent,
        };

        bound.push(BoundReference { spec, binding });
    }

    Ok(bound)
}

fn fallback(
    conn: &Connection,
    tenant_id: i64,
    record: &SyncRecord,
    spec: &ReferenceSpec,
    bound: &[BoundReference],
) -> SyncResult<Option<i64>> {
    match spec.fallback {
        Some(Fallback::WalkInCustomer) => walk_in_customer(conn, tenant_id).map(Some),
        Some(Fallback::SameAs(sibling)) => Ok(bound
            .iter()
            .find(|b| b.spec.field == sibling)
            .and_then(|b| b.binding.surrogate())),
        None => {
            warn!(kind = %record.kind, field = spec.field, "Fallback policy without a fallback source");
            Ok(None)
        }
    }
}

/// The tenant's system walk-in customer, created on first use.
pub fn walk_in_customer(conn: &Connection, tenant_id: i64) -> SyncResult<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM customers WHERE tenant_id = ?1 AND is_system_generic = 1",
            params![tenant_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let now = server_now();
    conn.execute(
        "INSERT INTO customers
            (tenant_id, global_id, origin_terminal_id, server_received_at, updated_at,
             name, is_system_generic)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5, 1)",
        params![
            tenant_id,
            format!("walk-in-{}", Uuid::new_v4()),
            SERVER_ORIGIN,
            now,
            WALK_IN_CUSTOMER_NAME
        ],
    )?;
    let id = conn.last_insert_rowid();
    info!(tenant_id, customer_id = id, "Created walk-in customer");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;
    use crate::policy::set_override;
    use crate::record::ParseContext;
    use serde_json::{json, Value};

    fn ctx() -> ParseContext {
        ParseContext {
            tenant_id: 1,
            branch_id: Some(10),
            terminal_id: Some("T-01".into()),
            max_children: 50,
        }
    }

    fn insert_employee(conn: &Connection, tenant_id: i64, global_id: &str) -> i64 {
        conn.execute(
            "INSERT INTO employees
                (tenant_id, global_id, server_received_at, updated_at, full_name, username)
             VALUES (?1, ?2, 'now', 'now', 'Ana', 'ana')",
            params![tenant_id, global_id],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    fn insert_shift(conn: &Connection, employee_id: i64, global_id: &str) -> i64 {
        conn.execute(
            "INSERT INTO shifts
                (tenant_id, branch_id, global_id, server_received_at, updated_at,
                 employee_id, start_time)
             VALUES (1, 10, ?1, 'now', 'now', ?2, 'now')",
            params![global_id, employee_id],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    fn parse(kind: EntityKind, payload: Value) -> SyncRecord {
        SyncRecord::parse(kind, &payload, &ctx()).unwrap()
    }

    #[test]
    fn resolve_is_consistent_and_tenant_scoped() {
        let conn = test_conn();
        assert_eq!(
            resolve(&conn, EntityKind::Employee, "emp-1", 1).unwrap(),
            Resolution::Unresolved
        );
        let id = insert_employee(&conn, 1, "emp-1");
        for _ in 0..3 {
            assert_eq!(
                resolve(&conn, EntityKind::Employee, "emp-1", 1).unwrap(),
                Resolution::Resolved(id)
            );
        }
        assert_eq!(
            resolve(&conn, EntityKind::Employee, "emp-1", 2).unwrap(),
            Resolution::Unresolved
        );
        assert!(resolve(&conn, EntityKind::Employee, " ", 1).is_err());
    }

    #[test]
    fn fatal_reference_fails_with_its_field() {
        let conn = test_conn();
        let record = parse(
            EntityKind::Expense,
            json!({ "global_id": "exp-1", "amount": 5, "employee_global_id": "emp-404" }),
        );
        let err = bind_references(&conn, 1, &record, &PolicyTable::defaults()).unwrap_err();
        match err {
            SyncError::UnresolvedReference { field, target, global_id } => {
                assert_eq!(field, "employee_global_id");
                assert_eq!(target, "employee");
                assert_eq!(global_id, "emp-404");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn absent_required_reference_is_a_validation_error() {
        let record = parse(EntityKind::Expense, json!({ "global_id": "exp-1", "amount": 5 }));
        let err = check_required_references(&record, &PolicyTable::defaults()).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn walk_in_fallback_is_created_once() {
        let conn = test_conn();
        let emp = insert_employee(&conn, 1, "emp-1");
        insert_shift(&conn, emp, "shift-1");
        let sale = |id: &str, customer: Value| {
            parse(
                EntityKind::Sale,
                json!({
                    "global_id": id,
                    "ticket_number": 1,
                    "total": 10,
                    "employee_global_id": "emp-1",
                    "shift_global_id": "shift-1",
                    "customer_global_id": customer,
                }),
            )
        };
        let policies = PolicyTable::defaults();

        let first = bind_references(&conn, 1, &sale("s-1", Value::Null), &policies).unwrap();
        let second =
            bind_references(&conn, 1, &sale("s-2", json!("cust-missing")), &policies).unwrap();
        let customer = |refs: &[BoundReference]| {
            refs.iter()
                .find(|r| r.spec.field == "customer_global_id")
                .unwrap()
                .binding
        };
        let walk_in = customer(&first).surrogate().unwrap();
        assert_eq!(customer(&first), Binding::Fallback(walk_in));
        assert_eq!(customer(&second), Binding::Fallback(walk_in));

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM customers WHERE tenant_id = 1 AND is_system_generic = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_ne!(walk_in_customer(&conn, 2).unwrap(), walk_in);
    }

    #[test]
    fn detach_and_same_as_fallbacks() {
        let conn = test_conn();
        let emp = insert_employee(&conn, 1, "emp-1");
        insert_shift(&conn, emp, "shift-1");
        conn.execute_batch(
            "INSERT INTO customers (tenant_id, global_id, server_received_at, updated_at, name)
                VALUES (1, 'cust-1', 'now', 'now', 'Luis');
             INSERT INTO sales (tenant_id, branch_id, global_id, server_received_at, updated_at,
                employee_id, shift_id, customer_id, ticket_number, total)
                VALUES (1, 10, 'sale-1', 'now', 'now', 1, 1, 1, 1, 10);",
        )
        .unwrap();
        let note = parse(
            EntityKind::CreditNote,
            json!({
                "global_id": "cn-1",
                "total": 10,
                "sale_global_id": "sale-1",
                "shift_global_id": "shift-1",
                "employee_global_id": "emp-1",
                "authorized_by_global_id": "emp-unknown",
                "customer_global_id": "cust-unknown",
            }),
        );
        let refs = bind_references(&conn, 1, &note, &PolicyTable::defaults()).unwrap();
        let binding = |field: &str| refs.iter().find(|r| r.spec.field == field).unwrap().binding;
        assert_eq!(binding("authorized_by_global_id"), Binding::Fallback(emp));
        assert_eq!(binding("customer_global_id"), Binding::Detached);

        // A tenant can opt into the walk-in customer instead of detaching.
        set_override(&conn, 1, EntityKind::CreditNote, "customer_global_id", PolicyKind::Fallback)
            .unwrap();
        let policies = PolicyTable::load(&conn, 1).unwrap();
        let refs = bind_references(&conn, 1, &note, &policies).unwrap();
        let customer = refs
            .iter()
            .find(|r| r.spec.field == "customer_global_id")
            .unwrap()
            .binding;
        assert!(matches!(customer, Binding::Fallback(_)));
    }
}
