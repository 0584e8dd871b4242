//! Reference policy table.
//!
//! Defaults come from the entity catalogue. Tenants may override the policy
//! of any (kind, field) pair through `reference_policies`; overrides are read
//! on every call, there is no in-process cache.

use crate::entities::{EntityKind, PolicyKind, ReferenceSpec};
use crate::error::{SyncError, SyncResult};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Default, Clone)]
pub struct PolicyTable {
    overrides: HashMap<(EntityKind, &'static str), PolicyKind>,
}

impl PolicyTable {
    /// Catalogue defaults only.
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Defaults plus the tenant's stored overrides. Rows naming an unknown
    /// kind or field, an unknown policy, or a policy the column cannot
    /// honour are skipped with a warning.
    pub fn load(conn: &Connection, tenant_id: i64) -> SyncResult<Self> {
        let mut stmt = conn.prepare(
            "SELECT entity_kind, field, policy FROM reference_policies WHERE tenant_id = ?1",
        )?;
        let rows = stmt.query_map(params![tenant_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut table = Self::default();
        for row in rows {
            let (kind_raw, field, policy_raw) = row?;
            let resolved = EntityKind::parse(&kind_raw).and_then(|kind| {
                let spec = kind.descriptor().reference(&field)?;
                let policy = PolicyKind::parse(&policy_raw)?;
                Some((kind, spec, policy))
            });
            match resolved {
                Some((kind, spec, policy)) if is_applicable(spec, policy) => {
                    table.overrides.insert((kind, spec.field), policy);
                }
                _ => warn!(tenant_id, "Ignoring invalid reference policy override"),
            }
        }
        Ok(table)
    }

    pub fn policy_for(&self, kind: EntityKind, spec: &ReferenceSpec) -> PolicyKind {
        self.overrides
            .get(&(kind, spec.field))
            .copied()
            .unwrap_or(spec.policy)
    }
}

/// Detach needs a nullable column; fallback needs a declared fallback.
pub fn is_applicable(spec: &ReferenceSpec, policy: PolicyKind) -> bool {
    match policy {
        PolicyKind::Fatal => true,
        PolicyKind::Detach => spec.nullable,
        PolicyKind::Fallback => spec.fallback.is_some(),
    }
}

/// Store a tenant override. Rejects combinations the column cannot honour.
pub fn set_override(
    conn: &Connection,
    tenant_id: i64,
    kind: EntityKind,
    field: &str,
    policy: PolicyKind,
) -> SyncResult<()> {
    let spec = kind.descriptor().reference(field).ok_or_else(|| {
        SyncError::Validation(format!("{kind} has no such reference field"))
    })?;
    if !is_applicable(spec, policy) {
        return Err(SyncError::Validation(format!(
            "{} cannot use policy {} for {kind}",
            spec.field,
            policy.as_str()
        )));
    }
    conn.execute(
        "INSERT INTO reference_policies (tenant_id, entity_kind, field, policy, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(tenant_id, entity_kind, field) DO UPDATE SET
            policy = excluded.policy,
            updated_at = excluded.updated_at",
        params![tenant_id, kind.as_str(), spec.field, policy.as_str()],
    )?;
    Ok(())
}

/// Drop a tenant override, restoring the catalogue default.
pub fn clear_override(
    conn: &Connection,
    tenant_id: i64,
    kind: EntityKind,
    field: &str,
) -> SyncResult<bool> {
    let removed = conn.execute(
        "DELETE FROM reference_policies WHERE tenant_id = ?1 AND entity_kind = ?2 AND field = ?3",
        params![tenant_id, kind.as_str(), field],
    )?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    fn spec(kind: EntityKind, field: &str) -> &'static ReferenceSpec {
        kind.descriptor().reference(field).unwrap()
    }

    #[test]
    fn defaults_come_from_catalogue() {
        let table = PolicyTable::defaults();
        assert_eq!(
            table.policy_for(EntityKind::Sale, spec(EntityKind::Sale, "employee_global_id")),
            PolicyKind::Fatal
        );
        assert_eq!(
            table.policy_for(EntityKind::Sale, spec(EntityKind::Sale, "customer_global_id")),
            PolicyKind::Fallback
        );
    }

    #[test]
    fn override_is_tenant_scoped() {
        let conn = test_conn();
        set_override(
            &conn,
            1,
            EntityKind::CreditNote,
            "customer_global_id",
            PolicyKind::Fallback,
        )
        .unwrap();

        let customer = spec(EntityKind::CreditNote, "customer_global_id");
        let tenant_1 = PolicyTable::load(&conn, 1).unwrap();
        let tenant_2 = PolicyTable::load(&conn, 2).unwrap();
        assert_eq!(tenant_1.policy_for(EntityKind::CreditNote, customer), PolicyKind::Fallback);
        assert_eq!(tenant_2.policy_for(EntityKind::CreditNote, customer), PolicyKind::Detach);

        assert!(clear_override(&conn, 1, EntityKind::CreditNote, "customer_global_id").unwrap());
        let tenant_1 = PolicyTable::load(&conn, 1).unwrap();
        assert_eq!(tenant_1.policy_for(EntityKind::CreditNote, customer), PolicyKind::Detach);
    }

    #[test]
    fn rejects_inapplicable_override() {
        let conn = test_conn();
        // employee_id on sales is NOT NULL.
        let err = set_override(&conn, 1, EntityKind::Sale, "employee_global_id", PolicyKind::Detach)
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        // No fallback source declared for shifts.
        assert!(set_override(&conn, 1, EntityKind::Sale, "shift_global_id", PolicyKind::Fallback).is_err());
        assert!(set_override(&conn, 1, EntityKind::Sale, "nope_global_id", PolicyKind::Fatal).is_err());
    }

    #[test]
    fn invalid_stored_rows_are_ignored() {
        let conn = test_conn();
        conn.execute_batch(
            "INSERT INTO reference_policies (tenant_id, entity_kind, field, policy)
             VALUES (1, 'sale', 'employee_global_id', 'detach'),
                    (1, 'sale', 'driver_shift_global_id', 'sometimes'),
                    (1, 'unknown', 'x', 'fatal'),
                    (1, 'sale', 'driver_global_id', 'fatal');",
        )
        .unwrap();
        let table = PolicyTable::load(&conn, 1).unwrap();
        assert_eq!(
            table.policy_for(EntityKind::Sale, spec(EntityKind::Sale, "employee_global_id")),
            PolicyKind::Fatal
        );
        assert_eq!(
            table.policy_for(EntityKind::Sale, spec(EntityKind::Sale, "driver_shift_global_id")),
            PolicyKind::Detach
        );
        assert_eq!(
            table.policy_for(EntityKind::Sale, spec(EntityKind::Sale, "driver_global_id")),
            PolicyKind::Fatal
        );
    }
}
