//! Reconciliation verifier.
//!
//! Terminals send the global ids they hold as "synced"; the verifier reports
//! which of them actually exist. Read-only. Unknown kinds are skipped without
//! being echoed, malformed ids are dropped and counted, and each kind's list
//! is deduplicated and truncated before any query runs.

use crate::entities::{EntityKind, Scope};
use crate::error::SyncResult;
use crate::record::is_well_formed_id;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// SQLite host-parameter budget per IN (...) query.
const QUERY_CHUNK: usize = 400;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindReport {
    /// Distinct well-formed ids checked.
    pub sent: usize,
    pub found: usize,
    /// Checked ids with no server row, in request order.
    pub missing: Vec<String>,
    /// Entries dropped as malformed or over the per-kind limit.
    #[serde(skip_serializing_if = "is_zero")]
    pub rejected: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

pub type VerifyReport = BTreeMap<EntityKind, KindReport>;

/// Check `entities` (`{kind: [global_id, ...]}`) against the store.
///
/// `branch_id` narrows branch-scoped kinds; tenant-scoped kinds always
/// check the whole tenant. Soft-deleted rows count as found.
pub fn verify(
    conn: &Connection,
    tenant_id: i64,
    branch_id: Option<i64>,
    entities: &Map<String, Value>,
    max_ids: usize,
) -> SyncResult<VerifyReport> {
    let mut report = VerifyReport::new();
    let mut ignored_kinds = 0usize;

    for (raw_kind, raw_ids) in entities {
        let Some(kind) = EntityKind::parse(raw_kind) else {
            ignored_kinds += 1;
            continue;
        };
        let (ids, rejected) = sanitize_ids(raw_ids, max_ids);
        let found = existing_ids(conn, kind, tenant_id, branch_id, &ids)?;

        let entry = KindReport {
            sent: ids.len(),
            found: found.len(),
            missing: ids.into_iter().filter(|id| !found.contains(id)).collect(),
            rejected,
        };
        debug!(
            kind = %kind,
            tenant_id,
            sent = entry.sent,
            missing = entry.missing.len(),
            "Verified sync state"
        );
        report.insert(kind, entry);
    }

    if ignored_kinds > 0 {
        debug!(tenant_id, ignored_kinds, "Verification skipped unknown kinds");
    }
    Ok(report)
}

/// Deduplicate (keeping first occurrence), drop malformed entries, truncate.
fn sanitize_ids(raw: &Value, max_ids: usize) -> (Vec<String>, usize) {
    let Some(items) = raw.as_array() else {
        return (Vec::new(), 0);
    };
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut rejected = 0usize;
    for item in items {
        match item.as_str().map(str::trim) {
            Some(id) if is_well_formed_id(id) => {
                if !seen.insert(id) {
                    continue;
                }
                if ids.len() < max_ids {
                    ids.push(id.to_string());
                } else {
                    rejected += 1;
                }
            }
            _ => rejected += 1,
        }
    }
    (ids, rejected)
}

fn existing_ids(
    conn: &Connection,
    kind: EntityKind,
    tenant_id: i64,
    branch_id: Option<i64>,
    ids: &[String],
) -> SyncResult<HashSet<String>> {
    let desc = kind.descriptor();
    let branch_filter = match (desc.scope, branch_id) {
        (Scope::Branch, Some(branch)) => Some(branch),
        _ => None,
    };

    let mut found = HashSet::new();
    for chunk in ids.chunks(QUERY_CHUNK) {
        let mut params: Vec<SqlValue> = vec![SqlValue::Integer(tenant_id)];
        let mut sql = format!("SELECT global_id FROM {} WHERE tenant_id = ?1", desc.table);
        if let Some(branch) = branch_filter {
            params.push(SqlValue::Integer(branch));
            sql.push_str(" AND branch_id = ?2");
        }
        let first = params.len() + 1;
        let placeholders = (first..first + chunk.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND global_id IN ({placeholders})"));
        params.extend(chunk.iter().cloned().map(SqlValue::Text));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?;
        for row in rows {
            found.insert(row?);
        }
    }
    Ok(found)
}
