//! Sync envelope parsing and validation.
//!
//! Terminals send loosely typed JSON (snake_case or camelCase keys, numbers
//! sometimes as strings, booleans as 0/1). Everything is normalised here into
//! a typed [`SyncRecord`] before any reference resolution or persistence, so
//! a malformed record never reaches the store.

use crate::entities::{
    camel_case, EntityKind, FieldSpec, FieldType, ReferenceSpec, Scope,
};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};
use std::collections::HashSet;

pub const MAX_ID_LEN: usize = 64;
const MAX_TEXT_LEN: usize = 4096;

/// Request-level facts every record in the call shares.
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub tenant_id: i64,
    /// Branch bound to the authenticated terminal, if any.
    pub branch_id: Option<i64>,
    pub terminal_id: Option<String>,
    pub max_children: usize,
}

/// A foreign reference as sent by the terminal.
#[derive(Debug, Clone)]
pub struct RefValue {
    pub spec: &'static ReferenceSpec,
    /// `None` when the key was absent or null.
    pub global_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub kind: EntityKind,
    pub global_id: String,
    pub branch_id: Option<i64>,
    pub origin_terminal_id: String,
    pub local_sequence: Option<i64>,
    pub local_created_at: Option<String>,
    pub is_deleted: Option<bool>,
    /// Only the fields present in the payload, in catalogue order. An explicit
    /// null is kept as `SqlValue::Null`.
    pub fields: Vec<(&'static FieldSpec, SqlValue)>,
    /// Every declared reference, present or not, in catalogue order.
    pub references: Vec<RefValue>,
    pub children: Vec<SyncRecord>,
}

impl SyncRecord {
    pub fn parse(kind: EntityKind, payload: &Value, ctx: &ParseContext) -> SyncResult<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| SyncError::Validation(format!("{kind} record must be an object")))?;
        let record = parse_object(kind, obj, ctx, None)?;
        Ok(record)
    }

    pub fn reference(&self, field: &str) -> Option<&RefValue> {
        self.references.iter().find(|r| r.spec.field == field)
    }

    pub fn field(&self, name: &str) -> Option<&SqlValue> {
        self.fields
            .iter()
            .find(|(spec, _)| spec.name == name)
            .map(|(_, v)| v)
    }
}

/// Global identifiers: 1..=64 chars of `[A-Za-z0-9._:-]`.
pub fn is_well_formed_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_ID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'))
}

/// The payload's global id when it is safe to echo back in a failure.
pub fn global_id_hint(payload: &Value) -> Option<String> {
    let obj = payload.as_object()?;
    let raw = lookup(obj, "global_id")?.as_str()?.trim();
    is_well_formed_id(raw).then(|| raw.to_string())
}

/// Look a key up by its snake_case name, then its camelCase spelling.
/// A null value counts as absent.
pub(crate) fn lookup<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    lookup_present(obj, name).filter(|v| !v.is_null())
}

/// Like [`lookup`], but keeps an explicit null.
fn lookup_present<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    obj.get(name).or_else(|| obj.get(&camel_case(name)))
}

fn lookup_any<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| lookup(obj, name))
}

fn parse_object(
    kind: EntityKind,
    obj: &Map<String, Value>,
    ctx: &ParseContext,
    parent: Option<&SyncRecord>,
) -> SyncResult<SyncRecord> {
    let desc = kind.descriptor();

    let global_id = match lookup(obj, "global_id") {
        Some(Value::String(s)) if is_well_formed_id(s.trim()) => s.trim().to_string(),
        Some(_) => {
            return Err(SyncError::Validation(format!("{kind}: malformed global_id")));
        }
        None => return Err(SyncError::Validation(format!("{kind}: missing global_id"))),
    };
    let invalid = |what: &str| SyncError::Validation(format!("{kind} {global_id}: {what}"));

    if let Some(tenant) = lookup(obj, "tenant_id") {
        if as_i64(tenant) != Some(ctx.tenant_id) {
            return Err(invalid("tenant_id does not match the authenticated tenant"));
        }
    }

    let branch_id = match parent {
        Some(header) => {
            if let Some(raw) = lookup(obj, "branch_id") {
                if as_i64(raw) != header.branch_id {
                    return Err(invalid("child branch_id differs from its header"));
                }
            }
            header.branch_id
        }
        None => {
            let sent = match lookup(obj, "branch_id") {
                Some(raw) => Some(as_i64(raw).ok_or_else(|| invalid("malformed branch_id"))?),
                None => None,
            };
            if let (Some(sent), Some(bound)) = (sent, ctx.branch_id) {
                if sent != bound {
                    return Err(invalid("branch_id does not match the authenticated branch"));
                }
            }
            sent.or(ctx.branch_id)
        }
    };
    if desc.scope == Scope::Branch && branch_id.is_none() {
        return Err(invalid("branch_id is required"));
    }

    let origin_terminal_id = match lookup_any(obj, &["terminal_id", "origin_terminal_id"]) {
        Some(Value::String(s)) if is_well_formed_id(s.trim()) => s.trim().to_string(),
        Some(_) => return Err(invalid("malformed terminal_id")),
        None => match (parent, &ctx.terminal_id) {
            (Some(header), _) => header.origin_terminal_id.clone(),
            (None, Some(bound)) => bound.clone(),
            (None, None) => return Err(invalid("terminal_id is required")),
        },
    };

    let local_sequence = match lookup_any(obj, &["local_sequence", "local_op_seq"]) {
        Some(raw) => match as_i64(raw) {
            Some(seq) if seq >= 0 => Some(seq),
            _ => return Err(invalid("malformed local_sequence")),
        },
        None => None,
    };

    let local_created_at = match lookup_any(obj, &["local_created_at", "created_local_utc"]) {
        Some(raw) => Some(
            normalize_timestamp(raw).ok_or_else(|| invalid("malformed local_created_at"))?,
        ),
        None => None,
    };

    let is_deleted = match lookup(obj, "is_deleted") {
        Some(raw) => Some(as_bool(raw).ok_or_else(|| invalid("malformed is_deleted"))?),
        None => None,
    };

    let mut fields = Vec::with_capacity(desc.fields.len());
    for spec in desc.fields {
        match lookup_present(obj, spec.name) {
            None | Some(Value::Null) if spec.required => {
                return Err(invalid(&format!("missing {}", spec.name)));
            }
            // Explicit null clears the stored value.
            Some(Value::Null) => fields.push((spec, SqlValue::Null)),
            Some(raw) => {
                let value = convert(spec.ty, raw)
                    .ok_or_else(|| invalid(&format!("malformed {}", spec.name)))?;
                fields.push((spec, value));
            }
            None => {}
        }
    }

    let mut references = Vec::with_capacity(desc.references.len());
    for spec in desc.references {
        let global = match lookup(obj, spec.field) {
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) if is_well_formed_id(s.trim()) => Some(s.trim().to_string()),
            Some(_) => return Err(invalid(&format!("malformed {}", spec.field))),
            None => None,
        };
        references.push(RefValue {
            spec,
            global_id: global,
        });
    }

    let mut record = SyncRecord {
        kind,
        global_id,
        branch_id,
        origin_terminal_id,
        local_sequence,
        local_created_at,
        is_deleted,
        fields,
        references,
        children: Vec::new(),
    };

    if let Some(child_spec) = &desc.children {
        let items: &[Value] = match lookup(obj, child_spec.key) {
            Some(Value::Array(items)) => items.as_slice(),
            Some(_) => {
                return Err(SyncError::Validation(format!(
                    "{kind} {}: {} must be an array",
                    record.global_id, child_spec.key
                )))
            }
            None => &[],
        };
        if items.len() > ctx.max_children {
            return Err(SyncError::Validation(format!(
                "{kind} {}: more than {} {}",
                record.global_id, ctx.max_children, child_spec.key
            )));
        }
        let mut seen = HashSet::with_capacity(items.len() + 1);
        seen.insert(record.global_id.clone());
        let mut children = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let item_obj = item.as_object().ok_or_else(|| {
                SyncError::Validation(format!(
                    "{kind} {}: {}[{index}] must be an object",
                    record.global_id, child_spec.key
                ))
            })?;
            let child = parse_object(child_spec.kind, item_obj, ctx, Some(&record))?;
            if !seen.insert(child.global_id.clone()) {
                return Err(SyncError::Validation(format!(
                    "{kind} {}: duplicate global_id {} in {}",
                    record.global_id, child.global_id, child_spec.key
                )));
            }
            children.push(child);
        }
        record.children = children;
    }

    Ok(record)
}

// ---------------------------------------------------------------------------
// Scalar conversion
// ---------------------------------------------------------------------------

fn convert(ty: FieldType, raw: &Value) -> Option<SqlValue> {
    match ty {
        FieldType::Text => match raw {
            Value::String(s) if s.chars().count() <= MAX_TEXT_LEN => Some(SqlValue::Text(s.clone())),
            Value::Number(n) => Some(SqlValue::Text(n.to_string())),
            _ => None,
        },
        FieldType::Integer => as_i64(raw).map(SqlValue::Integer),
        FieldType::Real => as_f64(raw).map(SqlValue::Real),
        FieldType::Bool => as_bool(raw).map(|b| SqlValue::Integer(i64::from(b))),
        FieldType::Timestamp => normalize_timestamp(raw).map(SqlValue::Text),
        FieldType::Date => raw
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
            .map(|d| SqlValue::Text(d.format("%Y-%m-%d").to_string())),
    }
}

pub(crate) fn as_i64(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn as_f64(raw: &Value) -> Option<f64> {
    let n = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn as_bool(raw: &Value) -> Option<bool> {
    match raw {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// RFC 3339, or SQLite's `YYYY-MM-DD HH:MM:SS` read as UTC. Stored as
/// millisecond-precision UTC.
fn normalize_timestamp(raw: &Value) -> Option<String> {
    let s = raw.as_str()?.trim();
    let utc = match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(_) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .ok()?
            .and_utc(),
    };
    Some(utc.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ParseContext {
        ParseContext {
            tenant_id: 7,
            branch_id: Some(3),
            terminal_id: Some("T-01".into()),
            max_children: 2,
        }
    }

    fn sale() -> Value {
        json!({
            "global_id": "sale-1",
            "localOpSeq": 12,
            "createdLocalUtc": "2026-03-01T10:00:00-05:00",
            "ticketNumber": "41",
            "total": 120.5,
            "employee_global_id": "emp-1",
            "shiftGlobalId": "shift-1",
            "items": [
                { "global_id": "item-1", "quantity": 1, "unit_price": 100, "line_total": 100 },
                { "global_id": "item-2", "quantity": "2", "unit_price": 10.25, "line_total": 20.5 }
            ]
        })
    }

    #[test]
    fn id_grammar() {
        assert!(is_well_formed_id("sale-1"));
        assert!(is_well_formed_id("T01:000042.a_b"));
        assert!(!is_well_formed_id(""));
        assert!(!is_well_formed_id("has space"));
        assert!(!is_well_formed_id("'; DROP TABLE sales; --"));
        assert!(!is_well_formed_id(&"x".repeat(65)));
    }

    #[test]
    fn parses_aliases_and_children() {
        let record = SyncRecord::parse(EntityKind::Sale, &sale(), &ctx()).unwrap();
        assert_eq!(record.global_id, "sale-1");
        assert_eq!(record.branch_id, Some(3));
        assert_eq!(record.origin_terminal_id, "T-01");
        assert_eq!(record.local_sequence, Some(12));
        assert_eq!(
            record.local_created_at.as_deref(),
            Some("2026-03-01T15:00:00.000Z")
        );
        assert_eq!(record.field("ticket_number"), Some(&SqlValue::Integer(41)));
        assert_eq!(
            record.reference("shift_global_id").unwrap().global_id.as_deref(),
            Some("shift-1")
        );
        assert!(record.reference("customer_global_id").unwrap().global_id.is_none());
        assert_eq!(record.children.len(), 2);
        assert_eq!(record.children[1].field("quantity"), Some(&SqlValue::Real(2.0)));
        assert_eq!(record.children[1].branch_id, Some(3));
    }

    #[test]
    fn rejects_malformed_numeric() {
        let mut payload = json!({
            "global_id": "can-2",
            "quantity": "two",
            "employee_global_id": "emp-1",
            "shift_global_id": "shift-1"
        });
        let err = SyncRecord::parse(EntityKind::Cancellation, &payload, &ctx()).unwrap_err();
        assert!(matches!(err, SyncError::Validation(ref m) if m.contains("quantity")));

        payload["quantity"] = json!(2);
        assert!(SyncRecord::parse(EntityKind::Cancellation, &payload, &ctx()).is_ok());
    }

    #[test]
    fn rejects_missing_required_and_bad_ids() {
        let mut payload = sale();
        payload.as_object_mut().unwrap().remove("total");
        assert!(SyncRecord::parse(EntityKind::Sale, &payload, &ctx()).is_err());

        let mut payload = sale();
        payload["global_id"] = json!("bad id");
        assert!(SyncRecord::parse(EntityKind::Sale, &payload, &ctx()).is_err());
        assert_eq!(global_id_hint(&payload), None);

        let mut payload = sale();
        payload["employee_global_id"] = json!(42);
        assert!(SyncRecord::parse(EntityKind::Sale, &payload, &ctx()).is_err());
    }

    #[test]
    fn explicit_null_is_kept_for_optional_fields_only() {
        let mut payload = sale();
        payload["notes"] = Value::Null;
        let record = SyncRecord::parse(EntityKind::Sale, &payload, &ctx()).unwrap();
        assert_eq!(record.field("notes"), Some(&SqlValue::Null));
        assert_eq!(record.field("settled_at"), None);

        let mut payload = sale();
        payload["total"] = Value::Null;
        let err = SyncRecord::parse(EntityKind::Sale, &payload, &ctx()).unwrap_err();
        assert!(err.to_string().contains("missing total"), "{err}");
    }

    #[test]
    fn rejects_foreign_tenant_and_branch() {
        let mut payload = sale();
        payload["tenant_id"] = json!(8);
        assert!(SyncRecord::parse(EntityKind::Sale, &payload, &ctx()).is_err());

        let mut payload = sale();
        payload["branch_id"] = json!(4);
        assert!(SyncRecord::parse(EntityKind::Sale, &payload, &ctx()).is_err());

        let unbound = ParseContext {
            branch_id: None,
            ..ctx()
        };
        assert!(SyncRecord::parse(EntityKind::Sale, &sale(), &unbound).is_err());
        // Tenant-scoped kinds do not need a branch.
        let employee = json!({ "global_id": "emp-1", "full_name": "Ana", "username": "ana" });
        assert!(SyncRecord::parse(EntityKind::Employee, &employee, &unbound).is_ok());
    }

    #[test]
    fn rejects_duplicate_and_excess_children() {
        let mut payload = sale();
        payload["items"][1]["global_id"] = json!("item-1");
        let err = SyncRecord::parse(EntityKind::Sale, &payload, &ctx()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));

        let mut payload = sale();
        payload["items"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "global_id": "item-3", "quantity": 1, "unit_price": 1, "line_total": 1 }));
        assert!(SyncRecord::parse(EntityKind::Sale, &payload, &ctx()).is_err());
    }

    #[test]
    fn scalar_coercions() {
        assert_eq!(as_bool(&json!(1)), Some(true));
        assert_eq!(as_bool(&json!("false")), Some(false));
        assert_eq!(as_bool(&json!(2)), None);
        assert_eq!(as_i64(&json!(3.0)), Some(3));
        assert_eq!(as_i64(&json!(3.5)), None);
        assert_eq!(
            normalize_timestamp(&json!("2026-01-02 03:04:05")).as_deref(),
            Some("2026-01-02T03:04:05.000Z")
        );
        assert_eq!(normalize_timestamp(&json!("yesterday")), None);
        assert_eq!(
            convert(FieldType::Date, &json!("2026-02-30")),
            None
        );
    }
}
