//! Batch sync coordinator.
//!
//! Two atomicity policies:
//! - a single compound submission (header + embedded children) is
//!   all-or-nothing inside one `BEGIN IMMEDIATE` transaction;
//! - a batch of independent records shares one transaction, but each record
//!   runs in its own savepoint, so a failing record is rolled back alone and
//!   the rest still commit.
//!
//! Only infrastructure errors abort a call. Notifications go out after the
//! commit and cannot affect the outcome.

use crate::db::DbPool;
use crate::diagnostics::{self, EntityCounts};
use crate::entities::{EntityKind, PolicyKind};
use crate::error::{SyncError, SyncResult};
use crate::identity::RequestIdentity;
use crate::notify::{Notifier, NotifyError, SyncEvent};
use crate::policy::{self, PolicyTable};
use crate::record::{global_id_hint, ParseContext, SyncRecord};
use crate::resolver::{bind_references, check_required_references};
use crate::upsert::{self, server_now, Applied, UpsertOutcome};
use crate::verifier::{self, VerifyReport};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-call bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLimits {
    pub max_batch: usize,
    pub max_children: usize,
    pub verify_max_ids: usize,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            max_batch: 200,
            max_children: 500,
            verify_max_ids: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Applied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildResult {
    pub global_id: String,
    pub surrogate_id: i64,
    pub outcome: UpsertOutcome,
}

/// Outcome of one submitted record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub global_id: Option<String>,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surrogate_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<UpsertOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildResult>,
}

impl RecordResult {
    fn applied(global_id: &str, compound: CompoundApplied) -> Self {
        Self {
            index: None,
            global_id: Some(global_id.to_string()),
            status: RecordStatus::Applied,
            surrogate_id: Some(compound.header.surrogate_id),
            outcome: Some(compound.header.outcome),
            code: None,
            reason: None,
            children: compound.children,
        }
    }

    fn failed(global_id: Option<String>, err: &SyncError) -> Self {
        Self {
            index: None,
            global_id,
            status: RecordStatus::Failed,
            surrogate_id: None,
            outcome: None,
            code: Some(err.code()),
            reason: Some(err.client_message()),
            children: Vec::new(),
        }
    }

    fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn is_applied(&self) -> bool {
        self.status == RecordStatus::Applied
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub results: Vec<RecordResult>,
    pub applied: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct CompoundApplied {
    header: Applied,
    children: Vec<ChildResult>,
}

/// Entry point for every sync operation.
pub struct SyncEngine {
    db: Arc<DbPool>,
    notifier: Arc<dyn Notifier>,
    limits: SyncLimits,
}

impl SyncEngine {
    pub fn new(db: Arc<DbPool>, notifier: Arc<dyn Notifier>, limits: SyncLimits) -> Self {
        Self {
            db,
            notifier,
            limits,
        }
    }

    fn parse_context(&self, identity: &RequestIdentity) -> ParseContext {
        ParseContext {
            tenant_id: identity.tenant_id,
            branch_id: identity.branch_id,
            terminal_id: identity.terminal_id.clone(),
            max_children: self.limits.max_children,
        }
    }

    /// Single compound submission: header and children commit together or
    /// not at all.
    pub fn sync_one(
        &self,
        identity: &RequestIdentity,
        kind: EntityKind,
        payload: &Value,
    ) -> SyncResult<RecordResult> {
        ensure_header_kind(kind)?;
        let tenant_id = identity.tenant_id;
        let record = match SyncRecord::parse(kind, payload, &self.parse_context(identity)) {
            Ok(record) => record,
            Err(err) => return self.record_failure(kind, global_id_hint(payload), err),
        };

        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let policies = PolicyTable::load(&tx, tenant_id)?;

        match apply_compound(&tx, tenant_id, &record, &policies) {
            Ok(compound) => {
                tx.commit()?;
                drop(conn);
                log_applied(tenant_id, &record, &compound);
                self.notify_applied(tenant_id, &record, &compound.header);
                Ok(RecordResult::applied(&record.global_id, compound))
            }
            Err(err) => {
                drop(tx);
                self.record_failure(kind, Some(record.global_id.clone()), err)
            }
        }
    }

    /// Batch of independent records of one kind. Each record (with its own
    /// children) is isolated in a savepoint; failures are reported at their
    /// index and processing continues.
    pub fn sync_batch(
        &self,
        identity: &RequestIdentity,
        kind: EntityKind,
        payloads: &[Value],
    ) -> SyncResult<BatchReport> {
        ensure_header_kind(kind)?;
        if payloads.is_empty() {
            return Err(SyncError::Validation("batch has no records".into()));
        }
        if payloads.len() > self.limits.max_batch {
            return Err(SyncError::Validation(format!(
                "batch exceeds {} records",
                self.limits.max_batch
            )));
        }

        let started = Instant::now();
        let tenant_id = identity.tenant_id;
        let ctx = self.parse_context(identity);
        let parsed: Vec<SyncResult<SyncRecord>> = payloads
            .iter()
            .map(|payload| SyncRecord::parse(kind, payload, &ctx))
            .collect();

        let mut results: Vec<RecordResult> = Vec::with_capacity(payloads.len());
        let mut committed: Vec<(&SyncRecord, Applied)> = Vec::new();
        {
            let mut conn = self.db.get()?;
            let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let policies = PolicyTable::load(&tx, tenant_id)?;

            for (index, (payload, outcome)) in payloads.iter().zip(&parsed).enumerate() {
                let record = match outcome {
                    Ok(record) => record,
                    Err(err) => {
                        let failure = RecordResult::failed(global_id_hint(payload), err);
                        log_failure(kind, failure.global_id.as_deref(), err);
                        results.push(failure.at(index));
                        continue;
                    }
                };

                let sp = tx.savepoint()?;
                match apply_compound(&sp, tenant_id, record, &policies) {
                    Ok(compound) => {
                        sp.commit()?;
                        log_applied(tenant_id, record, &compound);
                        committed.push((record, compound.header));
                        results.push(RecordResult::applied(&record.global_id, compound).at(index));
                    }
                    Err(err) if err.is_record_level() => {
                        drop(sp);
                        log_failure(kind, Some(&record.global_id), &err);
                        results.push(
                            RecordResult::failed(Some(record.global_id.clone()), &err).at(index),
                        );
                    }
                    Err(err) => {
                        error!(kind = %kind, tenant_id, "Batch aborted: {err}");
                        return Err(err);
                    }
                }
            }

            tx.commit()?;
        }

        for (record, applied) in &committed {
            self.notify_applied(tenant_id, record, applied);
        }

        let applied = results.iter().filter(|r| r.is_applied()).count();
        let failed = results.len() - applied;
        info!(
            kind = %kind,
            tenant_id,
            applied,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch sync complete"
        );
        Ok(BatchReport {
            results,
            applied,
            failed,
        })
    }

    /// Tombstone a header record (and its children).
    pub fn soft_delete(
        &self,
        identity: &RequestIdentity,
        kind: EntityKind,
        global_id: &str,
    ) -> SyncResult<RecordResult> {
        ensure_header_kind(kind)?;
        if !crate::record::is_well_formed_id(global_id) {
            return Err(SyncError::Validation(format!("{kind}: malformed global_id")));
        }
        let tenant_id = identity.tenant_id;

        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match upsert::tombstone(&tx, tenant_id, kind, global_id) {
            Ok(applied) => {
                tx.commit()?;
                info!(kind = %kind, global_id, tenant_id, outcome = ?applied.outcome, "Soft-deleted record");
                Ok(RecordResult::applied(
                    global_id,
                    CompoundApplied {
                        header: applied,
                        children: Vec::new(),
                    },
                ))
            }
            Err(err) => {
                drop(tx);
                self.record_failure(kind, Some(global_id.to_string()), err)
            }
        }
    }

    /// Which of the caller's "synced" ids exist server-side.
    pub fn verify(
        &self,
        identity: &RequestIdentity,
        branch_id: Option<i64>,
        entities: &Map<String, Value>,
    ) -> SyncResult<VerifyReport> {
        let conn = self.db.get()?;
        verifier::verify(
            &conn,
            identity.tenant_id,
            branch_id.or(identity.branch_id),
            entities,
            self.limits.verify_max_ids,
        )
    }

    pub fn entity_counts(
        &self,
        identity: &RequestIdentity,
        branch_id: Option<i64>,
    ) -> SyncResult<EntityCounts> {
        let conn = self.db.get()?;
        diagnostics::entity_counts(&conn, identity.tenant_id, branch_id.or(identity.branch_id))
    }

    /// Store a tenant override of a reference policy.
    pub fn set_reference_policy(
        &self,
        identity: &RequestIdentity,
        kind: EntityKind,
        field: &str,
        policy: PolicyKind,
    ) -> SyncResult<()> {
        let conn = self.db.get()?;
        policy::set_override(&conn, identity.tenant_id, kind, field, policy)?;
        info!(tenant_id = identity.tenant_id, kind = %kind, field, policy = policy.as_str(), "Reference policy overridden");
        Ok(())
    }

    /// Drop a tenant override; the catalogue default applies again.
    pub fn clear_reference_policy(
        &self,
        identity: &RequestIdentity,
        kind: EntityKind,
        field: &str,
    ) -> SyncResult<bool> {
        let conn = self.db.get()?;
        let removed = policy::clear_override(&conn, identity.tenant_id, kind, field)?;
        if removed {
            info!(tenant_id = identity.tenant_id, kind = %kind, field, "Reference policy override cleared");
        }
        Ok(removed)
    }

    /// Record-level errors become a failed result; anything else propagates.
    fn record_failure(
        &self,
        kind: EntityKind,
        global_id: Option<String>,
        err: SyncError,
    ) -> SyncResult<RecordResult> {
        if !err.is_record_level() {
            error!(kind = %kind, "Sync call aborted: {err}");
            return Err(err);
        }
        log_failure(kind, global_id.as_deref(), &err);
        Ok(RecordResult::failed(global_id, &err))
    }

    fn notify_applied(&self, tenant_id: i64, record: &SyncRecord, applied: &Applied) {
        if !record.kind.descriptor().notify || applied.outcome == UpsertOutcome::Unchanged {
            return;
        }
        let event = SyncEvent {
            kind: record.kind,
            tenant_id,
            branch_id: record.branch_id,
            global_id: record.global_id.clone(),
            surrogate_id: applied.surrogate_id,
            outcome: applied.outcome,
            origin_terminal_id: record.origin_terminal_id.clone(),
            at: server_now(),
        };
        match self.notifier.notify(&event) {
            Ok(()) => {}
            Err(NotifyError::NoSubscribers) => {
                debug!(kind = %record.kind, global_id = %record.global_id, "No notification subscribers");
            }
            Err(err) => {
                warn!(kind = %record.kind, global_id = %record.global_id, "Notification failed: {err}");
            }
        }
    }
}

fn ensure_header_kind(kind: EntityKind) -> SyncResult<()> {
    if kind.is_child() {
        return Err(SyncError::Validation(format!(
            "{kind} records are synced inside their header"
        )));
    }
    Ok(())
}

/// Header first, then each child against the header's surrogate key.
fn apply_compound(
    conn: &Connection,
    tenant_id: i64,
    record: &SyncRecord,
    policies: &PolicyTable,
) -> SyncResult<CompoundApplied> {
    check_required_references(record, policies)?;

    let refs = bind_references(conn, tenant_id, record, policies)?;
    let header = upsert::apply(conn, tenant_id, record, &refs, None)?;

    let mut children = Vec::with_capacity(record.children.len());
    for child in &record.children {
        let child_refs = bind_references(conn, tenant_id, child, policies)?;
        let applied = upsert::apply(conn, tenant_id, child, &child_refs, Some(header.surrogate_id))?;
        children.push(ChildResult {
            global_id: child.global_id.clone(),
            surrogate_id: applied.surrogate_id,
            outcome: applied.outcome,
        });
    }
    // A deleted header never keeps live children, including ones sent with it.
    if record.is_deleted == Some(true) {
        upsert::cascade_tombstone(conn, record.kind.descriptor(), header.surrogate_id, &server_now())?;
    }

    Ok(CompoundApplied { header, children })
}

fn log_applied(tenant_id: i64, record: &SyncRecord, compound: &CompoundApplied) {
    info!(
        kind = %record.kind,
        global_id = %record.global_id,
        tenant_id,
        terminal = %record.origin_terminal_id,
        surrogate_id = compound.header.surrogate_id,
        outcome = ?compound.header.outcome,
        children = compound.children.len(),
        "Record synced"
    );
}

fn log_failure(kind: EntityKind, global_id: Option<&str>, err: &SyncError) {
    warn!(
        kind = %kind,
        global_id = global_id.unwrap_or("-"),
        code = err.code(),
        "Record rejected: {err}"
    );
}
