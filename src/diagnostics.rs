//! Diagnostics for the sync server.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Entity counts**: live rows per kind, compared by terminals against
//!   their local counts to spot drift
//! - **Log retention**: used by `lib.rs` before the rolling appender starts

use crate::entities::{EntityKind, Scope};
use crate::error::SyncResult;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 14;

/// File prefix of the daily rolling log.
pub const LOG_FILE_PREFIX: &str = "sync";

pub type EntityCounts = BTreeMap<EntityKind, i64>;

#[derive(Debug, Clone, Serialize)]
pub struct AboutInfo {
    pub status: &'static str,
    pub version: &'static str,
    pub build_timestamp: &'static str,
    pub git_sha: &'static str,
    pub platform: &'static str,
    pub arch: &'static str,
}

pub fn about_info() -> AboutInfo {
    AboutInfo {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        git_sha: env!("BUILD_GIT_SHA"),
        platform: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    }
}

// ---------------------------------------------------------------------------
// Entity counts
// ---------------------------------------------------------------------------

/// Live (not soft-deleted) rows per kind for the tenant.
///
/// Branch-scoped kinds are narrowed to `branch_id` when given. The system
/// walk-in customer is never counted, terminals do not hold it.
pub fn entity_counts(
    conn: &Connection,
    tenant_id: i64,
    branch_id: Option<i64>,
) -> SyncResult<EntityCounts> {
    let mut counts = EntityCounts::new();
    for kind in EntityKind::ALL {
        let desc = kind.descriptor();
        let mut sql = format!(
            "SELECT COUNT(*) FROM {} WHERE tenant_id = ?1 AND is_deleted = 0",
            desc.table
        );
        let mut params = vec![SqlValue::Integer(tenant_id)];
        if let (Scope::Branch, Some(branch)) = (desc.scope, branch_id) {
            sql.push_str(" AND branch_id = ?2");
            params.push(SqlValue::Integer(branch));
        }
        if kind == EntityKind::Customer {
            sql.push_str(" AND is_system_generic = 0");
        }
        let count: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        counts.insert(kind, count);
    }
    Ok(counts)
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// Default log directory when none is configured: `{data_dir}/logs`.
pub fn default_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Delete the oldest rolling log files beyond `keep`.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
        })
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_about_info_has_build_metadata() {
        let info = serde_json::to_value(about_info()).unwrap();
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert!(info["build_timestamp"].as_str().is_some_and(|s| !s.is_empty()));
        assert!(info.get("git_sha").is_some());
    }

    #[test]
    fn test_entity_counts_scope_rules() {
        let conn = test_conn();
        conn.execute_batch(
            "INSERT INTO employees (tenant_id, global_id, server_received_at, updated_at,
                full_name, username)
                VALUES (1, 'emp-1', 'now', 'now', 'Ana', 'ana'),
                       (1, 'emp-2', 'now', 'now', 'Leo', 'leo'),
                       (2, 'emp-3', 'now', 'now', 'Eva', 'eva');
             INSERT INTO customers (tenant_id, global_id, server_received_at, updated_at,
                name, is_system_generic)
                VALUES (1, 'walk-in', 'now', 'now', 'Walk-in customer', 1),
                       (1, 'cust-1', 'now', 'now', 'Luis', 0);
             INSERT INTO shifts (tenant_id, branch_id, global_id, server_received_at, updated_at,
                employee_id, start_time, is_deleted)
                VALUES (1, 10, 'shift-1', 'now', 'now', 1, 'now', 0),
                       (1, 11, 'shift-2', 'now', 'now', 1, 'now', 0),
                       (1, 10, 'shift-3', 'now', 'now', 1, 'now', 1);",
        )
        .unwrap();

        let all = entity_counts(&conn, 1, None).unwrap();
        assert_eq!(all[&EntityKind::Employee], 2);
        assert_eq!(all[&EntityKind::Customer], 1);
        assert_eq!(all[&EntityKind::Shift], 2);
        assert_eq!(all[&EntityKind::Sale], 0);
        assert_eq!(all.len(), EntityKind::ALL.len());

        let branch = entity_counts(&conn, 1, Some(10)).unwrap();
        assert_eq!(branch[&EntityKind::Shift], 1);
        // Tenant-scoped kinds ignore the branch.
        assert_eq!(branch[&EntityKind::Employee], 2);
    }

    #[test]
    fn test_prune_old_logs_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        for day in 0..5u64 {
            let path = dir.path().join(format!("{LOG_FILE_PREFIX}.2026-03-0{}", day + 1));
            fs::write(&path, b"log").unwrap();
            let file = fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(now - Duration::from_secs((5 - day) * 86_400)).unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

        assert_eq!(prune_old_logs(dir.path(), 3), 2);
        assert!(!dir.path().join(format!("{LOG_FILE_PREFIX}.2026-03-01")).exists());
        assert!(dir.path().join(format!("{LOG_FILE_PREFIX}.2026-03-05")).exists());
        assert!(dir.path().join("unrelated.txt").exists());
        assert_eq!(prune_old_logs(&dir.path().join("missing"), 3), 0);
    }
}
