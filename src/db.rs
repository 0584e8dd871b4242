//! Authoritative SQLite store for synced records.
//!
//! Uses rusqlite with WAL mode. Every syncable table carries the same
//! identity/provenance columns (`tenant_id`, `branch_id`, `global_id`,
//! `origin_terminal_id`, `local_sequence`, `local_created_at`,
//! `server_received_at`, `updated_at`, `is_deleted`, `deleted_at`) and a
//! `UNIQUE(tenant_id, global_id)` constraint backing idempotency.
//!
//! Connections live in a small fixed pool. Writers take `BEGIN IMMEDIATE`,
//! so concurrent submissions of the same global id serialize on the
//! database write lock.

use crate::error::{SyncError, SyncResult};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use tracing::{error, info};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 4;

pub const DB_FILE_NAME: &str = "sync.db";

/// Fixed pool of connections to the same database file.
pub struct DbPool {
    conns: Vec<Mutex<Connection>>,
    next: AtomicUsize,
    pub db_path: Option<PathBuf>,
}

impl DbPool {
    /// Lock a connection. Prefers an idle one, otherwise waits on the next
    /// in rotation.
    pub fn get(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        let size = self.conns.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for offset in 0..size {
            match self.conns[(start + offset) % size].try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(_)) => {
                    return Err(SyncError::Store("db connection lock poisoned".into()))
                }
            }
        }
        self.conns[start % size]
            .lock()
            .map_err(|_| SyncError::Store("db connection lock poisoned".into()))
    }

    pub fn size(&self) -> usize {
        self.conns.len()
    }

    /// Single in-memory connection with the schema applied.
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        run_migrations(&conn)?;
        Ok(Self {
            conns: vec![Mutex::new(conn)],
            next: AtomicUsize::new(0),
            db_path: None,
        })
    }
}

/// Initialize the store at `{data_dir}/sync.db` with `size` connections.
///
/// Creates the directory if needed, applies pragmas and runs pending
/// migrations once on the first connection.
pub fn init(data_dir: &Path, size: usize) -> SyncResult<DbPool> {
    fs::create_dir_all(data_dir)
        .map_err(|e| SyncError::Store(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening sync store at {}", db_path.display());

    let size = size.max(1);
    let mut conns = Vec::with_capacity(size);
    for index in 0..size {
        let conn = open_and_configure(&db_path)?;
        if index == 0 {
            run_migrations(&conn)?;
        }
        conns.push(Mutex::new(conn));
    }

    info!(connections = size, "Sync store initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbPool {
        conns,
        next: AtomicUsize::new(0),
        db_path: Some(db_path),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> SyncResult<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| SyncError::Store(format!("sqlite open {}: {e}", path.display())))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| SyncError::Store(format!("pragma journal_mode: {e}")))?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| SyncError::Store(format!("pragma setup: {e}")))
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| SyncError::Store(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| SyncError::Store(format!("read schema_version: {e}")))?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Sync store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating sync store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate(conn, 1, MIGRATION_V1)?;
    }
    if current < 2 {
        migrate(conn, 2, MIGRATION_V2)?;
    }
    if current < 3 {
        migrate(conn, 3, MIGRATION_V3)?;
    }
    if current < 4 {
        migrate(conn, 4, MIGRATION_V4)?;
    }

    Ok(())
}

fn migrate(conn: &Connection, version: i32, sql: &str) -> SyncResult<()> {
    let batch = format!(
        "BEGIN;
         {sql}
         INSERT INTO schema_version (version) VALUES ({version});
         COMMIT;"
    );
    if let Err(e) = conn.execute_batch(&batch) {
        error!("Migration v{version} failed: {e}");
        let _ = conn.execute_batch("ROLLBACK;");
        return Err(SyncError::Store(format!("migration v{version}: {e}")));
    }
    info!("Applied migration v{version}");
    Ok(())
}

/// Migration v1: staff, catalogue and customer reference data.
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS employees (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        full_name TEXT NOT NULL,
        username TEXT NOT NULL,
        email TEXT,
        role_id INTEGER,
        main_branch_id INTEGER,
        is_active INTEGER NOT NULL DEFAULT 1,
        is_owner INTEGER NOT NULL DEFAULT 0,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS shifts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        start_time TEXT NOT NULL,
        end_time TEXT,
        initial_amount REAL NOT NULL DEFAULT 0 CHECK (initial_amount >= 0),
        final_amount REAL,
        transaction_counter INTEGER NOT NULL DEFAULT 0 CHECK (transaction_counter >= 0),
        is_cash_cut_open INTEGER NOT NULL DEFAULT 1,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS customers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        name TEXT NOT NULL,
        phone TEXT,
        email TEXT,
        address TEXT,
        has_credit INTEGER NOT NULL DEFAULT 0,
        credit_limit REAL NOT NULL DEFAULT 0 CHECK (credit_limit >= 0),
        current_balance REAL NOT NULL DEFAULT 0,
        discount_percentage REAL NOT NULL DEFAULT 0
            CHECK (discount_percentage BETWEEN 0 AND 100),
        notes TEXT,
        is_system_generic INTEGER NOT NULL DEFAULT 0,
        UNIQUE(tenant_id, global_id)
    );

    -- At most one walk-in customer per tenant.
    CREATE UNIQUE INDEX IF NOT EXISTS ux_customers_walk_in
        ON customers(tenant_id) WHERE is_system_generic = 1;

    CREATE TABLE IF NOT EXISTS categories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        name TEXT NOT NULL,
        is_available INTEGER NOT NULL DEFAULT 1,
        is_system_category INTEGER NOT NULL DEFAULT 0,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS products (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        category_id INTEGER REFERENCES categories(id),
        name TEXT NOT NULL,
        sku TEXT,
        barcode TEXT,
        unit TEXT,
        price REAL NOT NULL CHECK (price >= 0),
        cost REAL CHECK (cost >= 0),
        is_available INTEGER NOT NULL DEFAULT 1,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS suppliers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        name TEXT NOT NULL,
        contact_person TEXT,
        phone_number TEXT,
        email TEXT,
        address TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        UNIQUE(tenant_id, global_id)
    );

    CREATE INDEX IF NOT EXISTS idx_shifts_branch ON shifts(tenant_id, branch_id);
    CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id);
";

/// Migration v2: sales, cancellations, purchases, credit notes, expenses.
const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS sales (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER NOT NULL REFERENCES shifts(id),
        customer_id INTEGER NOT NULL REFERENCES customers(id),
        driver_id INTEGER REFERENCES employees(id),
        driver_shift_id INTEGER REFERENCES shifts(id),
        ticket_number INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'completed'
            CHECK (status IN ('draft', 'assigned', 'completed', 'cancelled', 'settled')),
        sale_type_id INTEGER,
        payment_type_id INTEGER,
        subtotal REAL NOT NULL DEFAULT 0,
        total_discount REAL NOT NULL DEFAULT 0,
        total REAL NOT NULL CHECK (total >= 0),
        amount_paid REAL NOT NULL DEFAULT 0,
        original_credit REAL NOT NULL DEFAULT 0,
        cash_amount REAL NOT NULL DEFAULT 0,
        card_amount REAL NOT NULL DEFAULT 0,
        credit_amount REAL NOT NULL DEFAULT 0,
        sold_at TEXT,
        settled_at TEXT,
        notes TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS sale_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        sale_id INTEGER NOT NULL REFERENCES sales(id) ON DELETE CASCADE,
        product_id INTEGER REFERENCES products(id),
        description TEXT NOT NULL DEFAULT '',
        quantity REAL NOT NULL CHECK (quantity > 0),
        list_price REAL,
        unit_price REAL NOT NULL CHECK (unit_price >= 0),
        line_total REAL NOT NULL,
        customer_discount REAL NOT NULL DEFAULT 0,
        manual_discount REAL NOT NULL DEFAULT 0,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS cancellations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER NOT NULL REFERENCES shifts(id),
        sale_id INTEGER REFERENCES sales(id),
        sale_item_id INTEGER REFERENCES sale_items(id),
        product_id INTEGER REFERENCES products(id),
        cancelled_at TEXT,
        description TEXT,
        quantity REAL NOT NULL CHECK (quantity > 0),
        weight_kg REAL CHECK (weight_kg >= 0),
        reason TEXT,
        reason_id INTEGER,
        other_reason TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS purchases (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER REFERENCES employees(id),
        shift_id INTEGER REFERENCES shifts(id),
        supplier_id INTEGER REFERENCES suppliers(id),
        supplier_name TEXT,
        purchase_number TEXT,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'partial', 'paid', 'cancelled')),
        payment_type_id INTEGER,
        subtotal REAL NOT NULL DEFAULT 0,
        taxes REAL NOT NULL DEFAULT 0,
        total REAL NOT NULL CHECK (total >= 0),
        amount_paid REAL NOT NULL DEFAULT 0,
        notes TEXT,
        invoice_number TEXT,
        purchased_at TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS purchase_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        purchase_id INTEGER NOT NULL REFERENCES purchases(id) ON DELETE CASCADE,
        product_id INTEGER REFERENCES products(id),
        product_name TEXT,
        quantity REAL NOT NULL CHECK (quantity > 0),
        unit_price REAL NOT NULL CHECK (unit_price >= 0),
        subtotal REAL,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS credit_notes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        sale_id INTEGER NOT NULL REFERENCES sales(id),
        shift_id INTEGER NOT NULL REFERENCES shifts(id),
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        authorized_by_id INTEGER NOT NULL REFERENCES employees(id),
        customer_id INTEGER REFERENCES customers(id),
        note_type TEXT NOT NULL DEFAULT 'cancellation'
            CHECK (note_type IN ('cancellation', 'return', 'adjustment')),
        status TEXT NOT NULL DEFAULT 'applied'
            CHECK (status IN ('applied', 'pending', 'voided')),
        total REAL NOT NULL CHECK (total >= 0),
        credit_amount REAL NOT NULL DEFAULT 0,
        cash_amount REAL NOT NULL DEFAULT 0,
        card_amount REAL NOT NULL DEFAULT 0,
        issued_at TEXT,
        reason TEXT,
        notes TEXT,
        note_number TEXT,
        original_ticket TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS credit_note_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        credit_note_id INTEGER NOT NULL REFERENCES credit_notes(id) ON DELETE CASCADE,
        product_id INTEGER NOT NULL REFERENCES products(id),
        sale_item_id INTEGER REFERENCES sale_items(id),
        description TEXT,
        quantity REAL NOT NULL CHECK (quantity > 0),
        original_quantity REAL,
        unit_price REAL NOT NULL CHECK (unit_price >= 0),
        line_total REAL NOT NULL,
        returns_to_stock INTEGER NOT NULL DEFAULT 1,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS expenses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER REFERENCES shifts(id),
        category TEXT,
        description TEXT,
        amount REAL NOT NULL CHECK (amount > 0),
        payment_type_id INTEGER,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'approved', 'rejected')),
        spent_at TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE INDEX IF NOT EXISTS idx_sales_branch ON sales(tenant_id, branch_id);
    CREATE INDEX IF NOT EXISTS idx_sales_shift ON sales(shift_id);
    CREATE INDEX IF NOT EXISTS idx_sale_items_sale ON sale_items(sale_id);
    CREATE INDEX IF NOT EXISTS idx_cancellations_branch ON cancellations(tenant_id, branch_id);
    CREATE INDEX IF NOT EXISTS idx_purchase_items_purchase ON purchase_items(purchase_id);
    CREATE INDEX IF NOT EXISTS idx_credit_notes_sale ON credit_notes(sale_id);
    CREATE INDEX IF NOT EXISTS idx_credit_note_items_note ON credit_note_items(credit_note_id);
    CREATE INDEX IF NOT EXISTS idx_expenses_branch ON expenses(tenant_id, branch_id);
";

/// Migration v3: per-employee daily metrics and tenant reference policies.
const MIGRATION_V3: &str = "
    CREATE TABLE IF NOT EXISTS employee_daily_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER REFERENCES shifts(id),
        metric_date TEXT NOT NULL,
        critical_events INTEGER NOT NULL DEFAULT 0 CHECK (critical_events >= 0),
        high_events INTEGER NOT NULL DEFAULT 0 CHECK (high_events >= 0),
        moderate_events INTEGER NOT NULL DEFAULT 0 CHECK (moderate_events >= 0),
        low_events INTEGER NOT NULL DEFAULT 0 CHECK (low_events >= 0),
        informative_events INTEGER NOT NULL DEFAULT 0 CHECK (informative_events >= 0),
        total_suspicious_events INTEGER NOT NULL DEFAULT 0,
        disconnection_count INTEGER NOT NULL DEFAULT 0,
        disconnection_total_minutes REAL NOT NULL DEFAULT 0,
        disconnection_longest_minutes REAL NOT NULL DEFAULT 0,
        total_sales INTEGER NOT NULL DEFAULT 0,
        clean_sales INTEGER NOT NULL DEFAULT 0,
        success_rate REAL CHECK (success_rate BETWEEN 0 AND 100),
        daily_status TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE INDEX IF NOT EXISTS idx_daily_metrics_employee_date
        ON employee_daily_metrics(employee_id, metric_date);

    -- Tenant overrides of the catalogue's default reference policies.
    CREATE TABLE IF NOT EXISTS reference_policies (
        tenant_id INTEGER NOT NULL,
        entity_kind TEXT NOT NULL,
        field TEXT NOT NULL,
        policy TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (datetime('now')),
        PRIMARY KEY (tenant_id, entity_kind, field)
    );
";

/// Migration v4: cash drawer movements, scale monitoring logs and delivery
/// driver assignments.
const MIGRATION_V4: &str = "
    CREATE TABLE IF NOT EXISTS cash_cuts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER NOT NULL REFERENCES shifts(id),
        start_time TEXT NOT NULL,
        end_time TEXT,
        initial_amount REAL NOT NULL DEFAULT 0,
        total_cash_sales REAL NOT NULL DEFAULT 0,
        total_card_sales REAL NOT NULL DEFAULT 0,
        total_credit_sales REAL NOT NULL DEFAULT 0,
        total_cash_payments REAL NOT NULL DEFAULT 0,
        total_card_payments REAL NOT NULL DEFAULT 0,
        total_expenses REAL NOT NULL DEFAULT 0,
        total_deposits REAL NOT NULL DEFAULT 0,
        total_withdrawals REAL NOT NULL DEFAULT 0,
        expected_cash_in_drawer REAL NOT NULL DEFAULT 0,
        counted_cash REAL NOT NULL DEFAULT 0,
        difference REAL NOT NULL DEFAULT 0,
        unregistered_weight_events INTEGER NOT NULL DEFAULT 0,
        scale_connection_events INTEGER NOT NULL DEFAULT 0,
        cancelled_sales INTEGER NOT NULL DEFAULT 0,
        notes TEXT,
        is_closed INTEGER NOT NULL DEFAULT 1,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS deposits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER REFERENCES shifts(id),
        amount REAL NOT NULL CHECK (amount > 0),
        description TEXT,
        deposited_at TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS withdrawals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER REFERENCES shifts(id),
        amount REAL NOT NULL CHECK (amount > 0),
        description TEXT,
        withdrawal_type TEXT,
        withdrawn_at TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS credit_payments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        customer_id INTEGER NOT NULL REFERENCES customers(id),
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER REFERENCES shifts(id),
        amount REAL NOT NULL CHECK (amount > 0),
        payment_method TEXT NOT NULL DEFAULT 'cash',
        paid_at TEXT,
        notes TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS employee_debts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        cash_cut_id INTEGER REFERENCES cash_cuts(id),
        shift_id INTEGER REFERENCES shifts(id),
        debt_amount REAL NOT NULL CHECK (debt_amount >= 0),
        amount_paid REAL NOT NULL DEFAULT 0 CHECK (amount_paid >= 0),
        status TEXT NOT NULL DEFAULT 'pending',
        incurred_at TEXT,
        paid_at TEXT,
        notes TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS suspicious_weighing_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER REFERENCES shifts(id),
        reviewed_by_id INTEGER REFERENCES employees(id),
        related_sale_id INTEGER REFERENCES sales(id),
        related_product_id INTEGER REFERENCES products(id),
        occurred_at TEXT NOT NULL,
        event_type TEXT NOT NULL,
        weight_detected REAL,
        details TEXT,
        severity TEXT,
        scenario_code TEXT,
        risk_score REAL,
        points_assigned INTEGER,
        discrepancy_amount REAL,
        was_reviewed INTEGER NOT NULL DEFAULT 0,
        review_notes TEXT,
        reviewed_at TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS scale_disconnection_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER REFERENCES shifts(id),
        disconnected_at TEXT NOT NULL,
        reconnected_at TEXT,
        duration_minutes REAL CHECK (duration_minutes >= 0),
        disconnection_status TEXT,
        reason TEXT,
        notes TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS driver_assignments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        sale_id INTEGER NOT NULL REFERENCES sales(id),
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        shift_id INTEGER REFERENCES shifts(id),
        assigned_quantity REAL NOT NULL CHECK (assigned_quantity > 0),
        assigned_amount REAL NOT NULL CHECK (assigned_amount >= 0),
        unit_price REAL,
        status TEXT NOT NULL DEFAULT 'assigned',
        assigned_at TEXT,
        notes TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE TABLE IF NOT EXISTS driver_returns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id INTEGER NOT NULL,
        branch_id INTEGER NOT NULL,
        global_id TEXT NOT NULL,
        origin_terminal_id TEXT,
        local_sequence INTEGER,
        local_created_at TEXT,
        server_received_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
        deleted_at TEXT,
        assignment_id INTEGER NOT NULL REFERENCES driver_assignments(id),
        employee_id INTEGER NOT NULL REFERENCES employees(id),
        registered_by_id INTEGER REFERENCES employees(id),
        shift_id INTEGER REFERENCES shifts(id),
        quantity REAL NOT NULL CHECK (quantity > 0),
        unit_price REAL,
        amount REAL,
        returned_at TEXT,
        source TEXT,
        notes TEXT,
        UNIQUE(tenant_id, global_id)
    );

    CREATE INDEX IF NOT EXISTS idx_cash_cuts_shift ON cash_cuts(shift_id);
    CREATE INDEX IF NOT EXISTS idx_credit_payments_customer ON credit_payments(customer_id);
    CREATE INDEX IF NOT EXISTS idx_employee_debts_employee ON employee_debts(employee_id);
    CREATE INDEX IF NOT EXISTS idx_weighing_logs_employee ON suspicious_weighing_logs(employee_id, occurred_at);
    CREATE INDEX IF NOT EXISTS idx_driver_assignments_sale ON driver_assignments(sale_id);
    CREATE INDEX IF NOT EXISTS idx_driver_returns_assignment ON driver_returns(assignment_id);
";

/// In-memory connection with pragmas and schema (test helper).
#[cfg(test)]
pub fn test_conn() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    configure(&conn).expect("pragma setup");
    run_migrations(&conn).expect("migrations");
    conn
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityKind;

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        stmt.query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_every_catalogue_table() {
        let conn = test_conn();
        let tables = table_names(&conn);
        for kind in EntityKind::ALL {
            let table = kind.descriptor().table;
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
        assert!(tables.contains(&"reference_policies".to_string()));
    }

    #[test]
    fn test_catalogue_matches_schema() {
        let conn = test_conn();
        for kind in EntityKind::ALL {
            let desc = kind.descriptor();
            let columns = column_names(&conn, desc.table);
            let mut expected: Vec<&str> = vec![
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
            expected.extend(desc.fields.iter().map(|f| f.name));
            expected.extend(desc.references.iter().map(|r| r.column));
            if let Some(parent) = &desc.parent {
                expected.push(parent.column);
            }
            for column in expected {
                assert!(
                    columns.iter().any(|c| c == column),
                    "{}.{} missing from schema",
                    desc.table,
                    column
                );
            }
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_conn();
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_v3_store_upgrades_to_current() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        configure(&conn).expect("pragma setup");
        conn.execute_batch(
            "CREATE TABLE schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT DEFAULT (datetime('now'))
            );",
        )
        .expect("create schema_version");
        migrate(&conn, 1, MIGRATION_V1).expect("v1");
        migrate(&conn, 2, MIGRATION_V2).expect("v2");
        migrate(&conn, 3, MIGRATION_V3).expect("v3");
        assert!(!table_names(&conn).contains(&"driver_returns".to_string()));

        run_migrations(&conn).expect("upgrade");
        assert!(table_names(&conn).contains(&"driver_returns".to_string()));
        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .expect("count versions");
        assert_eq!(versions, i64::from(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let conn = test_conn();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .expect("read foreign_keys");
        assert_eq!(fk, 1, "foreign_keys should be ON");
    }

    #[test]
    fn test_global_id_unique_per_tenant() {
        let conn = test_conn();
        let insert = "INSERT INTO categories
            (tenant_id, global_id, server_received_at, updated_at, name)
            VALUES (?1, 'cat-1', 'now', 'now', 'Drinks')";
        conn.execute(insert, [1]).expect("first insert");
        conn.execute(insert, [2]).expect("same global id, other tenant");
        let err = conn.execute(insert, [1]).unwrap_err();
        assert!(matches!(
            SyncError::from(err),
            SyncError::Constraint(_)
        ));
    }

    #[test]
    fn test_single_walk_in_customer_per_tenant() {
        let conn = test_conn();
        let insert = "INSERT INTO customers
            (tenant_id, global_id, server_received_at, updated_at, name, is_system_generic)
            VALUES (1, ?1, 'now', 'now', 'Walk-in customer', 1)";
        conn.execute(insert, ["walk-in-a"]).expect("first walk-in");
        assert!(conn.execute(insert, ["walk-in-b"]).is_err());
    }

    #[test]
    fn test_file_pool_wal_and_rotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = init(dir.path(), 2).expect("init pool");
        assert_eq!(pool.size(), 2);

        let first = pool.get().expect("first connection");
        let mode: String = first
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal_mode");
        assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");

        // A second caller gets the idle connection instead of blocking.
        let second = pool.get().expect("second connection");
        let version: i32 = second
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("schema visible on second connection");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }
}
