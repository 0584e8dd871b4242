//! Declarative catalogue of every syncable entity kind.
//!
//! Each kind is described once: table, ownership scope, the fields a terminal
//! may send (with their mutability on conflict), the foreign global references
//! and their default resolution policy, and embedded children. The resolver,
//! upsert executor, coordinator and verifier are all generic over these
//! descriptors; no code path is written per entity.
//!
//! Column names here must match the DDL in `db.rs` (checked by
//! `db::tests::test_catalogue_matches_schema`).

use serde::{Serialize, Serializer};

/// Origin terminal id reserved for the always-online mobile client.
pub const MOBILE_APP_TERMINAL: &str = "MOBILE-APP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Employee,
    Shift,
    Customer,
    Category,
    Product,
    Supplier,
    Sale,
    SaleItem,
    Cancellation,
    Purchase,
    PurchaseItem,
    CreditNote,
    CreditNoteItem,
    Expense,
    EmployeeDailyMetric,
    CashCut,
    Deposit,
    Withdrawal,
    CreditPayment,
    EmployeeDebt,
    SuspiciousWeighingLog,
    ScaleDisconnectionLog,
    DriverAssignment,
    DriverReturn,
}

impl EntityKind {
    pub const ALL: [EntityKind; 24] = [
        EntityKind::Employee,
        EntityKind::Shift,
        EntityKind::Customer,
        EntityKind::Category,
        EntityKind::Product,
        EntityKind::Supplier,
        EntityKind::Sale,
        EntityKind::SaleItem,
        EntityKind::Cancellation,
        EntityKind::Purchase,
        EntityKind::PurchaseItem,
        EntityKind::CreditNote,
        EntityKind::CreditNoteItem,
        EntityKind::Expense,
        EntityKind::EmployeeDailyMetric,
        EntityKind::CashCut,
        EntityKind::Deposit,
        EntityKind::Withdrawal,
        EntityKind::CreditPayment,
        EntityKind::EmployeeDebt,
        EntityKind::SuspiciousWeighingLog,
        EntityKind::ScaleDisconnectionLog,
        EntityKind::DriverAssignment,
        EntityKind::DriverReturn,
    ];

    /// Wire name used in URLs, verification requests and events.
    pub fn as_str(self) -> &'static str {
        self.descriptor().name
    }

    /// Parse a wire name. Accepts the canonical snake_case name and the
    /// camelCase spelling some terminal builds send.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL.iter().copied().find(|kind| {
            let name = kind.as_str();
            name == raw || camel_case(name) == raw
        })
    }

    pub fn descriptor(self) -> &'static EntityDescriptor {
        match self {
            EntityKind::Employee => &EMPLOYEE,
            EntityKind::Shift => &SHIFT,
            EntityKind::Customer => &CUSTOMER,
            EntityKind::Category => &CATEGORY,
            EntityKind::Product => &PRODUCT,
            EntityKind::Supplier => &SUPPLIER,
            EntityKind::Sale => &SALE,
            EntityKind::SaleItem => &SALE_ITEM,
            EntityKind::Cancellation => &CANCELLATION,
            EntityKind::Purchase => &PURCHASE,
            EntityKind::PurchaseItem => &PURCHASE_ITEM,
            EntityKind::CreditNote => &CREDIT_NOTE,
            EntityKind::CreditNoteItem => &CREDIT_NOTE_ITEM,
            EntityKind::Expense => &EXPENSE,
            EntityKind::EmployeeDailyMetric => &EMPLOYEE_DAILY_METRIC,
            EntityKind::CashCut => &CASH_CUT,
            EntityKind::Deposit => &DEPOSIT,
            EntityKind::Withdrawal => &WITHDRAWAL,
            EntityKind::CreditPayment => &CREDIT_PAYMENT,
            EntityKind::EmployeeDebt => &EMPLOYEE_DEBT,
            EntityKind::SuspiciousWeighingLog => &SUSPICIOUS_WEIGHING_LOG,
            EntityKind::ScaleDisconnectionLog => &SCALE_DISCONNECTION_LOG,
            EntityKind::DriverAssignment => &DRIVER_ASSIGNMENT,
            EntityKind::DriverReturn => &DRIVER_RETURN,
        }
    }

    /// Child kinds only travel embedded in their header.
    pub fn is_child(self) -> bool {
        self.descriptor().parent.is_some()
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EntityKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Ownership scope of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Shared by every branch of the tenant (staff, catalogue, customers).
    Tenant,
    /// Belongs to exactly one branch; `branch_id` is required.
    Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Bool,
    /// RFC 3339 instant, stored normalised to UTC.
    Timestamp,
    /// Calendar date, `YYYY-MM-DD`.
    Date,
}

#[derive(Debug)]
pub struct FieldSpec {
    /// Wire key and column name.
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    /// Overwritten on resubmission. Immutable fields keep their first value.
    pub mutable: bool,
}

/// How an unresolved foreign reference is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Abort persisting the referencing record.
    Fatal,
    /// Store NULL. Only valid on nullable columns.
    Detach,
    /// Substitute the reference's declared fallback.
    Fallback,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyKind::Fatal => "fatal",
            PolicyKind::Detach => "detach",
            PolicyKind::Fallback => "fallback",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fatal" => Some(PolicyKind::Fatal),
            "detach" => Some(PolicyKind::Detach),
            "fallback" => Some(PolicyKind::Fallback),
            _ => None,
        }
    }
}

/// Substitute surrogate used when a fallback-able reference is unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// The tenant's system walk-in customer, created on first use.
    WalkInCustomer,
    /// Whatever was bound for another reference of the same record.
    SameAs(&'static str),
}

#[derive(Debug)]
pub struct ReferenceSpec {
    /// Wire key carrying the foreign global id.
    pub field: &'static str,
    /// Surrogate foreign-key column.
    pub column: &'static str,
    pub target: EntityKind,
    pub policy: PolicyKind,
    pub fallback: Option<Fallback>,
    pub nullable: bool,
}

#[derive(Debug)]
pub struct ChildSpec {
    /// Wire key of the embedded array.
    pub key: &'static str,
    pub kind: EntityKind,
}

#[derive(Debug)]
pub struct ParentSpec {
    pub kind: EntityKind,
    /// Surrogate column pointing at the header row.
    pub column: &'static str,
}

#[derive(Debug)]
pub struct EntityDescriptor {
    pub kind: EntityKind,
    pub name: &'static str,
    pub table: &'static str,
    pub scope: Scope,
    pub fields: &'static [FieldSpec],
    pub references: &'static [ReferenceSpec],
    pub children: Option<ChildSpec>,
    pub parent: Option<ParentSpec>,
    /// Emit a notification after a successful persist.
    pub notify: bool,
}

impl EntityDescriptor {
    pub fn reference(&self, field: &str) -> Option<&'static ReferenceSpec> {
        self.references.iter().find(|r| r.field == field)
    }
}

/// `shift_global_id` -> `shiftGlobalId`.
pub(crate) fn camel_case(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for ch in snake.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Builders (const-friendly)
// ---------------------------------------------------------------------------

const fn field(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: false,
        mutable: true,
    }
}

const fn required(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: true,
        mutable: true,
    }
}

const fn frozen(name: &'static str, ty: FieldType, required: bool) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required,
        mutable: false,
    }
}

const fn fatal(field: &'static str, column: &'static str, target: EntityKind) -> ReferenceSpec {
    ReferenceSpec {
        field,
        column,
        target,
        policy: PolicyKind::Fatal,
        fallback: None,
        nullable: false,
    }
}

const fn detach(field: &'static str, column: &'static str, target: EntityKind) -> ReferenceSpec {
    ReferenceSpec {
        field,
        column,
        target,
        policy: PolicyKind::Detach,
        fallback: None,
        nullable: true,
    }
}

use FieldType::{Bool, Date, Integer, Real, Text, Timestamp};

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

static EMPLOYEE: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Employee,
    name: "employee",
    table: "employees",
    scope: Scope::Tenant,
    fields: &[
        required("full_name", Text),
        required("username", Text),
        field("email", Text),
        field("role_id", Integer),
        field("main_branch_id", Integer),
        field("is_active", Bool),
        field("is_owner", Bool),
    ],
    references: &[],
    children: None,
    parent: None,
    notify: false,
};

static SHIFT: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Shift,
    name: "shift",
    table: "shifts",
    scope: Scope::Branch,
    fields: &[
        frozen("start_time", Timestamp, true),
        field("end_time", Timestamp),
        field("initial_amount", Real),
        field("final_amount", Real),
        field("transaction_counter", Integer),
        field("is_cash_cut_open", Bool),
    ],
    references: &[fatal("employee_global_id", "employee_id", EntityKind::Employee)],
    children: None,
    parent: None,
    notify: false,
};

static CUSTOMER: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Customer,
    name: "customer",
    table: "customers",
    scope: Scope::Tenant,
    fields: &[
        required("name", Text),
        field("phone", Text),
        field("email", Text),
        field("address", Text),
        field("has_credit", Bool),
        field("credit_limit", Real),
        field("current_balance", Real),
        field("discount_percentage", Real),
        field("notes", Text),
    ],
    references: &[],
    children: None,
    parent: None,
    notify: false,
};

static CATEGORY: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Category,
    name: "category",
    table: "categories",
    scope: Scope::Tenant,
    fields: &[
        required("name", Text),
        field("is_available", Bool),
        field("is_system_category", Bool),
    ],
    references: &[],
    children: None,
    parent: None,
    notify: false,
};

static PRODUCT: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Product,
    name: "product",
    table: "products",
    scope: Scope::Tenant,
    fields: &[
        required("name", Text),
        field("sku", Text),
        field("barcode", Text),
        field("unit", Text),
        required("price", Real),
        field("cost", Real),
        field("is_available", Bool),
    ],
    references: &[detach("category_global_id", "category_id", EntityKind::Category)],
    children: None,
    parent: None,
    notify: false,
};

static SUPPLIER: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Supplier,
    name: "supplier",
    table: "suppliers",
    scope: Scope::Tenant,
    fields: &[
        required("name", Text),
        field("contact_person", Text),
        field("phone_number", Text),
        field("email", Text),
        field("address", Text),
        field("is_active", Bool),
    ],
    references: &[],
    children: None,
    parent: None,
    notify: false,
};

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

static SALE: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Sale,
    name: "sale",
    table: "sales",
    scope: Scope::Branch,
    fields: &[
        frozen("ticket_number", Integer, true),
        field("status", Text),
        field("sale_type_id", Integer),
        field("payment_type_id", Integer),
        field("subtotal", Real),
        field("total_discount", Real),
        required("total", Real),
        field("amount_paid", Real),
        // Credit granted at sale time is an audit figure; never rewritten.
        frozen("original_credit", Real, false),
        field("cash_amount", Real),
        field("card_amount", Real),
        field("credit_amount", Real),
        frozen("sold_at", Timestamp, false),
        field("settled_at", Timestamp),
        field("notes", Text),
    ],
    references: &[
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        fatal("shift_global_id", "shift_id", EntityKind::Shift),
        ReferenceSpec {
            field: "customer_global_id",
            column: "customer_id",
            target: EntityKind::Customer,
            policy: PolicyKind::Fallback,
            fallback: Some(Fallback::WalkInCustomer),
            nullable: false,
        },
        detach("driver_global_id", "driver_id", EntityKind::Employee),
        detach("driver_shift_global_id", "driver_shift_id", EntityKind::Shift),
    ],
    children: Some(ChildSpec {
        key: "items",
        kind: EntityKind::SaleItem,
    }),
    parent: None,
    notify: true,
};

static SALE_ITEM: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::SaleItem,
    name: "sale_item",
    table: "sale_items",
    scope: Scope::Branch,
    fields: &[
        field("description", Text),
        required("quantity", Real),
        field("list_price", Real),
        required("unit_price", Real),
        required("line_total", Real),
        field("customer_discount", Real),
        field("manual_discount", Real),
    ],
    references: &[detach("product_global_id", "product_id", EntityKind::Product)],
    children: None,
    parent: Some(ParentSpec {
        kind: EntityKind::Sale,
        column: "sale_id",
    }),
    notify: false,
};

static CANCELLATION: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Cancellation,
    name: "cancellation",
    table: "cancellations",
    scope: Scope::Branch,
    fields: &[
        frozen("cancelled_at", Timestamp, false),
        field("description", Text),
        required("quantity", Real),
        field("weight_kg", Real),
        field("reason", Text),
        field("reason_id", Integer),
        field("other_reason", Text),
    ],
    references: &[
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        fatal("shift_global_id", "shift_id", EntityKind::Shift),
        detach("sale_global_id", "sale_id", EntityKind::Sale),
        detach("sale_item_global_id", "sale_item_id", EntityKind::SaleItem),
        detach("product_global_id", "product_id", EntityKind::Product),
    ],
    children: None,
    parent: None,
    notify: true,
};

static PURCHASE: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Purchase,
    name: "purchase",
    table: "purchases",
    scope: Scope::Branch,
    fields: &[
        field("supplier_name", Text),
        field("purchase_number", Text),
        field("status", Text),
        field("payment_type_id", Integer),
        field("subtotal", Real),
        field("taxes", Real),
        required("total", Real),
        field("amount_paid", Real),
        field("notes", Text),
        field("invoice_number", Text),
        frozen("purchased_at", Timestamp, false),
    ],
    references: &[
        detach("employee_global_id", "employee_id", EntityKind::Employee),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
        detach("supplier_global_id", "supplier_id", EntityKind::Supplier),
    ],
    children: Some(ChildSpec {
        key: "items",
        kind: EntityKind::PurchaseItem,
    }),
    parent: None,
    notify: true,
};

static PURCHASE_ITEM: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::PurchaseItem,
    name: "purchase_item",
    table: "purchase_items",
    scope: Scope::Branch,
    fields: &[
        field("product_name", Text),
        required("quantity", Real),
        required("unit_price", Real),
        field("subtotal", Real),
    ],
    references: &[detach("product_global_id", "product_id", EntityKind::Product)],
    children: None,
    parent: Some(ParentSpec {
        kind: EntityKind::Purchase,
        column: "purchase_id",
    }),
    notify: false,
};

static CREDIT_NOTE: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::CreditNote,
    name: "credit_note",
    table: "credit_notes",
    scope: Scope::Branch,
    fields: &[
        field("note_type", Text),
        field("status", Text),
        required("total", Real),
        field("credit_amount", Real),
        field("cash_amount", Real),
        field("card_amount", Real),
        frozen("issued_at", Timestamp, false),
        field("reason", Text),
        field("notes", Text),
        frozen("note_number", Text, false),
        frozen("original_ticket", Text, false),
    ],
    references: &[
        fatal("sale_global_id", "sale_id", EntityKind::Sale),
        fatal("shift_global_id", "shift_id", EntityKind::Shift),
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        ReferenceSpec {
            field: "authorized_by_global_id",
            column: "authorized_by_id",
            target: EntityKind::Employee,
            policy: PolicyKind::Fallback,
            fallback: Some(Fallback::SameAs("employee_global_id")),
            nullable: false,
        },
        ReferenceSpec {
            field: "customer_global_id",
            column: "customer_id",
            target: EntityKind::Customer,
            policy: PolicyKind::Detach,
            fallback: Some(Fallback::WalkInCustomer),
            nullable: true,
        },
    ],
    children: Some(ChildSpec {
        key: "items",
        kind: EntityKind::CreditNoteItem,
    }),
    parent: None,
    notify: true,
};

static CREDIT_NOTE_ITEM: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::CreditNoteItem,
    name: "credit_note_item",
    table: "credit_note_items",
    scope: Scope::Branch,
    fields: &[
        field("description", Text),
        required("quantity", Real),
        field("original_quantity", Real),
        required("unit_price", Real),
        required("line_total", Real),
        field("returns_to_stock", Bool),
    ],
    references: &[
        fatal("product_global_id", "product_id", EntityKind::Product),
        detach("sale_item_global_id", "sale_item_id", EntityKind::SaleItem),
    ],
    children: None,
    parent: Some(ParentSpec {
        kind: EntityKind::CreditNote,
        column: "credit_note_id",
    }),
    notify: false,
};

static EXPENSE: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Expense,
    name: "expense",
    table: "expenses",
    scope: Scope::Branch,
    fields: &[
        field("category", Text),
        field("description", Text),
        required("amount", Real),
        field("payment_type_id", Integer),
        field("status", Text),
        frozen("spent_at", Timestamp, false),
    ],
    references: &[
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
    ],
    children: None,
    parent: None,
    notify: true,
};

static EMPLOYEE_DAILY_METRIC: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::EmployeeDailyMetric,
    name: "employee_daily_metric",
    table: "employee_daily_metrics",
    scope: Scope::Branch,
    fields: &[
        frozen("metric_date", Date, true),
        field("critical_events", Integer),
        field("high_events", Integer),
        field("moderate_events", Integer),
        field("low_events", Integer),
        field("informative_events", Integer),
        field("total_suspicious_events", Integer),
        field("disconnection_count", Integer),
        field("disconnection_total_minutes", Real),
        field("disconnection_longest_minutes", Real),
        field("total_sales", Integer),
        field("clean_sales", Integer),
        field("success_rate", Real),
        field("daily_status", Text),
    ],
    references: &[
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
    ],
    children: None,
    parent: None,
    notify: false,
};

// ---------------------------------------------------------------------------
// Cash drawer
// ---------------------------------------------------------------------------

static CASH_CUT: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::CashCut,
    name: "cash_cut",
    table: "cash_cuts",
    scope: Scope::Branch,
    fields: &[
        frozen("start_time", Timestamp, true),
        field("end_time", Timestamp),
        field("initial_amount", Real),
        field("total_cash_sales", Real),
        field("total_card_sales", Real),
        field("total_credit_sales", Real),
        field("total_cash_payments", Real),
        field("total_card_payments", Real),
        field("total_expenses", Real),
        field("total_deposits", Real),
        field("total_withdrawals", Real),
        field("expected_cash_in_drawer", Real),
        field("counted_cash", Real),
        field("difference", Real),
        field("unregistered_weight_events", Integer),
        field("scale_connection_events", Integer),
        field("cancelled_sales", Integer),
        field("notes", Text),
        field("is_closed", Bool),
    ],
    references: &[
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        fatal("shift_global_id", "shift_id", EntityKind::Shift),
    ],
    children: None,
    parent: None,
    notify: true,
};

static DEPOSIT: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Deposit,
    name: "deposit",
    table: "deposits",
    scope: Scope::Branch,
    fields: &[
        required("amount", Real),
        field("description", Text),
        frozen("deposited_at", Timestamp, false),
    ],
    references: &[
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
    ],
    children: None,
    parent: None,
    notify: true,
};

static WITHDRAWAL: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::Withdrawal,
    name: "withdrawal",
    table: "withdrawals",
    scope: Scope::Branch,
    fields: &[
        required("amount", Real),
        field("description", Text),
        field("withdrawal_type", Text),
        frozen("withdrawn_at", Timestamp, false),
    ],
    references: &[
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
    ],
    children: None,
    parent: None,
    notify: true,
};

static CREDIT_PAYMENT: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::CreditPayment,
    name: "credit_payment",
    table: "credit_payments",
    scope: Scope::Branch,
    fields: &[
        required("amount", Real),
        frozen("payment_method", Text, false),
        frozen("paid_at", Timestamp, false),
        field("notes", Text),
    ],
    references: &[
        fatal("customer_global_id", "customer_id", EntityKind::Customer),
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
    ],
    children: None,
    parent: None,
    notify: true,
};

static EMPLOYEE_DEBT: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::EmployeeDebt,
    name: "employee_debt",
    table: "employee_debts",
    scope: Scope::Branch,
    fields: &[
        frozen("debt_amount", Real, true),
        field("amount_paid", Real),
        field("status", Text),
        frozen("incurred_at", Timestamp, false),
        field("paid_at", Timestamp),
        field("notes", Text),
    ],
    references: &[
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        detach("cash_cut_global_id", "cash_cut_id", EntityKind::CashCut),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
    ],
    children: None,
    parent: None,
    notify: true,
};

// ---------------------------------------------------------------------------
// Scale monitoring
// ---------------------------------------------------------------------------

/// The event itself is evidence and never rewritten; only the review is.
static SUSPICIOUS_WEIGHING_LOG: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::SuspiciousWeighingLog,
    name: "suspicious_weighing_log",
    table: "suspicious_weighing_logs",
    scope: Scope::Branch,
    fields: &[
        frozen("occurred_at", Timestamp, true),
        frozen("event_type", Text, true),
        frozen("weight_detected", Real, false),
        frozen("details", Text, false),
        frozen("severity", Text, false),
        frozen("scenario_code", Text, false),
        frozen("risk_score", Real, false),
        frozen("points_assigned", Integer, false),
        frozen("discrepancy_amount", Real, false),
        field("was_reviewed", Bool),
        field("review_notes", Text),
        field("reviewed_at", Timestamp),
    ],
    references: &[
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
        detach("reviewed_by_global_id", "reviewed_by_id", EntityKind::Employee),
        detach("related_sale_global_id", "related_sale_id", EntityKind::Sale),
        detach("related_product_global_id", "related_product_id", EntityKind::Product),
    ],
    children: None,
    parent: None,
    notify: false,
};

static SCALE_DISCONNECTION_LOG: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::ScaleDisconnectionLog,
    name: "scale_disconnection_log",
    table: "scale_disconnection_logs",
    scope: Scope::Branch,
    fields: &[
        frozen("disconnected_at", Timestamp, true),
        field("reconnected_at", Timestamp),
        field("duration_minutes", Real),
        field("disconnection_status", Text),
        frozen("reason", Text, false),
        field("notes", Text),
    ],
    references: &[
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
    ],
    children: None,
    parent: None,
    notify: false,
};

// ---------------------------------------------------------------------------
// Delivery drivers
// ---------------------------------------------------------------------------

static DRIVER_ASSIGNMENT: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::DriverAssignment,
    name: "driver_assignment",
    table: "driver_assignments",
    scope: Scope::Branch,
    fields: &[
        required("assigned_quantity", Real),
        required("assigned_amount", Real),
        field("unit_price", Real),
        field("status", Text),
        frozen("assigned_at", Timestamp, false),
        field("notes", Text),
    ],
    references: &[
        fatal("sale_global_id", "sale_id", EntityKind::Sale),
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
    ],
    children: None,
    parent: None,
    notify: true,
};

static DRIVER_RETURN: EntityDescriptor = EntityDescriptor {
    kind: EntityKind::DriverReturn,
    name: "driver_return",
    table: "driver_returns",
    scope: Scope::Branch,
    fields: &[
        required("quantity", Real),
        frozen("unit_price", Real, false),
        field("amount", Real),
        frozen("returned_at", Timestamp, false),
        frozen("source", Text, false),
        field("notes", Text),
    ],
    references: &[
        fatal("assignment_global_id", "assignment_id", EntityKind::DriverAssignment),
        fatal("employee_global_id", "employee_id", EntityKind::Employee),
        detach("registered_by_global_id", "registered_by_id", EntityKind::Employee),
        detach("shift_global_id", "shift_id", EntityKind::Shift),
    ],
    children: None,
    parent: None,
    notify: true,
};
