//! Per-changeset apply metrics.
//!
//! Opt-in per briefcase; while enabled, every changeset applied via
//! pull/merge produces one [`HealthStat`] record. Purely observational.

/// Metrics for one SQL statement executed while applying a changeset.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementStat {
    /// The executed SQL text.
    pub sql_statement: String,
    /// The operation verb (INSERT, UPDATE, DELETE).
    pub db_operation: String,
    /// Rows the statement affected.
    pub row_count: u64,
    /// Wall-clock time the statement took.
    pub elapsed_ms: f64,
    /// Full table scans the statement's plan performed.
    pub full_table_scans: u64,
}

/// Aggregate metrics for one applied changeset.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStat {
    /// Id of the applied changeset.
    pub changeset_id: String,
    /// Size of the raw changeset payload.
    pub uncompressed_size_bytes: u64,
    /// Rows inserted.
    pub inserted_rows: u64,
    /// Rows updated.
    pub updated_rows: u64,
    /// Rows deleted.
    pub deleted_rows: u64,
    /// Total wall-clock apply time.
    pub total_elapsed_ms: f64,
    /// Total full table scans across all statements.
    pub total_full_table_scans: u64,
    /// Per-statement breakdown.
    pub per_statement_stats: Vec<StatementStat>,
}

/// Collection state owned by a briefcase.
#[derive(Debug, Default)]
pub(crate) struct HealthTracker {
    pub(crate) enabled: bool,
    pub(crate) stats: Vec<HealthStat>,
}
