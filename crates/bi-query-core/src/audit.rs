//! Audit Sink: append-only record of every query decision/outcome and
//! every ETL quality report.
//!
//! Grounded directly on the teacher's `SqliteMemoryStore`
//! (`Arc<Mutex<Connection>>`, a `with_conn` closure helper, row-mapping
//! functions colocated with the query that produces them) generalized from
//! a hypergraph node/edge store to two flat append-only tables. Modification
//! is forbidden at this layer (spec.md §4.15): there is deliberately no
//! `update`/`delete` method here.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::RoutingAction;
use crate::error::{Error, Result};
use crate::quality::QualityReport;

/// One audit record per query, per spec.md §4.15's field list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub trace_id: Uuid,
    pub principal_id: String,
    pub nl_text: String,
    pub sql_executed: Option<String>,
    pub decision: String,
    pub outcome: RoutingAction,
    pub score: Option<f64>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_records (
    trace_id TEXT NOT NULL,
    principal_id TEXT NOT NULL,
    nl_text TEXT NOT NULL,
    sql_executed TEXT,
    decision TEXT NOT NULL,
    outcome TEXT NOT NULL,
    score REAL,
    duration_ms INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (trace_id)
);

CREATE TABLE IF NOT EXISTS quality_reports (
    report_id TEXT NOT NULL PRIMARY KEY,
    batch_id TEXT NOT NULL UNIQUE,
    source TEXT NOT NULL,
    entity TEXT NOT NULL,
    created_at TEXT NOT NULL,
    report_json TEXT NOT NULL
);
";

/// Append-only persistence for audit records and quality reports. Backed by
/// a single SQLite connection guarded by a mutex (teacher's
/// `SqliteMemoryStore` shape); callers are expected to be infrequent
/// relative to query volume, so a single connection is sufficient.
pub struct AuditSink {
    conn: Arc<Mutex<Connection>>,
}

impl AuditSink {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("audit sink lock poisoned: {e}")))?;
        f(&conn).map_err(|e| Error::AuditSink(e.to_string()))
    }

    /// Appends one query audit record. There is no update path: every call
    /// inserts a brand-new row keyed by `trace_id`.
    pub fn record_query(&self, record: &AuditRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_records (
                    trace_id, principal_id, nl_text, sql_executed, decision,
                    outcome, score, duration_ms, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.trace_id.to_string(),
                    record.principal_id,
                    record.nl_text,
                    record.sql_executed,
                    record.decision,
                    serde_json::to_string(&record.outcome).unwrap_or_default(),
                    record.score,
                    record.duration_ms as i64,
                    record.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Appends a quality report, idempotent by `batch_id` (spec.md V4):
    /// `INSERT OR IGNORE` on the unique `batch_id` index means a duplicate
    /// publish of the same sync event persists no second row.
    pub fn record_quality_report(&self, report: &QualityReport) -> Result<bool> {
        self.with_conn(|conn| {
            let report_json = serde_json::to_string(report)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            let changed = conn.execute(
                "INSERT OR IGNORE INTO quality_reports (
                    report_id, batch_id, source, entity, created_at, report_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    report.batch_id.to_string(),
                    report.source,
                    report.entity,
                    Utc::now().to_rfc3339(),
                    report_json,
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Returns the already-persisted report for `batch_id`, if any — used
    /// by the Quality Validator to short-circuit duplicate sync events
    /// before doing any check work (spec.md V4 / 4.13's idempotent writes).
    pub fn find_quality_report(&self, batch_id: Uuid) -> Result<Option<QualityReport>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT report_json FROM quality_reports WHERE batch_id = ?1",
                params![batch_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .and_then(|maybe_json| match maybe_json {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(Error::Serialization),
            None => Ok(None),
        })
    }

    pub fn count_records(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))
        })
    }

    pub fn count_quality_reports(&self, batch_id: Uuid) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM quality_reports WHERE batch_id = ?1",
                params![batch_id.to_string()],
                |row| row.get(0),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{QualityCounts, QualityScores, QualityViolationCounts};

    fn sample_record() -> AuditRecord {
        AuditRecord {
            trace_id: Uuid::new_v4(),
            principal_id: "analyst-1".to_string(),
            nl_text: "total revenue last month".to_string(),
            sql_executed: Some("SELECT 1".to_string()),
            decision: "answered".to_string(),
            outcome: RoutingAction::Answered,
            score: Some(88.0),
            duration_ms: 120,
            timestamp: Utc::now(),
        }
    }

    fn sample_report(batch_id: Uuid) -> QualityReport {
        QualityReport {
            batch_id,
            source: "erp".to_string(),
            entity: "invoices".to_string(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            counts: QualityCounts::default(),
            scores: QualityScores::default(),
            violation_counts: QualityViolationCounts::default(),
            current_row_count: 0,
            validation_passed: true,
            failure_reasons: Vec::new(),
        }
    }

    #[test]
    fn records_are_append_only_and_queryable() {
        let sink = AuditSink::open_in_memory().unwrap();
        sink.record_query(&sample_record()).unwrap();
        sink.record_query(&sample_record()).unwrap();
        assert_eq!(sink.count_records().unwrap(), 2);
    }

    #[test]
    fn quality_report_insert_is_idempotent_by_batch_id() {
        let sink = AuditSink::open_in_memory().unwrap();
        let batch_id = Uuid::new_v4();
        let first = sink.record_quality_report(&sample_report(batch_id)).unwrap();
        let second = sink.record_quality_report(&sample_report(batch_id)).unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(sink.count_quality_reports(batch_id).unwrap(), 1);
    }

    #[test]
    fn find_quality_report_round_trips() {
        let sink = AuditSink::open_in_memory().unwrap();
        let batch_id = Uuid::new_v4();
        sink.record_quality_report(&sample_report(batch_id)).unwrap();

        let found = sink.find_quality_report(batch_id).unwrap().unwrap();
        assert_eq!(found.batch_id, batch_id);
        assert_eq!(found.entity, "invoices");
    }
}
