//! ETL Quality Validator: runs after every ingest, checking completeness,
//! uniqueness, referential integrity, and range validity against the
//! target table, then persists a [`QualityReport`] and alerts on failure.
//!
//! The `QualityCheck` trait mirrors the pack's rule-engine shape (stateless,
//! `Send + Sync`, returns a typed outcome — the same posture as
//! [`crate::policy`]'s injection-rule table and `sql-query-analyzer`'s
//! `Rule` trait) generalized from a closed rule list to four named checks.
//! Persistence is grounded on [`crate::audit::AuditSink`]'s
//! `INSERT OR IGNORE`-by-key idempotency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::bus::{subjects, EventBus};
use crate::error::{Error, Result};
use crate::executor::Row;

/// A domain rule checked by the Range Validity check.
#[derive(Debug, Clone)]
pub enum RangeRule {
    /// `column` must be >= 0 where present.
    NonNegative(String),
    /// `column` (a date/timestamp) must not be more than `max_days_future`
    /// days ahead of now.
    NotTooFarInFuture { column: String, max_days_future: i64 },
}

/// One `sync.completed` event, carrying everything the validator needs to
/// run its four checks without reaching back into the connector.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub batch_id: Uuid,
    pub source: String,
    pub entity: String,
    pub required_columns: Vec<String>,
    pub business_key: (String, String),
    pub range_rules: Vec<RangeRule>,
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub quarantined: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Read access to the ingested table a sync event targets. The real
/// warehouse/system-table access is out of scope (spec.md §1); this trait
/// is the seam a production adapter plugs into, grounded on
/// [`crate::schema::SchemaCatalog`]'s "trait instead of hardcoded set"
/// posture.
#[async_trait]
pub trait QualityDataSource: Send + Sync {
    /// Up to `cap` rows of `entity`, restricted to `required_columns` plus
    /// whatever the check needs to evaluate range rules.
    async fn sample_rows(&self, entity: &str, cap: usize) -> Result<Vec<Row>>;

    /// Number of rows in `entity` whose `(source, source_id)` business key
    /// is duplicated.
    async fn count_duplicates(&self, entity: &str, business_key: (&str, &str)) -> Result<u64>;

    /// Number of rows in `entity` whose declared foreign keys do not
    /// resolve.
    async fn count_referential_violations(&self, entity: &str) -> Result<u64>;

    /// Current total row count for `entity`, used to report
    /// `current_row_count` on the persisted report.
    async fn row_count(&self, entity: &str) -> Result<u64>;
}

/// Result of running one [`QualityCheck`].
#[derive(Debug, Clone, Copy)]
pub struct CheckOutcome {
    pub score: f64,
    pub violation_count: u64,
    /// Whether this outcome alone should force `validation_passed = false`
    /// regardless of the overall mean (spec.md only states an explicit
    /// alert threshold for completeness; the other three checks' "gross"
    /// thresholds are this crate's documented interpretation — see
    /// DESIGN.md).
    pub critical: bool,
}

#[async_trait]
pub trait QualityCheck: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, source: &dyn QualityDataSource, event: &SyncEvent) -> Result<CheckOutcome>;
}

/// Fraction of non-null required-column cells over a capped sample.
/// Score = 100·(1 − missing_rate). Alert (critical) if missing_rate > 5%.
pub struct CompletenessCheck {
    pub sample_cap: usize,
    pub missing_threshold: f64,
}

#[async_trait]
impl QualityCheck for CompletenessCheck {
    fn name(&self) -> &'static str {
        "completeness"
    }

    async fn run(&self, source: &dyn QualityDataSource, event: &SyncEvent) -> Result<CheckOutcome> {
        let rows = source.sample_rows(&event.entity, self.sample_cap).await?;
        if rows.is_empty() || event.required_columns.is_empty() {
            return Ok(CheckOutcome {
                score: 100.0,
                violation_count: 0,
                critical: false,
            });
        }

        let total_cells = rows.len() * event.required_columns.len();
        let missing_cells: usize = rows
            .iter()
            .map(|row| {
                event
                    .required_columns
                    .iter()
                    .filter(|col| {
                        matches!(row.get(col.as_str()), None | Some(serde_json::Value::Null))
                    })
                    .count()
            })
            .sum();

        let missing_rate = missing_cells as f64 / total_cells as f64;
        let score = 100.0 * (1.0 - missing_rate);

        Ok(CheckOutcome {
            score,
            violation_count: missing_cells as u64,
            critical: missing_rate > self.missing_threshold,
        })
    }
}

/// Duplicate count by business key `(source, source_id)`.
pub struct UniquenessCheck;

#[async_trait]
impl QualityCheck for UniquenessCheck {
    fn name(&self) -> &'static str {
        "uniqueness"
    }

    async fn run(&self, source: &dyn QualityDataSource, event: &SyncEvent) -> Result<CheckOutcome> {
        let duplicates = source
            .count_duplicates(
                &event.entity,
                (event.business_key.0.as_str(), event.business_key.1.as_str()),
            )
            .await?;

        if duplicates == 0 {
            return Ok(CheckOutcome {
                score: 100.0,
                violation_count: 0,
                critical: false,
            });
        }

        let processed = event.processed.max(1) as f64;
        let ratio = duplicates as f64 / processed;
        // "95 if no dups [sic: few dups]; <95 if gross" — gross duplicate
        // rates (over 10% of the processed batch) scale the score down
        // from the flat 95, floored at 0.
        let score = if ratio > 0.10 {
            (95.0 - 200.0 * (ratio - 0.10)).max(0.0)
        } else {
            95.0
        };

        Ok(CheckOutcome {
            score,
            violation_count: duplicates,
            critical: ratio > 0.20,
        })
    }
}

/// Rows whose declared foreign keys do not resolve.
pub struct ReferentialIntegrityCheck;

#[async_trait]
impl QualityCheck for ReferentialIntegrityCheck {
    fn name(&self) -> &'static str {
        "integrity"
    }

    async fn run(&self, source: &dyn QualityDataSource, event: &SyncEvent) -> Result<CheckOutcome> {
        let violations = source.count_referential_violations(&event.entity).await?;
        let score = if violations == 0 { 100.0 } else { 80.0 };
        let processed = event.processed.max(1);
        Ok(CheckOutcome {
            score,
            violation_count: violations,
            critical: violations * 10 > processed, // more than 10% unresolved
        })
    }
}

/// Domain rules: amounts >= 0 where required; dates not more than 30 days
/// in the future where applicable. Score = 100 − 10·#failed_rules, floored
/// at 0.
pub struct RangeValidityCheck {
    pub sample_cap: usize,
}

#[async_trait]
impl QualityCheck for RangeValidityCheck {
    fn name(&self) -> &'static str {
        "range"
    }

    async fn run(&self, source: &dyn QualityDataSource, event: &SyncEvent) -> Result<CheckOutcome> {
        let rows = source.sample_rows(&event.entity, self.sample_cap).await?;
        let mut failed_rules = 0u64;

        for rule in &event.range_rules {
            match rule {
                RangeRule::NonNegative(column) => {
                    let any_negative = rows.iter().any(|row| {
                        row.get(column)
                            .and_then(|v| v.as_f64())
                            .map(|n| n < 0.0)
                            .unwrap_or(false)
                    });
                    if any_negative {
                        failed_rules += 1;
                    }
                }
                RangeRule::NotTooFarInFuture { column, max_days_future } => {
                    let cutoff = Utc::now() + chrono::Duration::days(*max_days_future);
                    let any_too_far = rows.iter().any(|row| {
                        row.get(column)
                            .and_then(|v| v.as_str())
                            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                            .map(|dt| dt.with_timezone(&Utc) > cutoff)
                            .unwrap_or(false)
                    });
                    if any_too_far {
                        failed_rules += 1;
                    }
                }
            }
        }

        let score = (100.0 - 10.0 * failed_rules as f64).max(0.0);
        Ok(CheckOutcome {
            score,
            violation_count: failed_rules,
            critical: failed_rules > 5,
        })
    }
}

/// Per-entity processed/inserted/updated/quarantined counts reported by
/// the upstream connector's sync event.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QualityCounts {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub quarantined: u64,
}

/// Sub-scores and overall score. `None` sub-scores mean that check did not
/// participate in `overall` (spec.md V1: "missing sub-scores do not
/// participate").
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QualityScores {
    pub completeness: Option<f64>,
    pub uniqueness: Option<f64>,
    pub integrity: Option<f64>,
    pub range: Option<f64>,
    pub overall: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QualityViolationCounts {
    pub missing: u64,
    pub duplicate: u64,
    pub integrity: u64,
    pub range: u64,
    pub anomaly: u64,
}

/// Persisted, append-only quality result for one sync batch (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub batch_id: Uuid,
    pub source: String,
    pub entity: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub counts: QualityCounts,
    pub scores: QualityScores,
    pub violation_counts: QualityViolationCounts,
    pub current_row_count: u64,
    pub validation_passed: bool,
    pub failure_reasons: Vec<String>,
}

/// Wire shape of one `range_rules` entry on the `etl.sync.completed` event,
/// since [`RangeRule`] itself carries no serde impl (it is a small, closed
/// domain enum used only inside this crate's checks).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RangeRuleWire {
    NonNegative { column: String },
    NotTooFarInFuture { column: String, max_days_future: i64 },
}

impl From<RangeRuleWire> for RangeRule {
    fn from(wire: RangeRuleWire) -> Self {
        match wire {
            RangeRuleWire::NonNegative { column } => RangeRule::NonNegative(column),
            RangeRuleWire::NotTooFarInFuture { column, max_days_future } => {
                RangeRule::NotTooFarInFuture { column, max_days_future }
            }
        }
    }
}

/// Wire payload an upstream connector publishes to
/// [`crate::bus::subjects::SYNC_COMPLETED`]; the ETL worker loop
/// deserializes this and converts it into a [`SyncEvent`] before handing it
/// to [`QualityValidator::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEventWire {
    pub batch_id: Uuid,
    pub source: String,
    pub entity: String,
    pub required_columns: Vec<String>,
    pub business_key: (String, String),
    #[serde(default)]
    pub range_rules: Vec<RangeRuleWire>,
    pub processed: u64,
    #[serde(default)]
    pub inserted: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub quarantined: u64,
    pub occurred_at: DateTime<Utc>,
}

impl From<SyncEventWire> for SyncEvent {
    fn from(wire: SyncEventWire) -> Self {
        SyncEvent {
            batch_id: wire.batch_id,
            source: wire.source,
            entity: wire.entity,
            required_columns: wire.required_columns,
            business_key: wire.business_key,
            range_rules: wire.range_rules.into_iter().map(RangeRule::from).collect(),
            processed: wire.processed,
            inserted: wire.inserted,
            updated: wire.updated,
            quarantined: wire.quarantined,
            occurred_at: wire.occurred_at,
        }
    }
}

/// Parses one bus payload into a [`SyncEvent`], the single conversion point
/// the ETL worker loop relies on.
pub fn parse_sync_event(payload: &serde_json::Value) -> Result<SyncEvent> {
    let wire: SyncEventWire = serde_json::from_value(payload.clone())?;
    Ok(wire.into())
}

/// Configuration for the validator, mirroring spec.md §6's `quality.*`
/// config keys.
#[derive(Debug, Clone, Copy)]
pub struct QualityConfig {
    pub passing_threshold: f64,
    pub missing_threshold: f64,
    pub sample_cap: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            passing_threshold: 70.0,
            missing_threshold: 0.05,
            sample_cap: 10_000,
        }
    }
}

/// Orchestrates the four checks, scores the batch, and persists+alerts.
pub struct QualityValidator {
    config: QualityConfig,
    checks: Vec<Box<dyn QualityCheck>>,
}

impl QualityValidator {
    pub fn new(config: QualityConfig) -> Self {
        let checks: Vec<Box<dyn QualityCheck>> = vec![
            Box::new(CompletenessCheck {
                sample_cap: config.sample_cap,
                missing_threshold: config.missing_threshold,
            }),
            Box::new(UniquenessCheck),
            Box::new(ReferentialIntegrityCheck),
            Box::new(RangeValidityCheck {
                sample_cap: config.sample_cap,
            }),
        ];
        Self { config, checks }
    }

    /// Runs every check against `event`, persists exactly one report per
    /// `batch_id` (spec.md V4), and publishes `etl.quality.alert` when the
    /// report fails or sits in the warning band.
    ///
    /// A check that errors internally is skipped and logged rather than
    /// poisoning the overall score (spec.md §4.13's failure semantics); if
    /// every check errors, no report is persisted.
    pub async fn validate(
        &self,
        event: &SyncEvent,
        source: &dyn QualityDataSource,
        audit: &AuditSink,
        bus: &EventBus,
    ) -> Result<QualityReport> {
        if let Some(existing) = audit.find_quality_report(event.batch_id)? {
            return Ok(existing);
        }

        let started_at = Utc::now();
        let mut scores = QualityScores::default();
        let mut violation_counts = QualityViolationCounts::default();
        let mut failure_reasons = Vec::new();
        let mut participating = Vec::new();
        let mut any_critical = false;

        for check in &self.checks {
            match check.run(source, event).await {
                Ok(outcome) => {
                    participating.push(outcome.score);
                    any_critical |= outcome.critical;
                    match check.name() {
                        "completeness" => {
                            scores.completeness = Some(outcome.score);
                            violation_counts.missing = outcome.violation_count;
                        }
                        "uniqueness" => {
                            scores.uniqueness = Some(outcome.score);
                            violation_counts.duplicate = outcome.violation_count;
                        }
                        "integrity" => {
                            scores.integrity = Some(outcome.score);
                            violation_counts.integrity = outcome.violation_count;
                        }
                        "range" => {
                            scores.range = Some(outcome.score);
                            violation_counts.range = outcome.violation_count;
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(check = check.name(), error = %e, "quality check failed; skipping");
                    failure_reasons.push(format!("{} check failed: {e}", check.name()));
                }
            }
        }

        if participating.is_empty() {
            return Err(Error::Internal(
                "all quality checks failed; no report can be persisted".to_string(),
            ));
        }

        scores.overall = participating.iter().sum::<f64>() / participating.len() as f64;
        let validation_passed = scores.overall >= self.config.passing_threshold && !any_critical;
        if !validation_passed {
            failure_reasons.push(format!(
                "overall score {:.1} below threshold or a critical check failed",
                scores.overall
            ));
        }

        let current_row_count = source.row_count(&event.entity).await.unwrap_or(0);

        let report = QualityReport {
            batch_id: event.batch_id,
            source: event.source.clone(),
            entity: event.entity.clone(),
            started_at,
            completed_at: Utc::now(),
            counts: QualityCounts {
                processed: event.processed,
                inserted: event.inserted,
                updated: event.updated,
                quarantined: event.quarantined,
            },
            scores,
            violation_counts,
            current_row_count,
            validation_passed,
            failure_reasons,
        };

        audit.record_quality_report(&report)?;
        self.publish_alert(&report, bus).await?;

        Ok(report)
    }

    async fn publish_alert(&self, report: &QualityReport, bus: &EventBus) -> Result<()> {
        let level = if !report.validation_passed {
            "error"
        } else if report.scores.overall < 80.0 {
            "warn"
        } else {
            return Ok(());
        };

        bus.publish(
            subjects::QUALITY_ALERT,
            serde_json::json!({
                "level": level,
                "type": "quality_report",
                "batch_id": report.batch_id,
                "entity": report.entity,
                "quality_score": report.scores.overall,
                "details": report.failure_reasons,
            }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;

    struct FakeSource {
        rows: Vec<Row>,
        duplicates: u64,
        integrity_violations: u64,
        row_count: u64,
        fail_integrity: bool,
    }

    #[async_trait]
    impl QualityDataSource for FakeSource {
        async fn sample_rows(&self, _entity: &str, _cap: usize) -> Result<Vec<Row>> {
            Ok(self.rows.clone())
        }

        async fn count_duplicates(&self, _entity: &str, _business_key: (&str, &str)) -> Result<u64> {
            Ok(self.duplicates)
        }

        async fn count_referential_violations(&self, _entity: &str) -> Result<u64> {
            if self.fail_integrity {
                return Err(Error::DownstreamUnavailable("catalog offline".to_string()));
            }
            Ok(self.integrity_violations)
        }

        async fn row_count(&self, _entity: &str) -> Result<u64> {
            Ok(self.row_count)
        }
    }

    fn row(patient_id: Option<&str>) -> Row {
        let mut r = Row::new();
        r.insert(
            "patient_id".to_string(),
            patient_id
                .map(|v| serde_json::Value::String(v.to_string()))
                .unwrap_or(serde_json::Value::Null),
        );
        r
    }

    fn event(batch_id: Uuid, processed: u64) -> SyncEvent {
        SyncEvent {
            batch_id,
            source: "erp".to_string(),
            entity: "invoices".to_string(),
            required_columns: vec!["patient_id".to_string()],
            business_key: ("source".to_string(), "source_id".to_string()),
            range_rules: vec![RangeRule::NonNegative("amount".to_string())],
            processed,
            inserted: processed,
            updated: 0,
            quarantined: 0,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn twelve_percent_null_fails_completeness_and_overall() {
        // 100 rows, 12 with a null patient_id -> missing_rate 0.12 > 5%.
        let mut rows: Vec<Row> = (0..88).map(|_| row(Some("p1"))).collect();
        rows.extend((0..12).map(|_| row(None)));

        let source = FakeSource {
            rows,
            duplicates: 0,
            integrity_violations: 0,
            row_count: 100,
            fail_integrity: false,
        };

        let audit = AuditSink::open_in_memory().unwrap();
        let bus = EventBus::new(BusConfig::default());
        let sub = bus.subscribe_durable("alerts", subjects::QUALITY_ALERT).await;

        let validator = QualityValidator::new(QualityConfig::default());
        let batch_id = Uuid::new_v4();
        let report = validator
            .validate(&event(batch_id, 100), &source, &audit, &bus)
            .await
            .unwrap();

        assert!(report.scores.completeness.unwrap() < 95.0);
        assert!(!report.validation_passed);
        assert!(report.violation_counts.missing > 0);

        let alert = sub.receive(std::time::Duration::from_secs(1)).await.unwrap();
        assert_eq!(alert.payload["level"], "error");
    }

    #[tokio::test]
    async fn second_publish_of_same_batch_persists_no_new_report() {
        let source = FakeSource {
            rows: vec![row(Some("p1"))],
            duplicates: 0,
            integrity_violations: 0,
            row_count: 1,
            fail_integrity: false,
        };
        let audit = AuditSink::open_in_memory().unwrap();
        let bus = EventBus::new(BusConfig::default());
        let validator = QualityValidator::new(QualityConfig::default());
        let batch_id = Uuid::new_v4();

        validator
            .validate(&event(batch_id, 1), &source, &audit, &bus)
            .await
            .unwrap();
        validator
            .validate(&event(batch_id, 1), &source, &audit, &bus)
            .await
            .unwrap();

        assert_eq!(audit.count_quality_reports(batch_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn failing_check_is_skipped_without_poisoning_report() {
        let source = FakeSource {
            rows: vec![row(Some("p1"))],
            duplicates: 0,
            integrity_violations: 0,
            row_count: 1,
            fail_integrity: true,
        };
        let audit = AuditSink::open_in_memory().unwrap();
        let bus = EventBus::new(BusConfig::default());
        let validator = QualityValidator::new(QualityConfig::default());

        let report = validator
            .validate(&event(Uuid::new_v4(), 1), &source, &audit, &bus)
            .await
            .unwrap();

        assert!(report.scores.integrity.is_none());
        assert!(report.failure_reasons.iter().any(|r| r.contains("integrity")));
    }

    #[test]
    fn parses_sync_event_wire_payload() {
        let batch_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "batch_id": batch_id,
            "source": "erp",
            "entity": "invoices",
            "required_columns": ["patient_id"],
            "business_key": ["source", "source_id"],
            "range_rules": [
                {"kind": "non_negative", "column": "amount"},
                {"kind": "not_too_far_in_future", "column": "due_date", "max_days_future": 30},
            ],
            "processed": 10,
            "inserted": 10,
            "updated": 0,
            "quarantined": 0,
            "occurred_at": Utc::now().to_rfc3339(),
        });

        let event = parse_sync_event(&payload).unwrap();
        assert_eq!(event.batch_id, batch_id);
        assert_eq!(event.range_rules.len(), 2);
    }
}
