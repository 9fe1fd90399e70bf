//! Query Pipeline orchestrator: wires every stage in [`StageId::ORDER`]
//! into one `QueryRequest -> QueryResult` flow, and exposes the
//! `QueryService`/`HealthService` trait seam an HTTP/gRPC binary calls
//! into (spec.md §1 explicitly keeps that transport layer out of this
//! crate).
//!
//! Grounded on the teacher's `Orchestrator` (`orchestrator.rs`): a
//! `*Config`-driven struct owning every stage's handle, run through a
//! single top-level `execute`-style method that records per-stage
//! timings and short-circuits on the first terminal outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::audit::AuditRecord;
use crate::confidence::{self, ConfidenceBand, ConfidenceFactors, ConfidenceScore};
use crate::config::GatewayConfig;
use crate::corrector::SelfCorrector;
use crate::envelope::{Envelope, QueryRequest, QueryResult, QueryTrace, RoutingAction, ServiceBundle};
use crate::error::{Error, Result};
use crate::executor::WarehouseConnection;
use crate::hallucination::{HallucinationGuard, Verdict};
use crate::llm::LLMClient;
use crate::locale::{Locale, LocaleDetector, NumberFormatter, Translator};
use crate::module::{Module, Predict, PredictConfig};
use crate::policy::{MaskType, PolicyDecision, PolicyGate, Principal, QueryShape};
use crate::schema::{SchemaCatalog, SchemaRetriever, StaticSchemaCatalog};
use crate::sqlgen::{SqlCandidate, SqlGeneration, SqlGenerationInputs};
use crate::sqlsafety::{ParameterizedSql, SqlValidator};
use crate::supervisor::{HealthSnapshot, Stage, StageId, Supervisor};
use crate::terminology::TerminologyNormalizer;
use crate::viz::{ResultShape, VisualizationRouter};

/// The API-boundary seam a transport binary (axum, actix, tonic, ...) calls
/// into. Nothing in this crate depends on a specific transport.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn handle(&self, request: QueryRequest) -> Result<QueryResult>;
}

/// The other half of the seam: a liveness/readiness probe endpoint.
#[async_trait]
pub trait HealthService: Send + Sync {
    async fn health(&self) -> HealthSnapshot;
}

enum ExecutedQuery {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    TimedOut,
}

struct SuccessfulRun {
    candidate: SqlCandidate,
    rationale: String,
    parameterized: ParameterizedSql,
    columns: Vec<String>,
    rows: Vec<Vec<serde_json::Value>>,
}

/// Concrete, stateful wiring of all 13 query-pipeline stages. One instance
/// serves many requests; per-request state (the LLM/warehouse/bus/audit
/// handles) is read from each request's own [`Envelope::services`] rather
/// than from a field here, per the envelope design note against
/// process-wide singletons — the `services` field below exists only to
/// build the fixed probe [`Envelope`] [`HealthService`] checks against.
pub struct GatewayPipeline {
    config: GatewayConfig,
    services: Arc<ServiceBundle>,
    policy_gate: PolicyGate,
    hallucination_guard: HallucinationGuard,
    terminology: TerminologyNormalizer,
    schema_retriever: SchemaRetriever,
    translator: Translator,
    self_corrector: SelfCorrector,
    supervisor: Arc<Supervisor>,
    health_envelope: Envelope,
}

impl GatewayPipeline {
    /// Builds a pipeline with the reference [`StaticSchemaCatalog`] and a
    /// fully-open mask policy (no columns masked). Use
    /// [`GatewayPipeline::with_catalog`] and [`GatewayPipeline::with_mask_policy`]
    /// to supply a real deployment's schema and masking rules.
    pub fn new(config: GatewayConfig, services: Arc<ServiceBundle>) -> Self {
        Self::with_catalog(config, services, Box::new(StaticSchemaCatalog::new()))
    }

    pub fn with_catalog(
        config: GatewayConfig,
        services: Arc<ServiceBundle>,
        catalog: Box<dyn SchemaCatalog>,
    ) -> Self {
        let health_envelope = Envelope::new(
            "health-check",
            "system",
            config.locale.default_locale(),
            Duration::from_secs(5),
            services.clone(),
        );

        Self {
            self_corrector: SelfCorrector::new(config.corrector.max_retries),
            config,
            services,
            policy_gate: PolicyGate::default(),
            hallucination_guard: HallucinationGuard::new(256),
            terminology: TerminologyNormalizer::new(),
            schema_retriever: SchemaRetriever::new(catalog, 6, 3),
            translator: Translator::new(),
            supervisor: Arc::new(Supervisor::new(Duration::from_secs(30))),
            health_envelope,
        }
    }

    pub fn with_mask_policy(mut self, mask_policy: HashMap<String, HashMap<String, MaskType>>) -> Self {
        self.policy_gate = PolicyGate::new(mask_policy);
        self
    }

    /// Registers a health probe for every stage in [`StageId::ORDER`].
    /// Separate from construction so tests exercising only [`QueryService`]
    /// can skip it.
    pub async fn register_health_stages(&self) {
        self.supervisor.register(Arc::new(PolicyGateStage)).await;
        self.supervisor.register(Arc::new(LocaleDetectorStage)).await;
        self.supervisor.register(Arc::new(TranslatorStage)).await;
        self.supervisor.register(Arc::new(HallucinationGuardStage)).await;
        self.supervisor.register(Arc::new(TerminologyNormalizerStage)).await;
        self.supervisor.register(Arc::new(SchemaRetrieverStage)).await;
        self.supervisor
            .register(Arc::new(SqlGeneratorStage {
                llm: self.services.llm.clone(),
            }))
            .await;
        self.supervisor.register(Arc::new(SqlValidatorStage)).await;
        self.supervisor
            .register(Arc::new(ExecutorStage {
                warehouse: self.services.warehouse.clone(),
            }))
            .await;
        self.supervisor.register(Arc::new(SelfCorrectorStage)).await;
        self.supervisor.register(Arc::new(VisualizationRouterStage)).await;
        self.supervisor.register(Arc::new(ConfidenceScorerStage)).await;
        self.supervisor.register(Arc::new(FormatterStage)).await;
    }

    /// Runs one request end to end through every stage in [`StageId::ORDER`],
    /// short-circuiting to a reject/clarify/timeout result at the first
    /// stage that calls for it.
    async fn run(&self, request: QueryRequest) -> Result<QueryResult> {
        let started = Instant::now();
        let envelope = request.envelope.clone();
        let mut trace = QueryTrace::new();
        let principal = Principal {
            roles: envelope.roles.iter().cloned().collect(),
        };

        // Stage: Policy Gate, admission pass. No SQL skeleton exists yet, so
        // this call only runs the closed injection-rule table against a
        // placeholder statement — it exists for uniformity with the
        // dispatch order in StageId::ORDER, not as the substantive
        // authorization check. The Gate's real enforcement happens once a
        // skeleton exists, after parameterization below (spec.md §4.7:
        // "the Validator MAY call the Policy Gate... for a final allow
        // decision" — this crate always does, and treats it as the
        // authoritative call).
        let stage_start = Instant::now();
        let admission = QueryShape {
            proposed_sql_skeleton: "SELECT 1".to_string(),
            source_tables_touched: Vec::new(),
        };
        if let PolicyDecision::Deny { reason } = self.policy_gate.allow(&admission, &principal) {
            trace.record_stage(stage_name(StageId::PolicyGate), stage_start.elapsed());
            tracing::debug!(trace_id = %envelope.trace_id, reason = %reason, "policy gate denied admission");
            let message = crate::error::localized_kind_message("policy_denied", envelope.locale);
            return self.finish_rejected(&request, message, trace, started).await;
        }
        trace.record_stage(stage_name(StageId::PolicyGate), stage_start.elapsed());

        if envelope.is_cancelled() {
            return self.finish_timed_out(&request, trace, started).await;
        }

        // Stage: Locale Detector
        let stage_start = Instant::now();
        let detection = LocaleDetector::detect(&request.nl_text, request.explicit_locale);
        trace.record_stage(stage_name(StageId::LocaleDetector), stage_start.elapsed());

        // Stage: Translator (Arabic only)
        let stage_start = Instant::now();
        let working_text = if detection.locale == Locale::Ar {
            self.translator.translate(&request.nl_text)
        } else {
            request.nl_text.clone()
        };
        trace.record_stage(stage_name(StageId::Translator), stage_start.elapsed());

        // Stage: Hallucination Guard
        let stage_start = Instant::now();
        let verdict = self.hallucination_guard.classify(&working_text, detection.locale);
        trace.record_stage(stage_name(StageId::HallucinationGuard), stage_start.elapsed());
        match verdict {
            Verdict::OffTopic { reason } => {
                return self.finish_rejected(&request, reason, trace, started).await;
            }
            Verdict::Ambiguous { clarification } => {
                return self.finish_clarify(&request, clarification, trace, started).await;
            }
            Verdict::OnTopic => {}
        }

        // Stage: Terminology Normalizer
        let stage_start = Instant::now();
        let normalization = self.terminology.normalize(&working_text, detection.locale);
        trace.record_stage(stage_name(StageId::TerminologyNormalizer), stage_start.elapsed());

        // Stage: Schema Retriever
        let stage_start = Instant::now();
        let schema_context = self.schema_retriever.retrieve(&normalization.normalized_text);
        trace.record_stage(stage_name(StageId::SchemaRetriever), stage_start.elapsed());

        let locale_instruction = match detection.locale {
            Locale::En => {
                "Render any literal dates or numbers with plain Western digits.".to_string()
            }
            Locale::Ar => {
                "Render any literal dates or numbers with plain Western digits; the caller \
formats them for display."
                    .to_string()
            }
        };

        let predictor = Predict::<SqlGeneration>::with_lm(envelope.services.llm.clone())
            .with_config(PredictConfig::new().with_temperature(self.config.llm.temperature.min(0.2)));

        let mut question = normalization.normalized_text.clone();
        let mut attempts = Vec::new();

        let run_outcome = loop {
            if envelope.is_cancelled() {
                return self.finish_timed_out(&request, trace, started).await;
            }

            // Stage: Text-to-SQL Generator. `select!`-ed against
            // `envelope.cancelled()` so a deadline expiry or client
            // disconnect cancels the in-flight LLM call rather than waiting
            // it out (spec.md §5: "client disconnects... cancel in-flight
            // work").
            let stage_start = Instant::now();
            let generation = tokio::select! {
                res = predictor.forward(SqlGenerationInputs {
                    question: question.clone(),
                    schema_context: schema_context.to_prompt_fragment(),
                    locale_instruction: locale_instruction.clone(),
                }) => res,
                _ = envelope.cancelled() => {
                    trace.record_stage(stage_name(StageId::SqlGenerator), stage_start.elapsed());
                    return self.finish_timed_out(&request, trace, started).await;
                }
            };
            trace.record_stage(stage_name(StageId::SqlGenerator), stage_start.elapsed());

            let generation = match generation {
                Ok(g) => g,
                Err(e) => {
                    tracing::debug!(trace_id = %envelope.trace_id, error = %e, "sql generation failed");
                    let message =
                        crate::error::localized_kind_message("sql_generation_failed", detection.locale);
                    return self.finish_rejected(&request, message, trace, started).await;
                }
            };

            let rationale = generation.rationale;
            let candidate = SqlCandidate {
                text: generation.sql,
                detected_intent: generation.detected_intent,
                intent_confidence: generation.intent_confidence,
                schema_matches: schema_context.tables.iter().map(|t| t.name.clone()).collect(),
            };

            if !candidate.is_usable() {
                tracing::debug!(trace_id = %envelope.trace_id, rationale = %rationale, "sql candidate not usable");
                let message =
                    crate::error::localized_kind_message("sql_candidate_unusable", detection.locale);
                return self.finish_clarify(&request, message, trace, started).await;
            }

            // Stage: SQL Validator / Parameterizer
            let stage_start = Instant::now();
            let validation = SqlValidator::validate_read_only(&candidate.text);
            let parameterized = SqlValidator::parameterize(&candidate.text);
            trace.record_stage(stage_name(StageId::SqlValidator), stage_start.elapsed());

            if !validation.is_safe {
                let error = Error::SqlUnsafe(validation.warnings.join("; "));
                match self.self_corrector.next_attempt(&attempts, &error) {
                    Some(attempt) => {
                        question = format!(
                            "{}\n\nThe previous attempt was rejected: {}. Produce a corrected \
read-only SELECT.",
                            normalization.normalized_text, attempt.feedback
                        );
                        trace.retries += 1;
                        attempts.push(attempt);
                        continue;
                    }
                    None => {
                        tracing::debug!(trace_id = %envelope.trace_id, error = %error, "sql unsafe after exhausting retries");
                        let message =
                            crate::error::localized_kind_message(error.kind(), detection.locale);
                        return self.finish_rejected(&request, message, trace, started).await;
                    }
                }
            }

            // Policy Gate, validation pass — the real skeleton now exists.
            let stage_start = Instant::now();
            let shape = QueryShape {
                proposed_sql_skeleton: parameterized.text_with_placeholders.clone(),
                source_tables_touched: schema_context.tables.iter().map(|t| t.name.clone()).collect(),
            };
            let decision = self.policy_gate.allow(&shape, &principal);
            trace.record_stage("policy_gate_validation", stage_start.elapsed());
            if let PolicyDecision::Deny { reason } = decision {
                tracing::debug!(trace_id = %envelope.trace_id, reason = %reason, "policy gate denied validated query");
                let message = crate::error::localized_kind_message("policy_denied", detection.locale);
                return self.finish_rejected(&request, message, trace, started).await;
            }

            // Stage: Executor
            let stage_start = Instant::now();
            let execution = self.execute_and_mask(&envelope, &parameterized, &principal).await;
            trace.record_stage(stage_name(StageId::Executor), stage_start.elapsed());

            match execution {
                Ok(ExecutedQuery::TimedOut) => {
                    return self.finish_timed_out(&request, trace, started).await;
                }
                Ok(ExecutedQuery::Rows { columns, rows }) => {
                    break SuccessfulRun {
                        candidate,
                        rationale,
                        parameterized,
                        columns,
                        rows,
                    };
                }
                Err(e) => match self.self_corrector.next_attempt(&attempts, &e) {
                    Some(attempt) => {
                        question = format!(
                            "{}\n\nExecution failed: {}. Produce a corrected read-only SELECT.",
                            normalization.normalized_text, attempt.feedback
                        );
                        trace.retries += 1;
                        attempts.push(attempt);
                        continue;
                    }
                    None => {
                        tracing::debug!(trace_id = %envelope.trace_id, error = %e, "execution failed after exhausting retries");
                        let message = crate::error::localized_kind_message(e.kind(), detection.locale);
                        return self.finish_rejected(&request, message, trace, started).await;
                    }
                },
            }
        };

        // Stage: Visualization Router
        let stage_start = Instant::now();
        let shape = build_result_shape(&run_outcome.columns, &run_outcome.rows);
        let chart = VisualizationRouter::route(
            &run_outcome.candidate.detected_intent,
            run_outcome.candidate.intent_confidence,
            &shape,
            title_from_question(&request.nl_text),
            serde_json::json!(run_outcome.rows),
            run_outcome.columns.clone(),
        );
        trace.record_stage(stage_name(StageId::VisualizationRouter), stage_start.elapsed());

        // Stage: Confidence Scorer
        let stage_start = Instant::now();
        let sql_text = &run_outcome.parameterized.text_with_placeholders;
        let join_count = sql_text.to_ascii_uppercase().matches(" JOIN ").count() as u32;
        let subquery_depth = sql_text.to_ascii_lowercase().matches("(select").count() as u32;
        let factors = ConfidenceFactors {
            intent_clarity: run_outcome.candidate.intent_confidence,
            schema_match_quality: schema_context.relevance,
            sql_complexity_penalty: confidence::sql_complexity_penalty(
                sql_text.len(),
                join_count,
                subquery_depth,
            ),
            retry_penalty: confidence::retry_penalty(attempts.len() as u32),
            hallucination_risk: 0.0,
            validation_passed: run_outcome.parameterized.is_safe,
        };
        let score = confidence::score(factors, &self.config.confidence.weights);
        trace.record_stage(stage_name(StageId::ConfidenceScorer), stage_start.elapsed());

        // Stage: Formatter. Numeric row cells and any numeric literal in the
        // explanation are converted to Eastern Arabic digits/separators for
        // an Arabic-locale response (spec.md §4.3, testable property 4);
        // English responses pass through untouched.
        let stage_start = Instant::now();
        let explanation = format_explanation(&run_outcome.rationale, &score, detection.locale);
        let explanation = NumberFormatter::format_text_numerals(&explanation, detection.locale);
        let localized_rows = localize_rows(run_outcome.rows, detection.locale);
        trace.record_stage(stage_name(StageId::Formatter), stage_start.elapsed());

        let result = QueryResult {
            trace_id: envelope.trace_id,
            sql_executed: Some(run_outcome.parameterized.text_with_placeholders),
            parameters: run_outcome.parameterized.parameters,
            columns: run_outcome.columns,
            rows: localized_rows,
            chart_spec: Some(chart),
            confidence: Some(score.clone()),
            routing_action: score.routing_action.terminal_action(),
            explanation,
            trace,
        };

        self.finish(&request, result, started).await
    }

    /// Runs the parameterized query under the envelope's remaining budget,
    /// builds the mask plan from the *returned* column list (the Policy
    /// Gate can only mask columns it has names for, and those names aren't
    /// known before execution), and masks every row before returning.
    async fn execute_and_mask(
        &self,
        envelope: &Envelope,
        parameterized: &ParameterizedSql,
        principal: &Principal,
    ) -> Result<ExecutedQuery> {
        // `select!`-ed against `envelope.cancelled()`, which itself resolves
        // on deadline expiry or an explicit `Envelope::cancel()` call, so a
        // client disconnect cancels the in-flight warehouse query the same
        // way a deadline miss does (spec.md §5).
        let query = envelope
            .services
            .warehouse
            .query(&parameterized.text_with_placeholders, &parameterized.parameters);
        tokio::pin!(query);

        let (columns, rows) = tokio::select! {
            res = &mut query => match res {
                Ok(v) => v,
                Err(e) => return Err(e),
            },
            _ = envelope.cancelled() => return Ok(ExecutedQuery::TimedOut),
        };

        let mask_plan = self.policy_gate.mask_plan(&columns, principal);
        let masked_rows = rows
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|col| {
                        let raw = row.get(col).cloned().unwrap_or(serde_json::Value::Null);
                        match mask_plan.get(col) {
                            Some(mask) => mask.apply(&raw),
                            None => raw,
                        }
                    })
                    .collect()
            })
            .collect();

        Ok(ExecutedQuery::Rows {
            columns,
            rows: masked_rows,
        })
    }

    fn record_audit(&self, request: &QueryRequest, result: &QueryResult, elapsed: Duration) {
        let record = AuditRecord {
            trace_id: result.trace_id,
            principal_id: request.envelope.principal_id.clone(),
            nl_text: request.nl_text.clone(),
            sql_executed: result.sql_executed.clone(),
            decision: routing_action_label(result.routing_action).to_string(),
            outcome: result.routing_action,
            score: result.confidence.as_ref().map(|c| c.overall),
            duration_ms: elapsed.as_millis() as u64,
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = request.envelope.services.audit.record_query(&record) {
            tracing::warn!(trace_id = %result.trace_id, error = %e, "failed to persist audit record");
        }
    }

    async fn finish(&self, request: &QueryRequest, result: QueryResult, started: Instant) -> Result<QueryResult> {
        self.record_audit(request, &result, started.elapsed());
        Ok(result)
    }

    async fn finish_rejected(
        &self,
        request: &QueryRequest,
        reason: impl Into<String>,
        trace: QueryTrace,
        started: Instant,
    ) -> Result<QueryResult> {
        let result = QueryResult::rejected(request.envelope.trace_id, reason, trace);
        self.finish(request, result, started).await
    }

    async fn finish_clarify(
        &self,
        request: &QueryRequest,
        clarification: impl Into<String>,
        trace: QueryTrace,
        started: Instant,
    ) -> Result<QueryResult> {
        let result = QueryResult::clarify(request.envelope.trace_id, clarification, trace);
        self.finish(request, result, started).await
    }

    async fn finish_timed_out(
        &self,
        request: &QueryRequest,
        trace: QueryTrace,
        started: Instant,
    ) -> Result<QueryResult> {
        let result = QueryResult::timed_out(request.envelope.trace_id, trace);
        self.finish(request, result, started).await
    }
}

#[async_trait]
impl QueryService for GatewayPipeline {
    async fn handle(&self, request: QueryRequest) -> Result<QueryResult> {
        self.run(request).await
    }
}

#[async_trait]
impl HealthService for GatewayPipeline {
    async fn health(&self) -> HealthSnapshot {
        self.supervisor.check_health(&self.health_envelope).await
    }
}

fn stage_name(stage: StageId) -> &'static str {
    match stage {
        StageId::PolicyGate => "policy_gate_admission",
        StageId::LocaleDetector => "locale_detector",
        StageId::Translator => "translator",
        StageId::HallucinationGuard => "hallucination_guard",
        StageId::TerminologyNormalizer => "terminology_normalizer",
        StageId::SchemaRetriever => "schema_retriever",
        StageId::SqlGenerator => "sql_generator",
        StageId::SqlValidator => "sql_validator",
        StageId::Executor => "executor",
        StageId::SelfCorrector => "self_corrector",
        StageId::VisualizationRouter => "visualization_router",
        StageId::ConfidenceScorer => "confidence_scorer",
        StageId::Formatter => "formatter",
    }
}

fn routing_action_label(action: RoutingAction) -> &'static str {
    match action {
        RoutingAction::Answered => "answered",
        RoutingAction::Clarify => "clarify",
        RoutingAction::Reject => "reject",
        RoutingAction::Timeout => "timeout",
    }
}

fn title_from_question(nl_text: &str) -> String {
    const MAX_LEN: usize = 64;
    if nl_text.len() <= MAX_LEN {
        nl_text.to_string()
    } else {
        format!("{}…", &nl_text[..MAX_LEN])
    }
}

/// Builds the explanation shown alongside an answered result: the
/// generator's own rationale, plus a localized caveat appended once
/// confidence drops into the warning band.
fn format_explanation(rationale: &str, score: &ConfidenceScore, locale: Locale) -> String {
    match score.routing_action {
        ConfidenceBand::Normal | ConfidenceBand::Clarify => rationale.to_string(),
        ConfidenceBand::Warning => {
            let caveat = match locale {
                Locale::En => "confidence is moderate; please double-check before acting on this",
                Locale::Ar => "الثقة متوسطة؛ يرجى المراجعة قبل اتخاذ إجراء",
            };
            format!("{rationale} ({caveat})")
        }
    }
}

/// Converts every numeric cell in `rows` to an Eastern-Arabic-formatted
/// string for `Locale::Ar`; a no-op for `Locale::En`. Integers format with
/// zero decimals, other numbers with two, matching the Formatter's own
/// "format Western first, convert the whole string" rule (spec.md §9).
fn localize_rows(
    rows: Vec<Vec<serde_json::Value>>,
    locale: Locale,
) -> Vec<Vec<serde_json::Value>> {
    if locale != Locale::Ar {
        return rows;
    }
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|cell| match cell {
                    serde_json::Value::Number(n) => {
                        let formatted = if let Some(i) = n.as_i64() {
                            NumberFormatter::format_number(i as f64, locale, 0)
                        } else {
                            NumberFormatter::format_number(n.as_f64().unwrap_or(0.0), locale, 2)
                        };
                        serde_json::Value::String(formatted)
                    }
                    other => other,
                })
                .collect()
        })
        .collect()
}

fn build_result_shape(columns: &[String], rows: &[Vec<serde_json::Value>]) -> ResultShape {
    let is_numeric: Vec<bool> = (0..columns.len())
        .map(|i| {
            let mut saw_number = false;
            let all_numeric_or_null = rows.iter().all(|row| match row.get(i) {
                Some(serde_json::Value::Number(_)) => {
                    saw_number = true;
                    true
                }
                Some(serde_json::Value::Null) | None => true,
                _ => false,
            });
            all_numeric_or_null && saw_number
        })
        .collect();

    let numeric_column_count = is_numeric.iter().filter(|&&b| b).count();

    let has_time_column = columns.iter().any(|c| {
        let lower = c.to_ascii_lowercase();
        ["date", "time", "month", "day", "year"]
            .iter()
            .any(|kw| lower.contains(kw))
    });

    let category_columns: Vec<usize> = (0..columns.len()).filter(|&i| !is_numeric[i]).collect();
    let distinct_category_count = if category_columns.len() == 1 {
        let idx = category_columns[0];
        let mut seen = std::collections::HashSet::new();
        for row in rows {
            if let Some(v) = row.get(idx) {
                seen.insert(v.to_string());
            }
        }
        Some(seen.len())
    } else {
        None
    };

    ResultShape {
        row_count: rows.len(),
        numeric_column_count,
        has_time_column,
        distinct_category_count,
    }
}

struct PolicyGateStage;
#[async_trait]
impl Stage for PolicyGateStage {
    fn id(&self) -> StageId {
        StageId::PolicyGate
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

struct LocaleDetectorStage;
#[async_trait]
impl Stage for LocaleDetectorStage {
    fn id(&self) -> StageId {
        StageId::LocaleDetector
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

struct TranslatorStage;
#[async_trait]
impl Stage for TranslatorStage {
    fn id(&self) -> StageId {
        StageId::Translator
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

struct HallucinationGuardStage;
#[async_trait]
impl Stage for HallucinationGuardStage {
    fn id(&self) -> StageId {
        StageId::HallucinationGuard
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

struct TerminologyNormalizerStage;
#[async_trait]
impl Stage for TerminologyNormalizerStage {
    fn id(&self) -> StageId {
        StageId::TerminologyNormalizer
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

struct SchemaRetrieverStage;
#[async_trait]
impl Stage for SchemaRetrieverStage {
    fn id(&self) -> StageId {
        StageId::SchemaRetriever
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

struct SqlGeneratorStage {
    llm: Arc<dyn LLMClient>,
}
#[async_trait]
impl Stage for SqlGeneratorStage {
    fn id(&self) -> StageId {
        StageId::SqlGenerator
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        if self.llm.available_models().is_empty() {
            return Err(Error::DownstreamUnavailable(
                "LLM client reports no available models".to_string(),
            ));
        }
        Ok(())
    }
}

struct SqlValidatorStage;
#[async_trait]
impl Stage for SqlValidatorStage {
    fn id(&self) -> StageId {
        StageId::SqlValidator
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

struct ExecutorStage {
    warehouse: Arc<dyn WarehouseConnection>,
}
#[async_trait]
impl Stage for ExecutorStage {
    fn id(&self) -> StageId {
        StageId::Executor
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        let outcome = tokio::time::timeout(Duration::from_secs(2), self.warehouse.query("SELECT 1", &[]))
            .await
            .map_err(|_| Error::execution_timeout(2000))?;
        outcome?;
        Ok(())
    }
}

struct SelfCorrectorStage;
#[async_trait]
impl Stage for SelfCorrectorStage {
    fn id(&self) -> StageId {
        StageId::SelfCorrector
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

struct VisualizationRouterStage;
#[async_trait]
impl Stage for VisualizationRouterStage {
    fn id(&self) -> StageId {
        StageId::VisualizationRouter
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

struct ConfidenceScorerStage;
#[async_trait]
impl Stage for ConfidenceScorerStage {
    fn id(&self) -> StageId {
        StageId::ConfidenceScorer
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

struct FormatterStage;
#[async_trait]
impl Stage for FormatterStage {
    fn id(&self) -> StageId {
        StageId::Formatter
    }
    async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::bus::EventBus;
    use crate::executor::{Row, SqliteWarehouse, WarehouseConnection};
    use crate::llm::{CompletionRequest, CompletionResponse};
    use async_trait::async_trait as async_trait_alias;

    struct ScriptedLLM {
        response: String,
    }

    #[async_trait_alias]
    impl LLMClient for ScriptedLLM {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                id: uuid::Uuid::new_v4().to_string(),
                model: "scripted".to_string(),
                content: self.response.clone(),
                stop_reason: Some(crate::llm::StopReason::EndTurn),
                usage: Default::default(),
                timestamp: chrono::Utc::now(),
                cost: Some(0.0),
            })
        }

        async fn embed(
            &self,
            _request: crate::llm::EmbeddingRequest,
        ) -> Result<crate::llm::EmbeddingResponse> {
            Err(Error::Internal("embeddings not used in these tests".to_string()))
        }

        fn provider(&self) -> crate::llm::Provider {
            crate::llm::Provider::Ollama
        }

        fn available_models(&self) -> Vec<crate::llm::ModelSpec> {
            vec![]
        }
    }

    fn test_services(sql_response: &str) -> Arc<ServiceBundle> {
        Arc::new(ServiceBundle {
            llm: Arc::new(ScriptedLLM {
                response: sql_response.to_string(),
            }),
            warehouse: Arc::new(SqliteWarehouse::open_in_memory().unwrap()),
            bus: Arc::new(EventBus::default()),
            audit: Arc::new(AuditSink::open_in_memory().unwrap()),
        })
    }

    fn request(services: Arc<ServiceBundle>, text: &str) -> QueryRequest {
        let envelope = Envelope::new(
            "analyst-1",
            "tenant-a",
            Locale::En,
            Duration::from_secs(5),
            services,
        )
        .with_roles(["analyst".to_string()]);
        QueryRequest::new(envelope, text)
    }

    #[tokio::test]
    async fn short_question_is_clarified_before_any_llm_call() {
        let services = test_services("{}");
        let pipeline = GatewayPipeline::new(GatewayConfig::default(), services.clone());
        let result = pipeline.handle(request(services, "hi")).await.unwrap();
        assert_eq!(result.routing_action, RoutingAction::Clarify);
    }

    #[tokio::test]
    async fn off_topic_question_is_rejected_before_any_llm_call() {
        let services = test_services("{}");
        let pipeline = GatewayPipeline::new(GatewayConfig::default(), services.clone());
        let result = pipeline
            .handle(request(services, "what's the weather like today?"))
            .await
            .unwrap();
        assert_eq!(result.routing_action, RoutingAction::Reject);
    }

    #[tokio::test]
    async fn on_topic_question_runs_end_to_end_and_answers() {
        let response = serde_json::json!({
            "sql": "SELECT COUNT(*) AS total FROM patients",
            "rationale": "Counts every patient row.",
            "detected_intent": "kpi",
            "intent_confidence": 0.9,
        })
        .to_string();

        let services = test_services(&response);
        services
            .warehouse
            .query("CREATE TABLE IF NOT EXISTS x (y INTEGER)", &[])
            .await
            .ok();

        let pipeline = GatewayPipeline::new(GatewayConfig::default(), services.clone());
        let result = pipeline
            .handle(request(services, "how many patients do we have in total"))
            .await
            .unwrap();

        assert_eq!(result.routing_action, RoutingAction::Answered);
        assert_eq!(result.columns, vec!["total".to_string()]);
        assert!(result.chart_spec.is_some());
        assert!(result.confidence.is_some());
    }

    #[tokio::test]
    async fn unsafe_sql_is_rejected_after_exhausting_retries() {
        let response = serde_json::json!({
            "sql": "SELECT * FROM patients; DROP TABLE patients",
            "rationale": "n/a",
            "detected_intent": "kpi",
            "intent_confidence": 0.9,
        })
        .to_string();

        let services = test_services(&response);
        let pipeline = GatewayPipeline::new(GatewayConfig::default(), services.clone());
        let result = pipeline
            .handle(request(services, "show me all patient records please now"))
            .await
            .unwrap();

        assert_eq!(result.routing_action, RoutingAction::Reject);
    }

    #[tokio::test]
    async fn arabic_locale_response_formats_numeric_rows_and_explanation_in_eastern_digits() {
        let response = serde_json::json!({
            "sql": "SELECT COUNT(*) AS total FROM patients",
            "rationale": "12345 patients matched.",
            "detected_intent": "kpi",
            "intent_confidence": 0.9,
        })
        .to_string();

        let services = test_services(&response);
        services
            .warehouse
            .query("CREATE TABLE IF NOT EXISTS patients (id INTEGER)", &[])
            .await
            .unwrap();

        let pipeline = GatewayPipeline::new(GatewayConfig::default(), services.clone());
        let result = pipeline
            .handle(request(services, "أظهر إيرادات العيادة لشهر يناير"))
            .await
            .unwrap();

        assert_eq!(result.routing_action, RoutingAction::Answered);
        for row in &result.rows {
            for cell in row {
                if let serde_json::Value::String(s) = cell {
                    assert!(
                        !s.chars().any(|c| c.is_ascii_digit()),
                        "expected no Western digits in localized cell {s}"
                    );
                }
            }
        }
        assert!(
            !result.explanation.chars().any(|c| c.is_ascii_digit()),
            "expected no Western digits in localized explanation {}",
            result.explanation
        );
    }

    #[tokio::test]
    async fn health_service_reports_all_registered_stages() {
        let services = test_services("{}");
        let pipeline = GatewayPipeline::new(GatewayConfig::default(), services);
        pipeline.register_health_stages().await;
        let snapshot = pipeline.health().await;
        assert_eq!(snapshot.healthy_stages.len(), 13);
    }
}
