//! # bi-query-core
//!
//! A conversational business-intelligence gateway: turns natural-language
//! questions (English/Arabic) about healthcare and accounting data into
//! safe, auditable SQL executions over an analytical warehouse, plus an
//! event-driven ETL quality-validation pipeline.
//!
//! ## Core Components
//!
//! - **Envelope**: request/response framing, cancellation, dependency injection
//! - **Policy**: pre-generation authorization and column masking
//! - **Locale**: language detection, translation, and number/currency formatting
//! - **Schema**: retrieval of relevant tables/patterns for prompt grounding
//! - **SqlGen**: the text-to-SQL generator (a typed LLM signature)
//! - **SqlSafety**: read-only validation and parameterization of generated SQL
//! - **Hallucination**: off-topic/ambiguous question classification
//! - **Corrector**: bounded self-correction retry loop
//! - **Executor**: read-only warehouse execution under a deadline
//! - **Viz**: chart-shape routing
//! - **Confidence**: weighted-sum scoring and routing thresholds
//! - **Supervisor**: pipeline stage registry and dispatch
//! - **Quality**: ETL batch quality validation
//! - **Bus**: in-process event bus adapter
//! - **Audit**: append-only decision/outcome sink
//! - **Pipeline**: the `GatewayPipeline` orchestrator wiring every stage
//!   into the `QueryService`/`HealthService` seam a transport binary calls
//! - **EtlWorker**: durable-subscription consumer running quality
//!   validation over published sync-completed events
//!
//! ## Example
//!
//! ```rust,ignore
//! use bi_query_core::{Envelope, QueryRequest, Supervisor};
//!
//! let envelope = Envelope::new("principal-1", "tenant-a");
//! let request = QueryRequest::new(envelope, "How many claims were denied last month?");
//! ```

// Self-alias for derive macro support within the crate.
extern crate self as bi_query_core;

pub mod audit;
pub mod bus;
pub mod confidence;
pub mod config;
pub mod corrector;
pub mod envelope;
pub mod error;
pub mod etl_worker;
pub mod executor;
pub mod hallucination;
pub mod llm;
pub mod locale;
pub mod module;
pub mod pipeline;
pub mod policy;
pub mod quality;
pub mod schema;
pub mod signature;
pub mod sqlgen;
pub mod sqlsafety;
pub mod supervisor;
pub mod terminology;
pub mod viz;

// Re-exports for convenience
pub use audit::{AuditRecord, AuditSink};
pub use bus::{BusError, EventBus, EventEnvelope, Subscription};
pub use confidence::{ConfidenceBand, ConfidenceFactors, ConfidenceScore, ConfidenceWeights};
pub use config::GatewayConfig;
pub use corrector::{CorrectionAttempt, CorrectionTrigger, SelfCorrector};
pub use envelope::{Envelope, QueryRequest, QueryResult, QueryTrace, ServiceBundle, StageOutcome};
pub use error::{Error, Result};
pub use etl_worker::{spawn_worker, EtlWorker};
pub use executor::{ExecutionOutcome, WarehouseConnection};
pub use hallucination::{HallucinationGuard, Verdict};
pub use llm::{
    ChatMessage, ChatRole, ClientConfig, CompletionRequest, CompletionResponse, CostTracker,
    GeminiClient, LLMClient, ModelSpec, ModelTier, MultiProviderClient, OllamaClient, OpenAIClient,
    Provider, TierBreakdown, TokenUsage, TrackedClient,
};
pub use locale::{Locale, LocaleDetection, NumberFormatter};
pub use module::{Example, Module, ModuleConfig, Predict, PredictConfig, Predictor};
pub use pipeline::{GatewayPipeline, HealthService, QueryService};
pub use policy::{PolicyDecision, PolicyGate};
pub use quality::{
    parse_sync_event, QualityCheck, QualityConfig, QualityCounts, QualityDataSource,
    QualityReport, QualityScores, QualityValidator, RangeRuleWire, SyncEvent, SyncEventWire,
};
pub use schema::{SchemaCatalog, SchemaContext, SchemaRetriever, StaticSchemaCatalog, TableSpec};
pub use signature::{FieldSpec, FieldType, ParseError, Signature, ValidationError};
pub use sqlgen::SqlGeneration;
pub use sqlsafety::{ParameterizedSql, SqlValidator};
pub use supervisor::{Stage, StageId, Supervisor};
pub use terminology::TerminologyNormalizer;
pub use viz::{ChartSpec, VisualizationRouter};
