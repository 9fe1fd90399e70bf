//! `GatewayConfig`: the typed, serde-`Deserialize` configuration surface
//! covering every key enumerated in spec.md §6, loaded from TOML.
//!
//! TOML is the standard complement to `serde` for config files and is the
//! one crate this repository adds beyond the teacher's own dependency set
//! (the teacher's config surfaces are JSON/struct-literal only); the pack's
//! CLI-shaped example repos load TOML for exactly this purpose.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::confidence::ConfidenceWeights;
use crate::error::{Error, Result};
use crate::llm::Provider;
use crate::locale::Locale;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfiguredProvider {
    Openai,
    Ollama,
    Gemini,
}

impl ConfiguredProvider {
    pub fn to_provider(&self) -> Provider {
        match self {
            ConfiguredProvider::Openai => Provider::OpenAI,
            ConfiguredProvider::Ollama => Provider::Ollama,
            ConfiguredProvider::Gemini => Provider::Gemini,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ConfiguredProvider,
    pub model: String,
    /// Clamped to `[0, 2]` per spec.md §6; the Text-to-SQL Generator
    /// additionally recommends `<= 0.2` (spec.md §4.6).
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ConfiguredProvider::Ollama,
            model: "llama3".to_string(),
            temperature: 0.1,
            max_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct LocaleConfig {
    pub default: String,
}

impl Default for LocaleConfig {
    fn default() -> Self {
        Self {
            default: "en".to_string(),
        }
    }
}

impl LocaleConfig {
    pub fn default_locale(&self) -> Locale {
        Locale::parse_or_default(&self.default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Request-level deadline in seconds (spec.md §6 `executor.deadline`).
    pub deadline_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { deadline_secs: 30 }
    }
}

impl ExecutorConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectorConfig {
    pub max_retries: u32,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfigToml {
    pub passing_threshold: f64,
    pub missing_threshold: f64,
    pub row_delta_threshold: f64,
}

impl Default for QualityConfigToml {
    fn default() -> Self {
        Self {
            passing_threshold: 70.0,
            missing_threshold: 0.05,
            row_delta_threshold: 0.2,
        }
    }
}

impl QualityConfigToml {
    pub fn to_quality_config(&self, sample_cap: usize) -> crate::quality::QualityConfig {
        crate::quality::QualityConfig {
            passing_threshold: self.passing_threshold,
            missing_threshold: self.missing_threshold,
            sample_cap,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfigToml {
    pub durable_subject_prefix: String,
    pub visibility_timeout_secs: u64,
}

impl Default for BusConfigToml {
    fn default() -> Self {
        Self {
            durable_subject_prefix: "durable".to_string(),
            visibility_timeout_secs: 30,
        }
    }
}

impl BusConfigToml {
    pub fn to_bus_config(&self, max_buffered: usize) -> crate::bus::BusConfig {
        crate::bus::BusConfig {
            durable_subject_prefix: self.durable_subject_prefix.clone(),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            max_buffered,
        }
    }
}

/// The complete, typed configuration surface for one gateway process.
/// Every field here corresponds to a key spec.md §6 enumerates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub llm: LlmConfig,
    pub locale: LocaleConfig,
    pub executor: ExecutorConfig,
    pub corrector: CorrectorConfig,
    pub confidence: ConfidenceWeightsConfig,
    pub quality: QualityConfigToml,
    pub bus: BusConfigToml,
}

/// `confidence.weights.*` per spec.md §6, flattened under a `weights` table
/// in TOML (`[confidence.weights]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceWeightsConfig {
    pub weights: ConfidenceWeights,
}

impl Default for ConfidenceWeightsConfig {
    fn default() -> Self {
        Self {
            weights: ConfidenceWeights::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            locale: LocaleConfig::default(),
            executor: ExecutorConfig::default(),
            corrector: CorrectorConfig::default(),
            confidence: ConfidenceWeightsConfig::default(),
            quality: QualityConfigToml::default(),
            bus: BusConfigToml::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// any key the file omits (`#[serde(default)]` on every section).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("parsing config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_spec_bounds() {
        let config = GatewayConfig::default();
        assert!(config.llm.temperature <= 0.2);
        assert_eq!(config.corrector.max_retries, 3);
        assert_eq!(config.quality.passing_threshold, 70.0);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [llm]
            provider = "openai"
            model = "gpt-4o-mini"
            temperature = 0.15
            max_tokens = 4096
            "#,
        )
        .unwrap();

        assert!(matches!(config.llm.provider, ConfiguredProvider::Openai));
        assert_eq!(config.executor.deadline_secs, 30);
        assert_eq!(config.bus.durable_subject_prefix, "durable");
    }

    #[test]
    fn confidence_weights_round_trip_through_toml() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [confidence.weights]
            w1_intent_clarity = 0.4
            w2_schema_match_quality = 0.3
            w3_sql_complexity_penalty = 0.1
            w4_retry_penalty = 0.15
            w5_hallucination_risk = 0.05
            "#,
        )
        .unwrap();

        assert_eq!(config.confidence.weights.w1_intent_clarity, 0.4);
    }
}
