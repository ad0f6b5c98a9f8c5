//! Configuration parsing and validation.
//!
//! The memory engine is configured via a TOML file at `.agent/config.yaml`
//! (the on-disk name is inherited from the original implementation; the
//! syntax parsed is TOML, matching every other config surface in this
//! crate). The config defines the LLM extraction provider, compaction
//! thresholds, retrieval tuning, storage backend selection, and the
//! iteration-loop ("Ralph") defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub extends: Vec<String>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub theme: ThemeConfig,
    #[serde(default)]
    pub ralph: RalphLoopConfig,
    #[serde(default)]
    pub adapters: AdapterConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            base_url: None,
            api_key_env: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_llm_timeout(),
        }
    }
}

fn default_llm_provider() -> String {
    "anthropic".to_string()
}
fn default_llm_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}
fn default_temperature() -> f64 {
    0.3
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_llm_timeout() -> f64 {
    120.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompactionConfig {
    #[serde(default = "default_max_recent_tokens")]
    pub max_recent_tokens: u32,
    #[serde(default = "default_max_sessions_before_compact")]
    pub max_sessions_before_compact: u32,
    #[serde(default = "default_promote_after")]
    pub promote_pattern_after_occurrences: u32,
    #[serde(default = "default_true")]
    pub index_decision_entries: bool,
    #[serde(default = "default_decision_confidence")]
    pub index_decision_min_confidence: f64,
    #[serde(default = "default_true")]
    pub index_exploration_entries: bool,
    #[serde(default = "default_decision_confidence")]
    pub index_exploration_min_confidence: f64,
    #[serde(default)]
    pub index_narrative_entries: bool,
    #[serde(default = "default_narrative_confidence")]
    pub index_narrative_min_confidence: f64,
    #[serde(default = "default_archive_days")]
    pub archive_sessions_older_than_days: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_recent_tokens: default_max_recent_tokens(),
            max_sessions_before_compact: default_max_sessions_before_compact(),
            promote_pattern_after_occurrences: default_promote_after(),
            index_decision_entries: true,
            index_decision_min_confidence: default_decision_confidence(),
            index_exploration_entries: true,
            index_exploration_min_confidence: default_decision_confidence(),
            index_narrative_entries: false,
            index_narrative_min_confidence: default_narrative_confidence(),
            archive_sessions_older_than_days: default_archive_days(),
        }
    }
}

fn default_max_recent_tokens() -> u32 {
    1500
}
fn default_max_sessions_before_compact() -> u32 {
    5
}
fn default_promote_after() -> u32 {
    3
}
fn default_decision_confidence() -> f64 {
    0.7
}
fn default_narrative_confidence() -> f64 {
    0.8
}
fn default_archive_days() -> u32 {
    30
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_fusion_k")]
    pub fusion_k: i64,
    #[serde(default)]
    pub rerank_enabled: bool,
    #[serde(default = "default_rerank_candidate_k")]
    pub rerank_candidate_k: i64,
    #[serde(default)]
    pub embedding_enabled: bool,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            top_k: default_top_k(),
            fusion_k: default_fusion_k(),
            rerank_enabled: false,
            rerank_candidate_k: default_rerank_candidate_k(),
            embedding_enabled: false,
            embedding_dimensions: default_embedding_dimensions(),
        }
    }
}

fn default_backend() -> String {
    "fts5".to_string()
}
fn default_top_k() -> i64 {
    5
}
fn default_fusion_k() -> i64 {
    60
}
fn default_rerank_candidate_k() -> i64 {
    20
}
fn default_embedding_dimensions() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct SharedStorageConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_shared_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub require_api_key: bool,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_true")]
    pub allow_promote: bool,
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
    #[serde(default = "default_audit_actor")]
    pub audit_actor: String,
    #[serde(default = "default_shared_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    #[serde(default = "default_tenant_id")]
    pub project_id: String,
}

impl Default for SharedStorageConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_shared_api_key_env(),
            require_api_key: false,
            role: default_role(),
            allow_promote: true,
            audit_enabled: true,
            audit_actor: default_audit_actor(),
            timeout_seconds: default_shared_timeout(),
            retry_attempts: default_retry_attempts(),
            tenant_id: default_tenant_id(),
            project_id: default_tenant_id(),
        }
    }
}

fn default_shared_api_key_env() -> String {
    "AGENT_RECALL_SHARED_API_KEY".to_string()
}
fn default_role() -> String {
    "writer".to_string()
}
fn default_audit_actor() -> String {
    "system".to_string()
}
fn default_shared_timeout() -> f64 {
    10.0
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_tenant_id() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default)]
    pub shared: SharedStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            shared: SharedStorageConfig::default(),
        }
    }
}

fn default_storage_backend() -> String {
    "local".to_string()
}

impl StorageConfig {
    pub fn is_shared(&self) -> bool {
        self.backend == "shared"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThemeConfig {
    #[serde(default = "default_theme_name")]
    pub name: String,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            name: default_theme_name(),
        }
    }
}

fn default_theme_name() -> String {
    "dark+".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_notification_events")]
    pub events: Vec<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            events: default_notification_events(),
        }
    }
}

fn default_notification_events() -> Vec<String> {
    vec![
        "iteration_complete".to_string(),
        "validation_failed".to_string(),
        "loop_finished".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForecastConfig {
    #[serde(default = "default_forecast_window")]
    pub window: u32,
    #[serde(default)]
    pub use_llm: bool,
    #[serde(default = "default_llm_on_consecutive_failures")]
    pub llm_on_consecutive_failures: u32,
    #[serde(default)]
    pub llm_model: Option<String>,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            window: default_forecast_window(),
            use_llm: false,
            llm_on_consecutive_failures: default_llm_on_consecutive_failures(),
            llm_model: None,
        }
    }
}

fn default_forecast_window() -> u32 {
    5
}
fn default_llm_on_consecutive_failures() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    #[serde(default = "default_true")]
    pub auto_after_loop: bool,
    #[serde(default = "default_max_guardrails")]
    pub max_guardrails: u32,
    #[serde(default = "default_max_guardrails")]
    pub max_style: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            auto_after_loop: true,
            max_guardrails: default_max_guardrails(),
            max_style: default_max_guardrails(),
        }
    }
}

fn default_max_guardrails() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RalphLoopConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_sleep_seconds")]
    pub sleep_seconds: u32,
    #[serde(default = "default_compact_mode")]
    pub compact_mode: String,
    #[serde(default)]
    pub selected_prd_ids: Option<Vec<String>>,
    #[serde(default)]
    pub coding_cli: Option<String>,
    #[serde(default)]
    pub cli_model: Option<String>,
    /// If set, `ralph run` delegates the entire loop to this external
    /// script via a streaming subprocess instead of driving iterations
    /// in-process. Mirrors the original implementation's default mode,
    /// where the Rust-native per-iteration driver is the opt-in path.
    #[serde(default)]
    pub external_script: Option<PathBuf>,
    #[serde(default)]
    pub cost_budget_usd: Option<f64>,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl Default for RalphLoopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: default_max_iterations(),
            sleep_seconds: default_sleep_seconds(),
            compact_mode: default_compact_mode(),
            selected_prd_ids: None,
            coding_cli: None,
            cli_model: None,
            external_script: None,
            cost_budget_usd: None,
            forecast: ForecastConfig::default(),
            synthesis: SynthesisConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

fn default_max_iterations() -> u32 {
    10
}
fn default_sleep_seconds() -> u32 {
    2
}
fn default_compact_mode() -> String {
    "always".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdapterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_adapter_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub token_budget: Option<u32>,
    #[serde(default)]
    pub per_adapter_token_budget: HashMap<String, u32>,
    #[serde(default)]
    pub per_provider_token_budget: HashMap<String, u32>,
    #[serde(default)]
    pub per_model_token_budget: HashMap<String, u32>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: default_adapter_output_dir(),
            token_budget: None,
            per_adapter_token_budget: HashMap::new(),
            per_provider_token_budget: HashMap::new(),
            per_model_token_budget: HashMap::new(),
        }
    }
}

fn default_adapter_output_dir() -> String {
    ".agent/context".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Returns a config with all defaults applied, for repos with no
/// `.agent/config.yaml` yet.
pub fn default_config() -> Config {
    Config::default()
}

fn validate(config: &Config) -> Result<()> {
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }
    if config.llm.max_tokens == 0 {
        anyhow::bail!("llm.max_tokens must be > 0");
    }

    if !(0.0..=1.0).contains(&config.compaction.index_decision_min_confidence) {
        anyhow::bail!("compaction.index_decision_min_confidence must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.compaction.index_exploration_min_confidence) {
        anyhow::bail!("compaction.index_exploration_min_confidence must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.compaction.index_narrative_min_confidence) {
        anyhow::bail!("compaction.index_narrative_min_confidence must be in [0.0, 1.0]");
    }

    match config.retrieval.backend.as_str() {
        "fts5" | "hybrid" => {}
        other => anyhow::bail!("Unknown retrieval.backend: '{}'. Must be fts5 or hybrid.", other),
    }
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.fusion_k < 1 {
        anyhow::bail!("retrieval.fusion_k must be >= 1");
    }
    if !(8..=4096).contains(&config.retrieval.embedding_dimensions) {
        anyhow::bail!("retrieval.embedding_dimensions must be in [8, 4096]");
    }

    match config.storage.backend.as_str() {
        "local" | "shared" => {}
        other => anyhow::bail!("Unknown storage.backend: '{}'. Must be local or shared.", other),
    }
    if config.storage.is_shared() && config.storage.shared.base_url.is_none() {
        anyhow::bail!("storage.shared.base_url is required when storage.backend = \"shared\"");
    }
    match config.storage.shared.role.as_str() {
        "admin" | "writer" | "reader" => {}
        other => anyhow::bail!(
            "Unknown storage.shared.role: '{}'. Must be admin, writer, or reader.",
            other
        ),
    }

    match config.ralph.compact_mode.as_str() {
        "always" | "on-failure" | "off" => {}
        other => anyhow::bail!(
            "Unknown ralph.compact_mode: '{}'. Must be always, on-failure, or off.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = default_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn shared_backend_requires_base_url() {
        let mut config = default_config();
        config.storage.backend = "shared".to_string();
        assert!(validate(&config).is_err());
        config.storage.shared.base_url = Some("https://memory.example.com".to_string());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_src = r#"
            [llm]
            provider = "ollama"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.llm.provider, "ollama");
        assert_eq!(config.llm.model, "claude-sonnet-4-20250514");
    }
}
