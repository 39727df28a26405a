//! Application configuration loaded from `~/.relay/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub provider_router: ProviderRouterConfig,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            runtime: RuntimeConfig::default(),
            resilience: ResilienceConfig::default(),
            provider_router: ProviderRouterConfig::default(),
            agents: Vec::new(),
            worker: WorkerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.relay/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relay")
            .join("config.toml")
    }

    /// Resolve the working directory for shared state.
    pub fn workdir(&self) -> PathBuf {
        self.general
            .workdir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".relay"))
    }

    pub fn agent(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == id)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory holding the board/bus/mailbox documents; default `.relay`.
    #[serde(default)]
    pub workdir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            workdir: None,
        }
    }
}

fn default_project_name() -> String {
    "relay".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Which supervisor drives agent workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// All agents launched as processes at startup.
    Process,
    /// On-demand launch with idle shutdown.
    Lazy,
    /// Workers run inside the supervisor process (tests, demos).
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_mode")]
    pub mode: RuntimeMode,
    /// Agents launched at startup and never stopped (typically the planner).
    #[serde(default = "default_always_on")]
    pub always_on: Vec<String>,
    /// Seconds an on-demand agent may sit idle before being stopped.
    #[serde(default = "default_idle_shutdown")]
    pub idle_shutdown: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: default_runtime_mode(),
            always_on: default_always_on(),
            idle_shutdown: default_idle_shutdown(),
        }
    }
}

fn default_runtime_mode() -> RuntimeMode {
    RuntimeMode::Lazy
}
fn default_always_on() -> Vec<String> {
    vec!["planner".into()]
}
fn default_idle_shutdown() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_cb_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_cb_cooldown")]
    pub circuit_breaker_cooldown: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            circuit_breaker_threshold: default_cb_threshold(),
            circuit_breaker_cooldown: default_cb_cooldown(),
        }
    }
}

fn default_base_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    30.0
}
fn default_jitter() -> f64 {
    0.5
}
fn default_cb_threshold() -> u32 {
    3
}
fn default_cb_cooldown() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRouterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// latency | cost | preference | round_robin
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Soft preference under the `preference` strategy.
    #[serde(default)]
    pub preferred: Option<String>,
    /// Health probe interval in seconds.
    #[serde(default = "default_probe_interval")]
    pub probe_interval: u64,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Daily spend ceiling in USD; calls fail with BudgetExceeded past it.
    #[serde(default)]
    pub daily_budget_usd: Option<f64>,
    #[serde(default)]
    pub monthly_budget_usd: Option<f64>,
}

impl Default for ProviderRouterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: default_strategy(),
            preferred: None,
            probe_interval: default_probe_interval(),
            providers: BTreeMap::new(),
            daily_budget_usd: None,
            monthly_budget_usd: None,
        }
    }
}

fn default_strategy() -> String {
    "preference".into()
}
fn default_probe_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    /// Any OpenAI-compatible chat completions endpoint.
    OpenAi,
    /// In-memory stub for tests.
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variables holding API keys; more than one enables
    /// round-robin credential rotation on rate limits.
    #[serde(default)]
    pub api_key_env: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    /// Lower is preferred under the `preference` strategy.
    #[serde(default = "default_provider_priority")]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_provider_priority() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    /// Free-text role description; the first word is matched for routing.
    pub role: String,
    pub model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    /// Pre-rendered skill documents injected into the system prompt.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Tool profile names this agent may use.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_reputation")]
    pub reputation: i32,
    /// Restricted agents may only claim review/critique tasks.
    #[serde(default)]
    pub restricted: bool,
    /// Optional soul/cognition document injected verbatim into the prompt.
    #[serde(default)]
    pub soul: Option<String>,
}

fn default_reputation() -> i32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Consecutive idle cycles before a worker exits (the lazy runtime
    /// relaunches it on demand).
    #[serde(default = "default_max_idle_cycles")]
    pub max_idle_cycles: u32,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    /// Reviewer agent ids that receive critique requests.
    #[serde(default = "default_reviewers")]
    pub reviewers: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_idle_cycles: default_max_idle_cycles(),
            max_tool_iterations: default_max_tool_iterations(),
            reviewers: default_reviewers(),
        }
    }
}

fn default_max_idle_cycles() -> u32 {
    30
}
fn default_max_tool_iterations() -> u32 {
    20
}
fn default_reviewers() -> Vec<String> {
    vec!["reviewer".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Root-task deadline in seconds; past it the task fails with `timeout`.
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Cadence of progress notifications to the channel.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_timeout: default_task_timeout(),
            poll_interval: default_poll_interval(),
            progress_interval: default_progress_interval(),
        }
    }
}

fn default_task_timeout() -> u64 {
    600
}
fn default_poll_interval() -> u64 {
    2
}
fn default_progress_interval() -> u64 {
    30
}

/// Prompt-window trimming is an external concern; the core only honors the
/// character budget when assembling system prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_prompt_budget")]
    pub prompt_budget_chars: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            prompt_budget_chars: default_prompt_budget(),
        }
    }
}

fn default_prompt_budget() -> usize {
    24_000
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
