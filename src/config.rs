//! Configuration management for routegate
//!
//! Parses TOML configuration files and provides typed access to settings.
//! A `Config` is built once at process start, validated, and then passed by
//! reference (or `Arc`) into every component constructor.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    pub routing_rules: RoutingRulesConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
    #[serde(default)]
    pub risk_domains: Vec<RiskDomainConfig>,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Location of the shared on-disk state
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".routegate")
}

impl StateConfig {
    pub fn circuit_store_path(&self) -> PathBuf {
        self.dir.join("circuit_breakers.json")
    }

    pub fn rate_limit_store_path(&self) -> PathBuf {
        self.dir.join("rate_limits.json")
    }

    pub fn decision_log_path(&self) -> PathBuf {
        self.dir.join("routing_decisions.jsonl")
    }

    pub fn availability_cache_path(&self) -> PathBuf {
        self.dir.join("model_availability.json")
    }

    /// Directory holding one `<YYYY-MM-DD>.json` daily summary per date
    pub fn summaries_dir(&self) -> PathBuf {
        self.dir.join("summaries")
    }

    /// Directory holding monthly archives and rotated logs
    pub fn archive_dir(&self) -> PathBuf {
        self.dir.join("archive")
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_reset_timeout_ms() -> u64 {
    300_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

/// Per-user request limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: usize,
    #[serde(default = "default_premium_per_hour")]
    pub premium_per_hour: usize,
    /// Backends that consume premium quota
    #[serde(default)]
    pub premium_backends: Vec<String>,
}

impl RateLimitConfig {
    /// Whether requests to this backend consume premium quota
    pub fn is_premium(&self, backend: &str) -> bool {
        self.premium_backends.iter().any(|b| b == backend)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: default_requests_per_hour(),
            premium_per_hour: default_premium_per_hour(),
            premium_backends: Vec::new(),
        }
    }
}

fn default_requests_per_minute() -> usize {
    20
}

fn default_requests_per_hour() -> usize {
    200
}

fn default_premium_per_hour() -> usize {
    20
}

/// Semantic routing rules
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingRulesConfig {
    #[serde(default = "default_max_domain_scores")]
    pub max_domain_scores: usize,
    #[serde(default = "default_context_override_threshold")]
    pub context_override_threshold: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Expertise assumed when a backend does not list a domain
    #[serde(default = "default_expertise")]
    pub default_expertise: u8,
    /// Backend forced when the context override fires
    pub large_context_backend: String,
    /// Token count above which context blind spots apply
    #[serde(default = "default_blind_spot_context_tokens")]
    pub blind_spot_context_tokens: u64,
    /// Words that mark a task as needing live data
    #[serde(default = "default_realtime_keywords")]
    pub realtime_keywords: Vec<String>,
    #[serde(default)]
    pub conflict: Option<ConflictConfig>,
}

fn default_max_domain_scores() -> usize {
    3
}

fn default_context_override_threshold() -> u64 {
    150_000
}

fn default_confidence_threshold() -> f64 {
    75.0
}

fn default_expertise() -> u8 {
    30
}

fn default_blind_spot_context_tokens() -> u64 {
    100_000
}

fn default_realtime_keywords() -> Vec<String> {
    ["latest", "today", "current price", "breaking", "real-time", "this week"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Pair of domains whose co-occurrence signals a specialist conflict
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConflictConfig {
    pub concurrency_domain: String,
    pub precision_domain: String,
    pub concurrency_specialist: String,
    pub precision_specialist: String,
}

/// A routable backend and its expertise profile
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub id: String,
    pub name: String,
    /// Worker/agent the executor should spawn for this backend
    #[serde(default)]
    pub agent: Option<String>,
    /// Expertise used when no domain is detected
    #[serde(default)]
    pub routine: Option<u8>,
    #[serde(default)]
    pub expertise: BTreeMap<String, u8>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub blind_spots: Vec<BlindSpot>,
}

impl BackendConfig {
    /// Expertise for a domain, or `default` when the backend does not list it
    pub fn expertise_for(&self, domain: &str, default: u8) -> u8 {
        self.expertise.get(domain).copied().unwrap_or(default)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Capabilities that justify delegating away from the current backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Realtime,
    LargeContext,
    LowCost,
}

/// Known weaknesses applied as score adjustments
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlindSpot {
    /// Loses 30% when the context exceeds `blind_spot_context_tokens`
    ContextLimited,
    /// Gains up to 30% when the context exceeds `blind_spot_context_tokens`
    ContextUnlimited,
    /// Loses `penalty_pct` percent when any keyword occurs in the query
    Keyword {
        keywords: Vec<String>,
        penalty_pct: f64,
        warning: String,
    },
}

/// A semantic domain detected by keyword matching
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DomainConfig {
    pub name: String,
    pub keywords: Vec<String>,
}

/// A domain whose presence forces a mandatory backend
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RiskDomainConfig {
    pub name: String,
    pub keywords: Vec<String>,
    pub mandatory_backend: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Retention and compaction policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompactionConfig {
    #[serde(default = "default_circuit_max_age_hours")]
    pub circuit_max_age_hours: f64,
    #[serde(default = "default_circuit_max_records")]
    pub circuit_max_records: usize,
    #[serde(default = "default_log_max_age_days")]
    pub log_max_age_days: i64,
    #[serde(default = "default_log_archive_after_days")]
    pub log_archive_after_days: i64,
    #[serde(default = "default_log_max_file_size_mb")]
    pub log_max_file_size_mb: f64,
    #[serde(default = "default_rate_limit_reset_window_hours")]
    pub rate_limit_reset_window_hours: f64,
    #[serde(default = "default_availability_max_age_minutes")]
    pub availability_max_age_minutes: f64,
    /// Interval for `compact --watch`
    #[serde(default = "default_compaction_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            circuit_max_age_hours: default_circuit_max_age_hours(),
            circuit_max_records: default_circuit_max_records(),
            log_max_age_days: default_log_max_age_days(),
            log_archive_after_days: default_log_archive_after_days(),
            log_max_file_size_mb: default_log_max_file_size_mb(),
            rate_limit_reset_window_hours: default_rate_limit_reset_window_hours(),
            availability_max_age_minutes: default_availability_max_age_minutes(),
            interval_seconds: default_compaction_interval_seconds(),
        }
    }
}

fn default_circuit_max_age_hours() -> f64 {
    1.0
}

fn default_circuit_max_records() -> usize {
    100
}

fn default_log_max_age_days() -> i64 {
    7
}

fn default_log_archive_after_days() -> i64 {
    30
}

fn default_log_max_file_size_mb() -> f64 {
    10.0
}

fn default_rate_limit_reset_window_hours() -> f64 {
    24.0
}

fn default_availability_max_age_minutes() -> f64 {
    15.0
}

fn default_compaction_interval_seconds() -> u64 {
    300
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path_display = path.as_ref().display().to_string();

        // Phase 1: Read file (preserves io::Error context)
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|source| AppError::ConfigFileRead {
                path: path_display.clone(),
                source,
            })?;

        // Phase 2: Parse TOML (preserves toml::de::Error context)
        let config: Self = toml::from_str(&content).map_err(|source| {
            AppError::ConfigParseFailed {
                path: path_display.clone(),
                source,
            }
        })?;

        // Phase 3: Validate parsed config (provides contextual reason)
        config
            .validate()
            .map_err(|e| AppError::ConfigValidationFailed {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Look up a backend by id
    pub fn backend(&self, id: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// Validate configuration after parsing
    ///
    /// This is called automatically by `from_file()` and `from_str()`, but can
    /// also be called explicitly when a `Config` is adjusted in code.
    pub fn validate(&self) -> AppResult<()> {
        if self.backends.is_empty() {
            return Err(AppError::Config(
                "no backends configured; add at least one [[backends]] entry".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(AppError::Config("backend id must not be empty".to_string()));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate backend id '{}'",
                    backend.id
                )));
            }
            if let Some(routine) = backend.routine
                && routine > 100
            {
                return Err(AppError::Config(format!(
                    "backend '{}' has routine expertise {} outside 0..=100",
                    backend.id, routine
                )));
            }
            for (domain, value) in &backend.expertise {
                if *value > 100 {
                    return Err(AppError::Config(format!(
                        "backend '{}' has expertise {} for domain '{}' outside 0..=100",
                        backend.id, value, domain
                    )));
                }
            }
            for spot in &backend.blind_spots {
                if let BlindSpot::Keyword {
                    keywords,
                    penalty_pct,
                    ..
                } = spot
                {
                    if keywords.is_empty() {
                        return Err(AppError::Config(format!(
                            "backend '{}' has a keyword blind spot with no keywords",
                            backend.id
                        )));
                    }
                    if !penalty_pct.is_finite() || *penalty_pct < 0.0 || *penalty_pct > 100.0 {
                        return Err(AppError::Config(format!(
                            "backend '{}' has blind spot penalty {} outside 0..=100",
                            backend.id, penalty_pct
                        )));
                    }
                }
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(AppError::Config(
                "circuit_breaker.half_open_max_calls must be greater than 0".to_string(),
            ));
        }
        if self.rate_limits.requests_per_minute == 0 || self.rate_limits.requests_per_hour == 0 {
            return Err(AppError::Config(
                "rate_limits.requests_per_minute and requests_per_hour must be greater than 0"
                    .to_string(),
            ));
        }
        for premium in &self.rate_limits.premium_backends {
            self.require_backend("rate_limits.premium_backends", premium)?;
        }

        let rules = &self.routing_rules;
        if !rules.confidence_threshold.is_finite()
            || rules.confidence_threshold < 0.0
            || rules.confidence_threshold > 100.0
        {
            return Err(AppError::Config(format!(
                "routing_rules.confidence_threshold must be between 0 and 100, got {}",
                rules.confidence_threshold
            )));
        }
        if rules.default_expertise > 100 {
            return Err(AppError::Config(format!(
                "routing_rules.default_expertise must be between 0 and 100, got {}",
                rules.default_expertise
            )));
        }
        if rules.max_domain_scores == 0 {
            return Err(AppError::Config(
                "routing_rules.max_domain_scores must be greater than 0".to_string(),
            ));
        }
        self.require_backend(
            "routing_rules.large_context_backend",
            &rules.large_context_backend,
        )?;

        let mut domain_names = HashSet::new();
        for domain in &self.domains {
            if domain.keywords.is_empty() {
                return Err(AppError::Config(format!(
                    "domain '{}' has no keywords",
                    domain.name
                )));
            }
            if !domain_names.insert(domain.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate domain '{}'",
                    domain.name
                )));
            }
        }

        if let Some(conflict) = &rules.conflict {
            for domain in [&conflict.concurrency_domain, &conflict.precision_domain] {
                if !domain_names.contains(domain.as_str()) {
                    return Err(AppError::Config(format!(
                        "routing_rules.conflict references unknown domain '{}'",
                        domain
                    )));
                }
            }
            self.require_backend(
                "routing_rules.conflict.concurrency_specialist",
                &conflict.concurrency_specialist,
            )?;
            self.require_backend(
                "routing_rules.conflict.precision_specialist",
                &conflict.precision_specialist,
            )?;
        }

        for risk in &self.risk_domains {
            if risk.keywords.is_empty() {
                return Err(AppError::Config(format!(
                    "risk domain '{}' has no keywords",
                    risk.name
                )));
            }
            self.require_backend(
                &format!("risk_domains.{}.mandatory_backend", risk.name),
                &risk.mandatory_backend,
            )?;
        }

        let compaction = &self.compaction;
        if compaction.log_archive_after_days < compaction.log_max_age_days {
            return Err(AppError::Config(format!(
                "compaction.log_archive_after_days ({}) must not be less than log_max_age_days ({})",
                compaction.log_archive_after_days, compaction.log_max_age_days
            )));
        }
        if compaction.interval_seconds == 0 {
            return Err(AppError::Config(
                "compaction.interval_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    fn require_backend(&self, field: &str, id: &str) -> AppResult<()> {
        if self.backend(id).is_none() {
            let available: Vec<&str> = self.backends.iter().map(|b| b.id.as_str()).collect();
            return Err(AppError::Config(format!(
                "{} references unknown backend '{}'. Available backends: {}",
                field,
                id,
                available.join(", ")
            )));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = AppError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Config =
            toml::from_str(toml_str).map_err(|source| AppError::ConfigParseFailed {
                path: "<string>".to_string(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }
}
