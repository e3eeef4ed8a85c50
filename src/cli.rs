//! Command-line interface for routegate
//!
//! Provides argument parsing and subcommand definitions for the routegate binary.

use crate::compactor::Operation;
use clap::{Parser, Subcommand};

/// Decision core for a model-routing gateway
#[derive(Parser)]
#[command(name = "routegate")]
#[command(version)]
#[command(about = "Route tasks to backend models with circuit breaking and rate limiting")]
#[command(
    long_about = "routegate picks a backend model for a task by domain expertise, \
    tracks backend health with per-backend circuit breakers, enforces per-user rate limits, \
    and compacts its shared on-disk state. Output is JSON on stdout; logs go to stderr."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "routegate.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Plan a task: pick a backend and decide whether to delegate
    Route {
        /// Task description
        task: String,

        /// Context size in tokens (estimated from the task when omitted)
        #[arg(long)]
        context_tokens: Option<u64>,

        /// Backend the caller is running on (defaults to the first configured backend)
        #[arg(long)]
        current: Option<String>,

        /// Delegate whenever the recommended backend differs from the current one
        #[arg(long)]
        force: bool,

        /// Check this user's rate limit before planning
        #[arg(long)]
        user: Option<String>,

        /// Session id recorded in the decision log
        #[arg(long)]
        session: Option<String>,
    },

    /// Record a successful call on a backend
    Success {
        backend: String,
    },

    /// Record a failed call on a backend
    Failure {
        backend: String,

        /// Error message from the failed call
        #[arg(long)]
        error: String,
    },

    /// Show circuits, rate-limit usage, availability and decision totals
    Status,

    /// Compact shared state
    Compact {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,

        /// Run a single operation: circuits, logs, rate_limits or availability
        #[arg(long)]
        only: Option<Operation>,

        /// Keep running every compaction.interval_seconds until interrupted
        #[arg(long)]
        watch: bool,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# routegate Configuration
# ========================
#
# Backends, expertise matrix, routing rules, limits and retention policy.
# Every table except [routing_rules] and [[backends]] is optional.

# ─────────────────────────────────────────────────────────────────────────────
# SHARED STATE
# ─────────────────────────────────────────────────────────────────────────────

[state]
# Directory holding circuit_breakers.json, rate_limits.json,
# routing_decisions.jsonl, model_availability.json, summaries/ and archive/.
# Every process pointed at the same directory shares the same state.
dir = ".routegate"

# ─────────────────────────────────────────────────────────────────────────────
# CIRCUIT BREAKER
# ─────────────────────────────────────────────────────────────────────────────

[circuit_breaker]
# Consecutive failures that open a backend's circuit
failure_threshold = 3
# How long an open circuit rejects calls before probing again
reset_timeout_ms = 300000
# Probe calls admitted while half-open
half_open_max_calls = 1

# ─────────────────────────────────────────────────────────────────────────────
# RATE LIMITS (per user)
# ─────────────────────────────────────────────────────────────────────────────

[rate_limits]
requests_per_minute = 20
requests_per_hour = 200
premium_per_hour = 20
# Backends that also consume premium quota
premium_backends = ["claude-opus", "gemini-pro", "o3"]

# ─────────────────────────────────────────────────────────────────────────────
# ROUTING RULES
# ─────────────────────────────────────────────────────────────────────────────

[routing_rules]
# Detected domains kept per query
max_domain_scores = 3
# Above this many context tokens, large_context_backend is forced
context_override_threshold = 150000
large_context_backend = "gemini-pro"
# Below this confidence a human confirmation message is produced
confidence_threshold = 75.0
# Expertise assumed when a backend does not list a domain
default_expertise = 30
# Context size at which context blind spots apply
blind_spot_context_tokens = 100000
# Words that mark a task as needing live data
realtime_keywords = ["latest", "today", "current price", "breaking", "real-time", "this week"]

# Concurrency and precision needs pull toward different specialists
[routing_rules.conflict]
concurrency_domain = "concurrency"
precision_domain = "financial_math"
concurrency_specialist = "claude-sonnet"
precision_specialist = "o3"

# ─────────────────────────────────────────────────────────────────────────────
# BACKENDS
# ─────────────────────────────────────────────────────────────────────────────
#
# Fields:
#   - id: Identifier used in state files and the decision log
#   - agent: Worker the executor spawns for delegated tasks
#   - routine: Expertise used when no domain is detected (0-100)
#   - capabilities: realtime, large_context, low_cost
#   - blind_spots: context_limited, context_unlimited, or
#       { kind = "keyword", keywords = [...], penalty_pct = N, warning = "..." }
#   - [backends.expertise]: domain -> 0-100

[[backends]]
id = "claude-opus"
name = "Claude Opus"
agent = "opus-worker"
routine = 85
[backends.expertise]
security = 95
concurrency = 88
financial_math = 85
frontend = 80
devops = 82
data = 85
writing = 92
research = 60

[[backends]]
id = "claude-sonnet"
name = "Claude Sonnet"
agent = "sonnet-worker"
routine = 80
blind_spots = [{ kind = "context_limited" }]
[backends.expertise]
security = 85
concurrency = 92
financial_math = 75
frontend = 88
devops = 85
data = 85
writing = 85
research = 55

[[backends]]
id = "claude-haiku"
name = "Claude Haiku"
agent = "haiku-worker"
routine = 60
capabilities = ["low_cost"]
blind_spots = [
    { kind = "context_limited" },
    { kind = "keyword", keywords = ["proof", "formal verification"], penalty_pct = 25.0, warning = "Claude Haiku is weak at formal proofs" },
]
[backends.expertise]
frontend = 65
writing = 70
data = 60

[[backends]]
id = "gemini-pro"
name = "Gemini Pro"
agent = "gemini-worker"
routine = 75
capabilities = ["large_context"]
blind_spots = [{ kind = "context_unlimited" }]
[backends.expertise]
security = 80
data = 85
research = 70
writing = 80

[[backends]]
id = "o3"
name = "o3"
agent = "o3-worker"
routine = 70
[backends.expertise]
financial_math = 95
concurrency = 80
security = 78
data = 80

[[backends]]
id = "perplexity-sonar"
name = "Perplexity Sonar"
agent = "sonar-worker"
routine = 40
capabilities = ["realtime"]
[backends.expertise]
research = 95
writing = 60

# ─────────────────────────────────────────────────────────────────────────────
# DOMAINS
# ─────────────────────────────────────────────────────────────────────────────

[[domains]]
name = "security"
keywords = ["security", "vulnerability", "vulnerabilities", "xss", "csrf", "injection", "authentication"]

[[domains]]
name = "concurrency"
keywords = ["race condition", "deadlock", "mutex", "thread", "threads", "async", "concurrency"]

[[domains]]
name = "financial_math"
keywords = ["interest", "amortization", "rounding", "decimal", "currency", "compound"]

[[domains]]
name = "frontend"
keywords = ["react", "css", "layout", "component", "ui"]

[[domains]]
name = "devops"
keywords = ["kubernetes", "docker", "terraform", "deploy", "pipeline"]

[[domains]]
name = "data"
keywords = ["sql", "schema", "etl", "database", "migration"]

[[domains]]
name = "writing"
keywords = ["summarize", "rewrite", "proofread", "essay"]

[[domains]]
name = "research"
keywords = ["news", "headlines", "market", "release notes"]

# ─────────────────────────────────────────────────────────────────────────────
# RISK DOMAINS
# ─────────────────────────────────────────────────────────────────────────────
#
# The first risk domain with a keyword in the task forces its backend.

[[risk_domains]]
name = "medical"
keywords = ["dosage", "diagnosis", "prescription", "symptoms"]
mandatory_backend = "claude-opus"
reason = "Medical guidance requires the most careful backend"

[[risk_domains]]
name = "security_critical"
keywords = ["private key", "production credentials", "root password"]
mandatory_backend = "claude-opus"

[[risk_domains]]
name = "financial_irreversible"
keywords = ["wire transfer", "irreversible payment", "execute trade"]
mandatory_backend = "claude-opus"

# ─────────────────────────────────────────────────────────────────────────────
# COMPACTION
# ─────────────────────────────────────────────────────────────────────────────

[compaction]
# Idle CLOSED circuits older than this are removed
circuit_max_age_hours = 1.0
circuit_max_records = 100
# Decision log: keep < 7 days, summarize 7-30 days, archive older
log_max_age_days = 7
log_archive_after_days = 30
# Rotate the live log above this size
log_max_file_size_mb = 10.0
# Users idle this long lose their rate-limit record
rate_limit_reset_window_hours = 24.0
availability_max_age_minutes = 15.0
# Period for `routegate compact --watch`
interval_seconds = 300

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
# Log level: "trace", "debug", "info", "warn", "error" (RUST_LOG overrides)
log_level = "info"
"#
}
