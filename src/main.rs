//! routegate command-line entry point
//!
//! Every subcommand prints one JSON document on stdout. Logs go to stderr.

use clap::Parser;
use routegate::{
    cli::{Cli, Command, generate_config_template},
    compactor::{Operation, StateCompactor},
    config::Config,
    decision_log::DecisionLog,
    metrics::Metrics,
    models::{CircuitBreakerRegistry, ModelAvailability},
    rate_limit::RateLimiter,
    router::{ExecutionPlanner, TaskRequest, estimate_tokens},
    telemetry,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        eprintln!("No command given. Run `routegate --help` for usage.");
        return Ok(());
    };

    // Template generation must work before any config exists
    if let Command::Config { output } = &command {
        match output {
            Some(path) => {
                std::fs::write(path, generate_config_template())?;
                eprintln!("Wrote configuration template to {}", path);
            }
            None => print!("{}", generate_config_template()),
        }
        return Ok(());
    }

    let config = Arc::new(Config::from_file(&cli.config)?);
    telemetry::init(&config.observability.log_level);
    let metrics = Arc::new(Metrics::new()?);

    tracing::debug!(
        config = %cli.config,
        state_dir = %config.state.dir.display(),
        "Loaded configuration"
    );

    match command {
        Command::Config { .. } => {}
        Command::Route {
            task,
            context_tokens,
            current,
            force,
            user,
            session,
        } => {
            let current = match current {
                Some(id) => id,
                None => config
                    .backends
                    .first()
                    .map(|b| b.id.clone())
                    .ok_or("no backends configured")?,
            };
            let context_tokens = context_tokens.unwrap_or_else(|| estimate_tokens(&task));
            let circuits = Arc::new(CircuitBreakerRegistry::new(&config, metrics.clone()));
            let planner = ExecutionPlanner::new(config.clone(), circuits, metrics.clone());

            let mut request = TaskRequest::new(task, current).with_context_tokens(context_tokens);
            if force {
                request = request.forced();
            }
            if let Some(session) = session {
                request = request.with_session(session);
            }
            let plan = match user.as_deref() {
                Some(user) => {
                    let limiter = RateLimiter::new(&config, metrics.clone());
                    match planner.analyze_for_user(&request, &limiter, user)? {
                        Ok(plan) => plan,
                        Err(verdict) => {
                            print_json(&json!({
                                "rateLimit": {
                                    "allowed": false,
                                    "reason": verdict.reason,
                                    "limit": verdict.limit.map(|l| l.as_str()),
                                }
                            }))?;
                            return Ok(());
                        }
                    }
                }
                None => planner.analyze(&request)?,
            };
            print_json(&json!({ "plan": plan }))?;
        }
        Command::Success { backend } => {
            require_backend(&config, &backend)?;
            let circuits = CircuitBreakerRegistry::new(&config, metrics.clone());
            let state = circuits.record_success(&backend)?;
            ModelAvailability::new(&config).mark(&backend, true, None)?;
            print_json(&json!({ "backend": backend, "state": state }))?;
        }
        Command::Failure { backend, error } => {
            require_backend(&config, &backend)?;
            let circuits = CircuitBreakerRegistry::new(&config, metrics.clone());
            let state = circuits.record_failure(&backend)?;
            ModelAvailability::new(&config).mark(&backend, false, Some(&error))?;
            print_json(&json!({ "backend": backend, "state": state, "error": error }))?;
        }
        Command::Status => {
            let circuits = CircuitBreakerRegistry::new(&config, metrics.clone());
            let limiter = RateLimiter::new(&config, metrics.clone());
            let availability = ModelAvailability::new(&config);
            let log = DecisionLog::new(&config);

            let mut usage = serde_json::Map::new();
            for user in limiter.snapshot()?.into_keys() {
                if let Some(u) = limiter.usage(&user)? {
                    usage.insert(user, serde_json::to_value(u)?);
                }
            }

            print_json(&json!({
                "circuits": circuits.snapshot()?,
                "rateLimits": usage,
                "availability": availability.store().load()?,
                "decisions": log.stats()?,
            }))?;
        }
        Command::Compact {
            dry_run,
            only,
            watch,
        } => {
            let compactor =
                Arc::new(StateCompactor::new(&config, metrics.clone()).with_dry_run(dry_run));
            if watch {
                let period = Duration::from_secs(config.compaction.interval_seconds);
                watch_compaction(compactor, only, period).await?;
            } else {
                let report = run_compaction(&compactor, only)?;
                print_json(&report)?;
            }
        }
    }

    Ok(())
}

fn require_backend(config: &Config, backend: &str) -> Result<(), Box<dyn std::error::Error>> {
    if config.backend(backend).is_none() {
        return Err(format!("unknown backend '{}'", backend).into());
    }
    Ok(())
}

fn run_compaction(
    compactor: &StateCompactor,
    only: Option<Operation>,
) -> routegate::error::AppResult<routegate::compactor::CompactionReport> {
    let now = chrono::Utc::now();
    match only {
        Some(op) => compactor.run_at(op, now),
        None => compactor.run_all_at(now),
    }
}

async fn watch_compaction(
    compactor: Arc<StateCompactor>,
    only: Option<Operation>,
    period: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        interval_secs = period.as_secs(),
        dry_run = compactor.is_dry_run(),
        "Starting compaction watch"
    );
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let worker = compactor.clone();
                match tokio::task::spawn_blocking(move || run_compaction(&worker, only)).await? {
                    Ok(report) => print_json(&report)?,
                    // A failed pass is retried on the next tick
                    Err(e) => tracing::error!(error = %e, "Compaction pass failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping compaction watch");
                return Ok(());
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
