//! Execution planner
//!
//! Turns a routing decision into a concrete plan: stay on the caller's
//! current backend, or delegate to another one with an ordered fallback
//! chain. Delegation only happens for a nameable reason, so a marginally
//! better score alone never moves a task.
//!
//! The planner is the one place that calls the effectful circuit `admit`:
//! for the backend it hands to the executor, and for each fallback it
//! switches to. Every `analyze` appends one decision-log entry.

use super::domains::{self, classify_complexity, classify_intent};
use super::{Complexity, SemanticDecision, SemanticRouter, estimate_tokens};
use crate::config::{BackendConfig, BlindSpot, Capability, Config};
use crate::decision_log::{DecisionLog, RoutingLogEntry};
use crate::error::{AppError, AppResult};
use crate::metrics::{Metrics, warn_on_error};
use crate::models::circuit::now_ms;
use crate::models::{BackendId, CircuitBreakerRegistry, CircuitState, ModelAvailability};
use crate::rate_limit::{RateLimitVerdict, RateLimiter};
use crate::store::iso_from_ms;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Reason code logged when a task stays where it is
pub const STAY_ON_CURRENT: &str = "stay_on_current";
/// Reason code logged when a failure moves a task down the fallback chain
pub const FALLBACK: &str = "fallback";

/// Why a task was moved off the caller's current backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationReason {
    /// A risk domain mandates the recommended backend
    RiskOverride,
    /// The caller asked for delegation
    Forced,
    RealtimeData,
    LargeContext,
    CostOptimization,
    /// The current backend's circuit rejected the call
    CircuitOpen,
}

impl DelegationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationReason::RiskOverride => "risk_override",
            DelegationReason::Forced => "forced",
            DelegationReason::RealtimeData => "realtime_data",
            DelegationReason::LargeContext => "large_context",
            DelegationReason::CostOptimization => "cost_optimization",
            DelegationReason::CircuitOpen => "circuit_open",
        }
    }
}

/// What the external executor needs to spawn a delegated task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnParams {
    pub backend: BackendId,
    pub agent: Option<String>,
    pub prompt: String,
    pub context_tokens: u64,
    pub hitl_message: Option<String>,
}

/// A task to plan
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub task: String,
    /// Backend the caller is running on
    pub current: String,
    /// Estimated from the task text when absent
    pub context_tokens: Option<u64>,
    pub force_delegate: bool,
    pub session_id: Option<String>,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>, current: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            current: current.into(),
            ..Default::default()
        }
    }

    pub fn with_context_tokens(mut self, tokens: u64) -> Self {
        self.context_tokens = Some(tokens);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force_delegate = true;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Plan for one task, updated as the executor reports failures
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub task_id: String,
    pub session_id: Option<String>,
    pub current: BackendId,
    /// Backend the router selected
    pub recommended: BackendId,
    /// Backend the executor should use now
    pub target: BackendId,
    pub should_delegate: bool,
    pub delegate_reason: Option<DelegationReason>,
    pub intent: String,
    pub complexity: Complexity,
    pub context_tokens: u64,
    pub decision: SemanticDecision,
    /// Ranked admissible backends other than `target`
    pub fallback_models: Vec<BackendId>,
    /// Number of fallback entries already consumed
    pub fallback_index: usize,
    /// Backends that failed, in order
    pub attempted: Vec<BackendId>,
    pub last_error: Option<String>,
    pub spawn_params: Option<SpawnParams>,
    #[serde(skip)]
    prompt: String,
}

impl ExecutionPlan {
    /// Terminal error once `record_failure` has run out of fallbacks
    pub fn exhausted_error(&self) -> AppError {
        AppError::FallbackExhausted {
            attempted: self.attempted.iter().map(|b| b.to_string()).collect(),
            last_error: self
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.fallback_index >= self.fallback_models.len()
    }
}

/// Routing outcome before any circuit is consulted
struct Draft {
    start: Instant,
    session_id: Option<String>,
    prompt: String,
    current: BackendId,
    recommended: BackendId,
    decision: SemanticDecision,
    /// Admissible backends, best first
    ranked: Vec<BackendId>,
    reason: Option<DelegationReason>,
    intent: String,
    complexity: Complexity,
    context_tokens: u64,
}

struct Selection {
    target: BackendId,
    reason: Option<DelegationReason>,
    /// False when every candidate was rejected and the task stays put
    admitted: bool,
}

impl Selection {
    fn admitted(target: &BackendId, reason: Option<DelegationReason>) -> Self {
        Self {
            target: target.clone(),
            reason,
            admitted: true,
        }
    }
}

pub struct ExecutionPlanner {
    config: Arc<Config>,
    router: SemanticRouter,
    circuits: Arc<CircuitBreakerRegistry>,
    log: DecisionLog,
    availability: ModelAvailability,
    metrics: Arc<Metrics>,
}

impl ExecutionPlanner {
    pub fn new(
        config: Arc<Config>,
        circuits: Arc<CircuitBreakerRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            router: SemanticRouter::new(config.clone(), circuits.clone(), metrics.clone()),
            log: DecisionLog::new(&config),
            availability: ModelAvailability::new(&config),
            config,
            circuits,
            metrics,
        }
    }

    pub fn router(&self) -> &SemanticRouter {
        &self.router
    }

    pub fn decision_log(&self) -> &DecisionLog {
        &self.log
    }

    pub fn availability(&self) -> &ModelAvailability {
        &self.availability
    }

    pub fn analyze(&self, request: &TaskRequest) -> AppResult<ExecutionPlan> {
        self.analyze_at(request, now_ms())
    }

    pub fn analyze_at(&self, request: &TaskRequest, now_ms: f64) -> AppResult<ExecutionPlan> {
        let draft = self.draft(request, now_ms)?;
        let selection = self.select_target(&draft, |backend| {
            Ok(self.circuits.admit_at(backend.as_str(), now_ms)?.permitted)
        })?;
        self.finish(draft, selection, now_ms)
    }

    /// Plan a task on behalf of `user`, charging their quota first
    ///
    /// The quota is charged against the backend the plan is expected to run
    /// on, found with non-mutating circuit peeks. A rejected request consumes
    /// no circuit admission and appends no decision-log entry.
    pub fn analyze_for_user(
        &self,
        request: &TaskRequest,
        limiter: &RateLimiter,
        user: &str,
    ) -> AppResult<Result<ExecutionPlan, RateLimitVerdict>> {
        self.analyze_for_user_at(request, limiter, user, now_ms())
    }

    pub fn analyze_for_user_at(
        &self,
        request: &TaskRequest,
        limiter: &RateLimiter,
        user: &str,
        now_ms: f64,
    ) -> AppResult<Result<ExecutionPlan, RateLimitVerdict>> {
        let draft = self.draft(request, now_ms)?;
        let expected = self.select_target(&draft, |backend| {
            self.circuits.peek_at(backend.as_str(), now_ms)
        })?;
        let verdict = limiter.check_rate_limit_at(user, expected.target.as_str(), now_ms / 1000.0)?;
        if !verdict.allowed {
            return Ok(Err(verdict));
        }

        let selection = self.select_target(&draft, |backend| {
            Ok(self.circuits.admit_at(backend.as_str(), now_ms)?.permitted)
        })?;
        self.finish(draft, selection, now_ms).map(Ok)
    }

    /// Route the task and work out why it would move, without touching circuits
    fn draft(&self, request: &TaskRequest, now_ms: f64) -> AppResult<Draft> {
        let start = Instant::now();
        let current = BackendId::new(request.current.clone(), &self.config).map_err(AppError::Config)?;
        let context_tokens = request
            .context_tokens
            .unwrap_or_else(|| estimate_tokens(&request.task));

        let decision =
            self.router
                .route_at(&request.task, context_tokens, Some(current.as_str()), now_ms)?;
        let recommended = decision.selected.clone();
        let intent = classify_intent(&decision.domains);
        let complexity = classify_complexity(&request.task, &decision.domains, context_tokens);
        let ranked = decision.rankings.iter().map(|m| m.backend.clone()).collect();
        let reason = self.delegation_reason(
            request,
            &current,
            &recommended,
            &decision,
            context_tokens,
            complexity,
        );
        Ok(Draft {
            start,
            session_id: request.session_id.clone(),
            prompt: request.task.clone(),
            current,
            recommended,
            decision,
            ranked,
            reason,
            intent,
            complexity,
            context_tokens,
        })
    }

    /// Pick the backend to run on, asking `admit` about each candidate in turn
    ///
    /// A delegating draft tries the recommended backend and then the ranked
    /// ones. A staying draft tries the current backend, then moves on with
    /// `CircuitOpen` if its circuit rejects.
    fn select_target(
        &self,
        draft: &Draft,
        mut admit: impl FnMut(&BackendId) -> AppResult<bool>,
    ) -> AppResult<Selection> {
        let Draft {
            current,
            recommended,
            ranked,
            reason,
            ..
        } = draft;
        if reason.is_some() {
            if admit(recommended)? {
                return Ok(Selection::admitted(recommended, *reason));
            }
            // The current backend is still a valid landing spot here
            for backend in ranked.iter().filter(|b| *b != recommended) {
                if admit(backend)? {
                    return Ok(Selection::admitted(backend, *reason));
                }
            }
        } else {
            if admit(current)? {
                return Ok(Selection::admitted(current, None));
            }
            if recommended != current && admit(recommended)? {
                return Ok(Selection::admitted(recommended, Some(DelegationReason::CircuitOpen)));
            }
            for backend in ranked.iter().filter(|b| *b != recommended && *b != current) {
                if admit(backend)? {
                    return Ok(Selection::admitted(backend, Some(DelegationReason::CircuitOpen)));
                }
            }
        }
        Ok(Selection {
            target: current.clone(),
            reason: None,
            admitted: false,
        })
    }

    fn finish(&self, draft: Draft, selection: Selection, now_ms: f64) -> AppResult<ExecutionPlan> {
        let Selection {
            target,
            mut reason,
            admitted,
        } = selection;
        if !admitted {
            tracing::warn!(
                current = %draft.current,
                "No admissible backend; staying on current backend"
            );
        }
        // A reason that could not land on the recommended backend
        let rerouted = reason.is_some() && target != draft.recommended;
        let should_delegate = target != draft.current;
        if !should_delegate {
            reason = None;
        }
        // Every other ranked backend, best first, so a failing `current`
        // still reaches the recommended backend
        let fallback_models: Vec<BackendId> = draft
            .ranked
            .iter()
            .filter(|b| **b != target)
            .cloned()
            .collect();

        let mut plan = ExecutionPlan {
            task_id: uuid::Uuid::new_v4().to_string(),
            session_id: draft.session_id,
            current: draft.current,
            recommended: draft.recommended,
            target,
            should_delegate,
            delegate_reason: reason,
            intent: draft.intent,
            complexity: draft.complexity,
            context_tokens: draft.context_tokens,
            decision: draft.decision,
            fallback_models,
            fallback_index: 0,
            attempted: Vec::new(),
            last_error: None,
            spawn_params: None,
            prompt: draft.prompt,
        };
        plan.spawn_params = self.spawn_params(&plan);

        // Landing somewhere other than the recommended backend is logged as
        // a fallback so the log shows the mandated backend was skipped
        let reason_code = if rerouted {
            FALLBACK
        } else {
            reason.map_or(STAY_ON_CURRENT, |r| r.as_str())
        };
        let latency_ms = draft.start.elapsed().as_secs_f64() * 1000.0;
        self.log
            .append(&self.log_entry(&plan, rerouted, reason_code, latency_ms, now_ms))?;

        if let Some(reason) = reason {
            warn_on_error(
                "record_delegation",
                self.metrics.record_delegation(reason.as_str()),
            );
            tracing::info!(
                task_id = %plan.task_id,
                from = %plan.current,
                to = %plan.target,
                reason = reason.as_str(),
                rerouted,
                confidence = plan.decision.confidence,
                "Delegating task"
            );
        } else {
            tracing::debug!(
                task_id = %plan.task_id,
                current = %plan.current,
                recommended = %plan.recommended,
                "Staying on current backend"
            );
        }
        Ok(plan)
    }

    /// Apply the delegation rule; `None` means stay
    fn delegation_reason(
        &self,
        request: &TaskRequest,
        current: &BackendId,
        recommended: &BackendId,
        decision: &SemanticDecision,
        context_tokens: u64,
        complexity: Complexity,
    ) -> Option<DelegationReason> {
        if recommended == current {
            return None;
        }
        if decision.risk_override.is_some() {
            return Some(DelegationReason::RiskOverride);
        }
        if request.force_delegate {
            return Some(DelegationReason::Forced);
        }

        let rules = &self.config.routing_rules;
        let current_cfg = self.config.backend(current.as_str());
        let recommended_cfg = self.config.backend(recommended.as_str());
        let has = |cfg: Option<&BackendConfig>, cap: Capability| {
            cfg.is_some_and(|b| b.has_capability(cap))
        };

        if domains::first_match(&request.task, &rules.realtime_keywords).is_some()
            && has(recommended_cfg, Capability::Realtime)
            && !has(current_cfg, Capability::Realtime)
        {
            return Some(DelegationReason::RealtimeData);
        }

        let current_context_limited = current_cfg
            .is_some_and(|b| b.blind_spots.contains(&BlindSpot::ContextLimited));
        let needs_context = decision.context_override
            || (current_context_limited && context_tokens > rules.blind_spot_context_tokens);
        if needs_context && has(recommended_cfg, Capability::LargeContext) {
            return Some(DelegationReason::LargeContext);
        }

        if complexity == Complexity::Simple
            && has(recommended_cfg, Capability::LowCost)
            && !has(current_cfg, Capability::LowCost)
        {
            return Some(DelegationReason::CostOptimization);
        }
        None
    }

    /// First fallback from index `from` that is not in `skip` and is admitted
    ///
    /// Returns the backend and the new fallback index.
    fn admit_next_fallback(
        &self,
        fallbacks: &[BackendId],
        from: usize,
        skip: &[BackendId],
        now_ms: f64,
    ) -> AppResult<Option<(BackendId, usize)>> {
        for (index, backend) in fallbacks.iter().enumerate().skip(from) {
            if skip.contains(backend) {
                continue;
            }
            if self.circuits.admit_at(backend.as_str(), now_ms)?.permitted {
                return Ok(Some((backend.clone(), index + 1)));
            }
        }
        Ok(None)
    }

    fn spawn_params(&self, plan: &ExecutionPlan) -> Option<SpawnParams> {
        plan.should_delegate.then(|| SpawnParams {
            backend: plan.target.clone(),
            agent: self
                .config
                .backend(plan.target.as_str())
                .and_then(|b| b.agent.clone()),
            prompt: plan.prompt.clone(),
            context_tokens: plan.context_tokens,
            hitl_message: plan.decision.hitl_message.clone(),
        })
    }

    fn log_entry(
        &self,
        plan: &ExecutionPlan,
        fallback_triggered: bool,
        reason: &str,
        latency_ms: f64,
        now_ms: f64,
    ) -> RoutingLogEntry {
        RoutingLogEntry {
            timestamp: iso_from_ms(now_ms),
            session_id: plan.session_id.clone(),
            intent: plan.intent.clone(),
            complexity: plan.complexity.as_str().to_string(),
            model_selected: plan.recommended.to_string(),
            model_used: plan.target.to_string(),
            fallback_triggered,
            reason: reason.to_string(),
            context_tokens: plan.context_tokens,
            latency_ms,
        }
    }

    /// Report a successful call on `backend`
    pub fn record_success(&self, plan: &ExecutionPlan, backend: &str) -> AppResult<CircuitState> {
        self.record_success_at(plan, backend, now_ms())
    }

    pub fn record_success_at(
        &self,
        plan: &ExecutionPlan,
        backend: &str,
        now_ms: f64,
    ) -> AppResult<CircuitState> {
        let state = self.circuits.record_success_at(backend, now_ms)?;
        self.availability.mark_at(backend, true, None, now_ms / 1000.0)?;
        tracing::debug!(task_id = %plan.task_id, backend, "Task succeeded");
        Ok(state)
    }

    /// Report a failed call on `backend` and move to the next fallback
    ///
    /// `plan` records the failure either way. Returns the retargeted plan,
    /// or `None` when no fallback is left; the caller then surfaces
    /// `plan.exhausted_error()`.
    pub fn record_failure(
        &self,
        plan: &mut ExecutionPlan,
        backend: &str,
        error: &str,
    ) -> AppResult<Option<ExecutionPlan>> {
        self.record_failure_at(plan, backend, error, now_ms())
    }

    pub fn record_failure_at(
        &self,
        plan: &mut ExecutionPlan,
        backend: &str,
        error: &str,
        now_ms: f64,
    ) -> AppResult<Option<ExecutionPlan>> {
        let start = Instant::now();
        let state = self.circuits.record_failure_at(backend, now_ms)?;
        self.availability
            .mark_at(backend, false, Some(error), now_ms / 1000.0)?;

        let failed = BackendId::from(backend);
        if !plan.attempted.contains(&failed) {
            plan.attempted.push(failed);
        }
        plan.last_error = Some(error.to_string());

        let next = self.admit_next_fallback(
            &plan.fallback_models,
            plan.fallback_index,
            &plan.attempted,
            now_ms,
        )?;
        let Some((target, index)) = next else {
            plan.fallback_index = plan.fallback_models.len();
            tracing::warn!(
                task_id = %plan.task_id,
                backend,
                circuit = state.as_str(),
                attempted = plan.attempted.len(),
                error,
                "Fallback chain exhausted"
            );
            return Ok(None);
        };

        plan.fallback_index = index;
        let mut next = plan.clone();
        next.should_delegate = target != next.current;
        if !next.should_delegate {
            next.delegate_reason = None;
        }
        next.target = target;
        next.spawn_params = self.spawn_params(&next);

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.log
            .append(&self.log_entry(&next, true, FALLBACK, latency_ms, now_ms))?;
        tracing::info!(
            task_id = %next.task_id,
            failed = backend,
            next = %next.target,
            circuit = state.as_str(),
            error,
            "Falling back to next backend"
        );
        Ok(Some(next))
    }
}
