//! Semantic router
//!
//! Scores every backend against the domains detected in a query and picks
//! one, subject to risk and context overrides. The router reads circuit
//! state to drop backends whose circuit would reject a call; it never
//! mutates that state.

use super::domains::{self, RiskMatch};
use super::{AlternativeSuggestion, DomainScore, ModelExpertise, SemanticDecision, round1};
use crate::config::{BackendConfig, BlindSpot, Config};
use crate::error::{AppError, AppResult};
use crate::metrics::{Metrics, Selection, warn_on_error};
use crate::models::circuit::now_ms;
use crate::models::{BackendId, CircuitBreakerRegistry};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

const RISK_OVERRIDE_CONFIDENCE: f64 = 95.0;
const CONTEXT_OVERRIDE_CONFIDENCE: f64 = 90.0;
const SINGLE_CANDIDATE_CONFIDENCE: f64 = 85.0;
const MAX_RANKED_CONFIDENCE: f64 = 95.0;
const BASE_RANKED_CONFIDENCE: f64 = 50.0;
/// Below this, a specialist conflict always asks a human
const CONFLICT_HITL_CONFIDENCE: f64 = 90.0;
const CONTEXT_BLIND_SPOT_FACTOR: f64 = 0.3;

pub struct SemanticRouter {
    config: Arc<Config>,
    circuits: Arc<CircuitBreakerRegistry>,
    metrics: Arc<Metrics>,
}

impl SemanticRouter {
    pub fn new(
        config: Arc<Config>,
        circuits: Arc<CircuitBreakerRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            circuits,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Route a query using the current circuit state
    pub fn route(
        &self,
        query: &str,
        context_tokens: u64,
        current: Option<&str>,
    ) -> AppResult<SemanticDecision> {
        self.route_at(query, context_tokens, current, now_ms())
    }

    pub fn route_at(
        &self,
        query: &str,
        context_tokens: u64,
        current: Option<&str>,
        now_ms: f64,
    ) -> AppResult<SemanticDecision> {
        let start = Instant::now();
        let admissible = self
            .circuits
            .admissible_at(self.config.backends.iter().map(|b| b.id.as_str()), now_ms)?;
        let decision = self.route_with_candidates(query, context_tokens, current, &admissible)?;

        let selection = if decision.risk_override.is_some() {
            Selection::RiskOverride
        } else if decision.context_override {
            Selection::ContextOverride
        } else {
            Selection::Ranked
        };
        warn_on_error(
            "record_routing",
            self.metrics
                .record_routing(selection, start.elapsed().as_secs_f64() * 1000.0),
        );
        tracing::debug!(
            selected = %decision.selected,
            confidence = decision.confidence,
            selection = selection.as_str(),
            domains = decision.domains.len(),
            candidates = decision.rankings.len(),
            hitl = decision.hitl_required,
            "Routing decision"
        );
        Ok(decision)
    }

    /// Route against an explicit set of admissible backends
    ///
    /// Pure: the same inputs always produce the same decision.
    pub fn route_with_candidates(
        &self,
        query: &str,
        context_tokens: u64,
        current: Option<&str>,
        admissible: &HashSet<String>,
    ) -> AppResult<SemanticDecision> {
        let rules = &self.config.routing_rules;
        let domains =
            domains::detect_domains(query, &self.config.domains, rules.max_domain_scores);
        let risk = domains::detect_risk(query, &self.config.risk_domains);
        let mandatory = risk.map(|r| r.domain.mandatory_backend.as_str());

        let scored: Vec<ModelExpertise> = self
            .config
            .backends
            .iter()
            .map(|backend| self.score_backend(backend, query, &domains, context_tokens, mandatory))
            .collect();

        let is_current = |m: &ModelExpertise| current == Some(m.backend.as_str());
        let mut rankings: Vec<ModelExpertise> = scored
            .iter()
            .filter(|m| admissible.contains(m.backend.as_str()))
            .cloned()
            .collect();
        rankings.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| is_current(b).cmp(&is_current(a)))
        });

        let context_override = risk.is_none() && context_tokens > rules.context_override_threshold;
        let (selected, confidence) = match (risk, context_override) {
            (Some(_), _) => (
                mandatory.unwrap_or_default().to_string(),
                RISK_OVERRIDE_CONFIDENCE,
            ),
            (None, true) => (
                rules.large_context_backend.clone(),
                CONTEXT_OVERRIDE_CONFIDENCE,
            ),
            (None, false) => {
                let top = rankings.first().ok_or_else(|| {
                    AppError::NoBackendAvailable(format!(
                        "every configured backend is rejected by its circuit breaker ({} configured)",
                        self.config.backends.len()
                    ))
                })?;
                let confidence = match rankings.get(1) {
                    Some(second) => (BASE_RANKED_CONFIDENCE + top.score - second.score)
                        .min(MAX_RANKED_CONFIDENCE),
                    None => SINGLE_CANDIDATE_CONFIDENCE,
                };
                (top.backend.as_str().to_string(), confidence)
            }
        };
        let confidence = round1(confidence);
        let expertise_score = scored
            .iter()
            .find(|m| m.backend.as_str() == selected)
            .map_or(0.0, |m| m.score);

        let (conflict_detected, alternative) =
            self.detect_conflict(&domains, &scored, &selected, admissible);

        let mut hitl_message = None;
        if risk.is_none() && confidence < rules.confidence_threshold {
            hitl_message = Some(self.low_confidence_message(&selected, confidence, &domains, &scored));
        }
        if conflict_detected && confidence < CONFLICT_HITL_CONFIDENCE {
            let conflict = self.conflict_message(alternative.as_ref());
            hitl_message = Some(match hitl_message {
                Some(existing) => format!("{existing} {conflict}"),
                None => conflict,
            });
        }

        Ok(SemanticDecision {
            selected: BackendId::from(selected),
            confidence,
            expertise_score,
            domains,
            rankings,
            risk_override: risk.as_ref().map(RiskMatch::reason),
            context_override,
            conflict_detected,
            hitl_required: hitl_message.is_some(),
            hitl_message,
            alternative,
        })
    }

    fn score_backend(
        &self,
        backend: &BackendConfig,
        query: &str,
        domains: &[DomainScore],
        context_tokens: u64,
        mandatory: Option<&str>,
    ) -> ModelExpertise {
        let rules = &self.config.routing_rules;
        let default = rules.default_expertise;

        let mut domain_expertise = BTreeMap::new();
        let mut weighted = 0.0;
        let mut weights = 0.0;
        for domain in domains {
            let expertise = f64::from(backend.expertise_for(&domain.domain, default));
            let weight = domain.score / 100.0;
            domain_expertise.insert(domain.domain.clone(), expertise);
            weighted += expertise * weight;
            weights += weight;
        }
        let mut score = if weights > 0.0 {
            weighted / weights
        } else {
            f64::from(backend.routine.unwrap_or(default))
        };

        let threshold = rules.blind_spot_context_tokens;
        let mut warnings = Vec::new();
        for spot in &backend.blind_spots {
            match spot {
                BlindSpot::ContextLimited if context_tokens > threshold => {
                    score *= 1.0 - CONTEXT_BLIND_SPOT_FACTOR;
                    warnings.push(format!(
                        "{} degrades above {} context tokens ({} requested)",
                        backend.name, threshold, context_tokens
                    ));
                }
                BlindSpot::ContextUnlimited if context_tokens > threshold => {
                    let excess = if threshold == 0 {
                        1.0
                    } else {
                        ((context_tokens - threshold) as f64 / threshold as f64).min(1.0)
                    };
                    score *= 1.0 + CONTEXT_BLIND_SPOT_FACTOR * excess;
                }
                BlindSpot::Keyword {
                    keywords,
                    penalty_pct,
                    warning,
                } => {
                    if domains::first_match(query, keywords).is_some() {
                        score *= 1.0 - penalty_pct / 100.0;
                        warnings.push(warning.clone());
                    }
                }
                BlindSpot::ContextLimited | BlindSpot::ContextUnlimited => {}
            }
        }

        ModelExpertise {
            backend: BackendId::from(backend),
            agent: backend.agent.clone(),
            name: backend.name.clone(),
            score: round1(score.clamp(0.0, 100.0)),
            domain_expertise,
            is_mandatory: mandatory == Some(backend.id.as_str()),
            blind_spot_warnings: warnings,
        }
    }

    /// Conflict flag and, when flagged, the specialist the router did not pick
    fn detect_conflict(
        &self,
        domains: &[DomainScore],
        scored: &[ModelExpertise],
        selected: &str,
        admissible: &HashSet<String>,
    ) -> (bool, Option<AlternativeSuggestion>) {
        let Some(conflict) = &self.config.routing_rules.conflict else {
            return (false, None);
        };
        let present = |name: &str| domains.iter().any(|d| d.domain == name);
        if !(present(conflict.concurrency_domain.as_str())
            && present(conflict.precision_domain.as_str()))
        {
            return (false, None);
        }

        let score_of = |id: &str| {
            scored
                .iter()
                .find(|m| m.backend.as_str() == id)
                .map_or(0.0, |m| m.score)
        };
        let concurrency = (
            conflict.concurrency_specialist.as_str(),
            conflict.concurrency_domain.as_str(),
        );
        let precision = (
            conflict.precision_specialist.as_str(),
            conflict.precision_domain.as_str(),
        );
        let ((alt, alt_domain), (other, _)) = if selected == concurrency.0 {
            (precision, concurrency)
        } else if selected == precision.0 {
            (concurrency, precision)
        } else if score_of(precision.0) > score_of(concurrency.0) {
            (precision, concurrency)
        } else {
            (concurrency, precision)
        };

        let alternative = (alt != selected && admissible.contains(alt)).then(|| {
            AlternativeSuggestion {
                backend: BackendId::from(alt),
                score: score_of(alt),
                reason: format!(
                    "{} specialist {} scores {:.1} against {:.1} for {}",
                    alt_domain,
                    alt,
                    score_of(alt),
                    score_of(other),
                    other
                ),
            }
        });
        (true, alternative)
    }

    fn low_confidence_message(
        &self,
        selected: &str,
        confidence: f64,
        domains: &[DomainScore],
        scored: &[ModelExpertise],
    ) -> String {
        let best = scored.iter().find(|m| m.backend.as_str() == selected);
        let name = best.map_or(selected, |m| m.name.as_str());
        let score = best.map_or(0.0, |m| m.score);
        let basis = match domains.first() {
            Some(top) => format!(
                "{} expertise {:.1} for detected domain {} (relevance {:.1})",
                name, score, top.domain, top.score
            ),
            None => format!("{} routine expertise {:.1}, no domain detected", name, score),
        };
        format!(
            "Low routing confidence ({:.1}%). Best guess: {} based on {}. Confirm before proceeding.",
            confidence, name, basis
        )
    }

    fn conflict_message(&self, alternative: Option<&AlternativeSuggestion>) -> String {
        match alternative {
            Some(alt) => format!(
                "Concurrency and precision requirements conflict; consider {} ({}).",
                alt.backend, alt.reason
            ),
            None => "Concurrency and precision requirements conflict.".to_string(),
        }
    }
}
