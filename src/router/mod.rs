//! Routing logic for routegate
//!
//! `SemanticRouter` scores backends against the domains detected in a task
//! and produces a `SemanticDecision`; `ExecutionPlanner` turns that decision
//! into a delegate/stay plan with a fallback chain.

pub mod domains;
pub mod planner;
pub mod semantic;

pub use planner::{DelegationReason, ExecutionPlan, ExecutionPlanner, SpawnParams, TaskRequest};
pub use semantic::SemanticRouter;

use crate::models::BackendId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relevance of one domain to a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainScore {
    pub domain: String,
    /// 0..=100
    pub score: f64,
    pub matched_keywords: Vec<String>,
}

/// How well one backend fits a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelExpertise {
    pub backend: BackendId,
    pub agent: Option<String>,
    pub name: String,
    /// 0..=100 after blind-spot adjustments
    pub score: f64,
    pub domain_expertise: BTreeMap<String, f64>,
    pub is_mandatory: bool,
    pub blind_spot_warnings: Vec<String>,
}

/// Alternative backend offered when specialist domains conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlternativeSuggestion {
    pub backend: BackendId,
    pub score: f64,
    pub reason: String,
}

/// Result of one routing call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticDecision {
    pub selected: BackendId,
    /// 0..=100
    pub confidence: f64,
    pub expertise_score: f64,
    pub domains: Vec<DomainScore>,
    /// Admissible backends, best first
    pub rankings: Vec<ModelExpertise>,
    pub risk_override: Option<String>,
    pub context_override: bool,
    pub conflict_detected: bool,
    pub hitl_required: bool,
    pub hitl_message: Option<String>,
    pub alternative: Option<AlternativeSuggestion>,
}

impl SemanticDecision {
    /// Score of `backend` in the ranking, if it was a candidate
    pub fn score_of(&self, backend: &str) -> Option<f64> {
        self.rankings
            .iter()
            .find(|m| m.backend.as_str() == backend)
            .map(|m| m.score)
    }
}

/// Coarse task complexity recorded in the decision log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }
}

/// Estimate token count from a prompt string (simple heuristic: chars / 4)
pub fn estimate_tokens(prompt: &str) -> u64 {
    (prompt.chars().count() / 4) as u64
}

/// Round to one decimal place for stable, readable scores
pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
