//! Prometheus metrics collection for routegate
//!
//! This module provides metrics instrumentation for tracking:
//! - Routing decisions by how the backend was selected
//! - Delegations by reason
//! - Circuit breaker transitions
//! - Rate-limit rejections by limit
//! - Items touched by each compaction operation
//!
//! All label values come from closed enums so cardinality is fixed at
//! compile time.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// How a routing decision picked its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    RiskOverride,
    ContextOverride,
    Ranked,
}

impl Selection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Selection::RiskOverride => "risk_override",
            Selection::ContextOverride => "context_override",
            Selection::Ranked => "ranked",
        }
    }
}

/// Which rate limit rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    PerMinute,
    PerHour,
    Premium,
}

impl Limit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Limit::PerMinute => "per_minute",
            Limit::PerHour => "per_hour",
            Limit::Premium => "premium",
        }
    }
}

/// Metrics collector for routegate
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    routing_decisions: IntCounterVec,
    routing_duration: HistogramVec,
    delegations: IntCounterVec,
    circuit_transitions: IntCounterVec,
    rate_limit_rejections: IntCounterVec,
    compaction_items: IntCounterVec,
}

impl Metrics {
    /// Create a new Metrics instance
    ///
    /// Registers all metrics with a new Prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails (e.g., duplicate names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let routing_decisions = IntCounterVec::new(
            Opts::new(
                "routegate_routing_decisions_total",
                "Total routing decisions by selection path",
            ),
            &["selection"],
        )?;

        let routing_duration = HistogramVec::new(
            HistogramOpts::new(
                "routegate_routing_duration_ms",
                "Routing decision latency in milliseconds",
            )
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0]),
            &["selection"],
        )?;

        let delegations = IntCounterVec::new(
            Opts::new(
                "routegate_delegations_total",
                "Tasks delegated away from the caller's current backend, by reason",
            ),
            &["reason"],
        )?;

        // Cardinality: 3 target states
        let circuit_transitions = IntCounterVec::new(
            Opts::new(
                "routegate_circuit_transitions_total",
                "Circuit breaker state transitions by target state",
            ),
            &["to"],
        )?;

        let rate_limit_rejections = IntCounterVec::new(
            Opts::new(
                "routegate_rate_limit_rejections_total",
                "Requests rejected by the per-user rate limiter, by limit",
            ),
            &["limit"],
        )?;

        let compaction_items = IntCounterVec::new(
            Opts::new(
                "routegate_compaction_items_total",
                "Items removed, summarized or archived by compaction, by operation",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(routing_decisions.clone()))?;
        registry.register(Box::new(routing_duration.clone()))?;
        registry.register(Box::new(delegations.clone()))?;
        registry.register(Box::new(circuit_transitions.clone()))?;
        registry.register(Box::new(rate_limit_rejections.clone()))?;
        registry.register(Box::new(compaction_items.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            routing_decisions,
            routing_duration,
            delegations,
            circuit_transitions,
            rate_limit_rejections,
            compaction_items,
        })
    }

    /// Record one routing decision and its latency
    ///
    /// # Errors
    ///
    /// Returns an error if `duration_ms` is NaN, infinite, or negative.
    pub fn record_routing(
        &self,
        selection: Selection,
        duration_ms: f64,
    ) -> Result<(), prometheus::Error> {
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            return Err(prometheus::Error::Msg(format!(
                "Histogram value must be finite and non-negative, got: {}",
                duration_ms
            )));
        }
        self.routing_decisions
            .get_metric_with_label_values(&[selection.as_str()])?
            .inc();
        self.routing_duration
            .get_metric_with_label_values(&[selection.as_str()])?
            .observe(duration_ms);
        Ok(())
    }

    /// Record a delegation; `reason` is a `DelegationReason` label
    pub fn record_delegation(&self, reason: &'static str) -> Result<(), prometheus::Error> {
        self.delegations
            .get_metric_with_label_values(&[reason])?
            .inc();
        Ok(())
    }

    /// Record a circuit transition; `to` is a `CircuitState` label
    pub fn record_circuit_transition(&self, to: &'static str) -> Result<(), prometheus::Error> {
        self.circuit_transitions
            .get_metric_with_label_values(&[to])?
            .inc();
        Ok(())
    }

    pub fn record_rate_limit_rejection(&self, limit: Limit) -> Result<(), prometheus::Error> {
        self.rate_limit_rejections
            .get_metric_with_label_values(&[limit.as_str()])?
            .inc();
        Ok(())
    }

    /// Record items touched by a compaction operation
    pub fn record_compaction(
        &self,
        operation: &'static str,
        items: u64,
    ) -> Result<(), prometheus::Error> {
        self.compaction_items
            .get_metric_with_label_values(&[operation])?
            .inc_by(items);
        Ok(())
    }

    /// Render all metrics in Prometheus text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Log a failed metrics update without disturbing the caller
pub(crate) fn warn_on_error(operation: &str, result: Result<(), prometheus::Error>) {
    if let Err(e) = result {
        tracing::warn!(operation, error = %e, "Failed to record metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new_registers_everything() {
        let metrics = Metrics::new().expect("should create metrics");
        metrics.record_routing(Selection::Ranked, 0.4).unwrap();
        metrics.record_delegation("large_context").unwrap();
        metrics.record_circuit_transition("open").unwrap();
        metrics.record_rate_limit_rejection(Limit::PerMinute).unwrap();
        metrics.record_compaction("circuits", 3).unwrap();

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("routegate_routing_decisions_total{selection=\"ranked\"} 1"));
        assert!(text.contains("routegate_delegations_total{reason=\"large_context\"} 1"));
        assert!(text.contains("routegate_circuit_transitions_total{to=\"open\"} 1"));
        assert!(text.contains("routegate_rate_limit_rejections_total{limit=\"per_minute\"} 1"));
        assert!(text.contains("routegate_compaction_items_total{operation=\"circuits\"} 3"));
    }

    #[test]
    fn test_record_routing_rejects_nan() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.record_routing(Selection::Ranked, f64::NAN).is_err());
        assert!(metrics.record_routing(Selection::Ranked, -1.0).is_err());
    }

    #[test]
    fn test_label_strings() {
        assert_eq!(Selection::RiskOverride.as_str(), "risk_override");
        assert_eq!(Selection::ContextOverride.as_str(), "context_override");
        assert_eq!(Limit::Premium.as_str(), "premium");
        assert_eq!(Limit::PerHour.as_str(), "per_hour");
    }
}
