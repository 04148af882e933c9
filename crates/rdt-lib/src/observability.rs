//! Observability infrastructure for the RDT agent
//!
//! Provides:
//! - Prometheus metrics (resctrl groups, hook and reconcile latency, NRI events)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    resctrl_groups: IntGauge,
    register_errors: IntCounter,
    group_removals: IntCounter,
    nri_events: IntCounterVec,
    hook_latency_seconds: Histogram,
    reconcile_latency_seconds: Histogram,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            resctrl_groups: register_int_gauge!(
                "rdt_agent_resctrl_groups",
                "Number of resctrl control groups held by the agent"
            )
            .expect("Failed to register resctrl_groups"),

            register_errors: register_int_counter!(
                "rdt_agent_register_errors_total",
                "Total number of rejected resctrl annotations"
            )
            .expect("Failed to register register_errors"),

            group_removals: register_int_counter!(
                "rdt_agent_group_removals_total",
                "Total number of resctrl control groups removed"
            )
            .expect("Failed to register group_removals"),

            nri_events: register_int_counter_vec!(
                "rdt_agent_nri_events_total",
                "Total number of NRI events handled",
                &["event"]
            )
            .expect("Failed to register nri_events"),

            hook_latency_seconds: register_histogram!(
                "rdt_agent_hook_latency_seconds",
                "Time spent running hooks for one stage",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register hook_latency_seconds"),

            reconcile_latency_seconds: register_histogram!(
                "rdt_agent_reconcile_latency_seconds",
                "Time spent in one reconciliation cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_latency_seconds"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn set_resctrl_groups(&self, count: i64) {
        self.inner().resctrl_groups.set(count);
    }

    pub fn inc_register_errors(&self) {
        self.inner().register_errors.inc();
    }

    pub fn inc_group_removals(&self) {
        self.inner().group_removals.inc();
    }

    /// Count one handled NRI event
    pub fn inc_nri_event(&self, event: &str) {
        self.inner().nri_events.with_label_values(&[event]).inc();
    }

    pub fn observe_hook_latency(&self, duration_secs: f64) {
        self.inner().hook_latency_seconds.observe(duration_secs);
    }

    pub fn observe_reconcile_latency(&self, duration_secs: f64) {
        self.inner().reconcile_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for group changes,
/// runtime events, and agent lifecycle.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log a group that received a schemata
    pub fn log_group_applied(&self, app_id: &str, closid: &str, schemata: &str) {
        info!(
            event = "resctrl_group_applied",
            node = %self.node_name,
            app_id = %app_id,
            closid = %closid,
            schemata = %schemata.trim_end(),
            "Applied resctrl group"
        );
    }

    /// Log a group removal, or a removal that failed
    pub fn log_group_removed(&self, app_id: &str, from_nri: bool, success: bool) {
        if success {
            info!(
                event = "resctrl_group_removed",
                node = %self.node_name,
                app_id = %app_id,
                from_nri = from_nri,
                "Removed resctrl group"
            );
        } else {
            warn!(
                event = "resctrl_group_removed",
                node = %self.node_name,
                app_id = %app_id,
                from_nri = from_nri,
                success = false,
                "Failed to remove resctrl group"
            );
        }
    }

    /// Log a runtime event received over NRI
    pub fn log_nri_event(&self, event: &str, pod: &str, container: Option<&str>) {
        info!(
            event = "nri_event",
            node = %self.node_name,
            nri_event = %event,
            pod = %pod,
            container = ?container,
            "Handled NRI event"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, capability: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            capability = %capability,
            "RDT agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "RDT agent shutting down"
        );
    }
}
