//! Periodic node pod reconciliation
//!
//! Compares the engine's resctrl apps against the pods the node currently
//! runs. Pods still asking for isolation get their schemata and task ids
//! re-applied through the `ReconcilePod` hooks; apps of pods that are gone
//! or dropped the annotation are unregistered.

use crate::health::{components, HealthRegistry};
use crate::hooks::{BatchPodContext, FailurePolicy, HookRegistry, HookStage, HooksProtocol};
use crate::models::PodInfo;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::resctrl::{RdtEngine, RemovalPolicy, RemoveOutcome, RESCTRL_ANNOTATION};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Source of the pods running on this node
#[async_trait]
pub trait PodsProvider: Send + Sync {
    async fn get_all_pods(&self) -> Vec<PodInfo>;

    /// Whether the provider has seen the full pod set at least once
    fn has_synced(&self) -> bool;
}

/// Fixed pod list, always synced
#[derive(Debug, Clone, Default)]
pub struct StaticPodsProvider {
    pods: Vec<PodInfo>,
}

impl StaticPodsProvider {
    pub fn new(pods: Vec<PodInfo>) -> Self {
        Self { pods }
    }
}

#[async_trait]
impl PodsProvider for StaticPodsProvider {
    async fn get_all_pods(&self) -> Vec<PodInfo> {
        self.pods.clone()
    }

    fn has_synced(&self) -> bool {
        true
    }
}

/// Configuration for the reconcile loop
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Time between two cycles (default: 30 seconds)
    pub interval: Duration,
    pub failure_policy: FailurePolicy,
    /// Aggressive removal skips the grace window of fresh groups
    pub removal_policy: RemovalPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_policy: FailurePolicy::default(),
            removal_policy: RemovalPolicy::default(),
        }
    }
}

/// Outcome of one reconcile cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Groups found on disk
    pub groups: usize,
    /// Annotated pods whose hooks ran
    pub reconciled: usize,
    /// Stale apps whose group was removed
    pub removed: usize,
    /// Stale apps kept because their grace window is still open
    pub deferred: usize,
    /// Tombstones dropped after their grace window
    pub swept: usize,
}

pub struct Reconciler {
    engine: Arc<RdtEngine>,
    hooks: Arc<HookRegistry>,
    provider: Arc<dyn PodsProvider>,
    config: ReconcileConfig,
    health: Option<Arc<HealthRegistry>>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl Reconciler {
    pub fn new(
        engine: Arc<RdtEngine>,
        hooks: Arc<HookRegistry>,
        provider: Arc<dyn PodsProvider>,
        config: ReconcileConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            engine,
            hooks,
            provider,
            config,
            health: None,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Report cycle outcomes to the health registry
    pub fn with_health(mut self, health: Arc<HealthRegistry>) -> Self {
        self.health = Some(health);
        self
    }

    /// Run one cycle; `None` while the provider has not synced yet
    pub async fn reconcile_once(&self) -> crate::resctrl::Result<Option<ReconcileReport>> {
        if !self.provider.has_synced() {
            debug!("Pod provider not synced, skipping reconcile");
            return Ok(None);
        }

        let start = Instant::now();
        let mut report = ReconcileReport {
            groups: self.engine.rebuild().await?,
            ..Default::default()
        };

        let pods = self.provider.get_all_pods().await;
        let mut wanted = HashSet::new();

        for pod in pods.iter().filter(|pod| pod.annotation(RESCTRL_ANNOTATION).is_some()) {
            wanted.insert(pod.meta.uid.clone());

            let mut protocol = HooksProtocol::BatchPod(BatchPodContext::from_pod(pod));
            match self
                .hooks
                .run_hooks(self.config.failure_policy, HookStage::ReconcilePod, &mut protocol)
                .await
            {
                Ok(()) => report.reconciled += 1,
                Err(e) => warn!(
                    pod = %pod.meta.uid,
                    namespace = %pod.meta.namespace,
                    name = %pod.meta.name,
                    error = %e,
                    "Failed to reconcile pod"
                ),
            }
        }

        let from_nri = self.config.removal_policy == RemovalPolicy::Aggressive;
        let mut stale: Vec<String> = self
            .engine
            .get_apps()
            .await
            .into_keys()
            .filter(|app_id| !wanted.contains(app_id))
            .collect();
        stale.sort();

        for app_id in stale {
            match self.engine.unregister_app(&app_id, from_nri).await {
                Ok(RemoveOutcome::Removed) => {
                    report.removed += 1;
                    self.metrics.inc_group_removals();
                    self.logger.log_group_removed(&app_id, from_nri, true);
                }
                Ok(RemoveOutcome::Deferred) => report.deferred += 1,
                Err(e) => {
                    warn!(app_id = %app_id, error = %e, "Failed to remove stale resctrl group");
                    self.logger.log_group_removed(&app_id, from_nri, false);
                }
            }
        }

        report.swept = self.engine.sweep_expired().await;

        self.metrics
            .set_resctrl_groups(self.engine.group_count().await as i64);
        self.metrics
            .observe_reconcile_latency(start.elapsed().as_secs_f64());

        debug!(
            groups = report.groups,
            reconciled = report.reconciled,
            removed = report.removed,
            deferred = report.deferred,
            swept = report.swept,
            "Reconcile cycle complete"
        );
        Ok(Some(report))
    }

    /// Reconcile on every tick until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting reconcile loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = self.reconcile_once().await;
                    self.report_health(&result).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down reconcile loop");
                    break;
                }
            }
        }
    }

    async fn report_health(&self, result: &crate::resctrl::Result<Option<ReconcileReport>>) {
        let Some(health) = &self.health else {
            return;
        };
        match result {
            Ok(Some(_)) => health.set_healthy(components::RECONCILER).await,
            Ok(None) => {
                health
                    .set_degraded(components::RECONCILER, "waiting for pod sync")
                    .await
            }
            Err(e) => {
                warn!(error = %e, "Reconcile cycle failed");
                health
                    .set_unhealthy(components::RECONCILER, e.to_string())
                    .await
            }
        }
    }
}
