//! Resource-control hooks
//!
//! Applies the `node.koordinator.sh/resctrl` annotation of a pod through the
//! [`RdtEngine`] and reports the pod's group back to the runtime.

use super::protocol::{BatchPodContext, ContainerContext, HooksProtocol, PodContext, Resctrl};
use super::{Hook, HookError, HookRegistry, HookStage};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::resctrl::{
    FsResctrlUpdater, RdtEngine, RemoveOutcome, ResctrlInfo, StoreConfig, RESCTRL_ANNOTATION,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const NAME: &str = "Resctrl";
const DESCRIPTION: &str = "set resctrl for pod";

/// Owner of the RDT engine and its hooks
pub struct ResctrlPlugin {
    engine: Arc<RdtEngine>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl ResctrlPlugin {
    pub fn new(engine: Arc<RdtEngine>, logger: StructuredLogger) -> Self {
        Self {
            engine,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Detect the platform and load the existing groups.
    ///
    /// Returns `None` when the node cannot do resource control; the caller
    /// then registers no hooks at all.
    pub async fn try_new(
        config: StoreConfig,
        cpuinfo_path: &Path,
        logger: StructuredLogger,
    ) -> Option<Self> {
        let info = match ResctrlInfo::detect(&config.root, cpuinfo_path).await {
            Ok(info) => info,
            Err(e) => {
                warn!(root = %config.root.display(), error = %e, "Resctrl unsupported, plugin disabled");
                return None;
            }
        };

        let updater = Arc::new(FsResctrlUpdater::new(&config.root));
        let engine = match RdtEngine::new(info, updater, config) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(error = %e, "Failed to create RDT engine, plugin disabled");
                return None;
            }
        };

        if let Err(e) = engine.rebuild().await {
            warn!(error = %e, "Failed to load resctrl groups, plugin disabled");
            return None;
        }

        let plugin = Self::new(Arc::new(engine), logger);
        plugin.refresh_group_gauge().await;
        info!(capability = ?plugin.engine.capability(), "Resctrl plugin enabled");
        Some(plugin)
    }

    pub fn engine(&self) -> &Arc<RdtEngine> {
        &self.engine
    }

    /// Register the hooks of every stage this plugin handles
    pub fn register(self: &Arc<Self>, registry: &mut HookRegistry) {
        let hooks = [
            (HookStage::PreRunPodSandbox, HookKind::SetPod),
            (HookStage::PreCreateContainer, HookKind::SetContainer),
            (HookStage::PreUpdateContainerResources, HookKind::SetContainer),
            (HookStage::PreRemoveRunPodSandbox, HookKind::RemovePod),
            (HookStage::ReconcilePod, HookKind::UpdateTaskIds),
        ];
        for (stage, kind) in hooks {
            registry.register(
                stage,
                NAME,
                format!("{} ({})", DESCRIPTION, kind.scope()),
                Arc::new(ResctrlHook {
                    plugin: self.clone(),
                    kind,
                }),
            );
        }
    }

    /// Create or refresh the pod's group from its annotation
    pub async fn set_pod_resctrl_resources(&self, ctx: &mut PodContext) -> Result<(), HookError> {
        let Some(annotation) = ctx.request.annotations.get(RESCTRL_ANNOTATION) else {
            return Ok(());
        };
        let app_id = &ctx.request.pod_meta.uid;

        let app = match self.engine.register_app(app_id, annotation, true).await {
            Ok(app) => app,
            Err(e) => {
                self.metrics.inc_register_errors();
                return Err(e.into());
            }
        };
        self.refresh_group_gauge().await;

        if app.closid.is_empty() {
            warn!(app_id = %app_id, "Resctrl group not created, pod stays in the default group");
            return Ok(());
        }

        let schemata = app.resctrl.to_text();
        self.logger.log_group_applied(app_id, &app.closid, &schemata);
        ctx.response.resources.resctrl = Some(Resctrl {
            schemata,
            closid: app.closid,
            new_task_ids: Vec::new(),
        });
        Ok(())
    }

    /// Point the container at its pod's group
    pub async fn set_container_resctrl_resources(
        &self,
        ctx: &mut ContainerContext,
    ) -> Result<(), HookError> {
        let Some(annotation) = ctx.request.pod_annotations.get(RESCTRL_ANNOTATION) else {
            return Ok(());
        };
        let app_id = &ctx.request.pod_meta.uid;

        let app = match self.engine.get_app(app_id).await {
            Some(app) => app,
            None => {
                // sandbox created before the agent started
                debug!(app_id = %app_id, "Registering resctrl app from container event");
                let app = self.engine.register_app(app_id, annotation, true).await.map_err(|e| {
                    self.metrics.inc_register_errors();
                    e
                })?;
                self.refresh_group_gauge().await;
                app
            }
        };

        if !app.closid.is_empty() {
            ctx.response.resources.resctrl = Some(Resctrl {
                schemata: String::new(),
                closid: app.closid,
                new_task_ids: Vec::new(),
            });
        }
        Ok(())
    }

    /// Remove the pod's group when its sandbox goes away
    pub async fn remove_pod_resctrl_resources(&self, ctx: &mut PodContext) -> Result<(), HookError> {
        let app_id = &ctx.request.pod_meta.uid;
        let annotated = ctx.request.annotations.contains_key(RESCTRL_ANNOTATION);
        if !annotated && self.engine.get_app(app_id).await.is_none() {
            return Ok(());
        }

        match self.engine.unregister_app(app_id, true).await {
            Ok(RemoveOutcome::Removed) => {
                self.metrics.inc_group_removals();
                self.logger.log_group_removed(app_id, true, true);
            }
            Ok(RemoveOutcome::Deferred) => {}
            Err(e) => {
                self.logger.log_group_removed(app_id, true, false);
                return Err(e.into());
            }
        }
        self.refresh_group_gauge().await;
        Ok(())
    }

    /// Re-apply the pod's schemata and move its new tasks into the group
    pub async fn update_pod_task_ids(&self, ctx: &mut BatchPodContext) -> Result<(), HookError> {
        let Some(annotation) = ctx.request.annotations.get(RESCTRL_ANNOTATION) else {
            return Ok(());
        };
        let app_id = &ctx.request.pod_meta.uid;

        let app = match self.engine.register_app(app_id, annotation, false).await {
            Ok(app) => app,
            Err(e) => {
                self.metrics.inc_register_errors();
                return Err(e.into());
            }
        };
        if app.closid.is_empty() {
            return Ok(());
        }

        let mut tasks: Vec<i32> = ctx
            .request
            .container_task_ids
            .values()
            .flatten()
            .copied()
            .collect();
        tasks.sort_unstable();
        tasks.dedup();

        let moved = self.engine.assign_tasks(app_id, &tasks).await?;
        if !moved.is_empty() {
            debug!(app_id = %app_id, closid = %app.closid, moved = moved.len(), "Moved tasks into resctrl group");
        }

        ctx.response.resources.resctrl = Some(Resctrl {
            schemata: app.resctrl.to_text(),
            closid: app.closid,
            new_task_ids: moved,
        });
        Ok(())
    }

    async fn refresh_group_gauge(&self) {
        self.metrics
            .set_resctrl_groups(self.engine.group_count().await as i64);
    }
}

#[derive(Debug, Clone, Copy)]
enum HookKind {
    SetPod,
    SetContainer,
    RemovePod,
    UpdateTaskIds,
}

impl HookKind {
    fn scope(&self) -> &'static str {
        match self {
            HookKind::SetPod | HookKind::RemovePod => "pod",
            HookKind::SetContainer => "container",
            HookKind::UpdateTaskIds => "pod task ids",
        }
    }
}

struct ResctrlHook {
    plugin: Arc<ResctrlPlugin>,
    kind: HookKind,
}

#[async_trait]
impl Hook for ResctrlHook {
    async fn run(&self, protocol: &mut HooksProtocol) -> Result<(), HookError> {
        match (self.kind, protocol) {
            (HookKind::SetPod, HooksProtocol::Pod(ctx)) => {
                self.plugin.set_pod_resctrl_resources(ctx).await
            }
            (HookKind::SetContainer, HooksProtocol::Container(ctx)) => {
                self.plugin.set_container_resctrl_resources(ctx).await
            }
            (HookKind::RemovePod, HooksProtocol::Pod(ctx)) => {
                self.plugin.remove_pod_resctrl_resources(ctx).await
            }
            (HookKind::UpdateTaskIds, HooksProtocol::BatchPod(ctx)) => {
                self.plugin.update_pod_task_ids(ctx).await
            }
            (_, other) => Err(HookError::UnexpectedProtocol {
                hook: NAME,
                protocol: other.kind(),
            }),
        }
    }
}
