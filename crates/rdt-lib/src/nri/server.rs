//! NRI plugin server
//!
//! Turns runtime events into hook runs and maps the hook responses back
//! onto NRI container adjustments and updates.

use super::api::{
    Container, ContainerAdjustment, ContainerUpdate, Event, EventMask, LinuxResources, PodSandbox,
};
use super::error::NriError;
use crate::hooks::{
    ContainerContext, FailurePolicy, HookRegistry, HookStage, HooksProtocol, PodContext,
    Resources,
};
use crate::models::{PodInfo, PodMeta};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::reconciler::PodsProvider;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PLUGIN_NAME: &str = "rdt_agent";
pub const DEFAULT_PLUGIN_IDX: &str = "00";
pub const DEFAULT_EVENTS: &str = "RunPodSandbox,RemovePodSandbox,CreateContainer,UpdateContainer";

/// Callbacks of an NRI plugin; events a plugin does not handle are no-ops
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn configure(
        &self,
        config: &str,
        runtime: &str,
        version: &str,
    ) -> Result<EventMask, NriError>;

    async fn synchronize(
        &self,
        _pods: Vec<PodSandbox>,
        _containers: Vec<Container>,
    ) -> Result<Vec<ContainerUpdate>, NriError> {
        Ok(Vec::new())
    }

    async fn shutdown(&self) {}

    async fn run_pod_sandbox(&self, _pod: &PodSandbox) -> Result<(), NriError> {
        Ok(())
    }

    async fn stop_pod_sandbox(&self, _pod: &PodSandbox) -> Result<(), NriError> {
        Ok(())
    }

    async fn remove_pod_sandbox(&self, _pod: &PodSandbox) -> Result<(), NriError> {
        Ok(())
    }

    async fn create_container(
        &self,
        _pod: &PodSandbox,
        _container: &Container,
    ) -> Result<(ContainerAdjustment, Vec<ContainerUpdate>), NriError> {
        Ok((ContainerAdjustment::default(), Vec::new()))
    }

    async fn post_create_container(
        &self,
        _pod: &PodSandbox,
        _container: &Container,
    ) -> Result<(), NriError> {
        Ok(())
    }

    async fn start_container(&self, _pod: &PodSandbox, _container: &Container) -> Result<(), NriError> {
        Ok(())
    }

    async fn post_start_container(
        &self,
        _pod: &PodSandbox,
        _container: &Container,
    ) -> Result<(), NriError> {
        Ok(())
    }

    async fn update_container(
        &self,
        _pod: &PodSandbox,
        _container: &Container,
        _resources: Option<&LinuxResources>,
    ) -> Result<Vec<ContainerUpdate>, NriError> {
        Ok(Vec::new())
    }

    async fn post_update_container(
        &self,
        _pod: &PodSandbox,
        _container: &Container,
    ) -> Result<(), NriError> {
        Ok(())
    }

    async fn stop_container(
        &self,
        _pod: &PodSandbox,
        _container: &Container,
    ) -> Result<Vec<ContainerUpdate>, NriError> {
        Ok(Vec::new())
    }

    async fn remove_container(&self, _pod: &PodSandbox, _container: &Container) -> Result<(), NriError> {
        Ok(())
    }

    /// Called once the connection to the runtime is gone
    async fn on_close(&self) {}
}

/// Lifecycle of the plugin connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Unconfigured,
    Configured,
    Running,
    Closed,
}

/// Settings handed over by the runtime in `Configure`
#[derive(Debug, Default, Deserialize)]
struct PluginConfig {
    #[serde(default, rename = "logFile", alias = "logfile")]
    log_file: Option<String>,
    #[serde(default)]
    events: Vec<String>,
}

impl PluginConfig {
    fn parse(raw: &str) -> Result<Self, NriError> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Yaml))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[derive(Debug, Clone)]
pub struct NriServerOptions {
    pub plugin_name: String,
    pub plugin_idx: String,
    /// Comma separated events subscribed when the runtime sends no config
    pub events: String,
    pub failure_policy: FailurePolicy,
}

impl Default for NriServerOptions {
    fn default() -> Self {
        Self {
            plugin_name: DEFAULT_PLUGIN_NAME.to_string(),
            plugin_idx: DEFAULT_PLUGIN_IDX.to_string(),
            events: DEFAULT_EVENTS.to_string(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct KnownContainer {
    sandbox_id: String,
    pid: u32,
}

/// Sandboxes and containers the runtime reported
#[derive(Debug, Clone, Default)]
pub struct SandboxStore {
    pods: Arc<DashMap<String, PodSandbox>>,
    containers: Arc<DashMap<String, KnownContainer>>,
    synced: Arc<AtomicBool>,
}

impl SandboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pod(&self, pod: &PodSandbox) {
        self.pods.insert(pod.id.clone(), pod.clone());
    }

    pub fn remove_pod(&self, sandbox_id: &str) {
        self.pods.remove(sandbox_id);
        self.containers
            .retain(|_, container| container.sandbox_id != sandbox_id);
    }

    pub fn insert_container(&self, container: &Container) {
        self.containers.insert(
            container.id.clone(),
            KnownContainer {
                sandbox_id: container.pod_sandbox_id.clone(),
                pid: container.pid,
            },
        );
    }

    pub fn remove_container(&self, container_id: &str) {
        self.containers.remove(container_id);
    }

    /// Replace the whole view with the runtime's current state
    pub fn replace(&self, pods: &[PodSandbox], containers: &[Container]) {
        self.pods.clear();
        self.containers.clear();
        for pod in pods {
            self.insert_pod(pod);
        }
        for container in containers {
            self.insert_container(container);
        }
        self.synced.store(true, Ordering::Release);
    }

    pub fn get_pod(&self, sandbox_id: &str) -> Option<PodSandbox> {
        self.pods.get(sandbox_id).map(|pod| pod.clone())
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Pod snapshots with the known container pids
    pub fn snapshot(&self) -> Vec<PodInfo> {
        let mut task_ids: HashMap<String, HashMap<String, Vec<i32>>> = HashMap::new();
        for entry in self.containers.iter() {
            if entry.pid == 0 {
                continue;
            }
            let Ok(pid) = i32::try_from(entry.pid) else {
                continue;
            };
            task_ids
                .entry(entry.sandbox_id.clone())
                .or_default()
                .insert(entry.key().clone(), vec![pid]);
        }

        self.pods
            .iter()
            .map(|pod| PodInfo {
                meta: PodMeta {
                    namespace: pod.namespace.clone(),
                    name: pod.name.clone(),
                    uid: pod.uid.clone(),
                },
                labels: pod.labels.clone(),
                annotations: pod.annotations.clone(),
                cgroup_parent: pod
                    .linux
                    .as_ref()
                    .map(|linux| linux.cgroup_parent.clone())
                    .unwrap_or_default(),
                container_task_ids: task_ids.remove(pod.key()).unwrap_or_default(),
            })
            .collect()
    }
}

#[async_trait]
impl PodsProvider for SandboxStore {
    async fn get_all_pods(&self) -> Vec<PodInfo> {
        self.snapshot()
    }

    fn has_synced(&self) -> bool {
        self.is_synced()
    }
}

struct ServerState {
    state: PluginState,
    mask: EventMask,
    journal: Option<File>,
}

/// NRI plugin driving the registered hooks
pub struct NriServer {
    options: NriServerOptions,
    hooks: Arc<HookRegistry>,
    sandboxes: SandboxStore,
    inner: Mutex<ServerState>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl NriServer {
    pub fn new(
        options: NriServerOptions,
        hooks: Arc<HookRegistry>,
        logger: StructuredLogger,
    ) -> Result<Self, NriError> {
        let mask = EventMask::parse(&[options.events.as_str()])?;
        Ok(Self {
            options,
            hooks,
            sandboxes: SandboxStore::new(),
            inner: Mutex::new(ServerState {
                state: PluginState::Unconfigured,
                mask,
                journal: None,
            }),
            metrics: AgentMetrics::new(),
            logger,
        })
    }

    pub fn options(&self) -> &NriServerOptions {
        &self.options
    }

    pub fn sandboxes(&self) -> &SandboxStore {
        &self.sandboxes
    }

    pub async fn state(&self) -> PluginState {
        self.inner.lock().await.state
    }

    pub async fn event_mask(&self) -> EventMask {
        self.inner.lock().await.mask
    }

    /// Mark the connection closed; later events are rejected
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != PluginState::Closed {
            info!(plugin = %self.options.plugin_name, "NRI plugin closed");
        }
        inner.state = PluginState::Closed;
        inner.journal = None;
    }

    /// Count, journal and gate one event
    async fn accept(&self, event: &str, line: String) -> Result<(), NriError> {
        let mut inner = self.inner.lock().await;
        if inner.state == PluginState::Closed {
            return Err(NriError::Closed);
        }
        self.metrics.inc_nri_event(event);

        if let Some(journal) = inner.journal.as_mut() {
            let entry = format!("{} {}\n", event, line);
            let written = match journal.write_all(entry.as_bytes()).await {
                Ok(()) => journal.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(error = %e, "Failed to write NRI event journal");
            }
        }
        Ok(())
    }

    async fn run_pod_hooks(&self, stage: HookStage, pod: &PodSandbox) -> PodContext {
        let mut protocol = HooksProtocol::Pod(PodContext::from_nri(pod));
        if let Err(e) = self
            .hooks
            .run_hooks(self.options.failure_policy, stage, &mut protocol)
            .await
        {
            error!(stage = %stage, pod = %pod.uid, error = %e, "Hooks run error");
        }
        match protocol {
            HooksProtocol::Pod(ctx) => ctx,
            _ => PodContext::default(),
        }
    }

    async fn run_container_hooks(
        &self,
        stage: HookStage,
        pod: &PodSandbox,
        container: &Container,
    ) -> ContainerContext {
        let mut protocol = HooksProtocol::Container(ContainerContext::from_nri(pod, container));
        if let Err(e) = self
            .hooks
            .run_hooks(self.options.failure_policy, stage, &mut protocol)
            .await
        {
            error!(stage = %stage, pod = %pod.uid, container = %container.name, error = %e, "Hooks run error");
        }
        match protocol {
            HooksProtocol::Container(ctx) => ctx,
            _ => ContainerContext::default(),
        }
    }

    async fn pod_event(
        &self,
        event: Event,
        stage: Option<HookStage>,
        pod: &PodSandbox,
    ) -> Result<(), NriError> {
        self.accept(event.name(), pod_line(pod)).await?;
        self.logger.log_nri_event(event.name(), &pod_name(pod), None);
        if let Some(stage) = stage {
            self.run_pod_hooks(stage, pod).await;
        }
        Ok(())
    }

    async fn container_event(
        &self,
        event: Event,
        pod: &PodSandbox,
        container: &Container,
    ) -> Result<(), NriError> {
        self.accept(event.name(), container_line(pod, container))
            .await?;
        self.logger
            .log_nri_event(event.name(), &pod_name(pod), Some(&container.name));
        Ok(())
    }
}

#[async_trait]
impl Plugin for NriServer {
    async fn configure(
        &self,
        config: &str,
        runtime: &str,
        version: &str,
    ) -> Result<EventMask, NriError> {
        info!(runtime = %runtime, version = %version, config = %config, "Got NRI configuration");

        let mut inner = self.inner.lock().await;
        if inner.state == PluginState::Closed {
            return Err(NriError::Closed);
        }

        if !config.trim().is_empty() {
            let parsed = PluginConfig::parse(config)?;
            if !parsed.events.is_empty() {
                inner.mask = EventMask::parse(&parsed.events)?;
            }
            if let Some(path) = parsed.log_file.filter(|p| !p.is_empty()) {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .map_err(|source| NriError::LogFile {
                        path: path.clone(),
                        source,
                    })?;
                inner.journal = Some(file);
            }
        }

        inner.state = PluginState::Configured;
        info!(events = %inner.mask, "NRI plugin configured");
        Ok(inner.mask)
    }

    async fn synchronize(
        &self,
        pods: Vec<PodSandbox>,
        containers: Vec<Container>,
    ) -> Result<Vec<ContainerUpdate>, NriError> {
        self.accept(
            "Synchronize",
            format!("pods={} containers={}", pods.len(), containers.len()),
        )
        .await?;

        self.sandboxes.replace(&pods, &containers);
        for pod in &pods {
            self.run_pod_hooks(HookStage::PreRunPodSandbox, pod).await;
        }

        self.inner.lock().await.state = PluginState::Running;
        info!(pods = pods.len(), containers = containers.len(), "Synchronized with runtime");
        Ok(Vec::new())
    }

    async fn shutdown(&self) {
        info!("Runtime requested plugin shutdown");
        self.close().await;
    }

    async fn run_pod_sandbox(&self, pod: &PodSandbox) -> Result<(), NriError> {
        self.sandboxes.insert_pod(pod);
        self.pod_event(Event::RunPodSandbox, Some(HookStage::PreRunPodSandbox), pod)
            .await
    }

    async fn stop_pod_sandbox(&self, pod: &PodSandbox) -> Result<(), NriError> {
        self.pod_event(Event::StopPodSandbox, Some(HookStage::PostStopPodSandbox), pod)
            .await
    }

    async fn remove_pod_sandbox(&self, pod: &PodSandbox) -> Result<(), NriError> {
        let result = self
            .pod_event(
                Event::RemovePodSandbox,
                Some(HookStage::PreRemoveRunPodSandbox),
                pod,
            )
            .await;
        self.sandboxes.remove_pod(&pod.id);
        result
    }

    async fn create_container(
        &self,
        pod: &PodSandbox,
        container: &Container,
    ) -> Result<(ContainerAdjustment, Vec<ContainerUpdate>), NriError> {
        self.container_event(Event::CreateContainer, pod, container)
            .await?;
        self.sandboxes.insert_container(container);

        let ctx = self
            .run_container_hooks(HookStage::PreCreateContainer, pod, container)
            .await;

        let mut adjust = ContainerAdjustment::default();
        if has_resources(&ctx.response.resources) {
            apply_resources(&ctx.response.resources, adjust.linux_resources_mut());
        }
        let mut envs: Vec<_> = ctx.response.add_container_envs.iter().collect();
        envs.sort();
        for (key, value) in envs {
            adjust.add_env(key, value);
        }

        Ok((adjust, Vec::new()))
    }

    async fn post_create_container(
        &self,
        pod: &PodSandbox,
        container: &Container,
    ) -> Result<(), NriError> {
        self.container_event(Event::PostCreateContainer, pod, container)
            .await
    }

    async fn start_container(&self, pod: &PodSandbox, container: &Container) -> Result<(), NriError> {
        self.sandboxes.insert_container(container);
        self.container_event(Event::StartContainer, pod, container)
            .await
    }

    async fn post_start_container(
        &self,
        pod: &PodSandbox,
        container: &Container,
    ) -> Result<(), NriError> {
        self.sandboxes.insert_container(container);
        self.container_event(Event::PostStartContainer, pod, container)
            .await
    }

    async fn update_container(
        &self,
        pod: &PodSandbox,
        container: &Container,
        _resources: Option<&LinuxResources>,
    ) -> Result<Vec<ContainerUpdate>, NriError> {
        self.container_event(Event::UpdateContainer, pod, container)
            .await?;

        let ctx = self
            .run_container_hooks(HookStage::PreUpdateContainerResources, pod, container)
            .await;

        let mut update = ContainerUpdate::new(&container.id);
        if has_resources(&ctx.response.resources) {
            apply_resources(&ctx.response.resources, update.linux_resources_mut());
        }
        if update.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![update])
    }

    async fn post_update_container(
        &self,
        pod: &PodSandbox,
        container: &Container,
    ) -> Result<(), NriError> {
        self.container_event(Event::PostUpdateContainer, pod, container)
            .await
    }

    async fn stop_container(
        &self,
        pod: &PodSandbox,
        container: &Container,
    ) -> Result<Vec<ContainerUpdate>, NriError> {
        self.container_event(Event::StopContainer, pod, container)
            .await?;
        Ok(Vec::new())
    }

    async fn remove_container(&self, pod: &PodSandbox, container: &Container) -> Result<(), NriError> {
        self.sandboxes.remove_container(&container.id);
        self.container_event(Event::RemoveContainer, pod, container)
            .await
    }

    async fn on_close(&self) {
        self.close().await;
    }
}

fn has_resources(resources: &Resources) -> bool {
    resources.cpu_set.is_some()
        || resources.cfs_quota.is_some()
        || resources.cpu_shares.is_some()
        || resources.memory_limit.is_some()
        || resources
            .resctrl
            .as_ref()
            .is_some_and(|resctrl| !resctrl.closid.is_empty())
}

/// Copy the populated hook response fields; unset fields stay untouched
fn apply_resources(resources: &Resources, linux: &mut LinuxResources) {
    if let Some(cpus) = &resources.cpu_set {
        linux.set_cpuset_cpus(cpus);
    }
    if let Some(quota) = resources.cfs_quota {
        linux.set_cpu_quota(quota);
    }
    if let Some(shares) = resources.cpu_shares {
        match u64::try_from(shares) {
            Ok(shares) => linux.set_cpu_shares(shares),
            Err(_) => debug!(shares, "Ignoring negative cpu shares"),
        }
    }
    if let Some(limit) = resources.memory_limit {
        linux.set_memory_limit(limit);
    }
    if let Some(resctrl) = resources.resctrl.as_ref().filter(|r| !r.closid.is_empty()) {
        linux.set_rdt_class(&resctrl.closid);
    }
}

fn pod_name(pod: &PodSandbox) -> String {
    format!("{}/{}", pod.namespace, pod.name)
}

fn pod_line(pod: &PodSandbox) -> String {
    format!("pod={} uid={} sandbox={}", pod_name(pod), pod.uid, pod.id)
}

fn container_line(pod: &PodSandbox, container: &Container) -> String {
    format!(
        "pod={} container={} id={} pid={}",
        pod_name(pod),
        container.name,
        container.id,
        container.pid
    )
}
