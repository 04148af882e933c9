//! Hook dispatch for runtime lifecycle stages
//!
//! Plugins register named hooks per [`HookStage`]. The NRI server and the
//! reconciler run every hook of a stage in registration order against one
//! [`HooksProtocol`] context, under a [`FailurePolicy`].

mod protocol;
mod resctrl;

pub use protocol::{
    BatchPodContext, ContainerContext, ContainerRequest, ContainerResponse, HooksProtocol,
    PodContext, PodRequest, PodResponse, Resctrl, Resources,
};
pub use resctrl::ResctrlPlugin;

use crate::observability::AgentMetrics;
use crate::resctrl::ResctrlError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Lifecycle points hooks can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookStage {
    PreRunPodSandbox,
    PostStopPodSandbox,
    PreRemoveRunPodSandbox,
    PreCreateContainer,
    PreUpdateContainerResources,
    ReconcilePod,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a stage does when one of its hooks fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Stop at the first error and return it
    Fail,
    /// Log the error and keep running the remaining hooks
    #[default]
    Ignore,
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook {hook} cannot handle a {protocol} context")]
    UnexpectedProtocol {
        hook: &'static str,
        protocol: &'static str,
    },

    #[error(transparent)]
    Resctrl(#[from] ResctrlError),

    #[error("hook {hook} failed at {stage}: {source}")]
    Failed {
        hook: String,
        stage: HookStage,
        #[source]
        source: Box<HookError>,
    },
}

/// A callback run against a protocol context
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, protocol: &mut HooksProtocol) -> Result<(), HookError>;
}

struct RegisteredHook {
    name: String,
    description: String,
    hook: Arc<dyn Hook>,
}

/// Named hooks per stage, in registration order
#[derive(Default)]
pub struct HookRegistry {
    stages: HashMap<HookStage, Vec<RegisteredHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        stage: HookStage,
        name: impl Into<String>,
        description: impl Into<String>,
        hook: Arc<dyn Hook>,
    ) {
        let name = name.into();
        let description = description.into();
        debug!(stage = %stage, hook = %name, description = %description, "Registered hook");
        self.stages.entry(stage).or_default().push(RegisteredHook {
            name,
            description,
            hook,
        });
    }

    /// Names and descriptions of the hooks of a stage
    pub fn hooks(&self, stage: HookStage) -> Vec<(&str, &str)> {
        self.stages
            .get(&stage)
            .map(|hooks| {
                hooks
                    .iter()
                    .map(|h| (h.name.as_str(), h.description.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.values().all(Vec::is_empty)
    }

    /// Run the hooks of a stage in order
    pub async fn run_hooks(
        &self,
        policy: FailurePolicy,
        stage: HookStage,
        protocol: &mut HooksProtocol,
    ) -> Result<(), HookError> {
        let Some(hooks) = self.stages.get(&stage) else {
            return Ok(());
        };

        let start = Instant::now();
        let mut result = Ok(());

        for registered in hooks {
            match registered.hook.run(protocol).await {
                Ok(()) => debug!(stage = %stage, hook = %registered.name, "Hook succeeded"),
                Err(e) => match policy {
                    FailurePolicy::Fail => {
                        result = Err(HookError::Failed {
                            hook: registered.name.clone(),
                            stage,
                            source: Box::new(e),
                        });
                        break;
                    }
                    FailurePolicy::Ignore => warn!(
                        stage = %stage,
                        hook = %registered.name,
                        pod = %protocol.pod_meta().uid,
                        error = %e,
                        "Hook failed, continuing"
                    ),
                },
            }
        }

        AgentMetrics::new().observe_hook_latency(start.elapsed().as_secs_f64());
        result
    }
}
