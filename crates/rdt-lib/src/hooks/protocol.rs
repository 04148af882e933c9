//! Hook protocol contexts
//!
//! A hook receives one [`HooksProtocol`] value: the request built from the
//! runtime event (or a pod snapshot during reconciliation) and a response
//! the hook fills in. Response fields left as `None` are not applied.

use crate::models::{ContainerMeta, PodInfo, PodMeta};
use crate::nri::api;
use std::collections::HashMap;

/// Resource-control result of a hook
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resctrl {
    /// Rendered schemata text of the pod's group
    pub schemata: String,
    /// Kernel group name the pod's tasks belong to
    pub closid: String,
    /// Task ids moved into the group
    pub new_task_ids: Vec<i32>,
}

/// Resource adjustments a hook asks for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub cpu_set: Option<String>,
    pub cfs_quota: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub memory_limit: Option<i64>,
    pub resctrl: Option<Resctrl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRequest {
    pub pod_meta: PodMeta,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub cgroup_parent: String,
    /// Task ids per container id, filled during reconciliation
    pub container_task_ids: HashMap<String, Vec<i32>>,
}

impl PodRequest {
    fn from_nri(pod: &api::PodSandbox) -> Self {
        Self {
            pod_meta: pod_meta(pod),
            labels: pod.labels.clone(),
            annotations: pod.annotations.clone(),
            cgroup_parent: pod
                .linux
                .as_ref()
                .map(|linux| linux.cgroup_parent.clone())
                .unwrap_or_default(),
            container_task_ids: HashMap::new(),
        }
    }

    fn from_pod(pod: &PodInfo) -> Self {
        Self {
            pod_meta: pod.meta.clone(),
            labels: pod.labels.clone(),
            annotations: pod.annotations.clone(),
            cgroup_parent: pod.cgroup_parent.clone(),
            container_task_ids: pod.container_task_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodResponse {
    pub resources: Resources,
}

/// Context of a pod sandbox event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodContext {
    pub request: PodRequest,
    pub response: PodResponse,
}

impl PodContext {
    pub fn from_nri(pod: &api::PodSandbox) -> Self {
        Self {
            request: PodRequest::from_nri(pod),
            response: PodResponse::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRequest {
    pub pod_meta: PodMeta,
    pub container_meta: ContainerMeta,
    pub pod_labels: HashMap<String, String>,
    pub pod_annotations: HashMap<String, String>,
    pub cgroup_parent: String,
    pub container_envs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerResponse {
    pub resources: Resources,
    pub add_container_envs: HashMap<String, String>,
}

/// Context of a container event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerContext {
    pub request: ContainerRequest,
    pub response: ContainerResponse,
}

impl ContainerContext {
    pub fn from_nri(pod: &api::PodSandbox, container: &api::Container) -> Self {
        Self {
            request: ContainerRequest {
                pod_meta: pod_meta(pod),
                container_meta: ContainerMeta {
                    name: container.name.clone(),
                    id: container.id.clone(),
                },
                pod_labels: pod.labels.clone(),
                pod_annotations: pod.annotations.clone(),
                cgroup_parent: container
                    .linux
                    .as_ref()
                    .map(|linux| linux.cgroups_path.clone())
                    .unwrap_or_default(),
                container_envs: container.env_map(),
            },
            response: ContainerResponse::default(),
        }
    }
}

/// Context of a pod visited by the reconciler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPodContext {
    pub request: PodRequest,
    pub response: PodResponse,
}

impl BatchPodContext {
    pub fn from_pod(pod: &PodInfo) -> Self {
        Self {
            request: PodRequest::from_pod(pod),
            response: PodResponse::default(),
        }
    }
}

/// Every context shape a hook can be invoked with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HooksProtocol {
    Pod(PodContext),
    Container(ContainerContext),
    BatchPod(BatchPodContext),
}

impl HooksProtocol {
    pub fn kind(&self) -> &'static str {
        match self {
            HooksProtocol::Pod(_) => "pod",
            HooksProtocol::Container(_) => "container",
            HooksProtocol::BatchPod(_) => "batch pod",
        }
    }

    pub fn pod_meta(&self) -> &PodMeta {
        match self {
            HooksProtocol::Pod(ctx) => &ctx.request.pod_meta,
            HooksProtocol::Container(ctx) => &ctx.request.pod_meta,
            HooksProtocol::BatchPod(ctx) => &ctx.request.pod_meta,
        }
    }

    pub fn resources(&self) -> &Resources {
        match self {
            HooksProtocol::Pod(ctx) => &ctx.response.resources,
            HooksProtocol::Container(ctx) => &ctx.response.resources,
            HooksProtocol::BatchPod(ctx) => &ctx.response.resources,
        }
    }
}

fn pod_meta(pod: &api::PodSandbox) -> PodMeta {
    PodMeta {
        namespace: pod.namespace.clone(),
        name: pod.name.clone(),
        uid: pod.uid.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> api::PodSandbox {
        api::PodSandbox {
            id: "sandbox-1".to_string(),
            name: "web".to_string(),
            uid: "uid-1".to_string(),
            namespace: "default".to_string(),
            annotations: HashMap::from([("a".to_string(), "b".to_string())]),
            linux: Some(api::LinuxPodSandbox {
                cgroup_parent: "/kubepods/pod-uid-1".to_string(),
                cgroups_path: String::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_context_from_nri() {
        let ctx = PodContext::from_nri(&sandbox());

        assert_eq!(ctx.request.pod_meta.uid, "uid-1");
        assert_eq!(ctx.request.pod_meta.namespace, "default");
        assert_eq!(ctx.request.cgroup_parent, "/kubepods/pod-uid-1");
        assert_eq!(ctx.request.annotations["a"], "b");
        assert_eq!(ctx.response, PodResponse::default());
    }

    #[test]
    fn test_container_context_from_nri() {
        let container = api::Container {
            id: "ctr-1".to_string(),
            name: "app".to_string(),
            env: vec!["PATH=/bin".to_string()],
            ..Default::default()
        };
        let ctx = ContainerContext::from_nri(&sandbox(), &container);

        assert_eq!(ctx.request.container_meta.id, "ctr-1");
        assert_eq!(ctx.request.pod_annotations["a"], "b");
        assert_eq!(ctx.request.container_envs["PATH"], "/bin");
        assert!(ctx.response.resources.resctrl.is_none());
    }

    #[test]
    fn test_batch_pod_context_carries_task_ids() {
        let pod = PodInfo {
            meta: PodMeta {
                uid: "uid-2".to_string(),
                ..Default::default()
            },
            container_task_ids: HashMap::from([("ctr".to_string(), vec![1, 2])]),
            ..Default::default()
        };
        let protocol = HooksProtocol::BatchPod(BatchPodContext::from_pod(&pod));

        assert_eq!(protocol.kind(), "batch pod");
        assert_eq!(protocol.pod_meta().uid, "uid-2");
        let HooksProtocol::BatchPod(ctx) = protocol else {
            unreachable!()
        };
        assert_eq!(ctx.request.container_task_ids["ctr"], vec![1, 2]);
    }
}
