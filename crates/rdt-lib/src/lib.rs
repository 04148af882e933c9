//! Agent library for per-pod cache and memory bandwidth isolation
//!
//! This crate provides the core functionality for:
//! - RDT platform detection and resctrl control group management
//! - Hook dispatch for pod and container lifecycle stages
//! - The NRI plugin adapter
//! - Periodic reconciliation against the node's pods
//! - Health checks and observability

pub mod health;
pub mod hooks;
pub mod models;
pub mod nri;
pub mod observability;
pub mod reconciler;
pub mod resctrl;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use hooks::{FailurePolicy, HookRegistry, HookStage, ResctrlPlugin};
pub use models::*;
pub use nri::{NriServer, NriServerOptions, SandboxStore, Stub};
pub use observability::{AgentMetrics, StructuredLogger};
pub use reconciler::{PodsProvider, ReconcileConfig, Reconciler, StaticPodsProvider};
pub use resctrl::{App, RdtEngine, ResctrlInfo, StoreConfig};
