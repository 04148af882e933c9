//! Agent configuration

use anyhow::{Context, Result};
use rdt_lib::hooks::FailurePolicy;
use rdt_lib::nri::{DEFAULT_EVENTS, DEFAULT_PLUGIN_IDX, DEFAULT_PLUGIN_NAME};
use rdt_lib::resctrl::{RemovalPolicy, RESCTRL_ROOT};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Mount point of the resctrl filesystem
    #[serde(default = "default_resctrl_root")]
    pub resctrl_root: PathBuf,

    #[serde(default = "default_cpuinfo_path")]
    pub cpuinfo_path: PathBuf,

    /// Socket the container runtime serves NRI on
    #[serde(default = "default_nri_socket_path")]
    pub nri_socket_path: PathBuf,

    #[serde(default = "default_nri_plugin_name")]
    pub nri_plugin_name: String,

    #[serde(default = "default_nri_plugin_idx")]
    pub nri_plugin_idx: String,

    /// Comma separated NRI events to subscribe to
    #[serde(default = "default_nri_events")]
    pub nri_events: String,

    /// Reconcile interval in seconds
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Grace window of fresh resctrl groups in seconds
    #[serde(default = "default_removal_grace")]
    pub removal_grace_secs: u64,

    /// Let reconciliation remove groups inside their grace window
    #[serde(default)]
    pub aggressive_removal: bool,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_resctrl_root() -> PathBuf {
    PathBuf::from(RESCTRL_ROOT)
}

fn default_cpuinfo_path() -> PathBuf {
    PathBuf::from("/proc/cpuinfo")
}

fn default_nri_socket_path() -> PathBuf {
    PathBuf::from("/var/run/nri/nri.sock")
}

fn default_nri_plugin_name() -> String {
    DEFAULT_PLUGIN_NAME.to_string()
}

fn default_nri_plugin_idx() -> String {
    DEFAULT_PLUGIN_IDX.to_string()
}

fn default_nri_events() -> String {
    DEFAULT_EVENTS.to_string()
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_removal_grace() -> u64 {
    10
}

impl AgentConfig {
    /// Load configuration from `RDT_AGENT_*` environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("RDT_AGENT"))
            .build()
            .context("failed to read agent configuration")?;

        config
            .try_deserialize()
            .context("invalid agent configuration")
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn removal_grace(&self) -> Duration {
        Duration::from_secs(self.removal_grace_secs)
    }

    pub fn removal_policy(&self) -> RemovalPolicy {
        if self.aggressive_removal {
            RemovalPolicy::Aggressive
        } else {
            RemovalPolicy::Conservative
        }
    }
}
