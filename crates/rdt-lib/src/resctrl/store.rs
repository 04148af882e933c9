//! Per-pod control group store
//!
//! Tracks one record per app id with the lifecycle
//! `Absent -> Active -> PendingRemoval -> Absent`. The kernel filesystem is
//! the ground truth: [`ControlGroupStore::init`] rebuilds the records from the
//! group directories under the resctrl root, and every state change is
//! written through the configured [`ResctrlUpdater`].

use super::error::{ResctrlError, Result};
use super::updater::ResctrlUpdater;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Prefix of every group directory managed by the agent
pub const GROUP_PREFIX: &str = "rdt-";

/// Grace window protecting fresh records from spurious removals
pub const DEFAULT_REMOVAL_GRACE: Duration = Duration::from_secs(10);

/// Kernel group name for an app id
pub fn group_name(app_id: &str) -> String {
    format!("{}{}", GROUP_PREFIX, app_id)
}

/// Lifecycle status of a control group record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Active,
    PendingRemoval,
}

/// Whether removals requested outside the runtime event path wait for the
/// grace window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    #[default]
    Conservative,
    Aggressive,
}

/// Outcome of a removal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The kernel group is gone
    Removed,
    /// The record is inside its grace window and was kept
    Deferred,
}

/// Control group record
#[derive(Debug, Clone)]
pub struct ControlGroup {
    pub app_id: String,
    /// Non-empty iff the kernel directory is believed to exist
    pub group_id: String,
    /// Last schemata text written to the kernel
    pub schemata: String,
    pub status: GroupStatus,
    pub created_at: Instant,
    /// Set once a removal was applied; the record is swept after it
    pub expires_at: Option<Instant>,
}

impl ControlGroup {
    fn new(app_id: &str, now: Instant) -> Self {
        Self {
            app_id: app_id.to_string(),
            group_id: String::new(),
            schemata: String::new(),
            status: GroupStatus::Active,
            created_at: now,
            expires_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == GroupStatus::Active
    }
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub removal_grace: Duration,
    pub removal_policy: RemovalPolicy,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            removal_grace: DEFAULT_REMOVAL_GRACE,
            removal_policy: RemovalPolicy::default(),
        }
    }
}

/// Keyed store of control group records
pub struct ControlGroupStore {
    groups: HashMap<String, ControlGroup>,
    updater: Arc<dyn ResctrlUpdater>,
    config: StoreConfig,
}

impl ControlGroupStore {
    pub fn new(updater: Arc<dyn ResctrlUpdater>, config: StoreConfig) -> Self {
        Self {
            groups: HashMap::new(),
            updater,
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn updater(&self) -> &Arc<dyn ResctrlUpdater> {
        &self.updater
    }

    /// Rebuild the records from the group directories on disk.
    ///
    /// Existing active records keep their creation time so a periodic
    /// rebuild does not restart their grace window. Returns the number of
    /// groups found.
    pub async fn init(&mut self) -> Result<usize> {
        let root = &self.config.root;
        let mut entries = fs::read_dir(root)
            .await
            .map_err(|e| ResctrlError::io(root, e))?;

        let now = Instant::now();
        let mut found = HashSet::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ResctrlError::io(root, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(app_id) = name.strip_prefix(GROUP_PREFIX) else {
                continue;
            };
            if app_id.is_empty() || !entry.path().is_dir() {
                continue;
            }

            let schemata_path = entry.path().join("schemata");
            let schemata = match fs::read_to_string(&schemata_path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %schemata_path.display(), error = %e, "Skipping resctrl group without readable schemata");
                    continue;
                }
            };

            let record = self
                .groups
                .entry(app_id.to_string())
                .or_insert_with(|| ControlGroup::new(app_id, now));
            if !record.is_active() {
                // the directory came back after a removal
                record.status = GroupStatus::Active;
                record.created_at = now;
                record.expires_at = None;
            }
            record.group_id = name.clone();
            record.schemata = schemata;
            found.insert(app_id.to_string());
        }

        // active records whose directory vanished no longer hold a group
        self.groups
            .retain(|app_id, record| !record.is_active() || found.contains(app_id));

        info!(groups = found.len(), root = %root.display(), "Rebuilt control groups from resctrl");
        Ok(found.len())
    }

    /// Create or update the group of an app.
    ///
    /// Updater failures are logged and leave the record in place so a later
    /// call completes it.
    pub async fn add_pod(&mut self, app_id: &str, schemata: &str, from_nri: bool) -> ControlGroup {
        let now = Instant::now();
        let group = group_name(app_id);

        let needs_create = match self.groups.get(app_id) {
            None => true,
            Some(record) => !record.is_active() || record.group_id.is_empty(),
        };

        let record = self
            .groups
            .entry(app_id.to_string())
            .or_insert_with(|| ControlGroup::new(app_id, now));

        if needs_create {
            if !record.is_active() {
                *record = ControlGroup::new(app_id, now);
            }

            match self.updater.create_group(&group).await {
                Ok(()) => {
                    record.group_id = group.clone();
                    record.created_at = now;
                }
                Err(e) => error!(app_id = %app_id, group = %group, error = %e, "Failed to create resctrl group"),
            }

            if !record.group_id.is_empty() {
                apply_schemata(self.updater.as_ref(), record, schemata).await;
            }
        } else if !from_nri {
            apply_schemata(self.updater.as_ref(), record, schemata).await;
        } else {
            debug!(app_id = %app_id, "Resctrl group already applied");
        }

        record.clone()
    }

    /// Remove the group of an app, honoring the grace window unless the
    /// request comes from the runtime event path or the policy is aggressive
    pub async fn remove_pod(&mut self, app_id: &str, from_nri: bool) -> Result<RemoveOutcome> {
        let now = Instant::now();
        let group = group_name(app_id);
        let grace = self.config.removal_grace;
        let aggressive = self.config.removal_policy == RemovalPolicy::Aggressive;

        if let Some(record) = self.groups.get_mut(app_id) {
            if !record.is_active() {
                return Ok(RemoveOutcome::Removed);
            }

            let expired = now.duration_since(record.created_at) >= grace;
            if !(from_nri || aggressive || expired) {
                debug!(app_id = %app_id, "Resctrl group inside grace window, removal deferred");
                return Ok(RemoveOutcome::Deferred);
            }

            if let Err(e) = self.updater.remove_group(&group).await {
                error!(app_id = %app_id, group = %group, error = %e, "Failed to remove resctrl group");
                return Err(e);
            }

            record.status = GroupStatus::PendingRemoval;
            record.group_id.clear();
            record.expires_at = Some(now + grace);
            return Ok(RemoveOutcome::Removed);
        }

        // no record: clear a group a previous agent instance may have left
        if let Err(e) = self.updater.remove_group(&group).await {
            error!(app_id = %app_id, group = %group, error = %e, "Failed to remove resctrl group");
            return Err(e);
        }
        let mut tombstone = ControlGroup::new(app_id, now);
        tombstone.status = GroupStatus::PendingRemoval;
        tombstone.expires_at = Some(now + grace);
        self.groups.insert(app_id.to_string(), tombstone);

        Ok(RemoveOutcome::Removed)
    }

    /// Drop removed records whose grace window elapsed
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, record| {
            record.is_active() || record.expires_at.map_or(true, |expires| expires > now)
        });
        before - self.groups.len()
    }

    pub fn get(&self, app_id: &str) -> Option<&ControlGroup> {
        self.groups.get(app_id)
    }

    /// Records that currently own a group
    pub fn active(&self) -> impl Iterator<Item = &ControlGroup> {
        self.groups.values().filter(|record| record.is_active())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

async fn apply_schemata(updater: &dyn ResctrlUpdater, record: &mut ControlGroup, schemata: &str) {
    if schemata.is_empty() {
        return;
    }
    match updater.write_schemata(&record.group_id, schemata).await {
        Ok(()) => record.schemata = schemata.to_string(),
        Err(e) => error!(
            app_id = %record.app_id,
            group = %record.group_id,
            error = %e,
            "Failed to update resctrl schemata"
        ),
    }
}
