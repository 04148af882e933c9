//! RDT engine: the app-level view over the control group store
//!
//! Every mutation and iteration of the store and the app entries runs under
//! a single reader-writer lock. Readers (`get_app`, `get_apps`) share it,
//! writers (`register_app`, `unregister_app`, `rebuild`) hold it exclusively,
//! including across the kernel updates they trigger.

use super::annotation::ResctrlConfig;
use super::error::{ResctrlError, Result};
use super::platform::{RdtCapability, ResctrlInfo};
use super::schemata::ResctrlSchemata;
use super::store::{ControlGroupStore, RemoveOutcome, StoreConfig};
use super::updater::ResctrlUpdater;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Public view of a registered app
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct App {
    pub resctrl: ResctrlSchemata,
    /// Kernel group name, empty while the group could not be created
    pub closid: String,
    /// Raw annotation, empty for apps recovered from disk
    pub annotation: String,
}

struct EngineState {
    store: ControlGroupStore,
    apps: HashMap<String, App>,
}

/// Engine applying per-pod isolation requests to resctrl groups
pub struct RdtEngine {
    info: ResctrlInfo,
    state: RwLock<EngineState>,
}

impl RdtEngine {
    /// Construct the engine; CAT platforms need a valid capacity bit mask.
    ///
    /// [`RdtEngine::rebuild`] must run before the engine serves requests.
    pub fn new(
        info: ResctrlInfo,
        updater: Arc<dyn ResctrlUpdater>,
        config: StoreConfig,
    ) -> Result<Self> {
        if info.capability.has_cat() && info.cbm.is_none() {
            return Err(ResctrlError::InvalidCbm(String::new()));
        }
        if info.cache_ids.is_empty() {
            return Err(ResctrlError::Unsupported("no cache instances".to_string()));
        }

        Ok(Self {
            info,
            state: RwLock::new(EngineState {
                store: ControlGroupStore::new(updater, config),
                apps: HashMap::new(),
            }),
        })
    }

    pub fn capability(&self) -> RdtCapability {
        self.info.capability
    }

    pub fn info(&self) -> &ResctrlInfo {
        &self.info
    }

    /// Reload the control groups from the resctrl filesystem.
    ///
    /// Idempotent: without filesystem changes in between, two calls leave the
    /// same app entries behind.
    pub async fn rebuild(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let EngineState { store, apps } = &mut *state;

        let found = store.init().await?;

        let mut rebuilt = HashMap::with_capacity(found);
        for record in store.active() {
            // the kernel copy wins; a known entry covers an unreadable file
            let resctrl = match ResctrlSchemata::parse_kernel(&record.schemata) {
                Ok(resctrl) => resctrl,
                Err(e) => {
                    warn!(app_id = %record.app_id, error = %e, "Unreadable schemata in recovered group");
                    apps.get(&record.app_id)
                        .map(|app| app.resctrl.clone())
                        .unwrap_or_default()
                }
            };
            let annotation = apps
                .get(&record.app_id)
                .map(|app| app.annotation.clone())
                .unwrap_or_default();

            rebuilt.insert(
                record.app_id.clone(),
                App {
                    resctrl,
                    closid: record.group_id.clone(),
                    annotation,
                },
            );
        }
        *apps = rebuilt;

        debug!(apps = apps.len(), "Engine rebuilt");
        Ok(found)
    }

    /// Parse the annotation and create or update the app's group.
    ///
    /// A parse failure leaves any previous entry untouched.
    pub async fn register_app(&self, app_id: &str, annotation: &str, from_nri: bool) -> Result<App> {
        let config = ResctrlConfig::from_annotation(annotation)?;
        let resctrl = ResctrlSchemata::parse(&config, &self.info)?;
        let text = resctrl.to_text();

        let mut state = self.state.write().await;
        let record = state.store.add_pod(app_id, &text, from_nri).await;

        let previous = state.apps.get(app_id);
        let applied = record.group_id.is_empty() || record.schemata == text;
        let app = if applied {
            App {
                resctrl,
                closid: record.group_id,
                annotation: annotation.to_string(),
            }
        } else {
            // the group kept older schemata, record what the kernel holds
            debug!(app_id = %app_id, requested = %text.trim_end(), "Requested schemata not applied");
            let resctrl = ResctrlSchemata::parse_kernel(&record.schemata)
                .ok()
                .or_else(|| previous.map(|app| app.resctrl.clone()))
                .unwrap_or_default();
            App {
                resctrl,
                closid: record.group_id,
                annotation: previous
                    .map(|app| app.annotation.clone())
                    .unwrap_or_else(|| annotation.to_string()),
            }
        };
        state.apps.insert(app_id.to_string(), app.clone());

        info!(app_id = %app_id, closid = %app.closid, from_nri, schemata = %text.trim_end(), "Registered resctrl app");
        Ok(app)
    }

    /// Remove the app's group; the entry is dropped only once the group is gone
    pub async fn unregister_app(&self, app_id: &str, from_nri: bool) -> Result<RemoveOutcome> {
        let mut state = self.state.write().await;
        let outcome = state.store.remove_pod(app_id, from_nri).await?;

        if outcome == RemoveOutcome::Removed && state.apps.remove(app_id).is_some() {
            info!(app_id = %app_id, from_nri, "Unregistered resctrl app");
        }
        Ok(outcome)
    }

    pub async fn get_app(&self, app_id: &str) -> Option<App> {
        self.state.read().await.apps.get(app_id).cloned()
    }

    /// Snapshot copy of all app entries
    pub async fn get_apps(&self) -> HashMap<String, App> {
        self.state.read().await.apps.clone()
    }

    /// Move the tasks not yet in the app's group into it, returning the delta
    pub async fn assign_tasks(&self, app_id: &str, tasks: &[i32]) -> Result<Vec<i32>> {
        let state = self.state.read().await;
        let Some(app) = state.apps.get(app_id) else {
            return Ok(Vec::new());
        };
        if app.closid.is_empty() || tasks.is_empty() {
            return Ok(Vec::new());
        }

        let updater = state.store.updater();
        let current: HashSet<i32> = updater.read_tasks(&app.closid).await?.into_iter().collect();
        let delta: Vec<i32> = tasks
            .iter()
            .copied()
            .filter(|task| !current.contains(task))
            .collect();
        if delta.is_empty() {
            return Ok(delta);
        }

        let moved = updater.write_tasks(&app.closid, &delta).await?;
        debug!(app_id = %app_id, closid = %app.closid, moved = moved.len(), "Assigned tasks to resctrl group");
        Ok(moved)
    }

    /// Drop removed records whose grace window elapsed
    pub async fn sweep_expired(&self) -> usize {
        self.state.write().await.store.sweep_expired(Instant::now())
    }

    /// Number of groups currently held
    pub async fn group_count(&self) -> usize {
        self.state.read().await.store.active().count()
    }
}
