//! Resource-control (RDT) engine
//!
//! This module turns per-pod isolation annotations into resctrl control
//! groups. It covers platform detection, the schemata codec, the per-pod
//! group store and the engine that serializes access to both.

mod annotation;
mod engine;
mod error;
mod platform;
mod schemata;
mod store;
mod updater;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod tests;

pub use annotation::{
    ResctrlConfig, ResourceConfig, SchemataConfig, SchemataPerCacheConfig, RESCTRL_ANNOTATION,
};
pub use engine::{App, RdtEngine};
pub use error::{ResctrlError, Result};
pub use platform::{
    parse_cache_ids, CapacityBitMask, RdtCapability, ResctrlInfo, DEFAULT_MBA_GRANULARITY,
    RESCTRL_ROOT,
};
pub use schemata::{calculate_intel, normalize_mba, ResctrlSchemata};
pub use store::{
    group_name, ControlGroup, ControlGroupStore, GroupStatus, RemovalPolicy, RemoveOutcome,
    StoreConfig, DEFAULT_REMOVAL_GRACE, GROUP_PREFIX,
};
pub use updater::{FsResctrlUpdater, ResctrlUpdater};

#[cfg(test)]
pub(crate) use testing::MockUpdater;
