//! Pod annotation payload describing the requested cache/bandwidth isolation
//!
//! ```json
//! {
//!   "LLC": {"schemata": {"range": [0, 4]}},
//!   "MB":  {"schemata": {"percent": 60},
//!           "schemataPerCache": [{"cacheid": 1, "percent": 30}]}
//! }
//! ```

use super::error::Result;
use serde::{Deserialize, Serialize};

/// Annotation key carrying the isolation request
pub const RESCTRL_ANNOTATION: &str = "node.koordinator.sh/resctrl";

/// Isolation request parsed from the pod annotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResctrlConfig {
    #[serde(rename = "LLC", default)]
    pub llc: ResourceConfig,
    #[serde(rename = "MB", default)]
    pub mb: ResourceConfig,
}

impl ResctrlConfig {
    /// Parse the raw annotation value
    pub fn from_annotation(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Constraint on a single resource dimension (LLC or MB)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default)]
    pub schemata: SchemataConfig,
    #[serde(rename = "schemataPerCache", default)]
    pub schemata_per_cache: Vec<SchemataPerCacheConfig>,
}

impl ResourceConfig {
    /// True when neither a uniform value nor an override is present
    pub fn is_empty(&self) -> bool {
        self.schemata.is_empty() && self.schemata_per_cache.is_empty()
    }
}

/// Uniform value: a percentage or a `[start, end)` cache way range
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemataConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[u32; 2]>,
}

impl SchemataConfig {
    /// Percent with 0 treated as absent
    pub fn percent(&self) -> Option<u32> {
        self.percent.filter(|p| *p != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.percent().is_none() && self.range.is_none()
    }
}

/// Override for one cache instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemataPerCacheConfig {
    #[serde(rename = "cacheid", default)]
    pub cache_id: u32,
    #[serde(flatten)]
    pub schemata: SchemataConfig,
}
