//! Error types for the resctrl engine

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while parsing isolation requests or touching the
/// resource-control filesystem.
#[derive(Debug, Error)]
pub enum ResctrlError {
    #[error("invalid resctrl annotation: {0}")]
    InvalidAnnotation(#[from] serde_json::Error),

    #[error("invalid capacity bit mask {0:?}")]
    InvalidCbm(String),

    #[error("invalid cache way range [{start}, {end}) for {total} ways")]
    InvalidRange { start: u32, end: u32, total: u32 },

    #[error("invalid percent {0}, must be within 1..=100")]
    InvalidPercent(u32),

    #[error("unknown cache id {0}")]
    UnknownCacheId(u32),

    #[error("malformed schemata line {0:?}")]
    MalformedSchemata(String),

    #[error("resctrl is not supported on this node: {0}")]
    Unsupported(String),

    #[error("resctrl i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ResctrlError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for configuration errors, where the request itself is at fault
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAnnotation(_)
                | Self::InvalidCbm(_)
                | Self::InvalidRange { .. }
                | Self::InvalidPercent(_)
                | Self::UnknownCacheId(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ResctrlError>;
