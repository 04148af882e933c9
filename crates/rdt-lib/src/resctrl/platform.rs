//! Platform capability detection for the resource-control filesystem
//!
//! Reads what the kernel exposes under the resctrl mount:
//! - info/L3/cbm_mask for the CAT capacity bit mask
//! - info/MB/bandwidth_gran and info/MB/min_bandwidth for MBA
//! - the root schemata file for the cache instance ids

use super::error::{ResctrlError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Default resctrl mount point
pub const RESCTRL_ROOT: &str = "/sys/fs/resctrl";

/// Default MBA allocation granularity in percent
pub const DEFAULT_MBA_GRANULARITY: u32 = 10;

const SUPPORTED_VENDOR: &str = "GenuineIntel";

/// Which RDT features the node offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdtCapability {
    Cat,
    Mba,
    CatMba,
}

impl RdtCapability {
    fn from_flags(cat: bool, mba: bool) -> Option<Self> {
        match (cat, mba) {
            (true, true) => Some(Self::CatMba),
            (true, false) => Some(Self::Cat),
            (false, true) => Some(Self::Mba),
            (false, false) => None,
        }
    }

    pub fn has_cat(&self) -> bool {
        matches!(self, Self::Cat | Self::CatMba)
    }

    pub fn has_mba(&self) -> bool {
        matches!(self, Self::Mba | Self::CatMba)
    }
}

/// CAT capacity bit mask: the full set of cache ways
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityBitMask(u64);

impl CapacityBitMask {
    /// Parse the hex mask from info/L3/cbm_mask, e.g. "fff" or "0x7ff"
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() {
            return Err(ResctrlError::InvalidCbm(raw.to_string()));
        }

        let value =
            u64::from_str_radix(digits, 16).map_err(|_| ResctrlError::InvalidCbm(raw.to_string()))?;
        Self::from_value(value).ok_or_else(|| ResctrlError::InvalidCbm(raw.to_string()))
    }

    /// Build from a raw value; the mask must be non-zero and contiguous
    pub fn from_value(value: u64) -> Option<Self> {
        if value == 0 {
            return None;
        }
        let shifted = value >> value.trailing_zeros();
        if shifted & shifted.wrapping_add(1) != 0 {
            return None;
        }
        Some(Self(value))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Number of cache ways
    pub fn ways(&self) -> u32 {
        self.0.count_ones()
    }

    /// Mask covering ways `[start, end)`, positioned inside the capacity mask
    pub fn way_mask(&self, start: u32, end: u32) -> Result<u64> {
        let total = self.ways();
        if start >= end || end > total {
            return Err(ResctrlError::InvalidRange { start, end, total });
        }

        let width = end - start;
        let run = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
        Ok(run << (start + self.0.trailing_zeros()))
    }

    /// Number of ways granted to a percentage of the cache, rounded up
    pub fn ways_for_percent(&self, percent: u32) -> Result<u32> {
        if percent == 0 || percent > 100 {
            return Err(ResctrlError::InvalidPercent(percent));
        }
        let total = self.ways();
        Ok(((total * percent + 99) / 100).max(1))
    }
}

/// Static description of the node's resctrl support
#[derive(Debug, Clone)]
pub struct ResctrlInfo {
    pub root: PathBuf,
    pub capability: RdtCapability,
    pub cbm: Option<CapacityBitMask>,
    pub cache_ids: Vec<u32>,
    pub mba_granularity: u32,
    pub mba_min: u32,
}

impl ResctrlInfo {
    /// Probe the resctrl mount and cpuinfo
    pub async fn detect(root: impl Into<PathBuf>, cpuinfo_path: &Path) -> Result<Self> {
        let root = root.into();

        let cpuinfo = fs::read_to_string(cpuinfo_path)
            .await
            .map_err(|e| ResctrlError::io(cpuinfo_path, e))?;
        match parse_vendor(&cpuinfo) {
            Some(vendor) if vendor == SUPPORTED_VENDOR => {}
            Some(vendor) => {
                return Err(ResctrlError::Unsupported(format!("cpu vendor {}", vendor)));
            }
            None => return Err(ResctrlError::Unsupported("unknown cpu vendor".to_string())),
        }

        let cbm_path = root.join("info").join("L3").join("cbm_mask");
        let has_cat = fs::metadata(&cbm_path).await.is_ok();
        let has_mba = fs::metadata(root.join("info").join("MB")).await.is_ok();
        let capability = RdtCapability::from_flags(has_cat, has_mba).ok_or_else(|| {
            ResctrlError::Unsupported(format!("neither CAT nor MBA under {}", root.display()))
        })?;

        let cbm = if has_cat {
            let raw = fs::read_to_string(&cbm_path)
                .await
                .map_err(|e| ResctrlError::io(&cbm_path, e))?;
            Some(CapacityBitMask::parse(&raw)?)
        } else {
            None
        };

        let (mba_granularity, mba_min) = if has_mba {
            let gran = read_u32(&root.join("info").join("MB").join("bandwidth_gran"))
                .await
                .unwrap_or(DEFAULT_MBA_GRANULARITY);
            let min = read_u32(&root.join("info").join("MB").join("min_bandwidth"))
                .await
                .unwrap_or(gran);
            (gran, min)
        } else {
            (DEFAULT_MBA_GRANULARITY, DEFAULT_MBA_GRANULARITY)
        };

        let schemata_path = root.join("schemata");
        let schemata = fs::read_to_string(&schemata_path)
            .await
            .map_err(|e| ResctrlError::io(&schemata_path, e))?;
        let cache_ids = parse_cache_ids(&schemata);
        if cache_ids.is_empty() {
            return Err(ResctrlError::Unsupported(format!(
                "no cache instances in {}",
                schemata_path.display()
            )));
        }

        info!(
            root = %root.display(),
            capability = ?capability,
            cbm = ?cbm.map(|c| format!("{:x}", c.value())),
            cache_ids = ?cache_ids,
            mba_granularity,
            "Detected resctrl platform"
        );

        Ok(Self {
            root,
            capability,
            cbm,
            cache_ids,
            mba_granularity: mba_granularity.max(1),
            mba_min,
        })
    }
}

fn parse_vendor(cpuinfo: &str) -> Option<String> {
    cpuinfo
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "vendor_id")
        .map(|(_, value)| value.trim().to_string())
}

/// Cache ids from the first L3 line of a schemata file, falling back to MB
pub fn parse_cache_ids(schemata: &str) -> Vec<u32> {
    let ids_of = |prefix: &str| -> Option<Vec<u32>> {
        schemata.lines().map(str::trim).find_map(|line| {
            let (resource, domains) = line.split_once(':')?;
            if resource.trim() != prefix {
                return None;
            }
            let mut ids: Vec<u32> = domains
                .split(';')
                .filter_map(|pair| pair.split_once('='))
                .filter_map(|(id, _)| id.trim().parse().ok())
                .collect();
            ids.sort_unstable();
            ids.dedup();
            Some(ids)
        })
    };

    ids_of("L3").or_else(|| ids_of("MB")).unwrap_or_default()
}

async fn read_u32(path: &Path) -> Option<u32> {
    match fs::read_to_string(path).await {
        Ok(content) => content.trim().parse().ok(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Optional resctrl info file not readable");
            None
        }
    }
}
