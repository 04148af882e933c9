//! Schemata codec
//!
//! Converts an isolation request into per-cache-instance L3 masks and MB
//! percentages, and renders/parses the line format of the kernel `schemata`
//! file:
//!
//! ```text
//! L3:0=3;1=3
//! MB:0=80;1=80
//! ```

use super::annotation::{ResctrlConfig, ResourceConfig, SchemataConfig};
use super::error::{ResctrlError, Result};
use super::platform::{CapacityBitMask, ResctrlInfo};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tracing::debug;

const L3_PREFIX: &str = "L3";
const MB_PREFIX: &str = "MB";
const MAX_MBA_PERCENT: u32 = 100;

/// Decoded schema: explicit per-cache entries for each dimension.
///
/// Cache ids without an entry keep whatever the kernel group already has,
/// so a dimension without entries is not rendered at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResctrlSchemata {
    pub l3: BTreeMap<u32, u64>,
    pub mb: BTreeMap<u32, u32>,
}

impl ResctrlSchemata {
    /// Build the decoded schema for a request on the given platform
    pub fn parse(config: &ResctrlConfig, info: &ResctrlInfo) -> Result<Self> {
        let mut schemata = Self::default();

        if !config.mb.is_empty() {
            if info.capability.has_mba() {
                schemata.mb = parse_mb(&config.mb, info)?;
            } else {
                debug!("Ignoring MB request, platform has no MBA");
            }
        }

        if !config.llc.is_empty() {
            if info.capability.has_cat() {
                let cbm = info
                    .cbm
                    .ok_or_else(|| ResctrlError::InvalidCbm(String::new()))?;
                schemata.l3 = parse_l3(&config.llc, &cbm, &info.cache_ids)?;
            } else {
                debug!("Ignoring LLC request, platform has no CAT");
            }
        }

        Ok(schemata)
    }

    pub fn validate_l3(&self) -> bool {
        !self.l3.is_empty()
    }

    pub fn validate_mb(&self) -> bool {
        !self.mb.is_empty()
    }

    /// `L3:<id>=<hex mask>;...`, or empty when no L3 entry exists
    pub fn l3_string(&self) -> String {
        if !self.validate_l3() {
            return String::new();
        }
        render_line(L3_PREFIX, self.l3.iter().map(|(id, mask)| (*id, format!("{:x}", mask))))
    }

    /// `MB:<id>=<percent>;...`, or empty when no MB entry exists
    pub fn mb_string(&self) -> String {
        if !self.validate_mb() {
            return String::new();
        }
        render_line(MB_PREFIX, self.mb.iter().map(|(id, pct)| (*id, pct.to_string())))
    }

    /// Full file content written to a group's `schemata`
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for line in [self.l3_string(), self.mb_string()] {
            if !line.is_empty() {
                text.push_str(&line);
                text.push('\n');
            }
        }
        text
    }

    /// Parse the content of a kernel `schemata` file
    pub fn parse_kernel(text: &str) -> Result<Self> {
        let mut schemata = Self::default();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (resource, domains) = line
                .split_once(':')
                .ok_or_else(|| ResctrlError::MalformedSchemata(line.to_string()))?;

            match resource.trim() {
                L3_PREFIX => {
                    for (id, value) in parse_domains(line, domains)? {
                        let mask = u64::from_str_radix(value, 16)
                            .map_err(|_| ResctrlError::MalformedSchemata(line.to_string()))?;
                        schemata.l3.insert(id, mask);
                    }
                }
                MB_PREFIX => {
                    for (id, value) in parse_domains(line, domains)? {
                        let percent = value
                            .parse()
                            .map_err(|_| ResctrlError::MalformedSchemata(line.to_string()))?;
                        schemata.mb.insert(id, percent);
                    }
                }
                other => debug!(resource = %other, "Skipping unmanaged schemata resource"),
            }
        }

        Ok(schemata)
    }
}

/// Round an MBA percentage up to the 10% step Intel hardware accepts
pub fn calculate_intel(mba_percent: u32) -> u32 {
    round_up(mba_percent, 10)
}

/// Round up to the platform granularity, then clamp into `[min, 100]`
pub fn normalize_mba(percent: u32, granularity: u32, min: u32) -> Result<u32> {
    if percent == 0 || percent > MAX_MBA_PERCENT {
        return Err(ResctrlError::InvalidPercent(percent));
    }
    let rounded = round_up(percent, granularity.max(1)).min(MAX_MBA_PERCENT);
    if rounded != percent {
        debug!(
            requested = percent,
            actual = rounded,
            granularity,
            "MBA percent must be a multiple of the bandwidth granularity"
        );
    }
    Ok(rounded.max(min.min(MAX_MBA_PERCENT)))
}

fn round_up(value: u32, step: u32) -> u32 {
    if value % step == 0 {
        value
    } else {
        (value / step * step).saturating_add(step)
    }
}

fn parse_mb(config: &ResourceConfig, info: &ResctrlInfo) -> Result<BTreeMap<u32, u32>> {
    let mut mb = BTreeMap::new();

    if let Some(percent) = config.schemata.percent() {
        let value = normalize_mba(percent, info.mba_granularity, info.mba_min)?;
        for id in &info.cache_ids {
            mb.insert(*id, value);
        }
    }

    for entry in &config.schemata_per_cache {
        ensure_known_cache(entry.cache_id, &info.cache_ids)?;
        match entry.schemata.percent() {
            Some(percent) => {
                let value = normalize_mba(percent, info.mba_granularity, info.mba_min)?;
                mb.insert(entry.cache_id, value);
            }
            None => debug!(cache_id = entry.cache_id, "MB override without percent ignored"),
        }
    }

    Ok(mb)
}

fn parse_l3(
    config: &ResourceConfig,
    cbm: &CapacityBitMask,
    cache_ids: &[u32],
) -> Result<BTreeMap<u32, u64>> {
    let mut l3 = BTreeMap::new();

    if let Some(mask) = l3_mask(&config.schemata, cbm)? {
        for id in cache_ids {
            l3.insert(*id, mask);
        }
    }

    for entry in &config.schemata_per_cache {
        ensure_known_cache(entry.cache_id, cache_ids)?;
        if let Some(mask) = l3_mask(&entry.schemata, cbm)? {
            l3.insert(entry.cache_id, mask);
        }
    }

    Ok(l3)
}

/// A way range wins over a percentage when both are given
fn l3_mask(schemata: &SchemataConfig, cbm: &CapacityBitMask) -> Result<Option<u64>> {
    if let Some([start, end]) = schemata.range {
        return cbm.way_mask(start, end).map(Some);
    }
    match schemata.percent() {
        Some(percent) => {
            let ways = cbm.ways_for_percent(percent)?;
            cbm.way_mask(0, ways).map(Some)
        }
        None => Ok(None),
    }
}

fn ensure_known_cache(cache_id: u32, cache_ids: &[u32]) -> Result<()> {
    if cache_ids.contains(&cache_id) {
        Ok(())
    } else {
        Err(ResctrlError::UnknownCacheId(cache_id))
    }
}

fn render_line(prefix: &str, domains: impl Iterator<Item = (u32, String)>) -> String {
    let mut line = format!("{}:", prefix);
    for (i, (id, value)) in domains.enumerate() {
        if i > 0 {
            line.push(';');
        }
        let _ = write!(line, "{}={}", id, value);
    }
    line
}

fn parse_domains<'a>(line: &str, domains: &'a str) -> Result<Vec<(u32, &'a str)>> {
    domains
        .split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|domain| {
            let (id, value) = domain
                .split_once('=')
                .ok_or_else(|| ResctrlError::MalformedSchemata(line.to_string()))?;
            let id = id
                .trim()
                .parse()
                .map_err(|_| ResctrlError::MalformedSchemata(line.to_string()))?;
            Ok((id, value.trim()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resctrl::platform::RdtCapability;
    use std::path::PathBuf;

    fn info(cache_ids: Vec<u32>) -> ResctrlInfo {
        ResctrlInfo {
            root: PathBuf::from("/sys/fs/resctrl"),
            capability: RdtCapability::CatMba,
            cbm: CapacityBitMask::from_value(0xfff),
            cache_ids,
            mba_granularity: 10,
            mba_min: 10,
        }
    }

    fn parse(raw: &str, info: &ResctrlInfo) -> Result<ResctrlSchemata> {
        ResctrlSchemata::parse(&ResctrlConfig::from_annotation(raw).unwrap(), info)
    }

    #[test]
    fn test_calculate_intel() {
        assert_eq!(calculate_intel(77), 80);
        assert_eq!(calculate_intel(80), 80);
        assert_eq!(calculate_intel(81), 90);
        assert_eq!(calculate_intel(1), 10);
        for x in 1..=100u32 {
            let r = calculate_intel(x);
            if x % 10 == 0 {
                assert_eq!(r, x);
            } else {
                assert!(r > x && r % 10 == 0 && r - x < 10);
            }
        }
    }

    #[test]
    fn test_calculate_intel_saturates_near_max() {
        let last_step = u32::MAX / 10 * 10;
        assert_eq!(calculate_intel(u32::MAX - 9), last_step);
        assert_eq!(calculate_intel(last_step), last_step);
        assert_eq!(calculate_intel(last_step + 1), u32::MAX);
        assert_eq!(calculate_intel(u32::MAX), u32::MAX);
    }

    #[test]
    fn test_uniform_mb_applies_to_every_instance() {
        let schemata = parse(r#"{"MB":{"schemata":{"percent":77}}}"#, &info(vec![0, 1, 2, 3])).unwrap();

        assert_eq!(schemata.mb.len(), 4);
        assert!(schemata.mb.values().all(|v| *v == 80));
        assert_eq!(schemata.mb_string(), "MB:0=80;1=80;2=80;3=80");
        assert!(!schemata.validate_l3());
        assert_eq!(schemata.l3_string(), "");
        assert_eq!(schemata.to_text(), "MB:0=80;1=80;2=80;3=80\n");
    }

    #[test]
    fn test_llc_range_mask() {
        let schemata = parse(r#"{"LLC":{"schemata":{"range":[0,2]}}}"#, &info(vec![0, 1])).unwrap();

        assert_eq!(schemata.l3.get(&0), Some(&0x003));
        assert_eq!(schemata.l3.get(&1), Some(&0x003));
        assert_eq!(schemata.l3_string(), "L3:0=3;1=3");
        assert!(!schemata.validate_mb());
    }

    #[test]
    fn test_per_cache_overrides() {
        let raw = r#"{
            "LLC": {"schemata": {"range": [0, 4]}, "schemataPerCache": [{"cacheid": 1, "range": [4, 12]}]},
            "MB": {"schemataPerCache": [{"cacheid": 0, "percent": 35}]}
        }"#;
        let schemata = parse(raw, &info(vec![0, 1])).unwrap();

        assert_eq!(schemata.l3_string(), "L3:0=f;1=ff0");
        // only the overridden instance gets an MB entry
        assert_eq!(schemata.mb_string(), "MB:0=40");
        assert_eq!(schemata.to_text(), "L3:0=f;1=ff0\nMB:0=40\n");
    }

    #[test]
    fn test_llc_percent() {
        let schemata = parse(r#"{"LLC":{"schemata":{"percent":50}}}"#, &info(vec![0])).unwrap();
        assert_eq!(schemata.l3.get(&0), Some(&0x03f));
    }

    #[test]
    fn test_mba_capped_and_raised_to_minimum() {
        let mut platform = info(vec![0]);
        platform.mba_granularity = 15;
        platform.mba_min = 20;

        assert_eq!(normalize_mba(95, 15, 20).unwrap(), 100);
        assert_eq!(normalize_mba(5, 15, 20).unwrap(), 20);
        assert!(normalize_mba(101, 10, 10).is_err());

        let schemata = parse(r#"{"MB":{"schemata":{"percent":5}}}"#, &platform).unwrap();
        assert_eq!(schemata.mb.get(&0), Some(&20));
    }

    #[test]
    fn test_invalid_requests() {
        let platform = info(vec![0, 1]);
        assert!(matches!(
            parse(r#"{"LLC":{"schemata":{"range":[0,13]}}}"#, &platform),
            Err(ResctrlError::InvalidRange { .. })
        ));
        assert!(matches!(
            parse(r#"{"LLC":{"schemata":{"range":[5,5]}}}"#, &platform),
            Err(ResctrlError::InvalidRange { .. })
        ));
        assert!(matches!(
            parse(r#"{"MB":{"schemataPerCache":[{"cacheid":7,"percent":50}]}}"#, &platform),
            Err(ResctrlError::UnknownCacheId(7))
        ));
        assert!(matches!(
            parse(r#"{"MB":{"schemata":{"percent":120}}}"#, &platform),
            Err(ResctrlError::InvalidPercent(120))
        ));
    }

    #[test]
    fn test_missing_capability_is_ignored() {
        let mut platform = info(vec![0]);
        platform.capability = RdtCapability::Mba;
        platform.cbm = None;

        let schemata = parse(
            r#"{"LLC":{"schemata":{"range":[0,2]}},"MB":{"schemata":{"percent":50}}}"#,
            &platform,
        )
        .unwrap();
        assert!(!schemata.validate_l3());
        assert_eq!(schemata.mb_string(), "MB:0=50");
    }

    #[test]
    fn test_parse_kernel_text() {
        let text = "    L3:0=7ff;1=3\n    MB:0=100;1=50\nL3CODE:0=fff\n";
        let schemata = ResctrlSchemata::parse_kernel(text).unwrap();

        assert_eq!(schemata.l3.get(&0), Some(&0x7ff));
        assert_eq!(schemata.l3.get(&1), Some(&0x3));
        assert_eq!(schemata.mb.get(&1), Some(&50));
        assert!(ResctrlSchemata::parse_kernel("L3:0").is_err());
        assert!(ResctrlSchemata::parse_kernel("garbage").is_err());
        assert_eq!(ResctrlSchemata::parse_kernel("").unwrap(), ResctrlSchemata::default());
    }

    #[test]
    fn test_render_then_parse_preserves_values() {
        let platform = info(vec![0, 1, 2, 3]);
        let requests = [
            r#"{"MB":{"schemata":{"percent":77}}}"#,
            r#"{"LLC":{"schemata":{"range":[3,9]}}}"#,
            r#"{"LLC":{"schemataPerCache":[{"cacheid":2,"percent":25}]},"MB":{"schemata":{"percent":40}}}"#,
        ];

        for raw in requests {
            let schemata = parse(raw, &platform).unwrap();
            let reparsed = ResctrlSchemata::parse_kernel(&schemata.to_text()).unwrap();
            assert_eq!(reparsed, schemata, "request {}", raw);
        }
    }
}
