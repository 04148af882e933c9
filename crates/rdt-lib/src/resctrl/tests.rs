//! Tests against a mock resctrl filesystem
//!
//! These build the resctrl mount layout in a temp directory so detection
//! and rebuild can be exercised without RDT hardware.

#[cfg(test)]
mod mock_resctrl_tests {
    use crate::resctrl::{
        FsResctrlUpdater, RdtCapability, RdtEngine, ResctrlError, ResctrlInfo, StoreConfig,
    };
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::fs;

    const INTEL_CPUINFO: &str = "processor\t: 0\nvendor_id\t: GenuineIntel\ncpu family\t: 6\n";

    /// Helper to create a mock resctrl mount with CAT and MBA
    async fn create_mock_resctrl(temp_dir: &TempDir, cat: bool, mba: bool) -> PathBuf {
        let root = temp_dir.path().join("resctrl");
        fs::create_dir_all(root.join("info")).await.unwrap();

        let mut schemata = String::new();
        if cat {
            fs::create_dir_all(root.join("info/L3")).await.unwrap();
            fs::write(root.join("info/L3/cbm_mask"), "fff\n").await.unwrap();
            schemata.push_str("    L3:0=fff;1=fff\n");
        }
        if mba {
            fs::create_dir_all(root.join("info/MB")).await.unwrap();
            fs::write(root.join("info/MB/bandwidth_gran"), "10\n").await.unwrap();
            fs::write(root.join("info/MB/min_bandwidth"), "10\n").await.unwrap();
            schemata.push_str("    MB:0=100;1=100\n");
        }
        fs::write(root.join("schemata"), schemata).await.unwrap();

        root
    }

    async fn create_cpuinfo(temp_dir: &TempDir, content: &str) -> PathBuf {
        let path = temp_dir.path().join("cpuinfo");
        fs::write(&path, content).await.unwrap();
        path
    }

    async fn create_group(root: &Path, name: &str, schemata: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("schemata"), schemata).await.unwrap();
        fs::write(dir.join("tasks"), "").await.unwrap();
    }

    async fn engine_for(root: &Path, cpuinfo: &Path) -> RdtEngine {
        let info = ResctrlInfo::detect(root, cpuinfo).await.unwrap();
        RdtEngine::new(
            info,
            Arc::new(FsResctrlUpdater::new(root)),
            StoreConfig::new(root),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_detect_cat_and_mba() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_resctrl(&temp_dir, true, true).await;
        let cpuinfo = create_cpuinfo(&temp_dir, INTEL_CPUINFO).await;

        let info = ResctrlInfo::detect(&root, &cpuinfo).await.unwrap();

        assert_eq!(info.capability, RdtCapability::CatMba);
        assert_eq!(info.cbm.unwrap().ways(), 12);
        assert_eq!(info.cache_ids, vec![0, 1]);
        assert_eq!(info.mba_granularity, 10);
        assert_eq!(info.mba_min, 10);
    }

    #[tokio::test]
    async fn test_detect_mba_only() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_resctrl(&temp_dir, false, true).await;
        let cpuinfo = create_cpuinfo(&temp_dir, INTEL_CPUINFO).await;

        let info = ResctrlInfo::detect(&root, &cpuinfo).await.unwrap();

        assert_eq!(info.capability, RdtCapability::Mba);
        assert!(info.cbm.is_none());
        assert_eq!(info.cache_ids, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_detect_rejects_other_vendors() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_resctrl(&temp_dir, true, true).await;
        let cpuinfo = create_cpuinfo(&temp_dir, "vendor_id\t: AuthenticAMD\n").await;

        let result = ResctrlInfo::detect(&root, &cpuinfo).await;
        assert!(matches!(result, Err(ResctrlError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_detect_without_features() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_resctrl(&temp_dir, false, false).await;
        let cpuinfo = create_cpuinfo(&temp_dir, INTEL_CPUINFO).await;

        let result = ResctrlInfo::detect(&root, &cpuinfo).await;
        assert!(matches!(result, Err(ResctrlError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_rebuild_recovers_groups_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_resctrl(&temp_dir, true, true).await;
        let cpuinfo = create_cpuinfo(&temp_dir, INTEL_CPUINFO).await;

        create_group(&root, "rdt-pod-a", "L3:0=3;1=3\nMB:0=50;1=50\n").await;
        create_group(&root, "rdt-pod-b", "MB:0=30;1=30\n").await;
        // not managed by the agent
        create_group(&root, "other", "MB:0=10;1=10\n").await;

        let engine = engine_for(&root, &cpuinfo).await;
        assert_eq!(engine.rebuild().await.unwrap(), 2);

        let apps = engine.get_apps().await;
        assert_eq!(apps.len(), 2);

        let pod_a = &apps["pod-a"];
        assert_eq!(pod_a.closid, "rdt-pod-a");
        assert_eq!(pod_a.resctrl.l3.get(&1), Some(&0x3));
        assert_eq!(pod_a.resctrl.mb.get(&0), Some(&50));
        assert!(pod_a.annotation.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_resctrl(&temp_dir, true, true).await;
        let cpuinfo = create_cpuinfo(&temp_dir, INTEL_CPUINFO).await;
        create_group(&root, "rdt-pod-a", "MB:0=50;1=50\n").await;

        let engine = engine_for(&root, &cpuinfo).await;
        engine.rebuild().await.unwrap();
        let first = engine.get_apps().await;
        engine.rebuild().await.unwrap();

        assert_eq!(engine.get_apps().await, first);
    }

    #[tokio::test]
    async fn test_rebuild_drops_vanished_groups() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_resctrl(&temp_dir, true, true).await;
        let cpuinfo = create_cpuinfo(&temp_dir, INTEL_CPUINFO).await;
        create_group(&root, "rdt-pod-a", "MB:0=50;1=50\n").await;

        let engine = engine_for(&root, &cpuinfo).await;
        engine.rebuild().await.unwrap();
        assert!(engine.get_app("pod-a").await.is_some());

        fs::remove_dir_all(root.join("rdt-pod-a")).await.unwrap();
        engine.rebuild().await.unwrap();

        assert!(engine.get_app("pod-a").await.is_none());
    }

    #[tokio::test]
    async fn test_register_writes_group_schemata() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_resctrl(&temp_dir, true, true).await;
        let cpuinfo = create_cpuinfo(&temp_dir, INTEL_CPUINFO).await;

        let engine = engine_for(&root, &cpuinfo).await;
        engine.rebuild().await.unwrap();

        let annotation = r#"{"LLC":{"schemata":{"range":[0,2]}},"MB":{"schemata":{"percent":45}}}"#;
        let app = engine.register_app("pod-a", annotation, true).await.unwrap();
        assert_eq!(app.closid, "rdt-pod-a");

        let content = fs::read_to_string(root.join("rdt-pod-a/schemata"))
            .await
            .unwrap();
        assert_eq!(content, "L3:0=3;1=3\nMB:0=50;1=50\n");

        // a rebuild keeps the annotation of known apps
        engine.rebuild().await.unwrap();
        assert_eq!(engine.get_app("pod-a").await.unwrap().annotation, annotation);
    }

    #[tokio::test]
    async fn test_rebuild_reports_on_disk_schemata() {
        let temp_dir = TempDir::new().unwrap();
        let root = create_mock_resctrl(&temp_dir, true, true).await;
        let cpuinfo = create_cpuinfo(&temp_dir, INTEL_CPUINFO).await;

        let engine = engine_for(&root, &cpuinfo).await;
        engine.rebuild().await.unwrap();

        engine
            .register_app("pod-a", r#"{"MB":{"schemata":{"percent":50}}}"#, true)
            .await
            .unwrap();
        let app = engine
            .register_app("pod-a", r#"{"MB":{"schemata":{"percent":30}}}"#, true)
            .await
            .unwrap();

        let content = fs::read_to_string(root.join("rdt-pod-a/schemata"))
            .await
            .unwrap();
        assert_eq!(content, "MB:0=50;1=50\n");
        assert_eq!(app.resctrl.to_text(), content);

        engine.rebuild().await.unwrap();
        let app = engine.get_app("pod-a").await.unwrap();
        assert_eq!(app.resctrl.to_text(), content);
    }
}
