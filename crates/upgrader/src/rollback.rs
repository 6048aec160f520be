//! The rollback engine.
//!
//! Rollback consumes a snapshot: locate it (the `-latest` pointer or a
//! versioned entry), clear the current target with the same layered
//! algorithm deploys use, copy the snapshot back, and reconcile the version
//! record. There is no automatic remediation when a rollback fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use tracing::{info, warn};

use crate::backup::{BACKUP_INFO_FILE, BackupStore};
use crate::config::AgentConfig;
use crate::deploy_paths::{
    current_version, record_deploy_path, recorded_deploy_path, write_version_record,
};
use crate::error::AgentError;
use crate::fsutil::{self, PreservedPatterns};
use crate::progress::OperationProgress;
use crate::types::{Project, ProgressStep, RollbackReport, UNKNOWN_VERSION, VersionRecord};

pub struct RollbackEngine {
    cfg: Arc<AgentConfig>,
    backups: BackupStore,
    device_id: String,
}

impl RollbackEngine {
    pub fn new(cfg: Arc<AgentConfig>, device_id: impl Into<String>) -> Self {
        let backups = BackupStore::new(cfg.dirs.backup_dir.clone());
        Self {
            cfg,
            backups,
            device_id: device_id.into(),
        }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Whether any snapshot exists for the project (drives the
    /// `rollbackAvailable` flag pushed with system updates).
    pub fn rollback_available(&self, project: Project) -> bool {
        self.backups.resolve_latest(project).is_some()
            || self
                .backups
                .list(project)
                .map(|entries| !entries.is_empty())
                .unwrap_or(false)
    }

    /// Restore a snapshot into the project's target directory.
    pub async fn rollback(
        &self,
        project: Project,
        target_version: Option<&str>,
        preserved: &PreservedPatterns,
        progress: &OperationProgress<'_>,
    ) -> Result<RollbackReport, AgentError> {
        progress.emit(ProgressStep::Preparing, 5, "查找可用备份");
        let (snapshot_path, snapshot_name) = self.locate_snapshot(project, target_version)?;

        let target = self.resolve_target(project, &snapshot_path);
        let version = self.resolve_version(&snapshot_path);
        info!(
            project = %project,
            snapshot = snapshot_name,
            target = %target.display(),
            version,
            "rollback starting"
        );
        progress.emit(
            ProgressStep::Preparing,
            15,
            format!("使用备份 {snapshot_name}"),
        );

        let access = crate::paths::check_accessibility(&target);
        if !access.accessible || !access.writable {
            return Err(AgentError::RollbackFailed(format!(
                "部署目录不可访问: {}",
                access.reason.unwrap_or_default()
            )));
        }

        progress.emit(ProgressStep::Cleaning, 30, "清空目标目录");
        fsutil::clear_directory(&target, preserved)
            .await
            .map_err(|e| AgentError::RollbackFailed(format!("{e:#}")))?;

        progress.emit(ProgressStep::Deploying, 60, "恢复备份内容");
        let skipped_log: Mutex<std::collections::BTreeSet<String>> = Mutex::new(Default::default());
        let stats = fsutil::copy_dir_filtered(&snapshot_path, &target, &|rel| {
            if rel == BACKUP_INFO_FILE {
                return true;
            }
            if !preserved.is_empty() && preserved.matches(rel) {
                let root = rel.split('/').next().unwrap_or(rel).to_string();
                if skipped_log
                    .lock()
                    .expect("skip log poisoned")
                    .insert(root.clone())
                {
                    info!(entry = root, "preserved path skipped during restore");
                }
                return true;
            }
            false
        })
        .map_err(|e| AgentError::RollbackFailed(format!("{e:#}")))?;
        progress.emit(
            ProgressStep::Deploying,
            80,
            format!("恢复完成({} 个文件)", stats.files),
        );

        // Reconcile the version record: a missing or placeholder record gets
        // the resolved version, marked as synthesized by a rollback.
        if current_version(&target).is_none() {
            write_version_record(
                &target,
                &VersionRecord {
                    project: project.to_string(),
                    version: version.clone(),
                    deploy_time: Utc::now(),
                    package_path: snapshot_path.to_string_lossy().into_owned(),
                    device_id: self.device_id.clone(),
                    source: Some("rollback".to_string()),
                },
            )
            .map_err(|e| AgentError::RollbackFailed(format!("{e:#}")))?;
        }
        progress.emit(ProgressStep::Verifying, 90, "校验回滚结果");

        let recorded = current_version(&target).unwrap_or_else(|| version.clone());
        record_deploy_path(&self.cfg.deploy_paths_file(), project, &target, &recorded)
            .map_err(|e| AgentError::RollbackFailed(format!("{e:#}")))?;
        progress.emit(ProgressStep::Verifying, 95, "部署路径已更新");

        Ok(RollbackReport {
            project,
            version: recorded,
            deploy_path: target,
            snapshot_name,
        })
    }

    /// Locate the snapshot to restore: `-latest` for an unversioned rollback,
    /// otherwise the newest (or version-matching) historical entry.
    fn locate_snapshot(
        &self,
        project: Project,
        target_version: Option<&str>,
    ) -> Result<(PathBuf, String), AgentError> {
        if target_version.is_none() {
            if let Some(latest) = self.backups.resolve_latest(project) {
                let name = self
                    .backups
                    .latest_target_name(project)
                    .unwrap_or_else(|| format!("{project}-latest"));
                return Ok((latest, name));
            }
        }

        let entries = self
            .backups
            .list(project)
            .map_err(|e| AgentError::RollbackFailed(format!("{e:#}")))?;
        match target_version {
            Some(version) => {
                let marker = format!("-v{version}");
                entries
                    .into_iter()
                    .find(|entry| entry.name.contains(&marker))
                    .map(|entry| (entry.path, entry.name))
                    .ok_or_else(|| {
                        AgentError::RollbackFailed(format!("未找到版本 {version} 对应的备份"))
                    })
            }
            None => entries
                .into_iter()
                .next()
                .map(|entry| (entry.path, entry.name))
                .ok_or_else(|| AgentError::RollbackFailed("没有可用的备份版本".to_string())),
        }
    }

    /// Restore target: `deploy-paths.json` → the snapshot's recorded source
    /// directory → the default project root.
    fn resolve_target(&self, project: Project, snapshot: &Path) -> PathBuf {
        if let Some(path) = recorded_deploy_path(&self.cfg.deploy_paths_file(), project) {
            return path;
        }
        if let Some(info) = BackupStore::read_backup_info(snapshot) {
            let source = info.source_dir.trim();
            if !source.is_empty() {
                return PathBuf::from(source);
            }
        }
        self.cfg.deploy_root(project).to_path_buf()
    }

    /// Version to record: the sidecar's original version, then the snapshot's
    /// own version record, then a timestamp placeholder.
    fn resolve_version(&self, snapshot: &Path) -> String {
        if let Some(info) = BackupStore::read_backup_info(snapshot) {
            let version = info.original_version.trim();
            if !version.is_empty() && version != UNKNOWN_VERSION {
                return version.to_string();
            }
        }
        if let Some(version) = current_version(snapshot) {
            return version;
        }
        let placeholder = Utc::now().format("%Y%m%d%H%M").to_string();
        warn!(snapshot = %snapshot.display(), placeholder, "no version recorded, using placeholder");
        placeholder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressBus;
    use crate::types::BackupInfo;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _data: TempDir,
        cfg: Arc<AgentConfig>,
        engine: RollbackEngine,
        bus: ProgressBus,
    }

    fn fixture() -> Fixture {
        let data = TempDir::new().unwrap();
        let mut cfg = AgentConfig::default();
        cfg.dirs = crate::config::DirsConfig::under(data.path());
        let cfg = Arc::new(cfg);
        let engine = RollbackEngine::new(cfg.clone(), "dev-1");
        Fixture {
            _data: data,
            cfg,
            engine,
            bus: ProgressBus::new("dev-1"),
        }
    }

    fn no_session(bus: &ProgressBus) -> OperationProgress<'_> {
        OperationProgress::new(bus, None, "rollback")
    }

    fn seed_snapshot(fx: &Fixture, name: &str, original_version: &str, files: &[(&str, &str)]) {
        let path = fx.cfg.dirs.backup_dir.join(name);
        fs::create_dir_all(&path).unwrap();
        for (rel, contents) in files {
            let file = path.join(rel);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, contents).unwrap();
        }
        let info = BackupInfo {
            project: "frontend".to_string(),
            original_version: original_version.to_string(),
            backup_time: Utc::now(),
            source_dir: fx.cfg.deploy_root(Project::Frontend).to_string_lossy().into_owned(),
            backup_path: path.to_string_lossy().into_owned(),
            device_id: "dev-1".to_string(),
            kind: "upgrade".to_string(),
        };
        crate::deploy_paths::atomic_write_json(&path.join(BACKUP_INFO_FILE), &info).unwrap();
    }

    #[tokio::test]
    async fn rollback_without_snapshots_fails_untouched() {
        let fx = fixture();
        let target = fx.cfg.deploy_root(Project::Frontend).to_path_buf();
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("app.js"), "current").unwrap();

        let err = fx
            .engine
            .rollback(
                Project::Frontend,
                None,
                &PreservedPatterns::default(),
                &no_session(&fx.bus),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "没有可用的备份版本");
        assert_eq!(fs::read_to_string(target.join("app.js")).unwrap(), "current");
    }

    #[tokio::test]
    async fn rollback_restores_newest_snapshot_and_reconciles_version() {
        let fx = fixture();
        seed_snapshot(
            &fx,
            "frontend-backup-2026-08-01-10-00-from-1.0.0",
            "1.0.0",
            &[("index.html", "v1")],
        );
        let target = fx.cfg.deploy_root(Project::Frontend).to_path_buf();
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("index.html"), "v2").unwrap();

        let report = fx
            .engine
            .rollback(
                Project::Frontend,
                None,
                &PreservedPatterns::default(),
                &no_session(&fx.bus),
            )
            .await
            .unwrap();

        assert_eq!(report.version, "1.0.0");
        assert_eq!(fs::read_to_string(target.join("index.html")).unwrap(), "v1");
        assert!(!target.join(BACKUP_INFO_FILE).exists());
        let record = crate::deploy_paths::load_version_record(&target).unwrap();
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.source.as_deref(), Some("rollback"));

        let paths = crate::deploy_paths::load_deploy_paths(&fx.cfg.deploy_paths_file());
        assert_eq!(paths.entry(Project::Frontend).unwrap().version, "1.0.0");
    }

    #[tokio::test]
    async fn versioned_rollback_selects_the_matching_snapshot() {
        let fx = fixture();
        seed_snapshot(
            &fx,
            "frontend-backup-2026-08-01T10-00-00-v1.0.0",
            "1.0.0",
            &[("index.html", "v1")],
        );
        seed_snapshot(
            &fx,
            "frontend-backup-2026-08-01T11-00-00-v2.0.0",
            "2.0.0",
            &[("index.html", "v2")],
        );

        let report = fx
            .engine
            .rollback(
                Project::Frontend,
                Some("1.0.0"),
                &PreservedPatterns::default(),
                &no_session(&fx.bus),
            )
            .await
            .unwrap();
        assert_eq!(report.snapshot_name, "frontend-backup-2026-08-01T10-00-00-v1.0.0");
        let target = fx.cfg.deploy_root(Project::Frontend);
        assert_eq!(fs::read_to_string(target.join("index.html")).unwrap(), "v1");
    }

    #[tokio::test]
    async fn missing_requested_version_is_fatal() {
        let fx = fixture();
        seed_snapshot(
            &fx,
            "frontend-backup-2026-08-01T10-00-00-v1.0.0",
            "1.0.0",
            &[("index.html", "v1")],
        );

        let err = fx
            .engine
            .rollback(
                Project::Frontend,
                Some("3.0.0"),
                &PreservedPatterns::default(),
                &no_session(&fx.bus),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("3.0.0"));
    }

    #[tokio::test]
    async fn preserved_paths_survive_a_rollback() {
        let fx = fixture();
        seed_snapshot(
            &fx,
            "frontend-backup-2026-08-01-10-00-from-1.0.0",
            "1.0.0",
            &[("index.html", "v1"), ("conf/db.json", "snapshot-db")],
        );
        let target = fx.cfg.deploy_root(Project::Frontend).to_path_buf();
        fs::create_dir_all(target.join("conf")).unwrap();
        fs::write(target.join("conf/db.json"), "live-db").unwrap();
        fs::write(target.join("index.html"), "v2").unwrap();

        let patterns = PreservedPatterns::new(&["conf/".to_string()]);
        fx.engine
            .rollback(Project::Frontend, None, &patterns, &no_session(&fx.bus))
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(target.join("conf/db.json")).unwrap(),
            "live-db"
        );
        assert_eq!(fs::read_to_string(target.join("index.html")).unwrap(), "v1");
    }

    #[tokio::test]
    async fn placeholder_version_is_used_when_nothing_is_recorded() {
        let fx = fixture();
        seed_snapshot(
            &fx,
            "frontend-backup-2026-08-01-10-00-from-unknown",
            UNKNOWN_VERSION,
            &[("index.html", "v?")],
        );

        let report = fx
            .engine
            .rollback(
                Project::Frontend,
                None,
                &PreservedPatterns::default(),
                &no_session(&fx.bus),
            )
            .await
            .unwrap();
        // Twelve digits: YYYYMMDDHHmm.
        assert_eq!(report.version.len(), 12);
        assert!(report.version.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn rollback_availability_tracks_snapshots() {
        let fx = fixture();
        assert!(!fx.engine.rollback_available(Project::Frontend));
        seed_snapshot(
            &fx,
            "frontend-backup-2026-08-01-10-00-from-1.0.0",
            "1.0.0",
            &[("index.html", "v1")],
        );
        assert!(fx.engine.rollback_available(Project::Frontend));
    }
}
