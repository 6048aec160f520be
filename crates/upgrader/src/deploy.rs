//! The extract/deploy engine.
//!
//! A deploy moves through prepare → backup → clear → extract → verify →
//! clean, emitting progress at each boundary. Once a snapshot has been
//! captured, any later failure triggers a restore of that snapshot; the
//! original failure is what the caller sees, the restore result is only
//! logged.

use std::collections::BTreeSet;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::backup::{BACKUP_INFO_FILE, BackupStore};
use crate::config::AgentConfig;
use crate::deploy_paths::{current_version, record_deploy_path, write_version_record};
use crate::error::AgentError;
use crate::fsutil::{self, PreservedPatterns};
use crate::paths;
use crate::progress::OperationProgress;
use crate::types::{BackupInfo, DeployReport, Project, ProgressStep, UNKNOWN_VERSION, VersionRecord};

pub struct DeployEngine {
    cfg: Arc<AgentConfig>,
    backups: BackupStore,
    device_id: String,
}

struct ExtractStats {
    files: u64,
    skipped_roots: usize,
}

impl DeployEngine {
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

    /// Deploy a verified package archive into the project's target directory.
    pub async fn deploy(
        &self,
        project: Project,
        package_path: &Path,
        version: &str,
        deploy_path_override: Option<&str>,
        preserved: &PreservedPatterns,
        progress: &OperationProgress<'_>,
    ) -> Result<DeployReport, AgentError> {
        // Step 1: resolve and probe the target directory.
        progress.emit(ProgressStep::Preparing, 0, "解析部署目录");
        let validation =
            paths::validate_deploy_path(deploy_path_override, self.cfg.deploy_root(project));
        if let Some(reason) = &validation.reason {
            warn!(project = %project, reason, "deploy path fell back");
        }
        let target = validation.path;

        let access = paths::check_accessibility(&target);
        if !access.accessible || !access.writable {
            return Err(AgentError::DeployFailed(format!(
                "部署目录不可访问: {}",
                access.reason.unwrap_or_default()
            )));
        }
        progress.emit(ProgressStep::Preparing, 20, "部署目录就绪");

        // Step 2: snapshot the current contents, unless the target is empty.
        let backup_created = self.capture_backup(project, &target, preserved, progress);

        // Steps 3-6 run under snapshot protection.
        let staged = self
            .run_protected(project, package_path, version, &target, preserved, progress)
            .await;
        match staged {
            Ok(preserved_entries) => Ok(DeployReport {
                project,
                version: version.to_string(),
                deploy_path: target,
                backup_created,
                preserved_entries,
            }),
            Err(e) => {
                if backup_created {
                    warn!(project = %project, error = %e, "deploy failed, restoring snapshot");
                    match self.restore_backup(project, &target).await {
                        Ok(()) => info!(project = %project, "snapshot restored after failed deploy"),
                        Err(restore_err) => {
                            warn!(project = %project, error = %restore_err, "snapshot restore failed")
                        }
                    }
                }
                Err(AgentError::DeployFailed(format!("{e:#}")))
            }
        }
    }

    /// Steps 3-6: clear, extract, verify, record, prune.
    async fn run_protected(
        &self,
        project: Project,
        package_path: &Path,
        version: &str,
        target: &Path,
        preserved: &PreservedPatterns,
        progress: &OperationProgress<'_>,
    ) -> Result<usize> {
        progress.emit(ProgressStep::Cleaning, 45, "清空目标目录");
        let clear = fsutil::clear_directory(target, preserved).await?;
        info!(
            project = %project,
            strategy = ?clear.strategy,
            preserved = clear.preserved,
            removed = clear.removed,
            "target directory cleared"
        );
        progress.emit(
            ProgressStep::Cleaning,
            60,
            format!("目标目录已清空(保留 {} 项)", clear.preserved),
        );

        progress.emit(ProgressStep::Extracting, 65, "解压升级包");
        if !package_extension_supported(package_path) {
            let extension = package_path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            bail!("不支持的压缩格式: {extension}");
        }
        let stats = {
            let package_path = package_path.to_path_buf();
            let target = target.to_path_buf();
            let preserved = preserved.clone();
            tokio::task::spawn_blocking(move || extract_zip(&package_path, &target, &preserved))
                .await
                .context("extraction task failed")??
        };
        info!(
            project = %project,
            files = stats.files,
            preserved_roots = stats.skipped_roots,
            "archive extracted"
        );
        progress.emit(
            ProgressStep::Extracting,
            80,
            format!("解压完成({} 个文件)", stats.files),
        );

        progress.emit(ProgressStep::Deploying, 85, "写入版本信息");
        // An archive whose entries were all skipped by the preservation
        // allowlist legitimately leaves an empty target; only an archive
        // that produced neither written nor preserved entries is corrupt.
        if !fsutil::dir_has_visible_entries(target)?
            && stats.files == 0
            && stats.skipped_roots == 0
        {
            bail!("解压后目标目录为空");
        }
        write_version_record(
            target,
            &VersionRecord {
                project: project.to_string(),
                version: version.to_string(),
                deploy_time: Utc::now(),
                package_path: package_path.to_string_lossy().into_owned(),
                device_id: self.device_id.clone(),
                source: None,
            },
        )?;
        progress.emit(ProgressStep::Verifying, 90, "校验部署结果");
        record_deploy_path(&self.cfg.deploy_paths_file(), project, target, version)?;
        progress.emit(ProgressStep::Verifying, 95, "部署路径已更新");

        if self.cfg.max_backups > 0 {
            progress.emit(ProgressStep::Cleaning, 98, "清理历史备份");
            if let Err(e) = self.backups.prune(project, self.cfg.max_backups).await {
                warn!(project = %project, error = %e, "backup pruning failed");
            }
        }
        Ok(clear.preserved)
    }

    /// Step 2: snapshot the target. Empty targets skip the snapshot; a copy
    /// failure is downgraded to a warning rather than failing the deploy.
    fn capture_backup(
        &self,
        project: Project,
        target: &Path,
        preserved: &PreservedPatterns,
        progress: &OperationProgress<'_>,
    ) -> bool {
        progress.emit(ProgressStep::Backup, 25, "备份当前版本");
        match fsutil::dir_has_visible_entries(target) {
            Ok(false) => {
                debug!(project = %project, "target_empty, snapshot skipped");
                progress.emit(ProgressStep::Backup, 40, "目标目录为空，跳过备份");
                return false;
            }
            Err(e) => {
                warn!(project = %project, error = %e, "could not inspect target, snapshot skipped");
                return false;
            }
            Ok(true) => {}
        }

        let original_version =
            current_version(target).unwrap_or_else(|| UNKNOWN_VERSION.to_string());
        let name = BackupStore::upgrade_snapshot_name(project, &original_version, Utc::now());
        let info = BackupInfo {
            project: project.to_string(),
            original_version,
            backup_time: Utc::now(),
            source_dir: target.to_string_lossy().into_owned(),
            backup_path: self.backups.root().join(&name).to_string_lossy().into_owned(),
            device_id: self.device_id.clone(),
            kind: "upgrade".to_string(),
        };
        match self
            .backups
            .create_snapshot(project, target, &name, &info, preserved)
        {
            Ok(path) => {
                progress.emit(
                    ProgressStep::Backup,
                    40,
                    format!("已备份到 {}", path.display()),
                );
                true
            }
            Err(e) => {
                warn!(project = %project, error = %e, "snapshot capture failed, continuing");
                false
            }
        }
    }

    /// Restore the most recent snapshot into the target: full clear, then a
    /// recursive copy excluding the sidecar.
    pub async fn restore_backup(&self, project: Project, target: &Path) -> Result<()> {
        let snapshot = self
            .backups
            .resolve_latest(project)
            .context("no snapshot available to restore")?;

        fsutil::clear_directory(target, &PreservedPatterns::default()).await?;
        let stats = fsutil::copy_dir_filtered(&snapshot, target, &|rel| rel == BACKUP_INFO_FILE)?;
        info!(
            project = %project,
            files = stats.files,
            snapshot = %snapshot.display(),
            "snapshot restored"
        );
        Ok(())
    }
}

/// Extract a ZIP archive into the target, skipping preserved paths. Archive
/// open failures and payload-free archives fail; individual entry failures
/// are logged and skipped.
fn extract_zip(
    package: &Path,
    target: &Path,
    preserved: &PreservedPatterns,
) -> Result<ExtractStats> {
    let file = fs::File::open(package)
        .with_context(|| format!("failed to open package {}", package.display()))?;
    let mut archive = match zip::ZipArchive::new(BufReader::new(file)) {
        Ok(archive) => archive,
        Err(e) => bail!("ZIP 文件为空或损坏: {e}"),
    };

    let mut has_payload = false;
    for i in 0..archive.len() {
        if let Ok(entry) = archive.by_index(i) {
            if !entry.is_dir() && entry.size() > 0 {
                has_payload = true;
                break;
            }
        }
    }
    if !has_payload {
        bail!("ZIP 文件为空或损坏");
    }

    let mut written = 0u64;
    let mut skipped_roots: BTreeSet<String> = BTreeSet::new();
    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(index = i, error = %e, "unreadable archive entry skipped");
                continue;
            }
        };
        let Some(rel) = entry.enclosed_name() else {
            warn!(name = entry.name(), "archive entry escapes the target, skipped");
            continue;
        };
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        if !preserved.is_empty() && preserved.matches(&rel_str) {
            let root = rel_str
                .split('/')
                .next()
                .unwrap_or(rel_str.as_str())
                .to_string();
            if skipped_roots.insert(root.clone()) {
                info!(entry = root, "preserved path skipped during extraction");
            }
            continue;
        }

        let out = target.join(&rel);
        if entry.is_dir() {
            if let Err(e) = fs::create_dir_all(&out) {
                warn!(path = %out.display(), error = %e, "failed to create archive directory");
            }
            continue;
        }
        if let Some(parent) = out.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "failed to create parent directory");
                continue;
            }
        }
        match fs::File::create(&out) {
            Ok(mut dest) => match std::io::copy(&mut entry, &mut dest) {
                Ok(_) => written += 1,
                Err(e) => warn!(path = %out.display(), error = %e, "failed to write archive entry"),
            },
            Err(e) => warn!(path = %out.display(), error = %e, "failed to create archive entry"),
        }
    }

    Ok(ExtractStats {
        files: written,
        skipped_roots: skipped_roots.len(),
    })
}

/// Only ZIP archives are deployable.
pub fn package_extension_supported(package: &Path) -> bool {
    package
        .extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}
