//! Versioned snapshot store.
//!
//! Snapshots live under the backup root as plain directories named
//! `<project>-backup-<timestamp>-from-<version>` (taken before an upgrade)
//! or `<project>-backup-<timestamp>-v<version>` (explicit backups), each with
//! a `backup-info.json` sidecar. `<project>-latest` is a pointer to the most
//! recent snapshot: a symlink where the platform allows it, a full copy where
//! it does not — callers see the same contract either way.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::deploy_paths::atomic_write_json;
use crate::fsutil::{self, PreservedPatterns};
use crate::types::{BackupInfo, Project};

pub const BACKUP_INFO_FILE: &str = "backup-info.json";

/// How the `-latest` pointer was materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerMethod {
    Symlink,
    Copy,
}

/// One historical snapshot, newest-first ordering.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub name: String,
    pub path: PathBuf,
    sort_key: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneReport {
    pub kept: usize,
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compose the name for an upgrade-time snapshot: minute-resolution
    /// timestamp plus the version being replaced.
    pub fn upgrade_snapshot_name(
        project: Project,
        original_version: &str,
        now: DateTime<Utc>,
    ) -> String {
        format!(
            "{project}-backup-{}-from-{original_version}",
            now.format("%Y-%m-%d-%H-%M")
        )
    }

    /// Compose the name for an explicit backup of a known version.
    pub fn explicit_snapshot_name(
        project: Project,
        version: &str,
        now: DateTime<Utc>,
    ) -> String {
        format!(
            "{project}-backup-{}-v{version}",
            now.format("%Y-%m-%dT%H-%M-%S")
        )
    }

    /// Historical snapshots for a project, newest first by the timestamp
    /// embedded in the name. The `-latest` alias is excluded.
    pub fn list(&self, project: Project) -> Result<Vec<SnapshotEntry>> {
        let prefix = format!("{project}-backup-");
        let mut entries = Vec::new();

        if !self.root.exists() {
            return Ok(entries);
        }
        let dir = fs::read_dir(&self.root)
            .with_context(|| format!("failed to read backup root {}", self.root.display()))?;
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) {
                continue;
            }
            if !entry.path().is_dir() {
                continue;
            }
            let sort_key = timestamp_sort_key(&name[prefix.len()..]);
            entries.push(SnapshotEntry {
                name,
                path: entry.path(),
                sort_key,
            });
        }

        entries.sort_by(|a, b| b.sort_key.cmp(&a.sort_key).then(b.name.cmp(&a.name)));
        Ok(entries)
    }

    /// Select the snapshot whose name records the given version
    /// (`-v<version>` suffix of explicit backups).
    pub fn find_version(&self, project: Project, version: &str) -> Result<Option<SnapshotEntry>> {
        let marker = format!("-v{version}");
        Ok(self
            .list(project)?
            .into_iter()
            .find(|entry| entry.name.contains(&marker)))
    }

    /// Path of the `<project>-latest` pointer.
    pub fn latest_link(&self, project: Project) -> PathBuf {
        self.root.join(format!("{project}-latest"))
    }

    /// The snapshot the `-latest` pointer currently references, if it exists.
    /// A dangling symlink counts as absent.
    pub fn resolve_latest(&self, project: Project) -> Option<PathBuf> {
        let link = self.latest_link(project);
        link.exists().then_some(link)
    }

    /// The real name of the snapshot behind `-latest`, when recoverable.
    pub fn latest_target_name(&self, project: Project) -> Option<String> {
        let link = self.latest_link(project);
        let target = fs::read_link(&link).ok()?;
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Point `<project>-latest` at a snapshot, replacing any prior pointer.
    /// Falls back to a full copy when symlinks are unavailable.
    pub fn point_latest(&self, project: Project, target: &Path) -> Result<PointerMethod> {
        let link = self.latest_link(project);
        remove_pointer(&link)?;

        match create_symlink(target, &link) {
            Ok(()) => {
                debug!(link = %link.display(), target = %target.display(), "latest pointer symlinked");
                Ok(PointerMethod::Symlink)
            }
            Err(e) => {
                warn!(error = %e, "symlink unavailable, copying snapshot for latest pointer");
                fsutil::copy_dir_filtered(target, &link, &|_| false)
                    .context("failed to copy snapshot for latest pointer")?;
                Ok(PointerMethod::Copy)
            }
        }
    }

    /// Copy the deploy target into a new snapshot directory, excluding
    /// preservation matches, write the sidecar, and repoint `-latest`.
    pub fn create_snapshot(
        &self,
        project: Project,
        source: &Path,
        name: &str,
        info: &BackupInfo,
        preserved: &PreservedPatterns,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create backup root {}", self.root.display()))?;

        let snapshot_path = self.root.join(name);
        let stats = fsutil::copy_dir_filtered(source, &snapshot_path, &|rel| {
            preserved.matches(rel)
        })
        .with_context(|| format!("failed to copy {} into snapshot", source.display()))?;

        atomic_write_json(&snapshot_path.join(BACKUP_INFO_FILE), info)
            .context("failed to write backup-info.json")?;
        info!(
            snapshot = name,
            files = stats.files,
            skipped = stats.skipped,
            "snapshot captured"
        );

        self.point_latest(project, &snapshot_path)?;
        Ok(snapshot_path)
    }

    /// Read a snapshot's sidecar.
    pub fn read_backup_info(snapshot: &Path) -> Option<BackupInfo> {
        let content = fs::read_to_string(snapshot.join(BACKUP_INFO_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Delete historical snapshots beyond `keep`. `keep == 0` retains
    /// everything. Deletions run concurrently; per-entry failures are
    /// reported but never abort the batch.
    pub async fn prune(&self, project: Project, keep: usize) -> Result<PruneReport> {
        if keep == 0 {
            return Ok(PruneReport::default());
        }
        let entries = self.list(project)?;
        let mut report = PruneReport {
            kept: entries.len().min(keep),
            ..Default::default()
        };
        if entries.len() <= keep {
            return Ok(report);
        }

        let mut handles = Vec::new();
        for entry in entries.into_iter().skip(keep) {
            handles.push(tokio::task::spawn_blocking(move || {
                fs::remove_dir_all(&entry.path).map_err(|e| (entry.name, e))
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => report.deleted += 1,
                Ok(Err((name, e))) => {
                    warn!(snapshot = name, error = %e, "failed to prune snapshot");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "prune task panicked");
                    report.failed += 1;
                }
            }
        }
        info!(
            project = %project,
            deleted = report.deleted,
            failed = report.failed,
            "backup pruning done"
        );
        Ok(report)
    }
}

/// Collapse the timestamp segment of a snapshot name into a digit string so
/// minute-resolution and second-resolution names sort together.
fn timestamp_sort_key(segment: &str) -> String {
    segment
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '-' | 'T' | 'Z'))
        .filter(|c| c.is_ascii_digit())
        .collect()
}

fn remove_pointer(link: &Path) -> Result<()> {
    let Ok(meta) = fs::symlink_metadata(link) else {
        return Ok(());
    };
    let result = if meta.is_symlink() {
        fs::remove_file(link)
    } else if meta.is_dir() {
        fs::remove_dir_all(link)
    } else {
        fs::remove_file(link)
    };
    result.with_context(|| format!("failed to remove latest pointer {}", link.display()))
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    // Directory symlinks need elevation on most Windows setups; the caller
    // falls back to a copy when this fails.
    std::os::windows::fs::symlink_dir(target, link)
}
