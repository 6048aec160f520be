//! Authoritative per-project deploy paths and version records.
//!
//! Two small JSON stores: `config/deploy-paths.json` (authoritative deploy
//! roots + versions, updated after every successful deploy or rollback) and
//! `<target>/version.json` (the per-project version record). Both are
//! written atomically via a temp file rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::types::{DeployPathEntry, DeployPathsFile, Project, UNKNOWN_VERSION, VersionRecord};

pub const VERSION_FILE: &str = "version.json";

pub fn version_path(deploy_dir: &Path) -> PathBuf {
    deploy_dir.join(VERSION_FILE)
}

/// Read the version record of a deploy target, if one exists and parses.
pub fn load_version_record(deploy_dir: &Path) -> Option<VersionRecord> {
    let path = version_path(deploy_dir);
    let content = fs::read_to_string(&path).ok()?;
    serde_json::from_str(&content).ok()
}

/// The effective version of a deploy target. `"unknown"` and `"error"`
/// placeholders count as absent.
pub fn current_version(deploy_dir: &Path) -> Option<String> {
    let record = load_version_record(deploy_dir)?;
    let version = record.version.trim().to_string();
    if version.is_empty() || version == UNKNOWN_VERSION || version == "error" {
        None
    } else {
        Some(version)
    }
}

pub fn write_version_record(deploy_dir: &Path, record: &VersionRecord) -> Result<()> {
    fs::create_dir_all(deploy_dir)
        .with_context(|| format!("failed to create deploy dir {}", deploy_dir.display()))?;
    atomic_write_json(&version_path(deploy_dir), record)
}

/// Load `deploy-paths.json`, treating a missing or unreadable file as empty.
pub fn load_deploy_paths(path: &Path) -> DeployPathsFile {
    let Ok(content) = fs::read_to_string(path) else {
        return DeployPathsFile::default();
    };
    serde_json::from_str(&content).unwrap_or_default()
}

/// Record the authoritative deploy path and version for a project.
pub fn record_deploy_path(
    path: &Path,
    project: Project,
    deploy_path: &Path,
    version: &str,
) -> Result<DeployPathEntry> {
    let mut file = load_deploy_paths(path);
    let entry = DeployPathEntry {
        deploy_path: deploy_path.to_string_lossy().into_owned(),
        version: version.to_string(),
        updated_at: Utc::now(),
    };
    file.set_entry(project, entry.clone());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config dir {}", parent.display()))?;
    }
    atomic_write_json(path, &file)?;
    Ok(entry)
}

/// The authoritative deploy root for a project, when one has been recorded.
pub fn recorded_deploy_path(path: &Path, project: Project) -> Option<PathBuf> {
    load_deploy_paths(path)
        .entry(project)
        .map(|entry| PathBuf::from(&entry.deploy_path))
}

/// Write JSON through a temp file so readers never observe a partial file.
pub(crate) fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    Ok(())
}
