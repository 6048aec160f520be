//! Filesystem primitives shared by the deploy and rollback engines.
//!
//! The clearance algorithm is a strategy chain with escalating force: plain
//! removal, per-entry recursive removal, and finally an OS-native forced
//! delete under a timeout. Each stage reports what it preserved and removed;
//! the stage that achieved an empty (modulo allowlist) directory is recorded
//! for observability.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How long the OS-native forced delete may run before it is killed.
const FORCED_DELETE_TIMEOUT: Duration = Duration::from_secs(60);

/// The preservation allowlist: relative paths within a deploy root that must
/// not be touched by a deploy or rollback.
///
/// Each entry is either an exact relative path or a directory pattern ending
/// in `/`, which matches the directory itself and all descendants.
#[derive(Debug, Clone, Default)]
pub struct PreservedPatterns {
    patterns: Vec<String>,
}

impl PreservedPatterns {
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| p.trim().replace('\\', "/"))
            .filter(|p| !p.is_empty() && p != "/")
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether a relative path is covered by the allowlist.
    pub fn matches(&self, rel: &str) -> bool {
        let rel = rel.replace('\\', "/");
        self.patterns.iter().any(|pattern| {
            if rel == *pattern || rel == pattern.trim_end_matches('/') {
                return true;
            }
            pattern.ends_with('/') && rel.starts_with(pattern.as_str())
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyStats {
    pub files: u64,
    pub skipped: u64,
}

/// Recursively copy `src` into `dst`, skipping entries whose relative path
/// (with `/` separators) the filter accepts. Symlinked sources are followed.
pub fn copy_dir_filtered(
    src: &Path,
    dst: &Path,
    skip: &dyn Fn(&str) -> bool,
) -> Result<CopyStats> {
    let mut stats = CopyStats::default();
    copy_dir_inner(src, dst, "", skip, &mut stats)?;
    Ok(stats)
}

fn copy_dir_inner(
    src: &Path,
    dst: &Path,
    prefix: &str,
    skip: &dyn Fn(&str) -> bool,
    stats: &mut CopyStats,
) -> Result<()> {
    fs::create_dir_all(dst)
        .with_context(|| format!("failed to create directory {}", dst.display()))?;

    let entries = fs::read_dir(src)
        .with_context(|| format!("failed to read directory {}", src.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", src.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        if skip(&rel) {
            stats.skipped += 1;
            continue;
        }

        let src_path = entry.path();
        let dst_path = dst.join(&name);
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", src_path.display()))?;
        if file_type.is_dir() || (file_type.is_symlink() && src_path.is_dir()) {
            copy_dir_inner(&src_path, &dst_path, &rel, skip, stats)?;
        } else {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    src_path.display(),
                    dst_path.display()
                )
            })?;
            stats.files += 1;
        }
    }
    Ok(())
}

/// Whether the directory contains any entry not starting with a dot.
pub fn dir_has_visible_entries(dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with('.') {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Which stage of the clearance chain left the directory clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearStrategy {
    Fast,
    Allowlist,
    PerEntry,
    Subprocess,
}

#[derive(Debug, Clone, Copy)]
pub struct ClearReport {
    pub strategy: ClearStrategy,
    pub preserved: usize,
    pub removed: usize,
}

/// Clear a directory's contents, keeping allowlisted entries.
///
/// Fails with `无法清空目标目录` when even the forced delete leaves
/// non-preserved entries behind.
pub async fn clear_directory(dir: &Path, preserved: &PreservedPatterns) -> Result<ClearReport> {
    if !dir.exists() {
        return Ok(ClearReport {
            strategy: ClearStrategy::Fast,
            preserved: 0,
            removed: 0,
        });
    }

    let mut removed = 0usize;
    let mut kept = 0usize;
    let first_strategy = if preserved.is_empty() {
        ClearStrategy::Fast
    } else {
        ClearStrategy::Allowlist
    };

    for entry in top_level_entries(dir)? {
        let name = entry
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if preserved.matches(&name) {
            kept += 1;
            continue;
        }
        match remove_any(&entry) {
            Ok(()) => removed += 1,
            Err(e) => debug!(path = %entry.display(), error = %e, "removal failed, escalating"),
        }
    }
    if first_strategy == ClearStrategy::Allowlist {
        debug!(preserved = kept, removed, dir = %dir.display(), "allowlist clear pass done");
    }
    if remaining_entries(dir, preserved)?.is_empty() {
        return Ok(ClearReport {
            strategy: first_strategy,
            preserved: kept,
            removed,
        });
    }

    // Escalation 1: walk the stragglers and delete bottom-up, one entry at
    // a time, tolerating per-file failures.
    for entry in remaining_entries(dir, preserved)? {
        remove_tree_per_entry(&entry);
    }
    if remaining_entries(dir, preserved)?.is_empty() {
        return Ok(ClearReport {
            strategy: ClearStrategy::PerEntry,
            preserved: kept,
            removed,
        });
    }

    // Escalation 2: OS-native forced delete with a hard timeout.
    for entry in remaining_entries(dir, preserved)? {
        if let Err(e) = forced_delete(&entry).await {
            warn!(path = %entry.display(), error = %e, "forced delete failed");
        }
    }
    if remaining_entries(dir, preserved)?.is_empty() {
        return Ok(ClearReport {
            strategy: ClearStrategy::Subprocess,
            preserved: kept,
            removed,
        });
    }

    bail!("无法清空目标目录: {}", dir.display())
}

fn top_level_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?;
    for entry in entries {
        out.push(entry?.path());
    }
    Ok(out)
}

fn remaining_entries(dir: &Path, preserved: &PreservedPatterns) -> Result<Vec<PathBuf>> {
    Ok(top_level_entries(dir)?
        .into_iter()
        .filter(|p| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            !preserved.matches(&name)
        })
        .collect())
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn remove_tree_per_entry(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if meta.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                remove_tree_per_entry(&entry.path());
            }
        }
        if let Err(e) = fs::remove_dir(path) {
            debug!(path = %path.display(), error = %e, "per-entry rmdir failed");
        }
    } else if let Err(e) = fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "per-entry unlink failed");
    }
}

async fn forced_delete(path: &Path) -> Result<()> {
    let mut command = if cfg!(windows) {
        let mut c = tokio::process::Command::new("powershell");
        c.arg("-NoProfile").arg("-Command").arg(format!(
            "Remove-Item -LiteralPath \"{}\" -Force -Recurse -ErrorAction SilentlyContinue",
            path.display()
        ));
        c
    } else {
        let mut c = tokio::process::Command::new("rm");
        c.arg("-rf").arg(path);
        c
    };

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn forced delete for {}", path.display()))?;
    match tokio::time::timeout(FORCED_DELETE_TIMEOUT, child.wait()).await {
        Ok(status) => {
            let status = status.context("forced delete did not report a status")?;
            if !status.success() {
                bail!("forced delete exited with {status}");
            }
            Ok(())
        }
        Err(_) => {
            child.kill().await.ok();
            bail!("forced delete timed out after {FORCED_DELETE_TIMEOUT:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn patterns_match_exact_and_directory_forms() {
        let patterns = PreservedPatterns::new(&["conf/".to_string(), "keep.txt".to_string()]);
        assert!(patterns.matches("conf"));
        assert!(patterns.matches("conf/"));
        assert!(patterns.matches("conf/db.json"));
        assert!(patterns.matches("conf/nested/deep.json"));
        assert!(patterns.matches("keep.txt"));
        assert!(!patterns.matches("config"));
        assert!(!patterns.matches("other/keep.txt"));
    }

    #[test]
    fn patterns_normalize_backslashes_and_blanks() {
        let patterns = PreservedPatterns::new(&[
            "conf\\local/".to_string(),
            "  ".to_string(),
            String::new(),
        ]);
        assert_eq!(patterns.patterns(), ["conf/local/"]);
        assert!(patterns.matches("conf/local/a.json"));
    }

    #[test]
    fn copy_skips_filtered_entries() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "app.js", "app");
        write(src.path(), "conf/db.json", "db");
        write(src.path(), "static/logo.svg", "svg");

        let patterns = PreservedPatterns::new(&["conf/".to_string()]);
        let stats =
            copy_dir_filtered(src.path(), dst.path(), &|rel| patterns.matches(rel)).unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.skipped, 1);
        assert!(dst.path().join("app.js").exists());
        assert!(dst.path().join("static/logo.svg").exists());
        assert!(!dst.path().join("conf").exists());
    }

    #[test]
    fn visible_entry_check_ignores_dotfiles() {
        let dir = TempDir::new().unwrap();
        assert!(!dir_has_visible_entries(dir.path()).unwrap());
        write(dir.path(), ".hidden", "x");
        assert!(!dir_has_visible_entries(dir.path()).unwrap());
        write(dir.path(), "visible.txt", "x");
        assert!(dir_has_visible_entries(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn clear_without_allowlist_empties_the_directory() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", "a");
        write(dir.path(), "sub/b.txt", "b");

        let report = clear_directory(dir.path(), &PreservedPatterns::default())
            .await
            .unwrap();
        assert_eq!(report.strategy, ClearStrategy::Fast);
        assert_eq!(report.removed, 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn clear_preserves_allowlisted_entries() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", "a");
        write(dir.path(), "conf/db.json", "db");
        write(dir.path(), "sub/b.txt", "b");

        let patterns = PreservedPatterns::new(&["conf/".to_string()]);
        let report = clear_directory(dir.path(), &patterns).await.unwrap();
        assert_eq!(report.strategy, ClearStrategy::Allowlist);
        assert_eq!(report.preserved, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("conf/db.json")).unwrap(),
            "db"
        );
        assert!(!dir.path().join("a.txt").exists());
        assert!(!dir.path().join("sub").exists());
    }

    #[tokio::test]
    async fn clearing_a_missing_directory_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("never-created");
        let report = clear_directory(&gone, &PreservedPatterns::default())
            .await
            .unwrap();
        assert_eq!(report.removed, 0);
    }
}
