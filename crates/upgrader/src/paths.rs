//! Deploy-path safety.
//!
//! Server-supplied deploy paths are untrusted input. Validation rejects
//! traversal, a denylist of dangerous prefixes, and anything outside the
//! allowlisted roots; a rejected override falls back to the project default.
//! Validation is lexical only — the accessibility probe is the final gate
//! before the engine touches the directory.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::warn;

/// Prefixes never accepted as deploy targets.
const DENYLIST_PREFIXES: &[&str] = &[
    "/etc", "/var/log", "/usr", "/bin", "/sbin", "/root", "/home",
];

/// Windows denylist, compared case-insensitively.
const DENYLIST_PREFIXES_WINDOWS: &[&str] = &["c:\\windows", "c:\\program"];

/// Longest absolute path accepted, matching the legacy Windows limit.
const MAX_PATH_LEN: usize = 260;

#[derive(Debug, Clone)]
pub struct PathValidation {
    pub valid: bool,
    pub path: PathBuf,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Accessibility {
    pub accessible: bool,
    pub writable: bool,
    pub reason: Option<String>,
}

/// Validate a deploy-path override against the allowlist and denylist,
/// falling back to `default` when the override is rejected.
///
/// When the default itself fails validation it is still returned with
/// `valid: true` and a reason: the engine proceeds and relies on
/// [`check_accessibility`] to make the final call.
pub fn validate_deploy_path(input: Option<&str>, default: &Path) -> PathValidation {
    if let Some(raw) = input {
        match validate_one(raw) {
            Ok(path) => {
                return PathValidation {
                    valid: true,
                    path,
                    reason: None,
                };
            }
            Err(reason) => {
                warn!(input = raw, reason, "deploy path override rejected, using default");
            }
        }
    }

    let default_str = default.to_string_lossy();
    match validate_one(&default_str) {
        Ok(path) => PathValidation {
            valid: true,
            path,
            reason: input.map(|raw| format!("覆盖路径无效，已回退到默认路径: {raw}")),
        },
        Err(reason) => PathValidation {
            valid: true,
            path: default.to_path_buf(),
            reason: Some(format!("默认路径未通过校验({reason})，将依赖可访问性检查")),
        },
    }
}

fn validate_one(raw: &str) -> Result<PathBuf, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("路径为空".to_string());
    }
    if trimmed.split(['/', '\\']).any(|seg| seg == "..") {
        return Err("路径包含 ..".to_string());
    }

    let resolved = absolutize(Path::new(trimmed));
    let resolved_str = resolved.to_string_lossy();
    if resolved_str.len() > MAX_PATH_LEN {
        return Err(format!("路径长度超过 {MAX_PATH_LEN} 字符"));
    }

    let lowered = resolved_str.to_lowercase();
    for prefix in DENYLIST_PREFIXES {
        if resolved_str.starts_with(prefix) {
            return Err(format!("路径位于受保护目录 {prefix}"));
        }
    }
    for prefix in DENYLIST_PREFIXES_WINDOWS {
        if lowered.replace('/', "\\").starts_with(prefix) {
            return Err(format!("路径位于受保护目录 {prefix}"));
        }
    }

    let allowed = allowlist_roots()
        .iter()
        .any(|root| resolved.starts_with(root));
    if !allowed {
        return Err("路径不在允许的部署根目录内".to_string());
    }

    Ok(resolved)
}

/// Lexically absolutize: join relative paths onto the working directory and
/// collapse `.` components. `..` never survives (rejected earlier).
fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn allowlist_roots() -> Vec<PathBuf> {
    let mut roots = vec![std::env::temp_dir()];
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    roots.push(PathBuf::from("/tmp"));
    roots.push(PathBuf::from("/var/tmp"));
    for key in ["TEMP", "TMP"] {
        if let Ok(dir) = std::env::var(key) {
            if !dir.is_empty() {
                roots.push(PathBuf::from(dir));
            }
        }
    }
    roots
}

/// Ensure the directory exists and is readable and writable, probing with a
/// write-then-remove sentinel.
pub fn check_accessibility(path: &Path) -> Accessibility {
    if let Err(e) = fs::create_dir_all(path) {
        return Accessibility {
            accessible: false,
            writable: false,
            reason: Some(format!("无法创建目录: {e}")),
        };
    }
    if let Err(e) = fs::read_dir(path) {
        return Accessibility {
            accessible: false,
            writable: false,
            reason: Some(format!("目录不可读: {e}")),
        };
    }

    let sentinel = path.join(format!(".upgrader-write-test-{}", std::process::id()));
    match fs::write(&sentinel, b"ok") {
        Ok(()) => {
            if let Err(e) = fs::remove_file(&sentinel) {
                warn!(path = %sentinel.display(), error = %e, "failed to remove write sentinel");
            }
            Accessibility {
                accessible: true,
                writable: true,
                reason: None,
            }
        }
        Err(e) => Accessibility {
            accessible: true,
            writable: false,
            reason: Some(format!("目录不可写: {e}")),
        },
    }
}
