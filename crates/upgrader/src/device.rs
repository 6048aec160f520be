//! Device identity and host discovery.
//!
//! The device id is assigned once, persisted to `config/device-info.json`,
//! and reused on every boot. Derivation is deterministic: a digest over the
//! hostname and MAC set, optionally suffixed with `AGENT_INSTANCE_ID`. The
//! `DEVICE_ID` environment variable overrides everything.
//!
//! Name resolution, the WiFi probe, and MAC enumeration are all best-effort:
//! a failure degrades the payload, never the agent.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::deploy_paths::atomic_write_json;
use crate::types::{NetworkInfo, SystemInfo};

/// Fallback when every name source comes up empty.
pub const UNKNOWN_DEVICE_NAME: &str = "未知设备";

const WIFI_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything the agent knows about itself at startup.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub device_id: String,
    pub device_name: String,
    pub agent_version: String,
    pub system: SystemInfo,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceInfoFile {
    device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl DeviceProfile {
    /// Resolve identity at startup. Creates and persists the device id on
    /// first boot.
    pub fn initialize(cfg: &AgentConfig) -> Result<Self> {
        let device_id = load_or_create_device_id(cfg)?;
        let device_name = resolve_device_name(cfg);
        Ok(Self {
            device_id,
            device_name,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            system: system_info(),
        })
    }
}

/// Load the persisted device id, or derive and persist a new one.
pub fn load_or_create_device_id(cfg: &AgentConfig) -> Result<String> {
    let info_path = cfg.device_info_file();

    if let Ok(id) = std::env::var("DEVICE_ID") {
        let id = id.trim().to_string();
        if !id.is_empty() {
            persist_device_id(&info_path, &id)?;
            return Ok(id);
        }
    }

    if let Ok(content) = fs::read_to_string(&info_path) {
        if let Ok(info) = serde_json::from_str::<DeviceInfoFile>(&content) {
            if !info.device_id.trim().is_empty() {
                return Ok(info.device_id);
            }
        }
    }

    let id = derive_device_id(cfg.instance_id.as_deref());
    persist_device_id(&info_path, &id)?;
    Ok(id)
}

fn persist_device_id(path: &Path, device_id: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config dir {}", parent.display()))?;
    }
    atomic_write_json(
        path,
        &DeviceInfoFile {
            device_id: device_id.to_string(),
            device_name: None,
            created_at: Utc::now(),
        },
    )
}

/// Deterministic id: sha256(hostname + MAC set), truncated, hex.
fn derive_device_id(instance: Option<&str>) -> String {
    let hostname = raw_hostname().unwrap_or_else(|| "unknown-host".to_string());
    let mut macs = mac_addresses();
    macs.sort();

    let mut hasher = Sha256::new();
    hasher.update(hostname.as_bytes());
    for mac in &macs {
        hasher.update(mac.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    match instance {
        Some(instance) => format!("{}-{instance}", &digest[..16]),
        None => digest[..16].to_string(),
    }
}

/// Resolve the human-facing device name.
///
/// Ladder: configured name (when preferred and non-default) → real hostname →
/// name synthesized from the username → configured name → `未知设备`. A
/// configured instance id is appended so multiple agents on one host stay
/// distinguishable.
pub fn resolve_device_name(cfg: &AgentConfig) -> String {
    let configured = cfg
        .device_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != UNKNOWN_DEVICE_NAME);

    let mut name = None;
    if cfg.prefer_config_name {
        name = configured.map(str::to_string);
    }
    if name.is_none() && cfg.use_real_hostname {
        name = hostname();
    }
    if name.is_none() {
        name = username().map(|user| format!("{user}-device"));
    }
    if name.is_none() {
        name = configured.map(str::to_string);
    }
    let name = name.unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string());

    match &cfg.instance_id {
        Some(instance) => format!("{name}-{instance}"),
        None => name,
    }
}

/// Hostname with `.local` stripped; `localhost` variants rejected.
fn hostname() -> Option<String> {
    raw_hostname().and_then(|raw| clean_hostname(&raw))
}

fn raw_hostname() -> Option<String> {
    let from_os = gethostname::gethostname().to_string_lossy().into_owned();
    if !from_os.trim().is_empty() {
        return Some(from_os);
    }
    for key in ["COMPUTERNAME", "HOSTNAME"] {
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn clean_hostname(raw: &str) -> Option<String> {
    let name = raw.trim().trim_end_matches(".local").to_string();
    if name.is_empty() || name == "localhost" || name == "localhost.localdomain" {
        None
    } else {
        Some(name)
    }
}

fn username() -> Option<String> {
    for key in ["USER", "USERNAME", "LOGNAME"] {
        if let Ok(value) = std::env::var(key) {
            let value = value.trim().to_string();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Platform/OS-version/arch triple for the registration payload.
pub fn system_info() -> SystemInfo {
    SystemInfo {
        platform: std::env::consts::OS.to_string(),
        os_version: os_version().unwrap_or_else(|| std::env::consts::OS.to_string()),
        arch: std::env::consts::ARCH.to_string(),
    }
}

fn os_version() -> Option<String> {
    let output = if cfg!(windows) {
        std::process::Command::new("cmd").args(["/c", "ver"]).output()
    } else {
        std::process::Command::new("uname").arg("-sr").output()
    };
    match output {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

/// Discover WiFi SSID, local IP, and MAC addresses. Each probe is
/// independent and best-effort.
pub async fn collect_network_info() -> NetworkInfo {
    NetworkInfo {
        wifi_name: wifi_name().await,
        local_ip: local_ip(),
        mac_addresses: mac_addresses(),
    }
}

/// The outbound interface address, found by "connecting" a UDP socket (no
/// packet is sent).
fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// Physical interface MACs. Loopback and all-zero addresses are skipped.
pub fn mac_addresses() -> Vec<String> {
    let mut macs = Vec::new();
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = fs::read_dir("/sys/class/net") {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == "lo" {
                    continue;
                }
                if let Ok(mac) = fs::read_to_string(entry.path().join("address")) {
                    let mac = mac.trim().to_string();
                    if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                        macs.push(mac);
                    }
                }
            }
        }
    }
    macs
}

async fn wifi_name() -> Option<String> {
    let probe = async {
        let output = if cfg!(windows) {
            tokio::process::Command::new("netsh")
                .args(["wlan", "show", "interfaces"])
                .output()
                .await
        } else {
            tokio::process::Command::new("iwgetid").arg("-r").output().await
        };
        match output {
            Ok(out) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout);
                parse_wifi_output(&text)
            }
            Ok(out) => {
                debug!(status = %out.status, "wifi probe exited non-zero");
                None
            }
            Err(e) => {
                debug!(error = %e, "wifi probe unavailable");
                None
            }
        }
    };

    match tokio::time::timeout(WIFI_PROBE_TIMEOUT, probe).await {
        Ok(name) => name,
        Err(_) => {
            warn!("wifi probe timed out after {WIFI_PROBE_TIMEOUT:?}");
            None
        }
    }
}

fn parse_wifi_output(text: &str) -> Option<String> {
    if cfg!(windows) {
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with("SSID") && !line.starts_with("SSID BSSID") {
                if let Some((_, value)) = line.split_once(':') {
                    let value = value.trim();
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
        None
    } else {
        let ssid = text.trim();
        (!ssid.is_empty()).then(|| ssid.to_string())
    }
}
