//! Shared domain types and the control-plane wire model.
//!
//! The transport carries JSON envelopes `{"event": <name>, "data": <payload>}`
//! in both directions. Outbound events are the closed set [`AgentEvent`];
//! inbound events decode into [`ServerEvent`], with the generic
//! `device:command` carrier and the direct `cmd:*` events normalizing into the
//! same [`CommandEnvelope`] shape so the dispatcher has a single entry point.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Version string recorded when a deploy target has never been written to.
/// Readers treat it as equivalent to "absent".
pub const UNKNOWN_VERSION: &str = "unknown";

/// The project label selecting a deploy root and isolating snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Project {
    Frontend,
    Backend,
}

impl Project {
    pub fn as_str(&self) -> &'static str {
        match self {
            Project::Frontend => "frontend",
            Project::Backend => "backend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frontend" => Some(Project::Frontend),
            "backend" => Some(Project::Backend),
            _ => None,
        }
    }
}

impl std::fmt::Display for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package metadata advertised by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    pub file_name: String,
    #[serde(rename = "fileMD5")]
    pub file_md5: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<Project>,
}

/// Response shape of `GET {serverUrl}/packages/{project}/{fileName}`. Older
/// control planes put the metadata under `package`, newer ones under `data`.
#[derive(Debug, Deserialize)]
pub struct PackageInfoResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub package: Option<PackageMetadata>,
    #[serde(default)]
    pub data: Option<PackageMetadata>,
}

impl PackageInfoResponse {
    pub fn into_metadata(self) -> Option<PackageMetadata> {
        if !self.success {
            return None;
        }
        self.package.or(self.data)
    }
}

/// `version.json` inside each deployed project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub project: String,
    pub version: String,
    pub deploy_time: DateTime<Utc>,
    pub package_path: String,
    pub device_id: String,
    /// `"rollback"` marks records synthesized while restoring a snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// `backup-info.json` sidecar written into every snapshot directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub project: String,
    pub original_version: String,
    pub backup_time: DateTime<Utc>,
    pub source_dir: String,
    pub backup_path: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Per-project entry in `deploy-paths.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPathEntry {
    pub deploy_path: String,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

/// `config/deploy-paths.json`: the authoritative per-project deploy roots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployPathsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<DeployPathEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<DeployPathEntry>,
}

impl DeployPathsFile {
    pub fn entry(&self, project: Project) -> Option<&DeployPathEntry> {
        match project {
            Project::Frontend => self.frontend.as_ref(),
            Project::Backend => self.backend.as_ref(),
        }
    }

    pub fn set_entry(&mut self, project: Project, entry: DeployPathEntry) {
        match project {
            Project::Frontend => self.frontend = Some(entry),
            Project::Backend => self.backend = Some(entry),
        }
    }
}

/// Steps a long operation moves through, as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    Connecting,
    Preparing,
    Backup,
    Downloading,
    Extracting,
    Deploying,
    Verifying,
    Cleaning,
    Completed,
    Failed,
}

impl ProgressStep {
    /// (1-based index, total) used by batch progress reporting.
    pub fn position(&self) -> (u8, u8) {
        let idx = match self {
            ProgressStep::Connecting => 1,
            ProgressStep::Preparing => 2,
            ProgressStep::Backup => 3,
            ProgressStep::Downloading => 4,
            ProgressStep::Extracting => 5,
            ProgressStep::Deploying => 6,
            ProgressStep::Verifying => 7,
            ProgressStep::Cleaning | ProgressStep::Completed | ProgressStep::Failed => 8,
        };
        (idx, 8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Completed,
    Error,
}

/// One progress event for a session. Single producer (the operation handler),
/// single consumer (the transport).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub session_id: String,
    pub device_id: String,
    pub step: ProgressStep,
    pub progress: u8,
    pub message: String,
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// The operation-exclusion scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Idle,
    Upgrading,
    RollingBack,
}

impl OperationStatus {
    /// The rejection text sent when a second operation arrives while busy.
    pub fn busy_reason(&self) -> &'static str {
        match self {
            OperationStatus::Idle => "",
            OperationStatus::Upgrading => "正在执行升级，请稍后再试",
            OperationStatus::RollingBack => "正在执行回滚，请稍后再试",
        }
    }
}

/// Device status values pushed via `device:status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Registered,
    Upgrading,
    UpgradeSuccess,
    UpgradeFailed,
    RollingBack,
    RollbackSuccess,
    RollbackFailed,
    Offline,
}

/// Arguments of an upgrade command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCommand {
    pub project: String,
    pub file_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_path: Option<String>,
    #[serde(default)]
    pub preserved_paths: Vec<String>,
    #[serde(default, rename = "fileMD5", skip_serializing_if = "Option::is_none")]
    pub file_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_task_id: Option<String>,
}

/// Arguments of a rollback command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackCommand {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub preserved_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_task_id: Option<String>,
}

/// The generic `device:command` carrier. Direct `cmd:*` events are normalized
/// into this shape at decode time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

impl CommandEnvelope {
    /// Command arguments: `params` wins over `data`, absent means `{}`.
    pub fn args(&self) -> Value {
        self.params
            .clone()
            .or_else(|| self.data.clone())
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// The correlation id, if the command carried one.
    pub fn id(&self) -> Option<&str> {
        self.command_id
            .as_deref()
            .or(self.message_id.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Normalized command name: a `cmd:` prefix is stripped.
    pub fn name(&self) -> &str {
        self.command.strip_prefix("cmd:").unwrap_or(&self.command)
    }
}

/// Decoded server→agent events.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Registered,
    Command(CommandEnvelope),
    HeartbeatAck { timestamp: Option<i64> },
    DeployPathConfig { deploy_path: String },
    RefreshNetwork,
}

/// Decode an inbound envelope into a [`ServerEvent`]. Unknown event names
/// yield `None` and are ignored by the dispatcher.
pub fn decode_server_event(event: &str, data: Value) -> Option<ServerEvent> {
    match event {
        "device:registered" => Some(ServerEvent::Registered),
        "device:command" => {
            let envelope: CommandEnvelope = serde_json::from_value(data).ok()?;
            Some(ServerEvent::Command(envelope))
        }
        "cmd:upgrade" | "cmd:rollback" | "cmd:status" | "getCurrentVersion" | "getDeployPath" => {
            Some(ServerEvent::Command(direct_command(event, data)))
        }
        "device:heartbeat_ack" => {
            let timestamp = data.get("timestamp").and_then(Value::as_i64);
            Some(ServerEvent::HeartbeatAck { timestamp })
        }
        "config:deploy-path" => {
            let deploy_path = data.get("deployPath").and_then(Value::as_str)?.to_string();
            Some(ServerEvent::DeployPathConfig { deploy_path })
        }
        "config:refresh-network" => Some(ServerEvent::RefreshNetwork),
        _ => None,
    }
}

fn direct_command(event: &str, data: Value) -> CommandEnvelope {
    let message_id = data
        .get("messageId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let command_id = data
        .get("commandId")
        .and_then(Value::as_str)
        .map(str::to_string);
    CommandEnvelope {
        command: event.to_string(),
        params: Some(data),
        data: None,
        message_id,
        command_id,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub platform: String,
    pub os_version: String,
    pub arch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub agent_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    #[serde(default)]
    pub mac_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthInfo {
    pub uptime_seconds: u64,
}

/// Full identity payload sent on every (re)connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub device_id: String,
    pub device_name: String,
    pub system: SystemInfo,
    pub agent: AgentInfo,
    pub network: NetworkInfo,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkUpdatePayload {
    pub device_id: String,
    pub network: NetworkInfo,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployStatusInfo {
    pub rollback_available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemUpdatePayload {
    pub device_id: String,
    pub agent: AgentInfo,
    pub system: SystemInfo,
    pub deploy: DeployStatusInfo,
    pub health: HealthInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub device_id: String,
    pub status: DeviceStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub device_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub health: HealthInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultPayload {
    pub command_id: String,
    pub device_id: String,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusPayload {
    pub batch_task_id: String,
    pub device_id: String,
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgressPayload {
    pub batch_task_id: String,
    pub device_id: String,
    pub percentage: u8,
    pub current_step: u8,
    pub total_steps: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPathUpdatedPayload {
    pub device_id: String,
    pub project: String,
    pub deploy_path: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Agent→server events. A sealed set: adding a variant is a protocol change.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Register(RegisterPayload),
    UpdateNetwork(NetworkUpdatePayload),
    UpdateSystem(SystemUpdatePayload),
    Status(StatusPayload),
    Heartbeat(HeartbeatPayload),
    OperationStart(ProgressUpdate),
    OperationProgress(ProgressUpdate),
    CommandResult(CommandResultPayload),
    /// `response:<id>`, emitted alongside `command:result` for `cmd_` ids.
    Response {
        id: String,
        payload: CommandResultPayload,
    },
    BatchStatus(BatchStatusPayload),
    BatchProgress(BatchProgressPayload),
    DeployPathUpdated(DeployPathUpdatedPayload),
}

impl AgentEvent {
    pub fn name(&self) -> String {
        match self {
            AgentEvent::Register(_) => "device:register".to_string(),
            AgentEvent::UpdateNetwork(_) => "device:update-network".to_string(),
            AgentEvent::UpdateSystem(_) => "device:update-system".to_string(),
            AgentEvent::Status(_) => "device:status".to_string(),
            AgentEvent::Heartbeat(_) => "device:heartbeat".to_string(),
            AgentEvent::OperationStart(_) => "device:operation_start".to_string(),
            AgentEvent::OperationProgress(_) => "device:operation_progress".to_string(),
            AgentEvent::CommandResult(_) => "command:result".to_string(),
            AgentEvent::Response { id, .. } => format!("response:{id}"),
            AgentEvent::BatchStatus(_) => "batch:device_status".to_string(),
            AgentEvent::BatchProgress(_) => "batch:device_progress".to_string(),
            AgentEvent::DeployPathUpdated(_) => "deployPathUpdated".to_string(),
        }
    }

    pub fn data(&self) -> Value {
        match self {
            AgentEvent::Register(p) => to_value(p),
            AgentEvent::UpdateNetwork(p) => to_value(p),
            AgentEvent::UpdateSystem(p) => to_value(p),
            AgentEvent::Status(p) => to_value(p),
            AgentEvent::Heartbeat(p) => to_value(p),
            AgentEvent::OperationStart(p) | AgentEvent::OperationProgress(p) => to_value(p),
            AgentEvent::CommandResult(p) | AgentEvent::Response { payload: p, .. } => to_value(p),
            AgentEvent::BatchStatus(p) => to_value(p),
            AgentEvent::BatchProgress(p) => to_value(p),
            AgentEvent::DeployPathUpdated(p) => to_value(p),
        }
    }

    /// The wire form: one JSON text frame per event.
    pub fn encode(&self) -> String {
        json!({ "event": self.name(), "data": self.data() }).to_string()
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Result of a package download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub file_path: PathBuf,
    /// True when a verified artifact was reused without touching the network.
    pub cached: bool,
}

/// Result of a successful deploy.
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub project: Project,
    pub version: String,
    pub deploy_path: PathBuf,
    pub backup_created: bool,
    pub preserved_entries: usize,
}

/// Result of a successful rollback.
#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub project: Project,
    pub version: String,
    pub deploy_path: PathBuf,
    pub snapshot_name: String,
}
