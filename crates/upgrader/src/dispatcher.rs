//! Command dispatch.
//!
//! One dispatcher task consumes decoded server events in arrival order.
//! Status-style commands are answered inline; upgrades and rollbacks claim
//! the operation-exclusion scalar inline too — still in arrival order — and
//! only then spawn onto their own task, so the agent keeps answering
//! `cmd:status` while a deploy runs. Every command with a correlation id
//! gets a `command:result` reply, plus a `response:<id>` event when the id
//! carries the `cmd_` prefix.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::deploy::DeployEngine;
use crate::deploy_paths::{load_version_record, recorded_deploy_path};
use crate::device::DeviceProfile;
use crate::error::AgentError;
use crate::fetch::PackageFetcher;
use crate::fsutil::PreservedPatterns;
use crate::progress::{OperationProgress, ProgressBus};
use crate::rollback::RollbackEngine;
use crate::transport::TransportHandle;
use crate::types::{
    AgentEvent, AgentInfo, BatchProgressPayload, BatchStatusPayload, CommandEnvelope,
    CommandResultPayload, DeployPathUpdatedPayload, DeployReport, DeployStatusInfo, DeviceStatus,
    HealthInfo, OperationStatus, Project, ProgressStatus, ProgressStep, ProgressUpdate,
    RollbackCommand, RollbackReport, ServerEvent, StatusPayload, SystemUpdatePayload,
    UNKNOWN_VERSION, UpgradeCommand,
};

pub struct Dispatcher {
    cfg: Arc<AgentConfig>,
    device: DeviceProfile,
    bus: Arc<ProgressBus>,
    transport: TransportHandle,
    op_status: Arc<Mutex<OperationStatus>>,
    fetcher: PackageFetcher,
    deploy: DeployEngine,
    rollback: RollbackEngine,
    started: Instant,
}

/// Scoped operation-status acquisition: dropping the guard always returns
/// the agent to idle, whatever exit path the operation took.
struct OpGuard {
    status: Arc<Mutex<OperationStatus>>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        *self.status.lock().expect("operation status poisoned") = OperationStatus::Idle;
    }
}

impl Dispatcher {
    pub fn new(
        cfg: Arc<AgentConfig>,
        device: DeviceProfile,
        transport: TransportHandle,
    ) -> anyhow::Result<Self> {
        let fetcher = PackageFetcher::new(&cfg)?;
        let deploy = DeployEngine::new(cfg.clone(), device.device_id.clone());
        let rollback = RollbackEngine::new(cfg.clone(), device.device_id.clone());
        Ok(Self {
            bus: Arc::new(ProgressBus::new(device.device_id.clone())),
            cfg,
            device,
            transport,
            op_status: Arc::new(Mutex::new(OperationStatus::Idle)),
            fetcher,
            deploy,
            rollback,
            started: Instant::now(),
        })
    }

    pub fn operation_status(&self) -> OperationStatus {
        *self.op_status.lock().expect("operation status poisoned")
    }

    /// Consume server events until the channel closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = inbound.recv().await {
            self.clone().handle_event(event);
        }
        debug!("dispatcher stopped");
    }

    fn handle_event(self: Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::Registered => {
                self.send_status(DeviceStatus::Registered);
                self.send_system_update();
            }
            ServerEvent::Command(envelope) => self.handle_command(envelope),
            ServerEvent::DeployPathConfig { deploy_path } => {
                // The push carries no project tag; acknowledge with a fresh
                // system update and leave deploy-paths.json to operations.
                info!(deploy_path, "server pushed a deploy path, refreshing system info");
                self.send_system_update();
            }
            ServerEvent::HeartbeatAck { .. } | ServerEvent::RefreshNetwork => {
                // Consumed by the transport; nothing to do here.
            }
        }
    }

    fn handle_command(self: Arc<Self>, envelope: CommandEnvelope) {
        let id = envelope.id().map(str::to_string);
        let name = envelope.name().to_string();
        debug!(command = name, id = ?id, "command received");

        match name.as_str() {
            // The exclusivity claim happens here, in arrival order, before
            // any task is spawned: a later command can never beat an earlier
            // one to the scalar.
            "upgrade" => match serde_json::from_value::<UpgradeCommand>(envelope.args()) {
                Ok(cmd) => match self.try_begin(OperationStatus::Upgrading) {
                    Ok(guard) => {
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_upgrade(guard, cmd, id).await });
                    }
                    Err(reason) => {
                        self.reply(id.as_deref(), false, reason.clone(), None);
                        self.batch_status(cmd.batch_task_id.as_deref(), "failed", &reason);
                    }
                },
                Err(e) => self.reply(id.as_deref(), false, format!("升级参数无效: {e}"), None),
            },
            "rollback" => match serde_json::from_value::<RollbackCommand>(envelope.args()) {
                Ok(cmd) => match self.try_begin(OperationStatus::RollingBack) {
                    Ok(guard) => {
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_rollback(guard, cmd, id).await });
                    }
                    Err(reason) => {
                        self.reply(id.as_deref(), false, reason.clone(), None);
                        self.batch_status(cmd.batch_task_id.as_deref(), "failed", &reason);
                    }
                },
                Err(e) => self.reply(id.as_deref(), false, format!("回滚参数无效: {e}"), None),
            },
            "status" => {
                let snapshot = self.status_snapshot();
                self.reply(id.as_deref(), true, "ok".to_string(), Some(snapshot));
            }
            "getCurrentVersion" => {
                let project = envelope
                    .args()
                    .get("project")
                    .and_then(Value::as_str)
                    .and_then(Project::parse);
                match project {
                    Some(project) => {
                        let data = self.current_version_data(project);
                        self.reply(id.as_deref(), true, "ok".to_string(), Some(data));
                    }
                    None => self.reply(
                        id.as_deref(),
                        false,
                        "未知项目，期望 frontend 或 backend".to_string(),
                        None,
                    ),
                }
            }
            "getDeployPath" => self.reply(
                id.as_deref(),
                false,
                "getDeployPath 已废弃，请使用 getCurrentVersion".to_string(),
                None,
            ),
            other => self.reply(id.as_deref(), false, format!("不支持的命令: {other}"), None),
        }
    }

    /// Runs with the operation guard already claimed by `handle_command`;
    /// every exit path releases it via drop.
    async fn handle_upgrade(self: Arc<Self>, guard: OpGuard, cmd: UpgradeCommand, id: Option<String>) {
        let _guard = guard;
        let Some(project) = Project::parse(&cmd.project) else {
            self.reply(
                id.as_deref(),
                false,
                format!("未知项目: {}", cmd.project),
                None,
            );
            self.batch_status(cmd.batch_task_id.as_deref(), "failed", "未知项目");
            return;
        };

        info!(
            project = %project,
            file = cmd.file_name,
            version = cmd.version,
            session = ?cmd.session_id,
            "upgrade starting"
        );
        self.send_status(DeviceStatus::Upgrading);
        self.batch_status(cmd.batch_task_id.as_deref(), "running", "开始升级");
        self.open_session(cmd.session_id.as_deref(), cmd.batch_task_id.clone(), "upgrade");

        let progress = OperationProgress::new(&self.bus, cmd.session_id.clone(), "upgrade");
        let result = self.run_upgrade(project, &cmd, &progress).await;

        match &result {
            Ok(report) => {
                progress.complete(format!("升级完成: v{}", report.version));
                self.send_status(DeviceStatus::UpgradeSuccess);
                self.notify_deploy_path(project, &report.deploy_path, &report.version);
                self.reply(
                    id.as_deref(),
                    true,
                    format!("升级成功: v{}", report.version),
                    Some(json!({
                        "project": project,
                        "version": report.version,
                        "deployPath": report.deploy_path,
                        "backupCreated": report.backup_created,
                    })),
                );
                self.batch_status(cmd.batch_task_id.as_deref(), "completed", "升级成功");
            }
            Err(e) => {
                let message = e.reply_message();
                warn!(project = %project, error = message, "upgrade failed");
                progress.fail("升级失败", message.clone());
                self.send_status(DeviceStatus::UpgradeFailed);
                self.reply(id.as_deref(), false, message.clone(), None);
                self.batch_status(cmd.batch_task_id.as_deref(), "failed", &message);
            }
        }

        if let Some(session_id) = &cmd.session_id {
            self.bus.remove(session_id);
        }
    }

    async fn run_upgrade(
        &self,
        project: Project,
        cmd: &UpgradeCommand,
        progress: &OperationProgress<'_>,
    ) -> Result<DeployReport, AgentError> {
        progress.emit(ProgressStep::Connecting, 0, "获取升级包信息");
        let metadata = match self.fetcher.info(project, &cmd.file_name).await {
            Some(metadata) => metadata,
            None => match &cmd.file_md5 {
                // The command itself pins the hash, so a metadata outage is
                // survivable.
                Some(md5) => crate::types::PackageMetadata {
                    file_name: cmd.file_name.clone(),
                    file_md5: md5.clone(),
                    file_size: None,
                    project: Some(project),
                },
                None => {
                    return Err(AgentError::DownloadFailed(format!(
                        "获取包信息失败: {}/{}",
                        project, cmd.file_name
                    )));
                }
            },
        };

        let report_progress = |received: u64, total: Option<u64>| {
            let percent = total
                .filter(|t| *t > 0)
                .map(|t| ((received as f64 / t as f64) * 100.0) as i64)
                .unwrap_or(0);
            progress.emit(
                ProgressStep::Downloading,
                percent,
                format!("下载中 {received} 字节"),
            );
        };
        let outcome = self
            .fetcher
            .download(project, &metadata, Some(&report_progress))
            .await?;
        if outcome.cached {
            progress.emit(ProgressStep::Downloading, 100, "使用已缓存的升级包");
        }

        let preserved = PreservedPatterns::new(&cmd.preserved_paths);
        self.deploy
            .deploy(
                project,
                &outcome.file_path,
                &cmd.version,
                cmd.deploy_path.as_deref(),
                &preserved,
                progress,
            )
            .await
    }

    /// Runs with the operation guard already claimed by `handle_command`;
    /// every exit path releases it via drop.
    async fn handle_rollback(self: Arc<Self>, guard: OpGuard, cmd: RollbackCommand, id: Option<String>) {
        let _guard = guard;
        let Some(project) = Project::parse(&cmd.project) else {
            self.reply(
                id.as_deref(),
                false,
                format!("未知项目: {}", cmd.project),
                None,
            );
            self.batch_status(cmd.batch_task_id.as_deref(), "failed", "未知项目");
            return;
        };

        info!(project = %project, version = ?cmd.version, "rollback starting");
        self.send_status(DeviceStatus::RollingBack);
        self.batch_status(cmd.batch_task_id.as_deref(), "running", "开始回滚");
        self.open_session(cmd.session_id.as_deref(), cmd.batch_task_id.clone(), "rollback");

        let progress = OperationProgress::new(&self.bus, cmd.session_id.clone(), "rollback");
        let preserved = PreservedPatterns::new(&cmd.preserved_paths);
        let result: Result<RollbackReport, AgentError> = self
            .rollback
            .rollback(project, cmd.version.as_deref(), &preserved, &progress)
            .await;

        match &result {
            Ok(report) => {
                progress.complete(format!("回滚完成: v{}", report.version));
                self.send_status(DeviceStatus::RollbackSuccess);
                self.notify_deploy_path(project, &report.deploy_path, &report.version);
                self.reply(
                    id.as_deref(),
                    true,
                    format!("回滚成功: v{}", report.version),
                    Some(json!({
                        "project": project,
                        "version": report.version,
                        "deployPath": report.deploy_path,
                        "snapshot": report.snapshot_name,
                    })),
                );
                self.batch_status(cmd.batch_task_id.as_deref(), "completed", "回滚成功");
            }
            Err(e) => {
                let message = e.reply_message();
                warn!(project = %project, error = message, "rollback failed");
                progress.fail("回滚失败", message.clone());
                self.send_status(DeviceStatus::RollbackFailed);
                self.reply(id.as_deref(), false, message.clone(), None);
                self.batch_status(cmd.batch_task_id.as_deref(), "failed", &message);
            }
        }

        if let Some(session_id) = &cmd.session_id {
            self.bus.remove(session_id);
        }
    }

    /// Claim the operation-exclusion scalar, or report why not.
    fn try_begin(&self, next: OperationStatus) -> Result<OpGuard, String> {
        let mut status = self.op_status.lock().expect("operation status poisoned");
        if *status != OperationStatus::Idle {
            return Err(status.busy_reason().to_string());
        }
        *status = next;
        Ok(OpGuard {
            status: self.op_status.clone(),
        })
    }

    /// Register the progress session: events flow to the transport, and to
    /// batch progress when the command belongs to a batch task.
    fn open_session(
        &self,
        session_id: Option<&str>,
        batch_task_id: Option<String>,
        operation: &'static str,
    ) {
        let Some(session_id) = session_id else {
            return;
        };
        let outbound = self.transport.outbound.clone();
        let device_id = self.device.device_id.clone();
        self.bus.register(
            session_id,
            Box::new(move |update: ProgressUpdate| {
                if let Some(batch) = &batch_task_id {
                    let (current_step, total_steps) = update.step.position();
                    outbound
                        .send(AgentEvent::BatchProgress(BatchProgressPayload {
                            batch_task_id: batch.clone(),
                            device_id: device_id.clone(),
                            percentage: update.progress,
                            current_step,
                            total_steps,
                            message: update.message.clone(),
                            timestamp: update.timestamp,
                        }))
                        .ok();
                }
                outbound.send(AgentEvent::OperationProgress(update)).ok();
            }),
        );

        let label = if operation == "rollback" {
            "开始回滚"
        } else {
            "开始升级"
        };
        // Announce the session before the first step lands.
        self.send(AgentEvent::OperationStart(ProgressUpdate {
            session_id: session_id.to_string(),
            device_id: self.device.device_id.clone(),
            step: ProgressStep::Connecting,
            progress: 0,
            message: label.to_string(),
            status: ProgressStatus::Running,
            error: None,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }));
    }

    fn reply(&self, id: Option<&str>, success: bool, message: String, data: Option<Value>) {
        let Some(id) = id else {
            debug!(success, message, "command had no id, reply skipped");
            return;
        };
        let payload = CommandResultPayload {
            command_id: id.to_string(),
            device_id: self.device.device_id.clone(),
            success,
            message,
            data,
            timestamp: Utc::now(),
        };
        self.send(AgentEvent::CommandResult(payload.clone()));
        if id.starts_with("cmd_") {
            self.send(AgentEvent::Response {
                id: id.to_string(),
                payload,
            });
        }
    }

    fn send(&self, event: AgentEvent) {
        if self.transport.outbound.send(event).is_err() {
            warn!("transport gone, outbound event dropped");
        }
    }

    fn send_status(&self, status: DeviceStatus) {
        self.send(AgentEvent::Status(StatusPayload {
            device_id: self.device.device_id.clone(),
            status,
            timestamp: Utc::now(),
        }));
    }

    fn send_system_update(&self) {
        let rollback_available = self.rollback.rollback_available(Project::Frontend)
            || self.rollback.rollback_available(Project::Backend);
        self.send(AgentEvent::UpdateSystem(SystemUpdatePayload {
            device_id: self.device.device_id.clone(),
            agent: AgentInfo {
                agent_version: self.device.agent_version.clone(),
            },
            system: self.device.system.clone(),
            deploy: DeployStatusInfo { rollback_available },
            health: HealthInfo {
                uptime_seconds: self.started.elapsed().as_secs(),
            },
        }));
    }

    fn notify_deploy_path(&self, project: Project, deploy_path: &std::path::Path, version: &str) {
        self.send(AgentEvent::DeployPathUpdated(DeployPathUpdatedPayload {
            device_id: self.device.device_id.clone(),
            project: project.to_string(),
            deploy_path: deploy_path.to_string_lossy().into_owned(),
            version: version.to_string(),
            timestamp: Utc::now(),
        }));
    }

    fn status_snapshot(&self) -> Value {
        let project_status = |project: Project| {
            let deploy_path = recorded_deploy_path(&self.cfg.deploy_paths_file(), project)
                .unwrap_or_else(|| self.cfg.deploy_root(project).to_path_buf());
            let version = crate::deploy_paths::current_version(&deploy_path)
                .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
            json!({
                "deployPath": deploy_path,
                "version": version,
                "rollbackAvailable": self.rollback.rollback_available(project),
            })
        };
        json!({
            "deviceId": self.device.device_id,
            "deviceName": self.device.device_name,
            "agentVersion": self.device.agent_version,
            "operationStatus": self.operation_status(),
            "connection": self.transport.state.borrow().to_string(),
            "uptimeSeconds": self.started.elapsed().as_secs(),
            "projects": {
                "frontend": project_status(Project::Frontend),
                "backend": project_status(Project::Backend),
            },
        })
    }

    fn current_version_data(&self, project: Project) -> Value {
        let deploy_path = recorded_deploy_path(&self.cfg.deploy_paths_file(), project)
            .unwrap_or_else(|| self.cfg.deploy_root(project).to_path_buf());
        match load_version_record(&deploy_path) {
            Some(record) => json!({
                "project": project,
                "version": record.version,
                "deployTime": record.deploy_time,
                "deployPath": deploy_path,
                "source": record.source,
            }),
            None => json!({
                "project": project,
                "version": UNKNOWN_VERSION,
                "deployPath": deploy_path,
            }),
        }
    }

    fn batch_status(&self, batch_task_id: Option<&str>, status: &str, message: &str) {
        let Some(batch_task_id) = batch_task_id else {
            return;
        };
        self.send(AgentEvent::BatchStatus(BatchStatusPayload {
            batch_task_id: batch_task_id.to_string(),
            device_id: self.device.device_id.clone(),
            status: status.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionState;
    use crate::types::SystemInfo;
    use std::fs;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::watch;
    use zip::write::SimpleFileOptions;

    struct Fixture {
        _data: TempDir,
        _state_tx: watch::Sender<ConnectionState>,
        cfg: Arc<AgentConfig>,
        dispatcher: Arc<Dispatcher>,
        outbound_rx: mpsc::UnboundedReceiver<AgentEvent>,
    }

    fn fixture() -> Fixture {
        let data = TempDir::new().unwrap();
        let mut cfg = AgentConfig::default();
        // The discard port: metadata fetches fail fast without a server.
        cfg.server.url = "http://127.0.0.1:9".to_string();
        cfg.dirs = crate::config::DirsConfig::under(data.path());
        let cfg = Arc::new(cfg);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Connected { registered: true });
        let handle = TransportHandle {
            outbound: outbound_tx,
            state: state_rx,
        };
        let device = DeviceProfile {
            device_id: "dev-test".to_string(),
            device_name: "test-box".to_string(),
            agent_version: "0.0.0".to_string(),
            system: SystemInfo::default(),
        };
        let dispatcher = Arc::new(Dispatcher::new(cfg.clone(), device, handle).unwrap());
        Fixture {
            _data: data,
            _state_tx: state_tx,
            cfg,
            dispatcher,
            outbound_rx,
        }
    }

    fn make_zip(path: &std::path::Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    async fn drain_events(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            match event {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }

    fn find_result<'a>(events: &'a [AgentEvent], id: &str) -> Option<&'a CommandResultPayload> {
        events.iter().find_map(|event| match event {
            AgentEvent::CommandResult(payload) if payload.command_id == id => Some(payload),
            _ => None,
        })
    }

    #[tokio::test]
    async fn unknown_commands_are_rejected() {
        let mut fx = fixture();
        fx.dispatcher.clone().handle_command(CommandEnvelope {
            command: "selfDestruct".to_string(),
            message_id: Some("m1".to_string()),
            ..Default::default()
        });

        let events = drain_events(&mut fx.outbound_rx).await;
        let reply = find_result(&events, "m1").unwrap();
        assert!(!reply.success);
        assert!(reply.message.contains("不支持的命令"));
    }

    #[tokio::test]
    async fn deprecated_get_deploy_path_fails_explicitly() {
        let mut fx = fixture();
        fx.dispatcher.clone().handle_command(CommandEnvelope {
            command: "getDeployPath".to_string(),
            message_id: Some("m2".to_string()),
            ..Default::default()
        });

        let events = drain_events(&mut fx.outbound_rx).await;
        let reply = find_result(&events, "m2").unwrap();
        assert!(!reply.success);
        assert!(reply.message.contains("已废弃"));
    }

    #[tokio::test]
    async fn cmd_prefixed_ids_get_a_response_event() {
        let mut fx = fixture();
        fx.dispatcher.clone().handle_command(CommandEnvelope {
            command: "status".to_string(),
            command_id: Some("cmd_9".to_string()),
            ..Default::default()
        });

        let events = drain_events(&mut fx.outbound_rx).await;
        assert!(find_result(&events, "cmd_9").unwrap().success);
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::Response { id, .. } if id == "cmd_9"
        )));
    }

    #[tokio::test]
    async fn status_snapshot_reports_projects_and_operation() {
        let fx = fixture();
        let snapshot = fx.dispatcher.status_snapshot();
        assert_eq!(snapshot["deviceId"], "dev-test");
        assert_eq!(snapshot["operationStatus"], "idle");
        assert_eq!(snapshot["connection"], "registered");
        assert_eq!(snapshot["projects"]["frontend"]["version"], UNKNOWN_VERSION);
    }

    #[tokio::test]
    async fn busy_agent_rejects_a_second_operation() {
        let mut fx = fixture();
        let _guard = fx.dispatcher.try_begin(OperationStatus::Upgrading).unwrap();
        assert_eq!(fx.dispatcher.operation_status(), OperationStatus::Upgrading);

        // The rejection happens synchronously inside handle_command, before
        // any task is spawned.
        fx.dispatcher.clone().handle_command(CommandEnvelope {
            command: "upgrade".to_string(),
            params: Some(json!({
                "project": "frontend",
                "fileName": "fe-2.zip",
                "version": "2.0.0",
                "batchTaskId": "batch-1",
            })),
            message_id: Some("m3".to_string()),
            ..Default::default()
        });

        let events = drain_events(&mut fx.outbound_rx).await;
        let reply = find_result(&events, "m3").unwrap();
        assert!(!reply.success);
        assert!(reply.message.contains("正在执行升级"));
        // Batch commands also get a failure batch status.
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::BatchStatus(payload)
                if payload.batch_task_id == "batch-1" && payload.status == "failed"
        )));
        // The in-flight operation still owns the scalar.
        assert_eq!(fx.dispatcher.operation_status(), OperationStatus::Upgrading);
    }

    #[tokio::test]
    async fn guard_returns_status_to_idle_on_drop() {
        let fx = fixture();
        {
            let _guard = fx.dispatcher.try_begin(OperationStatus::RollingBack).unwrap();
            assert_eq!(
                fx.dispatcher.operation_status(),
                OperationStatus::RollingBack
            );
        }
        assert_eq!(fx.dispatcher.operation_status(), OperationStatus::Idle);
    }

    #[tokio::test]
    async fn rollback_command_runs_end_to_end_with_progress() {
        let mut fx = fixture();

        // Seed a snapshot the rollback can restore.
        let snapshot = fx
            .cfg
            .dirs
            .backup_dir
            .join("frontend-backup-2026-08-01-10-00-from-1.0.0");
        fs::create_dir_all(&snapshot).unwrap();
        fs::write(snapshot.join("index.html"), "v1").unwrap();
        let target = fx.cfg.deploy_root(Project::Frontend).to_path_buf();
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("index.html"), "v2").unwrap();

        let cmd = RollbackCommand {
            project: "frontend".to_string(),
            version: None,
            preserved_paths: Vec::new(),
            session_id: Some("sess-1".to_string()),
            batch_task_id: None,
        };
        let guard = fx
            .dispatcher
            .try_begin(OperationStatus::RollingBack)
            .unwrap();
        fx.dispatcher
            .clone()
            .handle_rollback(guard, cmd, Some("cmd_roll".to_string()))
            .await;

        assert_eq!(fs::read_to_string(target.join("index.html")).unwrap(), "v1");
        assert_eq!(fx.dispatcher.operation_status(), OperationStatus::Idle);
        assert_eq!(fx.dispatcher.bus.active_sessions(), 0);

        let events = drain_events(&mut fx.outbound_rx).await;
        assert!(find_result(&events, "cmd_roll").unwrap().success);

        // Exactly one terminal progress event, and it is the last one.
        let progress: Vec<&ProgressUpdate> = events
            .iter()
            .filter_map(|event| match event {
                AgentEvent::OperationProgress(update) => Some(update),
                _ => None,
            })
            .collect();
        let terminal: Vec<_> = progress
            .iter()
            .filter(|u| {
                matches!(
                    u.status,
                    ProgressStatus::Completed | ProgressStatus::Error
                )
            })
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].step, ProgressStep::Completed);
        assert_eq!(terminal[0].progress, 100);
        assert!(std::ptr::eq(*terminal[0], *progress.last().unwrap()));

        // The server was told about the path update and the final status.
        assert!(events
            .iter()
            .any(|event| matches!(event, AgentEvent::DeployPathUpdated(_))));
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::Status(payload) if payload.status == DeviceStatus::RollbackSuccess
        )));
    }

    #[tokio::test]
    async fn upgrade_with_pinned_hash_skips_the_metadata_endpoint() {
        let mut fx = fixture();

        // No control plane is listening; the command carries the hash and
        // the artifact is already in the package store.
        let package_dir = fx.cfg.dirs.package_dir.join("frontend");
        fs::create_dir_all(&package_dir).unwrap();
        let package = package_dir.join("fe-1.zip");
        make_zip(&package, &[("index.html", "<html>v1</html>")]);
        let md5 = {
            use md5::Digest;
            hex::encode(md5::Md5::digest(fs::read(&package).unwrap()))
        };

        let cmd = UpgradeCommand {
            project: "frontend".to_string(),
            file_name: "fe-1.zip".to_string(),
            version: "1.0.0".to_string(),
            deploy_path: None,
            preserved_paths: Vec::new(),
            file_md5: Some(md5),
            session_id: Some("sess-up".to_string()),
            batch_task_id: Some("batch-up".to_string()),
        };
        let guard = fx.dispatcher.try_begin(OperationStatus::Upgrading).unwrap();
        fx.dispatcher
            .clone()
            .handle_upgrade(guard, cmd, Some("cmd_up".to_string()))
            .await;

        let target = fx.cfg.deploy_root(Project::Frontend);
        assert_eq!(
            fs::read_to_string(target.join("index.html")).unwrap(),
            "<html>v1</html>"
        );
        assert_eq!(
            crate::deploy_paths::current_version(target).as_deref(),
            Some("1.0.0")
        );

        let events = drain_events(&mut fx.outbound_rx).await;
        let reply = find_result(&events, "cmd_up").unwrap();
        assert!(reply.success, "unexpected failure: {}", reply.message);
        assert_eq!(reply.data.as_ref().unwrap()["version"], "1.0.0");
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::BatchStatus(payload) if payload.status == "completed"
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::BatchProgress(_)
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::Status(payload) if payload.status == DeviceStatus::UpgradeSuccess
        )));
    }
}
