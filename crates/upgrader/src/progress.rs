//! Session-keyed progress bus.
//!
//! Operation handlers register a sink before starting and remove it on every
//! exit path; the transport side of the sink forwards events upstream. The
//! bus is in-memory only, single-producer single-consumer per session, and
//! emitting to an unregistered session is a no-op.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::types::{ProgressStatus, ProgressStep, ProgressUpdate};

pub type ProgressSink = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

#[derive(Default)]
pub struct ProgressBus {
    device_id: String,
    sessions: Mutex<HashMap<String, ProgressSink>>,
}

impl ProgressBus {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, session_id: impl Into<String>, sink: ProgressSink) {
        self.sessions
            .lock()
            .expect("progress session map poisoned")
            .insert(session_id.into(), sink);
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions
            .lock()
            .expect("progress session map poisoned")
            .remove(session_id);
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .expect("progress session map poisoned")
            .len()
    }

    /// Emit a progress event for a session.
    ///
    /// Progress is clamped to `[0, 100]`. Status derives from the error
    /// (error → `error`, terminal step → `completed`, otherwise `running`)
    /// unless the metadata carries an explicit `status` override. The sink
    /// is invoked synchronously.
    pub fn emit(
        &self,
        session_id: &str,
        step: ProgressStep,
        progress: i64,
        message: impl Into<String>,
        error: Option<String>,
        metadata: Map<String, Value>,
    ) {
        let sessions = self.sessions.lock().expect("progress session map poisoned");
        let Some(sink) = sessions.get(session_id) else {
            return;
        };

        let status = metadata
            .get("status")
            .and_then(Value::as_str)
            .and_then(parse_status)
            .unwrap_or(if error.is_some() {
                ProgressStatus::Error
            } else if step == ProgressStep::Completed {
                ProgressStatus::Completed
            } else {
                ProgressStatus::Running
            });

        sink(ProgressUpdate {
            session_id: session_id.to_string(),
            device_id: self.device_id.clone(),
            step,
            progress: progress.clamp(0, 100) as u8,
            message: message.into(),
            status,
            error,
            timestamp: Utc::now(),
            metadata,
        });
    }
}

/// Operation-scoped progress handle: carries the session id and stamps every
/// event with the operation type, so the engines never touch the bus
/// directly. With no session id every emission is a no-op.
pub struct OperationProgress<'a> {
    bus: &'a ProgressBus,
    session_id: Option<String>,
    operation: &'static str,
}

impl<'a> OperationProgress<'a> {
    pub fn new(bus: &'a ProgressBus, session_id: Option<String>, operation: &'static str) -> Self {
        Self {
            bus,
            session_id,
            operation,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn base_metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert(
            "operationType".to_string(),
            Value::String(self.operation.to_string()),
        );
        metadata
    }

    pub fn emit(&self, step: ProgressStep, progress: i64, message: impl Into<String>) {
        if let Some(session_id) = &self.session_id {
            self.bus
                .emit(session_id, step, progress, message, None, self.base_metadata());
        }
    }

    /// The single terminal success event for the session.
    pub fn complete(&self, message: impl Into<String>) {
        if let Some(session_id) = &self.session_id {
            self.bus.emit(
                session_id,
                ProgressStep::Completed,
                100,
                message,
                None,
                self.base_metadata(),
            );
        }
    }

    /// The single terminal failure event for the session.
    pub fn fail(&self, message: impl Into<String>, error: impl Into<String>) {
        if let Some(session_id) = &self.session_id {
            self.bus.emit(
                session_id,
                ProgressStep::Failed,
                100,
                message,
                Some(error.into()),
                self.base_metadata(),
            );
        }
    }
}

fn parse_status(s: &str) -> Option<ProgressStatus> {
    match s {
        "running" => Some(ProgressStatus::Running),
        "completed" => Some(ProgressStatus::Completed),
        "error" => Some(ProgressStatus::Error),
        _ => None,
    }
}
