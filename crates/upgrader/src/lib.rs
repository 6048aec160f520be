//! # Upgrader
//!
//! The core of a device-side upgrade agent: a long-running process that
//! keeps a persistent connection to a central control plane and, on command,
//! atomically replaces the on-disk artifacts of a named project (`frontend`
//! or `backend`) with a newly downloaded package — while preserving the
//! ability to roll back to a previous on-disk state.
//!
//! ## The three hard parts
//!
//! - **Connection lifecycle & dispatch** — a WebSocket driver with an
//!   exponential-backoff reconnect schedule that never gives up, device
//!   registration, a 30-second heartbeat, and a dispatcher that enforces
//!   at-most-one upgrade/rollback at a time while status queries keep
//!   flowing.
//! - **Resumable acquisition** — range-request downloads into a temp file,
//!   MD5 verification before anything becomes visible, cached-artifact
//!   reuse, and a 24-hour temp sweep.
//! - **Deploy / rollback** — a pre-deployment snapshot with a `-latest`
//!   pointer, selective extraction honoring a preservation allowlist, a
//!   layered directory-clearance chain ending in an OS-native forced
//!   delete, and snapshot restoration when a deploy fails midway.
//!
//! ## Modules
//!
//! - [`config`] — the immutable runtime configuration record
//! - [`types`] — domain records plus the control-plane wire model
//! - [`error`] — domain error kinds
//! - [`device`] — device identity, name resolution, network discovery
//! - [`paths`] — deploy-path validation and accessibility probing
//! - [`backup`] — versioned snapshots and the `-latest` pointer
//! - [`fetch`] — resumable, hash-verified package downloads
//! - [`deploy`] — the staged deploy engine with snapshot recovery
//! - [`rollback`] — snapshot restoration and version reconciliation
//! - [`progress`] — the session-keyed progress bus
//! - [`transport`] — the persistent connection driver
//! - [`dispatcher`] — command routing and operation exclusivity
//! - [`fsutil`] — shared copy/clear primitives
//! - [`deploy_paths`] — `deploy-paths.json` and `version.json` stores

pub mod backup;
pub mod config;
pub mod deploy;
pub mod deploy_paths;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod fetch;
pub mod fsutil;
pub mod paths;
pub mod progress;
pub mod rollback;
pub mod transport;
pub mod types;

pub use config::AgentConfig;
pub use device::DeviceProfile;
pub use dispatcher::Dispatcher;
pub use error::AgentError;
pub use transport::{ConnectionState, Transport, TransportHandle};
pub use types::{OperationStatus, Project};
