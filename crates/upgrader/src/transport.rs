//! The persistent control-plane connection.
//!
//! A single driver task owns the WebSocket for its whole life: it dials,
//! registers, pumps outbound events, decodes inbound frames, and beats the
//! heartbeat. When the connection drops for any reason the driver falls back
//! into the reconnect schedule; there is no terminal state short of process
//! death. Because the schedule lives inside this one task, two reconnect
//! timers can never be armed at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use upgrader_retry::ReconnectSchedule;

use crate::config::AgentConfig;
use crate::device::{self, DeviceProfile};
use crate::types::{
    AgentEvent, AgentInfo, DeviceStatus, HealthInfo, HeartbeatPayload, NetworkInfo,
    NetworkUpdatePayload, RegisterPayload, ServerEvent, StatusPayload, decode_server_event,
};

/// Cap on the offline-status send during shutdown.
const OFFLINE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Overall budget for a network-info discovery pass.
const NETWORK_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle, observable by the dispatcher for status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { registered: bool },
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected { registered: false } => "connected",
            ConnectionState::Connected { registered: true } => "registered",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// What the rest of the agent holds on to: the outbound event sender and a
/// view of the connection state.
#[derive(Clone)]
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<AgentEvent>,
    pub state: watch::Receiver<ConnectionState>,
}

pub struct Transport {
    cfg: Arc<AgentConfig>,
    device: DeviceProfile,
    outbound_tx: mpsc::UnboundedSender<AgentEvent>,
    outbound_rx: mpsc::UnboundedReceiver<AgentEvent>,
    inbound_tx: mpsc::UnboundedSender<ServerEvent>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
    started: Instant,
    /// Singleton slot for the network-info discovery task: a trigger that
    /// finds one in flight is coalesced into it.
    network_probe: Arc<Semaphore>,
    last_heartbeat: Option<Instant>,
}

impl Transport {
    pub fn new(
        cfg: Arc<AgentConfig>,
        device: DeviceProfile,
        inbound_tx: mpsc::UnboundedSender<ServerEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, TransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let handle = TransportHandle {
            outbound: outbound_tx.clone(),
            state: state_rx,
        };
        let transport = Self {
            cfg,
            device,
            outbound_tx,
            outbound_rx,
            inbound_tx,
            state_tx,
            shutdown,
            started: Instant::now(),
            network_probe: Arc::new(Semaphore::new(1)),
            last_heartbeat: None,
        };
        (transport, handle)
    }

    /// Drive the connection until shutdown. Never returns earlier on its own.
    pub async fn run(mut self) {
        let url = match self.cfg.websocket_url() {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "cannot derive websocket url, transport stopping");
                return;
            }
        };
        let mut schedule = ReconnectSchedule::new(self.cfg.reconnect);

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.state_tx.send_replace(ConnectionState::Connecting);
            debug!(url, "dialing control plane");

            match tokio::time::timeout(self.cfg.server.timeout, connect_async(url.as_str())).await
            {
                Ok(Ok((ws, _response))) => {
                    info!(url, "control plane connected");
                    schedule.reset();
                    self.state_tx
                        .send_replace(ConnectionState::Connected { registered: false });
                    self.run_connection(ws).await;
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!(url, error = %e, "connect failed");
                }
                Err(_) => {
                    warn!(url, timeout = ?self.cfg.server.timeout, "connect timed out");
                }
            }

            self.state_tx.send_replace(ConnectionState::Reconnecting);
            let delay = schedule.next_delay();
            info!(
                attempt = schedule.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        debug!("transport stopped");
    }

    /// Pump one established connection until it drops or shutdown arrives.
    async fn run_connection(&mut self, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();

        // Registration goes out immediately on every (re)connect.
        let register = AgentEvent::Register(self.register_payload());
        if let Err(e) = sink.send(Message::Text(register.encode())).await {
            warn!(error = %e, "registration send failed");
            return;
        }

        let period = self.cfg.heartbeat_interval;
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.outbound_rx.recv() => {
                    let Some(event) = event else {
                        debug!("outbound channel closed, dropping connection");
                        return;
                    };
                    if let Err(e) = sink.send(Message::Text(event.encode())).await {
                        warn!(error = %e, "outbound send failed, reconnecting");
                        return;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("server closed the connection");
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "transport receive error");
                            return;
                        }
                        None => {
                            info!("connection ended");
                            return;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = AgentEvent::Heartbeat(HeartbeatPayload {
                        device_id: self.device.device_id.clone(),
                        timestamp: Utc::now().timestamp_millis(),
                        health: HealthInfo {
                            uptime_seconds: self.started.elapsed().as_secs(),
                        },
                    });
                    if let Err(e) = sink.send(Message::Text(beat.encode())).await {
                        warn!(error = %e, "heartbeat send failed, reconnecting");
                        return;
                    }
                    self.last_heartbeat = Some(Instant::now());
                }
                _ = self.shutdown.changed() => {
                    let offline = AgentEvent::Status(StatusPayload {
                        device_id: self.device.device_id.clone(),
                        status: DeviceStatus::Offline,
                        timestamp: Utc::now(),
                    });
                    let _ = tokio::time::timeout(
                        OFFLINE_SEND_TIMEOUT,
                        sink.send(Message::Text(offline.encode())),
                    )
                    .await;
                    let _ = tokio::time::timeout(OFFLINE_SEND_TIMEOUT, sink.close()).await;
                    info!("offline status sent, transport closing");
                    return;
                }
            }
        }
    }

    /// Decode one inbound frame. Registration acks, heartbeat acks, and
    /// network-refresh requests are handled here; everything else goes to
    /// the dispatcher.
    fn handle_frame(&mut self, text: &str) {
        let Some((event, data)) = parse_frame(text) else {
            debug!(frame = text, "unparsable frame ignored");
            return;
        };
        match decode_server_event(&event, data) {
            Some(ServerEvent::Registered) => {
                info!(device_id = %self.device.device_id, "device registered");
                self.state_tx
                    .send_replace(ConnectionState::Connected { registered: true });
                // Network discovery runs asynchronously so registration is
                // never blocked on the WiFi probe.
                self.spawn_network_update();
                // The dispatcher follows up with a status push and a system
                // update.
                self.inbound_tx.send(ServerEvent::Registered).ok();
            }
            Some(ServerEvent::HeartbeatAck { timestamp }) => {
                let latency = self.last_heartbeat.map(|sent| sent.elapsed());
                debug!(?latency, server_timestamp = ?timestamp, "heartbeat acked");
            }
            Some(ServerEvent::RefreshNetwork) => {
                self.spawn_network_update();
            }
            Some(other) => {
                if self.inbound_tx.send(other).is_err() {
                    warn!("dispatcher gone, dropping inbound event");
                }
            }
            None => debug!(event, "unknown event ignored"),
        }
    }

    fn register_payload(&self) -> RegisterPayload {
        RegisterPayload {
            device_id: self.device.device_id.clone(),
            device_name: self.device.device_name.clone(),
            system: self.device.system.clone(),
            agent: AgentInfo {
                agent_version: self.device.agent_version.clone(),
            },
            // WiFi discovery is slow; the async network update fills it in
            // right after registration.
            network: NetworkInfo {
                wifi_name: None,
                local_ip: None,
                mac_addresses: device::mac_addresses(),
            },
            timestamp: Utc::now(),
        }
    }

    /// Kick off a network-info discovery and push, unless one is already in
    /// flight.
    fn spawn_network_update(&self) {
        let Ok(permit) = self.network_probe.clone().try_acquire_owned() else {
            debug!("network update already in flight, coalesced");
            return;
        };
        let outbound = self.outbound_tx.clone();
        let device_id = self.device.device_id.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(NETWORK_UPDATE_TIMEOUT, device::collect_network_info())
                .await
            {
                Ok(network) => {
                    let update = AgentEvent::UpdateNetwork(NetworkUpdatePayload {
                        device_id,
                        network,
                        timestamp: Utc::now(),
                    });
                    outbound.send(update).ok();
                }
                Err(_) => warn!("network info update timed out"),
            }
        });
    }
}

/// Split a wire frame into `(event, data)`.
fn parse_frame(text: &str) -> Option<(String, Value)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let event = value.get("event")?.as_str()?.to_string();
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    Some((event, data))
}
