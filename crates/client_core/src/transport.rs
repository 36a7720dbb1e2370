//! Socket session: one live link to the messaging server, reconnecting on drop.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use shared::{domain::ConversationId, protocol::ClientRequest};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{config::ClientSettings, error::TransportError};

/// Receives raw text frames in arrival order.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: &str);
}

/// Both directions of an established link. The link is considered dropped
/// once `inbound` yields `None`.
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, credential: Option<&str>) -> Result<SocketLink>;
}

pub struct WebSocketConnector {
    socket_url: String,
}

impl WebSocketConnector {
    pub fn new(socket_url: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
        }
    }
}

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, credential: Option<&str>) -> Result<SocketLink> {
        let mut url = Url::parse(&self.socket_url)
            .with_context(|| format!("invalid socket url: {}", self.socket_url))?;
        if let Some(token) = credential {
            url.query_pairs_mut().append_pair("token", token);
        }
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = credential {
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.socket_url))?;
        let (mut writer, mut reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = writer.send(Message::Text(frame)).await {
                    warn!("transport: websocket send failed: {err}");
                    break;
                }
            }
            let _ = writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("transport: websocket receive failed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(SocketLink { outbound, inbound })
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// ±30% random spread on every delay.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            initial_backoff: settings.reconnect_initial(),
            max_backoff: settings.reconnect_max(),
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let base = (self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent))
            .min(self.max_backoff.as_millis() as f64);
        let millis = if self.jitter {
            base * (1.0 + rand::thread_rng().gen_range(-0.3..0.3))
        } else {
            base
        };
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

struct SessionState {
    status: LinkStatus,
    credential: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    supervisor: Option<JoinHandle<()>>,
    active_room: Option<ConversationId>,
    epoch: u64,
}

pub struct TransportSession {
    connector: Arc<dyn SocketConnector>,
    sink: Arc<dyn FrameSink>,
    policy: ReconnectPolicy,
    state: Mutex<SessionState>,
}

impl TransportSession {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        sink: Arc<dyn FrameSink>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            sink,
            policy,
            state: Mutex::new(SessionState {
                status: LinkStatus::Disconnected,
                credential: None,
                outbound: None,
                supervisor: None,
                active_room: None,
                epoch: 0,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> LinkStatus {
        self.state().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Connected
    }

    pub fn active_room(&self) -> Option<ConversationId> {
        self.state().active_room.clone()
    }

    /// Room replayed with a join after every (re)connect.
    pub fn set_active_room(&self, room: Option<ConversationId>) {
        self.state().active_room = room;
    }

    /// Establishes the link. No-op while connected or connecting; failures are
    /// logged and handed to the background reconnect loop.
    pub async fn connect(self: &Arc<Self>, credential: Option<&str>) {
        let epoch = {
            let mut state = self.state();
            if state.status != LinkStatus::Disconnected {
                debug!(status = ?state.status, "transport: connect ignored, session already live");
                return;
            }
            state.status = LinkStatus::Connecting;
            state.credential = credential.map(str::to_string);
            state.epoch += 1;
            state.epoch
        };

        let first_inbound = match self.connector.connect(credential).await {
            Ok(link) => {
                if !self.attach(epoch, link.outbound) {
                    return;
                }
                info!("transport: connected");
                Some(link.inbound)
            }
            Err(err) => {
                warn!("transport: connect failed, retrying in background: {err:#}");
                None
            }
        };

        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.supervise(epoch, first_inbound).await });
        let mut state = self.state();
        if state.epoch == epoch {
            state.supervisor = Some(handle);
        } else {
            handle.abort();
        }
    }

    /// Tears the link down. Safe to call on a closed session.
    pub fn disconnect(&self) {
        let supervisor = {
            let mut state = self.state();
            if state.status == LinkStatus::Disconnected {
                return;
            }
            state.epoch += 1;
            state.status = LinkStatus::Disconnected;
            state.outbound = None;
            state.supervisor.take()
        };
        if let Some(handle) = supervisor {
            handle.abort();
        }
        info!("transport: disconnected");
    }

    /// Serializes and queues one frame. Never blocks.
    pub fn emit(&self, request: &ClientRequest) -> Result<(), TransportError> {
        let state = self.state();
        let Some(outbound) = state
            .outbound
            .as_ref()
            .filter(|_| state.status == LinkStatus::Connected)
        else {
            return Err(TransportError::NotConnected);
        };
        let frame = match serde_json::to_string(request) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = request.name(), "transport: failed to encode frame: {err}");
                return Err(TransportError::LinkClosed(request.name()));
            }
        };
        outbound
            .send(frame)
            .map_err(|_| TransportError::LinkClosed(request.name()))
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.state().epoch == epoch
    }

    /// Installs a fresh outbound half and replays the active room join.
    fn attach(&self, epoch: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let room = {
            let mut state = self.state();
            if state.epoch != epoch {
                return false;
            }
            state.status = LinkStatus::Connected;
            state.outbound = Some(outbound);
            state.active_room.clone()
        };
        if let Some(conversation_id) = room {
            debug!(conversation_id = %conversation_id, "transport: replaying room join");
            let _ = self.emit(&ClientRequest::JoinConversation { conversation_id });
        }
        true
    }

    fn mark_dropped(&self, epoch: u64) -> bool {
        let mut state = self.state();
        if state.epoch != epoch {
            return false;
        }
        state.status = LinkStatus::Connecting;
        state.outbound = None;
        true
    }

    async fn supervise(
        self: Arc<Self>,
        epoch: u64,
        mut inbound: Option<mpsc::UnboundedReceiver<String>>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            let mut frames = match inbound.take() {
                Some(frames) => frames,
                None => match self.reconnect_once(epoch, attempt).await {
                    Some(frames) => {
                        attempt = 0;
                        frames
                    }
                    None => {
                        if !self.is_current(epoch) {
                            return;
                        }
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                },
            };

            while let Some(frame) = frames.recv().await {
                self.sink.deliver(&frame);
            }

            if !self.mark_dropped(epoch) {
                return;
            }
            warn!("transport: link dropped, reconnecting");
        }
    }

    async fn reconnect_once(
        &self,
        epoch: u64,
        attempt: u32,
    ) -> Option<mpsc::UnboundedReceiver<String>> {
        let delay = self.policy.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "transport: scheduling reconnect");
        tokio::time::sleep(delay).await;
        if !self.is_current(epoch) {
            return None;
        }

        let credential = self.state().credential.clone();
        match self.connector.connect(credential.as_deref()).await {
            Ok(link) => {
                if self.attach(epoch, link.outbound) {
                    info!(attempt, "transport: reconnected");
                    Some(link.inbound)
                } else {
                    None
                }
            }
            Err(err) => {
                warn!(attempt, "transport: reconnect failed: {err:#}");
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
