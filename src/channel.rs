//! Persistent server-push channel.
//!
//! One session is live at a time. A session task connects, forwards every
//! text frame into the agent queue and reports the closure; the agent task
//! then owns the `Closed -> Connecting` transition. Every closure, clean or
//! not, schedules exactly one reconnection after a fixed delay. A connect
//! that outlives `connect_timeout` counts as a failed connect. There is no
//! backoff and no retry limit, so a fleet that loses the backend together
//! reconnects together.

use crate::agent::{AgentContext, AgentEvent};
use crate::dispatch::CommandPayload;
use crate::error::ChannelError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelHealth {
    Healthy,
    Degraded,
}

/// Text frames of one connected session. The stream ends when the peer
/// closes the connection.
pub type FrameStream = BoxStream<'static, Result<String, ChannelError>>;

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self, endpoint: &Url) -> Result<FrameStream, ChannelError>;
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl ChannelTransport for WsTransport {
    async fn connect(&self, endpoint: &Url) -> Result<FrameStream, ChannelError> {
        let (ws, _) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let frames = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    Some(String::from_utf8(bytes).map_err(|e| ChannelError::Protocol(e.to_string())))
                }
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Protocol(e.to_string()))),
            }
        });
        Ok(frames.boxed())
    }
}

/// Lifecycle notifications from a session task
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Opened,
    Frame(String),
    Closed { reason: String },
}

/// `location_update` payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    /// The backend sends numeric ids, the agent holds them as text
    pub bus_id: serde_json::Value,
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationUpdate {
    pub fn is_for(&self, bus_id: &str) -> bool {
        match &self.bus_id {
            serde_json::Value::String(id) => id == bus_id,
            serde_json::Value::Number(id) => id.to_string() == bus_id,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub message: String,
    #[serde(rename = "type", default)]
    pub level: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InboundEnvelope {
    LocationUpdate(LocationUpdate),
    StatusUpdate(StatusPayload),
    Notification(NotificationPayload),
    Command(CommandPayload),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decode one frame. `Ok(None)` is an envelope type this agent ignores.
pub fn decode_envelope(text: &str) -> Result<Option<InboundEnvelope>, ChannelError> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|e| ChannelError::Protocol(e.to_string()))?;

    let envelope = match raw.kind.as_str() {
        "location_update" => InboundEnvelope::LocationUpdate(payload(raw.data)?),
        "status_update" => InboundEnvelope::StatusUpdate(payload(raw.data)?),
        "notification" => InboundEnvelope::Notification(payload(raw.data)?),
        "command" => InboundEnvelope::Command(payload(raw.data)?),
        _ => return Ok(None),
    };
    Ok(Some(envelope))
}

fn payload<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, ChannelError> {
    serde_json::from_value(data).map_err(|e| ChannelError::Protocol(e.to_string()))
}

pub struct SessionChannel {
    transport: Arc<dyn ChannelTransport>,
    endpoint: Url,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    state: SessionState,
    health: ChannelHealth,
    generation: u64,
    session_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_attempts: u64,
    shutting_down: bool,
}

impl SessionChannel {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        endpoint: Url,
        reconnect_delay: Duration,
        connect_timeout: Duration,
    ) -> Self {
        SessionChannel {
            transport,
            endpoint,
            reconnect_delay,
            connect_timeout,
            state: SessionState::Closed,
            health: ChannelHealth::Degraded,
            generation: 0,
            session_task: None,
            reconnect_timer: None,
            reconnect_attempts: 0,
            shutting_down: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn health(&self) -> ChannelHealth {
        self.health
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    /// Start a new session. Ignored while a session is live or after close.
    pub fn open(&mut self, ctx: &AgentContext) {
        if self.shutting_down {
            return;
        }
        if self.state != SessionState::Closed {
            log::debug!("[channel] session {} still live, not opening another", self.generation);
            return;
        }

        self.generation += 1;
        self.state = SessionState::Connecting;
        log::info!("[channel] connecting to {} (session {})", self.endpoint, self.generation);

        let transport = self.transport.clone();
        let endpoint = self.endpoint.clone();
        let generation = self.generation;
        let connect_timeout = self.connect_timeout;
        let events = ctx.clone();
        self.session_task = Some(tokio::spawn(async move {
            let connected = match tokio::time::timeout(connect_timeout, transport.connect(&endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Connect(format!(
                    "no answer within {} ms",
                    connect_timeout.as_millis()
                ))),
            };
            let reason = match connected {
                Ok(mut frames) => {
                    events.post(AgentEvent::Channel {
                        session: generation,
                        event: ChannelEvent::Opened,
                    });
                    loop {
                        match frames.next().await {
                            Some(Ok(text)) => events.post(AgentEvent::Channel {
                                session: generation,
                                event: ChannelEvent::Frame(text),
                            }),
                            Some(Err(e)) => break e.to_string(),
                            None => break "closed by peer".to_string(),
                        }
                    }
                }
                Err(e) => e.to_string(),
            };
            events.post(AgentEvent::Channel {
                session: generation,
                event: ChannelEvent::Closed { reason },
            });
        }));
    }

    /// Apply a session event. Returns a decoded envelope for routing.
    pub(crate) fn on_event(
        &mut self,
        ctx: &AgentContext,
        session: u64,
        event: ChannelEvent,
    ) -> Option<InboundEnvelope> {
        if session != self.generation || self.state == SessionState::Closed {
            log::debug!("[channel] dropping event from stale session {}", session);
            return None;
        }

        match event {
            ChannelEvent::Opened => {
                self.state = SessionState::Open;
                self.health = ChannelHealth::Healthy;
                log::info!("[channel] connected (session {})", session);
                None
            }
            ChannelEvent::Frame(text) => match decode_envelope(&text) {
                Ok(Some(envelope)) => Some(envelope),
                Ok(None) => {
                    log::debug!("[channel] ignoring envelope: {}", text);
                    None
                }
                Err(e) => {
                    log::warn!("[channel] dropping malformed envelope: {}", e);
                    None
                }
            },
            ChannelEvent::Closed { reason } => {
                self.on_closed(ctx, &reason);
                None
            }
        }
    }

    fn on_closed(&mut self, ctx: &AgentContext, reason: &str) {
        self.state = SessionState::Closed;
        self.health = ChannelHealth::Degraded;
        self.session_task = None;
        log::warn!("[channel] session {} closed: {}", self.generation, reason);

        if self.shutting_down {
            return;
        }
        if self.reconnect_timer.is_some() {
            log::debug!("[channel] reconnection already pending");
            return;
        }

        let delay = self.reconnect_delay;
        let events = ctx.clone();
        log::info!("[channel] reconnecting in {} ms", delay.as_millis());
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            events.post(AgentEvent::ReconnectDue);
        }));
    }

    pub(crate) fn on_reconnect_due(&mut self, ctx: &AgentContext) {
        self.reconnect_timer = None;
        if self.shutting_down {
            return;
        }
        self.reconnect_attempts += 1;
        self.open(ctx);
    }

    /// Close for good: drop the live session and any pending reconnection.
    pub fn close(&mut self) {
        self.shutting_down = true;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
        self.state = SessionState::Closed;
        self.health = ChannelHealth::Degraded;
        log::info!("[channel] closed");
    }
}
