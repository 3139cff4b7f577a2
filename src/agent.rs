//! The driver agent: one task that owns every piece of mutable state.
//!
//! Host callbacks (fixes, channel frames, HTTP completions, timers) and
//! caller requests all arrive as [`AgentEvent`]s on a single queue and are
//! handled one at a time, so no handler ever races another. Anything that
//! waits runs in its own spawned task and posts its result back.

use crate::backend::{ApiResponse, Backend};
use crate::channel::{ChannelEvent, ChannelHealth, ChannelTransport, InboundEnvelope, SessionChannel, SessionState};
use crate::config::AgentConfig;
use crate::dispatch::{CommandDispatcher, TripActions};
use crate::error::{AgentError, BackendError, ConfigError, FixError, SamplerError};
use crate::geofence::GeofenceChecker;
use crate::notify::{MapRenderer, NotificationLevel, UserNotifier};
use crate::reporter::{self, LocationReporter};
use crate::sampler::{self, LocationService, PositionSampler};
use crate::trip::{TripAction, TripController};
use crate::types::{BusStatus, PositionSample, RawFix, TripState};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Shared handles every component works through
#[derive(Clone)]
pub struct AgentContext {
    pub bus_id: String,
    pub backend: Arc<dyn Backend>,
    pub notifier: Arc<dyn UserNotifier>,
    pub renderer: Arc<dyn MapRenderer>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentContext {
    pub(crate) fn post(&self, event: AgentEvent) {
        if self.events.send(event).is_err() {
            log::debug!("[agent] event dropped, agent has stopped");
        }
    }
}

pub(crate) enum AgentEvent {
    Request(AgentRequest),
    Fix {
        watch: u64,
        outcome: Result<RawFix, FixError>,
    },
    OnDemandFix {
        outcome: Result<RawFix, FixError>,
        reply: oneshot::Sender<Result<PositionSample, SamplerError>>,
    },
    Channel {
        session: u64,
        event: ChannelEvent,
    },
    WatchEnded {
        watch: u64,
        delivered: u64,
    },
    ReconnectDue,
    TripSettled {
        action: TripAction,
        epoch: u64,
        outcome: Result<ApiResponse, BackendError>,
    },
}

pub(crate) enum AgentRequest {
    StartTracking,
    StopTracking,
    SampleOnce(oneshot::Sender<Result<PositionSample, SamplerError>>),
    StartTrip,
    EndTrip,
    EmergencyStop,
    ReportIssue(String),
    Snapshot(oneshot::Sender<AgentSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

enum Flow {
    Continue,
    Stop(oneshot::Sender<()>),
}

/// Capabilities injected into the agent
pub struct AgentDeps {
    pub backend: Arc<dyn Backend>,
    pub location: Arc<dyn LocationService>,
    pub transport: Arc<dyn ChannelTransport>,
    pub notifier: Arc<dyn UserNotifier>,
    pub renderer: Arc<dyn MapRenderer>,
}

/// Point-in-time view of the agent state
#[derive(Clone, Debug, Serialize)]
pub struct AgentSnapshot {
    pub bus_id: String,
    pub trip_state: TripState,
    pub tracking: bool,
    pub session_state: SessionState,
    pub channel_health: ChannelHealth,
    pub reconnect_attempts: u64,
    pub last_location: Option<PositionSample>,
    pub last_status: Option<BusStatus>,
    pub trip_distance_km: f64,
}

pub struct DriverAgent {
    ctx: AgentContext,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    sampler: PositionSampler,
    reporter: LocationReporter,
    geofence: GeofenceChecker,
    channel: SessionChannel,
    trips: TripController,
    last_location: Option<PositionSample>,
    last_status: Option<BusStatus>,
}

impl DriverAgent {
    pub fn new(config: &AgentConfig, deps: AgentDeps) -> Result<(Self, AgentHandle), ConfigError> {
        config.validate()?;
        let endpoint = config.channel_endpoint()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let ctx = AgentContext {
            bus_id: config.bus_id.clone(),
            backend: deps.backend,
            notifier: deps.notifier,
            renderer: deps.renderer,
            events: tx.clone(),
        };

        let agent = DriverAgent {
            ctx,
            events: rx,
            sampler: PositionSampler::new(
                deps.location,
                config.watch_timeout(),
                config.sample_once_timeout(),
            ),
            reporter: LocationReporter::new(config.sequence_reports),
            geofence: GeofenceChecker::new(),
            channel: SessionChannel::new(
                deps.transport,
                endpoint,
                config.reconnect_delay(),
                config.connect_timeout(),
            ),
            trips: TripController::new(),
            last_location: None,
            last_status: None,
        };
        Ok((agent, AgentHandle { events: tx }))
    }

    /// Build the agent and run it on the current tokio runtime.
    pub fn spawn(config: &AgentConfig, deps: AgentDeps) -> Result<(AgentHandle, JoinHandle<()>), ConfigError> {
        let (agent, handle) = Self::new(config, deps)?;
        let task = tokio::spawn(agent.run());
        Ok((handle, task))
    }

    pub async fn run(mut self) {
        log::info!("[agent] bus {} starting", self.ctx.bus_id);
        self.channel.open(&self.ctx);

        while let Some(event) = self.events.recv().await {
            if let Flow::Stop(reply) = self.handle(event) {
                self.destroy();
                let _ = reply.send(());
                break;
            }
        }
        log::info!("[agent] bus {} stopped", self.ctx.bus_id);
    }

    fn handle(&mut self, event: AgentEvent) -> Flow {
        match event {
            AgentEvent::Request(request) => return self.handle_request(request),
            AgentEvent::Fix { watch, outcome } => {
                if !self.sampler.is_current(watch) {
                    log::debug!("[agent] dropping fix from cancelled watch {}", watch);
                } else {
                    match outcome {
                        Ok(fix) => {
                            self.process_fix(&fix);
                        }
                        Err(e) => sampler::report_fix_error(&self.ctx, e),
                    }
                }
            }
            AgentEvent::OnDemandFix { outcome, reply } => {
                let result = match outcome {
                    Ok(fix) => Ok(self.process_fix(&fix)),
                    Err(e) => {
                        sampler::report_fix_error(&self.ctx, e);
                        Err(SamplerError::Fix(e))
                    }
                };
                let _ = reply.send(result);
            }
            AgentEvent::Channel { session, event } => {
                if let Some(envelope) = self.channel.on_event(&self.ctx, session, event) {
                    self.route(envelope);
                }
            }
            AgentEvent::WatchEnded { watch, delivered } => self.on_watch_ended(watch, delivered),
            AgentEvent::ReconnectDue => self.channel.on_reconnect_due(&self.ctx),
            AgentEvent::TripSettled {
                action,
                epoch,
                outcome,
            } => self
                .trips
                .settle(&self.ctx, &mut self.sampler, action, epoch, outcome),
        }
        Flow::Continue
    }

    fn handle_request(&mut self, request: AgentRequest) -> Flow {
        match request {
            AgentRequest::StartTracking => {
                if let Err(e) = self.sampler.start(&self.ctx) {
                    log::warn!("[agent] cannot start tracking: {}", e);
                }
            }
            AgentRequest::StopTracking => {
                if self.trips.state() == TripState::Active {
                    self.ctx.notifier.notify(
                        "End the trip before stopping tracking",
                        NotificationLevel::Warning,
                        false,
                    );
                } else if !self.sampler.stop(&self.ctx) {
                    log::debug!("[agent] stop requested while not tracking");
                }
            }
            AgentRequest::SampleOnce(reply) => self.sampler.sample_once(&self.ctx, reply),
            AgentRequest::StartTrip => self.start_trip(),
            AgentRequest::EndTrip => self.end_trip(),
            AgentRequest::EmergencyStop => self.emergency_stop(),
            AgentRequest::ReportIssue(issue) => {
                let location = self.last_location.as_ref().map(|s| s.last_known());
                reporter::report_issue(&self.ctx, &issue, location);
            }
            AgentRequest::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            AgentRequest::Shutdown(reply) => return Flow::Stop(reply),
        }
        Flow::Continue
    }

    /// A trip keeps tracking: a watch that was delivering is re-requested.
    /// A watch that ended without a single fix is not, the service is gone.
    fn on_watch_ended(&mut self, watch: u64, delivered: u64) {
        if !self.sampler.on_watch_ended(watch) {
            return;
        }
        if self.trips.state() == TripState::Active && delivered > 0 {
            log::warn!("[agent] location watch ended mid-trip, requesting a new one");
            if let Err(e) = self.sampler.start(&self.ctx) {
                log::error!("[agent] cannot resume tracking: {}", e);
            }
            return;
        }
        self.ctx
            .notifier
            .notify("Location updates stopped", NotificationLevel::Warning, false);
    }

    /// normalize -> report -> geofence -> render
    fn process_fix(&mut self, fix: &RawFix) -> PositionSample {
        let sample = PositionSample::from_fix(fix, Utc::now());

        self.reporter.report(&self.ctx, &sample);
        self.geofence.check(&self.ctx, &sample);
        self.ctx
            .renderer
            .show_reading(&sample, sample.speed_bucket());
        self.ctx
            .renderer
            .move_marker(sample.latitude, sample.longitude);

        self.trips.record_sample(&sample);
        self.last_location = Some(sample.clone());
        sample
    }

    fn route(&mut self, envelope: InboundEnvelope) {
        match envelope {
            InboundEnvelope::LocationUpdate(update) => {
                if update.is_for(&self.ctx.bus_id) {
                    self.ctx
                        .renderer
                        .move_marker(update.latitude, update.longitude);
                }
            }
            InboundEnvelope::StatusUpdate(payload) => {
                let status = BusStatus::parse(&payload.status);
                self.ctx.renderer.show_status(&status);
                self.last_status = Some(status);
            }
            InboundEnvelope::Notification(payload) => {
                let level = payload
                    .level
                    .as_deref()
                    .map(NotificationLevel::parse)
                    .unwrap_or(NotificationLevel::Info);
                self.ctx.notifier.notify(&payload.message, level, false);
            }
            InboundEnvelope::Command(payload) => {
                CommandDispatcher.dispatch(&payload, self);
            }
        }
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            bus_id: self.ctx.bus_id.clone(),
            trip_state: self.trips.state(),
            tracking: self.sampler.is_tracking(),
            session_state: self.channel.state(),
            channel_health: self.channel.health(),
            reconnect_attempts: self.channel.reconnect_attempts(),
            last_location: self.last_location.clone(),
            last_status: self.last_status.clone(),
            trip_distance_km: self.trips.distance_km(),
        }
    }

    fn destroy(&mut self) {
        self.sampler.stop(&self.ctx);
        self.channel.close();
    }
}

impl TripActions for DriverAgent {
    fn start_trip(&mut self) {
        self.trips
            .request(&self.ctx, &self.sampler, TripAction::Start);
    }

    fn end_trip(&mut self) {
        self.trips.request(&self.ctx, &self.sampler, TripAction::End);
    }

    fn emergency_stop(&mut self) {
        let location = self.last_location.as_ref().map(|s| s.last_known());
        self.trips
            .emergency_stop(&self.ctx, &mut self.sampler, location);
    }
}

/// Cloneable handle for driving a running [`DriverAgent`]
#[derive(Clone)]
pub struct AgentHandle {
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentHandle {
    fn send(&self, request: AgentRequest) -> Result<(), AgentError> {
        self.events
            .send(AgentEvent::Request(request))
            .map_err(|_| AgentError::Stopped)
    }

    pub fn start_tracking(&self) -> Result<(), AgentError> {
        self.send(AgentRequest::StartTracking)
    }

    pub fn stop_tracking(&self) -> Result<(), AgentError> {
        self.send(AgentRequest::StopTracking)
    }

    pub fn start_trip(&self) -> Result<(), AgentError> {
        self.send(AgentRequest::StartTrip)
    }

    pub fn end_trip(&self) -> Result<(), AgentError> {
        self.send(AgentRequest::EndTrip)
    }

    pub fn emergency_stop(&self) -> Result<(), AgentError> {
        self.send(AgentRequest::EmergencyStop)
    }

    pub fn report_issue(&self, issue: &str) -> Result<(), AgentError> {
        self.send(AgentRequest::ReportIssue(issue.to_string()))
    }

    /// One fix on demand; runs the same pipeline as continuous tracking.
    pub async fn sample_once(&self) -> Result<PositionSample, SamplerError> {
        let (tx, rx) = oneshot::channel();
        self.send(AgentRequest::SampleOnce(tx))
            .map_err(|_| SamplerError::AgentStopped)?;
        rx.await.unwrap_or(Err(SamplerError::AgentStopped))
    }

    pub async fn snapshot(&self) -> Result<AgentSnapshot, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.send(AgentRequest::Snapshot(tx))?;
        rx.await.map_err(|_| AgentError::Stopped)
    }

    /// Stop tracking, close the channel, cancel pending reconnection and end
    /// the agent task.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let (tx, rx) = oneshot::channel();
        self.send(AgentRequest::Shutdown(tx))?;
        rx.await.map_err(|_| AgentError::Stopped)
    }
}

#[cfg(test)]
impl AgentContext {
    pub(crate) fn for_test() -> (
        Self,
        mpsc::UnboundedReceiver<AgentEvent>,
        Arc<crate::testing::RecordingNotifier>,
    ) {
        Self::for_test_with_backend(Arc::new(crate::testing::MockBackend::new()))
    }

    pub(crate) fn for_test_with_backend(
        backend: Arc<crate::testing::MockBackend>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<AgentEvent>,
        Arc<crate::testing::RecordingNotifier>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(crate::testing::RecordingNotifier::default());
        let ctx = AgentContext {
            bus_id: "test-bus".to_string(),
            backend,
            notifier: notifier.clone(),
            renderer: Arc::new(crate::testing::RecordingRenderer::default()),
            events: tx,
        };
        (ctx, rx, notifier)
    }
}
