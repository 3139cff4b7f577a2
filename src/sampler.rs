use crate::agent::{AgentContext, AgentEvent};
use crate::error::{FixError, SamplerError};
use crate::notify::NotificationLevel;
use crate::types::{PositionSample, RawFix};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Options passed to the host location service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    pub max_cache_age: Duration,
}

impl WatchOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        WatchOptions {
            high_accuracy: true,
            timeout,
            max_cache_age: Duration::ZERO,
        }
    }
}

/// Host platform location capability.
#[async_trait]
pub trait LocationService: Send + Sync {
    fn is_available(&self) -> bool;

    /// Start a continuous watch. Fixes keep arriving until the receiver is
    /// dropped; a failed fix does not end the watch.
    fn watch_position(&self, options: WatchOptions) -> mpsc::Receiver<Result<RawFix, FixError>>;

    async fn current_position(&self, options: WatchOptions) -> Result<RawFix, FixError>;
}

struct ActiveWatch {
    id: u64,
    task: JoinHandle<()>,
}

/// Owns the (single) continuous watch on the host location service.
pub struct PositionSampler {
    service: Arc<dyn LocationService>,
    watch_timeout: Duration,
    once_timeout: Duration,
    watch: Option<ActiveWatch>,
    next_watch_id: u64,
}

impl PositionSampler {
    pub fn new(service: Arc<dyn LocationService>, watch_timeout: Duration, once_timeout: Duration) -> Self {
        PositionSampler {
            service,
            watch_timeout,
            once_timeout,
            watch: None,
            next_watch_id: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.service.is_available()
    }

    pub fn is_tracking(&self) -> bool {
        self.watch.is_some()
    }

    /// Whether fixes tagged with `watch` belong to the live watch
    pub fn is_current(&self, watch: u64) -> bool {
        self.watch.as_ref().map(|w| w.id == watch).unwrap_or(false)
    }

    /// Begin continuous tracking. Returns `Ok(false)` if already tracking.
    pub fn start(&mut self, ctx: &AgentContext) -> Result<bool, SamplerError> {
        if !self.service.is_available() {
            let err = SamplerError::CapabilityUnavailable;
            ctx.notifier.notify(&err.to_string(), NotificationLevel::Danger, false);
            return Err(err);
        }
        if self.watch.is_some() {
            log::debug!("[sampler] already tracking, ignoring start");
            return Ok(false);
        }

        self.next_watch_id += 1;
        let id = self.next_watch_id;
        let mut fixes = self
            .service
            .watch_position(WatchOptions::with_timeout(self.watch_timeout));
        let events = ctx.clone();
        let task = tokio::spawn(async move {
            let mut delivered = 0u64;
            while let Some(outcome) = fixes.recv().await {
                delivered += 1;
                events.post(AgentEvent::Fix { watch: id, outcome });
            }
            events.post(AgentEvent::WatchEnded { watch: id, delivered });
        });

        self.watch = Some(ActiveWatch { id, task });
        log::info!("[sampler] watch {} started", id);
        ctx.notifier
            .notify("Tracking started", NotificationLevel::Success, false);
        Ok(true)
    }

    /// Cancel the watch. Returns false (and does nothing) when idle.
    pub fn stop(&mut self, ctx: &AgentContext) -> bool {
        match self.watch.take() {
            Some(watch) => {
                watch.task.abort();
                log::info!("[sampler] watch {} stopped", watch.id);
                ctx.notifier
                    .notify("Tracking stopped", NotificationLevel::Warning, false);
                true
            }
            None => false,
        }
    }

    /// The host ended watch `watch` on its own. Returns true if that was the
    /// live watch, which is now cleared.
    pub(crate) fn on_watch_ended(&mut self, watch: u64) -> bool {
        if !self.is_current(watch) {
            return false;
        }
        self.watch = None;
        log::warn!("[sampler] watch {} ended by the location service", watch);
        true
    }

    /// Request one fix. The outcome comes back through the agent queue so
    /// the pipeline runs on the agent task.
    pub fn sample_once(
        &self,
        ctx: &AgentContext,
        reply: oneshot::Sender<Result<PositionSample, SamplerError>>,
    ) {
        if !self.service.is_available() {
            let err = SamplerError::CapabilityUnavailable;
            ctx.notifier.notify(&err.to_string(), NotificationLevel::Danger, false);
            let _ = reply.send(Err(err));
            return;
        }

        let service = self.service.clone();
        let limit = self.once_timeout;
        let events = ctx.clone();
        tokio::spawn(async move {
            let request = service.current_position(WatchOptions::with_timeout(limit));
            let outcome = match tokio::time::timeout(limit, request).await {
                Ok(result) => result,
                Err(_) => Err(FixError::Timeout),
            };
            events.post(AgentEvent::OnDemandFix { outcome, reply });
        });
    }
}

/// Surface a failed fix. The watch keeps running.
pub fn report_fix_error(ctx: &AgentContext, err: FixError) {
    log::warn!("[sampler] fix failed: {:?}", err);
    ctx.notifier.notify(&err.to_string(), NotificationLevel::Danger, false);
}

/// Location service that drives a vehicle along a straight line, for running
/// the agent without a real receiver.
pub struct SimulatedLocationService {
    start_latitude: f64,
    start_longitude: f64,
    period: Duration,
    counter: Arc<AtomicU64>,
}

impl SimulatedLocationService {
    pub fn new(start_latitude: f64, start_longitude: f64, period: Duration) -> Self {
        SimulatedLocationService {
            start_latitude,
            start_longitude,
            period,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_fix(start: (f64, f64), counter: &AtomicU64) -> RawFix {
        let seq = counter.fetch_add(1, Ordering::Relaxed) as f64;
        RawFix {
            latitude: start.0 + seq * 0.00005,
            longitude: start.1 + seq * 0.00005,
            speed_mps: Some(12.0 + (seq * 0.5).sin() * 8.0),
            accuracy_meters: 5.0 + (seq * 0.1).sin() * 2.0,
        }
    }
}

#[async_trait]
impl LocationService for SimulatedLocationService {
    fn is_available(&self) -> bool {
        true
    }

    fn watch_position(&self, _options: WatchOptions) -> mpsc::Receiver<Result<RawFix, FixError>> {
        let (tx, rx) = mpsc::channel(16);
        let start = (self.start_latitude, self.start_longitude);
        let counter = self.counter.clone();
        let period = self.period;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let fix = Self::next_fix(start, &counter);
                match tx.try_send(Ok(fix)) {
                    Ok(_) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Receiver is behind, drop this fix
                    }
                }
            }
        });
        rx
    }

    async fn current_position(&self, _options: WatchOptions) -> Result<RawFix, FixError> {
        Ok(Self::next_fix(
            (self.start_latitude, self.start_longitude),
            &self.counter,
        ))
    }
}
