use crate::agent::{AgentContext, AgentEvent};
use crate::backend::{ApiResponse, EmergencyReport};
use crate::error::{BackendError, SamplerError};
use crate::notify::NotificationLevel;
use crate::odometer::TripOdometer;
use crate::sampler::PositionSampler;
use crate::types::{LastKnownLocation, PositionSample, TripState};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TripAction {
    Start,
    End,
}

impl TripAction {
    fn failure_message(self) -> &'static str {
        match self {
            TripAction::Start => "Failed to start trip",
            TripAction::End => "Failed to end trip",
        }
    }
}

/// Server-side trip lifecycle, coupled to local tracking.
///
/// ```text
/// Idle   --start (success)--> Active
/// Active --end (success)----> Idle
/// any    --emergency stop---> Idle
/// ```
///
/// Failed start/end requests leave the state alone. An emergency stop bumps
/// the epoch, so start/end replies that were in flight when it happened no
/// longer change anything.
pub struct TripController {
    state: TripState,
    epoch: u64,
    odometer: TripOdometer,
}

impl Default for TripController {
    fn default() -> Self {
        Self::new()
    }
}

impl TripController {
    pub fn new() -> Self {
        TripController {
            state: TripState::Idle,
            epoch: 0,
            odometer: TripOdometer::new(),
        }
    }

    pub fn state(&self) -> TripState {
        self.state
    }

    pub fn distance_km(&self) -> f64 {
        self.odometer.distance_km()
    }

    pub fn record_sample(&mut self, sample: &PositionSample) {
        if self.state == TripState::Active {
            self.odometer.record(sample.latitude, sample.longitude);
        }
    }

    /// Issue the start/end request. The reply is settled on the agent task.
    pub fn request(&self, ctx: &AgentContext, sampler: &PositionSampler, action: TripAction) {
        if action == TripAction::Start && !sampler.is_available() {
            ctx.notifier.notify(
                &SamplerError::CapabilityUnavailable.to_string(),
                NotificationLevel::Danger,
                false,
            );
            return;
        }

        let epoch = self.epoch;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let outcome = match action {
                TripAction::Start => ctx.backend.start_trip(&ctx.bus_id).await,
                TripAction::End => ctx.backend.end_trip(&ctx.bus_id).await,
            };
            ctx.post(AgentEvent::TripSettled {
                action,
                epoch,
                outcome,
            });
        });
    }

    pub(crate) fn settle(
        &mut self,
        ctx: &AgentContext,
        sampler: &mut PositionSampler,
        action: TripAction,
        epoch: u64,
        outcome: Result<ApiResponse, BackendError>,
    ) {
        if epoch != self.epoch {
            log::info!("[trip] ignoring {:?} reply issued before an emergency stop", action);
            return;
        }

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                log::error!("[trip] {:?} request failed: {}", action, e);
                ctx.notifier
                    .notify(action.failure_message(), NotificationLevel::Danger, false);
                return;
            }
        };

        if !response.success {
            let message = response.error_or(action.failure_message());
            log::warn!("[trip] {:?} rejected: {}", action, message);
            ctx.notifier.notify(&message, NotificationLevel::Danger, false);
            return;
        }

        match action {
            TripAction::Start => {
                ctx.notifier
                    .notify("Trip started successfully", NotificationLevel::Success, false);
                match sampler.start(ctx) {
                    Ok(_) => {
                        if self.state == TripState::Idle {
                            self.odometer.reset();
                        }
                        self.state = TripState::Active;
                    }
                    Err(e) => log::error!("[trip] trip started but tracking failed: {}", e),
                }
            }
            TripAction::End => {
                ctx.notifier
                    .notify("Trip ended successfully", NotificationLevel::Success, false);
                sampler.stop(ctx);
                self.state = TripState::Idle;
            }
        }
        log::info!("[trip] state now {:?}", self.state);
    }

    /// Stop tracking and force `Idle`, then tell the backend. The report is
    /// fire-and-forget; the local stop already happened.
    pub fn emergency_stop(
        &mut self,
        ctx: &AgentContext,
        sampler: &mut PositionSampler,
        location: Option<LastKnownLocation>,
    ) -> JoinHandle<()> {
        sampler.stop(ctx);
        self.state = TripState::Idle;
        self.epoch += 1;
        log::error!("[trip] EMERGENCY STOP");
        ctx.notifier
            .notify("EMERGENCY STOP ACTIVATED", NotificationLevel::Danger, true);

        let report = EmergencyReport::emergency_stop(&ctx.bus_id, location);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = ctx.backend.emergency_stop(&report).await {
                log::error!("[trip] emergency report not delivered: {}", e);
            }
        })
    }
}
