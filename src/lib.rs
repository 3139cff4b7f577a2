//! Driver-side telemetry agent for a campus bus fleet.
//!
//! The agent samples the vehicle position, reports it to the fleet backend,
//! keeps a persistent push channel open for server commands and drives the
//! server-side trip lifecycle. All mutable state lives on one task; see
//! [`agent`].

pub mod agent;
pub mod backend;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod geofence;
pub mod notify;
pub mod odometer;
pub mod reporter;
pub mod sampler;
pub mod trip;
pub mod types;

#[cfg(test)]
mod testing;

pub use agent::{AgentDeps, AgentHandle, AgentSnapshot, DriverAgent};
pub use backend::{Backend, HttpBackend};
pub use channel::{ChannelTransport, WsTransport};
pub use config::AgentConfig;
pub use error::{AgentError, BackendError, ChannelError, ConfigError, FixError, SamplerError};
pub use notify::{LogNotifier, LogRenderer, MapRenderer, NotificationLevel, UserNotifier};
pub use sampler::{LocationService, SimulatedLocationService};
pub use types::{PositionSample, SpeedBucket, TripState};
