//! Capabilities the agent calls into for anything user-facing.
//!
//! The agent never renders anything itself: messages go through a
//! [`UserNotifier`] and map updates through a [`MapRenderer`]. The log-backed
//! implementations here are what the `driver_agent` binary runs with.

use crate::types::{BusStatus, PositionSample, SpeedBucket};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Success,
    Info,
    Warning,
    Danger,
}

impl NotificationLevel {
    /// Levels sent by the backend; anything unrecognised is shown as info.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => NotificationLevel::Success,
            "warning" => NotificationLevel::Warning,
            "danger" | "error" => NotificationLevel::Danger,
            _ => NotificationLevel::Info,
        }
    }
}

pub trait UserNotifier: Send + Sync {
    /// Show `message`. Persistent messages are not auto-dismissed.
    fn notify(&self, message: &str, level: NotificationLevel, persistent: bool);
}

pub trait MapRenderer: Send + Sync {
    fn move_marker(&self, latitude: f64, longitude: f64);

    /// Local position/speed readout
    fn show_reading(&self, _sample: &PositionSample, _bucket: SpeedBucket) {}

    fn show_status(&self, _status: &BusStatus) {}
}

/// Notifier that writes every message to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl UserNotifier for LogNotifier {
    fn notify(&self, message: &str, level: NotificationLevel, persistent: bool) {
        let sticky = if persistent { " [persistent]" } else { "" };
        match level {
            NotificationLevel::Danger => log::error!("[NOTIFY]{} {}", sticky, message),
            NotificationLevel::Warning => log::warn!("[NOTIFY]{} {}", sticky, message),
            NotificationLevel::Success | NotificationLevel::Info => {
                log::info!("[NOTIFY]{} {}", sticky, message)
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogRenderer;

impl MapRenderer for LogRenderer {
    fn move_marker(&self, latitude: f64, longitude: f64) {
        log::debug!("[MAP] marker -> ({:.6}, {:.6})", latitude, longitude);
    }

    fn show_reading(&self, sample: &PositionSample, bucket: SpeedBucket) {
        log::info!(
            "[MAP] lat {:.6} lng {:.6} speed {:.0} km/h ({:?})",
            sample.latitude,
            sample.longitude,
            sample.speed_kph.round(),
            bucket
        );
    }

    fn show_status(&self, status: &BusStatus) {
        log::info!("[MAP] bus status: {} ({})", status.label(), status.badge());
    }
}
