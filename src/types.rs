use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Meters per second to kilometers per hour
pub const MPS_TO_KPH: f64 = 3.6;

/// One reading delivered by the host location service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed in m/s, `None` when the host cannot tell
    pub speed_mps: Option<f64>,
    pub accuracy_meters: f64,
}

/// A normalized position sample
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kph: f64,
    pub accuracy_meters: f64,
    /// ISO-8601 capture time (UTC, millisecond precision)
    pub timestamp: String,
}

impl PositionSample {
    /// Normalize a raw fix, stamping it with `captured_at`.
    ///
    /// Unknown, negative or non-finite speeds become 0.
    pub fn from_fix(fix: &RawFix, captured_at: DateTime<Utc>) -> Self {
        let speed_kph = match fix.speed_mps {
            Some(mps) if mps.is_finite() && mps > 0.0 => mps * MPS_TO_KPH,
            _ => 0.0,
        };

        PositionSample {
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed_kph,
            accuracy_meters: fix.accuracy_meters,
            timestamp: iso_timestamp(captured_at),
        }
    }

    pub fn speed_bucket(&self) -> SpeedBucket {
        SpeedBucket::classify(self.speed_kph)
    }

    pub fn last_known(&self) -> LastKnownLocation {
        LastKnownLocation {
            latitude: self.latitude,
            longitude: self.longitude,
            timestamp: self.timestamp.clone(),
        }
    }
}

/// Cosmetic speed classification for the local readout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedBucket {
    Normal,
    Warning,
    Danger,
}

impl SpeedBucket {
    pub fn classify(speed_kph: f64) -> Self {
        if speed_kph > 80.0 {
            SpeedBucket::Danger
        } else if speed_kph > 60.0 {
            SpeedBucket::Warning
        } else {
            SpeedBucket::Normal
        }
    }
}

/// Location attached to issue and emergency reports
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LastKnownLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripState {
    #[default]
    Idle,
    Active,
}

/// Vehicle status pushed by the backend over the channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusStatus {
    Active,
    Inactive,
    Maintenance,
    Emergency,
    /// Any status string the agent does not style
    Other(String),
}

impl BusStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => BusStatus::Active,
            "inactive" => BusStatus::Inactive,
            "maintenance" => BusStatus::Maintenance,
            "emergency" => BusStatus::Emergency,
            other => BusStatus::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            BusStatus::Active => "active",
            BusStatus::Inactive => "inactive",
            BusStatus::Maintenance => "maintenance",
            BusStatus::Emergency => "emergency",
            BusStatus::Other(raw) => raw,
        }
    }

    /// Badge style used by the status display
    pub fn badge(&self) -> &'static str {
        match self {
            BusStatus::Active => "success",
            BusStatus::Inactive => "secondary",
            BusStatus::Maintenance => "warning",
            BusStatus::Emergency => "danger",
            BusStatus::Other(_) => "secondary",
        }
    }
}

pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
