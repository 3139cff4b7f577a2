//! In-memory doubles for the agent's capabilities.

use crate::backend::{ApiResponse, Backend, EmergencyReport, GeofenceResponse, IssueReport, LocationReport};
use crate::channel::{ChannelTransport, FrameStream};
use crate::error::{BackendError, ChannelError, FixError};
use crate::notify::{MapRenderer, NotificationLevel, UserNotifier};
use crate::sampler::{LocationService, WatchOptions};
use crate::types::{BusStatus, PositionSample, RawFix, SpeedBucket};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq)]
pub struct Notice {
    pub message: String,
    pub level: NotificationLevel,
    pub persistent: bool,
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.message.contains(needle))
            .count()
    }
}

impl UserNotifier for RecordingNotifier {
    fn notify(&self, message: &str, level: NotificationLevel, persistent: bool) {
        self.notices.lock().unwrap().push(Notice {
            message: message.to_string(),
            level,
            persistent,
        });
    }
}

#[derive(Default)]
pub struct RecordingRenderer {
    markers: Mutex<Vec<(f64, f64)>>,
    buckets: Mutex<Vec<SpeedBucket>>,
    statuses: Mutex<Vec<BusStatus>>,
}

impl RecordingRenderer {
    pub fn markers(&self) -> Vec<(f64, f64)> {
        self.markers.lock().unwrap().clone()
    }

    pub fn buckets(&self) -> Vec<SpeedBucket> {
        self.buckets.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<BusStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl MapRenderer for RecordingRenderer {
    fn move_marker(&self, latitude: f64, longitude: f64) {
        self.markers.lock().unwrap().push((latitude, longitude));
    }

    fn show_reading(&self, _sample: &PositionSample, bucket: SpeedBucket) {
        self.buckets.lock().unwrap().push(bucket);
    }

    fn show_status(&self, status: &BusStatus) {
        self.statuses.lock().unwrap().push(status.clone());
    }
}

#[derive(Clone, Debug)]
pub enum BackendCall {
    ReportLocation { bus_id: String, report: LocationReport },
    StartTrip(String),
    EndTrip(String),
    ReportIssue(IssueReport),
    EmergencyStop(EmergencyReport),
    CheckGeofence { bus_id: String, latitude: f64, longitude: f64 },
}

/// Records every call. A `None` response simulates a transport failure.
pub struct MockBackend {
    calls: Mutex<Vec<BackendCall>>,
    location_response: Mutex<Option<ApiResponse>>,
    trip_response: Mutex<Option<ApiResponse>>,
    issue_response: Mutex<Option<ApiResponse>>,
    geofence_response: Mutex<Option<GeofenceResponse>>,
    emergency_fails: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend {
            calls: Mutex::new(Vec::new()),
            location_response: Mutex::new(Some(ApiResponse::ok())),
            trip_response: Mutex::new(Some(ApiResponse::ok())),
            issue_response: Mutex::new(Some(ApiResponse::ok())),
            geofence_response: Mutex::new(Some(GeofenceResponse::default())),
            emergency_fails: AtomicBool::new(false),
        }
    }

    pub fn set_location_response(&self, response: Option<ApiResponse>) {
        *self.location_response.lock().unwrap() = response;
    }

    pub fn set_trip_response(&self, response: Option<ApiResponse>) {
        *self.trip_response.lock().unwrap() = response;
    }

    pub fn set_geofence_response(&self, response: Option<GeofenceResponse>) {
        *self.geofence_response.lock().unwrap() = response;
    }

    pub fn fail_emergency_reports(&self) {
        self.emergency_fails.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn reply<T: Clone>(slot: &Mutex<Option<T>>) -> Result<T, BackendError> {
        slot.lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::Transport("connection refused".to_string()))
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn report_location(
        &self,
        bus_id: &str,
        report: &LocationReport,
    ) -> Result<ApiResponse, BackendError> {
        self.record(BackendCall::ReportLocation {
            bus_id: bus_id.to_string(),
            report: report.clone(),
        });
        Self::reply(&self.location_response)
    }

    async fn start_trip(&self, bus_id: &str) -> Result<ApiResponse, BackendError> {
        self.record(BackendCall::StartTrip(bus_id.to_string()));
        Self::reply(&self.trip_response)
    }

    async fn end_trip(&self, bus_id: &str) -> Result<ApiResponse, BackendError> {
        self.record(BackendCall::EndTrip(bus_id.to_string()));
        Self::reply(&self.trip_response)
    }

    async fn report_issue(&self, report: &IssueReport) -> Result<ApiResponse, BackendError> {
        self.record(BackendCall::ReportIssue(report.clone()));
        Self::reply(&self.issue_response)
    }

    async fn emergency_stop(&self, report: &EmergencyReport) -> Result<(), BackendError> {
        self.record(BackendCall::EmergencyStop(report.clone()));
        if self.emergency_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("connection reset".to_string()));
        }
        Ok(())
    }

    async fn check_geofence(
        &self,
        bus_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<GeofenceResponse, BackendError> {
        self.record(BackendCall::CheckGeofence {
            bus_id: bus_id.to_string(),
            latitude,
            longitude,
        });
        Self::reply(&self.geofence_response)
    }
}

pub fn fix(latitude: f64, longitude: f64, speed_mps: f64) -> RawFix {
    RawFix {
        latitude,
        longitude,
        speed_mps: Some(speed_mps),
        accuracy_meters: 5.0,
    }
}

/// Location service whose fixes are pushed by the test.
pub struct ScriptedLocation {
    available: bool,
    hang: bool,
    current: Mutex<Result<RawFix, FixError>>,
    watches: Mutex<Vec<Option<mpsc::Sender<Result<RawFix, FixError>>>>>,
    options: Mutex<Vec<WatchOptions>>,
}

impl ScriptedLocation {
    pub fn new() -> Self {
        ScriptedLocation {
            available: true,
            hang: false,
            current: Mutex::new(Ok(fix(1.0, 2.0, 20.0))),
            watches: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        ScriptedLocation {
            available: false,
            ..Self::new()
        }
    }

    pub fn hanging_current_position(self) -> Self {
        ScriptedLocation { hang: true, ..self }
    }

    pub fn with_current(self, outcome: Result<RawFix, FixError>) -> Self {
        *self.current.lock().unwrap() = outcome;
        self
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().unwrap().len()
    }

    pub fn last_options(&self) -> Option<WatchOptions> {
        self.options.lock().unwrap().last().copied()
    }

    /// True when the latest watch has been dropped by the agent, or none exists
    pub fn watch_closed(&self) -> bool {
        self.watches
            .lock()
            .unwrap()
            .last()
            .and_then(|tx| tx.as_ref().map(|tx| tx.is_closed()))
            .unwrap_or(true)
    }

    /// End the latest watch from the service side
    pub fn end_watch(&self) {
        if let Some(tx) = self.watches.lock().unwrap().last_mut() {
            tx.take();
        }
    }

    /// Deliver an outcome on the latest watch
    pub async fn push(&self, outcome: Result<RawFix, FixError>) {
        let tx = self.watches.lock().unwrap().last().cloned().flatten();
        let tx = tx.expect("no watch registered");
        tx.send(outcome).await.expect("watch receiver dropped");
    }
}

#[async_trait]
impl LocationService for ScriptedLocation {
    fn is_available(&self) -> bool {
        self.available
    }

    fn watch_position(&self, options: WatchOptions) -> mpsc::Receiver<Result<RawFix, FixError>> {
        let (tx, rx) = mpsc::channel(16);
        self.watches.lock().unwrap().push(Some(tx));
        self.options.lock().unwrap().push(options);
        rx
    }

    async fn current_position(&self, _options: WatchOptions) -> Result<RawFix, FixError> {
        if self.hang {
            return futures::future::pending().await;
        }
        let outcome = self.current.lock().unwrap().clone();
        outcome
    }
}

#[derive(Clone, Copy)]
enum TransportMode {
    /// Connects; frames are fed by the test until it drops the connection
    Manual,
    /// Connects and the peer closes straight away
    Closing,
    /// Every connect attempt fails
    Failing,
    /// Connect never completes
    Stalled,
}

pub struct ScriptedTransport {
    mode: TransportMode,
    connects: Mutex<Vec<Instant>>,
    frames: Mutex<Option<mpsc::UnboundedSender<Result<String, ChannelError>>>>,
}

impl ScriptedTransport {
    fn with_mode(mode: TransportMode) -> Self {
        ScriptedTransport {
            mode,
            connects: Mutex::new(Vec::new()),
            frames: Mutex::new(None),
        }
    }

    pub fn manual() -> Self {
        Self::with_mode(TransportMode::Manual)
    }

    pub fn closing() -> Self {
        Self::with_mode(TransportMode::Closing)
    }

    pub fn failing() -> Self {
        Self::with_mode(TransportMode::Failing)
    }

    pub fn stalled() -> Self {
        Self::with_mode(TransportMode::Stalled)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().unwrap().clone()
    }

    pub fn send_frame(&self, text: &str) {
        if let Some(tx) = self.frames.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(text.to_string()));
        }
    }

    pub fn drop_connection(&self) {
        self.frames.lock().unwrap().take();
    }
}

#[async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn connect(&self, _endpoint: &Url) -> Result<FrameStream, ChannelError> {
        self.connects.lock().unwrap().push(Instant::now());
        match self.mode {
            TransportMode::Failing => Err(ChannelError::Connect("connection refused".to_string())),
            TransportMode::Closing => Ok(futures::stream::empty().boxed()),
            TransportMode::Stalled => futures::future::pending().await,
            TransportMode::Manual => {
                let (tx, rx) = mpsc::unbounded_channel();
                *self.frames.lock().unwrap() = Some(tx);
                let frames = futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|frame| (frame, rx))
                });
                Ok(frames.boxed())
            }
        }
    }
}
