use crate::agent::AgentContext;
use crate::notify::NotificationLevel;
use crate::types::PositionSample;
use tokio::task::JoinHandle;

/// Best-effort zone membership check, one request per sample.
#[derive(Debug, Default)]
pub struct GeofenceChecker;

impl GeofenceChecker {
    pub fn new() -> Self {
        GeofenceChecker
    }

    pub fn check(&self, ctx: &AgentContext, sample: &PositionSample) -> JoinHandle<()> {
        let ctx = ctx.clone();
        let (latitude, longitude) = (sample.latitude, sample.longitude);

        tokio::spawn(async move {
            match ctx.backend.check_geofence(&ctx.bus_id, latitude, longitude).await {
                Ok(response) if response.inside_geofence => {
                    let name = response.geofence_name.as_deref().unwrap_or("a geofence");
                    log::info!("[geofence] inside {} at ({}, {})", name, latitude, longitude);
                    ctx.notifier
                        .notify(&format!("Entered {}", name), NotificationLevel::Info, false);
                }
                Ok(_) => {}
                Err(e) => log::error!("[geofence] error checking geofences: {}", e),
            }
        })
    }
}
