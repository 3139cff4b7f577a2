use serde::{Deserialize, Serialize};

/// Remote trip-lifecycle command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    StartTrip,
    EndTrip,
    EmergencyStop,
}

impl Command {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "start_trip" => Some(Command::StartTrip),
            "end_trip" => Some(Command::EndTrip),
            "emergency_stop" => Some(Command::EmergencyStop),
            _ => None,
        }
    }
}

/// `command` envelope payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub action: String,
}

/// Trip actions a remote command can trigger
pub trait TripActions {
    fn start_trip(&mut self);
    fn end_trip(&mut self);
    fn emergency_stop(&mut self);
}

/// Routes remote commands to trip actions. This is the only way the backend
/// can start or stop tracking without the driver doing anything.
#[derive(Debug, Default)]
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Perform the command's action, if recognised. Returns what ran.
    pub fn dispatch<T: TripActions>(&self, payload: &CommandPayload, target: &mut T) -> Option<Command> {
        let command = match Command::parse(&payload.action) {
            Some(command) => command,
            None => {
                log::debug!("[dispatch] ignoring unknown action {:?}", payload.action);
                return None;
            }
        };

        log::info!("[dispatch] remote command {:?}", command);
        match command {
            Command::StartTrip => target.start_trip(),
            Command::EndTrip => target.end_trip(),
            Command::EmergencyStop => target.emergency_stop(),
        }
        Some(command)
    }
}
