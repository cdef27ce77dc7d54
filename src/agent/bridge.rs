//! Onboard bridge between the agent and the rover's own middleware.
//!
//! The agent never talks to motors or sensors directly. It forwards command
//! text to a [`RoverBridge`] and asks it for sensor readings. Real rovers
//! plug in their middleware here; [`SimulatedBridge`] stands in for it.

use thiserror::Error;

use crate::protocol::TelemetryReading;

/// The bridge refused or failed to execute a command.
///
/// Reported to the server as a `failed` `command_response`; never treated
/// as a link fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot execute {command:?}: {reason}")]
pub struct DispatchFault {
    /// Command text as received.
    pub command: String,
    /// Why execution failed.
    pub reason: String,
}

/// Onboard collaborator that executes commands and reports sensor state.
pub trait RoverBridge: Send + std::fmt::Debug {
    /// Executes one command and returns a human-readable result.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchFault`] if the command is unknown or the rover
    /// cannot carry it out.
    fn execute(&mut self, command: &str) -> Result<String, DispatchFault>;

    /// Collects one set of sensor readings.
    fn read_telemetry(&mut self) -> TelemetryReading;
}

const CRUISE_SPEED: f64 = 0.5;
const TURN_STEP_DEG: f64 = 15.0;
const BATTERY_DRAIN_PER_SAMPLE: f64 = 0.05;
/// Rough metres per degree of latitude.
const METRES_PER_DEGREE: f64 = 111_320.0;

/// Simulated rover: a point moving on a plane with drifting sensors.
///
/// Understands `move_forward`, `move_backward`, `turn_left`, `turn_right`,
/// `stop` and `status` (case-insensitive, surrounding whitespace ignored).
#[derive(Debug, Clone)]
pub struct SimulatedBridge {
    latitude: f64,
    longitude: f64,
    heading: f64,
    speed: f64,
    battery: f64,
    samples: u32,
}

impl Default for SimulatedBridge {
    fn default() -> Self {
        Self::new(37.7749, -122.4194)
    }
}

impl SimulatedBridge {
    /// Creates a stationary rover at the given position with a full battery.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            heading: 0.0,
            speed: 0.0,
            battery: 100.0,
            samples: 0,
        }
    }

    /// Current speed in metres per second (negative when reversing).
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Current heading in degrees, `0..360`.
    #[must_use]
    pub fn heading(&self) -> f64 {
        self.heading
    }

    fn turn(&mut self, delta: f64) {
        self.heading = (self.heading + delta).rem_euclid(360.0);
    }

    fn advance(&mut self) {
        let distance = self.speed;
        let rad = self.heading.to_radians();
        self.latitude += distance * rad.cos() / METRES_PER_DEGREE;
        let scale = (METRES_PER_DEGREE * self.latitude.to_radians().cos()).max(1.0);
        self.longitude += distance * rad.sin() / scale;
        self.battery = (self.battery - BATTERY_DRAIN_PER_SAMPLE).max(0.0);
    }
}

impl RoverBridge for SimulatedBridge {
    fn execute(&mut self, command: &str) -> Result<String, DispatchFault> {
        if self.battery <= 0.0 {
            return Err(DispatchFault {
                command: command.to_string(),
                reason: "battery depleted".to_string(),
            });
        }
        match command.trim().to_ascii_lowercase().as_str() {
            "move_forward" => {
                self.speed = CRUISE_SPEED;
                Ok(format!("moving forward at {CRUISE_SPEED} m/s"))
            }
            "move_backward" => {
                self.speed = -CRUISE_SPEED;
                Ok(format!("moving backward at {CRUISE_SPEED} m/s"))
            }
            "turn_left" => {
                self.turn(-TURN_STEP_DEG);
                Ok(format!("heading {:.0}", self.heading))
            }
            "turn_right" => {
                self.turn(TURN_STEP_DEG);
                Ok(format!("heading {:.0}", self.heading))
            }
            "stop" => {
                self.speed = 0.0;
                Ok("stopped".to_string())
            }
            "status" => Ok(format!(
                "lat {:.6} lon {:.6} heading {:.0} speed {:.1} battery {:.1}%",
                self.latitude, self.longitude, self.heading, self.speed, self.battery
            )),
            _ => Err(DispatchFault {
                command: command.to_string(),
                reason: "unknown command".to_string(),
            }),
        }
    }

    fn read_telemetry(&mut self) -> TelemetryReading {
        self.advance();
        self.samples = self.samples.wrapping_add(1);
        let t = f64::from(self.samples);

        TelemetryReading {
            temperature: Some(21.0 + (t / 20.0).sin() * 1.5),
            humidity: Some(45.0 + (t / 35.0).cos() * 5.0),
            pressure: Some(1013.25 + (t / 50.0).sin() * 0.8),
            altitude: Some(12.0 + (t / 40.0).sin() * 0.5),
            heading: Some(self.heading),
            speed: Some(self.speed.abs()),
            tilt: Some((t / 7.0).sin() * 2.0),
            latitude: Some(self.latitude),
            longitude: Some(self.longitude),
            battery_level: Some(self.battery),
            signal_strength: Some(-60.0 + (t / 15.0).cos() * 8.0),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn motion_commands_change_state() {
        let mut bridge = SimulatedBridge::default();
        tokio_test::assert_ok!(bridge.execute("move_forward"));
        assert!((bridge.speed() - CRUISE_SPEED).abs() < f64::EPSILON);

        tokio_test::assert_ok!(bridge.execute("  TURN_RIGHT "));
        assert!((bridge.heading() - 15.0).abs() < f64::EPSILON);

        tokio_test::assert_ok!(bridge.execute("turn_left"));
        tokio_test::assert_ok!(bridge.execute("turn_left"));
        assert!((bridge.heading() - 345.0).abs() < f64::EPSILON);

        tokio_test::assert_ok!(bridge.execute("stop"));
        assert!(bridge.speed().abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_command_is_a_dispatch_fault() {
        let mut bridge = SimulatedBridge::default();
        let Err(fault) = bridge.execute("self_destruct") else {
            panic!("unknown command must fail");
        };
        assert_eq!(fault.command, "self_destruct");
        assert_eq!(fault.reason, "unknown command");
    }

    #[test]
    fn telemetry_tracks_motion_and_drains_battery() {
        let mut bridge = SimulatedBridge::new(0.0, 0.0);
        let _ = bridge.execute("move_forward");
        let first = bridge.read_telemetry();
        let second = bridge.read_telemetry();

        let (Some(lat1), Some(lat2)) = (first.latitude, second.latitude) else {
            panic!("latitude must be reported");
        };
        assert!(lat2 > lat1);
        let (Some(b1), Some(b2)) = (first.battery_level, second.battery_level) else {
            panic!("battery must be reported");
        };
        assert!(b2 < b1);
        assert_eq!(second.speed, Some(CRUISE_SPEED));
    }
}
