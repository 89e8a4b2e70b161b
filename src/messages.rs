// Snapshot types reported by the driver
//
// All of these serialize to JSON for the monitor loop and the CLI.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::motor::MotorState;

/// One channel's motion telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub channel: u8,
    pub state: MotorState,
    pub speed: i32,
    pub position: i32,
    pub pulse_count: i32,
    pub pwm_duty: i16,
}

/// Proportional, integral and derivative gains of one control loop
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidGains {
    pub p: f32,
    pub i: f32,
    pub d: f32,
}

impl PidGains {
    pub fn new(p: f32, i: f32, d: f32) -> Self {
        Self { p, i, d }
    }
}

/// major.minor.patch as stored on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Read-only identity fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub device_id: u8,
    pub name: String,
    pub firmware_version: FirmwareVersion,
}
