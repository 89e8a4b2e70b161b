// MD20 command protocol
//
// Command records are written to the mailbox as:
// [command_type, (channel_index), params...] with little-endian params.
// Whether the channel byte is present depends on the firmware layout.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bus::TransportError;
use super::registers::{CommandKind, Firmware, TelemetryField};

/// Scale applied to PID gains on the wire
pub const GAIN_SCALE: f32 = 100.0;

/// Error types for MD20 communication
#[derive(Debug, thiserror::Error)]
pub enum Md20Error {
    #[error("Bus transport error (device 0x{address:02X}, offset 0x{offset:02X}): {source}")]
    Transport {
        address: u8,
        offset: u8,
        #[source]
        source: TransportError,
    },

    #[error("Channel {channel} did not drain its command within {waited:?} (flag 0x{offset:02X})")]
    Stall {
        channel: u8,
        offset: u8,
        waited: Duration,
    },

    #[error("Gain {value} does not fit the fixed-point range 0.00..=655.35")]
    GainOutOfRange { value: f32 },

    #[error("Channel {channel} reported unknown state {value}")]
    UnknownState { channel: u8, value: u8 },

    #[error("Device name is not valid UTF-8: {0}")]
    InvalidName(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, Md20Error>;

/// Operating state reported by a channel
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorState {
    #[default]
    Idle = 0,
    RunningWithPwmDuty = 1,
    RunningWithSpeed = 2,
    RunningToPosition = 3,
    ReachedPosition = 4,
}

impl TryFrom<u8> for MotorState {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(MotorState::Idle),
            1 => Ok(MotorState::RunningWithPwmDuty),
            2 => Ok(MotorState::RunningWithSpeed),
            3 => Ok(MotorState::RunningToPosition),
            4 => Ok(MotorState::ReachedPosition),
            other => Err(other),
        }
    }
}

impl fmt::Display for MotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MotorState::Idle => "idle",
            MotorState::RunningWithPwmDuty => "running (pwm duty)",
            MotorState::RunningWithSpeed => "running (speed)",
            MotorState::RunningToPosition => "running to position",
            MotorState::ReachedPosition => "reached position",
        };
        f.write_str(name)
    }
}

/// Encoder phase relation
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseRelation {
    #[default]
    ALeads = 0,
    BLeads = 1,
}

impl TryFrom<u8> for PhaseRelation {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(PhaseRelation::ALeads),
            1 => Ok(PhaseRelation::BLeads),
            other => Err(other),
        }
    }
}

/// Parameters of the setup command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupMode {
    /// Plain DC motor driven by PWM duty only
    Dc,
    Encoder {
        ppr: u16,
        reduction: u16,
        phase: PhaseRelation,
    },
}

impl SetupMode {
    /// (ppr, reduction, phase) as sent on the wire
    pub fn wire(self) -> (u16, u16, u8) {
        match self {
            SetupMode::Dc => (0, 0, 0),
            SetupMode::Encoder {
                ppr,
                reduction,
                phase,
            } => (ppr, reduction, phase as u8),
        }
    }

    fn from_wire(ppr: u16, reduction: u16, phase: u8) -> Option<Self> {
        if ppr == 0 && reduction == 0 {
            return Some(SetupMode::Dc);
        }
        Some(SetupMode::Encoder {
            ppr,
            reduction,
            phase: PhaseRelation::try_from(phase).ok()?,
        })
    }
}

/// Which closed loop a PID gain belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GainLoop {
    Speed,
    Position,
}

/// Proportional, integral or derivative term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GainTerm {
    P,
    I,
    D,
}

impl GainTerm {
    pub const ALL: [GainTerm; 3] = [GainTerm::P, GainTerm::I, GainTerm::D];
}

impl GainLoop {
    pub const fn command(self, term: GainTerm) -> CommandKind {
        match (self, term) {
            (GainLoop::Speed, GainTerm::P) => CommandKind::SetSpeedP,
            (GainLoop::Speed, GainTerm::I) => CommandKind::SetSpeedI,
            (GainLoop::Speed, GainTerm::D) => CommandKind::SetSpeedD,
            (GainLoop::Position, GainTerm::P) => CommandKind::SetPositionP,
            (GainLoop::Position, GainTerm::I) => CommandKind::SetPositionI,
            (GainLoop::Position, GainTerm::D) => CommandKind::SetPositionD,
        }
    }

    pub const fn field(self, term: GainTerm) -> TelemetryField {
        match (self, term) {
            (GainLoop::Speed, GainTerm::P) => TelemetryField::SpeedP,
            (GainLoop::Speed, GainTerm::I) => TelemetryField::SpeedI,
            (GainLoop::Speed, GainTerm::D) => TelemetryField::SpeedD,
            (GainLoop::Position, GainTerm::P) => TelemetryField::PositionP,
            (GainLoop::Position, GainTerm::I) => TelemetryField::PositionI,
            (GainLoop::Position, GainTerm::D) => TelemetryField::PositionD,
        }
    }

    fn from_command(kind: CommandKind) -> Option<(GainLoop, GainTerm)> {
        let pair = match kind {
            CommandKind::SetSpeedP => (GainLoop::Speed, GainTerm::P),
            CommandKind::SetSpeedI => (GainLoop::Speed, GainTerm::I),
            CommandKind::SetSpeedD => (GainLoop::Speed, GainTerm::D),
            CommandKind::SetPositionP => (GainLoop::Position, GainTerm::P),
            CommandKind::SetPositionI => (GainLoop::Position, GainTerm::I),
            CommandKind::SetPositionD => (GainLoop::Position, GainTerm::D),
            _ => return None,
        };
        Some(pair)
    }
}

/// Convert a real-valued gain to its fixed-point wire value
pub fn encode_gain(value: f32) -> Result<u16> {
    let scaled = (value * GAIN_SCALE).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled > u16::MAX as f32 {
        return Err(Md20Error::GainOutOfRange { value });
    }
    Ok(scaled as u16)
}

pub fn decode_gain(raw: u16) -> f32 {
    raw as f32 / GAIN_SCALE
}

/// A mailbox command and its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Reset,
    Setup(SetupMode),
    SetGain {
        gain_loop: GainLoop,
        term: GainTerm,
        raw: u16,
    },
    SetPosition(i32),
    SetPulseCount(i32),
    Stop,
    RunPwmDuty(i16),
    RunSpeed(i32),
    MoveTo {
        position: i32,
        speed: i32,
    },
    Move {
        offset: i32,
        speed: i32,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match *self {
            Command::Reset => CommandKind::Reset,
            Command::Setup(_) => CommandKind::Setup,
            Command::SetGain {
                gain_loop, term, ..
            } => gain_loop.command(term),
            Command::SetPosition(_) => CommandKind::SetPosition,
            Command::SetPulseCount(_) => CommandKind::SetPulseCount,
            Command::Stop => CommandKind::Stop,
            Command::RunPwmDuty(_) => CommandKind::RunPwmDuty,
            Command::RunSpeed(_) => CommandKind::RunSpeed,
            Command::MoveTo { .. } => CommandKind::MoveTo,
            Command::Move { .. } => CommandKind::Move,
        }
    }

    /// Build the mailbox record for `channel`
    pub fn encode(&self, firmware: &Firmware, channel: u8) -> Vec<u8> {
        let mut record = Vec::with_capacity(10);
        record.push(firmware.codes.code(self.kind()));
        if firmware.layout.channel_in_payload {
            record.push(channel);
        }

        match *self {
            Command::Reset | Command::Stop => {}
            Command::Setup(mode) => {
                let (ppr, reduction, phase) = mode.wire();
                record.extend_from_slice(&ppr.to_le_bytes());
                record.extend_from_slice(&reduction.to_le_bytes());
                record.push(phase);
            }
            Command::SetGain { raw, .. } => record.extend_from_slice(&raw.to_le_bytes()),
            Command::SetPosition(value)
            | Command::SetPulseCount(value)
            | Command::RunSpeed(value) => record.extend_from_slice(&value.to_le_bytes()),
            Command::RunPwmDuty(duty) => record.extend_from_slice(&duty.to_le_bytes()),
            Command::MoveTo { position, speed } => {
                record.extend_from_slice(&position.to_le_bytes());
                record.extend_from_slice(&speed.to_le_bytes());
            }
            Command::Move { offset, speed } => {
                record.extend_from_slice(&offset.to_le_bytes());
                record.extend_from_slice(&speed.to_le_bytes());
            }
        }

        record
    }

    /// Parse a mailbox record; the channel is `None` when the layout does not carry it
    pub fn decode(firmware: &Firmware, record: &[u8]) -> Option<(Option<u8>, Command)> {
        let mut params = Params(record);
        let kind = firmware.codes.kind(params.u8()?)?;
        let channel = if firmware.layout.channel_in_payload {
            Some(params.u8()?)
        } else {
            None
        };

        if let Some((gain_loop, term)) = GainLoop::from_command(kind) {
            let raw = params.u16()?;
            return Some((channel, Command::SetGain { gain_loop, term, raw }));
        }

        let command = match kind {
            CommandKind::Reset => Command::Reset,
            CommandKind::Stop => Command::Stop,
            CommandKind::Setup => {
                let ppr = params.u16()?;
                let reduction = params.u16()?;
                Command::Setup(SetupMode::from_wire(ppr, reduction, params.u8()?)?)
            }
            CommandKind::SetPosition => Command::SetPosition(params.i32()?),
            CommandKind::SetPulseCount => Command::SetPulseCount(params.i32()?),
            CommandKind::RunPwmDuty => Command::RunPwmDuty(params.i16()?),
            CommandKind::RunSpeed => Command::RunSpeed(params.i32()?),
            CommandKind::MoveTo => Command::MoveTo {
                position: params.i32()?,
                speed: params.i32()?,
            },
            CommandKind::Move => Command::Move {
                offset: params.i32()?,
                speed: params.i32()?,
            },
            _ => return None,
        };
        Some((channel, command))
    }
}

/// Little-endian reader over a record
struct Params<'a>(&'a [u8]);

impl Params<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let (head, rest) = self.0.split_first_chunk::<N>()?;
        self.0 = rest;
        Some(*head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take().map(u16::from_le_bytes)
    }

    fn i16(&mut self) -> Option<i16> {
        self.take().map(i16::from_le_bytes)
    }

    fn i32(&mut self) -> Option<i32> {
        self.take().map(i32::from_le_bytes)
    }
}
