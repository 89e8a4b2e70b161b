// MD20 register map
//
// Byte offsets for the identity region, the command mailbox and the
// per-channel telemetry block. Each firmware revision is one `Firmware`
// value: moving a register is a change to the tables below, not to the
// protocol engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of motor channels on the peripheral
pub const CHANNEL_COUNT: usize = 4;

/// Identity region: device id (1) + firmware version (3) + name (8)
pub const IDENTITY_LEN: usize = 12;
pub const NAME_LEN: usize = 8;

/// A block repeated once per channel at `base + index * stride`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u8,
    pub stride: u8,
}

impl Region {
    pub const fn at(self, index: u8) -> u8 {
        self.base + index * self.stride
    }
}

/// How a register's bytes are interpreted (all little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    U8,
    /// u16 holding `value * 100`
    FixedU16,
    I16,
    I32,
}

impl Encoding {
    pub const fn width(self) -> usize {
        match self {
            Encoding::U8 => 1,
            Encoding::FixedU16 | Encoding::I16 => 2,
            Encoding::I32 => 4,
        }
    }
}

/// Fields of one channel's telemetry/config block
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryField {
    State,
    SpeedP,
    SpeedI,
    SpeedD,
    PositionP,
    PositionI,
    PositionD,
    Speed,
    Position,
    PulseCount,
    PwmDuty,
}

impl TelemetryField {
    pub const COUNT: usize = 11;

    pub const ALL: [TelemetryField; Self::COUNT] = [
        TelemetryField::State,
        TelemetryField::SpeedP,
        TelemetryField::SpeedI,
        TelemetryField::SpeedD,
        TelemetryField::PositionP,
        TelemetryField::PositionI,
        TelemetryField::PositionD,
        TelemetryField::Speed,
        TelemetryField::Position,
        TelemetryField::PulseCount,
        TelemetryField::PwmDuty,
    ];

    pub const fn encoding(self) -> Encoding {
        match self {
            TelemetryField::State => Encoding::U8,
            TelemetryField::SpeedP
            | TelemetryField::SpeedI
            | TelemetryField::SpeedD
            | TelemetryField::PositionP
            | TelemetryField::PositionI
            | TelemetryField::PositionD => Encoding::FixedU16,
            TelemetryField::Speed | TelemetryField::Position | TelemetryField::PulseCount => {
                Encoding::I32
            }
            TelemetryField::PwmDuty => Encoding::I16,
        }
    }

    pub const fn width(self) -> usize {
        self.encoding().width()
    }
}

/// Command types understood by the mailbox
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Setup,
    Reset,
    SetSpeedP,
    SetSpeedI,
    SetSpeedD,
    SetPositionP,
    SetPositionI,
    SetPositionD,
    SetPosition,
    SetPulseCount,
    Stop,
    RunPwmDuty,
    RunSpeed,
    MoveTo,
    Move,
}

impl CommandKind {
    pub const COUNT: usize = 15;

    pub const ALL: [CommandKind; Self::COUNT] = [
        CommandKind::Setup,
        CommandKind::Reset,
        CommandKind::SetSpeedP,
        CommandKind::SetSpeedI,
        CommandKind::SetSpeedD,
        CommandKind::SetPositionP,
        CommandKind::SetPositionI,
        CommandKind::SetPositionD,
        CommandKind::SetPosition,
        CommandKind::SetPulseCount,
        CommandKind::Stop,
        CommandKind::RunPwmDuty,
        CommandKind::RunSpeed,
        CommandKind::MoveTo,
        CommandKind::Move,
    ];
}

/// Wire codes for each `CommandKind`, indexed by `kind as usize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCodes(pub [u8; CommandKind::COUNT]);

impl CommandCodes {
    pub const fn code(&self, kind: CommandKind) -> u8 {
        self.0[kind as usize]
    }

    /// Reverse lookup, used by the simulated peripheral
    pub fn kind(&self, code: u8) -> Option<CommandKind> {
        CommandKind::ALL
            .iter()
            .copied()
            .find(|&kind| self.code(kind) == code)
    }
}

/// Byte layout of one firmware revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    pub device_id: u8,
    /// major, minor, patch in three consecutive bytes
    pub firmware_version: u8,
    pub name: u8,
    pub mailbox: Region,
    /// Separate execute trigger; when absent the mailbox's command byte is the drain flag
    pub execute: Option<u8>,
    pub telemetry: Region,
    /// Offsets inside a telemetry block, indexed by `field as usize`
    pub fields: [u8; TelemetryField::COUNT],
    /// Whether the record carries the channel index after the command byte
    pub channel_in_payload: bool,
    /// Whether a zero byte must be written to a field before it is read
    pub refresh_before_read: bool,
}

impl RegisterLayout {
    /// Where a channel's command record is written
    pub const fn mailbox(&self, index: u8) -> u8 {
        self.mailbox.at(index)
    }

    /// The flag that reads back zero once a channel's command is consumed
    pub const fn drain_flag(&self, index: u8) -> u8 {
        match self.execute {
            Some(offset) => offset,
            None => self.mailbox(index),
        }
    }

    /// Offset of a field for channel 0
    pub const fn base_offset(&self, field: TelemetryField) -> u8 {
        self.telemetry.base + self.fields[field as usize]
    }

    pub const fn field(&self, field: TelemetryField, index: u8) -> u8 {
        self.base_offset(field) + index * self.telemetry.stride
    }
}

/// Known firmware revisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareRevision {
    /// Per-channel mailboxes without an execute trigger
    V1,
    #[default]
    V2,
}

impl FirmwareRevision {
    pub const fn firmware(self) -> &'static Firmware {
        match self {
            FirmwareRevision::V1 => &Firmware::V1,
            FirmwareRevision::V2 => &Firmware::V2,
        }
    }
}

impl fmt::Display for FirmwareRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareRevision::V1 => f.write_str("v1"),
            FirmwareRevision::V2 => f.write_str("v2"),
        }
    }
}

impl FromStr for FirmwareRevision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(FirmwareRevision::V1),
            "v2" | "2" => Ok(FirmwareRevision::V2),
            other => Err(format!("unknown firmware revision '{other}' (expected v1 or v2)")),
        }
    }
}

/// Register layout plus command table for one revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Firmware {
    pub revision: FirmwareRevision,
    pub layout: RegisterLayout,
    pub codes: CommandCodes,
}

impl Firmware {
    pub const V1: Firmware = Firmware {
        revision: FirmwareRevision::V1,
        layout: RegisterLayout {
            device_id: 0x00,
            firmware_version: 0x01,
            name: 0x04,
            mailbox: Region { base: 0x10, stride: 0x11 },
            execute: None,
            telemetry: Region { base: 0x60, stride: 0x20 },
            fields: [0x00, 0x02, 0x04, 0x06, 0x08, 0x0A, 0x0C, 0x10, 0x14, 0x18, 0x1C],
            channel_in_payload: false,
            refresh_before_read: false,
        },
        codes: CommandCodes([2, 1, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]),
    };

    pub const V2: Firmware = Firmware {
        revision: FirmwareRevision::V2,
        layout: RegisterLayout {
            device_id: 0x00,
            firmware_version: 0x01,
            name: 0x04,
            mailbox: Region { base: 0x11, stride: 0x00 },
            execute: Some(0x23),
            telemetry: Region { base: 0x24, stride: 0x20 },
            fields: [0, 1, 3, 5, 7, 9, 11, 13, 17, 21, 25],
            channel_in_payload: true,
            refresh_before_read: true,
        },
        codes: CommandCodes([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]),
    };
}

impl Default for Firmware {
    fn default() -> Self {
        Firmware::V2
    }
}
