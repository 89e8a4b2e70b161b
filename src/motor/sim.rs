// Simulated MD20 peripheral
//
// An embedded-hal I2C target model used by the tests and by `md20ctl
// --simulate`. It keeps a 256-byte register file, executes mailbox
// commands once the drain flag has been polled, and latches telemetry
// fields on refresh writes. Every bus operation is recorded.

use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};
use tracing::trace;

use super::protocol::{Command, MotorState, SetupMode};
use super::registers::{CHANNEL_COUNT, Encoding, Firmware, NAME_LEN, TelemetryField};
use crate::config::DEFAULT_ADDRESS;

pub const SIM_DEVICE_ID: u8 = 0x20;
pub const SIM_NAME: &str = "MD20";

/// Errors raised by the simulated peripheral
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    #[error("No acknowledge from address 0x{0:02X}")]
    NoAcknowledge(u8),

    #[error("Access of {len} bytes at 0x{offset:02X} runs past the register file")]
    OutOfRange { offset: u8, len: usize },
}

impl embedded_hal::i2c::Error for SimError {
    fn kind(&self) -> ErrorKind {
        match self {
            SimError::NoAcknowledge(_) => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address),
            SimError::OutOfRange { .. } => ErrorKind::Other,
        }
    }
}

/// One recorded register access
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Write { offset: u8, bytes: Vec<u8> },
    Read { offset: u8, bytes: Vec<u8> },
}

/// Live values of one channel, published into the register file on refresh
#[derive(Debug, Clone, Default)]
pub struct SimChannel {
    pub state: MotorState,
    pub setup: Option<SetupMode>,
    /// Raw fixed-point gains: speed P/I/D then position P/I/D
    pub gains: [u16; 6],
    pub speed: i32,
    pub position: i32,
    pub pulse_count: i32,
    pub pwm_duty: i16,
    target: i32,
    settle_remaining: u32,
}

impl SimChannel {
    fn apply(&mut self, command: Command, settle_polls: u32) {
        match command {
            Command::Reset => {
                *self = SimChannel {
                    setup: self.setup,
                    gains: self.gains,
                    position: self.position,
                    pulse_count: self.pulse_count,
                    ..SimChannel::default()
                };
            }
            Command::Setup(mode) => {
                self.setup = Some(mode);
                self.state = MotorState::Idle;
            }
            Command::SetGain {
                gain_loop, term, raw,
            } => {
                let slot = gain_loop.field(term) as usize - TelemetryField::SpeedP as usize;
                self.gains[slot] = raw;
            }
            Command::SetPosition(position) => self.position = position,
            Command::SetPulseCount(count) => self.pulse_count = count,
            Command::Stop => {
                self.state = MotorState::Idle;
                self.speed = 0;
                self.pwm_duty = 0;
            }
            Command::RunPwmDuty(duty) => {
                self.state = MotorState::RunningWithPwmDuty;
                self.pwm_duty = duty;
            }
            Command::RunSpeed(rpm) => {
                self.state = MotorState::RunningWithSpeed;
                self.speed = rpm;
            }
            Command::MoveTo { position, speed } => self.start_move(position, speed, settle_polls),
            Command::Move { offset, speed } => {
                self.start_move(self.position.wrapping_add(offset), speed, settle_polls)
            }
        }
    }

    fn start_move(&mut self, target: i32, speed: i32, settle_polls: u32) {
        self.state = MotorState::RunningToPosition;
        self.target = target;
        self.speed = speed;
        self.settle_remaining = settle_polls;
    }

    /// Advance an in-flight move by one observation of the state field
    fn observe(&mut self) {
        if self.state != MotorState::RunningToPosition {
            return;
        }
        if self.settle_remaining > 0 {
            self.settle_remaining -= 1;
            return;
        }
        self.pulse_count = self
            .pulse_count
            .wrapping_add(self.target.wrapping_sub(self.position));
        self.position = self.target;
        self.speed = 0;
        self.state = MotorState::ReachedPosition;
    }

    fn field_bytes(&self, field: TelemetryField) -> Vec<u8> {
        match field {
            TelemetryField::State => vec![self.state as u8],
            TelemetryField::Speed => self.speed.to_le_bytes().to_vec(),
            TelemetryField::Position => self.position.to_le_bytes().to_vec(),
            TelemetryField::PulseCount => self.pulse_count.to_le_bytes().to_vec(),
            TelemetryField::PwmDuty => self.pwm_duty.to_le_bytes().to_vec(),
            gain => {
                debug_assert_eq!(gain.encoding(), Encoding::FixedU16);
                let slot = gain as usize - TelemetryField::SpeedP as usize;
                self.gains[slot].to_le_bytes().to_vec()
            }
        }
    }
}

/// A command written and triggered but not yet drained
#[derive(Debug, Clone, Copy)]
struct Pending {
    flag: u8,
    /// Mailbox channel for layouts without a channel byte
    channel: Option<u8>,
    polls_left: u32,
}

/// In-memory MD20
pub struct SimMd20 {
    address: u8,
    firmware: Firmware,
    memory: [u8; 256],
    channels: [SimChannel; CHANNEL_COUNT],
    pending: Option<Pending>,
    busy_polls: u32,
    settle_polls: u32,
    stalled: bool,
    log: Vec<BusOp>,
}

impl Default for SimMd20 {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMd20 {
    pub fn new() -> Self {
        let mut sim = Self {
            address: DEFAULT_ADDRESS,
            firmware: Firmware::V2,
            memory: [0u8; 256],
            channels: Default::default(),
            pending: None,
            busy_polls: 0,
            settle_polls: 2,
            stalled: false,
            log: Vec::new(),
        };
        sim.set_identity(SIM_DEVICE_ID, SIM_NAME, [1, 0, 0]);
        sim
    }

    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn with_firmware(mut self, firmware: Firmware) -> Self {
        let identity = self.identity_bytes();
        self.firmware = firmware;
        self.memory = [0u8; 256];
        self.write_identity(identity);
        self
    }

    /// Each command reads back busy this many times before draining
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Moves report RUNNING_TO_POSITION for this many state observations
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Start with channel 0's drain flag raised for `polls` reads
    pub fn with_flag_raised(mut self, polls: u32) -> Self {
        let flag = self.firmware.layout.drain_flag(0);
        self.memory[flag as usize] = 1;
        self.pending = Some(Pending {
            flag,
            channel: None,
            polls_left: polls,
        });
        self
    }

    pub fn set_identity(&mut self, device_id: u8, name: &str, version: [u8; 3]) {
        let mut identity = [0u8; 1 + 3 + NAME_LEN];
        identity[0] = device_id;
        identity[1..4].copy_from_slice(&version);
        let len = name.len().min(NAME_LEN);
        identity[4..4 + len].copy_from_slice(&name.as_bytes()[..len]);
        self.write_identity(identity);
    }

    /// Stop draining commands (the flag stays raised forever)
    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    pub fn channel(&self, index: usize) -> &SimChannel {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut SimChannel {
        &mut self.channels[index]
    }

    pub fn memory(&self) -> &[u8; 256] {
        &self.memory
    }

    pub fn log(&self) -> &[BusOp] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    fn identity_bytes(&self) -> [u8; 1 + 3 + NAME_LEN] {
        let layout = self.firmware.layout;
        let mut identity = [0u8; 1 + 3 + NAME_LEN];
        identity[0] = self.memory[layout.device_id as usize];
        let version = layout.firmware_version as usize;
        identity[1..4].copy_from_slice(&self.memory[version..version + 3]);
        let name = layout.name as usize;
        identity[4..].copy_from_slice(&self.memory[name..name + NAME_LEN]);
        identity
    }

    fn write_identity(&mut self, identity: [u8; 1 + 3 + NAME_LEN]) {
        let layout = self.firmware.layout;
        self.memory[layout.device_id as usize] = identity[0];
        let version = layout.firmware_version as usize;
        self.memory[version..version + 3].copy_from_slice(&identity[1..4]);
        let name = layout.name as usize;
        self.memory[name..name + NAME_LEN].copy_from_slice(&identity[4..]);
    }

    fn check_range(offset: u8, len: usize) -> Result<(), SimError> {
        if offset as usize + len > 256 {
            return Err(SimError::OutOfRange { offset, len });
        }
        Ok(())
    }

    /// Find the (channel, field) whose register starts at `offset`
    fn telemetry_at(&self, offset: u8) -> Option<(usize, TelemetryField)> {
        let layout = self.firmware.layout;
        (0..CHANNEL_COUNT).find_map(|index| {
            TelemetryField::ALL
                .into_iter()
                .find(|&field| layout.field(field, index as u8) == offset)
                .map(|field| (index, field))
        })
    }

    fn mailbox_channel(&self, offset: u8) -> Option<u8> {
        let layout = self.firmware.layout;
        (0..CHANNEL_COUNT as u8).find(|&index| layout.mailbox(index) == offset)
    }

    fn publish(&mut self, index: usize, field: TelemetryField) {
        let offset = self.firmware.layout.field(field, index as u8) as usize;
        let bytes = self.channels[index].field_bytes(field);
        self.memory[offset..offset + bytes.len()].copy_from_slice(&bytes);
    }

    fn handle_write(&mut self, offset: u8, data: &[u8]) -> Result<(), SimError> {
        Self::check_range(offset, data.len())?;
        self.log.push(BusOp::Write {
            offset,
            bytes: data.to_vec(),
        });
        let layout = self.firmware.layout;

        // Refresh latch: a single zero byte at a telemetry field
        if layout.refresh_before_read && data == [0] {
            if let Some((index, field)) = self.telemetry_at(offset) {
                if field == TelemetryField::State {
                    self.channels[index].observe();
                }
                self.publish(index, field);
                return Ok(());
            }
        }

        if offset < layout.telemetry.base && offset >= layout.name + NAME_LEN as u8 {
            self.memory[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }

        match layout.execute {
            Some(execute) if offset == execute && data.first() == Some(&1) => {
                self.raise(execute, None);
            }
            None => {
                if let Some(index) = self.mailbox_channel(offset) {
                    if data.first().is_some_and(|&code| code != 0) {
                        self.raise(offset, Some(index));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn raise(&mut self, flag: u8, channel: Option<u8>) {
        trace!("sim: command raised at 0x{:02X}", flag);
        self.pending = Some(Pending {
            flag,
            channel,
            polls_left: self.busy_polls,
        });
    }

    fn handle_read(&mut self, offset: u8, buf: &mut [u8]) -> Result<(), SimError> {
        Self::check_range(offset, buf.len())?;
        let range = offset as usize..offset as usize + buf.len();

        if let Some(mut pending) = self.pending {
            if range.contains(&(pending.flag as usize)) && !self.stalled {
                if pending.polls_left == 0 {
                    self.drain(pending);
                } else {
                    pending.polls_left -= 1;
                    self.pending = Some(pending);
                }
            }
        }

        // Without refresh latches every field is live
        if !self.firmware.layout.refresh_before_read {
            if let Some((index, TelemetryField::State)) = self.telemetry_at(offset) {
                self.channels[index].observe();
            }
            for index in 0..CHANNEL_COUNT {
                for field in TelemetryField::ALL {
                    self.publish(index, field);
                }
            }
        }

        buf.copy_from_slice(&self.memory[range]);
        self.log.push(BusOp::Read {
            offset,
            bytes: buf.to_vec(),
        });
        Ok(())
    }

    /// Execute the mailbox record and clear the flag
    fn drain(&mut self, pending: Pending) {
        self.pending = None;
        let layout = self.firmware.layout;
        let mailbox = layout.mailbox(pending.channel.unwrap_or(0)) as usize;
        let decoded = Command::decode(&self.firmware, &self.memory[mailbox..mailbox + 16]);
        self.memory[pending.flag as usize] = 0;

        let Some((payload_channel, command)) = decoded else {
            trace!("sim: mailbox holds no valid command");
            return;
        };
        let Some(index) = payload_channel.or(pending.channel) else {
            return;
        };
        if let Some(channel) = self.channels.get_mut(index as usize) {
            trace!("sim: channel {} executes {:?}", index, command);
            channel.apply(command, self.settle_polls);
        }
    }
}

impl ErrorType for SimMd20 {
    type Error = SimError;
}

impl I2c for SimMd20 {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        if address != self.address {
            return Err(SimError::NoAcknowledge(address));
        }

        let mut pointer = 0u8;
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => {
                    let Some((&offset, data)) = bytes.split_first() else {
                        continue;
                    };
                    pointer = offset;
                    if !data.is_empty() {
                        self.handle_write(offset, data)?;
                    }
                }
                Operation::Read(buf) => self.handle_read(pointer, buf)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_address_is_nacked() {
        let mut sim = SimMd20::new();
        let mut buf = [0u8; 1];
        assert_eq!(
            sim.write_read(0x17, &[0x00], &mut buf),
            Err(SimError::NoAcknowledge(0x17))
        );
        assert!(sim.log().is_empty());
    }

    #[test]
    fn test_identity_is_readable() {
        let mut sim = SimMd20::new();
        let mut buf = [0u8; 12];
        sim.write_read(DEFAULT_ADDRESS, &[0x00], &mut buf).unwrap();
        assert_eq!(buf[0], SIM_DEVICE_ID);
        assert_eq!(&buf[1..4], &[1, 0, 0]);
        assert_eq!(&buf[4..8], b"MD20");
    }

    #[test]
    fn test_command_drains_after_busy_polls() {
        let mut sim = SimMd20::new().with_busy_polls(2);
        sim.write(DEFAULT_ADDRESS, &[0x11, 12, 1, 0xFF, 0x03]).unwrap();
        sim.write(DEFAULT_ADDRESS, &[0x23, 1]).unwrap();

        let mut flag = [0u8; 1];
        let mut seen = Vec::new();
        for _ in 0..3 {
            sim.write_read(DEFAULT_ADDRESS, &[0x23], &mut flag).unwrap();
            seen.push(flag[0]);
        }
        assert_eq!(seen, vec![1, 1, 0]);
        assert_eq!(sim.channel(1).state, MotorState::RunningWithPwmDuty);
        assert_eq!(sim.channel(1).pwm_duty, 1023);
    }

    #[test]
    fn test_telemetry_is_stale_until_refreshed() {
        let mut sim = SimMd20::new();
        sim.channel_mut(0).speed = 90;
        let offset = Firmware::V2.layout.field(TelemetryField::Speed, 0);

        let mut speed = [0u8; 4];
        sim.write_read(DEFAULT_ADDRESS, &[offset], &mut speed).unwrap();
        assert_eq!(i32::from_le_bytes(speed), 0);

        sim.write(DEFAULT_ADDRESS, &[offset, 0]).unwrap();
        sim.write_read(DEFAULT_ADDRESS, &[offset], &mut speed).unwrap();
        assert_eq!(i32::from_le_bytes(speed), 90);
    }
}
