// Per-channel protocol engine
//
// Every command goes through the same sequence:
//   1. wait for the drain flag to read 0
//   2. write the record to the mailbox
//   3. write 1 to the execute trigger (when the layout has one)
//   4. wait for the drain flag to read 0 again
//
// Telemetry fields are read with refresh-then-read: a zero byte written to
// the field's own offset latches a fresh value, then the same offset is read.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::bus::RegisterBus;
use super::protocol::{
    Command, GainLoop, GainTerm, Md20Error, MotorState, PhaseRelation, Result, SetupMode,
    decode_gain, encode_gain,
};
use super::registers::{CHANNEL_COUNT, Firmware, TelemetryField};
use crate::config::DEFAULT_DRAIN_TIMEOUT;
use crate::messages::{PidGains, Telemetry};

/// How long to wait for the peripheral to drain a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainWait {
    /// `None` spins until the flag clears, however long that takes
    pub timeout: Option<Duration>,
    /// Pause between polls; zero busy-spins
    pub poll_interval: Duration,
}

impl DrainWait {
    pub const fn unbounded() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::ZERO,
        }
    }

    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            poll_interval: Duration::ZERO,
        }
    }
}

impl Default for DrainWait {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_DRAIN_TIMEOUT)
    }
}

/// Protocol context for one channel, owned by the device handle
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    index: u8,
    address: u8,
    firmware: Firmware,
    wait: DrainWait,
}

impl Channel {
    pub(crate) fn new(index: usize, address: u8, firmware: Firmware, wait: DrainWait) -> Self {
        assert!(
            index < CHANNEL_COUNT,
            "channel index {index} out of range (0..{CHANNEL_COUNT})"
        );
        Self {
            index: index as u8,
            address,
            firmware,
            wait,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn firmware(&self) -> &Firmware {
        &self.firmware
    }

    pub fn drain_wait(&self) -> DrainWait {
        self.wait
    }
}

/// Controller for one motor channel, borrowing the device's bus
pub struct Motor<'a, B: RegisterBus> {
    bus: &'a mut B,
    channel: &'a Channel,
}

impl<'a, B: RegisterBus> Motor<'a, B> {
    pub fn new(bus: &'a mut B, channel: &'a Channel) -> Self {
        Self { bus, channel }
    }

    pub fn index(&self) -> u8 {
        self.channel.index
    }

    // === Commands ===

    /// Return the channel to IDLE and clear any pending command
    pub fn reset(&mut self) -> Result<()> {
        self.execute(Command::Reset)
    }

    pub fn setup(&mut self, mode: SetupMode) -> Result<()> {
        self.execute(Command::Setup(mode))
    }

    /// Configure for a plain DC motor (no encoder)
    pub fn setup_dc_mode(&mut self) -> Result<()> {
        self.setup(SetupMode::Dc)
    }

    pub fn setup_encoder_mode(
        &mut self,
        ppr: u16,
        reduction: u16,
        phase: PhaseRelation,
    ) -> Result<()> {
        self.setup(SetupMode::Encoder {
            ppr,
            reduction,
            phase,
        })
    }

    pub fn set_speed_gain(&mut self, term: GainTerm, value: f32) -> Result<()> {
        self.set_gain(GainLoop::Speed, term, value)
    }

    pub fn set_position_gain(&mut self, term: GainTerm, value: f32) -> Result<()> {
        self.set_gain(GainLoop::Position, term, value)
    }

    /// Set all three speed-loop gains; nothing is sent unless all are in range
    pub fn set_speed_pid(&mut self, gains: PidGains) -> Result<()> {
        self.set_pid(GainLoop::Speed, gains)
    }

    pub fn set_position_pid(&mut self, gains: PidGains) -> Result<()> {
        self.set_pid(GainLoop::Position, gains)
    }

    /// Overwrite the position counter without moving
    pub fn set_current_position(&mut self, position: i32) -> Result<()> {
        self.execute(Command::SetPosition(position))
    }

    pub fn set_pulse_count(&mut self, pulse_count: i32) -> Result<()> {
        self.execute(Command::SetPulseCount(pulse_count))
    }

    pub fn stop(&mut self) -> Result<()> {
        self.execute(Command::Stop)
    }

    /// Drive open-loop at a signed PWM duty
    pub fn run_pwm_duty(&mut self, duty: i16) -> Result<()> {
        self.execute(Command::RunPwmDuty(duty))
    }

    /// Hold a signed speed (rpm) with the speed loop
    pub fn run_speed(&mut self, rpm: i32) -> Result<()> {
        self.execute(Command::RunSpeed(rpm))
    }

    /// Move to an absolute position at `speed`
    pub fn move_to(&mut self, position: i32, speed: i32) -> Result<()> {
        self.execute(Command::MoveTo { position, speed })
    }

    /// Move by `offset` relative to the current position at `speed`
    pub fn move_by(&mut self, offset: i32, speed: i32) -> Result<()> {
        self.execute(Command::Move { offset, speed })
    }

    // === Telemetry ===

    pub fn state(&mut self) -> Result<MotorState> {
        let [value] = self.read_field::<1>(TelemetryField::State)?;
        MotorState::try_from(value).map_err(|value| Md20Error::UnknownState {
            channel: self.index(),
            value,
        })
    }

    pub fn speed(&mut self) -> Result<i32> {
        self.read_field(TelemetryField::Speed).map(i32::from_le_bytes)
    }

    pub fn position(&mut self) -> Result<i32> {
        self.read_field(TelemetryField::Position)
            .map(i32::from_le_bytes)
    }

    pub fn pulse_count(&mut self) -> Result<i32> {
        self.read_field(TelemetryField::PulseCount)
            .map(i32::from_le_bytes)
    }

    pub fn pwm_duty(&mut self) -> Result<i16> {
        self.read_field(TelemetryField::PwmDuty)
            .map(i16::from_le_bytes)
    }

    pub fn speed_gain(&mut self, term: GainTerm) -> Result<f32> {
        self.gain(GainLoop::Speed, term)
    }

    pub fn position_gain(&mut self, term: GainTerm) -> Result<f32> {
        self.gain(GainLoop::Position, term)
    }

    pub fn speed_pid(&mut self) -> Result<PidGains> {
        self.pid(GainLoop::Speed)
    }

    pub fn position_pid(&mut self) -> Result<PidGains> {
        self.pid(GainLoop::Position)
    }

    /// Read state and all motion telemetry, each field freshly latched
    pub fn telemetry(&mut self) -> Result<Telemetry> {
        Ok(Telemetry {
            channel: self.index(),
            state: self.state()?,
            speed: self.speed()?,
            position: self.position()?,
            pulse_count: self.pulse_count()?,
            pwm_duty: self.pwm_duty()?,
        })
    }

    /// Poll `state` until the channel reports REACHED_POSITION
    ///
    /// Returns the last observed state, which is not `ReachedPosition` if
    /// `max_polls` ran out first.
    pub fn wait_until_reached(&mut self, max_polls: usize) -> Result<MotorState> {
        let mut state = self.state()?;
        for _ in 1..max_polls {
            if state == MotorState::ReachedPosition {
                break;
            }
            state = self.state()?;
        }
        Ok(state)
    }

    // === Protocol primitives ===

    /// Issue one mailbox command and wait until the peripheral consumes it
    pub fn execute(&mut self, command: Command) -> Result<()> {
        let channel = self.channel;
        let layout = &channel.firmware.layout;
        let flag = layout.drain_flag(channel.index);
        let record = command.encode(&channel.firmware, channel.index);

        self.await_cleared(flag)?;

        debug!(
            "Channel {}: {:?} -> mailbox 0x{:02X} {:02X?}",
            channel.index,
            command,
            layout.mailbox(channel.index),
            record
        );
        self.write(layout.mailbox(channel.index), &record)?;
        if let Some(execute) = layout.execute {
            self.write(execute, &[1])?;
        }

        self.await_cleared(flag)
    }

    /// Poll a one-byte flag until it reads zero
    pub fn await_cleared(&mut self, offset: u8) -> Result<()> {
        let wait = self.channel.wait;
        let started = Instant::now();
        let mut flag = [0u8; 1];

        loop {
            self.read(offset, &mut flag)?;
            if flag[0] == 0 {
                return Ok(());
            }
            trace!(
                "Channel {}: flag 0x{:02X} still {}",
                self.index(),
                offset,
                flag[0]
            );

            if let Some(timeout) = wait.timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    warn!(
                        "Channel {}: command not drained after {:?}",
                        self.index(),
                        waited
                    );
                    return Err(Md20Error::Stall {
                        channel: self.index(),
                        offset,
                        waited,
                    });
                }
            }

            if wait.poll_interval.is_zero() {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(wait.poll_interval);
            }
        }
    }

    fn set_gain(&mut self, gain_loop: GainLoop, term: GainTerm, value: f32) -> Result<()> {
        let raw = encode_gain(value)?;
        self.execute(Command::SetGain {
            gain_loop,
            term,
            raw,
        })
    }

    fn set_pid(&mut self, gain_loop: GainLoop, gains: PidGains) -> Result<()> {
        let raw = [
            encode_gain(gains.p)?,
            encode_gain(gains.i)?,
            encode_gain(gains.d)?,
        ];
        for (term, raw) in GainTerm::ALL.into_iter().zip(raw) {
            self.execute(Command::SetGain {
                gain_loop,
                term,
                raw,
            })?;
        }
        Ok(())
    }

    fn gain(&mut self, gain_loop: GainLoop, term: GainTerm) -> Result<f32> {
        self.read_field(gain_loop.field(term))
            .map(|bytes| decode_gain(u16::from_le_bytes(bytes)))
    }

    fn pid(&mut self, gain_loop: GainLoop) -> Result<PidGains> {
        Ok(PidGains {
            p: self.gain(gain_loop, GainTerm::P)?,
            i: self.gain(gain_loop, GainTerm::I)?,
            d: self.gain(gain_loop, GainTerm::D)?,
        })
    }

    /// Refresh-then-read of one telemetry field
    fn read_field<const N: usize>(&mut self, field: TelemetryField) -> Result<[u8; N]> {
        debug_assert_eq!(N, field.width(), "{field:?} is {} bytes", field.width());
        let channel = self.channel;
        let layout = &channel.firmware.layout;
        let offset = layout.field(field, channel.index);

        if layout.refresh_before_read {
            self.write(offset, &[0])?;
        }
        let mut bytes = [0u8; N];
        self.read(offset, &mut bytes)?;
        debug!(
            "Channel {}: {:?} @0x{:02X} = {:02X?}",
            channel.index, field, offset, bytes
        );
        Ok(bytes)
    }

    fn read(&mut self, offset: u8, buf: &mut [u8]) -> Result<()> {
        let address = self.channel.address;
        self.bus
            .read(address, offset, buf)
            .map_err(|source| Md20Error::Transport {
                address,
                offset,
                source,
            })
    }

    fn write(&mut self, offset: u8, bytes: &[u8]) -> Result<()> {
        let address = self.channel.address;
        self.bus
            .write(address, offset, bytes)
            .map_err(|source| Md20Error::Transport {
                address,
                offset,
                source,
            })
    }
}
