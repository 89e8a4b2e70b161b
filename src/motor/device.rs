// MD20 device handle
//
// Owns the bus and one `Channel` per motor output. Identity fields are
// plain reads; per-channel work goes through a borrowed `Motor`.

use tracing::{info, warn};

use super::bus::{I2cTransport, RegisterBus};
use super::channel::{Channel, DrainWait, Motor};
use super::protocol::{Md20Error, Result};
use super::registers::{CHANNEL_COUNT, Firmware, IDENTITY_LEN, NAME_LEN};
use crate::config::DriverConfig;
use crate::messages::{FirmwareVersion, Identity, Telemetry};

/// Handle to one MD20 on the bus
pub struct Md20<B: RegisterBus> {
    bus: B,
    address: u8,
    firmware: Firmware,
    channels: [Channel; CHANNEL_COUNT],
    stop_on_drop: bool,
}

impl<I> Md20<I2cTransport<I>>
where
    I2cTransport<I>: RegisterBus,
{
    /// Wrap an embedded-hal I2C master with the default configuration
    pub fn from_i2c(i2c: I) -> Result<Self> {
        Self::new(I2cTransport::new(i2c))
    }
}

impl<B: RegisterBus> Md20<B> {
    /// Create with the default address and firmware, resetting every channel
    pub fn new(bus: B) -> Result<Self> {
        Self::with_config(bus, &DriverConfig::default())
    }

    /// Create from a config, resetting every channel
    pub fn with_config(bus: B, config: &DriverConfig) -> Result<Self> {
        let mut md20 = Self::attach(bus, config);
        md20.stop_on_drop = false;
        md20.reset_all()?;
        md20.stop_on_drop = config.stop_on_drop;
        Ok(md20)
    }

    /// Create with an explicit firmware table, resetting every channel
    pub fn with_firmware(bus: B, address: u8, firmware: Firmware, wait: DrainWait) -> Result<Self> {
        let mut md20 = Self::build(bus, address, firmware, wait);
        md20.reset_all()?;
        md20.stop_on_drop = true;
        Ok(md20)
    }

    /// Take over a device without resetting it, keeping whatever it is doing
    pub fn attach(bus: B, config: &DriverConfig) -> Self {
        let mut md20 = Self::build(
            bus,
            config.address,
            *config.firmware.firmware(),
            config.drain_wait(),
        );
        md20.stop_on_drop = config.stop_on_drop;
        md20
    }

    fn build(bus: B, address: u8, firmware: Firmware, wait: DrainWait) -> Self {
        info!(
            "MD20 at 0x{:02X} (firmware layout {})",
            address, firmware.revision
        );
        let channels = std::array::from_fn(|index| Channel::new(index, address, firmware, wait));
        Self {
            bus,
            address,
            firmware,
            channels,
            stop_on_drop: false,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn firmware(&self) -> &Firmware {
        &self.firmware
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn set_stop_on_drop(&mut self, enabled: bool) {
        self.stop_on_drop = enabled;
    }

    // === Identity ===

    pub fn device_id(&mut self) -> Result<u8> {
        let mut id = [0u8; 1];
        self.read(self.firmware.layout.device_id, &mut id)?;
        Ok(id[0])
    }

    pub fn firmware_version(&mut self) -> Result<FirmwareVersion> {
        let mut version = [0u8; 3];
        self.read(self.firmware.layout.firmware_version, &mut version)?;
        Ok(FirmwareVersion {
            major: version[0],
            minor: version[1],
            patch: version[2],
        })
    }

    pub fn name(&mut self) -> Result<String> {
        let mut name = [0u8; NAME_LEN];
        self.read(self.firmware.layout.name, &mut name)?;
        parse_name(&name)
    }

    /// Device id, firmware version and name from one read of the identity region
    pub fn identity(&mut self) -> Result<Identity> {
        let layout = self.firmware.layout;
        let mut region = [0u8; IDENTITY_LEN];
        self.read(layout.device_id, &mut region)?;

        let version = (layout.firmware_version - layout.device_id) as usize;
        let name = (layout.name - layout.device_id) as usize;
        Ok(Identity {
            device_id: region[0],
            name: parse_name(&region[name..name + NAME_LEN])?,
            firmware_version: FirmwareVersion {
                major: region[version],
                minor: region[version + 1],
                patch: region[version + 2],
            },
        })
    }

    // === Channels ===

    /// Controller for channel `index`
    ///
    /// # Panics
    /// If `index >= CHANNEL_COUNT`.
    pub fn motor(&mut self, index: usize) -> Motor<'_, B> {
        assert!(
            index < CHANNEL_COUNT,
            "channel index {index} out of range (0..{CHANNEL_COUNT})"
        );
        Motor::new(&mut self.bus, &self.channels[index])
    }

    pub fn get_motor(&mut self, index: usize) -> Option<Motor<'_, B>> {
        let channel = self.channels.get(index)?;
        Some(Motor::new(&mut self.bus, channel))
    }

    pub fn reset_all(&mut self) -> Result<()> {
        info!("Resetting all channels");
        for channel in &self.channels {
            Motor::new(&mut self.bus, channel).reset()?;
        }
        Ok(())
    }

    pub fn stop_all(&mut self) -> Result<()> {
        info!("Stopping all channels");
        for channel in &self.channels {
            Motor::new(&mut self.bus, channel).stop()?;
        }
        Ok(())
    }

    pub fn telemetry_all(&mut self) -> Result<Vec<Telemetry>> {
        self.channels
            .iter()
            .map(|channel| Motor::new(&mut self.bus, channel).telemetry())
            .collect()
    }

    fn read(&mut self, offset: u8, buf: &mut [u8]) -> Result<()> {
        let address = self.address;
        self.bus
            .read(address, offset, buf)
            .map_err(|source| Md20Error::Transport {
                address,
                offset,
                source,
            })
    }
}

impl<B: RegisterBus> Drop for Md20<B> {
    fn drop(&mut self) {
        if !self.stop_on_drop {
            return;
        }
        // Leave no channel running once the handle is gone
        for channel in &self.channels {
            if let Err(e) = Motor::new(&mut self.bus, channel).stop() {
                warn!("Failed to stop channel {} on drop: {}", channel.index(), e);
            }
        }
    }
}

/// Name bytes are NUL-padded UTF-8
fn parse_name(bytes: &[u8]) -> Result<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let name = std::str::from_utf8(&bytes[..end])?;
    Ok(name.trim_end().to_string())
}
