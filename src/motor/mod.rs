// Motor control module for the MD20 four-channel driver
//
// Provides:
// - Register map and firmware revision tables
// - Bus transport trait and embedded-hal I2C adapter
// - Command record encoding and the per-channel protocol engine
// - Device handle owning the four channels
// - Simulated peripheral for tests and dry runs

pub mod bus;
mod channel;
mod device;
pub mod protocol;
pub mod registers;
pub mod sim;

pub use bus::{I2cTransport, RegisterBus, TransportError};
pub use channel::{Channel, DrainWait, Motor};
pub use device::Md20;
pub use protocol::{
    Command, GainLoop, GainTerm, Md20Error, MotorState, PhaseRelation, Result, SetupMode,
};
pub use registers::{CHANNEL_COUNT, Firmware, FirmwareRevision, RegisterLayout, TelemetryField};
