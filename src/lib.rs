//! Host-side driver for the MD20 four-channel motor controller.
//!
//! The peripheral sits on an I2C bus and exposes a register map with an
//! identity region, a command mailbox and per-channel telemetry blocks.
//! [`motor::Md20`] owns the bus and hands out a [`motor::Motor`] per channel.
//!
//! ```no_run
//! use md20_driver::motor::{I2cTransport, Md20, sim::SimMd20};
//!
//! let mut md20 = Md20::new(I2cTransport::new(SimMd20::new()))?;
//! md20.motor(0).setup_dc_mode()?;
//! md20.motor(0).run_pwm_duty(1023)?;
//! println!("duty = {}", md20.motor(0).pwm_duty()?);
//! # Ok::<(), md20_driver::motor::Md20Error>(())
//! ```

pub mod config;
pub mod messages;
pub mod motor;
pub mod runtime;
