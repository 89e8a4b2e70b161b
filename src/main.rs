// md20ctl: command-line control of an MD20 over Linux i2c-dev
//
// Usage: md20ctl [--bus /dev/i2c-1] [--address 0x16] <command>
// Add --simulate to run against the in-process simulated peripheral.

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use md20_driver::config::{DriverConfig, MONITOR_HZ};
use md20_driver::messages::PidGains;
use md20_driver::motor::sim::SimMd20;
use md20_driver::motor::{
    CHANNEL_COUNT, FirmwareRevision, GainTerm, I2cTransport, Md20, PhaseRelation, RegisterBus,
    SetupMode,
};
use md20_driver::runtime::{self, MonitorOptions};

type CliResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "md20ctl", version, about = "Control an MD20 motor driver over I2C")]
struct Cli {
    /// i2c-dev node of the bus
    #[arg(long)]
    bus: Option<String>,

    /// Device address (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_address)]
    address: Option<u8>,

    /// Register layout revision (v1 or v2)
    #[arg(long)]
    firmware: Option<FirmwareRevision>,

    /// JSON file with driver settings; flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Talk to a simulated peripheral instead of hardware
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Print identity and per-channel telemetry
    Info,
    /// Reset one channel, or all of them
    Reset {
        #[arg(long, short, value_parser = channel_parser())]
        channel: Option<u8>,
    },
    /// Configure DC or encoder mode
    Setup(SetupArgs),
    /// Run open-loop at a PWM duty
    Pwm {
        #[arg(long, short, value_parser = channel_parser())]
        channel: u8,
        #[arg(long, allow_negative_numbers = true)]
        duty: i16,
    },
    /// Run closed-loop at a speed in rpm
    Speed {
        #[arg(long, short, value_parser = channel_parser())]
        channel: u8,
        #[arg(long, allow_negative_numbers = true)]
        rpm: i32,
    },
    /// Move to an absolute position
    MoveTo {
        #[arg(long, short, value_parser = channel_parser())]
        channel: u8,
        #[arg(long, allow_negative_numbers = true)]
        position: i32,
        #[arg(long)]
        speed: i32,
        /// Poll state until the position is reached (at most this many polls)
        #[arg(long)]
        wait: Option<usize>,
    },
    /// Move relative to the current position
    Move {
        #[arg(long, short, value_parser = channel_parser())]
        channel: u8,
        #[arg(long, allow_negative_numbers = true)]
        offset: i32,
        #[arg(long)]
        speed: i32,
        #[arg(long)]
        wait: Option<usize>,
    },
    /// Stop one channel, or all of them
    Stop {
        #[arg(long, short, value_parser = channel_parser())]
        channel: Option<u8>,
    },
    /// Set any given PID gains, then print both loops
    Gains(GainArgs),
    /// Poll telemetry at a fixed rate
    Monitor {
        #[arg(long, default_value_t = MONITOR_HZ)]
        hz: u64,
        #[arg(long)]
        count: Option<u64>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct SetupArgs {
    /// Channel to configure; all channels when omitted
    #[arg(long, short, value_parser = channel_parser())]
    channel: Option<u8>,
    /// Plain DC motor without encoder
    #[arg(long, conflicts_with_all = ["ppr", "reduction"])]
    dc: bool,
    /// Encoder pulses per revolution
    #[arg(long, required_unless_present = "dc")]
    ppr: Option<u16>,
    /// Gearbox reduction ratio
    #[arg(long, required_unless_present = "dc")]
    reduction: Option<u16>,
    #[arg(long, value_enum, default_value_t = PhaseArg::A)]
    phase: PhaseArg,
}

#[derive(Args, Debug)]
struct GainArgs {
    #[arg(long, short, value_parser = channel_parser())]
    channel: u8,
    #[arg(long)]
    speed_p: Option<f32>,
    #[arg(long)]
    speed_i: Option<f32>,
    #[arg(long)]
    speed_d: Option<f32>,
    #[arg(long)]
    position_p: Option<f32>,
    #[arg(long)]
    position_i: Option<f32>,
    #[arg(long)]
    position_d: Option<f32>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PhaseArg {
    /// A phase leads
    A,
    /// B phase leads
    B,
}

impl From<PhaseArg> for PhaseRelation {
    fn from(phase: PhaseArg) -> Self {
        match phase {
            PhaseArg::A => PhaseRelation::ALeads,
            PhaseArg::B => PhaseRelation::BLeads,
        }
    }
}

fn channel_parser() -> clap::builder::RangedI64ValueParser<u8> {
    clap::value_parser!(u8).range(0..CHANNEL_COUNT as i64)
}

fn parse_address(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    match parsed {
        Ok(address) if address <= 0x7F => Ok(address),
        Ok(address) => Err(format!("0x{address:02X} is not a 7-bit I2C address")),
        Err(e) => Err(format!("invalid address '{s}': {e}")),
    }
}

fn main() {
    // Setup logging (set RUST_LOG=debug to see every register access)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("md20ctl error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let mut config = match &cli.config {
        Some(path) => DriverConfig::from_json_file(path)?,
        None => DriverConfig::default(),
    };
    if let Some(bus) = cli.bus {
        config.bus = bus;
    }
    if let Some(address) = cli.address {
        config.address = address;
    }
    if let Some(firmware) = cli.firmware {
        config.firmware = firmware;
    }
    // One-shot commands leave the channels doing what they were told
    config.stop_on_drop = false;

    if cli.simulate {
        info!("Using simulated MD20");
        let sim = SimMd20::new()
            .with_address(config.address)
            .with_firmware(*config.firmware.firmware());
        let mut md20 = Md20::attach(I2cTransport::new(sim), &config);
        return execute(&mut md20, cli.command);
    }

    run_hardware(&config, cli.command)
}

#[cfg(target_os = "linux")]
fn run_hardware(config: &DriverConfig, command: CliCommand) -> CliResult<()> {
    info!("Opening I2C bus {}", config.bus);
    let i2c = linux_embedded_hal::I2cdev::new(&config.bus)?;
    let mut md20 = Md20::attach(I2cTransport::new(i2c), config);
    execute(&mut md20, command)
}

#[cfg(not(target_os = "linux"))]
fn run_hardware(_config: &DriverConfig, _command: CliCommand) -> CliResult<()> {
    Err("hardware access needs Linux i2c-dev; use --simulate".into())
}

fn channels(channel: Option<u8>) -> Vec<usize> {
    match channel {
        Some(channel) => vec![channel as usize],
        None => (0..CHANNEL_COUNT).collect(),
    }
}

fn execute<B: RegisterBus>(md20: &mut Md20<B>, command: CliCommand) -> CliResult<()> {
    match command {
        CliCommand::Info => {
            let identity = md20.identity()?;
            println!("device id:        0x{:02X}", identity.device_id);
            println!("name:             {}", identity.name);
            println!("firmware version: {}", identity.firmware_version);
            for t in md20.telemetry_all()? {
                println!(
                    "channel {}: {} speed={} pwm_duty={} position={} pulse_count={}",
                    t.channel, t.state, t.speed, t.pwm_duty, t.position, t.pulse_count
                );
            }
        }
        CliCommand::Reset { channel } => {
            for index in channels(channel) {
                md20.motor(index).reset()?;
                println!("channel {}: {}", index, md20.motor(index).state()?);
            }
        }
        CliCommand::Setup(args) => {
            let mode = match (args.dc, args.ppr, args.reduction) {
                (false, Some(ppr), Some(reduction)) => SetupMode::Encoder {
                    ppr,
                    reduction,
                    phase: args.phase.into(),
                },
                _ => SetupMode::Dc,
            };
            for index in channels(args.channel) {
                md20.motor(index).setup(mode)?;
            }
        }
        CliCommand::Pwm { channel, duty } => {
            let mut motor = md20.motor(channel as usize);
            motor.run_pwm_duty(duty)?;
            println!("channel {}: {} pwm_duty={}", channel, motor.state()?, motor.pwm_duty()?);
        }
        CliCommand::Speed { channel, rpm } => {
            let mut motor = md20.motor(channel as usize);
            motor.run_speed(rpm)?;
            println!("channel {}: {} speed={}", channel, motor.state()?, motor.speed()?);
        }
        CliCommand::MoveTo {
            channel,
            position,
            speed,
            wait,
        } => {
            let mut motor = md20.motor(channel as usize);
            motor.move_to(position, speed)?;
            report_move(&mut motor, wait)?;
        }
        CliCommand::Move {
            channel,
            offset,
            speed,
            wait,
        } => {
            let mut motor = md20.motor(channel as usize);
            motor.move_by(offset, speed)?;
            report_move(&mut motor, wait)?;
        }
        CliCommand::Stop { channel } => {
            for index in channels(channel) {
                md20.motor(index).stop()?;
            }
        }
        CliCommand::Gains(args) => {
            let mut motor = md20.motor(args.channel as usize);
            let speed = [args.speed_p, args.speed_i, args.speed_d];
            let position = [args.position_p, args.position_i, args.position_d];
            for (term, value) in GainTerm::ALL.into_iter().zip(speed) {
                if let Some(value) = value {
                    motor.set_speed_gain(term, value)?;
                }
            }
            for (term, value) in GainTerm::ALL.into_iter().zip(position) {
                if let Some(value) = value {
                    motor.set_position_gain(term, value)?;
                }
            }
            print_pid("speed", motor.speed_pid()?);
            print_pid("position", motor.position_pid()?);
        }
        CliCommand::Monitor { hz, count, json } => {
            let options = MonitorOptions { hz, count, json };
            runtime::run(md20, options, &mut std::io::stdout().lock())?;
        }
    }
    Ok(())
}

fn report_move<B: RegisterBus>(
    motor: &mut md20_driver::motor::Motor<'_, B>,
    wait: Option<usize>,
) -> CliResult<()> {
    let state = match wait {
        Some(max_polls) => motor.wait_until_reached(max_polls)?,
        None => motor.state()?,
    };
    println!(
        "channel {}: {} position={}",
        motor.index(),
        state,
        motor.position()?
    );
    Ok(())
}

fn print_pid(name: &str, gains: PidGains) {
    println!("{name:>8} pid: p={:.2} i={:.2} d={:.2}", gains.p, gains.i, gains.d);
}
