// Fixed-rate telemetry monitor
// Polls every channel each tick and writes one line per channel, either
// human-readable or as JSON. State changes are logged as they are observed,
// including the REACHED_POSITION transition the peripheral makes on its own.

use std::io::Write;
use std::thread::sleep;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::MONITOR_HZ;
use crate::messages::Telemetry;
use crate::motor::{CHANNEL_COUNT, Md20, MotorState, RegisterBus};

#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    pub hz: u64,
    /// Stop after this many ticks; `None` runs until an error
    pub count: Option<u64>,
    pub json: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            hz: MONITOR_HZ,
            count: None,
            json: false,
        }
    }
}

/// Remembers the last state per channel so transitions are logged once
pub struct Monitor {
    last_states: [Option<MotorState>; CHANNEL_COUNT],
    ticks: u64,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            last_states: [None; CHANNEL_COUNT],
            ticks: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Record a tick's telemetry and return the channels whose state changed
    fn on_telemetry(
        &mut self,
        telemetry: &[Telemetry],
    ) -> Vec<(u8, Option<MotorState>, MotorState)> {
        self.ticks += 1;
        let mut changes = Vec::new();
        for t in telemetry {
            let slot = &mut self.last_states[t.channel as usize];
            if *slot != Some(t.state) {
                changes.push((t.channel, *slot, t.state));
                *slot = Some(t.state);
            }
        }
        changes
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

fn format_line(t: &Telemetry) -> String {
    format!(
        "channel {}: state={:<20} speed={:6} pwm_duty={:6} position={:9} pulse_count={:9}",
        t.channel,
        t.state.to_string(),
        t.speed,
        t.pwm_duty,
        t.position,
        t.pulse_count
    )
}

pub fn run<B: RegisterBus, W: Write>(
    md20: &mut Md20<B>,
    options: MonitorOptions,
    out: &mut W,
) -> Result<Monitor, Box<dyn std::error::Error + Send + Sync>> {
    let period = Duration::from_micros(1_000_000 / options.hz.max(1));
    let mut monitor = Monitor::new();

    info!(
        "Monitoring MD20 at 0x{:02X}: {}Hz{}",
        md20.address(),
        options.hz.max(1),
        options
            .count
            .map(|c| format!(", {} ticks", c))
            .unwrap_or_default()
    );

    let mut next_tick = Instant::now();
    while options.count.is_none_or(|count| monitor.ticks() < count) {
        let telemetry = md20.telemetry_all()?;

        for (channel, from, to) in monitor.on_telemetry(&telemetry) {
            match from {
                Some(from) => info!("Channel {} state: {} -> {}", channel, from, to),
                None => info!("Channel {} state: {}", channel, to),
            }
        }

        for t in &telemetry {
            if options.json {
                serde_json::to_writer(&mut *out, t)?;
                writeln!(out)?;
            } else {
                writeln!(out, "{}", format_line(t))?;
            }
        }
        out.flush()?;

        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    Ok(monitor)
}
