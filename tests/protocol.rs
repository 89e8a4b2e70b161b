// End-to-end protocol tests against the simulated MD20
use std::time::Duration;

use md20_driver::config::DriverConfig;
use md20_driver::messages::PidGains;
use md20_driver::motor::sim::{BusOp, SIM_DEVICE_ID, SimMd20};
use md20_driver::motor::{
    CHANNEL_COUNT, DrainWait, Firmware, GainTerm, I2cTransport, Md20, Md20Error, MotorState,
    PhaseRelation, SetupMode, TelemetryField,
};

type SimDevice = Md20<I2cTransport<SimMd20>>;

const EXECUTE: u8 = 0x23;
const MAILBOX: u8 = 0x11;

fn device() -> SimDevice {
    Md20::new(I2cTransport::new(SimMd20::new())).unwrap()
}

fn device_with(sim: SimMd20) -> SimDevice {
    Md20::new(I2cTransport::new(sim)).unwrap()
}

fn sim(md20: &SimDevice) -> &SimMd20 {
    md20.bus().inner()
}

fn clear_log(md20: &mut SimDevice) {
    md20.bus_mut().inner_mut().clear_log();
}

fn read(offset: u8, bytes: &[u8]) -> BusOp {
    BusOp::Read {
        offset,
        bytes: bytes.to_vec(),
    }
}

fn write(offset: u8, bytes: &[u8]) -> BusOp {
    BusOp::Write {
        offset,
        bytes: bytes.to_vec(),
    }
}

#[test]
fn test_construction_resets_every_channel() {
    let md20 = device();
    let resets: Vec<BusOp> = sim(&md20)
        .log()
        .iter()
        .filter(|op| matches!(op, BusOp::Write { offset: MAILBOX, .. }))
        .cloned()
        .collect();
    let expected: Vec<BusOp> = (0..CHANNEL_COUNT as u8)
        .map(|index| write(MAILBOX, &[2, index]))
        .collect();
    assert_eq!(resets, expected);
}

#[test]
fn test_command_sequence_order() {
    let mut md20 = device();
    clear_log(&mut md20);

    md20.motor(3).run_speed(-90).unwrap();

    let mut record = vec![13, 3];
    record.extend_from_slice(&(-90i32).to_le_bytes());
    assert_eq!(
        sim(&md20).log(),
        &[
            read(EXECUTE, &[0]),
            write(MAILBOX, &record),
            write(EXECUTE, &[1]),
            read(EXECUTE, &[0]),
        ]
    );
}

#[test]
fn test_record_not_written_until_flag_clears() {
    let md20 = device_with(SimMd20::new().with_flag_raised(3));
    let log = sim(&md20).log();

    assert_eq!(
        &log[..5],
        &[
            read(EXECUTE, &[1]),
            read(EXECUTE, &[1]),
            read(EXECUTE, &[1]),
            read(EXECUTE, &[0]),
            write(MAILBOX, &[2, 0]),
        ]
    );
}

#[test]
fn test_call_returns_after_peripheral_drains() {
    let mut md20 = device_with(SimMd20::new().with_busy_polls(5));
    md20.motor(1).run_pwm_duty(300).unwrap();

    // The command has been consumed by the time the call returns
    assert_eq!(sim(&md20).channel(1).pwm_duty, 300);
    assert_eq!(sim(&md20).memory()[EXECUTE as usize], 0);
    let busy_reads = sim(&md20)
        .log()
        .iter()
        .filter(|op| **op == read(EXECUTE, &[1]))
        .count();
    assert_eq!(busy_reads, 5 * (CHANNEL_COUNT + 1));
}

#[test]
fn test_move_to_record_bytes() {
    let mut md20 = device();
    clear_log(&mut md20);

    md20.motor(0).move_to(5000, 90).unwrap();

    assert!(sim(&md20).log().contains(&write(
        MAILBOX,
        &[14, 0, 0x88, 0x13, 0x00, 0x00, 0x5A, 0x00, 0x00, 0x00]
    )));
}

#[test]
fn test_telemetry_read_refreshes_then_reads() {
    let mut md20 = device();
    md20.motor(2).run_speed(120).unwrap();
    clear_log(&mut md20);

    let speed = md20.motor(2).speed().unwrap();

    let offset = Firmware::V2.layout.field(TelemetryField::Speed, 2);
    assert_eq!(speed, 120);
    assert_eq!(
        sim(&md20).log(),
        &[write(offset, &[0]), read(offset, &120i32.to_le_bytes())]
    );
}

#[test]
fn test_each_field_uses_its_own_offset() {
    let mut md20 = device();
    let layout = Firmware::V2.layout;

    clear_log(&mut md20);
    md20.motor(1).pwm_duty().unwrap();
    md20.motor(1).pulse_count().unwrap();
    md20.motor(1).state().unwrap();

    let offsets: Vec<u8> = sim(&md20)
        .log()
        .iter()
        .map(|op| match op {
            BusOp::Write { offset, .. } | BusOp::Read { offset, .. } => *offset,
        })
        .collect();
    let pwm = layout.field(TelemetryField::PwmDuty, 1);
    let pulses = layout.field(TelemetryField::PulseCount, 1);
    let state = layout.field(TelemetryField::State, 1);
    assert_eq!(offsets, vec![pwm, pwm, pulses, pulses, state, state]);
}

#[test]
fn test_reset_returns_to_idle_from_any_state() {
    let mut md20 = device();
    let mut motor = md20.motor(0);

    motor.run_pwm_duty(700).unwrap();
    assert_eq!(motor.state().unwrap(), MotorState::RunningWithPwmDuty);
    motor.reset().unwrap();
    assert_eq!(motor.state().unwrap(), MotorState::Idle);

    motor.run_speed(60).unwrap();
    assert_eq!(motor.state().unwrap(), MotorState::RunningWithSpeed);
    motor.reset().unwrap();
    assert_eq!(motor.state().unwrap(), MotorState::Idle);

    motor.move_to(1000, 30).unwrap();
    assert_eq!(motor.state().unwrap(), MotorState::RunningToPosition);
    motor.reset().unwrap();
    assert_eq!(motor.state().unwrap(), MotorState::Idle);
}

#[test]
fn test_pwm_duty_reversal() {
    let mut md20 = device();
    md20.motor(0).setup_dc_mode().unwrap();
    let mut motor = md20.motor(0);

    motor.run_pwm_duty(1023).unwrap();
    assert_eq!(motor.state().unwrap(), MotorState::RunningWithPwmDuty);
    assert_eq!(motor.pwm_duty().unwrap(), 1023);

    motor.run_pwm_duty(-1023).unwrap();
    assert_eq!(motor.state().unwrap(), MotorState::RunningWithPwmDuty);
    assert_eq!(motor.pwm_duty().unwrap(), -1023);
}

#[test]
fn test_move_reaches_position() {
    let mut md20 = device_with(SimMd20::new().with_settle_polls(3));
    let mut motor = md20.motor(1);

    motor.setup_encoder_mode(12, 90, PhaseRelation::ALeads).unwrap();
    motor.move_to(5000, 90).unwrap();
    assert_eq!(motor.state().unwrap(), MotorState::RunningToPosition);
    assert_eq!(
        motor.wait_until_reached(10).unwrap(),
        MotorState::ReachedPosition
    );
    assert_eq!(motor.position().unwrap(), 5000);

    motor.move_by(-1000, 30).unwrap();
    assert_eq!(
        motor.wait_until_reached(10).unwrap(),
        MotorState::ReachedPosition
    );
    assert_eq!(motor.position().unwrap(), 4000);

    motor.stop().unwrap();
    assert_eq!(motor.state().unwrap(), MotorState::Idle);
}

#[test]
fn test_wait_until_reached_gives_up() {
    let mut md20 = device_with(SimMd20::new().with_settle_polls(50));
    let mut motor = md20.motor(0);
    motor.move_to(10, 5).unwrap();
    assert_eq!(
        motor.wait_until_reached(3).unwrap(),
        MotorState::RunningToPosition
    );
}

#[test]
fn test_setup_and_counters() {
    let mut md20 = device();
    let mut motor = md20.motor(2);
    motor.setup_encoder_mode(12, 90, PhaseRelation::BLeads).unwrap();
    motor.set_current_position(-250).unwrap();
    motor.set_pulse_count(4096).unwrap();

    assert_eq!(motor.position().unwrap(), -250);
    assert_eq!(motor.pulse_count().unwrap(), 4096);
    assert_eq!(
        sim(&md20).channel(2).setup,
        Some(SetupMode::Encoder {
            ppr: 12,
            reduction: 90,
            phase: PhaseRelation::BLeads
        })
    );
}

#[test]
fn test_pid_gains_round_trip() {
    let mut md20 = device();
    let mut motor = md20.motor(0);

    motor.set_speed_pid(PidGains::new(1.5, 1.5, 1.0)).unwrap();
    motor.set_position_pid(PidGains::new(10.0, 1.0, 1.0)).unwrap();
    motor.set_speed_gain(GainTerm::D, 0.25).unwrap();

    assert_eq!(motor.speed_pid().unwrap(), PidGains::new(1.5, 1.5, 0.25));
    assert_eq!(motor.position_pid().unwrap(), PidGains::new(10.0, 1.0, 1.0));
    assert_eq!(motor.position_gain(GainTerm::P).unwrap(), 10.0);
    assert_eq!(sim(&md20).channel(0).gains, [150, 150, 25, 1000, 100, 100]);
}

#[test]
fn test_gain_out_of_range_sends_nothing() {
    let mut md20 = device();
    clear_log(&mut md20);

    let err = md20.motor(0).set_speed_gain(GainTerm::P, 700.0).unwrap_err();
    assert!(matches!(err, Md20Error::GainOutOfRange { .. }));

    let err = md20
        .motor(0)
        .set_position_pid(PidGains::new(1.0, -2.0, 1.0))
        .unwrap_err();
    assert!(matches!(err, Md20Error::GainOutOfRange { .. }));

    assert!(sim(&md20).log().is_empty());
}

#[test]
fn test_identity() {
    let mut sim = SimMd20::new();
    sim.set_identity(0x5A, "MD20-X", [2, 3, 4]);
    let mut md20 = device_with(sim);

    assert_eq!(md20.device_id().unwrap(), 0x5A);
    assert_eq!(md20.name().unwrap(), "MD20-X");
    assert_eq!(md20.firmware_version().unwrap().to_string(), "2.3.4");

    clear_log(&mut md20);
    let identity = md20.identity().unwrap();
    assert_eq!(identity.device_id, 0x5A);
    assert_eq!(identity.name, "MD20-X");
    assert_eq!(identity.firmware_version.to_string(), "2.3.4");

    // One read, no refresh or drain traffic
    let log = sim_log(&md20);
    assert_eq!(log.len(), 1);
    assert!(matches!(&log[0], BusOp::Read { offset: 0, bytes } if bytes.len() == 12));
}

fn sim_log(md20: &SimDevice) -> Vec<BusOp> {
    sim(md20).log().to_vec()
}

#[test]
fn test_default_identity() {
    let mut md20 = device();
    assert_eq!(md20.device_id().unwrap(), SIM_DEVICE_ID);
}

#[test]
fn test_stall_is_reported() {
    let config = DriverConfig {
        drain_timeout_ms: Some(20),
        stop_on_drop: false,
        ..DriverConfig::default()
    };
    let mut md20 = Md20::with_config(I2cTransport::new(SimMd20::new()), &config).unwrap();
    md20.bus_mut().inner_mut().set_stalled(true);

    let err = md20.motor(1).run_speed(10).unwrap_err();
    match err {
        Md20Error::Stall {
            channel,
            offset,
            waited,
        } => {
            assert_eq!(channel, 1);
            assert_eq!(offset, EXECUTE);
            assert!(waited >= Duration::from_millis(20));
        }
        other => panic!("expected stall, got {other:?}"),
    }
}

#[test]
fn test_transport_failure_propagates() {
    let result = Md20::new(I2cTransport::new(SimMd20::new().with_address(0x17)));
    match result {
        Err(Md20Error::Transport {
            address, offset, ..
        }) => {
            assert_eq!(address, 0x16);
            assert_eq!(offset, EXECUTE);
        }
        Err(other) => panic!("expected transport error, got {other:?}"),
        Ok(_) => panic!("expected transport error"),
    }
}

#[test]
fn test_drop_stops_running_channels() {
    let mut sim = SimMd20::new();
    {
        let mut md20 = Md20::new(I2cTransport::new(&mut sim)).unwrap();
        md20.motor(0).run_speed(90).unwrap();
        md20.motor(3).run_pwm_duty(-400).unwrap();
    }
    assert_eq!(sim.channel(0).state, MotorState::Idle);
    assert_eq!(sim.channel(3).state, MotorState::Idle);
    assert_eq!(sim.channel(3).pwm_duty, 0);
}

#[test]
fn test_attach_keeps_running_state() {
    let mut sim = SimMd20::new();
    {
        let mut md20 = Md20::new(I2cTransport::new(&mut sim)).unwrap();
        md20.set_stop_on_drop(false);
        md20.motor(2).run_speed(45).unwrap();
    }

    let config = DriverConfig::default();
    let mut md20 = Md20::attach(I2cTransport::new(&mut sim), &config);
    md20.set_stop_on_drop(false);
    assert_eq!(md20.motor(2).state().unwrap(), MotorState::RunningWithSpeed);
    assert_eq!(md20.motor(2).speed().unwrap(), 45);
}

#[test]
fn test_channel_bounds() {
    let mut md20 = device();
    assert!(md20.get_motor(3).is_some());
    assert!(md20.get_motor(CHANNEL_COUNT).is_none());
}

#[test]
#[should_panic(expected = "out of range")]
fn test_motor_index_out_of_range_panics() {
    let mut md20 = device();
    md20.set_stop_on_drop(false);
    let _ = md20.motor(4);
}

#[test]
fn test_stop_all_and_telemetry_all() {
    let mut md20 = device();
    for index in 0..CHANNEL_COUNT {
        md20.motor(index).run_speed(10 * index as i32).unwrap();
    }
    let telemetry = md20.telemetry_all().unwrap();
    assert_eq!(telemetry.len(), CHANNEL_COUNT);
    assert!(
        telemetry
            .iter()
            .all(|t| t.state == MotorState::RunningWithSpeed)
    );
    assert_eq!(telemetry[3].speed, 30);

    md20.stop_all().unwrap();
    assert!(
        md20.telemetry_all()
            .unwrap()
            .iter()
            .all(|t| t.state == MotorState::Idle && t.speed == 0)
    );
}

#[test]
fn test_legacy_layout() {
    let legacy = SimMd20::new().with_firmware(Firmware::V1);
    let mut md20 = Md20::with_firmware(
        I2cTransport::new(legacy),
        0x16,
        Firmware::V1,
        DrainWait::default(),
    )
    .unwrap();
    clear_log(&mut md20);

    md20.motor(2).run_pwm_duty(1023).unwrap();
    let mailbox = Firmware::V1.layout.mailbox(2);
    assert_eq!(
        sim(&md20).log(),
        &[
            read(mailbox, &[0]),
            write(mailbox, &[12, 0xFF, 0x03]),
            read(mailbox, &[0]),
        ]
    );

    // Legacy telemetry is read directly, without a refresh write
    clear_log(&mut md20);
    assert_eq!(md20.motor(2).pwm_duty().unwrap(), 1023);
    let offset = Firmware::V1.layout.field(TelemetryField::PwmDuty, 2);
    assert_eq!(sim(&md20).log(), &[read(offset, &1023i16.to_le_bytes())]);

    md20.motor(2).reset().unwrap();
    assert_eq!(md20.motor(2).state().unwrap(), MotorState::Idle);
}
