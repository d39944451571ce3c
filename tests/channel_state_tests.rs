use cycler_spoofer::channel::*;
use cycler_spoofer::*;
use std::time::Duration;

const TICK: Duration = Duration::from_millis(100);

fn running_channel() -> Channel {
    let mut channel = Channel::new(0);
    channel.start(SetPoint::constant_current(1.0)).unwrap();
    channel
}

#[test]
fn test_new_channel_is_idle() {
    let channel = Channel::new(7);
    assert_eq!(channel.id(), 7);
    assert_eq!(channel.state(), ChannelState::Idle);
    assert!(channel.set_point().is_none());
    assert_eq!(channel.sequence_counter(), 0);
    assert_eq!(channel.measurement().cycle, 0);
    assert!(channel.active_fault().is_none());
}

#[test]
fn test_start_from_idle_begins_new_test() {
    let mut channel = Channel::new(0);
    let set_point = SetPoint::constant_current(1.5).with_voltage_limit(4.1);
    channel.start(set_point).unwrap();

    assert_eq!(channel.state(), ChannelState::Running);
    assert_eq!(channel.set_point(), Some(&set_point));
    assert_eq!(channel.measurement().cycle, 1);
    assert_eq!(channel.measurement().step, 1);
    assert_eq!(channel.measurement().test_time_ms, 0);
}

#[test]
fn test_start_while_running_is_rejected_without_change() {
    let mut channel = running_channel();
    channel.tick(TICK);
    let before = channel.status();

    let err = channel.start(SetPoint::constant_current(2.0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(channel.status(), before);
}

#[test]
fn test_pause_and_resume_keeps_measurement() {
    let mut channel = running_channel();
    for _ in 0..3 {
        channel.tick(TICK);
    }
    channel.pause().unwrap();
    assert_eq!(channel.state(), ChannelState::Paused);

    // Paused channels do not advance
    let paused = *channel.measurement();
    assert!(!channel.tick(TICK));
    assert_eq!(*channel.measurement(), paused);
    assert_eq!(channel.sequence_counter(), 3);

    // Resuming continues the same test
    channel.start(SetPoint::constant_current(0.5)).unwrap();
    assert_eq!(channel.state(), ChannelState::Running);
    assert_eq!(channel.measurement().cycle, 1);
    assert!(channel.tick(TICK));
    assert!(channel.measurement().capacity_ah > paused.capacity_ah);
    assert_eq!(channel.measurement().test_time_ms, 400);
}

#[test]
fn test_pause_requires_running() {
    let mut channel = Channel::new(0);
    let err = channel.pause().unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::InvalidTransition {
            action: "pause",
            state: ChannelState::Idle,
            ..
        }
    ));

    let mut channel = running_channel();
    channel.pause().unwrap();
    assert_eq!(channel.pause().unwrap_err().kind(), ErrorKind::InvalidTransition);
    assert_eq!(channel.state(), ChannelState::Paused);
}

#[test]
fn test_stop_on_idle_is_a_no_op() {
    let mut channel = running_channel();
    channel.tick(TICK);
    channel.stop().unwrap();
    assert_eq!(channel.state(), ChannelState::Idle);

    let before = channel.status();
    channel.stop().unwrap();
    assert_eq!(channel.status(), before);
}

#[test]
fn test_stop_from_paused() {
    let mut channel = running_channel();
    channel.pause().unwrap();
    channel.stop().unwrap();
    assert_eq!(channel.state(), ChannelState::Idle);
}

#[test]
fn test_restart_after_stop_counts_a_new_cycle() {
    let mut channel = running_channel();
    channel.tick(TICK);
    channel.stop().unwrap();
    channel.start(SetPoint::constant_current(1.0)).unwrap();

    assert_eq!(channel.measurement().cycle, 2);
    assert_eq!(channel.measurement().capacity_ah, 0.0);
    assert_eq!(channel.measurement().test_time_ms, 0);
    // Sequence numbers continue across tests
    assert_eq!(channel.sequence_counter(), 1);
}

#[test]
fn test_faulted_channel_rejects_everything_but_reset() {
    let mut channel = running_channel();
    channel.inject_fault(FaultKind::OverVoltage);
    assert_eq!(channel.state(), ChannelState::Faulted);
    assert_eq!(channel.active_fault(), Some(FaultKind::OverVoltage));

    let start = channel.start(SetPoint::constant_current(1.0)).unwrap_err();
    assert_eq!(start, ProtocolError::ChannelFaulted(0));
    assert_eq!(channel.pause().unwrap_err().kind(), ErrorKind::ChannelFaulted);
    assert_eq!(channel.stop().unwrap_err().kind(), ErrorKind::ChannelFaulted);
    assert!(!channel.tick(TICK));
    assert_eq!(channel.state(), ChannelState::Faulted);

    channel.reset();
    assert_eq!(channel.state(), ChannelState::Idle);
    assert!(channel.active_fault().is_none());
    assert_eq!(channel.fault_log().active().count(), 0);
    assert_eq!(channel.status().fault_count, 1);
    channel.start(SetPoint::constant_current(1.0)).unwrap();
}

#[test]
fn test_fault_can_be_injected_from_any_state() {
    let mut idle = Channel::new(0);
    idle.inject_fault(FaultKind::External);
    assert_eq!(idle.state(), ChannelState::Faulted);

    let mut paused = running_channel();
    paused.pause().unwrap();
    paused.inject_fault(FaultKind::CommunicationLoss);
    assert_eq!(paused.state(), ChannelState::Faulted);

    // A second fault replaces the first
    paused.inject_fault(FaultKind::OverTemperature);
    assert_eq!(paused.active_fault(), Some(FaultKind::OverTemperature));
    assert_eq!(paused.status().fault_count, 2);
}

#[test]
fn test_reset_from_running_returns_to_idle() {
    let mut channel = running_channel();
    channel.tick(TICK);
    channel.reset();
    assert_eq!(channel.state(), ChannelState::Idle);
    assert!(!channel.tick(TICK));
}

#[test]
fn test_sequence_counter_increments_per_running_tick() {
    let mut channel = running_channel();
    for expected in 1..=5 {
        assert!(channel.tick(TICK));
        assert_eq!(channel.sequence_counter(), expected);
    }
}

#[test]
fn test_state_codes_round_trip() {
    for state in [
        ChannelState::Idle,
        ChannelState::Running,
        ChannelState::Paused,
        ChannelState::Faulted,
    ] {
        assert_eq!(ChannelState::from_code(state.code()), Some(state));
    }
    assert_eq!(ChannelState::from_code(9), None);
}

#[test]
fn test_set_point_validation() {
    assert!(SetPoint::constant_current(1.0).validate().is_ok());
    assert!(SetPoint::constant_current(-1.0).validate().is_ok());
    assert!(SetPoint::constant_current(f64::NAN).validate().is_err());
    assert!(SetPoint::constant_current(1.0)
        .with_voltage_limit(0.0)
        .validate()
        .is_err());
    assert!(SetPoint::constant_current(1.0)
        .with_capacity_limit(-0.5)
        .validate()
        .is_err());
}
