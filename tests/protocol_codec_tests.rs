use cycler_spoofer::channel::ScheduleName;
use cycler_spoofer::protocol::*;
use cycler_spoofer::*;
use serde_json::{json, Value};

const NUM_CHANNELS: u16 = 8;

fn codec() -> CommandCodec {
    CommandCodec::new(NUM_CHANNELS)
}

fn decode(text: &str) -> Result<Command, ProtocolError> {
    codec().decode_command(text.as_bytes())
}

#[test]
fn test_decode_start_with_set_point() {
    let command = decode(
        r#"{"type":"start","channel_id":3,"parameters":{"current_a":1.0,"voltage_limit_v":4.2}}"#,
    )
    .unwrap();
    assert_eq!(
        command,
        Command::channel(
            3,
            ChannelCommand::Start(SetPoint::constant_current(1.0).with_voltage_limit(4.2))
        )
    );
}

#[test]
fn test_decode_simple_channel_commands() {
    let cases = [
        ("pause", ChannelCommand::Pause),
        ("stop", ChannelCommand::Stop),
        ("reset", ChannelCommand::Reset),
        ("read_measurement", ChannelCommand::ReadMeasurement),
    ];
    for (name, expected) in cases {
        let text = format!(r#"{{"type":"{name}","channel_id":1}}"#);
        assert_eq!(decode(&text).unwrap(), Command::channel(1, expected));
    }
}

#[test]
fn test_decode_inject_fault_defaults_to_external() {
    assert_eq!(
        decode(r#"{"type":"inject_fault","channel_id":2}"#).unwrap(),
        Command::channel(2, ChannelCommand::InjectFault(FaultKind::External))
    );
    assert_eq!(
        decode(r#"{"type":"inject_fault","channel_id":2,"parameters":{"fault":"over_current"}}"#)
            .unwrap(),
        Command::channel(2, ChannelCommand::InjectFault(FaultKind::OverCurrent))
    );
}

#[test]
fn test_decode_system_info_channel_is_optional() {
    assert_eq!(
        decode(r#"{"type":"read_system_info"}"#).unwrap(),
        Command::ReadSystemInfo { channel_id: None }
    );
    assert_eq!(
        decode(r#"{"type":"read_system_info","channel_id":0}"#).unwrap(),
        Command::ReadSystemInfo {
            channel_id: Some(0)
        }
    );
    assert_eq!(
        decode(r#"{"type":"read_system_info","channel_id":8}"#)
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidChannel
    );
}

#[test]
fn test_channel_equal_to_count_is_invalid() {
    let err = decode(r#"{"type":"pause","channel_id":8}"#).unwrap_err();
    assert_eq!(
        err,
        ProtocolError::InvalidChannel {
            channel_id: 8,
            num_channels: NUM_CHANNELS
        }
    );
    assert_eq!(
        decode(r#"{"type":"pause","channel_id":-1}"#).unwrap_err().kind(),
        ErrorKind::InvalidChannel
    );
}

#[test]
fn test_unknown_type_is_reported_before_channel() {
    let err = decode(r#"{"type":"self_destruct","channel_id":99}"#).unwrap_err();
    assert_eq!(err, ProtocolError::UnknownCommandType("self_destruct".into()));
}

#[test]
fn test_malformed_inputs() {
    let cases = [
        "not json",
        "{}",
        r#"{"type":5}"#,
        r#"{"type":"pause"}"#,
        r#"{"type":"start","channel_id":1}"#,
        r#"{"type":"start","channel_id":1,"parameters":{"voltage_limit_v":4.2}}"#,
        r#"{"type":"start","channel_id":1,"parameters":{"current_a":1.0,"bogus":1}}"#,
        r#"{"type":"start","channel_id":1,"parameters":{"current_a":1.0,"capacity_limit_ah":0}}"#,
        r#"{"type":"inject_fault","channel_id":1,"parameters":{"fault":"meltdown"}}"#,
    ];
    for text in cases {
        let err = decode(text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage, "input: {text}");
    }
}

#[test]
fn test_oversized_message_is_malformed() {
    let padding = "x".repeat(MAX_COMMAND_SIZE);
    let text = format!(r#"{{"type":"pause","channel_id":1,"pad":"{padding}"}}"#);
    assert_eq!(decode(&text).unwrap_err().kind(), ErrorKind::MalformedMessage);
}

#[test]
fn test_encode_then_decode_returns_the_same_command() {
    let schedule = ScheduleName::from("formation").unwrap();
    let commands = [
        Command::ReadSystemInfo { channel_id: None },
        Command::ReadSystemInfo {
            channel_id: Some(4),
        },
        Command::channel(
            0,
            ChannelCommand::Start(
                SetPoint::constant_current(-0.75)
                    .with_voltage_limit(4.15)
                    .with_capacity_limit(1.25)
                    .with_schedule(schedule),
            ),
        ),
        Command::channel(7, ChannelCommand::Pause),
        Command::channel(6, ChannelCommand::Stop),
        Command::channel(5, ChannelCommand::Reset),
        Command::channel(4, ChannelCommand::InjectFault(FaultKind::OverTemperature)),
        Command::channel(3, ChannelCommand::ReadMeasurement),
    ];
    for command in commands {
        let encoded = encode_command(&command);
        assert_eq!(decode(&encoded).unwrap(), command, "wire: {encoded}");
    }
}

#[test]
fn test_success_response_shape() {
    let command = Command::channel(3, ChannelCommand::Pause);
    let outcome = Ok(CommandOutcome::Ack(ChannelAck {
        channel_id: 3,
        state: ChannelState::Paused,
    }));
    let text = encode_response(&command, &outcome);

    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(
        value,
        json!({"type": "pause", "result": {"channel_id": 3, "state": "Paused"}})
    );

    let response = decode_response(text.as_bytes()).unwrap();
    assert_eq!(response.command_type.as_deref(), Some("pause"));
    assert!(response.error.is_none());
}

#[test]
fn test_error_response_carries_kind_and_message() {
    let command = Command::channel(3, ChannelCommand::Pause);
    let error = ProtocolError::InvalidTransition {
        channel_id: 3,
        action: "pause",
        state: ChannelState::Idle,
    };
    let text = encode_response(&command, &Err(error.clone()));

    let response = decode_response(text.as_bytes()).unwrap();
    assert_eq!(response.error, Some(ErrorKind::InvalidTransition));
    assert_eq!(response.result, Value::String(error.to_string()));
    assert_eq!(response.result, "cannot pause channel 3 while Idle");
}

#[test]
fn test_undecodable_request_response_has_no_type() {
    let text = encode_error_response(&ProtocolError::UnknownCommandType("warp".into()));
    let response = decode_response(text.as_bytes()).unwrap();
    assert!(response.command_type.is_none());
    assert_eq!(response.error, Some(ErrorKind::UnknownCommandType));
}

#[test]
fn test_summary_counts_states() {
    let mut summary = ChannelSummary::default();
    for state in [
        ChannelState::Idle,
        ChannelState::Idle,
        ChannelState::Running,
        ChannelState::Faulted,
    ] {
        summary.count(state);
    }
    assert_eq!(
        summary,
        ChannelSummary {
            idle: 2,
            running: 1,
            paused: 0,
            faulted: 1
        }
    );
}
