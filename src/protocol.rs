//! JSON command schema.
//!
//! Requests are single-line JSON objects:
//!
//! ```text
//! {"type":"start","channel_id":3,"parameters":{"current_a":1.0}}
//! ```
//!
//! Responses carry a `result` field. On failure `result` holds a human
//! readable message and `error` the [`ErrorKind`] name.

use crate::channel::{ChannelId, ChannelState, ChannelStatus, FaultKind, SetPoint};
use crate::error::{ErrorKind, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const MAX_COMMAND_SIZE: usize = 4096;

pub const CMD_READ_SYSTEM_INFO: &str = "read_system_info";
pub const CMD_START: &str = "start";
pub const CMD_PAUSE: &str = "pause";
pub const CMD_STOP: &str = "stop";
pub const CMD_RESET: &str = "reset";
pub const CMD_INJECT_FAULT: &str = "inject_fault";
pub const CMD_READ_MEASUREMENT: &str = "read_measurement";

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    Start(SetPoint),
    Pause,
    Stop,
    /// The only command that clears a fault.
    Reset,
    /// Accepted in every state, so a faulted channel can pick up further
    /// faults; each one is recorded in the channel's fault log.
    InjectFault(FaultKind),
    /// Read-only and accepted in every state. A faulted channel still
    /// reports its status so clients can see which fault tripped it.
    ReadMeasurement,
}

impl ChannelCommand {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelCommand::Start(_) => CMD_START,
            ChannelCommand::Pause => CMD_PAUSE,
            ChannelCommand::Stop => CMD_STOP,
            ChannelCommand::Reset => CMD_RESET,
            ChannelCommand::InjectFault(_) => CMD_INJECT_FAULT,
            ChannelCommand::ReadMeasurement => CMD_READ_MEASUREMENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Instrument-wide query. A `channel_id` is accepted but not required.
    ReadSystemInfo { channel_id: Option<ChannelId> },
    Channel {
        channel_id: ChannelId,
        command: ChannelCommand,
    },
}

impl Command {
    pub fn channel(channel_id: ChannelId, command: ChannelCommand) -> Self {
        Command::Channel {
            channel_id,
            command,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Command::ReadSystemInfo { .. } => CMD_READ_SYSTEM_INFO,
            Command::Channel { command, .. } => command.type_name(),
        }
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            Command::ReadSystemInfo { channel_id } => *channel_id,
            Command::Channel { channel_id, .. } => Some(*channel_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub idle: u16,
    pub running: u16,
    pub paused: u16,
    pub faulted: u16,
}

impl ChannelSummary {
    pub fn count(&mut self, state: ChannelState) {
        let slot = match state {
            ChannelState::Idle => &mut self.idle,
            ChannelState::Running => &mut self.running,
            ChannelState::Paused => &mut self.paused,
            ChannelState::Faulted => &mut self.faulted,
        };
        *slot = slot.saturating_add(1);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub num_channels: u16,
    pub json_port: u16,
    pub tcp_port: u16,
    pub msg_buffer_size_bytes: usize,
    pub channels: ChannelSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAck {
    pub channel_id: ChannelId,
    pub state: ChannelState,
}

/// Successful result of a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandOutcome {
    Ack(ChannelAck),
    Status(ChannelStatus),
    SystemInfo(SystemInfo),
}

/// Decoded response as seen by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

#[derive(Deserialize)]
struct WireCommand {
    #[serde(rename = "type")]
    command_type: String,
    #[serde(default)]
    channel_id: Option<i64>,
    #[serde(default)]
    parameters: Option<Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FaultParameters {
    #[serde(default)]
    fault: FaultKind,
}

/// Decodes requests against an instrument with a fixed channel count.
#[derive(Debug, Clone, Copy)]
pub struct CommandCodec {
    num_channels: u16,
}

impl CommandCodec {
    pub fn new(num_channels: u16) -> Self {
        Self { num_channels }
    }

    pub fn decode_command(&self, bytes: &[u8]) -> Result<Command, ProtocolError> {
        if bytes.len() > MAX_COMMAND_SIZE {
            return Err(ProtocolError::malformed(format!(
                "message of {} bytes exceeds the {MAX_COMMAND_SIZE} byte limit",
                bytes.len()
            )));
        }

        let wire: WireCommand = serde_json::from_slice(bytes).map_err(ProtocolError::malformed)?;

        let kind = wire.command_type.as_str();
        if kind == CMD_READ_SYSTEM_INFO {
            let channel_id = wire
                .channel_id
                .map(|id| self.check_channel(id))
                .transpose()?;
            return Ok(Command::ReadSystemInfo { channel_id });
        }

        // Type is checked before channel so an unknown command is reported
        // as such even when its channel is also bad.
        if !matches!(
            kind,
            CMD_START | CMD_PAUSE | CMD_STOP | CMD_RESET | CMD_INJECT_FAULT | CMD_READ_MEASUREMENT
        ) {
            return Err(ProtocolError::UnknownCommandType(wire.command_type));
        }

        let raw_id = wire
            .channel_id
            .ok_or_else(|| ProtocolError::malformed(format!("`{kind}` requires a channel_id")))?;
        let channel_id = self.check_channel(raw_id)?;

        let command = match kind {
            CMD_START => {
                let parameters = wire.parameters.ok_or_else(|| {
                    ProtocolError::malformed("`start` requires set-point parameters")
                })?;
                let set_point: SetPoint =
                    serde_json::from_value(parameters).map_err(ProtocolError::malformed)?;
                set_point.validate().map_err(ProtocolError::malformed)?;
                ChannelCommand::Start(set_point)
            }
            CMD_INJECT_FAULT => {
                let fault = match wire.parameters {
                    None | Some(Value::Null) => FaultKind::default(),
                    Some(parameters) => {
                        serde_json::from_value::<FaultParameters>(parameters)
                            .map_err(ProtocolError::malformed)?
                            .fault
                    }
                };
                ChannelCommand::InjectFault(fault)
            }
            CMD_PAUSE => ChannelCommand::Pause,
            CMD_STOP => ChannelCommand::Stop,
            CMD_RESET => ChannelCommand::Reset,
            _ => ChannelCommand::ReadMeasurement,
        };

        Ok(Command::channel(channel_id, command))
    }

    fn check_channel(&self, raw_id: i64) -> Result<ChannelId, ProtocolError> {
        ChannelId::try_from(raw_id)
            .ok()
            .filter(|id| *id < self.num_channels)
            .ok_or(ProtocolError::InvalidChannel {
                channel_id: raw_id,
                num_channels: self.num_channels,
            })
    }
}

pub fn encode_command(command: &Command) -> String {
    let mut object = Map::new();
    object.insert("type".into(), Value::from(command.type_name()));
    if let Some(channel_id) = command.channel_id() {
        object.insert("channel_id".into(), Value::from(channel_id));
    }

    let parameters = match command {
        Command::Channel {
            command: ChannelCommand::Start(set_point),
            ..
        } => serde_json::to_value(set_point).unwrap_or_default(),
        Command::Channel {
            command: ChannelCommand::InjectFault(fault),
            ..
        } => json!({ "fault": fault }),
        _ => Value::Object(Map::new()),
    };
    object.insert("parameters".into(), parameters);

    Value::Object(object).to_string()
}

pub fn encode_response(command: &Command, outcome: &Result<CommandOutcome, ProtocolError>) -> String {
    let response = match outcome {
        Ok(result) => json!({
            "type": command.type_name(),
            "result": result,
        }),
        Err(error) => json!({
            "type": command.type_name(),
            "result": error.to_string(),
            "error": error.kind(),
        }),
    };
    response.to_string()
}

/// Response for input that never became a [`Command`].
pub fn encode_error_response(error: &ProtocolError) -> String {
    json!({
        "result": error.to_string(),
        "error": error.kind(),
    })
    .to_string()
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, ProtocolError> {
    serde_json::from_slice(bytes).map_err(ProtocolError::malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_bounds() {
        let codec = CommandCodec::new(4);
        assert_eq!(codec.check_channel(3), Ok(3));
        assert!(codec.check_channel(4).is_err());
        assert!(codec.check_channel(-1).is_err());
        assert!(codec.check_channel(i64::from(u16::MAX) + 1).is_err());
    }
}
