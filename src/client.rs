//! Async client for the cycler's two transports.

use crate::channel::{ChannelId, ChannelStatus, FaultKind, SetPoint};
use crate::config::CyclerInterfaceConfig;
use crate::error::{ClientError, ProtocolError};
use crate::protocol::{
    decode_response, encode_command, ChannelAck, ChannelCommand, Command, Response, SystemInfo,
};
use crate::telemetry::{
    encode_subscription, FrameDecoder, SequenceCheck, SequenceTracker, Subscription,
    TelemetryFrame,
};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Connection to one instrument. Requests take `&mut self`, so at most one
/// command is outstanding at a time.
pub struct CyclerInterface {
    request_timeout: Duration,
    command_reader: BufReader<OwnedReadHalf>,
    command_writer: OwnedWriteHalf,
    telemetry: TcpStream,
    telemetry_buf: Vec<u8>,
    decoder: FrameDecoder,
    tracker: SequenceTracker,
    line: String,
    // Set while an exchange is in flight. Still set afterwards means the
    // exchange was cut short and a late response may be sitting unread.
    desynced: bool,
}

impl CyclerInterface {
    pub async fn connect(config: &CyclerInterfaceConfig) -> Result<Self, ClientError> {
        let request_timeout = config.request_timeout();
        let host = config.server_ip.as_str();

        let commands = within(
            request_timeout,
            TcpStream::connect((host, config.json_msg_port)),
        )
        .await??;
        let telemetry = within(
            request_timeout,
            TcpStream::connect((host, config.bin_msg_port)),
        )
        .await??;
        commands.set_nodelay(true)?;
        telemetry.set_nodelay(true)?;
        debug!(host, json_port = config.json_msg_port, bin_port = config.bin_msg_port, "connected");

        let (reader, writer) = commands.into_split();
        Ok(Self {
            request_timeout,
            command_reader: BufReader::new(reader),
            command_writer: writer,
            telemetry,
            telemetry_buf: vec![0u8; config.msg_buffer_size_bytes.max(1)],
            decoder: FrameDecoder::new(),
            tracker: SequenceTracker::new(),
            line: String::new(),
            desynced: false,
        })
    }

    /// Sends one command and waits for its response. A response carrying an
    /// error comes back as [`ClientError::Remote`].
    ///
    /// After a timeout or transport failure the command connection can no
    /// longer pair responses with requests, so every later request fails
    /// with [`ClientError::Closed`]; reconnect to continue.
    pub async fn request(&mut self, command: &Command) -> Result<Response, ClientError> {
        if self.desynced {
            return Err(ClientError::Closed);
        }
        let request_timeout = self.request_timeout;
        self.desynced = true;
        let response = within(request_timeout, self.exchange(command)).await??;
        self.desynced = false;

        if let Some(kind) = response.error {
            let message = match &response.result {
                serde_json::Value::String(message) => message.clone(),
                other => other.to_string(),
            };
            return Err(ClientError::Remote { kind, message });
        }
        if let Some(echoed) = response.command_type.as_deref() {
            if echoed != command.type_name() {
                return Err(ClientError::UnexpectedResponse(format!(
                    "sent `{}`, got a response to `{echoed}`",
                    command.type_name()
                )));
            }
        }
        Ok(response)
    }

    async fn exchange(&mut self, command: &Command) -> Result<Response, ClientError> {
        let mut request = encode_command(command);
        request.push('\n');
        self.command_writer.write_all(request.as_bytes()).await?;
        self.command_writer.flush().await?;

        self.line.clear();
        if self.command_reader.read_line(&mut self.line).await? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(decode_response(self.line.trim_end().as_bytes())?)
    }

    async fn request_as<T: DeserializeOwned>(&mut self, command: Command) -> Result<T, ClientError> {
        let response = self.request(&command).await?;
        serde_json::from_value(response.result)
            .map_err(|e| ClientError::UnexpectedResponse(e.to_string()))
    }

    pub async fn read_system_info(&mut self) -> Result<SystemInfo, ClientError> {
        self.request_as(Command::ReadSystemInfo { channel_id: None })
            .await
    }

    pub async fn start_channel(
        &mut self,
        channel_id: ChannelId,
        set_point: SetPoint,
    ) -> Result<ChannelAck, ClientError> {
        set_point.validate().map_err(ProtocolError::malformed)?;
        self.request_as(Command::channel(channel_id, ChannelCommand::Start(set_point)))
            .await
    }

    pub async fn pause_channel(&mut self, channel_id: ChannelId) -> Result<ChannelAck, ClientError> {
        self.request_as(Command::channel(channel_id, ChannelCommand::Pause))
            .await
    }

    pub async fn stop_channel(&mut self, channel_id: ChannelId) -> Result<ChannelAck, ClientError> {
        self.request_as(Command::channel(channel_id, ChannelCommand::Stop))
            .await
    }

    pub async fn reset_channel(&mut self, channel_id: ChannelId) -> Result<ChannelAck, ClientError> {
        self.request_as(Command::channel(channel_id, ChannelCommand::Reset))
            .await
    }

    pub async fn inject_fault(
        &mut self,
        channel_id: ChannelId,
        kind: FaultKind,
    ) -> Result<ChannelAck, ClientError> {
        self.request_as(Command::channel(channel_id, ChannelCommand::InjectFault(kind)))
            .await
    }

    pub async fn read_measurement(
        &mut self,
        channel_id: ChannelId,
    ) -> Result<ChannelStatus, ClientError> {
        self.request_as(Command::channel(channel_id, ChannelCommand::ReadMeasurement))
            .await
    }

    /// Sends a subscription message. Replaces any earlier subscription.
    pub async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), ClientError> {
        let message = encode_subscription(subscription);
        let limit = self.request_timeout;
        within(limit, async {
            self.telemetry.write_all(&message).await?;
            self.telemetry.flush().await
        })
        .await??;
        Ok(())
    }

    /// Next telemetry frame, with how its sequence number relates to the
    /// previous frame of the same channel.
    pub async fn next_frame(&mut self) -> Result<(TelemetryFrame, SequenceCheck), ClientError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                let check = self.tracker.observe(&frame);
                if let SequenceCheck::Gap { missed } = check {
                    debug!(channel_id = frame.channel_id, missed, "telemetry gap");
                }
                if check == SequenceCheck::Stale {
                    warn!(
                        channel_id = frame.channel_id,
                        sequence = frame.sequence,
                        "stale telemetry frame"
                    );
                }
                return Ok((frame, check));
            }

            let read = within(self.request_timeout, self.telemetry.read(&mut self.telemetry_buf))
                .await??;
            if read == 0 {
                return Err(ClientError::Closed);
            }
            self.decoder.push(&self.telemetry_buf[..read]);
        }
    }

    pub fn sequence_tracker(&self) -> &SequenceTracker {
        &self.tracker
    }
}

async fn within<F: Future>(limit: Duration, future: F) -> Result<F::Output, ClientError> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| ClientError::Timeout(limit))
}
