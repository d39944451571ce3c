use super::shutdown_requested;
use crate::error::{ProtocolError, SpooferError};
use crate::protocol::{
    encode_error_response, encode_response, Command, CommandCodec, CommandOutcome, SystemInfo,
    MAX_COMMAND_SIZE,
};
use crate::registry::ChannelRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MODEL: &str = "cycler-spoofer";
pub const DEFAULT_SERIAL_NUMBER: &str = "SPOOF-000001";

// Room for the largest accepted command plus a CRLF terminator, and one byte
// more so oversized lines are seen as such.
const LINE_LIMIT: u64 = MAX_COMMAND_SIZE as u64 + 3;

/// Static part of the `read_system_info` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentIdentity {
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub json_port: u16,
    pub tcp_port: u16,
    pub msg_buffer_size_bytes: usize,
}

impl InstrumentIdentity {
    pub fn new(json_port: u16, tcp_port: u16, msg_buffer_size_bytes: usize) -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            serial_number: DEFAULT_SERIAL_NUMBER.to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            json_port,
            tcp_port,
            msg_buffer_size_bytes,
        }
    }
}

/// What to send back for one request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub response: String,
    /// The connection must be closed once the response is written.
    pub close: bool,
}

/// Turns request lines into response lines. Holds no connection state, so
/// one dispatcher is shared by every connection.
#[derive(Debug)]
pub struct CommandDispatcher {
    registry: Arc<ChannelRegistry>,
    codec: CommandCodec,
    identity: InstrumentIdentity,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<ChannelRegistry>, identity: InstrumentIdentity) -> Self {
        Self {
            codec: CommandCodec::new(registry.len()),
            registry,
            identity,
        }
    }

    pub fn handle_line(&self, line: &[u8]) -> Reply {
        match self.codec.decode_command(line) {
            Ok(command) => {
                let outcome = self.dispatch(&command);
                if let Err(e) = &outcome {
                    debug!(command = command.type_name(), error = %e, "command rejected");
                }
                Reply {
                    response: encode_response(&command, &outcome),
                    close: false,
                }
            }
            Err(e) => {
                let close = matches!(e, ProtocolError::MalformedMessage(_));
                warn!(error = %e, close, "undecodable command");
                Reply {
                    response: encode_error_response(&e),
                    close,
                }
            }
        }
    }

    pub fn dispatch(&self, command: &Command) -> Result<CommandOutcome, ProtocolError> {
        match command {
            Command::ReadSystemInfo { .. } => Ok(CommandOutcome::SystemInfo(self.system_info())),
            Command::Channel {
                channel_id,
                command,
            } => self.registry.apply_command(*channel_id, command),
        }
    }

    pub fn system_info(&self) -> SystemInfo {
        let identity = &self.identity;
        SystemInfo {
            model: identity.model.clone(),
            serial_number: identity.serial_number.clone(),
            firmware_version: identity.firmware_version.clone(),
            num_channels: self.registry.len(),
            json_port: identity.json_port,
            tcp_port: identity.tcp_port,
            msg_buffer_size_bytes: identity.msg_buffer_size_bytes,
            channels: self.registry.summary(),
        }
    }
}

pub struct JsonServer {
    listener: TcpListener,
    dispatcher: Arc<CommandDispatcher>,
    write_timeout: Duration,
}

impl JsonServer {
    /// A response write that stalls past `write_timeout` drops the client.
    pub fn new(
        listener: TcpListener,
        dispatcher: Arc<CommandDispatcher>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            write_timeout,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until shutdown, then waits for every open
    /// connection to finish its current command.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "command client connected");
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let shutdown = shutdown.clone();
                        let write_timeout = self.write_timeout;
                        connections.spawn(async move {
                            match serve_connection(stream, &dispatcher, write_timeout, shutdown).await {
                                Ok(()) => info!(%peer, "command client disconnected"),
                                Err(e) => warn!(%peer, error = %e, "command connection closed"),
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept command connection"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "command connection task failed");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!(open = connections.len(), "command server stopping");
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "command connection task failed");
            }
        }
    }
}

/// Serves one command connection: one request line in, one response line
/// out, in order. Shutdown is only observed while waiting for a request.
/// A client that stops reading its responses is dropped once a write stalls
/// for `write_timeout`.
pub async fn serve_connection<S>(
    stream: S,
    dispatcher: &CommandDispatcher,
    write_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SpooferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);

    loop {
        line.clear();
        let mut limited = (&mut reader).take(LINE_LIMIT);
        let read = tokio::select! {
            read = limited.read_until(b'\n', &mut line) => read?,
            _ = shutdown_requested(&mut shutdown) => return Ok(()),
        };
        if read == 0 {
            return Ok(());
        }

        let request = trim_line(&line);
        if request.is_empty() {
            continue;
        }

        let reply = dispatcher.handle_line(request);
        let written = write_line(&mut writer, &reply.response, write_timeout).await;
        if reply.close {
            // Best effort: the peer is dropped either way.
            return Ok(());
        }
        written?;
    }
}

async fn write_line<W>(writer: &mut W, response: &str, limit: Duration) -> Result<(), SpooferError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    };
    match time::timeout(limit, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProtocolError::ConnectionTimeout(limit).into()),
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
