use super::shutdown_requested;
use crate::error::{ProtocolError, SpooferError};
use crate::registry::ChannelRegistry;
use crate::telemetry::{decode_subscription, BatchingStats, Subscription, TelemetryBatcher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub period: Duration,
    pub write_timeout: Duration,
    pub buffer_size: usize,
}

pub struct TelemetryServer {
    listener: TcpListener,
    registry: Arc<ChannelRegistry>,
    settings: TelemetrySettings,
    active: Arc<AtomicUsize>,
}

impl TelemetryServer {
    pub fn new(
        listener: TcpListener,
        registry: Arc<ChannelRegistry>,
        settings: TelemetrySettings,
    ) -> Self {
        Self {
            listener,
            registry,
            settings,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Live count of open subscriber connections.
    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut subscribers = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let guard = ConnectionGuard::new(&self.active);
                        info!(%peer, active = guard.count(), "telemetry subscriber connected");

                        let registry = Arc::clone(&self.registry);
                        let settings = self.settings;
                        let shutdown = shutdown.clone();
                        subscribers.spawn(async move {
                            let _guard = guard;
                            let (reader, writer) = stream.into_split();
                            match serve_subscriber(reader, writer, registry, settings, shutdown).await {
                                Ok(stats) => info!(
                                    %peer,
                                    frames = stats.frames_sent,
                                    batches = stats.batches_sent,
                                    "telemetry subscriber disconnected"
                                ),
                                Err(e) => warn!(%peer, error = %e, "telemetry subscriber dropped"),
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept telemetry connection"),
                },
                Some(joined) = subscribers.join_next(), if !subscribers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "telemetry task failed");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!(open = subscribers.len(), "telemetry server stopping");
        while let Some(joined) = subscribers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "telemetry task failed");
            }
        }
    }
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self {
            active: Arc::clone(active),
        }
    }

    fn count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Streams telemetry to one subscriber until it disconnects, shutdown is
/// signalled, or a write stalls past `settings.write_timeout`.
///
/// The first bytes from the peer must be a subscription message. Later
/// subscription messages replace the current one.
pub async fn serve_subscriber<R, W>(
    mut reader: R,
    mut writer: W,
    registry: Arc<ChannelRegistry>,
    settings: TelemetrySettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<BatchingStats, SpooferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let num_channels = registry.len();
    let mut inbound = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    let mut subscription = loop {
        if let Some(subscription) = take_subscription(&mut inbound, num_channels)? {
            break subscription;
        }
        let read = tokio::select! {
            read = reader.read(&mut chunk) => read?,
            _ = shutdown_requested(&mut shutdown) => return Ok(BatchingStats::default()),
        };
        if read == 0 {
            return Ok(BatchingStats::default());
        }
        inbound.extend_from_slice(&chunk[..read]);
    };
    debug!(?subscription, "telemetry subscription opened");

    let mut batcher = TelemetryBatcher::new(num_channels, settings.buffer_size);
    let mut ticker = time::interval(settings.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for channel_id in subscription.channel_ids(num_channels) {
                    if let Some(frame) = registry.telemetry_frame(channel_id)? {
                        batcher.offer(frame);
                    }
                }
                if let Some(batch) = batcher.next_batch() {
                    write_batch(&mut writer, &batch, settings.write_timeout).await?;
                }
            }
            read = reader.read(&mut chunk) => {
                let read = read?;
                if read == 0 {
                    return Ok(batcher.stats().clone());
                }
                inbound.extend_from_slice(&chunk[..read]);
                while let Some(next) = take_subscription(&mut inbound, num_channels)? {
                    debug!(subscription = ?next, "telemetry subscription replaced");
                    batcher.retain_subscribed(&next);
                    subscription = next;
                }
            }
            _ = shutdown_requested(&mut shutdown) => return Ok(batcher.stats().clone()),
        }
    }
}

/// Pops a complete subscription message off the front of `inbound`.
fn take_subscription(
    inbound: &mut Vec<u8>,
    num_channels: u16,
) -> Result<Option<Subscription>, ProtocolError> {
    match decode_subscription(inbound, num_channels) {
        Ok((subscription, consumed)) => {
            inbound.drain(..consumed);
            Ok(Some(subscription))
        }
        Err(ProtocolError::IncompleteFrame { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn write_batch<W>(writer: &mut W, batch: &[u8], limit: Duration) -> Result<(), SpooferError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(batch).await?;
        writer.flush().await
    };
    match time::timeout(limit, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProtocolError::ConnectionTimeout(limit).into()),
    }
}
