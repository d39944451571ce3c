use crate::config::SpooferConfig;
use crate::error::SpooferError;
use crate::fault_injection::FaultInjector;
use crate::registry::ChannelRegistry;
use crate::server::{
    shutdown_requested, CommandDispatcher, InstrumentIdentity, JsonServer, TelemetryServer,
    TelemetrySettings,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

/// Multi-channel battery cycler emulator.
pub struct CyclerSpoofer {
    config: SpooferConfig,
    registry: Arc<ChannelRegistry>,
}

impl CyclerSpoofer {
    pub fn new(config: SpooferConfig) -> Result<Self, SpooferError> {
        config.validate()?;
        let registry = Arc::new(ChannelRegistry::new(config.num_channels));
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &SpooferConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Binds both listeners and spawns every task. Fails only if a listener
    /// cannot be bound.
    pub async fn start(self) -> Result<SpooferHandle, SpooferError> {
        let json_listener = bind(self.config.json_addr()).await?;
        let telemetry_listener = bind(self.config.telemetry_addr()).await?;
        let json_addr = json_listener.local_addr()?;
        let telemetry_addr = telemetry_listener.local_addr()?;

        let identity = InstrumentIdentity::new(
            json_addr.port(),
            telemetry_addr.port(),
            self.config.msg_buffer_size_bytes,
        );
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&self.registry), identity));
        let json_server = JsonServer::new(json_listener, dispatcher, self.config.write_timeout());
        let telemetry_server = TelemetryServer::new(
            telemetry_listener,
            Arc::clone(&self.registry),
            TelemetrySettings {
                period: self.config.telemetry_period(),
                write_timeout: self.config.write_timeout(),
                buffer_size: self.config.msg_buffer_size_bytes,
            },
        );
        let subscribers = telemetry_server.active_connections();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let injector = self
            .config
            .fault_injection
            .clone()
            .filter(|config| config.enabled)
            .map(FaultInjector::new);
        tasks.spawn(tick_task(
            Arc::clone(&self.registry),
            self.config.tick_period(),
            injector,
            shutdown_rx.clone(),
        ));
        tasks.spawn(json_server.run(shutdown_rx.clone()));
        tasks.spawn(telemetry_server.run(shutdown_rx));

        info!(
            %json_addr,
            %telemetry_addr,
            channels = self.config.num_channels,
            tick_ms = self.config.tick_period_ms,
            telemetry_ms = self.config.telemetry_period_ms,
            "cycler spoofer started"
        );

        Ok(SpooferHandle {
            json_addr,
            telemetry_addr,
            registry: self.registry,
            subscribers,
            shutdown_tx,
            tasks,
        })
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, SpooferError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| SpooferError::Bind { addr, source })
}

/// Advances every running channel once per period. Each tick moves test
/// time forward by exactly `period`, however late the tick fires.
async fn tick_task(
    registry: Arc<ChannelRegistry>,
    period: Duration,
    mut injector: Option<FaultInjector>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sampled = registry.tick_all(period);
                if let Some(injector) = injector.as_mut() {
                    injector.update(&registry);
                }
                if sampled > 0 {
                    debug!(sampled, "tick");
                }
            }
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    if let Some(injector) = injector {
        let stats = injector.stats();
        info!(
            injected = stats.total_faults_injected,
            ticks = stats.ticks,
            "fault injector stopped"
        );
    }
}

/// Running emulator.
pub struct SpooferHandle {
    pub json_addr: SocketAddr,
    pub telemetry_addr: SocketAddr,
    pub registry: Arc<ChannelRegistry>,
    subscribers: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl SpooferHandle {
    pub fn telemetry_subscribers(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    /// Stops accepting connections, lets in-flight commands finish and
    /// waits for every task to exit.
    pub async fn shutdown(mut self) {
        info!("cycler spoofer shutting down");
        let _ = self.shutdown_tx.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task failed during shutdown");
            }
        }
        info!("cycler spoofer stopped");
    }
}
