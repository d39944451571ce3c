//! Network front ends of the emulator: newline-delimited JSON commands and
//! the binary telemetry stream.

pub mod json;
pub mod telemetry;

pub use json::{CommandDispatcher, InstrumentIdentity, JsonServer, Reply};
pub use telemetry::{serve_subscriber, TelemetryServer, TelemetrySettings};

use tokio::sync::watch;

/// Resolves once shutdown has been signalled or the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
