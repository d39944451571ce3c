//! # Cycler Spoofer
//!
//! Emulates a multi-channel battery cycler over the network so test
//! automation can be developed and exercised without real hardware.
//!
//! ## Features
//!
//! - **JSON command server**: newline-delimited requests to start, pause,
//!   stop, reset, fault and query independent channels
//! - **Binary telemetry**: fixed 60-byte little-endian frames, batched to a
//!   configurable buffer size with strictly increasing sequence numbers
//! - **Deterministic cell model**: constant current, constant voltage taper
//!   and rest, advanced by a fixed tick
//! - **Fault injection**: manual faults over the command protocol and
//!   optional seeded random faults
//! - **Client**: [`CyclerInterface`] speaks both transports
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cycler_spoofer::{CyclerInterface, CyclerInterfaceConfig, CyclerSpoofer, SetPoint, SpooferConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SpooferConfig::new("127.0.0.1".parse()?, 0, 0, 8, 1024);
//! let handle = CyclerSpoofer::new(config)?.start().await?;
//!
//! let mut cycler = CyclerInterface::connect(&CyclerInterfaceConfig::new(
//!     "127.0.0.1",
//!     handle.json_addr.port(),
//!     handle.telemetry_addr.port(),
//!     1024,
//! ))
//! .await?;
//! cycler.start_channel(3, SetPoint::constant_current(1.0)).await?;
//! println!("{:?}", cycler.read_measurement(3).await?);
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`channel`] - Per-channel state machine, cell model and fault log
//! - [`registry`] - Fixed set of independently locked channels
//! - [`protocol`] - JSON command and response codec
//! - [`telemetry`] - Binary frame codec, subscriptions and batching
//! - [`server`] - TCP front ends for both transports
//! - [`spoofer`] - Wires the registry, tick task and servers together
//! - [`client`] - Async client
//! - [`fault_injection`] - Seeded random fault source

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod fault_injection;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod spoofer;
pub mod telemetry;

// Re-export main public types for convenience
pub use channel::{Channel, ChannelId, ChannelState, ChannelStatus, FaultKind, Measurement, SetPoint};
pub use client::CyclerInterface;
pub use config::{CyclerInterfaceConfig, SpooferConfig};
pub use error::{ClientError, ConfigError, ErrorKind, ProtocolError, SpooferError};
pub use protocol::{Command, CommandCodec, SystemInfo};
pub use registry::ChannelRegistry;
pub use spoofer::{CyclerSpoofer, SpooferHandle};
pub use telemetry::{Subscription, TelemetryFrame};
