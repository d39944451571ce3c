//! Fixed-size set of channels, each behind its own lock.
//!
//! Locks are held for a single synchronous operation and never across an
//! `.await`, so a command on one channel never waits on another channel.

use crate::channel::{Channel, ChannelId, ChannelState, ChannelStatus, FaultKind, Measurement};
use crate::error::ProtocolError;
use crate::protocol::{ChannelAck, ChannelCommand, ChannelSummary, CommandOutcome};
use crate::telemetry::TelemetryFrame;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct ChannelRegistry {
    channels: Box<[Mutex<Channel>]>,
}

impl ChannelRegistry {
    pub fn new(num_channels: u16) -> Self {
        let channels = (0..num_channels)
            .map(|id| Mutex::new(Channel::new(id)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { channels }
    }

    pub fn len(&self) -> u16 {
        // Built from a u16 count, so this cannot truncate.
        self.channels.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Copy of the channel as it is right now.
    pub fn get(&self, id: ChannelId) -> Result<Channel, ProtocolError> {
        Ok(self.lock(id)?.clone())
    }

    pub fn apply_command(
        &self,
        id: ChannelId,
        command: &ChannelCommand,
    ) -> Result<CommandOutcome, ProtocolError> {
        let mut channel = self.lock(id)?;
        match command {
            ChannelCommand::Start(set_point) => channel.start(*set_point)?,
            ChannelCommand::Pause => channel.pause()?,
            ChannelCommand::Stop => channel.stop()?,
            ChannelCommand::Reset => channel.reset(),
            ChannelCommand::InjectFault(kind) => {
                channel.inject_fault(*kind);
            }
            ChannelCommand::ReadMeasurement => return Ok(CommandOutcome::Status(channel.status())),
        }

        debug!(
            channel_id = id,
            command = command.type_name(),
            state = %channel.state(),
            "command applied"
        );
        Ok(CommandOutcome::Ack(ChannelAck {
            channel_id: id,
            state: channel.state(),
        }))
    }

    pub fn snapshot(&self, id: ChannelId) -> Result<Measurement, ProtocolError> {
        Ok(*self.lock(id)?.measurement())
    }

    pub fn status(&self, id: ChannelId) -> Result<ChannelStatus, ProtocolError> {
        Ok(self.lock(id)?.status())
    }

    /// Latest sample of a running channel, `None` otherwise.
    pub fn telemetry_frame(&self, id: ChannelId) -> Result<Option<TelemetryFrame>, ProtocolError> {
        let channel = self.lock(id)?;
        if channel.state() != ChannelState::Running || channel.sequence_counter() == 0 {
            return Ok(None);
        }
        Ok(Some(TelemetryFrame::capture(&channel)))
    }

    pub fn inject_fault(&self, id: ChannelId, kind: FaultKind) -> Result<u32, ProtocolError> {
        Ok(self.lock(id)?.inject_fault(kind))
    }

    /// Faults the channel only if it is still Running.
    pub fn inject_fault_if_running(&self, id: ChannelId, kind: FaultKind) -> bool {
        let Ok(mut channel) = self.lock(id) else {
            return false;
        };
        if channel.state() != ChannelState::Running {
            return false;
        }
        channel.inject_fault(kind);
        true
    }

    /// Advances every running channel by `dt`, one lock at a time. Returns
    /// how many channels produced a sample.
    pub fn tick_all(&self, dt: Duration) -> usize {
        self.channels
            .iter()
            .filter(|slot| lock_slot(slot).tick(dt))
            .count()
    }

    pub fn running_channels(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .map(|slot| lock_slot(slot))
            .filter(|channel| channel.state() == ChannelState::Running)
            .map(|channel| channel.id())
            .collect()
    }

    pub fn summary(&self) -> ChannelSummary {
        let mut summary = ChannelSummary::default();
        for slot in self.channels.iter() {
            summary.count(lock_slot(slot).state());
        }
        summary
    }

    fn lock(&self, id: ChannelId) -> Result<MutexGuard<'_, Channel>, ProtocolError> {
        self.channels
            .get(usize::from(id))
            .map(lock_slot)
            .ok_or(ProtocolError::InvalidChannel {
                channel_id: i64::from(id),
                num_channels: self.len(),
            })
    }
}

// A panic while holding a channel lock cannot leave the channel half-updated
// (every transition assigns state last), so poisoning is ignored.
fn lock_slot(slot: &Mutex<Channel>) -> MutexGuard<'_, Channel> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
