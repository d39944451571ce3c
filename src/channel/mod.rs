pub mod fault;
pub mod model;

pub use fault::{FaultKind, FaultLog, FaultRecord};
pub use model::{CellModel, Step};

use crate::error::ProtocolError;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type ChannelId = u16;

pub const MAX_SCHEDULE_NAME_LEN: usize = 32;
pub type ScheduleName = ArrayString<MAX_SCHEDULE_NAME_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Idle,
    Running,
    Paused,
    Faulted,
}

impl ChannelState {
    /// Single-byte code used in telemetry frames.
    pub fn code(self) -> u8 {
        match self {
            ChannelState::Idle => 0,
            ChannelState::Running => 1,
            ChannelState::Paused => 2,
            ChannelState::Faulted => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChannelState::Idle),
            1 => Some(ChannelState::Running),
            2 => Some(ChannelState::Paused),
            3 => Some(ChannelState::Faulted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Idle => "Idle",
            ChannelState::Running => "Running",
            ChannelState::Paused => "Paused",
            ChannelState::Faulted => "Faulted",
        }
    }
}

impl core::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target operating parameters for a channel. Positive current charges,
/// negative current discharges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetPoint {
    pub current_a: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_limit_v: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_limit_ah: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleName>,
}

impl SetPoint {
    pub fn constant_current(current_a: f64) -> Self {
        Self {
            current_a,
            voltage_limit_v: None,
            capacity_limit_ah: None,
            schedule: None,
        }
    }

    #[must_use]
    pub fn with_voltage_limit(mut self, volts: f64) -> Self {
        self.voltage_limit_v = Some(volts);
        self
    }

    #[must_use]
    pub fn with_capacity_limit(mut self, amp_hours: f64) -> Self {
        self.capacity_limit_ah = Some(amp_hours);
        self
    }

    #[must_use]
    pub fn with_schedule(mut self, schedule: ScheduleName) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.current_a.is_finite() {
            return Err("current_a must be finite");
        }
        if self.voltage_limit_v.is_some_and(|v| !v.is_finite() || v <= 0.0) {
            return Err("voltage_limit_v must be a positive number");
        }
        if self.capacity_limit_ah.is_some_and(|c| !c.is_finite() || c <= 0.0) {
            return Err("capacity_limit_ah must be a positive number");
        }
        Ok(())
    }
}

/// Latest synthetic sample of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Measurement {
    pub test_time_ms: u64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub capacity_ah: f64,
    pub energy_wh: f64,
    pub cycle: u32,
    pub step: u16,
}

/// Read-only view of a channel returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel_id: ChannelId,
    pub state: ChannelState,
    pub set_point: Option<SetPoint>,
    pub measurement: Measurement,
    pub sequence: u32,
    pub fault: Option<FaultKind>,
    pub fault_count: u32,
}

/// One emulated test lane.
///
/// All transitions go through the methods below; a rejected transition
/// leaves every field untouched.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    state: ChannelState,
    set_point: Option<SetPoint>,
    measurement: Measurement,
    sequence_counter: u32,
    model: CellModel,
    fault: Option<FaultKind>,
    fault_log: FaultLog,
}

impl Channel {
    pub fn new(id: ChannelId) -> Self {
        let model = CellModel::new();
        Self {
            id,
            state: ChannelState::Idle,
            set_point: None,
            measurement: Measurement {
                voltage_v: model.open_circuit_voltage(),
                ..Measurement::default()
            },
            sequence_counter: 0,
            model,
            fault: None,
            fault_log: FaultLog::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn set_point(&self) -> Option<&SetPoint> {
        self.set_point.as_ref()
    }

    pub fn measurement(&self) -> &Measurement {
        &self.measurement
    }

    pub fn sequence_counter(&self) -> u32 {
        self.sequence_counter
    }

    pub fn active_fault(&self) -> Option<FaultKind> {
        self.fault
    }

    pub fn fault_log(&self) -> &FaultLog {
        &self.fault_log
    }

    /// Starts a new test from Idle or resumes a paused one.
    pub fn start(&mut self, set_point: SetPoint) -> Result<(), ProtocolError> {
        match self.state {
            ChannelState::Idle => {
                self.model = CellModel::new();
                self.measurement = Measurement {
                    voltage_v: self.model.open_circuit_voltage(),
                    cycle: self.measurement.cycle.wrapping_add(1),
                    step: Step::ConstantCurrent.index(),
                    ..Measurement::default()
                };
            }
            ChannelState::Paused => self.model.resume(),
            ChannelState::Running => return Err(self.invalid_transition("start")),
            ChannelState::Faulted => return Err(ProtocolError::ChannelFaulted(self.id)),
        }

        self.set_point = Some(set_point);
        self.state = ChannelState::Running;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            ChannelState::Running => {
                self.state = ChannelState::Paused;
                Ok(())
            }
            ChannelState::Faulted => Err(ProtocolError::ChannelFaulted(self.id)),
            ChannelState::Idle | ChannelState::Paused => Err(self.invalid_transition("pause")),
        }
    }

    /// Returns the channel to Idle. Stopping an idle channel is a no-op.
    pub fn stop(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            ChannelState::Running | ChannelState::Paused => {
                self.state = ChannelState::Idle;
                Ok(())
            }
            ChannelState::Idle => Ok(()),
            ChannelState::Faulted => Err(ProtocolError::ChannelFaulted(self.id)),
        }
    }

    /// Manual reset: forces Idle from any state and clears the active fault.
    pub fn reset(&mut self) {
        if self.fault.take().is_some() {
            self.fault_log.resolve_active();
        }
        self.state = ChannelState::Idle;
    }

    /// Forces the channel into Faulted from any state, including Faulted, and
    /// logs the fault. Returns the fault record id.
    pub fn inject_fault(&mut self, kind: FaultKind) -> u32 {
        let fault_id =
            self.fault_log
                .record(kind, self.sequence_counter, self.measurement.test_time_ms);
        self.fault = Some(kind);
        self.state = ChannelState::Faulted;
        fault_id
    }

    /// Advances the measurement by one tick. Returns whether a new sample was
    /// produced, which only happens while Running.
    pub fn tick(&mut self, dt: Duration) -> bool {
        if self.state != ChannelState::Running {
            return false;
        }
        let Some(set_point) = self.set_point else {
            return false;
        };

        self.model.advance(&set_point, &mut self.measurement, dt);
        self.sequence_counter = self.sequence_counter.wrapping_add(1);
        true
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            channel_id: self.id,
            state: self.state,
            set_point: self.set_point,
            measurement: self.measurement,
            sequence: self.sequence_counter,
            fault: self.fault,
            fault_count: self.fault_log.total_recorded(),
        }
    }

    fn invalid_transition(&self, action: &'static str) -> ProtocolError {
        ProtocolError::InvalidTransition {
            channel_id: self.id,
            action,
            state: self.state,
        }
    }
}
