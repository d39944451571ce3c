//! Synthetic cell model driving a running channel's measurement.
//!
//! The model is a plain state-of-charge integrator: constant current until
//! the voltage limit, a geometric current taper while the voltage is held,
//! then rest. It is not electrochemically meaningful, but it is monotonic in
//! capacity and fully deterministic for a given set-point and tick sequence.

use super::{Measurement, SetPoint};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const NOMINAL_CAPACITY_AH: f64 = 2.5;
pub const OCV_EMPTY_V: f64 = 3.0;
pub const OCV_FULL_V: f64 = 4.2;
pub const INTERNAL_RESISTANCE_OHM: f64 = 0.05;
pub const INITIAL_SOC: f64 = 0.2;

// Constant-voltage taper: current shrinks by this factor per tick and the
// step ends once it drops below the cutoff fraction of the set current.
pub const TAPER_FACTOR: f64 = 0.8;
pub const CUTOFF_FRACTION: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    ConstantCurrent,
    ConstantVoltage,
    Rest,
}

impl Step {
    /// Step number as reported in measurements (1-based).
    pub fn index(self) -> u16 {
        match self {
            Step::ConstantCurrent => 1,
            Step::ConstantVoltage => 2,
            Step::Rest => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellModel {
    soc: f64,
    step: Step,
    taper_current_a: f64,
}

impl CellModel {
    pub fn new() -> Self {
        Self {
            soc: INITIAL_SOC,
            step: Step::ConstantCurrent,
            taper_current_a: 0.0,
        }
    }

    pub fn soc(&self) -> f64 {
        self.soc
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn open_circuit_voltage(&self) -> f64 {
        OCV_EMPTY_V + (OCV_FULL_V - OCV_EMPTY_V) * self.soc
    }

    /// Re-enters constant current, used when a paused test resumes with a
    /// possibly different set-point.
    pub fn resume(&mut self) {
        self.step = Step::ConstantCurrent;
        self.taper_current_a = 0.0;
    }

    pub fn advance(&mut self, set_point: &SetPoint, measurement: &mut Measurement, dt: Duration) {
        let dt_h = dt.as_secs_f64() / 3600.0;
        let dt_ms = u64::try_from(dt.as_millis()).unwrap_or(u64::MAX);
        measurement.test_time_ms = measurement.test_time_ms.saturating_add(dt_ms);

        let set_current = set_point.current_a;
        let direction = if set_current.abs() < f64::EPSILON {
            0.0
        } else {
            set_current.signum()
        };

        if self.is_exhausted(set_point, measurement, direction) {
            self.step = Step::Rest;
        }

        let mut current = match self.step {
            Step::ConstantCurrent => set_current,
            Step::ConstantVoltage => {
                let tapered = self.taper_current_a * TAPER_FACTOR;
                if tapered.abs() < CUTOFF_FRACTION * set_current.abs() {
                    self.step = Step::Rest;
                    0.0
                } else {
                    self.taper_current_a = tapered;
                    tapered
                }
            }
            Step::Rest => 0.0,
        };

        let requested_ah = current.abs() * dt_h;
        let mut charge_ah = requested_ah;
        let mut capacity_capped = None;
        if let Some(limit) = set_point.capacity_limit_ah {
            let headroom = (limit - measurement.capacity_ah).max(0.0);
            if requested_ah > 0.0 && charge_ah >= headroom {
                charge_ah = headroom;
                capacity_capped = Some(limit);
            }
        }
        let soc_headroom_ah = if direction > 0.0 {
            (1.0 - self.soc) * NOMINAL_CAPACITY_AH
        } else {
            self.soc * NOMINAL_CAPACITY_AH
        };
        let soc_capped = requested_ah > 0.0 && charge_ah >= soc_headroom_ah;
        if soc_capped {
            charge_ah = soc_headroom_ah;
        }

        if charge_ah < requested_ah && dt_h > 0.0 {
            current = direction * charge_ah / dt_h;
        }

        measurement.capacity_ah += charge_ah;
        self.soc = (self.soc + direction * charge_ah / NOMINAL_CAPACITY_AH).clamp(0.0, 1.0);

        // Snap to the bound so float residue cannot keep the step alive.
        if let Some(limit) = capacity_capped {
            measurement.capacity_ah = limit;
            self.step = Step::Rest;
        }
        if soc_capped {
            self.soc = if direction > 0.0 { 1.0 } else { 0.0 };
            self.step = Step::Rest;
        }

        let mut voltage = self.open_circuit_voltage() + current * INTERNAL_RESISTANCE_OHM;
        if direction > 0.0 {
            if let Some(limit) = set_point.voltage_limit_v {
                if voltage >= limit {
                    voltage = limit;
                    if self.step == Step::ConstantCurrent {
                        self.step = Step::ConstantVoltage;
                        self.taper_current_a = current;
                    }
                }
            }
        }

        measurement.energy_wh += charge_ah * voltage;
        measurement.voltage_v = voltage;
        measurement.current_a = current;
        measurement.step = self.step.index();
    }

    fn is_exhausted(&self, set_point: &SetPoint, measurement: &Measurement, direction: f64) -> bool {
        if direction == 0.0 {
            return true;
        }
        if set_point
            .capacity_limit_ah
            .is_some_and(|limit| measurement.capacity_ah >= limit)
        {
            return true;
        }
        (direction > 0.0 && self.soc >= 1.0) || (direction < 0.0 && self.soc <= 0.0)
    }
}

impl Default for CellModel {
    fn default() -> Self {
        Self::new()
    }
}
