use crate::channel::{ChannelId, FaultKind};
use crate::error::ConfigError;
use crate::registry::ChannelRegistry;
use serde::{Deserialize, Serialize};
use tracing::info;

// Chance that a running channel faults on any given tick.
const DEFAULT_RATE_PER_TICK: f64 = 0.001;

// Fault kind weights
const OVER_VOLTAGE_WEIGHT: u8 = 30;
const OVER_CURRENT_WEIGHT: u8 = 30;
const OVER_TEMPERATURE_WEIGHT: u8 = 25;
const COMMUNICATION_LOSS_WEIGHT: u8 = 15;

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultInjectionStats {
    pub total_faults_injected: u32,
    pub over_voltage_faults: u32,
    pub over_current_faults: u32,
    pub over_temperature_faults: u32,
    pub communication_loss_faults: u32,
    pub ticks: u64,
}

impl FaultInjectionStats {
    fn record(&mut self, kind: FaultKind) {
        self.total_faults_injected += 1;
        match kind {
            FaultKind::OverVoltage => self.over_voltage_faults += 1,
            FaultKind::OverCurrent => self.over_current_faults += 1,
            FaultKind::OverTemperature => self.over_temperature_faults += 1,
            FaultKind::CommunicationLoss => self.communication_loss_faults += 1,
            FaultKind::External => {}
        }
    }
}

/// Random fault behaviour. Absent from a config means no random faults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    pub rate_per_tick: f64,
    pub seed: u64,
    pub over_voltage_weight: u8,
    pub over_current_weight: u8,
    pub over_temperature_weight: u8,
    pub communication_loss_weight: u8,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_per_tick: DEFAULT_RATE_PER_TICK,
            seed: DEFAULT_SEED,
            over_voltage_weight: OVER_VOLTAGE_WEIGHT,
            over_current_weight: OVER_CURRENT_WEIGHT,
            over_temperature_weight: OVER_TEMPERATURE_WEIGHT,
            communication_loss_weight: COMMUNICATION_LOSS_WEIGHT,
        }
    }
}

impl FaultInjectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.rate_per_tick) {
            return Err(ConfigError::Invalid {
                field: "fault_injection.rate_per_tick",
                reason: format!("{} is not a probability", self.rate_per_tick),
            });
        }
        if self.rate_per_tick > 0.0 && self.total_weight() == 0 {
            return Err(ConfigError::Invalid {
                field: "fault_injection",
                reason: "at least one fault kind needs a non-zero weight".into(),
            });
        }
        Ok(())
    }

    fn total_weight(&self) -> u16 {
        self.weights().iter().map(|(_, w)| u16::from(*w)).sum()
    }

    fn weights(&self) -> [(FaultKind, u8); 4] {
        [
            (FaultKind::OverVoltage, self.over_voltage_weight),
            (FaultKind::OverCurrent, self.over_current_weight),
            (FaultKind::OverTemperature, self.over_temperature_weight),
            (FaultKind::CommunicationLoss, self.communication_loss_weight),
        ]
    }
}

/// Probabilistic fault source driven by the tick task.
///
/// Uses a linear congruential generator so a given seed always faults the
/// same channels on the same ticks.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultInjectionConfig,
    stats: FaultInjectionStats,
    rng_state: u64,
}

impl FaultInjector {
    pub fn new(config: FaultInjectionConfig) -> Self {
        Self {
            rng_state: config.seed,
            config,
            stats: FaultInjectionStats::default(),
        }
    }

    /// Rolls once per running channel and faults the unlucky ones. Returns
    /// the channels faulted on this tick.
    pub fn update(&mut self, registry: &ChannelRegistry) -> Vec<(ChannelId, FaultKind)> {
        if !self.config.enabled {
            return Vec::new();
        }
        self.stats.ticks += 1;

        let mut injected = Vec::new();
        for channel_id in registry.running_channels() {
            if !self.should_inject() {
                continue;
            }
            let Some(kind) = self.select_kind() else {
                continue;
            };
            // The channel may have left Running since it was listed.
            if registry.inject_fault_if_running(channel_id, kind) {
                info!(channel_id, fault = %kind, "injected random fault");
                self.stats.record(kind);
                injected.push((channel_id, kind));
            }
        }
        injected
    }

    pub fn stats(&self) -> &FaultInjectionStats {
        &self.stats
    }

    fn should_inject(&mut self) -> bool {
        self.random_unit() < self.config.rate_per_tick
    }

    fn select_kind(&mut self) -> Option<FaultKind> {
        let total = self.config.total_weight();
        if total == 0 {
            return None;
        }

        let mut roll = (self.next_random() >> 33) % u64::from(total);
        for (kind, weight) in self.config.weights() {
            let weight = u64::from(weight);
            if roll < weight {
                return Some(kind);
            }
            roll -= weight;
        }
        None
    }

    // X(n+1) = aX(n) + c with Knuth's MMIX constants.
    fn next_random(&mut self) -> u64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.rng_state
    }

    /// Uniform in [0, 1).
    fn random_unit(&mut self) -> f64 {
        (self.next_random() >> 11) as f64 / (1u64 << 53) as f64
    }
}
