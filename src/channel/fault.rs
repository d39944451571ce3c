use heapless::Vec;
use serde::{Deserialize, Serialize};

const MAX_FAULT_HISTORY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    OverVoltage,
    OverCurrent,
    OverTemperature,
    CommunicationLoss,
    #[default]
    External,
}

impl FaultKind {
    pub const ALL: [FaultKind; 5] = [
        FaultKind::OverVoltage,
        FaultKind::OverCurrent,
        FaultKind::OverTemperature,
        FaultKind::CommunicationLoss,
        FaultKind::External,
    ];

    /// Wire names, in the order of [`FaultKind::ALL`].
    pub const NAMES: [&'static str; 5] = [
        "over_voltage",
        "over_current",
        "over_temperature",
        "communication_loss",
        "external",
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::OverVoltage => "over_voltage",
            FaultKind::OverCurrent => "over_current",
            FaultKind::OverTemperature => "over_temperature",
            FaultKind::CommunicationLoss => "communication_loss",
            FaultKind::External => "external",
        }
    }
}

impl core::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for FaultKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FaultKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown fault kind `{s}`"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: u32,
    pub kind: FaultKind,
    /// Sample sequence number of the channel when the fault was raised.
    pub sequence: u32,
    pub test_time_ms: u64,
    pub resolved: bool,
}

/// Bounded per-channel fault history. When full, the oldest record is
/// evicted to make room.
#[derive(Debug, Clone)]
pub struct FaultLog {
    history: Vec<FaultRecord, MAX_FAULT_HISTORY>,
    next_fault_id: u32,
    total_recorded: u32,
}

impl FaultLog {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            next_fault_id: 1,
            total_recorded: 0,
        }
    }

    pub fn record(&mut self, kind: FaultKind, sequence: u32, test_time_ms: u64) -> u32 {
        let fault_id = self.next_fault_id;
        self.next_fault_id = self.next_fault_id.wrapping_add(1);
        self.total_recorded = self.total_recorded.saturating_add(1);

        if self.history.is_full() {
            self.history.remove(0);
        }

        let _ = self.history.push(FaultRecord {
            id: fault_id,
            kind,
            sequence,
            test_time_ms,
            resolved: false,
        });
        fault_id
    }

    /// Marks every unresolved record as resolved and returns how many were.
    pub fn resolve_active(&mut self) -> usize {
        let mut resolved = 0;
        for record in self.history.iter_mut().filter(|r| !r.resolved) {
            record.resolved = true;
            resolved += 1;
        }
        resolved
    }

    pub fn active(&self) -> impl Iterator<Item = &FaultRecord> {
        self.history.iter().filter(|r| !r.resolved)
    }

    pub fn history(&self) -> &[FaultRecord] {
        &self.history
    }

    pub fn total_recorded(&self) -> u32 {
        self.total_recorded
    }
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_log_evicts_oldest_when_full() {
        let mut log = FaultLog::new();
        for i in 0..(MAX_FAULT_HISTORY as u32 + 4) {
            log.record(FaultKind::OverCurrent, i, u64::from(i) * 100);
        }

        assert_eq!(log.history().len(), MAX_FAULT_HISTORY);
        assert_eq!(log.history()[0].id, 5);
        assert_eq!(log.total_recorded(), MAX_FAULT_HISTORY as u32 + 4);
    }

    #[test]
    fn test_resolve_active_only_touches_unresolved() {
        let mut log = FaultLog::new();
        log.record(FaultKind::OverVoltage, 1, 100);
        assert_eq!(log.resolve_active(), 1);
        log.record(FaultKind::External, 2, 200);

        assert_eq!(log.active().count(), 1);
        assert_eq!(log.resolve_active(), 1);
        assert_eq!(log.active().count(), 0);
    }

    #[test]
    fn test_fault_kind_parses_wire_names() {
        for kind in FaultKind::ALL {
            assert_eq!(kind.as_str().parse::<FaultKind>(), Ok(kind));
        }
        assert!("meltdown".parse::<FaultKind>().is_err());
    }
}
