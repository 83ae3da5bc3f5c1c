use std::collections::{BTreeMap, TryReserveError};

use enum_map::{Enum, EnumMap};

pub const USEC_PER_SEC: f64 = 1_000_000.0;

/// Index of an idle state, as reported by the `state=` field of `cpu_idle` events.
pub type StateId = u32;

/// A closed time range, in seconds since boot (the trace clock).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub begin: f64,
    pub end: f64,
    /// `(end - begin)` in microseconds.
    pub duration_us: f64,
}

impl Interval {
    /// Returns the interval `[begin, end]`, or `None` if it is empty or reversed.
    ///
    /// Reversed intervals show up when the timestamps of the trace exceed the
    /// precision of the clock, they carry no usable information.
    pub fn closed(begin: f64, end: f64) -> Option<Interval> {
        let duration_us = (end - begin) * USEC_PER_SEC;
        if duration_us > 0.0 {
            Some(Interval { begin, end, duration_us })
        } else {
            None
        }
    }
}

/// Count, extrema, running mean and sum of a series of durations (in microseconds).
#[derive(Debug, Clone, PartialEq)]
pub struct RunningStats {
    pub count: u64,
    /// `f64::INFINITY` until the first sample.
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub total_duration_us: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        RunningStats {
            count: 0,
            min: f64::INFINITY,
            max: 0.0,
            mean: 0.0,
            total_duration_us: 0.0,
        }
    }
}

impl RunningStats {
    pub fn record(&mut self, duration_us: f64) {
        self.min = self.min.min(duration_us);
        self.max = self.max.max(duration_us);
        self.mean += (duration_us - self.mean) / (self.count + 1) as f64;
        self.total_duration_us += duration_us;
        self.count += 1;
    }

    /// The minimum, or zero if nothing has been recorded.
    pub fn min_or_zero(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }
}

/// Statistics of one idle state, with the intervals they are computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct StateStats {
    pub name: String,
    /// Chronological, non-overlapping.
    pub intervals: Vec<Interval>,
    pub stats: RunningStats,
}

impl StateStats {
    pub fn new(name: impl Into<String>) -> StateStats {
        StateStats {
            name: name.into(),
            intervals: Vec::new(),
            stats: RunningStats::default(),
        }
    }

    /// Appends a closed interval and updates the statistics.
    pub fn push(&mut self, interval: Interval) -> Result<(), TryReserveError> {
        self.intervals.try_reserve(1)?;
        self.intervals.push(interval);
        self.stats.record(interval.duration_us);
        Ok(())
    }
}

/// The idle states of one CPU (or of an aggregated topology node), by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CstateTable {
    states: BTreeMap<StateId, StateStats>,
}

impl CstateTable {
    pub fn get(&self, id: StateId) -> Option<&StateStats> {
        self.states.get(&id)
    }

    /// Returns the state `id`, creating it with the name given by `name` if needed.
    pub fn entry(&mut self, id: StateId, name: impl FnOnce() -> String) -> &mut StateStats {
        self.states.entry(id).or_insert_with(|| StateStats::new(name()))
    }

    pub fn insert(&mut self, id: StateId, state: StateStats) {
        self.states.insert(id, state);
    }

    /// Highest state index seen so far.
    pub fn state_max(&self) -> Option<StateId> {
        self.states.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StateId, &StateStats)> {
        self.states.iter().map(|(id, s)| (*id, s))
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Dwell statistics of one operating frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct PstateStats {
    pub frequency_khz: u32,
    pub stats: RunningStats,
}

/// The frequencies of one CPU.
///
/// An *advertised* table is fixed up front (sysfs `scaling_available_frequencies`)
/// and rejects anything else. A *discovered* table grows as the trace reports
/// new frequencies, which is what we do when the frequencies of the traced
/// machine are not known.
#[derive(Debug, Clone, PartialEq)]
pub struct PstateTable {
    pstates: Vec<PstateStats>,
    advertised: bool,
}

impl Default for PstateTable {
    fn default() -> Self {
        PstateTable::discovered()
    }
}

impl PstateTable {
    pub fn advertised(frequencies: impl IntoIterator<Item = u32>) -> PstateTable {
        let pstates = frequencies
            .into_iter()
            .map(|frequency_khz| PstateStats {
                frequency_khz,
                stats: RunningStats::default(),
            })
            .collect();
        PstateTable {
            pstates,
            advertised: true,
        }
    }

    pub fn discovered() -> PstateTable {
        PstateTable {
            pstates: Vec::new(),
            advertised: false,
        }
    }

    /// Finds the index of `freq_khz`, adding it to a discovered table.
    ///
    /// New entries are appended, so indices handed out earlier stay valid.
    pub fn resolve(&mut self, freq_khz: u32) -> Option<usize> {
        if let Some(i) = self.pstates.iter().position(|p| p.frequency_khz == freq_khz) {
            return Some(i);
        }
        if self.advertised {
            return None;
        }
        self.pstates.push(PstateStats {
            frequency_khz: freq_khz,
            stats: RunningStats::default(),
        });
        Some(self.pstates.len() - 1)
    }

    pub fn record_dwell(&mut self, index: usize, duration_us: f64) {
        if let Some(p) = self.pstates.get_mut(index) {
            p.stats.record(duration_us);
        }
    }

    pub fn find(&self, freq_khz: u32) -> Option<&PstateStats> {
        self.pstates.iter().find(|p| p.frequency_khz == freq_khz)
    }

    /// In table order (advertised order, or order of discovery).
    pub fn iter(&self) -> impl Iterator<Item = &PstateStats> {
        self.pstates.iter()
    }
}

#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IrqKind {
    /// hardware interrupt (`irq_handler_entry`)
    Hard,
    /// inter-processor interrupt (`ipi_handler_entry`)
    Ipi,
}

impl IrqKind {
    pub fn label(self) -> &'static str {
        match self {
            IrqKind::Hard => "irq",
            IrqKind::Ipi => "ipi",
        }
    }
}

/// Maximum length of an interrupt name, longer names are truncated.
pub const IRQ_NAME_LEN: usize = 16;

/// An interrupt seen on a CPU.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeupIrq {
    pub id: i32,
    pub kind: IrqKind,
    pub name: String,
    /// Number of times the handler ran on this CPU.
    pub count: u64,
    /// Number of idle periods this interrupt terminated, per idle state.
    pub wakeups: BTreeMap<StateId, u64>,
}

impl WakeupIrq {
    pub fn new(id: i32, kind: IrqKind, name: &str) -> WakeupIrq {
        WakeupIrq {
            id,
            kind,
            name: name.chars().take(IRQ_NAME_LEN).collect(),
            count: 0,
            wakeups: BTreeMap::new(),
        }
    }

    pub fn total_wakeups(&self) -> u64 {
        self.wakeups.values().sum()
    }
}

/// Everything accumulated for one CPU while replaying a trace.
#[derive(Debug, Clone, Default)]
pub struct CpuStates {
    pub cstates: CstateTable,
    pub pstates: PstateTable,
    /// Interrupts by kind and number.
    pub irqs: BTreeMap<(IrqKind, i32), WakeupIrq>,
    /// Attributed wakeups, by interrupt kind.
    pub wakeups_by_kind: EnumMap<IrqKind, u64>,
    /// Number of events of this CPU that were processed.
    pub events: u64,
}

impl CpuStates {
    /// `true` if at least one event of the trace concerned this CPU.
    pub fn is_active(&self) -> bool {
        self.events > 0
    }
}
