//! Per-cpu idle and frequency statistics from kernel traces.
//!
//! A trace log is replayed by a [`CpuTraceProcessor`] into per-cpu tables of
//! closed intervals ([`stats`]), which are then intersected along the cpu
//! [`topology`] to know when whole cores and clusters were idle.

use std::num::ParseIntError;

pub mod energy;
pub mod error;
pub mod event;
pub mod ftrace;
pub mod intersect;
pub mod processor;
pub mod stats;
pub mod sysfs;
pub mod topology;
pub mod trace_file;

pub use energy::{calculate_energy, EnergyModel, EnergyReport};
pub use error::{EnergyModelError, TopologyError, TraceError};
pub use event::{EventKind, TraceDecoder, TraceEvent};
pub use intersect::{intersect, intersect_many};
pub use processor::{CpuTraceProcessor, ProcessedTrace};
pub use stats::{CpuStates, CstateTable, Interval, IrqKind, PstateTable, StateStats};
pub use topology::{aggregate, flat_aggregate, Topology};
pub use trace_file::{Aggregation, TraceLoader, TraceLog};

/// Parses a sysfs cpu list such as `0-3,8,10-11`.
pub fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<u32>> {
    // handles "n" or "start-end"
    fn parse_cpulist_item(item: &str) -> anyhow::Result<Vec<u32>> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<Result<Vec<u32>, ParseIntError>>()?;

        match bounds.as_slice() {
            &[start, end] => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(anyhow::anyhow!("invalid cpulist: {}", item)),
        }
    }

    let cpus: Vec<u32> = cpulist
        .trim_end()
        .split(',')
        .map(parse_cpulist_item)
        .collect::<anyhow::Result<Vec<Vec<u32>>>>()?
        .into_iter()
        .flatten()
        .collect();

    Ok(cpus)
}
