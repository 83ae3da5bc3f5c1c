//! Replays decoded trace events into per-CPU statistics.
//!
//! Each CPU moves along two axes: running or idle in some C-state, and the
//! frequency (P-state) it runs at. P-state dwell time is only accounted while
//! the CPU is running.

use log::debug;

use crate::error::TraceError;
use crate::event::{EventKind, TraceEvent};
use crate::stats::{CpuStates, Interval, IrqKind, PstateTable, StateId, WakeupIrq, USEC_PER_SEC};

/// Parsing state of one CPU, only needed while the trace is replayed.
#[derive(Debug, Clone, Default)]
struct CpuRuntime {
    /// Last C-state entered, kept after the exit so that wakeups can be attributed.
    last_open_cstate: Option<StateId>,
    /// Start of the open idle period.
    idle_since: f64,
    current_pstate: Option<usize>,
    pstate_enter_time: f64,
    is_idle: bool,
    /// First interrupt seen since the last idle entry.
    last_wakeup_irq: Option<(IrqKind, i32)>,
}

/// Result of a replay.
#[derive(Debug, Clone)]
pub struct ProcessedTrace {
    pub cpus: Vec<CpuStates>,
    /// Number of events that were applied.
    pub events: u64,
    /// Timestamps of the first and the last C-state event.
    pub span: Option<(f64, f64)>,
}

impl ProcessedTrace {
    /// Duration covered by the C-state events, in seconds.
    pub fn duration(&self) -> f64 {
        self.span.map(|(first, last)| last - first).unwrap_or(0.0)
    }
}

/// Consumes trace events one at a time, in log order.
pub struct CpuTraceProcessor {
    cpus: Vec<CpuStates>,
    runtime: Vec<CpuRuntime>,
    /// C-state names by CPU, indexed by state id.
    cstate_names: Vec<Vec<String>>,
    events: u64,
    span: Option<(f64, f64)>,
}

impl CpuTraceProcessor {
    /// Creates a processor for `nr_cpus` CPUs, with discovered P-state tables
    /// and default C-state names.
    pub fn new(nr_cpus: usize) -> CpuTraceProcessor {
        CpuTraceProcessor {
            cpus: vec![CpuStates::default(); nr_cpus],
            runtime: vec![CpuRuntime::default(); nr_cpus],
            cstate_names: vec![Vec::new(); nr_cpus],
            events: 0,
            span: None,
        }
    }

    /// Restricts the P-states of `cpu` to the given frequencies (kHz).
    ///
    /// Must be called before the first event of that CPU.
    pub fn advertise_frequencies(&mut self, cpu: usize, frequencies: &[u32]) {
        if let Some(states) = self.cpus.get_mut(cpu) {
            states.pstates = PstateTable::advertised(frequencies.iter().copied());
        }
    }

    /// Sets the names of the C-states of `cpu`, the name of state `i` being `names[i]`.
    pub fn name_cstates(&mut self, cpu: usize, names: Vec<String>) {
        if let Some(n) = self.cstate_names.get_mut(cpu) {
            *n = names;
        }
    }

    /// Applies one event to the statistics of its CPU.
    ///
    /// Every error except [`TraceError::Alloc`] means that the event was
    /// ignored, and the replay can go on with the next one.
    pub fn process_event(&mut self, event: &TraceEvent) -> Result<(), TraceError> {
        let nr_cpus = self.cpus.len();
        let cpu = event.cpu;
        let (Some(states), Some(rt)) = (self.cpus.get_mut(cpu), self.runtime.get_mut(cpu)) else {
            return Err(TraceError::UnknownCpu { cpu, nr_cpus });
        };
        let t = event.timestamp;

        match &event.kind {
            EventKind::IdleEnter(state) => {
                let names = &self.cstate_names[cpu];
                enter_idle(states, rt, *state, t, names);
                extend_span(&mut self.span, t);
            }
            EventKind::IdleExit => {
                extend_span(&mut self.span, t);
                exit_idle(cpu, states, rt, t)?;
            }
            EventKind::FreqChange(freq_khz) => change_pstate(cpu, states, rt, *freq_khz, t)?,
            EventKind::IrqEntry { id, name, kind } => record_irq(states, rt, *id, name, *kind),
        }

        states.events += 1;
        self.events += 1;
        Ok(())
    }

    /// Ends the replay. Idle periods still open at the end of the trace are dropped.
    pub fn finish(self) -> ProcessedTrace {
        for (cpu, rt) in self.runtime.iter().enumerate() {
            if rt.is_idle {
                debug!("cpu{cpu}: dropping idle period opened at {:.6}, never closed", rt.idle_since);
            }
        }
        ProcessedTrace {
            cpus: self.cpus,
            events: self.events,
            span: self.span,
        }
    }
}

fn extend_span(span: &mut Option<(f64, f64)>, t: f64) {
    *span = match *span {
        None => Some((t, t)),
        Some((first, last)) => Some((first.min(t), last.max(t))),
    };
}

fn cstate_name(names: &[String], state: StateId) -> String {
    names
        .get(state as usize)
        .cloned()
        .unwrap_or_else(|| format!("state{state}"))
}

fn close_pstate(states: &mut CpuStates, rt: &CpuRuntime, t: f64) {
    if let Some(current) = rt.current_pstate {
        let elapsed = (t - rt.pstate_enter_time) * USEC_PER_SEC;
        if elapsed >= 0.0 {
            states.pstates.record_dwell(current, elapsed);
        }
    }
}

fn enter_idle(states: &mut CpuStates, rt: &mut CpuRuntime, state: StateId, t: f64, names: &[String]) {
    if !rt.is_idle {
        close_pstate(states, rt, t);
    }
    // a second entry without exit restarts the idle period
    rt.is_idle = true;
    rt.idle_since = t;
    rt.last_open_cstate = Some(state);
    rt.last_wakeup_irq = None;
    states.cstates.entry(state, || cstate_name(names, state));
}

fn exit_idle(cpu: usize, states: &mut CpuStates, rt: &mut CpuRuntime, t: f64) -> Result<(), TraceError> {
    let state = match (rt.is_idle, rt.last_open_cstate) {
        (true, Some(state)) => state,
        _ => return Err(TraceError::OutOfOrderClose { cpu, time: t }),
    };

    // a rejected exit leaves the cpu idle, with its P-state dwell suspended
    let Some(interval) = Interval::closed(rt.idle_since, t) else {
        return Err(TraceError::NegativeDuration {
            cpu,
            state,
            duration_us: (t - rt.idle_since) * USEC_PER_SEC,
        });
    };

    rt.is_idle = false;
    if rt.current_pstate.is_some() {
        rt.pstate_enter_time = t;
    }
    let cstate = states.cstates.entry(state, || format!("state{state}"));
    cstate.push(interval)?;
    debug!(
        "  cpu{cpu}: {:.6} - {:.6} => {:12.1}, total[{}]: {:12.1}",
        interval.begin, interval.end, interval.duration_us, cstate.name, cstate.stats.total_duration_us
    );
    Ok(())
}

fn change_pstate(cpu: usize, states: &mut CpuStates, rt: &mut CpuRuntime, freq_khz: u32, t: f64) -> Result<(), TraceError> {
    let next = states
        .pstates
        .resolve(freq_khz)
        .ok_or(TraceError::UnknownFrequency { cpu, freq_khz })?;

    if !rt.is_idle {
        close_pstate(states, rt, t);
        rt.pstate_enter_time = t;
    }
    rt.current_pstate = Some(next);
    Ok(())
}

fn record_irq(states: &mut CpuStates, rt: &mut CpuRuntime, id: i32, name: &str, kind: IrqKind) {
    let key = (kind, id);
    let irq = states.irqs.entry(key).or_insert_with(|| WakeupIrq::new(id, kind, name));
    irq.count += 1;

    if rt.last_wakeup_irq.is_none() {
        if let Some(state) = rt.last_open_cstate {
            *irq.wakeups.entry(state).or_default() += 1;
            states.wakeups_by_kind[kind] += 1;
            rt.last_wakeup_irq = Some(key);
        }
    }
}
