//! Decoding of the ftrace text format.
//!
//! A line looks like
//! `<idle>-0     [001] d..2   123.456789: cpu_idle: state=1 cpu_id=1`,
//! where the flags column (`d..2`) only exists when the irq-info option of the
//! tracer is set.

use regex::Regex;

use crate::error::TraceError;
use crate::stats::{IrqKind, StateId};

/// Value of the `state=` field of `cpu_idle` when a CPU leaves idle: `(u32)-1`.
pub const IDLE_EXIT_STATE: i64 = u32::MAX as i64;

/// Marker written by the recorder to report the frequency of each CPU at the
/// start and the end of the acquisition.
pub const FREQUENCY_MARKER: &str = "idlestat_frequency";

const DECODED_EVENTS: [&str; 5] = [
    "cpu_idle",
    "cpu_frequency",
    FREQUENCY_MARKER,
    "irq_handler_entry",
    "ipi_handler_entry",
];

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    IdleEnter(StateId),
    IdleExit,
    FreqChange(u32),
    IrqEntry { id: i32, name: String, kind: IrqKind },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    /// Seconds, trace clock.
    pub timestamp: f64,
    pub cpu: usize,
    pub kind: EventKind,
}

/// Turns trace lines into [`TraceEvent`]s.
pub struct TraceDecoder {
    line_re: Regex,
    state_re: Regex,
    irq_re: Regex,
}

impl TraceDecoder {
    pub fn new() -> Result<TraceDecoder, regex::Error> {
        let line_re = Regex::new(
            r"^\s*(?P<task>.*)-(?P<pid>\d+)\s+(?:\(\s*[-\d]+\)\s+)?\[(?P<cpu>\d+)\](?:\s+\S{4,6})?\s+(?P<ts>\d+\.\d+):\s+(?P<event>\w+):\s*(?P<payload>.*)$",
        )?;
        let state_re = Regex::new(r"^state=(?P<state>-?\d+)\s+cpu_id=(?P<cpu>\d+)\s*$")?;
        let irq_re = Regex::new(r"^(?:irq|ipi)=(?P<id>-?\d+)\s+name=(?P<name>\S+)")?;
        Ok(TraceDecoder {
            line_re,
            state_re,
            irq_re,
        })
    }

    /// Decodes one line of the trace.
    ///
    /// Returns `Ok(None)` for lines that carry no event we are interested in.
    /// A line that mentions one of our events but does not follow the grammar
    /// is an error: the trace is corrupted or comes from an incompatible
    /// kernel, and silently skipping it would distort every interval after it.
    pub fn decode(&self, line_number: usize, line: &str) -> Result<Option<TraceEvent>, TraceError> {
        let malformed = || TraceError::MalformedEvent {
            line: line_number,
            content: line.trim_end().to_owned(),
        };

        let Some(caps) = self.line_re.captures(line) else {
            if DECODED_EVENTS.iter().any(|e| line.contains(e)) {
                return Err(malformed());
            }
            return Ok(None);
        };

        let timestamp: f64 = caps["ts"].parse().map_err(|_| malformed())?;
        let line_cpu: usize = caps["cpu"].parse().map_err(|_| malformed())?;
        let mut event = &caps["event"];
        let mut payload = &caps["payload"];

        // user-space markers: "tracing_mark_write: idlestat_frequency: state=... cpu_id=..."
        if event == "tracing_mark_write" {
            match payload.split_once(':') {
                Some((marker, rest)) if marker.trim() == FREQUENCY_MARKER => {
                    event = FREQUENCY_MARKER;
                    payload = rest.trim_start();
                }
                _ => return Ok(None),
            }
        }

        let (kind, cpu) = match event {
            "cpu_idle" => {
                let (state, cpu) = self.parse_state(payload).ok_or_else(malformed)?;
                let kind = if state == IDLE_EXIT_STATE || state < 0 {
                    EventKind::IdleExit
                } else {
                    let id = StateId::try_from(state).map_err(|_| malformed())?;
                    EventKind::IdleEnter(id)
                };
                (kind, cpu)
            }
            "cpu_frequency" | FREQUENCY_MARKER => {
                let (freq, cpu) = self.parse_state(payload).ok_or_else(malformed)?;
                let freq = u32::try_from(freq).map_err(|_| malformed())?;
                (EventKind::FreqChange(freq), cpu)
            }
            "irq_handler_entry" | "ipi_handler_entry" => {
                let caps = self.irq_re.captures(payload).ok_or_else(malformed)?;
                let id: i32 = caps["id"].parse().map_err(|_| malformed())?;
                let kind = if event == "irq_handler_entry" {
                    IrqKind::Hard
                } else {
                    IrqKind::Ipi
                };
                let name = caps["name"].to_owned();
                (EventKind::IrqEntry { id, name, kind }, line_cpu)
            }
            _ => return Ok(None),
        };

        Ok(Some(TraceEvent { timestamp, cpu, kind }))
    }

    /// Parses `state=<n> cpu_id=<cpu>`.
    fn parse_state(&self, payload: &str) -> Option<(i64, usize)> {
        let caps = self.state_re.captures(payload)?;
        let state = caps["state"].parse().ok()?;
        let cpu = caps["cpu"].parse().ok()?;
        Some((state, cpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(line: &str) -> Option<TraceEvent> {
        TraceDecoder::new().unwrap().decode(1, line).unwrap()
    }

    #[test]
    fn test_decode_cpu_idle() {
        let enter = decode("          <idle>-0     [001] d..2   123.456789: cpu_idle: state=2 cpu_id=1").unwrap();
        assert_eq!(enter.timestamp, 123.456789);
        assert_eq!(enter.cpu, 1);
        assert_eq!(enter.kind, EventKind::IdleEnter(2));

        let exit = decode("          <idle>-0     [003] 124.000001: cpu_idle: state=4294967295 cpu_id=3").unwrap();
        assert_eq!(exit.cpu, 3);
        assert_eq!(exit.kind, EventKind::IdleExit);

        let exit_signed = decode("<idle>-0 [000] 1.5: cpu_idle: state=-1 cpu_id=0").unwrap();
        assert_eq!(exit_signed.kind, EventKind::IdleExit);
    }

    #[test]
    fn test_decode_frequency() {
        let evt = decode("     kworker/0:1-1234  [000] ....   10.000000: cpu_frequency: state=1200000 cpu_id=2").unwrap();
        // the cpu is the one of the payload, not the one that ran the governor
        assert_eq!(evt.cpu, 2);
        assert_eq!(evt.kind, EventKind::FreqChange(1_200_000));

        let marker =
            decode("        idlestat-4242  [001] ....     9.000000: tracing_mark_write: idlestat_frequency: state=800000 cpu_id=1")
                .unwrap();
        assert_eq!(marker.cpu, 1);
        assert_eq!(marker.kind, EventKind::FreqChange(800_000));

        assert_eq!(decode("bash-12 [000] .... 9.5: tracing_mark_write: hello world"), None);
    }

    #[test]
    fn test_decode_irqs() {
        let irq = decode("          <idle>-0     [002] d.h1   20.000010: irq_handler_entry: irq=27 name=arch_timer").unwrap();
        assert_eq!(irq.cpu, 2);
        assert_eq!(
            irq.kind,
            EventKind::IrqEntry {
                id: 27,
                name: "arch_timer".to_owned(),
                kind: IrqKind::Hard
            }
        );

        let ipi = decode("          <idle>-0     [000] d.h1   20.5: ipi_handler_entry: ipi=1 name=Rescheduling interrupts").unwrap();
        assert_eq!(ipi.cpu, 0);
        assert_eq!(
            ipi.kind,
            EventKind::IrqEntry {
                id: 1,
                name: "Rescheduling".to_owned(),
                kind: IrqKind::Ipi
            }
        );
    }

    #[test]
    fn test_task_names_with_dashes() {
        let evt = decode("  my-task-name-77  [004] d..1  5.25: cpu_idle: state=0 cpu_id=4").unwrap();
        assert_eq!(evt.cpu, 4);
        assert_eq!(evt.kind, EventKind::IdleEnter(0));
    }

    #[test]
    fn test_ignored_lines() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("# tracer: nop"), None);
        assert_eq!(decode("  bash-1 [000] d..2 1.0: sched_switch: prev_comm=bash prev_pid=1"), None);
    }

    #[test]
    fn test_malformed_lines() {
        let decoder = TraceDecoder::new().unwrap();
        let garbage = decoder.decode(42, "<idle>-0 [001] d..2 oops: cpu_idle: state=1 cpu_id=1");
        match garbage {
            Err(TraceError::MalformedEvent { line, .. }) => assert_eq!(line, 42),
            other => panic!("unexpected result {other:?}"),
        }

        let bad_payload = decoder.decode(7, "<idle>-0 [001] d..2 1.0: cpu_idle: state=1");
        assert!(matches!(bad_payload, Err(TraceError::MalformedEvent { line: 7, .. })));

        let bad_irq = decoder.decode(8, "<idle>-0 [001] d.h1 1.0: irq_handler_entry: name=foo");
        assert!(matches!(bad_irq, Err(TraceError::MalformedEvent { line: 8, .. })));
    }
}
