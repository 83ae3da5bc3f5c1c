//! Reading and writing of idlestat trace logs.
//!
//! A log starts with a version line and a `cpus=<n>` line, followed by the
//! topology of the traced machine as comment lines, followed by the raw ftrace
//! lines.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use log::{debug, info, warn};

use crate::error::{TopologyError, TraceError};
use crate::event::TraceDecoder;
use crate::processor::{CpuTraceProcessor, ProcessedTrace};
use crate::stats::{CpuStates, CstateTable};
use crate::topology::{aggregate, flat_aggregate, HeaderParser, Topology};

/// Version written in the first line of the logs we record.
pub const TRACE_FORMAT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Loads trace logs, optionally with the C-state names and the frequencies of
/// the traced machine.
#[derive(Debug, Clone, Default)]
pub struct TraceLoader {
    frequencies: BTreeMap<usize, Vec<u32>>,
    cstate_names: BTreeMap<usize, Vec<String>>,
}

/// A loaded log.
#[derive(Debug, Clone)]
pub struct TraceLog {
    pub version: String,
    pub nr_cpus: usize,
    pub topology: Topology,
    pub trace: ProcessedTrace,
    /// Events that were ignored (see [`TraceError::is_recoverable`]).
    pub skipped: u64,
}

/// Where the aggregated idle states of a log live.
#[derive(Debug, Clone)]
pub enum Aggregation {
    /// In the topology tree.
    Topology,
    /// The topology did not match: a single table for the whole machine.
    Flat(CstateTable),
}

impl TraceLoader {
    pub fn new() -> TraceLoader {
        TraceLoader::default()
    }

    /// Uses `frequencies` (kHz) as the P-states of `cpu`.
    pub fn with_frequencies(mut self, cpu: usize, frequencies: Vec<u32>) -> TraceLoader {
        self.frequencies.insert(cpu, frequencies);
        self
    }

    /// Uses `names` as the names of the C-states of `cpu`, by state id.
    pub fn with_cstate_names(mut self, cpu: usize, names: Vec<String>) -> TraceLoader {
        self.cstate_names.insert(cpu, names);
        self
    }

    pub fn load(&self, path: &Path) -> Result<TraceLog, TraceError> {
        let file = File::open(path).map_err(|source| TraceError::Io {
            path: path.to_owned(),
            source,
        })?;
        self.read(BufReader::new(file), path)
    }

    /// Reads a log from `reader`. `origin` is only used in error messages.
    pub fn read<R: BufRead>(&self, reader: R, origin: &Path) -> Result<TraceLog, TraceError> {
        let io_err = |source| TraceError::Io {
            path: origin.to_owned(),
            source,
        };
        let mut lines = reader.lines();

        let version = match lines.next() {
            Some(line) => {
                let line = line.map_err(io_err)?;
                line.trim().trim_start_matches("version =").trim().to_owned()
            }
            None => return Err(TraceError::Header("empty trace".to_owned())),
        };

        let nr_cpus: usize = match lines.next() {
            Some(line) => {
                let line = line.map_err(io_err)?;
                line.trim()
                    .strip_prefix("cpus=")
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| TraceError::Header(format!("expected 'cpus=<n>', got '{line}'")))?
            }
            None => return Err(TraceError::Header("missing 'cpus=' line".to_owned())),
        };
        if nr_cpus == 0 {
            return Err(TraceError::Header("read error for 'cpus=' in trace file".to_owned()));
        }

        let mut processor = CpuTraceProcessor::new(nr_cpus);
        for (cpu, freqs) in self.frequencies.range(..nr_cpus) {
            processor.advertise_frequencies(*cpu, freqs);
        }
        for (cpu, names) in self.cstate_names.range(..nr_cpus) {
            processor.name_cstates(*cpu, names.clone());
        }

        let decoder = TraceDecoder::new()?;
        let mut header = HeaderParser::new()?;
        let mut topology = Topology::default();
        let mut skipped = 0;

        // the first two lines have been consumed
        for (i, line) in lines.enumerate() {
            let line_number = i + 3;
            let line = line.map_err(io_err)?;
            if line.starts_with('#') {
                header.parse_line(&mut topology, &line)?;
                continue;
            }
            let Some(event) = decoder.decode(line_number, &line)? else {
                continue;
            };
            match processor.process_event(&event) {
                Ok(()) => (),
                Err(e @ TraceError::UnknownFrequency { .. }) => {
                    warn!("line {line_number}: {e}, event ignored");
                    skipped += 1;
                }
                Err(e) if e.is_recoverable() => {
                    debug!("line {line_number}: {e}, event ignored");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let trace = processor.finish();
        info!("Log is {:.6} secs long with {} events", trace.duration(), trace.events);
        if skipped > 0 {
            info!("{skipped} events were ignored, run with -v for details");
        }

        Ok(TraceLog {
            version,
            nr_cpus,
            topology,
            trace,
            skipped,
        })
    }
}

impl TraceLog {
    pub fn cpus(&self) -> &[CpuStates] {
        &self.trace.cpus
    }

    /// Aggregates the idle states along the topology, or over all the CPUs if
    /// the topology does not match the trace.
    pub fn aggregate(&mut self) -> Result<Aggregation, TraceError> {
        match aggregate(&mut self.topology, &self.trace.cpus) {
            Ok(()) => Ok(Aggregation::Topology),
            Err(TopologyError::Alloc(e)) => Err(TraceError::Alloc(e)),
            Err(e) => {
                if self.topology.is_empty() {
                    info!("No topology in the trace, aggregating over all the cpus");
                } else {
                    warn!("{e}, aggregating over all the cpus");
                }
                Ok(Aggregation::Flat(flat_aggregate(&self.trace.cpus)?))
            }
        }
    }
}

/// Writes the header of a log: version, number of CPUs and topology.
pub fn write_header(out: &mut dyn Write, nr_cpus: usize, topology: &Topology) -> std::io::Result<()> {
    writeln!(out, "version = {TRACE_FORMAT_VERSION}")?;
    writeln!(out, "cpus={nr_cpus}")?;
    topology.write_header(out)
}

/// Copies the event lines of a raw ftrace output, without its comments.
/// Returns the number of lines copied.
pub fn copy_events<R: BufRead>(raw: R, out: &mut dyn Write) -> std::io::Result<u64> {
    let mut copied = 0;
    for line in raw.lines() {
        let line = line?;
        if line.starts_with('#') {
            continue;
        }
        writeln!(out, "{line}")?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn read(text: &str) -> Result<TraceLog, TraceError> {
        TraceLoader::new().read(Cursor::new(text), Path::new("test.trace"))
    }

    #[test]
    fn test_header_errors() {
        assert!(matches!(read(""), Err(TraceError::Header(_))));
        assert!(matches!(read("version = 0.1\n"), Err(TraceError::Header(_))));
        assert!(matches!(read("version = 0.1\ncpus=0\n"), Err(TraceError::Header(_))));
        assert!(matches!(read("version = 0.1\nnrcpus: 2\n"), Err(TraceError::Header(_))));
    }

    #[test]
    fn test_read_minimal() {
        let log = read(
            "version = 0.4\ncpus=2\n# clusterA:\n#\tcpu0\n#\tcpu1\n\
             <idle>-0 [000] d..2 1.000000: cpu_idle: state=0 cpu_id=0\n\
             <idle>-0 [000] d..2 1.500000: cpu_idle: state=4294967295 cpu_id=0\n\
             <idle>-0 [001] d..2 1.700000: cpu_idle: state=4294967295 cpu_id=1\n",
        )
        .unwrap();
        assert_eq!(log.version, "0.4");
        assert_eq!(log.nr_cpus, 2);
        assert_eq!(log.topology.cpus().count(), 2);
        assert_eq!(log.trace.events, 2);
        assert_eq!(log.skipped, 1);
        assert_eq!(log.cpus()[0].cstates.get(0).unwrap().stats.count, 1);
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let err = read("version = 0.4\ncpus=1\n<idle>-0 [000] d..2 1.0: cpu_idle: state=0\n").unwrap_err();
        assert!(matches!(err, TraceError::MalformedEvent { line: 3, .. }));
    }

    #[test]
    fn test_write_header_and_copy() {
        let mut topo = Topology::default();
        topo.add_cpu(0, 0, 0);
        let mut out = Vec::new();
        write_header(&mut out, 1, &topo).unwrap();
        let raw = "# tracer: nop\n#\n<idle>-0 [000] d..2 1.0: cpu_idle: state=0 cpu_id=0\n";
        assert_eq!(copy_events(Cursor::new(raw), &mut out).unwrap(), 1);

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(&format!("version = {TRACE_FORMAT_VERSION}\ncpus=1\n# clusterA:\n")));
        let log = read(&text).unwrap();
        assert_eq!(log.topology, topo);
        assert_eq!(log.trace.events, 1);
    }
}
