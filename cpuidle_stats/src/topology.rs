//! CPU topology tree (cluster → core → cpu) and the bottom-up aggregation of
//! idle states along it.

use std::collections::TryReserveError;
use std::fmt::Display;
use std::io::Write;

use log::debug;
use regex::Regex;

use crate::error::{TopologyError, TraceError};
use crate::intersect::merge_tables;
use crate::stats::{CpuStates, CstateTable};

/// Name of a cluster in reports and trace headers: `clusterA` for physical id 0.
pub fn cluster_name(physical_id: u32) -> String {
    let letter = char::from_u32('A' as u32 + physical_id).unwrap_or('?');
    format!("cluster{letter}")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    /// Sorted by id.
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Physical package id.
    pub id: u32,
    /// Sorted by id.
    pub cores: Vec<Core>,
    cstates: Option<CstateTable>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Core {
    pub id: u32,
    /// Hardware threads, sorted by id.
    pub cpus: Vec<Cpu>,
    states: CoreStates,
}

/// Idle states of a core, once aggregated.
#[derive(Debug, Clone, PartialEq)]
enum CoreStates {
    Unbound,
    /// Single hardware thread: the table of that CPU, by index.
    Thread(usize),
    Merged(CstateTable),
}

/// A hardware thread. Its statistics are `per_cpu[id]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cpu {
    pub id: usize,
}

fn insert_sorted<T>(items: &mut Vec<T>, id: u64, key: impl Fn(&T) -> u64, make: impl FnOnce() -> T) -> &mut T {
    let pos = match items.binary_search_by_key(&id, key) {
        Ok(pos) => pos,
        Err(pos) => {
            items.insert(pos, make());
            pos
        }
    };
    &mut items[pos]
}

impl Topology {
    /// Adds a CPU to the tree, creating its cluster and core as needed.
    /// Adding a CPU twice has no effect.
    pub fn add_cpu(&mut self, cluster_id: u32, core_id: u32, cpu_id: usize) {
        let cluster = insert_sorted(&mut self.clusters, cluster_id.into(), |c| c.id.into(), || Cluster {
            id: cluster_id,
            cores: Vec::new(),
            cstates: None,
        });
        let core = insert_sorted(&mut cluster.cores, core_id.into(), |c| c.id.into(), || Core {
            id: core_id,
            cpus: Vec::new(),
            states: CoreStates::Unbound,
        });
        insert_sorted(&mut core.cpus, cpu_id as u64, |c| c.id as u64, || Cpu { id: cpu_id });
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// All the CPUs of the tree, in tree order.
    pub fn cpus(&self) -> impl Iterator<Item = &Cpu> {
        self.clusters.iter().flat_map(|c| c.cores.iter()).flat_map(|c| c.cpus.iter())
    }

    pub fn find_cpu(&self, cpu_id: usize) -> Option<&Cpu> {
        self.cpus().find(|c| c.id == cpu_id)
    }

    /// Writes the tree as trace header comments.
    pub fn write_header(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for cluster in &self.clusters {
            writeln!(out, "# {}:", cluster_name(cluster.id))?;
            for core in &cluster.cores {
                writeln!(out, "#\tcore{}", core.id)?;
                for cpu in &core.cpus {
                    writeln!(out, "#\t\tcpu{}", cpu.id)?;
                }
            }
        }
        Ok(())
    }

    fn fmt_rec(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for cluster in &self.clusters {
            writeln!(f, "{}:", cluster_name(cluster.id))?;
            for core in &cluster.cores {
                writeln!(f, "\tcore{}", core.id)?;
                for cpu in &core.cpus {
                    writeln!(f, "\t\tcpu{}", cpu.id)?;
                }
            }
        }
        Ok(())
    }
}

impl Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_rec(f)
    }
}

impl Cluster {
    /// Idle states during which every core of the cluster was idle.
    pub fn cstates(&self) -> Option<&CstateTable> {
        self.cstates.as_ref()
    }
}

impl Core {
    /// `true` if the core has more than one hardware thread.
    pub fn is_ht(&self) -> bool {
        self.cpus.len() > 1
    }

    /// Idle states during which every thread of the core was idle.
    ///
    /// For a single-thread core, this is the table of its CPU in `per_cpu`.
    pub fn cstates<'a>(&'a self, per_cpu: &'a [CpuStates]) -> Option<&'a CstateTable> {
        match &self.states {
            CoreStates::Unbound => None,
            CoreStates::Thread(index) => per_cpu.get(*index).map(|s| &s.cstates),
            CoreStates::Merged(table) => Some(table),
        }
    }
}

/// Incremental parser of the topology comments of a trace header:
///
/// ```text
/// # clusterA:
/// #	core0
/// #		cpu0
/// #		cpu1
/// #	cpu2
/// ```
///
/// A cpu directly under a cluster is a single-thread core with the id of the cpu.
pub struct HeaderParser {
    line_re: Regex,
    cluster: Option<u32>,
    core: Option<u32>,
}

impl HeaderParser {
    pub fn new() -> Result<HeaderParser, regex::Error> {
        let line_re = Regex::new(
            r"^#(?:\s*cluster(?P<cluster>[A-Z]):|\tcore(?P<core>\d+)|\tcpu(?P<cpu>\d+)|\t\tcpu(?P<thread>\d+))\s*$",
        )?;
        Ok(HeaderParser {
            line_re,
            cluster: None,
            core: None,
        })
    }

    /// Feeds one comment line. Comments that do not describe the topology are ignored.
    pub fn parse_line(&mut self, topology: &mut Topology, line: &str) -> Result<(), TraceError> {
        let Some(caps) = self.line_re.captures(line) else {
            return Ok(());
        };
        let invalid = || TraceError::Header(format!("misplaced topology line '{}'", line.trim_end()));
        let number = |s: &str| s.parse::<u32>().map_err(|_| invalid());

        if let Some(letter) = caps.name("cluster") {
            let letter = letter.as_str().chars().next().ok_or_else(invalid)?;
            self.cluster = Some(letter as u32 - 'A' as u32);
            self.core = None;
        } else if let Some(core) = caps.name("core") {
            self.cluster.ok_or_else(invalid)?;
            self.core = Some(number(core.as_str())?);
        } else if let Some(cpu) = caps.name("cpu") {
            let cluster = self.cluster.ok_or_else(invalid)?;
            let cpu = number(cpu.as_str())?;
            self.core = None;
            topology.add_cpu(cluster, cpu, cpu as usize);
        } else if let Some(cpu) = caps.name("thread") {
            let (cluster, core) = self.cluster.zip(self.core).ok_or_else(invalid)?;
            topology.add_cpu(cluster, core, number(cpu.as_str())? as usize);
        }
        Ok(())
    }
}

fn check_mapping(topology: &Topology, per_cpu: &[CpuStates]) -> Result<(), TopologyError> {
    let mut unknown: Vec<usize> = topology.cpus().map(|c| c.id).filter(|id| *id >= per_cpu.len()).collect();
    if unknown.len() == topology.cpus().count() {
        return Err(TopologyError::Unmapped);
    }
    let missing: Vec<usize> = per_cpu
        .iter()
        .enumerate()
        .filter(|(id, states)| states.is_active() && topology.find_cpu(*id).is_none())
        .map(|(id, _)| id)
        .collect();
    if !missing.is_empty() || !unknown.is_empty() {
        unknown.sort_unstable();
        return Err(TopologyError::Mismatch { missing, unknown });
    }
    Ok(())
}

/// Binds the CPUs of the topology to their statistics and computes the idle
/// states of every core and cluster.
///
/// If the topology does not match the trace, an error is returned and the
/// topology is left untouched: use [`flat_aggregate`] instead.
pub fn aggregate(topology: &mut Topology, per_cpu: &[CpuStates]) -> Result<(), TopologyError> {
    check_mapping(topology, per_cpu)?;

    // compute everything first, so that a failure leaves the tree as it was
    let mut core_states = Vec::new();
    let mut cluster_states = Vec::new();
    for cluster in &topology.clusters {
        let mut cores = Vec::with_capacity(cluster.cores.len());
        for core in &cluster.cores {
            let states = match core.cpus.as_slice() {
                [single] => {
                    debug!("cpu{} is not HT: core{} states are the cpu states", single.id, core.id);
                    CoreStates::Thread(single.id)
                }
                cpus => {
                    let tables: Vec<&CstateTable> = cpus.iter().map(|c| &per_cpu[c.id].cstates).collect();
                    CoreStates::Merged(merge_tables(&tables)?)
                }
            };
            cores.push(states);
        }

        let tables: Vec<&CstateTable> = cores
            .iter()
            .filter_map(|states| match states {
                CoreStates::Unbound => None,
                CoreStates::Thread(index) => Some(&per_cpu[*index].cstates),
                CoreStates::Merged(table) => Some(table),
            })
            .collect();
        cluster_states.push(merge_tables(&tables)?);
        core_states.push(cores);
    }

    for ((cluster, cores), cstates) in topology.clusters.iter_mut().zip(core_states).zip(cluster_states) {
        for (core, states) in cluster.cores.iter_mut().zip(cores) {
            core.states = states;
        }
        cluster.cstates = Some(cstates);
    }
    Ok(())
}

/// Intersects the idle states of every CPU that took part in the trace, as if
/// the machine was a single cluster.
pub fn flat_aggregate(per_cpu: &[CpuStates]) -> Result<CstateTable, TryReserveError> {
    let tables: Vec<&CstateTable> = per_cpu.iter().filter(|s| s.is_active()).map(|s| &s.cstates).collect();
    merge_tables(&tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Interval, StateStats};

    fn cpu_with(intervals: &[(f64, f64)]) -> CpuStates {
        let mut cpu = CpuStates::default();
        let state = cpu.cstates.entry(0, || "WFI".to_owned());
        for (b, e) in intervals {
            state.push(Interval::closed(*b, *e).unwrap()).unwrap();
        }
        cpu.events = intervals.len() as u64 * 2;
        cpu
    }

    fn parse(header: &str) -> Topology {
        let mut parser = HeaderParser::new().unwrap();
        let mut topology = Topology::default();
        for line in header.lines() {
            parser.parse_line(&mut topology, line).unwrap();
        }
        topology
    }

    #[test]
    fn test_sorted_insertion() {
        let mut topo = Topology::default();
        topo.add_cpu(1, 0, 4);
        topo.add_cpu(0, 1, 3);
        topo.add_cpu(0, 0, 1);
        topo.add_cpu(0, 0, 0);
        topo.add_cpu(0, 0, 0);

        let ids: Vec<usize> = topo.cpus().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1, 3, 4]);
        assert_eq!(topo.clusters.len(), 2);
        assert!(topo.clusters[0].cores[0].is_ht());
        assert!(!topo.clusters[0].cores[1].is_ht());
    }

    #[test]
    fn test_parse_header() {
        let topo = parse("# tracer: nop\n# clusterA:\n#\tcore0\n#\t\tcpu0\n#\t\tcpu1\n# clusterB:\n#\tcpu3\n#\tcpu2\n");
        assert_eq!(topo.clusters.len(), 2);
        let a = &topo.clusters[0];
        assert_eq!(a.id, 0);
        assert_eq!(a.cores[0].cpus.iter().map(|c| c.id).collect::<Vec<_>>(), vec![0, 1]);
        let b = &topo.clusters[1];
        assert_eq!(b.id, 1);
        assert_eq!(b.cores.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(b.cores[1].cpus[0].id, 3);
    }

    #[test]
    fn test_header_round_trip() {
        let mut topo = Topology::default();
        topo.add_cpu(0, 0, 0);
        topo.add_cpu(0, 0, 1);
        topo.add_cpu(1, 2, 2);

        let mut out = Vec::new();
        topo.write_header(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "# clusterA:\n#\tcore0\n#\t\tcpu0\n#\t\tcpu1\n# clusterB:\n#\tcore2\n#\t\tcpu2\n");
        assert_eq!(parse(&text), topo);
        assert_eq!(topo.to_string(), "clusterA:\n\tcore0\n\t\tcpu0\n\t\tcpu1\nclusterB:\n\tcore2\n\t\tcpu2\n");
    }

    #[test]
    fn test_misplaced_lines() {
        let mut parser = HeaderParser::new().unwrap();
        let mut topo = Topology::default();
        assert!(parser.parse_line(&mut topo, "#\t\tcpu0").is_err());
        parser.parse_line(&mut topo, "# clusterA:").unwrap();
        // a thread needs a core
        assert!(parser.parse_line(&mut topo, "#\t\tcpu0").is_err());
        assert!(topo.is_empty());
    }

    #[test]
    fn test_aggregate() {
        let per_cpu = vec![
            cpu_with(&[(0.0, 1.0), (2.0, 3.0)]),
            cpu_with(&[(0.5, 2.5)]),
            cpu_with(&[(0.0, 4.0)]),
        ];
        let mut topo = Topology::default();
        topo.add_cpu(0, 0, 0);
        topo.add_cpu(0, 0, 1);
        topo.add_cpu(0, 1, 2);
        aggregate(&mut topo, &per_cpu).unwrap();

        let cluster = &topo.clusters[0];
        let core0 = cluster.cores[0].cstates(&per_cpu).unwrap();
        let wfi = core0.get(0).unwrap();
        assert_eq!(wfi.stats.count, 2);
        assert_eq!(wfi.stats.mean, 500_000.0);

        // single-thread core: same table as the cpu
        let core1 = cluster.cores[1].cstates(&per_cpu).unwrap();
        assert!(std::ptr::eq(core1, &per_cpu[2].cstates));

        let all = cluster.cstates().unwrap().get(0).unwrap();
        assert_eq!(all.stats.total_duration_us, 1_000_000.0);
        assert!(topo.find_cpu(1).is_some());
    }

    #[test]
    fn test_cpu_without_events_keeps_its_core_busy() {
        // cpu1 is in the tree but never reported anything
        let per_cpu = vec![cpu_with(&[(0.0, 1.0)]), CpuStates::default(), cpu_with(&[(0.0, 1.0)])];
        let mut topo = Topology::default();
        topo.add_cpu(0, 0, 0);
        topo.add_cpu(0, 0, 1);
        topo.add_cpu(1, 2, 2);
        aggregate(&mut topo, &per_cpu).unwrap();

        let core0 = topo.clusters[0].cores[0].cstates(&per_cpu).unwrap();
        assert_eq!(core0.get(0).unwrap().stats.count, 0);
        assert_eq!(topo.clusters[0].cstates().unwrap().get(0).unwrap().stats.count, 0);
        assert_eq!(topo.clusters[1].cstates().unwrap().get(0).unwrap().stats.count, 1);

        // without topology only the cpus with events are intersected
        let flat = flat_aggregate(&per_cpu).unwrap();
        assert_eq!(flat.get(0).unwrap().stats.count, 1);
    }

    #[test]
    fn test_mismatch_leaves_topology_untouched() {
        let per_cpu = vec![cpu_with(&[(0.0, 1.0)]), cpu_with(&[(0.5, 2.0)])];

        let mut partial = Topology::default();
        partial.add_cpu(0, 0, 0);
        let before = partial.clone();
        match aggregate(&mut partial, &per_cpu) {
            Err(TopologyError::Mismatch { missing, unknown }) => {
                assert_eq!(missing, vec![1]);
                assert!(unknown.is_empty());
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(partial, before);

        let mut elsewhere = Topology::default();
        elsewhere.add_cpu(0, 0, 8);
        assert!(matches!(aggregate(&mut elsewhere, &per_cpu), Err(TopologyError::Unmapped)));
        assert!(matches!(aggregate(&mut Topology::default(), &per_cpu), Err(TopologyError::Unmapped)));

        let flat = flat_aggregate(&per_cpu).unwrap();
        let wfi: &StateStats = flat.get(0).unwrap();
        assert_eq!(wfi.intervals.len(), 1);
        assert_eq!(wfi.stats.total_duration_us, 500_000.0);
    }
}
