//! Energy model of a platform and estimation of the energy consumed during a trace.
//!
//! The model file looks like this:
//!
//! ```text
//! clusters 1
//! clusterA: 2 cap states 2 C states
//! P-states
//! # speed (MHz), cluster power, core power
//! 1000 150 300
//! 1600 300 600
//! C-states
//! # name, cluster idle power, core idle power
//! WFI 10 5
//! cluster-sleep 0 0
//! wakeup 60 20
//! ```

use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::{debug, warn};
use regex::Regex;

use crate::error::EnergyModelError;
use crate::stats::{CpuStates, CstateTable, USEC_PER_SEC};
use crate::topology::{cluster_name, Cluster, Topology};

/// Converts the wakeup energies of the model (µJ) to the unit of the other
/// results (power × seconds, with powers in mW: mJ).
pub const WAKEUP_ENERGY_SCALE: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq)]
pub struct CapState {
    /// MHz
    pub speed: u32,
    pub cluster_power: f64,
    pub core_power: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CstatePower {
    pub name: String,
    pub cluster_idle_power: f64,
    pub core_idle_power: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WakeupEnergy {
    pub cluster: f64,
    pub core: f64,
}

/// Power table of one cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterEnergyModel {
    pub cap_states: Vec<CapState>,
    pub cstates: Vec<CstatePower>,
    pub wakeup: WakeupEnergy,
}

impl ClusterEnergyModel {
    pub fn cap_state(&self, freq_khz: u32) -> Option<&CapState> {
        self.cap_states.iter().find(|p| p.speed == freq_khz / 1000)
    }

    pub fn cstate(&self, name: &str) -> Option<&CstatePower> {
        self.cstates.iter().find(|c| c.name == name)
    }
}

/// Power tables of the clusters, cluster `i` of the model describing the
/// cluster of physical id `i`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnergyModel {
    pub clusters: Vec<ClusterEnergyModel>,
}

impl EnergyModel {
    pub fn from_file(path: &Path) -> Result<EnergyModel, EnergyModelError> {
        let text = fs::read_to_string(path).map_err(|source| EnergyModelError::Io {
            path: path.to_owned(),
            source,
        })?;
        text.parse()
    }

    pub fn cluster(&self, physical_id: u32) -> Option<&ClusterEnergyModel> {
        self.clusters.get(physical_id as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Header,
    CapStates,
    Cstates,
}

/// A cluster being parsed, with the number of entries it declared.
struct PendingCluster {
    model: ClusterEnergyModel,
    nr_cap_states: usize,
    nr_cstates: usize,
    section: Section,
}

impl FromStr for EnergyModel {
    type Err = EnergyModelError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let header_re = Regex::new(r"^cluster(?P<id>[A-Z]):\s*(?P<cap>\d+)\s+cap\s+states\s+(?P<c>\d+)\s+C\s+states\s*$")
            .map_err(|e| EnergyModelError::Parse {
                line: 0,
                reason: e.to_string(),
            })?;

        let mut clusters: Option<Vec<Option<PendingCluster>>> = None;
        let mut current: Option<usize> = None;

        for (i, raw) in text.lines().enumerate() {
            let line_number = i + 1;
            let err = |reason: String| EnergyModelError::Parse {
                line: line_number,
                reason,
            };
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();

            if fields[0] == "clusters" {
                if clusters.is_some() {
                    return Err(err("number of clusters already specified".to_owned()));
                }
                let n: usize = match fields.as_slice() {
                    [_, n] => n.parse().map_err(|_| err(format!("invalid number of clusters '{n}'")))?,
                    _ => return Err(err("expected 'clusters <n>'".to_owned())),
                };
                clusters = Some((0..n).map(|_| None).collect());
                continue;
            }

            let Some(table) = clusters.as_mut() else {
                return Err(err("'clusters <n>' must come first".to_owned()));
            };

            if fields[0].starts_with("cluster") && fields[0].ends_with(':') {
                let caps = header_re
                    .captures(line)
                    .ok_or_else(|| err(format!("expected 'clusterX: <n> cap states <m> C states', got '{line}'")))?;
                let letter = caps["id"].chars().next().unwrap_or('A');
                let id = (letter as u32 - 'A' as u32) as usize;
                let slot = table
                    .get_mut(id)
                    .ok_or_else(|| err(format!("cluster{letter} out of range")))?;
                if slot.is_some() {
                    return Err(err(format!("cluster{letter} already specified")));
                }
                let count = |name: &str| caps[name].parse::<usize>().map_err(|_| err(format!("invalid count '{}'", &caps[name])));
                *slot = Some(PendingCluster {
                    model: ClusterEnergyModel::default(),
                    nr_cap_states: count("cap")?,
                    nr_cstates: count("c")?,
                    section: Section::Header,
                });
                current = Some(id);
                continue;
            }

            let pending = match current {
                Some(id) => table.get_mut(id).and_then(Option::as_mut),
                None => None,
            };
            let cluster = pending.ok_or_else(|| err(format!("'{}' before any cluster header", fields[0])))?;

            match fields.as_slice() {
                ["P-states"] => cluster.section = Section::CapStates,
                ["C-states"] => cluster.section = Section::Cstates,
                ["wakeup", rest @ ..] => {
                    let [cluster_energy, core_energy] = rest else {
                        return Err(err("expected 'wakeup <cluster> <core>'".to_owned()));
                    };
                    cluster.model.wakeup = WakeupEnergy {
                        cluster: parse_number(cluster_energy).map_err(err)?,
                        core: parse_number(core_energy).map_err(err)?,
                    };
                }
                data => match cluster.section {
                    Section::Header => return Err(err(format!("data line '{line}' outside of a P-states/C-states section"))),
                    Section::CapStates => {
                        let [speed, cluster_power, core_power] = data else {
                            return Err(err(format!("expected P-state 'speed cluster core', got '{line}'")));
                        };
                        if cluster.model.cap_states.len() >= cluster.nr_cap_states {
                            return Err(err("too many cap states".to_owned()));
                        }
                        cluster.model.cap_states.push(CapState {
                            speed: speed.parse().map_err(|_| err(format!("invalid speed '{speed}'")))?,
                            cluster_power: parse_number(cluster_power).map_err(err)?,
                            core_power: parse_number(core_power).map_err(err)?,
                        });
                    }
                    Section::Cstates => {
                        let [name, cluster_power, core_power] = data else {
                            return Err(err(format!("expected C-state 'name cluster core', got '{line}'")));
                        };
                        if cluster.model.cstates.len() >= cluster.nr_cstates {
                            return Err(err("too many C states".to_owned()));
                        }
                        cluster.model.cstates.push(CstatePower {
                            name: (*name).to_owned(),
                            cluster_idle_power: parse_number(cluster_power).map_err(err)?,
                            core_idle_power: parse_number(core_power).map_err(err)?,
                        });
                    }
                },
            }
        }

        let clusters = clusters.ok_or(EnergyModelError::Parse {
            line: 0,
            reason: "missing 'clusters <n>'".to_owned(),
        })?;
        Ok(EnergyModel {
            clusters: clusters
                .into_iter()
                .map(|c| c.map(|c| c.model).unwrap_or_default())
                .collect(),
        })
    }
}

fn parse_number(field: &str) -> Result<f64, String> {
    field.parse().map_err(|_| format!("invalid number '{field}'"))
}

/// Energy of one cluster, in the units of the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterEnergy {
    pub cluster_id: u32,
    pub idle: f64,
    pub cap: f64,
    pub wakeup: f64,
}

impl ClusterEnergy {
    pub fn total(&self) -> f64 {
        self.idle + self.cap + self.wakeup
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnergyReport {
    pub clusters: Vec<ClusterEnergy>,
}

impl EnergyReport {
    pub fn idle(&self) -> f64 {
        self.clusters.iter().map(|c| c.idle).sum()
    }

    pub fn cap(&self) -> f64 {
        self.clusters.iter().map(|c| c.cap).sum()
    }

    pub fn wakeup(&self) -> f64 {
        self.clusters.iter().map(|c| c.wakeup).sum()
    }

    pub fn total(&self) -> f64 {
        self.clusters.iter().map(ClusterEnergy::total).sum()
    }
}

fn seconds(duration_us: f64) -> f64 {
    duration_us / USEC_PER_SEC
}

fn cluster_cpus<'a>(cluster: &'a Cluster, per_cpu: &'a [CpuStates]) -> impl Iterator<Item = &'a CpuStates> {
    cluster
        .cores
        .iter()
        .flat_map(|core| core.cpus.iter())
        .filter_map(|cpu| per_cpu.get(cpu.id))
}

fn idle_energy(cluster: &Cluster, cluster_states: Option<&CstateTable>, per_cpu: &[CpuStates], model: &ClusterEnergyModel) -> f64 {
    let mut energy = 0.0;
    let cluster_duration = |id| {
        cluster_states
            .and_then(|t| t.get(id))
            .map(|s| seconds(s.stats.total_duration_us))
            .unwrap_or(0.0)
    };

    if let Some(table) = cluster_states {
        for (_, state) in table.iter() {
            match model.cstate(&state.name) {
                Some(power) => energy += seconds(state.stats.total_duration_us) * power.cluster_idle_power,
                None => debug!("{}: no power for state {}", cluster_name(cluster.id), state.name),
            }
        }
    }

    for cpu in cluster_cpus(cluster, per_cpu) {
        for (id, state) in cpu.cstates.iter() {
            if let Some(power) = model.cstate(&state.name) {
                let own = seconds(state.stats.total_duration_us) - cluster_duration(id);
                energy += own * power.core_idle_power;
            }
        }
    }
    energy
}

fn cap_energy(cluster: &Cluster, per_cpu: &[CpuStates], model: &ClusterEnergyModel) -> f64 {
    let mut energy = 0.0;
    for cap in &model.cap_states {
        let mut cluster_dwell: f64 = 0.0;
        for cpu in cluster_cpus(cluster, per_cpu) {
            let dwell = cpu
                .pstates
                .iter()
                .filter(|p| p.frequency_khz / 1000 == cap.speed)
                .map(|p| seconds(p.stats.total_duration_us))
                .sum::<f64>();
            energy += dwell * cap.core_power;
            cluster_dwell = cluster_dwell.max(dwell);
        }
        // the cluster runs at least as long as its busiest core
        energy += cluster_dwell * cap.cluster_power;
    }

    for cpu in cluster_cpus(cluster, per_cpu) {
        for p in cpu.pstates.iter().filter(|p| p.stats.count > 0) {
            if model.cap_state(p.frequency_khz).is_none() {
                debug!("{}: no cap state for {} MHz", cluster_name(cluster.id), p.frequency_khz / 1000);
            }
        }
    }
    energy
}

fn wakeup_energy(cluster_states: Option<&CstateTable>, model: &ClusterEnergyModel) -> f64 {
    let entries: u64 = cluster_states
        .map(|t| t.iter().map(|(_, s)| s.stats.count).sum())
        .unwrap_or(0);
    entries as f64 * model.wakeup.cluster * WAKEUP_ENERGY_SCALE
}

/// Estimates the energy consumed by each cluster of an aggregated topology.
///
/// States and frequencies that the model does not describe are left out.
pub fn calculate_energy(topology: &Topology, per_cpu: &[CpuStates], model: &EnergyModel) -> EnergyReport {
    let mut report = EnergyReport::default();
    for cluster in &topology.clusters {
        let Some(cluster_model) = model.cluster(cluster.id) else {
            debug!("no energy model for {}", cluster_name(cluster.id));
            continue;
        };
        let states = cluster.cstates();
        let mut names = cluster_cpus(cluster, per_cpu)
            .flat_map(|cpu| cpu.cstates.iter())
            .map(|(_, s)| s.name.as_str())
            .peekable();
        if names.peek().is_some() && !names.any(|name| cluster_model.cstate(name).is_some()) {
            warn!(
                "{}: no idle state of the trace is in the energy model, its idle energy is not counted",
                cluster_name(cluster.id)
            );
        }
        report.clusters.push(ClusterEnergy {
            cluster_id: cluster.id,
            idle: idle_energy(cluster, states, per_cpu, cluster_model),
            cap: cap_energy(cluster, per_cpu, cluster_model),
            wakeup: wakeup_energy(states, cluster_model),
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Interval, PstateTable};
    use crate::topology::aggregate;

    const MODEL: &str = "\
# test platform
clusters 1
clusterA: 2 cap states 1 C states

P-states
1000 100 20
1600 200 40
C-states
WFI 10 5
wakeup 60 20
";

    fn idle_cpu(intervals: &[(f64, f64)]) -> CpuStates {
        let mut cpu = CpuStates::default();
        let wfi = cpu.cstates.entry(0, || "WFI".to_owned());
        for (b, e) in intervals {
            wfi.push(Interval::closed(*b, *e).unwrap()).unwrap();
        }
        cpu.events = 1;
        cpu
    }

    fn parse_error_line(text: &str) -> usize {
        match text.parse::<EnergyModel>() {
            Err(EnergyModelError::Parse { line, .. }) => line,
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_model() {
        let model: EnergyModel = MODEL.parse().unwrap();
        assert_eq!(model.clusters.len(), 1);
        let a = model.cluster(0).unwrap();
        assert_eq!(a.cap_states.len(), 2);
        assert_eq!(a.cap_state(1_600_000).unwrap().core_power, 40.0);
        assert!(a.cap_state(1_200_000).is_none());
        assert_eq!(a.cstate("WFI").unwrap().cluster_idle_power, 10.0);
        assert_eq!(a.wakeup, WakeupEnergy { cluster: 60.0, core: 20.0 });
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_error_line("clusters 1\nclusters 2\n"), 2);
        assert_eq!(parse_error_line("clusterA: 1 cap states 1 C states\n"), 1);
        assert_eq!(parse_error_line("clusters 1\nclusterB: 1 cap states 1 C states\n"), 2);
        assert_eq!(
            parse_error_line("clusters 1\nclusterA: 1 cap states 1 C states\nclusterA: 1 cap states 1 C states\n"),
            3
        );
        assert_eq!(parse_error_line("clusters 1\nP-states\n"), 2);
        assert_eq!(parse_error_line("clusters 1\nclusterA: 1 cap states 1 C states\n1000 1 1\n"), 3);
        assert_eq!(
            parse_error_line("clusters 1\nclusterA: 1 cap states 1 C states\nP-states\n1000 1 1\n1200 2 2\n"),
            5
        );
        assert_eq!(parse_error_line("clusters 1\nclusterA: 1 cap states 1 C states\nC-states\nWFI 1\n"), 4);
        assert_eq!(parse_error_line("clusters 1\nclusterA: 1 cap states 1 C states\nP-states\nfast 1 1\n"), 4);
        assert_eq!(parse_error_line("clusters 1\nclusterA: 1 cap states 1 C states\nwakeup x 1\n"), 3);
        assert_eq!(parse_error_line("# nothing\n"), 0);
    }

    #[test]
    fn test_idle_energy() {
        // cluster idle 2s at 10, cpu0 idle 1s more at 5
        let per_cpu = vec![idle_cpu(&[(0.0, 3.0)]), idle_cpu(&[(0.0, 2.0)])];
        let mut topo = Topology::default();
        topo.add_cpu(0, 0, 0);
        topo.add_cpu(0, 0, 1);
        aggregate(&mut topo, &per_cpu).unwrap();

        let model: EnergyModel = MODEL.parse().unwrap();
        let report = calculate_energy(&topo, &per_cpu, &model);
        assert_eq!(report.clusters.len(), 1);
        assert!((report.idle() - 25.0).abs() < 1e-9);
        assert_eq!(report.cap(), 0.0);
        // one cluster-level idle entry
        assert!((report.wakeup() - 60.0 * WAKEUP_ENERGY_SCALE).abs() < 1e-12);
    }

    #[test]
    fn test_cap_energy() {
        let mut busy = idle_cpu(&[]);
        busy.pstates = PstateTable::discovered();
        let i = busy.pstates.resolve(1_600_000).unwrap();
        busy.pstates.record_dwell(i, 2_000_000.0);
        let j = busy.pstates.resolve(1_200_000).unwrap();
        busy.pstates.record_dwell(j, 5_000_000.0);

        let mut other = idle_cpu(&[]);
        let k = other.pstates.resolve(1_600_000).unwrap();
        other.pstates.record_dwell(k, 1_000_000.0);

        let per_cpu = vec![busy, other];
        let mut topo = Topology::default();
        topo.add_cpu(0, 0, 0);
        topo.add_cpu(0, 1, 1);
        aggregate(&mut topo, &per_cpu).unwrap();

        let model: EnergyModel = MODEL.parse().unwrap();
        let report = calculate_energy(&topo, &per_cpu, &model);
        // cores: (2 + 1) * 40, cluster: max(2, 1) * 200, 1200 MHz is not in the model
        assert!((report.cap() - 520.0).abs() < 1e-9);
    }
}
