//! Discovery of the CPUs of the machine in sysfs: topology, idle state names and frequencies.
//!
//! All the functions take the root of the cpu directory (normally
//! [`SYSFS_CPU_PATH`]) so that they can run against a copy of the tree.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use log::{debug, warn};

use crate::parse_cpu_list;
use crate::topology::Topology;
use crate::trace_file::TraceLoader;

pub const SYSFS_CPU_PATH: &str = "/sys/devices/system/cpu";

fn cpu_dir(root: &Path, cpu: usize) -> PathBuf {
    root.join(format!("cpu{cpu}"))
}

fn read_trimmed(path: &Path) -> anyhow::Result<String> {
    let content = fs::read_to_string(path).with_context(|| format!("read {}", path.to_string_lossy()))?;
    Ok(content.trim().to_owned())
}

fn read_number(path: &Path) -> anyhow::Result<i64> {
    let content = read_trimmed(path)?;
    content
        .parse()
        .with_context(|| format!("parse {}: '{content}'", path.to_string_lossy()))
}

/// The CPUs that can be brought online, from `possible`.
pub fn configured_cpus(root: &Path) -> anyhow::Result<Vec<u32>> {
    let list = read_trimmed(&root.join("possible"))?;
    parse_cpu_list(&list)
}

/// Builds the topology of the machine from the `topology` directory of every cpu.
///
/// The physical package is the cluster. Packages reported as `-1` (no package
/// information) are put in the first cluster.
pub fn read_topology(root: &Path) -> anyhow::Result<Topology> {
    let mut topology = Topology::default();
    for e in fs::read_dir(root).with_context(|| format!("list {}", root.to_string_lossy()))? {
        let entry = e?;
        let path = entry.path();
        let file_name = entry.file_name();
        let Some(cpu_id) = file_name
            .to_str()
            .and_then(|name| name.strip_prefix("cpu"))
            .and_then(|id| id.parse::<usize>().ok())
        else {
            continue; // cpufreq, cpuidle, online...
        };

        let topo_dir = path.join("topology");
        if !topo_dir.is_dir() {
            debug!("cpu{cpu_id} has no topology, skipped");
            continue;
        }
        let core_id = read_number(&topo_dir.join("core_id"))?;
        let package_id = read_number(&topo_dir.join("physical_package_id"))?;
        topology.add_cpu(package_id.max(0) as u32, core_id.max(0) as u32, cpu_id);
    }
    Ok(topology)
}

/// Names of the idle states of `cpu`, by state index.
///
/// Returns an empty list if the cpu has no cpuidle directory.
pub fn cstate_names(root: &Path, cpu: usize) -> anyhow::Result<Vec<String>> {
    let cpuidle = cpu_dir(root, cpu).join("cpuidle");
    let mut names = Vec::new();
    loop {
        let state_dir = cpuidle.join(format!("state{}", names.len()));
        if !state_dir.is_dir() {
            break;
        }
        names.push(read_trimmed(&state_dir.join("name"))?);
    }
    Ok(names)
}

/// Frequencies (kHz) advertised by the cpufreq driver of `cpu`, if it advertises any.
pub fn available_frequencies(root: &Path, cpu: usize) -> anyhow::Result<Option<Vec<u32>>> {
    let path = cpu_dir(root, cpu).join("cpufreq/scaling_available_frequencies");
    if !path.exists() {
        return Ok(None);
    }
    let content = read_trimmed(&path)?;
    let freqs = content
        .split_whitespace()
        .map(|f| f.parse::<u32>().with_context(|| format!("invalid frequency '{f}' in {}", path.to_string_lossy())))
        .collect::<anyhow::Result<Vec<u32>>>()?;
    Ok(Some(freqs))
}

/// Current frequency (kHz) of `cpu`.
pub fn current_frequency(root: &Path, cpu: usize) -> anyhow::Result<u32> {
    let path = cpu_dir(root, cpu).join("cpufreq/scaling_cur_freq");
    let content = read_trimmed(&path)?;
    content
        .parse()
        .with_context(|| format!("parse {}: '{content}'", path.to_string_lossy()))
}

/// A trace loader that knows the C-state names and the frequencies of the
/// machine described by `root`.
///
/// Without a cpu directory (no sysfs, or a trace analysed elsewhere) the
/// loader names the states `state<N>` and discovers the frequencies.
pub fn trace_loader(root: &Path) -> anyhow::Result<TraceLoader> {
    let mut loader = TraceLoader::new();
    if !root.join("possible").exists() {
        warn!(
            "no cpu list in {}, idle states are named by index",
            root.to_string_lossy()
        );
        return Ok(loader);
    }
    for cpu in configured_cpus(root)? {
        let cpu = cpu as usize;
        let names = cstate_names(root, cpu)?;
        if !names.is_empty() {
            loader = loader.with_cstate_names(cpu, names);
        }
        if let Some(freqs) = available_frequencies(root, cpu)? {
            loader = loader.with_frequencies(cpu, freqs);
        }
    }
    Ok(loader)
}
