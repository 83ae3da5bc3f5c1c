//! Textual output: statistics tables, raw interval dumps and energy estimates.

use std::io::Write;

use cpuidle_stats::{
    energy::EnergyReport,
    stats::{CpuStates, CstateTable, RunningStats},
    topology::{cluster_name, Topology},
};

pub struct ReportOptions {
    /// Print the raw intervals instead of the statistics.
    pub dump: bool,
    /// Maximum number of intervals to dump per state.
    pub iterations: Option<usize>,
}

fn write_row(out: &mut dyn Write, pad: &str, name: &str, stats: &RunningStats) -> std::io::Result<()> {
    writeln!(
        out,
        "{pad} {name}\t{}\t{:15.2}\t{:15.2}\t{:.2}\t{:.2}",
        stats.count,
        stats.total_duration_us,
        stats.mean,
        stats.min_or_zero(),
        stats.max
    )
}

/// Statistics of one node. The P-states and the wakeups are only known for cpus.
fn write_stats(out: &mut dyn Write, label: &str, cstates: &CstateTable, cpu: Option<&CpuStates>) -> std::io::Result<()> {
    let pad = " ".repeat(label.len());
    writeln!(out, "{label}@state\thits\t      total(us)\t\tavg(us)\tmin(us)\tmax(us)")?;
    for (_, state) in cstates.iter().filter(|(_, s)| s.stats.count > 0) {
        write_row(out, &pad, &state.name, &state.stats)?;
    }

    let Some(cpu) = cpu else {
        return Ok(());
    };

    let mut pstates: Vec<_> = cpu.pstates.iter().filter(|p| p.stats.count > 0).collect();
    pstates.sort_by_key(|p| p.frequency_khz);
    for p in pstates {
        write_row(out, &pad, &(p.frequency_khz / 1000).to_string(), &p.stats)?;
    }

    if !cpu.irqs.is_empty() {
        writeln!(out, "{label} wakeups \tname \t\tcount\twakeups")?;
        for irq in cpu.irqs.values() {
            writeln!(
                out,
                "{pad} {}{:03}\t{:<15.15}\t{}\t{}",
                irq.kind.label(),
                irq.id,
                irq.name,
                irq.count,
                irq.total_wakeups()
            )?;
        }
    }
    Ok(())
}

/// Raw idle intervals of one node, `iterations` at most per state.
fn write_dump(out: &mut dyn Write, cstates: &CstateTable, iterations: Option<usize>) -> std::io::Result<()> {
    for (_, state) in cstates.iter() {
        let max = iterations.unwrap_or(usize::MAX);
        for interval in state.intervals.iter().take(max) {
            writeln!(out, "{:.6}: enter {}", interval.begin, state.name)?;
            writeln!(out, "{:.6}: exit {}", interval.end, state.name)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_node(
    out: &mut dyn Write,
    label: &str,
    cstates: &CstateTable,
    cpu: Option<&CpuStates>,
    opts: &ReportOptions,
) -> std::io::Result<()> {
    if opts.dump {
        write_dump(out, cstates, opts.iterations)
    } else {
        write_stats(out, label, cstates, cpu)
    }
}

/// Report of an aggregated topology: every cluster, multi-thread core and cpu.
pub fn write_topology(out: &mut dyn Write, topology: &Topology, per_cpu: &[CpuStates], opts: &ReportOptions) -> std::io::Result<()> {
    let empty = CstateTable::default();
    for cluster in &topology.clusters {
        let cstates = cluster.cstates().unwrap_or(&empty);
        write_node(out, &cluster_name(cluster.id), cstates, None, opts)?;

        for core in &cluster.cores {
            let indent = if core.is_ht() {
                let cstates = core.cstates(per_cpu).unwrap_or(&empty);
                write_node(out, &format!("  core{}", core.id), cstates, None, opts)?;
                4
            } else {
                2
            };

            for cpu in &core.cpus {
                let Some(states) = per_cpu.get(cpu.id) else {
                    continue;
                };
                let label = format!("{:indent$}cpu{}", "", cpu.id);
                write_node(out, &label, &states.cstates, Some(states), opts)?;
            }
        }
    }
    Ok(())
}

/// Report without topology: every cpu of the trace, then the whole machine.
pub fn write_flat(out: &mut dyn Write, per_cpu: &[CpuStates], machine: &CstateTable, opts: &ReportOptions) -> std::io::Result<()> {
    for (id, states) in per_cpu.iter().enumerate().filter(|(_, s)| s.is_active()) {
        write_node(out, &format!("cpu{id}"), &states.cstates, Some(states), opts)?;
    }
    write_node(out, "cluster", machine, None, opts)
}

pub fn write_energy(out: &mut dyn Write, report: &EnergyReport) -> std::io::Result<()> {
    for cluster in &report.clusters {
        writeln!(
            out,
            "{}: idle energy {:.3}, cap state energy {:.3}, wakeup energy {:.3}, total {:.3}",
            cluster_name(cluster.cluster_id),
            cluster.idle,
            cluster.cap,
            cluster.wakeup,
            cluster.total()
        )?;
    }
    writeln!(
        out,
        "Total energy: idle {:.3}, cap states {:.3}, wakeups {:.3}, total {:.3}",
        report.idle(),
        report.cap(),
        report.wakeup(),
        report.total()
    )
}
