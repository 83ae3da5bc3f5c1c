use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use cli::{Cli, Commands, ReportArgs};
use cpuidle_stats::{calculate_energy, sysfs, Aggregation, EnergyModel, TraceLoader};
use record::Acquisition;
use report::ReportOptions;

mod cli;
mod record;
mod report;

const WRITER_BUFFER_CAPACITY: usize = 8192 * 10;

fn main() -> Result<(), anyhow::Error> {
    // parse CLI arguments
    let cli = Cli::parse();

    // initialize logger
    let level = if cli.verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().default_filter_or(level);
    env_logger::init_from_env(env);

    // run the command
    match cli.command {
        Commands::Import {
            trace_file,
            sysfs,
            report,
        } => {
            let loader = sysfs::trace_loader(&sysfs)?;
            analyze(&loader, &trace_file, &report)?;
        }
        Commands::Record {
            trace_file,
            duration,
            tracefs,
            sysfs,
            report,
            command,
        } => {
            record::check_root()?;
            let trace_file = match trace_file {
                Some(f) => f,
                None => record::default_trace_file()?,
            };
            let acq = Acquisition {
                tracefs: &tracefs,
                sysfs: &sysfs,
                duration: Duration::from_secs(duration),
                command: &command,
            };
            record::record(&acq, &trace_file)?;
            let loader = sysfs::trace_loader(&sysfs)?;
            analyze(&loader, &trace_file, &report)?;
        }
        Commands::Topology { sysfs } => {
            let topology = sysfs::read_topology(&sysfs)?;
            print!("{topology}");
        }
    }

    Ok(())
}

/// Loads a trace and prints its report on stdout.
fn analyze(loader: &TraceLoader, trace_file: &Path, args: &ReportArgs) -> anyhow::Result<()> {
    let model = match &args.energy_model {
        Some(path) => Some(EnergyModel::from_file(path)?),
        None => None,
    };

    let mut trace_log = loader
        .load(trace_file)
        .with_context(|| format!("Failed to load {}", trace_file.to_string_lossy()))?;
    info!("Compute idle data intersections...");
    let aggregation = trace_log.aggregate()?;

    let opts = ReportOptions {
        dump: args.dump,
        iterations: args.iterations,
    };
    let mut out = BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, std::io::stdout().lock());
    match aggregation {
        Aggregation::Topology => {
            report::write_topology(&mut out, &trace_log.topology, trace_log.cpus(), &opts)?;
            if let Some(model) = &model {
                let energy = calculate_energy(&trace_log.topology, trace_log.cpus(), model);
                report::write_energy(&mut out, &energy)?;
            }
        }
        Aggregation::Flat(machine) => {
            report::write_flat(&mut out, trace_log.cpus(), &machine, &opts)?;
            if model.is_some() {
                warn!("The energy estimation needs the topology of the traced machine, skipped");
            }
        }
    }
    out.flush()?;
    Ok(())
}
