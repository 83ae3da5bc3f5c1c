use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use cpuidle_stats::{ftrace::TRACEFS_PATH, sysfs::SYSFS_CPU_PATH};

/// Idle and frequency statistics of the cpus, from kernel traces.
#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    /// Log every interval and every ignored event.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze a trace recorded earlier.
    Import {
        /// The trace to load.
        #[arg(short = 'f', long)]
        trace_file: PathBuf,

        /// Take the C-state names and the frequencies of the cpus from this sysfs cpu directory.
        /// Point it to a missing directory when the trace comes from another machine.
        #[arg(long, default_value = SYSFS_CPU_PATH)]
        sysfs: PathBuf,

        #[command(flatten)]
        report: ReportArgs,
    },

    /// Record a trace (requires root), then analyze it.
    Record {
        /// Where to store the trace. Defaults to `idlestat-<date>.trace`.
        #[arg(short = 'f', long)]
        trace_file: Option<PathBuf>,

        /// Duration of the acquisition, in seconds.
        /// With a command, the command is terminated when the duration is over.
        #[arg(short = 't', long)]
        duration: u64,

        /// Mount point of the tracing filesystem.
        #[arg(long, default_value = TRACEFS_PATH)]
        tracefs: PathBuf,

        /// The sysfs cpu directory.
        #[arg(long, default_value = SYSFS_CPU_PATH)]
        sysfs: PathBuf,

        #[command(flatten)]
        report: ReportArgs,

        /// Command to run during the acquisition.
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Show the cpu topology of this machine, then exit.
    Topology {
        /// The sysfs cpu directory.
        #[arg(long, default_value = SYSFS_CPU_PATH)]
        sysfs: PathBuf,
    },
}

#[derive(Args)]
pub struct ReportArgs {
    /// Energy model of the platform, to estimate the energy consumed.
    #[arg(short, long)]
    pub energy_model: Option<PathBuf>,

    /// Print the raw idle intervals instead of the statistics.
    #[arg(long)]
    pub dump: bool,

    /// Maximum number of intervals to print per state, with `--dump`.
    #[arg(short, long)]
    pub iterations: Option<usize>,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::{CommandFactory, Parser};
    use cpuidle_stats::sysfs::SYSFS_CPU_PATH;

    use super::{Cli, Commands};

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_import_reads_local_sysfs_by_default() {
        let cli = Cli::try_parse_from(["idlestat", "import", "-f", "run.trace", "-e", "model.txt"]).unwrap();
        match cli.command {
            Commands::Import { sysfs, report, .. } => {
                assert_eq!(sysfs, PathBuf::from(SYSFS_CPU_PATH));
                assert_eq!(report.energy_model, Some(PathBuf::from("model.txt")));
            }
            _ => panic!("expected the import command"),
        }
    }

    #[test]
    fn test_parse_record() {
        let cli = Cli::try_parse_from(["idlestat", "-v", "record", "-t", "10", "--dump", "-i", "3", "--", "make", "-j4"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Record {
                trace_file,
                duration,
                report,
                command,
                ..
            } => {
                assert_eq!(trace_file, None);
                assert_eq!(duration, 10);
                assert!(report.dump);
                assert_eq!(report.iterations, Some(3));
                assert_eq!(command, vec!["make", "-j4"]);
            }
            _ => panic!("expected the record command"),
        }
    }
}
