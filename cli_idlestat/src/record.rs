//! Acquisition of a trace: the tracer runs while we sleep, or while a command runs.

use std::{
    path::{Path, PathBuf},
    process::Command,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use cpuidle_stats::{ftrace::Ftrace, sysfs};
use log::{info, warn};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// How often we check whether the command has exited.
const CHILD_POLL_PERIOD: Duration = Duration::from_millis(10);

pub struct Acquisition<'a> {
    pub tracefs: &'a Path,
    pub sysfs: &'a Path,
    pub duration: Duration,
    /// Command to run while recording, may be empty.
    pub command: &'a [String],
}

/// The tracing files are only writable by root.
pub fn check_root() -> anyhow::Result<()> {
    // SAFETY: geteuid cannot fail
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("must be root to run traces");
    }
    Ok(())
}

/// `idlestat-<date>.trace`
pub fn default_trace_file() -> anyhow::Result<PathBuf> {
    let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
    Ok(PathBuf::from(format!("idlestat-{now}.trace")))
}

/// Records a trace into `out_path`.
pub fn record(acq: &Acquisition, out_path: &Path) -> anyhow::Result<()> {
    let topology = sysfs::read_topology(acq.sysfs)?;
    let cpus = sysfs::configured_cpus(acq.sysfs)?;
    let nr_cpus = cpus.iter().max().map_or(0, |max| *max as usize + 1);

    let ftrace = Ftrace::new(acq.tracefs);
    // stop tracing, just in case
    ftrace.set_tracing(false)?;

    // a buffer large enough for the whole acquisition, so that we can sleep
    // instead of reading the trace and disturbing the measurements
    ftrace.init(acq.duration.as_secs().max(1))?;
    ftrace.flush()?;

    ftrace.while_tracing(|| {
        // wake every cpu up, an idle period that starts before the trace cannot be closed
        ftrace.mark_frequencies(acq.sysfs, &cpus)?;
        execute(acq.command, acq.duration)?;
        ftrace.mark_frequencies(acq.sysfs, &cpus)
    })?;

    let events = ftrace.store(out_path, nr_cpus, &topology)?;
    info!("{events} trace lines stored in {}", out_path.to_string_lossy());
    Ok(())
}

/// Waits for `duration`, or runs `command` and terminates it if it is still
/// running after `duration`.
fn execute(command: &[String], duration: Duration) -> anyhow::Result<()> {
    let Some((program, args)) = command.split_first() else {
        std::thread::sleep(duration);
        return Ok(());
    };

    let mut child = Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("Failed to run {program}"))?;
    let deadline = Instant::now() + duration;

    loop {
        if let Some(status) = child.try_wait()? {
            info!("{program} exited with {status}");
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(CHILD_POLL_PERIOD.min(deadline - now));
    }

    warn!("{program} still running after {:?}, terminating it", duration);
    // SAFETY: plain syscall on the pid of our own child, which has not been reaped yet
    let res = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    if res != 0 {
        warn!("kill failed: {}", std::io::Error::last_os_error());
        child.kill()?;
    }
    child.wait()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_sleep() -> anyhow::Result<()> {
        let start = Instant::now();
        execute(&[], Duration::from_millis(50))?;
        assert!(start.elapsed() >= Duration::from_millis(50));
        Ok(())
    }

    #[test]
    fn test_execute_terminates_at_deadline() -> anyhow::Result<()> {
        let start = Instant::now();
        let command = ["sleep".to_owned(), "30".to_owned()];
        execute(&command, Duration::from_millis(200))?;
        assert!(start.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn test_default_trace_file() -> anyhow::Result<()> {
        let name = default_trace_file()?.to_string_lossy().to_string();
        assert!(name.starts_with("idlestat-"));
        assert!(name.ends_with(".trace"));
        Ok(())
    }
}
