//! Control of the kernel function tracer through the tracing filesystem.

use std::{
    fmt::Display,
    fs::{self, File, OpenOptions},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use log::{debug, info, warn};

use crate::event::FREQUENCY_MARKER;
use crate::sysfs;
use crate::topology::Topology;
use crate::trace_file::{copy_events, write_header};

pub const TRACEFS_PATH: &str = "/sys/kernel/debug/tracing";

/// Worst case of idle transitions per second and per cpu.
const IDLE_HITS_PER_SEC: u64 = 10_000;
/// Length of a `cpu_idle` line.
const IDLE_LINE_LEN: u64 = 196;

/// Size of the trace buffer (kB) needed to record `duration_secs` seconds
/// without having to read the trace in the meantime.
pub fn buffer_size_kb(duration_secs: u64) -> u64 {
    2 * IDLE_LINE_LEN * IDLE_HITS_PER_SEC * duration_secs / 1024 + 1
}

/// Events recorded by [`Ftrace::init`], relative to `events/`.
/// The ipi events are optional, older kernels lack them.
const EVENTS: [(&str, bool); 4] = [
    ("power/cpu_idle", true),
    ("power/cpu_frequency", true),
    ("irq", true),
    ("ipi", false),
];

pub struct Ftrace {
    root: PathBuf,
}

impl Ftrace {
    pub fn new(root: impl Into<PathBuf>) -> Ftrace {
        Ftrace { root: root.into() }
    }

    fn write_value(&self, rel: &str, value: impl Display) -> anyhow::Result<()> {
        let path = self.root.join(rel);
        fs::write(&path, value.to_string()).with_context(|| format!("write {}", path.to_string_lossy()))
    }

    fn read_value(&self, rel: &str) -> anyhow::Result<u64> {
        let path = self.root.join(rel);
        let content = fs::read_to_string(&path).with_context(|| format!("read {}", path.to_string_lossy()))?;
        content
            .trim()
            .parse()
            .with_context(|| format!("parse {}: '{}'", path.to_string_lossy(), content.trim()))
    }

    pub fn set_tracing(&self, on: bool) -> anyhow::Result<()> {
        self.write_value("tracing_on", u8::from(on)).with_context(|| {
            format!(
                "Failed to toggle the tracer, is ftrace available and tracefs mounted on {}?",
                self.root.to_string_lossy()
            )
        })
    }

    /// Sizes the buffer for `duration_secs` seconds and enables the power and irq events only.
    ///
    /// Returns the total size of the buffer (kB), as reported by the kernel.
    pub fn init(&self, duration_secs: u64) -> anyhow::Result<u64> {
        let size = buffer_size_kb(duration_secs);
        self.write_value("buffer_size_kb", size)?;
        let total = match self.read_value("buffer_total_size_kb") {
            Ok(total) => total,
            Err(e) => {
                debug!("{e:?}");
                size
            }
        };
        info!("Total trace buffer: {total} kB");

        self.write_value("events/enable", 0)?;
        for (event, required) in EVENTS {
            let enable = format!("events/{event}/enable");
            if !required && !self.root.join(&enable).exists() {
                debug!("event {event} not available, skipped");
                continue;
            }
            self.write_value(&enable, 1)?;
        }
        Ok(total)
    }

    /// Removes the previous traces.
    pub fn flush(&self) -> anyhow::Result<()> {
        let path = self.root.join("trace");
        File::create(&path).with_context(|| format!("flush {}", path.to_string_lossy()))?;
        Ok(())
    }

    /// Turns tracing on, runs `f`, then turns tracing off whatever `f` returned.
    pub fn while_tracing<T>(&self, f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
        self.set_tracing(true)?;
        let res = f();
        let stopped = self.set_tracing(false);
        let value = res?;
        stopped?;
        Ok(value)
    }

    /// Writes the current frequency of every cpu in the trace, from that cpu.
    ///
    /// Running on each cpu in turn also wakes it up, so that no cpu sits in an
    /// idle state whose entry is not in the trace. The initial affinity of the
    /// thread is restored, even on error.
    pub fn mark_frequencies(&self, sysfs_root: &Path, cpus: &[u32]) -> anyhow::Result<()> {
        let marker_path = self.root.join("trace_marker");
        let mut marker = OpenOptions::new()
            .write(true)
            .open(&marker_path)
            .with_context(|| format!("open {}", marker_path.to_string_lossy()))?;

        let initial = current_affinity()?;
        let marked = write_markers(&mut marker, &marker_path, sysfs_root, cpus);
        let restored = restore_affinity(&initial);
        marked?;
        restored
    }

    /// Writes the header and the recorded events to `out_path`.
    /// Returns the number of events written.
    pub fn store(&self, out_path: &Path, nr_cpus: usize, topology: &Topology) -> anyhow::Result<u64> {
        let trace_path = self.root.join("trace");
        let raw = File::open(&trace_path).with_context(|| format!("open {}", trace_path.to_string_lossy()))?;
        let out = File::create(out_path).with_context(|| format!("create {}", out_path.to_string_lossy()))?;
        let mut out = BufWriter::new(out);

        write_header(&mut out, nr_cpus, topology)?;
        let copied = copy_events(BufReader::new(raw), &mut out)
            .with_context(|| format!("copy {} to {}", trace_path.to_string_lossy(), out_path.to_string_lossy()))?;
        out.flush()?;
        Ok(copied)
    }
}

fn write_markers(marker: &mut File, marker_path: &Path, sysfs_root: &Path, cpus: &[u32]) -> anyhow::Result<()> {
    for &cpu in cpus {
        let cpu = cpu as usize;
        pin_to_cpu(cpu)?;
        match sysfs::current_frequency(sysfs_root, cpu) {
            Ok(freq) => {
                debug!("cpu{cpu:03} running @ {freq} kHz");
                // one write per marker, the kernel turns each write into one event
                marker
                    .write_all(format!("{FREQUENCY_MARKER}: state={freq} cpu_id={cpu}\n").as_bytes())
                    .with_context(|| format!("write {}", marker_path.to_string_lossy()))?;
            }
            Err(e) => warn!("cpu{cpu}: no current frequency: {e:#}"),
        }
    }
    Ok(())
}

fn current_affinity() -> anyhow::Result<libc::cpu_set_t> {
    // SAFETY: cpu_set_t is a plain bitmask, and the kernel writes at most its size.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            bail!("sched_getaffinity failed: {}", std::io::Error::last_os_error());
        }
        Ok(set)
    }
}

fn restore_affinity(set: &libc::cpu_set_t) -> anyhow::Result<()> {
    // SAFETY: see current_affinity
    let res = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set) };
    if res != 0 {
        bail!("sched_setaffinity failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Moves the calling thread to `cpu`.
pub fn pin_to_cpu(cpu: usize) -> anyhow::Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        bail!("cannot run on cpu{cpu}: affinity masks stop at {} cpus", libc::CPU_SETSIZE);
    }
    // SAFETY: see current_affinity
    let set = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        set
    };
    restore_affinity(&set).with_context(|| format!("cannot run on cpu{cpu}"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn fake_tracefs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for event in ["power/cpu_idle", "power/cpu_frequency", "irq"] {
            let event_dir = dir.path().join("events").join(event);
            fs::create_dir_all(&event_dir).unwrap();
            fs::write(event_dir.join("enable"), "0\n").unwrap();
        }
        fs::write(dir.path().join("trace"), "# tracer: nop\n#\n  <idle>-0 [000] d..2 1.0: cpu_idle: state=0 cpu_id=0\n").unwrap();
        dir
    }

    fn allowed_cpu() -> usize {
        let set = current_affinity().unwrap();
        (0..libc::CPU_SETSIZE as usize)
            .find(|cpu| unsafe { libc::CPU_ISSET(*cpu, &set) })
            .unwrap()
    }

    #[test]
    fn test_pin_out_of_range() {
        assert!(pin_to_cpu(libc::CPU_SETSIZE as usize).is_err());
        assert!(pin_to_cpu(usize::MAX).is_err());
    }

    #[test]
    fn test_affinity_restored_after_failed_marking() -> anyhow::Result<()> {
        let dir = fake_tracefs();
        fs::write(dir.path().join("trace_marker"), "")?;
        let ftrace = Ftrace::new(dir.path());
        let before = current_affinity()?;

        let cpus = [allowed_cpu() as u32, 5000];
        assert!(ftrace.mark_frequencies(Path::new("/nonexistent/sysfs"), &cpus).is_err());
        let after = current_affinity()?;
        assert!(unsafe { libc::CPU_EQUAL(&before, &after) });
        Ok(())
    }

    #[test]
    fn test_tracing_stopped_on_error() -> anyhow::Result<()> {
        let dir = fake_tracefs();
        let ftrace = Ftrace::new(dir.path());
        let res: anyhow::Result<()> = ftrace.while_tracing(|| {
            assert_eq!(fs::read_to_string(dir.path().join("tracing_on"))?, "1");
            bail!("command failed")
        });
        assert!(res.is_err());
        assert_eq!(fs::read_to_string(dir.path().join("tracing_on"))?, "0");

        assert_eq!(ftrace.while_tracing(|| Ok(42))?, 42);
        assert_eq!(fs::read_to_string(dir.path().join("tracing_on"))?, "0");
        Ok(())
    }

    #[test]
    fn test_buffer_size() {
        assert_eq!(buffer_size_kb(0), 1);
        assert_eq!(buffer_size_kb(10), 38282);
    }

    #[test]
    fn test_init_and_store() -> anyhow::Result<()> {
        let dir = fake_tracefs();
        let ftrace = Ftrace::new(dir.path());
        ftrace.set_tracing(false)?;
        assert_eq!(ftrace.init(1)?, buffer_size_kb(1));
        assert_eq!(fs::read_to_string(dir.path().join("buffer_size_kb"))?, "3829");
        assert_eq!(fs::read_to_string(dir.path().join("events/enable"))?, "0");
        assert_eq!(fs::read_to_string(dir.path().join("events/irq/enable"))?, "1");
        assert!(!dir.path().join("events/ipi/enable").exists());

        let mut topo = Topology::default();
        topo.add_cpu(0, 0, 0);
        let out = dir.path().join("out.trace");
        assert_eq!(ftrace.store(&out, 1, &topo)?, 1);
        let stored = fs::read_to_string(&out)?;
        assert!(stored.starts_with("version = "));
        assert!(stored.contains("cpus=1\n# clusterA:\n#\tcore0\n#\t\tcpu0\n  <idle>-0"));

        ftrace.flush()?;
        assert!(fs::read_to_string(dir.path().join("trace"))?.is_empty());
        Ok(())
    }
}
