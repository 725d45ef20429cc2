// Local process helpers
//
// Pid sentinel files, process existence checks, and process-group
// signalling for jobs run on this machine.

use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// Signals the local strategy sends to a job's process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Terminate,
    Kill,
}

/// Write `contents` to `path` through a sibling temp file and rename, so
/// readers never observe a partial file
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// Read a pid (or exit code) written as decimal text
pub fn read_number<T: std::str::FromStr>(path: &Path) -> io::Result<Option<T>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if a process with the given PID exists and has not exited.
///
/// `kill(pid, 0)` succeeds for zombies too, so on Linux the state field of
/// `/proc/<pid>/stat` is consulted as well.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    false
}

/// Fields of `/proc/<pid>/stat` after the command name, starting at the state
fn stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Format: "pid (comm) S ..."; comm may contain spaces, so split after ')'
    let (_, rest) = stat.rsplit_once(')')?;
    Some(rest.split_whitespace().map(str::to_string).collect())
}

#[cfg(unix)]
fn is_zombie(pid: u32) -> bool {
    stat_fields(pid)
        .and_then(|fields| fields.first().cloned())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

/// Start time of `pid` in clock ticks since boot (field 22 of
/// `/proc/<pid>/stat`). `None` when the process is gone or there is no procfs.
pub fn process_start_time(pid: u32) -> Option<u64> {
    if pid == 0 {
        return None;
    }
    stat_fields(pid)?.get(19)?.parse().ok()
}

/// Whether `pid` is alive and is still the process that was recorded with
/// `start_time`. Pids are recycled, so a recorded start time that no longer
/// matches means the job's process is gone.
pub fn is_same_process(pid: u32, start_time: Option<u64>) -> bool {
    if !process_exists(pid) {
        return false;
    }
    match start_time {
        Some(expected) => process_start_time(pid) == Some(expected),
        None => true,
    }
}

/// Signal the process group led by `pid`, falling back to the process
/// itself. Returns `Ok(false)` when nothing was left to signal.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: GroupSignal) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    let pid = Pid::from_raw(pid as i32);
    match killpg(pid, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => match kill(pid, sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => {
                debug!(pid = pid.as_raw(), "Process already exited");
                Ok(false)
            }
            Err(e) => Err(io::Error::from(e)),
        },
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: GroupSignal) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are only supported on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pid");
        write_atomic(&path, b"1234\n").unwrap();
        assert_eq!(read_number::<u32>(&path).unwrap(), Some(1234));
        assert!(!dir.path().join("pid.tmp").exists());
        assert_eq!(read_number::<u32>(&dir.path().join("missing")).unwrap(), None);
    }

    #[test]
    fn test_process_exists() {
        // Current process should exist
        assert!(process_exists(std::process::id()));

        // Very high PID should not exist
        assert!(!process_exists(999999999));
        assert!(!process_exists(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_start_time_identifies_the_process() {
        let pid = std::process::id();
        let started = process_start_time(pid).unwrap();
        assert!(is_same_process(pid, Some(started)));
        assert!(is_same_process(pid, None));

        // Same pid, different start time: a recycled pid
        assert!(!is_same_process(pid, Some(started + 1)));
        assert_eq!(process_start_time(999999999), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_missing_group_is_not_an_error() {
        assert!(!signal_group(999999999, GroupSignal::Terminate).unwrap());
    }
}
