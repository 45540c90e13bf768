//! Tracking of every client process the tester has started.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct TrackedProcess {
    pid: u32,
    name: String,
}

/// Registry of live client processes.
///
/// Termination is synchronous so it can run from a signal handler or a
/// `Drop` impl.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: Mutex<HashMap<u64, TrackedProcess>>,
    next_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a process; returns the registration id.
    pub fn register(&self, pid: u32, name: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.processes.lock() {
            map.insert(
                id,
                TrackedProcess {
                    pid,
                    name: name.to_string(),
                },
            );
        }
        debug!(pid, client = name, "Registered client process");
        id
    }

    pub fn len(&self) -> usize {
        self.processes.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force-kill one registered process and forget it.
    pub fn terminate(&self, id: u64) {
        let tracked = self
            .processes
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&id));
        if let Some(process) = tracked {
            kill_process_group(process.pid);
            debug!(pid = process.pid, client = %process.name, "Terminated client process");
        }
    }

    /// Force-kill everything still registered.
    pub fn terminate_all(&self) {
        let drained: Vec<TrackedProcess> = match self.processes.lock() {
            Ok(mut map) => map.drain().map(|(_, p)| p).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, p)| p).collect(),
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Terminating all client processes");
        for process in drained {
            kill_process_group(process.pid);
        }
    }

    /// Guard that calls `terminate_all` when dropped.
    pub fn guard(self: &Arc<Self>) -> RegistryGuard {
        RegistryGuard {
            registry: Arc::clone(self),
        }
    }
}

/// Tears every tracked client down on every exit path of its scope.
#[must_use = "dropping the guard immediately terminates all clients"]
pub struct RegistryGuard {
    registry: Arc<ProcessRegistry>,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.terminate_all();
    }
}

/// SIGKILL the process group led by `pid`. Exited processes are ignored.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let nix_pid = Pid::from_raw(pid as i32);
    match killpg(nix_pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!(pid, error = %e, "killpg failed, killing process directly");
            let _ = kill(nix_pid, Signal::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(pid: u32) {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    if let Some(process) = sys.process(pid) {
        process.kill();
    }
}

/// Kill every process whose executable name matches `name`.
/// Used to clear clients left behind by an earlier, crashed run.
pub fn terminate_by_name(name: &str) -> usize {
    use sysinfo::{ProcessesToUpdate, System};

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let mut killed = 0;
    for process in sys.processes_by_exact_name(std::ffi::OsStr::new(name)) {
        if process.kill() {
            killed += 1;
        }
    }
    if killed > 0 {
        info!(client = name, killed, "Killed stray client processes");
    }
    killed
}
