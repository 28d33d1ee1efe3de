//! Termination of the supervised script's process tree.
//!
//! The install script spawns downloaders and archivers of its own; if the
//! supervisor goes away without cleanup those keep running in the
//! background. Primary mechanism: the child is spawned as its own process
//! group leader, so one signal to the group reaches every member. Fallback:
//! walk the OS process table by parent PID and kill depth-first, children
//! before parents. The fallback is a point-in-time snapshot, so a process
//! spawned between enumeration and kill can escape; that is accepted as
//! better than no cleanup.

use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Minimal view of the OS process table, enough to tear a tree down.
/// Abstracted so the traversal order is testable without killing anything.
pub trait ProcessTable {
    /// PIDs whose parent is `pid`, as of the snapshot.
    fn children_of(&self, pid: u32) -> Vec<u32>;

    /// Terminate `pid`. Returns false when the process had already exited,
    /// which is not an error.
    fn kill(&mut self, pid: u32) -> bool;
}

/// [`ProcessTable`] backed by a point-in-time `sysinfo` snapshot.
pub struct SysinfoTable {
    system: System,
}

impl SysinfoTable {
    pub fn snapshot() -> Self {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        Self { system }
    }
}

impl ProcessTable for SysinfoTable {
    fn children_of(&self, pid: u32) -> Vec<u32> {
        let parent = Pid::from_u32(pid);
        self.system
            .processes()
            .iter()
            .filter(|(_, process)| process.parent() == Some(parent))
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    fn kill(&mut self, pid: u32) -> bool {
        match self.system.process(Pid::from_u32(pid)) {
            Some(process) => process.kill(),
            None => false,
        }
    }
}

/// Recursively terminate `pid` and every descendant, children first.
///
/// PID 0 is never targeted. Already-exited processes are skipped silently.
pub fn kill_tree<T: ProcessTable>(table: &mut T, pid: u32) {
    if pid == 0 {
        return;
    }
    for child in table.children_of(pid) {
        kill_tree(table, child);
    }
    if !table.kill(pid) {
        debug!(pid, "process already exited before kill");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardMode {
    /// The child leads its own process group; signal the whole group.
    Group { pgid: i32 },
    /// No group-termination facility on this platform; only the
    /// enumeration fallback is available.
    Unsupported,
}

/// Ensures the script's descendants do not outlive the supervisor.
///
/// Tear-down happens exactly once, whether through [`terminate`] or the
/// last-resort kill in `Drop`.
///
/// [`terminate`]: ProcessTreeGuard::terminate
#[derive(Debug)]
pub struct ProcessTreeGuard {
    mode: GuardMode,
    root_pid: u32,
    fired: bool,
}

impl ProcessTreeGuard {
    /// Register the freshly spawned script process.
    ///
    /// On Unix the supervisor spawns the child with `process_group(0)`, so
    /// its PID doubles as the group ID. Elsewhere the guard degrades to
    /// unsupported mode, which is not fatal; the enumeration fallback still
    /// works.
    pub fn register(root_pid: u32) -> Self {
        let mode = if cfg!(unix) && root_pid != 0 {
            GuardMode::Group {
                pgid: root_pid as i32,
            }
        } else {
            warn!("process group termination unavailable; relying on process table fallback");
            GuardMode::Unsupported
        };
        Self {
            mode,
            root_pid,
            fired: false,
        }
    }

    /// Whether group termination is available.
    pub fn is_supported(&self) -> bool {
        matches!(self.mode, GuardMode::Group { .. })
    }

    /// Terminate the whole tree: group SIGTERM, a short grace period, group
    /// SIGKILL, then the process-table fallback for anything that left the
    /// group. Safe to call after the script already exited.
    pub async fn terminate(&mut self) {
        if self.fired {
            return;
        }
        self.fired = true;

        #[cfg(unix)]
        if let GuardMode::Group { pgid } = self.mode {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let group = Pid::from_raw(-pgid);
            // ESRCH means everything already exited; swallowed
            let _ = kill(group, Signal::SIGTERM);
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = kill(group, Signal::SIGKILL);
        }

        let mut table = SysinfoTable::snapshot();
        kill_tree(&mut table, self.root_pid);
    }
}

/// Whether any member of the process group is still alive (signal 0 probe).
#[cfg(unix)]
fn group_alive(pgid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(-pgid), None).is_ok()
}

impl Drop for ProcessTreeGuard {
    fn drop(&mut self) {
        if self.fired {
            return;
        }
        self.fired = true;

        match self.mode {
            #[cfg(unix)]
            GuardMode::Group { pgid } => {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                // after a clean, fully-reaped exit the group is empty;
                // skipping the signal keeps a recycled pgid safe
                if group_alive(pgid) {
                    let _ = kill(Pid::from_raw(-pgid), Signal::SIGKILL);
                }
            }
            #[cfg(not(unix))]
            GuardMode::Group { .. } => {}
            GuardMode::Unsupported => {
                let mut table = SysinfoTable::snapshot();
                kill_tree(&mut table, self.root_pid);
            }
        }
    }
}
