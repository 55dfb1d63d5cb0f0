//! Registry of child processes spawned during a run.
//!
//! The registry is the only place that sends signals to children. Tools are
//! spawned as leaders of their own process group, so signalling the group
//! also reaches anything the tool forked without registering.

use crate::errors::ToolError;
use std::collections::{HashMap, HashSet};
use std::process::ExitStatus;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

/// Default time a process gets to exit after SIGTERM before SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A registered child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    id: u64,
    pid: u32,
    label: String,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// What `cancel_all` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Processes that were tracked when cancellation started.
    pub signalled: usize,
    /// Processes that outlived the grace period and were SIGKILLed.
    pub forced: usize,
    /// Process groups swept after forceful termination.
    pub groups_swept: usize,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    live: HashMap<u64, (u32, String)>,
    groups: HashSet<u32>,
}

pub struct ProcessRegistry {
    inner: Mutex<Inner>,
    grace: Duration,
    token: CancellationToken,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ProcessRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            grace,
            token: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the maps half-updated,
        // so a poisoned guard is still safe to use.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Token cancelled by `cancel_all`; in-flight tasks select on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of currently tracked processes.
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start tracking `pid`.
    ///
    /// Registration and cancellation are serialized by the registry lock. If
    /// the run has already been cancelled the process is killed here and
    /// `ToolError::Cancelled` is returned, so no process can slip in after
    /// `cancel_all` took its snapshot.
    pub fn register(&self, pid: u32, label: &str) -> Result<ProcessHandle, ToolError> {
        let mut inner = self.lock();
        if self.token.is_cancelled() {
            drop(inner);
            sys::signal_process(pid, sys::Signal::Kill);
            tracing::warn!(pid, label, "process spawned after cancellation, killed");
            return Err(ToolError::Cancelled {
                name: label.to_string(),
            });
        }
        inner.groups.retain(|pgid| sys::group_alive(*pgid));
        inner.next_id += 1;
        let id = inner.next_id;
        inner.live.insert(id, (pid, label.to_string()));
        inner.groups.insert(pid);
        tracing::debug!(pid, label, "process registered");
        Ok(ProcessHandle {
            id,
            pid,
            label: label.to_string(),
        })
    }

    /// Stop tracking a process after its owner has reaped it.
    ///
    /// The process group stays on the sweep list only while something still
    /// lives in it; an empty group id may be reused by an unrelated process.
    pub fn unregister(&self, handle: &ProcessHandle) {
        let mut inner = self.lock();
        inner.live.remove(&handle.id);
        if !sys::group_alive(handle.pid) {
            inner.groups.remove(&handle.pid);
        }
    }

    /// Terminate one process: SIGTERM to its group, wait up to the grace
    /// period, then SIGKILL. The child is reaped before returning.
    pub async fn terminate(
        &self,
        handle: &ProcessHandle,
        child: &mut Child,
    ) -> std::io::Result<ExitStatus> {
        sys::signal_process(handle.pid, sys::Signal::Terminate);
        let status = match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    pid = handle.pid,
                    label = %handle.label,
                    "process ignored SIGTERM, sending SIGKILL"
                );
                sys::signal_process(handle.pid, sys::Signal::Kill);
                child.wait().await
            }
        };
        self.unregister(handle);
        status
    }

    /// Cancel the run: every tracked process is asked to stop, given the grace
    /// period, then killed; finally every process group that still had members
    /// when its leader was unregistered is swept with SIGKILL. Calling this again, or on an empty registry, does
    /// nothing.
    pub async fn cancel_all(&self) -> CancelReport {
        let (targets, groups) = {
            let mut inner = self.lock();
            self.token.cancel();
            let targets: Vec<(u64, u32, String)> = inner
                .live
                .iter()
                .map(|(id, (pid, label))| (*id, *pid, label.clone()))
                .collect();
            let groups: Vec<u32> = inner.groups.drain().collect();
            (targets, groups)
        };

        if targets.is_empty() && groups.is_empty() {
            return CancelReport::default();
        }

        for (_, pid, label) in &targets {
            tracing::info!(pid, label = %label, "terminating process");
            sys::signal_process(*pid, sys::Signal::Terminate);
        }

        let deadline = Instant::now() + self.grace;
        let mut remaining = self.still_alive(&targets);
        while !remaining.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            remaining = self.still_alive(&targets);
        }

        for (_, pid, label) in &remaining {
            tracing::warn!(pid, label = %label, "grace period expired, killing process");
            sys::signal_process(*pid, sys::Signal::Kill);
        }

        let groups_swept = groups
            .iter()
            .filter(|pgid| sys::signal_group(**pgid, sys::Signal::Kill))
            .count();

        {
            let mut inner = self.lock();
            for (id, _, _) in &targets {
                inner.live.remove(id);
            }
        }

        let report = CancelReport {
            signalled: targets.len(),
            forced: remaining.len(),
            groups_swept,
        };
        tracing::info!(
            signalled = report.signalled,
            forced = report.forced,
            groups_swept = report.groups_swept,
            "process registry cancelled"
        );
        report
    }

    fn still_alive(&self, targets: &[(u64, u32, String)]) -> Vec<(u64, u32, String)> {
        let inner = self.lock();
        targets
            .iter()
            .filter(|(id, pid, _)| inner.live.contains_key(id) && sys::pid_alive(*pid))
            .cloned()
            .collect()
    }
}

#[cfg(unix)]
pub(crate) mod sys {
    #[derive(Debug, Clone, Copy)]
    pub enum Signal {
        Terminate,
        Kill,
    }

    impl Signal {
        fn raw(self) -> libc::c_int {
            match self {
                Signal::Terminate => libc::SIGTERM,
                Signal::Kill => libc::SIGKILL,
            }
        }
    }

    fn group_id(pgid: u32) -> Option<libc::pid_t> {
        let pgid = libc::pid_t::try_from(pgid).ok()?;
        // 0 or 1 would address our own group or init.
        if pgid <= 1 {
            return None;
        }
        // SAFETY: getpgrp has no preconditions.
        (pgid != unsafe { libc::getpgrp() }).then_some(pgid)
    }

    /// Signal the process group `pgid` and nothing else. Returns whether any
    /// member was signalled.
    pub fn signal_group(pgid: u32, signal: Signal) -> bool {
        let Some(pgid) = group_id(pgid) else {
            return false;
        };
        // SAFETY: killpg only delivers a signal; an unknown group yields ESRCH.
        unsafe { libc::killpg(pgid, signal.raw()) == 0 }
    }

    /// Signal a tracked child and its group. Only valid for a pid that has not
    /// been reaped yet, so it cannot have been reused.
    pub fn signal_process(pid: u32, signal: Signal) -> bool {
        if signal_group(pid, signal) {
            return true;
        }
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 1 {
            return false;
        }
        // SAFETY: kill only delivers a signal; an unknown pid yields ESRCH.
        unsafe { libc::kill(pid, signal.raw()) == 0 }
    }

    /// Whether any process is still a member of group `pgid`.
    pub fn group_alive(pgid: u32) -> bool {
        let Some(pgid) = group_id(pgid) else {
            return false;
        };
        // SAFETY: signal 0 only checks for existence.
        if unsafe { libc::killpg(pgid, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().kind() == std::io::ErrorKind::PermissionDenied
    }

    pub fn pid_alive(pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: kill(2) with signal 0 only checks for existence.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().kind() == std::io::ErrorKind::PermissionDenied
    }
}

#[cfg(not(unix))]
pub(crate) mod sys {
    #[derive(Debug, Clone, Copy)]
    pub enum Signal {
        Terminate,
        Kill,
    }

    pub fn signal_group(_pgid: u32, _signal: Signal) -> bool {
        false
    }

    pub fn signal_process(_pid: u32, _signal: Signal) -> bool {
        false
    }

    pub fn group_alive(_pgid: u32) -> bool {
        false
    }

    pub fn pid_alive(_pid: u32) -> bool {
        false
    }
}
