//! Host process termination observation.
//!
//! The agent resolves the relaunch bundle path to a process id; the
//! daemon then watches that foreign process and releases stage 3 when it
//! exits. Liveness is probed with a null signal; `EPERM` still proves the
//! process exists, and the probe is portable across the Unix targets the
//! daemon supports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::event::Event;

/// Poll interval for the liveness probe.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Whether a process id refers to a live process.
#[must_use]
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// A foreign process the daemon waits on.
#[derive(Debug, Clone)]
pub struct TerminationHandle {
    pid: i32,
    terminated: Arc<AtomicBool>,
}

impl TerminationHandle {
    /// Wrap a process id obtained from the agent.
    #[must_use]
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The watched process id.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Cheap probe read at message-handling time.
    ///
    /// Latches: once the process has been seen dead it stays dead (PIDs
    /// can be recycled).
    #[must_use]
    pub fn terminated(&self) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return true;
        }
        if process_alive(self.pid) {
            false
        } else {
            self.terminated.store(true, Ordering::Release);
            true
        }
    }

    /// Start watching; completes through the event funnel.
    ///
    /// Sends `HostTerminationObserved(true)` once the process exits, or
    /// `HostTerminationObserved(false)` immediately if the observer
    /// cannot start (invalid process id).
    pub fn start_watching(&self, events: mpsc::UnboundedSender<Event>) {
        if self.pid <= 0 {
            debug!(pid = self.pid, "termination observer cannot start");
            let _ = events.send(Event::HostTerminationObserved(false));
            return;
        }

        let pid = self.pid;
        let terminated = Arc::clone(&self.terminated);
        tokio::spawn(async move {
            loop {
                if !process_alive(pid) {
                    terminated.store(true, Ordering::Release);
                    info!(pid, "host process terminated");
                    let _ = events.send(Event::HostTerminationObserved(true));
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observes_child_exit() {
        let mut child = std::process::Command::new("sleep")
            .arg("0.3")
            .spawn()
            .unwrap();
        #[allow(clippy::cast_possible_wrap)]
        let pid = child.id() as i32;

        let handle = TerminationHandle::new(pid);
        assert!(!handle.terminated());

        // Reap promptly; the probe sees zombies as alive.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.start_watching(tx);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(Event::HostTerminationObserved(true))));
        assert!(handle.terminated());
    }

    #[tokio::test]
    async fn invalid_pid_fails_to_start() {
        let handle = TerminationHandle::new(0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.start_watching(tx);
        assert!(matches!(
            rx.recv().await,
            Some(Event::HostTerminationObserved(false))
        ));
    }

    #[test]
    fn probe_latches_once_dead() {
        let handle = TerminationHandle::new(i32::MAX - 1);
        assert!(handle.terminated());
        assert!(handle.terminated());
    }
}
