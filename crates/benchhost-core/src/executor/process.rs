//! A spawned worker whose exit is published through [`ProcessExit`].

use std::io;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::broker::ProcessExit;

/// The redirected standard streams of a freshly spawned worker.
#[derive(Debug, Default)]
pub struct WorkerStdio {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

#[derive(Default)]
struct Shared {
    status: Mutex<Option<ExitStatus>>,
    stop: AtomicBool,
}

pub struct WatchedChild {
    pid: u32,
    child: Arc<Mutex<Child>>,
    shared: Arc<Shared>,
    exit: ProcessExit,
    poll_interval: Duration,
    watcher: Option<JoinHandle<()>>,
}

impl WatchedChild {
    /// Spawn `command` in its own process group and start watching for exit.
    pub fn spawn(command: &mut Command, poll_interval: Duration) -> io::Result<(Self, WorkerStdio)> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        let stdio = WorkerStdio {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        let child = Arc::new(Mutex::new(child));
        let shared = Arc::new(Shared::default());
        let exit = ProcessExit::new();

        let watcher = {
            let child = Arc::clone(&child);
            let shared = Arc::clone(&shared);
            let exit = exit.clone();
            thread::Builder::new()
                .name(format!("benchhost-exit-{pid}"))
                .spawn(move || watch(pid, &child, &shared, &exit, poll_interval))?
        };

        Ok((
            Self {
                pid,
                child,
                shared,
                exit,
                poll_interval,
                watcher: Some(watcher),
            },
            stdio,
        ))
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    pub fn exit(&self) -> &ProcessExit {
        &self.exit
    }

    pub fn status(&self) -> Option<ExitStatus> {
        if let Some(status) = *lock(&self.shared.status) {
            return Some(status);
        }
        let polled = lock(&self.child).try_wait().ok().flatten();
        if let Some(status) = polled {
            self.record(status);
        }
        polled
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status().and_then(|status| status.code())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.status() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(self.poll_interval);
        }
    }

    pub async fn wait_timeout_async(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.status() {
                return Some(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Ask the whole process group to terminate.
    pub fn terminate(&self) {
        #[cfg(unix)]
        {
            // SAFETY: signalling a process group we created; a stale group id
            // fails with ESRCH and nothing else happens.
            let ret = unsafe { libc::kill(-(self.pid as i32), libc::SIGTERM) };
            if ret != 0 {
                debug!(pid = self.pid, "SIGTERM failed, worker group already gone?");
            }
        }
    }

    /// Kill the process group, then reap the worker.
    pub fn force_kill(&self) {
        #[cfg(unix)]
        {
            // SAFETY: as in `terminate`.
            unsafe {
                libc::kill(-(self.pid as i32), libc::SIGKILL);
            }
        }
        let mut child = lock(&self.child);
        let _ = child.kill();
        match child.wait() {
            Ok(status) => {
                drop(child);
                self.record(status);
            }
            Err(e) => warn!(pid = self.pid, error = %e, "failed to reap killed worker"),
        }
    }

    fn record(&self, status: ExitStatus) {
        *lock(&self.shared.status) = Some(status);
        self.exit.notify_exited();
    }
}

impl Drop for WatchedChild {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}

impl std::fmt::Debug for WatchedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedChild")
            .field("pid", &self.pid)
            .field("exited", &self.exit.has_exited())
            .finish_non_exhaustive()
    }
}

fn watch(pid: u32, child: &Mutex<Child>, shared: &Shared, exit: &ProcessExit, poll_interval: Duration) {
    while !shared.stop.load(Ordering::Acquire) {
        let polled = lock(child).try_wait();
        match polled {
            Ok(Some(status)) => {
                debug!(pid, %status, "worker exited");
                *lock(&shared.status) = Some(status);
                exit.notify_exited();
                return;
            }
            Ok(None) => thread::sleep(poll_interval),
            Err(e) => {
                warn!(pid, error = %e, "cannot poll worker status");
                return;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
