//! Live agent processes keyed by execution id, used for termination.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use agent_task_engine_error::EngineError;

#[derive(Debug)]
pub struct ProcessHandle {
    execution_id: String,
    pid: Option<u32>,
    terminated: AtomicBool,
    kill_tx: watch::Sender<bool>,
}

impl ProcessHandle {
    fn new(execution_id: String, pid: Option<u32>) -> Self {
        let (kill_tx, _) = watch::channel(false);
        Self {
            execution_id,
            pid,
            terminated: AtomicBool::new(false),
            kill_tx,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Resolves once termination has been requested.
    pub fn kill_signal(&self) -> watch::Receiver<bool> {
        self.kill_tx.subscribe()
    }

    /// Marks the handle terminated and kills the process group. Returns false
    /// if termination was already requested.
    pub fn terminate(&self) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // The agent runs as its own process group leader.
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
        self.kill_tx.send_replace(true);
        true
    }
}

/// Result of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// A live process was signalled.
    Signalled,
    /// No process yet; it is killed as soon as it registers.
    Cancelled,
}

#[derive(Debug, Default)]
struct RegistryState {
    processes: HashMap<String, Arc<ProcessHandle>>,
    cancelled: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The returned guard unregisters the process when dropped.
    pub fn register(
        &self,
        execution_id: &str,
        pid: Option<u32>,
    ) -> Result<RegistrationGuard, EngineError> {
        let mut state = self.lock();
        if state.processes.contains_key(execution_id) {
            return Err(EngineError::conflict(format!(
                "a process is already registered for execution {execution_id}"
            )));
        }
        let handle = Arc::new(ProcessHandle::new(execution_id.to_string(), pid));
        state
            .processes
            .insert(execution_id.to_string(), handle.clone());
        let cancelled = state.cancelled.remove(execution_id);
        let live = state.processes.len();
        drop(state);

        tracing::debug!(execution_id, pid, live, "registered agent process");
        if cancelled {
            tracing::info!(execution_id, "execution was terminated before its process started");
            handle.terminate();
        }
        Ok(RegistrationGuard {
            registry: self.clone(),
            handle,
        })
    }

    pub fn lookup(&self, execution_id: &str) -> Option<Arc<ProcessHandle>> {
        self.lock().processes.get(execution_id).cloned()
    }

    /// Requests termination of a live process. Returns false when no process is
    /// registered for the execution. Repeated calls are harmless.
    pub fn terminate(&self, execution_id: &str) -> bool {
        let Some(handle) = self.lookup(execution_id) else {
            return false;
        };
        if handle.terminate() {
            tracing::info!(execution_id, pid = handle.pid(), "terminating agent process");
        }
        true
    }

    /// Terminates the live process, or marks the execution so its process is
    /// killed the moment it registers.
    pub fn terminate_or_cancel(&self, execution_id: &str) -> Termination {
        let mut state = self.lock();
        let live = state.processes.get(execution_id).cloned();
        match live {
            Some(handle) => {
                drop(state);
                if handle.terminate() {
                    tracing::info!(execution_id, pid = handle.pid(), "terminating agent process");
                }
                Termination::Signalled
            }
            None => {
                state.cancelled.insert(execution_id.to_string());
                Termination::Cancelled
            }
        }
    }

    /// Clears a pending cancellation, returning whether one was set.
    pub fn take_cancelled(&self, execution_id: &str) -> bool {
        self.lock().cancelled.remove(execution_id)
    }

    pub fn len(&self) -> usize {
        self.lock().processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unregister(&self, handle: &Arc<ProcessHandle>) {
        let mut state = self.lock();
        if state
            .processes
            .get(handle.execution_id())
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            state.processes.remove(handle.execution_id());
            tracing::debug!(execution_id = handle.execution_id(), "unregistered agent process");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct RegistrationGuard {
    registry: ProcessRegistry,
    handle: Arc<ProcessHandle>,
}

impl Deref for RegistrationGuard {
    type Target = ProcessHandle;

    fn deref(&self) -> &ProcessHandle {
        &self.handle
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.handle);
    }
}
