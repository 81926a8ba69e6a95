// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker configuration and the restart policy around instances.
//!
//! A [`Worker`] is cloneable configuration plus at most one live
//! [`WorkerInstance`](crate::worker_instance::WorkerInstance). The scheduler
//! only ever sees the worker-level status, where a handshaked idle instance
//! reads as AVAILABLE. When an instance fails, the worker respawns it up to
//! its configured budget; past that the worker itself reports FAILED. Tasks
//! that were in flight have already been finalized by the instance's failure
//! handling, so a respawn never replays work.

use crate::proxy::ProxyClient;
use crate::sys::RawFd;
use crate::task::{Task, TaskRegistry};
use crate::taskmaster::Options;
use crate::worker_instance::WorkerInstance;
use std::cell::RefCell;
use std::rc::Rc;

/// Lifecycle of a worker as the scheduler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Spawning, connecting, or waiting for the hello handshake.
    Starting,
    /// Instance-level resting state after a task completes.
    Idle,
    /// A task is in flight.
    Working,
    /// Handshaked and ready for a task.
    Available,
    /// Dead, with the restart budget exhausted.
    Failed,
    /// Deliberately stopped.
    Finished,
}

#[derive(Clone)]
enum BackingKind {
    InProcess { registry: TaskRegistry },
    Process,
    ProcessVia { proxy: Rc<RefCell<ProxyClient>> },
}

/// A parent-visible worker handle.
pub struct Worker {
    group: Option<String>,
    kind: BackingKind,
    max_respawns: u32,
    respawns: u32,
    failed: bool,
    instance: Option<WorkerInstance>,
}

impl Worker {
    /// A synchronous worker running `registry` entries inside the parent's
    /// update loop. No real I/O, no selectable handle.
    pub fn synchronous(registry: TaskRegistry) -> Self {
        Self::with_kind(BackingKind::InProcess { registry })
    }

    /// A worker backed by its own spawned child process.
    pub fn process() -> Self {
        Self::with_kind(BackingKind::Process)
    }

    /// A process worker routed through a shared proxy runtime.
    pub fn process_via(proxy: &Rc<RefCell<ProxyClient>>) -> Self {
        Self::with_kind(BackingKind::ProcessVia { proxy: proxy.clone() })
    }

    fn with_kind(kind: BackingKind) -> Self {
        Worker {
            group: None,
            kind,
            max_respawns: 0,
            respawns: 0,
            failed: false,
            instance: None,
        }
    }

    /// Restricts this worker to tasks carrying the same group label.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// How many times a failed instance may be respawned before the worker
    /// gives up.
    pub fn with_max_respawns(mut self, max_respawns: u32) -> Self {
        self.max_respawns = max_respawns;
        self
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn status(&self) -> WorkerStatus {
        if self.failed {
            return WorkerStatus::Failed;
        }
        match &self.instance {
            None => WorkerStatus::Starting,
            Some(instance) => match instance.status() {
                WorkerStatus::Idle => {
                    if instance.handshaked() {
                        WorkerStatus::Available
                    } else {
                        WorkerStatus::Starting
                    }
                }
                // a respawn is still owed; the next update performs it
                WorkerStatus::Failed => WorkerStatus::Starting,
                status => status,
            },
        }
    }

    pub(crate) fn proxy(&self) -> Option<Rc<RefCell<ProxyClient>>> {
        match &self.kind {
            BackingKind::ProcessVia { proxy } => Some(proxy.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_synchronous(&self) -> bool {
        matches!(self.kind, BackingKind::InProcess { .. })
    }

    pub(crate) fn read_handle(&self) -> Option<RawFd> {
        self.instance.as_ref().and_then(|i| i.read_handle())
    }

    /// Hands the task to the instance. Gives the task back when the worker
    /// cannot take it right now.
    pub(crate) fn run_task(&mut self, task: Task) -> Result<(), Task> {
        match self.instance.as_mut() {
            Some(instance) => instance.run_task(task).map(|_| ()),
            None => Err(task),
        }
    }

    fn start_instance(&mut self, options: &Options) {
        let started = match &self.kind {
            BackingKind::InProcess { registry } => {
                Ok(WorkerInstance::start_in_process(registry.clone(), options))
            }
            BackingKind::Process => {
                WorkerInstance::start_process(options).map_err(|e| e.to_string())
            }
            BackingKind::ProcessVia { proxy } => {
                WorkerInstance::start_proxied(proxy, options).map_err(|e| e.to_string())
            }
        };
        match started {
            Ok(instance) => {
                let id = instance.id().to_string();
                instance.start_promise().then(move |_| {
                    logwise::info_sync!(
                        "worker instance {id} handshaked",
                        id = id.clone()
                    );
                });
                self.instance = Some(instance);
            }
            Err(reason) => {
                logwise::warn_sync!(
                    "failed to start worker instance: {reason}",
                    reason = reason.clone()
                );
                if self.respawns < self.max_respawns {
                    self.respawns += 1;
                } else {
                    self.failed = true;
                }
            }
        }
    }

    /// Starts the instance when needed, pumps it, and applies the restart
    /// policy when it failed.
    pub(crate) fn update(&mut self, options: &Options) {
        if self.failed {
            return;
        }
        if self.instance.is_none() {
            self.start_instance(options);
        }
        let mut respawn = false;
        if let Some(instance) = self.instance.as_mut() {
            instance.update();
            if instance.status() == WorkerStatus::Failed {
                if self.respawns < self.max_respawns {
                    self.respawns += 1;
                    respawn = true;
                } else {
                    self.failed = true;
                }
            }
        }
        if respawn {
            logwise::info_sync!(
                "respawning worker instance, attempt {attempt} of {budget}",
                attempt = self.respawns.to_string(),
                budget = self.max_respawns.to_string()
            );
            self.instance = None;
            self.start_instance(options);
        }
    }

    pub(crate) fn stop(&mut self) {
        if let Some(instance) = self.instance.as_mut() {
            instance.stop();
        }
    }
}

impl Clone for Worker {
    /// Clones the configuration only; the clone starts fresh with no
    /// instance and an unused restart budget.
    fn clone(&self) -> Self {
        Worker {
            group: self.group.clone(),
            kind: self.kind.clone(),
            max_respawns: self.max_respawns,
            respawns: 0,
            failed: false,
            instance: None,
        }
    }
}
