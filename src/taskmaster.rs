// SPDX-License-Identifier: MIT OR Apache-2.0
//! The orchestrator: task queue, factories, workers, proxies, and the
//! update loop that drives them.
//!
//! The whole parent side is single-threaded and cooperative. One update
//! iteration assigns tasks to available workers, pumps every worker and
//! proxy, then parks in a bounded `select(2)` over whichever sockets expose a
//! readiness handle. Parallelism comes from the isolated children, never
//! from threads in here.

use crate::proxy::{ProxyClient, ProxyError};
use crate::spawn;
use crate::sys::{self, RawFd};
use crate::task::{Task, TaskFactory};
use crate::worker::{Worker, WorkerStatus};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

/// Shared configuration, pushed into proxies at enrollment.
#[derive(Debug, Clone)]
pub struct Options {
    /// Worker binary. `None` resolves `task_worker` via PATH.
    pub executable: Option<PathBuf>,
    /// Proxy runtime binary. `None` resolves `task_proxy` via PATH.
    pub proxy_executable: Option<PathBuf>,
    /// Opaque init argument handed to every spawned child.
    pub bootstrap: Option<PathBuf>,
    /// Upper bound on the blocking wait at the end of one update iteration.
    pub socket_wait_time: Duration,
    /// How long a child may take to connect back and say hello.
    pub start_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            executable: None,
            proxy_executable: None,
            bootstrap: None,
            socket_wait_time: Duration::from_micros(1000),
            start_timeout: Duration::from_secs(10),
        }
    }
}

impl Options {
    pub(crate) fn worker_executable(&self) -> PathBuf {
        self.executable
            .clone()
            .unwrap_or_else(|| PathBuf::from("task_worker"))
    }

    pub(crate) fn proxy_runtime_executable(&self) -> PathBuf {
        self.proxy_executable
            .clone()
            .unwrap_or_else(|| PathBuf::from("task_proxy"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskmasterError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("cannot auto-detect workers on this platform; add workers explicitly")]
    AutoDetectUnsupported,
}

/// The orchestrator.
pub struct Taskmaster {
    tasks: VecDeque<Task>,
    factories: Vec<Box<dyn TaskFactory>>,
    workers: Vec<Worker>,
    proxies: Vec<Rc<RefCell<ProxyClient>>>,
    options: Options,
}

impl Taskmaster {
    pub fn new() -> Self {
        Taskmaster {
            tasks: VecDeque::new(),
            factories: Vec::new(),
            workers: Vec::new(),
            proxies: Vec::new(),
            options: Options::default(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Path to the worker binary spawned for process workers.
    pub fn set_executable(&mut self, executable: impl Into<PathBuf>) {
        self.options.executable = Some(executable.into());
    }

    /// Path to the proxy runtime binary.
    pub fn set_proxy_executable(&mut self, executable: impl Into<PathBuf>) {
        self.options.proxy_executable = Some(executable.into());
    }

    /// Init argument handed to every spawned child.
    pub fn set_bootstrap(&mut self, bootstrap: impl Into<PathBuf>) {
        self.options.bootstrap = Some(bootstrap.into());
    }

    pub fn set_socket_wait_time(&mut self, wait: Duration) {
        self.options.socket_wait_time = wait;
    }

    pub fn set_start_timeout(&mut self, timeout: Duration) {
        self.options.start_timeout = timeout;
    }

    pub fn add_task(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    pub fn add_task_factory(&mut self, factory: impl TaskFactory + 'static) {
        self.factories.push(Box::new(factory));
    }

    /// Enrolls a worker. A referenced proxy is enrolled exactly once, by
    /// identity, and started with the current options pushed in first.
    pub fn add_worker(&mut self, worker: Worker) -> Result<(), TaskmasterError> {
        if let Some(proxy) = worker.proxy() {
            if !self.proxies.iter().any(|known| Rc::ptr_eq(known, &proxy)) {
                {
                    let mut proxy = proxy.borrow_mut();
                    proxy.set_options(&self.options);
                    if !proxy.is_started() {
                        proxy.start()?;
                    }
                }
                self.proxies.push(proxy);
            }
        }
        self.workers.push(worker);
        Ok(())
    }

    /// Enrolls `count` clones of the given worker configuration.
    pub fn add_workers(&mut self, worker: &Worker, count: usize) -> Result<(), TaskmasterError> {
        for _ in 0..count {
            self.add_worker(worker.clone())?;
        }
        Ok(())
    }

    /// Replaces the worker list wholesale.
    pub fn set_workers(&mut self, workers: Vec<Worker>) -> Result<(), TaskmasterError> {
        self.workers.clear();
        for worker in workers {
            self.add_worker(worker)?;
        }
        Ok(())
    }

    /// Adds `count` workers of the best kind this runtime supports: process
    /// workers, routed through one shared proxy runtime when the
    /// `TASKMASTER_FORK_PROXY` switch is present.
    pub fn auto_detect_workers(&mut self, count: usize) -> Result<(), TaskmasterError> {
        if !spawn::can_fork_child() {
            return Err(TaskmasterError::AutoDetectUnsupported);
        }
        if spawn::fork_proxy_requested() {
            let proxy = Rc::new(RefCell::new(ProxyClient::new()));
            let worker = Worker::process_via(&proxy);
            self.add_workers(&worker, count)
        } else {
            let worker = Worker::process();
            self.add_workers(&worker, count)
        }
    }

    /// One iteration of the update cycle: assign, pump, re-assign for each
    /// worker; pump each proxy; then wait, bounded, for socket readiness.
    pub fn update(&mut self) {
        for index in 0..self.workers.len() {
            self.try_assign(index);
            self.workers[index].update(&self.options);
            // the pump may have finished a task and freed the worker
            self.try_assign(index);
        }
        for proxy in &self.proxies {
            proxy.borrow_mut().update();
        }
        self.wait_for_new_update();
    }

    fn try_assign(&mut self, index: usize) {
        if self.workers[index].status() != WorkerStatus::Available {
            return;
        }
        let group = self.workers[index].group().map(str::to_string);
        let Some(task) = Self::next_task(&mut self.factories, &mut self.tasks, group.as_deref())
        else {
            return;
        };
        if let Err(task) = self.workers[index].run_task(task) {
            // the worker changed its mind; keep the task at the head of the
            // queue so its group ordering is preserved
            self.tasks.push_front(task);
        }
    }

    /// Factories first, in insertion order, filtered by their group lists;
    /// then the queued tasks, first match by group in insertion order.
    fn next_task(
        factories: &mut [Box<dyn TaskFactory>],
        tasks: &mut VecDeque<Task>,
        group: Option<&str>,
    ) -> Option<Task> {
        for factory in factories.iter_mut() {
            if let Some(groups) = factory.groups() {
                match group {
                    Some(g) if groups.iter().any(|known| known == g) => {}
                    _ => continue,
                }
            }
            if let Some(task) = factory.create_next_task(group) {
                return Some(task);
            }
        }
        let position = tasks.iter().position(|task| task.group() == group)?;
        tasks.remove(position)
    }

    /// Parks until a registered socket turns readable, bounded by the wait
    /// budget. Skipped entirely when every worker is synchronous.
    fn wait_for_new_update(&self) {
        let all_synchronous = !self.workers.is_empty()
            && self.proxies.is_empty()
            && self.workers.iter().all(|w| w.is_synchronous());
        if all_synchronous {
            return;
        }
        let mut handles: Vec<RawFd> = Vec::new();
        for worker in &self.workers {
            if let Some(fd) = worker.read_handle() {
                handles.push(fd);
            }
        }
        for proxy in &self.proxies {
            if let Some(fd) = proxy.borrow().read_handle() {
                handles.push(fd);
            }
        }
        if handles.is_empty() {
            sys::sleep(self.options.socket_wait_time);
            return;
        }
        if let Err(e) = sys::wait_readable(&handles, self.options.socket_wait_time) {
            logwise::warn_sync!(
                "readiness wait failed: {error}",
                error = e.to_string()
            );
            sys::sleep(self.options.socket_wait_time);
        }
    }

    /// Whether any queued task still has a live worker whose group matches.
    fn any_task_assignable(&self) -> bool {
        self.tasks.iter().any(|task| {
            self.workers.iter().any(|worker| {
                worker.group() == task.group()
                    && matches!(
                        worker.status(),
                        WorkerStatus::Available | WorkerStatus::Starting | WorkerStatus::Working
                    )
            })
        })
    }

    /// Runs the update cycle until no worker is WORKING and nothing queued
    /// can still reach a live worker of its group.
    pub fn wait(&mut self) {
        loop {
            self.update();
            let any_working = self
                .workers
                .iter()
                .any(|w| w.status() == WorkerStatus::Working);
            if any_working {
                continue;
            }
            if !self.any_task_assignable() {
                break;
            }
        }
    }

    /// Runs the update cycle until the queued task list is empty. Factories
    /// are not drained; they are consulted during assignment as usual.
    pub fn wait_until_all_tasks_are_assigned(&mut self) {
        loop {
            if self.tasks.is_empty() {
                return;
            }
            if !self.any_task_assignable() {
                logwise::error_sync!(
                    "{count} queued tasks have no live worker matching their group",
                    count = self.tasks.len().to_string()
                );
                return;
            }
            self.update();
        }
    }

    /// Stops every worker and every enrolled proxy.
    pub fn stop(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
        for proxy in &self.proxies {
            proxy.borrow_mut().stop();
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }
}

impl Default for Taskmaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    struct ListFactory {
        groups: Option<Vec<String>>,
        tasks: VecDeque<Task>,
    }

    impl TaskFactory for ListFactory {
        fn groups(&self) -> Option<&[String]> {
            self.groups.as_deref()
        }

        fn create_next_task(&mut self, group: Option<&str>) -> Option<Task> {
            let position = self.tasks.iter().position(|t| t.group() == group)?;
            self.tasks.remove(position)
        }
    }

    fn task(tag: &str, group: Option<&str>) -> Task {
        let task = Task::new("echo", json!(tag));
        match group {
            Some(group) => task.with_group(group),
            None => task,
        }
    }

    fn payload_of(task: &Task) -> Value {
        task.spec().payload.clone()
    }

    #[test]
    fn queued_tasks_match_by_group_in_insertion_order() {
        let mut tasks: VecDeque<Task> = VecDeque::new();
        tasks.push_back(task("a1", Some("A")));
        tasks.push_back(task("b1", Some("B")));
        tasks.push_back(task("a2", Some("A")));
        let mut factories: Vec<Box<dyn TaskFactory>> = Vec::new();

        let first = Taskmaster::next_task(&mut factories, &mut tasks, Some("A")).unwrap();
        assert_eq!(payload_of(&first), json!("a1"));
        let second = Taskmaster::next_task(&mut factories, &mut tasks, Some("B")).unwrap();
        assert_eq!(payload_of(&second), json!("b1"));
        let third = Taskmaster::next_task(&mut factories, &mut tasks, Some("A")).unwrap();
        assert_eq!(payload_of(&third), json!("a2"));
        assert!(Taskmaster::next_task(&mut factories, &mut tasks, Some("A")).is_none());
    }

    #[test]
    fn group_affinity_is_exact() {
        let mut tasks: VecDeque<Task> = VecDeque::new();
        tasks.push_back(task("grouped", Some("A")));
        tasks.push_back(task("ungrouped", None));
        let mut factories: Vec<Box<dyn TaskFactory>> = Vec::new();

        // a group-less worker only takes group-less tasks
        let picked = Taskmaster::next_task(&mut factories, &mut tasks, None).unwrap();
        assert_eq!(payload_of(&picked), json!("ungrouped"));
        // and a B worker takes nothing
        assert!(Taskmaster::next_task(&mut factories, &mut tasks, Some("B")).is_none());
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn factories_take_precedence_over_the_queue() {
        let mut tasks: VecDeque<Task> = VecDeque::new();
        tasks.push_back(task("queued", None));
        let mut factories: Vec<Box<dyn TaskFactory>> = vec![Box::new(ListFactory {
            groups: None,
            tasks: VecDeque::from([task("fabricated", None)]),
        })];

        let first = Taskmaster::next_task(&mut factories, &mut tasks, None).unwrap();
        assert_eq!(payload_of(&first), json!("fabricated"));
        let second = Taskmaster::next_task(&mut factories, &mut tasks, None).unwrap();
        assert_eq!(payload_of(&second), json!("queued"));
    }

    #[test]
    fn factory_group_lists_filter_requests() {
        let mut tasks: VecDeque<Task> = VecDeque::new();
        let mut factories: Vec<Box<dyn TaskFactory>> = vec![Box::new(ListFactory {
            groups: Some(vec!["A".to_string()]),
            tasks: VecDeque::from([task("a-only", Some("A"))]),
        })];

        // a factory restricted to A is skipped for B and for group-less pulls
        assert!(Taskmaster::next_task(&mut factories, &mut tasks, Some("B")).is_none());
        assert!(Taskmaster::next_task(&mut factories, &mut tasks, None).is_none());
        let picked = Taskmaster::next_task(&mut factories, &mut tasks, Some("A")).unwrap();
        assert_eq!(payload_of(&picked), json!("a-only"));
    }
}
