// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-child worker state machine.
//!
//! An instance moves STARTING → IDLE on the child's hello, IDLE → WORKING on
//! task assignment, and back to IDLE when the task's response resolves.
//! Transport trouble, spawn trouble, or a dead child process all land in
//! FAILED; a deliberate stop lands in FINISHED. The invariant throughout:
//! a current task is held exactly while the status is WORKING.

use crate::endpoint::{HandlerError, MessageEndpoint};
use crate::framed_socket::FramedSocket;
use crate::messages::{RequestBody, RequestKind, ResponseBody, PROTOCOL_VERSION};
use crate::promise::{CallbackQueue, Promise, ResponsePromise};
use crate::proxy::ProxyClient;
use crate::spawn;
use crate::sys::RawFd;
use crate::task::{CallbackError, Task, TaskFailure, TaskRegistry};
use crate::taskmaster::Options;
use crate::transport::{LoopbackTransport, TcpTransport};
use crate::worker::WorkerStatus;
use crate::host::InProcessHost;
use serde_json::Value;
use std::cell::RefCell;
use std::process::Child;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

fn next_instance_id() -> String {
    format!("w{}", NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
}

pub(crate) struct InstanceShared {
    pub status: WorkerStatus,
    pub handshaked: bool,
    pub current_task: Option<Task>,
}

enum ProcessStage {
    Accepting { pending: spawn::PendingChild },
    Running { child: Child },
    Poisoned,
}

enum Backing {
    InProcess { host: InProcessHost },
    Process(ProcessStage),
    Proxied { proxy: Rc<RefCell<ProxyClient>> },
}

/// One live (or once-live) worker child, as seen from the parent.
pub struct WorkerInstance {
    id: String,
    shared: Rc<RefCell<InstanceShared>>,
    queue: CallbackQueue,
    endpoint: Option<MessageEndpoint>,
    backing: Backing,
    start_promise: Promise<()>,
    start_deadline: Option<Instant>,
    current_response: Option<ResponsePromise>,
}

impl WorkerInstance {
    fn new(backing: Backing, endpoint: Option<MessageEndpoint>, queue: CallbackQueue, options: &Options) -> Self {
        let shared = Rc::new(RefCell::new(InstanceShared {
            status: WorkerStatus::Starting,
            handshaked: false,
            current_task: None,
        }));
        let start_promise = Promise::new(&queue);
        let mut instance = WorkerInstance {
            id: next_instance_id(),
            shared,
            queue,
            endpoint,
            backing,
            start_promise,
            start_deadline: Some(Instant::now() + options.start_timeout),
            current_response: None,
        };
        if let Some(endpoint) = instance.endpoint.as_mut() {
            install_handlers(endpoint, &instance.shared, &instance.start_promise);
        }
        instance
    }

    /// A synchronous worker: the child protocol runs in-process over a
    /// loopback pair and is pumped from `update`.
    pub(crate) fn start_in_process(registry: TaskRegistry, options: &Options) -> WorkerInstance {
        let (parent_end, child_end) = LoopbackTransport::pair();
        let parent_socket = FramedSocket::new(Box::new(parent_end));
        let child_socket = FramedSocket::new(Box::new(child_end));
        let host = InProcessHost::new(child_socket, registry);
        let queue = CallbackQueue::new();
        let endpoint = MessageEndpoint::new(Box::new(parent_socket), queue.clone());
        WorkerInstance::new(Backing::InProcess { host }, Some(endpoint), queue, options)
    }

    /// A worker child process with its own socket. The connect-back accept
    /// and the hello handshake complete across later updates.
    pub(crate) fn start_process(options: &Options) -> std::io::Result<WorkerInstance> {
        let executable = options.worker_executable();
        let pending = spawn::spawn_connect_back(&executable, options.bootstrap.as_deref())?;
        Ok(WorkerInstance::new(
            Backing::Process(ProcessStage::Accepting { pending }),
            None,
            CallbackQueue::new(),
            options,
        ))
    }

    /// A worker hosted by a proxy runtime, tunneled over its shared socket.
    pub(crate) fn start_proxied(
        proxy: &Rc<RefCell<ProxyClient>>,
        options: &Options,
    ) -> Result<WorkerInstance, crate::proxy::ProxyError> {
        let id = next_instance_id();
        let socket = proxy.borrow_mut().start_worker_instance(&id, options)?;
        let queue = CallbackQueue::new();
        let endpoint = MessageEndpoint::new(Box::new(socket), queue.clone());
        let mut instance = WorkerInstance::new(
            Backing::Proxied { proxy: proxy.clone() },
            Some(endpoint),
            queue,
            options,
        );
        instance.id = id;
        Ok(instance)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        self.shared.borrow().status
    }

    pub(crate) fn handshaked(&self) -> bool {
        self.shared.borrow().handshaked
    }

    /// Resolves when the child's hello arrives; rejects on failure.
    pub(crate) fn start_promise(&self) -> Promise<()> {
        self.start_promise.clone()
    }

    pub(crate) fn read_handle(&self) -> Option<RawFd> {
        self.endpoint.as_ref().and_then(|e| e.read_handle())
    }

    /// Sends the task to the child. Precondition: status is IDLE. On any
    /// local failure the returned promise resolves with a synthetic worker
    /// failure instead of erroring out.
    pub(crate) fn run_task(&mut self, task: Task) -> Result<ResponsePromise, Task> {
        {
            let shared = self.shared.borrow();
            if shared.status != WorkerStatus::Idle || !shared.handshaked {
                return Err(task);
            }
        }
        if self.endpoint.is_none() {
            return Err(task);
        }
        let spec = task.spec().clone();
        {
            let mut shared = self.shared.borrow_mut();
            shared.status = WorkerStatus::Working;
            shared.current_task = Some(task);
        }
        let send_result = match self.endpoint.as_mut() {
            Some(endpoint) => endpoint.send_request(RequestBody::RunTask(spec)),
            None => Err(crate::endpoint::EndpointError::SocketClosed),
        };
        let promise = match send_result {
            Ok(promise) => promise,
            Err(e) => {
                let reason = format!("failed to send task: {}", e);
                let promise = Promise::resolved(
                    &self.queue,
                    ResponseBody::WorkerFailed { reason: reason.clone() },
                );
                self.attach_completion(&promise);
                self.current_response = Some(promise.clone());
                self.handle_fail(&reason);
                return Ok(promise);
            }
        };
        self.attach_completion(&promise);
        self.current_response = Some(promise.clone());
        Ok(promise)
    }

    /// Hooks task finalization onto the response: clear the task, return to
    /// IDLE, fire exactly one completion hook.
    fn attach_completion(&self, promise: &ResponsePromise) {
        let shared = self.shared.clone();
        promise.then(move |response| {
            let task = {
                let mut shared = shared.borrow_mut();
                let task = shared.current_task.take();
                if shared.status == WorkerStatus::Working {
                    shared.status = WorkerStatus::Idle;
                }
                task
            };
            if let Some(task) = task {
                task.finish(response);
            }
        });
    }

    /// Pumps I/O and advances the start stages. Inbound requests (notably
    /// function callbacks while WORKING) dispatch here.
    pub(crate) fn update(&mut self) {
        match self.status() {
            WorkerStatus::Finished => return,
            WorkerStatus::Failed => {
                self.queue.drain();
                return;
            }
            _ => {}
        }

        // stage the process backing forward: accept, then handshake
        let mut accepted = None;
        let mut stage_failure: Option<String> = None;
        if let Backing::Process(stage) = &mut self.backing {
            if let ProcessStage::Accepting { pending } = stage {
                match pending.try_accept() {
                    Ok(Some(stream)) => accepted = Some(stream),
                    Ok(None) => {
                        if let Ok(Some(status)) = pending.child_mut().try_wait() {
                            stage_failure =
                                Some(format!("worker process exited during startup: {}", status));
                        }
                    }
                    Err(e) => stage_failure = Some(format!("accept failed: {}", e)),
                }
            }
        }
        if let Some(reason) = stage_failure {
            self.handle_fail(&reason);
            return;
        }
        if let Some(stream) = accepted {
            match self.adopt_stream(stream) {
                Ok(()) => {}
                Err(reason) => {
                    self.handle_fail(&reason);
                    return;
                }
            }
        }

        if let Backing::InProcess { host } = &mut self.backing {
            let shared = self.shared.clone();
            let mut parent_call = move |name: &str, args: &[Value]| -> Result<Value, TaskFailure> {
                let mut shared = shared.borrow_mut();
                if shared.status != WorkerStatus::Working {
                    return Err(TaskFailure::new("no task is running"));
                }
                match shared.current_task.as_mut() {
                    Some(task) => task.invoke_callback(name, args).map_err(|e| match e {
                        CallbackError::UnknownFunction(name) => {
                            TaskFailure::new(format!("unknown function {}", name))
                        }
                        CallbackError::Failed(message) => TaskFailure::new(message),
                    }),
                    None => Err(TaskFailure::new("no task is running")),
                }
            };
            host.pump(&mut parent_call);
        }

        if let Some(endpoint) = self.endpoint.as_mut() {
            if let Err(e) = endpoint.update() {
                let reason = format!("transport error: {}", e);
                self.handle_fail(&reason);
                return;
            }
            if !endpoint.is_open() {
                let reason = self.closed_reason();
                self.handle_fail(&reason);
                return;
            }
        }

        // a child that died silently fails the instance promptly, even when
        // the socket has not reported anything yet
        let mut exit_failure: Option<String> = None;
        if let Backing::Process(ProcessStage::Running { child }) = &mut self.backing {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_failure = Some(format!("worker process exited: {}", status));
                }
                Ok(None) => {}
                Err(e) => exit_failure = Some(format!("lost the worker process handle: {}", e)),
            }
        }
        if let Some(reason) = exit_failure {
            self.handle_fail(&reason);
            return;
        }

        if self.status() == WorkerStatus::Starting {
            if let Some(deadline) = self.start_deadline {
                if Instant::now() >= deadline {
                    self.handle_fail("timed out waiting for the worker handshake");
                    return;
                }
            }
        }

        if let Some(promise) = &self.current_response {
            if promise.is_settled() {
                self.current_response = None;
            }
        }
        self.queue.drain();
    }

    fn adopt_stream(&mut self, stream: std::net::TcpStream) -> Result<(), String> {
        let stage = if let Backing::Process(stage) = &mut self.backing {
            stage
        } else {
            return Err("not a process worker".to_string());
        };
        let previous = std::mem::replace(stage, ProcessStage::Poisoned);
        let pending = match previous {
            ProcessStage::Accepting { pending } => pending,
            other => {
                *stage = other;
                return Err("worker connected twice".to_string());
            }
        };
        *stage = ProcessStage::Running { child: pending.into_child() };
        let transport =
            TcpTransport::new(stream).map_err(|e| format!("transport setup failed: {}", e))?;
        let mut endpoint = MessageEndpoint::new(
            Box::new(FramedSocket::new(Box::new(transport))),
            self.queue.clone(),
        );
        install_handlers(&mut endpoint, &self.shared, &self.start_promise);
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn closed_reason(&self) -> String {
        if let Backing::Proxied { proxy } = &self.backing {
            if let Some(reason) = proxy.borrow().instance_fail_reason(&self.id) {
                return reason;
            }
            return "proxy socket closed".to_string();
        }
        "socket closed".to_string()
    }

    /// Idempotent failure entry point: synthesizes a worker-failed response
    /// for everything in flight and finalizes the current task through it.
    /// Restart policy is the enclosing worker's business.
    pub(crate) fn handle_fail(&mut self, reason: &str) {
        {
            let mut shared = self.shared.borrow_mut();
            if matches!(shared.status, WorkerStatus::Failed | WorkerStatus::Finished) {
                return;
            }
            shared.status = WorkerStatus::Failed;
        }
        logwise::warn_sync!(
            "worker instance {id} failed: {reason}",
            id = self.id.clone(),
            reason = reason.to_string()
        );
        self.start_promise.reject(reason.to_string());
        if let Some(promise) = &self.current_response {
            promise.resolve(ResponseBody::WorkerFailed { reason: reason.to_string() });
        }
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.fail_pending(reason);
            endpoint.close();
        }
        self.queue.drain();
    }

    /// Terminates the child and closes the socket. An in-flight task is
    /// finalized with a worker failure first.
    pub(crate) fn stop(&mut self) {
        if self.status() == WorkerStatus::Finished {
            return;
        }
        if let Backing::Proxied { proxy } = &self.backing {
            proxy.borrow_mut().stop_worker_instance(&self.id);
        }
        if let Some(endpoint) = self.endpoint.as_mut() {
            if endpoint.is_open() {
                let _ = endpoint.send_request(RequestBody::Terminate);
            }
            endpoint.fail_pending("worker stopped");
            endpoint.close();
        }
        if let Backing::Process(ProcessStage::Running { child }) = &mut self.backing {
            let _ = child.try_wait();
        }
        self.queue.drain();
        let mut shared = self.shared.borrow_mut();
        shared.status = WorkerStatus::Finished;
        shared.current_task = None;
    }
}

/// Registers the parent-side protocol handlers: the hello handshake and the
/// child's callback into the running task.
fn install_handlers(
    endpoint: &mut MessageEndpoint,
    shared: &Rc<RefCell<InstanceShared>>,
    start_promise: &Promise<()>,
) {
    let hello_shared = shared.clone();
    let hello_promise = start_promise.clone();
    endpoint.mux().register(RequestKind::Hello, move |request| {
        if let RequestBody::Hello { protocol } = request {
            if *protocol != PROTOCOL_VERSION {
                logwise::warn_sync!(
                    "worker announced protocol {protocol}, expected {expected}",
                    protocol = protocol.to_string(),
                    expected = PROTOCOL_VERSION.to_string()
                );
            }
        }
        let mut shared = hello_shared.borrow_mut();
        shared.handshaked = true;
        if shared.status == WorkerStatus::Starting {
            shared.status = WorkerStatus::Idle;
        }
        hello_promise.resolve(());
        Ok(ResponseBody::Ok(Value::Null))
    });

    let call_shared = shared.clone();
    endpoint.mux().register(RequestKind::ExecuteFunction, move |request| {
        let RequestBody::ExecuteFunction { name, args } = request else {
            return Ok(ResponseBody::Error("malformed function call".to_string()));
        };
        let mut shared = call_shared.borrow_mut();
        if shared.status != WorkerStatus::Working {
            return Ok(ResponseBody::Error("no task is running".to_string()));
        }
        match shared.current_task.as_mut() {
            Some(task) => match task.invoke_callback(name, args) {
                Ok(value) => Ok(ResponseBody::Ok(value)),
                Err(CallbackError::UnknownFunction(name)) => {
                    Ok(ResponseBody::Error(format!("unknown function {}", name)))
                }
                Err(CallbackError::Failed(message)) => {
                    Err(HandlerError::new(message, format!("callback {}", name)))
                }
            },
            None => Ok(ResponseBody::Error("no task is running".to_string())),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRegistry;
    use serde_json::json;

    fn options() -> Options {
        Options::default()
    }

    fn echo_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("echo", |payload, _ctx| Ok(payload.clone()));
        registry
    }

    #[test]
    fn in_process_instance_completes_a_task() {
        let mut instance = WorkerInstance::start_in_process(echo_registry(), &options());
        assert_eq!(instance.status(), WorkerStatus::Starting);
        instance.update();
        assert_eq!(instance.status(), WorkerStatus::Idle);
        assert!(instance.handshaked());

        let results = Rc::new(RefCell::new(Vec::new()));
        let results_in = results.clone();
        let task = Task::new("echo", json!(42)).on_result(move |v| results_in.borrow_mut().push(v));
        instance.run_task(task).ok().unwrap();
        assert_eq!(instance.status(), WorkerStatus::Working);

        instance.update();
        assert_eq!(instance.status(), WorkerStatus::Idle);
        assert_eq!(*results.borrow(), vec![json!(42)]);
    }

    #[test]
    fn run_task_requires_idle() {
        let mut instance = WorkerInstance::start_in_process(echo_registry(), &options());
        // still starting; the task must be handed back
        let task = Task::new("echo", json!(1));
        assert!(instance.run_task(task).is_err());
    }

    #[test]
    fn handle_fail_is_idempotent_and_finalizes_the_task() {
        let mut instance = WorkerInstance::start_in_process(echo_registry(), &options());
        instance.update();

        let errors = Rc::new(RefCell::new(Vec::new()));
        let errors_in = errors.clone();
        let task = Task::new("echo", json!(1)).on_error(move |e| errors_in.borrow_mut().push(e));
        instance.run_task(task).ok().unwrap();

        instance.handle_fail("first reason");
        instance.handle_fail("second reason");
        assert_eq!(instance.status(), WorkerStatus::Failed);
        assert_eq!(errors.borrow().len(), 1);
        match &errors.borrow()[0] {
            crate::task::TaskError::WorkerFailed { reason } => {
                assert_eq!(reason, "first reason");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(instance.shared.borrow().current_task.is_none());
    }

    #[test]
    fn stop_finishes_the_instance() {
        let mut instance = WorkerInstance::start_in_process(echo_registry(), &options());
        instance.update();
        instance.stop();
        assert_eq!(instance.status(), WorkerStatus::Finished);
        // idempotent
        instance.stop();
        assert_eq!(instance.status(), WorkerStatus::Finished);
    }
}
