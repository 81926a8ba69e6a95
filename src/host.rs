// SPDX-License-Identifier: MIT OR Apache-2.0
//! Child-side event loops.
//!
//! [`WorkerHost`] is the loop a worker process runs: announce with a hello,
//! serve task requests, exit on terminate or when the parent goes away.
//! Unlike the parent, a worker is allowed to block; a running entry that
//! calls back into the parent pumps its own socket until the correlated
//! response arrives, backlogging anything else.
//!
//! [`InProcessHost`] is the same protocol without a process boundary, pumped
//! from inside the parent's update loop for synchronous workers.
//!
//! [`ProxyHost`] is the loop the proxy runtime runs: it spawns a worker
//! process per start request and shovels still-encoded frames between the
//! parent's multiplexed socket and each child's plain one.

use crate::framed_socket::{FramedSocket, MessageSocket};
use crate::messages::{
    CodecError, InstanceDescriptor, Message, MessageBody, RequestBody, ResponseBody, TaskSpec,
    PROTOCOL_VERSION,
};
use crate::proxy_socket::ProxySocket;
use crate::spawn;
use crate::sys;
use crate::task::{TaskContext, TaskFailure, TaskRegistry};
use crate::transport::TcpTransport;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Child;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(1);
const CHILD_START_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("disconnected from parent")]
    Disconnected,
}

/// The event loop of one worker process.
pub struct WorkerHost {
    socket: FramedSocket,
    registry: TaskRegistry,
    next_id: u64,
    backlog: VecDeque<Message>,
}

impl WorkerHost {
    pub fn new(socket: FramedSocket, registry: TaskRegistry) -> Self {
        WorkerHost { socket, registry, next_id: 0, backlog: VecDeque::new() }
    }

    /// Serves until terminated or the parent disappears.
    pub fn run(&mut self) -> Result<(), HostError> {
        self.send_request(RequestBody::Hello { protocol: PROTOCOL_VERSION })?;
        loop {
            let mut inbound: Vec<Message> = self.backlog.drain(..).collect();
            for frame in self.socket.receive() {
                inbound.push(Message::decode(&frame)?);
            }
            let worked = !inbound.is_empty();
            for message in inbound {
                match message.body {
                    MessageBody::Request(RequestBody::RunTask(spec)) => {
                        let response = self.execute(&spec);
                        self.reply(message.id, response)?;
                    }
                    MessageBody::Request(RequestBody::Terminate) => {
                        self.reply(message.id, ResponseBody::Ok(Value::Null))?;
                        return Ok(());
                    }
                    MessageBody::Request(other) => {
                        let response =
                            ResponseBody::Error(format!("unknown request type {}", other.kind()));
                        self.reply(message.id, response)?;
                    }
                    // the hello acknowledgement lands here
                    MessageBody::Response { .. } => {}
                }
            }
            if !self.socket.is_open() {
                return Ok(());
            }
            if !worked {
                sys::sleep(POLL);
            }
        }
    }

    fn execute(&mut self, spec: &TaskSpec) -> ResponseBody {
        let Some(entry) = self.registry.get(&spec.entry) else {
            return ResponseBody::Error(format!("unknown task entry {}", spec.entry));
        };
        let mut ctx = RemoteContext {
            socket: &mut self.socket,
            next_id: &mut self.next_id,
            backlog: &mut self.backlog,
        };
        match entry(&spec.payload, &mut ctx) {
            Ok(value) => ResponseBody::Ok(value),
            Err(e) => ResponseBody::Exception {
                message: e.message,
                detail: format!("task entry {}", spec.entry),
            },
        }
    }

    fn send_request(&mut self, body: RequestBody) -> Result<(), HostError> {
        let message = Message::request(self.next_id, body);
        self.next_id += 1;
        if !self.socket.send(&message.encode()?) {
            return Err(HostError::Disconnected);
        }
        Ok(())
    }

    fn reply(&mut self, request_id: u64, body: ResponseBody) -> Result<(), HostError> {
        let message = Message::response(self.next_id, request_id, body);
        self.next_id += 1;
        if !self.socket.send(&message.encode()?) {
            return Err(HostError::Disconnected);
        }
        Ok(())
    }
}

/// Context for entries running in a worker process. `call_parent` blocks the
/// child (never the parent) until the correlated response arrives.
struct RemoteContext<'a> {
    socket: &'a mut FramedSocket,
    next_id: &'a mut u64,
    backlog: &'a mut VecDeque<Message>,
}

impl TaskContext for RemoteContext<'_> {
    fn call_parent(&mut self, name: &str, args: &[Value]) -> Result<Value, TaskFailure> {
        let id = *self.next_id;
        *self.next_id += 1;
        let message = Message::request(
            id,
            RequestBody::ExecuteFunction { name: name.to_string(), args: args.to_vec() },
        );
        let bytes = message
            .encode()
            .map_err(|e| TaskFailure::new(format!("failed to encode callback: {}", e)))?;
        if !self.socket.send(&bytes) {
            return Err(TaskFailure::new("lost connection to parent"));
        }
        loop {
            for frame in self.socket.receive() {
                let inbound = Message::decode(&frame)
                    .map_err(|e| TaskFailure::new(format!("corrupt parent message: {}", e)))?;
                match inbound.body {
                    MessageBody::Response { request_id, body } if request_id == id => {
                        return match body {
                            ResponseBody::Ok(value) => Ok(value),
                            ResponseBody::Error(msg) => Err(TaskFailure::new(msg)),
                            ResponseBody::Exception { message, .. } => {
                                Err(TaskFailure::new(message))
                            }
                            ResponseBody::WorkerFailed { reason } => Err(TaskFailure::new(reason)),
                        };
                    }
                    MessageBody::Response { .. } => {}
                    MessageBody::Request(request) => {
                        self.backlog.push_back(Message {
                            id: inbound.id,
                            body: MessageBody::Request(request),
                        });
                    }
                }
            }
            if !self.socket.is_open() {
                return Err(TaskFailure::new("lost connection to parent"));
            }
            sys::sleep(POLL);
        }
    }
}

/// The worker protocol without a process boundary, for synchronous workers.
///
/// Entries run inside the parent's update loop, so `call_parent` cannot wait
/// on socket traffic; the pump's caller supplies a direct dispatch into the
/// originating task instead.
pub(crate) struct InProcessHost {
    socket: FramedSocket,
    registry: TaskRegistry,
    next_id: u64,
}

pub(crate) type DirectParentCall<'a> =
    &'a mut dyn FnMut(&str, &[Value]) -> Result<Value, TaskFailure>;

struct DirectContext<'a, 'b> {
    parent_call: &'a mut DirectParentCall<'b>,
}

impl TaskContext for DirectContext<'_, '_> {
    fn call_parent(&mut self, name: &str, args: &[Value]) -> Result<Value, TaskFailure> {
        (self.parent_call)(name, args)
    }
}

impl InProcessHost {
    pub(crate) fn new(mut socket: FramedSocket, registry: TaskRegistry) -> Self {
        // announce immediately; the parent observes the hello on its next pump
        let hello = Message::request(0, RequestBody::Hello { protocol: PROTOCOL_VERSION });
        match hello.encode() {
            Ok(bytes) => {
                socket.send(&bytes);
            }
            Err(e) => {
                logwise::error_sync!(
                    "in-process host failed to encode hello: {error}",
                    error = e.to_string()
                );
            }
        }
        InProcessHost { socket, registry, next_id: 1 }
    }

    pub(crate) fn pump(&mut self, mut parent_call: DirectParentCall<'_>) {
        for frame in self.socket.receive() {
            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    logwise::error_sync!(
                        "in-process host closing on corrupt message: {error}",
                        error = e.to_string()
                    );
                    self.socket.close();
                    return;
                }
            };
            match message.body {
                MessageBody::Request(RequestBody::RunTask(spec)) => {
                    let response = self.execute(&spec, &mut parent_call);
                    self.reply(message.id, response);
                }
                MessageBody::Request(RequestBody::Terminate) => {
                    self.reply(message.id, ResponseBody::Ok(Value::Null));
                    self.socket.close();
                    return;
                }
                MessageBody::Request(other) => {
                    self.reply(
                        message.id,
                        ResponseBody::Error(format!("unknown request type {}", other.kind())),
                    );
                }
                MessageBody::Response { .. } => {}
            }
        }
    }

    fn execute(&mut self, spec: &TaskSpec, parent_call: &mut DirectParentCall<'_>) -> ResponseBody {
        let Some(entry) = self.registry.get(&spec.entry) else {
            return ResponseBody::Error(format!("unknown task entry {}", spec.entry));
        };
        let mut ctx = DirectContext { parent_call };
        match entry(&spec.payload, &mut ctx) {
            Ok(value) => ResponseBody::Ok(value),
            Err(e) => ResponseBody::Exception {
                message: e.message,
                detail: format!("task entry {}", spec.entry),
            },
        }
    }

    fn reply(&mut self, request_id: u64, body: ResponseBody) {
        let message = Message::response(self.next_id, request_id, body);
        self.next_id += 1;
        match message.encode() {
            Ok(bytes) => {
                self.socket.send(&bytes);
            }
            Err(e) => {
                logwise::error_sync!(
                    "in-process host failed to encode reply: {error}",
                    error = e.to_string()
                );
            }
        }
    }
}

/// Outcome of one [`ProxyHost::pump`] iteration.
pub enum PumpOutcome {
    Continue,
    /// The parent asked the runtime to shut down.
    Terminated,
    /// The parent's socket went away.
    ParentGone,
}

enum ChildState {
    Accepting { pending: spawn::PendingChild, deadline: Instant },
    Running { child: Child, socket: FramedSocket },
    Done,
}

struct HostedChild {
    id: String,
    state: ChildState,
}

/// The event loop of the proxy runtime process.
pub struct ProxyHost {
    proxy: ProxySocket,
    children: Vec<HostedChild>,
    dying: Vec<(Child, Instant)>,
    next_id: u64,
}

impl ProxyHost {
    pub fn new(socket: FramedSocket) -> Self {
        ProxyHost {
            proxy: ProxySocket::new(socket),
            children: Vec::new(),
            dying: Vec::new(),
            next_id: 0,
        }
    }

    /// Serves until terminated or the parent disappears, then shuts every
    /// hosted child down.
    pub fn run(&mut self) {
        loop {
            match self.pump() {
                PumpOutcome::Continue => sys::sleep(POLL),
                PumpOutcome::Terminated | PumpOutcome::ParentGone => {
                    self.shutdown_children();
                    return;
                }
            }
        }
    }

    /// One iteration: control traffic, then per-child forwarding and
    /// liveness.
    pub fn pump(&mut self) -> PumpOutcome {
        if !self.proxy.is_open() {
            return PumpOutcome::ParentGone;
        }
        let mut terminate_ack: Option<u64> = None;
        for message in self.proxy.receive_proxy_messages(None) {
            match message.body {
                MessageBody::Request(request) => {
                    let kind = request.kind();
                    match request {
                        RequestBody::StartWorkerInstance(descriptor) => {
                            let response = self.start_instance(&descriptor);
                            self.reply_control(message.id, response);
                        }
                        RequestBody::StopWorkerInstance { id } => {
                            self.stop_instance(&id);
                            self.reply_control(message.id, ResponseBody::Ok(Value::Null));
                        }
                        RequestBody::Terminate => {
                            terminate_ack = Some(message.id);
                            break;
                        }
                        _ => {
                            self.reply_control(
                                message.id,
                                ResponseBody::Error(format!("unknown request type {}", kind)),
                            );
                        }
                    }
                }
                // acks for our failure reports
                MessageBody::Response { .. } => {}
            }
        }
        if let Some(request_id) = terminate_ack {
            self.reply_control(request_id, ResponseBody::Ok(Value::Null));
            return PumpOutcome::Terminated;
        }
        self.pump_children();
        self.reap_dying();
        if !self.proxy.is_open() {
            return PumpOutcome::ParentGone;
        }
        PumpOutcome::Continue
    }

    fn start_instance(&mut self, descriptor: &InstanceDescriptor) -> ResponseBody {
        let bootstrap = descriptor.bootstrap.as_deref().map(Path::new);
        match spawn::spawn_connect_back(Path::new(&descriptor.executable), bootstrap) {
            Ok(pending) => {
                self.children.push(HostedChild {
                    id: descriptor.id.clone(),
                    state: ChildState::Accepting {
                        pending,
                        deadline: Instant::now() + CHILD_START_TIMEOUT,
                    },
                });
                ResponseBody::Ok(Value::Null)
            }
            Err(e) => ResponseBody::Error(format!("failed to spawn worker instance: {}", e)),
        }
    }

    fn stop_instance(&mut self, id: &str) {
        let Some(position) = self.children.iter().position(|c| c.id == id) else {
            return;
        };
        let hosted = self.children.remove(position);
        match hosted.state {
            ChildState::Running { child, mut socket } => {
                let message = Message::request(self.next_id, RequestBody::Terminate);
                self.next_id += 1;
                if let Ok(bytes) = message.encode() {
                    socket.send(&bytes);
                }
                socket.close();
                self.dying.push((child, Instant::now() + STOP_GRACE));
            }
            ChildState::Accepting { pending, .. } => {
                let mut child = pending.into_child();
                let _ = child.kill();
                let _ = child.wait();
            }
            ChildState::Done => {}
        }
    }

    fn pump_children(&mut self) {
        let ProxyHost { proxy, children, next_id, .. } = self;
        let mut failed: Vec<(String, String)> = Vec::new();
        for hosted in children.iter_mut() {
            let state = std::mem::replace(&mut hosted.state, ChildState::Done);
            hosted.state = match state {
                ChildState::Accepting { mut pending, deadline } => match pending.try_accept() {
                    Ok(Some(stream)) => match TcpTransport::new(stream) {
                        Ok(transport) => ChildState::Running {
                            child: pending.into_child(),
                            socket: FramedSocket::new(Box::new(transport)),
                        },
                        Err(e) => {
                            failed.push((hosted.id.clone(), format!("transport setup failed: {}", e)));
                            let mut child = pending.into_child();
                            let _ = child.kill();
                            let _ = child.wait();
                            ChildState::Done
                        }
                    },
                    Ok(None) => {
                        if let Ok(Some(status)) = pending.child_mut().try_wait() {
                            failed.push((
                                hosted.id.clone(),
                                format!("worker exited during startup: {}", status),
                            ));
                            ChildState::Done
                        } else if Instant::now() >= deadline {
                            failed.push((
                                hosted.id.clone(),
                                "worker did not connect back in time".to_string(),
                            ));
                            let mut child = pending.into_child();
                            let _ = child.kill();
                            let _ = child.wait();
                            ChildState::Done
                        } else {
                            ChildState::Accepting { pending, deadline }
                        }
                    }
                    Err(e) => {
                        failed.push((hosted.id.clone(), format!("accept failed: {}", e)));
                        let mut child = pending.into_child();
                        let _ = child.kill();
                        let _ = child.wait();
                        ChildState::Done
                    }
                },
                ChildState::Running { mut child, mut socket } => {
                    for frame in proxy.receive_raw_proxy_messages(Some(&hosted.id)) {
                        socket.send(&frame);
                    }
                    for frame in socket.receive() {
                        proxy.send_proxy_message(Some(&hosted.id), &frame);
                    }
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            failed.push((
                                hosted.id.clone(),
                                format!("worker process exited: {}", status),
                            ));
                            ChildState::Done
                        }
                        _ => ChildState::Running { child, socket },
                    }
                }
                ChildState::Done => ChildState::Done,
            };
        }
        children.retain(|c| !matches!(c.state, ChildState::Done));
        for (id, reason) in failed {
            logwise::warn_sync!(
                "proxied worker instance {id} failed: {reason}",
                id = id.clone(),
                reason = reason.clone()
            );
            let message =
                Message::request(*next_id, RequestBody::WorkerInstanceFailed { id, reason });
            *next_id += 1;
            if let Ok(bytes) = message.encode() {
                proxy.send_proxy_message(None, &bytes);
            }
        }
    }

    fn reply_control(&mut self, request_id: u64, body: ResponseBody) {
        let message = Message::response(self.next_id, request_id, body);
        self.next_id += 1;
        match message.encode() {
            Ok(bytes) => {
                self.proxy.send_proxy_message(None, &bytes);
            }
            Err(e) => {
                logwise::error_sync!(
                    "proxy host failed to encode control reply: {error}",
                    error = e.to_string()
                );
            }
        }
    }

    fn reap_dying(&mut self) {
        self.dying.retain_mut(|(child, deadline)| match child.try_wait() {
            Ok(Some(_)) => false,
            _ => {
                if Instant::now() >= *deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    false
                } else {
                    true
                }
            }
        });
    }

    fn shutdown_children(&mut self) {
        let children = std::mem::take(&mut self.children);
        for hosted in children {
            match hosted.state {
                ChildState::Running { child, mut socket } => {
                    let message = Message::request(self.next_id, RequestBody::Terminate);
                    self.next_id += 1;
                    if let Ok(bytes) = message.encode() {
                        socket.send(&bytes);
                    }
                    socket.close();
                    self.dying.push((child, Instant::now() + STOP_GRACE));
                }
                ChildState::Accepting { pending, .. } => {
                    let mut child = pending.into_child();
                    let _ = child.kill();
                    let _ = child.wait();
                }
                ChildState::Done => {}
            }
        }
        while !self.dying.is_empty() {
            self.reap_dying();
            if self.dying.is_empty() {
                break;
            }
            sys::sleep(POLL);
        }
    }
}

/// Entry point for a worker binary: connect back to the parent named in the
/// environment and serve tasks from `registry`.
pub fn run_worker_from_env(registry: TaskRegistry) -> Result<(), HostError> {
    let stream = spawn::connect_back()?;
    let transport = TcpTransport::new(stream)?;
    let socket = FramedSocket::new(Box::new(transport));
    WorkerHost::new(socket, registry).run()
}

/// Entry point for a proxy runtime binary.
pub fn run_proxy_from_env() -> Result<(), HostError> {
    let stream = spawn::connect_back()?;
    let transport = TcpTransport::new(stream)?;
    let socket = FramedSocket::new(Box::new(transport));
    ProxyHost::new(socket).run();
    Ok(())
}

/// Entries served by the stock `task_worker` binary. Real deployments link
/// the library from their own binary and register their own entries; these
/// exist so the shipped binaries can be exercised end to end.
pub fn demo_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("echo", |payload, _ctx| Ok(payload.clone()));
    registry.register("double_via_parent", |payload, ctx| {
        ctx.call_parent("computeHelper", std::slice::from_ref(payload))
    });
    registry.register("fail", |_payload, _ctx| {
        Err(TaskFailure::new("task failed on request"))
    });
    registry.register("crash", |_payload, _ctx| std::process::exit(3));
    registry.register("sleep_ms", |payload, _ctx| {
        let ms = payload.as_u64().unwrap_or(0);
        std::thread::sleep(Duration::from_millis(ms));
        Ok(payload.clone())
    });
    registry
}
