// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parent-side client of a proxy runtime process.
//!
//! A [`ProxyClient`] owns the one shared socket a proxy runtime multiplexes
//! its hosted instances over. The control conversation (start/stop instance,
//! terminate, failure reports) runs over the `None` logical id; each hosted
//! instance gets a [`ProxiedSocket`] bound to its own id and is none the
//! wiser. Several workers can hold the same client by reference; the
//! orchestrator enrolls it exactly once.

use crate::endpoint::{EndpointError, MessageEndpoint};
use crate::framed_socket::FramedSocket;
use crate::messages::{InstanceDescriptor, RequestBody, RequestKind, ResponseBody};
use crate::promise::CallbackQueue;
use crate::proxy_socket::{ProxiedSocket, ProxySocket};
use crate::spawn;
use crate::sys::{self, RawFd};
use crate::taskmaster::Options;
use crate::transport::TcpTransport;
use serde_json::Value;
use std::cell::RefCell;
use std::process::Child;
use std::rc::Rc;
use std::time::{Duration, Instant};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy runtime is not running")]
    NotRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyState {
    Idle,
    Running,
    Failed,
    Stopped,
}

/// Client handle for one proxy runtime process.
pub struct ProxyClient {
    state: ProxyState,
    child: Option<Child>,
    socket: Option<Rc<RefCell<ProxySocket>>>,
    control: Option<MessageEndpoint>,
    options: Options,
    fail_reason: Option<String>,
}

impl ProxyClient {
    pub fn new() -> Self {
        ProxyClient {
            state: ProxyState::Idle,
            child: None,
            socket: None,
            control: None,
            options: Options::default(),
            fail_reason: None,
        }
    }

    /// Absorbs the orchestrator's shared configuration before starting.
    pub(crate) fn set_options(&mut self, options: &Options) {
        self.options = options.clone();
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state != ProxyState::Idle
    }

    /// Spawns the proxy runtime and opens the shared transport. Blocks,
    /// bounded by the start timeout, until the runtime connects back.
    pub(crate) fn start(&mut self) -> Result<(), ProxyError> {
        if self.state != ProxyState::Idle {
            return Ok(());
        }
        let executable = self.options.proxy_runtime_executable();
        let mut pending = spawn::spawn_connect_back(&executable, None)?;
        let stream = spawn::accept_with_deadline(&mut pending, self.options.start_timeout)?;
        let transport = TcpTransport::new(stream)?;
        let socket = Rc::new(RefCell::new(ProxySocket::new(FramedSocket::new(Box::new(
            transport,
        )))));

        let mut control = MessageEndpoint::new(
            Box::new(ProxiedSocket::new(socket.clone(), None)),
            CallbackQueue::new(),
        );
        let failures = socket.clone();
        control.mux().register(RequestKind::WorkerInstanceFailed, move |request| {
            if let RequestBody::WorkerInstanceFailed { id, reason } = request {
                logwise::warn_sync!(
                    "proxy reported instance {id} failed: {reason}",
                    id = id.clone(),
                    reason = reason.clone()
                );
                failures.borrow_mut().mark_dead(id, reason);
            }
            Ok(ResponseBody::Ok(Value::Null))
        });

        self.child = Some(pending.into_child());
        self.socket = Some(socket);
        self.control = Some(control);
        self.state = ProxyState::Running;
        logwise::info_sync!(
            "proxy runtime started from {executable}",
            executable = executable.display().to_string()
        );
        Ok(())
    }

    /// Asks the runtime to spawn an instance and returns the tunneled socket
    /// the instance's endpoint will speak through.
    pub(crate) fn start_worker_instance(
        &mut self,
        id: &str,
        options: &Options,
    ) -> Result<ProxiedSocket, ProxyError> {
        if self.state != ProxyState::Running {
            return Err(ProxyError::NotRunning);
        }
        let (Some(control), Some(socket)) = (self.control.as_mut(), self.socket.as_ref()) else {
            return Err(ProxyError::NotRunning);
        };
        let descriptor = InstanceDescriptor {
            id: id.to_string(),
            executable: options.worker_executable().to_string_lossy().into_owned(),
            bootstrap: options
                .bootstrap
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        };
        let promise = control.send_request(RequestBody::StartWorkerInstance(descriptor))?;
        let failures = socket.clone();
        let instance_id = id.to_string();
        promise.then(move |response| match response {
            ResponseBody::Ok(_) => {}
            ResponseBody::Error(msg)
            | ResponseBody::Exception { message: msg, .. }
            | ResponseBody::WorkerFailed { reason: msg } => {
                logwise::warn_sync!(
                    "proxy could not start instance {id}: {reason}",
                    id = instance_id.clone(),
                    reason = msg.clone()
                );
                failures.borrow_mut().mark_dead(&instance_id, &msg);
            }
        });
        Ok(ProxiedSocket::new(socket.clone(), Some(id.to_string())))
    }

    pub(crate) fn stop_worker_instance(&mut self, id: &str) {
        if let Some(control) = self.control.as_mut() {
            match control.send_request(RequestBody::StopWorkerInstance { id: id.to_string() }) {
                Ok(_) => {}
                Err(e) => {
                    logwise::warn_sync!(
                        "could not ask the proxy to stop instance {id}: {error}",
                        id = id.to_string(),
                        error = e.to_string()
                    );
                }
            }
        }
    }

    /// Pumps the shared socket: control traffic dispatches here, tunneled
    /// instance traffic is parked for the instances' own pumps.
    pub(crate) fn update(&mut self) {
        if self.state != ProxyState::Running {
            return;
        }
        if let Some(control) = self.control.as_mut() {
            if let Err(e) = control.update() {
                let reason = format!("proxy control channel failed: {}", e);
                self.fail(&reason);
                return;
            }
        }
        let mut exit_reason: Option<String> = None;
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                exit_reason = Some(format!("proxy runtime exited: {}", status));
            }
        }
        if let Some(reason) = exit_reason {
            self.fail(&reason);
            return;
        }
        let closed = match self.socket.as_ref() {
            Some(socket) => !socket.borrow().is_open(),
            None => true,
        };
        if closed {
            self.fail("proxy socket closed");
        }
    }

    /// Fails the proxy and, through the shared socket, every instance routed
    /// over it. The orchestrator keeps running its direct workers.
    fn fail(&mut self, reason: &str) {
        if self.state != ProxyState::Running {
            return;
        }
        logwise::error_sync!("proxy failed: {reason}", reason = reason.to_string());
        self.state = ProxyState::Failed;
        self.fail_reason = Some(reason.to_string());
        if let Some(socket) = self.socket.as_ref() {
            socket.borrow_mut().abort(reason);
        }
        if let Some(control) = self.control.as_mut() {
            control.fail_pending(reason);
            control.queue().drain();
        }
    }

    /// Why a given instance's tunnel is dead, when the proxy knows.
    pub(crate) fn instance_fail_reason(&self, id: &str) -> Option<String> {
        if let Some(socket) = self.socket.as_ref() {
            if let Some(reason) = socket.borrow().dead_reason(id) {
                return Some(reason);
            }
        }
        self.fail_reason.clone()
    }

    /// Whether the runtime process is still alive.
    pub(crate) fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Sends a terminate and polls `is_running` with the configured
    /// micro-sleep until the runtime exits, killing it past the deadline.
    pub(crate) fn stop(&mut self) {
        if matches!(self.state, ProxyState::Idle | ProxyState::Stopped) {
            self.state = ProxyState::Stopped;
            return;
        }
        if let Some(control) = self.control.as_mut() {
            if control.is_open() {
                let _ = control.send_request(RequestBody::Terminate);
            }
        }
        let deadline = Instant::now() + STOP_TIMEOUT;
        while self.is_running() {
            if Instant::now() >= deadline {
                logwise::warn_sync!("proxy runtime ignored terminate, killing it");
                if let Some(child) = self.child.as_mut() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                break;
            }
            sys::sleep(self.options.socket_wait_time);
        }
        if let Some(socket) = self.socket.as_ref() {
            socket.borrow_mut().close();
        }
        if let Some(control) = self.control.as_mut() {
            control.fail_pending("proxy stopped");
            control.queue().drain();
        }
        self.state = ProxyState::Stopped;
    }

    pub(crate) fn read_handle(&self) -> Option<RawFd> {
        self.socket.as_ref().and_then(|s| s.borrow().read_handle())
    }
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}
