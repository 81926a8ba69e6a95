// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request/response plumbing over one framed socket.
//!
//! A [`MessageEndpoint`] owns the socket, allocates request ids, tracks
//! in-flight promises, and dispatches inbound requests through a
//! [`RequestHandlerMux`]. Handlers run inside the pump and must not block;
//! long-running work is expressed as further request/response exchanges that
//! flow through later pump iterations.

use crate::framed_socket::MessageSocket;
use crate::messages::{CodecError, Message, MessageBody, RequestBody, RequestKind, ResponseBody};
use crate::promise::{CallbackQueue, Promise, ResponsePromise};
use crate::sys::RawFd;
use std::collections::HashMap;

/// Raised by a handler that failed while serving a request. Mapped to an
/// exception response so the requester sees what went wrong.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub detail: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>, detail: impl Into<String>) -> Self {
        HandlerError { message: message.into(), detail: detail.into() }
    }
}

pub type Handler = Box<dyn FnMut(&RequestBody) -> Result<ResponseBody, HandlerError>>;

/// Maps request kinds to their handlers.
pub struct RequestHandlerMux {
    handlers: HashMap<RequestKind, Handler>,
}

impl RequestHandlerMux {
    pub fn new() -> Self {
        RequestHandlerMux { handlers: HashMap::new() }
    }

    /// Registers the handler for one request kind, replacing any previous
    /// registration.
    pub fn register(
        &mut self,
        kind: RequestKind,
        handler: impl FnMut(&RequestBody) -> Result<ResponseBody, HandlerError> + 'static,
    ) {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Dispatches one request and produces the response to send back.
    pub fn dispatch(&mut self, request: &RequestBody) -> ResponseBody {
        let kind = request.kind();
        match self.handlers.get_mut(&kind) {
            Some(handler) => match handler(request) {
                Ok(response) => response,
                Err(e) => ResponseBody::Exception { message: e.message, detail: e.detail },
            },
            None => {
                logwise::warn_sync!(
                    "no handler registered for request type {kind}",
                    kind = kind.to_string()
                );
                ResponseBody::Error(format!("unknown request type {}", kind))
            }
        }
    }
}

impl Default for RequestHandlerMux {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("socket closed")]
    SocketClosed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One side of a request/response conversation.
pub struct MessageEndpoint {
    socket: Box<dyn MessageSocket>,
    next_id: u64,
    pending: HashMap<u64, ResponsePromise>,
    mux: RequestHandlerMux,
    queue: CallbackQueue,
}

impl MessageEndpoint {
    pub fn new(socket: Box<dyn MessageSocket>, queue: CallbackQueue) -> Self {
        MessageEndpoint {
            socket,
            next_id: 0,
            pending: HashMap::new(),
            mux: RequestHandlerMux::new(),
            queue,
        }
    }

    /// The continuation queue shared with promises minted by this endpoint.
    pub fn queue(&self) -> CallbackQueue {
        self.queue.clone()
    }

    pub fn mux(&mut self) -> &mut RequestHandlerMux {
        &mut self.mux
    }

    /// Sends a request and returns the promise its response will resolve.
    pub fn send_request(&mut self, body: RequestBody) -> Result<ResponsePromise, EndpointError> {
        let id = self.next_id;
        self.next_id += 1;
        let bytes = Message::request(id, body).encode()?;
        if !self.socket.send(&bytes) {
            return Err(EndpointError::SocketClosed);
        }
        let promise = Promise::new(&self.queue);
        self.pending.insert(id, promise.clone());
        Ok(promise)
    }

    /// Pumps the socket once: settles promises for inbound responses,
    /// serves inbound requests, then drains due continuations.
    ///
    /// An error return means the stream itself is unusable and the caller
    /// should fail the endpoint.
    pub fn update(&mut self) -> Result<(), EndpointError> {
        let frames = self.socket.receive();
        for frame in frames {
            let message = Message::decode(&frame)?;
            match message.body {
                MessageBody::Response { request_id, body } => {
                    match self.pending.remove(&request_id) {
                        Some(promise) => promise.resolve(body),
                        None => {
                            logwise::warn_sync!(
                                "dropping response for unknown request id {id}",
                                id = request_id.to_string()
                            );
                        }
                    }
                }
                MessageBody::Request(request) => {
                    let response = self.mux.dispatch(&request);
                    let bytes = Message::response(self.next_id, message.id, response).encode()?;
                    self.next_id += 1;
                    self.socket.send(&bytes);
                }
            }
        }
        self.queue.drain();
        Ok(())
    }

    /// Settles every in-flight promise with a synthetic worker failure.
    /// Continuations fire on the next drain.
    pub fn fail_pending(&mut self, reason: &str) {
        for (_, promise) in self.pending.drain() {
            promise.resolve(ResponseBody::WorkerFailed { reason: reason.to_string() });
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_open()
    }

    pub fn close(&mut self) {
        self.socket.close();
    }

    pub fn read_handle(&self) -> Option<RawFd> {
        self.socket.read_handle()
    }
}
