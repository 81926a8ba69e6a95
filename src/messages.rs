// SPDX-License-Identifier: MIT OR Apache-2.0
//! Message types exchanged between the orchestrator and its workers.
//!
//! Every frame on the wire carries one [`Message`], MessagePack-encoded.
//! Requests carry a per-endpoint monotonic id; responses echo the id of the
//! request they answer. Arbitrary user data travels as [`serde_json::Value`],
//! which MessagePack encodes without loss of structure.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Version tag carried in the hello handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// A single wire message: a request or a correlated response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Sender-unique id. Monotonic per endpoint.
    pub id: u64,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    Request(RequestBody),
    Response {
        /// Id of the request this response answers.
        request_id: u64,
        body: ResponseBody,
    },
}

/// The request half of the message catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RequestBody {
    /// Child-to-parent handshake announcing the worker is serving.
    Hello { protocol: u32 },
    /// Instructs a worker to execute the given task.
    RunTask(TaskSpec),
    /// Child-to-parent callback invoking a named method on the task that is
    /// currently running.
    ExecuteFunction { name: String, args: Vec<serde_json::Value> },
    /// Asks a proxy runtime to spawn and enroll a worker instance.
    StartWorkerInstance(InstanceDescriptor),
    /// Asks a proxy runtime to shut one instance down.
    StopWorkerInstance { id: String },
    /// Proxy-to-parent report that a hosted instance's process died.
    WorkerInstanceFailed { id: String, reason: String },
    /// Shuts down the receiving endpoint's event loop.
    Terminate,
}

/// The response half of the message catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    /// Successful result payload.
    Ok(serde_json::Value),
    /// The request could not be served (unknown type, unknown function).
    Error(String),
    /// The handler itself failed while serving the request.
    Exception { message: String, detail: String },
    /// Synthesized locally when the worker died with the request in flight.
    WorkerFailed { reason: String },
}

/// Discriminant used to register request handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Hello,
    RunTask,
    ExecuteFunction,
    StartWorkerInstance,
    StopWorkerInstance,
    WorkerInstanceFailed,
    Terminate,
}

impl RequestBody {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestBody::Hello { .. } => RequestKind::Hello,
            RequestBody::RunTask(_) => RequestKind::RunTask,
            RequestBody::ExecuteFunction { .. } => RequestKind::ExecuteFunction,
            RequestBody::StartWorkerInstance(_) => RequestKind::StartWorkerInstance,
            RequestBody::StopWorkerInstance { .. } => RequestKind::StopWorkerInstance,
            RequestBody::WorkerInstanceFailed { .. } => RequestKind::WorkerInstanceFailed,
            RequestBody::Terminate => RequestKind::Terminate,
        }
    }
}

/// What a worker needs to execute a task: the entry name it resolves in its
/// registry and the task's input payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub entry: String,
    pub payload: serde_json::Value,
}

/// Everything a proxy runtime needs to spawn one worker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub id: String,
    pub executable: String,
    pub bootstrap: Option<String>,
}

impl Message {
    pub fn request(id: u64, body: RequestBody) -> Self {
        Message { id, body: MessageBody::Request(body) }
    }

    pub fn response(id: u64, request_id: u64, body: ResponseBody) -> Self {
        Message { id, body: MessageBody::Response { request_id, body } }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestKind::Hello => "Hello",
            RequestKind::RunTask => "RunTask",
            RequestKind::ExecuteFunction => "ExecuteFunction",
            RequestKind::StartWorkerInstance => "StartWorkerInstance",
            RequestKind::StopWorkerInstance => "StopWorkerInstance",
            RequestKind::WorkerInstanceFailed => "WorkerInstanceFailed",
            RequestKind::Terminate => "Terminate",
        };
        write!(f, "{}", name)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.body {
            MessageBody::Request(req) => {
                write!(f, "Request[id={}] {}", self.id, req.kind())
            }
            MessageBody::Response { request_id, body } => {
                let tag = match body {
                    ResponseBody::Ok(_) => "ok",
                    ResponseBody::Error(_) => "error",
                    ResponseBody::Exception { .. } => "exception",
                    ResponseBody::WorkerFailed { .. } => "worker-failed",
                };
                write!(f, "Response[id={} re={}] {}", self.id, request_id, tag)
            }
        }
    }
}
