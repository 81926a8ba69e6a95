// SPDX-License-Identifier: MIT OR Apache-2.0
//! Multiplexing of several logical worker streams over one framed socket.
//!
//! Each frame on the shared transport is a [`ProxyMessage`] envelope: a
//! logical worker id plus the still-encoded inner frame. `None` as the id
//! addresses the proxy runtime itself. Envelopes whose id nobody has asked
//! for yet stay parked in an `unhandled` list, bounded by a watermark;
//! overflowing it means a logical receiver has wedged and the whole proxy
//! stream is failed.
//!
//! [`ProxiedSocket`] adapts the shared socket back to the plain
//! [`MessageSocket`] shape by binding it to one fixed id, so endpoint code is
//! unaware it is tunneled.

use crate::framed_socket::{FramedSocket, MessageSocket};
use crate::messages::Message;
use crate::sys::RawFd;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Default bound on envelopes parked for ids nobody is currently reading.
pub const DEFAULT_UNHANDLED_WATERMARK: usize = 4096;

/// Envelope for one tunneled frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyMessage {
    /// Logical worker the inner frame belongs to. `None` addresses the proxy
    /// runtime itself.
    pub worker_id: Option<String>,
    /// The encoded inner frame, passed through without re-serialization.
    pub frame: Vec<u8>,
}

/// The shared, demultiplexing side of a proxy transport.
pub struct ProxySocket {
    socket: FramedSocket,
    unhandled: VecDeque<ProxyMessage>,
    watermark: usize,
    failure: Option<String>,
    /// Logical ids whose backing process is known dead, with the reason.
    dead: HashMap<String, String>,
}

impl ProxySocket {
    pub fn new(socket: FramedSocket) -> Self {
        Self::with_watermark(socket, DEFAULT_UNHANDLED_WATERMARK)
    }

    pub fn with_watermark(socket: FramedSocket, watermark: usize) -> Self {
        ProxySocket {
            socket,
            unhandled: VecDeque::new(),
            watermark,
            failure: None,
            dead: HashMap::new(),
        }
    }

    /// Envelopes and sends one inner frame for the given logical id.
    pub fn send_proxy_message(&mut self, worker_id: Option<&str>, frame: &[u8]) -> bool {
        if self.failure.is_some() {
            return false;
        }
        let envelope = ProxyMessage {
            worker_id: worker_id.map(String::from),
            frame: frame.to_vec(),
        };
        let bytes = match rmp_serde::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(format!("failed to encode proxy envelope: {}", e));
                return false;
            }
        };
        self.socket.send(&bytes)
    }

    /// Reads everything the transport has and parks it in `unhandled`.
    fn pump(&mut self) {
        if self.failure.is_some() {
            return;
        }
        for frame in self.socket.receive() {
            match rmp_serde::from_slice::<ProxyMessage>(&frame) {
                Ok(envelope) => self.unhandled.push_back(envelope),
                Err(e) => {
                    self.fail(format!("corrupt proxy envelope: {}", e));
                    return;
                }
            }
        }
        if self.unhandled.len() > self.watermark {
            self.fail(format!(
                "unhandled proxy messages exceeded watermark of {}",
                self.watermark
            ));
        }
    }

    /// Fails the shared stream from outside, e.g. when the runtime process
    /// behind it died. Every `ProxiedSocket` on top reports closed from here
    /// on.
    pub(crate) fn abort(&mut self, reason: &str) {
        if self.failure.is_none() {
            self.fail(reason.to_string());
        }
    }

    fn fail(&mut self, reason: String) {
        logwise::error_sync!("proxy socket failed: {reason}", reason = reason.clone());
        self.failure = Some(reason);
        self.socket.close();
        self.unhandled.clear();
    }

    fn take_matching(&mut self, worker_id: Option<&str>) -> Vec<Vec<u8>> {
        let mut matched = Vec::new();
        let mut kept = VecDeque::with_capacity(self.unhandled.len());
        for envelope in self.unhandled.drain(..) {
            if envelope.worker_id.as_deref() == worker_id {
                matched.push(envelope.frame);
            } else {
                kept.push_back(envelope);
            }
        }
        self.unhandled = kept;
        matched
    }

    /// Decoded inner messages addressed to `worker_id`, in arrival order.
    /// Frames for other ids stay parked.
    pub fn receive_proxy_messages(&mut self, worker_id: Option<&str>) -> Vec<Message> {
        self.receive_raw_proxy_messages(worker_id)
            .into_iter()
            .filter_map(|frame| match Message::decode(&frame) {
                Ok(message) => Some(message),
                Err(e) => {
                    logwise::warn_sync!(
                        "dropping undecodable tunneled message: {error}",
                        error = e.to_string()
                    );
                    None
                }
            })
            .collect()
    }

    /// Still-encoded inner frames addressed to `worker_id`, for forwarding
    /// without a decode/re-encode round trip.
    pub fn receive_raw_proxy_messages(&mut self, worker_id: Option<&str>) -> Vec<Vec<u8>> {
        self.pump();
        self.take_matching(worker_id)
    }

    /// Marks one logical id as dead so its `ProxiedSocket` reports closed.
    pub fn mark_dead(&mut self, worker_id: &str, reason: &str) {
        self.dead.insert(worker_id.to_string(), reason.to_string());
    }

    pub fn dead_reason(&self, worker_id: &str) -> Option<String> {
        self.dead.get(worker_id).cloned()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.failure.is_none() && self.socket.is_open()
    }

    pub fn close(&mut self) {
        self.socket.close();
    }

    pub fn read_handle(&self) -> Option<RawFd> {
        self.socket.read_handle()
    }
}

/// A [`MessageSocket`] view of one logical stream within a [`ProxySocket`].
pub struct ProxiedSocket {
    proxy: Rc<RefCell<ProxySocket>>,
    worker_id: Option<String>,
}

impl ProxiedSocket {
    pub fn new(proxy: Rc<RefCell<ProxySocket>>, worker_id: Option<String>) -> Self {
        ProxiedSocket { proxy, worker_id }
    }
}

impl MessageSocket for ProxiedSocket {
    fn send(&mut self, payload: &[u8]) -> bool {
        self.proxy
            .borrow_mut()
            .send_proxy_message(self.worker_id.as_deref(), payload)
    }

    fn receive(&mut self) -> Vec<Vec<u8>> {
        self.proxy
            .borrow_mut()
            .receive_raw_proxy_messages(self.worker_id.as_deref())
    }

    fn close(&mut self) {
        // closing one logical stream must not tear down the shared transport
    }

    fn is_open(&self) -> bool {
        let proxy = self.proxy.borrow();
        if !proxy.is_open() {
            return false;
        }
        match &self.worker_id {
            Some(id) => !proxy.dead.contains_key(id),
            None => true,
        }
    }

    fn read_handle(&self) -> Option<RawFd> {
        // the shared transport's handle is exposed once, by the proxy
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framed_socket::FramedSocket;
    use crate::messages::{Message, RequestBody, ResponseBody};
    use crate::transport::LoopbackTransport;

    fn proxy_pair() -> (ProxySocket, ProxySocket) {
        let (a, b) = LoopbackTransport::pair();
        (
            ProxySocket::new(FramedSocket::new(Box::new(a))),
            ProxySocket::new(FramedSocket::new(Box::new(b))),
        )
    }

    fn request_frame(id: u64) -> Vec<u8> {
        Message::request(id, RequestBody::Terminate).encode().unwrap()
    }

    #[test]
    fn demultiplexes_by_id_preserving_order() {
        let (mut sender, mut receiver) = proxy_pair();
        assert!(sender.send_proxy_message(Some("a"), &request_frame(0)));
        assert!(sender.send_proxy_message(Some("b"), &request_frame(1)));
        assert!(sender.send_proxy_message(Some("a"), &request_frame(2)));
        assert!(sender.send_proxy_message(None, &request_frame(3)));

        let a_frames = receiver.receive_proxy_messages(Some("a"));
        assert_eq!(a_frames.iter().map(|m| m.id).collect::<Vec<_>>(), vec![0, 2]);

        // the b and control frames stayed parked
        let b_frames = receiver.receive_proxy_messages(Some("b"));
        assert_eq!(b_frames.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1]);
        let control = receiver.receive_proxy_messages(None);
        assert_eq!(control.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn raw_frames_forward_byte_identical() {
        let (mut sender, mut receiver) = proxy_pair();
        let frame = Message::response(9, 4, ResponseBody::Ok(serde_json::json!([1, 2])))
            .encode()
            .unwrap();
        assert!(sender.send_proxy_message(Some("w"), &frame));
        let raw = receiver.receive_raw_proxy_messages(Some("w"));
        assert_eq!(raw, vec![frame]);
    }

    #[test]
    fn watermark_overflow_is_fatal() {
        let (a, b) = LoopbackTransport::pair();
        let mut sender = ProxySocket::new(FramedSocket::new(Box::new(a)));
        let mut receiver = ProxySocket::with_watermark(FramedSocket::new(Box::new(b)), 2);
        for i in 0..4 {
            assert!(sender.send_proxy_message(Some("ghost"), &request_frame(i)));
        }
        let got = receiver.receive_proxy_messages(Some("other"));
        assert!(got.is_empty());
        assert!(!receiver.is_open());
        assert!(receiver.failure().unwrap().contains("watermark"));
    }

    #[test]
    fn proxied_socket_is_transparent() {
        let (parent_side, runtime_side) = proxy_pair();
        let parent = Rc::new(RefCell::new(parent_side));
        let runtime = Rc::new(RefCell::new(runtime_side));

        let mut tunneled = ProxiedSocket::new(parent.clone(), Some("w7".to_string()));
        let frame = request_frame(11);
        assert!(tunneled.send(&frame));

        let arrived = runtime.borrow_mut().receive_raw_proxy_messages(Some("w7"));
        assert_eq!(arrived, vec![frame.clone()]);

        // and back the other way
        assert!(runtime.borrow_mut().send_proxy_message(Some("w7"), &frame));
        assert_eq!(tunneled.receive(), vec![frame]);
    }

    #[test]
    fn dead_id_reports_closed() {
        let (parent_side, _runtime_side) = proxy_pair();
        let parent = Rc::new(RefCell::new(parent_side));
        let tunneled = ProxiedSocket::new(parent.clone(), Some("w1".to_string()));
        assert!(tunneled.is_open());
        parent.borrow_mut().mark_dead("w1", "process exited");
        assert!(!tunneled.is_open());
        assert_eq!(parent.borrow().dead_reason("w1").as_deref(), Some("process exited"));
    }
}
