// SPDX-License-Identifier: MIT OR Apache-2.0
//! Length-prefixed message framing over a non-blocking transport.
//!
//! Each frame on the wire is a 4-byte unsigned big-endian length followed by
//! that many payload bytes. Partial reads and writes are buffered internally,
//! so callers only ever see whole frames and never block.

use crate::sys::RawFd;
use crate::transport::{ReadNonblock, Transport};

/// Upper bound on a single frame's payload. A length prefix beyond this is
/// treated as a corrupt stream and closes the socket.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const READ_CHUNK: usize = 4096;

/// A frame-granular socket interface.
///
/// Implemented by [`FramedSocket`] directly and by
/// [`ProxiedSocket`](crate::proxy_socket::ProxiedSocket), which tunnels
/// frames through a shared multiplexed transport. Higher layers cannot tell
/// the two apart.
pub trait MessageSocket {
    /// Queues one frame for delivery. Returns false once the socket is
    /// closed; a true return means the frame is buffered or on the wire.
    fn send(&mut self, payload: &[u8]) -> bool;

    /// Drains every whole frame currently available without blocking.
    /// Incomplete trailing bytes stay buffered for the next call. Returns an
    /// empty vec once the peer has closed.
    fn receive(&mut self) -> Vec<Vec<u8>>;

    /// Closes the socket. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// OS readiness handle, for sockets whose transport has one.
    fn read_handle(&self) -> Option<RawFd>;
}

/// Accumulates bytes until whole length-prefixed frames can be extracted.
pub struct ReadState {
    buf: Vec<u8>,
}

impl ReadState {
    pub fn new() -> Self {
        ReadState { buf: Vec::new() }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extracts the next whole frame, or `None` when more data is needed.
    ///
    /// A length prefix above [`MAX_FRAME_LEN`] is unrecoverable and reported
    /// as an error so the caller can tear the stream down.
    pub fn pop_msg(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len_bytes: &[u8; 4] = self.buf[0..4].try_into().unwrap();
        let len = u32::from_be_bytes(*len_bytes);
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversize { len });
        }
        let len = len as usize;
        if self.buf.len() - 4 < len {
            return Ok(None);
        }
        self.buf.drain(0..4);
        let msg = self.buf.drain(0..len);
        Ok(Some(msg.collect()))
    }
}

impl Default for ReadState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {len} exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversize { len: u32 },
}

/// A framed, non-blocking, internally buffered message socket.
pub struct FramedSocket {
    transport: Box<dyn Transport>,
    read_state: ReadState,
    write_buf: Vec<u8>,
    open: bool,
}

impl FramedSocket {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        FramedSocket {
            transport,
            read_state: ReadState::new(),
            write_buf: Vec::new(),
            open: true,
        }
    }

    /// Pushes buffered outgoing bytes into the transport as far as it will
    /// accept them right now.
    fn flush_writes(&mut self) {
        while !self.write_buf.is_empty() {
            match self.transport.write(&self.write_buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.write_buf.drain(0..n);
                }
                Err(_) => {
                    self.open = false;
                    self.write_buf.clear();
                    break;
                }
            }
        }
    }
}

impl MessageSocket for FramedSocket {
    fn send(&mut self, payload: &[u8]) -> bool {
        if !self.open {
            return false;
        }
        let len = payload.len() as u32;
        self.write_buf.extend_from_slice(&len.to_be_bytes());
        self.write_buf.extend_from_slice(payload);
        self.flush_writes();
        self.open
    }

    fn receive(&mut self) -> Vec<Vec<u8>> {
        if !self.open {
            return Vec::new();
        }
        self.flush_writes();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.transport.read_nonblock(&mut buf) {
                Ok(ReadNonblock::Bytes(n)) => {
                    self.read_state.add_bytes(&buf[..n]);
                    if n < READ_CHUNK {
                        break;
                    }
                }
                Ok(ReadNonblock::WouldBlock) => break,
                Ok(ReadNonblock::Eof) | Err(_) => {
                    self.open = false;
                    break;
                }
            }
        }
        let mut frames = Vec::new();
        loop {
            match self.read_state.pop_msg() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    logwise::error_sync!(
                        "framed socket closing on corrupt stream: {error}",
                        error = e.to_string()
                    );
                    self.close();
                    break;
                }
            }
        }
        frames
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
        }
        self.transport.close();
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_handle(&self) -> Option<RawFd> {
        if self.open {
            self.transport.read_handle()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn pair() -> (FramedSocket, FramedSocket) {
        let (a, b) = LoopbackTransport::pair();
        (FramedSocket::new(Box::new(a)), FramedSocket::new(Box::new(b)))
    }

    #[test]
    fn frame_round_trip() {
        let (mut a, mut b) = pair();
        assert!(a.send(b"one"));
        assert!(a.send(b"two"));
        let frames = b.receive();
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(b.receive().is_empty());
    }

    #[test]
    fn partial_frames_stay_buffered() {
        let mut state = ReadState::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&5u32.to_be_bytes());
        wire.extend_from_slice(b"hello");

        state.add_bytes(&wire[..3]);
        assert!(state.pop_msg().unwrap().is_none());
        state.add_bytes(&wire[3..6]);
        assert!(state.pop_msg().unwrap().is_none());
        state.add_bytes(&wire[6..]);
        assert_eq!(state.pop_msg().unwrap().unwrap(), b"hello".to_vec());
        assert!(state.pop_msg().unwrap().is_none());
    }

    #[test]
    fn empty_frame_round_trips() {
        let (mut a, mut b) = pair();
        assert!(a.send(b""));
        assert_eq!(b.receive(), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn oversize_length_is_fatal() {
        let mut state = ReadState::new();
        state.add_bytes(&u32::MAX.to_be_bytes());
        assert!(state.pop_msg().is_err());
    }

    #[test]
    fn receive_after_peer_close_is_silent() {
        let (mut a, mut b) = pair();
        assert!(a.send(b"last"));
        a.close();
        // frames sent before the close still drain
        assert_eq!(b.receive(), vec![b"last".to_vec()]);
        assert!(b.receive().is_empty());
        assert!(!b.is_open());
        assert!(!b.send(b"ignored"));
    }
}
