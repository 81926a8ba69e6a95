// SPDX-License-Identifier: MIT OR Apache-2.0
//! Byte-level transports underneath the framed socket.
//!
//! A [`Transport`] is a non-blocking bidirectional byte stream. The framed
//! layer on top owns all buffering, so implementations stay thin: report what
//! the OS (or the in-memory queue) will take right now and never block.
//!
//! Two implementations are provided. [`TcpTransport`] carries real child
//! processes over a loopback connection. [`LoopbackTransport`] is a paired
//! in-process queue used by synchronous workers and tests; it has no OS
//! handle, so endpoints built on it report no selectable read handle.

use crate::sys::RawFd;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;

/// Outcome of a single non-blocking read attempt.
pub enum ReadNonblock {
    /// `n` bytes were read into the buffer.
    Bytes(usize),
    /// No data is available right now.
    WouldBlock,
    /// The peer has closed its end; no further data will arrive.
    Eof,
}

/// A non-blocking byte stream.
pub trait Transport {
    /// Writes as much of `data` as the stream will currently take and returns
    /// the number of bytes accepted. `Ok(0)` means the write would block.
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize>;

    /// Reads as many bytes as are currently available without blocking.
    fn read_nonblock(&mut self, buf: &mut [u8]) -> std::io::Result<ReadNonblock>;

    /// Shuts down the stream. Idempotent.
    fn close(&mut self);

    /// The OS handle to wait on for readability, when the stream has one.
    fn read_handle(&self) -> Option<RawFd>;
}

/// A [`Transport`] over a `TcpStream` placed in non-blocking mode.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        loop {
            match self.stream.write(data) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn read_nonblock(&mut self, buf: &mut [u8]) -> std::io::Result<ReadNonblock> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Ok(ReadNonblock::Eof),
                Ok(n) => return Ok(ReadNonblock::Bytes(n)),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(ReadNonblock::WouldBlock);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    #[cfg(unix)]
    fn read_handle(&self) -> Option<RawFd> {
        use std::os::fd::AsRawFd;
        Some(self.stream.as_raw_fd())
    }

    #[cfg(not(unix))]
    fn read_handle(&self) -> Option<RawFd> {
        None
    }
}

struct LoopbackShared {
    // byte queues, one per direction
    a_to_b: VecDeque<u8>,
    b_to_a: VecDeque<u8>,
    a_open: bool,
    b_open: bool,
}

/// One end of an in-process transport pair.
pub struct LoopbackTransport {
    shared: Rc<RefCell<LoopbackShared>>,
    is_a: bool,
}

impl LoopbackTransport {
    /// Creates a connected pair of ends.
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let shared = Rc::new(RefCell::new(LoopbackShared {
            a_to_b: VecDeque::new(),
            b_to_a: VecDeque::new(),
            a_open: true,
            b_open: true,
        }));
        (
            LoopbackTransport { shared: shared.clone(), is_a: true },
            LoopbackTransport { shared, is_a: false },
        )
    }
}

impl Transport for LoopbackTransport {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut shared = self.shared.borrow_mut();
        let (self_open, peer_open) = if self.is_a {
            (shared.a_open, shared.b_open)
        } else {
            (shared.b_open, shared.a_open)
        };
        if !self_open || !peer_open {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "loopback peer closed",
            ));
        }
        let queue = if self.is_a { &mut shared.a_to_b } else { &mut shared.b_to_a };
        queue.extend(data.iter().copied());
        Ok(data.len())
    }

    fn read_nonblock(&mut self, buf: &mut [u8]) -> std::io::Result<ReadNonblock> {
        let mut shared = self.shared.borrow_mut();
        let (self_open, peer_open) = if self.is_a {
            (shared.a_open, shared.b_open)
        } else {
            (shared.b_open, shared.a_open)
        };
        if !self_open {
            return Ok(ReadNonblock::Eof);
        }
        let queue = if self.is_a { &mut shared.b_to_a } else { &mut shared.a_to_b };
        if queue.is_empty() {
            // queued bytes drain before the close is observed
            if !peer_open {
                return Ok(ReadNonblock::Eof);
            }
            return Ok(ReadNonblock::WouldBlock);
        }
        let mut n = 0;
        while n < buf.len() {
            match queue.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(ReadNonblock::Bytes(n))
    }

    fn close(&mut self) {
        let mut shared = self.shared.borrow_mut();
        if self.is_a {
            shared.a_open = false;
        } else {
            shared.b_open = false;
        }
    }

    fn read_handle(&self) -> Option<RawFd> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_round_trip() {
        let (mut a, mut b) = LoopbackTransport::pair();
        assert_eq!(a.write(b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        match b.read_nonblock(&mut buf).unwrap() {
            ReadNonblock::Bytes(n) => assert_eq!(&buf[..n], b"hello"),
            _ => panic!("expected bytes"),
        }
        assert!(matches!(b.read_nonblock(&mut buf).unwrap(), ReadNonblock::WouldBlock));
    }

    #[test]
    fn loopback_close_is_eof_after_drain() {
        let (mut a, mut b) = LoopbackTransport::pair();
        a.write(b"xy").unwrap();
        a.close();
        let mut buf = [0u8; 16];
        match b.read_nonblock(&mut buf).unwrap() {
            ReadNonblock::Bytes(n) => assert_eq!(&buf[..n], b"xy"),
            _ => panic!("expected buffered bytes before eof"),
        }
        assert!(matches!(b.read_nonblock(&mut buf).unwrap(), ReadNonblock::Eof));
        assert!(b.write(b"z").is_err());
    }
}
