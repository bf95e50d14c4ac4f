//! Link-frame transport boundary
//!
//! The core does not open sockets. A [`Session`](crate::Session) drives any
//! type implementing [`FrameTransport`]: one raw frame out, the next raw frame
//! in before a deadline. CAN identifiers, filters and the socket mode belong
//! to the implementation.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Instant;

/// Capability to exchange single link frames with the peer
pub trait FrameTransport {
    /// Transmit one frame payload
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Receive the next frame payload
    ///
    /// Returns `Ok(None)` when nothing arrived before `deadline`. Returning
    /// early is allowed; callers check the clock themselves.
    fn recv(&mut self, deadline: Instant) -> io::Result<Option<Vec<u8>>>;
}

impl<T: FrameTransport + ?Sized> FrameTransport for &mut T {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        (**self).send(frame)
    }

    fn recv(&mut self, deadline: Instant) -> io::Result<Option<Vec<u8>>> {
        (**self).recv(deadline)
    }
}

impl<T: FrameTransport + ?Sized> FrameTransport for Box<T> {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        (**self).send(frame)
    }

    fn recv(&mut self, deadline: Instant) -> io::Result<Option<Vec<u8>>> {
        (**self).recv(deadline)
    }
}

/// In-process transport: one end of a bidirectional channel link
///
/// Useful for loopback setups where both peers live in the same process,
/// typically on two threads.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// Create two connected [`ChannelTransport`] ends
pub fn channel_pair() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    (
        ChannelTransport { tx: a_tx, rx: a_rx },
        ChannelTransport { tx: b_tx, rx: b_rx },
    )
}

impl FrameTransport for ChannelTransport {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer transport closed"))
    }

    fn recv(&mut self, deadline: Instant) -> io::Result<Option<Vec<u8>>> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer transport closed",
            )),
        }
    }
}
