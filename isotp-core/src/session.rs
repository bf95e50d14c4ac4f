//! Blocking ISO-TP session
//!
//! A [`Session`] hosts one outbound and one inbound transfer over a single
//! [`FrameTransport`]. `send` blocks while waiting for Flow-Control frames and
//! honouring separation time; `receive` blocks until a message is complete or
//! a timeout expires. While a send waits for Flow-Control, inbound frames keep
//! being served and completed messages are queued for the next `receive`.

use crate::cantp::{
    deadline_after, Reassembly, ReassemblyEngine, ReceiveState, SegmentationEngine, SendAction,
    SendState,
};
use crate::config::ProtocolParameters;
use crate::frame::{FrameMode, Pdu};
use crate::transport::FrameTransport;
use crate::types::{IsoTpError, ProtocolError, Result, TimeoutKind};
use std::collections::VecDeque;
use std::thread;
use std::time::Instant;

/// One logical ISO-TP conversation over a frame transport
pub struct Session<T: FrameTransport> {
    transport: T,
    params: ProtocolParameters,
    mode: FrameMode,
    sender: SegmentationEngine,
    receiver: ReassemblyEngine,
    completed: VecDeque<Vec<u8>>,
}

impl<T: FrameTransport> Session<T> {
    pub fn new(transport: T, params: ProtocolParameters) -> Self {
        Self {
            transport,
            params,
            mode: FrameMode::from_fd_flag(params.send_fd_frames()),
            sender: SegmentationEngine::new(params),
            receiver: ReassemblyEngine::new(params),
            completed: VecDeque::new(),
        }
    }

    /// Send a complete message, blocking until the last frame is out
    ///
    /// # Example
    /// ```no_run
    /// use isotp_core::{channel_pair, ProtocolParameters, Session};
    ///
    /// let (local, _peer) = channel_pair();
    /// let mut session = Session::new(local, ProtocolParameters::DEFAULT);
    /// session.send(&[0x22, 0xF1, 0x90]).unwrap();
    /// ```
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        self.sender.start(message.to_vec())?;

        loop {
            let now = Instant::now();
            match self.sender.poll(now)? {
                SendAction::Transmit(frame) => {
                    if let Err(e) = self.transport.send(&frame) {
                        self.sender.abort();
                        return Err(e.into());
                    }
                }
                SendAction::SleepUntil(at) => thread::sleep(at.saturating_duration_since(now)),
                SendAction::AwaitFlowControl(deadline) => self.await_flow_control(deadline)?,
                SendAction::Complete | SendAction::Idle => return Ok(()),
            }
        }
    }

    /// Receive the next complete message
    ///
    /// Waits up to the inbound timeout for a transfer to start and then up
    /// to the inbound timeout between consecutive frames.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        if let Some(message) = self.completed.pop_front() {
            return Ok(message);
        }

        let idle_deadline = deadline_after(Instant::now(), self.params.inbound_timeout());
        loop {
            let deadline = self.receiver.deadline().unwrap_or(idle_deadline);
            let frame = match self.transport.recv(deadline) {
                Ok(frame) => frame,
                Err(e) => {
                    self.receiver.abort();
                    return Err(e.into());
                }
            };

            let now = Instant::now();
            if let Some(frame) = frame {
                match Pdu::decode(&frame) {
                    Ok(Pdu::FlowControl { status, .. }) => {
                        log::debug!("Ignoring flow control ({:?}) while receiving", status);
                    }
                    Ok(pdu) => self.serve_inbound(pdu, now)?,
                    Err(e) => log::warn!("Dropping undecodable frame {:02X?}: {}", frame, e),
                }
            }

            if let Some(message) = self.completed.pop_front() {
                return Ok(message);
            }
            self.receiver.poll_timeout(now)?;
            if self.receiver.is_idle() && now >= idle_deadline {
                return Err(ProtocolError::Timeout(TimeoutKind::NoMessage).into());
            }
        }
    }

    /// Abandon both directions and drop queued messages
    pub fn abort(&mut self) {
        self.sender.abort();
        self.receiver.abort();
        self.completed.clear();
    }

    pub fn parameters(&self) -> &ProtocolParameters {
        &self.params
    }

    pub fn send_state(&self) -> SendState {
        self.sender.state()
    }

    pub fn receive_state(&self) -> ReceiveState {
        self.receiver.state()
    }

    /// True when neither direction has a transfer in progress
    pub fn is_idle(&self) -> bool {
        self.sender.is_idle() && self.receiver.is_idle()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Wait for one frame while the sender expects Flow-Control
    fn await_flow_control(&mut self, deadline: Instant) -> Result<()> {
        let frame = match self.transport.recv(deadline) {
            Ok(Some(frame)) => frame,
            // The next poll reports the timeout once the deadline has passed
            Ok(None) => return Ok(()),
            Err(e) => {
                self.sender.abort();
                return Err(e.into());
            }
        };

        let now = Instant::now();
        match Pdu::decode(&frame) {
            Ok(Pdu::FlowControl {
                status,
                block_size,
                separation_time,
            }) => self
                .sender
                .on_flow_control(status, block_size, separation_time, now),
            Ok(pdu) => {
                if let Err(e) = self.serve_inbound(pdu, now) {
                    log::warn!("Inbound transfer failed while sending: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                log::warn!("Dropping undecodable frame {:02X?}: {}", frame, e);
                Ok(())
            }
        }
    }

    /// Feed a non-Flow-Control PDU to the receiver and act on the outcome
    fn serve_inbound(&mut self, pdu: Pdu, now: Instant) -> Result<()> {
        log::trace!("Inbound {}", pdu.kind());
        match self.receiver.on_pdu(pdu, now)? {
            Reassembly::Ignored | Reassembly::InProgress => Ok(()),
            Reassembly::SendFlowControl(reply) => self.transmit_reply(reply),
            Reassembly::Complete => {
                if let Some(message) = self.receiver.take_message() {
                    self.completed.push_back(message);
                }
                Ok(())
            }
            Reassembly::Refused { reply, error } => {
                self.transmit_reply(reply)?;
                Err(IsoTpError::Protocol(error))
            }
        }
    }

    fn transmit_reply(&mut self, reply: Pdu) -> Result<()> {
        let frame = reply.encode(self.mode, self.params.frame_padding())?;
        if let Err(e) = self.transport.send(&frame) {
            self.receiver.abort();
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FlowStatus;
    use std::io;
    use std::time::Duration;

    /// Replays canned inbound frames and records everything sent
    #[derive(Default)]
    struct ScriptedTransport {
        inbound: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn with_inbound(frames: &[&[u8]]) -> Self {
            Self {
                inbound: frames.iter().map(|f| f.to_vec()).collect(),
                sent: Vec::new(),
            }
        }
    }

    impl FrameTransport for ScriptedTransport {
        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn recv(&mut self, deadline: Instant) -> io::Result<Option<Vec<u8>>> {
            if let Some(frame) = self.inbound.pop_front() {
                return Ok(Some(frame));
            }
            thread::sleep(deadline.saturating_duration_since(Instant::now()));
            Ok(None)
        }
    }

    fn fast_params() -> ProtocolParameters {
        ProtocolParameters::DEFAULT
            .with_outbound_timeout(Duration::from_millis(20))
            .with_inbound_timeout(Duration::from_millis(20))
    }

    #[test]
    fn test_send_single_frame() {
        let mut session = Session::new(ScriptedTransport::default(), fast_params());
        session.send(&[1, 2, 3]).unwrap();

        assert_eq!(session.transport().sent, vec![vec![0x03, 1, 2, 3]]);
        assert!(session.is_idle());
    }

    #[test]
    fn test_send_segmented_message() {
        let transport = ScriptedTransport::with_inbound(&[&[0x30, 0x00, 0x00]]);
        let mut session = Session::new(transport, fast_params());
        let message: Vec<u8> = (0..20).collect();
        session.send(&message).unwrap();

        let sent = &session.transport().sent;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], vec![0x10, 20, 0, 1, 2, 3, 4, 5]);
        assert_eq!(sent[1], vec![0x21, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(sent[2], vec![0x22, 13, 14, 15, 16, 17, 18, 19]);
    }

    #[test]
    fn test_send_times_out_without_flow_control() {
        let mut session = Session::new(ScriptedTransport::default(), fast_params());
        let err = session.send(&[0; 20]).unwrap_err();

        assert_eq!(
            err.as_protocol(),
            Some(&ProtocolError::Timeout(TimeoutKind::FlowControl))
        );
        assert_eq!(session.send_state(), SendState::Idle);
        assert_eq!(session.transport().sent.len(), 1);
    }

    #[test]
    fn test_send_overflow() {
        let transport = ScriptedTransport::with_inbound(&[&[0x32, 0x00, 0x00]]);
        let mut session = Session::new(transport, fast_params());
        let err = session.send(&[0; 20]).unwrap_err();

        assert_eq!(err.as_protocol(), Some(&ProtocolError::Overflow));
        assert!(session.is_idle());
    }

    #[test]
    fn test_send_with_unbounded_outbound_timeout() {
        let transport = ScriptedTransport::with_inbound(&[&[0x30, 0x00, 0x00]]);
        let params = ProtocolParameters::DEFAULT.with_outbound_timeout(Duration::MAX);
        let mut session = Session::new(transport, params);
        session.send(&[0; 20]).unwrap();

        assert_eq!(session.transport().sent.len(), 3);
        assert!(session.is_idle());
    }

    #[test]
    fn test_receive_with_unbounded_inbound_timeout() {
        let transport = ScriptedTransport::with_inbound(&[
            &[0x10, 10, 1, 2, 3, 4, 5, 6],
            &[0x21, 7, 8, 9, 10],
        ]);
        let params = ProtocolParameters::DEFAULT.with_inbound_timeout(Duration::MAX);
        let mut session = Session::new(transport, params);

        assert_eq!(session.receive().unwrap(), (1..=10).collect::<Vec<u8>>());
        assert_eq!(session.transport().sent, vec![vec![0x30, 0x00, 0x00]]);
    }

    #[test]
    fn test_receive_segmented_message() {
        let transport = ScriptedTransport::with_inbound(&[
            &[0x10, 20, 0, 1, 2, 3, 4, 5],
            &[0x21, 6, 7, 8, 9, 10, 11, 12],
            &[0x22, 13, 14, 15, 16, 17, 18, 19],
        ]);
        let mut session = Session::new(transport, fast_params());

        let message = session.receive().unwrap();
        assert_eq!(message, (0..20).collect::<Vec<u8>>());
        assert_eq!(session.transport().sent, vec![vec![0x30, 0x00, 0x00]]);
        assert!(session.is_idle());
    }

    #[test]
    fn test_receive_sequence_mismatch() {
        let transport = ScriptedTransport::with_inbound(&[
            &[0x10, 20, 0, 1, 2, 3, 4, 5],
            &[0x22, 6, 7, 8, 9, 10, 11, 12],
        ]);
        let mut session = Session::new(transport, fast_params());

        let err = session.receive().unwrap_err();
        assert_eq!(
            err.as_protocol(),
            Some(&ProtocolError::SequenceMismatch { expected: 1, actual: 2 })
        );
        assert_eq!(session.receive_state(), ReceiveState::Idle);
    }

    #[test]
    fn test_receive_times_out() {
        let transport = ScriptedTransport::with_inbound(&[&[0x10, 20, 0, 1, 2, 3, 4, 5]]);
        let mut session = Session::new(transport, fast_params());

        let err = session.receive().unwrap_err();
        assert_eq!(
            err.as_protocol(),
            Some(&ProtocolError::Timeout(TimeoutKind::ConsecutiveFrame))
        );
        assert!(session.is_idle());

        let err = session.receive().unwrap_err();
        assert_eq!(err.as_protocol(), Some(&ProtocolError::Timeout(TimeoutKind::NoMessage)));
    }

    #[test]
    fn test_receive_skips_undecodable_frames() {
        let transport = ScriptedTransport::with_inbound(&[&[], &[0xF0, 1], &[0x02, 0xAA, 0xBB]]);
        let mut session = Session::new(transport, fast_params());
        assert_eq!(session.receive().unwrap(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_inbound_message_served_while_sending() {
        let transport = ScriptedTransport::with_inbound(&[
            &[0x02, 0xAA, 0xBB],
            &[0x30, 0x00, 0x00],
        ]);
        let mut session = Session::new(transport, fast_params());
        session.send(&[0; 10]).unwrap();

        assert_eq!(session.receive().unwrap(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_oversized_inbound_message_is_refused() {
        let params = fast_params().with_max_message_length(10);
        let transport = ScriptedTransport::with_inbound(&[&[0x10, 20, 0, 1, 2, 3, 4, 5]]);
        let mut session = Session::new(transport, params);

        let err = session.receive().unwrap_err();
        assert_eq!(
            err.as_protocol(),
            Some(&ProtocolError::MessageTooLarge { declared: 20, limit: 10 })
        );
        let overflow = Pdu::FlowControl {
            status: FlowStatus::Overflow,
            block_size: 0,
            separation_time: 0,
        };
        assert_eq!(
            session.transport().sent,
            vec![overflow.encode(FrameMode::Classic, None).unwrap()]
        );
    }

    #[test]
    fn test_padding_applies_to_flow_control() {
        let params = fast_params().with_frame_padding(Some(0xCC));
        let transport = ScriptedTransport::with_inbound(&[
            &[0x10, 8, 1, 2, 3, 4, 5, 6],
            &[0x21, 7, 8, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC],
        ]);
        let mut session = Session::new(transport, params);

        assert_eq!(session.receive().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            session.transport().sent,
            vec![vec![0x30, 0, 0, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]]
        );
    }
}
