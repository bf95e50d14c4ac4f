//! Outbound message segmentation
//!
//! The engine never touches a transport or a clock. The host calls
//! [`SegmentationEngine::poll`] with the current time and performs the
//! returned [`SendAction`], feeding Flow-Control frames back through
//! [`SegmentationEngine::on_flow_control`].

use super::deadline_after;
use super::flow_control::{FlowControlController, FlowDecision};
use crate::config::ProtocolParameters;
use crate::frame::{FlowStatus, FrameMode, Pdu};
use crate::types::{CodecError, ProtocolError, Result, TimeoutKind};
use std::time::{Duration, Instant};

/// Externally visible state of the outbound direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Sending,
    AwaitingFlowControl,
    Finished,
}

/// Next step the host has to take for the outbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendAction {
    /// Put this frame on the link, then poll again
    Transmit(Vec<u8>),
    /// Separation time: poll again no earlier than this instant
    SleepUntil(Instant),
    /// Deliver a Flow-Control frame before this deadline, or poll after it
    AwaitFlowControl(Instant),
    /// The message has been sent completely
    Complete,
    /// No transfer in progress
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Pending,
    AwaitingFlowControl { deadline: Instant },
    Sending,
    Finished,
}

/// Splits one outbound message into ISO-TP frames
#[derive(Debug)]
pub struct SegmentationEngine {
    params: ProtocolParameters,
    mode: FrameMode,
    flow: FlowControlController,
    stage: Stage,
    message: Vec<u8>,
    offset: usize,
    sequence_number: u8,
    block_remaining: Option<u8>,
    separation_time: Duration,
    next_frame_at: Option<Instant>,
}

impl SegmentationEngine {
    pub fn new(params: ProtocolParameters) -> Self {
        Self {
            params,
            mode: FrameMode::from_fd_flag(params.send_fd_frames()),
            flow: FlowControlController::new(params),
            stage: Stage::Idle,
            message: Vec::new(),
            offset: 0,
            sequence_number: 0,
            block_remaining: None,
            separation_time: Duration::ZERO,
            next_frame_at: None,
        }
    }

    pub fn state(&self) -> SendState {
        match self.stage {
            Stage::Idle => SendState::Idle,
            Stage::Pending | Stage::Sending => SendState::Sending,
            Stage::AwaitingFlowControl { .. } => SendState::AwaitingFlowControl,
            Stage::Finished => SendState::Finished,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Idle
    }

    /// Take ownership of a message to send
    ///
    /// Nothing is transmitted until the next [`poll`](Self::poll).
    pub fn start(&mut self, message: Vec<u8>) -> Result<()> {
        if !self.is_idle() {
            return Err(ProtocolError::Busy.into());
        }
        if u32::try_from(message.len()).is_err() {
            return Err(CodecError::PayloadTooLarge {
                len: message.len(),
                capacity: u32::MAX as usize,
            }
            .into());
        }

        log::debug!("Starting outbound transfer of {} bytes", message.len());
        self.message = message;
        self.stage = Stage::Pending;
        Ok(())
    }

    /// Advance the transfer at time `now`
    pub fn poll(&mut self, now: Instant) -> Result<SendAction> {
        match self.stage {
            Stage::Idle => Ok(SendAction::Idle),
            Stage::Pending => self.transmit_first(now),
            Stage::AwaitingFlowControl { deadline } => {
                if now >= deadline {
                    log::warn!(
                        "No flow control within {:?}, aborting transfer",
                        self.params.outbound_timeout()
                    );
                    self.reset();
                    return Err(ProtocolError::Timeout(TimeoutKind::FlowControl).into());
                }
                Ok(SendAction::AwaitFlowControl(deadline))
            }
            Stage::Sending => match self.next_frame_at {
                Some(at) if now < at => Ok(SendAction::SleepUntil(at)),
                _ => self.transmit_consecutive(now),
            },
            Stage::Finished => {
                log::debug!("Outbound transfer of {} bytes complete", self.offset);
                self.reset();
                Ok(SendAction::Complete)
            }
        }
    }

    /// Feed a Flow-Control frame received from the peer
    ///
    /// Frames arriving while no Flow-Control is awaited are ignored.
    pub fn on_flow_control(
        &mut self,
        status: FlowStatus,
        block_size: u8,
        separation_time: u8,
        now: Instant,
    ) -> Result<()> {
        if !matches!(self.stage, Stage::AwaitingFlowControl { .. }) {
            log::debug!("Ignoring unexpected flow control ({:?})", status);
            return Ok(());
        }

        match self.flow.on_flow_control(status, block_size, separation_time) {
            Ok(FlowDecision::Continue {
                block_size,
                separation_time,
            }) => {
                self.block_remaining = if block_size == 0 { None } else { Some(block_size) };
                self.separation_time = separation_time;
                self.next_frame_at = None;
                self.stage = Stage::Sending;
                Ok(())
            }
            Ok(FlowDecision::Wait) => {
                self.stage = Stage::AwaitingFlowControl {
                    deadline: deadline_after(now, self.params.outbound_timeout()),
                };
                Ok(())
            }
            Err(e) => {
                self.reset();
                Err(e.into())
            }
        }
    }

    /// Drop the current message and return to idle
    pub fn abort(&mut self) {
        if !self.is_idle() {
            log::warn!(
                "Aborting outbound transfer at byte {} of {}",
                self.offset,
                self.message.len()
            );
        }
        self.reset();
    }

    fn transmit_first(&mut self, now: Instant) -> Result<SendAction> {
        let total = self.message.len();
        if total <= self.mode.single_frame_capacity() {
            let data = std::mem::take(&mut self.message);
            let frame = self.encode(Pdu::Single { data })?;
            log::trace!("Sending single frame of {} bytes", total);
            self.offset = total;
            self.stage = Stage::Finished;
            return Ok(SendAction::Transmit(frame));
        }

        let total_length = total as u32;
        let chunk = self.mode.first_frame_capacity(total_length).min(total);
        let data = self.message[..chunk].to_vec();
        let frame = self.encode(Pdu::First { total_length, data })?;
        log::trace!("Sending first frame, {} of {} bytes", chunk, total);

        self.offset = chunk;
        self.sequence_number = 1;
        self.stage = Stage::AwaitingFlowControl {
            deadline: deadline_after(now, self.params.outbound_timeout()),
        };
        Ok(SendAction::Transmit(frame))
    }

    fn transmit_consecutive(&mut self, now: Instant) -> Result<SendAction> {
        let end = (self.offset + self.mode.consecutive_frame_capacity()).min(self.message.len());
        let data = self.message[self.offset..end].to_vec();
        let frame = self.encode(Pdu::Consecutive {
            sequence_number: self.sequence_number,
            data,
        })?;
        log::trace!(
            "Sending consecutive frame {}, bytes {}..{}",
            self.sequence_number,
            self.offset,
            end
        );

        self.offset = end;
        self.sequence_number = (self.sequence_number + 1) & 0x0F;

        if self.offset == self.message.len() {
            self.stage = Stage::Finished;
            return Ok(SendAction::Transmit(frame));
        }

        self.next_frame_at = Some(deadline_after(now, self.separation_time));
        if let Some(remaining) = self.block_remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.stage = Stage::AwaitingFlowControl {
                    deadline: deadline_after(now, self.params.outbound_timeout()),
                };
            }
        }
        Ok(SendAction::Transmit(frame))
    }

    fn encode(&mut self, pdu: Pdu) -> Result<Vec<u8>> {
        pdu.encode(self.mode, self.params.frame_padding()).map_err(|e| {
            self.reset();
            e.into()
        })
    }

    fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.message = Vec::new();
        self.offset = 0;
        self.sequence_number = 0;
        self.block_remaining = None;
        self.separation_time = Duration::ZERO;
        self.next_frame_at = None;
        self.flow.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IsoTpError;

    fn transmit(engine: &mut SegmentationEngine, now: Instant) -> Pdu {
        match engine.poll(now).unwrap() {
            SendAction::Transmit(frame) => Pdu::decode(&frame).unwrap(),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_single_frame_needs_no_flow_control() {
        let now = Instant::now();
        let mut engine = SegmentationEngine::new(ProtocolParameters::DEFAULT);
        engine.start(vec![1, 2, 3]).unwrap();

        assert_eq!(transmit(&mut engine, now), Pdu::Single { data: vec![1, 2, 3] });
        assert_eq!(engine.state(), SendState::Finished);
        assert_eq!(engine.poll(now).unwrap(), SendAction::Complete);
        assert!(engine.is_idle());
        assert_eq!(engine.poll(now).unwrap(), SendAction::Idle);
    }

    #[test]
    fn test_segmented_message() {
        let now = Instant::now();
        let data = message(27);
        let mut engine = SegmentationEngine::new(ProtocolParameters::DEFAULT);
        engine.start(data.clone()).unwrap();

        assert_eq!(
            transmit(&mut engine, now),
            Pdu::First {
                total_length: 27,
                data: data[..6].to_vec(),
            }
        );
        let deadline = now + Duration::from_secs(1);
        assert_eq!(engine.poll(now).unwrap(), SendAction::AwaitFlowControl(deadline));

        engine
            .on_flow_control(FlowStatus::ContinueToSend, 0, 0, now)
            .unwrap();

        let mut rebuilt = data[..6].to_vec();
        for expected_sn in 1..=3u8 {
            match transmit(&mut engine, now) {
                Pdu::Consecutive { sequence_number, data } => {
                    assert_eq!(sequence_number, expected_sn);
                    rebuilt.extend(data);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(rebuilt, data);
        assert_eq!(engine.poll(now).unwrap(), SendAction::Complete);
    }

    #[test]
    fn test_flow_control_timeout() {
        let now = Instant::now();
        let params = ProtocolParameters::DEFAULT.with_outbound_timeout(Duration::from_millis(100));
        let mut engine = SegmentationEngine::new(params);
        engine.start(message(20)).unwrap();
        transmit(&mut engine, now);

        assert!(matches!(
            engine.poll(now + Duration::from_millis(99)).unwrap(),
            SendAction::AwaitFlowControl(_)
        ));
        let err = engine.poll(now + Duration::from_millis(100)).unwrap_err();
        assert!(matches!(
            err,
            IsoTpError::Protocol(ProtocolError::Timeout(TimeoutKind::FlowControl))
        ));
        assert!(engine.is_idle());
    }

    #[test]
    fn test_block_size_and_separation_time() {
        let now = Instant::now();
        let mut engine = SegmentationEngine::new(ProtocolParameters::DEFAULT);
        engine.start(message(40)).unwrap();
        transmit(&mut engine, now);

        // Two frames per block, 5 ms apart
        engine
            .on_flow_control(FlowStatus::ContinueToSend, 2, 5, now)
            .unwrap();
        transmit(&mut engine, now);

        let later = now + Duration::from_millis(5);
        assert_eq!(engine.poll(now).unwrap(), SendAction::SleepUntil(later));
        transmit(&mut engine, later);

        assert_eq!(engine.state(), SendState::AwaitingFlowControl);
        assert!(matches!(engine.poll(later).unwrap(), SendAction::AwaitFlowControl(_)));

        engine
            .on_flow_control(FlowStatus::ContinueToSend, 0, 0, later)
            .unwrap();
        match transmit(&mut engine, later) {
            Pdu::Consecutive { sequence_number, .. } => assert_eq!(sequence_number, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wait_extends_deadline() {
        let now = Instant::now();
        let params = ProtocolParameters::DEFAULT.with_outbound_timeout(Duration::from_millis(100));
        let mut engine = SegmentationEngine::new(params);
        engine.start(message(20)).unwrap();
        transmit(&mut engine, now);

        let wait_at = now + Duration::from_millis(80);
        engine.on_flow_control(FlowStatus::Wait, 0, 0, wait_at).unwrap();
        assert_eq!(
            engine.poll(now + Duration::from_millis(150)).unwrap(),
            SendAction::AwaitFlowControl(wait_at + Duration::from_millis(100))
        );
    }

    #[test]
    fn test_overflow_aborts() {
        let now = Instant::now();
        let mut engine = SegmentationEngine::new(ProtocolParameters::DEFAULT);
        engine.start(message(20)).unwrap();
        transmit(&mut engine, now);

        let err = engine
            .on_flow_control(FlowStatus::Overflow, 0, 0, now)
            .unwrap_err();
        assert!(matches!(err, IsoTpError::Protocol(ProtocolError::Overflow)));
        assert!(engine.is_idle());
    }

    #[test]
    fn test_sequence_numbers_wrap() {
        let now = Instant::now();
        let mut engine = SegmentationEngine::new(ProtocolParameters::DEFAULT);
        engine.start(message(6 + 7 * 17)).unwrap();
        transmit(&mut engine, now);
        engine
            .on_flow_control(FlowStatus::ContinueToSend, 0, 0, now)
            .unwrap();

        let mut numbers = Vec::new();
        while let SendAction::Transmit(frame) = engine.poll(now).unwrap() {
            if let Pdu::Consecutive { sequence_number, .. } = Pdu::decode(&frame).unwrap() {
                numbers.push(sequence_number);
            }
        }
        assert_eq!(numbers.len(), 17);
        assert_eq!(&numbers[14..], &[15, 0, 1]);
    }

    #[test]
    fn test_busy_and_abort() {
        let now = Instant::now();
        let mut engine = SegmentationEngine::new(ProtocolParameters::DEFAULT);
        engine.start(message(20)).unwrap();
        transmit(&mut engine, now);

        let err = engine.start(vec![1]).unwrap_err();
        assert!(matches!(err, IsoTpError::Protocol(ProtocolError::Busy)));

        engine.abort();
        assert!(engine.is_idle());
        engine.start(vec![1]).unwrap();
    }

    #[test]
    fn test_unexpected_flow_control_is_ignored() {
        let now = Instant::now();
        let mut engine = SegmentationEngine::new(ProtocolParameters::DEFAULT);
        engine
            .on_flow_control(FlowStatus::Overflow, 0, 0, now)
            .unwrap();
        assert!(engine.is_idle());
    }

    #[test]
    fn test_fd_single_frame() {
        let now = Instant::now();
        let params = ProtocolParameters::DEFAULT.with_sending_fd_frames(true);
        let mut engine = SegmentationEngine::new(params);
        engine.start(message(62)).unwrap();
        assert_eq!(transmit(&mut engine, now), Pdu::Single { data: message(62) });
    }
}
