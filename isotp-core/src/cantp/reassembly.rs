//! Inbound message reassembly
//!
//! State machine fed with decoded PDUs:
//!
//! ```text
//! Idle --FirstFrame--> AwaitingConsecutive --last CF--> Complete
//!  |                                                       ^
//!  +---------------------SingleFrame-----------------------+
//! ```
//!
//! Any protocol error, abort or timeout returns the engine to `Idle` and
//! releases the buffer. A completed message stays in the engine until the
//! host calls [`ReassemblyEngine::take_message`].

use super::deadline_after;
use super::flow_control::FlowControlController;
use crate::config::ProtocolParameters;
use crate::frame::Pdu;
use crate::types::{ProtocolError, TimeoutKind};
use std::time::Instant;

/// Up-front reservation for a new message; larger ones grow as frames arrive
const INITIAL_BUFFER_CAPACITY: usize = 4096;

/// State of the inbound direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Idle,
    AwaitingConsecutive,
    Complete,
}

/// Outcome of feeding one PDU to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// The PDU does not belong to an inbound transfer
    Ignored,
    /// Accepted, more frames expected
    InProgress,
    /// Accepted; send this Flow-Control frame to the peer
    SendFlowControl(Pdu),
    /// The message is complete and ready for [`ReassemblyEngine::take_message`]
    Complete,
    /// The transfer was refused; send `reply` to the peer and report `error`
    Refused { reply: Pdu, error: ProtocolError },
}

/// Rebuilds one inbound message from ISO-TP frames
#[derive(Debug)]
pub struct ReassemblyEngine {
    params: ProtocolParameters,
    flow: FlowControlController,
    state: ReceiveState,
    buffer: Vec<u8>,
    expected_length: usize,
    next_sequence_number: u8,
    block_count: u8,
    deadline: Option<Instant>,
}

impl ReassemblyEngine {
    pub fn new(params: ProtocolParameters) -> Self {
        Self {
            params,
            flow: FlowControlController::new(params),
            state: ReceiveState::Idle,
            buffer: Vec::new(),
            expected_length: 0,
            next_sequence_number: 0,
            block_count: 0,
            deadline: None,
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ReceiveState::Idle
    }

    /// Deadline for the next Consecutive Frame, while one is awaited
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Bytes collected so far for the message in progress
    pub fn bytes_received(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one decoded PDU received at time `now`
    pub fn on_pdu(&mut self, pdu: Pdu, now: Instant) -> Result<Reassembly, ProtocolError> {
        match pdu {
            Pdu::Single { data } => {
                self.abandon_unfinished("single frame");
                log::trace!("Received single frame of {} bytes", data.len());
                self.buffer = data;
                self.expected_length = self.buffer.len();
                self.state = ReceiveState::Complete;
                Ok(Reassembly::Complete)
            }
            Pdu::First { total_length, data } => self.on_first_frame(total_length, data, now),
            Pdu::Consecutive {
                sequence_number,
                data,
            } => self.on_consecutive_frame(sequence_number, data, now),
            Pdu::FlowControl { .. } => Ok(Reassembly::Ignored),
        }
    }

    /// Abort the transfer if the inbound timeout has expired at `now`
    pub fn poll_timeout(&mut self, now: Instant) -> Result<(), ProtocolError> {
        match self.deadline {
            Some(deadline)
                if self.state == ReceiveState::AwaitingConsecutive && now >= deadline =>
            {
                log::warn!(
                    "No consecutive frame within {:?}, dropping {} of {} bytes",
                    self.params.inbound_timeout(),
                    self.buffer.len(),
                    self.expected_length
                );
                self.reset();
                Err(ProtocolError::Timeout(TimeoutKind::ConsecutiveFrame))
            }
            _ => Ok(()),
        }
    }

    /// Hand out the completed message and return to idle
    pub fn take_message(&mut self) -> Option<Vec<u8>> {
        if self.state != ReceiveState::Complete {
            return None;
        }
        let message = std::mem::take(&mut self.buffer);
        log::debug!("Inbound transfer of {} bytes complete", message.len());
        self.reset();
        Some(message)
    }

    /// Drop any partial or untaken message and return to idle
    pub fn abort(&mut self) {
        if !self.is_idle() {
            log::warn!("Aborting inbound transfer ({:?})", self.state);
        }
        self.reset();
    }

    fn on_first_frame(
        &mut self,
        total_length: u32,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<Reassembly, ProtocolError> {
        self.abandon_unfinished("first frame");

        let limit = self.params.max_message_length();
        if total_length > limit {
            log::warn!("Refusing inbound message of {} bytes (limit {})", total_length, limit);
            return Ok(Reassembly::Refused {
                reply: self.flow.overflow_response(),
                error: ProtocolError::MessageTooLarge {
                    declared: total_length,
                    limit,
                },
            });
        }

        let total = total_length as usize;
        if data.len() >= total {
            // Degenerate First Frame carrying the whole message
            self.buffer = data;
            self.buffer.truncate(total);
            self.expected_length = total;
            self.state = ReceiveState::Complete;
            return Ok(Reassembly::Complete);
        }

        log::debug!("Starting inbound transfer of {} bytes", total);
        self.buffer = Vec::with_capacity(total.min(INITIAL_BUFFER_CAPACITY));
        self.buffer.extend_from_slice(&data);
        self.expected_length = total;
        self.next_sequence_number = 1;
        self.block_count = 0;
        self.deadline = Some(deadline_after(now, self.params.inbound_timeout()));
        self.state = ReceiveState::AwaitingConsecutive;
        Ok(Reassembly::SendFlowControl(self.flow.inbound_response()))
    }

    fn on_consecutive_frame(
        &mut self,
        sequence_number: u8,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<Reassembly, ProtocolError> {
        if self.state != ReceiveState::AwaitingConsecutive {
            log::debug!("Ignoring consecutive frame {} outside of a transfer", sequence_number);
            return Ok(Reassembly::Ignored);
        }

        if sequence_number != self.next_sequence_number {
            let expected = self.next_sequence_number;
            log::warn!(
                "Sequence mismatch: expected {}, got {}; dropping transfer",
                expected,
                sequence_number
            );
            self.reset();
            return Err(ProtocolError::SequenceMismatch {
                expected,
                actual: sequence_number,
            });
        }

        let remaining = self.expected_length - self.buffer.len();
        let take = remaining.min(data.len());
        self.buffer.extend_from_slice(&data[..take]);
        self.next_sequence_number = (self.next_sequence_number + 1) & 0x0F;
        self.deadline = Some(deadline_after(now, self.params.inbound_timeout()));
        log::trace!(
            "Received consecutive frame {}, {} of {} bytes",
            sequence_number,
            self.buffer.len(),
            self.expected_length
        );

        if self.buffer.len() == self.expected_length {
            self.deadline = None;
            self.state = ReceiveState::Complete;
            return Ok(Reassembly::Complete);
        }

        let block_size = self.params.inbound_block_size();
        if block_size > 0 {
            self.block_count += 1;
            if self.block_count == block_size {
                self.block_count = 0;
                return Ok(Reassembly::SendFlowControl(self.flow.inbound_response()));
            }
        }
        Ok(Reassembly::InProgress)
    }

    fn abandon_unfinished(&mut self, cause: &str) {
        match self.state {
            ReceiveState::Idle => {}
            ReceiveState::AwaitingConsecutive => {
                log::warn!(
                    "New {} interrupts transfer at {} of {} bytes",
                    cause,
                    self.buffer.len(),
                    self.expected_length
                );
                self.reset();
            }
            ReceiveState::Complete => {
                log::warn!("New {} replaces untaken message of {} bytes", cause, self.buffer.len());
                self.reset();
            }
        }
    }

    fn reset(&mut self) {
        self.state = ReceiveState::Idle;
        self.buffer = Vec::new();
        self.expected_length = 0;
        self.next_sequence_number = 0;
        self.block_count = 0;
        self.deadline = None;
    }
}
