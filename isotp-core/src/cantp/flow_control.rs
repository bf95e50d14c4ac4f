//! Flow-control negotiation
//!
//! Inbound, we advertise our own block size and separation time in every
//! Flow-Control frame we send. Outbound, we follow whatever the peer
//! advertises in the Flow-Control frames it sends back.

use crate::config::{separation_time_from_byte, ProtocolParameters};
use crate::frame::{FlowStatus, Pdu};
use crate::types::{ProtocolError, TimeoutKind};
use std::time::Duration;

/// What the sender may do after a Flow-Control frame from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDecision {
    /// Send up to `block_size` frames (0 = all remaining), `separation_time` apart
    Continue {
        block_size: u8,
        separation_time: Duration,
    },
    /// Keep waiting for another Flow-Control frame
    Wait,
}

/// Negotiated flow-control state for both directions of a session
#[derive(Debug, Clone)]
pub struct FlowControlController {
    params: ProtocolParameters,
    peer_block_size: u8,
    peer_separation_time: Duration,
    wait_frames: u32,
}

impl FlowControlController {
    pub fn new(params: ProtocolParameters) -> Self {
        Self {
            params,
            peer_block_size: 0,
            peer_separation_time: Duration::ZERO,
            wait_frames: 0,
        }
    }

    pub fn parameters(&self) -> &ProtocolParameters {
        &self.params
    }

    /// Flow-Control frame answering a First Frame we accept
    pub fn inbound_response(&self) -> Pdu {
        Pdu::FlowControl {
            status: FlowStatus::ContinueToSend,
            block_size: self.params.inbound_block_size_byte(),
            separation_time: self.params.inbound_separation_time_byte(),
        }
    }

    /// Flow-Control frame refusing a message we cannot buffer
    pub fn overflow_response(&self) -> Pdu {
        Pdu::FlowControl {
            status: FlowStatus::Overflow,
            block_size: 0,
            separation_time: 0,
        }
    }

    /// Interpret a Flow-Control frame received while sending
    pub fn on_flow_control(
        &mut self,
        status: FlowStatus,
        block_size: u8,
        separation_time: u8,
    ) -> Result<FlowDecision, ProtocolError> {
        match status {
            FlowStatus::ContinueToSend => {
                self.wait_frames = 0;
                self.peer_block_size = block_size;
                self.peer_separation_time = separation_time_from_byte(separation_time);
                log::debug!(
                    "Peer flow control: block size {}, separation time {:?}",
                    block_size,
                    self.peer_separation_time
                );
                Ok(FlowDecision::Continue {
                    block_size,
                    separation_time: self.peer_separation_time,
                })
            }
            FlowStatus::Wait => {
                self.wait_frames += 1;
                if self.wait_frames > self.params.max_wait_frames() {
                    log::warn!(
                        "Peer sent {} wait frames, limit is {}",
                        self.wait_frames,
                        self.params.max_wait_frames()
                    );
                    self.reset();
                    return Err(ProtocolError::Timeout(TimeoutKind::WaitFrameLimit));
                }
                log::debug!(
                    "Peer asked to wait ({}/{})",
                    self.wait_frames,
                    self.params.max_wait_frames()
                );
                Ok(FlowDecision::Wait)
            }
            FlowStatus::Overflow => {
                log::warn!("Peer reported overflow, aborting transfer");
                self.reset();
                Err(ProtocolError::Overflow)
            }
        }
    }

    pub fn peer_block_size(&self) -> u8 {
        self.peer_block_size
    }

    pub fn peer_separation_time(&self) -> Duration {
        self.peer_separation_time
    }

    pub fn wait_frames(&self) -> u32 {
        self.wait_frames
    }

    /// Forget everything negotiated for the outbound transfer
    pub fn reset(&mut self) {
        self.peer_block_size = 0;
        self.peer_separation_time = Duration::ZERO;
        self.wait_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_response_uses_our_parameters() {
        let params = ProtocolParameters::DEFAULT
            .with_block_size(4)
            .unwrap()
            .with_separation_time(Duration::from_micros(200))
            .unwrap();
        let controller = FlowControlController::new(params);

        assert_eq!(
            controller.inbound_response(),
            Pdu::FlowControl {
                status: FlowStatus::ContinueToSend,
                block_size: 4,
                separation_time: 0xF2,
            }
        );
    }

    #[test]
    fn test_continue_to_send() {
        let mut controller = FlowControlController::new(ProtocolParameters::DEFAULT);
        let decision = controller
            .on_flow_control(FlowStatus::ContinueToSend, 2, 0xF5)
            .unwrap();

        assert_eq!(
            decision,
            FlowDecision::Continue {
                block_size: 2,
                separation_time: Duration::from_micros(500),
            }
        );
        assert_eq!(controller.peer_block_size(), 2);
    }

    #[test]
    fn test_overflow_aborts() {
        let mut controller = FlowControlController::new(ProtocolParameters::DEFAULT);
        assert_eq!(
            controller.on_flow_control(FlowStatus::Overflow, 0, 0),
            Err(ProtocolError::Overflow)
        );
    }

    #[test]
    fn test_wait_frames_are_bounded() {
        let params = ProtocolParameters::DEFAULT.with_max_wait_frames(2);
        let mut controller = FlowControlController::new(params);

        assert_eq!(controller.on_flow_control(FlowStatus::Wait, 0, 0), Ok(FlowDecision::Wait));
        assert_eq!(controller.on_flow_control(FlowStatus::Wait, 0, 0), Ok(FlowDecision::Wait));
        assert_eq!(
            controller.on_flow_control(FlowStatus::Wait, 0, 0),
            Err(ProtocolError::Timeout(TimeoutKind::WaitFrameLimit))
        );
        assert_eq!(controller.wait_frames(), 0);
    }

    #[test]
    fn test_continue_resets_wait_count() {
        let params = ProtocolParameters::DEFAULT.with_max_wait_frames(1);
        let mut controller = FlowControlController::new(params);

        controller.on_flow_control(FlowStatus::Wait, 0, 0).unwrap();
        controller.on_flow_control(FlowStatus::ContinueToSend, 1, 0).unwrap();
        assert_eq!(controller.on_flow_control(FlowStatus::Wait, 0, 0), Ok(FlowDecision::Wait));
    }
}
