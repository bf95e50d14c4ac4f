//! CAN-TP (ISO-TP) transfer engines
//!
//! Segmentation of outbound messages, reassembly of inbound ones, and the
//! flow-control negotiation shared by both. The engines are sans-IO: they take
//! the current time as an argument and tell the host what to transmit and how
//! long to wait.

pub mod flow_control;
pub mod reassembly;
pub mod segmentation;

pub use flow_control::{FlowControlController, FlowDecision};
pub use reassembly::{Reassembly, ReassemblyEngine, ReceiveState};
pub use segmentation::{SegmentationEngine, SendAction, SendState};

use std::time::{Duration, Instant};

/// Stand-in horizon for timeouts that do not fit into an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, clamped to a far-future instant when the sum overflows
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
