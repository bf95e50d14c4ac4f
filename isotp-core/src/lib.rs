//! ISO-TP Core Library
//!
//! An implementation of the ISO 15765-2 transport protocol (ISO-TP) that
//! carries messages of arbitrary length over classic CAN (8-byte) or CAN FD
//! (64-byte) link frames.
//!
//! # Architecture
//!
//! - [`config`]: immutable [`ProtocolParameters`] and the separation-time codec
//! - [`frame`]: encoding and decoding of the four ISO-TP frame types
//! - [`cantp`]: flow-control negotiation, segmentation and reassembly engines
//! - [`session`]: a blocking [`Session`] hosting both engines over a transport
//! - [`transport`]: the [`FrameTransport`] boundary to the link layer
//!
//! The engines are sans-IO. They take the current time and report deadlines,
//! so an event loop can drive them directly while threaded code uses
//! [`Session`].
//!
//! The library does NOT:
//! - Open CAN sockets or manage CAN identifiers
//! - Spawn threads or background tasks
//! - Multiplex several logical addresses over one session
//!
//! # Example Usage
//!
//! ```no_run
//! use isotp_core::{channel_pair, ProtocolParameters, Session};
//! use std::thread;
//! use std::time::Duration;
//!
//! let params = ProtocolParameters::DEFAULT
//!     .with_block_size(8)
//!     .unwrap()
//!     .with_separation_time(Duration::from_micros(500))
//!     .unwrap();
//!
//! let (client_link, server_link) = channel_pair();
//! let server = thread::spawn(move || {
//!     let mut server = Session::new(server_link, params);
//!     server.receive()
//! });
//!
//! let mut client = Session::new(client_link, params);
//! client.send(&[0x36; 100]).unwrap();
//! assert_eq!(server.join().unwrap().unwrap(), vec![0x36; 100]);
//! ```

// Public modules
pub mod cantp;
pub mod config;
pub mod frame;
pub mod session;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use cantp::{
    FlowControlController, FlowDecision, Reassembly, ReassemblyEngine, ReceiveState,
    SegmentationEngine, SendAction, SendState,
};
pub use config::{
    load_parameters, nanos_to_separation_time_byte, parse_parameters,
    separation_time_byte_to_nanos, ParametersConfig, ProtocolParameters,
};
pub use frame::{FlowStatus, FrameMode, Pdu};
pub use session::Session;
pub use transport::{channel_pair, ChannelTransport, FrameTransport};
pub use types::{CodecError, ConfigError, IsoTpError, ProtocolError, Result, TimeoutKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
