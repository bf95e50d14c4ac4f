//! Protocol parameters
//!
//! [`ProtocolParameters`] is the immutable configuration of a session. Every
//! `with_*` method returns a new, validated value; nothing is mutated in place,
//! so one parameter set can be shared by any number of sessions.
//!
//! The module also holds the codec for the one-byte separation time (STmin)
//! carried in Flow-Control frames, and [`ParametersConfig`], the serde mirror
//! used to load parameters from TOML files.

use crate::types::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

const SEPARATION_TIME_MAX_MILLIS: u64 = 127;
const SEPARATION_TIME_MICROS_BASE: u8 = 0xF0;
const SEPARATION_TIME_MICROS_FACTOR: u64 = 100;
const BLOCK_SIZE_MAX: u32 = 0xFF;

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

/// Default inbound message limit in bytes
pub const DEFAULT_MAX_MESSAGE_LENGTH: u32 = 0xFFFF;

/// Default number of Flow-Control Wait frames tolerated per transfer
pub const DEFAULT_MAX_WAIT_FRAMES: u32 = 10;

/// Immutable ISO-TP session parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParameters {
    send_fd_frames: bool,
    inbound_block_size: u8,
    inbound_separation_time: Duration,
    inbound_separation_time_byte: u8,
    outbound_timeout: Duration,
    inbound_timeout: Duration,
    max_wait_frames: u32,
    frame_padding: Option<u8>,
    max_message_length: u32,
}

impl ProtocolParameters {
    /// Classic frames, unlimited block size, no separation time, 1 s timeouts
    pub const DEFAULT: ProtocolParameters = ProtocolParameters {
        send_fd_frames: false,
        inbound_block_size: 0,
        inbound_separation_time: Duration::ZERO,
        inbound_separation_time_byte: 0,
        outbound_timeout: Duration::from_secs(1),
        inbound_timeout: Duration::from_secs(1),
        max_wait_frames: DEFAULT_MAX_WAIT_FRAMES,
        frame_padding: None,
        max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
    };

    /// Create a validated parameter set
    ///
    /// Fails with [`ConfigError::BlockSizeTooLarge`] when `inbound_block_size`
    /// exceeds 255 and with [`ConfigError::SeparationTimeTooLarge`] when the
    /// separation time does not fit the one-byte encoding.
    pub fn new(
        send_fd_frames: bool,
        inbound_block_size: u32,
        inbound_separation_time: Duration,
        outbound_timeout: Duration,
        inbound_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Self::DEFAULT
            .with_sending_fd_frames(send_fd_frames)
            .with_block_size(inbound_block_size)?
            .with_separation_time(inbound_separation_time)
            .map(|p| {
                p.with_outbound_timeout(outbound_timeout)
                    .with_inbound_timeout(inbound_timeout)
            })
    }

    pub fn with_sending_fd_frames(self, send_fd_frames: bool) -> Self {
        Self { send_fd_frames, ..self }
    }

    pub fn with_block_size(self, block_size: u32) -> Result<Self, ConfigError> {
        if block_size > BLOCK_SIZE_MAX {
            return Err(ConfigError::BlockSizeTooLarge(block_size));
        }
        Ok(Self {
            inbound_block_size: block_size as u8,
            ..self
        })
    }

    pub fn with_separation_time(self, separation_time: Duration) -> Result<Self, ConfigError> {
        let nanos = u64::try_from(separation_time.as_nanos())
            .map_err(|_| ConfigError::SeparationTimeTooLarge(separation_time))?;
        let byte = nanos_to_separation_time_byte(nanos)?;
        Ok(Self {
            inbound_separation_time: separation_time,
            inbound_separation_time_byte: byte,
            ..self
        })
    }

    pub fn with_outbound_timeout(self, outbound_timeout: Duration) -> Self {
        Self { outbound_timeout, ..self }
    }

    pub fn with_inbound_timeout(self, inbound_timeout: Duration) -> Self {
        Self { inbound_timeout, ..self }
    }

    pub fn with_max_wait_frames(self, max_wait_frames: u32) -> Self {
        Self { max_wait_frames, ..self }
    }

    /// Pad every transmitted frame with `padding` (None disables padding)
    pub fn with_frame_padding(self, frame_padding: Option<u8>) -> Self {
        Self { frame_padding, ..self }
    }

    pub fn with_max_message_length(self, max_message_length: u32) -> Self {
        Self { max_message_length, ..self }
    }

    pub fn send_fd_frames(&self) -> bool {
        self.send_fd_frames
    }

    pub fn inbound_block_size(&self) -> u8 {
        self.inbound_block_size
    }

    /// Wire form of the block size advertised in our Flow-Control frames
    pub fn inbound_block_size_byte(&self) -> u8 {
        self.inbound_block_size
    }

    pub fn inbound_separation_time(&self) -> Duration {
        self.inbound_separation_time
    }

    /// Wire form of the separation time advertised in our Flow-Control frames
    pub fn inbound_separation_time_byte(&self) -> u8 {
        self.inbound_separation_time_byte
    }

    pub fn outbound_timeout(&self) -> Duration {
        self.outbound_timeout
    }

    pub fn inbound_timeout(&self) -> Duration {
        self.inbound_timeout
    }

    pub fn max_wait_frames(&self) -> u32 {
        self.max_wait_frames
    }

    pub fn frame_padding(&self) -> Option<u8> {
        self.frame_padding
    }

    pub fn max_message_length(&self) -> u32 {
        self.max_message_length
    }
}

impl Default for ProtocolParameters {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Encode a separation time into its STmin byte
///
/// Millisecond values (1..=127 ms) map to bytes 1..=127. Values of at most
/// 1000 µs are rounded to the nearest 100 µs and map to 0xF1..=0xF9, except
/// that 1000 µs becomes the 1 ms byte and anything below 50 µs becomes 0.
pub fn nanos_to_separation_time_byte(nanos: u64) -> Result<u8, ConfigError> {
    if nanos == 0 {
        return Ok(0);
    }
    let micros = nanos / NANOS_PER_MICRO;
    if micros > 1000 {
        let millis = micros / 1000;
        if millis > SEPARATION_TIME_MAX_MILLIS {
            return Err(ConfigError::SeparationTimeTooLarge(Duration::from_nanos(nanos)));
        }
        return Ok(millis as u8);
    }

    let coefficient = (micros + SEPARATION_TIME_MICROS_FACTOR / 2) / SEPARATION_TIME_MICROS_FACTOR;
    match coefficient {
        0 => Ok(0),
        10 => Ok(1),
        c => Ok(SEPARATION_TIME_MICROS_BASE + c as u8),
    }
}

/// Decode an STmin byte received from a peer
///
/// Accepts every byte value. 0x80..=0xEF are reserved and read as the
/// longest defined separation time (127 ms).
pub fn separation_time_byte_to_nanos(separation_time_byte: u8) -> u64 {
    match separation_time_byte {
        0..=0x7F => separation_time_byte as u64 * NANOS_PER_MILLI,
        SEPARATION_TIME_MICROS_BASE..=0xFF => {
            (separation_time_byte - SEPARATION_TIME_MICROS_BASE) as u64
                * SEPARATION_TIME_MICROS_FACTOR
                * NANOS_PER_MICRO
        }
        _ => SEPARATION_TIME_MAX_MILLIS * NANOS_PER_MILLI,
    }
}

/// Decode an STmin byte into a [`Duration`]
pub fn separation_time_from_byte(separation_time_byte: u8) -> Duration {
    Duration::from_nanos(separation_time_byte_to_nanos(separation_time_byte))
}

/// File representation of [`ProtocolParameters`]
///
/// Every field is optional in the file and falls back to the default
/// parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ParametersConfig {
    #[serde(default)]
    pub send_fd_frames: bool,

    #[serde(default)]
    pub inbound_block_size: u32,

    /// Separation time advertised to the peer, in microseconds
    #[serde(default)]
    pub inbound_separation_time_us: u64,

    #[serde(default = "default_timeout_ms")]
    pub outbound_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub inbound_timeout_ms: u64,

    #[serde(default = "default_max_wait_frames")]
    pub max_wait_frames: u32,

    #[serde(default)]
    pub frame_padding: Option<u8>,

    #[serde(default = "default_max_message_length")]
    pub max_message_length: u32,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_wait_frames() -> u32 {
    DEFAULT_MAX_WAIT_FRAMES
}

fn default_max_message_length() -> u32 {
    DEFAULT_MAX_MESSAGE_LENGTH
}

impl Default for ParametersConfig {
    fn default() -> Self {
        Self {
            send_fd_frames: false,
            inbound_block_size: 0,
            inbound_separation_time_us: 0,
            outbound_timeout_ms: default_timeout_ms(),
            inbound_timeout_ms: default_timeout_ms(),
            max_wait_frames: default_max_wait_frames(),
            frame_padding: None,
            max_message_length: default_max_message_length(),
        }
    }
}

impl TryFrom<ParametersConfig> for ProtocolParameters {
    type Error = ConfigError;

    fn try_from(config: ParametersConfig) -> Result<Self, Self::Error> {
        Ok(ProtocolParameters::new(
            config.send_fd_frames,
            config.inbound_block_size,
            Duration::from_micros(config.inbound_separation_time_us),
            Duration::from_millis(config.outbound_timeout_ms),
            Duration::from_millis(config.inbound_timeout_ms),
        )?
        .with_max_wait_frames(config.max_wait_frames)
        .with_frame_padding(config.frame_padding)
        .with_max_message_length(config.max_message_length))
    }
}

/// Parse protocol parameters from TOML text
pub fn parse_parameters(content: &str) -> Result<ProtocolParameters, ConfigError> {
    let config: ParametersConfig = toml::from_str(content)?;
    ProtocolParameters::try_from(config)
}

/// Load protocol parameters from a TOML file
pub fn load_parameters(path: &Path) -> Result<ProtocolParameters, ConfigError> {
    log::debug!("Loading protocol parameters from: {:?}", path);
    let content = fs::read_to_string(path)?;
    parse_parameters(&content)
}
