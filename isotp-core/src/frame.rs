//! ISO-TP frame codec
//!
//! Converts between raw link-frame payloads and the four ISO-TP protocol data
//! units. The high nibble of the first byte selects the PDU type:
//!
//! ```text
//! Single       0x0L  [len escape 0x00 LL (FD only)]  data...
//! First        0x1H LL  [escape 0x10 0x00 + u32 BE]  data...
//! Consecutive  0x2S                                   data...
//! FlowControl  0x3F BS ST                             [padding]
//! ```

use crate::types::CodecError;
use byteorder::{BigEndian, ByteOrder};

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

const CLASSIC_FRAME_LEN: usize = 8;
const FD_FRAME_LEN: usize = 64;

/// Largest total length expressible without the escape form
pub const MAX_SHORT_FIRST_FRAME_LENGTH: u32 = 0xFFF;

/// Valid CAN FD data lengths above 8 bytes
const FD_DATA_LENGTHS: [usize; 7] = [12, 16, 20, 24, 32, 48, 64];

/// Link framing in use for transmitted frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// Classic CAN, up to 8 payload bytes
    Classic,
    /// CAN FD, up to 64 payload bytes
    Fd,
}

impl FrameMode {
    pub fn from_fd_flag(send_fd_frames: bool) -> Self {
        if send_fd_frames {
            FrameMode::Fd
        } else {
            FrameMode::Classic
        }
    }

    /// Maximum link-frame payload length
    pub fn max_frame_len(self) -> usize {
        match self {
            FrameMode::Classic => CLASSIC_FRAME_LEN,
            FrameMode::Fd => FD_FRAME_LEN,
        }
    }

    /// Largest message that fits into a Single Frame
    pub fn single_frame_capacity(self) -> usize {
        match self {
            FrameMode::Classic => 7,
            FrameMode::Fd => 62,
        }
    }

    /// Data bytes carried by a First Frame
    ///
    /// The escape form spends four more header bytes on the 32-bit length.
    pub fn first_frame_capacity(self, total_length: u32) -> usize {
        let capacity = match self {
            FrameMode::Classic => 6,
            FrameMode::Fd => 61,
        };
        if total_length > MAX_SHORT_FIRST_FRAME_LENGTH {
            self.max_frame_len() - 6
        } else {
            capacity
        }
    }

    /// Data bytes carried by a Consecutive Frame
    pub fn consecutive_frame_capacity(self) -> usize {
        self.max_frame_len() - 1
    }

    /// Length to pad a frame of `len` bytes up to
    fn padded_len(self, len: usize) -> usize {
        if len <= CLASSIC_FRAME_LEN {
            return CLASSIC_FRAME_LEN;
        }
        match self {
            FrameMode::Classic => len,
            FrameMode::Fd => FD_DATA_LENGTHS
                .iter()
                .copied()
                .find(|&dl| dl >= len)
                .unwrap_or(len),
        }
    }
}

/// Flow status carried in a Flow-Control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

impl FlowStatus {
    fn from_nibble(nibble: u8) -> Result<Self, CodecError> {
        match nibble {
            0 => Ok(FlowStatus::ContinueToSend),
            1 => Ok(FlowStatus::Wait),
            2 => Ok(FlowStatus::Overflow),
            other => Err(CodecError::InvalidFlowStatus(other)),
        }
    }

    fn to_nibble(self) -> u8 {
        match self {
            FlowStatus::ContinueToSend => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
        }
    }
}

/// One ISO-TP protocol data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    /// A whole message in one frame
    Single { data: Vec<u8> },
    /// Opening frame of a segmented message
    First { total_length: u32, data: Vec<u8> },
    /// Continuation of a segmented message
    Consecutive { sequence_number: u8, data: Vec<u8> },
    /// Receiver's pacing instruction to the sender
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        separation_time: u8,
    },
}

impl Pdu {
    /// Short name for log output
    pub fn kind(&self) -> &'static str {
        match self {
            Pdu::Single { .. } => "SingleFrame",
            Pdu::First { .. } => "FirstFrame",
            Pdu::Consecutive { .. } => "ConsecutiveFrame",
            Pdu::FlowControl { .. } => "FlowControlFrame",
        }
    }

    /// Decode a raw link-frame payload
    ///
    /// Frames longer than 8 bytes are taken to be CAN FD frames, which
    /// enables the escaped Single Frame length.
    pub fn decode(frame: &[u8]) -> Result<Pdu, CodecError> {
        let first = *frame.first().ok_or(CodecError::EmptyFrame)?;
        let nibble = first & 0x0F;

        match first >> 4 {
            PCI_SINGLE => {
                let (offset, len) = if nibble == 0 && frame.len() > CLASSIC_FRAME_LEN {
                    (2, frame[1] as usize)
                } else {
                    (1, nibble as usize)
                };
                let data = take(frame, offset, len)?;
                Ok(Pdu::Single { data: data.to_vec() })
            }
            PCI_FIRST => {
                let header = take(frame, 0, 2)?;
                let short_length = ((nibble as u32) << 8) | header[1] as u32;
                if short_length != 0 {
                    return Ok(Pdu::First {
                        total_length: short_length,
                        data: frame[2..].to_vec(),
                    });
                }
                let escaped = take(frame, 2, 4)?;
                Ok(Pdu::First {
                    total_length: BigEndian::read_u32(escaped),
                    data: frame[6..].to_vec(),
                })
            }
            PCI_CONSECUTIVE => Ok(Pdu::Consecutive {
                sequence_number: nibble,
                data: frame[1..].to_vec(),
            }),
            PCI_FLOW_CONTROL => {
                let header = take(frame, 0, 3)?;
                Ok(Pdu::FlowControl {
                    status: FlowStatus::from_nibble(nibble)?,
                    block_size: header[1],
                    separation_time: header[2],
                })
            }
            other => Err(CodecError::UnknownFrameType(other)),
        }
    }

    /// Encode into a raw link-frame payload
    ///
    /// Fails when the data does not fit the capacity of `mode`. With
    /// `padding` set the frame is filled up to a valid link length.
    pub fn encode(&self, mode: FrameMode, padding: Option<u8>) -> Result<Vec<u8>, CodecError> {
        let mut frame = Vec::with_capacity(mode.max_frame_len());

        match self {
            Pdu::Single { data } => {
                check_capacity(data.len(), mode.single_frame_capacity())?;
                if data.len() <= 7 {
                    frame.push((PCI_SINGLE << 4) | data.len() as u8);
                } else {
                    frame.push(PCI_SINGLE << 4);
                    frame.push(data.len() as u8);
                }
                frame.extend_from_slice(data);
            }
            Pdu::First { total_length, data } => {
                check_capacity(data.len(), mode.first_frame_capacity(*total_length))?;
                if data.len() as u64 > *total_length as u64 {
                    return Err(CodecError::LengthMismatch {
                        chunk: data.len(),
                        total: *total_length,
                    });
                }
                if *total_length > MAX_SHORT_FIRST_FRAME_LENGTH {
                    let mut escaped = [0u8; 4];
                    BigEndian::write_u32(&mut escaped, *total_length);
                    frame.push(PCI_FIRST << 4);
                    frame.push(0);
                    frame.extend_from_slice(&escaped);
                } else {
                    frame.push((PCI_FIRST << 4) | (*total_length >> 8) as u8);
                    frame.push(*total_length as u8);
                }
                frame.extend_from_slice(data);
            }
            Pdu::Consecutive { sequence_number, data } => {
                if *sequence_number > 0x0F {
                    return Err(CodecError::InvalidSequenceNumber(*sequence_number));
                }
                check_capacity(data.len(), mode.consecutive_frame_capacity())?;
                frame.push((PCI_CONSECUTIVE << 4) | sequence_number);
                frame.extend_from_slice(data);
            }
            Pdu::FlowControl {
                status,
                block_size,
                separation_time,
            } => {
                frame.push((PCI_FLOW_CONTROL << 4) | status.to_nibble());
                frame.push(*block_size);
                frame.push(*separation_time);
            }
        }

        if let Some(pad) = padding {
            let target = mode.padded_len(frame.len());
            frame.resize(target, pad);
        }
        Ok(frame)
    }
}

fn check_capacity(len: usize, capacity: usize) -> Result<(), CodecError> {
    if len > capacity {
        return Err(CodecError::PayloadTooLarge { len, capacity });
    }
    Ok(())
}

fn take(frame: &[u8], offset: usize, len: usize) -> Result<&[u8], CodecError> {
    frame.get(offset..offset + len).ok_or(CodecError::Truncated {
        needed: offset + len,
        actual: frame.len(),
    })
}
