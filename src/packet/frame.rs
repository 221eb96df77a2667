use crate::frame;
use crate::result::{require, QuicheError, QuicheResult};

// Single-byte opcodes with fixed total lengths (section 6). Values in
// [0xA0, 0xC0) are ACK frames and values >= 0xC0 are STREAM frames; both are
// modelled separately below since their payload length is variable.
frame! {
    PADDING = 0x00,
    RST_STREAM = 0x01,
    CLOSE = 0x02,
    GOAWAY = 0x03,
    MAX_DATA = 0x04,
    MAX_STREAM_DATA = 0x05,
    MAX_STREAM_ID = 0x06,
    PING = 0x07,
    BLOCKED = 0x08,
    STREAM_BLOCKED = 0x09,
    STREAM_ID_NEEDED = 0x0A,
    NEW_CONNECTION_ID = 0x0B,
}

pub const ACK_RANGE_START: u8 = 0xA0;
pub const ACK_RANGE_END: u8 = 0xC0; // exclusive
pub const STREAM_RANGE_START: u8 = 0xC0;

/// One contiguous run of acknowledged packet numbers on the wire, plus the
/// gap-and-length pairs that follow it (section 4.A).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acked: u64,
    pub ack_delay: u16,
    pub first_ack_block: u64,
    /// (gap, ack_block_length) pairs, oldest-range-last.
    pub blocks: Vec<(u64, u64)>,
    /// Optional receive timestamps; MAY be omitted on send, MUST be
    /// tolerated on receive. Each entry is (delta_from_largest, time_us).
    pub timestamps: Vec<(u8, u16)>,
}

impl AckFrame {
    // Both fields share one width code: the 5 free bits in the ACK type
    // byte don't stretch to two independent widths (see DESIGN.md).
    fn width_code(width: u8) -> u8 {
        match width {
            1 => 0,
            2 => 1,
            4 => 2,
            _ => 3,
        }
    }

    fn width_from_code(code: u8) -> u8 {
        match code {
            0 => 1,
            1 => 2,
            2 => 4,
            _ => 6,
        }
    }

    /// Widest byte width among {1,2,4,6} that fits `value`.
    fn width_for(value: u64) -> u8 {
        if value < (1 << 8) {
            1
        } else if value < (1 << 16) {
            2
        } else if value < (1u64 << 32) {
            4
        } else {
            6
        }
    }

    fn write_width(buf: &mut Vec<u8>, value: u64, width: u8) {
        let bytes = value.to_be_bytes();
        buf.extend_from_slice(&bytes[8 - width as usize..]);
    }

    fn read_width(bytes: &mut Vec<u8>, width: u8) -> QuicheResult<u64> {
        require(bytes.len() >= width as usize, "AckFrame: truncated field")?;
        let raw: Vec<u8> = bytes.drain(0..width as usize).collect();
        let mut value = 0u64;
        for b in raw {
            value = (value << 8) | b as u64;
        }
        Ok(value)
    }

    pub fn encode(&self) -> Vec<u8> {
        let width = Self::width_for(self.largest_acked).max(Self::width_for(self.first_ack_block));
        let num_blocks_present = !self.blocks.is_empty();
        let num_ts_present = !self.timestamps.is_empty();

        let mut type_byte = ACK_RANGE_START;
        if num_blocks_present {
            type_byte |= 0x10;
        }
        if num_ts_present {
            type_byte |= 0x08;
        }
        type_byte |= Self::width_code(width) << 1;

        let mut buf = vec![type_byte];
        if num_blocks_present {
            buf.push(self.blocks.len() as u8);
        }
        if num_ts_present {
            buf.push(self.timestamps.len() as u8);
        }
        Self::write_width(&mut buf, self.largest_acked, width);
        buf.extend_from_slice(&self.ack_delay.to_be_bytes());
        Self::write_width(&mut buf, self.first_ack_block, width);
        for &(gap, len) in &self.blocks {
            Self::write_width(&mut buf, gap, width);
            Self::write_width(&mut buf, len, width);
        }
        for &(delta, time_us) in &self.timestamps {
            buf.push(delta);
            buf.extend_from_slice(&time_us.to_be_bytes());
        }
        buf
    }

    pub fn decode(type_byte: u8, bytes: &mut Vec<u8>) -> QuicheResult<Self> {
        require(
            (ACK_RANGE_START..ACK_RANGE_END).contains(&type_byte),
            "AckFrame: type byte out of range",
        )?;
        let num_blocks_present = type_byte & 0x10 != 0;
        let num_ts_present = type_byte & 0x08 != 0;
        let width = Self::width_from_code((type_byte & 0x06) >> 1);

        let num_blocks = if num_blocks_present {
            require(!bytes.is_empty(), "AckFrame: missing num_blocks")?;
            bytes.remove(0)
        } else {
            0
        };
        let num_ts = if num_ts_present {
            require(!bytes.is_empty(), "AckFrame: missing num_ts")?;
            bytes.remove(0)
        } else {
            0
        };

        let largest_acked = Self::read_width(bytes, width)?;
        require(bytes.len() >= 2, "AckFrame: truncated ack delay")?;
        let delay_bytes: [u8; 2] = bytes.drain(0..2).collect::<Vec<u8>>().try_into().unwrap();
        let ack_delay = u16::from_be_bytes(delay_bytes);
        let first_ack_block = Self::read_width(bytes, width)?;

        let mut blocks = Vec::with_capacity(num_blocks as usize);
        for _ in 0..num_blocks {
            let gap = Self::read_width(bytes, width)?;
            let len = Self::read_width(bytes, width)?;
            blocks.push((gap, len));
        }

        let mut timestamps = Vec::with_capacity(num_ts as usize);
        for _ in 0..num_ts {
            require(bytes.len() >= 3, "AckFrame: truncated timestamp entry")?;
            let delta = bytes.remove(0);
            let time_bytes: [u8; 2] = bytes.drain(0..2).collect::<Vec<u8>>().try_into().unwrap();
            timestamps.push((delta, u16::from_be_bytes(time_bytes)));
        }

        Ok(Self {
            largest_acked,
            ack_delay,
            first_ack_block,
            blocks,
            timestamps,
        })
    }
}

/// Carries application bytes for one stream (section 4.A).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u32,
    pub offset: u64,
    pub fin: bool,
    pub data: Vec<u8>,
}

impl StreamFrame {
    fn stream_id_width(id: u32) -> u8 {
        if id < (1 << 8) {
            1
        } else if id < (1 << 16) {
            2
        } else if id < (1 << 24) {
            3
        } else {
            4
        }
    }

    fn offset_width(offset: u64) -> u8 {
        if offset == 0 {
            0
        } else if offset < (1 << 16) {
            2
        } else if offset < (1u64 << 32) {
            4
        } else {
            8
        }
    }

    /// Encodes the frame. `explicit_length` controls whether a 2-byte data
    /// length is written; omit it only for the last frame in a packet.
    pub fn encode(&self, explicit_length: bool) -> Vec<u8> {
        let sid_width = Self::stream_id_width(self.stream_id);
        let off_width = Self::offset_width(self.offset);

        let mut type_byte = STREAM_RANGE_START;
        if self.fin {
            type_byte |= 0x20;
        }
        type_byte |= (sid_width - 1) << 3;
        let off_code: u8 = match off_width {
            0 => 0,
            2 => 1,
            4 => 2,
            _ => 3,
        };
        type_byte |= off_code << 1;
        if explicit_length {
            type_byte |= 0x01;
        }

        let mut buf = vec![type_byte];
        buf.extend_from_slice(&self.stream_id.to_be_bytes()[4 - sid_width as usize..]);
        if off_width > 0 {
            buf.extend_from_slice(&self.offset.to_be_bytes()[8 - off_width as usize..]);
        }
        if explicit_length {
            buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        }
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(type_byte: u8, bytes: &mut Vec<u8>) -> QuicheResult<Self> {
        let fin = type_byte & 0x20 != 0;
        let sid_width = ((type_byte & 0x18) >> 3) + 1;
        let off_code = (type_byte & 0x06) >> 1;
        let off_width: u8 = match off_code {
            0 => 0,
            1 => 2,
            2 => 4,
            _ => 8,
        };
        let length_present = type_byte & 0x01 != 0;

        require(
            bytes.len() >= sid_width as usize,
            "StreamFrame: truncated stream id",
        )?;
        let sid_bytes: Vec<u8> = bytes.drain(0..sid_width as usize).collect();
        let mut stream_id = 0u32;
        for b in sid_bytes {
            stream_id = (stream_id << 8) | b as u32;
        }

        let offset = if off_width > 0 {
            require(
                bytes.len() >= off_width as usize,
                "StreamFrame: truncated offset",
            )?;
            let off_bytes: Vec<u8> = bytes.drain(0..off_width as usize).collect();
            let mut offset = 0u64;
            for b in off_bytes {
                offset = (offset << 8) | b as u64;
            }
            offset
        } else {
            0
        };

        let data = if length_present {
            require(bytes.len() >= 2, "StreamFrame: truncated data length")?;
            let len_bytes: [u8; 2] = bytes.drain(0..2).collect::<Vec<u8>>().try_into().unwrap();
            let len = u16::from_be_bytes(len_bytes) as usize;
            require(bytes.len() >= len, "StreamFrame: truncated data")?;
            bytes.drain(0..len).collect()
        } else {
            std::mem::take(bytes)
        };

        Ok(Self {
            stream_id,
            offset,
            fin,
            data,
        })
    }
}

/// The decoded frame, as a tagged union over all frame kinds (section 9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding,
    RstStream {
        stream_id: u32,
        error_code: u32,
        final_offset: u64,
    },
    Close {
        error_code: u32,
        reason: Vec<u8>,
    },
    Goaway {
        client_stream_id: u32,
        server_stream_id: u32,
    },
    MaxData {
        maximum_data: u64,
    },
    MaxStreamData {
        stream_id: u32,
        maximum_stream_data: u64,
    },
    MaxStreamId {
        maximum_stream_id: u32,
    },
    Ping,
    Blocked,
    StreamBlocked {
        stream_id: u32,
    },
    StreamIdNeeded,
    NewConnectionId {
        sequence: u16,
        connection_id: u64,
    },
    Ack(AckFrame),
    Stream(StreamFrame),
}

impl Frame {
    /// Encodes one frame. `explicit_stream_length` only matters for
    /// `Frame::Stream` and should be false only for the packet's final frame.
    pub fn encode(&self, explicit_stream_length: bool) -> Vec<u8> {
        match self {
            Frame::Padding => vec![FrameType::PADDING as u8],
            Frame::RstStream {
                stream_id,
                error_code,
                final_offset,
            } => {
                let mut buf = vec![FrameType::RST_STREAM as u8];
                buf.extend_from_slice(&stream_id.to_be_bytes());
                buf.extend_from_slice(&error_code.to_be_bytes());
                buf.extend_from_slice(&final_offset.to_be_bytes());
                buf
            }
            Frame::Close { error_code, reason } => {
                let mut buf = vec![FrameType::CLOSE as u8];
                buf.extend_from_slice(&error_code.to_be_bytes());
                buf.extend_from_slice(&(reason.len() as u16).to_be_bytes());
                buf.extend_from_slice(reason);
                buf
            }
            Frame::Goaway {
                client_stream_id,
                server_stream_id,
            } => {
                let mut buf = vec![FrameType::GOAWAY as u8];
                buf.extend_from_slice(&client_stream_id.to_be_bytes());
                buf.extend_from_slice(&server_stream_id.to_be_bytes());
                buf
            }
            Frame::MaxData { maximum_data } => {
                let mut buf = vec![FrameType::MAX_DATA as u8];
                buf.extend_from_slice(&maximum_data.to_be_bytes());
                buf
            }
            Frame::MaxStreamData {
                stream_id,
                maximum_stream_data,
            } => {
                let mut buf = vec![FrameType::MAX_STREAM_DATA as u8];
                buf.extend_from_slice(&stream_id.to_be_bytes());
                buf.extend_from_slice(&maximum_stream_data.to_be_bytes());
                buf
            }
            Frame::MaxStreamId { maximum_stream_id } => {
                let mut buf = vec![FrameType::MAX_STREAM_ID as u8];
                buf.extend_from_slice(&maximum_stream_id.to_be_bytes());
                buf
            }
            Frame::Ping => vec![FrameType::PING as u8],
            Frame::Blocked => vec![FrameType::BLOCKED as u8],
            Frame::StreamBlocked { stream_id } => {
                let mut buf = vec![FrameType::STREAM_BLOCKED as u8];
                buf.extend_from_slice(&stream_id.to_be_bytes());
                buf
            }
            Frame::StreamIdNeeded => vec![FrameType::STREAM_ID_NEEDED as u8],
            Frame::NewConnectionId {
                sequence,
                connection_id,
            } => {
                let mut buf = vec![FrameType::NEW_CONNECTION_ID as u8];
                buf.extend_from_slice(&sequence.to_be_bytes());
                buf.extend_from_slice(&connection_id.to_be_bytes());
                buf
            }
            Frame::Ack(ack) => ack.encode(),
            Frame::Stream(stream) => stream.encode(explicit_stream_length),
        }
    }

    /// Decodes one frame from the front of `bytes`, leaving any trailing
    /// frames in place.
    pub fn decode(bytes: &mut Vec<u8>) -> QuicheResult<Self> {
        require(!bytes.is_empty(), "Frame::decode: empty input")?;
        let type_byte = bytes[0];

        if type_byte >= STREAM_RANGE_START {
            bytes.remove(0);
            return Ok(Frame::Stream(StreamFrame::decode(type_byte, bytes)?));
        }
        if (ACK_RANGE_START..ACK_RANGE_END).contains(&type_byte) {
            bytes.remove(0);
            return Ok(Frame::Ack(AckFrame::decode(type_byte, bytes)?));
        }

        match type_byte as u64 {
            FrameType::PADDING => {
                bytes.remove(0);
                Ok(Frame::Padding)
            }
            FrameType::RST_STREAM => {
                require(bytes.len() >= 17, "RstStream: truncated")?;
                bytes.remove(0);
                let stream_id = take_u32(bytes);
                let error_code = take_u32(bytes);
                let final_offset = take_u64(bytes);
                Ok(Frame::RstStream {
                    stream_id,
                    error_code,
                    final_offset,
                })
            }
            FrameType::CLOSE => {
                require(bytes.len() >= 7, "Close: truncated")?;
                bytes.remove(0);
                let error_code = take_u32(bytes);
                let reason_len = take_u16(bytes) as usize;
                require(bytes.len() >= reason_len, "Close: truncated reason")?;
                let reason = bytes.drain(0..reason_len).collect();
                Ok(Frame::Close { error_code, reason })
            }
            FrameType::GOAWAY => {
                require(bytes.len() >= 9, "Goaway: truncated")?;
                bytes.remove(0);
                let client_stream_id = take_u32(bytes);
                let server_stream_id = take_u32(bytes);
                Ok(Frame::Goaway {
                    client_stream_id,
                    server_stream_id,
                })
            }
            FrameType::MAX_DATA => {
                require(bytes.len() >= 9, "MaxData: truncated")?;
                bytes.remove(0);
                Ok(Frame::MaxData {
                    maximum_data: take_u64(bytes),
                })
            }
            FrameType::MAX_STREAM_DATA => {
                require(bytes.len() >= 13, "MaxStreamData: truncated")?;
                bytes.remove(0);
                let stream_id = take_u32(bytes);
                let maximum_stream_data = take_u64(bytes);
                Ok(Frame::MaxStreamData {
                    stream_id,
                    maximum_stream_data,
                })
            }
            FrameType::MAX_STREAM_ID => {
                require(bytes.len() >= 5, "MaxStreamId: truncated")?;
                bytes.remove(0);
                Ok(Frame::MaxStreamId {
                    maximum_stream_id: take_u32(bytes),
                })
            }
            FrameType::PING => {
                bytes.remove(0);
                Ok(Frame::Ping)
            }
            FrameType::BLOCKED => {
                bytes.remove(0);
                Ok(Frame::Blocked)
            }
            FrameType::STREAM_BLOCKED => {
                require(bytes.len() >= 5, "StreamBlocked: truncated")?;
                bytes.remove(0);
                Ok(Frame::StreamBlocked {
                    stream_id: take_u32(bytes),
                })
            }
            FrameType::STREAM_ID_NEEDED => {
                bytes.remove(0);
                Ok(Frame::StreamIdNeeded)
            }
            FrameType::NEW_CONNECTION_ID => {
                require(bytes.len() >= 11, "NewConnectionId: truncated")?;
                bytes.remove(0);
                let sequence = take_u16(bytes);
                let connection_id = take_u64(bytes);
                Ok(Frame::NewConnectionId {
                    sequence,
                    connection_id,
                })
            }
            _ => Err(QuicheError::protocol(format!(
                "unknown frame type 0x{:02x}",
                type_byte
            ))),
        }
    }
}

fn take_u16(bytes: &mut Vec<u8>) -> u16 {
    let raw: [u8; 2] = bytes.drain(0..2).collect::<Vec<u8>>().try_into().unwrap();
    u16::from_be_bytes(raw)
}

fn take_u32(bytes: &mut Vec<u8>) -> u32 {
    let raw: [u8; 4] = bytes.drain(0..4).collect::<Vec<u8>>().try_into().unwrap();
    u32::from_be_bytes(raw)
}

fn take_u64(bytes: &mut Vec<u8>) -> u64 {
    let raw: [u8; 8] = bytes.drain(0..8).collect::<Vec<u8>>().try_into().unwrap();
    u64::from_be_bytes(raw)
}
