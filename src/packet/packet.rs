use crate::result::{require, QuicheResult};

use super::frame::Frame;
use super::header::{Header, LongHeader, ShortHeader};
use super::types::{ConnectionId, KeyPhase, LongHeaderType};

/// Maximum transmission unit for any single datagram (section 6).
pub const MTU: usize = 1252;

/// Minimum size of a client-initial datagram; short packets are padded up
/// to this floor to guarantee amplification resistance (section 6).
pub const MIN_CLIENT_INITIAL: usize = 1200;

/// A decoded packet: one header plus the ordered frames carried in its
/// payload (section 4.A). Version-negotiation and public-reset packets
/// carry no frames and are represented with an empty `frames` vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub frames: Vec<Frame>,
}

impl Packet {
    pub fn contains_frames(&self) -> bool {
        match &self.header {
            Header::Long(h) => !matches!(
                h.packet_type,
                LongHeaderType::VersionNegotiation | LongHeaderType::PublicReset
            ),
            Header::Short(_) => true,
        }
    }

    pub fn client_initial(connection_id: ConnectionId, version: u32, frames: Vec<Frame>) -> Self {
        Self {
            header: Header::Long(LongHeader::new(
                LongHeaderType::ClientInitial,
                connection_id,
                0,
                version,
            )),
            frames,
        }
    }

    pub fn long_header(
        packet_type: LongHeaderType,
        connection_id: ConnectionId,
        packet_number: u32,
        version: u32,
        frames: Vec<Frame>,
    ) -> Self {
        Self {
            header: Header::Long(LongHeader::new(
                packet_type,
                connection_id,
                packet_number,
                version,
            )),
            frames,
        }
    }

    pub fn short_header(
        key_phase: KeyPhase,
        connection_id: Option<ConnectionId>,
        packet_number: Vec<u8>,
        frames: Vec<Frame>,
    ) -> Self {
        Self {
            header: Header::Short(ShortHeader::new(key_phase, connection_id, packet_number)),
            frames,
        }
    }

    /// Encodes the header followed by every frame, with an explicit length
    /// prefix on STREAM frames so their boundaries survive concatenation.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.header.encode();
        for frame in &self.frames {
            bytes.extend(frame.encode(true));
        }
        bytes
    }

    /// Encodes the packet, then pads with `PADDING` frames up to `MTU` if
    /// `min_len` exceeds the natural encoded size. Callers pass
    /// [`MIN_CLIENT_INITIAL`] for a client's first Initial packet and `0`
    /// otherwise.
    pub fn encode_padded(&self, min_len: usize) -> Vec<u8> {
        let mut bytes = self.encode();
        if bytes.len() < min_len {
            bytes.resize(min_len, Frame::Padding.encode(true)[0]);
        }
        bytes
    }

    pub fn decode(bytes: &mut Vec<u8>) -> QuicheResult<Self> {
        require(!bytes.is_empty(), "Packet::decode: empty datagram")?;
        let header = Header::decode(bytes)?;
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            frames.push(Frame::decode(bytes)?);
        }
        Ok(Self { header, frames })
    }
}
