use crate::result::{require, QuicheResult};

use super::types::*;

/// Two header forms (section 4.A): a long header used through the handshake
/// and for version negotiation, and a short header used once traffic
/// secrets are in force.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Long(LongHeader),
    Short(ShortHeader),
}

impl Header {
    pub fn decode(bytes: &mut Vec<u8>) -> QuicheResult<Self> {
        require(!bytes.is_empty(), "Header::decode: empty datagram")?;
        if bytes[0] & 0x80 != 0 {
            Ok(Header::Long(LongHeader::decode(bytes)?))
        } else {
            Ok(Header::Short(ShortHeader::decode(bytes)?))
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Header::Long(h) => h.encode(),
            Header::Short(h) => h.encode(),
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Header::Long(_))
    }
}

/// Long header (section 4.A): 1-byte type, 8-byte connection ID, 4-byte
/// packet number (always full width), 4-byte version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub packet_type: LongHeaderType,
    pub connection_id: ConnectionId,
    pub packet_number: u32,
    pub version: u32,
}

impl LongHeader {
    pub const LEN: usize = 1 + 8 + 4 + 4;

    pub fn new(
        packet_type: LongHeaderType,
        connection_id: ConnectionId,
        packet_number: u32,
        version: u32,
    ) -> Self {
        Self {
            packet_type,
            connection_id,
            packet_number,
            version,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::LEN);
        bytes.push(0x80 | self.packet_type.to_u8());
        bytes.extend_from_slice(&self.connection_id.to_be_bytes());
        bytes.extend_from_slice(&self.packet_number.to_be_bytes());
        bytes.extend_from_slice(&self.version.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &mut Vec<u8>) -> QuicheResult<Self> {
        require(
            bytes.len() >= Self::LEN,
            "LongHeader::decode: truncated header",
        )?;
        let type_byte = bytes.remove(0);
        let packet_type = LongHeaderType::from_u8(type_byte & 0x7f)
            .ok_or_else(|| crate::result::QuicheError::protocol("unknown long-header type"))?;

        let cid_bytes: [u8; 8] = bytes.drain(0..8).collect::<Vec<u8>>().try_into().unwrap();
        let connection_id = u64::from_be_bytes(cid_bytes);

        let pn_bytes: [u8; 4] = bytes.drain(0..4).collect::<Vec<u8>>().try_into().unwrap();
        let packet_number = u32::from_be_bytes(pn_bytes);

        let ver_bytes: [u8; 4] = bytes.drain(0..4).collect::<Vec<u8>>().try_into().unwrap();
        let version = u32::from_be_bytes(ver_bytes);

        Ok(Self {
            packet_type,
            connection_id,
            packet_number,
            version,
        })
    }
}

/// Short header (section 4.A), used post-handshake: a 1-byte type with
/// flags for connection-ID presence and compressed packet-number width,
/// an optional 8-byte connection ID, and the compressed packet number.
///
/// Type byte: bit7 clear (header form), bit6 = connection ID present,
/// bit5 = key phase, bits1-0 = packet-number length code (0=>1, 1=>2, 2=>4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeader {
    pub key_phase: KeyPhase,
    pub connection_id: Option<ConnectionId>,
    pub packet_number: Vec<u8>,
}

impl ShortHeader {
    fn pn_len_code(width: usize) -> u8 {
        match width {
            1 => 0,
            2 => 1,
            4 => 2,
            _ => panic!("invalid packet number width {width}"),
        }
    }

    fn pn_width(code: u8) -> QuicheResult<usize> {
        Ok(match code {
            0 => 1,
            1 => 2,
            2 => 4,
            _ => {
                return Err(crate::result::QuicheError::protocol(
                    "invalid packet number length code",
                ))
            }
        })
    }

    pub fn new(
        key_phase: KeyPhase,
        connection_id: Option<ConnectionId>,
        packet_number: Vec<u8>,
    ) -> Self {
        Self {
            key_phase,
            connection_id,
            packet_number,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut type_byte = 0u8;
        if self.connection_id.is_some() {
            type_byte |= 0x40;
        }
        if self.key_phase == KeyPhase::OneRtt {
            type_byte |= 0x20;
        }
        type_byte |= Self::pn_len_code(self.packet_number.len());

        let mut bytes = Vec::with_capacity(1 + 8 + self.packet_number.len());
        bytes.push(type_byte);
        if let Some(cid) = self.connection_id {
            bytes.extend_from_slice(&cid.to_be_bytes());
        }
        bytes.extend_from_slice(&self.packet_number);
        bytes
    }

    pub fn decode(bytes: &mut Vec<u8>) -> QuicheResult<Self> {
        require(!bytes.is_empty(), "ShortHeader::decode: empty datagram")?;
        let type_byte = bytes.remove(0);
        let cid_present = type_byte & 0x40 != 0;
        let key_phase = if type_byte & 0x20 != 0 {
            KeyPhase::OneRtt
        } else {
            KeyPhase::Unprotected
        };
        let pn_width = Self::pn_width(type_byte & 0x03)?;

        let connection_id = if cid_present {
            require(bytes.len() >= 8, "ShortHeader::decode: truncated cid")?;
            let cid_bytes: [u8; 8] = bytes.drain(0..8).collect::<Vec<u8>>().try_into().unwrap();
            Some(u64::from_be_bytes(cid_bytes))
        } else {
            None
        };

        require(
            bytes.len() >= pn_width,
            "ShortHeader::decode: truncated packet number",
        )?;
        let packet_number = bytes.drain(0..pn_width).collect();

        Ok(Self {
            key_phase,
            connection_id,
            packet_number,
        })
    }
}
