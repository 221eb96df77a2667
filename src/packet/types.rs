use crate::bits::{Bits, BitsExt};
use crate::bits_ext;

/// A connection ID chosen by the server. The wire format fixes this at 8
/// bytes; it is carried as a `u64` everywhere off the wire.
pub type ConnectionId = u64;

bits_ext!(SingleBit, crate::bits::BitsExt<u8>, 1, u8);
bits_ext!(TwoBits, crate::bits::BitsExt<u8>, 2, u8);
bits_ext!(SevenBits, crate::bits::BitsExt<u8>, 7, u8);
bits_ext!(HeaderForm, crate::bits::BitsExt<u8>, 1, u8);

impl HeaderForm {
    pub fn short() -> Self {
        Self::zero()
    }

    pub fn long() -> Self {
        Self::one()
    }
}

/// Long-header packet types (section 6). The wire byte is `0x80 | type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongHeaderType {
    VersionNegotiation = 1,
    ClientInitial = 2,
    ServerStatelessRetry = 3,
    ServerCleartext = 4,
    ClientCleartext = 5,
    ZeroRttProtected = 6,
    OneRttProtectedKp0 = 7,
    OneRttProtectedKp1 = 8,
    PublicReset = 9,
}

impl LongHeaderType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => LongHeaderType::VersionNegotiation,
            2 => LongHeaderType::ClientInitial,
            3 => LongHeaderType::ServerStatelessRetry,
            4 => LongHeaderType::ServerCleartext,
            5 => LongHeaderType::ClientCleartext,
            6 => LongHeaderType::ZeroRttProtected,
            7 => LongHeaderType::OneRttProtectedKp0,
            8 => LongHeaderType::OneRttProtectedKp1,
            9 => LongHeaderType::PublicReset,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn key_phase(self) -> KeyPhase {
        match self {
            LongHeaderType::OneRttProtectedKp0 => KeyPhase::OneRtt,
            LongHeaderType::OneRttProtectedKp1 => KeyPhase::OneRtt,
            LongHeaderType::ZeroRttProtected => KeyPhase::ZeroRtt,
            _ => KeyPhase::Unprotected,
        }
    }
}

/// Keying material in force for a given packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyPhase {
    Unknown,
    Unprotected,
    ZeroRtt,
    OneRtt,
}

/// Ciphersuites negotiated with the TLS collaborator (section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ciphersuite {
    Aes128GcmSha256 = 1,
    Aes256GcmSha384 = 2,
    ChaCha20Poly1305Sha256 = 3,
}

impl Ciphersuite {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Ciphersuite::Aes128GcmSha256,
            2 => Ciphersuite::Aes256GcmSha384,
            3 => Ciphersuite::ChaCha20Poly1305Sha256,
            _ => return None,
        })
    }
}
