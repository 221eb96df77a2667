//! The TLS collaborator boundary (section 4.E). The core never implements
//! a handshake itself; it drives whatever `TlsEngine` the host supplies,
//! feeding it bytes pulled from stream 0 and scheduling whatever bytes the
//! engine wants sent back.

use crate::packet::types::Ciphersuite;

/// One tick's worth of input available to the engine: a pull-style
/// callback over the stream-0 reassembly buffer, the Rust analogue of the
/// original's pull-style `NSSInput` callback.
pub trait TlsInput {
    /// Pulls up to `amount` bytes of unconsumed handshake input.
    fn pull(&mut self, amount: usize) -> Vec<u8>;
}

/// A plain byte buffer implementing [`TlsInput`], used to wire a
/// connection's stream-0 `StreamIn` into the engine without exposing the
/// stream machinery to the TLS crate.
pub struct BufferedInput {
    buf: Vec<u8>,
}

impl BufferedInput {
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf }
    }
}

impl TlsInput for BufferedInput {
    fn pull(&mut self, amount: usize) -> Vec<u8> {
        let take = amount.min(self.buf.len());
        self.buf.drain(0..take).collect()
    }
}

/// Result of driving the engine for one tick (section 4.E).
pub enum TlsOutcome {
    /// The handshake is still in progress; carries bytes the engine wants
    /// sent this tick (may be empty if it is waiting on more input).
    Pending { output: Vec<u8> },
    /// The handshake is complete: negotiated ciphersuite, 48-byte send and
    /// receive traffic secrets, and any trailing handshake bytes still to
    /// be sent.
    Complete {
        ciphersuite: Ciphersuite,
        send_secret: [u8; 48],
        recv_secret: [u8; 48],
        output: Vec<u8>,
    },
    /// The engine rejected the handshake (bad ALPN, certificate failure,
    /// or any other crypto-layer error). The core closes the connection
    /// with `ErrorCode::Crypto` (section 7: "crypto errors close the
    /// connection").
    Failed { reason: String },
}

/// The external cryptographic collaborator (section 4.E). Implementations
/// are driven once per I/O tick while the connection is mid-handshake.
pub trait TlsEngine {
    fn drive(&mut self, input: &mut dyn TlsInput) -> TlsOutcome;
}

/// A loopback fake engine used by tests: exchanges a trivial
/// `"client-hello"` / `"server-hello"` handshake and immediately supplies
/// deterministic secrets (section 9: "tests use a loopback fake").
pub struct LoopbackTlsEngine {
    is_client: bool,
    sent_hello: bool,
}

impl LoopbackTlsEngine {
    pub fn client() -> Self {
        Self {
            is_client: true,
            sent_hello: false,
        }
    }

    pub fn server() -> Self {
        Self {
            is_client: false,
            sent_hello: false,
        }
    }
}

impl TlsEngine for LoopbackTlsEngine {
    fn drive(&mut self, input: &mut dyn TlsInput) -> TlsOutcome {
        let peer_bytes = input.pull(4096);

        if self.is_client {
            if !self.sent_hello {
                self.sent_hello = true;
                return TlsOutcome::Pending {
                    output: b"client-hello".to_vec(),
                };
            }
            if peer_bytes == b"server-hello" {
                return TlsOutcome::Complete {
                    ciphersuite: Ciphersuite::Aes128GcmSha256,
                    send_secret: [1u8; 48],
                    recv_secret: [2u8; 48],
                    output: Vec::new(),
                };
            }
            TlsOutcome::Pending { output: Vec::new() }
        } else {
            if peer_bytes == b"client-hello" {
                return TlsOutcome::Complete {
                    ciphersuite: Ciphersuite::Aes128GcmSha256,
                    send_secret: [2u8; 48],
                    recv_secret: [1u8; 48],
                    output: b"server-hello".to_vec(),
                };
            }
            TlsOutcome::Pending { output: Vec::new() }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loopback_engines_complete_a_round_trip_handshake() {
        let mut client = LoopbackTlsEngine::client();
        let mut server = LoopbackTlsEngine::server();

        let client_hello = match client.drive(&mut BufferedInput::new(vec![])) {
            TlsOutcome::Pending { output } => output,
            _ => panic!("client should not complete on first tick"),
        };

        let server_hello = match server.drive(&mut BufferedInput::new(client_hello)) {
            TlsOutcome::Complete { output, .. } => output,
            _ => panic!("server should complete upon receiving client hello"),
        };

        match client.drive(&mut BufferedInput::new(server_hello)) {
            TlsOutcome::Complete { send_secret, recv_secret, .. } => {
                assert_ne!(send_secret, recv_secret);
            }
            _ => panic!("client should complete upon receiving server hello"),
        }
    }
}
