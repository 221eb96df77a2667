//! Host-facing configuration and event surface (section 6), the Rust
//! analogue of `mozquic_config_t` and the original's numeric event IDs.

use std::net::SocketAddr;

/// ALPN identifier this core negotiates; fixed per section 1.
pub const ALPN: &str = "hq-05";

/// The preferred and milestone protocol versions this core advertises.
pub const PREFERRED_VERSION: u32 = 0x0000_0005;
pub const MILESTONE_VERSION: u32 = 0x0000_0005;

pub type EventCallback = Box<dyn FnMut(Event) + Send>;

/// Configuration supplied by the host when starting a connection or
/// listener (section 6). Plain data, not loaded from a file or CLI: this
/// is an in-process library configuration, matching both the teacher and
/// the original source.
pub struct Config {
    pub origin_name: String,
    pub origin_port: u16,
    pub handle_io: bool,
    pub grease_version_negotiation: bool,
    pub prefer_milestone_version: bool,
    pub ignore_pki: bool,
    pub tolerate_bad_alpn: bool,
    pub app_handles_send_recv: bool,
    pub event_callback: Option<EventCallback>,
}

impl Config {
    pub fn new(origin_name: impl Into<String>, origin_port: u16) -> Self {
        Self {
            origin_name: origin_name.into(),
            origin_port,
            handle_io: true,
            grease_version_negotiation: false,
            prefer_milestone_version: false,
            ignore_pki: false,
            tolerate_bad_alpn: false,
            app_handles_send_recv: false,
            event_callback: None,
        }
    }

    pub fn preferred_version(&self) -> u32 {
        if self.prefer_milestone_version {
            MILESTONE_VERSION
        } else {
            PREFERRED_VERSION
        }
    }

    /// The version a client advertises in its first `CLIENT_INITIAL`:
    /// a grease value when `grease_version_negotiation` is set (to exercise
    /// the peer's version-negotiation path deliberately), the preferred
    /// version otherwise (section 4.F).
    pub fn initial_version(&self) -> u32 {
        if self.grease_version_negotiation {
            crate::primitives::rand::grease_version()
        } else {
            self.preferred_version()
        }
    }
}

/// Events delivered to the host callback (section 6). Numeric IDs are
/// preserved in the doc comments for traceability against the original
/// ABI; the Rust surface uses the enum discriminant instead of a raw int.
#[derive(Debug, Clone)]
pub enum Event {
    /// 0: new bytes are available for an application stream.
    NewStreamData { stream_id: u32 },
    /// 1: the peer reset a stream.
    StreamReset { stream_id: u32, error_code: u32 },
    /// 2: the handshake completed.
    Connected,
    /// 3: a server parent accepted a new child connection.
    AcceptNewConnection { connection_id: u64 },
    /// 4: the connection closed, locally or remotely.
    CloseConnection { error_code: u32 },
    /// 5: the driver wants control returned to the host until I/O is ready.
    Io,
    /// 6: an internal error caused a state change.
    Error { message: String },
    /// 7: a log line, mirroring `tracing` output for hosts without a
    /// subscriber of their own.
    Log { message: String },
    /// 8: `app_handles_send_recv` is set; the core emits this instead of
    /// calling `send_to` itself, so the host owns the socket.
    Transmit { to: SocketAddr, bytes: Vec<u8> },
    /// 9: mirrors the original ABI's `RECV` id. This port takes received
    /// datagrams as a direct argument to `Connection::supply_datagram`/
    /// `supply_datagram_from` rather than routing them back through this
    /// queue; kept for hosts that prefer to model their own loop as a
    /// uniform event stream.
    Recv { from: SocketAddr, bytes: Vec<u8> },
    /// 10: mirrors the original ABI's `TLSINPUT` id. This port's
    /// handshake bridge is the `TlsEngine` trait rather than an event
    /// (section 4.E/9); kept for the same reason as `Recv`.
    TlsInput { bytes: Vec<u8> },
}
