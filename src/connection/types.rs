/// Which side of the handshake a connection plays (section 4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    ServerParent,
    ServerChild,
}

/// The state machine driving a connection from creation to teardown
/// (section 4.F). Client and server states share the same enum since they
/// never cross-apply to the wrong role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    ClientStart,
    Client0Rtt,
    Client1Rtt,
    ClientConnected,
    ClientClosed,
    ServerListen,
    Server0Rtt,
    Server1Rtt,
    ServerConnected,
    ServerClosed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::ClientConnected | ConnectionState::ServerConnected
        )
    }

    pub fn is_closed(self) -> bool {
        matches!(
            self,
            ConnectionState::ClientClosed | ConnectionState::ServerClosed
        )
    }

    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            ConnectionState::Client0Rtt
                | ConnectionState::Client1Rtt
                | ConnectionState::Server0Rtt
                | ConnectionState::Server1Rtt
        )
    }
}
