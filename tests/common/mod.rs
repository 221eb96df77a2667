//! Shared helpers for driving a client/server pair over real loopback
//! sockets without relying on the background `Driver` task (avoids timing
//! races between the test assertions and the tick cadence).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mini_quiche::connection::{Config, Connection, ConnectionState};

pub fn test_config() -> Config {
    Config::new("example.test", 4433)
}

/// A freshly bound server parent and a client pointed at it.
pub async fn new_loopback_pair() -> (Connection, Connection) {
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let config = test_config();
    let server = Connection::new_server_parent(any, &config).await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = Connection::new_client(any, server_addr, &config).await.unwrap();
    (client, server)
}

/// Ticks both ends `iters` times, pausing briefly between ticks so
/// loopback datagrams sent this tick are visible to the peer's socket on
/// the next one.
pub async fn tick_both(client: &mut Connection, server: &mut Connection, iters: usize) {
    for _ in 0..iters {
        let now = Instant::now();
        client.drive_tick(now).await.unwrap();
        server.drive_tick(now).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// The connection ID of the sole child the server parent has accepted so
/// far, if any.
pub fn only_child_id(server: &Connection) -> Option<u64> {
    let mut ids = server.children().keys().copied();
    let id = ids.next()?;
    if ids.next().is_some() {
        panic!("expected exactly one child connection");
    }
    Some(id)
}

pub async fn drive_until_connected(client: &mut Connection, server: &mut Connection, max_iters: usize) {
    for _ in 0..max_iters {
        if client.state == ConnectionState::ClientConnected {
            if let Some(id) = only_child_id(server) {
                if server.child(id).unwrap().state == ConnectionState::ServerConnected {
                    return;
                }
            }
        }
        tick_both(client, server, 1).await;
    }
    panic!("handshake did not complete within {max_iters} ticks");
}
