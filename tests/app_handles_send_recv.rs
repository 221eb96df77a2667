//! `appHandlesSendRecv` (section 4.E/6): the host relays datagrams itself
//! via `Event::Transmit`/`Connection::supply_datagram*` instead of the
//! core touching a socket directly. Ticks both ends, shuttling each
//! `Transmit` event to the other side's intake method, until the
//! handshake completes exactly as it would in the default socket-owning
//! mode (mirrors scenario 1 in section 8).

use std::net::SocketAddr;
use std::time::Instant;

use mini_quiche::connection::{Config, Connection, ConnectionState, Event};

fn app_handles_send_recv_config() -> Config {
    let mut config = Config::new("example.test", 4433);
    config.app_handles_send_recv = true;
    config
}

#[tokio::test]
async fn handshake_completes_when_the_host_relays_every_datagram() {
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server_config = app_handles_send_recv_config();
    let mut server = Connection::new_server_parent(any, &server_config).await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let client_config = app_handles_send_recv_config();
    let mut client = Connection::new_client(any, server_addr, &client_config).await.unwrap();
    let client_addr = client.local_addr().unwrap();
    client.start_client();

    let mut child_id = None;

    for _ in 0..200 {
        let now = Instant::now();

        client.drive_tick(now).await.unwrap();
        for event in client.drain_events() {
            if let Event::Transmit { bytes, .. } = event {
                server.supply_datagram_from(bytes, client_addr, now).await.unwrap();
            }
        }

        server.drive_tick(now).await.unwrap();
        for event in server.drain_events() {
            if let Event::AcceptNewConnection { connection_id } = event {
                child_id = Some(connection_id);
            }
        }
        if let Some(id) = child_id {
            let child = server.child_mut(id).unwrap();
            for event in child.drain_events() {
                if let Event::Transmit { bytes, .. } = event {
                    client.supply_datagram(bytes, now).unwrap();
                }
            }
        }

        if client.state == ConnectionState::ClientConnected {
            if let Some(id) = child_id {
                if server.child(id).unwrap().state == ConnectionState::ServerConnected {
                    return;
                }
            }
        }
    }

    panic!("handshake did not complete within 200 relayed ticks");
}
