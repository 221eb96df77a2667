//! End-to-end scenarios driven over real loopback UDP sockets (section 8):
//! handshake completion, stream echo, and duplicate client-initial
//! deduplication.

mod common;

use common::{drive_until_connected, new_loopback_pair, only_child_id, tick_both};
use mini_quiche::connection::ConnectionState;
use mini_quiche::packet::packet::Packet;

#[tokio::test]
async fn client_and_server_reach_connected_state() {
    let (mut client, mut server) = new_loopback_pair().await;
    client.start_client();

    drive_until_connected(&mut client, &mut server, 200).await;

    assert_eq!(client.state, ConnectionState::ClientConnected);
    let child_id = only_child_id(&server).expect("server accepted a child");
    assert_eq!(server.child(child_id).unwrap().state, ConnectionState::ServerConnected);
}

#[tokio::test]
async fn application_stream_data_echoes_end_to_end() {
    let (mut client, mut server) = new_loopback_pair().await;
    client.start_client();
    drive_until_connected(&mut client, &mut server, 200).await;
    let child_id = only_child_id(&server).unwrap();

    let stream_id = client.open_stream();
    client.write(stream_id, b"hello from client", true).unwrap();

    let mut received = Vec::new();
    for _ in 0..100 {
        tick_both(&mut client, &mut server, 1).await;
        let child = server.child_mut(child_id).unwrap();
        let (bytes, fin) = child.read(stream_id, 4096).unwrap();
        received.extend(bytes);
        if fin {
            break;
        }
    }
    assert_eq!(received, b"hello from client");

    {
        let child = server.child_mut(child_id).unwrap();
        child.write(stream_id, b"hello from server", true).unwrap();
    }

    let mut echoed = Vec::new();
    for _ in 0..100 {
        tick_both(&mut client, &mut server, 1).await;
        let (bytes, fin) = client.read(stream_id, 4096).unwrap();
        echoed.extend(bytes);
        if fin {
            break;
        }
    }
    assert_eq!(echoed, b"hello from server");
}

#[tokio::test]
async fn duplicate_client_initial_does_not_spawn_a_second_child() {
    use mini_quiche::connection::config::PREFERRED_VERSION;
    use std::net::SocketAddr;
    use std::time::Instant;
    use tokio::net::UdpSocket;

    let (_client, mut server) = new_loopback_pair().await;
    let server_addr = server.local_addr().unwrap();

    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let sender = UdpSocket::bind(any).await.unwrap();

    let packet = Packet::client_initial(0x1234_5678, PREFERRED_VERSION, vec![]);
    let datagram = packet.encode();

    sender.send_to(&datagram, server_addr).await.unwrap();
    sender.send_to(&datagram, server_addr).await.unwrap();

    for _ in 0..5 {
        server.drive_tick(Instant::now()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    assert_eq!(server.children().len(), 1, "expected exactly one child for repeated initials");
}
