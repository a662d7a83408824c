//! End-to-end tests of name discovery and beacons over loopback.
//!
//! A real server is started on 127.0.0.1 with an ephemeral port.  Search
//! requests are sent from a tokio `UdpSocket`; beacons are received on a
//! socket whose address is configured as the only beacon destination.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pv_core::protocol::codec::{decode_message, encode_message, name_payload};
use pv_core::protocol::{Beacon, Command, Header, DO_REPLY, MINOR_PROTOCOL_REVISION};
use pv_server::application::data_source::OpenAccess;
use pv_server::infrastructure::data::memory_source::{MemoryDataSource, PointValue};
use pv_server::infrastructure::storage::config::{InterfaceConfig, ServerConfig};
use pv_server::server::{self, ServerHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

const TIMEOUT: Duration = Duration::from_secs(2);

fn loopback_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.port = 0;
    config.network.interfaces = vec![InterfaceConfig {
        address: "127.0.0.1".into(),
        broadcast: None,
    }];
    config.beacon.auto_addr_mode = "NO".into();
    config
}

async fn start_server(config: &ServerConfig) -> ServerHandle {
    let source = MemoryDataSource::new();
    source.add_point("temp", PointValue::Double(vec![20.5]));
    server::start(config, Arc::new(source), Arc::new(OpenAccess))
        .await
        .expect("server starts")
}

fn search_datagram(name: &str, cid: u32, seq_no: u32) -> Vec<u8> {
    let version = Header::new(Command::Version)
        .with_element_count(u32::from(MINOR_PROTOCOL_REVISION))
        .with_cid(seq_no);
    let search = Header::new(Command::Search)
        .with_data_type(DO_REPLY)
        .with_element_count(u32::from(MINOR_PROTOCOL_REVISION))
        .with_cid(cid)
        .with_available(cid);
    let mut bytes = encode_message(&version, &[]);
    bytes.extend(encode_message(&search, &name_payload(name)));
    bytes
}

/// Sends one search and returns the SEARCH reply, if any arrives in time.
async fn search(client: &UdpSocket, server: SocketAddr, name: &str, cid: u32) -> Option<Header> {
    client
        .send_to(&search_datagram(name, cid, 1), server)
        .await
        .expect("send search");
    let mut buf = [0u8; 1024];
    let (n, _) = tokio::time::timeout(TIMEOUT, client.recv_from(&mut buf))
        .await
        .ok()?
        .expect("recv");
    let (version, _, used) = decode_message(&buf[..n], false).expect("version header");
    assert_eq!(version.command, Command::Version as u16);
    let (reply, _, _) = decode_message(&buf[used..n], false).expect("search reply");
    Some(reply)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_search_hit_returns_tcp_port_and_fresh_server_id() {
    // Arrange
    let handle = start_server(&loopback_config()).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp = handle.udp_addrs()[0];

    // Act
    let first = search(&client, udp, "temp", 7).await.expect("first reply");
    let second = search(&client, udp, "temp", 8).await.expect("second reply");

    // Assert
    assert_eq!(first.command, Command::Search as u16);
    assert_eq!(first.available, 7);
    assert_eq!(first.data_type, handle.tcp_addrs()[0].port());
    assert_eq!(second.available, 8);
    assert_ne!(first.cid, second.cid, "each hit gets its own server id");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_search_miss_is_not_answered() {
    // Arrange
    let handle = start_server(&loopback_config()).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Act
    let reply = search(&client, handle.udp_addrs()[0], "no:such:point", 3).await;

    // Assert
    assert!(reply.is_none());
    assert_eq!(handle.context().registry().channel_count(), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_create_channel_adopts_searched_server_id() {
    // Arrange
    let handle = start_server(&loopback_config()).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let found = search(&client, handle.udp_addrs()[0], "temp", 7).await.expect("reply");
    let mut stream = TcpStream::connect(handle.tcp_addrs()[0]).await.unwrap();

    // Act
    let mut request = encode_message(&Header::new(Command::Version).with_element_count(13), &[]);
    request.extend(encode_message(
        &Header::new(Command::CreateChan).with_cid(7).with_available(13),
        &name_payload("temp"),
    ));
    stream.write_all(&request).await.unwrap();
    let mut replies = vec![0u8; 48];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut replies))
        .await
        .expect("replies in time")
        .unwrap();

    // Assert
    let (_, _, used) = decode_message(&replies, false).unwrap();
    let (rights, _, more) = decode_message(&replies[used..], false).unwrap();
    let (created, _, _) = decode_message(&replies[used + more..], false).unwrap();
    assert_eq!(rights.command, Command::AccessRights as u16);
    assert_eq!(created.command, Command::CreateChan as u16);
    assert_eq!(created.available, found.cid, "server id carried over from the search");
    assert_eq!(handle.context().registry().channel_count(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_beacons_carry_the_server_tcp_port() {
    // Arrange
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = loopback_config();
    config.beacon.addresses = vec![receiver.local_addr().unwrap().to_string()];

    // Act
    let handle = start_server(&config).await;
    let mut buf = [0u8; 128];
    let mut beacons = Vec::new();
    for _ in 0..2 {
        let (n, _) = tokio::time::timeout(TIMEOUT, receiver.recv_from(&mut buf))
            .await
            .expect("beacon in the fast phase")
            .unwrap();
        beacons.push(Beacon::decode(&buf[..n]).unwrap());
    }
    let (first, second) = (beacons[0], beacons[1]);

    // Assert
    let port = handle.tcp_addrs()[0].port();
    assert_eq!(first.server_port, port);
    assert_eq!(second.server_port, port);
    assert_eq!(first.beacon_id.wrapping_add(1), second.beacon_id);

    handle.shutdown().await;
}
