//! End-to-end tests of a TCP session over loopback.
//!
//! # Purpose
//!
//! These tests start a real server with [`pv_server::server::start`] and talk
//! to it through a plain `TcpStream`, the way a client library would.  They
//! verify:
//!
//! - The connect sequence: the server's VERSION, then ACCESS_RIGHTS and
//!   CREATE_CHAN for a known name, CREATE_CH_FAIL for an unknown one.
//! - Get, put-with-completion and subscription updates against the
//!   in-memory data source.
//! - That a request naming an unknown server id gets an ERROR reply and the
//!   connection is closed.
//! - That dropping the connection releases every channel.

use std::sync::Arc;
use std::time::Duration;

use pv_core::protocol::codec::{decode_header, encode_message, encode_monitor_request, name_payload};
use pv_core::protocol::{event_mask, status, Command, Header, MonitorRequest, HEADER_SIZE};
use pv_server::application::data_source::{dbr, OpenAccess};
use pv_server::infrastructure::data::memory_source::{MemoryDataSource, PointValue};
use pv_server::infrastructure::storage::config::{InterfaceConfig, ServerConfig};
use pv_server::server::{self, ServerHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

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

async fn start_server() -> (ServerHandle, Arc<MemoryDataSource>) {
    let source = Arc::new(MemoryDataSource::new());
    source.add_point("temp", PointValue::Double(vec![20.5]));
    let handle = server::start(&loopback_config(), source.clone(), Arc::new(OpenAccess))
        .await
        .expect("server starts");
    (handle, source)
}

struct Client {
    stream: TcpStream,
}

impl Client {
    async fn connect(handle: &ServerHandle) -> Self {
        let stream = TcpStream::connect(handle.tcp_addrs()[0]).await.expect("connect");
        Self { stream }
    }

    async fn send(&mut self, header: Header, payload: &[u8]) {
        self.stream
            .write_all(&encode_message(&header, payload))
            .await
            .expect("write");
    }

    async fn recv(&mut self) -> (Header, Vec<u8>) {
        let mut raw = [0u8; HEADER_SIZE];
        tokio::time::timeout(TIMEOUT, self.stream.read_exact(&mut raw))
            .await
            .expect("reply in time")
            .expect("read header");
        let (header, _) = decode_header(&raw, false).expect("valid header");
        let mut payload = vec![0u8; header.payload_size as usize];
        self.stream.read_exact(&mut payload).await.expect("read payload");
        (header, payload)
    }

    /// VERSION, identity and CREATE_CHAN for `name`; returns the server id.
    async fn open_channel(&mut self, name: &str, cid: u32) -> u32 {
        self.send(Header::new(Command::Version).with_element_count(13), &[]).await;
        self.send(Header::new(Command::HostName), &name_payload("console")).await;
        self.send(Header::new(Command::ClientName), &name_payload("operator")).await;
        self.send(
            Header::new(Command::CreateChan).with_cid(cid).with_available(13),
            &name_payload(name),
        )
        .await;

        let (version, _) = self.recv().await;
        assert_eq!(version.command, Command::Version as u16);
        let (rights, _) = self.recv().await;
        assert_eq!(rights.command, Command::AccessRights as u16);
        assert_eq!(rights.cid, cid);
        assert_eq!(rights.available, 3, "read and write granted");
        let (created, _) = self.recv().await;
        assert_eq!(created.command, Command::CreateChan as u16);
        assert_eq!(created.cid, cid);
        assert_eq!(created.data_type, dbr::DOUBLE);
        assert_eq!(created.element_count, 1);
        created.available
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_then_read_notify_returns_value() {
    // Arrange
    let (handle, _source) = start_server().await;
    let mut client = Client::connect(&handle).await;
    let sid = client.open_channel("temp", 1).await;

    // Act
    client
        .send(
            Header::new(Command::ReadNotify)
                .with_data_type(dbr::DOUBLE)
                .with_element_count(1)
                .with_cid(sid)
                .with_available(77),
            &[],
        )
        .await;
    let (reply, payload) = client.recv().await;

    // Assert
    assert_eq!(reply.command, Command::ReadNotify as u16);
    assert_eq!(reply.cid, status::NORMAL);
    assert_eq!(reply.available, 77);
    assert_eq!(&payload[..8], &20.5f64.to_be_bytes());
    assert!(handle.context().registry().lookup(sid).is_some());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_name_gets_create_channel_failure() {
    // Arrange
    let (handle, _source) = start_server().await;
    let mut client = Client::connect(&handle).await;

    // Act
    client.send(Header::new(Command::Version).with_element_count(13), &[]).await;
    client
        .send(
            Header::new(Command::CreateChan).with_cid(9).with_available(13),
            &name_payload("no:such:point"),
        )
        .await;
    let (version, _) = client.recv().await;
    let (reply, _) = client.recv().await;

    // Assert
    assert_eq!(version.command, Command::Version as u16);
    assert_eq!(reply.command, Command::CreateChanFail as u16);
    assert_eq!(reply.cid, 9);
    assert_eq!(handle.context().stats().0, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_write_notify_completes_and_updates_point() {
    // Arrange
    let (handle, source) = start_server().await;
    let mut client = Client::connect(&handle).await;
    let sid = client.open_channel("temp", 1).await;

    // Act
    client
        .send(
            Header::new(Command::WriteNotify)
                .with_data_type(dbr::DOUBLE)
                .with_element_count(1)
                .with_cid(sid)
                .with_available(5),
            &7.25f64.to_be_bytes(),
        )
        .await;
    let (reply, _) = client.recv().await;

    // Assert
    assert_eq!(reply.command, Command::WriteNotify as u16);
    assert_eq!(reply.cid, status::NORMAL);
    assert_eq!(reply.available, 5);
    assert_eq!(source.point("temp").unwrap().value(), PointValue::Double(vec![7.25]));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_subscription_pushes_initial_value_and_changes() {
    // Arrange
    let (handle, source) = start_server().await;
    let mut client = Client::connect(&handle).await;
    let sid = client.open_channel("temp", 1).await;
    let monitor = encode_monitor_request(&MonitorRequest {
        mask: event_mask::VALUE,
        ..MonitorRequest::default()
    });

    // Act
    client
        .send(
            Header::new(Command::EventAdd)
                .with_data_type(dbr::DOUBLE)
                .with_element_count(1)
                .with_cid(sid)
                .with_available(42),
            &monitor,
        )
        .await;
    let (initial, initial_value) = client.recv().await;
    source.write_value("temp", PointValue::Double(vec![30.0])).unwrap();
    let (update, update_value) = client.recv().await;

    // Assert
    assert_eq!(initial.command, Command::EventAdd as u16);
    assert_eq!(initial.available, 42);
    assert_eq!(&initial_value[..8], &20.5f64.to_be_bytes());
    assert_eq!(update.available, 42);
    assert_eq!(&update_value[..8], &30.0f64.to_be_bytes());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_server_id_gets_error_and_disconnect() {
    // Arrange
    let (handle, _source) = start_server().await;
    let mut client = Client::connect(&handle).await;
    client.send(Header::new(Command::Version).with_element_count(13), &[]).await;

    // Act
    client
        .send(
            Header::new(Command::ReadNotify)
                .with_data_type(dbr::DOUBLE)
                .with_element_count(1)
                .with_cid(9999),
            &[],
        )
        .await;
    let (version, _) = client.recv().await;
    let (error, _) = client.recv().await;
    let mut byte = [0u8; 1];
    let eof = tokio::time::timeout(TIMEOUT, client.stream.read(&mut byte))
        .await
        .expect("connection closed in time");

    // Assert
    assert_eq!(version.command, Command::Version as u16);
    assert_eq!(error.command, Command::Error as u16);
    assert_eq!(error.available, status::INTERNAL);
    assert!(matches!(eof, Ok(0) | Err(_)));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_releases_every_channel() {
    // Arrange
    let (handle, _source) = start_server().await;
    let mut client = Client::connect(&handle).await;
    let sid = client.open_channel("temp", 1).await;
    assert_eq!(handle.context().stats(), (1, 1));

    // Act
    drop(client);

    // Assert
    let ctx = Arc::clone(handle.context());
    assert!(wait_until(|| ctx.stats() == (0, 0)).await, "session torn down");
    assert!(ctx.registry().lookup(sid).is_none());

    handle.shutdown().await;
}
