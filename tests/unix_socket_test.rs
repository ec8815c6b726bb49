//! Hub and clients over a real Unix domain socket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use urnet::packet::{Packet, PacketType, SpecialType};
use urnet::socket::framing::{Frame, FrameDecoder};
use urnet::socket::unix::{self, UnixSocketServer};
use urnet::{Address, AddressAllocator, Channel, Endpoint, MessageHandler, NetError, Role};

fn start_hub(dir: &TempDir) -> (Endpoint, UnixSocketServer) {
    let hub = Endpoint::new("hub", Arc::new(AddressAllocator::new()));
    hub.config_as_server(Some("SRV001")).unwrap();
    hub.add_message_handler(
        "SRV:ECHO",
        MessageHandler::from_fn(|p| Ok(p.unwrap_or_default())),
    )
    .unwrap();
    let server = UnixSocketServer::start(dir.path().join("hub.sock"), hub.clone()).unwrap();
    (hub, server)
}

fn client(name: &str) -> Endpoint {
    Endpoint::new(name, Arc::new(AddressAllocator::new()))
}

#[tokio::test]
async fn test_call_over_unix_socket() {
    let dir = TempDir::new().unwrap();
    let (hub, server) = start_hub(&dir);

    let ep = client("cli");
    let addr = unix::connect(server.socket_path(), &ep, None).await.unwrap();
    assert_eq!(addr.as_str(), "UR_001");
    assert_eq!(ep.role(), Role::Client);
    assert_eq!(hub.client_name(&addr).as_deref(), Some("cli"));

    let out = ep.call("SRV:ECHO", Some(json!({"hello": "world"}))).await.unwrap();
    assert_eq!(out, Some(json!({"hello": "world"})));

    server.shutdown();
}

#[tokio::test]
async fn test_clients_reach_each_other_through_hub() {
    let dir = TempDir::new().unwrap();
    let (_hub, server) = start_hub(&dir);

    let worker = client("worker");
    worker
        .add_message_handler(
            "NET:UPPER",
            MessageHandler::from_fn(|p| {
                let text = p.as_ref().and_then(|v| v.as_str()).unwrap_or_default();
                Ok(json!(text.to_uppercase()))
            }),
        )
        .unwrap();
    let worker_addr = unix::connect(server.socket_path(), &worker, None).await.unwrap();

    let caller = client("caller");
    unix::connect(server.socket_path(), &caller, None).await.unwrap();

    assert_eq!(caller.ping("NET:UPPER").await.unwrap(), vec![worker_addr]);
    assert_eq!(
        caller.call("NET:UPPER", Some(json!("quiet"))).await.unwrap(),
        Some(json!("QUIET"))
    );
}

#[tokio::test]
async fn test_dropped_stream_removes_client() {
    let dir = TempDir::new().unwrap();
    let (hub, server) = start_hub(&dir);

    let mut stream = UnixStream::connect(server.socket_path()).await.unwrap();
    let auth = Packet::special(1, SpecialType::Auth, json!({}), Address::unroutable());
    stream
        .write_all(&Frame::from_packet(&auth).unwrap().encode())
        .await
        .unwrap();
    let mut buf = [0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(n > 0);
    assert_eq!(hub.client_addresses().len(), 1);

    drop(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(hub.client_addresses().is_empty());
}

#[tokio::test]
async fn test_connect_without_hub_fails() {
    let dir = TempDir::new().unwrap();
    let ep = client("cli");
    let err = unix::connect(&dir.path().join("missing.sock"), &ep, None)
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Io(_)), "{err:?}");
    assert_eq!(ep.role(), Role::Unconfigured);
}

/// Read frames until one packet arrives.
async fn next_packet(stream: &mut UnixStream, decoder: &mut FrameDecoder) -> Packet {
    let mut buf = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("Timed out")
            .expect("Read failed");
        assert!(n > 0, "hub closed the stream");
        if let Some(Frame::Packet(bytes)) = decoder.feed(&buf[..n]).unwrap().into_iter().next() {
            return Packet::from_slice(&bytes).unwrap();
        }
    }
}

#[tokio::test]
async fn test_bad_packets_are_dropped_and_connection_survives() {
    let dir = TempDir::new().unwrap();
    let (hub, server) = start_hub(&dir);

    let mut stream = UnixStream::connect(server.socket_path()).await.unwrap();
    let mut decoder = FrameDecoder::new();
    let auth = Packet::special(1, SpecialType::Auth, json!({}), Address::unroutable());
    stream
        .write_all(&Frame::from_packet(&auth).unwrap().encode())
        .await
        .unwrap();
    let welcome = next_packet(&mut stream, &mut decoder)
        .await
        .into_result()
        .unwrap()
        .unwrap();
    let addr: Address = welcome["uaddr"].as_str().unwrap().parse().unwrap();

    // not JSON
    stream
        .write_all(&Frame::Packet(b"{not json".to_vec()).encode())
        .await
        .unwrap();
    // valid JSON, bad message grammar
    let mut bad_name =
        Packet::request(2, PacketType::Call, Channel::Srv, "ECHO", None, addr.clone());
    bad_name.name = "echo".into();
    stream
        .write_all(&Frame::Packet(serde_json::to_vec(&bad_name).unwrap()).encode())
        .await
        .unwrap();
    // claims another client's address
    let spoofed = Packet::request(
        3,
        PacketType::Call,
        Channel::Srv,
        "ECHO",
        Some(json!("spoof")),
        "UR_999".parse().unwrap(),
    );
    stream
        .write_all(&Frame::from_packet(&spoofed).unwrap().encode())
        .await
        .unwrap();
    let honest = Packet::request(
        4,
        PacketType::Call,
        Channel::Srv,
        "ECHO",
        Some(json!("ok")),
        addr.clone(),
    );
    stream
        .write_all(&Frame::from_packet(&honest).unwrap().encode())
        .await
        .unwrap();

    // the first reply after the junk answers the honest call
    let reply = next_packet(&mut stream, &mut decoder).await;
    assert_eq!(reply.hash(), honest.hash());
    assert_eq!(reply.into_result().unwrap(), Some(json!("ok")));
    assert_eq!(hub.client_addresses(), vec![addr]);
}
