// Integration tests exercising real TcpListener/TcpStream pairs on 127.0.0.1.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use networking_toolkit::events::EventSink;
use networking_toolkit::tcp::{TcpClient, TcpClientOptions, TcpServer, TcpServerOptions};

#[derive(Default)]
struct RecordingSink {
    full_packets: Mutex<Vec<Vec<u8>>>,
    connected: Mutex<Vec<u64>>,
    max_clients_hit: Mutex<Vec<u64>>,
}

impl EventSink for RecordingSink {
    fn on_full_packet(&self, _connection_id: u64, packet: &[u8]) {
        self.full_packets.lock().unwrap().push(packet.to_vec());
    }

    fn on_connected(&self, connection_id: u64, _peer: Option<SocketAddr>) {
        self.connected.lock().unwrap().push(connection_id);
    }

    fn on_max_clients_reached(&self, connection_id: u64) {
        self.max_clients_hit.lock().unwrap().push(connection_id);
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not met in time");
}

#[tokio::test]
async fn echo_over_plain_tcp() {
    let server_sink = Arc::new(RecordingSink::default());
    let mut server = TcpServer::new(
        TcpServerOptions::new("127.0.0.1:0".parse().unwrap()),
        server_sink.clone(),
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let client_sink = Arc::new(RecordingSink::default());
    let mut client = TcpClient::new(addr.to_string(), TcpClientOptions::default(), client_sink.clone());
    client.connect().await.unwrap();

    client.send(b"HELLOWORLD").await.unwrap();
    wait_until(|| !server_sink.full_packets.lock().unwrap().is_empty()).await;
    assert_eq!(server_sink.full_packets.lock().unwrap()[0], b"HELLOWORLD");

    wait_until(|| server.client_count() == 1).await;
    let ids: Vec<u64> = server_sink.connected.lock().unwrap().clone();
    assert_eq!(ids.len(), 1);
    server.send(ids[0], b"Hello World!").await.unwrap();

    wait_until(|| !client_sink.full_packets.lock().unwrap().is_empty()).await;
    assert_eq!(client_sink.full_packets.lock().unwrap()[0], b"Hello World!");

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn two_packets_delivered_from_one_broadcast() {
    let server_sink = Arc::new(RecordingSink::default());
    let mut server = TcpServer::new(
        TcpServerOptions::new("127.0.0.1:0".parse().unwrap()),
        server_sink.clone(),
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let client_sink = Arc::new(RecordingSink::default());
    let mut client = TcpClient::new(addr.to_string(), TcpClientOptions::default(), client_sink.clone());
    client.connect().await.unwrap();
    wait_until(|| server.client_count() == 1).await;

    let ids: Vec<u64> = server_sink.connected.lock().unwrap().clone();
    server.send(ids[0], b"AAAA").await.unwrap();
    server.send(ids[0], b"BBBB").await.unwrap();

    wait_until(|| client_sink.full_packets.lock().unwrap().len() >= 2).await;
    let packets = client_sink.full_packets.lock().unwrap().clone();
    assert_eq!(packets[0], b"AAAA");
    assert_eq!(packets[1], b"BBBB");

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn max_clients_cap_rejects_the_second_connection() {
    let server_sink = Arc::new(RecordingSink::default());
    let mut server = TcpServer::new(
        TcpServerOptions::new("127.0.0.1:0".parse().unwrap()).with_max_clients(1),
        server_sink.clone(),
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut client_a = TcpClient::new(
        addr.to_string(),
        TcpClientOptions::default(),
        Arc::new(RecordingSink::default()),
    );
    client_a.connect().await.unwrap();
    wait_until(|| server.client_count() == 1).await;

    let mut client_b = TcpClient::new(
        addr.to_string(),
        TcpClientOptions::default(),
        Arc::new(RecordingSink::default()),
    );
    client_b.connect().await.unwrap();

    wait_until(|| !server_sink.max_clients_hit.lock().unwrap().is_empty()).await;
    assert_eq!(server.client_count(), 1);

    client_a.disconnect().await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_connected_client() {
    let server_sink = Arc::new(RecordingSink::default());
    let mut server = TcpServer::new(
        TcpServerOptions::new("127.0.0.1:0".parse().unwrap()),
        server_sink.clone(),
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let sink_a = Arc::new(RecordingSink::default());
    let sink_b = Arc::new(RecordingSink::default());
    let mut client_a = TcpClient::new(addr.to_string(), TcpClientOptions::default(), sink_a.clone());
    let mut client_b = TcpClient::new(addr.to_string(), TcpClientOptions::default(), sink_b.clone());
    client_a.connect().await.unwrap();
    client_b.connect().await.unwrap();
    wait_until(|| server.client_count() == 2).await;

    let results = server.send_all(b"broadcast").await;
    assert_eq!(results.len(), 2);
    for (_, result) in &results {
        assert!(result.is_ok());
    }

    wait_until(|| !sink_a.full_packets.lock().unwrap().is_empty() && !sink_b.full_packets.lock().unwrap().is_empty())
        .await;
    assert_eq!(sink_a.full_packets.lock().unwrap()[0], b"broadcast");
    assert_eq!(sink_b.full_packets.lock().unwrap()[0], b"broadcast");

    client_a.disconnect().await.unwrap();
    client_b.disconnect().await.unwrap();
}
