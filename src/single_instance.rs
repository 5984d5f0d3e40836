// ABOUTME: TCP client+server pair used to detect an already-running peer and hand off CLI args
// ABOUTME: Wire sub-protocol: length-prefixed arg count (LE payload) then one message per argument

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{SingleInstanceError, TcpClientError};
use crate::events::EventSink;
use crate::tcp::{TcpClient, TcpClientOptions, TcpServer, TcpServerOptions};

/// Detects whether another process already holds the coordinator's port and, if so,
/// forwards this process's command-line arguments to it instead of starting a second
/// listener.
pub struct SingleInstanceCoordinator {
    is_single: bool,
    client: TcpClient,
    server: Option<TcpServer>,
}

impl SingleInstanceCoordinator {
    /// `try_timeout` bounds how long the initial probe connection waits before
    /// concluding no peer is listening. `read_timeout` is the idle timeout applied to
    /// the listening server's incoming connections (a peer that opens a connection and
    /// never finishes sending its arguments is eventually dropped).
    pub async fn new(
        port: u16,
        args: Vec<String>,
        sink: Arc<dyn EventSink>,
        try_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, SingleInstanceError> {
        let addr = format!("127.0.0.1:{port}");
        let mut client = TcpClient::new(addr.clone(), TcpClientOptions::default(), sink.clone());

        let is_single = match tokio::time::timeout(try_timeout, client.connect()).await {
            Err(_elapsed) => true,
            Ok(Ok(())) => false,
            Ok(Err(_)) => true,
        };

        let mut server = None;
        if is_single {
            let bind_addr: SocketAddr = addr.parse().expect("127.0.0.1:port always parses");
            let mut options = TcpServerOptions::new(bind_addr);
            options.idle_timeout = Some(read_timeout);
            let instance_sink: Arc<dyn EventSink> = Arc::new(SingleInstanceSink::new(sink.clone()));
            let mut srv = TcpServer::new(options, instance_sink);
            srv.start().await.map_err(SingleInstanceError::Server)?;
            server = Some(srv);
        } else {
            send_arguments(&client, &args).await.map_err(SingleInstanceError::Client)?;
            client.disconnect().await.map_err(SingleInstanceError::Client)?;
        }

        Ok(SingleInstanceCoordinator {
            is_single,
            client,
            server,
        })
    }

    pub fn is_single(&self) -> bool {
        self.is_single
    }

    pub async fn dispose(&mut self) {
        if let Some(server) = &mut self.server {
            server.stop();
            server.disconnect_all().await;
        }
        let _ = self.client.disconnect().await;
    }
}

async fn send_arguments(client: &TcpClient, args: &[String]) -> Result<(), TcpClientError> {
    let count = args.len() as u32;
    client.send(&count.to_le_bytes()).await?;
    for arg in args {
        let utf16_le: Vec<u8> = arg.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();
        client.send(&utf16_le).await?;
    }
    Ok(())
}

struct InstanceInfo {
    expected_arg_count: Option<u32>,
    received_args: Vec<String>,
}

/// Assembles the wire sub-protocol on the listening side: the first whole-packet
/// delivery on a connection is the 4-byte little-endian argument count, stored into
/// `expected_arg_count` and used to know when all arguments have arrived, rather than
/// relying on the peer's disconnect alone.
struct SingleInstanceSink {
    inner: Arc<dyn EventSink>,
    states: DashMap<u64, InstanceInfo>,
}

impl SingleInstanceSink {
    fn new(inner: Arc<dyn EventSink>) -> Self {
        SingleInstanceSink {
            inner,
            states: DashMap::new(),
        }
    }
}

impl EventSink for SingleInstanceSink {
    fn on_connected(&self, connection_id: u64, peer: Option<SocketAddr>) {
        self.states.insert(
            connection_id,
            InstanceInfo {
                expected_arg_count: None,
                received_args: Vec::new(),
            },
        );
        self.inner.on_connected(connection_id, peer);
    }

    fn on_full_packet(&self, connection_id: u64, packet: &[u8]) {
        let mut completed_args: Option<Vec<String>> = None;

        if let Some(mut state) = self.states.get_mut(&connection_id) {
            if state.expected_arg_count.is_none() {
                if packet.len() == 4 {
                    let count = u32::from_le_bytes(packet.try_into().unwrap());
                    state.expected_arg_count = Some(count);
                    if count == 0 {
                        completed_args = Some(Vec::new());
                    }
                }
            } else {
                let units: Vec<u16> = packet
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                state.received_args.push(String::from_utf16_lossy(&units));
                if Some(state.received_args.len() as u32) == state.expected_arg_count {
                    completed_args = Some(state.received_args.clone());
                }
            }
        }

        if let Some(args) = completed_args {
            self.states.remove(&connection_id);
            self.inner.on_arguments_received(&args);
        }
        self.inner.on_full_packet(connection_id, packet);
    }

    fn on_disconnected(&self, connection_id: u64) {
        self.states.remove(&connection_id);
        self.inner.on_disconnected(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        received: Mutex<Vec<Vec<String>>>,
    }

    impl EventSink for CollectingSink {
        fn on_arguments_received(&self, args: &[String]) {
            self.received.lock().unwrap().push(args.to_vec());
        }
    }

    #[test]
    fn assembles_args_across_packets_in_order() {
        let inner = Arc::new(CollectingSink::default());
        let sink = SingleInstanceSink::new(inner.clone());
        sink.on_connected(1, None);
        sink.on_full_packet(1, &2u32.to_le_bytes());
        let a: Vec<u8> = "foo".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let b: Vec<u8> = "bar".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        sink.on_full_packet(1, &a);
        assert!(inner.received.lock().unwrap().is_empty());
        sink.on_full_packet(1, &b);

        let received = inner.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn zero_argument_count_completes_immediately() {
        let inner = Arc::new(CollectingSink::default());
        let sink = SingleInstanceSink::new(inner.clone());
        sink.on_connected(7, None);
        sink.on_full_packet(7, &0u32.to_le_bytes());
        assert_eq!(inner.received.lock().unwrap().as_slice(), &[Vec::<String>::new()]);
    }
}
