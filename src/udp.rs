// ABOUTME: Single-socket UDP datagram send/receive handler
// ABOUTME: Structural analogue of tcp::client's read-loop-as-task shape, without framing

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::UdpError;
use crate::events::EventSink;

const MAX_DATAGRAM_SIZE: usize = 65_507;

/// A single bound UDP socket with a togglable receive loop.
pub struct UdpHandler {
    local_addr: SocketAddr,
    sink: Arc<dyn EventSink>,
    socket: Option<Arc<UdpSocket>>,
    listening: Arc<AtomicBool>,
    listen_task: Option<JoinHandle<()>>,
}

impl UdpHandler {
    pub async fn bind(local_addr: SocketAddr, sink: Arc<dyn EventSink>) -> Result<Self, UdpError> {
        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(|source| UdpError::Bind {
                addr: local_addr.to_string(),
                source,
            })?;
        Ok(UdpHandler {
            local_addr,
            sink,
            socket: Some(Arc::new(socket)),
            listening: Arc::new(AtomicBool::new(false)),
            listen_task: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send(&self, datagram: &[u8], to: SocketAddr) -> Result<(), UdpError> {
        let socket = self.socket.as_ref().ok_or(UdpError::NotListening)?;
        socket.send_to(datagram, to).await?;
        Ok(())
    }

    /// Start or stop the receive loop. Idempotent with respect to the current state.
    /// Disabling drops the bound socket entirely (so `send` also fails until the next
    /// `listen(true)`); enabling rebinds a fresh socket to the same local endpoint.
    pub async fn listen(&mut self, enable: bool) -> Result<(), UdpError> {
        if enable == self.listening.load(Ordering::SeqCst) {
            return Ok(());
        }

        if enable {
            // Drop any existing binding first: `bind()` leaves one in place even before the
            // first `listen(true)`, and rebinding to the same address while it is still held
            // would fail with "address in use".
            self.socket = None;
            let socket = UdpSocket::bind(self.local_addr)
                .await
                .map_err(|source| UdpError::Bind {
                    addr: self.local_addr.to_string(),
                    source,
                })?;
            let socket = Arc::new(socket);
            self.socket = Some(socket.clone());
            self.listening.store(true, Ordering::SeqCst);
            let listening = self.listening.clone();
            let sink = self.sink.clone();
            self.listen_task = Some(tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                while listening.load(Ordering::SeqCst) {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, from)) => sink.on_datagram(&buf[..n], from),
                        Err(err) => {
                            sink.on_udp_error(&UdpError::Io(err));
                            listening.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }));
        } else {
            self.listening.store(false, Ordering::SeqCst);
            if let Some(task) = self.listen_task.take() {
                task.abort();
            }
            self.socket = None;
        }
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}
