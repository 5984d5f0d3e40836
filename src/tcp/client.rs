// ABOUTME: Dials a TCP endpoint, optionally upgrades to TLS, and runs the framing read loop

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionFlags, SharedWriter, split_connection};
use crate::error::{FramingError, TcpClientError, TlsError};
use crate::events::EventSink;
use crate::tls::TlsOptions;

/// Configuration for [`TcpClient`], built with `with_*` methods returning `Self`.
#[derive(Clone)]
pub struct TcpClientOptions {
    pub buffer_size: usize,
    pub is_length_in_one_frame: bool,
    pub ssl_target_host: Option<String>,
    pub idle_timeout: Option<Duration>,
    pub want_whole_packet: bool,
}

impl Default for TcpClientOptions {
    fn default() -> Self {
        TcpClientOptions {
            buffer_size: 4096,
            is_length_in_one_frame: false,
            ssl_target_host: None,
            idle_timeout: None,
            want_whole_packet: true,
        }
    }
}

impl TcpClientOptions {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_tls(mut self, target_host: impl Into<String>) -> Self {
        self.ssl_target_host = Some(target_host.into());
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

const CLIENT_CONNECTION_ID: u64 = 0;

/// A single outbound TCP connection, length-prefix framed.
pub struct TcpClient {
    addr: String,
    options: TcpClientOptions,
    tls: Option<TlsOptions>,
    sink: Arc<dyn EventSink>,
    writer: Option<SharedWriter>,
    flags: Option<Arc<ConnectionFlags>>,
    read_task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    last_connect_error: std::sync::Mutex<Option<TcpClientError>>,
}

impl TcpClient {
    pub fn new(addr: impl Into<String>, options: TcpClientOptions, sink: Arc<dyn EventSink>) -> Self {
        TcpClient {
            addr: addr.into(),
            options,
            tls: None,
            sink,
            writer: None,
            flags: None,
            read_task: None,
            connected: Arc::new(AtomicBool::new(false)),
            last_connect_error: std::sync::Mutex::new(None),
        }
    }

    pub fn with_tls_options(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn last_connect_error(&self) -> Option<String> {
        self.last_connect_error
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.to_string())
    }

    /// Dial the configured address, upgrade to TLS if requested, and spawn the read
    /// loop. Calling `connect()` again after a disconnect rebuilds the connection from
    /// scratch.
    pub async fn connect(&mut self) -> Result<(), TcpClientError> {
        let result = self.connect_inner().await;
        if let Err(err) = &result {
            *self.last_connect_error.lock().unwrap() = Some(clone_client_error(err));
        }
        result
    }

    async fn connect_inner(&mut self) -> Result<(), TcpClientError> {
        let tcp_stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| TcpClientError::Dial {
                addr: self.addr.clone(),
                source,
            })?;

        let boxed: crate::connection::BoxedStream = if let Some(tls) = &self.tls {
            let host = self
                .options
                .ssl_target_host
                .clone()
                .ok_or_else(|| TlsError::InvalidCertificate("no TLS target host configured".into()))?;
            let connector = tls.build_connector()?;
            let server_name = ServerName::try_from(host)
                .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?
                .to_owned();
            let tls_stream = connector
                .connect(server_name, tcp_stream)
                .await
                .map_err(TlsError::Handshake)?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp_stream)
        };

        let (writer, mut reader, flags) = split_connection(boxed, self.options.buffer_size);
        reader.idle_timeout = self.options.idle_timeout;
        flags
            .is_length_in_one_frame
            .store(self.options.is_length_in_one_frame, Ordering::Relaxed);

        let writer = Arc::new(AsyncMutex::new(writer));
        self.writer = Some(writer);
        self.flags = Some(flags);
        self.connected.store(true, Ordering::Relaxed);

        let sink = self.sink.clone();
        let connected_flag = self.connected.clone();
        let want_whole_packet = self.options.want_whole_packet;
        self.read_task = Some(tokio::spawn(async move {
            sink.on_connected(CLIENT_CONNECTION_ID, None);
            loop {
                match reader.next_event(want_whole_packet).await {
                    Ok(Some((event, full_packet))) => {
                        sink.on_fragment(CLIENT_CONNECTION_ID, event.offset, &event.window, event.completed);
                        if let Some(packet) = full_packet {
                            sink.on_full_packet(CLIENT_CONNECTION_ID, &packet);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        sink.on_receive_error(CLIENT_CONNECTION_ID, &err);
                        break;
                    }
                }
            }
            connected_flag.store(false, Ordering::Relaxed);
            sink.on_disconnected(CLIENT_CONNECTION_ID);
        }));

        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), TcpClientError> {
        if let Some(writer) = &self.writer {
            writer.lock().await.shutdown().await.map_err(TcpClientError::Framing)?;
        }
        if let Some(task) = self.read_task.take() {
            let _ = task.await;
        }
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Select a 64-bit header for the next inbound packet (the caller expects the peer
    /// to send a file next).
    pub fn expect_long_header(&self) {
        if let Some(flags) = &self.flags {
            flags.read_next_as_long.store(true, Ordering::Relaxed);
        }
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), TcpClientError> {
        let writer = self.writer.as_ref().ok_or(TcpClientError::NotConnected)?;
        writer
            .lock()
            .await
            .send_framed(payload)
            .await
            .map_err(TcpClientError::Framing)
    }

    pub async fn send_file(
        &self,
        body: impl AsyncRead + Unpin,
        file_len: u64,
        pre_buffer: Option<&[u8]>,
        post_buffer: Option<&[u8]>,
        pre_buffer_before_length: bool,
    ) -> Result<(), TcpClientError> {
        let writer = self.writer.as_ref().ok_or(TcpClientError::NotConnected)?;
        writer
            .lock()
            .await
            .send_file_framed(body, file_len, pre_buffer, post_buffer, pre_buffer_before_length)
            .await
            .map_err(TcpClientError::Framing)
    }
}

fn clone_client_error(err: &TcpClientError) -> TcpClientError {
    match err {
        TcpClientError::Dial { addr, source } => TcpClientError::Dial {
            addr: addr.clone(),
            source: std::io::Error::new(source.kind(), source.to_string()),
        },
        TcpClientError::Framing(FramingError::Io(e)) => {
            TcpClientError::Framing(FramingError::Io(std::io::Error::new(e.kind(), e.to_string())))
        }
        TcpClientError::Framing(FramingError::FrameTooLarge { length, max }) => {
            TcpClientError::Framing(FramingError::FrameTooLarge {
                length: *length,
                max: *max,
            })
        }
        TcpClientError::Framing(FramingError::ConnectionReset) => {
            TcpClientError::Framing(FramingError::ConnectionReset)
        }
        TcpClientError::Framing(FramingError::Tls(_)) | TcpClientError::Tls(_) => {
            TcpClientError::Tls(TlsError::InvalidCertificate("see original error".into()))
        }
        TcpClientError::NotConnected => TcpClientError::NotConnected,
    }
}
