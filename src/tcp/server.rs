// ABOUTME: Accept loop, concurrent client registry, and broadcast for the TCP framing engine
// ABOUTME: Registry is a DashMap keyed by connection id, shared between the accept loop and senders

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionFlags, SharedWriter, split_connection};
use crate::error::{TcpServerError, TlsError};
use crate::events::EventSink;
use crate::keyed_mutex::KeyedMutex;
use crate::tls::TlsOptions;

/// Configuration for [`TcpServer`]. `max_clients` defaults to uncapped.
#[derive(Clone)]
pub struct TcpServerOptions {
    pub bind_addr: SocketAddr,
    pub max_clients: usize,
    pub buffer_size: usize,
    pub is_length_in_one_frame: bool,
    pub idle_timeout: Option<Duration>,
    pub want_whole_packet: bool,
}

impl TcpServerOptions {
    pub fn new(bind_addr: SocketAddr) -> Self {
        TcpServerOptions {
            bind_addr,
            max_clients: usize::MAX,
            buffer_size: 4096,
            is_length_in_one_frame: false,
            idle_timeout: None,
            want_whole_packet: true,
        }
    }

    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }
}

struct RegisteredClient {
    writer: SharedWriter,
    flags: Arc<ConnectionFlags>,
}

/// A TCP server accepting connections, capping concurrent clients, and broadcasting to
/// all of them. Each accepted connection runs its own read-loop task; the registry of
/// live connections is a concurrent `DashMap` keyed by connection id.
pub struct TcpServer {
    options: TcpServerOptions,
    tls: Option<TlsOptions>,
    sink: Arc<dyn EventSink>,
    clients: Arc<DashMap<u64, RegisteredClient>>,
    write_lock: Arc<KeyedMutex<u64>>,
    next_id: Arc<AtomicU64>,
    admitted: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    accept_task: Option<JoinHandle<()>>,
    bound_addr: Option<SocketAddr>,
}

impl TcpServer {
    pub fn new(options: TcpServerOptions, sink: Arc<dyn EventSink>) -> Self {
        TcpServer {
            options,
            tls: None,
            sink,
            clients: Arc::new(DashMap::new()),
            write_lock: Arc::new(KeyedMutex::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            admitted: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            accept_task: None,
            bound_addr: None,
        }
    }

    /// The address actually bound by `start()` — useful when `bind_addr` was
    /// `:0` (ephemeral port), as in tests.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    pub fn with_tls_options(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Start accepting connections. Idempotent — calling twice while running is a
    /// no-op error.
    pub async fn start(&mut self) -> Result<(), TcpServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TcpServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.options.bind_addr)
            .await
            .map_err(|source| TcpServerError::Bind {
                addr: self.options.bind_addr.to_string(),
                source,
            })?;
        self.bound_addr = listener.local_addr().ok();

        let options = self.options.clone();
        let tls = self.tls.clone();
        let sink = self.sink.clone();
        let clients = self.clients.clone();
        let write_lock = self.write_lock.clone();
        let next_id = self.next_id.clone();
        let admitted = self.admitted.clone();
        let running = self.running.clone();

        self.accept_task = Some(tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        continue;
                    }
                };

                // Cheap, racy pre-check: avoids the cost of a TLS handshake when the
                // server is already clearly full. The authoritative, race-free check is
                // the atomic reservation in `handle_accepted`.
                if admitted.load(Ordering::SeqCst) >= options.max_clients {
                    let id = next_id.fetch_add(1, Ordering::SeqCst);
                    sink.on_max_clients_reached(id);
                    drop(stream);
                    continue;
                }

                let id = next_id.fetch_add(1, Ordering::SeqCst);
                let options = options.clone();
                let tls = tls.clone();
                let sink = sink.clone();
                let clients = clients.clone();
                let admitted = admitted.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_accepted(id, stream, Some(peer), options, tls, sink.clone(), clients.clone(), admitted.clone())
                            .await
                    {
                        tracing::warn!(connection_id = id, %err, "connection setup failed");
                        sink.on_disconnected(id);
                    }
                    if clients.remove(&id).is_some() {
                        admitted.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        }));

        Ok(())
    }

    /// Stop accepting new connections. Already-running per-connection tasks keep
    /// going until their peers disconnect or `disconnect_all` is called.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }

    pub async fn disconnect_client(&self, id: u64) -> Result<(), TcpServerError> {
        let client = self.clients.get(&id).ok_or(TcpServerError::UnknownClient(id))?;
        client
            .writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(TcpServerError::Framing)
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<u64> = self.clients.iter().map(|e| *e.key()).collect();
        for id in ids {
            let _ = self.disconnect_client(id).await;
        }
    }

    pub async fn send(&self, id: u64, payload: &[u8]) -> Result<(), TcpServerError> {
        send_to(&self.clients, &self.write_lock, id, payload).await
    }

    /// Broadcast to every currently registered client. Offers no cross-connection
    /// ordering: each client's send runs independently (as its own task), serialized
    /// only against other sends to that same client.
    pub async fn send_all(&self, payload: &[u8]) -> Vec<(u64, Result<(), TcpServerError>)> {
        let ids: Vec<u64> = self.clients.iter().map(|e| *e.key()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let clients = self.clients.clone();
            let write_lock = self.write_lock.clone();
            let payload = payload.to_vec();
            handles.push(tokio::spawn(async move {
                let result = send_to(&clients, &write_lock, id, &payload).await;
                (id, result)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(pair) = handle.await {
                results.push(pair);
            }
        }
        results
    }

    pub fn expect_long_header(&self, id: u64) -> Result<(), TcpServerError> {
        let client = self.clients.get(&id).ok_or(TcpServerError::UnknownClient(id))?;
        client.flags.read_next_as_long.store(true, Ordering::Relaxed);
        Ok(())
    }
}

async fn send_to(
    clients: &DashMap<u64, RegisteredClient>,
    write_lock: &KeyedMutex<u64>,
    id: u64,
    payload: &[u8],
) -> Result<(), TcpServerError> {
    let writer = {
        let client = clients.get(&id).ok_or(TcpServerError::UnknownClient(id))?;
        client.writer.clone()
    };
    let _guard = write_lock.acquire(id).await;
    writer
        .lock()
        .await
        .send_framed(payload)
        .await
        .map_err(TcpServerError::Framing)
}

async fn handle_accepted(
    id: u64,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    options: TcpServerOptions,
    tls: Option<TlsOptions>,
    sink: Arc<dyn EventSink>,
    clients: Arc<DashMap<u64, RegisteredClient>>,
    admitted: Arc<AtomicUsize>,
) -> Result<(), TcpServerError> {
    let boxed: crate::connection::BoxedStream = if let Some(tls) = &tls {
        let acceptor = tls.build_acceptor()?;
        let tls_stream = acceptor.accept(stream).await.map_err(TlsError::Handshake)?;
        Box::new(tls_stream)
    } else {
        Box::new(stream)
    };

    let (writer, mut reader, flags) = split_connection(boxed, options.buffer_size);
    reader.idle_timeout = options.idle_timeout;
    flags
        .is_length_in_one_frame
        .store(options.is_length_in_one_frame, Ordering::Relaxed);

    // Atomically reserve a slot: compare-and-swap on `admitted` so two connections that
    // both observed the cap as not-yet-reached cannot both win. Exactly one of them
    // inserts into `clients`; the CAS is the single point of truth, not `clients.len()`.
    loop {
        let current = admitted.load(Ordering::SeqCst);
        if current >= options.max_clients {
            sink.on_max_clients_reached(id);
            return Ok(());
        }
        if admitted
            .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }

    let writer = Arc::new(AsyncMutex::new(writer));
    clients.insert(id, RegisteredClient { writer, flags });

    sink.on_connected(id, peer);

    loop {
        match reader.next_event(options.want_whole_packet).await {
            Ok(Some((event, full_packet))) => {
                sink.on_fragment(id, event.offset, &event.window, event.completed);
                if let Some(packet) = full_packet {
                    sink.on_full_packet(id, &packet);
                }
            }
            Ok(None) => break,
            Err(err) => {
                sink.on_receive_error(id, &err);
                break;
            }
        }
    }

    sink.on_disconnected(id);
    Ok(())
}
