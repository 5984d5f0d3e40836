// ABOUTME: Explicit listener registry for connection and transfer lifecycle events
// ABOUTME: Callers implement the subset of EventSink methods they need; the rest no-op

use std::net::SocketAddr;

use crate::error::{FramingError, TlsError, UdpError};

/// Receives lifecycle and data events from the TCP framing engine, the UDP handler, and
/// the FTP orchestrator.
///
/// All methods have no-op default bodies so implementors only override what they care
/// about. Methods are synchronous: a slow implementation delays only the connection task
/// that invoked it, never any other connection.
pub trait EventSink: Send + Sync {
    /// A new client connection was accepted (server) or established (client).
    fn on_connected(&self, connection_id: u64, peer: Option<SocketAddr>) {
        let _ = (connection_id, peer);
    }

    /// A connection was closed, whether by the peer, by `disconnect()`, or by error.
    fn on_disconnected(&self, connection_id: u64) {
        let _ = connection_id;
    }

    /// One read's worth of a packet arrived: `offset` is this window's position within
    /// the packet's payload, `window` its bytes, `completed` whether the packet is now
    /// fully captured.
    fn on_fragment(&self, connection_id: u64, offset: u64, window: &[u8], completed: bool) {
        let _ = (connection_id, offset, window, completed);
    }

    /// A packet completed and whole-packet delivery was requested for it.
    fn on_full_packet(&self, connection_id: u64, packet: &[u8]) {
        let _ = (connection_id, packet);
    }

    /// The framing engine hit a fatal decode or I/O error; a disconnect follows.
    fn on_receive_error(&self, connection_id: u64, error: &FramingError) {
        let _ = (connection_id, error);
    }

    /// TLS handshake or validation failed; a disconnect follows.
    fn on_tls_error(&self, connection_id: u64, error: &TlsError) {
        let _ = (connection_id, error);
    }

    /// A server rejected an accepted socket because `max_clients` was already reached.
    fn on_max_clients_reached(&self, connection_id: u64) {
        let _ = connection_id;
    }

    /// A UDP datagram arrived.
    fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let _ = (datagram, from);
    }

    /// The UDP handler's receive loop stopped because of an error (not a deliberate
    /// `listen(false)`).
    fn on_udp_error(&self, error: &UdpError) {
        let _ = error;
    }

    /// The progress sampler produced a new bytes-per-second reading.
    fn on_rate_updated(&self, connection_id: u64, bytes_per_second: u64) {
        let _ = (connection_id, bytes_per_second);
    }

    /// The single-instance coordinator received a peer's forwarded arguments.
    fn on_arguments_received(&self, args: &[String]) {
        let _ = args;
    }
}

/// An `EventSink` that does nothing. Useful as a default when a caller only wants a
/// subset of events and prefers composing a wrapper over implementing every method.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}
