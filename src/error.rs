// ABOUTME: Crate-wide error taxonomy, one enum per subsystem with conversions into `Error`
// ABOUTME: Mirrors the split between transport and protocol errors used throughout this crate

use thiserror::Error;

/// Errors from the TCP framing engine shared by clients, servers, and the
/// single-instance coordinator.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame length {length} exceeds configured maximum {max}")]
    FrameTooLarge { length: u64, max: u64 },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

/// Errors surfaced while establishing or validating a TLS session.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("certificate chain rejected: {0}")]
    ChainRejected(String),

    #[error("invalid certificate material: {0}")]
    InvalidCertificate(String),
}

/// Errors returned by [`crate::tcp::TcpClient`].
#[derive(Debug, Error)]
pub enum TcpClientError {
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("client is not connected")]
    NotConnected,
}

/// Errors returned by [`crate::tcp::TcpServer`].
#[derive(Debug, Error)]
pub enum TcpServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("no client registered with id {0}")]
    UnknownClient(u64),

    #[error("server is already running")]
    AlreadyRunning,
}

/// Errors returned by [`crate::udp::UdpHandler`].
#[derive(Debug, Error)]
pub enum UdpError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("socket is not listening")]
    NotListening,
}

/// Errors returned by [`crate::ftp::FtpOrchestrator`].
#[derive(Debug, Error)]
pub enum FtpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FTP control connection error: {0}")]
    Transport(String),

    #[error("FTP command failed: {0}")]
    Transfer(String),

    #[error("transfer cancelled")]
    Cancelled,
}

/// Errors returned by [`crate::single_instance::SingleInstanceCoordinator`].
#[derive(Debug, Error)]
pub enum SingleInstanceError {
    #[error(transparent)]
    Client(#[from] TcpClientError),

    #[error(transparent)]
    Server(#[from] TcpServerError),

    #[error("timed out probing for an existing instance")]
    ProbeTimeout,
}

/// Crate-wide error, aggregating every subsystem error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    TcpClient(#[from] TcpClientError),

    #[error(transparent)]
    TcpServer(#[from] TcpServerError),

    #[error(transparent)]
    Udp(#[from] UdpError),

    #[error(transparent)]
    Ftp(#[from] FtpError),

    #[error(transparent)]
    SingleInstance(#[from] SingleInstanceError),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
