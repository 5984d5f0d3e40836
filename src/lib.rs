//! A length-prefixed TCP framing toolkit with optional TLS, plus UDP, FTP, and
//! single-instance-coordination helpers built on the same connection and concurrency
//! primitives.
//!
//! The core of this crate is the framing engine in [`framing`] and [`connection`]: a
//! fragment-aware receiver that handles headers and payloads spanning arbitrary TCP
//! segment boundaries, paired with [`tcp::TcpClient`]/[`tcp::TcpServer`] for dialing and
//! accepting connections. [`udp`], [`ftp`], and [`single_instance`] build on top of it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use networking_toolkit::events::{EventSink, NullSink};
//! use networking_toolkit::tcp::{TcpClient, TcpClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = TcpClient::new("127.0.0.1:9000", TcpClientOptions::default(), Arc::new(NullSink));
//!     client.connect().await?;
//!     client.send(b"hello").await?;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod events;
pub mod framing;
pub mod ftp;
pub mod keyed_mutex;
pub mod single_instance;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use error::{Error, Result};
pub use events::EventSink;
pub use keyed_mutex::{KeyedMutex, KeyedMutexGuard};
