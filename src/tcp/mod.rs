// ABOUTME: TCP client and server built on the framing engine in `connection.rs`/`framing/`
// ABOUTME: Each connection dials (or accepts), then spawns a dedicated read-loop task

mod client;
mod server;

pub use client::{TcpClient, TcpClientOptions};
pub use server::{TcpServer, TcpServerOptions};
