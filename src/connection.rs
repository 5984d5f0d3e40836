// ABOUTME: Owns one transport connection's read/write halves, buffer, and recycled Fragment
// ABOUTME: Buffered read, then parse, then advance: the read loop never copies unconsumed bytes

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::FramingError;
use crate::framing::{DEFAULT_MAX_FRAME_SIZE, Fragment, encode_header_u32, encode_header_u64};

/// Blanket trait so a connection can hold either a plain `TcpStream` or either side of
/// a `tokio_rustls` session behind one boxed type.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

pub type BoxedStream = Box<dyn AsyncReadWrite>;

/// One decoded delivery: a window of payload bytes, its offset, and whether the packet
/// it belongs to just completed.
pub struct FrameEvent {
    pub offset: u64,
    pub window: Bytes,
    pub completed: bool,
}

/// Flags shared between a connection's reader task and anything that wants to steer it
/// (the owning client/server, a control-protocol handler deciding the next frame is a
/// file). `AtomicBool` rather than a `Mutex` because each flag is read or flipped
/// independently and never needs to be observed atomically alongside another.
#[derive(Default)]
pub struct ConnectionFlags {
    pub is_length_in_one_frame: AtomicBool,
    pub read_next_as_long: AtomicBool,
    pub read_next_not_buffered: AtomicBool,
}

/// The write half of a connection, plus the state needed to frame outgoing sends.
/// Held behind an `Arc<tokio::sync::Mutex<_>>` shared between callers of `send*`.
pub struct ConnectionWriter {
    write_half: WriteHalf<BoxedStream>,
    flags: Arc<ConnectionFlags>,
}

impl ConnectionWriter {
    pub async fn send_framed(&mut self, payload: &[u8]) -> Result<(), FramingError> {
        let header = encode_header_u32(payload.len() as u32);
        if self.flags.is_length_in_one_frame.load(Ordering::Relaxed) {
            let mut combined = Vec::with_capacity(4 + payload.len());
            combined.extend_from_slice(&header);
            combined.extend_from_slice(payload);
            self.write_raw(&combined).await
        } else {
            self.write_raw(&header).await?;
            self.write_raw(payload).await
        }
    }

    pub async fn send_unframed(&mut self, payload: &[u8]) -> Result<(), FramingError> {
        self.write_raw(payload).await
    }

    /// Send a file body with a 64-bit header; the peer must arm `read_next_as_long`
    /// before this frame arrives.
    pub async fn send_file_framed(
        &mut self,
        mut body: impl AsyncRead + Unpin,
        file_len: u64,
        pre_buffer: Option<&[u8]>,
        post_buffer: Option<&[u8]>,
        pre_buffer_before_length: bool,
    ) -> Result<(), FramingError> {
        let header = encode_header_u64(file_len);

        if let Some(pre) = pre_buffer.filter(|_| pre_buffer_before_length) {
            self.write_raw(pre).await?;
        }
        self.write_raw(&header).await?;
        if let Some(pre) = pre_buffer.filter(|_| !pre_buffer_before_length) {
            self.write_raw(pre).await?;
        }

        tokio::io::copy(&mut body, &mut self.write_half)
            .await
            .map_err(FramingError::Io)?;

        if let Some(post) = post_buffer {
            self.write_raw(post).await?;
        }
        self.write_half.flush().await?;
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        self.write_half.write_all(bytes).await?;
        self.write_half.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FramingError> {
        self.write_half.shutdown().await?;
        Ok(())
    }
}

/// Owns the read half, buffer, and the one [`Fragment`] recycled across every packet
/// received on this connection. Lives exclusively inside the connection's read-loop
/// task — never shared.
pub struct ConnectionReader {
    read_half: ReadHalf<BoxedStream>,
    buf: BytesMut,
    fragment: Fragment,
    pending_header_size: usize,
    pending_accumulate: bool,
    max_frame_size: u64,
    flags: Arc<ConnectionFlags>,
    pub idle_timeout: Option<Duration>,
}

impl ConnectionReader {
    pub fn with_max_frame_size(mut self, max: u64) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Wait for the next delivery: a fragment window, plus (if whole-packet delivery
    /// was requested for this packet) its accumulated bytes once complete.
    ///
    /// Returns `Ok(None)` only on a clean, buffer-empty EOF.
    pub async fn next_event(
        &mut self,
        want_whole_packet: bool,
    ) -> Result<Option<(FrameEvent, Option<Bytes>)>, FramingError> {
        loop {
            let starting_new_packet = !self.fragment.length_found() && !self.fragment.header_started();
            if starting_new_packet {
                let as_long = self.flags.read_next_as_long.swap(false, Ordering::Relaxed);
                self.pending_header_size = if as_long { 8 } else { 4 };
                let not_buffered = self.flags.read_next_not_buffered.swap(false, Ordering::Relaxed);
                self.pending_accumulate = want_whole_packet && !not_buffered;
            }

            if self
                .fragment
                .step(&mut self.buf, self.pending_header_size, self.pending_accumulate)
                .is_some()
            {
                if let Some(length) = self.fragment.full_length() {
                    if length > self.max_frame_size {
                        return Err(FramingError::FrameTooLarge {
                            length,
                            max: self.max_frame_size,
                        });
                    }
                }

                let event = FrameEvent {
                    offset: self.fragment.current_offset(),
                    window: Bytes::copy_from_slice(self.fragment.window()),
                    completed: self.fragment.is_completed(),
                };
                let full_packet = if event.completed {
                    let accumulated = self.fragment.take_accumulated();
                    self.fragment.recycle();
                    accumulated
                } else {
                    None
                };
                return Ok(Some((event, full_packet)));
            }

            let n = self.read_into_buffer().await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(FramingError::ConnectionReset)
                };
            }
        }
    }

    async fn read_into_buffer(&mut self) -> Result<usize, FramingError> {
        let n = match self.idle_timeout {
            Some(d) => {
                tokio::time::timeout(d, self.read_half.read_buf(&mut self.buf))
                    .await
                    .map_err(|_| FramingError::ConnectionReset)??
            }
            None => self.read_half.read_buf(&mut self.buf).await?,
        };
        Ok(n)
    }
}

/// Splits a freshly established (and, if applicable, already TLS-upgraded) stream into
/// its [`ConnectionWriter`]/[`ConnectionReader`] halves plus the shared flag block.
pub fn split_connection(
    stream: BoxedStream,
    buffer_size: usize,
) -> (ConnectionWriter, ConnectionReader, Arc<ConnectionFlags>) {
    let flags = Arc::new(ConnectionFlags::default());
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = ConnectionWriter {
        write_half,
        flags: flags.clone(),
    };
    let reader = ConnectionReader {
        read_half,
        buf: BytesMut::with_capacity(buffer_size + 8),
        fragment: Fragment::new(),
        pending_header_size: 4,
        pending_accumulate: false,
        max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        flags: flags.clone(),
        idle_timeout: None,
    };
    (writer, reader, flags)
}

pub type SharedWriter = Arc<AsyncMutex<ConnectionWriter>>;
