// ABOUTME: FTP verb orchestration with streaming transfer and progress/rate reporting
// ABOUTME: Built on suppaftp's async tokio transport

pub mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use suppaftp::tokio::AsyncFtpStream;
use suppaftp::types::FileType;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

pub use progress::ProgressMonitor;

use crate::error::FtpError;

/// Per-call FTP connection configuration; a handler-level default is merged with an
/// optional per-call override (see [`ConnectionOptions::merge`]).
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub buffer_size: usize,
    pub use_binary: bool,
    pub use_passive: bool,
    pub keep_alive: bool,
    pub host_name: String,
    pub proxy: Option<String>,
    pub credentials: Option<Credentials>,
    pub group_name: Option<String>,
    pub connections_limit: usize,
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            buffer_size: 4096,
            use_binary: true,
            use_passive: true,
            keep_alive: false,
            host_name: String::new(),
            proxy: None,
            credentials: None,
            group_name: None,
            connections_limit: 2,
        }
    }
}

impl ConnectionOptions {
    pub fn new(host_name: impl Into<String>) -> Self {
        ConnectionOptions {
            host_name: host_name.into(),
            ..Default::default()
        }
    }

    /// Layer `call_opts` over `self`, a field at a time, for a single request. Fields
    /// that can express "unset" (the `Option<_>` fields, and `host_name` via the empty
    /// string) fall back to `self` when `call_opts` leaves them unset; the rest take
    /// `call_opts`'s value outright since they have no "inherit" representation.
    pub fn merge(&self, call_opts: Option<&ConnectionOptions>) -> ConnectionOptions {
        let Some(o) = call_opts else {
            return self.clone();
        };
        ConnectionOptions {
            buffer_size: o.buffer_size,
            use_binary: o.use_binary,
            use_passive: o.use_passive,
            keep_alive: o.keep_alive,
            host_name: if o.host_name.is_empty() {
                self.host_name.clone()
            } else {
                o.host_name.clone()
            },
            proxy: o.proxy.clone().or_else(|| self.proxy.clone()),
            credentials: o.credentials.clone().or_else(|| self.credentials.clone()),
            group_name: o.group_name.clone().or_else(|| self.group_name.clone()),
            connections_limit: o.connections_limit,
        }
    }
}

/// Passed to the `on_make_request` hook so it can mutate the options a connection is
/// about to be made with — e.g. setting `use_ftps` to upgrade the control connection to
/// TLS after it is opened.
pub struct FtpRequestBuilder {
    pub options: ConnectionOptions,
    pub use_ftps: bool,
}

/// Builds and issues FTP verb requests, and drives streaming transfers with optional
/// progress reporting and cooperative cancellation.
///
/// PASV, proxying, and connection grouping are delegated entirely to `suppaftp`; this
/// orchestrator owns only the control-connection lifecycle, verb dispatch, and the
/// streaming/progress loop around `RETR`/`STOR`/`APPE`/`STOU`.
pub struct FtpOrchestrator {
    options: ConnectionOptions,
    target: AsyncMutex<String>,
    stream: AsyncMutex<Option<AsyncFtpStream>>,
    on_make_request: Option<Arc<dyn Fn(&mut FtpRequestBuilder) + Send + Sync>>,
}

impl FtpOrchestrator {
    pub fn new(options: ConnectionOptions) -> Self {
        FtpOrchestrator {
            target: AsyncMutex::new(String::new()),
            options,
            stream: AsyncMutex::new(None),
            on_make_request: None,
        }
    }

    pub fn with_make_request_hook(mut self, hook: Arc<dyn Fn(&mut FtpRequestBuilder) + Send + Sync>) -> Self {
        self.on_make_request = Some(hook);
        self
    }

    pub async fn target(&self) -> String {
        self.target.lock().await.clone()
    }

    async fn connected(&self, call_opts: Option<&ConnectionOptions>) -> Result<ConnectionOptions, FtpError> {
        let mut builder = FtpRequestBuilder {
            options: self.options.merge(call_opts),
            use_ftps: false,
        };
        if let Some(hook) = &self.on_make_request {
            hook(&mut builder);
        }
        let effective = builder.options;

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let mut stream = AsyncFtpStream::connect(&effective.host_name)
                .await
                .map_err(|e| FtpError::Transport(e.to_string()))?;

            if builder.use_ftps {
                let connector = crate::tls::TlsOptions::new()
                    .build_connector()
                    .map_err(|e| FtpError::Transport(e.to_string()))?;
                stream = stream
                    .into_secure(connector, &effective.host_name)
                    .await
                    .map_err(|e| FtpError::Transport(e.to_string()))?;
            }

            if let Some(creds) = &effective.credentials {
                stream
                    .login(&creds.username, &creds.password)
                    .await
                    .map_err(|e| FtpError::Transport(e.to_string()))?;
            }

            if effective.use_passive {
                stream.set_mode(suppaftp::Mode::Passive);
            } else {
                stream.set_mode(suppaftp::Mode::Active);
            }

            stream
                .transfer_type(if effective.use_binary {
                    FileType::Binary
                } else {
                    FileType::Ascii
                })
                .await
                .map_err(|e| FtpError::Transport(e.to_string()))?;

            *guard = Some(stream);
        }
        Ok(effective)
    }

    // -- directory/metadata verbs ----------------------------------------------------

    pub async fn list_names(
        &self,
        path: &str,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<Vec<String>, FtpError> {
        self.connected(call_opts).await?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        stream
            .nlst(Some(path))
            .await
            .map_err(|e| FtpError::Transfer(e.to_string()))
    }

    pub async fn list_details(
        &self,
        path: &str,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<Vec<String>, FtpError> {
        self.connected(call_opts).await?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        stream
            .list(Some(path))
            .await
            .map_err(|e| FtpError::Transfer(e.to_string()))
    }

    pub async fn rename(
        &self,
        from: &str,
        to: &str,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<(), FtpError> {
        self.connected(call_opts).await?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        stream
            .rename(from, to)
            .await
            .map_err(|e| FtpError::Transfer(e.to_string()))?;

        let mut target = self.target.lock().await;
        let new_path = match Path::new(from).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(to),
            _ => PathBuf::from(to),
        };
        *target = new_path.to_string_lossy().into_owned();
        Ok(())
    }

    pub async fn delete_file(&self, path: &str, call_opts: Option<&ConnectionOptions>) -> Result<(), FtpError> {
        self.connected(call_opts).await?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        stream.rm(path).await.map_err(|e| FtpError::Transfer(e.to_string()))
    }

    pub async fn make_directory(&self, path: &str, call_opts: Option<&ConnectionOptions>) -> Result<(), FtpError> {
        self.connected(call_opts).await?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        stream.mkdir(path).await.map_err(|e| FtpError::Transfer(e.to_string()))
    }

    pub async fn remove_directory(&self, path: &str, call_opts: Option<&ConnectionOptions>) -> Result<(), FtpError> {
        self.connected(call_opts).await?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        stream.rmdir(path).await.map_err(|e| FtpError::Transfer(e.to_string()))
    }

    pub async fn print_working_directory(&self, call_opts: Option<&ConnectionOptions>) -> Result<String, FtpError> {
        self.connected(call_opts).await?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        stream.pwd().await.map_err(|e| FtpError::Transfer(e.to_string()))
    }

    pub async fn get_size(
        &self,
        path: &str,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<Option<u64>, FtpError> {
        self.connected(call_opts).await?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        match stream.size(path).await {
            Ok(size) => Ok(Some(size as u64)),
            Err(_) => Ok(None),
        }
    }

    pub async fn get_modified_time(
        &self,
        path: &str,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<String, FtpError> {
        self.connected(call_opts).await?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        stream
            .mdtm(path)
            .await
            .map(|t| t.to_string())
            .map_err(|e| FtpError::Transfer(e.to_string()))
    }

    // -- streaming transfers -----------------------------------------------------

    /// Download `remote_path` into `writer`, reporting progress if `monitor` is given
    /// and honoring `cancel`.
    pub async fn download(
        &self,
        remote_path: &str,
        writer: &mut (impl AsyncWrite + Unpin + Send),
        mut monitor: Option<&mut ProgressMonitor>,
        cancel: CancellationToken,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<u64, FtpError> {
        let effective = self.connected(call_opts).await?;
        let total = self.get_size(remote_path, call_opts).await.unwrap_or(None);
        if let Some(m) = monitor.as_deref_mut() {
            if m.total_length().is_none() {
                *m = ProgressMonitor::new(total);
            }
            m.start();
        }

        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        let mut data_stream = stream
            .retr_as_stream(remote_path)
            .await
            .map_err(|e| FtpError::Transfer(e.to_string()))?;

        let mut buf = vec![0u8; effective.buffer_size];
        let mut transferred: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(FtpError::Cancelled);
            }
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(FtpError::Cancelled),
                res = data_stream.read(&mut buf) => res?,
            };
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            transferred += n as u64;
            if let Some(m) = monitor.as_deref_mut() {
                m.add(n as u64);
            }
        }
        stream
            .finalize_retr_stream(data_stream)
            .await
            .map_err(|e| FtpError::Transfer(e.to_string()))?;
        Ok(transferred)
    }

    pub async fn download_to_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        monitor: Option<&mut ProgressMonitor>,
        cancel: CancellationToken,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<u64, FtpError> {
        let mut file = File::create(local_path).await?;
        self.download(remote_path, &mut file, monitor, cancel, call_opts).await
    }

    pub async fn download_to_buffer(
        &self,
        remote_path: &str,
        monitor: Option<&mut ProgressMonitor>,
        cancel: CancellationToken,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<Vec<u8>, FtpError> {
        let mut buffer = Vec::new();
        self.download(remote_path, &mut buffer, monitor, cancel, call_opts).await?;
        Ok(buffer)
    }

    /// Upload `reader` to `remote_path`. `verb` selects `STOR`/`APPE`.
    async fn upload_inner(
        &self,
        remote_path: &str,
        reader: &mut (impl AsyncRead + Unpin + Send),
        content_length: Option<u64>,
        mut monitor: Option<&mut ProgressMonitor>,
        cancel: CancellationToken,
        verb: UploadVerb,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<String, FtpError> {
        let effective = self.connected(call_opts).await?;
        if let Some(m) = monitor.as_deref_mut() {
            if m.total_length().is_none() && content_length.is_some() {
                *m = ProgressMonitor::new(content_length);
            }
            m.start();
        }

        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        let mut data_stream = match verb {
            UploadVerb::Store => stream
                .put_with_stream(remote_path)
                .await
                .map_err(|e| FtpError::Transfer(e.to_string()))?,
            UploadVerb::Append => stream
                .append_with_stream(remote_path)
                .await
                .map_err(|e| FtpError::Transfer(e.to_string()))?,
        };

        let mut buf = vec![0u8; effective.buffer_size];
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(FtpError::Cancelled),
                res = reader.read(&mut buf) => res?,
            };
            if n == 0 {
                break;
            }
            data_stream.write_all(&buf[..n]).await?;
            if let Some(m) = monitor.as_deref_mut() {
                m.add(n as u64);
            }
        }

        let response = stream
            .finalize_put_stream(data_stream)
            .await
            .map_err(|e| FtpError::Transfer(e.to_string()))?;
        Ok(response)
    }

    pub async fn upload(
        &self,
        remote_path: &str,
        reader: &mut (impl AsyncRead + Unpin + Send),
        content_length: Option<u64>,
        monitor: Option<&mut ProgressMonitor>,
        cancel: CancellationToken,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<(), FtpError> {
        self.upload_inner(
            remote_path,
            reader,
            content_length,
            monitor,
            cancel,
            UploadVerb::Store,
            call_opts,
        )
        .await?;
        Ok(())
    }

    pub async fn upload_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        monitor: Option<&mut ProgressMonitor>,
        cancel: CancellationToken,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<(), FtpError> {
        let mut file = File::open(local_path).await?;
        let content_length = file.metadata().await.ok().map(|m| m.len());
        self.upload(remote_path, &mut file, content_length, monitor, cancel, call_opts)
            .await
    }

    pub async fn append(
        &self,
        remote_path: &str,
        reader: &mut (impl AsyncRead + Unpin + Send),
        monitor: Option<&mut ProgressMonitor>,
        cancel: CancellationToken,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<(), FtpError> {
        self.upload_inner(remote_path, reader, None, monitor, cancel, UploadVerb::Append, call_opts)
            .await?;
        Ok(())
    }

    /// Upload with a server-assigned unique name (`STOU`). Unlike `upload`/`append`, suppaftp
    /// has no streaming variant of this verb, so `reader` is buffered in full before the call
    /// goes out; progress reporting is a single jump to completion rather than incremental.
    /// The returned name comes straight from the server's response, not parsed out of it.
    pub async fn upload_unique(
        &self,
        reader: &mut (impl AsyncRead + Unpin + Send),
        mut monitor: Option<&mut ProgressMonitor>,
        cancel: CancellationToken,
        call_opts: Option<&ConnectionOptions>,
    ) -> Result<String, FtpError> {
        self.connected(call_opts).await?;

        let mut payload = Vec::new();
        tokio::select! {
            _ = cancel.cancelled() => return Err(FtpError::Cancelled),
            res = reader.read_to_end(&mut payload) => { res?; }
        };
        if let Some(m) = monitor.as_deref_mut() {
            if m.total_length().is_none() {
                *m = ProgressMonitor::new(Some(payload.len() as u64));
            }
            m.start();
        }

        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().expect("connected() populates the stream");
        let name = stream
            .put_file_unique(&mut payload.as_slice())
            .await
            .map_err(|e| FtpError::Transfer(e.to_string()))?;
        drop(guard);

        if let Some(m) = monitor.as_deref_mut() {
            m.add(payload.len() as u64);
        }
        Ok(name)
    }
}

enum UploadVerb {
    Store,
    Append,
}
