// SPDX-License-Identifier: Apache-2.0

//! Line-oriented TCP listener input, optionally TLS.
//!
//! Connections are served by per-connection tasks that feed a bounded line
//! queue; the engine drains the queue on each `pull`. When a group runs
//! several workers, the supervisor binds the listening socket once and hands
//! each worker a clone, so accepts are shared by the kernel.

use async_trait::async_trait;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SocketInputConfig;
use crate::inputs::Input;
use crate::line_queue::{self, LineReceiver, LineSender};

/// Each wait for an incoming connection is bounded; the TLS handshake that
/// completes an accepted connection shares the same deadline.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const LINE_QUEUE_SIZE: usize = 1024;

struct ConnParams {
    auth: Option<String>,
    response: Option<String>,
}

pub struct SocketListener {
    source_path: String,
    rx: LineReceiver,
    cancel: CancellationToken,
}

impl SocketListener {
    /// Bind the listening socket. Kept separate from `spawn` so a worker
    /// group can bind once and clone the socket per worker.
    pub fn bind_std(config: &SocketInputConfig) -> std::io::Result<StdTcpListener> {
        StdTcpListener::bind((config.host.as_str(), config.port))
    }

    pub fn spawn(
        config: &SocketInputConfig,
        listener: StdTcpListener,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> std::io::Result<Self> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let source_path = format!("tcp://{}:{}", config.host, config.port);

        let (tx, rx) = line_queue::bounded(LINE_QUEUE_SIZE);
        let cancel = CancellationToken::new();
        let params = Arc::new(ConnParams {
            auth: config.auth.clone(),
            response: config.response.clone(),
        });
        let acceptor = tls.map(TlsAcceptor::from);

        info!(listen = source_path, tls = acceptor.is_some(), "socket input listening");
        tokio::spawn(accept_loop(
            listener,
            acceptor,
            params,
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            source_path,
            rx,
            cancel,
        })
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Input for SocketListener {
    async fn pull(&mut self, max_lines: usize) -> Option<Vec<String>> {
        Some(self.rx.drain(max_lines))
    }

    fn source_path(&self) -> &str {
        &self.source_path
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    params: Arc<ConnParams>,
    tx: LineSender,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept()) => {
                match accepted {
                    // nothing arrived within the accept window; wait again
                    Err(_) => {}
                    Ok(Ok((stream, peer))) => {
                        let acceptor = acceptor.clone();
                        let params = params.clone();
                        let tx = tx.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer.to_string(), acceptor, params, tx, cancel)
                                .await;
                        });
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: String,
    acceptor: Option<TlsAcceptor>,
    params: Arc<ConnParams>,
    tx: LineSender,
    cancel: CancellationToken,
) {
    match acceptor {
        Some(acceptor) => {
            // the handshake completes the accept for TLS connections
            let accepted = tokio::time::timeout(ACCEPT_TIMEOUT, acceptor.accept(stream)).await;
            match accepted {
                Ok(Ok(tls_stream)) => serve_lines(tls_stream, peer, params, tx, cancel).await,
                Ok(Err(e)) => debug!(peer, error = %e, "tls handshake failed"),
                Err(_) => debug!(peer, "tls handshake timed out"),
            }
        }
        None => serve_lines(stream, peer, params, tx, cancel).await,
    }
}

async fn serve_lines<S>(
    stream: S,
    peer: String,
    params: Arc<ConnParams>,
    tx: LineSender,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, mut writer) = split(stream);
    let mut reader = BufReader::new(read_half);
    let mut buf = String::new();

    if let Some(expected) = &params.auth {
        match tokio::time::timeout(AUTH_TIMEOUT, reader.read_line(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => {
                let given = buf.trim_end_matches(['\n', '\r']);
                if given == expected {
                    if writer.write_all(b"1\n").await.is_err() {
                        return;
                    }
                } else {
                    debug!(peer, "auth rejected");
                    let _ = writer.write_all(b"0\n").await;
                    return;
                }
            }
            Ok(_) => {
                debug!(peer, "connection closed before auth");
                return;
            }
            Err(_) => {
                debug!(peer, "auth timed out");
                return;
            }
        }
    }

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_line(&mut buf) => read,
        };
        match read {
            Ok(0) => return,
            Ok(_) => {
                if let Some(response) = &params.response {
                    let reply = format!("{}\n", response);
                    if writer.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
                let line = buf.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(peer, error = %e, "read failed");
                return;
            }
        }
    }
}
