// SPDX-License-Identifier: Apache-2.0

//! Line-oriented socket sink, optionally TLS. After connecting (and an
//! optional auth preamble) each push writes `envelope + "\n"`; when a
//! `response` pattern is configured the sink reads one reply line and fails
//! unless it matches. Non-persistent sinks close the connection after every
//! push.

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::SocketOutputConfig;
use crate::outputs::{with_deadline, HostRing, Output, Result, SinkError};
use crate::tls;

trait RawStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> RawStream for T {}

pub struct SocketOutput {
    config: SocketOutputConfig,
    hosts: HostRing,
    connector: Option<TlsConnector>,
    conn: Option<BufReader<Box<dyn RawStream>>>,
}

impl SocketOutput {
    pub fn new(config: SocketOutputConfig) -> tls::Result<Self> {
        let connector = match &config.tls {
            Some(settings) => Some(TlsConnector::from(tls::client_config(settings)?)),
            None => None,
        };
        let hosts = HostRing::new(config.hosts.iter().cloned());
        Ok(Self {
            config,
            hosts,
            connector,
            conn: None,
        })
    }

    async fn connect(&mut self, deadline: Instant) -> Result<()> {
        for _ in 0..self.hosts.len() {
            let host = self.hosts.next_host().expect("non-empty host list");
            match self.connect_one(&host, deadline).await {
                Ok(conn) => {
                    self.conn = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    debug!(host, port = self.config.port, error = %e, "socket connect failed");
                }
            }
        }
        Err(SinkError::HostsExhausted)
    }

    async fn connect_one(
        &self,
        host: &str,
        deadline: Instant,
    ) -> Result<BufReader<Box<dyn RawStream>>> {
        let stream =
            with_deadline(deadline, TcpStream::connect((host, self.config.port))).await?;

        let mut conn: BufReader<Box<dyn RawStream>> = match &self.connector {
            Some(connector) => {
                let name = ServerName::try_from(host.to_string())
                    .map_err(|e| SinkError::Tls(format!("bad server name '{}': {}", host, e)))?;
                let tls_stream =
                    with_deadline(deadline, connector.connect(name, stream)).await?;
                BufReader::new(Box::new(tls_stream))
            }
            None => BufReader::new(Box::new(stream)),
        };

        if let Some(auth) = &self.config.auth {
            let preamble = format!("{}\n", auth);
            with_deadline(deadline, conn.get_mut().write_all(preamble.as_bytes())).await?;
            with_deadline(deadline, conn.get_mut().flush()).await?;

            let mut reply = String::new();
            with_deadline(deadline, conn.read_line(&mut reply)).await?;
            if reply.trim_end_matches(['\n', '\r']).is_empty() {
                return Err(SinkError::Protocol("auth not accepted".to_string()));
            }
        }

        Ok(conn)
    }

    async fn push_line(&mut self, payload: &str, deadline: Instant) -> Result<()> {
        let conn = self.conn.as_mut().expect("connected");
        let framed = format!("{}\n", payload);
        with_deadline(deadline, conn.get_mut().write_all(framed.as_bytes())).await?;
        with_deadline(deadline, conn.get_mut().flush()).await?;

        if let Some(pattern) = &self.config.response {
            let mut reply = String::new();
            let n = with_deadline(deadline, conn.read_line(&mut reply)).await?;
            if n == 0 {
                return Err(SinkError::Protocol("connection closed on reply".to_string()));
            }
            if !pattern.is_match(reply.trim_end_matches(['\n', '\r'])) {
                return Err(SinkError::Protocol(format!(
                    "unexpected reply: {}",
                    reply.trim_end()
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Output for SocketOutput {
    fn kind(&self) -> &'static str {
        "socket"
    }

    async fn push(&mut self, payload: &str) -> bool {
        let deadline = Instant::now() + self.config.timeout;

        if self.conn.is_none() {
            if let Err(e) = self.connect(deadline).await {
                warn!(port = self.config.port, error = %e, "socket connect failed");
                return false;
            }
        }

        match self.push_line(payload, deadline).await {
            Ok(()) => {
                if !self.config.persistent {
                    self.conn = None;
                }
                true
            }
            Err(e) => {
                warn!(port = self.config.port, error = %e, "socket push failed");
                self.conn = None;
                false
            }
        }
    }
}
