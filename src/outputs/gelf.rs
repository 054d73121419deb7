// SPDX-License-Identifier: Apache-2.0

//! GELF 1.1 sink: one UDP datagram per event, optionally gzip-compressed.
//! UDP is fire-and-forget: oversize payloads are dropped with an error log
//! and send errors are silent transient failures; neither stashes.

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::io::Write;
use tokio::net::UdpSocket;
use tracing::{debug, error};

use crate::config::GelfOutputConfig;
use crate::outputs::Output;

/// Largest datagram the endpoint accepts.
pub const MAX_DATAGRAM: usize = 8192;

pub struct GelfOutput {
    config: GelfOutputConfig,
    socket: Option<UdpSocket>,
}

impl GelfOutput {
    pub fn new(config: GelfOutputConfig) -> Self {
        Self {
            config,
            socket: None,
        }
    }

    /// Shape the GELF object from the envelope's source host and message.
    fn gelf_payload(&self, payload: &str) -> Vec<u8> {
        let envelope: Value = serde_json::from_str(payload).unwrap_or(Value::Null);
        let host = envelope
            .get("@source_host")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let short_message = envelope
            .get("@message")
            .and_then(Value::as_str)
            .unwrap_or(payload);

        let gelf = json!({
            "version": "1.1",
            "host": host,
            "short_message": short_message,
            "level": "1",
            "facility": self.config.facility,
        });
        gelf.to_string().into_bytes()
    }

    fn compress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()
    }
}

#[async_trait]
impl Output for GelfOutput {
    fn kind(&self) -> &'static str {
        "gelf"
    }

    async fn push(&mut self, payload: &str) -> bool {
        let mut datagram = self.gelf_payload(payload);
        if self.config.gzip {
            datagram = match self.compress(&datagram) {
                Ok(compressed) => compressed,
                Err(e) => {
                    error!(error = %e, "gelf compression failed, dropping event");
                    return true;
                }
            };
        }

        if datagram.len() > MAX_DATAGRAM {
            error!(
                size = datagram.len(),
                max = MAX_DATAGRAM,
                "gelf payload too large, dropping event"
            );
            return true;
        }

        if self.socket.is_none() {
            match UdpSocket::bind("0.0.0.0:0").await {
                Ok(socket) => self.socket = Some(socket),
                Err(e) => {
                    debug!(error = %e, "unable to bind gelf socket");
                    return true;
                }
            }
        }

        let target = (self.config.host.as_str(), self.config.port);
        if let Err(e) = self.socket.as_ref().unwrap().send_to(&datagram, target).await {
            debug!(host = self.config.host, error = %e, "gelf send failed");
            self.socket = None;
        }
        true
    }
}
