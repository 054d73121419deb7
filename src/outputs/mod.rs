// SPDX-License-Identifier: Apache-2.0

//! Output sinks. A push either fully delivers one envelope or fails; on
//! failure the sink drops its connection state and the next push reconnects.
//! Every network step inside a push shares one deadline derived from the
//! sink's configured timeout.

pub mod amqp;
pub mod gelf;
pub mod redis;
pub mod screen;
pub mod socket;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::OutputConfig;
use crate::tls;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out")]
    Timeout,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("all hosts failed")]
    HostsExhausted,

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("{0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// One delivery target. `push` returns `true` when the envelope was fully
/// written (and acknowledged, where the protocol has replies); `false` is a
/// recoverable failure and the caller stashes the rest of the batch.
#[async_trait]
pub trait Output: Send {
    fn kind(&self) -> &'static str;

    async fn push(&mut self, payload: &str) -> bool;
}

/// Build one sink per output config. Each worker builds its own set so no
/// connection state is shared.
pub fn build(configs: &[OutputConfig]) -> tls::Result<Vec<Box<dyn Output>>> {
    configs
        .iter()
        .map(|config| {
            Ok(match config {
                OutputConfig::Redis(c) => {
                    Box::new(redis::RedisOutput::new(c.clone())) as Box<dyn Output>
                }
                OutputConfig::Amqp(c) => Box::new(amqp::AmqpOutput::new(c.clone())),
                OutputConfig::Socket(c) => Box::new(socket::SocketOutput::new(c.clone())?),
                OutputConfig::Gelf(c) => Box::new(gelf::GelfOutput::new(c.clone())),
                OutputConfig::Screen(c) => Box::new(screen::ScreenOutput::new(c.clone())),
            })
        })
        .collect()
}

/// Rotating host list used for connection failover. Every attempt takes the
/// head and re-appends it, so after a successful connect the used host sits
/// at the tail and the next reconnect tries the following one.
#[derive(Debug, Clone)]
pub struct HostRing {
    hosts: VecDeque<String>,
}

impl HostRing {
    pub fn new(hosts: impl IntoIterator<Item = String>) -> Self {
        Self {
            hosts: hosts.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Rotate: the head moves to the tail and is returned.
    pub fn next_host(&mut self) -> Option<String> {
        let host = self.hosts.pop_front()?;
        self.hosts.push_back(host.clone());
        Some(host)
    }

    #[cfg(test)]
    pub fn order(&self) -> Vec<&str> {
        self.hosts.iter().map(String::as_str).collect()
    }
}

/// Run `fut` against an absolute deadline, mapping expiry to
/// [`SinkError::Timeout`].
pub(crate) async fn with_deadline<T, E, F>(deadline: Instant, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    SinkError: From<E>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result.map_err(SinkError::from),
        Err(_) => Err(SinkError::Timeout),
    }
}
