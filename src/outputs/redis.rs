// SPDX-License-Identifier: Apache-2.0

//! Redis list sink. Commands are sent as RESP arrays; on connect the sink
//! issues `SELECT <db>` and, when a password is configured, `AUTH <pw>`.
//! Each push is one `LPUSH <key> <envelope>`; any reply other than an
//! integer or `+OK` drops the connection and fails the push.

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RedisOutputConfig;
use crate::outputs::{with_deadline, HostRing, Output, Result, SinkError};

pub struct RedisOutput {
    config: RedisOutputConfig,
    hosts: HostRing,
    conn: Option<BufReader<TcpStream>>,
    reply_ok: Regex,
}

impl RedisOutput {
    pub fn new(config: RedisOutputConfig) -> Self {
        let hosts = HostRing::new(config.hosts.iter().cloned());
        Self {
            config,
            hosts,
            conn: None,
            reply_ok: Regex::new(r"^(:\d+|\+OK)\r\n").unwrap(),
        }
    }

    async fn connect(&mut self, deadline: Instant) -> Result<()> {
        for _ in 0..self.hosts.len() {
            let host = self.hosts.next_host().expect("non-empty host list");
            let attempt =
                with_deadline(deadline, TcpStream::connect((host.as_str(), self.config.port)))
                    .await;
            let stream = match attempt {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(host, port = self.config.port, error = %e, "redis connect failed");
                    continue;
                }
            };

            let mut conn = BufReader::new(stream);
            match self.handshake(&mut conn, deadline).await {
                Ok(()) => {
                    self.conn = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    debug!(host, error = %e, "redis handshake failed");
                    continue;
                }
            }
        }
        Err(SinkError::HostsExhausted)
    }

    async fn handshake(&self, conn: &mut BufReader<TcpStream>, deadline: Instant) -> Result<()> {
        let db = self.config.db.to_string();
        Self::command(conn, deadline, &["SELECT", &db], &self.reply_ok).await?;
        if let Some(password) = &self.config.password {
            Self::command(conn, deadline, &["AUTH", password], &self.reply_ok).await?;
        }
        Ok(())
    }

    async fn command(
        conn: &mut BufReader<TcpStream>,
        deadline: Instant,
        args: &[&str],
        reply_ok: &Regex,
    ) -> Result<()> {
        let framed = resp_command(args);
        with_deadline(deadline, conn.get_mut().write_all(&framed)).await?;
        with_deadline(deadline, conn.get_mut().flush()).await?;

        let mut reply = String::new();
        with_deadline(deadline, conn.read_line(&mut reply)).await?;
        if reply_ok.is_match(&reply) {
            Ok(())
        } else {
            Err(SinkError::Protocol(format!(
                "unexpected redis reply: {}",
                reply.trim_end()
            )))
        }
    }
}

#[async_trait]
impl Output for RedisOutput {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn push(&mut self, payload: &str) -> bool {
        let deadline = Instant::now() + self.config.timeout;

        if self.conn.is_none() {
            if let Err(e) = self.connect(deadline).await {
                warn!(key = self.config.key, error = %e, "redis connect failed");
                return false;
            }
        }

        let conn = self.conn.as_mut().unwrap();
        let result =
            Self::command(conn, deadline, &["LPUSH", &self.config.key, payload], &self.reply_ok)
                .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(key = self.config.key, error = %e, "redis push failed");
                self.conn = None;
                false
            }
        }
    }
}

/// Frame a command as a RESP array of bulk strings.
fn resp_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn config(hosts: Vec<String>, port: u16) -> RedisOutputConfig {
        RedisOutputConfig {
            types: vec!["t".to_string()],
            hosts,
            port,
            db: 0,
            password: None,
            key: "events".to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_resp_framing() {
        let framed = resp_command(&["LPUSH", "key", "a value"]);
        assert_eq!(
            framed,
            b"*3\r\n$5\r\nLPUSH\r\n$3\r\nkey\r\n$7\r\na value\r\n"
        );
    }

    #[test]
    fn test_reply_pattern() {
        let re = Regex::new(r"^(:\d+|\+OK)\r\n").unwrap();
        assert!(re.is_match(":12\r\n"));
        assert!(re.is_match("+OK\r\n"));
        assert!(!re.is_match("-ERR unknown command\r\n"));
        assert!(!re.is_match("$5\r\n"));
    }

    /// Minimal inline redis: answers +OK to SELECT/AUTH and :1 to LPUSH.
    async fn fake_redis(listener: TcpListener, mut commands: usize) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = BufReader::new(stream);
        let mut seen = Vec::new();
        while commands > 0 {
            // read one RESP array
            let mut header = String::new();
            if conn.read_line(&mut header).await.unwrap() == 0 {
                break;
            }
            let argc: usize = header[1..].trim_end().parse().unwrap();
            let mut args = Vec::new();
            for _ in 0..argc {
                let mut len_line = String::new();
                conn.read_line(&mut len_line).await.unwrap();
                let len: usize = len_line[1..].trim_end().parse().unwrap();
                let mut data = vec![0u8; len + 2];
                conn.read_exact(&mut data).await.unwrap();
                args.push(String::from_utf8_lossy(&data[..len]).into_owned());
            }
            let reply: &[u8] = if args[0] == "LPUSH" { b":1\r\n" } else { b"+OK\r\n" };
            conn.get_mut().write_all(reply).await.unwrap();
            seen.push(args.join(" "));
            commands -= 1;
        }
        seen
    }

    #[tokio::test]
    async fn test_push_select_then_lpush() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(fake_redis(listener, 2));

        let mut output = RedisOutput::new(config(vec!["127.0.0.1".to_string()], port));
        assert!(output.push("{\"@message\":\"x\"}").await);

        let seen = server.await.unwrap();
        assert_eq!(seen[0], "SELECT 0");
        assert_eq!(seen[1], "LPUSH events {\"@message\":\"x\"}");
    }

    #[tokio::test]
    async fn test_failover_skips_dead_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(fake_redis(listener, 2));

        // nothing listens on 127.0.0.101:<port>; the ring must move on to
        // the live loopback entry within the same push
        let cfg = config(
            vec!["127.0.0.101".to_string(), "127.0.0.1".to_string()],
            port,
        );

        let mut output = RedisOutput::new(cfg);
        assert!(output.push("line").await);
        // successful host rotated to the tail
        assert_eq!(output.hosts.order(), vec!["127.0.0.101", "127.0.0.1"]);
        drop(server);
    }

    #[tokio::test]
    async fn test_error_reply_fails_push_and_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = BufReader::new(stream);
            let mut line = String::new();
            // swallow whatever arrives, answer -ERR to everything
            let _ = conn.read_line(&mut line).await;
            let _ = conn.get_mut().write_all(b"-ERR nope\r\n").await;
        });

        let mut output = RedisOutput::new(config(vec!["127.0.0.1".to_string()], port));
        assert!(!output.push("line").await);
        assert!(output.conn.is_none());
    }
}
