// SPDX-License-Identifier: Apache-2.0

//! Bounded line queue between socket connection tasks and the engine.
//! Senders apply back-pressure to their connection when the engine falls
//! behind; the engine drains without blocking.

use flume::{Receiver, Sender};

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

pub struct LineSender {
    tx: Sender<String>,
}

impl LineSender {
    /// Waits for capacity. Fails only when the engine side is gone.
    pub async fn send(&self, line: String) -> Result<(), SendError> {
        self.tx
            .send_async(line)
            .await
            .map_err(|_| SendError::Disconnected)
    }
}

impl Clone for LineSender {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct LineReceiver {
    rx: Receiver<String>,
}

impl LineReceiver {
    /// Take up to `max` buffered lines without blocking.
    pub fn drain(&self, max: usize) -> Vec<String> {
        let mut lines = Vec::new();
        while lines.len() < max {
            match self.rx.try_recv() {
                Ok(line) => lines.push(line),
                Err(_) => break,
            }
        }
        lines
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded(size: usize) -> (LineSender, LineReceiver) {
    let (tx, rx) = flume::bounded(size);
    (LineSender { tx }, LineReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_then_drain() {
        let (tx, rx) = bounded(8);
        tx.send("one".to_string()).await.unwrap();
        tx.send("two".to_string()).await.unwrap();

        assert_eq!(rx.drain(10), vec!["one", "two"]);
        assert!(rx.drain(10).is_empty());
    }

    #[tokio::test]
    async fn test_drain_respects_budget() {
        let (tx, rx) = bounded(8);
        for i in 0..5 {
            tx.send(i.to_string()).await.unwrap();
        }
        assert_eq!(rx.drain(3).len(), 3);
        assert_eq!(rx.len(), 2);
    }

    #[tokio::test]
    async fn test_send_fails_when_receiver_dropped() {
        let (tx, rx) = bounded(1);
        drop(rx);
        assert_eq!(
            tx.send("x".to_string()).await,
            Err(SendError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_sender_blocks_when_full() {
        use tokio_test::{assert_pending, assert_ready, task::spawn};

        let (tx, rx) = bounded(1);

        let mut first = spawn(tx.send("a".to_string()));
        assert_ready!(first.poll()).unwrap();
        drop(first);

        // queue full: the connection task is held back
        let mut second = spawn(tx.send("b".to_string()));
        assert_pending!(second.poll());

        // the engine draining frees capacity and wakes the sender
        assert_eq!(rx.drain(1), vec!["a"]);
        assert_ready!(second.poll()).unwrap();
    }
}
