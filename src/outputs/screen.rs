// SPDX-License-Identifier: Apache-2.0

//! Screen sink: envelopes go to stdout, stderr, or nowhere.

use async_trait::async_trait;
use std::io::Write;

use crate::config::{ScreenOutputConfig, ScreenTarget};
use crate::outputs::Output;

pub struct ScreenOutput {
    target: ScreenTarget,
}

impl ScreenOutput {
    pub fn new(config: ScreenOutputConfig) -> Self {
        Self {
            target: config.target,
        }
    }
}

#[async_trait]
impl Output for ScreenOutput {
    fn kind(&self) -> &'static str {
        "screen"
    }

    async fn push(&mut self, payload: &str) -> bool {
        match self.target {
            ScreenTarget::Stdout => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                writeln!(out, "{}", payload).is_ok()
            }
            ScreenTarget::Stderr => {
                let stderr = std::io::stderr();
                let mut out = stderr.lock();
                writeln!(out, "{}", payload).is_ok()
            }
            ScreenTarget::Null => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_target_accepts_everything() {
        let mut output = ScreenOutput::new(ScreenOutputConfig {
            types: vec!["*".to_string()],
            target: ScreenTarget::Null,
        });
        assert!(output.push("anything").await);
    }
}
