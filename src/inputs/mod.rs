// SPDX-License-Identifier: Apache-2.0

//! Input plugins. An input is anything the engine can pull batches of raw
//! lines from: a tailed file or a listening socket.

pub mod file;
pub mod socket;

use async_trait::async_trait;

/// Pull-based line source.
///
/// `pull` returns up to `max_lines` lines without trailing newlines, an empty
/// vector when no data is currently available, or `None` when the source is
/// no longer usable and the engine should retire it (if it was discovered
/// through a glob watch).
#[async_trait]
pub trait Input: Send {
    async fn pull(&mut self, max_lines: usize) -> Option<Vec<String>>;

    /// Where the lines come from, for envelopes and logs.
    fn source_path(&self) -> &str;
}
