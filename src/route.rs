// SPDX-License-Identifier: Apache-2.0

//! Type routing and the per-type failure stash.
//!
//! Outputs register the type labels they consume at load time; `*` matches
//! every event type. When an output fails mid-batch the undelivered suffix is
//! stashed under the *input's* type, and while that stash is non-empty the
//! engine stops pulling from inputs of that type (and from type-less inputs
//! whenever any stash exists) until the stash drains in order.

use std::collections::{HashMap, VecDeque};

use crate::config::OutputConfig;

/// Maps an event's type label to the indices of the outputs that consume it.
#[derive(Debug, Default)]
pub struct Router {
    routes: HashMap<String, Vec<usize>>,
    wildcard: Vec<usize>,
}

impl Router {
    pub fn build(outputs: &[OutputConfig]) -> Self {
        let mut router = Router::default();
        for (idx, output) in outputs.iter().enumerate() {
            for label in output.types() {
                if label == "*" {
                    router.wildcard.push(idx);
                } else {
                    router.routes.entry(label.clone()).or_default().push(idx);
                }
            }
        }
        router
    }

    /// Output indices registered for `type_label`, wildcard outputs included,
    /// in declaration order. Type-less events reach only wildcard outputs.
    pub fn targets(&self, type_label: Option<&str>) -> Vec<usize> {
        let mut targets: Vec<usize> = match type_label {
            Some(label) => self.routes.get(label).cloned().unwrap_or_default(),
            None => Vec::new(),
        };
        for &idx in &self.wildcard {
            if !targets.contains(&idx) {
                targets.push(idx);
            }
        }
        targets.sort_unstable();
        targets
    }
}

/// Lines an output could not accept, still owed to it.
#[derive(Debug)]
pub struct PendingBatch {
    pub output: usize,
    pub lines: Vec<String>,
}

impl PendingBatch {
    pub fn byte_total(&self) -> usize {
        self.lines.iter().map(String::len).sum()
    }
}

#[derive(Debug)]
struct StashEntry {
    type_key: String,
    batches: VecDeque<PendingBatch>,
}

/// Ordered per-type queues of pending batches. Types drain in the order they
/// first failed; batches within a type drain in insertion order.
#[derive(Debug, Default)]
pub struct Stash {
    entries: Vec<StashEntry>,
}

impl Stash {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_type(&self, type_key: &str) -> bool {
        self.entries.iter().any(|e| e.type_key == type_key)
    }

    /// Types with pending batches, in insertion order.
    pub fn types(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.type_key.clone()).collect()
    }

    pub fn push(&mut self, type_key: &str, batch: PendingBatch) {
        match self.entries.iter_mut().find(|e| e.type_key == type_key) {
            Some(entry) => entry.batches.push_back(batch),
            None => self.entries.push(StashEntry {
                type_key: type_key.to_string(),
                batches: VecDeque::from([batch]),
            }),
        }
    }

    /// Put a partially-drained batch back at the head of its type's queue.
    pub fn push_front(&mut self, type_key: &str, batch: PendingBatch) {
        match self.entries.iter_mut().find(|e| e.type_key == type_key) {
            Some(entry) => entry.batches.push_front(batch),
            None => self.entries.push(StashEntry {
                type_key: type_key.to_string(),
                batches: VecDeque::from([batch]),
            }),
        }
    }

    pub fn pop(&mut self, type_key: &str) -> Option<PendingBatch> {
        let entry = self.entries.iter_mut().find(|e| e.type_key == type_key)?;
        entry.batches.pop_front()
    }

    /// Drop the type's entry once its queue is empty, resuming normal reads.
    pub fn remove_if_drained(&mut self, type_key: &str) {
        self.entries
            .retain(|e| e.type_key != type_key || !e.batches.is_empty());
    }

    pub fn pending_lines(&self) -> usize {
        self.entries
            .iter()
            .flat_map(|e| e.batches.iter())
            .map(|b| b.lines.len())
            .sum()
    }
}
