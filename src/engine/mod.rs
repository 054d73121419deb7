// SPDX-License-Identifier: Apache-2.0

//! The per-worker scheduling engine: a cooperative tick loop that pulls
//! inputs, encodes lines, fans envelopes out to outputs, and applies
//! back-pressure through the stash when an output fails.

pub mod watch;

use std::collections::{BTreeMap, HashSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{InputCommon, Settings, StartPosition};
use crate::envelope::{Encoder, Event};
use crate::inputs::file::FileTailer;
use crate::inputs::Input;
use crate::outputs::Output;
use crate::route::{PendingBatch, Router, Stash};
use watch::GlobWatcher;

struct InputSlot {
    input: Box<dyn Input>,
    encoder: Encoder,
    type_label: Option<String>,
    remove_on_errors: bool,
    next_tick: Instant,
    retired: bool,
}

struct Benchmark {
    lines: u64,
    bytes: u64,
    last_report: Instant,
}

impl Benchmark {
    fn new() -> Self {
        Self {
            lines: 0,
            bytes: 0,
            last_report: Instant::now(),
        }
    }

    fn account(&mut self, lines: &[String]) {
        self.lines += lines.len() as u64;
        self.bytes += lines.iter().map(|l| l.len() as u64).sum::<u64>();
    }

    fn maybe_report(&mut self, now: Instant) {
        if now.duration_since(self.last_report).as_secs_f64() > 1.0 {
            let elapsed = now.duration_since(self.last_report).as_secs_f64();
            info!(
                lines = self.lines,
                bytes = self.bytes,
                lines_per_s = format!("{:.0}", self.lines as f64 / elapsed),
                "benchmark"
            );
            self.lines = 0;
            self.bytes = 0;
            self.last_report = now;
        }
    }
}

pub struct Engine {
    settings: Settings,
    inputs: Vec<InputSlot>,
    outputs: Vec<Box<dyn Output>>,
    router: Router,
    stash: Stash,
    watcher: GlobWatcher,
    benchmark: Benchmark,
}

impl Engine {
    pub fn new(
        settings: Settings,
        outputs: Vec<Box<dyn Output>>,
        router: Router,
        watcher: GlobWatcher,
    ) -> Self {
        Self {
            settings,
            inputs: Vec::new(),
            outputs,
            router,
            stash: Stash::default(),
            watcher,
            benchmark: Benchmark::new(),
        }
    }

    pub fn add_input(
        &mut self,
        input: Box<dyn Input>,
        common: &InputCommon,
        remove_on_errors: bool,
    ) {
        let encoder = Encoder::new(&self.settings, common, input.source_path());
        self.inputs.push(InputSlot {
            input,
            encoder,
            type_label: common.type_label.clone(),
            remove_on_errors,
            next_tick: Instant::now(),
            retired: false,
        });
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Run ticks until cancelled. Exits after finishing the current tick;
    /// anything left in the stash is lost.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                debug!(pending = self.stash.pending_lines(), "engine stopping");
                return;
            }
            let deadline = self.tick().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(pending = self.stash.pending_lines(), "engine stopping");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// One engine tick. Returns the instant to sleep until before the next.
    async fn tick(&mut self) -> Instant {
        let now = Instant::now();

        // enroll files discovered by glob watches since the last scan
        let discovered = self.watcher.scan_due(now);
        for (path, config) in discovered {
            info!(path = %path.display(), "discovered new file");
            let tailer = FileTailer::new(&config, &path, StartPosition::Begin);
            self.add_input(Box::new(tailer), &config.common, true);
        }

        // retire inputs marked during the previous tick
        self.inputs.retain(|slot| !slot.retired);

        // owed lines go out before any new reads for their types
        self.drain_stash().await;

        let mut deadline = now + self.settings.poll;
        let mut warned_types: HashSet<String> = HashSet::new();

        for idx in 0..self.inputs.len() {
            let now = Instant::now();
            if self.inputs[idx].next_tick > now {
                continue;
            }
            match &self.inputs[idx].type_label {
                // type-less inputs wait out any stash at all
                None if !self.stash.is_empty() => continue,
                Some(label) if self.stash.has_type(label) => continue,
                _ => {}
            }

            match self.inputs[idx].input.pull(self.settings.lines).await {
                None => {
                    if self.inputs[idx].remove_on_errors {
                        info!(
                            source = self.inputs[idx].input.source_path(),
                            "input no longer readable, retiring"
                        );
                        self.inputs[idx].retired = true;
                    } else {
                        self.inputs[idx].next_tick = now + self.settings.poll;
                    }
                }
                Some(lines) if lines.is_empty() => {
                    self.inputs[idx].next_tick = now + self.settings.poll;
                }
                Some(lines) => {
                    // data is flowing; skip the end-of-tick sleep
                    deadline = now;
                    if self.settings.benchmark {
                        self.benchmark.account(&lines);
                    }
                    self.fan_out(idx, &lines, &mut warned_types).await;
                }
            }
        }

        if self.settings.benchmark {
            self.benchmark.maybe_report(Instant::now());
        }

        deadline
    }

    async fn fan_out(&mut self, input_idx: usize, lines: &[String], warned: &mut HashSet<String>) {
        let (events, input_type) = {
            let slot = &self.inputs[input_idx];
            let events: Vec<Event> = lines
                .iter()
                .filter_map(|line| slot.encoder.encode(line))
                .collect();
            (events, slot.type_label.clone())
        };
        if events.is_empty() {
            return;
        }

        // route every event by the type its envelope finally carries
        let mut per_output: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (event_idx, event) in events.iter().enumerate() {
            let targets = self.router.targets(event.type_label.as_deref());
            if targets.is_empty() {
                let label = event.type_label.clone().unwrap_or_default();
                if warned.insert(label.clone()) {
                    warn!(event_type = label, "no output configured for type");
                }
                continue;
            }
            for target in targets {
                per_output.entry(target).or_default().push(event_idx);
            }
        }

        for (output_idx, event_idxs) in per_output {
            for (pos, &event_idx) in event_idxs.iter().enumerate() {
                if self.outputs[output_idx].push(&events[event_idx].payload).await {
                    continue;
                }
                // stash the undelivered suffix for this output under the
                // input's type and stop pushing to it for this batch
                let remaining: Vec<String> = event_idxs[pos..]
                    .iter()
                    .map(|&i| events[i].payload.clone())
                    .collect();
                let stash_key = input_type
                    .clone()
                    .or_else(|| events[event_idx].type_label.clone())
                    .unwrap_or_default();
                let batch = PendingBatch {
                    output: output_idx,
                    lines: remaining,
                };
                warn!(
                    output = self.outputs[output_idx].kind(),
                    event_type = stash_key,
                    count = batch.lines.len(),
                    bytes = batch.byte_total(),
                    "output failed, stashing batch"
                );
                self.stash.push(&stash_key, batch);
                break;
            }
        }
    }

    /// Re-push pending batches in insertion order, type by type. A failure
    /// puts the remaining suffix back at the head and halts that type until
    /// the next tick.
    async fn drain_stash(&mut self) {
        for type_key in self.stash.types() {
            while let Some(batch) = self.stash.pop(&type_key) {
                let output_idx = batch.output;
                let mut delivered = 0;
                for line in &batch.lines {
                    if self.outputs[output_idx].push(line).await {
                        delivered += 1;
                    } else {
                        break;
                    }
                }
                if delivered < batch.lines.len() {
                    let remaining = batch.lines[delivered..].to_vec();
                    self.stash.push_front(
                        &type_key,
                        PendingBatch {
                            output: output_idx,
                            lines: remaining,
                        },
                    );
                    break;
                }
                debug!(
                    event_type = type_key,
                    count = batch.lines.len(),
                    "stashed batch delivered"
                );
            }
            self.stash.remove_if_drained(&type_key);
        }
    }
}
