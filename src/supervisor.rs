// SPDX-License-Identifier: Apache-2.0

//! Worker lifecycle. Inputs that did not request workers share group 0 with a
//! single engine; every input declaring a `workers` count gets its own group
//! with that many engines. Each worker task owns its inputs and a private set
//! of output connections. Socket inputs in a multi-worker group share one
//! bound listening socket, cloned per worker, so the kernel spreads accepts.
//!
//! SIGTERM/SIGINT stop all workers, waiting up to the drain timeout before
//! aborting survivors. SIGHUP and SIGPIPE are ignored.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AgentConfig, InputConfig};
use crate::engine::watch::GlobWatcher;
use crate::engine::Engine;
use crate::inputs::file::FileTailer;
use crate::inputs::socket::SocketListener;
use crate::outputs;
use crate::route::Router;
use crate::tls;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to bind {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("tls setup failed: {0}")]
    Tls(#[from] tls::Error),

    #[error("signal handler setup failed: {0}")]
    Signal(std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

struct Group {
    /// Indices into `config.inputs`.
    inputs: Vec<usize>,
    workers: usize,
}

/// Bound listening sockets and TLS material, prepared once per socket input
/// and cloned into each of its workers.
struct SocketResources {
    listener: StdTcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
}

fn compute_groups(config: &AgentConfig) -> Vec<Group> {
    let mut groups = Vec::new();
    let default_inputs: Vec<usize> = config
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, input)| input.common().workers.is_none())
        .map(|(idx, _)| idx)
        .collect();
    groups.push(Group {
        inputs: default_inputs,
        workers: 1,
    });

    for (idx, input) in config.inputs.iter().enumerate() {
        if let Some(workers) = input.common().workers {
            groups.push(Group {
                inputs: vec![idx],
                workers,
            });
        }
    }
    groups
}

/// Run the agent until a shutdown signal arrives.
pub async fn run(config: AgentConfig) -> Result<()> {
    // the ring provider backs every TLS socket in the process
    let _ = rustls::crypto::ring::default_provider().install_default();

    // bind every socket input before any worker starts, so startup failures
    // surface before lines begin to flow
    let mut socket_resources: Vec<Option<SocketResources>> = Vec::new();
    for input in &config.inputs {
        match input {
            InputConfig::Socket(s) => {
                let listener = SocketListener::bind_std(s)
                    .map_err(|e| Error::Bind(format!("{}:{}", s.host, s.port), e))?;
                let tls = match &s.tls {
                    Some(settings) => Some(tls::server_config(settings)?),
                    None => None,
                };
                socket_resources.push(Some(SocketResources { listener, tls }));
            }
            InputConfig::File(_) => socket_resources.push(None),
        }
    }

    let groups = compute_groups(&config);
    let cancel = CancellationToken::new();
    let mut workers = JoinSet::new();

    for (group_idx, group) in groups.iter().enumerate() {
        if group.inputs.is_empty() {
            continue;
        }
        for worker_idx in 0..group.workers {
            let engine = build_worker(&config, group, &socket_resources)?;
            info!(
                group = group_idx,
                worker = worker_idx,
                inputs = engine.input_count(),
                "starting worker"
            );
            let cancel = cancel.clone();
            workers.spawn(engine.run(cancel));
        }
    }

    let mut sig_term = signal(SignalKind::terminate()).map_err(Error::Signal)?;
    let mut sig_int = signal(SignalKind::interrupt()).map_err(Error::Signal)?;
    // swallow HUP and PIPE for the life of the process
    let mut sig_hup = signal(SignalKind::hangup()).map_err(Error::Signal)?;
    let mut sig_pipe = signal(SignalKind::pipe()).map_err(Error::Signal)?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sig_hup.recv() => {}
                _ = sig_pipe.recv() => {}
            }
        }
    });

    tokio::select! {
        _ = sig_term.recv() => info!("received SIGTERM, shutting down"),
        _ = sig_int.recv() => info!("received SIGINT, shutting down"),
        _ = workers.join_next(), if !workers.is_empty() => {
            warn!("worker exited unexpectedly, shutting down");
        }
    }

    cancel.cancel();

    let stop_at = Instant::now() + SHUTDOWN_DRAIN;
    loop {
        match timeout_at(stop_at, workers.join_next()).await {
            Ok(None) => break,
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) => error!(error = %e, "worker task failed"),
            Err(_) => {
                warn!("workers did not stop in time, aborting");
                workers.abort_all();
                break;
            }
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Build one worker's engine: a private set of outputs, the routing table,
/// this group's inputs, and the glob watches this worker owns.
fn build_worker(
    config: &AgentConfig,
    group: &Group,
    socket_resources: &[Option<SocketResources>],
) -> Result<Engine> {
    let sinks = outputs::build(&config.outputs)?;
    let router = Router::build(&config.outputs);
    let mut watcher = GlobWatcher::new(config.settings.log_watch_interval);

    // watches and bound paths first, so discoveries never duplicate an
    // explicitly configured path
    for &input_idx in &group.inputs {
        if let InputConfig::File(f) = &config.inputs[input_idx] {
            for path in &f.paths {
                if GlobWatcher::is_glob(path) {
                    watcher.add_watch(path, f);
                } else {
                    watcher.bind(path);
                }
            }
        }
    }

    let mut engine = Engine::new(config.settings.clone(), sinks, router, watcher);

    for &input_idx in &group.inputs {
        match &config.inputs[input_idx] {
            InputConfig::File(f) => {
                for path in &f.paths {
                    if GlobWatcher::is_glob(path) {
                        continue;
                    }
                    let tailer =
                        FileTailer::new(f, std::path::Path::new(path), f.start_position);
                    engine.add_input(Box::new(tailer), &f.common, false);
                }
            }
            InputConfig::Socket(s) => {
                let resources = socket_resources[input_idx]
                    .as_ref()
                    .expect("socket input has bound resources");
                let listener = resources.listener.try_clone()?;
                let input = SocketListener::spawn(s, listener, resources.tls.clone())?;
                engine.add_input(Box::new(input), &s.common, false);
            }
        }
    }

    Ok(engine)
}
