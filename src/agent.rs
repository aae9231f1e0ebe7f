// SPDX-License-Identifier: Apache-2.0

//! Engine wiring.
//!
//! Builds the store, loader, tailer, dispatcher, and exposition server,
//! and runs them under one cancellation token. Blocking components (the
//! tailer and the loader's watch loop) run on dedicated OS threads; the
//! dispatcher and HTTP server are tokio tasks in a `JoinSet`.
//!
//! Data flow: tailer -> bounded line channel -> dispatcher -> VM per
//! program -> store <- exposition server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, info};

use crate::bounded_channel::{bounded, BoundedReceiver};
use crate::listener::Listener;
use crate::loader::{Loader, LoaderStats, ProgramRegistry};
use crate::metrics::{
    render_text, ExpositionServer, Metric, MetricDesc, MetricKind, MetricStore, OnConflict,
    StoreError,
};
use crate::runtime::Vm;
use crate::tailer::{LogLine, Tailer, TailerConfig, TailerStats};
use crate::watcher::{create_watcher, WatcherConfig};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory of `.dsl` programs; `None` runs the tailer without any
    /// metric extraction (built-in metrics only).
    pub progs_dir: Option<PathBuf>,
    /// Log glob patterns to tail.
    pub log_patterns: Vec<String>,
    /// Full re-read interval; zero relies on watcher events alone.
    pub poll_interval: Duration,
    /// Read every matched file to EOF, dump metrics to stdout, exit.
    pub one_shot: bool,
    /// Exposition bind address; `None` disables the HTTP endpoint.
    pub exposition_addr: Option<SocketAddr>,
    pub watch: WatcherConfig,
    /// Line channel capacity; a full channel blocks the tailer.
    pub line_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            progs_dir: None,
            log_patterns: Vec::new(),
            poll_interval: Duration::from_millis(250),
            one_shot: false,
            exposition_addr: None,
            watch: WatcherConfig::default(),
            line_buffer: 1024,
        }
    }
}

/// Cells and metrics the engine maintains about itself.
struct InternalMetrics {
    tailer: TailerStats,
    loader: LoaderStats,
    runtime_errors: Arc<Metric>,
}

fn declare_internal(store: &MetricStore) -> Result<InternalMetrics, StoreError> {
    let log_count = store.declare(
        MetricDesc::plain("", "log_count", MetricKind::Gauge),
        OnConflict::Fail,
    )?;
    let line_count = store.declare(
        MetricDesc::plain("", "line_count", MetricKind::Counter),
        OnConflict::Fail,
    )?;
    let loads = store.declare(
        MetricDesc::with_labels("", "prog_loads_total", MetricKind::Counter, &["prog"]),
        OnConflict::Fail,
    )?;
    let load_errors = store.declare(
        MetricDesc::with_labels("", "prog_load_errors_total", MetricKind::Counter, &["prog"]),
        OnConflict::Fail,
    )?;
    let runtime_errors = store.declare(
        MetricDesc::with_labels(
            "",
            "prog_runtime_errors_total",
            MetricKind::Counter,
            &["prog"],
        ),
        OnConflict::Fail,
    )?;

    let metric = |id| store.metric(id).expect("just declared");

    Ok(InternalMetrics {
        tailer: TailerStats::new(
            metric(log_count).cell(&[])?,
            metric(line_count).cell(&[])?,
        ),
        loader: LoaderStats {
            loads: metric(loads),
            load_errors: metric(load_errors),
        },
        runtime_errors: metric(runtime_errors),
    })
}

/// Consume the line channel; every line runs through every program in the
/// current registry snapshot. Exits when the channel closes and drains.
async fn dispatch(mut lines: BoundedReceiver<LogLine>, registry: ProgramRegistry, vm: Vm) {
    while let Some(line) = lines.next().await {
        let programs = registry.snapshot();
        for program in programs.values() {
            vm.run(program, &line);
        }
    }
    debug!("dispatcher drained, exiting");
}

pub struct Agent {
    config: AgentConfig,
    store: Arc<MetricStore>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            store: Arc::new(MetricStore::new()),
        }
    }

    /// Shared store handle, also useful for inspecting metrics in tests.
    pub fn store(&self) -> Arc<MetricStore> {
        self.store.clone()
    }

    /// Run until `cancel` fires (or, in one-shot mode, until every
    /// matched file has been read to EOF).
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BoxError> {
        let store = self.store;
        let config = self.config;

        let internal = declare_internal(&store)?;

        let mut threads = Vec::new();

        // programs: load now, then watch for changes
        let registry = match &config.progs_dir {
            Some(dir) => {
                let loader = Loader::new(dir.clone(), store.clone(), internal.loader.clone());
                loader.load_all();
                let registry = loader.registry();

                if !config.one_shot {
                    let watcher = create_watcher(&config.watch)?;
                    let loader_cancel = cancel.clone();
                    threads.push(std::thread::spawn(move || {
                        loader.run(watcher, loader_cancel)
                    }));
                }
                registry
            }
            None => ProgramRegistry::new(),
        };

        let (lines_tx, lines_rx) = bounded::<LogLine>(config.line_buffer);

        let mut tailer = Tailer::new(
            TailerConfig {
                poll_interval: config.poll_interval,
                read_from_start: config.one_shot,
            },
            create_watcher(&config.watch)?,
            lines_tx,
            internal.tailer,
        );
        for pattern in &config.log_patterns {
            tailer.tail_pattern(pattern)?;
        }

        let vm = Vm::new(store.clone(), Some(internal.runtime_errors));
        let mut task_set: JoinSet<Result<(), BoxError>> = JoinSet::new();
        let dispatch_registry = registry.clone();
        task_set.spawn(async move {
            dispatch(lines_rx, dispatch_registry, vm).await;
            Ok(())
        });

        if config.one_shot {
            // read everything that matches, let the dispatcher drain,
            // then dump the metrics
            tokio::task::spawn_blocking(move || tailer.run_once()).await?;
            while let Some(result) = task_set.join_next().await {
                if let Err(e) = result {
                    error!("task failed during one-shot drain: {}", e);
                }
            }
            println!("{}", render_text(&store.snapshot()));
            return Ok(());
        }

        // exposition endpoint; failure to bind is the one fatal error
        if let Some(addr) = config.exposition_addr {
            let listener = Listener::listen_async(addr).await?;
            let bound = listener.bound_address()?;
            info!(addr = %bound, "serving metric exposition");

            let server = ExpositionServer::new(bound, store.clone());
            let server_cancel = cancel.clone();
            task_set.spawn(async move { server.serve(listener, server_cancel).await });
        }

        let tailer_cancel = cancel.clone();
        threads.push(std::thread::spawn(move || tailer.run(tailer_cancel)));

        cancel.cancelled().await;
        info!("shutting down");

        // the tailer makes a final read pass and drops its sender, which
        // closes the line channel; the dispatcher drains and exits
        let _ = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await;

        while let Some(result) = task_set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("task failed: {}", e),
                Err(e) => error!("task panicked: {}", e),
            }
        }

        debug!(
            metrics = store.snapshot().len(),
            "final snapshot taken, agent stopped"
        );
        Ok(())
    }
}
