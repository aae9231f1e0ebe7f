// SPDX-License-Identifier: Apache-2.0

//! Program loading and hot reload.
//!
//! The loader compiles every `.dsl` file in the programs directory and
//! publishes the set behind a read-copy-update snapshot: the dispatcher
//! grabs an `Arc` of the current map per line and never blocks a reload.
//! A program that fails to compile is reported and counted, and its
//! previous version stays active. Reloads rebind metric declarations to
//! existing cells when the declaration shape is unchanged, so metric
//! values survive a hot swap.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{Metric, MetricStore, OnConflict};
use crate::runtime::{compile, Program};
use crate::watcher::{FileWatcher, PathEvent, PathEventKind};

/// Program source file extension.
pub const PROGRAM_EXT: &str = "dsl";

type ProgramMap = HashMap<String, Arc<Program>>;

/// Shared handle to the active program set. Readers take a snapshot;
/// the loader swaps in whole new maps.
#[derive(Clone, Default)]
pub struct ProgramRegistry {
    inner: Arc<RwLock<Arc<ProgramMap>>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current program set. In-flight lines keep the snapshot they
    /// started with; new lines observe the latest swap.
    pub fn snapshot(&self) -> Arc<ProgramMap> {
        self.inner.read().unwrap().clone()
    }

    pub(crate) fn publish(&self, map: ProgramMap) {
        *self.inner.write().unwrap() = Arc::new(map);
    }
}

/// Outcome counters, both labeled by program name.
#[derive(Clone)]
pub struct LoaderStats {
    pub loads: Arc<Metric>,
    pub load_errors: Arc<Metric>,
}

impl LoaderStats {
    fn count(metric: &Metric, program: &str) {
        match metric.cell(&[program.to_string()]) {
            Ok(cell) => cell.inc(1.0),
            Err(e) => warn!("loader counter unavailable: {}", e),
        }
    }
}

pub struct Loader {
    progs_dir: PathBuf,
    store: Arc<MetricStore>,
    registry: ProgramRegistry,
    stats: LoaderStats,
}

impl Loader {
    pub fn new(progs_dir: PathBuf, store: Arc<MetricStore>, stats: LoaderStats) -> Self {
        Self {
            progs_dir,
            store,
            registry: ProgramRegistry::new(),
            stats,
        }
    }

    pub fn registry(&self) -> ProgramRegistry {
        self.registry.clone()
    }

    fn is_program_file(path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(PROGRAM_EXT)
    }

    /// Compile every program file currently in the directory.
    pub fn load_all(&self) {
        let pattern = format!("{}/*.{}", self.progs_dir.display(), PROGRAM_EXT);
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(dir = %self.progs_dir.display(), "bad programs directory: {}", e);
                return;
            }
        };

        for entry in paths.flatten() {
            self.load_file(&entry);
        }
    }

    /// (Re)compile one source file and swap it into the active set. On
    /// compile failure the previously published version stays active.
    pub fn load_file(&self, path: &Path) {
        let name = match path.file_stem().and_then(|s| s.to_str()) {
            Some(name) => name.to_string(),
            None => return,
        };

        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                warn!(program = %name, "failed to read source: {}", e);
                LoaderStats::count(&self.stats.load_errors, &name);
                return;
            }
        };

        let mut program = match compile(&name, &source) {
            Ok(program) => program,
            Err(e) => {
                warn!(program = %name, "compile failed, keeping previous version: {}", e);
                LoaderStats::count(&self.stats.load_errors, &name);
                return;
            }
        };

        // register the program's metrics; unchanged declaration shapes
        // rebind to their existing cells
        let mut ids = Vec::with_capacity(program.decls.len());
        for decl in &program.decls {
            match self.store.declare(decl.clone(), OnConflict::Replace) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    warn!(program = %name, "metric registration failed: {}", e);
                    LoaderStats::count(&self.stats.load_errors, &name);
                    return;
                }
            }
        }
        program.bind_metrics(ids);

        let mut map = (*self.registry.snapshot()).clone();
        map.insert(name.clone(), Arc::new(program));
        self.registry.publish(map);

        LoaderStats::count(&self.stats.loads, &name);
        info!(program = %name, "program loaded");
    }

    /// Drop a program whose source file went away. Its metrics stay in
    /// the store until a future declaration replaces them.
    pub fn unload(&self, path: &Path) {
        let name = match path.file_stem().and_then(|s| s.to_str()) {
            Some(name) => name,
            None => return,
        };

        let mut map = (*self.registry.snapshot()).clone();
        if map.remove(name).is_some() {
            self.registry.publish(map);
            info!(program = %name, "program unloaded");
        }
    }

    fn handle_event(&self, event: PathEvent) {
        if !Self::is_program_file(&event.path) {
            return;
        }
        match event.kind {
            PathEventKind::Create | PathEventKind::Update => self.load_file(&event.path),
            PathEventKind::Remove | PathEventKind::Rename => self.unload(&event.path),
            PathEventKind::Other => {}
        }
    }

    /// Watch the programs directory and recompile on change. Runs on a
    /// dedicated OS thread until cancelled.
    pub fn run(self, mut watcher: Box<dyn FileWatcher + Send>, cancel: CancellationToken) {
        if let Err(e) = watcher.watch(&self.progs_dir) {
            warn!(dir = %self.progs_dir.display(), "cannot watch programs directory: {}", e);
        }

        while !cancel.is_cancelled() {
            match watcher.recv_timeout(Duration::from_millis(250)) {
                Ok(events) => {
                    for event in events {
                        self.handle_event(event);
                    }
                }
                Err(e) => {
                    debug!("program watcher error: {}", e);
                    std::thread::sleep(Duration::from_millis(500));
                }
            }
        }

        info!("loader stopped");
    }
}
