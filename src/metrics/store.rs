// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use super::cell::{now_ms, Cell, CellValue};

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("label arity mismatch on {metric}: got {got} values, declared {want} keys")]
    ArityMismatch {
        metric: String,
        got: usize,
        want: usize,
    },

    #[error("metric {0} already declared with a different shape")]
    Redeclared(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Timer,
    Text,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Timer => "timer",
            MetricKind::Text => "text",
        };
        f.write_str(s)
    }
}

/// Stable handle to a metric. Programs hold these across hot reloads; the
/// store guarantees a handle stays valid for the lifetime of the program
/// that was issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricId(usize);

/// The declaration tuple identifying a metric's shape. Two declarations
/// are the same metric iff every field matches.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDesc {
    pub program: String,
    pub name: String,
    pub kind: MetricKind,
    pub label_keys: Vec<String>,
    /// Histogram bucket upper bounds, strictly increasing; empty for
    /// other kinds.
    pub buckets: Vec<f64>,
}

impl MetricDesc {
    pub fn plain(program: &str, name: &str, kind: MetricKind) -> Self {
        Self {
            program: program.to_string(),
            name: name.to_string(),
            kind,
            label_keys: Vec::new(),
            buckets: Vec::new(),
        }
    }

    pub fn with_labels(program: &str, name: &str, kind: MetricKind, keys: &[&str]) -> Self {
        Self {
            label_keys: keys.iter().map(|k| k.to_string()).collect(),
            ..Self::plain(program, name, kind)
        }
    }
}

/// A named metric: a sparse map from label tuple to [`Cell`].
///
/// The cell map has its own lock so concurrent programs touching different
/// metrics never contend, and growth of one metric's map does not block
/// readers of another.
pub struct Metric {
    id: MetricId,
    desc: MetricDesc,
    created_ms: i64,
    cells: RwLock<HashMap<Vec<String>, Arc<Cell>>>,
}

impl Metric {
    fn new(id: MetricId, desc: MetricDesc) -> Self {
        Self {
            id,
            desc,
            created_ms: now_ms(),
            cells: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> MetricId {
        self.id
    }

    pub fn desc(&self) -> &MetricDesc {
        &self.desc
    }

    pub fn created_ms(&self) -> i64 {
        self.created_ms
    }

    fn check_arity(&self, got: usize) -> Result<(), StoreError> {
        let want = self.desc.label_keys.len();
        if got != want {
            return Err(StoreError::ArityMismatch {
                metric: self.desc.name.clone(),
                got,
                want,
            });
        }
        Ok(())
    }

    /// The cell for a label tuple, created on first use.
    pub fn cell(&self, labels: &[String]) -> Result<Arc<Cell>, StoreError> {
        self.check_arity(labels.len())?;

        if let Some(cell) = self.cells.read().unwrap().get(labels) {
            return Ok(cell.clone());
        }

        let mut cells = self.cells.write().unwrap();
        Ok(cells
            .entry(labels.to_vec())
            .or_insert_with(|| Arc::new(self.new_cell()))
            .clone())
    }

    /// Drop the cell for a label tuple; `false` if it never existed.
    pub fn remove_cell(&self, labels: &[String]) -> Result<bool, StoreError> {
        self.check_arity(labels.len())?;
        Ok(self.cells.write().unwrap().remove(labels).is_some())
    }

    fn new_cell(&self) -> Cell {
        match self.desc.kind {
            MetricKind::Histogram => Cell::new_histogram(self.desc.buckets.clone()),
            MetricKind::Text => Cell::new_text(),
            _ => Cell::new_number(),
        }
    }

    fn snapshot_cells(&self) -> Vec<CellSnapshot> {
        let cells = self.cells.read().unwrap();
        let mut out: Vec<CellSnapshot> = cells
            .iter()
            .map(|(labels, cell)| {
                let (value, timestamp_ms) = cell.snapshot();
                CellSnapshot {
                    labels: labels.clone(),
                    value,
                    timestamp_ms,
                }
            })
            .collect();
        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CellSnapshot {
    pub labels: Vec<String>,
    pub value: CellValue,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub program: String,
    pub name: String,
    pub kind: MetricKind,
    pub label_keys: Vec<String>,
    pub cells: Vec<CellSnapshot>,
}

/// How `declare` treats an existing metric of the same name whose shape
/// differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Error out; used for first-time loads, where a shape conflict is a
    /// program bug.
    Fail,
    /// Retire the old metric and its cells; used during hot reload.
    Replace,
}

struct Inner {
    metrics: Vec<Option<Arc<Metric>>>,
    index: HashMap<(String, String), MetricId>,
}

/// The in-memory metric set, shared by every VM and the exposition
/// endpoint. Owns all cells; programs only hold [`MetricId`] handles.
pub struct MetricStore {
    inner: RwLock<Inner>,
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                metrics: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Register a metric. Declaring an identical shape is idempotent and
    /// returns the existing handle with its cells intact, which is what
    /// lets hot reload preserve metric values across program versions.
    pub fn declare(&self, desc: MetricDesc, on_conflict: OnConflict) -> Result<MetricId, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let key = (desc.program.clone(), desc.name.clone());

        if let Some(&existing_id) = inner.index.get(&key) {
            let existing = inner.metrics[existing_id.0]
                .as_ref()
                .expect("indexed metric is live");
            if existing.desc == desc {
                return Ok(existing_id);
            }
            if on_conflict == OnConflict::Fail {
                return Err(StoreError::Redeclared(desc.name));
            }
            // reload with a new shape: retire the old metric and cells
            tracing::debug!(
                program = %desc.program,
                metric = %desc.name,
                "metric shape changed on reload, discarding old cells"
            );
            inner.metrics[existing_id.0] = None;
        }

        let id = MetricId(inner.metrics.len());
        inner.metrics.push(Some(Arc::new(Metric::new(id, desc))));
        inner.index.insert(key, id);
        Ok(id)
    }

    pub fn metric(&self, id: MetricId) -> Option<Arc<Metric>> {
        self.inner.read().unwrap().metrics.get(id.0)?.clone()
    }

    pub fn lookup(&self, program: &str, name: &str) -> Option<Arc<Metric>> {
        let inner = self.inner.read().unwrap();
        let id = inner
            .index
            .get(&(program.to_string(), name.to_string()))?;
        inner.metrics[id.0].clone()
    }

    /// Per-cell-consistent snapshot of every live metric, ordered by
    /// (program, name) for stable exposition output.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let metrics: Vec<Arc<Metric>> = {
            let inner = self.inner.read().unwrap();
            inner.metrics.iter().flatten().cloned().collect()
        };

        let mut out: Vec<MetricSnapshot> = metrics
            .iter()
            .map(|m| MetricSnapshot {
                program: m.desc.program.clone(),
                name: m.desc.name.clone(),
                kind: m.desc.kind,
                label_keys: m.desc.label_keys.clone(),
                cells: m.snapshot_cells(),
            })
            .collect();
        out.sort_by(|a, b| (&a.program, &a.name).cmp(&(&b.program, &b.name)));
        out
    }
}
