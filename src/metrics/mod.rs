// SPDX-License-Identifier: Apache-2.0

//! The metric store and its exposition surface.
//!
//! Metrics are declared by programs (or by the engine itself), identified
//! by `(program, name)`, and hold a sparse map from label tuple to cell.
//! The store is written by VMs on every line and read concurrently by the
//! exposition server; consistency is per-cell, not global.

pub mod cell;
pub mod exposition;
pub mod server;
pub mod store;

pub use cell::{now_ms, Cell, CellValue, HistogramData};
pub use exposition::render_text;
pub use server::ExpositionServer;
pub use store::{
    CellSnapshot, Metric, MetricDesc, MetricId, MetricKind, MetricSnapshot, MetricStore,
    OnConflict, StoreError,
};
