// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::sync::Mutex;

/// Milliseconds since the Unix epoch; the sample time attached to every
/// cell mutation unless a program overrides it with `settime`.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Histogram accumulator with cumulative bucket counts.
///
/// `counts[i]` is the number of observations less than or equal to
/// `bounds[i]`; observing a value increments every bucket whose bound
/// covers it plus the implicit +Inf bucket (`count`). This keeps
/// `counts[i] <= counts[i+1] <= count` at all times and lets exposition
/// write the buckets out without a prefix-sum pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramData {
    pub bounds: Vec<f64>,
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl HistogramData {
    fn new(bounds: Vec<f64>) -> Self {
        let counts = vec![0; bounds.len()];
        Self {
            bounds,
            counts,
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, x: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if x <= *bound {
                for count in &mut self.counts[i..] {
                    *count += 1;
                }
                break;
            }
        }
        self.count += 1;
        self.sum += x;
    }
}

/// The value held by a cell. Counter, gauge, and timer cells are plain
/// numbers; the metric kind lives on the metric, not the cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Histogram(HistogramData),
}

#[derive(Debug)]
struct CellState {
    value: CellValue,
    timestamp_ms: i64,
}

/// The numeric leaf of a metric, addressed by a label tuple.
///
/// All mutation goes through the internal mutex, so readers always see a
/// consistent value; for histograms the sum, count, and buckets move
/// together under one lock acquisition.
#[derive(Debug)]
pub struct Cell {
    state: Mutex<CellState>,
}

impl Cell {
    pub(crate) fn new_number() -> Self {
        Self::with_value(CellValue::Number(0.0))
    }

    pub(crate) fn new_text() -> Self {
        Self::with_value(CellValue::Text(String::new()))
    }

    pub(crate) fn new_histogram(bounds: Vec<f64>) -> Self {
        Self::with_value(CellValue::Histogram(HistogramData::new(bounds)))
    }

    fn with_value(value: CellValue) -> Self {
        Self {
            state: Mutex::new(CellState {
                value,
                timestamp_ms: now_ms(),
            }),
        }
    }

    pub fn inc(&self, delta: f64) {
        self.inc_at(delta, now_ms());
    }

    pub fn inc_at(&self, delta: f64, ts_ms: i64) {
        let mut state = self.state.lock().unwrap();
        if let CellValue::Number(n) = &mut state.value {
            *n += delta;
        }
        state.timestamp_ms = ts_ms;
    }

    pub fn set(&self, v: f64) {
        self.set_at(v, now_ms());
    }

    pub fn set_at(&self, v: f64, ts_ms: i64) {
        let mut state = self.state.lock().unwrap();
        if let CellValue::Number(n) = &mut state.value {
            *n = v;
        }
        state.timestamp_ms = ts_ms;
    }

    pub fn set_text_at(&self, v: String, ts_ms: i64) {
        let mut state = self.state.lock().unwrap();
        if let CellValue::Text(t) = &mut state.value {
            *t = v;
        }
        state.timestamp_ms = ts_ms;
    }

    pub fn observe_at(&self, x: f64, ts_ms: i64) {
        let mut state = self.state.lock().unwrap();
        if let CellValue::Histogram(h) = &mut state.value {
            h.observe(x);
        }
        state.timestamp_ms = ts_ms;
    }

    /// Current numeric value; histograms read as their sum, text as 0.
    pub fn number(&self) -> f64 {
        let state = self.state.lock().unwrap();
        match &state.value {
            CellValue::Number(n) => *n,
            CellValue::Histogram(h) => h.sum,
            CellValue::Text(_) => 0.0,
        }
    }

    pub fn snapshot(&self) -> (CellValue, i64) {
        let state = self.state.lock().unwrap();
        (state.value.clone(), state.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_cell_inc_and_set() {
        let cell = Cell::new_number();
        cell.inc(1.0);
        cell.inc(2.5);
        assert_eq!(3.5, cell.number());

        cell.set(10.0);
        assert_eq!(10.0, cell.number());
    }

    #[test]
    fn inc_at_records_timestamp() {
        let cell = Cell::new_number();
        cell.inc_at(1.0, 1234);
        let (_, ts) = cell.snapshot();
        assert_eq!(1234, ts);
    }

    #[test]
    fn text_cell() {
        let cell = Cell::new_text();
        cell.set_text_at("hello".into(), 1);
        assert_eq!((CellValue::Text("hello".into()), 1), cell.snapshot());
    }

    #[test]
    fn histogram_observation_is_cumulative() {
        let cell = Cell::new_histogram(vec![1.0, 2.0, 5.0]);
        cell.observe_at(0.5, 1);
        cell.observe_at(1.5, 2);
        cell.observe_at(100.0, 3);

        let (value, _) = cell.snapshot();
        let h = match value {
            CellValue::Histogram(h) => h,
            other => panic!("unexpected value {:?}", other),
        };

        assert_eq!(vec![1, 2, 2], h.counts);
        assert_eq!(3, h.count);
        assert_eq!(102.0, h.sum);
    }

    #[test]
    fn histogram_buckets_stay_monotone() {
        let cell = Cell::new_histogram(vec![2.5, 5.0, 15.0]);
        for x in [1.0, 3.0, 4.0, 20.0, 14.9] {
            cell.observe_at(x, 1);
        }

        let (value, _) = cell.snapshot();
        if let CellValue::Histogram(h) = value {
            for pair in h.counts.windows(2) {
                assert!(pair[0] <= pair[1]);
            }
            assert!(*h.counts.last().unwrap() <= h.count);
            assert_eq!(5, h.count);
        } else {
            panic!("not a histogram");
        }
    }
}
