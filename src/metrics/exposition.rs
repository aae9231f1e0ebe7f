// SPDX-License-Identifier: Apache-2.0

//! Text rendering of store snapshots for the scrape endpoint.
//!
//! One sample per line: `name{k1="v1",...} value timestamp_ms`. Metrics
//! declared by a program carry a `prog` label; histograms expand to one
//! `_bucket` sample per bound plus `+Inf`, `_sum`, and `_count`.

use std::fmt::Write;

use super::cell::CellValue;
use super::store::MetricSnapshot;

pub fn render_text(snapshots: &[MetricSnapshot]) -> String {
    let mut out = String::new();

    for metric in snapshots {
        for cell in &metric.cells {
            let labels = base_labels(metric, &cell.labels);

            match &cell.value {
                CellValue::Number(n) => {
                    sample(&mut out, &metric.name, &labels, None, *n, cell.timestamp_ms);
                }
                CellValue::Text(t) => {
                    // text metrics expose their value as a label on a unit sample
                    let le = format!("value=\"{}\"", escape(t));
                    sample(&mut out, &metric.name, &labels, Some(&le), 1.0, cell.timestamp_ms);
                }
                CellValue::Histogram(h) => {
                    let bucket_name = format!("{}_bucket", metric.name);
                    for (bound, count) in h.bounds.iter().zip(&h.counts) {
                        let le = format!("le=\"{}\"", bound);
                        sample(
                            &mut out,
                            &bucket_name,
                            &labels,
                            Some(&le),
                            *count as f64,
                            cell.timestamp_ms,
                        );
                    }
                    sample(
                        &mut out,
                        &bucket_name,
                        &labels,
                        Some("le=\"+Inf\""),
                        h.count as f64,
                        cell.timestamp_ms,
                    );
                    sample(
                        &mut out,
                        &format!("{}_sum", metric.name),
                        &labels,
                        None,
                        h.sum,
                        cell.timestamp_ms,
                    );
                    sample(
                        &mut out,
                        &format!("{}_count", metric.name),
                        &labels,
                        None,
                        h.count as f64,
                        cell.timestamp_ms,
                    );
                }
            }
        }
    }

    out
}

fn base_labels(metric: &MetricSnapshot, values: &[String]) -> Vec<String> {
    let mut labels = Vec::with_capacity(metric.label_keys.len() + 1);
    if !metric.program.is_empty() {
        labels.push(format!("prog=\"{}\"", escape(&metric.program)));
    }
    for (key, value) in metric.label_keys.iter().zip(values) {
        labels.push(format!("{}=\"{}\"", key, escape(value)));
    }
    labels
}

fn sample(
    out: &mut String,
    name: &str,
    labels: &[String],
    extra: Option<&str>,
    value: f64,
    timestamp_ms: i64,
) {
    out.push_str(name);

    let has_labels = !labels.is_empty() || extra.is_some();
    if has_labels {
        out.push('{');
        let mut first = true;
        for label in labels.iter().map(String::as_str).chain(extra) {
            if !first {
                out.push(',');
            }
            out.push_str(label);
            first = false;
        }
        out.push('}');
    }

    let _ = writeln!(out, " {} {}", value, timestamp_ms);
}

fn escape(v: &str) -> String {
    let mut escaped = String::with_capacity(v.len());
    for c in v.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}
