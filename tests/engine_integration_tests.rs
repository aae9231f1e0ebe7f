// SPDX-License-Identifier: Apache-2.0

//! End-to-end engine tests.
//!
//! Each test stands up a full agent (tailer, loader, dispatcher, store)
//! on a temp directory, using the poll watcher for determinism, and
//! asserts on the metric store. The HTTP exposition surface has its own
//! tests next to the server.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use tailex::agent::{Agent, AgentConfig};
use tailex::metrics::MetricStore;
use tailex::watcher::{WatchMode, WatcherConfig};

const WAIT: Duration = Duration::from_secs(5);

fn test_config(patterns: Vec<String>, progs: Option<&Path>) -> AgentConfig {
    AgentConfig {
        progs_dir: progs.map(|p| p.to_path_buf()),
        log_patterns: patterns,
        poll_interval: Duration::from_millis(50),
        one_shot: false,
        exposition_addr: None,
        watch: WatcherConfig {
            mode: WatchMode::Poll,
            poll_interval: Duration::from_millis(20),
            debounce_interval: Duration::from_millis(20),
        },
        ..AgentConfig::default()
    }
}

struct RunningAgent {
    store: Arc<MetricStore>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningAgent {
    async fn start(config: AgentConfig) -> Self {
        let agent = Agent::new(config);
        let store = agent.store();
        let cancel = CancellationToken::new();
        let agent_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            agent.run(agent_cancel).await.expect("agent failed");
        });
        // give the tailer thread a moment to register its patterns
        tokio::time::sleep(Duration::from_millis(100)).await;
        Self {
            store,
            cancel,
            handle,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        timeout(WAIT, self.handle)
            .await
            .expect("agent did not stop in time")
            .expect("agent task panicked");
    }

    fn number(&self, prog: &str, name: &str, labels: &[&str]) -> f64 {
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        match self.store.lookup(prog, name) {
            Some(metric) => metric
                .cell(&labels)
                .map(|cell| cell.number())
                .unwrap_or(0.0),
            None => 0.0,
        }
    }

    async fn wait_until<F: Fn(&Self) -> bool>(&self, cond: F) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond(self)
    }
}

fn append(path: &Path, bytes: &[u8]) {
    let mut f = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .unwrap();
    f.write_all(bytes).unwrap();
    f.flush().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn glob_discovery_counts_logs_and_lines() {
    let dir = TempDir::new().unwrap();
    let pattern = format!("{}/log*", dir.path().display());

    let agent = RunningAgent::start(test_config(vec![pattern], None)).await;

    append(&dir.path().join("log"), b"line 1\n");
    assert!(
        agent
            .wait_until(|a| a.number("", "log_count", &[]) == 1.0
                && a.number("", "line_count", &[]) == 1.0)
            .await,
        "first file: log_count={} line_count={}",
        agent.number("", "log_count", &[]),
        agent.number("", "line_count", &[])
    );

    append(&dir.path().join("log1"), b"line 1\n");
    assert!(
        agent
            .wait_until(|a| a.number("", "log_count", &[]) == 2.0
                && a.number("", "line_count", &[]) == 2.0)
            .await,
        "second file: log_count={} line_count={}",
        agent.number("", "log_count", &[]),
        agent.number("", "line_count", &[])
    );

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_writes_become_one_line() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("app.log");
    append(&log, b"");

    let agent =
        RunningAgent::start(test_config(vec![log.display().to_string()], None)).await;

    append(&log, b"a");
    tokio::time::sleep(Duration::from_millis(200)).await;
    append(&log, b"b");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(0.0, agent.number("", "line_count", &[]));

    append(&log, b"\n");
    assert!(agent
        .wait_until(|a| a.number("", "line_count", &[]) == 1.0)
        .await);

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn truncation_emits_only_new_lines() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("app.log");
    append(&log, b"");

    let agent =
        RunningAgent::start(test_config(vec![log.display().to_string()], None)).await;

    append(&log, b"a\nb\nc\n");
    assert!(agent
        .wait_until(|a| a.number("", "line_count", &[]) == 3.0)
        .await);

    let f = OpenOptions::new().write(true).open(&log).unwrap();
    f.set_len(0).unwrap();
    drop(f);
    append(&log, b"d\ne\n");

    assert!(
        agent
            .wait_until(|a| a.number("", "line_count", &[]) == 5.0)
            .await,
        "line_count={} after truncation",
        agent.number("", "line_count", &[])
    );

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rotation_keeps_both_generations() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("app.log");
    append(&log, b"");

    let agent =
        RunningAgent::start(test_config(vec![log.display().to_string()], None)).await;

    append(&log, b"1\n");
    assert!(agent
        .wait_until(|a| a.number("", "line_count", &[]) == 1.0)
        .await);

    fs::rename(&log, dir.path().join("app.log.1")).unwrap();
    append(&log, b"2\n");

    assert!(
        agent
            .wait_until(|a| a.number("", "line_count", &[]) == 2.0)
            .await,
        "line_count={} after rotation",
        agent.number("", "line_count", &[])
    );

    agent.stop().await;
}

const RAILS_PROGRAM: &str = "\
counter rails_requests_completed_total
counter rails_requests_completed by status
histogram rails_requests_completed_seconds by status buckets 2.5, 5, 15

/Completed (?P<status>\\d{3}) .* in (?P<ms>\\d+)ms/ {
  rails_requests_completed_total++
  rails_requests_completed[$status]++
  rails_requests_completed_seconds[$status] = $ms / 1000.0
}
";

#[tokio::test(flavor = "multi_thread")]
async fn programs_extract_metrics_from_lines() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    let progs = dir.path().join("progs");
    fs::create_dir(&logs).unwrap();
    fs::create_dir(&progs).unwrap();
    fs::write(progs.join("rails.dsl"), RAILS_PROGRAM).unwrap();

    let log = logs.join("production.log");
    append(&log, b"");

    let agent = RunningAgent::start(test_config(
        vec![log.display().to_string()],
        Some(&progs),
    ))
    .await;

    assert!(agent
        .wait_until(|a| a.number("", "prog_loads_total", &["rails"]) == 1.0)
        .await);

    append(
        &log,
        b"Completed 200 OK in 1500ms (Views: 1000.0ms | ActiveRecord: 200.0ms)\n",
    );

    assert!(agent
        .wait_until(|a| {
            a.number("rails", "rails_requests_completed_total", &[]) == 1.0
                && a.number("rails", "rails_requests_completed", &["200"]) == 1.0
        })
        .await);

    // the histogram fired on the same line (fall-through layering)
    let snapshot = agent.store.snapshot();
    let histogram = snapshot
        .iter()
        .find(|m| m.name == "rails_requests_completed_seconds")
        .expect("histogram present");
    let cell = &histogram.cells[0];
    assert_eq!(vec!["200".to_string()], cell.labels);
    match &cell.value {
        tailex::metrics::CellValue::Histogram(h) => {
            assert_eq!(vec![1, 1, 1], h.counts);
            assert_eq!(1, h.count);
            assert_eq!(1.5, h.sum);
        }
        other => panic!("unexpected cell value {:?}", other),
    }

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn compile_error_keeps_previous_program_active() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    let progs = dir.path().join("progs");
    fs::create_dir(&logs).unwrap();
    fs::create_dir(&progs).unwrap();

    let program = progs.join("web.dsl");
    fs::write(&program, "counter seen\n/.*/ {\n seen++\n}\n").unwrap();

    let log = logs.join("web.log");
    append(&log, b"");

    let agent = RunningAgent::start(test_config(
        vec![log.display().to_string()],
        Some(&progs),
    ))
    .await;

    assert!(agent
        .wait_until(|a| a.number("", "prog_loads_total", &["web"]) == 1.0)
        .await);

    // swap in a broken version
    fs::write(&program, "counter {\n").unwrap();
    assert!(agent
        .wait_until(|a| a.number("", "prog_load_errors_total", &["web"]) == 1.0)
        .await);
    assert_eq!(1.0, agent.number("", "prog_loads_total", &["web"]));

    // the previous version still processes lines
    append(&log, b"hello\n");
    assert!(
        agent
            .wait_until(|a| a.number("web", "seen", &[]) == 1.0)
            .await,
        "seen={}",
        agent.number("web", "seen", &[])
    );

    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn one_shot_reads_everything_and_exits() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    let progs = dir.path().join("progs");
    fs::create_dir(&logs).unwrap();
    fs::create_dir(&progs).unwrap();
    fs::write(progs.join("rails.dsl"), RAILS_PROGRAM).unwrap();

    append(
        &logs.join("production.log"),
        b"Completed 200 OK in 1500ms (x)\nCompleted 404 NF in 100ms (x)\n",
    );

    let mut config = test_config(
        vec![format!("{}/*.log", logs.display())],
        Some(&progs),
    );
    config.one_shot = true;

    let agent = Agent::new(config);
    let store = agent.store();

    // one-shot runs to completion on its own
    timeout(WAIT, agent.run(CancellationToken::new()))
        .await
        .expect("one-shot timed out")
        .expect("one-shot failed");

    let value = |prog: &str, name: &str, labels: &[&str]| {
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        store
            .lookup(prog, name)
            .unwrap()
            .cell(&labels)
            .unwrap()
            .number()
    };

    assert_eq!(2.0, value("", "line_count", &[]));
    assert_eq!(2.0, value("rails", "rails_requests_completed_total", &[]));
    assert_eq!(1.0, value("rails", "rails_requests_completed", &["200"]));
    assert_eq!(1.0, value("rails", "rails_requests_completed", &["404"]));
}
