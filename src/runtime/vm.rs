// SPDX-License-Identifier: Apache-2.0

//! The per-line execution engine.
//!
//! `run` walks a program's instruction stream against one input line.
//! Pattern blocks fall through: every top-level block whose regex matches
//! fires, in source order. Regex match results are memoized per line, so
//! overlapping blocks never run the same regex twice.
//!
//! Runtime errors (bad coercions, divide by zero, strptime failures) are
//! confined to the statement that raised them: the VM logs the error with
//! its source position, bumps the per-program error counter, unwinds to
//! the statement boundary, and keeps going.

use std::sync::Arc;

use regex::Captures;
use thiserror::Error;
use tracing::warn;

use crate::metrics::{now_ms, CellValue, Metric, MetricKind, MetricStore, StoreError};
use crate::tailer::LogLine;

use super::bytecode::{Builtin, CmpOp, Instr, Program};

#[derive(Error, Debug)]
enum RuntimeError {
    #[error("cannot convert '{0}' to a number")]
    Coercion(String),

    #[error("integer required, got '{0}'")]
    IntRequired(String),

    #[error("divide by zero")]
    DivideByZero,

    #[error("strptime: '{input}' does not match format '{format}'")]
    Strptime { input: String, format: String },

    #[error("counter increment must be non-negative, got {0}")]
    CounterDecrement(f64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("metric handle is no longer valid")]
    RetiredMetric,

    #[error("internal error: {0}")]
    Internal(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

enum Num {
    Int(i64),
    Float(f64),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Numeric view with int/float distinction preserved. Strings coerce;
    /// an uncoercible string is the canonical runtime error.
    fn as_num(&self) -> Result<Num, RuntimeError> {
        match self {
            Value::Int(i) => Ok(Num::Int(*i)),
            Value::Float(f) => Ok(Num::Float(*f)),
            Value::Str(s) => {
                let t = s.trim();
                if let Ok(i) = t.parse::<i64>() {
                    Ok(Num::Int(i))
                } else if let Ok(f) = t.parse::<f64>() {
                    Ok(Num::Float(f))
                } else {
                    Err(RuntimeError::Coercion(s.clone()))
                }
            }
        }
    }

    fn as_f64(&self) -> Result<f64, RuntimeError> {
        match self.as_num()? {
            Num::Int(i) => Ok(i as f64),
            Num::Float(f) => Ok(f),
        }
    }

    fn as_int(&self) -> Result<i64, RuntimeError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) => Err(RuntimeError::IntRequired(format!("{}", f))),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| RuntimeError::IntRequired(s.clone())),
        }
    }

    /// String form used for label values and text cells.
    fn to_label(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format!("{}", f),
            Value::Str(s) => s.clone(),
        }
    }
}

fn arith(op: &Instr, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    // + concatenates when both sides are strings
    if let (Instr::Add, Value::Str(x), Value::Str(y)) = (op, a, b) {
        let mut out = x.clone();
        out.push_str(y);
        return Ok(Value::Str(out));
    }

    match (a.as_num()?, b.as_num()?) {
        (Num::Int(x), Num::Int(y)) => int_arith(op, x, y),
        (x, y) => {
            let (x, y) = (num_f64(x), num_f64(y));
            float_arith(op, x, y)
        }
    }
}

fn num_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

fn int_arith(op: &Instr, x: i64, y: i64) -> Result<Value, RuntimeError> {
    let v = match op {
        Instr::Add => x.wrapping_add(y),
        Instr::Sub => x.wrapping_sub(y),
        Instr::Mul => x.wrapping_mul(y),
        Instr::Div => {
            if y == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            x / y
        }
        Instr::Mod => {
            if y == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            x % y
        }
        _ => return Err(RuntimeError::Internal("non-arithmetic opcode")),
    };
    Ok(Value::Int(v))
}

fn float_arith(op: &Instr, x: f64, y: f64) -> Result<Value, RuntimeError> {
    let v = match op {
        Instr::Add => x + y,
        Instr::Sub => x - y,
        Instr::Mul => x * y,
        Instr::Div => {
            if y == 0.0 {
                return Err(RuntimeError::DivideByZero);
            }
            x / y
        }
        Instr::Mod => {
            if y == 0.0 {
                return Err(RuntimeError::DivideByZero);
            }
            x % y
        }
        _ => return Err(RuntimeError::Internal("non-arithmetic opcode")),
    };
    Ok(Value::Float(v))
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    // two strings compare lexicographically, anything else numerically
    if let (Value::Str(x), Value::Str(y)) = (a, b) {
        return Ok(match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        });
    }

    let (x, y) = (a.as_f64()?, b.as_f64()?);
    Ok(match op {
        CmpOp::Eq => x == y,
        CmpOp::Ne => x != y,
        CmpOp::Lt => x < y,
        CmpOp::Le => x <= y,
        CmpOp::Gt => x > y,
        CmpOp::Ge => x >= y,
    })
}

struct RecoverPoint {
    pc: usize,
    depth: usize,
    scope_depth: usize,
    pos_idx: u32,
}

/// Executes programs against lines, mutating the shared store.
pub struct Vm {
    store: Arc<MetricStore>,
    /// `prog_runtime_errors_total` keyed by program name.
    errors_metric: Option<Arc<Metric>>,
}

impl Vm {
    pub fn new(store: Arc<MetricStore>, errors_metric: Option<Arc<Metric>>) -> Self {
        Self {
            store,
            errors_metric,
        }
    }

    fn metric(&self, prog: &Program, slot: u16) -> Result<Arc<Metric>, RuntimeError> {
        let id = *prog
            .metric_ids
            .get(slot as usize)
            .ok_or(RuntimeError::Internal("metric slot out of range"))?;
        self.store.metric(id).ok_or(RuntimeError::RetiredMetric)
    }

    fn count_error(&self, prog: &Program) {
        if let Some(metric) = &self.errors_metric {
            if let Ok(cell) = metric.cell(&[prog.name.clone()]) {
                cell.inc(1.0);
            }
        }
    }

    /// Run one program against one line.
    pub fn run(&self, prog: &Program, line: &LogLine) {
        let text = line.text.as_str();

        let mut stack: Vec<Value> = Vec::with_capacity(prog.frame_size);
        let mut scopes: Vec<u16> = Vec::new();
        let mut cache: Vec<Option<Option<Captures<'_>>>> =
            (0..prog.regexes.len()).map(|_| None).collect();
        let mut ts_ms: i64 = now_ms();
        let mut recover: Option<RecoverPoint> = None;

        let mut pc = 0usize;
        while pc < prog.instrs.len() {
            let mut next_pc = pc + 1;

            let step: Result<(), RuntimeError> = (|| {
                match &prog.instrs[pc] {
                    Instr::PushInt(v) => stack.push(Value::Int(*v)),
                    Instr::PushFloat(v) => stack.push(Value::Float(*v)),
                    Instr::PushStr(idx) => stack.push(Value::Str(prog.strs[*idx as usize].clone())),

                    Instr::LoadCapture { frame, group } => {
                        let scope_at = scopes
                            .len()
                            .checked_sub(1 + *frame as usize)
                            .ok_or(RuntimeError::Internal("capture frame underflow"))?;
                        let regex_idx = scopes[scope_at] as usize;
                        let caps = cache[regex_idx]
                            .as_ref()
                            .and_then(|c| c.as_ref())
                            .ok_or(RuntimeError::Internal("capture scope without a match"))?;
                        let value = caps
                            .get(*group as usize)
                            .map(|m| m.as_str())
                            .unwrap_or("");
                        stack.push(Value::Str(value.to_string()));
                    }

                    Instr::Match(idx) => {
                        let i = *idx as usize;
                        if cache[i].is_none() {
                            cache[i] = Some(prog.regexes[i].captures(text));
                        }
                        let matched = matches!(&cache[i], Some(Some(_)));
                        stack.push(Value::Int(matched as i64));
                    }
                    Instr::PushScope(idx) => scopes.push(*idx),
                    Instr::PopScope => {
                        scopes.pop();
                    }

                    Instr::LoadCell { slot, nkeys } => {
                        let labels = pop_labels(&mut stack, *nkeys)?;
                        let metric = self.metric(prog, *slot)?;
                        let cell = metric.cell(&labels)?;
                        let value = match cell.snapshot().0 {
                            CellValue::Number(n) => Value::Float(n),
                            CellValue::Text(t) => Value::Str(t),
                            CellValue::Histogram(h) => Value::Float(h.sum),
                        };
                        stack.push(value);
                    }
                    Instr::SetCell { slot, nkeys } => {
                        let value = pop(&mut stack)?;
                        let labels = pop_labels(&mut stack, *nkeys)?;
                        let metric = self.metric(prog, *slot)?;
                        let cell = metric.cell(&labels)?;
                        match metric.desc().kind {
                            MetricKind::Histogram => cell.observe_at(value.as_f64()?, ts_ms),
                            MetricKind::Gauge | MetricKind::Timer => {
                                cell.set_at(value.as_f64()?, ts_ms)
                            }
                            MetricKind::Text => cell.set_text_at(value.to_label(), ts_ms),
                            MetricKind::Counter => {
                                return Err(RuntimeError::Internal(
                                    "assignment to counter passed the checker",
                                ))
                            }
                        }
                    }
                    Instr::IncCell {
                        slot,
                        nkeys,
                        pop_delta,
                    } => {
                        let delta = if *pop_delta { pop(&mut stack)?.as_f64()? } else { 1.0 };
                        let labels = pop_labels(&mut stack, *nkeys)?;
                        let metric = self.metric(prog, *slot)?;
                        if metric.desc().kind == MetricKind::Counter && delta < 0.0 {
                            return Err(RuntimeError::CounterDecrement(delta));
                        }
                        metric.cell(&labels)?.inc_at(delta, ts_ms);
                    }
                    Instr::DelCell { slot, nkeys } => {
                        let labels = pop_labels(&mut stack, *nkeys)?;
                        let metric = self.metric(prog, *slot)?;
                        metric.remove_cell(&labels)?;
                    }

                    op @ (Instr::Add | Instr::Sub | Instr::Mul | Instr::Div | Instr::Mod) => {
                        let b = pop(&mut stack)?;
                        let a = pop(&mut stack)?;
                        stack.push(arith(op, &a, &b)?);
                    }
                    Instr::BitAnd | Instr::BitOr | Instr::BitXor | Instr::Shl | Instr::Shr => {
                        let b = pop(&mut stack)?.as_int()?;
                        let a = pop(&mut stack)?.as_int()?;
                        let v = match &prog.instrs[pc] {
                            Instr::BitAnd => a & b,
                            Instr::BitOr => a | b,
                            Instr::BitXor => a ^ b,
                            Instr::Shl => a.wrapping_shl(b as u32),
                            Instr::Shr => a.wrapping_shr(b as u32),
                            _ => unreachable!(),
                        };
                        stack.push(Value::Int(v));
                    }
                    Instr::Neg => {
                        let v = pop(&mut stack)?;
                        let out = match v.as_num()? {
                            Num::Int(i) => Value::Int(-i),
                            Num::Float(f) => Value::Float(-f),
                        };
                        stack.push(out);
                    }
                    Instr::Not => {
                        let v = pop(&mut stack)?;
                        stack.push(Value::Int(!v.truthy() as i64));
                    }
                    Instr::Cmp(op) => {
                        let b = pop(&mut stack)?;
                        let a = pop(&mut stack)?;
                        stack.push(Value::Int(compare(*op, &a, &b)? as i64));
                    }

                    Instr::Jump(target) => next_pc = *target as usize,
                    Instr::JumpIfFalse(target) => {
                        if !pop(&mut stack)?.truthy() {
                            next_pc = *target as usize;
                        }
                    }
                    Instr::JumpIfTrue(target) => {
                        if pop(&mut stack)?.truthy() {
                            next_pc = *target as usize;
                        }
                    }

                    Instr::Call { builtin, argc } => {
                        let mut args = Vec::with_capacity(*argc as usize);
                        for _ in 0..*argc {
                            args.push(pop(&mut stack)?);
                        }
                        args.reverse();

                        let result = match builtin {
                            Builtin::Strptime => {
                                let input = args[0].to_label();
                                let format = args[1].to_label();
                                let parsed =
                                    chrono::NaiveDateTime::parse_from_str(&input, &format)
                                        .map_err(|_| RuntimeError::Strptime {
                                            input: input.clone(),
                                            format: format.clone(),
                                        })?;
                                let secs = parsed.and_utc().timestamp();
                                ts_ms = secs * 1000;
                                Value::Int(secs)
                            }
                            Builtin::Tolower => Value::Str(args[0].to_label().to_lowercase()),
                            Builtin::Int => match args[0].as_num()? {
                                Num::Int(i) => Value::Int(i),
                                Num::Float(f) => Value::Int(f as i64),
                            },
                            Builtin::Float => Value::Float(args[0].as_f64()?),
                            Builtin::Len => {
                                Value::Int(args[0].to_label().chars().count() as i64)
                            }
                            Builtin::Timestamp => Value::Int(ts_ms / 1000),
                            Builtin::Getfilename => {
                                Value::Str(line.path.display().to_string())
                            }
                            Builtin::Settime => {
                                let secs = match args[0].as_num()? {
                                    Num::Int(i) => i,
                                    Num::Float(f) => f as i64,
                                };
                                ts_ms = secs * 1000;
                                Value::Int(secs)
                            }
                        };
                        stack.push(result);
                    }
                    Instr::Pop => {
                        pop(&mut stack)?;
                    }

                    Instr::Stmt { recover: r, pos_idx } => {
                        recover = Some(RecoverPoint {
                            pc: *r as usize,
                            depth: stack.len(),
                            scope_depth: scopes.len(),
                            pos_idx: *pos_idx,
                        });
                    }
                }
                Ok(())
            })();

            match step {
                Ok(()) => pc = next_pc,
                Err(e) => {
                    self.count_error(prog);
                    match &recover {
                        Some(r) => {
                            warn!(
                                program = %prog.name,
                                pos = %prog.stmt_pos[r.pos_idx as usize],
                                "runtime error, skipping statement: {}", e
                            );
                            stack.truncate(r.depth);
                            scopes.truncate(r.scope_depth);
                            pc = r.pc;
                        }
                        None => {
                            warn!(program = %prog.name, "runtime error outside statement: {}", e);
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, RuntimeError> {
    stack.pop().ok_or(RuntimeError::Internal("operand stack underflow"))
}

fn pop_labels(stack: &mut Vec<Value>, nkeys: u8) -> Result<Vec<String>, RuntimeError> {
    let mut labels = Vec::with_capacity(nkeys as usize);
    for _ in 0..nkeys {
        labels.push(pop(stack)?.to_label());
    }
    labels.reverse();
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CellValue, MetricStore, OnConflict};
    use crate::runtime::compile;
    use std::path::PathBuf;

    fn load(store: &Arc<MetricStore>, name: &str, source: &str) -> Program {
        let mut prog = compile(name, source).unwrap();
        let ids = prog
            .decls
            .iter()
            .map(|d| store.declare(d.clone(), OnConflict::Replace).unwrap())
            .collect();
        prog.bind_metrics(ids);
        prog
    }

    fn line(text: &str) -> LogLine {
        LogLine::new(Arc::new(PathBuf::from("/logs/app.log")), text.to_string())
    }

    fn number(store: &MetricStore, prog: &str, name: &str, labels: &[&str]) -> f64 {
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        store
            .lookup(prog, name)
            .unwrap()
            .cell(&labels)
            .unwrap()
            .number()
    }

    #[test]
    fn counter_increment_with_captures() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "web",
            "counter hits by code\n\
             /code=(?P<code>\\d+)/ {\n\
               hits[$code]++\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("code=200 GET /"));
        vm.run(&prog, &line("code=200 GET /about"));
        vm.run(&prog, &line("code=500 GET /break"));
        vm.run(&prog, &line("no match here"));

        assert_eq!(2.0, number(&store, "web", "hits", &["200"]));
        assert_eq!(1.0, number(&store, "web", "hits", &["500"]));
    }

    #[test]
    fn fall_through_fires_every_matching_block() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "p",
            "counter total\n\
             counter errors\n\
             /./ {\n\
               total++\n\
             }\n\
             /error/ {\n\
               errors++\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("an error occurred"));
        vm.run(&prog, &line("all fine"));

        assert_eq!(2.0, number(&store, "p", "total", &[]));
        assert_eq!(1.0, number(&store, "p", "errors", &[]));
    }

    #[test]
    fn rails_style_histogram_layering() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "rails",
            "counter rails_requests_completed_total\n\
             counter rails_requests_completed by status\n\
             histogram rails_requests_completed_seconds by status buckets 2.5, 5, 15\n\
             /Completed (?P<status>\\d{3}) .* in (?P<ms>\\d+)ms/ {\n\
               rails_requests_completed_total++\n\
               rails_requests_completed[$status]++\n\
               rails_requests_completed_seconds[$status] = $ms / 1000.0\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(
            &prog,
            &line("Completed 200 OK in 1500ms (Views: 1000.0ms | ActiveRecord: 200.0ms)"),
        );

        assert_eq!(
            1.0,
            number(&store, "rails", "rails_requests_completed_total", &[])
        );
        assert_eq!(
            1.0,
            number(&store, "rails", "rails_requests_completed", &["200"])
        );

        let cell = store
            .lookup("rails", "rails_requests_completed_seconds")
            .unwrap()
            .cell(&["200".to_string()])
            .unwrap();
        match cell.snapshot().0 {
            CellValue::Histogram(h) => {
                assert_eq!(vec![1, 1, 1], h.counts);
                assert_eq!(1, h.count);
                assert_eq!(1.5, h.sum);
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn runtime_error_skips_statement_and_continues() {
        let store = Arc::new(MetricStore::new());
        let errors = store
            .declare(
                crate::metrics::MetricDesc::with_labels(
                    "",
                    "prog_runtime_errors_total",
                    crate::metrics::MetricKind::Counter,
                    &["prog"],
                ),
                OnConflict::Fail,
            )
            .unwrap();
        let errors_metric = store.metric(errors).unwrap();

        let prog = load(
            &store,
            "p",
            "counter good\n\
             counter bad\n\
             /val=(?P<v>\\S+)/ {\n\
               bad += $v\n\
               good++\n\
             }",
        );
        let vm = Vm::new(store.clone(), Some(errors_metric.clone()));

        vm.run(&prog, &line("val=nonsense"));

        // the bad coercion skipped its statement, the next one still ran
        assert_eq!(0.0, number(&store, "p", "bad", &[]));
        assert_eq!(1.0, number(&store, "p", "good", &[]));
        assert_eq!(1.0, errors_metric.cell(&["p".to_string()]).unwrap().number());

        vm.run(&prog, &line("val=3"));
        assert_eq!(3.0, number(&store, "p", "bad", &[]));
        assert_eq!(2.0, number(&store, "p", "good", &[]));
    }

    #[test]
    fn divide_by_zero_is_confined() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "p",
            "gauge g\n\
             counter after\n\
             /./ {\n\
               g = 1 / 0\n\
               after++\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("x"));

        assert_eq!(0.0, number(&store, "p", "g", &[]));
        assert_eq!(1.0, number(&store, "p", "after", &[]));
    }

    #[test]
    fn settime_controls_sample_timestamps() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "p",
            "counter c\n\
             /./ {\n\
               settime(1600000000)\n\
               c++\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("x"));

        let (_, ts) = store.lookup("p", "c").unwrap().cell(&[]).unwrap().snapshot();
        assert_eq!(1_600_000_000_000, ts);
    }

    #[test]
    fn strptime_parses_and_sets_line_time() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "p",
            "counter c\n\
             /^(?P<date>\\d+-\\d+-\\d+ \\d+:\\d+:\\d+)/ {\n\
               strptime($date, \"%Y-%m-%d %H:%M:%S\")\n\
               c++\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("2020-09-13 12:26:40 something happened"));

        let (_, ts) = store.lookup("p", "c").unwrap().cell(&[]).unwrap().snapshot();
        assert_eq!(1_600_000_000_000, ts);
    }

    #[test]
    fn del_removes_a_cell() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "p",
            "gauge g by k\n\
             /add (?P<k>\\w+)/ {\n\
               g[$k] = 1\n\
             }\n\
             /drop (?P<k>\\w+)/ {\n\
               del g[$k]\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("add alpha"));
        assert_eq!(1, store.snapshot().iter().map(|m| m.cells.len()).sum::<usize>());

        vm.run(&prog, &line("drop alpha"));
        assert_eq!(0, store.snapshot().iter().map(|m| m.cells.len()).sum::<usize>());
    }

    #[test]
    fn expressions_evaluate() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "p",
            "gauge a\n\
             gauge b\n\
             gauge c\n\
             gauge d\n\
             /(?P<n>\\d+)/ {\n\
               a = $n > 10 ? 1 : 0\n\
               b = ($n + 1) * 2\n\
               c = $n % 4\n\
               d = ($n >> 2) & 3\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("14"));

        assert_eq!(1.0, number(&store, "p", "a", &[]));
        assert_eq!(30.0, number(&store, "p", "b", &[]));
        assert_eq!(2.0, number(&store, "p", "c", &[]));
        assert_eq!(3.0, number(&store, "p", "d", &[]));
    }

    #[test]
    fn string_builtins_and_concat() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "p",
            "text who\n\
             gauge l\n\
             /user=(?P<u>\\w+)/ {\n\
               who = \"user:\" + tolower($u)\n\
               l = len($u)\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("user=ALICE"));

        let cell = store.lookup("p", "who").unwrap().cell(&[]).unwrap();
        assert_eq!(CellValue::Text("user:alice".into()), cell.snapshot().0);
        assert_eq!(5.0, number(&store, "p", "l", &[]));
    }

    #[test]
    fn getfilename_exposes_the_line_source() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "p",
            "text from\n\
             /./ {\n\
               from = getfilename()\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("x"));

        let cell = store.lookup("p", "from").unwrap().cell(&[]).unwrap();
        assert_eq!(
            CellValue::Text("/logs/app.log".into()),
            cell.snapshot().0
        );
    }

    #[test]
    fn condition_blocks_gate_on_metric_values() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "p",
            "counter seen\n\
             gauge alert\n\
             /./ {\n\
               seen++\n\
               seen > 2 {\n\
                 alert = 1\n\
               }\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("a"));
        vm.run(&prog, &line("b"));
        assert_eq!(0.0, number(&store, "p", "alert", &[]));

        vm.run(&prog, &line("c"));
        assert_eq!(1.0, number(&store, "p", "alert", &[]));
    }

    #[test]
    fn timer_assignment_stores_last_duration() {
        let store = Arc::new(MetricStore::new());
        let prog = load(
            &store,
            "p",
            "timer gc_seconds\n\
             /gc took (?P<s>[0-9.]+)s/ {\n\
               gc_seconds = $s\n\
             }",
        );
        let vm = Vm::new(store.clone(), None);

        vm.run(&prog, &line("gc took 0.25s"));
        vm.run(&prog, &line("gc took 0.5s"));

        assert_eq!(0.5, number(&store, "p", "gc_seconds", &[]));
    }
}
