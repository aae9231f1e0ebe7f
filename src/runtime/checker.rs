// SPDX-License-Identifier: Apache-2.0

//! Semantic checks between parsing and code generation.
//!
//! Validates metric declarations (duplicates, bucket lists), metric use
//! (known names, label arity, operations legal for the kind), function
//! calls (known builtin, arity), pattern regexes, and capture references
//! against the enclosing patterns' capture groups.

use std::collections::HashMap;

use regex::Regex;

use crate::metrics::MetricKind;

use super::ast::*;
use super::bytecode::Builtin;
use super::error::{CompileError, Pos};

pub fn check(prog: &SourceProgram) -> Result<(), CompileError> {
    let mut metrics: HashMap<&str, &MetricDeclNode> = HashMap::new();

    for decl in &prog.decls {
        if metrics.insert(decl.name.as_str(), decl).is_some() {
            return Err(CompileError::Redeclared {
                name: decl.name.clone(),
                pos: decl.pos,
            });
        }
        check_buckets(decl)?;
    }

    let mut checker = Checker {
        metrics,
        patterns: Vec::new(),
    };
    for block in &prog.blocks {
        checker.block(block)?;
    }
    Ok(())
}

fn check_buckets(decl: &MetricDeclNode) -> Result<(), CompileError> {
    match decl.kind {
        MetricKind::Histogram => {
            if decl.buckets.is_empty() {
                return Err(CompileError::InvalidBuckets {
                    message: format!("histogram '{}' needs a buckets list", decl.name),
                    pos: decl.pos,
                });
            }
            for pair in decl.buckets.windows(2) {
                if pair[1] <= pair[0] {
                    return Err(CompileError::InvalidBuckets {
                        message: format!(
                            "histogram '{}' buckets must be strictly increasing",
                            decl.name
                        ),
                        pos: decl.pos,
                    });
                }
            }
        }
        _ if !decl.buckets.is_empty() => {
            return Err(CompileError::InvalidBuckets {
                message: format!("only histograms take buckets, '{}' does not", decl.name),
                pos: decl.pos,
            });
        }
        _ => {}
    }
    Ok(())
}

/// Capture groups of one enclosing pattern block.
struct PatternScope {
    names: Vec<String>,
    group_count: usize,
}

struct Checker<'a> {
    metrics: HashMap<&'a str, &'a MetricDeclNode>,
    patterns: Vec<PatternScope>,
}

impl<'a> Checker<'a> {
    fn block(&mut self, block: &'a BlockNode) -> Result<(), CompileError> {
        let entered_pattern = match &block.cond {
            CondNode::Pattern { pattern, pos } => {
                let regex = Regex::new(pattern).map_err(|e| CompileError::BadRegex {
                    message: e.to_string(),
                    pos: *pos,
                })?;
                self.patterns.push(PatternScope {
                    names: regex
                        .capture_names()
                        .flatten()
                        .map(|n| n.to_string())
                        .collect(),
                    group_count: regex.captures_len() - 1,
                });
                true
            }
            CondNode::Expr(expr) => {
                self.expr(expr)?;
                false
            }
        };

        let result = block.body.iter().try_for_each(|stmt| self.stmt(stmt));

        if entered_pattern {
            self.patterns.pop();
        }
        result
    }

    fn stmt(&mut self, stmt: &'a StmtNode) -> Result<(), CompileError> {
        match stmt {
            StmtNode::Block(block) => self.block(block),
            StmtNode::Assign { target, value, pos } => {
                let decl = self.target(target)?;
                if decl.kind == MetricKind::Counter {
                    return Err(CompileError::InvalidOperation {
                        message: format!(
                            "counter '{}' can only be incremented, not assigned",
                            target.name
                        ),
                        pos: *pos,
                    });
                }
                self.expr(value)
            }
            StmtNode::Inc { target, delta, pos } => {
                let decl = self.target(target)?;
                if !matches!(decl.kind, MetricKind::Counter | MetricKind::Gauge) {
                    return Err(CompileError::InvalidOperation {
                        message: format!(
                            "{} '{}' cannot be incremented",
                            decl.kind, target.name
                        ),
                        pos: *pos,
                    });
                }
                match delta {
                    Some(delta) => self.expr(delta),
                    None => Ok(()),
                }
            }
            StmtNode::Del { target, .. } => self.target(target).map(|_| ()),
            StmtNode::Call { call, .. } => self.call(call),
        }
    }

    fn target(&mut self, target: &'a TargetNode) -> Result<&'a MetricDeclNode, CompileError> {
        let decl = match self.metrics.get(target.name.as_str()) {
            Some(decl) => *decl,
            None => {
                return Err(CompileError::UnknownMetric {
                    name: target.name.clone(),
                    pos: target.pos,
                })
            }
        };

        if target.keys.len() != decl.label_keys.len() {
            return Err(CompileError::ArityMismatch {
                name: target.name.clone(),
                want: decl.label_keys.len(),
                got: target.keys.len(),
                pos: target.pos,
            });
        }

        for key in &target.keys {
            self.expr(key)?;
        }

        Ok(decl)
    }

    fn call(&mut self, call: &'a CallNode) -> Result<(), CompileError> {
        let (_, want) = match Builtin::resolve(&call.name) {
            Some(found) => found,
            None => {
                return Err(CompileError::UnknownFunction {
                    name: call.name.clone(),
                    pos: call.pos,
                })
            }
        };

        if call.args.len() != want {
            return Err(CompileError::FunctionArity {
                name: call.name.clone(),
                want,
                got: call.args.len(),
                pos: call.pos,
            });
        }

        for arg in &call.args {
            self.expr(arg)?;
        }
        Ok(())
    }

    fn capture_name(&self, name: &str, pos: Pos) -> Result<(), CompileError> {
        if self.patterns.is_empty() {
            return Err(CompileError::CaptureOutsidePattern { pos });
        }
        // innermost pattern wins; outer patterns remain reachable for
        // names the inner one does not bind
        if self
            .patterns
            .iter()
            .rev()
            .any(|p| p.names.iter().any(|n| n == name))
        {
            Ok(())
        } else {
            Err(CompileError::UnknownCapture {
                name: name.to_string(),
                pos,
            })
        }
    }

    fn capture_num(&self, index: u32, pos: Pos) -> Result<(), CompileError> {
        match self.patterns.last() {
            None => Err(CompileError::CaptureOutsidePattern { pos }),
            Some(p) if index as usize > p.group_count => {
                Err(CompileError::CaptureOutOfRange { index, pos })
            }
            Some(_) => Ok(()),
        }
    }

    fn expr(&mut self, expr: &'a ExprNode) -> Result<(), CompileError> {
        match expr {
            ExprNode::Int { .. } | ExprNode::Float { .. } | ExprNode::Str { .. } => Ok(()),
            ExprNode::CaptureName { name, pos } => self.capture_name(name, *pos),
            ExprNode::CaptureNum { index, pos } => self.capture_num(*index, *pos),
            ExprNode::MetricRead(target) => self.target(target).map(|_| ()),
            ExprNode::Call(call) => self.call(call),
            ExprNode::Unary { operand, .. } => self.expr(operand),
            ExprNode::Binary { lhs, rhs, .. } => {
                self.expr(lhs)?;
                self.expr(rhs)
            }
            ExprNode::Ternary {
                cond,
                then,
                otherwise,
                ..
            } => {
                self.expr(cond)?;
                self.expr(then)?;
                self.expr(otherwise)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::lexer::lex;
    use crate::runtime::parser::parse;

    fn check_src(source: &str) -> Result<(), CompileError> {
        check(&parse(lex(source).unwrap()).unwrap())
    }

    #[test]
    fn valid_program_passes() {
        check_src(
            "counter hits by code\n\
             histogram latency buckets 1, 2.5, 5\n\
             /code=(?P<code>\\d+) t=(?P<t>\\d+)/ {\n\
               hits[$code]++\n\
               latency = $t\n\
             }",
        )
        .unwrap();
    }

    #[test]
    fn duplicate_declaration() {
        let err = check_src("counter c\ngauge c").unwrap_err();
        assert!(matches!(err, CompileError::Redeclared { name, .. } if name == "c"));
    }

    #[test]
    fn histogram_requires_buckets() {
        let err = check_src("histogram h").unwrap_err();
        assert!(matches!(err, CompileError::InvalidBuckets { .. }));
    }

    #[test]
    fn buckets_must_increase() {
        let err = check_src("histogram h buckets 5, 5").unwrap_err();
        assert!(matches!(err, CompileError::InvalidBuckets { .. }));
    }

    #[test]
    fn buckets_on_counter_rejected() {
        let err = check_src("counter c buckets 1, 2").unwrap_err();
        assert!(matches!(err, CompileError::InvalidBuckets { .. }));
    }

    #[test]
    fn unknown_metric() {
        let err = check_src("/x/ {\n nope++\n}").unwrap_err();
        assert!(matches!(err, CompileError::UnknownMetric { name, .. } if name == "nope"));
    }

    #[test]
    fn arity_mismatch() {
        let err = check_src("counter c by a, b\n/x/ {\n c[\"1\"]++\n}").unwrap_err();
        assert!(matches!(
            err,
            CompileError::ArityMismatch { want: 2, got: 1, .. }
        ));
    }

    #[test]
    fn counter_assignment_rejected() {
        let err = check_src("counter c\n/x/ {\n c = 5\n}").unwrap_err();
        assert!(matches!(err, CompileError::InvalidOperation { .. }));
    }

    #[test]
    fn histogram_increment_rejected() {
        let err = check_src("histogram h buckets 1\n/x/ {\n h++\n}").unwrap_err();
        assert!(matches!(err, CompileError::InvalidOperation { .. }));
    }

    #[test]
    fn bad_regex_is_reported_with_position() {
        let err = check_src("counter c\n/([unclosed/ {\n c++\n}").unwrap_err();
        match err {
            CompileError::BadRegex { pos, .. } => assert_eq!(2, pos.line),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn unknown_capture_name() {
        let err = check_src("counter c\n/(?P<a>.)/ {\n c += $b\n}").unwrap_err();
        assert!(matches!(err, CompileError::UnknownCapture { name, .. } if name == "b"));
    }

    #[test]
    fn capture_outside_pattern() {
        let err = check_src("gauge g\n1 > 0 {\n g = $1\n}").unwrap_err();
        assert!(matches!(err, CompileError::CaptureOutsidePattern { .. }));
    }

    #[test]
    fn numbered_capture_out_of_range() {
        let err = check_src("gauge g\n/(.)(.)/ {\n g = $3\n}").unwrap_err();
        assert!(matches!(err, CompileError::CaptureOutOfRange { index: 3, .. }));
    }

    #[test]
    fn outer_captures_reachable_from_nested_pattern() {
        check_src(
            "counter c by outer, inner\n\
             /(?P<out>a.)/ {\n\
               /(?P<in>b.)/ {\n\
                 c[$out, $in]++\n\
               }\n\
             }",
        )
        .unwrap();
    }

    #[test]
    fn unknown_function() {
        let err = check_src("counter c\n/x/ {\n frobnicate(1)\n}").unwrap_err();
        assert!(matches!(err, CompileError::UnknownFunction { .. }));
    }

    #[test]
    fn function_arity() {
        let err = check_src("counter c\n/x/ {\n settime()\n}").unwrap_err();
        assert!(matches!(
            err,
            CompileError::FunctionArity { want: 1, got: 0, .. }
        ));
    }
}
