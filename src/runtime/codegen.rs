// SPDX-License-Identifier: Apache-2.0

//! Bytecode emission. Runs after the checker, so name/arity/kind errors
//! are already ruled out; what remains here is instruction selection,
//! jump fixups, constant pooling, and capture-group resolution.

use std::collections::HashMap;

use regex::Regex;

use crate::metrics::MetricDesc;

use super::ast::*;
use super::bytecode::{Builtin, CmpOp, Instr, Program};
use super::error::{CompileError, Pos};

pub fn generate(name: &str, src: &SourceProgram) -> Result<Program, CompileError> {
    let mut gen = Gen {
        program: name.to_string(),
        instrs: Vec::new(),
        strs: Vec::new(),
        str_index: HashMap::new(),
        regexes: Vec::new(),
        decls: Vec::new(),
        slots: HashMap::new(),
        stmt_pos: Vec::new(),
        scopes: Vec::new(),
        depth: 0,
        max_depth: 0,
    };

    for decl in &src.decls {
        let slot = gen.decls.len() as u16;
        gen.slots.insert(decl.name.clone(), slot);
        gen.decls.push(MetricDesc {
            program: gen.program.clone(),
            name: decl.name.clone(),
            kind: decl.kind,
            label_keys: decl.label_keys.clone(),
            buckets: decl.buckets.clone(),
        });
    }

    for block in &src.blocks {
        gen.block(block)?;
    }

    Ok(Program {
        name: gen.program,
        instrs: gen.instrs,
        strs: gen.strs,
        regexes: gen.regexes,
        decls: gen.decls,
        metric_ids: Vec::new(),
        stmt_pos: gen.stmt_pos,
        frame_size: gen.max_depth.max(4) as usize,
    })
}

/// Capture-group bindings of one enclosing pattern block.
struct Scope {
    names: HashMap<String, u16>,
}

struct Gen {
    program: String,
    instrs: Vec<Instr>,
    strs: Vec<String>,
    str_index: HashMap<String, u32>,
    regexes: Vec<Regex>,
    decls: Vec<MetricDesc>,
    slots: HashMap<String, u16>,
    stmt_pos: Vec<Pos>,
    scopes: Vec<Scope>,
    depth: i32,
    max_depth: i32,
}

impl Gen {
    fn emit(&mut self, instr: Instr) -> usize {
        self.depth += stack_effect(&instr);
        if self.depth > self.max_depth {
            self.max_depth = self.depth;
        }
        self.instrs.push(instr);
        self.instrs.len() - 1
    }

    fn here(&self) -> u32 {
        self.instrs.len() as u32
    }

    fn patch(&mut self, at: usize, target: u32) {
        match &mut self.instrs[at] {
            Instr::Jump(t) | Instr::JumpIfFalse(t) | Instr::JumpIfTrue(t) => *t = target,
            Instr::Stmt { recover, .. } => *recover = target,
            other => unreachable!("patching non-jump instruction {:?}", other),
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.str_index.get(s) {
            return idx;
        }
        let idx = self.strs.len() as u32;
        self.strs.push(s.to_string());
        self.str_index.insert(s.to_string(), idx);
        idx
    }

    /// Open a statement: emit the recovery marker with a placeholder
    /// target, to be patched once the statement's end is known.
    fn stmt_begin(&mut self, pos: Pos) -> usize {
        let pos_idx = self.stmt_pos.len() as u32;
        self.stmt_pos.push(pos);
        self.emit(Instr::Stmt {
            recover: 0,
            pos_idx,
        })
    }

    fn block(&mut self, block: &BlockNode) -> Result<(), CompileError> {
        let marker = self.stmt_begin(block.pos);

        match &block.cond {
            CondNode::Pattern { pattern, pos } => {
                let regex = Regex::new(pattern).map_err(|e| CompileError::BadRegex {
                    message: e.to_string(),
                    pos: *pos,
                })?;

                let names: HashMap<String, u16> = regex
                    .capture_names()
                    .enumerate()
                    .filter_map(|(i, name)| name.map(|n| (n.to_string(), i as u16)))
                    .collect();

                let regex_idx = self.regexes.len() as u16;
                self.regexes.push(regex);

                self.emit(Instr::Match(regex_idx));
                let skip = self.emit(Instr::JumpIfFalse(0));

                self.emit(Instr::PushScope(regex_idx));
                self.scopes.push(Scope { names });
                for stmt in &block.body {
                    self.stmt(stmt)?;
                }
                self.scopes.pop();
                self.emit(Instr::PopScope);

                let end = self.here();
                self.patch(skip, end);
                self.patch(marker, end);
            }
            CondNode::Expr(cond) => {
                self.expr(cond)?;
                let skip = self.emit(Instr::JumpIfFalse(0));

                for stmt in &block.body {
                    self.stmt(stmt)?;
                }

                let end = self.here();
                self.patch(skip, end);
                self.patch(marker, end);
            }
        }

        Ok(())
    }

    fn stmt(&mut self, stmt: &StmtNode) -> Result<(), CompileError> {
        match stmt {
            StmtNode::Block(block) => self.block(block),
            StmtNode::Assign { target, value, pos } => {
                let marker = self.stmt_begin(*pos);
                let (slot, nkeys) = self.keys(target)?;
                self.expr(value)?;
                self.emit(Instr::SetCell { slot, nkeys });
                let end = self.here();
                self.patch(marker, end);
                Ok(())
            }
            StmtNode::Inc { target, delta, pos } => {
                let marker = self.stmt_begin(*pos);
                let (slot, nkeys) = self.keys(target)?;
                let pop_delta = delta.is_some();
                if let Some(delta) = delta {
                    self.expr(delta)?;
                }
                self.emit(Instr::IncCell {
                    slot,
                    nkeys,
                    pop_delta,
                });
                let end = self.here();
                self.patch(marker, end);
                Ok(())
            }
            StmtNode::Del { target, pos } => {
                let marker = self.stmt_begin(*pos);
                let (slot, nkeys) = self.keys(target)?;
                self.emit(Instr::DelCell { slot, nkeys });
                let end = self.here();
                self.patch(marker, end);
                Ok(())
            }
            StmtNode::Call { call, pos } => {
                let marker = self.stmt_begin(*pos);
                self.call(call)?;
                self.emit(Instr::Pop);
                let end = self.here();
                self.patch(marker, end);
                Ok(())
            }
        }
    }

    /// Emit the label-key expressions of a target, returning its slot and
    /// key count.
    fn keys(&mut self, target: &TargetNode) -> Result<(u16, u8), CompileError> {
        let slot = self.slots[&target.name];
        for key in &target.keys {
            self.expr(key)?;
        }
        Ok((slot, target.keys.len() as u8))
    }

    fn call(&mut self, call: &CallNode) -> Result<(), CompileError> {
        let (builtin, _) = Builtin::resolve(&call.name).expect("checker validated builtins");
        for arg in &call.args {
            self.expr(arg)?;
        }
        self.emit(Instr::Call {
            builtin,
            argc: call.args.len() as u8,
        });
        Ok(())
    }

    fn capture_name(&mut self, name: &str, pos: Pos) -> Result<(), CompileError> {
        for (frame, scope) in self.scopes.iter().rev().enumerate() {
            if let Some(&group) = scope.names.get(name) {
                self.emit(Instr::LoadCapture {
                    frame: frame as u8,
                    group,
                });
                return Ok(());
            }
        }
        // checker verified the name resolves
        Err(CompileError::UnknownCapture {
            name: name.to_string(),
            pos,
        })
    }

    fn expr(&mut self, expr: &ExprNode) -> Result<(), CompileError> {
        match expr {
            ExprNode::Int { value, .. } => {
                self.emit(Instr::PushInt(*value));
                Ok(())
            }
            ExprNode::Float { value, .. } => {
                self.emit(Instr::PushFloat(*value));
                Ok(())
            }
            ExprNode::Str { value, .. } => {
                let idx = self.intern(value);
                self.emit(Instr::PushStr(idx));
                Ok(())
            }
            ExprNode::CaptureName { name, pos } => self.capture_name(name, *pos),
            ExprNode::CaptureNum { index, .. } => {
                self.emit(Instr::LoadCapture {
                    frame: 0,
                    group: *index as u16,
                });
                Ok(())
            }
            ExprNode::MetricRead(target) => {
                let (slot, nkeys) = self.keys(target)?;
                self.emit(Instr::LoadCell { slot, nkeys });
                Ok(())
            }
            ExprNode::Call(call) => self.call(call),
            ExprNode::Unary { op, operand, .. } => {
                self.expr(operand)?;
                self.emit(match op {
                    UnaryOp::Neg => Instr::Neg,
                    UnaryOp::Not => Instr::Not,
                });
                Ok(())
            }
            ExprNode::Binary { op, lhs, rhs, .. } => self.binary(*op, lhs, rhs),
            ExprNode::Ternary {
                cond,
                then,
                otherwise,
                ..
            } => {
                self.expr(cond)?;
                let to_else = self.emit(Instr::JumpIfFalse(0));
                self.expr(then)?;
                let to_end = self.emit(Instr::Jump(0));
                let else_at = self.here();
                self.patch(to_else, else_at);
                // the then-branch value is gone on this path
                self.depth -= 1;
                self.expr(otherwise)?;
                let end = self.here();
                self.patch(to_end, end);
                Ok(())
            }
        }
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: &ExprNode,
        rhs: &ExprNode,
    ) -> Result<(), CompileError> {
        // && and || short-circuit and produce 1 or 0
        match op {
            BinaryOp::And => {
                self.expr(lhs)?;
                let fail1 = self.emit(Instr::JumpIfFalse(0));
                self.expr(rhs)?;
                let fail2 = self.emit(Instr::JumpIfFalse(0));
                self.emit(Instr::PushInt(1));
                let done = self.emit(Instr::Jump(0));
                let false_at = self.here();
                self.patch(fail1, false_at);
                self.patch(fail2, false_at);
                self.depth -= 1;
                self.emit(Instr::PushInt(0));
                let end = self.here();
                self.patch(done, end);
                return Ok(());
            }
            BinaryOp::Or => {
                self.expr(lhs)?;
                let ok1 = self.emit(Instr::JumpIfTrue(0));
                self.expr(rhs)?;
                let ok2 = self.emit(Instr::JumpIfTrue(0));
                self.emit(Instr::PushInt(0));
                let done = self.emit(Instr::Jump(0));
                let true_at = self.here();
                self.patch(ok1, true_at);
                self.patch(ok2, true_at);
                self.depth -= 1;
                self.emit(Instr::PushInt(1));
                let end = self.here();
                self.patch(done, end);
                return Ok(());
            }
            _ => {}
        }

        self.expr(lhs)?;
        self.expr(rhs)?;
        self.emit(match op {
            BinaryOp::Add => Instr::Add,
            BinaryOp::Sub => Instr::Sub,
            BinaryOp::Mul => Instr::Mul,
            BinaryOp::Div => Instr::Div,
            BinaryOp::Mod => Instr::Mod,
            BinaryOp::BitAnd => Instr::BitAnd,
            BinaryOp::BitOr => Instr::BitOr,
            BinaryOp::BitXor => Instr::BitXor,
            BinaryOp::Shl => Instr::Shl,
            BinaryOp::Shr => Instr::Shr,
            BinaryOp::Eq => Instr::Cmp(CmpOp::Eq),
            BinaryOp::Ne => Instr::Cmp(CmpOp::Ne),
            BinaryOp::Lt => Instr::Cmp(CmpOp::Lt),
            BinaryOp::Le => Instr::Cmp(CmpOp::Le),
            BinaryOp::Gt => Instr::Cmp(CmpOp::Gt),
            BinaryOp::Ge => Instr::Cmp(CmpOp::Ge),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        });
        Ok(())
    }
}

fn stack_effect(instr: &Instr) -> i32 {
    match instr {
        Instr::PushInt(_)
        | Instr::PushFloat(_)
        | Instr::PushStr(_)
        | Instr::LoadCapture { .. }
        | Instr::Match(_) => 1,
        Instr::LoadCell { nkeys, .. } => 1 - *nkeys as i32,
        Instr::SetCell { nkeys, .. } => -(*nkeys as i32) - 1,
        Instr::IncCell {
            nkeys, pop_delta, ..
        } => -(*nkeys as i32) - (*pop_delta as i32),
        Instr::DelCell { nkeys, .. } => -(*nkeys as i32),
        Instr::Add
        | Instr::Sub
        | Instr::Mul
        | Instr::Div
        | Instr::Mod
        | Instr::BitAnd
        | Instr::BitOr
        | Instr::BitXor
        | Instr::Shl
        | Instr::Shr
        | Instr::Cmp(_) => -1,
        Instr::Neg | Instr::Not => 0,
        Instr::Jump(_) => 0,
        Instr::JumpIfFalse(_) | Instr::JumpIfTrue(_) => -1,
        Instr::PushScope(_) | Instr::PopScope => 0,
        Instr::Call { argc, .. } => 1 - *argc as i32,
        Instr::Pop => -1,
        Instr::Stmt { .. } => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::lexer::lex;
    use crate::runtime::parser::parse;

    fn gen(source: &str) -> Program {
        generate("test", &parse(lex(source).unwrap()).unwrap()).unwrap()
    }

    #[test]
    fn pattern_block_shape() {
        let prog = gen("counter c\n/x/ {\n c++\n}");

        assert_eq!(1, prog.regexes.len());
        assert_eq!(1, prog.decls.len());
        assert_eq!("test", prog.decls[0].program);

        // block marker, match, conditional skip, scope entry
        assert!(matches!(prog.instrs[0], Instr::Stmt { .. }));
        assert_eq!(Instr::Match(0), prog.instrs[1]);
        assert!(matches!(prog.instrs[2], Instr::JumpIfFalse(_)));
        assert_eq!(Instr::PushScope(0), prog.instrs[3]);
        assert!(prog.instrs.contains(&Instr::IncCell {
            slot: 0,
            nkeys: 0,
            pop_delta: false
        }));
        assert_eq!(Instr::PopScope, *prog.instrs.last().unwrap());
    }

    #[test]
    fn block_skip_jumps_past_pop_scope() {
        let prog = gen("counter c\n/x/ {\n c++\n}");
        let target = match prog.instrs[2] {
            Instr::JumpIfFalse(t) => t,
            ref other => panic!("unexpected instr {:?}", other),
        };
        assert_eq!(prog.instrs.len() as u32, target);
    }

    #[test]
    fn strings_are_interned_once() {
        let prog = gen("counter c by k\n/x/ {\n c[\"a\"]++\n c[\"a\"]++\n}");
        assert_eq!(vec!["a".to_string()], prog.strs);
    }

    #[test]
    fn statement_recovery_skips_one_statement() {
        let prog = gen("gauge g\ncounter c\n/x/ {\n g = 1\n c++\n}");

        // find the assign statement's marker and the SetCell that ends it
        let set_at = prog
            .instrs
            .iter()
            .position(|i| matches!(i, Instr::SetCell { .. }))
            .unwrap();
        let marker = prog.instrs[..set_at]
            .iter()
            .rev()
            .find_map(|i| match i {
                Instr::Stmt { recover, .. } => Some(*recover),
                _ => None,
            })
            .unwrap();
        assert_eq!(set_at as u32 + 1, marker);

        // the next statement still executes after recovery
        assert!(matches!(
            prog.instrs[marker as usize],
            Instr::Stmt { .. }
        ));
    }

    #[test]
    fn short_circuit_and_produces_bool() {
        let prog = gen("gauge g\n/x/ {\n g = 1 && 0\n}");
        let jumps = prog
            .instrs
            .iter()
            .filter(|i| matches!(i, Instr::JumpIfFalse(_)))
            .count();
        // one for the block condition, two for &&
        assert_eq!(3, jumps);
    }

    #[test]
    fn nested_capture_frames() {
        let prog = gen(
            "counter c by a, b\n\
             /(?P<out>x)/ {\n\
               /(?P<in>y)/ {\n\
                 c[$out, $in]++\n\
               }\n\
             }",
        );

        assert!(prog
            .instrs
            .contains(&Instr::LoadCapture { frame: 1, group: 1 }));
        assert!(prog
            .instrs
            .contains(&Instr::LoadCapture { frame: 0, group: 1 }));
    }

    #[test]
    fn frame_size_covers_deepest_expression() {
        let prog = gen("gauge g\n/x/ {\n g = 1 + 2 + 3 + 4 + (5 + 6)\n}");
        assert!(prog.frame_size >= 3);
    }

    #[test]
    fn builtin_calls_compile_to_dispatch() {
        let prog = gen("gauge g\n/x/ {\n g = len(tolower($0))\n}");
        assert!(prog.instrs.contains(&Instr::Call {
            builtin: Builtin::Tolower,
            argc: 1
        }));
        assert!(prog.instrs.contains(&Instr::Call {
            builtin: Builtin::Len,
            argc: 1
        }));
    }
}
