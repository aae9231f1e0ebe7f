// SPDX-License-Identifier: Apache-2.0

//! Recursive-descent parser. Statements end at newlines; blocks nest;
//! expressions use precedence climbing from ternary down to unary.

use crate::metrics::MetricKind;

use super::ast::*;
use super::error::{CompileError, Pos};
use super::lexer::{Tok, Token};

pub fn parse(tokens: Vec<Token>) -> Result<SourceProgram, CompileError> {
    Parser { tokens, idx: 0 }.program()
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
}

impl Parser {
    fn cur(&self) -> &Token {
        &self.tokens[self.idx]
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens[self.idx].clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        token
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if &self.cur().tok == tok {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<Pos, CompileError> {
        if self.cur().tok == tok {
            Ok(self.bump().pos)
        } else {
            Err(self.err(&format!("expected {}, found {:?}", what, self.cur().tok)))
        }
    }

    fn err(&self, message: &str) -> CompileError {
        CompileError::Syntax {
            message: message.to_string(),
            pos: self.cur().pos,
        }
    }

    fn skip_newlines(&mut self) {
        while self.cur().tok == Tok::Newline {
            self.bump();
        }
    }

    fn program(&mut self) -> Result<SourceProgram, CompileError> {
        let mut decls = Vec::new();
        let mut blocks = Vec::new();

        loop {
            self.skip_newlines();
            match self.cur().tok {
                Tok::Eof => break,
                Tok::Counter | Tok::Gauge | Tok::Histogram | Tok::Timer | Tok::Text => {
                    decls.push(self.metric_decl()?);
                }
                _ => blocks.push(self.block()?),
            }
        }

        Ok(SourceProgram { decls, blocks })
    }

    fn metric_decl(&mut self) -> Result<MetricDeclNode, CompileError> {
        let start = self.bump();
        let kind = match start.tok {
            Tok::Counter => MetricKind::Counter,
            Tok::Gauge => MetricKind::Gauge,
            Tok::Histogram => MetricKind::Histogram,
            Tok::Timer => MetricKind::Timer,
            Tok::Text => MetricKind::Text,
            _ => unreachable!("caller checked for a kind keyword"),
        };

        let name = self.ident("metric name")?;

        let mut label_keys = Vec::new();
        if self.eat(&Tok::By) {
            loop {
                label_keys.push(self.ident("label key")?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }

        let mut buckets = Vec::new();
        if self.eat(&Tok::Buckets) {
            loop {
                buckets.push(self.number("bucket bound")?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }

        Ok(MetricDeclNode {
            kind,
            name,
            label_keys,
            buckets,
            pos: start.pos,
        })
    }

    fn ident(&mut self, what: &str) -> Result<String, CompileError> {
        match self.cur().tok.clone() {
            Tok::Ident(name) => {
                self.bump();
                Ok(name)
            }
            _ => Err(self.err(&format!("expected {}", what))),
        }
    }

    fn number(&mut self, what: &str) -> Result<f64, CompileError> {
        match self.cur().tok {
            Tok::Int(i) => {
                self.bump();
                Ok(i as f64)
            }
            Tok::Float(f) => {
                self.bump();
                Ok(f)
            }
            _ => Err(self.err(&format!("expected {}", what))),
        }
    }

    /// A condition followed by a braced body. The condition is a regex
    /// literal or any expression.
    fn block(&mut self) -> Result<BlockNode, CompileError> {
        let pos = self.cur().pos;

        let cond = if let Tok::Regex(pattern) = self.cur().tok.clone() {
            let token = self.bump();
            CondNode::Pattern {
                pattern,
                pos: token.pos,
            }
        } else {
            CondNode::Expr(self.expr()?)
        };

        self.expect(Tok::LBrace, "'{'")?;
        let body = self.stmt_list()?;

        Ok(BlockNode { cond, body, pos })
    }

    fn stmt_list(&mut self) -> Result<Vec<StmtNode>, CompileError> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Tok::RBrace) {
                return Ok(body);
            }
            if self.cur().tok == Tok::Eof {
                return Err(self.err("expected '}'"));
            }
            body.push(self.stmt()?);
        }
    }

    fn stmt(&mut self) -> Result<StmtNode, CompileError> {
        let pos = self.cur().pos;

        match self.cur().tok {
            Tok::Del => {
                self.bump();
                let target = self.target()?;
                return Ok(StmtNode::Del { target, pos });
            }
            Tok::Regex(_) => return Ok(StmtNode::Block(self.block()?)),
            _ => {}
        }

        // everything else starts as an expression; the following token
        // decides whether it was a metric update, a call statement, or
        // the condition of a nested block
        let expr = self.expr()?;

        match self.cur().tok {
            Tok::LBrace => {
                self.bump();
                let body = self.stmt_list()?;
                Ok(StmtNode::Block(BlockNode {
                    cond: CondNode::Expr(expr),
                    body,
                    pos,
                }))
            }
            Tok::Assign => {
                self.bump();
                let value = self.expr()?;
                Ok(StmtNode::Assign {
                    target: self.as_target(expr)?,
                    value,
                    pos,
                })
            }
            Tok::PlusPlus => {
                self.bump();
                Ok(StmtNode::Inc {
                    target: self.as_target(expr)?,
                    delta: None,
                    pos,
                })
            }
            Tok::PlusAssign => {
                self.bump();
                let delta = self.expr()?;
                Ok(StmtNode::Inc {
                    target: self.as_target(expr)?,
                    delta: Some(delta),
                    pos,
                })
            }
            _ => match expr {
                ExprNode::Call(call) => Ok(StmtNode::Call { call, pos }),
                _ => Err(self.err("expected statement")),
            },
        }
    }

    fn as_target(&self, expr: ExprNode) -> Result<TargetNode, CompileError> {
        match expr {
            ExprNode::MetricRead(target) => Ok(target),
            other => Err(CompileError::Syntax {
                message: "assignment target must be a metric".to_string(),
                pos: other.pos(),
            }),
        }
    }

    fn target(&mut self) -> Result<TargetNode, CompileError> {
        let pos = self.cur().pos;
        let name = self.ident("metric name")?;
        let keys = if self.eat(&Tok::LBracket) {
            let keys = self.expr_list(Tok::RBracket)?;
            self.expect(Tok::RBracket, "']'")?;
            keys
        } else {
            Vec::new()
        };
        Ok(TargetNode { name, keys, pos })
    }

    fn expr_list(&mut self, terminator: Tok) -> Result<Vec<ExprNode>, CompileError> {
        let mut exprs = Vec::new();
        if self.cur().tok == terminator {
            return Ok(exprs);
        }
        loop {
            exprs.push(self.expr()?);
            if !self.eat(&Tok::Comma) {
                return Ok(exprs);
            }
        }
    }

    // -- expressions, tightest binding last --

    fn expr(&mut self) -> Result<ExprNode, CompileError> {
        self.ternary()
    }

    fn ternary(&mut self) -> Result<ExprNode, CompileError> {
        let cond = self.or_expr()?;
        if !self.eat(&Tok::Question) {
            return Ok(cond);
        }
        let pos = cond.pos();
        let then = self.expr()?;
        self.expect(Tok::Colon, "':'")?;
        let otherwise = self.ternary()?;
        Ok(ExprNode::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
            pos,
        })
    }

    fn binary_level<F>(
        &mut self,
        next: F,
        ops: &[(Tok, BinaryOp)],
    ) -> Result<ExprNode, CompileError>
    where
        F: Fn(&mut Self) -> Result<ExprNode, CompileError>,
    {
        let mut lhs = next(self)?;
        'outer: loop {
            for (tok, op) in ops {
                if self.cur().tok == *tok {
                    let pos = self.bump().pos;
                    let rhs = next(self)?;
                    lhs = ExprNode::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        pos,
                    };
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn or_expr(&mut self) -> Result<ExprNode, CompileError> {
        self.binary_level(Self::and_expr, &[(Tok::OrOr, BinaryOp::Or)])
    }

    fn and_expr(&mut self) -> Result<ExprNode, CompileError> {
        self.binary_level(Self::bitor_expr, &[(Tok::AndAnd, BinaryOp::And)])
    }

    fn bitor_expr(&mut self) -> Result<ExprNode, CompileError> {
        self.binary_level(Self::bitxor_expr, &[(Tok::BitOr, BinaryOp::BitOr)])
    }

    fn bitxor_expr(&mut self) -> Result<ExprNode, CompileError> {
        self.binary_level(Self::bitand_expr, &[(Tok::Caret, BinaryOp::BitXor)])
    }

    fn bitand_expr(&mut self) -> Result<ExprNode, CompileError> {
        self.binary_level(Self::equality, &[(Tok::BitAnd, BinaryOp::BitAnd)])
    }

    fn equality(&mut self) -> Result<ExprNode, CompileError> {
        self.binary_level(
            Self::relational,
            &[(Tok::EqEq, BinaryOp::Eq), (Tok::Ne, BinaryOp::Ne)],
        )
    }

    fn relational(&mut self) -> Result<ExprNode, CompileError> {
        self.binary_level(
            Self::shift_expr,
            &[
                (Tok::Le, BinaryOp::Le),
                (Tok::Ge, BinaryOp::Ge),
                (Tok::Lt, BinaryOp::Lt),
                (Tok::Gt, BinaryOp::Gt),
            ],
        )
    }

    fn shift_expr(&mut self) -> Result<ExprNode, CompileError> {
        self.binary_level(
            Self::additive,
            &[(Tok::Shl, BinaryOp::Shl), (Tok::Shr, BinaryOp::Shr)],
        )
    }

    fn additive(&mut self) -> Result<ExprNode, CompileError> {
        self.binary_level(
            Self::multiplicative,
            &[(Tok::Plus, BinaryOp::Add), (Tok::Minus, BinaryOp::Sub)],
        )
    }

    fn multiplicative(&mut self) -> Result<ExprNode, CompileError> {
        self.binary_level(
            Self::unary,
            &[
                (Tok::Star, BinaryOp::Mul),
                (Tok::Slash, BinaryOp::Div),
                (Tok::Percent, BinaryOp::Mod),
            ],
        )
    }

    fn unary(&mut self) -> Result<ExprNode, CompileError> {
        let pos = self.cur().pos;
        let op = match self.cur().tok {
            Tok::Not => Some(UnaryOp::Not),
            Tok::Minus => Some(UnaryOp::Neg),
            _ => None,
        };

        if let Some(op) = op {
            self.bump();
            let operand = self.unary()?;
            return Ok(ExprNode::Unary {
                op,
                operand: Box::new(operand),
                pos,
            });
        }

        self.primary()
    }

    fn primary(&mut self) -> Result<ExprNode, CompileError> {
        let pos = self.cur().pos;
        match self.cur().tok.clone() {
            Tok::Int(value) => {
                self.bump();
                Ok(ExprNode::Int { value, pos })
            }
            Tok::Float(value) => {
                self.bump();
                Ok(ExprNode::Float { value, pos })
            }
            Tok::Str(value) => {
                self.bump();
                Ok(ExprNode::Str { value, pos })
            }
            Tok::CaptureName(name) => {
                self.bump();
                Ok(ExprNode::CaptureName { name, pos })
            }
            Tok::CaptureNum(index) => {
                self.bump();
                Ok(ExprNode::CaptureNum { index, pos })
            }
            Tok::LParen => {
                self.bump();
                let inner = self.expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::Ident(name) => {
                self.bump();
                if self.eat(&Tok::LParen) {
                    let args = self.expr_list(Tok::RParen)?;
                    self.expect(Tok::RParen, "')'")?;
                    Ok(ExprNode::Call(CallNode { name, args, pos }))
                } else if self.eat(&Tok::LBracket) {
                    let keys = self.expr_list(Tok::RBracket)?;
                    self.expect(Tok::RBracket, "']'")?;
                    Ok(ExprNode::MetricRead(TargetNode { name, keys, pos }))
                } else {
                    Ok(ExprNode::MetricRead(TargetNode {
                        name,
                        keys: Vec::new(),
                        pos,
                    }))
                }
            }
            _ => Err(self.err("expected expression")),
        }
    }
}
