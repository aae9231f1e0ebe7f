// SPDX-License-Identifier: Apache-2.0

use crate::metrics::MetricKind;

use super::error::Pos;

/// Parsed form of one program source file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProgram {
    pub decls: Vec<MetricDeclNode>,
    pub blocks: Vec<BlockNode>,
}

/// `counter NAME by k1, k2 buckets b1, b2`
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDeclNode {
    pub kind: MetricKind,
    pub name: String,
    pub label_keys: Vec<String>,
    pub buckets: Vec<f64>,
    pub pos: Pos,
}

/// A condition with a body: `/regex/ { ... }` or `expr { ... }`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockNode {
    pub cond: CondNode,
    pub body: Vec<StmtNode>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CondNode {
    Pattern { pattern: String, pos: Pos },
    Expr(ExprNode),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtNode {
    Block(BlockNode),
    /// `m[keys] = expr`: set for gauges and text, observe for
    /// histograms and timers.
    Assign {
        target: TargetNode,
        value: ExprNode,
        pos: Pos,
    },
    /// `m[keys]++` or `m[keys] += expr`.
    Inc {
        target: TargetNode,
        delta: Option<ExprNode>,
        pos: Pos,
    },
    Del {
        target: TargetNode,
        pos: Pos,
    },
    Call {
        call: CallNode,
        pos: Pos,
    },
}

/// A metric reference with label key expressions: `m` or `m[e1, e2]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetNode {
    pub name: String,
    pub keys: Vec<ExprNode>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallNode {
    pub name: String,
    pub args: Vec<ExprNode>,
    pub pos: Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprNode {
    Int {
        value: i64,
        pos: Pos,
    },
    Float {
        value: f64,
        pos: Pos,
    },
    Str {
        value: String,
        pos: Pos,
    },
    CaptureName {
        name: String,
        pos: Pos,
    },
    CaptureNum {
        index: u32,
        pos: Pos,
    },
    MetricRead(TargetNode),
    Call(CallNode),
    Unary {
        op: UnaryOp,
        operand: Box<ExprNode>,
        pos: Pos,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<ExprNode>,
        rhs: Box<ExprNode>,
        pos: Pos,
    },
    Ternary {
        cond: Box<ExprNode>,
        then: Box<ExprNode>,
        otherwise: Box<ExprNode>,
        pos: Pos,
    },
}

impl ExprNode {
    pub fn pos(&self) -> Pos {
        match self {
            ExprNode::Int { pos, .. }
            | ExprNode::Float { pos, .. }
            | ExprNode::Str { pos, .. }
            | ExprNode::CaptureName { pos, .. }
            | ExprNode::CaptureNum { pos, .. }
            | ExprNode::Unary { pos, .. }
            | ExprNode::Binary { pos, .. }
            | ExprNode::Ternary { pos, .. } => *pos,
            ExprNode::MetricRead(t) => t.pos,
            ExprNode::Call(c) => c.pos,
        }
    }
}
