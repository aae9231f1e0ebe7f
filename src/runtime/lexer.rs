// SPDX-License-Identifier: Apache-2.0

//! Hand-written lexer for program source.
//!
//! Newlines are significant: they terminate statements, so they are
//! emitted as tokens (collapsed runs) rather than skipped. `#` comments
//! run to end of line; `/* */` comments are whitespace, except that a
//! multi-line block comment contributes one newline so it cannot splice
//! two statements together.
//!
//! A `/` starts a regex literal when the previous token cannot end an
//! expression, and a division operator otherwise.

use super::error::{CompileError, Pos};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Regex(String),
    Ident(String),
    CaptureName(String),
    CaptureNum(u32),

    // keywords
    Counter,
    Gauge,
    Histogram,
    Timer,
    Text,
    By,
    Buckets,
    Del,

    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Newline,

    Assign,
    PlusAssign,
    PlusPlus,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,
    BitAnd,
    BitOr,
    Caret,
    Shl,
    Shr,
    Question,
    Colon,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub pos: Pos,
}

fn keyword(ident: &str) -> Option<Tok> {
    match ident {
        "counter" => Some(Tok::Counter),
        "gauge" => Some(Tok::Gauge),
        "histogram" => Some(Tok::Histogram),
        "timer" => Some(Tok::Timer),
        "text" => Some(Tok::Text),
        "by" => Some(Tok::By),
        "buckets" => Some(Tok::Buckets),
        "del" => Some(Tok::Del),
        _ => None,
    }
}

/// True when `tok` can be the final token of an expression, in which case
/// a following `/` must be division.
fn ends_expression(tok: &Tok) -> bool {
    matches!(
        tok,
        Tok::Int(_)
            | Tok::Float(_)
            | Tok::Str(_)
            | Tok::Ident(_)
            | Tok::CaptureName(_)
            | Tok::CaptureNum(_)
            | Tok::RParen
            | Tok::RBracket
            | Tok::PlusPlus
    )
}

struct Lexer {
    chars: Vec<char>,
    idx: usize,
    line: u32,
    col: u32,
}

pub fn lex(source: &str) -> Result<Vec<Token>, CompileError> {
    Lexer::new(source).run()
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            idx: 0,
            line: 1,
            col: 1,
        }
    }

    fn pos(&self) -> Pos {
        Pos::new(self.line, self.col)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.idx).copied()
    }

    fn peek2(&self) -> Option<char> {
        self.chars.get(self.idx + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.idx += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn run(mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens: Vec<Token> = Vec::new();

        loop {
            let pos = self.pos();
            let c = match self.peek() {
                Some(c) => c,
                None => break,
            };

            match c {
                '\n' => {
                    self.bump();
                    Self::push_newline(&mut tokens, pos);
                }
                c if c.is_whitespace() => {
                    self.bump();
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '/' if self.peek2() == Some('*') => {
                    self.block_comment(pos, &mut tokens)?;
                }
                '/' => {
                    let is_regex = tokens
                        .last()
                        .map(|t| !ends_expression(&t.tok))
                        .unwrap_or(true);
                    if is_regex {
                        let tok = self.regex_literal(pos)?;
                        tokens.push(Token { tok, pos });
                    } else {
                        self.bump();
                        tokens.push(Token {
                            tok: Tok::Slash,
                            pos,
                        });
                    }
                }
                '"' => {
                    let tok = self.string_literal(pos)?;
                    tokens.push(Token { tok, pos });
                }
                '$' => {
                    let tok = self.capture(pos)?;
                    tokens.push(Token { tok, pos });
                }
                c if c.is_ascii_digit() => {
                    let tok = self.number(pos)?;
                    tokens.push(Token { tok, pos });
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(c) = self.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            ident.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    let tok = keyword(&ident).unwrap_or(Tok::Ident(ident));
                    tokens.push(Token { tok, pos });
                }
                _ => {
                    let tok = self.operator(pos)?;
                    tokens.push(Token { tok, pos });
                }
            }
        }

        tokens.push(Token {
            tok: Tok::Eof,
            pos: self.pos(),
        });
        Ok(tokens)
    }

    fn push_newline(tokens: &mut Vec<Token>, pos: Pos) {
        // collapse runs; a leading newline carries no information
        match tokens.last() {
            Some(t) if t.tok != Tok::Newline => tokens.push(Token {
                tok: Tok::Newline,
                pos,
            }),
            Some(_) | None => {}
        }
    }

    fn block_comment(&mut self, start: Pos, tokens: &mut Vec<Token>) -> Result<(), CompileError> {
        self.bump(); // '/'
        self.bump(); // '*'
        let mut saw_newline = false;
        loop {
            match self.bump() {
                Some('*') if self.peek() == Some('/') => {
                    self.bump();
                    if saw_newline {
                        Self::push_newline(tokens, start);
                    }
                    return Ok(());
                }
                Some('\n') => saw_newline = true,
                Some(_) => {}
                None => return Err(CompileError::UnterminatedComment { pos: start }),
            }
        }
    }

    fn regex_literal(&mut self, start: Pos) -> Result<Tok, CompileError> {
        self.bump(); // '/'
        let mut pattern = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    // \/ is an escaped delimiter; all else passes through
                    Some('/') => pattern.push('/'),
                    Some(c) => {
                        pattern.push('\\');
                        pattern.push(c);
                    }
                    None => return Err(CompileError::UnterminatedRegex { pos: start }),
                },
                Some('/') => return Ok(Tok::Regex(pattern)),
                Some('\n') | None => return Err(CompileError::UnterminatedRegex { pos: start }),
                Some(c) => pattern.push(c),
            }
        }
    }

    fn string_literal(&mut self, start: Pos) -> Result<Tok, CompileError> {
        self.bump(); // '"'
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some(c) => {
                        value.push('\\');
                        value.push(c);
                    }
                    None => return Err(CompileError::UnterminatedString { pos: start }),
                },
                Some('"') => return Ok(Tok::Str(value)),
                Some('\n') | None => return Err(CompileError::UnterminatedString { pos: start }),
                Some(c) => value.push(c),
            }
        }
    }

    fn capture(&mut self, start: Pos) -> Result<Tok, CompileError> {
        self.bump(); // '$'
        match self.peek() {
            Some(c) if c.is_ascii_digit() => {
                let mut n: u32 = 0;
                while let Some(c) = self.peek() {
                    match c.to_digit(10) {
                        Some(d) => {
                            n = n * 10 + d;
                            self.bump();
                        }
                        None => break,
                    }
                }
                Ok(Tok::CaptureNum(n))
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(c) = self.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                Ok(Tok::CaptureName(name))
            }
            _ => Err(CompileError::UnexpectedChar {
                ch: '$',
                pos: start,
            }),
        }
    }

    fn number(&mut self, start: Pos) -> Result<Tok, CompileError> {
        let mut text = String::new();
        let mut is_float = false;

        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {
                    text.push(c);
                    self.bump();
                }
                '.' if !is_float && self.peek2().map(|d| d.is_ascii_digit()).unwrap_or(false) => {
                    is_float = true;
                    text.push(c);
                    self.bump();
                }
                'e' | 'E' => {
                    is_float = true;
                    text.push(c);
                    self.bump();
                    if let Some(sign @ ('+' | '-')) = self.peek() {
                        text.push(sign);
                        self.bump();
                    }
                }
                _ => break,
            }
        }

        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| CompileError::InvalidNumber { text, pos: start })
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| CompileError::InvalidNumber { text, pos: start })
        }
    }

    fn operator(&mut self, pos: Pos) -> Result<Tok, CompileError> {
        let c = self.bump().expect("caller peeked");
        let next = self.peek();

        let two = |lexer: &mut Self, tok: Tok| {
            lexer.bump();
            tok
        };

        let tok = match (c, next) {
            ('{', _) => Tok::LBrace,
            ('}', _) => Tok::RBrace,
            ('[', _) => Tok::LBracket,
            (']', _) => Tok::RBracket,
            ('(', _) => Tok::LParen,
            (')', _) => Tok::RParen,
            (',', _) => Tok::Comma,
            ('?', _) => Tok::Question,
            (':', _) => Tok::Colon,
            ('*', _) => Tok::Star,
            ('%', _) => Tok::Percent,
            ('^', _) => Tok::Caret,
            ('+', Some('+')) => two(self, Tok::PlusPlus),
            ('+', Some('=')) => two(self, Tok::PlusAssign),
            ('+', _) => Tok::Plus,
            ('-', _) => Tok::Minus,
            ('=', Some('=')) => two(self, Tok::EqEq),
            ('=', _) => Tok::Assign,
            ('!', Some('=')) => two(self, Tok::Ne),
            ('!', _) => Tok::Not,
            ('<', Some('=')) => two(self, Tok::Le),
            ('<', Some('<')) => two(self, Tok::Shl),
            ('<', _) => Tok::Lt,
            ('>', Some('=')) => two(self, Tok::Ge),
            ('>', Some('>')) => two(self, Tok::Shr),
            ('>', _) => Tok::Gt,
            ('&', Some('&')) => two(self, Tok::AndAnd),
            ('&', _) => Tok::BitAnd,
            ('|', Some('|')) => two(self, Tok::OrOr),
            ('|', _) => Tok::BitOr,
            (ch, _) => return Err(CompileError::UnexpectedChar { ch, pos }),
        };

        Ok(tok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        lex(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn declaration_tokens() {
        assert_eq!(
            vec![
                Tok::Counter,
                Tok::Ident("lines_total".into()),
                Tok::By,
                Tok::Ident("status".into()),
                Tok::Comma,
                Tok::Ident("method".into()),
                Tok::Eof,
            ],
            toks("counter lines_total by status, method")
        );
    }

    #[test]
    fn buckets_with_floats() {
        assert_eq!(
            vec![
                Tok::Histogram,
                Tok::Ident("h".into()),
                Tok::Buckets,
                Tok::Float(2.5),
                Tok::Comma,
                Tok::Int(5),
                Tok::Eof,
            ],
            toks("histogram h buckets 2.5, 5")
        );
    }

    #[test]
    fn regex_at_line_start() {
        assert_eq!(
            vec![
                Tok::Regex("error (?P<code>\\d+)".into()),
                Tok::LBrace,
                Tok::RBrace,
                Tok::Eof,
            ],
            toks("/error (?P<code>\\d+)/ { }")
        );
    }

    #[test]
    fn escaped_slash_in_regex() {
        assert_eq!(vec![Tok::Regex("a/b".into()), Tok::Eof], toks(r"/a\/b/"));
    }

    #[test]
    fn slash_after_expression_is_division() {
        assert_eq!(
            vec![
                Tok::CaptureName("a".into()),
                Tok::Slash,
                Tok::Int(2),
                Tok::Eof
            ],
            toks("$a / 2")
        );
    }

    #[test]
    fn regex_after_newline_is_regex() {
        assert_eq!(
            vec![
                Tok::Ident("m".into()),
                Tok::PlusPlus,
                Tok::Newline,
                Tok::Regex("x".into()),
                Tok::LBrace,
                Tok::RBrace,
                Tok::Eof,
            ],
            toks("m++\n/x/ { }")
        );
    }

    #[test]
    fn captures() {
        assert_eq!(
            vec![
                Tok::CaptureName("status".into()),
                Tok::CaptureNum(1),
                Tok::CaptureNum(0),
                Tok::Eof
            ],
            toks("$status $1 $0")
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            vec![
                Tok::Ident("a".into()),
                Tok::Newline,
                Tok::Ident("b".into()),
                Tok::Eof
            ],
            toks("a # trailing comment\nb /* inline */")
        );
    }

    #[test]
    fn multiline_block_comment_separates_statements() {
        assert_eq!(
            vec![
                Tok::Ident("a".into()),
                Tok::Newline,
                Tok::Ident("b".into()),
                Tok::Eof
            ],
            toks("a /* one\ntwo */ b")
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            vec![
                Tok::Plus,
                Tok::PlusPlus,
                Tok::PlusAssign,
                Tok::EqEq,
                Tok::Assign,
                Tok::Ne,
                Tok::Le,
                Tok::Shl,
                Tok::AndAnd,
                Tok::BitAnd,
                Tok::Question,
                Tok::Colon,
                Tok::Eof,
            ],
            toks("+ ++ += == = != <= << && & ? :")
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            vec![Tok::Str("a\"b\n".into()), Tok::Eof],
            toks(r#""a\"b\n""#)
        );
    }

    #[test]
    fn newline_runs_collapse() {
        assert_eq!(
            vec![
                Tok::Ident("a".into()),
                Tok::Newline,
                Tok::Ident("b".into()),
                Tok::Newline,
                Tok::Eof
            ],
            toks("\n\na\n\n\nb\n\n")
        );
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(matches!(
            lex("\"abc"),
            Err(CompileError::UnterminatedString { .. })
        ));
    }

    #[test]
    fn unterminated_regex_errors() {
        assert!(matches!(
            lex("/abc\n"),
            Err(CompileError::UnterminatedRegex { .. })
        ));
    }

    #[test]
    fn positions_are_tracked() {
        let tokens = lex("a\n  b").unwrap();
        assert_eq!(Pos::new(1, 1), tokens[0].pos);
        assert_eq!(Pos::new(2, 3), tokens[2].pos);
    }
}
