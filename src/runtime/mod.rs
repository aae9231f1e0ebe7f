// SPDX-License-Identifier: Apache-2.0

//! The metric extraction language: compiler and virtual machine.
//!
//! Source programs declare metrics and attach statement blocks to regex
//! or arithmetic conditions. Compilation is staged as lexer, parser,
//! checker, and code generator; the output is a stack-machine [`Program`]
//! whose regexes and constants live in pools resolved at load time, never
//! per line. The [`Vm`] runs one program against one line.

pub mod ast;
pub mod bytecode;
pub mod checker;
pub mod codegen;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod vm;

pub use bytecode::{Builtin, Instr, Program};
pub use error::{CompileError, Pos};
pub use vm::Vm;

/// Compile one program source. `name` is the source file stem; it becomes
/// the program name metrics are namespaced under.
pub fn compile(name: &str, source: &str) -> Result<Program, CompileError> {
    let tokens = lexer::lex(source)?;
    let ast = parser::parse(tokens)?;
    checker::check(&ast)?;
    codegen::generate(name, &ast)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_stages_report_their_errors() {
        // lexer
        assert!(matches!(
            compile("p", "\"unterminated"),
            Err(CompileError::UnterminatedString { .. })
        ));
        // parser
        assert!(matches!(
            compile("p", "counter"),
            Err(CompileError::Syntax { .. })
        ));
        // checker
        assert!(matches!(
            compile("p", "/x/ { ghost++\n}"),
            Err(CompileError::UnknownMetric { .. })
        ));
    }

    #[test]
    fn valid_program_compiles() {
        let prog = compile(
            "web",
            "counter requests by code\n\
             /code=(?P<code>\\d+)/ {\n\
               requests[$code]++\n\
             }",
        )
        .unwrap();

        assert_eq!("web", prog.name);
        assert_eq!(1, prog.decls.len());
        assert_eq!(1, prog.regexes.len());
        assert!(prog.metric_ids.is_empty(), "ids are bound by the loader");
    }
}
