//! lunac compiler: Lua 5.1 source → Lua 5.1 binary chunk.
//!
//! The pipeline is strictly linear; each stage consumes the previous
//! stage's output:
//!
//! ```text
//! tokenize → parse → generate → chunk::dump
//! ```
//!
//! [`compile`] runs the whole pipeline. Individual stages are public so
//! tools can stop early (the CLI's parse-only mode, the disassembler).

pub mod ast;
pub mod chunk;
pub mod codegen;
pub mod disasm;
pub mod lexer;
pub mod opcode;
pub mod parser;
pub mod proto;
pub mod token;

pub use codegen::{generate, CodeGenError};
pub use lexer::{tokenize, LexError, Tokens};
pub use parser::{parse, ParseError};

use lunac_core::string::StringInterner;
use std::fmt;

/// Serialize a prototype tree into a Lua 5.1 binary chunk with default
/// options. See [`chunk::dump_with`] for size_t width and strip control.
pub fn emit(proto: &proto::Proto, strings: &StringInterner) -> Vec<u8> {
    chunk::dump(proto, strings)
}

/// Any error the pipeline can produce, tagged by stage. Each carries the
/// 1-based source line it was detected on.
#[derive(Clone, Debug)]
pub enum CompileError {
    Lex(LexError),
    Parse(ParseError),
    CodeGen(CodeGenError),
}

impl CompileError {
    /// Source line the error was detected on.
    pub fn line(&self) -> u32 {
        match self {
            CompileError::Lex(e) => e.line,
            CompileError::Parse(e) => e.line,
            CompileError::CodeGen(e) => e.line,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CompileError::Lex(e) => &e.message,
            CompileError::Parse(e) => &e.message,
            CompileError::CodeGen(e) => &e.message,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Lex(e) => write!(f, "{e}"),
            CompileError::Parse(e) => write!(f, "{e}"),
            CompileError::CodeGen(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError::Lex(e)
    }
}

impl From<ParseError> for CompileError {
    fn from(e: ParseError) -> Self {
        CompileError::Parse(e)
    }
}

impl From<CodeGenError> for CompileError {
    fn from(e: CodeGenError) -> Self {
        CompileError::CodeGen(e)
    }
}

/// Compile Lua 5.1 source text into a binary chunk the reference loader
/// accepts. `chunk_name` names the chunk in debug info, conventionally
/// `@filename`.
pub fn compile(source: &[u8], chunk_name: &str) -> Result<Vec<u8>, CompileError> {
    let tokens = tokenize(source)?;
    let ast = parse(tokens)?;
    let (proto, strings) = generate(ast, chunk_name)?;
    Ok(emit(&proto, &strings))
}
