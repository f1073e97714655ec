use lunac_compiler::opcode::{Instruction, OpCode};
use lunac_compiler::proto::{Constant, Proto};
use lunac_compiler::{generate, parse, tokenize, CompileError};
use lunac_core::string::StringInterner;

/// Compile a Lua source string to a prototype tree.
pub fn compile_str(source: &str) -> (Proto, StringInterner) {
    let tokens = tokenize(source.as_bytes())
        .unwrap_or_else(|e| panic!("tokenize failed: {e}\nsource:\n{source}"));
    let ast =
        parse(tokens).unwrap_or_else(|e| panic!("parse failed: {e}\nsource:\n{source}"));
    generate(ast, "@test").unwrap_or_else(|e| panic!("codegen failed: {e}\nsource:\n{source}"))
}

/// Compile a Lua source string and expect a pipeline error.
pub fn compile_str_err(source: &str) -> CompileError {
    match lunac_compiler::compile(source.as_bytes(), "@test") {
        Err(e) => e,
        Ok(_) => panic!("expected compile error, got success\nsource:\n{source}"),
    }
}

/// Check if a prototype contains a specific opcode.
pub fn has_opcode(proto: &Proto, op: OpCode) -> bool {
    proto.code.iter().any(|i| i.opcode() == op)
}

/// Count occurrences of an opcode in a prototype.
pub fn count_opcode(proto: &Proto, op: OpCode) -> usize {
    proto.code.iter().filter(|i| i.opcode() == op).count()
}

/// Find the first instruction with a given opcode.
pub fn find_opcode(proto: &Proto, op: OpCode) -> Option<(usize, Instruction)> {
    proto
        .code
        .iter()
        .position(|i| i.opcode() == op)
        .map(|pc| (pc, proto.code[pc]))
}

/// True if some constant is the given number.
pub fn has_number_constant(proto: &Proto, value: f64) -> bool {
    proto
        .constants
        .iter()
        .any(|k| matches!(k, Constant::Number(v) if *v == value))
}

/// True if some constant is the given string.
pub fn has_string_constant(proto: &Proto, strings: &StringInterner, value: &[u8]) -> bool {
    proto
        .constants
        .iter()
        .any(|k| matches!(k, Constant::Str(id) if strings.get(*id) == value))
}

/// Structural invariants every generated prototype must satisfy: unique
/// constants, local debug ranges inside the code, bounded stack size.
pub fn check_invariants(proto: &Proto) {
    let len = proto.code.len() as u32;
    assert_eq!(proto.code.len(), proto.lines.len(), "line table out of sync");

    for (i, a) in proto.constants.iter().enumerate() {
        for b in proto.constants.iter().skip(i + 1) {
            assert_ne!(a, b, "duplicate constant pool entry: {a:?}");
        }
    }

    for lv in &proto.local_vars {
        assert!(lv.start_pc <= lv.end_pc, "local starts after it ends");
        assert!(lv.end_pc <= len, "local outlives the code");
    }

    assert!(proto.max_stack_size >= 2);
    assert!((proto.max_stack_size as usize) <= 250, "stack size over limit");

    for child in &proto.protos {
        check_invariants(child);
    }
}
