use super::helpers::*;
use lunac_compiler::CompileError;

#[test]
fn e2e_lex_errors_carry_line() {
    let err = compile_str_err("local a = 1\nlocal b = \"open");
    assert!(matches!(err, CompileError::Lex(_)));
    assert_eq!(err.line(), 2);
    assert!(err.message().contains("unfinished string"));
}

#[test]
fn e2e_malformed_number() {
    let err = compile_str_err("return 0x");
    assert!(matches!(err, CompileError::Lex(_)));
    assert!(err.message().contains("malformed number"));
}

#[test]
fn e2e_bad_escape() {
    let err = compile_str_err(r#"return "\q""#);
    assert!(matches!(err, CompileError::Lex(_)));
}

#[test]
fn e2e_parse_errors_carry_line() {
    let err = compile_str_err("local x = 1\nif x then\n");
    assert!(matches!(err, CompileError::Parse(_)));
    assert!(err.message().contains("'end' expected"));
}

#[test]
fn e2e_missing_until() {
    let err = compile_str_err("repeat f()");
    assert!(matches!(err, CompileError::Parse(_)));
    assert!(err.message().contains("'until' expected"));
}

#[test]
fn e2e_reserved_word_as_name() {
    let err = compile_str_err("local function = 1");
    assert!(matches!(err, CompileError::Parse(_)));
}

#[test]
fn e2e_break_outside_loop() {
    let err = compile_str_err("break");
    assert!(matches!(err, CompileError::CodeGen(_)));
    assert!(err.message().contains("no loop to break"));
}

#[test]
fn e2e_break_inside_function_inside_loop_is_invalid() {
    // The function body is a fresh scope; the enclosing loop is invisible
    let err = compile_str_err("while true do local f = function() break end end");
    assert!(matches!(err, CompileError::CodeGen(_)));
}

#[test]
fn e2e_break_in_nested_loop_ok() {
    let (proto, _) = compile_str("for i = 1, 3 do while f() do break end end");
    check_invariants(&proto);
}

#[test]
fn e2e_too_many_locals() {
    let mut src = String::new();
    for i in 0..205 {
        src.push_str(&format!("local v{i} = {i}\n"));
    }
    let err = compile_str_err(&src);
    assert!(matches!(err, CompileError::CodeGen(_)));
    assert!(err.message().contains("too many local variables"));
}

#[test]
fn e2e_vararg_outside_vararg_function() {
    let err = compile_str_err("local f = function() return ... end");
    assert!(matches!(err, CompileError::Parse(_)));
    assert!(err.message().contains("vararg"));
}

#[test]
fn e2e_deep_nesting_rejected() {
    let src = format!("return {}1{}", "(".repeat(250), ")".repeat(250));
    let err = compile_str_err(&src);
    assert!(matches!(err, CompileError::Parse(_)));
    assert!(err.message().contains("too many syntax levels"));
}

#[test]
fn e2e_first_error_wins() {
    // A lex error on line 1 masks the parse error on line 2
    let err = compile_str_err("local ~ = 1\nif then end");
    assert!(matches!(err, CompileError::Lex(_)));
    assert_eq!(err.line(), 1);
}
