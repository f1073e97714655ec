use super::helpers::*;
use lunac_compiler::opcode::OpCode;

#[test]
fn e2e_return_literals() {
    let (proto, _) = compile_str("return nil");
    assert!(has_opcode(&proto, OpCode::LoadNil));
    let (proto, _) = compile_str("return true");
    assert!(has_opcode(&proto, OpCode::LoadBool));
    let (proto, _) = compile_str("return 42");
    assert!(has_opcode(&proto, OpCode::LoadK));
    assert!(has_number_constant(&proto, 42.0));
}

#[test]
fn e2e_return_string_constant() {
    let (proto, strings) = compile_str("return \"hello world\"");
    assert!(has_opcode(&proto, OpCode::LoadK));
    assert!(has_string_constant(&proto, &strings, b"hello world"));
}

#[test]
fn e2e_arith_chain_folds() {
    // 2 + 3 * 4 ^ 2 / 2 = 26, fully folded at compile time
    let (proto, _) = compile_str("return 2 + 3 * 4 ^ 2 / 2");
    assert!(has_number_constant(&proto, 26.0));
    assert!(!has_opcode(&proto, OpCode::Add));
    assert!(!has_opcode(&proto, OpCode::Mul));
    assert!(!has_opcode(&proto, OpCode::Pow));
    assert!(!has_opcode(&proto, OpCode::Div));
    check_invariants(&proto);
}

#[test]
fn e2e_unary_fold() {
    let (proto, _) = compile_str("return -42");
    assert!(has_number_constant(&proto, -42.0));
    assert!(!has_opcode(&proto, OpCode::Unm));

    let (proto, _) = compile_str("return not nil");
    assert!(has_opcode(&proto, OpCode::LoadBool));
    assert!(!has_opcode(&proto, OpCode::Not));
}

#[test]
fn e2e_no_fold_with_side_effects() {
    let (proto, _) = compile_str("return 1 + f()");
    assert!(has_opcode(&proto, OpCode::Call));
    assert!(has_opcode(&proto, OpCode::Add));
}

#[test]
fn e2e_no_fold_division_by_zero() {
    let (proto, _) = compile_str("return 1 / 0");
    assert!(has_opcode(&proto, OpCode::Div));
    let (proto, _) = compile_str("return 1 % 0");
    assert!(has_opcode(&proto, OpCode::Mod));
}

#[test]
fn e2e_arith_on_locals() {
    let (proto, _) = compile_str("local a, b = 1, 2 return a + b");
    assert!(has_opcode(&proto, OpCode::Add));
    check_invariants(&proto);
}

#[test]
fn e2e_unary_operators() {
    let (proto, _) = compile_str("local t = {} return #t");
    assert!(has_opcode(&proto, OpCode::Len));
    let (proto, _) = compile_str("local x = f() return -x");
    assert!(has_opcode(&proto, OpCode::Unm));
    let (proto, _) = compile_str("return not f()");
    assert!(has_opcode(&proto, OpCode::Not));
}

#[test]
fn e2e_concat_single_instruction() {
    // A run of .. compiles to one CONCAT over a register span
    let (proto, strings) = compile_str("return \"a\"..\"b\"..'c'..[[d]]");
    assert_eq!(count_opcode(&proto, OpCode::Concat), 1);
    let (_, inst) = find_opcode(&proto, OpCode::Concat).unwrap();
    assert_eq!(inst.c() - inst.b(), 3); // four operands
    for s in [b"a", b"b", b"c", b"d"] {
        assert!(has_string_constant(&proto, &strings, s));
    }
    check_invariants(&proto);
}

#[test]
fn e2e_comparison_materializes_bools() {
    // In value position a comparison becomes LT + JMP + LOADBOOL pair
    let (proto, _) = compile_str("local c = 1 < 2 return c");
    assert!(has_opcode(&proto, OpCode::Lt));
    assert!(has_opcode(&proto, OpCode::Jmp));
    assert_eq!(count_opcode(&proto, OpCode::LoadBool), 2);
}

#[test]
fn e2e_comparison_in_condition_has_no_loadbool() {
    let (proto, _) = compile_str("local x = f() if x < 1 then g() end");
    assert!(has_opcode(&proto, OpCode::Lt));
    assert!(!has_opcode(&proto, OpCode::LoadBool));
}

#[test]
fn e2e_greater_swaps_operands() {
    // > and >= compile to LT/LE with swapped operands
    let (proto, _) = compile_str("local a, b = f(), g() if a > b then h() end");
    assert!(has_opcode(&proto, OpCode::Lt));
    let (proto, _) = compile_str("local a, b = f(), g() if a >= b then h() end");
    assert!(has_opcode(&proto, OpCode::Le));
}

#[test]
fn e2e_not_equal_uses_eq() {
    let (proto, _) = compile_str("local a = f() if a ~= 1 then g() end");
    assert!(has_opcode(&proto, OpCode::Eq));
}

#[test]
fn e2e_short_circuit_and_or() {
    let (proto, _) = compile_str("local a, b = f(), g() local c = a and b return c");
    assert!(has_opcode(&proto, OpCode::Test));
    assert!(has_opcode(&proto, OpCode::Jmp));

    let (proto, _) = compile_str("local a, b = f(), g() return a or b");
    assert!(has_opcode(&proto, OpCode::Test));
}

#[test]
fn e2e_globals() {
    let (proto, strings) = compile_str("x = y");
    assert!(has_opcode(&proto, OpCode::GetGlobal));
    assert!(has_opcode(&proto, OpCode::SetGlobal));
    assert!(has_string_constant(&proto, &strings, b"x"));
    assert!(has_string_constant(&proto, &strings, b"y"));
}

#[test]
fn e2e_index_and_field() {
    let (proto, _) = compile_str("local t = f() return t.name");
    assert!(has_opcode(&proto, OpCode::GetTable));
    let (proto, _) = compile_str("local t, k = f(), g() return t[k]");
    assert!(has_opcode(&proto, OpCode::GetTable));
}

#[test]
fn e2e_paren_clips_call_to_one_value() {
    let (proto, _) = compile_str("local a, b = (f())");
    let (_, call) = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(call.c(), 2); // exactly one result
    assert!(has_opcode(&proto, OpCode::LoadNil)); // b padded with nil
}

#[test]
fn e2e_unparenthesized_call_spreads() {
    let (proto, _) = compile_str("local a, b = f()");
    let (_, call) = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(call.c(), 3); // two results
    assert!(!has_opcode(&proto, OpCode::LoadNil));
}

#[test]
fn e2e_vararg_adjusted_in_middle_position() {
    let (proto, _) = compile_str("return f(..., 1)");
    let (_, va) = find_opcode(&proto, OpCode::VarArg).unwrap();
    assert_eq!(va.b(), 2); // clipped to one value
}

#[test]
fn e2e_vararg_open_in_tail_position() {
    // f(...) passes every vararg through; its results spread into g's
    // argument list the same way.
    let (proto, _) = compile_str("g(f(...))");
    let (_, va) = find_opcode(&proto, OpCode::VarArg).unwrap();
    assert_eq!(va.b(), 0); // all values
    assert_eq!(count_opcode(&proto, OpCode::Call), 2);
    assert!(proto
        .code
        .iter()
        .any(|i| i.opcode() == OpCode::Call && i.b() == 0));
}

#[test]
fn e2e_constant_pool_interning() {
    let (proto, _) =
        compile_str("local a = 1 local b = 1 local c = \"x\" local d = \"x\" return a");
    // 1 and "x" each intern to a single slot
    assert_eq!(proto.constants.len(), 2);
    check_invariants(&proto);
}

#[test]
fn e2e_rk_staging_past_256_constants() {
    // Force more than 256 distinct constants, then use late ones in
    // RK positions: the pool index no longer fits and must stage
    // through LOADK.
    let mut src = String::from("local x = 0\n");
    for i in 0..300 {
        src.push_str(&format!("x = x + {i}.5\n"));
    }
    src.push_str("return x\n");
    let (proto, _) = compile_str(&src);
    assert!(proto.constants.len() > 256);
    assert!(has_opcode(&proto, OpCode::LoadK));
    check_invariants(&proto);
}
