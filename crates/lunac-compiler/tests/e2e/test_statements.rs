use super::helpers::*;
use lunac_compiler::opcode::OpCode;

#[test]
fn e2e_local_declarations() {
    let (proto, _) = compile_str("local x");
    assert!(has_opcode(&proto, OpCode::LoadNil));
    assert_eq!(proto.local_vars.len(), 1);

    let (proto, _) = compile_str("local a, b, c = 1, 2");
    // c has no initializer and gets nil
    assert!(has_opcode(&proto, OpCode::LoadNil));
    assert_eq!(proto.local_vars.len(), 3);
    check_invariants(&proto);
}

#[test]
fn e2e_local_swap() {
    let (proto, _) = compile_str("local a,b,c = 1,2,3 a,b = b,a return a+b+c");
    assert!(has_opcode(&proto, OpCode::Move));
    assert!(has_opcode(&proto, OpCode::Add));
    check_invariants(&proto);
}

#[test]
fn e2e_assign_table_targets_capture_before_store() {
    // t[i] and t are pinned before the RHS runs and stores go right to left
    let (proto, _) = compile_str("local t, i = f(), 1 t[i], i = i, 2");
    assert!(has_opcode(&proto, OpCode::SetTable));
    check_invariants(&proto);
}

#[test]
fn e2e_assign_extra_values_evaluated() {
    // Surplus RHS values are evaluated for their effects
    let (proto, _) = compile_str("local a = 1 a = 2, f()");
    assert!(has_opcode(&proto, OpCode::Call));
}

#[test]
fn e2e_if_elseif_else() {
    let (proto, _) = compile_str(
        "local x = f()\nif x == 1 then g()\nelseif x == 2 then h()\nelse i()\nend",
    );
    assert_eq!(count_opcode(&proto, OpCode::Eq), 2);
    // Each arm exits over the rest; two escape jumps plus two false jumps
    assert!(count_opcode(&proto, OpCode::Jmp) >= 4);
    check_invariants(&proto);
}

#[test]
fn e2e_while_loop_shape() {
    let (proto, _) = compile_str("local i = 0 while i < 10 do i = i + 1 end");
    assert!(has_opcode(&proto, OpCode::Lt));
    // The back edge is a JMP with a negative offset
    assert!(proto
        .code
        .iter()
        .any(|inst| inst.opcode() == OpCode::Jmp && inst.sbx() < 0));
    check_invariants(&proto);
}

#[test]
fn e2e_while_true_has_no_test() {
    let (proto, _) = compile_str("while true do f() break end");
    assert!(!has_opcode(&proto, OpCode::Test));
    assert!(has_opcode(&proto, OpCode::Call));
}

#[test]
fn e2e_repeat_until_reads_body_local() {
    // The until condition sees locals declared in the body
    let (proto, _) = compile_str("local i = 0 repeat local j = i + 1 i = j until j > 2");
    assert!(has_opcode(&proto, OpCode::Lt));
    assert!(proto
        .code
        .iter()
        .any(|inst| inst.opcode() == OpCode::Jmp && inst.sbx() < 0));
    check_invariants(&proto);
}

#[test]
fn e2e_numeric_for_shape() {
    let (proto, strings) = compile_str("local s = 0 for i = 10, 1, -2 do s = s + i end return s");
    let (prep_pc, prep) = find_opcode(&proto, OpCode::ForPrep).unwrap();
    let (loop_pc, floop) = find_opcode(&proto, OpCode::ForLoop).unwrap();
    // FORPREP jumps to FORLOOP; FORLOOP jumps back to the body
    assert_eq!(prep_pc as i32 + 1 + prep.sbx(), loop_pc as i32);
    assert_eq!(loop_pc as i32 + 1 + floop.sbx(), prep_pc as i32 + 1);
    // Step constant folded from unary minus
    assert!(has_number_constant(&proto, -2.0));
    // Hidden control variables appear in debug info
    assert!(proto
        .local_vars
        .iter()
        .any(|lv| strings.get(lv.name) == b"(for index)"));
    check_invariants(&proto);
}

#[test]
fn e2e_numeric_for_default_step() {
    let (proto, _) = compile_str("for i = 1, 3 do f(i) end");
    assert!(has_number_constant(&proto, 1.0));
    assert!(has_opcode(&proto, OpCode::ForPrep));
}

#[test]
fn e2e_generic_for_shape() {
    let (proto, strings) = compile_str("for k, v in pairs(t) do f(k, v) end");
    let (_, tfl) = find_opcode(&proto, OpCode::TForLoop).unwrap();
    assert_eq!(tfl.c(), 2); // two visible loop variables
    assert!(proto
        .local_vars
        .iter()
        .any(|lv| strings.get(lv.name) == b"(for generator)"));
    // Entry JMP forward to TFORLOOP, back JMP after it
    assert!(count_opcode(&proto, OpCode::Jmp) >= 2);
    check_invariants(&proto);
}

#[test]
fn e2e_generic_for_iterator_triple_adjusted() {
    // One iterator expression adjusted to (generator, state, control)
    let (proto, _) = compile_str("for k in pairs(t) do f(k) end");
    let (_, call) = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(call.c(), 4); // three results
}

#[test]
fn e2e_break_patches_to_loop_end() {
    let (proto, _) = compile_str("while f() do if g() then break end h() end");
    // break JMP lands past the loop's back edge
    let back = proto
        .code
        .iter()
        .position(|i| i.opcode() == OpCode::Jmp && i.sbx() < 0)
        .unwrap();
    let break_jmp = proto
        .code
        .iter()
        .enumerate()
        .find(|(pc, i)| i.opcode() == OpCode::Jmp && i.sbx() > 0 && *pc < back)
        .map(|(pc, i)| pc as i32 + 1 + i.sbx());
    assert!(break_jmp.is_some());
    assert!(break_jmp.unwrap() > back as i32);
    check_invariants(&proto);
}

#[test]
fn e2e_do_block_scopes_locals() {
    let (proto, _) = compile_str("do local x = 1 end do local y = 2 end");
    // Both locals recorded, registers reused
    assert_eq!(proto.local_vars.len(), 2);
    assert_eq!(proto.max_stack_size, 2);
    check_invariants(&proto);
}

#[test]
fn e2e_shadowing_coexists() {
    let (proto, _) = compile_str("local x = 1 local x = 2 return x");
    assert_eq!(proto.local_vars.len(), 2);
    // Two registers occupied simultaneously
    assert!(proto.max_stack_size >= 2);
    check_invariants(&proto);
}

#[test]
fn e2e_return_forms() {
    let (proto, _) = compile_str("return");
    let (_, ret) = find_opcode(&proto, OpCode::Return).unwrap();
    assert_eq!(ret.b(), 1);

    let (proto, _) = compile_str("return 1, 2, 3");
    let (_, ret) = find_opcode(&proto, OpCode::Return).unwrap();
    assert_eq!(ret.b(), 4);

    let (proto, _) = compile_str("local function f() return 1 end return 7, f()");
    // last expression open: return all values
    assert!(proto
        .code
        .iter()
        .any(|i| i.opcode() == OpCode::Return && i.b() == 0));
}

#[test]
fn e2e_statement_call_discards_results() {
    let (proto, _) = compile_str("f(1, 2)");
    let (_, call) = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(call.b(), 3); // two arguments
    assert_eq!(call.c(), 1); // no results kept
}

#[test]
fn e2e_statement_temps_released() {
    // Temporaries do not accumulate across statements
    let (proto, _) = compile_str("f() g() h() f() g() h()");
    assert!(proto.max_stack_size <= 3);
    check_invariants(&proto);
}
