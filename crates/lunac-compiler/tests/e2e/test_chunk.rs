use super::helpers::*;
use lunac_compiler::chunk::{self, DumpConfig};
use lunac_compiler::opcode::OpCode;
use lunac_compiler::proto::Constant;
use lunac_compiler::compile;
use lunac_core::string::StringInterner;

#[test]
fn e2e_header_layout() {
    let bytes = compile(b"return 1", "@t").unwrap();
    assert_eq!(
        &bytes[0..12],
        &[0x1b, b'L', b'u', b'a', 0x51, 0x00, 0x01, 4, 4, 4, 8, 0]
    );
}

#[test]
fn e2e_compile_pipeline_roundtrip() {
    let src = b"local function add(a, b) return a + b end return add(2, 3)";
    let bytes = compile(src, "@t").unwrap();
    let mut strings = StringInterner::new();
    let proto = chunk::undump(&bytes, &mut strings).unwrap();
    assert!(proto.is_vararg);
    assert_eq!(proto.protos.len(), 1);
    assert_eq!(proto.protos[0].num_params, 2);
    assert!(proto.protos[0]
        .code
        .iter()
        .any(|i| i.opcode() == OpCode::Add));
    assert_eq!(proto.code.len(), proto.lines.len());
}

#[test]
fn e2e_instruction_words_are_little_endian() {
    // "return" alone emits RETURN 0 1 0: opcode 30 | B=1 << 23
    let bytes = compile(b"return", "@t").unwrap();
    let expected: u32 = 30 | (1 << 23);
    let word = expected.to_le_bytes();
    assert!(
        bytes.windows(4).any(|w| w == word),
        "RETURN 0 1 word not found in dump"
    );
}

#[test]
fn e2e_number_constant_is_ieee_double() {
    let bytes = compile(b"return 0.5", "@t").unwrap();
    let half = 0.5f64.to_le_bytes();
    assert!(bytes.windows(8).any(|w| w == half));
}

#[test]
fn e2e_string_constants_nul_terminated() {
    let bytes = compile(b"return \"abc\"", "@t").unwrap();
    // length 4 (including NUL), bytes, NUL
    let needle = [4u8, 0, 0, 0, b'a', b'b', b'c', 0];
    assert!(bytes.windows(needle.len()).any(|w| w == needle));
}

#[test]
fn e2e_embedded_nul_roundtrip() {
    let bytes = compile(b"return \"a\\0b\"", "@t").unwrap();
    let mut strings = StringInterner::new();
    let proto = chunk::undump(&bytes, &mut strings).unwrap();
    let found = proto.constants.iter().any(
        |k| matches!(k, Constant::Str(id) if strings.get(*id) == b"a\0b"),
    );
    assert!(found, "NUL-embedded constant lost in round trip");
}

#[test]
fn e2e_upvalue_names_always_emitted() {
    let src = b"local x = 1 return function() return x end";
    let (proto, strings) = compile_str(std::str::from_utf8(src).unwrap());
    let bytes = chunk::dump(&proto, &strings);
    let mut restored_strings = StringInterner::new();
    let restored = chunk::undump(&bytes, &mut restored_strings).unwrap();
    assert_eq!(restored.protos[0].upvalues.len(), 1);
    assert_eq!(restored_strings.get(restored.protos[0].upvalues[0].name), b"x");
}

#[test]
fn e2e_debug_locals_roundtrip() {
    let src = "local alpha = 1 do local beta = 2 end return alpha";
    let (proto, strings) = compile_str(src);
    let bytes = chunk::dump(&proto, &strings);
    let mut restored_strings = StringInterner::new();
    let restored = chunk::undump(&bytes, &mut restored_strings).unwrap();
    let names: Vec<&[u8]> = restored
        .local_vars
        .iter()
        .map(|lv| restored_strings.get(lv.name))
        .collect();
    assert!(names.contains(&b"alpha".as_slice()));
    assert!(names.contains(&b"beta".as_slice()));
    for lv in &restored.local_vars {
        assert!(lv.start_pc <= lv.end_pc);
        assert!(lv.end_pc as usize <= restored.code.len());
    }
}

#[test]
fn e2e_strip_mode() {
    let src = "local x = 1 return x";
    let (proto, strings) = compile_str(src);
    let full = chunk::dump(&proto, &strings);
    let stripped = chunk::dump_with(
        &proto,
        &strings,
        &DumpConfig {
            size_t_width: 4,
            strip: true,
        },
    );
    assert!(stripped.len() < full.len());
    let mut s = StringInterner::new();
    let restored = chunk::undump(&stripped, &mut s).unwrap();
    assert!(restored.lines.is_empty());
    assert!(restored.local_vars.is_empty());
    assert_eq!(restored.code.len(), proto.code.len());
}

#[test]
fn e2e_wide_size_t() {
    let src = "return \"wide\"";
    let (proto, strings) = compile_str(src);
    let bytes = chunk::dump_with(
        &proto,
        &strings,
        &DumpConfig {
            size_t_width: 8,
            strip: false,
        },
    );
    assert_eq!(bytes[8], 8);
    let mut s = StringInterner::new();
    let restored = chunk::undump(&bytes, &mut s).unwrap();
    assert!(restored
        .constants
        .iter()
        .any(|k| matches!(k, Constant::Str(id) if s.get(*id) == b"wide")));
}

#[test]
fn e2e_compilation_is_deterministic() {
    let src = b"local t = {}\nfor i = 1, 100 do t[#t + 1] = function() return i end end\nreturn t";
    let a = compile(src, "@same").unwrap();
    let b = compile(src, "@same").unwrap();
    assert_eq!(a, b);
}

#[test]
fn e2e_line_numbers_in_dump() {
    let src = "local a = 1\nlocal b = 2\nreturn a + b";
    let (proto, _) = compile_str(src);
    assert_eq!(proto.lines.len(), proto.code.len());
    // First instruction from line 1, the return from line 3
    assert_eq!(proto.lines[0], 1);
    assert!(proto.lines.iter().any(|&l| l == 3));
}

#[test]
fn e2e_scenario_programs_compile_clean() {
    // The full scenario battery: every program must compile and satisfy
    // the structural invariants.
    let programs: &[&str] = &[
        "return 2 + 3 * 4 ^ 2 / 2",
        "local a,b,c = 1,2,3 a,b = b,a return a+b+c",
        "local s=0 for i=10,1,-2 do s=s+i end return s",
        "local function f() local x=5 return function() x=x+1 return x end end local g=f() g() return g()",
        "local t={1,2,3,[4]=4} return t[4]",
        "local function fact(n) if n==0 then return 1 end return n*fact(n-1) end return fact(5)",
        "return \"a\"..\"b\"..'c'..[[d]]",
        "return 2*10+(function() return 2*5 end)()",
    ];
    for src in programs {
        let (proto, _) = compile_str(src);
        check_invariants(&proto);
        let bytes = compile(src.as_bytes(), "@scenario").unwrap();
        assert_eq!(&bytes[0..4], b"\x1bLua");
    }
}
