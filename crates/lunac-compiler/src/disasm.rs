/// Bytecode disassembler (luac -l style output).
use crate::opcode::{is_rk_constant, rk_index, Instruction, InstructionFormat, OpCode};
use crate::proto::{Constant, Proto};
use lunac_core::string::StringInterner;
use std::fmt::Write;

/// Disassemble a complete prototype tree into a human-readable listing.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, strings, 0);
    out
}

fn disassemble_proto(out: &mut String, proto: &Proto, strings: &StringInterner, level: usize) {
    let indent = "  ".repeat(level);

    let vararg = if proto.is_vararg { "+" } else { "" };
    writeln!(
        out,
        "{indent}function ({}{vararg} params, {} slots, {} upvalues, {} constants, {} functions)",
        proto.num_params,
        proto.max_stack_size,
        proto.upvalues.len(),
        proto.constants.len(),
        proto.protos.len(),
    )
    .unwrap();

    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.lines.get(pc).copied().unwrap_or(0);
        let line_str = if line > 0 {
            format!("[{line}]")
        } else {
            "[-]".to_string()
        };
        write!(out, "{indent}\t{}\t{:>5}\t", pc + 1, line_str).unwrap();
        disasm_instruction(out, inst, pc, proto, strings);
        writeln!(out).unwrap();
    }

    if !proto.constants.is_empty() {
        writeln!(out, "{indent}constants ({}):", proto.constants.len()).unwrap();
        for (i, k) in proto.constants.iter().enumerate() {
            write!(out, "{indent}\t{}\t", i).unwrap();
            format_constant(out, k, strings);
            writeln!(out).unwrap();
        }
    }

    if !proto.local_vars.is_empty() {
        writeln!(out, "{indent}locals ({}):", proto.local_vars.len()).unwrap();
        for (i, lv) in proto.local_vars.iter().enumerate() {
            writeln!(
                out,
                "{indent}\t{}\t{}\t{}\t{}",
                i,
                strings.display(lv.name),
                lv.start_pc,
                lv.end_pc
            )
            .unwrap();
        }
    }

    if !proto.upvalues.is_empty() {
        writeln!(out, "{indent}upvalues ({}):", proto.upvalues.len()).unwrap();
        for (i, up) in proto.upvalues.iter().enumerate() {
            writeln!(out, "{indent}\t{}\t{}", i, strings.display(up.name)).unwrap();
        }
    }

    for (i, p) in proto.protos.iter().enumerate() {
        writeln!(out, "{indent}function [{i}]:").unwrap();
        disassemble_proto(out, p, strings, level + 1);
    }
}

/// Disassemble a single instruction.
pub fn disasm_instruction(
    out: &mut String,
    inst: &Instruction,
    pc: usize,
    proto: &Proto,
    strings: &StringInterner,
) {
    let op = inst.opcode();
    write!(out, "{:<12}", op.name()).unwrap();

    match op.format() {
        InstructionFormat::IABC => {
            write!(out, "{} {} {}", inst.a(), inst.b(), inst.c()).unwrap();
            // Decode RK operands of the common table/arith instructions
            let mut notes = Vec::new();
            for rk in [inst.b(), inst.c()] {
                if uses_rk(op) && is_rk_constant(rk) {
                    let idx = rk_index(rk) as usize;
                    if idx < proto.constants.len() {
                        let mut s = String::new();
                        format_constant(&mut s, &proto.constants[idx], strings);
                        notes.push(s);
                    }
                }
            }
            if !notes.is_empty() {
                write!(out, "\t; {}", notes.join(" ")).unwrap();
            }
        }
        InstructionFormat::IABx => {
            write!(out, "{} {}", inst.a(), inst.bx()).unwrap();
            match op {
                OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal => {
                    let idx = inst.bx() as usize;
                    if idx < proto.constants.len() {
                        write!(out, "\t; ").unwrap();
                        format_constant(out, &proto.constants[idx], strings);
                    }
                }
                OpCode::Closure => {
                    write!(out, "\t; function [{}]", inst.bx()).unwrap();
                }
                _ => {}
            }
        }
        InstructionFormat::IAsBx => {
            write!(out, "{} {}", inst.a(), inst.sbx()).unwrap();
            // Jump destination as an absolute pc (1-based like luac)
            let target = pc as i64 + 1 + inst.sbx() as i64;
            write!(out, "\t; to {}", target + 1).unwrap();
        }
    }
}

fn uses_rk(op: OpCode) -> bool {
    use OpCode::*;
    matches!(
        op,
        GetTable | SetTable | Self_ | Add | Sub | Mul | Div | Mod | Pow | Eq | Lt | Le
    )
}

fn format_constant(out: &mut String, k: &Constant, strings: &StringInterner) {
    match k {
        Constant::Nil => write!(out, "nil").unwrap(),
        Constant::Boolean(b) => write!(out, "{b}").unwrap(),
        Constant::Number(n) => write!(out, "{n}").unwrap(),
        Constant::Str(id) => {
            let bytes = strings.get(*id);
            if let Ok(s) = std::str::from_utf8(bytes) {
                write!(out, "{s:?}").unwrap();
            } else {
                write!(out, "<binary string>").unwrap();
            }
        }
    }
}
