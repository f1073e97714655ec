//! Code generator: AST → tree of function prototypes.
//!
//! One [`FuncState`] per source function, stacked for nesting. Expressions
//! compile to [`ExprDesc`] value descriptors that defer materialization
//! until the destination register is known; calls and `...` stay "open"
//! until their context fixes a result count.
pub mod expr;
pub mod scope;

use crate::ast::{Ast, BinOp, Block, Expr, FuncBody, Stat, TableItem, UnOp};
use crate::opcode::{
    rk_constant, Instruction, OpCode, MAX_BX, MAX_C, MAX_INDEX_RK, MAX_SBX, MIN_SBX,
};
use crate::proto::{Constant, LocalVar, Proto, UpvalDesc};
use expr::ExprDesc;
use lunac_core::limits::{FIELDS_PER_FLUSH, MAX_LOCALS, MAX_STACK, MAX_UPVALUES};
use lunac_core::string::{StringId, StringInterner};
use scope::ScopeManager;
use std::fmt;

/// Code generation error: the program is syntactically valid but cannot be
/// encoded (break outside a loop, too many locals/upvalues/constants,
/// register or jump overflow).
#[derive(Clone, Debug)]
pub struct CodeGenError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for CodeGenError {}

/// State for a single function being compiled.
struct FuncState {
    proto: Proto,
    scope: ScopeManager,
    upvalues: Vec<UpvalDesc>,
}

impl FuncState {
    fn new() -> Self {
        FuncState {
            proto: Proto::new(),
            scope: ScopeManager::new(),
            upvalues: Vec::new(),
        }
    }
}

/// Generate the prototype tree for a parsed chunk. The main chunk compiles
/// as a vararg function named after `chunk_name`.
pub fn generate(ast: Ast, chunk_name: &str) -> Result<(Proto, StringInterner), CodeGenError> {
    let mut strings = ast.strings;
    let source = strings.intern(chunk_name.as_bytes());

    let mut cg = CodeGen {
        strings,
        func_stack: Vec::new(),
    };

    let mut top = FuncState::new();
    top.proto.source = Some(source);
    top.proto.is_vararg = true;
    cg.func_stack.push(top);
    cg.fs_mut().scope.enter_block(false);

    cg.statements(&ast.block)?;

    let ret_line = ast.block.stats.last().map(stat_line).unwrap_or(0);
    let proto = cg.finish_function(ret_line);
    Ok((proto, cg.strings))
}

fn stat_line(s: &Stat) -> u32 {
    match s {
        Stat::Assign { line, .. }
        | Stat::Local { line, .. }
        | Stat::Call { line, .. }
        | Stat::Do { line, .. }
        | Stat::While { line, .. }
        | Stat::Repeat { line, .. }
        | Stat::If { line, .. }
        | Stat::NumericFor { line, .. }
        | Stat::GenericFor { line, .. }
        | Stat::Function { line, .. }
        | Stat::LocalFunction { line, .. }
        | Stat::Return { line, .. }
        | Stat::Break { line } => *line,
    }
}

struct CodeGen {
    strings: StringInterner,
    /// Stack of function states, innermost last.
    func_stack: Vec<FuncState>,
}

impl CodeGen {
    fn fs(&self) -> &FuncState {
        self.func_stack.last().unwrap()
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.func_stack.last_mut().unwrap()
    }

    fn error(&self, line: u32, msg: impl Into<String>) -> CodeGenError {
        CodeGenError {
            message: msg.into(),
            line,
        }
    }

    // ---- Emission helpers ----

    fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        self.fs_mut().proto.emit(inst, line)
    }

    fn emit_abc(&mut self, op: OpCode, a: u8, b: u32, c: u32, line: u32) -> usize {
        self.emit(Instruction::abc(op, a, b, c), line)
    }

    fn emit_abx(&mut self, op: OpCode, a: u8, bx: u32, line: u32) -> usize {
        self.emit(Instruction::abx(op, a, bx), line)
    }

    fn current_pc(&self) -> usize {
        self.fs().proto.code_len()
    }

    /// Emit a JMP with a placeholder offset, to be patched later.
    fn emit_jump(&mut self, line: u32) -> usize {
        self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line)
    }

    /// Patch the jump at `jump_pc` to land on the current PC.
    fn patch_jump(&mut self, jump_pc: usize) -> Result<(), CodeGenError> {
        let target = self.current_pc();
        self.patch_jump_to(jump_pc, target)
    }

    fn patch_jump_to(&mut self, jump_pc: usize, target: usize) -> Result<(), CodeGenError> {
        let offset = target as i64 - jump_pc as i64 - 1;
        if offset < MIN_SBX as i64 || offset > MAX_SBX as i64 {
            let line = self.fs().proto.lines[jump_pc];
            return Err(self.error(line, "control structure too long"));
        }
        self.fs_mut().proto.get_mut(jump_pc).set_sbx(offset as i32);
        Ok(())
    }

    fn patch_list(&mut self, jumps: &[usize]) -> Result<(), CodeGenError> {
        for &pc in jumps {
            self.patch_jump(pc)?;
        }
        Ok(())
    }

    // ---- Registers ----

    /// Allocate `n` consecutive registers, checking the frame limit.
    fn reserve_regs(&mut self, n: u8, line: u32) -> Result<u8, CodeGenError> {
        if self.fs().scope.free_reg as usize + n as usize > MAX_STACK {
            return Err(self.error(line, "function or expression too complex"));
        }
        Ok(self.fs_mut().scope.alloc_regs(n))
    }

    fn free_to(&mut self, level: u8) {
        self.fs_mut().scope.free_to(level);
    }

    // ---- Constants ----

    fn add_constant(&mut self, k: Constant, line: u32) -> Result<u32, CodeGenError> {
        let idx = self.fs_mut().proto.add_constant(k);
        if idx as u32 > MAX_BX {
            return Err(self.error(line, "constant table overflow"));
        }
        Ok(idx as u32)
    }

    fn add_string_constant(&mut self, id: StringId, line: u32) -> Result<u32, CodeGenError> {
        self.add_constant(Constant::Str(id), line)
    }

    /// Encode a constant as an RK operand, staging through LOADK when its
    /// pool index is too large for the RK field.
    fn constant_rk(&mut self, k: Constant, line: u32) -> Result<u32, CodeGenError> {
        let idx = self.add_constant(k, line)?;
        if idx <= MAX_INDEX_RK {
            Ok(rk_constant(idx))
        } else {
            let reg = self.reserve_regs(1, line)?;
            self.emit_abx(OpCode::LoadK, reg, idx, line);
            Ok(reg as u32)
        }
    }

    /// RK operand for an interned string.
    fn str_rk(&mut self, id: StringId, line: u32) -> Result<u32, CodeGenError> {
        self.constant_rk(Constant::Str(id), line)
    }

    // ---- Locals and upvalues ----

    /// Declare a local at the next free register, recording its debug entry.
    fn declare_local(&mut self, name: StringId, line: u32) -> Result<u8, CodeGenError> {
        if self.fs().scope.num_locals() >= MAX_LOCALS {
            return Err(self.error(line, "too many local variables"));
        }
        if self.fs().scope.free_reg as usize >= MAX_STACK {
            return Err(self.error(line, "function or expression too complex"));
        }
        let start_pc = self.fs().proto.code_len() as u32;
        let debug_idx = self.fs().proto.local_vars.len();
        self.fs_mut().proto.local_vars.push(LocalVar {
            name,
            start_pc,
            end_pc: 0,
        });
        Ok(self.fs_mut().scope.add_local(name, start_pc, debug_idx))
    }

    /// Leave the innermost scope: optionally emit CLOSE for captured
    /// locals, restore the register level, and close debug ranges.
    fn leave_scope(
        &mut self,
        line: u32,
        emit_close: bool,
    ) -> Result<scope::BlockScope, CodeGenError> {
        if emit_close {
            if let Some(reg) = self.min_captured_in_block() {
                self.emit_abc(OpCode::Close, reg, 0, 0, line);
            }
        }
        let (block, dead) = self.fs_mut().scope.leave_block();
        let end_pc = self.fs().proto.code_len() as u32;
        for local in dead {
            self.fs_mut().proto.local_vars[local.debug_idx].end_pc = end_pc;
        }
        Ok(block)
    }

    /// Lowest captured register among locals of the innermost block.
    fn min_captured_in_block(&self) -> Option<u8> {
        let scope = &self.fs().scope;
        let block = scope.blocks.last()?;
        if !block.has_upval {
            return None;
        }
        scope.locals[block.num_locals_on_entry..]
            .iter()
            .filter(|l| l.captured)
            .map(|l| l.reg)
            .min()
    }

    /// Resolve a name: visible local → upvalue chain → global.
    fn resolve_name(&mut self, name: StringId, line: u32) -> Result<ExprDesc, CodeGenError> {
        if let Some(local) = self.fs().scope.resolve_local(name) {
            return Ok(ExprDesc::Register(local.reg));
        }
        let top = self.func_stack.len() - 1;
        if let Some(idx) = self.resolve_upvalue(top, name, line)? {
            return Ok(ExprDesc::Upvalue(idx));
        }
        let k = self.add_string_constant(name, line)?;
        Ok(ExprDesc::Global(k))
    }

    /// Walk enclosing functions for `name`, appending upvalue descriptors
    /// along the chain. Memoized: an existing descriptor is reused, so two
    /// references to the same outer local share one upvalue index.
    fn resolve_upvalue(
        &mut self,
        fs_idx: usize,
        name: StringId,
        line: u32,
    ) -> Result<Option<u8>, CodeGenError> {
        if fs_idx == 0 {
            // The main chunk has no upvalues; unresolved names are globals.
            return Ok(None);
        }
        let parent = fs_idx - 1;

        if let Some(local) = self.func_stack[parent].scope.resolve_local(name) {
            let reg = local.reg;
            self.func_stack[parent].scope.mark_captured(name);
            let idx = self.add_upvalue(fs_idx, name, true, reg, line)?;
            return Ok(Some(idx));
        }

        if let Some(parent_idx) = self.resolve_upvalue(parent, name, line)? {
            let idx = self.add_upvalue(fs_idx, name, false, parent_idx, line)?;
            return Ok(Some(idx));
        }

        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        fs_idx: usize,
        name: StringId,
        in_stack: bool,
        index: u8,
        line: u32,
    ) -> Result<u8, CodeGenError> {
        let fs = &mut self.func_stack[fs_idx];
        for (i, up) in fs.upvalues.iter().enumerate() {
            if up.in_stack == in_stack && up.index == index {
                return Ok(i as u8);
            }
        }
        if fs.upvalues.len() >= MAX_UPVALUES {
            return Err(self.error(line, "too many upvalues"));
        }
        let idx = fs.upvalues.len() as u8;
        fs.upvalues.push(UpvalDesc {
            name,
            in_stack,
            index,
        });
        Ok(idx)
    }

    // ---- Discharge: materialize descriptors into registers ----

    /// Write the value described by `desc` into `reg`.
    fn discharge_to_reg(
        &mut self,
        desc: &ExprDesc,
        reg: u8,
        line: u32,
    ) -> Result<(), CodeGenError> {
        match desc {
            ExprDesc::Nil => {
                self.emit_abc(OpCode::LoadNil, reg, reg as u32, 0, line);
            }
            ExprDesc::True => {
                self.emit_abc(OpCode::LoadBool, reg, 1, 0, line);
            }
            ExprDesc::False => {
                self.emit_abc(OpCode::LoadBool, reg, 0, 0, line);
            }
            ExprDesc::Number(v) => {
                let k = self.add_constant(Constant::Number(*v), line)?;
                self.emit_abx(OpCode::LoadK, reg, k, line);
            }
            ExprDesc::Str(id) => {
                let k = self.add_string_constant(*id, line)?;
                self.emit_abx(OpCode::LoadK, reg, k, line);
            }
            ExprDesc::Register(src) => {
                if *src != reg {
                    self.emit_abc(OpCode::Move, reg, *src as u32, 0, line);
                }
            }
            ExprDesc::Upvalue(idx) => {
                self.emit_abc(OpCode::GetUpval, reg, *idx as u32, 0, line);
            }
            ExprDesc::Global(k) => {
                self.emit_abx(OpCode::GetGlobal, reg, *k, line);
            }
            ExprDesc::Indexed { table, key } => {
                self.emit_abc(OpCode::GetTable, reg, *table as u32, *key, line);
            }
            ExprDesc::Relocatable(pc) => {
                self.fs_mut().proto.code[*pc].set_a(reg);
            }
            ExprDesc::Call(pc) => {
                // Fix the call to one result, then move it if needed.
                let a = {
                    let inst = self.fs_mut().proto.get_mut(*pc);
                    inst.set_c(2);
                    inst.a()
                };
                if a != reg {
                    self.emit_abc(OpCode::Move, reg, a as u32, 0, line);
                }
            }
            ExprDesc::Vararg(pc) => {
                let pc = *pc;
                self.fs_mut().proto.code[pc] = Instruction::abc(OpCode::VarArg, reg, 2, 0);
            }
            ExprDesc::Jump(pc) => {
                // The JMP at `pc` is taken when the comparison holds.
                let pc = *pc;
                self.emit_abc(OpCode::LoadBool, reg, 0, 1, line); // false, skip next
                let true_pc = self.current_pc();
                self.emit_abc(OpCode::LoadBool, reg, 1, 0, line); // true
                self.patch_jump_to(pc, true_pc)?;
            }
        }
        Ok(())
    }

    /// Put the described value in some register, reusing one when possible.
    fn discharge_to_any_reg(&mut self, desc: &ExprDesc, line: u32) -> Result<u8, CodeGenError> {
        match desc {
            ExprDesc::Register(r) => Ok(*r),
            ExprDesc::Call(pc) => {
                // The call result already sits at its base register.
                let inst = self.fs_mut().proto.get_mut(*pc);
                inst.set_c(2);
                Ok(inst.a())
            }
            _ => {
                let reg = self.reserve_regs(1, line)?;
                self.discharge_to_reg(desc, reg, line)?;
                Ok(reg)
            }
        }
    }

    /// Convert a descriptor into an RK operand.
    fn desc_to_rk(&mut self, desc: ExprDesc, line: u32) -> Result<u32, CodeGenError> {
        match desc {
            ExprDesc::Nil => self.constant_rk(Constant::Nil, line),
            ExprDesc::True => self.constant_rk(Constant::Boolean(true), line),
            ExprDesc::False => self.constant_rk(Constant::Boolean(false), line),
            ExprDesc::Number(v) => self.constant_rk(Constant::Number(v), line),
            ExprDesc::Str(id) => self.constant_rk(Constant::Str(id), line),
            ExprDesc::Register(r) => Ok(r as u32),
            other => Ok(self.discharge_to_any_reg(&other, line)? as u32),
        }
    }

    // ---- Expressions ----

    /// Compile an expression to a lazy value descriptor.
    fn expr(&mut self, e: &Expr) -> Result<ExprDesc, CodeGenError> {
        let line = e.line();
        match e {
            Expr::Nil { .. } => Ok(ExprDesc::Nil),
            Expr::True { .. } => Ok(ExprDesc::True),
            Expr::False { .. } => Ok(ExprDesc::False),
            Expr::Number { value, .. } => Ok(ExprDesc::Number(*value)),
            Expr::Str { value, .. } => Ok(ExprDesc::Str(*value)),
            Expr::Vararg { .. } => {
                // Placeholder operands; fixed when the context is known.
                let pc = self.emit_abc(OpCode::VarArg, 0, 0, 0, line);
                Ok(ExprDesc::Vararg(pc))
            }
            Expr::Name { name, .. } => self.resolve_name(*name, line),
            Expr::Paren { inner, .. } => {
                // Parentheses clip a multi-value producer to one value.
                let desc = self.expr(inner)?;
                if desc.is_open() {
                    let reg = self.discharge_to_any_reg(&desc, line)?;
                    Ok(ExprDesc::Register(reg))
                } else {
                    Ok(desc)
                }
            }
            Expr::Field { object, name, .. } => {
                let table = self.expr_to_any_reg(object)?;
                let key = self.str_rk(*name, line)?;
                Ok(ExprDesc::Indexed { table, key })
            }
            Expr::Index { object, key, .. } => {
                let table = self.expr_to_any_reg(object)?;
                let key_desc = self.expr(key)?;
                let key = self.desc_to_rk(key_desc, line)?;
                Ok(ExprDesc::Indexed { table, key })
            }
            Expr::Unary { op, operand, .. } => self.code_unary(*op, operand, line),
            Expr::Binary { op, lhs, rhs, .. } => match op {
                BinOp::And | BinOp::Or => {
                    let reg = self.reserve_regs(1, line)?;
                    self.short_circuit_into(*op, lhs, rhs, reg, line)?;
                    Ok(ExprDesc::Register(reg))
                }
                BinOp::Concat => self.code_concat(e, line),
                op if op.is_comparison() => {
                    let pc = self.comparison_jump(*op, lhs, rhs, true, line)?;
                    Ok(ExprDesc::Jump(pc))
                }
                _ => self.code_arith(*op, lhs, rhs, line),
            },
            Expr::Call {
                func, method, args, ..
            } => self.compile_call(func, *method, args, line),
            Expr::Function { body, .. } => {
                let reg = self.reserve_regs(1, line)?;
                self.closure_into(body, false, reg, line)?;
                Ok(ExprDesc::Register(reg))
            }
            Expr::Table { items, .. } => {
                let reg = self.reserve_regs(1, line)?;
                self.table_into(items, reg, line)?;
                Ok(ExprDesc::Register(reg))
            }
        }
    }

    /// Compile an expression directly into a specific (already reserved)
    /// register, producing exactly one value.
    fn expr_to_reg(&mut self, e: &Expr, reg: u8) -> Result<(), CodeGenError> {
        match e {
            Expr::Binary {
                op: op @ (BinOp::And | BinOp::Or),
                lhs,
                rhs,
                line,
            } => self.short_circuit_into(*op, lhs, rhs, reg, *line),
            Expr::Function { body, line } => self.closure_into(body, false, reg, *line),
            // A table constructor can build in place when its scratch area
            // starts right above the destination (SETLIST needs the array
            // values contiguous after the table register).
            Expr::Table { items, line } if self.fs().scope.free_reg == reg + 1 => {
                self.table_into(items, reg, *line)
            }
            _ => {
                let desc = self.expr(e)?;
                self.discharge_to_reg(&desc, reg, e.line())
            }
        }
    }

    /// Compile an expression into any register.
    fn expr_to_any_reg(&mut self, e: &Expr) -> Result<u8, CodeGenError> {
        let desc = self.expr(e)?;
        self.discharge_to_any_reg(&desc, e.line())
    }

    /// Short-circuit `and`/`or` with the result in `reg`.
    fn short_circuit_into(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        reg: u8,
        line: u32,
    ) -> Result<(), CodeGenError> {
        self.expr_to_reg(lhs, reg)?;
        self.free_to(reg + 1);
        // and: skip the right side when the left is falsey;
        // or: skip it when the left is truthy.
        let c = if op == BinOp::And { 0 } else { 1 };
        self.emit_abc(OpCode::Test, reg, 0, c, line);
        let jump = self.emit_jump(line);

        self.expr_to_reg(rhs, reg)?;
        self.free_to(reg + 1);
        self.patch_jump(jump)
    }

    fn code_unary(
        &mut self,
        op: UnOp,
        operand: &Expr,
        line: u32,
    ) -> Result<ExprDesc, CodeGenError> {
        let desc = self.expr(operand)?;

        // Constant folding on literals
        match (op, &desc) {
            (UnOp::Neg, ExprDesc::Number(v)) => return Ok(ExprDesc::Number(-v)),
            (UnOp::Not, ExprDesc::Nil | ExprDesc::False) => return Ok(ExprDesc::True),
            (UnOp::Not, d) if d.is_literal() => return Ok(ExprDesc::False),
            _ => {}
        }

        let save = self.fs().scope.free_reg;
        let src = self.discharge_to_any_reg(&desc, line)?;
        self.free_to(save);
        let opcode = match op {
            UnOp::Neg => OpCode::Unm,
            UnOp::Not => OpCode::Not,
            UnOp::Len => OpCode::Len,
        };
        let pc = self.emit_abc(opcode, 0, src as u32, 0, line);
        Ok(ExprDesc::Relocatable(pc))
    }

    fn code_arith(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        line: u32,
    ) -> Result<ExprDesc, CodeGenError> {
        let save = self.fs().scope.free_reg;
        let l_desc = self.expr(lhs)?;

        // Literal lhs emits no code, so evaluation order is preserved even
        // when the fold attempt fails.
        if let ExprDesc::Number(a) = l_desc {
            let r_desc = self.expr(rhs)?;
            if let ExprDesc::Number(b) = r_desc {
                if let Some(v) = fold_arith(op, a, b) {
                    return Ok(ExprDesc::Number(v));
                }
            }
            let lrk = self.constant_rk(Constant::Number(a), line)?;
            let rrk = self.desc_to_rk(r_desc, line)?;
            return self.finish_arith(op, lrk, rrk, save, line);
        }

        let lrk = self.desc_to_rk(l_desc, line)?;
        let r_desc = self.expr(rhs)?;
        let rrk = self.desc_to_rk(r_desc, line)?;
        self.finish_arith(op, lrk, rrk, save, line)
    }

    fn finish_arith(
        &mut self,
        op: BinOp,
        lrk: u32,
        rrk: u32,
        save: u8,
        line: u32,
    ) -> Result<ExprDesc, CodeGenError> {
        let opcode = match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::Mod => OpCode::Mod,
            BinOp::Pow => OpCode::Pow,
            _ => unreachable!("not an arithmetic operator"),
        };
        self.free_to(save);
        let pc = self.emit_abc(opcode, 0, lrk, rrk, line);
        Ok(ExprDesc::Relocatable(pc))
    }

    /// A run of `..` compiles its operands into consecutive registers and
    /// emits one CONCAT spanning them.
    fn code_concat(&mut self, e: &Expr, line: u32) -> Result<ExprDesc, CodeGenError> {
        // Collect the right-leaning spine of concat operands.
        let mut operands = Vec::new();
        let mut cur = e;
        while let Expr::Binary {
            op: BinOp::Concat,
            lhs,
            rhs,
            ..
        } = cur
        {
            operands.push(lhs.as_ref());
            cur = rhs;
        }
        operands.push(cur);

        let save = self.fs().scope.free_reg;
        let base = self.reserve_regs(1, line)?;
        self.expr_to_reg(operands[0], base)?;
        self.free_to(base + 1);
        for operand in &operands[1..] {
            let r = self.reserve_regs(1, operand.line())?;
            self.expr_to_reg(operand, r)?;
            self.free_to(r + 1);
        }
        let last = base + (operands.len() - 1) as u8;
        self.free_to(save);
        let pc = self.emit_abc(OpCode::Concat, 0, base as u32, last as u32, line);
        Ok(ExprDesc::Relocatable(pc))
    }

    /// Emit a comparison followed by a JMP taken when the comparison
    /// matches `when_true`. Returns the JMP's PC.
    fn comparison_jump(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        when_true: bool,
        line: u32,
    ) -> Result<usize, CodeGenError> {
        let save = self.fs().scope.free_reg;
        let l_desc = self.expr(lhs)?;
        let lrk = self.desc_to_rk(l_desc, line)?;
        let r_desc = self.expr(rhs)?;
        let rrk = self.desc_to_rk(r_desc, line)?;

        // `>` and `>=` swap operands; `~=` inverts EQ.
        let (opcode, b, c, polarity) = match op {
            BinOp::Eq => (OpCode::Eq, lrk, rrk, true),
            BinOp::NotEq => (OpCode::Eq, lrk, rrk, false),
            BinOp::Lt => (OpCode::Lt, lrk, rrk, true),
            BinOp::Gt => (OpCode::Lt, rrk, lrk, true),
            BinOp::LtEq => (OpCode::Le, lrk, rrk, true),
            BinOp::GtEq => (OpCode::Le, rrk, lrk, true),
            _ => unreachable!("not a comparison"),
        };
        let a = if when_true == polarity { 1 } else { 0 };

        self.free_to(save);
        self.emit_abc(opcode, a, b, c, line);
        Ok(self.emit_jump(line))
    }

    // ---- Conditions ----
    //
    // Conditions never materialize booleans: they compile to jump lists.
    // `cond_false` returns the jumps taken when the condition fails;
    // `cond_true` the jumps taken when it holds. True-jumps of `or` (and
    // false-jumps of `and` in the true-directed form) are patched to the
    // end of the condition, i.e. the fall-through point.

    fn cond_false(&mut self, e: &Expr) -> Result<Vec<usize>, CodeGenError> {
        let line = e.line();
        match e {
            Expr::Binary {
                op: BinOp::And,
                lhs,
                rhs,
                ..
            } => {
                let mut jumps = self.cond_false(lhs)?;
                jumps.extend(self.cond_false(rhs)?);
                Ok(jumps)
            }
            Expr::Binary {
                op: BinOp::Or,
                lhs,
                rhs,
                ..
            } => {
                let true_jumps = self.cond_true(lhs)?;
                let jumps = self.cond_false(rhs)?;
                self.patch_list(&true_jumps)?;
                Ok(jumps)
            }
            Expr::Binary { op, lhs, rhs, .. } if op.is_comparison() => {
                Ok(vec![self.comparison_jump(*op, lhs, rhs, false, line)?])
            }
            Expr::Unary {
                op: UnOp::Not,
                operand,
                ..
            } => self.cond_true(operand),
            Expr::Nil { .. } | Expr::False { .. } => Ok(vec![self.emit_jump(line)]),
            Expr::True { .. } | Expr::Number { .. } | Expr::Str { .. } => Ok(Vec::new()),
            _ => {
                let save = self.fs().scope.free_reg;
                let reg = self.expr_to_any_reg(e)?;
                self.free_to(save);
                self.emit_abc(OpCode::Test, reg, 0, 0, line);
                Ok(vec![self.emit_jump(line)])
            }
        }
    }

    fn cond_true(&mut self, e: &Expr) -> Result<Vec<usize>, CodeGenError> {
        let line = e.line();
        match e {
            Expr::Binary {
                op: BinOp::And,
                lhs,
                rhs,
                ..
            } => {
                let false_jumps = self.cond_false(lhs)?;
                let jumps = self.cond_true(rhs)?;
                self.patch_list(&false_jumps)?;
                Ok(jumps)
            }
            Expr::Binary {
                op: BinOp::Or,
                lhs,
                rhs,
                ..
            } => {
                let mut jumps = self.cond_true(lhs)?;
                jumps.extend(self.cond_true(rhs)?);
                Ok(jumps)
            }
            Expr::Binary { op, lhs, rhs, .. } if op.is_comparison() => {
                Ok(vec![self.comparison_jump(*op, lhs, rhs, true, line)?])
            }
            Expr::Unary {
                op: UnOp::Not,
                operand,
                ..
            } => self.cond_false(operand),
            Expr::Nil { .. } | Expr::False { .. } => Ok(Vec::new()),
            Expr::True { .. } | Expr::Number { .. } | Expr::Str { .. } => {
                Ok(vec![self.emit_jump(line)])
            }
            _ => {
                let save = self.fs().scope.free_reg;
                let reg = self.expr_to_any_reg(e)?;
                self.free_to(save);
                self.emit_abc(OpCode::Test, reg, 0, 1, line);
                Ok(vec![self.emit_jump(line)])
            }
        }
    }

    // ---- Calls ----

    /// Compile a call. The CALL instruction is emitted with one result;
    /// contexts that need another count patch field C afterwards.
    fn compile_call(
        &mut self,
        func: &Expr,
        method: Option<StringId>,
        args: &[Expr],
        line: u32,
    ) -> Result<ExprDesc, CodeGenError> {
        let base;
        let implicit_args;

        if let Some(mname) = method {
            // obj:m(...) — SELF loads both the method and the receiver.
            let save = self.fs().scope.free_reg;
            let obj = self.expr_to_any_reg(func)?;
            self.free_to(save);
            base = self.reserve_regs(2, line)?;
            let key = self.str_rk(mname, line)?;
            self.emit_abc(OpCode::Self_, base, obj as u32, key, line);
            self.free_to(base + 2);
            implicit_args = 1u32;
        } else {
            base = self.reserve_regs(1, line)?;
            self.expr_to_reg(func, base)?;
            self.free_to(base + 1);
            implicit_args = 0;
        }

        let (fixed, open) = self.explist_open(args)?;

        let b = if open {
            0
        } else {
            fixed as u32 + implicit_args + 1
        };
        let pc = self.emit_abc(OpCode::Call, base, b, 2, line);
        self.free_to(base + 1);
        Ok(ExprDesc::Call(pc))
    }

    /// Compile an expression list into consecutive registers starting at
    /// the current top. If the last expression is an unparenthesized call
    /// or `...`, it is left open (all results). Returns the number of
    /// fixed values and whether the list ends open.
    fn explist_open(&mut self, exprs: &[Expr]) -> Result<(u8, bool), CodeGenError> {
        for (i, e) in exprs.iter().enumerate() {
            let last = i + 1 == exprs.len();
            if last && e.is_multi_value() {
                let desc = self.expr(e)?;
                match desc {
                    ExprDesc::Call(pc) => {
                        self.fs_mut().proto.get_mut(pc).set_c(0);
                    }
                    ExprDesc::Vararg(pc) => {
                        let dst = self.fs().scope.free_reg;
                        self.fs_mut().proto.code[pc] = Instruction::abc(OpCode::VarArg, dst, 0, 0);
                    }
                    _ => unreachable!("multi-value expression"),
                }
                return Ok((i as u8, true));
            }
            let r = self.reserve_regs(1, e.line())?;
            self.expr_to_reg(e, r)?;
            self.free_to(r + 1);
        }
        Ok((exprs.len() as u8, false))
    }

    /// Compile an expression list so that exactly `want` values land at
    /// `base`: the last expression absorbs the difference when it is a
    /// multi-value producer, missing values are filled with nil, and
    /// surplus expressions are still evaluated for their effects.
    fn explist_adjust(
        &mut self,
        exprs: &[Expr],
        base: u8,
        want: u8,
        line: u32,
    ) -> Result<(), CodeGenError> {
        debug_assert!(!exprs.is_empty());
        if base as usize + want as usize > MAX_STACK {
            return Err(self.error(line, "function or expression too complex"));
        }
        for (i, e) in exprs.iter().enumerate() {
            let last = i + 1 == exprs.len();
            if last {
                let slot = base + i as u8;
                let remaining = (want as i32 - i as i32).max(0) as u32;
                if e.is_multi_value() && remaining != 1 {
                    let desc = self.expr(e)?;
                    match desc {
                        ExprDesc::Call(pc) => {
                            self.fs_mut().proto.get_mut(pc).set_c(remaining + 1);
                        }
                        ExprDesc::Vararg(pc) => {
                            self.fs_mut().proto.code[pc] =
                                Instruction::abc(OpCode::VarArg, slot, remaining + 1, 0);
                        }
                        _ => unreachable!("multi-value expression"),
                    }
                } else {
                    let r = self.reserve_regs(1, e.line())?;
                    debug_assert_eq!(r, slot);
                    self.expr_to_reg(e, r)?;
                    self.free_to(r + 1);
                    if (i as u8) + 1 < want {
                        // Pad missing values with nil.
                        self.emit_abc(
                            OpCode::LoadNil,
                            slot + 1,
                            (base + want - 1) as u32,
                            0,
                            line,
                        );
                    }
                }
            } else {
                let r = self.reserve_regs(1, e.line())?;
                self.expr_to_reg(e, r)?;
                self.free_to(r + 1);
            }
        }
        // Registers up to base+want hold live values now.
        self.fs_mut().scope.bump_to(base + want);
        Ok(())
    }

    // ---- Closures ----

    /// Compile a function body into a nested prototype and emit CLOSURE
    /// into `dst`, followed by one MOVE/GETUPVAL pseudo-instruction per
    /// upvalue (the VM's closure-creation protocol).
    fn closure_into(
        &mut self,
        body: &FuncBody,
        is_method: bool,
        dst: u8,
        line: u32,
    ) -> Result<(), CodeGenError> {
        let mut fs = FuncState::new();
        fs.proto.source = self.fs().proto.source;
        fs.proto.line_defined = body.line;
        fs.proto.last_line_defined = body.end_line;
        fs.proto.is_vararg = body.is_vararg;
        self.func_stack.push(fs);
        self.fs_mut().scope.enter_block(false);

        if is_method {
            let self_name = self.strings.intern(b"self");
            self.declare_local(self_name, body.line)?;
            self.fs_mut().proto.num_params += 1;
        }
        for &param in &body.params {
            self.declare_local(param, body.line)?;
            self.fs_mut().proto.num_params += 1;
        }

        self.statements(&body.body)?;

        let proto = self.finish_function(body.end_line);
        let upvalues = proto.upvalues.clone();

        let proto_idx = self.fs().proto.protos.len();
        if proto_idx as u32 > MAX_BX {
            return Err(self.error(line, "too many nested functions"));
        }
        self.fs_mut().proto.protos.push(proto);

        self.emit_abx(OpCode::Closure, dst, proto_idx as u32, line);
        for up in &upvalues {
            if up.in_stack {
                self.emit_abc(OpCode::Move, 0, up.index as u32, 0, line);
            } else {
                self.emit_abc(OpCode::GetUpval, 0, up.index as u32, 0, line);
            }
        }
        Ok(())
    }

    /// Seal the innermost function: final RETURN, debug ranges, stack size.
    fn finish_function(&mut self, end_line: u32) -> Proto {
        self.emit(Instruction::abc(OpCode::Return, 0, 1, 0), end_line);
        let _ = self.leave_scope(end_line, false);
        let mut fs = self.func_stack.pop().unwrap();
        fs.proto.max_stack_size = fs.scope.max_reg.max(2);
        fs.proto.upvalues = fs.upvalues;
        fs.proto
    }

    // ---- Table constructors ----

    fn table_into(
        &mut self,
        items: &[TableItem],
        reg: u8,
        line: u32,
    ) -> Result<(), CodeGenError> {
        let narray = items
            .iter()
            .filter(|i| matches!(i, TableItem::Array(_)))
            .count() as u32;
        let nhash = items.len() as u32 - narray;
        self.emit_abc(OpCode::NewTable, reg, int2fb(narray), int2fb(nhash), line);
        self.fs_mut().scope.bump_to(reg + 1);

        let mut pending = 0u32; // array values accumulated above `reg`
        let mut flushed = 0u32; // array values already written by SETLIST

        for (idx, item) in items.iter().enumerate() {
            let last = idx + 1 == items.len();
            match item {
                TableItem::Array(e) if last && e.is_multi_value() => {
                    // Open tail: SETLIST with B=0 stores up to stack top.
                    let desc = self.expr(e)?;
                    match desc {
                        ExprDesc::Call(pc) => {
                            self.fs_mut().proto.get_mut(pc).set_c(0);
                        }
                        ExprDesc::Vararg(pc) => {
                            let dst = self.fs().scope.free_reg;
                            self.fs_mut().proto.code[pc] =
                                Instruction::abc(OpCode::VarArg, dst, 0, 0);
                        }
                        _ => unreachable!("multi-value expression"),
                    }
                    let batch = flushed / FIELDS_PER_FLUSH + 1;
                    self.emit_setlist(reg, 0, batch, e.line())?;
                    pending = 0;
                }
                TableItem::Array(e) => {
                    let r = self.reserve_regs(1, e.line())?;
                    self.expr_to_reg(e, r)?;
                    self.free_to(r + 1);
                    pending += 1;
                    if pending == FIELDS_PER_FLUSH {
                        let batch = flushed / FIELDS_PER_FLUSH + 1;
                        self.emit_setlist(reg, pending, batch, e.line())?;
                        flushed += pending;
                        pending = 0;
                        self.free_to(reg + 1);
                    }
                }
                TableItem::Named { name, value } => {
                    let save = self.fs().scope.free_reg;
                    let key = self.str_rk(*name, value.line())?;
                    let val_desc = self.expr(value)?;
                    let val = self.desc_to_rk(val_desc, value.line())?;
                    self.emit_abc(OpCode::SetTable, reg, key, val, value.line());
                    self.free_to(save);
                }
                TableItem::Keyed { key, value } => {
                    let save = self.fs().scope.free_reg;
                    let key_desc = self.expr(key)?;
                    let k = self.desc_to_rk(key_desc, key.line())?;
                    let val_desc = self.expr(value)?;
                    let val = self.desc_to_rk(val_desc, value.line())?;
                    self.emit_abc(OpCode::SetTable, reg, k, val, value.line());
                    self.free_to(save);
                }
            }
        }

        if pending > 0 {
            let batch = flushed / FIELDS_PER_FLUSH + 1;
            self.emit_setlist(reg, pending, batch, line)?;
        }
        self.free_to(reg + 1);
        Ok(())
    }

    /// SETLIST, spilling the batch number into a following raw word when it
    /// exceeds the C field.
    fn emit_setlist(&mut self, reg: u8, b: u32, batch: u32, line: u32) -> Result<(), CodeGenError> {
        if batch <= MAX_C {
            self.emit_abc(OpCode::SetList, reg, b, batch, line);
        } else if batch <= MAX_BX {
            self.emit_abc(OpCode::SetList, reg, b, 0, line);
            self.emit(Instruction(batch), line);
        } else {
            return Err(self.error(line, "constructor too long"));
        }
        Ok(())
    }

    // ---- Statements ----

    /// Compile the statements of a block, releasing statement temporaries.
    fn statements(&mut self, block: &Block) -> Result<(), CodeGenError> {
        for s in &block.stats {
            self.statement(s)?;
            let top = self.fs().scope.locals_top();
            self.free_to(top);
        }
        Ok(())
    }

    /// A block in its own scope (bodies of do/if/loops).
    fn compile_block(&mut self, block: &Block, line: u32) -> Result<scope::BlockScope, CodeGenError> {
        self.fs_mut().scope.enter_block(false);
        self.statements(block)?;
        self.leave_scope(line, true)
    }

    fn statement(&mut self, s: &Stat) -> Result<(), CodeGenError> {
        match s {
            Stat::Local { names, values, line } => self.stat_local(names, values, *line),
            Stat::Assign {
                targets,
                values,
                line,
            } => self.stat_assign(targets, values, *line),
            Stat::Call { call, line } => self.stat_call(call, *line),
            Stat::Do { body, line } => {
                self.compile_block(body, *line)?;
                Ok(())
            }
            Stat::If {
                arms,
                else_body,
                line,
            } => self.stat_if(arms, else_body.as_ref(), *line),
            Stat::While { cond, body, line } => self.stat_while(cond, body, *line),
            Stat::Repeat { body, cond, line } => self.stat_repeat(body, cond, *line),
            Stat::NumericFor {
                var,
                start,
                limit,
                step,
                body,
                line,
            } => self.stat_numeric_for(*var, start, limit, step.as_ref(), body, *line),
            Stat::GenericFor {
                names,
                exprs,
                body,
                line,
            } => self.stat_generic_for(names, exprs, body, *line),
            Stat::Function { name, body, line } => self.stat_function(name, body, *line),
            Stat::LocalFunction { name, body, line } => {
                // The local is visible inside the body, so recursion works.
                let reg = self.declare_local(*name, *line)?;
                self.closure_into(body, false, reg, *line)?;
                self.free_to(reg + 1);
                Ok(())
            }
            Stat::Return { exprs, line } => self.stat_return(exprs, *line),
            Stat::Break { line } => self.stat_break(*line),
        }
    }

    /// Locals bind after the initializer list, so `local x = x` reads the
    /// outer `x`.
    fn stat_local(
        &mut self,
        names: &[StringId],
        values: &[Expr],
        line: u32,
    ) -> Result<(), CodeGenError> {
        let base = self.fs().scope.free_reg;
        let n = names.len() as u8;

        if values.is_empty() {
            if (base as usize + n as usize) > MAX_STACK {
                return Err(self.error(line, "function or expression too complex"));
            }
            self.emit_abc(OpCode::LoadNil, base, (base + n - 1) as u32, 0, line);
        } else {
            self.explist_adjust(values, base, n, line)?;
        }

        self.free_to(base);
        for &name in names {
            self.declare_local(name, line)?;
        }
        Ok(())
    }

    /// Multi-assignment: pin every target's object/key first, evaluate the
    /// whole RHS into temporaries, then store right-to-left so stores
    /// cannot disturb a target evaluated earlier.
    fn stat_assign(
        &mut self,
        targets: &[Expr],
        values: &[Expr],
        line: u32,
    ) -> Result<(), CodeGenError> {
        let save = self.fs().scope.free_reg;

        let mut descs = Vec::with_capacity(targets.len());
        for t in targets {
            let desc = match t {
                Expr::Name { name, line } => self.resolve_name(*name, *line)?,
                Expr::Field { .. } | Expr::Index { .. } => self.expr(t)?,
                _ => return Err(self.error(t.line(), "cannot assign to this expression")),
            };
            descs.push(desc);
        }

        let base = self.fs().scope.free_reg;
        let want = targets.len() as u8;
        self.explist_adjust(values, base, want, line)?;

        for (i, desc) in descs.iter().enumerate().rev() {
            self.store(desc, base + i as u8, line)?;
        }
        self.free_to(save);
        Ok(())
    }

    /// Store the value in `val_reg` into an assignable descriptor.
    fn store(&mut self, target: &ExprDesc, val_reg: u8, line: u32) -> Result<(), CodeGenError> {
        match target {
            ExprDesc::Register(r) => {
                if *r != val_reg {
                    self.emit_abc(OpCode::Move, *r, val_reg as u32, 0, line);
                }
            }
            ExprDesc::Upvalue(idx) => {
                self.emit_abc(OpCode::SetUpval, val_reg, *idx as u32, 0, line);
            }
            ExprDesc::Global(k) => {
                self.emit_abx(OpCode::SetGlobal, val_reg, *k, line);
            }
            ExprDesc::Indexed { table, key } => {
                self.emit_abc(OpCode::SetTable, *table, *key, val_reg as u32, line);
            }
            _ => return Err(self.error(line, "cannot assign to this expression")),
        }
        Ok(())
    }

    /// A call in statement position discards all results.
    fn stat_call(&mut self, call: &Expr, line: u32) -> Result<(), CodeGenError> {
        let desc = self.expr(call)?;
        match desc {
            ExprDesc::Call(pc) => {
                self.fs_mut().proto.get_mut(pc).set_c(1);
                Ok(())
            }
            _ => Err(self.error(line, "syntax error: expression is not a statement")),
        }
    }

    fn stat_if(
        &mut self,
        arms: &[(Expr, Block)],
        else_body: Option<&Block>,
        line: u32,
    ) -> Result<(), CodeGenError> {
        let mut escapes = Vec::new();

        let (first_cond, first_body) = &arms[0];
        let mut false_jumps = self.cond_false(first_cond)?;
        self.compile_block(first_body, line)?;

        for (cond, body) in &arms[1..] {
            escapes.push(self.emit_jump(cond.line()));
            self.patch_list(&false_jumps)?;
            false_jumps = self.cond_false(cond)?;
            self.compile_block(body, cond.line())?;
        }

        if let Some(body) = else_body {
            escapes.push(self.emit_jump(line));
            self.patch_list(&false_jumps)?;
            self.compile_block(body, line)?;
        } else {
            self.patch_list(&false_jumps)?;
        }

        self.patch_list(&escapes)
    }

    fn stat_while(&mut self, cond: &Expr, body: &Block, line: u32) -> Result<(), CodeGenError> {
        let start = self.current_pc();
        let false_jumps = self.cond_false(cond)?;

        self.fs_mut().scope.enter_block(true);
        self.compile_block(body, line)?;
        let back = self.emit_jump(line);
        self.patch_jump_to(back, start)?;
        let (loop_block, _) = self.fs_mut().scope.leave_block();

        self.patch_list(&false_jumps)?;
        self.patch_list(&loop_block.break_jumps)
    }

    /// `repeat` keeps body locals in scope for the `until` condition; the
    /// scope closes after it, and captured locals are closed on both the
    /// loop-back and the exit path.
    fn stat_repeat(&mut self, body: &Block, cond: &Expr, line: u32) -> Result<(), CodeGenError> {
        let start = self.current_pc();
        self.fs_mut().scope.enter_block(true);
        self.fs_mut().scope.enter_block(false);

        self.statements(body)?;
        let false_jumps = self.cond_false(cond)?;

        let close_reg = self.min_captured_in_block();
        if let Some(reg) = close_reg {
            // Exit path (condition true falls through)
            self.emit_abc(OpCode::Close, reg, 0, 0, line);
            let exit = self.emit_jump(line);
            // Loop path
            self.patch_list(&false_jumps)?;
            self.emit_abc(OpCode::Close, reg, 0, 0, line);
            let back = self.emit_jump(line);
            self.patch_jump_to(back, start)?;
            self.patch_jump(exit)?;
            self.leave_scope(line, false)?;
        } else {
            self.leave_scope(line, false)?;
            for &pc in &false_jumps {
                self.patch_jump_to(pc, start)?;
            }
        }

        let (loop_block, _) = self.fs_mut().scope.leave_block();
        self.patch_list(&loop_block.break_jumps)
    }

    fn stat_numeric_for(
        &mut self,
        var: StringId,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
        line: u32,
    ) -> Result<(), CodeGenError> {
        self.fs_mut().scope.enter_block(true);
        let base = self.fs().scope.free_reg;

        // Internal control registers: index, limit, step
        self.reserve_regs(3, line)?;
        self.expr_to_reg(start, base)?;
        self.free_to(base + 3);
        self.expr_to_reg(limit, base + 1)?;
        self.free_to(base + 3);
        match step {
            Some(e) => self.expr_to_reg(e, base + 2)?,
            None => self.discharge_to_reg(&ExprDesc::Number(1.0), base + 2, line)?,
        }
        self.free_to(base);

        let idx_name = self.strings.intern(b"(for index)");
        let limit_name = self.strings.intern(b"(for limit)");
        let step_name = self.strings.intern(b"(for step)");
        self.declare_local(idx_name, line)?;
        self.declare_local(limit_name, line)?;
        self.declare_local(step_name, line)?;

        let prep = self.emit(Instruction::asbx(OpCode::ForPrep, base, 0), line);

        self.fs_mut().scope.enter_block(false);
        self.declare_local(var, line)?;
        self.statements(body)?;
        self.leave_scope(line, true)?;

        let loop_pc = self.emit(Instruction::asbx(OpCode::ForLoop, base, 0), line);

        // FORPREP jumps forward to FORLOOP; FORLOOP jumps back to the body.
        let prep_offset = loop_pc as i64 - prep as i64 - 1;
        let back_offset = prep as i64 - loop_pc as i64;
        if prep_offset > MAX_SBX as i64 || back_offset < MIN_SBX as i64 {
            return Err(self.error(line, "control structure too long"));
        }
        self.fs_mut().proto.code[prep] = Instruction::asbx(OpCode::ForPrep, base, prep_offset as i32);
        self.fs_mut().proto.code[loop_pc] =
            Instruction::asbx(OpCode::ForLoop, base, back_offset as i32);

        // Loop block: control variables go out of scope, breaks land here.
        let loop_block = self.leave_scope(line, false)?;
        self.patch_list(&loop_block.break_jumps)
    }

    fn stat_generic_for(
        &mut self,
        names: &[StringId],
        exprs: &[Expr],
        body: &Block,
        line: u32,
    ) -> Result<(), CodeGenError> {
        self.fs_mut().scope.enter_block(true);
        let base = self.fs().scope.free_reg;

        // Iterator function, state, control
        self.explist_adjust(exprs, base, 3, line)?;
        self.free_to(base);

        let gen_name = self.strings.intern(b"(for generator)");
        let state_name = self.strings.intern(b"(for state)");
        let control_name = self.strings.intern(b"(for control)");
        self.declare_local(gen_name, line)?;
        self.declare_local(state_name, line)?;
        self.declare_local(control_name, line)?;

        let prep = self.emit_jump(line);

        self.fs_mut().scope.enter_block(false);
        for &name in names {
            self.declare_local(name, line)?;
        }
        self.statements(body)?;
        self.leave_scope(line, true)?;

        self.patch_jump(prep)?;
        let nvars = names.len() as u32;
        self.emit_abc(OpCode::TForLoop, base, 0, nvars, line);
        let back = self.emit_jump(line);
        self.patch_jump_to(back, prep + 1)?;

        let loop_block = self.leave_scope(line, false)?;
        self.patch_list(&loop_block.break_jumps)
    }

    fn stat_function(
        &mut self,
        name: &crate::ast::FuncName,
        body: &FuncBody,
        line: u32,
    ) -> Result<(), CodeGenError> {
        let save = self.fs().scope.free_reg;
        let is_method = name.method.is_some();

        // Key path: a.b.c:m — all but the last name are reads.
        let mut keys: Vec<StringId> = name.fields.clone();
        if let Some(m) = name.method {
            keys.push(m);
        }

        let target = if keys.is_empty() {
            self.resolve_name(name.base, line)?
        } else {
            let mut cur = self.resolve_name(name.base, line)?;
            for &k in &keys[..keys.len() - 1] {
                let table = self.discharge_to_any_reg(&cur, line)?;
                let key = self.str_rk(k, line)?;
                let desc = ExprDesc::Indexed { table, key };
                cur = desc;
            }
            let table = self.discharge_to_any_reg(&cur, line)?;
            let key = self.str_rk(keys[keys.len() - 1], line)?;
            ExprDesc::Indexed { table, key }
        };

        let reg = self.reserve_regs(1, line)?;
        self.closure_into(body, is_method, reg, line)?;
        self.store(&target, reg, line)?;
        self.free_to(save);
        Ok(())
    }

    fn stat_return(&mut self, exprs: &[Expr], line: u32) -> Result<(), CodeGenError> {
        if exprs.is_empty() {
            self.emit_abc(OpCode::Return, 0, 1, 0, line);
            return Ok(());
        }

        let base = self.fs().scope.free_reg;

        // `return f(...)` becomes a tail call.
        if exprs.len() == 1 {
            if let Expr::Call { .. } = &exprs[0] {
                let desc = self.expr(&exprs[0])?;
                if let ExprDesc::Call(pc) = desc {
                    let inst = self.fs().proto.code[pc];
                    self.fs_mut().proto.code[pc] =
                        Instruction::abc(OpCode::TailCall, inst.a(), inst.b(), 0);
                    self.emit_abc(OpCode::Return, inst.a(), 0, 0, line);
                }
                return Ok(());
            }
        }

        let (n, open) = self.explist_open(exprs)?;
        let b = if open { 0 } else { n as u32 + 1 };
        self.emit_abc(OpCode::Return, base, b, 0, line);
        Ok(())
    }

    /// `break` jumps to the end of the innermost loop, closing any
    /// captured locals that go out of scope on the way.
    fn stat_break(&mut self, line: u32) -> Result<(), CodeGenError> {
        if self.fs_mut().scope.find_loop_block().is_none() {
            return Err(self.error(line, "no loop to break"));
        }
        if let Some(level) = self.fs().scope.upval_below_loop() {
            self.emit_abc(OpCode::Close, level, 0, 0, line);
        }
        let jump = self.emit_jump(line);
        self.fs_mut()
            .scope
            .find_loop_block()
            .unwrap()
            .break_jumps
            .push(jump);
        Ok(())
    }
}

/// Fold arithmetic on number literals, following the reference compiler:
/// division and modulo by zero stay runtime operations, and NaN results
/// are not folded.
fn fold_arith(op: BinOp, a: f64, b: f64) -> Option<f64> {
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return None;
            }
            a / b
        }
        BinOp::Mod => {
            if b == 0.0 {
                return None;
            }
            a - (a / b).floor() * b
        }
        BinOp::Pow => a.powf(b),
        _ => return None,
    };
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

/// Encode a size hint in the VM's "floating point byte" format:
/// (eeeeexxx) meaning (1xxx) << (eeeee - 1) when eeeee > 0.
fn int2fb(mut x: u32) -> u32 {
    let mut e = 0;
    while x >= 16 {
        x = (x + 1) >> 1;
        e += 1;
    }
    if x < 8 {
        x
    } else {
        ((e + 1) << 3) | (x - 8)
    }
}
