/// Scope and register management for one function under compilation.
use lunac_core::string::StringId;

/// A local variable in the current function.
#[derive(Clone, Debug)]
pub struct LocalVarInfo {
    pub name: StringId,
    /// Register index.
    pub reg: u8,
    /// PC where the variable becomes active.
    pub start_pc: u32,
    /// Index of this variable's entry in the prototype's debug list.
    pub debug_idx: usize,
    /// Set when a nested closure captures this local; scope exit and
    /// `break` consult it to decide whether CLOSE is needed.
    pub captured: bool,
}

/// Block scope tracking.
#[derive(Clone, Debug)]
pub struct BlockScope {
    /// Number of local variables when this block started.
    pub num_locals_on_entry: usize,
    /// Register level on entry; restored when the block exits.
    pub reg_level_on_entry: u8,
    /// Whether this block is a loop (target for break).
    pub is_loop: bool,
    /// Break JMP PCs to backpatch at loop end.
    pub break_jumps: Vec<usize>,
    /// Set when a local declared in this block is captured by a closure.
    pub has_upval: bool,
}

/// Manages scopes, local variables, and the register file for a single
/// function. Registers are allocated contiguously and freed in LIFO order;
/// `max_reg` is the high-water mark that becomes `max_stack_size`.
pub struct ScopeManager {
    /// Active local variables, innermost last.
    pub locals: Vec<LocalVarInfo>,
    /// Block scope stack.
    pub blocks: Vec<BlockScope>,
    /// Next free register.
    pub free_reg: u8,
    /// High-water mark of register usage.
    pub max_reg: u8,
}

impl ScopeManager {
    pub fn new() -> Self {
        ScopeManager {
            locals: Vec::new(),
            blocks: Vec::new(),
            free_reg: 0,
            max_reg: 0,
        }
    }

    /// Enter a new block scope.
    pub fn enter_block(&mut self, is_loop: bool) {
        self.blocks.push(BlockScope {
            num_locals_on_entry: self.locals.len(),
            reg_level_on_entry: self.free_reg,
            is_loop,
            break_jumps: Vec::new(),
            has_upval: false,
        });
    }

    /// Leave the current block scope. Returns the block record and the
    /// locals that went out of scope, in declaration order.
    pub fn leave_block(&mut self) -> (BlockScope, Vec<LocalVarInfo>) {
        let block = self.blocks.pop().expect("mismatched block");
        let dead = self.locals.split_off(block.num_locals_on_entry);
        self.free_reg = block.reg_level_on_entry;
        (block, dead)
    }

    /// Register a new local variable at the next free register.
    pub fn add_local(&mut self, name: StringId, start_pc: u32, debug_idx: usize) -> u8 {
        let reg = self.alloc_reg();
        self.locals.push(LocalVarInfo {
            name,
            reg,
            start_pc,
            debug_idx,
            captured: false,
        });
        reg
    }

    /// Allocate one register.
    pub fn alloc_reg(&mut self) -> u8 {
        let reg = self.free_reg;
        self.free_reg += 1;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        reg
    }

    /// Allocate n consecutive registers, returning the first.
    pub fn alloc_regs(&mut self, n: u8) -> u8 {
        let first = self.free_reg;
        self.free_reg += n;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        first
    }

    /// Free registers down to the given level.
    pub fn free_to(&mut self, level: u8) {
        debug_assert!(level <= self.free_reg);
        self.free_reg = level;
    }

    /// Ensure `free_reg` is at least `level` (registers below are in use).
    pub fn bump_to(&mut self, level: u8) {
        if self.free_reg < level {
            self.free_reg = level;
            if level > self.max_reg {
                self.max_reg = level;
            }
        }
    }

    /// Look up a visible local by name, innermost binding first.
    pub fn resolve_local(&self, name: StringId) -> Option<&LocalVarInfo> {
        self.locals.iter().rev().find(|v| v.name == name)
    }

    /// Mark the innermost local with the given name as captured, flagging
    /// the block that declared it.
    pub fn mark_captured(&mut self, name: StringId) {
        if let Some(idx) = self.locals.iter().rposition(|v| v.name == name) {
            self.locals[idx].captured = true;
            for block in self.blocks.iter_mut().rev() {
                if block.num_locals_on_entry <= idx {
                    block.has_upval = true;
                    break;
                }
            }
        }
    }

    /// Number of active locals.
    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }

    /// Register level of the named locals (first register free for temps).
    pub fn locals_top(&self) -> u8 {
        self.locals.last().map(|v| v.reg + 1).unwrap_or(0)
    }

    /// Find the nearest enclosing loop block.
    pub fn find_loop_block(&mut self) -> Option<&mut BlockScope> {
        self.blocks.iter_mut().rev().find(|b| b.is_loop)
    }

    /// True if any block between the innermost and the nearest loop
    /// (inclusive) has captured locals; used by `break`.
    pub fn upval_below_loop(&self) -> Option<u8> {
        let mut close_level = None;
        for block in self.blocks.iter().rev() {
            if block.has_upval {
                close_level = Some(block.reg_level_on_entry);
            }
            if block.is_loop {
                break;
            }
        }
        close_level
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}
