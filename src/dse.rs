//! Dead-store elimination.
//!
//! A backward liveness analysis over the variables of one function,
//! followed by a sweep that deletes instructions whose only effect is
//! writing a variable nobody reads afterwards.
//!
//! Each tracked fact is one variable name. A variable is live at a point
//! when some path from that point reads it before overwriting it. Static
//! variables are observable after the function returns, so they are live at
//! EXIT; loads and calls may read anything address-taken or static, so they
//! generate all of those.

use crate::dataflow::{self, Analysis, DataFlow};
use crate::flowgraph::ControlFlowGraph;
use crate::ir::symbols::FrontEndSymbols;
use crate::ir::tac::{Instruction, Value};
use crate::strings::Identifier;
use log::{debug, trace};
use rustc_hash::{FxHashMap, FxHashSet};

struct DseAnalysis<'a> {
    frontend: &'a FrontEndSymbols,
    alias_set: FxHashSet<Identifier>,
    name_bits: FxHashMap<Identifier, usize>,
}

impl DseAnalysis<'_> {
    fn is_aliased(&self, name: Identifier) -> bool {
        self.alias_set.contains(&name) || self.frontend.is_static(name)
    }

    fn bit(&self, name: Identifier) -> usize {
        self.name_bits[&name]
    }

    fn kill(&self, dfa: &mut DataFlow, row_key: usize, value: &Value) {
        if let Some(name) = value.var() {
            let bit = self.bit(name);
            dfa.set_instr_bit(row_key, bit, false);
        }
    }

    fn gen_name(&self, dfa: &mut DataFlow, row_key: usize, name: Identifier) {
        let bit = self.bit(name);
        dfa.set_instr_bit(row_key, bit, true);
    }

    fn gen(&self, dfa: &mut DataFlow, row_key: usize, value: &Value) {
        if let Some(name) = value.var() {
            self.gen_name(dfa, row_key, name);
        }
    }

    /// Everything a memory read or a call might observe.
    fn gen_aliased(&self, dfa: &mut DataFlow, row_key: usize) {
        for (&name, &bit) in &self.name_bits {
            if self.is_aliased(name) {
                dfa.set_instr_bit(row_key, bit, true);
            }
        }
    }
}

impl Analysis for DseAnalysis<'_> {
    fn is_transfer(&self, instr: &Instruction) -> bool {
        !matches!(instr, Instruction::Jump(_) | Instruction::Label(_))
    }

    fn transfer(
        &mut self,
        dfa: &mut DataFlow,
        instrs: &[Option<Instruction>],
        instr_index: usize,
        row_key: usize,
    ) -> bool {
        use Instruction::*;
        let instr = instrs[instr_index].as_ref().expect("transfer of a removed instruction");
        match instr {
            Return(value) => {
                if let Some(value) = value {
                    self.gen(dfa, row_key, value);
                }
            }
            SignExtend { src, dst }
            | Truncate { src, dst }
            | ZeroExtend { src, dst }
            | DoubleToInt { src, dst }
            | DoubleToUInt { src, dst }
            | IntToDouble { src, dst }
            | UIntToDouble { src, dst }
            | Unary { src, dst, .. }
            | Copy { src, dst } => {
                self.kill(dfa, row_key, dst);
                self.gen(dfa, row_key, src);
            }
            Binary { src1, src2, dst, .. } => {
                self.kill(dfa, row_key, dst);
                self.gen(dfa, row_key, src1);
                self.gen(dfa, row_key, src2);
            }
            FunCall { args, dst, .. } => {
                if let Some(dst) = dst {
                    self.kill(dfa, row_key, dst);
                }
                for arg in args {
                    self.gen(dfa, row_key, arg);
                }
                self.gen_aliased(dfa, row_key);
            }
            GetAddress { dst, .. } => {
                self.kill(dfa, row_key, dst);
            }
            Load { src_ptr, dst } => {
                self.kill(dfa, row_key, dst);
                self.gen(dfa, row_key, src_ptr);
                self.gen_aliased(dfa, row_key);
            }
            Store { src, dst_ptr } => {
                self.gen(dfa, row_key, src);
                self.gen(dfa, row_key, dst_ptr);
            }
            AddPtr { src_ptr, idx, dst, .. } => {
                self.kill(dfa, row_key, dst);
                self.gen(dfa, row_key, src_ptr);
                self.gen(dfa, row_key, idx);
            }
            CopyToOffset { src, .. } => {
                // A partial write cannot kill the whole aggregate.
                self.gen(dfa, row_key, src);
            }
            CopyFromOffset { src_name, dst, .. } => {
                self.kill(dfa, row_key, dst);
                self.gen_name(dfa, row_key, *src_name);
            }
            JumpIfZero { condition, .. } | JumpIfNotZero { condition, .. } => {
                self.gen(dfa, row_key, condition);
            }
            Jump(_) | Label(_) => unreachable!("jumps and labels carry no row"),
        }
        true
    }

    fn meet_exit(&mut self, dfa: &mut DataFlow, row_key: usize) {
        // Static variables outlive the function.
        for fact in 0..dfa.set_size {
            let live = dfa.data_index[fact] != 0;
            dfa.set_instr_bit(row_key, fact, live);
        }
    }
}

/// Values an instruction mentions, for fact registration.
fn register_values(
    instr: &Instruction,
    mut register: impl FnMut(Identifier),
) -> bool {
    use Instruction::*;
    let mut reg_value = |value: &Value| {
        if let Some(name) = value.var() {
            register(name);
        }
    };
    match instr {
        Return(value) => {
            if let Some(value) = value {
                reg_value(value);
            }
        }
        SignExtend { src, dst }
        | Truncate { src, dst }
        | ZeroExtend { src, dst }
        | DoubleToInt { src, dst }
        | DoubleToUInt { src, dst }
        | IntToDouble { src, dst }
        | UIntToDouble { src, dst }
        | Unary { src, dst, .. }
        | Copy { src, dst }
        | GetAddress { src, dst }
        | Load { src_ptr: src, dst }
        | Store { src, dst_ptr: dst } => {
            reg_value(src);
            reg_value(dst);
        }
        Binary { src1, src2, dst, .. } => {
            reg_value(src1);
            reg_value(src2);
            reg_value(dst);
        }
        FunCall { args, dst, .. } => {
            for arg in args {
                reg_value(arg);
            }
            if let Some(dst) = dst {
                reg_value(dst);
            }
        }
        AddPtr { src_ptr, idx, dst, .. } => {
            reg_value(src_ptr);
            reg_value(idx);
            reg_value(dst);
        }
        CopyToOffset { src, dst_name, .. } => {
            register(*dst_name);
            if let Some(name) = src.var() {
                register(name);
            }
        }
        CopyFromOffset { src_name, dst, .. } => {
            register(*src_name);
            if let Some(name) = dst.var() {
                register(name);
            }
        }
        JumpIfZero { condition, .. } | JumpIfNotZero { condition, .. } => {
            reg_value(condition);
        }
        Jump(_) | Label(_) => return false,
    }
    true
}

fn collect_alias_set(
    frontend: &FrontEndSymbols,
    instrs: &[Option<Instruction>],
) -> FxHashSet<Identifier> {
    let mut alias_set = frontend.addressed_set.clone();
    for instr in instrs.iter().flatten() {
        if let Instruction::GetAddress { src: Value::Var(name), .. } = instr {
            alias_set.insert(*name);
        }
    }
    alias_set
}

/// Run dead-store elimination over one function. Returns whether any
/// instruction was removed.
pub fn eliminate_dead_stores(
    instrs: &mut Vec<Option<Instruction>>,
    cfg: &mut ControlFlowGraph,
    dfa: &mut DataFlow,
    frontend: &FrontEndSymbols,
) -> bool {
    dfa.reset(cfg, instrs.len());

    // Number every mentioned variable and give a row to every instruction
    // that reads or writes one.
    let mut name_bits: FxHashMap<Identifier, usize> = FxHashMap::default();
    let mut instr_row_count = 0;
    let mut block_row_count = 0;
    for block_id in 0..cfg.blocks.len() {
        if !cfg.is_block_live(block_id) {
            continue;
        }
        let (front, back) = (cfg.blocks[block_id].front_index, cfg.blocks[block_id].back_index);
        for index in front..=back {
            let instr = match &instrs[index] {
                Some(instr) => instr,
                None => continue,
            };
            let registered = register_values(instr, |name| {
                let next_bit = name_bits.len();
                name_bits.entry(name).or_insert(next_bit);
            });
            if registered {
                dfa.instr_index[index] = instr_row_count;
                instr_row_count += 1;
            }
        }
        dfa.block_index[block_id] = block_row_count;
        block_row_count += 1;
    }
    dfa.set_size = name_bits.len();
    if dfa.set_size == 0 {
        return false;
    }
    trace!("dead-store elimination: {} tracked variables", dfa.set_size);

    dfa.data_index.resize(dfa.set_size, 0);
    for (&name, &bit) in &name_bits {
        dfa.data_index[bit] = usize::from(frontend.is_static(name));
    }

    dfa.instr_index[dfa.incoming_index] = instr_row_count;
    instr_row_count += 1;
    dfa.alloc_rows(block_row_count, instr_row_count);
    dataflow::order_backward(dfa, cfg);

    let mut analysis = DseAnalysis {
        frontend,
        alias_set: collect_alias_set(frontend, instrs),
        name_bits,
    };
    dataflow::solve_backward(&mut analysis, dfa, cfg, instrs);

    // Sweep: a pure write to a variable dead in its live-out row goes away.
    let mut changed = false;
    for block_id in 0..cfg.blocks.len() {
        if !cfg.is_block_live(block_id) || !dfa.reachable[block_id] {
            continue;
        }
        let (front, back) = (cfg.blocks[block_id].front_index, cfg.blocks[block_id].back_index);
        for index in front..=back {
            let instr = match &instrs[index] {
                Some(instr) => instr,
                None => continue,
            };
            use Instruction::*;
            let dead = match instr {
                SignExtend { dst, .. }
                | Truncate { dst, .. }
                | ZeroExtend { dst, .. }
                | DoubleToInt { dst, .. }
                | DoubleToUInt { dst, .. }
                | IntToDouble { dst, .. }
                | UIntToDouble { dst, .. }
                | Unary { dst, .. }
                | Binary { dst, .. }
                | Copy { dst, .. }
                | GetAddress { dst, .. }
                | Load { dst, .. }
                | AddPtr { dst, .. }
                | CopyFromOffset { dst, .. } => {
                    let name = dst.var().expect("destination must be a variable");
                    !dfa.instr_bit(index, analysis.bit(name))
                }
                CopyToOffset { dst_name, .. } => {
                    !analysis.is_aliased(*dst_name)
                        && !dfa.instr_bit(index, analysis.bit(*dst_name))
                }
                // Calls, stores, returns, and branches are observable.
                _ => false,
            };
            if dead {
                trace!("removing dead store at {index}");
                cfg.remove_instruction(instrs, index, block_id);
                changed = true;
            }
        }
    }

    if changed {
        debug!("dead-store elimination removed instructions");
    }
    changed
}
