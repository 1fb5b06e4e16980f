//! Copy propagation.
//!
//! A forward reaching-copies analysis over the `Copy` instructions of one
//! function, followed by a rewrite that replaces a use of `x` with `y` (or
//! with a constant) wherever the copy `x = y` is the only way `x` got its
//! value on every path in.
//!
//! Each tracked fact is one `Copy` instruction, identified by its index in
//! the instruction vector. A fact reaches a point when the copy executed on
//! every path to that point with neither side redefined since. Writes kill
//! facts mentioning the written variable; calls and stores additionally kill
//! facts mentioning any variable that is aliased (address-taken or static),
//! since memory traffic can redefine those behind the analysis's back.

use crate::dataflow::{self, Analysis, DataFlow, StateRow};
use crate::flowgraph::ControlFlowGraph;
use crate::ir::symbols::FrontEndSymbols;
use crate::ir::tac::{Constant, Instruction, Value};
use crate::ir::types::Type;
use crate::strings::Identifier;
use log::{debug, trace};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Whether `value` is the variable `name`.
fn mentions(value: &Value, name: Identifier) -> bool {
    matches!(value, Value::Var(var) if *var == name)
}

/// Variables a call or store may redefine: address-taken or static.
fn is_aliased(
    frontend: &FrontEndSymbols,
    alias_set: &FxHashSet<Identifier>,
    name: Identifier,
) -> bool {
    alias_set.contains(&name) || frontend.is_static(name)
}

fn value_mentions_aliased(
    frontend: &FrontEndSymbols,
    alias_set: &FxHashSet<Identifier>,
    value: &Value,
) -> bool {
    match value {
        Value::Var(name) => is_aliased(frontend, alias_set, *name),
        Value::Constant(_) => false,
    }
}

/// The front-end type a value carries.
fn value_type(frontend: &FrontEndSymbols, value: &Value) -> Type {
    match value {
        Value::Var(name) => frontend.symbol(*name).ty.clone(),
        Value::Constant(constant) => match constant {
            Constant::Char(_) => Type::Char,
            Constant::Int(_) => Type::Int,
            Constant::Long(_) => Type::Long,
            Constant::Double(_) => Type::Double,
            Constant::UChar(_) => Type::UChar,
            Constant::UInt(_) => Type::UInt,
            Constant::ULong(_) => Type::ULong,
        },
    }
}

fn is_signed_scalar(ty: &Type) -> bool {
    matches!(
        ty,
        Type::Char | Type::SChar | Type::Int | Type::Long | Type::Double
    )
}

/// Whether substituting `src` for a use of `dst` preserves meaning:
/// identical types, or scalars of the same width and signedness.
fn is_copy_compatible(frontend: &FrontEndSymbols, src: &Value, dst: &Value) -> bool {
    let src_ty = value_type(frontend, src);
    let dst_ty = value_type(frontend, dst);
    if src_ty == dst_ty {
        return true;
    }
    src_ty.is_scalar()
        && dst_ty.is_scalar()
        && src_ty.scalar_size() == dst_ty.scalar_size()
        && is_signed_scalar(&src_ty) == is_signed_scalar(&dst_ty)
        && matches!(src_ty, Type::Double) == matches!(dst_ty, Type::Double)
}

/// The value operands an instruction reads, in a fixed order shared by the
/// inspection and rewrite passes.
fn use_slots(instr: &Instruction) -> SmallVec<[&Value; 3]> {
    use Instruction::*;
    match instr {
        SignExtend { src, .. }
        | Truncate { src, .. }
        | ZeroExtend { src, .. }
        | DoubleToInt { src, .. }
        | DoubleToUInt { src, .. }
        | IntToDouble { src, .. }
        | UIntToDouble { src, .. }
        | Unary { src, .. }
        | Copy { src, .. }
        | CopyToOffset { src, .. } => SmallVec::from_slice(&[src]),
        Binary { src1, src2, .. } => SmallVec::from_slice(&[src1, src2]),
        Load { src_ptr, .. } => SmallVec::from_slice(&[src_ptr]),
        Store { src, dst_ptr } => SmallVec::from_slice(&[src, dst_ptr]),
        AddPtr { src_ptr, idx, .. } => SmallVec::from_slice(&[src_ptr, idx]),
        FunCall { args, .. } => args.iter().collect(),
        Return(Some(value)) => SmallVec::from_slice(&[value]),
        JumpIfZero { condition, .. } | JumpIfNotZero { condition, .. } => {
            SmallVec::from_slice(&[condition])
        }
        // Taking an address is not a read, and CopyFromOffset reads through
        // a name rather than a value.
        GetAddress { .. } | CopyFromOffset { .. } | Return(None) | Jump(_) | Label(_) => {
            SmallVec::new()
        }
    }
}

fn use_slots_mut(instr: &mut Instruction) -> SmallVec<[&mut Value; 3]> {
    use Instruction::*;
    match instr {
        SignExtend { src, .. }
        | Truncate { src, .. }
        | ZeroExtend { src, .. }
        | DoubleToInt { src, .. }
        | DoubleToUInt { src, .. }
        | IntToDouble { src, .. }
        | UIntToDouble { src, .. }
        | Unary { src, .. }
        | Copy { src, .. }
        | CopyToOffset { src, .. } => SmallVec::from_iter([src]),
        Binary { src1, src2, .. } => SmallVec::from_iter([src1, src2]),
        Load { src_ptr, .. } => SmallVec::from_iter([src_ptr]),
        Store { src, dst_ptr } => SmallVec::from_iter([src, dst_ptr]),
        AddPtr { src_ptr, idx, .. } => SmallVec::from_iter([src_ptr, idx]),
        FunCall { args, .. } => args.iter_mut().collect(),
        Return(Some(value)) => SmallVec::from_iter([value]),
        JumpIfZero { condition, .. } | JumpIfNotZero { condition, .. } => {
            SmallVec::from_iter([condition])
        }
        GetAddress { .. } | CopyFromOffset { .. } | Return(None) | Jump(_) | Label(_) => {
            SmallVec::new()
        }
    }
}

/// The variable an instruction writes whole, if any.
fn written_var(instr: &Instruction) -> Option<Identifier> {
    use Instruction::*;
    match instr {
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
        | CopyFromOffset { dst, .. } => dst.var(),
        FunCall { dst, .. } => dst.as_ref().and_then(Value::var),
        _ => None,
    }
}

fn is_transfer_kind(instr: &Instruction) -> bool {
    use Instruction::*;
    matches!(
        instr,
        SignExtend { .. }
            | Truncate { .. }
            | ZeroExtend { .. }
            | DoubleToInt { .. }
            | DoubleToUInt { .. }
            | IntToDouble { .. }
            | UIntToDouble { .. }
            | FunCall { .. }
            | Unary { .. }
            | Binary { .. }
            | Copy { .. }
            | GetAddress { .. }
            | Load { .. }
            | Store { .. }
            | AddPtr { .. }
            | CopyToOffset { .. }
            | CopyFromOffset { .. }
    )
}

/// Read the (src, dst) pair of the tracked copy `fact`, preferring the
/// backed-up original when the rewrite already touched that instruction.
fn fact_pair(
    instrs: &[Option<Instruction>],
    data_index: &[usize],
    backups: &FxHashMap<usize, (Value, Value)>,
    fact: usize,
) -> (Value, Value) {
    let index = data_index[fact];
    if let Some((src, dst)) = backups.get(&index) {
        return (src.clone(), dst.clone());
    }
    match &instrs[index] {
        Some(Instruction::Copy { src, dst }) => (src.clone(), dst.clone()),
        other => panic!("tracked fact {fact} is not a copy: {other:?}"),
    }
}

struct CopyAnalysis<'a> {
    frontend: &'a FrontEndSymbols,
    alias_set: FxHashSet<Identifier>,
}

impl CopyAnalysis<'_> {
    /// Clear every reaching fact for which `kill` holds.
    fn kill_facts(
        &self,
        dfa: &mut DataFlow,
        instrs: &[Option<Instruction>],
        row_key: usize,
        kill: impl Fn(&Value, &Value) -> bool,
    ) {
        for fact in 0..dfa.set_size {
            if !dfa.instr_bit(row_key, fact) {
                continue;
            }
            let index = dfa.data_index[fact];
            let dead = match &instrs[index] {
                Some(Instruction::Copy { src, dst }) => kill(src, dst),
                other => panic!("tracked fact {fact} is not a copy: {other:?}"),
            };
            if dead {
                dfa.set_instr_bit(row_key, fact, false);
            }
        }
    }
}

impl Analysis for CopyAnalysis<'_> {
    fn is_transfer(&self, instr: &Instruction) -> bool {
        is_transfer_kind(instr)
    }

    fn transfer(
        &mut self,
        dfa: &mut DataFlow,
        instrs: &[Option<Instruction>],
        instr_index: usize,
        row_key: usize,
    ) -> bool {
        let instr = instrs[instr_index].as_ref().expect("transfer of a removed instruction");
        match instr {
            Instruction::Copy { src, dst } => {
                // If the mirrored copy already reaches, the two sides are
                // equal and this instruction changes nothing.
                for fact in 0..dfa.set_size {
                    if dfa.instr_bit(row_key, fact) {
                        let index = dfa.data_index[fact];
                        if let Some(Instruction::Copy { src: fact_src, dst: fact_dst }) =
                            &instrs[index]
                        {
                            if fact_src == dst && fact_dst == src {
                                return false;
                            }
                        }
                    }
                }
                let dst_name = dst.var().expect("copy destination must be a variable");
                self.kill_facts(dfa, instrs, row_key, |fact_src, fact_dst| {
                    mentions(fact_src, dst_name) || mentions(fact_dst, dst_name)
                });
                let own = dfa
                    .data_index
                    .iter()
                    .position(|&index| index == instr_index)
                    .expect("copy instruction is not tracked");
                dfa.set_instr_bit(row_key, own, true);
            }
            Instruction::FunCall { dst, .. } => {
                let dst_name = dst.as_ref().and_then(Value::var);
                self.kill_facts(dfa, instrs, row_key, |fact_src, fact_dst| {
                    value_mentions_aliased(self.frontend, &self.alias_set, fact_src)
                        || value_mentions_aliased(self.frontend, &self.alias_set, fact_dst)
                        || dst_name.is_some_and(|name| {
                            mentions(fact_src, name) || mentions(fact_dst, name)
                        })
                });
            }
            Instruction::Store { .. } => {
                self.kill_facts(dfa, instrs, row_key, |fact_src, fact_dst| {
                    value_mentions_aliased(self.frontend, &self.alias_set, fact_src)
                        || value_mentions_aliased(self.frontend, &self.alias_set, fact_dst)
                });
            }
            Instruction::CopyToOffset { dst_name, .. } => {
                let dst_name = *dst_name;
                self.kill_facts(dfa, instrs, row_key, |fact_src, fact_dst| {
                    mentions(fact_src, dst_name) || mentions(fact_dst, dst_name)
                });
            }
            other => {
                if let Some(dst_name) = written_var(other) {
                    self.kill_facts(dfa, instrs, row_key, |fact_src, fact_dst| {
                        mentions(fact_src, dst_name) || mentions(fact_dst, dst_name)
                    });
                }
            }
        }
        true
    }
}

/// Gather the variables whose address is taken: the program-wide addressed
/// set plus every `GetAddress` source in this function.
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

/// Run copy propagation over one function. Returns whether anything in the
/// instruction stream changed.
pub fn propagate_copies(
    instrs: &mut Vec<Option<Instruction>>,
    cfg: &mut ControlFlowGraph,
    dfa: &mut DataFlow,
    frontend: &FrontEndSymbols,
) -> bool {
    let mut changed = false;
    dfa.reset(cfg, instrs.len());

    // Register one fact per copy and one row per transfer instruction;
    // self-copies are deleted on sight.
    let mut instr_row_count = 0;
    let mut block_row_count = 0;
    for block_id in 0..cfg.blocks.len() {
        if !cfg.is_block_live(block_id) {
            continue;
        }
        let (front, back) = (cfg.blocks[block_id].front_index, cfg.blocks[block_id].back_index);
        for index in front..=back {
            let slot = match &instrs[index] {
                Some(instr) => instr,
                None => continue,
            };
            if let Instruction::Copy { src, dst } = slot {
                if src == dst {
                    cfg.remove_instruction(instrs, index, block_id);
                    changed = true;
                    continue;
                }
                dfa.data_index.push(index);
                dfa.set_size += 1;
                dfa.instr_index[index] = instr_row_count;
                instr_row_count += 1;
            } else if is_transfer_kind(slot) {
                dfa.instr_index[index] = instr_row_count;
                instr_row_count += 1;
            }
        }
        if cfg.is_block_live(block_id) {
            dfa.block_index[block_id] = block_row_count;
            block_row_count += 1;
        }
    }
    if dfa.set_size == 0 {
        return changed;
    }
    trace!("copy propagation: {} tracked copies", dfa.set_size);

    dfa.instr_index[dfa.incoming_index] = instr_row_count;
    instr_row_count += 1;
    dfa.alloc_rows(block_row_count, instr_row_count);
    dfa.fill_block_rows_ones();
    dataflow::order_forward(dfa, cfg);

    let mut analysis = CopyAnalysis {
        frontend,
        alias_set: collect_alias_set(frontend, instrs),
    };
    dataflow::solve_forward(&mut analysis, dfa, cfg, instrs);

    // Rewrite pass. Walking each block backwards keeps at hand the row of
    // the next transfer instruction, which is the state at every point
    // between it and the previous one.
    let mut backups: FxHashMap<usize, (Value, Value)> = FxHashMap::default();
    for block_id in 0..cfg.blocks.len() {
        if !cfg.is_block_live(block_id) || !dfa.reachable[block_id] {
            continue;
        }
        let (front, back) = (cfg.blocks[block_id].front_index, cfg.blocks[block_id].back_index);
        let mut state = StateRow::Block(block_id);
        for index in (front..=back).rev() {
            let instr = match &instrs[index] {
                Some(instr) => instr,
                None => continue,
            };
            let is_transfer = is_transfer_kind(instr);
            let row = if is_transfer { StateRow::Instr(index) } else { state };

            // A copy whose fact (in either direction) already reaches is
            // redundant and comes out entirely.
            if let Instruction::Copy { src, dst } = instr {
                let redundant = (0..dfa.set_size).any(|fact| {
                    if !dfa.state_bit(row, fact) {
                        return false;
                    }
                    let (fact_src, fact_dst) =
                        fact_pair(instrs, &dfa.data_index, &backups, fact);
                    (&fact_src == src && &fact_dst == dst)
                        || (&fact_src == dst && &fact_dst == src)
                });
                if redundant {
                    backups.entry(index).or_insert_with(|| (src.clone(), dst.clone()));
                    cfg.remove_instruction(instrs, index, block_id);
                    changed = true;
                    state = StateRow::Instr(index);
                    continue;
                }
            }

            // Replace each use for which exactly one compatible copy into
            // it reaches.
            let replacements: SmallVec<[Option<Value>; 3]> = use_slots(instr)
                .into_iter()
                .map(|value| {
                    let name = value.var()?;
                    for fact in 0..dfa.set_size {
                        if !dfa.state_bit(row, fact) {
                            continue;
                        }
                        let (fact_src, fact_dst) =
                            fact_pair(instrs, &dfa.data_index, &backups, fact);
                        if mentions(&fact_dst, name)
                            && is_copy_compatible(frontend, &fact_src, value)
                        {
                            return Some(fact_src);
                        }
                    }
                    None
                })
                .collect();

            if replacements.iter().any(Option::is_some) {
                if let Some(Instruction::Copy { src, dst }) = &instrs[index] {
                    backups.entry(index).or_insert_with(|| (src.clone(), dst.clone()));
                }
                let instr = instrs[index].as_mut().unwrap();
                for (slot, replacement) in use_slots_mut(instr).into_iter().zip(replacements) {
                    if let Some(value) = replacement {
                        trace!("rewriting use at {index}");
                        *slot = value;
                        changed = true;
                    }
                }
            }
            if is_transfer {
                state = StateRow::Instr(index);
            }
        }
    }

    if changed {
        debug!("copy propagation changed the instruction stream");
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::symbols::{IdentAttr, Symbol};
    use crate::strings::StringInterner;

    struct Harness {
        interner: StringInterner,
        frontend: FrontEndSymbols,
    }

    impl Harness {
        fn new() -> Self {
            Self { interner: StringInterner::new(), frontend: FrontEndSymbols::new() }
        }

        fn var(&mut self, name: &str, ty: Type) -> Identifier {
            let id = self.interner.intern(name);
            self.frontend
                .symbol_table
                .insert(id, Symbol { ty, attrs: IdentAttr::Local });
            id
        }

        fn int_var(&mut self, name: &str) -> Identifier {
            self.var(name, Type::Int)
        }

        fn run(&self, instrs: &mut Vec<Option<Instruction>>) -> bool {
            let mut cfg = ControlFlowGraph::new();
            cfg.build(instrs);
            let mut dfa = DataFlow::new();
            propagate_copies(instrs, &mut cfg, &mut dfa, &self.frontend)
        }
    }

    fn int(value: i32) -> Value {
        Value::Constant(Constant::Int(value))
    }

    fn copy(src: Value, dst: Identifier) -> Option<Instruction> {
        Some(Instruction::Copy { src, dst: Value::Var(dst) })
    }

    #[test]
    fn constants_reach_through_copies() {
        let mut h = Harness::new();
        let x = h.int_var("x");
        let y = h.int_var("y");
        let mut instrs = vec![
            copy(int(5), x),
            copy(Value::Var(x), y),
            Some(Instruction::Return(Some(Value::Var(y)))),
        ];
        assert!(h.run(&mut instrs));
        assert_eq!(instrs[1], copy(int(5), y));
        // The return read the state before the second copy was rewritten,
        // so it picks up the original source.
        assert_eq!(instrs[2], Some(Instruction::Return(Some(Value::Var(x)))));
    }

    #[test]
    fn conflicting_paths_block_propagation() {
        let mut h = Harness::new();
        let x = h.int_var("x");
        let merge = h.interner.label_identifier("merge");
        let other = h.interner.label_identifier("other");
        let mut instrs = vec![
            Some(Instruction::JumpIfZero { condition: int(1), target: other }),
            copy(int(1), x),
            Some(Instruction::Jump(merge)),
            Some(Instruction::Label(other)),
            copy(int(2), x),
            Some(Instruction::Label(merge)),
            Some(Instruction::Return(Some(Value::Var(x)))),
        ];
        h.run(&mut instrs);
        // Neither copy reaches the join on both paths.
        assert_eq!(instrs[6], Some(Instruction::Return(Some(Value::Var(x)))));
    }

    #[test]
    fn redefinition_kills_the_fact() {
        let mut h = Harness::new();
        let x = h.int_var("x");
        let mut instrs = vec![
            copy(int(1), x),
            Some(Instruction::Binary {
                op: crate::ir::tac::BinaryOp::Add,
                src1: Value::Var(x),
                src2: int(1),
                dst: Value::Var(x),
            }),
            Some(Instruction::Return(Some(Value::Var(x)))),
        ];
        assert!(h.run(&mut instrs));
        // The use inside the redefinition still sees the copy...
        assert_eq!(
            instrs[1],
            Some(Instruction::Binary {
                op: crate::ir::tac::BinaryOp::Add,
                src1: int(1),
                src2: int(1),
                dst: Value::Var(x),
            })
        );
        // ...but the return after it does not.
        assert_eq!(instrs[2], Some(Instruction::Return(Some(Value::Var(x)))));
    }

    #[test]
    fn calls_kill_aliased_copies_only() {
        let mut h = Harness::new();
        let f = h.interner.intern("f");
        h.frontend.symbol_table.insert(
            f,
            Symbol {
                ty: Type::Fun(Box::new(crate::ir::types::FunType::new(vec![], Type::Void))),
                attrs: IdentAttr::Fun { is_def: false, is_glob: true },
            },
        );
        let x = h.int_var("x");
        let y = h.int_var("y");
        h.frontend.addressed_set.insert(x);

        let mut instrs = vec![
            copy(int(1), x),
            copy(int(2), y),
            Some(Instruction::FunCall { name: f, args: vec![], dst: None }),
            Some(Instruction::Binary {
                op: crate::ir::tac::BinaryOp::Add,
                src1: Value::Var(x),
                src2: Value::Var(y),
                dst: Value::Var(y),
            }),
            Some(Instruction::Return(Some(Value::Var(y)))),
        ];
        assert!(h.run(&mut instrs));
        match &instrs[3] {
            Some(Instruction::Binary { src1, src2, .. }) => {
                // x is address-taken: the call may have changed it.
                assert_eq!(src1, &Value::Var(x));
                // y is private to the function, its copy survives the call.
                assert_eq!(src2, &int(2));
            }
            other => panic!("unexpected instruction {other:?}"),
        }
    }

    #[test]
    fn self_copies_are_deleted_immediately() {
        let mut h = Harness::new();
        let x = h.int_var("x");
        let mut instrs = vec![
            copy(Value::Var(x), x),
            Some(Instruction::Return(None)),
        ];
        assert!(h.run(&mut instrs));
        assert_eq!(instrs[0], None);
    }

    #[test]
    fn reestablished_copies_are_redundant() {
        let mut h = Harness::new();
        let x = h.int_var("x");
        let y = h.int_var("y");
        let mut instrs = vec![
            copy(Value::Var(y), x),
            copy(Value::Var(y), x),
            Some(Instruction::Return(Some(Value::Var(x)))),
        ];
        assert!(h.run(&mut instrs));
        assert_eq!(instrs[1], None);
        assert_eq!(instrs[2], Some(Instruction::Return(Some(Value::Var(y)))));
    }

    #[test]
    fn incompatible_widths_do_not_propagate() {
        let mut h = Harness::new();
        let wide = h.var("wide", Type::Long);
        let narrow = h.int_var("narrow");
        // A long-to-int copy would be a reinterpretation, not a move.
        let mut instrs = vec![
            copy(Value::Var(wide), narrow),
            Some(Instruction::Return(Some(Value::Var(narrow)))),
        ];
        h.run(&mut instrs);
        assert_eq!(instrs[1], Some(Instruction::Return(Some(Value::Var(narrow)))));
    }

    #[test]
    fn loops_converge_to_a_fixed_point() {
        let mut h = Harness::new();
        let x = h.int_var("x");
        let y = h.int_var("y");
        let head = h.interner.label_identifier("head");
        let done = h.interner.label_identifier("done");
        let mut instrs = vec![
            copy(int(3), x),
            Some(Instruction::Label(head)),
            Some(Instruction::JumpIfZero { condition: Value::Var(x), target: done }),
            copy(Value::Var(x), y),
            Some(Instruction::Binary {
                op: crate::ir::tac::BinaryOp::Subtract,
                src1: Value::Var(y),
                src2: int(1),
                dst: Value::Var(x),
            }),
            Some(Instruction::Jump(head)),
            Some(Instruction::Label(done)),
            Some(Instruction::Return(Some(Value::Var(x)))),
        ];
        h.run(&mut instrs);
        // x is redefined around the loop, so the initial copy must not
        // reach the loop body on the back edge.
        match &instrs[4] {
            Some(Instruction::Binary { src1, .. }) => {
                assert_eq!(src1, &Value::Var(x), "y = x reaches, so src1 becomes x");
            }
            other => panic!("unexpected instruction {other:?}"),
        }
        assert_eq!(instrs[7], Some(Instruction::Return(Some(Value::Var(x)))));
    }
}
