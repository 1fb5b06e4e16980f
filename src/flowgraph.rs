//! A control flow graph over a function's TAC instruction vector.
//!
//! Blocks are index ranges into the instruction vector. A block starts at a
//! label or at the first instruction, and ends at a return, a jump, or just
//! before the next label. Two synthetic nodes, ENTRY and EXIT, close the
//! graph; they are identified by `exit_id == blocks.len()` and
//! `entry_id == exit_id + 1`, so any id below `exit_id` names a real block.
//!
//! The optimizers null out instruction slots and may empty whole blocks; the
//! graph supports removing instructions, edges, and blocks while keeping the
//! predecessor and successor lists exact duals of each other.

use crate::ir::tac::Instruction;
use crate::strings::Identifier;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Adjacency list of a CFG node.
pub type EdgeList = SmallVec<[usize; 4]>;

/// One basic block: a live-instruction count and the index range it spans.
#[derive(Clone, Debug, Default)]
pub struct ControlFlowBlock {
    /// Number of live (non-null) instructions in the block.
    pub size: usize,
    /// Index of the first instruction.
    pub front_index: usize,
    /// Index of the last instruction.
    pub back_index: usize,
    /// Ids of blocks that can transfer control here.
    pub predecessors: EdgeList,
    /// Ids of blocks control can transfer to.
    pub successors: EdgeList,
}

/// The control flow graph of one function.
#[derive(Default)]
pub struct ControlFlowGraph {
    /// Blocks in instruction order.
    pub blocks: Vec<ControlFlowBlock>,
    /// Sentinel id of the exit node, `blocks.len()`.
    pub exit_id: usize,
    /// Sentinel id of the entry node, `exit_id + 1`.
    pub entry_id: usize,
    /// Successors of ENTRY.
    pub entry_successors: EdgeList,
    /// Predecessors of EXIT.
    pub exit_predecessors: EdgeList,
    /// Label to the id of the block it opens.
    pub label_to_block: FxHashMap<Identifier, usize>,
}

fn push_unique(edges: &mut EdgeList, id: usize) {
    if !edges.contains(&id) {
        edges.push(id);
    }
}

fn swap_remove_value(edges: &mut EdgeList, id: usize) {
    if let Some(position) = edges.iter().rposition(|&edge| edge == id) {
        edges.swap_remove(position);
    }
}

impl ControlFlowGraph {
    /// An empty graph; call [`Self::build`] to populate it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Partition `instrs` into blocks and compute the initial edges.
    ///
    /// Any state from a previous build is discarded.
    pub fn build(&mut self, instrs: &[Option<Instruction>]) {
        self.blocks.clear();
        self.label_to_block.clear();

        // `open` is the index of the last instruction added to the current
        // block, or `instrs.len()` when no block is open.
        let mut open = instrs.len();
        for (index, slot) in instrs.iter().enumerate() {
            let instr = match slot {
                Some(instr) => instr,
                None => continue,
            };
            if open == instrs.len() {
                self.blocks.push(ControlFlowBlock {
                    front_index: index,
                    ..Default::default()
                });
            }
            match instr {
                Instruction::Label(name) => {
                    if open != instrs.len() {
                        // A label in the middle of a block closes it and
                        // opens a new one.
                        self.blocks.last_mut().unwrap().back_index = open;
                        self.blocks.push(ControlFlowBlock {
                            front_index: index,
                            ..Default::default()
                        });
                    }
                    let block_id = self.blocks.len() - 1;
                    self.label_to_block.insert(*name, block_id);
                    open = index;
                }
                Instruction::Return(_)
                | Instruction::Jump(_)
                | Instruction::JumpIfZero { .. }
                | Instruction::JumpIfNotZero { .. } => {
                    self.blocks.last_mut().unwrap().back_index = index;
                    open = instrs.len();
                }
                _ => open = index,
            }
            self.blocks.last_mut().unwrap().size += 1;
        }
        if open != instrs.len() {
            self.blocks.last_mut().unwrap().back_index = open;
        }

        self.exit_id = self.blocks.len();
        self.entry_id = self.exit_id + 1;
        self.entry_successors.clear();
        self.exit_predecessors.clear();
        if !self.blocks.is_empty() {
            self.add_predecessor_edge(0, self.entry_id);
            for block_id in 0..self.blocks.len() {
                self.init_block_edges(instrs, block_id);
            }
        }
    }

    fn init_block_edges(&mut self, instrs: &[Option<Instruction>], block_id: usize) {
        let terminator = instrs[self.blocks[block_id].back_index]
            .as_ref()
            .expect("block terminator slot is null");
        match terminator {
            Instruction::Return(_) => self.add_successor_edge(block_id, self.exit_id),
            Instruction::Jump(target) => {
                let target_id = self.label_to_block[target];
                self.add_successor_edge(block_id, target_id);
            }
            Instruction::JumpIfZero { target, .. }
            | Instruction::JumpIfNotZero { target, .. } => {
                let target_id = self.label_to_block[target];
                self.add_successor_edge(block_id, target_id);
                self.add_successor_edge(block_id, block_id + 1);
            }
            _ => self.add_successor_edge(block_id, block_id + 1),
        }
    }

    /// Add the edge `block_id -> successor_id`, updating both sides.
    pub fn add_successor_edge(&mut self, block_id: usize, successor_id: usize) {
        if successor_id < self.exit_id {
            push_unique(&mut self.blocks[block_id].successors, successor_id);
            push_unique(&mut self.blocks[successor_id].predecessors, block_id);
        } else if successor_id == self.exit_id {
            push_unique(&mut self.blocks[block_id].successors, successor_id);
            push_unique(&mut self.exit_predecessors, block_id);
        } else {
            panic!("edge to entry node");
        }
    }

    /// Add the edge `predecessor_id -> block_id`, updating both sides.
    pub fn add_predecessor_edge(&mut self, block_id: usize, predecessor_id: usize) {
        if predecessor_id < self.exit_id {
            push_unique(&mut self.blocks[predecessor_id].successors, block_id);
            push_unique(&mut self.blocks[block_id].predecessors, predecessor_id);
        } else if predecessor_id == self.entry_id {
            push_unique(&mut self.entry_successors, block_id);
            push_unique(&mut self.blocks[block_id].predecessors, predecessor_id);
        } else {
            panic!("edge from exit node");
        }
    }

    /// Remove the edge `block_id -> successor_id`.
    ///
    /// With `is_reachable` false only the predecessor side is cleaned: the
    /// forward side belongs to a block already torn out of the graph.
    pub fn remove_successor_edge(
        &mut self,
        block_id: usize,
        successor_id: usize,
        is_reachable: bool,
    ) {
        if is_reachable {
            swap_remove_value(&mut self.blocks[block_id].successors, successor_id);
        }
        if successor_id < self.exit_id {
            swap_remove_value(&mut self.blocks[successor_id].predecessors, block_id);
        } else if successor_id == self.exit_id {
            swap_remove_value(&mut self.exit_predecessors, block_id);
        } else {
            panic!("edge to entry node");
        }
    }

    /// Remove the edge `predecessor_id -> block_id`.
    pub fn remove_predecessor_edge(&mut self, block_id: usize, predecessor_id: usize) {
        if predecessor_id < self.exit_id {
            swap_remove_value(&mut self.blocks[predecessor_id].successors, block_id);
        } else if predecessor_id == self.entry_id {
            swap_remove_value(&mut self.entry_successors, block_id);
        } else {
            panic!("edge from exit node");
        }
        swap_remove_value(&mut self.blocks[block_id].predecessors, predecessor_id);
    }

    /// Unlink an empty block, bridging each predecessor to each successor,
    /// and mark it dead by pointing its range at the exit sentinel.
    pub fn remove_empty_block(&mut self, block_id: usize, is_reachable: bool) {
        let successors = self.blocks[block_id].successors.clone();
        for &successor_id in &successors {
            if is_reachable {
                let predecessors = self.blocks[block_id].predecessors.clone();
                for &predecessor_id in &predecessors {
                    if predecessor_id == self.entry_id {
                        self.add_predecessor_edge(successor_id, predecessor_id);
                    } else {
                        self.add_successor_edge(predecessor_id, successor_id);
                    }
                }
            }
            self.remove_successor_edge(block_id, successor_id, is_reachable);
        }
        if is_reachable {
            let predecessors = self.blocks[block_id].predecessors.clone();
            for &predecessor_id in &predecessors {
                self.remove_predecessor_edge(block_id, predecessor_id);
            }
        }
        if !is_reachable {
            self.blocks[block_id].successors.clear();
        }
        self.blocks[block_id].front_index = self.exit_id;
        self.blocks[block_id].back_index = self.exit_id;
    }

    /// Null the instruction at `index` inside `block_id`, shrinking the
    /// block's range and unlinking the block when it empties.
    pub fn remove_instruction(
        &mut self,
        instrs: &mut [Option<Instruction>],
        index: usize,
        block_id: usize,
    ) {
        if instrs[index].is_none() {
            return;
        }
        instrs[index] = None;
        self.blocks[block_id].size -= 1;
        if self.blocks[block_id].size == 0 {
            self.remove_empty_block(block_id, true);
        } else if index == self.blocks[block_id].front_index {
            let back = self.blocks[block_id].back_index;
            for next in index + 1..=back {
                if instrs[next].is_some() {
                    self.blocks[block_id].front_index = next;
                    break;
                }
            }
        } else if index == self.blocks[block_id].back_index {
            let front = self.blocks[block_id].front_index;
            for prev in (front..index).rev() {
                if instrs[prev].is_some() {
                    self.blocks[block_id].back_index = prev;
                    break;
                }
            }
        }
    }

    /// Whether `block_id` still holds instructions.
    pub fn is_block_live(&self, block_id: usize) -> bool {
        self.blocks[block_id].size > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tac::{Constant, Value};
    use crate::strings::StringInterner;

    fn cond(target: Identifier) -> Instruction {
        Instruction::JumpIfZero {
            condition: Value::Constant(Constant::Int(0)),
            target,
        }
    }

    fn copy(interner: &mut StringInterner, name: &str) -> Instruction {
        let dst = interner.intern(name);
        Instruction::Copy {
            src: Value::Constant(Constant::Int(1)),
            dst: Value::Var(dst),
        }
    }

    /// Every successor edge must have a matching predecessor edge, and the
    /// other way around, ENTRY and EXIT included.
    fn assert_dual_edges(cfg: &ControlFlowGraph) {
        for (block_id, block) in cfg.blocks.iter().enumerate() {
            for &successor_id in &block.successors {
                let preds = if successor_id == cfg.exit_id {
                    &cfg.exit_predecessors
                } else {
                    &cfg.blocks[successor_id].predecessors
                };
                assert!(
                    preds.contains(&block_id),
                    "edge {block_id} -> {successor_id} has no dual"
                );
            }
            for &predecessor_id in &block.predecessors {
                let succs = if predecessor_id == cfg.entry_id {
                    &cfg.entry_successors
                } else {
                    &cfg.blocks[predecessor_id].successors
                };
                assert!(
                    succs.contains(&block_id),
                    "edge {predecessor_id} -> {block_id} has no dual"
                );
            }
        }
        for &block_id in &cfg.entry_successors {
            assert!(cfg.blocks[block_id].predecessors.contains(&cfg.entry_id));
        }
        for &block_id in &cfg.exit_predecessors {
            assert!(cfg.blocks[block_id].successors.contains(&cfg.exit_id));
        }
    }

    #[test]
    fn empty_function() {
        let mut cfg = ControlFlowGraph::new();
        cfg.build(&[]);
        assert!(cfg.blocks.is_empty());
        assert_eq!(cfg.exit_id, 0);
        assert_eq!(cfg.entry_id, 1);
        assert!(cfg.entry_successors.is_empty());
    }

    #[test]
    fn straight_line_is_one_block() {
        let mut interner = StringInterner::new();
        let instrs = vec![
            Some(copy(&mut interner, "a")),
            Some(copy(&mut interner, "b")),
            Some(Instruction::Return(None)),
        ];
        let mut cfg = ControlFlowGraph::new();
        cfg.build(&instrs);

        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.blocks[0].size, 3);
        assert_eq!(cfg.blocks[0].front_index, 0);
        assert_eq!(cfg.blocks[0].back_index, 2);
        assert_eq!(cfg.entry_successors.as_slice(), &[0]);
        assert_eq!(cfg.exit_predecessors.as_slice(), &[0]);
        assert_dual_edges(&cfg);
    }

    #[test]
    fn branches_split_blocks_and_route_labels() {
        let mut interner = StringInterner::new();
        let target = interner.label_identifier("else");
        let instrs = vec![
            Some(copy(&mut interner, "a")),      // block 0
            Some(cond(target)),                  //
            Some(copy(&mut interner, "b")),      // block 1 (fallthrough)
            Some(Instruction::Return(None)),     //
            Some(Instruction::Label(target)),    // block 2
            Some(Instruction::Return(None)),     //
        ];
        let mut cfg = ControlFlowGraph::new();
        cfg.build(&instrs);

        assert_eq!(cfg.blocks.len(), 3);
        assert_eq!(cfg.label_to_block[&target], 2);
        let mut succ0 = cfg.blocks[0].successors.clone();
        succ0.sort_unstable();
        assert_eq!(succ0.as_slice(), &[1, 2]);
        assert_eq!(cfg.blocks[1].successors.as_slice(), &[cfg.exit_id]);
        assert_eq!(cfg.blocks[2].successors.as_slice(), &[cfg.exit_id]);
        assert_eq!(cfg.blocks[2].predecessors.as_slice(), &[0]);
        assert_dual_edges(&cfg);
    }

    #[test]
    fn fallthrough_from_last_block_reaches_exit() {
        let mut interner = StringInterner::new();
        let instrs = vec![Some(copy(&mut interner, "a"))];
        let mut cfg = ControlFlowGraph::new();
        cfg.build(&instrs);
        assert_eq!(cfg.blocks[0].successors.as_slice(), &[cfg.exit_id]);
        assert_dual_edges(&cfg);
    }

    #[test]
    fn removing_instructions_shrinks_then_unlinks_the_block() {
        let mut interner = StringInterner::new();
        let target = interner.label_identifier("join");
        let mut instrs = vec![
            Some(cond(target)),                  // block 0
            Some(copy(&mut interner, "a")),      // block 1
            Some(copy(&mut interner, "b")),      //
            Some(Instruction::Label(target)),    // block 2
            Some(Instruction::Return(None)),     //
        ];
        let mut cfg = ControlFlowGraph::new();
        cfg.build(&instrs);
        assert_dual_edges(&cfg);

        cfg.remove_instruction(&mut instrs, 1, 1);
        assert_eq!(cfg.blocks[1].size, 1);
        assert_eq!(cfg.blocks[1].front_index, 2);
        assert_dual_edges(&cfg);

        // Removing the last instruction empties block 1; its predecessor
        // must be re-routed to its successor.
        cfg.remove_instruction(&mut instrs, 2, 1);
        assert_eq!(cfg.blocks[1].size, 0);
        assert!(!cfg.is_block_live(1));
        assert!(cfg.blocks[0].successors.contains(&2));
        assert!(cfg.blocks[2].predecessors.contains(&0));
        assert!(!cfg.blocks[2].predecessors.contains(&1));
        assert_dual_edges(&cfg);
    }

    #[test]
    fn duplicate_edges_are_no_ops() {
        let mut interner = StringInterner::new();
        let instrs = vec![
            Some(copy(&mut interner, "a")),
            Some(Instruction::Return(None)),
        ];
        let mut cfg = ControlFlowGraph::new();
        cfg.build(&instrs);
        let before = cfg.exit_predecessors.len();
        cfg.add_successor_edge(0, cfg.exit_id);
        assert_eq!(cfg.exit_predecessors.len(), before);
        assert_eq!(cfg.blocks[0].successors.len(), 1);
    }
}
