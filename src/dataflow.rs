//! Iterative data-flow analysis over bit-mask rows.
//!
//! Facts are numbered `0..set_size` and packed into rows of `u64` words,
//! `mask_size` words per row. Every non-empty block owns one row holding its
//! fixed-point state, and every transfer instruction owns one row holding
//! the state flowing into it (forward) or out of it (backward); one extra
//! scratch row, keyed by `instrs.len()`, receives the state at the far end
//! of a block's transfer chain.
//!
//! The solver is a worklist loop over blocks. A forward analysis meets by
//! intersecting predecessor rows and walks each block front to back; a
//! backward analysis meets by uniting successor rows and walks back to
//! front. The two directions share everything but the meet and the walk, so
//! they are two small drivers over one [`Analysis`] trait.

use crate::flowgraph::ControlFlowGraph;
use crate::ir::tac::Instruction;

/// Read bit `bit % 64` of one mask word.
pub fn mask_get(mask: u64, bit: usize) -> bool {
    mask & (1u64 << (bit % 64)) != 0
}

/// Write bit `bit % 64` of one mask word.
pub fn mask_set(mask: &mut u64, bit: usize, value: bool) {
    if value {
        *mask |= 1u64 << (bit % 64);
    } else {
        *mask &= !(1u64 << (bit % 64));
    }
}

/// A program point whose fact set can be consulted after solving.
#[derive(Copy, Clone, Debug)]
pub enum StateRow {
    /// The row owned by a transfer instruction.
    Instr(usize),
    /// The fixed-point row of a block.
    Block(usize),
}

/// Scratch state of one analysis run. The buffers are reused across
/// functions and passes; [`DataFlow::reset`] re-dimensions them.
#[derive(Default)]
pub struct DataFlow {
    /// Number of tracked facts.
    pub set_size: usize,
    /// Words per row, `ceil(set_size / 64)`.
    pub mask_size: usize,
    /// Key of the scratch row, `instrs.len()`.
    pub incoming_index: usize,
    /// Per-block rows, `block_index[b] * mask_size` words in.
    pub block_rows: Vec<u64>,
    /// Per-instruction rows plus the scratch row.
    pub instr_rows: Vec<u64>,
    /// Block id to row ordinal.
    pub block_index: Vec<usize>,
    /// Instruction index (or `incoming_index`) to row ordinal.
    pub instr_index: Vec<usize>,
    /// The block worklist, seeded in analysis order.
    pub open_blocks: Vec<usize>,
    /// Which blocks the ordering traversal reached.
    pub reachable: Vec<bool>,
    /// Pass-specific payload per fact: the instruction index of a tracked
    /// copy, or a static-storage flag per tracked variable.
    pub data_index: Vec<usize>,
}

impl DataFlow {
    /// Fresh, empty analysis state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-dimension the index maps for a function of `instr_count`
    /// instruction slots. Empty blocks are pre-marked reached so the
    /// ordering traversal skips them.
    pub fn reset(&mut self, cfg: &ControlFlowGraph, instr_count: usize) {
        self.set_size = 0;
        self.incoming_index = instr_count;
        self.data_index.clear();
        self.open_blocks.clear();
        self.open_blocks.resize(cfg.blocks.len(), 0);
        self.block_index.clear();
        self.block_index.resize(cfg.blocks.len(), 0);
        self.instr_index.clear();
        self.instr_index.resize(instr_count + 1, 0);
        self.reachable.clear();
        for block in &cfg.blocks {
            self.reachable.push(block.size == 0);
        }
    }

    /// Allocate zeroed rows once `set_size` and the row counts are known.
    pub fn alloc_rows(&mut self, block_rows: usize, instr_rows: usize) {
        debug_assert!(self.set_size > 0);
        self.mask_size = (self.set_size + 63) / 64;
        self.block_rows.clear();
        self.block_rows.resize(block_rows * self.mask_size, 0);
        self.instr_rows.clear();
        self.instr_rows.resize(instr_rows * self.mask_size, 0);
    }

    /// All-ones mask for the last word of a row, bits past `set_size`
    /// cleared.
    fn last_word_mask(&self) -> u64 {
        let bits = self.set_size - (self.mask_size - 1) * 64;
        if bits == 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }

    /// Fill every block row with the full fact set.
    pub fn fill_block_rows_ones(&mut self) {
        let last = self.last_word_mask();
        let mask_size = self.mask_size;
        for (word, slot) in self.block_rows.iter_mut().enumerate() {
            *slot = if word % mask_size == mask_size - 1 { last } else { u64::MAX };
        }
    }

    fn block_row_start(&self, block_id: usize) -> usize {
        self.block_index[block_id] * self.mask_size
    }

    fn instr_row_start(&self, key: usize) -> usize {
        self.instr_index[key] * self.mask_size
    }

    /// Read fact `bit` in a block row.
    pub fn block_bit(&self, block_id: usize, bit: usize) -> bool {
        mask_get(self.block_rows[self.block_row_start(block_id) + bit / 64], bit)
    }

    /// Read fact `bit` in an instruction row.
    pub fn instr_bit(&self, key: usize, bit: usize) -> bool {
        mask_get(self.instr_rows[self.instr_row_start(key) + bit / 64], bit)
    }

    /// Write fact `bit` in an instruction row.
    pub fn set_instr_bit(&mut self, key: usize, bit: usize, value: bool) {
        let word = self.instr_row_start(key) + bit / 64;
        mask_set(&mut self.instr_rows[word], bit, value);
    }

    /// Read fact `bit` at a solved program point.
    pub fn state_bit(&self, row: StateRow, bit: usize) -> bool {
        match row {
            StateRow::Instr(key) => self.instr_bit(key, bit),
            StateRow::Block(block_id) => self.block_bit(block_id, bit),
        }
    }

    fn fill_instr_row(&mut self, key: usize, word: u64) {
        let start = self.instr_row_start(key);
        for slot in &mut self.instr_rows[start..start + self.mask_size] {
            *slot = word;
        }
    }

    fn copy_instr_row(&mut self, from_key: usize, to_key: usize) {
        let from = self.instr_row_start(from_key);
        let to = self.instr_row_start(to_key);
        for word in 0..self.mask_size {
            self.instr_rows[to + word] = self.instr_rows[from + word];
        }
    }

    fn and_instr_row_with_block(&mut self, key: usize, block_id: usize) {
        let row = self.instr_row_start(key);
        let block = self.block_row_start(block_id);
        for word in 0..self.mask_size {
            self.instr_rows[row + word] &= self.block_rows[block + word];
        }
    }

    fn or_instr_row_with_block(&mut self, key: usize, block_id: usize) {
        let row = self.instr_row_start(key);
        let block = self.block_row_start(block_id);
        for word in 0..self.mask_size {
            self.instr_rows[row + word] |= self.block_rows[block + word];
        }
    }

    /// Compare the scratch row against the block row; when they differ,
    /// write the scratch row back. Returns whether the block was already at
    /// its fixed point.
    fn commit_block_row(&mut self, block_id: usize) -> bool {
        let block = self.block_row_start(block_id);
        let incoming = self.instr_row_start(self.incoming_index);
        let mut fixed = true;
        for word in 0..self.mask_size {
            if self.block_rows[block + word] != self.instr_rows[incoming + word] {
                fixed = false;
                break;
            }
        }
        if !fixed {
            for word in 0..self.mask_size {
                self.block_rows[block + word] = self.instr_rows[incoming + word];
            }
        }
        fixed
    }
}

/// One concrete analysis: which instructions carry rows, how an instruction
/// transforms a row, and what holds at the EXIT boundary.
pub trait Analysis {
    /// Whether `instr` owns a row and takes part in the transfer chain.
    fn is_transfer(&self, instr: &Instruction) -> bool;

    /// Apply the effect of the instruction at `instr_index` to the row
    /// keyed `row_key`, which was pre-loaded with the state flowing in
    /// (forward) or out (backward). Returning `false` asks the driver to
    /// restore the pre-transfer state.
    fn transfer(
        &mut self,
        dfa: &mut DataFlow,
        instrs: &[Option<Instruction>],
        instr_index: usize,
        row_key: usize,
    ) -> bool;

    /// Backward only: overwrite the row keyed `row_key` with the state that
    /// holds at EXIT.
    fn meet_exit(&mut self, dfa: &mut DataFlow, row_key: usize) {
        let _ = (dfa, row_key);
    }
}

fn first_transfer<A: Analysis>(
    analysis: &A,
    dfa: &DataFlow,
    cfg: &ControlFlowGraph,
    instrs: &[Option<Instruction>],
    block_id: usize,
) -> usize {
    let block = &cfg.blocks[block_id];
    for index in block.front_index..=block.back_index {
        if let Some(instr) = &instrs[index] {
            if analysis.is_transfer(instr) {
                return index;
            }
        }
    }
    dfa.incoming_index
}

fn last_transfer<A: Analysis>(
    analysis: &A,
    dfa: &DataFlow,
    cfg: &ControlFlowGraph,
    instrs: &[Option<Instruction>],
    block_id: usize,
) -> usize {
    let block = &cfg.blocks[block_id];
    for index in (block.front_index..=block.back_index).rev() {
        if let Some(instr) = &instrs[index] {
            if analysis.is_transfer(instr) {
                return index;
            }
        }
    }
    dfa.incoming_index
}

fn forward_transfer_block<A: Analysis>(
    analysis: &mut A,
    dfa: &mut DataFlow,
    cfg: &ControlFlowGraph,
    instrs: &[Option<Instruction>],
    mut current: usize,
    block_id: usize,
) {
    let back = cfg.blocks[block_id].back_index;
    for next in current + 1..=back {
        let is_transfer = match &instrs[next] {
            Some(instr) => analysis.is_transfer(instr),
            None => false,
        };
        if is_transfer {
            dfa.copy_instr_row(current, next);
            if !analysis.transfer(dfa, instrs, current, next) {
                dfa.copy_instr_row(current, next);
            }
            current = next;
        }
    }
    let incoming = dfa.incoming_index;
    dfa.copy_instr_row(current, incoming);
    if !analysis.transfer(dfa, instrs, current, incoming) {
        dfa.copy_instr_row(current, incoming);
    }
}

fn backward_transfer_block<A: Analysis>(
    analysis: &mut A,
    dfa: &mut DataFlow,
    cfg: &ControlFlowGraph,
    instrs: &[Option<Instruction>],
    mut current: usize,
    block_id: usize,
) {
    let front = cfg.blocks[block_id].front_index;
    for next in (front..current).rev() {
        let is_transfer = match &instrs[next] {
            Some(instr) => analysis.is_transfer(instr),
            None => false,
        };
        if is_transfer {
            dfa.copy_instr_row(current, next);
            analysis.transfer(dfa, instrs, current, next);
            current = next;
        }
    }
    let incoming = dfa.incoming_index;
    dfa.copy_instr_row(current, incoming);
    analysis.transfer(dfa, instrs, current, incoming);
}

fn forward_meet_block<A: Analysis>(
    analysis: &mut A,
    dfa: &mut DataFlow,
    cfg: &ControlFlowGraph,
    instrs: &[Option<Instruction>],
    block_id: usize,
) -> bool {
    let key = first_transfer(analysis, dfa, cfg, instrs, block_id);
    dfa.fill_instr_row(key, u64::MAX);
    for &predecessor_id in &cfg.blocks[block_id].predecessors {
        if predecessor_id < cfg.exit_id {
            dfa.and_instr_row_with_block(key, predecessor_id);
        } else if predecessor_id == cfg.entry_id {
            // Nothing reaches from outside the function.
            dfa.fill_instr_row(key, 0);
            break;
        } else {
            panic!("predecessor is the exit node");
        }
    }
    if key < dfa.incoming_index {
        forward_transfer_block(analysis, dfa, cfg, instrs, key, block_id);
    }
    dfa.commit_block_row(block_id)
}

fn backward_meet_block<A: Analysis>(
    analysis: &mut A,
    dfa: &mut DataFlow,
    cfg: &ControlFlowGraph,
    instrs: &[Option<Instruction>],
    block_id: usize,
) -> bool {
    let key = last_transfer(analysis, dfa, cfg, instrs, block_id);
    dfa.fill_instr_row(key, 0);
    for &successor_id in &cfg.blocks[block_id].successors {
        if successor_id < cfg.exit_id {
            dfa.or_instr_row_with_block(key, successor_id);
        } else if successor_id == cfg.exit_id {
            analysis.meet_exit(dfa, key);
            break;
        } else {
            panic!("successor is the entry node");
        }
    }
    if key < dfa.incoming_index {
        backward_transfer_block(analysis, dfa, cfg, instrs, key, block_id);
    }
    dfa.commit_block_row(block_id)
}

fn visit_forward(
    dfa: &mut DataFlow,
    cfg: &ControlFlowGraph,
    block_id: usize,
    slot: &mut usize,
) {
    if block_id < cfg.exit_id && !dfa.reachable[block_id] {
        dfa.reachable[block_id] = true;
        for &successor_id in &cfg.blocks[block_id].successors {
            visit_forward(dfa, cfg, successor_id, slot);
        }
        *slot -= 1;
        dfa.open_blocks[*slot] = block_id;
    }
}

/// Seed the worklist with the reverse-postorder of blocks reachable from
/// ENTRY; unvisited slots hold the EXIT sentinel and are skipped.
pub fn order_forward(dfa: &mut DataFlow, cfg: &ControlFlowGraph) {
    let mut slot = cfg.blocks.len();
    for &successor_id in &cfg.entry_successors {
        visit_forward(dfa, cfg, successor_id, &mut slot);
    }
    for unvisited in 0..slot {
        dfa.open_blocks[unvisited] = cfg.exit_id;
    }
}

fn visit_backward(
    dfa: &mut DataFlow,
    cfg: &ControlFlowGraph,
    block_id: usize,
    slot: &mut usize,
) {
    if block_id < cfg.exit_id && !dfa.reachable[block_id] {
        dfa.reachable[block_id] = true;
        for &successor_id in &cfg.blocks[block_id].successors {
            visit_backward(dfa, cfg, successor_id, slot);
        }
        dfa.open_blocks[*slot] = block_id;
        *slot += 1;
    }
}

/// Seed the worklist with the postorder of blocks reachable from ENTRY.
pub fn order_backward(dfa: &mut DataFlow, cfg: &ControlFlowGraph) {
    let mut slot = 0;
    for &successor_id in &cfg.entry_successors {
        visit_backward(dfa, cfg, successor_id, &mut slot);
    }
    for unvisited in slot..cfg.blocks.len() {
        dfa.open_blocks[unvisited] = cfg.exit_id;
    }
}

/// Run a forward analysis to its fixed point.
///
/// When a block's state changes, its successors not already queued in the
/// unprocessed tail of the worklist are appended to it.
pub fn solve_forward<A: Analysis>(
    analysis: &mut A,
    dfa: &mut DataFlow,
    cfg: &ControlFlowGraph,
    instrs: &[Option<Instruction>],
) {
    let mut count = cfg.blocks.len();
    let mut next = 0;
    while next < count {
        let block_id = dfa.open_blocks[next];
        if block_id == cfg.exit_id {
            next += 1;
            continue;
        }
        if !forward_meet_block(analysis, dfa, cfg, instrs, block_id) {
            for &successor_id in &cfg.blocks[block_id].successors {
                if successor_id < cfg.exit_id {
                    if !dfa.open_blocks[next + 1..count].contains(&successor_id) {
                        if count < dfa.open_blocks.len() {
                            dfa.open_blocks[count] = successor_id;
                        } else {
                            dfa.open_blocks.push(successor_id);
                        }
                        count += 1;
                    }
                } else {
                    debug_assert_eq!(successor_id, cfg.exit_id);
                }
            }
        }
        next += 1;
    }
}

/// Run a backward analysis to its fixed point.
pub fn solve_backward<A: Analysis>(
    analysis: &mut A,
    dfa: &mut DataFlow,
    cfg: &ControlFlowGraph,
    instrs: &[Option<Instruction>],
) {
    let mut count = cfg.blocks.len();
    let mut next = 0;
    while next < count {
        let block_id = dfa.open_blocks[next];
        if block_id == cfg.exit_id {
            next += 1;
            continue;
        }
        if !backward_meet_block(analysis, dfa, cfg, instrs, block_id) {
            for &predecessor_id in &cfg.blocks[block_id].predecessors {
                if predecessor_id < cfg.exit_id {
                    if !dfa.open_blocks[next + 1..count].contains(&predecessor_id) {
                        if count < dfa.open_blocks.len() {
                            dfa.open_blocks[count] = predecessor_id;
                        } else {
                            dfa.open_blocks.push(predecessor_id);
                        }
                        count += 1;
                    }
                } else {
                    debug_assert_eq!(predecessor_id, cfg.entry_id);
                }
            }
        }
        next += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_bits_wrap_per_word() {
        let mut word = 0u64;
        mask_set(&mut word, 3, true);
        mask_set(&mut word, 67, true);
        assert_eq!(word, 1 << 3);
        assert!(mask_get(word, 3));
        assert!(mask_get(word, 67));
        mask_set(&mut word, 3, false);
        assert_eq!(word, 0);
    }

    #[test]
    fn last_word_mask_truncates_to_set_size() {
        let mut dfa = DataFlow::new();
        dfa.set_size = 3;
        dfa.mask_size = 1;
        assert_eq!(dfa.last_word_mask(), 0b111);
        dfa.set_size = 64;
        assert_eq!(dfa.last_word_mask(), u64::MAX);
        dfa.set_size = 70;
        dfa.mask_size = 2;
        assert_eq!(dfa.last_word_mask(), 0b11_1111);
    }

    #[test]
    fn block_rows_fill_respects_truncation() {
        let mut dfa = DataFlow::new();
        dfa.set_size = 70;
        dfa.alloc_rows(2, 1);
        dfa.fill_block_rows_ones();
        assert_eq!(dfa.block_rows.len(), 4);
        assert_eq!(dfa.block_rows[0], u64::MAX);
        assert_eq!(dfa.block_rows[1], 0b11_1111);
        assert_eq!(dfa.block_rows[2], u64::MAX);
        assert_eq!(dfa.block_rows[3], 0b11_1111);
    }
}
