//! The TAC-level optimization driver.
//!
//! Owns the control-flow graph and data-flow buffers and runs the enabled
//! passes over each function until the instruction stream stops changing.
//! Copy propagation can expose dead stores and dead-store elimination can
//! expose further copies, so the passes alternate to a joint fixed point.

use crate::copyprop::propagate_copies;
use crate::dataflow::DataFlow;
use crate::dse::eliminate_dead_stores;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::symbols::FrontEndSymbols;
use crate::ir::tac::{Function, TacProgram};
use crate::settings::OptimFlags;
use log::debug;

/// Reusable pass state for optimizing a whole program.
pub struct Optimizer {
    flags: OptimFlags,
    cfg: ControlFlowGraph,
    dfa: DataFlow,
}

impl Optimizer {
    /// An optimizer running the passes selected by `flags`.
    pub fn new(flags: OptimFlags) -> Self {
        Self {
            flags,
            cfg: ControlFlowGraph::new(),
            dfa: DataFlow::new(),
        }
    }

    /// Optimize every function of `program` in place.
    pub fn run(&mut self, program: &mut TacProgram, frontend: &FrontEndSymbols) {
        if !self.flags.any() {
            return;
        }
        for fun in &mut program.funs {
            self.run_fun(fun, frontend);
        }
    }

    fn run_fun(&mut self, fun: &mut Function, frontend: &FrontEndSymbols) {
        debug!("optimizing function {} ({} instructions)", fun.name, fun.body.len());
        loop {
            self.cfg.build(&fun.body);
            let mut changed = false;
            if self.flags.copy_propagation {
                changed |= propagate_copies(&mut fun.body, &mut self.cfg, &mut self.dfa, frontend);
            }
            if self.flags.dead_store_elimination {
                changed |=
                    eliminate_dead_stores(&mut fun.body, &mut self.cfg, &mut self.dfa, frontend);
            }
            if !changed {
                break;
            }
        }
    }
}

/// Run the selected TAC-level optimizations over `program`.
pub fn optimize_program(
    program: &mut TacProgram,
    frontend: &FrontEndSymbols,
    flags: OptimFlags,
) {
    Optimizer::new(flags).run(program, frontend);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::symbols::{IdentAttr, Symbol};
    use crate::ir::tac::{Constant, Instruction, Value};
    use crate::ir::types::Type;
    use crate::strings::StringInterner;

    #[test]
    fn passes_alternate_to_a_joint_fixed_point() {
        let mut interner = StringInterner::new();
        let mut frontend = FrontEndSymbols::new();
        let mut var = |name: &str| {
            let id = interner.intern(name);
            frontend
                .symbol_table
                .insert(id, Symbol { ty: Type::Int, attrs: IdentAttr::Local });
            id
        };
        let x = var("x");
        let y = var("y");
        let f = interner.intern("f");

        // x = 5; y = x; return y. Copy propagation folds the chain and
        // dead-store elimination then strips both assignments.
        let mut program = TacProgram {
            funs: vec![Function {
                name: f,
                is_glob: true,
                params: vec![],
                body: vec![
                    Some(Instruction::Copy {
                        src: Value::Constant(Constant::Int(5)),
                        dst: Value::Var(x),
                    }),
                    Some(Instruction::Copy { src: Value::Var(x), dst: Value::Var(y) }),
                    Some(Instruction::Return(Some(Value::Var(y)))),
                ],
            }],
            ..Default::default()
        };

        optimize_program(&mut program, &frontend, OptimFlags::all());

        let body = &program.funs[0].body;
        assert_eq!(body[0], None);
        assert_eq!(body[1], None);
        assert_eq!(
            body[2],
            Some(Instruction::Return(Some(Value::Constant(Constant::Int(5)))))
        );
    }

    #[test]
    fn disabled_flags_leave_the_program_alone() {
        let mut interner = StringInterner::new();
        let mut frontend = FrontEndSymbols::new();
        let x = interner.intern("x");
        frontend
            .symbol_table
            .insert(x, Symbol { ty: Type::Int, attrs: IdentAttr::Local });
        let f = interner.intern("f");
        let body = vec![
            Some(Instruction::Copy {
                src: Value::Constant(Constant::Int(1)),
                dst: Value::Var(x),
            }),
            Some(Instruction::Return(None)),
        ];
        let mut program = TacProgram {
            funs: vec![Function { name: f, is_glob: true, params: vec![], body: body.clone() }],
            ..Default::default()
        };
        optimize_program(&mut program, &frontend, OptimFlags::from_mask(0));
        assert_eq!(program.funs[0].body, body);
    }
}
