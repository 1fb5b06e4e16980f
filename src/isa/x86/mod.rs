//! The x86-64 System V backend.

pub mod abi;
pub mod inst;
pub mod lower;
pub mod symt;

pub use abi::{classify_struct, eightbyte_asm_type, ClassCache, EightbyteClass, StructClasses};
pub use inst::{
    AsmBinaryOp, AsmFunction, AsmInstruction, AsmProgram, AsmStaticConstant, AsmStaticVariable,
    AsmTopLevel, AsmUnaryOp, AssemblyType, CondCode, Operand,
};
pub use lower::generate_assembly;
pub use symt::{backend_asm_type, convert_symbols, BackendSymbol, BackendSymbols};
