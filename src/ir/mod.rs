//! Intermediate representations consumed by the backend: the front-end type
//! and symbol model, and the three-address code the optimizer rewrites and
//! the assembly generator lowers.

pub mod symbols;
pub mod tac;
pub mod types;

pub use symbols::{FrontEndSymbols, IdentAttr, InitialValue, StaticInit, Symbol};
pub use types::{FunType, StructMember, StructTypedef, Type};
