//! The cinder code generator.
//!
//! This crate is the back half of a small C compiler for x86-64 Linux. It
//! consumes a finished three-address-code program together with the front
//! end's symbol tables, optionally runs two data-flow optimizations over
//! the TAC (copy propagation and dead-store elimination), and lowers the
//! result to an abstract x86-64 instruction stream following the System V
//! ABI. Operands come out in pseudo form; the stack-fix and register
//! allocation passes that assign them concrete locations live downstream,
//! as do the GAS emitter and everything in front of the TAC.
//!
//! The usual flow:
//!
//! ```ignore
//! let isa = isa::lookup(triple)?;
//! optimize::optimize_program(&mut tac, &frontend, flags);
//! let asm = x86::generate_assembly(tac, &mut frontend, &mut interner);
//! let backend = x86::convert_symbols(&frontend);
//! ```

#![deny(trivial_numeric_casts)]
#![warn(missing_docs, unused_import_braces, unused_extern_crates)]

pub mod copyprop;
pub mod dataflow;
pub mod dse;
pub mod flowgraph;
pub mod ir;
pub mod isa;
pub mod optimize;
pub mod result;
pub mod settings;
pub mod strings;

pub use crate::result::{CodegenError, CodegenResult};
pub use crate::settings::OptimFlags;
pub use crate::strings::{Identifier, StringInterner};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
