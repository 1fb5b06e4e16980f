//! Front-end symbol tables consumed by the backend.
//!
//! These mirror what semantic analysis produced: a symbol table from
//! identifier to type and storage attributes, the struct typedef table, the
//! string-literal table, and the set of variables whose address was taken.

use crate::ir::types::{StructTypedef, Type};
use crate::strings::Identifier;
use rustc_hash::{FxHashMap, FxHashSet};

/// A single element of a static initializer.
#[derive(Clone, Debug, PartialEq)]
pub enum StaticInit {
    /// A `char` value.
    Char(i8),
    /// An `int` value.
    Int(i32),
    /// A `long` value.
    Long(i64),
    /// An `unsigned char` value.
    UChar(u8),
    /// An `unsigned int` value.
    UInt(u32),
    /// An `unsigned long` value.
    ULong(u64),
    /// A `double`, stored as its IEEE-754 bit pattern.
    Double(u64),
    /// A run of zero bytes.
    Zero(i64),
    /// A string literal from the string-constant table.
    String {
        /// Key into the string-constant table.
        id: Identifier,
        /// Whether a terminating NUL byte is part of the object.
        is_null_terminated: bool,
    },
    /// The address of another symbol.
    Pointer(Identifier),
}

/// The initializer state of a variable with static storage duration.
#[derive(Clone, Debug, PartialEq)]
pub enum InitialValue {
    /// Declared without an initializer; may still be defined elsewhere.
    Tentative,
    /// Fully initialized.
    Initial(Vec<StaticInit>),
    /// Extern declaration with no definition in this unit.
    NoInit,
}

/// Storage attributes attached to a symbol.
#[derive(Clone, Debug, PartialEq)]
pub enum IdentAttr {
    /// A function.
    Fun {
        /// Whether this unit contains the definition.
        is_def: bool,
        /// Whether the symbol has external linkage.
        is_glob: bool,
    },
    /// A variable with static storage duration.
    Static {
        /// Initializer state.
        init: InitialValue,
        /// Whether the symbol has external linkage.
        is_glob: bool,
    },
    /// A compiler-generated constant (string literals, float literals).
    Constant(StaticInit),
    /// A block-scope automatic variable or TAC temporary.
    Local,
}

/// A symbol-table entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Symbol {
    /// The symbol's resolved type.
    pub ty: Type,
    /// Its storage attributes.
    pub attrs: IdentAttr,
}

/// Everything the front end knows that the backend needs.
#[derive(Default)]
pub struct FrontEndSymbols {
    /// Identifier to symbol.
    pub symbol_table: FxHashMap<Identifier, Symbol>,
    /// Struct tag to layout.
    pub struct_typedef_table: FxHashMap<Identifier, StructTypedef>,
    /// String-literal id to bytes.
    pub string_const_table: FxHashMap<Identifier, Vec<i8>>,
    /// Variables whose address was taken anywhere in the program.
    pub addressed_set: FxHashSet<Identifier>,
}

impl FrontEndSymbols {
    /// An empty table set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The symbol for `name`. Panics if the front end never declared it.
    pub fn symbol(&self, name: Identifier) -> &Symbol {
        self.symbol_table
            .get(&name)
            .expect("identifier missing from symbol table")
    }

    /// The struct layout for `tag`. Panics if the tag is undeclared.
    pub fn struct_typedef(&self, tag: Identifier) -> &StructTypedef {
        self.struct_typedef_table
            .get(&tag)
            .expect("struct tag missing from typedef table")
    }

    /// Whether `name` has static storage duration.
    pub fn is_static(&self, name: Identifier) -> bool {
        matches!(self.symbol(name).attrs, IdentAttr::Static { .. })
    }

    /// The size of `ty` in bytes.
    pub fn type_size(&self, ty: &Type) -> i64 {
        match ty {
            Type::Array { elem, size } => size * self.type_size(elem),
            Type::Structure { tag, .. } => self.struct_typedef(*tag).size,
            scalar => scalar.scalar_size(),
        }
    }

    /// The ABI alignment of `ty` in bytes.
    ///
    /// Scalars align to their size. Arrays align like their element, except
    /// that an array of 16 bytes or more aligns to 16 as System V requires
    /// for top-level objects. Structures use the alignment recorded when the
    /// layout was computed.
    pub fn type_alignment(&self, ty: &Type) -> i32 {
        match ty {
            Type::Array { elem, size } => {
                if size * self.type_size(elem) >= 16 {
                    16
                } else {
                    self.type_alignment(elem)
                }
            }
            Type::Structure { tag, .. } => self.struct_typedef(*tag).alignment,
            scalar => scalar.scalar_size() as i32,
        }
    }
}
