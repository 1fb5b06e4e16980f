//! Backend symbol table.
//!
//! After lowering, every front-end symbol is mirrored into a backend entry
//! carrying just what the stack-fix and register-allocation passes need: an
//! assembly type for objects, and a definition flag plus callee-saved list
//! for functions.

use crate::ir::symbols::{FrontEndSymbols, IdentAttr};
use crate::ir::types::Type;
use crate::isa::x86::inst::{AssemblyType, Operand};
use crate::strings::Identifier;
use rustc_hash::FxHashMap;

/// A backend symbol-table entry.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendSymbol {
    /// A data object.
    Obj {
        /// Operand width, or a byte array for aggregates.
        asm_type: AssemblyType,
        /// Whether the object has static storage duration.
        is_static: bool,
        /// Whether the object is a read-only constant.
        is_const: bool,
    },
    /// A function.
    Fun {
        /// Whether this unit holds the definition.
        is_def: bool,
        /// Callee-saved registers in use, filled in by register allocation.
        callee_saved: Vec<Operand>,
    },
}

/// The backend symbol table.
#[derive(Default)]
pub struct BackendSymbols {
    /// Identifier to backend symbol.
    pub table: FxHashMap<Identifier, BackendSymbol>,
}

/// The assembly type of a front-end type.
///
/// Scalars map to their width, aggregates to a byte array spanning the whole
/// object with the object's ABI alignment.
pub fn asm_type_of(frontend: &FrontEndSymbols, ty: &Type) -> AssemblyType {
    match ty {
        Type::Char | Type::SChar | Type::UChar => AssemblyType::Byte,
        Type::Int | Type::UInt => AssemblyType::LongWord,
        Type::Long | Type::ULong | Type::Pointer(_) => AssemblyType::QuadWord,
        Type::Double => AssemblyType::Double,
        Type::Array { .. } | Type::Structure { .. } => AssemblyType::ByteArray {
            size: frontend.type_size(ty),
            alignment: frontend.type_alignment(ty),
        },
        Type::Void | Type::Fun(_) => panic!("type {ty:?} has no assembly type"),
    }
}

/// The assembly type of the variable `name`.
pub fn backend_asm_type(frontend: &FrontEndSymbols, name: Identifier) -> AssemblyType {
    asm_type_of(frontend, &frontend.symbol(name).ty)
}

/// Derive the backend symbol table from the front-end one.
pub fn convert_symbols(frontend: &FrontEndSymbols) -> BackendSymbols {
    let mut backend = BackendSymbols::default();
    for (&name, symbol) in &frontend.symbol_table {
        let entry = match (&symbol.ty, &symbol.attrs) {
            (Type::Fun(_), IdentAttr::Fun { is_def, .. }) => BackendSymbol::Fun {
                is_def: *is_def,
                callee_saved: Vec::new(),
            },
            (ty, attrs) => BackendSymbol::Obj {
                asm_type: asm_type_of(frontend, ty),
                is_static: matches!(
                    attrs,
                    IdentAttr::Static { .. } | IdentAttr::Constant(_)
                ),
                is_const: matches!(attrs, IdentAttr::Constant(_)),
            },
        };
        backend.table.insert(name, entry);
    }
    backend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::symbols::{InitialValue, StaticInit, Symbol};
    use crate::ir::types::{FunType, StructMember, StructTypedef};
    use crate::strings::StringInterner;
    use indexmap::IndexMap;

    #[test]
    fn widths_agree_with_the_front_end_types() {
        let mut interner = StringInterner::new();
        let mut frontend = FrontEndSymbols::new();

        let tag = interner.struct_identifier("pair");
        let mut members = IndexMap::default();
        members.insert(
            interner.intern("a"),
            StructMember { offset: 0, ty: Type::Double },
        );
        members.insert(
            interner.intern("b"),
            StructMember { offset: 8, ty: Type::Double },
        );
        frontend
            .struct_typedef_table
            .insert(tag, StructTypedef { alignment: 8, size: 16, members });

        for (name, ty, expect) in [
            ("c", Type::Char, AssemblyType::Byte),
            ("i", Type::Int, AssemblyType::LongWord),
            ("l", Type::ULong, AssemblyType::QuadWord),
            ("p", Type::Pointer(Box::new(Type::Double)), AssemblyType::QuadWord),
            ("d", Type::Double, AssemblyType::Double),
            (
                "s",
                Type::Structure { tag, is_union: false },
                AssemblyType::ByteArray { size: 16, alignment: 8 },
            ),
            (
                "arr",
                Type::Array { elem: Box::new(Type::Int), size: 3 },
                AssemblyType::ByteArray { size: 12, alignment: 4 },
            ),
        ] {
            let id = interner.intern(name);
            frontend
                .symbol_table
                .insert(id, Symbol { ty: ty.clone(), attrs: IdentAttr::Local });
            let asm_type = backend_asm_type(&frontend, id);
            assert_eq!(asm_type, expect);
            assert_eq!(asm_type.size(), frontend.type_size(&ty));
        }
    }

    #[test]
    fn conversion_tracks_storage() {
        let mut interner = StringInterner::new();
        let mut frontend = FrontEndSymbols::new();

        let f = interner.intern("f");
        frontend.symbol_table.insert(
            f,
            Symbol {
                ty: Type::Fun(Box::new(FunType::new(vec![], Type::Void))),
                attrs: IdentAttr::Fun { is_def: true, is_glob: true },
            },
        );
        let g = interner.intern("g");
        frontend.symbol_table.insert(
            g,
            Symbol {
                ty: Type::Long,
                attrs: IdentAttr::Static { init: InitialValue::Tentative, is_glob: false },
            },
        );
        let k = interner.intern("k");
        frontend.symbol_table.insert(
            k,
            Symbol {
                ty: Type::Double,
                attrs: IdentAttr::Constant(StaticInit::Double(0)),
            },
        );

        let backend = convert_symbols(&frontend);
        assert_eq!(
            backend.table[&f],
            BackendSymbol::Fun { is_def: true, callee_saved: vec![] }
        );
        assert_eq!(
            backend.table[&g],
            BackendSymbol::Obj {
                asm_type: AssemblyType::QuadWord,
                is_static: true,
                is_const: false
            }
        );
        assert_eq!(
            backend.table[&k],
            BackendSymbol::Obj {
                asm_type: AssemblyType::Double,
                is_static: true,
                is_const: true
            }
        );
    }
}
