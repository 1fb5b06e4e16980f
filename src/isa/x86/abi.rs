//! System V classification of aggregates.
//!
//! Each struct or union is split into eight-byte slots and every slot is
//! assigned a class: `Integer` slots travel in general-purpose registers,
//! `Sse` slots in XMM registers, and `Memory` sends the whole object to the
//! stack. Anything larger than sixteen bytes is `Memory` outright, so only
//! the first two slot classes are ever meaningful.
//!
//! Classification is memoized per tag; a tag is inserted only after its
//! member types have classified, so recursive member references terminate.

use crate::ir::symbols::FrontEndSymbols;
use crate::ir::types::Type;
use crate::isa::x86::inst::AssemblyType;
use crate::strings::Identifier;
use rustc_hash::FxHashMap;

/// The ABI class of one eight-byte slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EightbyteClass {
    /// Passed in a general-purpose register.
    Integer,
    /// Passed in an XMM register.
    Sse,
    /// Passed on the stack.
    Memory,
}

/// The classification of one aggregate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StructClasses {
    /// How many eight-byte slots the aggregate occupies.
    pub eightbytes: usize,
    /// Classes of the first two slots. With more than two slots the
    /// aggregate is entirely `Memory` and these both read `Memory`.
    pub classes: [EightbyteClass; 2],
}

/// Memoized classifications, keyed by struct tag.
pub type ClassCache = FxHashMap<Identifier, StructClasses>;

fn strip_arrays(mut ty: &Type) -> &Type {
    while let Type::Array { elem, .. } = ty {
        ty = elem;
    }
    ty
}

fn classify_one_eightbyte(
    cache: &mut ClassCache,
    frontend: &FrontEndSymbols,
    tag: Identifier,
    is_union: bool,
) {
    let mut classes = [EightbyteClass::Sse, EightbyteClass::Memory];
    let typedef = frontend.struct_typedef(tag);
    let members_front = if is_union { typedef.members.len() } else { 1 };
    for i in 0..members_front {
        if classes[0] == EightbyteClass::Integer {
            break;
        }
        let member_ty = strip_arrays(&typedef.member(i).ty);
        if let Type::Structure { tag: member_tag, is_union: member_union } = member_ty {
            classify_struct(cache, frontend, *member_tag, *member_union);
            if cache[member_tag].classes[0] == EightbyteClass::Integer {
                classes[0] = EightbyteClass::Integer;
            }
        } else if !matches!(member_ty, Type::Double) {
            classes[0] = EightbyteClass::Integer;
        }
    }
    cache.insert(tag, StructClasses { eightbytes: 1, classes });
}

fn classify_two_eightbytes(
    cache: &mut ClassCache,
    frontend: &FrontEndSymbols,
    tag: Identifier,
    is_union: bool,
) {
    let mut classes = [EightbyteClass::Sse, EightbyteClass::Sse];
    let typedef = frontend.struct_typedef(tag);
    let members_front = if is_union { typedef.members.len() } else { 1 };
    for i in 0..members_front {
        if classes == [EightbyteClass::Integer, EightbyteClass::Integer] {
            break;
        }
        let mut size = 1i64;
        let mut member_ty = &typedef.member(i).ty;
        while let Type::Array { elem, size: len } = member_ty {
            size *= len;
            member_ty = elem;
        }
        match member_ty {
            Type::Structure { tag: member_tag, .. } => {
                size *= frontend.struct_typedef(*member_tag).size;
            }
            scalar => size *= i64::from(frontend.type_alignment(scalar)),
        }
        if size > 8 {
            // The member alone straddles both slots.
            if let Type::Structure { tag: member_tag, is_union: member_union } = member_ty {
                classify_struct(cache, frontend, *member_tag, *member_union);
                let member = cache[member_tag];
                if member.eightbytes > 1 {
                    if member.classes[0] == EightbyteClass::Integer {
                        classes[0] = EightbyteClass::Integer;
                    }
                    if member.classes[1] == EightbyteClass::Integer {
                        classes[1] = EightbyteClass::Integer;
                    }
                } else if member.classes[0] == EightbyteClass::Integer {
                    classes = [EightbyteClass::Integer, EightbyteClass::Integer];
                }
            } else if !matches!(member_ty, Type::Double) {
                classes = [EightbyteClass::Integer, EightbyteClass::Integer];
            }
        } else {
            if let Type::Structure { tag: member_tag, is_union: member_union } = member_ty {
                classify_struct(cache, frontend, *member_tag, *member_union);
                if cache[member_tag].classes[0] == EightbyteClass::Integer {
                    classes[0] = EightbyteClass::Integer;
                }
            } else if !matches!(member_ty, Type::Double) {
                classes[0] = EightbyteClass::Integer;
            }
            if !is_union {
                // For a struct the second slot is decided by what the last
                // member contributes.
                let back_ty = strip_arrays(&typedef.back().ty);
                if let Type::Structure { tag: back_tag, is_union: back_union } = back_ty {
                    classify_struct(cache, frontend, *back_tag, *back_union);
                    if cache[back_tag].classes[0] == EightbyteClass::Integer {
                        classes[1] = EightbyteClass::Integer;
                    }
                } else if !matches!(back_ty, Type::Double) {
                    classes[1] = EightbyteClass::Integer;
                }
            }
        }
    }
    cache.insert(tag, StructClasses { eightbytes: 2, classes });
}

/// Classify the aggregate named by `tag`, memoizing the result in `cache`.
pub fn classify_struct(
    cache: &mut ClassCache,
    frontend: &FrontEndSymbols,
    tag: Identifier,
    is_union: bool,
) {
    if cache.contains_key(&tag) {
        return;
    }
    let size = frontend.struct_typedef(tag).size;
    if size > 16 {
        cache.insert(
            tag,
            StructClasses {
                eightbytes: ((size + 7) / 8) as usize,
                classes: [EightbyteClass::Memory, EightbyteClass::Memory],
            },
        );
    } else if size > 8 {
        classify_two_eightbytes(cache, frontend, tag, is_union);
    } else {
        classify_one_eightbyte(cache, frontend, tag, is_union);
    }
}

/// The assembly type of the eight-byte slot of `tag` starting at `offset`.
///
/// A trailing slot of 2, 3, or 5–7 bytes becomes a byte array, which the
/// lowering turns into bit-accurate shift-and-or pack and unpack sequences.
pub fn eightbyte_asm_type(
    frontend: &FrontEndSymbols,
    tag: Identifier,
    offset: i64,
) -> AssemblyType {
    let size = frontend.struct_typedef(tag).size - offset;
    if size >= 8 {
        return AssemblyType::QuadWord;
    }
    match size {
        1 => AssemblyType::Byte,
        4 => AssemblyType::LongWord,
        _ => AssemblyType::ByteArray { size, alignment: 8 },
    }
}
