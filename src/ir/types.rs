//! Front-end type model.
//!
//! The semantic analyzer resolves every declaration to one of these types
//! before the backend runs. The backend never re-checks them; it only
//! dispatches on them to pick operand widths and ABI classes.

use crate::isa::RegisterMask;
use crate::strings::Identifier;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;

/// A resolved C type.
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    /// `char` (signed on this target).
    Char,
    /// `signed char`.
    SChar,
    /// `unsigned char`.
    UChar,
    /// `int`.
    Int,
    /// `unsigned int`.
    UInt,
    /// `long`.
    Long,
    /// `unsigned long`.
    ULong,
    /// `double`.
    Double,
    /// `void`.
    Void,
    /// A pointer to `ref`.
    Pointer(Box<Type>),
    /// An array of `size` elements of `elem`.
    Array {
        /// Element type.
        elem: Box<Type>,
        /// Element count.
        size: i64,
    },
    /// A struct or union, referenced by tag.
    Structure {
        /// The interned tag naming the typedef table entry.
        tag: Identifier,
        /// Whether the tag names a union.
        is_union: bool,
    },
    /// A function type.
    Fun(Box<FunType>),
}

impl Type {
    /// Whether this is an arithmetic or pointer type, i.e. fits a register.
    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            Type::Array { .. } | Type::Structure { .. } | Type::Fun(_) | Type::Void
        )
    }

    /// The size of a scalar type in bytes.
    ///
    /// Aggregates have no intrinsic size; their size lives in the struct
    /// typedef table.
    pub fn scalar_size(&self) -> i64 {
        match self {
            Type::Char | Type::SChar | Type::UChar => 1,
            Type::Int | Type::UInt => 4,
            Type::Long | Type::ULong | Type::Double | Type::Pointer(_) => 8,
            _ => panic!("no scalar size for {self:?}"),
        }
    }
}

/// A function signature, with the register-usage masks the backend computes
/// lazily the first time the function is lowered or called.
#[derive(Clone, Debug, PartialEq)]
pub struct FunType {
    /// Parameter types, in declaration order.
    pub params: Vec<Type>,
    /// Return type.
    pub ret: Type,
    /// Physical registers consumed by parameter passing, once known.
    pub param_reg_mask: Option<RegisterMask>,
    /// Physical registers carrying the return value, once known.
    pub ret_reg_mask: Option<RegisterMask>,
}

impl FunType {
    /// A signature with unset register masks.
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self {
            params,
            ret,
            param_reg_mask: None,
            ret_reg_mask: None,
        }
    }
}

/// One member of a struct or union.
#[derive(Clone, Debug, PartialEq)]
pub struct StructMember {
    /// Byte offset from the start of the aggregate. Always 0 in a union.
    pub offset: i64,
    /// The member's type.
    pub ty: Type,
}

/// The layout of a struct or union, keyed by tag in the typedef table.
///
/// Members iterate in declaration order; classification depends on it.
#[derive(Clone, Debug, PartialEq)]
pub struct StructTypedef {
    /// ABI alignment of the whole aggregate.
    pub alignment: i32,
    /// Total size in bytes, padding included.
    pub size: i64,
    /// Members by name, in declaration order.
    pub members: IndexMap<Identifier, StructMember, FxBuildHasher>,
}

impl StructTypedef {
    /// The member at declaration position `index`.
    pub fn member(&self, index: usize) -> &StructMember {
        self.members
            .get_index(index)
            .map(|(_, member)| member)
            .expect("struct member index out of range")
    }

    /// The last declared member.
    pub fn back(&self) -> &StructMember {
        self.members
            .last()
            .map(|(_, member)| member)
            .expect("struct typedef has no members")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_sizes() {
        assert_eq!(Type::Char.scalar_size(), 1);
        assert_eq!(Type::UInt.scalar_size(), 4);
        assert_eq!(Type::Double.scalar_size(), 8);
        assert_eq!(Type::Pointer(Box::new(Type::Void)).scalar_size(), 8);
    }

    #[test]
    fn scalar_predicate() {
        assert!(Type::ULong.is_scalar());
        assert!(Type::Pointer(Box::new(Type::Int)).is_scalar());
        assert!(!Type::Array { elem: Box::new(Type::Int), size: 3 }.is_scalar());
        assert!(!Type::Void.is_scalar());
    }
}
