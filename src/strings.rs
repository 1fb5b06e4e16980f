//! Interned identifiers.
//!
//! Every name the compiler manipulates — C identifiers, TAC temporaries,
//! assembly labels, struct tags — is interned once and referred to by a
//! compact `Identifier` entity. Identifiers are cheap to copy and compare,
//! and the interner is the only place the backing strings live.
//!
//! Fresh names are minted by appending a per-namespace monotonic counter to
//! a hint, separated by [`UID_SEPARATOR`]. The label, variable, and struct
//! namespaces count independently so that dumps stay stable when one
//! namespace grows.

use cranelift_entity::{entity_impl, PrimaryMap};
use rustc_hash::FxHashMap;
use std::ops::Index;

/// An opaque reference to an interned string.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(u32);
entity_impl!(Identifier, "id");

/// Separator between a fresh-name hint and its counter.
pub const UID_SEPARATOR: &str = ".";

/// Interner for identifier strings, plus the counters used to mint fresh
/// label, variable, and struct-tag names.
pub struct StringInterner {
    strings: PrimaryMap<Identifier, String>,
    index: FxHashMap<String, Identifier>,
    label_count: u32,
    var_count: u32,
    struct_count: u32,
}

impl StringInterner {
    /// Create an empty interner.
    pub fn new() -> Self {
        Self {
            strings: PrimaryMap::new(),
            index: FxHashMap::default(),
            label_count: 0,
            var_count: 0,
            struct_count: 0,
        }
    }

    /// Intern `string`, returning the identifier it is already known under
    /// if it has been seen before.
    pub fn intern(&mut self, string: &str) -> Identifier {
        if let Some(&id) = self.index.get(string) {
            return id;
        }
        let id = self.strings.push(string.to_string());
        self.index.insert(string.to_string(), id);
        id
    }

    /// The string backing `id`.
    pub fn resolve(&self, id: Identifier) -> &str {
        &self.strings[id]
    }

    fn fresh(&mut self, hint: &str, count: u32) -> Identifier {
        let name = format!("{hint}{UID_SEPARATOR}{count}");
        self.intern(&name)
    }

    /// Mint a fresh label name from `hint`.
    pub fn label_identifier(&mut self, hint: &str) -> Identifier {
        let count = self.label_count;
        self.label_count += 1;
        self.fresh(hint, count)
    }

    /// Mint a fresh variable name from `hint`.
    pub fn var_identifier(&mut self, hint: &str) -> Identifier {
        let count = self.var_count;
        self.var_count += 1;
        self.fresh(hint, count)
    }

    /// Mint a fresh struct-tag name from `hint`.
    pub fn struct_identifier(&mut self, hint: &str) -> Identifier {
        let count = self.struct_count;
        self.struct_count += 1;
        self.fresh(hint, count)
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<Identifier> for StringInterner {
    type Output = str;

    fn index(&self, id: Identifier) -> &str {
        self.resolve(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_dedups() {
        let mut interner = StringInterner::new();
        let a = interner.intern("main");
        let b = interner.intern("main");
        let c = interner.intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&interner[a], "main");
        assert_eq!(&interner[c], "other");
    }

    #[test]
    fn fresh_names_count_per_namespace() {
        let mut interner = StringInterner::new();
        let l0 = interner.label_identifier("double");
        let l1 = interner.label_identifier("double");
        let v0 = interner.var_identifier("tmp");
        let s0 = interner.struct_identifier("anon");
        assert_eq!(&interner[l0], "double.0");
        assert_eq!(&interner[l1], "double.1");
        assert_eq!(&interner[v0], "tmp.0");
        assert_eq!(&interner[s0], "anon.0");
    }

    #[test]
    fn fresh_names_are_total_ordered() {
        let mut interner = StringInterner::new();
        let a = interner.label_identifier("l");
        let b = interner.label_identifier("l");
        assert!(a < b);
    }
}
