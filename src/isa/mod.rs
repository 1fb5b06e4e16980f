//! Target instruction-set descriptions.
//!
//! One target is supported: x86-64 under the System V ABI on Linux. The
//! physical register model and the register-mask bitset live here because
//! the front-end function types carry register-usage masks; everything else
//! about the target lives in [`x86`].

pub mod x86;

use crate::result::{CodegenError, CodegenResult};
use core::fmt;
use target_lexicon::{Architecture, OperatingSystem, Triple};

/// A physical x86-64 register.
///
/// The discriminants are the backend's register numbering: general-purpose
/// registers first, then the stack and frame pointers, then the sixteen SSE
/// registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Reg {
    Ax = 0,
    Bx,
    Cx,
    Dx,
    Di,
    Si,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Sp,
    Bp,
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

impl Reg {
    /// This register's position in the 32-register numbering.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Whether this is an SSE register.
    pub fn is_sse(self) -> bool {
        self.number() >= Reg::Xmm0.number()
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Integer-class argument registers, in ABI order.
pub const INT_ARG_REGS: [Reg; 6] = [Reg::Di, Reg::Si, Reg::Dx, Reg::Cx, Reg::R8, Reg::R9];

/// SSE-class argument registers, in ABI order.
pub const SSE_ARG_REGS: [Reg; 8] = [
    Reg::Xmm0,
    Reg::Xmm1,
    Reg::Xmm2,
    Reg::Xmm3,
    Reg::Xmm4,
    Reg::Xmm5,
    Reg::Xmm6,
    Reg::Xmm7,
];

/// Registers the callee must preserve.
pub const CALLEE_SAVED_REGS: [Reg; 6] =
    [Reg::Bx, Reg::R12, Reg::R13, Reg::R14, Reg::R15, Reg::Bp];

/// A set of physical registers as a 32-bit-wide bitset in a `u64`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterMask(u64);

impl RegisterMask {
    /// The empty set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Whether `reg` is in the set.
    pub fn contains(self, reg: Reg) -> bool {
        self.0 & (1 << reg.number()) != 0
    }

    /// Add or remove `reg`.
    pub fn set(&mut self, reg: Reg, value: bool) {
        if value {
            self.0 |= 1 << reg.number();
        } else {
            self.0 &= !(1 << reg.number());
        }
    }

    /// The raw bits.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// How many registers the set holds.
    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// A descriptor for the one supported target.
pub struct TargetIsa {
    triple: Triple,
}

impl TargetIsa {
    /// The triple this descriptor was created for.
    pub fn triple(&self) -> &Triple {
        &self.triple
    }

    /// Bytes in a pointer.
    pub fn pointer_bytes(&self) -> u8 {
        8
    }
}

/// Look up the target descriptor for `triple`.
///
/// Anything other than x86-64 Linux is rejected; the backend hard-codes the
/// System V classification and register conventions.
pub fn lookup(triple: Triple) -> CodegenResult<TargetIsa> {
    match (&triple.architecture, &triple.operating_system) {
        (Architecture::X86_64, OperatingSystem::Linux) => Ok(TargetIsa { triple }),
        _ => Err(CodegenError::Unsupported(triple)),
    }
}

/// Look up the target descriptor for the host.
pub fn lookup_host() -> CodegenResult<TargetIsa> {
    lookup(Triple::host())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn register_numbering() {
        // The numbering is not the hardware encoding; it is the backend's
        // own order, GPRs then SP/BP then XMMs.
        assert_eq!(Reg::Ax.number(), 0);
        assert_eq!(Reg::Di.number(), 4);
        assert_eq!(Reg::Si.number(), 5);
        assert_eq!(Reg::Sp.number(), 14);
        assert_eq!(Reg::Bp.number(), 15);
        assert_eq!(Reg::Xmm0.number(), 16);
        assert_eq!(Reg::Xmm15.number(), 31);
        assert!(Reg::Xmm0.is_sse());
        assert!(!Reg::Bp.is_sse());
    }

    #[test]
    fn register_mask_set_and_get() {
        let mut mask = RegisterMask::empty();
        assert!(mask.is_empty());
        mask.set(Reg::Di, true);
        mask.set(Reg::Xmm1, true);
        assert!(mask.contains(Reg::Di));
        assert!(mask.contains(Reg::Xmm1));
        assert!(!mask.contains(Reg::Si));
        assert_eq!(mask.len(), 2);
        mask.set(Reg::Di, false);
        assert!(!mask.contains(Reg::Di));
        assert_eq!(mask.bits(), 1 << Reg::Xmm1.number());
    }

    #[test]
    fn lookup_accepts_only_x86_64_linux() {
        let linux = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
        assert_eq!(lookup(linux).unwrap().pointer_bytes(), 8);

        let arm = Triple::from_str("aarch64-unknown-linux-gnu").unwrap();
        assert!(matches!(lookup(arm), Err(CodegenError::Unsupported(_))));

        let windows = Triple::from_str("x86_64-pc-windows-msvc").unwrap();
        assert!(lookup(windows).is_err());
    }
}
