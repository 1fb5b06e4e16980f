//! Lowering from three-address code to abstract x86-64 assembly.
//!
//! One TAC instruction becomes zero or more assembly instructions. Operands
//! come out in pseudo form; the stack-fix pass assigns them locations later.
//! The interesting parts are the System V placement of aggregate arguments
//! and return values, and the correctly rounded conversion sequences between
//! `double` and unsigned integers.
//!
//! Double literals are interned into a read-only constant pool as they are
//! encountered; each distinct bit pattern gets exactly one label.

use crate::ir::symbols::{FrontEndSymbols, IdentAttr, StaticInit};
use crate::ir::tac::{self, BinaryOp, Constant, TacProgram, UnaryOp, Value};
use crate::ir::types::Type;
use crate::isa::x86::abi::{classify_struct, eightbyte_asm_type, ClassCache, EightbyteClass};
use crate::isa::x86::inst::{
    AsmBinaryOp, AsmFunction, AsmInstruction, AsmProgram, AsmStaticConstant, AsmStaticVariable,
    AsmTopLevel, AsmUnaryOp, AssemblyType, CondCode, Operand,
};
use crate::isa::{Reg, RegisterMask, INT_ARG_REGS, SSE_ARG_REGS};
use crate::strings::{Identifier, StringInterner};
use log::{debug, trace};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::mem;

/// Bit pattern of `-0.0`, the mask `xorpd` uses to negate a double.
const DBL_SIGN_MASK: u64 = 0x8000_0000_0000_0000;

/// Bit pattern of `2^63` as a double, the pivot of the unsigned conversion
/// sequences.
const DBL_UPPER_BOUND: u64 = 0x43E0_0000_0000_0000;

/// Lower `tac` to an assembly program.
///
/// The TAC program is consumed. `frontend` is updated in place: function
/// types receive their register-usage masks and `GetAddress` sources join
/// the addressed set.
pub fn generate_assembly(
    tac: TacProgram,
    frontend: &mut FrontEndSymbols,
    interner: &mut StringInterner,
) -> AsmProgram {
    debug!(
        "lowering {} functions, {} static variables",
        tac.funs.len(),
        tac.static_vars.len()
    );
    let mut gen = AsmGen {
        frontend,
        interner,
        fun_name: None,
        dbl_const_pool: FxHashMap::default(),
        class_cache: ClassCache::default(),
        instrs: Vec::new(),
        static_consts: Vec::new(),
    };

    gen.static_consts = Vec::with_capacity(tac.static_consts.len());
    for constant in tac.static_consts {
        let lowered = gen.gen_static_constant(constant);
        gen.static_consts.push(lowered);
    }

    let mut top_levels = Vec::with_capacity(tac.static_vars.len() + tac.funs.len());
    for var in tac.static_vars {
        top_levels.push(gen.gen_static_variable(var));
    }
    for fun in tac.funs {
        top_levels.push(gen.gen_function(fun));
    }

    AsmProgram { static_consts: gen.static_consts, top_levels }
}

struct AsmGen<'a> {
    frontend: &'a mut FrontEndSymbols,
    interner: &'a mut StringInterner,
    fun_name: Option<Identifier>,
    dbl_const_pool: FxHashMap<u64, Identifier>,
    class_cache: ClassCache,
    instrs: Vec<AsmInstruction>,
    static_consts: Vec<AsmTopLevel>,
}

fn chunk_type(size: i64) -> (AssemblyType, i64) {
    if size >= 8 {
        (AssemblyType::QuadWord, 8)
    } else if size >= 4 {
        (AssemblyType::LongWord, 4)
    } else {
        (AssemblyType::Byte, 1)
    }
}

fn imm_byte(value: u64) -> Operand {
    Operand::Imm { value, is_byte: true, is_quad: false, is_neg: false }
}

fn alloc_stack_bytes(bytes: i64) -> AsmInstruction {
    AsmInstruction::Binary {
        op: AsmBinaryOp::Sub,
        ty: AssemblyType::QuadWord,
        src: Operand::imm_signed(bytes),
        dst: Operand::reg(Reg::Sp),
    }
}

impl<'a> AsmGen<'a> {
    fn push(&mut self, instr: AsmInstruction) {
        self.instrs.push(instr);
    }

    /// Redirect pushed instructions into `buf` for the duration of `f`.
    fn with_sink<F: FnOnce(&mut Self)>(&mut self, buf: &mut Vec<AsmInstruction>, f: F) {
        mem::swap(&mut self.instrs, buf);
        f(self);
        mem::swap(&mut self.instrs, buf);
    }

    // ------------------------------------------------------------------
    // Operands and types

    fn dbl_static_const_operand(&mut self, bits: u64, alignment: i32) -> Operand {
        let label = match self.dbl_const_pool.get(&bits) {
            Some(&label) => label,
            None => {
                let label = self.interner.label_identifier("double");
                self.dbl_const_pool.insert(bits, label);
                self.static_consts.push(AsmTopLevel::StaticConstant(AsmStaticConstant {
                    name: label,
                    alignment,
                    init: StaticInit::Double(bits),
                }));
                label
            }
        };
        Operand::Data { name: label, offset: 0 }
    }

    fn dbl_const_operand(&mut self, value: f64) -> Operand {
        let bits = value.to_bits();
        let alignment = if bits == DBL_SIGN_MASK { 16 } else { 8 };
        self.dbl_static_const_operand(bits, alignment)
    }

    fn const_operand(&mut self, constant: Constant) -> Operand {
        match constant {
            Constant::Char(v) => Operand::Imm {
                value: v as u64,
                is_byte: true,
                is_quad: false,
                is_neg: v < 0,
            },
            Constant::Int(v) => Operand::Imm {
                value: v as u64,
                is_byte: (-128..=127).contains(&v),
                is_quad: false,
                is_neg: v < 0,
            },
            Constant::Long(v) => Operand::imm_signed(v),
            Constant::UChar(v) => imm_byte(u64::from(v)),
            Constant::UInt(v) => Operand::Imm {
                value: u64::from(v),
                is_byte: v <= 255,
                is_quad: v > i32::MAX as u32,
                is_neg: false,
            },
            Constant::ULong(v) => Operand::Imm {
                value: v,
                is_byte: v <= 255,
                is_quad: v > i32::MAX as u64,
                is_neg: false,
            },
            Constant::Double(v) => self.dbl_const_operand(v),
        }
    }

    fn value_operand(&mut self, value: &Value) -> Operand {
        match value {
            Value::Constant(constant) => self.const_operand(*constant),
            Value::Var(name) => match self.frontend.symbol(*name).ty {
                Type::Array { .. } | Type::Structure { .. } => {
                    Operand::PseudoMem { name: *name, offset: 0 }
                }
                _ => Operand::Pseudo(*name),
            },
        }
    }

    fn value_asm_type(&self, value: &Value) -> AssemblyType {
        match value {
            Value::Constant(constant) => match constant {
                Constant::Char(_) | Constant::UChar(_) => AssemblyType::Byte,
                Constant::Int(_) | Constant::UInt(_) => AssemblyType::LongWord,
                Constant::Long(_) | Constant::ULong(_) => AssemblyType::QuadWord,
                Constant::Double(_) => AssemblyType::Double,
            },
            Value::Var(name) => super::symt::backend_asm_type(&*self.frontend, *name),
        }
    }

    fn is_value_signed(&self, value: &Value) -> bool {
        match value {
            Value::Constant(constant) => matches!(
                constant,
                Constant::Char(_) | Constant::Int(_) | Constant::Long(_)
            ),
            Value::Var(name) => matches!(
                self.frontend.symbol(*name).ty,
                Type::Char | Type::SChar | Type::Int | Type::Long | Type::Double
            ),
        }
    }

    fn is_value_1b(&self, value: &Value) -> bool {
        match value {
            Value::Constant(constant) => {
                matches!(constant, Constant::Char(_) | Constant::UChar(_))
            }
            Value::Var(name) => matches!(
                self.frontend.symbol(*name).ty,
                Type::Char | Type::SChar | Type::UChar
            ),
        }
    }

    fn is_value_4b(&self, value: &Value) -> bool {
        match value {
            Value::Constant(constant) => {
                matches!(constant, Constant::Int(_) | Constant::UInt(_))
            }
            Value::Var(name) => {
                matches!(self.frontend.symbol(*name).ty, Type::Int | Type::UInt)
            }
        }
    }

    fn is_value_dbl(&self, value: &Value) -> bool {
        match value {
            Value::Constant(constant) => matches!(constant, Constant::Double(_)),
            Value::Var(name) => matches!(self.frontend.symbol(*name).ty, Type::Double),
        }
    }

    fn is_value_struct(&self, value: &Value) -> bool {
        match value {
            Value::Constant(_) => false,
            Value::Var(name) => {
                matches!(self.frontend.symbol(*name).ty, Type::Structure { .. })
            }
        }
    }

    /// The struct tag and union flag of a struct-typed variable.
    fn struct_of(&self, name: Identifier) -> (Identifier, bool) {
        match self.frontend.symbol(name).ty {
            Type::Structure { tag, is_union } => (tag, is_union),
            ref other => panic!("expected structure type, found {other:?}"),
        }
    }

    fn classify(&mut self, tag: Identifier, is_union: bool) -> crate::isa::x86::abi::StructClasses {
        classify_struct(&mut self.class_cache, self.frontend, tag, is_union);
        self.class_cache[&tag]
    }

    fn struct_size(&self, tag: Identifier) -> i64 {
        self.frontend.struct_typedef(tag).size
    }

    // ------------------------------------------------------------------
    // Operators and condition codes

    fn signed_cond_code(op: BinaryOp) -> CondCode {
        match op {
            BinaryOp::Equal => CondCode::E,
            BinaryOp::NotEqual => CondCode::Ne,
            BinaryOp::LessThan => CondCode::L,
            BinaryOp::LessOrEqual => CondCode::Le,
            BinaryOp::GreaterThan => CondCode::G,
            BinaryOp::GreaterOrEqual => CondCode::Ge,
            _ => panic!("{op:?} is not a comparison"),
        }
    }

    fn unsigned_cond_code(op: BinaryOp) -> CondCode {
        match op {
            BinaryOp::Equal => CondCode::E,
            BinaryOp::NotEqual => CondCode::Ne,
            BinaryOp::LessThan => CondCode::B,
            BinaryOp::LessOrEqual => CondCode::Be,
            BinaryOp::GreaterThan => CondCode::A,
            BinaryOp::GreaterOrEqual => CondCode::Ae,
            _ => panic!("{op:?} is not a comparison"),
        }
    }

    fn asm_unop(op: UnaryOp) -> AsmUnaryOp {
        match op {
            UnaryOp::Complement => AsmUnaryOp::Not,
            UnaryOp::Negate => AsmUnaryOp::Neg,
            UnaryOp::Not => panic!("logical not lowers through a comparison"),
        }
    }

    fn asm_binop(op: BinaryOp) -> AsmBinaryOp {
        match op {
            BinaryOp::Add => AsmBinaryOp::Add,
            BinaryOp::Subtract => AsmBinaryOp::Sub,
            BinaryOp::Multiply => AsmBinaryOp::Mult,
            BinaryOp::Divide => AsmBinaryOp::DivDouble,
            BinaryOp::BitAnd => AsmBinaryOp::BitAnd,
            BinaryOp::BitOr => AsmBinaryOp::BitOr,
            BinaryOp::BitXor => AsmBinaryOp::BitXor,
            BinaryOp::BitShiftLeft => AsmBinaryOp::BitShiftLeft,
            BinaryOp::BitShiftRight => AsmBinaryOp::BitShiftRight,
            BinaryOp::BitShrArithmetic => AsmBinaryOp::BitShrArithmetic,
            other => panic!("{other:?} has no direct assembly operator"),
        }
    }

    // ------------------------------------------------------------------
    // Register-usage masks

    fn fun_type_masks(
        &mut self,
        name: Identifier,
    ) -> (&mut Option<RegisterMask>, &mut Option<RegisterMask>) {
        match &mut self
            .frontend
            .symbol_table
            .get_mut(&name)
            .expect("function missing from symbol table")
            .ty
        {
            Type::Fun(fun_type) => (&mut fun_type.param_reg_mask, &mut fun_type.ret_reg_mask),
            other => panic!("expected function type, found {other:?}"),
        }
    }

    fn set_param_reg_mask(&mut self, name: Identifier, reg_size: usize, sse_size: usize) {
        let (param_mask, _) = self.fun_type_masks(name);
        if param_mask.is_none() {
            let mut mask = RegisterMask::empty();
            for &reg in &INT_ARG_REGS[..reg_size] {
                mask.set(reg, true);
            }
            for &reg in &SSE_ARG_REGS[..sse_size] {
                mask.set(reg, true);
            }
            *param_mask = Some(mask);
        }
    }

    fn set_ret_1_reg_mask(&mut self, name: Identifier, is_int: bool) {
        let (_, ret_mask) = self.fun_type_masks(name);
        if ret_mask.is_none() {
            let mut mask = RegisterMask::empty();
            mask.set(if is_int { Reg::Ax } else { Reg::Xmm0 }, true);
            *ret_mask = Some(mask);
        }
    }

    fn set_ret_2_reg_mask(&mut self, name: Identifier, int_first: bool, sse_second: bool) {
        let (_, ret_mask) = self.fun_type_masks(name);
        if ret_mask.is_none() {
            let mut mask = RegisterMask::empty();
            if int_first {
                mask.set(Reg::Ax, true);
                mask.set(if sse_second { Reg::Xmm0 } else { Reg::Dx }, true);
            } else if sse_second {
                mask.set(Reg::Xmm0, true);
                mask.set(Reg::Xmm1, true);
            }
            *ret_mask = Some(mask);
        }
    }

    // ------------------------------------------------------------------
    // Aggregate transport

    /// Copy `size` bytes between two byte-addressed locations in quad, long,
    /// and byte strides.
    fn copy_bytes(
        &mut self,
        mut size: i64,
        src: impl Fn(i64) -> Operand,
        dst: impl Fn(i64) -> Operand,
    ) {
        let mut offset = 0;
        while size > 0 {
            let (ty, step) = chunk_type(size);
            self.push(AsmInstruction::Mov { ty, src: src(offset), dst: dst(offset) });
            size -= step;
            offset += step;
        }
    }

    /// Move the eight-byte of `name` at `offset` into `arg_reg`.
    ///
    /// SSE slots (`struct_tag` absent) move as doubles. Integer slots move
    /// as their eight-byte type; a trailing partial slot is assembled
    /// byte-by-byte from the high end down, shifting left between bytes.
    fn move_8b_to_reg(
        &mut self,
        name: Identifier,
        offset: i64,
        struct_tag: Option<Identifier>,
        arg_reg: Reg,
    ) {
        let dst = Operand::reg(arg_reg);
        let ty = match struct_tag {
            Some(tag) => eightbyte_asm_type(self.frontend, tag, offset),
            None => AssemblyType::Double,
        };
        if let AssemblyType::ByteArray { size, .. } = ty {
            let mut off = offset + size - 1;
            while off > offset {
                self.push(AsmInstruction::Mov {
                    ty: AssemblyType::Byte,
                    src: Operand::PseudoMem { name, offset: off },
                    dst: dst.clone(),
                });
                self.push(AsmInstruction::Binary {
                    op: AsmBinaryOp::BitShiftLeft,
                    ty: AssemblyType::QuadWord,
                    src: imm_byte(8),
                    dst: dst.clone(),
                });
                off -= 1;
            }
            self.push(AsmInstruction::Mov {
                ty: AssemblyType::Byte,
                src: Operand::PseudoMem { name, offset },
                dst,
            });
        } else {
            self.push(AsmInstruction::Mov {
                ty,
                src: Operand::PseudoMem { name, offset },
                dst,
            });
        }
    }

    /// Move `arg_reg` into the eight-byte of `name` at `offset`, the inverse
    /// of [`Self::move_8b_to_reg`]. Partial slots disassemble from the low
    /// byte up, shifting right between bytes.
    fn move_reg_to_8b(
        &mut self,
        name: Identifier,
        offset: i64,
        struct_tag: Option<Identifier>,
        arg_reg: Reg,
    ) {
        let src = Operand::reg(arg_reg);
        let ty = match struct_tag {
            Some(tag) => eightbyte_asm_type(self.frontend, tag, offset),
            None => AssemblyType::Double,
        };
        if let AssemblyType::ByteArray { size, .. } = ty {
            let last = offset + size - 1;
            for off in offset..last {
                self.push(AsmInstruction::Mov {
                    ty: AssemblyType::Byte,
                    src: src.clone(),
                    dst: Operand::PseudoMem { name, offset: off },
                });
                self.push(AsmInstruction::Binary {
                    op: AsmBinaryOp::BitShiftRight,
                    ty: AssemblyType::QuadWord,
                    src: imm_byte(8),
                    dst: src.clone(),
                });
            }
            self.push(AsmInstruction::Mov {
                ty: AssemblyType::Byte,
                src,
                dst: Operand::PseudoMem { name, offset: last },
            });
        } else {
            self.push(AsmInstruction::Mov {
                ty,
                src,
                dst: Operand::PseudoMem { name, offset },
            });
        }
    }

    // ------------------------------------------------------------------
    // Return

    fn ret_struct_instr(&mut self, value: &Value) {
        let fun = self.fun_name.expect("return outside a function");
        let name = value.var().expect("struct return value must be a variable");
        let (tag, is_union) = self.struct_of(name);
        let classes = self.classify(tag, is_union);
        if classes.classes[0] == EightbyteClass::Memory {
            // The hidden return pointer was stashed at -8(%rbp) on entry.
            self.push(AsmInstruction::Mov {
                ty: AssemblyType::QuadWord,
                src: Operand::memory(Reg::Bp, -8),
                dst: Operand::reg(Reg::Ax),
            });
            self.set_ret_1_reg_mask(fun, true);
            self.copy_bytes(
                self.struct_size(tag),
                |offset| Operand::PseudoMem { name, offset },
                |offset| Operand::memory(Reg::Ax, offset),
            );
        } else {
            let int_first = match classes.classes[0] {
                EightbyteClass::Integer => {
                    self.move_8b_to_reg(name, 0, Some(tag), Reg::Ax);
                    true
                }
                EightbyteClass::Sse => {
                    self.move_8b_to_reg(name, 0, None, Reg::Xmm0);
                    false
                }
                EightbyteClass::Memory => unreachable!(),
            };
            if classes.eightbytes == 2 {
                let mut sse_second = !int_first;
                match classes.classes[1] {
                    EightbyteClass::Integer => {
                        let reg = if int_first { Reg::Dx } else { Reg::Ax };
                        self.move_8b_to_reg(name, 8, Some(tag), reg);
                    }
                    EightbyteClass::Sse => {
                        let reg = if sse_second { Reg::Xmm1 } else { Reg::Xmm0 };
                        self.move_8b_to_reg(name, 8, None, reg);
                        sse_second = true;
                    }
                    EightbyteClass::Memory => unreachable!(),
                }
                self.set_ret_2_reg_mask(fun, int_first, sse_second);
            } else {
                self.set_ret_1_reg_mask(fun, int_first);
            }
        }
    }

    fn ret_instr(&mut self, value: &Option<Value>) {
        let fun = self.fun_name.expect("return outside a function");
        match value {
            Some(v) if self.is_value_dbl(v) => {
                let src = self.value_operand(v);
                self.push(AsmInstruction::Mov {
                    ty: AssemblyType::Double,
                    src,
                    dst: Operand::reg(Reg::Xmm0),
                });
                self.set_ret_1_reg_mask(fun, false);
            }
            Some(v) if !self.is_value_struct(v) => {
                let ty = self.value_asm_type(v);
                let src = self.value_operand(v);
                self.push(AsmInstruction::Mov { ty, src, dst: Operand::reg(Reg::Ax) });
                self.set_ret_1_reg_mask(fun, true);
            }
            Some(v) => self.ret_struct_instr(v),
            None => self.set_ret_2_reg_mask(fun, false, false),
        }
        self.push(AsmInstruction::Ret);
    }

    // ------------------------------------------------------------------
    // Width conversions

    fn sign_extend_instr(&mut self, src: &Value, dst: &Value) {
        let src_ty = self.value_asm_type(src);
        let dst_ty = self.value_asm_type(dst);
        let src_op = self.value_operand(src);
        let dst_op = self.value_operand(dst);
        self.push(AsmInstruction::MovSx { src_ty, dst_ty, src: src_op, dst: dst_op });
    }

    fn zero_extend_instr(&mut self, src: &Value, dst: &Value) {
        let src_ty = self.value_asm_type(src);
        let dst_ty = self.value_asm_type(dst);
        let src_op = self.value_operand(src);
        let dst_op = self.value_operand(dst);
        self.push(AsmInstruction::MovZeroExtend { src_ty, dst_ty, src: src_op, dst: dst_op });
    }

    fn truncate_instr(&mut self, src: &Value, dst: &Value) {
        let to_byte = self.is_value_1b(dst);
        let mut src_op = self.value_operand(src);
        // Truncating an immediate folds the mask into the value.
        if let Operand::Imm { value, is_byte, is_quad, .. } = &mut src_op {
            if to_byte {
                if !*is_byte {
                    *value %= 256;
                }
            } else if *is_quad {
                *value = value.wrapping_sub(4294967296);
            }
        }
        let dst_op = self.value_operand(dst);
        let ty = if to_byte { AssemblyType::Byte } else { AssemblyType::LongWord };
        self.push(AsmInstruction::Mov { ty, src: src_op, dst: dst_op });
    }

    // ------------------------------------------------------------------
    // Double conversions

    fn dbl_to_signed_instr(&mut self, src: &Value, dst: &Value) {
        if self.is_value_1b(dst) {
            // No byte-wide cvttsd2si: truncate to eax and move the low byte.
            let src_op = self.value_operand(src);
            self.push(AsmInstruction::Cvttsd2si {
                ty: AssemblyType::LongWord,
                src: src_op,
                dst: Operand::reg(Reg::Ax),
            });
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Mov {
                ty: AssemblyType::Byte,
                src: Operand::reg(Reg::Ax),
                dst: dst_op,
            });
        } else {
            let ty = self.value_asm_type(dst);
            let src_op = self.value_operand(src);
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Cvttsd2si { ty, src: src_op, dst: dst_op });
        }
    }

    fn dbl_to_ulong_instr(&mut self, src: &Value, dst: &Value) {
        // Values >= 2^63 do not fit a signed conversion: subtract 2^63
        // before converting and add it back as an integer.
        let target_out_of_range = self.interner.label_identifier("sd2si_out_of_range");
        let target_after = self.interner.label_identifier("sd2si_after");
        let upper_bound_sd = self.dbl_static_const_operand(DBL_UPPER_BOUND, 8);
        let src_op = self.value_operand(src);
        let dst_op = self.value_operand(dst);
        let tmp_sd = Operand::reg(Reg::Xmm1);

        self.push(AsmInstruction::Cmp {
            ty: AssemblyType::Double,
            src: upper_bound_sd.clone(),
            dst: src_op.clone(),
        });
        self.push(AsmInstruction::JmpCc { cc: CondCode::Ae, target: target_out_of_range });
        self.push(AsmInstruction::Cvttsd2si {
            ty: AssemblyType::QuadWord,
            src: src_op.clone(),
            dst: dst_op.clone(),
        });
        self.push(AsmInstruction::Jmp(target_after));
        self.push(AsmInstruction::Label(target_out_of_range));
        self.push(AsmInstruction::Mov {
            ty: AssemblyType::Double,
            src: src_op,
            dst: tmp_sd.clone(),
        });
        self.push(AsmInstruction::Binary {
            op: AsmBinaryOp::Sub,
            ty: AssemblyType::Double,
            src: upper_bound_sd,
            dst: tmp_sd.clone(),
        });
        self.push(AsmInstruction::Cvttsd2si {
            ty: AssemblyType::QuadWord,
            src: tmp_sd,
            dst: dst_op.clone(),
        });
        self.push(AsmInstruction::Binary {
            op: AsmBinaryOp::Add,
            ty: AssemblyType::QuadWord,
            src: Operand::Imm {
                value: 1 << 63,
                is_byte: false,
                is_quad: true,
                is_neg: false,
            },
            dst: dst_op,
        });
        self.push(AsmInstruction::Label(target_after));
    }

    fn dbl_to_unsigned_instr(&mut self, src: &Value, dst: &Value) {
        if self.is_value_1b(dst) {
            self.dbl_to_signed_instr(src, dst);
        } else if self.is_value_4b(dst) {
            // Truncate through a quad so out-of-int-range values wrap the
            // same way the hardware does, then take the low long.
            let src_op = self.value_operand(src);
            self.push(AsmInstruction::Cvttsd2si {
                ty: AssemblyType::QuadWord,
                src: src_op,
                dst: Operand::reg(Reg::Ax),
            });
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Mov {
                ty: AssemblyType::LongWord,
                src: Operand::reg(Reg::Ax),
                dst: dst_op,
            });
        } else {
            self.dbl_to_ulong_instr(src, dst);
        }
    }

    fn signed_to_dbl_instr(&mut self, src: &Value, dst: &Value) {
        if self.is_value_1b(src) {
            // No byte-wide cvtsi2sd: widen into eax first.
            let src_op = self.value_operand(src);
            self.push(AsmInstruction::MovSx {
                src_ty: AssemblyType::Byte,
                dst_ty: AssemblyType::LongWord,
                src: src_op,
                dst: Operand::reg(Reg::Ax),
            });
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Cvtsi2sd {
                ty: AssemblyType::LongWord,
                src: Operand::reg(Reg::Ax),
                dst: dst_op,
            });
        } else {
            let ty = self.value_asm_type(src);
            let src_op = self.value_operand(src);
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Cvtsi2sd { ty, src: src_op, dst: dst_op });
        }
    }

    fn ulong_to_dbl_instr(&mut self, src: &Value, dst: &Value) {
        // Values with the top bit set round through a halving: shift right,
        // or the low bit back in so rounding stays correct, convert, and
        // double the result.
        let target_out_of_range = self.interner.label_identifier("si2sd_out_of_range");
        let target_after = self.interner.label_identifier("si2sd_after");
        let src_op = self.value_operand(src);
        let dst_op = self.value_operand(dst);
        let tmp_si = Operand::reg(Reg::Ax);
        let tmp_si_shr = Operand::reg(Reg::Dx);

        self.push(AsmInstruction::Cmp {
            ty: AssemblyType::QuadWord,
            src: imm_byte(0),
            dst: src_op.clone(),
        });
        self.push(AsmInstruction::JmpCc { cc: CondCode::L, target: target_out_of_range });
        self.push(AsmInstruction::Cvtsi2sd {
            ty: AssemblyType::QuadWord,
            src: src_op.clone(),
            dst: dst_op.clone(),
        });
        self.push(AsmInstruction::Jmp(target_after));
        self.push(AsmInstruction::Label(target_out_of_range));
        self.push(AsmInstruction::Mov {
            ty: AssemblyType::QuadWord,
            src: src_op,
            dst: tmp_si.clone(),
        });
        self.push(AsmInstruction::Mov {
            ty: AssemblyType::QuadWord,
            src: tmp_si.clone(),
            dst: tmp_si_shr.clone(),
        });
        self.push(AsmInstruction::Unary {
            op: AsmUnaryOp::Shr,
            ty: AssemblyType::QuadWord,
            dst: tmp_si_shr.clone(),
        });
        self.push(AsmInstruction::Binary {
            op: AsmBinaryOp::BitAnd,
            ty: AssemblyType::QuadWord,
            src: imm_byte(1),
            dst: tmp_si.clone(),
        });
        self.push(AsmInstruction::Binary {
            op: AsmBinaryOp::BitOr,
            ty: AssemblyType::QuadWord,
            src: tmp_si,
            dst: tmp_si_shr.clone(),
        });
        self.push(AsmInstruction::Cvtsi2sd {
            ty: AssemblyType::QuadWord,
            src: tmp_si_shr,
            dst: dst_op.clone(),
        });
        self.push(AsmInstruction::Binary {
            op: AsmBinaryOp::Add,
            ty: AssemblyType::Double,
            src: dst_op.clone(),
            dst: dst_op,
        });
        self.push(AsmInstruction::Label(target_after));
    }

    fn unsigned_to_dbl_instr(&mut self, src: &Value, dst: &Value) {
        if self.is_value_1b(src) {
            let src_op = self.value_operand(src);
            self.push(AsmInstruction::MovZeroExtend {
                src_ty: AssemblyType::Byte,
                dst_ty: AssemblyType::LongWord,
                src: src_op,
                dst: Operand::reg(Reg::Ax),
            });
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Cvtsi2sd {
                ty: AssemblyType::LongWord,
                src: Operand::reg(Reg::Ax),
                dst: dst_op,
            });
        } else if self.is_value_4b(src) {
            let src_op = self.value_operand(src);
            self.push(AsmInstruction::MovZeroExtend {
                src_ty: AssemblyType::LongWord,
                dst_ty: AssemblyType::QuadWord,
                src: src_op,
                dst: Operand::reg(Reg::Ax),
            });
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Cvtsi2sd {
                ty: AssemblyType::QuadWord,
                src: Operand::reg(Reg::Ax),
                dst: dst_op,
            });
        } else {
            self.ulong_to_dbl_instr(src, dst);
        }
    }

    // ------------------------------------------------------------------
    // Calls

    fn reg_arg_instr(&mut self, arg: &Value, arg_reg: Reg) {
        let ty = self.value_asm_type(arg);
        let src = self.value_operand(arg);
        self.push(AsmInstruction::Mov { ty, src, dst: Operand::reg(arg_reg) });
    }

    /// Emit one scalar stack argument.
    ///
    /// Instructions land in the deferred buffer in reverse order: the whole
    /// buffer is replayed backwards so that arguments are pushed right to
    /// left.
    fn stack_arg_instr(&mut self, arg: &Value) {
        let src = self.value_operand(arg);
        if matches!(src, Operand::Reg(_) | Operand::Imm { .. }) {
            self.push(AsmInstruction::Push(src));
            return;
        }
        let ty = self.value_asm_type(arg);
        if matches!(ty, AssemblyType::QuadWord | AssemblyType::Double) {
            self.push(AsmInstruction::Push(src));
            return;
        }
        // Narrow memory operands go through a register so the push reads
        // exactly eight bytes.
        self.push(AsmInstruction::Push(Operand::reg(Reg::Ax)));
        self.push(AsmInstruction::Mov { ty, src, dst: Operand::reg(Reg::Ax) });
    }

    fn bytearr_stack_arg_instr(&mut self, name: Identifier, mut offset: i64, mut size: i64) {
        let mut byte_instrs: SmallVec<[AsmInstruction; 8]> = SmallVec::new();
        let mut to_offset = 0;
        while size > 0 {
            let (ty, step) = if size >= 4 {
                (AssemblyType::LongWord, 4)
            } else {
                (AssemblyType::Byte, 1)
            };
            byte_instrs.push(AsmInstruction::Mov {
                ty,
                src: Operand::PseudoMem { name, offset },
                dst: Operand::memory(Reg::Sp, to_offset),
            });
            size -= step;
            offset += step;
            to_offset += step;
        }
        for instr in byte_instrs.into_iter().rev() {
            self.push(instr);
        }
        self.push(alloc_stack_bytes(8));
    }

    fn stack_8b_arg_instr(&mut self, name: Identifier, offset: i64, tag: Identifier) {
        match eightbyte_asm_type(self.frontend, tag, offset) {
            AssemblyType::QuadWord => {
                self.push(AsmInstruction::Push(Operand::PseudoMem { name, offset }));
            }
            AssemblyType::ByteArray { size, .. } => {
                self.bytearr_stack_arg_instr(name, offset, size);
            }
            ty => {
                self.push(AsmInstruction::Push(Operand::reg(Reg::Ax)));
                self.push(AsmInstruction::Mov {
                    ty,
                    src: Operand::PseudoMem { name, offset },
                    dst: Operand::reg(Reg::Ax),
                });
            }
        }
    }

    fn call_args(&mut self, fun: Identifier, args: &[Value], is_ret_memory: bool) -> i64 {
        let mut reg_size = usize::from(is_ret_memory);
        let mut sse_size = 0usize;
        let mut stack_slots = 0i64;
        let mut stack_instrs: Vec<AsmInstruction> = Vec::new();

        for arg in args {
            if self.is_value_dbl(arg) {
                if sse_size < SSE_ARG_REGS.len() {
                    self.reg_arg_instr(arg, SSE_ARG_REGS[sse_size]);
                    sse_size += 1;
                } else {
                    self.with_sink(&mut stack_instrs, |gen| gen.stack_arg_instr(arg));
                    stack_slots += 1;
                }
            } else if !self.is_value_struct(arg) {
                if reg_size < INT_ARG_REGS.len() {
                    self.reg_arg_instr(arg, INT_ARG_REGS[reg_size]);
                    reg_size += 1;
                } else {
                    self.with_sink(&mut stack_instrs, |gen| gen.stack_arg_instr(arg));
                    stack_slots += 1;
                }
            } else {
                let name = arg.var().expect("struct argument must be a variable");
                let (tag, is_union) = self.struct_of(name);
                let classes = self.classify(tag, is_union);
                // A memory-classed struct never fits; otherwise count the
                // registers its slots would take.
                let (mut need_reg, mut need_sse) = (7usize, 9usize);
                if classes.classes[0] != EightbyteClass::Memory {
                    need_reg = 0;
                    need_sse = 0;
                    for class in &classes.classes[..classes.eightbytes] {
                        if *class == EightbyteClass::Sse {
                            need_sse += 1;
                        } else {
                            need_reg += 1;
                        }
                    }
                }
                if need_reg + reg_size <= INT_ARG_REGS.len()
                    && need_sse + sse_size <= SSE_ARG_REGS.len()
                {
                    let mut offset = 0;
                    for class in &classes.classes[..classes.eightbytes] {
                        if *class == EightbyteClass::Sse {
                            self.move_8b_to_reg(name, offset, None, SSE_ARG_REGS[sse_size]);
                            sse_size += 1;
                        } else {
                            self.move_8b_to_reg(name, offset, Some(tag), INT_ARG_REGS[reg_size]);
                            reg_size += 1;
                        }
                        offset += 8;
                    }
                } else {
                    let mut offset = 0;
                    let eightbytes = classes.eightbytes;
                    self.with_sink(&mut stack_instrs, |gen| {
                        for _ in 0..eightbytes {
                            gen.stack_8b_arg_instr(name, offset, tag);
                            offset += 8;
                        }
                    });
                    stack_slots += eightbytes as i64;
                }
            }
        }

        self.set_param_reg_mask(fun, reg_size, sse_size);

        if stack_slots % 2 == 1 {
            self.push(alloc_stack_bytes(8));
            stack_slots += 1;
        }
        for instr in stack_instrs.into_iter().rev() {
            self.push(instr);
        }
        stack_slots * 8
    }

    fn call_instr(&mut self, name: Identifier, args: &[Value], dst: &Option<Value>) {
        let mut is_ret_memory = false;
        if let Some(d) = dst {
            if self.is_value_struct(d) {
                let dst_name = d.var().expect("struct call result must be a variable");
                let (tag, is_union) = self.struct_of(dst_name);
                let classes = self.classify(tag, is_union);
                if classes.classes[0] == EightbyteClass::Memory {
                    is_ret_memory = true;
                    let src = self.value_operand(d);
                    self.push(AsmInstruction::Lea { src, dst: Operand::reg(Reg::Di) });
                }
            }
        }

        let stack_padding = self.call_args(name, args, is_ret_memory);
        self.push(AsmInstruction::Call(name));
        if stack_padding > 0 {
            self.push(AsmInstruction::Binary {
                op: AsmBinaryOp::Add,
                ty: AssemblyType::QuadWord,
                src: Operand::imm_signed(stack_padding),
                dst: Operand::reg(Reg::Sp),
            });
        }

        match dst {
            None => self.set_ret_2_reg_mask(name, false, false),
            Some(_) if is_ret_memory => self.set_ret_1_reg_mask(name, true),
            Some(d) if self.is_value_dbl(d) => {
                let dst_op = self.value_operand(d);
                self.push(AsmInstruction::Mov {
                    ty: AssemblyType::Double,
                    src: Operand::reg(Reg::Xmm0),
                    dst: dst_op,
                });
                self.set_ret_1_reg_mask(name, false);
            }
            Some(d) if !self.is_value_struct(d) => {
                let ty = self.value_asm_type(d);
                let dst_op = self.value_operand(d);
                self.push(AsmInstruction::Mov {
                    ty,
                    src: Operand::reg(Reg::Ax),
                    dst: dst_op,
                });
                self.set_ret_1_reg_mask(name, true);
            }
            Some(d) => {
                let dst_name = d.var().expect("struct call result must be a variable");
                let (tag, _) = self.struct_of(dst_name);
                let classes = self.class_cache[&tag];
                let int_first = match classes.classes[0] {
                    EightbyteClass::Integer => {
                        self.move_reg_to_8b(dst_name, 0, Some(tag), Reg::Ax);
                        true
                    }
                    EightbyteClass::Sse => {
                        self.move_reg_to_8b(dst_name, 0, None, Reg::Xmm0);
                        false
                    }
                    EightbyteClass::Memory => unreachable!(),
                };
                if classes.eightbytes == 2 {
                    let mut sse_second = !int_first;
                    match classes.classes[1] {
                        EightbyteClass::Integer => {
                            let reg = if int_first { Reg::Dx } else { Reg::Ax };
                            self.move_reg_to_8b(dst_name, 8, Some(tag), reg);
                        }
                        EightbyteClass::Sse => {
                            let reg = if sse_second { Reg::Xmm1 } else { Reg::Xmm0 };
                            self.move_reg_to_8b(dst_name, 8, None, reg);
                            sse_second = true;
                        }
                        EightbyteClass::Memory => unreachable!(),
                    }
                    self.set_ret_2_reg_mask(name, int_first, sse_second);
                } else {
                    self.set_ret_1_reg_mask(name, int_first);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Unary and binary operations

    fn zero_xmm0(&mut self) {
        self.push(AsmInstruction::Binary {
            op: AsmBinaryOp::BitXor,
            ty: AssemblyType::Double,
            src: Operand::reg(Reg::Xmm0),
            dst: Operand::reg(Reg::Xmm0),
        });
    }

    fn unop_arithmetic_instr(&mut self, op: UnaryOp, src: &Value, dst: &Value) {
        let ty = self.value_asm_type(src);
        let src_op = self.value_operand(src);
        let dst_op = self.value_operand(dst);
        self.push(AsmInstruction::Mov { ty, src: src_op, dst: dst_op.clone() });
        self.push(AsmInstruction::Unary { op: Self::asm_unop(op), ty, dst: dst_op });
    }

    fn unop_dbl_neg_instr(&mut self, src: &Value, dst: &Value) {
        let src_op = self.value_operand(src);
        let dst_op = self.value_operand(dst);
        self.push(AsmInstruction::Mov {
            ty: AssemblyType::Double,
            src: src_op,
            dst: dst_op.clone(),
        });
        let sign_mask = self.dbl_static_const_operand(DBL_SIGN_MASK, 16);
        self.push(AsmInstruction::Binary {
            op: AsmBinaryOp::BitXor,
            ty: AssemblyType::Double,
            src: sign_mask,
            dst: dst_op,
        });
    }

    fn unop_conditional_instr(&mut self, src: &Value, dst: &Value) {
        if self.is_value_dbl(src) {
            let target_nan = self.interner.label_identifier("comisd_nan");
            let dst_op = self.value_operand(dst);
            self.zero_xmm0();
            let src_op = self.value_operand(src);
            self.push(AsmInstruction::Cmp {
                ty: AssemblyType::Double,
                src: Operand::reg(Reg::Xmm0),
                dst: src_op,
            });
            self.push(AsmInstruction::Mov {
                ty: AssemblyType::LongWord,
                src: Operand::imm_zero(),
                dst: dst_op.clone(),
            });
            self.push(AsmInstruction::JmpCc { cc: CondCode::P, target: target_nan });
            self.push(AsmInstruction::SetCc { cc: CondCode::E, dst: dst_op });
            self.push(AsmInstruction::Label(target_nan));
        } else {
            let src_ty = self.value_asm_type(src);
            let src_op = self.value_operand(src);
            self.push(AsmInstruction::Cmp {
                ty: src_ty,
                src: Operand::imm_zero(),
                dst: src_op,
            });
            let dst_ty = self.value_asm_type(dst);
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Mov {
                ty: dst_ty,
                src: Operand::imm_zero(),
                dst: dst_op.clone(),
            });
            self.push(AsmInstruction::SetCc { cc: CondCode::E, dst: dst_op });
        }
    }

    fn unary_instr(&mut self, op: UnaryOp, src: &Value, dst: &Value) {
        match op {
            UnaryOp::Complement => self.unop_arithmetic_instr(op, src, dst),
            UnaryOp::Negate => {
                if self.is_value_dbl(src) {
                    self.unop_dbl_neg_instr(src, dst);
                } else {
                    self.unop_arithmetic_instr(op, src, dst);
                }
            }
            UnaryOp::Not => self.unop_conditional_instr(src, dst),
        }
    }

    fn binop_arithmetic_instr(&mut self, op: BinaryOp, src1: &Value, src2: &Value, dst: &Value) {
        let ty = self.value_asm_type(src1);
        let src1_op = self.value_operand(src1);
        let dst_op = self.value_operand(dst);
        self.push(AsmInstruction::Mov { ty, src: src1_op, dst: dst_op.clone() });
        let src2_op = self.value_operand(src2);
        self.push(AsmInstruction::Binary {
            op: Self::asm_binop(op),
            ty,
            src: src2_op,
            dst: dst_op,
        });
    }

    fn binop_divide_instr(&mut self, src1: &Value, src2: &Value, dst: &Value, remainder: bool) {
        let ty = self.value_asm_type(src1);
        let signed = self.is_value_signed(src1);
        let result_reg = if remainder { Reg::Dx } else { Reg::Ax };

        let src1_op = self.value_operand(src1);
        self.push(AsmInstruction::Mov { ty, src: src1_op, dst: Operand::reg(Reg::Ax) });
        if signed {
            self.push(AsmInstruction::Cdq { ty });
        } else {
            self.push(AsmInstruction::Mov {
                ty,
                src: Operand::imm_zero(),
                dst: Operand::reg(Reg::Dx),
            });
        }
        let src2_op = self.value_operand(src2);
        if signed {
            self.push(AsmInstruction::Idiv { ty, src: src2_op });
        } else {
            self.push(AsmInstruction::Div { ty, src: src2_op });
        }
        let dst_op = self.value_operand(dst);
        self.push(AsmInstruction::Mov {
            ty,
            src: Operand::reg(result_reg),
            dst: dst_op,
        });
    }

    fn binop_conditional_instr(&mut self, op: BinaryOp, src1: &Value, src2: &Value, dst: &Value) {
        if self.is_value_dbl(src1) {
            let target_nan = self.interner.label_identifier("comisd_nan");
            let cmp_ty = self.value_asm_type(src1);
            let src1_op = self.value_operand(src1);
            let src2_op = self.value_operand(src2);
            self.push(AsmInstruction::Cmp { ty: cmp_ty, src: src2_op, dst: src1_op });
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Mov {
                ty: AssemblyType::LongWord,
                src: Operand::imm_zero(),
                dst: dst_op.clone(),
            });
            self.push(AsmInstruction::JmpCc { cc: CondCode::P, target: target_nan });
            let cc = Self::unsigned_cond_code(op);
            if cc == CondCode::Ne {
                // NaN compares not-equal, so the NaN path must set too.
                let target_nan_ne = self.interner.label_identifier("comisd_nan");
                self.push(AsmInstruction::SetCc { cc, dst: dst_op.clone() });
                self.push(AsmInstruction::Jmp(target_nan_ne));
                self.push(AsmInstruction::Label(target_nan));
                self.push(AsmInstruction::SetCc { cc: CondCode::E, dst: dst_op });
                self.push(AsmInstruction::Label(target_nan_ne));
            } else {
                self.push(AsmInstruction::SetCc { cc, dst: dst_op });
                self.push(AsmInstruction::Label(target_nan));
            }
        } else {
            let cmp_ty = self.value_asm_type(src1);
            let src1_op = self.value_operand(src1);
            let src2_op = self.value_operand(src2);
            self.push(AsmInstruction::Cmp { ty: cmp_ty, src: src2_op, dst: src1_op });
            let dst_ty = self.value_asm_type(dst);
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Mov {
                ty: dst_ty,
                src: Operand::imm_zero(),
                dst: dst_op.clone(),
            });
            let cc = if self.is_value_signed(src1) {
                Self::signed_cond_code(op)
            } else {
                Self::unsigned_cond_code(op)
            };
            self.push(AsmInstruction::SetCc { cc, dst: dst_op });
        }
    }

    fn binary_instr(&mut self, op: BinaryOp, src1: &Value, src2: &Value, dst: &Value) {
        match op {
            BinaryOp::Divide => {
                if self.is_value_dbl(src1) {
                    self.binop_arithmetic_instr(op, src1, src2, dst);
                } else {
                    self.binop_divide_instr(src1, src2, dst, false);
                }
            }
            BinaryOp::Remainder => self.binop_divide_instr(src1, src2, dst, true),
            op if op.is_comparison() => self.binop_conditional_instr(op, src1, src2, dst),
            op => self.binop_arithmetic_instr(op, src1, src2, dst),
        }
    }

    // ------------------------------------------------------------------
    // Memory operations

    fn copy_instr(&mut self, src: &Value, dst: &Value) {
        if self.is_value_struct(src) {
            let src_name = src.var().expect("struct copy source must be a variable");
            let dst_name = dst.var().expect("struct copy destination must be a variable");
            let (tag, _) = self.struct_of(src_name);
            self.copy_bytes(
                self.struct_size(tag),
                |offset| Operand::PseudoMem { name: src_name, offset },
                |offset| Operand::PseudoMem { name: dst_name, offset },
            );
        } else {
            let ty = self.value_asm_type(src);
            let src_op = self.value_operand(src);
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Mov { ty, src: src_op, dst: dst_op });
        }
    }

    fn getaddr_instr(&mut self, src: &Value, dst: &Value) {
        let src_op = match src {
            Value::Var(name) => {
                self.frontend.addressed_set.insert(*name);
                match self.frontend.symbol_table.get(name) {
                    Some(symbol) if matches!(symbol.attrs, IdentAttr::Constant(_)) => {
                        Operand::Data { name: *name, offset: 0 }
                    }
                    _ => self.value_operand(src),
                }
            }
            Value::Constant(_) => panic!("cannot take the address of a constant"),
        };
        let dst_op = self.value_operand(dst);
        self.push(AsmInstruction::Lea { src: src_op, dst: dst_op });
    }

    fn load_instr(&mut self, src_ptr: &Value, dst: &Value) {
        let ptr_op = self.value_operand(src_ptr);
        self.push(AsmInstruction::Mov {
            ty: AssemblyType::QuadWord,
            src: ptr_op,
            dst: Operand::reg(Reg::Ax),
        });
        if self.is_value_struct(dst) {
            let name = dst.var().expect("struct load destination must be a variable");
            let (tag, _) = self.struct_of(name);
            self.copy_bytes(
                self.struct_size(tag),
                |offset| Operand::memory(Reg::Ax, offset),
                |offset| Operand::PseudoMem { name, offset },
            );
        } else {
            let ty = self.value_asm_type(dst);
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Mov {
                ty,
                src: Operand::memory(Reg::Ax, 0),
                dst: dst_op,
            });
        }
    }

    fn store_instr(&mut self, src: &Value, dst_ptr: &Value) {
        let ptr_op = self.value_operand(dst_ptr);
        self.push(AsmInstruction::Mov {
            ty: AssemblyType::QuadWord,
            src: ptr_op,
            dst: Operand::reg(Reg::Ax),
        });
        if self.is_value_struct(src) {
            let name = src.var().expect("struct store source must be a variable");
            let (tag, _) = self.struct_of(name);
            self.copy_bytes(
                self.struct_size(tag),
                |offset| Operand::PseudoMem { name, offset },
                |offset| Operand::memory(Reg::Ax, offset),
            );
        } else {
            let ty = self.value_asm_type(src);
            let src_op = self.value_operand(src);
            self.push(AsmInstruction::Mov {
                ty,
                src: src_op,
                dst: Operand::memory(Reg::Ax, 0),
            });
        }
    }

    fn add_ptr_instr(&mut self, src_ptr: &Value, idx: &Value, scale: i64, dst: &Value) {
        let ptr_op = self.value_operand(src_ptr);
        self.push(AsmInstruction::Mov {
            ty: AssemblyType::QuadWord,
            src: ptr_op,
            dst: Operand::reg(Reg::Ax),
        });
        match idx {
            Value::Constant(constant) => {
                let index = match constant {
                    Constant::Long(v) => *v,
                    other => panic!("pointer index constant must be long, found {other:?}"),
                };
                let dst_op = self.value_operand(dst);
                self.push(AsmInstruction::Lea {
                    src: Operand::memory(Reg::Ax, index * scale),
                    dst: dst_op,
                });
            }
            Value::Var(_) => {
                let idx_op = self.value_operand(idx);
                self.push(AsmInstruction::Mov {
                    ty: AssemblyType::QuadWord,
                    src: idx_op,
                    dst: Operand::reg(Reg::Dx),
                });
                if matches!(scale, 1 | 2 | 4 | 8) {
                    let dst_op = self.value_operand(dst);
                    self.push(AsmInstruction::Lea {
                        src: Operand::Indexed { scale, base: Reg::Ax, index: Reg::Dx },
                        dst: dst_op,
                    });
                } else {
                    self.push(AsmInstruction::Binary {
                        op: AsmBinaryOp::Mult,
                        ty: AssemblyType::QuadWord,
                        src: Operand::imm_signed(scale),
                        dst: Operand::reg(Reg::Dx),
                    });
                    let dst_op = self.value_operand(dst);
                    self.push(AsmInstruction::Lea {
                        src: Operand::Indexed { scale: 1, base: Reg::Ax, index: Reg::Dx },
                        dst: dst_op,
                    });
                }
            }
        }
    }

    fn copy_to_offset_instr(&mut self, src: &Value, dst_name: Identifier, offset: i64) {
        if self.is_value_struct(src) {
            let src_name = src.var().expect("struct copy source must be a variable");
            let (tag, _) = self.struct_of(src_name);
            self.copy_bytes(
                self.struct_size(tag),
                |off| Operand::PseudoMem { name: src_name, offset: off },
                |off| Operand::PseudoMem { name: dst_name, offset: off + offset },
            );
        } else {
            let ty = self.value_asm_type(src);
            let src_op = self.value_operand(src);
            self.push(AsmInstruction::Mov {
                ty,
                src: src_op,
                dst: Operand::PseudoMem { name: dst_name, offset },
            });
        }
    }

    fn copy_from_offset_instr(&mut self, src_name: Identifier, offset: i64, dst: &Value) {
        if self.is_value_struct(dst) {
            let dst_name = dst.var().expect("struct copy destination must be a variable");
            let (tag, _) = self.struct_of(dst_name);
            self.copy_bytes(
                self.struct_size(tag),
                |off| Operand::PseudoMem { name: src_name, offset: off + offset },
                |off| Operand::PseudoMem { name: dst_name, offset: off },
            );
        } else {
            let ty = self.value_asm_type(dst);
            let dst_op = self.value_operand(dst);
            self.push(AsmInstruction::Mov {
                ty,
                src: Operand::PseudoMem { name: src_name, offset },
                dst: dst_op,
            });
        }
    }

    // ------------------------------------------------------------------
    // Branches

    fn jmp_eq_0_instr(&mut self, condition: &Value, target: Identifier) {
        if self.is_value_dbl(condition) {
            let target_nan = self.interner.label_identifier("comisd_nan");
            self.zero_xmm0();
            let cond_op = self.value_operand(condition);
            self.push(AsmInstruction::Cmp {
                ty: AssemblyType::Double,
                src: cond_op,
                dst: Operand::reg(Reg::Xmm0),
            });
            self.push(AsmInstruction::JmpCc { cc: CondCode::P, target: target_nan });
            self.push(AsmInstruction::JmpCc { cc: CondCode::E, target });
            self.push(AsmInstruction::Label(target_nan));
        } else {
            let ty = self.value_asm_type(condition);
            let cond_op = self.value_operand(condition);
            self.push(AsmInstruction::Cmp { ty, src: Operand::imm_zero(), dst: cond_op });
            self.push(AsmInstruction::JmpCc { cc: CondCode::E, target });
        }
    }

    fn jmp_ne_0_instr(&mut self, condition: &Value, target: Identifier) {
        if self.is_value_dbl(condition) {
            // NaN is non-zero, so the parity path also takes the branch.
            let target_nan = self.interner.label_identifier("comisd_nan");
            let target_nan_ne = self.interner.label_identifier("comisd_nan");
            self.zero_xmm0();
            let cond_op = self.value_operand(condition);
            self.push(AsmInstruction::Cmp {
                ty: AssemblyType::Double,
                src: cond_op,
                dst: Operand::reg(Reg::Xmm0),
            });
            self.push(AsmInstruction::JmpCc { cc: CondCode::P, target: target_nan });
            self.push(AsmInstruction::JmpCc { cc: CondCode::Ne, target });
            self.push(AsmInstruction::Jmp(target_nan_ne));
            self.push(AsmInstruction::Label(target_nan));
            self.push(AsmInstruction::JmpCc { cc: CondCode::E, target });
            self.push(AsmInstruction::Label(target_nan_ne));
        } else {
            let ty = self.value_asm_type(condition);
            let cond_op = self.value_operand(condition);
            self.push(AsmInstruction::Cmp { ty, src: Operand::imm_zero(), dst: cond_op });
            self.push(AsmInstruction::JmpCc { cc: CondCode::Ne, target });
        }
    }

    // ------------------------------------------------------------------
    // Instruction dispatch

    fn gen_instr(&mut self, instr: &tac::Instruction) {
        use tac::Instruction::*;
        match instr {
            Return(value) => self.ret_instr(value),
            SignExtend { src, dst } => self.sign_extend_instr(src, dst),
            Truncate { src, dst } => self.truncate_instr(src, dst),
            ZeroExtend { src, dst } => self.zero_extend_instr(src, dst),
            DoubleToInt { src, dst } => self.dbl_to_signed_instr(src, dst),
            DoubleToUInt { src, dst } => self.dbl_to_unsigned_instr(src, dst),
            IntToDouble { src, dst } => self.signed_to_dbl_instr(src, dst),
            UIntToDouble { src, dst } => self.unsigned_to_dbl_instr(src, dst),
            FunCall { name, args, dst } => self.call_instr(*name, args, dst),
            Unary { op, src, dst } => self.unary_instr(*op, src, dst),
            Binary { op, src1, src2, dst } => self.binary_instr(*op, src1, src2, dst),
            Copy { src, dst } => self.copy_instr(src, dst),
            GetAddress { src, dst } => self.getaddr_instr(src, dst),
            Load { src_ptr, dst } => self.load_instr(src_ptr, dst),
            Store { src, dst_ptr } => self.store_instr(src, dst_ptr),
            AddPtr { src_ptr, idx, scale, dst } => {
                self.add_ptr_instr(src_ptr, idx, *scale, dst)
            }
            CopyToOffset { src, dst_name, offset } => {
                self.copy_to_offset_instr(src, *dst_name, *offset)
            }
            CopyFromOffset { src_name, offset, dst } => {
                self.copy_from_offset_instr(*src_name, *offset, dst)
            }
            Jump(target) => self.push(AsmInstruction::Jmp(*target)),
            JumpIfZero { condition, target } => self.jmp_eq_0_instr(condition, *target),
            JumpIfNotZero { condition, target } => self.jmp_ne_0_instr(condition, *target),
            Label(name) => self.push(AsmInstruction::Label(*name)),
        }
    }

    // ------------------------------------------------------------------
    // Function boundary

    fn reg_param_instr(&mut self, param: Identifier, arg_reg: Reg) {
        let ty = super::symt::backend_asm_type(self.frontend, param);
        self.push(AsmInstruction::Mov {
            ty,
            src: Operand::reg(arg_reg),
            dst: Operand::Pseudo(param),
        });
    }

    fn stack_param_instr(&mut self, param: Identifier, stack_bytes: i64) {
        let ty = super::symt::backend_asm_type(self.frontend, param);
        self.push(AsmInstruction::Mov {
            ty,
            src: Operand::memory(Reg::Bp, stack_bytes),
            dst: Operand::Pseudo(param),
        });
    }

    fn stack_8b_param_instr(
        &mut self,
        param: Identifier,
        mut stack_bytes: i64,
        mut offset: i64,
        tag: Identifier,
    ) {
        match eightbyte_asm_type(self.frontend, tag, offset) {
            AssemblyType::ByteArray { size, .. } => {
                let mut size = size;
                while size > 0 {
                    let (ty, step) = if size >= 4 {
                        (AssemblyType::LongWord, 4)
                    } else {
                        (AssemblyType::Byte, 1)
                    };
                    self.push(AsmInstruction::Mov {
                        ty,
                        src: Operand::memory(Reg::Bp, stack_bytes),
                        dst: Operand::PseudoMem { name: param, offset },
                    });
                    size -= step;
                    offset += step;
                    stack_bytes += step;
                }
            }
            ty => {
                self.push(AsmInstruction::Mov {
                    ty,
                    src: Operand::memory(Reg::Bp, stack_bytes),
                    dst: Operand::PseudoMem { name: param, offset },
                });
            }
        }
    }

    fn fun_params(&mut self, fun: Identifier, params: &[Identifier], is_ret_memory: bool) {
        let mut reg_size = usize::from(is_ret_memory);
        let mut sse_size = 0usize;
        let mut stack_bytes = 16i64;
        for &param in params {
            let param_ty = self.frontend.symbol(param).ty.clone();
            match param_ty {
                Type::Double => {
                    if sse_size < SSE_ARG_REGS.len() {
                        self.reg_param_instr(param, SSE_ARG_REGS[sse_size]);
                        sse_size += 1;
                    } else {
                        self.stack_param_instr(param, stack_bytes);
                        stack_bytes += 8;
                    }
                }
                Type::Structure { tag, is_union } => {
                    let classes = self.classify(tag, is_union);
                    let (mut need_reg, mut need_sse) = (7usize, 9usize);
                    if classes.classes[0] != EightbyteClass::Memory {
                        need_reg = 0;
                        need_sse = 0;
                        for class in &classes.classes[..classes.eightbytes] {
                            if *class == EightbyteClass::Sse {
                                need_sse += 1;
                            } else {
                                need_reg += 1;
                            }
                        }
                    }
                    if need_reg + reg_size <= INT_ARG_REGS.len()
                        && need_sse + sse_size <= SSE_ARG_REGS.len()
                    {
                        let mut offset = 0;
                        for class in &classes.classes[..classes.eightbytes] {
                            if *class == EightbyteClass::Sse {
                                self.move_reg_to_8b(param, offset, None, SSE_ARG_REGS[sse_size]);
                                sse_size += 1;
                            } else {
                                self.move_reg_to_8b(
                                    param,
                                    offset,
                                    Some(tag),
                                    INT_ARG_REGS[reg_size],
                                );
                                reg_size += 1;
                            }
                            offset += 8;
                        }
                    } else {
                        let mut offset = 0;
                        for _ in 0..classes.eightbytes {
                            self.stack_8b_param_instr(param, stack_bytes, offset, tag);
                            stack_bytes += 8;
                            offset += 8;
                        }
                    }
                }
                _ => {
                    if reg_size < INT_ARG_REGS.len() {
                        self.reg_param_instr(param, INT_ARG_REGS[reg_size]);
                        reg_size += 1;
                    } else {
                        self.stack_param_instr(param, stack_bytes);
                        stack_bytes += 8;
                    }
                }
            }
        }
        self.set_param_reg_mask(fun, reg_size, sse_size);
    }

    // ------------------------------------------------------------------
    // Top levels

    fn gen_function(&mut self, fun: tac::Function) -> AsmTopLevel {
        trace!("lowering function {}", &self.interner[fun.name]);
        self.instrs = Vec::with_capacity(fun.body.len());
        self.fun_name = Some(fun.name);

        let mut is_ret_memory = false;
        let ret_ty = match &self.frontend.symbol(fun.name).ty {
            Type::Fun(fun_type) => fun_type.ret.clone(),
            other => panic!("expected function type, found {other:?}"),
        };
        if let Type::Structure { tag, is_union } = ret_ty {
            let classes = self.classify(tag, is_union);
            if classes.classes[0] == EightbyteClass::Memory {
                is_ret_memory = true;
                self.push(AsmInstruction::Mov {
                    ty: AssemblyType::QuadWord,
                    src: Operand::reg(Reg::Di),
                    dst: Operand::memory(Reg::Bp, -8),
                });
            }
        }
        self.fun_params(fun.name, &fun.params, is_ret_memory);

        for instr in fun.body.iter().flatten() {
            self.gen_instr(instr);
        }

        self.fun_name = None;
        AsmTopLevel::Function(AsmFunction {
            name: fun.name,
            is_glob: fun.is_glob,
            is_ret_memory,
            instructions: mem::take(&mut self.instrs),
        })
    }

    fn gen_static_variable(&mut self, var: tac::StaticVariable) -> AsmTopLevel {
        AsmTopLevel::StaticVariable(AsmStaticVariable {
            name: var.name,
            alignment: self.frontend.type_alignment(&var.ty),
            is_glob: var.is_glob,
            inits: var.inits,
        })
    }

    fn gen_static_constant(&mut self, constant: tac::StaticConstant) -> AsmTopLevel {
        AsmTopLevel::StaticConstant(AsmStaticConstant {
            name: constant.name,
            alignment: self.frontend.type_alignment(&constant.ty),
            init: constant.init,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::symbols::Symbol;
    use crate::ir::types::{FunType, StructMember, StructTypedef};
    use indexmap::IndexMap;

    struct Harness {
        interner: StringInterner,
        frontend: FrontEndSymbols,
    }

    impl Harness {
        fn new() -> Self {
            Self { interner: StringInterner::new(), frontend: FrontEndSymbols::new() }
        }

        fn var(&mut self, name: &str, ty: Type) -> Identifier {
            let id = self.interner.intern(name);
            self.frontend
                .symbol_table
                .insert(id, Symbol { ty, attrs: IdentAttr::Local });
            id
        }

        fn fun(&mut self, name: &str, params: Vec<Type>, ret: Type) -> Identifier {
            let id = self.interner.intern(name);
            self.frontend.symbol_table.insert(
                id,
                Symbol {
                    ty: Type::Fun(Box::new(FunType::new(params, ret))),
                    attrs: IdentAttr::Fun { is_def: true, is_glob: true },
                },
            );
            id
        }

        fn add_struct(
            &mut self,
            tag: &str,
            members: &[(&str, i64, Type)],
            size: i64,
            alignment: i32,
        ) -> Identifier {
            let tag = self.interner.intern(tag);
            let mut map = IndexMap::default();
            for (name, offset, ty) in members {
                map.insert(
                    self.interner.intern(name),
                    StructMember { offset: *offset, ty: ty.clone() },
                );
            }
            self.frontend
                .struct_typedef_table
                .insert(tag, StructTypedef { alignment, size, members: map });
            tag
        }

        fn lower(&mut self, funs: Vec<tac::Function>) -> AsmProgram {
            let program = TacProgram { funs, ..Default::default() };
            generate_assembly(program, &mut self.frontend, &mut self.interner)
        }

        fn masks(&self, fun: Identifier) -> (RegisterMask, RegisterMask) {
            match &self.frontend.symbol(fun).ty {
                Type::Fun(fun_type) => (
                    fun_type.param_reg_mask.expect("param mask not set"),
                    fun_type.ret_reg_mask.expect("ret mask not set"),
                ),
                other => panic!("expected function type, found {other:?}"),
            }
        }
    }

    fn body_of(program: &AsmProgram, index: usize) -> &[AsmInstruction] {
        match &program.top_levels[index] {
            AsmTopLevel::Function(fun) => &fun.instructions,
            other => panic!("expected function, found {other:?}"),
        }
    }

    fn ret_fun(name: Identifier, params: Vec<Identifier>, value: Value) -> tac::Function {
        tac::Function {
            name,
            is_glob: true,
            params,
            body: vec![Some(tac::Instruction::Return(Some(value)))],
        }
    }

    #[test]
    fn int_identity_function() {
        let mut h = Harness::new();
        let id = h.fun("id", vec![Type::Int], Type::Int);
        let x = h.var("x", Type::Int);
        let program = h.lower(vec![ret_fun(id, vec![x], Value::Var(x))]);

        assert_eq!(
            body_of(&program, 0),
            &[
                AsmInstruction::Mov {
                    ty: AssemblyType::LongWord,
                    src: Operand::reg(Reg::Di),
                    dst: Operand::Pseudo(x),
                },
                AsmInstruction::Mov {
                    ty: AssemblyType::LongWord,
                    src: Operand::Pseudo(x),
                    dst: Operand::reg(Reg::Ax),
                },
                AsmInstruction::Ret,
            ]
        );
        let (param_mask, ret_mask) = h.masks(id);
        assert_eq!(param_mask.bits(), 1 << Reg::Di.number());
        assert_eq!(ret_mask.bits(), 1 << Reg::Ax.number());
    }

    #[test]
    fn double_addition_function() {
        let mut h = Harness::new();
        let f = h.fun("f", vec![Type::Double, Type::Double], Type::Double);
        let a = h.var("a", Type::Double);
        let b = h.var("b", Type::Double);
        let tmp = h.var("tmp", Type::Double);
        let fun = tac::Function {
            name: f,
            is_glob: true,
            params: vec![a, b],
            body: vec![
                Some(tac::Instruction::Binary {
                    op: BinaryOp::Add,
                    src1: Value::Var(a),
                    src2: Value::Var(b),
                    dst: Value::Var(tmp),
                }),
                Some(tac::Instruction::Return(Some(Value::Var(tmp)))),
            ],
        };
        let program = h.lower(vec![fun]);

        assert_eq!(
            body_of(&program, 0),
            &[
                AsmInstruction::Mov {
                    ty: AssemblyType::Double,
                    src: Operand::reg(Reg::Xmm0),
                    dst: Operand::Pseudo(a),
                },
                AsmInstruction::Mov {
                    ty: AssemblyType::Double,
                    src: Operand::reg(Reg::Xmm1),
                    dst: Operand::Pseudo(b),
                },
                AsmInstruction::Mov {
                    ty: AssemblyType::Double,
                    src: Operand::Pseudo(a),
                    dst: Operand::Pseudo(tmp),
                },
                AsmInstruction::Binary {
                    op: AsmBinaryOp::Add,
                    ty: AssemblyType::Double,
                    src: Operand::Pseudo(b),
                    dst: Operand::Pseudo(tmp),
                },
                AsmInstruction::Mov {
                    ty: AssemblyType::Double,
                    src: Operand::Pseudo(tmp),
                    dst: Operand::reg(Reg::Xmm0),
                },
                AsmInstruction::Ret,
            ]
        );
        let (param_mask, _) = h.masks(f);
        assert!(param_mask.contains(Reg::Xmm0) && param_mask.contains(Reg::Xmm1));
    }

    #[test]
    fn struct_of_three_ints_returns_in_rax_and_edx() {
        let mut h = Harness::new();
        let tag = h.add_struct(
            "triple",
            &[("a", 0, Type::Int), ("b", 4, Type::Int), ("c", 8, Type::Int)],
            12,
            4,
        );
        let f = h.fun("f", vec![], Type::Structure { tag, is_union: false });
        let t = h.var("t", Type::Structure { tag, is_union: false });
        let program = h.lower(vec![ret_fun(f, vec![], Value::Var(t))]);

        assert_eq!(
            body_of(&program, 0),
            &[
                AsmInstruction::Mov {
                    ty: AssemblyType::QuadWord,
                    src: Operand::PseudoMem { name: t, offset: 0 },
                    dst: Operand::reg(Reg::Ax),
                },
                AsmInstruction::Mov {
                    ty: AssemblyType::LongWord,
                    src: Operand::PseudoMem { name: t, offset: 8 },
                    dst: Operand::reg(Reg::Dx),
                },
                AsmInstruction::Ret,
            ]
        );
        let (_, ret_mask) = h.masks(f);
        assert!(ret_mask.contains(Reg::Ax) && ret_mask.contains(Reg::Dx));
    }

    #[test]
    fn memory_struct_returns_through_hidden_pointer() {
        let mut h = Harness::new();
        let tag = h.add_struct(
            "big",
            &[("a", 0, Type::Long), ("b", 8, Type::Long), ("c", 16, Type::Long)],
            24,
            8,
        );
        let f = h.fun("f", vec![], Type::Structure { tag, is_union: false });
        let t = h.var("t", Type::Structure { tag, is_union: false });
        let program = h.lower(vec![ret_fun(f, vec![], Value::Var(t))]);

        let body = body_of(&program, 0);
        // %rdi stashed on entry, reloaded into %rax before the copy-out.
        assert_eq!(
            body[0],
            AsmInstruction::Mov {
                ty: AssemblyType::QuadWord,
                src: Operand::reg(Reg::Di),
                dst: Operand::memory(Reg::Bp, -8),
            }
        );
        assert_eq!(
            body[1],
            AsmInstruction::Mov {
                ty: AssemblyType::QuadWord,
                src: Operand::memory(Reg::Bp, -8),
                dst: Operand::reg(Reg::Ax),
            }
        );
        // 24 bytes copy out in three quads.
        for chunk in 0..3 {
            assert_eq!(
                body[2 + chunk],
                AsmInstruction::Mov {
                    ty: AssemblyType::QuadWord,
                    src: Operand::PseudoMem { name: t, offset: 8 * chunk as i64 },
                    dst: Operand::memory(Reg::Ax, 8 * chunk as i64),
                }
            );
        }
        assert_eq!(body[5], AsmInstruction::Ret);
        match &program.top_levels[0] {
            AsmTopLevel::Function(fun) => assert!(fun.is_ret_memory),
            other => panic!("expected function, found {other:?}"),
        }
    }

    #[test]
    fn double_to_ulong_emits_out_of_range_protocol() {
        let mut h = Harness::new();
        let f = h.fun("f", vec![], Type::ULong);
        let d = h.var("d", Type::Double);
        let u = h.var("u", Type::ULong);
        let fun = tac::Function {
            name: f,
            is_glob: true,
            params: vec![],
            body: vec![
                Some(tac::Instruction::DoubleToUInt {
                    src: Value::Var(d),
                    dst: Value::Var(u),
                }),
                Some(tac::Instruction::Return(Some(Value::Var(u)))),
            ],
        };
        let program = h.lower(vec![fun]);
        let body = body_of(&program, 0);

        let bound = match &body[0] {
            AsmInstruction::Cmp { ty: AssemblyType::Double, src, dst } => {
                assert_eq!(*dst, Operand::Pseudo(d));
                src.clone()
            }
            other => panic!("expected comisd against the bound, found {other:?}"),
        };
        assert!(matches!(bound, Operand::Data { .. }));
        assert!(matches!(body[1], AsmInstruction::JmpCc { cc: CondCode::Ae, .. }));
        assert!(matches!(
            body[2],
            AsmInstruction::Cvttsd2si { ty: AssemblyType::QuadWord, .. }
        ));
        assert!(matches!(body[3], AsmInstruction::Jmp(_)));
        assert!(matches!(body[4], AsmInstruction::Label(_)));
        assert_eq!(
            body[5],
            AsmInstruction::Mov {
                ty: AssemblyType::Double,
                src: Operand::Pseudo(d),
                dst: Operand::reg(Reg::Xmm1),
            }
        );
        assert_eq!(
            body[6],
            AsmInstruction::Binary {
                op: AsmBinaryOp::Sub,
                ty: AssemblyType::Double,
                src: bound,
                dst: Operand::reg(Reg::Xmm1),
            }
        );
        assert!(matches!(
            body[7],
            AsmInstruction::Cvttsd2si { ty: AssemblyType::QuadWord, .. }
        ));
        assert_eq!(
            body[8],
            AsmInstruction::Binary {
                op: AsmBinaryOp::Add,
                ty: AssemblyType::QuadWord,
                src: Operand::Imm {
                    value: 1 << 63,
                    is_byte: false,
                    is_quad: true,
                    is_neg: false,
                },
                dst: Operand::Pseudo(u),
            }
        );
        assert!(matches!(body[9], AsmInstruction::Label(_)));
        // The 2^63 bound landed in the constant pool.
        assert_eq!(program.static_consts.len(), 1);
    }

    #[test]
    fn double_pool_interns_by_bit_pattern() {
        let mut h = Harness::new();
        let f = h.fun("f", vec![], Type::Void);
        let x = h.var("x", Type::Double);
        let y = h.var("y", Type::Double);
        let z = h.var("z", Type::Double);
        let copy = |value: f64, dst: Identifier| {
            Some(tac::Instruction::Copy {
                src: Value::Constant(Constant::Double(value)),
                dst: Value::Var(dst),
            })
        };
        let fun = tac::Function {
            name: f,
            is_glob: true,
            params: vec![],
            body: vec![copy(1.0, x), copy(1.0, y), copy(2.0, z)],
        };
        let program = h.lower(vec![fun]);

        let body = body_of(&program, 0);
        let label = |instr: &AsmInstruction| match instr {
            AsmInstruction::Mov { src: Operand::Data { name, .. }, .. } => *name,
            other => panic!("expected data mov, found {other:?}"),
        };
        assert_eq!(label(&body[0]), label(&body[1]));
        assert_ne!(label(&body[0]), label(&body[2]));
        assert_eq!(program.static_consts.len(), 2);
    }

    #[test]
    fn caller_and_callee_agree_on_argument_registers() {
        let mut h = Harness::new();
        let g = h.fun("g", vec![Type::Int, Type::Double, Type::Long], Type::Void);
        let p0 = h.var("p0", Type::Int);
        let p1 = h.var("p1", Type::Double);
        let p2 = h.var("p2", Type::Long);
        let caller = h.fun("caller", vec![], Type::Void);

        let call = tac::Function {
            name: caller,
            is_glob: true,
            params: vec![],
            body: vec![
                Some(tac::Instruction::FunCall {
                    name: g,
                    args: vec![
                        Value::Constant(Constant::Int(1)),
                        Value::Constant(Constant::Double(2.0)),
                        Value::Constant(Constant::Long(3)),
                    ],
                    dst: None,
                }),
                Some(tac::Instruction::Return(None)),
            ],
        };
        let callee = tac::Function {
            name: g,
            is_glob: true,
            params: vec![p0, p1, p2],
            body: vec![Some(tac::Instruction::Return(None))],
        };
        let program = h.lower(vec![call, callee]);

        // Caller marshalling picks di, xmm0, si.
        let caller_body = body_of(&program, 0);
        let arg_regs: Vec<Reg> = caller_body
            .iter()
            .filter_map(|instr| match instr {
                AsmInstruction::Mov { dst: Operand::Reg(reg), .. } => Some(*reg),
                _ => None,
            })
            .collect();
        assert_eq!(arg_regs, vec![Reg::Di, Reg::Xmm0, Reg::Si]);

        // Callee intake reads the same registers for the same formals.
        let callee_body = body_of(&program, 1);
        assert_eq!(
            &callee_body[..3],
            &[
                AsmInstruction::Mov {
                    ty: AssemblyType::LongWord,
                    src: Operand::reg(Reg::Di),
                    dst: Operand::Pseudo(p0),
                },
                AsmInstruction::Mov {
                    ty: AssemblyType::Double,
                    src: Operand::reg(Reg::Xmm0),
                    dst: Operand::Pseudo(p1),
                },
                AsmInstruction::Mov {
                    ty: AssemblyType::QuadWord,
                    src: Operand::reg(Reg::Si),
                    dst: Operand::Pseudo(p2),
                },
            ]
        );
        let (param_mask, ret_mask) = h.masks(g);
        assert!(param_mask.contains(Reg::Di));
        assert!(param_mask.contains(Reg::Si));
        assert!(param_mask.contains(Reg::Xmm0));
        assert!(!param_mask.contains(Reg::Dx));
        assert!(ret_mask.is_empty());
    }

    #[test]
    fn stack_arguments_push_right_to_left_with_padding() {
        let mut h = Harness::new();
        let params: Vec<Type> = (0..7).map(|_| Type::Long).collect();
        let g = h.fun("g", params, Type::Void);
        let caller = h.fun("caller", vec![], Type::Void);
        let args: Vec<Value> =
            (0..7).map(|i| Value::Constant(Constant::Long(i))).collect();
        let fun = tac::Function {
            name: caller,
            is_glob: true,
            params: vec![],
            body: vec![
                Some(tac::Instruction::FunCall { name: g, args, dst: None }),
                Some(tac::Instruction::Return(None)),
            ],
        };
        let program = h.lower(vec![fun]);
        let body = body_of(&program, 0);

        // Six register moves, one odd stack slot: pad to sixteen bytes,
        // push the seventh argument, call, pop both slots.
        assert_eq!(
            body[6],
            AsmInstruction::Binary {
                op: AsmBinaryOp::Sub,
                ty: AssemblyType::QuadWord,
                src: Operand::imm_signed(8),
                dst: Operand::reg(Reg::Sp),
            }
        );
        assert_eq!(
            body[7],
            AsmInstruction::Push(Operand::Imm {
                value: 6,
                is_byte: true,
                is_quad: false,
                is_neg: false,
            })
        );
        assert_eq!(body[8], AsmInstruction::Call(g));
        assert_eq!(
            body[9],
            AsmInstruction::Binary {
                op: AsmBinaryOp::Add,
                ty: AssemblyType::QuadWord,
                src: Operand::imm_signed(16),
                dst: Operand::reg(Reg::Sp),
            }
        );
    }

    #[test]
    fn packed_eightbyte_assembles_with_shifts() {
        let mut h = Harness::new();
        // 11 bytes: one quad slot, then a 3-byte tail assembled bytewise.
        let tag = h.add_struct(
            "packed",
            &[
                ("a", 0, Type::Long),
                ("b", 8, Type::Char),
                ("c", 9, Type::Char),
                ("d", 10, Type::Char),
            ],
            11,
            8,
        );
        let f = h.fun("f", vec![], Type::Structure { tag, is_union: false });
        let t = h.var("t", Type::Structure { tag, is_union: false });
        let program = h.lower(vec![ret_fun(f, vec![], Value::Var(t))]);
        let body = body_of(&program, 0);

        assert_eq!(
            body[0],
            AsmInstruction::Mov {
                ty: AssemblyType::QuadWord,
                src: Operand::PseudoMem { name: t, offset: 0 },
                dst: Operand::reg(Reg::Ax),
            }
        );
        // Tail packs from byte 10 down to byte 8 with shifts in between.
        let expected_tail = [
            (10, true),
            (9, true),
            (8, false),
        ];
        let mut cursor = 1;
        for (offset, shifted) in expected_tail {
            assert_eq!(
                body[cursor],
                AsmInstruction::Mov {
                    ty: AssemblyType::Byte,
                    src: Operand::PseudoMem { name: t, offset },
                    dst: Operand::reg(Reg::Dx),
                }
            );
            cursor += 1;
            if shifted {
                assert_eq!(
                    body[cursor],
                    AsmInstruction::Binary {
                        op: AsmBinaryOp::BitShiftLeft,
                        ty: AssemblyType::QuadWord,
                        src: imm_byte(8),
                        dst: Operand::reg(Reg::Dx),
                    }
                );
                cursor += 1;
            }
        }
        assert_eq!(body[cursor], AsmInstruction::Ret);
    }
}
