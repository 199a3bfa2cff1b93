//! Decoded MIPS instruction representation.
//!
//! The decoder produces an `OpDesc` that fully describes what a single
//! guest instruction does in terms the block compiler can schedule and
//! emit without re-examining the raw encoding. The fields mirror
//! `struct opdesc` from the original dynarec compiler.

use crate::regs::PsxReg;

/// Classification of a decoded instruction, driving how the block
/// compiler schedules and emits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// No observable effect; compiled to nothing.
    Nop,
    /// Anything that doesn't fit another category.
    Simple,
    /// Unconditional branch or jump: control is guaranteed to leave
    /// the block (after its delay slot).
    BranchAlways,
    /// Conditional branch: may or may not be taken at runtime.
    BranchCond,
    /// SYSCALL/BREAK or a decoded-illegal encoding: no delay slot,
    /// execution leaves the block immediately.
    Exception,
    /// Load instruction carrying a one-slot load delay.
    Load,
    /// LWL/LWR: combines with an adjacent load in a delay-slot
    /// relationship, and is a peephole-fold candidate.
    LoadCombine,
    /// SWL/SWR: unaligned store, a peephole-fold candidate.
    StoreNoAlign,
}

/// An immediate value with both a signed and unsigned view over the
/// same 32 bits, matching the original's `union { int32_t; uint32_t; }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Imm(pub u32);

impl Imm {
    #[inline]
    pub fn unsigned(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn signed(self) -> i32 {
        self.0 as i32
    }

    #[inline]
    pub fn from_i16(v: i16) -> Imm {
        Imm(v as i32 as u32)
    }

    #[inline]
    pub fn from_u16(v: u16) -> Imm {
        Imm(v as u32)
    }
}

/// A fully decoded MIPS instruction. All register slots default to
/// `PsxReg::R0` when unused, so emitters never need to check validity
/// before reading a slot that a given `OpType` doesn't use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpDesc {
    /// Raw 32-bit instruction word, kept for diagnostics and for the
    /// compiler's opcode/function re-dispatch.
    pub instruction: u32,
    pub op_type: OpType,
    /// Destination register, or `R0` if the instruction writes nothing.
    pub target: PsxReg,
    /// First source operand (`rs` in most encodings).
    pub op0: PsxReg,
    /// Second source operand (`rt` in most encodings).
    pub op1: PsxReg,
    pub imm: Imm,
}

impl OpDesc {
    /// An instruction with no effect, used as the decoder's default
    /// and as the canonical "no-op" sentinel the compiler recognizes.
    pub const NOP: OpDesc = OpDesc {
        instruction: 0,
        op_type: OpType::Nop,
        target: PsxReg::R0,
        op0: PsxReg::R0,
        op1: PsxReg::R0,
        imm: Imm(0),
    };

    /// Whether this instruction, if it's the second half of a
    /// delay-slot pair, reads `reg` as one of its source operands.
    pub fn reads(&self, reg: PsxReg) -> bool {
        (self.op0 == reg || self.op1 == reg) && !reg.is_zero()
    }

    /// Whether this instruction writes `reg`.
    pub fn writes(&self, reg: PsxReg) -> bool {
        self.target == reg && !reg.is_zero()
    }
}
