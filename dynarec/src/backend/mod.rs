//! Host code generation backend abstraction.
//!
//! `Backend` is the primitive instruction set the block compiler emits
//! against. A single implementation exists (`amd64`), but keeping the
//! compiler's scheduling logic behind a trait mirrors the original
//! dynarec's own split between `dynarec-compiler.c` (target-agnostic
//! scheduling) and `dynarec-amd64.c` (target-specific encoding), and
//! keeps `compiler.rs` readable: it never touches a byte of machine code
//! directly.

pub mod amd64;

pub use amd64::Amd64Assembler;

/// A host general-purpose register. Variants are named for their AMD64
/// identity; `amd64.rs` is the only module that needs their numeric
/// encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostReg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl HostReg {
    /// The 4-bit AMD64 register encoding (ModRM.reg/rm or SIB.base/index),
    /// before the REX extension bit is folded in.
    pub fn encoding(self) -> u8 {
        match self {
            HostReg::Rax => 0,
            HostReg::Rcx => 1,
            HostReg::Rdx => 2,
            HostReg::Rbx => 3,
            HostReg::Rsp => 4,
            HostReg::Rbp => 5,
            HostReg::Rsi => 6,
            HostReg::Rdi => 7,
            HostReg::R8 => 8,
            HostReg::R9 => 9,
            HostReg::R10 => 10,
            HostReg::R11 => 11,
            HostReg::R12 => 12,
            HostReg::R13 => 13,
            HostReg::R14 => 14,
            HostReg::R15 => 15,
        }
    }

    /// Whether encoding this register as a ModRM/SIB field requires the
    /// REX.R/X/B extension bit.
    pub fn needs_rex_extension(self) -> bool {
        self.encoding() >= 8
    }

    /// The low 3 bits used directly in ModRM/SIB, with the extension bit
    /// already stripped off.
    pub fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }
}

/// An unresolved branch target inside a block under compilation. `bind`
/// fixes its address at the current cursor; every `Label` must be bound
/// exactly once before `Amd64Assembler::finish` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub usize);

/// Addressing modes accepted by `load`/`store`.
#[derive(Debug, Clone, Copy)]
pub enum Mem {
    /// `[base + disp]`
    BaseDisp { base: HostReg, disp: i32 },
    /// `[base + index*scale + disp]`, `scale` in {1, 2, 4, 8}.
    BaseIndexDisp { base: HostReg, index: HostReg, scale: u8, disp: i32 },
}

/// ALU operations usable with either an immediate or a register source,
/// matching the `dynarec_add`/`dynarec_sub`/... family in the original
/// AMD64 backend header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

/// Shift operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    /// Logical right shift.
    Shr,
    /// Arithmetic right shift.
    Sar,
}

/// Condition codes usable in conditional jumps, corresponding to the
/// signed/unsigned comparisons MIPS branch and SLT instructions need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Below,
    BelowEqual,
    /// Signed overflow flag set (used after ADD/SUB for the trapping
    /// arithmetic ops).
    Overflow,
}

/// Primitive instruction set the block compiler emits against. Every
/// method appends to the assembler's internal buffer; nothing is
/// observable as real machine code until `finish` copies it into the
/// code arena.
pub trait Backend {
    fn mov_imm(&mut self, dst: HostReg, imm: i64);
    /// Always emits the full 10-byte `REX.W B8+r io` form, regardless
    /// of whether `imm` would fit a shorter encoding. Used for
    /// self-modifying patch sites, where every write must produce the
    /// same instruction length so a later patch can't change the
    /// surrounding code's layout.
    fn mov_imm64_fixed(&mut self, dst: HostReg, imm: i64);
    fn mov_reg(&mut self, dst: HostReg, src: HostReg);
    /// Single-byte NOP, used to pad a patchable region to a fixed
    /// width before it's ever been written.
    fn nop(&mut self);
    fn load(&mut self, dst: HostReg, src: Mem, size_bytes: u8, sign_extend: bool);
    fn store(&mut self, dst: Mem, src: HostReg, size_bytes: u8);
    fn alu_imm(&mut self, op: AluOp, dst: HostReg, imm: i32);
    fn alu_reg(&mut self, op: AluOp, dst: HostReg, src: HostReg);
    fn shift_imm(&mut self, op: ShiftOp, dst: HostReg, amount: u8);
    fn shift_cl(&mut self, op: ShiftOp, dst: HostReg);
    fn imul_reg(&mut self, dst: HostReg, src: HostReg);
    fn cmp_reg(&mut self, lhs: HostReg, rhs: HostReg);
    fn cmp_imm(&mut self, lhs: HostReg, imm: i32);
    fn set_from_cond(&mut self, dst: HostReg, cond: Cond);

    /// Reserve a label. The instruction stream at the label's eventual
    /// bind point is not yet known; use `jmp`/`jcc` with the label
    /// before binding it.
    fn new_label(&mut self) -> Label;
    /// Fix `label`'s address at the current cursor.
    fn bind(&mut self, label: Label);
    fn jmp(&mut self, label: Label);
    fn jcc(&mut self, cond: Cond, label: Label);

    fn push(&mut self, reg: HostReg);
    fn pop(&mut self, reg: HostReg);
    /// Indirect call through a host pointer already held in `target`.
    fn call_indirect(&mut self, target: HostReg);
    /// Unconditional jump to an absolute host address held in `target`.
    /// Used for cross-block edges whose destination is only known at
    /// runtime (JR/JALR, link-trampoline resolution, block exit).
    fn jmp_indirect(&mut self, target: HostReg);
    fn ret(&mut self);

    /// Current write cursor, in bytes from the start of this assembler's
    /// buffer. Used by the compiler to compute branch displacements and
    /// to record a block's final length.
    fn offset(&self) -> usize;

    /// Resolve fixups and emit the finished byte buffer. Fails with the
    /// patch offset of the first label that was never bound.
    fn finish(self) -> Result<Vec<u8>, usize>;
}
