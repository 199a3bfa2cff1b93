//! AMD64 host code emitter.
//!
//! Encodes the `Backend` primitive set directly as x86-64 machine code
//! bytes into an in-memory buffer. REX prefixes are only emitted when
//! the instruction actually needs one (an extended register, a 64-bit
//! operand, or none of the legacy byte-register restrictions apply);
//! immediates use the shortest encoding the operand supports (`imm8`
//! sign-extended into `imm32` slots where the opcode allows it).

use super::{AluOp, Backend, Cond, HostReg, Label, Mem, ShiftOp};

const REX_BASE: u8 = 0x40;
const REX_W: u8 = 0x08;
const REX_R: u8 = 0x04;
const REX_X: u8 = 0x02;
const REX_B: u8 = 0x01;

/// A forward reference to a `Label` that hasn't been bound yet: the
/// byte offset of the 32-bit displacement slot to patch once the
/// label's final address is known.
struct PendingFixup {
    patch_offset: usize,
    label: Label,
}

/// Byte-level AMD64 assembler. Always emits 64-bit-operand-size code
/// for guest register operations since every host GPR holds a sign- or
/// zero-extended 32-bit MIPS value.
pub struct Amd64Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<PendingFixup>,
}

impl Default for Amd64Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Amd64Assembler {
    pub fn new() -> Self {
        Amd64Assembler { code: Vec::new(), labels: Vec::new(), fixups: Vec::new() }
    }

    fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn emit_i32(&mut self, v: i32) {
        self.emit_bytes(&v.to_le_bytes());
    }

    /// Emit a REX prefix iff any of the extension conditions require
    /// one; `w` forces REX.W (64-bit operand size) regardless.
    fn rex(&mut self, w: bool, r: HostReg, x: Option<HostReg>, b: HostReg) {
        let mut byte = REX_BASE;
        if w {
            byte |= REX_W;
        }
        if r.needs_rex_extension() {
            byte |= REX_R;
        }
        if x.map_or(false, HostReg::needs_rex_extension) {
            byte |= REX_X;
        }
        if b.needs_rex_extension() {
            byte |= REX_B;
        }
        if byte != REX_BASE {
            self.emit(byte);
        } else if w {
            self.emit(byte);
        }
    }

    fn modrm(&mut self, mode: u8, reg: HostReg, rm: HostReg) {
        self.emit((mode << 6) | (reg.low_bits() << 3) | rm.low_bits());
    }

    /// Emit the ModRM (+ SIB + displacement) bytes addressing `mem`,
    /// with `reg` in the reg field.
    fn modrm_mem(&mut self, reg: HostReg, mem: Mem) {
        match mem {
            Mem::BaseDisp { base, disp } => {
                let needs_sib = base.low_bits() == HostReg::Rsp.low_bits();
                let mode = disp_mode(disp, base);
                self.emit((mode << 6) | (reg.low_bits() << 3) | if needs_sib { 0b100 } else { base.low_bits() });
                if needs_sib {
                    self.emit((0 << 6) | (0b100 << 3) | base.low_bits());
                }
                emit_disp(self, mode, disp);
            }
            Mem::BaseIndexDisp { base, index, scale, disp } => {
                let mode = disp_mode(disp, base);
                self.emit((mode << 6) | (reg.low_bits() << 3) | 0b100);
                let ss = match scale {
                    1 => 0,
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => panic!("invalid SIB scale {scale}"),
                };
                self.emit((ss << 6) | (index.low_bits() << 3) | base.low_bits());
                emit_disp(self, mode, disp);
            }
        }
    }

    fn mem_rex_parts(mem: Mem) -> (Option<HostReg>, HostReg) {
        match mem {
            Mem::BaseDisp { base, .. } => (None, base),
            Mem::BaseIndexDisp { base, index, .. } => (Some(index), base),
        }
    }

}

fn disp_mode(disp: i32, base: HostReg) -> u8 {
    // RBP/R13 as a base with no displacement still needs an explicit
    // disp8(0) encoding: mode 00 with that base field is the RIP-relative
    // escape, not "no displacement".
    let rbp_like = base.low_bits() == HostReg::Rbp.low_bits();
    if disp == 0 && !rbp_like {
        0b00
    } else if i8::try_from(disp).is_ok() {
        0b01
    } else {
        0b10
    }
}

fn emit_disp(asm: &mut Amd64Assembler, mode: u8, disp: i32) {
    match mode {
        0b00 => {}
        0b01 => asm.emit(disp as i8 as u8),
        0b10 => asm.emit_i32(disp),
        _ => unreachable!(),
    }
}

fn alu_opcode_reg(op: AluOp) -> u8 {
    match op {
        AluOp::Add => 0x01,
        AluOp::Sub => 0x29,
        AluOp::And => 0x21,
        AluOp::Or => 0x09,
        AluOp::Xor => 0x31,
    }
}

/// The `/digit` extension used by the imm8/imm32-group-1 opcodes
/// (0x83/0x81) for each ALU op.
fn alu_group1_ext(op: AluOp) -> u8 {
    match op {
        AluOp::Add => 0,
        AluOp::Or => 1,
        AluOp::And => 4,
        AluOp::Sub => 5,
        AluOp::Xor => 6,
    }
}

fn shift_ext(op: ShiftOp) -> u8 {
    match op {
        ShiftOp::Shl => 4,
        ShiftOp::Shr => 5,
        ShiftOp::Sar => 7,
    }
}

fn cond_code(cond: Cond) -> u8 {
    match cond {
        Cond::Overflow => 0x0,
        Cond::Equal => 0x4,
        Cond::NotEqual => 0x5,
        Cond::Below => 0x2,
        Cond::BelowEqual => 0x6,
        Cond::Less => 0xC,
        Cond::LessEqual => 0xE,
        Cond::Greater => 0xF,
        Cond::GreaterEqual => 0xD,
    }
}

impl Backend for Amd64Assembler {
    fn mov_imm(&mut self, dst: HostReg, imm: i64) {
        if let Ok(v) = i32::try_from(imm) {
            // REX.W + C7 /0 id : MOV r/m64, imm32 (sign-extended).
            self.rex(true, HostReg::Rax, None, dst);
            self.emit(0xC7);
            self.modrm(0b11, HostReg::Rax, dst);
            self.emit_i32(v);
        } else {
            // REX.W + B8+r io : MOV r64, imm64.
            self.rex(true, HostReg::Rax, None, dst);
            self.emit(0xB8 + dst.low_bits());
            self.emit_bytes(&imm.to_le_bytes());
        }
    }

    fn mov_imm64_fixed(&mut self, dst: HostReg, imm: i64) {
        self.rex(true, HostReg::Rax, None, dst);
        self.emit(0xB8 + dst.low_bits());
        self.emit_bytes(&imm.to_le_bytes());
    }

    fn nop(&mut self) {
        self.emit(0x90);
    }

    fn mov_reg(&mut self, dst: HostReg, src: HostReg) {
        // REX.W + 89 /r : MOV r/m64, r64.
        self.rex(true, src, None, dst);
        self.emit(0x89);
        self.modrm(0b11, src, dst);
    }

    fn load(&mut self, dst: HostReg, src: Mem, size_bytes: u8, sign_extend: bool) {
        let (index, base) = Self::mem_rex_parts(src);
        match (size_bytes, sign_extend) {
            (8, _) => {
                // REX.W + 8B /r : MOV r64, r/m64.
                self.rex(true, dst, index, base);
                self.emit(0x8B);
                self.modrm_mem(dst, src);
            }
            (4, false) => {
                // mov r32, r/m32 zero-extends into the full r64 for free.
                self.rex(false, dst, index, base);
                self.emit(0x8B);
                self.modrm_mem(dst, src);
            }
            (4, true) => {
                // REX.W + 63 /r : MOVSXD r64, r/m32.
                self.rex(true, dst, index, base);
                self.emit(0x63);
                self.modrm_mem(dst, src);
            }
            (2, false) => {
                self.rex(false, dst, index, base);
                self.emit_bytes(&[0x0F, 0xB7]);
                self.modrm_mem(dst, src);
            }
            (2, true) => {
                self.rex(true, dst, index, base);
                self.emit_bytes(&[0x0F, 0xBF]);
                self.modrm_mem(dst, src);
            }
            (1, false) => {
                self.rex(false, dst, index, base);
                self.emit_bytes(&[0x0F, 0xB6]);
                self.modrm_mem(dst, src);
            }
            (1, true) => {
                self.rex(true, dst, index, base);
                self.emit_bytes(&[0x0F, 0xBE]);
                self.modrm_mem(dst, src);
            }
            _ => panic!("unsupported load width {size_bytes}"),
        }
    }

    fn store(&mut self, dst: Mem, src: HostReg, size_bytes: u8) {
        let (index, base) = Self::mem_rex_parts(dst);
        match size_bytes {
            8 => {
                // REX.W + 89 /r : MOV r/m64, r64.
                self.rex(true, src, index, base);
                self.emit(0x89);
                self.modrm_mem(src, dst);
            }
            4 => {
                self.rex(false, src, index, base);
                self.emit(0x89);
                self.modrm_mem(src, dst);
            }
            2 => {
                // 66 prefix selects the 16-bit operand-size override.
                self.emit(0x66);
                self.rex(false, src, index, base);
                self.emit(0x89);
                self.modrm_mem(src, dst);
            }
            1 => {
                self.rex(false, src, index, base);
                self.emit(0x88);
                self.modrm_mem(src, dst);
            }
            _ => panic!("unsupported store width {size_bytes}"),
        }
    }

    fn alu_imm(&mut self, op: AluOp, dst: HostReg, imm: i32) {
        self.rex(true, HostReg::Rax, None, dst);
        if let Ok(v) = i8::try_from(imm) {
            self.emit(0x83);
            self.modrm(0b11, host_reg_from_ext(alu_group1_ext(op)), dst);
            self.emit(v as u8);
        } else {
            self.emit(0x81);
            self.modrm(0b11, host_reg_from_ext(alu_group1_ext(op)), dst);
            self.emit_i32(imm);
        }
    }

    fn alu_reg(&mut self, op: AluOp, dst: HostReg, src: HostReg) {
        self.rex(true, src, None, dst);
        self.emit(alu_opcode_reg(op));
        self.modrm(0b11, src, dst);
    }

    fn shift_imm(&mut self, op: ShiftOp, dst: HostReg, amount: u8) {
        self.rex(true, HostReg::Rax, None, dst);
        self.emit(0xC1);
        self.modrm(0b11, host_reg_from_ext(shift_ext(op)), dst);
        self.emit(amount);
    }

    fn shift_cl(&mut self, op: ShiftOp, dst: HostReg) {
        self.rex(true, HostReg::Rax, None, dst);
        self.emit(0xD3);
        self.modrm(0b11, host_reg_from_ext(shift_ext(op)), dst);
    }

    fn imul_reg(&mut self, dst: HostReg, src: HostReg) {
        // REX.W + 0F AF /r : IMUL r64, r/m64.
        self.rex(true, dst, None, src);
        self.emit_bytes(&[0x0F, 0xAF]);
        self.modrm(0b11, dst, src);
    }

    fn cmp_reg(&mut self, lhs: HostReg, rhs: HostReg) {
        self.rex(true, rhs, None, lhs);
        self.emit(0x39);
        self.modrm(0b11, rhs, lhs);
    }

    fn cmp_imm(&mut self, lhs: HostReg, imm: i32) {
        self.rex(true, HostReg::Rax, None, lhs);
        if let Ok(v) = i8::try_from(imm) {
            self.emit(0x83);
            self.modrm(0b11, host_reg_from_ext(7), lhs);
            self.emit(v as u8);
        } else {
            self.emit(0x81);
            self.modrm(0b11, host_reg_from_ext(7), lhs);
            self.emit_i32(imm);
        }
    }

    fn set_from_cond(&mut self, dst: HostReg, cond: Cond) {
        // 0F 90+cc /0 : SETcc r/m8, then zero-extend into the full r64.
        self.rex(false, HostReg::Rax, None, dst);
        self.emit_bytes(&[0x0F, 0x90 | cond_code(cond)]);
        self.modrm(0b11, host_reg_from_ext(0), dst);
        self.rex(false, dst, None, dst);
        self.emit_bytes(&[0x0F, 0xB6]);
        self.modrm(0b11, dst, dst);
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    fn jmp(&mut self, label: Label) {
        self.emit(0xE9);
        let patch_offset = self.code.len();
        self.emit_i32(0);
        self.fixups.push(PendingFixup { patch_offset, label });
    }

    fn jcc(&mut self, cond: Cond, label: Label) {
        self.emit_bytes(&[0x0F, 0x80 | cond_code(cond)]);
        let patch_offset = self.code.len();
        self.emit_i32(0);
        self.fixups.push(PendingFixup { patch_offset, label });
    }

    fn push(&mut self, reg: HostReg) {
        if reg.needs_rex_extension() {
            self.emit(REX_BASE | REX_B);
        }
        self.emit(0x50 + reg.low_bits());
    }

    fn pop(&mut self, reg: HostReg) {
        if reg.needs_rex_extension() {
            self.emit(REX_BASE | REX_B);
        }
        self.emit(0x58 + reg.low_bits());
    }

    fn call_indirect(&mut self, target: HostReg) {
        if target.needs_rex_extension() {
            self.emit(REX_BASE | REX_B);
        }
        self.emit(0xFF);
        self.modrm(0b11, host_reg_from_ext(2), target);
    }

    fn jmp_indirect(&mut self, target: HostReg) {
        // FF /4 : JMP r/m64.
        if target.needs_rex_extension() {
            self.emit(REX_BASE | REX_B);
        }
        self.emit(0xFF);
        self.modrm(0b11, host_reg_from_ext(4), target);
    }

    fn ret(&mut self) {
        self.emit(0xC3);
    }

    /// Copy the finished buffer into the code arena at `dst`, resolving
    /// every fixup along the way. Panics (surfaced as `HostError::DisplacementOverflow`
    /// by the caller) only if a label was never bound.
    fn finish(mut self) -> Result<Vec<u8>, usize> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0].ok_or(fixup.patch_offset)?;
            let disp = target as i64 - (fixup.patch_offset as i64 + 4);
            let disp = disp as i32;
            self.code[fixup.patch_offset..fixup.patch_offset + 4].copy_from_slice(&disp.to_le_bytes());
        }
        Ok(self.code)
    }

    fn offset(&self) -> usize {
        self.code.len()
    }
}

/// Group-1/group-2 opcode extensions live in the ModRM.reg field, which
/// only needs 3 low bits; we borrow `HostReg`'s encoding table to get a
/// register value with the right low bits without a second enum.
fn host_reg_from_ext(ext: u8) -> HostReg {
    match ext {
        0 => HostReg::Rax,
        1 => HostReg::Rcx,
        2 => HostReg::Rdx,
        4 => HostReg::Rsp,
        5 => HostReg::Rbp,
        6 => HostReg::Rsi,
        7 => HostReg::Rdi,
        _ => panic!("unused opcode extension {ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_imm_picks_shortest_form() {
        let mut a = Amd64Assembler::new();
        a.mov_imm(HostReg::Rax, 1);
        let code = a.finish().unwrap();
        // REX.W C7 /0 id -- 7 bytes, not the 10-byte imm64 form.
        assert_eq!(code.len(), 7);
    }

    #[test]
    fn mov_imm_uses_full_width_when_required() {
        let mut a = Amd64Assembler::new();
        a.mov_imm(HostReg::Rax, 0x1_0000_0000);
        let code = a.finish().unwrap();
        assert_eq!(code.len(), 10);
    }

    #[test]
    fn extended_register_gets_rex_b() {
        let mut a = Amd64Assembler::new();
        a.mov_reg(HostReg::R8, HostReg::Rax);
        let code = a.finish().unwrap();
        assert_eq!(code[0] & REX_B, REX_B);
    }

    #[test]
    fn alu_imm_picks_imm8_form_when_it_fits() {
        let mut a = Amd64Assembler::new();
        a.alu_imm(AluOp::Add, HostReg::Rax, 5);
        let code = a.finish().unwrap();
        assert_eq!(code[1], 0x83);
    }

    #[test]
    fn alu_imm_falls_back_to_imm32() {
        let mut a = Amd64Assembler::new();
        a.alu_imm(AluOp::Add, HostReg::Rax, 100_000);
        let code = a.finish().unwrap();
        assert_eq!(code[1], 0x81);
    }

    #[test]
    fn forward_branch_resolves_to_positive_displacement() {
        let mut a = Amd64Assembler::new();
        let label = a.new_label();
        a.jmp(label);
        a.mov_imm(HostReg::Rax, 0);
        a.bind(label);
        let code = a.finish().unwrap();
        let disp = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(disp, (code.len() - 5) as i32);
    }

    #[test]
    fn unbound_label_fails_to_finish() {
        let mut a = Amd64Assembler::new();
        let label = a.new_label();
        a.jmp(label);
        assert!(a.finish().is_err());
    }
}
