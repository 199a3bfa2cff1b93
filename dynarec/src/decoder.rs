//! MIPS R3000A instruction decoder.
//!
//! `decode` is a pure function: raw 32-bit instruction word in,
//! `OpDesc` out. It never touches guest memory or dynarec state —
//! the block compiler supplies the word (having already fetched it
//! from RAM or BIOS) and threads the result into the emission pipeline.

use crate::instruction::{Imm, OpDesc, OpType};
use crate::mips_consts::*;
use crate::regs::PsxReg;

#[inline]
fn field_rs(word: u32) -> PsxReg {
    PsxReg::from_index((word >> 21) & 0x1F)
}

#[inline]
fn field_rt(word: u32) -> PsxReg {
    PsxReg::from_index((word >> 16) & 0x1F)
}

#[inline]
fn field_rd(word: u32) -> PsxReg {
    PsxReg::from_index((word >> 11) & 0x1F)
}

#[inline]
fn field_shamt(word: u32) -> u32 {
    (word >> 6) & 0x1F
}

#[inline]
fn field_imm16(word: u32) -> u16 {
    (word & 0xFFFF) as u16
}

#[inline]
fn field_jump_target(word: u32) -> u32 {
    word & 0x03FF_FFFF
}

/// Decode one 32-bit little-endian MIPS R3000A instruction word.
pub fn decode(word: u32) -> OpDesc {
    let opcode = (word >> 26) & 0x3F;

    let desc = match opcode {
        OP_SPECIAL => decode_special(word),
        OP_BCOND => decode_bcond(word),
        OP_J => OpDesc {
            instruction: word,
            op_type: OpType::BranchAlways,
            target: PsxReg::R0,
            op0: PsxReg::R0,
            op1: PsxReg::R0,
            imm: Imm(field_jump_target(word)),
        },
        OP_JAL => OpDesc {
            instruction: word,
            op_type: OpType::BranchAlways,
            target: PsxReg::Ra,
            op0: PsxReg::R0,
            op1: PsxReg::R0,
            imm: Imm(field_jump_target(word)),
        },
        OP_BEQ => decode_branch_eq(word, true),
        OP_BNE => decode_branch_eq(word, false),
        OP_BLEZ => OpDesc {
            instruction: word,
            op_type: OpType::BranchCond,
            target: PsxReg::R0,
            op0: field_rs(word),
            op1: PsxReg::R0,
            imm: Imm::from_i16(field_imm16(word) as i16),
        },
        OP_BGTZ => OpDesc {
            instruction: word,
            op_type: OpType::BranchCond,
            target: PsxReg::R0,
            op0: field_rs(word),
            op1: PsxReg::R0,
            imm: Imm::from_i16(field_imm16(word) as i16),
        },
        OP_ADDI => simple_ri_signed(word),
        OP_ADDIU => simple_ri_signed(word),
        OP_SLTI => simple_ri_signed(word),
        OP_SLTIU => simple_ri_signed(word),
        OP_ANDI => simple_ri_unsigned(word),
        OP_ORI => simple_ri_unsigned(word),
        OP_XORI => simple_ri_unsigned(word),
        OP_LUI => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: field_rt(word),
            op0: PsxReg::R0,
            op1: PsxReg::R0,
            imm: Imm::from_u16(field_imm16(word)),
        },
        OP_COP0 => decode_cop0(word),
        OP_COP2 => decode_cop2(word),
        OP_LB | OP_LBU | OP_LH | OP_LHU | OP_LW => OpDesc {
            instruction: word,
            op_type: OpType::Load,
            target: field_rt(word),
            op0: field_rs(word),
            op1: PsxReg::R0,
            imm: Imm::from_i16(field_imm16(word) as i16),
        },
        OP_LWL | OP_LWR => OpDesc {
            instruction: word,
            op_type: OpType::LoadCombine,
            target: field_rt(word),
            op0: field_rs(word),
            op1: PsxReg::R0,
            imm: Imm::from_i16(field_imm16(word) as i16),
        },
        OP_SB | OP_SH | OP_SW => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: PsxReg::R0,
            op0: field_rs(word),
            op1: field_rt(word),
            imm: Imm::from_i16(field_imm16(word) as i16),
        },
        OP_SWL | OP_SWR => OpDesc {
            instruction: word,
            op_type: OpType::StoreNoAlign,
            target: PsxReg::R0,
            op0: field_rs(word),
            op1: field_rt(word),
            imm: Imm::from_i16(field_imm16(word) as i16),
        },
        OP_LWC2 => OpDesc {
            instruction: word,
            op_type: OpType::Load,
            target: PsxReg::R0,
            op0: field_rs(word),
            op1: PsxReg::R0,
            imm: Imm::from_i16(field_imm16(word) as i16),
        },
        OP_SWC2 => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: PsxReg::R0,
            op0: field_rs(word),
            op1: PsxReg::R0,
            imm: Imm::from_i16(field_imm16(word) as i16),
        },
        _ => illegal(word),
    };

    collapse_dead_simple(desc)
}

/// ADD/SUB are the only SPECIAL-function ALU ops that can raise an
/// exception (overflow), so they keep type `Simple` even when their
/// target is `R0`. Every other `Simple` op with target `R0` collapses
/// to `Nop`.
fn collapse_dead_simple(desc: OpDesc) -> OpDesc {
    if desc.op_type != OpType::Simple || !desc.target.is_zero() {
        return desc;
    }
    let opcode = desc.instruction >> 26;
    let func = desc.instruction & 0x3F;
    let traps = (opcode == OP_SPECIAL && (func == FN_ADD || func == FN_SUB))
        || opcode == OP_ADDI;
    if traps {
        desc
    } else {
        OpDesc { op_type: OpType::Nop, ..desc }
    }
}

/// ADDI/ADDIU/SLTI/SLTIU all sign-extend their immediate per the MIPS
/// ISA (only ANDI/ORI/XORI zero-extend, handled by `simple_ri_unsigned`).
fn simple_ri_signed(word: u32) -> OpDesc {
    OpDesc {
        instruction: word,
        op_type: OpType::Simple,
        target: field_rt(word),
        op0: field_rs(word),
        op1: PsxReg::R0,
        imm: Imm::from_i16(field_imm16(word) as i16),
    }
}

fn simple_ri_unsigned(word: u32) -> OpDesc {
    OpDesc {
        instruction: word,
        op_type: OpType::Simple,
        target: field_rt(word),
        op0: field_rs(word),
        op1: PsxReg::R0,
        imm: Imm::from_u16(field_imm16(word)),
    }
}

fn decode_branch_eq(word: u32, on_equal: bool) -> OpDesc {
    let rs = field_rs(word);
    let rt = field_rt(word);
    let imm = Imm::from_i16(field_imm16(word) as i16);
    if rs == rt {
        // BEQ rs,rs -> always taken; BNE rs,rs -> never taken.
        return if on_equal {
            OpDesc {
                instruction: word,
                op_type: OpType::BranchAlways,
                target: PsxReg::R0,
                op0: PsxReg::R0,
                op1: PsxReg::R0,
                imm,
            }
        } else {
            OpDesc { op_type: OpType::Nop, ..OpDesc::NOP }
        };
    }
    OpDesc {
        instruction: word,
        op_type: OpType::BranchCond,
        target: PsxReg::R0,
        op0: rs,
        op1: rt,
        imm,
    }
}

/// BLTZ/BGEZ/BLTZAL/BGEZAL share primary opcode 0x01. The `rt` field
/// (bits 16-20) selects the variant: bit 16 (rt bit 0) picks GE vs LT;
/// bits 17-20 (rt bits 4:1) equal to 0b1000 select the linking variant,
/// which always sets target = RA regardless of whether the branch is
/// taken.
fn decode_bcond(word: u32) -> OpDesc {
    let rt = (word >> 16) & 0x1F;
    let is_link = (rt >> 1) & 0xF == 0b1000;
    let target = if is_link { PsxReg::Ra } else { PsxReg::R0 };
    OpDesc {
        instruction: word,
        op_type: OpType::BranchCond,
        target,
        op0: field_rs(word),
        op1: PsxReg::R0,
        imm: Imm::from_i16(field_imm16(word) as i16),
    }
}

fn decode_special(word: u32) -> OpDesc {
    let func = word & 0x3F;
    let rd = field_rd(word);
    let rs = field_rs(word);
    let rt = field_rt(word);
    let shamt = field_shamt(word);

    match func {
        FN_SLL | FN_SRL | FN_SRA => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: rd,
            op0: rt,
            op1: PsxReg::R0,
            imm: Imm(shamt),
        },
        FN_SLLV | FN_SRLV | FN_SRAV => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: rd,
            op0: rt,
            op1: rs,
            imm: Imm(0),
        },
        FN_JR => OpDesc {
            instruction: word,
            op_type: OpType::BranchAlways,
            target: PsxReg::R0,
            op0: rs,
            op1: PsxReg::R0,
            imm: Imm(0),
        },
        FN_JALR => OpDesc {
            instruction: word,
            op_type: OpType::BranchAlways,
            target: rd,
            op0: rs,
            op1: PsxReg::R0,
            imm: Imm(0),
        },
        FN_SYSCALL => OpDesc {
            instruction: word,
            op_type: OpType::Exception,
            target: PsxReg::R0,
            op0: PsxReg::R0,
            op1: PsxReg::R0,
            imm: Imm((word >> 6) & 0xF_FFFF),
        },
        FN_BREAK => OpDesc {
            instruction: word,
            op_type: OpType::Exception,
            target: PsxReg::R0,
            op0: PsxReg::R0,
            op1: PsxReg::R0,
            imm: Imm((word >> 6) & 0xF_FFFF),
        },
        FN_MFHI => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: rd,
            op0: PsxReg::Hi,
            op1: PsxReg::R0,
            imm: Imm(0),
        },
        FN_MTHI => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: PsxReg::Hi,
            op0: rs,
            op1: PsxReg::R0,
            imm: Imm(0),
        },
        FN_MFLO => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: rd,
            op0: PsxReg::Lo,
            op1: PsxReg::R0,
            imm: Imm(0),
        },
        FN_MTLO => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: PsxReg::Lo,
            op0: rs,
            op1: PsxReg::R0,
            imm: Imm(0),
        },
        FN_MULT | FN_MULTU | FN_DIV | FN_DIVU => OpDesc {
            instruction: word,
            // Writes HI and LO; modeled as a Simple op whose "target"
            // is Lo and whose compiler emitter also updates Hi — see
            // compiler.rs for the HI/LO producer/consumer invariant.
            op_type: OpType::Simple,
            target: PsxReg::Lo,
            op0: rs,
            op1: rt,
            imm: Imm(0),
        },
        FN_ADD | FN_ADDU | FN_SUB | FN_SUBU | FN_AND | FN_OR | FN_XOR | FN_NOR
        | FN_SLT | FN_SLTU => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: rd,
            op0: rs,
            op1: rt,
            imm: Imm(0),
        },
        f if FN_RESERVED.contains(&f) => illegal(word),
        _ => illegal(word),
    }
}

fn decode_cop0(word: u32) -> OpDesc {
    let sub = (word >> 21) & 0x1F;
    let rt = field_rt(word);
    let rd_index = (word >> 11) & 0x1F;
    match sub {
        COP_MF => OpDesc {
            instruction: word,
            op_type: OpType::Load,
            target: rt,
            op0: PsxReg::R0,
            op1: PsxReg::R0,
            imm: Imm(rd_index),
        },
        COP_MT => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: PsxReg::R0,
            op0: rt,
            op1: PsxReg::R0,
            imm: Imm(rd_index),
        },
        _ if word & 0x3F == FN_RFE && (word >> 25) & 1 == 1 => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: PsxReg::R0,
            op0: PsxReg::R0,
            op1: PsxReg::R0,
            imm: Imm(0),
        },
        _ => OpDesc { op_type: OpType::Nop, ..OpDesc::NOP },
    }
}

/// COP2 (GTE) instructions are out of scope: the arithmetic pipeline
/// belongs to the external GTE collaborator. The decoder still
/// classifies them correctly so the compiler can route MFC2/CFC2 as
/// loads and everything else (including GTE command words) as
/// callback-only `Simple` stubs.
fn decode_cop2(word: u32) -> OpDesc {
    let sub = (word >> 21) & 0x1F;
    let rt = field_rt(word);
    let rd_index = (word >> 11) & 0x1F;
    match sub {
        0x00 /* MFC2 */ | 0x02 /* CFC2 */ => OpDesc {
            instruction: word,
            op_type: OpType::Load,
            target: rt,
            op0: PsxReg::R0,
            op1: PsxReg::R0,
            imm: Imm(rd_index),
        },
        _ => OpDesc {
            instruction: word,
            op_type: OpType::Simple,
            target: PsxReg::R0,
            op0: rt,
            op1: PsxReg::R0,
            imm: Imm(rd_index),
        },
    }
}

fn illegal(word: u32) -> OpDesc {
    OpDesc {
        instruction: word,
        op_type: OpType::Exception,
        target: PsxReg::R0,
        op0: PsxReg::R0,
        op1: PsxReg::R0,
        imm: Imm(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc_r(opcode: u32, rs: u32, rt: u32, rd: u32, shamt: u32, func: u32) -> u32 {
        (opcode << 26) | (rs << 21) | (rt << 16) | (rd << 11) | (shamt << 6) | func
    }

    fn enc_i(opcode: u32, rs: u32, rt: u32, imm: u16) -> u32 {
        (opcode << 26) | (rs << 21) | (rt << 16) | imm as u32
    }

    #[test]
    fn target_r0_non_trapping_is_nop() {
        // ADDU $zero, $t0, $t0
        let word = enc_r(OP_SPECIAL, 8, 8, 0, 0, FN_ADDU);
        assert_eq!(decode(word).op_type, OpType::Nop);
    }

    #[test]
    fn add_with_target_r0_stays_simple() {
        // ADD $zero, $t0, $t0 -- may trap on overflow
        let word = enc_r(OP_SPECIAL, 8, 8, 0, 0, FN_ADD);
        assert_eq!(decode(word).op_type, OpType::Simple);
    }

    #[test]
    fn addi_with_target_r0_stays_simple() {
        let word = enc_i(OP_ADDI, 8, 0, 1);
        assert_eq!(decode(word).op_type, OpType::Simple);
    }

    #[test]
    fn beq_same_reg_is_branch_always() {
        let word = enc_i(OP_BEQ, 8, 8, 4);
        assert_eq!(decode(word).op_type, OpType::BranchAlways);
    }

    #[test]
    fn bne_same_reg_is_nop() {
        let word = enc_i(OP_BNE, 8, 8, 4);
        assert_eq!(decode(word).op_type, OpType::Nop);
    }

    #[test]
    fn bltzal_sets_link_target_regardless_of_sense() {
        // rt = 0b10000 = 16 -> BLTZAL
        let word = enc_i(OP_BCOND, 8, 16, 4);
        let d = decode(word);
        assert_eq!(d.op_type, OpType::BranchCond);
        assert_eq!(d.target, PsxReg::Ra);
    }

    #[test]
    fn bgez_no_link() {
        // rt = 1 -> BGEZ
        let word = enc_i(OP_BCOND, 8, 1, 4);
        let d = decode(word);
        assert_eq!(d.target, PsxReg::R0);
    }

    #[test]
    fn lwl_lwr_are_load_combine() {
        assert_eq!(decode(enc_i(OP_LWL, 8, 9, 0)).op_type, OpType::LoadCombine);
        assert_eq!(decode(enc_i(OP_LWR, 8, 9, 0)).op_type, OpType::LoadCombine);
    }

    #[test]
    fn swl_swr_are_store_noalign() {
        assert_eq!(decode(enc_i(OP_SWL, 8, 9, 0)).op_type, OpType::StoreNoAlign);
        assert_eq!(decode(enc_i(OP_SWR, 8, 9, 0)).op_type, OpType::StoreNoAlign);
    }

    #[test]
    fn syscall_carries_code_in_imm() {
        let word = enc_r(OP_SPECIAL, 0, 0, 0, 0, 0) | (0xDEAD << 6) | FN_SYSCALL;
        let d = decode(word);
        assert_eq!(d.op_type, OpType::Exception);
        assert_eq!(d.imm.unsigned(), 0xDEAD);
    }

    #[test]
    fn reserved_special_function_is_illegal() {
        let word = enc_r(OP_SPECIAL, 0, 0, 0, 0, 0x1F);
        assert_eq!(decode(word).op_type, OpType::Exception);
    }

    #[test]
    fn lui_loads_upper_16() {
        let word = enc_i(OP_LUI, 0, 8, 0xBEEF);
        let d = decode(word);
        assert_eq!(d.op_type, OpType::Simple);
        assert_eq!(d.imm.unsigned(), 0xBEEF);
    }
}
