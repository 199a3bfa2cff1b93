//! Guest register identifiers.
//!
//! `PsxReg` extends the 32 architectural MIPS GPRs with three synthetic
//! slots the dynarec needs internally: `Dt` (delay-slot shadow), and
//! `Hi`/`Lo` (multiply/divide results). Two competing `PSX_REG`
//! definitions exist in the original codebase, one with these three
//! extra slots and one without; this crate always uses the extended
//! form (see DESIGN.md).

/// A guest register reference, as it appears in a decoded instruction
/// or as an operand to a backend emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PsxReg {
    R0 = 0,
    At = 1,
    V0 = 2,
    V1 = 3,
    A0 = 4,
    A1 = 5,
    A2 = 6,
    A3 = 7,
    T0 = 8,
    T1 = 9,
    T2 = 10,
    T3 = 11,
    T4 = 12,
    T5 = 13,
    T6 = 14,
    T7 = 15,
    S0 = 16,
    S1 = 17,
    S2 = 18,
    S3 = 19,
    S4 = 20,
    S5 = 21,
    S6 = 22,
    S7 = 23,
    T8 = 24,
    T9 = 25,
    K0 = 26,
    K1 = 27,
    Gp = 28,
    Sp = 29,
    Fp = 30,
    Ra = 31,
    /// Dynarec-internal shadow register, never present in a guest
    /// instruction encoding. Used only to carry a pre-hazard operand
    /// value across a reordered delay slot.
    Dt = 32,
    /// Multiply/divide high result.
    Hi = 33,
    /// Multiply/divide low result / quotient.
    Lo = 34,
}

/// Total number of `PsxReg` slots, including the synthetic ones.
pub const PSX_REG_TOTAL: usize = 35;

impl PsxReg {
    /// Decode a 5-bit guest GPR field (0-31) from an instruction.
    #[inline]
    pub fn from_index(index: u32) -> PsxReg {
        debug_assert!(index < 32);
        // Safety-free: table lookup avoids `unsafe` transmute of an
        // out-of-range discriminant.
        const TABLE: [PsxReg; 32] = [
            PsxReg::R0, PsxReg::At, PsxReg::V0, PsxReg::V1,
            PsxReg::A0, PsxReg::A1, PsxReg::A2, PsxReg::A3,
            PsxReg::T0, PsxReg::T1, PsxReg::T2, PsxReg::T3,
            PsxReg::T4, PsxReg::T5, PsxReg::T6, PsxReg::T7,
            PsxReg::S0, PsxReg::S1, PsxReg::S2, PsxReg::S3,
            PsxReg::S4, PsxReg::S5, PsxReg::S6, PsxReg::S7,
            PsxReg::T8, PsxReg::T9, PsxReg::K0, PsxReg::K1,
            PsxReg::Gp, PsxReg::Sp, PsxReg::Fp, PsxReg::Ra,
        ];
        TABLE[index as usize]
    }

    /// Whether this is the hardwired-zero register: reads always
    /// return 0, writes are always discarded, and emitted code must
    /// never compute a storage offset for it.
    #[inline]
    pub fn is_zero(self) -> bool {
        matches!(self, PsxReg::R0)
    }

    /// Byte offset of this register inside `DynarecState::regs`,
    /// mirroring `DYNAREC_STATE_REG_OFFSET` from the original header.
    /// Panics on `R0`, which has no storage.
    pub fn state_offset(self) -> usize {
        assert!(!self.is_zero(), "R0 has no storage offset");
        (self as usize - 1) * 4
    }
}

/// Coprocessor 0 (System Control Coprocessor) register indices,
/// reachable via MTC0/MFC0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cop0Reg {
    Bpc = 3,
    Bda = 5,
    JumpDest = 6,
    Dcic = 7,
    BadVAddr = 8,
    Bdam = 9,
    Bpcm = 11,
    Sr = 12,
    Cause = 13,
    Epc = 14,
    Prid = 15,
}

impl Cop0Reg {
    /// Decode a 5-bit COP0 register field, returning `None` for the
    /// reserved/unused slots (R0-R2, R4, R10).
    pub fn from_index(index: u32) -> Option<Cop0Reg> {
        match index {
            3 => Some(Cop0Reg::Bpc),
            5 => Some(Cop0Reg::Bda),
            6 => Some(Cop0Reg::JumpDest),
            7 => Some(Cop0Reg::Dcic),
            8 => Some(Cop0Reg::BadVAddr),
            9 => Some(Cop0Reg::Bdam),
            11 => Some(Cop0Reg::Bpcm),
            12 => Some(Cop0Reg::Sr),
            13 => Some(Cop0Reg::Cause),
            14 => Some(Cop0Reg::Epc),
            15 => Some(Cop0Reg::Prid),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_index_round_trips_encoding() {
        for i in 0..32u32 {
            assert_eq!(PsxReg::from_index(i) as u8, i as u8);
        }
    }

    #[test]
    fn state_offset_is_contiguous_and_skips_r0() {
        assert_eq!(PsxReg::At.state_offset(), 0);
        assert_eq!(PsxReg::V0.state_offset(), 4);
        assert_eq!(PsxReg::Ra.state_offset(), 30 * 4);
    }

    #[test]
    #[should_panic]
    fn r0_has_no_state_offset() {
        let _ = PsxReg::R0.state_offset();
    }
}
