//! Guest-register-to-host-register assignment.
//!
//! A fixed subset of the 32 guest GPRs are pinned to host general
//! purpose registers for the lifetime of every compiled block; the
//! rest live in `DynarecState::regs[]` and are loaded/stored around
//! each use. Pinning is static rather than computed per-block: the
//! original dynarec does the same, trading some missed optimization
//! opportunity for a compiler with no liveness analysis pass at all.

use crate::backend::HostReg;
use crate::regs::PsxReg;

/// Guest registers pinned to a host register for the whole block.
/// Chosen to cover the registers MIPS calling convention and PSX
/// game code lean on hardest: the assembler temporary, the two
/// return-value/argument registers, the stack and link pointers.
pub const PINNED_GUEST_REGS: [PsxReg; 8] = [
    PsxReg::At,
    PsxReg::V0,
    PsxReg::V1,
    PsxReg::A0,
    PsxReg::A1,
    PsxReg::T0,
    PsxReg::Sp,
    PsxReg::Ra,
];

/// Where a guest register lives while a block is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegLocation {
    /// Permanently resident in this host register for the block.
    Pinned(HostReg),
    /// Lives in `DynarecState::regs[]` at this byte offset; every read
    /// and write round-trips through memory.
    Memory(usize),
}

/// Maps every `PsxReg` to its `RegLocation`. Immutable and stateless:
/// the same register always maps to the same location, in every block,
/// for the lifetime of the process.
pub struct RegisterMap;

impl RegisterMap {
    /// Host registers reserved for the pinned guest GPRs, in the same
    /// order as `PINNED_GUEST_REGS`. `R8`-`R11` are chosen so the state
    /// pointer (`RBX`) and the emulator-call convention's scratch
    /// registers (`RAX`, `RCX`, `RDX`) stay free for addressing and
    /// calls.
    const PINNED_HOST_REGS: [HostReg; 8] = [
        HostReg::R8,
        HostReg::R9,
        HostReg::R10,
        HostReg::R11,
        HostReg::R12,
        HostReg::R13,
        HostReg::R14,
        HostReg::R15,
    ];

    /// Resolve where `reg` lives. `R0` is not a valid argument: callers
    /// must special-case the hardwired-zero register before consulting
    /// the map, since it has no storage of any kind.
    pub fn locate(reg: PsxReg) -> RegLocation {
        assert!(!reg.is_zero(), "R0 has no register-map location");
        if let Some(slot) = PINNED_GUEST_REGS.iter().position(|&r| r == reg) {
            RegLocation::Pinned(Self::PINNED_HOST_REGS[slot])
        } else {
            RegLocation::Memory(reg.state_offset())
        }
    }

    /// Whether `reg` is one of the statically pinned registers.
    pub fn is_pinned(reg: PsxReg) -> bool {
        !reg.is_zero() && PINNED_GUEST_REGS.contains(&reg)
    }

    /// The host register holding `reg`, or `None` if it's memory-resident
    /// (or `R0`, which holds neither).
    pub fn pinned_host_reg(reg: PsxReg) -> Option<HostReg> {
        if reg.is_zero() {
            return None;
        }
        match Self::locate(reg) {
            RegLocation::Pinned(host) => Some(host),
            RegLocation::Memory(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_regs_get_distinct_host_registers() {
        let mut seen = Vec::new();
        for &reg in PINNED_GUEST_REGS.iter() {
            let host = RegisterMap::pinned_host_reg(reg).expect("pinned reg must resolve");
            assert!(!seen.contains(&host), "host register reused for {reg:?}");
            seen.push(host);
        }
    }

    #[test]
    fn non_pinned_reg_is_memory_resident() {
        assert!(!RegisterMap::is_pinned(PsxReg::S0));
        match RegisterMap::locate(PsxReg::S0) {
            RegLocation::Memory(offset) => assert_eq!(offset, PsxReg::S0.state_offset()),
            RegLocation::Pinned(_) => panic!("S0 should not be pinned"),
        }
    }

    #[test]
    #[should_panic]
    fn r0_has_no_location() {
        let _ = RegisterMap::locate(PsxReg::R0);
    }
}
