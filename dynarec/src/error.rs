//! Error types for the dynarec core.
//!
//! `HostError` is the ordinary Rust error type, returned from fallible
//! host-side operations (arena management, block compilation setup).
//! `ExitReason` is not an error — it is the data a compiled block
//! returns to the host loop every time it stops executing, including
//! the guest CPU exceptions. Keeping the two separate means `?` only
//! ever propagates genuine host failures; guest exceptions are
//! ordinary control flow the host inspects and routes.

use thiserror::Error;

use crate::regs::PsxReg;

/// Host-side failures. Always fatal to the compilation attempt that
/// raised them; never silently recovered from inside the core.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// The code arena has no room left for another block.
    #[error("code arena exhausted: {requested} bytes requested, {available} available")]
    ArenaExhausted { requested: usize, available: usize },

    /// A block's emitted length overflowed `block_len_bytes`'s
    /// cache-line-aligned encoding, or exceeded `DYNAREC_INSTRUCTION_MAX_LEN`
    /// times the number of guest instructions in the block.
    #[error("block at {base_address:#010x} exceeded the maximum emitted length")]
    BlockTooLarge { base_address: u32 },

    /// A forward branch's placeholder displacement could not be patched
    /// because the final displacement didn't fit the reserved encoding
    /// width (see spec.md REDESIGN FLAGS: widen and re-emit rather than
    /// silently truncate).
    #[error("branch displacement at offset {patch_offset} overflowed its placeholder")]
    DisplacementOverflow { patch_offset: usize },

    /// `mmap` of the code arena failed.
    #[error("failed to map executable code arena: errno {0}")]
    MmapFailed(i32),
}

/// Why a previously-compiled, already-running block returned control
/// to the host. This is plain data, not a `Result::Err` — every block
/// always "succeeds" in the sense of running to completion; this is
/// simply what it found at its exit point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// SYSCALL executed. Payload is the 20-bit code embedded in the
    /// instruction (usually 0, games rarely encode anything here).
    Syscall(u32),
    /// BREAK executed. Payload is the 20-bit code embedded in the
    /// instruction.
    Break(u32),
    /// The compiler reached a translation it refuses to perform:
    /// nested delay slots, an unhandled opcode, or a scheduling hazard.
    /// Payload identifies the cause for diagnostics.
    Unimplemented(UnimplementedCause),
    /// The cycle counter went negative; the host should handle pending
    /// events and may re-enter.
    CounterExpired,
    /// A guest CPU exception was raised and routed to the guest's
    /// exception handling state (COP0 EPC/CAUSE/SR), control returns
    /// here so the host can continue running at the handler vector.
    Exception(VmException),
}

/// Identifies why the compiler produced an `Unimplemented` exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnimplementedCause {
    /// The instruction in a branch delay slot is itself a branch or
    /// an exception — a pathological case the original source also
    /// refuses to schedule.
    NestedDelaySlot { at: u32 },
    /// Decoder produced a `SIMPLE` op whose primary/function field the
    /// compiler has no emitter for.
    UnhandledOpcode { at: u32, instruction: u32 },
    /// The delay slot writes the same register a branch-and-link
    /// instruction needs as its link target.
    RegisterRaceOnBranchTarget { at: u32, register: PsxReg },
}

/// Guest CPU exceptions, mirroring `enum psx_cpu_exception` in the
/// original header. The numeric value is the MIPS CAUSE.ExcCode field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmException {
    Interrupt = 0x0,
    LoadAddressError = 0x4,
    StoreAddressError = 0x5,
    Syscall = 0x8,
    Breakpoint = 0x9,
    IllegalInstruction = 0xa,
    CoprocessorUnusable = 0xb,
    Overflow = 0xc,
}

impl VmException {
    /// The MIPS CAUSE register ExcCode value for this exception.
    pub fn cause_code(self) -> u8 {
        self as u8
    }
}

impl ExitReason {
    /// Pack into the entry ABI's return word: exit code in the high 4
    /// bits, a 28-bit payload (syscall/break code, or an exception's
    /// cause code) in the low bits. `Unimplemented` never crosses this
    /// boundary — the compiler detects it while scanning, before any
    /// machine code for the offending block is ever emitted, so it's
    /// reported straight from `compile_block`'s return value instead.
    pub fn pack(self) -> i64 {
        let (code, payload): (u32, u32) = match self {
            ExitReason::Syscall(c) => (0, c & 0x0FFF_FFFF),
            ExitReason::Break(c) => (1, c & 0x0FFF_FFFF),
            ExitReason::CounterExpired => (2, 0),
            ExitReason::Exception(exc) => (3, exc.cause_code() as u32),
            ExitReason::Unimplemented(_) => {
                panic!("Unimplemented exit reasons never cross the packed machine-code ABI")
            }
        };
        ((code << 28) | payload) as i64
    }

    /// Inverse of `pack`, used by the top-level `run` loop to turn a
    /// compiled block's raw return word back into an `ExitReason`.
    pub fn unpack(packed: i64) -> ExitReason {
        let raw = packed as u32;
        let payload = raw & 0x0FFF_FFFF;
        match raw >> 28 {
            0 => ExitReason::Syscall(payload),
            1 => ExitReason::Break(payload),
            2 => ExitReason::CounterExpired,
            _ => ExitReason::Exception(decode_cause_code(payload as u8)),
        }
    }
}

fn decode_cause_code(code: u8) -> VmException {
    match code {
        0x0 => VmException::Interrupt,
        0x4 => VmException::LoadAddressError,
        0x5 => VmException::StoreAddressError,
        0x8 => VmException::Syscall,
        0x9 => VmException::Breakpoint,
        0xb => VmException::CoprocessorUnusable,
        0xc => VmException::Overflow,
        _ => VmException::IllegalInstruction,
    }
}

pub type Result<T> = core::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips_syscall() {
        let exit = ExitReason::Syscall(0xAB);
        assert_eq!(ExitReason::unpack(exit.pack()), exit);
    }

    #[test]
    fn pack_unpack_round_trips_break_code() {
        let exit = ExitReason::Break(0xDEAD);
        assert_eq!(ExitReason::unpack(exit.pack()), exit);
    }

    #[test]
    fn pack_unpack_round_trips_exception() {
        let exit = ExitReason::Exception(VmException::Overflow);
        assert_eq!(ExitReason::unpack(exit.pack()), exit);
    }
}
