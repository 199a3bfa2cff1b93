//! Integration tests driving the translator through its public API:
//! seed guest RAM with real MIPS encodings, run compiled blocks, and
//! inspect the resulting guest-visible state and exit reasons. Unlike
//! the unit tests scattered through `src/`, these exercise the whole
//! pipeline — decode, compile, place in the arena, and actually jump
//! into the generated AMD64 machine code.

use dynarec::error::ExitReason;
use dynarec::mips_consts::*;
use dynarec::regs::PsxReg;
use dynarec::runtime::{Config, NullCallbacks};
use dynarec::{Dynarec, DynarecOptions};

fn enc_r(opcode: u32, rs: u32, rt: u32, rd: u32, shamt: u32, func: u32) -> u32 {
    (opcode << 26) | (rs << 21) | (rt << 16) | (rd << 11) | (shamt << 6) | func
}

fn enc_i(opcode: u32, rs: u32, rt: u32, imm: u16) -> u32 {
    (opcode << 26) | (rs << 21) | (rt << 16) | imm as u32
}

fn enc_j(opcode: u32, target: u32) -> u32 {
    (opcode << 26) | ((target >> 2) & 0x03FF_FFFF)
}

fn new_dynarec() -> Dynarec {
    Dynarec::new(
        Config { ram_size: 64 * 1024, scratchpad_size: 1024, bios_size: 4096 },
        Box::new(NullCallbacks),
        DynarecOptions::empty(),
    )
    .unwrap()
}

fn seed(dynarec: &mut Dynarec, addr: u32, words: &[u32]) {
    let ram = &mut dynarec.state_mut().ram;
    for (i, w) in words.iter().enumerate() {
        let o = (addr as usize) + i * 4;
        ram[o..o + 4].copy_from_slice(&w.to_le_bytes());
    }
}

#[test]
fn break_exits_with_its_embedded_code() {
    let mut dynarec = new_dynarec();
    let word = (0u32 << 26) | (0x3FF << 6) | FN_BREAK;
    seed(&mut dynarec, 0, &[word]);
    dynarec.set_pc(0);

    match dynarec.run(1_000_000) {
        ExitReason::Break(code) => assert_eq!(code, 0x3FF),
        other => panic!("expected Break, got {other:?}"),
    }
}

#[test]
fn li_macro_loads_a_full_32_bit_immediate() {
    let mut dynarec = new_dynarec();
    let lui = enc_i(OP_LUI, 0, 8, 0x1234); // LUI $t0, 0x1234
    let ori = enc_i(OP_ORI, 8, 8, 0x5678); // ORI $t0, $t0, 0x5678
    let syscall = (0u32 << 26) | FN_SYSCALL;
    seed(&mut dynarec, 0, &[lui, ori, syscall]);
    dynarec.set_pc(0);

    dynarec.run(1_000_000);
    assert_eq!(dynarec.state().read_reg(PsxReg::T0), 0x1234_5678);
}

#[test]
fn writes_to_r0_are_unobservable() {
    let mut dynarec = new_dynarec();
    // ADDIU $zero, $t0, 5 -- collapses to a Nop at decode time, but even
    // if it didn't, R0 storage is never addressable.
    let addiu = enc_i(OP_ADDIU, 8, 0, 5);
    let syscall = (0u32 << 26) | (1 << 6) | FN_SYSCALL;
    seed(&mut dynarec, 0, &[addiu, syscall]);
    dynarec.set_pc(0);

    match dynarec.run(1_000_000) {
        ExitReason::Syscall(code) => assert_eq!(code, 1),
        other => panic!("expected Syscall, got {other:?}"),
    }
    assert_eq!(dynarec.state().read_reg(PsxReg::R0), 0);
}

#[test]
fn arithmetic_shift_right_sign_extends() {
    let mut dynarec = new_dynarec();
    let lui = enc_i(OP_LUI, 0, 8, 0x8000); // LUI $t0, 0x8000 -> 0x8000_0000
    let sra = enc_r(OP_SPECIAL, 0, 8, 8, 4, FN_SRA); // SRA $t0, $t0, 4
    let syscall = 0u32 << 26 | FN_SYSCALL;
    seed(&mut dynarec, 0, &[lui, sra, syscall]);
    dynarec.set_pc(0);

    dynarec.run(1_000_000);
    assert_eq!(dynarec.state().read_reg(PsxReg::T0), 0xF800_0000);
}

#[test]
fn branch_comparison_uses_the_pre_delay_slot_operand_value() {
    // $t0 = 5, $t1 = 3. BEQ $t0, $t1 is not taken using the
    // architectural (pre-delay-slot) operand, even though the delay
    // slot instruction rewrites $t0 to 3 before the branch resolves.
    let li_t0 = enc_i(OP_ADDIU, 0, 8, 5);
    let li_t1 = enc_i(OP_ADDIU, 0, 9, 3);
    let beq = enc_i(OP_BEQ, 8, 9, 2); // branch to pc+8+2*4 = pc+16 if taken
    let delay = enc_i(OP_ADDIU, 8, 8, u16::MAX - 1); // $t0 += -2 -> 3
    let fallthrough_syscall = (0u32 << 26) | (99 << 6) | FN_SYSCALL;
    let taken_syscall = (0u32 << 26) | (111 << 6) | FN_SYSCALL;

    let mut dynarec = new_dynarec();
    seed(&mut dynarec, 0, &[li_t0, li_t1]);
    seed(&mut dynarec, 8, &[beq, delay]);
    seed(&mut dynarec, 16, &[fallthrough_syscall]);
    seed(&mut dynarec, 24, &[taken_syscall]);
    dynarec.set_pc(0);

    match dynarec.run(1_000_000) {
        ExitReason::Syscall(code) => assert_eq!(code, 99),
        other => panic!("expected the not-taken path, got {other:?}"),
    }
    assert_eq!(dynarec.state().read_reg(PsxReg::T0), 3);
}

#[test]
fn lwl_lwr_pair_folds_into_a_single_aligned_load() {
    let mut dynarec = new_dynarec();
    dynarec.state_mut().write_ram_word(0, 0xCAFE_BABE);
    // LWR $t0, 0($zero) ; LWL $t0, 3($zero) -- offsets differ by 3,
    // same base and target: the peephole fold should replace both with
    // one full-word load at the LWR's own offset.
    let lwr = enc_i(OP_LWR, 0, 8, 0);
    let lwl = enc_i(OP_LWL, 0, 8, 3);
    let syscall = 0u32 << 26 | FN_SYSCALL;
    seed(&mut dynarec, 4, &[lwr, lwl, syscall]);
    dynarec.set_pc(4);

    dynarec.run(1_000_000);
    assert_eq!(dynarec.state().read_reg(PsxReg::T0), 0xCAFE_BABE);
}

#[test]
fn unconditional_jump_links_across_blocks_through_the_resolver() {
    let mut dynarec = new_dynarec();
    let j = enc_j(OP_J, 16);
    seed(&mut dynarec, 0, &[j, 0 /* delay slot: NOP */]);
    let syscall = (0u32 << 26) | (42 << 6) | FN_SYSCALL;
    seed(&mut dynarec, 16, &[syscall]);
    dynarec.set_pc(0);

    match dynarec.run(1_000_000) {
        ExitReason::Syscall(code) => assert_eq!(code, 42),
        other => panic!("expected Syscall, got {other:?}"),
    }
    // Both the source block (pc 0) and the target it linked to (pc 16)
    // are now cached.
    assert_eq!(dynarec.cached_block_count(), 2);
}

#[test]
fn recompiling_the_same_entry_point_is_idempotent() {
    let mut dynarec = new_dynarec();
    let j = enc_j(OP_J, 16);
    seed(&mut dynarec, 0, &[j, 0]);
    let syscall = (0u32 << 26) | (7 << 6) | FN_SYSCALL;
    seed(&mut dynarec, 16, &[syscall]);

    dynarec.set_pc(0);
    dynarec.run(1_000_000);
    let count_after_first = dynarec.cached_block_count();

    dynarec.set_pc(0);
    let exit = dynarec.run(1_000_000);
    assert!(matches!(exit, ExitReason::Syscall(7)));
    assert_eq!(dynarec.cached_block_count(), count_after_first);
}

#[test]
fn counter_expiry_reports_the_pc_at_the_block_entry() {
    let mut dynarec = new_dynarec();
    // J 0 ; NOP -- an infinite self-loop, budget too small to retire
    // even one lap.
    let j_self = enc_j(OP_J, 0);
    seed(&mut dynarec, 0, &[j_self, 0]);
    dynarec.set_pc(0);

    match dynarec.run(1) {
        ExitReason::CounterExpired => {}
        other => panic!("expected CounterExpired, got {other:?}"),
    }
    assert_eq!(dynarec.state().pc, 0);
}

#[test]
fn no_patch_option_still_resolves_every_traversal() {
    let mut dynarec = Dynarec::new(
        Config { ram_size: 64 * 1024, scratchpad_size: 1024, bios_size: 4096 },
        Box::new(NullCallbacks),
        DynarecOptions::NO_PATCH,
    )
    .unwrap();
    let j = enc_j(OP_J, 16);
    seed(&mut dynarec, 0, &[j, 0]);
    let syscall = (0u32 << 26) | (5 << 6) | FN_SYSCALL;
    seed(&mut dynarec, 16, &[syscall]);
    dynarec.set_pc(0);

    match dynarec.run(1_000_000) {
        ExitReason::Syscall(code) => assert_eq!(code, 5),
        other => panic!("expected Syscall, got {other:?}"),
    }

    // With patching disabled, the second traversal goes through the
    // resolver again instead of a direct jump -- still correct, just
    // not self-optimizing.
    dynarec.set_pc(0);
    match dynarec.run(1_000_000) {
        ExitReason::Syscall(code) => assert_eq!(code, 5),
        other => panic!("expected Syscall on the second traversal, got {other:?}"),
    }
}
