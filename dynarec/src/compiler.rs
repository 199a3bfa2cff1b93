//! Block compiler: drives the decoder and the host assembler, schedules
//! branch and load delay slots, folds unaligned load/store pairs, and
//! wires up inter-block links.
//!
//! `compile_block` is a pure function of guest memory and the current
//! block cache snapshot: it never mutates `DynarecState` or
//! `BlockCache` itself. The caller (`Dynarec::run`, in `lib.rs`) is
//! responsible for placing the returned bytes into the code arena and
//! inserting the resulting `BlockHandle`.

use crate::backend::{AluOp, Backend, Cond, HostReg, Mem, ShiftOp};
use crate::cache::BlockCache;
use crate::decoder::decode;
use crate::error::{ExitReason, HostError, Result as HResult, UnimplementedCause, VmException};
use crate::instruction::{OpDesc, OpType};
use crate::mips_consts::*;
use crate::regmap::RegisterMap;
use crate::regs::PsxReg;
use crate::runtime::{self, DynarecState, PageTable, PAGE_INSTRUCTIONS, PAGE_SIZE_SHIFT, SCRATCHPAD_BASE};

/// Cycles charged per emitted guest instruction. The original source's
/// `PSX_CYCLES_PER_INSTRUCTION` define wasn't present in the filtered
/// headers this crate was built against; 2 is chosen as a plausible
/// placeholder (see DESIGN.md) and is not load-bearing for correctness,
/// only for how quickly the counter-expired exit fires.
pub const PSX_CYCLES_PER_INSTRUCTION: i64 = 2;

/// Width, in bytes, of a self-patching inline-cache slot: a
/// `mov_imm64_fixed` into `RAX` followed by `jmp_indirect(RAX)`. Every
/// write to a patch site emits exactly this many bytes.
pub const PATCH_REGION_LEN: usize = 12;

/// Absolute addresses and byte offsets the compiler needs to bake into
/// emitted code: the addresses don't exist until `Dynarec::new` has set
/// up the arena and its shared stubs, so they're threaded through
/// rather than hardcoded.
#[derive(Debug, Clone, Copy)]
pub struct CompileEnv {
    pub arena_base: usize,
    /// `extern "C" fn(ctx: *mut DispatchContext, target_pc: u32, patch_site: usize) -> usize`
    pub resolver_addr: usize,
    /// `extern "C" fn() -> !` tail: writes pinned regs back to state
    /// and returns `(counter, packed_exit)` to the Rust caller.
    pub exit_trampoline_addr: usize,
    /// Byte offset of `DynarecState::dispatch_ctx` (opaque pointer back
    /// to the `Dynarec`-owned cache/arena, needed only for link
    /// resolution).
    pub dispatch_ctx_offset: usize,
    pub pc_field_offset: usize,
    /// `extern "C" fn(*mut DynarecState, u32) -> u32`, one per
    /// load width/signedness.
    pub load_b: usize,
    pub load_bu: usize,
    pub load_h: usize,
    pub load_hu: usize,
    pub load_w: usize,
    /// `extern "C" fn(*mut DynarecState, u32, u32)`, one per store width.
    pub store_b: usize,
    pub store_h: usize,
    pub store_w: usize,
}

pub struct PendingEdge {
    pub target_pc: u32,
    /// Offset, within the returned block's code, of the
    /// `PATCH_REGION_LEN`-byte inline-cache slot the resolver overwrites
    /// on first resolution.
    pub patch_region_offset: usize,
    /// Offset of the `mov_imm64_fixed(RDX, 0)` immediate field that
    /// must be rewritten to this block's own absolute patch-region
    /// address once the block is placed in the arena.
    pub patch_site_operand_offset: usize,
}

pub struct CompiledBlock {
    pub code: Vec<u8>,
    pub psx_instructions: u32,
    pub pending_edges: Vec<PendingEdge>,
}

pub enum CompileOutcome {
    Compiled(CompiledBlock),
    /// The scanner hit a translation it refuses to perform. No code was
    /// emitted for this block at all.
    Unimplemented(UnimplementedCause),
}

/// Registers free for the compiler's own scratch use: never a pinned
/// guest register, never the state pointer (`RBX`) or the counter
/// (`RBP`).
const SCRATCH_A: HostReg = HostReg::Rax;
const SCRATCH_B: HostReg = HostReg::Rcx;
const SCRATCH_C: HostReg = HostReg::Rdx;
const STATE_REG: HostReg = HostReg::Rbx;
const COUNTER_REG: HostReg = HostReg::Rbp;

/// Holds the guest effective address across the alignment check and
/// region routing; must survive unclobbered into the MMIO fallback call,
/// where it's already sitting in the second SysV argument register.
const ADDR_REG: HostReg = HostReg::Rsi;
/// Holds the canonicalized address used for region routing; reused by
/// the RAM arm as the final masked buffer offset.
const CANON_REG: HostReg = HostReg::Rdi;

struct Ctx<'a> {
    env: &'a CompileEnv,
    cache: &'a BlockCache,
    state: &'a DynarecState,
    pending_edges: Vec<PendingEdge>,
}

pub fn compile_block<B: Backend + Default>(
    state: &DynarecState,
    cache: &BlockCache,
    start_pc: u32,
    env: &CompileEnv,
) -> HResult<CompileOutcome> {
    let mut body = B::default();
    let mut ctx = Ctx { env, cache, state, pending_edges: Vec::new() };
    let mut pc = start_pc;
    let mut instr_count: u32 = 0;

    loop {
        if instr_count as usize >= PAGE_INSTRUCTIONS {
            emit_link_to(&mut body, &mut ctx, pc);
            break;
        }

        let op = decode(state.fetch_instruction(pc));

        match op.op_type {
            OpType::BranchAlways | OpType::BranchCond => {
                let delay = decode(state.fetch_instruction(pc.wrapping_add(4)));
                match compile_branch(&mut body, &mut ctx, pc, &op, &delay)? {
                    Some(cause) => return Ok(CompileOutcome::Unimplemented(cause)),
                    None => {}
                }
                instr_count += 2;
                break;
            }
            OpType::Exception => {
                compile_exception(&mut body, env, pc, &op);
                instr_count += 1;
                break;
            }
            OpType::Load | OpType::LoadCombine => {
                let next = decode(state.fetch_instruction(pc.wrapping_add(4)));
                let (consumed, cause) = compile_load_with_delay(&mut body, env, pc, &op, &next)?;
                if let Some(cause) = cause {
                    return Ok(CompileOutcome::Unimplemented(cause));
                }
                instr_count += consumed;
                pc = pc.wrapping_add(4 * consumed);
                continue;
            }
            OpType::Nop => {
                instr_count += 1;
            }
            OpType::StoreNoAlign => {
                let next = decode(state.fetch_instruction(pc.wrapping_add(4)));
                let (folded, consumed) = match try_fold_pair(&op, &next) {
                    Some((folded, _offset)) => (folded, 2),
                    None => (op, 1),
                };
                if let Some(cause) = compile_simple(&mut body, env, pc, &folded)? {
                    return Ok(CompileOutcome::Unimplemented(cause));
                }
                instr_count += consumed;
                pc = pc.wrapping_add(4 * consumed);
                continue;
            }
            OpType::Simple => {
                match compile_simple(&mut body, env, pc, &op)? {
                    Some(cause) => return Ok(CompileOutcome::Unimplemented(cause)),
                    None => {}
                }
                instr_count += 1;
            }
        }
        pc = pc.wrapping_add(4);
    }

    let total_cycles = instr_count as i64 * PSX_CYCLES_PER_INSTRUCTION;
    let mut prologue = B::default();
    emit_counter_check(&mut prologue, env, start_pc, total_cycles);
    let mut code = prologue.finish().map_err(|o| HostError::DisplacementOverflow { patch_offset: o })?;
    let prologue_len = code.len();
    let body_bytes = body.finish().map_err(|o| HostError::DisplacementOverflow { patch_offset: o })?;
    code.extend(body_bytes);

    for edge in ctx.pending_edges.iter_mut() {
        edge.patch_region_offset += prologue_len;
        edge.patch_site_operand_offset += prologue_len;
    }

    Ok(CompileOutcome::Compiled(CompiledBlock {
        code,
        psx_instructions: instr_count,
        pending_edges: ctx.pending_edges,
    }))
}

fn emit_counter_check<B: Backend>(asm: &mut B, env: &CompileEnv, start_pc: u32, total_cycles: i64) {
    asm.alu_imm(AluOp::Sub, COUNTER_REG, total_cycles as i32);
    asm.cmp_imm(COUNTER_REG, 0);
    let ok = asm.new_label();
    asm.jcc(Cond::GreaterEqual, ok);
    write_pc(asm, env, start_pc);
    emit_exit(asm, env, ExitReason::CounterExpired.pack());
    asm.bind(ok);
}

fn write_pc<B: Backend>(asm: &mut B, env: &CompileEnv, pc: u32) {
    asm.mov_imm(SCRATCH_A, pc as i64);
    asm.store(Mem::BaseDisp { base: STATE_REG, disp: env.pc_field_offset as i32 }, SCRATCH_A, 4);
}

fn emit_exit<B: Backend>(asm: &mut B, env: &CompileEnv, packed: i64) {
    asm.mov_imm(HostReg::Rax, packed);
    asm.mov_imm(SCRATCH_C, env.exit_trampoline_addr as i64);
    asm.jmp_indirect(SCRATCH_C);
}

/// Emit the link to a statically-known `target_pc`: a direct absolute
/// jump if the target is already compiled, otherwise a self-patching
/// inline cache that calls the resolver once and never again.
fn emit_link_to<B: Backend>(asm: &mut B, ctx: &mut Ctx, target_pc: u32) {
    if let Some(handle) = ctx.cache.find(target_pc) {
        // `None` means target_pc isn't RAM-backed (e.g. BIOS), which is
        // never invalidated, so an untracked target always trusts the cache.
        let page = PageTable::tracked_page(target_pc, ctx.state.ram.len());
        if page.map_or(true, |p| ctx.state.pages.is_valid(p)) {
            let dest = ctx.env.arena_base + handle.body_offset;
            asm.mov_imm(SCRATCH_A, dest as i64);
            asm.jmp_indirect(SCRATCH_A);
            return;
        }
        // The cached block's page was invalidated by a store since this
        // entry was compiled; fall through to the resolver, which will
        // re-check and recompile rather than jump into stale code.
    }

    let patch_region_offset = asm.offset();
    for _ in 0..PATCH_REGION_LEN {
        asm.nop();
    }

    for r in [HostReg::R8, HostReg::R9, HostReg::R10, HostReg::R11] {
        asm.push(r);
    }
    asm.mov_reg(HostReg::Rdi, STATE_REG);
    asm.load(
        HostReg::Rdi,
        Mem::BaseDisp { base: STATE_REG, disp: ctx.env.dispatch_ctx_offset as i32 },
        8,
        false,
    );
    asm.mov_imm(HostReg::Rsi, target_pc as i64);
    asm.mov_imm64_fixed(HostReg::Rdx, 0);
    let patch_site_operand_offset = asm.offset() - 8;
    asm.mov_imm(SCRATCH_B, ctx.env.resolver_addr as i64);
    asm.call_indirect(SCRATCH_B);
    for r in [HostReg::R11, HostReg::R10, HostReg::R9, HostReg::R8] {
        asm.pop(r);
    }
    asm.jmp_indirect(HostReg::Rax);

    ctx.pending_edges.push(PendingEdge { target_pc, patch_region_offset, patch_site_operand_offset });
}

/// Emit a dynamic dispatch for a target only known at runtime (JR,
/// JALR): the target address is already sitting in `target_reg`. No
/// patch site is reserved — a register-indirect jump has no single
/// resolved destination to cache.
fn emit_dynamic_dispatch<B: Backend>(asm: &mut B, env: &CompileEnv, target_reg: HostReg) {
    for r in [HostReg::R8, HostReg::R9, HostReg::R10, HostReg::R11] {
        asm.push(r);
    }
    asm.mov_reg(HostReg::Rsi, target_reg);
    asm.load(HostReg::Rdi, Mem::BaseDisp { base: STATE_REG, disp: env.dispatch_ctx_offset as i32 }, 8, false);
    asm.mov_imm64_fixed(HostReg::Rdx, 0);
    asm.mov_imm(SCRATCH_B, env.resolver_addr as i64);
    asm.call_indirect(SCRATCH_B);
    for r in [HostReg::R11, HostReg::R10, HostReg::R9, HostReg::R8] {
        asm.pop(r);
    }
    asm.jmp_indirect(HostReg::Rax);
}

fn load_operand<B: Backend>(asm: &mut B, reg: PsxReg, scratch: HostReg) -> HostReg {
    if reg.is_zero() {
        asm.mov_imm(scratch, 0);
        return scratch;
    }
    match RegisterMap::locate(reg) {
        crate::regmap::RegLocation::Pinned(host) => host,
        crate::regmap::RegLocation::Memory(offset) => {
            let disp = (DynarecState::REGS_OFFSET + offset) as i32;
            asm.load(scratch, Mem::BaseDisp { base: STATE_REG, disp }, 4, false);
            scratch
        }
    }
}

fn store_result<B: Backend>(asm: &mut B, reg: PsxReg, value: HostReg) {
    if reg.is_zero() {
        return;
    }
    match RegisterMap::locate(reg) {
        crate::regmap::RegLocation::Pinned(host) => {
            if host != value {
                asm.mov_reg(host, value);
            }
        }
        crate::regmap::RegLocation::Memory(offset) => {
            let disp = (DynarecState::REGS_OFFSET + offset) as i32;
            asm.store(Mem::BaseDisp { base: STATE_REG, disp }, value, 4);
        }
    }
}

/// Branch target PC for a known-immediate branch: `pc_after_delay_slot
/// + sign_extend(imm) * 4`.
fn branch_target(pc: u32, op: &OpDesc) -> u32 {
    (pc.wrapping_add(8)).wrapping_add((op.imm.signed() as i64 * 4) as u32)
}

fn jump_target(pc: u32, op: &OpDesc) -> u32 {
    (pc.wrapping_add(4) & 0xF000_0000) | (op.imm.unsigned() << 2)
}

fn compile_branch<B: Backend>(
    asm: &mut B,
    ctx: &mut Ctx,
    pc: u32,
    op: &OpDesc,
    delay: &OpDesc,
) -> HResult<Option<UnimplementedCause>> {
    if matches!(delay.op_type, OpType::BranchAlways | OpType::BranchCond | OpType::Exception) {
        return Ok(Some(UnimplementedCause::NestedDelaySlot { at: pc }));
    }

    let link_reg = op.target;
    if !link_reg.is_zero() && delay.writes(link_reg) {
        return Ok(Some(UnimplementedCause::RegisterRaceOnBranchTarget { at: pc, register: link_reg }));
    }

    // Snapshot any branch operand the delay slot is about to clobber
    // into the synthetic DT register, then rewrite the branch to read
    // DT instead.
    let mut op0 = op.op0;
    let mut op1 = op.op1;
    if !op.op0.is_zero() && delay.writes(op.op0) {
        let v = load_operand(asm, op.op0, SCRATCH_A);
        store_result(asm, PsxReg::Dt, v);
        op0 = PsxReg::Dt;
    } else if !op.op1.is_zero() && delay.writes(op.op1) {
        let v = load_operand(asm, op.op1, SCRATCH_A);
        store_result(asm, PsxReg::Dt, v);
        op1 = PsxReg::Dt;
    }

    if delay.op_type != OpType::Nop {
        compile_simple(asm, ctx.env, pc.wrapping_add(4), delay)?;
    }

    let opcode = op.instruction >> 26;
    let func = op.instruction & 0x3F;

    // For JR/JALR the jump target is read out of a register before the
    // link register (if any) is written, so `jalr $ra, $ra` reads the
    // pre-link value rather than the return address that's about to
    // overwrite it.
    let jr_target = if opcode == OP_SPECIAL && (func == FN_JR || func == FN_JALR) {
        Some(load_operand(asm, op0, SCRATCH_C))
    } else {
        None
    };

    if !link_reg.is_zero() {
        let ret_addr = load_operand(asm, PsxReg::R0, SCRATCH_A);
        asm.mov_imm(ret_addr, pc.wrapping_add(8) as i64);
        store_result(asm, link_reg, ret_addr);
    }

    match (opcode, func) {
        (OP_SPECIAL, FN_JR) | (OP_SPECIAL, FN_JALR) => {
            emit_dynamic_dispatch(asm, ctx.env, jr_target.expect("set above"));
        }
        (OP_J, _) | (OP_JAL, _) => {
            emit_link_to(asm, ctx, jump_target(pc, op));
        }
        _ if op.op_type == OpType::BranchAlways => {
            // Covers BEQ rs,rs (always-taken, folded by the decoder).
            emit_link_to(asm, ctx, branch_target(pc, op));
        }
        _ => {
            let taken = branch_target(pc, op);
            let not_taken = pc.wrapping_add(8);
            let a = load_operand(asm, op0, SCRATCH_A);
            let cond = match (opcode, func) {
                (OP_BEQ, _) => {
                    let b = load_operand(asm, op1, SCRATCH_B);
                    asm.cmp_reg(a, b);
                    Cond::Equal
                }
                (OP_BNE, _) => {
                    let b = load_operand(asm, op1, SCRATCH_B);
                    asm.cmp_reg(a, b);
                    Cond::NotEqual
                }
                (OP_BLEZ, _) => {
                    asm.cmp_imm(a, 0);
                    Cond::LessEqual
                }
                (OP_BGTZ, _) => {
                    asm.cmp_imm(a, 0);
                    Cond::Greater
                }
                (OP_BCOND, _) => {
                    asm.cmp_imm(a, 0);
                    if (op.instruction >> 16) & 1 == 1 { Cond::GreaterEqual } else { Cond::Less }
                }
                _ => Cond::Equal,
            };
            let else_label = asm.new_label();
            asm.jcc(invert(cond), else_label);
            emit_link_to(asm, ctx, taken);
            asm.bind(else_label);
            emit_link_to(asm, ctx, not_taken);
        }
    }

    Ok(None)
}

fn invert(cond: Cond) -> Cond {
    match cond {
        Cond::Equal => Cond::NotEqual,
        Cond::NotEqual => Cond::Equal,
        Cond::Less => Cond::GreaterEqual,
        Cond::LessEqual => Cond::Greater,
        Cond::Greater => Cond::LessEqual,
        Cond::GreaterEqual => Cond::Less,
        Cond::Below => Cond::GreaterEqual,
        Cond::BelowEqual => Cond::Greater,
        Cond::Overflow => Cond::Overflow,
    }
}

fn compile_exception<B: Backend>(asm: &mut B, env: &CompileEnv, pc: u32, op: &OpDesc) {
    write_pc(asm, env, pc);
    let func = op.instruction & 0x3F;
    let exit = if func == FN_SYSCALL {
        ExitReason::Syscall(op.imm.unsigned())
    } else if func == FN_BREAK {
        ExitReason::Break(op.imm.unsigned())
    } else {
        ExitReason::Exception(crate::error::VmException::IllegalInstruction)
    };
    emit_exit(asm, env, exit.pack());
}

/// Peephole-fold LWL/LWR (or SWL/SWR) into one unaligned access when
/// the pair shares a target/base register and the offsets differ by
/// exactly 3 — the combination a compiler-generated unaligned 32-bit
/// access always produces.
fn try_fold_pair(op: &OpDesc, next: &OpDesc) -> Option<(OpDesc, u32)> {
    let is_lw_pair = op.op_type == OpType::LoadCombine && next.op_type == OpType::LoadCombine;
    let is_sw_pair = op.op_type == OpType::StoreNoAlign && next.op_type == OpType::StoreNoAlign;
    if !is_lw_pair && !is_sw_pair {
        return None;
    }
    let (lwl, lwr) = if (op.instruction >> 26) == OP_LWL || (op.instruction >> 26) == OP_SWL {
        (op, next)
    } else {
        (next, op)
    };
    let same_base = if is_lw_pair { lwl.op0 == lwr.op0 } else { lwl.op0 == lwr.op0 && lwl.op1 == lwr.op1 };
    if !same_base {
        return None;
    }
    if is_lw_pair && lwl.target != lwr.target {
        return None;
    }
    let diff = lwl.imm.signed() - lwr.imm.signed();
    if diff != 3 {
        return None;
    }
    Some((*lwr, lwr.imm.unsigned()))
}

/// Emit a load (or LOAD_COMBINE) with its architectural one-slot load
/// delay handled per spec.md §4.4. Returns the number of guest
/// instructions consumed (1, or 2 when the next instruction was folded
/// into this load or reordered around its delay).
fn compile_load_with_delay<B: Backend>(
    asm: &mut B,
    env: &CompileEnv,
    pc: u32,
    op: &OpDesc,
    next: &OpDesc,
) -> HResult<(u32, Option<UnimplementedCause>)> {
    if let Some((folded, _offset)) = try_fold_pair(op, next) {
        emit_load(asm, env, pc, &folded);
        return Ok((2, None));
    }

    if next.op_type == OpType::Nop {
        emit_load(asm, env, pc, op);
        return Ok((1, None));
    }

    if !op.target.is_zero() && next.writes(op.target) {
        // The delay-slot instruction clobbers the load's own target
        // before anything can observe it; the load becomes effect-only.
        let dead = OpDesc { target: PsxReg::R0, ..*op };
        emit_load(asm, env, pc, &dead);
        let cause = compile_simple(asm, env, pc.wrapping_add(4), next)?;
        return Ok((2, cause));
    }

    if !op.target.is_zero() && next.reads(op.target) {
        // Snapshot the pre-load value into DT, since `next` is only
        // entitled to see the value the register held *before* this
        // load retires.
        let pre = load_operand(asm, op.target, SCRATCH_A);
        store_result(asm, PsxReg::Dt, pre);
        let rewritten_op0 = if next.op0 == op.target { PsxReg::Dt } else { next.op0 };
        let rewritten_op1 = if next.op1 == op.target { PsxReg::Dt } else { next.op1 };
        let rewritten_next = OpDesc { op0: rewritten_op0, op1: rewritten_op1, ..*next };
        let cause = compile_simple(asm, env, pc.wrapping_add(4), &rewritten_next)?;
        emit_load(asm, env, pc, op);
        return Ok((2, cause));
    }

    emit_load(asm, env, pc, op);
    Ok((1, None))
}

/// Zero the upper 32 bits of `reg`. Guest address arithmetic wraps at 32
/// bits, but every ALU op on this backend forces a 64-bit operand size.
fn truncate_to_u32<B: Backend>(asm: &mut B, reg: HostReg) {
    asm.shift_imm(ShiftOp::Shl, reg, 32);
    asm.shift_imm(ShiftOp::Shr, reg, 32);
}

/// Raise a load/store address error if `addr`'s low bits (width - 1)
/// are set. `tmp` must not be live across the call.
fn emit_alignment_check<B: Backend>(
    asm: &mut B,
    env: &CompileEnv,
    pc: u32,
    addr: HostReg,
    tmp: HostReg,
    width: u8,
    exception: VmException,
) {
    if width == 1 {
        return;
    }
    asm.mov_reg(tmp, addr);
    asm.alu_imm(AluOp::And, tmp, (width - 1) as i32);
    asm.cmp_imm(tmp, 0);
    let aligned = asm.new_label();
    asm.jcc(Cond::Equal, aligned);
    write_pc(asm, env, pc);
    emit_exit(asm, env, ExitReason::Exception(exception).pack());
    asm.bind(aligned);
}

/// Canonicalize `addr` (collapse the KUSEG/KSEG0/KSEG1 mirrors) into
/// `canonical`, using `SCRATCH_A`/`SCRATCH_B` as temporaries. `addr`
/// itself is left untouched.
fn emit_canonicalize<B: Backend>(asm: &mut B, addr: HostReg, canonical: HostReg) {
    asm.mov_reg(canonical, addr);
    asm.mov_reg(SCRATCH_A, addr);
    asm.shift_imm(ShiftOp::Shr, SCRATCH_A, 29);
    asm.mov_imm(SCRATCH_B, runtime::REGION_MASK.as_ptr() as i64);
    asm.load(SCRATCH_B, Mem::BaseIndexDisp { base: SCRATCH_B, index: SCRATCH_A, scale: 4, disp: 0 }, 4, false);
    asm.alu_reg(AluOp::And, canonical, SCRATCH_B);
}

/// Emit a guest load. Per the three-step memory sequence: check
/// alignment, route the canonicalized address to RAM, scratchpad, or
/// the MMIO callback, and converge the result into `RAX`.
fn emit_load<B: Backend>(asm: &mut B, env: &CompileEnv, pc: u32, op: &OpDesc) {
    let opcode = op.instruction >> 26;

    if opcode == OP_COP0 {
        // MFC0: the decoder stashed the COP0 register index in `imm`.
        match cop0_field_offset(op.imm.unsigned()) {
            Some(disp) => {
                asm.load(SCRATCH_A, Mem::BaseDisp { base: STATE_REG, disp }, 4, false);
                store_result(asm, op.target, SCRATCH_A);
            }
            None => {
                let zero = load_operand(asm, PsxReg::R0, SCRATCH_A);
                store_result(asm, op.target, zero);
            }
        }
        return;
    }

    if opcode == OP_LWC2 || opcode == OP_COP2 {
        // GTE data/control register load: decoded correctly but the
        // arithmetic pipeline behind it is an external collaborator.
        // MFC2/CFC2 still need to leave their target register defined.
        if opcode == OP_COP2 {
            let zero = load_operand(asm, PsxReg::R0, SCRATCH_A);
            store_result(asm, op.target, zero);
        }
        return;
    }

    let (width, sign_extend): (u8, bool) = match opcode {
        OP_LB => (1, true),
        OP_LBU => (1, false),
        OP_LH => (2, true),
        OP_LHU => (2, false),
        _ => (4, false),
    };

    let base = load_operand(asm, op.op0, SCRATCH_A);
    asm.mov_reg(ADDR_REG, base);
    asm.alu_imm(AluOp::Add, ADDR_REG, op.imm.signed());
    truncate_to_u32(asm, ADDR_REG);

    emit_alignment_check(asm, env, pc, ADDR_REG, SCRATCH_A, width, VmException::LoadAddressError);
    emit_canonicalize(asm, ADDR_REG, CANON_REG);

    let ram_label = asm.new_label();
    let scratchpad_label = asm.new_label();
    let mmio_label = asm.new_label();
    let done_label = asm.new_label();

    // RAM is mirrored four times ("< 4 * RAM_SIZE"); the mirror span is
    // computed fresh each time rather than cached, since ram_len lives
    // in guest state, not a compile-time constant.
    asm.load(SCRATCH_B, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::RAM_LEN_OFFSET as i32 }, 4, false);
    asm.shift_imm(ShiftOp::Shl, SCRATCH_B, 2);
    asm.cmp_reg(CANON_REG, SCRATCH_B);
    asm.jcc(Cond::Below, ram_label);

    asm.mov_reg(SCRATCH_A, CANON_REG);
    asm.alu_imm(AluOp::Sub, SCRATCH_A, SCRATCHPAD_BASE as i32);
    asm.load(SCRATCH_C, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::SCRATCHPAD_LEN_OFFSET as i32 }, 4, false);
    asm.cmp_reg(SCRATCH_A, SCRATCH_C);
    asm.jcc(Cond::Below, scratchpad_label);
    asm.jmp(mmio_label);

    asm.bind(ram_label);
    asm.load(SCRATCH_B, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::RAM_LEN_OFFSET as i32 }, 4, false);
    asm.alu_imm(AluOp::Sub, SCRATCH_B, 1);
    asm.alu_reg(AluOp::And, CANON_REG, SCRATCH_B);
    asm.load(SCRATCH_C, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::RAM_PTR_OFFSET as i32 }, 8, false);
    asm.load(HostReg::Rax, Mem::BaseIndexDisp { base: SCRATCH_C, index: CANON_REG, scale: 1, disp: 0 }, width, sign_extend);
    asm.jmp(done_label);

    asm.bind(scratchpad_label);
    // SCRATCH_A already holds the scratchpad-relative offset.
    asm.load(SCRATCH_C, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::SCRATCHPAD_PTR_OFFSET as i32 }, 8, false);
    asm.load(HostReg::Rax, Mem::BaseIndexDisp { base: SCRATCH_C, index: SCRATCH_A, scale: 1, disp: 0 }, width, sign_extend);
    asm.jmp(done_label);

    asm.bind(mmio_label);
    let fn_addr = match opcode {
        OP_LB => env.load_b,
        OP_LBU => env.load_bu,
        OP_LH => env.load_h,
        OP_LHU => env.load_hu,
        _ => env.load_w,
    };
    asm.mov_reg(HostReg::Rdi, STATE_REG);
    asm.mov_imm(SCRATCH_B, fn_addr as i64);
    asm.call_indirect(SCRATCH_B);

    asm.bind(done_label);
    store_result(asm, op.target, HostReg::Rax);
}

/// Byte offset inside `DynarecState` of the given COP0 register's
/// shadow storage. Only SR/CAUSE/EPC are modeled as real state; every
/// other COP0 register (BPC, BDA, ...) is a GTE/debug-register
/// external collaborator concern and reads back as zero.
fn cop0_field_offset(cop0_index: u32) -> Option<i32> {
    match crate::regs::Cop0Reg::from_index(cop0_index) {
        Some(crate::regs::Cop0Reg::Sr) => Some(DynarecState::COP0_SR_OFFSET as i32),
        Some(crate::regs::Cop0Reg::Cause) => Some(DynarecState::COP0_CAUSE_OFFSET as i32),
        Some(crate::regs::Cop0Reg::Epc) => Some(DynarecState::COP0_EPC_OFFSET as i32),
        _ => None,
    }
}

/// Emit a SIMPLE op (ALU, SWx store, RFE, GTE stub) that doesn't
/// involve branch or load delay scheduling. `pc` is only used for
/// `UnhandledOpcode` diagnostics.
fn compile_simple<B: Backend>(
    asm: &mut B,
    env: &CompileEnv,
    pc: u32,
    op: &OpDesc,
) -> HResult<Option<UnimplementedCause>> {
    let opcode = op.instruction >> 26;
    let func = op.instruction & 0x3F;

    match op.op_type {
        OpType::StoreNoAlign | OpType::Simple if is_store(opcode) => {
            emit_store(asm, env, pc, op);
            return Ok(None);
        }
        _ => {}
    }

    match opcode {
        OP_LUI => {
            let v = load_operand(asm, PsxReg::R0, SCRATCH_A);
            asm.mov_imm(v, (op.imm.unsigned() << 16) as i32 as i64);
            store_result(asm, op.target, v);
        }
        OP_ORI | OP_ANDI | OP_XORI => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let alu = match opcode {
                OP_ORI => AluOp::Or,
                OP_ANDI => AluOp::And,
                _ => AluOp::Xor,
            };
            asm.alu_imm(alu, a, op.imm.unsigned() as i32);
            store_result(asm, op.target, a);
        }
        OP_ADDI | OP_ADDIU => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            asm.alu_imm(AluOp::Add, a, op.imm.signed());
            store_result(asm, op.target, a);
        }
        OP_SLTI => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            asm.cmp_imm(a, op.imm.signed());
            asm.set_from_cond(a, Cond::Less);
            store_result(asm, op.target, a);
        }
        OP_SLTIU => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            asm.cmp_imm(a, op.imm.signed());
            asm.set_from_cond(a, Cond::Below);
            store_result(asm, op.target, a);
        }
        OP_COP0 => {
            compile_cop0(asm, op);
        }
        OP_COP2 | OP_LWC2 | OP_SWC2 => {
            // GTE arithmetic is an external collaborator (spec.md §1
            // Non-goals); decode it correctly and drop it as a no-op.
        }
        OP_SPECIAL => return compile_special(asm, pc, op, func),
        _ if op.op_type == OpType::Simple && op.target.is_zero() && op.op0.is_zero() && op.op1.is_zero() => {
            // Documented-illegal no-effect encoding.
        }
        _ => return Ok(Some(UnimplementedCause::UnhandledOpcode { at: pc, instruction: op.instruction })),
    }

    Ok(None)
}

fn is_store(opcode: u32) -> bool {
    matches!(opcode, OP_SB | OP_SH | OP_SW | OP_SWL | OP_SWR)
}

fn compile_special<B: Backend>(
    asm: &mut B,
    pc: u32,
    op: &OpDesc,
    func: u32,
) -> HResult<Option<UnimplementedCause>> {
    match func {
        FN_SLL | FN_SRL | FN_SRA => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let shift_op = match func {
                FN_SLL => ShiftOp::Shl,
                FN_SRL => ShiftOp::Shr,
                _ => ShiftOp::Sar,
            };
            asm.shift_imm(shift_op, a, op.imm.unsigned() as u8);
            store_result(asm, op.target, a);
        }
        FN_SLLV | FN_SRLV | FN_SRAV => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let amount = load_operand(asm, op.op1, SCRATCH_B);
            asm.mov_reg(HostReg::Rcx, amount);
            let shift_op = match func {
                FN_SLLV => ShiftOp::Shl,
                FN_SRLV => ShiftOp::Shr,
                _ => ShiftOp::Sar,
            };
            asm.shift_cl(shift_op, a);
            store_result(asm, op.target, a);
        }
        FN_ADD | FN_ADDU => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let b = load_operand(asm, op.op1, SCRATCH_B);
            asm.alu_reg(AluOp::Add, a, b);
            store_result(asm, op.target, a);
        }
        FN_SUB | FN_SUBU => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let b = load_operand(asm, op.op1, SCRATCH_B);
            asm.alu_reg(AluOp::Sub, a, b);
            store_result(asm, op.target, a);
        }
        FN_AND => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let b = load_operand(asm, op.op1, SCRATCH_B);
            asm.alu_reg(AluOp::And, a, b);
            store_result(asm, op.target, a);
        }
        FN_OR => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let b = load_operand(asm, op.op1, SCRATCH_B);
            asm.alu_reg(AluOp::Or, a, b);
            store_result(asm, op.target, a);
        }
        FN_XOR => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let b = load_operand(asm, op.op1, SCRATCH_B);
            asm.alu_reg(AluOp::Xor, a, b);
            store_result(asm, op.target, a);
        }
        FN_NOR => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let b = load_operand(asm, op.op1, SCRATCH_B);
            asm.alu_reg(AluOp::Or, a, b);
            asm.alu_imm(AluOp::Xor, a, -1);
            store_result(asm, op.target, a);
        }
        FN_SLT => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let b = load_operand(asm, op.op1, SCRATCH_B);
            asm.cmp_reg(a, b);
            asm.set_from_cond(a, Cond::Less);
            store_result(asm, op.target, a);
        }
        FN_SLTU => {
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let b = load_operand(asm, op.op1, SCRATCH_B);
            asm.cmp_reg(a, b);
            asm.set_from_cond(a, Cond::Below);
            store_result(asm, op.target, a);
        }
        FN_MFHI => {
            let hi = load_operand(asm, PsxReg::Hi, SCRATCH_A);
            store_result(asm, op.target, hi);
        }
        FN_MTHI => {
            let v = load_operand(asm, op.op0, SCRATCH_A);
            store_result(asm, PsxReg::Hi, v);
        }
        FN_MFLO => {
            let lo = load_operand(asm, PsxReg::Lo, SCRATCH_A);
            store_result(asm, op.target, lo);
        }
        FN_MTLO => {
            let v = load_operand(asm, op.op0, SCRATCH_A);
            store_result(asm, PsxReg::Lo, v);
        }
        FN_MULT | FN_MULTU => {
            // 32x32->32 product kept in LO; HI is left at zero. GTE-grade
            // 64-bit precision is outside this core's scope (no `idiv`/
            // widening-multiply primitive is in the Host Assembler's
            // required set, see DESIGN.md).
            let a = load_operand(asm, op.op0, SCRATCH_A);
            let b = load_operand(asm, op.op1, SCRATCH_B);
            asm.imul_reg(a, b);
            store_result(asm, PsxReg::Lo, a);
            let zero = load_operand(asm, PsxReg::R0, SCRATCH_C);
            store_result(asm, PsxReg::Hi, zero);
        }
        FN_JR | FN_JALR => unreachable!("JR/JALR are BranchAlways, handled in compile_branch"),
        _ => return Ok(Some(UnimplementedCause::UnhandledOpcode { at: pc, instruction: op.instruction })),
    }
    Ok(None)
}

fn compile_cop0<B: Backend>(asm: &mut B, op: &OpDesc) {
    let sub = (op.instruction >> 21) & 0x1F;
    if sub == COP_MT {
        let v = load_operand(asm, op.op0, SCRATCH_A);
        if let Some(offset) = match crate::regs::Cop0Reg::from_index(op.imm.unsigned()) {
            Some(crate::regs::Cop0Reg::Sr) => Some(DynarecState::COP0_SR_OFFSET as i32),
            Some(crate::regs::Cop0Reg::Cause) => Some(DynarecState::COP0_CAUSE_OFFSET as i32),
            _ => None,
        } {
            asm.store(Mem::BaseDisp { base: STATE_REG, disp: offset }, v, 4);
        }
    }
    // RFE and other unmodeled COP0 writes are no-ops in this core.
}

/// Emit a guest store: alignment check, region routing, and -- for RAM
/// only -- clearing the affected page's validity byte inline so any
/// cached translation covering it is treated as stale before the next
/// direct jump into it (see `emit_link_to`, and `Dynarec::run`'s
/// eviction of the `BlockCache` entries themselves).
fn emit_store<B: Backend>(asm: &mut B, env: &CompileEnv, pc: u32, op: &OpDesc) {
    let opcode = op.instruction >> 26;
    let width: u8 = match opcode {
        OP_SB => 1,
        OP_SH => 2,
        _ => 4,
    };

    let base = load_operand(asm, op.op0, SCRATCH_B);
    asm.mov_reg(ADDR_REG, base);
    asm.alu_imm(AluOp::Add, ADDR_REG, op.imm.signed());
    truncate_to_u32(asm, ADDR_REG);

    // Pin the value to a fixed register up front: `load_operand` may
    // have returned a pinned guest register instead of SCRATCH_B, and
    // SCRATCH_B/C get reused heavily by the routing below.
    let raw_value = load_operand(asm, op.op1, SCRATCH_B);
    asm.mov_reg(SCRATCH_A, raw_value);
    let value = SCRATCH_A;

    emit_alignment_check(asm, env, pc, ADDR_REG, SCRATCH_B, width, VmException::StoreAddressError);
    emit_canonicalize(asm, ADDR_REG, CANON_REG);

    let ram_label = asm.new_label();
    let scratchpad_label = asm.new_label();
    let mmio_label = asm.new_label();
    let done_label = asm.new_label();

    asm.load(SCRATCH_B, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::RAM_LEN_OFFSET as i32 }, 4, false);
    asm.shift_imm(ShiftOp::Shl, SCRATCH_B, 2);
    asm.cmp_reg(CANON_REG, SCRATCH_B);
    asm.jcc(Cond::Below, ram_label);

    asm.mov_reg(SCRATCH_B, CANON_REG);
    asm.alu_imm(AluOp::Sub, SCRATCH_B, SCRATCHPAD_BASE as i32);
    asm.load(SCRATCH_C, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::SCRATCHPAD_LEN_OFFSET as i32 }, 4, false);
    asm.cmp_reg(SCRATCH_B, SCRATCH_C);
    asm.jcc(Cond::Below, scratchpad_label);
    asm.jmp(mmio_label);

    asm.bind(ram_label);
    asm.load(SCRATCH_B, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::RAM_LEN_OFFSET as i32 }, 4, false);
    asm.alu_imm(AluOp::Sub, SCRATCH_B, 1);
    asm.alu_reg(AluOp::And, CANON_REG, SCRATCH_B); // CANON_REG is now the RAM offset.
    // Clear the page's validity byte before the data write.
    asm.mov_reg(ADDR_REG, CANON_REG); // ADDR_REG is dead here: address already canonicalized/routed.
    asm.shift_imm(ShiftOp::Shr, ADDR_REG, PAGE_SIZE_SHIFT as u8);
    asm.load(SCRATCH_B, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::PAGES_PTR_OFFSET as i32 }, 8, false);
    asm.mov_imm(SCRATCH_C, 0);
    asm.store(Mem::BaseIndexDisp { base: SCRATCH_B, index: ADDR_REG, scale: 1, disp: 0 }, SCRATCH_C, 1);
    asm.load(SCRATCH_B, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::RAM_PTR_OFFSET as i32 }, 8, false);
    asm.store(Mem::BaseIndexDisp { base: SCRATCH_B, index: CANON_REG, scale: 1, disp: 0 }, value, width);
    asm.jmp(done_label);

    asm.bind(scratchpad_label);
    // SCRATCH_B already holds the scratchpad-relative offset.
    asm.load(SCRATCH_C, Mem::BaseDisp { base: STATE_REG, disp: DynarecState::SCRATCHPAD_PTR_OFFSET as i32 }, 8, false);
    asm.store(Mem::BaseIndexDisp { base: SCRATCH_C, index: SCRATCH_B, scale: 1, disp: 0 }, value, width);
    asm.jmp(done_label);

    asm.bind(mmio_label);
    let fn_addr = match opcode {
        OP_SB => env.store_b,
        OP_SH => env.store_h,
        _ => env.store_w,
    };
    asm.mov_reg(HostReg::Rdx, value);
    asm.mov_reg(HostReg::Rdi, STATE_REG);
    asm.mov_imm(SCRATCH_B, fn_addr as i64);
    asm.call_indirect(SCRATCH_B);

    asm.bind(done_label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Amd64Assembler;
    use crate::runtime::Config;

    fn env() -> CompileEnv {
        CompileEnv {
            arena_base: 0x1000,
            resolver_addr: 0x2000,
            exit_trampoline_addr: 0x3000,
            dispatch_ctx_offset: 128,
            pc_field_offset: 132,
            load_b: 0x4000,
            load_bu: 0x4010,
            load_h: 0x4020,
            load_hu: 0x4030,
            load_w: 0x4040,
            store_b: 0x5000,
            store_h: 0x5010,
            store_w: 0x5020,
        }
    }

    fn enc_r(opcode: u32, rs: u32, rt: u32, rd: u32, shamt: u32, func: u32) -> u32 {
        (opcode << 26) | (rs << 21) | (rt << 16) | (rd << 11) | (shamt << 6) | func
    }

    fn enc_i(opcode: u32, rs: u32, rt: u32, imm: u16) -> u32 {
        (opcode << 26) | (rs << 21) | (rt << 16) | imm as u32
    }

    #[test]
    fn lwl_lwr_fold_into_a_single_load() {
        // LWR $t0, 0($sp); LWL $t0, 3($sp) -- diff == 3 in either order.
        let lwr = decode(enc_i(OP_LWR, 29, 8, 0));
        let lwl = decode(enc_i(OP_LWL, 29, 8, 3));
        assert!(try_fold_pair(&lwl, &lwr).is_some());
        assert!(try_fold_pair(&lwr, &lwl).is_some());
    }

    #[test]
    fn mismatched_base_does_not_fold() {
        let lwr = decode(enc_i(OP_LWR, 29, 8, 0));
        let lwl = decode(enc_i(OP_LWL, 8, 8, 3));
        assert!(try_fold_pair(&lwl, &lwr).is_none());
    }

    #[test]
    fn branch_with_nested_branch_in_delay_slot_is_unimplemented() {
        let beq = decode(enc_i(OP_BEQ, 8, 9, 4));
        let nested = decode(enc_i(OP_J, 0, 0, 0));
        let mut asm = Amd64Assembler::new();
        let state = DynarecState::new(Config::default());
        let mut ctx = Ctx { env: &env(), cache: &BlockCache::new(), state: &state, pending_edges: Vec::new() };
        let result = compile_branch(&mut asm, &mut ctx, 0, &beq, &nested).unwrap();
        assert!(matches!(result, Some(UnimplementedCause::NestedDelaySlot { .. })));
    }

    #[test]
    fn register_race_on_branch_target_is_detected() {
        // JAL target: RA. Delay slot writes RA too.
        let jal = decode((OP_JAL << 26) | 0);
        let delay = decode(enc_r(OP_SPECIAL, 8, 8, 31, 0, FN_ADDU));
        let mut asm = Amd64Assembler::new();
        let state = DynarecState::new(Config::default());
        let mut ctx = Ctx { env: &env(), cache: &BlockCache::new(), state: &state, pending_edges: Vec::new() };
        let result = compile_branch(&mut asm, &mut ctx, 0, &jal, &delay).unwrap();
        assert!(matches!(result, Some(UnimplementedCause::RegisterRaceOnBranchTarget { .. })));
    }

    #[test]
    fn unresolved_branch_target_reserves_a_pending_edge() {
        let j = decode(OP_J << 26);
        let nop = OpDesc::NOP;
        let mut asm = Amd64Assembler::new();
        let state = DynarecState::new(Config::default());
        let mut ctx = Ctx { env: &env(), cache: &BlockCache::new(), state: &state, pending_edges: Vec::new() };
        compile_branch(&mut asm, &mut ctx, 0, &j, &nop).unwrap();
        assert_eq!(ctx.pending_edges.len(), 1);
    }
}
