//! Dynamic binary translator core: MIPS R3000A (PlayStation CPU) guest
//! code compiled to native AMD64 machine code.
//!
//! [`Dynarec`] ties the pieces together: [`decoder`] and [`compiler`]
//! translate guest basic blocks, [`cache`] indexes the results and
//! links them to each other, and [`runtime`] owns the guest-visible
//! memory and register state compiled code runs against. None of the
//! lower modules know about each other's lifetimes — this module is
//! the only place that owns the executable arena and hands out the raw
//! addresses the compiler bakes into machine code.

pub mod backend;
pub mod cache;
pub mod compiler;
pub mod decoder;
pub mod error;
pub mod instruction;
pub mod jitdebug;
pub mod mips_consts;
pub mod regmap;
pub mod regs;
pub mod runtime;

use std::ptr::NonNull;

use bitflags::bitflags;

use backend::{Amd64Assembler, Backend, HostReg, Mem};
use cache::{BlockCache, BlockHandle, LinkSite};
use compiler::{CompileEnv, CompileOutcome, PATCH_REGION_LEN};
use error::{ExitReason, HostError, Result as HResult, UnimplementedCause};
use jitdebug::{JitDebugEntry, JitDebugObserver, NullObserver};
use regmap::{PINNED_GUEST_REGS, RegisterMap};
use runtime::{Config, DynarecState, RuntimeCallbacks};

bitflags! {
    /// Behavioral switches the host can set before calling `run`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DynarecOptions: u32 {
        /// Disable the self-patching link trampoline: every cross-block
        /// edge re-resolves through the resolver on every traversal.
        /// Exists for differential testing against the patched path.
        const NO_PATCH = 1 << 0;
    }
}

const CODE_ARENA_SIZE: usize = 16 * 1024 * 1024;

/// A single mmap'd RWX region blocks are appended to. Bump-allocated,
/// never compacted: invalidated blocks leave their bytes behind until
/// the whole arena (and therefore the whole cache) is dropped, trading
/// the complexity of relocating live code for never needing to.
struct CodeArena {
    base: NonNull<u8>,
    capacity: usize,
    cursor: usize,
}

impl CodeArena {
    fn new(capacity: usize) -> HResult<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HostError::MmapFailed(unsafe { *libc::__errno_location() }));
        }
        Ok(CodeArena {
            base: NonNull::new(ptr as *mut u8).expect("mmap returned null on success"),
            capacity,
            cursor: 0,
        })
    }

    fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Append `code`, returning its offset from `base_addr`.
    fn place(&mut self, code: &[u8]) -> HResult<usize> {
        if self.cursor + code.len() > self.capacity {
            return Err(HostError::ArenaExhausted {
                requested: code.len(),
                available: self.capacity - self.cursor,
            });
        }
        let offset = self.cursor;
        let dest = unsafe { self.base.as_ptr().add(offset) };
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), dest, code.len()) };
        self.cursor += code.len();
        Ok(offset)
    }

    /// Overwrite `len` bytes already placed in the arena, for inline-cache
    /// patching. `offset` is relative to the arena base.
    ///
    /// # Safety
    /// `offset..offset+bytes.len()` must have been previously written by
    /// `place`, and no thread may be concurrently executing through it —
    /// true here since the translator is single-threaded and a call site
    /// only ever gets patched from the resolver call it made itself.
    unsafe fn patch(&mut self, offset: usize, bytes: &[u8]) {
        let dest = self.base.as_ptr().add(offset);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len()) };
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.capacity);
        }
    }
}

/// Bundles the block cache and code arena behind a pointer compiled
/// code reaches through `DynarecState::dispatch_ctx`. The resolver and
/// the memory-access shims are the only things that ever dereference
/// this pointer from generated code's side; everything else goes
/// through ordinary Rust borrows via the owning `Dynarec`.
struct DispatchContext {
    cache: BlockCache,
    arena: CodeArena,
    state: *mut DynarecState,
    callbacks: *mut dyn RuntimeCallbacks,
    options: DynarecOptions,
    observer: Box<dyn JitDebugObserver>,
    exit_trampoline_addr: usize,
}

/// The top-level translator: owns guest state, the compiled-code arena,
/// and the block cache, and drives the interpreter-free `run` loop.
pub struct Dynarec {
    state: Box<DynarecState>,
    _callbacks: Box<dyn RuntimeCallbacks>,
    ctx: Box<DispatchContext>,
}

impl Dynarec {
    pub fn new(config: Config, callbacks: Box<dyn RuntimeCallbacks>, options: DynarecOptions) -> HResult<Self> {
        Self::with_observer(config, callbacks, options, Box::new(NullObserver))
    }

    pub fn with_observer(
        config: Config,
        mut callbacks: Box<dyn RuntimeCallbacks>,
        options: DynarecOptions,
        observer: Box<dyn JitDebugObserver>,
    ) -> HResult<Self> {
        let mut state = Box::new(DynarecState::new(config));
        let mut arena = CodeArena::new(CODE_ARENA_SIZE)?;
        let exit_trampoline_addr = place_exit_trampoline(&mut arena)?;

        let callbacks_ptr: *mut dyn RuntimeCallbacks = &mut *callbacks;
        let state_ptr: *mut DynarecState = &mut *state;

        let ctx = Box::new(DispatchContext {
            cache: BlockCache::new(),
            arena,
            state: state_ptr,
            callbacks: callbacks_ptr,
            options,
            observer,
            exit_trampoline_addr,
        });

        state.dispatch_ctx = &*ctx as *const DispatchContext as usize;

        Ok(Dynarec { state, _callbacks: callbacks, ctx })
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.state.pc = pc;
    }

    pub fn state(&self) -> &DynarecState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut DynarecState {
        &mut self.state
    }

    pub fn cached_block_count(&self) -> usize {
        self.ctx.cache.len()
    }

    /// Run until a compiled block reaches a genuine exit condition:
    /// SYSCALL, BREAK, the cycle counter going negative, a guest
    /// exception, or a translation the compiler refuses to perform.
    pub fn run(&mut self, cycle_budget: i64) -> ExitReason {
        self.state.counter = cycle_budget;
        let pc = self.state.pc;
        let handle = match cache_find_valid(&mut self.ctx.cache, &mut self.state, pc) {
            Some(handle) => handle,
            None => match self.compile_and_insert(pc) {
                Ok(handle) => handle,
                Err(CompileFailure::Unimplemented(cause)) => return ExitReason::Unimplemented(cause),
                Err(CompileFailure::Host(e)) => {
                    log::error!("dynarec: failed to compile block at {pc:#010x}: {e}");
                    return ExitReason::Unimplemented(UnimplementedCause::UnhandledOpcode {
                        at: pc,
                        instruction: self.state.fetch_instruction(pc),
                    });
                }
            },
        };
        self.enter(handle)
    }

    fn compile_env(&self) -> CompileEnv {
        CompileEnv {
            arena_base: self.ctx.arena.base_addr(),
            resolver_addr: resolve_link as usize,
            exit_trampoline_addr: self.ctx.exit_trampoline_addr,
            dispatch_ctx_offset: DynarecState::DISPATCH_CTX_OFFSET,
            pc_field_offset: DynarecState::PC_OFFSET,
            load_b: dynarec_load_b as usize,
            load_bu: dynarec_load_bu as usize,
            load_h: dynarec_load_h as usize,
            load_hu: dynarec_load_hu as usize,
            load_w: dynarec_load_w as usize,
            store_b: dynarec_store_b as usize,
            store_h: dynarec_store_h as usize,
            store_w: dynarec_store_w as usize,
        }
    }

    fn compile_and_insert(&mut self, pc: u32) -> Result<BlockHandle, CompileFailure> {
        let env = self.compile_env();
        let outcome = compiler::compile_block::<Amd64Assembler>(&self.state, &self.ctx.cache, pc, &env)
            .map_err(CompileFailure::Host)?;
        let compiled = match outcome {
            CompileOutcome::Compiled(block) => block,
            CompileOutcome::Unimplemented(cause) => return Err(CompileFailure::Unimplemented(cause)),
        };
        place_and_link(&mut self.ctx, pc, compiled).map_err(CompileFailure::Host)
    }

    /// Jump into a compiled block's body and run until it exits,
    /// loading the pinned register window from guest state before entry
    /// (the exit trampoline is responsible for writing it back).
    fn enter(&mut self, handle: BlockHandle) -> ExitReason {
        let target = self.ctx.arena.base_addr() + handle.body_offset;
        let packed = unsafe { enter_compiled_code(&mut self.state, target) };
        ExitReason::unpack(packed)
    }
}

enum CompileFailure {
    Unimplemented(UnimplementedCause),
    Host(HostError),
}

/// Place a freshly compiled block's code in the arena, patch in its own
/// link-trampoline call sites' self-address, register it in the cache,
/// and notify the debug observer. Shared between `compile_and_insert`
/// and `resolve_link`, which both need to place a block the first time
/// something jumps to it.
fn place_and_link(ctx: &mut DispatchContext, pc: u32, compiled: compiler::CompiledBlock) -> HResult<BlockHandle> {
    let body_offset = ctx.arena.place(&compiled.code)?;

    for edge in &compiled.pending_edges {
        let patch_site_abs = ctx.arena.base_addr() + body_offset + edge.patch_region_offset;
        unsafe {
            ctx.arena.patch(body_offset + edge.patch_site_operand_offset, &patch_site_abs.to_le_bytes());
        }
        ctx.cache.register_link(LinkSite {
            source_block: pc,
            target_pc: edge.target_pc,
            patch_offset: Some(body_offset + edge.patch_region_offset),
        });
    }

    let handle = BlockHandle {
        base_address: pc,
        body_offset,
        block_len_bytes: compiled.code.len(),
        psx_instructions: compiled.psx_instructions,
    };
    ctx.cache.insert(handle);
    ctx.observer.on_block_compiled(JitDebugEntry {
        base_address: pc,
        host_start: ctx.arena.base_addr() + body_offset,
        host_len: compiled.code.len(),
    });
    Ok(handle)
}

/// Build the process-wide exit trampoline once: writes the pinned guest
/// registers back into `DynarecState::regs` and returns to whoever
/// called into the compiled block (`enter_compiled_code`), with the
/// packed exit word already sitting in `RAX` from `compile_block`'s
/// `emit_exit`.
fn place_exit_trampoline(arena: &mut CodeArena) -> HResult<usize> {
    let mut asm = Amd64Assembler::new();
    for reg in PINNED_GUEST_REGS {
        let host = RegisterMap::pinned_host_reg(reg).expect("every PINNED_GUEST_REGS entry is pinned");
        let disp = (DynarecState::REGS_OFFSET + reg.state_offset()) as i32;
        asm.store(Mem::BaseDisp { base: HostReg::Rbx, disp }, host, 4);
    }
    asm.ret();
    let code = asm.finish().map_err(|o| HostError::DisplacementOverflow { patch_offset: o })?;
    let offset = arena.place(&code)?;
    Ok(arena.base_addr() + offset)
}

/// Enter a compiled block. Loads the pinned guest GPRs into R8-R15,
/// sets `RBX` to the state pointer and `RBP` to the live cycle counter,
/// and calls into `target`. `RAX` holds the packed exit word on return.
///
/// # Safety
/// `target` must be the address of a block previously produced by
/// `compile_block` and placed in `state`'s owning arena.
unsafe fn enter_compiled_code(state: &mut DynarecState, target: usize) -> i64 {
    let mut pinned: [u32; 8] = std::array::from_fn(|i| state.read_reg(PINNED_GUEST_REGS[i]));
    let state_ptr = state as *mut DynarecState as usize;
    let packed: i64;
    unsafe {
        std::arch::asm!(
            "push rbx",
            "push rbp",
            "mov rbx, {state}",
            "mov rbp, qword ptr [{state} + {counter_off}]",
            "call {target}",
            "mov qword ptr [{state} + {counter_off}], rbp",
            "pop rbp",
            "pop rbx",
            state = in(reg) state_ptr,
            counter_off = const DynarecState::COUNTER_OFFSET,
            target = in(reg) target,
            inout("r8") pinned[0],
            inout("r9") pinned[1],
            inout("r10") pinned[2],
            inout("r11") pinned[3],
            inout("r12") pinned[4],
            inout("r13") pinned[5],
            inout("r14") pinned[6],
            inout("r15") pinned[7],
            out("rax") packed,
            out("rcx") _,
            out("rdx") _,
            out("rsi") _,
            out("rdi") _,
            clobber_abi("C"),
        );
    }
    packed
}

/// Look up `pc`'s cached block, first evicting it (and re-marking its
/// page valid) if a guest store invalidated it since it was compiled.
/// `compiler::emit_link_to` makes the same validity check read-only,
/// trusting a direct jump only while the page stays clean; here, at the
/// only two sites that actually own a mutable `BlockCache`, staleness is
/// corrected instead of just detected.
fn cache_find_valid(cache: &mut BlockCache, state: &mut DynarecState, pc: u32) -> Option<BlockHandle> {
    let ram_size = state.ram.len();
    if let Some(page) = runtime::PageTable::tracked_page(pc, ram_size) {
        if !state.pages.is_valid(page) {
            cache.invalidate_page(page, ram_size);
            state.pages.revalidate(page);
        }
    }
    cache.find(pc)
}

fn dispatch_ctx_from<'a>(state_ptr: *mut DynarecState) -> &'a mut DispatchContext {
    unsafe {
        let raw = (*state_ptr).dispatch_ctx as *mut DispatchContext;
        &mut *raw
    }
}

/// Resolve a cross-block edge whose target wasn't compiled yet at the
/// time the call site was emitted. Compiles the target if needed, then
/// rewrites the call site's `PATCH_REGION_LEN`-byte inline cache to an
/// unconditional jump so every later traversal skips the resolver
/// entirely.
extern "C" fn resolve_link(ctx_ptr: *mut DispatchContext, target_pc: u32, patch_site: usize) -> usize {
    let ctx = unsafe { &mut *ctx_ptr };
    let state = unsafe { &mut *ctx.state };

    let handle = match cache_find_valid(&mut ctx.cache, state, target_pc) {
        Some(h) => h,
        None => {
            let env = CompileEnv {
                arena_base: ctx.arena.base_addr(),
                resolver_addr: resolve_link as usize,
                exit_trampoline_addr: ctx.exit_trampoline_addr,
                dispatch_ctx_offset: DynarecState::DISPATCH_CTX_OFFSET,
                pc_field_offset: DynarecState::PC_OFFSET,
                load_b: dynarec_load_b as usize,
                load_bu: dynarec_load_bu as usize,
                load_h: dynarec_load_h as usize,
                load_hu: dynarec_load_hu as usize,
                load_w: dynarec_load_w as usize,
                store_b: dynarec_store_b as usize,
                store_h: dynarec_store_h as usize,
                store_w: dynarec_store_w as usize,
            };
            let outcome = compiler::compile_block::<Amd64Assembler>(state, &ctx.cache, target_pc, &env);
            match outcome {
                Ok(CompileOutcome::Compiled(block)) => match place_and_link(ctx, target_pc, block) {
                    Ok(h) => h,
                    Err(e) => {
                        log::error!("dynarec: link resolver failed to place block: {e}");
                        return ctx.exit_trampoline_addr;
                    }
                },
                _ => {
                    log::error!("dynarec: link resolver hit an unimplemented target at {target_pc:#010x}");
                    return ctx.exit_trampoline_addr;
                }
            }
        }
    };

    let dest = ctx.arena.base_addr() + handle.body_offset;

    if patch_site != 0 && !ctx.options.contains(DynarecOptions::NO_PATCH) {
        let mut patch_asm = Amd64Assembler::new();
        patch_asm.mov_imm64_fixed(HostReg::Rax, dest as i64);
        patch_asm.jmp_indirect(HostReg::Rax);
        if let Ok(bytes) = patch_asm.finish() {
            debug_assert_eq!(bytes.len(), PATCH_REGION_LEN);
            let offset = patch_site - ctx.arena.base_addr();
            unsafe { ctx.arena.patch(offset, &bytes) };
        }
    }

    dest
}

macro_rules! load_shim {
    ($name:ident, $method:ident, $ret:ty, $conv:expr) => {
        extern "C" fn $name(state_ptr: *mut DynarecState, addr: u32) -> $ret {
            let ctx = dispatch_ctx_from(state_ptr);
            let state = unsafe { &mut *state_ptr };
            let callbacks = unsafe { &mut *ctx.callbacks };
            let (counter, value) = callbacks.$method(addr, state.counter);
            state.counter = counter;
            $conv(value)
        }
    };
}

load_shim!(dynarec_load_w, memory_lw, u32, |v: u32| v);
load_shim!(dynarec_load_h, memory_lh, u32, |v: i32| v as u32);
load_shim!(dynarec_load_hu, memory_lhu, u32, |v: u32| v);
load_shim!(dynarec_load_b, memory_lb, u32, |v: i32| v as u32);
load_shim!(dynarec_load_bu, memory_lbu, u32, |v: u32| v);

macro_rules! store_shim {
    ($name:ident, $method:ident, $ty:ty, $conv:expr) => {
        extern "C" fn $name(state_ptr: *mut DynarecState, addr: u32, value: u32) {
            let ctx = dispatch_ctx_from(state_ptr);
            let state = unsafe { &mut *state_ptr };
            let callbacks = unsafe { &mut *ctx.callbacks };
            state.counter = callbacks.$method(addr, $conv(value), state.counter);
        }
    };
}

store_shim!(dynarec_store_w, memory_sw, u32, |v: u32| v);
store_shim!(dynarec_store_h, memory_sh, u16, |v: u32| v as u16);
store_shim!(dynarec_store_b, memory_sb, u8, |v: u32| v as u8);

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::NullCallbacks;

    fn enc_i(opcode: u32, rs: u32, rt: u32, imm: u16) -> u32 {
        (opcode << 26) | (rs << 21) | (rt << 16) | imm as u32
    }

    fn new_dynarec() -> Dynarec {
        Dynarec::new(
            Config { ram_size: 64 * 1024, scratchpad_size: 1024, bios_size: 4096 },
            Box::new(NullCallbacks),
            DynarecOptions::empty(),
        )
        .unwrap()
    }

    #[test]
    fn run_a_syscall_only_block_exits_with_its_code() {
        let mut dynarec = new_dynarec();
        let word = (0u32 << 26) | (7 << 6) | mips_consts::FN_SYSCALL;
        dynarec.state_mut().ram[0..4].copy_from_slice(&word.to_le_bytes());
        dynarec.set_pc(0);

        match dynarec.run(1_000_000) {
            ExitReason::Syscall(code) => assert_eq!(code, 7),
            other => panic!("expected Syscall, got {other:?}"),
        }
    }

    #[test]
    fn counter_expiry_is_reported_on_a_tight_loop() {
        let mut dynarec = new_dynarec();
        // J 0 ; NOP (delay slot) -- an infinite loop back to address 0.
        let j_self = mips_consts::OP_J << 26;
        dynarec.state_mut().ram[0..4].copy_from_slice(&j_self.to_le_bytes());
        dynarec.state_mut().ram[4..8].copy_from_slice(&0u32.to_le_bytes());
        dynarec.set_pc(0);

        match dynarec.run(10) {
            ExitReason::CounterExpired => {}
            other => panic!("expected CounterExpired, got {other:?}"),
        }
    }

    #[test]
    fn lui_loads_the_upper_half_and_leaves_a_live_cache_entry() {
        let mut dynarec = new_dynarec();
        // LUI $v0, 0x1234 ; SYSCALL
        let lui = enc_i(mips_consts::OP_LUI, 0, 2, 0x1234);
        let syscall = 0u32 << 26 | mips_consts::FN_SYSCALL;
        dynarec.state_mut().ram[0..4].copy_from_slice(&lui.to_le_bytes());
        dynarec.state_mut().ram[4..8].copy_from_slice(&syscall.to_le_bytes());
        dynarec.set_pc(0);

        dynarec.run(1_000_000);
        assert_eq!(dynarec.state().read_reg(regs::PsxReg::V0), 0x1234_0000);
        assert_eq!(dynarec.cached_block_count(), 1);
    }
}
