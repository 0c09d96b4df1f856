//! Stub generation
//!
//! Builds the trampoline routine for one hooked method. The routine has two
//! parts laid out back to back:
//!
//! ```text
//! call-original:  <relocated prologue bytes>
//!                 jmp [rip+0]
//!                 dq  original_entry + prologue_len
//! entry:          push rbp
//!                 push rdi
//!                 sub rsp, frame
//!                 ; spill every argument to a value slot, store a shadow
//!                 ; pointer per slot, zero the return slot
//!                 ; for each chain node: call hook(ptr, ptr, ...) and stop
//!                 ; on a false result with the return slot already in rax
//!                 ; fall through: reload argument values, call the
//!                 ; call-original block
//! epilogue:       add rsp, frame
//!                 pop rdi
//!                 pop rbp
//!                 ret
//! ```
//!
//! Register roles follow the fixed convention: rcx/rdx/r8/r9 carry the first
//! four parameters, rdi walks the chain, r11 is scratch, r10 briefly holds a
//! hook's bool result while rax is loaded with the return slot.

use iced_x86::code_asm::{
    al, qword_ptr, r10, r10b, r11, r11d, r8, r9, rax, rbp, rcx, rdi, rdx, rsp, AsmRegister64,
    CodeAssembler,
};
use iced_x86::IcedError;
use latch_common::{Error, MethodSig, Result};
use tracing::debug;

use crate::allocator::MethodAllocator;
use crate::arch;
use crate::chain::HookChain;
use crate::routines::Routine;
use crate::vm;

/// Upper bound for one generated routine; far above what any supported
/// signature emits.
pub const MAX_STUB_SIZE: usize = 0x1000;

/// Outbound home space for the deepest call in the stub.
const SHADOW_SPACE: i32 = 0x20;

/// push rbp + push rdi.
const SAVED_REGS: i32 = 0x10;

const REGISTER_ARGS: usize = 4;

const ARG_REGS: [AsmRegister64; 4] = [rcx, rdx, r8, r9];

fn asm_err(e: IcedError) -> Error {
    Error::Assembly(e.to_string())
}

/// Stack frame layout for one signature.
///
/// The frame holds, top down: a value slot and a shadow-pointer slot per
/// parameter (arguments plus the return slot), then outbound stack-argument
/// space over the shadow area. `frame_size` keeps call sites 16-byte
/// aligned given the two pushed registers and the return address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameLayout {
    machine_args: usize,
    has_ret: bool,
}

impl FrameLayout {
    pub(crate) fn new(sig: &MethodSig) -> Self {
        Self {
            machine_args: sig.machine_arg_count(),
            has_ret: sig.has_return(),
        }
    }

    fn param_count(&self) -> usize {
        self.machine_args + usize::from(self.has_ret)
    }

    pub(crate) fn frame_size(&self) -> i32 {
        let params = self.param_count() as i32;
        let spill = if params > REGISTER_ARGS as i32 {
            (params - REGISTER_ARGS as i32) * 2 * 8
        } else {
            0
        };
        let mut size = params * 2 * 8 + spill + SHADOW_SPACE;
        if (size + SAVED_REGS) % 16 == 0 {
            size += 8;
        }
        size
    }

    /// Where the caller put stack argument `index` (>= 4), relative to rsp
    /// after the frame is established.
    fn incoming_arg(&self, index: usize) -> i32 {
        self.frame_size() + SAVED_REGS + 8 + SHADOW_SPACE + (index as i32 - 4) * 8
    }

    /// Outbound stack position for call parameter `index` (>= 4).
    fn outbound_arg(&self, index: usize) -> i32 {
        SHADOW_SPACE + (index as i32 - 4) * 8
    }

    /// Value storage slot for parameter `index`.
    fn value_slot(&self, index: usize) -> i32 {
        self.frame_size() - (2 * index as i32) * 8 - 8
    }

    /// Shadow slot holding the pointer to the value slot.
    fn pointer_slot(&self, index: usize) -> i32 {
        self.frame_size() - (2 * index as i32 + 1) * 8 - 8
    }
}

/// The original first instructions of a hooked method, captured before the
/// entry patch goes in. Every rebuild works from this copy; the live bytes
/// hold our jump by then.
#[derive(Debug, Clone)]
pub struct Prologue {
    pub bytes: Vec<u8>,
    pub native: usize,
}

impl Prologue {
    /// Reads the shortest whole-instruction run covering the patch size.
    /// Must run against the still-unpatched method entry.
    pub fn capture(native: usize) -> Result<Self> {
        let len = arch::min_prologue_len(native, arch::JMP_INDIRECT_SIZE)?;
        Ok(Self {
            bytes: vm::read_bytes(native, len),
            native,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One generated routine, ready to be targeted by an indirect cell.
#[derive(Debug)]
pub struct StubCode {
    pub routine: Routine,
    /// Relocated prologue + jump into the original's remainder. The cell
    /// points here while redirection is disabled.
    pub call_original: usize,
    /// Hook-dispatch entry. The cell points here while enabled.
    pub entry: usize,
    pub prologue_len: usize,
}

/// Assembles the routine for the method behind `prologue` with the current
/// hook chain.
pub fn build_stub(
    allocator: &mut MethodAllocator,
    prologue: &Prologue,
    sig: &MethodSig,
    chain: &HookChain,
) -> Result<StubCode> {
    let layout = FrameLayout::new(sig);
    let routine = allocator.reserve_routine(MAX_STUB_SIZE)?;

    match assemble_routine(routine.address, prologue, layout, chain) {
        Ok((bytes, entry_offset, prologue_len)) => {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    routine.address as *mut u8,
                    bytes.len(),
                );
            }
            vm::flush_instruction_cache(routine.address, bytes.len());
            let routine = allocator.shrink_routine(routine, bytes.len());

            debug!(
                target: "latch_core::stub",
                routine = format_args!("{:#x}", routine.address),
                size = routine.size,
                hooks = chain.len(),
                "assembled stub"
            );
            Ok(StubCode {
                routine,
                call_original: routine.address,
                entry: routine.address + entry_offset,
                prologue_len,
            })
        }
        Err(e) => {
            allocator.remove_routine(routine);
            Err(e)
        }
    }
}

fn assemble_routine(
    routine_address: usize,
    prologue: &Prologue,
    layout: FrameLayout,
    chain: &HookChain,
) -> Result<(Vec<u8>, usize, usize)> {
    let native = prologue.native;
    let prologue_len = prologue.len();
    let relocated = arch::relocate(&prologue.bytes, native, routine_address)?;
    // jmp [rip+0] is 6 bytes, the resume literal 8.
    let entry_offset = relocated.len() + 14;

    let frame = layout.frame_size();
    let args = layout.machine_args;
    let params = layout.param_count();

    let mut asm = CodeAssembler::new(64).map_err(asm_err)?;
    let mut block_original = asm.create_label();
    let mut resume_slot = asm.create_label();
    let mut epilogue = asm.create_label();

    // Call-original block.
    asm.set_label(&mut block_original).map_err(asm_err)?;
    asm.db(&relocated).map_err(asm_err)?;
    asm.jmp(qword_ptr(resume_slot)).map_err(asm_err)?;
    asm.set_label(&mut resume_slot).map_err(asm_err)?;
    asm.dq(&[(native + prologue_len) as u64]).map_err(asm_err)?;

    // Dispatch entry.
    asm.push(rbp).map_err(asm_err)?;
    asm.push(rdi).map_err(asm_err)?;
    asm.sub(rsp, frame).map_err(asm_err)?;

    if !chain.is_empty() {
        asm.mov(rdi, chain.root_slot_address() as u64)
            .map_err(asm_err)?;
        asm.mov(rdi, qword_ptr(rdi)).map_err(asm_err)?;
    }

    // Spill arguments and compute shadow pointers.
    for i in 0..args {
        if i < REGISTER_ARGS {
            asm.mov(qword_ptr(rsp + layout.value_slot(i)), ARG_REGS[i])
                .map_err(asm_err)?;
        } else {
            asm.mov(r11, qword_ptr(rsp + layout.incoming_arg(i)))
                .map_err(asm_err)?;
            asm.mov(qword_ptr(rsp + layout.value_slot(i)), r11)
                .map_err(asm_err)?;
        }
        asm.lea(r11, qword_ptr(rsp + layout.value_slot(i)))
            .map_err(asm_err)?;
        asm.mov(qword_ptr(rsp + layout.pointer_slot(i)), r11)
            .map_err(asm_err)?;
    }

    if layout.has_ret {
        let slot = args;
        asm.xor(r11d, r11d).map_err(asm_err)?;
        asm.mov(qword_ptr(rsp + layout.value_slot(slot)), r11)
            .map_err(asm_err)?;
        asm.lea(r11, qword_ptr(rsp + layout.value_slot(slot)))
            .map_err(asm_err)?;
        asm.mov(qword_ptr(rsp + layout.pointer_slot(slot)), r11)
            .map_err(asm_err)?;
    }

    // Chain walk. Every parameter is passed as its shadow pointer; a hook
    // returning false stops the chain with the return slot already in rax.
    if !chain.is_empty() {
        let mut dispatch = asm.create_label();
        asm.set_label(&mut dispatch).map_err(asm_err)?;
        asm.mov(rax, qword_ptr(rdi)).map_err(asm_err)?;
        for i in 0..params {
            if i < REGISTER_ARGS {
                asm.mov(ARG_REGS[i], qword_ptr(rsp + layout.pointer_slot(i)))
                    .map_err(asm_err)?;
            } else {
                asm.mov(r11, qword_ptr(rsp + layout.pointer_slot(i)))
                    .map_err(asm_err)?;
                asm.mov(qword_ptr(rsp + layout.outbound_arg(i)), r11)
                    .map_err(asm_err)?;
            }
        }
        asm.call(rax).map_err(asm_err)?;

        if layout.has_ret {
            asm.mov(r10, rax).map_err(asm_err)?;
            asm.mov(rax, qword_ptr(rsp + layout.value_slot(args)))
                .map_err(asm_err)?;
            asm.test(r10b, r10b).map_err(asm_err)?;
        } else {
            asm.test(al, al).map_err(asm_err)?;
        }
        asm.je(epilogue).map_err(asm_err)?;

        asm.mov(rdi, qword_ptr(rdi + 8)).map_err(asm_err)?;
        asm.test(rdi, rdi).map_err(asm_err)?;
        asm.jne(dispatch).map_err(asm_err)?;
    }

    // No veto: replay the (possibly hook-modified) argument values into the
    // original.
    for i in 0..args {
        if i < REGISTER_ARGS {
            asm.mov(ARG_REGS[i], qword_ptr(rsp + layout.value_slot(i)))
                .map_err(asm_err)?;
        } else {
            asm.mov(r11, qword_ptr(rsp + layout.value_slot(i)))
                .map_err(asm_err)?;
            asm.mov(qword_ptr(rsp + layout.outbound_arg(i)), r11)
                .map_err(asm_err)?;
        }
    }
    asm.call(block_original).map_err(asm_err)?;

    asm.set_label(&mut epilogue).map_err(asm_err)?;
    asm.add(rsp, frame).map_err(asm_err)?;
    asm.pop(rdi).map_err(asm_err)?;
    asm.pop(rbp).map_err(asm_err)?;
    asm.ret().map_err(asm_err)?;

    let bytes = asm.assemble(routine_address as u64).map_err(asm_err)?;
    if bytes.len() > MAX_STUB_SIZE {
        return Err(Error::Assembly(format!(
            "generated routine of {} bytes exceeds the {} byte bound",
            bytes.len(),
            MAX_STUB_SIZE
        )));
    }
    Ok((bytes, entry_offset, prologue_len))
}

/// Overwrites the method entry with a jump through its indirect cell, NOP
/// padding the rest of the measured prologue.
pub fn patch_entry(native: usize, prologue_len: usize, cell_address: usize) -> Result<()> {
    let mut bytes = arch::encode_jmp_indirect(native, cell_address)?.to_vec();
    bytes.extend(arch::nops(prologue_len - arch::JMP_INDIRECT_SIZE));
    vm::ensure_writable(native)?;
    vm::write_code(native, &bytes)
}
