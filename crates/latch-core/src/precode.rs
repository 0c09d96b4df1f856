//! Runtime thunk recognition
//!
//! Byte-pattern matchers for the two indirection layers a CoreCLR x64 method
//! pointer can sit behind before stable native code exists: the fixup
//! precode and the tiered-compilation call-counting stub. The patterns are
//! specific to that runtime flavor; hosting a different runtime means
//! replacing this module's matchers, not the resolver loop that drives them.

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use latch_common::Result;

use crate::vm;

const BITNESS: u32 = 64;

/// How many bytes the matchers may inspect at a candidate address.
const SCAN_WINDOW: usize = 48;

fn decode_at(address: usize) -> Decoder<'static> {
    // The window stays inside the thunk's page; runtime thunks are never
    // page-tail allocations.
    let bytes = unsafe { std::slice::from_raw_parts(address as *const u8, SCAN_WINDOW) };
    Decoder::with_ip(BITNESS, bytes, address as u64, DecoderOptions::NONE)
}

fn read_pointer(slot: usize) -> usize {
    unsafe { std::ptr::read_volatile(slot as *const usize) }
}

fn is_jmp_indirect(instruction: &Instruction) -> bool {
    instruction.mnemonic() == Mnemonic::Jmp
        && instruction.op0_kind() == OpKind::Memory
        && instruction.is_ip_rel_memory_operand()
}

/// A fixup precode: `jmp [rip+d]` / `mov r10, [rip+d]` / `jmp [rip+d]`.
#[derive(Debug, Clone, Copy)]
pub struct FixupPrecode {
    /// Pointer slot the entry jump reads its target from
    pub slot: usize,
    /// Raw displacement of the entry jump
    pub displacement: i32,
}

impl FixupPrecode {
    /// Matches the precode pattern at `address`.
    pub fn detect(address: usize) -> Option<Self> {
        let mut decoder = decode_at(address);

        let jmp0 = decoder.decode();
        if !is_jmp_indirect(&jmp0) {
            return None;
        }

        let mov = decoder.decode();
        let mov_matches = mov.mnemonic() == Mnemonic::Mov
            && mov.op0_kind() == OpKind::Register
            && mov.op0_register() == Register::R10
            && mov.op1_kind() == OpKind::Memory
            && mov.is_ip_rel_memory_operand();
        if !mov_matches {
            return None;
        }

        let jmp1 = decoder.decode();
        if !is_jmp_indirect(&jmp1) {
            return None;
        }

        let slot = jmp0.ip_rel_memory_address() as usize;
        let displacement = (jmp0.ip_rel_memory_address() as i64 - jmp0.next_ip() as i64) as i32;
        Some(Self { slot, displacement })
    }

    /// The runtime points a fresh precode's entry jump six bytes ahead, into
    /// its own fixup path; that displacement means no native code exists yet.
    pub fn is_unresolved(&self) -> bool {
        self.displacement == 0x06
    }

    /// Current redirect target stored in the pointer slot.
    pub fn target(&self) -> usize {
        read_pointer(self.slot)
    }
}

/// A tiered-compilation call-counting stub:
///
/// ```text
/// mov rax, [rip+d]      ; counter cell
/// dec qword ptr [rax]
/// je  +6                ; threshold reached -> second jmp
/// jmp [rip+d]           ; not reached -> current native body
/// jmp [rip+d]           ; threshold handler
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CountingStub {
    base: usize,
    /// Bytes covered by mov/dec/je
    counter_len: usize,
    body_jmp_len: usize,
    /// Pointer slot of the jump to the current native body
    body_slot: usize,
    threshold_off: usize,
    threshold_len: usize,
}

impl CountingStub {
    /// Matches the counting-stub pattern at `address`.
    pub fn detect(address: usize) -> Option<Self> {
        let mut decoder = decode_at(address);

        let mov = decoder.decode();
        let mov_matches = mov.mnemonic() == Mnemonic::Mov
            && mov.op0_kind() == OpKind::Register
            && mov.op0_register() == Register::RAX
            && mov.op1_kind() == OpKind::Memory
            && mov.is_ip_rel_memory_operand();
        if !mov_matches {
            return None;
        }

        let dec = decoder.decode();
        let dec_matches = dec.mnemonic() == Mnemonic::Dec
            && dec.op0_kind() == OpKind::Memory
            && dec.memory_base() == Register::RAX;
        if !dec_matches {
            return None;
        }

        let je = decoder.decode();
        let je_matches = je.mnemonic() == Mnemonic::Je
            && je.near_branch_target() == je.next_ip() + 0x06;
        if !je_matches {
            return None;
        }

        let body_jmp = decoder.decode();
        if !is_jmp_indirect(&body_jmp) {
            return None;
        }

        let threshold_jmp = decoder.decode();
        if !is_jmp_indirect(&threshold_jmp) {
            return None;
        }

        Some(Self {
            base: address,
            counter_len: (je.next_ip() - address as u64) as usize,
            body_jmp_len: body_jmp.len(),
            body_slot: body_jmp.ip_rel_memory_address() as usize,
            threshold_off: (threshold_jmp.ip() - address as u64) as usize,
            threshold_len: threshold_jmp.len(),
        })
    }

    /// Address of the current native body behind the stub.
    pub fn body_target(&self) -> usize {
        read_pointer(self.body_slot)
    }

    /// Overwrites the counter bookkeeping and the threshold jump with NOPs,
    /// leaving only the jump to the native body. The stub never again pays
    /// the per-call counter check, and the runtime never sees the threshold
    /// fire for this method.
    pub fn neutralize(&self) -> Result<()> {
        vm::ensure_writable(self.base)?;
        vm::write_code(self.base, &crate::arch::nops(self.counter_len))?;
        vm::write_code(
            self.base + self.threshold_off,
            &crate::arch::nops(self.threshold_len),
        )?;
        Ok(())
    }

    /// Offset of the preserved jump to the native body within the stub.
    pub fn body_jump_offset(&self) -> usize {
        self.counter_len
    }

    pub fn body_jump_len(&self) -> usize {
        self.body_jmp_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm;

    fn put_jmp_indirect(buf: &mut [u8], at: usize, slot: usize, base: usize) {
        let bytes = crate::arch::encode_jmp_indirect(base + at, base + slot).unwrap();
        buf[at..at + 6].copy_from_slice(&bytes);
    }

    /// Lay out a fixup precode in `buf`: code at 0, pointer slots at 24/32.
    fn build_precode(buf: &mut [u8], base: usize, entry_slot: usize, target: usize) {
        put_jmp_indirect(buf, 0, entry_slot, base);
        // mov r10, [rip+d] -> slot at 32
        buf[6..9].copy_from_slice(&[0x4C, 0x8B, 0x15]);
        let disp = (base + 32) as i64 - (base + 13) as i64;
        buf[9..13].copy_from_slice(&(disp as i32).to_le_bytes());
        put_jmp_indirect(buf, 13, 32, base);

        buf[entry_slot..entry_slot + 8].copy_from_slice(&target.to_le_bytes());
    }

    #[test]
    fn test_fixup_precode_detect_and_target() {
        let mut buf = vec![0u8; 64];
        let base = buf.as_ptr() as usize;
        build_precode(&mut buf, base, 24, 0x1122_3344_5566);

        let precode = FixupPrecode::detect(base).expect("pattern should match");
        assert!(!precode.is_unresolved());
        assert_eq!(precode.slot, base + 24);
        assert_eq!(precode.target(), 0x1122_3344_5566);
    }

    #[test]
    fn test_fixup_precode_unresolved() {
        let mut buf = vec![0u8; 64];
        let base = buf.as_ptr() as usize;
        build_precode(&mut buf, base, 24, 0);
        // Repoint the entry jump six bytes ahead, as the runtime leaves it
        // before the method is compiled.
        buf[2..6].copy_from_slice(&6i32.to_le_bytes());

        let precode = FixupPrecode::detect(base).expect("pattern should match");
        assert!(precode.is_unresolved());
    }

    #[test]
    fn test_fixup_precode_rejects_plain_code() {
        // push rbp; mov rbp, rsp; ret
        let buf: [u8; 48] = {
            let mut b = [0xCCu8; 48];
            b[0] = 0x55;
            b[1..4].copy_from_slice(&[0x48, 0x89, 0xE5]);
            b[4] = 0xC3;
            b
        };
        assert!(FixupPrecode::detect(buf.as_ptr() as usize).is_none());
    }

    /// Counting stub layout: code at 0, slots at 40 (counter), 48 (body),
    /// 56 (threshold handler).
    fn build_counting_stub(buf: &mut [u8], base: usize, body: usize) {
        // mov rax, [rip+d] -> counter cell slot at 40
        buf[0..3].copy_from_slice(&[0x48, 0x8B, 0x05]);
        let disp = (base + 40) as i64 - (base + 7) as i64;
        buf[3..7].copy_from_slice(&(disp as i32).to_le_bytes());
        // dec qword ptr [rax]
        buf[7..10].copy_from_slice(&[0x48, 0xFF, 0x08]);
        // je +6
        buf[10..12].copy_from_slice(&[0x74, 0x06]);
        put_jmp_indirect(buf, 12, 48, base);
        put_jmp_indirect(buf, 18, 56, base);

        buf[48..56].copy_from_slice(&body.to_le_bytes());
    }

    #[test]
    fn test_counting_stub_detect_and_target() {
        let mut buf = vec![0u8; 64];
        let base = buf.as_ptr() as usize;
        build_counting_stub(&mut buf, base, 0xAABB_CCDD);

        let stub = CountingStub::detect(base).expect("pattern should match");
        assert_eq!(stub.body_target(), 0xAABB_CCDD);
        assert_eq!(stub.body_jump_offset(), 12);
        assert_eq!(stub.body_jump_len(), 6);
    }

    #[test]
    fn test_counting_stub_rejects_precode() {
        let mut buf = vec![0u8; 64];
        let base = buf.as_ptr() as usize;
        build_precode(&mut buf, base, 24, 0x1000);
        assert!(CountingStub::detect(base).is_none());
    }

    #[test]
    fn test_counting_stub_neutralize() {
        let size = vm::page_size();
        let base = vm::alloc(size).unwrap();
        let mut buf = vec![0u8; 64];
        build_counting_stub(&mut buf, base, 0x1234_5678);
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), base as *mut u8, buf.len());
        }

        let stub = CountingStub::detect(base).expect("pattern should match");
        stub.neutralize().unwrap();

        let patched = vm::read_bytes(base, 24);
        // mov/dec/je nopped out ...
        assert!(patched[0..12].iter().all(|&b| b == crate::arch::NOP));
        // ... body jump intact ...
        assert_eq!(&patched[12..14], &[0xFF, 0x25]);
        // ... threshold jump nopped out.
        assert!(patched[18..24].iter().all(|&b| b == crate::arch::NOP));

        assert_eq!(stub.body_target(), 0x1234_5678);
        vm::free(base, size).unwrap();
    }
}
