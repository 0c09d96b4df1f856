//! x86-64 instruction helpers
//!
//! The few fixed encodings the engine patches into foreign code are
//! hand-rolled; everything that needs real instruction knowledge (length
//! measurement, relocation) goes through iced-x86.

use iced_x86::{Decoder, DecoderOptions, Encoder};
use latch_common::{Error, Result};

/// x64 relative jump instruction (5 bytes, ±2GB range)
pub const JMP_REL32_SIZE: usize = 5;

/// x64 indirect jump through a rip-relative pointer slot (6 bytes)
/// FF 25 [4-byte displacement]
pub const JMP_INDIRECT_SIZE: usize = 6;

/// NOP instruction
pub const NOP: u8 = 0x90;

const BITNESS: u32 = 64;

/// Longest x86 instruction; how many bytes the decoder may look at.
const MAX_INSTRUCTION_LEN: usize = 15;

/// Generate x64 relative jump if target is within range
pub fn encode_jmp_rel32(from: usize, to: usize) -> Option<[u8; JMP_REL32_SIZE]> {
    let offset = to as i64 - (from as i64 + JMP_REL32_SIZE as i64);
    if offset >= i32::MIN as i64 && offset <= i32::MAX as i64 {
        let mut bytes = [0u8; JMP_REL32_SIZE];
        bytes[0] = 0xE9;
        bytes[1..5].copy_from_slice(&(offset as i32).to_le_bytes());
        Some(bytes)
    } else {
        None
    }
}

/// Generate `jmp [rip+disp32]` reading its target from the pointer slot at
/// `slot`. The slot must be within rel32 reach of the instruction end.
pub fn encode_jmp_indirect(from: usize, slot: usize) -> Result<[u8; JMP_INDIRECT_SIZE]> {
    let offset = slot as i64 - (from as i64 + JMP_INDIRECT_SIZE as i64);
    if offset < i32::MIN as i64 || offset > i32::MAX as i64 {
        return Err(Error::Assembly(format!(
            "pointer slot {slot:#x} out of rel32 reach of {from:#x}"
        )));
    }
    let mut bytes = [0u8; JMP_INDIRECT_SIZE];
    bytes[0] = 0xFF;
    bytes[1] = 0x25;
    bytes[2..6].copy_from_slice(&(offset as i32).to_le_bytes());
    Ok(bytes)
}

/// Generate NOP sled
pub fn nops(count: usize) -> Vec<u8> {
    vec![NOP; count]
}

/// Length in bytes of the single instruction at `address`.
pub fn instruction_len(address: usize) -> Result<usize> {
    let bytes = crate::vm::read_bytes(address, MAX_INSTRUCTION_LEN);
    let mut decoder = Decoder::with_ip(BITNESS, &bytes, address as u64, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return Err(Error::Decode { address });
    }
    Ok(instruction.len())
}

/// Shortest run of whole instructions at `address` covering at least
/// `required` bytes. This is the prologue length a patch may overwrite
/// without splitting an instruction.
pub fn min_prologue_len(address: usize, required: usize) -> Result<usize> {
    let bytes = crate::vm::read_bytes(address, required + MAX_INSTRUCTION_LEN);
    let mut decoder = Decoder::with_ip(BITNESS, &bytes, address as u64, DecoderOptions::NONE);

    let mut total = 0usize;
    while total < required {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(Error::Decode {
                address: address + total,
            });
        }
        total += instruction.len();
    }
    Ok(total)
}

/// Re-encodes the instructions in `bytes` (originally at `source`) so they
/// can execute at `dest`, fixing RIP-relative operands for the new location.
/// `bytes` must end on an instruction boundary (see [`min_prologue_len`]).
/// Works from a saved copy, so the live bytes at `source` may already be
/// patched over.
pub fn relocate(bytes: &[u8], source: usize, dest: usize) -> Result<Vec<u8>> {
    let len = bytes.len();
    let mut decoder = Decoder::with_ip(BITNESS, bytes, source as u64, DecoderOptions::NONE);

    let mut out = Vec::with_capacity(len + 8);
    let mut consumed = 0usize;
    while consumed < len {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(Error::Decode {
                address: source + consumed,
            });
        }
        consumed += instruction.len();

        let mut encoder = Encoder::new(BITNESS);
        let new_ip = dest as u64 + out.len() as u64;
        match encoder.encode(&instruction, new_ip) {
            Ok(_) => out.extend_from_slice(&encoder.take_buffer()),
            Err(e) => {
                // A rel8 branch inside a prologue cannot be stretched here;
                // refuse rather than emit a jump into the wrong place.
                return Err(Error::Assembly(format!(
                    "cannot relocate instruction at {:#x}: {e}",
                    instruction.ip()
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_jmp_rel32_in_range() {
        let from: usize = 0x140001000;
        let to: usize = 0x140001100;
        let bytes = encode_jmp_rel32(from, to).unwrap();
        assert_eq!(bytes[0], 0xE9);
        let disp = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(from as i64 + 5 + disp as i64, to as i64);
    }

    #[test]
    fn test_encode_jmp_rel32_out_of_range() {
        assert!(encode_jmp_rel32(0x140001000, 0x7FF700000000).is_none());
    }

    #[test]
    fn test_encode_jmp_indirect() {
        let from: usize = 0x140001000;
        let slot: usize = 0x140002000;
        let bytes = encode_jmp_indirect(from, slot).unwrap();
        assert_eq!(&bytes[0..2], &[0xFF, 0x25]);
        let disp = i32::from_le_bytes(bytes[2..6].try_into().unwrap());
        assert_eq!(from as i64 + 6 + disp as i64, slot as i64);
    }

    #[test]
    fn test_encode_jmp_indirect_out_of_reach() {
        assert!(encode_jmp_indirect(0x140001000, 0x7FF700000000).is_err());
    }

    #[test]
    fn test_nops() {
        let sled = nops(4);
        assert_eq!(sled, vec![NOP; 4]);
    }

    #[test]
    fn test_min_prologue_len_never_splits() {
        // mov rax, imm64 (10 bytes); ret
        let code: [u8; 11] = [
            0x48, 0xB8, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0xC3,
        ];
        let len = min_prologue_len(code.as_ptr() as usize, JMP_INDIRECT_SIZE).unwrap();
        assert_eq!(len, 10);
    }

    #[test]
    fn test_min_prologue_len_exact_fit() {
        // Six single-byte pushes cover the requirement exactly.
        let code: [u8; 8] = [0x50, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0xC3];
        let len = min_prologue_len(code.as_ptr() as usize, JMP_INDIRECT_SIZE).unwrap();
        assert_eq!(len, 6);
    }

    #[test]
    fn test_instruction_len() {
        let code: [u8; 3] = [0x90, 0x90, 0xC3];
        assert_eq!(instruction_len(code.as_ptr() as usize).unwrap(), 1);
    }

    #[test]
    fn test_relocate_plain_instructions() {
        // push rbp; mov rbp, rsp -- nothing position dependent.
        let code: [u8; 4] = [0x55, 0x48, 0x89, 0xE5];
        let out = relocate(&code, 0x1000_0000, 0x7000_0000).unwrap();
        assert_eq!(out, code.to_vec());
    }

    #[test]
    fn test_relocate_rip_relative_lea() {
        // lea rax, [rip+0x10] at a known address.
        let code: [u8; 7] = [0x48, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00];
        let source: usize = 0x1000_0000;
        let target = source + 7 + 0x10;
        let dest = source + 0x1000;

        let out = relocate(&code, source, dest).unwrap();
        assert_eq!(out.len(), 7);
        assert_eq!(&out[0..3], &[0x48, 0x8D, 0x05]);
        let disp = i32::from_le_bytes(out[3..7].try_into().unwrap());
        assert_eq!((dest as i64 + 7 + disp as i64) as usize, target);
    }

    #[test]
    fn test_relocate_ignores_live_bytes() {
        // Relocation must work from the saved copy even after the source
        // location holds different (patched) bytes.
        let saved: [u8; 6] = [0x55, 0x48, 0x89, 0xE5, 0x90, 0x90];
        let out = relocate(&saved, 0x2000_0000, 0x3000_0000).unwrap();
        assert_eq!(out, saved.to_vec());
    }
}
