//! x86-64 `Arch` backend, built on `iced-x86`.
//!
//! The forward jump patch is an indirect jump through an inline 8-byte
//! literal (`ff 25 00 00 00 00` + address), not a 5-byte relative `jmp
//! rel32`: a relative jump can't reach an arbitrary 64-bit replacement
//! address, and this avoids clobbering a register the way a
//! load-immediate-then-jump sequence would.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

use super::{Arch, ArchContext, TransformFlags, TransformResult};
use crate::error::HookError;

/// `ff 25 00 00 00 00` (`jmp qword ptr [rip+0]`) followed by the 8-byte
/// absolute target address.
const JUMP_PATCH_SIZE: usize = 14;

/// How many extra bytes past the nominal patch boundary we're willing to
/// decode into, in case the last covering instruction straddles it.
const DECODE_SLACK: usize = 16;

/// How far past the patched region we scan for inbound branches.
const INBOUND_SCAN_WINDOW: usize = 4096;

pub struct X86_64;

fn write_jmp_indirect(out: &mut [u8], to_pc: usize) -> usize {
    out[0] = 0xFF;
    out[1] = 0x25;
    out[2..6].copy_from_slice(&0u32.to_le_bytes());
    out[6..14].copy_from_slice(&(to_pc as u64).to_le_bytes());
    JUMP_PATCH_SIZE
}

impl Arch for X86_64 {
    const MAX_JUMP_PATCH_SIZE: usize = JUMP_PATCH_SIZE;
    const TD_MAX_REWRITTEN_SIZE: usize = 64;
    const MAX_CODE_ALIGNMENT: usize = 16;

    fn strip_mode_bit(addr: usize) -> (usize, bool) {
        (addr, false)
    }

    fn apply_mode_bit(addr: usize, _set: bool) -> usize {
        addr
    }

    fn jump_patch_size(_from_pc: usize, _to_pc: usize, _is_trampoline: bool) -> usize {
        JUMP_PATCH_SIZE
    }

    fn make_jump_patch(out: &mut [u8], _from_pc: usize, to_pc: usize, _is_trampoline: bool) -> usize {
        write_jmp_indirect(out, to_pc)
    }

    unsafe fn transform_prologue(
        code: *const u8,
        min_patch_len: usize,
        out: &mut [u8],
        out_addr: usize,
        flags: TransformFlags,
        _ctx: &mut ArchContext,
    ) -> Result<TransformResult, HookError> {
        let read_len = min_patch_len + JUMP_PATCH_SIZE + DECODE_SLACK;
        let bytes = unsafe { std::slice::from_raw_parts(code, read_len) };
        let base_ip = code as u64;

        let mut decoder = Decoder::with_ip(64, bytes, base_ip, DecoderOptions::NONE);
        let mut insns: Vec<Instruction> = Vec::new();
        let mut covered = 0usize;
        while decoder.can_decode() && covered < min_patch_len {
            let insn = decoder.decode();
            if insn.is_invalid() {
                return Err(HookError::UnrecoverableInstruction(
                    "undecodable byte sequence in prologue".into(),
                ));
            }
            reject_if_unsafe(&insn, flags)?;
            covered = (insn.ip() + insn.len() as u64 - base_ip) as usize;
            insns.push(insn);
        }

        let block = InstructionBlock::new(&insns, out_addr as u64);
        let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE).map_err(|e| {
            HookError::UnrecoverableInstruction(format!("re-encoding prologue failed: {e}"))
        })?;
        let code_bytes = encoded.code_buffer;
        out[..code_bytes.len()].copy_from_slice(&code_bytes);

        Ok(TransformResult {
            written: code_bytes.len(),
            patch_end: (base_ip as usize) + covered,
        })
    }

    unsafe fn scan_inbound_jumps(
        code: *const u8,
        scan_window: usize,
        patch_start: usize,
        patch_end: usize,
    ) -> Result<(), HookError> {
        let window = scan_window.min(INBOUND_SCAN_WINDOW);
        let bytes = unsafe { std::slice::from_raw_parts(code, window) };
        let base_ip = code as u64;
        let mut decoder = Decoder::with_ip(64, bytes, base_ip, DecoderOptions::NONE);

        while decoder.can_decode() {
            let insn = decoder.decode();
            if insn.is_invalid() {
                break;
            }
            match insn.flow_control() {
                FlowControl::UnconditionalBranch
                | FlowControl::ConditionalBranch
                | FlowControl::Call => {
                    let target = insn.near_branch_target() as usize;
                    if target >= patch_start && target < patch_end {
                        return Err(HookError::JumpIntoPatchedRegion);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn reject_if_unsafe(insn: &Instruction, flags: TransformFlags) -> Result<(), HookError> {
    match insn.flow_control() {
        FlowControl::IndirectBranch => {
            return Err(HookError::UnrecoverableInstruction(
                "indirect branch in prologue".into(),
            ));
        }
        FlowControl::IndirectCall => {
            return Err(HookError::UnrecoverableInstruction(
                "indirect call in prologue".into(),
            ));
        }
        FlowControl::Interrupt => {
            return Err(HookError::UnrecoverableInstruction(
                "interrupt instruction in prologue".into(),
            ));
        }
        FlowControl::XbeginXabortXend => {
            return Err(HookError::UnrecoverableInstruction(
                "transactional-memory instruction in prologue".into(),
            ));
        }
        FlowControl::Exception => {
            return Err(HookError::UnrecoverableInstruction(
                "faulting instruction in prologue".into(),
            ));
        }
        FlowControl::Call if flags.contains(TransformFlags::BAN_CALLS) => {
            return Err(HookError::UnrecoverableInstruction(
                "call instruction in prologue under thread-safe mode".into(),
            ));
        }
        FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch
            if flags.contains(TransformFlags::FORBID_RELATIVE_JUMPS) =>
        {
            return Err(HookError::UnrecoverableInstruction(
                "relative branch in prologue not permitted".into(),
            ));
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_patch_is_fourteen_bytes() {
        let mut buf = [0u8; JUMP_PATCH_SIZE];
        let n = X86_64::make_jump_patch(&mut buf, 0x1000, 0x2000, false);
        assert_eq!(n, JUMP_PATCH_SIZE);
        assert_eq!(buf[0], 0xFF);
        assert_eq!(buf[1], 0x25);
        assert_eq!(u64::from_le_bytes(buf[6..14].try_into().unwrap()), 0x2000);
    }

    #[test]
    fn mode_bit_is_identity_on_x86_64() {
        let (addr, set) = X86_64::strip_mode_bit(0x4001);
        assert_eq!(addr, 0x4001);
        assert!(!set);
        assert_eq!(X86_64::apply_mode_bit(0x4001, false), 0x4001);
    }

    #[test]
    fn transform_relocates_simple_prologue() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20; nop-padded well past the
        // decoder's worst-case read window so the test never overreads.
        let mut code = [0x90u8; 64];
        code[0..8].copy_from_slice(&[0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20]);
        let mut out = [0u8; 64];
        let mut ctx = ArchContext::default();
        let result = unsafe {
            X86_64::transform_prologue(
                code.as_ptr(),
                JUMP_PATCH_SIZE,
                &mut out,
                out.as_ptr() as usize,
                TransformFlags::BAN_CALLS,
                &mut ctx,
            )
        }
        .expect("relocation should succeed for a plain prologue");
        assert!(result.written > 0);
        assert!(result.patch_end >= code.as_ptr() as usize + JUMP_PATCH_SIZE);
    }
}
