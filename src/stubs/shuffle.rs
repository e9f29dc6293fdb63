//! Argument shuffling for delegate thunks and instantiating stubs.
use crate::{
    arch::{
        regs::{self, R11, R12, R9, RECEIVER, SP},
        Reg,
    },
    assembler::Assembler,
    error::EmitError,
    memory::{Address, WORD_SIZE},
};

/// Offset of the delegate field holding the static target's entry point.
pub const DELEGATE_METHOD_PTR_AUX: i32 = 24;

/// Register arguments before spilling to the stack (`r0..r3`).
const REGISTER_ARGS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    Reg(Reg),
    /// Byte offset from `sp`.
    Stack(i32),
}

impl ArgLocation {
    /// Where argument `index` lives under the stub calling convention.
    pub fn argument(index: usize) -> Self {
        if index < REGISTER_ARGS {
            ArgLocation::Reg(Reg::new(index as u8))
        } else {
            ArgLocation::Stack(((index - REGISTER_ARGS) as u64 * WORD_SIZE) as i32)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleEntry {
    pub src: ArgLocation,
    pub dst: ArgLocation,
}

impl ShuffleEntry {
    /// Moves for calling a static method through a delegate: the delegate
    /// occupies argument 0, so every real argument shifts down one position.
    pub fn static_delegate(arg_count: usize) -> Vec<ShuffleEntry> {
        (0..arg_count)
            .map(|i| ShuffleEntry {
                src: ArgLocation::argument(i + 1),
                dst: ArgLocation::argument(i),
            })
            .collect()
    }
}

fn emit_moves(asm: &mut Assembler, entries: &[ShuffleEntry]) {
    for entry in entries {
        match (entry.src, entry.dst) {
            (ArgLocation::Reg(src), ArgLocation::Reg(dst)) => asm.mov(dst, src),
            (ArgLocation::Stack(src), ArgLocation::Reg(dst)) => asm.load(dst, SP, src),
            (ArgLocation::Reg(src), ArgLocation::Stack(dst)) => asm.store(src, SP, dst),
            (ArgLocation::Stack(src), ArgLocation::Stack(dst)) => {
                asm.load(R9, SP, src);
                asm.store(R9, SP, dst);
            }
        }
    }
}

/// ```text
/// ldr r12, [r0, #aux]    ; before any move so a null delegate faults cleanly
/// <moves>
/// jr  r12
/// ```
pub(super) fn emit_delegate_thunk(
    asm: &mut Assembler,
    entries: &[ShuffleEntry],
) -> Result<(), EmitError> {
    debug_assert!(entries
        .iter()
        .all(|e| e.dst != ArgLocation::Reg(R12) && e.src != ArgLocation::Reg(R12)));
    asm.load(R12, RECEIVER, DELEGATE_METHOD_PTR_AUX);
    emit_moves(asm, entries);
    asm.jump_reg(R12);
    Ok(())
}

/// ```text
/// <moves>
/// movi hidden, dictionary          ; or through r9 into a stack slot
/// movi r11, target
/// jr   r11
/// ```
pub(super) fn emit_instantiating(
    asm: &mut Assembler,
    entries: &[ShuffleEntry],
    hidden: ArgLocation,
    dictionary: u64,
    target: Address,
) -> Result<(), EmitError> {
    emit_moves(asm, entries);
    match hidden {
        ArgLocation::Reg(reg) => {
            debug_assert!(!regs::CALLEE_SAVED.contains(&reg));
            asm.mov_imm(reg, dictionary);
        }
        ArgLocation::Stack(offset) => {
            asm.mov_imm(R9, dictionary);
            asm.store(R9, SP, offset);
        }
    }
    asm.tail_call(R11, target.as_u64());
    Ok(())
}
