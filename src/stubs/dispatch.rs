use crate::{
    arch::{
        regs::{R10, R11, R9, RECEIVER},
        Cond,
    },
    assembler::Assembler,
    error::EmitError,
    memory::Address,
};

/// ```text
///       ldr  r9, [r0]          ; receiver type, faults on null
///       movi r10, expected
///       cmp  r9, r10
///       b.ne fail
///       movi r11, target
///       jr   r11
/// fail: movi r11, fail_target
///       jr   r11
/// ```
pub(super) fn emit(
    asm: &mut Assembler,
    expected_type: Address,
    target: Address,
    fail_target: Address,
) -> Result<(), EmitError> {
    let fail = asm.new_label();

    asm.load(R9, RECEIVER, 0);
    asm.mov_imm(R10, expected_type.as_u64());
    asm.cmp(R9, R10);
    asm.branch(Cond::Ne, fail);
    asm.tail_call(R11, target.as_u64());

    asm.bind(fail)?;
    asm.tail_call(R11, fail_target.as_u64());
    Ok(())
}
