use crate::{
    arch::regs::{R11, TOKEN},
    assembler::Assembler,
    memory::Address,
    types::DispatchToken,
};

/// ```text
/// movi r12, token
/// movi r11, resolver
/// jr   r11
/// ```
pub(super) fn emit(asm: &mut Assembler, token: DispatchToken, resolver: Address) {
    asm.mov_imm(TOKEN, token.0);
    asm.tail_call(R11, resolver.as_u64());
}
