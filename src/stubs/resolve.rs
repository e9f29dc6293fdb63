use super::{counters, flags, ResolveStubParams};
use crate::{
    arch::{
        regs::{CELL, R10, R11, R12, R9, RECEIVER, TOKEN},
        AluOp, Cond,
    },
    assembler::{Assembler, Label},
    error::EmitError,
    resolve_cache::{element, TYPE_HASH_SHIFT},
};

pub(super) struct Entries {
    pub resolve: Label,
    pub slow: Label,
    pub fail: Label,
}

/// Register use: `r9` receiver type, `r10` chain cursor, `r11` token or
/// counter block, `r12` scratch.
///
/// ```text
/// resolve:   ldr  r9, [r0]                       ; faults on null
///            r10 = ((r9 + (r9 >> 12)) ^ hashed) & mask
///            ldr  r10, [buckets + r10]
///            movi r11, token
/// loop:      cbz  r10, slow
///            compare [r10+0] with r9 and [r10+8] with r11, else next
///            b    hit
/// next:      ldr  r10, [r10, #24]
///            b    loop
/// slow:      movi r12, token
///            movi r11, resolver
///            jr   r11
/// hit:       track the same-type streak in the counter block;
///            on exhaustion: orr r4, #DOWNGRADE; b slow
///            ldr  r11, [r10, #16]
///            jr   r11
/// fail:      decrement the miss counter;
///            still >= 0: b resolve
///            orr  r4, #BACKPATCH; b slow
/// ```
pub(super) fn emit(asm: &mut Assembler, p: &ResolveStubParams) -> Result<Entries, EmitError> {
    let resolve = asm.here();
    let chain = asm.new_label();
    let next = asm.new_label();
    let slow = asm.new_label();
    let hit = asm.new_label();
    let new_streak = asm.new_label();
    let dispatch = asm.new_label();
    let downgrade = asm.new_label();
    let fail = asm.new_label();

    asm.load(R9, RECEIVER, 0);
    asm.alu_imm(AluOp::Shr, R10, R9, TYPE_HASH_SHIFT);
    asm.alu(AluOp::Add, R10, R10, R9);
    asm.mov_imm(R11, p.hashed_token);
    asm.alu(AluOp::Xor, R10, R10, R11);
    asm.mov_imm(R11, p.cache_mask);
    asm.alu(AluOp::And, R10, R10, R11);
    asm.mov_imm(R11, p.buckets.as_u64());
    asm.alu(AluOp::Add, R10, R10, R11);
    asm.load(R10, R10, 0);
    asm.mov_imm(R11, p.token.0);

    asm.bind(chain)?;
    asm.cbz(R10, slow);
    asm.load(R12, R10, element::TYPE);
    asm.cmp(R12, R9);
    asm.branch(Cond::Ne, next);
    asm.load(R12, R10, element::TOKEN);
    asm.cmp(R12, R11);
    asm.branch(Cond::Ne, next);
    asm.jump(hit);
    asm.bind(next)?;
    asm.load(R10, R10, element::NEXT);
    asm.jump(chain);

    asm.bind(slow)?;
    asm.mov_imm(TOKEN, p.token.0);
    asm.tail_call(R11, p.resolver.as_u64());

    asm.bind(hit)?;
    asm.mov_imm(R11, p.counters.as_u64());
    asm.load(R12, R11, counters::STREAK_TYPE);
    asm.cmp(R12, R9);
    asm.branch(Cond::Ne, new_streak);
    asm.load(R12, R11, counters::STREAK_REMAINING);
    asm.alu_imm(AluOp::Sub, R12, R12, 1);
    asm.store(R12, R11, counters::STREAK_REMAINING);
    asm.cmp_imm(R12, 0);
    asm.branch(Cond::Lt, downgrade);
    asm.jump(dispatch);
    asm.bind(new_streak)?;
    asm.store(R9, R11, counters::STREAK_TYPE);
    asm.mov_imm(R12, p.downgrade_streak as u64);
    asm.store(R12, R11, counters::STREAK_REMAINING);
    asm.bind(dispatch)?;
    asm.load(R11, R10, element::TARGET);
    asm.jump_reg(R11);

    asm.bind(downgrade)?;
    asm.alu_imm(AluOp::Or, CELL, CELL, flags::DOWNGRADE as u32);
    asm.jump(slow);

    asm.bind(fail)?;
    asm.mov_imm(R11, p.counters.as_u64());
    asm.load(R12, R11, counters::MISSES);
    asm.alu_imm(AluOp::Sub, R12, R12, 1);
    asm.store(R12, R11, counters::MISSES);
    asm.cmp_imm(R12, 0);
    asm.branch(Cond::Ge, resolve);
    // Underflow skips the cache walk: the resolver promotes the cell even
    // when the pair is already cached.
    asm.alu_imm(AluOp::Or, CELL, CELL, flags::BACKPATCH as u32);
    asm.jump(slow);

    Ok(Entries {
        resolve,
        slow,
        fail,
    })
}
