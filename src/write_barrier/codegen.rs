//! Barrier variant bodies.
//!
//! Calling convention: `r0` destination slot, `r1` the reference being
//! stored (for by-ref barriers, the source slot). Returns with `ret`; the
//! by-ref barrier advances both `r0` and `r1` by one word. Only `r9..r11`
//! are clobbered.
use super::{
    BarrierKind, BarrierVariant, GcGlobal, HeapGrowth, Processors, CARD_MARKED, CARD_SHIFT,
    WRITE_WATCH_SHIFT,
};
use crate::{
    arch::{
        regs::{R0, R1, R10, R11, R9},
        AluOp, Cond, Reg,
    },
    assembler::{Assembler, ImmediateSite},
    error::EmitError,
    memory::WORD_SIZE,
};

const DST: Reg = R0;
const SRC: Reg = R1;

/// Immediate sites of one variant, indexed by [`GcGlobal`].
pub(super) type Sites = [Option<ImmediateSite>; GcGlobal::COUNT];

fn embed(asm: &mut Assembler, sites: &mut Sites, global: GcGlobal, rd: Reg) {
    // The placeholder is overwritten by the first refresh after the copy.
    sites[global.index()] = Some(asm.mov_imm_site(rd, 0));
}

pub(super) fn emit(asm: &mut Assembler, variant: BarrierVariant) -> Result<Sites, EmitError> {
    let mut sites: Sites = [None; GcGlobal::COUNT];
    let done = asm.new_label();

    let value = match variant.kind {
        BarrierKind::ByRef => {
            asm.load(R9, SRC, 0);
            asm.store(R9, DST, 0);
            R9
        }
        BarrierKind::Write | BarrierKind::Checked => {
            asm.store(SRC, DST, 0);
            SRC
        }
    };

    if variant.kind != BarrierKind::Write {
        embed(asm, &mut sites, GcGlobal::LowestAddress, R10);
        asm.cmp(DST, R10);
        asm.branch(Cond::Lo, done);
        embed(asm, &mut sites, GcGlobal::HighestAddress, R10);
        asm.cmp(DST, R10);
        asm.branch(Cond::Hs, done);
    }

    if variant.write_watch {
        let already_dirty = asm.new_label();
        embed(asm, &mut sites, GcGlobal::WriteWatchTable, R10);
        asm.alu_imm(AluOp::Shr, R11, DST, WRITE_WATCH_SHIFT);
        asm.alu(AluOp::Add, R10, R10, R11);
        asm.load_byte(R11, R10, 0);
        asm.cmp_imm(R11, 0);
        asm.branch(Cond::Ne, already_dirty);
        asm.mov_imm(R11, CARD_MARKED as u64);
        asm.store_byte(R11, R10, 0);
        asm.bind(already_dirty)?;
    }

    embed(asm, &mut sites, GcGlobal::EphemeralLow, R10);
    asm.cmp(value, R10);
    asm.branch(Cond::Lo, done);
    if variant.flavor.growth == HeapGrowth::PostGrow {
        embed(asm, &mut sites, GcGlobal::EphemeralHigh, R10);
        asm.cmp(value, R10);
        asm.branch(Cond::Hs, done);
    }

    embed(asm, &mut sites, GcGlobal::CardTable, R10);
    asm.alu_imm(AluOp::Shr, R11, DST, CARD_SHIFT);
    asm.alu(AluOp::Add, R10, R10, R11);
    if variant.flavor.processors == Processors::Multi {
        // Avoid dirtying the cache line when the card is already marked.
        asm.load_byte(R11, R10, 0);
        asm.cmp_imm(R11, CARD_MARKED as u32);
        asm.branch(Cond::Eq, done);
    }
    asm.mov_imm(R11, CARD_MARKED as u64);
    asm.store_byte(R11, R10, 0);

    asm.bind(done)?;
    if variant.kind == BarrierKind::ByRef {
        asm.alu_imm(AluOp::Add, DST, DST, WORD_SIZE as u32);
        asm.alu_imm(AluOp::Add, SRC, SRC, WORD_SIZE as u32);
    }
    asm.ret();
    Ok(sites)
}
