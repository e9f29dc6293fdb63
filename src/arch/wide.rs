use super::{encoding::*, Decoded, Inst, InstructionSet, UNIT_SIZE};
use crate::{
    error::{EmitError, Fault},
    memory::{Address, AddressSpace, WORD_SIZE},
};

const ISA: &str = "wide";
const OFFSET_BITS: u32 = 16;
const BRANCH_BITS: u32 = 20;
const CBZ_BITS: u32 = 16;
const MAX_IMM: u32 = 0xffff;
/// `ldi` unit followed by its literal word.
const LITERAL_FORM: u64 = UNIT_SIZE + WORD_SIZE;

/// Encoding with an inline 64-bit literal pool.
///
/// `ldi rd` is immediately followed by an 8-byte aligned literal word; a `nop`
/// is inserted in front when needed to get the alignment right. Rewriting the
/// literal is one aligned word store, so concurrent readers see either the old
/// or the new value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Wide;

fn unsupported(what: &'static str, value: i64) -> EmitError {
    EmitError::UnsupportedEncoding {
        what,
        value,
        isa: ISA,
    }
}

fn needs_padding(offset: u64) -> bool {
    (offset + UNIT_SIZE) % WORD_SIZE != 0
}

fn memory_offset(what: &'static str, offset: i32) -> Result<u32, EmitError> {
    if !fits_signed(offset as i64, OFFSET_BITS) {
        return Err(unsupported(what, offset as i64));
    }
    Ok(offset as u32 & 0xffff)
}

fn displacement_units(offset: i32, bits: u32) -> Result<i32, EmitError> {
    let units = offset / UNIT_SIZE as i32;
    if offset % UNIT_SIZE as i32 != 0 || !fits_signed(units as i64, bits) {
        return Err(unsupported("branch displacement", offset as i64));
    }
    Ok(units)
}

impl InstructionSet for Wide {
    fn name(&self) -> &'static str {
        ISA
    }

    fn size_at(&self, inst: &Inst, offset: u64) -> u64 {
        match inst {
            Inst::MovImm { .. } if needs_padding(offset) => UNIT_SIZE + LITERAL_FORM,
            Inst::MovImm { .. } => LITERAL_FORM,
            _ => UNIT_SIZE,
        }
    }

    fn immediate_site(&self, offset: u64) -> u64 {
        if needs_padding(offset) {
            offset + UNIT_SIZE
        } else {
            offset
        }
    }

    fn encode(&self, inst: &Inst, offset: u64, out: &mut Vec<u32>) -> Result<(), EmitError> {
        let unit = match *inst {
            Inst::MovImm { rd, imm } => {
                if needs_padding(offset) {
                    out.push(pack(OP_NOP, 0, 0, 0, 0));
                }
                out.push(pack(OP_LDI, rd.0, 0, 0, 0));
                out.push(imm as u32);
                out.push((imm >> 32) as u32);
                return Ok(());
            }
            Inst::MovLane {
                rd,
                lane,
                bits,
                keep,
            } => {
                if lane > 3 {
                    return Err(unsupported("move lane", lane as i64));
                }
                pack(if keep { OP_MOVK } else { OP_MOVZ }, rd.0, lane, 0, bits as u32)
            }
            Inst::Mov { rd, rs } => pack(OP_MOV, rd.0, rs.0, 0, 0),
            Inst::Load { rd, base, offset } => {
                pack(OP_LDR, rd.0, base.0, 0, memory_offset("word offset", offset)?)
            }
            Inst::Store { rs, base, offset } => {
                pack(OP_STR, rs.0, base.0, 0, memory_offset("word offset", offset)?)
            }
            Inst::LoadByte { rd, base, offset } => {
                pack(OP_LDRB, rd.0, base.0, 0, memory_offset("byte offset", offset)?)
            }
            Inst::StoreByte { rs, base, offset } => {
                pack(OP_STRB, rs.0, base.0, 0, memory_offset("byte offset", offset)?)
            }
            Inst::Alu { op, rd, rn, rm } => alu(op, rd, rn, rm),
            Inst::AluImm { op, rd, rn, imm } => {
                if imm > MAX_IMM {
                    return Err(unsupported("alu immediate", imm as i64));
                }
                alu_imm(op, rd, rn, imm)
            }
            Inst::Cmp { rn, rm } => pack(OP_CMP, rn.0, rm.0, 0, 0),
            Inst::CmpImm { rn, imm } => {
                if imm > MAX_IMM {
                    return Err(unsupported("compare immediate", imm as i64));
                }
                pack(OP_CMPI, rn.0, 0, 0, imm)
            }
            Inst::Branch { cond, offset } => branch(cond, displacement_units(offset, BRANCH_BITS)?),
            Inst::Cbz { rn, offset } => {
                let units = displacement_units(offset, CBZ_BITS)?;
                pack(OP_CBZ, rn.0, 0, 0, units as u32 & 0xffff)
            }
            Inst::JumpReg { rn } => pack(OP_JR, rn.0, 0, 0, 0),
            Inst::Ret => pack(OP_RET, 0, 0, 0, 0),
            Inst::Brk => self.breakpoint_unit(),
            Inst::Nop => pack(OP_NOP, 0, 0, 0, 0),
        };
        out.push(unit);
        Ok(())
    }

    fn decode(&self, memory: &AddressSpace, pc: Address) -> Result<Decoded, Fault> {
        let unit = memory.fetch_unit(pc)?;
        let offset16 = || sign_extend(unit & 0xffff, 16);
        let inst = match opcode(unit) {
            OP_LDI => {
                let imm = memory.fetch_literal(pc + UNIT_SIZE)?;
                return Ok(Decoded {
                    inst: Inst::MovImm { rd: ra(unit), imm },
                    size: LITERAL_FORM,
                });
            }
            OP_MOVZ | OP_MOVK => Inst::MovLane {
                rd: ra(unit),
                lane: rb(unit).0 & 0x3,
                bits: unit as u16,
                keep: opcode(unit) == OP_MOVK,
            },
            OP_LDR => Inst::Load {
                rd: ra(unit),
                base: rb(unit),
                offset: offset16(),
            },
            OP_STR => Inst::Store {
                rs: ra(unit),
                base: rb(unit),
                offset: offset16(),
            },
            OP_LDRB => Inst::LoadByte {
                rd: ra(unit),
                base: rb(unit),
                offset: offset16(),
            },
            OP_STRB => Inst::StoreByte {
                rs: ra(unit),
                base: rb(unit),
                offset: offset16(),
            },
            OP_CBZ => Inst::Cbz {
                rn: ra(unit),
                offset: offset16() * UNIT_SIZE as i32,
            },
            _ => decode_simple(unit).ok_or(Fault::IllegalInstruction { address: pc, unit })?,
        };
        Ok(Decoded {
            inst,
            size: UNIT_SIZE,
        })
    }

    fn patch_immediate(&self, memory: &AddressSpace, site: Address, value: u64) -> Result<(), Fault> {
        memory.store_word(site + UNIT_SIZE, value)
    }

    fn read_immediate(&self, memory: &AddressSpace, site: Address) -> Result<u64, Fault> {
        memory.load_word(site + UNIT_SIZE)
    }

    fn patch_is_atomic(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::regs::*;

    #[test]
    fn test_literal_alignment_padding() {
        let mov = Inst::MovImm { rd: R9, imm: 7 };
        assert_eq!(Wide.size_at(&mov, 4), 12);
        assert_eq!(Wide.size_at(&mov, 0), 16);
        assert_eq!(Wide.immediate_site(0), 4);
        assert_eq!(Wide.immediate_site(12), 12);

        let mut out = Vec::new();
        Wide.encode(&mov, 0, &mut out).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(opcode(out[0]), OP_NOP);
        assert_eq!(opcode(out[1]), OP_LDI);
        assert_eq!(out[2], 7);
    }

    #[test]
    fn test_negative_offsets_encode() {
        let mut out = Vec::new();
        Wide.encode(
            &Inst::Load {
                rd: R9,
                base: FP,
                offset: -16,
            },
            0,
            &mut out,
        )
        .unwrap();
        assert_eq!(sign_extend(out[0] & 0xffff, 16), -16);
    }

    #[test]
    fn test_large_offset_rejected() {
        let mut out = Vec::new();
        assert!(Wide
            .encode(
                &Inst::Store {
                    rs: R9,
                    base: R0,
                    offset: 40_000,
                },
                0,
                &mut out,
            )
            .is_err());
    }
}
