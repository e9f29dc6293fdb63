use super::{encoding::*, Decoded, Inst, InstructionSet, Reg, UNIT_SIZE};
use crate::{
    error::{EmitError, Fault},
    memory::{Address, AddressSpace},
};

const ISA: &str = "narrow";
const LANES: u64 = 4;
const MAX_WORD_OFFSET: i32 = 0xff * 8;
const MAX_BYTE_OFFSET: i32 = 0xff;
const MAX_ALU_IMM: u32 = 0xfff;
const BRANCH_BITS: u32 = 11;
const MAX_CBZ_UNITS: i32 = 0x3f;

/// Fixed-width 32-bit encoding with short displacements.
///
/// A 64-bit constant takes four units (`movz` for the low lane, then three
/// `movk`), so a thread running through it while it is rewritten may observe
/// a mix of old and new lanes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Narrow;

fn unsupported(what: &'static str, value: i64) -> EmitError {
    EmitError::UnsupportedEncoding {
        what,
        value,
        isa: ISA,
    }
}

fn lane_unit(rd: Reg, lane: u8, bits: u16, keep: bool) -> u32 {
    let op = if keep { OP_MOVK } else { OP_MOVZ };
    pack(op, rd.0, lane, 0, bits as u32)
}

fn word_offset(offset: i32) -> Result<u32, EmitError> {
    if !(0..=MAX_WORD_OFFSET).contains(&offset) || offset % 8 != 0 {
        return Err(unsupported("word offset", offset as i64));
    }
    Ok((offset / 8) as u32)
}

fn byte_offset(offset: i32) -> Result<u32, EmitError> {
    if !(0..=MAX_BYTE_OFFSET).contains(&offset) {
        return Err(unsupported("byte offset", offset as i64));
    }
    Ok(offset as u32)
}

fn branch_units(offset: i32) -> Result<i32, EmitError> {
    if offset % UNIT_SIZE as i32 != 0 {
        return Err(unsupported("branch displacement", offset as i64));
    }
    Ok(offset / UNIT_SIZE as i32)
}

impl InstructionSet for Narrow {
    fn name(&self) -> &'static str {
        ISA
    }

    fn size_at(&self, inst: &Inst, _offset: u64) -> u64 {
        match inst {
            Inst::MovImm { .. } => LANES * UNIT_SIZE,
            _ => UNIT_SIZE,
        }
    }

    fn immediate_site(&self, offset: u64) -> u64 {
        offset
    }

    fn encode(&self, inst: &Inst, _offset: u64, out: &mut Vec<u32>) -> Result<(), EmitError> {
        let unit = match *inst {
            Inst::MovImm { rd, imm } => {
                for lane in 0..LANES as u8 {
                    let bits = (imm >> (16 * lane as u32)) as u16;
                    out.push(lane_unit(rd, lane, bits, lane != 0));
                }
                return Ok(());
            }
            Inst::MovLane {
                rd,
                lane,
                bits,
                keep,
            } => {
                if lane as u64 >= LANES {
                    return Err(unsupported("move lane", lane as i64));
                }
                lane_unit(rd, lane, bits, keep)
            }
            Inst::Mov { rd, rs } => pack(OP_MOV, rd.0, rs.0, 0, 0),
            Inst::Load { rd, base, offset } => pack(OP_LDR, rd.0, base.0, 0, word_offset(offset)?),
            Inst::Store { rs, base, offset } => pack(OP_STR, rs.0, base.0, 0, word_offset(offset)?),
            Inst::LoadByte { rd, base, offset } => {
                pack(OP_LDRB, rd.0, base.0, 0, byte_offset(offset)?)
            }
            Inst::StoreByte { rs, base, offset } => {
                pack(OP_STRB, rs.0, base.0, 0, byte_offset(offset)?)
            }
            Inst::Alu { op, rd, rn, rm } => alu(op, rd, rn, rm),
            Inst::AluImm { op, rd, rn, imm } => {
                if imm > MAX_ALU_IMM {
                    return Err(unsupported("alu immediate", imm as i64));
                }
                alu_imm(op, rd, rn, imm)
            }
            Inst::Cmp { rn, rm } => pack(OP_CMP, rn.0, rm.0, 0, 0),
            Inst::CmpImm { rn, imm } => {
                if imm > MAX_ALU_IMM {
                    return Err(unsupported("compare immediate", imm as i64));
                }
                pack(OP_CMPI, rn.0, 0, 0, imm)
            }
            Inst::Branch { cond, offset } => {
                let units = branch_units(offset)?;
                if !fits_signed(units as i64, BRANCH_BITS) {
                    return Err(unsupported("branch displacement", offset as i64));
                }
                branch(cond, units)
            }
            Inst::Cbz { rn, offset } => {
                let units = branch_units(offset)?;
                // Forward only.
                if !(0..=MAX_CBZ_UNITS).contains(&units) {
                    return Err(unsupported("cbz displacement", offset as i64));
                }
                pack(OP_CBZ, rn.0, 0, 0, units as u32)
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
        let inst = match opcode(unit) {
            OP_MOVZ | OP_MOVK => Inst::MovLane {
                rd: ra(unit),
                lane: (rb(unit).0 & 0x3),
                bits: unit as u16,
                keep: opcode(unit) == OP_MOVK,
            },
            OP_LDR => Inst::Load {
                rd: ra(unit),
                base: rb(unit),
                offset: (unit & 0xff) as i32 * 8,
            },
            OP_STR => Inst::Store {
                rs: ra(unit),
                base: rb(unit),
                offset: (unit & 0xff) as i32 * 8,
            },
            OP_LDRB => Inst::LoadByte {
                rd: ra(unit),
                base: rb(unit),
                offset: (unit & 0xff) as i32,
            },
            OP_STRB => Inst::StoreByte {
                rs: ra(unit),
                base: rb(unit),
                offset: (unit & 0xff) as i32,
            },
            OP_CBZ => Inst::Cbz {
                rn: ra(unit),
                offset: (unit & 0x3f) as i32 * UNIT_SIZE as i32,
            },
            _ => decode_simple(unit).ok_or(Fault::IllegalInstruction { address: pc, unit })?,
        };
        Ok(Decoded {
            inst,
            size: UNIT_SIZE,
        })
    }

    fn patch_immediate(&self, memory: &AddressSpace, site: Address, value: u64) -> Result<(), Fault> {
        for lane in 0..LANES {
            let address = site + lane * UNIT_SIZE;
            let unit = memory.load_u32(address)?;
            let bits = (value >> (16 * lane)) as u16;
            memory.store_u32(address, lane_unit(ra(unit), lane as u8, bits, lane != 0))?;
        }
        Ok(())
    }

    fn read_immediate(&self, memory: &AddressSpace, site: Address) -> Result<u64, Fault> {
        let mut value = 0u64;
        for lane in 0..LANES {
            let unit = memory.load_u32(site + lane * UNIT_SIZE)?;
            value |= ((unit & 0xffff) as u64) << (16 * lane);
        }
        Ok(value)
    }

    fn patch_is_atomic(&self) -> bool {
        false
    }
}
