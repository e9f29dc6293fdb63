//! Instruction-set backends for runtime stub generation.
//!
//! Stubs are written against the portable [`Inst`] model and lowered by one of
//! two encodings:
//!
//! - [`Narrow`]: fixed 32-bit units, 64-bit constants built from four 16-bit
//!   move-with-keep units. Rewriting such a constant is four separate stores.
//! - [`Wide`]: 64-bit constants live in an aligned literal word right after
//!   the load unit, so rewriting one is a single atomic store.
//!
//! Both share the unit layout below; they differ in operand ranges and in how
//! immediates are materialised.
//!
//! ```text
//! 31      24 23  20 19  16 15  12 11                0
//! +---------+------+------+------+-------------------+
//! | opcode  |  ra  |  rb  |  rc  |        ...        |
//! +---------+------+------+------+-------------------+
//!                         |   imm16 (loads, alu-imm)  |
//! ```
use crate::{
    error::{EmitError, Fault},
    memory::{Address, AddressSpace},
};
use enum_dispatch::enum_dispatch;
use serde::Serialize;
use std::fmt;

mod narrow;
mod wide;

pub use narrow::Narrow;
pub use wide::Wide;

pub const UNIT_SIZE: u64 = 4;
pub const REGISTER_COUNT: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reg(u8);

impl Reg {
    pub const fn new(index: u8) -> Self {
        assert!((index as usize) < REGISTER_COUNT);
        Reg(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            regs::SP => write!(f, "sp"),
            regs::LR => write!(f, "lr"),
            regs::FP => write!(f, "fp"),
            Reg(n) => write!(f, "r{n}"),
        }
    }
}

/// The register convention every stub and barrier follows.
pub mod regs {
    use super::Reg;

    pub const R0: Reg = Reg(0);
    pub const R1: Reg = Reg(1);
    pub const R2: Reg = Reg(2);
    pub const R3: Reg = Reg(3);
    pub const R4: Reg = Reg(4);
    pub const R5: Reg = Reg(5);
    pub const R6: Reg = Reg(6);
    pub const R7: Reg = Reg(7);
    pub const R8: Reg = Reg(8);
    pub const R9: Reg = Reg(9);
    pub const R10: Reg = Reg(10);
    pub const R11: Reg = Reg(11);
    pub const R12: Reg = Reg(12);
    pub const SP: Reg = Reg(13);
    pub const LR: Reg = Reg(14);
    pub const FP: Reg = Reg(15);

    /// `this` for instance calls, the destination for write barriers.
    pub const RECEIVER: Reg = R0;
    pub const ARGS: [Reg; 3] = [R1, R2, R3];
    /// Indirection cell address, low bits carry resolver flags.
    pub const CELL: Reg = R4;
    pub const CALLEE_SAVED: [Reg; 4] = [R5, R6, R7, R8];
    /// Dispatch token handed to the resolver.
    pub const TOKEN: Reg = R12;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    /// Signed less-than.
    Lt,
    /// Signed greater-or-equal.
    Ge,
    /// Unsigned lower.
    Lo,
    /// Unsigned higher-or-same.
    Hs,
    Always,
}

impl Cond {
    fn encode(self) -> u32 {
        match self {
            Cond::Eq => 0,
            Cond::Ne => 1,
            Cond::Lt => 2,
            Cond::Ge => 3,
            Cond::Lo => 4,
            Cond::Hs => 5,
            Cond::Always => 6,
        }
    }

    fn decode(bits: u32) -> Option<Self> {
        Some(match bits {
            0 => Cond::Eq,
            1 => Cond::Ne,
            2 => Cond::Lt,
            3 => Cond::Ge,
            4 => Cond::Lo,
            5 => Cond::Hs,
            6 => Cond::Always,
            _ => return None,
        })
    }

    pub fn holds(self, lhs: u64, rhs: u64) -> bool {
        match self {
            Cond::Eq => lhs == rhs,
            Cond::Ne => lhs != rhs,
            Cond::Lt => (lhs as i64) < (rhs as i64),
            Cond::Ge => (lhs as i64) >= (rhs as i64),
            Cond::Lo => lhs < rhs,
            Cond::Hs => lhs >= rhs,
            Cond::Always => true,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl AluOp {
    fn encode(self) -> u32 {
        match self {
            AluOp::Add => 0,
            AluOp::Sub => 1,
            AluOp::And => 2,
            AluOp::Or => 3,
            AluOp::Xor => 4,
            AluOp::Shl => 5,
            AluOp::Shr => 6,
        }
    }

    fn decode(bits: u32) -> Option<Self> {
        Some(match bits {
            0 => AluOp::Add,
            1 => AluOp::Sub,
            2 => AluOp::And,
            3 => AluOp::Or,
            4 => AluOp::Xor,
            5 => AluOp::Shl,
            6 => AluOp::Shr,
            _ => return None,
        })
    }

    pub fn apply(self, lhs: u64, rhs: u64) -> u64 {
        match self {
            AluOp::Add => lhs.wrapping_add(rhs),
            AluOp::Sub => lhs.wrapping_sub(rhs),
            AluOp::And => lhs & rhs,
            AluOp::Or => lhs | rhs,
            AluOp::Xor => lhs ^ rhs,
            AluOp::Shl => lhs.wrapping_shl(rhs as u32),
            AluOp::Shr => lhs.wrapping_shr(rhs as u32),
        }
    }
}

/// Portable instruction model. Branch and load/store offsets are in bytes;
/// branch offsets are relative to the address of the branch itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Inst {
    MovImm { rd: Reg, imm: u64 },
    /// One 16-bit lane of a multi-unit constant; `keep` preserves the other lanes.
    MovLane { rd: Reg, lane: u8, bits: u16, keep: bool },
    Mov { rd: Reg, rs: Reg },
    Load { rd: Reg, base: Reg, offset: i32 },
    Store { rs: Reg, base: Reg, offset: i32 },
    LoadByte { rd: Reg, base: Reg, offset: i32 },
    StoreByte { rs: Reg, base: Reg, offset: i32 },
    Alu { op: AluOp, rd: Reg, rn: Reg, rm: Reg },
    AluImm { op: AluOp, rd: Reg, rn: Reg, imm: u32 },
    Cmp { rn: Reg, rm: Reg },
    CmpImm { rn: Reg, imm: u32 },
    Branch { cond: Cond, offset: i32 },
    /// Branch if `rn` is zero.
    Cbz { rn: Reg, offset: i32 },
    JumpReg { rn: Reg },
    Ret,
    Brk,
    Nop,
}

impl Inst {
    pub fn is_branch(&self) -> bool {
        matches!(self, Inst::Branch { .. } | Inst::Cbz { .. })
    }
}

/// An instruction read back from memory together with its encoded length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub inst: Inst,
    pub size: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IsaKind {
    Narrow,
    Wide,
}

#[enum_dispatch]
pub trait InstructionSet {
    fn name(&self) -> &'static str;

    /// Bytes `inst` occupies when it starts at `offset` from an 8-byte aligned base.
    fn size_at(&self, inst: &Inst, offset: u64) -> u64;

    /// Offset of the first unit of the embedded constant of a `MovImm` placed at `offset`.
    fn immediate_site(&self, offset: u64) -> u64;

    /// Append the encoding of `inst`, placed at `offset`, to `out`.
    fn encode(&self, inst: &Inst, offset: u64, out: &mut Vec<u32>) -> Result<(), EmitError>;

    /// Decode the instruction at `pc` from the executable view.
    fn decode(&self, memory: &AddressSpace, pc: Address) -> Result<Decoded, Fault>;

    /// Rewrite the constant of the `MovImm` whose immediate site is `site` (a writable address).
    fn patch_immediate(&self, memory: &AddressSpace, site: Address, value: u64) -> Result<(), Fault>;

    fn read_immediate(&self, memory: &AddressSpace, site: Address) -> Result<u64, Fault>;

    /// Whether [`InstructionSet::patch_immediate`] is a single atomic store.
    fn patch_is_atomic(&self) -> bool;

    fn breakpoint_unit(&self) -> u32 {
        encoding::pack(encoding::OP_BRK, 0, 0, 0, 0)
    }
}

#[enum_dispatch(InstructionSet)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Isa {
    Narrow,
    Wide,
}

impl Isa {
    pub fn kind(&self) -> IsaKind {
        match self {
            Isa::Narrow(_) => IsaKind::Narrow,
            Isa::Wide(_) => IsaKind::Wide,
        }
    }
}

impl From<IsaKind> for Isa {
    fn from(kind: IsaKind) -> Self {
        match kind {
            IsaKind::Narrow => Isa::Narrow(Narrow),
            IsaKind::Wide => Isa::Wide(Wide),
        }
    }
}

/// Bit-level helpers shared by both encodings.
pub(crate) mod encoding {
    use super::{AluOp, Cond, Inst, Reg};

    pub const OP_BRK: u8 = 0x01;
    pub const OP_NOP: u8 = 0x02;
    pub const OP_RET: u8 = 0x03;
    pub const OP_JR: u8 = 0x04;
    pub const OP_MOV: u8 = 0x05;
    pub const OP_LDR: u8 = 0x10;
    pub const OP_STR: u8 = 0x11;
    pub const OP_LDRB: u8 = 0x12;
    pub const OP_STRB: u8 = 0x13;
    pub const OP_ALU: u8 = 0x20;
    pub const OP_CMP: u8 = 0x21;
    pub const OP_CMPI: u8 = 0x22;
    /// `OP_ALUI + AluOp` covers 0x28..=0x2e.
    pub const OP_ALUI: u8 = 0x28;
    pub const OP_B: u8 = 0x30;
    pub const OP_CBZ: u8 = 0x31;
    pub const OP_MOVZ: u8 = 0x40;
    pub const OP_MOVK: u8 = 0x41;
    pub const OP_LDI: u8 = 0x48;

    pub fn pack(op: u8, ra: u8, rb: u8, rc: u8, low: u32) -> u32 {
        ((op as u32) << 24)
            | ((ra as u32 & 0xf) << 20)
            | ((rb as u32 & 0xf) << 16)
            | ((rc as u32 & 0xf) << 12)
            | low
    }

    pub fn opcode(unit: u32) -> u8 {
        (unit >> 24) as u8
    }

    pub fn ra(unit: u32) -> Reg {
        Reg(((unit >> 20) & 0xf) as u8)
    }

    pub fn rb(unit: u32) -> Reg {
        Reg(((unit >> 16) & 0xf) as u8)
    }

    pub fn rc(unit: u32) -> Reg {
        Reg(((unit >> 12) & 0xf) as u8)
    }

    pub fn sign_extend(value: u32, bits: u32) -> i32 {
        let shift = 32 - bits;
        ((value << shift) as i32) >> shift
    }

    pub fn fits_signed(value: i64, bits: u32) -> bool {
        let limit = 1i64 << (bits - 1);
        (-limit..limit).contains(&value)
    }

    pub fn branch(cond: Cond, units: i32) -> u32 {
        pack(OP_B, cond.encode() as u8, 0, 0, (units as u32) & 0xf_ffff)
    }

    pub fn alu(op: AluOp, rd: Reg, rn: Reg, rm: Reg) -> u32 {
        pack(OP_ALU, rd.0, rn.0, rm.0, op.encode())
    }

    pub fn alu_imm(op: AluOp, rd: Reg, rn: Reg, imm: u32) -> u32 {
        pack(OP_ALUI + op.encode() as u8, rd.0, rn.0, 0, imm & 0xffff)
    }

    /// Decode the forms whose layout both encodings share. Memory offsets,
    /// branch displacements and immediates are handled by the caller.
    pub fn decode_simple(unit: u32) -> Option<Inst> {
        Some(match opcode(unit) {
            OP_BRK => Inst::Brk,
            OP_NOP => Inst::Nop,
            OP_RET => Inst::Ret,
            OP_JR => Inst::JumpReg { rn: ra(unit) },
            OP_MOV => Inst::Mov {
                rd: ra(unit),
                rs: rb(unit),
            },
            OP_ALU => Inst::Alu {
                op: AluOp::decode(unit & 0x7)?,
                rd: ra(unit),
                rn: rb(unit),
                rm: rc(unit),
            },
            OP_CMP => Inst::Cmp {
                rn: ra(unit),
                rm: rb(unit),
            },
            OP_CMPI => Inst::CmpImm {
                rn: ra(unit),
                imm: unit & 0xffff,
            },
            op if (OP_ALUI..OP_ALUI + 7).contains(&op) => Inst::AluImm {
                op: AluOp::decode((op - OP_ALUI) as u32)?,
                rd: ra(unit),
                rn: rb(unit),
                imm: unit & 0xffff,
            },
            OP_B => Inst::Branch {
                cond: Cond::decode((unit >> 20) & 0xf)?,
                offset: sign_extend(unit & 0xf_ffff, 20) * super::UNIT_SIZE as i32,
            },
            _ => return None,
        })
    }
}
