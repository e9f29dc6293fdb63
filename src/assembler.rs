//! A small two-pass assembler over [`Inst`].
//!
//! Stubs are built with symbolic labels; [`Assembler::finish`] lays the code
//! out once to learn every offset (constant forms may need alignment padding)
//! and then encodes it with resolved branch displacements. Out-of-range
//! displacements surface as [`EmitError::UnsupportedEncoding`].
use crate::{
    arch::{AluOp, Cond, Inst, InstructionSet, Isa, Reg, UNIT_SIZE},
    error::EmitError,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Handle to a patchable 64-bit constant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImmediateSite(usize);

#[derive(Debug, Clone, Copy)]
enum Item {
    Inst(Inst),
    Branch { cond: Cond, target: Label },
    Cbz { rn: Reg, target: Label },
}

pub struct Assembler {
    isa: Isa,
    items: Vec<Item>,
    labels: Vec<Option<usize>>,
    sites: Vec<usize>,
}

/// Encoded code plus the offsets of its labels and immediate sites.
#[derive(Debug, Clone)]
pub struct AssembledCode {
    pub units: Vec<u32>,
    labels: Vec<u64>,
    sites: Vec<u64>,
}

impl AssembledCode {
    pub fn len_bytes(&self) -> u64 {
        self.units.len() as u64 * UNIT_SIZE
    }

    pub fn label_offset(&self, label: Label) -> u64 {
        self.labels[label.0]
    }

    pub fn site_offset(&self, site: ImmediateSite) -> u64 {
        self.sites[site.0]
    }
}

impl Assembler {
    pub fn new(isa: Isa) -> Self {
        Self {
            isa,
            items: Vec::new(),
            labels: Vec::new(),
            sites: Vec::new(),
        }
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> Result<(), EmitError> {
        let slot = &mut self.labels[label.0];
        if slot.is_some() {
            return Err(EmitError::LabelRebound(label.0));
        }
        *slot = Some(self.items.len());
        Ok(())
    }

    /// A fresh label bound at the current position.
    pub fn here(&mut self) -> Label {
        self.labels.push(Some(self.items.len()));
        Label(self.labels.len() - 1)
    }

    pub fn emit(&mut self, inst: Inst) {
        self.items.push(Item::Inst(inst));
    }

    pub fn mov_imm(&mut self, rd: Reg, imm: u64) {
        self.emit(Inst::MovImm { rd, imm });
    }

    /// Like [`Assembler::mov_imm`], remembering where the constant lands.
    pub fn mov_imm_site(&mut self, rd: Reg, imm: u64) -> ImmediateSite {
        self.sites.push(self.items.len());
        self.mov_imm(rd, imm);
        ImmediateSite(self.sites.len() - 1)
    }

    pub fn mov(&mut self, rd: Reg, rs: Reg) {
        self.emit(Inst::Mov { rd, rs });
    }

    pub fn load(&mut self, rd: Reg, base: Reg, offset: i32) {
        self.emit(Inst::Load { rd, base, offset });
    }

    pub fn store(&mut self, rs: Reg, base: Reg, offset: i32) {
        self.emit(Inst::Store { rs, base, offset });
    }

    pub fn load_byte(&mut self, rd: Reg, base: Reg, offset: i32) {
        self.emit(Inst::LoadByte { rd, base, offset });
    }

    pub fn store_byte(&mut self, rs: Reg, base: Reg, offset: i32) {
        self.emit(Inst::StoreByte { rs, base, offset });
    }

    pub fn alu(&mut self, op: AluOp, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(Inst::Alu { op, rd, rn, rm });
    }

    pub fn alu_imm(&mut self, op: AluOp, rd: Reg, rn: Reg, imm: u32) {
        self.emit(Inst::AluImm { op, rd, rn, imm });
    }

    pub fn cmp(&mut self, rn: Reg, rm: Reg) {
        self.emit(Inst::Cmp { rn, rm });
    }

    pub fn cmp_imm(&mut self, rn: Reg, imm: u32) {
        self.emit(Inst::CmpImm { rn, imm });
    }

    pub fn branch(&mut self, cond: Cond, target: Label) {
        self.items.push(Item::Branch { cond, target });
    }

    pub fn jump(&mut self, target: Label) {
        self.branch(Cond::Always, target);
    }

    pub fn cbz(&mut self, rn: Reg, target: Label) {
        self.items.push(Item::Cbz { rn, target });
    }

    pub fn jump_reg(&mut self, rn: Reg) {
        self.emit(Inst::JumpReg { rn });
    }

    /// Load `target` into `scratch` and jump there.
    pub fn tail_call(&mut self, scratch: Reg, target: u64) {
        self.mov_imm(scratch, target);
        self.jump_reg(scratch);
    }

    pub fn ret(&mut self) {
        self.emit(Inst::Ret);
    }

    pub fn brk(&mut self) {
        self.emit(Inst::Brk);
    }

    pub fn nop(&mut self) {
        self.emit(Inst::Nop);
    }

    fn placeholder(item: &Item) -> Inst {
        match *item {
            Item::Inst(inst) => inst,
            Item::Branch { cond, .. } => Inst::Branch { cond, offset: 0 },
            Item::Cbz { rn, .. } => Inst::Cbz { rn, offset: 0 },
        }
    }

    pub fn finish(self) -> Result<AssembledCode, EmitError> {
        // Layout.
        let mut offsets = Vec::with_capacity(self.items.len() + 1);
        let mut offset = 0u64;
        for item in &self.items {
            offsets.push(offset);
            offset += self.isa.size_at(&Self::placeholder(item), offset);
        }
        offsets.push(offset);

        let labels = self
            .labels
            .iter()
            .enumerate()
            .map(|(id, bound)| bound.map(|index| offsets[index]).ok_or(EmitError::UnboundLabel(id)))
            .collect::<Result<Vec<_>, _>>()?;

        // Encoding.
        let mut units = Vec::with_capacity((offset / UNIT_SIZE) as usize);
        for (item, &at) in self.items.iter().zip(&offsets) {
            let displacement = |target: Label| (labels[target.0] as i64 - at as i64) as i32;
            let inst = match *item {
                Item::Inst(inst) => inst,
                Item::Branch { cond, target } => Inst::Branch {
                    cond,
                    offset: displacement(target),
                },
                Item::Cbz { rn, target } => Inst::Cbz {
                    rn,
                    offset: displacement(target),
                },
            };
            self.isa.encode(&inst, at, &mut units)?;
        }
        debug_assert_eq!(units.len() as u64 * UNIT_SIZE, offset);

        let sites = self
            .sites
            .iter()
            .map(|&index| self.isa.immediate_site(offsets[index]))
            .collect();

        Ok(AssembledCode {
            units,
            labels,
            sites,
        })
    }
}
