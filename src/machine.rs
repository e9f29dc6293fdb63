//! Executor for generated code.
//!
//! Runs stubs and barriers straight out of the executable view of the code
//! heap. Execution stops when control leaves generated code: a jump into the
//! native-entry range (a method body or the resolver), a `ret`, or a
//! breakpoint unit.
//!
//! Every instruction performs at most one memory access and commits its
//! register and pc updates only after that access succeeded, so a faulting
//! instruction leaves the [`Context`] exactly as it found it.
use crate::{
    arch::{regs, Decoded, Inst, InstructionSet, Isa, Reg, REGISTER_COUNT},
    error::{Fault, Trap},
    memory::{Address, AddressSpace},
};
use tracing::trace;

/// Operands of the last compare; branches evaluate their condition lazily.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub lhs: u64,
    pub rhs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub regs: [u64; REGISTER_COUNT],
    pub pc: Address,
    pub flags: Flags,
}

impl Context {
    pub fn new(pc: Address) -> Self {
        Self {
            regs: [0; REGISTER_COUNT],
            pc,
            flags: Flags::default(),
        }
    }

    pub fn reg(&self, reg: Reg) -> u64 {
        self.regs[reg.index()]
    }

    pub fn set_reg(&mut self, reg: Reg, value: u64) {
        self.regs[reg.index()] = value;
    }

    pub fn sp(&self) -> Address {
        Address(self.reg(regs::SP))
    }

    pub fn lr(&self) -> Address {
        Address(self.reg(regs::LR))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Control reached a native entry point; `pc` holds it.
    Native(Address),
    /// `ret` executed; `pc` holds the link register.
    Return,
    /// A breakpoint unit at this address.
    Breakpoint(Address),
}

fn effective_address(ctx: &Context, base: Reg, offset: i32) -> Address {
    Address(ctx.reg(base)).offset(offset as i64)
}

pub struct Machine<'a> {
    memory: &'a AddressSpace,
    isa: Isa,
    step_limit: u64,
}

impl<'a> Machine<'a> {
    pub fn new(memory: &'a AddressSpace, isa: Isa, step_limit: u64) -> Self {
        Self {
            memory,
            isa,
            step_limit,
        }
    }

    /// Start executing at `entry`.
    pub fn call(&self, ctx: &mut Context, entry: Address) -> Result<Exit, Trap> {
        ctx.pc = entry;
        self.run(ctx)
    }

    pub fn run(&self, ctx: &mut Context) -> Result<Exit, Trap> {
        let mut steps = 0u64;
        loop {
            if self.memory.is_native_entry(ctx.pc) {
                return Ok(Exit::Native(ctx.pc));
            }
            if steps == self.step_limit {
                return Err(Trap {
                    pc: ctx.pc,
                    fault: Fault::StepLimit {
                        address: ctx.pc,
                        limit: self.step_limit,
                    },
                });
            }
            steps += 1;

            let pc = ctx.pc;
            let trap = |fault| Trap { pc, fault };
            let decoded = self.isa.decode(self.memory, pc).map_err(trap)?;
            if let Some(exit) = self.step(ctx, decoded).map_err(trap)? {
                trace!(%pc, ?exit, steps, "left generated code");
                return Ok(exit);
            }
        }
    }

    fn step(&self, ctx: &mut Context, decoded: Decoded) -> Result<Option<Exit>, Fault> {
        let Decoded { inst, size } = decoded;
        let mut next = ctx.pc + size;

        match inst {
            Inst::MovImm { rd, imm } => ctx.set_reg(rd, imm),
            Inst::MovLane {
                rd,
                lane,
                bits,
                keep,
            } => {
                let shift = 16 * lane as u32;
                let kept = if keep {
                    ctx.reg(rd) & !(0xffff << shift)
                } else {
                    0
                };
                ctx.set_reg(rd, kept | ((bits as u64) << shift));
            }
            Inst::Mov { rd, rs } => ctx.set_reg(rd, ctx.reg(rs)),
            Inst::Load { rd, base, offset } => {
                let value = self.memory.load_word(effective_address(ctx, base, offset))?;
                ctx.set_reg(rd, value);
            }
            Inst::Store { rs, base, offset } => {
                self.memory.store_word(effective_address(ctx, base, offset), ctx.reg(rs))?;
            }
            Inst::LoadByte { rd, base, offset } => {
                let value = self.memory.load_u8(effective_address(ctx, base, offset))?;
                ctx.set_reg(rd, value as u64);
            }
            Inst::StoreByte { rs, base, offset } => {
                self.memory.store_u8(effective_address(ctx, base, offset), ctx.reg(rs) as u8)?;
            }
            Inst::Alu { op, rd, rn, rm } => ctx.set_reg(rd, op.apply(ctx.reg(rn), ctx.reg(rm))),
            Inst::AluImm { op, rd, rn, imm } => ctx.set_reg(rd, op.apply(ctx.reg(rn), imm as u64)),
            Inst::Cmp { rn, rm } => {
                ctx.flags = Flags {
                    lhs: ctx.reg(rn),
                    rhs: ctx.reg(rm),
                }
            }
            Inst::CmpImm { rn, imm } => {
                ctx.flags = Flags {
                    lhs: ctx.reg(rn),
                    rhs: imm as u64,
                }
            }
            Inst::Branch { cond, offset } => {
                if cond.holds(ctx.flags.lhs, ctx.flags.rhs) {
                    next = ctx.pc.offset(offset as i64);
                }
            }
            Inst::Cbz { rn, offset } => {
                if ctx.reg(rn) == 0 {
                    next = ctx.pc.offset(offset as i64);
                }
            }
            Inst::JumpReg { rn } => {
                let target = Address(ctx.reg(rn));
                ctx.pc = target;
                if self.memory.is_native_entry(target) {
                    return Ok(Some(Exit::Native(target)));
                }
                return Ok(None);
            }
            Inst::Ret => {
                ctx.pc = ctx.lr();
                return Ok(Some(Exit::Return));
            }
            Inst::Brk => return Ok(Some(Exit::Breakpoint(ctx.pc))),
            Inst::Nop => {}
        }

        ctx.pc = next;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::{regs::*, AluOp, Cond, IsaKind},
        assembler::Assembler,
        code_heap::{CodeHeap, CodeKind},
        memory::{MemoryLayout, NATIVE_BASE},
        metrics::StubMetrics,
        sync::Arc,
    };

    fn setup(kind: IsaKind) -> (Arc<AddressSpace>, CodeHeap, Isa) {
        let memory = AddressSpace::new(MemoryLayout {
            data_bytes: 8192,
            code_bytes: 8192,
            write_xor_execute: true,
        });
        let heap = CodeHeap::new(memory.clone(), Arc::new(StubMetrics::new()));
        (memory, heap, Isa::from(kind))
    }

    #[test]
    fn test_loop_and_native_exit() {
        for kind in [IsaKind::Narrow, IsaKind::Wide] {
            let (memory, heap, isa) = setup(kind);
            let mut asm = Assembler::new(isa);
            asm.mov_imm(R9, 5);
            asm.mov_imm(R10, 0);
            let top = asm.here();
            let done = asm.new_label();
            asm.cbz(R9, done);
            asm.alu_imm(AluOp::Add, R10, R10, 3);
            asm.alu_imm(AluOp::Sub, R9, R9, 1);
            asm.jump(top);
            asm.bind(done).unwrap();
            asm.tail_call(R11, NATIVE_BASE + 0x40);
            let stub = heap.install(&asm.finish().unwrap(), CodeKind::Stub).unwrap();

            let machine = Machine::new(&memory, isa, 1000);
            let mut ctx = Context::new(Address::NULL);
            let exit = machine.call(&mut ctx, stub.rx).unwrap();
            assert_eq!(exit, Exit::Native(Address(NATIVE_BASE + 0x40)));
            assert_eq!(ctx.reg(R10), 15);
        }
    }

    #[test]
    fn test_fault_preserves_context() {
        let (memory, heap, isa) = setup(IsaKind::Narrow);
        let mut asm = Assembler::new(isa);
        asm.load(R9, R0, 0);
        asm.ret();
        let stub = heap.install(&asm.finish().unwrap(), CodeKind::Stub).unwrap();

        let machine = Machine::new(&memory, isa, 100);
        let mut ctx = Context::new(stub.rx);
        ctx.set_reg(R1, 11);
        ctx.set_reg(SP, 0x1000_0800);
        ctx.set_reg(LR, 0x1234);
        let before = ctx.clone();

        let trap = machine.run(&mut ctx).unwrap_err();
        assert_eq!(trap.pc, stub.rx);
        assert_eq!(
            trap.fault,
            Fault::NullReference {
                address: Address::NULL
            }
        );
        assert_eq!(ctx, before);
    }

    #[test]
    fn test_step_limit() {
        let (memory, heap, isa) = setup(IsaKind::Wide);
        let mut asm = Assembler::new(isa);
        let top = asm.here();
        asm.jump(top);
        let stub = heap.install(&asm.finish().unwrap(), CodeKind::Stub).unwrap();

        let machine = Machine::new(&memory, isa, 50);
        let mut ctx = Context::new(stub.rx);
        let trap = machine.run(&mut ctx).unwrap_err();
        assert!(matches!(trap.fault, Fault::StepLimit { limit: 50, .. }));
    }

    #[test]
    fn test_compare_and_breakpoint() {
        let (memory, heap, isa) = setup(IsaKind::Narrow);
        let mut asm = Assembler::new(isa);
        let equal = asm.new_label();
        asm.cmp(R0, R1);
        asm.branch(Cond::Eq, equal);
        asm.ret();
        asm.bind(equal).unwrap();
        asm.brk();
        let code = asm.finish().unwrap();
        let brk_offset = code.label_offset(equal);
        let stub = heap.install(&code, CodeKind::Stub).unwrap();

        let machine = Machine::new(&memory, isa, 100);
        let mut ctx = Context::new(stub.rx);
        ctx.set_reg(R0, 3);
        ctx.set_reg(R1, 3);
        assert_eq!(
            machine.run(&mut ctx).unwrap(),
            Exit::Breakpoint(stub.rx + brk_offset)
        );

        let mut ctx = Context::new(stub.rx);
        ctx.set_reg(R1, 1);
        ctx.set_reg(LR, 0x7f00_0100);
        assert_eq!(machine.run(&mut ctx).unwrap(), Exit::Return);
        assert_eq!(ctx.pc, Address(0x7f00_0100));
    }
}
