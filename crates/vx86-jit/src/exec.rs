//! Reference backend: runs a [`TranslatedBlock`] against a [`CpuState`].
//!
//! ESP and EIP live in host registers for the whole block. They are written back before every
//! helper call and every access to a field they alias, reloaded afterwards, and written back once
//! more when the block exits.

use tracing::trace;
use vx86_cpu_core::{
    CpuExit, CpuState, FieldError, GuestMemory, GuestThread, Gpr, LazyFlags, Width,
};

use crate::buffer::TranslatedBlock;
use crate::ir::{ExitKind, HostArg, HostInst, HostReg, RecordKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Fatal(#[from] CpuExit),
    /// The block inlines flat-stack accesses, but the process has since reloaded SS or narrowed
    /// the stack mask.
    #[error("block at {0:#x} assumes a flat stack")]
    StaleBlock(u32),
    #[error("block at {block:#x} (32-bit: {code32}) entered at {eip:#x} (32-bit: {big})")]
    WrongEntry {
        block: u32,
        code32: bool,
        eip: u32,
        big: bool,
    },
    #[error(transparent)]
    Field(#[from] FieldError),
}

#[derive(Default)]
struct HostRegs([u32; HostReg::COUNT]);

impl HostRegs {
    fn get(&self, reg: HostReg) -> u32 {
        self.0[reg.index()]
    }

    fn set(&mut self, reg: HostReg, value: u32) {
        self.0[reg.index()] = value;
    }

    fn spill(&self, cpu: &mut CpuState) {
        cpu.set_reg(Gpr::Esp, self.get(HostReg::Esp));
        cpu.eip = self.get(HostReg::Eip);
    }

    fn reload(&mut self, cpu: &CpuState) {
        self.set(HostReg::Esp, cpu.reg(Gpr::Esp));
        self.set(HostReg::Eip, cpu.eip);
    }
}

fn load(mem: &dyn GuestMemory, addr: u32, width: Width) -> u32 {
    match width {
        Width::Byte => u32::from(mem.read_u8(addr)),
        Width::Word => u32::from(mem.read_u16(addr)),
        Width::Dword => mem.read_u32(addr),
    }
}

fn store(mem: &mut dyn GuestMemory, addr: u32, value: u32, width: Width) {
    match width {
        Width::Byte => mem.write_u8(addr, value as u8),
        Width::Word => mem.write_u16(addr, value as u16),
        Width::Dword => mem.write_u32(addr, value),
    }
}

fn record(kind: RecordKind, lhs: u32, rhs: u32, result: u32) -> LazyFlags {
    let width = Width::Dword;
    match kind {
        RecordKind::Add => LazyFlags::Add {
            width,
            lhs,
            rhs,
            result,
        },
        RecordKind::Sub => LazyFlags::Sub {
            width,
            lhs,
            rhs,
            result,
        },
        RecordKind::Logic => LazyFlags::Logic { width, result },
        RecordKind::Neg => LazyFlags::Neg {
            width,
            src: lhs,
            result,
        },
    }
}

/// Executes `block`, which must have been translated for the current EIP and code size.
pub fn execute_block<T: GuestThread + ?Sized>(
    block: &TranslatedBlock,
    cpu: &mut CpuState,
    thread: &mut T,
) -> Result<ExitKind, ExecError> {
    if block.assumes_flat_stack && !thread.process_flags().flat_stack() {
        return Err(ExecError::StaleBlock(block.start_eip));
    }
    if cpu.eip != block.start_eip || cpu.big != block.code32 {
        return Err(ExecError::WrongEntry {
            block: block.start_eip,
            code32: block.code32,
            eip: cpu.eip,
            big: cpu.big,
        });
    }
    trace!(
        start_eip = block.start_eip,
        guest_ops = block.guest_ops,
        host_insts = block.insts().len(),
        "execute block"
    );

    let mut regs = HostRegs::default();
    regs.reload(cpu);

    let mut exit = ExitKind::Completed;
    for inst in block.insts() {
        match inst {
            HostInst::LoadField { dst, field } => {
                if field.pinned_alias().is_some() {
                    regs.spill(cpu);
                }
                regs.set(*dst, cpu.read_field(*field));
            }
            HostInst::StoreField { field, src } => {
                let aliased = field.pinned_alias().is_some();
                if aliased {
                    regs.spill(cpu);
                }
                cpu.write_field(*field, regs.get(*src))?;
                if aliased {
                    regs.reload(cpu);
                }
            }
            HostInst::Mov { dst, src } => regs.set(*dst, regs.get(*src)),
            HostInst::MovImm { dst, imm } => regs.set(*dst, *imm),
            HostInst::AluImm { op, dst, imm } => regs.set(*dst, op.apply(regs.get(*dst), *imm)),
            HostInst::AluReg { op, dst, src } => {
                regs.set(*dst, op.apply(regs.get(*dst), regs.get(*src)))
            }
            HostInst::Load { dst, addr, width } => {
                regs.set(*dst, load(thread.memory(), regs.get(*addr), *width))
            }
            HostInst::Store { addr, src, width } => {
                store(thread.memory_mut(), regs.get(*addr), regs.get(*src), *width)
            }
            HostInst::StoreImm { addr, imm, width } => {
                store(thread.memory_mut(), regs.get(*addr), *imm, *width)
            }
            HostInst::CallHelper { helper, args, ret } => {
                regs.spill(cpu);
                let values: Vec<u32> = args
                    .iter()
                    .map(|arg| match *arg {
                        HostArg::Imm(imm) => imm,
                        HostArg::Reg(reg) => regs.get(reg),
                        HostArg::Field(field) => cpu.read_field(field),
                    })
                    .collect();
                let value = helper.invoke(cpu, thread, &values)?;
                regs.reload(cpu);
                if let Some(ret) = ret {
                    regs.set(*ret, value);
                }
            }
            HostInst::RecordFlags {
                kind,
                lhs,
                rhs,
                result,
            } => cpu.set_lazy_flags(record(
                *kind,
                regs.get(*lhs),
                regs.get(*rhs),
                regs.get(*result),
            )),
            HostInst::DiscardLazyFlags => cpu.discard_lazy_flags(),
            HostInst::ExitIfZero { reg, exit: kind } => {
                if regs.get(*reg) == 0 {
                    exit = *kind;
                    break;
                }
            }
            HostInst::ExitBranch {
                cond,
                flags,
                taken,
                not_taken,
            } => {
                let target = if cond.test(regs.get(*flags)) {
                    *taken
                } else {
                    *not_taken
                };
                regs.set(HostReg::Eip, target);
                exit = ExitKind::Branched;
                break;
            }
            HostInst::Exit { exit: kind } => {
                exit = *kind;
                break;
            }
        }
    }

    regs.spill(cpu);
    trace!(?exit, eip = cpu.eip, "block exit");
    Ok(exit)
}
