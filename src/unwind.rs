use std::rc::Rc;

use anyhow::Result;
use nix::libc::user_regs_struct;
use tracing::warn;

use crate::dwarf::DwarfInfo;
use crate::error::Error;
use crate::expr;
use crate::frame::{CallFrame, FrameInfo, RegRule, MAXREG};
use crate::reader::ByteSource;

/// DWARF register number of the return address on x86-64.
pub const IP_REG: usize = 16;
/// DWARF register number of the stack pointer on x86-64.
pub const SP_REG: usize = 7;

/// Machine registers indexed by DWARF register number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DwarfRegisters {
    pub reg: [u64; MAXREG],
}

impl Default for DwarfRegisters {
    fn default() -> Self {
        Self { reg: [0; MAXREG] }
    }
}

// The x86-64 psABI DWARF numbering. Everything the unwinder restores
// goes through this table, keeping the walker register-count-generic.
impl DwarfRegisters {
    pub fn from_user_regs(r: &user_regs_struct) -> Self {
        let mut d = DwarfRegisters::default();
        d.reg[0] = r.rax;
        d.reg[1] = r.rdx;
        d.reg[2] = r.rcx;
        d.reg[3] = r.rbx;
        d.reg[4] = r.rsi;
        d.reg[5] = r.rdi;
        d.reg[6] = r.rbp;
        d.reg[7] = r.rsp;
        d.reg[8] = r.r8;
        d.reg[9] = r.r9;
        d.reg[10] = r.r10;
        d.reg[11] = r.r11;
        d.reg[12] = r.r12;
        d.reg[13] = r.r13;
        d.reg[14] = r.r14;
        d.reg[15] = r.r15;
        d.reg[IP_REG] = r.rip;
        d
    }

    pub fn ip(&self) -> u64 {
        self.reg[IP_REG]
    }
}

/// Registers the architecture translation table covers.
pub fn is_arch_reg(regno: usize) -> bool {
    regno <= IP_REG
}

/// What the unwinder needs from its surroundings: a module index over the
/// target's address space, per-module DWARF, and the memory itself.
pub trait UnwindContext {
    /// Map a target address to `(relocation, dwarf)` of the owning module.
    fn find_dwarf(&self, addr: u64) -> Option<(u64, Rc<DwarfInfo>)>;

    /// The target's address space.
    fn memory(&self) -> &dyn ByteSource;
}

/// One walked frame. `regs` is the register state on entry to the frame;
/// `cfa` is the canonical frame address computed while unwinding it.
#[derive(Clone, Debug)]
pub struct StackFrame {
    pub ip: u64,
    pub cfa: u64,
    pub regs: DwarfRegisters,
    pub is_signal: bool,
}

#[derive(Clone, Debug)]
pub struct ThreadStack {
    pub tid: u64,
    pub lwp: i32,
    pub thread_type: i32,
    pub frames: Vec<StackFrame>,
}

struct Step {
    next_ip: u64,
    cfa: u64,
    is_signal: bool,
}

impl ThreadStack {
    /// Walk frames from `initial` until no FDE covers the address, the
    /// restored return address is zero or unchanged, a decode error ends
    /// the session, or `max_frames` is reached. Frames produced before an
    /// error remain valid output.
    pub fn unwind(
        ctx: &dyn UnwindContext,
        tid: u64,
        lwp: i32,
        thread_type: i32,
        initial: DwarfRegisters,
        max_frames: usize,
    ) -> ThreadStack {
        let mut stack = ThreadStack {
            tid,
            lwp,
            thread_type,
            frames: Vec::new(),
        };
        let mut regs = initial;
        let mut ip = regs.ip();

        for _ in 0..max_frames {
            let mut frame = StackFrame {
                ip,
                cfa: 0,
                regs,
                is_signal: false,
            };
            match step(ctx, &mut regs, ip) {
                Ok(Some(next)) => {
                    frame.cfa = next.cfa;
                    frame.is_signal = next.is_signal;
                    stack.frames.push(frame);
                    if next.next_ip == 0 || next.next_ip == ip {
                        break;
                    }
                    ip = next.next_ip;
                }
                Ok(None) => {
                    stack.frames.push(frame);
                    break;
                }
                Err(err) => {
                    stack.frames.push(frame);
                    warn!("exception unwinding stack: {err}");
                    break;
                }
            }
        }
        stack
    }
}

/// Unwind one frame: locate the module, find the covering FDE
/// (`.debug_frame` first, then `.eh_frame`), run the CFA machine to just
/// before the return address, compute the CFA and restore the caller's
/// registers into `regs`.
fn step(ctx: &dyn UnwindContext, regs: &mut DwarfRegisters, ip: u64) -> Result<Option<Step>> {
    let (reloc, dwarf) = match ctx.find_dwarf(ip) {
        Some(found) => found,
        None => return Ok(None),
    };
    let obj_addr = ip - reloc;

    let table = [dwarf.debug_frame(), dwarf.eh_frame()]
        .into_iter()
        .flatten()
        .find(|fi| fi.find_fde(obj_addr).is_some());
    let fi = match table {
        Some(fi) => fi,
        None => return Ok(None),
    };
    let fde = fi.find_fde(obj_addr).expect("fde present").clone();
    let cie = fi.cie_of(&fde).clone();

    // The return address points after the call instruction; back up one
    // byte so the rules of the call site itself apply.
    let frame = fi.unwind_rules(&fde, obj_addr.wrapping_sub(1))?;
    let cfa = compute_cfa(&fi, &frame, regs, ctx.memory())?;

    let mut new = DwarfRegisters::default();
    for regno in 0..MAXREG {
        if !is_arch_reg(regno) {
            continue;
        }
        new.reg[regno] =
            restore_register(&fi, &frame.registers[regno], regs, regs.reg[regno], cfa, ctx.memory())?;
    }
    // The CFA is the stack pointer at the call site; an undefined SP rule
    // means exactly that.
    if frame.registers[SP_REG] == RegRule::Undef {
        new.reg[SP_REG] = cfa;
    }

    let next_ip = new
        .reg
        .get(cie.rar as usize)
        .copied()
        .unwrap_or(0);
    *regs = new;
    Ok(Some(Step {
        next_ip,
        cfa,
        is_signal: cie.is_signal_handler,
    }))
}

pub fn compute_cfa(
    fi: &FrameInfo,
    frame: &CallFrame,
    regs: &DwarfRegisters,
    memory: &dyn ByteSource,
) -> Result<u64> {
    match &frame.cfa_rule {
        RegRule::Offset(offset) => {
            let reg = regs
                .reg
                .get(frame.cfa_reg as usize)
                .copied()
                .ok_or_else(|| Error::BadCfi(format!("CFA register {}", frame.cfa_reg)))?;
            Ok((reg as i64 + offset) as u64)
        }
        RegRule::Expression(span) => {
            let mut r = fi.reader_for(*span);
            let mut stack = Vec::new();
            expr::eval(&mut r, regs, &mut stack, memory)
        }
        other => Err(Error::BadCfi(format!("CFA rule {other:?} not computable")).into()),
    }
}

fn restore_register(
    fi: &FrameInfo,
    rule: &RegRule,
    prev: &DwarfRegisters,
    prev_value: u64,
    cfa: u64,
    memory: &dyn ByteSource,
) -> Result<u64> {
    Ok(match rule {
        RegRule::Undef | RegRule::Same => prev_value,
        RegRule::Offset(offset) => read_word(memory, (cfa as i64 + offset) as u64)?,
        RegRule::ValOffset(offset) => (cfa as i64 + offset) as u64,
        RegRule::Reg(from) => prev
            .reg
            .get(*from as usize)
            .copied()
            .ok_or_else(|| Error::BadCfi(format!("rule register {from}")))?,
        RegRule::Expression(span) => {
            let mut r = fi.reader_for(*span);
            let mut stack = vec![cfa];
            let addr = expr::eval(&mut r, prev, &mut stack, memory)?;
            read_word(memory, addr)?
        }
        RegRule::ValExpression(span) => {
            let mut r = fi.reader_for(*span);
            let mut stack = vec![cfa];
            expr::eval(&mut r, prev, &mut stack, memory)?
        }
        RegRule::Arch => {
            return Err(Error::BadCfi("architectural register rule".into()).into())
        }
    })
}

fn read_word(memory: &dyn ByteSource, addr: u64) -> Result<u64> {
    let mut word = [0u8; 8];
    memory.read_exact_at(addr, &mut word)?;
    Ok(u64::from_le_bytes(word))
}
