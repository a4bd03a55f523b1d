use anyhow::Result;

use crate::error::Error;
use crate::frame::MAXREG;
use crate::reader::{ByteSource, DwarfReader};
use crate::unwind::DwarfRegisters;

const DW_OP_DEREF: u8 = 0x06;
const DW_OP_CONST2S: u8 = 0x0b;
const DW_OP_CONST4U: u8 = 0x0c;
const DW_OP_CONST4S: u8 = 0x0d;
const DW_OP_MINUS: u8 = 0x1c;
const DW_OP_PLUS: u8 = 0x22;
const DW_OP_BREG0: u8 = 0x70;
const DW_OP_BREG31: u8 = 0x8f;

/// Evaluate a DWARF expression over the subset the unwinder and
/// argument-location attributes need. `deref` reads a machine word from
/// the injected target address space; the caller seeds `stack` (with the
/// CFA, for register-rule expressions) as required. The result is the
/// value left on top of the stack.
pub fn eval(
    r: &mut DwarfReader,
    regs: &DwarfRegisters,
    stack: &mut Vec<u64>,
    target: &dyn ByteSource,
) -> Result<u64> {
    while !r.at_end() {
        let op = r.getu8()?;
        match op {
            DW_OP_DEREF => {
                let addr = pop(stack)?;
                let mut word = [0u8; 8];
                target.read_exact_at(addr, &mut word)?;
                stack.push(u64::from_le_bytes(word));
            }
            DW_OP_CONST2S => stack.push(r.getint(2)? as u64),
            DW_OP_CONST4U => stack.push(r.getuint(4)?),
            DW_OP_CONST4S => stack.push(r.getint(4)? as u64),
            DW_OP_MINUS => {
                let top = pop(stack)?;
                let second = pop(stack)?;
                stack.push(second.wrapping_sub(top));
            }
            DW_OP_PLUS => {
                let top = pop(stack)?;
                let second = pop(stack)?;
                stack.push(second.wrapping_add(top));
            }
            DW_OP_BREG0..=DW_OP_BREG31 => {
                let reg = (op - DW_OP_BREG0) as usize;
                if reg >= MAXREG {
                    return Err(Error::ExpressionError(format!("register {reg}")).into());
                }
                let offset = r.getsleb128()?;
                stack.push((regs.reg[reg] as i64).wrapping_add(offset) as u64);
            }
            other => return Err(Error::UnsupportedOpcode(other).into()),
        }
    }
    pop(stack)
}

fn pop(stack: &mut Vec<u64>) -> Result<u64> {
    stack
        .pop()
        .ok_or_else(|| Error::ExpressionError("stack underflow".into()).into())
}
