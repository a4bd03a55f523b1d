use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::error::Error;
use crate::reader::{ByteSource, DwarfReader};

pub const MAXREG: usize = 128;

pub const DW_EH_PE_ABSPTR: u8 = 0x00;
pub const DW_EH_PE_ULEB128: u8 = 0x01;
pub const DW_EH_PE_UDATA2: u8 = 0x02;
pub const DW_EH_PE_UDATA4: u8 = 0x03;
pub const DW_EH_PE_UDATA8: u8 = 0x04;
pub const DW_EH_PE_SLEB128: u8 = 0x09;
pub const DW_EH_PE_SDATA2: u8 = 0x0a;
pub const DW_EH_PE_SDATA4: u8 = 0x0b;
pub const DW_EH_PE_SDATA8: u8 = 0x0c;
pub const DW_EH_PE_PCREL: u8 = 0x10;

const DW_CFA_NOP: u8 = 0x00;
const DW_CFA_SET_LOC: u8 = 0x01;
const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
const DW_CFA_OFFSET_EXTENDED: u8 = 0x05;
const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
const DW_CFA_UNDEFINED: u8 = 0x07;
const DW_CFA_SAME_VALUE: u8 = 0x08;
const DW_CFA_REGISTER: u8 = 0x09;
const DW_CFA_REMEMBER_STATE: u8 = 0x0a;
const DW_CFA_RESTORE_STATE: u8 = 0x0b;
const DW_CFA_DEF_CFA: u8 = 0x0c;
const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
const DW_CFA_DEF_CFA_EXPRESSION: u8 = 0x0f;
const DW_CFA_EXPRESSION: u8 = 0x10;
const DW_CFA_OFFSET_EXTENDED_SF: u8 = 0x11;
const DW_CFA_DEF_CFA_SF: u8 = 0x12;
const DW_CFA_DEF_CFA_OFFSET_SF: u8 = 0x13;
const DW_CFA_VAL_OFFSET: u8 = 0x14;
const DW_CFA_VAL_OFFSET_SF: u8 = 0x15;
const DW_CFA_VAL_EXPRESSION: u8 = 0x16;
const DW_CFA_GNU_ARGS_SIZE: u8 = 0x2e;

/// A byte range of the image source holding expression or instruction
/// bytes; kept as offsets so call frames stay cheap to copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub offset: u64,
    pub length: u64,
}

/// How to recover one register (or the CFA) in the caller's frame.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum RegRule {
    #[default]
    Undef,
    Same,
    Offset(i64),
    ValOffset(i64),
    Reg(u64),
    Expression(Span),
    ValExpression(Span),
    Arch,
}

/// The unwind rules in force at one code location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallFrame {
    pub cfa_reg: u64,
    pub cfa_rule: RegRule,
    pub registers: Vec<RegRule>,
}

impl Default for CallFrame {
    fn default() -> Self {
        Self {
            cfa_reg: 0,
            cfa_rule: RegRule::Undef,
            registers: vec![RegRule::Undef; MAXREG],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiType {
    DebugFrame,
    EhFrame,
}

#[derive(Clone, Debug)]
pub struct Cie {
    pub version: u8,
    pub augmentation: String,
    pub code_align: u64,
    pub data_align: i64,
    /// Return address register number.
    pub rar: u64,
    pub address_encoding: u8,
    pub lsda_encoding: u8,
    pub personality: u64,
    pub is_signal_handler: bool,
    pub instructions: Span,
}

#[derive(Clone, Debug)]
pub struct Fde {
    /// Key of the CIE this FDE references, as stored in the CIE map.
    pub cie_offset: u64,
    pub iloc: u64,
    pub irange: u64,
    pub aug: Vec<u8>,
    pub instructions: Span,
}

/// The indexed contents of one `.debug_frame` or `.eh_frame` section.
pub struct FrameInfo {
    fi_type: FiType,
    base: u64,
    source: Arc<dyn ByteSource>,
    cies: BTreeMap<u64, Cie>,
    fdes: Vec<Fde>,
}

impl std::fmt::Debug for FrameInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameInfo")
            .field("fi_type", &self.fi_type)
            .field("base", &self.base)
            .field("source", &self.source.describe())
            .field("cies", &self.cies)
            .field("fdes", &self.fdes)
            .finish()
    }
}

impl FrameInfo {
    /// Two passes over the section: collect CIEs first, then build FDEs
    /// against them. CIEs are keyed by the offset of their length field.
    pub fn parse(
        source: Arc<dyn ByteSource>,
        section_offset: u64,
        section_size: u64,
        base: u64,
        fi_type: FiType,
    ) -> Result<FrameInfo> {
        let mut info = FrameInfo {
            fi_type,
            base,
            source,
            cies: BTreeMap::new(),
            fdes: Vec::new(),
        };

        let mut r = DwarfReader::new(Arc::clone(&info.source), section_offset, section_size);
        loop {
            let entry_off = r.offset();
            let (next, (_id_field_offset, id)) = match decode_entry_header(&mut r)? {
                Some(header) => header,
                None => break,
            };
            if info.is_cie(id) {
                let cie = info.parse_cie(&mut r, next)?;
                info.cies.insert(entry_off, cie);
            }
            r.set_offset(next);
            if r.at_end() {
                break;
            }
        }

        let mut r = DwarfReader::new(Arc::clone(&info.source), section_offset, section_size);
        loop {
            let (next, (id_field_offset, id)) = match decode_entry_header(&mut r)? {
                Some(header) => header,
                None => break,
            };
            if !info.is_cie(id) {
                let cie_key = match fi_type {
                    // The eh_frame CIE link is relative to the id field.
                    FiType::EhFrame => id_field_offset.wrapping_sub(id),
                    FiType::DebugFrame => section_offset + id,
                };
                let cie = info.cies.get(&cie_key).cloned().ok_or_else(|| {
                    Error::BadCfi(format!(
                        "FDE at {id_field_offset:#x} references missing CIE at {cie_key:#x}"
                    ))
                })?;
                let fde = info.parse_fde(&mut r, &cie, cie_key, next)?;
                info.fdes.push(fde);
            }
            r.set_offset(next);
            if r.at_end() {
                break;
            }
        }
        Ok(info)
    }

    fn is_cie(&self, id: u64) -> bool {
        match self.fi_type {
            FiType::DebugFrame => id == 0xffffffff,
            FiType::EhFrame => id == 0,
        }
    }

    fn parse_cie(&self, r: &mut DwarfReader, end: u64) -> Result<Cie> {
        let version = r.getu8()?;
        let augmentation = r.getstring()?;
        let code_align = r.getuleb128()?;
        let data_align = r.getsleb128()?;
        let rar = r.getu8()? as u64;

        let mut cie = Cie {
            version,
            augmentation: augmentation.clone(),
            code_align,
            data_align,
            rar,
            address_encoding: DW_EH_PE_UDATA4,
            lsda_encoding: 0,
            personality: 0,
            is_signal_handler: false,
            instructions: Span { offset: 0, length: 0 },
        };

        let mut chars = augmentation.chars();
        match chars.next() {
            Some('z') => {
                let aug_size = r.getuleb128()?;
                let aug_end = r.offset() + aug_size;
                for c in chars {
                    match c {
                        'P' => {
                            let encoding = r.getu8()?;
                            cie.personality = self.decode_address(r, encoding)?;
                        }
                        'L' => cie.lsda_encoding = r.getu8()?,
                        'R' => cie.address_encoding = r.getu8()?,
                        'S' => cie.is_signal_handler = true,
                        other => {
                            // The augmentations are ordered, so nothing
                            // after an unknown one can be interpreted.
                            warn!("unknown augmentation '{other}' in {augmentation}");
                            break;
                        }
                    }
                }
                if r.offset() != aug_end {
                    warn!(
                        "{} bytes of augmentation ignored",
                        aug_end as i64 - r.offset() as i64
                    );
                    r.set_offset(aug_end);
                }
            }
            Some(_) => warn!("augmentation without length delimiter: {augmentation}"),
            None => {}
        }

        cie.instructions = Span {
            offset: r.offset(),
            length: end - r.offset(),
        };
        Ok(cie)
    }

    fn parse_fde(
        &self,
        r: &mut DwarfReader,
        cie: &Cie,
        cie_key: u64,
        end: u64,
    ) -> Result<Fde> {
        let iloc = self.decode_address(r, cie.address_encoding)?;
        // The range is a plain length: relocation does not apply.
        let irange = self.decode_address(r, cie.address_encoding & 0x0f)?;
        let mut aug = Vec::new();
        if cie.augmentation.starts_with('z') {
            let alen = r.getuleb128()?;
            for _ in 0..alen {
                aug.push(r.getu8()?);
            }
        }
        Ok(Fde {
            cie_offset: cie_key,
            iloc,
            irange,
            aug,
            instructions: Span {
                offset: r.offset(),
                length: end - r.offset(),
            },
        })
    }

    /// Decode a `DW_EH_PE_*`-encoded address at the reader's position.
    pub fn decode_address(&self, r: &mut DwarfReader, encoding: u8) -> Result<u64> {
        let field_offset = r.offset();
        let value = match encoding & 0x0f {
            DW_EH_PE_ABSPTR => r.getuint(r.addr_len as usize)? as i64,
            DW_EH_PE_ULEB128 => r.getuleb128()? as i64,
            DW_EH_PE_UDATA2 => r.getuint(2)? as i64,
            DW_EH_PE_UDATA4 => r.getuint(4)? as i64,
            DW_EH_PE_UDATA8 => r.getuint(8)? as i64,
            DW_EH_PE_SLEB128 => r.getsleb128()?,
            DW_EH_PE_SDATA2 => r.getint(2)?,
            DW_EH_PE_SDATA4 => r.getint(4)?,
            DW_EH_PE_SDATA8 => r.getint(8)?,
            other => return Err(Error::UnsupportedEncoding(other).into()),
        };
        match encoding & 0xf0 {
            0 => Ok(value as u64),
            DW_EH_PE_PCREL => Ok((value + (field_offset + self.base) as i64) as u64),
            other => Err(Error::UnsupportedEncoding(other).into()),
        }
    }

    pub fn cie_of(&self, fde: &Fde) -> &Cie {
        &self.cies[&fde.cie_offset]
    }

    /// First FDE whose `[iloc, iloc + irange)` covers `addr`.
    pub fn find_fde(&self, addr: u64) -> Option<&Fde> {
        self.fdes
            .iter()
            .find(|fde| fde.iloc <= addr && addr < fde.iloc + fde.irange)
    }

    pub fn fdes(&self) -> &[Fde] {
        &self.fdes
    }

    /// Run the CIE's initial instructions and then the FDE's program,
    /// stopping once the location counter passes `want_addr`.
    pub fn unwind_rules(&self, fde: &Fde, want_addr: u64) -> Result<CallFrame> {
        let cie = self.cie_of(fde);
        let mut r = DwarfReader::new(
            Arc::clone(&self.source),
            fde.instructions.offset,
            fde.instructions.length,
        );
        cie.exec_insns(&mut r, fde.iloc, want_addr)
    }

    pub fn reader_for(&self, span: Span) -> DwarfReader {
        DwarfReader::new(Arc::clone(&self.source), span.offset, span.length)
    }
}

// Header of one CIE/FDE entry: Some((end offset, (id field offset, id)))
// or None for a terminator.
fn decode_entry_header(r: &mut DwarfReader) -> Result<Option<(u64, (u64, u64))>> {
    if r.at_end() {
        return Ok(None);
    }
    let length = r.getlength()?;
    if length == 0 {
        return Ok(None);
    }
    let id_offset = r.offset();
    let id = r.getuint(4)?;
    Ok(Some((id_offset + length, (id_offset, id))))
}

impl Cie {
    /// The CFA state machine. `addr` starts at the FDE's initial location;
    /// execution stops when input runs out or the location counter
    /// exceeds `want_addr`. `restore` rules refer to the frame produced
    /// by this CIE's initial instructions.
    pub fn exec_insns(
        &self,
        r: &mut DwarfReader,
        addr: u64,
        want_addr: u64,
    ) -> Result<CallFrame> {
        let dframe = if addr != 0 || want_addr != 0 {
            let mut init = r.sub_reader(self.instructions.offset, self.instructions.length);
            self.exec_insns(&mut init, 0, 0)?
        } else {
            CallFrame::default()
        };
        let mut frame = dframe.clone();
        let mut stack: Vec<CallFrame> = Vec::new();
        let mut addr = addr;

        while !r.at_end() && addr <= want_addr {
            let raw = r.getu8()?;
            let low = (raw & 0x3f) as u64;
            match raw & 0xc0 {
                0x40 => addr += low * self.code_align,
                0x80 => {
                    let offset = r.getuleb128()?;
                    *reg_mut(&mut frame, low)? =
                        RegRule::Offset(offset as i64 * self.data_align);
                }
                0xc0 => {
                    *reg_mut(&mut frame, low)? = dframe.registers[low as usize].clone();
                }
                _ => match raw {
                    DW_CFA_NOP => {}
                    DW_CFA_SET_LOC => addr = r.getuint(r.addr_len as usize)?,
                    DW_CFA_ADVANCE_LOC1 => addr += r.getu8()? as u64 * self.code_align,
                    DW_CFA_ADVANCE_LOC2 => addr += r.getu16()? as u64 * self.code_align,
                    DW_CFA_ADVANCE_LOC4 => addr += r.getu32()? as u64 * self.code_align,
                    DW_CFA_OFFSET_EXTENDED => {
                        let reg = r.getuleb128()?;
                        let offset = r.getuleb128()?;
                        *reg_mut(&mut frame, reg)? =
                            RegRule::Offset(offset as i64 * self.data_align);
                    }
                    DW_CFA_OFFSET_EXTENDED_SF => {
                        let reg = r.getuleb128()?;
                        let offset = r.getsleb128()?;
                        *reg_mut(&mut frame, reg)? = RegRule::Offset(offset * self.data_align);
                    }
                    DW_CFA_RESTORE_EXTENDED => {
                        let reg = r.getuleb128()?;
                        let rule = dframe
                            .registers
                            .get(reg as usize)
                            .cloned()
                            .ok_or_else(|| Error::BadCfi(format!("register {reg} out of range")))?;
                        *reg_mut(&mut frame, reg)? = rule;
                    }
                    DW_CFA_UNDEFINED => {
                        let reg = r.getuleb128()?;
                        *reg_mut(&mut frame, reg)? = RegRule::Undef;
                    }
                    DW_CFA_SAME_VALUE => {
                        let reg = r.getuleb128()?;
                        *reg_mut(&mut frame, reg)? = RegRule::Same;
                    }
                    DW_CFA_REGISTER => {
                        let reg = r.getuleb128()?;
                        let from = r.getuleb128()?;
                        *reg_mut(&mut frame, reg)? = RegRule::Reg(from);
                    }
                    DW_CFA_REMEMBER_STATE => stack.push(frame.clone()),
                    DW_CFA_RESTORE_STATE => {
                        frame = stack.pop().ok_or_else(|| {
                            Error::BadCfi("restore_state on empty state stack".into())
                        })?;
                    }
                    DW_CFA_DEF_CFA => {
                        frame.cfa_reg = r.getuleb128()?;
                        frame.cfa_rule = RegRule::Offset(r.getuleb128()? as i64);
                    }
                    DW_CFA_DEF_CFA_SF => {
                        frame.cfa_reg = r.getuleb128()?;
                        frame.cfa_rule = RegRule::Offset(r.getsleb128()? * self.data_align);
                    }
                    DW_CFA_DEF_CFA_REGISTER => {
                        frame.cfa_reg = r.getuleb128()?;
                        let offset = match frame.cfa_rule {
                            RegRule::Offset(offset) => offset,
                            _ => 0,
                        };
                        frame.cfa_rule = RegRule::Offset(offset);
                    }
                    DW_CFA_DEF_CFA_OFFSET => {
                        frame.cfa_rule = RegRule::Offset(r.getuleb128()? as i64);
                    }
                    DW_CFA_DEF_CFA_OFFSET_SF => {
                        frame.cfa_rule = RegRule::Offset(r.getsleb128()? * self.data_align);
                    }
                    DW_CFA_DEF_CFA_EXPRESSION => {
                        let length = r.getuleb128()?;
                        frame.cfa_rule = RegRule::Expression(Span {
                            offset: r.offset(),
                            length,
                        });
                        r.skip(length);
                    }
                    DW_CFA_EXPRESSION => {
                        let reg = r.getuleb128()?;
                        let length = r.getuleb128()?;
                        let span = Span {
                            offset: r.offset(),
                            length,
                        };
                        r.skip(length);
                        *reg_mut(&mut frame, reg)? = RegRule::Expression(span);
                    }
                    DW_CFA_VAL_EXPRESSION => {
                        let reg = r.getuleb128()?;
                        let length = r.getuleb128()?;
                        let span = Span {
                            offset: r.offset(),
                            length,
                        };
                        r.skip(length);
                        *reg_mut(&mut frame, reg)? = RegRule::ValExpression(span);
                    }
                    DW_CFA_VAL_OFFSET => {
                        let reg = r.getuleb128()?;
                        let offset = r.getuleb128()?;
                        *reg_mut(&mut frame, reg)? =
                            RegRule::ValOffset(offset as i64 * self.data_align);
                    }
                    DW_CFA_VAL_OFFSET_SF => {
                        let reg = r.getuleb128()?;
                        let offset = r.getsleb128()?;
                        *reg_mut(&mut frame, reg)? =
                            RegRule::ValOffset(offset * self.data_align);
                    }
                    DW_CFA_GNU_ARGS_SIZE => {
                        // Recognized but not needed for unwinding.
                        r.getuleb128()?;
                    }
                    other => {
                        return Err(
                            Error::BadCfi(format!("unhandled instruction {other:#x}")).into()
                        )
                    }
                },
            }
        }
        Ok(frame)
    }
}

fn reg_mut(frame: &mut CallFrame, reg: u64) -> Result<&mut RegRule> {
    frame
        .registers
        .get_mut(reg as usize)
        .ok_or_else(|| Error::BadCfi(format!("register {reg} out of range")).into())
}
