use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tracing::warn;

use crate::elf::ElfImage;
use crate::error::Error;
use crate::frame::{FiType, FrameInfo};
use crate::line::{FileEntry, LineInfo};
use crate::reader::DwarfReader;

#[allow(non_camel_case_types)]
pub type DwarfTag = u64;
#[allow(non_camel_case_types)]
pub type DwarfAttr = u64;
#[allow(non_camel_case_types)]
pub type DwarfForm = u64;

pub const DW_TAG_COMPILE_UNIT: DwarfTag = 0x11;
pub const DW_TAG_SUBPROGRAM: DwarfTag = 0x2e;
pub const DW_TAG_FORMAL_PARAMETER: DwarfTag = 0x05;
pub const DW_TAG_BASE_TYPE: DwarfTag = 0x24;
pub const DW_TAG_POINTER_TYPE: DwarfTag = 0x0f;
pub const DW_TAG_TYPEDEF: DwarfTag = 0x16;
pub const DW_TAG_CONST_TYPE: DwarfTag = 0x26;
pub const DW_TAG_VOLATILE_TYPE: DwarfTag = 0x35;

pub const DW_AT_NAME: DwarfAttr = 0x03;
pub const DW_AT_BYTE_SIZE: DwarfAttr = 0x0b;
pub const DW_AT_STMT_LIST: DwarfAttr = 0x10;
pub const DW_AT_LOW_PC: DwarfAttr = 0x11;
pub const DW_AT_HIGH_PC: DwarfAttr = 0x12;
pub const DW_AT_COMP_DIR: DwarfAttr = 0x1b;
pub const DW_AT_LOCATION: DwarfAttr = 0x02;
pub const DW_AT_ABSTRACT_ORIGIN: DwarfAttr = 0x31;
pub const DW_AT_SPECIFICATION: DwarfAttr = 0x47;
pub const DW_AT_TYPE: DwarfAttr = 0x49;
pub const DW_AT_ENCODING: DwarfAttr = 0x3e;
pub const DW_AT_LINKAGE_NAME: DwarfAttr = 0x6e;

pub const DW_ATE_ADDRESS: u64 = 0x01;
pub const DW_ATE_BOOLEAN: u64 = 0x02;
pub const DW_ATE_SIGNED: u64 = 0x05;
pub const DW_ATE_UNSIGNED: u64 = 0x07;

pub const DW_FORM_ADDR: DwarfForm = 0x01;
pub const DW_FORM_BLOCK2: DwarfForm = 0x03;
pub const DW_FORM_BLOCK4: DwarfForm = 0x04;
pub const DW_FORM_DATA2: DwarfForm = 0x05;
pub const DW_FORM_DATA4: DwarfForm = 0x06;
pub const DW_FORM_DATA8: DwarfForm = 0x07;
pub const DW_FORM_STRING: DwarfForm = 0x08;
pub const DW_FORM_BLOCK: DwarfForm = 0x09;
pub const DW_FORM_BLOCK1: DwarfForm = 0x0a;
pub const DW_FORM_DATA1: DwarfForm = 0x0b;
pub const DW_FORM_FLAG: DwarfForm = 0x0c;
pub const DW_FORM_SDATA: DwarfForm = 0x0d;
pub const DW_FORM_STRP: DwarfForm = 0x0e;
pub const DW_FORM_UDATA: DwarfForm = 0x0f;
pub const DW_FORM_REF_ADDR: DwarfForm = 0x10;
pub const DW_FORM_REF2: DwarfForm = 0x12;
pub const DW_FORM_REF4: DwarfForm = 0x13;
pub const DW_FORM_REF8: DwarfForm = 0x14;

/// A decoded attribute value, discriminated by the FORM it was read with.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Address(u64),
    Udata(u64),
    Sdata(i64),
    Str(String),
    /// Unit-relative DIE reference.
    Ref(u64),
    /// `.debug_info`-absolute DIE reference.
    RefAddr(u64),
    Block(Vec<u8>),
    Flag(bool),
}

impl AttrValue {
    pub fn as_address(&self) -> Result<u64> {
        match self {
            AttrValue::Address(a) => Ok(*a),
            other => bail!("attribute is not an address: {other:?}"),
        }
    }

    pub fn as_udata(&self) -> Result<u64> {
        match self {
            AttrValue::Udata(v) => Ok(*v),
            AttrValue::Sdata(v) => Ok(*v as u64),
            other => bail!("attribute is not an integer: {other:?}"),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            AttrValue::Str(s) => Ok(s),
            other => bail!("attribute is not a string: {other:?}"),
        }
    }

    pub fn as_block(&self) -> Result<&[u8]> {
        match self {
            AttrValue::Block(b) => Ok(b),
            other => bail!("attribute is not a block: {other:?}"),
        }
    }

    pub fn as_flag(&self) -> Result<bool> {
        match self {
            AttrValue::Flag(f) => Ok(*f),
            other => bail!("attribute is not a flag: {other:?}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttrSpec {
    pub attr: DwarfAttr,
    pub form: DwarfForm,
}

#[derive(Clone, Debug)]
pub struct Abbrev {
    pub code: u64,
    pub tag: DwarfTag,
    pub has_children: bool,
    pub specs: Vec<AttrSpec>,
}

/// One debugging information entry. Entries live in their unit's arena;
/// `children` holds arena indices, and references between entries stay
/// offset-valued.
#[derive(Clone, Debug)]
pub struct Entry {
    /// Offset of this entry from the start of its unit header.
    pub offset: u64,
    pub tag: DwarfTag,
    pub attrs: Vec<(DwarfAttr, AttrValue)>,
    pub children: Vec<usize>,
}

impl Entry {
    pub fn attr(&self, name: DwarfAttr) -> Option<&AttrValue> {
        self.attrs
            .iter()
            .find(|(attr, _)| *attr == name)
            .map(|(_, value)| value)
    }

    pub fn has(&self, name: DwarfAttr) -> bool {
        self.attr(name).is_some()
    }

    pub fn low_pc(&self) -> Result<u64> {
        self.attr(DW_AT_LOW_PC)
            .ok_or_else(|| anyhow!("entry has no low pc"))?
            .as_address()
    }

    /// `DW_AT_high_pc` is an absolute address when encoded with the addr
    /// FORM and a length relative to low_pc for constant forms.
    pub fn high_pc(&self) -> Result<u64> {
        match self.attr(DW_AT_HIGH_PC) {
            Some(AttrValue::Address(a)) => Ok(*a),
            Some(value) => Ok(self.low_pc()? + value.as_udata()?),
            None => bail!("entry has no high pc"),
        }
    }

    pub fn contains_address(&self, addr: u64) -> bool {
        match (self.low_pc(), self.high_pc()) {
            (Ok(low), Ok(high)) => low <= addr && addr < high,
            _ => false,
        }
    }
}

/// One compilation unit: header fields, abbreviation table, the decoded
/// entry arena, and the line matrix if the unit carries one.
pub struct Unit {
    /// Offset of the unit header inside `.debug_info`.
    pub offset: u64,
    pub version: u16,
    pub addr_len: u8,
    pub abbrevs: HashMap<u64, Abbrev>,
    entries: Vec<Entry>,
    roots: Vec<usize>,
    by_offset: BTreeMap<u64, usize>,
    pub lines: Option<LineInfo>,
    /// Total size of the unit including the length field.
    pub total_size: u64,
}

impl Unit {
    pub fn entry(&self, idx: usize) -> &Entry {
        &self.entries[idx]
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn root(&self) -> Option<&Entry> {
        self.roots.first().map(|&idx| &self.entries[idx])
    }

    /// Resolve a unit-relative offset to its entry index.
    pub fn index_at(&self, offset: u64) -> Option<usize> {
        self.by_offset.get(&offset).copied()
    }

    pub fn name(&self) -> Option<&str> {
        self.root()?.attr(DW_AT_NAME)?.as_str().ok()
    }

    fn decode_level(
        &mut self,
        r: &mut DwarfReader,
        unit_start: u64,
        debug_str: &[u8],
    ) -> Result<Vec<usize>> {
        let mut siblings = Vec::new();
        while !r.at_end() {
            let offset = r.offset() - unit_start;
            let code = r.getuleb128()?;
            if code == 0 {
                break;
            }
            let abbrev = self
                .abbrevs
                .get(&code)
                .cloned()
                .ok_or_else(|| anyhow!("missing abbreviation code {code}"))?;

            let mut attrs = Vec::with_capacity(abbrev.specs.len());
            for spec in &abbrev.specs {
                let value =
                    decode_form(r, spec.form, self.version, self.addr_len, debug_str)?;
                attrs.push((spec.attr, value));
            }

            let idx = self.entries.len();
            self.entries.push(Entry {
                offset,
                tag: abbrev.tag,
                attrs,
                children: Vec::new(),
            });
            self.by_offset.insert(offset, idx);

            if abbrev.has_children {
                let children = self.decode_level(r, unit_start, debug_str)?;
                self.entries[idx].children = children;
            }
            siblings.push(idx);
        }
        Ok(siblings)
    }
}

/// Decode one attribute value according to its FORM.
fn decode_form(
    r: &mut DwarfReader,
    form: DwarfForm,
    version: u16,
    addr_len: u8,
    debug_str: &[u8],
) -> Result<AttrValue> {
    let offset_len = if version >= 3 { 8 } else { 4 };
    Ok(match form {
        DW_FORM_ADDR => AttrValue::Address(r.getuint(addr_len as usize)?),
        DW_FORM_DATA1 => AttrValue::Udata(r.getu8()? as u64),
        DW_FORM_DATA2 => AttrValue::Udata(r.getu16()? as u64),
        DW_FORM_DATA4 => AttrValue::Udata(r.getu32()? as u64),
        DW_FORM_DATA8 => AttrValue::Udata(r.getuint(8)?),
        DW_FORM_SDATA => AttrValue::Sdata(r.getsleb128()?),
        DW_FORM_UDATA => AttrValue::Udata(r.getuleb128()?),
        DW_FORM_STRP => {
            let off = r.getuint(offset_len)? as usize;
            if off >= debug_str.len() {
                return Err(Error::MalformedSection(
                    ".debug_str".into(),
                    format!("string offset {off:#x} out of bounds"),
                )
                .into());
            }
            let bytes: Vec<u8> = debug_str[off..]
                .iter()
                .take_while(|&&c| c != 0)
                .copied()
                .collect();
            AttrValue::Str(String::from_utf8_lossy(&bytes).into_owned())
        }
        DW_FORM_STRING => AttrValue::Str(r.getstring()?),
        DW_FORM_REF2 => AttrValue::Ref(r.getu16()? as u64),
        DW_FORM_REF4 => AttrValue::Ref(r.getu32()? as u64),
        DW_FORM_REF8 => AttrValue::Ref(r.getuint(8)?),
        DW_FORM_REF_ADDR => AttrValue::RefAddr(r.getuint(offset_len)?),
        DW_FORM_BLOCK1 => {
            let len = r.getu8()? as usize;
            AttrValue::Block(read_block(r, len)?)
        }
        DW_FORM_BLOCK2 => {
            let len = r.getu16()? as usize;
            AttrValue::Block(read_block(r, len)?)
        }
        DW_FORM_BLOCK4 => {
            let len = r.getu32()? as usize;
            AttrValue::Block(read_block(r, len)?)
        }
        DW_FORM_BLOCK => {
            let len = r.getuleb128()? as usize;
            AttrValue::Block(read_block(r, len)?)
        }
        DW_FORM_FLAG => AttrValue::Flag(r.getu8()? != 0),
        other => return Err(Error::UnsupportedForm(other).into()),
    })
}

fn read_block(r: &mut DwarfReader, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(len);
    for _ in 0..len {
        bytes.push(r.getu8()?);
    }
    Ok(bytes)
}

fn parse_abbrev_table(r: &mut DwarfReader) -> Result<HashMap<u64, Abbrev>> {
    let mut table = HashMap::new();
    loop {
        let code = r.getuleb128()?;
        if code == 0 {
            break;
        }
        let tag = r.getuleb128()?;
        let has_children = r.getu8()? != 0;
        let mut specs = Vec::new();
        loop {
            let attr = r.getuleb128()?;
            let form = r.getuleb128()?;
            if attr == 0 && form == 0 {
                break;
            }
            specs.push(AttrSpec { attr, form });
        }
        table.insert(
            code,
            Abbrev {
                code,
                tag,
                has_children,
                specs,
            },
        );
    }
    Ok(table)
}

/// One `.debug_aranges` set: the unit it points at and its address ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArangeSet {
    pub debug_info_offset: u64,
    pub ranges: Vec<(u64, u64)>,
}

impl ArangeSet {
    fn parse(r: &mut DwarfReader) -> Result<Option<ArangeSet>> {
        let start = r.offset();
        let length = r.getlength()?;
        if length == 0 {
            return Ok(None);
        }
        let next = r.offset() + length;
        let _version = r.getu16()?;
        let debug_info_offset = r.getu32()? as u64;
        let addr_len = r.getu8()? as u64;
        let _segdesc_len = r.getu8()?;
        if !matches!(addr_len, 4 | 8) {
            return Err(Error::MalformedSection(
                ".debug_aranges".into(),
                format!("address size {addr_len}"),
            )
            .into());
        }

        // First tuple sits on a 2*address-size boundary from the set start.
        let tuple_len = addr_len * 2;
        let used = r.offset() - start;
        r.skip((tuple_len - used % tuple_len) % tuple_len);

        let mut ranges = Vec::new();
        while r.offset() < next {
            let lo = r.getuint(addr_len as usize)?;
            let len = r.getuint(addr_len as usize)?;
            if lo == 0 && len == 0 {
                break;
            }
            ranges.push((lo, len));
        }
        r.set_offset(next);
        Ok(Some(ArangeSet {
            debug_info_offset,
            ranges,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pubname {
    pub die_offset: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubnameUnit {
    pub info_offset: u64,
    pub info_length: u64,
    pub pubnames: Vec<Pubname>,
}

impl PubnameUnit {
    fn parse(r: &mut DwarfReader) -> Result<Option<PubnameUnit>> {
        let length = r.getlength()?;
        if length == 0 {
            return Ok(None);
        }
        let next = r.offset() + length;
        let _version = r.getu16()?;
        let info_offset = r.getu32()? as u64;
        let info_length = r.getu32()? as u64;
        let mut pubnames = Vec::new();
        while r.offset() < next {
            let die_offset = r.getu32()? as u64;
            if die_offset == 0 {
                break;
            }
            pubnames.push(Pubname {
                die_offset,
                name: r.getstring()?,
            });
        }
        r.set_offset(next);
        Ok(Some(PubnameUnit {
            info_offset,
            info_length,
            pubnames,
        }))
    }
}

#[derive(Clone, Copy)]
struct SectionRef {
    offset: u64,
    size: u64,
}

/// All DWARF debug information of one ELF image. The units, aranges,
/// pubnames and frame tables materialize on first use; the caches are
/// interior-mutable and single-writer — one session owns a DwarfInfo.
pub struct DwarfInfo {
    elf: Arc<ElfImage>,
    info: Option<SectionRef>,
    abbrev: Option<SectionRef>,
    lineshdr: Option<SectionRef>,
    arangesh: Option<SectionRef>,
    pubnamesh: Option<SectionRef>,
    debug_frame_sect: Option<SectionRef>,
    eh_frame_sect: Option<SectionRef>,
    debug_str: Vec<u8>,
    units: RefCell<Option<Rc<BTreeMap<u64, Rc<Unit>>>>>,
    aranges: RefCell<Option<Rc<Vec<ArangeSet>>>>,
    pubnames: RefCell<Option<Rc<Vec<PubnameUnit>>>>,
    debug_frame: RefCell<Option<Option<Rc<FrameInfo>>>>,
    eh_frame: RefCell<Option<Option<Rc<FrameInfo>>>>,
}

fn section_ref(elf: &ElfImage, name: &str) -> Option<SectionRef> {
    elf.section(name).map(|shdr| SectionRef {
        offset: shdr.sh_offset,
        size: shdr.sh_size,
    })
}

impl DwarfInfo {
    pub fn new(elf: Arc<ElfImage>) -> Result<Rc<Self>> {
        let debug_str = match elf.section(".debug_str") {
            Some(shdr) => {
                let mut bytes = vec![0u8; shdr.sh_size as usize];
                elf.source().read_exact_at(shdr.sh_offset, &mut bytes)?;
                bytes
            }
            None => Vec::new(),
        };

        Ok(Rc::new(DwarfInfo {
            info: section_ref(&elf, ".debug_info"),
            abbrev: section_ref(&elf, ".debug_abbrev"),
            lineshdr: section_ref(&elf, ".debug_line"),
            arangesh: section_ref(&elf, ".debug_aranges"),
            pubnamesh: section_ref(&elf, ".debug_pubnames"),
            debug_frame_sect: section_ref(&elf, ".debug_frame"),
            eh_frame_sect: section_ref(&elf, ".eh_frame"),
            debug_str,
            elf,
            units: RefCell::new(None),
            aranges: RefCell::new(None),
            pubnames: RefCell::new(None),
            debug_frame: RefCell::new(None),
            eh_frame: RefCell::new(None),
        }))
    }

    pub fn elf(&self) -> &Arc<ElfImage> {
        &self.elf
    }

    pub fn units(&self) -> Result<Rc<BTreeMap<u64, Rc<Unit>>>> {
        if let Some(units) = self.units.borrow().as_ref() {
            return Ok(Rc::clone(units));
        }
        let units = Rc::new(self.parse_units()?);
        *self.units.borrow_mut() = Some(Rc::clone(&units));
        Ok(units)
    }

    pub fn unit_at(&self, info_offset: u64) -> Result<Option<Rc<Unit>>> {
        Ok(self.units()?.get(&info_offset).cloned())
    }

    fn parse_units(&self) -> Result<BTreeMap<u64, Rc<Unit>>> {
        let mut units = BTreeMap::new();
        let (info, abbrev) = match (self.info, self.abbrev) {
            (Some(info), Some(abbrev)) => (info, abbrev),
            _ => return Ok(units),
        };
        let mut r = DwarfReader::new(self.elf.source(), info.offset, info.size);
        while !r.at_end() {
            let unit_start = r.offset();
            let offset = unit_start - info.offset;
            let length = r.getlength()?;
            if length == 0 {
                break;
            }
            let next = r.offset() + length;
            let version = r.getu16()?;
            r.version = version;
            let abbrev_off = if version >= 3 {
                r.getuint(8)?
            } else {
                r.getu32()? as u64
            };
            let addr_len = r.getu8()?;
            r.addr_len = addr_len;

            if abbrev_off >= abbrev.size {
                return Err(Error::MalformedSection(
                    ".debug_abbrev".into(),
                    format!("abbreviation offset {abbrev_off:#x} out of bounds"),
                )
                .into());
            }
            let mut abbrev_reader =
                r.sub_reader(abbrev.offset + abbrev_off, abbrev.size - abbrev_off);
            let abbrevs = parse_abbrev_table(&mut abbrev_reader)?;

            let mut unit = Unit {
                offset,
                version,
                addr_len,
                abbrevs,
                entries: Vec::new(),
                roots: Vec::new(),
                by_offset: BTreeMap::new(),
                lines: None,
                total_size: next - unit_start,
            };

            let mut entries_reader = r.sub_reader(r.offset(), next - r.offset());
            entries_reader.version = version;
            entries_reader.addr_len = addr_len;
            let roots = unit.decode_level(&mut entries_reader, unit_start, &self.debug_str)?;
            unit.roots = roots;
            unit.lines = self.build_lines(&unit)?;

            units.insert(offset, Rc::new(unit));
            r.set_offset(next);
        }
        Ok(units)
    }

    fn build_lines(&self, unit: &Unit) -> Result<Option<LineInfo>> {
        let root = match unit.root() {
            Some(root) if root.tag == DW_TAG_COMPILE_UNIT => root,
            _ => return Ok(None),
        };
        let stmt_list = match root.attr(DW_AT_STMT_LIST) {
            Some(value) => value.as_udata()?,
            None => return Ok(None),
        };
        let lineshdr = match self.lineshdr {
            Some(lineshdr) => lineshdr,
            None => {
                warn!("no line number info found for {}", self.elf.describe());
                return Ok(None);
            }
        };
        if stmt_list >= lineshdr.size {
            return Err(Error::MalformedSection(
                ".debug_line".into(),
                format!("statement list offset {stmt_list:#x} out of bounds"),
            )
            .into());
        }
        let comp_dir = root
            .attr(DW_AT_COMP_DIR)
            .and_then(|value| value.as_str().ok().map(String::from));
        let mut r = DwarfReader::new(
            self.elf.source(),
            lineshdr.offset + stmt_list,
            lineshdr.size - stmt_list,
        );
        r.addr_len = unit.addr_len;
        LineInfo::build(&mut r, comp_dir.as_deref()).map(Some)
    }

    pub fn ranges(&self) -> Result<Rc<Vec<ArangeSet>>> {
        if let Some(ranges) = self.aranges.borrow().as_ref() {
            return Ok(Rc::clone(ranges));
        }
        let mut sets = Vec::new();
        if let Some(sect) = self.arangesh {
            let mut r = DwarfReader::new(self.elf.source(), sect.offset, sect.size);
            while !r.at_end() {
                match ArangeSet::parse(&mut r)? {
                    Some(set) => sets.push(set),
                    None => break,
                }
            }
        }
        let sets = Rc::new(sets);
        *self.aranges.borrow_mut() = Some(Rc::clone(&sets));
        Ok(sets)
    }

    pub fn pubnames(&self) -> Result<Rc<Vec<PubnameUnit>>> {
        if let Some(pubnames) = self.pubnames.borrow().as_ref() {
            return Ok(Rc::clone(pubnames));
        }
        let mut units = Vec::new();
        if let Some(sect) = self.pubnamesh {
            let mut r = DwarfReader::new(self.elf.source(), sect.offset, sect.size);
            while !r.at_end() {
                match PubnameUnit::parse(&mut r)? {
                    Some(unit) => units.push(unit),
                    None => break,
                }
            }
        }
        let units = Rc::new(units);
        *self.pubnames.borrow_mut() = Some(Rc::clone(&units));
        Ok(units)
    }

    fn frame_table(
        &self,
        cache: &RefCell<Option<Option<Rc<FrameInfo>>>>,
        sect: Option<SectionRef>,
        fi_type: FiType,
        name: &str,
    ) -> Option<Rc<FrameInfo>> {
        if let Some(cached) = cache.borrow().as_ref() {
            return cached.clone();
        }
        let table = sect.and_then(|sect| {
            match FrameInfo::parse(
                self.elf.source(),
                sect.offset,
                sect.size,
                self.elf.base(),
                fi_type,
            ) {
                Ok(table) => Some(Rc::new(table)),
                Err(err) => {
                    warn!("can't decode {name} for {}: {err}", self.elf.describe());
                    None
                }
            }
        });
        *cache.borrow_mut() = Some(table.clone());
        table
    }

    /// `.debug_frame` unwind table, or None if absent or undecodable.
    pub fn debug_frame(&self) -> Option<Rc<FrameInfo>> {
        self.frame_table(
            &self.debug_frame,
            self.debug_frame_sect,
            FiType::DebugFrame,
            ".debug_frame",
        )
    }

    /// `.eh_frame` unwind table, or None if absent or undecodable.
    pub fn eh_frame(&self) -> Option<Rc<FrameInfo>> {
        self.frame_table(&self.eh_frame, self.eh_frame_sect, FiType::EhFrame, ".eh_frame")
    }

    /// Every `(file, line)` row whose address range covers `addr`.
    pub fn source_from_addr(&self, addr: u64) -> Result<Vec<(FileEntry, i64)>> {
        let mut out = Vec::new();
        let units = self.units()?;
        for set in self.ranges()?.iter() {
            let covered = set
                .ranges
                .iter()
                .any(|&(start, length)| start <= addr && addr < start + length);
            if !covered {
                continue;
            }
            let unit = match units.get(&set.debug_info_offset) {
                Some(unit) => unit,
                None => continue,
            };
            let lines = match &unit.lines {
                Some(lines) => lines,
                None => continue,
            };
            for pair in lines.matrix.windows(2) {
                let (row, next) = (&pair[0], &pair[1]);
                if row.end_sequence {
                    continue;
                }
                if row.addr <= addr && addr < next.addr {
                    if let Some(file) = lines.files.get(row.file) {
                        out.push((file.clone(), row.line));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Find the `subprogram` DIE covering `addr`, searching the units the
    /// aranges nominate, or every unit when there are no aranges.
    pub fn function_at(&self, addr: u64) -> Result<Option<(Rc<Unit>, usize)>> {
        let units = self.units()?;
        let ranges = self.ranges()?;
        let mut candidates: Vec<Rc<Unit>> = Vec::new();
        if ranges.is_empty() {
            candidates.extend(units.values().cloned());
        } else {
            for set in ranges.iter() {
                let covered = set
                    .ranges
                    .iter()
                    .any(|&(start, length)| start <= addr && addr < start + length);
                if covered {
                    if let Some(unit) = units.get(&set.debug_info_offset) {
                        candidates.push(Rc::clone(unit));
                    }
                }
            }
        }
        for unit in candidates {
            for &root in unit.roots() {
                if let Some(idx) = find_func_entry(&unit, root, addr) {
                    return Ok(Some((unit, idx)));
                }
            }
        }
        Ok(None)
    }

    /// Name of an entry, chasing specification/abstract-origin references.
    pub fn entry_name(&self, unit: &Rc<Unit>, idx: usize) -> Result<Option<String>> {
        let entry = unit.entry(idx);
        if let Some(value) = entry.attr(DW_AT_NAME) {
            return Ok(Some(value.as_str()?.to_string()));
        }
        if let Some(value) = entry.attr(DW_AT_LINKAGE_NAME) {
            return Ok(Some(value.as_str()?.to_string()));
        }
        for attr in [DW_AT_SPECIFICATION, DW_AT_ABSTRACT_ORIGIN] {
            if let Some(value) = entry.attr(attr) {
                if let Some((unit, idx)) = self.resolve_reference(unit, value)? {
                    return self.entry_name(&unit, idx);
                }
            }
        }
        Ok(None)
    }

    /// Resolve a reference-valued attribute to `(unit, entry index)`.
    pub fn resolve_reference(
        &self,
        unit: &Rc<Unit>,
        value: &AttrValue,
    ) -> Result<Option<(Rc<Unit>, usize)>> {
        match value {
            AttrValue::Ref(offset) => {
                Ok(unit.index_at(*offset).map(|idx| (Rc::clone(unit), idx)))
            }
            AttrValue::RefAddr(section_offset) => {
                let units = self.units()?;
                for candidate in units.values() {
                    if *section_offset >= candidate.offset
                        && *section_offset < candidate.offset + candidate.total_size
                    {
                        let rel = section_offset - candidate.offset;
                        return Ok(candidate
                            .index_at(rel)
                            .map(|idx| (Rc::clone(candidate), idx)));
                    }
                }
                Ok(None)
            }
            other => bail!("attribute is not a reference: {other:?}"),
        }
    }
}

/// Depth-first hunt for a subprogram whose code range covers `addr`.
/// Subprogram subtrees are not descended into.
fn find_func_entry(unit: &Unit, idx: usize, addr: u64) -> Option<usize> {
    let entry = unit.entry(idx);
    if entry.tag == DW_TAG_SUBPROGRAM {
        if entry.contains_address(addr) {
            return Some(idx);
        }
        return None;
    }
    for &child in &entry.children {
        if let Some(found) = find_func_entry(unit, child, addr) {
            return Some(found);
        }
    }
    None
}
