use anyhow::Result;
use tracing::warn;

use crate::error::Error;
use crate::reader::DwarfReader;

const DW_LNS_COPY: u8 = 0x01;
const DW_LNS_ADVANCE_PC: u8 = 0x02;
const DW_LNS_ADVANCE_LINE: u8 = 0x03;
const DW_LNS_SET_FILE: u8 = 0x04;
const DW_LNS_SET_COLUMN: u8 = 0x05;
const DW_LNS_NEGATE_STMT: u8 = 0x06;
const DW_LNS_SET_BASIC_BLOCK: u8 = 0x07;
const DW_LNS_CONST_ADD_PC: u8 = 0x08;
const DW_LNS_FIXED_ADVANCE_PC: u8 = 0x09;

const DW_LNE_END_SEQUENCE: u8 = 0x01;
const DW_LNE_SET_ADDRESS: u8 = 0x02;
const DW_LNE_SET_DISCRIMINATOR: u8 = 0x04;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub directory: String,
    pub last_mod: u64,
    pub length: u64,
}

/// One row of the line matrix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineRow {
    pub addr: u64,
    /// Index into `LineInfo::files`.
    pub file: usize,
    pub line: i64,
    pub column: u64,
    pub is_stmt: bool,
    pub basic_block: bool,
    pub end_sequence: bool,
}

#[derive(Clone)]
struct LineState {
    addr: u64,
    file: usize,
    line: i64,
    column: u64,
    is_stmt: bool,
    basic_block: bool,
    end_sequence: bool,
}

impl LineState {
    fn new(default_is_stmt: bool) -> Self {
        Self {
            addr: 0,
            file: 1,
            line: 1,
            column: 0,
            is_stmt: default_is_stmt,
            basic_block: false,
            end_sequence: false,
        }
    }

    fn row(&self) -> LineRow {
        LineRow {
            addr: self.addr,
            file: self.file,
            line: self.line,
            column: self.column,
            is_stmt: self.is_stmt,
            basic_block: self.basic_block,
            end_sequence: self.end_sequence,
        }
    }
}

/// The decoded line-number program of one compilation unit: header
/// metadata, the file table, and the fully-run matrix.
#[derive(Clone)]
pub struct LineInfo {
    pub default_is_stmt: bool,
    pub opcode_base: u8,
    pub opcode_lengths: Vec<u8>,
    pub directories: Vec<String>,
    pub files: Vec<FileEntry>,
    pub matrix: Vec<LineRow>,
}

impl LineInfo {
    /// Run the program at the reader's position. The reader's `addr_len`
    /// decides the width of `DW_LNE_set_address` operands.
    pub fn build(r: &mut DwarfReader, comp_dir: Option<&str>) -> Result<LineInfo> {
        let total_length = r.getlength()?;
        let end = r.offset() + total_length;
        let version = r.getu16()?;
        r.version = version;
        let prologue_length = if version >= 3 {
            r.getuint(8)?
        } else {
            r.getu32()? as u64
        };
        let expected_end = r.offset() + prologue_length;

        let min_insn_length = r.getu8()? as u64;
        let default_is_stmt = r.getu8()? != 0;
        let line_base = r.gets8()? as i64;
        let line_range = r.getu8()? as u64;
        let opcode_base = r.getu8()?;
        if line_range == 0 {
            return Err(Error::MalformedSection(
                ".debug_line".into(),
                "line_range is zero".into(),
            )
            .into());
        }
        let mut opcode_lengths = Vec::with_capacity(opcode_base.saturating_sub(1) as usize);
        for _ in 1..opcode_base {
            opcode_lengths.push(r.getu8()?);
        }

        // Directory index 0 is the compilation directory.
        let mut directories = Vec::new();
        directories.push(
            comp_dir
                .map(String::from)
                .unwrap_or_else(|| "(compiler CWD)".to_string()),
        );
        loop {
            let dir = r.getstring()?;
            if dir.is_empty() {
                break;
            }
            directories.push(dir);
        }

        // File index 0 is likewise reserved.
        let mut files = Vec::new();
        files.push(FileEntry {
            name: "unknown".into(),
            directory: "unknown".into(),
            last_mod: 0,
            length: 0,
        });
        loop {
            let name = r.getstring()?;
            if name.is_empty() {
                break;
            }
            let dir_index = r.getuleb128()? as usize;
            let last_mod = r.getuleb128()?;
            let length = r.getuleb128()?;
            let directory = directories
                .get(dir_index)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            files.push(FileEntry {
                name,
                directory,
                last_mod,
                length,
            });
        }

        if r.offset() != expected_end {
            warn!(
                "left {} bytes in line info prologue",
                expected_end as i64 - r.offset() as i64
            );
            r.set_offset(expected_end);
        }

        let mut info = LineInfo {
            default_is_stmt,
            opcode_base,
            opcode_lengths,
            directories,
            files,
            matrix: Vec::new(),
        };

        let mut state = LineState::new(default_is_stmt);
        while r.offset() < end {
            let opcode = r.getu8()?;
            if opcode >= opcode_base {
                // Special opcode: advance address and line, emit a row.
                let adjusted = (opcode - opcode_base) as u64;
                state.addr += (adjusted / line_range) * min_insn_length;
                state.line += line_base + (adjusted % line_range) as i64;
                info.matrix.push(state.row());
                state.basic_block = false;
            } else if opcode == 0 {
                let len = r.getuleb128()?;
                let sub = r.getu8()?;
                match sub {
                    DW_LNE_END_SEQUENCE => {
                        state.end_sequence = true;
                        info.matrix.push(state.row());
                        state = LineState::new(default_is_stmt);
                    }
                    DW_LNE_SET_ADDRESS => {
                        state.addr = r.getuint(r.addr_len as usize)?;
                    }
                    DW_LNE_SET_DISCRIMINATOR => {
                        r.getuleb128()?;
                    }
                    _ => {
                        r.skip(len.saturating_sub(1));
                    }
                }
            } else {
                match opcode {
                    DW_LNS_COPY => {
                        info.matrix.push(state.row());
                        state.basic_block = false;
                    }
                    DW_LNS_ADVANCE_PC => {
                        state.addr += r.getuleb128()? * min_insn_length;
                    }
                    DW_LNS_ADVANCE_LINE => {
                        state.line += r.getsleb128()?;
                    }
                    DW_LNS_SET_FILE => {
                        state.file = r.getuleb128()? as usize;
                    }
                    DW_LNS_SET_COLUMN => {
                        state.column = r.getuleb128()?;
                    }
                    DW_LNS_NEGATE_STMT => {
                        state.is_stmt = !state.is_stmt;
                    }
                    DW_LNS_SET_BASIC_BLOCK => {
                        state.basic_block = true;
                    }
                    DW_LNS_CONST_ADD_PC => {
                        let max_advance = (255 - opcode_base) as u64 / line_range;
                        state.addr += max_advance * min_insn_length;
                    }
                    DW_LNS_FIXED_ADVANCE_PC => {
                        state.addr += r.getu16()? as u64 * min_insn_length;
                    }
                    other => {
                        // Unknown standard opcode: its declared operands
                        // are LEB128s to consume and ignore.
                        let count = info
                            .opcode_lengths
                            .get(other as usize - 1)
                            .copied()
                            .unwrap_or(0);
                        for _ in 0..count {
                            r.getuleb128()?;
                        }
                    }
                }
            }
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{ByteSource, MemSource};
    use std::sync::Arc;

    fn uleb(mut v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut b = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            out.push(b);
            if v == 0 {
                return out;
            }
        }
    }

    struct ProgramBuilder {
        opcode_base: u8,
        line_base: i8,
        line_range: u8,
        min_insn_length: u8,
        default_is_stmt: u8,
        program: Vec<u8>,
    }

    impl ProgramBuilder {
        fn new() -> Self {
            Self {
                opcode_base: 13,
                line_base: -3,
                line_range: 12,
                min_insn_length: 1,
                default_is_stmt: 1,
                program: Vec::new(),
            }
        }

        fn op(&mut self, bytes: &[u8]) -> &mut Self {
            self.program.extend_from_slice(bytes);
            self
        }

        fn set_address(&mut self, addr: u64) -> &mut Self {
            self.program.push(0);
            self.program.extend(uleb(9));
            self.program.push(2);
            self.program.extend_from_slice(&addr.to_le_bytes());
            self
        }

        fn end_sequence(&mut self) -> &mut Self {
            self.program.push(0);
            self.program.extend(uleb(1));
            self.program.push(1);
            self
        }

        fn build(&self) -> LineInfo {
            let mut header_rest = Vec::new();
            header_rest.push(self.min_insn_length);
            header_rest.push(self.default_is_stmt);
            header_rest.push(self.line_base as u8);
            header_rest.push(self.line_range);
            header_rest.push(self.opcode_base);
            for _ in 1..self.opcode_base {
                header_rest.push(1);
            }
            header_rest.push(0); // no directories
            header_rest.extend_from_slice(b"a.c\0");
            header_rest.extend(uleb(0));
            header_rest.extend(uleb(0));
            header_rest.extend(uleb(0));
            header_rest.push(0); // end of files

            let mut unit = Vec::new();
            unit.extend_from_slice(&2u16.to_le_bytes()); // version
            unit.extend_from_slice(&(header_rest.len() as u32).to_le_bytes());
            unit.extend_from_slice(&header_rest);
            unit.extend_from_slice(&self.program);

            let mut bytes = Vec::new();
            bytes.extend_from_slice(&(unit.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&unit);

            let src: Arc<dyn ByteSource> = Arc::new(MemSource::new("line", bytes.clone()));
            let mut r = DwarfReader::new(src, 0, bytes.len() as u64);
            LineInfo::build(&mut r, Some("/src")).unwrap()
        }
    }

    #[test]
    fn special_opcode_advances_address_and_line() {
        // opcode 0xf0 = 240: adjusted 227, addr += 227/12 = 18,
        // line += -3 + 227%12 = -3 + 11 = 8.
        let mut b = ProgramBuilder::new();
        b.set_address(0x100).op(&[0xf0]).end_sequence();
        let info = b.build();
        let row = &info.matrix[0];
        assert_eq!(row.addr, 0x100 + 18);
        assert_eq!(row.line, 1 + 8);
        assert!(!row.end_sequence);
    }

    #[test]
    fn const_add_pc_uses_max_special_advance() {
        // (255 - 13) / 12 = 20.
        let mut b = ProgramBuilder::new();
        b.set_address(0)
            .op(&[DW_LNS_CONST_ADD_PC, DW_LNS_COPY])
            .end_sequence();
        let info = b.build();
        assert_eq!(info.matrix[0].addr, 20);
    }

    #[test]
    fn standard_opcodes_update_state() {
        let mut b = ProgramBuilder::new();
        b.set_address(0x10);
        b.op(&[DW_LNS_ADVANCE_PC]).op(&uleb(4));
        b.op(&[DW_LNS_ADVANCE_LINE, 0x05]); // sleb +5
        b.op(&[DW_LNS_SET_COLUMN]).op(&uleb(7));
        b.op(&[DW_LNS_NEGATE_STMT, DW_LNS_SET_BASIC_BLOCK, DW_LNS_COPY]);
        b.end_sequence();
        let info = b.build();
        let row = &info.matrix[0];
        assert_eq!(row.addr, 0x14);
        assert_eq!(row.line, 6);
        assert_eq!(row.column, 7);
        assert!(!row.is_stmt); // negated from default 1
        assert!(row.basic_block);
        // copy clears basic_block for the following row.
        assert!(!info.matrix[1].basic_block);
    }

    #[test]
    fn fixed_advance_pc_reads_u16() {
        let mut b = ProgramBuilder::new();
        b.set_address(0);
        b.op(&[DW_LNS_FIXED_ADVANCE_PC]);
        b.op(&0x230u16.to_le_bytes());
        b.op(&[DW_LNS_COPY]);
        b.end_sequence();
        let info = b.build();
        assert_eq!(info.matrix[0].addr, 0x230);
    }

    #[test]
    fn end_sequence_emits_and_resets() {
        let mut b = ProgramBuilder::new();
        b.set_address(0x40).op(&[0xf0]).end_sequence();
        b.set_address(0x1000).op(&[0x13 + 13]).end_sequence();
        let info = b.build();
        assert_eq!(info.matrix.len(), 4);
        assert!(info.matrix[1].end_sequence);
        // Second sequence starts from pristine state.
        assert_eq!(info.matrix[2].addr, 0x1000 + 1);
        assert_eq!(info.matrix[2].line, 1 - 3 + (0x13 % 12));
    }

    #[test]
    fn unknown_standard_opcode_consumes_declared_args() {
        // Opcodes 10..12 aren't interpreted; their single LEB operands
        // (declared length 1 in the test header) must be skipped.
        let mut b = ProgramBuilder::new();
        b.set_address(0x50);
        b.op(&[10]).op(&uleb(0x7fff)); // would corrupt the stream if unskipped
        b.op(&[DW_LNS_COPY]);
        b.end_sequence();
        let info = b.build();
        assert_eq!(info.matrix[0].addr, 0x50);
    }

    #[test]
    fn unknown_extended_opcode_skips_payload() {
        let mut b = ProgramBuilder::new();
        b.set_address(0x60);
        b.op(&[0]).op(&uleb(5)).op(&[0x7f, 1, 2, 3, 4]); // unknown, 4 payload bytes
        b.op(&[DW_LNS_COPY]);
        b.end_sequence();
        let info = b.build();
        assert_eq!(info.matrix[0].addr, 0x60);
    }

    #[test]
    fn set_discriminator_is_ignored() {
        let mut b = ProgramBuilder::new();
        b.set_address(0x70);
        b.op(&[0]).op(&uleb(2)).op(&[4]).op(&uleb(9)); // set_discriminator 9
        b.op(&[DW_LNS_COPY]);
        b.end_sequence();
        let info = b.build();
        assert_eq!(info.matrix[0].addr, 0x70);
    }

    #[test]
    fn file_table_resolves_directories() {
        let info = ProgramBuilder::new().build();
        assert_eq!(info.directories[0], "/src");
        assert_eq!(info.files[1].name, "a.c");
        assert_eq!(info.files[1].directory, "/src");
    }

    #[test]
    fn matrix_addresses_monotonic_within_sequences() {
        let mut b = ProgramBuilder::new();
        b.set_address(0x100);
        for _ in 0..10 {
            b.op(&[0xf0]);
        }
        b.end_sequence();
        let info = b.build();
        for pair in info.matrix.windows(2) {
            if !pair[0].end_sequence {
                assert!(pair[0].addr <= pair[1].addr);
            }
        }
    }
}
