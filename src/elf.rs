use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::libc::{Elf64_Ehdr, Elf64_Phdr, Elf64_Shdr, Elf64_Sym};
use tracing::debug;

use crate::error::Error;
use crate::reader::{ByteSource, DwarfReader, FileSource};

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;

pub const SHF_ALLOC: u64 = 0x2;

pub const STT_NOTYPE: u8 = 0;
pub const STT_FUNC: u8 = 2;

pub const ET_CORE: u16 = 4;

pub const NT_GNU_BUILD_ID: u32 = 3;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

/// Extract the symbol type from st_info (lower 4 bits).
#[inline]
pub fn elf64_st_type(st_info: u8) -> u8 {
    st_info & 0xf
}

/// A symbol resolved out of `.dynsym` or `.symtab`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub shndx: u16,
    pub name: String,
}

/// Read a plain-data struct out of a byte source.
///
/// # Safety
/// `T` must be valid for any bit pattern (the `Elf64_*` record types are).
fn read_pod<T: Copy>(source: &dyn ByteSource, offset: u64) -> Result<T> {
    let mut value = mem::MaybeUninit::<T>::uninit();
    let buf = unsafe {
        std::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, mem::size_of::<T>())
    };
    source.read_exact_at(offset, buf)?;
    Ok(unsafe { value.assume_init() })
}

/// A note found in a PT_NOTE segment.
pub struct Note {
    pub name: String,
    pub ntype: u32,
    pub desc: Vec<u8>,
}

struct SymHash {
    buckets: Vec<u32>,
    chains: Vec<u32>,
    sym_offset: u64,
    str_offset: u64,
}

/// A parsed ELF object: headers eagerly, everything else looked up through
/// the byte source on demand. Headers are immutable once constructed; the
/// debug companion is resolved at most once.
pub struct ElfImage {
    source: Arc<dyn ByteSource>,
    pub header: Elf64_Ehdr,
    pub program_headers: Vec<Elf64_Phdr>,
    pub section_headers: Vec<Elf64_Shdr>,
    section_names: HashMap<String, usize>,
    hash: Option<SymHash>,
    debug_companion: RefCell<Option<Option<Arc<ElfImage>>>>,
}

impl std::fmt::Debug for ElfImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElfImage")
            .field("source", &self.source.describe())
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl ElfImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let source = FileSource::open(&path)
            .with_context(|| format!("opening {}", path.as_ref().display()))?;
        Self::new(Arc::new(source))
    }

    pub fn new(source: Arc<dyn ByteSource>) -> Result<Arc<Self>> {
        let mut magic = [0u8; 16];
        source.read_exact_at(0, &mut magic)?;
        if &magic[..4] != b"\x7fELF" {
            return Err(Error::NotAnElf.into());
        }
        if magic[EI_CLASS] != ELFCLASS64 || magic[EI_DATA] != ELFDATA2LSB {
            return Err(Error::BadHeader("only little-endian ELF64 is handled".into()).into());
        }
        if magic[EI_VERSION] != EV_CURRENT {
            return Err(Error::BadHeader("bad ELF version".into()).into());
        }

        let header: Elf64_Ehdr = read_pod(source.as_ref(), 0)?;

        let mut program_headers = Vec::with_capacity(header.e_phnum as usize);
        if header.e_phnum > 0 && header.e_phentsize as usize != mem::size_of::<Elf64_Phdr>() {
            return Err(Error::BadHeader("bad program header entry size".into()).into());
        }
        let mut off = header.e_phoff;
        for _ in 0..header.e_phnum {
            program_headers.push(read_pod::<Elf64_Phdr>(source.as_ref(), off)?);
            off += header.e_phentsize as u64;
        }

        let mut shnum = header.e_shnum as u64;
        if header.e_shoff != 0 && header.e_shentsize as usize != mem::size_of::<Elf64_Shdr>() {
            return Err(Error::BadHeader("bad section header entry size".into()).into());
        }
        if shnum == 0 && header.e_shoff != 0 {
            // Extension: the real count lives in sh_size of section 0.
            let first: Elf64_Shdr = read_pod(source.as_ref(), header.e_shoff)?;
            shnum = first.sh_size;
        }
        let mut section_headers = Vec::with_capacity(shnum as usize);
        let mut off = header.e_shoff;
        for _ in 0..shnum {
            section_headers.push(read_pod::<Elf64_Shdr>(source.as_ref(), off)?);
            off += header.e_shentsize as u64;
        }

        let mut image = ElfImage {
            source,
            header,
            program_headers,
            section_headers,
            section_names: HashMap::new(),
            hash: None,
            debug_companion: RefCell::new(None),
        };

        if (image.header.e_shstrndx as usize) < image.section_headers.len() {
            let strtab = image.section_headers[image.header.e_shstrndx as usize].sh_offset;
            for i in 0..image.section_headers.len() {
                let name_off = strtab + image.section_headers[i].sh_name as u64;
                let name = image.read_string(name_off)?;
                if !name.is_empty() {
                    image.section_names.insert(name, i);
                }
            }
        }

        image.hash = image.build_hash()?;
        Ok(Arc::new(image))
    }

    pub fn source(&self) -> Arc<dyn ByteSource> {
        Arc::clone(&self.source)
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    pub fn is_core(&self) -> bool {
        self.header.e_type == ET_CORE
    }

    /// Lowest virtual address of any PT_LOAD segment.
    pub fn base(&self) -> u64 {
        self.segments(PT_LOAD)
            .map(|phdr| phdr.p_vaddr)
            .min()
            .unwrap_or(0)
    }

    pub fn segments(&self, p_type: u32) -> impl Iterator<Item = &Elf64_Phdr> {
        self.program_headers
            .iter()
            .filter(move |phdr| phdr.p_type == p_type)
    }

    pub fn section(&self, name: &str) -> Option<&Elf64_Shdr> {
        self.section_names
            .get(name)
            .map(|&idx| &self.section_headers[idx])
    }

    /// A reader spanning exactly the named section, or None if absent.
    pub fn section_reader(&self, name: &str) -> Option<DwarfReader> {
        self.section(name)
            .map(|shdr| DwarfReader::new(Arc::clone(&self.source), shdr.sh_offset, shdr.sh_size))
    }

    pub fn interpreter(&self) -> Result<Option<String>> {
        match self.segments(PT_INTERP).next() {
            Some(phdr) => Ok(Some(self.read_string(phdr.p_offset)?)),
            None => Ok(None),
        }
    }

    /// NUL-terminated string at an absolute file offset.
    pub fn read_string(&self, mut offset: u64) -> Result<String> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = self.source.read_at(offset, &mut chunk)?;
            if n == 0 {
                return Err(Error::ShortRead {
                    source_name: self.source.describe(),
                    offset,
                    wanted: 1,
                }
                .into());
            }
            if let Some(nul) = chunk[..n].iter().position(|&c| c == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk[..n]);
            offset += n as u64;
        }
    }

    pub fn notes(&self) -> Result<Vec<Note>> {
        let mut notes = Vec::new();
        for phdr in self.segments(PT_NOTE) {
            let mut r =
                DwarfReader::new(Arc::clone(&self.source), phdr.p_offset, phdr.p_filesz);
            while !r.at_end() {
                let namesz = r.getu32()? as u64;
                let descsz = r.getu32()? as u64;
                let ntype = r.getu32()?;
                if namesz > phdr.p_filesz || descsz > phdr.p_filesz {
                    return Err(Error::MalformedSection(
                        "PT_NOTE".into(),
                        format!("note sizes {namesz}/{descsz} exceed segment"),
                    )
                    .into());
                }
                let name = if namesz > 0 {
                    let mut nr = r.sub_reader(r.offset(), namesz);
                    nr.getstring().unwrap_or_default()
                } else {
                    String::new()
                };
                r.skip((namesz + 3) & !3);
                let mut desc = vec![0u8; descsz as usize];
                self.source.read_exact_at(r.offset(), &mut desc)?;
                r.skip((descsz + 3) & !3);
                notes.push(Note { name, ntype, desc });
            }
        }
        Ok(notes)
    }

    pub fn build_id(&self) -> Option<Vec<u8>> {
        self.notes()
            .ok()?
            .into_iter()
            .find(|n| n.name == "GNU" && n.ntype == NT_GNU_BUILD_ID)
            .map(|n| n.desc)
    }

    fn sym_table(&self, name: &str) -> Option<(&Elf64_Shdr, u64)> {
        let shdr = self.section(name)?;
        let strtab = self.section_headers.get(shdr.sh_link as usize)?;
        Some((shdr, strtab.sh_offset))
    }

    fn build_hash(&self) -> Result<Option<SymHash>> {
        let hash_shdr = match self.section(".hash") {
            Some(shdr) => shdr,
            None => return Ok(None),
        };
        let syms = match self.section_headers.get(hash_shdr.sh_link as usize) {
            Some(shdr) => shdr,
            None => return Ok(None),
        };
        let strings = match self.section_headers.get(syms.sh_link as usize) {
            Some(shdr) => shdr.sh_offset,
            None => return Ok(None),
        };

        let mut r =
            DwarfReader::new(Arc::clone(&self.source), hash_shdr.sh_offset, hash_shdr.sh_size);
        let nbucket = r.getu32()? as usize;
        let nchain = r.getu32()? as usize;
        let mut buckets = Vec::with_capacity(nbucket);
        for _ in 0..nbucket {
            buckets.push(r.getu32()?);
        }
        let mut chains = Vec::with_capacity(nchain);
        for _ in 0..nchain {
            chains.push(r.getu32()?);
        }
        Ok(Some(SymHash {
            buckets,
            chains,
            sym_offset: syms.sh_offset,
            str_offset: strings,
        }))
    }

    fn hash_lookup(&self, name: &str) -> Result<Option<Symbol>> {
        let hash = match &self.hash {
            Some(hash) => hash,
            None => return Ok(None),
        };
        if hash.buckets.is_empty() {
            return Ok(None);
        }
        let bucket = elf_hash(name) as usize % hash.buckets.len();
        let mut idx = hash.buckets[bucket];
        while idx != 0 {
            let sym: Elf64_Sym = read_pod(
                self.source.as_ref(),
                hash.sym_offset + idx as u64 * mem::size_of::<Elf64_Sym>() as u64,
            )?;
            let candidate = self.read_string(hash.str_offset + sym.st_name as u64)?;
            if candidate == name {
                return Ok(Some(Symbol {
                    value: sym.st_value,
                    size: sym.st_size,
                    info: sym.st_info,
                    shndx: sym.st_shndx,
                    name: candidate,
                }));
            }
            idx = *hash.chains.get(idx as usize).unwrap_or(&0);
        }
        Ok(None)
    }

    fn linear_sym_search(&self, table: &str, name: &str) -> Result<Option<Symbol>> {
        let (shdr, str_offset) = match self.sym_table(table) {
            Some(found) => found,
            None => return Ok(None),
        };
        let entsize = mem::size_of::<Elf64_Sym>() as u64;
        let mut off = shdr.sh_offset;
        let end = shdr.sh_offset + shdr.sh_size;
        while off + entsize <= end {
            let sym: Elf64_Sym = read_pod(self.source.as_ref(), off)?;
            if self.read_string(str_offset + sym.st_name as u64)? == name {
                return Ok(Some(Symbol {
                    value: sym.st_value,
                    size: sym.st_size,
                    info: sym.st_info,
                    shndx: sym.st_shndx,
                    name: name.to_string(),
                }));
            }
            off += entsize;
        }
        Ok(None)
    }

    pub fn find_symbol_by_name(&self, name: &str) -> Result<Option<Symbol>> {
        if let Some(sym) = self.hash_lookup(name)? {
            return Ok(Some(sym));
        }
        if let Some(sym) = self.linear_sym_search(".dynsym", name)? {
            return Ok(Some(sym));
        }
        self.linear_sym_search(".symtab", name)
    }

    /// Find the symbol covering `addr`. A sized symbol whose range contains
    /// the address wins; failing that, the symbol with the greatest value
    /// at or below the address stands in for size-less stubs.
    pub fn find_symbol_by_address(&self, addr: u64, sym_type: u8) -> Result<Option<Symbol>> {
        let mut fallback: Option<Symbol> = None;
        for table in [".dynsym", ".symtab"] {
            let (shdr, str_offset) = match self.sym_table(table) {
                Some(found) => found,
                None => continue,
            };
            let entsize = mem::size_of::<Elf64_Sym>() as u64;
            let mut off = shdr.sh_offset;
            let end = shdr.sh_offset + shdr.sh_size;
            while off + entsize <= end {
                let sym: Elf64_Sym = read_pod(self.source.as_ref(), off)?;
                off += entsize;

                let owner = match self.section_headers.get(sym.st_shndx as usize) {
                    Some(owner) => owner,
                    None => continue,
                };
                if owner.sh_flags & SHF_ALLOC == 0 {
                    continue;
                }
                if sym_type != STT_NOTYPE && elf64_st_type(sym.st_info) != sym_type {
                    continue;
                }
                if sym.st_value > addr {
                    continue;
                }

                if sym.st_size != 0 {
                    if sym.st_value + sym.st_size > addr {
                        return Ok(Some(Symbol {
                            value: sym.st_value,
                            size: sym.st_size,
                            info: sym.st_info,
                            shndx: sym.st_shndx,
                            name: self.read_string(str_offset + sym.st_name as u64)?,
                        }));
                    }
                } else if fallback.as_ref().map_or(0, |f| f.value) < sym.st_value {
                    fallback = Some(Symbol {
                        value: sym.st_value,
                        size: sym.st_size,
                        info: sym.st_info,
                        shndx: sym.st_shndx,
                        name: self.read_string(str_offset + sym.st_name as u64)?,
                    });
                }
            }
        }
        Ok(fallback)
    }

    /// Resolve the separate debug-info companion for this image, searching
    /// `debug_dirs` by build-id and then by `.gnu_debuglink`. The result
    /// (including "none") is cached; failure is never an error.
    pub fn debug_companion(&self, debug_dirs: &[PathBuf]) -> Option<Arc<ElfImage>> {
        if let Some(cached) = self.debug_companion.borrow().as_ref() {
            return cached.clone();
        }
        let found = self.locate_companion(debug_dirs);
        *self.debug_companion.borrow_mut() = Some(found.clone());
        found
    }

    fn locate_companion(&self, debug_dirs: &[PathBuf]) -> Option<Arc<ElfImage>> {
        if let Some(id) = self.build_id() {
            let hex: String = id.iter().map(|b| format!("{b:02x}")).collect();
            if hex.len() > 2 {
                for dir in debug_dirs {
                    let path = dir
                        .join(".build-id")
                        .join(&hex[..2])
                        .join(format!("{}.debug", &hex[2..]));
                    if let Ok(image) = ElfImage::open(&path) {
                        debug!(path = %path.display(), "found debug companion by build-id");
                        return Some(image);
                    }
                }
            }
        }

        if let Some(mut r) = self.section_reader(".gnu_debuglink") {
            if let Ok(link) = r.getstring() {
                for dir in debug_dirs {
                    let path = dir.join(&link);
                    if let Ok(image) = ElfImage::open(&path) {
                        debug!(path = %path.display(), "found debug companion by debuglink");
                        return Some(image);
                    }
                }
            }
        }
        None
    }
}

/// The standard System V ABI symbol hash.
pub fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &c in name.as_bytes() {
        h = (h << 4).wrapping_add(c as u32);
        let g = h & 0xf0000000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}
