use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use memmap2::Mmap;

use crate::error::Error;

const PAGE_SIZE: usize = 4096;
const MAX_PAGES: usize = 16;

/// Random-access byte stream: a file, an in-memory buffer, a window into
/// another source, or a live process address space. Sources are immutable
/// for the lifetime of their consumers.
pub trait ByteSource {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes actually read; 0 means end-of-source.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Human-readable identity for diagnostics.
    fn describe(&self) -> String;

    /// Read exactly `buf.len()` bytes or fail with `ShortRead`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_at(offset + done as u64, &mut buf[done..])?;
            if n == 0 {
                return Err(Error::ShortRead {
                    source_name: self.describe(),
                    offset,
                    wanted: buf.len(),
                }
                .into());
            }
            done += n;
        }
        Ok(())
    }
}

pub struct MemSource {
    name: String,
    data: Vec<u8>,
}

impl MemSource {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

impl ByteSource for MemSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let avail = self.data.len() - offset;
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

pub struct FileSource {
    path: PathBuf,
    map: Mmap,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { path, map })
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }
}

impl ByteSource for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.map.len() {
            return Ok(0);
        }
        let avail = self.map.len() - offset;
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&self.map[offset..offset + n]);
        Ok(n)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Restricts a parent source to the window `[offset, offset + length)`.
pub struct OffsetSource {
    upstream: Arc<dyn ByteSource>,
    offset: u64,
    length: u64,
}

impl OffsetSource {
    pub fn new(upstream: Arc<dyn ByteSource>, offset: u64, length: u64) -> Self {
        Self {
            upstream,
            offset,
            length,
        }
    }
}

impl ByteSource for OffsetSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.length {
            return Ok(0);
        }
        let avail = (self.length - offset) as usize;
        let n = buf.len().min(avail);
        self.upstream.read_at(self.offset + offset, &mut buf[..n])
    }

    fn describe(&self) -> String {
        format!(
            "{}[{:#x},{:#x}]",
            self.upstream.describe(),
            self.offset,
            self.offset + self.length
        )
    }
}

struct Page {
    offset: u64,
    len: usize,
    data: Box<[u8; PAGE_SIZE]>,
}

/// LRU page cache in front of a slow source (a process address space).
/// Single-owner: the interior cache state is not guarded.
pub struct CacheSource {
    upstream: Arc<dyn ByteSource>,
    pages: RefCell<VecDeque<Page>>,
}

impl CacheSource {
    pub fn new(upstream: Arc<dyn ByteSource>) -> Self {
        Self {
            upstream,
            pages: RefCell::new(VecDeque::new()),
        }
    }

    fn fill(&self, page_off: u64, out: &mut [u8], skip: usize) -> Result<usize> {
        let mut pages = self.pages.borrow_mut();
        if let Some(idx) = pages.iter().position(|p| p.offset == page_off) {
            let page = pages.remove(idx).unwrap();
            let n = copy_from_page(&page, skip, out);
            pages.push_front(page);
            return Ok(n);
        }

        let mut data = Box::new([0u8; PAGE_SIZE]);
        let len = self.upstream.read_at(page_off, &mut data[..])?;
        let page = Page {
            offset: page_off,
            len,
            data,
        };
        let n = copy_from_page(&page, skip, out);
        pages.push_front(page);
        while pages.len() > MAX_PAGES {
            pages.pop_back();
        }
        Ok(n)
    }
}

fn copy_from_page(page: &Page, skip: usize, out: &mut [u8]) -> usize {
    if skip >= page.len {
        return 0;
    }
    let n = out.len().min(page.len - skip);
    out[..n].copy_from_slice(&page.data[skip..skip + n]);
    n
}

impl ByteSource for CacheSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let at = offset + done as u64;
            let page_off = at & !(PAGE_SIZE as u64 - 1);
            let skip = (at - page_off) as usize;
            let n = self.fill(page_off, &mut buf[done..], skip)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn describe(&self) -> String {
        self.upstream.describe()
    }
}

/// Cursor for decoding DWARF structures out of a byte source. Reads are
/// little-endian and confined to `[off, end)`; `version` and `addr_len`
/// ride along because several DWARF field widths depend on them.
pub struct DwarfReader {
    source: Arc<dyn ByteSource>,
    off: u64,
    end: u64,
    pub version: u16,
    pub addr_len: u8,
}

impl DwarfReader {
    pub fn new(source: Arc<dyn ByteSource>, off: u64, size: u64) -> Self {
        Self {
            source,
            off,
            end: off + size,
            version: 2,
            addr_len: 8,
        }
    }

    /// A reader over `[off, off + size)` of the same source, inheriting
    /// version and address size. Offsets are absolute in the source.
    pub fn sub_reader(&self, off: u64, size: u64) -> DwarfReader {
        DwarfReader {
            source: Arc::clone(&self.source),
            off,
            end: off + size,
            version: self.version,
            addr_len: self.addr_len,
        }
    }

    pub fn source(&self) -> Arc<dyn ByteSource> {
        Arc::clone(&self.source)
    }

    pub fn offset(&self) -> u64 {
        self.off
    }

    pub fn limit(&self) -> u64 {
        self.end
    }

    pub fn set_offset(&mut self, off: u64) {
        self.off = off;
    }

    pub fn skip(&mut self, amount: u64) {
        self.off += amount;
    }

    pub fn at_end(&self) -> bool {
        self.off >= self.end
    }

    fn take(&mut self, n: usize, buf: &mut [u8]) -> Result<()> {
        if self.off + n as u64 > self.end {
            return Err(Error::ShortRead {
                source_name: self.source.describe(),
                offset: self.off,
                wanted: n,
            }
            .into());
        }
        self.source.read_exact_at(self.off, &mut buf[..n])?;
        self.off += n as u64;
        Ok(())
    }

    pub fn getu8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.take(1, &mut b)?;
        Ok(b[0])
    }

    pub fn gets8(&mut self) -> Result<i8> {
        Ok(self.getu8()? as i8)
    }

    pub fn getu16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.take(2, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn getu32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.take(4, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Little-endian unsigned integer of `len` bytes, `len` ∈ {1,2,4,8,16}.
    /// Values wider than 64 bits must fit in the low 8 bytes.
    pub fn getuint(&mut self, len: usize) -> Result<u64> {
        if !matches!(len, 1 | 2 | 4 | 8 | 16) {
            return Err(Error::FormatError(format!("integer of size {len}")).into());
        }
        let mut b = [0u8; 16];
        self.take(len, &mut b)?;
        if len == 16 && b[8..16].iter().any(|&x| x != 0) {
            return Err(Error::FormatError("16-byte integer exceeds 64 bits".into()).into());
        }
        let mut rc = 0u64;
        for i in (0..len.min(8)).rev() {
            rc = rc << 8 | b[i] as u64;
        }
        Ok(rc)
    }

    /// Sign-extending variant of `getuint`.
    pub fn getint(&mut self, len: usize) -> Result<i64> {
        if !matches!(len, 1 | 2 | 4 | 8 | 16) {
            return Err(Error::FormatError(format!("integer of size {len}")).into());
        }
        let mut b = [0u8; 16];
        self.take(len, &mut b)?;
        let used = len.min(8);
        let mut rc: i64 = if b[len - 1] & 0x80 != 0 { -1 } else { 0 };
        for i in (0..used).rev() {
            rc = rc << 8 | b[i] as i64 & 0xff;
        }
        Ok(rc)
    }

    /// ULEB128, also reporting the final shift and the sign bit of the
    /// last payload byte. DWARF 2 encodes some nominally-unsigned fields
    /// with signed producers; callers that care can look at the extras.
    pub fn getuleb128_shift(&mut self) -> Result<(u64, u32, bool)> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.getu8()?;
            if shift >= 64 {
                return Err(Error::FormatError("LEB128 too long".into()).into());
            }
            result |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok((result, shift, byte & 0x40 != 0));
            }
        }
    }

    pub fn getuleb128(&mut self) -> Result<u64> {
        Ok(self.getuleb128_shift()?.0)
    }

    pub fn getsleb128(&mut self) -> Result<i64> {
        let (value, shift, signed) = self.getuleb128_shift()?;
        let mut result = value as i64;
        if signed && shift < 64 {
            result |= -1i64 << shift;
        }
        Ok(result)
    }

    /// NUL-terminated string. Running past the reader's limit without a
    /// terminator is an error, not a truncated result.
    pub fn getstring(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            if self.at_end() {
                return Err(Error::ShortRead {
                    source_name: self.source.describe(),
                    offset: self.off,
                    wanted: 1,
                }
                .into());
            }
            let c = self.getu8()?;
            if c == 0 {
                break;
            }
            bytes.push(c);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// DWARF initial length. `0xffffffff` escapes to a 64-bit length;
    /// the reserved values `0xfffffff0..=0xfffffffe` terminate the
    /// containing enumeration, reported as length 0.
    pub fn getlength(&mut self) -> Result<u64> {
        let length = self.getu32()? as u64;
        if length >= 0xfffffff0 {
            if length == 0xffffffff {
                return self.getuint(8);
            }
            return Ok(0);
        }
        Ok(length)
    }
}
