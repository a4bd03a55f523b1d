use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use libc::{c_ulong, c_void, iovec, process_vm_readv};
use nix::libc::user_regs_struct;
use nix::sys::ptrace;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::dwarf::DwarfInfo;
use crate::elf::{ElfImage, PT_DYNAMIC, PT_LOAD};
use crate::reader::{ByteSource, CacheSource};
use crate::unwind::{DwarfRegisters, ThreadStack, UnwindContext};
use crate::Options;

const DT_DEBUG: u64 = 21;
const NT_PRSTATUS: u32 = 1;
const NT_AUXV: u32 = 6;

const AT_ENTRY: u64 = 9;
const AT_EXECFN: u64 = 31;
const AT_SYSINFO: u64 = 32;

// Layout of elf_prstatus on x86-64: the thread id and the register block
// sit at fixed offsets within the note payload.
const PRSTATUS_PID_OFFSET: u64 = 32;
const PRSTATUS_REGS_OFFSET: u64 = 112;
const PRSTATUS_SIZE: usize = 336;

/// Live process address space via `process_vm_readv`.
pub struct ProcessSource {
    pid: Pid,
}

impl ProcessSource {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

impl ByteSource for ProcessSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let local = iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };

        // Split at page boundaries so one unmapped page doesn't fail the
        // whole request.
        let mut remote = Vec::new();
        let mut addr = offset;
        let mut remaining = buf.len();
        while remaining > 0 {
            let in_page = (0x1000 - (addr & 0xfff)) as usize;
            let chunk = remaining.min(in_page);
            remote.push(iovec {
                iov_base: addr as *mut c_void,
                iov_len: chunk,
            });
            addr += chunk as u64;
            remaining -= chunk;
        }

        let rc = unsafe {
            process_vm_readv(
                self.pid.as_raw(),
                &local as *const iovec,
                1,
                remote.as_ptr(),
                remote.len() as c_ulong,
                0,
            )
        };
        if rc < 0 {
            return Err(anyhow::anyhow!(
                "could not read memory of pid {}",
                self.pid
            )
            .context(std::io::Error::last_os_error()));
        }
        Ok(rc as usize)
    }

    fn describe(&self) -> String {
        format!("process {}", self.pid)
    }
}

/// Core-file address space: virtual addresses resolve through the core's
/// PT_LOAD segments; bytes the kernel did not dump read as zero.
pub struct CoreSource {
    core: Arc<ElfImage>,
}

impl CoreSource {
    pub fn new(core: Arc<ElfImage>) -> Self {
        Self { core }
    }
}

impl ByteSource for CoreSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        for phdr in self.core.segments(PT_LOAD) {
            if offset < phdr.p_vaddr || offset >= phdr.p_vaddr + phdr.p_memsz {
                continue;
            }
            let within = offset - phdr.p_vaddr;
            let avail = (phdr.p_memsz - within) as usize;
            let n = buf.len().min(avail);
            if within < phdr.p_filesz {
                let file_avail = ((phdr.p_filesz - within) as usize).min(n);
                self.core
                    .source()
                    .read_exact_at(phdr.p_offset + within, &mut buf[..file_avail])?;
                buf[file_avail..n].iter_mut().for_each(|b| *b = 0);
            } else {
                buf[..n].iter_mut().for_each(|b| *b = 0);
            }
            return Ok(n);
        }
        Ok(0)
    }

    fn describe(&self) -> String {
        self.core.describe()
    }
}

/// One ELF object mapped into the target, at its load bias, with its
/// DWARF (and optionally that of a separate debug companion) created on
/// first use.
pub struct LoadedModule {
    pub reloc: u64,
    pub image: Arc<ElfImage>,
    dwarf: RefCell<Option<Rc<DwarfInfo>>>,
    debug_dwarf: RefCell<Option<Rc<DwarfInfo>>>,
}

impl LoadedModule {
    fn new(reloc: u64, image: Arc<ElfImage>) -> Self {
        Self {
            reloc,
            image,
            dwarf: RefCell::new(None),
            debug_dwarf: RefCell::new(None),
        }
    }

    /// DWARF of the mapped image itself; this carries the frame tables.
    pub fn dwarf(&self) -> Result<Rc<DwarfInfo>> {
        if let Some(dwarf) = self.dwarf.borrow().as_ref() {
            return Ok(Rc::clone(dwarf));
        }
        let dwarf = DwarfInfo::new(Arc::clone(&self.image))?;
        *self.dwarf.borrow_mut() = Some(Rc::clone(&dwarf));
        Ok(dwarf)
    }

    /// DWARF to symbolicate with: the debug companion's when one is
    /// found, otherwise the image's own.
    pub fn debug_dwarf(&self, debug_dirs: &[std::path::PathBuf]) -> Result<Rc<DwarfInfo>> {
        if let Some(dwarf) = self.debug_dwarf.borrow().as_ref() {
            return Ok(Rc::clone(dwarf));
        }
        let dwarf = match self.image.debug_companion(debug_dirs) {
            Some(companion) => DwarfInfo::new(companion)?,
            None => self.dwarf()?,
        };
        *self.debug_dwarf.borrow_mut() = Some(Rc::clone(&dwarf));
        Ok(dwarf)
    }

    fn covers(&self, addr: u64) -> bool {
        self.image.segments(PT_LOAD).any(|phdr| {
            let reloc_addr = addr.wrapping_sub(self.reloc);
            reloc_addr >= phdr.p_vaddr && reloc_addr < phdr.p_vaddr + phdr.p_memsz
        })
    }
}

#[derive(Clone, Debug)]
pub struct ThreadInfo {
    pub tid: u64,
    pub lwp: i32,
    pub thread_type: i32,
    pub regs: DwarfRegisters,
}

/// A stopped target: a live (ptrace-attached) process or a core file,
/// with its loaded modules and per-thread register state.
pub struct Target {
    io: Arc<dyn ByteSource>,
    pub exec: Arc<ElfImage>,
    pub threads: Vec<ThreadInfo>,
    pub sysent: u64,
    pub options: Options,
    modules: Vec<LoadedModule>,
    entry: u64,
    attached: Vec<Pid>,
}

impl Target {
    /// Attach to every thread of a live process and capture its registers.
    pub fn attach(pid: i32, options: &Options) -> Result<Target> {
        let task_dir = format!("/proc/{pid}/task");
        let mut tids: Vec<i32> = fs::read_dir(&task_dir)
            .with_context(|| format!("no such process: {pid}"))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_string_lossy().parse().ok())
            .collect();
        tids.sort_unstable();

        // The guard detaches on any early error below; ownership of the
        // attachments passes to the Target once one exists.
        let mut guard = attach_all(&tids)?;

        let exec = ElfImage::open(format!("/proc/{pid}/exe"))?;
        let io: Arc<dyn ByteSource> =
            Arc::new(CacheSource::new(Arc::new(ProcessSource::new(Pid::from_raw(pid)))));

        let auxv = parse_auxv(&fs::read(format!("/proc/{pid}/auxv")).unwrap_or_default());
        let entry = auxv_value(&auxv, AT_ENTRY).unwrap_or(exec.header.e_entry);
        let sysent = auxv_value(&auxv, AT_SYSINFO).unwrap_or(0);

        let mut threads = Vec::new();
        for &tid in &guard.tids {
            let regs = ptrace::getregs(tid)?;
            threads.push(ThreadInfo {
                tid: tid.as_raw() as u64,
                lwp: tid.as_raw(),
                thread_type: 1,
                regs: DwarfRegisters::from_user_regs(&regs),
            });
        }

        let mut target = Target {
            io,
            exec,
            threads,
            sysent,
            options: options.clone(),
            modules: Vec::new(),
            entry,
            attached: std::mem::take(&mut guard.tids),
        };
        target.load_modules()?;
        Ok(target)
    }

    /// Build a target from a core file. The executable is taken from
    /// `exe` or, failing that, from `AT_EXECFN` in the core's auxv.
    pub fn from_core(core_path: &Path, exe: Option<&Path>, options: &Options) -> Result<Target> {
        let core = ElfImage::open(core_path)?;
        if !core.is_core() {
            bail!("{} is not a core file", core_path.display());
        }

        let io: Arc<dyn ByteSource> =
            Arc::new(CacheSource::new(Arc::new(CoreSource::new(Arc::clone(&core)))));

        let mut auxv = Vec::new();
        for note in core.notes()? {
            if note.ntype == NT_AUXV {
                auxv = parse_auxv(&note.desc);
            }
        }

        let exec = match exe {
            Some(path) => ElfImage::open(path)?,
            None => {
                let addr = auxv_value(&auxv, AT_EXECFN)
                    .context("core has no AT_EXECFN; specify the executable")?;
                let path = read_target_string(io.as_ref(), addr)?;
                ElfImage::open(&path)
                    .with_context(|| format!("executable {path} named by core"))?
            }
        };

        let threads = core_threads(&core)?;
        let entry = auxv_value(&auxv, AT_ENTRY).unwrap_or(exec.header.e_entry);
        let sysent = auxv_value(&auxv, AT_SYSINFO).unwrap_or(0);

        let mut target = Target {
            io,
            exec,
            threads,
            sysent,
            options: options.clone(),
            modules: Vec::new(),
            entry,
            attached: Vec::new(),
        };
        target.load_modules()?;
        Ok(target)
    }

    pub fn io(&self) -> &dyn ByteSource {
        self.io.as_ref()
    }

    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    /// The module whose relocated PT_LOAD segments cover `addr`.
    pub fn find_module(&self, addr: u64) -> Option<&LoadedModule> {
        self.modules.iter().find(|module| module.covers(addr))
    }

    pub fn unwind_thread(&self, thread: &ThreadInfo) -> ThreadStack {
        ThreadStack::unwind(
            self,
            thread.tid,
            thread.lwp,
            thread.thread_type,
            thread.regs,
            self.options.max_frames,
        )
    }

    fn add_module(&mut self, image: Arc<ElfImage>, reloc: u64) {
        debug!(
            "object {} loaded at address {reloc:#x}, base={:#x}",
            image.describe(),
            image.base()
        );
        self.modules.push(LoadedModule::new(reloc, image));
    }

    /// Register the executable and, when the dynamic linker has published
    /// its map, every shared object in the `r_debug` chain.
    fn load_modules(&mut self) -> Result<()> {
        let reloc = self.entry.wrapping_sub(self.exec.header.e_entry);
        let r_debug = self.find_r_debug(reloc)?;
        if r_debug == 0 || r_debug == u64::MAX {
            self.add_module(Arc::clone(&self.exec), reloc);
            return Ok(());
        }
        if let Err(err) = self.walk_link_map(r_debug) {
            warn!("can't walk shared object list: {err}");
            if self.modules.is_empty() {
                self.add_module(Arc::clone(&self.exec), reloc);
            }
        }
        Ok(())
    }

    fn walk_link_map(&mut self, r_debug: u64) -> Result<()> {
        // link_map: l_addr, l_name, l_ld, l_next at 8-byte strides.
        let mut map_addr = read_target_u64(self.io.as_ref(), r_debug + 8)?;
        let first = map_addr;
        let mut seen = 0;
        while map_addr != 0 {
            seen += 1;
            if seen > 4096 {
                warn!("r_debug chain did not terminate; giving up");
                break;
            }
            let l_addr = read_target_u64(self.io.as_ref(), map_addr)?;
            let l_name = read_target_u64(self.io.as_ref(), map_addr + 8)?;
            let l_next = read_target_u64(self.io.as_ref(), map_addr + 24)?;

            if map_addr == first {
                // The head of the chain is the executable itself.
                self.add_module(Arc::clone(&self.exec), l_addr);
                map_addr = l_next;
                continue;
            }

            let mut path = if l_name != 0 {
                read_target_string(self.io.as_ref(), l_name).unwrap_or_default()
            } else {
                String::new()
            };
            if path.is_empty() {
                path = self.exec.interpreter()?.unwrap_or_default();
            }
            let original = path.clone();
            for (from, to) in &self.options.path_replacements {
                if let Some(at) = path.find(from.as_str()) {
                    path.replace_range(at..at + from.len(), to);
                }
            }
            if path != original {
                debug!("replaced {original} with {path}");
            }

            match ElfImage::open(&path) {
                Ok(image) => self.add_module(image, l_addr),
                Err(err) => {
                    warn!("can't load text for '{path}' at {l_addr:#x}: {err}");
                }
            }
            map_addr = l_next;
        }
        Ok(())
    }

    /// Find the dynamic linker's `r_debug` through the executable's
    /// DT_DEBUG slot. The slot value is read from the target's memory,
    /// where the linker has filled it in.
    fn find_r_debug(&self, reloc: u64) -> Result<u64> {
        for phdr in self.exec.segments(PT_DYNAMIC) {
            let mut dyn_off = 0u64;
            while dyn_off + 16 <= phdr.p_filesz {
                let mut tag_bytes = [0u8; 8];
                self.exec
                    .source()
                    .read_exact_at(phdr.p_offset + dyn_off, &mut tag_bytes)?;
                if u64::from_le_bytes(tag_bytes) == DT_DEBUG {
                    // The slot in the file is zero; the linker fills in
                    // the in-memory copy. Unreadable means static-like.
                    let addr = phdr.p_vaddr + dyn_off + reloc + 8;
                    return Ok(read_target_u64(self.io.as_ref(), addr).unwrap_or(0));
                }
                dyn_off += 16;
            }
        }
        Ok(0)
    }
}

impl UnwindContext for Target {
    fn find_dwarf(&self, addr: u64) -> Option<(u64, Rc<DwarfInfo>)> {
        let module = self.find_module(addr)?;
        match module.dwarf() {
            Ok(dwarf) => Some((module.reloc, dwarf)),
            Err(err) => {
                warn!("no DWARF for {}: {err}", module.image.describe());
                None
            }
        }
    }

    fn memory(&self) -> &dyn ByteSource {
        self.io.as_ref()
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        detach_all(&self.attached);
    }
}

/// Threads seized but not yet owned by a `Target`. Dropping the guard
/// detaches whatever it still holds, so a failure part-way through
/// attachment or target construction never leaves a thread stopped.
struct AttachGuard {
    tids: Vec<Pid>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        detach_all(&self.tids);
    }
}

/// Seize every listed thread. A thread joins the guard the moment
/// `ptrace::attach` succeeds, before the stop is reaped, so even a
/// failing `waitpid` leaves nothing behind.
fn attach_all(tids: &[i32]) -> Result<AttachGuard> {
    let mut guard = AttachGuard { tids: Vec::new() };
    for &tid in tids {
        let tid = Pid::from_raw(tid);
        ptrace::attach(tid).with_context(|| format!("attach to {tid}"))?;
        guard.tids.push(tid);
        waitpid(tid, None).with_context(|| format!("wait for {tid} to stop"))?;
    }
    Ok(guard)
}

fn detach_all(attached: &[Pid]) {
    for &tid in attached {
        let _ = ptrace::detach(tid, None);
    }
}

/// Per-thread registers from the core's NT_PRSTATUS notes.
pub fn core_threads(core: &ElfImage) -> Result<Vec<ThreadInfo>> {
    let mut threads = Vec::new();
    for note in core.notes()? {
        if note.ntype != NT_PRSTATUS || note.desc.len() < PRSTATUS_SIZE {
            continue;
        }
        let pid = i32::from_le_bytes(
            note.desc[PRSTATUS_PID_OFFSET as usize..PRSTATUS_PID_OFFSET as usize + 4]
                .try_into()
                .unwrap(),
        );
        let regs_bytes =
            &note.desc[PRSTATUS_REGS_OFFSET as usize..PRSTATUS_REGS_OFFSET as usize + 27 * 8];
        let mut regs = std::mem::MaybeUninit::<user_regs_struct>::uninit();
        let regs = unsafe {
            std::ptr::copy_nonoverlapping(
                regs_bytes.as_ptr(),
                regs.as_mut_ptr() as *mut u8,
                27 * 8,
            );
            regs.assume_init()
        };
        threads.push(ThreadInfo {
            tid: pid as u64,
            lwp: pid,
            thread_type: 1,
            regs: DwarfRegisters::from_user_regs(&regs),
        });
    }
    Ok(threads)
}

pub fn parse_auxv(bytes: &[u8]) -> Vec<(u64, u64)> {
    bytes
        .chunks_exact(16)
        .map(|chunk| {
            (
                u64::from_le_bytes(chunk[..8].try_into().unwrap()),
                u64::from_le_bytes(chunk[8..].try_into().unwrap()),
            )
        })
        .take_while(|&(a_type, _)| a_type != 0)
        .collect()
}

fn auxv_value(auxv: &[(u64, u64)], a_type: u64) -> Option<u64> {
    auxv.iter()
        .find(|&&(t, _)| t == a_type)
        .map(|&(_, value)| value)
}

fn read_target_u64(io: &dyn ByteSource, addr: u64) -> Result<u64> {
    let mut word = [0u8; 8];
    io.read_exact_at(addr, &mut word)?;
    Ok(u64::from_le_bytes(word))
}

fn read_target_string(io: &dyn ByteSource, mut addr: u64) -> Result<String> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        let n = io.read_at(addr, &mut chunk)?;
        if n == 0 {
            bail!("unterminated string in target memory at {addr:#x}");
        }
        if let Some(nul) = chunk[..n].iter().position(|&c| c == 0) {
            out.extend_from_slice(&chunk[..nul]);
            return Ok(String::from_utf8_lossy(&out).into_owned());
        }
        out.extend_from_slice(&chunk[..n]);
        addr += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemSource;
    use crate::test_image::ImageBuilder;
    use crate::unwind::{IP_REG, SP_REG};

    fn prstatus_desc(pid: i32, rip: u64, rsp: u64) -> Vec<u8> {
        let mut desc = vec![0u8; PRSTATUS_SIZE];
        desc[32..36].copy_from_slice(&pid.to_le_bytes());
        // user_regs_struct: rip is the 17th u64, rsp the 20th.
        let regs = PRSTATUS_REGS_OFFSET as usize;
        desc[regs + 16 * 8..regs + 17 * 8].copy_from_slice(&rip.to_le_bytes());
        desc[regs + 19 * 8..regs + 20 * 8].copy_from_slice(&rsp.to_le_bytes());
        desc
    }

    #[test]
    fn core_threads_read_prstatus_notes() {
        let mut b = ImageBuilder::new();
        b.set_type(crate::elf::ET_CORE);
        b.add_note("CORE", NT_PRSTATUS, &prstatus_desc(1234, 0x4005b0, 0x7ffff000));
        b.add_note("CORE", NT_PRSTATUS, &prstatus_desc(1235, 0x400700, 0x7fffe000));
        let core = ElfImage::new(Arc::new(MemSource::new("core", b.build()))).unwrap();

        let threads = core_threads(&core).unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].lwp, 1234);
        assert_eq!(threads[0].regs.reg[IP_REG], 0x4005b0);
        assert_eq!(threads[0].regs.reg[SP_REG], 0x7ffff000);
        assert_eq!(threads[1].lwp, 1235);
    }

    #[test]
    fn core_source_maps_virtual_addresses() {
        // The test core's single PT_LOAD points at file offset 0, so
        // target address 0x400000 reads back the ELF magic.
        let mut b = ImageBuilder::new();
        b.set_type(crate::elf::ET_CORE);
        b.add_load_segment(0x400000, 0x40);
        let core = ElfImage::new(Arc::new(MemSource::new("core", b.build()))).unwrap();
        let src = CoreSource::new(core);

        let mut buf = [0u8; 4];
        assert_eq!(src.read_at(0x400000, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"\x7fELF");
        assert_eq!(src.read_at(0x500000, &mut buf).unwrap(), 0);
    }

    #[test]
    fn auxv_parsing_stops_at_null_entry() {
        let mut bytes = Vec::new();
        for (t, v) in [(AT_ENTRY, 0x400500u64), (AT_SYSINFO, 0xffffe000), (0, 0), (9, 9)] {
            bytes.extend_from_slice(&t.to_le_bytes());
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let auxv = parse_auxv(&bytes);
        assert_eq!(auxv.len(), 2);
        assert_eq!(auxv_value(&auxv, AT_ENTRY), Some(0x400500));
        assert_eq!(auxv_value(&auxv, AT_SYSINFO), Some(0xffffe000));
        assert_eq!(auxv_value(&auxv, AT_EXECFN), None);
    }
}
