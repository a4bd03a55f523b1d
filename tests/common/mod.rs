//! Synthetic ELF images for the end-to-end tests: an executable with
//! symbols, frame info and line info, and a core file carrying thread
//! registers and a stack segment.

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

pub const ET_EXEC: u16 = 2;
pub const ET_CORE: u16 = 4;

pub fn uleb(mut v: u64) -> Vec<u8> {
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

struct Section {
    name: String,
    data: Vec<u8>,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_link: u32,
    sh_entsize: u64,
}

struct Segment {
    p_type: u32,
    vaddr: u64,
    memsz: u64,
    blob: Option<Vec<u8>>,
}

pub struct ImageBuilder {
    e_type: u16,
    entry: u64,
    sections: Vec<Section>,
    symbols: Vec<(String, u64, u64, u8)>,
    segments: Vec<Segment>,
    notes: Vec<u8>,
}

impl ImageBuilder {
    pub fn new(e_type: u16) -> Self {
        Self {
            e_type,
            entry: 0x400000,
            sections: Vec::new(),
            symbols: Vec::new(),
            segments: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn set_entry(&mut self, entry: u64) -> &mut Self {
        self.entry = entry;
        self
    }

    pub fn add_section(&mut self, name: &str, data: Vec<u8>) -> &mut Self {
        self.sections.push(Section {
            name: name.to_string(),
            data,
            sh_type: 1,
            sh_flags: 0,
            sh_addr: 0,
            sh_link: 0,
            sh_entsize: 0,
        });
        self
    }

    pub fn add_symbol(&mut self, name: &str, value: u64, size: u64, sym_type: u8) -> &mut Self {
        self.symbols.push((name.to_string(), value, size, sym_type));
        self
    }

    /// PT_LOAD whose file contents start at offset 0 of the image.
    pub fn add_load_segment(&mut self, vaddr: u64, memsz: u64) -> &mut Self {
        self.segments.push(Segment {
            p_type: 1,
            vaddr,
            memsz,
            blob: None,
        });
        self
    }

    /// PT_LOAD backed by an explicit blob placed in the file.
    pub fn add_load_blob(&mut self, vaddr: u64, blob: Vec<u8>) -> &mut Self {
        self.segments.push(Segment {
            p_type: 1,
            vaddr,
            memsz: blob.len() as u64,
            blob: Some(blob),
        });
        self
    }

    pub fn add_note(&mut self, name: &str, ntype: u32, desc: &[u8]) -> &mut Self {
        self.notes
            .extend_from_slice(&((name.len() + 1) as u32).to_le_bytes());
        self.notes
            .extend_from_slice(&(desc.len() as u32).to_le_bytes());
        self.notes.extend_from_slice(&ntype.to_le_bytes());
        self.notes.extend_from_slice(name.as_bytes());
        self.notes.push(0);
        while self.notes.len() % 4 != 0 {
            self.notes.push(0);
        }
        self.notes.extend_from_slice(desc);
        while self.notes.len() % 4 != 0 {
            self.notes.push(0);
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let text_index = 1u16;

        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; SYM_SIZE];
        for (name, value, size, sym_type) in &self.symbols {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            symtab.extend_from_slice(&name_off.to_le_bytes());
            symtab.push(*sym_type & 0xf);
            symtab.push(0);
            symtab.extend_from_slice(&text_index.to_le_bytes());
            symtab.extend_from_slice(&value.to_le_bytes());
            symtab.extend_from_slice(&size.to_le_bytes());
        }

        let mut specs: Vec<Section> = Vec::new();
        specs.push(Section {
            name: String::new(),
            data: Vec::new(),
            sh_type: 0,
            sh_flags: 0,
            sh_addr: 0,
            sh_link: 0,
            sh_entsize: 0,
        });
        specs.push(Section {
            name: ".text".into(),
            data: Vec::new(),
            sh_type: 1,
            sh_flags: 0x2,
            sh_addr: 0,
            sh_link: 0,
            sh_entsize: 0,
        });
        for s in &self.sections {
            specs.push(Section {
                name: s.name.clone(),
                data: s.data.clone(),
                sh_type: s.sh_type,
                sh_flags: s.sh_flags,
                sh_addr: s.sh_addr,
                sh_link: s.sh_link,
                sh_entsize: s.sh_entsize,
            });
        }
        let symtab_index = specs.len() as u32;
        specs.push(Section {
            name: ".symtab".into(),
            data: symtab,
            sh_type: 2,
            sh_flags: 0,
            sh_addr: 0,
            sh_link: symtab_index + 1,
            sh_entsize: SYM_SIZE as u64,
        });
        specs.push(Section {
            name: ".strtab".into(),
            data: strtab,
            sh_type: 3,
            sh_flags: 0,
            sh_addr: 0,
            sh_link: 0,
            sh_entsize: 0,
        });

        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for spec in &specs {
            if spec.name.is_empty() {
                name_offsets.push(0u32);
            } else {
                name_offsets.push(shstrtab.len() as u32);
                shstrtab.extend_from_slice(spec.name.as_bytes());
                shstrtab.push(0);
            }
        }
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(b".shstrtab\0");
        specs.push(Section {
            name: ".shstrtab".into(),
            data: shstrtab,
            sh_type: 3,
            sh_flags: 0,
            sh_addr: 0,
            sh_link: 0,
            sh_entsize: 0,
        });
        let shstrndx = (specs.len() - 1) as u16;

        let phnum = self.segments.len() + usize::from(!self.notes.is_empty());
        let mut data_off = EHDR_SIZE + phnum * PHDR_SIZE;

        let mut section_offsets = Vec::new();
        for spec in &specs {
            section_offsets.push(data_off as u64);
            data_off += spec.data.len();
        }
        let mut blob_offsets = Vec::new();
        for seg in &self.segments {
            if let Some(blob) = &seg.blob {
                blob_offsets.push(Some(data_off as u64));
                data_off += blob.len();
            } else {
                blob_offsets.push(None);
            }
        }
        let note_off = data_off as u64;
        data_off += self.notes.len();
        let shoff = data_off as u64;

        let mut out = Vec::new();
        out.extend_from_slice(b"\x7fELF");
        out.push(2);
        out.push(1);
        out.push(1);
        out.extend_from_slice(&[0u8; 9]);
        out.extend_from_slice(&self.e_type.to_le_bytes());
        out.extend_from_slice(&62u16.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        out.extend_from_slice(&shoff.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(phnum as u16).to_le_bytes());
        out.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(specs.len() as u16).to_le_bytes());
        out.extend_from_slice(&shstrndx.to_le_bytes());

        for (seg, blob_off) in self.segments.iter().zip(&blob_offsets) {
            let (offset, filesz) = match (&seg.blob, blob_off) {
                (Some(blob), Some(off)) => (*off, blob.len() as u64),
                _ => (0, seg.memsz),
            };
            out.extend_from_slice(&seg.p_type.to_le_bytes());
            out.extend_from_slice(&6u32.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&filesz.to_le_bytes());
            out.extend_from_slice(&seg.memsz.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
        }
        if !self.notes.is_empty() {
            out.extend_from_slice(&4u32.to_le_bytes());
            out.extend_from_slice(&6u32.to_le_bytes());
            out.extend_from_slice(&note_off.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
            out.extend_from_slice(&(self.notes.len() as u64).to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
        }

        for spec in &specs {
            out.extend_from_slice(&spec.data);
        }
        for seg in &self.segments {
            if let Some(blob) = &seg.blob {
                out.extend_from_slice(blob);
            }
        }
        out.extend_from_slice(&self.notes);
        for (i, spec) in specs.iter().enumerate() {
            out.extend_from_slice(&name_offsets[i].to_le_bytes());
            out.extend_from_slice(&spec.sh_type.to_le_bytes());
            out.extend_from_slice(&spec.sh_flags.to_le_bytes());
            out.extend_from_slice(&spec.sh_addr.to_le_bytes());
            out.extend_from_slice(&section_offsets[i].to_le_bytes());
            out.extend_from_slice(&(spec.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&spec.sh_link.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&1u64.to_le_bytes());
            out.extend_from_slice(&spec.sh_entsize.to_le_bytes());
        }
        out
    }
}
