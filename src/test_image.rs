//! Builds minimal ELF64 images in memory for tests.

use crate::elf::elf_hash;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

struct SectionSpec {
    name: String,
    data: Vec<u8>,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_link: u32,
    sh_entsize: u64,
}

pub struct ImageBuilder {
    e_type: u16,
    entry: u64,
    sections: Vec<SectionSpec>,
    symbols: Vec<(String, u64, u64, u8)>,
    loads: Vec<(u64, u64)>,
    notes: Vec<u8>,
    hash: bool,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            e_type: 2, // ET_EXEC
            entry: 0x1000,
            sections: Vec::new(),
            symbols: Vec::new(),
            loads: Vec::new(),
            notes: Vec::new(),
            hash: false,
        }
    }

    pub fn set_type(&mut self, e_type: u16) -> &mut Self {
        self.e_type = e_type;
        self
    }

    pub fn add_section(&mut self, name: &str, data: Vec<u8>) -> &mut Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            data,
            sh_type: 1, // SHT_PROGBITS
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

    pub fn add_load_segment(&mut self, vaddr: u64, memsz: u64) -> &mut Self {
        self.loads.push((vaddr, memsz));
        self
    }

    pub fn add_build_id(&mut self, id: &[u8]) -> &mut Self {
        // name "GNU\0", type NT_GNU_BUILD_ID.
        self.notes.extend_from_slice(&4u32.to_le_bytes());
        self.notes.extend_from_slice(&(id.len() as u32).to_le_bytes());
        self.notes.extend_from_slice(&3u32.to_le_bytes());
        self.notes.extend_from_slice(b"GNU\0");
        self.notes.extend_from_slice(id);
        while self.notes.len() % 4 != 0 {
            self.notes.push(0);
        }
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

    pub fn with_hash_table(&mut self) -> &mut Self {
        self.hash = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        // Section order: NULL, .text, user sections, .symtab, .strtab,
        // [.hash], .shstrtab. The symbols' owning section is .text.
        let text_index = 1u16;

        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; SYM_SIZE]; // null symbol
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

        let mut hash = Vec::new();
        if self.hash {
            let nbucket = 4usize;
            let nchain = self.symbols.len() + 1;
            let mut buckets = vec![0u32; nbucket];
            let mut chains = vec![0u32; nchain];
            for (i, (name, ..)) in self.symbols.iter().enumerate() {
                let sym_index = (i + 1) as u32;
                let b = elf_hash(name) as usize % nbucket;
                chains[sym_index as usize] = buckets[b];
                buckets[b] = sym_index;
            }
            hash.extend_from_slice(&(nbucket as u32).to_le_bytes());
            hash.extend_from_slice(&(nchain as u32).to_le_bytes());
            for word in buckets.iter().chain(chains.iter()) {
                hash.extend_from_slice(&word.to_le_bytes());
            }
        }

        let mut specs: Vec<SectionSpec> = Vec::new();
        specs.push(SectionSpec {
            name: String::new(),
            data: Vec::new(),
            sh_type: 0,
            sh_flags: 0,
            sh_addr: 0,
            sh_link: 0,
            sh_entsize: 0,
        });
        specs.push(SectionSpec {
            name: ".text".into(),
            data: Vec::new(),
            sh_type: 1,
            sh_flags: 0x2,
            sh_addr: 0,
            sh_link: 0,
            sh_entsize: 0,
        });
        for s in &self.sections {
            specs.push(SectionSpec {
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
        let strtab_index = symtab_index + 1;
        specs.push(SectionSpec {
            name: ".symtab".into(),
            data: symtab,
            sh_type: 2, // SHT_SYMTAB
            sh_flags: 0,
            sh_addr: 0,
            sh_link: strtab_index,
            sh_entsize: SYM_SIZE as u64,
        });
        specs.push(SectionSpec {
            name: ".strtab".into(),
            data: strtab,
            sh_type: 3, // SHT_STRTAB
            sh_flags: 0,
            sh_addr: 0,
            sh_link: 0,
            sh_entsize: 0,
        });
        if self.hash {
            specs.push(SectionSpec {
                name: ".hash".into(),
                data: hash,
                sh_type: 5, // SHT_HASH
                sh_flags: 0,
                sh_addr: 0,
                sh_link: symtab_index,
                sh_entsize: 4,
            });
        }

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
        specs.push(SectionSpec {
            name: ".shstrtab".into(),
            data: shstrtab,
            sh_type: 3,
            sh_flags: 0,
            sh_addr: 0,
            sh_link: 0,
            sh_entsize: 0,
        });
        let shstrndx = (specs.len() - 1) as u16;

        let phnum = self.loads.len() + usize::from(!self.notes.is_empty());
        let mut data_off = EHDR_SIZE + phnum * PHDR_SIZE;

        // Lay out section data, then the note blob, then section headers.
        let mut offsets = Vec::new();
        for spec in &specs {
            offsets.push(data_off as u64);
            data_off += spec.data.len();
        }
        let note_off = data_off as u64;
        data_off += self.notes.len();
        let shoff = data_off as u64;

        let mut out = Vec::new();
        // ELF header.
        out.extend_from_slice(b"\x7fELF");
        out.push(2); // ELFCLASS64
        out.push(1); // ELFDATA2LSB
        out.push(1); // EV_CURRENT
        out.extend_from_slice(&[0u8; 9]);
        out.extend_from_slice(&self.e_type.to_le_bytes());
        out.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
        out.extend_from_slice(&shoff.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(phnum as u16).to_le_bytes());
        out.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(specs.len() as u16).to_le_bytes());
        out.extend_from_slice(&shstrndx.to_le_bytes());

        // Program headers.
        for (vaddr, memsz) in &self.loads {
            push_phdr(&mut out, 1, 0, *vaddr, *memsz, *memsz);
        }
        if !self.notes.is_empty() {
            push_phdr(&mut out, 4, note_off, 0, self.notes.len() as u64, 0);
        }

        // Section data, note blob, section headers.
        for spec in &specs {
            out.extend_from_slice(&spec.data);
        }
        out.extend_from_slice(&self.notes);
        for (i, spec) in specs.iter().enumerate() {
            out.extend_from_slice(&name_offsets[i].to_le_bytes());
            out.extend_from_slice(&spec.sh_type.to_le_bytes());
            out.extend_from_slice(&spec.sh_flags.to_le_bytes());
            out.extend_from_slice(&spec.sh_addr.to_le_bytes());
            out.extend_from_slice(&offsets[i].to_le_bytes());
            out.extend_from_slice(&(spec.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&spec.sh_link.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&1u64.to_le_bytes());
            out.extend_from_slice(&spec.sh_entsize.to_le_bytes());
        }
        out
    }
}

fn push_phdr(out: &mut Vec<u8>, p_type: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) {
    out.extend_from_slice(&p_type.to_le_bytes());
    out.extend_from_slice(&6u32.to_le_bytes()); // RW
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&filesz.to_le_bytes());
    out.extend_from_slice(&memsz.to_le_bytes());
    out.extend_from_slice(&0x1000u64.to_le_bytes());
}
