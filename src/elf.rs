// Tue Jan 13 2026 - Alex

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use goblin::elf::{header, section_header, Elf};

use crate::config::PAGE_SIZE;
use crate::error::{FrontendError, Result};

#[derive(Debug, Clone, Copy)]
pub struct SectionInfo {
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub sh_type: u32,
}

/// Result of a symbolic lookup against the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Resolved to a virtual address.
    Addr(u64),
    /// The name exists but the symbol is undefined.
    Undefined,
    /// No section or symbol with this name.
    Missing,
}

/// An ELF executable or shared object, loaded whole into memory.
///
/// The input binary is loaded at base 0; call-target files are stacked
/// above 0x70000000 with page alignment (see `Pipeline`).
pub struct ElfImage {
    path: PathBuf,
    data: Vec<u8>,
    base: u64,
    end: u64,
    dso: bool,
    entry: u64,
    sections: HashMap<String, SectionInfo>,
    symbols: HashMap<String, Lookup>,
}

impl ElfImage {
    pub fn load<P: AsRef<Path>>(path: P, base: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| {
            FrontendError::Elf(format!(
                "failed to open \"{}\": {}",
                path.display(),
                e
            ))
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let elf = Elf::parse(&data)?;
        if elf.header.e_machine != header::EM_X86_64 {
            return Err(FrontendError::Elf(format!(
                "\"{}\" is not an x86-64 binary",
                path.display()
            )));
        }
        match elf.header.e_type {
            header::ET_EXEC | header::ET_DYN => {}
            _ => {
                return Err(FrontendError::Elf(format!(
                    "\"{}\" is not an executable or shared object",
                    path.display()
                )))
            }
        }
        let dso = elf.header.e_type == header::ET_DYN;
        let entry = elf.header.e_entry;

        let mut sections = HashMap::new();
        for sh in &elf.section_headers {
            let name = match elf.shdr_strtab.get_at(sh.sh_name) {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => continue,
            };
            sections.insert(
                name,
                SectionInfo {
                    addr: base + sh.sh_addr,
                    offset: sh.sh_offset,
                    size: sh.sh_size,
                    sh_type: sh.sh_type,
                },
            );
        }

        // Symbol values are image-relative for shared objects; the first
        // definition of a name wins, defined names shadow undefined ones.
        let mut symbols: HashMap<String, Lookup> = HashMap::new();
        let tables = [
            (&elf.syms, &elf.strtab),
            (&elf.dynsyms, &elf.dynstrtab),
        ];
        for (syms, strtab) in tables {
            for sym in syms.iter() {
                let name = match strtab.get_at(sym.st_name) {
                    Some(name) if !name.is_empty() => name,
                    _ => continue,
                };
                let lookup = if sym.st_shndx == 0 {
                    Lookup::Undefined
                } else {
                    Lookup::Addr(base + sym.st_value)
                };
                match symbols.get(name) {
                    Some(Lookup::Addr(_)) => {}
                    _ => {
                        symbols.insert(name.to_string(), lookup);
                    }
                }
            }
        }

        let mut end = base;
        for ph in &elf.program_headers {
            if ph.p_type == goblin::elf::program_header::PT_LOAD {
                end = end.max(base + ph.p_vaddr + ph.p_memsz);
            }
        }

        Ok(Self {
            path,
            data,
            base,
            end,
            dso,
            entry,
            sections,
            symbols,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Highest mapped virtual address; used to stack call-target files.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn is_dso(&self) -> bool {
        self.dso
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.get(name)
    }

    /// The `.text` section, which must exist and be PROGBITS.
    pub fn text_section(&self) -> Result<&SectionInfo> {
        let text = self.sections.get(".text").ok_or_else(|| {
            FrontendError::Elf(
                "failed to disassemble \".text\" section; section not found"
                    .to_string(),
            )
        })?;
        if text.sh_type != section_header::SHT_PROGBITS {
            return Err(FrontendError::Elf(
                "failed to disassemble \".text\" section; section type is \
                 not PROGBITS"
                    .to_string(),
            ));
        }
        Ok(text)
    }

    /// Resolve a section or symbol name to a virtual address.
    pub fn lookup(&self, name: &str) -> Lookup {
        if let Some(section) = self.sections.get(name) {
            return Lookup::Addr(section.addr);
        }
        match self.symbols.get(name) {
            Some(lookup) => *lookup,
            None => Lookup::Missing,
        }
    }

    /// Next page-aligned base address above this image, with a guard gap.
    pub fn next_base(&self) -> u64 {
        let addr = self.end + 2 * PAGE_SIZE;
        addr - addr % PAGE_SIZE
    }
}

/// DSO filename heuristic: `[PATH/]lib*.so[.VERSION]`.
pub fn is_library_filename<P: AsRef<Path>>(path: P) -> bool {
    let name = match path.as_ref().file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    if !name.starts_with("lib") {
        return false;
    }
    let rest = match name.find(".so") {
        Some(i) => &name[i + 3..],
        None => return false,
    };
    if rest.is_empty() {
        return true;
    }
    // Trailing version: dot-separated digit groups.
    rest.starts_with('.')
        && rest[1..]
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// Interpret a `--start`/`--end` position: hex address or symbol name.
pub fn position_to_addr(elf: &ElfImage, option: &str, pos: &str) -> Result<u64> {
    if let Some(hex) = pos.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).map_err(|_| {
            FrontendError::Semantic(format!(
                "bad value for `{}' option; invalid absolute position \
                 string \"{}\"",
                option, pos
            ))
        });
    }
    match elf.lookup(pos) {
        Lookup::Addr(addr) => Ok(addr),
        _ => Err(FrontendError::Semantic(format!(
            "bad value for `{}' option; \"{}\" does not correspond to any \
             section or symbol name",
            option, pos
        ))),
    }
}
