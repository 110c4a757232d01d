//! Goblin-based ELF service.
//!
//! The rewriting pipeline only needs a narrow view of the input: section
//! ranges, symbol addresses, and the executable/shared-object classification.
//! Everything is copied into owned maps at parse time so the image can be
//! passed around freely.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use goblin::elf::{header, program_header, Elf};

use crate::{Address, Error, Result};

/// One section of the parsed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    /// Virtual address (load base applied)
    pub addr: Address,
    /// Size in bytes
    pub size: u64,
    /// Offset of the section contents within the file
    pub offset: u64,
    /// ELF section type (SHT_*)
    pub sh_type: u32,
}

/// Result of a symbol/section name lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The name resolves to this address
    Addr(Address),
    /// The symbol exists but is undefined in this image
    Undefined,
    /// No symbol or section of this name exists
    Unknown,
}

/// A parsed ELF image with owned metadata.
#[derive(Debug)]
pub struct ElfImage {
    path: PathBuf,
    data: Vec<u8>,
    base: Address,
    end: Address,
    dso: bool,
    sections: BTreeMap<String, Section>,
    symbols: HashMap<String, Option<Address>>,
}

impl ElfImage {
    /// Read and parse `path`, relocating all addresses by `base`.
    ///
    /// The input binary is parsed with `base == 0`; ELF files hosting call
    /// targets are stacked at non-zero bases by the orchestrator.
    pub fn open(path: impl AsRef<Path>, base: Address) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path).map_err(|e| Error::Elf {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;
        let elf = Elf::parse(&data).map_err(|e| Error::Elf {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;

        let dso = elf.header.e_type == header::ET_DYN;

        let mut sections = BTreeMap::new();
        for sh in &elf.section_headers {
            if let Some(name) = elf.shdr_strtab.get_at(sh.sh_name) {
                sections.insert(
                    name.to_string(),
                    Section {
                        addr: base + sh.sh_addr,
                        size: sh.sh_size,
                        offset: sh.sh_offset,
                        sh_type: sh.sh_type,
                    },
                );
            }
        }

        // Defined symbols win over undefined ones of the same name.
        let mut symbols: HashMap<String, Option<Address>> = HashMap::new();
        let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
        for (syms, strtab) in tables {
            for sym in syms.iter() {
                let Some(name) = strtab.get_at(sym.st_name) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                let value = if sym.st_shndx == 0 {
                    None
                } else {
                    Some(base + sym.st_value)
                };
                match symbols.get(name) {
                    Some(Some(_)) => {}
                    _ => {
                        symbols.insert(name.to_string(), value);
                    }
                }
            }
        }

        let end = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == program_header::PT_LOAD)
            .map(|ph| base + ph.p_vaddr + ph.p_memsz)
            .max()
            .unwrap_or(base);

        Ok(ElfImage {
            path,
            data,
            base,
            end,
            dso,
            sections,
            symbols,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filename as passed on the command line or in the action string.
    pub fn filename(&self) -> String {
        self.path.display().to_string()
    }

    /// The raw file contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn base(&self) -> Address {
        self.base
    }

    /// End of the highest PT_LOAD segment (used to stack call-target files).
    pub fn end(&self) -> Address {
        self.end
    }

    /// ELF type is ET_DYN.
    pub fn is_dyn(&self) -> bool {
        self.dso
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    /// Resolve a symbol or section name to an address.
    pub fn lookup(&self, name: &str) -> Lookup {
        match self.symbols.get(name) {
            Some(Some(addr)) => return Lookup::Addr(*addr),
            Some(None) => return Lookup::Undefined,
            None => {}
        }
        match self.sections.get(name) {
            Some(section) => Lookup::Addr(section.addr),
            None => Lookup::Unknown,
        }
    }
}

/// Filename heuristic for shared objects: `lib*.so` or `lib*.so.VERSION`.
pub fn is_library_filename(path: &str) -> bool {
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.starts_with("lib") && (name.ends_with(".so") || name.contains(".so."))
}

/// Convert a `--start`/`--end` position (hex address or symbol) into an
/// address.
pub fn parse_position(elf: &ElfImage, option: &str, pos: &str) -> Result<Address> {
    if let Some(hex) = pos.strip_prefix("0x").or_else(|| pos.strip_prefix("0X")) {
        return Address::from_str_radix(hex, 16).map_err(|_| {
            Error::Usage(format!(
                "bad value for `{option}' option; invalid absolute position string \"{pos}\""
            ))
        });
    }
    match elf.lookup(pos) {
        Lookup::Addr(addr) => Ok(addr),
        _ => Err(Error::Usage(format!(
            "bad value for `{option}' option; \"{pos}\" does not correspond to any section or \
             symbol name"
        ))),
    }
}
