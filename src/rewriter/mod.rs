//! The rewriting engine.
//!
//! An [`ElfRewriter`] owns one file image for its whole lifetime: it parses
//! the headers into working vectors, accumulates pending section
//! replacements, lays the replacements back out (at the front of executables,
//! at the end of libraries), and repairs every cross-reference the move
//! perturbs before the buffer is handed back.

mod emit;
mod headers;
mod layout;
mod needed;
mod notes;

use std::collections::BTreeMap;
use std::marker::PhantomData;

use elf::abi::*;

use crate::class::{Ehdr, ElfClass, Phdr, Shdr};
use crate::error::{missing_section_error, parse_error};
use crate::image::{Endian, Image};
use crate::Result;

// Identifiers the `elf` crate's `abi` table does not carry.
pub(crate) const EM_ALPHA: u16 = 0x9026;
pub(crate) const EM_TILEGX: u16 = 191;
pub(crate) const EM_LOONGARCH: u16 = 258;
pub(crate) const PT_GNU_PROPERTY: u32 = 0x6474_e553;
pub(crate) const PT_MIPS_ABIFLAGS: u32 = 0x7000_0003;
pub(crate) const DT_MIPS_RLD_MAP_REL: i64 = 0x7000_0035;
pub(crate) const DT_MIPS_XHASH: i64 = 0x7000_0036;
pub(crate) const SHN_LORESERVE: u16 = 0xff00;

/// Minimum alignment applied to relocated sections.
pub(crate) const SECTION_ALIGNMENT: u64 = 8;

/// Rounds `n` up to a multiple of `m`; zero rounds to one full unit.
pub(crate) fn round_up(n: u64, m: u64) -> u64 {
    if n == 0 {
        return m;
    }
    ((n - 1) / m + 1) * m
}

/// Engine configuration. The driver owns these knobs and passes them in
/// explicitly; the engine reads no ambient state.
#[derive(Clone, Debug)]
pub struct RewriteOptions {
    /// Overrides the per-machine minimum page size when set.
    pub page_size: Option<u64>,
    /// Keeps the program and section header tables in their original order
    /// instead of sorting them by file offset.
    pub no_sort: bool,
    /// Fills the vacated bytes of moved sections with `'Z'` so stale
    /// references to the old location show up as garbage.
    pub clobber_old_sections: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        RewriteOptions {
            page_size: None,
            no_sort: false,
            clobber_old_sections: true,
        }
    }
}

/// In-place editor for one ELF image of class `C`.
pub struct ElfRewriter<C: ElfClass> {
    image: Image,
    ehdr: Ehdr,
    phdrs: Vec<Phdr>,
    shdrs: Vec<Shdr>,
    /// Contents of the section-name string table.
    section_names: Vec<u8>,
    /// Old section index -> section name, frozen at parse time so symbol
    /// indices can be translated after the tables are reordered.
    sections_by_old_index: Vec<String>,
    /// Pending replacements keyed by section name; flushed by the planner.
    replaced_sections: BTreeMap<String, Vec<u8>>,
    is_executable: bool,
    changed: bool,
    opts: RewriteOptions,
    _class: PhantomData<C>,
}

impl<C: ElfClass> ElfRewriter<C> {
    /// Validates the ELF header and loads the header tables from `bytes`.
    pub fn new(bytes: Vec<u8>, options: RewriteOptions) -> Result<ElfRewriter<C>> {
        if (bytes.len() as u64) < C::EHDR_SIZE {
            return Err(parse_error("missing ELF header"));
        }
        if bytes[0..4] != ELFMAGIC {
            return Err(parse_error("not an ELF executable"));
        }
        if bytes[EI_CLASS] != C::CLASS {
            return Err(parse_error("file class mismatch"));
        }
        if bytes[EI_VERSION] != EV_CURRENT {
            return Err(parse_error("invalid ELF version"));
        }
        let endian = Endian::from_ei_data(bytes[EI_DATA])
            .ok_or_else(|| parse_error("unknown ELF data encoding"))?;

        let image = Image::new(bytes, endian);
        let ehdr = C::read_ehdr(&image, 0)?;

        if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
            return Err(parse_error("wrong ELF type"));
        }

        let pht_size = u64::from(ehdr.e_phnum)
            .checked_mul(u64::from(ehdr.e_phentsize))
            .ok_or_else(|| parse_error("program header table out of bounds"))?;
        let pht_end = ehdr
            .e_phoff
            .checked_add(pht_size)
            .ok_or_else(|| parse_error("program header table out of bounds"))?;
        if pht_end > image.len() {
            return Err(parse_error("program header table out of bounds"));
        }

        if ehdr.e_shnum == 0 {
            return Err(parse_error(
                "no section headers. The input file is probably a statically linked, \
                 self-decompressing binary",
            ));
        }

        let sht_size = u64::from(ehdr.e_shnum)
            .checked_mul(u64::from(ehdr.e_shentsize))
            .ok_or_else(|| parse_error("section header table out of bounds"))?;
        let sht_end = ehdr
            .e_shoff
            .checked_add(sht_size)
            .ok_or_else(|| parse_error("section header table out of bounds"))?;
        if sht_end > image.len() {
            return Err(parse_error("section header table out of bounds"));
        }

        if u64::from(ehdr.e_phentsize) != C::PHDR_SIZE {
            return Err(parse_error("program headers have wrong size"));
        }
        if u64::from(ehdr.e_shentsize) != C::SHDR_SIZE {
            return Err(parse_error("section headers have wrong size"));
        }

        let mut phdrs = Vec::with_capacity(usize::from(ehdr.e_phnum));
        let mut is_executable = false;
        for i in 0..u64::from(ehdr.e_phnum) {
            let phdr = C::read_phdr(&image, ehdr.e_phoff + i * C::PHDR_SIZE)?;
            if phdr.p_type == PT_INTERP {
                is_executable = true;
            }
            phdrs.push(phdr);
        }

        let mut shdrs = Vec::with_capacity(usize::from(ehdr.e_shnum));
        for i in 0..u64::from(ehdr.e_shnum) {
            shdrs.push(C::read_shdr(&image, ehdr.e_shoff + i * C::SHDR_SIZE)?);
        }

        let shstrndx = usize::from(ehdr.e_shstrndx);
        if shstrndx >= shdrs.len() {
            return Err(parse_error("string table index out of bounds"));
        }
        let strtab_shdr = shdrs[shstrndx];
        if strtab_shdr.sh_size == 0 {
            return Err(parse_error("string table size is zero"));
        }
        let section_names = image
            .slice(strtab_shdr.sh_offset, strtab_shdr.sh_size)?
            .to_vec();
        if section_names.last() != Some(&0) {
            return Err(parse_error("string table is not zero terminated"));
        }

        let mut rewriter = ElfRewriter {
            image,
            ehdr,
            phdrs,
            shdrs,
            section_names,
            sections_by_old_index: Vec::new(),
            replaced_sections: BTreeMap::new(),
            is_executable,
            changed: false,
            opts: options,
            _class: PhantomData,
        };

        let mut by_old_index = vec![String::new(); rewriter.shdrs.len()];
        for (i, slot) in by_old_index.iter_mut().enumerate().skip(1) {
            *slot = rewriter.section_name(&rewriter.shdrs[i])?;
        }
        rewriter.sections_by_old_index = by_old_index;

        Ok(rewriter)
    }

    /// Whether any semantic edit has been applied. Monotonic.
    #[inline]
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Whether the file carries a `PT_INTERP` segment.
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    #[inline]
    pub fn ehdr(&self) -> &Ehdr {
        &self.ehdr
    }

    #[inline]
    pub fn phdrs(&self) -> &[Phdr] {
        &self.phdrs
    }

    #[inline]
    pub fn shdrs(&self) -> &[Shdr] {
        &self.shdrs
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.image.bytes()
    }

    /// Hands the (possibly rewritten) file image back.
    pub fn into_bytes(self) -> Vec<u8> {
        self.image.into_bytes()
    }

    /// Resolves a section header's name from the section-name table.
    pub fn section_name(&self, shdr: &Shdr) -> Result<String> {
        let name_off = shdr.sh_name as usize;
        if name_off >= self.section_names.len() {
            return Err(parse_error("section name offset out of bounds"));
        }
        let bytes = &self.section_names[name_off..];
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Current index of the named section, or 0 when absent.
    pub fn section_index(&self, name: &str) -> usize {
        for i in 1..self.shdrs.len() {
            if let Ok(candidate) = self.section_name(&self.shdrs[i]) {
                if candidate == name {
                    return i;
                }
            }
        }
        0
    }

    pub fn try_find_section(&self, name: &str) -> Option<Shdr> {
        let i = self.section_index(name);
        (i != 0).then(|| self.shdrs[i])
    }

    pub fn find_section(&self, name: &str) -> Result<Shdr> {
        self.try_find_section(name)
            .ok_or_else(|| missing_section_error(name))
    }

    pub(crate) fn has_replaced_section(&self, name: &str) -> bool {
        self.replaced_sections.contains_key(name)
    }

    /// Only `.interp` and non-`SHT_PROGBITS` sections can be moved: arbitrary
    /// code and data carry absolute references into them.
    pub(crate) fn can_replace_section(&self, name: &str) -> Result<bool> {
        let shdr = self.find_section(name)?;
        Ok(name == ".interp" || shdr.sh_type != SHT_PROGBITS)
    }

    /// Queues the named section for replacement and returns its pending
    /// buffer, sized to exactly `size` bytes. A fresh entry starts from the
    /// current on-disk contents; an existing entry is resized in place with
    /// its prefix preserved.
    pub(crate) fn replace_section(&mut self, name: &str, size: u64) -> Result<&mut Vec<u8>> {
        let init = if self.replaced_sections.contains_key(name) {
            None
        } else {
            let shdr = self.find_section(name)?;
            if shdr.sh_type == SHT_NOBITS {
                Some(vec![0u8; shdr.sh_size as usize])
            } else {
                Some(self.image.slice(shdr.sh_offset, shdr.sh_size)?.to_vec())
            }
        };
        let buf = self
            .replaced_sections
            .entry(name.to_string())
            .or_insert_with(|| init.unwrap_or_default());
        buf.resize(size as usize, 0);
        Ok(buf)
    }

    /// The minimum page size for this file's machine, unless overridden.
    ///
    /// There is no authoritative list of per-ABI minimum page sizes; these
    /// values follow GNU gold's `abi_pagesize` table.
    pub(crate) fn page_size(&self) -> u64 {
        if let Some(size) = self.opts.page_size {
            return size;
        }
        match self.ehdr.e_machine {
            EM_ALPHA | EM_IA_64 | EM_MIPS | EM_PPC | EM_PPC64 | EM_AARCH64 | EM_TILEGX
            | EM_LOONGARCH => 0x10000,
            // SPARC32 would be fine with 4KB on Linux, but Solaris uses 8KB.
            EM_SPARC | EM_SPARCV9 => 0x2000,
            _ => 0x1000,
        }
    }
}
