//! Cross-reference repair after placement: header table order, `.dynamic`
//! tag addresses, and symbol section indices.

use std::collections::HashMap;

use elf::abi::*;

use super::{ElfRewriter, DT_MIPS_RLD_MAP_REL, DT_MIPS_XHASH, SHN_LORESERVE};
use crate::class::ElfClass;
use crate::error::{parse_error, Error};
use crate::Result;

impl<C: ElfClass> ElfRewriter<C> {
    pub(crate) fn sort_phdrs(&mut self) {
        self.phdrs.sort_by_key(|phdr| phdr.p_offset);
    }

    /// Sorts the section headers (excluding index 0) by file offset.
    ///
    /// `sh_link` and `sh_info` are table indices, so their targets are
    /// remembered by section name across the sort; the `.shstrtab` index in
    /// the ELF header is re-found by offset identity, since several sections
    /// may share its name.
    pub(crate) fn sort_shdrs(&mut self) -> Result<()> {
        let mut linkage: HashMap<String, String> = HashMap::new();
        for i in 1..self.shdrs.len() {
            if self.shdrs[i].sh_link != 0 {
                let target = self
                    .shdrs
                    .get(self.shdrs[i].sh_link as usize)
                    .ok_or_else(|| parse_error("sh_link out of bounds"))?;
                linkage.insert(self.section_name(&self.shdrs[i])?, self.section_name(target)?);
            }
        }

        let mut info: HashMap<String, String> = HashMap::new();
        for i in 1..self.shdrs.len() {
            let shdr = self.shdrs[i];
            if shdr.sh_info != 0 && (shdr.sh_type == SHT_REL || shdr.sh_type == SHT_RELA) {
                let target = self
                    .shdrs
                    .get(shdr.sh_info as usize)
                    .ok_or_else(|| parse_error("sh_info out of bounds"))?;
                info.insert(self.section_name(&shdr)?, self.section_name(target)?);
            }
        }

        let shstrtab = *self
            .shdrs
            .get(usize::from(self.ehdr.e_shstrndx))
            .ok_or_else(|| parse_error("string table index out of bounds"))?;

        self.shdrs[1..].sort_by_key(|shdr| shdr.sh_offset);

        for i in 1..self.shdrs.len() {
            if self.shdrs[i].sh_link != 0 {
                let name = self.section_name(&self.shdrs[i])?;
                let new_link = linkage
                    .get(&name)
                    .map(|target| self.section_index(target))
                    .unwrap_or(0);
                self.shdrs[i].sh_link = new_link as u32;
            }
        }

        for i in 1..self.shdrs.len() {
            let shdr = self.shdrs[i];
            if shdr.sh_info != 0 && (shdr.sh_type == SHT_REL || shdr.sh_type == SHT_RELA) {
                let name = self.section_name(&shdr)?;
                if let Some(target) = info.get(&name) {
                    self.shdrs[i].sh_info = self.section_index(target) as u32;
                }
            }
        }

        for i in 1..self.shdrs.len() {
            if self.shdrs[i].sh_offset == shstrtab.sh_offset {
                self.ehdr.e_shstrndx = i as u16;
            }
        }

        Ok(())
    }

    /// Writes the header tables back to the image and retargets everything
    /// that names a section by address or index: `PT_PHDR`, the `.dynamic`
    /// tags, and the symbol tables.
    pub(crate) fn rewrite_headers(&mut self, phdr_address: u64) -> Result<()> {
        // There can be at most one segment describing the PHT itself.
        let pht_bytes = self.phdrs.len() as u64 * C::PHDR_SIZE;
        for phdr in &mut self.phdrs {
            if phdr.p_type == PT_PHDR {
                phdr.p_offset = self.ehdr.e_phoff;
                phdr.p_vaddr = phdr_address;
                phdr.p_paddr = phdr_address;
                phdr.p_filesz = pht_bytes;
                phdr.p_memsz = pht_bytes;
                break;
            }
        }

        if !self.opts.no_sort {
            self.sort_phdrs();
        }

        for (i, phdr) in self.phdrs.iter().enumerate() {
            C::write_phdr(
                &mut self.image,
                self.ehdr.e_phoff + i as u64 * C::PHDR_SIZE,
                phdr,
            )?;
        }

        debug_assert_eq!(usize::from(self.ehdr.e_shnum), self.shdrs.len());
        if !self.opts.no_sort {
            self.sort_shdrs()?;
        }
        for i in 1..self.shdrs.len() {
            C::write_shdr(
                &mut self.image,
                self.ehdr.e_shoff + i as u64 * C::SHDR_SIZE,
                &self.shdrs[i],
            )?;
        }

        // Update the virtual addresses stored in the .dynamic section. Not
        // every executable has one.
        if let Some(shdr_dynamic) = self.try_find_section(".dynamic") {
            let count = shdr_dynamic.sh_size / C::DYN_SIZE;
            for entry in 0..count {
                let off = shdr_dynamic.sh_offset + entry * C::DYN_SIZE;
                let mut dyn_ent = C::read_dyn(&self.image, off)?;
                if dyn_ent.d_tag == DT_NULL {
                    break;
                }

                let new_val = match dyn_ent.d_tag {
                    DT_STRTAB => Some(self.find_section(".dynstr")?.sh_addr),
                    DT_STRSZ => Some(self.find_section(".dynstr")?.sh_size),
                    DT_SYMTAB => Some(self.find_section(".dynsym")?.sh_addr),
                    DT_HASH => Some(self.find_section(".hash")?.sh_addr),
                    // Stripped binaries may lack the section; leave the tag be.
                    DT_GNU_HASH => self.try_find_section(".gnu.hash").map(|s| s.sh_addr),
                    DT_MIPS_XHASH => Some(self.find_section(".MIPS.xhash")?.sh_addr),
                    DT_JMPREL => {
                        let shdr = self
                            .try_find_section(".rel.plt")
                            .or_else(|| self.try_find_section(".rela.plt"))
                            .or_else(|| self.try_find_section(".rela.IA_64.pltoff"))
                            .ok_or_else(|| Error::MissingSection {
                                msg: "cannot find section corresponding to DT_JMPREL".into(),
                            })?;
                        Some(shdr.sh_addr)
                    }
                    DT_REL => self
                        .try_find_section(".rel.dyn")
                        .or_else(|| self.try_find_section(".rel.got"))
                        .map(|s| s.sh_addr),
                    DT_RELA => self.try_find_section(".rela.dyn").map(|s| s.sh_addr),
                    DT_VERNEED => Some(self.find_section(".gnu.version_r")?.sh_addr),
                    DT_VERSYM => Some(self.find_section(".gnu.version")?.sh_addr),
                    DT_MIPS_RLD_MAP_REL => {
                        // The tag stores the offset of the debug pointer
                        // relative to the tag's own address.
                        if let Some(rld_map) = self.try_find_section(".rld_map") {
                            let dyn_offset = entry * C::DYN_SIZE;
                            Some(
                                rld_map
                                    .sh_addr
                                    .wrapping_sub(dyn_offset)
                                    .wrapping_sub(shdr_dynamic.sh_addr),
                            )
                        } else {
                            // A file with the tag but no .rld_map is already
                            // broken; the loader still needs somewhere to
                            // write the debug pointer.
                            log::warn!(
                                "DT_MIPS_RLD_MAP_REL entry is present, but .rld_map section is not"
                            );
                            Some(0)
                        }
                    }
                    _ => None,
                };

                if let Some(val) = new_val {
                    dyn_ent.d_val = val;
                    C::write_dyn(&mut self.image, off, &dyn_ent)?;
                }
            }
        }

        // Symbol entries carry section indices, which the sorts above have
        // invalidated; translate them through the names captured at parse
        // time. STT_SECTION symbols also carry their section's address.
        for i in 1..self.shdrs.len() {
            let shdr = self.shdrs[i];
            if shdr.sh_type != SHT_SYMTAB && shdr.sh_type != SHT_DYNSYM {
                continue;
            }
            log::debug!("rewriting symbol table section {}", i);
            let count = shdr.sh_size / C::SYM_SIZE;
            for entry in 0..count {
                let off = shdr.sh_offset + entry * C::SYM_SIZE;
                let mut sym = C::read_sym(&self.image, off)?;
                let shndx = u32::from(sym.st_shndx);
                if shndx == SHN_UNDEF as u32 || shndx >= SHN_LORESERVE as u32 {
                    continue;
                }
                if shndx as usize >= self.sections_by_old_index.len() {
                    log::warn!(
                        "entry {} in symbol table refers to a non-existent section, skipping",
                        shndx
                    );
                    continue;
                }
                let section = &self.sections_by_old_index[shndx as usize];
                debug_assert!(!section.is_empty());
                let new_index = self.section_index(section);
                sym.st_shndx = new_index as u16;
                if u32::from(sym.st_info & 0xf) == u32::from(STT_SECTION) {
                    sym.st_value = self.shdrs[new_index].sh_addr;
                }
                C::write_sym(&mut self.image, off, &sym)?;
            }
        }

        C::write_ehdr(&mut self.image, 0, &self.ehdr)
    }
}
