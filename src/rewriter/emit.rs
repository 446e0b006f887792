//! Flushing the section-edit table into its new file locations.

use std::collections::HashSet;
use std::mem;

use elf::abi::*;

use super::{round_up, ElfRewriter, PT_GNU_PROPERTY, PT_MIPS_ABIFLAGS, SECTION_ALIGNMENT};
use crate::class::ElfClass;
use crate::error::layout_error;
use crate::Result;

impl<C: ElfClass> ElfRewriter<C> {
    /// Copies every pending replacement to `*cur_off` onward, updates the
    /// section headers, and keeps the segment descriptors keyed by section
    /// name or type in sync. `start_addr`/`start_offset` anchor the virtual
    /// addresses of the new region. Clears the edit table.
    pub(crate) fn write_replaced_sections(
        &mut self,
        cur_off: &mut u64,
        start_addr: u64,
        start_offset: u64,
    ) -> Result<()> {
        if self.opts.clobber_old_sections {
            // 'Z'-fill the vacated regions before writing any new contents so
            // a replacement landing on top of an old location is not wiped.
            let names: Vec<String> = self.replaced_sections.keys().cloned().collect();
            for name in names {
                let shdr = self.find_section(&name)?;
                if shdr.sh_type != SHT_NOBITS {
                    self.image.fill(shdr.sh_offset, shdr.sh_size, b'Z')?;
                }
            }
        }

        let replaced = mem::take(&mut self.replaced_sections);
        let mut noted_phdrs: HashSet<usize> = HashSet::new();

        // Walk the headers in table order so the relative position between
        // replaced sections stays the same.
        for i in 0..self.shdrs.len() {
            let name = self.section_name(&self.shdrs[i])?;
            let Some(data) = replaced.get(&name) else {
                continue;
            };

            let orig_shdr = self.shdrs[i];
            log::debug!(
                "rewriting section '{}' from offset 0x{:x} (size {}) to offset 0x{:x} (size {})",
                name,
                orig_shdr.sh_offset,
                orig_shdr.sh_size,
                cur_off,
                data.len()
            );

            self.image.copy_from(*cur_off, data)?;

            let shdr = &mut self.shdrs[i];
            shdr.sh_offset = *cur_off;
            shdr.sh_addr = start_addr + (*cur_off - start_offset);
            shdr.sh_size = data.len() as u64;
            shdr.sh_addralign = SECTION_ALIGNMENT;
            let (new_off, new_addr, new_size) = (shdr.sh_offset, shdr.sh_addr, shdr.sh_size);

            if name == ".interp" {
                for phdr in self.phdrs.iter_mut().filter(|p| p.p_type == PT_INTERP) {
                    phdr.p_offset = new_off;
                    phdr.p_vaddr = new_addr;
                    phdr.p_paddr = new_addr;
                    phdr.p_filesz = new_size;
                    phdr.p_memsz = new_size;
                }
            } else if name == ".dynamic" {
                for phdr in self.phdrs.iter_mut().filter(|p| p.p_type == PT_DYNAMIC) {
                    phdr.p_offset = new_off;
                    phdr.p_vaddr = new_addr;
                    phdr.p_paddr = new_addr;
                    phdr.p_filesz = new_size;
                    phdr.p_memsz = new_size;
                }
            }

            if orig_shdr.sh_type == SHT_NOTE {
                // Note contents are parsed according to the section alignment;
                // keep the original when it is smaller.
                if orig_shdr.sh_addralign < SECTION_ALIGNMENT {
                    self.shdrs[i].sh_addralign = orig_shdr.sh_addralign;
                }

                // After normalisation each PT_NOTE maps exactly one section,
                // so bind the first segment whose extent matches and leave it
                // out of consideration for later note sections.
                for j in 0..self.phdrs.len() {
                    let phdr = &mut self.phdrs[j];
                    if phdr.p_type != PT_NOTE || noted_phdrs.contains(&j) {
                        continue;
                    }
                    let p_start = phdr.p_offset;
                    let p_end = p_start + phdr.p_filesz;
                    let s_start = orig_shdr.sh_offset;
                    let s_end = s_start + orig_shdr.sh_size;

                    if !(s_start >= p_start && s_start < p_end)
                        && !(s_end > p_start && s_end <= p_end)
                    {
                        continue;
                    }
                    if p_start != s_start || p_end != s_end {
                        return Err(layout_error("unsupported overlap of SHT_NOTE and PT_NOTE"));
                    }

                    phdr.p_offset = new_off;
                    phdr.p_vaddr = new_addr;
                    phdr.p_paddr = new_addr;
                    phdr.p_filesz = new_size;
                    phdr.p_memsz = new_size;
                    noted_phdrs.insert(j);
                }
            }

            if name == ".MIPS.abiflags" {
                for phdr in self.phdrs.iter_mut().filter(|p| p.p_type == PT_MIPS_ABIFLAGS) {
                    phdr.p_offset = new_off;
                    phdr.p_vaddr = new_addr;
                    phdr.p_paddr = new_addr;
                    phdr.p_filesz = new_size;
                    phdr.p_memsz = new_size;
                }
            }

            if name == ".note.gnu.property" {
                for phdr in self.phdrs.iter_mut().filter(|p| p.p_type == PT_GNU_PROPERTY) {
                    phdr.p_offset = new_off;
                    phdr.p_vaddr = new_addr;
                    phdr.p_paddr = new_addr;
                    phdr.p_filesz = new_size;
                    phdr.p_memsz = new_size;
                }
            }

            *cur_off += round_up(data.len() as u64, SECTION_ALIGNMENT);
        }

        Ok(())
    }
}
