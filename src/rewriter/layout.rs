//! Placement of rewritten sections.
//!
//! Executables reserve space at the start of the file by shifting everything
//! after the reserved window forward by whole pages; libraries append a new
//! loadable region at the end of the file instead.

use elf::abi::*;

use super::{round_up, ElfRewriter, SECTION_ALIGNMENT};
use crate::class::{ElfClass, Phdr};
use crate::error::layout_error;
use crate::Result;

impl<C: ElfClass> ElfRewriter<C> {
    /// Lays out every pending section replacement and repairs the headers.
    /// Does nothing when the edit table is empty, unless `force` is set.
    pub fn rewrite_sections(&mut self, force: bool) -> Result<()> {
        if !force && self.replaced_sections.is_empty() {
            return Ok(());
        }

        for (name, data) in &self.replaced_sections {
            log::debug!("replacing section '{}' with size {}", name, data.len());
        }

        if self.ehdr.e_type == ET_DYN {
            log::debug!("this is a dynamic library");
            self.rewrite_sections_library()
        } else {
            log::debug!("this is an executable");
            self.rewrite_sections_executable()
        }
    }

    /// Places the replacement sections at the end of the file, mapped by a
    /// `PT_LOAD` segment directly after the last virtual address page of the
    /// other segments.
    fn rewrite_sections_library(&mut self) -> Result<()> {
        let page_size = self.page_size();

        let mut start_page: u64 = 0;
        let mut first_page: u64 = 0;
        let mut align_start_page = page_size;
        for phdr in &self.phdrs {
            let this_page = phdr.p_vaddr.wrapping_add(phdr.p_memsz);
            if this_page > start_page {
                start_page = this_page;
            }
            if phdr.p_type == PT_PHDR {
                first_page = phdr.p_vaddr.wrapping_sub(phdr.p_offset);
            }
            align_start_page = align_start_page.max(phdr.p_align);
        }
        let start_page = round_up(start_page, align_start_page);

        log::debug!("last page is 0x{:x}", start_page);
        log::debug!("first page is 0x{:x}", first_page);

        // Normalising note segments may add one program header per SHT_NOTE
        // section, and placing the replacements may take one more PT_LOAD.
        let num_notes = self
            .shdrs
            .iter()
            .filter(|shdr| shdr.sh_type == SHT_NOTE)
            .count() as u64;

        let pht_size = round_up(
            (self.phdrs.len() as u64 + num_notes + 1) * C::PHDR_SIZE + C::EHDR_SIZE,
            SECTION_ALIGNMENT,
        );
        let sht_size = round_up(
            u64::from(self.ehdr.e_shnum) * u64::from(self.ehdr.e_shentsize),
            SECTION_ALIGNMENT,
        );

        // Keep the PHT at the start of the file whenever the sections in its
        // way can be carried along; kernels before 2022 refuse PHDRs located
        // anywhere else. Relocate it to the end only as a last resort.
        let mut relocate_pht = false;
        let mut i = 1;
        while i < self.shdrs.len() && self.shdrs[i].sh_offset <= pht_size {
            let name = self.section_name(&self.shdrs[i])?;
            if !self.has_replaced_section(&name) && !self.can_replace_section(&name)? {
                relocate_pht = true;
                break;
            }
            i += 1;
        }

        if !relocate_pht {
            let mut i = 1;
            while i < self.shdrs.len() && self.shdrs[i].sh_offset <= pht_size {
                let name = self.section_name(&self.shdrs[i])?;
                let size = self.shdrs[i].sh_size;
                if !self.has_replaced_section(&name) {
                    self.replace_section(&name, size)?;
                }
                i += 1;
            }
        }

        let mut needed_space = sht_size;
        if relocate_pht {
            needed_space += pht_size;
        }
        for data in self.replaced_sections.values() {
            needed_space += round_up(data.len() as u64, SECTION_ALIGNMENT);
        }
        log::debug!("needed space is {}", needed_space);

        let start_offset = round_up(self.image.len(), align_start_page);

        // One byte more than needed: readelf from binutils 2.30 rejects a
        // dynamic segment that runs to the exact end of the file.
        self.image.grow(start_offset + needed_space + 1);

        // Expanding the last segment is preferred over allocating a new one.
        let mut last_seg_addr: u64 = 0;
        if let Some(last) = self.phdrs.last_mut() {
            if last.p_type == PT_LOAD
                && last.p_flags == (PF_R | PF_W)
                && last.p_align == align_start_page
            {
                let seg_end = round_up(last.p_offset + last.p_memsz, align_start_page);
                if seg_end == start_offset {
                    let new_size = start_offset + needed_space - last.p_offset;
                    last.p_filesz = new_size;
                    last.p_memsz = new_size;
                    last_seg_addr = last.p_vaddr + new_size - needed_space;
                }
            }
        }

        if last_seg_addr == 0 {
            log::debug!("allocating new PT_LOAD segment");
            debug_assert_eq!(
                start_page % align_start_page,
                start_offset % align_start_page
            );
            self.phdrs.push(Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_W,
                p_offset: start_offset,
                p_vaddr: start_page,
                p_paddr: start_page,
                p_filesz: needed_space,
                p_memsz: needed_space,
                p_align: align_start_page,
            });
            self.ehdr.e_phnum = self.phdrs.len() as u16;
            last_seg_addr = start_page;
        }

        self.normalize_note_segments()?;

        let mut cur_off = start_offset;

        if relocate_pht {
            log::debug!(
                "rewriting pht from offset 0x{:x} to offset 0x{:x} (size {})",
                self.ehdr.e_phoff,
                cur_off,
                pht_size
            );
            self.ehdr.e_phoff = cur_off;
            cur_off += pht_size;
        }

        log::debug!(
            "rewriting sht from offset 0x{:x} to offset 0x{:x} (size {})",
            self.ehdr.e_shoff,
            cur_off,
            sht_size
        );
        self.ehdr.e_shoff = cur_off;
        cur_off += sht_size;

        self.write_replaced_sections(&mut cur_off, start_page, start_offset)?;
        debug_assert_eq!(cur_off, start_offset + needed_space);

        let phdr_address = if relocate_pht {
            last_seg_addr
        } else {
            first_page + self.ehdr.e_phoff
        };
        self.rewrite_headers(phdr_address)
    }

    /// Reserves space at the start of the file, shifting later content
    /// forward by whole pages when the reserved window is too small, and
    /// places the replacement sections right after the program header table.
    fn rewrite_sections_executable(&mut self) -> Result<()> {
        if !self.opts.no_sort {
            // Without offset order the walk below would miss sections that
            // precede the last replaced one.
            self.sort_shdrs()?;
        }

        let mut last_replaced = 0;
        for i in 1..self.shdrs.len() {
            let name = self.section_name(&self.shdrs[i])?;
            if self.replaced_sections.contains_key(&name) {
                log::debug!("using replaced section '{}'", name);
                last_replaced = i;
            }
        }
        if last_replaced == 0 {
            return Err(layout_error("no replaced sections to lay out"));
        }
        log::debug!("last replaced is {}", last_replaced);

        if last_replaced + 1 >= self.shdrs.len() {
            return Err(layout_error(
                "cannot reserve space: no section follows the replaced ones",
            ));
        }
        let mut start_offset = self.shdrs[last_replaced + 1].sh_offset;
        let mut start_addr = self.shdrs[last_replaced + 1].sh_addr;

        // Carry every section before the last replaced one along, as far as
        // possible. An unmovable SHT_PROGBITS section ends the reserved range
        // since absolute references into it would go stale; so does anything
        // directly following a .dynstr section.
        let mut prev_section = String::new();
        for i in 1..=last_replaced {
            let shdr = self.shdrs[i];
            let name = self.section_name(&shdr)?;
            log::debug!("looking at section '{}'", name);
            if (shdr.sh_type == SHT_PROGBITS && name != ".interp") || prev_section == ".dynstr" {
                start_offset = shdr.sh_offset;
                start_addr = shdr.sh_addr;
                break;
            }
            if !self.replaced_sections.contains_key(&name) {
                log::debug!("replacing section '{}' which is in the way", name);
                self.replace_section(&name, shdr.sh_size)?;
            }
            prev_section = name;
        }

        log::debug!(
            "first reserved offset/addr is 0x{:x}/0x{:x}",
            start_offset,
            start_addr
        );

        let page_size = self.page_size();
        if start_addr % page_size != start_offset % page_size {
            return Err(layout_error(
                "virtual address and file offset of the reserved region are misaligned",
            ));
        }
        let mut first_page = start_addr - start_offset;
        log::debug!("first page is 0x{:x}", first_page);

        if self.ehdr.e_shoff < start_offset {
            // The section headers sit inside the region about to be reserved;
            // move them to the end of the file first.
            let sht_size = u64::from(self.ehdr.e_shnum) * u64::from(self.ehdr.e_shentsize);
            let shoff_new = self.image.len();
            self.image.grow(shoff_new + sht_size);
            self.ehdr.e_shoff = shoff_new;

            debug_assert_eq!(usize::from(self.ehdr.e_shnum), self.shdrs.len());
            self.sort_shdrs()?;
            for i in 1..self.shdrs.len() {
                C::write_shdr(
                    &mut self.image,
                    self.ehdr.e_shoff + i as u64 * C::SHDR_SIZE,
                    &self.shdrs[i],
                )?;
            }
        }

        self.normalize_note_segments()?;

        let mut needed_space = C::EHDR_SIZE + self.phdrs.len() as u64 * C::PHDR_SIZE;
        for data in self.replaced_sections.values() {
            needed_space += round_up(data.len() as u64, SECTION_ALIGNMENT);
        }
        log::debug!("needed space is {}", needed_space);

        if needed_space > start_offset {
            // The shift introduces one more program header.
            needed_space += C::PHDR_SIZE;
            log::debug!("needed space is {}", needed_space);

            let extra_space = needed_space - start_offset;
            // One extra page keeps segments that start at unaligned addresses
            // clear of the reserved window once their mapping is rounded down.
            let needed_pages = 1 + round_up(extra_space, page_size) / page_size;
            log::debug!("needed pages is {}", needed_pages);
            if needed_pages * page_size > first_page {
                return Err(layout_error("virtual address space underrun"));
            }

            self.shift_file(needed_pages, start_offset, extra_space)?;

            first_page -= needed_pages * page_size;
            start_offset += needed_pages * page_size;
        }

        let mut cur_off = C::EHDR_SIZE + self.phdrs.len() as u64 * C::PHDR_SIZE;

        // The PHT was covered by a LOAD segment before, so no new segment is
        // needed here; an existing one just grows to keep covering it.
        for phdr in &mut self.phdrs {
            if phdr.p_type == PT_LOAD
                && phdr.p_offset <= cur_off
                && phdr.p_offset + phdr.p_filesz > cur_off
                && phdr.p_filesz < needed_space
            {
                phdr.p_filesz = needed_space;
                phdr.p_memsz = needed_space;
                break;
            }
        }

        log::debug!("clearing first {} bytes", start_offset - cur_off);
        self.image.fill(cur_off, start_offset - cur_off, 0)?;

        self.write_replaced_sections(&mut cur_off, first_page, 0)?;
        debug_assert_eq!(cur_off, needed_space);

        self.rewrite_headers(first_page + self.ehdr.e_phoff)
    }

    /// Moves the file contents from `start_offset` onward forward by
    /// `extra_pages` whole pages, splitting the LOAD segment that straddles
    /// the boundary and appending a fresh segment that maps the vacated
    /// prefix plus `extra_bytes` of the new window.
    fn shift_file(&mut self, extra_pages: u64, start_offset: u64, extra_bytes: u64) -> Result<()> {
        debug_assert!(start_offset >= C::EHDR_SIZE);
        debug_assert!(self.image.len() > start_offset);

        let page_size = self.page_size();
        let shift = extra_pages * page_size;
        self.image.shift_tail(start_offset, shift)?;

        self.ehdr.e_phoff = C::EHDR_SIZE;
        if self.ehdr.e_shoff >= start_offset {
            self.ehdr.e_shoff += shift;
        }

        for shdr in self.shdrs.iter_mut().skip(1) {
            if shdr.sh_offset >= start_offset {
                shdr.sh_offset += shift;
            }
        }

        let mut split_index = None;
        let mut split_shift = 0;

        for (i, phdr) in self.phdrs.iter_mut().enumerate() {
            let mut p_start = phdr.p_offset;

            if p_start <= start_offset
                && p_start.wrapping_add(phdr.p_filesz) > start_offset
                && phdr.p_type == PT_LOAD
            {
                if split_index.is_some() {
                    return Err(layout_error(
                        "multiple LOAD segments cover the reserved region",
                    ));
                }
                split_index = Some(i);
                split_shift = start_offset - p_start;

                // This is the load segment being extended within, so split it.
                phdr.p_offset = start_offset;
                phdr.p_memsz -= split_shift;
                phdr.p_filesz -= split_shift;
                phdr.p_paddr += split_shift;
                phdr.p_vaddr += split_shift;

                p_start = start_offset;
            }

            if p_start >= start_offset {
                phdr.p_offset = p_start + shift;
                if phdr.p_align != 0
                    && phdr.p_vaddr.wrapping_sub(phdr.p_offset) % phdr.p_align != 0
                {
                    log::debug!(
                        "changing alignment of program header {} from {} to {}",
                        i,
                        phdr.p_align,
                        page_size
                    );
                    phdr.p_align = page_size;
                }
            } else {
                // Not physically shifted: pull the mapping back in virtual
                // memory instead.
                if phdr.p_paddr >= shift {
                    phdr.p_paddr -= shift;
                }
                if phdr.p_vaddr >= shift {
                    phdr.p_vaddr -= shift;
                }
            }
        }

        let split_index = split_index
            .ok_or_else(|| layout_error("no LOAD segment covers the reserved region"))?;

        // Add another PT_LOAD segment mapping the data split off above.
        let split = self.phdrs[split_index];
        self.phdrs.push(Phdr {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_W,
            p_offset: split.p_offset.wrapping_sub(split_shift).wrapping_sub(shift),
            p_vaddr: split.p_vaddr.wrapping_sub(split_shift).wrapping_sub(shift),
            p_paddr: split.p_paddr.wrapping_sub(split_shift).wrapping_sub(shift),
            p_filesz: split_shift + extra_bytes,
            p_memsz: split_shift + extra_bytes,
            p_align: page_size,
        });
        self.ehdr.e_phnum = self.phdrs.len() as u16;
        Ok(())
    }
}
