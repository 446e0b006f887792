//! Splitting `PT_NOTE` segments so each note section can move on its own.

use elf::abi::*;

use super::{round_up, ElfRewriter};
use crate::class::{ElfClass, Phdr};
use crate::error::layout_error;
use crate::Result;

impl<C: ElfClass> ElfRewriter<C> {
    /// Breaks up every `PT_NOTE` segment covering multiple `SHT_NOTE`
    /// sections into one segment per section. Only needed when a note section
    /// is actually queued for replacement.
    pub(crate) fn normalize_note_segments(&mut self) -> Result<()> {
        let mut replaced_note = false;
        for name in self.replaced_sections.keys() {
            if self.find_section(name)?.sh_type == SHT_NOTE {
                replaced_note = true;
                break;
            }
        }
        if !replaced_note {
            return Ok(());
        }

        let mut new_phdrs: Vec<Phdr> = Vec::new();
        for j in 0..self.phdrs.len() {
            let orig = self.phdrs[j];
            if orig.p_type != PT_NOTE {
                continue;
            }
            let start_off = orig.p_offset;
            let end_off = start_off + orig.p_filesz;

            // Files patched by older tool versions may carry empty PT_NOTE
            // segments; tolerate and skip them.
            let empty = !self
                .shdrs
                .iter()
                .any(|shdr| shdr.sh_offset >= start_off && shdr.sh_offset < end_off);
            if empty {
                continue;
            }

            let mut curr_off = start_off;
            while curr_off < end_off {
                // A note section must start exactly at the aligned cursor,
                // otherwise the sections are not contiguous in the segment.
                let mut size = 0;
                for shdr in &self.shdrs {
                    if shdr.sh_type != SHT_NOTE {
                        continue;
                    }
                    let align = shdr.sh_addralign.max(1);
                    if shdr.sh_offset != round_up(curr_off, align) {
                        continue;
                    }
                    size = shdr.sh_size;
                    curr_off = round_up(curr_off, align);
                    break;
                }
                if size == 0 {
                    return Err(layout_error(
                        "cannot normalize PT_NOTE segment: non-contiguous SHT_NOTE sections",
                    ));
                }
                if curr_off + size > end_off {
                    return Err(layout_error(
                        "cannot normalize PT_NOTE segment: partially mapped SHT_NOTE section",
                    ));
                }

                let mut new_phdr = orig;
                new_phdr.p_offset = curr_off;
                new_phdr.p_vaddr = orig.p_vaddr + (curr_off - start_off);
                new_phdr.p_paddr = orig.p_paddr + (curr_off - start_off);
                new_phdr.p_filesz = size;
                new_phdr.p_memsz = size;

                // The first piece reuses the existing table slot; the rest
                // are appended.
                if curr_off == start_off {
                    self.phdrs[j] = new_phdr;
                } else {
                    new_phdrs.push(new_phdr);
                }

                curr_off += size;
            }
        }

        self.phdrs.extend(new_phdrs);
        self.ehdr.e_phnum = self.phdrs.len() as u16;
        Ok(())
    }
}
