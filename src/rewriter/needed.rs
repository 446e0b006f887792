//! The rename entry point: `DT_NEEDED` entries and the file names in the
//! version-needs table.

use std::collections::HashMap;

use elf::abi::*;

use super::ElfRewriter;
use crate::class::{read_verneed, write_verneed, ElfClass, Shdr};
use crate::error::parse_error;
use crate::Result;

impl<C: ElfClass> ElfRewriter<C> {
    /// Renames dynamic-library dependencies according to `renames` (old name
    /// to new name) and lays the grown string sections back out.
    ///
    /// Replacement strings are always appended to the string section rather
    /// than overwritten in place, since the old bytes may be referenced from
    /// elsewhere; identical replacements share one appended copy.
    pub fn replace_needed(&mut self, renames: &HashMap<String, String>) -> Result<()> {
        if renames.is_empty() {
            return Ok(());
        }

        let shdr_dynamic = self.find_section(".dynamic")?;
        let shdr_dyn_str = self.find_section(".dynstr")?;

        let mut ver_need_num = 0;
        let mut dyn_str_added_bytes = 0;
        let mut added_strings: HashMap<String, u64> = HashMap::new();

        let count = shdr_dynamic.sh_size / C::DYN_SIZE;
        for entry in 0..count {
            let off = shdr_dynamic.sh_offset + entry * C::DYN_SIZE;
            let mut dyn_ent = C::read_dyn(&self.image, off)?;
            if dyn_ent.d_tag == DT_NULL {
                break;
            }

            if dyn_ent.d_tag == DT_NEEDED {
                let name = self.strtab_read(&shdr_dyn_str, dyn_ent.d_val)?;
                match renames.get(&name) {
                    Some(replacement) if *replacement != name => {
                        log::debug!(
                            "replacing DT_NEEDED entry '{}' with '{}'",
                            name,
                            replacement
                        );

                        if let Some(&existing) = added_strings.get(replacement) {
                            dyn_ent.d_val = existing;
                            C::write_dyn(&mut self.image, off, &dyn_ent)?;
                            continue;
                        }

                        log::debug!("resizing .dynstr ...");
                        let str_offset = shdr_dyn_str.sh_size + dyn_str_added_bytes;
                        let new_size = str_offset + replacement.len() as u64 + 1;
                        let buf = self.replace_section(".dynstr", new_size)?;
                        buf[str_offset as usize..new_size as usize - 1]
                            .copy_from_slice(replacement.as_bytes());

                        dyn_ent.d_val = str_offset;
                        C::write_dyn(&mut self.image, off, &dyn_ent)?;
                        added_strings.insert(replacement.clone(), str_offset);
                        dyn_str_added_bytes += replacement.len() as u64 + 1;

                        self.changed = true;
                    }
                    _ => log::debug!("keeping DT_NEEDED entry '{}'", name),
                }
            } else if dyn_ent.d_tag == DT_VERNEEDNUM {
                ver_need_num = dyn_ent.d_val;
            }
        }

        // A renamed library that uses symbol versions is also named in the
        // version-needs table, so those references change too.
        if ver_need_num > 0 {
            let shdr_version_r = self.find_section(".gnu.version_r")?;
            // The file names in .gnu.version_r are not necessarily in
            // .dynstr: sh_link names the section that actually holds them.
            let strings_index = shdr_version_r.sh_link as usize;
            let shdr_version_r_strings = *self
                .shdrs
                .get(strings_index)
                .ok_or_else(|| parse_error("sh_link of .gnu.version_r out of bounds"))?;
            let strings_name = self.section_name(&shdr_version_r_strings)?;
            log::debug!(
                "found .gnu.version_r with {} entries, strings in {}",
                ver_need_num,
                strings_name
            );

            let mut ver_str_added_bytes = 0;
            if strings_name == ".dynstr" {
                // The pass above already grew this section; append after its
                // additions and keep reusing them.
                ver_str_added_bytes += dyn_str_added_bytes;
            } else {
                added_strings.clear();
            }

            let mut need_off = shdr_version_r.sh_offset;
            for _ in 0..ver_need_num {
                let mut need = read_verneed(&self.image, need_off)?;
                let file = self.strtab_read(&shdr_version_r_strings, u64::from(need.vn_file))?;
                match renames.get(&file) {
                    Some(replacement) if *replacement != file => {
                        log::debug!(
                            "replacing .gnu.version_r entry '{}' with '{}'",
                            file,
                            replacement
                        );

                        if let Some(&existing) = added_strings.get(replacement) {
                            need.vn_file = existing as u32;
                            write_verneed(&mut self.image, need_off, &need)?;
                        } else {
                            log::debug!("resizing string section {} ...", strings_name);
                            let str_offset = shdr_version_r_strings.sh_size + ver_str_added_bytes;
                            let new_size = str_offset + replacement.len() as u64 + 1;
                            let buf = self.replace_section(&strings_name, new_size)?;
                            buf[str_offset as usize..new_size as usize - 1]
                                .copy_from_slice(replacement.as_bytes());

                            need.vn_file = str_offset as u32;
                            write_verneed(&mut self.image, need_off, &need)?;
                            added_strings.insert(replacement.clone(), str_offset);
                            ver_str_added_bytes += replacement.len() as u64 + 1;
                        }

                        self.changed = true;
                    }
                    _ => log::debug!("keeping .gnu.version_r entry '{}'", file),
                }

                // The records form a singly-linked list.
                if need.vn_next == 0 {
                    break;
                }
                need_off += u64::from(need.vn_next);
            }
        }

        self.rewrite_sections(false)
    }

    /// Reads a NUL-terminated string from a string section at `offset`.
    fn strtab_read(&self, shdr: &Shdr, offset: u64) -> Result<String> {
        if offset >= shdr.sh_size {
            return Err(parse_error("string table offset out of bounds"));
        }
        let bytes = self.image.slice(shdr.sh_offset + offset, shdr.sh_size - offset)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}
