//! 32- and 64-bit ELF record layouts.
//!
//! The engine keeps every header in a class-neutral, widest-field form and
//! round-trips it through one of the two codecs below. [`ElfClass`] bundles
//! the record sizes and codecs so the rest of the engine is written once and
//! instantiated twice; the class discriminant is the only runtime branch in
//! the driver.

use elf::abi::{ELFCLASS32, ELFCLASS64};

use crate::image::Image;
use crate::Result;

/// ELF file header.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// Program header.
#[derive(Clone, Copy, Debug, Default)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// Section header.
#[derive(Clone, Copy, Debug, Default)]
pub struct Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

/// Symbol table entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

/// Dynamic section entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct Dyn {
    pub d_tag: i64,
    pub d_val: u64,
}

/// Version-needs record. The layout is identical in both classes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Verneed {
    pub vn_version: u16,
    pub vn_cnt: u16,
    pub vn_file: u32,
    pub vn_aux: u32,
    pub vn_next: u32,
}

pub const VERNEED_SIZE: u64 = 16;

pub fn read_verneed(image: &Image, offset: u64) -> Result<Verneed> {
    Ok(Verneed {
        vn_version: image.read_u16(offset)?,
        vn_cnt: image.read_u16(offset + 2)?,
        vn_file: image.read_u32(offset + 4)?,
        vn_aux: image.read_u32(offset + 8)?,
        vn_next: image.read_u32(offset + 12)?,
    })
}

pub fn write_verneed(image: &mut Image, offset: u64, need: &Verneed) -> Result<()> {
    image.write_u16(offset, need.vn_version)?;
    image.write_u16(offset + 2, need.vn_cnt)?;
    image.write_u32(offset + 4, need.vn_file)?;
    image.write_u32(offset + 8, need.vn_aux)?;
    image.write_u32(offset + 12, need.vn_next)
}

/// Record sizes and codecs for one ELF class.
pub trait ElfClass: 'static {
    const CLASS: u8;
    const EHDR_SIZE: u64;
    const PHDR_SIZE: u64;
    const SHDR_SIZE: u64;
    const SYM_SIZE: u64;
    const DYN_SIZE: u64;

    fn read_ehdr(image: &Image, offset: u64) -> Result<Ehdr>;
    fn write_ehdr(image: &mut Image, offset: u64, ehdr: &Ehdr) -> Result<()>;
    fn read_phdr(image: &Image, offset: u64) -> Result<Phdr>;
    fn write_phdr(image: &mut Image, offset: u64, phdr: &Phdr) -> Result<()>;
    fn read_shdr(image: &Image, offset: u64) -> Result<Shdr>;
    fn write_shdr(image: &mut Image, offset: u64, shdr: &Shdr) -> Result<()>;
    fn read_sym(image: &Image, offset: u64) -> Result<Sym>;
    fn write_sym(image: &mut Image, offset: u64, sym: &Sym) -> Result<()>;
    fn read_dyn(image: &Image, offset: u64) -> Result<Dyn>;
    fn write_dyn(image: &mut Image, offset: u64, dyn_ent: &Dyn) -> Result<()>;
}

/// The ELFCLASS32 instantiation.
pub enum Elf32 {}

/// The ELFCLASS64 instantiation.
pub enum Elf64 {}

impl ElfClass for Elf32 {
    const CLASS: u8 = ELFCLASS32;
    const EHDR_SIZE: u64 = 52;
    const PHDR_SIZE: u64 = 32;
    const SHDR_SIZE: u64 = 40;
    const SYM_SIZE: u64 = 16;
    const DYN_SIZE: u64 = 8;

    fn read_ehdr(image: &Image, offset: u64) -> Result<Ehdr> {
        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(image.slice(offset, 16)?);
        Ok(Ehdr {
            e_ident,
            e_type: image.read_u16(offset + 16)?,
            e_machine: image.read_u16(offset + 18)?,
            e_version: image.read_u32(offset + 20)?,
            e_entry: u64::from(image.read_u32(offset + 24)?),
            e_phoff: u64::from(image.read_u32(offset + 28)?),
            e_shoff: u64::from(image.read_u32(offset + 32)?),
            e_flags: image.read_u32(offset + 36)?,
            e_ehsize: image.read_u16(offset + 40)?,
            e_phentsize: image.read_u16(offset + 42)?,
            e_phnum: image.read_u16(offset + 44)?,
            e_shentsize: image.read_u16(offset + 46)?,
            e_shnum: image.read_u16(offset + 48)?,
            e_shstrndx: image.read_u16(offset + 50)?,
        })
    }

    fn write_ehdr(image: &mut Image, offset: u64, ehdr: &Ehdr) -> Result<()> {
        image.copy_from(offset, &ehdr.e_ident)?;
        image.write_u16(offset + 16, ehdr.e_type)?;
        image.write_u16(offset + 18, ehdr.e_machine)?;
        image.write_u32(offset + 20, ehdr.e_version)?;
        image.write_u32(offset + 24, ehdr.e_entry as u32)?;
        image.write_u32(offset + 28, ehdr.e_phoff as u32)?;
        image.write_u32(offset + 32, ehdr.e_shoff as u32)?;
        image.write_u32(offset + 36, ehdr.e_flags)?;
        image.write_u16(offset + 40, ehdr.e_ehsize)?;
        image.write_u16(offset + 42, ehdr.e_phentsize)?;
        image.write_u16(offset + 44, ehdr.e_phnum)?;
        image.write_u16(offset + 46, ehdr.e_shentsize)?;
        image.write_u16(offset + 48, ehdr.e_shnum)?;
        image.write_u16(offset + 50, ehdr.e_shstrndx)
    }

    fn read_phdr(image: &Image, offset: u64) -> Result<Phdr> {
        Ok(Phdr {
            p_type: image.read_u32(offset)?,
            p_offset: u64::from(image.read_u32(offset + 4)?),
            p_vaddr: u64::from(image.read_u32(offset + 8)?),
            p_paddr: u64::from(image.read_u32(offset + 12)?),
            p_filesz: u64::from(image.read_u32(offset + 16)?),
            p_memsz: u64::from(image.read_u32(offset + 20)?),
            p_flags: image.read_u32(offset + 24)?,
            p_align: u64::from(image.read_u32(offset + 28)?),
        })
    }

    fn write_phdr(image: &mut Image, offset: u64, phdr: &Phdr) -> Result<()> {
        image.write_u32(offset, phdr.p_type)?;
        image.write_u32(offset + 4, phdr.p_offset as u32)?;
        image.write_u32(offset + 8, phdr.p_vaddr as u32)?;
        image.write_u32(offset + 12, phdr.p_paddr as u32)?;
        image.write_u32(offset + 16, phdr.p_filesz as u32)?;
        image.write_u32(offset + 20, phdr.p_memsz as u32)?;
        image.write_u32(offset + 24, phdr.p_flags)?;
        image.write_u32(offset + 28, phdr.p_align as u32)
    }

    fn read_shdr(image: &Image, offset: u64) -> Result<Shdr> {
        Ok(Shdr {
            sh_name: image.read_u32(offset)?,
            sh_type: image.read_u32(offset + 4)?,
            sh_flags: u64::from(image.read_u32(offset + 8)?),
            sh_addr: u64::from(image.read_u32(offset + 12)?),
            sh_offset: u64::from(image.read_u32(offset + 16)?),
            sh_size: u64::from(image.read_u32(offset + 20)?),
            sh_link: image.read_u32(offset + 24)?,
            sh_info: image.read_u32(offset + 28)?,
            sh_addralign: u64::from(image.read_u32(offset + 32)?),
            sh_entsize: u64::from(image.read_u32(offset + 36)?),
        })
    }

    fn write_shdr(image: &mut Image, offset: u64, shdr: &Shdr) -> Result<()> {
        image.write_u32(offset, shdr.sh_name)?;
        image.write_u32(offset + 4, shdr.sh_type)?;
        image.write_u32(offset + 8, shdr.sh_flags as u32)?;
        image.write_u32(offset + 12, shdr.sh_addr as u32)?;
        image.write_u32(offset + 16, shdr.sh_offset as u32)?;
        image.write_u32(offset + 20, shdr.sh_size as u32)?;
        image.write_u32(offset + 24, shdr.sh_link)?;
        image.write_u32(offset + 28, shdr.sh_info)?;
        image.write_u32(offset + 32, shdr.sh_addralign as u32)?;
        image.write_u32(offset + 36, shdr.sh_entsize as u32)
    }

    fn read_sym(image: &Image, offset: u64) -> Result<Sym> {
        Ok(Sym {
            st_name: image.read_u32(offset)?,
            st_value: u64::from(image.read_u32(offset + 4)?),
            st_size: u64::from(image.read_u32(offset + 8)?),
            st_info: image.read_u8(offset + 12)?,
            st_other: image.read_u8(offset + 13)?,
            st_shndx: image.read_u16(offset + 14)?,
        })
    }

    fn write_sym(image: &mut Image, offset: u64, sym: &Sym) -> Result<()> {
        image.write_u32(offset, sym.st_name)?;
        image.write_u32(offset + 4, sym.st_value as u32)?;
        image.write_u32(offset + 8, sym.st_size as u32)?;
        image.copy_from(offset + 12, &[sym.st_info, sym.st_other])?;
        image.write_u16(offset + 14, sym.st_shndx)
    }

    fn read_dyn(image: &Image, offset: u64) -> Result<Dyn> {
        Ok(Dyn {
            d_tag: i64::from(image.read_u32(offset)? as i32),
            d_val: u64::from(image.read_u32(offset + 4)?),
        })
    }

    fn write_dyn(image: &mut Image, offset: u64, dyn_ent: &Dyn) -> Result<()> {
        image.write_u32(offset, dyn_ent.d_tag as u32)?;
        image.write_u32(offset + 4, dyn_ent.d_val as u32)
    }
}

impl ElfClass for Elf64 {
    const CLASS: u8 = ELFCLASS64;
    const EHDR_SIZE: u64 = 64;
    const PHDR_SIZE: u64 = 56;
    const SHDR_SIZE: u64 = 64;
    const SYM_SIZE: u64 = 24;
    const DYN_SIZE: u64 = 16;

    fn read_ehdr(image: &Image, offset: u64) -> Result<Ehdr> {
        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(image.slice(offset, 16)?);
        Ok(Ehdr {
            e_ident,
            e_type: image.read_u16(offset + 16)?,
            e_machine: image.read_u16(offset + 18)?,
            e_version: image.read_u32(offset + 20)?,
            e_entry: image.read_u64(offset + 24)?,
            e_phoff: image.read_u64(offset + 32)?,
            e_shoff: image.read_u64(offset + 40)?,
            e_flags: image.read_u32(offset + 48)?,
            e_ehsize: image.read_u16(offset + 52)?,
            e_phentsize: image.read_u16(offset + 54)?,
            e_phnum: image.read_u16(offset + 56)?,
            e_shentsize: image.read_u16(offset + 58)?,
            e_shnum: image.read_u16(offset + 60)?,
            e_shstrndx: image.read_u16(offset + 62)?,
        })
    }

    fn write_ehdr(image: &mut Image, offset: u64, ehdr: &Ehdr) -> Result<()> {
        image.copy_from(offset, &ehdr.e_ident)?;
        image.write_u16(offset + 16, ehdr.e_type)?;
        image.write_u16(offset + 18, ehdr.e_machine)?;
        image.write_u32(offset + 20, ehdr.e_version)?;
        image.write_u64(offset + 24, ehdr.e_entry)?;
        image.write_u64(offset + 32, ehdr.e_phoff)?;
        image.write_u64(offset + 40, ehdr.e_shoff)?;
        image.write_u32(offset + 48, ehdr.e_flags)?;
        image.write_u16(offset + 52, ehdr.e_ehsize)?;
        image.write_u16(offset + 54, ehdr.e_phentsize)?;
        image.write_u16(offset + 56, ehdr.e_phnum)?;
        image.write_u16(offset + 58, ehdr.e_shentsize)?;
        image.write_u16(offset + 60, ehdr.e_shnum)?;
        image.write_u16(offset + 62, ehdr.e_shstrndx)
    }

    fn read_phdr(image: &Image, offset: u64) -> Result<Phdr> {
        Ok(Phdr {
            p_type: image.read_u32(offset)?,
            p_flags: image.read_u32(offset + 4)?,
            p_offset: image.read_u64(offset + 8)?,
            p_vaddr: image.read_u64(offset + 16)?,
            p_paddr: image.read_u64(offset + 24)?,
            p_filesz: image.read_u64(offset + 32)?,
            p_memsz: image.read_u64(offset + 40)?,
            p_align: image.read_u64(offset + 48)?,
        })
    }

    fn write_phdr(image: &mut Image, offset: u64, phdr: &Phdr) -> Result<()> {
        image.write_u32(offset, phdr.p_type)?;
        image.write_u32(offset + 4, phdr.p_flags)?;
        image.write_u64(offset + 8, phdr.p_offset)?;
        image.write_u64(offset + 16, phdr.p_vaddr)?;
        image.write_u64(offset + 24, phdr.p_paddr)?;
        image.write_u64(offset + 32, phdr.p_filesz)?;
        image.write_u64(offset + 40, phdr.p_memsz)?;
        image.write_u64(offset + 48, phdr.p_align)
    }

    fn read_shdr(image: &Image, offset: u64) -> Result<Shdr> {
        Ok(Shdr {
            sh_name: image.read_u32(offset)?,
            sh_type: image.read_u32(offset + 4)?,
            sh_flags: image.read_u64(offset + 8)?,
            sh_addr: image.read_u64(offset + 16)?,
            sh_offset: image.read_u64(offset + 24)?,
            sh_size: image.read_u64(offset + 32)?,
            sh_link: image.read_u32(offset + 40)?,
            sh_info: image.read_u32(offset + 44)?,
            sh_addralign: image.read_u64(offset + 48)?,
            sh_entsize: image.read_u64(offset + 56)?,
        })
    }

    fn write_shdr(image: &mut Image, offset: u64, shdr: &Shdr) -> Result<()> {
        image.write_u32(offset, shdr.sh_name)?;
        image.write_u32(offset + 4, shdr.sh_type)?;
        image.write_u64(offset + 8, shdr.sh_flags)?;
        image.write_u64(offset + 16, shdr.sh_addr)?;
        image.write_u64(offset + 24, shdr.sh_offset)?;
        image.write_u64(offset + 32, shdr.sh_size)?;
        image.write_u32(offset + 40, shdr.sh_link)?;
        image.write_u32(offset + 44, shdr.sh_info)?;
        image.write_u64(offset + 48, shdr.sh_addralign)?;
        image.write_u64(offset + 56, shdr.sh_entsize)
    }

    fn read_sym(image: &Image, offset: u64) -> Result<Sym> {
        Ok(Sym {
            st_name: image.read_u32(offset)?,
            st_info: image.read_u8(offset + 4)?,
            st_other: image.read_u8(offset + 5)?,
            st_shndx: image.read_u16(offset + 6)?,
            st_value: image.read_u64(offset + 8)?,
            st_size: image.read_u64(offset + 16)?,
        })
    }

    fn write_sym(image: &mut Image, offset: u64, sym: &Sym) -> Result<()> {
        image.write_u32(offset, sym.st_name)?;
        image.copy_from(offset + 4, &[sym.st_info, sym.st_other])?;
        image.write_u16(offset + 6, sym.st_shndx)?;
        image.write_u64(offset + 8, sym.st_value)?;
        image.write_u64(offset + 16, sym.st_size)
    }

    fn read_dyn(image: &Image, offset: u64) -> Result<Dyn> {
        Ok(Dyn {
            d_tag: image.read_u64(offset)? as i64,
            d_val: image.read_u64(offset + 8)?,
        })
    }

    fn write_dyn(image: &mut Image, offset: u64, dyn_ent: &Dyn) -> Result<()> {
        image.write_u64(offset, dyn_ent.d_tag as u64)?;
        image.write_u64(offset + 8, dyn_ent.d_val)
    }
}
