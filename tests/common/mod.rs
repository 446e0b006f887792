#![allow(dead_code)]

//! In-memory ELF fixtures for the rewriter tests.
//!
//! Builds small but structurally honest ET_DYN and ET_EXEC images in either
//! class and byte order: a real program header table, offset-sorted sections,
//! a `.dynamic` section with `DT_NEEDED` entries, and optionally a
//! version-needs table and multi-section `PT_NOTE` segments. The rewriter's
//! own parser doubles as the round-trip oracle for inspecting outputs.

use std::collections::HashMap;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use elf::abi::*;

use elf_patch::class::{read_verneed, ElfClass};
use elf_patch::image::{Endian, Image};
use elf_patch::{Elf32, Elf64, ElfRewriter, RewriteOptions, Rewritten};

pub const SHT_GNU_VERNEED: u32 = 0x6fff_fffe;

pub const NEEDED_LIB: &str = "libc.so.6";
pub const VERSION_NAME: &str = "GLIBC_2.2.5";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Class {
    Elf32,
    Elf64,
}

impl Class {
    pub fn ehdr_size(self) -> u64 {
        match self {
            Class::Elf32 => 52,
            Class::Elf64 => 64,
        }
    }

    pub fn phdr_size(self) -> u64 {
        match self {
            Class::Elf32 => 32,
            Class::Elf64 => 56,
        }
    }

    pub fn shdr_size(self) -> u64 {
        match self {
            Class::Elf32 => 40,
            Class::Elf64 => 64,
        }
    }

    pub fn sym_size(self) -> u64 {
        match self {
            Class::Elf32 => 16,
            Class::Elf64 => 24,
        }
    }

    pub fn dyn_size(self) -> u64 {
        match self {
            Class::Elf32 => 8,
            Class::Elf64 => 16,
        }
    }
}

/// Where the version-needs file-name strings live.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VerStrings {
    /// `.gnu.version_r`'s `sh_link` points at `.dynstr`.
    InDynstr,
    /// `sh_link` points at a dedicated string section, `.vstr`.
    Separate,
}

/// Where the two note sections land relative to the program header table's
/// growth window.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NotePlacement {
    /// Right after the PHT, inside the window the library planner reserves.
    Early,
    /// After `.text`, out of the planner's way.
    Late,
}

fn align8(x: u64) -> u64 {
    (x + 7) & !7
}

fn write_at(out: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let offset = offset as usize;
    if out.len() < offset + data.len() {
        out.resize(offset + data.len(), 0);
    }
    out[offset..offset + data.len()].copy_from_slice(data);
}

/// Endian- and class-aware record emission.
struct Emitter {
    class: Class,
    big: bool,
}

impl Emitter {
    fn u16(&self, out: &mut Vec<u8>, value: u16) {
        if self.big {
            out.write_u16::<BigEndian>(value).unwrap();
        } else {
            out.write_u16::<LittleEndian>(value).unwrap();
        }
    }

    fn u32(&self, out: &mut Vec<u8>, value: u32) {
        if self.big {
            out.write_u32::<BigEndian>(value).unwrap();
        } else {
            out.write_u32::<LittleEndian>(value).unwrap();
        }
    }

    fn u64(&self, out: &mut Vec<u8>, value: u64) {
        if self.big {
            out.write_u64::<BigEndian>(value).unwrap();
        } else {
            out.write_u64::<LittleEndian>(value).unwrap();
        }
    }

    /// A class-sized word: `Elf_Addr`, `Elf_Off`, `Elf_Xword`.
    fn word(&self, out: &mut Vec<u8>, value: u64) {
        match self.class {
            Class::Elf32 => self.u32(out, value as u32),
            Class::Elf64 => self.u64(out, value),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ehdr(
        &self,
        out: &mut Vec<u8>,
        e_type: u16,
        machine: u16,
        phoff: u64,
        shoff: u64,
        phnum: u16,
        shnum: u16,
        shstrndx: u16,
    ) {
        let mut ident = [0u8; 16];
        ident[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        ident[4] = match self.class {
            Class::Elf32 => ELFCLASS32,
            Class::Elf64 => ELFCLASS64,
        };
        ident[5] = if self.big { ELFDATA2MSB } else { ELFDATA2LSB };
        ident[6] = EV_CURRENT;
        out.extend_from_slice(&ident);
        self.u16(out, e_type);
        self.u16(out, machine);
        self.u32(out, 1);
        self.word(out, 0); // e_entry
        self.word(out, phoff);
        self.word(out, shoff);
        self.u32(out, 0); // e_flags
        self.u16(out, self.class.ehdr_size() as u16);
        self.u16(out, self.class.phdr_size() as u16);
        self.u16(out, phnum);
        self.u16(out, self.class.shdr_size() as u16);
        self.u16(out, shnum);
        self.u16(out, shstrndx);
    }

    #[allow(clippy::too_many_arguments)]
    fn phdr(
        &self,
        out: &mut Vec<u8>,
        p_type: u32,
        flags: u32,
        offset: u64,
        vaddr: u64,
        filesz: u64,
        memsz: u64,
        align: u64,
    ) {
        match self.class {
            Class::Elf64 => {
                self.u32(out, p_type);
                self.u32(out, flags);
                self.u64(out, offset);
                self.u64(out, vaddr);
                self.u64(out, vaddr);
                self.u64(out, filesz);
                self.u64(out, memsz);
                self.u64(out, align);
            }
            Class::Elf32 => {
                self.u32(out, p_type);
                self.u32(out, offset as u32);
                self.u32(out, vaddr as u32);
                self.u32(out, vaddr as u32);
                self.u32(out, filesz as u32);
                self.u32(out, memsz as u32);
                self.u32(out, flags);
                self.u32(out, align as u32);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn shdr(
        &self,
        out: &mut Vec<u8>,
        name: u32,
        sh_type: u32,
        flags: u64,
        addr: u64,
        offset: u64,
        size: u64,
        link: u32,
        info: u32,
        addralign: u64,
        entsize: u64,
    ) {
        self.u32(out, name);
        self.u32(out, sh_type);
        self.word(out, flags);
        self.word(out, addr);
        self.word(out, offset);
        self.word(out, size);
        self.u32(out, link);
        self.u32(out, info);
        self.word(out, addralign);
        self.word(out, entsize);
    }

    fn sym(
        &self,
        out: &mut Vec<u8>,
        name: u32,
        info: u8,
        shndx: u16,
        value: u64,
        size: u64,
    ) {
        match self.class {
            Class::Elf64 => {
                self.u32(out, name);
                out.push(info);
                out.push(0);
                self.u16(out, shndx);
                self.u64(out, value);
                self.u64(out, size);
            }
            Class::Elf32 => {
                self.u32(out, name);
                self.u32(out, value as u32);
                self.u32(out, size as u32);
                out.push(info);
                out.push(0);
                self.u16(out, shndx);
            }
        }
    }

    fn dyn_entry(&self, out: &mut Vec<u8>, tag: i64, value: u64) {
        self.word(out, tag as u64);
        self.word(out, value);
    }

    fn verneed(&self, out: &mut Vec<u8>, cnt: u16, file: u32, aux: u32, next: u32) {
        self.u16(out, 1); // vn_version
        self.u16(out, cnt);
        self.u32(out, file);
        self.u32(out, aux);
        self.u32(out, next);
    }

    fn vernaux(&self, out: &mut Vec<u8>, hash: u32, other: u16, name: u32, next: u32) {
        self.u32(out, hash);
        self.u16(out, 0); // vna_flags
        self.u16(out, other);
        self.u32(out, name);
        self.u32(out, next);
    }
}

/// One section record accumulated while laying out a fixture.
struct Sec {
    name: &'static str,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link_name: Option<&'static str>,
    info: u32,
    addralign: u64,
    entsize: u64,
}

fn section_index(secs: &[Sec], name: &str) -> u16 {
    // Index 0 is the null entry.
    for (i, sec) in secs.iter().enumerate() {
        if sec.name == name {
            return (i + 1) as u16;
        }
    }
    panic!("fixture has no section named {name}");
}

fn build_shstrtab(secs: &[Sec]) -> (Vec<u8>, HashMap<&'static str, u32>) {
    let mut table = vec![0u8];
    let mut offsets = HashMap::new();
    offsets.insert(".shstrtab", table.len() as u32);
    table.extend_from_slice(b".shstrtab\0");
    for sec in secs {
        if sec.name == ".shstrtab" {
            continue;
        }
        offsets.insert(sec.name, table.len() as u32);
        table.extend_from_slice(sec.name.as_bytes());
        table.push(0);
    }
    (table, offsets)
}

fn note_payload(em: &Emitter, marker: u32) -> Vec<u8> {
    let mut out = vec![];
    em.u32(&mut out, 4); // n_namesz
    em.u32(&mut out, 4); // n_descsz
    em.u32(&mut out, 1); // n_type
    out.extend_from_slice(b"GNU\0");
    em.u32(&mut out, marker);
    out
}

pub struct DylibConfig {
    pub class: Class,
    pub big: bool,
    pub machine: u16,
    pub needed: Vec<&'static str>,
    pub verneed: Option<VerStrings>,
    pub notes: Option<NotePlacement>,
    /// Places `.text` right after the PHT, so the table cannot grow in place.
    pub early_text: bool,
}

impl DylibConfig {
    pub fn x86_64() -> DylibConfig {
        DylibConfig {
            class: Class::Elf64,
            big: false,
            machine: EM_X86_64,
            needed: vec![NEEDED_LIB],
            verneed: None,
            notes: None,
            early_text: false,
        }
    }
}

/// A small ET_DYN image: two `PT_LOAD` segments (RX headers + text, RW
/// dynamic data), `PT_DYNAMIC`, optionally a `PT_NOTE` covering two note
/// sections, and optionally a version-needs table.
pub fn build_dylib(cfg: &DylibConfig) -> Vec<u8> {
    let em = Emitter {
        class: cfg.class,
        big: cfg.big,
    };
    let ehdr_size = cfg.class.ehdr_size();
    let phdr_size = cfg.class.phdr_size();
    let shdr_size = cfg.class.shdr_size();
    let sym_size = cfg.class.sym_size();
    let dyn_size = cfg.class.dyn_size();

    assert!(
        !(cfg.early_text && cfg.notes.is_some()),
        "early .text and note sections contend for the same offsets"
    );

    let phnum: u64 = 3 + u64::from(cfg.notes.is_some());
    let pht_off = ehdr_size;
    let pht_end = pht_off + phnum * phdr_size;

    let text_off: u64 = if cfg.early_text { pht_end } else { 0x200 };
    let text_size: u64 = 16;

    let note_a = note_payload(&em, 0x11);
    let note_b = note_payload(&em, 0x22);
    let (note_a_off, note_b_off) = match cfg.notes {
        Some(NotePlacement::Early) => (pht_end, pht_end + note_a.len() as u64),
        Some(NotePlacement::Late) => {
            let a = text_off + text_size;
            (a, a + note_a.len() as u64)
        }
        None => (0, 0),
    };
    let notes_end = note_b_off + note_b.len() as u64;

    let rx_end = match cfg.notes {
        Some(NotePlacement::Late) => notes_end,
        _ => text_off + text_size,
    };

    let mut cursor = align8(rx_end);

    // .dynstr
    let mut dynstr = vec![0u8];
    let mut needed_offs = vec![];
    for lib in &cfg.needed {
        needed_offs.push(dynstr.len() as u64);
        dynstr.extend_from_slice(lib.as_bytes());
        dynstr.push(0);
    }
    let mut dynstr_version_off = 0u64;
    if cfg.verneed == Some(VerStrings::InDynstr) {
        dynstr_version_off = dynstr.len() as u64;
        dynstr.extend_from_slice(VERSION_NAME.as_bytes());
        dynstr.push(0);
    }
    let dynstr_off = cursor;
    cursor = align8(dynstr_off + dynstr.len() as u64);

    // .dynsym: null entry plus a section symbol for .text
    let dynsym_off = cursor;
    let dynsym_size = 2 * sym_size;
    cursor = align8(dynsym_off + dynsym_size);

    // Version-needs table and its string section
    let mut vstr = vec![];
    let mut vstr_off = 0u64;
    let mut verneed_off = 0u64;
    let mut vn_file_off = 0u64;
    let mut vna_name_off = 0u64;
    match cfg.verneed {
        Some(VerStrings::Separate) => {
            vstr.push(0u8);
            vn_file_off = vstr.len() as u64;
            vstr.extend_from_slice(NEEDED_LIB.as_bytes());
            vstr.push(0);
            vna_name_off = vstr.len() as u64;
            vstr.extend_from_slice(VERSION_NAME.as_bytes());
            vstr.push(0);
            vstr_off = cursor;
            cursor = align8(vstr_off + vstr.len() as u64);
            verneed_off = cursor;
            cursor = align8(verneed_off + 32);
        }
        Some(VerStrings::InDynstr) => {
            vn_file_off = needed_offs[0];
            vna_name_off = dynstr_version_off;
            verneed_off = cursor;
            cursor = align8(verneed_off + 32);
        }
        None => {}
    }

    // .dynamic
    let dynamic_off = cursor;
    let n_dyn = cfg.needed.len() as u64 + 4 + if cfg.verneed.is_some() { 2 } else { 0 } + 1;
    let dynamic_size = n_dyn * dyn_size;
    cursor = align8(dynamic_off + dynamic_size);

    // Section list in file-offset order.
    let mut secs: Vec<Sec> = vec![];
    if cfg.notes == Some(NotePlacement::Early) {
        secs.push(Sec {
            name: ".note.a",
            sh_type: SHT_NOTE,
            flags: u64::from(SHF_ALLOC),
            addr: note_a_off,
            offset: note_a_off,
            size: note_a.len() as u64,
            link_name: None,
            info: 0,
            addralign: 4,
            entsize: 0,
        });
        secs.push(Sec {
            name: ".note.b",
            sh_type: SHT_NOTE,
            flags: u64::from(SHF_ALLOC),
            addr: note_b_off,
            offset: note_b_off,
            size: note_b.len() as u64,
            link_name: None,
            info: 0,
            addralign: 4,
            entsize: 0,
        });
    }
    secs.push(Sec {
        name: ".text",
        sh_type: SHT_PROGBITS,
        flags: u64::from(SHF_ALLOC | SHF_EXECINSTR),
        addr: text_off,
        offset: text_off,
        size: text_size,
        link_name: None,
        info: 0,
        addralign: 16,
        entsize: 0,
    });
    if cfg.notes == Some(NotePlacement::Late) {
        secs.push(Sec {
            name: ".note.a",
            sh_type: SHT_NOTE,
            flags: u64::from(SHF_ALLOC),
            addr: note_a_off,
            offset: note_a_off,
            size: note_a.len() as u64,
            link_name: None,
            info: 0,
            addralign: 4,
            entsize: 0,
        });
        secs.push(Sec {
            name: ".note.b",
            sh_type: SHT_NOTE,
            flags: u64::from(SHF_ALLOC),
            addr: note_b_off,
            offset: note_b_off,
            size: note_b.len() as u64,
            link_name: None,
            info: 0,
            addralign: 4,
            entsize: 0,
        });
    }
    secs.push(Sec {
        name: ".dynstr",
        sh_type: SHT_STRTAB,
        flags: u64::from(SHF_ALLOC),
        addr: dynstr_off,
        offset: dynstr_off,
        size: dynstr.len() as u64,
        link_name: None,
        info: 0,
        addralign: 1,
        entsize: 0,
    });
    secs.push(Sec {
        name: ".dynsym",
        sh_type: SHT_DYNSYM,
        flags: u64::from(SHF_ALLOC),
        addr: dynsym_off,
        offset: dynsym_off,
        size: dynsym_size,
        link_name: Some(".dynstr"),
        info: 1,
        addralign: 8,
        entsize: sym_size,
    });
    if cfg.verneed == Some(VerStrings::Separate) {
        secs.push(Sec {
            name: ".vstr",
            sh_type: SHT_STRTAB,
            flags: u64::from(SHF_ALLOC),
            addr: vstr_off,
            offset: vstr_off,
            size: vstr.len() as u64,
            link_name: None,
            info: 0,
            addralign: 1,
            entsize: 0,
        });
    }
    if cfg.verneed.is_some() {
        secs.push(Sec {
            name: ".gnu.version_r",
            sh_type: SHT_GNU_VERNEED,
            flags: u64::from(SHF_ALLOC),
            addr: verneed_off,
            offset: verneed_off,
            size: 32,
            link_name: Some(match cfg.verneed {
                Some(VerStrings::Separate) => ".vstr",
                _ => ".dynstr",
            }),
            info: 1,
            addralign: 8,
            entsize: 0,
        });
    }
    secs.push(Sec {
        name: ".dynamic",
        sh_type: SHT_DYNAMIC,
        flags: u64::from(SHF_ALLOC | SHF_WRITE),
        addr: dynamic_off,
        offset: dynamic_off,
        size: dynamic_size,
        link_name: Some(".dynstr"),
        info: 0,
        addralign: 8,
        entsize: dyn_size,
    });

    let (shstrtab, name_offs) = build_shstrtab(&secs);
    let shstrtab_off = cursor;
    cursor = align8(shstrtab_off + shstrtab.len() as u64);
    secs.push(Sec {
        name: ".shstrtab",
        sh_type: SHT_STRTAB,
        flags: 0,
        addr: 0,
        offset: shstrtab_off,
        size: shstrtab.len() as u64,
        link_name: None,
        info: 0,
        addralign: 1,
        entsize: 0,
    });

    let sht_off = cursor;
    let shnum = (secs.len() + 1) as u16;
    let shstrndx = section_index(&secs, ".shstrtab");

    let mut out = vec![];
    em.ehdr(&mut out, ET_DYN, cfg.machine, pht_off, sht_off, phnum as u16, shnum, shstrndx);

    // Program headers.
    let rw_end = dynamic_off + dynamic_size;
    em.phdr(&mut out, PT_LOAD, PF_R | PF_X, 0, 0, rx_end, rx_end, 0x1000);
    em.phdr(
        &mut out,
        PT_LOAD,
        PF_R | PF_W,
        dynstr_off,
        dynstr_off,
        rw_end - dynstr_off,
        rw_end - dynstr_off,
        0x1000,
    );
    if cfg.notes.is_some() {
        em.phdr(
            &mut out,
            PT_NOTE,
            PF_R,
            note_a_off,
            note_a_off,
            notes_end - note_a_off,
            notes_end - note_a_off,
            4,
        );
    }
    em.phdr(
        &mut out,
        PT_DYNAMIC,
        PF_R | PF_W,
        dynamic_off,
        dynamic_off,
        dynamic_size,
        dynamic_size,
        8,
    );

    // Section payloads.
    if cfg.notes.is_some() {
        write_at(&mut out, note_a_off, &note_a);
        write_at(&mut out, note_b_off, &note_b);
    }
    write_at(&mut out, text_off, &[0x90u8; 16]);
    write_at(&mut out, dynstr_off, &dynstr);

    let mut dynsym = vec![];
    em.sym(&mut dynsym, 0, 0, 0, 0, 0);
    em.sym(
        &mut dynsym,
        0,
        STT_SECTION as u8,
        section_index(&secs, ".text"),
        text_off,
        0,
    );
    write_at(&mut out, dynsym_off, &dynsym);

    if cfg.verneed.is_some() {
        if cfg.verneed == Some(VerStrings::Separate) {
            write_at(&mut out, vstr_off, &vstr);
        }
        let mut need = vec![];
        em.verneed(&mut need, 1, vn_file_off as u32, 16, 0);
        em.vernaux(&mut need, 0x0d69_6914, 2, vna_name_off as u32, 0);
        write_at(&mut out, verneed_off, &need);
    }

    let mut dynamic = vec![];
    for off in &needed_offs {
        em.dyn_entry(&mut dynamic, DT_NEEDED, *off);
    }
    em.dyn_entry(&mut dynamic, DT_STRTAB, dynstr_off);
    em.dyn_entry(&mut dynamic, DT_STRSZ, dynstr.len() as u64);
    em.dyn_entry(&mut dynamic, DT_SYMTAB, dynsym_off);
    em.dyn_entry(&mut dynamic, DT_SYMENT, sym_size);
    if cfg.verneed.is_some() {
        em.dyn_entry(&mut dynamic, DT_VERNEED, verneed_off);
        em.dyn_entry(&mut dynamic, DT_VERNEEDNUM, 1);
    }
    em.dyn_entry(&mut dynamic, DT_NULL, 0);
    write_at(&mut out, dynamic_off, &dynamic);

    write_at(&mut out, shstrtab_off, &shstrtab);

    // Section header table: null entry first, then the records.
    let mut sht = vec![0u8; shdr_size as usize];
    for sec in &secs {
        let link = sec
            .link_name
            .map(|name| u32::from(section_index(&secs, name)))
            .unwrap_or(0);
        em.shdr(
            &mut sht,
            name_offs[sec.name],
            sec.sh_type,
            sec.flags,
            sec.addr,
            sec.offset,
            sec.size,
            link,
            sec.info,
            sec.addralign,
            sec.entsize,
        );
    }
    write_at(&mut out, sht_off, &sht);

    out
}

pub struct ExecConfig {
    pub class: Class,
    pub big: bool,
    pub machine: u16,
    pub verneed: Option<VerStrings>,
    /// Places the section header table right after the PHT, inside the
    /// region the executable planner reserves.
    pub sht_early: bool,
}

impl ExecConfig {
    pub fn x86_64() -> ExecConfig {
        ExecConfig {
            class: Class::Elf64,
            big: false,
            machine: EM_X86_64,
            verneed: None,
            sht_early: false,
        }
    }
}

pub const EXEC_BASE: u64 = 0x40_0000;
pub const INTERP: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";

/// A small ET_EXEC image: `PT_PHDR`, `PT_INTERP`, one `PT_LOAD` mapping the
/// whole front of the file at `EXEC_BASE`, and `PT_DYNAMIC`.
pub fn build_exec(cfg: &ExecConfig) -> Vec<u8> {
    let em = Emitter {
        class: cfg.class,
        big: cfg.big,
    };
    let ehdr_size = cfg.class.ehdr_size();
    let phdr_size = cfg.class.phdr_size();
    let shdr_size = cfg.class.shdr_size();
    let sym_size = cfg.class.sym_size();
    let dyn_size = cfg.class.dyn_size();

    let phnum: u64 = 4;
    let pht_off = ehdr_size;
    let pht_end = pht_off + phnum * phdr_size;

    let n_sections: u64 = 6
        + match cfg.verneed {
            Some(VerStrings::Separate) => 2,
            Some(VerStrings::InDynstr) => 1,
            None => 0,
        };
    let shnum = (n_sections + 1) as u16;

    let mut cursor = pht_end;
    let sht_off_early = cursor;
    if cfg.sht_early {
        cursor += u64::from(shnum) * shdr_size;
    }

    let interp_off = cursor;
    cursor = align8(interp_off + INTERP.len() as u64);

    let mut dynstr = vec![0u8];
    let needed_off = dynstr.len() as u64;
    dynstr.extend_from_slice(NEEDED_LIB.as_bytes());
    dynstr.push(0);
    let mut dynstr_version_off = 0u64;
    if cfg.verneed == Some(VerStrings::InDynstr) {
        dynstr_version_off = dynstr.len() as u64;
        dynstr.extend_from_slice(VERSION_NAME.as_bytes());
        dynstr.push(0);
    }
    let dynstr_off = cursor;
    cursor = align8(dynstr_off + dynstr.len() as u64);

    let dynsym_off = cursor;
    let dynsym_size = 2 * sym_size;
    cursor = align8(dynsym_off + dynsym_size);

    let mut vstr = vec![];
    let mut vstr_off = 0u64;
    let mut verneed_off = 0u64;
    let mut vn_file_off = 0u64;
    let mut vna_name_off = 0u64;
    match cfg.verneed {
        Some(VerStrings::Separate) => {
            vstr.push(0u8);
            vn_file_off = vstr.len() as u64;
            vstr.extend_from_slice(NEEDED_LIB.as_bytes());
            vstr.push(0);
            vna_name_off = vstr.len() as u64;
            vstr.extend_from_slice(VERSION_NAME.as_bytes());
            vstr.push(0);
            vstr_off = cursor;
            cursor = align8(vstr_off + vstr.len() as u64);
            verneed_off = cursor;
            cursor = align8(verneed_off + 32);
        }
        Some(VerStrings::InDynstr) => {
            vn_file_off = needed_off;
            vna_name_off = dynstr_version_off;
            verneed_off = cursor;
            cursor = align8(verneed_off + 32);
        }
        None => {}
    }

    let dynamic_off = cursor;
    let n_dyn = 5 + if cfg.verneed.is_some() { 2 } else { 0 } + 1;
    let dynamic_size = n_dyn * dyn_size;
    cursor = align8(dynamic_off + dynamic_size);

    let text_off: u64 = if cfg.sht_early { 0x400 } else { 0x240 };
    assert!(cursor <= text_off, "fixture layout overflowed into .text");
    let text_size: u64 = 16;
    let rx_end = text_off + text_size;

    let mut secs: Vec<Sec> = vec![
        Sec {
            name: ".interp",
            sh_type: SHT_PROGBITS,
            flags: u64::from(SHF_ALLOC),
            addr: EXEC_BASE + interp_off,
            offset: interp_off,
            size: INTERP.len() as u64,
            link_name: None,
            info: 0,
            addralign: 1,
            entsize: 0,
        },
        Sec {
            name: ".dynstr",
            sh_type: SHT_STRTAB,
            flags: u64::from(SHF_ALLOC),
            addr: EXEC_BASE + dynstr_off,
            offset: dynstr_off,
            size: dynstr.len() as u64,
            link_name: None,
            info: 0,
            addralign: 1,
            entsize: 0,
        },
        Sec {
            name: ".dynsym",
            sh_type: SHT_DYNSYM,
            flags: u64::from(SHF_ALLOC),
            addr: EXEC_BASE + dynsym_off,
            offset: dynsym_off,
            size: dynsym_size,
            link_name: Some(".dynstr"),
            info: 1,
            addralign: 8,
            entsize: sym_size,
        },
    ];
    if cfg.verneed == Some(VerStrings::Separate) {
        secs.push(Sec {
            name: ".vstr",
            sh_type: SHT_STRTAB,
            flags: u64::from(SHF_ALLOC),
            addr: EXEC_BASE + vstr_off,
            offset: vstr_off,
            size: vstr.len() as u64,
            link_name: None,
            info: 0,
            addralign: 1,
            entsize: 0,
        });
    }
    if cfg.verneed.is_some() {
        secs.push(Sec {
            name: ".gnu.version_r",
            sh_type: SHT_GNU_VERNEED,
            flags: u64::from(SHF_ALLOC),
            addr: EXEC_BASE + verneed_off,
            offset: verneed_off,
            size: 32,
            link_name: Some(match cfg.verneed {
                Some(VerStrings::Separate) => ".vstr",
                _ => ".dynstr",
            }),
            info: 1,
            addralign: 8,
            entsize: 0,
        });
    }
    secs.push(Sec {
        name: ".dynamic",
        sh_type: SHT_DYNAMIC,
        flags: u64::from(SHF_ALLOC | SHF_WRITE),
        addr: EXEC_BASE + dynamic_off,
        offset: dynamic_off,
        size: dynamic_size,
        link_name: Some(".dynstr"),
        info: 0,
        addralign: 8,
        entsize: dyn_size,
    });
    secs.push(Sec {
        name: ".text",
        sh_type: SHT_PROGBITS,
        flags: u64::from(SHF_ALLOC | SHF_EXECINSTR),
        addr: EXEC_BASE + text_off,
        offset: text_off,
        size: text_size,
        link_name: None,
        info: 0,
        addralign: 16,
        entsize: 0,
    });

    let (shstrtab, name_offs) = build_shstrtab(&secs);
    let shstrtab_off = rx_end;
    secs.push(Sec {
        name: ".shstrtab",
        sh_type: SHT_STRTAB,
        flags: 0,
        addr: 0,
        offset: shstrtab_off,
        size: shstrtab.len() as u64,
        link_name: None,
        info: 0,
        addralign: 1,
        entsize: 0,
    });

    let sht_off = if cfg.sht_early {
        sht_off_early
    } else {
        align8(shstrtab_off + shstrtab.len() as u64)
    };
    assert_eq!(shnum, (secs.len() + 1) as u16);
    let shstrndx = section_index(&secs, ".shstrtab");

    let mut out = vec![];
    em.ehdr(&mut out, ET_EXEC, cfg.machine, pht_off, sht_off, phnum as u16, shnum, shstrndx);

    em.phdr(
        &mut out,
        PT_PHDR,
        PF_R,
        pht_off,
        EXEC_BASE + pht_off,
        phnum * phdr_size,
        phnum * phdr_size,
        8,
    );
    em.phdr(
        &mut out,
        PT_INTERP,
        PF_R,
        interp_off,
        EXEC_BASE + interp_off,
        INTERP.len() as u64,
        INTERP.len() as u64,
        1,
    );
    em.phdr(
        &mut out,
        PT_LOAD,
        PF_R | PF_X,
        0,
        EXEC_BASE,
        rx_end,
        rx_end,
        0x1000,
    );
    em.phdr(
        &mut out,
        PT_DYNAMIC,
        PF_R | PF_W,
        dynamic_off,
        EXEC_BASE + dynamic_off,
        dynamic_size,
        dynamic_size,
        8,
    );

    write_at(&mut out, interp_off, INTERP);
    write_at(&mut out, dynstr_off, &dynstr);

    let mut dynsym = vec![];
    em.sym(&mut dynsym, 0, 0, 0, 0, 0);
    em.sym(
        &mut dynsym,
        0,
        STT_SECTION as u8,
        section_index(&secs, ".text"),
        EXEC_BASE + text_off,
        0,
    );
    write_at(&mut out, dynsym_off, &dynsym);

    if cfg.verneed.is_some() {
        if cfg.verneed == Some(VerStrings::Separate) {
            write_at(&mut out, vstr_off, &vstr);
        }
        let mut need = vec![];
        em.verneed(&mut need, 1, vn_file_off as u32, 16, 0);
        em.vernaux(&mut need, 0x0d69_6914, 2, vna_name_off as u32, 0);
        write_at(&mut out, verneed_off, &need);
    }

    let mut dynamic = vec![];
    em.dyn_entry(&mut dynamic, DT_NEEDED, needed_off);
    em.dyn_entry(&mut dynamic, DT_STRTAB, EXEC_BASE + dynstr_off);
    em.dyn_entry(&mut dynamic, DT_STRSZ, dynstr.len() as u64);
    em.dyn_entry(&mut dynamic, DT_SYMTAB, EXEC_BASE + dynsym_off);
    em.dyn_entry(&mut dynamic, DT_SYMENT, sym_size);
    if cfg.verneed.is_some() {
        em.dyn_entry(&mut dynamic, DT_VERNEED, EXEC_BASE + verneed_off);
        em.dyn_entry(&mut dynamic, DT_VERNEEDNUM, 1);
    }
    em.dyn_entry(&mut dynamic, DT_NULL, 0);
    write_at(&mut out, dynamic_off, &dynamic);

    write_at(&mut out, text_off, &[0x90u8; 16]);
    write_at(&mut out, shstrtab_off, &shstrtab);

    let mut sht = vec![0u8; shdr_size as usize];
    for sec in &secs {
        let link = sec
            .link_name
            .map(|name| u32::from(section_index(&secs, name)))
            .unwrap_or(0);
        em.shdr(
            &mut sht,
            name_offs[sec.name],
            sec.sh_type,
            sec.flags,
            sec.addr,
            sec.offset,
            sec.size,
            link,
            sec.info,
            sec.addralign,
            sec.entsize,
        );
    }
    write_at(&mut out, sht_off, &sht);

    out
}

// --- Inspection helpers. The rewriter's own parser is the oracle. ---

pub fn class_of(bytes: &[u8]) -> Class {
    match bytes[4] {
        ELFCLASS32 => Class::Elf32,
        ELFCLASS64 => Class::Elf64,
        other => panic!("unknown ELF class byte {other}"),
    }
}

pub fn endian_of(bytes: &[u8]) -> Endian {
    match bytes[5] {
        ELFDATA2LSB => Endian::Little,
        ELFDATA2MSB => Endian::Big,
        other => panic!("unknown ELF data byte {other}"),
    }
}

pub fn rewrite_with(bytes: Vec<u8>, pairs: &[(&str, &str)]) -> Rewritten {
    let mut renames = HashMap::new();
    for (old, new) in pairs {
        renames.insert((*old).to_string(), (*new).to_string());
    }
    elf_patch::rewrite(bytes, &renames, RewriteOptions::default()).expect("rewrite failed")
}

pub fn reparse<C: ElfClass>(bytes: &[u8]) -> ElfRewriter<C> {
    ElfRewriter::<C>::new(bytes.to_vec(), RewriteOptions::default())
        .expect("rewritten output must parse again")
}

fn read_str(image: &Image, offset: u64) -> String {
    let mut end = offset;
    while image.read_u8(end).expect("string runs past end of file") != 0 {
        end += 1;
    }
    String::from_utf8_lossy(image.slice(offset, end - offset).unwrap()).into_owned()
}

/// The DT_NEEDED names of `bytes`, resolved through `.dynstr`.
pub fn needed_names(bytes: &[u8]) -> Vec<String> {
    match class_of(bytes) {
        Class::Elf32 => needed_names_c::<Elf32>(bytes),
        Class::Elf64 => needed_names_c::<Elf64>(bytes),
    }
}

fn needed_names_c<C: ElfClass>(bytes: &[u8]) -> Vec<String> {
    let rw = reparse::<C>(bytes);
    let dynamic = rw.find_section(".dynamic").expect("no .dynamic");
    let dynstr = rw.find_section(".dynstr").expect("no .dynstr");
    let image = Image::new(bytes.to_vec(), endian_of(bytes));
    let mut names = vec![];
    for i in 0..dynamic.sh_size / C::DYN_SIZE {
        let entry = C::read_dyn(&image, dynamic.sh_offset + i * C::DYN_SIZE).unwrap();
        if entry.d_tag == DT_NULL {
            break;
        }
        if entry.d_tag == DT_NEEDED {
            names.push(read_str(&image, dynstr.sh_offset + entry.d_val));
        }
    }
    names
}

/// The value of the first `.dynamic` entry with `tag`, if any.
pub fn dyn_value(bytes: &[u8], tag: i64) -> Option<u64> {
    match class_of(bytes) {
        Class::Elf32 => dyn_value_c::<Elf32>(bytes, tag),
        Class::Elf64 => dyn_value_c::<Elf64>(bytes, tag),
    }
}

fn dyn_value_c<C: ElfClass>(bytes: &[u8], tag: i64) -> Option<u64> {
    let rw = reparse::<C>(bytes);
    let dynamic = rw.find_section(".dynamic").expect("no .dynamic");
    let image = Image::new(bytes.to_vec(), endian_of(bytes));
    for i in 0..dynamic.sh_size / C::DYN_SIZE {
        let entry = C::read_dyn(&image, dynamic.sh_offset + i * C::DYN_SIZE).unwrap();
        if entry.d_tag == DT_NULL {
            break;
        }
        if entry.d_tag == tag {
            return Some(entry.d_val);
        }
    }
    None
}

/// The raw `d_val` offsets of every DT_NEEDED entry.
pub fn needed_offsets(bytes: &[u8]) -> Vec<u64> {
    match class_of(bytes) {
        Class::Elf32 => needed_offsets_c::<Elf32>(bytes),
        Class::Elf64 => needed_offsets_c::<Elf64>(bytes),
    }
}

fn needed_offsets_c<C: ElfClass>(bytes: &[u8]) -> Vec<u64> {
    let rw = reparse::<C>(bytes);
    let dynamic = rw.find_section(".dynamic").expect("no .dynamic");
    let image = Image::new(bytes.to_vec(), endian_of(bytes));
    let mut offsets = vec![];
    for i in 0..dynamic.sh_size / C::DYN_SIZE {
        let entry = C::read_dyn(&image, dynamic.sh_offset + i * C::DYN_SIZE).unwrap();
        if entry.d_tag == DT_NULL {
            break;
        }
        if entry.d_tag == DT_NEEDED {
            offsets.push(entry.d_val);
        }
    }
    offsets
}

/// The file names referenced from the version-needs table, resolved through
/// the section named by its `sh_link`, plus the raw `vn_file` offsets.
pub fn verneed_files(bytes: &[u8]) -> Vec<(String, u64)> {
    match class_of(bytes) {
        Class::Elf32 => verneed_files_c::<Elf32>(bytes),
        Class::Elf64 => verneed_files_c::<Elf64>(bytes),
    }
}

fn verneed_files_c<C: ElfClass>(bytes: &[u8]) -> Vec<(String, u64)> {
    let rw = reparse::<C>(bytes);
    let version_r = rw.find_section(".gnu.version_r").expect("no .gnu.version_r");
    let strings = rw.shdrs()[version_r.sh_link as usize];
    let count = dyn_value(bytes, DT_VERNEEDNUM).expect("no DT_VERNEEDNUM");
    let image = Image::new(bytes.to_vec(), endian_of(bytes));
    let mut files = vec![];
    let mut off = version_r.sh_offset;
    for _ in 0..count {
        let need = read_verneed(&image, off).unwrap();
        files.push((
            read_str(&image, strings.sh_offset + u64::from(need.vn_file)),
            u64::from(need.vn_file),
        ));
        if need.vn_next == 0 {
            break;
        }
        off += u64::from(need.vn_next);
    }
    files
}
