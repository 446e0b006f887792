//! In-place editing of the shared-library dependencies recorded in linked
//! ELF binaries.
//!
//! Renaming a `DT_NEEDED` entry forces `.dynstr` (and possibly the
//! version-needs string section) to grow, which means relocating sections
//! inside the file, carving out file and virtual-address space for them,
//! synthesizing or extending `PT_LOAD` segments so the moved sections stay
//! mapped, and repairing every cross-reference the move perturbs. This crate
//! implements that rewriting engine over a plain byte buffer: bytes and a
//! rename map go in, rewritten bytes come out. Reading and writing files is
//! the caller's business.
//!
//! The engine is generic over the ELF class ([`Elf32`]/[`Elf64`]) and parses
//! either byte order. [`rewrite`] dispatches on `e_ident` for callers that
//! don't care about the class:
//!
//! ```no_run
//! # use std::collections::HashMap;
//! use elf_patch::{rewrite, RewriteOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bytes = std::fs::read("liba.so")?;
//! let mut renames = HashMap::new();
//! renames.insert("libc.so.6".to_string(), "libc-new.so.6".to_string());
//! let out = rewrite(bytes, &renames, RewriteOptions::default())?;
//! if out.changed {
//!     std::fs::write("liba.so", &out.bytes)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod class;
pub mod error;
pub mod image;
mod rewriter;

use std::collections::HashMap;

use elf::abi::{EI_CLASS, ELFCLASS32, ELFCLASS64};

pub use class::{Elf32, Elf64, ElfClass};
pub use error::Error;
pub use rewriter::{ElfRewriter, RewriteOptions};

use error::parse_error;

pub type Result<T> = core::result::Result<T, Error>;

/// Outcome of [`rewrite`]: the file image (identical to the input when no
/// edit applied) and whether any semantic edit occurred.
pub struct Rewritten {
    pub bytes: Vec<u8>,
    pub changed: bool,
}

/// Applies `renames` to the ELF image in `bytes`, dispatching to the 32- or
/// 64-bit engine according to `e_ident`.
pub fn rewrite(
    bytes: Vec<u8>,
    renames: &HashMap<String, String>,
    options: RewriteOptions,
) -> Result<Rewritten> {
    if (bytes.len() as u64) < Elf32::EHDR_SIZE {
        return Err(parse_error("missing ELF header"));
    }
    match bytes[EI_CLASS] {
        ELFCLASS32 => run::<Elf32>(bytes, renames, options),
        ELFCLASS64 => run::<Elf64>(bytes, renames, options),
        _ => Err(parse_error("unsupported ELF class")),
    }
}

fn run<C: ElfClass>(
    bytes: Vec<u8>,
    renames: &HashMap<String, String>,
    options: RewriteOptions,
) -> Result<Rewritten> {
    let mut rewriter = ElfRewriter::<C>::new(bytes, options)?;
    rewriter.replace_needed(renames)?;
    let changed = rewriter.is_changed();
    Ok(Rewritten {
        bytes: rewriter.into_bytes(),
        changed,
    })
}
