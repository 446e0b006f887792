use std::borrow::Cow;
use std::fmt::{self, Display};

/// Error conditions encountered while rewriting an ELF image.
///
/// Every variant is fatal for the file being rewritten: the engine stops and
/// the caller must discard the image rather than write it out.
#[derive(Debug)]
pub enum Error {
    /// The input is not an ELF file this engine can edit: bad magic, wrong
    /// version, unsupported class or type, header tables out of bounds, or an
    /// unterminated string table.
    Parse {
        /// A descriptive message about what failed to validate.
        msg: Cow<'static, str>,
    },

    /// A section the requested edit depends on is not present in the file.
    MissingSection {
        /// A descriptive message naming the missing section.
        msg: Cow<'static, str>,
    },

    /// The rewritten sections cannot be placed in the file, for example when
    /// shifting an executable would underrun its virtual address space or a
    /// `PT_NOTE` segment overlaps its sections in an unsupported way.
    Layout {
        /// A descriptive message about the infeasible layout.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse { msg } => write!(f, "malformed ELF: {msg}"),
            Error::MissingSection { msg } => write!(f, "{msg}"),
            Error::Layout { msg } => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn parse_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Parse { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn missing_section_error(name: &str) -> Error {
    let extra = if name == ".interp" || name == ".dynamic" || name == ".dynstr" {
        ". The input file is most likely statically linked"
    } else {
        ""
    };
    Error::MissingSection {
        msg: format!("cannot find section '{name}'{extra}").into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn layout_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Layout { msg: msg.into() }
}
