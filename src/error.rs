//! Error types for the relocation engine.
//!
//! Every fatal diagnostic carries enough context to name the offending
//! input: object, section, byte offset, or symbol name where an offset is
//! not meaningful. The engine never panics on malformed input; low-level
//! primitives report a tri-state patch status which the resolver turns
//! into one of these errors.

use alloc::string::String;
use core::fmt;

/// The error type for link-time relocation processing.
#[derive(Debug)]
pub enum Error {
    /// A relocation type code outside all valid ranges, including the
    /// reserved historical gaps.
    BadRelocType {
        object: String,
        r_type: u32,
    },
    /// A relocation could not be applied: overflow, out-of-range offset,
    /// unaligned target, or a malformed input sequence.
    Reloc {
        object: String,
        section: String,
        offset: u32,
        message: String,
    },
    /// Branch displacement no longer fits its field after relaxation
    /// adjusted it. Relaxation invariants have been violated.
    RelaxOverflow {
        object: String,
        section: String,
        offset: u32,
    },
    /// A symbol was accessed through incompatible GOT semantics
    /// (normal vs. FDPIC vs. thread-local).
    GotTypeConflict {
        object: String,
        symbol: String,
        message: &'static str,
    },
    /// A function descriptor relocation carried a non-zero addend.
    FuncDescAddend {
        object: String,
        symbol: String,
    },
    /// TLS local-exec code in an input destined for a shared object.
    TlsLocalExecInShared {
        object: String,
    },
    /// The instruction bytes at a TLS transition site did not match the
    /// sequence the configured code model requires.
    TlsSequence {
        object: String,
        section: String,
        offset: u32,
        expected: u16,
        found: u16,
    },
    /// An undefined symbol reference escalated to an error by the
    /// caller's unresolved-symbol policy.
    Undefined {
        object: String,
        symbol: String,
    },
    /// Input objects declare incompatible architecture feature sets
    /// (e.g. DSP code linked against FPU code).
    IncompatibleFlags {
        object: String,
        e_flags: u32,
        merged: u32,
    },
    /// Emitted dynamic relocation or fixup counts do not match the space
    /// reserved for them during sizing. Allocator/resolver accounting bug.
    AccountingMismatch {
        section: &'static str,
        reserved: usize,
        emitted: usize,
    },
    /// A fixup or dynamic relocation would land in a read-only section.
    ReadOnlyFixup {
        object: String,
        section: String,
        offset: u32,
        symbol: String,
    },
    /// An engine phase was invoked out of order.
    Phase {
        expected: &'static str,
        current: &'static str,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadRelocType { object, r_type } => {
                write!(f, "{object}: unsupported relocation type {r_type:#x}")
            }
            Error::Reloc {
                object,
                section,
                offset,
                message,
            } => write!(f, "{object}({section}+{offset:#x}): {message}"),
            Error::RelaxOverflow {
                object,
                section,
                offset,
            } => write!(
                f,
                "{object}({section}+{offset:#x}): fatal: reloc overflow while relaxing"
            ),
            Error::GotTypeConflict {
                object,
                symbol,
                message,
            } => write!(f, "{object}: `{symbol}' {message}"),
            Error::FuncDescAddend { object, symbol } => write!(
                f,
                "{object}: function descriptor relocation against `{symbol}' with non-zero addend"
            ),
            Error::TlsLocalExecInShared { object } => write!(
                f,
                "{object}: TLS local exec code cannot be linked into shared objects"
            ),
            Error::TlsSequence {
                object,
                section,
                offset,
                expected,
                found,
            } => write!(
                f,
                "{object}({section}+{offset:#x}): unexpected instruction {found:#06x} (expected {expected:#06x})"
            ),
            Error::Undefined { object, symbol } => {
                write!(f, "{object}: undefined reference to `{symbol}'")
            }
            Error::IncompatibleFlags {
                object,
                e_flags,
                merged,
            } => write!(
                f,
                "{object}: uses {e_flags:#x} instructions while previous modules use {merged:#x}"
            ),
            Error::AccountingMismatch {
                section,
                reserved,
                emitted,
            } => write!(
                f,
                "{section}: reserved space for {reserved} entries but emitted {emitted}"
            ),
            Error::ReadOnlyFixup {
                object,
                section,
                offset,
                symbol,
            } => write!(
                f,
                "{object}({section}+{offset:#x}): cannot emit fixup to `{symbol}' in read-only section"
            ),
            Error::Phase { expected, current } => {
                write!(f, "link phase out of order: expected {expected}, in {current}")
            }
        }
    }
}

impl core::error::Error for Error {}

/// Build a [`Error::Reloc`] carrying the standard object/section/offset
/// context. Used by the resolver and the relaxation engine wherever a
/// per-site diagnostic is raised.
pub(crate) fn reloc_error(
    object: &str,
    section: &str,
    offset: u32,
    message: impl Into<String>,
) -> Error {
    Error::Reloc {
        object: object.into(),
        section: section.into(),
        offset,
        message: message.into(),
    }
}
