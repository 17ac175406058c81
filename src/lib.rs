//! # shlink
//!
//! **shlink** is a link-time relocation engine for SuperH (SH) ELF32. It
//! implements the architecture-specific half of a static/dynamic linker:
//! resolving relocations against final addresses, shortening indirect call
//! sequences into direct branches (relaxation), building the procedure
//! linkage table and global offset table, and supporting the FDPIC ABI's
//! function descriptors alongside all three TLS access models.
//!
//! The generic object-container concerns (parsing ELF files, archives,
//! linker scripts) are deliberately out of scope: inputs are described with
//! the in-memory model in [`object`], and the engine's outputs are patched
//! section contents plus the dynamic artifacts (`.plt`, `.got`, `.got.plt`,
//! `.got.funcdesc`, `.rela.*`, `.rofixup`) ready for byte-exact emission.
//!
//! ## Core Features
//!
//! * **Branch relaxation**: `mov.l`/`jsr` pairs become `bsr`/`bra` when the
//!   target is provably in range, with byte deletion and full offset
//!   repair across relocations, symbols and jump tables.
//! * **Dynamic linking model**: two-pass GOT/PLT/TLS/function-descriptor
//!   allocation with deterministic, link-reproducible layouts.
//! * **TLS relaxation**: GD→IE and GD/IE/LD→LE transitions by direct
//!   instruction rewriting, validated against the expected code sequences.
//! * **Three ABI flavors**: standard SVR4, VxWorks and FDPIC (including the
//!   SH-2A short PLT), big and little endian.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shlink::{LinkConfig, Linker};
//!
//! let mut linker = Linker::new(LinkConfig::default());
//! linker.add_object(my_object);
//! linker.relax()?;
//! linker.scan_relocations()?;
//! linker.layout(0x400000)?;
//! linker.relocate_all()?;
//! linker.finish()?;
//! let got = &linker.dyn_sections().got;
//! ```
#![no_std]
#![warn(
    clippy::unnecessary_wraps,
    clippy::unnecessary_lazy_evaluations,
    clippy::collapsible_if,
    clippy::cast_lossless,
    clippy::explicit_iter_loop,
    clippy::manual_assert,
    clippy::needless_question_mark,
    clippy::needless_return,
    clippy::redundant_clone,
    clippy::redundant_else,
    clippy::redundant_static_lifetimes
)]
#![allow(clippy::len_without_is_empty, clippy::too_many_arguments)]
extern crate alloc;

pub mod abi;
pub mod dynlink;
mod error;
pub mod linker;
pub mod object;
pub mod relax;
pub mod reloc;

pub use error::Error;
pub use linker::{LinkConfig, Linker, OutputKind, UnresolvedPolicy};

/// A type alias for `Result`s returned by `shlink` functions.
///
/// This is a convenience alias that eliminates the need to repeatedly
/// specify the `Error` type in function signatures.
pub type Result<T> = core::result::Result<T, Error>;
