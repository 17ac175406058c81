//! Relocation processing.
//!
//! This module implements the final-link relocation engine: descriptor
//! tables describing each relocation's bit-level contract, the low-level
//! instruction patcher, TLS model transitions, zero-overhead loop
//! pairing, and the per-section resolver that drives them all.

pub mod descriptor;
pub mod loops;
pub mod patch;
pub mod resolve;
pub mod tls;

pub use descriptor::{Overflow, RelocDescriptor, TableVariant};
pub use patch::PatchStatus;
pub use resolve::relocate_section;
