//! relox: relocation-based obfuscation for 32-bit PE images.
//!
//! The pipeline rebases an image on disk so its declared relocation table
//! cancels out, re-encodes chosen byte ranges as differences against the
//! declared base, and emits a fresh `.reloc` table that turns the OS
//! loader's relocation pass into the decoder.  The on-disk bytes are
//! misleading; the mapped image is not.
//!
//! Entry point for callers is [`PeRecompiler`]; the `pe` module holds the
//! underlying PE32 reader/writer.

pub mod pe;
pub mod recompiler;
pub mod rewrite;
pub mod section;
pub mod stub;

pub use recompiler::{
    PeRecompiler, RecompileError, ACTUALIZED_BASE_ADDRESS, TRICKY_BASE_ADDRESS,
};
