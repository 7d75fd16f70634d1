//! omfmatch: locate OMF static-library object code inside a stripped
//! 32-bit PE executable.
//!
//! The pipeline parses the toolchain's OMF libraries into normalized
//! objects (`omf`), reduces the target executable to per-class byte
//! regions (`pe`), then searches those regions for each object's segments,
//! treating relocation sites as wildcards and solving for the addresses
//! the original link must have assigned (`matcher`). The result is a map
//! from library segments and global symbols to virtual addresses, suitable
//! for driving symbol recovery and disassembly annotation.

pub mod driver;
pub mod error;
pub mod matcher;
pub mod omf;
pub mod pe;
