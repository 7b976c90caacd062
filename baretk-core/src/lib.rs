//! baretk core
//!
//! Loader, disassembler and decompiler for bare executable files.
//!
//! # Pipeline
//! 1. [`loader::load`] parses ELF or PE bytes into a [`Program`]
//! 2. [`disassemble`] consumes the program and builds a [`Disassembly`]
//! 3. [`decompile`] consumes the disassembly and builds a [`Decomp`]
//!
//! Each stage takes its input by value and exposes the previous stage through
//! a borrowed accessor (`Disassembly::program`, `Decomp::disassembly`).
//! File-based helpers live in [`pipeline`].

pub mod config;
pub mod decoder;
pub mod decomp;
pub mod disasm;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod strings;

pub use config::AnalysisConfig;
pub use decomp::{decompile, decompile_with, Decomp, Language};
pub use disasm::{disassemble, disassemble_with, Disassembly};
pub use error::{BaretkError, Result};
pub use loader::{load, load_file, Endianness, Machine, Permissions, Program, Section, Segment};
pub use strings::{scan_strings, FoundString};
