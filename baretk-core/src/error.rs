//! Error Handling
//!
//! This module provides the error type shared by the loader, disassembler and
//! decompiler, built on `thiserror`.
//!
//! # Error Categories
//! - **I/O errors**: the input path is missing or unreadable
//! - **Container errors**: unknown signature, truncated tables, inconsistent offsets
//! - **Analysis errors**: nothing to disassemble, nothing to structure
//! - **Configuration errors**: unreadable or invalid analysis configuration
//!
//! Local, recoverable conditions (one bad opcode, one unresolved indirect branch,
//! one irreducible region) are never reported through this type. They are kept
//! in-band as sentinel data in the analysis results.

use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, BaretkError>;

/// Fatal error returned by a top-level pipeline call.
#[derive(Error, Debug)]
pub enum BaretkError {
    /// The input file could not be read.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// No known container signature at the start of the input.
    #[error("unsupported container format (magic {magic:02x?})")]
    UnsupportedFormat { magic: Vec<u8> },

    /// A declared structure extends past the available bytes.
    #[error("truncated input: {needed} bytes needed at offset 0x{offset:x}, {available} available")]
    Truncated {
        offset: u64,
        needed: u64,
        available: u64,
    },

    /// Internal offsets or sizes are inconsistent.
    #[error("malformed container: {message}")]
    Malformed { message: String },

    /// No instruction decoder exists for the program's machine type.
    #[error("no instruction decoder for machine type '{machine}'")]
    UnsupportedMachine { machine: String },

    /// The program has no executable segment.
    #[error("program has no executable region")]
    NoExecutableRegion,

    /// The disassembly has no basic blocks to structure.
    #[error("disassembly has an empty control-flow graph")]
    EmptyControlFlow,

    /// The analysis configuration could not be loaded.
    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl BaretkError {
    /// Create a malformed-container error.
    #[cold]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Create a truncation error for a read of `needed` bytes at `offset`.
    #[cold]
    pub fn truncated(offset: u64, needed: u64, available: u64) -> Self {
        Self::Truncated {
            offset,
            needed,
            available,
        }
    }

    /// Create an I/O error tagged with the offending path.
    #[cold]
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for BaretkError {
    #[cold] // Error paths are cold
    fn from(err: serde_json::Error) -> Self {
        BaretkError::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_message_names_offset() {
        let err = BaretkError::truncated(0x40, 56, 12);
        assert_eq!(
            err.to_string(),
            "truncated input: 56 bytes needed at offset 0x40, 12 available"
        );
    }

    #[test]
    fn io_error_keeps_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = BaretkError::io("/tmp/missing", source);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("/tmp/missing"));
    }
}
