//! Command handlers behind the `baretk` binary.

pub mod commands;
