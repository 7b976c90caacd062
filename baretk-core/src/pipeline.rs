//! Analysis Pipeline
//!
//! File-based entry points used by the CLI and the C ABI. Each one reads the
//! input, runs the analysis stages in order and attaches the offending path to
//! any error.
//!
//! # Pipeline Stages
//! 1. **Load**: read the file and parse the container into a [`Program`]
//! 2. **Disassemble**: sweep executable code, build blocks, edges and functions
//! 3. **Decompile**: structure each function, lift, fold and emit text
//!
//! Output helpers write rendered text either to stdout or to a file.

use crate::config::AnalysisConfig;
use crate::decomp::{decompile_with, Decomp, Language};
use crate::disasm::{disassemble_with, Disassembly};
use crate::loader::dump::{dump_program, ProgramSummary};
use crate::loader::{self, Program};
use crate::strings::{render_strings, scan_strings, FoundString};
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Counters reported after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisStats {
    pub functions: usize,
    pub blocks: usize,
    pub instructions: usize,
    pub invalid_instructions: usize,
    /// The instruction budget cut the sweep short
    pub partial: bool,
}

impl AnalysisStats {
    pub fn of(disassembly: &Disassembly) -> Self {
        Self {
            functions: disassembly.functions().len(),
            blocks: disassembly.cfg().blocks().len(),
            instructions: disassembly.instruction_count(),
            invalid_instructions: disassembly
                .instructions()
                .filter(|i| i.is_invalid())
                .count(),
            partial: disassembly.is_partial(),
        }
    }
}

/// Step 1: load a program from a file.
pub fn load_program(path: &Path) -> Result<Program> {
    log::info!("Step 1: Loading {}...", path.display());
    let program: Program = loader::load_file(path)
        .with_context(|| format!("failed to load program from {}", path.display()))?;
    log::info!(
        "Loaded {} {}-bit program, {} segment(s), entry 0x{:x}",
        program.machine(),
        program.bits(),
        program.segments().len(),
        program.entry_point()
    );
    Ok(program)
}

/// Steps 1-2: load and disassemble a file.
pub fn disassemble_file(path: &Path, config: &AnalysisConfig) -> Result<Disassembly> {
    let program: Program = load_program(path)?;
    log::info!("Step 2: Disassembling...");
    let disassembly: Disassembly = disassemble_with(program, config)
        .with_context(|| format!("failed to disassemble {}", path.display()))?;
    if disassembly.is_partial() {
        log::warn!(
            "instruction budget of {} reached, disassembly of {} is partial",
            config.max_instructions,
            path.display()
        );
    }
    Ok(disassembly)
}

/// Steps 1-3: load, disassemble and decompile a file.
#[inline(never)] // Large function - don't inline
pub fn decompile_file(path: &Path, language: Language, config: &AnalysisConfig) -> Result<Decomp> {
    let disassembly: Disassembly = disassemble_file(path, config)?;
    let stats: AnalysisStats = AnalysisStats::of(&disassembly);
    log::info!(
        "Step 3: Decompiling {} function(s) to {}...",
        stats.functions,
        language
    );
    let decomp: Decomp = decompile_with(disassembly, language, config)
        .with_context(|| format!("failed to decompile {}", path.display()))?;
    log::info!(
        "Decompiled {} function(s), {} block(s), {} instruction(s)",
        stats.functions,
        stats.blocks,
        stats.instructions
    );
    Ok(decomp)
}

/// objdump-style listing of a file.
pub fn listing_file(path: &Path, config: &AnalysisConfig) -> Result<String> {
    Ok(disassemble_file(path, config)?.listing())
}

/// Segment and section tables of a file, as text or pretty JSON.
pub fn dump_file(path: &Path, json: bool) -> Result<String> {
    let program: Program = load_program(path)?;
    if json {
        let mut text: String = serde_json::to_string_pretty(&ProgramSummary::of(&program))
            .context("failed to serialize program summary")?;
        text.push('\n');
        Ok(text)
    } else {
        Ok(dump_program(&program))
    }
}

/// Scan the raw bytes of a file for ASCII strings.
pub fn strings_file(path: &Path, min_len: usize, printable_only: bool) -> Result<Vec<FoundString>> {
    let bytes: Vec<u8> =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(scan_strings(&bytes, min_len, printable_only))
}

/// String scan rendered as `offset: text` lines, with a header naming the file.
pub fn strings_report(path: &Path, min_len: usize, printable_only: bool) -> Result<String> {
    let found: Vec<FoundString> = strings_file(path, min_len, printable_only)?;
    Ok(format!(
        "ASCII strings found in {}:\n{}",
        path.display(),
        render_strings(&found)
    ))
}

/// Write `text` to `out`, or to stdout when `out` is `None`.
pub fn write_output(text: &str, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            log::info!("Wrote {} bytes to {}", text.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(text.as_bytes())
                .and_then(|_| stdout.flush())
                .context("failed to write to stdout")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BaretkError;

    #[test]
    fn missing_file_keeps_io_error() {
        let err = load_program(Path::new("/nonexistent/baretk.bin")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/baretk.bin"));
        assert!(matches!(
            err.downcast_ref::<BaretkError>(),
            Some(BaretkError::Io { .. })
        ));
    }

    #[test]
    fn unknown_format_is_reported() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not a binary").unwrap();
        let err = disassemble_file(file.path(), &AnalysisConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BaretkError>(),
            Some(BaretkError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn strings_report_has_header() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"\x00\x00hello world\x00").unwrap();
        let report = strings_report(file.path(), 4, true).unwrap();
        assert!(report.starts_with("ASCII strings found in "));
        assert!(report.ends_with("00000002: hello world\n"));
    }

    #[test]
    fn output_goes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        write_output("text\n", Some(&out)).unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "text\n");
    }
}
