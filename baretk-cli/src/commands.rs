// CLI command handlers
use anyhow::{Context, Result};
use baretk_core::pipeline::{self, AnalysisStats};
use baretk_core::{AnalysisConfig, Decomp, Disassembly, Language};
use std::path::Path;

/// Analysis settings from `--config`, or the defaults.
pub fn load_config(path: Option<&Path>) -> Result<AnalysisConfig> {
    match path {
        Some(path) => AnalysisConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(AnalysisConfig::default()),
    }
}

/// `baretk dis`: objdump-style listing.
pub fn disassemble(input: &Path, out: Option<&Path>, config: &AnalysisConfig) -> Result<()> {
    let disassembly: Disassembly = pipeline::disassemble_file(input, config)?;
    report(&AnalysisStats::of(&disassembly));
    pipeline::write_output(&disassembly.listing(), out)
}

/// `baretk decomp`: pseudocode or C.
pub fn decompile(
    input: &Path,
    out: Option<&Path>,
    language: Language,
    config: &AnalysisConfig,
) -> Result<()> {
    let decomp: Decomp = pipeline::decompile_file(input, language, config)?;
    report(&AnalysisStats::of(decomp.disassembly()));
    pipeline::write_output(&decomp.text(), out)
}

/// `baretk dump`: segment and section tables.
pub fn dump(input: &Path, out: Option<&Path>, json: bool) -> Result<()> {
    let text: String = pipeline::dump_file(input, json)?;
    pipeline::write_output(&text, out)
}

/// `baretk strings`: ASCII runs in the raw file bytes.
pub fn strings(
    input: &Path,
    out: Option<&Path>,
    min_len: Option<usize>,
    printable: bool,
    config: &AnalysisConfig,
) -> Result<()> {
    let min_len: usize = min_len.unwrap_or(config.min_string_length);
    let printable_only: bool = printable || config.printable_only;
    let text: String = pipeline::strings_report(input, min_len, printable_only)?;
    pipeline::write_output(&text, out)
}

fn report(stats: &AnalysisStats) {
    log::info!(
        "{} function(s), {} block(s), {} instruction(s), {} invalid",
        stats.functions,
        stats.blocks,
        stats.instructions,
        stats.invalid_instructions
    );
    if stats.partial {
        log::warn!("instruction budget reached; output covers only part of the program");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_config_means_defaults() {
        assert_eq!(load_config(None).unwrap(), AnalysisConfig::default());
    }

    #[test]
    fn config_error_names_the_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{ not json").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to load config"));
    }

    #[test]
    fn strings_use_config_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.bin");
        let out = dir.path().join("out.txt");
        std::fs::write(&input, b"abc\x00abcdefgh\x00").unwrap();
        let config = AnalysisConfig {
            min_string_length: 8,
            ..AnalysisConfig::default()
        };
        strings(&input, Some(&out), None, false, &config).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("00000004: abcdefgh"));
        assert!(!text.contains(": abc\n"));
    }
}
