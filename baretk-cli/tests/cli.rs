use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// ELF64 x86-64 executable with one R-X PT_LOAD at 0x401078 holding `code`.
fn elf64(code: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 0x78];
    data[0..4].copy_from_slice(b"\x7fELF");
    data[4] = 2;
    data[5] = 1;
    data[6] = 1;
    data[16..18].copy_from_slice(&2u16.to_le_bytes());
    data[18..20].copy_from_slice(&62u16.to_le_bytes());
    data[24..32].copy_from_slice(&0x401078u64.to_le_bytes());
    data[32..40].copy_from_slice(&64u64.to_le_bytes());
    data[52..54].copy_from_slice(&64u16.to_le_bytes());
    data[54..56].copy_from_slice(&56u16.to_le_bytes());
    data[56..58].copy_from_slice(&1u16.to_le_bytes());

    let ph = 64;
    data[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes());
    data[ph + 4..ph + 8].copy_from_slice(&5u32.to_le_bytes());
    data[ph + 8..ph + 16].copy_from_slice(&0x78u64.to_le_bytes());
    data[ph + 16..ph + 24].copy_from_slice(&0x401078u64.to_le_bytes());
    data[ph + 24..ph + 32].copy_from_slice(&0x401078u64.to_le_bytes());
    data[ph + 32..ph + 40].copy_from_slice(&(code.len() as u64).to_le_bytes());
    data[ph + 40..ph + 48].copy_from_slice(&(code.len() as u64).to_le_bytes());
    data.extend_from_slice(code);
    data
}

fn fixture(dir: &TempDir) -> PathBuf {
    // mov eax, 1 ; jmp back
    let code = [0xb8, 0x01, 0x00, 0x00, 0x00, 0xeb, 0xf9];
    let path = dir.path().join("spin.elf");
    std::fs::write(&path, elf64(&code)).unwrap();
    path
}

fn text_fixture(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("blob.bin");
    std::fs::write(&path, b"\x00\x01baretk test string\x00\xffok\x00").unwrap();
    path
}

fn baretk() -> Command {
    Command::cargo_bin("baretk").unwrap()
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[test]
fn help_lists_subcommands() {
    baretk()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("dis"))
        .stdout(predicate::str::contains("decomp"))
        .stdout(predicate::str::contains("dump"))
        .stdout(predicate::str::contains("strings"));
}

#[test]
fn decomp_defaults_to_pseudocode() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);
    baretk()
        .arg("decomp")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("function sub_401078():"))
        .stdout(predicate::str::contains("    loop:"))
        .stdout(predicate::str::contains("        eax = 1"));
}

#[test]
fn decomp_c_to_file() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);
    let out = dir.path().join("out.c");
    baretk()
        .args(["decomp", "--lang", "C"])
        .arg(&input)
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    let text = read(&out);
    assert!(text.starts_with("#include <stdint.h>\n"));
    assert!(text.contains("void sub_401078(void)"));
    assert!(text.contains("eax = 1;"));
}

#[test]
fn unknown_language_is_rejected() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);
    baretk()
        .args(["decomp", "--lang", "rust"])
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown language"));
}

#[test]
fn dis_lists_instructions() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);
    baretk()
        .arg("dis")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("401078"))
        .stdout(predicate::str::contains("mov"))
        .stdout(predicate::str::contains("jmp"));
}

#[test]
fn dump_json() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);
    baretk()
        .args(["dump", "--json"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"machine\": \"amd64\""))
        .stdout(predicate::str::contains("\"perm\": \"r-x\""));
}

#[test]
fn strings_honours_min_len() {
    let dir = TempDir::new().unwrap();
    let input = text_fixture(&dir);
    baretk()
        .args(["strings", "-n", "8"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("ASCII strings found in"))
        .stdout(predicate::str::contains("00000002: baretk test string"))
        .stdout(predicate::str::contains(": ok").not());

    baretk()
        .args(["strings", "-n", "64"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("baretk test string").not());
}

#[test]
fn missing_input_fails() {
    baretk()
        .args(["decomp", "/nonexistent/input.elf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load program"));
}

#[test]
fn config_file_is_applied() {
    let dir = TempDir::new().unwrap();
    let input = text_fixture(&dir);
    let config = dir.path().join("baretk.json");
    std::fs::write(&config, r#"{ "min_string_length": 64 }"#).unwrap();
    baretk()
        .arg("--config")
        .arg(&config)
        .arg("strings")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("baretk test string").not());
}

#[test]
fn bad_config_fails() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir);
    let config = dir.path().join("bad.json");
    std::fs::write(&config, "{ nope").unwrap();
    baretk()
        .arg("--config")
        .arg(&config)
        .arg("dump")
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}
