//! Shared fixtures: minimal ELF64 images built in memory.

#![allow(dead_code)]

pub const EM_X86_64: u16 = 62;
pub const EM_ARM: u16 = 40;
pub const EM_RISCV: u16 = 243;
pub const BASE: u64 = 0x401078;

const CODE_OFFSET: usize = 0x78;
const SHSTRTAB: &[u8] = b"\0.text\0.shstrtab\0";

fn put(data: &mut [u8], at: usize, bytes: &[u8]) {
    data[at..at + bytes.len()].copy_from_slice(bytes);
}

/// Little-endian ELF64 executable: one `R-X` PT_LOAD holding `code` at
/// [`BASE`], which is also the entry point, plus `.text` and `.shstrtab`
/// section headers.
pub fn elf64(machine: u16, code: &[u8]) -> Vec<u8> {
    let mut data: Vec<u8> = vec![0u8; CODE_OFFSET];
    put(&mut data, 0, b"\x7fELF");
    data[4] = 2; // ELFCLASS64
    data[5] = 1; // ELFDATA2LSB
    data[6] = 1;
    put(&mut data, 16, &2u16.to_le_bytes());
    put(&mut data, 18, &machine.to_le_bytes());
    put(&mut data, 24, &BASE.to_le_bytes());
    put(&mut data, 32, &64u64.to_le_bytes());
    put(&mut data, 52, &64u16.to_le_bytes());
    put(&mut data, 54, &56u16.to_le_bytes());
    put(&mut data, 56, &1u16.to_le_bytes());

    // PT_LOAD, PF_R | PF_X
    let ph: usize = 64;
    put(&mut data, ph, &1u32.to_le_bytes());
    put(&mut data, ph + 4, &5u32.to_le_bytes());
    put(&mut data, ph + 8, &(CODE_OFFSET as u64).to_le_bytes());
    put(&mut data, ph + 16, &BASE.to_le_bytes());
    put(&mut data, ph + 24, &BASE.to_le_bytes());
    put(&mut data, ph + 32, &(code.len() as u64).to_le_bytes());
    put(&mut data, ph + 40, &(code.len() as u64).to_le_bytes());
    data.extend_from_slice(code);

    let strtab_offset: usize = data.len();
    data.extend_from_slice(SHSTRTAB);
    while data.len() % 8 != 0 {
        data.push(0);
    }
    let shoff: usize = data.len();
    data.resize(shoff + 3 * 64, 0);

    // [1] .text: SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR
    let text: usize = shoff + 64;
    put(&mut data, text, &1u32.to_le_bytes());
    put(&mut data, text + 4, &1u32.to_le_bytes());
    put(&mut data, text + 8, &6u64.to_le_bytes());
    put(&mut data, text + 16, &BASE.to_le_bytes());
    put(&mut data, text + 24, &(CODE_OFFSET as u64).to_le_bytes());
    put(&mut data, text + 32, &(code.len() as u64).to_le_bytes());

    // [2] .shstrtab: SHT_STRTAB
    let names: usize = shoff + 128;
    put(&mut data, names, &7u32.to_le_bytes());
    put(&mut data, names + 4, &3u32.to_le_bytes());
    put(&mut data, names + 24, &(strtab_offset as u64).to_le_bytes());
    put(&mut data, names + 32, &(SHSTRTAB.len() as u64).to_le_bytes());

    put(&mut data, 40, &(shoff as u64).to_le_bytes());
    put(&mut data, 58, &64u16.to_le_bytes());
    put(&mut data, 60, &3u16.to_le_bytes());
    put(&mut data, 62, &2u16.to_le_bytes());
    data
}

/// Little-endian 32-bit instruction words (RISC-V or A32) in memory order.
pub fn riscv_code(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
