//! Register tables and ModRM/SIB operand decoding.

use crate::decoder::{DecodeError, MemoryOperand, Operand, Register};
use crate::loader::{ByteSource, Endianness};

const REG8_LEGACY: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];
const REG8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];
const REG16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
const REG32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
const REG64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

/// General purpose register `index` (0-15) of `size` bytes.
///
/// Without a REX prefix, byte registers 4-7 are the legacy high-byte registers.
pub fn gpr(index: u8, size: u8, rex: bool) -> Register {
    let i: usize = (index & 0xf) as usize;
    match size {
        1 if !rex && i < 8 => Register::new(REG8_LEGACY[i], 1),
        1 => Register::new(REG8[i], 1),
        2 => Register::new(REG16[i], 2),
        4 => Register::new(REG32[i], 4),
        _ => Register::new(REG64[i], 8),
    }
}

/// Byte cursor over one instruction's encoding.
pub struct Cursor<'a> {
    src: ByteSource<'a>,
    pub pos: u64,
    address: u64,
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8], address: u64, endianness: Endianness) -> Self {
        Self {
            src: ByteSource::new(bytes, endianness),
            pos: 0,
            address,
        }
    }

    fn truncated(&self, needed: u64) -> DecodeError {
        let available: u64 = (self.src.len() as u64).saturating_sub(self.pos);
        DecodeError::Truncated {
            address: self.address,
            needed: needed.saturating_sub(available) as usize,
        }
    }

    pub fn peek(&self) -> Result<u8, DecodeError> {
        self.src.read_u8(self.pos).map_err(|_| self.truncated(1))
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        let v: u8 = self.peek()?;
        self.pos += 1;
        Ok(v)
    }

    pub fn i8(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from(self.u8()? as i8))
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let v: u16 = self.src.read_u16(self.pos).map_err(|_| self.truncated(2))?;
        self.pos += 2;
        Ok(v)
    }

    pub fn i16(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from(self.u16()? as i16))
    }

    pub fn i32(&mut self) -> Result<i64, DecodeError> {
        let v: u32 = self.src.read_u32(self.pos).map_err(|_| self.truncated(4))?;
        self.pos += 4;
        Ok(i64::from(v as i32))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let v: u64 = self.src.read_u64(self.pos).map_err(|_| self.truncated(8))?;
        self.pos += 8;
        Ok(v)
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> &'a [u8] {
        let end: usize = self.pos as usize;
        &self.src.tail(0)[..end]
    }
}

/// Decoding context established by the prefixes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    pub operand_size: bool,
    pub address_size: bool,
    /// `F3`
    pub rep: bool,
    pub lock: bool,
    pub segment: Option<&'static str>,
    /// Low nibble of the REX byte, `None` without REX
    pub rex: Option<u8>,
}

impl Prefixes {
    #[inline]
    pub fn rex_w(&self) -> bool {
        self.rex.map_or(false, |r| r & 0x8 != 0)
    }

    #[inline]
    pub fn rex_r(&self) -> u8 {
        self.rex.map_or(0, |r| (r >> 2) & 1) << 3
    }

    #[inline]
    pub fn rex_x(&self) -> u8 {
        self.rex.map_or(0, |r| (r >> 1) & 1) << 3
    }

    #[inline]
    pub fn rex_b(&self) -> u8 {
        self.rex.map_or(0, |r| r & 1) << 3
    }
}

/// Decoded ModRM byte.
pub struct ModRm {
    pub mode: u8,
    /// `reg` field extended by REX.R
    pub reg: u8,
    /// `reg` field without extension, used as an opcode extension in groups
    pub digit: u8,
    pub rm: Operand,
    /// The memory operand is RIP-relative and still needs the next-instruction address added
    pub rip_relative: bool,
}

/// Decode a ModRM byte (plus SIB and displacement) whose r/m operand is `size` bytes wide.
///
/// `address_size` is 8 or 4; 16-bit addressing is rejected as an invalid encoding.
pub fn modrm(
    cur: &mut Cursor<'_>,
    prefixes: &Prefixes,
    size: u8,
    address_size: u8,
    long_mode: bool,
    address: u64,
) -> Result<ModRm, DecodeError> {
    let byte: u8 = cur.u8()?;
    let mode: u8 = byte >> 6;
    let digit: u8 = (byte >> 3) & 7;
    let reg: u8 = digit | prefixes.rex_r();
    let rm: u8 = byte & 7;
    let rex: bool = prefixes.rex.is_some();

    if mode == 3 {
        return Ok(ModRm {
            mode,
            reg,
            digit,
            rm: Operand::Register(gpr(rm | prefixes.rex_b(), size, rex)),
            rip_relative: false,
        });
    }
    if address_size == 2 {
        return Err(DecodeError::InvalidOpcode {
            address,
            length: cur.pos as usize,
        });
    }

    let mut base: Option<Register> = None;
    let mut index: Option<(Register, u8)> = None;
    let mut rip_relative: bool = false;
    let mut force_disp32: bool = false;

    if rm == 4 {
        let sib: u8 = cur.u8()?;
        let scale: u8 = 1 << (sib >> 6);
        let index_reg: u8 = ((sib >> 3) & 7) | prefixes.rex_x();
        let base_reg: u8 = sib & 7;
        if index_reg != 4 {
            index = Some((gpr(index_reg, address_size, true), scale));
        }
        if base_reg == 5 && mode == 0 {
            force_disp32 = true;
        } else {
            base = Some(gpr(base_reg | prefixes.rex_b(), address_size, true));
        }
    } else if rm == 5 && mode == 0 {
        force_disp32 = true;
        rip_relative = long_mode;
    } else {
        base = Some(gpr(rm | prefixes.rex_b(), address_size, true));
    }

    let displacement: i64 = match mode {
        1 => cur.i8()?,
        2 => cur.i32()?,
        _ if force_disp32 => cur.i32()?,
        _ => 0,
    };

    Ok(ModRm {
        mode,
        reg,
        digit,
        rm: Operand::Memory(MemoryOperand {
            base,
            index,
            displacement,
            size,
            segment: prefixes.segment,
            writeback: false,
        }),
        rip_relative,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_byte_registers_without_rex() {
        assert_eq!(gpr(4, 1, false).name, "ah");
        assert_eq!(gpr(4, 1, true).name, "spl");
        assert_eq!(gpr(9, 8, true).name, "r9");
        assert_eq!(gpr(0, 2, false).name, "ax");
    }

    #[test]
    fn sib_with_scaled_index() {
        // [rax + rcx*4 + 0x10]: modrm 0x44 (mod=1, reg=0, rm=4), sib 0x88, disp8 0x10
        let bytes = [0x44u8, 0x88, 0x10];
        let mut cur = Cursor::new(&bytes, 0, Endianness::Little);
        let m = modrm(&mut cur, &Prefixes::default(), 4, 8, true, 0).unwrap();
        assert_eq!(cur.pos, 3);
        match m.rm {
            Operand::Memory(mem) => {
                assert_eq!(mem.base.unwrap().name, "rax");
                assert_eq!(mem.index.unwrap(), (Register::new("rcx", 8), 4));
                assert_eq!(mem.displacement, 0x10);
            }
            other => panic!("expected memory operand, got {:?}", other),
        }
    }

    #[test]
    fn missing_displacement_is_truncated() {
        let bytes = [0x80u8, 0x00];
        let mut cur = Cursor::new(&bytes, 0x1000, Endianness::Little);
        let err = modrm(&mut cur, &Prefixes::default(), 4, 8, true, 0x1000).err();
        assert!(matches!(err, Some(DecodeError::Truncated { .. })));
    }
}
