//! RISC-V Instruction Decoder
//!
//! Covers RV32I/RV64I, the M extension and the commonly emitted subset of the
//! C (compressed) extension. Instruction parcels are always little-endian,
//! whatever the data endianness of the container.
//!
//! # Pseudo-instructions
//! A few canonical aliases are produced directly so listings read like
//! `objdump` output: `nop`, `li`, `mv`, `j`, `jr`, `ret`, `beqz`, `bnez`.
//!
//! # Control flow
//! `jal`/`jalr` are classified by their link register:
//! - `jal x0` is an unconditional jump
//! - `jal rd` (rd != x0) is a call
//! - `jalr x0, 0(ra)` is a return
//! - `jalr x0, rs` is an indirect jump, `jalr rd, rs` an indirect call

use crate::decoder::{
    Condition, DecodeError, Decoded, Decoder, FlowKind, Instruction, MemoryOperand, Operand,
    Operation, Register,
};
use crate::loader::{ByteSource, Endianness};

const NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

const ZERO: u32 = 0;
const RA: u32 = 1;
const SP: u32 = 2;

/// Base integer register width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

#[derive(Debug, Clone, Copy)]
pub struct RiscVDecoder {
    xlen: Xlen,
}

/// Register name for index `i` (0-31).
pub fn register_name(i: u32) -> &'static str {
    NAMES[(i & 31) as usize]
}

/// Sign-extend the low `bits` bits of `value`.
#[inline]
fn sext(value: u32, bits: u32) -> i64 {
    let shift: u32 = 32 - bits;
    i64::from(((value << shift) as i32) >> shift)
}

impl RiscVDecoder {
    pub fn new(xlen: Xlen) -> Self {
        Self { xlen }
    }

    fn rv64(&self) -> bool {
        self.xlen == Xlen::Rv64
    }

    fn reg(&self, i: u32) -> Operand {
        Operand::Register(Register::new(register_name(i), self.word_size()))
    }

    fn mem(&self, base: u32, displacement: i64, size: u8) -> Operand {
        Operand::Memory(MemoryOperand {
            base: Some(Register::new(register_name(base), self.word_size())),
            index: None,
            displacement,
            size,
            segment: None,
            writeback: false,
        })
    }

    /// Immediate ALU form, with the `nop`/`li`/`mv` aliases of `addi`.
    fn alu_imm(
        &self,
        mnemonic: &'static str,
        op: Operation,
        rd: u32,
        rs1: u32,
        imm: i64,
    ) -> Decoded {
        if mnemonic == "addi" {
            if rd == ZERO && rs1 == ZERO && imm == 0 {
                return Decoded::new("nop", Operation::Nop, &[]);
            }
            if rs1 == ZERO {
                let ops = [self.reg(rd), Operand::Immediate(imm)];
                return Decoded::new("li", Operation::Move, &ops);
            }
            if imm == 0 {
                return Decoded::new("mv", Operation::Move, &[self.reg(rd), self.reg(rs1)]);
            }
        }
        Decoded::new(
            mnemonic,
            op,
            &[self.reg(rd), self.reg(rs1), Operand::Immediate(imm)],
        )
    }

    fn alu_reg(
        &self,
        mnemonic: &'static str,
        op: Operation,
        rd: u32,
        rs1: u32,
        rs2: u32,
    ) -> Decoded {
        Decoded::new(mnemonic, op, &[self.reg(rd), self.reg(rs1), self.reg(rs2)])
    }

    fn jal(&self, rd: u32, target: u64) -> Decoded {
        let addr = Operand::Address(target);
        match rd {
            ZERO => Decoded::new("j", Operation::Jump, &[addr])
                .flow(FlowKind::UnconditionalBranch, Some(target)),
            RA => Decoded::new("jal", Operation::Call, &[addr]).flow(FlowKind::Call, Some(target)),
            _ => Decoded::new("jal", Operation::Call, &[self.reg(rd), addr])
                .flow(FlowKind::Call, Some(target)),
        }
    }

    fn jalr(&self, rd: u32, rs1: u32, imm: i64) -> Decoded {
        match (rd, rs1, imm) {
            (ZERO, RA, 0) => {
                Decoded::new("ret", Operation::Return, &[]).flow(FlowKind::Return, None)
            }
            (ZERO, _, 0) => Decoded::new("jr", Operation::Jump, &[self.reg(rs1)])
                .flow(FlowKind::UnconditionalBranch, None),
            (ZERO, _, _) => Decoded::new("jr", Operation::Jump, &[self.mem(rs1, imm, 0)])
                .flow(FlowKind::UnconditionalBranch, None),
            _ => Decoded::new(
                "jalr",
                Operation::Call,
                &[self.reg(rd), self.reg(rs1), Operand::Immediate(imm)],
            )
            .flow(FlowKind::Call, None),
        }
    }

    fn branch(
        &self,
        mnemonic: &'static str,
        cc: Condition,
        ops: &[Operand],
        target: u64,
    ) -> Decoded {
        Decoded::new(mnemonic, Operation::Branch(cc), ops)
            .flow(FlowKind::ConditionalBranch, Some(target))
    }

    /// Decode a 32-bit instruction. `None` means reserved or unsupported.
    #[inline(never)] // Large function - don't inline
    fn standard(&self, w: u32, address: u64) -> Option<Decoded> {
        use Operation as Op;

        let opcode: u32 = w & 0x7f;
        let rd: u32 = (w >> 7) & 31;
        let funct3: u32 = (w >> 12) & 7;
        let rs1: u32 = (w >> 15) & 31;
        let rs2: u32 = (w >> 20) & 31;
        let funct7: u32 = w >> 25;
        let imm_i: i64 = sext(w >> 20, 12);
        let shamt_mask: u32 = if self.rv64() { 0x3f } else { 0x1f };

        let d: Decoded = match opcode {
            0x37 => Decoded::new(
                "lui",
                Op::LoadUpperImmediate,
                &[self.reg(rd), Operand::Immediate(i64::from(w >> 12))],
            ),
            0x17 => Decoded::new(
                "auipc",
                Op::AddUpperPc,
                &[self.reg(rd), Operand::Immediate(i64::from(w >> 12))],
            ),
            0x6f => {
                let imm: u32 = ((w >> 11) & 0x10_0000)
                    | (w & 0xf_f000)
                    | ((w >> 9) & 0x800)
                    | ((w >> 20) & 0x7fe);
                self.jal(rd, address.wrapping_add(sext(imm, 21) as u64))
            }
            0x67 if funct3 == 0 => self.jalr(rd, rs1, imm_i),
            0x63 => {
                let imm: u32 = ((w >> 19) & 0x1000)
                    | ((w << 4) & 0x800)
                    | ((w >> 20) & 0x7e0)
                    | ((w >> 7) & 0x1e);
                let target: u64 = address.wrapping_add(sext(imm, 13) as u64);
                let (mnemonic, cc) = match funct3 {
                    0 => ("beq", Condition::Equal),
                    1 => ("bne", Condition::NotEqual),
                    4 => ("blt", Condition::Less),
                    5 => ("bge", Condition::GreaterEqual),
                    6 => ("bltu", Condition::Below),
                    7 => ("bgeu", Condition::AboveEqual),
                    _ => return None,
                };
                let ops = [self.reg(rs1), self.reg(rs2), Operand::Address(target)];
                self.branch(mnemonic, cc, &ops, target)
            }
            0x03 => {
                let (mnemonic, size): (&'static str, u8) = match funct3 {
                    0 => ("lb", 1),
                    1 => ("lh", 2),
                    2 => ("lw", 4),
                    3 if self.rv64() => ("ld", 8),
                    4 => ("lbu", 1),
                    5 => ("lhu", 2),
                    6 if self.rv64() => ("lwu", 4),
                    _ => return None,
                };
                Decoded::new(mnemonic, Op::Load, &[self.reg(rd), self.mem(rs1, imm_i, size)])
            }
            0x23 => {
                let imm: i64 = sext(((w >> 20) & 0xfe0) | ((w >> 7) & 0x1f), 12);
                let (mnemonic, size): (&'static str, u8) = match funct3 {
                    0 => ("sb", 1),
                    1 => ("sh", 2),
                    2 => ("sw", 4),
                    3 if self.rv64() => ("sd", 8),
                    _ => return None,
                };
                Decoded::new(mnemonic, Op::Store, &[self.reg(rs2), self.mem(rs1, imm, size)])
            }
            0x13 => {
                let shamt: i64 = i64::from((w >> 20) & shamt_mask);
                match funct3 {
                    0 => self.alu_imm("addi", Op::Add, rd, rs1, imm_i),
                    2 => self.alu_imm("slti", Op::SetLess, rd, rs1, imm_i),
                    3 => self.alu_imm("sltiu", Op::SetLessUnsigned, rd, rs1, imm_i),
                    4 => self.alu_imm("xori", Op::Xor, rd, rs1, imm_i),
                    6 => self.alu_imm("ori", Op::Or, rd, rs1, imm_i),
                    7 => self.alu_imm("andi", Op::And, rd, rs1, imm_i),
                    1 if w >> 26 == 0 => self.alu_imm("slli", Op::ShiftLeft, rd, rs1, shamt),
                    5 if w >> 26 == 0 => self.alu_imm("srli", Op::ShiftRight, rd, rs1, shamt),
                    5 if w >> 26 == 0x10 => {
                        self.alu_imm("srai", Op::ShiftRightArith, rd, rs1, shamt)
                    }
                    _ => return None,
                }
            }
            0x1b if self.rv64() => {
                let shamt: i64 = i64::from((w >> 20) & 0x1f);
                match (funct3, funct7) {
                    (0, _) => self.alu_imm("addiw", Op::Add, rd, rs1, imm_i),
                    (1, 0) => self.alu_imm("slliw", Op::ShiftLeft, rd, rs1, shamt),
                    (5, 0) => self.alu_imm("srliw", Op::ShiftRight, rd, rs1, shamt),
                    (5, 0x20) => self.alu_imm("sraiw", Op::ShiftRightArith, rd, rs1, shamt),
                    _ => return None,
                }
            }
            0x33 => {
                let (mnemonic, op): (&'static str, Operation) = match (funct7, funct3) {
                    (0, 0) => ("add", Op::Add),
                    (0x20, 0) => ("sub", Op::Sub),
                    (0, 1) => ("sll", Op::ShiftLeft),
                    (0, 2) => ("slt", Op::SetLess),
                    (0, 3) => ("sltu", Op::SetLessUnsigned),
                    (0, 4) => ("xor", Op::Xor),
                    (0, 5) => ("srl", Op::ShiftRight),
                    (0x20, 5) => ("sra", Op::ShiftRightArith),
                    (0, 6) => ("or", Op::Or),
                    (0, 7) => ("and", Op::And),
                    (1, 0) => ("mul", Op::Mul),
                    (1, 1) => ("mulh", Op::Other),
                    (1, 2) => ("mulhsu", Op::Other),
                    (1, 3) => ("mulhu", Op::Other),
                    (1, 4) => ("div", Op::Div),
                    (1, 5) => ("divu", Op::DivUnsigned),
                    (1, 6) => ("rem", Op::Rem),
                    (1, 7) => ("remu", Op::RemUnsigned),
                    _ => return None,
                };
                self.alu_reg(mnemonic, op, rd, rs1, rs2)
            }
            0x3b if self.rv64() => {
                let (mnemonic, op): (&'static str, Operation) = match (funct7, funct3) {
                    (0, 0) => ("addw", Op::Add),
                    (0x20, 0) => ("subw", Op::Sub),
                    (0, 1) => ("sllw", Op::ShiftLeft),
                    (0, 5) => ("srlw", Op::ShiftRight),
                    (0x20, 5) => ("sraw", Op::ShiftRightArith),
                    (1, 0) => ("mulw", Op::Mul),
                    (1, 4) => ("divw", Op::Div),
                    (1, 5) => ("divuw", Op::DivUnsigned),
                    (1, 6) => ("remw", Op::Rem),
                    (1, 7) => ("remuw", Op::RemUnsigned),
                    _ => return None,
                };
                self.alu_reg(mnemonic, op, rd, rs1, rs2)
            }
            0x0f => match funct3 {
                0 => Decoded::new("fence", Op::Fence, &[]),
                1 => Decoded::new("fence.i", Op::Fence, &[]),
                _ => return None,
            },
            0x73 => match (funct3, w) {
                (0, 0x0000_0073) => Decoded::new("ecall", Op::SystemCall, &[]),
                (0, 0x0010_0073) => Decoded::new("ebreak", Op::Breakpoint, &[]),
                (0, 0x1050_0073) => Decoded::new("wfi", Op::Halt, &[]),
                (0, 0x1020_0073) => {
                    Decoded::new("sret", Op::Return, &[]).flow(FlowKind::Return, None)
                }
                (0, 0x3020_0073) => {
                    Decoded::new("mret", Op::Return, &[]).flow(FlowKind::Return, None)
                }
                (0, _) | (4, _) => return None,
                _ => {
                    let mnemonic: &'static str = match funct3 {
                        1 => "csrrw",
                        2 => "csrrs",
                        3 => "csrrc",
                        5 => "csrrwi",
                        6 => "csrrsi",
                        _ => "csrrci",
                    };
                    let src: Operand = if funct3 >= 5 {
                        Operand::Immediate(i64::from(rs1))
                    } else {
                        self.reg(rs1)
                    };
                    Decoded::new(
                        mnemonic,
                        Op::Other,
                        &[self.reg(rd), Operand::Immediate(i64::from(w >> 20)), src],
                    )
                }
            },
            _ => return None,
        };
        Some(d)
    }

    /// Decode a 16-bit compressed instruction. `None` means reserved or unsupported.
    #[inline(never)] // Large function - don't inline
    fn compressed(&self, p: u32, address: u64) -> Option<Decoded> {
        use Operation as Op;

        let funct3: u32 = (p >> 13) & 7;
        let rd: u32 = (p >> 7) & 31;
        let rs2: u32 = (p >> 2) & 31;
        // Three-bit register fields address x8-x15.
        let rd_p: u32 = 8 + ((p >> 2) & 7);
        let rs1_p: u32 = 8 + ((p >> 7) & 7);
        let imm6: i64 = sext(((p >> 7) & 0x20) | ((p >> 2) & 0x1f), 6);
        let uimm6: i64 = i64::from(((p >> 7) & 0x20) | ((p >> 2) & 0x1f));

        let d: Decoded = match (p & 3, funct3) {
            (0, 0) => {
                let imm: u32 =
                    ((p >> 7) & 0x30) | ((p >> 1) & 0x3c0) | ((p >> 4) & 0x4) | ((p >> 2) & 0x8);
                if imm == 0 {
                    return None;
                }
                self.alu_imm("addi", Op::Add, rd_p, SP, i64::from(imm))
            }
            (0, 2) | (0, 6) => {
                let off: i64 =
                    i64::from(((p >> 7) & 0x38) | ((p >> 4) & 0x4) | ((p << 1) & 0x40));
                if funct3 == 2 {
                    Decoded::new("lw", Op::Load, &[self.reg(rd_p), self.mem(rs1_p, off, 4)])
                } else {
                    Decoded::new("sw", Op::Store, &[self.reg(rd_p), self.mem(rs1_p, off, 4)])
                }
            }
            (0, 3) | (0, 7) if self.rv64() => {
                let off: i64 = i64::from(((p >> 7) & 0x38) | ((p << 1) & 0xc0));
                if funct3 == 3 {
                    Decoded::new("ld", Op::Load, &[self.reg(rd_p), self.mem(rs1_p, off, 8)])
                } else {
                    Decoded::new("sd", Op::Store, &[self.reg(rd_p), self.mem(rs1_p, off, 8)])
                }
            }
            (1, 0) => self.alu_imm("addi", Op::Add, rd, rd, imm6),
            (1, 1) if self.rv64() => {
                if rd == ZERO {
                    return None;
                }
                self.alu_imm("addiw", Op::Add, rd, rd, imm6)
            }
            (1, 1) => self.jal(RA, address.wrapping_add(cj_offset(p) as u64)),
            (1, 2) => self.alu_imm("addi", Op::Add, rd, ZERO, imm6),
            (1, 3) if rd == SP => {
                let imm: u32 = ((p >> 3) & 0x200)
                    | ((p >> 2) & 0x10)
                    | ((p << 1) & 0x40)
                    | ((p << 4) & 0x180)
                    | ((p << 3) & 0x20);
                if imm == 0 {
                    return None;
                }
                self.alu_imm("addi", Op::Add, SP, SP, sext(imm, 10))
            }
            (1, 3) => {
                if imm6 == 0 || rd == ZERO {
                    return None;
                }
                Decoded::new(
                    "lui",
                    Op::LoadUpperImmediate,
                    &[self.reg(rd), Operand::Immediate(imm6 & 0xf_ffff)],
                )
            }
            (1, 4) => match (p >> 10) & 3 {
                0 => self.alu_imm("srli", Op::ShiftRight, rs1_p, rs1_p, uimm6),
                1 => self.alu_imm("srai", Op::ShiftRightArith, rs1_p, rs1_p, uimm6),
                2 => self.alu_imm("andi", Op::And, rs1_p, rs1_p, imm6),
                _ => {
                    let wide: u32 = (p >> 12) & 1;
                    let (mnemonic, op): (&'static str, Operation) = match (wide, (p >> 5) & 3) {
                        (0, 0) => ("sub", Op::Sub),
                        (0, 1) => ("xor", Op::Xor),
                        (0, 2) => ("or", Op::Or),
                        (0, 3) => ("and", Op::And),
                        (1, 0) if self.rv64() => ("subw", Op::Sub),
                        (1, 1) if self.rv64() => ("addw", Op::Add),
                        _ => return None,
                    };
                    self.alu_reg(mnemonic, op, rs1_p, rs1_p, rd_p)
                }
            },
            (1, 5) => self.jal(ZERO, address.wrapping_add(cj_offset(p) as u64)),
            (1, 6) | (1, 7) => {
                let imm: u32 = ((p >> 4) & 0x100)
                    | ((p >> 7) & 0x18)
                    | ((p << 1) & 0xc0)
                    | ((p >> 2) & 0x6)
                    | ((p << 3) & 0x20);
                let target: u64 = address.wrapping_add(sext(imm, 9) as u64);
                let ops = [self.reg(rs1_p), Operand::Address(target)];
                if funct3 == 6 {
                    self.branch("beqz", Condition::Equal, &ops, target)
                } else {
                    self.branch("bnez", Condition::NotEqual, &ops, target)
                }
            }
            (2, 0) => self.alu_imm("slli", Op::ShiftLeft, rd, rd, uimm6),
            (2, 2) if rd != ZERO => {
                let off: i64 =
                    i64::from(((p >> 7) & 0x20) | ((p >> 2) & 0x1c) | ((p << 4) & 0xc0));
                Decoded::new("lw", Op::Load, &[self.reg(rd), self.mem(SP, off, 4)])
            }
            (2, 3) if rd != ZERO && self.rv64() => {
                let off: i64 =
                    i64::from(((p >> 7) & 0x20) | ((p >> 2) & 0x18) | ((p << 4) & 0x1c0));
                Decoded::new("ld", Op::Load, &[self.reg(rd), self.mem(SP, off, 8)])
            }
            (2, 4) => match ((p >> 12) & 1, rd, rs2) {
                (0, ZERO, _) => return None,
                (0, _, ZERO) => self.jalr(ZERO, rd, 0),
                (0, _, _) => Decoded::new("mv", Op::Move, &[self.reg(rd), self.reg(rs2)]),
                (_, ZERO, ZERO) => Decoded::new("ebreak", Op::Breakpoint, &[]),
                (_, _, ZERO) => self.jalr(RA, rd, 0),
                _ => self.alu_reg("add", Op::Add, rd, rd, rs2),
            },
            (2, 6) => {
                let off: i64 = i64::from(((p >> 7) & 0x3c) | ((p >> 1) & 0xc0));
                Decoded::new("sw", Op::Store, &[self.reg(rs2), self.mem(SP, off, 4)])
            }
            (2, 7) if self.rv64() => {
                let off: i64 = i64::from(((p >> 7) & 0x38) | ((p >> 1) & 0x1c0));
                Decoded::new("sd", Op::Store, &[self.reg(rs2), self.mem(SP, off, 8)])
            }
            _ => return None,
        };
        Some(d)
    }
}

/// Offset of `c.j` / `c.jal`.
fn cj_offset(p: u32) -> i64 {
    let imm: u32 = ((p >> 1) & 0x800)
        | ((p >> 7) & 0x10)
        | ((p >> 1) & 0x300)
        | ((p << 2) & 0x400)
        | ((p >> 1) & 0x40)
        | ((p << 1) & 0x80)
        | ((p >> 2) & 0xe)
        | ((p << 3) & 0x20);
    sext(imm, 12)
}

impl Decoder for RiscVDecoder {
    fn name(&self) -> &'static str {
        match self.xlen {
            Xlen::Rv32 => "riscv32",
            Xlen::Rv64 => "riscv64",
        }
    }

    fn alignment(&self) -> u64 {
        2
    }

    fn word_size(&self) -> u8 {
        match self.xlen {
            Xlen::Rv32 => 4,
            Xlen::Rv64 => 8,
        }
    }

    fn decode(
        &self,
        bytes: &[u8],
        address: u64,
        _endianness: Endianness,
    ) -> Result<(Instruction, usize), DecodeError> {
        let src = ByteSource::new(bytes, Endianness::Little);
        let parcel: u32 = u32::from(src.read_u16(0).map_err(|_| DecodeError::Truncated {
            address,
            needed: 2 - bytes.len().min(2),
        })?);

        let (decoded, length): (Option<Decoded>, usize) = if parcel == 0 {
            (None, 2)
        } else if parcel & 3 != 3 {
            (self.compressed(parcel, address), 2)
        } else if parcel & 0x1c == 0x1c {
            // 48-bit and longer encodings
            (None, 2)
        } else {
            let word: u32 = src.read_u32(0).map_err(|_| DecodeError::Truncated {
                address,
                needed: 4 - bytes.len().min(4),
            })?;
            (self.standard(word, address), 4)
        };

        match decoded {
            Some(d) => Ok((d.finish(address, &bytes[..length]), length)),
            None => Err(DecodeError::InvalidOpcode { address, length }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(dec: &RiscVDecoder, bytes: &[u8], address: u64) -> Instruction {
        dec.decode(bytes, address, Endianness::Little).unwrap().0
    }

    #[test]
    fn base_arithmetic() {
        let dec = RiscVDecoder::new(Xlen::Rv64);
        // addi a0, a0, 1
        let insn = decode(&dec, &0x0015_0513u32.to_le_bytes(), 0);
        assert_eq!(insn.to_string(), "addi a0, a0, 0x1");
        assert_eq!(insn.length, 4);
        // li a0, 42 (addi a0, zero, 42)
        let li = decode(&dec, &0x02a0_0513u32.to_le_bytes(), 0);
        assert_eq!(li.to_string(), "li a0, 0x2a");
        assert_eq!(li.operation, Operation::Move);
    }

    #[test]
    fn jal_and_jalr_classified_by_link_register() {
        let dec = RiscVDecoder::new(Xlen::Rv32);
        // jal ra, +16
        let call = decode(&dec, &0x0100_00efu32.to_le_bytes(), 0x1000);
        assert_eq!(call.flow, FlowKind::Call);
        assert_eq!(call.target, Some(0x1010));
        // jal zero, -4
        let jump = decode(&dec, &0xffdf_f06fu32.to_le_bytes(), 0x1000);
        assert_eq!(jump.flow, FlowKind::UnconditionalBranch);
        assert_eq!(jump.target, Some(0xffc));
        // jalr zero, 0(ra)
        let ret = decode(&dec, &0x0000_8067u32.to_le_bytes(), 0);
        assert_eq!(ret.mnemonic, "ret");
        assert_eq!(ret.flow, FlowKind::Return);
    }

    #[test]
    fn conditional_branch_target() {
        let dec = RiscVDecoder::new(Xlen::Rv32);
        // bne a0, a1, +8
        let insn = decode(&dec, &0x00b5_1463u32.to_le_bytes(), 0x2000);
        assert_eq!(insn.flow, FlowKind::ConditionalBranch);
        assert_eq!(insn.target, Some(0x2008));
        assert_eq!(insn.operation, Operation::Branch(Condition::NotEqual));
    }

    #[test]
    fn loads_and_stores() {
        let dec = RiscVDecoder::new(Xlen::Rv64);
        // ld ra, 8(sp)
        let ld = decode(&dec, &0x0081_3083u32.to_le_bytes(), 0);
        assert_eq!(ld.to_string(), "ld ra, qword ptr [sp + 0x8]");
        // sw a0, -4(s0)
        let sw = decode(&dec, &0xfea4_2e23u32.to_le_bytes(), 0);
        assert_eq!(sw.to_string(), "sw a0, dword ptr [s0 - 0x4]");
    }

    #[test]
    fn compressed_subset() {
        let dec = RiscVDecoder::new(Xlen::Rv64);
        // c.ret
        let (ret, len) = dec.decode(&[0x82, 0x80], 0, Endianness::Little).unwrap();
        assert_eq!(len, 2);
        assert_eq!(ret.flow, FlowKind::Return);
        // c.li a0, 5
        let li = decode(&dec, &[0x15, 0x45], 0);
        assert_eq!(li.to_string(), "li a0, 0x5");
        // c.addi sp, -16
        let addi = decode(&dec, &[0x41, 0x11], 0);
        assert_eq!(addi.to_string(), "addi sp, sp, -0x10");
        // c.j -2
        let j = decode(&dec, &[0xfd, 0xbf], 0x100);
        assert_eq!(j.target, Some(0xfe));
    }

    #[test]
    fn zero_parcel_and_truncation() {
        let dec = RiscVDecoder::new(Xlen::Rv32);
        assert_eq!(
            dec.decode(&[0, 0], 0x10, Endianness::Little).err(),
            Some(DecodeError::InvalidOpcode {
                address: 0x10,
                length: 2
            })
        );
        assert!(matches!(
            dec.decode(&[0x13, 0x05], 0, Endianness::Little),
            Err(DecodeError::Truncated { needed: 2, .. })
        ));
        assert!(matches!(
            dec.decode(&[0x13], 0, Endianness::Little),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
