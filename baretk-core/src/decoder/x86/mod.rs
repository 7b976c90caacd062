//! x86 / amd64 Instruction Decoder
//!
//! Decodes the general-purpose integer subset of x86 in 32-bit protected mode
//! and 64-bit long mode.
//!
//! # Decoding Algorithm
//! 1. Consume legacy prefixes (`66`, `67`, `F0`, `F2`, `F3`, segment overrides)
//!    and, in long mode, a trailing REX byte
//! 2. Dispatch on the primary opcode byte (or `0F xx` for the two-byte map)
//! 3. Decode ModRM/SIB/displacement and immediates as the opcode requires
//! 4. Resolve relative branch targets and RIP-relative memory operands against
//!    the address of the next instruction
//!
//! Encodings outside the supported subset (x87, SSE/AVX, string instructions,
//! far transfers, segment register moves) are reported as `InvalidOpcode`.
//! So is any encoding longer than the architectural limit of 15 bytes.

mod operands;

pub use operands::gpr;

use crate::decoder::{
    Condition, DecodeError, Decoded, Decoder, FlowKind, Instruction, Operand, Operation,
};
use crate::loader::Endianness;
use operands::{Cursor, ModRm, Prefixes};

/// Architectural maximum instruction length.
const MAX_LENGTH: u64 = 15;

const ALU: [(&str, Operation); 8] = [
    ("add", Operation::Add),
    ("or", Operation::Or),
    ("adc", Operation::AddCarry),
    ("sbb", Operation::SubBorrow),
    ("and", Operation::And),
    ("sub", Operation::Sub),
    ("xor", Operation::Xor),
    ("cmp", Operation::Compare),
];

const SHIFT: [(&str, Operation); 8] = [
    ("rol", Operation::RotateLeft),
    ("ror", Operation::RotateRight),
    ("rcl", Operation::RotateLeft),
    ("rcr", Operation::RotateRight),
    ("shl", Operation::ShiftLeft),
    ("shr", Operation::ShiftRight),
    ("sal", Operation::ShiftLeft),
    ("sar", Operation::ShiftRightArith),
];

const JCC: [&str; 16] = [
    "jo", "jno", "jb", "jae", "je", "jne", "jbe", "ja", "js", "jns", "jp", "jnp", "jl", "jge",
    "jle", "jg",
];
const SETCC: [&str; 16] = [
    "seto", "setno", "setb", "setae", "sete", "setne", "setbe", "seta", "sets", "setns", "setp",
    "setnp", "setl", "setge", "setle", "setg",
];
const CMOVCC: [&str; 16] = [
    "cmovo", "cmovno", "cmovb", "cmovae", "cmove", "cmovne", "cmovbe", "cmova", "cmovs",
    "cmovns", "cmovp", "cmovnp", "cmovl", "cmovge", "cmovle", "cmovg",
];

/// Processor mode the code runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 32-bit protected mode
    Protected,
    /// 64-bit long mode
    Long,
}

/// Decoder for x86 (`Mode::Protected`) and amd64 (`Mode::Long`).
#[derive(Debug, Clone, Copy)]
pub struct X86Decoder {
    mode: Mode,
}

impl X86Decoder {
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }
}

struct Context<'a> {
    cur: Cursor<'a>,
    p: Prefixes,
    address: u64,
    long: bool,
    rip_relative: bool,
}

impl<'a> Context<'a> {
    fn op_size(&self) -> u8 {
        if self.long && self.p.rex_w() {
            8
        } else if self.p.operand_size {
            2
        } else {
            4
        }
    }

    /// Width of pushes, pops and near branches through memory.
    fn stack_size(&self) -> u8 {
        match (self.long, self.p.operand_size) {
            (_, true) => 2,
            (true, false) => 8,
            (false, false) => 4,
        }
    }

    fn address_size(&self) -> u8 {
        match (self.long, self.p.address_size) {
            (true, false) => 8,
            (true, true) | (false, false) => 4,
            (false, true) => 2,
        }
    }

    fn invalid(&self) -> DecodeError {
        DecodeError::InvalidOpcode {
            address: self.address,
            length: (self.cur.pos as usize).max(1),
        }
    }

    fn modrm(&mut self, size: u8) -> Result<ModRm, DecodeError> {
        let address_size = self.address_size();
        let m: ModRm = operands::modrm(
            &mut self.cur,
            &self.p,
            size,
            address_size,
            self.long,
            self.address,
        )?;
        self.rip_relative |= m.rip_relative;
        Ok(m)
    }

    fn reg(&self, index: u8, size: u8) -> Operand {
        Operand::Register(gpr(index, size, self.p.rex.is_some()))
    }

    /// `Iz`-style immediate: 8, 16 or 32 bits (sign-extended to 64 bits when needed).
    fn imm(&mut self, size: u8) -> Result<Operand, DecodeError> {
        let v: i64 = match size {
            1 => self.cur.u8()? as i64,
            2 => self.cur.i16()?,
            _ => self.cur.i32()?,
        };
        Ok(Operand::Immediate(v))
    }

    fn imm8_signed(&mut self) -> Result<Operand, DecodeError> {
        Ok(Operand::Immediate(self.cur.i8()?))
    }

    /// Target of a relative branch whose displacement was the last field read.
    fn relative(&self, rel: i64) -> u64 {
        let target: u64 = self
            .address
            .wrapping_add(self.cur.pos)
            .wrapping_add(rel as u64);
        if self.long {
            target
        } else {
            target & 0xffff_ffff
        }
    }

    fn branch(&mut self, cc: u8, rel: i64) -> Decoded {
        let target: u64 = self.relative(rel);
        Decoded::new(
            JCC[cc as usize],
            Operation::Branch(Condition::from_cc(cc)),
            &[Operand::Address(target)],
        )
        .flow(FlowKind::ConditionalBranch, Some(target))
    }

    fn prefixes(&mut self) -> Result<(), DecodeError> {
        loop {
            let b: u8 = self.cur.peek()?;
            match b {
                0x66 => self.p.operand_size = true,
                0x67 => self.p.address_size = true,
                0xf0 => self.p.lock = true,
                // repne carries no meaning for the supported subset
                0xf2 => {}
                0xf3 => self.p.rep = true,
                0x26 => self.p.segment = Some("es"),
                0x2e => self.p.segment = Some("cs"),
                0x36 => self.p.segment = Some("ss"),
                0x3e => self.p.segment = Some("ds"),
                0x64 => self.p.segment = Some("fs"),
                0x65 => self.p.segment = Some("gs"),
                0x40..=0x4f if self.long => {
                    self.cur.u8()?;
                    self.p.rex = Some(b & 0xf);
                    return Ok(());
                }
                _ => return Ok(()),
            }
            self.cur.u8()?;
            if self.cur.pos >= MAX_LENGTH {
                return Err(self.invalid());
            }
        }
    }

    #[inline(never)] // Large function - don't inline
    fn one_byte(&mut self, opcode: u8) -> Result<Decoded, DecodeError> {
        use Operation as Op;

        let d: Decoded = match opcode {
            // ALU group in its six encodings
            0x00..=0x3f if opcode & 7 < 6 => {
                let (mnemonic, operation) = ALU[(opcode >> 3) as usize];
                let s: u8 = self.op_size();
                let ops: [Operand; 2] = match opcode & 7 {
                    0 => {
                        let m = self.modrm(1)?;
                        [m.rm, self.reg(m.reg, 1)]
                    }
                    1 => {
                        let m = self.modrm(s)?;
                        [m.rm, self.reg(m.reg, s)]
                    }
                    2 => {
                        let m = self.modrm(1)?;
                        [self.reg(m.reg, 1), m.rm]
                    }
                    3 => {
                        let m = self.modrm(s)?;
                        [self.reg(m.reg, s), m.rm]
                    }
                    4 => [self.reg(0, 1), self.imm(1)?],
                    _ => [self.reg(0, s), self.imm(s.min(4))?],
                };
                Decoded::new(mnemonic, operation, &ops)
            }
            0x0f => {
                let op2: u8 = self.cur.u8()?;
                return self.two_byte(op2);
            }
            // inc/dec r32 (only reachable outside long mode, where 40-4F are REX)
            0x40..=0x4f if !self.long => {
                let r = self.reg(opcode & 7, self.op_size());
                if opcode < 0x48 {
                    Decoded::new("inc", Op::Inc, &[r])
                } else {
                    Decoded::new("dec", Op::Dec, &[r])
                }
            }
            0x50..=0x57 => {
                let r = self.reg((opcode & 7) | self.p.rex_b(), self.stack_size());
                Decoded::new("push", Op::Push, &[r])
            }
            0x58..=0x5f => {
                let r = self.reg((opcode & 7) | self.p.rex_b(), self.stack_size());
                Decoded::new("pop", Op::Pop, &[r])
            }
            0x63 if self.long => {
                let s: u8 = self.op_size();
                let m = self.modrm(4)?;
                Decoded::new("movsxd", Op::MoveSignExtend, &[self.reg(m.reg, s), m.rm])
            }
            0x68 => {
                let imm = self.imm(self.op_size().min(4))?;
                Decoded::new("push", Op::Push, &[imm])
            }
            0x6a => {
                let imm = self.imm8_signed()?;
                Decoded::new("push", Op::Push, &[imm])
            }
            0x69 | 0x6b => {
                let s: u8 = self.op_size();
                let m = self.modrm(s)?;
                let imm = if opcode == 0x69 {
                    self.imm(s.min(4))?
                } else {
                    self.imm8_signed()?
                };
                Decoded::new("imul", Op::Mul, &[self.reg(m.reg, s), m.rm, imm])
            }
            0x70..=0x7f => {
                let rel: i64 = self.cur.i8()?;
                self.branch(opcode & 0xf, rel)
            }
            0x80 | 0x81 | 0x83 => {
                let s: u8 = if opcode == 0x80 { 1 } else { self.op_size() };
                let m = self.modrm(s)?;
                let imm = match opcode {
                    0x80 => self.imm(1)?,
                    0x81 => self.imm(s.min(4))?,
                    _ => self.imm8_signed()?,
                };
                let (mnemonic, operation) = ALU[m.digit as usize];
                Decoded::new(mnemonic, operation, &[m.rm, imm])
            }
            0x84..=0x8b => {
                let s: u8 = if opcode & 1 == 0 { 1 } else { self.op_size() };
                let m = self.modrm(s)?;
                let reg = self.reg(m.reg, s);
                match opcode {
                    0x84 | 0x85 => Decoded::new("test", Op::Test, &[m.rm, reg]),
                    0x86 | 0x87 => Decoded::new("xchg", Op::Exchange, &[m.rm, reg]),
                    0x88 | 0x89 => Decoded::new("mov", Op::Move, &[m.rm, reg]),
                    _ => Decoded::new("mov", Op::Move, &[reg, m.rm]),
                }
            }
            0x8d => {
                let s: u8 = self.op_size();
                let m = self.modrm(0)?;
                if m.mode == 3 {
                    return Err(self.invalid());
                }
                Decoded::new("lea", Op::LoadAddress, &[self.reg(m.reg, s), m.rm])
            }
            0x8f => {
                let m = self.modrm(self.stack_size())?;
                if m.digit != 0 {
                    return Err(self.invalid());
                }
                Decoded::new("pop", Op::Pop, &[m.rm])
            }
            0x90 if self.p.rex_b() != 0 => {
                let s: u8 = self.op_size();
                Decoded::new("xchg", Op::Exchange, &[self.reg(8, s), self.reg(0, s)])
            }
            0x90 if self.p.rep => Decoded::new("pause", Op::Nop, &[]),
            0x90 => Decoded::new("nop", Op::Nop, &[]),
            0x91..=0x97 => {
                let s: u8 = self.op_size();
                let r = self.reg((opcode & 7) | self.p.rex_b(), s);
                Decoded::new("xchg", Op::Exchange, &[r, self.reg(0, s)])
            }
            0x98 => {
                let mnemonic: &'static str = match self.op_size() {
                    2 => "cbw",
                    4 => "cwde",
                    _ => "cdqe",
                };
                Decoded::new(mnemonic, Op::SignExtendAccumulator, &[])
            }
            0x99 => {
                let mnemonic: &'static str = match self.op_size() {
                    2 => "cwd",
                    4 => "cdq",
                    _ => "cqo",
                };
                Decoded::new(mnemonic, Op::SignExtendAccumulator, &[])
            }
            0xa8 => {
                let imm = self.imm(1)?;
                Decoded::new("test", Op::Test, &[self.reg(0, 1), imm])
            }
            0xa9 => {
                let s: u8 = self.op_size();
                let imm = self.imm(s.min(4))?;
                Decoded::new("test", Op::Test, &[self.reg(0, s), imm])
            }
            0xb0..=0xb7 => {
                let r = self.reg((opcode & 7) | self.p.rex_b(), 1);
                let imm = self.imm(1)?;
                Decoded::new("mov", Op::Move, &[r, imm])
            }
            0xb8..=0xbf => {
                let s: u8 = self.op_size();
                let r = self.reg((opcode & 7) | self.p.rex_b(), s);
                let value: i64 = match s {
                    8 => self.cur.u64()? as i64,
                    2 => self.cur.u16()? as i64,
                    _ => self.cur.i32()? as u32 as i64,
                };
                Decoded::new("mov", Op::Move, &[r, Operand::Immediate(value)])
            }
            0xc0 | 0xc1 | 0xd0..=0xd3 => {
                let s: u8 = if opcode & 1 == 0 { 1 } else { self.op_size() };
                let m = self.modrm(s)?;
                let count: Operand = match opcode {
                    0xc0 | 0xc1 => self.imm(1)?,
                    0xd0 | 0xd1 => Operand::Immediate(1),
                    _ => self.reg(1, 1),
                };
                let (mnemonic, operation) = SHIFT[m.digit as usize];
                Decoded::new(mnemonic, operation, &[m.rm, count])
            }
            0xc2 => {
                let pop: i64 = i64::from(self.cur.u16()?);
                Decoded::new("ret", Op::Return, &[Operand::Immediate(pop)])
                    .flow(FlowKind::Return, None)
            }
            0xc3 => Decoded::new("ret", Op::Return, &[]).flow(FlowKind::Return, None),
            0xc6 | 0xc7 => {
                let s: u8 = if opcode == 0xc6 { 1 } else { self.op_size() };
                let m = self.modrm(s)?;
                if m.digit != 0 {
                    return Err(self.invalid());
                }
                let imm = self.imm(s.min(4))?;
                Decoded::new("mov", Op::Move, &[m.rm, imm])
            }
            0xc9 => Decoded::new("leave", Op::Leave, &[]),
            0xcc => Decoded::new("int3", Op::Breakpoint, &[]),
            0xcd => {
                let vector = self.imm(1)?;
                Decoded::new("int", Op::Interrupt, &[vector])
            }
            0xe8 => {
                let rel: i64 = self.cur.i32()?;
                let target: u64 = self.relative(rel);
                Decoded::new("call", Op::Call, &[Operand::Address(target)])
                    .flow(FlowKind::Call, Some(target))
            }
            0xe9 | 0xeb => {
                let rel: i64 = if opcode == 0xe9 {
                    self.cur.i32()?
                } else {
                    self.cur.i8()?
                };
                let target: u64 = self.relative(rel);
                Decoded::new("jmp", Op::Jump, &[Operand::Address(target)])
                    .flow(FlowKind::UnconditionalBranch, Some(target))
            }
            0xf4 => Decoded::new("hlt", Op::Halt, &[]),
            0xf6 | 0xf7 => {
                let s: u8 = if opcode == 0xf6 { 1 } else { self.op_size() };
                let m = self.modrm(s)?;
                match m.digit {
                    0 | 1 => {
                        let imm = self.imm(s.min(4))?;
                        Decoded::new("test", Op::Test, &[m.rm, imm])
                    }
                    2 => Decoded::new("not", Op::Not, &[m.rm]),
                    3 => Decoded::new("neg", Op::Neg, &[m.rm]),
                    4 => Decoded::new("mul", Op::MulUnsigned, &[m.rm]),
                    5 => Decoded::new("imul", Op::Mul, &[m.rm]),
                    6 => Decoded::new("div", Op::DivUnsigned, &[m.rm]),
                    _ => Decoded::new("idiv", Op::Div, &[m.rm]),
                }
            }
            0xf8 => Decoded::new("clc", Op::Other, &[]),
            0xf9 => Decoded::new("stc", Op::Other, &[]),
            0xfc => Decoded::new("cld", Op::Other, &[]),
            0xfd => Decoded::new("std", Op::Other, &[]),
            0xfe => {
                let m = self.modrm(1)?;
                match m.digit {
                    0 => Decoded::new("inc", Op::Inc, &[m.rm]),
                    1 => Decoded::new("dec", Op::Dec, &[m.rm]),
                    _ => return Err(self.invalid()),
                }
            }
            0xff => {
                let digit: u8 = (self.cur.peek()? >> 3) & 7;
                let s: u8 = match digit {
                    2 | 4 | 6 => self.stack_size(),
                    _ => self.op_size(),
                };
                let m = self.modrm(s)?;
                match digit {
                    0 => Decoded::new("inc", Op::Inc, &[m.rm]),
                    1 => Decoded::new("dec", Op::Dec, &[m.rm]),
                    2 => Decoded::new("call", Op::Call, &[m.rm]).flow(FlowKind::Call, None),
                    4 => Decoded::new("jmp", Op::Jump, &[m.rm])
                        .flow(FlowKind::UnconditionalBranch, None),
                    6 => Decoded::new("push", Op::Push, &[m.rm]),
                    _ => return Err(self.invalid()),
                }
            }
            _ => return Err(self.invalid()),
        };
        Ok(d)
    }

    fn two_byte(&mut self, opcode: u8) -> Result<Decoded, DecodeError> {
        use Operation as Op;

        let d: Decoded = match opcode {
            0x05 => Decoded::new("syscall", Op::SystemCall, &[]),
            0x0b => Decoded::new("ud2", Op::Halt, &[]),
            0x1e if self.p.rep && matches!(self.cur.peek(), Ok(0xfa) | Ok(0xfb)) => {
                let which: u8 = self.cur.u8()?;
                let mnemonic: &'static str = if which == 0xfa { "endbr64" } else { "endbr32" };
                Decoded::new(mnemonic, Op::Nop, &[])
            }
            0x1e | 0x1f => {
                let m = self.modrm(self.op_size())?;
                Decoded::new("nop", Op::Nop, &[m.rm])
            }
            0x31 => Decoded::new("rdtsc", Op::Other, &[]),
            0xa2 => Decoded::new("cpuid", Op::Other, &[]),
            0x40..=0x4f => {
                let s: u8 = self.op_size();
                let m = self.modrm(s)?;
                let cc: u8 = opcode & 0xf;
                Decoded::new(
                    CMOVCC[cc as usize],
                    Op::ConditionalMove(Condition::from_cc(cc)),
                    &[self.reg(m.reg, s), m.rm],
                )
            }
            0x80..=0x8f => {
                let rel: i64 = self.cur.i32()?;
                self.branch(opcode & 0xf, rel)
            }
            0x90..=0x9f => {
                let m = self.modrm(1)?;
                let cc: u8 = opcode & 0xf;
                Decoded::new(
                    SETCC[cc as usize],
                    Op::SetCondition(Condition::from_cc(cc)),
                    &[m.rm],
                )
            }
            0xaf => {
                let s: u8 = self.op_size();
                let m = self.modrm(s)?;
                Decoded::new("imul", Op::Mul, &[self.reg(m.reg, s), m.rm])
            }
            0xb6 | 0xb7 | 0xbe | 0xbf => {
                let s: u8 = self.op_size();
                let src_size: u8 = if opcode & 1 == 0 { 1 } else { 2 };
                let m = self.modrm(src_size)?;
                let (mnemonic, operation) = if opcode < 0xb8 {
                    ("movzx", Op::MoveZeroExtend)
                } else {
                    ("movsx", Op::MoveSignExtend)
                };
                Decoded::new(mnemonic, operation, &[self.reg(m.reg, s), m.rm])
            }
            _ => return Err(self.invalid()),
        };
        Ok(d)
    }
}

impl Decoder for X86Decoder {
    fn name(&self) -> &'static str {
        match self.mode {
            Mode::Protected => "x86",
            Mode::Long => "amd64",
        }
    }

    fn word_size(&self) -> u8 {
        match self.mode {
            Mode::Protected => 4,
            Mode::Long => 8,
        }
    }

    fn decode(
        &self,
        bytes: &[u8],
        address: u64,
        endianness: Endianness,
    ) -> Result<(Instruction, usize), DecodeError> {
        let mut ctx = Context {
            cur: Cursor::new(bytes, address, endianness),
            p: Prefixes::default(),
            address,
            long: self.mode == Mode::Long,
            rip_relative: false,
        };
        ctx.prefixes()?;
        let opcode: u8 = ctx.cur.u8()?;
        let mut decoded: Decoded = ctx.one_byte(opcode)?;

        let length: u64 = ctx.cur.pos;
        let lockable: bool = matches!(decoded.operands.first(), Some(Operand::Memory(_)));
        if length > MAX_LENGTH || (ctx.p.lock && !lockable) {
            return Err(DecodeError::InvalidOpcode {
                address,
                length: length as usize,
            });
        }

        if ctx.rip_relative {
            let next: u64 = address.wrapping_add(length);
            for op in decoded.operands.iter_mut() {
                if let Operand::Memory(mem) = op {
                    if mem.base.is_none() && mem.index.is_none() {
                        mem.displacement = next.wrapping_add(mem.displacement as u64) as i64;
                    }
                }
            }
        }

        let instruction: Instruction = decoded.finish(address, ctx.cur.consumed());
        log::trace!("0x{:x}: {}", address, instruction);
        Ok((instruction, length as usize))
    }
}
