//! Instruction Decoder
//!
//! Architecture-neutral instruction model plus the [`Decoder`] capability that
//! each supported instruction set implements.
//!
//! # Contract
//! `decode(bytes, address, endianness)` consumes the minimum-length encoding at
//! the start of `bytes` and returns the instruction together with the number of
//! bytes consumed. It never reads past the end of `bytes`:
//! - running out of bytes mid-encoding is [`DecodeError::Truncated`]
//! - unknown or reserved encodings are [`DecodeError::InvalidOpcode`], carrying
//!   the length that was attempted
//!
//! Neither error is fatal to the pipeline. The disassembler records the byte as
//! an invalid pseudo-instruction of length 1 and resumes at the next byte. Bytes
//! off the decoder's alignment grid become invalid pseudo-instructions too, so
//! fixed-width sets resume at the next aligned word.
//!
//! # Memory Optimizations
//! - `Operand` lists use `SmallVec<[Operand; 3]>` (no instruction here has more than 3;
//!   ARM block transfers carry their registers as one [`Operand::RegisterList`])
//! - Raw bytes use `SmallVec<[u8; 16]>` (x86 instructions are at most 15 bytes)
//! - `FlowKind`, `Operation` and `Condition` use `#[repr(u8)]`

pub mod arm;
pub mod riscv;
pub mod x86;

use crate::loader::{Endianness, Machine};
use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;

/// Control-flow classification of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FlowKind {
    /// Execution continues with the next instruction
    Sequential = 0,
    /// Always transfers control (`jmp`, `j`)
    UnconditionalBranch = 1,
    /// Transfers control when a condition holds, else falls through
    ConditionalBranch = 2,
    /// Calls a function; execution resumes after the call
    Call = 3,
    /// Returns from the current function
    Return = 4,
    /// Undecodable byte
    Invalid = 5,
}

impl FlowKind {
    /// True if the instruction ends a basic block.
    #[inline]
    pub fn ends_block(self) -> bool {
        !matches!(self, FlowKind::Sequential | FlowKind::Invalid)
    }
}

/// Branch condition, shared by flag-based and compare-and-branch instruction sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0,
    NotOverflow = 1,
    /// Unsigned `<`
    Below = 2,
    /// Unsigned `>=`
    AboveEqual = 3,
    Equal = 4,
    NotEqual = 5,
    /// Unsigned `<=`
    BelowEqual = 6,
    /// Unsigned `>`
    Above = 7,
    Sign = 8,
    NotSign = 9,
    Parity = 10,
    NotParity = 11,
    Less = 12,
    GreaterEqual = 13,
    LessEqual = 14,
    Greater = 15,
}

impl Condition {
    /// Condition from the low 4 bits of an x86 `cc` encoding.
    pub fn from_cc(cc: u8) -> Condition {
        match cc & 0xf {
            0 => Condition::Overflow,
            1 => Condition::NotOverflow,
            2 => Condition::Below,
            3 => Condition::AboveEqual,
            4 => Condition::Equal,
            5 => Condition::NotEqual,
            6 => Condition::BelowEqual,
            7 => Condition::Above,
            8 => Condition::Sign,
            9 => Condition::NotSign,
            10 => Condition::Parity,
            11 => Condition::NotParity,
            12 => Condition::Less,
            13 => Condition::GreaterEqual,
            14 => Condition::LessEqual,
            _ => Condition::Greater,
        }
    }

    pub fn negate(self) -> Condition {
        // Conditions come in complementary pairs differing in the lowest bit.
        Condition::from_cc((self as u8) ^ 1)
    }

    /// Suffix of a predicated mnemonic (`addeq`, `bxne`).
    pub fn suffix(self) -> &'static str {
        match self {
            Condition::Overflow => "vs",
            Condition::NotOverflow => "vc",
            Condition::Below => "cc",
            Condition::AboveEqual => "cs",
            Condition::Equal => "eq",
            Condition::NotEqual => "ne",
            Condition::BelowEqual => "ls",
            Condition::Above => "hi",
            Condition::Sign => "mi",
            Condition::NotSign => "pl",
            Condition::Parity => "pe",
            Condition::NotParity => "po",
            Condition::Less => "lt",
            Condition::GreaterEqual => "ge",
            Condition::LessEqual => "le",
            Condition::Greater => "gt",
        }
    }
}

/// A machine register, identified by its printable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub name: &'static str,
    /// Width in bytes
    pub size: u8,
}

impl Register {
    pub const fn new(name: &'static str, size: u8) -> Self {
        Self { name, size }
    }
}

/// Memory reference: `[base + index * scale + displacement]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    pub base: Option<Register>,
    pub index: Option<(Register, u8)>,
    pub displacement: i64,
    /// Access width in bytes (0 when the access has no width, as in `lea`)
    pub size: u8,
    pub segment: Option<&'static str>,
    /// The effective address is written back to `base` before the access (`[r1, #4]!`)
    pub writeback: bool,
}

/// Barrel-shifter operation applied to a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
    /// Rotate right by one through the carry flag
    Rrx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftAmount {
    Immediate(u8),
    Register(Register),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    Immediate(i64),
    Memory(MemoryOperand),
    /// Absolute code address (direct branch or call target)
    Address(u64),
    /// Register passed through the shifter (`r2, lsl #2`)
    Shifted {
        reg: Register,
        kind: ShiftKind,
        amount: ShiftAmount,
    },
    /// Registers of a block transfer; bit `i` selects ARM register `i`
    RegisterList(u16),
}

/// Architecture-neutral operation performed by an instruction.
///
/// Two-operand sets (x86) read `dst op= src`; three-operand sets (RISC-V)
/// read `dst = src1 op src2`. The per-architecture lifter knows which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    Nop,
    Move,
    MoveZeroExtend,
    MoveSignExtend,
    ConditionalMove(Condition),
    SetCondition(Condition),
    LoadAddress,
    LoadUpperImmediate,
    AddUpperPc,
    Load,
    Store,
    Exchange,
    Add,
    AddCarry,
    Sub,
    SubBorrow,
    Mul,
    MulUnsigned,
    Div,
    DivUnsigned,
    Rem,
    RemUnsigned,
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRight,
    ShiftRightArith,
    RotateLeft,
    RotateRight,
    Neg,
    Not,
    Inc,
    Dec,
    SetLess,
    SetLessUnsigned,
    SignExtendAccumulator,
    Compare,
    Test,
    Push,
    Pop,
    Leave,
    Jump,
    Branch(Condition),
    Call,
    Return,
    SystemCall,
    Breakpoint,
    Interrupt,
    Halt,
    Fence,
    Other,
    Invalid,
}

/// One decoded instruction.
///
/// # Invariant
/// `address + length` equals the address of the next instruction in the same
/// decode stream. Instructions of a second stream that starts inside an
/// already decoded instruction carry `overlapping = true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub length: u8,
    pub mnemonic: &'static str,
    pub operation: Operation,
    pub operands: SmallVec<[Operand; 3]>,
    pub flow: FlowKind,
    /// Statically known branch or call target
    pub target: Option<u64>,
    pub bytes: SmallVec<[u8; 16]>,
    pub overlapping: bool,
    /// Predicate of a conditionally executed instruction; `None` always executes
    pub condition: Option<Condition>,
}

impl Instruction {
    /// Length-1 pseudo-instruction for an undecodable byte.
    pub fn invalid(address: u64, byte: u8) -> Self {
        Self {
            address,
            length: 1,
            mnemonic: "(bad)",
            operation: Operation::Invalid,
            operands: SmallVec::new(),
            flow: FlowKind::Invalid,
            target: None,
            bytes: SmallVec::from_slice(&[byte]),
            overlapping: false,
            condition: None,
        }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.address.wrapping_add(u64::from(self.length))
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.flow == FlowKind::Invalid
    }

    /// Indirect branch or call: control transfer with no static target.
    #[inline]
    pub fn is_indirect(&self) -> bool {
        matches!(
            self.flow,
            FlowKind::UnconditionalBranch | FlowKind::ConditionalBranch | FlowKind::Call
        ) && self.target.is_none()
    }
}

/// Opcode-level decode result before the instruction record is assembled.
pub(crate) struct Decoded {
    pub mnemonic: &'static str,
    pub operation: Operation,
    pub operands: SmallVec<[Operand; 3]>,
    pub flow: FlowKind,
    pub target: Option<u64>,
    pub condition: Option<Condition>,
}

impl Decoded {
    pub fn new(mnemonic: &'static str, operation: Operation, operands: &[Operand]) -> Self {
        Self {
            mnemonic,
            operation,
            operands: SmallVec::from_slice(operands),
            flow: FlowKind::Sequential,
            target: None,
            condition: None,
        }
    }

    pub fn flow(mut self, flow: FlowKind, target: Option<u64>) -> Self {
        self.flow = flow;
        self.target = target;
        self
    }

    /// Execute only when `condition` holds.
    pub fn when(mut self, condition: Option<Condition>) -> Self {
        self.condition = condition;
        self
    }

    pub fn finish(self, address: u64, bytes: &[u8]) -> Instruction {
        Instruction {
            address,
            length: bytes.len() as u8,
            mnemonic: self.mnemonic,
            operation: self.operation,
            operands: self.operands,
            flow: self.flow,
            target: self.target,
            bytes: SmallVec::from_slice(bytes),
            overlapping: false,
            condition: self.condition,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn write_signed_hex(f: &mut fmt::Formatter<'_>, value: i64) -> fmt::Result {
    if value < 0 {
        write!(f, "-0x{:x}", value.unsigned_abs())
    } else {
        write!(f, "0x{:x}", value)
    }
}

impl fmt::Display for MemoryOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width: &str = match self.size {
            1 => "byte ptr ",
            2 => "word ptr ",
            4 => "dword ptr ",
            8 => "qword ptr ",
            _ => "",
        };
        f.write_str(width)?;
        if let Some(seg) = self.segment {
            write!(f, "{}:", seg)?;
        }
        f.write_str("[")?;
        let mut empty: bool = true;
        if let Some(base) = self.base {
            write!(f, "{}", base)?;
            empty = false;
        }
        if let Some((index, scale)) = self.index {
            if !empty {
                f.write_str(" + ")?;
            }
            write!(f, "{}*{}", index, scale)?;
            empty = false;
        }
        if empty {
            write!(f, "0x{:x}", self.displacement as u64)?;
        } else if self.displacement != 0 {
            f.write_str(if self.displacement < 0 { " - " } else { " + " })?;
            write!(f, "0x{:x}", self.displacement.unsigned_abs())?;
        }
        f.write_str(if self.writeback { "]!" } else { "]" })
    }
}

impl fmt::Display for ShiftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShiftKind::Lsl => "lsl",
            ShiftKind::Lsr => "lsr",
            ShiftKind::Asr => "asr",
            ShiftKind::Ror => "ror",
            ShiftKind::Rrx => "rrx",
        })
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(r) => write!(f, "{}", r),
            Operand::Immediate(v) => write_signed_hex(f, *v),
            Operand::Memory(m) => write!(f, "{}", m),
            Operand::Address(a) => write!(f, "0x{:x}", a),
            Operand::Shifted { reg, kind, amount } => match (kind, amount) {
                (ShiftKind::Rrx, _) => write!(f, "{}, rrx", reg),
                (_, ShiftAmount::Immediate(n)) => write!(f, "{}, {} #{}", reg, kind, n),
                (_, ShiftAmount::Register(r)) => write!(f, "{}, {} {}", reg, kind, r),
            },
            Operand::RegisterList(mask) => {
                f.write_str("{")?;
                let regs = (0..16u32).filter(|i| mask & (1 << i) != 0);
                for (n, i) in regs.enumerate() {
                    if n > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(arm::register_name(i))?;
                }
                f.write_str("}")
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic)?;
        if let Some(cc) = self.condition {
            f.write_str(cc.suffix())?;
        }
        for (i, op) in self.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            write!(f, "{}", op)?;
        }
        Ok(())
    }
}

/// Recoverable decode failure. Recorded inline, never aborts disassembly.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated instruction at 0x{address:x}: {needed} more bytes needed")]
    Truncated { address: u64, needed: usize },

    #[error("invalid opcode at 0x{address:x} ({length} bytes attempted)")]
    InvalidOpcode { address: u64, length: usize },
}

/// Instruction-set decoder, selected per machine type.
pub trait Decoder: Send + Sync {
    /// Short architecture name for diagnostics.
    fn name(&self) -> &'static str;

    /// Instruction alignment in bytes; decoding only starts at aligned addresses.
    fn alignment(&self) -> u64 {
        1
    }

    /// Width of a pointer / general purpose register in bytes.
    fn word_size(&self) -> u8;

    /// Decode one instruction at the start of `bytes`, located at `address`.
    fn decode(
        &self,
        bytes: &[u8],
        address: u64,
        endianness: Endianness,
    ) -> Result<(Instruction, usize), DecodeError>;
}

/// Select the decoder for a machine type.
pub fn decoder_for(machine: Machine) -> Option<Box<dyn Decoder>> {
    match machine {
        Machine::X86 => Some(Box::new(x86::X86Decoder::new(x86::Mode::Protected))),
        Machine::Amd64 => Some(Box::new(x86::X86Decoder::new(x86::Mode::Long))),
        Machine::RiscV32 => Some(Box::new(riscv::RiscVDecoder::new(riscv::Xlen::Rv32))),
        Machine::RiscV64 => Some(Box::new(riscv::RiscVDecoder::new(riscv::Xlen::Rv64))),
        Machine::Arm => Some(Box::new(arm::ArmDecoder)),
        Machine::Aarch64 | Machine::Unknown => None,
    }
}
