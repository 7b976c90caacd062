//! ARM (A32) Instruction Decoder
//!
//! Covers the ARMv4 instruction set: branches and `bx`, block transfers,
//! multiplies, status register moves, `swi`, single and halfword loads and
//! stores and the sixteen data-processing opcodes with their shifter operands.
//! Thumb code is not decoded. Words are read in the container's endianness.
//!
//! # Predication
//! Every instruction carries a 4-bit condition. Anything other than `al` lands
//! in [`Instruction::condition`] and prints as a mnemonic suffix (`addeq`).
//!
//! # Control flow
//! - `b` is a jump, `b<cond>` a conditional branch
//! - `bl` is a call, conditional or not
//! - `bx lr`, `mov pc, lr` and loads of `pc` from the stack (`pop {.., pc}`)
//!   are returns
//! - any other write to `pc` is an indirect jump
//!
//! Predicated returns and indirect jumps fall through when the condition
//! fails, so they are conditional branches without a static target.

use crate::decoder::{
    Condition, DecodeError, Decoded, Decoder, FlowKind, Instruction, MemoryOperand, Operand,
    Operation, Register, ShiftAmount, ShiftKind,
};
use crate::loader::{ByteSource, Endianness};

const NAMES: [&str; 16] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc",
];

const SP: u32 = 13;
const LR: u32 = 14;
const PC: u32 = 15;

/// Condition field of the unconditional instruction space (ARMv5 and later).
const NEVER: u32 = 0b1111;

/// Data-processing opcodes: plain mnemonic, flag-setting mnemonic, operation.
///
/// `rsb`, `rsc`, `bic`, `teq` and `cmn` share an operation with their plain
/// relatives; the lifter tells them apart by mnemonic.
const DATA_PROCESSING: [(&str, &str, Operation); 16] = [
    ("and", "ands", Operation::And),
    ("eor", "eors", Operation::Xor),
    ("sub", "subs", Operation::Sub),
    ("rsb", "rsbs", Operation::Sub),
    ("add", "adds", Operation::Add),
    ("adc", "adcs", Operation::AddCarry),
    ("sbc", "sbcs", Operation::SubBorrow),
    ("rsc", "rscs", Operation::SubBorrow),
    ("tst", "tst", Operation::Test),
    ("teq", "teq", Operation::Test),
    ("cmp", "cmp", Operation::Compare),
    ("cmn", "cmn", Operation::Compare),
    ("orr", "orrs", Operation::Or),
    ("mov", "movs", Operation::Move),
    ("bic", "bics", Operation::And),
    ("mvn", "mvns", Operation::Not),
];

/// Block transfer mnemonics indexed by `[load][P:U]`.
const BLOCK_TRANSFER: [[&str; 4]; 2] = [
    ["stmda", "stmia", "stmdb", "stmib"],
    ["ldmda", "ldmia", "ldmdb", "ldmib"],
];

/// A32 decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmDecoder;

/// Register name for index `i` (0-15).
pub fn register_name(i: u32) -> &'static str {
    NAMES[(i & 15) as usize]
}

fn register(i: u32) -> Register {
    Register::new(register_name(i), 4)
}

fn reg(i: u32) -> Operand {
    Operand::Register(register(i))
}

/// Condition field to predicate; `None` for `al`.
pub fn condition(field: u32) -> Option<Condition> {
    Some(match field & 15 {
        0 => Condition::Equal,
        1 => Condition::NotEqual,
        2 => Condition::AboveEqual,
        3 => Condition::Below,
        4 => Condition::Sign,
        5 => Condition::NotSign,
        6 => Condition::Overflow,
        7 => Condition::NotOverflow,
        8 => Condition::Above,
        9 => Condition::BelowEqual,
        10 => Condition::GreaterEqual,
        11 => Condition::Less,
        12 => Condition::Greater,
        13 => Condition::LessEqual,
        _ => return None,
    })
}

/// `imm8` rotated right by twice the 4-bit rotate field.
fn rotated_immediate(w: u32) -> i64 {
    let rotate: u32 = ((w >> 8) & 15) * 2;
    i64::from((w & 0xff).rotate_right(rotate))
}

/// Register form of the second data-processing operand.
fn shifter(w: u32) -> Operand {
    let rm: Register = register(w & 15);
    let kind: ShiftKind = match (w >> 5) & 3 {
        0 => ShiftKind::Lsl,
        1 => ShiftKind::Lsr,
        2 => ShiftKind::Asr,
        _ => ShiftKind::Ror,
    };
    if w & 0x10 != 0 {
        return Operand::Shifted {
            reg: rm,
            kind,
            amount: ShiftAmount::Register(register((w >> 8) & 15)),
        };
    }
    let (kind, amount): (ShiftKind, u8) = match (kind, ((w >> 7) & 31) as u8) {
        (ShiftKind::Lsl, 0) => return Operand::Register(rm),
        (ShiftKind::Ror, 0) => (ShiftKind::Rrx, 1),
        // A zero amount encodes a shift by 32.
        (ShiftKind::Lsr | ShiftKind::Asr, 0) => (kind, 32),
        other => other,
    };
    Operand::Shifted {
        reg: rm,
        kind,
        amount: ShiftAmount::Immediate(amount),
    }
}

/// Flow of a write to `pc` whose value is not known statically.
fn pc_write(d: Decoded, cc: Option<Condition>, returns: bool) -> Decoded {
    match (cc, returns) {
        (Some(_), _) => d.flow(FlowKind::ConditionalBranch, None),
        (None, true) => d.flow(FlowKind::Return, None),
        (None, false) => d.flow(FlowKind::UnconditionalBranch, None),
    }
}

/// Offset of a single load or store.
#[derive(Debug, Clone, Copy)]
enum Offset {
    Immediate(i64),
    /// `rm, lsl #amount`
    Register(u32, u32),
}

fn psr(spsr: bool, fields: u32) -> Option<&'static str> {
    Some(match (spsr, fields) {
        (false, 0b1111) => "cpsr",
        (false, 0b0001) => "cpsr_c",
        (false, 0b1000) => "cpsr_f",
        (false, 0b1001) => "cpsr_fc",
        (true, 0b1111) => "spsr",
        (true, 0b0001) => "spsr_c",
        (true, 0b1000) => "spsr_f",
        (true, 0b1001) => "spsr_fc",
        _ => return None,
    })
}

impl ArmDecoder {
    fn branch(&self, w: u32, address: u64, cc: Option<Condition>) -> Decoded {
        // sign-extended imm24, times 4
        let offset: i64 = i64::from(((w << 8) as i32) >> 6);
        let target: u64 = address.wrapping_add(8).wrapping_add(offset as u64) & 0xffff_ffff;
        let addr = Operand::Address(target);
        if w & (1 << 24) != 0 {
            return Decoded::new("bl", Operation::Call, &[addr]).flow(FlowKind::Call, Some(target));
        }
        match cc {
            Some(c) => Decoded::new("b", Operation::Branch(c), &[addr])
                .flow(FlowKind::ConditionalBranch, Some(target)),
            None => Decoded::new("b", Operation::Jump, &[addr])
                .flow(FlowKind::UnconditionalBranch, Some(target)),
        }
    }

    fn block_transfer(&self, w: u32, cc: Option<Condition>) -> Decoded {
        let rn: u32 = (w >> 16) & 15;
        let load: bool = w & (1 << 20) != 0;
        let writeback: bool = w & (1 << 21) != 0;
        let mode: usize = ((w >> 23) & 3) as usize;
        let list: u16 = (w & 0xffff) as u16;
        let regs = Operand::RegisterList(list);

        let d: Decoded = match (load, mode, rn == SP && writeback) {
            (false, 2, true) => Decoded::new("push", Operation::Push, &[regs]),
            (true, 1, true) => Decoded::new("pop", Operation::Pop, &[regs]),
            _ => {
                let base = Operand::Memory(MemoryOperand {
                    base: Some(register(rn)),
                    index: None,
                    displacement: 0,
                    size: 0,
                    segment: None,
                    writeback,
                });
                let op: Operation = if load {
                    Operation::Load
                } else {
                    Operation::Store
                };
                Decoded::new(BLOCK_TRANSFER[usize::from(load)][mode], op, &[base, regs])
            }
        };
        if load && list & (1 << PC) != 0 {
            return pc_write(d, cc, rn == SP);
        }
        d
    }

    /// `ldr`/`str` and their byte and halfword forms.
    fn transfer(
        &self,
        w: u32,
        mnemonic: &'static str,
        load: bool,
        size: u8,
        offset: Offset,
        cc: Option<Condition>,
    ) -> Option<Decoded> {
        let rn: u32 = (w >> 16) & 15;
        let rd: u32 = (w >> 12) & 15;
        let pre: bool = w & (1 << 24) != 0;
        let up: bool = w & (1 << 23) != 0;
        let writeback: bool = w & (1 << 21) != 0;
        let op: Operation = if load {
            Operation::Load
        } else {
            Operation::Store
        };
        let mem = |index: Option<(Register, u8)>, displacement: i64, writeback: bool| {
            Operand::Memory(MemoryOperand {
                base: Some(register(rn)),
                index,
                displacement,
                size,
                segment: None,
                writeback,
            })
        };

        let d: Decoded = match (pre, offset) {
            (true, Offset::Immediate(v)) => {
                let displacement: i64 = if up { v } else { -v };
                Decoded::new(mnemonic, op, &[reg(rd), mem(None, displacement, writeback)])
            }
            // Subtracted or large-scale register offsets have no memory operand form.
            (true, Offset::Register(rm, shift)) if up && shift <= 7 => {
                let index = Some((register(rm), 1u8 << shift));
                Decoded::new(mnemonic, op, &[reg(rd), mem(index, 0, writeback)])
            }
            (true, Offset::Register(..)) => return None,
            // Post-indexed: access [rn], then add the offset to rn.
            (false, Offset::Immediate(v)) => {
                let step = Operand::Immediate(if up { v } else { -v });
                Decoded::new(mnemonic, op, &[reg(rd), mem(None, 0, false), step])
            }
            (false, Offset::Register(rm, shift)) if up => {
                let step: Operand = match shift {
                    0 => reg(rm),
                    n => Operand::Shifted {
                        reg: register(rm),
                        kind: ShiftKind::Lsl,
                        amount: ShiftAmount::Immediate(n as u8),
                    },
                };
                Decoded::new(mnemonic, op, &[reg(rd), mem(None, 0, false), step])
            }
            (false, Offset::Register(..)) => return None,
        };
        if load && rd == PC {
            // ldr pc, [sp], #4
            let pops: bool = rn == SP && !pre;
            return Some(pc_write(d, cc, pops));
        }
        Some(d)
    }

    fn single_transfer(&self, w: u32, cc: Option<Condition>) -> Option<Decoded> {
        let load: bool = w & (1 << 20) != 0;
        let byte: bool = w & (1 << 22) != 0;
        let offset: Offset = if w & (1 << 25) == 0 {
            Offset::Immediate(i64::from(w & 0xfff))
        } else if w & 0x70 != 0 {
            // Media instructions, and register offsets shifted other than lsl
            return None;
        } else {
            Offset::Register(w & 15, (w >> 7) & 31)
        };
        let (mnemonic, size): (&'static str, u8) = match (load, byte) {
            (true, false) => ("ldr", 4),
            (true, true) => ("ldrb", 1),
            (false, false) => ("str", 4),
            (false, true) => ("strb", 1),
        };
        self.transfer(w, mnemonic, load, size, offset, cc)
    }

    /// Multiplies and the halfword / signed-byte transfers (`bits[7:4] == 1xx1`).
    fn multiply_or_extra(&self, w: u32, cc: Option<Condition>) -> Option<Decoded> {
        let flags: bool = w & (1 << 20) != 0;
        let accumulate: bool = w & (1 << 21) != 0;
        let sh: u32 = (w >> 5) & 3;
        if sh == 0 {
            let a: u32 = (w >> 16) & 15;
            let b: u32 = (w >> 12) & 15;
            let rs: Operand = reg((w >> 8) & 15);
            let rm: Operand = reg(w & 15);
            return match (w >> 22) & 0x3f {
                0 => Some(match (accumulate, flags) {
                    (false, false) => Decoded::new("mul", Operation::Mul, &[reg(a), rm, rs]),
                    (false, true) => Decoded::new("muls", Operation::Mul, &[reg(a), rm, rs]),
                    (true, false) => {
                        Decoded::new("mla", Operation::Mul, &[reg(a), rm, rs, reg(b)])
                    }
                    (true, true) => Decoded::new("mlas", Operation::Mul, &[reg(a), rm, rs, reg(b)]),
                }),
                // RdLo, RdHi, Rm, Rs
                0b10 | 0b11 => {
                    let signed: bool = w & (1 << 22) != 0;
                    let mnemonic: &'static str = match (signed, accumulate, flags) {
                        (false, false, false) => "umull",
                        (false, false, true) => "umulls",
                        (false, true, false) => "umlal",
                        (false, true, true) => "umlals",
                        (true, false, false) => "smull",
                        (true, false, true) => "smulls",
                        (true, true, false) => "smlal",
                        (true, true, true) => "smlals",
                    };
                    Some(Decoded::new(mnemonic, Operation::Other, &[reg(b), reg(a), rm, rs]))
                }
                // swp and the synchronization primitives
                _ => None,
            };
        }

        let load: bool = flags;
        let (mnemonic, size): (&'static str, u8) = match (load, sh) {
            (false, 1) => ("strh", 2),
            (true, 1) => ("ldrh", 2),
            (true, 2) => ("ldrsb", 1),
            (true, 3) => ("ldrsh", 2),
            // ldrd / strd
            _ => return None,
        };
        let offset: Offset = if w & (1 << 22) != 0 {
            Offset::Immediate(i64::from(((w >> 4) & 0xf0) | (w & 15)))
        } else {
            Offset::Register(w & 15, 0)
        };
        self.transfer(w, mnemonic, load, size, offset, cc)
    }

    /// `mrs` / `msr`, which live in the flagless compare encodings.
    fn status(&self, w: u32) -> Option<Decoded> {
        let spsr: bool = w & (1 << 22) != 0;
        if w & 0x0fbf_0fff == 0x010f_0000 {
            let name: &'static str = psr(spsr, 0b1111)?;
            let ops = [reg((w >> 12) & 15), Operand::Register(Register::new(name, 4))];
            return Some(Decoded::new("mrs", Operation::Other, &ops));
        }
        if w & 0x0db0_f000 == 0x0120_f000 {
            let src: Operand = if w & (1 << 25) != 0 {
                Operand::Immediate(rotated_immediate(w))
            } else if w & 0xff0 == 0 {
                reg(w & 15)
            } else {
                return None;
            };
            let name: &'static str = psr(spsr, (w >> 16) & 15)?;
            let ops = [Operand::Register(Register::new(name, 4)), src];
            return Some(Decoded::new("msr", Operation::Other, &ops));
        }
        None
    }

    fn data_processing(&self, w: u32, cc: Option<Condition>) -> Option<Decoded> {
        let rm: u32 = w & 15;
        // bx / blx register
        match w & 0x0fff_fff0 {
            0x012f_ff10 if rm == LR => {
                let d = Decoded::new("bx", Operation::Return, &[reg(rm)]);
                return Some(pc_write(d, cc, true));
            }
            0x012f_ff10 => {
                let d = Decoded::new("bx", Operation::Jump, &[reg(rm)]);
                return Some(pc_write(d, cc, false));
            }
            0x012f_ff30 => {
                let d = Decoded::new("blx", Operation::Call, &[reg(rm)]);
                return Some(d.flow(FlowKind::Call, None));
            }
            _ => {}
        }
        let immediate: bool = w & (1 << 25) != 0;
        if !immediate && w & 0x90 == 0x90 {
            return self.multiply_or_extra(w, cc);
        }

        let opcode: usize = ((w >> 21) & 15) as usize;
        let flags: bool = w & (1 << 20) != 0;
        let rn: u32 = (w >> 16) & 15;
        let rd: u32 = (w >> 12) & 15;
        if (8..=11).contains(&opcode) && !flags {
            return self.status(w);
        }
        let (plain, flagged, op) = DATA_PROCESSING[opcode];
        let mnemonic: &'static str = if flags { flagged } else { plain };
        let op2: Operand = if immediate {
            Operand::Immediate(rotated_immediate(w))
        } else {
            shifter(w)
        };

        let d: Decoded = match opcode {
            8..=11 => return Some(Decoded::new(mnemonic, op, &[reg(rn), op2])),
            13 if !flags && op2 == reg(rd) => return Some(Decoded::new("nop", Operation::Nop, &[])),
            13 | 15 => Decoded::new(mnemonic, op, &[reg(rd), op2]),
            _ => Decoded::new(mnemonic, op, &[reg(rd), reg(rn), op2]),
        };
        if rd == PC {
            // `mov pc, lr`, and the flag-setting exception returns (`subs pc, lr, #4`)
            let returns: bool = (opcode == 13 && op2 == reg(LR)) || flags;
            return Some(pc_write(d, cc, returns));
        }
        Some(d)
    }

    /// Decode one instruction word. `None` means undefined or unsupported.
    #[inline(never)] // Large function - don't inline
    fn word(&self, w: u32, address: u64) -> Option<Decoded> {
        let field: u32 = w >> 28;
        if field == NEVER {
            return None;
        }
        let cc: Option<Condition> = condition(field);

        let d: Decoded = match (w >> 25) & 7 {
            0b000 | 0b001 => self.data_processing(w, cc)?,
            0b010 | 0b011 => self.single_transfer(w, cc)?,
            0b100 => self.block_transfer(w, cc),
            0b101 => self.branch(w, address, cc),
            0b111 if w & (1 << 24) != 0 => Decoded::new(
                "swi",
                Operation::SystemCall,
                &[Operand::Immediate(i64::from(w & 0xff_ffff))],
            ),
            // coprocessor space
            _ => return None,
        };
        Some(d.when(cc))
    }
}

impl Decoder for ArmDecoder {
    fn name(&self) -> &'static str {
        "arm"
    }

    fn alignment(&self) -> u64 {
        4
    }

    fn word_size(&self) -> u8 {
        4
    }

    fn decode(
        &self,
        bytes: &[u8],
        address: u64,
        endianness: Endianness,
    ) -> Result<(Instruction, usize), DecodeError> {
        let src = ByteSource::new(bytes, endianness);
        let word: u32 = src.read_u32(0).map_err(|_| DecodeError::Truncated {
            address,
            needed: 4 - bytes.len().min(4),
        })?;
        match self.word(word, address) {
            Some(d) => Ok((d.finish(address, &bytes[..4]), 4)),
            None => Err(DecodeError::InvalidOpcode { address, length: 4 }),
        }
    }
}
