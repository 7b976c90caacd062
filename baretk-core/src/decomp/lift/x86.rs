//! x86 / amd64 lifting.
//!
//! Two-operand forms read `dst op= src`. Flag-setting arithmetic leaves
//! [`Flags::Result`] behind; `cmp` and `test` only update the flags. Writes
//! that leave the flags alone go through [`Flags::preserve`], with partial
//! registers (`al`, `eax`, `rax`) treated as one location.

use super::{flags_condition, operand_size, operand_value, Flags, Lifter};
use crate::decoder::{FlowKind, Instruction, Operand, Operation};
use crate::decomp::ast::{BinaryOp, Expr, Lifted, Statement, UnaryOp};
use smallvec::smallvec;

#[derive(Debug, Clone, Copy)]
pub struct X86Lifter {
    /// Pointer width in bytes
    pub word_size: u8,
}

fn binary_op(op: Operation) -> Option<BinaryOp> {
    Some(match op {
        Operation::Add | Operation::AddCarry | Operation::Inc => BinaryOp::Add,
        Operation::Sub | Operation::SubBorrow | Operation::Dec => BinaryOp::Sub,
        Operation::And => BinaryOp::And,
        Operation::Or => BinaryOp::Or,
        Operation::Xor => BinaryOp::Xor,
        Operation::ShiftLeft => BinaryOp::Shl,
        Operation::ShiftRight => BinaryOp::Shr,
        Operation::ShiftRightArith => BinaryOp::Sar,
        Operation::RotateLeft => BinaryOp::Rol,
        Operation::RotateRight => BinaryOp::Ror,
        Operation::Mul => BinaryOp::Mul,
        _ => return None,
    })
}

/// Full-width register a (possibly partial) register name belongs to.
fn family(name: &str) -> &str {
    let bytes: &[u8] = name.as_bytes();
    // r8 .. r15 with their d/w/b forms
    if bytes.len() >= 2 && bytes[0] == b'r' && bytes[1].is_ascii_digit() {
        return name.trim_end_matches(['d', 'w', 'b']);
    }
    match name {
        "al" | "ah" | "ax" | "eax" | "rax" => "rax",
        "bl" | "bh" | "bx" | "ebx" | "rbx" => "rbx",
        "cl" | "ch" | "cx" | "ecx" | "rcx" => "rcx",
        "dl" | "dh" | "dx" | "edx" | "rdx" => "rdx",
        "sil" | "si" | "esi" | "rsi" => "rsi",
        "dil" | "di" | "edi" | "rdi" => "rdi",
        "spl" | "sp" | "esp" | "rsp" => "rsp",
        "bpl" | "bp" | "ebp" | "rbp" => "rbp",
        other => other,
    }
}

fn overlaps(a: &str, b: &str) -> bool {
    family(a) == family(b)
}

fn is_frame_pointer(op: Option<&Operand>) -> bool {
    matches!(op, Some(Operand::Register(r)) if r.name == "rbp" || r.name == "ebp")
}

fn is_stack_pointer(op: Option<&Operand>) -> bool {
    matches!(op, Some(Operand::Register(r)) if r.name == "rsp" || r.name == "esp")
}

/// Accumulator sign extensions: (destination, source, source width).
fn accumulator_extension(mnemonic: &str) -> Option<(&'static str, &'static str, u8)> {
    Some(match mnemonic {
        "cbw" => ("ax", "al", 1),
        "cwde" => ("eax", "ax", 2),
        "cdqe" => ("rax", "eax", 4),
        _ => return None,
    })
}

/// `cwd` / `cdq` / `cqo`: (high half, accumulator, bits).
fn accumulator_split(mnemonic: &str) -> Option<(&'static str, &'static str, i64)> {
    Some(match mnemonic {
        "cwd" => ("dx", "ax", 16),
        "cdq" => ("edx", "eax", 32),
        "cqo" => ("rdx", "rax", 64),
        _ => return None,
    })
}

impl X86Lifter {
    /// Assignment from a flag-setting instruction; the flags are replaced after it.
    fn assign(out: &mut Vec<Statement>, dst: &Operand, src: Expr) {
        out.push(Statement::Assign {
            dst: operand_value(dst),
            src,
        });
    }

    /// Assignment that leaves the flags untouched.
    fn write(out: &mut Vec<Statement>, flags: &mut Flags, dst: Expr, src: Expr) {
        flags.preserve(&dst, &overlaps, out);
        out.push(Statement::Assign { dst, src });
    }

    fn intrinsic(insn: &Instruction, out: &mut Vec<Statement>) {
        out.push(Statement::Intrinsic {
            name: insn.mnemonic,
            args: insn.operands.iter().map(operand_value).collect(),
        });
    }
}

impl Lifter for X86Lifter {
    #[inline(never)] // Large function - don't inline
    fn lift(&self, insn: &Instruction, flags: &mut Flags, out: &mut Vec<Statement>) {
        use Operation as Op;

        let ops = &insn.operands;
        let first: Option<&Operand> = ops.first();
        let value = |i: usize| ops.get(i).map(operand_value);

        match insn.operation {
            Op::Nop | Op::Leave => {}
            Op::Move => {
                if let (Some(dst), Some(src)) = (first, value(1)) {
                    Self::write(out, flags, operand_value(dst), src);
                }
            }
            Op::MoveZeroExtend | Op::MoveSignExtend => {
                if let (Some(dst), Some(src)) = (first, ops.get(1)) {
                    let to: u8 = operand_size(dst).unwrap_or(self.word_size);
                    let from: u8 = operand_size(src).unwrap_or(to);
                    let signed: bool = insn.operation == Op::MoveSignExtend;
                    let src: Expr = Expr::cast(signed, from, to, operand_value(src));
                    Self::write(out, flags, operand_value(dst), src);
                }
            }
            Op::LoadAddress => {
                if let (Some(dst), Some(Operand::Memory(m))) = (first, ops.get(1)) {
                    Self::write(out, flags, operand_value(dst), super::address_of(m));
                }
            }
            Op::ConditionalMove(cc) => {
                if let (Some(dst), Some(src)) = (first, value(1)) {
                    let dst: Expr = operand_value(dst);
                    flags.preserve(&dst, &overlaps, out);
                    let then_body: Vec<Statement> = vec![Statement::Assign { dst, src }];
                    out.push(Statement::If {
                        cond: flags_condition(cc, flags),
                        then_body,
                        else_body: Vec::new(),
                    });
                }
            }
            Op::SetCondition(cc) => {
                if let Some(dst) = first {
                    let dst: Expr = operand_value(dst);
                    flags.preserve(&dst, &overlaps, out);
                    let src: Expr = flags_condition(cc, flags);
                    out.push(Statement::Assign { dst, src });
                }
            }
            Op::Exchange => {
                if let (Some(a), Some(b)) = (first, ops.get(1)) {
                    flags.preserve(&operand_value(a), &overlaps, out);
                    flags.preserve(&operand_value(b), &overlaps, out);
                    out.push(Statement::Intrinsic {
                        name: "swap",
                        args: vec![operand_value(a), operand_value(b)],
                    });
                }
            }
            Op::Compare => {
                if let (Some(a), Some(b)) = (value(0), value(1)) {
                    *flags = Flags::Compare(a, b);
                }
            }
            Op::Test => {
                if let (Some(a), Some(b)) = (value(0), value(1)) {
                    *flags = Flags::Test(a, b);
                }
            }
            Op::Inc | Op::Dec => {
                if let Some(dst) = first {
                    let op: BinaryOp = binary_op(insn.operation).unwrap_or(BinaryOp::Add);
                    let v: Expr = operand_value(dst);
                    Self::assign(out, dst, Expr::binary(op, v.clone(), Expr::Const(1)));
                    *flags = Flags::Result(v);
                }
            }
            Op::Neg | Op::Not => {
                if let Some(dst) = first {
                    let v: Expr = operand_value(dst);
                    let unary: UnaryOp = if insn.operation == Op::Neg {
                        UnaryOp::Neg
                    } else {
                        UnaryOp::Not
                    };
                    if insn.operation == Op::Neg {
                        Self::assign(out, dst, Expr::unary(unary, v.clone()));
                        *flags = Flags::Result(v);
                    } else {
                        Self::write(out, flags, v.clone(), Expr::unary(unary, v));
                    }
                }
            }
            // One-operand multiply and divide work on the accumulator pair.
            Op::Mul | Op::MulUnsigned | Op::Div | Op::DivUnsigned if ops.len() == 1 => {
                Self::intrinsic(insn, out);
                *flags = Flags::Unknown;
            }
            Op::Mul if ops.len() == 3 => {
                if let (Some(dst), Some(a), Some(b)) = (first, value(1), value(2)) {
                    Self::assign(out, dst, Expr::binary(BinaryOp::Mul, a, b));
                    *flags = Flags::Unknown;
                }
            }
            Op::Add
            | Op::AddCarry
            | Op::Sub
            | Op::SubBorrow
            | Op::And
            | Op::Or
            | Op::Xor
            | Op::ShiftLeft
            | Op::ShiftRight
            | Op::ShiftRightArith
            | Op::RotateLeft
            | Op::RotateRight
            | Op::Mul => {
                let Some(op) = binary_op(insn.operation) else {
                    return;
                };
                if let (Some(dst), Some(src)) = (first, value(1)) {
                    let v: Expr = operand_value(dst);
                    let mut result: Expr = Expr::binary(op, v.clone(), src);
                    match insn.operation {
                        Op::AddCarry => {
                            let carry = Expr::intrinsic("carry", Vec::new());
                            result = Expr::binary(BinaryOp::Add, result, carry);
                        }
                        Op::SubBorrow => {
                            let carry = Expr::intrinsic("carry", Vec::new());
                            result = Expr::binary(BinaryOp::Sub, result, carry);
                        }
                        _ => {}
                    }
                    Self::assign(out, dst, result);
                    *flags = match insn.operation {
                        Op::RotateLeft | Op::RotateRight | Op::Mul => Flags::Unknown,
                        _ => Flags::Result(v),
                    };
                }
            }
            Op::SignExtendAccumulator => {
                if let Some((dst, src, from)) = accumulator_extension(insn.mnemonic) {
                    let src: Expr = Expr::cast(true, from, from * 2, Expr::Reg(src));
                    Self::write(out, flags, Expr::Reg(dst), src);
                } else if let Some((high, acc, bits)) = accumulator_split(insn.mnemonic) {
                    let src: Expr =
                        Expr::binary(BinaryOp::Sar, Expr::Reg(acc), Expr::Const(bits - 1));
                    Self::write(out, flags, Expr::Reg(high), src);
                }
            }
            Op::Push => {
                if let Some(src) = value(0) {
                    out.push(Statement::Intrinsic {
                        name: "push",
                        args: vec![src],
                    });
                }
            }
            Op::Pop => {
                if let Some(dst) = first {
                    let src: Expr = Expr::intrinsic("pop", Vec::new());
                    Self::write(out, flags, operand_value(dst), src);
                }
            }
            Op::Jump => match first {
                Some(Operand::Address(_)) | None => {}
                Some(target) => out.push(Statement::Intrinsic {
                    name: "jump",
                    args: vec![operand_value(target)],
                }),
            },
            Op::Call => {
                if let Some(target) = value(0) {
                    out.push(Statement::Call { target });
                }
                *flags = Flags::Unknown;
            }
            Op::Return => out.push(Statement::Return),
            Op::SystemCall | Op::Breakpoint | Op::Interrupt | Op::Halt | Op::Fence | Op::Other => {
                Self::intrinsic(insn, out);
                *flags = Flags::Unknown;
            }
            _ => {
                log::debug!("no lifting for {} at 0x{:x}", insn, insn.address);
                out.push(Statement::Asm(insn.to_string()));
                *flags = Flags::Unknown;
            }
        }
    }

    fn condition(&self, insn: &Instruction, flags: &Flags) -> Expr {
        match insn.operation {
            Operation::Branch(cc) => flags_condition(cc, flags),
            _ => Expr::intrinsic("unknown_condition", Vec::new()),
        }
    }

    fn combine(&self, first: &Instruction, second: &Instruction) -> Option<Lifted> {
        // push rbp; mov rbp, rsp
        let frame_setup: bool = first.operation == Operation::Push
            && is_frame_pointer(first.operands.first())
            && second.operation == Operation::Move
            && is_frame_pointer(second.operands.first())
            && is_stack_pointer(second.operands.get(1));
        if frame_setup && second.flow == FlowKind::Sequential {
            return Some(smallvec![]);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::x86::{Mode, X86Decoder};
    use crate::decoder::Decoder;
    use crate::decomp::ast::CompareOp;
    use crate::decomp::lift::lift_block;
    use crate::disasm::BasicBlock;
    use crate::loader::Endianness;
    use smallvec::SmallVec;

    fn block(code: &[u8]) -> BasicBlock {
        let dec = X86Decoder::new(Mode::Long);
        let mut insns: Vec<Instruction> = Vec::new();
        let mut addr: u64 = 0x1000;
        let mut off: usize = 0;
        while off < code.len() {
            let (insn, len) = dec.decode(&code[off..], addr, Endianness::Little).unwrap();
            insns.push(insn);
            off += len;
            addr += len as u64;
        }
        BasicBlock {
            id: 0,
            start: 0x1000,
            end: addr,
            instructions: insns,
            successors: SmallVec::new(),
            predecessors: SmallVec::new(),
        }
    }

    fn lift(code: &[u8]) -> (Vec<Statement>, Option<Expr>) {
        let lifted = lift_block(&X86Lifter { word_size: 8 }, &block(code), true);
        (lifted.statements, lifted.condition)
    }

    #[test]
    fn frame_setup_is_elided() {
        // push rbp; mov rbp, rsp; xor eax, eax
        let (stmts, _) = lift(&[0x55, 0x48, 0x89, 0xe5, 0x31, 0xc0]);
        assert_eq!(
            stmts,
            vec![Statement::Assign {
                dst: Expr::Reg("eax"),
                src: Expr::Const(0),
            }]
        );
    }

    #[test]
    fn compare_folds_into_branch_condition() {
        // cmp eax, 5; jl +0
        let (stmts, cond) = lift(&[0x83, 0xf8, 0x05, 0x7c, 0x00]);
        assert!(stmts.is_empty());
        assert_eq!(
            cond,
            Some(Expr::compare(CompareOp::Lt, Expr::Reg("eax"), Expr::Const(5)))
        );
    }

    #[test]
    fn load_and_add_fold() {
        // mov eax, dword ptr [rbp - 0x4]; add eax, 1
        let (stmts, _) = lift(&[0x8b, 0x45, 0xfc, 0x83, 0xc0, 0x01]);
        let load = Expr::deref(
            Expr::binary(BinaryOp::Add, Expr::Reg("rbp"), Expr::Const(-4)),
            4,
        );
        assert_eq!(
            stmts,
            vec![Statement::Assign {
                dst: Expr::Reg("eax"),
                src: Expr::binary(BinaryOp::Add, load, Expr::Const(1)),
            }]
        );
    }

    #[test]
    fn write_after_compare_keeps_the_compared_value() {
        // cmp edi, 5; mov edi, 0; jle +0
        let (stmts, cond) = lift(&[0x83, 0xff, 0x05, 0xbf, 0x00, 0x00, 0x00, 0x00, 0x7e, 0x00]);
        assert_eq!(
            stmts,
            vec![
                Statement::Assign {
                    dst: Expr::Reg("flags_lhs"),
                    src: Expr::Reg("edi"),
                },
                Statement::Assign {
                    dst: Expr::Reg("edi"),
                    src: Expr::Const(0),
                },
            ]
        );
        assert_eq!(
            cond,
            Some(Expr::compare(CompareOp::Le, Expr::Reg("flags_lhs"), Expr::Const(5)))
        );
    }

    #[test]
    fn partial_register_write_counts_as_clobber() {
        // test rax, rax; setne al; je +0
        let (stmts, cond) = lift(&[0x48, 0x85, 0xc0, 0x0f, 0x95, 0xc0, 0x74, 0x00]);
        assert_eq!(
            stmts[0],
            Statement::Assign {
                dst: Expr::Reg("flags_lhs"),
                src: Expr::Reg("rax"),
            }
        );
        assert_eq!(
            cond,
            Some(Expr::compare(CompareOp::Eq, Expr::Reg("flags_lhs"), Expr::Const(0)))
        );
    }

    #[test]
    fn flag_setting_write_needs_no_temporary() {
        // cmp eax, 1; add eax, 2; je +0
        let (stmts, cond) = lift(&[0x83, 0xf8, 0x01, 0x83, 0xc0, 0x02, 0x74, 0x00]);
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            cond,
            Some(Expr::compare(CompareOp::Eq, Expr::Reg("eax"), Expr::Const(0)))
        );
    }

    #[test]
    fn decrement_then_branch_on_zero() {
        // dec ecx; jne +0
        let (_, cond) = lift(&[0xff, 0xc9, 0x75, 0x00]);
        assert_eq!(
            cond,
            Some(Expr::compare(CompareOp::Ne, Expr::Reg("ecx"), Expr::Const(0)))
        );
    }

    #[test]
    fn call_and_return() {
        // call 0x1005 (next instruction); ret
        let (stmts, _) = lift(&[0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3]);
        assert_eq!(
            stmts,
            vec![
                Statement::Call {
                    target: Expr::Const(0x1005)
                },
                Statement::Return,
            ]
        );
    }
}
