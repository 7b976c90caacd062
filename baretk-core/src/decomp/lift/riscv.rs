//! RISC-V lifting.
//!
//! Three-operand forms read `rd = rs1 op rs2`. Branches compare registers
//! directly, so no flag state is involved. `zero` reads as the constant 0 and
//! writes to it are discarded.

use super::{address_of, compare_condition, operand_value, Flags, Lifter};
use crate::decoder::{FlowKind, Instruction, Operand, Operation};
use crate::decomp::ast::{BinaryOp, CompareOp, Expr, Lifted, Statement};
use smallvec::smallvec;

#[derive(Debug, Clone, Copy)]
pub struct RiscVLifter {
    /// XLEN in bytes
    pub word_size: u8,
}

fn binary_op(op: Operation) -> Option<BinaryOp> {
    Some(match op {
        Operation::Add => BinaryOp::Add,
        Operation::Sub => BinaryOp::Sub,
        Operation::Mul => BinaryOp::Mul,
        Operation::Div => BinaryOp::Div,
        Operation::DivUnsigned => BinaryOp::DivUnsigned,
        Operation::Rem => BinaryOp::Rem,
        Operation::RemUnsigned => BinaryOp::RemUnsigned,
        Operation::And => BinaryOp::And,
        Operation::Or => BinaryOp::Or,
        Operation::Xor => BinaryOp::Xor,
        Operation::ShiftLeft => BinaryOp::Shl,
        Operation::ShiftRight => BinaryOp::Shr,
        Operation::ShiftRightArith => BinaryOp::Sar,
        _ => return None,
    })
}

/// Register written by `op`, unless it is `zero`.
fn destination(op: Option<&Operand>) -> Option<&'static str> {
    match op {
        Some(Operand::Register(r)) if r.name != "zero" => Some(r.name),
        _ => None,
    }
}

fn register(op: Option<&Operand>) -> Option<&'static str> {
    match op {
        Some(Operand::Register(r)) => Some(r.name),
        _ => None,
    }
}

/// Sign-extended `imm20 << 12`.
fn upper(imm: i64) -> i64 {
    i64::from(((imm as u32) << 12) as i32)
}

impl RiscVLifter {
    fn value(op: &Operand) -> Expr {
        match op {
            Operand::Register(r) if r.name == "zero" => Expr::Const(0),
            Operand::Memory(m) if m.base.is_some_and(|b| b.name == "zero") => {
                Expr::deref(Expr::Const(m.displacement), m.size)
            }
            other => operand_value(other),
        }
    }

    fn value_at(insn: &Instruction, i: usize) -> Option<Expr> {
        insn.operands.get(i).map(Self::value)
    }

    /// `OP-32` results are sign-extended from 32 bits.
    fn narrow(&self, insn: &Instruction, e: Expr) -> Expr {
        if self.word_size == 8 && insn.mnemonic.ends_with('w') {
            Expr::cast(true, 4, 8, e)
        } else {
            e
        }
    }

    fn assign(out: &mut Vec<Statement>, rd: Option<&'static str>, src: Expr) {
        if let Some(rd) = rd {
            out.push(Statement::Assign {
                dst: Expr::Reg(rd),
                src,
            });
        }
    }
}

impl Lifter for RiscVLifter {
    #[inline(never)] // Large function - don't inline
    fn lift(&self, insn: &Instruction, _flags: &mut Flags, out: &mut Vec<Statement>) {
        use Operation as Op;

        let ops = &insn.operands;
        let rd: Option<&'static str> = destination(ops.first());

        match insn.operation {
            Op::Nop => {}
            Op::Move => {
                if let Some(src) = Self::value_at(insn, 1) {
                    Self::assign(out, rd, src);
                }
            }
            Op::LoadUpperImmediate => {
                if let Some(Operand::Immediate(imm)) = ops.get(1) {
                    Self::assign(out, rd, Expr::Const(upper(*imm)));
                }
            }
            Op::AddUpperPc => {
                if let Some(Operand::Immediate(imm)) = ops.get(1) {
                    let value: u64 = insn.address.wrapping_add(upper(*imm) as u64);
                    Self::assign(out, rd, Expr::Const(value as i64));
                }
            }
            Op::Load => {
                if let Some(Operand::Memory(m)) = ops.get(1) {
                    let load: Expr = Self::value(&ops[1]);
                    let src: Expr = if m.size < self.word_size {
                        let signed: bool = !insn.mnemonic.ends_with('u');
                        Expr::cast(signed, m.size, self.word_size, load)
                    } else {
                        load
                    };
                    Self::assign(out, rd, src);
                }
            }
            Op::Store => {
                if let (Some(src), Some(dst)) = (Self::value_at(insn, 0), Self::value_at(insn, 1)) {
                    out.push(Statement::Assign { dst, src });
                }
            }
            Op::SetLess | Op::SetLessUnsigned => {
                if let (Some(a), Some(b)) = (Self::value_at(insn, 1), Self::value_at(insn, 2)) {
                    let op: CompareOp = if insn.operation == Op::SetLess {
                        CompareOp::Lt
                    } else {
                        CompareOp::LtUnsigned
                    };
                    Self::assign(out, rd, Expr::compare(op, a, b));
                }
            }
            Op::Jump => match ops.first() {
                Some(Operand::Address(_)) | None => {}
                Some(Operand::Memory(m)) => out.push(Statement::Intrinsic {
                    name: "jump",
                    args: vec![address_of(m)],
                }),
                Some(other) => out.push(Statement::Intrinsic {
                    name: "jump",
                    args: vec![Self::value(other)],
                }),
            },
            Op::Call => {
                let target: Option<Expr> = match insn.target {
                    Some(t) => Some(Expr::Const(t as i64)),
                    // jalr rd, rs1, imm
                    None => match (Self::value_at(insn, 1), ops.get(2)) {
                        (Some(base), Some(Operand::Immediate(imm))) => {
                            Some(Expr::binary(BinaryOp::Add, base, Expr::Const(*imm)))
                        }
                        (base, _) => base,
                    },
                };
                if let Some(target) = target {
                    out.push(Statement::Call { target });
                }
            }
            Op::Return => out.push(Statement::Return),
            Op::SystemCall | Op::Breakpoint | Op::Halt | Op::Fence => {
                out.push(Statement::Intrinsic {
                    name: insn.mnemonic,
                    args: Vec::new(),
                });
            }
            // mulh* and CSR accesses
            Op::Other => {
                let args: Vec<Expr> = ops.iter().skip(1).map(Self::value).collect();
                match rd {
                    Some(_) => Self::assign(out, rd, Expr::intrinsic(insn.mnemonic, args)),
                    None => out.push(Statement::Intrinsic {
                        name: insn.mnemonic,
                        args,
                    }),
                }
            }
            op => match (binary_op(op), Self::value_at(insn, 1), Self::value_at(insn, 2)) {
                (Some(bin), Some(a), Some(b)) => {
                    let result: Expr = self.narrow(insn, Expr::binary(bin, a, b));
                    Self::assign(out, rd, result);
                }
                _ => {
                    log::debug!("no lifting for {} at 0x{:x}", insn, insn.address);
                    out.push(Statement::Asm(insn.to_string()));
                }
            },
        }
    }

    fn condition(&self, insn: &Instruction, _flags: &Flags) -> Expr {
        let Operation::Branch(cc) = insn.operation else {
            return Expr::intrinsic("unknown_condition", Vec::new());
        };
        let a: Expr = Self::value_at(insn, 0).unwrap_or(Expr::Const(0));
        // beqz / bnez carry a single register before the target.
        let b: Expr = match insn.operands.get(1) {
            Some(Operand::Address(_)) | None => Expr::Const(0),
            Some(op) => Self::value(op),
        };
        compare_condition(cc, a, b)
    }

    fn combine(&self, first: &Instruction, second: &Instruction) -> Option<Lifted> {
        if first.operation != Operation::AddUpperPc {
            return None;
        }
        let scratch: &'static str = register(first.operands.first())?;
        let Some(Operand::Immediate(hi)) = first.operands.get(1) else {
            return None;
        };
        let base: u64 = first.address.wrapping_add(upper(*hi) as u64);

        match (second.operation, second.flow) {
            // auipc t, hi; jalr ra, lo(t)
            (Operation::Call, FlowKind::Call) if second.target.is_none() => {
                if register(second.operands.get(1)) != Some(scratch) {
                    return None;
                }
                let lo: i64 = match second.operands.get(2) {
                    Some(Operand::Immediate(lo)) => *lo,
                    _ => 0,
                };
                let target: u64 = base.wrapping_add(lo as u64);
                Some(smallvec![Statement::Call {
                    target: Expr::Const(target as i64)
                }])
            }
            // auipc t, hi; jr lo(t): tail call
            (Operation::Jump, FlowKind::UnconditionalBranch) if second.target.is_none() => {
                let lo: i64 = match second.operands.first() {
                    Some(Operand::Memory(m)) if m.base.map(|b| b.name) == Some(scratch) => {
                        m.displacement
                    }
                    Some(Operand::Register(r)) if r.name == scratch => 0,
                    _ => return None,
                };
                let target: u64 = base.wrapping_add(lo as u64);
                Some(smallvec![
                    Statement::Call {
                        target: Expr::Const(target as i64)
                    },
                    Statement::Return
                ])
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::riscv::{RiscVDecoder, Xlen};
    use crate::decoder::Decoder;
    use crate::decomp::lift::lift_block;
    use crate::disasm::BasicBlock;
    use crate::loader::Endianness;
    use smallvec::SmallVec;

    fn lift(words: &[u32]) -> (Vec<Statement>, Option<Expr>) {
        let dec = RiscVDecoder::new(Xlen::Rv64);
        let mut insns: Vec<Instruction> = Vec::new();
        let mut addr: u64 = 0x1000;
        for w in words {
            let (insn, len) = dec.decode(&w.to_le_bytes(), addr, Endianness::Little).unwrap();
            insns.push(insn);
            addr += len as u64;
        }
        let block = BasicBlock {
            id: 0,
            start: 0x1000,
            end: addr,
            instructions: insns,
            successors: SmallVec::new(),
            predecessors: SmallVec::new(),
        };
        let lifted = lift_block(&RiscVLifter { word_size: 8 }, &block, true);
        (lifted.statements, lifted.condition)
    }

    #[test]
    fn lui_addi_fold_to_constant() {
        // lui a0, 0x12; addi a0, a0, 0x345
        let (stmts, _) = lift(&[0x0001_2537, 0x3455_0513]);
        assert_eq!(
            stmts,
            vec![Statement::Assign {
                dst: Expr::Reg("a0"),
                src: Expr::Const(0x12345),
            }]
        );
    }

    #[test]
    fn auipc_jalr_is_direct_call() {
        // auipc ra, 0x1; jalr ra, -0x10(ra)
        let (stmts, _) = lift(&[0x0000_1097, 0xff00_80e7]);
        assert_eq!(
            stmts,
            vec![Statement::Call {
                target: Expr::Const(0x1ff0)
            }]
        );
    }

    #[test]
    fn branch_compares_registers() {
        // blt a0, a1, +8
        let (stmts, cond) = lift(&[0x00b5_4463]);
        assert!(stmts.is_empty());
        assert_eq!(
            cond,
            Some(Expr::compare(CompareOp::Lt, Expr::Reg("a0"), Expr::Reg("a1")))
        );
    }

    #[test]
    fn word_ops_sign_extend() {
        // addw a0, a0, a1
        let (stmts, _) = lift(&[0x00b5_053b]);
        assert_eq!(
            stmts,
            vec![Statement::Assign {
                dst: Expr::Reg("a0"),
                src: Expr::cast(
                    true,
                    4,
                    8,
                    Expr::binary(BinaryOp::Add, Expr::Reg("a0"), Expr::Reg("a1"))
                ),
            }]
        );
    }

    #[test]
    fn unsigned_byte_load_zero_extends() {
        // lbu a0, 0(a1)
        let (stmts, _) = lift(&[0x0005_c503]);
        assert_eq!(
            stmts,
            vec![Statement::Assign {
                dst: Expr::Reg("a0"),
                src: Expr::cast(false, 1, 8, Expr::deref(Expr::Reg("a1"), 1)),
            }]
        );
    }
}
